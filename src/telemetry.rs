//! ECU8TR telemetry control link.
//!
//! The streaming module is driven by short UDP datagrams, not DoCAN: one
//! message-id pair selects the module connection, another the measurement
//! stream, with an enable flag selecting on/off. The payload is always 8
//! bytes. Stream data itself arrives on the listen socket and is consumed
//! by a separate dispatcher outside this crate.

use std::net::{SocketAddrV4, UdpSocket};

use tracing::{debug, info};

use crate::config::DiagConfig;
use crate::error::{DiagError, DiagResult};

/// Message id for module connect/disconnect.
pub const MSG_CONNECT: [u8; 2] = [0x12, 0x01];
/// Message id for stream start/stop.
pub const MSG_STREAM: [u8; 2] = [0x12, 0x02];

pub struct Ecu8trLink {
    socket: UdpSocket,
    peer: SocketAddrV4,
}

impl Ecu8trLink {
    pub fn new(cfg: &DiagConfig) -> DiagResult<Self> {
        let listen = SocketAddrV4::new(cfg.udp_listen.0, cfg.udp_listen.1);
        let socket = UdpSocket::bind(listen)
            .map_err(|e| DiagError::ChannelIo(format!("udp bind {}: {}", listen, e)))?;
        Ok(Self {
            socket,
            peer: SocketAddrV4::new(cfg.udp_peer.0, cfg.udp_peer.1),
        })
    }

    fn send_control(&self, msg_id: [u8; 2], enable: bool) -> DiagResult<()> {
        let flag = enable as u8;
        let datagram = [msg_id[0], msg_id[1], flag, flag, 0, 0, 0, 0];
        debug!("udp {} <- {:02X?}", self.peer, datagram);
        self.socket
            .send_to(&datagram, self.peer)
            .map_err(|e| DiagError::ChannelIo(format!("udp send: {}", e)))?;
        Ok(())
    }

    /// Connect the module front-ends.
    pub fn connect(&self) -> DiagResult<()> {
        info!("connecting to battery module at {}", self.peer);
        self.send_control(MSG_CONNECT, true)
    }

    pub fn disconnect(&self) -> DiagResult<()> {
        info!("disconnecting from battery module at {}", self.peer);
        self.send_control(MSG_CONNECT, false)
    }

    /// Start streaming measurement datagrams to the listen socket.
    pub fn start_stream(&self) -> DiagResult<()> {
        info!("starting measurement stream");
        self.send_control(MSG_STREAM, true)
    }

    pub fn stop_stream(&self) -> DiagResult<()> {
        info!("stopping measurement stream");
        self.send_control(MSG_STREAM, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn local_pair() -> (Ecu8trLink, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let peer_port = peer.local_addr().unwrap().port();
        let cfg = DiagConfig {
            udp_peer: (Ipv4Addr::LOCALHOST, peer_port),
            udp_listen: (Ipv4Addr::LOCALHOST, 0),
            ..Default::default()
        };
        (Ecu8trLink::new(&cfg).unwrap(), peer)
    }

    #[test]
    fn test_connect_datagram_layout() {
        let (link, peer) = local_pair();
        link.connect().unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x12, 0x01, 0x01, 0x01, 0, 0, 0, 0]);
    }

    #[test]
    fn test_stream_stop_datagram_layout() {
        let (link, peer) = local_pair();
        link.stop_stream().unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x12, 0x02, 0x00, 0x00, 0, 0, 0, 0]);
    }
}
