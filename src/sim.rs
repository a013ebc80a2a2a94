//! In-process CAN bus simulator.
//!
//! Stands in for the vendor driver behind [`CanBus`]: a responder closure
//! sees every fully reassembled request payload and yields the response
//! payload, which the simulator packetizes with the crate's own framing.
//! Flow control is emulated on both sides: the simulated target answers a
//! host first frame with ContinueToSend, and holds the consecutive frames
//! of a segmented response until the host's flow control arrives.
//!
//! Used by the smoke binary and the end-to-end tests; real deployments
//! plug a hardware driver into the same trait.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::channel::CanBus;
use crate::config::DiagConfig;
use crate::error::DiagResult;
use crate::frame::{self, CanFrame, PADDING};
use crate::isotp::{self, Reassembler, RxState};

/// Maps a reassembled request payload to an optional response payload.
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

struct SimState {
    /// Frames waiting for the host's read loop.
    inbound: VecDeque<CanFrame>,
    /// Every frame the host wrote, in order.
    tx_log: Vec<CanFrame>,
    /// Consecutive frames of a segmented response, held until the host
    /// answers the first frame with flow control.
    held_cfs: VecDeque<Vec<u8>>,
    /// Target-side reassembly of the host's request.
    assembler: Reassembler,
    request: Vec<u8>,
    responder: Responder,
}

pub struct SimBus {
    fd: bool,
    /// Identifier responses are sent from: the target addressing us.
    reply_id: u32,
    state: Mutex<SimState>,
    wakeup: Condvar,
}

impl SimBus {
    pub fn new(cfg: &DiagConfig, responder: Responder) -> Self {
        Self {
            fd: cfg.fd,
            reply_id: frame::encode_id(cfg.source_address, cfg.target_address),
            state: Mutex::new(SimState {
                inbound: VecDeque::new(),
                tx_log: Vec::new(),
                held_cfs: VecDeque::new(),
                assembler: Reassembler::new(),
                request: Vec::new(),
                responder,
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Generic echo target: positive response with the service header
    /// echoed. IOCBI responses echo the option record as the status
    /// record; RoutineControl responses carry a zero routineInfo byte.
    pub fn echo_responder() -> Responder {
        Box::new(|request| {
            let sid = *request.first()?;
            match sid {
                0x2F if request.len() >= 4 => {
                    let mut resp = vec![0x6F, request[1], request[2], request[3]];
                    resp.extend_from_slice(&request[4..]);
                    Some(resp)
                }
                0x31 if request.len() >= 4 => {
                    Some(vec![0x71, request[1], request[2], request[3], 0x00])
                }
                _ => Some(vec![0x7F, sid, 0x11]),
            }
        })
    }

    /// Every frame the host has written so far.
    pub fn written(&self) -> Vec<CanFrame> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tx_log
            .clone()
    }

    pub fn written_data(&self) -> Vec<Vec<u8>> {
        self.written().into_iter().map(|f| f.data).collect()
    }

    pub fn clear_log(&self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tx_log
            .clear();
    }

    /// Push a raw frame into the host's receive path, bypassing the
    /// responder. Tests use this for malformed traffic and error frames.
    pub fn inject(&self, frame: CanFrame) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.inbound.push_back(frame);
        self.wakeup.notify_all();
    }

    fn queue_response(&self, state: &mut SimState, payload: Vec<u8>) {
        let frames = match isotp::packetize(&payload, self.fd) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("sim response packetize failed: {}", e);
                return;
            }
        };
        let mut frames = frames.into_iter();
        if let Some(first) = frames.next() {
            state.inbound.push_back(CanFrame::new(self.reply_id, first, self.fd));
        }
        // Remaining CFs wait for the host's flow control
        state.held_cfs = frames.collect();
        self.wakeup.notify_all();
    }

    fn handle_host_frame(&self, state: &mut SimState, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if data[0] & 0xF0 == 0x30 {
            // Host flow control: release the held response tail
            if data[0] & 0x0F == 0 {
                let held: Vec<Vec<u8>> = state.held_cfs.drain(..).collect();
                for cf in held {
                    state.inbound.push_back(CanFrame::new(self.reply_id, cf, self.fd));
                }
                self.wakeup.notify_all();
            }
            return;
        }

        match state.assembler.absorb(data) {
            Ok((RxState::Done, chunk)) => {
                state.request.extend_from_slice(&chunk);
                let request = std::mem::take(&mut state.request);
                debug!("sim target request: {:02X?}", request);
                if let Some(response) = (state.responder)(&request) {
                    self.queue_response(state, response);
                }
            }
            Ok((RxState::First, chunk)) => {
                state.request.extend_from_slice(&chunk);
                // Answer the host's FF with ContinueToSend
                let fc = vec![0x30, 0x00, 0x02, PADDING, PADDING, PADDING, PADDING, PADDING];
                state.inbound.push_back(CanFrame::new(self.reply_id, fc, self.fd));
                self.wakeup.notify_all();
            }
            Ok((RxState::Consecutive, chunk)) => {
                state.request.extend_from_slice(&chunk);
            }
            Ok((_, _)) => {}
            Err(e) => {
                warn!("sim target reassembly error: {}", e);
                state.request.clear();
            }
        }
    }
}

impl CanBus for SimBus {
    fn is_fd(&self) -> bool {
        self.fd
    }

    fn read(&self, timeout_ms: u32) -> DiagResult<Option<CanFrame>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(frame) = state.inbound.pop_front() {
                return Ok(Some(frame));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (next, _) = self
                .wakeup
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
        }
    }

    fn write(&self, frame: &CanFrame, _timeout_ms: u32) -> DiagResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.tx_log.push(frame.clone());
        let data = frame.data.clone();
        self.handle_host_frame(&mut state, &data);
        Ok(())
    }

    fn set_acceptance_filter(&self, _code: u32, _mask: u32) -> DiagResult<()> {
        Ok(())
    }

    fn flush(&self) -> DiagResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.inbound.clear();
        state.held_cfs.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_host(bus: &SimBus, data: Vec<u8>) {
        let frame = CanFrame::new(frame::encode_id(0x0B, 0x0A), data, false);
        bus.write(&frame, 100).unwrap();
    }

    #[test]
    fn test_single_frame_echo() {
        let bus = SimBus::new(&DiagConfig::default(), SimBus::echo_responder());
        write_host(&bus, vec![0x04, 0x2F, 0xE1, 0x00, 0x03, 0xCC, 0xCC, 0xCC]);

        let reply = bus.read(100).unwrap().unwrap();
        assert_eq!(reply.id, 0x18DA_0A0B);
        assert_eq!(&reply.data[..5], &[0x04, 0x6F, 0xE1, 0x00, 0x03]);
    }

    #[test]
    fn test_host_ff_answered_with_fc() {
        let bus = SimBus::new(&DiagConfig::default(), SimBus::echo_responder());
        write_host(&bus, vec![0x10, 0x0A, 0x2F, 0x00, 0x02, 0x03, 0x00, 0x01]);

        let fc = bus.read(100).unwrap().unwrap();
        assert_eq!(fc.data[0], 0x30);
        assert_eq!(fc.data[1], 0x00);
    }

    #[test]
    fn test_segmented_response_held_until_fc() {
        // Responder returns 12 bytes: FF immediately, CF only after our FC
        let bus = SimBus::new(
            &DiagConfig::default(),
            Box::new(|_req| Some(vec![0x6F, 0xE1, 0x01, 0x03, 0, 1, 2, 3, 4, 5, 6, 7])),
        );
        write_host(&bus, vec![0x04, 0x2F, 0xE1, 0x01, 0x03, 0xCC, 0xCC, 0xCC]);

        let ff = bus.read(100).unwrap().unwrap();
        assert_eq!(ff.data[0], 0x10);
        assert!(bus.read(10).unwrap().is_none(), "CF must wait for FC");

        write_host(&bus, isotp::flow_control_frame());
        let cf = bus.read(100).unwrap().unwrap();
        assert_eq!(cf.data[0], 0x21);
    }
}
