//! ISO 15765-2 network layer framing.
//!
//! Packetization of a UDS payload into Single/First/Consecutive frames for
//! both CAN Classic and CAN-FD, and the receive-side state machine that
//! reassembles segmented messages under Flow Control.
//!
//! Network protocol control information (N_PCI), upper nibble of byte 0:
//!
//! | Frame        | byte 0 (7-4) | byte 0 (3-0) | byte 1       | byte 2+    |
//! |--------------|--------------|--------------|--------------|------------|
//! | Single       | 0            | size (1-7)   | data         | data       |
//! | Single (FD)  | 0            | 0            | size (1-62)  | data       |
//! | First (<4K)  | 1            | size, 12 bits split over bytes 0-1 | data |
//! | First (>4K)  | 1            | 0            | 0            | size, bytes 2-5 |
//! | Consecutive  | 2            | index (0-15) | data         | data       |
//! | Flow Ctrl    | 3            | flag (0-2)   | BlockSize    | STmin      |
//!
//! Unused data bytes are padded with 0xCC.

use tracing::debug;

use crate::error::{DiagError, DiagResult};
use crate::frame::PADDING;

/// Receive state. `Idle` is the only legal initial state and the re-entry
/// state after `Done`, `Overflow` or any protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Idle,
    /// First frame of a segmented message consumed; caller must answer
    /// with a flow control frame.
    First,
    /// Mid-reassembly, more consecutive frames expected.
    Consecutive,
    /// A complete message has been delivered.
    Done,
    /// The sender asked us to wait for its next flow control.
    Wait,
    /// The remote end reported a receive overflow.
    Overflow,
}

/// Flow control status parsed from an FC frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcStatus {
    /// ContinueToSend, carrying the STmin byte.
    ContinueToSend(u8),
    /// Wait for the next FC issued by the target.
    Wait,
    /// Target receive overflow; abort the transmission.
    Overflow,
}

/// Quantize a byte count to the smallest valid CAN-FD frame length.
pub fn fd_frame_len(len: usize) -> usize {
    match len {
        0..=8 => len,
        9..=12 => 12,
        13..=16 => 16,
        17..=20 => 20,
        21..=24 => 24,
        25..=32 => 32,
        33..=48 => 48,
        _ => 64,
    }
}

/// The flow control frame this host answers a first frame with:
/// ContinueToSend, no BlockSize restriction, STmin = 2 ms.
pub fn flow_control_frame() -> Vec<u8> {
    vec![0x30, 0x00, 0x02, PADDING, PADDING, PADDING, PADDING, PADDING]
}

/// Parse a flow control frame received while transmitting.
pub fn parse_flow_control(data: &[u8]) -> DiagResult<FcStatus> {
    if data.len() < 3 || data[0] & 0xF0 != 0x30 {
        return Err(DiagError::protocol("invalid FC PCI"));
    }
    match data[0] & 0x0F {
        0 => Ok(FcStatus::ContinueToSend(data[2])),
        1 => Ok(FcStatus::Wait),
        2 => Ok(FcStatus::Overflow),
        flag => Err(DiagError::protocol(format!("FC flag {}", flag))),
    }
}

/// Split a payload into the ordered CAN frames that carry it.
///
/// Classic frames are always 8 bytes; FD frames are quantized to the valid
/// CAN-FD lengths. Payloads longer than 4095 bytes use the extended-length
/// first frame form, which carries no payload of its own.
pub fn packetize(payload: &[u8], fd: bool) -> DiagResult<Vec<Vec<u8>>> {
    if payload.is_empty() {
        // A UDS request is never empty, and a zero-length SF encoding is
        // ambiguous with the FD SF escape byte.
        return Err(DiagError::protocol("empty payload"));
    }
    if fd {
        packetize_fd(payload)
    } else {
        packetize_classic(payload)
    }
}

fn packetize_classic(payload: &[u8]) -> DiagResult<Vec<Vec<u8>>> {
    let total = payload.len();
    let mut frames = Vec::new();

    if total <= 7 {
        let mut sf = vec![PADDING; 8];
        sf[0] = total as u8;
        sf[1..total + 1].copy_from_slice(payload);
        frames.push(sf);
        return Ok(frames);
    }

    let mut rest = payload;
    let mut ff = vec![PADDING; 8];
    if total > 4095 {
        // Extended length in bytes 2-5, no payload in the FF itself
        ff[0] = 0x10;
        ff[1] = 0;
        ff[2..6].copy_from_slice(&(total as u32).to_be_bytes());
    } else {
        ff[0] = 0x10 | ((total >> 8) & 0x0F) as u8;
        ff[1] = (total & 0xFF) as u8;
        ff[2..8].copy_from_slice(&rest[..6]);
        rest = &rest[6..];
    }
    frames.push(ff);

    let mut index: u8 = 1;
    while !rest.is_empty() {
        let take = rest.len().min(7);
        let mut cf = vec![PADDING; 8];
        cf[0] = 0x20 | (index % 16);
        cf[1..take + 1].copy_from_slice(&rest[..take]);
        index = index.wrapping_add(1);
        rest = &rest[take..];
        frames.push(cf);
    }

    Ok(frames)
}

fn packetize_fd(payload: &[u8]) -> DiagResult<Vec<Vec<u8>>> {
    let total = payload.len();
    let mut frames = Vec::new();

    if total <= 62 {
        let mut sf = vec![PADDING; fd_frame_len(total + 2)];
        sf[0] = 0;
        sf[1] = total as u8;
        sf[2..total + 2].copy_from_slice(payload);
        frames.push(sf);
        return Ok(frames);
    }

    let mut rest = payload;
    if total > 4095 {
        let mut ff = vec![PADDING; 8];
        ff[0] = 0x10;
        ff[1] = 0;
        ff[2..6].copy_from_slice(&(total as u32).to_be_bytes());
        frames.push(ff);
    } else {
        let mut ff = vec![0u8; 64];
        ff[0] = 0x10 | ((total >> 8) & 0x0F) as u8;
        ff[1] = (total & 0xFF) as u8;
        ff[2..64].copy_from_slice(&rest[..62]);
        rest = &rest[62..];
        frames.push(ff);
    }

    let mut index: u8 = 1;
    while !rest.is_empty() {
        let frame_len = fd_frame_len(rest.len() + 1);
        let take = rest.len().min(frame_len - 1);
        let mut cf = vec![PADDING; frame_len];
        cf[0] = 0x20 | (index % 16);
        cf[1..take + 1].copy_from_slice(&rest[..take]);
        index = index.wrapping_add(1);
        rest = &rest[take..];
        frames.push(cf);
    }

    Ok(frames)
}

/// Receive-side reassembly state machine.
///
/// Feed each inbound frame payload to [`absorb`](Reassembler::absorb); the
/// returned state tells the caller what happened and the returned bytes are
/// the payload fragment to append. After `Done`, `Overflow` or an error the
/// machine has already returned to `Idle`.
#[derive(Debug)]
pub struct Reassembler {
    state: RxState,
    /// Expected index of the next consecutive frame, modulo 16.
    cf_index: u8,
    /// Bytes of the segmented payload still outstanding after the FF.
    remaining: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            state: RxState::Idle,
            cf_index: 0,
            remaining: 0,
        }
    }

    pub fn reset(&mut self) {
        self.state = RxState::Idle;
        self.cf_index = 0;
        self.remaining = 0;
    }

    fn fail(&mut self, msg: impl Into<String>) -> DiagError {
        self.reset();
        DiagError::Protocol(msg.into())
    }

    pub fn absorb(&mut self, data: &[u8]) -> DiagResult<(RxState, Vec<u8>)> {
        if data.is_empty() {
            return Err(self.fail("rx frame with no data"));
        }
        let pci = data[0] & 0xF0;
        match self.state {
            RxState::Idle => self.absorb_idle(pci, data),
            _ => self.absorb_segmented(pci, data),
        }
    }

    fn absorb_idle(&mut self, pci: u8, data: &[u8]) -> DiagResult<(RxState, Vec<u8>)> {
        match pci {
            0x00 => {
                if data[0] == 0 {
                    // FD single frame: length escape in byte 1
                    let size = data[1] as usize;
                    if size == 0 || size > 62 {
                        return Err(self.fail(format!("SF fd size {}", size)));
                    }
                    if size + 2 > data.len() {
                        return Err(self.fail("SF fd dlc"));
                    }
                    Ok((RxState::Done, data[2..size + 2].to_vec()))
                } else {
                    let size = data[0] as usize;
                    if size > 7 {
                        return Err(self.fail(format!("SF classic size {}", size)));
                    }
                    if size + 1 > data.len() {
                        return Err(self.fail("SF classic dlc"));
                    }
                    Ok((RxState::Done, data[1..size + 1].to_vec()))
                }
            }
            0x10 => {
                if data.len() < 2 {
                    return Err(self.fail("FF dlc"));
                }
                self.cf_index = 1;
                if data[0] == 0x10 && data[1] == 0 {
                    // Extended length form, >= 4 KiB
                    if data.len() < 6 {
                        return Err(self.fail("FF ext dlc"));
                    }
                    self.remaining =
                        u32::from_be_bytes([data[2], data[3], data[4], data[5]]) as usize;
                    debug!("segmented rx, extended length {}", self.remaining);
                    self.state = RxState::First;
                    Ok((RxState::First, Vec::new()))
                } else {
                    let declared = (((data[0] & 0x0F) as usize) << 8) + data[1] as usize;
                    if declared < data.len() - 2 {
                        return Err(self.fail("FF invalid length"));
                    }
                    self.remaining = declared - (data.len() - 2);
                    self.state = RxState::First;
                    Ok((RxState::First, data[2..].to_vec()))
                }
            }
            0x30 => match data[0] & 0x0F {
                1 => Ok((RxState::Wait, Vec::new())),
                2 => {
                    self.reset();
                    Ok((RxState::Overflow, Vec::new()))
                }
                // ContinueToSend outside a transmission carries nothing
                // for the receive side
                _ => Ok((RxState::Idle, Vec::new())),
            },
            _ => Err(self.fail(format!("invalid PCI 0x{:02X} in IDLE", pci))),
        }
    }

    fn absorb_segmented(&mut self, pci: u8, data: &[u8]) -> DiagResult<(RxState, Vec<u8>)> {
        match pci {
            0x20 => {
                let index = data[0] & 0x0F;
                if index != self.cf_index % 16 {
                    return Err(self.fail(format!(
                        "CF index {} (expected {})",
                        index,
                        self.cf_index % 16
                    )));
                }
                self.cf_index = self.cf_index.wrapping_add(1);
                if self.remaining > data.len() - 1 {
                    self.remaining -= data.len() - 1;
                    self.state = RxState::Consecutive;
                    Ok((RxState::Consecutive, data[1..].to_vec()))
                } else {
                    let take = self.remaining;
                    self.reset();
                    Ok((RxState::Done, data[1..take + 1].to_vec()))
                }
            }
            0x30 => match data[0] & 0x0F {
                1 => Ok((RxState::Wait, Vec::new())),
                2 => {
                    self.reset();
                    Ok((RxState::Overflow, Vec::new()))
                }
                // A stray CTS mid-reassembly adds nothing
                _ => Ok((RxState::Consecutive, Vec::new())),
            },
            _ => Err(self.fail(format!("invalid PCI 0x{:02X} in CF", pci))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut machine = Reassembler::new();
        let mut out = Vec::new();
        for frame in frames {
            let (state, chunk) = machine.absorb(frame).unwrap();
            out.extend_from_slice(&chunk);
            if state == RxState::Done {
                return out;
            }
        }
        panic!("stream ended before DONE");
    }

    #[test]
    fn test_classic_single_frame_layout() {
        let frames = packetize(&[0x2F, 0xE1, 0x00, 0x03], false).unwrap();
        assert_eq!(
            frames,
            vec![vec![0x04, 0x2F, 0xE1, 0x00, 0x03, 0xCC, 0xCC, 0xCC]]
        );
    }

    #[test]
    fn test_classic_segmented_layout() {
        // 24-byte request: FF with 6 bytes then CFs 0x21, 0x22, 0x23
        let payload: Vec<u8> = (0..24).collect();
        let frames = packetize(&payload, false).unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0][0], 0x10);
        assert_eq!(frames[0][1], 24);
        assert_eq!(&frames[0][2..8], &payload[..6]);
        assert_eq!(frames[1][0], 0x21);
        assert_eq!(frames[2][0], 0x22);
        assert_eq!(frames[3][0], 0x23);
        // Last CF carries 4 payload bytes then padding
        assert_eq!(&frames[3][1..5], &payload[20..24]);
        assert_eq!(&frames[3][5..], &[0xCC, 0xCC, 0xCC]);
    }

    #[test]
    fn test_classic_frames_are_always_eight_bytes() {
        for len in [1usize, 7, 8, 62, 200, 4095] {
            let payload = vec![0xA5; len];
            for frame in packetize(&payload, false).unwrap() {
                assert_eq!(frame.len(), 8, "payload len {}", len);
            }
        }
    }

    #[test]
    fn test_classic_round_trip() {
        for len in (1usize..=64).chain([65, 100, 1000, 4095]) {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frames = packetize(&payload, false).unwrap();
            assert_eq!(reassemble(&frames), payload, "len {}", len);
        }
    }

    #[test]
    fn test_classic_extended_length_round_trip() {
        let payload: Vec<u8> = (0..5000usize).map(|i| (i % 253) as u8).collect();
        let frames = packetize(&payload, false).unwrap();
        // Extended FF carries the 32-bit length and no payload
        assert_eq!(&frames[0][..6], &[0x10, 0x00, 0x00, 0x00, 0x13, 0x88]);
        assert_eq!(frames[1][0], 0x21);
        assert_eq!(reassemble(&frames), payload);
    }

    #[test]
    fn test_cf_index_wraps_mod_16() {
        // 6 + 17 * 7 = 125 bytes: indices run 1..=15, 0, 1, 2
        let payload = vec![0x11; 125];
        let frames = packetize(&payload, false).unwrap();
        let indices: Vec<u8> = frames[1..].iter().map(|f| f[0] & 0x0F).collect();
        let expected: Vec<u8> = (1..=17).map(|i| (i % 16) as u8).collect();
        assert_eq!(indices, expected);
        assert_eq!(reassemble(&frames), payload);
    }

    #[test]
    fn test_fd_single_frame_round_trip() {
        for len in 1usize..=62 {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let frames = packetize(&payload, true).unwrap();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0][0], 0);
            assert_eq!(frames[0][1] as usize, len);
            assert_eq!(frames[0].len(), fd_frame_len(len + 2));
            assert_eq!(reassemble(&frames), payload);
        }
    }

    #[test]
    fn test_fd_frame_length_quantization() {
        assert_eq!(fd_frame_len(3), 3);
        assert_eq!(fd_frame_len(8), 8);
        assert_eq!(fd_frame_len(9), 12);
        assert_eq!(fd_frame_len(13), 16);
        assert_eq!(fd_frame_len(21), 24);
        assert_eq!(fd_frame_len(25), 32);
        assert_eq!(fd_frame_len(33), 48);
        assert_eq!(fd_frame_len(49), 64);
        assert_eq!(fd_frame_len(200), 64);
    }

    #[test]
    fn test_fd_segmented_round_trip() {
        for len in [63usize, 64, 200, 1000, 4095] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 249) as u8).collect();
            let frames = packetize(&payload, true).unwrap();
            assert_eq!(frames[0].len(), 64);
            for frame in &frames {
                let valid = matches!(frame.len(), 1..=8 | 12 | 16 | 20 | 24 | 32 | 48 | 64);
                assert!(valid, "invalid FD frame length {}", frame.len());
            }
            assert_eq!(reassemble(&frames), payload, "len {}", len);
        }
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(packetize(&[], false).is_err());
        assert!(packetize(&[], true).is_err());
    }

    #[test]
    fn test_single_frame_length_violations() {
        let mut machine = Reassembler::new();
        // Classic SF claiming 8 bytes
        assert!(machine.absorb(&[0x08, 0, 0, 0, 0, 0, 0, 0]).is_err());
        // FD SF claiming 63 bytes
        assert!(machine.absorb(&[0x00, 63, 0, 0, 0, 0, 0, 0]).is_err());
        // Classic SF longer than the frame
        assert!(machine.absorb(&[0x05, 1, 2]).is_err());
    }

    #[test]
    fn test_ff_shorter_than_declared_is_invalid() {
        let mut machine = Reassembler::new();
        // Declares 3 bytes total but the FF alone already carries 6
        assert!(machine.absorb(&[0x10, 0x03, 1, 2, 3, 4, 5, 6]).is_err());
    }

    #[test]
    fn test_cf_index_mismatch_resets_to_idle() {
        let mut machine = Reassembler::new();
        let (state, _) = machine
            .absorb(&[0x10, 0x0C, 0x6F, 0xE1, 0x01, 0x03, 0x00, 0x01])
            .unwrap();
        assert_eq!(state, RxState::First);
        // Index 2 where 1 is expected
        assert!(machine.absorb(&[0x22, 2, 3, 4, 5, 6, 7, 8]).is_err());
        // Machine is back in IDLE: a single frame parses cleanly
        let (state, data) = machine
            .absorb(&[0x02, 0xAA, 0xBB, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC])
            .unwrap();
        assert_eq!(state, RxState::Done);
        assert_eq!(data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_cf_before_ff_is_invalid() {
        let mut machine = Reassembler::new();
        assert!(machine.absorb(&[0x21, 1, 2, 3, 4, 5, 6, 7]).is_err());
    }

    #[test]
    fn test_flow_control_states() {
        let mut machine = Reassembler::new();
        let (state, _) = machine.absorb(&[0x31, 0, 0]).unwrap();
        assert_eq!(state, RxState::Wait);
        let (state, _) = machine.absorb(&[0x32, 0, 0]).unwrap();
        assert_eq!(state, RxState::Overflow);
        let (state, _) = machine.absorb(&[0x30, 0, 2]).unwrap();
        assert_eq!(state, RxState::Idle);
    }

    #[test]
    fn test_overflow_mid_reassembly_aborts() {
        let mut machine = Reassembler::new();
        machine
            .absorb(&[0x10, 0x0C, 0x6F, 0xE1, 0x01, 0x03, 0x00, 0x01])
            .unwrap();
        let (state, _) = machine.absorb(&[0x32, 0, 0]).unwrap();
        assert_eq!(state, RxState::Overflow);
        // Idle again
        let (state, _) = machine
            .absorb(&[0x01, 0x55, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC])
            .unwrap();
        assert_eq!(state, RxState::Done);
    }

    #[test]
    fn test_parse_flow_control() {
        assert_eq!(
            parse_flow_control(&[0x30, 0x00, 0x02, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]).unwrap(),
            FcStatus::ContinueToSend(2)
        );
        assert_eq!(
            parse_flow_control(&[0x31, 0, 0]).unwrap(),
            FcStatus::Wait
        );
        assert_eq!(
            parse_flow_control(&[0x32, 0, 0]).unwrap(),
            FcStatus::Overflow
        );
        assert!(parse_flow_control(&[0x20, 0, 0]).is_err());
        assert!(parse_flow_control(&[0x33, 0, 0]).is_err());
    }

    #[test]
    fn test_flow_control_frame_layout() {
        assert_eq!(
            flow_control_frame(),
            vec![0x30, 0x00, 0x02, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]
        );
    }
}
