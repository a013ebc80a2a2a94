//! CAN frame model and DoCAN identifier scheme.
//!
//! Physical identifiers are 29-bit extended ids in the SAE J1939 physical
//! addressing form used by ISO 15765-2 normal fixed addressing:
//! `0x18DA_0000 | (TA << 8) | SA`.

use chrono::{DateTime, Utc};

/// Upper 16 bits of the 29-bit identifier (N_TAtype physical, normal fixed
/// addressing).
pub const BASE_ID: u32 = 0x18DA_0000;

/// Hardware acceptance filter for the DoCAN id space.
pub const FILTER_CODE: u32 = 0x18DA_0000;
pub const FILTER_MASK: u32 = 0x1FFF_0000;

/// Padding value for unused payload bytes. 0xCC minimizes stuff-bit
/// insertions on the wire.
pub const PADDING: u8 = 0xCC;

/// Frame flag bits, matching the vendor driver conventions the channel
/// adapter expects.
pub mod flags {
    /// 29-bit extended identifier.
    pub const EXTENDED: u32 = 0x0001;
    /// CAN-FD frame.
    pub const FDF: u32 = 0x0002;
    /// Bit-rate switch in the FD data phase.
    pub const BRS: u32 = 0x0004;
    /// The frame is an error frame.
    pub const ERROR_FRAME: u32 = 0x0100;
    /// Any driver-reported message error.
    pub const MSGERR_MASK: u32 = 0x0200;
}

/// Compose the 29-bit identifier for a (target, source) address pair.
pub fn encode_id(target: u8, source: u8) -> u32 {
    BASE_ID | ((target as u32) << 8) | source as u32
}

/// Target Address byte of an identifier. The receive demultiplexer routes
/// on this field.
pub fn target_of(id: u32) -> u8 {
    ((id >> 8) & 0xFF) as u8
}

/// Source Address byte of an identifier.
pub fn source_of(id: u32) -> u8 {
    (id & 0xFF) as u8
}

/// A single CAN frame as exchanged with the channel adapter.
#[derive(Debug, Clone)]
pub struct CanFrame {
    pub id: u32,
    pub data: Vec<u8>,
    pub flags: u32,
    /// Stamped by the receive loop; `None` on outbound frames.
    pub timestamp: Option<DateTime<Utc>>,
}

impl CanFrame {
    /// Build an outbound frame. Flags carry the extended-id bit and, for
    /// FD channels, FDF + BRS (the BMS controller firmware uses long and
    /// fast frames).
    pub fn new(id: u32, data: Vec<u8>, fd: bool) -> Self {
        let mut frame_flags = flags::EXTENDED;
        if fd {
            frame_flags |= flags::FDF | flags::BRS;
        }
        Self {
            id,
            data,
            flags: frame_flags,
            timestamp: None,
        }
    }

    /// True when the driver flagged this frame as an error.
    pub fn is_error(&self) -> bool {
        self.flags & (flags::ERROR_FRAME | flags::MSGERR_MASK) != 0
    }
}

/// Supported nominal bitrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitrate {
    B1M,
    B500K,
    B250K,
    B125K,
    B100K,
    B83K,
    B62K,
    B50K,
    B10K,
}

impl Bitrate {
    pub fn bps(self) -> u32 {
        match self {
            Bitrate::B1M => 1_000_000,
            Bitrate::B500K => 500_000,
            Bitrate::B250K => 250_000,
            Bitrate::B125K => 125_000,
            Bitrate::B100K => 100_000,
            Bitrate::B83K => 83_333,
            Bitrate::B62K => 62_500,
            Bitrate::B50K => 50_000,
            Bitrate::B10K => 10_000,
        }
    }

    pub fn from_kbps(kbps: u32) -> Option<Self> {
        match kbps {
            1000 => Some(Bitrate::B1M),
            500 => Some(Bitrate::B500K),
            250 => Some(Bitrate::B250K),
            125 => Some(Bitrate::B125K),
            100 => Some(Bitrate::B100K),
            83 => Some(Bitrate::B83K),
            62 => Some(Bitrate::B62K),
            50 => Some(Bitrate::B50K),
            10 => Some(Bitrate::B10K),
            _ => None,
        }
    }
}

/// Bit timing segments for one phase.
///
/// Values mirror the AURIX TC3xx node configuration the BMS controller
/// firmware runs: 500 kbit/s nominal at an 80% sample point and a
/// 2 Mbit/s FD data phase.
#[derive(Debug, Clone, Copy)]
pub struct BusTiming {
    pub tseg1: u8,
    pub tseg2: u8,
    pub sjw: u8,
}

impl BusTiming {
    /// NTSEG1=15, NTSEG2=4, SJW=1 (sample point 80%).
    pub const NOMINAL: BusTiming = BusTiming {
        tseg1: 15,
        tseg2: 4,
        sjw: 1,
    };

    /// DTSEG1=15, DTSEG2=4, DSJW=1 for the FD data phase.
    pub const DATA_PHASE: BusTiming = BusTiming {
        tseg1: 15,
        tseg2: 4,
        sjw: 1,
    };
}

/// Everything a concrete driver needs to bring a channel up.
#[derive(Debug, Clone, Copy)]
pub struct BusParams {
    pub bitrate: Bitrate,
    pub fd: bool,
    pub nominal: BusTiming,
    /// Data-phase rate for FD channels, fixed at 2 Mbit/s.
    pub data_bps: u32,
    pub data: BusTiming,
}

impl BusParams {
    pub fn classic(bitrate: Bitrate) -> Self {
        Self {
            bitrate,
            fd: false,
            nominal: BusTiming::NOMINAL,
            data_bps: 2_000_000,
            data: BusTiming::DATA_PHASE,
        }
    }

    pub fn fd(bitrate: Bitrate) -> Self {
        Self {
            fd: true,
            ..Self::classic(bitrate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_round_trip() {
        let id = encode_id(0x0B, 0x0A);
        assert_eq!(id, 0x18DA_0B0A);
        assert_eq!(target_of(id), 0x0B);
        assert_eq!(source_of(id), 0x0A);
    }

    #[test]
    fn test_fd_frame_flags() {
        let frame = CanFrame::new(0x18DA_0B0A, vec![0x00], true);
        assert_ne!(frame.flags & flags::FDF, 0);
        assert_ne!(frame.flags & flags::BRS, 0);
        assert_ne!(frame.flags & flags::EXTENDED, 0);

        let classic = CanFrame::new(0x18DA_0B0A, vec![0x00], false);
        assert_eq!(classic.flags, flags::EXTENDED);
    }

    #[test]
    fn test_bitrate_lookup() {
        assert_eq!(Bitrate::from_kbps(500), Some(Bitrate::B500K));
        assert_eq!(Bitrate::from_kbps(83), Some(Bitrate::B83K));
        assert_eq!(Bitrate::from_kbps(7), None);
        assert_eq!(Bitrate::B62K.bps(), 62_500);
    }
}
