//! Host configuration.
//!
//! Address pairs, bitrate selection and the telemetry endpoints all travel
//! through one explicit value instead of process-wide globals, so several
//! sessions with different address pairs can coexist.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DiagError, DiagResult};
use crate::frame::Bitrate;

/// Default diagnostic source address (the host).
pub const DEFAULT_SA: u8 = 0x0A;
/// Default diagnostic target address (the BMS controller).
pub const DEFAULT_TA: u8 = 0x0B;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagConfig {
    /// 8-bit source address placed in the low byte of the 29-bit id.
    pub source_address: u8,
    /// 8-bit target address of the BMS controller.
    pub target_address: u8,
    /// Adapter channel index handed to the concrete driver.
    pub channel: u32,
    /// Nominal bitrate in kbit/s; must be one of the supported rates.
    pub bitrate_kbps: u32,
    /// Open the channel in CAN-FD mode (2 Mbit/s data phase).
    pub fd: bool,
    /// ECU8TR telemetry peer (UDP).
    pub udp_peer: (Ipv4Addr, u16),
    /// Local UDP endpoint for telemetry replies.
    pub udp_listen: (Ipv4Addr, u16),
}

impl Default for DiagConfig {
    fn default() -> Self {
        Self {
            source_address: DEFAULT_SA,
            target_address: DEFAULT_TA,
            channel: 0,
            bitrate_kbps: 500,
            fd: false,
            udp_peer: (Ipv4Addr::new(192, 168, 1, 10), 8889),
            udp_listen: (Ipv4Addr::new(0, 0, 0, 0), 8888),
        }
    }
}

impl DiagConfig {
    /// Load a configuration from a JSON file. Missing fields fall back to
    /// the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> DiagResult<Self> {
        let raw = fs::read_to_string(path.as_ref())
            .map_err(|e| DiagError::invalid(format!("config read: {}", e)))?;
        let cfg: DiagConfig = serde_json::from_str(&raw)
            .map_err(|e| DiagError::invalid(format!("config parse: {}", e)))?;
        cfg.validated()
    }

    /// Reject unsupported bitrates up front, before the channel is opened.
    pub fn validated(self) -> DiagResult<Self> {
        if Bitrate::from_kbps(self.bitrate_kbps).is_none() {
            return Err(DiagError::invalid(format!(
                "unsupported bitrate {} kbit/s",
                self.bitrate_kbps
            )));
        }
        Ok(self)
    }

    pub fn bitrate(&self) -> Bitrate {
        // validated() guarantees the lookup succeeds
        Bitrate::from_kbps(self.bitrate_kbps).unwrap_or(Bitrate::B500K)
    }
}
