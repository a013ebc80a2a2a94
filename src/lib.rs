//! BMS diagnostic host core.
//!
//! A UDS (ISO 14229-1) client talking to a battery-management controller
//! over DoCAN (ISO 15765-2) with 29-bit identifiers, plus the command
//! abstraction built on top of it:
//!
//! - [`channel`]: CAN channel adapter and receive demultiplexer; vendor
//!   hardware plugs in behind the [`channel::CanBus`] trait.
//! - [`isotp`]: Single/First/Consecutive/Flow-Control framing for CAN
//!   Classic and CAN-FD, and the receive-side reassembly state machine.
//! - [`transport`]: per-session command execution, synchronous or through
//!   a bounded tx worker queue.
//! - [`uds`]: IOCBI and RoutineControl command objects with validation
//!   and response callbacks.
//! - [`tle9012`]: command factory for the TLE9012 cell supervisors.
//! - [`telemetry`]: UDP control hook for the ECU8TR streaming module.
//! - [`sim`]: in-process bus simulator used by the smoke binary and the
//!   integration tests.

pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod isotp;
pub mod sim;
pub mod telemetry;
pub mod tle9012;
pub mod transport;
pub mod uds;

mod integration_tests;

pub use channel::{CanBus, CanChannel};
pub use config::DiagConfig;
pub use error::{DiagError, DiagResult};
pub use frame::CanFrame;
pub use transport::UdsTransport;
pub use uds::{shared, Iocbi, IocbiRecord, RoutineControl, RoutineRecord, UdsCommand};
