//! UDS (ISO 14229-1) command objects.
//!
//! Implements message building and validation for the two services this
//! host speaks: InputOutputControlByIdentifier (0x2F) and RoutineControl
//! (0x31). Commands are polymorphic over [`UdsCommand`] and carry their own
//! buffers, response callback and timeout; the transport drives them through
//! prepare / validate / dispatch.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info};

use crate::error::{DiagError, DiagResult};

/// Service identifiers.
pub const IOCBI_SID: u8 = 0x2F;
pub const ROUTINE_CONTROL_SID: u8 = 0x31;

/// A positive response always increments the SID by 0x40.
pub const POSITIVE_OFFSET: u8 = 0x40;
/// First byte of a negative response frame.
pub const NEGATIVE_RESPONSE: u8 = 0x7F;

/// Negative Response Codes (ISO 14229-1 A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Nrc {
    GeneralReject = 0x10,
    ServiceNotSupported = 0x11,
    SubFunctionNotSupported = 0x12,
    IncorrectMessageLengthOrInvalidFormat = 0x13,
    ResponseTooLong = 0x14,
    BusyRepeatRequest = 0x21,
    ConditionsNotCorrect = 0x22,
    RequestSequenceError = 0x24,
    NoResponseFromSubnetComponent = 0x25,
    FailurePreventsExecution = 0x26,
    RequestOutOfRange = 0x31,
    SecurityAccessDenied = 0x33,
    InvalidKey = 0x35,
    ExceedNumberOfAttempts = 0x36,
    RequiredTimeDelayNotExpired = 0x37,
    UploadDownloadNotAccepted = 0x70,
    TransferDataSuspended = 0x71,
    GeneralProgrammingFailure = 0x72,
    WrongBlockSequenceCounter = 0x73,
    ResponsePending = 0x78,
    SubFunctionNotSupportedInActiveSession = 0x7E,
    ServiceNotSupportedInActiveSession = 0x7F,
    RpmTooHigh = 0x81,
    RpmTooLow = 0x82,
    EngineIsRunning = 0x83,
    EngineIsNotRunning = 0x84,
    TemperatureTooHigh = 0x86,
    TemperatureTooLow = 0x87,
    VoltageTooHigh = 0x92,
    VoltageTooLow = 0x93,
}

impl Nrc {
    pub fn from_code(code: u8) -> Option<Self> {
        use Nrc::*;
        Some(match code {
            0x10 => GeneralReject,
            0x11 => ServiceNotSupported,
            0x12 => SubFunctionNotSupported,
            0x13 => IncorrectMessageLengthOrInvalidFormat,
            0x14 => ResponseTooLong,
            0x21 => BusyRepeatRequest,
            0x22 => ConditionsNotCorrect,
            0x24 => RequestSequenceError,
            0x25 => NoResponseFromSubnetComponent,
            0x26 => FailurePreventsExecution,
            0x31 => RequestOutOfRange,
            0x33 => SecurityAccessDenied,
            0x35 => InvalidKey,
            0x36 => ExceedNumberOfAttempts,
            0x37 => RequiredTimeDelayNotExpired,
            0x70 => UploadDownloadNotAccepted,
            0x71 => TransferDataSuspended,
            0x72 => GeneralProgrammingFailure,
            0x73 => WrongBlockSequenceCounter,
            0x78 => ResponsePending,
            0x7E => SubFunctionNotSupportedInActiveSession,
            0x7F => ServiceNotSupportedInActiveSession,
            0x81 => RpmTooHigh,
            0x82 => RpmTooLow,
            0x83 => EngineIsRunning,
            0x84 => EngineIsNotRunning,
            0x86 => TemperatureTooHigh,
            0x87 => TemperatureTooLow,
            0x92 => VoltageTooHigh,
            0x93 => VoltageTooLow,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        use Nrc::*;
        match self {
            GeneralReject => "generalReject",
            ServiceNotSupported => "serviceNotSupported",
            SubFunctionNotSupported => "subFunctionNotSupported",
            IncorrectMessageLengthOrInvalidFormat => "incorrectMessageLengthOrInvalidFormat",
            ResponseTooLong => "responseTooLong",
            BusyRepeatRequest => "busyRepeatRequest",
            ConditionsNotCorrect => "conditionsNotCorrect",
            RequestSequenceError => "requestSequenceError",
            NoResponseFromSubnetComponent => "noResponseFromSubnetComponent",
            FailurePreventsExecution => "failurePreventsExecutionOfRequestedAction",
            RequestOutOfRange => "requestOutOfRange",
            SecurityAccessDenied => "securityAccessDenied",
            InvalidKey => "invalidKey",
            ExceedNumberOfAttempts => "exceedNumberOfAttempts",
            RequiredTimeDelayNotExpired => "requiredTimeDelayNotExpired",
            UploadDownloadNotAccepted => "uploadDownloadNotAccepted",
            TransferDataSuspended => "transferDataSuspended",
            GeneralProgrammingFailure => "generalProgrammingFailure",
            WrongBlockSequenceCounter => "wrongBlockSequenceCounter",
            ResponsePending => "requestCorrectlyReceived-ResponsePending",
            SubFunctionNotSupportedInActiveSession => {
                "subFunctionNotSupportedInActiveSession"
            }
            ServiceNotSupportedInActiveSession => "serviceNotSupportedInActiveSession",
            RpmTooHigh => "rpmTooHigh",
            RpmTooLow => "rpmTooLow",
            EngineIsRunning => "engineIsRunning",
            EngineIsNotRunning => "engineIsNotRunning",
            TemperatureTooHigh => "temperatureTooHigh",
            TemperatureTooLow => "temperatureTooLow",
            VoltageTooHigh => "voltageTooHigh",
            VoltageTooLow => "voltageTooLow",
        }
    }
}

/// IOCBI InputOutputControlParameter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IoControlParam {
    ReturnControlToEcu = 0,
    ResetToDefault = 1,
    FreezeCurrentState = 2,
    ShortTermAdjustment = 3,
}

impl TryFrom<u8> for IoControlParam {
    type Error = DiagError;

    fn try_from(value: u8) -> DiagResult<Self> {
        match value {
            0 => Ok(IoControlParam::ReturnControlToEcu),
            1 => Ok(IoControlParam::ResetToDefault),
            2 => Ok(IoControlParam::FreezeCurrentState),
            3 => Ok(IoControlParam::ShortTermAdjustment),
            other => Err(DiagError::invalid(format!(
                "IoControlParam value {}",
                other
            ))),
        }
    }
}

/// RoutineControl sub-function values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoutineAction {
    Start = 1,
    Stop = 2,
    RequestResults = 3,
}

impl TryFrom<u8> for RoutineAction {
    type Error = DiagError;

    fn try_from(value: u8) -> DiagResult<Self> {
        match value {
            1 => Ok(RoutineAction::Start),
            2 => Ok(RoutineAction::Stop),
            3 => Ok(RoutineAction::RequestResults),
            other => Err(DiagError::invalid(format!("RoutineAction value {}", other))),
        }
    }
}

/// Capability set the transport drives. Implementations own their tx/rx
/// buffers; `prepare` must leave both cleared before writing the request.
pub trait UdsCommand: Send {
    fn sid(&self) -> u8;

    /// Wall clock granted to the whole receive phase. Zero means
    /// fire-and-forget: the transport sends and never listens.
    fn timeout(&self) -> Duration;

    /// Encode the outbound payload into the tx buffer.
    fn prepare(&mut self) -> DiagResult<()>;

    /// Check the reassembled response and unpack it into the command's
    /// record.
    fn validate(&mut self) -> DiagResult<()>;

    /// Invoke the user callback, exactly once per successful validate.
    fn dispatch(&mut self) -> DiagResult<()>;

    fn tx_data(&self) -> &[u8];

    /// Append a reassembled payload fragment to the rx buffer.
    fn extend_rx(&mut self, chunk: &[u8]);

    /// Short identification used in log lines.
    fn describe(&self) -> String;
}

/// Commands are shared between the caller, the dictionary and the tx
/// worker.
pub type SharedCommand = Arc<Mutex<dyn UdsCommand>>;

pub fn shared<C: UdsCommand + 'static>(cmd: C) -> SharedCommand {
    Arc::new(Mutex::new(cmd))
}

/// Shared base validation: negative responses fail with the NRC logged by
/// enum name, positive responses must carry SID + 0x40.
fn check_response(sid: u8, rx: &[u8]) -> DiagResult<()> {
    let first = *rx
        .first()
        .ok_or_else(|| DiagError::Validation("empty response".into()))?;
    if first == NEGATIVE_RESPONSE {
        if rx.len() > 2 {
            let code = rx[2];
            match Nrc::from_code(code) {
                Some(nrc) => error!("NRC:{} SID:0x{:02X}", nrc.name(), rx[1]),
                None => error!("NRC:0x{:02X} (unknown) SID:0x{:02X}", code, rx[1]),
            }
            return Err(DiagError::NegativeResponse { sid: rx[1], code });
        }
        error!("truncated negative response");
        return Err(DiagError::Validation("truncated negative response".into()));
    }
    if first == sid.wrapping_add(POSITIVE_OFFSET) {
        Ok(())
    } else {
        Err(DiagError::Validation(format!(
            "unexpected response SID 0x{:02X}",
            first
        )))
    }
}

/// Response callback signatures. Errors are logged by the transport and
/// never propagate into it.
pub type IocbiCallback = Box<dyn FnMut(&Iocbi) -> DiagResult<()> + Send>;
pub type RoutineCallback = Box<dyn FnMut(&RoutineControl) -> DiagResult<()> + Send>;

/// Payload descriptor of an IOCBI command.
///
/// Wire encoding: `[0x2F, id1, id2, ioCtl, option record...]`; the inbound
/// status record is filled by `validate`.
#[derive(Debug, Clone)]
pub struct IocbiRecord {
    pub id1: u8,
    pub id2: u8,
    pub control: IoControlParam,
    pub option_record: Vec<u8>,
    pub status_record: Vec<u8>,
}

impl IocbiRecord {
    pub fn new(id1: u8, id2: u8) -> Self {
        Self {
            id1,
            id2,
            control: IoControlParam::ShortTermAdjustment,
            option_record: Vec::new(),
            status_record: Vec::new(),
        }
    }

    pub fn with_option(mut self, option_record: Vec<u8>) -> Self {
        self.option_record = option_record;
        self
    }

    pub fn with_control(mut self, control: IoControlParam) -> Self {
        self.control = control;
        self
    }
}

/// InputOutputControlByIdentifier command, SID 0x2F.
pub struct Iocbi {
    record: IocbiRecord,
    tx_data: Vec<u8>,
    rx_data: Vec<u8>,
    callback: Option<IocbiCallback>,
    timeout: Duration,
}

impl Iocbi {
    /// Fixed receive overhead: SID, id1, id2, ioCtl.
    pub const RX_OVERHEAD: usize = 4;

    pub fn new(record: IocbiRecord) -> Self {
        Self {
            record,
            tx_data: Vec::new(),
            rx_data: Vec::new(),
            callback: None,
            timeout: Duration::from_secs(1),
        }
    }

    pub fn with_callback(mut self, callback: IocbiCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn set_callback(&mut self, callback: Option<IocbiCallback>) {
        self.callback = callback;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn record(&self) -> &IocbiRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut IocbiRecord {
        &mut self.record
    }

    pub fn rx_data(&self) -> &[u8] {
        &self.rx_data
    }
}

impl UdsCommand for Iocbi {
    fn sid(&self) -> u8 {
        IOCBI_SID
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn prepare(&mut self) -> DiagResult<()> {
        self.tx_data.clear();
        self.rx_data.clear();
        self.tx_data.push(IOCBI_SID);
        self.tx_data.push(self.record.id1);
        self.tx_data.push(self.record.id2);
        self.tx_data.push(self.record.control as u8);
        self.tx_data.extend_from_slice(&self.record.option_record);
        self.record.status_record.clear();
        Ok(())
    }

    fn validate(&mut self) -> DiagResult<()> {
        check_response(IOCBI_SID, &self.rx_data)?;
        if self.rx_data.len() < Self::RX_OVERHEAD {
            return Err(DiagError::Validation(format!(
                "IOCBI response too short: {}",
                self.rx_data.len()
            )));
        }
        // The positive response echoes id1, id2 and ioCtl
        if self.rx_data[1..Self::RX_OVERHEAD] != self.tx_data[1..Self::RX_OVERHEAD] {
            return Err(DiagError::Validation("IOCBI header echo mismatch".into()));
        }
        if self.rx_data.len() > Self::RX_OVERHEAD {
            self.record.status_record = self.rx_data[Self::RX_OVERHEAD..].to_vec();
        }
        Ok(())
    }

    fn dispatch(&mut self) -> DiagResult<()> {
        if let Some(mut callback) = self.callback.take() {
            let result = callback(self);
            self.callback = Some(callback);
            result.map_err(|e| DiagError::Callback(e.to_string()))?;
        }
        Ok(())
    }

    fn tx_data(&self) -> &[u8] {
        &self.tx_data
    }

    fn extend_rx(&mut self, chunk: &[u8]) {
        self.rx_data.extend_from_slice(chunk);
    }

    fn describe(&self) -> String {
        format!(
            "IOCBI id1[0x{:02X}]id2[0x{:02X}]",
            self.record.id1, self.record.id2
        )
    }
}

/// Payload descriptor of a RoutineControl command.
///
/// Wire encoding: `[0x31, subfunction, rid1, rid2, status record...]`; the
/// `routineInfo` byte comes back at offset 4 of the positive response.
#[derive(Debug, Clone)]
pub struct RoutineRecord {
    pub action: RoutineAction,
    pub rid1: u8,
    pub rid2: u8,
    pub status_record: Vec<u8>,
    pub routine_info: Option<u8>,
}

impl RoutineRecord {
    pub fn new(action: RoutineAction, rid1: u8, rid2: u8) -> Self {
        Self {
            action,
            rid1,
            rid2,
            status_record: Vec::new(),
            routine_info: None,
        }
    }

    pub fn with_status(mut self, status_record: Vec<u8>) -> Self {
        self.status_record = status_record;
        self
    }
}

/// RoutineControl command, SID 0x31.
pub struct RoutineControl {
    record: RoutineRecord,
    tx_data: Vec<u8>,
    rx_data: Vec<u8>,
    callback: Option<RoutineCallback>,
    timeout: Duration,
}

impl RoutineControl {
    /// Fixed receive overhead: SID, subfunction, rid1, rid2, routineInfo.
    pub const RX_OVERHEAD: usize = 5;

    pub fn new(record: RoutineRecord) -> Self {
        Self {
            record,
            tx_data: Vec::new(),
            rx_data: Vec::new(),
            callback: None,
            timeout: Duration::from_secs(1),
        }
    }

    pub fn with_callback(mut self, callback: RoutineCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn record(&self) -> &RoutineRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut RoutineRecord {
        &mut self.record
    }

    pub fn rx_data(&self) -> &[u8] {
        &self.rx_data
    }
}

impl UdsCommand for RoutineControl {
    fn sid(&self) -> u8 {
        ROUTINE_CONTROL_SID
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn prepare(&mut self) -> DiagResult<()> {
        self.tx_data.clear();
        self.rx_data.clear();
        self.tx_data.push(ROUTINE_CONTROL_SID);
        self.tx_data.push(self.record.action as u8);
        self.tx_data.push(self.record.rid1);
        self.tx_data.push(self.record.rid2);
        self.tx_data.extend_from_slice(&self.record.status_record);
        self.record.routine_info = None;
        Ok(())
    }

    fn validate(&mut self) -> DiagResult<()> {
        check_response(ROUTINE_CONTROL_SID, &self.rx_data)?;
        if self.rx_data.len() < Self::RX_OVERHEAD {
            return Err(DiagError::Validation(format!(
                "RoutineControl response too short: {}",
                self.rx_data.len()
            )));
        }
        // The positive response echoes subfunction, rid1 and rid2
        if self.rx_data[1..4] != self.tx_data[1..4] {
            return Err(DiagError::Validation(
                "RoutineControl header echo mismatch".into(),
            ));
        }
        self.record.routine_info = Some(self.rx_data[4]);
        Ok(())
    }

    fn dispatch(&mut self) -> DiagResult<()> {
        if let Some(mut callback) = self.callback.take() {
            let result = callback(self);
            self.callback = Some(callback);
            result.map_err(|e| DiagError::Callback(e.to_string()))?;
        }
        Ok(())
    }

    fn tx_data(&self) -> &[u8] {
        &self.tx_data
    }

    fn extend_rx(&mut self, chunk: &[u8]) {
        self.rx_data.extend_from_slice(chunk);
    }

    fn describe(&self) -> String {
        format!(
            "RC subfunc[{:?}]rid1[0x{:02X}]rid2[0x{:02X}]",
            self.record.action, self.record.rid1, self.record.rid2
        )
    }
}

/// Log helper shared by default command callbacks.
pub fn log_status_record(label: &str, record: &[u8]) {
    if record.is_empty() {
        info!("{}", label);
    } else {
        let hex: String = record.iter().map(|b| format!("{:02x} ", b)).collect();
        info!("{} [ {}]", label, hex);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_iocbi_prepare_layout() {
        let record = IocbiRecord::new(0xE1, 0x00).with_option(vec![0xAA, 0xBB]);
        let mut cmd = Iocbi::new(record);
        cmd.prepare().unwrap();
        assert_eq!(cmd.tx_data(), &[0x2F, 0xE1, 0x00, 0x03, 0xAA, 0xBB]);
    }

    #[test]
    fn test_iocbi_validate_unpacks_status_record() {
        let mut cmd = Iocbi::new(IocbiRecord::new(0xE1, 0x00));
        cmd.prepare().unwrap();
        cmd.extend_rx(&[0x6F, 0xE1, 0x00, 0x03, 0x00, 0x01, 0x02]);
        cmd.validate().unwrap();
        assert_eq!(cmd.record().status_record, vec![0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_iocbi_validate_rejects_header_mismatch() {
        let mut cmd = Iocbi::new(IocbiRecord::new(0xE1, 0x00));
        cmd.prepare().unwrap();
        cmd.extend_rx(&[0x6F, 0xE1, 0x01, 0x03, 0x00]);
        assert!(matches!(
            cmd.validate(),
            Err(DiagError::Validation(_))
        ));
    }

    #[test]
    fn test_negative_response_maps_nrc() {
        let mut cmd = Iocbi::new(IocbiRecord::new(0xE1, 0x00));
        cmd.prepare().unwrap();
        cmd.extend_rx(&[0x7F, 0x2F, 0x31]);
        match cmd.validate() {
            Err(DiagError::NegativeResponse { sid, code }) => {
                assert_eq!(sid, 0x2F);
                assert_eq!(code, 0x31);
                assert_eq!(Nrc::from_code(code).unwrap().name(), "requestOutOfRange");
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[test]
    fn test_unknown_nrc_code() {
        assert!(Nrc::from_code(0x5A).is_none());
        assert_eq!(Nrc::from_code(0x78).unwrap(), Nrc::ResponsePending);
    }

    #[test]
    fn test_callback_runs_once_per_validate() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let mut cmd = Iocbi::new(IocbiRecord::new(0xE1, 0x00)).with_callback(Box::new(
            move |_cmd| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ));
        cmd.prepare().unwrap();
        cmd.extend_rx(&[0x6F, 0xE1, 0x00, 0x03, 0x05]);
        cmd.validate().unwrap();
        cmd.dispatch().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_routine_control_round() {
        let record = RoutineRecord::new(RoutineAction::Start, 0x02, 0x00)
            .with_status(vec![0x11, 0x22]);
        let mut cmd = RoutineControl::new(record);
        cmd.prepare().unwrap();
        assert_eq!(cmd.tx_data(), &[0x31, 0x01, 0x02, 0x00, 0x11, 0x22]);

        cmd.extend_rx(&[0x71, 0x01, 0x02, 0x00, 0x42]);
        cmd.validate().unwrap();
        assert_eq!(cmd.record().routine_info, Some(0x42));
    }

    #[test]
    fn test_routine_control_short_response() {
        let mut cmd = RoutineControl::new(RoutineRecord::new(RoutineAction::Stop, 0x02, 0x00));
        cmd.prepare().unwrap();
        cmd.extend_rx(&[0x71, 0x02, 0x02, 0x00]);
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn test_reprepare_clears_buffers() {
        let mut cmd = Iocbi::new(IocbiRecord::new(0xE1, 0x00));
        cmd.prepare().unwrap();
        cmd.extend_rx(&[0x6F, 0xE1, 0x00, 0x03, 0x09]);
        cmd.validate().unwrap();
        assert!(!cmd.record().status_record.is_empty());

        cmd.prepare().unwrap();
        assert!(cmd.rx_data().is_empty());
        assert!(cmd.record().status_record.is_empty());
        assert_eq!(cmd.tx_data(), &[0x2F, 0xE1, 0x00, 0x03]);
    }

    #[test]
    fn test_control_param_try_from() {
        assert_eq!(
            IoControlParam::try_from(3).unwrap(),
            IoControlParam::ShortTermAdjustment
        );
        assert!(IoControlParam::try_from(4).is_err());
        assert!(RoutineAction::try_from(0).is_err());
        assert_eq!(RoutineAction::try_from(3).unwrap(), RoutineAction::RequestResults);
    }
}
