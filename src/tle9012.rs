//! TLE9012 cell-supervisor command factory.
//!
//! Builds IOCBI commands for one TLE9012 monitoring device in the daisy
//! chain. Every builder validates its arguments (enumerations, bit-field
//! widths, booleans) before any CAN traffic happens, packs the option
//! record as `[dev, arg...]`, and installs a default response callback that
//! checks the echoed device number and the expected status-record length
//! before decoding. Command objects are cached per command ordinal so
//! repeated builds update the option record, callback and timeout in
//! place.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use crate::error::{DiagError, DiagResult};
use crate::uds::{log_status_record, Iocbi, IocbiCallback, IocbiRecord, SharedCommand, UdsCommand};

/// Number of TLE9012 devices chained behind the TLE9015 interface.
pub const MAX_DEVICES: u8 = 2;
/// Measurement channels per device.
pub const MAX_CELLS: u8 = 12;

/// `dataIdentifier1` used by every factory command; the command ordinal
/// goes into `dataIdentifier2`.
const DATA_ID1: u8 = 0x00;

/// Command ordinals, transmitted as `dataIdentifier2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cmd {
    SetCellEnable = 0x00,
    GetCellEnable = 0x01,
    SetMaxVoltDropThd = 0x02,
    GetMaxVoltDropThd = 0x03,
    SetOVoltFltThd = 0x04,
    GetOVoltFltThd = 0x05,
    SetMinVoltDropThd = 0x06,
    GetMinVoltDropThd = 0x07,
    SetUVoltFltThd = 0x08,
    GetUVoltFltThd = 0x09,
    SetExtTempOvertempThd = 0x0A,
    GetExtTempOvertempThd = 0x0B,
    SetOtFltCurrSrc = 0x0C,
    GetOtFltCurrSrc = 0x0D,
    SetExtTempSensorsUsed = 0x0E,
    GetExtTempSensorsUsed = 0x0F,
    SetIntTempOvertempThd = 0x10,
    GetIntTempOvertempThd = 0x11,
    SetNumConsecErr = 0x12,
    GetNumConsecErr = 0x13,
    SetExtTempTrigForRR = 0x14,
    GetExtTempTrigForRR = 0x15,
    SetSleepModeTimingForRR = 0x16,
    GetSleepModeTimingForRR = 0x17,
    SetRRCounter = 0x18,
    GetRRCounter = 0x19,
    SetRRSync = 0x1A,
    GetRRSync = 0x1B,
    SetRRCfgMsk = 0x1C,
    GetRRCfgMsk = 0x1D,
    SetFltMskCfg = 0x1E,
    GetFltMskCfg = 0x1F,
    SetGenDiagMsk = 0x20,
    GetGenDiagMsk = 0x21,
    SetCellUVoltFlg = 0x22,
    GetCellUVoltFlg = 0x23,
    SetCellOVoltFlg = 0x24,
    GetCellOVoltFlg = 0x25,
    SetExtTempDiagOpenFlg = 0x26,
    GetExtTempDiagOpenFlg = 0x27,
    SetExtTempDiagShortFlg = 0x28,
    GetExtTempDiagShortFlg = 0x29,
    SetExtTempDiagOtFlg = 0x2A,
    GetExtTempDiagOtFlg = 0x2B,
    SetCellOpenloadFlg = 0x2C,
    GetCellOpenloadFlg = 0x2D,
    SetCRCRegisterError = 0x2E,
    GetCRCRegisterError = 0x2F,
    SetExtendWdg = 0x30,
    GetExtendWdg = 0x31,
    SetActivateSleepMode = 0x32,
    GetActivateSleepMode = 0x33,
    SetUCurrFltThd = 0x34,
    GetUCurrFltThd = 0x35,
    SetOCurrFltThd = 0x36,
    GetOCurrFltThd = 0x37,
    SetBalState = 0x38,
    GetBalState = 0x39,
    SetAVMExtTempDiagPd = 0x3A,
    GetAVMExtTempDiagPd = 0x3B,
    SetDiagResMskFlg = 0x3C,
    GetDiagResMskFlg = 0x3D,
    SetBalDiagOCurr = 0x3E,
    GetBalDiagOCurr = 0x3F,
    SetBalDiagUCurr = 0x40,
    GetBalDiagUCurr = 0x41,
    GetCellMeasure = 0x42,
    GetBlockMeasure = 0x43,
    GetExtTempRes = 0x44,
    GetExtTempSrc = 0x45,
    GetExtTempPd = 0x46,
    GetExtTempValid = 0x47,
    GetGPIOInputState = 0x48,
    SetGPIOOutputState = 0x49,
    GetGPIOOutputState = 0x4A,
    SetGPIODir = 0x4B,
    GetGPIODir = 0x4C,
    GetPWMInputState = 0x4D,
    SetPWMEnable = 0x4E,
    GetPWMEnable = 0x4F,
    SetPWMOutputState = 0x50,
    GetPWMOutputState = 0x51,
    SetPWMDirection = 0x52,
    GetPWMDirection = 0x53,
    SetGPIOPwmUVoltErr = 0x54,
    GetGPIOPwmUVoltErr = 0x55,
    SetPwmPeriodDuty = 0x56,
    GetPWMPeriod = 0x57,
    GetPWMDutyCycle = 0x58,
}

/// Cell index inside PART_CONFIG and the measurement registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellNum(u8);

impl CellNum {
    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for CellNum {
    type Error = DiagError;

    fn try_from(value: u8) -> DiagResult<Self> {
        if value < MAX_CELLS {
            Ok(CellNum(value))
        } else {
            Err(DiagError::invalid(format!("cell number {}", value)))
        }
    }
}

/// Balancing/measurement switch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellSwitch {
    Disable = 0,
    Enable = 1,
}

impl TryFrom<u8> for CellSwitch {
    type Error = DiagError;

    fn try_from(value: u8) -> DiagResult<Self> {
        match value {
            0 => Ok(CellSwitch::Disable),
            1 => Ok(CellSwitch::Enable),
            other => Err(DiagError::invalid(format!("cell switch {}", other))),
        }
    }
}

/// NTC bias current source selection in TEMP_CONFIG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CurrentSrc {
    I0 = 0,
    I1 = 1,
    I2 = 2,
    I3 = 3,
}

impl TryFrom<u8> for CurrentSrc {
    type Error = DiagError;

    fn try_from(value: u8) -> DiagResult<Self> {
        match value {
            0 => Ok(CurrentSrc::I0),
            1 => Ok(CurrentSrc::I1),
            2 => Ok(CurrentSrc::I2),
            3 => Ok(CurrentSrc::I3),
            other => Err(DiagError::invalid(format!("current source {}", other))),
        }
    }
}

/// External temperature sensor population in TEMP_CONFIG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExtTempSensorsUsed {
    NoExtTempSense = 0,
    Tmp0Active = 1,
    Tmp0To1Active = 2,
    Tmp0To2Active = 3,
    Tmp0To3Active = 4,
    Tmp0To4Active = 5,
}

impl TryFrom<u8> for ExtTempSensorsUsed {
    type Error = DiagError;

    fn try_from(value: u8) -> DiagResult<Self> {
        use ExtTempSensorsUsed::*;
        match value {
            0 => Ok(NoExtTempSense),
            1 => Ok(Tmp0Active),
            2 => Ok(Tmp0To1Active),
            3 => Ok(Tmp0To2Active),
            4 => Ok(Tmp0To3Active),
            5 => Ok(Tmp0To4Active),
            other => Err(DiagError::invalid(format!("ext temp sensors {}", other))),
        }
    }
}

/// Round-robin synchronization with the watchdog counter in RR_CONFIG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RrSync {
    NoSyncWithWdg = 0,
    SyncWithWdg = 1,
}

impl TryFrom<u8> for RrSync {
    type Error = DiagError;

    fn try_from(value: u8) -> DiagResult<Self> {
        match value {
            0 => Ok(RrSync::NoSyncWithWdg),
            1 => Ok(RrSync::SyncWithWdg),
            other => Err(DiagError::invalid(format!("rr sync {}", other))),
        }
    }
}

/// Round-robin error-counter mask bits in RR_CONFIG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RrErrorMask {
    AdcError = 8,
    OpenLoadError = 9,
    ExtTempError = 10,
    IntTempError = 11,
    UndertemperatureError = 12,
    OvertemperatureError = 13,
    BalancingUndercurrent = 14,
    BalancingOvercurrent = 15,
}

impl TryFrom<u8> for RrErrorMask {
    type Error = DiagError;

    fn try_from(value: u8) -> DiagResult<Self> {
        use RrErrorMask::*;
        match value {
            8 => Ok(AdcError),
            9 => Ok(OpenLoadError),
            10 => Ok(ExtTempError),
            11 => Ok(IntTempError),
            12 => Ok(UndertemperatureError),
            13 => Ok(OvertemperatureError),
            14 => Ok(BalancingUndercurrent),
            15 => Ok(BalancingOvercurrent),
            other => Err(DiagError::invalid(format!("rr error mask {}", other))),
        }
    }
}

/// Error-pin fault mask bits in FAULT_MASK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultMask {
    ErrorPinEnable = 5,
    AdcError = 6,
    OpenLoadError = 7,
    InternalIcError = 8,
    RegisterCrcError = 9,
    ExtTempError = 10,
    IntTempError = 11,
    UndertemperatureError = 12,
    OvertemperatureError = 13,
    BalancingUndercurrent = 14,
    BalancingOvercurrent = 15,
}

impl TryFrom<u8> for FaultMask {
    type Error = DiagError;

    fn try_from(value: u8) -> DiagResult<Self> {
        use FaultMask::*;
        match value {
            5 => Ok(ErrorPinEnable),
            6 => Ok(AdcError),
            7 => Ok(OpenLoadError),
            8 => Ok(InternalIcError),
            9 => Ok(RegisterCrcError),
            10 => Ok(ExtTempError),
            11 => Ok(IntTempError),
            12 => Ok(UndertemperatureError),
            13 => Ok(OvertemperatureError),
            14 => Ok(BalancingUndercurrent),
            15 => Ok(BalancingOvercurrent),
            other => Err(DiagError::invalid(format!("fault mask {}", other))),
        }
    }
}

/// General diagnostics mask bits in GEN_DIAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GenDiag {
    GpioWakeupEnabled = 0,
    MasterOnTopConfig = 1,
    BalancingActive = 2,
    MeasurementActive = 3,
    RoundRobinActive = 4,
    UndertemperatureInducedSleep = 5,
    AdcError = 6,
    OpenLoadError = 7,
    InternalIcError = 8,
    RegisterCrcError = 9,
    ExtTempError = 10,
    IntTempError = 11,
    UndertemperatureError = 12,
    OvertemperatureError = 13,
    BalancingUndercurrent = 14,
    BalancingOvercurrent = 15,
}

impl TryFrom<u8> for GenDiag {
    type Error = DiagError;

    fn try_from(value: u8) -> DiagResult<Self> {
        use GenDiag::*;
        match value {
            0 => Ok(GpioWakeupEnabled),
            1 => Ok(MasterOnTopConfig),
            2 => Ok(BalancingActive),
            3 => Ok(MeasurementActive),
            4 => Ok(RoundRobinActive),
            5 => Ok(UndertemperatureInducedSleep),
            6 => Ok(AdcError),
            7 => Ok(OpenLoadError),
            8 => Ok(InternalIcError),
            9 => Ok(RegisterCrcError),
            10 => Ok(ExtTempError),
            11 => Ok(IntTempError),
            12 => Ok(UndertemperatureError),
            13 => Ok(OvertemperatureError),
            14 => Ok(BalancingUndercurrent),
            15 => Ok(BalancingOvercurrent),
            other => Err(DiagError::invalid(format!("gen diag mask {}", other))),
        }
    }
}

/// Auxiliary-voltage-measurement diagnosis masks in AVM_CONFIG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuxVoltDiag {
    ExtTemp0 = 3,
    ExtTemp1 = 4,
    AuxMeas0 = 6,
    AuxMeas1 = 7,
    Resistor = 9,
}

impl TryFrom<u8> for AuxVoltDiag {
    type Error = DiagError;

    fn try_from(value: u8) -> DiagResult<Self> {
        use AuxVoltDiag::*;
        match value {
            3 => Ok(ExtTemp0),
            4 => Ok(ExtTemp1),
            6 => Ok(AuxMeas0),
            7 => Ok(AuxMeas1),
            9 => Ok(Resistor),
            other => Err(DiagError::invalid(format!("aux volt diag mask {}", other))),
        }
    }
}

/// Diagnosis-resistor measurement selection in AVM_CONFIG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiagResistorMask {
    MaskedOut = 0,
    PerformedOnStart = 1,
}

impl TryFrom<u8> for DiagResistorMask {
    type Error = DiagError;

    fn try_from(value: u8) -> DiagResult<Self> {
        match value {
            0 => Ok(DiagResistorMask::MaskedOut),
            1 => Ok(DiagResistorMask::PerformedOnStart),
            other => Err(DiagError::invalid(format!("diag resistor mask {}", other))),
        }
    }
}

/// Balancing driver switch state in BAL_SETTINGS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BalSwitch {
    DriverOff = 0,
    DriverOn = 1,
}

impl TryFrom<u8> for BalSwitch {
    type Error = DiagError;

    fn try_from(value: u8) -> DiagResult<Self> {
        match value {
            0 => Ok(BalSwitch::DriverOff),
            1 => Ok(BalSwitch::DriverOn),
            other => Err(DiagError::invalid(format!("balancing switch {}", other))),
        }
    }
}

/// Validate a value against an arbitrary bit-field width.
fn bit_field(value: u16, width: u32) -> DiagResult<u16> {
    if width > 0 && width < 16 && (value as u32) < (1u32 << width) {
        Ok(value)
    } else {
        Err(DiagError::invalid(format!(
            "0x{:X} does not fit {} bits",
            value, width
        )))
    }
}

/// Device-number and length check shared by every response callback.
fn expect_status<'a>(dev: u8, cmd: &'a Iocbi, expected_len: usize) -> DiagResult<&'a [u8]> {
    let record = cmd.record().status_record.as_slice();
    if record.first().copied() != Some(dev) {
        return Err(DiagError::Validation(format!(
            "{} response device mismatch (expected {})",
            cmd.describe(),
            dev
        )));
    }
    if record.len() != expected_len {
        return Err(DiagError::Validation(format!(
            "{} status length {} (expected {})",
            cmd.describe(),
            record.len(),
            expected_len
        )));
    }
    Ok(record)
}

fn word(record: &[u8]) -> u16 {
    ((record[1] as u16) << 8) | record[2] as u16
}

/// Command factory for one device in the chain.
pub struct Tle9012 {
    dev: u8,
    commands: HashMap<Cmd, Arc<Mutex<Iocbi>>>,
}

impl Tle9012 {
    pub fn new(dev: u8) -> DiagResult<Self> {
        if dev > MAX_DEVICES {
            return Err(DiagError::invalid(format!("device number {}", dev)));
        }
        Ok(Self {
            dev,
            commands: HashMap::new(),
        })
    }

    pub fn device(&self) -> u8 {
        self.dev
    }

    /// Fetch-or-create the cached command object for an ordinal. Repeat
    /// builds overwrite the option record, callback and timeout of the
    /// existing object, keeping dictionary references valid.
    fn command(
        &mut self,
        cmd: Cmd,
        option: Vec<u8>,
        callback: IocbiCallback,
        timeout: Duration,
    ) -> Arc<Mutex<Iocbi>> {
        match self.commands.entry(cmd) {
            Entry::Occupied(entry) => {
                let handle = entry.get();
                {
                    let mut locked = handle.lock().unwrap_or_else(|e| e.into_inner());
                    locked.record_mut().option_record = option;
                    locked.set_timeout(timeout);
                    locked.set_callback(Some(callback));
                }
                Arc::clone(handle)
            }
            Entry::Vacant(entry) => {
                let record = IocbiRecord::new(DATA_ID1, cmd as u8).with_option(option);
                let iocbi = Iocbi::new(record)
                    .with_callback(callback)
                    .with_timeout(timeout);
                Arc::clone(entry.insert(Arc::new(Mutex::new(iocbi))))
            }
        }
    }

    /// The factory cache as transport commands, for dictionary
    /// registration.
    pub fn shared(&self, cmd: Cmd) -> Option<SharedCommand> {
        self.commands.get(&cmd).map(|c| {
            let dynamic: SharedCommand = c.clone();
            dynamic
        })
    }

    /// Response callback that only checks the device echo and logs the
    /// raw status record.
    pub fn default_callback(&self) -> IocbiCallback {
        let dev = self.dev;
        Box::new(move |cmd| {
            let record = cmd.record().status_record.as_slice();
            if record.first().copied() != Some(dev) {
                return Err(DiagError::Validation(format!(
                    "{} response device mismatch (expected {})",
                    cmd.describe(),
                    dev
                )));
            }
            log_status_record(&cmd.describe(), record);
            Ok(())
        })
    }

    // PART_CONFIG.EN_CELLx

    pub fn set_cell_enable(
        &mut self,
        cell: u8,
        enable: u8,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let cell = CellNum::try_from(cell)?;
        let enable = CellSwitch::try_from(enable)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let cell = CellNum::try_from(record[1])?;
            let state = CellSwitch::try_from(record[2])?;
            info!("SetCellEnable Dev:{} Cell:{} {:?}", dev, cell.value(), state);
            Ok(())
        });
        Ok(self.command(
            Cmd::SetCellEnable,
            vec![self.dev, cell.value(), enable as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_cell_enable(&mut self, cell: u8, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let cell = CellNum::try_from(cell)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let cell = CellNum::try_from(record[1])?;
            let state = CellSwitch::try_from(record[2])?;
            info!("GetCellEnable Dev:{} Cell:{} {:?}", dev, cell.value(), state);
            Ok(())
        });
        Ok(self.command(
            Cmd::GetCellEnable,
            vec![self.dev, cell.value()],
            callback,
            timeout,
        ))
    }

    // OL_OV_THR.OL_THR_MAX, 6-bit

    pub fn set_max_volt_drop_thd(
        &mut self,
        threshold: u16,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let threshold = bit_field(threshold, 6)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            let value = bit_field(record[1] as u16, 6)?;
            info!("SetMaxVoltDropThd Dev:{} value:0x{:04X}", dev, value);
            Ok(())
        });
        Ok(self.command(
            Cmd::SetMaxVoltDropThd,
            vec![self.dev, threshold as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_max_volt_drop_thd(&mut self, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            let value = bit_field(record[1] as u16, 6)?;
            info!("GetMaxVoltDropThd Dev:{} value:0x{:04X}", dev, value);
            Ok(())
        });
        Ok(self.command(Cmd::GetMaxVoltDropThd, vec![self.dev], callback, timeout))
    }

    // OL_OV_THR.OV_THR, 10-bit

    pub fn set_ovolt_flt_thd(
        &mut self,
        threshold: u16,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let threshold = bit_field(threshold, 10)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let value = bit_field(word(record), 10)?;
            info!("SetOVoltFltThd Dev:{} value:0x{:04X}", dev, value);
            Ok(())
        });
        Ok(self.command(
            Cmd::SetOVoltFltThd,
            vec![self.dev, (threshold >> 8) as u8, (threshold & 0xFF) as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_ovolt_flt_thd(&mut self, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let value = bit_field(word(record), 10)?;
            info!("GetOVoltFltThd Dev:{} value:0x{:04X}", dev, value);
            Ok(())
        });
        Ok(self.command(Cmd::GetOVoltFltThd, vec![self.dev], callback, timeout))
    }

    // OL_UV_THR.UV_THR, 10-bit

    pub fn set_uvolt_flt_thd(
        &mut self,
        threshold: u16,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let threshold = bit_field(threshold, 10)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let value = bit_field(word(record), 10)?;
            info!("SetUVoltFltThd Dev:{} value:0x{:04X}", dev, value);
            Ok(())
        });
        Ok(self.command(
            Cmd::SetUVoltFltThd,
            vec![self.dev, (threshold >> 8) as u8, (threshold & 0xFF) as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_uvolt_flt_thd(&mut self, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let value = bit_field(word(record), 10)?;
            info!("GetUVoltFltThd Dev:{} value:0x{:04X}", dev, value);
            Ok(())
        });
        Ok(self.command(Cmd::GetUVoltFltThd, vec![self.dev], callback, timeout))
    }

    // TEMP_CONF.EXT_OT_THR, 10-bit

    pub fn set_ext_temp_overtemp_thd(
        &mut self,
        threshold: u16,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let threshold = bit_field(threshold, 10)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let value = bit_field(word(record), 10)?;
            info!("SetExtTempOvertempThd Dev:{} value:0x{:04X}", dev, value);
            Ok(())
        });
        Ok(self.command(
            Cmd::SetExtTempOvertempThd,
            vec![self.dev, (threshold >> 8) as u8, (threshold & 0xFF) as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_ext_temp_overtemp_thd(&mut self, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let value = bit_field(word(record), 10)?;
            info!("GetExtTempOvertempThd Dev:{} value:0x{:04X}", dev, value);
            Ok(())
        });
        Ok(self.command(Cmd::GetExtTempOvertempThd, vec![self.dev], callback, timeout))
    }

    // TEMP_CONF.I_NTC

    pub fn set_ot_flt_curr_src(
        &mut self,
        source: u8,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let source = CurrentSrc::try_from(source)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            let source = CurrentSrc::try_from(record[1])?;
            info!("SetOtFltCurrSrc Dev:{} source:{:?}", dev, source);
            Ok(())
        });
        Ok(self.command(
            Cmd::SetOtFltCurrSrc,
            vec![self.dev, source as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_ot_flt_curr_src(&mut self, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            let source = CurrentSrc::try_from(record[1])?;
            info!("GetOtFltCurrSrc Dev:{} source:{:?}", dev, source);
            Ok(())
        });
        Ok(self.command(Cmd::GetOtFltCurrSrc, vec![self.dev], callback, timeout))
    }

    // TEMP_CONF.NR_TEMP_SENSE

    pub fn set_ext_temp_sensors_used(
        &mut self,
        sensors: u8,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let sensors = ExtTempSensorsUsed::try_from(sensors)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            let sensors = ExtTempSensorsUsed::try_from(record[1])?;
            info!("SetExtTempSensorsUsed Dev:{} sensors:{:?}", dev, sensors);
            Ok(())
        });
        Ok(self.command(
            Cmd::SetExtTempSensorsUsed,
            vec![self.dev, sensors as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_ext_temp_sensors_used(&mut self, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            let sensors = ExtTempSensorsUsed::try_from(record[1])?;
            info!("GetExtTempSensorsUsed Dev:{} sensors:{:?}", dev, sensors);
            Ok(())
        });
        Ok(self.command(Cmd::GetExtTempSensorsUsed, vec![self.dev], callback, timeout))
    }

    // RR_ERR_CNT.NR_ERR, 3-bit

    pub fn set_num_consec_err(
        &mut self,
        errors: u16,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let errors = bit_field(errors, 3)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            let value = bit_field(record[1] as u16, 3)?;
            info!("SetNumConsecErr Dev:{} value:0x{:04X}", dev, value);
            Ok(())
        });
        Ok(self.command(
            Cmd::SetNumConsecErr,
            vec![self.dev, errors as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_num_consec_err(&mut self, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            let value = bit_field(record[1] as u16, 3)?;
            info!("GetNumConsecErr Dev:{} value:0x{:04X}", dev, value);
            Ok(())
        });
        Ok(self.command(Cmd::GetNumConsecErr, vec![self.dev], callback, timeout))
    }

    // RR_CONFIG.RR_CNT, 7-bit

    pub fn set_rr_counter(
        &mut self,
        counter: u16,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let counter = bit_field(counter, 7)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            info!("SetRRCounter Dev:{} counter:{}", dev, record[1]);
            Ok(())
        });
        Ok(self.command(
            Cmd::SetRRCounter,
            vec![self.dev, counter as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_rr_counter(&mut self, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            info!("GetRRCounter Dev:{} counter:{}", dev, record[1]);
            Ok(())
        });
        Ok(self.command(Cmd::GetRRCounter, vec![self.dev], callback, timeout))
    }

    // RR_CONFIG.RR_SYNC

    pub fn set_rr_sync(&mut self, sync: u8, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let sync = RrSync::try_from(sync)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            let sync = RrSync::try_from(record[1])?;
            info!("SetRRSync Dev:{} sync:{:?}", dev, sync);
            Ok(())
        });
        Ok(self.command(
            Cmd::SetRRSync,
            vec![self.dev, sync as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_rr_sync(&mut self, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            let sync = RrSync::try_from(record[1])?;
            info!("GetRRSync Dev:{} sync:{:?}", dev, sync);
            Ok(())
        });
        Ok(self.command(Cmd::GetRRSync, vec![self.dev], callback, timeout))
    }

    // RR_CONFIG.M_NR_ERR_x

    pub fn set_rr_cfg_mask(
        &mut self,
        mask_bit: u8,
        masked: bool,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let mask_bit = RrErrorMask::try_from(mask_bit)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let mask_bit = RrErrorMask::try_from(record[1])?;
            info!(
                "SetRRCfgMsk Dev:{} config:{:?} mask:{}",
                dev, mask_bit, record[2]
            );
            Ok(())
        });
        Ok(self.command(
            Cmd::SetRRCfgMsk,
            vec![self.dev, mask_bit as u8, masked as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_rr_cfg_mask(
        &mut self,
        mask_bit: u8,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let mask_bit = RrErrorMask::try_from(mask_bit)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let mask_bit = RrErrorMask::try_from(record[1])?;
            info!(
                "GetRRCfgMsk Dev:{} config:{:?} mask:{}",
                dev, mask_bit, record[2]
            );
            Ok(())
        });
        Ok(self.command(
            Cmd::GetRRCfgMsk,
            vec![self.dev, mask_bit as u8],
            callback,
            timeout,
        ))
    }

    // FAULT_MASK bits

    pub fn set_fault_mask(
        &mut self,
        mask_bit: u8,
        masked: bool,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let mask_bit = FaultMask::try_from(mask_bit)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let mask_bit = FaultMask::try_from(record[1])?;
            info!(
                "SetFltMskCfg Dev:{} config:{:?} mask:{}",
                dev, mask_bit, record[2]
            );
            Ok(())
        });
        Ok(self.command(
            Cmd::SetFltMskCfg,
            vec![self.dev, mask_bit as u8, masked as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_fault_mask(
        &mut self,
        mask_bit: u8,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let mask_bit = FaultMask::try_from(mask_bit)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let mask_bit = FaultMask::try_from(record[1])?;
            info!(
                "GetFltMskCfg Dev:{} config:{:?} mask:{}",
                dev, mask_bit, record[2]
            );
            Ok(())
        });
        Ok(self.command(
            Cmd::GetFltMskCfg,
            vec![self.dev, mask_bit as u8],
            callback,
            timeout,
        ))
    }

    // GEN_DIAG mask bits

    pub fn set_gen_diag_mask(
        &mut self,
        mask_bit: u8,
        masked: bool,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let mask_bit = GenDiag::try_from(mask_bit)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let mask_bit = GenDiag::try_from(record[1])?;
            info!(
                "SetGenDiagMsk Dev:{} config:{:?} mask:{}",
                dev, mask_bit, record[2]
            );
            Ok(())
        });
        Ok(self.command(
            Cmd::SetGenDiagMsk,
            vec![self.dev, mask_bit as u8, masked as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_gen_diag_mask(
        &mut self,
        mask_bit: u8,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let mask_bit = GenDiag::try_from(mask_bit)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let mask_bit = GenDiag::try_from(record[1])?;
            info!(
                "GetGenDiagMsk Dev:{} config:{:?} mask:{}",
                dev, mask_bit, record[2]
            );
            Ok(())
        });
        Ok(self.command(
            Cmd::GetGenDiagMsk,
            vec![self.dev, mask_bit as u8],
            callback,
            timeout,
        ))
    }

    // OCUV undercurrent/overcurrent fault thresholds, 8-bit

    pub fn set_ucurr_flt_thd(
        &mut self,
        threshold: u16,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let threshold = bit_field(threshold, 8)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            info!("SetUCurrFltThd Dev:{} value:0x{:04X}", dev, record[1]);
            Ok(())
        });
        Ok(self.command(
            Cmd::SetUCurrFltThd,
            vec![self.dev, threshold as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_ucurr_flt_thd(&mut self, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            info!("GetUCurrFltThd Dev:{} value:0x{:04X}", dev, record[1]);
            Ok(())
        });
        Ok(self.command(Cmd::GetUCurrFltThd, vec![self.dev], callback, timeout))
    }

    pub fn set_ocurr_flt_thd(
        &mut self,
        threshold: u16,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let threshold = bit_field(threshold, 8)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            info!("SetOCurrFltThd Dev:{} value:0x{:04X}", dev, record[1]);
            Ok(())
        });
        Ok(self.command(
            Cmd::SetOCurrFltThd,
            vec![self.dev, threshold as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_ocurr_flt_thd(&mut self, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            info!("GetOCurrFltThd Dev:{} value:0x{:04X}", dev, record[1]);
            Ok(())
        });
        Ok(self.command(Cmd::GetOCurrFltThd, vec![self.dev], callback, timeout))
    }

    // BAL_SETTINGS driver state

    pub fn set_bal_state(
        &mut self,
        cell: u8,
        state: u8,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let cell = CellNum::try_from(cell)?;
        let state = BalSwitch::try_from(state)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let cell = CellNum::try_from(record[1])?;
            let state = BalSwitch::try_from(record[2])?;
            info!("SetBalState Dev:{} Cell:{} {:?}", dev, cell.value(), state);
            Ok(())
        });
        Ok(self.command(
            Cmd::SetBalState,
            vec![self.dev, cell.value(), state as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_bal_state(&mut self, cell: u8, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let cell = CellNum::try_from(cell)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let cell = CellNum::try_from(record[1])?;
            let state = BalSwitch::try_from(record[2])?;
            info!("GetBalState Dev:{} Cell:{} {:?}", dev, cell.value(), state);
            Ok(())
        });
        Ok(self.command(
            Cmd::GetBalState,
            vec![self.dev, cell.value()],
            callback,
            timeout,
        ))
    }

    // AVM_CONFIG diagnosis resistor masks

    pub fn set_diag_res_mask(
        &mut self,
        avm_mask: u8,
        resistor_mask: u8,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let avm_mask = AuxVoltDiag::try_from(avm_mask)?;
        let resistor_mask = DiagResistorMask::try_from(resistor_mask)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let avm_mask = AuxVoltDiag::try_from(record[1])?;
            let resistor_mask = DiagResistorMask::try_from(record[2])?;
            info!(
                "SetDiagResMskFlg Dev:{} config:{:?} mask:{:?}",
                dev, avm_mask, resistor_mask
            );
            Ok(())
        });
        Ok(self.command(
            Cmd::SetDiagResMskFlg,
            vec![self.dev, avm_mask as u8, resistor_mask as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_diag_res_mask(
        &mut self,
        avm_mask: u8,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let avm_mask = AuxVoltDiag::try_from(avm_mask)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let avm_mask = AuxVoltDiag::try_from(record[1])?;
            let resistor_mask = DiagResistorMask::try_from(record[2])?;
            info!(
                "GetDiagResMskFlg Dev:{} config:{:?} mask:{:?}",
                dev, avm_mask, resistor_mask
            );
            Ok(())
        });
        Ok(self.command(
            Cmd::GetDiagResMskFlg,
            vec![self.dev, avm_mask as u8],
            callback,
            timeout,
        ))
    }

    // Watchdog extension

    pub fn set_extend_wdg(
        &mut self,
        enable: bool,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            info!("SetExtendWdg Dev:{} enable:{}", dev, record[1]);
            Ok(())
        });
        Ok(self.command(
            Cmd::SetExtendWdg,
            vec![self.dev, enable as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_extend_wdg(&mut self, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            info!("GetExtendWdg Dev:{} enable:{}", dev, record[1]);
            Ok(())
        });
        Ok(self.command(Cmd::GetExtendWdg, vec![self.dev], callback, timeout))
    }

    // Sleep mode activation

    pub fn set_activate_sleep_mode(
        &mut self,
        enable: bool,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            info!("SetActivateSleepMode Dev:{} enable:{}", dev, record[1]);
            Ok(())
        });
        Ok(self.command(
            Cmd::SetActivateSleepMode,
            vec![self.dev, enable as u8],
            callback,
            timeout,
        ))
    }

    pub fn get_activate_sleep_mode(&mut self, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 2)?;
            info!("GetActivateSleepMode Dev:{} enable:{}", dev, record[1]);
            Ok(())
        });
        Ok(self.command(Cmd::GetActivateSleepMode, vec![self.dev], callback, timeout))
    }

    // Cell and block voltage measurements

    pub fn get_cell_measure(
        &mut self,
        cell: u8,
        timeout: Duration,
    ) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let cell = CellNum::try_from(cell)?;
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 4)?;
            let cell = CellNum::try_from(record[1])?;
            let value = ((record[2] as u16) << 8) | record[3] as u16;
            info!(
                "GetCellMeasure Dev:{} Cell:{} value:0x{:04X}",
                dev,
                cell.value(),
                value
            );
            Ok(())
        });
        Ok(self.command(
            Cmd::GetCellMeasure,
            vec![self.dev, cell.value()],
            callback,
            timeout,
        ))
    }

    pub fn get_block_measure(&mut self, timeout: Duration) -> DiagResult<Arc<Mutex<Iocbi>>> {
        let dev = self.dev;
        let callback: IocbiCallback = Box::new(move |cmd| {
            let record = expect_status(dev, cmd, 3)?;
            let value = word(record);
            info!("GetBlockMeasure Dev:{} value:0x{:04X}", dev, value);
            Ok(())
        });
        Ok(self.command(Cmd::GetBlockMeasure, vec![self.dev], callback, timeout))
    }
}
