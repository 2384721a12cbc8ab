// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM state discovery.
//!
//! The state is rebuilt from live capability queries at the start of every
//! public operation and never cached. A TPM 1.2 answers the first TPM 2.0
//! query with a TPM 1.2 response tag, which is how the family is told apart.

use crate::UpdateError;
use crate::dispatch::Dispatcher;
use crate::dispatch::TpmCommandError;
use crate::logging::log_event;
use tpm_protocol::command::ResponseValidationError;
use tpm_protocol::marshal::MarshalError;
use tpm_protocol::marshal::ReadCursor;
use tpm_protocol::marshal::Unmarshal;
use tpm_protocol::tpm12proto;
use tpm_protocol::tpm12proto::ResultCode;
use tpm_protocol::tpm20proto;
use tpm_protocol::tpm20proto::Capabilities;
use tpm_protocol::tpm20proto::CommandCodeEnum;
use tpm_protocol::tpm20proto::ResponseCode;
use tpm_protocol::tpm20proto::Tpm2bMaxBuffer;
use tpm_protocol::tpm20proto::TpmaStartupClear;
use tpm_protocol::vendor::FirmwareVersion;
use tpm_protocol::vendor::IFX_MANUFACTURER;
use tpm_protocol::vendor::OperationMode;
use tpm_protocol::vendor::VendorProperty;
use tpm_tis::TpmTransport;
use tracing::Level;

/// TPM command-set generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[expect(missing_docs)] // Self-describing names.
pub enum TpmFamily {
    Tpm12,
    Tpm20,
}

/// The mode the TPM is in. Determines which update path applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmMode {
    /// TPM 1.2 firmware is running.
    OperationalTpm12,
    /// TPM 2.0 firmware is running.
    OperationalTpm20,
    /// The TPM 2.0 loader reports a mode that accepts no update.
    NonOperationalTpm20,
    /// The TPM 2.0 loader is accepting firmware blocks.
    FirmwareUpdateModeTpm20,
    /// The TPM 2.0 loader is accepting firmware blocks after an interrupted
    /// update.
    FirmwareRecoveryModeTpm20,
    /// The TPM 2.0 is in failure mode.
    FailureModeTpm20,
    /// The TPM 1.2 firmware is invalid.
    InvalidFirmwareModeTpm12,
}

impl TpmMode {
    /// The command-set generation the mode belongs to.
    pub fn family(self) -> TpmFamily {
        match self {
            TpmMode::OperationalTpm12 | TpmMode::InvalidFirmwareModeTpm12 => TpmFamily::Tpm12,
            TpmMode::OperationalTpm20
            | TpmMode::NonOperationalTpm20
            | TpmMode::FirmwareUpdateModeTpm20
            | TpmMode::FirmwareRecoveryModeTpm20
            | TpmMode::FailureModeTpm20 => TpmFamily::Tpm20,
        }
    }

    /// Whether regular TPM firmware is running.
    pub fn is_operational(self) -> bool {
        matches!(self, TpmMode::OperationalTpm12 | TpmMode::OperationalTpm20)
    }

    /// Whether the TPM 2.0 loader is accepting firmware blocks.
    pub fn is_loader_update(self) -> bool {
        matches!(
            self,
            TpmMode::FirmwareUpdateModeTpm20 | TpmMode::FirmwareRecoveryModeTpm20
        )
    }
}

/// Remaining field upgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCounters {
    /// Remaining updates.
    pub counter: u32,
    /// Remaining updates to the running version. Loader only.
    pub counter_self: u32,
}

impl UpdateCounters {
    /// Value of a counter the TPM does not report.
    pub const UNSUPPORTED: u32 = 0xFFFF_FFFF;

    /// The lower of both counters. An unsupported counter never wins over a
    /// supported one.
    pub fn effective(&self) -> u32 {
        self.counter.min(self.counter_self)
    }

    /// What the effective counter means for the next update.
    pub fn availability(&self) -> UpdateAvailability {
        match self.effective() {
            0 => UpdateAvailability::Blocked,
            1 => UpdateAvailability::LastUpdate,
            Self::UNSUPPORTED => UpdateAvailability::Unavailable,
            n => UpdateAvailability::Available(n),
        }
    }
}

impl Default for UpdateCounters {
    fn default() -> Self {
        Self {
            counter: Self::UNSUPPORTED,
            counter_self: Self::UNSUPPORTED,
        }
    }
}

/// Whether another field upgrade can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAvailability {
    /// No updates remain.
    Blocked,
    /// Exactly one update remains.
    LastUpdate,
    /// This many updates remain.
    Available(u32),
    /// The TPM does not report a counter.
    Unavailable,
}

/// Snapshot of the TPM taken at the start of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmState {
    /// Current mode. Implies the family.
    pub mode: TpmMode,
    /// Manufactured by Infineon.
    pub infineon: bool,
    /// Implements the vendor field-upgrade interface.
    pub chip_supported: bool,
    /// TPM 1.2 has an owner.
    pub owner_present: bool,
    /// TPM 1.2 is disabled.
    pub disabled: bool,
    /// TPM 1.2 is deactivated.
    pub deactivated: bool,
    /// TPM 1.2 accepts the update under deferred physical presence.
    pub deferred_physical_presence: bool,
    /// No update can start before a restart.
    pub restart_required: bool,
    /// TPM 2.0 loader operation mode. `None` without a loader.
    pub operation_mode: Option<OperationMode>,
    /// TPM 2.0 platform hierarchy is enabled.
    pub platform_hierarchy_enabled: bool,
    /// Running firmware version.
    pub firmware_version: FirmwareVersion,
    /// Key group the TPM belongs to.
    pub key_group_id: u32,
    /// Remaining field upgrades.
    pub counters: UpdateCounters,
}

impl TpmState {
    pub(crate) fn new(mode: TpmMode) -> Self {
        Self {
            mode,
            infineon: false,
            chip_supported: false,
            owner_present: false,
            disabled: false,
            deactivated: false,
            deferred_physical_presence: false,
            restart_required: false,
            operation_mode: None,
            platform_hierarchy_enabled: false,
            firmware_version: FirmwareVersion::default(),
            key_group_id: 0,
            counters: UpdateCounters::default(),
        }
    }

    /// The command-set generation.
    pub fn family(&self) -> TpmFamily {
        self.mode.family()
    }

    /// Whether a TPM 2.0 firmware-update loader is present.
    pub fn has_loader(&self) -> bool {
        self.operation_mode.is_some()
    }

    /// Whether the running firmware is invalid or being replaced.
    pub fn in_recovery(&self) -> bool {
        self.mode.is_loader_update() || self.mode == TpmMode::InvalidFirmwareModeTpm12
    }

    /// What the counters mean for the next update.
    pub fn availability(&self) -> UpdateAvailability {
        self.counters.availability()
    }

    /// Fails unless the TPM can take part in a field upgrade at all.
    pub(crate) fn require_updatable(&self) -> Result<(), UpdateError> {
        if self.mode == TpmMode::FailureModeTpm20 {
            return Err(UpdateError::Tpm20FailureMode);
        }
        if !self.infineon {
            return Err(UpdateError::UnsupportedVendor);
        }
        if !self.chip_supported {
            return Err(UpdateError::UnsupportedChip);
        }
        if self.restart_required {
            return Err(UpdateError::RestartRequired);
        }
        Ok(())
    }
}

/// Reads the current state.
pub(crate) fn discover<T: TpmTransport>(tpm: &mut Dispatcher<T>) -> Result<TpmState, UpdateError> {
    let state = match tpm_property(tpm, tpm20proto::TPM20_PT_MANUFACTURER) {
        Ok(manufacturer) => discover_tpm20(tpm, manufacturer)?,
        Err(err) if answered_by_tpm12(&err) => discover_tpm12(tpm)?,
        Err(err) if err.tpm20_response_code() == Some(ResponseCode::Failure) => {
            TpmState::new(TpmMode::FailureModeTpm20)
        }
        Err(err) => return Err(err),
    };

    log_event!(
        tpm.logger(),
        Level::INFO,
        "TPM state: {:?}, firmware {}, key group {:#x}, counters {}/{}, restart required: {}",
        state.mode,
        state.firmware_version,
        state.key_group_id,
        state.counters.counter,
        state.counters.counter_self,
        state.restart_required
    );
    Ok(state)
}

fn answered_by_tpm12(err: &UpdateError) -> bool {
    matches!(
        err,
        UpdateError::TpmCommand {
            error: TpmCommandError::InvalidResponse(ResponseValidationError::HeaderTagMismatch {
                response_tag: tpm12proto::TPM12_TAG_RSP_COMMAND,
                ..
            }),
            ..
        }
    )
}

/// Reads a single `TPM_CAP_TPM_PROPERTIES` value.
fn tpm_property<T: TpmTransport>(
    tpm: &mut Dispatcher<T>,
    property: u32,
) -> Result<u32, UpdateError> {
    let reply = tpm.execute(&tpm20proto::GetCapabilityCmd {
        capability: tpm20proto::TPM20_CAP_TPM_PROPERTIES,
        property,
        property_count: 1,
    })?;
    if let Capabilities::TpmProperties(list) = &reply.capability_data.data {
        if let Some(tagged) = list.as_slice().iter().find(|p| p.property == property) {
            return Ok(tagged.value);
        }
    }
    Err(UpdateError::invalid_reply(
        CommandCodeEnum::GetCapability as u32,
        MarshalError::Fail {
            what: "TPM_PT",
            value: property,
        },
    ))
}

fn invalid_capability(error: MarshalError) -> UpdateError {
    UpdateError::invalid_reply(CommandCodeEnum::GetCapability as u32, error)
}

/// Reads the undecoded buffer of a single vendor property.
pub(crate) fn vendor_property_buffer<T: TpmTransport>(
    tpm: &mut Dispatcher<T>,
    property: VendorProperty,
) -> Result<Tpm2bMaxBuffer, UpdateError> {
    let reply = tpm.execute(&tpm20proto::GetCapabilityCmd::vendor_property(property))?;
    let Capabilities::VendorProperties(list) = &reply.capability_data.data else {
        return Err(invalid_capability(MarshalError::Fail {
            what: "TPM_CAP",
            value: reply.capability_data.data.capability(),
        }));
    };
    list.as_slice().first().copied().ok_or_else(|| {
        invalid_capability(MarshalError::Fail {
            what: "TPML_MAX_BUFFER",
            value: 0,
        })
    })
}

/// Reads and decodes a single vendor property.
pub(crate) fn vendor_property<T: TpmTransport, V: Unmarshal>(
    tpm: &mut Dispatcher<T>,
    property: VendorProperty,
) -> Result<V, UpdateError> {
    let buffer = vendor_property_buffer(tpm, property)?;
    let mut cursor = ReadCursor::new(buffer.as_bytes()).map_err(invalid_capability)?;
    V::unmarshal(&mut cursor).map_err(invalid_capability)
}

/// Maps `TPM_RC_VALUE` (property not implemented) to `None`.
pub(crate) fn optional<V>(result: Result<V, UpdateError>) -> Result<Option<V>, UpdateError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.tpm20_response_code() == Some(ResponseCode::Value) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Like [`vendor_property`], mapping `TPM_RC_VALUE` to `None`.
pub(crate) fn optional_vendor_property<T: TpmTransport, V: Unmarshal>(
    tpm: &mut Dispatcher<T>,
    property: VendorProperty,
) -> Result<Option<V>, UpdateError> {
    optional(vendor_property(tpm, property))
}

fn discover_tpm20<T: TpmTransport>(
    tpm: &mut Dispatcher<T>,
    manufacturer: u32,
) -> Result<TpmState, UpdateError> {
    let mut state = TpmState::new(TpmMode::OperationalTpm20);
    if manufacturer != IFX_MANUFACTURER {
        tracing::info!(manufacturer = format_args!("{manufacturer:#x}"), "not an Infineon TPM");
        return Ok(state);
    }
    state.infineon = true;

    let operation_mode =
        match optional_vendor_property::<_, u8>(tpm, VendorProperty::FuOperationMode) {
            Ok(mode) => mode.map(OperationMode),
            Err(err) if err.tpm20_response_code() == Some(ResponseCode::Failure) => {
                state.mode = TpmMode::FailureModeTpm20;
                return Ok(state);
            }
            Err(err) => return Err(err),
        };
    state.operation_mode = operation_mode;

    if operation_mode.is_none_or(OperationMode::is_operational) {
        // Only running TPM firmware reports a self-test result.
        let test = tpm.execute(&tpm20proto::GetTestResultCmd)?;
        if ResponseCode::from_u32(test.test_result) == Some(ResponseCode::Failure) {
            state.mode = TpmMode::FailureModeTpm20;
            return Ok(state);
        }
    }

    let Some(counter) = optional_vendor_property::<_, u32>(tpm, VendorProperty::FuCounter)? else {
        tracing::info!("TPM does not implement the field-upgrade properties");
        return Ok(state);
    };
    state.chip_supported = true;
    state.counters.counter = counter;
    if operation_mode.is_some() {
        state.counters.counter_self = vendor_property(tpm, VendorProperty::FuCounterSelf)?;
    }
    state.firmware_version = vendor_property(tpm, VendorProperty::FirmwareVersion)?;
    state.key_group_id = vendor_property(tpm, VendorProperty::KeyGroupId)?;

    state.mode = match operation_mode {
        None => TpmMode::OperationalTpm20,
        Some(mode) if mode.is_operational() => TpmMode::OperationalTpm20,
        Some(mode) if mode.is_update() => TpmMode::FirmwareUpdateModeTpm20,
        Some(mode) if mode.is_recovery() => TpmMode::FirmwareRecoveryModeTpm20,
        Some(mode) => {
            state.restart_required = mode.is_restart_required();
            TpmMode::NonOperationalTpm20
        }
    };

    if state.mode == TpmMode::OperationalTpm20 {
        let startup_clear = tpm_property(tpm, tpm20proto::TPM20_PT_STARTUP_CLEAR)?;
        state.platform_hierarchy_enabled = TpmaStartupClear::from(startup_clear).ph_enable();
    }

    if state.counters.effective() == UpdateCounters::UNSUPPORTED {
        state.restart_required = true;
    }
    Ok(state)
}

/// Replaces the TPM 1.2 result codes that describe the TPM state rather than
/// the failing command with their named outcome.
pub(crate) fn tpm12_named(err: UpdateError) -> UpdateError {
    match err.tpm12_result_code() {
        Some(ResultCode::FailedSelfTest) => UpdateError::Tpm12FailedSelfTest,
        Some(ResultCode::Deactivated) => UpdateError::Tpm12Deactivated,
        Some(ResultCode::Disabled) => UpdateError::Tpm12Disabled,
        _ => err,
    }
}

/// Reads a TPM 1.2 capability and decodes it as `V`.
pub(crate) fn tpm12_capability<T: TpmTransport, V: Unmarshal>(
    tpm: &mut Dispatcher<T>,
    cmd: tpm12proto::GetCapabilityCmd,
) -> Result<V, UpdateError> {
    let invalid = |error| {
        UpdateError::invalid_reply(tpm12proto::OrdinalEnum::GetCapability as u32, error)
    };
    let blob = tpm.execute(&cmd).map_err(tpm12_named)?;
    let mut cursor = ReadCursor::new(blob.as_bytes()).map_err(invalid)?;
    V::unmarshal(&mut cursor).map_err(invalid)
}

fn discover_tpm12<T: TpmTransport>(tpm: &mut Dispatcher<T>) -> Result<TpmState, UpdateError> {
    let mut state = TpmState::new(TpmMode::OperationalTpm12);

    let version: tpm12proto::CapVersionInfo =
        tpm12_capability(tpm, tpm12proto::GetCapabilityCmd::version_val())?;
    if u32::from_be_bytes(version.tpm_vendor_id) != IFX_MANUFACTURER {
        tracing::info!(vendor = ?version.tpm_vendor_id, "not an Infineon TPM");
        return Ok(state);
    }
    state.infineon = true;

    let permanent: tpm12proto::PermanentFlags = tpm12_capability(
        tpm,
        tpm12proto::GetCapabilityCmd::flag(tpm12proto::TPM12_CAP_FLAG_PERMANENT),
    )?;
    let volatile: tpm12proto::StClearFlags = tpm12_capability(
        tpm,
        tpm12proto::GetCapabilityCmd::flag(tpm12proto::TPM12_CAP_FLAG_VOLATILE),
    )?;
    state.owner_present = tpm12_capability(
        tpm,
        tpm12proto::GetCapabilityCmd::property(tpm12proto::TPM12_CAP_PROP_OWNER),
    )?;
    state.disabled = permanent.disable;
    state.deactivated = permanent.deactivated || volatile.deactivated;

    let info = match tpm.execute(&tpm12proto::FieldUpgradeInfoCmd) {
        Ok(info) => info,
        Err(err) if err.tpm12_result_code() == Some(ResultCode::BadOrdinal) => {
            tracing::info!("TPM does not implement the field-upgrade command");
            return Ok(state);
        }
        Err(err) => return Err(tpm12_named(err)),
    };
    state.chip_supported = true;
    state.firmware_version = info.firmware_version;
    state.key_group_id = info.key_group_id;
    state.deferred_physical_presence = info.deferred_physical_presence();
    state.counters.counter = match info.field_upgrade_counter {
        tpm12proto::IfxFieldUpgradeInfo::COUNTER_UNAVAILABLE => UpdateCounters::UNSUPPORTED,
        counter => counter.into(),
    };
    state.restart_required = state.counters.counter == UpdateCounters::UNSUPPORTED;
    if !info.firmware_valid() {
        state.mode = TpmMode::InvalidFirmwareModeTpm12;
    }
    Ok(state)
}
