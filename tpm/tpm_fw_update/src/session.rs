// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The update session: the operations hosting glue calls.

use crate::UpdateError;
use crate::config::Configuration;
use crate::config::UpdateConfig;
use crate::dispatch::Dispatcher;
use crate::image::FirmwareImage;
use crate::image::ImageClassification;
use crate::image::classify;
use crate::image::classify_image;
use crate::logging::Logger;
use crate::logging::log_event;
use crate::policy;
use crate::state;
use crate::state::TpmFamily;
use crate::state::TpmMode;
use crate::state::TpmState;
use crate::tpm12auth;
use crate::update;
use crate::update::StartAuthorization;
use tpm_crypt::Csprng;
use tpm_protocol::marshal::ReadCursor;
use tpm_protocol::marshal::Unmarshal;
use tpm_protocol::tpm20proto;
use tpm_protocol::tpm20proto::CommandCodeEnum;
use tpm_protocol::tpm20proto::TpmtHa;
use tpm_protocol::vendor::FirmwareVersion;
use tpm_protocol::vendor::OperationMode;
use tpm_protocol::vendor::VendorProperty;
use tpm_tis::TpmTransport;
use tracing::Level;

/// Largest `TPMT_HA` the TPM may report as the start hash.
const MAX_START_HASH_SIZE: usize = size_of::<u16>() + tpm20proto::MAX_DIGEST_SIZE;

/// Loader operation mode, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationModeDetails {
    /// The raw mode byte.
    pub mode: u8,
    /// Regular TPM firmware is running.
    pub operational: bool,
    /// The loader is accepting firmware blocks.
    pub update: bool,
    /// The loader is accepting firmware blocks after an interrupted update.
    pub recovery: bool,
    /// The installed firmware image is intact.
    pub firmware_valid: bool,
    /// A restart is needed to activate freshly installed firmware.
    pub restart_required: bool,
}

impl From<OperationMode> for OperationModeDetails {
    fn from(mode: OperationMode) -> Self {
        Self {
            mode: mode.0,
            operational: mode.is_operational(),
            update: mode.is_update(),
            recovery: mode.is_recovery(),
            firmware_valid: mode.firmware_valid(),
            restart_required: mode.is_restart_required(),
        }
    }
}

/// Read-only diagnostic snapshot of a TPM 2.0 with a firmware-update loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareDetails {
    /// Running firmware version.
    pub firmware_version: FirmwareVersion,
    /// Version being installed. Only reported while the firmware is invalid.
    pub new_firmware_version: Option<FirmwareVersion>,
    /// Key group the TPM belongs to.
    pub key_group_id: u32,
    /// Digest of the manifest the running update was started with.
    pub start_hash: Option<TpmtHa>,
    /// Loader operation mode.
    pub operation_mode: OperationModeDetails,
}

/// A connection to one TPM for the purpose of updating its firmware.
///
/// Owns the transport for its whole lifetime. Every operation derives the
/// TPM state afresh, so an operation that failed on a transport timeout
/// before the update started can simply be called again.
pub struct UpdateSession<T> {
    tpm: Dispatcher<T>,
    config: UpdateConfig,
    rng: Csprng,
    auth: StartAuthorization,
}

impl<T: TpmTransport> UpdateSession<T> {
    /// Takes ownership of a connected transport. The random number generator
    /// is seeded from the system.
    pub fn new(transport: T, config: UpdateConfig) -> Result<Self, UpdateError> {
        let rng = Csprng::new().map_err(UpdateError::Crypt)?;
        Ok(Self::with_rng(transport, config, rng))
    }

    /// Like [`Self::new`] with a caller-provided generator.
    pub fn with_rng(transport: T, config: UpdateConfig, rng: Csprng) -> Self {
        Self {
            tpm: Dispatcher::new(transport, config.command_timeout),
            config,
            rng,
            auth: StartAuthorization::default(),
        }
    }

    /// Ends the session and hands the transport back for disconnection.
    pub fn into_transport(self) -> T {
        self.tpm.into_transport()
    }

    /// Reads the TPM state.
    pub fn get_state(&mut self) -> Result<TpmState, UpdateError> {
        state::discover(&mut self.tpm)
    }

    /// Checks whether `image` can be installed. Issues no field-upgrade
    /// command.
    pub fn check_image(&mut self, image: &[u8]) -> Result<ImageClassification, UpdateError> {
        let state = state::discover(&mut self.tpm)?;
        state.require_updatable()?;
        let classification = classify(&state, image, &self.config.manifest_keys);
        log_event!(
            self.tpm.logger(),
            Level::INFO,
            "image check: {:?}",
            classification
        );
        Ok(classification)
    }

    /// Installs `image`, or abandons the update in progress when `image` is
    /// `None`.
    ///
    /// The image is authenticated and classified again, whatever an earlier
    /// [`Self::check_image`] returned.
    pub fn set_image(&mut self, image: Option<&[u8]>) -> Result<(), UpdateError> {
        if image.is_some_and(<[u8]>::is_empty) {
            return Err(UpdateError::InvalidParameter("empty firmware image"));
        }
        let state = state::discover(&mut self.tpm)?;
        let Some(image) = image else {
            return update::abandon(&mut self.tpm, &self.config, &state);
        };
        state.require_updatable()?;

        let image = FirmwareImage::authenticate(image, &self.config.manifest_keys)
            .map_err(|err| {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "firmware image rejected"
                );
                UpdateError::ImageInvalid(err.reason())
            })?;
        match classify_image(&state, &image) {
            ImageClassification::Valid(flags) => {
                log_event!(self.tpm.logger(), Level::INFO, "image is valid: {:?}", flags)
            }
            ImageClassification::Invalid(reason) => return Err(UpdateError::ImageInvalid(reason)),
            ImageClassification::Blocked => return Err(UpdateError::ImageBlocked),
        }

        update::run_update(
            &mut self.tpm,
            &self.config,
            &mut self.rng,
            &state,
            &image,
            &self.auth,
        )
    }

    /// Applies a runtime setting.
    pub fn configure(&mut self, configuration: Configuration) -> Result<(), UpdateError> {
        match configuration {
            Configuration::OwnerAuth(owner_auth) => {
                let state = state::discover(&mut self.tpm)?;
                if !state.infineon {
                    return Err(UpdateError::UnsupportedVendor);
                }
                if !state.chip_supported {
                    return Err(UpdateError::UnsupportedChip);
                }
                if state.family() != TpmFamily::Tpm12 {
                    return Err(UpdateError::InvalidParameter(
                        "owner authorization applies to TPM1.2 only",
                    ));
                }
                if !state.owner_present {
                    return Err(UpdateError::Tpm12NoOwner);
                }
                tpm12auth::check_dictionary_attack(&mut self.tpm)?;
                tpm12auth::verify_owner_auth(&mut self.tpm, &mut self.rng, &owner_auth)?;
                self.auth.owner_auth = Some(owner_auth);
                log_event!(self.tpm.logger(), Level::INFO, "owner authorization set");
            }
            Configuration::PolicySession(handle) => {
                let state = state::discover(&mut self.tpm)?;
                match state.mode {
                    TpmMode::FailureModeTpm20 => return Err(UpdateError::Tpm20FailureMode),
                    _ if state.family() == TpmFamily::Tpm12 => {
                        if handle != 0 {
                            return Err(UpdateError::InvalidParameter(
                                "policy sessions apply to TPM2.0 only",
                            ));
                        }
                    }
                    _ => {
                        if handle != 0 {
                            policy::validate_policy_session(&mut self.tpm, handle)?;
                        }
                        self.auth.policy_session = (handle != 0).then_some(handle);
                    }
                }
            }
            Configuration::Logging {
                sink,
                add_time_stamps,
            } => self.tpm.set_logger(Logger::new(sink, add_time_stamps)),
        }
        Ok(())
    }

    /// Reads the loader diagnostics.
    pub fn get_details(&mut self) -> Result<FirmwareDetails, UpdateError> {
        let state = state::discover(&mut self.tpm)?;
        if state.mode == TpmMode::FailureModeTpm20 {
            return Err(UpdateError::Tpm20FailureMode);
        }
        let operation_mode = match state.operation_mode {
            Some(mode) if state.family() == TpmFamily::Tpm20 && state.chip_supported => mode,
            _ => return Err(UpdateError::Unsupported),
        };

        let new_firmware_version = if operation_mode.firmware_valid() {
            None
        } else {
            state::optional_vendor_property(&mut self.tpm, VendorProperty::NewFirmwareVersion)?
        };
        let start_hash = self.start_hash()?;

        Ok(FirmwareDetails {
            firmware_version: state.firmware_version,
            new_firmware_version,
            key_group_id: state.key_group_id,
            start_hash,
            operation_mode: operation_mode.into(),
        })
    }

    fn start_hash(&mut self) -> Result<Option<TpmtHa>, UpdateError> {
        let buffer = state::optional(state::vendor_property_buffer(
            &mut self.tpm,
            VendorProperty::FuStartHashDigest,
        ))?;
        let Some(buffer) = buffer.filter(|buffer| !buffer.is_empty()) else {
            return Ok(None);
        };
        if buffer.len() > MAX_START_HASH_SIZE {
            log_event!(
                self.tpm.logger(),
                Level::WARN,
                "start hash of {} bytes exceeds {} bytes, omitted",
                buffer.len(),
                MAX_START_HASH_SIZE
            );
            return Ok(None);
        }
        let invalid =
            |err| UpdateError::invalid_reply(CommandCodeEnum::GetCapability as u32, err);
        let mut cursor = ReadCursor::new(buffer.as_bytes()).map_err(invalid)?;
        TpmtHa::unmarshal(&mut cursor).map(Some).map_err(invalid)
    }
}
