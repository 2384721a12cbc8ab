// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The destructive part of a field upgrade: start, block transfer, finalize.
//!
//! Once the start command succeeds the TPM is committed to the update. From
//! then on every TPM-reported error is surfaced as is and nothing is retried.
//! The only way back is the abandon command.

use crate::UpdateError;
use crate::config::AbandonUpdateMode;
use crate::config::UpdateConfig;
use crate::dispatch::Dispatcher;
use crate::image::FirmwareImage;
use crate::logging::Logger;
use crate::logging::log_event;
use crate::policy;
use crate::policy::PolicySession;
use crate::state::TpmFamily;
use crate::state::TpmMode;
use crate::state::TpmState;
use crate::state::tpm12_named;
use crate::tpm12auth;
use crate::tpm12auth::OiapSession;
use tpm_crypt::Csprng;
use tpm_protocol::SHA1_DIGEST_SIZE;
use tpm_protocol::marshal::MarshalError;
use tpm_protocol::tpm12proto;
use tpm_protocol::tpm12proto::OrdinalEnum;
use tpm_protocol::tpm12proto::ResultCode;
use tpm_protocol::tpm20proto::CommandCodeEnum;
use tpm_protocol::tpm20proto::Tpm2bDigest;
use tpm_protocol::tpm20proto::Tpm2bMaxBuffer;
use tpm_protocol::vendor;
use tpm_protocol::vendor::SealedSecret;
use tpm_tis::TpmTransport;
use tracing::Level;

/// Size of the update secret sealed to the key group.
pub(crate) const UPDATE_SECRET_SIZE: usize = 32;

/// Authorization configured on the session for the start command.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct StartAuthorization {
    /// TPM 2.0 policy session loaded by the caller.
    pub policy_session: Option<u32>,
    /// TPM 1.2 owner authorization.
    pub owner_auth: Option<[u8; SHA1_DIGEST_SIZE]>,
}

/// Start command parameters shared by both families.
struct StartParams {
    manifest: Tpm2bMaxBuffer,
    sealed_secret: SealedSecret,
}

/// Installs `image` on the TPM described by `state`.
pub(crate) fn run_update<T: TpmTransport>(
    tpm: &mut Dispatcher<T>,
    config: &UpdateConfig,
    rng: &mut Csprng,
    state: &TpmState,
    image: &FirmwareImage<'_>,
    auth: &StartAuthorization,
) -> Result<(), UpdateError> {
    let mut secret = [0u8; UPDATE_SECRET_SIZE];
    rng.fill(&mut secret).map_err(UpdateError::Crypt)?;
    let sealed = tpm_crypt::encrypt_oaep_tcpa(rng, image.key_group_modulus, &secret)
        .map_err(UpdateError::Crypt)?;

    let start_code = start_command_code(state.mode)?;
    let serialize = |err: MarshalError| UpdateError::serialize(start_code, err);
    let params = StartParams {
        manifest: Tpm2bMaxBuffer::new(image.manifest).map_err(serialize)?,
        sealed_secret: SealedSecret::new(&sealed).map_err(serialize)?,
    };

    log_event!(
        tpm.logger(),
        Level::INFO,
        "starting firmware update to {} ({} blocks)",
        image.version,
        image.block_count()
    );
    match state.mode {
        TpmMode::OperationalTpm20 => start_tpm20(tpm, config, rng, state, auth, params)?,
        TpmMode::FirmwareUpdateModeTpm20 | TpmMode::FirmwareRecoveryModeTpm20 => {
            let result = tpm.execute_with_timeout(
                &vendor::FieldUpgradeManifestVendorCmd {
                    manifest: params.manifest,
                    sealed_secret: params.sealed_secret,
                },
                config.field_upgrade_timeout,
            );
            if let Err(err) = result {
                abandon_after_failed_start(tpm, config);
                return Err(err);
            }
        }
        TpmMode::OperationalTpm12 | TpmMode::InvalidFirmwareModeTpm12 => {
            start_tpm12(tpm, config, rng, state, auth, params)?
        }
        TpmMode::NonOperationalTpm20 | TpmMode::FailureModeTpm20 => {
            return Err(UpdateError::Unsupported);
        }
    }

    let family = state.family();
    let total = image.block_count();
    let mut progress = ProgressReporter::default();
    progress.report(tpm.logger(), 0)?;
    for (index, block) in image.blocks().enumerate() {
        send_block(tpm, config, family, &secret, index as u32, block)?;
        progress.report(tpm.logger(), ((index + 1) * 100 / total) as u8)?;
    }

    match family {
        TpmFamily::Tpm20 => tpm.execute_with_timeout(
            &vendor::FieldUpgradeFinalizeVendorCmd,
            config.field_upgrade_timeout,
        )?,
        TpmFamily::Tpm12 => tpm.execute_with_timeout(
            &tpm12proto::FieldUpgradeCompleteCmd,
            config.field_upgrade_timeout,
        )?,
    }
    log_event!(
        tpm.logger(),
        Level::INFO,
        "firmware update to {} complete, restart the TPM",
        image.version
    );
    Ok(())
}

fn start_command_code(mode: TpmMode) -> Result<u32, UpdateError> {
    let code = match mode {
        TpmMode::OperationalTpm20 => CommandCodeEnum::FieldUpgradeStartVendor as u32,
        TpmMode::FirmwareUpdateModeTpm20 | TpmMode::FirmwareRecoveryModeTpm20 => {
            CommandCodeEnum::FieldUpgradeManifestVendor as u32
        }
        TpmMode::OperationalTpm12 | TpmMode::InvalidFirmwareModeTpm12 => {
            OrdinalEnum::FieldUpgrade as u32
        }
        TpmMode::NonOperationalTpm20 | TpmMode::FailureModeTpm20 => {
            return Err(UpdateError::Unsupported);
        }
    };
    Ok(code)
}

fn start_tpm20<T: TpmTransport>(
    tpm: &mut Dispatcher<T>,
    config: &UpdateConfig,
    rng: &mut Csprng,
    state: &TpmState,
    auth: &StartAuthorization,
    params: StartParams,
) -> Result<(), UpdateError> {
    let session = match auth.policy_session {
        Some(handle) => {
            policy::validate_policy_session(tpm, handle)?;
            PolicySession::Supplied(handle)
        }
        None => policy::create_policy_session(tpm, state, rng)?,
    };

    let result = tpm.execute_with_timeout(
        &vendor::FieldUpgradeStartVendorCmd {
            policy_session: session.handle(),
            manifest: params.manifest,
            sealed_secret: params.sealed_secret,
        },
        config.field_upgrade_timeout,
    );
    if let Err(err) = result {
        if let PolicySession::Created(handle) = session {
            policy::flush_session(tpm, handle);
        }
        abandon_after_failed_start(tpm, config);
        return Err(policy::start_error(err));
    }
    Ok(())
}

fn start_tpm12<T: TpmTransport>(
    tpm: &mut Dispatcher<T>,
    config: &UpdateConfig,
    rng: &mut Csprng,
    state: &TpmState,
    auth: &StartAuthorization,
    params: StartParams,
) -> Result<(), UpdateError> {
    let mut cmd = tpm12proto::FieldUpgradeStartCmd {
        manifest: params.manifest,
        sealed_secret: params.sealed_secret,
        auth: None,
    };
    if !state.owner_present {
        if !state.deferred_physical_presence {
            return Err(UpdateError::Tpm12DeferredPpRequired);
        }
        tpm.execute_with_timeout(&cmd, config.field_upgrade_timeout)
            .map_err(tpm12_named)?;
        return Ok(());
    }

    let owner_auth = auth
        .owner_auth
        .ok_or(UpdateError::Tpm12OwnerAuthRequired)?;
    if state.disabled || state.deactivated {
        log_event!(
            tpm.logger(),
            Level::WARN,
            "TPM is disabled or deactivated, owner authorization check deferred"
        );
    } else {
        tpm12auth::check_dictionary_attack(tpm)?;
        tpm12auth::verify_owner_auth(tpm, rng, &owner_auth)?;
    }

    let session = OiapSession::open(tpm, rng)?;
    cmd.auth = Some(session.auth_command());
    let reply = tpm
        .execute_authorized(
            &cmd,
            config.field_upgrade_timeout,
            session.authorize(&owner_auth),
        )
        .map_err(|err| match err.tpm12_result_code() {
            Some(ResultCode::AuthFail) => UpdateError::Tpm12InvalidOwnerAuth,
            Some(ResultCode::DefendLockRunning) => UpdateError::Tpm12DaActive,
            _ => tpm12_named(err),
        })?;
    if let Some(reply) = reply {
        session.verify_reply(&owner_auth, OrdinalEnum::FieldUpgrade, &reply)?;
    }
    Ok(())
}

/// Issues the abandon command after a rejected start if configured to. The
/// start error is what the caller sees, so a failure here is only logged.
fn abandon_after_failed_start<T: TpmTransport>(tpm: &mut Dispatcher<T>, config: &UpdateConfig) {
    if config.abandon_update_mode != AbandonUpdateMode::IfManifestCallFails {
        return;
    }
    match tpm.execute_with_timeout(
        &vendor::FieldUpgradeAbandonVendorCmd,
        config.field_upgrade_timeout,
    ) {
        Ok(()) => log_event!(
            tpm.logger(),
            Level::WARN,
            "start command failed, firmware update abandoned"
        ),
        Err(err) => {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to abandon the firmware update"
            );
        }
    }
}

/// The block tag: `HMAC-SHA1(secret[..20], index || block)`.
pub(crate) fn block_tag(
    secret: &[u8; UPDATE_SECRET_SIZE],
    index: u32,
    block: &[u8],
) -> Result<[u8; SHA1_DIGEST_SIZE], UpdateError> {
    tpm_crypt::hmac_sha1_parts(&secret[..SHA1_DIGEST_SIZE], &[&index.to_be_bytes(), block])
        .map_err(UpdateError::Crypt)
}

fn send_block<T: TpmTransport>(
    tpm: &mut Dispatcher<T>,
    config: &UpdateConfig,
    family: TpmFamily,
    secret: &[u8; UPDATE_SECRET_SIZE],
    index: u32,
    block: &[u8],
) -> Result<(), UpdateError> {
    let tag = block_tag(secret, index, block)?;
    tracing::debug!(index, size = block.len(), "sending firmware block");
    match family {
        TpmFamily::Tpm20 => {
            let serialize = |err| {
                UpdateError::serialize(CommandCodeEnum::FieldUpgradeDataVendor as u32, err)
            };
            tpm.execute_with_timeout(
                &vendor::FieldUpgradeDataVendorCmd {
                    data: Tpm2bMaxBuffer::new(block).map_err(serialize)?,
                    block_tag: Tpm2bDigest::new(&tag).map_err(serialize)?,
                },
                config.field_upgrade_timeout,
            )
        }
        TpmFamily::Tpm12 => tpm.execute_with_timeout(
            &tpm12proto::FieldUpgradeUpdateCmd {
                block: Tpm2bMaxBuffer::new(block)
                    .map_err(|err| UpdateError::serialize(OrdinalEnum::FieldUpgrade as u32, err))?,
                block_tag: tag,
            },
            config.field_upgrade_timeout,
        ),
    }
}

/// Issues the abandon command. Only a TPM 2.0 loader that is accepting
/// blocks can abandon an update.
pub(crate) fn abandon<T: TpmTransport>(
    tpm: &mut Dispatcher<T>,
    config: &UpdateConfig,
    state: &TpmState,
) -> Result<(), UpdateError> {
    if !state.mode.is_loader_update() {
        return Err(UpdateError::InvalidParameter(
            "no firmware update in progress to abandon",
        ));
    }
    tpm.execute_with_timeout(
        &vendor::FieldUpgradeAbandonVendorCmd,
        config.field_upgrade_timeout,
    )?;
    log_event!(tpm.logger(), Level::WARN, "firmware update abandoned");
    Ok(())
}

/// Progress reporter used for every update. Callers cannot substitute their
/// own, and no abort reason is ever reported.
#[derive(Debug, Default)]
struct ProgressReporter {
    last: Option<u8>,
}

impl ProgressReporter {
    fn report(&mut self, logger: &Logger, percent: u8) -> Result<(), UpdateError> {
        if percent > 100 {
            return Err(UpdateError::InvalidParameter("progress above 100 percent"));
        }
        if self.last == Some(percent) {
            return Ok(());
        }
        self.last = Some(percent);
        log_event!(logger, Level::INFO, "firmware update progress: {}%", percent);
        Ok(())
    }
}
