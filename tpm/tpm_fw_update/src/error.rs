// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::dispatch::CommandDebugInfo;
use crate::dispatch::TpmCommandError;
use crate::image::InvalidReason;
use thiserror::Error;
use tpm_crypt::CryptError;
use tpm_protocol::command::ResponseValidationError;
use tpm_protocol::marshal::MarshalError;
use tpm_protocol::tpm12proto::ResultCode;
use tpm_protocol::tpm20proto::ResponseCode;

/// Errors returned by the update orchestrator.
///
/// Outcomes a caller has to react to individually are named variants. Every
/// other TPM-reported error is surfaced verbatim through
/// [`UpdateError::TpmCommand`].
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The caller passed an argument that is not valid in the current state.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// A command round trip failed.
    #[error("TPM command error - command code: {:#x}", .command_debug_info.command_code)]
    TpmCommand {
        /// The failing command.
        command_debug_info: CommandDebugInfo,
        /// What went wrong.
        #[source]
        error: TpmCommandError,
    },
    /// A cryptographic operation failed.
    #[error("cryptographic operation failed")]
    Crypt(#[source] CryptError),
    /// The TPM was not manufactured by the supported vendor.
    #[error("unsupported TPM vendor")]
    UnsupportedVendor,
    /// The TPM does not implement the vendor field-upgrade interface.
    #[error("unsupported TPM chip")]
    UnsupportedChip,
    /// The operation does not apply to this TPM.
    #[error("operation not supported by the TPM")]
    Unsupported,
    /// The TPM has to be restarted before it accepts another update.
    #[error("TPM restart required")]
    RestartRequired,
    /// The TPM 2.0 is in failure mode.
    #[error("TPM2.0 is in failure mode")]
    Tpm20FailureMode,
    /// The TPM 1.2 failed its self test.
    #[error("TPM1.2 failed its self test")]
    Tpm12FailedSelfTest,
    /// TPM 1.2 dictionary attack mitigation is running.
    #[error("TPM1.2 dictionary attack lockout is active")]
    Tpm12DaActive,
    /// The TPM 1.2 has no owner.
    #[error("TPM1.2 has no owner")]
    Tpm12NoOwner,
    /// The TPM 1.2 has no owner and deferred physical presence is not
    /// asserted.
    #[error("TPM1.2 deferred physical presence required")]
    Tpm12DeferredPpRequired,
    /// The TPM 1.2 is deactivated.
    #[error("TPM1.2 is deactivated")]
    Tpm12Deactivated,
    /// The TPM 1.2 is disabled.
    #[error("TPM1.2 is disabled")]
    Tpm12Disabled,
    /// The owner authorization hash was rejected.
    #[error("TPM1.2 owner authorization is invalid")]
    Tpm12InvalidOwnerAuth,
    /// The TPM 1.2 has an owner and no owner authorization was configured.
    #[error("TPM1.2 owner authorization required")]
    Tpm12OwnerAuthRequired,
    /// The response authorization of an owner-authorized command did not
    /// verify.
    #[error("TPM1.2 response authorization mismatch")]
    Tpm12ResponseAuthorization,
    /// The handle is not a policy session handle.
    #[error("policy session handle {handle:#x} out of range")]
    PolicyHandleOutOfRange {
        /// The rejected handle.
        handle: u32,
    },
    /// The policy session is not loaded in the TPM.
    #[error("policy session {handle:#x} is not loaded")]
    PolicySessionNotLoaded {
        /// The rejected handle.
        handle: u32,
    },
    /// The TPM refused the policy session for the field upgrade.
    #[error("policy session does not authorize the field upgrade")]
    InvalidPolicySession,
    /// Platform authorization is set, so no policy session can be created.
    #[error("platform authorization is not the empty buffer")]
    PlatformAuthNotEmpty,
    /// The platform hierarchy is disabled.
    #[error("platform hierarchy is disabled")]
    PlatformHierarchyDisabled,
    /// The image cannot be installed.
    #[error("firmware image is invalid: {0:?}")]
    ImageInvalid(InvalidReason),
    /// No field upgrades remain.
    #[error("firmware update blocked, no updates remaining")]
    ImageBlocked,
}

impl UpdateError {
    /// The raw response code, if the TPM reported the failure.
    pub fn tpm_response_code(&self) -> Option<u32> {
        match self {
            UpdateError::TpmCommand {
                error: TpmCommandError::TpmCommandFailed { response_code },
                ..
            } => Some(*response_code),
            _ => None,
        }
    }

    /// The response code reduced to a known TPM 2.0 code.
    pub fn tpm20_response_code(&self) -> Option<ResponseCode> {
        self.tpm_response_code().and_then(ResponseCode::from_u32)
    }

    /// The response code as a known TPM 1.2 result code.
    pub fn tpm12_result_code(&self) -> Option<ResultCode> {
        self.tpm_response_code().and_then(ResultCode::from_u32)
    }

    /// Whether the failure was a transport timeout. Non-destructive
    /// operations can be retried after one.
    pub fn is_transport_timeout(&self) -> bool {
        matches!(
            self,
            UpdateError::TpmCommand {
                error: TpmCommandError::TpmExecuteCommand(err),
                ..
            } if err.is_timeout()
        )
    }

    /// Builds the error for a command parameter that does not fit its wire
    /// buffer.
    pub(crate) fn serialize(command_code: u32, error: MarshalError) -> Self {
        UpdateError::TpmCommand {
            command_debug_info: CommandDebugInfo { command_code },
            error: TpmCommandError::Serialize(error),
        }
    }

    /// Builds the error for reply parameters that failed a second-stage
    /// decode (capability blobs, vendor properties).
    pub(crate) fn invalid_reply(command_code: u32, error: MarshalError) -> Self {
        UpdateError::TpmCommand {
            command_debug_info: CommandDebugInfo { command_code },
            error: TpmCommandError::InvalidResponse(ResponseValidationError::Parameters(error)),
        }
    }
}
