// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Policy session that authorizes the TPM 2.0 field-upgrade start command.
//!
//! The vendor start command is authorized by the platform hierarchy policy.
//! Either the caller loads a session that satisfies it, or the session is
//! created here: the platform policy is set to "PolicyCommandCode
//! (FieldUpgradeStartVendor)" and a fresh session is bound to that command
//! code. Creating the policy requires an empty platform authorization.

use crate::UpdateError;
use crate::dispatch::Dispatcher;
use crate::logging::log_event;
use crate::state::TpmState;
use tpm_crypt::Csprng;
use tpm_protocol::SHA256_DIGEST_SIZE;
use tpm_protocol::marshal::MarshalError;
use tpm_protocol::tpm20proto;
use tpm_protocol::tpm20proto::AlgIdEnum;
use tpm_protocol::tpm20proto::Capabilities;
use tpm_protocol::tpm20proto::CommandCodeEnum;
use tpm_protocol::tpm20proto::ResponseCode;
use tpm_protocol::tpm20proto::Tpm2bDigest;
use tpm_protocol::tpm20proto::TpmsAuthCommand;
use tpm_tis::TpmTransport;
use tracing::Level;

const CALLER_NONCE_SIZE: usize = 16;

/// The session authorizing the start command, and who owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PolicySession {
    /// Loaded by the caller. Left alone.
    Supplied(u32),
    /// Created for this update. Flushed if the start command fails.
    Created(u32),
}

impl PolicySession {
    pub(crate) fn handle(self) -> u32 {
        match self {
            PolicySession::Supplied(handle) | PolicySession::Created(handle) => handle,
        }
    }
}

/// `SHA256(0^32 || TPM_CC_PolicyCommandCode || TPM_CC_FieldUpgradeStartVendor)`
pub(crate) fn field_upgrade_policy_digest() -> Result<[u8; SHA256_DIGEST_SIZE], UpdateError> {
    tpm_crypt::sha256_parts(&[
        &[0; SHA256_DIGEST_SIZE],
        &(CommandCodeEnum::PolicyCommandCode as u32).to_be_bytes(),
        &(CommandCodeEnum::FieldUpgradeStartVendor as u32).to_be_bytes(),
    ])
    .map_err(UpdateError::Crypt)
}

/// Checks that `handle` names a policy session the TPM has loaded.
pub(crate) fn validate_policy_session<T: TpmTransport>(
    tpm: &mut Dispatcher<T>,
    handle: u32,
) -> Result<(), UpdateError> {
    if tpm20proto::handle_type(handle) != tpm20proto::TPM20_HT_POLICY_SESSION {
        return Err(UpdateError::PolicyHandleOutOfRange { handle });
    }

    let mut property = (tpm20proto::TPM20_HT_LOADED_SESSION as u32) << 24;
    loop {
        let reply = tpm.execute(&tpm20proto::GetCapabilityCmd {
            capability: tpm20proto::TPM20_CAP_HANDLES,
            property,
            property_count: tpm20proto::MAX_CAP_HANDLES as u32,
        })?;
        let Capabilities::Handles(list) = &reply.capability_data.data else {
            return Err(UpdateError::invalid_reply(
                CommandCodeEnum::GetCapability as u32,
                MarshalError::Fail {
                    what: "TPM_CAP",
                    value: reply.capability_data.data.capability(),
                },
            ));
        };
        let handles = list.as_slice();
        if handles.contains(&handle) {
            return Ok(());
        }
        match handles.last() {
            Some(&last) if reply.more_data => property = last + 1,
            _ => break,
        }
    }

    log_event!(
        tpm.logger(),
        Level::ERROR,
        "policy session {:#x} is not loaded",
        handle
    );
    Err(UpdateError::PolicySessionNotLoaded { handle })
}

/// Sets the platform policy to the field-upgrade policy and starts a session
/// that satisfies it.
pub(crate) fn create_policy_session<T: TpmTransport>(
    tpm: &mut Dispatcher<T>,
    state: &TpmState,
    rng: &mut Csprng,
) -> Result<PolicySession, UpdateError> {
    if !state.platform_hierarchy_enabled {
        return Err(UpdateError::PlatformHierarchyDisabled);
    }

    let mut nonce = [0u8; CALLER_NONCE_SIZE];
    rng.fill(&mut nonce).map_err(UpdateError::Crypt)?;
    let nonce = Tpm2bDigest::new(&nonce)
        .map_err(|err| UpdateError::serialize(CommandCodeEnum::StartAuthSession as u32, err))?;
    let session = tpm.execute(&tpm20proto::StartAuthSessionCmd::policy(
        nonce,
        AlgIdEnum::SHA256 as u16,
    ))?;
    let handle = session.session_handle;

    if let Err(err) = bind_field_upgrade_policy(tpm, handle) {
        flush_session(tpm, handle);
        return Err(err);
    }

    log_event!(
        tpm.logger(),
        Level::INFO,
        "created field-upgrade policy session {:#x}",
        handle
    );
    Ok(PolicySession::Created(handle))
}

fn bind_field_upgrade_policy<T: TpmTransport>(
    tpm: &mut Dispatcher<T>,
    handle: u32,
) -> Result<(), UpdateError> {
    tpm.execute(&tpm20proto::PolicyCommandCodeCmd {
        policy_session: handle,
        code: CommandCodeEnum::FieldUpgradeStartVendor as u32,
    })?;

    let digest = field_upgrade_policy_digest()?;
    let auth_policy = Tpm2bDigest::new(&digest)
        .map_err(|err| UpdateError::serialize(CommandCodeEnum::SetPrimaryPolicy as u32, err))?;
    let result = tpm.execute(&tpm20proto::SetPrimaryPolicyCmd {
        auth_handle: tpm20proto::TPM20_RH_PLATFORM,
        auth: TpmsAuthCommand::empty_password(),
        auth_policy,
        hash_alg: AlgIdEnum::SHA256 as u16,
    });
    match result {
        Ok(()) => Ok(()),
        Err(err) => match err.tpm20_response_code() {
            Some(ResponseCode::BadAuth | ResponseCode::AuthFail) => {
                Err(UpdateError::PlatformAuthNotEmpty)
            }
            Some(ResponseCode::Hierarchy) => Err(UpdateError::PlatformHierarchyDisabled),
            _ => Err(err),
        },
    }
}

/// Flushes `handle`, logging instead of failing.
pub(crate) fn flush_session<T: TpmTransport>(tpm: &mut Dispatcher<T>, handle: u32) {
    if let Err(err) = tpm.execute(&tpm20proto::FlushContextCmd {
        flush_handle: handle,
    }) {
        tracing::warn!(
            handle = format_args!("{handle:#x}"),
            error = &err as &dyn std::error::Error,
            "failed to flush policy session"
        );
    }
}

/// Maps the policy failures of the start command onto
/// [`UpdateError::InvalidPolicySession`].
pub(crate) fn start_error(err: UpdateError) -> UpdateError {
    match err.tpm20_response_code() {
        Some(ResponseCode::PolicyFail | ResponseCode::Handle) => UpdateError::InvalidPolicySession,
        _ => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimTpm;
    use crate::sim::test_rng;
    use crate::state::TpmMode;
    use std::time::Duration;

    fn dispatcher(sim: SimTpm) -> Dispatcher<SimTpm> {
        Dispatcher::new(sim, Duration::from_secs(1))
    }

    fn operational() -> TpmState {
        TpmState {
            platform_hierarchy_enabled: true,
            ..TpmState::new(TpmMode::OperationalTpm20)
        }
    }

    #[test]
    fn policy_digest() {
        let digest = field_upgrade_policy_digest().unwrap();
        assert_eq!(digest.as_slice(), SimTpm::field_upgrade_policy().as_slice());
    }

    #[test]
    fn supplied_handle_range() {
        let mut tpm = dispatcher(SimTpm::tpm20());
        for handle in [0x0200_0000, 0x8000_0001, 0x4000_000c] {
            assert!(matches!(
                validate_policy_session(&mut tpm, handle),
                Err(UpdateError::PolicyHandleOutOfRange { handle: h }) if h == handle
            ));
        }
        // Rejected without asking the TPM.
        assert!(tpm.into_transport().received.is_empty());
    }

    #[test]
    fn supplied_handle_must_be_loaded() {
        let mut sim = SimTpm::tpm20();
        let handle = sim.add_policy_session(None);
        let mut tpm = dispatcher(sim);
        validate_policy_session(&mut tpm, handle).unwrap();
        assert!(matches!(
            validate_policy_session(&mut tpm, handle + 1),
            Err(UpdateError::PolicySessionNotLoaded { .. })
        ));
    }

    #[test]
    fn created_session_satisfies_the_platform_policy() {
        let mut tpm = dispatcher(SimTpm::tpm20());
        let session = create_policy_session(&mut tpm, &operational(), &mut test_rng()).unwrap();
        assert!(matches!(session, PolicySession::Created(_)));

        let sim = tpm.into_transport();
        assert_eq!(
            sim.platform_policy.as_deref(),
            Some(SimTpm::field_upgrade_policy().as_slice())
        );
        assert_eq!(sim.sessions.len(), 1);
        assert_eq!(sim.sessions[0].handle, session.handle());
        assert_eq!(
            sim.sessions[0].policy_code,
            Some(CommandCodeEnum::FieldUpgradeStartVendor as u32)
        );
    }

    #[test]
    fn platform_auth_not_empty_flushes_the_session() {
        let mut tpm = dispatcher(SimTpm {
            platform_auth_empty: false,
            ..SimTpm::tpm20()
        });
        assert!(matches!(
            create_policy_session(&mut tpm, &operational(), &mut test_rng()),
            Err(UpdateError::PlatformAuthNotEmpty)
        ));
        let sim = tpm.into_transport();
        assert!(sim.sessions.is_empty());
        assert_eq!(
            sim.command_codes().last(),
            Some(&(CommandCodeEnum::FlushContext as u32))
        );
    }

    #[test]
    fn platform_hierarchy_disabled() {
        // Known up front from the state.
        let mut tpm = dispatcher(SimTpm::tpm20());
        let state = TpmState {
            platform_hierarchy_enabled: false,
            ..operational()
        };
        assert!(matches!(
            create_policy_session(&mut tpm, &state, &mut test_rng()),
            Err(UpdateError::PlatformHierarchyDisabled)
        ));
        assert!(tpm.into_transport().received.is_empty());

        // Reported by the TPM.
        let mut tpm = dispatcher(SimTpm {
            ph_enable: false,
            ..SimTpm::tpm20()
        });
        assert!(matches!(
            create_policy_session(&mut tpm, &operational(), &mut test_rng()),
            Err(UpdateError::PlatformHierarchyDisabled)
        ));
        assert!(tpm.into_transport().sessions.is_empty());
    }

    #[test]
    fn start_policy_failures() {
        let failed = |response_code| UpdateError::TpmCommand {
            command_debug_info: crate::dispatch::CommandDebugInfo {
                command_code: CommandCodeEnum::FieldUpgradeStartVendor as u32,
            },
            error: crate::dispatch::TpmCommandError::TpmCommandFailed { response_code },
        };
        assert!(matches!(
            start_error(failed(0x99d)),
            UpdateError::InvalidPolicySession
        ));
        assert!(matches!(
            start_error(failed(0x98b)),
            UpdateError::InvalidPolicySession
        ));
        assert_eq!(start_error(failed(0x1c4)).tpm_response_code(), Some(0x1c4));
    }
}
