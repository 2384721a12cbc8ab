// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM 1.2 owner authorization over OIAP.

use crate::UpdateError;
use crate::dispatch::Dispatcher;
use crate::logging::log_event;
use crate::state::tpm12_capability;
use crate::state::tpm12_named;
use tpm_crypt::CryptError;
use tpm_crypt::Csprng;
use tpm_protocol::SHA1_DIGEST_SIZE;
use tpm_protocol::TPM_HEADER_SIZE;
use tpm_protocol::tpm12proto;
use tpm_protocol::tpm12proto::AUTH1_COMMAND_TRAILER_SIZE;
use tpm_protocol::tpm12proto::Auth1Reply;
use tpm_protocol::tpm12proto::DaInfo;
use tpm_protocol::tpm12proto::OrdinalEnum;
use tpm_protocol::tpm12proto::ResultCode;
use tpm_protocol::tpm12proto::Tpm12AuthCommand;
use tpm_tis::TpmTransport;
use tracing::Level;

/// Offset of the ordinal in a command. The parameter digest starts here.
const ORDINAL_OFFSET: usize = 6;

/// An OIAP session opened for a single owner-authorized command. The
/// command does not continue the session, so the TPM closes it afterwards.
#[derive(Debug)]
pub(crate) struct OiapSession {
    auth_handle: u32,
    nonce_even: [u8; SHA1_DIGEST_SIZE],
    nonce_odd: [u8; SHA1_DIGEST_SIZE],
}

impl OiapSession {
    pub(crate) fn open<T: TpmTransport>(
        tpm: &mut Dispatcher<T>,
        rng: &mut Csprng,
    ) -> Result<Self, UpdateError> {
        let reply = tpm.execute(&tpm12proto::OiapCmd).map_err(tpm12_named)?;
        let mut nonce_odd = [0u8; SHA1_DIGEST_SIZE];
        rng.fill(&mut nonce_odd).map_err(UpdateError::Crypt)?;
        Ok(Self {
            auth_handle: reply.auth_handle,
            nonce_even: reply.nonce_even,
            nonce_odd,
        })
    }

    /// The authorization trailer. `auth` is filled in by
    /// [`Self::authorize`] once the command is serialized.
    pub(crate) fn auth_command(&self) -> Tpm12AuthCommand {
        Tpm12AuthCommand {
            auth_handle: self.auth_handle,
            nonce_odd: self.nonce_odd,
            continue_auth_session: false,
            auth: [0; SHA1_DIGEST_SIZE],
        }
    }

    /// Patches `authHMAC` into a serialized `AUTH1` command.
    pub(crate) fn authorize<'a>(
        &'a self,
        owner_auth: &'a [u8; SHA1_DIGEST_SIZE],
    ) -> impl FnOnce(&mut [u8]) -> Result<(), CryptError> + 'a {
        move |command| {
            let len = command.len();
            if len < TPM_HEADER_SIZE + AUTH1_COMMAND_TRAILER_SIZE {
                return Err(CryptError::BadParameter("AUTH1 command too short"));
            }
            let param_digest =
                tpm_crypt::sha1(&command[ORDINAL_OFFSET..len - AUTH1_COMMAND_TRAILER_SIZE])?;
            let auth = tpm_crypt::hmac_sha1_parts(
                owner_auth,
                &[&param_digest, &self.nonce_even, &self.nonce_odd, &[0]],
            )?;
            command[len - SHA1_DIGEST_SIZE..].copy_from_slice(&auth);
            Ok(())
        }
    }

    /// Checks `resAuth` of a successful reply.
    pub(crate) fn verify_reply<R>(
        &self,
        owner_auth: &[u8; SHA1_DIGEST_SIZE],
        ordinal: OrdinalEnum,
        reply: &Auth1Reply<R>,
    ) -> Result<(), UpdateError> {
        let param_digest = tpm_crypt::sha1_parts(&[
            &(ResultCode::Success as u32).to_be_bytes(),
            &(ordinal as u32).to_be_bytes(),
            reply.raw_params.as_bytes(),
        ])
        .map_err(UpdateError::Crypt)?;
        let expected = tpm_crypt::hmac_sha1_parts(
            owner_auth,
            &[
                &param_digest,
                &reply.auth.nonce_even,
                &self.nonce_odd,
                &[reply.auth.continue_auth_session as u8],
            ],
        )
        .map_err(UpdateError::Crypt)?;
        if expected != reply.auth.res_auth {
            return Err(UpdateError::Tpm12ResponseAuthorization);
        }
        Ok(())
    }
}

/// Fails with [`UpdateError::Tpm12DaActive`] while dictionary attack
/// mitigation locks out the owner.
pub(crate) fn check_dictionary_attack<T: TpmTransport>(
    tpm: &mut Dispatcher<T>,
) -> Result<(), UpdateError> {
    let info: DaInfo = tpm12_capability(
        tpm,
        tpm12proto::GetCapabilityCmd::da_logic(tpm12proto::TPM12_ET_OWNER),
    )?;
    if info.active {
        log_event!(
            tpm.logger(),
            Level::ERROR,
            "dictionary attack mitigation is active"
        );
        return Err(UpdateError::Tpm12DaActive);
    }
    Ok(())
}

/// Proves knowledge of `owner_auth` with an owner-authorized read that has
/// no side effects. A disabled or deactivated TPM cannot evaluate the
/// authorization, so the check passes and the start command decides later.
pub(crate) fn verify_owner_auth<T: TpmTransport>(
    tpm: &mut Dispatcher<T>,
    rng: &mut Csprng,
    owner_auth: &[u8; SHA1_DIGEST_SIZE],
) -> Result<(), UpdateError> {
    let session = OiapSession::open(tpm, rng)?;
    let cmd = tpm12proto::OwnerReadInternalPubCmd {
        key_handle: tpm12proto::TPM12_KH_EK,
        auth: Some(session.auth_command()),
    };
    let timeout = tpm.command_timeout();
    match tpm.execute_authorized(&cmd, timeout, session.authorize(owner_auth)) {
        Ok(reply) => session.verify_reply(owner_auth, OrdinalEnum::OwnerReadInternalPub, &reply),
        Err(err) => match err.tpm12_result_code() {
            Some(ResultCode::AuthFail) => {
                log_event!(tpm.logger(), Level::ERROR, "owner authorization rejected");
                Err(UpdateError::Tpm12InvalidOwnerAuth)
            }
            Some(ResultCode::DefendLockRunning) => Err(UpdateError::Tpm12DaActive),
            Some(ResultCode::Disabled | ResultCode::Deactivated) => {
                log_event!(
                    tpm.logger(),
                    Level::WARN,
                    "TPM is disabled or deactivated, owner authorization check deferred"
                );
                Ok(())
            }
            _ => Err(tpm12_named(err)),
        },
    }
}
