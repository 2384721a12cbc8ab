// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::logging::LogSink;
use std::time::Duration;
use tpm_protocol::RSA_2048_MODULUS_SIZE;
use tpm_protocol::SHA1_DIGEST_SIZE;

/// What to do when the TPM rejects the first field-upgrade command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AbandonUpdateMode {
    /// Surface the error and leave the TPM alone.
    #[default]
    NoAction,
    /// Issue the abandon command, then surface the error.
    IfManifestCallFails,
}

/// Static configuration of an update session.
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Reaction to a rejected start command.
    pub abandon_update_mode: AbandonUpdateMode,
    /// Moduli of the RSA-2048 keys trusted to sign firmware images. An image
    /// must verify against one of them.
    pub manifest_keys: Vec<[u8; RSA_2048_MODULUS_SIZE]>,
    /// Response timeout for state queries and session setup.
    pub command_timeout: Duration,
    /// Response timeout for the field-upgrade commands.
    pub field_upgrade_timeout: Duration,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            abandon_update_mode: AbandonUpdateMode::NoAction,
            manifest_keys: Vec::new(),
            command_timeout: Duration::from_secs(2 * 60),
            field_upgrade_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Runtime settings applied through `UpdateSession::configure`.
pub enum Configuration {
    /// TPM 2.0 policy session authorizing the field upgrade. Zero selects an
    /// automatically created session.
    PolicySession(u32),
    /// SHA-1 digest of the TPM 1.2 owner password.
    OwnerAuth([u8; SHA1_DIGEST_SIZE]),
    /// Installs or replaces the event sink.
    Logging {
        /// Receives every orchestrator event.
        sink: Box<dyn LogSink>,
        /// Prefix events with the seconds since the UNIX epoch.
        add_time_stamps: bool,
    },
}
