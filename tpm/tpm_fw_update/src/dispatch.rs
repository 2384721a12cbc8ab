// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-command round trips through a [`TpmTransport`].
//!
//! The dispatcher owns the transport and the command/response page pair for
//! the lifetime of a session. It keeps failures of the exchange itself
//! (serialization, transport, malformed replies) apart from failures the TPM
//! reports through a non-zero response code.

use crate::UpdateError;
use crate::logging::Logger;
use std::time::Duration;
use thiserror::Error;
use tpm_crypt::CryptError;
use tpm_protocol::TPM_PAGE_SIZE;
use tpm_protocol::command::Reply;
use tpm_protocol::command::ResponseValidationError;
use tpm_protocol::command::TpmCommand;
use tpm_protocol::marshal::MarshalError;
use tpm_tis::TisError;
use tpm_tis::TpmTransport;

/// Identifies the command that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDebugInfo {
    /// Command code or TPM 1.2 ordinal.
    pub command_code: u32,
}

/// Failure of a single command round trip.
#[derive(Debug, Error)]
pub enum TpmCommandError {
    /// The command did not fit the command page.
    #[error("failed to serialize the TPM command")]
    Serialize(#[source] MarshalError),
    /// The authorization value could not be computed.
    #[error("failed to authorize the TPM command")]
    Authorization(#[source] CryptError),
    /// The exchange with the device failed.
    #[error("failed to execute the TPM command")]
    TpmExecuteCommand(#[source] TisError),
    /// The reply is malformed or does not belong to the command.
    #[error("invalid response from the TPM command")]
    InvalidResponse(#[source] ResponseValidationError),
    /// The TPM executed the command and reported an error.
    #[error("TPM command failed, response code: {response_code:#x}")]
    TpmCommandFailed {
        /// Raw response code.
        response_code: u32,
    },
}

/// Executes TPM commands on an exclusively owned transport.
pub struct Dispatcher<T> {
    transport: T,
    command_buffer: Box<[u8; TPM_PAGE_SIZE]>,
    reply_buffer: Box<[u8; TPM_PAGE_SIZE]>,
    command_timeout: Duration,
    logger: Logger,
}

impl<T: TpmTransport> Dispatcher<T> {
    /// Takes ownership of `transport`. `command_timeout` bounds every command
    /// that is not given an explicit timeout.
    pub fn new(transport: T, command_timeout: Duration) -> Self {
        Self {
            transport,
            command_buffer: Box::new([0; TPM_PAGE_SIZE]),
            reply_buffer: Box::new([0; TPM_PAGE_SIZE]),
            command_timeout,
            logger: Logger::default(),
        }
    }

    /// Releases the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Timeout applied to commands without an explicit one.
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// The event sink shared by everything running on this dispatcher.
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Replaces the event sink.
    pub fn set_logger(&mut self, logger: Logger) {
        self.logger = logger;
    }

    /// Executes `cmd` with the default command timeout.
    pub fn execute<C: TpmCommand>(&mut self, cmd: &C) -> Result<C::Reply, UpdateError> {
        self.execute_with_timeout(cmd, self.command_timeout)
    }

    /// Executes `cmd`, waiting at most `timeout` for the response.
    pub fn execute_with_timeout<C: TpmCommand>(
        &mut self,
        cmd: &C,
        timeout: Duration,
    ) -> Result<C::Reply, UpdateError> {
        self.execute_authorized(cmd, timeout, |_| Ok(()))
    }

    /// Executes `cmd` after `authorize` has patched the serialized command.
    ///
    /// `authorize` sees exactly the bytes that go on the wire, so it can fill
    /// in an authorization value computed over the marshalled parameters.
    pub fn execute_authorized<C, F>(
        &mut self,
        cmd: &C,
        timeout: Duration,
        authorize: F,
    ) -> Result<C::Reply, UpdateError>
    where
        C: TpmCommand,
        F: FnOnce(&mut [u8]) -> Result<(), CryptError>,
    {
        let command_code = cmd.command_code();
        self.round_trip(cmd, timeout, authorize)
            .map_err(|error| UpdateError::TpmCommand {
                command_debug_info: CommandDebugInfo { command_code },
                error,
            })
    }

    fn round_trip<C, F>(
        &mut self,
        cmd: &C,
        timeout: Duration,
        authorize: F,
    ) -> Result<C::Reply, TpmCommandError>
    where
        C: TpmCommand,
        F: FnOnce(&mut [u8]) -> Result<(), CryptError>,
    {
        let command_code = cmd.command_code();
        let size = cmd
            .serialize_into(&mut self.command_buffer[..])
            .map_err(TpmCommandError::Serialize)?;
        authorize(&mut self.command_buffer[..size]).map_err(TpmCommandError::Authorization)?;

        tracing::trace!(command_code = format_args!("{command_code:#x}"), size, "sending command");
        let reply_size = self
            .transport
            .transmit(
                &self.command_buffer[..size],
                &mut self.reply_buffer[..],
                timeout,
            )
            .map_err(TpmCommandError::TpmExecuteCommand)?;

        let result = match cmd.validate_reply(&self.reply_buffer[..reply_size]) {
            Err(error) => Err(TpmCommandError::InvalidResponse(error)),
            Ok(Reply::Failed { response_code }) => {
                Err(TpmCommandError::TpmCommandFailed { response_code })
            }
            Ok(Reply::Succeeded(reply)) => Ok(reply),
        };

        match &result {
            Ok(_) => {
                tracing::debug!(
                    command_code = format_args!("{command_code:#x}"),
                    reply_size,
                    "command succeeded"
                );
            }
            Err(err) => {
                tracing::debug!(
                    command_code = format_args!("{command_code:#x}"),
                    reply_size,
                    error = err as &dyn std::error::Error,
                    "command failed"
                );
            }
        }
        self.logger.forward(
            tracing::Level::DEBUG,
            format_args!(
                "command {command_code:#x}: {} byte(s) sent, {reply_size} byte(s) received, {}",
                size,
                if result.is_ok() { "success" } else { "failure" }
            ),
        );
        result
    }
}
