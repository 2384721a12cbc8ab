// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command framing shared by TPM 1.2 and TPM 2.0.
//!
//! Both generations use the same 10-byte header layout (`tag`, `size`,
//! `command_code`/`response_code`) and differ only in the tag values, so the
//! header handling and reply validation live here and each command type only
//! describes its own parameters.

use crate::TPM_HEADER_SIZE;
use crate::marshal::MarshalError;
use crate::marshal::ReadCursor;
use crate::marshal::WriteCursor;
use crate::new_u16_be;
use crate::new_u32_be;
use crate::packed_nums::*;
use static_assertions::const_assert_eq;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Offset of the `size` field inside the command header.
const SIZE_FIELD_OFFSET: usize = 2;

/// Errors from validating a reply against the command that produced it.
#[expect(missing_docs)] // Self-describing names.
#[derive(Debug, Error)]
pub enum ResponseValidationError {
    #[error("response size is too small to fit into the buffer")]
    ResponseSizeTooSmall,
    #[error("size {size} specified in the response header does not match the received size {received}")]
    HeaderResponseSizeMismatch { size: u32, received: usize },
    #[error("unexpected tag {response_tag:#x} specified in the response header, expected: {expected_tag:#x}, command succeeded: {command_succeeded}")]
    HeaderTagMismatch {
        response_tag: u16,
        expected_tag: u16,
        command_succeeded: bool,
    },
    #[error("failed to unmarshal the response parameters")]
    Parameters(#[source] MarshalError),
}

/// Command header.
#[expect(missing_docs)] // Self-describing names.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CmdHeader {
    pub tag: u16_be,
    pub size: u32_be,
    pub command_code: u32_be,
}

const_assert_eq!(size_of::<CmdHeader>(), TPM_HEADER_SIZE);

impl CmdHeader {
    /// Construct a header whose size is filled in once the body is written.
    pub const fn new(tag: u16, command_code: u32) -> Self {
        Self {
            tag: new_u16_be(tag),
            size: new_u32_be(TPM_HEADER_SIZE as u32),
            command_code: new_u32_be(command_code),
        }
    }
}

/// Response header.
#[expect(missing_docs)] // Self-describing names.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReplyHeader {
    pub tag: u16_be,
    pub size: u32_be,
    pub response_code: u32_be,
}

const_assert_eq!(size_of::<ReplyHeader>(), TPM_HEADER_SIZE);

impl ReplyHeader {
    /// Reads the header at the front of `reply`.
    pub fn parse(reply: &[u8]) -> Result<Self, ResponseValidationError> {
        Self::read_from_prefix(reply)
            .map(|(header, _)| header)
            .map_err(|_| ResponseValidationError::ResponseSizeTooSmall)
    }

    /// Performs the command-agnostic checks:
    /// - the size in the header matches the number of bytes received
    /// - the tag matches `success_tag` when the command succeeded, or one of
    ///   `failure_tag`/`success_tag` when it did not
    ///
    /// Returns Ok(bool) if the validation passes. The bool value indicates
    /// whether the response code is zero (success).
    pub fn base_validation(
        &self,
        received: usize,
        success_tag: u16,
        failure_tag: u16,
    ) -> Result<bool, ResponseValidationError> {
        let command_succeeded = self.response_code.get() == 0;

        if self.size.get() as usize != received {
            Err(ResponseValidationError::HeaderResponseSizeMismatch {
                size: self.size.get(),
                received,
            })?
        }

        let tag = self.tag.get();
        let tag_ok = if command_succeeded {
            tag == success_tag
        } else {
            // A failed command carries no sessions, but some parts echo the
            // request tag regardless.
            tag == failure_tag || tag == success_tag
        };
        if !tag_ok {
            Err(ResponseValidationError::HeaderTagMismatch {
                response_tag: tag,
                expected_tag: if command_succeeded {
                    success_tag
                } else {
                    failure_tag
                },
                command_succeeded,
            })?
        }

        Ok(command_succeeded)
    }
}

/// Outcome of a command that made it to the TPM and back.
#[derive(Debug)]
pub enum Reply<R> {
    /// The TPM executed the command.
    Succeeded(R),
    /// The TPM rejected the command with a non-zero response code.
    Failed {
        /// Raw response code from the reply header.
        response_code: u32,
    },
}

/// A TPM command with a typed reply.
pub trait TpmCommand {
    /// Decoded response parameters.
    type Reply;

    /// Request tag written into the command header.
    fn tag(&self) -> u16;

    /// Command code or ordinal.
    fn command_code(&self) -> u32;

    /// Tag expected on a successful reply.
    fn reply_tag(&self) -> u16;

    /// Tag a TPM uses on an error reply.
    fn failure_tag(&self) -> u16;

    /// Writes everything following the header.
    fn marshal_body(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError>;

    /// Decodes everything following the header of a successful reply.
    fn unmarshal_reply(&self, cursor: &mut ReadCursor<'_>) -> Result<Self::Reply, MarshalError>;

    /// Serializes the full command into `buffer` and returns its length.
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, MarshalError> {
        let mut cursor = WriteCursor::new(buffer)?;
        cursor.write_struct(&CmdHeader::new(self.tag(), self.command_code()))?;
        self.marshal_body(&mut cursor)?;
        let size = cursor.position();
        cursor.patch_u32(SIZE_FIELD_OFFSET, size as u32)?;
        Ok(size)
    }

    /// Validates the header of `reply` and, on success, decodes its
    /// parameters.
    fn validate_reply(&self, reply: &[u8]) -> Result<Reply<Self::Reply>, ResponseValidationError> {
        let header = ReplyHeader::parse(reply)?;
        let succeeded =
            header.base_validation(reply.len(), self.reply_tag(), self.failure_tag())?;
        if !succeeded {
            return Ok(Reply::Failed {
                response_code: header.response_code.get(),
            });
        }

        let mut cursor = ReadCursor::new_unchecked(&reply[TPM_HEADER_SIZE..]);
        let reply = self
            .unmarshal_reply(&mut cursor)
            .map_err(ResponseValidationError::Parameters)?;
        Ok(Reply::Succeeded(reply))
    }
}
