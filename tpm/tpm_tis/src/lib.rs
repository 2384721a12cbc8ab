// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM Interface Specification (TIS) FIFO transport.
//!
//! [`TisTransport`] drives the register-level command/response exchange over
//! a [`TisBus`] and exposes it through the [`TpmTransport`] trait consumed by
//! the command dispatcher. The physical bus is half-duplex, so a transport
//! owns its bus exclusively and every operation takes `&mut self`.

#![forbid(unsafe_code)]

mod config;
pub mod registers;
mod transport;

pub use config::DEFAULT_BASE_ADDRESS;
pub use config::INFINEON_VENDOR_ID;
pub use config::TisConfig;
pub use config::TisTimeouts;
pub use transport::TisTransport;

use std::time::Duration;
use thiserror::Error;

/// Raw register access to the TIS address space.
///
/// Addresses are absolute physical addresses. Register values are
/// little-endian as defined by TIS.
pub trait TisBus {
    /// Reads an 8-bit register.
    fn read_u8(&mut self, address: u64) -> u8;
    /// Writes an 8-bit register.
    fn write_u8(&mut self, address: u64, value: u8);
    /// Reads a naturally aligned 16-bit register.
    fn read_u16(&mut self, address: u64) -> u16;
    /// Reads a naturally aligned 32-bit register.
    fn read_u32(&mut self, address: u64) -> u32;
    /// Blocks for `duration` between two polls.
    fn delay(&mut self, duration: Duration);
}

/// A connected TPM that exchanges marshalled command and response buffers.
pub trait TpmTransport {
    /// Sends `command` and copies the complete response into `response`.
    ///
    /// `timeout` bounds the wait for the TPM to produce the response. On
    /// error, `response` is left untouched. Returns the response size.
    fn transmit(
        &mut self,
        command: &[u8],
        response: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TisError>;
}

/// The condition a transport was polling for when it gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[expect(missing_docs)] // Self-describing names.
pub enum TisWait {
    CommandReady,
    BurstCount,
    StatusValid,
    DataAvailable,
}

/// Transport failures. None of these originate from the TPM command
/// processor.
#[derive(Debug, Error)]
pub enum TisError {
    /// The caller handed in an unusable argument.
    #[error("invalid parameter: {0}")]
    BadParameter(&'static str),
    /// The command does not fit the FIFO page.
    #[error("command of {size} bytes exceeds the TPM page")]
    CommandTooLarge {
        /// Size of the rejected command.
        size: usize,
    },
    /// The access register does not report valid contents.
    #[error("TIS access register invalid: {access:#04x}")]
    AccessInvalid {
        /// Raw `TPM_ACCESS_x` value.
        access: u8,
    },
    /// The device is not from the required vendor.
    #[error("unsupported TPM vendor {vendor_id:#06x}")]
    UnsupportedVendor {
        /// Vendor id read from `DID_VID`.
        vendor_id: u16,
    },
    /// The TPM did not grant the requested locality in time.
    #[error("locality {locality} not granted")]
    LocalityNotGranted {
        /// Requested locality.
        locality: u8,
    },
    /// A status poll exceeded its timeout.
    #[error("timed out waiting for {waiting_for:?}")]
    Timeout {
        /// What the transport was waiting for.
        waiting_for: TisWait,
    },
    /// The TPM still expected data after the last command byte.
    #[error("TPM did not accept the command")]
    CommandNotAccepted,
    /// The response header declares an impossible size.
    #[error("invalid response size {size}, capacity {capacity}")]
    InvalidResponseSize {
        /// Size from the response header.
        size: u32,
        /// Bytes available to hold the response.
        capacity: usize,
    },
    /// The TPM offered more bytes than the response header declared.
    #[error("response longer than its declared size")]
    ResponseOverrun,
}

impl TisError {
    /// Whether the failure was a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TisError::Timeout { .. })
    }
}
