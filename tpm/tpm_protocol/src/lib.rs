// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM wire protocol for firmware field upgrade.
//!
//! The crate is split into a family-agnostic byte-cursor codec ([`marshal`]),
//! the command framing shared by both command-set generations ([`command`]),
//! and the TPM 1.2 and TPM 2.0 structures and commands needed for state
//! discovery and field upgrade ([`tpm12proto`], [`tpm20proto`], [`vendor`]).

#![forbid(unsafe_code)]

pub mod command;
pub mod marshal;
pub mod tpm12proto;
pub mod tpm20proto;
pub mod vendor;

/// Size of a TPM command or response page. Matches the TIS FIFO limit and
/// bounds every buffer on the transmit path.
pub const TPM_PAGE_SIZE: usize = 4096;

/// Size of the command and response header shared by TPM 1.2 and TPM 2.0.
pub const TPM_HEADER_SIZE: usize = 10;

/// Maximum size of a `TPM2B_MAX_BUFFER` and of a single firmware block.
pub const MAX_BUFFER_SIZE: usize = 1024;

/// Size of an RSA-2048 modulus, signature, or ciphertext in bytes.
pub const RSA_2048_MODULUS_SIZE: usize = 256;

/// SHA-1 digest size, also the size of TPM 1.2 nonces and authorization values.
pub const SHA1_DIGEST_SIZE: usize = 20;

/// SHA-256 digest size.
pub const SHA256_DIGEST_SIZE: usize = 32;

#[allow(non_camel_case_types)]
pub(crate) mod packed_nums {
    pub type u16_be = zerocopy::U16<zerocopy::BigEndian>;
    pub type u32_be = zerocopy::U32<zerocopy::BigEndian>;
}

pub(crate) const fn new_u16_be(val: u16) -> packed_nums::u16_be {
    packed_nums::u16_be::from_bytes(val.to_be_bytes())
}

pub(crate) const fn new_u32_be(val: u32) -> packed_nums::u32_be {
    packed_nums::u32_be::from_bytes(val.to_be_bytes())
}
