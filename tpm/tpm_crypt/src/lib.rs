// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cryptographic primitives used to authenticate and seal TPM firmware
//! updates.
//!
//! Every entry point validates its buffers before touching them and fails
//! with [`CryptError::BadParameter`] on misuse. A signature that does not
//! verify is reported as [`CryptError::VerifySignature`], never as a
//! parameter error, so callers can tell a tampered image from a bad call.

#![forbid(unsafe_code)]

mod pubkey;
mod rng;

pub use pubkey::OAEP_TCPA_LABEL;
pub use pubkey::PSS_SALT_SIZE;
pub use pubkey::RSA_PUBLIC_EXPONENT;
pub use pubkey::encrypt_oaep_tcpa;
pub use pubkey::verify_pss_sha256;
pub use rng::Csprng;

use hmac::Hmac;
use hmac::Mac;
use sha1::Sha1;
use sha2::Digest;
use sha2::Sha256;
use sha2::Sha384;
use sha2::Sha512;
use thiserror::Error;

/// SHA-1 digest size. Also the HMAC-SHA1 key and output size.
pub const SHA1_DIGEST_SIZE: usize = 20;
/// SHA-256 digest size.
pub const SHA256_DIGEST_SIZE: usize = 32;
/// SHA-384 digest size.
pub const SHA384_DIGEST_SIZE: usize = 48;
/// SHA-512 digest size.
pub const SHA512_DIGEST_SIZE: usize = 64;
/// RSA-2048 modulus size in bytes.
pub const RSA_2048_MODULUS_SIZE: usize = 256;

/// Crypto engine errors.
#[derive(Debug, Error)]
pub enum CryptError {
    /// A buffer was empty or had the wrong size.
    #[error("invalid parameter: {0}")]
    BadParameter(&'static str),
    /// The signature does not match the digest and key.
    #[error("signature verification failed")]
    VerifySignature,
    /// The RSA backend rejected the key or the operation.
    #[error("RSA operation failed")]
    Rsa(#[source] rsa::Error),
    /// The system entropy source failed.
    #[error("failed to gather entropy: {0}")]
    Random(getrandom::Error),
}

fn digest_parts<D: Digest, const N: usize>(parts: &[&[u8]]) -> Result<[u8; N], CryptError> {
    if parts.iter().all(|part| part.is_empty()) {
        return Err(CryptError::BadParameter("empty hash input"));
    }
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&hasher.finalize());
    Ok(out)
}

/// SHA-1 of `data`.
pub fn sha1(data: &[u8]) -> Result<[u8; SHA1_DIGEST_SIZE], CryptError> {
    digest_parts::<Sha1, SHA1_DIGEST_SIZE>(&[data])
}

/// SHA-1 over the concatenation of `parts`.
pub fn sha1_parts(parts: &[&[u8]]) -> Result<[u8; SHA1_DIGEST_SIZE], CryptError> {
    digest_parts::<Sha1, SHA1_DIGEST_SIZE>(parts)
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> Result<[u8; SHA256_DIGEST_SIZE], CryptError> {
    digest_parts::<Sha256, SHA256_DIGEST_SIZE>(&[data])
}

/// SHA-256 over the concatenation of `parts`.
pub fn sha256_parts(parts: &[&[u8]]) -> Result<[u8; SHA256_DIGEST_SIZE], CryptError> {
    digest_parts::<Sha256, SHA256_DIGEST_SIZE>(parts)
}

/// SHA-384 of `data`.
pub fn sha384(data: &[u8]) -> Result<[u8; SHA384_DIGEST_SIZE], CryptError> {
    digest_parts::<Sha384, SHA384_DIGEST_SIZE>(&[data])
}

/// SHA-512 of `data`.
pub fn sha512(data: &[u8]) -> Result<[u8; SHA512_DIGEST_SIZE], CryptError> {
    digest_parts::<Sha512, SHA512_DIGEST_SIZE>(&[data])
}

/// HMAC-SHA1 with a 20-byte key.
pub fn hmac_sha1(key: &[u8], message: &[u8]) -> Result<[u8; SHA1_DIGEST_SIZE], CryptError> {
    hmac_sha1_parts(key, &[message])
}

/// HMAC-SHA1 with a 20-byte key over the concatenation of `parts`.
pub fn hmac_sha1_parts(
    key: &[u8],
    parts: &[&[u8]],
) -> Result<[u8; SHA1_DIGEST_SIZE], CryptError> {
    if key.len() != SHA1_DIGEST_SIZE {
        return Err(CryptError::BadParameter("HMAC-SHA1 key must be 20 bytes"));
    }
    if parts.iter().all(|part| part.is_empty()) {
        return Err(CryptError::BadParameter("empty HMAC input"));
    }
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key)
        .map_err(|_| CryptError::BadParameter("HMAC-SHA1 key"))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; SHA1_DIGEST_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// CRC-32 (IEEE 802.3) of `data`.
pub fn crc32(data: &[u8]) -> Result<u32, CryptError> {
    if data.is_empty() {
        return Err(CryptError::BadParameter("empty CRC input"));
    }
    Ok(crc32fast::hash(data))
}
