// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! RSA-2048 public key operations.

use crate::CryptError;
use crate::Csprng;
use crate::RSA_2048_MODULUS_SIZE;
use crate::SHA1_DIGEST_SIZE;
use crate::SHA256_DIGEST_SIZE;
use rsa::BigUint;
use rsa::Oaep;
use rsa::Pss;
use rsa::RsaPublicKey;
use sha1::Sha1;
use sha2::Sha256;

/// Public exponent of every key the TPM vendor publishes.
pub const RSA_PUBLIC_EXPONENT: u32 = 65537;
/// OAEP label expected by the TPM when it unseals a secret.
pub const OAEP_TCPA_LABEL: &str = "TCPA";
/// Salt length of manifest signatures.
pub const PSS_SALT_SIZE: usize = SHA256_DIGEST_SIZE;

const MAX_OAEP_SHA1_MESSAGE: usize = RSA_2048_MODULUS_SIZE - 2 * SHA1_DIGEST_SIZE - 2;

fn public_key(modulus: &[u8]) -> Result<RsaPublicKey, CryptError> {
    if modulus.len() != RSA_2048_MODULUS_SIZE {
        return Err(CryptError::BadParameter("modulus must be 256 bytes"));
    }
    RsaPublicKey::new(
        BigUint::from_bytes_be(modulus),
        BigUint::from(RSA_PUBLIC_EXPONENT),
    )
    .map_err(CryptError::Rsa)
}

/// Encrypts `message` to the RSA-2048 key `modulus` with OAEP, SHA-1 and the
/// label `"TCPA"`.
pub fn encrypt_oaep_tcpa(
    rng: &mut Csprng,
    modulus: &[u8],
    message: &[u8],
) -> Result<[u8; RSA_2048_MODULUS_SIZE], CryptError> {
    if message.is_empty() || message.len() > MAX_OAEP_SHA1_MESSAGE {
        return Err(CryptError::BadParameter("OAEP message size"));
    }
    let key = public_key(modulus)?;
    let encrypted = key
        .encrypt(
            rng,
            Oaep::new_with_label::<Sha1, _>(OAEP_TCPA_LABEL),
            message,
        )
        .map_err(CryptError::Rsa)?;
    if encrypted.len() != RSA_2048_MODULUS_SIZE {
        return Err(CryptError::BadParameter("ciphertext size"));
    }
    let mut out = [0u8; RSA_2048_MODULUS_SIZE];
    out.copy_from_slice(&encrypted);
    Ok(out)
}

/// Verifies an RSASSA-PSS (SHA-256, 32-byte salt) signature over `digest`.
pub fn verify_pss_sha256(
    modulus: &[u8],
    digest: &[u8],
    signature: &[u8],
) -> Result<(), CryptError> {
    if digest.len() != SHA256_DIGEST_SIZE {
        return Err(CryptError::BadParameter("digest must be 32 bytes"));
    }
    if signature.len() != RSA_2048_MODULUS_SIZE {
        return Err(CryptError::BadParameter("signature must be 256 bytes"));
    }
    let key = public_key(modulus)?;
    key.verify(
        Pss::new_with_salt::<Sha256>(PSS_SALT_SIZE),
        digest,
        signature,
    )
    .map_err(|err| {
        tracing::debug!(error = &err as &dyn std::error::Error, "PSS verification failed");
        CryptError::VerifySignature
    })
}
