// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! HMAC-DRBG (NIST SP 800-90A) over SHA-256.

use crate::CryptError;
use hmac::Hmac;
use hmac::Mac;
use hmac::digest::Key;
use hmac::digest::KeyInit;
use rsa::rand_core::CryptoRng;
use rsa::rand_core::RngCore;
use sha2::Sha256;

const OUTLEN: usize = 32;
/// Entropy plus nonce gathered when seeding from the system.
const SEED_LEN: usize = 48;

/// Seedable cryptographically secure random number generator.
///
/// The internal state is mutated by every request, so it is not shareable
/// across threads without external serialization.
pub struct Csprng {
    key: [u8; OUTLEN],
    value: [u8; OUTLEN],
}

impl Csprng {
    /// Seeds a generator from the system entropy source.
    pub fn new() -> Result<Self, CryptError> {
        let mut seed = [0u8; SEED_LEN];
        getrandom::fill(&mut seed).map_err(CryptError::Random)?;
        Self::from_seed(&seed)
    }

    /// Seeds a generator deterministically. The same seed always yields the
    /// same stream.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptError> {
        if seed.is_empty() {
            return Err(CryptError::BadParameter("empty seed"));
        }
        let mut rng = Self {
            key: [0; OUTLEN],
            value: [1; OUTLEN],
        };
        rng.update(seed);
        Ok(rng)
    }

    /// Mixes additional input into the state.
    pub fn reseed(&mut self, additional_input: &[u8]) -> Result<(), CryptError> {
        if additional_input.is_empty() {
            return Err(CryptError::BadParameter("empty reseed input"));
        }
        self.update(additional_input);
        Ok(())
    }

    /// Fills `out` with random bytes.
    pub fn fill(&mut self, out: &mut [u8]) -> Result<(), CryptError> {
        if out.is_empty() {
            return Err(CryptError::BadParameter("zero-length random request"));
        }
        self.generate(out);
        Ok(())
    }

    fn hmac(key: &[u8; OUTLEN], parts: &[&[u8]]) -> [u8; OUTLEN] {
        // Zero padding to the block size is what HMAC does to short keys.
        let mut block = Key::<Hmac<Sha256>>::default();
        block[..OUTLEN].copy_from_slice(key);
        let mut mac = <Hmac<Sha256> as KeyInit>::new(&block);
        for part in parts {
            mac.update(part);
        }
        mac.finalize().into_bytes().into()
    }

    fn update(&mut self, data: &[u8]) {
        self.key = Self::hmac(&self.key, &[&self.value, &[0x00], data]);
        self.value = Self::hmac(&self.key, &[&self.value]);
        if !data.is_empty() {
            self.key = Self::hmac(&self.key, &[&self.value, &[0x01], data]);
            self.value = Self::hmac(&self.key, &[&self.value]);
        }
    }

    fn generate(&mut self, out: &mut [u8]) {
        for chunk in out.chunks_mut(OUTLEN) {
            self.value = Self::hmac(&self.key, &[&self.value]);
            chunk.copy_from_slice(&self.value[..chunk.len()]);
        }
        self.update(&[]);
    }
}

impl RngCore for Csprng {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.generate(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.generate(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        if !dest.is_empty() {
            self.generate(dest);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rsa::rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for Csprng {}
