// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Firmware image container and image classification.
//!
//! An image is a big-endian container:
//!
//! ```text
//! magic "TPMF" | format version u16 | target family u8 | flags u8
//! source families u8 | reserved u8 | key group id u32 | version 4 x u16
//! key group modulus (u16 size, 256 bytes) | manifest (u16 size, <= 1024 bytes)
//! block count u16 | blocks (u16 size, <= 1024 bytes each)
//! signature (u16 size, 256 bytes) | CRC32 u32
//! ```
//!
//! The signature is RSASSA-PSS over the SHA-256 of everything that precedes
//! it. The CRC covers everything that precedes the CRC.

use crate::state::TpmFamily;
use crate::state::TpmState;
use crate::state::UpdateCounters;
use thiserror::Error;
use tpm_crypt::CryptError;
use tpm_protocol::MAX_BUFFER_SIZE;
use tpm_protocol::RSA_2048_MODULUS_SIZE;
use tpm_protocol::marshal::MarshalError;
use tpm_protocol::marshal::ReadCursor;
use tpm_protocol::marshal::Unmarshal;
use tpm_protocol::vendor::FirmwareVersion;

/// `"TPMF"`
pub const IMAGE_MAGIC: u32 = 0x5450_4D46;
/// Newest container format this crate understands.
pub const SUPPORTED_FORMAT_VERSION: u16 = 1;

const FLAG_FACTORY_DEFAULTS: u8 = 0x01;
const SOURCE_TPM12: u8 = 0x01;
const SOURCE_TPM20: u8 = 0x02;
const CRC_SIZE: usize = 4;

/// Why an image could not be used at all.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// Structure, CRC or signature check failed.
    #[error("firmware image is corrupt: {0}")]
    Corrupt(&'static str),
    /// The container format is newer than this crate.
    #[error("firmware image format {0} requires a newer driver")]
    NewerDriverRequired(u16),
}

impl ImageError {
    /// The classification reported for this failure.
    pub fn reason(&self) -> InvalidReason {
        match self {
            ImageError::Corrupt(_) => InvalidReason::Corrupt,
            ImageError::NewerDriverRequired(_) => InvalidReason::NewerDriverRequired,
        }
    }
}

fn truncated(_: MarshalError) -> ImageError {
    ImageError::Corrupt("truncated")
}

/// A parsed firmware image borrowing from the caller's buffer.
#[derive(Debug, Clone)]
pub struct FirmwareImage<'a> {
    /// Family the TPM runs after the update.
    pub target_family: TpmFamily,
    /// The update resets the TPM to factory defaults.
    pub factory_defaults: bool,
    /// Key group the image is encrypted for.
    pub key_group_id: u32,
    /// Version of the firmware in the image.
    pub version: FirmwareVersion,
    /// Public modulus of the key group. The update secret is sealed to it.
    pub key_group_modulus: &'a [u8],
    /// Signed manifest handed to the TPM with the start command.
    pub manifest: &'a [u8],
    source_families: u8,
    block_count: usize,
    block_area: &'a [u8],
    signed: &'a [u8],
    signature: &'a [u8],
}

impl<'a> FirmwareImage<'a> {
    /// Parses the container and checks its CRC. Does not check the signature.
    pub fn parse(image: &'a [u8]) -> Result<Self, ImageError> {
        let crc_offset = image
            .len()
            .checked_sub(CRC_SIZE)
            .filter(|&offset| offset > 0)
            .ok_or(ImageError::Corrupt("image too short"))?;
        let (covered, crc) = image.split_at(crc_offset);

        let mut cursor = ReadCursor::new_unchecked(covered);
        if u32::unmarshal(&mut cursor).map_err(truncated)? != IMAGE_MAGIC {
            return Err(ImageError::Corrupt("bad magic"));
        }
        let expected_crc = ReadCursor::new_unchecked(crc)
            .read_u32()
            .map_err(truncated)?;
        let actual_crc =
            tpm_crypt::crc32(covered).map_err(|_| ImageError::Corrupt("image too short"))?;
        if actual_crc != expected_crc {
            return Err(ImageError::Corrupt("CRC mismatch"));
        }

        let format_version = u16::unmarshal(&mut cursor).map_err(truncated)?;
        if format_version == 0 {
            return Err(ImageError::Corrupt("format version"));
        }
        if format_version > SUPPORTED_FORMAT_VERSION {
            return Err(ImageError::NewerDriverRequired(format_version));
        }

        let target_family = match u8::unmarshal(&mut cursor).map_err(truncated)? {
            1 => TpmFamily::Tpm12,
            2 => TpmFamily::Tpm20,
            _ => return Err(ImageError::Corrupt("target family")),
        };
        let flags = u8::unmarshal(&mut cursor).map_err(truncated)?;
        let source_families = u8::unmarshal(&mut cursor).map_err(truncated)?;
        if u8::unmarshal(&mut cursor).map_err(truncated)? != 0 {
            return Err(ImageError::Corrupt("reserved byte"));
        }
        let key_group_id = u32::unmarshal(&mut cursor).map_err(truncated)?;
        let version = FirmwareVersion::unmarshal(&mut cursor).map_err(truncated)?;

        let key_group_modulus = read_sized(&mut cursor, RSA_2048_MODULUS_SIZE, true)?;
        let manifest = read_sized(&mut cursor, MAX_BUFFER_SIZE, false)?;

        let block_count = u16::unmarshal(&mut cursor).map_err(truncated)? as usize;
        if block_count == 0 {
            return Err(ImageError::Corrupt("no firmware blocks"));
        }
        let blocks_start = cursor.position();
        for _ in 0..block_count {
            read_sized(&mut cursor, MAX_BUFFER_SIZE, false)?;
        }
        let blocks_end = cursor.position();

        let signed = &covered[..blocks_end];
        let signature = read_sized(&mut cursor, RSA_2048_MODULUS_SIZE, true)?;
        if !cursor.is_empty() {
            return Err(ImageError::Corrupt("trailing bytes"));
        }

        Ok(Self {
            target_family,
            factory_defaults: flags & FLAG_FACTORY_DEFAULTS != 0,
            key_group_id,
            version,
            key_group_modulus,
            manifest,
            source_families,
            block_count,
            block_area: &covered[blocks_start..blocks_end],
            signed,
            signature,
        })
    }

    /// Parses the container and verifies its signature against one of
    /// `trusted_keys`.
    pub fn authenticate(
        image: &'a [u8],
        trusted_keys: &[[u8; RSA_2048_MODULUS_SIZE]],
    ) -> Result<Self, ImageError> {
        let image = Self::parse(image)?;
        image.verify(trusted_keys)?;
        Ok(image)
    }

    fn verify(&self, trusted_keys: &[[u8; RSA_2048_MODULUS_SIZE]]) -> Result<(), ImageError> {
        let digest =
            tpm_crypt::sha256(self.signed).map_err(|_| ImageError::Corrupt("empty image"))?;
        for key in trusted_keys {
            match tpm_crypt::verify_pss_sha256(key, &digest, self.signature) {
                Ok(()) => return Ok(()),
                Err(CryptError::VerifySignature) => {}
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "skipping unusable manifest key"
                    );
                }
            }
        }
        Err(ImageError::Corrupt("no trusted key matches the signature"))
    }

    /// Whether a TPM of `family` may install this image.
    pub fn supports_source(&self, family: TpmFamily) -> bool {
        let bit = match family {
            TpmFamily::Tpm12 => SOURCE_TPM12,
            TpmFamily::Tpm20 => SOURCE_TPM20,
        };
        self.source_families & bit != 0
    }

    /// Number of firmware blocks.
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// The firmware blocks in transfer order.
    pub fn blocks(&self) -> Blocks<'a> {
        Blocks {
            cursor: ReadCursor::new_unchecked(self.block_area),
        }
    }
}

/// Reads a `u16` size and that many bytes. `exact` requires the size to
/// equal `capacity`, otherwise it must be `1..=capacity`.
fn read_sized<'a>(
    cursor: &mut ReadCursor<'a>,
    capacity: usize,
    exact: bool,
) -> Result<&'a [u8], ImageError> {
    let size = u16::unmarshal(cursor).map_err(truncated)? as usize;
    let size_ok = if exact {
        size == capacity
    } else {
        (1..=capacity).contains(&size)
    };
    if !size_ok {
        return Err(ImageError::Corrupt("field size"));
    }
    cursor.read_bytes(size).map_err(truncated)
}

/// Iterator over the firmware blocks of an image.
#[derive(Debug)]
pub struct Blocks<'a> {
    cursor: ReadCursor<'a>,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.cursor.is_empty() {
            return None;
        }
        // Sizes were validated by `FirmwareImage::parse`.
        let size = self.cursor.read_u16().ok()?;
        self.cursor.read_bytes(size as usize).ok()
    }
}

/// Properties of an image that can be installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidFlags {
    /// The image carries the running firmware version.
    pub same_version: bool,
    /// The TPM firmware is invalid or an update is in progress.
    pub recovery: bool,
    /// The image switches the TPM family.
    pub device_type_change: bool,
    /// The update resets the TPM to factory defaults.
    pub factory_defaults: bool,
    /// This is the last update the TPM accepts.
    pub last_update: bool,
}

/// Why an image cannot be installed on this TPM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    /// The image is not meant for this TPM.
    WrongImage,
    /// Structure, CRC or signature check failed.
    Corrupt,
    /// The container format is newer than this crate.
    NewerDriverRequired,
    /// The image is older than the running firmware.
    NewerImageRequired,
}

/// Result of checking an image against the current TPM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageClassification {
    /// The image can be installed.
    Valid(ValidFlags),
    /// The image cannot be installed.
    Invalid(InvalidReason),
    /// No field upgrades remain.
    Blocked,
}

/// Authenticates and classifies `image` against `state`.
pub fn classify(
    state: &TpmState,
    image: &[u8],
    trusted_keys: &[[u8; RSA_2048_MODULUS_SIZE]],
) -> ImageClassification {
    match FirmwareImage::authenticate(image, trusted_keys) {
        Ok(image) => classify_image(state, &image),
        Err(err) => {
            tracing::debug!(error = &err as &dyn std::error::Error, "image rejected");
            ImageClassification::Invalid(err.reason())
        }
    }
}

/// Classifies an authenticated image against `state`.
pub fn classify_image(state: &TpmState, image: &FirmwareImage<'_>) -> ImageClassification {
    let family = state.family();
    if !image.supports_source(family) || image.key_group_id != state.key_group_id {
        return ImageClassification::Invalid(InvalidReason::WrongImage);
    }

    let same_version = image.version == state.firmware_version;
    let counter = if same_version && state.counters.counter_self != UpdateCounters::UNSUPPORTED {
        state.counters.counter_self
    } else {
        state.counters.effective()
    };
    if counter == 0 {
        return ImageClassification::Blocked;
    }

    // Running firmware that is invalid has no meaningful version to compare.
    let recovery = state.in_recovery();
    if !recovery && image.version < state.firmware_version {
        return ImageClassification::Invalid(InvalidReason::NewerImageRequired);
    }

    let device_type_change = image.target_family != family;
    ImageClassification::Valid(ValidFlags {
        same_version,
        recovery,
        device_type_change,
        factory_defaults: device_type_change || image.factory_defaults,
        last_update: counter == 1,
    })
}
