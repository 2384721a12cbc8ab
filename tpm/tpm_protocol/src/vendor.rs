// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Vendor-defined field-upgrade data for TPM 2.0 parts.
//!
//! The vendor exposes its update state through `TPM_CAP_VENDOR_PROPERTY` and
//! drives the upgrade itself through five vendor command codes. Parts with a
//! firmware-update loader additionally report an operation mode and a
//! loader-side update counter.

use crate::RSA_2048_MODULUS_SIZE;
use crate::command::TpmCommand;
use crate::marshal::Marshal;
use crate::marshal::MarshalError;
use crate::marshal::ReadCursor;
use crate::marshal::SizedBuffer;
use crate::marshal::Unmarshal;
use crate::marshal::WriteCursor;
use crate::tpm20proto::CommandCodeEnum;
use crate::tpm20proto::GetCapabilityCmd;
use crate::tpm20proto::TPM20_CAP_VENDOR_PROPERTY;
use crate::tpm20proto::TPM20_RH_PLATFORM;
use crate::tpm20proto::TPM20_ST_NO_SESSIONS;
use crate::tpm20proto::TPM20_ST_SESSIONS;
use crate::tpm20proto::Tpm2bDigest;
use crate::tpm20proto::Tpm2bMaxBuffer;
use crate::tpm20proto::TpmsAuthCommand;
use crate::tpm20proto::marshal_auth_area;
use crate::tpm20proto::no_sessions_command;
use crate::tpm20proto::sessions_command;
use crate::tpm20proto::unmarshal_session_reply;
use std::fmt;

/// `TPM_PT_MANUFACTURER` value reported by Infineon parts (`"IFX\0"`).
pub const IFX_MANUFACTURER: u32 = u32::from_be_bytes(*b"IFX\0");

/// Properties in the `TPM_CAP_VENDOR_PROPERTY` area.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum VendorProperty {
    /// Remaining field upgrades, `u32`.
    FuCounter = 1,
    /// Remaining field upgrades to the same version, `u32`. Loader only.
    FuCounterSelf = 2,
    /// Loader operation mode, `u8`. Loader only.
    FuOperationMode = 3,
    /// Version of the running firmware.
    FirmwareVersion = 4,
    /// Version of the firmware being installed.
    NewFirmwareVersion = 5,
    /// Key group the part belongs to, `u32`.
    KeyGroupId = 6,
    /// Digest of the manifest that started the current upgrade, `TPMT_HA`.
    FuStartHashDigest = 7,
}

impl GetCapabilityCmd {
    /// Query for a single vendor property.
    pub fn vendor_property(property: VendorProperty) -> Self {
        Self {
            capability: TPM20_CAP_VENDOR_PROPERTY,
            property: property as u32,
            property_count: 1,
        }
    }
}

/// Loader operation mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OperationMode(pub u8);

impl OperationMode {
    /// Regular TPM firmware is running.
    pub const OPERATIONAL: Self = Self(0x00);
    /// The loader is accepting firmware blocks.
    pub const FIRMWARE_UPDATE: Self = Self(0x01);
    /// An update finished and the part must be restarted.
    pub const RESTART_REQUIRED: Self = Self(0x02);
    /// The loader is accepting firmware blocks after an interrupted update.
    pub const FIRMWARE_RECOVERY: Self = Self(0x81);

    const FIRMWARE_INVALID: u8 = 0x80;

    /// Whether the TPM firmware is running.
    pub fn is_operational(self) -> bool {
        self == Self::OPERATIONAL
    }

    /// Whether the loader is in firmware-update mode.
    pub fn is_update(self) -> bool {
        self == Self::FIRMWARE_UPDATE
    }

    /// Whether the loader is in firmware-recovery mode.
    pub fn is_recovery(self) -> bool {
        self == Self::FIRMWARE_RECOVERY
    }

    /// Whether a restart is needed to activate freshly installed firmware.
    pub fn is_restart_required(self) -> bool {
        self == Self::RESTART_REQUIRED
    }

    /// Whether the installed firmware image is intact.
    pub fn firmware_valid(self) -> bool {
        self.0 & Self::FIRMWARE_INVALID == 0
    }
}

/// Four-part firmware version. Ordered lexicographically.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
    /// Build number.
    pub build: u16,
    /// Revision.
    pub revision: u16,
}

impl FirmwareVersion {
    /// Builds a version from its four parts.
    pub const fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

impl Marshal for FirmwareVersion {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        self.major.marshal(cursor)?;
        self.minor.marshal(cursor)?;
        self.build.marshal(cursor)?;
        self.revision.marshal(cursor)
    }
}

impl Unmarshal for FirmwareVersion {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        Ok(Self {
            major: u16::unmarshal(cursor)?,
            minor: u16::unmarshal(cursor)?,
            build: u16::unmarshal(cursor)?,
            revision: u16::unmarshal(cursor)?,
        })
    }
}

/// Sealed update secret, `TPM2B` of an RSA-2048 ciphertext.
pub type SealedSecret = SizedBuffer<RSA_2048_MODULUS_SIZE>;

/// Starts a field upgrade on running TPM firmware. Authorized through a
/// policy session bound to this command code.
#[derive(Debug, Clone)]
pub struct FieldUpgradeStartVendorCmd {
    /// Policy session authorizing the platform hierarchy.
    pub policy_session: u32,
    /// Signed manifest from the firmware image.
    pub manifest: Tpm2bMaxBuffer,
    /// Update secret sealed to the key group.
    pub sealed_secret: SealedSecret,
}

impl TpmCommand for FieldUpgradeStartVendorCmd {
    type Reply = ();

    sessions_command!(CommandCodeEnum::FieldUpgradeStartVendor);

    fn marshal_body(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        TPM20_RH_PLATFORM.marshal(cursor)?;
        marshal_auth_area(cursor, &TpmsAuthCommand::policy(self.policy_session))?;
        self.manifest.marshal(cursor)?;
        self.sealed_secret.marshal(cursor)
    }

    fn unmarshal_reply(&self, cursor: &mut ReadCursor<'_>) -> Result<(), MarshalError> {
        unmarshal_session_reply(cursor)?;
        Ok(())
    }
}

/// Starts a field upgrade from the firmware-update loader.
#[derive(Debug, Clone)]
pub struct FieldUpgradeManifestVendorCmd {
    /// Signed manifest from the firmware image.
    pub manifest: Tpm2bMaxBuffer,
    /// Update secret sealed to the key group.
    pub sealed_secret: SealedSecret,
}

impl TpmCommand for FieldUpgradeManifestVendorCmd {
    type Reply = ();

    no_sessions_command!(CommandCodeEnum::FieldUpgradeManifestVendor);

    fn marshal_body(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        self.manifest.marshal(cursor)?;
        self.sealed_secret.marshal(cursor)
    }

    fn unmarshal_reply(&self, _cursor: &mut ReadCursor<'_>) -> Result<(), MarshalError> {
        Ok(())
    }
}

/// Transfers one firmware block.
#[derive(Debug, Clone)]
pub struct FieldUpgradeDataVendorCmd {
    /// Block payload.
    pub data: Tpm2bMaxBuffer,
    /// HMAC-SHA1 over the block index and payload, keyed by the update secret.
    pub block_tag: Tpm2bDigest,
}

impl TpmCommand for FieldUpgradeDataVendorCmd {
    type Reply = ();

    no_sessions_command!(CommandCodeEnum::FieldUpgradeDataVendor);

    fn marshal_body(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        self.data.marshal(cursor)?;
        self.block_tag.marshal(cursor)
    }

    fn unmarshal_reply(&self, _cursor: &mut ReadCursor<'_>) -> Result<(), MarshalError> {
        Ok(())
    }
}

/// Completes a field upgrade after the last block.
#[derive(Debug, Copy, Clone)]
pub struct FieldUpgradeFinalizeVendorCmd;

impl TpmCommand for FieldUpgradeFinalizeVendorCmd {
    type Reply = ();

    no_sessions_command!(CommandCodeEnum::FieldUpgradeFinalizeVendor);

    fn marshal_body(&self, _cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        Ok(())
    }

    fn unmarshal_reply(&self, _cursor: &mut ReadCursor<'_>) -> Result<(), MarshalError> {
        Ok(())
    }
}

/// Abandons an in-progress field upgrade and returns the loader to the
/// previous firmware, if it is still intact.
#[derive(Debug, Copy, Clone)]
pub struct FieldUpgradeAbandonVendorCmd;

impl TpmCommand for FieldUpgradeAbandonVendorCmd {
    type Reply = ();

    no_sessions_command!(CommandCodeEnum::FieldUpgradeAbandonVendor);

    fn marshal_body(&self, _cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        Ok(())
    }

    fn unmarshal_reply(&self, _cursor: &mut ReadCursor<'_>) -> Result<(), MarshalError> {
        Ok(())
    }
}
