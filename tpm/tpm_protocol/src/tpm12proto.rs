// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM 1.2 Protocol types, as defined in the TPM Main Specification Part 2
//! (structures) and Part 3 (commands), revision 116.
//!
//! TPM 1.2 has no self-describing capability structures: what comes back
//! from `TPM_GetCapability` is an opaque size-prefixed blob whose layout is
//! implied by the capability area that was asked for. The blob is parsed in a
//! second step with the matching [`Unmarshal`] type.

#![expect(missing_docs)] // Names follow the TPM 1.2 structures.

use crate::MAX_BUFFER_SIZE;
use crate::RSA_2048_MODULUS_SIZE;
use crate::SHA1_DIGEST_SIZE;
use crate::command::TpmCommand;
use crate::marshal::LongSizedBuffer;
use crate::marshal::Marshal;
use crate::marshal::MarshalError;
use crate::marshal::ReadCursor;
use crate::marshal::SizedBuffer;
use crate::marshal::Unmarshal;
use crate::marshal::WriteCursor;
use crate::vendor::FirmwareVersion;

// === Tags === //

pub const TPM12_TAG_RQU_COMMAND: u16 = 0x00c1;
pub const TPM12_TAG_RQU_AUTH1_COMMAND: u16 = 0x00c2;
pub const TPM12_TAG_RSP_COMMAND: u16 = 0x00c4;
pub const TPM12_TAG_RSP_AUTH1_COMMAND: u16 = 0x00c5;

const TPM12_TAG_PERMANENT_FLAGS: u16 = 0x001f;
const TPM12_TAG_STCLEAR_FLAGS: u16 = 0x0020;
const TPM12_TAG_CAP_VERSION_INFO: u16 = 0x0030;
const TPM12_TAG_DA_INFO: u16 = 0x0037;
const TPM12_TAG_DA_INFO_LIMITED: u16 = 0x0038;
const TPM12_TAG_DA_ACTION_TYPE: u16 = 0x0039;

// === Ordinals === //

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OrdinalEnum {
    Oiap = 0x0000_000a,
    GetTestResult = 0x0000_0054,
    GetCapability = 0x0000_0065,
    OwnerReadInternalPub = 0x0000_0081,
    FieldUpgrade = 0x0000_00aa,
}

impl OrdinalEnum {
    pub fn from_u32(val: u32) -> Option<OrdinalEnum> {
        let ret = match val {
            0x0000_000a => Self::Oiap,
            0x0000_0054 => Self::GetTestResult,
            0x0000_0065 => Self::GetCapability,
            0x0000_0081 => Self::OwnerReadInternalPub,
            0x0000_00aa => Self::FieldUpgrade,
            _ => return None,
        };
        Some(ret)
    }
}

/// Vendor sub-commands of `TPM_FieldUpgrade`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldUpgradeSubCommand {
    InfoRequest = 0x11,
    Start = 0x34,
    Update = 0x35,
    Complete = 0x36,
}

// === Result codes === //

const TPM12_NON_FATAL: u32 = 0x0000_0800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0x00,
    /// Authentication failed.
    AuthFail = 0x01,
    /// The TPM is deactivated.
    Deactivated = 0x06,
    /// The TPM is disabled.
    Disabled = 0x07,
    /// The ordinal is unknown or inconsistent.
    BadOrdinal = 0x0a,
    /// The TPM is in failed self-test mode.
    FailedSelfTest = 0x1c,
    /// Physical presence is required and was not asserted.
    BadPresence = 0x2d,
    /// Dictionary attack mitigation is running.
    DefendLockRunning = TPM12_NON_FATAL + 0x003,
}

impl ResultCode {
    pub fn from_u32(val: u32) -> Option<ResultCode> {
        let ret = match val {
            x if x == ResultCode::Success as u32 => ResultCode::Success,
            x if x == ResultCode::AuthFail as u32 => ResultCode::AuthFail,
            x if x == ResultCode::Deactivated as u32 => ResultCode::Deactivated,
            x if x == ResultCode::Disabled as u32 => ResultCode::Disabled,
            x if x == ResultCode::BadOrdinal as u32 => ResultCode::BadOrdinal,
            x if x == ResultCode::FailedSelfTest as u32 => ResultCode::FailedSelfTest,
            x if x == ResultCode::BadPresence as u32 => ResultCode::BadPresence,
            x if x == ResultCode::DefendLockRunning as u32 => ResultCode::DefendLockRunning,
            _ => return None,
        };
        Some(ret)
    }
}

// === Capabilities === //

pub const TPM12_CAP_FLAG: u32 = 0x0000_0004;
pub const TPM12_CAP_PROPERTY: u32 = 0x0000_0005;
pub const TPM12_CAP_DA_LOGIC: u32 = 0x0000_0019;
pub const TPM12_CAP_VERSION_VAL: u32 = 0x0000_001a;

pub const TPM12_CAP_FLAG_PERMANENT: u32 = 0x0000_0108;
pub const TPM12_CAP_FLAG_VOLATILE: u32 = 0x0000_0109;
pub const TPM12_CAP_PROP_OWNER: u32 = 0x0000_0111;

pub const TPM12_ET_OWNER: u16 = 0x0002;
/// Key handle selecting the endorsement key.
pub const TPM12_KH_EK: u32 = 0x4000_0006;

/// Largest capability response accepted.
pub const MAX_CAP_RESPONSE: usize = 512;
/// Largest output parameter area retained for response authorization.
pub const MAX_AUTH_OUT_PARAMS: usize = 512;

/// Size of the authorization trailer on an `AUTH1` request.
pub const AUTH1_COMMAND_TRAILER_SIZE: usize = 4 + SHA1_DIGEST_SIZE + 1 + SHA1_DIGEST_SIZE;
/// Size of the authorization trailer on an `AUTH1` response.
pub const AUTH1_RESPONSE_TRAILER_SIZE: usize = SHA1_DIGEST_SIZE + 1 + SHA1_DIGEST_SIZE;

/// `TPM_PERMANENT_FLAGS`
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PermanentFlags {
    pub disable: bool,
    pub ownership: bool,
    pub deactivated: bool,
    pub read_pubek: bool,
    pub disable_owner_clear: bool,
    pub allow_maintenance: bool,
    pub physical_presence_lifetime_lock: bool,
    pub physical_presence_hw_enable: bool,
    pub physical_presence_cmd_enable: bool,
    pub cekp_used: bool,
    pub tpm_post: bool,
    pub tpm_post_lock: bool,
    pub fips: bool,
    pub operator: bool,
    pub enable_revoke_ek: bool,
    pub nv_locked: bool,
    pub read_srk_pub: bool,
    pub tpm_established: bool,
    pub maintenance_done: bool,
    pub disable_full_da_logic_info: bool,
}

fn expect_tag(
    cursor: &mut ReadCursor<'_>,
    what: &'static str,
    tag: u16,
) -> Result<(), MarshalError> {
    let value = u16::unmarshal(cursor)?;
    if value != tag {
        return Err(MarshalError::Fail {
            what,
            value: value.into(),
        });
    }
    Ok(())
}

impl Unmarshal for PermanentFlags {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        expect_tag(cursor, "TPM_PERMANENT_FLAGS", TPM12_TAG_PERMANENT_FLAGS)?;
        Ok(Self {
            disable: bool::unmarshal(cursor)?,
            ownership: bool::unmarshal(cursor)?,
            deactivated: bool::unmarshal(cursor)?,
            read_pubek: bool::unmarshal(cursor)?,
            disable_owner_clear: bool::unmarshal(cursor)?,
            allow_maintenance: bool::unmarshal(cursor)?,
            physical_presence_lifetime_lock: bool::unmarshal(cursor)?,
            physical_presence_hw_enable: bool::unmarshal(cursor)?,
            physical_presence_cmd_enable: bool::unmarshal(cursor)?,
            cekp_used: bool::unmarshal(cursor)?,
            tpm_post: bool::unmarshal(cursor)?,
            tpm_post_lock: bool::unmarshal(cursor)?,
            fips: bool::unmarshal(cursor)?,
            operator: bool::unmarshal(cursor)?,
            enable_revoke_ek: bool::unmarshal(cursor)?,
            nv_locked: bool::unmarshal(cursor)?,
            read_srk_pub: bool::unmarshal(cursor)?,
            tpm_established: bool::unmarshal(cursor)?,
            maintenance_done: bool::unmarshal(cursor)?,
            disable_full_da_logic_info: bool::unmarshal(cursor)?,
        })
    }
}

impl Marshal for PermanentFlags {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        TPM12_TAG_PERMANENT_FLAGS.marshal(cursor)?;
        for flag in [
            self.disable,
            self.ownership,
            self.deactivated,
            self.read_pubek,
            self.disable_owner_clear,
            self.allow_maintenance,
            self.physical_presence_lifetime_lock,
            self.physical_presence_hw_enable,
            self.physical_presence_cmd_enable,
            self.cekp_used,
            self.tpm_post,
            self.tpm_post_lock,
            self.fips,
            self.operator,
            self.enable_revoke_ek,
            self.nv_locked,
            self.read_srk_pub,
            self.tpm_established,
            self.maintenance_done,
            self.disable_full_da_logic_info,
        ] {
            flag.marshal(cursor)?;
        }
        Ok(())
    }
}

/// `TPM_STCLEAR_FLAGS`
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct StClearFlags {
    pub deactivated: bool,
    pub disable_force_clear: bool,
    pub physical_presence: bool,
    pub physical_presence_lock: bool,
    pub global_lock: bool,
}

impl Unmarshal for StClearFlags {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        expect_tag(cursor, "TPM_STCLEAR_FLAGS", TPM12_TAG_STCLEAR_FLAGS)?;
        Ok(Self {
            deactivated: bool::unmarshal(cursor)?,
            disable_force_clear: bool::unmarshal(cursor)?,
            physical_presence: bool::unmarshal(cursor)?,
            physical_presence_lock: bool::unmarshal(cursor)?,
            global_lock: bool::unmarshal(cursor)?,
        })
    }
}

impl Marshal for StClearFlags {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        TPM12_TAG_STCLEAR_FLAGS.marshal(cursor)?;
        self.deactivated.marshal(cursor)?;
        self.disable_force_clear.marshal(cursor)?;
        self.physical_presence.marshal(cursor)?;
        self.physical_presence_lock.marshal(cursor)?;
        self.global_lock.marshal(cursor)
    }
}

/// `TPM_DA_INFO` or `TPM_DA_INFO_LIMITED`. The limited form omits the
/// counters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct DaInfo {
    /// `TPM_DA_STATE_ACTIVE`
    pub active: bool,
    pub current_count: Option<u16>,
    pub threshold_count: Option<u16>,
    /// Seconds until the lockout ends.
    pub action_depend_value: Option<u32>,
}

impl Unmarshal for DaInfo {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        let tag = u16::unmarshal(cursor)?;
        let limited = match tag {
            TPM12_TAG_DA_INFO => false,
            TPM12_TAG_DA_INFO_LIMITED => true,
            value => {
                return Err(MarshalError::Fail {
                    what: "TPM_DA_INFO",
                    value: value.into(),
                });
            }
        };
        let active = match u8::unmarshal(cursor)? {
            0 => false,
            1 => true,
            value => {
                return Err(MarshalError::Fail {
                    what: "TPM_DA_STATE",
                    value: value.into(),
                });
            }
        };

        let mut info = DaInfo {
            active,
            ..Default::default()
        };
        if !limited {
            info.current_count = Some(u16::unmarshal(cursor)?);
            info.threshold_count = Some(u16::unmarshal(cursor)?);
        }
        expect_tag(cursor, "TPM_DA_ACTION_TYPE", TPM12_TAG_DA_ACTION_TYPE)?;
        let _actions = u32::unmarshal(cursor)?;
        if !limited {
            info.action_depend_value = Some(u32::unmarshal(cursor)?);
        }
        let vendor_data_size = u32::unmarshal(cursor)? as usize;
        cursor.read_bytes(vendor_data_size)?;
        Ok(info)
    }
}

/// `TPM_CAP_VERSION_INFO`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CapVersionInfo {
    /// Major, minor, revMajor, revMinor.
    pub version: [u8; 4],
    pub spec_level: u16,
    pub errata_rev: u8,
    pub tpm_vendor_id: [u8; 4],
    pub vendor_specific: SizedBuffer<64>,
}

impl Unmarshal for CapVersionInfo {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        expect_tag(cursor, "TPM_CAP_VERSION_INFO", TPM12_TAG_CAP_VERSION_INFO)?;
        Ok(Self {
            version: Unmarshal::unmarshal(cursor)?,
            spec_level: u16::unmarshal(cursor)?,
            errata_rev: u8::unmarshal(cursor)?,
            tpm_vendor_id: Unmarshal::unmarshal(cursor)?,
            vendor_specific: Unmarshal::unmarshal(cursor)?,
        })
    }
}

impl Marshal for CapVersionInfo {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        TPM12_TAG_CAP_VERSION_INFO.marshal(cursor)?;
        self.version.marshal(cursor)?;
        self.spec_level.marshal(cursor)?;
        self.errata_rev.marshal(cursor)?;
        self.tpm_vendor_id.marshal(cursor)?;
        self.vendor_specific.marshal(cursor)
    }
}

/// `TPM_PUBKEY` restricted to RSA keys.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PubKey {
    pub algorithm_id: u32,
    pub enc_scheme: u16,
    pub sig_scheme: u16,
    pub key_length: u32,
    pub exponent: LongSizedBuffer<4>,
    pub modulus: LongSizedBuffer<RSA_2048_MODULUS_SIZE>,
}

impl Unmarshal for PubKey {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        let algorithm_id = u32::unmarshal(cursor)?;
        let enc_scheme = u16::unmarshal(cursor)?;
        let sig_scheme = u16::unmarshal(cursor)?;
        // `TPM_RSA_KEY_PARMS`, size-prefixed.
        let parm_size = u32::unmarshal(cursor)? as usize;
        let mut parms = cursor.sub_cursor(parm_size)?;
        let key_length = u32::unmarshal(&mut parms)?;
        let _num_primes = u32::unmarshal(&mut parms)?;
        let exponent = LongSizedBuffer::unmarshal(&mut parms)?;
        Ok(Self {
            algorithm_id,
            enc_scheme,
            sig_scheme,
            key_length,
            exponent,
            modulus: LongSizedBuffer::unmarshal(cursor)?,
        })
    }
}

/// Vendor field-upgrade information returned by the info request.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct IfxFieldUpgradeInfo {
    pub max_data_size: u16,
    pub firmware_version: FirmwareVersion,
    pub key_group_id: u32,
    /// Remaining field upgrades. [`IfxFieldUpgradeInfo::COUNTER_UNAVAILABLE`]
    /// when the part does not report one.
    pub field_upgrade_counter: u16,
    pub flags: u16,
}

impl IfxFieldUpgradeInfo {
    pub const COUNTER_UNAVAILABLE: u16 = 0xffff;
    const FLAG_FIRMWARE_VALID: u16 = 0x0001;
    const FLAG_DEFERRED_PHYSICAL_PRESENCE: u16 = 0x0002;

    pub fn firmware_valid(&self) -> bool {
        self.flags & Self::FLAG_FIRMWARE_VALID != 0
    }

    pub fn deferred_physical_presence(&self) -> bool {
        self.flags & Self::FLAG_DEFERRED_PHYSICAL_PRESENCE != 0
    }
}

impl Unmarshal for IfxFieldUpgradeInfo {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        Ok(Self {
            max_data_size: u16::unmarshal(cursor)?,
            firmware_version: FirmwareVersion::unmarshal(cursor)?,
            key_group_id: u32::unmarshal(cursor)?,
            field_upgrade_counter: u16::unmarshal(cursor)?,
            flags: u16::unmarshal(cursor)?,
        })
    }
}

impl Marshal for IfxFieldUpgradeInfo {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        self.max_data_size.marshal(cursor)?;
        self.firmware_version.marshal(cursor)?;
        self.key_group_id.marshal(cursor)?;
        self.field_upgrade_counter.marshal(cursor)?;
        self.flags.marshal(cursor)
    }
}

// === Authorization === //

/// Authorization trailer of an `AUTH1` request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Tpm12AuthCommand {
    pub auth_handle: u32,
    pub nonce_odd: [u8; SHA1_DIGEST_SIZE],
    pub continue_auth_session: bool,
    pub auth: [u8; SHA1_DIGEST_SIZE],
}

impl Marshal for Tpm12AuthCommand {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        self.auth_handle.marshal(cursor)?;
        self.nonce_odd.marshal(cursor)?;
        self.continue_auth_session.marshal(cursor)?;
        self.auth.marshal(cursor)
    }
}

/// Authorization trailer of an `AUTH1` response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Tpm12AuthResponse {
    pub nonce_even: [u8; SHA1_DIGEST_SIZE],
    pub continue_auth_session: bool,
    pub res_auth: [u8; SHA1_DIGEST_SIZE],
}

impl Unmarshal for Tpm12AuthResponse {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        Ok(Self {
            nonce_even: Unmarshal::unmarshal(cursor)?,
            continue_auth_session: bool::unmarshal(cursor)?,
            res_auth: Unmarshal::unmarshal(cursor)?,
        })
    }
}

/// Decoded reply to an `AUTH1` command. The raw output parameters are kept
/// so the caller can verify `resAuth`.
#[derive(Debug, Clone)]
pub struct Auth1Reply<R> {
    pub params: R,
    pub raw_params: SizedBuffer<MAX_AUTH_OUT_PARAMS>,
    pub auth: Tpm12AuthResponse,
}

/// Splits an `AUTH1` reply body into output parameters and the trailing
/// authorization, decoding the parameters with `parse`.
pub fn unmarshal_auth1_reply<R>(
    cursor: &mut ReadCursor<'_>,
    parse: impl FnOnce(&mut ReadCursor<'_>) -> Result<R, MarshalError>,
) -> Result<Auth1Reply<R>, MarshalError> {
    let params_len = cursor
        .remaining()
        .checked_sub(AUTH1_RESPONSE_TRAILER_SIZE)
        .ok_or(MarshalError::BufferTooSmall {
            needed: AUTH1_RESPONSE_TRAILER_SIZE,
            remaining: cursor.remaining(),
        })?;
    let mut params = cursor.sub_cursor(params_len)?;
    let raw_params = SizedBuffer::new(params.rest())?;
    let parsed = parse(&mut params)?;
    Ok(Auth1Reply {
        params: parsed,
        raw_params,
        auth: Tpm12AuthResponse::unmarshal(cursor)?,
    })
}

// === Commands === //

macro_rules! tpm12_command {
    ($ordinal:expr) => {
        fn tag(&self) -> u16 {
            TPM12_TAG_RQU_COMMAND
        }

        fn command_code(&self) -> u32 {
            $ordinal as u32
        }

        fn reply_tag(&self) -> u16 {
            TPM12_TAG_RSP_COMMAND
        }

        fn failure_tag(&self) -> u16 {
            TPM12_TAG_RSP_COMMAND
        }
    };
}

macro_rules! tpm12_auth1_command {
    ($ordinal:expr) => {
        fn tag(&self) -> u16 {
            if self.auth.is_some() {
                TPM12_TAG_RQU_AUTH1_COMMAND
            } else {
                TPM12_TAG_RQU_COMMAND
            }
        }

        fn command_code(&self) -> u32 {
            $ordinal as u32
        }

        fn reply_tag(&self) -> u16 {
            if self.auth.is_some() {
                TPM12_TAG_RSP_AUTH1_COMMAND
            } else {
                TPM12_TAG_RSP_COMMAND
            }
        }

        fn failure_tag(&self) -> u16 {
            TPM12_TAG_RSP_COMMAND
        }
    };
}

/// TPM_GetCapability
#[derive(Debug, Copy, Clone)]
pub struct GetCapabilityCmd {
    pub cap_area: u32,
    pub sub_cap: LongSizedBuffer<4>,
}

impl GetCapabilityCmd {
    fn with_sub_cap(cap_area: u32, sub_cap: &[u8]) -> Self {
        Self {
            cap_area,
            // Every sub-capability used here fits in four bytes.
            sub_cap: LongSizedBuffer::new(sub_cap).unwrap_or_default(),
        }
    }

    /// `TPM_CAP_FLAG` with a `TPM_CAP_FLAG_*` sub-capability.
    pub fn flag(sub_cap: u32) -> Self {
        Self::with_sub_cap(TPM12_CAP_FLAG, &sub_cap.to_be_bytes())
    }

    /// `TPM_CAP_PROPERTY` with a `TPM_CAP_PROP_*` sub-capability.
    pub fn property(sub_cap: u32) -> Self {
        Self::with_sub_cap(TPM12_CAP_PROPERTY, &sub_cap.to_be_bytes())
    }

    /// `TPM_CAP_DA_LOGIC` for an entity type.
    pub fn da_logic(entity_type: u16) -> Self {
        Self::with_sub_cap(TPM12_CAP_DA_LOGIC, &entity_type.to_be_bytes())
    }

    /// `TPM_CAP_VERSION_VAL`
    pub fn version_val() -> Self {
        Self::with_sub_cap(TPM12_CAP_VERSION_VAL, &[])
    }
}

impl TpmCommand for GetCapabilityCmd {
    type Reply = LongSizedBuffer<MAX_CAP_RESPONSE>;

    tpm12_command!(OrdinalEnum::GetCapability);

    fn marshal_body(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        self.cap_area.marshal(cursor)?;
        self.sub_cap.marshal(cursor)
    }

    fn unmarshal_reply(&self, cursor: &mut ReadCursor<'_>) -> Result<Self::Reply, MarshalError> {
        LongSizedBuffer::unmarshal(cursor)
    }
}

/// TPM_GetTestResult
#[derive(Debug, Copy, Clone)]
pub struct GetTestResultCmd;

impl TpmCommand for GetTestResultCmd {
    type Reply = LongSizedBuffer<MAX_CAP_RESPONSE>;

    tpm12_command!(OrdinalEnum::GetTestResult);

    fn marshal_body(&self, _cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        Ok(())
    }

    fn unmarshal_reply(&self, cursor: &mut ReadCursor<'_>) -> Result<Self::Reply, MarshalError> {
        LongSizedBuffer::unmarshal(cursor)
    }
}

/// TPM_OIAP
#[derive(Debug, Copy, Clone)]
pub struct OiapCmd;

#[derive(Debug, Copy, Clone)]
pub struct OiapReply {
    pub auth_handle: u32,
    pub nonce_even: [u8; SHA1_DIGEST_SIZE],
}

impl TpmCommand for OiapCmd {
    type Reply = OiapReply;

    tpm12_command!(OrdinalEnum::Oiap);

    fn marshal_body(&self, _cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        Ok(())
    }

    fn unmarshal_reply(&self, cursor: &mut ReadCursor<'_>) -> Result<Self::Reply, MarshalError> {
        Ok(OiapReply {
            auth_handle: u32::unmarshal(cursor)?,
            nonce_even: Unmarshal::unmarshal(cursor)?,
        })
    }
}

/// TPM_OwnerReadInternalPub. Used to prove knowledge of the owner
/// authorization without side effects.
#[derive(Debug, Copy, Clone)]
pub struct OwnerReadInternalPubCmd {
    pub key_handle: u32,
    pub auth: Option<Tpm12AuthCommand>,
}

impl TpmCommand for OwnerReadInternalPubCmd {
    type Reply = Auth1Reply<PubKey>;

    tpm12_auth1_command!(OrdinalEnum::OwnerReadInternalPub);

    fn marshal_body(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        self.key_handle.marshal(cursor)?;
        match &self.auth {
            Some(auth) => auth.marshal(cursor),
            None => Err(MarshalError::Fail {
                what: "TPM_TAG_RQU_AUTH1_COMMAND",
                value: OrdinalEnum::OwnerReadInternalPub as u32,
            }),
        }
    }

    fn unmarshal_reply(&self, cursor: &mut ReadCursor<'_>) -> Result<Self::Reply, MarshalError> {
        unmarshal_auth1_reply(cursor, PubKey::unmarshal)
    }
}

/// Field-upgrade info request.
#[derive(Debug, Copy, Clone)]
pub struct FieldUpgradeInfoCmd;

impl TpmCommand for FieldUpgradeInfoCmd {
    type Reply = IfxFieldUpgradeInfo;

    tpm12_command!(OrdinalEnum::FieldUpgrade);

    fn marshal_body(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        (FieldUpgradeSubCommand::InfoRequest as u8).marshal(cursor)?;
        // No input data.
        0u16.marshal(cursor)
    }

    fn unmarshal_reply(&self, cursor: &mut ReadCursor<'_>) -> Result<Self::Reply, MarshalError> {
        let size = u16::unmarshal(cursor)? as usize;
        let mut info = cursor.sub_cursor(size)?;
        IfxFieldUpgradeInfo::unmarshal(&mut info)
    }
}

/// Field-upgrade start. Owner-authorized when the TPM has an owner.
#[derive(Debug, Clone)]
pub struct FieldUpgradeStartCmd {
    pub manifest: SizedBuffer<MAX_BUFFER_SIZE>,
    pub sealed_secret: SizedBuffer<RSA_2048_MODULUS_SIZE>,
    pub auth: Option<Tpm12AuthCommand>,
}

impl TpmCommand for FieldUpgradeStartCmd {
    type Reply = Option<Auth1Reply<()>>;

    tpm12_auth1_command!(OrdinalEnum::FieldUpgrade);

    fn marshal_body(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        (FieldUpgradeSubCommand::Start as u8).marshal(cursor)?;
        self.manifest.marshal(cursor)?;
        self.sealed_secret.marshal(cursor)?;
        if let Some(auth) = &self.auth {
            auth.marshal(cursor)?;
        }
        Ok(())
    }

    fn unmarshal_reply(&self, cursor: &mut ReadCursor<'_>) -> Result<Self::Reply, MarshalError> {
        if self.auth.is_none() {
            return Ok(None);
        }
        unmarshal_auth1_reply(cursor, |_| Ok(())).map(Some)
    }
}

/// Field-upgrade block transfer.
#[derive(Debug, Clone)]
pub struct FieldUpgradeUpdateCmd {
    pub block: SizedBuffer<MAX_BUFFER_SIZE>,
    pub block_tag: [u8; SHA1_DIGEST_SIZE],
}

impl TpmCommand for FieldUpgradeUpdateCmd {
    type Reply = ();

    tpm12_command!(OrdinalEnum::FieldUpgrade);

    fn marshal_body(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        (FieldUpgradeSubCommand::Update as u8).marshal(cursor)?;
        self.block.marshal(cursor)?;
        self.block_tag.marshal(cursor)
    }

    fn unmarshal_reply(&self, _cursor: &mut ReadCursor<'_>) -> Result<(), MarshalError> {
        Ok(())
    }
}

/// Field-upgrade completion.
#[derive(Debug, Copy, Clone)]
pub struct FieldUpgradeCompleteCmd;

impl TpmCommand for FieldUpgradeCompleteCmd {
    type Reply = ();

    tpm12_command!(OrdinalEnum::FieldUpgrade);

    fn marshal_body(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        (FieldUpgradeSubCommand::Complete as u8).marshal(cursor)
    }

    fn unmarshal_reply(&self, _cursor: &mut ReadCursor<'_>) -> Result<(), MarshalError> {
        Ok(())
    }
}
