// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM 2.0 protocol types, as defined by the TCG TPM 2.0 Library.
//!
//! Only the structures and commands needed to discover device state and to
//! set up the authorization for a field upgrade are defined here. The vendor
//! field-upgrade commands themselves live in [`crate::vendor`].

#![expect(missing_docs)] // Names follow the TPM 2.0 library structures.

use crate::MAX_BUFFER_SIZE;
use crate::impl_marshal_zerocopy;
use crate::marshal::BoundedList;
use crate::marshal::Marshal;
use crate::marshal::MarshalError;
use crate::marshal::ReadCursor;
use crate::marshal::SizedBuffer;
use crate::marshal::Unmarshal;
use crate::marshal::UnmarshalSelected;
use crate::marshal::WriteCursor;
use crate::command::TpmCommand;
use crate::new_u32_be;
use crate::packed_nums::*;
use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

// === Tags === //

/// `TPM_ST_NO_SESSIONS`
pub const TPM20_ST_NO_SESSIONS: u16 = 0x8001;
/// `TPM_ST_SESSIONS`
pub const TPM20_ST_SESSIONS: u16 = 0x8002;

// === Handles === //

#[repr(transparent)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct ReservedHandle(pub u32_be);

impl PartialEq<ReservedHandle> for u32 {
    fn eq(&self, other: &ReservedHandle) -> bool {
        other.0.get() == *self
    }
}

impl ReservedHandle {
    pub const fn new(kind: u8, offset: u32) -> ReservedHandle {
        ReservedHandle(new_u32_be((kind as u32) << 24 | offset))
    }

    pub fn value(&self) -> u32 {
        self.0.get()
    }
}

impl_marshal_zerocopy!(ReservedHandle);

pub const TPM20_HT_LOADED_SESSION: u8 = 0x02;
pub const TPM20_HT_POLICY_SESSION: u8 = 0x03;
pub const TPM20_HT_PERMANENT: u8 = 0x40;

pub const TPM20_RH_NULL: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x07);
pub const TPM20_RH_PLATFORM: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x0c);
// `TPM_RS_PW` (not `TPM_RH_PW`)
// See Table 28, Section 7.4, "Trusted Platform Module Library Part 2: Structures", revision 1.38.
pub const TPM20_RS_PW: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x09);

/// Returns the handle type (`TPM_HT`) encoded in the top byte of a handle.
pub const fn handle_type(handle: u32) -> u8 {
    (handle >> 24) as u8
}

// === Command codes === //

#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandCodeEnum {
    SetPrimaryPolicy = 0x0000012e,
    FlushContext = 0x00000165,
    PolicyCommandCode = 0x0000016c,
    StartAuthSession = 0x00000176,
    GetCapability = 0x0000017a,
    GetTestResult = 0x0000017c,
    // Vendor-specific, `TPM_CC_V` set.
    FieldUpgradeStartVendor = 0x2000012f,
    FieldUpgradeAbandonVendor = 0x20000130,
    FieldUpgradeManifestVendor = 0x20000131,
    FieldUpgradeDataVendor = 0x20000132,
    FieldUpgradeFinalizeVendor = 0x20000133,
}

impl CommandCodeEnum {
    pub fn from_u32(val: u32) -> Option<CommandCodeEnum> {
        let ret = match val {
            0x0000012e => Self::SetPrimaryPolicy,
            0x00000165 => Self::FlushContext,
            0x0000016c => Self::PolicyCommandCode,
            0x00000176 => Self::StartAuthSession,
            0x0000017a => Self::GetCapability,
            0x0000017c => Self::GetTestResult,
            0x2000012f => Self::FieldUpgradeStartVendor,
            0x20000130 => Self::FieldUpgradeAbandonVendor,
            0x20000131 => Self::FieldUpgradeManifestVendor,
            0x20000132 => Self::FieldUpgradeDataVendor,
            0x20000133 => Self::FieldUpgradeFinalizeVendor,
            _ => return None,
        };

        Some(ret)
    }
}

// === Response codes === //

const FLAG_FMT1: u32 = 0x0080;
const FLAG_VER1: u32 = 0x0100;
const FLAG_WARN: u32 = 0x0800 + FLAG_VER1;
/// Format-one error number mask.
const FMT1_ERROR_MASK: u32 = 0x003F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseCode {
    Success = 0x000,
    /// Value is out of range or is not correct for the context.
    Value = FLAG_FMT1 + 0x004,
    /// Hierarchy is not enabled or is not correct for the use.
    Hierarchy = FLAG_FMT1 + 0x0005,
    /// The handle is not correct for the use.
    Handle = FLAG_FMT1 + 0x000B,
    /// The authorization HMAC check failed.
    AuthFail = FLAG_FMT1 + 0x000E,
    /// A policy check failed.
    PolicyFail = FLAG_FMT1 + 0x001D,
    /// Authorization failure without DA implications.
    BadAuth = FLAG_FMT1 + 0x0022,
    /// TPM not initialized by TPM2_Startup or already initialized.
    Initialize = FLAG_VER1,
    /// TPM is in failure mode.
    Failure = FLAG_VER1 + 0x0001,
    /// Command code not supported.
    CommandCode = FLAG_VER1 + 0x0043,
    /// TPM is performing self tests.
    Testing = FLAG_WARN + 0x00A,
    /// Commands are not being accepted because the TPM is in DA lockout
    /// mode.
    Lockout = FLAG_WARN + 0x021,
    /// The TPM was not able to start the command. Retry might work.
    Retry = FLAG_WARN + 0x022,
}

impl ResponseCode {
    /// Maps a raw response code onto a known code. Format-one codes are
    /// reduced to their error number first, so a `TPM_RC_VALUE` attributed to
    /// any parameter, handle or session maps to [`ResponseCode::Value`].
    pub fn from_u32(val: u32) -> Option<ResponseCode> {
        let val = if val & FLAG_FMT1 != 0 {
            FLAG_FMT1 | (val & FMT1_ERROR_MASK)
        } else {
            val
        };
        let ret = match val {
            x if x == ResponseCode::Success as u32 => ResponseCode::Success,
            x if x == ResponseCode::Value as u32 => ResponseCode::Value,
            x if x == ResponseCode::Hierarchy as u32 => ResponseCode::Hierarchy,
            x if x == ResponseCode::Handle as u32 => ResponseCode::Handle,
            x if x == ResponseCode::AuthFail as u32 => ResponseCode::AuthFail,
            x if x == ResponseCode::PolicyFail as u32 => ResponseCode::PolicyFail,
            x if x == ResponseCode::BadAuth as u32 => ResponseCode::BadAuth,
            x if x == ResponseCode::Initialize as u32 => ResponseCode::Initialize,
            x if x == ResponseCode::Failure as u32 => ResponseCode::Failure,
            x if x == ResponseCode::CommandCode as u32 => ResponseCode::CommandCode,
            x if x == ResponseCode::Testing as u32 => ResponseCode::Testing,
            x if x == ResponseCode::Lockout as u32 => ResponseCode::Lockout,
            x if x == ResponseCode::Retry as u32 => ResponseCode::Retry,
            _ => return None,
        };
        Some(ret)
    }
}

// === Algorithms === //

#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AlgIdEnum {
    SHA = 0x0004,
    AES = 0x0006,
    XOR = 0x000a,
    SHA256 = 0x000b,
    SHA384 = 0x000c,
    SHA512 = 0x000d,
    NULL = 0x0010,
    CFB = 0x0043,
}

impl AlgIdEnum {
    pub fn from_u16(val: u16) -> Option<AlgIdEnum> {
        let ret = match val {
            0x0004 => Self::SHA,
            0x0006 => Self::AES,
            0x000a => Self::XOR,
            0x000b => Self::SHA256,
            0x000c => Self::SHA384,
            0x000d => Self::SHA512,
            0x0010 => Self::NULL,
            0x0043 => Self::CFB,
            _ => return None,
        };

        Some(ret)
    }
}

// === Capabilities and properties === //

pub const TPM20_CAP_HANDLES: u32 = 0x0000_0001;
pub const TPM20_CAP_TPM_PROPERTIES: u32 = 0x0000_0006;
/// Manufacturer-specific capability area.
pub const TPM20_CAP_VENDOR_PROPERTY: u32 = 0x0000_0100;

const PT_FIXED: u32 = 0x100;
const PT_VAR: u32 = 0x200;
pub const TPM20_PT_MANUFACTURER: u32 = PT_FIXED + 5;
pub const TPM20_PT_PERMANENT: u32 = PT_VAR;
pub const TPM20_PT_STARTUP_CLEAR: u32 = PT_VAR + 1;

/// `TPM_SE_POLICY`
pub const TPM20_SE_POLICY: u8 = 0x01;

// `MAX_CAP_DATA` for a 1024-byte `MAX_CAP_BUFFER`.
const MAX_CAP_DATA: usize = MAX_BUFFER_SIZE - 4 - 4;
pub const MAX_CAP_HANDLES: usize = MAX_CAP_DATA / 4;
pub const MAX_TPM_PROPERTIES: usize = MAX_CAP_DATA / 8;
/// Upper bound on the number of buffers returned for a vendor property
/// query. Properties are always requested one at a time.
pub const MAX_VENDOR_BUFFERS: usize = 4;
/// Size of the largest digest, `sizeof(TPMU_HA)`.
pub const MAX_DIGEST_SIZE: usize = 64;
/// Largest encrypted salt accepted by StartAuthSession (`TPM2B_ENCRYPTED_SECRET`).
pub const MAX_ENCRYPTED_SECRET_SIZE: usize = 256;

/// `TPMA_PERMANENT`
#[bitfield(u32)]
pub struct TpmaPermanent {
    pub owner_auth_set: bool,
    pub endorsement_auth_set: bool,
    pub lockout_auth_set: bool,
    #[bits(5)]
    _reserved0: u8,
    pub disable_clear: bool,
    pub in_lockout: bool,
    pub tpm_generated_eps: bool,
    #[bits(21)]
    _reserved1: u32,
}

/// `TPMA_STARTUP_CLEAR`
#[bitfield(u32)]
pub struct TpmaStartupClear {
    pub ph_enable: bool,
    pub sh_enable: bool,
    pub eh_enable: bool,
    pub ph_enable_nv: bool,
    #[bits(27)]
    _reserved: u32,
    pub orderly: bool,
}

/// `TPMA_SESSION`
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct TpmaSession {
    pub continue_session: bool,
    pub audit_exclusive: bool,
    pub audit_reset: bool,
    #[bits(2)]
    _reserved: u8,
    pub decrypt: bool,
    pub encrypt: bool,
    pub audit: bool,
}

/// `TPMS_TAGGED_PROPERTY`
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TpmsTaggedProperty {
    pub property: u32,
    pub value: u32,
}

impl Marshal for TpmsTaggedProperty {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        self.property.marshal(cursor)?;
        self.value.marshal(cursor)
    }
}

impl Unmarshal for TpmsTaggedProperty {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        Ok(Self {
            property: u32::unmarshal(cursor)?,
            value: u32::unmarshal(cursor)?,
        })
    }
}

/// `TPM2B_DIGEST`
pub type Tpm2bDigest = SizedBuffer<MAX_DIGEST_SIZE>;
/// `TPM2B_MAX_BUFFER`
pub type Tpm2bMaxBuffer = SizedBuffer<MAX_BUFFER_SIZE>;

/// `TPMU_CAPABILITIES`, selected by `TPM_CAP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capabilities {
    /// `TPML_HANDLE`
    Handles(BoundedList<u32, MAX_CAP_HANDLES>),
    /// `TPML_TAGGED_TPM_PROPERTY`
    TpmProperties(BoundedList<TpmsTaggedProperty, MAX_TPM_PROPERTIES>),
    /// `TPML_MAX_BUFFER`, one buffer per requested vendor property.
    VendorProperties(BoundedList<Tpm2bMaxBuffer, MAX_VENDOR_BUFFERS>),
}

impl Capabilities {
    pub fn capability(&self) -> u32 {
        match self {
            Capabilities::Handles(_) => TPM20_CAP_HANDLES,
            Capabilities::TpmProperties(_) => TPM20_CAP_TPM_PROPERTIES,
            Capabilities::VendorProperties(_) => TPM20_CAP_VENDOR_PROPERTY,
        }
    }
}

impl UnmarshalSelected for Capabilities {
    type Selector = u32;

    fn unmarshal_selected(
        selector: u32,
        cursor: &mut ReadCursor<'_>,
    ) -> Result<Self, MarshalError> {
        let ret = match selector {
            TPM20_CAP_HANDLES => Capabilities::Handles(Unmarshal::unmarshal(cursor)?),
            TPM20_CAP_TPM_PROPERTIES => Capabilities::TpmProperties(Unmarshal::unmarshal(cursor)?),
            TPM20_CAP_VENDOR_PROPERTY => {
                Capabilities::VendorProperties(Unmarshal::unmarshal(cursor)?)
            }
            value => {
                return Err(MarshalError::Fail {
                    what: "TPM_CAP",
                    value,
                });
            }
        };
        Ok(ret)
    }
}

impl Marshal for Capabilities {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        match self {
            Capabilities::Handles(list) => list.marshal(cursor),
            Capabilities::TpmProperties(list) => list.marshal(cursor),
            Capabilities::VendorProperties(list) => list.marshal(cursor),
        }
    }
}

/// `TPMS_CAPABILITY_DATA`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsCapabilityData {
    pub data: Capabilities,
}

impl Marshal for TpmsCapabilityData {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        self.data.capability().marshal(cursor)?;
        self.data.marshal(cursor)
    }
}

impl Unmarshal for TpmsCapabilityData {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        let capability = u32::unmarshal(cursor)?;
        Ok(Self {
            data: Capabilities::unmarshal_selected(capability, cursor)?,
        })
    }
}

/// `TPMT_HA`. The digest size is selected by the hash algorithm.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TpmtHa {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
    Sha384([u8; 48]),
    Sha512([u8; 64]),
}

impl TpmtHa {
    pub fn hash_alg(&self) -> u16 {
        let alg = match self {
            TpmtHa::Sha1(_) => AlgIdEnum::SHA,
            TpmtHa::Sha256(_) => AlgIdEnum::SHA256,
            TpmtHa::Sha384(_) => AlgIdEnum::SHA384,
            TpmtHa::Sha512(_) => AlgIdEnum::SHA512,
        };
        alg as u16
    }

    pub fn digest(&self) -> &[u8] {
        match self {
            TpmtHa::Sha1(d) => d,
            TpmtHa::Sha256(d) => d,
            TpmtHa::Sha384(d) => d,
            TpmtHa::Sha512(d) => d,
        }
    }
}

impl UnmarshalSelected for TpmtHa {
    type Selector = u16;

    fn unmarshal_selected(selector: u16, cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        let ret = match AlgIdEnum::from_u16(selector) {
            Some(AlgIdEnum::SHA) => TpmtHa::Sha1(cursor.read_array()?),
            Some(AlgIdEnum::SHA256) => TpmtHa::Sha256(cursor.read_array()?),
            Some(AlgIdEnum::SHA384) => TpmtHa::Sha384(cursor.read_array()?),
            Some(AlgIdEnum::SHA512) => TpmtHa::Sha512(cursor.read_array()?),
            _ => {
                return Err(MarshalError::Fail {
                    what: "TPMI_ALG_HASH",
                    value: selector.into(),
                });
            }
        };
        Ok(ret)
    }
}

impl Marshal for TpmtHa {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        self.hash_alg().marshal(cursor)?;
        cursor.write_bytes(self.digest())
    }
}

impl Unmarshal for TpmtHa {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        let alg = u16::unmarshal(cursor)?;
        Self::unmarshal_selected(alg, cursor)
    }
}

/// `TPMT_SYM_DEF`. Only the variants a policy session can use are modeled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TpmtSymDef {
    Null,
    Xor { hash_alg: u16 },
    Aes { key_bits: u16, mode: u16 },
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        match *self {
            TpmtSymDef::Null => (AlgIdEnum::NULL as u16).marshal(cursor),
            TpmtSymDef::Xor { hash_alg } => {
                (AlgIdEnum::XOR as u16).marshal(cursor)?;
                hash_alg.marshal(cursor)
            }
            TpmtSymDef::Aes { key_bits, mode } => {
                (AlgIdEnum::AES as u16).marshal(cursor)?;
                key_bits.marshal(cursor)?;
                mode.marshal(cursor)
            }
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        let alg = u16::unmarshal(cursor)?;
        let ret = match AlgIdEnum::from_u16(alg) {
            Some(AlgIdEnum::NULL) => TpmtSymDef::Null,
            Some(AlgIdEnum::XOR) => TpmtSymDef::Xor {
                hash_alg: u16::unmarshal(cursor)?,
            },
            Some(AlgIdEnum::AES) => TpmtSymDef::Aes {
                key_bits: u16::unmarshal(cursor)?,
                mode: u16::unmarshal(cursor)?,
            },
            _ => {
                return Err(MarshalError::Fail {
                    what: "TPMI_ALG_SYM",
                    value: alg.into(),
                });
            }
        };
        Ok(ret)
    }
}

/// `TPMS_AUTH_COMMAND`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TpmsAuthCommand {
    pub session_handle: u32,
    pub nonce: Tpm2bDigest,
    pub attributes: TpmaSession,
    pub hmac: Tpm2bDigest,
}

impl TpmsAuthCommand {
    /// Password authorization with an empty password.
    pub fn empty_password() -> Self {
        Self {
            session_handle: TPM20_RS_PW.value(),
            nonce: Tpm2bDigest::empty(),
            attributes: TpmaSession::new().with_continue_session(true),
            hmac: Tpm2bDigest::empty(),
        }
    }

    /// Policy session authorization. The policy must not require an HMAC.
    pub fn policy(session_handle: u32) -> Self {
        Self {
            session_handle,
            nonce: Tpm2bDigest::empty(),
            attributes: TpmaSession::new().with_continue_session(true),
            hmac: Tpm2bDigest::empty(),
        }
    }
}

impl Marshal for TpmsAuthCommand {
    fn marshal(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        self.session_handle.marshal(cursor)?;
        self.nonce.marshal(cursor)?;
        u8::from(self.attributes).marshal(cursor)?;
        self.hmac.marshal(cursor)
    }
}

/// `TPMS_AUTH_RESPONSE`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TpmsAuthResponse {
    pub nonce: Tpm2bDigest,
    pub attributes: TpmaSession,
    pub hmac: Tpm2bDigest,
}

impl Unmarshal for TpmsAuthResponse {
    fn unmarshal(cursor: &mut ReadCursor<'_>) -> Result<Self, MarshalError> {
        Ok(Self {
            nonce: Unmarshal::unmarshal(cursor)?,
            attributes: TpmaSession::from(u8::unmarshal(cursor)?),
            hmac: Unmarshal::unmarshal(cursor)?,
        })
    }
}

/// Writes an authorization area holding a single session, preceded by its
/// `authorizationSize`.
pub fn marshal_auth_area(
    cursor: &mut WriteCursor<'_>,
    auth: &TpmsAuthCommand,
) -> Result<(), MarshalError> {
    let size_offset = cursor.position();
    0u32.marshal(cursor)?;
    auth.marshal(cursor)?;
    let size = cursor.position() - size_offset - 4;
    cursor.patch_u32(size_offset, size as u32)
}

/// Splits the parameter area off a reply to a command that carried
/// sessions. Returns a cursor over the parameters and validates the trailing
/// session responses.
pub fn unmarshal_session_reply<'a>(
    cursor: &mut ReadCursor<'a>,
) -> Result<(ReadCursor<'a>, TpmsAuthResponse), MarshalError> {
    let parameter_size = u32::unmarshal(cursor)? as usize;
    let parameters = cursor.sub_cursor(parameter_size)?;
    let auth = TpmsAuthResponse::unmarshal(cursor)?;
    Ok((parameters, auth))
}

// === Commands === //

/// Implements the boilerplate of [`TpmCommand`] for commands without
/// sessions.
macro_rules! no_sessions_command {
    ($code:expr) => {
        fn tag(&self) -> u16 {
            TPM20_ST_NO_SESSIONS
        }

        fn command_code(&self) -> u32 {
            $code as u32
        }

        fn reply_tag(&self) -> u16 {
            TPM20_ST_NO_SESSIONS
        }

        fn failure_tag(&self) -> u16 {
            TPM20_ST_NO_SESSIONS
        }
    };
}

macro_rules! sessions_command {
    ($code:expr) => {
        fn tag(&self) -> u16 {
            TPM20_ST_SESSIONS
        }

        fn command_code(&self) -> u32 {
            $code as u32
        }

        fn reply_tag(&self) -> u16 {
            TPM20_ST_SESSIONS
        }

        fn failure_tag(&self) -> u16 {
            TPM20_ST_NO_SESSIONS
        }
    };
}

pub(crate) use no_sessions_command;
pub(crate) use sessions_command;

/// TPM2_GetCapability
#[derive(Debug, Copy, Clone)]
pub struct GetCapabilityCmd {
    pub capability: u32,
    pub property: u32,
    pub property_count: u32,
}

#[derive(Debug, Clone)]
pub struct GetCapabilityReply {
    pub more_data: bool,
    pub capability_data: TpmsCapabilityData,
}

impl TpmCommand for GetCapabilityCmd {
    type Reply = GetCapabilityReply;

    no_sessions_command!(CommandCodeEnum::GetCapability);

    fn marshal_body(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        self.capability.marshal(cursor)?;
        self.property.marshal(cursor)?;
        self.property_count.marshal(cursor)
    }

    fn unmarshal_reply(&self, cursor: &mut ReadCursor<'_>) -> Result<Self::Reply, MarshalError> {
        let reply = GetCapabilityReply {
            more_data: bool::unmarshal(cursor)?,
            capability_data: TpmsCapabilityData::unmarshal(cursor)?,
        };
        // A TPM answers with the capability that was asked for.
        let capability = reply.capability_data.data.capability();
        if capability != self.capability {
            return Err(MarshalError::Fail {
                what: "TPM_CAP",
                value: capability,
            });
        }
        Ok(reply)
    }
}

/// TPM2_GetTestResult
#[derive(Debug, Copy, Clone)]
pub struct GetTestResultCmd;

#[derive(Debug, Clone)]
pub struct GetTestResultReply {
    pub out_data: Tpm2bMaxBuffer,
    pub test_result: u32,
}

impl TpmCommand for GetTestResultCmd {
    type Reply = GetTestResultReply;

    no_sessions_command!(CommandCodeEnum::GetTestResult);

    fn marshal_body(&self, _cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        Ok(())
    }

    fn unmarshal_reply(&self, cursor: &mut ReadCursor<'_>) -> Result<Self::Reply, MarshalError> {
        Ok(GetTestResultReply {
            out_data: Unmarshal::unmarshal(cursor)?,
            test_result: u32::unmarshal(cursor)?,
        })
    }
}

/// TPM2_StartAuthSession
#[derive(Debug, Copy, Clone)]
pub struct StartAuthSessionCmd {
    pub tpm_key: ReservedHandle,
    pub bind: ReservedHandle,
    pub nonce_caller: Tpm2bDigest,
    pub encrypted_salt: SizedBuffer<MAX_ENCRYPTED_SECRET_SIZE>,
    pub session_type: u8,
    pub symmetric: TpmtSymDef,
    pub auth_hash: u16,
}

impl StartAuthSessionCmd {
    /// An unsalted, unbound policy session using `auth_hash`.
    pub fn policy(nonce_caller: Tpm2bDigest, auth_hash: u16) -> Self {
        Self {
            tpm_key: TPM20_RH_NULL,
            bind: TPM20_RH_NULL,
            nonce_caller,
            encrypted_salt: SizedBuffer::empty(),
            session_type: TPM20_SE_POLICY,
            symmetric: TpmtSymDef::Null,
            auth_hash,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartAuthSessionReply {
    pub session_handle: u32,
    pub nonce_tpm: Tpm2bDigest,
}

impl TpmCommand for StartAuthSessionCmd {
    type Reply = StartAuthSessionReply;

    no_sessions_command!(CommandCodeEnum::StartAuthSession);

    fn marshal_body(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        self.tpm_key.marshal(cursor)?;
        self.bind.marshal(cursor)?;
        self.nonce_caller.marshal(cursor)?;
        self.encrypted_salt.marshal(cursor)?;
        self.session_type.marshal(cursor)?;
        self.symmetric.marshal(cursor)?;
        self.auth_hash.marshal(cursor)
    }

    fn unmarshal_reply(&self, cursor: &mut ReadCursor<'_>) -> Result<Self::Reply, MarshalError> {
        Ok(StartAuthSessionReply {
            session_handle: u32::unmarshal(cursor)?,
            nonce_tpm: Unmarshal::unmarshal(cursor)?,
        })
    }
}

/// TPM2_PolicyCommandCode
#[derive(Debug, Copy, Clone)]
pub struct PolicyCommandCodeCmd {
    pub policy_session: u32,
    pub code: u32,
}

impl TpmCommand for PolicyCommandCodeCmd {
    type Reply = ();

    no_sessions_command!(CommandCodeEnum::PolicyCommandCode);

    fn marshal_body(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        self.policy_session.marshal(cursor)?;
        self.code.marshal(cursor)
    }

    fn unmarshal_reply(&self, _cursor: &mut ReadCursor<'_>) -> Result<(), MarshalError> {
        Ok(())
    }
}

/// TPM2_SetPrimaryPolicy
#[derive(Debug, Copy, Clone)]
pub struct SetPrimaryPolicyCmd {
    pub auth_handle: ReservedHandle,
    pub auth: TpmsAuthCommand,
    pub auth_policy: Tpm2bDigest,
    pub hash_alg: u16,
}

impl TpmCommand for SetPrimaryPolicyCmd {
    type Reply = ();

    sessions_command!(CommandCodeEnum::SetPrimaryPolicy);

    fn marshal_body(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        self.auth_handle.marshal(cursor)?;
        marshal_auth_area(cursor, &self.auth)?;
        self.auth_policy.marshal(cursor)?;
        self.hash_alg.marshal(cursor)
    }

    fn unmarshal_reply(&self, cursor: &mut ReadCursor<'_>) -> Result<(), MarshalError> {
        unmarshal_session_reply(cursor)?;
        Ok(())
    }
}

/// TPM2_FlushContext
#[derive(Debug, Copy, Clone)]
pub struct FlushContextCmd {
    pub flush_handle: u32,
}

impl TpmCommand for FlushContextCmd {
    type Reply = ();

    no_sessions_command!(CommandCodeEnum::FlushContext);

    fn marshal_body(&self, cursor: &mut WriteCursor<'_>) -> Result<(), MarshalError> {
        self.flush_handle.marshal(cursor)
    }

    fn unmarshal_reply(&self, _cursor: &mut ReadCursor<'_>) -> Result<(), MarshalError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Reply;

    fn serialize<C: TpmCommand>(cmd: &C) -> ([u8; 512], usize) {
        let mut buffer = [0u8; 512];
        let len = cmd.serialize_into(&mut buffer).unwrap();
        (buffer, len)
    }

    #[test]
    fn get_capability_command() {
        const EXPECTED_CMD: [u8; 22] = [
            0x80, 0x01, 0x00, 0x00, 0x00, 0x16, 0x00, 0x00, 0x01, 0x7a, 0x00, 0x00, 0x00, 0x06,
            0x00, 0x00, 0x01, 0x05, 0x00, 0x00, 0x00, 0x01,
        ];

        let cmd = GetCapabilityCmd {
            capability: TPM20_CAP_TPM_PROPERTIES,
            property: TPM20_PT_MANUFACTURER,
            property_count: 1,
        };
        let (buffer, len) = serialize(&cmd);
        assert_eq!(&buffer[..len], &EXPECTED_CMD);
    }

    #[test]
    fn get_capability_properties_reply() {
        const REPLY: [u8; 27] = [
            0x80, 0x01, 0x00, 0x00, 0x00, 0x1b, 0x00, 0x00, 0x00, 0x00, // header
            0x01, // moreData
            0x00, 0x00, 0x00, 0x06, // TPM_CAP_TPM_PROPERTIES
            0x00, 0x00, 0x00, 0x01, // count
            0x00, 0x00, 0x01, 0x05, b'I', b'F', b'X', 0x00,
        ];

        let cmd = GetCapabilityCmd {
            capability: TPM20_CAP_TPM_PROPERTIES,
            property: TPM20_PT_MANUFACTURER,
            property_count: 1,
        };
        let Reply::Succeeded(reply) = cmd.validate_reply(&REPLY).unwrap() else {
            panic!("unexpected failure");
        };
        assert!(reply.more_data);
        let Capabilities::TpmProperties(props) = reply.capability_data.data else {
            panic!("wrong capability");
        };
        assert_eq!(
            props.as_slice(),
            &[TpmsTaggedProperty {
                property: TPM20_PT_MANUFACTURER,
                value: u32::from_be_bytes(*b"IFX\0"),
            }]
        );
    }

    #[test]
    fn get_capability_reply_with_unknown_capability() {
        const REPLY: [u8; 19] = [
            0x80, 0x01, 0x00, 0x00, 0x00, 0x13, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x09, 0x00, 0x00, 0x00, 0x00,
        ];
        let cmd = GetCapabilityCmd {
            capability: TPM20_CAP_HANDLES,
            property: 0x0200_0000,
            property_count: 1,
        };
        assert!(matches!(
            cmd.validate_reply(&REPLY),
            Err(crate::command::ResponseValidationError::Parameters(
                MarshalError::Fail {
                    what: "TPM_CAP",
                    value: 9
                }
            ))
        ));
    }

    #[test]
    fn start_auth_session_command() {
        const EXPECTED_CMD: [u8; 43] = [
            0x80, 0x01, 0x00, 0x00, 0x00, 0x2b, 0x00, 0x00, 0x01, 0x76, // header
            0x40, 0x00, 0x00, 0x07, // tpmKey
            0x40, 0x00, 0x00, 0x07, // bind
            0x00, 0x10, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b,
            0x0c, 0x0d, 0x0e, 0x0f, // nonceCaller
            0x00, 0x00, // encryptedSalt
            0x01, // TPM_SE_POLICY
            0x00, 0x10, // TPM_ALG_NULL
            0x00, 0x0b, // TPM_ALG_SHA256
        ];

        let nonce: [u8; 16] = core::array::from_fn(|i| i as u8);
        let cmd = StartAuthSessionCmd::policy(
            Tpm2bDigest::new(&nonce).unwrap(),
            AlgIdEnum::SHA256 as u16,
        );
        let (buffer, len) = serialize(&cmd);
        assert_eq!(&buffer[..len], &EXPECTED_CMD);
    }

    #[test]
    fn set_primary_policy_command_and_reply() {
        const EXPECTED_CMD: [u8; 63] = [
            0x80, 0x02, 0x00, 0x00, 0x00, 0x3f, 0x00, 0x00, 0x01, 0x2e, // header
            0x40, 0x00, 0x00, 0x0c, // TPM_RH_PLATFORM
            0x00, 0x00, 0x00, 0x09, // authorizationSize
            0x40, 0x00, 0x00, 0x09, 0x00, 0x00, 0x01, 0x00, 0x00, // TPM_RS_PW
            0x00, 0x20, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa,
            0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa,
            0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, // authPolicy
            0x00, 0x0b, // hashAlg
        ];

        let cmd = SetPrimaryPolicyCmd {
            auth_handle: TPM20_RH_PLATFORM,
            auth: TpmsAuthCommand::empty_password(),
            auth_policy: Tpm2bDigest::new(&[0xaa; 32]).unwrap(),
            hash_alg: AlgIdEnum::SHA256 as u16,
        };
        let (buffer, len) = serialize(&cmd);
        assert_eq!(&buffer[..len], &EXPECTED_CMD);

        const REPLY: [u8; 19] = [
            0x80, 0x02, 0x00, 0x00, 0x00, 0x13, 0x00, 0x00, 0x00, 0x00, // header
            0x00, 0x00, 0x00, 0x00, // parameterSize
            0x00, 0x00, 0x01, 0x00, 0x00, // auth response
        ];
        assert!(matches!(cmd.validate_reply(&REPLY), Ok(Reply::Succeeded(()))));
    }

    #[test]
    fn tpmt_ha_selected_by_algorithm() {
        let mut bytes = [0u8; 34];
        bytes[1] = 0x0b;
        bytes[2..].fill(0x5a);
        let mut cursor = ReadCursor::new(&bytes).unwrap();
        let ha = TpmtHa::unmarshal(&mut cursor).unwrap();
        assert_eq!(ha, TpmtHa::Sha256([0x5a; 32]));
        assert_eq!(ha.hash_alg(), 0x0b);

        // TPM_ALG_NULL carries no digest and is not a valid hash here.
        let mut cursor = ReadCursor::new(&[0x00, 0x10]).unwrap();
        assert!(matches!(
            TpmtHa::unmarshal(&mut cursor),
            Err(MarshalError::Fail {
                what: "TPMI_ALG_HASH",
                value: 0x10
            })
        ));

        // Truncated digest.
        let mut cursor = ReadCursor::new(&bytes[..20]).unwrap();
        assert!(matches!(
            TpmtHa::unmarshal(&mut cursor),
            Err(MarshalError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn response_code_reduces_format_one() {
        // TPM_RC_VALUE + TPM_RC_P + TPM_RC_1
        assert_eq!(ResponseCode::from_u32(0x1c4), Some(ResponseCode::Value));
        assert_eq!(ResponseCode::from_u32(0x9a2), Some(ResponseCode::BadAuth));
        assert_eq!(ResponseCode::from_u32(0x101), Some(ResponseCode::Failure));
        assert_eq!(ResponseCode::from_u32(0x921), Some(ResponseCode::Lockout));
        assert_eq!(ResponseCode::from_u32(0x3ff), None);
    }

    #[test]
    fn attribute_bitfields() {
        let startup = TpmaStartupClear::from(0x8000_0001);
        assert!(startup.ph_enable());
        assert!(startup.orderly());
        assert!(!startup.sh_enable());

        let permanent = TpmaPermanent::from(0x0000_0201);
        assert!(permanent.owner_auth_set());
        assert!(permanent.in_lockout());
    }
}
