// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command-level TPM simulator and firmware image builder used by the unit
//! tests.
//!
//! [`SimTpm`] answers the subset of TPM 1.2 and TPM 2.0 commands the update
//! flow issues, including the vendor field-upgrade commands. It unseals the
//! update secret with the key-group private key and checks every block tag,
//! so a test that completes an update has exercised the real wire format.

use crate::config::UpdateConfig;
use crate::image::IMAGE_MAGIC;
use crate::state::TpmFamily;
use rsa::Oaep;
use rsa::Pss;
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use sha1::Sha1;
use sha2::Digest;
use sha2::Sha256;
use std::sync::OnceLock;
use std::time::Duration;
use tpm_crypt::Csprng;
use tpm_protocol::RSA_2048_MODULUS_SIZE;
use tpm_protocol::SHA1_DIGEST_SIZE;
use tpm_protocol::marshal::Marshal;
use tpm_protocol::marshal::ReadCursor;
use tpm_protocol::marshal::WriteCursor;
use tpm_protocol::tpm12proto;
use tpm_protocol::tpm12proto::IfxFieldUpgradeInfo;
use tpm_protocol::tpm12proto::OrdinalEnum;
use tpm_protocol::tpm12proto::PermanentFlags;
use tpm_protocol::tpm12proto::StClearFlags;
use tpm_protocol::tpm20proto;
use tpm_protocol::tpm20proto::CommandCodeEnum;
use tpm_protocol::tpm20proto::TpmaStartupClear;
use tpm_protocol::vendor::FirmwareVersion;
use tpm_protocol::vendor::IFX_MANUFACTURER;
use tpm_tis::TisError;
use tpm_tis::TisWait;
use tpm_tis::TpmTransport;

// === Keys === //

struct TestKeys {
    manifest_signing: RsaPrivateKey,
    key_group: RsaPrivateKey,
}

fn keys() -> &'static TestKeys {
    static KEYS: OnceLock<TestKeys> = OnceLock::new();
    KEYS.get_or_init(|| TestKeys {
        manifest_signing: RsaPrivateKey::from_pkcs1_pem(include_str!(
            "../test_data/manifest_signing_key.pem"
        ))
        .unwrap(),
        key_group: RsaPrivateKey::from_pkcs1_pem(include_str!("../test_data/key_group_key.pem"))
            .unwrap(),
    })
}

fn modulus(key: &RsaPrivateKey) -> [u8; RSA_2048_MODULUS_SIZE] {
    key.n().to_bytes_be().try_into().unwrap()
}

/// Public modulus of the key that signs test images.
pub(crate) fn manifest_key_modulus() -> [u8; RSA_2048_MODULUS_SIZE] {
    modulus(&keys().manifest_signing)
}

/// Public modulus of the simulated key group.
pub(crate) fn key_group_modulus() -> [u8; RSA_2048_MODULUS_SIZE] {
    modulus(&keys().key_group)
}

/// A configuration trusting the test signing key.
pub(crate) fn test_config() -> UpdateConfig {
    UpdateConfig {
        manifest_keys: vec![manifest_key_modulus()],
        ..Default::default()
    }
}

/// A deterministic generator.
pub(crate) fn test_rng() -> Csprng {
    Csprng::from_seed(b"firmware update unit tests").unwrap()
}

// === Images === //

/// Builds signed firmware image containers.
#[derive(Debug, Clone)]
pub(crate) struct ImageBuilder {
    pub format_version: u16,
    pub target: u8,
    pub flags: u8,
    pub sources: u8,
    pub key_group_id: u32,
    pub version: FirmwareVersion,
    pub manifest: Vec<u8>,
    pub blocks: Vec<Vec<u8>>,
}

impl ImageBuilder {
    pub const CURRENT_VERSION: FirmwareVersion = FirmwareVersion::new(7, 85, 4555, 0);
    pub const NEW_VERSION: FirmwareVersion = FirmwareVersion::new(7, 86, 17664, 0);
    pub const KEY_GROUP_ID: u32 = 0x0000_0005;

    /// A TPM 2.0 image installable from either family.
    pub fn tpm20() -> Self {
        Self {
            format_version: 1,
            target: 2,
            flags: 0,
            sources: 0x03,
            key_group_id: Self::KEY_GROUP_ID,
            version: Self::NEW_VERSION,
            manifest: (0..96).map(|i| i as u8).collect(),
            blocks: vec![vec![0xb0; 1024], vec![0xb1; 1024], vec![0xb2; 300]],
        }
    }

    fn push_sized(out: &mut Vec<u8>, data: &[u8]) {
        out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        out.extend_from_slice(data);
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&IMAGE_MAGIC.to_be_bytes());
        out.extend_from_slice(&self.format_version.to_be_bytes());
        out.extend_from_slice(&[self.target, self.flags, self.sources, 0]);
        out.extend_from_slice(&self.key_group_id.to_be_bytes());
        for part in [
            self.version.major,
            self.version.minor,
            self.version.build,
            self.version.revision,
        ] {
            out.extend_from_slice(&part.to_be_bytes());
        }
        Self::push_sized(&mut out, &key_group_modulus());
        Self::push_sized(&mut out, &self.manifest);
        out.extend_from_slice(&(self.blocks.len() as u16).to_be_bytes());
        for block in &self.blocks {
            Self::push_sized(&mut out, block);
        }

        let digest = Sha256::digest(&out);
        let signature = keys()
            .manifest_signing
            .sign_with_rng(
                &mut test_rng(),
                Pss::new_with_salt::<Sha256>(tpm_crypt::PSS_SALT_SIZE),
                &digest,
            )
            .unwrap();
        Self::push_sized(&mut out, &signature);
        Self::append_crc(&mut out);
        out
    }

    /// Appends the CRC of everything in `bytes`.
    pub fn append_crc(bytes: &mut Vec<u8>) {
        let crc = tpm_crypt::crc32(bytes).unwrap();
        bytes.extend_from_slice(&crc.to_be_bytes());
    }
}

// === Simulated TPM === //

const RC_SUCCESS: u32 = 0x000;
const RC_BAD_TAG: u32 = 0x01e;
const RC_INITIALIZE: u32 = 0x100;
const RC_FAILURE: u32 = 0x101;
const RC_COMMAND_CODE: u32 = 0x143;
const RC_VALUE: u32 = 0x1c4;
const RC_HIERARCHY: u32 = 0x185;
const RC_HANDLE: u32 = 0x18b;
const RC_POLICY_FAIL: u32 = 0x99d;
const RC_BAD_AUTH: u32 = 0x9a2;

const TPM12_AUTHFAIL: u32 = 0x01;
const TPM12_DEACTIVATED: u32 = 0x06;
const TPM12_DISABLED: u32 = 0x07;
const TPM12_BAD_ORDINAL: u32 = 0x0a;
const TPM12_INVALID_AUTHHANDLE: u32 = 0x22;
const TPM12_DEFEND_LOCK_RUNNING: u32 = 0x803;

/// One command as the simulator received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Received {
    pub code: u32,
    /// TPM 1.2 field-upgrade sub-command.
    pub sub_command: Option<u8>,
    pub timeout: Duration,
}

impl Received {
    fn is_field_upgrade(&self) -> bool {
        (CommandCodeEnum::FieldUpgradeStartVendor as u32
            ..=CommandCodeEnum::FieldUpgradeFinalizeVendor as u32)
            .contains(&self.code)
            || (self.code == OrdinalEnum::FieldUpgrade as u32
                && self.sub_command
                    != Some(tpm12proto::FieldUpgradeSubCommand::InfoRequest as u8))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SimSession {
    pub handle: u32,
    pub policy_code: Option<u32>,
}

/// Simulated TPM. Every field is a knob or observable state.
#[derive(Debug, Clone)]
pub(crate) struct SimTpm {
    pub family: TpmFamily,
    /// Every command times out in the transport.
    pub time_out: bool,
    pub received: Vec<Received>,

    // TPM 2.0
    pub manufacturer: u32,
    pub failure_mode: bool,
    /// `None` models a part without a firmware-update loader.
    pub operation_mode: Option<u8>,
    /// `None` models a part without the field-upgrade properties.
    pub counter: Option<u32>,
    pub counter_self: u32,
    pub firmware_version: FirmwareVersion,
    pub new_firmware_version: Option<FirmwareVersion>,
    pub key_group_id: u32,
    /// Raw `TPMT_HA` reported as the start hash.
    pub start_hash: Option<Vec<u8>>,
    pub ph_enable: bool,
    pub platform_auth_empty: bool,
    pub platform_policy: Option<Vec<u8>>,
    pub sessions: Vec<SimSession>,
    /// Response code for the next start command.
    pub reject_start: Option<u32>,

    // TPM 1.2
    pub tpm12_vendor: [u8; 4],
    pub permanent: PermanentFlags,
    pub volatile: StClearFlags,
    pub owner_auth: Option<[u8; SHA1_DIGEST_SIZE]>,
    pub da_active: bool,
    pub fu_info: IfxFieldUpgradeInfo,
    pub tpm12_field_upgrade: bool,
    /// Result code of the field-upgrade info request.
    pub tpm12_field_upgrade_result: u32,
    /// Corrupts the next response authorization.
    pub corrupt_res_auth: bool,
    pub oiap_sessions: Vec<(u32, [u8; SHA1_DIGEST_SIZE])>,

    // Update progress
    pub secret: Option<Vec<u8>>,
    pub manifest: Option<Vec<u8>>,
    pub blocks: Vec<Vec<u8>>,
    pub finalized: bool,
    pub abandoned: bool,
    pub next_handle: u32,
    pub next_nonce: u8,
}

impl SimTpm {
    pub const FIRMWARE_VERSION: FirmwareVersion = ImageBuilder::CURRENT_VERSION;
    pub const TPM12_FIRMWARE_VERSION: FirmwareVersion = FirmwareVersion::new(4, 43, 257, 0);
    pub const KEY_GROUP_ID: u32 = ImageBuilder::KEY_GROUP_ID;

    /// An operational Infineon TPM 2.0 with a loader, five updates left.
    pub fn tpm20() -> Self {
        Self {
            family: TpmFamily::Tpm20,
            time_out: false,
            received: Vec::new(),
            manufacturer: IFX_MANUFACTURER,
            failure_mode: false,
            operation_mode: Some(0x00),
            counter: Some(5),
            counter_self: 64,
            firmware_version: Self::FIRMWARE_VERSION,
            new_firmware_version: None,
            key_group_id: Self::KEY_GROUP_ID,
            start_hash: None,
            ph_enable: true,
            platform_auth_empty: true,
            platform_policy: None,
            sessions: Vec::new(),
            reject_start: None,
            tpm12_vendor: *b"IFX\0",
            permanent: PermanentFlags::default(),
            volatile: StClearFlags::default(),
            owner_auth: None,
            da_active: false,
            fu_info: IfxFieldUpgradeInfo::default(),
            tpm12_field_upgrade: false,
            tpm12_field_upgrade_result: 0,
            corrupt_res_auth: false,
            oiap_sessions: Vec::new(),
            secret: None,
            manifest: None,
            blocks: Vec::new(),
            finalized: false,
            abandoned: false,
            next_handle: 0,
            next_nonce: 1,
        }
    }

    /// An operational, unowned Infineon TPM 1.2.
    pub fn tpm12() -> Self {
        Self {
            family: TpmFamily::Tpm12,
            operation_mode: None,
            counter: None,
            fu_info: IfxFieldUpgradeInfo {
                max_data_size: 1024,
                firmware_version: Self::TPM12_FIRMWARE_VERSION,
                key_group_id: Self::KEY_GROUP_ID,
                field_upgrade_counter: 64,
                flags: 0x1,
            },
            tpm12_field_upgrade: true,
            ..Self::tpm20()
        }
    }

    /// Command codes of every received command.
    pub fn command_codes(&self) -> Vec<u32> {
        self.received.iter().map(|r| r.code).collect()
    }

    /// Command codes of the received field-upgrade commands, excluding the
    /// TPM 1.2 info request.
    pub fn field_upgrade_commands(&self) -> Vec<u32> {
        self.received
            .iter()
            .filter(|r| r.is_field_upgrade())
            .map(|r| r.code)
            .collect()
    }

    /// Loads a policy session, optionally already bound to `code`.
    pub fn add_policy_session(&mut self, policy_code: Option<u32>) -> u32 {
        let handle = 0x0300_0000 + self.next_handle;
        self.next_handle += 1;
        self.sessions.push(SimSession {
            handle,
            policy_code,
        });
        handle
    }

    /// Policy digest that authorizes only the field-upgrade start command.
    pub fn field_upgrade_policy() -> Vec<u8> {
        Sha256::new()
            .chain_update([0u8; 32])
            .chain_update((CommandCodeEnum::PolicyCommandCode as u32).to_be_bytes())
            .chain_update((CommandCodeEnum::FieldUpgradeStartVendor as u32).to_be_bytes())
            .finalize()
            .to_vec()
    }

    fn nonce(&mut self) -> [u8; SHA1_DIGEST_SIZE] {
        self.next_nonce = self.next_nonce.wrapping_add(1);
        [self.next_nonce; SHA1_DIGEST_SIZE]
    }

    fn begin_upgrade(&mut self, manifest: &[u8], sealed_secret: &[u8]) -> Result<(), u32> {
        let secret = keys()
            .key_group
            .decrypt(Oaep::new_with_label::<Sha1, _>("TCPA"), sealed_secret)
            .map_err(|_| RC_VALUE)?;
        if secret.len() != 32 {
            return Err(RC_VALUE);
        }
        let mut start_hash = (tpm20proto::AlgIdEnum::SHA256 as u16).to_be_bytes().to_vec();
        start_hash.extend_from_slice(&Sha256::digest(manifest));
        self.start_hash = Some(start_hash);
        self.secret = Some(secret);
        self.manifest = Some(manifest.to_vec());
        self.blocks.clear();
        Ok(())
    }

    fn accept_block(&mut self, block: &[u8], tag: &[u8]) -> Result<(), u32> {
        let secret = self.secret.as_ref().ok_or(RC_INITIALIZE)?;
        let index = self.blocks.len() as u32;
        let expected =
            tpm_crypt::hmac_sha1_parts(&secret[..SHA1_DIGEST_SIZE], &[&index.to_be_bytes(), block])
                .unwrap();
        if tag != expected {
            return Err(RC_VALUE);
        }
        self.blocks.push(block.to_vec());
        Ok(())
    }
}

fn reply(tag: u16, response_code: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&((10 + body.len()) as u32).to_be_bytes());
    out.extend_from_slice(&response_code.to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn marshalled<T: Marshal>(value: &T) -> Vec<u8> {
    let mut buffer = [0u8; 1024];
    let mut cursor = WriteCursor::new(&mut buffer).unwrap();
    value.marshal(&mut cursor).unwrap();
    cursor.written().to_vec()
}

fn read_sized<'a>(cursor: &mut ReadCursor<'a>) -> &'a [u8] {
    let size = cursor.read_u16().unwrap();
    cursor.read_bytes(size as usize).unwrap()
}

impl TpmTransport for SimTpm {
    fn transmit(
        &mut self,
        command: &[u8],
        response: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TisError> {
        if self.time_out {
            return Err(TisError::Timeout {
                waiting_for: TisWait::DataAvailable,
            });
        }

        let mut cursor = ReadCursor::new(command).unwrap();
        let tag = cursor.read_u16().unwrap();
        assert_eq!(cursor.read_u32().unwrap() as usize, command.len());
        let code = cursor.read_u32().unwrap();
        let sub_command = (code == OrdinalEnum::FieldUpgrade as u32)
            .then(|| cursor.rest().first().copied())
            .flatten();
        self.received.push(Received {
            code,
            sub_command,
            timeout,
        });

        let reply = match self.family {
            TpmFamily::Tpm20 => self.execute_tpm20(tag, code, cursor),
            TpmFamily::Tpm12 => self.execute_tpm12(tag, code, command, cursor),
        };
        response[..reply.len()].copy_from_slice(&reply);
        Ok(reply.len())
    }
}

// === TPM 2.0 === //

impl SimTpm {
    fn execute_tpm20(&mut self, tag: u16, code: u32, mut body: ReadCursor<'_>) -> Vec<u8> {
        if tag != tpm20proto::TPM20_ST_NO_SESSIONS && tag != tpm20proto::TPM20_ST_SESSIONS {
            return reply(tpm20proto::TPM20_ST_NO_SESSIONS, RC_BAD_TAG, &[]);
        }
        let result = self.tpm20_command(code, &mut body);
        match result {
            Ok(out) if tag == tpm20proto::TPM20_ST_SESSIONS => {
                // Parameter size, parameters, and an empty auth response.
                let mut body = (out.len() as u32).to_be_bytes().to_vec();
                body.extend_from_slice(&out);
                body.extend_from_slice(&[0, 0, 0x01, 0, 0]);
                reply(tpm20proto::TPM20_ST_SESSIONS, RC_SUCCESS, &body)
            }
            Ok(out) => reply(tpm20proto::TPM20_ST_NO_SESSIONS, RC_SUCCESS, &out),
            Err(rc) => reply(tpm20proto::TPM20_ST_NO_SESSIONS, rc, &[]),
        }
    }

    fn tpm20_command(&mut self, code: u32, body: &mut ReadCursor<'_>) -> Result<Vec<u8>, u32> {
        match CommandCodeEnum::from_u32(code) {
            Some(CommandCodeEnum::GetCapability) => self.tpm20_get_capability(body),
            Some(CommandCodeEnum::GetTestResult) => {
                let test_result = if self.failure_mode {
                    RC_FAILURE
                } else {
                    RC_SUCCESS
                };
                let mut out = 0u16.to_be_bytes().to_vec();
                out.extend_from_slice(&test_result.to_be_bytes());
                Ok(out)
            }
            Some(CommandCodeEnum::StartAuthSession) => self.start_auth_session(body),
            Some(CommandCodeEnum::PolicyCommandCode) => {
                let handle = body.read_u32().unwrap();
                let code = body.read_u32().unwrap();
                let session = self
                    .sessions
                    .iter_mut()
                    .find(|s| s.handle == handle)
                    .ok_or(RC_HANDLE)?;
                session.policy_code = Some(code);
                Ok(Vec::new())
            }
            Some(CommandCodeEnum::SetPrimaryPolicy) => self.set_primary_policy(body),
            Some(CommandCodeEnum::FlushContext) => {
                let handle = body.read_u32().unwrap();
                let index = self
                    .sessions
                    .iter()
                    .position(|s| s.handle == handle)
                    .ok_or(RC_HANDLE)?;
                self.sessions.remove(index);
                Ok(Vec::new())
            }
            Some(CommandCodeEnum::FieldUpgradeStartVendor) => self.field_upgrade_start(body),
            Some(CommandCodeEnum::FieldUpgradeManifestVendor) => {
                if !matches!(self.operation_mode, Some(0x01 | 0x81)) {
                    return Err(RC_COMMAND_CODE);
                }
                if let Some(rc) = self.reject_start.take() {
                    return Err(rc);
                }
                let manifest = read_sized(body);
                let sealed = read_sized(body);
                self.begin_upgrade(manifest, sealed).map(|()| Vec::new())
            }
            Some(CommandCodeEnum::FieldUpgradeDataVendor) => {
                let data = read_sized(body);
                let block_tag = read_sized(body);
                self.accept_block(data, block_tag).map(|()| Vec::new())
            }
            Some(CommandCodeEnum::FieldUpgradeFinalizeVendor) => {
                if self.secret.take().is_none() {
                    Err(RC_INITIALIZE)
                } else {
                    self.operation_mode = Some(0x02);
                    self.counter = self.counter.map(|c| c - 1);
                    self.finalized = true;
                    Ok(Vec::new())
                }
            }
            Some(CommandCodeEnum::FieldUpgradeAbandonVendor) => {
                if matches!(self.operation_mode, Some(0x01 | 0x81)) {
                    self.operation_mode = Some(0x00);
                    self.secret = None;
                    self.abandoned = true;
                    Ok(Vec::new())
                } else {
                    Err(RC_COMMAND_CODE)
                }
            }
            None => Err(RC_COMMAND_CODE),
        }
    }

    fn tpm20_get_capability(&mut self, body: &mut ReadCursor<'_>) -> Result<Vec<u8>, u32> {
        let capability = body.read_u32().unwrap();
        let property = body.read_u32().unwrap();
        let _count = body.read_u32().unwrap();

        let mut out = vec![0];
        out.extend_from_slice(&capability.to_be_bytes());
        match capability {
            tpm20proto::TPM20_CAP_TPM_PROPERTIES => {
                let value = match property {
                    tpm20proto::TPM20_PT_MANUFACTURER => self.manufacturer,
                    tpm20proto::TPM20_PT_STARTUP_CLEAR => {
                        TpmaStartupClear::new().with_ph_enable(self.ph_enable).into()
                    }
                    _ => return Err(RC_VALUE),
                };
                for word in [1, property, value] {
                    out.extend_from_slice(&u32::to_be_bytes(word));
                }
            }
            tpm20proto::TPM20_CAP_HANDLES => {
                let handles: Vec<u32> = self
                    .sessions
                    .iter()
                    .map(|s| s.handle)
                    .filter(|&h| h >= property)
                    .collect();
                out.extend_from_slice(&(handles.len() as u32).to_be_bytes());
                for handle in handles {
                    out.extend_from_slice(&handle.to_be_bytes());
                }
            }
            tpm20proto::TPM20_CAP_VENDOR_PROPERTY => {
                if self.failure_mode {
                    return Err(RC_FAILURE);
                }
                let value = self.vendor_property(property)?;
                out.extend_from_slice(&1u32.to_be_bytes());
                out.extend_from_slice(&(value.len() as u16).to_be_bytes());
                out.extend_from_slice(&value);
            }
            _ => return Err(RC_VALUE),
        }
        Ok(out)
    }

    fn vendor_property(&self, property: u32) -> Result<Vec<u8>, u32> {
        match property {
            1 => self.counter.map(|c| c.to_be_bytes().to_vec()).ok_or(RC_VALUE),
            2 => match self.operation_mode {
                Some(_) => Ok(self.counter_self.to_be_bytes().to_vec()),
                None => Err(RC_VALUE),
            },
            3 => self.operation_mode.map(|m| vec![m]).ok_or(RC_VALUE),
            4 => Ok(marshalled(&self.firmware_version)),
            5 => self
                .new_firmware_version
                .map(|v| marshalled(&v))
                .ok_or(RC_VALUE),
            6 => Ok(self.key_group_id.to_be_bytes().to_vec()),
            7 => self.start_hash.clone().ok_or(RC_VALUE),
            _ => Err(RC_VALUE),
        }
    }

    fn start_auth_session(&mut self, body: &mut ReadCursor<'_>) -> Result<Vec<u8>, u32> {
        let _tpm_key = body.read_u32().unwrap();
        let _bind = body.read_u32().unwrap();
        let nonce_caller = read_sized(body);
        let _salt = read_sized(body);
        let session_type = body.read_u8().unwrap();
        let symmetric = body.read_u16().unwrap();
        let auth_hash = body.read_u16().unwrap();
        if session_type != tpm20proto::TPM20_SE_POLICY
            || symmetric != tpm20proto::AlgIdEnum::NULL as u16
            || auth_hash != tpm20proto::AlgIdEnum::SHA256 as u16
            || nonce_caller.len() < 16
        {
            return Err(RC_VALUE);
        }
        let handle = self.add_policy_session(None);
        let mut out = handle.to_be_bytes().to_vec();
        out.extend_from_slice(&16u16.to_be_bytes());
        out.extend_from_slice(&[0x77; 16]);
        Ok(out)
    }

    fn set_primary_policy(&mut self, body: &mut ReadCursor<'_>) -> Result<Vec<u8>, u32> {
        let auth_handle = body.read_u32().unwrap();
        let _auth_size = body.read_u32().unwrap();
        let session = body.read_u32().unwrap();
        let _nonce = read_sized(body);
        let _attributes = body.read_u8().unwrap();
        let password = read_sized(body);
        let digest = read_sized(body);
        let _hash_alg = body.read_u16().unwrap();

        if auth_handle != tpm20proto::TPM20_RH_PLATFORM.value() || !self.ph_enable {
            return Err(RC_HIERARCHY);
        }
        if session != tpm20proto::TPM20_RS_PW.value()
            || !self.platform_auth_empty
            || !password.is_empty()
        {
            return Err(RC_BAD_AUTH);
        }
        self.platform_policy = Some(digest.to_vec());
        Ok(Vec::new())
    }

    fn field_upgrade_start(&mut self, body: &mut ReadCursor<'_>) -> Result<Vec<u8>, u32> {
        if !matches!(self.operation_mode, None | Some(0x00)) {
            return Err(RC_COMMAND_CODE);
        }
        let auth_handle = body.read_u32().unwrap();
        let _auth_size = body.read_u32().unwrap();
        let session_handle = body.read_u32().unwrap();
        let _nonce = read_sized(body);
        let _attributes = body.read_u8().unwrap();
        let _hmac = read_sized(body);
        let manifest = read_sized(body);
        let sealed = read_sized(body);

        if let Some(rc) = self.reject_start.take() {
            return Err(rc);
        }
        if auth_handle != tpm20proto::TPM20_RH_PLATFORM.value() {
            return Err(RC_HIERARCHY);
        }
        let session = self
            .sessions
            .iter()
            .find(|s| s.handle == session_handle)
            .ok_or(RC_HANDLE)?;
        if session.policy_code != Some(CommandCodeEnum::FieldUpgradeStartVendor as u32)
            || self.platform_policy.as_deref() != Some(Self::field_upgrade_policy().as_slice())
        {
            return Err(RC_POLICY_FAIL);
        }
        self.begin_upgrade(manifest, sealed)?;
        // The part restarts into its loader.
        self.operation_mode = Some(0x01);
        self.sessions.clear();
        Ok(Vec::new())
    }
}

// === TPM 1.2 === //

enum Answer {
    /// Output parameters of an unauthorized reply.
    Plain(Vec<u8>),
    /// A complete `AUTH1` reply.
    Auth1(Vec<u8>),
}

struct AuthContext {
    owner_auth: [u8; SHA1_DIGEST_SIZE],
    nonce_odd: [u8; SHA1_DIGEST_SIZE],
    continue_session: u8,
}

impl SimTpm {
    fn execute_tpm12(
        &mut self,
        tag: u16,
        ordinal: u32,
        command: &[u8],
        mut body: ReadCursor<'_>,
    ) -> Vec<u8> {
        if tag != tpm12proto::TPM12_TAG_RQU_COMMAND && tag != tpm12proto::TPM12_TAG_RQU_AUTH1_COMMAND
        {
            return reply(tpm12proto::TPM12_TAG_RSP_COMMAND, RC_BAD_TAG, &[]);
        }
        let body = &mut body;
        let result = match OrdinalEnum::from_u32(ordinal) {
            Some(OrdinalEnum::GetCapability) => {
                self.tpm12_get_capability(body).map(Answer::Plain)
            }
            Some(OrdinalEnum::Oiap) => {
                let handle = 0x0200_0000 + self.next_handle;
                self.next_handle += 1;
                let nonce_even = self.nonce();
                self.oiap_sessions.push((handle, nonce_even));
                let mut out = handle.to_be_bytes().to_vec();
                out.extend_from_slice(&nonce_even);
                Ok(Answer::Plain(out))
            }
            Some(OrdinalEnum::OwnerReadInternalPub) => {
                if self.permanent.disable {
                    Err(TPM12_DISABLED)
                } else if self.permanent.deactivated || self.volatile.deactivated {
                    Err(TPM12_DEACTIVATED)
                } else if tag != tpm12proto::TPM12_TAG_RQU_AUTH1_COMMAND {
                    Err(TPM12_AUTHFAIL)
                } else {
                    self.check_auth(command).map(|auth| {
                        let mut params = Vec::new();
                        params.extend_from_slice(&1u32.to_be_bytes());
                        params.extend_from_slice(&3u16.to_be_bytes());
                        params.extend_from_slice(&1u16.to_be_bytes());
                        for word in [12, 2048, 2, 0] {
                            params.extend_from_slice(&u32::to_be_bytes(word));
                        }
                        params.extend_from_slice(&256u32.to_be_bytes());
                        params.extend_from_slice(&key_group_modulus());
                        self.auth1_reply(ordinal, &params, auth)
                    })
                }
            }
            Some(OrdinalEnum::FieldUpgrade) => self.tpm12_field_upgrade(tag, command, body),
            Some(OrdinalEnum::GetTestResult) | None => Err(TPM12_BAD_ORDINAL),
        };

        match result {
            Ok(Answer::Plain(out)) => {
                reply(tpm12proto::TPM12_TAG_RSP_COMMAND, RC_SUCCESS, &out)
            }
            Ok(Answer::Auth1(out)) => out,
            Err(rc) => reply(tpm12proto::TPM12_TAG_RSP_COMMAND, rc, &[]),
        }
    }

    fn tpm12_get_capability(&mut self, body: &mut ReadCursor<'_>) -> Result<Vec<u8>, u32> {
        let cap_area = body.read_u32().unwrap();
        let sub_cap_size = body.read_u32().unwrap();
        let sub_cap = body.read_bytes(sub_cap_size as usize).unwrap();
        let sub_cap_u32 = match sub_cap.try_into() {
            Ok(bytes) => u32::from_be_bytes(bytes),
            Err(_) => 0,
        };

        let data = match cap_area {
            tpm12proto::TPM12_CAP_VERSION_VAL => marshalled(&tpm12proto::CapVersionInfo {
                version: [1, 2, 3, 16],
                spec_level: 2,
                errata_rev: 3,
                tpm_vendor_id: self.tpm12_vendor,
                vendor_specific: Default::default(),
            }),
            tpm12proto::TPM12_CAP_FLAG => match sub_cap_u32 {
                tpm12proto::TPM12_CAP_FLAG_PERMANENT => marshalled(&PermanentFlags {
                    ownership: self.owner_auth.is_some(),
                    ..self.permanent
                }),
                tpm12proto::TPM12_CAP_FLAG_VOLATILE => marshalled(&self.volatile),
                _ => return Err(RC_VALUE),
            },
            tpm12proto::TPM12_CAP_PROPERTY if sub_cap_u32 == tpm12proto::TPM12_CAP_PROP_OWNER => {
                vec![self.owner_auth.is_some() as u8]
            }
            tpm12proto::TPM12_CAP_DA_LOGIC => {
                // `TPM_DA_INFO_LIMITED`
                let mut out = 0x0038u16.to_be_bytes().to_vec();
                out.push(self.da_active as u8);
                out.extend_from_slice(&0x0039u16.to_be_bytes());
                out.extend_from_slice(&0u32.to_be_bytes());
                out.extend_from_slice(&0u32.to_be_bytes());
                out
            }
            _ => return Err(RC_VALUE),
        };
        let mut out = (data.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(&data);
        Ok(out)
    }

    fn tpm12_field_upgrade(
        &mut self,
        tag: u16,
        command: &[u8],
        body: &mut ReadCursor<'_>,
    ) -> Result<Answer, u32> {
        if !self.tpm12_field_upgrade {
            return Err(TPM12_BAD_ORDINAL);
        }
        let sub_command = body.read_u8().unwrap();
        match sub_command {
            0x11 => {
                if self.tpm12_field_upgrade_result != 0 {
                    return Err(self.tpm12_field_upgrade_result);
                }
                let info = marshalled(&self.fu_info);
                let mut out = (info.len() as u16).to_be_bytes().to_vec();
                out.extend_from_slice(&info);
                Ok(Answer::Plain(out))
            }
            0x34 => {
                let manifest = read_sized(body);
                let sealed = read_sized(body);
                if self.owner_auth.is_none() {
                    self.begin_upgrade(manifest, sealed)?;
                    return Ok(Answer::Plain(Vec::new()));
                }
                if tag != tpm12proto::TPM12_TAG_RQU_AUTH1_COMMAND {
                    return Err(TPM12_AUTHFAIL);
                }
                let auth = self.check_auth(command)?;
                self.begin_upgrade(manifest, sealed)?;
                Ok(self.auth1_reply(OrdinalEnum::FieldUpgrade as u32, &[], auth))
            }
            0x35 => {
                let block = read_sized(body);
                let block_tag = body.read_bytes(SHA1_DIGEST_SIZE).unwrap();
                self.accept_block(block, block_tag)?;
                Ok(Answer::Plain(Vec::new()))
            }
            0x36 => {
                if self.secret.take().is_none() {
                    return Err(RC_VALUE);
                }
                self.fu_info.field_upgrade_counter -= 1;
                self.finalized = true;
                Ok(Answer::Plain(Vec::new()))
            }
            _ => Err(TPM12_BAD_ORDINAL),
        }
    }

    /// Verifies the OIAP authorization trailer of `command`.
    fn check_auth(&mut self, command: &[u8]) -> Result<AuthContext, u32> {
        if self.da_active {
            return Err(TPM12_DEFEND_LOCK_RUNNING);
        }
        let owner_auth = self.owner_auth.ok_or(TPM12_AUTHFAIL)?;
        let trailer = command.len() - tpm12proto::AUTH1_COMMAND_TRAILER_SIZE;
        let mut cursor = ReadCursor::new_unchecked(&command[trailer..]);
        let handle = cursor.read_u32().unwrap();
        let nonce_odd: [u8; SHA1_DIGEST_SIZE] = cursor.read_array().unwrap();
        let continue_session = cursor.read_u8().unwrap();
        let auth: [u8; SHA1_DIGEST_SIZE] = cursor.read_array().unwrap();

        let index = self
            .oiap_sessions
            .iter()
            .position(|(h, _)| *h == handle)
            .ok_or(TPM12_INVALID_AUTHHANDLE)?;
        let (_, nonce_even) = self.oiap_sessions[index];
        if continue_session == 0 {
            self.oiap_sessions.remove(index);
        }

        let param_digest = tpm_crypt::sha1(&command[6..trailer]).unwrap();
        let expected = tpm_crypt::hmac_sha1_parts(
            &owner_auth,
            &[&param_digest, &nonce_even, &nonce_odd, &[continue_session]],
        )
        .unwrap();
        if expected != auth {
            return Err(TPM12_AUTHFAIL);
        }
        Ok(AuthContext {
            owner_auth,
            nonce_odd,
            continue_session,
        })
    }

    /// Builds a complete `AUTH1` response around `params`.
    fn auth1_reply(&mut self, ordinal: u32, params: &[u8], auth: AuthContext) -> Answer {
        let nonce_even = self.nonce();
        let param_digest =
            tpm_crypt::sha1_parts(&[&RC_SUCCESS.to_be_bytes(), &ordinal.to_be_bytes(), params])
                .unwrap();
        let mut res_auth = tpm_crypt::hmac_sha1_parts(
            &auth.owner_auth,
            &[
                &param_digest,
                &nonce_even,
                &auth.nonce_odd,
                &[auth.continue_session],
            ],
        )
        .unwrap();
        if std::mem::take(&mut self.corrupt_res_auth) {
            res_auth[0] ^= 0xff;
        }

        let mut body = params.to_vec();
        body.extend_from_slice(&nonce_even);
        body.push(auth.continue_session);
        body.extend_from_slice(&res_auth);
        Answer::Auth1(reply(
            tpm12proto::TPM12_TAG_RSP_AUTH1_COMMAND,
            RC_SUCCESS,
            &body,
        ))
    }
}
