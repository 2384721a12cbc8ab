// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TIS register layout within one locality window.

use bitfield_struct::bitfield;

/// Size of the register window owned by one locality.
pub const LOCALITY_WINDOW_SIZE: u64 = 0x1000;
/// Mask applied to every register offset.
pub const REGISTER_OFFSET_MASK: u16 = 0x0FFF;
/// Highest locality defined by TIS.
pub const MAX_LOCALITY: u8 = 4;

/// Register offsets relative to the locality window.
pub mod offset {
    /// `TPM_ACCESS_x`
    pub const ACCESS: u16 = 0x00;
    /// `TPM_INT_ENABLE_x`
    pub const INT_ENABLE: u16 = 0x08;
    /// `TPM_INT_STATUS_x`
    pub const INT_STATUS: u16 = 0x10;
    /// `TPM_INTF_CAPABILITY_x`
    pub const INTF_CAPABILITY: u16 = 0x14;
    /// `TPM_STS_x`
    pub const STS: u16 = 0x18;
    /// 16-bit burst count inside `TPM_STS_x`. Never naturally aligned.
    pub const BURST_COUNT: u16 = 0x19;
    /// `TPM_DATA_FIFO_x`
    pub const DATA_FIFO: u16 = 0x24;
    /// `TPM_DID_VID_x`, 32 bit.
    pub const DID_VID: u16 = 0xF00;
    /// `TPM_RID_x`
    pub const RID: u16 = 0xF04;
}

/// `TPM_ACCESS_x`
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct TisAccess {
    /// `tpmEstablishment`
    pub establishment: bool,
    /// `requestUse`
    pub request_use: bool,
    /// `pendingRequest`
    pub pending_request: bool,
    /// `Seize`
    pub seize: bool,
    /// `beenSeized`
    pub been_seized: bool,
    /// `activeLocality`. Writing 1 relinquishes the locality.
    pub active_locality: bool,
    #[bits(1)]
    _reserved: u8,
    /// `tpmRegValidSts`
    pub valid: bool,
}

/// Low byte of `TPM_STS_x`.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct TisStatus {
    #[bits(1)]
    _reserved: u8,
    /// `responseRetry`
    pub response_retry: bool,
    /// `selfTestDone`
    pub self_test_done: bool,
    /// `Expect`: the TPM wants more command bytes.
    pub expect: bool,
    /// `dataAvail`: response bytes are waiting in the FIFO.
    pub data_avail: bool,
    /// `tpmGo`
    pub tpm_go: bool,
    /// `commandReady`
    pub command_ready: bool,
    /// `stsValid`
    pub sts_valid: bool,
}

/// Splits a `TPM_DID_VID_x` value into `(vendor_id, device_id)`.
pub fn split_did_vid(did_vid: u32) -> (u16, u16) {
    (did_vid as u16, (did_vid >> 16) as u16)
}
