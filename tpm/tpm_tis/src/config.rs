// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

/// Physical base address of the TIS register space.
pub const DEFAULT_BASE_ADDRESS: u64 = 0xFED4_0000;
/// PCI vendor id of Infineon Technologies.
pub const INFINEON_VENDOR_ID: u16 = 0x15D1;

/// The four TIS profile timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TisTimeouts {
    /// Locality request.
    pub a: Duration,
    /// Command ready.
    pub b: Duration,
    /// Status valid after a FIFO access.
    pub c: Duration,
    /// Burst count.
    pub d: Duration,
}

impl Default for TisTimeouts {
    fn default() -> Self {
        Self {
            a: Duration::from_millis(750),
            b: Duration::from_secs(2),
            c: Duration::from_millis(750),
            d: Duration::from_millis(750),
        }
    }
}

/// Configuration of a [`TisTransport`](crate::TisTransport) connection.
#[derive(Debug, Clone)]
pub struct TisConfig {
    /// Locality to operate in (0 to 4).
    pub locality: u8,
    /// Hold the locality for the whole connection instead of per command.
    pub keep_locality_active: bool,
    /// Physical address of locality 0.
    pub base_address: u64,
    /// Vendor the device must report in `DID_VID`. `None` accepts any vendor.
    pub required_vendor_id: Option<u16>,
    /// Timeouts for every wait except the response itself.
    pub timeouts: TisTimeouts,
    /// Delay between two polls of a status register.
    pub poll_interval: Duration,
}

impl Default for TisConfig {
    fn default() -> Self {
        Self {
            locality: 0,
            keep_locality_active: false,
            base_address: DEFAULT_BASE_ADDRESS,
            required_vendor_id: Some(INFINEON_VENDOR_ID),
            timeouts: TisTimeouts::default(),
            poll_interval: Duration::from_millis(1),
        }
    }
}
