// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::TisBus;
use crate::TisConfig;
use crate::TisError;
use crate::TisWait;
use crate::TpmTransport;
use crate::registers::LOCALITY_WINDOW_SIZE;
use crate::registers::MAX_LOCALITY;
use crate::registers::REGISTER_OFFSET_MASK;
use crate::registers::TisAccess;
use crate::registers::TisStatus;
use crate::registers::offset;
use crate::registers::split_did_vid;
use std::time::Duration;
use tpm_protocol::TPM_HEADER_SIZE;
use tpm_protocol::TPM_PAGE_SIZE;

/// A connected TIS FIFO interface.
///
/// Created by [`TisTransport::connect`] and torn down by
/// [`TisTransport::disconnect`], which hands the bus back after restoring the
/// locality state found at connect time.
pub struct TisTransport<B> {
    bus: B,
    config: TisConfig,
    locality_base: u64,
    active_at_connect: bool,
    holds_locality: bool,
    /// Responses are staged here and only copied out once complete.
    page: Box<[u8; TPM_PAGE_SIZE]>,
}

impl<B: TisBus> TisTransport<B> {
    /// Validates the register window and claims it for this connection.
    pub fn connect(bus: B, config: TisConfig) -> Result<Self, TisError> {
        if config.locality > MAX_LOCALITY {
            return Err(TisError::BadParameter("locality out of range"));
        }
        if config.poll_interval.is_zero() {
            return Err(TisError::BadParameter("zero poll interval"));
        }

        let locality_base =
            config.base_address + u64::from(config.locality) * LOCALITY_WINDOW_SIZE;
        let mut transport = Self {
            bus,
            config,
            locality_base,
            active_at_connect: false,
            holds_locality: false,
            page: Box::new([0; TPM_PAGE_SIZE]),
        };

        let access = transport.read_access();
        if !access.valid() {
            return Err(TisError::AccessInvalid {
                access: access.into_bits(),
            });
        }

        let (vendor_id, device_id) = split_did_vid(transport.read32(offset::DID_VID));
        if let Some(required) = transport.config.required_vendor_id {
            if vendor_id != required {
                return Err(TisError::UnsupportedVendor { vendor_id });
            }
        }

        transport.active_at_connect = access.active_locality();
        transport.holds_locality = transport.active_at_connect;
        if transport.config.keep_locality_active && !transport.holds_locality {
            transport.request_locality()?;
        }

        tracing::info!(
            vendor_id,
            device_id,
            locality = transport.config.locality,
            "TIS transport connected"
        );
        Ok(transport)
    }

    /// Restores the locality state found at connect time and returns the bus.
    pub fn disconnect(mut self) -> B {
        if self.holds_locality && !self.active_at_connect {
            self.release_locality();
        } else if !self.holds_locality && self.active_at_connect {
            if let Err(err) = self.request_locality() {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to restore the active locality"
                );
            }
        }
        tracing::debug!(locality = self.config.locality, "TIS transport disconnected");
        self.bus
    }

    /// The configuration this transport was connected with.
    pub fn config(&self) -> &TisConfig {
        &self.config
    }

    fn address(&self, offset: u16) -> u64 {
        self.locality_base + u64::from(offset & REGISTER_OFFSET_MASK)
    }

    fn read8(&mut self, offset: u16) -> u8 {
        let address = self.address(offset);
        self.bus.read_u8(address)
    }

    fn write8(&mut self, offset: u16, value: u8) {
        let address = self.address(offset);
        self.bus.write_u8(address, value);
    }

    /// Misaligned 16-bit reads are split into two byte reads, low byte first.
    fn read16(&mut self, offset: u16) -> u16 {
        let address = self.address(offset);
        if address % 2 == 0 {
            self.bus.read_u16(address)
        } else {
            let low = self.bus.read_u8(address);
            let high = self.bus.read_u8(address + 1);
            u16::from_le_bytes([low, high])
        }
    }

    fn read32(&mut self, offset: u16) -> u32 {
        let address = self.address(offset);
        self.bus.read_u32(address)
    }

    fn read_access(&mut self) -> TisAccess {
        TisAccess::from_bits(self.read8(offset::ACCESS))
    }

    fn read_status(&mut self) -> TisStatus {
        TisStatus::from_bits(self.read8(offset::STS))
    }

    fn write_status(&mut self, status: TisStatus) {
        self.write8(offset::STS, status.into_bits());
    }

    /// Polls `ready` until it yields a value or `budget` worth of poll
    /// intervals has elapsed.
    fn poll<T>(
        &mut self,
        budget: Duration,
        mut ready: impl FnMut(&mut Self) -> Option<T>,
    ) -> Option<T> {
        let mut waited = Duration::ZERO;
        loop {
            if let Some(value) = ready(self) {
                return Some(value);
            }
            if waited >= budget {
                return None;
            }
            let interval = self.config.poll_interval;
            self.bus.delay(interval);
            waited += interval;
        }
    }

    fn wait_status(
        &mut self,
        budget: Duration,
        waiting_for: TisWait,
        condition: impl Fn(TisStatus) -> bool,
    ) -> Result<TisStatus, TisError> {
        self.poll(budget, |this| {
            let status = this.read_status();
            condition(status).then_some(status)
        })
        .ok_or(TisError::Timeout { waiting_for })
    }

    fn request_locality(&mut self) -> Result<(), TisError> {
        self.write8(
            offset::ACCESS,
            TisAccess::new().with_request_use(true).into_bits(),
        );
        let granted = self.poll(self.config.timeouts.a, |this| {
            let access = this.read_access();
            (access.valid() && access.active_locality()).then_some(())
        });
        if granted.is_none() {
            return Err(TisError::LocalityNotGranted {
                locality: self.config.locality,
            });
        }
        self.holds_locality = true;
        tracing::trace!(locality = self.config.locality, "locality granted");
        Ok(())
    }

    fn release_locality(&mut self) {
        self.write8(
            offset::ACCESS,
            TisAccess::new().with_active_locality(true).into_bits(),
        );
        self.holds_locality = false;
        tracing::trace!(locality = self.config.locality, "locality released");
    }

    fn burst_count(&mut self) -> Result<usize, TisError> {
        self.poll(self.config.timeouts.d, |this| {
            let count = this.read16(offset::BURST_COUNT);
            (count != 0).then_some(usize::from(count))
        })
        .ok_or(TisError::Timeout {
            waiting_for: TisWait::BurstCount,
        })
    }

    fn read_fifo(&mut self, mut received: usize, end: usize) -> Result<(), TisError> {
        while received < end {
            let chunk = self.burst_count()?.min(end - received);
            for index in received..received + chunk {
                let byte = self.read8(offset::DATA_FIFO);
                self.page[index] = byte;
            }
            received += chunk;
        }
        Ok(())
    }

    /// Runs one command through the FIFO and stages the response in
    /// `self.page`.
    fn exchange(
        &mut self,
        command: &[u8],
        capacity: usize,
        timeout: Duration,
    ) -> Result<usize, TisError> {
        let timeouts = self.config.timeouts;

        if !self.read_status().command_ready() {
            self.write_status(TisStatus::new().with_command_ready(true));
            self.wait_status(timeouts.b, TisWait::CommandReady, |sts| {
                sts.command_ready()
            })?;
        }

        let mut sent = 0;
        while sent < command.len() {
            let chunk = self.burst_count()?.min(command.len() - sent);
            for &byte in &command[sent..sent + chunk] {
                self.write8(offset::DATA_FIFO, byte);
            }
            sent += chunk;
        }
        let status = self.wait_status(timeouts.c, TisWait::StatusValid, |sts| sts.sts_valid())?;
        if status.expect() {
            return Err(TisError::CommandNotAccepted);
        }

        self.write_status(TisStatus::new().with_tpm_go(true));
        self.wait_status(timeout, TisWait::DataAvailable, |sts| {
            sts.sts_valid() && sts.data_avail()
        })?;

        self.read_fifo(0, TPM_HEADER_SIZE)?;
        let size = u32::from_be_bytes([self.page[2], self.page[3], self.page[4], self.page[5]]);
        let size_usize = size as usize;
        if size_usize < TPM_HEADER_SIZE || size_usize > capacity {
            return Err(TisError::InvalidResponseSize { size, capacity });
        }
        self.read_fifo(TPM_HEADER_SIZE, size_usize)?;

        let status = self.wait_status(timeouts.c, TisWait::StatusValid, |sts| sts.sts_valid())?;
        if status.data_avail() {
            return Err(TisError::ResponseOverrun);
        }
        Ok(size_usize)
    }
}

impl<B: TisBus> TpmTransport for TisTransport<B> {
    fn transmit(
        &mut self,
        command: &[u8],
        response: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TisError> {
        if command.len() < TPM_HEADER_SIZE {
            return Err(TisError::BadParameter("command shorter than a TPM header"));
        }
        if command.len() > TPM_PAGE_SIZE {
            return Err(TisError::CommandTooLarge {
                size: command.len(),
            });
        }
        if response.len() < TPM_HEADER_SIZE {
            return Err(TisError::BadParameter("response buffer shorter than a TPM header"));
        }

        if !self.holds_locality {
            self.request_locality()?;
        }

        let result = self.exchange(command, response.len().min(TPM_PAGE_SIZE), timeout);

        // Aborts an unfinished command, or returns a finished one to idle.
        self.write_status(TisStatus::new().with_command_ready(true));
        if !self.config.keep_locality_active {
            self.release_locality();
        }

        let size = result.inspect_err(|err| {
            tracing::debug!(
                error = err as &dyn std::error::Error,
                command_size = command.len(),
                "TIS exchange failed"
            );
        })?;
        response[..size].copy_from_slice(&self.page[..size]);
        tracing::trace!(
            command_size = command.len(),
            response_size = size,
            "TIS exchange complete"
        );
        Ok(size)
    }
}
