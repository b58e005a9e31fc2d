/*
 * Orion Driver Framework - Core Traits
 *
 * Defines the core traits that all Orion OS drivers must implement.
 *
 * Developed by Jeremy Noverraz (1988-2025)
 * August 2025, Lausanne, Switzerland
 *
 * Copyright (c) 2024-2025 Orion OS Project
 * License: MIT
 */

use crate::device::DeviceInfo;
use crate::error::DriverResult;

/// Base trait for all Orion OS drivers
pub trait OrionDriver: Send + Sync {
    /// Probe if driver can handle a device
    fn probe(device: &DeviceInfo) -> DriverResult<bool>
    where
        Self: Sized;

    /// Get driver information
    fn get_info(&self) -> &'static str;

    /// Get driver version
    fn get_version(&self) -> &'static str;

    /// Initialize the driver
    fn init(&mut self, device: DeviceInfo) -> DriverResult<()>;

    /// Handle IRQ/interrupt
    fn handle_irq(&mut self) -> DriverResult<()>;

    /// Shutdown the driver
    fn shutdown(&mut self) -> DriverResult<()>;
}

/// Block device driver trait
pub trait BlockDriver: OrionDriver {
    /// Read blocks starting at `lba` into `buffer`. Returns bytes read.
    fn read_blocks(&mut self, lba: u64, count: u32, buffer: &mut [u8]) -> DriverResult<usize>;

    /// Write blocks starting at `lba` from `buffer`. Returns bytes written.
    fn write_blocks(&mut self, lba: u64, count: u32, buffer: &[u8]) -> DriverResult<usize>;

    /// Get device capacity in blocks
    fn get_capacity(&self) -> DriverResult<u64>;

    /// Get block size in bytes
    fn get_block_size(&self) -> DriverResult<u32>;
}
