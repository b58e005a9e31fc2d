/*
 * Orion Operating System - Device Information and Management
 *
 * Device detection, enumeration, and information structures
 * for the Orion driver framework.
 *
 * Developed by Jeremy Noverraz (1988-2025)
 * August 2025, Lausanne, Switzerland
 *
 * Copyright (c) 2024-2025 Orion OS Project
 * License: MIT
 */

/// Device information structure, as handed to a driver's `init()` by the
/// card-discovery collaborator (autoconfig/PCI enumeration). The core never
/// constructs this itself.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device vendor ID
    pub vendor_id: u16,
    /// Device product/device ID
    pub device_id: u16,
    /// Device class
    pub class: u8,
    /// Device subclass
    pub subclass: u8,
    /// Device programming interface
    pub prog_if: u8,
    /// Device revision
    pub revision: u8,
    /// Bus type
    pub bus_type: BusType,
    /// Device location on bus
    pub location: DeviceLocation,
    /// Base address registers
    pub bars: [u64; 6],
    /// IRQ number
    pub irq: Option<u8>,
    /// Device name (if known)
    pub name: Option<&'static str>,
}

/// Bus type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    /// PCI / Zorro-style expansion bus
    Pci,
    /// Platform device (integrated at a fixed address)
    Platform,
    /// Virtual device (used in tests)
    Virtual,
}

/// Device location on bus
#[derive(Debug, Clone, Copy)]
pub struct DeviceLocation {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl DeviceInfo {
    pub fn new(vendor_id: u16, device_id: u16, bus_type: BusType) -> Self {
        Self {
            vendor_id,
            device_id,
            class: 0,
            subclass: 0,
            prog_if: 0,
            revision: 0,
            bus_type,
            location: DeviceLocation { bus: 0, device: 0, function: 0 },
            bars: [0; 6],
            irq: None,
            name: None,
        }
    }

    /// Mass-storage controller (PCI class 0x01).
    pub fn is_storage_device(&self) -> bool {
        self.class == 0x01
    }
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self::new(0, 0, BusType::Virtual)
    }
}

/// Resource type for device resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Memory,
    Irq,
}

/// Device resource descriptor
#[derive(Debug, Clone, Copy)]
pub struct DeviceResource {
    pub resource_type: ResourceType,
    pub start: u64,
    pub end: u64,
}

impl DeviceResource {
    pub fn memory(start: u64, size: u64) -> Self {
        Self { resource_type: ResourceType::Memory, start, end: start + size - 1 }
    }

    pub fn irq(irq_num: u8) -> Self {
        Self { resource_type: ResourceType::Irq, start: irq_num as u64, end: irq_num as u64 }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}
