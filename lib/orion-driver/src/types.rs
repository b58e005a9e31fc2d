/*
 * Orion Operating System - Driver Framework Types
 *
 * Common data structures and types for all Orion OS device drivers.
 *
 * Developed by Jeremy Noverraz (1988-2025)
 * August 2025, Lausanne, Switzerland
 *
 * Copyright (c) 2024-2025 Orion OS Project
 * License: MIT
 */

// ========================================
// BASIC DRIVER TYPES
// ========================================

/// Device type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceType {
    Unknown,
    Pci,
    Isa,
    Platform,
    Block,
}

/// I/O request types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoRequestType {
    Read,
    Write,
    Ioctl,
    Flush,
    Sync,
}

/// Driver information structure
#[derive(Debug, Clone)]
pub struct DriverInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub author: &'static str,
    pub license: &'static str,
}

impl DriverInfo {
    pub fn new(name: &'static str, version: &'static str, description: &'static str) -> Self {
        Self {
            name,
            version,
            description,
            author: "Jeremy Noverraz (1988-2025)",
            license: "MIT",
        }
    }
}

// ========================================
// STORAGE-SPECIFIC TYPES
// ========================================

/// Storage device geometry (cylinders/heads/sectors, as reported by mode
/// sense or synthesised when geometry pages are unavailable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageGeometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors_per_track: u32,
    pub bytes_per_sector: u32,
    pub total_sectors: u64,
}

/// Block driver capability flags, analogous to the per-peripheral
/// capability bits in spec.md's Peripheral model.
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockCapabilities: u32 {
        const REMOVABLE        = 1 << 0;
        const SYNCHRONOUS      = 1 << 1;
        const TAGGED_QUEUING   = 1 << 2;
        const LINKED_COMMANDS  = 1 << 3;
        const RELATIVE_ADDR    = 1 << 4;
        const WRITE_PROTECTED  = 1 << 5;
    }
}
