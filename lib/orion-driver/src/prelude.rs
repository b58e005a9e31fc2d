/*
 * Orion Driver Framework - Prelude Module
 *
 * Re-exports all essential components for easy driver development.
 *
 * Developed by Jeremy Noverraz (1988-2025)
 * August 2025, Lausanne, Switzerland
 *
 * Copyright (c) 2024-2025 Orion OS Project
 * License: MIT
 */

// Core traits
pub use crate::traits::{OrionDriver, BlockDriver};

// Common types
pub use crate::types::{DriverInfo, DeviceType, IoRequestType, StorageGeometry, BlockCapabilities};

// Device enumeration
pub use crate::device::{DeviceInfo, BusType, DeviceLocation, DeviceResource, ResourceType};

// MMIO
pub use crate::mmio::{MmioAccessor, MmioRegion, MmioPermissions, MmioRegister};

// Error handling
pub use crate::error::{DriverError, DriverResult, ErrorKind};

// Re-export common dependencies
pub use bitflags::bitflags;
pub use spin::Mutex;
pub use spin::RwLock;
