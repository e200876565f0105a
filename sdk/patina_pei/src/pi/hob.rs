//! Hand-Off Block (HOB) record layouts (PI Spec Volume 3, chapter 5).
//!
//! Every HOB starts with a [`header::Hob`] and is 8-byte aligned. The list is terminated by a header of type
//! [`END_OF_HOB_LIST`], and the first record is always the Phase Handoff Information Table
//! ([`PhaseHandoffInformationTable`]).
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::mem::size_of;

use r_efi::efi;

// HOB type field is a UINT16
pub const HANDOFF: u16 = 0x0001;
pub const MEMORY_ALLOCATION: u16 = 0x0002;
pub const RESOURCE_DESCRIPTOR: u16 = 0x0003;
pub const GUID_EXTENSION: u16 = 0x0004;
pub const FV: u16 = 0x0005;
pub const CPU: u16 = 0x0006;
pub const MEMORY_POOL: u16 = 0x0007;
pub const FV2: u16 = 0x0009;
pub const UNUSED: u16 = 0xFFFE;
pub const END_OF_HOB_LIST: u16 = 0xFFFF;

/// Version of the PHIT layout produced by this crate.
pub const EFI_HOB_HANDOFF_TABLE_VERSION: u32 = 0x0009;

/// Largest value the 16-bit HOB length field can describe while keeping 8-byte alignment.
pub const MAX_HOB_LENGTH: u16 = 0xFFF8;

pub mod header {
    use super::*;

    /// Describes the format and size of the data inside the HOB.
    /// All HOBs must contain this generic HOB header.
    #[repr(C)]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Hob {
        pub r#type: u16,
        pub length: u16,
        pub reserved: u32,
    }

    impl Hob {
        pub const fn new(r#type: u16, length: u16) -> Self {
            Self { r#type, length, reserved: 0 }
        }

        /// The header that terminates a HOB list.
        pub const fn end() -> Self {
            Self::new(END_OF_HOB_LIST, size_of::<Hob>() as u16)
        }
    }

    /// Describes the various attributes of the logical memory allocation.
    #[repr(C)]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct MemoryAllocation {
        /// A GUID that defines the memory allocation region's type and purpose, or all zeros.
        pub name: efi::Guid,
        pub memory_base_address: efi::PhysicalAddress,
        pub memory_length: u64,
        pub memory_type: efi::MemoryType,
        pub reserved: [u8; 4],
    }
}

/// Contains general state information used by the HOB producer phase.
/// This HOB must be the first one in the HOB list.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PhaseHandoffInformationTable {
    pub header: header::Hob,
    pub version: u32,
    pub boot_mode: u32,
    /// Highest address of the memory region described by this HOB list.
    pub memory_top: efi::PhysicalAddress,
    /// Lowest address of the memory region; the HOB list starts here.
    pub memory_bottom: efi::PhysicalAddress,
    /// Highest free address. Page allocations are carved downward from here.
    pub free_memory_top: efi::PhysicalAddress,
    /// Lowest free address, immediately above the END HOB.
    pub free_memory_bottom: efi::PhysicalAddress,
    /// Address of the END HOB.
    pub end_of_hob_list: efi::PhysicalAddress,
}

/// Describes all memory ranges used during the HOB producer phase that exist outside the HOB list.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryAllocation {
    pub header: header::Hob,
    pub alloc_descriptor: header::MemoryAllocation,
}

/// Allows writers of executable content in the HOB producer phase to maintain and manage HOBs with specific GUID.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GuidHob {
    pub header: header::Hob,
    pub name: efi::Guid,
}

/// Details the location of firmware volumes that contain firmware files.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FirmwareVolume {
    pub header: header::Hob,
    pub base_address: efi::PhysicalAddress,
    pub length: u64,
}

/// Name of the memory allocation HOB that describes the PEI stack in permanent memory.
pub const MEMORY_ALLOC_STACK_GUID: efi::Guid =
    efi::Guid::from_fields(0x4ed4bf27, 0x4092, 0x42e9, 0x80, 0x7d, &[0x52, 0x7b, 0x1d, 0x00, 0xc9, 0xbd]);
