//! The PEI Services interface.
//!
//! Every PEIM entry point and every PPI notify callback receives a `&mut dyn PeiServices`. The PEI Core is the only
//! production implementor; PEIMs can unit test against `MockPeiServices` (feature `mockall`).
//!
//! ## Examples
//!
//! ```
//! use core::ffi::c_void;
//! use patina_pei::{
//!     error::Result,
//!     pi::ppi::PpiDescriptor,
//!     services::{FileHandle, PeiServices},
//! };
//! use r_efi::efi;
//!
//! static PLATFORM_PPI_GUID: efi::Guid =
//!     efi::Guid::from_fields(0x3a7c1b9e, 0x41f2, 0x4b6d, 0x8c, 0x05, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
//! static PLATFORM_PPI: u64 = 0;
//! static PPI_LIST: [PpiDescriptor; 1] =
//!     [PpiDescriptor::new(&PLATFORM_PPI_GUID, &PLATFORM_PPI as *const u64 as *mut c_void).terminate()];
//!
//! fn platform_peim_entry(_file: FileHandle, services: &mut dyn PeiServices) -> Result<()> {
//!     services.install_ppi(&PPI_LIST)
//! }
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::ffi::c_void;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use r_efi::efi;

use crate::{
    error::Result,
    pi::{
        boot_mode::BootMode,
        ppi::{NotifyDescriptor, PpiDescriptor},
        status_code::{EfiStatusCodeType, EfiStatusCodeValue},
    },
};

/// Opaque handle of a firmware file: the address of its FFS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileHandle(pub u64);

/// Entry point of a PEI module.
pub type PeimEntryPoint = fn(file: FileHandle, services: &mut dyn PeiServices) -> Result<()>;

/// Result of a successful [`PeiServices::locate_ppi`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatedPpi {
    /// The descriptor that published the PPI, usable as the identity argument of
    /// [`PeiServices::reinstall_ppi`].
    pub descriptor: *const PpiDescriptor,
    /// The published interface.
    pub ppi: *mut c_void,
}

/// Services the PEI Core exposes to PEIMs.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait PeiServices {
    /// Installs every descriptor of a terminated PPI list.
    ///
    /// ## Errors
    ///
    /// Returns [`InvalidParameter`](crate::error::EfiError::InvalidParameter) if the list is empty, not terminated,
    /// or holds a descriptor with a null GUID, a null interface or without the PPI flag. Returns
    /// [`OutOfResources`](crate::error::EfiError::OutOfResources) if the PPI database is full. No descriptor is
    /// installed on error.
    fn install_ppi(&mut self, ppi_list: &[PpiDescriptor]) -> Result<()>;

    /// Replaces the installed descriptor `old` (matched by address) with `new`, keeping its position.
    ///
    /// ## Errors
    ///
    /// Returns [`NotFound`](crate::error::EfiError::NotFound) if `old` was never installed, and
    /// [`InvalidParameter`](crate::error::EfiError::InvalidParameter) if `new` is malformed.
    fn reinstall_ppi(&mut self, old: &PpiDescriptor, new: &PpiDescriptor) -> Result<()>;

    /// Locates the `instance`-th (0-based, install order) PPI published under `guid`.
    ///
    /// ## Errors
    ///
    /// Returns [`NotFound`](crate::error::EfiError::NotFound) if there is no such instance.
    fn locate_ppi(&self, guid: &efi::Guid, instance: usize) -> Result<LocatedPpi>;

    /// Registers every descriptor of a terminated notify list.
    ///
    /// Callback notifies fire immediately for each matching PPI that is already installed.
    ///
    /// ## Errors
    ///
    /// Same validation and capacity failures as [`install_ppi`](PeiServices::install_ppi).
    fn notify_ppi(&mut self, notify_list: &[NotifyDescriptor]) -> Result<()>;

    /// Returns the boot mode recorded in the PHIT HOB.
    fn get_boot_mode(&self) -> Result<BootMode>;

    /// Records a new boot mode in the PHIT HOB.
    fn set_boot_mode(&mut self, boot_mode: BootMode) -> Result<()>;

    /// Returns the address of the first HOB (the PHIT).
    fn get_hob_list(&self) -> Result<*const c_void>;

    /// Appends a HOB of `length` bytes (header included, rounded up to 8) and returns its address.
    ///
    /// The header is initialized; the body is left for the caller to fill.
    fn create_hob(&mut self, hob_type: u16, length: u16) -> Result<*mut c_void>;

    /// Registers the permanent memory range discovered by the platform. The core migrates to it once the calling
    /// PEIM returns.
    ///
    /// ## Errors
    ///
    /// Returns [`InvalidParameter`](crate::error::EfiError::InvalidParameter) for an empty or overflowing range, or
    /// if permanent memory was already installed.
    fn install_pei_memory(&mut self, memory_begin: efi::PhysicalAddress, memory_length: u64) -> Result<()>;

    /// Allocates `pages` 4KiB pages and records them in a memory allocation HOB.
    fn allocate_pages(&mut self, memory_type: efi::MemoryType, pages: usize) -> Result<efi::PhysicalAddress>;

    /// Allocates `size` bytes from the HOB heap.
    fn allocate_pool(&mut self, size: usize) -> Result<*mut c_void>;

    /// Forwards a status code to the platform's status code reporter.
    fn report_status_code(
        &self,
        code_type: EfiStatusCodeType,
        value: EfiStatusCodeValue,
        instance: u32,
        caller_id: Option<efi::Guid>,
        data: &[u8],
    ) -> Result<()>;
}
