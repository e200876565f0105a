//! PEI Core HOB List
//!
//! The HOB list lives in a byte region owned by the core: temporary RAM before memory migration, permanent memory
//! after it. The Phase Handoff Information Table (PHIT) at the start of the region is the only bookkeeping; every
//! operation reads and rewrites it in place, so copying the region is all it takes to move the list.
//!
//! ```text
//!   memory_bottom                                   free_memory_top              memory_top
//!   | PHIT | HOB | HOB | ... | END | free ...       | page allocations (grow down) |
//!                                  ^ free_memory_bottom
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::{ffi::c_void, mem::size_of, ptr};

use patina_pei::{
    base::{align_down, align_up, UEFI_PAGE_SIZE},
    error::{EfiError, Result},
    pi::{
        boot_mode::BootMode,
        hob::{self, header},
    },
};
use r_efi::efi;

const HOB_HEADER_SIZE: u64 = size_of::<header::Hob>() as u64;
const PHIT_SIZE: u64 = size_of::<hob::PhaseHandoffInformationTable>() as u64;

/// One record of the HOB list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HobRef {
    pub address: u64,
    pub header: header::Hob,
}

/// The HOB list of the running core, addressed through its PHIT.
#[derive(Debug)]
pub(crate) struct HobList {
    phit: u64,
}

impl HobList {
    /// Bytes a new list needs for the PHIT and the END HOB.
    pub const MINIMUM_SIZE: u64 = PHIT_SIZE + HOB_HEADER_SIZE;

    /// Writes a PHIT and an END HOB at `base`, describing `[base, base + length)`.
    ///
    /// ## Safety
    ///
    /// `[base, base + length)` must be writable and used by nothing but this HOB list for as long as it exists.
    pub unsafe fn create(base: u64, length: u64, boot_mode: BootMode) -> Result<Self> {
        if base == 0 || base % 8 != 0 || length < Self::MINIMUM_SIZE {
            return Err(EfiError::InvalidParameter);
        }
        let memory_top = base.checked_add(length).ok_or(EfiError::InvalidParameter)?;
        let end_of_hob_list = base + PHIT_SIZE;
        let phit = hob::PhaseHandoffInformationTable {
            header: header::Hob::new(hob::HANDOFF, PHIT_SIZE as u16),
            version: hob::EFI_HOB_HANDOFF_TABLE_VERSION,
            boot_mode: boot_mode.into(),
            memory_top,
            memory_bottom: base,
            free_memory_top: memory_top,
            free_memory_bottom: end_of_hob_list + HOB_HEADER_SIZE,
            end_of_hob_list,
        };
        // Safety: caller guarantees the range is writable; length covers PHIT and END.
        unsafe {
            ptr::write_unaligned(base as *mut hob::PhaseHandoffInformationTable, phit);
            ptr::write_unaligned(end_of_hob_list as *mut header::Hob, header::Hob::end());
        }
        log::trace!("HOB list created at {:#x}, memory {:#x}..{:#x}", base, base, memory_top);
        Ok(Self { phit: base })
    }

    /// Adopts a HOB list whose PHIT is at `phit`.
    ///
    /// ## Safety
    ///
    /// `phit` must be the PHIT of a well formed HOB list that is exclusively owned by the caller.
    pub unsafe fn from_phit(phit: u64) -> Self {
        Self { phit }
    }

    pub fn address(&self) -> u64 {
        self.phit
    }

    pub fn phit(&self) -> hob::PhaseHandoffInformationTable {
        // Safety: the PHIT is valid for the lifetime of the list.
        unsafe { ptr::read_unaligned(self.phit as *const hob::PhaseHandoffInformationTable) }
    }

    fn write_phit(&mut self, phit: hob::PhaseHandoffInformationTable) {
        // Safety: the PHIT is valid for the lifetime of the list.
        unsafe { ptr::write_unaligned(self.phit as *mut hob::PhaseHandoffInformationTable, phit) }
    }

    /// Bytes from the PHIT through the END HOB.
    pub fn used_size(&self) -> u64 {
        self.phit().end_of_hob_list + HOB_HEADER_SIZE - self.phit
    }

    pub fn boot_mode(&self) -> Result<BootMode> {
        BootMode::try_from(self.phit().boot_mode)
    }

    pub fn set_boot_mode(&mut self, boot_mode: BootMode) {
        let mut phit = self.phit();
        phit.boot_mode = boot_mode.into();
        self.write_phit(phit);
    }

    /// Appends a HOB of `length` bytes (rounded up to 8) and moves the END HOB behind it.
    pub fn create_hob(&mut self, hob_type: u16, length: u16) -> Result<*mut c_void> {
        if (length as u64) < HOB_HEADER_SIZE || length > hob::MAX_HOB_LENGTH {
            return Err(EfiError::InvalidParameter);
        }
        let length = align_up(length as u64, 8)?;

        let mut phit = self.phit();
        let hob_address = phit.end_of_hob_list;
        let new_end = hob_address + length;
        if new_end + HOB_HEADER_SIZE > phit.free_memory_top {
            log::error!(
                "Out of HOB space: need {:#x} bytes, free {:#x}..{:#x}",
                length,
                phit.free_memory_bottom,
                phit.free_memory_top
            );
            return Err(EfiError::OutOfResources);
        }

        // Safety: the range up to the new END HOB is below free_memory_top and owned by the list.
        unsafe {
            ptr::write_unaligned(hob_address as *mut header::Hob, header::Hob::new(hob_type, length as u16));
            ptr::write_unaligned(new_end as *mut header::Hob, header::Hob::end());
        }
        phit.end_of_hob_list = new_end;
        phit.free_memory_bottom = new_end + HOB_HEADER_SIZE;
        self.write_phit(phit);

        log::trace!("Created HOB type {:#x} length {:#x} at {:#x}", hob_type, length, hob_address);
        Ok(hob_address as *mut c_void)
    }

    /// Allocates `size` bytes inside a memory pool HOB.
    pub fn allocate_pool(&mut self, size: usize) -> Result<*mut c_void> {
        let length = (size as u64)
            .checked_add(HOB_HEADER_SIZE)
            .filter(|length| *length <= hob::MAX_HOB_LENGTH as u64)
            .ok_or(EfiError::OutOfResources)?;
        let hob = self.create_hob(hob::MEMORY_POOL, length as u16)?;
        Ok((hob as u64 + HOB_HEADER_SIZE) as *mut c_void)
    }

    /// Appends a memory allocation HOB.
    pub fn build_memory_allocation_hob(
        &mut self,
        name: efi::Guid,
        base: efi::PhysicalAddress,
        length: u64,
        memory_type: efi::MemoryType,
    ) -> Result<()> {
        let hob = self.create_hob(hob::MEMORY_ALLOCATION, size_of::<hob::MemoryAllocation>() as u16)?;
        let record = hob::MemoryAllocation {
            header: header::Hob::new(hob::MEMORY_ALLOCATION, size_of::<hob::MemoryAllocation>() as u16),
            alloc_descriptor: header::MemoryAllocation {
                name,
                memory_base_address: base,
                memory_length: length,
                memory_type,
                reserved: [0; 4],
            },
        };
        // Safety: create_hob returned a record large enough for the allocation HOB.
        unsafe { ptr::write_unaligned(hob as *mut hob::MemoryAllocation, record) };
        Ok(())
    }

    /// Carves `pages` pages from the top of free memory and records them in a memory allocation HOB.
    pub fn allocate_pages(&mut self, memory_type: efi::MemoryType, pages: usize) -> Result<efi::PhysicalAddress> {
        if pages == 0 {
            return Err(EfiError::InvalidParameter);
        }
        let size = (pages as u64).checked_mul(UEFI_PAGE_SIZE as u64).ok_or(EfiError::OutOfResources)?;

        let phit = self.phit();
        let top = align_down(phit.free_memory_top, UEFI_PAGE_SIZE as u64)?;
        // The allocation HOB itself must still fit below the new free top.
        let floor = phit.free_memory_bottom + size_of::<hob::MemoryAllocation>() as u64;
        let base = match top.checked_sub(size) {
            Some(base) if base >= floor => base,
            _ => {
                log::error!("AllocatePages({:#x}) out of resources, free {:#x}..{:#x}", pages, floor, top);
                return Err(EfiError::OutOfResources);
            }
        };

        let mut updated = phit;
        updated.free_memory_top = base;
        self.write_phit(updated);
        if let Err(err) = self.build_memory_allocation_hob(efi::Guid::from_bytes(&[0; 16]), base, size, memory_type) {
            self.write_phit(phit);
            return Err(err);
        }
        Ok(base)
    }

    /// Iterates the records up to, not including, the END HOB.
    pub fn iter(&self) -> impl Iterator<Item = HobRef> + '_ {
        let end = self.phit().end_of_hob_list;
        let mut address = self.phit;
        core::iter::from_fn(move || {
            if address >= end {
                return None;
            }
            // Safety: every record below end_of_hob_list was written through create_hob.
            let header = unsafe { ptr::read_unaligned(address as *const header::Hob) };
            if header.r#type == hob::END_OF_HOB_LIST || header.length == 0 {
                return None;
            }
            let record = HobRef { address, header };
            address += header.length as u64;
            Some(record)
        })
    }

    /// Reads the memory allocation HOB at `hob`.
    pub fn memory_allocation(&self, hob: &HobRef) -> Option<hob::MemoryAllocation> {
        (hob.header.r#type == hob::MEMORY_ALLOCATION).then(|| {
            // Safety: the type tag identifies the record layout.
            unsafe { ptr::read_unaligned(hob.address as *const hob::MemoryAllocation) }
        })
    }

    pub fn write_memory_allocation(&mut self, hob: &HobRef, record: hob::MemoryAllocation) {
        // Safety: hob came from iter() over this list.
        unsafe { ptr::write_unaligned(hob.address as *mut hob::MemoryAllocation, record) }
    }

    pub fn firmware_volume(&self, hob: &HobRef) -> Option<hob::FirmwareVolume> {
        (hob.header.r#type == hob::FV).then(|| {
            // Safety: the type tag identifies the record layout.
            unsafe { ptr::read_unaligned(hob.address as *const hob::FirmwareVolume) }
        })
    }

    pub fn write_firmware_volume(&mut self, hob: &HobRef, record: hob::FirmwareVolume) {
        // Safety: hob came from iter() over this list.
        unsafe { ptr::write_unaligned(hob.address as *mut hob::FirmwareVolume, record) }
    }

    /// Rewrites the PHIT after the list was copied to new memory.
    pub fn rebase_phit(
        &mut self,
        memory_bottom: u64,
        memory_top: u64,
        free_memory_top: u64,
        end_of_hob_list: u64,
    ) {
        let mut phit = self.phit();
        phit.memory_bottom = memory_bottom;
        phit.memory_top = memory_top;
        phit.free_memory_top = free_memory_top;
        phit.end_of_hob_list = end_of_hob_list;
        phit.free_memory_bottom = end_of_hob_list + HOB_HEADER_SIZE;
        self.write_phit(phit);
    }
}
