//! PEI Core Memory Migration
//!
//! Moves the core from temporary RAM into the permanent memory a PEIM installs. The permanent range is laid out as
//!
//! ```text
//!   base                                                                               base + length
//!   | stack (SEC stack copied to its top) | HOB list | free ... | pre-memory page allocations |
//! ```
//!
//! Everything the core tracked inside the moved ranges is rebased through one translation: the PPI database, the
//! dispatcher's volume table, the memory allocation and FV HOBs. Addresses outside the moved ranges (flash, PEIM
//! statics) are left as they are.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use core::{ffi::c_void, mem::size_of, ptr};

use patina_pei::{
    base::{align_down, align_up, UEFI_PAGE_SIZE},
    error::{EfiError, Result},
    pi::{
        hob,
        ppi::{PpiDescriptor, MEMORY_DISCOVERED_PPI_GUID},
        status_code::{EFI_ERROR_CODE, EFI_ERROR_UNRECOVERED, EFI_SOFTWARE_PEI_CORE, EFI_SW_EC_OUT_OF_RESOURCES},
    },
};
use r_efi::efi;

use crate::{hob_list::HobList, CoreInstance};

/// Where the core runs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemoryPhase {
    Temporary,
    /// A PEIM installed permanent memory; the core has not moved yet.
    Installed { base: efi::PhysicalAddress, length: u64 },
    Permanent { base: efi::PhysicalAddress, length: u64 },
}

/// A range copied to a new address during migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RangeMove {
    source: u64,
    destination: u64,
    length: u64,
}

impl RangeMove {
    fn translate(&self, address: u64) -> Option<u64> {
        (address >= self.source && address - self.source < self.length)
            .then(|| self.destination + (address - self.source))
    }

    /// ## Safety
    ///
    /// Both ranges must be valid for `length` bytes.
    unsafe fn copy(&self) {
        if self.length != 0 {
            // Safety: caller guarantees both ranges; ptr::copy tolerates overlap.
            unsafe { ptr::copy(self.source as *const u8, self.destination as *mut u8, self.length as usize) }
        }
    }
}

fn translate(moves: &[RangeMove], address: u64) -> u64 {
    moves.iter().find_map(|range| range.translate(address)).unwrap_or(address)
}

/// Placement of the core's state in permanent memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MigrationLayout {
    stack: RangeMove,
    stack_size: u64,
    hob_list: RangeMove,
    pages: RangeMove,
    memory_top: u64,
}

static MEMORY_DISCOVERED_MARKER: u8 = 0;

static MEMORY_DISCOVERED_PPI_LIST: [PpiDescriptor; 1] = [PpiDescriptor::new(
    &MEMORY_DISCOVERED_PPI_GUID,
    &MEMORY_DISCOVERED_MARKER as *const u8 as *mut c_void,
)
.terminate()];

impl CoreInstance {
    /// Records the permanent memory range. The move happens when the running PEIM returns to the dispatcher.
    pub(crate) fn install_permanent_memory(&mut self, base: efi::PhysicalAddress, length: u64) -> Result<()> {
        let Some(end) = base.checked_add(length).filter(|_| length != 0) else {
            log::error!("InstallPeiMemory({:#x}, {:#x}): invalid range", base, length);
            return Err(EfiError::InvalidParameter);
        };
        if self.memory != MemoryPhase::Temporary {
            log::error!("InstallPeiMemory called again in phase {:?}", self.memory);
            return Err(EfiError::InvalidParameter);
        }
        let ram = &self.sec_core_data;
        if base < ram.temporary_ram_base.saturating_add(ram.temporary_ram_size) && ram.temporary_ram_base < end {
            log::error!("Permanent memory {:#x}..{:#x} overlaps temporary RAM", base, end);
            return Err(EfiError::InvalidParameter);
        }

        log::info!("Permanent memory installed at {:#x}..{:#x}", base, end);
        self.memory = MemoryPhase::Installed { base, length };
        Ok(())
    }

    fn migration_layout(&self, base: u64, length: u64) -> Result<MigrationLayout> {
        let page = UEFI_PAGE_SIZE as u64;
        let sec = &self.sec_core_data;
        let phit = self.hob_list.phit();

        let stack_size = align_up(self.config.permanent_stack_size.max(sec.stack_size), page)?;
        let stack_top = base.checked_add(stack_size).ok_or(EfiError::OutOfResources)?;
        let stack =
            RangeMove { source: sec.stack_base, destination: stack_top - sec.stack_size, length: sec.stack_size };

        let hob_list =
            RangeMove { source: self.hob_list.address(), destination: stack_top, length: self.hob_list.used_size() };
        let hob_end = stack_top
            .checked_add(hob_list.length + size_of::<hob::MemoryAllocation>() as u64)
            .ok_or(EfiError::OutOfResources)?;

        let pages_length = phit.memory_top - phit.free_memory_top;
        let top = base.checked_add(length).ok_or(EfiError::OutOfResources)?;
        let pages_base = top.checked_sub(pages_length).map(|address| align_down(address, page)).transpose()?;
        match pages_base {
            Some(pages_base) if pages_base >= hob_end => Ok(MigrationLayout {
                stack,
                stack_size,
                hob_list,
                pages: RangeMove { source: phit.free_memory_top, destination: pages_base, length: pages_length },
                memory_top: pages_base + pages_length,
            }),
            _ => {
                log::error!(
                    "Permanent memory {:#x}+{:#x} cannot hold stack {:#x}, HOB list {:#x} and pages {:#x}",
                    base,
                    length,
                    stack_size,
                    hob_list.length,
                    pages_length
                );
                Err(EfiError::OutOfResources)
            }
        }
    }

    /// Moves the core into the installed permanent memory and returns the instance that runs from there.
    ///
    /// On failure the boot cannot continue: the error is reported and [`EfiError::DeviceError`] returned.
    pub(crate) fn migrate(mut self) -> Result<CoreInstance> {
        let MemoryPhase::Installed { base, length } = self.memory else {
            return Ok(self);
        };
        let layout = match self.migration_layout(base, length) {
            Ok(layout) => layout,
            Err(_) => {
                self.report_error(
                    EFI_ERROR_CODE | EFI_ERROR_UNRECOVERED,
                    EFI_SOFTWARE_PEI_CORE | EFI_SW_EC_OUT_OF_RESOURCES,
                );
                return Err(EfiError::DeviceError);
            }
        };
        log::info!("Migrating to permanent memory: {:#x?}", layout);

        let moves = [layout.stack, layout.hob_list, layout.pages];
        // Safety: sources are temporary RAM owned by the core; destinations lie inside the permanent range the
        // installing PEIM handed over, and the layout keeps them disjoint.
        unsafe { moves.iter().for_each(|range| range.copy()) };

        // Safety: the HOB list was copied whole to its destination.
        let mut hob_list = unsafe { HobList::from_phit(layout.hob_list.destination) };
        hob_list.rebase_phit(
            base,
            layout.memory_top,
            layout.pages.destination,
            translate(&moves, self.hob_list.phit().end_of_hob_list),
        );
        let records = hob_list.iter().collect::<Vec<_>>();
        for record in records {
            if let Some(mut allocation) = hob_list.memory_allocation(&record) {
                allocation.alloc_descriptor.memory_base_address =
                    translate(&moves, allocation.alloc_descriptor.memory_base_address);
                hob_list.write_memory_allocation(&record, allocation);
            } else if let Some(mut volume) = hob_list.firmware_volume(&record) {
                volume.base_address = translate(&moves, volume.base_address);
                hob_list.write_firmware_volume(&record, volume);
            }
        }
        if hob_list
            .build_memory_allocation_hob(hob::MEMORY_ALLOC_STACK_GUID, base, layout.stack_size, efi::BOOT_SERVICES_DATA)
            .is_err()
        {
            self.report_error(
                EFI_ERROR_CODE | EFI_ERROR_UNRECOVERED,
                EFI_SOFTWARE_PEI_CORE | EFI_SW_EC_OUT_OF_RESOURCES,
            );
            return Err(EfiError::DeviceError);
        }

        // Safety: every moved range, and any descriptor inside one, was copied above.
        unsafe { self.ppi_db.rebase(|address| translate(&moves, address)) };
        self.dispatcher.rebase(|address| translate(&moves, address));

        log::info!("Running from permanent memory, HOB list at {:#x}", hob_list.address());
        Ok(CoreInstance { hob_list, memory: MemoryPhase::Permanent { base, length }, ..self })
    }

    /// Installs the Memory Discovered PPI, firing the notifies PEIMs registered for it.
    ///
    /// A failure is fatal for the boot and is reported before being returned.
    pub(crate) fn signal_memory_discovered(&mut self) -> Result<()> {
        self.install_ppi_list(&MEMORY_DISCOVERED_PPI_LIST).inspect_err(|err| {
            log::error!("Memory Discovered PPI not installed: {:?}", err);
            self.report_error(
                EFI_ERROR_CODE | EFI_ERROR_UNRECOVERED,
                EFI_SOFTWARE_PEI_CORE | EFI_SW_EC_OUT_OF_RESOURCES,
            );
        })
    }
}
