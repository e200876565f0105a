//! PEI Services
//!
//! The service surface PEIMs see. Every call lands on the running [`CoreInstance`]; PPI calls go through the
//! notification engine, memory and HOB calls through the HOB list.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::ffi::c_void;

use patina_pei::{
    error::{EfiError, Result},
    guid_fmt,
    pi::{
        boot_mode::BootMode,
        ppi::{NotifyDescriptor, PpiDescriptor},
        status_code::{EfiStatusCodeType, EfiStatusCodeValue},
    },
    services::{LocatedPpi, PeiServices},
};
use r_efi::efi;

use crate::CoreInstance;

fn is_allocatable(memory_type: efi::MemoryType) -> bool {
    matches!(
        memory_type,
        efi::LOADER_CODE
            | efi::LOADER_DATA
            | efi::BOOT_SERVICES_CODE
            | efi::BOOT_SERVICES_DATA
            | efi::RUNTIME_SERVICES_CODE
            | efi::RUNTIME_SERVICES_DATA
            | efi::ACPI_RECLAIM_MEMORY
            | efi::ACPI_MEMORY_NVS
            | efi::RESERVED_MEMORY_TYPE
    )
}

impl PeiServices for CoreInstance {
    fn install_ppi(&mut self, ppi_list: &[PpiDescriptor]) -> Result<()> {
        self.install_ppi_list(ppi_list)
    }

    fn reinstall_ppi(&mut self, old: &PpiDescriptor, new: &PpiDescriptor) -> Result<()> {
        self.reinstall_ppi_descriptor(old, new)
    }

    fn locate_ppi(&self, guid: &efi::Guid, instance: usize) -> Result<LocatedPpi> {
        let located = self.ppi_db.locate(guid, instance);
        log::trace!("LocatePpi({:?}, {}) -> {:?}", guid_fmt!(*guid), instance, located);
        located
    }

    fn notify_ppi(&mut self, notify_list: &[NotifyDescriptor]) -> Result<()> {
        self.register_notify_list(notify_list)
    }

    fn get_boot_mode(&self) -> Result<BootMode> {
        self.hob_list.boot_mode()
    }

    fn set_boot_mode(&mut self, boot_mode: BootMode) -> Result<()> {
        log::debug!("Boot mode set to {:?}", boot_mode);
        self.hob_list.set_boot_mode(boot_mode);
        Ok(())
    }

    fn get_hob_list(&self) -> Result<*const c_void> {
        Ok(self.hob_list.address() as *const c_void)
    }

    fn create_hob(&mut self, hob_type: u16, length: u16) -> Result<*mut c_void> {
        self.hob_list.create_hob(hob_type, length)
    }

    fn install_pei_memory(&mut self, memory_begin: efi::PhysicalAddress, memory_length: u64) -> Result<()> {
        self.install_permanent_memory(memory_begin, memory_length)
    }

    fn allocate_pages(&mut self, memory_type: efi::MemoryType, pages: usize) -> Result<efi::PhysicalAddress> {
        if !is_allocatable(memory_type) {
            log::error!("AllocatePages: memory type {:#x} cannot be allocated", memory_type);
            return Err(EfiError::InvalidParameter);
        }
        self.hob_list.allocate_pages(memory_type, pages)
    }

    fn allocate_pool(&mut self, size: usize) -> Result<*mut c_void> {
        self.hob_list.allocate_pool(size)
    }

    fn report_status_code(
        &self,
        code_type: EfiStatusCodeType,
        value: EfiStatusCodeValue,
        instance: u32,
        caller_id: Option<efi::Guid>,
        data: &[u8],
    ) -> Result<()> {
        self.status_code.report(code_type, value, instance, caller_id, data)
    }
}
