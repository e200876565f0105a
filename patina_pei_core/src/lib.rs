//! PEI Core
//!
//! A pure rust implementation of the PI PEI Core: the PPI database and its notify engine, the PEIM dispatcher, the
//! HOB list, and the migration from temporary RAM to permanent memory.
//!
//! The core is a two phase system. [`Core`] collects the platform collaborators through its `with_*` functions and
//! [`initialize`](Core::initialize) builds a [`CoreInstance`] on the temporary RAM that SEC describes. Then
//! [`start`](CoreInstance::start) dispatches PEIMs until no more can run, migrating to permanent memory once a PEIM
//! installs it, and hands off to the DXE IPL PPI.
//!
//! ## Examples
//!
//! ``` rust,no_run
//! use patina_pei::{
//!     error::Result,
//!     services::{FileHandle, PeiServices},
//! };
//! use patina_pei_core::{Core, SecCoreData, StaticImageLoader};
//! use r_efi::efi;
//!
//! const MEMORY_INIT_PEIM: efi::Guid =
//!     efi::Guid::from_fields(0x3b6f9c0e, 0x1d2a, 0x4c57, 0x9e, 0x41, &[0x6a, 0x0b, 0x7d, 0x22, 0x58, 0x13]);
//!
//! fn memory_init(_file: FileHandle, services: &mut dyn PeiServices) -> Result<()> {
//!     services.install_pei_memory(0x8000_0000, 0x100_0000)
//! }
//!
//! # let sec_core_data = SecCoreData::default();
//! Core::default()
//!     .with_image_loader(StaticImageLoader::new().with_peim(MEMORY_INIT_PEIM, memory_init))
//!     .initialize(&sec_core_data, None)
//!     .and_then(|core| core.start())
//!     .unwrap();
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(test), not(feature = "mockall")), no_std)]

extern crate alloc;

mod config;
mod dispatcher;
mod hob_list;
mod image;
mod migration;
mod notify;
mod ppi_db;
mod security;
mod services;
mod status_code;

#[cfg(test)]
mod test_support;

pub use config::{PeiCoreConfig, DISPATCHED_BITMAP_WIDTH};
pub use image::{ImageLoader, StaticImageLoader};
pub use security::{SecurityPolicy, TrustAll};
pub use status_code::{pei_core_caller_id, LogStatusCodeReporter, StatusCodeReporter};

#[cfg(any(test, feature = "mockall"))]
pub use image::MockImageLoader;
#[cfg(any(test, feature = "mockall"))]
pub use security::MockSecurityPolicy;
#[cfg(any(test, feature = "mockall"))]
pub use status_code::MockStatusCodeReporter;

use alloc::{boxed::Box, vec::Vec};
use core::{ffi::c_void, ptr};

use patina_pei::{
    error::{EfiError, Result},
    pi::{
        boot_mode::BootMode,
        ppi::{DxeIplPpi, PpiDescriptor, DXE_IPL_PPI_GUID},
        status_code::{
            EfiStatusCodeType, EfiStatusCodeValue, EFI_ERROR_CODE, EFI_ERROR_UNRECOVERED, EFI_PROGRESS_CODE,
            EFI_SOFTWARE_PEI_CORE, EFI_SW_EC_FV_CORRUPTED, EFI_SW_PEI_CORE_EC_DXEIPL_NOT_FOUND,
            EFI_SW_PEI_CORE_EC_DXE_CORRUPT, EFI_SW_PEI_CORE_EC_MEMORY_NOT_INSTALLED, EFI_SW_PEI_CORE_PC_ENTRY_POINT,
            EFI_SW_PEI_CORE_PC_HANDOFF_TO_NEXT,
        },
    },
};
use patina_pei_ffs::{FirmwareVolume, FirmwareVolumeReader, MemoryMappedFvReader};
use r_efi::efi;

use dispatcher::{DispatchOutcome, DispatchState};
use hob_list::HobList;
use migration::MemoryPhase;
use ppi_db::PpiDatabase;

/// The hand-off from SEC: where the boot firmware volume is and how temporary RAM is split.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SecCoreData {
    pub boot_firmware_volume_base: efi::PhysicalAddress,
    pub boot_firmware_volume_size: u64,
    /// The whole temporary RAM range.
    pub temporary_ram_base: efi::PhysicalAddress,
    pub temporary_ram_size: u64,
    /// The part of temporary RAM the core may use for its HOB list and heap.
    pub pei_temporary_ram_base: efi::PhysicalAddress,
    pub pei_temporary_ram_size: u64,
    /// The part of temporary RAM holding the SEC/PEI stack.
    pub stack_base: efi::PhysicalAddress,
    pub stack_size: u64,
}

impl SecCoreData {
    fn contains(&self, base: u64, size: u64) -> bool {
        match (base.checked_add(size), self.temporary_ram_base.checked_add(self.temporary_ram_size)) {
            (Some(end), Some(ram_end)) => base >= self.temporary_ram_base && end <= ram_end,
            _ => false,
        }
    }

    fn validate(&self) -> Result<()> {
        let heap_end = self.pei_temporary_ram_base.saturating_add(self.pei_temporary_ram_size);
        let stack_end = self.stack_base.saturating_add(self.stack_size);
        let overlapping = self.pei_temporary_ram_base < stack_end && self.stack_base < heap_end;
        if self.boot_firmware_volume_base == 0
            || self.boot_firmware_volume_size == 0
            || self.pei_temporary_ram_size < HobList::MINIMUM_SIZE
            || self.stack_size == 0
            || !self.contains(self.pei_temporary_ram_base, self.pei_temporary_ram_size)
            || !self.contains(self.stack_base, self.stack_size)
            || overlapping
        {
            log::error!("Invalid SEC hand-off: {:#x?}", self);
            return Err(EfiError::InvalidParameter);
        }
        Ok(())
    }
}

/// The initialize phase of the PEI Core, collecting the platform collaborators.
///
/// Every collaborator has a default: firmware volumes are read in place ([`MemoryMappedFvReader`]), no PEIM images
/// are known ([`StaticImageLoader`]), everything is trusted ([`TrustAll`]) and status codes go to the log
/// ([`LogStatusCodeReporter`]).
pub struct Core {
    config: PeiCoreConfig,
    fv_reader: Box<dyn FirmwareVolumeReader>,
    image_loader: Box<dyn ImageLoader>,
    security: Box<dyn SecurityPolicy>,
    status_code: Box<dyn StatusCodeReporter>,
}

impl Default for Core {
    fn default() -> Self {
        Self {
            config: PeiCoreConfig::default(),
            fv_reader: Box::new(MemoryMappedFvReader),
            image_loader: Box::new(StaticImageLoader::default()),
            security: Box::new(TrustAll),
            status_code: Box::new(LogStatusCodeReporter),
        }
    }
}

impl Core {
    /// Replaces the default capacities.
    pub fn with_config(mut self, config: PeiCoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers the reader used to enumerate firmware volumes.
    pub fn with_firmware_volume_reader(mut self, fv_reader: impl FirmwareVolumeReader + 'static) -> Self {
        self.fv_reader = Box::new(fv_reader);
        self
    }

    /// Registers the loader that resolves PEIM entry points.
    pub fn with_image_loader(mut self, image_loader: impl ImageLoader + 'static) -> Self {
        self.image_loader = Box::new(image_loader);
        self
    }

    /// Registers the security policy consulted before a volume or PEIM is used.
    pub fn with_security_policy(mut self, security: impl SecurityPolicy + 'static) -> Self {
        self.security = Box::new(security);
        self
    }

    /// Registers the status code sink.
    pub fn with_status_code_reporter(mut self, status_code: impl StatusCodeReporter + 'static) -> Self {
        self.status_code = Box::new(status_code);
        self
    }

    /// Builds the core on the temporary RAM described by `sec_core_data`.
    ///
    /// Creates the HOB list at the start of the PEI temporary RAM, installs the PPIs SEC passes in
    /// `sec_ppi_list`, and registers the boot firmware volume as the first volume to dispatch from.
    ///
    /// Every address in `sec_core_data` must describe memory the core may use exclusively, and the boot firmware
    /// volume must be readable for its whole size.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] for an invalid configuration or hand-off, and the error of the
    /// firmware volume reader if the boot firmware volume is damaged.
    pub fn initialize(
        self,
        sec_core_data: &SecCoreData,
        sec_ppi_list: Option<&[PpiDescriptor]>,
    ) -> Result<CoreInstance> {
        self.config.validate()?;
        sec_core_data.validate()?;

        log::info!(
            "PEI Core entry, temporary RAM {:#x}+{:#x}",
            sec_core_data.temporary_ram_base,
            sec_core_data.temporary_ram_size
        );

        // Safety: SEC hands the PEI part of temporary RAM to the core.
        let hob_list = unsafe {
            HobList::create(
                sec_core_data.pei_temporary_ram_base,
                sec_core_data.pei_temporary_ram_size,
                BootMode::default(),
            )
        }?;

        let mut core = CoreInstance {
            config: self.config,
            sec_core_data: *sec_core_data,
            hob_list,
            ppi_db: PpiDatabase::new(self.config.max_ppi_slots),
            dispatcher: DispatchState::default(),
            memory: MemoryPhase::Temporary,
            fv_reader: self.fv_reader,
            image_loader: self.image_loader,
            security: self.security,
            status_code: self.status_code,
        };
        core.report_progress(EFI_SOFTWARE_PEI_CORE | EFI_SW_PEI_CORE_PC_ENTRY_POINT);

        core.register_core_notifies()?;
        if let Some(sec_ppi_list) = sec_ppi_list {
            core.install_ppi_list(sec_ppi_list)?;
        }

        let boot_fv =
            FirmwareVolume::new(sec_core_data.boot_firmware_volume_base, sec_core_data.boot_firmware_volume_size);
        match core.add_firmware_volume(boot_fv) {
            Ok(()) => (),
            Err(EfiError::SecurityViolation) => log::warn!("Boot firmware volume rejected by security policy"),
            Err(err) => {
                core.report_error(
                    EFI_ERROR_CODE | EFI_ERROR_UNRECOVERED,
                    EFI_SOFTWARE_PEI_CORE | EFI_SW_EC_FV_CORRUPTED,
                );
                return Err(err);
            }
        }
        Ok(core)
    }
}

/// The running PEI Core.
///
/// Owns the HOB list, the PPI database and the dispatcher state. PEIMs reach it only through
/// [`PeiServices`](patina_pei::services::PeiServices), which it implements.
pub struct CoreInstance {
    config: PeiCoreConfig,
    sec_core_data: SecCoreData,
    hob_list: HobList,
    ppi_db: PpiDatabase,
    dispatcher: DispatchState,
    memory: MemoryPhase,
    fv_reader: Box<dyn FirmwareVolumeReader>,
    image_loader: Box<dyn ImageLoader>,
    security: Box<dyn SecurityPolicy>,
    status_code: Box<dyn StatusCodeReporter>,
}

impl CoreInstance {
    /// Dispatches every PEIM that can run and hands off to the DXE IPL PPI.
    ///
    /// On hardware the DXE IPL does not return. The errors below are fatal for the boot; they are reported through
    /// the status code reporter before being returned.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::DeviceError`] if permanent memory was never installed or could not hold the migrated
    /// state, and [`EfiError::NotFound`] if no DXE IPL PPI was installed.
    pub fn start(self) -> Result<()> {
        self.dispatch_until_quiescent()?.hand_off()
    }

    /// Runs the dispatcher until no more PEIMs can run, migrating to permanent memory whenever a PEIM installs it.
    ///
    /// Migration replaces the instance; PEIMs already dispatched are not run again by the new one.
    pub fn dispatch_until_quiescent(mut self) -> Result<CoreInstance> {
        loop {
            match self.dispatch()? {
                DispatchOutcome::Quiescent => return Ok(self),
                DispatchOutcome::SwitchStack => {
                    self = self.migrate()?;
                    self.signal_memory_discovered()?;
                }
            }
        }
    }

    /// True once the core runs from permanent memory.
    pub fn is_running_from_permanent_memory(&self) -> bool {
        matches!(self.memory, MemoryPhase::Permanent { .. })
    }

    /// The firmware volumes the dispatcher knows about, in dispatch order.
    pub fn firmware_volumes(&self) -> Vec<FirmwareVolume> {
        self.dispatcher.volumes().collect()
    }

    /// Names of the PEIMs dispatched so far, in volume and file order.
    pub fn dispatched_peims(&self) -> Vec<efi::Guid> {
        self.dispatcher.dispatched_names().collect()
    }

    fn hand_off(mut self) -> Result<()> {
        if !self.is_running_from_permanent_memory() {
            log::error!("PEI dispatch finished without permanent memory");
            self.report_error(
                EFI_ERROR_CODE | EFI_ERROR_UNRECOVERED,
                EFI_SOFTWARE_PEI_CORE | EFI_SW_PEI_CORE_EC_MEMORY_NOT_INSTALLED,
            );
            return Err(EfiError::DeviceError);
        }

        let located = match self.ppi_db.locate(&DXE_IPL_PPI_GUID, 0) {
            Ok(located) => located,
            Err(err) => {
                log::error!("DXE IPL PPI not found");
                self.report_error(
                    EFI_ERROR_CODE | EFI_ERROR_UNRECOVERED,
                    EFI_SOFTWARE_PEI_CORE | EFI_SW_PEI_CORE_EC_DXEIPL_NOT_FOUND,
                );
                return Err(err);
            }
        };
        // Safety: the DXE IPL PPI GUID names the interface layout; install rejects null interfaces.
        let dxe_ipl = unsafe { ptr::read_unaligned(located.ppi as *const DxeIplPpi) };

        log::info!("Handing off to DXE IPL, HOB list at {:#x}", self.hob_list.address());
        self.report_progress(EFI_SOFTWARE_PEI_CORE | EFI_SW_PEI_CORE_PC_HANDOFF_TO_NEXT);
        let hob_list = self.hob_list.address() as *const c_void;
        (dxe_ipl.entry)(&dxe_ipl, &mut self, hob_list).inspect_err(|err| {
            log::error!("DXE IPL returned {:?}", err);
            self.report_error(
                EFI_ERROR_CODE | EFI_ERROR_UNRECOVERED,
                EFI_SOFTWARE_PEI_CORE | EFI_SW_PEI_CORE_EC_DXE_CORRUPT,
            );
        })
    }

    fn report(&self, code_type: EfiStatusCodeType, value: EfiStatusCodeValue) {
        if let Err(err) = self.status_code.report(code_type, value, 0, Some(pei_core_caller_id()), &[]) {
            log::warn!("Status code {:#x}/{:#x} not reported: {:?}", code_type, value, err);
        }
    }

    pub(crate) fn report_progress(&self, value: EfiStatusCodeValue) {
        self.report(EFI_PROGRESS_CODE, value);
    }

    pub(crate) fn report_error(&self, code_type: EfiStatusCodeType, value: EfiStatusCodeValue) {
        self.report(code_type, value);
    }
}
