//! PEI Core Notification Engine
//!
//! Fires the (notify, install) pairs the PPI database hands out. Callback notifies are swept inside every install
//! and notify registration; dispatch notifies are swept by the dispatcher after each PEIM returns. A sweep repeats
//! until the database reports nothing new, so PPIs installed by a dispatch notify are seen by the same sweep.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::{ffi::c_void, ptr};

use patina_pei::{
    error::{EfiError, Result},
    guid_fmt,
    pi::{
        fw_fs::ffs::guid::{EFI_FIRMWARE_FILE_SYSTEM2_GUID, EFI_FIRMWARE_FILE_SYSTEM3_GUID},
        ppi::{FirmwareVolumeInfoPpi, NotifyDescriptor, PpiDescriptor, FIRMWARE_VOLUME_INFO_PPI_GUID},
        status_code::{EFI_ERROR_CODE, EFI_ERROR_UNRECOVERED, EFI_SOFTWARE_PEI_CORE, EFI_SW_EC_OUT_OF_RESOURCES},
    },
};
use patina_pei_ffs::FirmwareVolume;

use crate::{
    ppi_db::{NotifyHandler, NotifyKind, PendingNotify},
    CoreInstance,
};

impl CoreInstance {
    /// Registers the notifies the core itself depends on. A failure is reported before being returned.
    pub(crate) fn register_core_notifies(&mut self) -> Result<()> {
        self.ppi_db
            .register_core_notify(
                FIRMWARE_VOLUME_INFO_PPI_GUID,
                NotifyKind::Callback,
                NotifyHandler::FirmwareVolumeInfo,
            )
            .inspect_err(|err| {
                log::error!("Core notifies not registered: {:?}", err);
                self.report_error(
                    EFI_ERROR_CODE | EFI_ERROR_UNRECOVERED,
                    EFI_SOFTWARE_PEI_CORE | EFI_SW_EC_OUT_OF_RESOURCES,
                );
            })
    }

    pub(crate) fn install_ppi_list(&mut self, ppi_list: &[PpiDescriptor]) -> Result<()> {
        self.trace_caller("installs", ppi_list.len(), "PPI");
        self.ppi_db.install(ppi_list)?;
        self.process_notifies(NotifyKind::Callback);
        Ok(())
    }

    pub(crate) fn register_notify_list(&mut self, notify_list: &[NotifyDescriptor]) -> Result<()> {
        self.trace_caller("registers", notify_list.len(), "notify");
        self.ppi_db.notify(notify_list)?;
        self.process_notifies(NotifyKind::Callback);
        Ok(())
    }

    fn trace_caller(&self, action: &str, count: usize, what: &str) {
        match self.dispatcher.current_peim() {
            Some(peim) => log::trace!("PEIM {:?} {} {} {} descriptor(s)", guid_fmt!(peim), action, count, what),
            None => log::trace!("PEI Core {} {} {} descriptor(s)", action, count, what),
        }
    }

    pub(crate) fn reinstall_ppi_descriptor(&mut self, old: &PpiDescriptor, new: &PpiDescriptor) -> Result<()> {
        for pending in self.ppi_db.reinstall(old, new)? {
            self.fire_notify(pending);
        }
        Ok(())
    }

    /// Fires every pending pair of `kind` until none are left.
    pub(crate) fn process_notifies(&mut self, kind: NotifyKind) {
        loop {
            let pending = self.ppi_db.take_pending(kind);
            if pending.is_empty() {
                break;
            }
            for notify in pending {
                self.fire_notify(notify);
            }
        }
    }

    fn fire_notify(&mut self, pending: PendingNotify) {
        log::trace!("Notify for {:?} -> {:p}", guid_fmt!(pending.guid), pending.ppi);
        match pending.handler {
            NotifyHandler::Module(descriptor) => {
                let Some(callback) = descriptor.notify else {
                    return;
                };
                if let Err(err) = callback(self, &descriptor, pending.ppi) {
                    log::error!("Notify callback for {:?} returned {:?}", guid_fmt!(pending.guid), err);
                }
            }
            NotifyHandler::FirmwareVolumeInfo => {
                if let Err(err) = self.firmware_volume_info_notify(pending.ppi) {
                    log::warn!("Firmware volume from FV Info PPI {:p} not added: {:?}", pending.ppi, err);
                }
            }
        }
    }

    fn firmware_volume_info_notify(&mut self, ppi: *mut c_void) -> Result<()> {
        // Safety: the PPI was installed under the Firmware Volume Info PPI GUID, which names this layout.
        let info = unsafe { ptr::read_unaligned(ppi as *const FirmwareVolumeInfoPpi) };
        if info.fv_format != EFI_FIRMWARE_FILE_SYSTEM2_GUID && info.fv_format != EFI_FIRMWARE_FILE_SYSTEM3_GUID {
            log::warn!("Unsupported firmware volume format {:?}", guid_fmt!(info.fv_format));
            return Err(EfiError::Unsupported);
        }
        if info.fv_info.is_null() || info.fv_info_size == 0 {
            return Err(EfiError::InvalidParameter);
        }
        log::info!("FV Info PPI: firmware volume at {:#x}+{:#x}", info.fv_info as u64, info.fv_info_size);
        self.add_firmware_volume(FirmwareVolume::new(info.fv_info as u64, info.fv_info_size as u64))
    }
}
