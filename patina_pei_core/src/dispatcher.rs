//! PEI Core Dispatcher
//!
//! Walks the known firmware volumes in order and runs every PEIM whose dependency expression is satisfied, repeating
//! full passes until one dispatches nothing. Each volume keeps a bitmap of dispatched PEIMs; a bit is set before the
//! PEIM runs and never cleared, including across migration, so no PEIM runs twice.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;

use patina_internal_pei_depex::Depex;
use patina_pei::{
    error::{EfiError, Result},
    guid_fmt,
    pi::{
        fw_fs::ffs::{file::raw::r#type, guid::PEI_APRIORI_FILE_NAME_GUID, section::raw_type},
        status_code::{
            EFI_ERROR_CODE, EFI_ERROR_MAJOR, EFI_ERROR_MINOR, EFI_SOFTWARE_PEI_CORE, EFI_SOFTWARE_PEI_MODULE,
            EFI_SW_EC_FV_CORRUPTED, EFI_SW_EC_NON_SPECIFIC, EFI_SW_EC_OUT_OF_RESOURCES, EFI_SW_PC_INIT_BEGIN,
            EFI_SW_PC_INIT_END,
        },
    },
    services::{FileHandle, PeimEntryPoint},
};
use patina_pei_ffs::{FfsFile, FileTypeFilter, FirmwareVolume};
use r_efi::efi;

use crate::{migration::MemoryPhase, ppi_db::NotifyKind, CoreInstance};

/// Position of a PEIM: volume index and index within the volume's dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DispatchCursor {
    pub fv_index: usize,
    pub peim_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// A full pass dispatched nothing.
    Quiescent,
    /// Permanent memory was installed; the core must migrate before dispatching further.
    SwitchStack,
}

#[derive(Debug)]
struct VolumeState {
    volume: FirmwareVolume,
    /// PEIMs in dispatch order: apriori files first, then volume order.
    peims: Vec<FfsFile>,
    dispatched: u32,
    /// PEIMs that will never run: security veto, malformed depex, or no loadable image.
    excluded: u32,
}

impl VolumeState {
    fn is_pending(&self, peim_index: usize) -> bool {
        (self.dispatched | self.excluded) & (1 << peim_index) == 0
    }
}

#[derive(Debug, Default)]
pub(crate) struct DispatchState {
    volumes: Vec<VolumeState>,
    current: Option<DispatchCursor>,
}

impl DispatchState {
    pub fn volumes(&self) -> impl Iterator<Item = FirmwareVolume> + '_ {
        self.volumes.iter().map(|state| state.volume)
    }

    pub fn dispatched_names(&self) -> impl Iterator<Item = efi::Guid> + '_ {
        self.volumes.iter().flat_map(|state| {
            state
                .peims
                .iter()
                .enumerate()
                .filter(|(index, _)| state.dispatched & (1 << index) != 0)
                .map(|(_, peim)| peim.name)
        })
    }

    /// Name of the PEIM currently running, if any.
    pub fn current_peim(&self) -> Option<efi::Guid> {
        self.current.map(|cursor| self.volumes[cursor.fv_index].peims[cursor.peim_index].name)
    }

    fn exclude(&mut self, cursor: DispatchCursor) {
        self.volumes[cursor.fv_index].excluded |= 1 << cursor.peim_index;
    }

    /// Applies `translate` to the volume and file addresses.
    pub fn rebase(&mut self, translate: impl Fn(u64) -> u64) {
        for state in self.volumes.iter_mut() {
            state.volume.base_address = translate(state.volume.base_address);
            for peim in state.peims.iter_mut() {
                peim.handle = FileHandle(translate(peim.handle.0));
            }
        }
    }
}

impl CoreInstance {
    /// Adds a firmware volume to the end of the dispatch order.
    ///
    /// A volume already known by base address is ignored. A volume holding more PEIMs than the dispatched bitmap
    /// can track is rejected whole.
    pub(crate) fn add_firmware_volume(&mut self, volume: FirmwareVolume) -> Result<()> {
        if self.dispatcher.volumes.iter().any(|state| state.volume.base_address == volume.base_address) {
            log::trace!("Firmware volume at {:#x} already known", volume.base_address);
            return Ok(());
        }
        if self.dispatcher.volumes.len() >= self.config.max_firmware_volumes {
            log::error!(
                "Firmware volume at {:#x} dropped: {} volumes tracked",
                volume.base_address,
                self.dispatcher.volumes.len()
            );
            self.report_error(EFI_ERROR_CODE | EFI_ERROR_MAJOR, EFI_SOFTWARE_PEI_CORE | EFI_SW_EC_OUT_OF_RESOURCES);
            return Err(EfiError::OutOfResources);
        }
        if let Err(err) = self.fv_reader.validate_volume(&volume) {
            log::error!("Firmware volume at {:#x} is invalid: {:?}", volume.base_address, err);
            self.report_error(EFI_ERROR_CODE | EFI_ERROR_MAJOR, EFI_SOFTWARE_PEI_CORE | EFI_SW_EC_FV_CORRUPTED);
            return Err(err);
        }
        if let Err(err) = self.security.verify_firmware_volume(&volume) {
            log::warn!("Firmware volume at {:#x} excluded by security policy: {:?}", volume.base_address, err);
            return Err(err);
        }

        let peims = self.discover_peims(&volume).inspect_err(|_| {
            self.report_error(EFI_ERROR_CODE | EFI_ERROR_MAJOR, EFI_SOFTWARE_PEI_CORE | EFI_SW_EC_FV_CORRUPTED);
        })?;
        if peims.len() > self.config.max_peims_per_volume {
            log::error!(
                "Firmware volume at {:#x} holds {} PEIMs, at most {} fit in one volume. Volume rejected.",
                volume.base_address,
                peims.len(),
                self.config.max_peims_per_volume
            );
            self.report_error(EFI_ERROR_CODE | EFI_ERROR_MAJOR, EFI_SOFTWARE_PEI_CORE | EFI_SW_EC_OUT_OF_RESOURCES);
            return Err(EfiError::OutOfResources);
        }

        log::info!(
            "Firmware volume {} at {:#x}+{:#x} with {} PEIMs",
            self.dispatcher.volumes.len(),
            volume.base_address,
            volume.length,
            peims.len()
        );
        self.dispatcher.volumes.push(VolumeState { volume, peims, dispatched: 0, excluded: 0 });
        Ok(())
    }

    fn discover_peims(&self, volume: &FirmwareVolume) -> Result<Vec<FfsFile>> {
        let mut peims = Vec::new();
        let mut after = None;
        loop {
            match self.fv_reader.find_next_file(volume, FileTypeFilter::Peim, after) {
                Ok(file) => {
                    after = Some(file.handle);
                    peims.push(file);
                }
                Err(EfiError::NotFound) => break,
                Err(err) => return Err(err),
            }
        }

        let mut ordered = Vec::with_capacity(peims.len());
        for name in self.apriori_list(volume) {
            match peims.iter().position(|peim| peim.name == name) {
                Some(index) => ordered.push(peims.remove(index)),
                None => log::warn!("Apriori PEIM {:?} not found in volume", guid_fmt!(name)),
            }
        }
        ordered.extend(peims);
        Ok(ordered)
    }

    /// File names listed by the volume's PEI apriori file, if it has one.
    fn apriori_list(&self, volume: &FirmwareVolume) -> Vec<efi::Guid> {
        let file = match self.fv_reader.find_file_by_name(volume, &PEI_APRIORI_FILE_NAME_GUID) {
            Ok(file) if file.file_type == r#type::FREEFORM => file,
            _ => return Vec::new(),
        };
        match self.fv_reader.find_section(&file, raw_type::RAW, 0) {
            Ok(data) => data
                .chunks_exact(core::mem::size_of::<efi::Guid>())
                .filter_map(|chunk| <[u8; 16]>::try_from(chunk).ok())
                .map(|bytes| efi::Guid::from_bytes(&bytes))
                .collect(),
            Err(err) => {
                log::warn!("Apriori file without RAW section: {:?}", err);
                Vec::new()
            }
        }
    }

    fn evaluate_depex(&self, file: &FfsFile) -> Result<bool> {
        let expression = match self.fv_reader.find_section(file, raw_type::PEI_DEPEX, 0) {
            Ok(expression) => expression,
            // No dependency expression: always runnable.
            Err(EfiError::NotFound) => return Ok(true),
            Err(err) => {
                log::error!("PEIM {:?} dependency expression unreadable: {:?}", guid_fmt!(file.name), err);
                return Err(err);
            }
        };
        Depex::from(expression)
            .eval_with_depth(self.config.max_depex_stack_depth, |guid| self.ppi_db.is_installed(guid))
            .map_err(|err| {
                log::error!("PEIM {:?} has an invalid dependency expression: {}", guid_fmt!(file.name), err);
                EfiError::InvalidParameter
            })
    }

    /// Resolves the entry point of a PEIM that may run now, or `None` if it cannot run yet.
    ///
    /// PEIMs that can never run are excluded from later passes.
    fn prepare_peim(&mut self, cursor: DispatchCursor) -> Option<PeimEntryPoint> {
        let state = &self.dispatcher.volumes[cursor.fv_index];
        let (volume, file) = (state.volume, state.peims[cursor.peim_index]);

        match self.evaluate_depex(&file) {
            Ok(true) => (),
            Ok(false) => return None,
            Err(_) => {
                self.dispatcher.exclude(cursor);
                return None;
            }
        }
        if let Err(err) = self.security.verify_file(&volume, &file) {
            log::warn!("PEIM {:?} excluded by security policy: {:?}", guid_fmt!(file.name), err);
            self.dispatcher.exclude(cursor);
            return None;
        }
        match self.image_loader.load_peim(&volume, &file) {
            Ok(entry_point) => Some(entry_point),
            Err(err) => {
                log::error!("PEIM {:?} could not be loaded: {:?}", guid_fmt!(file.name), err);
                self.report_error(EFI_ERROR_CODE | EFI_ERROR_MINOR, EFI_SOFTWARE_PEI_CORE | EFI_SW_EC_NON_SPECIFIC);
                self.dispatcher.exclude(cursor);
                None
            }
        }
    }

    fn run_peim(&mut self, cursor: DispatchCursor, entry_point: PeimEntryPoint) {
        let file = self.dispatcher.volumes[cursor.fv_index].peims[cursor.peim_index];
        self.dispatcher.volumes[cursor.fv_index].dispatched |= 1 << cursor.peim_index;

        log::info!("Dispatching PEIM {:?} from FV {}", guid_fmt!(file.name), cursor.fv_index);
        let previous = self.dispatcher.current.replace(cursor);
        self.report_progress(EFI_SOFTWARE_PEI_MODULE | EFI_SW_PC_INIT_BEGIN);
        if let Err(err) = entry_point(file.handle, self) {
            log::error!("PEIM {:?} returned {:?}", guid_fmt!(file.name), err);
        }
        self.report_progress(EFI_SOFTWARE_PEI_MODULE | EFI_SW_PC_INIT_END);
        self.dispatcher.current = previous;

        self.process_notifies(NotifyKind::Dispatch);
    }

    /// Dispatches PEIMs until a full pass over every volume dispatches nothing, or until a PEIM installs
    /// permanent memory.
    pub(crate) fn dispatch(&mut self) -> Result<DispatchOutcome> {
        if matches!(self.memory, MemoryPhase::Installed { .. }) {
            return Ok(DispatchOutcome::SwitchStack);
        }

        let mut pass = 0;
        loop {
            pass += 1;
            let mut progress = false;
            // Volumes added by a PEIM during the pass are picked up by the same pass.
            let mut fv_index = 0;
            while fv_index < self.dispatcher.volumes.len() {
                for peim_index in 0..self.dispatcher.volumes[fv_index].peims.len() {
                    let cursor = DispatchCursor { fv_index, peim_index };
                    if !self.dispatcher.volumes[fv_index].is_pending(peim_index) {
                        continue;
                    }
                    let Some(entry_point) = self.prepare_peim(cursor) else {
                        continue;
                    };
                    self.run_peim(cursor, entry_point);
                    progress = true;

                    if matches!(self.memory, MemoryPhase::Installed { .. }) {
                        log::info!("Permanent memory installed, leaving dispatch pass {}", pass);
                        return Ok(DispatchOutcome::SwitchStack);
                    }
                }
                fv_index += 1;
            }
            if !progress {
                break;
            }
        }

        log::info!("Dispatcher quiescent after {} passes", pass);
        self.log_undispatched();
        Ok(DispatchOutcome::Quiescent)
    }

    fn log_undispatched(&self) {
        for (fv_index, state) in self.dispatcher.volumes.iter().enumerate() {
            for (peim_index, peim) in state.peims.iter().enumerate() {
                if state.dispatched & (1 << peim_index) == 0 {
                    log::warn!("PEIM {:?} in FV {} was discovered but not dispatched", guid_fmt!(peim.name), fv_index);
                }
            }
        }
    }
}
