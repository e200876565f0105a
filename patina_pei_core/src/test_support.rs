//! PEI Core Test Support
//!
//! Code to help support testing: page aligned scratch memory standing in for temporary and permanent RAM, a
//! platform fixture with a boot firmware volume, and a logger that captures records per test thread.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    cell::RefCell,
    sync::Once,
};

use patina_pei::pi::fw_fs::ffs::{file::raw::r#type, section::raw_type};
use patina_pei_ffs::builder::{FileBuilder, VolumeBuilder};
use r_efi::efi;

use crate::{Core, CoreInstance, SecCoreData};

/// A zeroed, page aligned buffer released on drop.
pub(crate) struct ScratchMemory {
    base: *mut u8,
    layout: Layout,
}

impl ScratchMemory {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, 0x1000).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());
        Self { base, layout }
    }

    pub fn base(&self) -> u64 {
        self.base as u64
    }

    pub fn len(&self) -> u64 {
        self.layout.size() as u64
    }
}

impl Drop for ScratchMemory {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) }
    }
}

/// A GUID whose bytes are all `n`.
pub(crate) const fn test_guid(n: u8) -> efi::Guid {
    efi::Guid::from_bytes(&[n; 16])
}

const TEMPORARY_RAM_SIZE: usize = 0x10000;
const TEMPORARY_STACK_SIZE: u64 = 0x4000;

/// Temporary RAM split into heap and stack, plus the firmware volumes a test boots from.
pub(crate) struct TestPlatform {
    temporary_ram: ScratchMemory,
    boot_volume: Vec<u8>,
    extra_volume: Vec<u8>,
}

impl TestPlatform {
    /// A platform whose boot volume holds no PEIMs.
    pub fn new() -> Self {
        Self::with_boot_volume(VolumeBuilder::new().build())
    }

    pub fn with_boot_volume(boot_volume: Vec<u8>) -> Self {
        let extra_volume = VolumeBuilder::new()
            .with_file(FileBuilder::new(test_guid(0xEE), r#type::FREEFORM).with_section(raw_type::RAW, vec![0x5A; 8]))
            .build();
        Self { temporary_ram: ScratchMemory::new(TEMPORARY_RAM_SIZE), boot_volume, extra_volume }
    }

    pub fn sec_core_data(&self) -> SecCoreData {
        let base = self.temporary_ram.base();
        let size = self.temporary_ram.len();
        SecCoreData {
            boot_firmware_volume_base: self.boot_volume.as_ptr() as u64,
            boot_firmware_volume_size: self.boot_volume.len() as u64,
            temporary_ram_base: base,
            temporary_ram_size: size,
            pei_temporary_ram_base: base,
            pei_temporary_ram_size: size - TEMPORARY_STACK_SIZE,
            stack_base: base + size - TEMPORARY_STACK_SIZE,
            stack_size: TEMPORARY_STACK_SIZE,
        }
    }

    /// A valid volume that is not part of the boot volume.
    pub fn extra_volume(&self) -> &[u8] {
        &self.extra_volume
    }

    pub fn core(&self) -> CoreInstance {
        self.core_with(Core::default())
    }

    pub fn core_with(&self, core: Core) -> CoreInstance {
        core.initialize(&self.sec_core_data(), None).expect("test platform should initialize")
    }
}

std::thread_local! {
    static CAPTURED: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

struct CaptureLogger;

impl log::Log for CaptureLogger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        CAPTURED.with(|captured| captured.borrow_mut().push(format!("{} {}", record.level(), record.args())));
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;
static LOGGER_INIT: Once = Once::new();

/// Starts capturing log records on this thread, dropping anything captured before.
pub(crate) fn capture_logs() {
    LOGGER_INIT.call_once(|| {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(log::LevelFilter::Trace);
    });
    CAPTURED.with(|captured| captured.borrow_mut().clear());
}

/// Records captured on this thread since [`capture_logs`].
pub(crate) fn captured_logs() -> Vec<String> {
    CAPTURED.with(|captured| captured.borrow().clone())
}
