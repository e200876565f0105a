//! Common Test Infrastructure for PEI Core Integration Tests
//!
//! Host memory standing in for temporary and permanent RAM, firmware volume helpers, and a per-thread event
//! recorder PEIMs and notify callbacks write to.
//!
//! ## Logging
//!
//! Set `RUST_LOG` (e.g. `RUST_LOG=trace`) to see the core's log output while the tests run.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![allow(dead_code)]

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    cell::{Cell, RefCell},
    sync::Once,
};

use patina_pei::pi::fw_fs::ffs::{file::raw::r#type, section::raw_type};
use patina_pei_core::SecCoreData;
use patina_pei_ffs::builder::FileBuilder;
use r_efi::efi;

pub mod depex {
    pub const PUSH: u8 = 0x02;
    pub const AND: u8 = 0x03;
    pub const OR: u8 = 0x04;
    pub const NOT: u8 = 0x05;
    pub const TRUE: u8 = 0x06;
    pub const FALSE: u8 = 0x07;
    pub const END: u8 = 0x08;
}

static INIT: Once = Once::new();

pub fn init_logger() {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::from_default_env();
        if std::env::var("RUST_LOG").is_err() {
            builder.filter_level(log::LevelFilter::Off);
        }
        builder.is_test(true).init();
    });
}

/// A GUID whose bytes are all `n`.
pub const fn guid(n: u8) -> efi::Guid {
    efi::Guid::from_bytes(&[n; 16])
}

/// A depex that requires every GUID in `guids`.
pub fn requires(guids: &[efi::Guid]) -> Vec<u8> {
    let mut expression = Vec::new();
    for guid in guids {
        expression.push(depex::PUSH);
        expression.extend_from_slice(guid.as_bytes());
    }
    for _ in 1..guids.len() {
        expression.push(depex::AND);
    }
    expression.push(depex::END);
    expression
}

pub fn peim(name: efi::Guid, depex: Option<Vec<u8>>) -> FileBuilder {
    let file = FileBuilder::new(name, r#type::PEIM).with_section(raw_type::PE32, vec![0xCC; 16]);
    match depex {
        Some(depex) => file.with_section(raw_type::PEI_DEPEX, depex),
        None => file,
    }
}

/// A zeroed, page aligned host buffer.
pub struct Memory {
    base: *mut u8,
    layout: Layout,
}

impl Memory {
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

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base() && address < self.base() + self.len()
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) }
    }
}

thread_local! {
    static EVENTS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    static PERMANENT_MEMORY: Cell<(u64, u64)> = const { Cell::new((0, 0)) };
}

pub fn record(event: impl Into<String>) {
    EVENTS.with(|events| events.borrow_mut().push(event.into()));
}

/// Drains the events recorded on this thread.
pub fn events() -> Vec<String> {
    EVENTS.with(|events| events.borrow_mut().drain(..).collect())
}

/// The permanent memory range of the platform running on this thread.
pub fn permanent_memory() -> (u64, u64) {
    PERMANENT_MEMORY.with(Cell::get)
}

/// Temporary RAM, permanent RAM and a boot firmware volume.
pub struct Platform {
    pub temporary_ram: Memory,
    pub permanent_ram: Memory,
    boot_volume: Vec<u8>,
}

impl Platform {
    pub const TEMPORARY_RAM_SIZE: usize = 0x20000;
    pub const STACK_SIZE: u64 = 0x8000;
    pub const PERMANENT_RAM_SIZE: usize = 0x100000;

    pub fn new(boot_volume: Vec<u8>) -> Self {
        init_logger();
        events();
        let permanent_ram = Memory::new(Self::PERMANENT_RAM_SIZE);
        PERMANENT_MEMORY.with(|memory| memory.set((permanent_ram.base(), permanent_ram.len())));
        Self { temporary_ram: Memory::new(Self::TEMPORARY_RAM_SIZE), permanent_ram, boot_volume }
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
            pei_temporary_ram_size: size - Self::STACK_SIZE,
            stack_base: base + size - Self::STACK_SIZE,
            stack_size: Self::STACK_SIZE,
        }
    }
}
