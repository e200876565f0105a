//! Firmware File System support for the PEI phase.
//!
//! The PEI Core consumes firmware volumes only through the [`FirmwareVolumeReader`] trait: enumerate files of a
//! type, and pull a section out of a file. [`MemoryMappedFvReader`] implements it over volumes that are directly
//! addressable (flash mapped below 4GiB, or a buffer in memory). [`builder::VolumeBuilder`] composes volume images
//! for tests and tools.
//!
//! ## Features
//!
//! - `mockall`: exposes `MockFirmwareVolumeReader`.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(test), not(feature = "mockall")), no_std)]

extern crate alloc;

pub mod builder;
mod err;
mod file;
mod volume;

pub use err::FirmwareFileSystemError;
pub use file::FileRef;
pub use volume::{MemoryMappedFvReader, VolumeRef};

use alloc::vec::Vec;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use patina_pei::{
    error::{EfiError, Result},
    pi::fw_fs::ffs::file::raw::r#type,
    services::FileHandle,
};
use r_efi::efi;

/// Location of a firmware volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVolume {
    pub base_address: efi::PhysicalAddress,
    pub length: u64,
}

impl FirmwareVolume {
    pub const fn new(base_address: efi::PhysicalAddress, length: u64) -> Self {
        Self { base_address, length }
    }

    /// Returns true if `address` falls inside the volume.
    pub fn contains(&self, address: efi::PhysicalAddress) -> bool {
        address >= self.base_address && address - self.base_address < self.length
    }
}

/// Selects which files [`FirmwareVolumeReader::find_next_file`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTypeFilter {
    /// Every file except pad files.
    Any,
    /// Files of exactly this FFS type.
    Type(u8),
    /// Files the PEI Core can dispatch: PEIM and combined PEIM/driver.
    Peim,
}

impl FileTypeFilter {
    pub fn matches(&self, file_type: u8) -> bool {
        match self {
            FileTypeFilter::Any => file_type != r#type::FFS_PAD,
            FileTypeFilter::Type(wanted) => file_type == *wanted,
            FileTypeFilter::Peim => matches!(file_type, r#type::PEIM | r#type::COMBINED_PEIM_DRIVER),
        }
    }
}

/// A file found in a firmware volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FfsFile {
    /// Address of the file header.
    pub handle: FileHandle,
    pub name: efi::Guid,
    pub file_type: u8,
    /// Size of the file including its header.
    pub size: u64,
}

/// Read access to firmware volumes.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait FirmwareVolumeReader {
    /// Validates the volume header.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::VolumeCorrupted`] for a damaged header and [`EfiError::Unsupported`] for a file system
    /// this reader does not understand.
    fn validate_volume(&self, volume: &FirmwareVolume) -> Result<()>;

    /// Returns the first file matching `filter` that follows `after` in volume order, or the first matching file
    /// when `after` is `None`.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::NotFound`] once no further file matches.
    fn find_next_file(
        &self,
        volume: &FirmwareVolume,
        filter: FileTypeFilter,
        after: Option<FileHandle>,
    ) -> Result<FfsFile>;

    /// Returns the data of the `instance`-th (0-based) leaf section of `section_type` in `file`.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::NotFound`] if the file has no such section, and [`EfiError::VolumeCorrupted`] if a
    /// malformed section header is reached before the requested instance.
    fn find_section(&self, file: &FfsFile, section_type: u8, instance: usize) -> Result<Vec<u8>>;

    /// Finds a file by name.
    fn find_file_by_name(&self, volume: &FirmwareVolume, name: &efi::Guid) -> Result<FfsFile> {
        let mut after = None;
        loop {
            let file = self.find_next_file(volume, FileTypeFilter::Any, after)?;
            if file.name == *name {
                return Ok(file);
            }
            after = Some(file.handle);
        }
    }
}

impl From<FirmwareFileSystemError> for EfiError {
    fn from(value: FirmwareFileSystemError) -> Self {
        match value {
            FirmwareFileSystemError::InvalidParameter => EfiError::InvalidParameter,
            FirmwareFileSystemError::Unsupported => EfiError::Unsupported,
            FirmwareFileSystemError::NotFound => EfiError::NotFound,
            FirmwareFileSystemError::InvalidHeader
            | FirmwareFileSystemError::InvalidBlockMap
            | FirmwareFileSystemError::InvalidState
            | FirmwareFileSystemError::DataCorrupt => EfiError::VolumeCorrupted,
        }
    }
}
