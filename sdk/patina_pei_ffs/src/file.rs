//! Firmware File System (FFS) file parsing.
//!
//! [`FileRef`] is a zero-copy, read-only view over a serialized FFS file backed by a byte slice. It validates the
//! header checksum and state and walks the leaf sections of the file.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::{mem, ptr};

use patina_pei::pi::fw_fs::ffs::{
    file::{
        self,
        raw::{attributes, state},
    },
    section,
};
use r_efi::efi;

use crate::FirmwareFileSystemError;

/// Whether a file should be exposed to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileState {
    /// EFI_FILE_DATA_VALID (optionally marked for update).
    Valid,
    /// Deleted, invalid or still under construction. Occupies space but is not returned.
    Skipped,
}

/// Zero-copy view over a Firmware File System (FFS) file backed by a byte slice.
#[derive(Clone)]
pub struct FileRef<'a> {
    data: &'a [u8],
    header: file::Header,
    content_offset: usize,
}

impl<'a> FileRef<'a> {
    /// Parse a byte slice as an FFS file and validate its header.
    ///
    /// Erase polarity is inferred from the reserved high bit of the state field, which the PI specification requires
    /// to hold the volume's erase polarity.
    ///
    /// Errors
    /// - [`FirmwareFileSystemError::InvalidHeader`]: malformed header, size or header checksum.
    /// - [`FirmwareFileSystemError::InvalidState`]: reserved state bits disagree with each other.
    /// - [`FirmwareFileSystemError::DataCorrupt`]: data checksum mismatch.
    pub fn new(buffer: &'a [u8]) -> Result<Self, FirmwareFileSystemError> {
        if buffer.len() < mem::size_of::<file::Header>() {
            Err(FirmwareFileSystemError::InvalidHeader)?;
        }

        // Safety: buffer is large enough to contain file header.
        let header = unsafe { ptr::read_unaligned(buffer.as_ptr() as *const file::Header) };

        let (size, content_offset) = if header.attributes & attributes::LARGE_FILE == 0 {
            let size = u32::from_le_bytes([header.size[0], header.size[1], header.size[2], 0]) as usize;
            (size, mem::size_of::<file::Header>())
        } else {
            if buffer.len() < mem::size_of::<file::Header2>() {
                Err(FirmwareFileSystemError::InvalidHeader)?;
            }
            // Safety: buffer is large enough to contain the extended file header.
            let header2 = unsafe { ptr::read_unaligned(buffer.as_ptr() as *const file::Header2) };
            let size = usize::try_from(header2.extended_size).map_err(|_| FirmwareFileSystemError::InvalidHeader)?;
            (size, mem::size_of::<file::Header2>())
        };

        if size < content_offset || size > buffer.len() {
            Err(FirmwareFileSystemError::InvalidHeader)?;
        }

        let normalized = Self::normalized_state(header.state);
        if normalized & 0xC0 != 0 {
            Err(FirmwareFileSystemError::InvalidState)?;
        }

        let sum = buffer[..content_offset].iter().fold(0u8, |sum, val| sum.wrapping_add(*val));
        let sum = sum.wrapping_sub(header.state).wrapping_sub(header.integrity_check_file);
        if sum != 0 {
            Err(FirmwareFileSystemError::InvalidHeader)?;
        }

        if header.attributes & attributes::CHECKSUM == 0 {
            if header.integrity_check_file != file::FFS_FIXED_CHECKSUM {
                Err(FirmwareFileSystemError::InvalidHeader)?;
            }
        } else {
            let sum = buffer[content_offset..size]
                .iter()
                .fold(header.integrity_check_file, |sum, val| sum.wrapping_add(*val));
            if sum != 0 {
                Err(FirmwareFileSystemError::DataCorrupt)?;
            }
        }

        Ok(Self { data: &buffer[..size], header, content_offset })
    }

    /// State bits with erase polarity removed, so a set bit always means "transition happened".
    fn normalized_state(raw: u8) -> u8 {
        if raw & 0x80 != 0 {
            !raw
        } else {
            raw
        }
    }

    pub(crate) fn state(&self) -> FileState {
        let normalized = Self::normalized_state(self.header.state);
        // The highest transition that happened determines the state.
        if normalized & (state::HEADER_INVALID | state::DELETED) != 0 {
            FileState::Skipped
        } else if normalized & state::DATA_VALID != 0 {
            FileState::Valid
        } else {
            FileState::Skipped
        }
    }

    /// Total serialized size of the file in bytes (header + content).
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The file name GUID from the FFS header.
    pub fn name(&self) -> efi::Guid {
        self.header.name
    }

    /// The raw FFS file type byte.
    pub fn file_type(&self) -> u8 {
        self.header.file_type
    }

    /// The file payload bytes (sections area), excluding the header.
    pub fn content(&self) -> &'a [u8] {
        &self.data[self.content_offset..]
    }

    /// Iterate over the top-level sections as `(section_type, data)` pairs.
    ///
    /// Encapsulation sections are returned as-is; their contents are not expanded.
    pub fn sections(&self) -> impl Iterator<Item = Result<(u8, &'a [u8]), FirmwareFileSystemError>> {
        SectionIter { data: self.content(), offset: 0, error: false }
    }
}

struct SectionIter<'a> {
    data: &'a [u8],
    offset: usize,
    error: bool,
}

impl<'a> Iterator for SectionIter<'a> {
    type Item = Result<(u8, &'a [u8]), FirmwareFileSystemError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.error {
            return None;
        }
        // Sections are 4-byte aligned relative to the start of the file, and the content starts aligned.
        self.offset = (self.offset + 3) & !3;
        let remaining = self.data.get(self.offset..)?;
        if remaining.len() < mem::size_of::<section::Header>() {
            return None;
        }
        // Safety: remaining holds at least one common section header.
        let header = unsafe { ptr::read_unaligned(remaining.as_ptr() as *const section::Header) };

        let (size, header_size) = if header.size == section::EXTENDED_SIZE_MARKER {
            if remaining.len() < mem::size_of::<section::Header2>() {
                self.error = true;
                return Some(Err(FirmwareFileSystemError::InvalidHeader));
            }
            // Safety: remaining holds an extended section header.
            let header2 = unsafe { ptr::read_unaligned(remaining.as_ptr() as *const section::Header2) };
            (header2.extended_size as usize, mem::size_of::<section::Header2>())
        } else {
            let size = u32::from_le_bytes([header.size[0], header.size[1], header.size[2], 0]) as usize;
            (size, mem::size_of::<section::Header>())
        };

        if size < header_size || size > remaining.len() {
            self.error = true;
            return Some(Err(FirmwareFileSystemError::InvalidHeader));
        }

        self.offset += size;
        Some(Ok((header.section_type, &remaining[header_size..size])))
    }
}
