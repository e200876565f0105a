//! Firmware Volume (FV) parsing.
//!
//! [`VolumeRef`] is a zero-copy, read-only view over a serialized FV backed by a byte slice. It validates the FV
//! header and block map and iterates the contained files. [`MemoryMappedFvReader`] wraps it to implement
//! [`FirmwareVolumeReader`] for volumes that are directly addressable.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use core::{mem, ptr, slice};

use patina_pei::{
    base::align_up,
    error::{EfiError, Result},
    guid_fmt,
    pi::fw_fs::{ffs, fv},
    services::FileHandle,
};

use crate::{
    file::{FileRef, FileState},
    FfsFile, FileTypeFilter, FirmwareFileSystemError, FirmwareVolume, FirmwareVolumeReader,
};

/// Zero-copy view over a Firmware Volume (FV) backed by a byte slice.
pub struct VolumeRef<'a> {
    data: &'a [u8],
    fv_header: fv::Header,
    content_offset: usize,
}

impl<'a> VolumeRef<'a> {
    /// Parse a byte slice as a Firmware Volume and validate its metadata.
    ///
    /// Validates signature, header length, checksum, revision, filesystem GUID, extended header bounds, and block
    /// map structure.
    pub fn new(buffer: &'a [u8]) -> core::result::Result<Self, FirmwareFileSystemError> {
        // Verify that buffer has enough storage for a volume header.
        if buffer.len() < mem::size_of::<fv::Header>() {
            Err(FirmwareFileSystemError::InvalidHeader)?;
        }

        // Safety: buffer is large enough to contain the header.
        let fv_header = unsafe { ptr::read_unaligned(buffer.as_ptr() as *const fv::Header) };

        if fv_header.signature != fv::SIGNATURE {
            Err(FirmwareFileSystemError::InvalidHeader)?;
        }

        let header_length = fv_header.header_length as usize;
        if header_length < mem::size_of::<fv::Header>() || header_length > buffer.len() || header_length & 0x01 != 0 {
            Err(FirmwareFileSystemError::InvalidHeader)?;
        }

        // Header checksum must be correct
        let sum = buffer[..header_length]
            .chunks_exact(2)
            .fold(0u16, |sum, value| sum.wrapping_add(u16::from_le_bytes([value[0], value[1]])));
        if sum != 0 {
            Err(FirmwareFileSystemError::InvalidHeader)?;
        }

        if fv_header.revision < fv::FFS_REVISION {
            Err(FirmwareFileSystemError::Unsupported)?;
        }

        if fv_header.file_system_guid != ffs::guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID
            && fv_header.file_system_guid != ffs::guid::EFI_FIRMWARE_FILE_SYSTEM3_GUID
        {
            Err(FirmwareFileSystemError::Unsupported)?;
        }

        if fv_header.fv_length < header_length as u64 || fv_header.fv_length > buffer.len() as u64 {
            Err(FirmwareFileSystemError::InvalidHeader)?;
        }

        let ext_header_end = if fv_header.ext_header_offset != 0 {
            let ext_header_offset = fv_header.ext_header_offset as usize;
            if ext_header_offset + mem::size_of::<fv::ExtHeader>() > fv_header.fv_length as usize {
                Err(FirmwareFileSystemError::InvalidHeader)?;
            }
            // Safety: the check above keeps the extended header inside the buffer.
            let ext_header =
                unsafe { ptr::read_unaligned(buffer[ext_header_offset..].as_ptr() as *const fv::ExtHeader) };
            let end = ext_header_offset + ext_header.ext_header_size as usize;
            if end > fv_header.fv_length as usize {
                Err(FirmwareFileSystemError::InvalidHeader)?;
            }
            Some(end)
        } else {
            None
        };

        let block_map = &buffer[mem::size_of::<fv::Header>()..header_length];
        if block_map.len() & 0x7 != 0 {
            Err(FirmwareFileSystemError::InvalidBlockMap)?;
        }
        let mut entries = block_map.chunks_exact(8).map(|x| fv::BlockMapEntry {
            num_blocks: u32::from_le_bytes([x[0], x[1], x[2], x[3]]),
            length: u32::from_le_bytes([x[4], x[5], x[6], x[7]]),
        });
        let terminator = fv::BlockMapEntry { num_blocks: 0, length: 0 };
        let mut runs = 0;
        let mut terminated = false;
        for entry in entries.by_ref() {
            if entry == terminator {
                terminated = true;
                break;
            }
            runs += 1;
        }
        // There must be at least one run, and the terminator must be the last entry.
        if !terminated || runs == 0 || entries.next().is_some() {
            Err(FirmwareFileSystemError::InvalidBlockMap)?;
        }

        // Files must be 8-byte aligned relative to the start of the FV.
        let content_offset = ext_header_end.unwrap_or(header_length);
        let content_offset =
            align_up(content_offset as u64, 8).map_err(|_| FirmwareFileSystemError::InvalidHeader)? as usize;

        Ok(Self { data: &buffer[..fv_header.fv_length as usize], fv_header, content_offset })
    }

    /// Instantiate a new volume view from a base address.
    ///
    /// ## Safety
    ///
    /// Caller must ensure that `base_address` is readable for at least `length` bytes for the lifetime `'a`.
    pub unsafe fn new_from_address(
        base_address: u64,
        length: u64,
    ) -> core::result::Result<Self, FirmwareFileSystemError> {
        if base_address == 0 || length < mem::size_of::<fv::Header>() as u64 {
            return Err(FirmwareFileSystemError::InvalidParameter);
        }
        let buffer = unsafe { slice::from_raw_parts(base_address as *const u8, length as usize) };
        Self::new(buffer)
    }

    /// The erase/pad byte used by this FV according to its attributes.
    pub fn erase_byte(&self) -> u8 {
        if self.fv_header.attributes & fv::ERASE_POLARITY != 0 {
            0xff
        } else {
            0
        }
    }

    /// Total FV size in bytes (`FvLength`).
    pub fn size(&self) -> u64 {
        self.fv_header.fv_length
    }

    /// Iterate over files in data-valid state, paired with their offset from the start of the volume.
    ///
    /// PAD files are returned like any other file; deleted files are skipped. A parse error ends the iteration
    /// after being returned.
    pub fn files(&self) -> impl Iterator<Item = core::result::Result<(usize, FileRef<'a>), FirmwareFileSystemError>> {
        FileRefIter { data: self.data, next_offset: self.content_offset, erase_byte: self.erase_byte(), error: false }
    }
}

struct FileRefIter<'a> {
    data: &'a [u8],
    next_offset: usize,
    erase_byte: u8,
    error: bool,
}

impl<'a> Iterator for FileRefIter<'a> {
    type Item = core::result::Result<(usize, FileRef<'a>), FirmwareFileSystemError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.error || self.next_offset >= self.data.len() {
                return None;
            }
            let remaining = &self.data[self.next_offset..];
            let header_size = mem::size_of::<ffs::file::Header>();
            if remaining.len() < header_size || remaining[..header_size].iter().all(|&x| x == self.erase_byte) {
                return None;
            }

            let offset = self.next_offset;
            let result = FileRef::new(remaining);
            let file = match result {
                Ok(file) => file,
                Err(err) => {
                    self.error = true;
                    return Some(Err(err));
                }
            };

            // "Given a file F, the next file header is located at the next 8-byte aligned firmware volume offset
            // following the last byte of the file F"
            match align_up((offset + file.size()) as u64, 8) {
                Ok(next_offset) => self.next_offset = next_offset as usize,
                Err(_) => {
                    self.error = true;
                    return Some(Err(FirmwareFileSystemError::DataCorrupt));
                }
            }

            match file.state() {
                FileState::Valid => return Some(Ok((offset, file))),
                FileState::Skipped => continue,
            }
        }
    }
}

/// [`FirmwareVolumeReader`] over volumes that are mapped at their base address.
///
/// Every [`FirmwareVolume`] handed to this reader must describe readable memory for its whole length; the PEI Core
/// only passes volumes reported by SEC or published through the Firmware Volume Info PPI.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryMappedFvReader;

impl MemoryMappedFvReader {
    fn volume<'a>(&self, volume: &FirmwareVolume) -> Result<VolumeRef<'a>> {
        // Safety: see the type level contract on mapped volumes.
        unsafe { VolumeRef::new_from_address(volume.base_address, volume.length) }.map_err(|err| {
            log::debug!("Firmware volume at {:#x}+{:#x} rejected: {:?}", volume.base_address, volume.length, err);
            EfiError::from(err)
        })
    }
}

impl FirmwareVolumeReader for MemoryMappedFvReader {
    fn validate_volume(&self, volume: &FirmwareVolume) -> Result<()> {
        self.volume(volume).map(|_| ())
    }

    fn find_next_file(
        &self,
        volume: &FirmwareVolume,
        filter: FileTypeFilter,
        after: Option<FileHandle>,
    ) -> Result<FfsFile> {
        let fv = self.volume(volume)?;
        let mut past_cursor = after.is_none();
        for file in fv.files() {
            let (offset, file) = file.inspect_err(|err| {
                log::warn!("Firmware volume at {:#x}: file walk stopped: {:?}", volume.base_address, err);
            })?;
            let handle = FileHandle(volume.base_address + offset as u64);
            if !past_cursor {
                past_cursor = Some(handle) == after;
                continue;
            }
            if filter.matches(file.file_type()) {
                return Ok(FfsFile { handle, name: file.name(), file_type: file.file_type(), size: file.size() as u64 });
            }
        }
        Err(EfiError::NotFound)
    }

    fn find_section(&self, file: &FfsFile, section_type: u8, instance: usize) -> Result<Vec<u8>> {
        if file.size == 0 {
            return Err(EfiError::InvalidParameter);
        }
        // Safety: the handle came from find_next_file over a mapped volume and the size from its header.
        let buffer = unsafe { slice::from_raw_parts(file.handle.0 as *const u8, file.size as usize) };
        let file_ref = FileRef::new(buffer)?;
        let mut remaining = instance;
        for section in file_ref.sections() {
            let (ty, data) = section.inspect_err(|err| {
                log::warn!("Section walk of file {:?} stopped: {:?}", guid_fmt!(file.name), err);
            })?;
            if ty != section_type {
                continue;
            }
            if remaining == 0 {
                return Ok(data.to_vec());
            }
            remaining -= 1;
        }
        Err(EfiError::NotFound)
    }
}
