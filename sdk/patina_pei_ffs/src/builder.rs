//! Composition of firmware volume images.
//!
//! [`VolumeBuilder`] and [`FileBuilder`] serialize FFS2 volumes with correct headers, checksums, and alignment.
//! They produce plain byte buffers that [`crate::VolumeRef`] and [`crate::MemoryMappedFvReader`] parse back, and
//! are used to stage volumes for PEI Core tests.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use core::{iter, mem, slice};

use patina_pei::pi::fw_fs::{
    ffs::{
        self,
        file::raw::{attributes, state},
    },
    fv,
};
use r_efi::efi;

/// Block size written into the block map of built volumes.
const BLOCK_SIZE: u32 = 0x10;

fn sum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, value| sum.wrapping_add(*value))
}

/// Builds one FFS file.
#[derive(Debug, Clone)]
pub struct FileBuilder {
    name: efi::Guid,
    file_type: u8,
    data_checksum: bool,
    deleted: bool,
    sections: Vec<(u8, Vec<u8>)>,
}

impl FileBuilder {
    pub fn new(name: efi::Guid, file_type: u8) -> Self {
        Self { name, file_type, data_checksum: false, deleted: false, sections: Vec::new() }
    }

    /// Appends a leaf section.
    pub fn with_section(mut self, section_type: u8, data: Vec<u8>) -> Self {
        self.sections.push((section_type, data));
        self
    }

    /// Sets the data checksum attribute and computes the file checksum.
    pub fn with_data_checksum(mut self) -> Self {
        self.data_checksum = true;
        self
    }

    /// Marks the file deleted. It keeps its space in the volume.
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    fn serialize_sections(&self) -> Vec<u8> {
        let mut content = Vec::new();
        for (section_type, data) in &self.sections {
            //pad to next 4-byte aligned length, since sections start at 4-byte aligned offsets.
            content.extend(iter::repeat_n(0u8, content.len().next_multiple_of(4) - content.len()));
            let header_size = mem::size_of::<ffs::section::Header>();
            if header_size + data.len() < 0xFFFFFF {
                let size = (header_size + data.len()) as u32;
                content.extend_from_slice(&size.to_le_bytes()[..3]);
                content.push(*section_type);
            } else {
                let size = (mem::size_of::<ffs::section::Header2>() + data.len()) as u32;
                content.extend_from_slice(&ffs::section::EXTENDED_SIZE_MARKER);
                content.push(*section_type);
                content.extend_from_slice(&size.to_le_bytes());
            }
            content.extend_from_slice(data);
        }
        content
    }

    /// Serializes the file for a volume whose erased bytes read as `erase_byte`.
    pub fn serialize(&self, erase_byte: u8) -> Vec<u8> {
        let content = self.serialize_sections();
        let attributes = if self.data_checksum { attributes::CHECKSUM } else { 0 };
        let mut header = ffs::file::Header {
            name: self.name,
            integrity_check_header: 0,
            integrity_check_file: 0,
            file_type: self.file_type,
            attributes,
            size: [0u8; 3],
            state: 0,
        };
        let size = mem::size_of_val(&header) + content.len();
        header.size.copy_from_slice(&size.to_le_bytes()[0..3]);

        // checksum excludes state and integrity_check_file, both zero here.
        // safety: header is repr(C) plain data.
        let header_bytes =
            unsafe { slice::from_raw_parts(&raw const header as *const u8, mem::size_of_val(&header)) };
        header.integrity_check_header = 0u8.wrapping_sub(sum8(header_bytes));

        header.integrity_check_file =
            if self.data_checksum { 0u8.wrapping_sub(sum8(&content)) } else { ffs::file::FFS_FIXED_CHECKSUM };

        header.state = state::HEADER_CONSTRUCTION | state::HEADER_VALID | state::DATA_VALID;
        if self.deleted {
            header.state |= state::DELETED;
        }
        if erase_byte == 0xff {
            header.state = !header.state;
        }

        // safety: header is repr(C) plain data.
        let header_bytes =
            unsafe { slice::from_raw_parts(&raw const header as *const u8, mem::size_of_val(&header)) };
        let mut file = header_bytes.to_vec();
        file.extend(content);
        file
    }
}

/// Builds an FFS2 firmware volume.
#[derive(Debug, Clone, Default)]
pub struct VolumeBuilder {
    erase_polarity: bool,
    files: Vec<FileBuilder>,
}

impl VolumeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects whether erased bytes read as 0xFF.
    pub fn with_erase_polarity(mut self, erase_polarity: bool) -> Self {
        self.erase_polarity = erase_polarity;
        self
    }

    pub fn with_file(mut self, file: FileBuilder) -> Self {
        self.files.push(file);
        self
    }

    /// Serializes the volume. Files start right after the header and block map, each 8-byte aligned.
    pub fn build(&self) -> Vec<u8> {
        let erase_byte = if self.erase_polarity { 0xff } else { 0 };
        let header_length = mem::size_of::<fv::Header>() + 2 * mem::size_of::<fv::BlockMapEntry>();

        let mut body = Vec::new();
        for file in &self.files {
            let pad = (header_length + body.len()).next_multiple_of(8) - (header_length + body.len());
            body.extend(iter::repeat_n(erase_byte, pad));
            body.extend(file.serialize(erase_byte));
        }
        let total = (header_length + body.len()).next_multiple_of(BLOCK_SIZE as usize);
        body.extend(iter::repeat_n(erase_byte, total - header_length - body.len()));

        let mut header = fv::Header {
            zero_vector: [0u8; 16],
            file_system_guid: ffs::guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID,
            fv_length: total as u64,
            signature: fv::SIGNATURE,
            attributes: if self.erase_polarity { fv::ERASE_POLARITY } else { 0 },
            header_length: header_length as u16,
            checksum: 0,
            ext_header_offset: 0,
            reserved: 0,
            revision: fv::FFS_REVISION,
        };

        let mut image = Vec::with_capacity(total);
        // safety: header is repr(C) plain data.
        let header_bytes =
            unsafe { slice::from_raw_parts(&raw const header as *const u8, mem::size_of_val(&header)) };
        image.extend_from_slice(header_bytes);
        image.extend_from_slice(&(total as u32 / BLOCK_SIZE).to_le_bytes());
        image.extend_from_slice(&BLOCK_SIZE.to_le_bytes());
        image.extend_from_slice(&[0u8; 8]);

        let sum =
            image.chunks_exact(2).fold(0u16, |sum, value| sum.wrapping_add(u16::from_le_bytes([value[0], value[1]])));
        header.checksum = 0u16.wrapping_sub(sum);
        image[50..52].copy_from_slice(&header.checksum.to_le_bytes());

        image.extend(body);
        image
    }
}
