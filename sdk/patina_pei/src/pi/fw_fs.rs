//! Firmware Volume and Firmware File System layouts (PI Spec Volume 3, chapters 2 and 3).
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use r_efi::efi;

pub mod ffs {
    use super::efi;

    pub mod guid {
        use super::efi;

        pub const EFI_FIRMWARE_FILE_SYSTEM2_GUID: efi::Guid =
            efi::Guid::from_fields(0x8c8ce578, 0x8a3d, 0x4f1c, 0x99, 0x35, &[0x89, 0x61, 0x85, 0xc3, 0x2d, 0xd3]);
        pub const EFI_FIRMWARE_FILE_SYSTEM3_GUID: efi::Guid =
            efi::Guid::from_fields(0x5473c07a, 0x3dcb, 0x4dca, 0xbd, 0x6f, &[0x1e, 0x96, 0x89, 0xe7, 0x34, 0x9a]);
        /// Name of the FREEFORM file whose RAW section lists PEIMs to dispatch first.
        pub const PEI_APRIORI_FILE_NAME_GUID: efi::Guid =
            efi::Guid::from_fields(0x1b45cc0a, 0x156a, 0x428a, 0xaf, 0x62, &[0x49, 0x86, 0x4d, 0xa0, 0xe6, 0xe6]);
    }

    pub mod file {
        use super::efi;

        pub mod raw {
            #[rustfmt::skip]
            pub mod r#type {
                pub const ALL:                   u8 = 0x00;
                pub const RAW:                   u8 = 0x01;
                pub const FREEFORM:              u8 = 0x02;
                pub const SECURITY_CORE:         u8 = 0x03;
                pub const PEI_CORE:              u8 = 0x04;
                pub const DXE_CORE:              u8 = 0x05;
                pub const PEIM:                  u8 = 0x06;
                pub const DRIVER:                u8 = 0x07;
                pub const COMBINED_PEIM_DRIVER:  u8 = 0x08;
                pub const APPLICATION:           u8 = 0x09;
                pub const MM:                    u8 = 0x0A;
                pub const FIRMWARE_VOLUME_IMAGE: u8 = 0x0B;
                pub const FFS_PAD:               u8 = 0xF0;
            }

            #[rustfmt::skip]
            pub mod state {
                pub const HEADER_CONSTRUCTION: u8 = 0x01;
                pub const HEADER_VALID:        u8 = 0x02;
                pub const DATA_VALID:          u8 = 0x04;
                pub const MARKED_FOR_UPDATE:   u8 = 0x08;
                pub const DELETED:             u8 = 0x10;
                pub const HEADER_INVALID:      u8 = 0x20;
            }

            #[rustfmt::skip]
            pub mod attributes {
                pub const LARGE_FILE:       u8 = 0x01;
                pub const DATA_ALIGNMENT_2: u8 = 0x02;
                pub const FIXED:            u8 = 0x04;
                pub const DATA_ALIGNMENT:   u8 = 0x38;
                pub const CHECKSUM:         u8 = 0x40;
            }
        }

        /// FFS file checksum value used when the data checksum attribute is clear.
        pub const FFS_FIXED_CHECKSUM: u8 = 0xAA;

        /// Firmware file header (EFI_FFS_FILE_HEADER).
        #[repr(C)]
        #[derive(Debug, Clone, Copy)]
        pub struct Header {
            pub name: efi::Guid,
            pub integrity_check_header: u8,
            pub integrity_check_file: u8,
            pub file_type: u8,
            pub attributes: u8,
            pub size: [u8; 3],
            pub state: u8,
        }

        /// Firmware file header for files larger than 16MiB (EFI_FFS_FILE_HEADER2).
        #[repr(C)]
        #[derive(Debug, Clone, Copy)]
        pub struct Header2 {
            pub header: Header,
            pub extended_size: u64,
        }
    }

    pub mod section {
        #[rustfmt::skip]
        pub mod raw_type {
            pub const COMPRESSION:           u8 = 0x01;
            pub const GUID_DEFINED:          u8 = 0x02;
            pub const DISPOSABLE:            u8 = 0x03;
            pub const PE32:                  u8 = 0x10;
            pub const PIC:                   u8 = 0x11;
            pub const TE:                    u8 = 0x12;
            pub const DXE_DEPEX:             u8 = 0x13;
            pub const VERSION:               u8 = 0x14;
            pub const USER_INTERFACE:        u8 = 0x15;
            pub const COMPATIBILITY16:       u8 = 0x16;
            pub const FIRMWARE_VOLUME_IMAGE: u8 = 0x17;
            pub const FREEFORM_SUBTYPE_GUID: u8 = 0x18;
            pub const RAW:                   u8 = 0x19;
            pub const PEI_DEPEX:             u8 = 0x1B;
            pub const MM_DEPEX:              u8 = 0x1C;
        }

        /// Value of the 24-bit size field that signals an extended (32-bit) size follows the header.
        pub const EXTENDED_SIZE_MARKER: [u8; 3] = [0xFF, 0xFF, 0xFF];

        /// Common section header (EFI_COMMON_SECTION_HEADER).
        #[repr(C)]
        #[derive(Debug, Clone, Copy)]
        pub struct Header {
            pub size: [u8; 3],
            pub section_type: u8,
        }

        /// Section header for sections of 16MiB or more (EFI_COMMON_SECTION_HEADER2).
        #[repr(C)]
        #[derive(Debug, Clone, Copy)]
        pub struct Header2 {
            pub header: Header,
            pub extended_size: u32,
        }
    }
}

pub mod fv {
    use super::efi;

    /// Minimum firmware volume header revision understood by the reader.
    pub const FFS_REVISION: u8 = 2;

    /// Firmware volume header signature, ASCII "_FVH".
    pub const SIGNATURE: u32 = u32::from_le_bytes(*b"_FVH");

    /// `EFI_FVB2_ERASE_POLARITY`: set when erased flash reads as 0xFF.
    pub const ERASE_POLARITY: u32 = 0x0000_0800;

    /// One run of equally sized blocks in the FV block map.
    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockMapEntry {
        pub num_blocks: u32,
        pub length: u32,
    }

    /// Firmware volume header (EFI_FIRMWARE_VOLUME_HEADER), excluding the block map that follows it.
    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct Header {
        pub zero_vector: [u8; 16],
        pub file_system_guid: efi::Guid,
        pub fv_length: u64,
        pub signature: u32,
        pub attributes: u32,
        pub header_length: u16,
        pub checksum: u16,
        pub ext_header_offset: u16,
        pub reserved: u8,
        pub revision: u8,
    }

    /// Extended firmware volume header (EFI_FIRMWARE_VOLUME_EXT_HEADER).
    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct ExtHeader {
        pub fv_name: efi::Guid,
        pub ext_header_size: u32,
    }
}
