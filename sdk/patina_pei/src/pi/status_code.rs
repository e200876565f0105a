#![cfg_attr(rustfmt, rustfmt_skip)]
//! StatusCode definitions reported by the PEI Core.
//!
//! Subset of the codes defined in UEFI Platform Initialization Specification, Volume 3: Shared Architectural
//! Elements. See <https://uefi.org/specs/PI/1.8A/V3_Status_Codes.html#code-definitions>.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// Status code type: the code type combined with a severity.
pub type EfiStatusCodeType = u32;
/// Status code value: class, subclass and operation.
pub type EfiStatusCodeValue = u32;

/// Mask for extracting status code type.
pub const EFI_STATUS_CODE_TYPE_MASK:      EfiStatusCodeType = 0x000000FF;
/// Mask for extracting severity level.
pub const EFI_STATUS_CODE_SEVERITY_MASK:  EfiStatusCodeType = 0xFF000000;

/// Progress code type.
pub const EFI_PROGRESS_CODE:  EfiStatusCodeType = 0x00000001;
/// Error code type.
pub const EFI_ERROR_CODE:     EfiStatusCodeType = 0x00000002;

/// Minor error severity.
pub const EFI_ERROR_MINOR:        EfiStatusCodeType = 0x40000000;
/// Major error severity.
pub const EFI_ERROR_MAJOR:        EfiStatusCodeType = 0x80000000;
/// Unrecovered error severity.
pub const EFI_ERROR_UNRECOVERED:  EfiStatusCodeType = 0x90000000;

/// Operation codes at or above this value are subclass specific.
pub const EFI_SUBCLASS_SPECIFIC:  EfiStatusCodeValue = 0x1000;

/// Software class.
pub const EFI_SOFTWARE:  EfiStatusCodeValue = 0x03000000;

/// PEI Core subclass.
pub const EFI_SOFTWARE_PEI_CORE:    EfiStatusCodeValue = EFI_SOFTWARE | 0x00020000;
/// PEI module subclass.
pub const EFI_SOFTWARE_PEI_MODULE:  EfiStatusCodeValue = EFI_SOFTWARE | 0x00030000;

// Software class progress codes shared by all subclasses.
/// Beginning of a module's initialization.
pub const EFI_SW_PC_INIT_BEGIN:  EfiStatusCodeValue = 0x00000002;
/// End of a module's initialization.
pub const EFI_SW_PC_INIT_END:    EfiStatusCodeValue = 0x00000003;

// PEI Core subclass progress codes.
/// Entry point of the PEI Core.
pub const EFI_SW_PEI_CORE_PC_ENTRY_POINT:      EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC;
/// Hand-off to the next boot phase (DXE IPL).
pub const EFI_SW_PEI_CORE_PC_HANDOFF_TO_NEXT:  EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x00000001;

// Software class error codes shared by all subclasses.
/// Non-specific error.
pub const EFI_SW_EC_NON_SPECIFIC:            EfiStatusCodeValue = 0x00000000;
/// Out of resources.
pub const EFI_SW_EC_OUT_OF_RESOURCES:        EfiStatusCodeValue = 0x00000005;
/// Firmware volume corrupted or rejected.
pub const EFI_SW_EC_FV_CORRUPTED:            EfiStatusCodeValue = 0x00000013;

// PEI Core subclass error codes.
/// The DXE Core could not be loaded.
pub const EFI_SW_PEI_CORE_EC_DXE_CORRUPT:           EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC;
/// The DXE IPL PPI was never installed.
pub const EFI_SW_PEI_CORE_EC_DXEIPL_NOT_FOUND:      EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x00000001;
/// Dispatch finished without permanent memory being installed.
pub const EFI_SW_PEI_CORE_EC_MEMORY_NOT_INSTALLED:  EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x00000002;
