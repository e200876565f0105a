//! PEI Base Definitions
//!
//! Page size constants, alignment helpers and GUID formatting used throughout the PEI phase.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
pub mod guid;

use crate::error::{EfiError, Result};

/// EFI memory allocation functions work in units of EFI_PAGEs that are 4KB.
pub const UEFI_PAGE_SIZE: usize = 0x1000;

/// The mask to apply to an address to get the page offset in UEFI.
pub const UEFI_PAGE_MASK: usize = UEFI_PAGE_SIZE - 1;

/// The shift to apply to an address to get the page frame number in UEFI.
pub const UEFI_PAGE_SHIFT: usize = 12;

/// Converts a page count into a size in bytes.
///
/// ## Errors
///
/// Returns [`EfiError::OutOfResources`] if the size does not fit in a `u64`.
#[inline]
pub fn uefi_pages_to_size(pages: usize) -> Result<u64> {
    (pages as u64).checked_mul(UEFI_PAGE_SIZE as u64).ok_or(EfiError::OutOfResources)
}

/// Aligns the given address down to the nearest boundary specified by align.
///
/// ```
/// use patina_pei::base::align_down;
/// assert_eq!(align_down(1023, 512), Ok(512));
/// ```
///
/// ## Errors
///
/// Returns [`EfiError::InvalidParameter`] if `align` is not a power of two.
#[inline]
pub const fn align_down(addr: u64, align: u64) -> Result<u64> {
    if !align.is_power_of_two() {
        return Err(EfiError::InvalidParameter);
    }
    Ok(addr & !(align - 1))
}

/// Aligns the given address up to the nearest boundary specified by align.
///
/// ```
/// use patina_pei::base::align_up;
/// assert_eq!(align_up(1025, 512), Ok(1536));
/// ```
///
/// ## Errors
///
/// Returns [`EfiError::InvalidParameter`] if `align` is not a power of two, or [`EfiError::OutOfResources`] if the
/// aligned value overflows.
#[inline]
pub const fn align_up(addr: u64, align: u64) -> Result<u64> {
    if !align.is_power_of_two() {
        return Err(EfiError::InvalidParameter);
    }
    let align_mask = align - 1;
    if addr & align_mask == 0 {
        return Ok(addr);
    }
    match (addr | align_mask).checked_add(1) {
        Some(aligned) => Ok(aligned),
        None => Err(EfiError::OutOfResources),
    }
}
