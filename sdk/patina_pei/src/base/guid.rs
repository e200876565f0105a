//! GUID display helpers.
//!
//! `efi::Guid` only implements `Debug` as a field dump; the [`GuidFmt`] adapter renders the registry format
//! (`xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`) used in logs.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt;

use r_efi::efi;

/// Borrowing display adapter for an `efi::Guid`.
///
/// ```
/// use patina_pei::GuidFmt;
/// use r_efi::efi;
///
/// let guid = efi::Guid::from_fields(0x8c8ce578, 0x8a3d, 0x4f1c, 0x99, 0x35, &[0x89, 0x61, 0x85, 0xc3, 0x2d, 0xd3]);
/// assert_eq!(format!("{}", GuidFmt(&guid)), "8C8CE578-8A3D-4F1C-9935-896185C32DD3");
/// ```
#[derive(Clone, Copy)]
pub struct GuidFmt<'a>(pub &'a efi::Guid);

impl fmt::Display for GuidFmt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (time_low, time_mid, time_hi, clk_hi, clk_low, node) = self.0.as_fields();
        write!(f, "{time_low:08X}-{time_mid:04X}-{time_hi:04X}-{clk_hi:02X}{clk_low:02X}-")?;
        node.iter().try_for_each(|byte| write!(f, "{byte:02X}"))
    }
}

impl fmt::Debug for GuidFmt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Shorthand for wrapping a GUID reference in [`GuidFmt`] inside a `log` macro.
#[macro_export]
macro_rules! guid_fmt {
    ($guid:expr) => {
        $crate::GuidFmt(&$guid)
    };
}
