//! PEIM-to-PEIM Interface (PPI) descriptor layouts and well-known PPIs (PI Spec Volume 1, 4.4 and 6.1).
//!
//! Descriptors are published in lists. Every list ends with an entry whose flags carry
//! [`flags::TERMINATE_LIST`]; the PEI Core rejects lists that run out before that marker.
//!
//! ## Examples
//!
//! ```
//! use core::ffi::c_void;
//! use patina_pei::pi::ppi::{self, PpiDescriptor};
//! use r_efi::efi;
//!
//! static MY_PPI_GUID: efi::Guid =
//!     efi::Guid::from_fields(0x6b3ad0b2, 0x52b9, 0x4c2e, 0x92, 0x7b, &[0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc]);
//! static MY_PPI: u32 = 0x1234;
//!
//! let list = [PpiDescriptor::new(&MY_PPI_GUID, &MY_PPI as *const u32 as *mut c_void).terminate()];
//! assert!(list[0].is_last());
//! assert_eq!(list[0].flags, ppi::flags::PPI | ppi::flags::TERMINATE_LIST);
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::{ffi::c_void, fmt, ptr};

use r_efi::efi;

use crate::{error::Result, services::PeiServices, GuidFmt};

#[rustfmt::skip]
pub mod flags {
    /// The descriptor publishes a PPI.
    pub const PPI:             usize = 0x0000_0010;
    /// The descriptor registers a notify that fires synchronously inside the install call.
    pub const NOTIFY_CALLBACK: usize = 0x0000_0020;
    /// The descriptor registers a notify that fires after the installing PEIM returns.
    pub const NOTIFY_DISPATCH: usize = 0x0000_0040;
    /// Either notify type.
    pub const NOTIFY_TYPES:    usize = NOTIFY_CALLBACK | NOTIFY_DISPATCH;
    /// Last descriptor in a list.
    pub const TERMINATE_LIST:  usize = 0x8000_0000;
}

/// Publishes one PPI instance (EFI_PEI_PPI_DESCRIPTOR).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PpiDescriptor {
    pub flags: usize,
    pub guid: *const efi::Guid,
    pub ppi: *mut c_void,
}

// Descriptors are plain data published once; the core copies them and never writes through these pointers.
unsafe impl Sync for PpiDescriptor {}
unsafe impl Send for PpiDescriptor {}

impl PpiDescriptor {
    /// Creates a PPI descriptor that is not the last entry of its list.
    pub const fn new(guid: &'static efi::Guid, ppi: *mut c_void) -> Self {
        Self { flags: flags::PPI, guid, ppi }
    }

    /// Marks the descriptor as the last entry of its list.
    pub const fn terminate(mut self) -> Self {
        self.flags |= flags::TERMINATE_LIST;
        self
    }

    pub fn is_last(&self) -> bool {
        self.flags & flags::TERMINATE_LIST != 0
    }

    /// Returns the GUID this descriptor publishes, or `None` when the pointer is null.
    pub fn guid(&self) -> Option<efi::Guid> {
        // Safety: a non-null GUID pointer in a published descriptor must reference a valid GUID.
        unsafe { self.guid.as_ref().copied() }
    }
}

impl fmt::Debug for PpiDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("PpiDescriptor");
        debug.field("flags", &format_args!("{:#x}", self.flags));
        match self.guid() {
            Some(guid) => debug.field("guid", &GuidFmt(&guid)),
            None => debug.field("guid", &ptr::null::<efi::Guid>()),
        };
        debug.field("ppi", &self.ppi).finish()
    }
}

/// Callback invoked once for every install of a PPI matching a registered [`NotifyDescriptor`].
pub type PpiNotifyCallback =
    fn(services: &mut dyn PeiServices, descriptor: &NotifyDescriptor, ppi: *mut c_void) -> Result<()>;

/// Registers interest in the installation of a PPI (EFI_PEI_NOTIFY_DESCRIPTOR).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NotifyDescriptor {
    pub flags: usize,
    pub guid: *const efi::Guid,
    pub notify: Option<PpiNotifyCallback>,
}

unsafe impl Sync for NotifyDescriptor {}
unsafe impl Send for NotifyDescriptor {}

impl NotifyDescriptor {
    /// Creates a notify that fires synchronously when a matching PPI is installed.
    pub const fn callback(guid: &'static efi::Guid, notify: PpiNotifyCallback) -> Self {
        Self { flags: flags::NOTIFY_CALLBACK, guid, notify: Some(notify) }
    }

    /// Creates a notify that fires after the PEIM installing a matching PPI returns to the dispatcher.
    pub const fn dispatch(guid: &'static efi::Guid, notify: PpiNotifyCallback) -> Self {
        Self { flags: flags::NOTIFY_DISPATCH, guid, notify: Some(notify) }
    }

    /// Marks the descriptor as the last entry of its list.
    pub const fn terminate(mut self) -> Self {
        self.flags |= flags::TERMINATE_LIST;
        self
    }

    pub fn is_last(&self) -> bool {
        self.flags & flags::TERMINATE_LIST != 0
    }

    /// Returns the GUID this notify watches, or `None` when the pointer is null.
    pub fn guid(&self) -> Option<efi::Guid> {
        // Safety: a non-null GUID pointer in a registered descriptor must reference a valid GUID.
        unsafe { self.guid.as_ref().copied() }
    }
}

impl fmt::Debug for NotifyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("NotifyDescriptor");
        debug.field("flags", &format_args!("{:#x}", self.flags));
        match self.guid() {
            Some(guid) => debug.field("guid", &GuidFmt(&guid)),
            None => debug.field("guid", &ptr::null::<efi::Guid>()),
        };
        debug.field("notify", &self.notify.map(|notify| notify as *const ())).finish()
    }
}

/// Installed by the PEI Core once permanent memory is available and the core runs from it.
pub const MEMORY_DISCOVERED_PPI_GUID: efi::Guid =
    efi::Guid::from_fields(0xf894643d, 0xc449, 0x42d1, 0x8e, 0xa8, &[0x85, 0xbd, 0xd8, 0xc6, 0x5b, 0xde]);

/// Describes an additional firmware volume for the PEI Core to dispatch from.
pub const FIRMWARE_VOLUME_INFO_PPI_GUID: efi::Guid =
    efi::Guid::from_fields(0x49edb1c1, 0xbf21, 0x4761, 0xbb, 0x12, &[0xeb, 0x00, 0x31, 0xaa, 0xbb, 0x39]);

/// The final PPI of the PEI phase; loads and enters the DXE Core.
pub const DXE_IPL_PPI_GUID: efi::Guid =
    efi::Guid::from_fields(0x0ae8ce5d, 0xe448, 0x4437, 0xa8, 0xd7, &[0xeb, 0xf5, 0xf1, 0x94, 0xf7, 0x31]);

/// Interface of the Firmware Volume Info PPI (EFI_PEI_FIRMWARE_VOLUME_INFO_PPI).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FirmwareVolumeInfoPpi {
    /// File system format of the volume; the core accepts FFS2 and FFS3.
    pub fv_format: efi::Guid,
    /// Base address of the volume.
    pub fv_info: *mut c_void,
    /// Size of the volume in bytes.
    pub fv_info_size: u32,
    pub parent_fv_name: *const efi::Guid,
    pub parent_file_name: *const efi::Guid,
}

/// Entry of the DXE IPL PPI. Receives the final HOB list and does not return on success.
pub type DxeIplEntry = fn(this: &DxeIplPpi, services: &mut dyn PeiServices, hob_list: *const c_void) -> Result<()>;

/// Interface of the DXE IPL PPI (EFI_DXE_IPL_PPI).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DxeIplPpi {
    pub entry: DxeIplEntry,
}
