//! PEI Core PPI Database
//!
//! Installed PPIs and registered notifies share one fixed-capacity slot arena. Slots are only ever appended; a
//! reinstall rewrites its slot in place, so the slot index is the install order used to pick "instance N" of a GUID.
//!
//! The database never calls out. Pairing new installs with notifies is done by [`PpiDatabase::take_pending`], which
//! hands the matched pairs to the caller to fire. Each notify kind keeps two cursors (installs already matched and
//! notifies already matched) so that every (install, notify) pair is returned by exactly one call:
//!
//! - notifies registered since the last call are matched against every installed PPI, and
//! - PPIs installed since the last call are matched against the notifies that were already registered.
//!
//! Entries hold copies of the published descriptors plus the address of the original PPI descriptor, which serves
//! as its identity for reinstall. Nothing outside the database points into the arena, so migrating it to permanent
//! memory is a move of the struct followed by [`PpiDatabase::rebase`] of the addresses the entries hold.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use core::{ffi::c_void, ptr};

use patina_pei::{
    error::{EfiError, Result},
    guid_fmt,
    pi::ppi::{flags, NotifyDescriptor, PpiDescriptor},
    services::LocatedPpi,
};
use r_efi::efi;

/// When a notify fires relative to the install that satisfies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NotifyKind {
    /// Inside the install call.
    Callback,
    /// After the installing PEIM returns to the dispatcher.
    Dispatch,
}

/// What runs when a notify fires.
#[derive(Debug, Clone, Copy)]
pub(crate) enum NotifyHandler {
    /// A notify registered by a PEIM.
    Module(NotifyDescriptor),
    /// The core's own Firmware Volume Info PPI handler.
    FirmwareVolumeInfo,
}

/// A matched (notify, install) pair waiting to be fired.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingNotify {
    pub handler: NotifyHandler,
    pub guid: efi::Guid,
    pub ppi: *mut c_void,
}

#[derive(Debug, Clone, Copy)]
struct PpiEntry {
    guid: efi::Guid,
    ppi: *mut c_void,
    descriptor: *const PpiDescriptor,
}

#[derive(Debug, Clone, Copy)]
struct NotifyEntry {
    guid: efi::Guid,
    handler: NotifyHandler,
}

#[derive(Debug, Clone, Copy)]
enum PpiSlot {
    Ppi(PpiEntry),
    Notify(NotifyEntry),
}

#[derive(Debug, Default, Clone, Copy)]
struct SweepCursor {
    installs: usize,
    notifies: usize,
}

#[derive(Debug)]
pub(crate) struct PpiDatabase {
    capacity: usize,
    slots: Vec<PpiSlot>,
    ppis: Vec<usize>,
    callback_notifies: Vec<usize>,
    dispatch_notifies: Vec<usize>,
    callback_cursor: SweepCursor,
    dispatch_cursor: SweepCursor,
}

/// Returns the list up to and including its terminating entry.
fn terminated_list<T>(list: &[T], is_last: impl Fn(&T) -> bool) -> Result<&[T]> {
    match list.iter().position(is_last) {
        Some(last) => Ok(&list[..=last]),
        None => {
            log::error!("Descriptor list of {} entries is not terminated", list.len());
            Err(EfiError::InvalidParameter)
        }
    }
}

fn validate_ppi(descriptor: &PpiDescriptor) -> Result<efi::Guid> {
    match descriptor.guid() {
        Some(guid) if descriptor.flags & flags::PPI != 0 && !descriptor.ppi.is_null() => Ok(guid),
        _ => {
            log::error!("Malformed PPI descriptor {:?}", descriptor);
            Err(EfiError::InvalidParameter)
        }
    }
}

fn validate_notify(descriptor: &NotifyDescriptor) -> Result<(efi::Guid, NotifyKind)> {
    match descriptor.guid() {
        Some(guid) if descriptor.notify.is_some() && descriptor.flags & flags::NOTIFY_TYPES != 0 => {
            let kind = if descriptor.flags & flags::NOTIFY_CALLBACK != 0 {
                NotifyKind::Callback
            } else {
                NotifyKind::Dispatch
            };
            Ok((guid, kind))
        }
        _ => {
            log::error!("Malformed notify descriptor {:?}", descriptor);
            Err(EfiError::InvalidParameter)
        }
    }
}

impl PpiDatabase {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::with_capacity(capacity),
            ppis: Vec::new(),
            callback_notifies: Vec::new(),
            dispatch_notifies: Vec::new(),
            callback_cursor: SweepCursor::default(),
            dispatch_cursor: SweepCursor::default(),
        }
    }

    fn reserve(&self, count: usize) -> Result<()> {
        if self.slots.len() + count > self.capacity {
            log::error!(
                "PPI database full: {} of {} slots used, {} requested",
                self.slots.len(),
                self.capacity,
                count
            );
            return Err(EfiError::OutOfResources);
        }
        Ok(())
    }

    /// Installs every descriptor up to the list terminator. Either all are installed or none.
    pub fn install(&mut self, list: &[PpiDescriptor]) -> Result<()> {
        let list = terminated_list(list, PpiDescriptor::is_last)?;
        let guids = list.iter().map(validate_ppi).collect::<Result<Vec<_>>>()?;
        self.reserve(list.len())?;

        for (descriptor, guid) in list.iter().zip(guids) {
            log::trace!("Install PPI {:?} -> {:p}", guid_fmt!(guid), descriptor.ppi);
            self.ppis.push(self.slots.len());
            self.slots.push(PpiSlot::Ppi(PpiEntry { guid, ppi: descriptor.ppi, descriptor }));
        }
        Ok(())
    }

    /// Registers every notify up to the list terminator. Either all are registered or none.
    pub fn notify(&mut self, list: &[NotifyDescriptor]) -> Result<()> {
        let list = terminated_list(list, NotifyDescriptor::is_last)?;
        let entries = list.iter().map(validate_notify).collect::<Result<Vec<_>>>()?;
        self.reserve(list.len())?;

        for (descriptor, (guid, kind)) in list.iter().zip(entries) {
            log::trace!("Register {:?} notify for {:?}", kind, guid_fmt!(guid));
            self.push_notify(guid, kind, NotifyHandler::Module(*descriptor));
        }
        Ok(())
    }

    /// Registers a notify handled by the core itself.
    pub fn register_core_notify(&mut self, guid: efi::Guid, kind: NotifyKind, handler: NotifyHandler) -> Result<()> {
        self.reserve(1)?;
        self.push_notify(guid, kind, handler);
        Ok(())
    }

    fn push_notify(&mut self, guid: efi::Guid, kind: NotifyKind, handler: NotifyHandler) {
        let index = self.slots.len();
        self.slots.push(PpiSlot::Notify(NotifyEntry { guid, handler }));
        match kind {
            NotifyKind::Callback => self.callback_notifies.push(index),
            NotifyKind::Dispatch => self.dispatch_notifies.push(index),
        }
    }

    /// Replaces the installed descriptor `old` with `new` in the same slot.
    ///
    /// Returns the callback notifies that watch the new GUID; the reinstall counts as a fresh install for them.
    pub fn reinstall(&mut self, old: &PpiDescriptor, new: &PpiDescriptor) -> Result<Vec<PendingNotify>> {
        let guid = validate_ppi(new)?;
        let old: *const PpiDescriptor = old;
        let slot = self
            .ppis
            .iter()
            .copied()
            .find(|index| matches!(self.slots[*index], PpiSlot::Ppi(entry) if entry.descriptor == old))
            .ok_or(EfiError::NotFound)?;

        log::trace!("Reinstall PPI slot {} as {:?} -> {:p}", slot, guid_fmt!(guid), new.ppi);
        self.slots[slot] = PpiSlot::Ppi(PpiEntry { guid, ppi: new.ppi, descriptor: new });

        Ok(self
            .notifies(NotifyKind::Callback)
            .filter(|notify| notify.guid == guid)
            .map(|notify| PendingNotify { handler: notify.handler, guid, ppi: new.ppi })
            .collect())
    }

    /// Finds the `instance`-th installed PPI with `guid`, in install order.
    pub fn locate(&self, guid: &efi::Guid, instance: usize) -> Result<LocatedPpi> {
        self.installed()
            .filter(|entry| entry.guid == *guid)
            .nth(instance)
            .map(|entry| LocatedPpi { descriptor: entry.descriptor, ppi: entry.ppi })
            .ok_or(EfiError::NotFound)
    }

    pub fn is_installed(&self, guid: &efi::Guid) -> bool {
        self.installed().any(|entry| entry.guid == *guid)
    }

    fn installed(&self) -> impl Iterator<Item = PpiEntry> + '_ {
        self.ppis.iter().filter_map(|index| match self.slots[*index] {
            PpiSlot::Ppi(entry) => Some(entry),
            PpiSlot::Notify(_) => None,
        })
    }

    fn notify_indices(&self, kind: NotifyKind) -> &[usize] {
        match kind {
            NotifyKind::Callback => &self.callback_notifies,
            NotifyKind::Dispatch => &self.dispatch_notifies,
        }
    }

    fn notifies(&self, kind: NotifyKind) -> impl Iterator<Item = NotifyEntry> + '_ {
        self.notify_indices(kind).iter().filter_map(|index| match self.slots[*index] {
            PpiSlot::Notify(entry) => Some(entry),
            PpiSlot::Ppi(_) => None,
        })
    }

    fn cursor_mut(&mut self, kind: NotifyKind) -> &mut SweepCursor {
        match kind {
            NotifyKind::Callback => &mut self.callback_cursor,
            NotifyKind::Dispatch => &mut self.dispatch_cursor,
        }
    }

    /// Returns the (notify, install) pairs of `kind` not returned before, and marks them returned.
    pub fn take_pending(&mut self, kind: NotifyKind) -> Vec<PendingNotify> {
        let cursor = *self.cursor_mut(kind);
        let installs: Vec<PpiEntry> = self.installed().collect();
        let notifies: Vec<NotifyEntry> = self.notifies(kind).collect();

        let mut pending = Vec::new();
        // New notifies see every install, old and new.
        for notify in &notifies[cursor.notifies..] {
            for install in installs.iter().filter(|install| install.guid == notify.guid) {
                pending.push(PendingNotify { handler: notify.handler, guid: install.guid, ppi: install.ppi });
            }
        }
        // Old notifies see only the new installs.
        for notify in &notifies[..cursor.notifies] {
            for install in installs[cursor.installs..].iter().filter(|install| install.guid == notify.guid) {
                pending.push(PendingNotify { handler: notify.handler, guid: install.guid, ppi: install.ppi });
            }
        }

        *self.cursor_mut(kind) = SweepCursor { installs: installs.len(), notifies: notifies.len() };
        pending
    }

    /// Applies `translate` to every address the entries hold.
    ///
    /// A descriptor that moved is rewritten at its new address so its interface and GUID pointers match the entry.
    /// Descriptors that did not move are left untouched.
    ///
    /// ## Safety
    ///
    /// Every descriptor whose address `translate` changes must already have been copied to the translated address,
    /// and that copy must be writable.
    pub unsafe fn rebase(&mut self, translate: impl Fn(u64) -> u64) {
        for slot in self.slots.iter_mut() {
            match slot {
                PpiSlot::Ppi(entry) => {
                    entry.ppi = translate(entry.ppi as u64) as *mut c_void;
                    let moved = translate(entry.descriptor as u64) as *mut PpiDescriptor;
                    if moved as *const PpiDescriptor != entry.descriptor {
                        // Safety: the caller copied the descriptor to `moved`.
                        unsafe {
                            let mut descriptor = ptr::read_unaligned(moved);
                            descriptor.ppi = entry.ppi;
                            descriptor.guid = translate(descriptor.guid as u64) as *const efi::Guid;
                            ptr::write_unaligned(moved, descriptor);
                        }
                        entry.descriptor = moved;
                    }
                }
                PpiSlot::Notify(NotifyEntry { handler: NotifyHandler::Module(descriptor), .. }) => {
                    descriptor.guid = translate(descriptor.guid as u64) as *const efi::Guid;
                }
                PpiSlot::Notify(_) => (),
            }
        }
    }

    pub fn ppi_count(&self) -> usize {
        self.ppis.len()
    }

    pub fn slots_used(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use core::ptr;

    use patina_pei::services::PeiServices;

    use super::*;
    use crate::test_support::test_guid;

    static G1: efi::Guid = test_guid(1);
    static G2: efi::Guid = test_guid(2);
    static IFACE_A: u32 = 0xA;
    static IFACE_B: u32 = 0xB;

    fn iface(value: &'static u32) -> *mut c_void {
        value as *const u32 as *mut c_void
    }

    fn callback(_: &mut dyn PeiServices, _: &NotifyDescriptor, _: *mut c_void) -> Result<()> {
        Ok(())
    }

    fn pending_ppis(pending: &[PendingNotify]) -> Vec<*mut c_void> {
        pending.iter().map(|pending| pending.ppi).collect()
    }

    #[test]
    fn install_should_validate_whole_list_before_appending() {
        let mut db = PpiDatabase::new(8);
        assert_eq!(db.install(&[]), Err(EfiError::InvalidParameter));
        assert_eq!(db.install(&[PpiDescriptor::new(&G1, iface(&IFACE_A))]), Err(EfiError::InvalidParameter));

        let bad_second =
            [PpiDescriptor::new(&G1, iface(&IFACE_A)), PpiDescriptor::new(&G2, ptr::null_mut()).terminate()];
        assert_eq!(db.install(&bad_second), Err(EfiError::InvalidParameter));

        let mut no_ppi_flag = PpiDescriptor::new(&G1, iface(&IFACE_A)).terminate();
        no_ppi_flag.flags = flags::TERMINATE_LIST;
        assert_eq!(db.install(&[no_ppi_flag]), Err(EfiError::InvalidParameter));

        let null_guid =
            PpiDescriptor { flags: flags::PPI | flags::TERMINATE_LIST, guid: ptr::null(), ppi: iface(&IFACE_A) };
        assert_eq!(db.install(&[null_guid]), Err(EfiError::InvalidParameter));
        assert_eq!(db.slots_used(), 0);
    }

    #[test]
    fn install_should_stop_at_terminator() {
        let mut db = PpiDatabase::new(8);
        let list = [PpiDescriptor::new(&G1, iface(&IFACE_A)).terminate(), PpiDescriptor::new(&G2, ptr::null_mut())];
        assert_eq!(db.install(&list), Ok(()));
        assert_eq!(db.ppi_count(), 1);
    }

    #[test]
    fn capacity_should_be_shared_and_checked_up_front() {
        let mut db = PpiDatabase::new(3);
        db.notify(&[NotifyDescriptor::callback(&G2, callback).terminate()]).unwrap();
        let list = [
            PpiDescriptor::new(&G1, iface(&IFACE_A)),
            PpiDescriptor::new(&G1, iface(&IFACE_B)),
            PpiDescriptor::new(&G1, iface(&IFACE_B)).terminate(),
        ];
        assert_eq!(db.install(&list), Err(EfiError::OutOfResources));
        assert_eq!(db.slots_used(), 1);
        assert_eq!(db.install(&list[1..]), Ok(()));
        assert_eq!(db.notify(&[NotifyDescriptor::callback(&G2, callback).terminate()]), Err(EfiError::OutOfResources));
    }

    #[test]
    fn locate_should_follow_install_order() {
        let mut db = PpiDatabase::new(8);
        db.install(&[PpiDescriptor::new(&G1, iface(&IFACE_A)).terminate()]).unwrap();
        db.install(&[PpiDescriptor::new(&G2, iface(&IFACE_A)).terminate()]).unwrap();
        db.install(&[PpiDescriptor::new(&G1, iface(&IFACE_B)).terminate()]).unwrap();

        assert_eq!(db.locate(&G1, 0).unwrap().ppi, iface(&IFACE_A));
        assert_eq!(db.locate(&G1, 1).unwrap().ppi, iface(&IFACE_B));
        assert_eq!(db.locate(&G1, 2), Err(EfiError::NotFound));
        assert!(db.is_installed(&G2));
        assert!(!db.is_installed(&test_guid(9)));
    }

    #[test]
    fn notify_should_validate_type_and_callback() {
        let mut db = PpiDatabase::new(8);
        let mut untyped = NotifyDescriptor::callback(&G1, callback).terminate();
        untyped.flags = flags::TERMINATE_LIST;
        assert_eq!(db.notify(&[untyped]), Err(EfiError::InvalidParameter));

        let mut no_callback = NotifyDescriptor::callback(&G1, callback).terminate();
        no_callback.notify = None;
        assert_eq!(db.notify(&[no_callback]), Err(EfiError::InvalidParameter));
        assert_eq!(db.notify(&[NotifyDescriptor::dispatch(&G1, callback)]), Err(EfiError::InvalidParameter));
        assert_eq!(db.slots_used(), 0);
    }

    #[test]
    fn take_pending_should_pair_each_install_and_notify_once() {
        let mut db = PpiDatabase::new(16);
        db.install(&[PpiDescriptor::new(&G1, iface(&IFACE_A)).terminate()]).unwrap();
        db.notify(&[NotifyDescriptor::callback(&G1, callback).terminate()]).unwrap();
        assert_eq!(pending_ppis(&db.take_pending(NotifyKind::Callback)), vec![iface(&IFACE_A)]);
        assert!(db.take_pending(NotifyKind::Callback).is_empty());

        db.install(&[PpiDescriptor::new(&G1, iface(&IFACE_B)).terminate()]).unwrap();
        // A second notify and an install registered in the same window each see everything exactly once.
        db.notify(&[NotifyDescriptor::callback(&G1, callback).terminate()]).unwrap();
        let pending = db.take_pending(NotifyKind::Callback);
        assert_eq!(pending_ppis(&pending), vec![iface(&IFACE_A), iface(&IFACE_B), iface(&IFACE_B)]);
        assert!(db.take_pending(NotifyKind::Callback).is_empty());
    }

    #[test]
    fn dispatch_and_callback_notifies_should_sweep_independently() {
        let mut db = PpiDatabase::new(16);
        db.notify(&[NotifyDescriptor::dispatch(&G1, callback).terminate()]).unwrap();
        db.install(&[PpiDescriptor::new(&G1, iface(&IFACE_A)).terminate()]).unwrap();
        assert!(db.take_pending(NotifyKind::Callback).is_empty());
        assert_eq!(pending_ppis(&db.take_pending(NotifyKind::Dispatch)), vec![iface(&IFACE_A)]);
        assert!(db.take_pending(NotifyKind::Dispatch).is_empty());
    }

    #[test]
    fn reinstall_should_keep_slot_and_report_callback_notifies() {
        let mut db = PpiDatabase::new(16);
        let first = [PpiDescriptor::new(&G1, iface(&IFACE_A)).terminate()];
        let other = [PpiDescriptor::new(&G1, iface(&IFACE_B)).terminate()];
        db.install(&first).unwrap();
        db.install(&other).unwrap();
        db.notify(&[NotifyDescriptor::callback(&G2, callback).terminate()]).unwrap();
        db.take_pending(NotifyKind::Callback);

        let replacement = PpiDescriptor::new(&G2, iface(&IFACE_B)).terminate();
        let pending = db.reinstall(&first[0], &replacement).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].guid, G2);

        assert_eq!(db.locate(&G2, 0).unwrap().descriptor, &replacement as *const PpiDescriptor);
        assert_eq!(db.locate(&G1, 0).unwrap().ppi, iface(&IFACE_B));
        assert_eq!(db.ppi_count(), 2);
        // The old identity is gone.
        assert_eq!(db.reinstall(&first[0], &replacement).err(), Some(EfiError::NotFound));
    }

    #[test]
    fn rebase_should_translate_interface_and_identity() {
        let mut db = PpiDatabase::new(4);
        let list = [PpiDescriptor::new(&G1, iface(&IFACE_A)).terminate()];
        db.install(&list).unwrap();
        let shift = |address: u64| if address == iface(&IFACE_A) as u64 { 0x1000 } else { address };
        unsafe { db.rebase(shift) };
        let located = db.locate(&G1, 0).unwrap();
        assert_eq!(located.ppi as u64, 0x1000);
        assert_eq!(located.descriptor, &list[0] as *const PpiDescriptor);
        // The descriptor stayed where it was and is not rewritten.
        assert_eq!(list[0].ppi, iface(&IFACE_A));
    }

    #[test]
    fn rebase_should_rewrite_moved_descriptor() {
        let mut db = PpiDatabase::new(4);
        let old = [PpiDescriptor::new(&G1, iface(&IFACE_A)).terminate()];
        db.install(&old).unwrap();
        let guid_copy = G1;
        let mut new = old;
        let (old_address, new_address) = (&old[0] as *const PpiDescriptor as u64, new.as_mut_ptr() as u64);
        let guid_address = &guid_copy as *const efi::Guid as u64;
        let translate = |address: u64| {
            if address == old_address {
                new_address
            } else if address == iface(&IFACE_A) as u64 {
                iface(&IFACE_B) as u64
            } else if address == &G1 as *const efi::Guid as u64 {
                guid_address
            } else {
                address
            }
        };
        unsafe { db.rebase(translate) };

        let located = db.locate(&G1, 0).unwrap();
        assert_eq!(located.descriptor as u64, new_address);
        assert_eq!(located.ppi, iface(&IFACE_B));
        let moved = unsafe { ptr::read_unaligned(located.descriptor) };
        assert_eq!(moved.ppi, located.ppi);
        assert_eq!(moved.guid as u64, guid_address);
        assert_eq!(moved.flags, old[0].flags);
        assert_eq!(old[0].ppi, iface(&IFACE_A));
    }
}
