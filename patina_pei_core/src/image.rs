//! PEIM Image Loading
//!
//! The dispatcher asks an [`ImageLoader`] for the entry point of each PEIM it decided to run.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use patina_pei::{
    error::{EfiError, Result},
    services::PeimEntryPoint,
};
use patina_pei_ffs::{FfsFile, FirmwareVolume};
use r_efi::efi;

/// Resolves the entry point of a PEIM file.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait ImageLoader {
    /// Returns the entry point of `file`, found in `volume`.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::NotFound`] if the file holds no loadable image, or [`EfiError::LoadError`] if the image
    /// cannot be prepared for execution.
    fn load_peim(&self, volume: &FirmwareVolume, file: &FfsFile) -> Result<PeimEntryPoint>;
}

/// An [`ImageLoader`] over PEIMs linked into the firmware image, keyed by file name.
#[derive(Default, Clone)]
pub struct StaticImageLoader {
    peims: Vec<(efi::Guid, PeimEntryPoint)>,
}

impl StaticImageLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the entry point run for the file named `name`.
    pub fn with_peim(mut self, name: efi::Guid, entry_point: PeimEntryPoint) -> Self {
        self.peims.push((name, entry_point));
        self
    }
}

impl ImageLoader for StaticImageLoader {
    fn load_peim(&self, _volume: &FirmwareVolume, file: &FfsFile) -> Result<PeimEntryPoint> {
        self.peims
            .iter()
            .find(|(name, _)| *name == file.name)
            .map(|(_, entry_point)| *entry_point)
            .ok_or(EfiError::NotFound)
    }
}
