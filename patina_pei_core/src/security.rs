//! PEI Security Callout
//!
//! Volumes and files are offered to a [`SecurityPolicy`] before the dispatcher trusts them. A veto makes the volume
//! or file inert for the rest of the boot; it never stops dispatch of anything else.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use patina_pei::error::Result;
use patina_pei_ffs::{FfsFile, FirmwareVolume};

/// Decides whether firmware volumes and PEIMs may be used.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait SecurityPolicy {
    /// Returns [`EfiError::SecurityViolation`](patina_pei::error::EfiError::SecurityViolation) to exclude the volume.
    fn verify_firmware_volume(&self, volume: &FirmwareVolume) -> Result<()>;

    /// Returns [`EfiError::SecurityViolation`](patina_pei::error::EfiError::SecurityViolation) to exclude the file.
    fn verify_file(&self, volume: &FirmwareVolume, file: &FfsFile) -> Result<()>;
}

/// Accepts everything. Used until a platform installs its own policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustAll;

impl SecurityPolicy for TrustAll {
    fn verify_firmware_volume(&self, _volume: &FirmwareVolume) -> Result<()> {
        Ok(())
    }

    fn verify_file(&self, _volume: &FirmwareVolume, _file: &FfsFile) -> Result<()> {
        Ok(())
    }
}
