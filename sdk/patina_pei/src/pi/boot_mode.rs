//! Boot Mode definitions (PI Spec Volume 1, 4.3).
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::error::EfiError;

/// The boot path the platform is taking, recorded in the PHIT HOB.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootMode {
    /// Basic S0 boot path.
    #[default]
    FullConfiguration = 0x00,
    MinimalConfiguration = 0x01,
    AssumingNoConfigurationChanges = 0x02,
    FullConfigurationPlusDiagnostics = 0x03,
    WithDefaultSettings = 0x04,
    OnS4Resume = 0x05,
    OnS5Resume = 0x06,
    WithMfgModeSettings = 0x07,
    OnS2Resume = 0x10,
    OnS3Resume = 0x11,
    OnFlashUpdate = 0x12,
    InRecoveryMode = 0x20,
}

impl TryFrom<u32> for BootMode {
    type Error = EfiError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => BootMode::FullConfiguration,
            0x01 => BootMode::MinimalConfiguration,
            0x02 => BootMode::AssumingNoConfigurationChanges,
            0x03 => BootMode::FullConfigurationPlusDiagnostics,
            0x04 => BootMode::WithDefaultSettings,
            0x05 => BootMode::OnS4Resume,
            0x06 => BootMode::OnS5Resume,
            0x07 => BootMode::WithMfgModeSettings,
            0x10 => BootMode::OnS2Resume,
            0x11 => BootMode::OnS3Resume,
            0x12 => BootMode::OnFlashUpdate,
            0x20 => BootMode::InRecoveryMode,
            _ => return Err(EfiError::InvalidParameter),
        })
    }
}

impl From<BootMode> for u32 {
    fn from(value: BootMode) -> Self {
        value as u32
    }
}
