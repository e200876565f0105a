//! PEI Core Configuration
//!
//! Capacities of the fixed-size structures the core keeps while running from temporary RAM.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use patina_internal_pei_depex::DEPEX_STACK_DEPTH;
use patina_pei::error::{EfiError, Result};

/// Width of the per volume dispatched bitmap.
pub const DISPATCHED_BITMAP_WIDTH: usize = u32::BITS as usize;

/// Capacities and sizes used by the PEI Core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeiCoreConfig {
    /// Slots shared by installed PPIs and registered notifies.
    pub max_ppi_slots: usize,
    /// Number of firmware volumes the dispatcher tracks.
    pub max_firmware_volumes: usize,
    /// PEIMs a single firmware volume may hold. At most [`DISPATCHED_BITMAP_WIDTH`].
    pub max_peims_per_volume: usize,
    /// Depth of the dependency expression evaluation stack.
    pub max_depex_stack_depth: usize,
    /// Bytes of permanent memory reserved for the stack after migration. Zero keeps the SEC stack size.
    pub permanent_stack_size: u64,
}

impl Default for PeiCoreConfig {
    fn default() -> Self {
        Self {
            max_ppi_slots: 64,
            max_firmware_volumes: 16,
            max_peims_per_volume: DISPATCHED_BITMAP_WIDTH,
            max_depex_stack_depth: DEPEX_STACK_DEPTH,
            permanent_stack_size: 0,
        }
    }
}

impl PeiCoreConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_ppi_slots == 0
            || self.max_firmware_volumes == 0
            || self.max_peims_per_volume == 0
            || self.max_peims_per_volume > DISPATCHED_BITMAP_WIDTH
            || self.max_depex_stack_depth == 0
        {
            log::error!("Invalid PEI Core configuration: {:?}", self);
            return Err(EfiError::InvalidParameter);
        }
        Ok(())
    }
}
