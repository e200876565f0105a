//! Platform Initialization (PI) definitions used by the PEI phase.
//!
//! Layouts in these modules are `repr(C)` mirrors of the structures defined in the UEFI Platform Initialization
//! Specification, Volume 1 (PEI) and Volume 3 (Shared Architectural Elements).
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
pub mod boot_mode;
pub mod fw_fs;
pub mod hob;
pub mod ppi;
pub mod status_code;
