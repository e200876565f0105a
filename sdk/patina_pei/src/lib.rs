//! PEI Software Development Kit
//!
//! Common definitions used by the PEI Core and by PEI Modules (PEIMs): the UEFI error type, the PI binary layouts
//! that cross the module boundary, and the [`services::PeiServices`] trait every PEIM entry point receives.
//!
//! ## Features
//!
//! - `mockall`: exposes `MockPeiServices` so PEIMs can be unit tested without a running core.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(test), not(feature = "mockall")), no_std)]

pub mod base;
pub mod error;
pub mod pi;
pub mod services;

pub use base::guid::GuidFmt;
