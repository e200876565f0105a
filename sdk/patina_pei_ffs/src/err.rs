//! Error types for the Firmware File System crate.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// Error definitions for Firmware File System
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareFileSystemError {
    /// The FV or FFS header is invalid or malformed.
    InvalidHeader,
    /// The block map structure is invalid.
    InvalidBlockMap,
    /// A parameter provided to a function is invalid.
    InvalidParameter,
    /// The file system GUID or revision is not supported.
    Unsupported,
    /// The file is in an invalid or unexpected state.
    InvalidState,
    /// Data corruption was detected.
    DataCorrupt,
    /// The requested file or section does not exist.
    NotFound,
}
