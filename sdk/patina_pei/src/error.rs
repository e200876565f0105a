//! Module for converting UEFI errors to rusty errors.
//!
//! Only the subset of the UEFI status taxonomy that the PEI phase produces has a named variant; every other status
//! is carried through as [`EfiError::Unknown`].
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// A specialized [`Result`](core::result::Result) type for PEI operations.
pub type Result<T> = core::result::Result<T, EfiError>;

use r_efi::efi;

/// EDK II Error Code equivalent as a Rust Error enum
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EfiError {
    /// The image failed to load.
    LoadError,
    /// The parameter was incorrect.
    InvalidParameter,
    /// The operation is not supported.
    Unsupported,
    /// The buffer was not large enough to hold the requested data.
    BufferTooSmall,
    /// There is no data pending upon return.
    NotReady,
    /// The physical device reported an error while attempting the operation.
    DeviceError,
    /// The resource has run out.
    OutOfResources,
    /// An inconsistency was detected on the file system causing the operation to fail.
    VolumeCorrupted,
    /// The item was not found.
    NotFound,
    /// Access was denied.
    AccessDenied,
    /// The protocol has already been started.
    AlreadyStarted,
    /// The operation was aborted.
    Aborted,
    /// The function was not performed due to a security violation.
    SecurityViolation,
    /// An unknown EFI status code was encountered.
    Unknown(efi::Status),
}

impl EfiError {
    /// Converts an `r_efi::efi::Status` to a `Result`.
    ///
    /// If the status is `SUCCESS`, it returns `Ok(())`. Otherwise, it returns an `Err` with the corresponding
    /// `EfiError`. Warnings are not errors and also map to `Ok(())`.
    pub fn status_to_result(status: efi::Status) -> Result<()> {
        if !status.is_error() {
            return Ok(());
        }
        Err(match status {
            efi::Status::LOAD_ERROR => EfiError::LoadError,
            efi::Status::INVALID_PARAMETER => EfiError::InvalidParameter,
            efi::Status::UNSUPPORTED => EfiError::Unsupported,
            efi::Status::BUFFER_TOO_SMALL => EfiError::BufferTooSmall,
            efi::Status::NOT_READY => EfiError::NotReady,
            efi::Status::DEVICE_ERROR => EfiError::DeviceError,
            efi::Status::OUT_OF_RESOURCES => EfiError::OutOfResources,
            efi::Status::VOLUME_CORRUPTED => EfiError::VolumeCorrupted,
            efi::Status::NOT_FOUND => EfiError::NotFound,
            efi::Status::ACCESS_DENIED => EfiError::AccessDenied,
            efi::Status::ALREADY_STARTED => EfiError::AlreadyStarted,
            efi::Status::ABORTED => EfiError::Aborted,
            efi::Status::SECURITY_VIOLATION => EfiError::SecurityViolation,
            _ => EfiError::Unknown(status),
        })
    }
}

impl From<EfiError> for efi::Status {
    fn from(e: EfiError) -> efi::Status {
        match e {
            EfiError::LoadError => efi::Status::LOAD_ERROR,
            EfiError::InvalidParameter => efi::Status::INVALID_PARAMETER,
            EfiError::Unsupported => efi::Status::UNSUPPORTED,
            EfiError::BufferTooSmall => efi::Status::BUFFER_TOO_SMALL,
            EfiError::NotReady => efi::Status::NOT_READY,
            EfiError::DeviceError => efi::Status::DEVICE_ERROR,
            EfiError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
            EfiError::VolumeCorrupted => efi::Status::VOLUME_CORRUPTED,
            EfiError::NotFound => efi::Status::NOT_FOUND,
            EfiError::AccessDenied => efi::Status::ACCESS_DENIED,
            EfiError::AlreadyStarted => efi::Status::ALREADY_STARTED,
            EfiError::Aborted => efi::Status::ABORTED,
            EfiError::SecurityViolation => efi::Status::SECURITY_VIOLATION,
            EfiError::Unknown(status) => status,
        }
    }
}

impl From<efi::Status> for EfiError {
    /// Converts an error status into an `EfiError`. A non-error status has no error equivalent and maps to
    /// [`EfiError::Unknown`].
    fn from(status: efi::Status) -> Self {
        match EfiError::status_to_result(status) {
            Err(err) => err,
            Ok(()) => EfiError::Unknown(status),
        }
    }
}
