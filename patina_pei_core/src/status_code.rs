//! Status Code Reporting
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use patina_pei::{
    error::Result,
    guid_fmt,
    pi::status_code::{EfiStatusCodeType, EfiStatusCodeValue, EFI_ERROR_CODE, EFI_STATUS_CODE_TYPE_MASK},
};
use r_efi::efi;

const PEI_CORE_CALLER_ID: uuid::Uuid = uuid::Uuid::from_u128(0x52c05b14_0b98_496c_bc3b_04b50211d680);

/// Caller id the core reports its own status codes with.
pub fn pei_core_caller_id() -> efi::Guid {
    efi::Guid::from_bytes(&PEI_CORE_CALLER_ID.to_bytes_le())
}

/// Sink for status codes reported by the core and by PEIMs.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait StatusCodeReporter {
    fn report(
        &self,
        code_type: EfiStatusCodeType,
        value: EfiStatusCodeValue,
        instance: u32,
        caller_id: Option<efi::Guid>,
        data: &[u8],
    ) -> Result<()>;
}

/// Writes status codes to the log. Error codes are logged at error level, everything else at info.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusCodeReporter;

impl StatusCodeReporter for LogStatusCodeReporter {
    fn report(
        &self,
        code_type: EfiStatusCodeType,
        value: EfiStatusCodeValue,
        instance: u32,
        caller_id: Option<efi::Guid>,
        data: &[u8],
    ) -> Result<()> {
        let level =
            if code_type & EFI_STATUS_CODE_TYPE_MASK == EFI_ERROR_CODE { log::Level::Error } else { log::Level::Info };
        match caller_id {
            Some(caller_id) => log::log!(
                level,
                "Status code {:#010x} value {:#010x} instance {} caller {:?} ({} bytes of data)",
                code_type,
                value,
                instance,
                guid_fmt!(caller_id),
                data.len()
            ),
            None => log::log!(
                level,
                "Status code {:#010x} value {:#010x} instance {} ({} bytes of data)",
                code_type,
                value,
                instance,
                data.len()
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_id_should_match_registry_format() {
        let expected =
            efi::Guid::from_fields(0x52c05b14, 0x0b98, 0x496c, 0xbc, 0x3b, &[0x04, 0xb5, 0x02, 0x11, 0xd6, 0x80]);
        assert_eq!(pei_core_caller_id(), expected);
    }
}
