//! Device status codes carried in [`ResponseHeader::status`](crate::ResponseHeader).
//!
//! The mapping between raw status words, [`DeviceErrorCode`] and their stable names lives in a
//! single `const` table so every lookup direction agrees.

use std::fmt;
use std::str::FromStr;

pub const STATUS_SUCCESS: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorCode {
    DmaTimeout,
    DmaInvalidAddress,
    DmaInvalidSize,
    DmaUnknownError,
    KernelException,
    KernelTimeout,
    KernelError,
    KernelInvalidArguments,
    KernelUnknownError,
    /// The command was retired early because the host asked to abort it.
    Aborted,
    /// The abort request itself could not be honored (e.g. target already retired).
    AbortFailed,
    InvalidCommand,
    /// A status word that is not in the table.
    Unknown,
}

const STATUS_TABLE: [(u32, DeviceErrorCode, &str); 12] = [
    (0x0100, DeviceErrorCode::DmaTimeout, "dma_timeout"),
    (0x0101, DeviceErrorCode::DmaInvalidAddress, "dma_invalid_address"),
    (0x0102, DeviceErrorCode::DmaInvalidSize, "dma_invalid_size"),
    (0x01FF, DeviceErrorCode::DmaUnknownError, "dma_unknown_error"),
    (0x0200, DeviceErrorCode::KernelException, "kernel_exception"),
    (0x0201, DeviceErrorCode::KernelTimeout, "kernel_timeout"),
    (0x0202, DeviceErrorCode::KernelError, "kernel_error"),
    (0x0203, DeviceErrorCode::KernelInvalidArguments, "kernel_invalid_arguments"),
    (0x02FF, DeviceErrorCode::KernelUnknownError, "kernel_unknown_error"),
    (0x0300, DeviceErrorCode::Aborted, "aborted"),
    (0x0301, DeviceErrorCode::AbortFailed, "abort_failed"),
    (0x0400, DeviceErrorCode::InvalidCommand, "invalid_command"),
];

const UNKNOWN_NAME: &str = "unknown";

impl DeviceErrorCode {
    /// Map a non-success status word to an error code. Returns `None` for [`STATUS_SUCCESS`].
    pub fn from_status(status: u32) -> Option<Self> {
        if status == STATUS_SUCCESS {
            return None;
        }
        Some(
            STATUS_TABLE
                .iter()
                .find(|(raw, _, _)| *raw == status)
                .map(|(_, code, _)| *code)
                .unwrap_or(Self::Unknown),
        )
    }

    /// Canonical status word for this code (`None` for [`DeviceErrorCode::Unknown`]).
    pub fn status(self) -> Option<u32> {
        STATUS_TABLE
            .iter()
            .find(|(_, code, _)| *code == self)
            .map(|(raw, _, _)| *raw)
    }

    pub fn as_str(self) -> &'static str {
        STATUS_TABLE
            .iter()
            .find(|(_, code, _)| *code == self)
            .map(|(_, _, name)| *name)
            .unwrap_or(UNKNOWN_NAME)
    }

    /// Kernel-side faults for which a device core dump is worth collecting.
    pub fn is_kernel_fault(self) -> bool {
        matches!(
            self,
            Self::KernelException | Self::KernelTimeout | Self::KernelUnknownError
        )
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown device error code name {0:?}")]
pub struct UnknownErrorCodeName(pub String);

impl FromStr for DeviceErrorCode {
    type Err = UnknownErrorCodeName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == UNKNOWN_NAME {
            return Ok(Self::Unknown);
        }
        STATUS_TABLE
            .iter()
            .find(|(_, _, name)| *name == s)
            .map(|(_, code, _)| *code)
            .ok_or_else(|| UnknownErrorCodeName(s.to_string()))
    }
}
