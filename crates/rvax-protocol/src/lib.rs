//! Host ↔ device message contract for the rvax accelerator command queues.
//!
//! Only the structural parts the host pipeline depends on are described here:
//! - the fixed command header (size, kind, flags, tag) and the bodies of DMA list,
//!   kernel launch and abort commands (see [`command`]),
//! - the fixed response header (size, kind, status, tag) (see [`response`]),
//! - the device status code table (see [`status`]).
//!
//! All multi-byte fields are little-endian. Every message is padded to a multiple of
//! [`MESSAGE_ALIGN`] bytes.
#![forbid(unsafe_code)]

pub mod command;
pub mod response;
pub mod status;

pub use command::{
    decode_command, encode_abort, encode_dma_read_list, encode_dma_write_list,
    encode_kernel_launch, CommandBody, CommandFlags, CommandHeader, CommandKind, DecodedCommand,
    DmaNode, KernelLaunch,
};
pub use response::{decode_response, encode_response, ResponseHeader, ResponseKind};
pub use status::{DeviceErrorCode, UnknownErrorCodeName, STATUS_SUCCESS};

/// Alignment (in bytes) of every command and response record.
pub const MESSAGE_ALIGN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("message truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("message size_bytes={size_bytes} does not match buffer length {buffer_len}")]
    BadSize { size_bytes: usize, buffer_len: usize },
    #[error("unknown command kind 0x{0:04x}")]
    UnknownCommandKind(u16),
    #[error("unknown response kind 0x{0:04x}")]
    UnknownResponseKind(u16),
    #[error("DMA list declares {declared} nodes but body holds {available}")]
    BadNodeCount { declared: u32, available: usize },
}

pub(crate) fn align_up(v: usize, a: usize) -> usize {
    debug_assert!(a.is_power_of_two());
    (v + (a - 1)) & !(a - 1)
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut tmp = [0u8; 4];
    tmp.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(tmp)
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut tmp = [0u8; 8];
    tmp.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(tmp)
}

pub(crate) fn write_u16_at(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u32_at(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u64_at(buf: &mut [u8], offset: usize, v: u64) {
    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}
