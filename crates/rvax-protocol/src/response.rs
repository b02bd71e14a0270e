//! Device → host completion records.
//!
//! ```text
//! 0   u32 size_bytes
//! 4   u16 kind      (ResponseKind)
//! 6   u16 reserved
//! 8   u64 tag       (copied from the command being completed)
//! 16  u32 status    (STATUS_SUCCESS or a device error status, see `status`)
//! 20  u32 reserved
//! ```

use crate::command::CommandKind;
use crate::status::STATUS_SUCCESS;
use crate::{read_u16, read_u32, read_u64, write_u16_at, write_u32_at, write_u64_at, DecodeError};

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    DmaWriteComplete = 0x0110,
    DmaReadComplete = 0x0111,
    KernelLaunchComplete = 0x0120,
    AbortComplete = 0x0130,
}

impl ResponseKind {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0110 => Some(Self::DmaWriteComplete),
            0x0111 => Some(Self::DmaReadComplete),
            0x0120 => Some(Self::KernelLaunchComplete),
            0x0130 => Some(Self::AbortComplete),
            _ => None,
        }
    }

    /// The response a device emits when it retires a command of `kind`.
    pub fn completing(kind: CommandKind) -> Self {
        match kind {
            CommandKind::DmaWriteList => Self::DmaWriteComplete,
            CommandKind::DmaReadList => Self::DmaReadComplete,
            CommandKind::KernelLaunch => Self::KernelLaunchComplete,
            CommandKind::Abort => Self::AbortComplete,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DmaWriteComplete => "dma_write_complete",
            Self::DmaReadComplete => "dma_read_complete",
            Self::KernelLaunchComplete => "kernel_launch_complete",
            Self::AbortComplete => "abort_complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub size_bytes: u32,
    pub kind: ResponseKind,
    pub tag: u64,
    pub status: u32,
}

impl ResponseHeader {
    pub const SIZE_BYTES: usize = 24;

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(DecodeError::Truncated {
                needed: Self::SIZE_BYTES,
                available: buf.len(),
            });
        }
        let raw_kind = read_u16(buf, 4);
        let kind =
            ResponseKind::from_u16(raw_kind).ok_or(DecodeError::UnknownResponseKind(raw_kind))?;
        Ok(Self {
            size_bytes: read_u32(buf, 0),
            kind,
            tag: read_u64(buf, 8),
            status: read_u32(buf, 16),
        })
    }
}

/// Decode a response record. Trailing kind-specific payload (if any) is ignored.
pub fn decode_response(buf: &[u8]) -> Result<ResponseHeader, DecodeError> {
    let header = ResponseHeader::decode_from_le_bytes(buf)?;
    let size = header.size_bytes as usize;
    if size < ResponseHeader::SIZE_BYTES || size > buf.len() {
        return Err(DecodeError::BadSize {
            size_bytes: size,
            buffer_len: buf.len(),
        });
    }
    Ok(header)
}

pub fn encode_response(kind: ResponseKind, tag: u64, status: u32) -> Vec<u8> {
    let mut buf = vec![0u8; ResponseHeader::SIZE_BYTES];
    write_u32_at(&mut buf, 0, ResponseHeader::SIZE_BYTES as u32);
    write_u16_at(&mut buf, 4, kind as u16);
    write_u64_at(&mut buf, 8, tag);
    write_u32_at(&mut buf, 16, status);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_roundtrip_keeps_status() {
        let buf = encode_response(ResponseKind::KernelLaunchComplete, 0xDEAD_BEEF, 0x201);
        let hdr = decode_response(&buf).unwrap();
        assert_eq!(hdr.kind, ResponseKind::KernelLaunchComplete);
        assert_eq!(hdr.tag, 0xDEAD_BEEF);
        assert_eq!(hdr.status, 0x201);
        assert!(!hdr.is_success());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = encode_response(ResponseKind::AbortComplete, 1, 0);
        write_u16_at(&mut buf, 4, 0x7777);
        assert_eq!(
            decode_response(&buf),
            Err(DecodeError::UnknownResponseKind(0x7777))
        );
    }

    #[test]
    fn size_larger_than_buffer_is_rejected() {
        let mut buf = encode_response(ResponseKind::DmaReadComplete, 1, 0);
        write_u32_at(&mut buf, 0, 64);
        assert!(matches!(
            decode_response(&buf),
            Err(DecodeError::BadSize { size_bytes: 64, .. })
        ));
    }
}
