//! Host → device command records.
//!
//! Layout of every command:
//!
//! ```text
//! 0   u32 size_bytes   (whole record, header included, multiple of MESSAGE_ALIGN)
//! 4   u16 kind         (CommandKind)
//! 6   u16 flags        (CommandFlags)
//! 8   u64 tag          (host event the response is correlated with)
//! 16  ... kind-specific body
//! ```

use crate::{
    align_up, read_u16, read_u32, read_u64, write_u16_at, write_u32_at, write_u64_at, DecodeError,
    MESSAGE_ALIGN,
};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandFlags: u16 {
        /// Device must finish every earlier command of the queue before starting this one.
        const BARRIER = 1 << 0;
        /// Source or destination is another device's memory.
        const PEER_TO_PEER = 1 << 1;
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Copy from host (pinned) memory into device DRAM.
    DmaWriteList = 0x0010,
    /// Copy from device DRAM into host (pinned) memory.
    DmaReadList = 0x0011,
    KernelLaunch = 0x0020,
    /// Abort the command whose tag is carried in the body.
    Abort = 0x0030,
}

impl CommandKind {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0010 => Some(Self::DmaWriteList),
            0x0011 => Some(Self::DmaReadList),
            0x0020 => Some(Self::KernelLaunch),
            0x0030 => Some(Self::Abort),
            _ => None,
        }
    }

    pub fn is_dma(self) -> bool {
        matches!(self, Self::DmaWriteList | Self::DmaReadList)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub size_bytes: u32,
    pub kind: CommandKind,
    pub flags: CommandFlags,
    pub tag: u64,
}

impl CommandHeader {
    pub const SIZE_BYTES: usize = 16;

    pub fn decode_from_le_bytes(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(DecodeError::Truncated {
                needed: Self::SIZE_BYTES,
                available: buf.len(),
            });
        }
        let raw_kind = read_u16(buf, 4);
        let kind = CommandKind::from_u16(raw_kind).ok_or(DecodeError::UnknownCommandKind(raw_kind))?;
        Ok(Self {
            size_bytes: read_u32(buf, 0),
            kind,
            flags: CommandFlags::from_bits_truncate(read_u16(buf, 6)),
            tag: read_u64(buf, 8),
        })
    }

    fn write_to(&self, buf: &mut [u8]) {
        write_u32_at(buf, 0, self.size_bytes);
        write_u16_at(buf, 4, self.kind as u16);
        write_u16_at(buf, 6, self.flags.bits());
        write_u64_at(buf, 8, self.tag);
    }
}

/// One contiguous copy of a DMA list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaNode {
    pub src: u64,
    pub dst: u64,
    pub size: u32,
}

impl DmaNode {
    pub const SIZE_BYTES: usize = 24;
}

/// Body prefix of a DMA list: `u32 node_count`, `u32 reserved`.
const DMA_LIST_PREFIX_BYTES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLaunch {
    /// Device address of the kernel entry point.
    pub code_address: u64,
    /// Device address of the execution-context buffer reserved for this launch.
    pub context_address: u64,
    /// Inline argument block, copied verbatim to the kernel.
    pub args: Vec<u8>,
}

/// Fixed part of a kernel-launch body: code, context, `u32 args_len`, `u32 reserved`.
const KERNEL_LAUNCH_FIXED_BYTES: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBody {
    DmaWriteList(Vec<DmaNode>),
    DmaReadList(Vec<DmaNode>),
    KernelLaunch(KernelLaunch),
    Abort { target_tag: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCommand {
    pub header: CommandHeader,
    pub body: CommandBody,
}

fn new_record(kind: CommandKind, flags: CommandFlags, tag: u64, body_len: usize) -> Vec<u8> {
    let size = align_up(CommandHeader::SIZE_BYTES + body_len, MESSAGE_ALIGN);
    assert!(size <= u32::MAX as usize, "command record too large for u32 size_bytes");
    let mut buf = vec![0u8; size];
    CommandHeader {
        size_bytes: size as u32,
        kind,
        flags,
        tag,
    }
    .write_to(&mut buf);
    buf
}

fn encode_dma_list(kind: CommandKind, tag: u64, flags: CommandFlags, nodes: &[DmaNode]) -> Vec<u8> {
    let body_len = DMA_LIST_PREFIX_BYTES + nodes.len() * DmaNode::SIZE_BYTES;
    let mut buf = new_record(kind, flags, tag, body_len);
    let base = CommandHeader::SIZE_BYTES;
    write_u32_at(&mut buf, base, nodes.len() as u32);
    for (i, node) in nodes.iter().enumerate() {
        let at = base + DMA_LIST_PREFIX_BYTES + i * DmaNode::SIZE_BYTES;
        write_u64_at(&mut buf, at, node.src);
        write_u64_at(&mut buf, at + 8, node.dst);
        write_u32_at(&mut buf, at + 16, node.size);
    }
    buf
}

/// Encode a host → device DMA list.
pub fn encode_dma_write_list(tag: u64, flags: CommandFlags, nodes: &[DmaNode]) -> Vec<u8> {
    encode_dma_list(CommandKind::DmaWriteList, tag, flags, nodes)
}

/// Encode a device → host DMA list.
pub fn encode_dma_read_list(tag: u64, flags: CommandFlags, nodes: &[DmaNode]) -> Vec<u8> {
    encode_dma_list(CommandKind::DmaReadList, tag, flags, nodes)
}

pub fn encode_kernel_launch(tag: u64, flags: CommandFlags, launch: &KernelLaunch) -> Vec<u8> {
    let body_len = KERNEL_LAUNCH_FIXED_BYTES + launch.args.len();
    let mut buf = new_record(CommandKind::KernelLaunch, flags, tag, body_len);
    let base = CommandHeader::SIZE_BYTES;
    write_u64_at(&mut buf, base, launch.code_address);
    write_u64_at(&mut buf, base + 8, launch.context_address);
    write_u32_at(&mut buf, base + 16, launch.args.len() as u32);
    let args_at = base + KERNEL_LAUNCH_FIXED_BYTES;
    buf[args_at..args_at + launch.args.len()].copy_from_slice(&launch.args);
    buf
}

pub fn encode_abort(tag: u64, target_tag: u64) -> Vec<u8> {
    let mut buf = new_record(CommandKind::Abort, CommandFlags::empty(), tag, 8);
    write_u64_at(&mut buf, CommandHeader::SIZE_BYTES, target_tag);
    buf
}

fn decode_dma_nodes(body: &[u8]) -> Result<Vec<DmaNode>, DecodeError> {
    if body.len() < DMA_LIST_PREFIX_BYTES {
        return Err(DecodeError::Truncated {
            needed: DMA_LIST_PREFIX_BYTES,
            available: body.len(),
        });
    }
    let declared = read_u32(body, 0);
    let nodes = &body[DMA_LIST_PREFIX_BYTES..];
    let available = nodes.len() / DmaNode::SIZE_BYTES;
    if declared as usize > available {
        return Err(DecodeError::BadNodeCount {
            declared,
            available,
        });
    }
    Ok(nodes
        .chunks_exact(DmaNode::SIZE_BYTES)
        .take(declared as usize)
        .map(|raw| DmaNode {
            src: read_u64(raw, 0),
            dst: read_u64(raw, 8),
            size: read_u32(raw, 16),
        })
        .collect())
}

/// Decode a full command record (header + body).
pub fn decode_command(buf: &[u8]) -> Result<DecodedCommand, DecodeError> {
    let header = CommandHeader::decode_from_le_bytes(buf)?;
    let size = header.size_bytes as usize;
    if size != buf.len() || size < CommandHeader::SIZE_BYTES {
        return Err(DecodeError::BadSize {
            size_bytes: size,
            buffer_len: buf.len(),
        });
    }
    let body = &buf[CommandHeader::SIZE_BYTES..];

    let body = match header.kind {
        CommandKind::DmaWriteList => CommandBody::DmaWriteList(decode_dma_nodes(body)?),
        CommandKind::DmaReadList => CommandBody::DmaReadList(decode_dma_nodes(body)?),
        CommandKind::KernelLaunch => {
            if body.len() < KERNEL_LAUNCH_FIXED_BYTES {
                return Err(DecodeError::Truncated {
                    needed: KERNEL_LAUNCH_FIXED_BYTES,
                    available: body.len(),
                });
            }
            let args_len = read_u32(body, 16) as usize;
            let args = &body[KERNEL_LAUNCH_FIXED_BYTES..];
            if args.len() < args_len {
                return Err(DecodeError::Truncated {
                    needed: KERNEL_LAUNCH_FIXED_BYTES + args_len,
                    available: body.len(),
                });
            }
            CommandBody::KernelLaunch(KernelLaunch {
                code_address: read_u64(body, 0),
                context_address: read_u64(body, 8),
                args: args[..args_len].to_vec(),
            })
        }
        CommandKind::Abort => {
            if body.len() < 8 {
                return Err(DecodeError::Truncated {
                    needed: 8,
                    available: body.len(),
                });
            }
            CommandBody::Abort {
                target_tag: read_u64(body, 0),
            }
        }
    };

    Ok(DecodedCommand { header, body })
}
