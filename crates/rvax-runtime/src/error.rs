use thiserror::Error;

use crate::allocator::AllocError;
use crate::channel::ChannelError;
use crate::config::ConfigError;
use crate::event_ledger::LedgerError;
use crate::streams::StreamRegistryError;
use crate::transfer::TransferError;
use crate::transport::TransportError;
use crate::types::{DeviceId, EventId};

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Synchronous failures of runtime calls.
///
/// Device-reported failures never show up here: they arrive asynchronously and are attached to
/// the owning stream as [`StreamError`](crate::streams::StreamError)s.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Stream(#[from] StreamRegistryError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("staging pool unavailable on {0}: pinned allocation keeps failing")]
    StagingUnavailable(DeviceId),

    #[error("failed to spawn runtime thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("no free kernel execution context on {0}")]
    NoExecutionContext(DeviceId),

    #[error("event {0} does not belong to any stream")]
    EventWithoutStream(EventId),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}
