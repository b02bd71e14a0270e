//! Host-side command/DMA pipeline for the rvax accelerator.
//!
//! User calls (allocate, copy, launch, wait) become command-queue traffic through
//! [`Runtime`]; device responses come back through one [`dispatcher::ResponseDispatcher`] per
//! device and complete [`EventId`]s in the [`event_ledger::EventLedger`]. Host ↔ device copies
//! are chunked through a pinned [`staging::StagingPool`] by the [`transfer`] state machines.
//!
//! The physical transport is abstracted by [`transport::DeviceTransport`]; an in-process
//! implementation lives in [`transport::loopback`].
#![forbid(unsafe_code)]

pub mod allocator;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event_ledger;
pub mod exec_context;
pub mod observability;
pub mod runtime;
pub mod staging;
pub mod streams;
pub mod thread_pool;
pub mod transfer;
pub mod transport;
pub mod types;

pub use config::{ConfigError, RuntimeConfig};
pub use dispatcher::CoreDumpCollector;
pub use error::{Result, RuntimeError};
pub use observability::{ObservationKind, Observer, RuntimeStatsSnapshot};
pub use runtime::{Runtime, RuntimeBuilder};
pub use streams::{StreamError, StreamErrorCallback, StreamErrorCode};
pub use transfer::{DeviceToHostOp, HostToDeviceOp};
pub use types::{DeviceId, DevicePtr, EventId, HostBuffer, QueueId, StreamId};
