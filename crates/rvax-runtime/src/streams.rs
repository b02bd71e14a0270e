//! Stream bookkeeping: live events, queue assignment and buffered device errors.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rvax_protocol::{DeviceErrorCode, ResponseKind};
use thiserror::Error;
use tracing::{debug, warn};

use crate::event_ledger::EventLedger;
use crate::types::{DeviceId, EventId, QueueId, StreamId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamRegistryError {
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("{stream} still has {live_events} live events and {errors} undrained errors")]
    StreamNotDrained {
        stream: StreamId,
        live_events: usize,
        errors: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamErrorCode {
    /// Status reported by the device in a response.
    Device(DeviceErrorCode),
    /// The host could not submit part of the work (transport failure, staging fault, ...).
    SubmissionFailed(String),
}

impl fmt::Display for StreamErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(code) => write!(f, "device error {code}"),
            Self::SubmissionFailed(reason) => write!(f, "submission failed: {reason}"),
        }
    }
}

/// An asynchronous failure attached to the stream that owned the failing event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub event: EventId,
    pub stream: StreamId,
    pub device: DeviceId,
    pub code: StreamErrorCode,
    pub response_kind: Option<ResponseKind>,
    pub core_dump: Option<PathBuf>,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} ({}): {}", self.event, self.stream, self.device, self.code)
    }
}

pub type StreamErrorCallback = Arc<dyn Fn(&StreamError) + Send + Sync>;

struct Stream {
    device: DeviceId,
    queue: QueueId,
    live: HashSet<EventId>,
    errors: Vec<StreamError>,
    callback: Option<StreamErrorCallback>,
}

struct State {
    next_stream: u32,
    streams: HashMap<StreamId, Stream>,
    event_streams: HashMap<EventId, StreamId>,
    /// device -> (queue count, next queue to hand out)
    queues: HashMap<DeviceId, (u16, u16)>,
}

pub struct StreamRegistry {
    state: Mutex<State>,
}

impl StreamRegistry {
    /// `devices` lists every device with its submission queue count.
    pub fn new<I>(devices: I) -> Self
    where
        I: IntoIterator<Item = (DeviceId, u16)>,
    {
        let queues = devices
            .into_iter()
            .map(|(device, count)| (device, (count.max(1), 0)))
            .collect();
        Self {
            state: Mutex::new(State {
                next_stream: 0,
                streams: HashMap::new(),
                event_streams: HashMap::new(),
                queues,
            }),
        }
    }

    /// New stream on `device`, bound to the next queue in round-robin order.
    pub fn create_stream(&self, device: DeviceId) -> Result<StreamId, StreamRegistryError> {
        let mut st = self.state.lock();
        let (count, next) = st
            .queues
            .get_mut(&device)
            .ok_or(StreamRegistryError::UnknownDevice(device))?;
        let queue = QueueId(*next);
        *next = (*next + 1) % *count;

        let id = StreamId(st.next_stream);
        st.next_stream += 1;
        st.streams.insert(
            id,
            Stream {
                device,
                queue,
                live: HashSet::new(),
                errors: Vec::new(),
                callback: None,
            },
        );
        debug!(stream = %id, %device, queue = queue.0, "stream created");
        Ok(id)
    }

    /// Remove a stream. It must have no live events and no undrained errors.
    pub fn destroy_stream(&self, stream: StreamId) -> Result<(), StreamRegistryError> {
        let mut st = self.state.lock();
        let info = st
            .streams
            .get(&stream)
            .ok_or(StreamRegistryError::UnknownStream(stream))?;
        if !info.live.is_empty() || !info.errors.is_empty() {
            return Err(StreamRegistryError::StreamNotDrained {
                stream,
                live_events: info.live.len(),
                errors: info.errors.len(),
            });
        }
        st.streams.remove(&stream);
        debug!(%stream, "stream destroyed");
        Ok(())
    }

    pub fn stream_location(&self, stream: StreamId) -> Result<(DeviceId, QueueId), StreamRegistryError> {
        self.state
            .lock()
            .streams
            .get(&stream)
            .map(|s| (s.device, s.queue))
            .ok_or(StreamRegistryError::UnknownStream(stream))
    }

    pub fn add_event(&self, stream: StreamId, event: EventId) -> Result<(), StreamRegistryError> {
        let mut st = self.state.lock();
        st.streams
            .get_mut(&stream)
            .ok_or(StreamRegistryError::UnknownStream(stream))?
            .live
            .insert(event);
        st.event_streams.insert(event, stream);
        Ok(())
    }

    /// Forget `event`. Returns the stream it belonged to.
    pub fn remove_event(&self, event: EventId) -> Option<StreamId> {
        let mut st = self.state.lock();
        let stream = st.event_streams.remove(&event)?;
        if let Some(info) = st.streams.get_mut(&stream) {
            info.live.remove(&event);
        }
        Some(stream)
    }

    pub fn live_events(&self, stream: StreamId) -> Result<Vec<EventId>, StreamRegistryError> {
        let st = self.state.lock();
        let info = st
            .streams
            .get(&stream)
            .ok_or(StreamRegistryError::UnknownStream(stream))?;
        let mut events: Vec<EventId> = info.live.iter().copied().collect();
        events.sort();
        Ok(events)
    }

    pub fn stream_of(&self, event: EventId) -> Option<StreamId> {
        self.state.lock().event_streams.get(&event).copied()
    }

    /// Buffer `error` on its stream until [`StreamRegistry::retrieve_errors`].
    pub fn add_error(&self, error: StreamError) {
        let mut st = self.state.lock();
        match st.streams.get_mut(&error.stream) {
            Some(info) => info.errors.push(error),
            None => warn!(stream = %error.stream, event = %error.event, "dropping error for a destroyed stream: {}", error.code),
        }
    }

    /// Drain the buffered errors of `stream`.
    pub fn retrieve_errors(&self, stream: StreamId) -> Result<Vec<StreamError>, StreamRegistryError> {
        let mut st = self.state.lock();
        let info = st
            .streams
            .get_mut(&stream)
            .ok_or(StreamRegistryError::UnknownStream(stream))?;
        Ok(std::mem::take(&mut info.errors))
    }

    pub fn set_error_callback(
        &self,
        stream: StreamId,
        callback: Option<StreamErrorCallback>,
    ) -> Result<(), StreamRegistryError> {
        let mut st = self.state.lock();
        st.streams
            .get_mut(&stream)
            .ok_or(StreamRegistryError::UnknownStream(stream))?
            .callback = callback;
        Ok(())
    }

    /// Deliver `error` through its stream's callback, then run `after`.
    ///
    /// Returns `false` without running anything when the stream has no callback, so the caller
    /// can fall back to [`StreamRegistry::add_error`].
    pub fn execute_callback<F>(&self, event: EventId, error: &StreamError, after: F) -> bool
    where
        F: FnOnce(),
    {
        let callback = {
            let st = self.state.lock();
            let stream = st.event_streams.get(&event).copied().unwrap_or(error.stream);
            st.streams.get(&stream).and_then(|s| s.callback.clone())
        };
        match callback {
            Some(callback) => {
                callback(error);
                after();
                true
            }
            None => false,
        }
    }

    pub fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }
}

impl fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("StreamRegistry")
            .field("streams", &st.streams.len())
            .field("tracked_events", &st.event_streams.len())
            .finish()
    }
}

/// Hand `error` to its stream (callback first, buffer otherwise), then retire its event.
pub(crate) fn deliver_error(ledger: &EventLedger, streams: &StreamRegistry, error: StreamError) {
    let event = error.event;
    if !streams.execute_callback(event, &error, || retire(ledger, streams, event)) {
        streams.add_error(error);
        retire(ledger, streams, event);
    }
}

/// Forget `event` in the registry and dispatch it.
pub(crate) fn retire(ledger: &EventLedger, streams: &StreamRegistry, event: EventId) {
    streams.remove_event(event);
    if let Err(err) = ledger.dispatch(event) {
        warn!(%event, "retiring event failed: {err}");
    }
}
