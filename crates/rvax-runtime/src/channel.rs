//! Per (device, queue) command FIFO with a dedicated submission worker.
//!
//! Commands keep their queue position from [`CommandChannel::send`] until the transport
//! accepts them, and are handed over strictly in queue order. A disabled entry that belongs to a
//! stream, or a placeholder reserved with [`Command::ghost`], holds everything behind it until it
//! is enabled or cancelled. Disabled entries without a stream only hold themselves.
//! [`CommandChannel::send_before`] inserts ahead of an existing entry, which is how a transfer
//! slots its batches in front of the placeholder that reserved its position.
//!
//! Aborts bypass the FIFO through [`CommandChannel::send_urgent`]: they must reach the device
//! even when the queue is held by a placeholder whose transfer waits on the aborted work.
//!
//! A full submission queue is not an error: the worker waits for a readiness event (bounded by
//! the configured poll interval) and retries the same command. Nothing behind it is sent in the
//! meantime.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::error::Result;
use crate::observability::{ObservationKind, Observability};
use crate::thread_pool::ThreadPool;
use crate::transport::{DeviceTransport, Readiness, TransportError};
use crate::types::{DeviceId, EventId, QueueId, StreamId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("command {0} is not queued")]
    NotFound(EventId),

    #[error("command channel {device}/q{queue} is shut down")]
    ShutDown { device: DeviceId, queue: u16 },
}

#[derive(Debug, Clone)]
pub struct Command {
    /// Encoded wire record.
    pub payload: Vec<u8>,
    pub tag: EventId,
    pub stream: Option<StreamId>,
    pub enabled: bool,
    pub is_dma: bool,
    pub is_peer_to_peer: bool,
    /// Reserves a queue slot; never sent.
    pub placeholder: bool,
}

impl Command {
    pub fn new(tag: EventId, payload: Vec<u8>) -> Self {
        Self {
            payload,
            tag,
            stream: None,
            enabled: true,
            is_dma: false,
            is_peer_to_peer: false,
            placeholder: false,
        }
    }

    /// Disabled placeholder with no payload. It must be cancelled, never enabled.
    pub fn ghost(tag: EventId) -> Self {
        Self {
            enabled: false,
            placeholder: true,
            ..Self::new(tag, Vec::new())
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_stream(mut self, stream: StreamId) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn dma(mut self) -> Self {
        self.is_dma = true;
        self
    }

    pub fn peer_to_peer(mut self) -> Self {
        self.is_peer_to_peer = true;
        self
    }

    fn sendable(&self) -> bool {
        self.enabled && !self.placeholder
    }

    /// Whether this entry, while not sendable, holds the entries queued behind it.
    fn holds_queue(&self) -> bool {
        self.placeholder || self.stream.is_some()
    }
}

type SentCallback = Arc<dyn Fn(EventId) + Send + Sync>;
type FailedCallback = Arc<dyn Fn(&Command, &TransportError) + Send + Sync>;

struct Entry {
    command: Command,
    in_flight: bool,
}

struct Queue {
    entries: VecDeque<Entry>,
    running: bool,
}

struct Shared {
    device: DeviceId,
    queue: QueueId,
    transport: Arc<dyn DeviceTransport>,
    obs: Arc<Observability>,
    pool: Arc<ThreadPool>,
    queue_full_poll: Duration,
    state: Mutex<Queue>,
    wake: Condvar,
    on_sent: Mutex<Option<SentCallback>>,
    on_failed: Mutex<Option<FailedCallback>>,
}

pub struct CommandChannel {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandChannel {
    pub fn new(
        device: DeviceId,
        queue: QueueId,
        transport: Arc<dyn DeviceTransport>,
        obs: Arc<Observability>,
        pool: Arc<ThreadPool>,
        queue_full_poll: Duration,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            device,
            queue,
            transport,
            obs,
            pool,
            queue_full_poll,
            state: Mutex::new(Queue {
                entries: VecDeque::new(),
                running: true,
            }),
            wake: Condvar::new(),
            on_sent: Mutex::new(None),
            on_failed: Mutex::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("rvax-{device}-q{}", queue.0))
            .spawn(move || worker_loop(&worker_shared))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn device(&self) -> DeviceId {
        self.shared.device
    }

    pub fn queue(&self) -> QueueId {
        self.shared.queue
    }

    /// Run `callback(tag)` on the thread pool after each successful submission.
    pub fn set_on_command_sent<F>(&self, callback: F)
    where
        F: Fn(EventId) + Send + Sync + 'static,
    {
        *self.shared.on_sent.lock() = Some(Arc::new(callback));
    }

    /// Called on the worker thread when the transport rejects a command outright. The command
    /// is dropped afterwards.
    pub fn set_on_send_failed<F>(&self, callback: F)
    where
        F: Fn(&Command, &TransportError) + Send + Sync + 'static,
    {
        *self.shared.on_failed.lock() = Some(Arc::new(callback));
    }

    /// Append `cmd` to the FIFO.
    pub fn send(&self, cmd: Command) -> std::result::Result<(), ChannelError> {
        let mut q = self.shared.state.lock();
        self.check_running(&q)?;
        trace!(device = %self.shared.device, queue = self.shared.queue.0, tag = %cmd.tag, enabled = cmd.enabled, "queue command");
        q.entries.push_back(Entry {
            command: cmd,
            in_flight: false,
        });
        drop(q);
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Insert `cmd` ahead of every entry not yet handed to the transport.
    pub fn send_urgent(&self, cmd: Command) -> std::result::Result<(), ChannelError> {
        let mut q = self.shared.state.lock();
        self.check_running(&q)?;
        let pos = q.entries.iter().take_while(|e| e.in_flight).count();
        trace!(device = %self.shared.device, queue = self.shared.queue.0, tag = %cmd.tag, pos, "urgent command");
        q.entries.insert(
            pos,
            Entry {
                command: cmd,
                in_flight: false,
            },
        );
        drop(q);
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Insert `cmd` directly ahead of the queued command tagged `existing`.
    ///
    /// Fails with [`ChannelError::NotFound`] when `existing` is not queued or is already being
    /// handed to the transport.
    pub fn send_before(
        &self,
        existing: EventId,
        cmd: Command,
    ) -> std::result::Result<(), ChannelError> {
        let mut q = self.shared.state.lock();
        self.check_running(&q)?;
        let pos = q
            .entries
            .iter()
            .position(|e| e.command.tag == existing && !e.in_flight)
            .ok_or(ChannelError::NotFound(existing))?;
        trace!(device = %self.shared.device, queue = self.shared.queue.0, tag = %cmd.tag, before = %existing, "insert command");
        q.entries.insert(
            pos,
            Entry {
                command: cmd,
                in_flight: false,
            },
        );
        drop(q);
        self.shared.wake.notify_all();
        Ok(())
    }

    pub fn enable(&self, tag: EventId) -> std::result::Result<(), ChannelError> {
        let mut q = self.shared.state.lock();
        let entry = q
            .entries
            .iter_mut()
            .find(|e| e.command.tag == tag)
            .ok_or(ChannelError::NotFound(tag))?;
        entry.command.enabled = true;
        drop(q);
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Remove the queued command tagged `tag`. Returns `false` (with a warning) when it is gone
    /// or already being handed to the transport.
    pub fn cancel(&self, tag: EventId) -> bool {
        let mut q = self.shared.state.lock();
        let pos = q.entries.iter().position(|e| e.command.tag == tag);
        let removed = match pos {
            Some(pos) if !q.entries[pos].in_flight => q.entries.remove(pos).is_some(),
            Some(_) => {
                warn!(device = %self.shared.device, queue = self.shared.queue.0, %tag, "cancel raced with submission");
                false
            }
            None => {
                warn!(device = %self.shared.device, queue = self.shared.queue.0, %tag, "cancel of a command that is no longer queued");
                false
            }
        };
        drop(q);
        if removed {
            self.shared.obs.record(
                ObservationKind::CommandCancelled,
                &[
                    ("device", self.shared.device.0 as u64),
                    ("queue", self.shared.queue.0 as u64),
                    ("tag", tag.0),
                ],
            );
            self.shared.wake.notify_all();
        }
        removed
    }

    pub fn contains(&self, tag: EventId) -> bool {
        self.shared
            .state
            .lock()
            .entries
            .iter()
            .any(|e| e.command.tag == tag)
    }

    /// Tags still queued (including one being submitted), in queue order.
    pub fn queued_tags(&self) -> Vec<EventId> {
        self.shared
            .state
            .lock()
            .entries
            .iter()
            .map(|e| e.command.tag)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the worker. Commands still queued are dropped.
    pub fn shutdown(&self) {
        self.shared.state.lock().running = false;
        self.shared.wake.notify_all();
        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return;
        };
        if worker.join().is_err() {
            error!(device = %self.shared.device, queue = self.shared.queue.0, "channel worker panicked");
        }
        let leftover = self.shared.state.lock().entries.len();
        if leftover > 0 {
            debug!(device = %self.shared.device, queue = self.shared.queue.0, leftover, "dropping queued commands at shutdown");
        }
    }

    fn check_running(&self, q: &Queue) -> std::result::Result<(), ChannelError> {
        if q.running {
            Ok(())
        } else {
            Err(ChannelError::ShutDown {
                device: self.shared.device,
                queue: self.shared.queue.0,
            })
        }
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("device", &self.shared.device)
            .field("queue", &self.shared.queue)
            .field("queued", &self.len())
            .finish()
    }
}

fn worker_loop(shared: &Shared) {
    let attrs = |tag: EventId| {
        [
            ("device", shared.device.0 as u64),
            ("queue", shared.queue.0 as u64),
            ("tag", tag.0),
        ]
    };

    loop {
        // Take the first sendable entry unless something ahead of it holds the queue. The entry
        // keeps its slot until accepted.
        let (tag, payload) = {
            let mut q = shared.state.lock();
            loop {
                if !q.running {
                    return;
                }
                let next = q
                    .entries
                    .iter_mut()
                    .find(|e| e.command.sendable() || e.command.holds_queue())
                    .filter(|e| e.command.sendable());
                if let Some(entry) = next {
                    entry.in_flight = true;
                    break (entry.command.tag, entry.command.payload.clone());
                }
                shared.wake.wait(&mut q);
            }
        };

        match shared.transport.send_command(shared.device, shared.queue, &payload) {
            Ok(true) => {
                {
                    let mut q = shared.state.lock();
                    if let Some(pos) = q.entries.iter().position(|e| e.command.tag == tag) {
                        q.entries.remove(pos);
                    }
                }
                shared.obs.record(ObservationKind::CommandSent, &attrs(tag));
                let callback = shared.on_sent.lock().clone();
                if let Some(callback) = callback {
                    shared.pool.push_task(move || callback(tag));
                }
            }
            Ok(false) => {
                {
                    let mut q = shared.state.lock();
                    if let Some(entry) = q.entries.iter_mut().find(|e| e.command.tag == tag) {
                        entry.in_flight = false;
                    }
                }
                shared.obs.record(ObservationKind::QueueFull, &attrs(tag));
                debug!(device = %shared.device, queue = shared.queue.0, %tag, "submission queue full, waiting");
                shared.transport.wait_for_readiness_events(
                    shared.device,
                    Readiness::SUBMISSION,
                    shared.queue_full_poll,
                );
            }
            Err(err) => {
                error!(device = %shared.device, queue = shared.queue.0, %tag, "command submission failed: {err}");
                let command = {
                    let mut q = shared.state.lock();
                    q.entries
                        .iter()
                        .position(|e| e.command.tag == tag)
                        .and_then(|pos| q.entries.remove(pos))
                        .map(|e| e.command)
                };
                let callback = shared.on_failed.lock().clone();
                if let (Some(callback), Some(command)) = (callback, command) {
                    callback(&command, &err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackTransport;
    use rvax_protocol::{encode_dma_write_list, CommandFlags};
    use std::time::Instant;

    fn channel(transport: &Arc<LoopbackTransport>) -> CommandChannel {
        CommandChannel::new(
            DeviceId(0),
            QueueId(0),
            transport.clone(),
            Arc::new(Observability::default()),
            Arc::new(ThreadPool::new("chan-test", 1).unwrap()),
            Duration::from_millis(20),
        )
        .unwrap()
    }

    fn cmd(tag: u64) -> Command {
        Command::new(
            EventId(tag),
            encode_dma_write_list(tag, CommandFlags::empty(), &[]),
        )
        .dma()
    }

    fn sent_tags(transport: &LoopbackTransport) -> Vec<u64> {
        transport.sent_log().iter().map(|r| r.tag).collect()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn enabling_a_middle_command_sends_only_it() {
        let transport = Arc::new(LoopbackTransport::default());
        let chan = channel(&transport);
        for tag in 1..=3 {
            chan.send(cmd(tag).disabled()).unwrap();
        }
        chan.enable(EventId(2)).unwrap();

        wait_until(|| chan.len() == 2);
        assert_eq!(sent_tags(&transport), vec![2]);
        assert_eq!(chan.queued_tags(), vec![EventId(1), EventId(3)]);
    }

    #[test]
    fn send_before_places_commands_ahead_of_placeholder() {
        let transport = Arc::new(LoopbackTransport::default());
        transport.pause();
        let chan = channel(&transport);
        chan.send(Command::ghost(EventId(10))).unwrap();
        chan.send_before(EventId(10), cmd(11)).unwrap();
        chan.send_before(EventId(10), cmd(12)).unwrap();
        chan.send(cmd(13)).unwrap();

        wait_until(|| chan.len() == 2);
        assert_eq!(sent_tags(&transport), vec![11, 12]);
        // Nothing passes the placeholder until it goes away.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(chan.queued_tags(), vec![EventId(10), EventId(13)]);

        assert!(chan.cancel(EventId(10)));
        wait_until(|| chan.is_empty());
        assert_eq!(sent_tags(&transport), vec![11, 12, 13]);
        transport.resume();
    }

    #[test]
    fn disabled_stream_command_holds_the_queue() {
        let transport = Arc::new(LoopbackTransport::default());
        let chan = channel(&transport);
        let stream = StreamId(1);
        chan.send(cmd(1).with_stream(stream)).unwrap();
        chan.send(cmd(2).disabled().with_stream(stream)).unwrap();
        chan.send(cmd(3).with_stream(StreamId(2))).unwrap();
        chan.send(cmd(4)).unwrap();

        wait_until(|| chan.len() == 3);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sent_tags(&transport), vec![1]);

        chan.enable(EventId(2)).unwrap();
        wait_until(|| chan.is_empty());
        assert_eq!(sent_tags(&transport), vec![1, 2, 3, 4]);
    }

    #[test]
    fn urgent_commands_jump_a_held_queue() {
        let transport = Arc::new(LoopbackTransport::default());
        let chan = channel(&transport);
        chan.send(Command::ghost(EventId(1)).with_stream(StreamId(1))).unwrap();
        chan.send(cmd(2)).unwrap();
        chan.send_urgent(cmd(3)).unwrap();

        wait_until(|| chan.len() == 2);
        assert_eq!(sent_tags(&transport), vec![3]);
        assert_eq!(chan.queued_tags(), vec![EventId(1), EventId(2)]);
        assert!(chan.cancel(EventId(1)));
        wait_until(|| chan.is_empty());
    }

    #[test]
    fn unknown_tags_are_reported() {
        let transport = Arc::new(LoopbackTransport::default());
        let chan = channel(&transport);
        assert_eq!(
            chan.send_before(EventId(99), cmd(1)),
            Err(ChannelError::NotFound(EventId(99)))
        );
        assert_eq!(chan.enable(EventId(99)), Err(ChannelError::NotFound(EventId(99))));
        assert!(!chan.cancel(EventId(99)));
    }

    #[test]
    fn full_queue_retries_the_same_command_in_order() {
        let transport = Arc::new(LoopbackTransport::new(
            crate::transport::loopback::LoopbackConfig {
                queue_depth: 1,
                ..Default::default()
            },
        ));
        transport.pause();
        let chan = channel(&transport);
        for tag in 1..=4 {
            chan.send(cmd(tag)).unwrap();
        }

        for accepted in 1..=4usize {
            wait_until(|| transport.sent_log().len() == accepted);
            assert_eq!(transport.step(DeviceId(0), 1), 1);
        }
        assert_eq!(sent_tags(&transport), vec![1, 2, 3, 4]);
    }

    #[test]
    fn sent_callback_runs_per_command() {
        let transport = Arc::new(LoopbackTransport::default());
        let chan = channel(&transport);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        chan.set_on_command_sent(move |tag| sink.lock().push(tag));
        chan.send(cmd(1)).unwrap();
        chan.send(cmd(2)).unwrap();

        wait_until(|| seen.lock().len() == 2);
        let mut tags = seen.lock().clone();
        tags.sort();
        assert_eq!(tags, vec![EventId(1), EventId(2)]);
    }

    #[test]
    fn shutdown_rejects_new_commands() {
        let transport = Arc::new(LoopbackTransport::default());
        let chan = channel(&transport);
        chan.shutdown();
        assert!(matches!(chan.send(cmd(1)), Err(ChannelError::ShutDown { .. })));
    }
}
