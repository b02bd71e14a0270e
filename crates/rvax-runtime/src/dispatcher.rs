//! Per-device response loop.
//!
//! Successful responses are settled inline: kernel completions give back their execution
//! context, abort completions lower the device's abort gate, and the tagged event is retired.
//!
//! Failed responses are never handled on the dispatcher thread. They are queued on the device
//! error pool, which holds them while an abort is outstanding on the device, attaches a
//! [`StreamError`] to the owning stream (callback or buffer), optionally collects a core dump,
//! and only then retires the event. A waiter therefore never sees a failed event complete
//! before its error is visible.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rvax_protocol::{decode_response, DeviceErrorCode, ResponseHeader, ResponseKind};
use tracing::{debug, error, warn};

use crate::event_ledger::EventLedger;
use crate::exec_context::ExecContextPool;
use crate::observability::{ObservationKind, Observability};
use crate::streams::{deliver_error, retire, StreamError, StreamErrorCode, StreamRegistry};
use crate::thread_pool::ThreadPool;
use crate::transport::{DeviceTransport, Readiness};
use crate::types::{DeviceId, EventId};

/// Produces a device core dump for a failed kernel. Returns where it was written.
pub trait CoreDumpCollector: Send + Sync {
    fn collect(&self, device: DeviceId, event: EventId) -> Option<PathBuf>;
}

/// Count of aborts in flight on one device.
#[derive(Debug, Default)]
pub struct AbortGate {
    active: Mutex<usize>,
    cleared: Condvar,
}

impl AbortGate {
    pub fn enter(&self) {
        *self.active.lock() += 1;
    }

    pub fn exit(&self) {
        let mut active = self.active.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.cleared.notify_all();
        }
    }

    pub fn active(&self) -> usize {
        *self.active.lock()
    }

    /// Drop every outstanding abort (teardown).
    pub fn open(&self) {
        *self.active.lock() = 0;
        self.cleared.notify_all();
    }

    /// Wait until no abort is outstanding. Returns `false` on timeout.
    pub fn wait_clear(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut active = self.active.lock();
        while *active > 0 {
            match deadline {
                Some(deadline) => {
                    if self.cleared.wait_until(&mut active, deadline).timed_out() {
                        return *active == 0;
                    }
                }
                None => self.cleared.wait(&mut active),
            }
        }
        true
    }
}

/// Collaborators one dispatcher works with.
#[derive(Clone)]
pub struct DispatchTargets {
    pub ledger: Arc<EventLedger>,
    pub streams: Arc<StreamRegistry>,
    pub obs: Arc<Observability>,
    pub error_pool: Arc<ThreadPool>,
    pub contexts: Option<Arc<ExecContextPool>>,
    pub abort_gate: Arc<AbortGate>,
    pub core_dumps: Option<Arc<dyn CoreDumpCollector>>,
}

struct Shared {
    device: DeviceId,
    transport: Arc<dyn DeviceTransport>,
    targets: DispatchTargets,
    poll: Duration,
    running: AtomicBool,
}

pub struct ResponseDispatcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ResponseDispatcher {
    pub fn new(
        device: DeviceId,
        transport: Arc<dyn DeviceTransport>,
        targets: DispatchTargets,
        poll: Duration,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            device,
            transport,
            targets,
            poll,
            running: AtomicBool::new(true),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("rvax-{device}-responses"))
            .spawn(move || dispatch_loop(&worker_shared))?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn device(&self) -> DeviceId {
        self.shared.device
    }

    /// Stop the loop after draining whatever responses are already waiting.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.targets.abort_gate.open();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!(device = %self.shared.device, "response dispatcher panicked");
            }
        }
    }
}

impl Drop for ResponseDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ResponseDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseDispatcher")
            .field("device", &self.shared.device)
            .field("running", &self.shared.running.load(Ordering::Relaxed))
            .finish()
    }
}

fn dispatch_loop(shared: &Arc<Shared>) {
    while shared.running.load(Ordering::Acquire) {
        let ready = shared.transport.wait_for_readiness_events(
            shared.device,
            Readiness::COMPLETION,
            shared.poll,
        );
        if ready.contains(Readiness::COMPLETION) {
            drain(shared);
        }
    }
    drain(shared);
    debug!(device = %shared.device, "response dispatcher stopped");
}

fn drain(shared: &Arc<Shared>) {
    loop {
        match shared.transport.receive_response(shared.device) {
            Ok(Some(raw)) => match decode_response(&raw) {
                Ok(header) => handle(shared, header),
                Err(err) => error!(device = %shared.device, "undecodable response: {err}"),
            },
            Ok(None) => return,
            Err(err) => {
                error!(device = %shared.device, "receiving response failed: {err}");
                return;
            }
        }
    }
}

fn handle(shared: &Arc<Shared>, header: ResponseHeader) {
    let targets = &shared.targets;
    let event = EventId(header.tag);
    targets.obs.record(
        ObservationKind::ResponseReceived,
        &[
            ("device", shared.device.0 as u64),
            ("tag", header.tag),
            ("status", header.status as u64),
        ],
    );

    // Execution contexts and the abort gate are settled regardless of the status.
    match header.kind {
        ResponseKind::KernelLaunchComplete => {
            if let Some(contexts) = &targets.contexts {
                if !contexts.release(event) {
                    debug!(device = %shared.device, %event, "kernel completion without a reserved context");
                }
            }
        }
        ResponseKind::AbortComplete => targets.abort_gate.exit(),
        ResponseKind::DmaWriteComplete | ResponseKind::DmaReadComplete => {}
    }

    let Some(code) = DeviceErrorCode::from_status(header.status) else {
        retire(&targets.ledger, &targets.streams, event);
        return;
    };

    warn!(device = %shared.device, %event, kind = header.kind.as_str(), %code, "device reported failure");
    targets.obs.record(
        ObservationKind::DeviceError,
        &[
            ("device", shared.device.0 as u64),
            ("tag", header.tag),
            ("status", header.status as u64),
        ],
    );

    let task_shared = Arc::clone(shared);
    let kind = header.kind;
    targets
        .error_pool
        .push_or_run(move || process_error(&task_shared, event, kind, code));
}

fn process_error(shared: &Shared, event: EventId, kind: ResponseKind, code: DeviceErrorCode) {
    let targets = &shared.targets;

    // Hold ordinary failures while an abort is resolving on this device.
    if kind != ResponseKind::AbortComplete {
        while !targets.abort_gate.wait_clear(shared.poll) {
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
        }
    }

    let Some(stream) = targets.streams.stream_of(event) else {
        warn!(device = %shared.device, %event, %code, "device error for an event without a stream");
        retire(&targets.ledger, &targets.streams, event);
        return;
    };

    let core_dump = if code.is_kernel_fault() {
        targets
            .core_dumps
            .as_ref()
            .and_then(|collector| collector.collect(shared.device, event))
    } else {
        None
    };

    let error = StreamError {
        event,
        stream,
        device: shared.device,
        code: StreamErrorCode::Device(code),
        response_kind: Some(kind),
        core_dump,
    };
    deliver_error(&targets.ledger, &targets.streams, error);
}
