//! User-facing runtime: one value owning every per-device pipeline component.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use rvax_protocol::{encode_abort, encode_kernel_launch, CommandFlags, DeviceErrorCode, KernelLaunch};
use tracing::{debug, info, warn};

use crate::allocator::DeviceAllocator;
use crate::channel::{Command, CommandChannel};
use crate::config::RuntimeConfig;
use crate::dispatcher::{AbortGate, CoreDumpCollector, DispatchTargets, ResponseDispatcher};
use crate::error::{Result, RuntimeError};
use crate::event_ledger::EventLedger;
use crate::exec_context::ExecContextPool;
use crate::observability::{Observability, ObservationKind, Observer, RuntimeStatsSnapshot, TracingObserver};
use crate::staging::StagingPool;
use crate::streams::{deliver_error, retire, StreamError, StreamErrorCallback, StreamErrorCode, StreamRegistry};
use crate::thread_pool::ThreadPool;
use crate::transfer::{
    fail_event, ActionRunner, DeviceToHost, DeviceToHostList, DeviceToHostOp, HostToDevice,
    HostToDeviceList, HostToDeviceOp, TransferAction, TransferContext, TransferControl,
    TransferError,
};
use crate::transport::{DeviceLayout, DeviceTransport, DmaLimits};
use crate::types::{DeviceId, DevicePtr, EventId, HostBuffer, QueueId, StreamId};

#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    observer: Option<Arc<dyn Observer>>,
    core_dumps: Option<Arc<dyn CoreDumpCollector>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Called for kernel faults before the error reaches the stream.
    pub fn core_dump_collector(mut self, collector: Arc<dyn CoreDumpCollector>) -> Self {
        self.core_dumps = Some(collector);
        self
    }

    pub fn build(self, transport: Arc<dyn DeviceTransport>) -> Result<Runtime> {
        self.config.validate()?;
        let config = self.config;
        let obs = Arc::new(Observability::new(
            self.observer.unwrap_or_else(|| Arc::new(TracingObserver)),
        ));
        let ledger = Arc::new(EventLedger::new(config.throw_on_missing_event));

        let device_count = transport.device_count();
        let mut layouts = Vec::with_capacity(device_count as usize);
        for index in 0..device_count {
            let device = DeviceId(index);
            layouts.push((device, transport.device_layout(device)?, transport.dma_limits(device)?));
        }
        let streams = Arc::new(StreamRegistry::new(
            layouts.iter().map(|(device, layout, _)| (*device, layout.queue_count)),
        ));

        let mut devices = Vec::with_capacity(layouts.len());
        for (device, layout, limits) in layouts {
            devices.push(DeviceUnit::new(
                device,
                layout,
                limits,
                &config,
                &transport,
                &ledger,
                &streams,
                &obs,
                self.core_dumps.clone(),
            )?);
        }
        let runner = ActionRunner::new(Arc::clone(&streams), config.runner_idle())?;

        info!(devices = devices.len(), "runtime started");
        Ok(Runtime {
            config,
            ledger,
            streams,
            obs,
            devices,
            runner,
            transfers: Arc::default(),
        })
    }
}

/// Everything the runtime owns for one device.
struct DeviceUnit {
    id: DeviceId,
    layout: DeviceLayout,
    limits: DmaLimits,
    allocator: Arc<DeviceAllocator>,
    contexts: Arc<ExecContextPool>,
    staging: Arc<StagingPool>,
    copy_pool: Arc<ThreadPool>,
    error_pool: Arc<ThreadPool>,
    channels: Vec<Arc<CommandChannel>>,
    abort_gate: Arc<AbortGate>,
    dispatcher: ResponseDispatcher,
}

impl DeviceUnit {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: DeviceId,
        layout: DeviceLayout,
        limits: DmaLimits,
        config: &RuntimeConfig,
        transport: &Arc<dyn DeviceTransport>,
        ledger: &Arc<EventLedger>,
        streams: &Arc<StreamRegistry>,
        obs: &Arc<Observability>,
        core_dumps: Option<Arc<dyn CoreDumpCollector>>,
    ) -> Result<Self> {
        let allocator = Arc::new(DeviceAllocator::new(
            id,
            layout.dram_base,
            layout.dram_size,
            layout.block_size,
        )?);
        let contexts = Arc::new(ExecContextPool::new(
            id,
            &allocator,
            config.kernel_context_slots,
            config.kernel_context_size,
        )?);
        let staging = Arc::new(StagingPool::new(
            Arc::clone(transport),
            id,
            limits,
            config.staging_overcommit_factor,
            config.staging_block_size,
        )?);
        let copy_pool = Arc::new(ThreadPool::new(
            format!("rvax-{id}-copy"),
            config.copy_threads_per_device,
        )?);
        let error_pool = Arc::new(ThreadPool::new(
            format!("rvax-{id}-error"),
            config.error_threads_per_device,
        )?);

        let mut channels = Vec::with_capacity(layout.queue_count as usize);
        for queue in 0..layout.queue_count.max(1) {
            let channel = CommandChannel::new(
                id,
                QueueId(queue),
                Arc::clone(transport),
                Arc::clone(obs),
                Arc::clone(&copy_pool),
                config.queue_full_poll(),
            )?;
            let (ledger, streams, contexts) =
                (Arc::clone(ledger), Arc::clone(streams), Arc::clone(&contexts));
            channel.set_on_send_failed(move |command, err| {
                contexts.release(command.tag);
                match command.stream.or_else(|| streams.stream_of(command.tag)) {
                    Some(stream) => {
                        fail_event(&ledger, &streams, stream, id, command.tag, err.to_string())
                    }
                    None => retire(&ledger, &streams, command.tag),
                }
            });
            channels.push(Arc::new(channel));
        }

        let abort_gate = Arc::new(AbortGate::default());
        let dispatcher = ResponseDispatcher::new(
            id,
            Arc::clone(transport),
            DispatchTargets {
                ledger: Arc::clone(ledger),
                streams: Arc::clone(streams),
                obs: Arc::clone(obs),
                error_pool: Arc::clone(&error_pool),
                contexts: Some(Arc::clone(&contexts)),
                abort_gate: Arc::clone(&abort_gate),
                core_dumps,
            },
            config.response_poll(),
        )?;

        debug!(
            device = %id,
            queues = channels.len(),
            staging = staging.capacity(),
            contexts = contexts.capacity(),
            "device ready"
        );
        Ok(Self {
            id,
            layout,
            limits,
            allocator,
            contexts,
            staging,
            copy_pool,
            error_pool,
            channels,
            abort_gate,
            dispatcher,
        })
    }

    fn channel(&self, queue: QueueId) -> Result<&Arc<CommandChannel>> {
        self.channels
            .get(queue.0 as usize)
            .ok_or(RuntimeError::InvalidArgument("stream bound to a missing queue"))
    }
}

pub struct Runtime {
    config: RuntimeConfig,
    ledger: Arc<EventLedger>,
    streams: Arc<StreamRegistry>,
    obs: Arc<Observability>,
    devices: Vec<DeviceUnit>,
    runner: ActionRunner,
    /// Abort handles of transfers whose completion has not fired, by completion event.
    transfers: Arc<Mutex<HashMap<EventId, Arc<TransferControl>>>>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn new(transport: Arc<dyn DeviceTransport>, config: RuntimeConfig) -> Result<Self> {
        RuntimeBuilder::new().config(config).build(transport)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn device_count(&self) -> u32 {
        self.devices.len() as u32
    }

    pub fn device_layout(&self, device: DeviceId) -> Result<DeviceLayout> {
        Ok(self.device(device)?.layout)
    }

    pub fn dma_limits(&self, device: DeviceId) -> Result<DmaLimits> {
        Ok(self.device(device)?.limits)
    }

    /// Free device DRAM in bytes.
    pub fn free_device_memory(&self, device: DeviceId) -> Result<u64> {
        Ok(self.device(device)?.allocator.free_bytes())
    }

    pub fn staging_capacity(&self, device: DeviceId) -> Result<u64> {
        Ok(self.device(device)?.staging.capacity())
    }

    pub fn stats(&self) -> RuntimeStatsSnapshot {
        self.obs.stats()
    }

    pub fn outstanding_events(&self) -> usize {
        self.ledger.outstanding_count()
    }

    /// `alignment` of 0 means block alignment.
    pub fn allocate(&self, device: DeviceId, size: u64, alignment: u64) -> Result<DevicePtr> {
        Ok(self.device(device)?.allocator.malloc(size, alignment)?)
    }

    pub fn free(&self, device: DeviceId, ptr: DevicePtr) -> Result<()> {
        Ok(self.device(device)?.allocator.free(ptr)?)
    }

    pub fn create_stream(&self, device: DeviceId) -> Result<StreamId> {
        self.device(device)?;
        Ok(self.streams.create_stream(device)?)
    }

    pub fn destroy_stream(&self, stream: StreamId) -> Result<()> {
        Ok(self.streams.destroy_stream(stream)?)
    }

    pub fn copy_host_to_device(
        &self,
        stream: StreamId,
        src: &HostBuffer,
        src_offset: usize,
        dst: DevicePtr,
        size: u64,
        barrier: bool,
    ) -> Result<EventId> {
        let src = src.clone();
        self.start_transfer(stream, move |ctx, completion| {
            HostToDevice::new(ctx, completion, src, src_offset, dst, size, barrier)
        })
    }

    pub fn copy_device_to_host(
        &self,
        stream: StreamId,
        src: DevicePtr,
        dst: &HostBuffer,
        dst_offset: usize,
        size: u64,
        barrier: bool,
    ) -> Result<EventId> {
        let dst = dst.clone();
        self.start_transfer(stream, move |ctx, completion| {
            DeviceToHost::new(ctx, completion, src, dst, dst_offset, size, barrier)
        })
    }

    /// Scatter many host ranges to device memory as a single DMA list.
    pub fn copy_host_to_device_list(
        &self,
        stream: StreamId,
        ops: Vec<HostToDeviceOp>,
        barrier: bool,
    ) -> Result<EventId> {
        self.start_transfer(stream, move |ctx, completion| {
            HostToDeviceList::new(ctx, completion, ops, barrier)
        })
    }

    /// Gather many device ranges into host memory as a single DMA list.
    pub fn copy_device_to_host_list(
        &self,
        stream: StreamId,
        ops: Vec<DeviceToHostOp>,
        barrier: bool,
    ) -> Result<EventId> {
        self.start_transfer(stream, move |ctx, completion| {
            DeviceToHostList::new(ctx, completion, ops, barrier)
        })
    }

    /// Queue a kernel launch. The launch holds one execution context until it completes.
    pub fn launch_kernel(
        &self,
        stream: StreamId,
        code: DevicePtr,
        args: &[u8],
        barrier: bool,
    ) -> Result<EventId> {
        let (device, queue) = self.streams.stream_location(stream)?;
        let unit = self.device(device)?;
        let channel = unit.channel(queue)?;

        let event = self.ledger.next();
        let Some(context) = unit.contexts.reserve(event) else {
            self.ledger.dispatch(event)?;
            return Err(RuntimeError::NoExecutionContext(device));
        };
        if let Err(err) = self.streams.add_event(stream, event) {
            unit.contexts.release(event);
            self.ledger.dispatch(event)?;
            return Err(err.into());
        }

        let flags = if barrier {
            CommandFlags::BARRIER
        } else {
            CommandFlags::empty()
        };
        let launch = KernelLaunch {
            code_address: code.0,
            context_address: context.0,
            args: args.to_vec(),
        };
        let payload = encode_kernel_launch(event.0, flags, &launch);
        if let Err(err) = channel.send(Command::new(event, payload).with_stream(stream)) {
            unit.contexts.release(event);
            retire(&self.ledger, &self.streams, event);
            return Err(err.into());
        }
        debug!(%device, %stream, %event, code = %code, "kernel launch queued");
        Ok(event)
    }

    /// Allocate device memory for an already relocated code image and copy it there.
    pub fn load_code(&self, stream: StreamId, image: &[u8]) -> Result<(DevicePtr, EventId)> {
        if image.is_empty() {
            return Err(RuntimeError::InvalidArgument("empty code image"));
        }
        let (device, _) = self.streams.stream_location(stream)?;
        let size = image.len() as u64;
        let addr = self.allocate(device, size, 0)?;
        let buffer = HostBuffer::from_vec(image.to_vec());
        match self.copy_host_to_device(stream, &buffer, 0, addr, size, false) {
            Ok(event) => Ok((addr, event)),
            Err(err) => {
                if let Err(free_err) = self.free(device, addr) {
                    warn!(%device, addr = %addr, "freeing code allocation failed: {free_err}");
                }
                Err(err)
            }
        }
    }

    /// `true` once `event` has completed, `false` on timeout.
    pub fn wait_for_event(&self, event: EventId, timeout: Duration) -> bool {
        self.ledger.block_until_dispatched(event, timeout)
    }

    /// Wait for every event live on `stream` when the call is made.
    pub fn wait_for_stream(&self, stream: StreamId, timeout: Duration) -> Result<bool> {
        let events = self.streams.live_events(stream)?;
        let deadline = Instant::now().checked_add(timeout);
        for event in events {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            if !self.ledger.block_until_dispatched(event, remaining) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Abort the command or transfer completing `event`.
    ///
    /// A command still queued on the host is removed and reported as
    /// [`DeviceErrorCode::Aborted`] without touching the device. Otherwise an abort command is
    /// sent and this call waits up to `timeout` for the device to answer it.
    ///
    /// For a copy, `event` is its completion: no further batches are issued, queued batches are
    /// dropped, batches already on the device are aborted there, and the completion carries an
    /// `Aborted` error once every batch has resolved.
    ///
    /// Either way the returned event completes once the abort has been resolved.
    pub fn abort_command(&self, event: EventId, timeout: Duration) -> Result<EventId> {
        let stream = self
            .streams
            .stream_of(event)
            .ok_or(RuntimeError::EventWithoutStream(event))?;
        let (device, queue) = self.streams.stream_location(stream)?;
        let unit = self.device(device)?;
        let channel = unit.channel(queue)?;

        let transfer = self.transfers.lock().get(&event).cloned();
        if let Some(control) = transfer {
            return self.abort_transfer(unit, channel, stream, &control, timeout);
        }

        if channel.cancel(event) {
            let abort = self.ledger.next();
            unit.contexts.release(event);
            deliver_error(
                &self.ledger,
                &self.streams,
                StreamError {
                    event,
                    stream,
                    device,
                    code: StreamErrorCode::Device(DeviceErrorCode::Aborted),
                    response_kind: None,
                    core_dump: None,
                },
            );
            self.ledger.dispatch(abort)?;
            debug!(%device, %event, "aborted on the host before submission");
            return Ok(abort);
        }

        let abort = self.issue_device_abort(unit, channel, stream, event)?;
        if !self.ledger.block_until_dispatched(abort, timeout) {
            warn!(%device, %event, %abort, ?timeout, "device abort still pending");
        }
        Ok(abort)
    }

    fn abort_transfer(
        &self,
        unit: &DeviceUnit,
        channel: &CommandChannel,
        stream: StreamId,
        control: &TransferControl,
        timeout: Duration,
    ) -> Result<EventId> {
        let completion = control.completion();
        let abort = self.ledger.next();
        if let Err(err) = self.streams.add_event(stream, abort) {
            self.ledger.dispatch(abort)?;
            return Err(err.into());
        }
        let Some(batches) = control.abort() else {
            debug!(device = %unit.id, %completion, "transfer already aborted");
            retire(&self.ledger, &self.streams, abort);
            return Ok(abort);
        };

        let mut device_aborts = Vec::new();
        let mut cancelled = 0usize;
        for batch in batches {
            if channel.cancel(batch) {
                cancelled += 1;
                retire(&self.ledger, &self.streams, batch);
            } else if self.ledger.is_outstanding(batch) {
                match self.issue_device_abort(unit, channel, stream, batch) {
                    Ok(device_abort) => device_aborts.push(device_abort),
                    Err(err) => {
                        warn!(device = %unit.id, %batch, "aborting batch on the device failed: {err}");
                    }
                }
            }
        }
        debug!(
            device = %unit.id,
            %completion,
            cancelled,
            on_device = device_aborts.len(),
            "transfer abort issued"
        );

        let (ledger, streams) = (Arc::clone(&self.ledger), Arc::clone(&self.streams));
        self.ledger
            .add_dependency_join(device_aborts, move || retire(&ledger, &streams, abort));
        if !self.ledger.block_until_dispatched(abort, timeout) {
            warn!(device = %unit.id, %completion, %abort, ?timeout, "transfer abort still pending");
        }
        Ok(abort)
    }

    /// Send an abort for `target` ahead of everything queued. Error processing on the device
    /// is held until the abort completes.
    fn issue_device_abort(
        &self,
        unit: &DeviceUnit,
        channel: &CommandChannel,
        stream: StreamId,
        target: EventId,
    ) -> Result<EventId> {
        let abort = self.ledger.next();
        if let Err(err) = self.streams.add_event(stream, abort) {
            self.ledger.dispatch(abort)?;
            return Err(err.into());
        }
        unit.abort_gate.enter();
        self.obs.record(
            ObservationKind::AbortIssued,
            &[("device", unit.id.0 as u64), ("tag", abort.0), ("target", target.0)],
        );
        let command = Command::new(abort, encode_abort(abort.0, target.0)).with_stream(stream);
        if let Err(err) = channel.send_urgent(command) {
            unit.abort_gate.exit();
            retire(&self.ledger, &self.streams, abort);
            return Err(err.into());
        }
        Ok(abort)
    }

    /// Drain the errors buffered on `stream`.
    pub fn retrieve_errors(&self, stream: StreamId) -> Result<Vec<StreamError>> {
        Ok(self.streams.retrieve_errors(stream)?)
    }

    /// Deliver future errors of `stream` to `callback` instead of buffering them.
    pub fn set_stream_error_callback(
        &self,
        stream: StreamId,
        callback: Option<StreamErrorCallback>,
    ) -> Result<()> {
        Ok(self.streams.set_error_callback(stream, callback)?)
    }

    /// Run `callback(device, tag)` on a device pool thread whenever a command reaches the
    /// hardware queue.
    pub fn set_on_command_sent<F>(&self, callback: F)
    where
        F: Fn(DeviceId, EventId) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        for unit in &self.devices {
            for channel in &unit.channels {
                let callback = Arc::clone(&callback);
                let device = unit.id;
                channel.set_on_command_sent(move |tag| callback(device, tag));
            }
        }
    }

    fn device(&self, device: DeviceId) -> Result<&DeviceUnit> {
        self.devices
            .get(device.0 as usize)
            .ok_or(RuntimeError::UnknownDevice(device))
    }

    fn transfer_context(&self, stream: StreamId) -> Result<TransferContext> {
        let (device, queue) = self.streams.stream_location(stream)?;
        let unit = self.device(device)?;
        Ok(TransferContext {
            ledger: Arc::clone(&self.ledger),
            streams: Arc::clone(&self.streams),
            obs: Arc::clone(&self.obs),
            stream,
            device,
            channel: Arc::clone(unit.channel(queue)?),
            staging: Arc::clone(&unit.staging),
            copy_pool: Arc::clone(&unit.copy_pool),
            limits: unit.limits,
        })
    }

    /// Build a transfer under a fresh completion event and hand it to the action runner.
    fn start_transfer<A, F>(&self, stream: StreamId, build: F) -> Result<EventId>
    where
        A: TransferAction + 'static,
        F: FnOnce(TransferContext, EventId) -> std::result::Result<A, TransferError>,
    {
        let ctx = self.transfer_context(stream)?;
        let completion = self.ledger.next();
        if let Err(err) = self.streams.add_event(stream, completion) {
            self.ledger.dispatch(completion)?;
            return Err(err.into());
        }
        match build(ctx, completion) {
            Ok(action) => {
                self.transfers
                    .lock()
                    .insert(completion, Arc::clone(action.control()));
                let transfers = Arc::clone(&self.transfers);
                self.ledger.add_dependency_join([completion], move || {
                    transfers.lock().remove(&completion);
                });
                self.runner.submit(Box::new(action));
                Ok(completion)
            }
            Err(err) => {
                retire(&self.ledger, &self.streams, completion);
                Err(err.into())
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.ledger.set_throw_on_missing_event(false);
        self.runner.shutdown();
        for unit in &self.devices {
            for channel in &unit.channels {
                channel.shutdown();
            }
        }
        for unit in &self.devices {
            unit.dispatcher.shutdown();
            unit.abort_gate.open();
        }
        for unit in &self.devices {
            unit.copy_pool.shutdown();
            unit.error_pool.shutdown();
        }
        // Pending joins hold staging and channel handles.
        let dropped = self.ledger.clear_joins();
        debug!(
            dropped_joins = dropped,
            outstanding = self.ledger.outstanding_count(),
            "runtime stopped"
        );
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("devices", &self.devices.len())
            .field("streams", &self.streams.stream_count())
            .field("ledger", &self.ledger)
            .field("pending_transfers", &self.runner.pending())
            .finish()
    }
}
