use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rvax_protocol::{CommandKind, DeviceErrorCode, ResponseKind};
use rvax_runtime::transfer::TransferError;
use rvax_runtime::transport::loopback::{LoopbackConfig, LoopbackTransport};
use rvax_runtime::{
    CoreDumpCollector, DeviceId, DevicePtr, EventId, HostBuffer, HostToDeviceOp, Runtime,
    RuntimeConfig, RuntimeError, StreamError, StreamErrorCode,
};

const DEVICE: DeviceId = DeviceId(0);
const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn status(code: DeviceErrorCode) -> u32 {
    code.status().unwrap()
}

#[derive(Default)]
struct RecordingDumps(Mutex<Vec<EventId>>);

impl CoreDumpCollector for RecordingDumps {
    fn collect(&self, device: DeviceId, event: EventId) -> Option<PathBuf> {
        self.0.lock().push(event);
        Some(PathBuf::from(format!("/tmp/rvax-{}-{}.core", device.0, event.0)))
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn kernel_fault_is_buffered_with_core_dump_before_event_completes() {
    init_tracing();
    let transport = Arc::new(LoopbackTransport::default());
    transport.fail_kind(CommandKind::KernelLaunch, status(DeviceErrorCode::KernelException));
    let dumps = Arc::new(RecordingDumps::default());
    let rt = Runtime::builder()
        .core_dump_collector(dumps.clone())
        .build(transport.clone())
        .unwrap();
    let stream = rt.create_stream(DEVICE).unwrap();

    let event = rt.launch_kernel(stream, DevicePtr(0x8000_0000), &[], false).unwrap();
    assert!(rt.wait_for_event(event, WAIT));

    // The error is visible as soon as the event completes.
    let errors = rt.retrieve_errors(stream).unwrap();
    assert_eq!(errors.len(), 1);
    let err = &errors[0];
    assert_eq!(err.event, event);
    assert_eq!(err.stream, stream);
    assert_eq!(err.code, StreamErrorCode::Device(DeviceErrorCode::KernelException));
    assert_eq!(err.response_kind, Some(ResponseKind::KernelLaunchComplete));
    assert!(err.core_dump.is_some());
    assert_eq!(*dumps.0.lock(), vec![event]);

    assert!(rt.retrieve_errors(stream).unwrap().is_empty());
    rt.destroy_stream(stream).unwrap();
    assert_eq!(rt.stats().device_errors, 1);
}

#[test]
fn callback_receives_errors_instead_of_the_buffer() {
    init_tracing();
    let transport = Arc::new(LoopbackTransport::default());
    transport.fail_kind(CommandKind::KernelLaunch, status(DeviceErrorCode::KernelTimeout));
    let rt = Runtime::new(transport.clone(), RuntimeConfig::default()).unwrap();
    let stream = rt.create_stream(DEVICE).unwrap();

    let seen: Arc<Mutex<Vec<StreamError>>> = Arc::default();
    let sink = seen.clone();
    rt.set_stream_error_callback(
        stream,
        Some(Arc::new(move |err: &StreamError| sink.lock().push(err.clone()))),
    )
    .unwrap();

    let event = rt.launch_kernel(stream, DevicePtr(0x8000_0000), &[1, 2], false).unwrap();
    assert!(rt.wait_for_event(event, WAIT));
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(
        seen.lock()[0].code,
        StreamErrorCode::Device(DeviceErrorCode::KernelTimeout)
    );
    assert!(rt.retrieve_errors(stream).unwrap().is_empty());

    // Without a callback the next failure is buffered again.
    rt.set_stream_error_callback(stream, None).unwrap();
    let event = rt.launch_kernel(stream, DevicePtr(0x8000_0000), &[], false).unwrap();
    assert!(rt.wait_for_event(event, WAIT));
    assert_eq!(rt.retrieve_errors(stream).unwrap().len(), 1);
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn dma_failure_attaches_to_stream_and_completion_still_fires() {
    init_tracing();
    let transport = Arc::new(LoopbackTransport::default());
    let rt = Runtime::new(transport.clone(), RuntimeConfig::default()).unwrap();
    let stream = rt.create_stream(DEVICE).unwrap();
    let layout = rt.device_layout(DEVICE).unwrap();

    // Past the end of DRAM.
    let dst = DevicePtr(layout.dram_base + layout.dram_size);
    let src = HostBuffer::from_vec(vec![0xAB; 8192]);
    let event = rt.copy_host_to_device(stream, &src, 0, dst, 8192, false).unwrap();
    assert!(rt.wait_for_event(event, WAIT));
    assert!(rt.wait_for_stream(stream, WAIT).unwrap());

    let errors = rt.retrieve_errors(stream).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].code,
        StreamErrorCode::Device(DeviceErrorCode::DmaInvalidAddress)
    );
    assert_eq!(errors[0].response_kind, Some(ResponseKind::DmaWriteComplete));
    assert_ne!(errors[0].event, event);
}

#[test]
fn oversized_lists_are_rejected_before_anything_is_queued() {
    init_tracing();
    let transport = Arc::new(LoopbackTransport::default());
    let config = RuntimeConfig {
        staging_overcommit_factor: 1,
        ..RuntimeConfig::default()
    };
    let rt = Runtime::new(transport.clone(), config).unwrap();
    let stream = rt.create_stream(DEVICE).unwrap();
    let capacity = rt.staging_capacity(DEVICE).unwrap();
    let outstanding = rt.outstanding_events();

    let big = HostBuffer::zeroed(capacity as usize + 4096);
    let ops = vec![
        HostToDeviceOp {
            src: big.clone(),
            src_offset: 0,
            dst: DevicePtr(0x8000_0000),
            size: capacity,
        },
        HostToDeviceOp {
            src: big,
            src_offset: capacity as usize,
            dst: DevicePtr(0x8000_0000 + 2 * capacity),
            size: 4096,
        },
    ];
    let err = rt.copy_host_to_device_list(stream, ops, false).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Transfer(TransferError::TooLarge { requested, capacity: c })
            if requested == capacity + 4096 && c == capacity
    ));

    let small = HostBuffer::zeroed(5 * 64);
    let ops = (0..5)
        .map(|i| HostToDeviceOp {
            src: small.clone(),
            src_offset: i * 64,
            dst: DevicePtr(0x8000_0000 + i as u64 * 8192),
            size: 64,
        })
        .collect();
    let err = rt.copy_host_to_device_list(stream, ops, false).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Transfer(TransferError::TooManyNodes { nodes: 5, max: 4 })
    ));

    assert_eq!(rt.outstanding_events(), outstanding);
    assert!(transport.sent_log().is_empty());
    rt.destroy_stream(stream).unwrap();
}

#[test]
fn abort_of_a_host_queued_command_never_reaches_the_device() {
    init_tracing();
    let transport = Arc::new(LoopbackTransport::new(LoopbackConfig {
        queue_depth: 1,
        ..LoopbackConfig::default()
    }));
    transport.pause();
    let rt = Runtime::new(transport.clone(), RuntimeConfig::default()).unwrap();
    let stream = rt.create_stream(DEVICE).unwrap();
    let code = DevicePtr(0x8000_0000);

    let parked = rt.launch_kernel(stream, code, &[], false).unwrap();
    wait_until(|| transport.parked_count(DEVICE) == 1);
    let queued = rt.launch_kernel(stream, code, &[], false).unwrap();
    wait_until(|| rt.stats().queue_full_retries > 0);

    let abort = rt.abort_command(queued, WAIT).unwrap();
    assert!(rt.wait_for_event(abort, Duration::ZERO));
    assert!(rt.wait_for_event(queued, Duration::ZERO));
    let errors = rt.retrieve_errors(stream).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].event, queued);
    assert_eq!(errors[0].code, StreamErrorCode::Device(DeviceErrorCode::Aborted));
    assert_eq!(rt.stats().commands_cancelled, 1);

    transport.resume();
    assert!(rt.wait_for_event(parked, WAIT));
    let sent: Vec<u64> = transport.sent_log().iter().map(|r| r.tag).collect();
    assert_eq!(sent, vec![parked.0]);
}

#[test]
fn device_abort_completes_target_with_aborted_status() {
    init_tracing();
    let transport = Arc::new(LoopbackTransport::default());
    transport.pause();
    let rt = Runtime::new(transport.clone(), RuntimeConfig::default()).unwrap();
    let stream = rt.create_stream(DEVICE).unwrap();

    let target = rt.launch_kernel(stream, DevicePtr(0x8000_0000), &[], false).unwrap();
    wait_until(|| transport.parked_count(DEVICE) == 1);

    let abort = rt.abort_command(target, WAIT).unwrap();
    assert!(rt.wait_for_event(abort, WAIT));
    assert!(rt.wait_for_event(target, WAIT));
    assert_eq!(transport.parked_count(DEVICE), 0);

    let errors = rt.retrieve_errors(stream).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].event, target);
    assert_eq!(errors[0].code, StreamErrorCode::Device(DeviceErrorCode::Aborted));
    assert_eq!(errors[0].response_kind, Some(ResponseKind::KernelLaunchComplete));
    assert_eq!(rt.stats().aborts_issued, 1);

    assert!(matches!(
        rt.abort_command(EventId(u64::MAX), WAIT),
        Err(RuntimeError::EventWithoutStream(_))
    ));
    transport.resume();
    rt.destroy_stream(stream).unwrap();
}

#[test]
fn aborting_a_parked_copy_fails_its_completion() {
    init_tracing();
    let transport = Arc::new(LoopbackTransport::default());
    transport.pause();
    let rt = Runtime::new(transport.clone(), RuntimeConfig::default()).unwrap();
    let stream = rt.create_stream(DEVICE).unwrap();
    let size = 2u64 << 20;
    let dst = rt.allocate(DEVICE, size, 0).unwrap();
    let src = HostBuffer::from_vec(vec![0x5A; size as usize]);

    let copy = rt.copy_host_to_device(stream, &src, 0, dst, size, false).unwrap();
    // 1 MiB batches.
    wait_until(|| transport.parked_count(DEVICE) == 2);

    let abort = rt.abort_command(copy, WAIT).unwrap();
    assert!(rt.wait_for_event(abort, WAIT));
    assert!(rt.wait_for_event(copy, WAIT));
    assert_eq!(transport.parked_count(DEVICE), 0);
    assert_eq!(rt.stats().aborts_issued, 2);

    let errors = rt.retrieve_errors(stream).unwrap();
    assert!(errors
        .iter()
        .all(|e| e.code == StreamErrorCode::Device(DeviceErrorCode::Aborted)));
    let completion: Vec<&StreamError> = errors.iter().filter(|e| e.event == copy).collect();
    assert_eq!(completion.len(), 1);
    assert_eq!(completion[0].response_kind, None);
    assert_eq!(errors.len(), 3);

    transport.resume();
    assert!(rt.wait_for_stream(stream, WAIT).unwrap());
    assert_eq!(
        transport.read_dram(DEVICE, dst.0, size as usize).unwrap(),
        vec![0u8; size as usize]
    );
    let kinds: Vec<CommandKind> = transport.sent_log().iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![
            CommandKind::DmaWriteList,
            CommandKind::DmaWriteList,
            CommandKind::Abort,
            CommandKind::Abort
        ]
    );
    rt.destroy_stream(stream).unwrap();
}

#[test]
fn aborting_a_copy_twice_is_harmless() {
    init_tracing();
    let transport = Arc::new(LoopbackTransport::default());
    transport.pause();
    let rt = Runtime::new(transport.clone(), RuntimeConfig::default()).unwrap();
    let stream = rt.create_stream(DEVICE).unwrap();
    let src = HostBuffer::from_vec(vec![1; 4096]);

    let copy = rt
        .copy_host_to_device(stream, &src, 0, DevicePtr(0x8000_0000), 4096, false)
        .unwrap();
    wait_until(|| transport.parked_count(DEVICE) == 1);
    let first = rt.abort_command(copy, WAIT).unwrap();
    assert!(rt.wait_for_event(first, WAIT));
    assert!(rt.wait_for_event(copy, WAIT));
    // The completion has fired, so the copy no longer belongs to the stream.
    assert!(matches!(
        rt.abort_command(copy, WAIT),
        Err(RuntimeError::EventWithoutStream(_))
    ));
    transport.resume();
}
