mod harness;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use harness::{pattern, wait_until, Pipeline, WAIT};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rvax_protocol::CommandKind;
use rvax_runtime::transport::loopback::{LoopbackConfig, LoopbackTransport};
use rvax_runtime::{
    DeviceId, DeviceToHostOp, EventId, HostBuffer, HostToDeviceOp, Runtime, RuntimeConfig,
};

const DEVICE: DeviceId = DeviceId(0);
const MIB: u64 = 1 << 20;

#[test]
fn host_device_round_trip_on_every_queue() {
    let pipeline = Pipeline::default_device();
    let rt = &pipeline.runtime;
    let queues = rt.device_layout(DEVICE).unwrap().queue_count;

    let mut work = Vec::new();
    for i in 0..queues as u8 * 2 {
        let stream = rt.create_stream(DEVICE).unwrap();
        let size = 3 * MIB + 1234 * i as u64;
        let data = pattern(size as usize, i);
        let dev = rt.allocate(DEVICE, size, 0).unwrap();
        let upload = rt
            .copy_host_to_device(stream, &HostBuffer::from_vec(data.clone()), 0, dev, size, false)
            .unwrap();
        work.push((stream, dev, size, data, upload));
    }

    for (stream, dev, size, data, upload) in work {
        assert!(rt.wait_for_event(upload, WAIT));
        let back = HostBuffer::zeroed(size as usize);
        let download = rt
            .copy_device_to_host(stream, dev, &back, 0, size, true)
            .unwrap();
        assert!(rt.wait_for_stream(stream, WAIT).unwrap());
        assert!(rt.wait_for_event(download, Duration::ZERO));
        assert_eq!(back.to_vec(), data);
        assert!(rt.retrieve_errors(stream).unwrap().is_empty());

        rt.free(DEVICE, dev).unwrap();
        rt.destroy_stream(stream).unwrap();
    }
    assert_eq!(rt.outstanding_events(), 0);
}

#[test]
fn scatter_then_gather_through_dma_lists() {
    let pipeline = Pipeline::default_device();
    let rt = &pipeline.runtime;
    let stream = rt.create_stream(DEVICE).unwrap();
    let base = rt.allocate(DEVICE, MIB, 0).unwrap();

    let src = HostBuffer::from_vec(pattern(64 * 1024, 9));
    let ranges = [(0usize, 0u64, 4096u64), (8192, 64 * 1024, 1000), (20_000, 512 * 1024, 30_000)];
    let scatter = ranges
        .iter()
        .map(|&(src_offset, dev_offset, size)| HostToDeviceOp {
            src: src.clone(),
            src_offset,
            dst: base.offset(dev_offset),
            size,
        })
        .collect();
    let up = rt.copy_host_to_device_list(stream, scatter, false).unwrap();
    assert!(rt.wait_for_event(up, WAIT));

    let dst = HostBuffer::zeroed(64 * 1024);
    let gather = ranges
        .iter()
        .map(|&(host_offset, dev_offset, size)| DeviceToHostOp {
            src: base.offset(dev_offset),
            dst: dst.clone(),
            dst_offset: host_offset,
            size,
        })
        .collect();
    let down = rt.copy_device_to_host_list(stream, gather, false).unwrap();
    assert!(rt.wait_for_event(down, WAIT));

    let expected = src.to_vec();
    let actual = dst.to_vec();
    for (offset, _, size) in ranges {
        let range = offset..offset + size as usize;
        assert_eq!(&actual[range.clone()], &expected[range]);
    }
    // One DMA list command per direction.
    let kinds: Vec<CommandKind> = pipeline.device.sent_log().iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![CommandKind::DmaWriteList, CommandKind::DmaReadList]);
}

#[test]
fn launch_after_a_copy_reaches_the_device_behind_every_batch() {
    let pipeline = Pipeline::default_device();
    let rt = &pipeline.runtime;
    let stream = rt.create_stream(DEVICE).unwrap();
    let size = 16 * MIB;
    let dst = rt.allocate(DEVICE, size, 0).unwrap();
    let src = HostBuffer::from_vec(pattern(size as usize, 4));

    let copy = rt.copy_host_to_device(stream, &src, 0, dst, size, false).unwrap();
    let launch = rt.launch_kernel(stream, dst, &[0], true).unwrap();
    assert!(rt.wait_for_event(launch, WAIT));
    assert!(rt.wait_for_event(copy, WAIT));

    let kinds: Vec<CommandKind> = pipeline.device.sent_log().iter().map(|r| r.kind).collect();
    let launch_at = kinds
        .iter()
        .position(|k| *k == CommandKind::KernelLaunch)
        .unwrap();
    assert_eq!(launch_at, kinds.len() - 1, "sent order: {kinds:?}");
    assert!(launch_at >= 16);
    assert!(kinds[..launch_at].iter().all(|k| *k == CommandKind::DmaWriteList));
    assert_eq!(
        pipeline.device.read_dram(DEVICE, dst.0, size as usize).unwrap(),
        src.to_vec()
    );
}

#[test]
fn load_code_then_launch_reports_every_sent_command() {
    let pipeline = Pipeline::default_device();
    let rt = &pipeline.runtime;
    let sent: Arc<Mutex<Vec<EventId>>> = Arc::default();
    let sink = sent.clone();
    rt.set_on_command_sent(move |device, tag| {
        assert_eq!(device, DEVICE);
        sink.lock().push(tag);
    });

    let stream = rt.create_stream(DEVICE).unwrap();
    let image = pattern(10_000, 3);
    let (code, loaded) = rt.load_code(stream, &image).unwrap();
    assert!(rt.wait_for_event(loaded, WAIT));
    let launch = rt.launch_kernel(stream, code, b"args", true).unwrap();
    assert!(rt.wait_for_event(launch, WAIT));

    let launches = pipeline.device.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].code_address, code.0);
    assert_eq!(launches[0].args, b"args".to_vec());
    assert_eq!(
        pipeline.device.read_dram(DEVICE, code.0, image.len()).unwrap(),
        image
    );

    // One DMA batch for the image plus the launch.
    wait_until("sent callbacks", || sent.lock().len() == 2);
    let tags: HashSet<EventId> = sent.lock().iter().copied().collect();
    assert!(tags.contains(&launch));
    assert_eq!(rt.stats().commands_sent, 2);
}

#[test]
fn dropping_the_runtime_mid_transfer_releases_pinned_memory() {
    harness::init_tracing();
    let device = Arc::new(LoopbackTransport::new(LoopbackConfig::default()));
    device.pause();
    let config = RuntimeConfig::from_json_str(
        r#"{ "staging_overcommit_factor": 1, "throw_on_missing_event": true }"#,
    )
    .unwrap();
    let rt = Runtime::new(device.clone(), config).unwrap();
    assert!(device.pinned_in_use() > 0);

    let stream = rt.create_stream(DEVICE).unwrap();
    let size = 3 * MIB;
    let src = HostBuffer::from_vec(pattern(size as usize, 1));
    let dst = rt.allocate(DEVICE, size, 0).unwrap();
    let event = rt.copy_host_to_device(stream, &src, 0, dst, size, false).unwrap();
    wait_until("first batch parked", || device.parked_count(DEVICE) == 1);
    assert!(!rt.wait_for_event(event, Duration::from_millis(20)));

    drop(rt);
    assert_eq!(device.pinned_in_use(), 0);
}
