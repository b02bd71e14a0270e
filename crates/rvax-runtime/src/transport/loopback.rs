//! In-process device double.
//!
//! Each device owns a flat DRAM image. Commands are decoded with `rvax-protocol` and executed
//! against that image and the pinned regions handed out by this transport:
//!
//! - in *running* mode (the default) a command executes synchronously inside
//!   [`DeviceTransport::send_command`] and its response is queued immediately;
//! - in *paused* mode commands are parked per queue up to `queue_depth` entries (a full queue
//!   makes `send_command` return `Ok(false)`) until [`LoopbackTransport::resume`] or
//!   [`LoopbackTransport::step`] runs them.
//!
//! Abort commands are serviced out of band: they execute immediately even while paused and
//! retire a parked target with an `aborted` status.
//!
//! Every accepted command is appended to a sent log so tests can assert submission order.
//! Faults can be injected per tag or per command kind.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rvax_protocol::{
    decode_command, encode_response, CommandBody, CommandKind, DecodedCommand, DeviceErrorCode,
    DmaNode, ResponseKind, STATUS_SUCCESS,
};
use tracing::{debug, trace, warn};

use super::{
    check_range, DeviceLayout, DeviceTransport, DmaLimits, PinnedRegion, Readiness, TransportError,
};
use crate::types::{DeviceId, QueueId};

/// First bus address handed out for pinned host regions.
const PINNED_BASE: u64 = 0x10_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackConfig {
    pub devices: u32,
    pub layout: DeviceLayout,
    pub dma_limits: DmaLimits,
    /// Parked commands a queue accepts while paused.
    pub queue_depth: usize,
    /// Total pinned bytes the transport agrees to hand out.
    pub pinned_limit: Option<usize>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            layout: DeviceLayout {
                dram_base: 0x8000_0000,
                dram_size: 64 << 20,
                block_size: 4096,
                queue_count: 2,
            },
            dma_limits: DmaLimits {
                max_element_size: 256 << 10,
                max_element_count: 4,
            },
            queue_depth: 16,
            pinned_limit: None,
        }
    }
}

/// One accepted command, in acceptance order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentRecord {
    pub device: DeviceId,
    pub queue: QueueId,
    pub tag: u64,
    pub kind: CommandKind,
}

#[derive(Debug)]
struct LoopbackRegion {
    address: u64,
    writable: bool,
    data: Mutex<Vec<u8>>,
}

impl PinnedRegion for LoopbackRegion {
    fn dma_address(&self) -> u64 {
        self.address
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<(), TransportError> {
        let mut buf = self.data.lock();
        check_range(offset, data.len(), buf.len())?;
        buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), TransportError> {
        let buf = self.data.lock();
        check_range(offset, out.len(), buf.len())?;
        out.copy_from_slice(&buf[offset..offset + out.len()]);
        Ok(())
    }
}

struct DeviceState {
    dram: Vec<u8>,
    /// Per queue, with the acceptance sequence number.
    parked: Vec<VecDeque<(u64, DecodedCommand)>>,
    responses: VecDeque<Vec<u8>>,
}

impl DeviceState {
    fn has_submission_space(&self, depth: usize, paused: bool) -> bool {
        !paused || self.parked.iter().all(|q| q.len() < depth)
    }
}

struct State {
    devices: Vec<DeviceState>,
    paused: bool,
    regions: BTreeMap<u64, Arc<LoopbackRegion>>,
    next_pinned: u64,
    pinned_in_use: usize,
    next_seq: u64,
    sent: Vec<SentRecord>,
    tag_faults: HashMap<u64, u32>,
    kind_faults: HashMap<CommandKind, u32>,
    launches: Vec<rvax_protocol::KernelLaunch>,
}

pub struct LoopbackTransport {
    config: LoopbackConfig,
    state: Mutex<State>,
    ready: Condvar,
}

impl LoopbackTransport {
    pub fn new(config: LoopbackConfig) -> Self {
        let queues = config.layout.queue_count.max(1) as usize;
        let devices = (0..config.devices)
            .map(|_| DeviceState {
                dram: vec![0u8; config.layout.dram_size as usize],
                parked: (0..queues).map(|_| VecDeque::new()).collect(),
                responses: VecDeque::new(),
            })
            .collect();
        Self {
            config,
            state: Mutex::new(State {
                devices,
                paused: false,
                regions: BTreeMap::new(),
                next_pinned: PINNED_BASE,
                pinned_in_use: 0,
                next_seq: 0,
                sent: Vec::new(),
                tag_faults: HashMap::new(),
                kind_faults: HashMap::new(),
                launches: Vec::new(),
            }),
            ready: Condvar::new(),
        }
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    /// Stop executing commands; subsequent sends are parked.
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    /// Execute every parked command and return to running mode.
    pub fn resume(&self) {
        let mut st = self.state.lock();
        st.paused = false;
        for device in 0..st.devices.len() {
            while let Some(cmd) = pop_parked(&mut st, device) {
                execute(&mut st, &self.config, device, cmd);
            }
        }
        drop(st);
        self.ready.notify_all();
    }

    /// Execute up to `count` parked commands of `device` (oldest queue head first) without
    /// leaving paused mode. Returns how many ran.
    pub fn step(&self, device: DeviceId, count: usize) -> usize {
        let mut st = self.state.lock();
        let idx = device.0 as usize;
        if idx >= st.devices.len() {
            return 0;
        }
        let mut ran = 0;
        while ran < count {
            let Some(cmd) = pop_parked(&mut st, idx) else {
                break;
            };
            execute(&mut st, &self.config, idx, cmd);
            ran += 1;
        }
        drop(st);
        if ran > 0 {
            self.ready.notify_all();
        }
        ran
    }

    pub fn parked_count(&self, device: DeviceId) -> usize {
        let st = self.state.lock();
        st.devices
            .get(device.0 as usize)
            .map(|d| d.parked.iter().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    /// Complete the command tagged `tag` with `status` instead of executing it.
    pub fn fail_tag(&self, tag: u64, status: u32) {
        self.state.lock().tag_faults.insert(tag, status);
    }

    /// Complete every command of `kind` with `status` instead of executing it.
    pub fn fail_kind(&self, kind: CommandKind, status: u32) {
        self.state.lock().kind_faults.insert(kind, status);
    }

    pub fn clear_faults(&self) {
        let mut st = self.state.lock();
        st.tag_faults.clear();
        st.kind_faults.clear();
    }

    pub fn sent_log(&self) -> Vec<SentRecord> {
        self.state.lock().sent.clone()
    }

    pub fn clear_sent_log(&self) {
        self.state.lock().sent.clear();
    }

    /// Kernel launches executed so far.
    pub fn launches(&self) -> Vec<rvax_protocol::KernelLaunch> {
        self.state.lock().launches.clone()
    }

    pub fn pinned_in_use(&self) -> usize {
        self.state.lock().pinned_in_use
    }

    pub fn write_dram(&self, device: DeviceId, addr: u64, data: &[u8]) -> Result<(), TransportError> {
        let mut st = self.state.lock();
        let base = self.config.layout.dram_base;
        let dev = st
            .devices
            .get_mut(device.0 as usize)
            .ok_or(TransportError::UnknownDevice(device))?;
        let offset = dram_offset(base, addr, dev.dram.len(), data.len())?;
        dev.dram[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_dram(&self, device: DeviceId, addr: u64, len: usize) -> Result<Vec<u8>, TransportError> {
        let st = self.state.lock();
        let base = self.config.layout.dram_base;
        let dev = st
            .devices
            .get(device.0 as usize)
            .ok_or(TransportError::UnknownDevice(device))?;
        let offset = dram_offset(base, addr, dev.dram.len(), len)?;
        Ok(dev.dram[offset..offset + len].to_vec())
    }

    fn device_index(&self, device: DeviceId) -> Result<usize, TransportError> {
        if device.0 < self.config.devices {
            Ok(device.0 as usize)
        } else {
            Err(TransportError::UnknownDevice(device))
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

fn dram_offset(base: u64, addr: u64, dram_len: usize, len: usize) -> Result<usize, TransportError> {
    let offset = addr.checked_sub(base).ok_or(TransportError::OutOfRange {
        offset: 0,
        len,
        capacity: dram_len,
    })?;
    let offset = usize::try_from(offset).map_err(|_| TransportError::OutOfRange {
        offset: usize::MAX,
        len,
        capacity: dram_len,
    })?;
    check_range(offset, len, dram_len)?;
    Ok(offset)
}

fn pop_parked(st: &mut State, device: usize) -> Option<DecodedCommand> {
    // Queues run in acceptance order across the whole device.
    let dev = &mut st.devices[device];
    let oldest = dev
        .parked
        .iter()
        .enumerate()
        .filter_map(|(i, q)| q.front().map(|(seq, _)| (*seq, i)))
        .min()?
        .1;
    dev.parked[oldest].pop_front().map(|(_, cmd)| cmd)
}

fn find_region(st: &State, addr: u64, len: usize) -> Option<(Arc<LoopbackRegion>, usize)> {
    let (_, region) = st.regions.range(..=addr).next_back()?;
    let offset = usize::try_from(addr - region.address).ok()?;
    check_range(offset, len, region.len()).ok()?;
    Some((Arc::clone(region), offset))
}

fn run_dma(st: &mut State, base: u64, device: usize, nodes: &[DmaNode], to_device: bool) -> u32 {
    for node in nodes {
        let len = node.size as usize;
        let (host_addr, dev_addr) = if to_device {
            (node.src, node.dst)
        } else {
            (node.dst, node.src)
        };
        let Some((region, region_offset)) = find_region(st, host_addr, len) else {
            return invalid_address();
        };
        let dram = &mut st.devices[device].dram;
        let Ok(dram_at) = dram_offset(base, dev_addr, dram.len(), len) else {
            return invalid_address();
        };
        let result = if to_device {
            region.read(region_offset, &mut dram[dram_at..dram_at + len])
        } else if !region.writable {
            Err(TransportError::ReadOnly(region.address))
        } else {
            region.write(region_offset, &dram[dram_at..dram_at + len])
        };
        if result.is_err() {
            return invalid_address();
        }
    }
    STATUS_SUCCESS
}

fn invalid_address() -> u32 {
    DeviceErrorCode::DmaInvalidAddress
        .status()
        .unwrap_or(u32::MAX)
}

fn execute(st: &mut State, config: &LoopbackConfig, device: usize, cmd: DecodedCommand) {
    let tag = cmd.header.tag;
    let kind = cmd.header.kind;
    let injected = st
        .tag_faults
        .get(&tag)
        .or_else(|| st.kind_faults.get(&kind))
        .copied();

    let status = match (injected, &cmd.body) {
        (Some(status), _) => status,
        (None, CommandBody::DmaWriteList(nodes)) => {
            run_dma(st, config.layout.dram_base, device, nodes, true)
        }
        (None, CommandBody::DmaReadList(nodes)) => {
            run_dma(st, config.layout.dram_base, device, nodes, false)
        }
        (None, CommandBody::KernelLaunch(launch)) => {
            st.launches.push(launch.clone());
            STATUS_SUCCESS
        }
        (None, CommandBody::Abort { target_tag }) => {
            let target_tag = *target_tag;
            let dev = &mut st.devices[device];
            let mut retired = None;
            for queue in dev.parked.iter_mut() {
                if let Some(pos) = queue.iter().position(|(_, c)| c.header.tag == target_tag) {
                    retired = queue.remove(pos).map(|(_, c)| c);
                    break;
                }
            }
            if let Some(target) = retired {
                let aborted = DeviceErrorCode::Aborted.status().unwrap_or(u32::MAX);
                dev.responses.push_back(encode_response(
                    ResponseKind::completing(target.header.kind),
                    target_tag,
                    aborted,
                ));
            }
            STATUS_SUCCESS
        }
    };

    if status != STATUS_SUCCESS {
        debug!(device, tag, ?kind, status, "loopback command failed");
    }
    st.devices[device]
        .responses
        .push_back(encode_response(ResponseKind::completing(kind), tag, status));
}

impl DeviceTransport for LoopbackTransport {
    fn device_count(&self) -> u32 {
        self.config.devices
    }

    fn device_layout(&self, device: DeviceId) -> Result<DeviceLayout, TransportError> {
        self.device_index(device)?;
        Ok(self.config.layout)
    }

    fn dma_limits(&self, device: DeviceId) -> Result<DmaLimits, TransportError> {
        self.device_index(device)?;
        Ok(self.config.dma_limits)
    }

    fn send_command(
        &self,
        device: DeviceId,
        queue: QueueId,
        command: &[u8],
    ) -> Result<bool, TransportError> {
        let idx = self.device_index(device)?;
        if queue.0 >= self.config.layout.queue_count.max(1) {
            return Err(TransportError::UnknownQueue {
                device,
                queue: queue.0,
            });
        }
        let cmd = decode_command(command)
            .map_err(|err| TransportError::Device(device, format!("undecodable command: {err}")))?;

        let mut guard = self.state.lock();
        let st = &mut *guard;
        let record = SentRecord {
            device,
            queue,
            tag: cmd.header.tag,
            kind: cmd.header.kind,
        };
        if st.paused && cmd.header.kind != CommandKind::Abort {
            let parked = &mut st.devices[idx].parked[queue.0 as usize];
            if parked.len() >= self.config.queue_depth {
                trace!(%device, queue = queue.0, tag = record.tag, "loopback queue full");
                return Ok(false);
            }
            parked.push_back((st.next_seq, cmd));
            st.next_seq += 1;
            st.sent.push(record);
            return Ok(true);
        }

        st.sent.push(record);
        execute(st, &self.config, idx, cmd);
        drop(guard);
        self.ready.notify_all();
        Ok(true)
    }

    fn receive_response(&self, device: DeviceId) -> Result<Option<Vec<u8>>, TransportError> {
        let idx = self.device_index(device)?;
        let response = self.state.lock().devices[idx].responses.pop_front();
        Ok(response)
    }

    fn wait_for_readiness_events(
        &self,
        device: DeviceId,
        interest: Readiness,
        timeout: Duration,
    ) -> Readiness {
        let Ok(idx) = self.device_index(device) else {
            return Readiness::empty();
        };
        let deadline = Instant::now().checked_add(timeout);
        let mut st = self.state.lock();
        loop {
            let dev = &st.devices[idx];
            let mut ready = Readiness::empty();
            if dev.has_submission_space(self.config.queue_depth, st.paused) {
                ready |= Readiness::SUBMISSION;
            }
            if !dev.responses.is_empty() {
                ready |= Readiness::COMPLETION;
            }
            if ready.intersects(interest) {
                return ready;
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut st, deadline).timed_out() {
                        let dev = &st.devices[idx];
                        let mut ready = Readiness::empty();
                        if dev.has_submission_space(self.config.queue_depth, st.paused) {
                            ready |= Readiness::SUBMISSION;
                        }
                        if !dev.responses.is_empty() {
                            ready |= Readiness::COMPLETION;
                        }
                        return ready & interest;
                    }
                }
                None => self.ready.wait(&mut st),
            }
        }
    }

    fn allocate_pinned_buffer(
        &self,
        device: DeviceId,
        size: usize,
        writable: bool,
    ) -> Result<Arc<dyn PinnedRegion>, TransportError> {
        self.device_index(device)?;
        let mut st = self.state.lock();
        if let Some(limit) = self.config.pinned_limit {
            if st.pinned_in_use.saturating_add(size) > limit {
                warn!(%device, size, in_use = st.pinned_in_use, limit, "pinned allocation refused");
                return Err(TransportError::PinnedAllocationFailed { device, size });
            }
        }
        let address = st.next_pinned;
        // Keep regions apart so an overrun never lands in a neighbour.
        st.next_pinned += (size as u64).next_multiple_of(1 << 20) + (1 << 20);
        st.pinned_in_use += size;
        let region = Arc::new(LoopbackRegion {
            address,
            writable,
            data: Mutex::new(vec![0u8; size]),
        });
        st.regions.insert(address, Arc::clone(&region));
        debug!(%device, size, address, "pinned region allocated");
        Ok(region)
    }

    fn free_pinned_buffer(
        &self,
        device: DeviceId,
        region: Arc<dyn PinnedRegion>,
    ) -> Result<(), TransportError> {
        self.device_index(device)?;
        let address = region.dma_address();
        let mut st = self.state.lock();
        let owned = st
            .regions
            .remove(&address)
            .ok_or(TransportError::ForeignRegion(address))?;
        st.pinned_in_use -= owned.len();
        Ok(())
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("LoopbackTransport")
            .field("devices", &self.config.devices)
            .field("paused", &st.paused)
            .field("sent", &st.sent.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvax_protocol::{decode_response, encode_abort, encode_dma_write_list, CommandFlags};

    const DEV: DeviceId = DeviceId(0);
    const Q0: QueueId = QueueId(0);

    fn drain(t: &LoopbackTransport) -> Vec<rvax_protocol::ResponseHeader> {
        let mut out = Vec::new();
        while let Some(raw) = t.receive_response(DEV).unwrap() {
            out.push(decode_response(&raw).unwrap());
        }
        out
    }

    #[test]
    fn dma_write_lands_in_dram() {
        let t = LoopbackTransport::default();
        let region = t.allocate_pinned_buffer(DEV, 64, true).unwrap();
        region.write(0, b"hello loopback").unwrap();

        let node = DmaNode {
            src: region.dma_address(),
            dst: 0x8000_1000,
            size: 14,
        };
        assert!(t
            .send_command(DEV, Q0, &encode_dma_write_list(5, CommandFlags::empty(), &[node]))
            .unwrap());
        assert_eq!(t.read_dram(DEV, 0x8000_1000, 14).unwrap(), b"hello loopback");

        let responses = drain(&t);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].tag, 5);
        assert!(responses[0].is_success());
    }

    #[test]
    fn dma_to_unknown_host_address_fails() {
        let t = LoopbackTransport::default();
        let node = DmaNode {
            src: 0xdead_0000,
            dst: 0x8000_0000,
            size: 4,
        };
        t.send_command(DEV, Q0, &encode_dma_write_list(1, CommandFlags::empty(), &[node]))
            .unwrap();
        let responses = drain(&t);
        assert_eq!(
            DeviceErrorCode::from_status(responses[0].status),
            Some(DeviceErrorCode::DmaInvalidAddress)
        );
    }

    #[test]
    fn paused_queue_fills_up() {
        let t = LoopbackTransport::new(LoopbackConfig {
            queue_depth: 2,
            ..LoopbackConfig::default()
        });
        t.pause();
        let cmd = |tag| encode_dma_write_list(tag, CommandFlags::empty(), &[]);
        assert!(t.send_command(DEV, Q0, &cmd(1)).unwrap());
        assert!(t.send_command(DEV, Q0, &cmd(2)).unwrap());
        assert!(!t.send_command(DEV, Q0, &cmd(3)).unwrap());
        assert!(!t
            .wait_for_readiness_events(DEV, Readiness::SUBMISSION, Duration::ZERO)
            .contains(Readiness::SUBMISSION));

        assert_eq!(t.step(DEV, 1), 1);
        assert!(t.send_command(DEV, Q0, &cmd(3)).unwrap());
        t.resume();
        let tags: Vec<u64> = drain(&t).iter().map(|r| r.tag).collect();
        assert_eq!(tags, vec![1, 2, 3]);
    }

    #[test]
    fn abort_retires_parked_target() {
        let t = LoopbackTransport::default();
        t.pause();
        t.send_command(DEV, Q0, &encode_dma_write_list(7, CommandFlags::empty(), &[]))
            .unwrap();
        t.send_command(DEV, Q0, &encode_abort(8, 7)).unwrap();
        assert_eq!(t.parked_count(DEV), 0);

        let responses = drain(&t);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].tag, 7);
        assert_eq!(
            DeviceErrorCode::from_status(responses[0].status),
            Some(DeviceErrorCode::Aborted)
        );
        assert_eq!(responses[1].kind, ResponseKind::AbortComplete);
        assert!(responses[1].is_success());
    }

    #[test]
    fn injected_fault_overrides_execution() {
        let t = LoopbackTransport::default();
        t.fail_tag(3, 0x0200);
        t.send_command(DEV, Q0, &encode_dma_write_list(3, CommandFlags::empty(), &[]))
            .unwrap();
        assert_eq!(drain(&t)[0].status, 0x0200);
    }

    #[test]
    fn pinned_limit_is_enforced() {
        let t = LoopbackTransport::new(LoopbackConfig {
            pinned_limit: Some(1000),
            ..LoopbackConfig::default()
        });
        let a = t.allocate_pinned_buffer(DEV, 600, true).unwrap();
        assert!(t.allocate_pinned_buffer(DEV, 600, true).is_err());
        t.free_pinned_buffer(DEV, a).unwrap();
        assert_eq!(t.pinned_in_use(), 0);
        t.allocate_pinned_buffer(DEV, 600, true).unwrap();
    }
}
