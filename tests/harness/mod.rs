#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use rvax_runtime::transport::loopback::{LoopbackConfig, LoopbackTransport};
use rvax_runtime::{Runtime, RuntimeConfig};

pub const WAIT: Duration = Duration::from_secs(10);

/// A runtime over an in-process device, with the device kept around for inspection.
pub struct Pipeline {
    pub device: Arc<LoopbackTransport>,
    pub runtime: Runtime,
}

impl Pipeline {
    pub fn new(device: LoopbackConfig, config: RuntimeConfig) -> Self {
        init_tracing();
        let device = Arc::new(LoopbackTransport::new(device));
        let runtime = Runtime::new(device.clone(), config).expect("runtime start");
        Self { device, runtime }
    }

    pub fn default_device() -> Self {
        Self::new(LoopbackConfig::default(), RuntimeConfig::default())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic, position-dependent test bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}
