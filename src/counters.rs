//! Monotonic byte counters exported under a filesystem-like namespace.
//!
//! Counter increments are relaxed atomics; readers get an advisory
//! snapshot, not a consistent cut.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

pub const UDP_RX_BYTES: &str = "/inet/socket/udp/rx_bytes";
pub const UDP_TX_BYTES: &str = "/inet/socket/udp/tx_bytes";
pub const TCP_ACCEPTS: &str = "/inet/socket/tcp/accepts";
pub const TCP_RX_BYTES: &str = "/inet/socket/tcp/rx_bytes";
pub const TCP_TX_BYTES: &str = "/inet/socket/tcp/tx_bytes";
pub const RAW_RX_BYTES: &str = "/inet/socket/raw/rx_bytes";
pub const RAW_TX_BYTES: &str = "/inet/socket/raw/tx_bytes";

#[derive(Debug)]
pub(crate) struct Counter {
    path: &'static str,
    value: AtomicU64,
}

impl Counter {
    const fn new(path: &'static str) -> Self {
        Self {
            path,
            value: AtomicU64::new(0),
        }
    }

    pub(crate) fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub(crate) struct Registry {
    pub udp_rx_bytes: Counter,
    pub udp_tx_bytes: Counter,
    pub tcp_accepts: Counter,
    pub tcp_rx_bytes: Counter,
    pub tcp_tx_bytes: Counter,
    pub raw_rx_bytes: Counter,
    pub raw_tx_bytes: Counter,
}

impl Registry {
    fn all(&self) -> [&Counter; 7] {
        [
            &self.udp_rx_bytes,
            &self.udp_tx_bytes,
            &self.tcp_accepts,
            &self.tcp_rx_bytes,
            &self.tcp_tx_bytes,
            &self.raw_rx_bytes,
            &self.raw_tx_bytes,
        ]
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// The process-wide counter set. The first call registers the counters;
/// later calls return the same set.
pub(crate) fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        udp_rx_bytes: Counter::new(UDP_RX_BYTES),
        udp_tx_bytes: Counter::new(UDP_TX_BYTES),
        tcp_accepts: Counter::new(TCP_ACCEPTS),
        tcp_rx_bytes: Counter::new(TCP_RX_BYTES),
        tcp_tx_bytes: Counter::new(TCP_TX_BYTES),
        raw_rx_bytes: Counter::new(RAW_RX_BYTES),
        raw_tx_bytes: Counter::new(RAW_TX_BYTES),
    })
}

/// Current value of the counter at `path`, if the set is registered.
pub fn get(path: &str) -> Option<u64> {
    let reg = REGISTRY.get()?;
    reg.all().iter().find(|c| c.path == path).map(|c| c.get())
}

/// All registered counters with their current values.
pub fn snapshot() -> Vec<(&'static str, u64)> {
    match REGISTRY.get() {
        Some(reg) => reg.all().iter().map(|c| (c.path, c.get())).collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent() {
        let first = registry() as *const Registry;
        let second = registry() as *const Registry;
        assert_eq!(first, second);
        assert_eq!(snapshot().len(), 7);
    }

    #[test]
    fn counters_are_monotonic() {
        let before = registry().udp_rx_bytes.get();
        registry().udp_rx_bytes.add(16);
        let after = get(UDP_RX_BYTES).unwrap();
        assert!(after >= before + 16);
    }

    #[test]
    fn lookup_by_path() {
        registry();
        for path in [
            UDP_RX_BYTES,
            UDP_TX_BYTES,
            TCP_ACCEPTS,
            TCP_RX_BYTES,
            TCP_TX_BYTES,
            RAW_RX_BYTES,
            RAW_TX_BYTES,
        ] {
            assert!(get(path).is_some(), "missing counter {path}");
        }
        assert_eq!(get("/inet/socket/tcp/bogus"), None);
    }
}
