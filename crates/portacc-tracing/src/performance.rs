//! Performance instrumentation for queue tasks.
//!
//! Backends time kernel launches, copies, fills and allocations through the
//! helpers in this module. Every helper emits a `debug`-level event, and the
//! copy engine additionally accumulates per-direction byte counters that can
//! be dumped as JSON with [`transfer_stats_json`].
//!
//! ```rust
//! use portacc_tracing::performance::{record_transfer, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("pitched_copy", Some(100));
//! record_transfer(4096, "host_to_device", 12);
//! drop(span); // logged only if it took at least 100μs
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use serde_json::{json, Value as JsonValue};
use tracing::Level;

static PERF_ENABLED: AtomicBool = AtomicBool::new(true);
// u64::MAX means "no threshold".
static PERF_THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

/// Apply process-wide performance tracing settings.
pub fn set_performance_options(enabled: bool, threshold_us: Option<u64>) {
    PERF_ENABLED.store(enabled, Ordering::Relaxed);
    PERF_THRESHOLD_US.store(threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

/// Whether performance spans currently emit their completion event.
pub fn performance_enabled() -> bool {
    PERF_ENABLED.load(Ordering::Relaxed)
}

fn global_threshold() -> Option<u64> {
    match PERF_THRESHOLD_US.load(Ordering::Relaxed) {
        u64::MAX => None,
        t => Some(t),
    }
}

/// RAII guard that times an operation and logs it on drop.
///
/// The per-span threshold takes precedence over the process-wide one set via
/// [`set_performance_options`].
pub struct PerformanceSpan {
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Create a new `debug`-level performance span.
    pub fn new(span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, span_name, threshold_us)
    }

    /// Create a performance span at the specified tracing level.
    pub fn with_level(level: Level, span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let span_name = span_name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %span_name),
            Level::DEBUG => tracing::debug_span!("perf", name = %span_name),
            Level::INFO => tracing::info_span!("perf", name = %span_name),
            Level::WARN => tracing::warn_span!("perf", name = %span_name),
            Level::ERROR => tracing::error_span!("perf", name = %span_name),
        };

        Self {
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Enter this span's context.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    /// The underlying `tracing` span, for recording extra fields.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !performance_enabled() {
            return;
        }
        let elapsed_us = self.elapsed_us();
        let threshold = self.threshold_us.or_else(global_threshold);
        if threshold.is_none_or(|t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Record a device or host allocation.
pub fn record_allocation(size_bytes: usize, device: &str, pitch_bytes: usize, duration_us: u64) {
    tracing::debug!(
        event = "allocation",
        size_bytes,
        size_kb = size_bytes as f64 / 1024.0,
        device,
        pitch_bytes,
        duration_us,
        "memory_allocation"
    );
}

/// Record a kernel launch with its grid shape.
pub fn record_launch(kernel: &str, acc: &str, grid_blocks: usize, block_threads: usize, duration_us: u64) {
    let threads = grid_blocks.saturating_mul(block_threads);
    let threads_per_us = if duration_us > 0 {
        threads as f64 / duration_us as f64
    } else {
        0.0
    };
    tracing::debug!(
        event = "launch",
        kernel,
        acc,
        grid_blocks,
        block_threads,
        duration_us,
        threads_per_us,
        "kernel_launch"
    );
}

// ----------------------------------------------------------------------------
// Transfer accounting
// ----------------------------------------------------------------------------

/// Directions tracked by the transfer counters.
const DIRECTIONS: [&str; 5] = [
    "host_to_host",
    "host_to_device",
    "device_to_host",
    "device_to_device",
    "peer",
];

struct TransferCounter {
    bytes: AtomicU64,
    count: AtomicU64,
    duration_us: AtomicU64,
}

impl TransferCounter {
    const fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            count: AtomicU64::new(0),
            duration_us: AtomicU64::new(0),
        }
    }
}

static TRANSFERS: [TransferCounter; 5] = [
    TransferCounter::new(),
    TransferCounter::new(),
    TransferCounter::new(),
    TransferCounter::new(),
    TransferCounter::new(),
];

/// Record a memory transfer and add it to the per-direction counters.
///
/// `direction` should be one of `host_to_host`, `host_to_device`,
/// `device_to_host`, `device_to_device` or `peer`; other values are logged
/// but not counted.
pub fn record_transfer(bytes: usize, direction: &str, duration_us: u64) {
    let bandwidth_gbps = if duration_us > 0 {
        bytes as f64 / (duration_us as f64 * 1000.0)
    } else {
        0.0
    };

    if let Some(slot) = DIRECTIONS.iter().position(|d| *d == direction) {
        let counter = &TRANSFERS[slot];
        counter.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        counter.count.fetch_add(1, Ordering::Relaxed);
        counter.duration_us.fetch_add(duration_us, Ordering::Relaxed);
    }

    tracing::debug!(
        event = "transfer",
        bytes,
        direction,
        duration_us,
        bandwidth_gbps,
        "memory_transfer"
    );
}

/// Snapshot of the transfer counters as a JSON object keyed by direction.
pub fn transfer_stats_json() -> JsonValue {
    let mut object = serde_json::Map::new();
    for (direction, counter) in DIRECTIONS.iter().zip(TRANSFERS.iter()) {
        object.insert(
            (*direction).to_string(),
            json!({
                "bytes": counter.bytes.load(Ordering::Relaxed),
                "count": counter.count.load(Ordering::Relaxed),
                "duration_us": counter.duration_us.load(Ordering::Relaxed),
            }),
        );
    }
    JsonValue::Object(object)
}

/// Reset all transfer counters to zero.
pub fn reset_transfer_stats() {
    for counter in &TRANSFERS {
        counter.bytes.store(0, Ordering::Relaxed);
        counter.count.store(0, Ordering::Relaxed);
        counter.duration_us.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_performance_span_elapsed() {
        let span = PerformanceSpan::new("sleepy", None);
        thread::sleep(Duration::from_millis(2));
        assert!(span.elapsed_us() >= 2_000);
    }

    #[test]
    fn test_performance_span_levels() {
        let _trace = PerformanceSpan::with_level(Level::TRACE, "t", Some(10));
        let _info = PerformanceSpan::with_level(Level::INFO, "i", None);
    }

    #[test]
    fn test_transfer_counters_accumulate() {
        // Other tests may record transfers concurrently; only check growth.
        let before = transfer_stats_json()["peer"]["bytes"].as_u64().unwrap_or(0);
        record_transfer(512, "peer", 3);
        record_transfer(512, "peer", 1);
        let after = transfer_stats_json()["peer"]["bytes"].as_u64().unwrap_or(0);
        assert!(after >= before + 1024);
    }

    #[test]
    fn test_unknown_direction_is_not_counted() {
        record_transfer(64, "sideways", 1);
        let stats = transfer_stats_json();
        assert!(stats.get("sideways").is_none());
        assert_eq!(stats.as_object().map(|o| o.len()), Some(DIRECTIONS.len()));
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_allocation(4096, "emu:0", 256, 5);
        record_launch("saxpy", "AccCpuSerial<1>", 4, 1, 0);
    }
}
