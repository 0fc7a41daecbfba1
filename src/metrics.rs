//! Per-channel counters and gauges
//!
//! The same atomics-counter pattern as the pipeline health tracker this was
//! lifted from: every field is lock-free, `summary()` takes a consistent-enough
//! snapshot for the periodic log line and the status RPC.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Cheap observation histogram: count, sum and max. Enough to spot outliers
/// in the summary line without a full bucket set.
#[derive(Debug, Default)]
pub struct Observation {
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Observation {
    pub fn record(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / count as f64
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }
}

/// Counters for one playout instance.
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    pub frames_decoded_total: AtomicU64,
    pub frames_dropped_total: AtomicU64,
    pub frames_emitted_total: AtomicU64,
    pub decode_failure_count: AtomicU64,
    pub buffer_underrun_total: AtomicU64,
    pub bytes_dropped_total: AtomicU64,

    pub buffer_depth_frames: AtomicU64,
    /// Gap since the last emitted frame, microseconds.
    pub frame_gap_us: AtomicI64,

    pub switch_boundary_violations_total: AtomicU64,
    pub content_deficit_total: AtomicU64,
    pub pad_while_depth_high_total: AtomicU64,
    pub equilibrium_warnings_total: AtomicU64,

    pub decode_latency_us: Observation,
    pub switch_boundary_delta_ms: Observation,
    pub content_deficit_duration_ms: Observation,
}

impl ChannelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decoded(&self) {
        self.frames_decoded_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self) {
        self.frames_emitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_underrun(&self) {
        self.buffer_underrun_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_dropped(&self, n: u64) {
        self.bytes_dropped_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_buffer_depth(&self, depth: usize) {
        self.buffer_depth_frames.store(depth as u64, Ordering::Relaxed);
    }

    pub fn record_boundary_delta(&self, delta_ms: u64, violation: bool) {
        self.switch_boundary_delta_ms.record(delta_ms);
        if violation {
            self.switch_boundary_violations_total
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_deficit(&self, duration_ms: u64) {
        self.content_deficit_total.fetch_add(1, Ordering::Relaxed);
        self.content_deficit_duration_ms.record(duration_ms);
    }

    pub fn record_pad_while_depth_high(&self) {
        self.pad_while_depth_high_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_equilibrium_warning(&self) {
        self.equilibrium_warnings_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            frames_decoded: self.frames_decoded_total.load(Ordering::Relaxed),
            frames_emitted: self.frames_emitted_total.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped_total.load(Ordering::Relaxed),
            decode_failures: self.decode_failure_count.load(Ordering::Relaxed),
            buffer_underruns: self.buffer_underrun_total.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped_total.load(Ordering::Relaxed),
            buffer_depth: self.buffer_depth_frames.load(Ordering::Relaxed),
            boundary_violations: self.switch_boundary_violations_total.load(Ordering::Relaxed),
            boundary_delta_ms_mean: self.switch_boundary_delta_ms.mean(),
            content_deficits: self.content_deficit_total.load(Ordering::Relaxed),
            pad_while_depth_high: self.pad_while_depth_high_total.load(Ordering::Relaxed),
            equilibrium_warnings: self.equilibrium_warnings_total.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot for logs and the status RPC.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub frames_decoded: u64,
    pub frames_emitted: u64,
    pub frames_dropped: u64,
    pub decode_failures: u64,
    pub buffer_underruns: u64,
    pub bytes_dropped: u64,
    pub buffer_depth: u64,
    pub boundary_violations: u64,
    pub boundary_delta_ms_mean: f64,
    pub content_deficits: u64,
    pub pad_while_depth_high: u64,
    pub equilibrium_warnings: u64,
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} decoded, {} emitted, {} dropped, {} decode failures, {} underruns, depth {}, {} deficits, {} boundary violations",
            self.frames_decoded,
            self.frames_emitted,
            self.frames_dropped,
            self.decode_failures,
            self.buffer_underruns,
            self.buffer_depth,
            self.content_deficits,
            self.boundary_violations,
        )
    }
}
