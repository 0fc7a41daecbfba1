//! Frame producers
//!
//! A producer decodes (or synthesizes) media into the channel's program
//! format and pushes MT-stamped frames at the ring buffer, under the decode
//! gate. The engine owns producers through [`bus::ProducerBus`]; upward
//! signals travel as [`ProducerEvent`]s on a channel, never as back-references.

pub mod black;
pub mod bus;
pub mod file;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::Result;

/// One unit of execution intent from the scheduler.
///
/// `hard_stop_time_ms` is a guardrail, not a trigger; the clock-driven switch
/// at `target_boundary_time_ms` is what ends the predecessor segment.
/// `planned_frame_count` is planning authority; delivery may fall short
/// (early EOF) or be truncated at the count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub segment_id: u64,
    pub asset_path: PathBuf,
    pub start_offset_ms: i64,
    /// Wall-clock UTC ms. Guardrail only.
    pub hard_stop_time_ms: i64,
    /// Wall-clock UTC ms at which this segment's predecessor must terminate.
    pub target_boundary_time_ms: i64,
    pub planned_frame_count: u64,
}

/// Flags the engine flips on a running producer, consulted at defined points
/// in the decode loop (pre-decode, pre-push).
#[derive(Debug, Default)]
pub struct ProducerControl {
    /// Silently drop all pushes without stopping decode. Set on the outgoing
    /// producer during a swap so it cannot touch the new segment's mapping.
    write_barrier: AtomicBool,
    /// Shadow decode: cache the first frame, publish nothing.
    shadow: AtomicBool,
    stop: AtomicBool,
    frames_delivered: AtomicU64,
}

impl ProducerControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_write_barrier(&self, on: bool) {
        self.write_barrier.store(on, Ordering::Release);
    }

    pub fn write_barrier(&self) -> bool {
        self.write_barrier.load(Ordering::Acquire)
    }

    pub fn set_shadow(&self, on: bool) {
        self.shadow.store(on, Ordering::Release);
    }

    pub fn shadow(&self) -> bool {
        self.shadow.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn record_delivered(&self) -> u64 {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered.load(Ordering::Relaxed)
    }
}

/// Upward signals from a producer thread to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerEvent {
    /// Shadow decode cached its first frame; the producer can go live.
    Ready { segment_id: u64 },
    /// Decoder ran out before the planned frame count.
    EarlyEof {
        segment_id: u64,
        delivered: u64,
        planned: u64,
    },
    /// Normal end of content.
    Eof { segment_id: u64, delivered: u64 },
    /// Delivery stopped at the planned frame count with content left over.
    ContentTruncated { segment_id: u64 },
    /// The decode loop died.
    Failed { segment_id: u64, error: String },
}

/// A producer decodes one segment (or synthesizes failsafe content) on its
/// own thread.
pub trait Producer: Send {
    fn name(&self) -> &'static str;

    /// Open codecs and seek. Errors here abort LoadPreview at the caller.
    fn start(&mut self) -> Result<()>;

    /// The blocking decode loop. Runs until stop is requested or content
    /// ends; honors the write barrier and the shadow flag throughout.
    fn run(&mut self) -> Result<()>;

    fn control(&self) -> &Arc<ProducerControl>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_flags() {
        let ctl = ProducerControl::new();
        assert!(!ctl.write_barrier());
        assert!(!ctl.shadow());
        assert!(!ctl.stop_requested());

        ctl.set_write_barrier(true);
        ctl.set_shadow(true);
        ctl.request_stop();
        assert!(ctl.write_barrier());
        assert!(ctl.shadow());
        assert!(ctl.stop_requested());

        ctl.set_write_barrier(false);
        assert!(!ctl.write_barrier());
    }

    #[test]
    fn test_delivery_counter() {
        let ctl = ProducerControl::new();
        assert_eq!(ctl.record_delivered(), 1);
        assert_eq!(ctl.record_delivered(), 2);
        assert_eq!(ctl.frames_delivered(), 2);
    }
}
