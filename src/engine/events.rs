//! As-run event stream
//!
//! Committed boundary facts the external reconciler compares against the
//! plan. Every event carries the segment, channel time, wall-clock time and
//! the build stamp; delivery is a broadcast channel mirrored into the log.
//! The core emits and forgets; nothing here is persisted.

use log::info;
use serde::Serialize;
use tokio::sync::broadcast;

/// Build stamp attached to every event.
pub const BUILD_STAMP: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AsRunKind {
    /// A segment went on air. Both the planned boundary CT and the CT the
    /// switch actually committed at.
    SegmentStarted { planned_ct_us: i64, committed_ct_us: i64 },
    SegmentEnded { delivered_frames: u64 },
    EarlyEof { delivered: u64, planned: u64 },
    ContentTruncated,
    ContentDeficitFillStart { deficit_start_ct_us: i64, deficit_boundary_ct_us: i64 },
    ContentDeficitFillEnd { duration_ms: u64 },
    BoundaryTransition { from: String, to: String },
    PadWhileDepthHigh { depth: usize },
    EquilibriumWarning { depth: usize },
}

/// One as-run record.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AsRunEvent {
    pub channel_id: String,
    pub segment_id: u64,
    pub ct_us: i64,
    pub wall_utc_us: i64,
    pub build: &'static str,
    #[serde(flatten)]
    pub kind: AsRunKind,
}

/// Fans events out to subscribers and the log.
#[derive(Debug, Clone)]
pub struct AsRunEmitter {
    channel_id: String,
    tx: broadcast::Sender<AsRunEvent>,
}

impl AsRunEmitter {
    pub fn new(channel_id: &str) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            channel_id: channel_id.to_string(),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AsRunEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, segment_id: u64, ct_us: i64, wall_utc_us: i64, kind: AsRunKind) {
        let event = AsRunEvent {
            channel_id: self.channel_id.clone(),
            segment_id,
            ct_us,
            wall_utc_us,
            build: BUILD_STAMP,
            kind,
        };
        let wall = chrono::DateTime::from_timestamp_micros(wall_utc_us)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| wall_utc_us.to_string());
        info!(
            "as-run[{}] segment {} ct={}us at {}: {:?}",
            event.channel_id, event.segment_id, event.ct_us, wall, event.kind
        );
        // No subscribers is fine; the log line is the floor
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_subscriber() {
        let emitter = AsRunEmitter::new("ch1");
        let mut rx = emitter.subscribe();

        emitter.emit(
            9,
            3_333_333,
            1_700_000_000_000_000,
            AsRunKind::SegmentStarted {
                planned_ct_us: 3_333_333,
                committed_ct_us: 3_366_633,
            },
        );

        let event = rx.try_recv().unwrap();
        assert_eq!(event.channel_id, "ch1");
        assert_eq!(event.segment_id, 9);
        assert_eq!(event.build, BUILD_STAMP);
        match event.kind {
            AsRunKind::SegmentStarted { committed_ct_us, .. } => {
                assert_eq!(committed_ct_us, 3_366_633)
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let emitter = AsRunEmitter::new("ch1");
        emitter.emit(1, 0, 0, AsRunKind::ContentTruncated);
    }

    #[test]
    fn test_event_serializes_flat() {
        let event = AsRunEvent {
            channel_id: "ch1".into(),
            segment_id: 4,
            ct_us: 100,
            wall_utc_us: 200,
            build: BUILD_STAMP,
            kind: AsRunKind::ContentDeficitFillEnd { duration_ms: 1666 },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "content_deficit_fill_end");
        assert_eq!(json["duration_ms"], 1666);
        assert_eq!(json["segment_id"], 4);
    }
}
