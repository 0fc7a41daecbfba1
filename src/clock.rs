//! Master clock for channel timing
//!
//! Provides the monotonic wall-clock time base every playout component reads,
//! plus the per-session epoch that anchors channel time (CT = 0) to a UTC
//! instant.
//!
//! # Design
//!
//! The clock is shared via `Arc` and cloned freely. Two variants exist behind
//! the same handle:
//! - A real clock backed by a base `Instant` (monotonic) pinned to a UTC
//!   reading taken once at construction, so `now_utc_us` never goes backwards
//!   even if the system clock is stepped.
//! - A fake clock whose "now" is an atomic the test advances explicitly, so
//!   every paced loop in the core replays deterministically.
//!
//! # Epoch
//!
//! The epoch is set exactly once per session, by a producer acting in the
//! LIVE role. PREVIEW producers are always rejected: a preview decoding ahead
//! of air must never anchor the channel timeline. `reset_for_new_session`
//! clears the lock for the next session only.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Sentinel for "epoch not set". Real epochs are non-negative UTC µs.
const EPOCH_UNSET: i64 = i64::MIN;

/// Role of the producer attempting to touch the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockRole {
    /// Producer currently feeding the ring buffer.
    Live,
    /// Producer shadow-decoding ahead of a boundary.
    Preview,
}

enum TimeSource {
    Real { base: Instant, base_utc_us: i64 },
    Fake { now_us: AtomicI64 },
}

/// Monotonic wall clock with a CAS-once per-session epoch.
#[derive(Clone)]
pub struct MasterClock {
    source: Arc<TimeSource>,
    epoch_utc_us: Arc<AtomicI64>,
}

impl MasterClock {
    /// Create a real clock. The UTC reading is taken once; all later reads
    /// derive from the monotonic base.
    pub fn new() -> Self {
        let base_utc_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as i64;
        Self {
            source: Arc::new(TimeSource::Real {
                base: Instant::now(),
                base_utc_us,
            }),
            epoch_utc_us: Arc::new(AtomicI64::new(EPOCH_UNSET)),
        }
    }

    /// Create a deterministic clock starting at `now_us`.
    pub fn fake(now_us: i64) -> Self {
        Self {
            source: Arc::new(TimeSource::Fake {
                now_us: AtomicI64::new(now_us),
            }),
            epoch_utc_us: Arc::new(AtomicI64::new(EPOCH_UNSET)),
        }
    }

    pub fn is_fake(&self) -> bool {
        matches!(*self.source, TimeSource::Fake { .. })
    }

    /// Current wall-clock time in UTC microseconds.
    pub fn now_utc_us(&self) -> i64 {
        match &*self.source {
            TimeSource::Real { base, base_utc_us } => {
                base_utc_us + base.elapsed().as_micros() as i64
            }
            TimeSource::Fake { now_us } => now_us.load(Ordering::Acquire),
        }
    }

    /// Map a channel-time PTS (µs since epoch) to a UTC instant.
    /// Returns None while the epoch is unset.
    pub fn scheduled_to_utc_us(&self, pts_us: i64) -> Option<i64> {
        self.epoch().map(|epoch| epoch + pts_us)
    }

    /// Set the epoch exactly once. Only the LIVE role may anchor the
    /// timeline; PREVIEW attempts are always rejected. Returns true if this
    /// call installed the epoch.
    pub fn try_set_epoch_once(&self, epoch_utc_us: i64, role: ClockRole) -> bool {
        if role != ClockRole::Live {
            return false;
        }
        self.epoch_utc_us
            .compare_exchange(EPOCH_UNSET, epoch_utc_us, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn epoch(&self) -> Option<i64> {
        let v = self.epoch_utc_us.load(Ordering::Acquire);
        (v != EPOCH_UNSET).then_some(v)
    }

    pub fn is_epoch_locked(&self) -> bool {
        self.epoch().is_some()
    }

    /// Clear the epoch lock. Valid only between sessions; a running session
    /// never calls this.
    pub fn reset_for_new_session(&self) {
        self.epoch_utc_us.store(EPOCH_UNSET, Ordering::Release);
    }

    /// Advance a fake clock by `delta_us`. No-op on a real clock.
    pub fn advance(&self, delta_us: i64) {
        if let TimeSource::Fake { now_us } = &*self.source {
            now_us.fetch_add(delta_us, Ordering::AcqRel);
        }
    }

    /// Jump a fake clock to an absolute reading. No-op on a real clock.
    pub fn set_now(&self, utc_us: i64) {
        if let TimeSource::Fake { now_us } = &*self.source {
            now_us.store(utc_us, Ordering::Release);
        }
    }

    /// Block the calling thread until `target_utc_us`. On a fake clock the
    /// thread never sleeps: now jumps straight to the target, which is what
    /// makes paced loops replayable in tests.
    pub fn sleep_until(&self, target_utc_us: i64) {
        match &*self.source {
            TimeSource::Real { .. } => {
                let now = self.now_utc_us();
                if target_utc_us > now {
                    std::thread::sleep(Duration::from_micros((target_utc_us - now) as u64));
                }
            }
            TimeSource::Fake { now_us } => {
                now_us.fetch_max(target_utc_us, Ordering::AcqRel);
            }
        }
    }
}

impl Default for MasterClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MasterClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterClock")
            .field("fake", &self.is_fake())
            .field("now_utc_us", &self.now_utc_us())
            .field("epoch", &self.epoch())
            .finish()
    }
}
