//! The timeline controller: admission gating and CT assignment
//!
//! Frame-driven by construction: wall-clock advance without admissions never
//! moves the CT cursor. Lag against the wall clock is observable here, but
//! pacing the output is the mux's job, not this one's.

use std::sync::Mutex;

use crate::clock::MasterClock;
use crate::config::TimelineConfig;
use crate::timeline::mapping::SegmentMapping;

/// Outcome of presenting one frame for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionResult {
    /// Frame enters the channel timeline at this CT.
    Admitted(i64),
    /// Frame maps too far behind the cursor; drop it and decode the next.
    RejectedLate { ct_computed: i64, ct_expected: i64 },
    /// Frame maps too far ahead of the cursor.
    RejectedEarly { ct_computed: i64, ct_expected: i64 },
    /// No session, or no mapping and none pending. Outside a transition
    /// window this is a programming error at the call site.
    RejectedNoMapping,
}

impl AdmissionResult {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionResult::Admitted(_))
    }

    pub fn ct(&self) -> Option<i64> {
        match *self {
            AdmissionResult::Admitted(ct) => Some(ct),
            _ => None,
        }
    }
}

/// Admission counters, reset per session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimelineStats {
    pub admitted: u64,
    pub snapped: u64,
    pub rejected_late: u64,
    pub rejected_early: u64,
    pub rejected_no_mapping: u64,
    pub mappings_locked: u64,
}

#[derive(Debug, Default)]
struct TimelineState {
    session_active: bool,
    epoch_utc_us: i64,
    ct_cursor_us: Option<i64>,
    mapping: Option<SegmentMapping>,
    stats: TimelineStats,
}

/// Sole authority for CT assignment. Producers hand in media timestamps and
/// get channel timestamps back; everything else observes.
///
/// Touched from producer threads (admission) and the control thread
/// (segment begin/end); serialized internally.
pub struct TimelineController {
    clock: MasterClock,
    config: TimelineConfig,
    state: Mutex<TimelineState>,
}

impl TimelineController {
    pub fn new(clock: MasterClock, config: TimelineConfig) -> Self {
        Self {
            clock,
            config,
            state: Mutex::new(TimelineState::default()),
        }
    }

    /// Begin a session anchored at `epoch_utc_us`. Clears cursor, mapping
    /// and stats.
    pub fn start_session(&self, epoch_utc_us: i64) {
        let mut st = self.state.lock().unwrap();
        *st = TimelineState {
            session_active: true,
            epoch_utc_us,
            ..Default::default()
        };
    }

    pub fn end_session(&self) {
        let mut st = self.state.lock().unwrap();
        st.session_active = false;
        st.mapping = None;
        st.ct_cursor_us = None;
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().session_active
    }

    /// Install a fully declared mapping. No pending state.
    pub fn begin_segment_absolute(&self, ct_start_us: i64, mt_start_us: i64) {
        let mut st = self.state.lock().unwrap();
        st.mapping = Some(SegmentMapping::Absolute {
            ct_start_us,
            mt_start_us,
        });
    }

    /// Arm the pending mapping: the next admitted frame locks CT from the
    /// wall clock and MT from its own PTS in one step, so frames dropped
    /// between now and that admission cannot skew the anchor.
    pub fn begin_segment_from_preview(&self) {
        let mut st = self.state.lock().unwrap();
        st.mapping = Some(SegmentMapping::AwaitFirstFrame);
    }

    /// Drop the active mapping at segment end. The cursor survives; CT keeps
    /// ascending across the boundary.
    pub fn clear_mapping(&self) {
        let mut st = self.state.lock().unwrap();
        st.mapping = None;
    }

    /// Present one video frame (by its media timestamp) for admission.
    pub fn admit_frame(&self, mt_us: i64) -> AdmissionResult {
        let mut st = self.state.lock().unwrap();
        if !st.session_active {
            st.stats.rejected_no_mapping += 1;
            return AdmissionResult::RejectedNoMapping;
        }

        let mapping = match st.mapping {
            None => {
                st.stats.rejected_no_mapping += 1;
                return AdmissionResult::RejectedNoMapping;
            }
            Some(m) => m,
        };

        if mapping.is_pending() {
            // Lock both endpoints from this frame: CT from the wall clock,
            // MT from the frame itself.
            let ct_start = self.clock.now_utc_us() - st.epoch_utc_us;
            st.mapping = Some(SegmentMapping::Absolute {
                ct_start_us: ct_start,
                mt_start_us: mt_us,
            });
            st.ct_cursor_us = Some(ct_start);
            st.stats.mappings_locked += 1;
            st.stats.admitted += 1;
            return AdmissionResult::Admitted(ct_start);
        }

        let ct_computed = mapping
            .media_to_channel(mt_us)
            .expect("non-pending mapping has endpoints");

        let ct_expected = match st.ct_cursor_us {
            Some(cursor) => cursor + self.config.frame_period_us,
            // First admission of an absolute segment: the computed CT is the
            // expectation.
            None => ct_computed,
        };

        let delta = ct_computed - ct_expected;
        if delta.abs() <= self.config.tolerance_us {
            // Snap: decoder jitter must not leak into the CT sequence.
            st.ct_cursor_us = Some(ct_expected);
            st.stats.admitted += 1;
            if delta != 0 {
                st.stats.snapped += 1;
            }
            return AdmissionResult::Admitted(ct_expected);
        }

        if ct_computed < ct_expected - self.config.late_threshold_us {
            st.stats.rejected_late += 1;
            return AdmissionResult::RejectedLate {
                ct_computed,
                ct_expected,
            };
        }

        if ct_computed > ct_expected + self.config.early_threshold_us {
            st.stats.rejected_early += 1;
            return AdmissionResult::RejectedEarly {
                ct_computed,
                ct_expected,
            };
        }

        // Off the cadence but inside the rejection windows: admit at the
        // computed CT and re-anchor the cursor there.
        st.ct_cursor_us = Some(ct_computed);
        st.stats.admitted += 1;
        AdmissionResult::Admitted(ct_computed)
    }

    /// Map one audio frame through the current mapping. Audio never locks a
    /// pending mapping and never moves the cursor; it rides the mapping the
    /// video admission established.
    pub fn admit_audio(&self, mt_us: i64) -> AdmissionResult {
        let st = self.state.lock().unwrap();
        if !st.session_active {
            return AdmissionResult::RejectedNoMapping;
        }
        match st.mapping.and_then(|m| m.media_to_channel(mt_us)) {
            Some(ct) => AdmissionResult::Admitted(ct),
            None => AdmissionResult::RejectedNoMapping,
        }
    }

    pub fn ct_cursor(&self) -> Option<i64> {
        self.state.lock().unwrap().ct_cursor_us
    }

    /// How far the wall clock has run ahead of admitted content.
    pub fn lag(&self) -> i64 {
        let st = self.state.lock().unwrap();
        match st.ct_cursor_us {
            Some(cursor) => (self.clock.now_utc_us() - st.epoch_utc_us) - cursor,
            None => 0,
        }
    }

    pub fn is_in_catch_up(&self) -> bool {
        self.lag() > 2 * self.config.frame_period_us
    }

    pub fn should_restart(&self) -> bool {
        self.lag() > self.config.catch_up_limit_us
    }

    pub fn is_mapping_pending(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .mapping
            .is_some_and(|m| m.is_pending())
    }

    pub fn segment_mapping(&self) -> Option<SegmentMapping> {
        self.state.lock().unwrap().mapping
    }

    pub fn stats(&self) -> TimelineStats {
        self.state.lock().unwrap().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP: i64 = 33_333; // 30 fps frame period

    fn controller_at(now_us: i64) -> (TimelineController, MasterClock) {
        let clock = MasterClock::fake(now_us);
        let tl = TimelineController::new(clock.clone(), TimelineConfig::from_fps(30.0, 5, 30));
        (tl, clock)
    }

    #[test]
    fn test_no_session_rejects() {
        let (tl, _clock) = controller_at(0);
        assert_eq!(tl.admit_frame(0), AdmissionResult::RejectedNoMapping);
    }

    #[test]
    fn test_no_mapping_rejects() {
        let (tl, _clock) = controller_at(1_000);
        tl.start_session(1_000);
        assert_eq!(tl.admit_frame(0), AdmissionResult::RejectedNoMapping);
        assert_eq!(tl.stats().rejected_no_mapping, 1);
    }

    #[test]
    fn test_absolute_mapping_cadence() {
        let (tl, _clock) = controller_at(0);
        tl.start_session(0);
        tl.begin_segment_absolute(0, 4_000_000);

        assert_eq!(tl.admit_frame(4_000_000), AdmissionResult::Admitted(0));
        assert_eq!(tl.admit_frame(4_000_000 + FP), AdmissionResult::Admitted(FP));
        assert_eq!(
            tl.admit_frame(4_000_000 + 2 * FP),
            AdmissionResult::Admitted(2 * FP)
        );
        assert_eq!(tl.ct_cursor(), Some(2 * FP));
    }

    #[test]
    fn test_pending_mapping_locks_from_wall_clock() {
        // First admitted frame maps CT to now - epoch no matter how long
        // after segment begin it arrives.
        let (tl, clock) = controller_at(10_000_000);
        tl.start_session(10_000_000);
        tl.begin_segment_from_preview();
        assert!(tl.is_mapping_pending());

        // A long pause before the first frame shows up
        clock.advance(2_500_000);
        let res = tl.admit_frame(4_300_000);
        assert_eq!(res, AdmissionResult::Admitted(2_500_000));
        assert!(!tl.is_mapping_pending());
        assert_eq!(
            tl.segment_mapping().unwrap().endpoints(),
            Some((2_500_000, 4_300_000))
        );

        // Cadence continues from the locked anchor
        assert_eq!(
            tl.admit_frame(4_300_000 + FP),
            AdmissionResult::Admitted(2_500_000 + FP)
        );
    }

    #[test]
    fn test_mapping_atomicity_with_dropped_frames() {
        // Frames decoded before segment begin never reach admission; the
        // mapping must lock against the first frame that does.
        let (tl, clock) = controller_at(0);
        tl.start_session(0);
        tl.begin_segment_from_preview();
        clock.set_now(1_000_000);

        // The producer dropped mt=4_000_000..4_066_666 behind the barrier;
        // the first admitted frame is three frames into the asset.
        let res = tl.admit_frame(4_100_000);
        assert_eq!(res, AdmissionResult::Admitted(1_000_000));
        assert_eq!(
            tl.segment_mapping().unwrap().endpoints(),
            Some((1_000_000, 4_100_000))
        );
    }

    #[test]
    fn test_snap_absorbs_jitter() {
        let (tl, _clock) = controller_at(0);
        tl.start_session(0);
        tl.begin_segment_absolute(0, 0);

        assert_eq!(tl.admit_frame(0), AdmissionResult::Admitted(0));
        // 400 µs of decoder jitter snaps to the cadence
        assert_eq!(tl.admit_frame(FP + 400), AdmissionResult::Admitted(FP));
        assert_eq!(tl.admit_frame(2 * FP - 250), AdmissionResult::Admitted(2 * FP));
        assert_eq!(tl.stats().snapped, 2);
    }

    #[test]
    fn test_late_rejection() {
        // Cursor at 766,659 µs; a frame mapping to ct=0 is long gone.
        let (tl, _clock) = controller_at(0);
        tl.start_session(0);
        tl.begin_segment_absolute(0, 0);
        for i in 0..24 {
            assert!(tl.admit_frame(i * FP).is_admitted());
        }
        assert_eq!(tl.ct_cursor(), Some(766_659));

        match tl.admit_frame(0) {
            AdmissionResult::RejectedLate {
                ct_computed,
                ct_expected,
            } => {
                assert_eq!(ct_computed, 0);
                assert_eq!(ct_expected, 766_659 + FP);
            }
            other => panic!("expected RejectedLate, got {:?}", other),
        }
        // Rejection leaves the cursor alone
        assert_eq!(tl.ct_cursor(), Some(766_659));
        assert_eq!(tl.stats().rejected_late, 1);
    }

    #[test]
    fn test_early_rejection() {
        // Cursor at 33,333 µs; a frame mapping to ct=1,000,000 is too far out.
        let (tl, _clock) = controller_at(0);
        tl.start_session(0);
        tl.begin_segment_absolute(0, 0);
        assert!(tl.admit_frame(0).is_admitted());
        assert!(tl.admit_frame(FP).is_admitted());
        assert_eq!(tl.ct_cursor(), Some(FP));

        match tl.admit_frame(1_000_000) {
            AdmissionResult::RejectedEarly { ct_computed, .. } => {
                assert_eq!(ct_computed, 1_000_000);
            }
            other => panic!("expected RejectedEarly, got {:?}", other),
        }
        assert_eq!(tl.stats().rejected_early, 1);
    }

    #[test]
    fn test_ct_monotonic_within_session() {
        let (tl, _clock) = controller_at(0);
        tl.start_session(0);
        tl.begin_segment_absolute(0, 0);

        let mut last_ct = -1i64;
        for i in 0..300 {
            // jitter alternates around the cadence
            let jitter = if i % 2 == 0 { 300 } else { -300 };
            if let AdmissionResult::Admitted(ct) = tl.admit_frame(i * FP + jitter) {
                assert!(ct > last_ct, "CT regressed: {} after {}", ct, last_ct);
                last_ct = ct;
            }
        }
    }

    #[test]
    fn test_determinism_same_mt_same_ct() {
        let run = || {
            let (tl, _clock) = controller_at(0);
            tl.start_session(0);
            tl.begin_segment_absolute(0, 7_000);
            let mts = [7_000, 40_600, 73_700, 107_300, 140_500];
            mts.iter()
                .map(|&mt| tl.admit_frame(mt))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_lag_and_catch_up() {
        let (tl, clock) = controller_at(0);
        tl.start_session(0);
        tl.begin_segment_absolute(0, 0);
        assert!(tl.admit_frame(0).is_admitted());
        assert_eq!(tl.lag(), 0);

        clock.advance(3 * FP);
        assert_eq!(tl.lag(), 3 * FP);
        assert!(tl.is_in_catch_up());
        assert!(!tl.should_restart());

        clock.advance(6_000_000);
        assert!(tl.should_restart());
    }

    #[test]
    fn test_wall_clock_does_not_advance_cursor() {
        let (tl, clock) = controller_at(0);
        tl.start_session(0);
        tl.begin_segment_absolute(0, 0);
        assert!(tl.admit_frame(0).is_admitted());

        clock.advance(10_000_000);
        // Frame-driven: no admissions, no cursor movement
        assert_eq!(tl.ct_cursor(), Some(0));
    }

    #[test]
    fn test_audio_rides_video_mapping() {
        let (tl, clock) = controller_at(0);
        tl.start_session(0);
        tl.begin_segment_from_preview();

        // Pending mapping: audio must not lock it
        assert_eq!(tl.admit_audio(5_000), AdmissionResult::RejectedNoMapping);
        assert!(tl.is_mapping_pending());

        clock.set_now(100_000);
        assert!(tl.admit_frame(4_000_000).is_admitted());
        // Now audio maps through the video-locked anchor
        assert_eq!(
            tl.admit_audio(4_021_333),
            AdmissionResult::Admitted(121_333)
        );
    }

    #[test]
    fn test_segment_transition_ct_contiguous() {
        // 30 fps channel. Segment A airs 100 frames from ct=0; the successor
        // locks from the wall clock one frame after A's last CT and continues
        // the cadence, strictly monotonic across the boundary.
        let (tl, clock) = controller_at(1_000_000);
        tl.start_session(1_000_000);
        tl.begin_segment_absolute(0, 0);

        let mut last_ct = 0;
        for i in 0..100 {
            let res = tl.admit_frame(i * FP);
            last_ct = res.ct().expect("admitted");
        }
        // 99 * 33,333
        assert_eq!(last_ct, 3_299_967);

        // Boundary: segment B arrives from preview; its first frame (asset
        // mt 4.3 s) locks at the wall-clock position one frame later
        tl.begin_segment_from_preview();
        clock.set_now(1_000_000 + last_ct + FP);
        let first_b = tl.admit_frame(4_300_000);
        assert_eq!(first_b, AdmissionResult::Admitted(last_ct + FP));

        // Subsequent B frames increment by one frame period
        assert_eq!(
            tl.admit_frame(4_300_000 + FP),
            AdmissionResult::Admitted(last_ct + 2 * FP)
        );
        assert_eq!(
            tl.admit_frame(4_300_000 + 2 * FP),
            AdmissionResult::Admitted(last_ct + 3 * FP)
        );
    }

    #[test]
    fn test_fresh_session_resets_cursor() {
        let (tl, clock) = controller_at(0);
        tl.start_session(0);
        tl.begin_segment_absolute(0, 0);
        assert!(tl.admit_frame(0).is_admitted());
        assert!(tl.admit_frame(FP).is_admitted());

        tl.end_session();
        clock.set_now(50_000_000);
        tl.start_session(50_000_000);
        assert_eq!(tl.ct_cursor(), None);
        assert_eq!(tl.stats(), TimelineStats::default());

        tl.begin_segment_from_preview();
        assert_eq!(tl.admit_frame(9_000_000), AdmissionResult::Admitted(0));
    }
}
