//! Per-channel playout engine
//!
//! Owns every component of one channel by value: the clock, the timeline
//! controller, the frame ring, the producer bus, the pacer thread and the
//! failsafe producer. Producers signal upward through an event channel;
//! nothing below holds a reference back into the engine.
//!
//! Switching is deadline-authoritative: the clock decides when a boundary
//! commits, frame admission decides how precisely the cut lands, and content
//! readiness is validated but never allowed to delay the clock.

pub mod boundary;
pub mod events;

use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Result, anyhow};
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;

use crate::buffer::FrameRing;
use crate::clock::{ClockRole, MasterClock};
use crate::config::{EngineConfig, MuxConfig, PlayoutConfig, ProgramFormat, TimelineConfig};
use crate::engine::boundary::{BoundaryState, IssuanceGuard};
use crate::engine::events::{AsRunEmitter, AsRunKind};
use crate::metrics::ChannelMetrics;
use crate::mux::{FrameOutput, MuxPacer, PadControl, TsOutput};
use crate::producer::black::BlackFrameProducer;
use crate::producer::bus::{ProducerBus, ProducerHandle};
use crate::producer::file::FileProducer;
use crate::producer::{ProducerEvent, Segment};
use crate::stop::StopSignal;
use crate::timeline::TimelineController;

/// Result of a LoadPreview issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    pub shadow_decode_started: bool,
}

/// Result of scheduling (or executing) a switch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwitchOutcome {
    pub pts_contiguous: bool,
    pub live_start_pts_us: i64,
}

/// Read-only snapshot for operators.
#[derive(Debug, Clone, Serialize)]
pub struct PlayoutStatus {
    pub channel_id: String,
    pub boundary_state: String,
    pub live: bool,
    pub converged: bool,
    pub video_depth: usize,
    pub audio_depth: usize,
    pub ct_cursor_us: Option<i64>,
    pub lag_us: i64,
    pub uptime_seconds: i64,
    pub metrics: crate::metrics::MetricsSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeficitState {
    deficit_start_ct_us: i64,
    deficit_boundary_ct_us: i64,
    segment_id: u64,
}

#[derive(Default)]
struct EngineState {
    boundary: BoundaryState,
    issuance: IssuanceGuard,
    /// Segment armed in the preview slot, awaiting its boundary.
    pending: Option<Segment>,
    preview_ready: bool,
    /// Segment currently on air.
    current: Option<Segment>,
    deficit: Option<DeficitState>,
    teardown_pending: Option<&'static str>,
    torn_down: bool,
    session_started: bool,
    converged: bool,
    skipped_boundaries: u32,
    failsafe: Option<ProducerHandle>,
    started: bool,
    started_at_utc_us: i64,
}

/// One channel's runtime.
pub struct PlayoutEngine {
    /// Self-handle for tasks the engine spawns about itself.
    weak: Weak<PlayoutEngine>,
    channel_id: String,
    format: ProgramFormat,
    config: EngineConfig,
    mux_config: MuxConfig,
    clock: MasterClock,
    ring: Arc<FrameRing>,
    timeline: Arc<TimelineController>,
    bus: ProducerBus,
    metrics: Arc<ChannelMetrics>,
    emitter: AsRunEmitter,
    pad: Arc<PadControl>,
    /// Instance lifetime: raised only at teardown; stops the pacer thread.
    stop: StopSignal,
    /// Transient work: boundary timers and watchdogs; cancelled on terminal
    /// failure so scheduling halts while the pad keeps the output alive.
    timers: CancellationToken,
    state: Mutex<EngineState>,
    events_tx: UnboundedSender<ProducerEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<ProducerEvent>>>,
    mux_thread: Mutex<Option<JoinHandle<()>>>,
}

impl PlayoutEngine {
    pub fn new(
        channel_id: &str,
        format: ProgramFormat,
        config: &PlayoutConfig,
        clock: MasterClock,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = unbounded_channel();
        let timeline = Arc::new(TimelineController::new(
            clock.clone(),
            TimelineConfig::from_format(&format),
        ));
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            channel_id: channel_id.to_string(),
            format,
            config: config.engine,
            mux_config: config.mux,
            clock,
            ring: Arc::new(FrameRing::new(config.buffer)),
            timeline,
            bus: ProducerBus::new(),
            metrics: Arc::new(ChannelMetrics::new()),
            emitter: AsRunEmitter::new(channel_id),
            pad: PadControl::new(),
            stop: StopSignal::new(),
            timers: CancellationToken::new(),
            state: Mutex::new(EngineState::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            mux_thread: Mutex::new(None),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("engine dropped while in use")
    }

    /// Spawn a transient timer task that dies with the timers token.
    fn spawn_timer<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = self.timers.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        });
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// The as-run stream; external reconciliation subscribes here.
    pub fn emitter(&self) -> &AsRunEmitter {
        &self.emitter
    }

    /// Bring the instance up with the TS sink on `port`. Idempotent.
    pub fn start(&self, port: u16) -> Result<()> {
        {
            let st = self.state.lock().unwrap();
            if st.started {
                return Ok(());
            }
        }
        self.format.validate()?;
        let output = TsOutput::new(
            &self.format,
            &self.mux_config,
            port,
            Arc::clone(&self.metrics),
        )?;
        self.start_with_output(Box::new(output))
    }

    /// Same as [`start`], with the output injected. Test seam and the actual
    /// implementation.
    pub fn start_with_output(&self, mut output: Box<dyn FrameOutput>) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.started {
            return Ok(());
        }
        st.started = true;
        st.started_at_utc_us = self.clock.now_utc_us();
        drop(st);

        // Pacer thread: sole pacing authority once attached
        let mut pacer = MuxPacer::new(
            Arc::clone(&self.ring),
            self.clock.clone(),
            self.mux_config,
            self.format,
            Arc::clone(&self.metrics),
            Arc::clone(&self.pad),
            self.stop.clone(),
        );
        let handle = std::thread::Builder::new()
            .name(format!("mux-{}", self.channel_id))
            .spawn(move || pacer.run(output.as_mut()))?;
        *self.mux_thread.lock().unwrap() = Some(handle);

        // Producer event pump on the control plane
        if let Some(mut rx) = self.events_rx.lock().unwrap().take() {
            let engine = self.arc();
            self.stop.spawn(async move {
                while let Some(event) = rx.recv().await {
                    engine.on_producer_event(event);
                }
            });
        }

        // Periodic health summary
        let engine = self.arc();
        self.stop.spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            interval.tick().await;
            loop {
                interval.tick().await;
                info!(
                    "channel {}: {} (lag {}us)",
                    engine.channel_id,
                    engine.metrics.summary(),
                    engine.timeline.lag()
                );
            }
        });

        // Convergence watchdog
        let engine = self.arc();
        let timeout = Duration::from_millis(self.config.convergence_timeout_ms as u64);
        self.spawn_timer(async move {
            tokio::time::sleep(timeout).await;
            let needs_fail = {
                let st = engine.state.lock().unwrap();
                !st.converged && !st.torn_down
            };
            if needs_fail {
                error!(
                    "channel {}: startup convergence timed out",
                    engine.channel_id
                );
                engine.fail_terminal("convergence timeout");
            }
        });

        info!("channel {}: started", self.channel_id);
        Ok(())
    }

    /// Install a segment into the preview slot and begin shadow decode.
    pub fn load_preview(&self, segment: Segment) -> Result<LoadOutcome> {
        {
            let st = self.state.lock().unwrap();
            if !st.started {
                return Err(anyhow!("channel not started"));
            }
            if st.torn_down || st.teardown_pending.is_some() {
                return Err(anyhow!("channel tearing down"));
            }
            if st.boundary.is_terminal() {
                return Err(anyhow!("channel failed terminal; operator reset required"));
            }
            if st.issuance.was_issued(segment.segment_id) {
                return Err(anyhow!("boundary {} already issued", segment.segment_id));
            }
        }

        // Feasibility: the boundary must leave room for prefeed plus spin-up.
        let now_ms = self.clock.now_utc_us() / 1000;
        let lead_ms = segment.target_boundary_time_ms - now_ms;
        let required_ms = self.config.min_prefeed_lead_time_ms + self.config.startup_latency_ms;
        if lead_ms < required_ms {
            let mut st = self.state.lock().unwrap();
            if st.converged {
                return Err(anyhow!(
                    "boundary {} infeasible: {}ms lead, {}ms required",
                    segment.segment_id,
                    lead_ms,
                    required_ms
                ));
            }
            st.skipped_boundaries += 1;
            let skipped = st.skipped_boundaries;
            drop(st);
            warn!(
                "channel {}: skipping infeasible boundary {} during convergence ({} skipped)",
                self.channel_id, segment.segment_id, skipped
            );
            if skipped > self.config.max_skipped_boundaries {
                self.fail_terminal("too many infeasible boundaries at startup");
                return Err(anyhow!("startup convergence failed"));
            }
            return Err(anyhow!("boundary skipped during startup convergence"));
        }

        // Spawn first; the boundary is only armed once the producer exists,
        // so an open/seek failure stays a recoverable LoadPreview error.
        let producer = FileProducer::new(
            segment.clone(),
            self.format,
            Arc::clone(&self.ring),
            Arc::clone(&self.timeline),
            Arc::clone(&self.metrics),
            self.events_tx.clone(),
        );
        producer.control().set_shadow(true);
        let handle = ProducerHandle::spawn(Box::new(producer), Some(segment.segment_id))?;

        let mut handle = handle;
        let mut st = self.state.lock().unwrap();
        if let Err(e) = self
            .transition(&mut st, BoundaryState::Armed)
            .and_then(|_| self.transition(&mut st, BoundaryState::PrefeedIssued))
        {
            drop(st);
            handle.stop_with_grace(Duration::from_millis(500));
            return Err(e);
        }
        st.pending = Some(segment);
        st.preview_ready = false;
        drop(st);

        self.bus.load_preview(handle);
        Ok(LoadOutcome {
            shadow_decode_started: true,
        })
    }

    /// Schedule the pending boundary's switch at its absolute deadline.
    pub fn switch_to_live(&self) -> Result<SwitchOutcome> {
        let (target_utc_us, pts_contiguous) = {
            let mut st = self.state.lock().unwrap();
            if st.torn_down {
                return Err(anyhow!("channel tearing down"));
            }
            let pending = st
                .pending
                .as_ref()
                .ok_or_else(|| anyhow!("no preview loaded"))?;
            let target = pending.target_boundary_time_ms * 1000;
            let ready = st.preview_ready;
            self.transition(&mut st, BoundaryState::SwitchScheduled)?;
            (target, ready)
        };

        let planned_ct = self
            .clock
            .epoch()
            .map(|e| target_utc_us - e)
            .unwrap_or(0);

        let delay_us = target_utc_us - self.clock.now_utc_us();
        if delay_us <= 0 {
            self.execute_switch();
        } else {
            let engine = self.arc();
            self.spawn_timer(async move {
                tokio::time::sleep(Duration::from_micros(delay_us as u64)).await;
                engine.execute_switch();
            });
        }

        Ok(SwitchOutcome {
            pts_contiguous,
            live_start_pts_us: planned_ct,
        })
    }

    /// Commit the boundary now. Called by the deadline timer; public so
    /// deterministic tests can drive the clock themselves.
    pub fn execute_switch(&self) {
        if let Err(e) = self.try_execute_switch() {
            error!(
                "channel {}: boundary issuance failed: {:#}",
                self.channel_id, e
            );
            self.fail_terminal("exception during boundary issuance");
        }
    }

    fn try_execute_switch(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.torn_down || st.boundary.is_terminal() {
            return Ok(());
        }
        let Some(segment) = st.pending.take() else {
            return Ok(());
        };
        // One issuance per boundary, ever
        if !st.issuance.try_issue(segment.segment_id) {
            return Ok(());
        }

        let now = self.clock.now_utc_us();

        // First committed boundary anchors the channel: epoch set once, in
        // the live role, and the timeline session starts from it.
        if !st.session_started {
            self.clock.try_set_epoch_once(now, ClockRole::Live);
            let epoch = self
                .clock
                .epoch()
                .ok_or_else(|| anyhow!("epoch lock failed"))?;
            self.timeline.start_session(epoch);
            st.session_started = true;
        }
        let epoch = self.clock.epoch().expect("session epoch");

        let target_utc_us = segment.target_boundary_time_ms * 1000;
        let planned_ct = target_utc_us - epoch;
        let committed_ct = now - epoch;
        let delta_ms = (now - target_utc_us).abs() / 1000;
        let violation = (now - target_utc_us).abs() > self.format.frame_period_us();
        self.metrics.record_boundary_delta(delta_ms as u64, violation);

        // A running deficit ends at the boundary it was filling toward
        if let Some(deficit) = st.deficit.take() {
            self.pad.disengage();
            let duration_ms =
                ((committed_ct - deficit.deficit_start_ct_us).max(0) / 1000) as u64;
            info!(
                "channel {}: deficit toward ct {} filled for {} ms",
                self.channel_id, deficit.deficit_boundary_ct_us, duration_ms
            );
            self.metrics.record_deficit(duration_ms);
            self.emitter.emit(
                deficit.segment_id,
                committed_ct,
                now,
                AsRunKind::ContentDeficitFillEnd { duration_ms },
            );
        }

        let outgoing_failsafe = st.failsafe.take();
        let ending = st.current.take();

        // The swap itself: pending mapping armed first so the new live
        // producer's first admitted frame locks CT and MT together.
        self.timeline.begin_segment_from_preview();
        let (outgoing_live, incoming) = self.bus.promote_preview_to_live();

        match &incoming {
            Some(control) => {
                control.set_write_barrier(false);
                control.set_shadow(false);
            }
            None => {
                // Nothing prefed: the deadline still rules. Pad until the
                // scheduler reasserts control.
                st.deficit = Some(DeficitState {
                    deficit_start_ct_us: committed_ct,
                    deficit_boundary_ct_us: planned_ct,
                    segment_id: segment.segment_id,
                });
                self.pad.engage();
                self.emitter.emit(
                    segment.segment_id,
                    committed_ct,
                    now,
                    AsRunKind::ContentDeficitFillStart {
                        deficit_start_ct_us: committed_ct,
                        deficit_boundary_ct_us: planned_ct,
                    },
                );
            }
        }

        self.transition(&mut st, BoundaryState::Live)?;
        st.current = Some(segment.clone());
        st.converged = true;
        st.preview_ready = false;
        let teardown_deferred = st.teardown_pending.is_some();
        drop(st);

        if let Some(ending) = ending {
            let delivered = outgoing_live
                .as_ref()
                .map(|h| h.control().frames_delivered())
                .unwrap_or(0);
            self.emitter.emit(
                ending.segment_id,
                committed_ct,
                now,
                AsRunKind::SegmentEnded {
                    delivered_frames: delivered,
                },
            );
        }
        self.emitter.emit(
            segment.segment_id,
            committed_ct,
            now,
            AsRunKind::SegmentStarted {
                planned_ct_us: planned_ct,
                committed_ct_us: committed_ct,
            },
        );

        // Outgoing producers stop outside the state lock
        let grace = Duration::from_millis(self.config.teardown_grace_ms as u64);
        for handle in [outgoing_live, outgoing_failsafe].into_iter().flatten() {
            let mut handle = handle;
            if !handle.stop_with_grace(grace) {
                return Err(anyhow!("outgoing producer refused to stop"));
            }
        }

        // LIVE is stable: a deferred teardown lands here
        if teardown_deferred {
            self.execute_teardown();
        }
        Ok(())
    }

    /// Idempotent teardown request honoring boundary stability.
    pub fn request_teardown(&self, reason: &'static str) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.torn_down {
            return true;
        }
        if st.boundary.is_stable() || st.boundary.is_terminal() {
            drop(st);
            self.execute_teardown();
            return true;
        }

        // Transient: defer until the machine reaches a stable state, or
        // force terminal when the grace window runs out.
        if st.teardown_pending.is_none() {
            st.teardown_pending = Some(reason);
            info!(
                "channel {}: teardown deferred from {} ({})",
                self.channel_id, st.boundary, reason
            );
            let engine = self.arc();
            let grace = Duration::from_millis(self.config.teardown_grace_ms as u64);
            self.spawn_timer(async move {
                tokio::time::sleep(grace).await;
                let still_pending = {
                    let st = engine.state.lock().unwrap();
                    st.teardown_pending.is_some() && !st.torn_down
                };
                if still_pending {
                    warn!(
                        "channel {}: deferred teardown expired, forcing terminal",
                        engine.channel_id
                    );
                    engine.fail_terminal("teardown grace expired");
                    engine.execute_teardown();
                }
            });
        }
        false
    }

    fn execute_teardown(&self) {
        {
            let mut st = self.state.lock().unwrap();
            if st.torn_down {
                return;
            }
            st.torn_down = true;
            st.teardown_pending = None;
            st.pending = None;
        }

        // Producers first, then the pacer; both worlds watch the stop signal
        let grace = Duration::from_millis(self.config.teardown_grace_ms as u64);
        let mut all_stopped = true;
        let mut handles = self.bus.take_all();
        if let Some(failsafe) = self.state.lock().unwrap().failsafe.take() {
            handles.push(failsafe);
        }
        for mut handle in handles {
            if !handle.stop_with_grace(grace) {
                all_stopped = false;
            }
        }

        self.pad.disengage();
        self.timers.cancel();
        self.stop.stop();
        if let Some(join) = self.mux_thread.lock().unwrap().take() {
            let _ = join.join();
        }
        self.ring.clear();
        self.timeline.end_session();

        let mut st = self.state.lock().unwrap();
        if all_stopped {
            if st.boundary.can_transition_to(&BoundaryState::Idle) {
                let _ = self.set_boundary(&mut st, BoundaryState::Idle);
            }
        } else {
            let _ = self.set_boundary(&mut st, BoundaryState::FailedTerminal);
        }
        drop(st);
        info!("channel {}: torn down", self.channel_id);
    }

    /// Liveness: reported only while the boundary machine is LIVE.
    pub fn is_live(&self) -> bool {
        self.state.lock().unwrap().boundary == BoundaryState::Live
    }

    pub fn is_terminal(&self) -> bool {
        self.state.lock().unwrap().boundary.is_terminal()
    }

    pub fn status(&self) -> PlayoutStatus {
        let st = self.state.lock().unwrap();
        PlayoutStatus {
            channel_id: self.channel_id.clone(),
            boundary_state: st.boundary.describe().to_string(),
            live: st.boundary == BoundaryState::Live,
            converged: st.converged,
            video_depth: self.ring.video_depth(),
            audio_depth: self.ring.audio_depth(),
            ct_cursor_us: self.timeline.ct_cursor(),
            lag_us: self.timeline.lag(),
            uptime_seconds: if st.started {
                (self.clock.now_utc_us() - st.started_at_utc_us) / 1_000_000
            } else {
                0
            },
            metrics: self.metrics.summary(),
        }
    }

    fn on_producer_event(&self, event: ProducerEvent) {
        match event {
            ProducerEvent::Ready { segment_id } => {
                let mut st = self.state.lock().unwrap();
                if st.pending.as_ref().map(|s| s.segment_id) == Some(segment_id) {
                    st.preview_ready = true;
                }
            }
            ProducerEvent::EarlyEof {
                segment_id,
                delivered,
                planned,
            } => {
                let now = self.clock.now_utc_us();
                let ct = self.timeline.ct_cursor().unwrap_or(0);
                self.emitter.emit(
                    segment_id,
                    ct,
                    now,
                    AsRunKind::EarlyEof { delivered, planned },
                );
                self.enter_deficit(segment_id);
            }
            ProducerEvent::Eof {
                segment_id,
                delivered,
            } => {
                info!(
                    "channel {}: segment {} complete ({} frames); holding for boundary",
                    self.channel_id, segment_id, delivered
                );
            }
            ProducerEvent::ContentTruncated { segment_id } => {
                let now = self.clock.now_utc_us();
                let ct = self.timeline.ct_cursor().unwrap_or(0);
                self.emitter
                    .emit(segment_id, ct, now, AsRunKind::ContentTruncated);
            }
            ProducerEvent::Failed { segment_id, error } => {
                warn!(
                    "channel {}: producer for segment {} failed: {}",
                    self.channel_id, segment_id, error
                );
                let is_live_segment = {
                    let st = self.state.lock().unwrap();
                    st.current.as_ref().map(|s| s.segment_id) == Some(segment_id)
                };
                if is_live_segment {
                    self.engage_failsafe();
                }
            }
        }
    }

    /// Live content exhausted before its boundary: pad from here to there.
    fn enter_deficit(&self, segment_id: u64) {
        let mut st = self.state.lock().unwrap();
        if st.deficit.is_some() || st.torn_down {
            return;
        }
        let Some(epoch) = self.clock.epoch() else {
            return;
        };
        let boundary_ct = st
            .pending
            .as_ref()
            .map(|s| s.target_boundary_time_ms * 1000 - epoch)
            .or_else(|| {
                st.current
                    .as_ref()
                    .map(|s| s.hard_stop_time_ms * 1000 - epoch)
            })
            .unwrap_or(0);
        let start_ct = self.timeline.ct_cursor().unwrap_or(0);
        st.deficit = Some(DeficitState {
            deficit_start_ct_us: start_ct,
            deficit_boundary_ct_us: boundary_ct,
            segment_id,
        });
        drop(st);

        self.pad.engage();
        self.emitter.emit(
            segment_id,
            start_ct,
            self.clock.now_utc_us(),
            AsRunKind::ContentDeficitFillStart {
                deficit_start_ct_us: start_ct,
                deficit_boundary_ct_us: boundary_ct,
            },
        );
    }

    /// Dead-man switch: black producer takes the live feed. Coming back
    /// requires an explicit scheduler command.
    fn engage_failsafe(&self) {
        let mut st = self.state.lock().unwrap();
        if st.failsafe.is_some() || st.torn_down || !st.session_started {
            return;
        }

        let period = self.format.frame_period_us();
        let resume_ct = self.timeline.ct_cursor().map(|c| c + period).unwrap_or(0);
        self.timeline.begin_segment_absolute(resume_ct, 0);

        let producer = BlackFrameProducer::new(
            self.format,
            Arc::clone(&self.ring),
            Arc::clone(&self.timeline),
            Arc::clone(&self.metrics),
        );
        match ProducerHandle::spawn(Box::new(producer), None) {
            Ok(handle) => {
                warn!("channel {}: failsafe engaged", self.channel_id);
                st.failsafe = Some(handle);
            }
            Err(e) => {
                // Black synthesis cannot fail in practice; losing it too
                // leaves only the pad path
                error!("channel {}: failsafe spawn failed: {:#}", self.channel_id, e);
                drop(st);
                self.pad.engage();
            }
        }
    }

    fn fail_terminal(&self, reason: &str) {
        let mut st = self.state.lock().unwrap();
        if st.boundary.is_terminal() {
            return;
        }
        error!("channel {}: FAILED_TERMINAL: {}", self.channel_id, reason);
        let _ = self.set_boundary(&mut st, BoundaryState::FailedTerminal);
        st.pending = None;
        drop(st);
        // Scheduling halts: every transient timer is cancelled. The pacer
        // stays up and pads, so the sink keeps receiving valid bytes until
        // the channel is explicitly stopped.
        self.timers.cancel();
        self.pad.engage();
    }

    fn transition(&self, st: &mut EngineState, to: BoundaryState) -> Result<()> {
        if !st.boundary.can_transition_to(&to) {
            return Err(anyhow!(
                "illegal boundary transition {} -> {}",
                st.boundary,
                to
            ));
        }
        self.set_boundary(st, to)
    }

    fn set_boundary(&self, st: &mut EngineState, to: BoundaryState) -> Result<()> {
        if st.boundary == to {
            return Ok(());
        }
        let from = st.boundary;
        st.boundary = to;
        let segment_id = st
            .current
            .as_ref()
            .or(st.pending.as_ref())
            .map(|s| s.segment_id)
            .unwrap_or(0);
        self.emitter.emit(
            segment_id,
            self.timeline.ct_cursor().unwrap_or(0),
            self.clock.now_utc_us(),
            AsRunKind::BoundaryTransition {
                from: from.describe().to_string(),
                to: to.describe().to_string(),
            },
        );
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AudioFrame, VideoFrame};

    /// Output that swallows frames; engine tests assert on state, not bytes.
    struct NullOutput;

    impl FrameOutput for NullOutput {
        fn write_video(&mut self, _frame: &VideoFrame) -> Result<()> {
            Ok(())
        }
        fn write_audio(&mut self, _frame: &AudioFrame) -> Result<()> {
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn engine_at(now_us: i64) -> (Arc<PlayoutEngine>, MasterClock) {
        let clock = MasterClock::fake(now_us);
        let engine = PlayoutEngine::new(
            "test",
            ProgramFormat::default(),
            &PlayoutConfig::default(),
            clock.clone(),
        );
        (engine, clock)
    }

    fn segment(id: u64, boundary_ms: i64) -> Segment {
        Segment {
            segment_id: id,
            asset_path: "/nonexistent/asset.mp4".into(),
            start_offset_ms: 0,
            hard_stop_time_ms: boundary_ms + 10_000,
            target_boundary_time_ms: boundary_ms,
            planned_frame_count: 300,
        }
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (engine, _clock) = engine_at(0);
        engine.start_with_output(Box::new(NullOutput)).unwrap();
        engine.start_with_output(Box::new(NullOutput)).unwrap();
        assert!(!engine.is_live());
        engine.request_teardown("test");
    }

    #[tokio::test]
    async fn test_load_preview_requires_start() {
        let (engine, _clock) = engine_at(0);
        let err = engine.load_preview(segment(1, 60_000)).unwrap_err();
        assert!(err.to_string().contains("not started"));
    }

    #[tokio::test]
    async fn test_load_preview_missing_asset_is_recoverable() {
        let (engine, _clock) = engine_at(0);
        engine.start_with_output(Box::new(NullOutput)).unwrap();

        // Open failure surfaces as an error and the boundary stays idle
        assert!(engine.load_preview(segment(1, 60_000)).is_err());
        let st = engine.state.lock().unwrap();
        assert_eq!(st.boundary, BoundaryState::Idle);
        assert!(!st.boundary.is_terminal());
        drop(st);
        engine.request_teardown("test");
    }

    #[tokio::test]
    async fn test_switch_without_preview_errors() {
        let (engine, _clock) = engine_at(0);
        engine.start_with_output(Box::new(NullOutput)).unwrap();
        let err = engine.switch_to_live().unwrap_err();
        assert!(err.to_string().contains("no preview"));
        engine.request_teardown("test");
    }

    #[tokio::test]
    async fn test_deadline_commits_without_preview_content() {
        // S6 shape: boundary commits at the deadline with nothing prefed;
        // deficit pad covers the air.
        let (engine, clock) = engine_at(10_000_000);
        engine.start_with_output(Box::new(NullOutput)).unwrap();

        // Arm the boundary state by hand (the asset cannot open in tests)
        {
            let mut st = engine.state.lock().unwrap();
            engine.transition(&mut st, BoundaryState::Armed).unwrap();
            engine
                .transition(&mut st, BoundaryState::PrefeedIssued)
                .unwrap();
            st.pending = Some(segment(5, 15_000));
        }

        clock.set_now(15_000_000);
        engine.execute_switch();

        assert!(engine.is_live());
        let st = engine.state.lock().unwrap();
        assert!(st.deficit.is_some());
        assert!(st.converged);
        drop(st);
        assert!(engine.pad.engaged());
        // Switch delta was zero: no boundary violation
        assert_eq!(engine.metrics.summary().boundary_violations, 0);
        engine.request_teardown("test");
    }

    #[tokio::test]
    async fn test_first_switch_anchors_epoch_once() {
        let (engine, clock) = engine_at(50_000_000);
        engine.start_with_output(Box::new(NullOutput)).unwrap();
        {
            let mut st = engine.state.lock().unwrap();
            engine.transition(&mut st, BoundaryState::Armed).unwrap();
            engine
                .transition(&mut st, BoundaryState::PrefeedIssued)
                .unwrap();
            st.pending = Some(segment(1, 50_000));
        }
        engine.execute_switch();

        assert_eq!(clock.epoch(), Some(50_000_000));
        assert!(engine.timeline.is_active());

        // A later boundary does not move the epoch
        {
            let mut st = engine.state.lock().unwrap();
            engine.transition(&mut st, BoundaryState::Armed).unwrap();
            st.pending = Some(segment(2, 80_000));
        }
        clock.set_now(80_000_000);
        engine.execute_switch();
        assert_eq!(clock.epoch(), Some(50_000_000));
        engine.request_teardown("test");
    }

    #[tokio::test]
    async fn test_duplicate_issuance_suppressed() {
        let (engine, clock) = engine_at(0);
        engine.start_with_output(Box::new(NullOutput)).unwrap();
        {
            let mut st = engine.state.lock().unwrap();
            engine.transition(&mut st, BoundaryState::Armed).unwrap();
            st.pending = Some(segment(9, 1_000));
        }
        clock.set_now(1_000_000);
        engine.execute_switch();
        assert!(engine.is_live());

        // Re-arming the same boundary id is rejected at load time
        let err = engine.load_preview(segment(9, 90_000)).unwrap_err();
        assert!(err.to_string().contains("already issued"));
        engine.request_teardown("test");
    }

    #[tokio::test]
    async fn test_boundary_delta_metrics_violation() {
        let (engine, clock) = engine_at(0);
        engine.start_with_output(Box::new(NullOutput)).unwrap();
        {
            let mut st = engine.state.lock().unwrap();
            engine.transition(&mut st, BoundaryState::Armed).unwrap();
            st.pending = Some(segment(3, 1_000));
        }
        // Committing 200 ms after the declared boundary breaks the ±1 frame
        // authority and must be counted
        clock.set_now(1_200_000);
        engine.execute_switch();
        let summary = engine.metrics.summary();
        assert_eq!(summary.boundary_violations, 1);
        assert_eq!(summary.boundary_delta_ms_mean, 200.0);
        engine.request_teardown("test");
    }

    #[tokio::test]
    async fn test_teardown_from_stable_is_immediate() {
        let (engine, _clock) = engine_at(0);
        engine.start_with_output(Box::new(NullOutput)).unwrap();
        assert!(engine.request_teardown("operator"));
        assert!(engine.state.lock().unwrap().torn_down);
        // Idempotent
        assert!(engine.request_teardown("operator"));
    }

    #[tokio::test]
    async fn test_teardown_defers_in_transient_state() {
        let (engine, _clock) = engine_at(0);
        engine.start_with_output(Box::new(NullOutput)).unwrap();
        {
            let mut st = engine.state.lock().unwrap();
            engine.transition(&mut st, BoundaryState::Armed).unwrap();
            st.pending = Some(segment(2, 600_000));
        }

        // Transient: the request defers
        assert!(!engine.request_teardown("operator"));
        {
            let st = engine.state.lock().unwrap();
            assert!(!st.torn_down);
            assert_eq!(st.teardown_pending, Some("operator"));
        }

        // Reaching LIVE (stable) executes the deferred teardown
        engine.execute_switch();
        assert!(engine.state.lock().unwrap().torn_down);
    }

    #[tokio::test]
    async fn test_no_boundary_work_while_teardown_pending() {
        let (engine, _clock) = engine_at(0);
        engine.start_with_output(Box::new(NullOutput)).unwrap();
        {
            let mut st = engine.state.lock().unwrap();
            engine.transition(&mut st, BoundaryState::Armed).unwrap();
            st.pending = Some(segment(2, 600_000));
        }
        engine.request_teardown("operator");

        let err = engine.load_preview(segment(3, 700_000)).unwrap_err();
        assert!(err.to_string().contains("tearing down"));
    }

    #[tokio::test]
    async fn test_early_eof_enters_deficit() {
        let (engine, clock) = engine_at(0);
        engine.start_with_output(Box::new(NullOutput)).unwrap();
        {
            let mut st = engine.state.lock().unwrap();
            engine.transition(&mut st, BoundaryState::Armed).unwrap();
            st.pending = Some(segment(1, 1_000));
        }
        clock.set_now(1_000_000);
        engine.execute_switch();
        assert!(engine.is_live());
        // The previewless commit opened its own deficit; clear it so the
        // EarlyEof path is exercised in isolation
        engine.state.lock().unwrap().deficit = None;
        engine.pad.disengage();

        engine.on_producer_event(ProducerEvent::EarlyEof {
            segment_id: 1,
            delivered: 250,
            planned: 300,
        });
        assert!(engine.pad.engaged());
        assert!(engine.state.lock().unwrap().deficit.is_some());
        engine.request_teardown("test");
    }

    #[tokio::test]
    async fn test_deficit_duration_reported_at_boundary() {
        // No pacer thread here: this test owns the fake clock completely
        let (engine, clock) = engine_at(1_000_000);

        // First boundary commits at t=1s and anchors the epoch
        {
            let mut st = engine.state.lock().unwrap();
            engine.transition(&mut st, BoundaryState::Armed).unwrap();
            st.pending = Some(segment(1, 1_000));
        }
        engine.execute_switch();
        assert_eq!(clock.epoch(), Some(1_000_000));
        engine.state.lock().unwrap().deficit = None;
        engine.pad.disengage();

        // The live segment delivers 250 frames, then runs dry
        let fp = engine.format.frame_period_us();
        engine.timeline.begin_segment_absolute(0, 0);
        for i in 0..250 {
            assert!(engine.timeline.admit_frame(i * fp).is_admitted());
        }
        let ct_eof = engine.timeline.ct_cursor().unwrap();
        engine.on_producer_event(ProducerEvent::EarlyEof {
            segment_id: 1,
            delivered: 250,
            planned: 300,
        });
        assert!(engine.pad.engaged());

        // The next boundary lands ~50 frames later; the fill spans the gap
        let mut rx = engine.emitter.subscribe();
        {
            let mut st = engine.state.lock().unwrap();
            engine.transition(&mut st, BoundaryState::Armed).unwrap();
            st.pending = Some(segment(2, 10_967));
        }
        clock.set_now(10_967_000);
        engine.execute_switch();

        assert!(!engine.pad.engaged() || engine.state.lock().unwrap().deficit.is_some());
        let duration_ms = loop {
            let event = rx.try_recv().expect("deficit end event");
            if let AsRunKind::ContentDeficitFillEnd { duration_ms } = event.kind {
                break duration_ms;
            }
        };
        // 50 frames at 33,333 us is ~1666 ms; the boundary grid rounds to ms
        let expected_ms = ((10_967_000 - 1_000_000 - ct_eof) / 1000) as u64;
        assert_eq!(duration_ms, expected_ms);
        assert!((1664..=1669).contains(&duration_ms));
        assert_eq!(engine.metrics.summary().content_deficits, 1);
        engine.request_teardown("test");
    }

    #[tokio::test]
    async fn test_infeasible_boundary_skipped_before_convergence() {
        let (engine, _clock) = engine_at(0);
        engine.start_with_output(Box::new(NullOutput)).unwrap();

        // Boundary 1 s out cannot satisfy the 2.5 s feasibility requirement
        let err = engine.load_preview(segment(1, 1_000)).unwrap_err();
        assert!(err.to_string().contains("skipped"));
        assert_eq!(engine.state.lock().unwrap().skipped_boundaries, 1);
        // Session creation itself was never gated
        assert!(!engine.is_terminal());
        engine.request_teardown("test");
    }

    #[tokio::test]
    async fn test_infeasible_boundary_fails_after_convergence() {
        let (engine, clock) = engine_at(0);
        engine.start_with_output(Box::new(NullOutput)).unwrap();
        {
            let mut st = engine.state.lock().unwrap();
            engine.transition(&mut st, BoundaryState::Armed).unwrap();
            st.pending = Some(segment(1, 1_000));
        }
        clock.set_now(1_000_000);
        engine.execute_switch();
        assert!(engine.state.lock().unwrap().converged);

        let err = engine.load_preview(segment(2, 1_500)).unwrap_err();
        assert!(err.to_string().contains("infeasible"));
        engine.request_teardown("test");
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let (engine, _clock) = engine_at(0);
        engine.start_with_output(Box::new(NullOutput)).unwrap();
        let status = engine.status();
        assert_eq!(status.channel_id, "test");
        assert_eq!(status.boundary_state, "IDLE");
        assert!(!status.live);
        assert!(!status.converged);
        engine.request_teardown("test");
    }
}
