//! The pacing loop
//!
//! One iteration: peek the next video frame's CT, sleep until the wall-clock
//! instant that CT maps to, emit exactly one video frame, then every audio
//! frame at or behind it. Timestamps are pass-through: the loop keeps no CT
//! counter of its own and never resets on attach, so a producer whose CT
//! starts at an hour emits PTS starting at an hour.
//!
//! When the ring is empty and pad is engaged, the loop synthesizes black and
//! silence at the same cadence; transport never stalls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use log::{info, warn};

use crate::buffer::FrameRing;
use crate::clock::MasterClock;
use crate::config::{MuxConfig, ProgramFormat};
use crate::frame::{AudioFrame, VideoFrame};
use crate::metrics::ChannelMetrics;
use crate::stop::StopSignal;

/// Idle poll interval while the ring is empty and pad is off.
const IDLE_POLL_US: i64 = 1_000;

/// Where emitted frames go. The production implementation encodes to
/// MPEG-TS; tests record.
pub trait FrameOutput: Send {
    fn write_video(&mut self, frame: &VideoFrame) -> Result<()>;
    fn write_audio(&mut self, frame: &AudioFrame) -> Result<()>;
    /// End-of-stream flush of any encoder delay queues.
    fn flush(&mut self) -> Result<()>;
}

/// Pad switch shared between the engine (writer) and the pacer (reader).
#[derive(Debug, Default)]
pub struct PadControl {
    engaged: AtomicBool,
}

impl PadControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn engage(&self) {
        self.engaged.store(true, Ordering::Release);
    }

    pub fn disengage(&self) {
        self.engaged.store(false, Ordering::Release);
    }

    pub fn engaged(&self) -> bool {
        self.engaged.load(Ordering::Acquire)
    }
}

/// Output-driven pacing loop for one channel.
pub struct MuxPacer {
    ring: Arc<FrameRing>,
    clock: MasterClock,
    config: MuxConfig,
    format: ProgramFormat,
    metrics: Arc<ChannelMetrics>,
    pad: Arc<PadControl>,
    stop: StopSignal,

    /// Wall/CT anchor pair; rearmed after sustained idle.
    epochs: Option<(i64, i64)>,
    last_emitted_ct: Option<i64>,
    last_emit_wall: Option<i64>,
    empty_iters: u32,
    rearm_flushed: bool,
    out_of_band_since: Option<i64>,
    last_drift_warn: i64,
}

impl MuxPacer {
    pub fn new(
        ring: Arc<FrameRing>,
        clock: MasterClock,
        config: MuxConfig,
        format: ProgramFormat,
        metrics: Arc<ChannelMetrics>,
        pad: Arc<PadControl>,
        stop: StopSignal,
    ) -> Self {
        Self {
            ring,
            clock,
            config,
            format,
            metrics,
            pad,
            stop,
            epochs: None,
            last_emitted_ct: None,
            last_emit_wall: None,
            empty_iters: 0,
            rearm_flushed: false,
            out_of_band_since: None,
            last_drift_warn: 0,
        }
    }

    /// Drive the loop until stop. Runs on its own thread.
    pub fn run(&mut self, output: &mut dyn FrameOutput) {
        info!("MuxPacer: attached ({} fps)", self.format.fps());
        while !self.stop.stopped() {
            if let Err(e) = self.tick(output) {
                warn!("MuxPacer: output error: {:#}", e);
            }
        }
        let _ = output.flush();
        info!("MuxPacer: detached");
    }

    /// One pacing iteration. Public for deterministic tests.
    pub fn tick(&mut self, output: &mut dyn FrameOutput) -> Result<()> {
        let depth = self.ring.video_depth();
        self.metrics.set_buffer_depth(depth);
        self.check_equilibrium(depth);

        // Pad requested while real frames queue up is a flow-control bug in
        // the feeder, not starvation; count it and keep consuming content.
        if self.pad.engaged() && depth >= self.config.pad_depth_violation {
            self.metrics.record_pad_while_depth_high();
            warn!("MuxPacer: pad engaged at depth {}", depth);
        }

        match self.ring.peek_video().map(|f| (f.pts_us, f.has_ct)) {
            Some((_, false)) => {
                // Shadow-mode frame leaked into the ring; never emit it
                self.ring.pop_video();
                self.metrics.record_dropped();
                Ok(())
            }
            Some((ct, true)) => self.emit_content(ct, output),
            None => {
                if self.pad.engaged() {
                    self.emit_pad(output)
                } else {
                    self.idle(output)
                }
            }
        }
    }

    fn emit_content(&mut self, ct: i64, output: &mut dyn FrameOutput) -> Result<()> {
        self.pace_to(ct);
        if self.stop.stopped() {
            return Ok(());
        }

        // Exactly one video frame per iteration; no burst consumption
        let Some(frame) = self.ring.pop_video() else {
            return Ok(());
        };
        output.write_video(&frame)?;
        self.note_emitted(ct);

        self.drain_audio_upto(ct, output)?;
        self.empty_iters = 0;
        self.rearm_flushed = false;
        Ok(())
    }

    fn emit_pad(&mut self, output: &mut dyn FrameOutput) -> Result<()> {
        let period = self.format.frame_period_us();
        let next_ct = match self.last_emitted_ct {
            Some(last) => last + period,
            // Nothing emitted yet: pick up from the channel's live position
            None => self
                .clock
                .epoch()
                .map(|e| self.clock.now_utc_us() - e)
                .unwrap_or(0),
        };
        self.pace_to(next_ct);
        if self.stop.stopped() {
            return Ok(());
        }

        let mut black = VideoFrame::black(
            self.format.video.width,
            self.format.video.height,
            next_ct,
            period,
        );
        black.has_ct = true;
        output.write_video(&black)?;

        // Pad carries its own silence; steady state never fabricates audio
        let nb_samples =
            (self.format.audio.sample_rate as i64 * period / 1_000_000).max(1) as usize;
        let mut silence = AudioFrame::silence(
            self.format.audio.sample_rate,
            self.format.audio.channels,
            nb_samples,
            next_ct,
        );
        silence.has_ct = true;
        output.write_audio(&silence)?;

        self.note_emitted(next_ct);
        Ok(())
    }

    fn idle(&mut self, output: &mut dyn FrameOutput) -> Result<()> {
        self.empty_iters += 1;
        if self.empty_iters >= self.config.idle_rearm_iterations && !self.rearm_flushed {
            // End of segment with no pad pending: flush the encoder delay
            // queue and re-arm pacing for whatever comes next
            output.flush()?;
            self.epochs = None;
            self.rearm_flushed = true;
        }
        if self.clock.is_fake() {
            // Idle polling must not move a test clock; only paced emission
            // and the test itself advance it
            std::thread::sleep(std::time::Duration::from_millis(1));
        } else {
            self.clock.sleep_until(self.clock.now_utc_us() + IDLE_POLL_US);
        }
        Ok(())
    }

    /// Sleep until the wall instant `ct` maps to under the current anchor
    /// pair, establishing the anchor on first use.
    fn pace_to(&mut self, ct: i64) {
        let (wall_epoch, ct_epoch) =
            *self.epochs.get_or_insert((self.clock.now_utc_us(), ct));
        let target_wall = wall_epoch + (ct - ct_epoch);
        self.clock.sleep_until(target_wall);
    }

    fn drain_audio_upto(&mut self, video_ct: i64, output: &mut dyn FrameOutput) -> Result<()> {
        loop {
            match self.ring.peek_audio().map(|a| (a.pts_us, a.has_ct)) {
                Some((_, false)) => {
                    self.ring.pop_audio();
                    self.metrics.record_dropped();
                }
                Some((pts, true)) if pts <= video_ct => {
                    let Some(frame) = self.ring.pop_audio() else {
                        return Ok(());
                    };
                    output.write_audio(&frame)?;
                }
                _ => return Ok(()),
            }
        }
    }

    fn note_emitted(&mut self, ct: i64) {
        let now = self.clock.now_utc_us();
        if let Some(prev) = self.last_emit_wall {
            self.metrics.frame_gap_us.store(now - prev, Ordering::Relaxed);
        }
        self.last_emit_wall = Some(now);
        self.last_emitted_ct = Some(ct);
        self.metrics.record_emitted();

        // Bounded drift: wall progress and emitted CT stay within the limit
        if let Some(epoch) = self.clock.epoch() {
            let drift = (now - epoch) - ct;
            if drift.abs() > self.config.max_drift_us && now - self.last_drift_warn > 1_000_000 {
                warn!("MuxPacer: drift {}us exceeds bound", drift);
                self.last_drift_warn = now;
            }
        }
    }

    fn check_equilibrium(&mut self, depth: usize) {
        // Only meaningful once the stream is flowing
        if self.last_emitted_ct.is_none() {
            return;
        }
        let in_band = depth >= 1 && depth <= 2 * self.config.target_depth;
        if in_band {
            self.out_of_band_since = None;
            return;
        }
        let now = self.clock.now_utc_us();
        match self.out_of_band_since {
            None => self.out_of_band_since = Some(now),
            Some(since) if now - since > self.config.equilibrium_grace_us => {
                self.metrics.record_equilibrium_warning();
                if depth == 0 {
                    self.metrics.record_underrun();
                }
                warn!("MuxPacer: buffer depth {} out of equilibrium", depth);
                self.out_of_band_since = Some(now);
            }
            Some(_) => {}
        }
    }
}
