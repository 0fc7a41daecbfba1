//! Typed configuration for the playout core
//!
//! Every tunable is carried by an explicit struct handed to the component at
//! construction. Defaults encode the values the channels run with in
//! production; a JSON config file can override any of them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Canonical signal format of a channel. Fixed for the lifetime of a playout
/// instance; producers and sinks operate in this format or fail fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramFormat {
    pub video: VideoFormat,
    pub audio: AudioFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    /// Frame rate as a rational, e.g. 30000/1001 for NTSC 29.97.
    pub fps_num: u32,
    pub fps_den: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for ProgramFormat {
    fn default() -> Self {
        Self {
            video: VideoFormat {
                width: 1280,
                height: 720,
                fps_num: 30,
                fps_den: 1,
            },
            audio: AudioFormat {
                sample_rate: 48_000,
                channels: 2,
            },
        }
    }
}

impl ProgramFormat {
    /// Duration of one video frame in microseconds.
    pub fn frame_period_us(&self) -> i64 {
        (1_000_000i64 * self.video.fps_den as i64) / self.video.fps_num as i64
    }

    pub fn fps(&self) -> f64 {
        self.video.fps_num as f64 / self.video.fps_den as f64
    }

    /// Reject shapes no encoder or sink can operate in.
    pub fn validate(&self) -> Result<()> {
        if self.video.width < 2 || self.video.height < 2 {
            anyhow::bail!(
                "invalid video dimensions {}x{}",
                self.video.width,
                self.video.height
            );
        }
        if self.video.fps_num == 0 || self.video.fps_den == 0 {
            anyhow::bail!("invalid frame rate {}/{}", self.video.fps_num, self.video.fps_den);
        }
        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            anyhow::bail!(
                "invalid audio format {} Hz / {} ch",
                self.audio.sample_rate,
                self.audio.channels
            );
        }
        Ok(())
    }
}

/// Admission window tuning for the timeline controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimelineConfig {
    pub frame_period_us: i64,
    /// Snap window around the expected CT. Default: one frame period.
    pub tolerance_us: i64,
    /// Frames mapping earlier than expected - late_threshold are rejected.
    pub late_threshold_us: i64,
    /// Frames mapping later than expected + early_threshold are rejected.
    pub early_threshold_us: i64,
    /// Lag beyond which the session should be restarted rather than chased.
    pub catch_up_limit_us: i64,
}

impl TimelineConfig {
    /// Derive the full window set from a frame rate.
    pub fn from_fps(fps: f64, late_frames: i64, early_frames: i64) -> Self {
        let frame_period_us = (1_000_000f64 / fps).round() as i64;
        Self {
            frame_period_us,
            tolerance_us: frame_period_us,
            late_threshold_us: (late_frames * frame_period_us).min(500_000),
            early_threshold_us: early_frames * frame_period_us,
            catch_up_limit_us: 5_000_000,
        }
    }

    pub fn from_format(format: &ProgramFormat) -> Self {
        Self::from_fps(format.fps(), 5, 30)
    }
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self::from_fps(30.0, 5, 30)
    }
}

/// Output pacing tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Equilibrium buffer depth the pacer aims to hold.
    pub target_depth: usize,
    /// Pad emitted while depth is at or above this is a flow-control bug,
    /// not starvation, and is counted as a violation.
    pub pad_depth_violation: usize,
    /// Consecutive empty iterations before the pacer treats the stream as
    /// ended and re-arms its epoch pair.
    pub idle_rearm_iterations: u32,
    /// Steady-state drift bound between wall clock and emitted CT.
    pub max_drift_us: i64,
    /// How long an out-of-band buffer depth must persist before the
    /// equilibrium warning fires.
    pub equilibrium_grace_us: i64,
    /// H.264 bitrate for the output encoder.
    pub video_bitrate: u64,
    /// AAC bitrate for the output encoder.
    pub audio_bitrate: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            target_depth: 3,
            pad_depth_violation: 10,
            idle_rearm_iterations: 5,
            max_drift_us: 100_000,
            equilibrium_grace_us: 1_000_000,
            video_bitrate: 3_500_000,
            audio_bitrate: 128_000,
        }
    }
}

/// Frame ring capacities.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BufferConfig {
    pub video_capacity: usize,
    pub audio_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            video_capacity: 60,
            audio_capacity: 256,
        }
    }
}

/// Boundary lifecycle tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Prefeed is issued this far ahead of the boundary deadline.
    pub min_prefeed_lead_time_ms: i64,
    /// Expected worst-case producer spin-up, part of the feasibility check.
    pub startup_latency_ms: i64,
    /// Deferred teardown older than this forces FailedTerminal.
    pub teardown_grace_ms: i64,
    /// Startup convergence must complete within this window.
    pub convergence_timeout_ms: i64,
    /// Infeasible boundaries tolerated before convergence.
    pub max_skipped_boundaries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_prefeed_lead_time_ms: 2_000,
            startup_latency_ms: 500,
            teardown_grace_ms: 5_000,
            convergence_timeout_ms: 30_000,
            max_skipped_boundaries: 3,
        }
    }
}

/// Whole-process configuration loaded at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayoutConfig {
    pub engine: EngineConfig,
    pub mux: MuxConfig,
    pub buffer: BufferConfig,
}

impl PlayoutConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_period() {
        let fmt = ProgramFormat::default();
        assert_eq!(fmt.frame_period_us(), 33_333);

        let ntsc = ProgramFormat {
            video: VideoFormat {
                width: 720,
                height: 480,
                fps_num: 30_000,
                fps_den: 1001,
            },
            ..Default::default()
        };
        assert_eq!(ntsc.frame_period_us(), 33_366);
    }

    #[test]
    fn test_timeline_config_from_fps() {
        let cfg = TimelineConfig::from_fps(30.0, 5, 30);
        assert_eq!(cfg.frame_period_us, 33_333);
        assert_eq!(cfg.tolerance_us, 33_333);
        // 5 frames at 30 fps is under the 500 ms cap
        assert_eq!(cfg.late_threshold_us, 166_665);
        assert_eq!(cfg.early_threshold_us, 999_990);
        assert_eq!(cfg.catch_up_limit_us, 5_000_000);
    }

    #[test]
    fn test_late_threshold_capped() {
        // At 5 fps, 5 frames would be 1 s; the cap keeps it at 500 ms
        let cfg = TimelineConfig::from_fps(5.0, 5, 30);
        assert_eq!(cfg.late_threshold_us, 500_000);
    }

    #[test]
    fn test_format_validation() {
        assert!(ProgramFormat::default().validate().is_ok());

        let mut bad = ProgramFormat::default();
        bad.video.fps_num = 0;
        assert!(bad.validate().is_err());

        let mut bad = ProgramFormat::default();
        bad.audio.channels = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let cfg = PlayoutConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: PlayoutConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.buffer.video_capacity, cfg.buffer.video_capacity);
        assert_eq!(back.engine.min_prefeed_lead_time_ms, 2_000);
    }

    #[test]
    fn test_partial_config_file() {
        // Missing sections fall back to defaults
        let cfg: PlayoutConfig = serde_json::from_str(r#"{"engine":{"min_prefeed_lead_time_ms":1500,"startup_latency_ms":500,"teardown_grace_ms":5000,"convergence_timeout_ms":30000,"max_skipped_boundaries":3}}"#).unwrap();
        assert_eq!(cfg.engine.min_prefeed_lead_time_ms, 1_500);
        assert_eq!(cfg.buffer.video_capacity, 60);
    }
}
