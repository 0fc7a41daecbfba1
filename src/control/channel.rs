//! Channel registry
//!
//! Maps channel ids to playout instances. Instances are isolated: each has
//! its own clock, buffers, sockets and producer threads, and a failure in
//! one never touches another.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use log::info;

use crate::clock::MasterClock;
use crate::config::{PlayoutConfig, ProgramFormat};
use crate::engine::{LoadOutcome, PlayoutEngine, PlayoutStatus, SwitchOutcome};
use crate::producer::Segment;

struct ChannelEntry {
    engine: Arc<PlayoutEngine>,
    plan_handle: Option<String>,
}

/// All running channels of this process.
pub struct ChannelManager {
    config: PlayoutConfig,
    channels: Mutex<HashMap<String, ChannelEntry>>,
}

impl ChannelManager {
    pub fn new(config: PlayoutConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Initialize a playout instance. Idempotent: starting a started channel
    /// succeeds without state change. Does not imply frame output.
    pub fn start_channel(
        &self,
        channel_id: &str,
        plan_handle: Option<String>,
        port: u16,
        format: ProgramFormat,
    ) -> Result<()> {
        let mut channels = self.channels.lock().unwrap();
        if channels.contains_key(channel_id) {
            info!("channel {}: already started", channel_id);
            return Ok(());
        }

        format.validate()?;
        let engine = PlayoutEngine::new(channel_id, format, &self.config, MasterClock::new());
        engine.start(port)?;
        channels.insert(
            channel_id.to_string(),
            ChannelEntry {
                engine,
                plan_handle,
            },
        );
        Ok(())
    }

    pub fn load_preview(
        &self,
        channel_id: &str,
        asset_path: PathBuf,
        start_offset_ms: i64,
        hard_stop_time_ms: i64,
        target_boundary_time_ms: i64,
        planned_frame_count: u64,
    ) -> Result<LoadOutcome> {
        let engine = self.engine(channel_id)?;
        // The boundary instant itself is the id: re-sending the same
        // boundary is a duplicate, not a new issuance.
        let segment = Segment {
            segment_id: target_boundary_time_ms as u64,
            asset_path,
            start_offset_ms,
            hard_stop_time_ms,
            target_boundary_time_ms,
            planned_frame_count,
        };
        engine.load_preview(segment)
    }

    pub fn switch_to_live(&self, channel_id: &str) -> Result<SwitchOutcome> {
        self.engine(channel_id)?.switch_to_live()
    }

    pub fn update_plan(&self, channel_id: &str, plan_handle: String) -> Result<()> {
        let mut channels = self.channels.lock().unwrap();
        let entry = channels
            .get_mut(channel_id)
            .ok_or_else(|| anyhow!("channel {} not found", channel_id))?;
        entry.plan_handle = Some(plan_handle);
        Ok(())
    }

    /// Graceful stop. Idempotent: stopping an unknown or stopped channel
    /// succeeds.
    pub fn stop_channel(&self, channel_id: &str) -> Result<()> {
        let removed = self.channels.lock().unwrap().remove(channel_id);
        if let Some(entry) = removed {
            entry.engine.request_teardown("stop channel");
        } else {
            info!("channel {}: already stopped", channel_id);
        }
        Ok(())
    }

    pub fn status(&self, channel_id: &str) -> Result<PlayoutStatus> {
        Ok(self.engine(channel_id)?.status())
    }

    pub fn is_live(&self, channel_id: &str) -> bool {
        self.engine(channel_id).map(|e| e.is_live()).unwrap_or(false)
    }

    /// Stop every channel; used by signal handlers at process exit.
    pub fn stop_all(&self) {
        let drained: Vec<_> = {
            let mut channels = self.channels.lock().unwrap();
            channels.drain().collect()
        };
        for (id, entry) in drained {
            info!("channel {}: stopping at shutdown", id);
            entry.engine.request_teardown("process shutdown");
        }
    }

    fn engine(&self, channel_id: &str) -> Result<Arc<PlayoutEngine>> {
        self.channels
            .lock()
            .unwrap()
            .get(channel_id)
            .map(|e| Arc::clone(&e.engine))
            .ok_or_else(|| anyhow!("channel {} not found", channel_id))
    }
}
