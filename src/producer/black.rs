//! Failsafe black producer
//!
//! Emits format-valid black video with monotonic media timestamps and no
//! audio. The engine switches to it when live content is unavailable;
//! switching back requires an explicit scheduler command. It never receives
//! segment parameters.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::info;

use crate::buffer::FrameRing;
use crate::config::ProgramFormat;
use crate::frame::VideoFrame;
use crate::metrics::ChannelMetrics;
use crate::producer::{Producer, ProducerControl};
use crate::timeline::{AdmissionResult, TimelineController};

const GATE_WAIT: Duration = Duration::from_millis(20);

pub struct BlackFrameProducer {
    format: ProgramFormat,
    ring: Arc<FrameRing>,
    timeline: Arc<TimelineController>,
    metrics: Arc<ChannelMetrics>,
    control: Arc<ProducerControl>,
    /// Template frame reused for every push; only timestamps change.
    template: VideoFrame,
    next_mt_us: i64,
}

impl BlackFrameProducer {
    pub fn new(
        format: ProgramFormat,
        ring: Arc<FrameRing>,
        timeline: Arc<TimelineController>,
        metrics: Arc<ChannelMetrics>,
    ) -> Self {
        let template = VideoFrame::black(
            format.video.width,
            format.video.height,
            0,
            format.frame_period_us(),
        );
        Self {
            format,
            ring,
            timeline,
            metrics,
            control: ProducerControl::new(),
            template,
            next_mt_us: 0,
        }
    }
}

impl Producer for BlackFrameProducer {
    fn name(&self) -> &'static str {
        "BlackFrameProducer"
    }

    fn start(&mut self) -> Result<()> {
        info!(
            "{}: engaged at {}x{}",
            self.name(),
            self.format.video.width,
            self.format.video.height
        );
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let period = self.format.frame_period_us();
        loop {
            if self.control.stop_requested() {
                return Ok(());
            }

            let mut frame = self.template.clone();
            frame.pts_us = self.next_mt_us;
            frame.dts_us = self.next_mt_us;

            if self.control.write_barrier() {
                self.next_mt_us += period;
                std::thread::sleep(Duration::from_micros(period as u64));
                continue;
            }

            match self.timeline.admit_frame(frame.pts_us) {
                AdmissionResult::Admitted(ct) => {
                    frame.assign_ct(ct);
                    while !self.ring.wait_for_slot(GATE_WAIT) {
                        if self.control.stop_requested() {
                            return Ok(());
                        }
                    }
                    if self.ring.push_video(frame) {
                        self.control.record_delivered();
                        self.metrics.record_decoded();
                    }
                    self.next_mt_us += period;
                }
                // No timeline to feed yet; pace in real time and retry
                _ => {
                    std::thread::sleep(Duration::from_micros(period as u64));
                }
            }
        }
    }

    fn control(&self) -> &Arc<ProducerControl> {
        &self.control
    }
}
