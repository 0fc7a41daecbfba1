//! File-backed segment producer
//!
//! Opens an asset, seeks to the segment offset, decodes video and audio to
//! the channel's program format (aspect-preserving letterbox/pillarbox, S16
//! interleaved audio at the channel rate) and pushes MT-stamped frames into
//! the ring under the decode gate.
//!
//! Seeks land on the nearest keyframe at or before the target; frames between
//! the keyframe and the offset are decoded and discarded so the first frame
//! that can lock a segment mapping is the one the schedule asked for.

use std::collections::VecDeque;
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedSender;

use ac_ffmpeg::codec::audio::frame::get_sample_format;
use ac_ffmpeg::codec::audio::{AudioDecoder, AudioResampler, ChannelLayout};
use ac_ffmpeg::codec::video::frame::get_pixel_format;
use ac_ffmpeg::codec::video::scaler::{Algorithm, VideoFrameScaler};
use ac_ffmpeg::codec::video::VideoDecoder;
use ac_ffmpeg::codec::Decoder;
use ac_ffmpeg::format::demuxer::{Demuxer, DemuxerWithStreamInfo, SeekTarget};
use ac_ffmpeg::format::io::IO;
use ac_ffmpeg::time::{TimeBase, Timestamp};

use crate::buffer::FrameRing;
use crate::config::ProgramFormat;
use crate::frame::{AudioFrame, VideoFrame};
use crate::metrics::ChannelMetrics;
use crate::producer::{Producer, ProducerControl, ProducerEvent, Segment};
use crate::timeline::{AdmissionResult, TimelineController};

/// How long the decode gate waits per attempt before re-checking stop.
const GATE_WAIT: Duration = Duration::from_millis(20);
/// Idle tick while shadowed or drained, waiting for a control flip.
const IDLE_TICK: Duration = Duration::from_millis(2);
/// Retries for a frame rejected as early before it is dropped.
const EARLY_RETRIES: u32 = 8;
/// Pre-mapping audio held back until the video admission locks the anchor.
const PENDING_AUDIO_CAP: usize = 64;

struct MediaPipeline {
    demuxer: DemuxerWithStreamInfo<File>,
    video_index: usize,
    audio_index: Option<usize>,
    video_decoder: VideoDecoder,
    audio_decoder: Option<AudioDecoder>,
    scaler: VideoFrameScaler,
    resampler: Option<AudioResampler>,
    /// Scaled content rectangle inside the program-format canvas.
    fit: FitRect,
    /// Demuxer exhausted and the decoder delay queue flushed.
    eof_flushed: bool,
}

/// Aspect-preserving placement of the source inside the output canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FitRect {
    w: u32,
    h: u32,
    x: u32,
    y: u32,
}

/// Compute the letterbox/pillarbox rectangle, even-aligned for 4:2:0 chroma.
fn fit_rect(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> FitRect {
    let src_aspect = src_w as f64 / src_h as f64;
    let dst_aspect = dst_w as f64 / dst_h as f64;

    let (w, h) = if src_aspect > dst_aspect {
        // Wider than the canvas: letterbox, bars top and bottom
        (dst_w, ((dst_w as f64 / src_aspect) as u32).max(2))
    } else {
        // Narrower than the canvas: pillarbox, bars left and right
        (((dst_h as f64 * src_aspect) as u32).max(2), dst_h)
    };
    let (w, h) = (w & !1, h & !1);
    FitRect {
        w,
        h,
        x: ((dst_w - w) / 2) & !1,
        y: ((dst_h - h) / 2) & !1,
    }
}

/// Copy one plane of the scaled frame into the packed canvas at an offset.
fn blit_plane(
    canvas: &mut [u8],
    canvas_w: usize,
    src: &[u8],
    src_stride: usize,
    rect_w: usize,
    rect_h: usize,
    off_x: usize,
    off_y: usize,
) {
    for row in 0..rect_h {
        let src_start = row * src_stride;
        let dst_start = (off_y + row) * canvas_w + off_x;
        if src_start + rect_w > src.len() || dst_start + rect_w > canvas.len() {
            break;
        }
        canvas[dst_start..dst_start + rect_w].copy_from_slice(&src[src_start..src_start + rect_w]);
    }
}

/// Decodes one asset segment on its own thread.
pub struct FileProducer {
    segment: Segment,
    format: ProgramFormat,
    ring: Arc<FrameRing>,
    timeline: Arc<TimelineController>,
    metrics: Arc<ChannelMetrics>,
    events: UnboundedSender<ProducerEvent>,
    control: Arc<ProducerControl>,

    media: Option<MediaPipeline>,
    cached_first: Option<VideoFrame>,
    pending_audio: VecDeque<AudioFrame>,
    last_video_mt: i64,
    truncated: bool,
}

impl FileProducer {
    pub fn new(
        segment: Segment,
        format: ProgramFormat,
        ring: Arc<FrameRing>,
        timeline: Arc<TimelineController>,
        metrics: Arc<ChannelMetrics>,
        events: UnboundedSender<ProducerEvent>,
    ) -> Self {
        Self {
            segment,
            format,
            ring,
            timeline,
            metrics,
            events,
            control: ProducerControl::new(),
            media: None,
            cached_first: None,
            pending_audio: VecDeque::new(),
            last_video_mt: i64::MIN,
            truncated: false,
        }
    }

    fn start_offset_us(&self) -> i64 {
        self.segment.start_offset_ms * 1000
    }

    fn open_pipeline(&self) -> Result<MediaPipeline> {
        let path = &self.segment.asset_path;
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let io = IO::from_seekable_read_stream(file);

        let mut demuxer = Demuxer::builder()
            .build(io)?
            .find_stream_info(None)
            .map_err(|(_, err)| err)
            .with_context(|| format!("probing {}", path.display()))?;

        let mut video: Option<usize> = None;
        let mut audio: Option<usize> = None;
        for (index, stream) in demuxer.streams().iter().enumerate() {
            let params = stream.codec_parameters();
            if params.is_video_codec() && video.is_none() {
                video = Some(index);
            } else if params.is_audio_codec() && audio.is_none() {
                audio = Some(index);
            }
        }
        let video_index = video.ok_or_else(|| anyhow!("{}: no video stream", path.display()))?;

        if self.segment.start_offset_ms > 0 {
            // Container seek: lands on the nearest keyframe at or before the
            // target; the decode loop discards up to the exact offset.
            demuxer.seek_to_timestamp(
                Timestamp::new(self.start_offset_us(), TimeBase::MICROSECONDS),
                SeekTarget::UpTo,
            )?;
        }

        let video_stream = &demuxer.streams()[video_index];
        let video_params = video_stream
            .codec_parameters()
            .into_video_codec_parameters()
            .ok_or_else(|| anyhow!("{}: malformed video parameters", path.display()))?;
        let video_decoder = VideoDecoder::from_stream(video_stream)?.build()?;

        let fit = fit_rect(
            video_params.width() as u32,
            video_params.height() as u32,
            self.format.video.width,
            self.format.video.height,
        );
        let scaler = VideoFrameScaler::builder()
            .source_pixel_format(video_params.pixel_format())
            .source_width(video_params.width())
            .source_height(video_params.height())
            .target_pixel_format(get_pixel_format("yuv420p"))
            .target_width(fit.w as usize)
            .target_height(fit.h as usize)
            .algorithm(Algorithm::Bilinear)
            .build()?;

        let (audio_index, audio_decoder, resampler) = match audio {
            Some(index) => {
                let stream = &demuxer.streams()[index];
                let params = stream
                    .codec_parameters()
                    .into_audio_codec_parameters()
                    .ok_or_else(|| anyhow!("{}: malformed audio parameters", path.display()))?;

                // Only the two formats the library actually feeds us are
                // converted; anything else fails here rather than miscoerce.
                let sf = params.sample_format();
                if sf != get_sample_format("s16") && sf != get_sample_format("fltp") {
                    anyhow::bail!(
                        "{}: unsupported audio sample format {:?}",
                        path.display(),
                        sf
                    );
                }

                let decoder = AudioDecoder::from_stream(stream)?.build()?;
                let target_layout = ChannelLayout::from_channels(self.format.audio.channels as u32)
                    .ok_or_else(|| anyhow!("bad channel count {}", self.format.audio.channels))?;
                let resampler = AudioResampler::builder()
                    .source_channel_layout(params.channel_layout().to_owned())
                    .source_sample_format(sf)
                    .source_sample_rate(params.sample_rate())
                    .target_channel_layout(target_layout)
                    .target_sample_format(get_sample_format("s16"))
                    .target_sample_rate(self.format.audio.sample_rate)
                    .build()?;
                (Some(index), Some(decoder), Some(resampler))
            }
            None => (None, None, None),
        };

        Ok(MediaPipeline {
            demuxer,
            video_index,
            audio_index,
            video_decoder,
            audio_decoder,
            scaler,
            resampler,
            fit,
            eof_flushed: false,
        })
    }

    /// Scale and letterbox one decoded frame into a packed program-format
    /// canvas, stamped with its media time.
    fn to_program_frame(
        &self,
        media: &mut MediaPipeline,
        decoded: &ac_ffmpeg::codec::video::VideoFrame,
    ) -> Result<VideoFrame> {
        let mt_us = timestamp_us(decoded.pts()).unwrap_or(self.last_video_mt + 1);

        let scaled = media.scaler.scale(decoded)?;
        let (canvas_w, canvas_h) = (
            self.format.video.width as usize,
            self.format.video.height as usize,
        );
        let y_size = canvas_w * canvas_h;
        let c_size = (canvas_w / 2) * (canvas_h / 2);
        let mut canvas = vec![16u8; y_size + 2 * c_size];
        canvas[y_size..].fill(128);

        let planes = scaled.planes();
        let fit = media.fit;
        blit_plane(
            &mut canvas[..y_size],
            canvas_w,
            planes[0].data(),
            planes[0].line_size(),
            fit.w as usize,
            fit.h as usize,
            fit.x as usize,
            fit.y as usize,
        );
        for (p, plane) in planes.iter().enumerate().skip(1).take(2) {
            let base = y_size + (p - 1) * c_size;
            blit_plane(
                &mut canvas[base..base + c_size],
                canvas_w / 2,
                plane.data(),
                plane.line_size(),
                fit.w as usize / 2,
                fit.h as usize / 2,
                fit.x as usize / 2,
                fit.y as usize / 2,
            );
        }

        Ok(VideoFrame {
            width: self.format.video.width,
            height: self.format.video.height,
            data: Bytes::from(canvas),
            pts_us: mt_us,
            dts_us: mt_us,
            duration_us: self.format.frame_period_us(),
            asset_uri: self.segment.asset_path.display().to_string(),
            has_ct: false,
        })
    }

    fn to_program_audio(&self, resampled: &ac_ffmpeg::codec::audio::AudioFrame) -> AudioFrame {
        let mt_us = timestamp_us(resampled.pts()).unwrap_or(0);
        let nb_samples = resampled.samples();
        let bytes = nb_samples * self.format.audio.channels as usize * 2;
        let data = resampled.planes()[0].data()[..bytes].to_vec();
        AudioFrame {
            sample_rate: self.format.audio.sample_rate,
            channels: self.format.audio.channels,
            nb_samples,
            data: Bytes::from(data),
            pts_us: mt_us,
            has_ct: false,
        }
    }

    /// Outcome of offering one video frame downstream.
    fn deliver_video(&mut self, mut frame: VideoFrame) -> bool {
        if self.control.write_barrier() {
            return false;
        }

        let mut attempts = 0;
        loop {
            match self.timeline.admit_frame(frame.pts_us) {
                AdmissionResult::Admitted(ct) => {
                    frame.assign_ct(ct);
                    while !self.ring.wait_for_slot(GATE_WAIT) {
                        if self.control.stop_requested() || self.control.write_barrier() {
                            return false;
                        }
                    }
                    if !self.ring.push_video(frame) {
                        // Lost a race for the freed slot; rare, retry via gate
                        self.metrics.record_dropped();
                        return false;
                    }
                    self.flush_pending_audio();
                    return true;
                }
                AdmissionResult::RejectedLate { ct_computed, ct_expected } => {
                    debug!(
                        "{}: late frame dropped (computed {} expected {})",
                        self.name(),
                        ct_computed,
                        ct_expected
                    );
                    self.metrics.record_dropped();
                    return false;
                }
                AdmissionResult::RejectedEarly { .. } => {
                    attempts += 1;
                    if attempts > EARLY_RETRIES {
                        self.metrics.record_dropped();
                        return false;
                    }
                    std::thread::sleep(Duration::from_micros(
                        self.format.frame_period_us() as u64,
                    ));
                    if self.control.stop_requested() {
                        return false;
                    }
                }
                AdmissionResult::RejectedNoMapping => {
                    // Transition window; the frame belongs to no timeline
                    self.metrics.record_dropped();
                    return false;
                }
            }
        }
    }

    fn deliver_audio(&mut self, frame: AudioFrame) {
        if self.control.write_barrier() {
            return;
        }
        if self.timeline.is_mapping_pending() {
            // Held until the first video admission locks the anchor
            if self.pending_audio.len() >= PENDING_AUDIO_CAP {
                self.pending_audio.pop_front();
            }
            self.pending_audio.push_back(frame);
            return;
        }
        self.push_audio_admitted(frame);
    }

    fn flush_pending_audio(&mut self) {
        while let Some(frame) = self.pending_audio.pop_front() {
            self.push_audio_admitted(frame);
        }
    }

    fn push_audio_admitted(&mut self, mut frame: AudioFrame) {
        if let AdmissionResult::Admitted(ct) = self.timeline.admit_audio(frame.pts_us) {
            frame.assign_ct(ct);
            while !self.ring.wait_for_slot(GATE_WAIT) {
                if self.control.stop_requested() || self.control.write_barrier() {
                    return;
                }
            }
            // Slot-gated above, so this only fails on a transient race
            let _ = self.ring.push_audio(frame);
        }
    }

    /// Decode until one program-format video frame past the segment offset is
    /// available. Audio met on the way is converted and queued behind it.
    fn next_video_frame(&mut self, media: &mut MediaPipeline) -> Result<Option<VideoFrame>> {
        loop {
            if self.control.stop_requested() {
                return Ok(None);
            }

            if let Some(frame) = media.video_decoder.take()? {
                let mt = timestamp_us(frame.pts()).unwrap_or(self.last_video_mt + 1);
                if mt < self.start_offset_us() {
                    // Keyframe preroll from the container seek
                    continue;
                }
                let program = self.to_program_frame(media, &frame)?;
                self.last_video_mt = program.pts_us;
                self.metrics.record_decoded();
                return Ok(Some(program));
            }

            if media.eof_flushed {
                return Ok(None);
            }
            match media.demuxer.take()? {
                Some(packet) => {
                    if packet.stream_index() == media.video_index {
                        media.video_decoder.push(packet)?;
                    } else if Some(packet.stream_index()) == media.audio_index {
                        self.decode_audio_packet(media, packet)?;
                    }
                }
                None => {
                    // Container done; the next take() calls drain the
                    // decoder's delay queue
                    media.video_decoder.flush()?;
                    media.eof_flushed = true;
                }
            }
        }
    }

    fn decode_audio_packet(
        &mut self,
        media: &mut MediaPipeline,
        packet: ac_ffmpeg::packet::Packet,
    ) -> Result<()> {
        let (Some(decoder), Some(resampler)) =
            (media.audio_decoder.as_mut(), media.resampler.as_mut())
        else {
            return Ok(());
        };
        decoder.push(packet)?;
        let mut out = Vec::new();
        while let Some(decoded) = decoder.take()? {
            resampler.push(decoded)?;
            while let Some(resampled) = resampler.take()? {
                out.push(self.to_program_audio(&resampled));
            }
        }
        for frame in out {
            self.deliver_audio(frame);
        }
        Ok(())
    }

    /// Park until a control flag changes. Used while shadowed and after EOF.
    fn idle_until(&self, released: impl Fn(&ProducerControl) -> bool) {
        while !self.control.stop_requested() && !released(&self.control) {
            std::thread::sleep(IDLE_TICK);
        }
    }

    fn send_event(&self, event: ProducerEvent) {
        let _ = self.events.send(event);
    }
}

impl Producer for FileProducer {
    fn name(&self) -> &'static str {
        "FileProducer"
    }

    fn start(&mut self) -> Result<()> {
        let media = self.open_pipeline()?;
        info!(
            "{}: opened {} (offset {} ms, planned {} frames, fit {:?})",
            self.name(),
            self.segment.asset_path.display(),
            self.segment.start_offset_ms,
            self.segment.planned_frame_count,
            media.fit,
        );
        self.media = Some(media);
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let mut media = self
            .media
            .take()
            .ok_or_else(|| anyhow!("run() before start()"))?;
        let segment_id = self.segment.segment_id;

        // Shadow phase: cache the first frame, publish nothing.
        if self.control.shadow() {
            match self.next_video_frame(&mut media)? {
                Some(frame) => {
                    self.cached_first = Some(frame);
                    self.send_event(ProducerEvent::Ready { segment_id });
                }
                None => {
                    self.send_event(ProducerEvent::Failed {
                        segment_id,
                        error: "no decodable frame at segment offset".into(),
                    });
                    return Ok(());
                }
            }
            self.idle_until(|c| !c.shadow());
            if self.control.stop_requested() {
                return Ok(());
            }
        }

        // Live phase: the cached shadow frame goes first.
        if let Some(frame) = self.cached_first.take() {
            if self.deliver_video(frame) {
                self.control.record_delivered();
            }
        }

        loop {
            if self.control.stop_requested() {
                return Ok(());
            }

            let planned = self.segment.planned_frame_count;
            if planned > 0 && self.control.frames_delivered() >= planned {
                if !self.truncated {
                    self.truncated = true;
                    warn!(
                        "{}: segment {} truncated at planned count {}",
                        self.name(),
                        segment_id,
                        planned
                    );
                    self.send_event(ProducerEvent::ContentTruncated { segment_id });
                }
                // Schedule stays authoritative; hold until told to stop
                self.idle_until(|_| false);
                return Ok(());
            }

            let decode_started = std::time::Instant::now();
            match self.next_video_frame(&mut media)? {
                Some(frame) => {
                    self.metrics
                        .decode_latency_us
                        .record(decode_started.elapsed().as_micros() as u64);
                    if self.deliver_video(frame) {
                        self.control.record_delivered();
                    }
                }
                None => {
                    let delivered = self.control.frames_delivered();
                    if planned > 0 && delivered < planned {
                        warn!(
                            "{}: early EOF on segment {} ({} of {} frames)",
                            self.name(),
                            segment_id,
                            delivered,
                            planned
                        );
                        self.send_event(ProducerEvent::EarlyEof {
                            segment_id,
                            delivered,
                            planned,
                        });
                    } else {
                        self.send_event(ProducerEvent::Eof {
                            segment_id,
                            delivered,
                        });
                    }
                    // The engine, not the producer, decides when to move on
                    self.idle_until(|_| false);
                    return Ok(());
                }
            }
        }
    }

    fn control(&self) -> &Arc<ProducerControl> {
        &self.control
    }
}

fn timestamp_us(ts: Timestamp) -> Option<i64> {
    if ts.is_null() {
        return None;
    }
    Some(ts.with_time_base(TimeBase::MICROSECONDS).timestamp())
}
