//! Output encoders
//!
//! Packed program-format frames in, timestamped H.264/AAC packets out.
//! Video runs on the 90 kHz MPEG-TS time base, audio on the sample-rate time
//! base. Each stream carries its own monotonicity guard: a regression is
//! corrected by the minimum forward adjustment that restores legality, never
//! by renumbering.

use anyhow::{Result, anyhow};
use log::{debug, info};

use ac_ffmpeg::codec::audio::frame::get_sample_format;
use ac_ffmpeg::codec::audio::{AudioEncoder, AudioFrameMut, AudioResampler, ChannelLayout};
use ac_ffmpeg::codec::video::frame::get_pixel_format;
use ac_ffmpeg::codec::video::{VideoEncoder, VideoFrameMut};
use ac_ffmpeg::codec::{CodecParameters, Encoder};
use ac_ffmpeg::packet::Packet;
use ac_ffmpeg::time::{TimeBase, Timestamp};

use crate::config::{MuxConfig, ProgramFormat};
use crate::frame::{AudioFrame, VideoFrame};
use crate::mux::pacer::FrameOutput;
use crate::mux::sink::TsFanoutSink;

/// Encoder fallback chain: hardware first, software always available last.
/// Tuned for continuous low-latency streaming.
const ENCODER_CHAIN: &[(&str, &[(&str, &str)])] = &[
    (
        "h264_nvenc",
        &[
            ("preset", "p2"),
            ("tune", "ll"),
            ("zerolatency", "1"),
            ("rc", "cbr"),
            ("forced-idr", "1"),
        ],
    ),
    (
        "libx264",
        &[
            ("profile", "main"),
            ("preset", "fast"),
            ("tune", "zerolatency"),
            ("bframes", "0"),
            ("sliced-threads", "1"),
            ("sync-lookahead", "0"),
        ],
    ),
];

/// Per-stream monotonic timestamp guard.
#[derive(Debug, Default)]
struct MonotonicGuard {
    last_pts: Option<i64>,
    last_dts: Option<i64>,
    corrections: u64,
}

impl MonotonicGuard {
    /// Legalize one packet's timestamps in `time_base` ticks.
    fn apply(&mut self, packet: Packet, time_base: TimeBase) -> Packet {
        let mut packet = packet;

        let pts = packet.pts().timestamp();
        let fixed_pts = match self.last_pts {
            Some(last) if pts <= last => last + 1,
            _ => pts,
        };

        let dts = packet.dts().timestamp();
        let mut fixed_dts = match self.last_dts {
            Some(last) if dts <= last => last + 1,
            _ => dts,
        };
        // DTS may never exceed PTS
        if fixed_dts > fixed_pts {
            fixed_dts = fixed_pts;
        }

        if fixed_pts != pts || fixed_dts != dts {
            self.corrections += 1;
            debug!(
                "timestamp regression corrected: pts {} -> {}, dts {} -> {}",
                pts, fixed_pts, dts, fixed_dts
            );
            packet = packet
                .with_pts(Timestamp::new(fixed_pts, time_base))
                .with_dts(Timestamp::new(fixed_dts, time_base));
        }

        self.last_pts = Some(fixed_pts);
        self.last_dts = Some(fixed_dts);
        packet
    }
}

/// H.264 encoder on the 90 kHz time base.
pub struct VideoStreamEncoder {
    encoder: VideoEncoder,
    time_base: TimeBase,
    width: usize,
    height: usize,
    guard: MonotonicGuard,
    pub codec_name: String,
}

impl VideoStreamEncoder {
    pub fn new(format: &ProgramFormat, bitrate: u64) -> Result<Self> {
        let width = format.video.width as usize;
        let height = format.video.height as usize;
        let time_base = TimeBase::new(1, 90_000);
        let pixel_format = get_pixel_format("yuv420p");
        let gop = (2.0 * format.fps()).round() as i64;

        for (codec, options) in ENCODER_CHAIN {
            let mut builder = match VideoEncoder::builder(codec) {
                Ok(b) => b,
                Err(e) => {
                    debug!("encoder {} not available, skipping: {}", codec, e);
                    continue;
                }
            };
            let bitrate_s = bitrate.to_string();
            let gop_s = gop.to_string();
            builder = builder
                .pixel_format(pixel_format)
                .width(width)
                .height(height)
                .time_base(time_base)
                .set_option("b", bitrate_s.as_str())
                .set_option("g", gop_s.as_str());
            for (k, v) in *options {
                builder = builder.set_option(k, v);
            }
            match builder.build() {
                Ok(encoder) => {
                    info!("video encoder: {}", codec);
                    return Ok(Self {
                        encoder,
                        time_base,
                        width,
                        height,
                        guard: MonotonicGuard::default(),
                        codec_name: codec.to_string(),
                    });
                }
                Err(e) => debug!("encoder {} failed to initialize: {}", codec, e),
            }
        }
        Err(anyhow!("no H.264 encoder available"))
    }

    pub fn codec_parameters(&self) -> CodecParameters {
        self.encoder.codec_parameters().into()
    }

    /// Encode one frame at its CT; drain whatever packets come out.
    pub fn encode(&mut self, frame: &VideoFrame) -> Result<Vec<Packet>> {
        let pts_90k = frame.pts_us * 9 / 100;

        let mut vf = VideoFrameMut::black(get_pixel_format("yuv420p"), self.width, self.height);
        self.fill_planes(&mut vf, &frame.data);
        let vf = vf
            .with_time_base(self.time_base)
            .with_pts(Timestamp::new(pts_90k, self.time_base))
            .freeze();

        self.encoder.push(vf)?;
        self.drain()
    }

    pub fn flush(&mut self) -> Result<Vec<Packet>> {
        self.encoder.flush()?;
        self.drain()
    }

    fn drain(&mut self) -> Result<Vec<Packet>> {
        let mut out = Vec::new();
        while let Some(packet) = self.encoder.take()? {
            out.push(self.guard.apply(packet, self.time_base));
        }
        Ok(out)
    }

    /// Copy the packed YUV420 payload into the frame's (possibly padded)
    /// planes, row by row where strides differ.
    fn fill_planes(&self, vf: &mut VideoFrameMut, packed: &[u8]) {
        let (w, h) = (self.width, self.height);
        let offsets = [(0usize, w, h), (w * h, w / 2, h / 2), (w * h + (w / 2) * (h / 2), w / 2, h / 2)];

        let mut planes = vf.planes_mut();
        for (p, (src_off, pw, ph)) in offsets.iter().enumerate() {
            let dst = planes[p].data_mut();
            let line_size = dst.len() / ph;
            let src = &packed[*src_off..*src_off + pw * ph];
            if line_size == *pw {
                dst[..pw * ph].copy_from_slice(src);
            } else {
                for row in 0..*ph {
                    dst[row * line_size..row * line_size + pw]
                        .copy_from_slice(&src[row * pw..(row + 1) * pw]);
                }
            }
        }
    }
}

/// AAC encoder on the sample-rate time base. The native encoder wants planar
/// float, so a converter sits in front of it and also rechunks to the
/// encoder's frame size.
pub struct AudioStreamEncoder {
    resampler: AudioResampler,
    encoder: AudioEncoder,
    time_base: TimeBase,
    channel_layout: ChannelLayout,
    sample_rate: u32,
    guard: MonotonicGuard,
}

impl AudioStreamEncoder {
    pub fn new(format: &ProgramFormat, bitrate: u64) -> Result<Self> {
        let sample_rate = format.audio.sample_rate;
        let time_base = TimeBase::new(1, sample_rate as i32);
        let channel_layout = ChannelLayout::from_channels(format.audio.channels as u32)
            .ok_or_else(|| anyhow!("bad channel count {}", format.audio.channels))?;

        let bitrate_s = bitrate.to_string();
        let encoder = AudioEncoder::builder("aac")?
            .sample_format(get_sample_format("fltp"))
            .sample_rate(sample_rate)
            .channel_layout(channel_layout.to_owned())
            .set_option("b", bitrate_s.as_str())
            .build()?;

        let frame_samples = encoder.samples_per_frame();
        let resampler = AudioResampler::builder()
            .source_channel_layout(channel_layout.to_owned())
            .source_sample_format(get_sample_format("s16"))
            .source_sample_rate(sample_rate)
            .target_channel_layout(channel_layout.to_owned())
            .target_sample_format(get_sample_format("fltp"))
            .target_sample_rate(sample_rate)
            .target_frame_samples(frame_samples)
            .build()?;

        info!("audio encoder: aac at {} Hz", sample_rate);
        Ok(Self {
            resampler,
            encoder,
            time_base,
            channel_layout,
            sample_rate,
            guard: MonotonicGuard::default(),
        })
    }

    pub fn codec_parameters(&self) -> CodecParameters {
        self.encoder.codec_parameters().into()
    }

    pub fn encode(&mut self, frame: &AudioFrame) -> Result<Vec<Packet>> {
        let pts_ticks = frame.pts_us * self.sample_rate as i64 / 1_000_000;

        let mut af = AudioFrameMut::silence(
            &self.channel_layout,
            get_sample_format("s16"),
            self.sample_rate,
            frame.nb_samples,
        );
        {
            let mut planes = af.planes_mut();
            let dst = planes[0].data_mut();
            let n = frame.data.len().min(dst.len());
            dst[..n].copy_from_slice(&frame.data[..n]);
        }
        let af = af
            .with_pts(Timestamp::new(pts_ticks, self.time_base))
            .freeze();

        self.resampler.push(af)?;
        let mut out = Vec::new();
        while let Some(converted) = self.resampler.take()? {
            self.encoder.push(converted)?;
            while let Some(packet) = self.encoder.take()? {
                out.push(self.guard.apply(packet, self.time_base));
            }
        }
        Ok(out)
    }

    pub fn flush(&mut self) -> Result<Vec<Packet>> {
        self.resampler.flush()?;
        let mut out = Vec::new();
        while let Some(converted) = self.resampler.take()? {
            self.encoder.push(converted)?;
            while let Some(packet) = self.encoder.take()? {
                out.push(self.guard.apply(packet, self.time_base));
            }
        }
        self.encoder.flush()?;
        while let Some(packet) = self.encoder.take()? {
            out.push(self.guard.apply(packet, self.time_base));
        }
        Ok(out)
    }
}

/// The production [`FrameOutput`]: encoder pair feeding the TS fanout sink.
pub struct TsOutput {
    video: VideoStreamEncoder,
    audio: AudioStreamEncoder,
    sink: TsFanoutSink,
}

impl TsOutput {
    pub fn new(
        format: &ProgramFormat,
        config: &MuxConfig,
        sink_port: u16,
        metrics: std::sync::Arc<crate::metrics::ChannelMetrics>,
    ) -> Result<Self> {
        let video = VideoStreamEncoder::new(format, config.video_bitrate)?;
        let audio = AudioStreamEncoder::new(format, config.audio_bitrate)?;
        let sink = TsFanoutSink::bind(
            sink_port,
            video.codec_parameters(),
            audio.codec_parameters(),
            metrics,
        )?;
        Ok(Self { video, audio, sink })
    }

    pub fn bytes_dropped(&self) -> u64 {
        self.sink.bytes_dropped()
    }

    pub fn client_count(&self) -> usize {
        self.sink.client_count()
    }
}

impl FrameOutput for TsOutput {
    fn write_video(&mut self, frame: &VideoFrame) -> Result<()> {
        for packet in self.video.encode(frame)? {
            self.sink.write_video(packet)?;
        }
        Ok(())
    }

    fn write_audio(&mut self, frame: &AudioFrame) -> Result<()> {
        for packet in self.audio.encode(frame)? {
            self.sink.write_audio(packet)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for packet in self.video.flush()? {
            self.sink.write_video(packet)?;
        }
        for packet in self.audio.flush()? {
            self.sink.write_audio(packet)?;
        }
        self.sink.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ac_ffmpeg::packet::PacketMut;

    fn packet(pts: i64, dts: i64, tb: TimeBase) -> Packet {
        PacketMut::from(&[0u8; 4][..])
            .with_pts(Timestamp::new(pts, tb))
            .with_dts(Timestamp::new(dts, tb))
            .freeze()
    }

    #[test]
    fn test_monotonic_guard_passthrough() {
        let tb = TimeBase::new(1, 90_000);
        let mut guard = MonotonicGuard::default();
        let fixed = guard.apply(packet(100, 100, tb), tb);
        assert_eq!(fixed.pts().timestamp(), 100);
        assert_eq!(guard.corrections, 0);
    }

    #[test]
    fn test_monotonic_guard_minimal_forward_fix() {
        let tb = TimeBase::new(1, 90_000);
        let mut guard = MonotonicGuard::default();

        guard.apply(packet(3000, 3000, tb), tb);

        // Regression: same PTS again; fixed by +1 tick, nothing renumbered
        let fixed = guard.apply(packet(3000, 2999, tb), tb);
        assert_eq!(fixed.pts().timestamp(), 3001);
        assert_eq!(fixed.dts().timestamp(), 3001);
        assert_eq!(guard.corrections, 1);

        // Later packets far ahead pass through untouched
        let fixed = guard.apply(packet(6000, 6000, tb), tb);
        assert_eq!(fixed.pts().timestamp(), 6000);
        assert_eq!(guard.corrections, 1);
    }

    #[test]
    fn test_guard_keeps_dts_at_or_below_pts() {
        let tb = TimeBase::new(1, 90_000);
        let mut guard = MonotonicGuard::default();
        guard.apply(packet(10, 10, tb), tb);
        let fixed = guard.apply(packet(10, 10, tb), tb);
        assert!(fixed.dts().timestamp() <= fixed.pts().timestamp());
    }
}
