use super::VideoReader;
use anyhow::{anyhow, Context, Result};
use ffmpeg_next::ffi;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;
use ffmpeg_next::util::frame::Video as VideoFrame;
use opencv::{core, prelude::*};
use std::path::Path;

/// Video reader backed by FFmpeg via ffmpeg-next, decoding on the CPU and
/// converting sampled frames to BGR24.
pub struct FfmpegReader {
    input_ctx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::codec::decoder::Video,
    video_stream_index: usize,
    /// Created on the first converted frame, once the decoded format is known.
    scaler: Option<scaling::Context>,
    source_fps: f64,
    total_frames: usize,
    /// Reused by `skip_frame` so skipping does not allocate.
    scratch: VideoFrame,
    packet: ffmpeg_next::codec::packet::Packet,
    eof_sent: bool,
}

// SAFETY: a reader is owned by exactly one search worker and never shared;
// the raw pointers inside ffmpeg-next types do not cross threads concurrently.
unsafe impl Send for FfmpegReader {}

impl FfmpegReader {
    pub fn new(path: &str) -> Result<Self> {
        ffmpeg_next::init().context("Failed to initialize FFmpeg")?;

        let source = Path::new(path);
        if !source.exists() {
            return Err(anyhow!("Video file not found: {}", path));
        }

        let input_ctx = ffmpeg_next::format::input(&source).context("Failed to open video file")?;
        let stream = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| anyhow!("No video stream found in {}", path))?;
        let video_stream_index = stream.index();

        let rate = stream.avg_frame_rate();
        let source_fps = if rate.numerator() > 0 && rate.denominator() > 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };

        let duration_secs = input_ctx.duration() as f64 / ffi::AV_TIME_BASE as f64;
        let total_frames = match stream.frames() {
            n if n > 0 => n as usize,
            _ if duration_secs > 0.0 => (duration_secs * source_fps).round() as usize,
            _ => 0,
        };

        let decoder = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
            .context("Failed to create decoder context")?
            .decoder()
            .video()
            .context("Failed to open video decoder")?;

        tracing::info!(
            "FfmpegReader: opened {}, duration={:.2}s, fps={:.2}, frames={}, {}x{}",
            path,
            duration_secs,
            source_fps,
            total_frames,
            decoder.width(),
            decoder.height()
        );

        Ok(Self {
            input_ctx,
            decoder,
            video_stream_index,
            scaler: None,
            source_fps,
            total_frames,
            scratch: VideoFrame::empty(),
            packet: ffmpeg_next::codec::packet::Packet::empty(),
            eof_sent: false,
        })
    }

    /// Pulls the next decoded frame into `target`. Returns false at end of stream.
    fn decode_next(&mut self, target: &mut VideoFrame) -> Result<bool> {
        loop {
            match self.decoder.receive_frame(target) {
                Ok(()) => return Ok(true),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.eof_sent {
                        return Ok(false);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(false),
                Err(e) => return Err(anyhow!("Decoder error: {}", e)),
            }

            let mut fed = false;
            while self.packet.read(&mut self.input_ctx).is_ok() {
                if self.packet.stream() == self.video_stream_index {
                    self.decoder
                        .send_packet(&self.packet)
                        .context("Failed to send packet to decoder")?;
                    fed = true;
                    break;
                }
            }

            if !fed {
                self.decoder
                    .send_eof()
                    .context("Failed to send EOF to decoder")?;
                self.eof_sent = true;
            }
        }
    }

    fn to_bgr(&mut self, frame: &VideoFrame) -> Result<VideoFrame> {
        if self.scaler.is_none() {
            self.scaler = Some(
                scaling::Context::get(
                    frame.format(),
                    frame.width(),
                    frame.height(),
                    Pixel::BGR24,
                    frame.width(),
                    frame.height(),
                    scaling::Flags::BILINEAR,
                )
                .context("Failed to create scaler")?,
            );
        }
        let scaler = self
            .scaler
            .as_mut()
            .ok_or_else(|| anyhow!("Scaler missing"))?;

        let mut bgr = VideoFrame::empty();
        scaler.run(frame, &mut bgr).context("Scaler failed")?;
        Ok(bgr)
    }
}

/// Deep-copies a BGR24 frame into an owned `Mat`, dropping row padding.
fn bgr_frame_to_mat(frame: &VideoFrame) -> Result<core::Mat> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let data = frame.data(0);
    let row_bytes = width * 3;

    let mut mat = core::Mat::new_rows_cols_with_default(
        height as i32,
        width as i32,
        core::CV_8UC3,
        core::Scalar::all(0.0),
    )?;
    let dst = mat.data_bytes_mut()?;
    for y in 0..height {
        let src = &data[y * stride..y * stride + row_bytes];
        dst[y * row_bytes..(y + 1) * row_bytes].copy_from_slice(src);
    }
    Ok(mat)
}

impl VideoReader for FfmpegReader {
    fn frame_count(&self) -> Result<usize> {
        Ok(self.total_frames)
    }

    fn source_fps(&self) -> Result<f64> {
        Ok(self.source_fps)
    }

    fn read_frame(&mut self) -> Result<Option<core::Mat>> {
        let mut raw = VideoFrame::empty();
        if !self.decode_next(&mut raw)? {
            return Ok(None);
        }
        let bgr = self.to_bgr(&raw)?;
        Ok(Some(bgr_frame_to_mat(&bgr)?))
    }

    fn skip_frame(&mut self) -> Result<bool> {
        let mut scratch = std::mem::replace(&mut self.scratch, VideoFrame::empty());
        let res = self.decode_next(&mut scratch);
        self.scratch = scratch;
        res
    }
}
