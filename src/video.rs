//! Per-episode frame buffering and video encoding.
//!
//! A [`VideoWriter`] collects the `uint8` frames of one episode and hands them
//! to a [`FrameEncoder`] when saved. Two encoders are provided:
//! - [`FfmpegEncoder`] pipes raw RGB frames into an `ffmpeg` subprocess and
//!   writes H.264 MP4 files.
//! - [`GifEncoder`] writes animated GIFs in-process through the `image` crate.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{ChildStdin, Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use image::codecs::gif::{GifEncoder as ImageGifEncoder, Repeat};
use image::{Delay, Frame as GifFrame, RgbaImage};
use ndarray::ArrayD;
use tracing::{debug, info, warn};

use crate::config::{VideoConfig, VideoFormat};
use crate::tensor::Tensor;

/// One accepted frame: `H x W`, or `H x W x C` with `C` in {1, 3, 4}.
pub type Frame = ArrayD<u8>;

/// File name for a finished episode, embedding its score.
pub fn episode_file_name(index: usize, reward: f64, extension: &str) -> String {
    format!("episode_{index:03}_score_{reward:.1}.{extension}")
}

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

/// Turns a sequence of frames into a video file.
pub trait FrameEncoder {
    /// File extension, without the dot.
    fn extension(&self) -> &str;

    /// Encode `frames` (non-empty, all the same size) into `path`.
    fn encode(&self, path: &Path, frames: &[Frame]) -> Result<()>;
}

/// Build the encoder selected by `config.format`.
pub fn encoder_for(config: &VideoConfig) -> Box<dyn FrameEncoder> {
    match config.format {
        VideoFormat::Mp4 => Box::new(FfmpegEncoder::new(config)),
        VideoFormat::Gif => Box::new(GifEncoder::new(config.fps)),
    }
}

/// H.264 MP4 through an external `ffmpeg` process.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: String,
    codec: String,
    fps: u32,
    quality: u8,
}

impl FfmpegEncoder {
    pub fn new(config: &VideoConfig) -> Self {
        Self {
            program: config.ffmpeg.clone(),
            codec: config.codec.clone(),
            fps: config.fps,
            quality: config.quality,
        }
    }

    /// Constant rate factor for the 0-10 quality scale (8 -> 10).
    pub fn crf(&self) -> u32 {
        let quality = f64::from(self.quality.min(10));
        ((1.0 - quality / 10.0) * 51.0) as u32
    }

    fn args(&self, path: &Path, height: usize, width: usize) -> Vec<String> {
        vec![
            "-y".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{width}x{height}"),
            "-r".into(),
            self.fps.to_string(),
            "-i".into(),
            "-".into(),
            "-an".into(),
            // yuv420p needs even dimensions.
            "-vf".into(),
            "pad=ceil(iw/2)*2:ceil(ih/2)*2".into(),
            "-c:v".into(),
            self.codec.clone(),
            "-crf".into(),
            self.crf().to_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            path.display().to_string(),
        ]
    }
}

impl FrameEncoder for FfmpegEncoder {
    fn extension(&self) -> &str {
        "mp4"
    }

    fn encode(&self, path: &Path, frames: &[Frame]) -> Result<()> {
        let (height, width) = frame_geometry(frames)?;
        let mut child = Command::new(&self.program)
            .args(self.args(path, height, width))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start '{}'", self.program))?;

        // A failed write usually means ffmpeg already exited; its status and
        // stderr say why, so they take precedence over the pipe error.
        let streamed = match child.stdin.take() {
            Some(stdin) => stream_frames(stdin, frames),
            None => Err(anyhow!("ffmpeg stdin unavailable")),
        };

        let output = child.wait_with_output().context("failed to wait for ffmpeg")?;
        if !output.status.success() {
            bail!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        streamed?;
        debug!(path = %path.display(), crf = self.crf(), "ffmpeg finished");
        Ok(())
    }
}

/// Write every frame as packed RGB, then close the pipe.
fn stream_frames(stdin: ChildStdin, frames: &[Frame]) -> Result<()> {
    let mut stdin = BufWriter::new(stdin);
    for frame in frames {
        stdin
            .write_all(&to_rgb(frame)?)
            .context("failed to stream frame to ffmpeg")?;
    }
    stdin.flush().context("failed to flush frames to ffmpeg")?;
    Ok(())
}

/// Animated GIF written in-process.
#[derive(Debug, Clone)]
pub struct GifEncoder {
    fps: u32,
}

impl GifEncoder {
    pub fn new(fps: u32) -> Self {
        Self { fps: fps.max(1) }
    }
}

impl FrameEncoder for GifEncoder {
    fn extension(&self) -> &str {
        "gif"
    }

    fn encode(&self, path: &Path, frames: &[Frame]) -> Result<()> {
        let (height, width) = frame_geometry(frames)?;
        // The trailer is written when the encoder drops, so encode into
        // memory and write the file in one checked step.
        let mut bytes = Vec::new();
        {
            let mut encoder = ImageGifEncoder::new_with_speed(&mut bytes, 10);
            encoder.set_repeat(Repeat::Infinite)?;

            let delay = Delay::from_numer_denom_ms(1000, self.fps);
            for frame in frames {
                let rgb = to_rgb(frame)?;
                let rgba: Vec<u8> = rgb
                    .chunks_exact(3)
                    .flat_map(|px| [px[0], px[1], px[2], 255])
                    .collect();
                let image = RgbaImage::from_raw(width as u32, height as u32, rgba)
                    .context("frame buffer does not match its dimensions")?;
                encoder
                    .encode_frame(GifFrame::from_parts(image, 0, 0, delay))
                    .context("failed to encode GIF frame")?;
            }
        }
        std::fs::write(path, &bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

/// `(height, width)` shared by every frame.
fn frame_geometry(frames: &[Frame]) -> Result<(usize, usize)> {
    let Some(first) = frames.first() else {
        bail!("no frames to encode");
    };
    let geometry = |frame: &Frame| -> Result<(usize, usize)> {
        match frame.shape() {
            [h, w] | [h, w, 1 | 3 | 4] => Ok((*h, *w)),
            other => bail!("unsupported frame shape {other:?}, expected HxW or HxWxC"),
        }
    };
    let size = geometry(first)?;
    for (i, frame) in frames.iter().enumerate().skip(1) {
        let other = geometry(frame)?;
        if other != size {
            bail!("frame {i} is {other:?}, expected {size:?} like the first frame");
        }
    }
    if size.0 == 0 || size.1 == 0 {
        bail!("frames are empty ({size:?})");
    }
    Ok(size)
}

/// Packed RGB bytes in row-major order.
fn to_rgb(frame: &Frame) -> Result<Vec<u8>> {
    let channels = match frame.shape() {
        [_, _] => 1,
        [_, _, c] => *c,
        other => bail!("unsupported frame shape {other:?}"),
    };
    let values: Vec<u8> = frame.iter().copied().collect();
    Ok(match channels {
        1 => values.iter().flat_map(|v| [*v, *v, *v]).collect(),
        3 => values,
        4 => values
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect(),
        other => bail!("unsupported channel count {other}"),
    })
}

// ---------------------------------------------------------------------------
// Frame buffer
// ---------------------------------------------------------------------------

/// Buffers the frames of a single episode and writes them as one video.
///
/// Only `uint8` frames are accepted; anything else is skipped without error.
/// Create a new writer for every episode.
pub struct VideoWriter<'a> {
    output_dir: PathBuf,
    episode_index: usize,
    frames: Vec<Frame>,
    encoder: &'a dyn FrameEncoder,
}

impl<'a> VideoWriter<'a> {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        episode_index: usize,
        encoder: &'a dyn FrameEncoder,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            episode_index,
            frames: Vec::new(),
            encoder,
        }
    }

    /// Buffer `frame` if it is `uint8`. Returns whether it was accepted.
    pub fn add_frame(&mut self, frame: &Tensor) -> bool {
        match frame.as_u8() {
            Some(pixels) => {
                self.frames.push(pixels.clone());
                true
            }
            None => {
                // Non-uint8 frames are skipped, not reported as errors.
                debug!(dtype = %frame.dtype(), "skipping non-uint8 frame");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn extension(&self) -> &str {
        self.encoder.extension()
    }

    /// `episode_{index:03}.{ext}`.
    pub fn default_name(&self) -> String {
        format!("episode_{:03}.{}", self.episode_index, self.extension())
    }

    /// Encode the buffered frames to `output_dir/name` and clear the buffer.
    ///
    /// With nothing buffered this only logs a warning and returns `None`.
    pub fn save(&mut self, name: Option<&str>) -> Result<Option<PathBuf>> {
        if self.frames.is_empty() {
            warn!(episode = self.episode_index, "No frames to save");
            return Ok(None);
        }

        std::fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("Failed to create output directory {}", self.output_dir.display())
        })?;
        let path = self
            .output_dir
            .join(name.map_or_else(|| self.default_name(), str::to_string));

        let frames = std::mem::take(&mut self.frames);
        info!(path = %path.display(), frames = frames.len(), "Saving video");
        self.encoder
            .encode(&path, &frames)
            .with_context(|| format!("Failed to encode video {}", path.display()))?;
        Ok(Some(path))
    }
}
