//! Video capture seam: frame source, timestamp annotation and frame sink.

use crate::config::CaptureConfig;
use crate::utils::OVERLAY_TIMESTAMP_FORMAT;
use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

/// Single-plane 8-bit frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    /// Text burned in by the annotator, kept alongside the pixels.
    pub overlay: Option<String>,
}

impl Frame {
    pub fn blank(width: u32, height: u32) -> Self {
        Frame {
            width,
            height,
            pixels: vec![0; width as usize * height as usize],
            overlay: None,
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait FrameSource {
    /// Grab the next frame. An error means the camera is gone.
    async fn read(&mut self) -> Result<Frame>;
    async fn release(&mut self) -> Result<()>;
}

#[allow(async_fn_in_trait)]
pub trait FrameSink {
    async fn write(&mut self, frame: &Frame) -> Result<()>;
    /// Flush and close the container.
    async fn finish(&mut self) -> Result<()>;
}

pub trait FrameAnnotator {
    fn annotate(&self, frame: &mut Frame, timestamp: &NaiveDateTime);
}

/// Stamps the capture instant, truncated to milliseconds, onto the frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampOverlay;

impl FrameAnnotator for TimestampOverlay {
    fn annotate(&self, frame: &mut Frame, timestamp: &NaiveDateTime) {
        frame.overlay = Some(timestamp.format(OVERLAY_TIMESTAMP_FORMAT).to_string());
    }
}

/// Synthetic camera producing a scrolling gradient at a fixed resolution.
pub struct TestPatternCamera {
    width: u32,
    height: u32,
    frames_read: u64,
    /// Reads fail once this many frames have been delivered.
    frame_limit: Option<u64>,
    released: bool,
}

impl TestPatternCamera {
    pub fn new(cfg: &CaptureConfig) -> Self {
        TestPatternCamera {
            width: cfg.width,
            height: cfg.height,
            frames_read: 0,
            frame_limit: None,
            released: false,
        }
    }

    #[allow(dead_code)]
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    #[allow(dead_code)]
    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl FrameSource for TestPatternCamera {
    async fn read(&mut self) -> Result<Frame> {
        if self.released {
            bail!("camera already released");
        }
        if let Some(limit) = self.frame_limit {
            if self.frames_read >= limit {
                bail!("camera stopped delivering frames after {}", limit);
            }
        }

        let mut frame = Frame::blank(self.width, self.height);
        let offset = self.frames_read as usize;
        for (row, line) in frame.pixels.chunks_mut(self.width as usize).enumerate() {
            for (col, px) in line.iter_mut().enumerate() {
                *px = ((col + row + offset * 4) % 256) as u8;
            }
        }
        self.frames_read += 1;
        Ok(frame)
    }

    async fn release(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            tracing::info!("camera released after {} frames", self.frames_read);
        }
        Ok(())
    }
}

/// Writes frames as a monochrome `YUV4MPEG2` stream.
///
/// The overlay text of each frame is carried in an `XTS=` frame parameter
/// with the date/time separator replaced by `T`, since parameters are
/// space-delimited.
pub struct Y4mWriter {
    path: PathBuf,
    width: u32,
    height: u32,
    fps: f64,
    out: Option<BufWriter<File>>,
    frames_written: u64,
}

impl Y4mWriter {
    pub async fn create(path: &Path, cfg: &CaptureConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(path)
            .await
            .with_context(|| format!("creating video file {}", path.display()))?;
        let mut writer = Y4mWriter {
            path: path.to_path_buf(),
            width: cfg.width,
            height: cfg.height,
            fps: cfg.target_fps,
            out: Some(BufWriter::new(file)),
            frames_written: 0,
        };
        writer.write_header().await?;
        Ok(writer)
    }

    async fn write_header(&mut self) -> Result<()> {
        let (num, den) = frame_rate_ratio(self.fps);
        let header = format!(
            "YUV4MPEG2 W{} H{} F{}:{} Ip A1:1 Cmono\n",
            self.width, self.height, num, den
        );
        let out = self.out.as_mut().ok_or_else(|| anyhow!("video sink closed"))?;
        out.write_all(header.as_bytes()).await?;
        Ok(())
    }

    #[allow(dead_code)]
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl FrameSink for Y4mWriter {
    async fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height {
            bail!(
                "frame is {}x{}, writer expects {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            );
        }
        let out = self.out.as_mut().ok_or_else(|| anyhow!("video sink closed"))?;
        match &frame.overlay {
            Some(text) => {
                let tag = format!("FRAME XTS={}\n", text.replace(' ', "T"));
                out.write_all(tag.as_bytes()).await?;
            }
            None => out.write_all(b"FRAME\n").await?,
        }
        out.write_all(&frame.pixels).await?;
        self.frames_written += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(mut out) = self.out.take() {
            out.flush().await?;
            out.get_mut().sync_all().await?;
            tracing::info!("wrote {} frames to {}", self.frames_written, self.path.display());
        }
        Ok(())
    }
}

/// Express a frame rate as an integer ratio with millihertz resolution.
fn frame_rate_ratio(fps: f64) -> (u64, u64) {
    let num = (fps * 1000.0).round() as u64;
    let den = 1000;
    let g = gcd(num, den);
    (num / g, den / g)
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a.max(1)
    } else {
        gcd(b, a % b)
    }
}
