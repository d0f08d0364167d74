//! Video I/O by piping raw `rgb24` frames through `ffmpeg` child processes.
//!
//! Decoding runs `ffmpeg -i <file> -f rawvideo -pix_fmt rgb24 -` and reads
//! fixed-size frames from its stdout. Stream size and frame count come from
//! `ffprobe`. Encoding runs the reverse pipeline into an MPEG-4 `.mp4` file.

use super::MediaBackend;
use crate::core_modules::frame::{FrameDims, rgb_from_raw};
use crate::error::{HeatmapError, Result};
use crate::frame_source::FrameSource;
use crate::output_sink::VideoEncoder;
use image::RgbImage;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

fn quiet_prefix() -> [&'static str; 5] {
    ["-hide_banner", "-nostdin", "-loglevel", "error", "-y"]
}

/// Locations of the `ffmpeg` and `ffprobe` executables.
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
        }
    }
}

impl FfmpegBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binaries(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Reads frame size and packet count of the first video stream.
    fn probe(&self, path: &Path) -> Result<(FrameDims, usize)> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-select_streams", "v:0", "-count_packets"])
            .args(["-show_entries", "stream=width,height,nb_read_packets"])
            .args(["-of", "csv=p=0"])
            .arg(path)
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(HeatmapError::InputDecode {
                path: path.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let text = String::from_utf8_lossy(&output.stdout);
        parse_probe(text.trim())
    }
}

/// Parses `width,height,count` as printed by `ffprobe -of csv=p=0`.
fn parse_probe(line: &str) -> Result<(FrameDims, usize)> {
    let fields: Vec<&str> = line.lines().next().unwrap_or("").split(',').collect();
    let parse = |i: usize| fields.get(i).and_then(|f| f.trim().parse::<u64>().ok());
    match (parse(0), parse(1), parse(2)) {
        (Some(w), Some(h), Some(n)) if w > 0 && h > 0 => {
            Ok((FrameDims::new(w as u32, h as u32), n as usize))
        }
        _ => Err(HeatmapError::UnexpectedProbeOutput(line.to_string())),
    }
}

impl MediaBackend for FfmpegBackend {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        let (dims, frame_count) = self.probe(path)?;
        tracing::debug!("probed {}: {dims}, {frame_count} frames", path.display());
        Ok(Box::new(FfmpegSource {
            ffmpeg: self.ffmpeg.clone(),
            path: path.to_path_buf(),
            dims,
            frame_count,
            position: 0,
            decoder: None,
        }))
    }

    fn open_encoder(&self, path: &Path, dims: FrameDims, fps: u32) -> Result<Box<dyn VideoEncoder>> {
        Ok(Box::new(FfmpegEncoder::new(&self.ffmpeg, path, dims, fps)?))
    }
}

struct Decoder {
    child: Child,
    stdout: BufReader<ChildStdout>,
}

impl Drop for Decoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Decodes a file through an `ffmpeg` child process.
///
/// The child is started lazily and restarted for backward seeks; forward seeks
/// decode and discard the frames in between.
pub struct FfmpegSource {
    ffmpeg: PathBuf,
    path: PathBuf,
    dims: FrameDims,
    frame_count: usize,
    position: usize,
    decoder: Option<Decoder>,
}

impl FfmpegSource {
    fn start(&mut self) -> Result<()> {
        self.decoder = None;
        let mut child = Command::new(&self.ffmpeg)
            .args(quiet_prefix())
            .arg("-i")
            .arg(&self.path)
            .args(["-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HeatmapError::Encoder("ffmpeg stdout unavailable".into()))?;
        self.decoder = Some(Decoder {
            child,
            stdout: BufReader::new(stdout),
        });
        self.position = 0;
        Ok(())
    }

    /// Reads one raw frame. `Ok(None)` at end of stream.
    fn next_raw(&mut self) -> Result<Option<Vec<u8>>> {
        if self.decoder.is_none() {
            self.start()?;
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(None);
        };
        let mut buf = vec![0u8; self.dims.rgb_len()];
        match decoder.stdout.read_exact(&mut buf) {
            Ok(()) => {
                self.position += 1;
                Ok(Some(buf))
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl FrameSource for FfmpegSource {
    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn dims(&self) -> FrameDims {
        self.dims
    }

    fn position(&self) -> usize {
        self.position
    }

    fn read(&mut self) -> Result<Option<RgbImage>> {
        match self.next_raw()? {
            Some(raw) => Ok(Some(rgb_from_raw(self.dims, raw)?)),
            None => Ok(None),
        }
    }

    fn seek(&mut self, index: usize) -> Result<()> {
        if self.decoder.is_none() || index < self.position {
            self.start()?;
        }
        while self.position < index {
            if self.next_raw()?.is_none() {
                break;
            }
        }
        Ok(())
    }
}

/// Encodes frames by piping them into `ffmpeg`.
pub struct FfmpegEncoder {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    dims: FrameDims,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg: &Path, path: &Path, dims: FrameDims, fps: u32) -> Result<Self> {
        let size = format!("{}x{}", dims.width, dims.height);
        let rate = fps.max(1).to_string();
        let mut child = Command::new(ffmpeg)
            .args(quiet_prefix())
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-s", size.as_str(), "-r", rate.as_str(), "-i", "-"])
            .args(["-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2"])
            .args(["-c:v", "mpeg4", "-q:v", "4", "-pix_fmt", "yuv420p"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take();
        Ok(Self {
            child: Some(child),
            stdin,
            dims,
        })
    }

    /// Waits for ffmpeg and turns a non-zero exit into an error carrying its
    /// stderr.
    fn collect(&mut self) -> Result<()> {
        self.stdin = None;
        let Some(child) = self.child.take() else {
            return Ok(());
        };
        let output = child.wait_with_output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(HeatmapError::Ffmpeg {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        self.dims.check(frame)?;
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(HeatmapError::Encoder("encoder already closed".into()));
        };
        match stdin.write_all(frame.as_raw()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                // ffmpeg died; report why.
                self.collect()?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        if let Some(stdin) = self.stdin.as_mut() {
            stdin.flush()?;
        }
        self.collect()
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
