//! ffprobe / ffmpeg wrappers
//!
//! Both tools are run as child processes; their output is parsed here so the
//! rest of the engine only sees typed results.

use image::DynamicImage;
use serde::Deserialize;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tracing::debug;

use crate::config::MediaConfig;
use crate::error::MediaError;

/// Longest stderr excerpt kept in an error
const STDERR_EXCERPT: usize = 512;

/// Produces a single still frame from a video
pub trait FrameExtractor: Send + Sync {
    fn extract_frame(&self, path: &Path, offset_secs: f64) -> Result<DynamicImage, MediaError>;
}

/// First video stream of a file
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    // ffprobe prints numbers as strings here
    #[serde(default)]
    duration: Option<String>,
}

/// Parse `ffprobe -of json` output into the first usable video stream
fn parse_probe(path: &Path, json: &[u8]) -> Result<VideoInfo, MediaError> {
    let output: ProbeOutput = serde_json::from_slice(json)?;

    let stream = output
        .streams
        .into_iter()
        .find(|s| s.width.unwrap_or(0) > 0 && s.height.unwrap_or(0) > 0)
        .ok_or_else(|| MediaError::NoVideoStream(path.to_path_buf()))?;

    Ok(VideoInfo {
        codec: stream.codec_name.unwrap_or_else(|| "unknown".to_string()),
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        duration_secs: output
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse().ok()),
    })
}

/// Media tools located by the `[media]` config section
#[derive(Debug, Clone)]
pub struct FfmpegMedia {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegMedia {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            ffmpeg: PathBuf::from(&config.ffmpeg),
            ffprobe: PathBuf::from(&config.ffprobe),
        }
    }

    /// Confirm the file holds a decodable video stream
    pub fn probe(&self, path: &Path) -> Result<VideoInfo, MediaError> {
        let output = run(
            &self.ffprobe,
            [
                OsStr::new("-v"),
                OsStr::new("error"),
                OsStr::new("-select_streams"),
                OsStr::new("v:0"),
                OsStr::new("-show_entries"),
                OsStr::new("stream=codec_name,width,height:format=duration"),
                OsStr::new("-of"),
                OsStr::new("json"),
                path.as_os_str(),
            ],
        )?;

        let info = parse_probe(path, &output.stdout)?;
        debug!(
            "Probed {:?}: {} {}x{} ({:?}s)",
            path, info.codec, info.width, info.height, info.duration_secs
        );
        Ok(info)
    }

    fn frame_at(&self, path: &Path, offset_secs: f64) -> Result<DynamicImage, MediaError> {
        let offset = format!("{offset_secs:.3}");
        let output = run(
            &self.ffmpeg,
            [
                OsStr::new("-v"),
                OsStr::new("error"),
                OsStr::new("-nostdin"),
                OsStr::new("-ss"),
                OsStr::new(&offset),
                OsStr::new("-i"),
                path.as_os_str(),
                OsStr::new("-frames:v"),
                OsStr::new("1"),
                OsStr::new("-f"),
                OsStr::new("image2pipe"),
                OsStr::new("-vcodec"),
                OsStr::new("png"),
                OsStr::new("-"),
            ],
        )?;

        if output.stdout.is_empty() {
            return Err(MediaError::NoFrame { offset_secs });
        }
        Ok(image::load_from_memory(&output.stdout)?)
    }
}

impl FrameExtractor for FfmpegMedia {
    fn extract_frame(&self, path: &Path, offset_secs: f64) -> Result<DynamicImage, MediaError> {
        match self.frame_at(path, offset_secs) {
            // Clip shorter than the offset
            Err(MediaError::NoFrame { .. }) if offset_secs > 0.0 => {
                debug!("No frame at {}s in {:?}, retrying at 0s", offset_secs, path);
                self.frame_at(path, 0.0)
            }
            other => other,
        }
    }
}

fn run<I, S>(program: &Path, args: I) -> Result<Output, MediaError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let name = program.to_string_lossy().into_owned();
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| MediaError::Spawn {
            program: name.clone(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let excerpt: String = stderr.chars().take(STDERR_EXCERPT).collect();
        return Err(MediaError::Failed {
            program: name,
            status: output.status.to_string(),
            stderr: excerpt,
        });
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_video() {
        let json = br#"{
            "programs": [],
            "streams": [{"codec_name": "h264", "width": 1920, "height": 1080}],
            "format": {"duration": "12.500000"}
        }"#;

        let info = parse_probe(Path::new("/v/beach.mp4"), json).unwrap();
        assert_eq!(info.codec, "h264");
        assert_eq!((info.width, info.height), (1920, 1080));
        assert_eq!(info.duration_secs, Some(12.5));
    }

    #[test]
    fn test_parse_probe_without_video_stream() {
        let json = br#"{"streams": [], "format": {"duration": "3.0"}}"#;
        let err = parse_probe(Path::new("/v/song.mp3"), json).unwrap_err();
        assert!(matches!(err, MediaError::NoVideoStream(_)));
    }

    #[test]
    fn test_parse_probe_rejects_zero_sized_stream() {
        let json = br#"{"streams": [{"codec_name": "png", "width": 0, "height": 0}]}"#;
        assert!(parse_probe(Path::new("/v/x.mp4"), json).is_err());
    }

    #[test]
    fn test_parse_probe_garbage() {
        let err = parse_probe(Path::new("/v/x.mp4"), b"Invalid data found").unwrap_err();
        assert!(matches!(err, MediaError::Parse(_)));
    }

    #[test]
    fn test_missing_tool_is_spawn_error() {
        let media = FfmpegMedia::new(&MediaConfig {
            ffmpeg: "/nonexistent/ffmpeg".to_string(),
            ffprobe: "/nonexistent/ffprobe".to_string(),
        });

        let err = media.probe(Path::new("/v/beach.mp4")).unwrap_err();
        assert!(matches!(err, MediaError::Spawn { .. }));
    }
}
