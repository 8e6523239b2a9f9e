//! Video frame sampling.
//!
//! A [`FrameSource`] decodes frames sequentially; [`FrameSampler`] keeps every
//! `stride`-th frame until the frame budget is spent. Sampled frames pass
//! through a short-lived JPEG file in the scratch directory before analysis.

use anyhow::{Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::config::VideoSettings;
use crate::error::{AnalysisError, AnalysisResult};

#[cfg(feature = "ingest-file-ffmpeg")]
mod ffmpeg;
mod synthetic;

pub use synthetic::SyntheticVideo;

/// Sequential frame decoder.
pub trait FrameSource {
    /// Total frame count when the container reports one.
    fn total_frames(&self) -> Option<u64>;

    /// Decode the next frame; `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// Open a frame source for a resolved media location.
///
/// `stub://` locations yield synthetic frames; anything else needs the
/// `ingest-file-ffmpeg` feature.
pub fn open_source(location: &Path) -> Result<Box<dyn FrameSource>> {
    let raw = location.to_string_lossy();
    if raw.starts_with("stub://") {
        return Ok(Box::new(SyntheticVideo::from_uri(&raw)?));
    }
    #[cfg(feature = "ingest-file-ffmpeg")]
    {
        Ok(Box::new(ffmpeg::FfmpegFrameSource::open(location)?))
    }
    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    {
        Err(anyhow::anyhow!(
            "video decoding requires the ingest-file-ffmpeg feature ({})",
            location.display()
        ))
    }
}

/// Number of frames a run is expected to analyze.
///
/// `ceil(total / stride)` capped by `limit`; `limit` itself when the total is
/// unknown (zero).
pub fn expected_frame_total(total: u64, stride: u64, limit: u64) -> u64 {
    if total == 0 {
        return limit;
    }
    let stride = stride.max(1);
    total.div_ceil(stride).min(limit)
}

/// Parse a free-form list of item ids separated by `,` or `;`.
/// Tokens that are not positive integers are dropped.
pub fn parse_hint_item_ids(raw: Option<&str>) -> Vec<i64> {
    static SEPARATOR: OnceLock<regex::Regex> = OnceLock::new();
    let Some(raw) = raw else {
        return Vec::new();
    };
    let re = SEPARATOR.get_or_init(|| regex::Regex::new(r"[,;]").expect("valid separator pattern"));
    re.split(raw)
        .filter_map(|token| token.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
        .collect()
}

/// Resolve caller-supplied sampling parameters against the defaults.
/// Supplied values must be at least 1.
pub fn validate_video_params(
    frame_stride: Option<i64>,
    max_frames: Option<i64>,
    defaults: VideoSettings,
) -> AnalysisResult<VideoSettings> {
    let check = |name: &str, value: Option<i64>, default: u64| match value {
        None => Ok(default),
        Some(v) if v >= 1 => Ok(v as u64),
        Some(v) => Err(AnalysisError::InvalidInput(format!(
            "{} must be >= 1 (got {})",
            name, v
        ))),
    };
    Ok(VideoSettings {
        frame_stride: check("frame_stride", frame_stride, defaults.frame_stride)?,
        max_frames: check("max_frames", max_frames, defaults.max_frames)?,
    })
}

/// One frame selected for analysis.
pub struct SampledFrame {
    /// Zero-based index of the frame in the stream.
    pub index: u64,
    /// One-based position among the sampled frames.
    pub ordinal: u64,
    pub image: RgbImage,
}

pub struct FrameSampler {
    source: Box<dyn FrameSource>,
    stride: u64,
    budget: u64,
    next_index: u64,
    sampled: u64,
}

impl FrameSampler {
    pub fn new(source: Box<dyn FrameSource>, params: VideoSettings) -> Self {
        Self {
            source,
            stride: params.frame_stride.max(1),
            budget: params.max_frames,
            next_index: 0,
            sampled: 0,
        }
    }

    pub fn expected_total(&self) -> u64 {
        expected_frame_total(self.source.total_frames().unwrap_or(0), self.stride, self.budget)
    }

    pub fn next_sample(&mut self) -> Result<Option<SampledFrame>> {
        while self.sampled < self.budget {
            let Some(image) = self.source.next_frame()? else {
                return Ok(None);
            };
            let index = self.next_index;
            self.next_index += 1;
            if index % self.stride == 0 {
                self.sampled += 1;
                return Ok(Some(SampledFrame {
                    index,
                    ordinal: self.sampled,
                    image,
                }));
            }
        }
        Ok(None)
    }
}

/// JPEG copy of a sampled frame, removed on drop.
pub struct TempFrame {
    path: PathBuf,
}

impl TempFrame {
    pub fn write(dir: &Path, media_id: i64, index: u64, image: &RgbImage) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create frame directory {}", dir.display()))?;
        let path = dir.join(format!("frame_{}_{}.jpg", media_id, index));
        image
            .save_with_format(&path, image::ImageFormat::Jpeg)
            .with_context(|| format!("write frame {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<RgbImage> {
        let image = image::open(&self.path)
            .with_context(|| format!("decode frame {}", self.path.display()))?;
        Ok(image.to_rgb8())
    }
}

impl Drop for TempFrame {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove temp frame {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Remove the scratch directory if nothing else is left in it.
pub fn cleanup_frame_dir(dir: &Path) {
    match std::fs::remove_dir(dir) {
        Ok(()) => log::debug!("removed frame directory {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::debug!("frame directory {} kept: {}", dir.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_totals() {
        assert_eq!(expected_frame_total(0, 10, 3), 3);
        assert_eq!(expected_frame_total(100, 10, 3), 3);
        assert_eq!(expected_frame_total(95, 10, 20), 10);
        assert_eq!(expected_frame_total(1, 300, 1), 1);
    }

    #[test]
    fn hint_ids_parse_leniently() {
        assert_eq!(parse_hint_item_ids(Some("1,2,3")), vec![1, 2, 3]);
        assert_eq!(parse_hint_item_ids(Some(" 4;5 ")), vec![4, 5]);
        assert_eq!(parse_hint_item_ids(Some("")), Vec::<i64>::new());
        assert_eq!(parse_hint_item_ids(None), Vec::<i64>::new());
        assert_eq!(parse_hint_item_ids(Some("abc,7")), vec![7]);
    }

    #[test]
    fn video_params_must_be_positive() {
        let defaults = VideoSettings::default();
        assert_eq!(validate_video_params(None, None, defaults).unwrap(), defaults);
        let resolved = validate_video_params(Some(10), Some(3), defaults).unwrap();
        assert_eq!(resolved.frame_stride, 10);
        assert_eq!(resolved.max_frames, 3);
        assert!(matches!(
            validate_video_params(Some(0), None, defaults),
            Err(AnalysisError::InvalidInput(_))
        ));
        assert!(validate_video_params(None, Some(-1), defaults).is_err());
    }

    #[test]
    fn sampler_honours_stride_and_budget() {
        let source = SyntheticVideo::from_uri("stub://clip?frames=25").unwrap();
        let mut sampler = FrameSampler::new(
            Box::new(source),
            VideoSettings {
                frame_stride: 10,
                max_frames: 5,
            },
        );
        assert_eq!(sampler.expected_total(), 3);
        let mut indices = Vec::new();
        while let Some(frame) = sampler.next_sample().unwrap() {
            assert_eq!(frame.ordinal as usize, indices.len() + 1);
            indices.push(frame.index);
        }
        assert_eq!(indices, vec![0, 10, 20]);
    }

    #[test]
    fn temp_frame_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let frames = dir.path().join("tmp_frames");
        let image = RgbImage::from_pixel(8, 8, image::Rgb([200, 10, 10]));
        let path = {
            let frame = TempFrame::write(&frames, 4, 300, &image).unwrap();
            assert!(frame.path().ends_with("frame_4_300.jpg"));
            assert_eq!(frame.load().unwrap().dimensions(), (8, 8));
            frame.path().to_path_buf()
        };
        assert!(!path.exists());
        cleanup_frame_dir(&frames);
        assert!(!frames.exists());
    }
}
