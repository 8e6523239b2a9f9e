use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "inventory_vision.db";
const DEFAULT_PUBLIC_ROOT: &str = "/data/inventory/public_media";
const DEFAULT_PRIVATE_ROOT: &str = "/data/inventory/private_media";
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_DETECTOR_INPUT: u32 = 640;
const DEFAULT_EMBEDDER_INPUT: u32 = 224;
const DEFAULT_TOP_K: usize = 3;
const DEFAULT_POOL_SIZE: usize = 200;
const DEFAULT_HASH_MATCH_SCORE: f32 = 0.99;
const DEFAULT_FRAME_STRIDE: u64 = 300;
const DEFAULT_MAX_FRAMES: u64 = 1;
const DEFAULT_STALE_AFTER_SECS: u64 = 60 * 60;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    db_path: Option<String>,
    media: Option<MediaConfigFile>,
    detector: Option<DetectorConfigFile>,
    embedder: Option<EmbedderConfigFile>,
    matcher: Option<MatcherConfigFile>,
    video: Option<VideoConfigFile>,
    sweep: Option<SweepConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MediaConfigFile {
    public_root: Option<PathBuf>,
    private_root: Option<PathBuf>,
    tmp_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    confidence: Option<f32>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct EmbedderConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct MatcherConfigFile {
    top_k: Option<usize>,
    pool_size: Option<usize>,
    hash_match_score: Option<f32>,
    scope_to_location: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    frame_stride: Option<u64>,
    max_frames: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SweepConfigFile {
    stale_after_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: String,
    pub media: MediaSettings,
    pub detector: DetectorSettings,
    pub embedder: EmbedderSettings,
    pub matcher: MatcherSettings,
    pub video: VideoSettings,
    pub stale_after: Duration,
}

#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub public_root: PathBuf,
    pub private_root: PathBuf,
    /// Scratch directory for sampled video frames. Defaults to `<public_root>/tmp_frames`.
    pub tmp_dir: Option<PathBuf>,
}

impl MediaSettings {
    pub fn frame_dir(&self) -> PathBuf {
        self.tmp_dir
            .clone()
            .unwrap_or_else(|| self.public_root.join("tmp_frames"))
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub confidence: f32,
    pub input_size: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            labels_path: None,
            confidence: DEFAULT_CONFIDENCE,
            input_size: DEFAULT_DETECTOR_INPUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderBackendKind {
    Onnx,
    Histogram,
    None,
}

impl FromStr for EmbedderBackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onnx" => Ok(Self::Onnx),
            "histogram" => Ok(Self::Histogram),
            "none" => Ok(Self::None),
            other => Err(anyhow!(
                "unknown embedder backend '{}'; allowed: onnx, histogram, none",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbedderSettings {
    pub backend: EmbedderBackendKind,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
}

impl Default for EmbedderSettings {
    fn default() -> Self {
        Self {
            backend: EmbedderBackendKind::Onnx,
            model_path: None,
            input_size: DEFAULT_EMBEDDER_INPUT,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MatcherSettings {
    pub top_k: usize,
    /// Upper bound on embeddings compared per query, most recent first.
    pub pool_size: usize,
    pub hash_match_score: f32,
    pub scope_to_location: bool,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            pool_size: DEFAULT_POOL_SIZE,
            hash_match_score: DEFAULT_HASH_MATCH_SCORE,
            scope_to_location: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoSettings {
    pub frame_stride: u64,
    pub max_frames: u64,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            frame_stride: DEFAULT_FRAME_STRIDE,
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }
}

impl PipelineConfig {
    /// Load from the file named by `VISION_CONFIG` (if any), then apply `VISION_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VISION_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults only, no file or environment.
    pub fn defaults() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            media: MediaSettings {
                public_root: PathBuf::from(DEFAULT_PUBLIC_ROOT),
                private_root: PathBuf::from(DEFAULT_PRIVATE_ROOT),
                tmp_dir: None,
            },
            detector: DetectorSettings::default(),
            embedder: EmbedderSettings::default(),
            matcher: MatcherSettings::default(),
            video: VideoSettings::default(),
            stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SECS),
        }
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let media_file = file.media.unwrap_or_default();
        let media = MediaSettings {
            public_root: media_file
                .public_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PUBLIC_ROOT)),
            private_root: media_file
                .private_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PRIVATE_ROOT)),
            tmp_dir: media_file.tmp_dir,
        };

        let detector_file = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            model_path: detector_file.model_path,
            labels_path: detector_file.labels_path,
            confidence: detector_file.confidence.unwrap_or(DEFAULT_CONFIDENCE),
            input_size: detector_file.input_size.unwrap_or(DEFAULT_DETECTOR_INPUT),
        };

        let embedder_file = file.embedder.unwrap_or_default();
        let embedder = EmbedderSettings {
            backend: match embedder_file.backend.as_deref() {
                Some(name) => name.parse()?,
                None => EmbedderBackendKind::Onnx,
            },
            model_path: embedder_file.model_path,
            input_size: embedder_file.input_size.unwrap_or(DEFAULT_EMBEDDER_INPUT),
        };

        let matcher_file = file.matcher.unwrap_or_default();
        let matcher = MatcherSettings {
            top_k: matcher_file.top_k.unwrap_or(DEFAULT_TOP_K),
            pool_size: matcher_file.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
            hash_match_score: matcher_file
                .hash_match_score
                .unwrap_or(DEFAULT_HASH_MATCH_SCORE),
            scope_to_location: matcher_file.scope_to_location.unwrap_or(false),
        };

        let video_file = file.video.unwrap_or_default();
        let video = VideoSettings {
            frame_stride: video_file.frame_stride.unwrap_or(DEFAULT_FRAME_STRIDE),
            max_frames: video_file.max_frames.unwrap_or(DEFAULT_MAX_FRAMES),
        };

        let stale_after = Duration::from_secs(
            file.sweep
                .and_then(|sweep| sweep.stale_after_secs)
                .unwrap_or(DEFAULT_STALE_AFTER_SECS),
        );

        Ok(Self {
            db_path,
            media,
            detector,
            embedder,
            matcher,
            video,
            stale_after,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_non_empty("VISION_DB_PATH") {
            self.db_path = path;
        }
        if let Some(root) = env_non_empty("VISION_MEDIA_PUBLIC_ROOT") {
            self.media.public_root = PathBuf::from(root);
        }
        if let Some(root) = env_non_empty("VISION_MEDIA_PRIVATE_ROOT") {
            self.media.private_root = PathBuf::from(root);
        }
        if let Some(path) = env_non_empty("VISION_DETECTOR_MODEL") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(backend) = env_non_empty("VISION_EMBEDDER_BACKEND") {
            self.embedder.backend = backend.parse()?;
        }
        if let Some(path) = env_non_empty("VISION_EMBEDDER_MODEL") {
            self.embedder.model_path = Some(PathBuf::from(path));
        }
        if let Some(stride) = env_non_empty("VISION_FRAME_STRIDE") {
            self.video.frame_stride = stride
                .parse()
                .map_err(|_| anyhow!("VISION_FRAME_STRIDE must be a positive integer"))?;
        }
        if let Some(max_frames) = env_non_empty("VISION_MAX_FRAMES") {
            self.video.max_frames = max_frames
                .parse()
                .map_err(|_| anyhow!("VISION_MAX_FRAMES must be a positive integer"))?;
        }
        if let Some(top_k) = env_non_empty("VISION_TOP_K") {
            self.matcher.top_k = top_k
                .parse()
                .map_err(|_| anyhow!("VISION_TOP_K must be a positive integer"))?;
        }
        if let Some(stale) = env_non_empty("VISION_STALE_AFTER_SECS") {
            let seconds: u64 = stale.parse().map_err(|_| {
                anyhow!("VISION_STALE_AFTER_SECS must be an integer number of seconds")
            })?;
            self.stale_after = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.detector.confidence) {
            return Err(anyhow!("detector confidence must be within [0, 1]"));
        }
        if self.detector.input_size == 0 || self.embedder.input_size == 0 {
            return Err(anyhow!("model input size must be greater than zero"));
        }
        if self.matcher.top_k == 0 {
            return Err(anyhow!("matcher top_k must be at least 1"));
        }
        if self.matcher.pool_size < self.matcher.top_k {
            return Err(anyhow!("matcher pool_size must be at least top_k"));
        }
        if !(0.0..=1.0).contains(&self.matcher.hash_match_score) {
            return Err(anyhow!("matcher hash_match_score must be within [0, 1]"));
        }
        if self.video.frame_stride == 0 || self.video.max_frames == 0 {
            return Err(anyhow!("video frame_stride and max_frames must be at least 1"));
        }
        if self.stale_after.as_secs() == 0 {
            return Err(anyhow!("sweep stale_after_secs must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}
