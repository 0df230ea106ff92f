//! Pipeline configuration.
//!
//! Built from `FRAMESYNTH_*` environment variables over compiled-in defaults;
//! the CLI then overrides individual fields.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::augment::SizePolicy;
use crate::error::{PipelineError, PipelineResult};
use crate::models::Dimensions;
use crate::prompts::DEFAULT_SENTINEL_PROMPT_ID;
use crate::synthesize::VideoParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ImageBackend {
    /// JSON endpoint exposing `/infer`.
    Http,
    /// OpenAI image edits.
    #[value(name = "openai")]
    OpenAi,
}

impl FromStr for ImageBackend {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(ImageBackend::Http),
            "openai" => Ok(ImageBackend::OpenAi),
            other => Err(PipelineError::config(format!("unknown image backend: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of the frame namespaces.
    pub output_dir: PathBuf,
    /// Clip destination; `{output_dir}/synthesized_clips` when unset.
    pub clips_dir: Option<PathBuf>,
    pub image_backend: ImageBackend,
    pub image_endpoint: String,
    /// Overrides the OpenAI API base for the `openai` backend.
    pub openai_api_base: Option<String>,
    pub video_endpoint: String,
    /// Max in-flight image calls
    pub image_concurrency: usize,
    /// Max in-flight video calls
    pub video_concurrency: usize,
    pub image_timeout: Duration,
    pub video_timeout: Duration,
    /// Assets decoded at once during extraction.
    pub extract_parallelism: usize,
    pub size_policy: SizePolicy,
    pub sentinel_prompt_id: u32,
    pub max_retries: u32,
    pub force: bool,
    /// Catalog file; the built-in catalog when unset.
    pub prompts_file: Option<PathBuf>,
    pub video: VideoParams,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            clips_dir: None,
            image_backend: ImageBackend::Http,
            image_endpoint: "http://127.0.0.1:5012".to_string(),
            openai_api_base: None,
            video_endpoint: "http://127.0.0.1:5016".to_string(),
            image_concurrency: 4,
            video_concurrency: 2,
            image_timeout: Duration::from_secs(300),
            video_timeout: Duration::from_secs(600),
            extract_parallelism: default_parallelism(),
            size_policy: SizePolicy::Uniform(Dimensions::new(1280, 720)),
            sentinel_prompt_id: DEFAULT_SENTINEL_PROMPT_ID,
            max_retries: 0,
            force: false,
            prompts_file: None,
            video: VideoParams::default(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("FRAMESYNTH_{name}"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|s| s.trim().parse().ok())
}

impl PipelineConfig {
    /// Create config from environment variables. Unparseable values fall
    /// back to the default; an unknown backend name is an error.
    pub fn from_env() -> PipelineResult<Self> {
        let defaults = Self::default();
        let image_backend = match env_var("IMAGE_BACKEND") {
            Some(name) => name.parse()?,
            None => defaults.image_backend,
        };
        let size_policy = if env_parse::<bool>("NATIVE_SIZE").unwrap_or(false) {
            SizePolicy::Native
        } else {
            match (env_parse("WIDTH"), env_parse("HEIGHT")) {
                (None, None) => defaults.size_policy,
                (width, height) => {
                    let fallback = Dimensions::new(1280, 720);
                    SizePolicy::Uniform(Dimensions::new(
                        width.unwrap_or(fallback.width),
                        height.unwrap_or(fallback.height),
                    ))
                }
            }
        };

        Ok(Self {
            output_dir: env_var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            clips_dir: env_var("CLIPS_DIR").map(PathBuf::from),
            image_backend,
            image_endpoint: env_var("IMAGE_ENDPOINT").unwrap_or(defaults.image_endpoint),
            openai_api_base: env_var("OPENAI_API_BASE"),
            video_endpoint: env_var("VIDEO_ENDPOINT").unwrap_or(defaults.video_endpoint),
            image_concurrency: env_parse("IMAGE_CONCURRENCY").unwrap_or(defaults.image_concurrency),
            video_concurrency: env_parse("VIDEO_CONCURRENCY").unwrap_or(defaults.video_concurrency),
            image_timeout: env_parse("IMAGE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.image_timeout),
            video_timeout: env_parse("VIDEO_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.video_timeout),
            extract_parallelism: env_parse("EXTRACT_PARALLELISM")
                .unwrap_or(defaults.extract_parallelism),
            size_policy,
            sentinel_prompt_id: env_parse("SENTINEL_PROMPT_ID")
                .unwrap_or(defaults.sentinel_prompt_id),
            max_retries: env_parse("MAX_RETRIES").unwrap_or(defaults.max_retries),
            force: env_parse("FORCE").unwrap_or(defaults.force),
            prompts_file: env_var("PROMPTS_FILE").map(PathBuf::from),
            video: VideoParams {
                seed: env_parse("VIDEO_SEED").unwrap_or(defaults.video.seed),
                steps: env_parse("VIDEO_STEPS").unwrap_or(defaults.video.steps),
                ..defaults.video
            },
        })
    }

    /// Rejects settings no stage can run with.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.image_concurrency == 0 || self.video_concurrency == 0 {
            return Err(PipelineError::config("concurrency limits must be at least 1"));
        }
        if self.image_timeout.is_zero() || self.video_timeout.is_zero() {
            return Err(PipelineError::config("timeouts must be non-zero"));
        }
        if let SizePolicy::Uniform(size) = self.size_policy {
            if size.width == 0 || size.height == 0 {
                return Err(PipelineError::config(format!("invalid target size {size}")));
            }
        }
        if self.video.prompts.is_empty() {
            return Err(PipelineError::config("at least one video prompt is required"));
        }
        Ok(())
    }
}
