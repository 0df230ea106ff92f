//! Stage wiring.
//!
//! Each stage reads only what the previous one left on disk, so any stage
//! can be run alone against an existing output tree.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::augment::{AugmentOptions, Augmenter};
use crate::cancel::CancelFlag;
use crate::capture;
use crate::config::{ImageBackend, PipelineConfig};
use crate::error::PipelineResult;
use crate::layout::Layout;
use crate::matcher::{self, MatchReport};
use crate::models::Role;
use crate::prompts::PromptCatalog;
use crate::report::BatchReport;
use crate::retry::RetryPolicy;
use crate::service::http::{HttpImageGenerator, HttpVideoGenerator, ImageSampling};
use crate::service::openai::OpenAiImageEditor;
use crate::service::{Gated, ImageGenerator, VideoGenerator};
use crate::synthesize::{SynthesizeOptions, Synthesizer};

pub struct Pipeline {
    config: PipelineConfig,
    layout: Layout,
    catalog: PromptCatalog,
    images: Arc<dyn ImageGenerator>,
    videos: Arc<dyn VideoGenerator>,
    cancel: CancelFlag,
}

impl Pipeline {
    /// Builds the configured backends, each behind its own gate.
    pub fn from_config(config: PipelineConfig, cancel: CancelFlag) -> PipelineResult<Self> {
        config.validate()?;
        let catalog = match &config.prompts_file {
            Some(path) => PromptCatalog::load(path)?,
            None => PromptCatalog::default(),
        };

        let images: Arc<dyn ImageGenerator> = match config.image_backend {
            ImageBackend::Http => Arc::new(Gated::new(
                Arc::new(HttpImageGenerator::new(
                    &config.image_endpoint,
                    ImageSampling::default(),
                )),
                config.image_concurrency,
                config.image_timeout,
                cancel.clone(),
            )),
            ImageBackend::OpenAi => Arc::new(Gated::new(
                Arc::new(OpenAiImageEditor::new(config.openai_api_base.as_deref())),
                config.image_concurrency,
                config.image_timeout,
                cancel.clone(),
            )),
        };
        let videos: Arc<dyn VideoGenerator> = Arc::new(Gated::new(
            Arc::new(HttpVideoGenerator::new(&config.video_endpoint)),
            config.video_concurrency,
            config.video_timeout,
            cancel.clone(),
        ));

        Ok(Self::with_services(config, catalog, images, videos, cancel))
    }

    /// Uses the given services as-is.
    pub fn with_services(
        config: PipelineConfig,
        catalog: PromptCatalog,
        images: Arc<dyn ImageGenerator>,
        videos: Arc<dyn VideoGenerator>,
        cancel: CancelFlag,
    ) -> Self {
        let mut layout = Layout::new(&config.output_dir);
        if let Some(clips) = &config.clips_dir {
            layout = layout.with_clips_dir(clips);
        }
        Self {
            config,
            layout,
            catalog,
            images,
            videos,
            cancel,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_retries(self.config.max_retries)
    }

    fn augmenter(&self) -> Augmenter {
        Augmenter::new(
            self.images.clone(),
            self.layout.clone(),
            AugmentOptions {
                size_policy: self.config.size_policy,
                force: self.config.force,
                concurrency: self.config.image_concurrency,
                retry: self.retry_policy(),
            },
            self.cancel.clone(),
        )
    }

    pub async fn extract(&self, source: &Path) -> PipelineResult<BatchReport> {
        capture::run(source, &self.layout, self.config.extract_parallelism).await
    }

    pub async fn augment(&self) -> PipelineResult<BatchReport> {
        self.augmenter().run(&self.catalog).await
    }

    pub async fn correct(&self) -> PipelineResult<BatchReport> {
        self.augmenter()
            .correct(&self.catalog, self.config.sentinel_prompt_id)
            .await
    }

    pub async fn match_frames(&self) -> PipelineResult<MatchReport> {
        matcher::match_pairs(
            &self.layout.augmented(Role::First),
            &self.layout.augmented(Role::Last),
        )
        .await
    }

    /// Matches the augmented namespaces, then synthesizes every pair.
    pub async fn synthesize(&self) -> PipelineResult<BatchReport> {
        let matched = self.match_frames().await?;
        Ok(self.synthesize_matched(&matched).await)
    }

    pub async fn synthesize_matched(&self, matched: &MatchReport) -> BatchReport {
        let synthesizer = Synthesizer::new(
            self.videos.clone(),
            self.layout.clone(),
            SynthesizeOptions {
                params: self.config.video.clone(),
                force: self.config.force,
                concurrency: self.config.video_concurrency,
                retry: self.retry_policy(),
            },
            self.cancel.clone(),
        );
        let (report, clips) = synthesizer.run(&matched.pairs).await;
        info!(clips = clips.len(), dir = %self.layout.clips().display(), "Clips available");
        report
    }

    /// Extract, augment, match and synthesize in order. Stops between
    /// stages once cancelled.
    pub async fn run(&self, source: &Path) -> PipelineResult<Vec<BatchReport>> {
        let mut reports = vec![self.extract(source).await?];
        if self.stop_requested() {
            return Ok(reports);
        }
        reports.push(self.augment().await?);
        if self.stop_requested() {
            return Ok(reports);
        }
        let matched = self.match_frames().await?;
        reports.push(matched.to_batch_report());
        reports.push(self.synthesize_matched(&matched).await);
        Ok(reports)
    }

    /// Renders every catalog prompt over a standalone image set, then runs
    /// the corrective pass over the variants unless cancelled.
    pub async fn augment_images(&self, source: &Path) -> PipelineResult<Vec<BatchReport>> {
        let augmenter = self.augmenter();
        let mut reports = vec![augmenter.augment_images(source, &self.catalog).await?];
        if self.stop_requested() {
            return Ok(reports);
        }
        reports.push(
            augmenter
                .correct_images(&self.catalog, self.config.sentinel_prompt_id)
                .await?,
        );
        Ok(reports)
    }

    fn stop_requested(&self) -> bool {
        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            warn!("Cancelled, remaining stages skipped");
        }
        cancelled
    }
}
