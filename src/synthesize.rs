//! Video Synthesizer.
//!
//! Turns each matched pair into a clip conditioned on the pair as start and
//! end frame, named `{asset}_aug{prompt_id}.mp4` so every clip traces back
//! to its source asset and augmentation prompt.

use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::error::ServiceError;
use crate::fs_utils;
use crate::layout::Layout;
use crate::models::{Dimensions, MatchedPair, SynthesizedClip};
use crate::naming;
use crate::prompts::{DEFAULT_NEGATIVE_PROMPT, DEFAULT_VIDEO_PROMPT};
use crate::report::{BatchReport, UnitFailure, UnitOutcome};
use crate::retry::{self, RetryPolicy};
use crate::service::{VideoGenerator, VideoRequest};

/// Fixed parameters applied to every synthesis call.
#[derive(Debug, Clone)]
pub struct VideoParams {
    /// Applied to every pair. Index 0 gives the canonical clip name.
    pub prompts: Vec<String>,
    pub negative_prompt: String,
    pub seed: u64,
    pub steps: u32,
    pub fps: u32,
    pub frame_count: u32,
    pub size: Dimensions,
}

impl Default for VideoParams {
    fn default() -> Self {
        Self {
            prompts: vec![DEFAULT_VIDEO_PROMPT.to_string()],
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            seed: 1,
            steps: 4,
            fps: 24,
            frame_count: 81,
            size: Dimensions::new(1280, 720),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesizeOptions {
    pub params: VideoParams,
    pub force: bool,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for SynthesizeOptions {
    fn default() -> Self {
        Self {
            params: VideoParams::default(),
            force: false,
            concurrency: 2,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct Synthesizer {
    videos: Arc<dyn VideoGenerator>,
    layout: Layout,
    options: SynthesizeOptions,
    cancel: CancelFlag,
}

impl Synthesizer {
    pub fn new(
        videos: Arc<dyn VideoGenerator>,
        layout: Layout,
        options: SynthesizeOptions,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            videos,
            layout,
            options,
            cancel,
        }
    }

    pub fn clip_path(&self, pair: &MatchedPair, video_prompt_index: usize) -> PathBuf {
        self.layout.clips().join(naming::clip_name(
            &pair.asset_id,
            pair.prompt_id,
            video_prompt_index,
        ))
    }

    /// Synthesizes every pair with every video prompt. Failed pairs are
    /// logged and reported; the rest still run.
    pub async fn run(&self, pairs: &[MatchedPair]) -> (BatchReport, Vec<SynthesizedClip>) {
        let units: Vec<(&MatchedPair, usize)> = pairs
            .iter()
            .flat_map(|pair| (0..self.options.params.prompts.len()).map(move |index| (pair, index)))
            .collect();
        info!(pairs = pairs.len(), clips = units.len(), "Synthesizing clips");

        let results: Vec<(UnitOutcome, Option<SynthesizedClip>)> = stream::iter(units)
            .map(|(pair, index)| self.synthesize_one(pair, index))
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        let mut report = BatchReport::new("synthesize");
        let mut clips = Vec::new();
        for (outcome, clip) in results {
            report.record(outcome);
            clips.extend(clip);
        }
        clips.sort_by(|a, b| a.path.cmp(&b.path));
        (report.finish(), clips)
    }

    async fn synthesize_one(
        &self,
        pair: &MatchedPair,
        index: usize,
    ) -> (UnitOutcome, Option<SynthesizedClip>) {
        let dest = self.clip_path(pair, index);
        let clip = SynthesizedClip {
            asset_id: pair.asset_id.clone(),
            prompt_id: pair.prompt_id,
            path: dest.clone(),
        };
        if !self.options.force && dest.is_file() {
            debug!(path = %dest.display(), "Clip already synthesized");
            return (UnitOutcome::Skipped, Some(clip));
        }
        if self.cancel.is_cancelled() {
            return (UnitOutcome::Cancelled, None);
        }

        let params = &self.options.params;
        let request = VideoRequest {
            start_image: pair.first_frame.clone(),
            end_image: pair.last_frame.clone(),
            prompt: params.prompts[index].clone(),
            negative_prompt: params.negative_prompt.clone(),
            seed: params.seed,
            steps: params.steps,
            fps: params.fps,
            frame_count: params.frame_count,
            size: params.size,
        };
        let label = format!("{}_aug{}", pair.asset_id, pair.prompt_id);
        let output = retry::with_retry(&self.options.retry, &label, || {
            self.videos.generate(request.clone())
        })
        .await;

        let failed = |reason: String| {
            UnitOutcome::Failed(UnitFailure::SynthesisFailed {
                asset_id: pair.asset_id.clone(),
                prompt_id: pair.prompt_id,
                reason,
            })
        };
        let produced = match output {
            Ok(output) => output.path.filter(|path| path.is_file()),
            Err(ServiceError::Cancelled) => return (UnitOutcome::Cancelled, None),
            Err(ServiceError::NoOutput(reason)) => {
                warn!(
                    asset_id = %pair.asset_id,
                    prompt_id = pair.prompt_id,
                    "No video produced: {reason}"
                );
                None
            }
            Err(e) => {
                warn!(
                    asset_id = %pair.asset_id,
                    prompt_id = pair.prompt_id,
                    first = %pair.first_frame.display(),
                    last = %pair.last_frame.display(),
                    "Video generation failed: {e}"
                );
                return (failed(e.to_string()), None);
            }
        };
        let Some(temp_video) = produced else {
            warn!(
                asset_id = %pair.asset_id,
                prompt_id = pair.prompt_id,
                "Service returned no usable video path"
            );
            return (
                UnitOutcome::Failed(UnitFailure::NoVideoProduced {
                    asset_id: pair.asset_id.clone(),
                    prompt_id: pair.prompt_id,
                }),
                None,
            );
        };

        match fs_utils::copy_atomic(&temp_video, &dest).await {
            Ok(()) => {
                info!(path = %dest.display(), "Clip written");
                (UnitOutcome::Succeeded, Some(clip))
            }
            Err(e) => {
                warn!(
                    asset_id = %pair.asset_id,
                    prompt_id = pair.prompt_id,
                    source = %temp_video.display(),
                    "Failed to copy clip: {e}"
                );
                (failed(e.to_string()), None)
            }
        }
    }
}
