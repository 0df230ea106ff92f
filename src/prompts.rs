//! Prompt catalogs.
//!
//! A prompt's id is its position in the catalog. Catalogs are append-only,
//! so ids stay stable across runs and keep matching the artifacts already
//! on disk.

use std::path::Path;

use crate::error::{PipelineError, PipelineResult};
use crate::models::PromptSpec;

const DEFAULT_PROMPTS: &[&str] = &[
    // clothing, build, age
    "The worker wears blue overalls, medium build, male aged 30-40; the climbing motion is unchanged and every other scene element stays the same",
    "The worker wears a red safety suit, slim build, female aged 20-30; the climbing motion is unchanged and every other scene element stays the same",
    "The worker wears a yellow vest, heavy build, male aged 50-60; the climbing motion is unchanged and every other scene element stays the same",
    "The worker wears green overalls with reflective strips, sturdy build, male aged 35-45; the climbing motion is unchanged and every other scene element stays the same",
    "The worker wears a dark blue safety suit, well-proportioned build, female aged 25-35; the climbing motion is unchanged and every other scene element stays the same",
    "The worker wears light grey overalls, slim build, male aged 40-50; the climbing motion is unchanged and every other scene element stays the same",
    "The worker wears orange reflective overalls, medium build, male aged 20-30; the climbing motion is unchanged and every other scene element stays the same",
    "The worker wears a navy safety suit, heavy build, female aged 45-55; the climbing motion is unchanged and every other scene element stays the same",
    // lighting, camera angle
    "Clothing unchanged; normal lighting becomes strong light with slight lens flare, camera looks down from above; the climbing motion is unchanged",
    "Clothing unchanged; normal lighting becomes dim light, darker scene without a night-vision filter, camera shoots from the side; the climbing motion is unchanged",
    "Clothing unchanged; normal lighting becomes backlight with strengthened outlines, camera at a 45 degree oblique angle; the climbing motion is unchanged",
    "Clothing unchanged; normal lighting becomes side light with stronger contrast, camera at eye level; the climbing motion is unchanged",
    // combined
    "The worker wears green overalls, medium build, female aged 40-50, dim environment without a night-vision filter; the climbing motion is unchanged",
    "The worker wears an orange safety suit, slim build, male aged 30-40, backlit environment; the climbing motion is unchanged",
    "The worker wears blue reflective overalls, sturdy build, male aged 35-45, strong light environment; the climbing motion is unchanged",
    "The worker wears red overalls, well-proportioned build, female aged 25-35, side-lit environment; the climbing motion is unchanged",
];

/// Prompt used by the corrective re-pass.
pub const CORRECTION_PROMPT: &str = "If the person wears a protective mask or eye goggles, keep the scene and tools unchanged and remove only the mask or goggles so the eyes are visible; otherwise change nothing";

pub const DEFAULT_SENTINEL_PROMPT_ID: u32 = 999;

pub const DEFAULT_VIDEO_PROMPT: &str = "Stable camera view continuing the first frame's background; the worker's climbing motion is smooth and natural, with clothing, gender, build, scene and lighting consistent with the first and last frames, in the look of industrial surveillance footage";

pub const DEFAULT_NEGATIVE_PROMPT: &str =
    "frame discontinuity, sudden change of person, inconsistent scene, jumpy motion";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptCatalog {
    prompts: Vec<PromptSpec>,
}

impl Default for PromptCatalog {
    fn default() -> Self {
        Self::from_texts(DEFAULT_PROMPTS.iter().copied())
    }
}

impl PromptCatalog {
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prompts = texts
            .into_iter()
            .enumerate()
            .map(|(index, text)| PromptSpec {
                prompt_id: index as u32,
                text: text.into(),
            })
            .collect();
        Self { prompts }
    }

    /// Loads a catalog from a JSON array of strings, or from plain text
    /// with one prompt per line (blank lines and `#` comments skipped).
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let catalog = Self::parse(&raw)?;
        if catalog.is_empty() {
            return Err(PipelineError::catalog(format!(
                "no prompts in {}",
                path.display()
            )));
        }
        Ok(catalog)
    }

    pub fn parse(raw: &str) -> PipelineResult<Self> {
        if raw.trim_start().starts_with('[') {
            let texts: Vec<String> = serde_json::from_str(raw)?;
            return Ok(Self::from_texts(texts));
        }
        Ok(Self::from_texts(
            raw.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        ))
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PromptSpec> {
        self.prompts.iter()
    }

    /// Ensures the corrective re-pass id lies outside `0..len`.
    pub fn check_sentinel(&self, sentinel: u32) -> PipelineResult<()> {
        if (sentinel as usize) < self.prompts.len() {
            return Err(PipelineError::SentinelCollision {
                sentinel,
                catalog_len: self.prompts.len(),
            });
        }
        Ok(())
    }
}
