//! Variant Augmenter.
//!
//! Every `(asset, prompt)` unit runs in two dependent phases. The first
//! frame is rendered at the requested size; whatever size the service
//! actually returned is then forwarded as the request for the last frame,
//! so both halves of a pair share one canvas. If the first phase fails the
//! last one is never issued.
//!
//! Units are independent of each other and run concurrently; the gate on
//! the image endpoint bounds how many calls are in flight.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use image::codecs::jpeg;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::error::{PipelineResult, ServiceError};
use crate::fs_utils;
use crate::layout::Layout;
use crate::models::{AugmentedFrame, Dimensions, FramePair, FrameRecord, PromptSpec, Role};
use crate::naming::{self, ProvenanceKey};
use crate::prompts::{PromptCatalog, CORRECTION_PROMPT};
use crate::report::{BatchReport, UnitFailure, UnitOutcome};
use crate::retry::{self, RetryPolicy};
use crate::service::{ImageGenerator, ImageRequest};

const JPEG_QUALITY: u8 = 95;

/// Size requested for the first-frame call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePolicy {
    /// The extracted frame's own resolution.
    Native,
    /// One target for every asset.
    Uniform(Dimensions),
}

impl SizePolicy {
    pub fn resolve(&self, native: Dimensions) -> Dimensions {
        match self {
            SizePolicy::Native => native,
            SizePolicy::Uniform(size) => *size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AugmentOptions {
    pub size_policy: SizePolicy,
    /// Regenerate artifacts that already exist.
    pub force: bool,
    /// Units in flight at once.
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for AugmentOptions {
    fn default() -> Self {
        Self {
            size_policy: SizePolicy::Uniform(Dimensions::new(1280, 720)),
            force: false,
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct Augmenter {
    images: Arc<dyn ImageGenerator>,
    layout: Layout,
    options: AugmentOptions,
    cancel: CancelFlag,
}

/// Pairs up the extracted frames on disk by asset id.
///
/// Returns the usable pairs plus a failure for every asset that has only
/// one frame or an unreadable one.
pub async fn collect_frame_pairs(
    layout: &Layout,
) -> PipelineResult<(Vec<FramePair>, Vec<UnitFailure>)> {
    let mut found: BTreeMap<String, [Option<PathBuf>; 2]> = BTreeMap::new();
    for role in Role::ALL {
        for path in fs_utils::list_files(&layout.original(role)).await? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((asset_id, parsed_role)) = naming::parse_original_frame(name) else {
                continue;
            };
            if parsed_role != role {
                continue;
            }
            found.entry(asset_id).or_default()[role as usize] = Some(path);
        }
    }

    let layout = layout.clone();
    let collected = tokio::task::spawn_blocking(move || {
        let mut pairs = Vec::new();
        let mut problems = Vec::new();
        for (asset_id, [first, last]) in found {
            let missing = |role: Role| UnitFailure::SourceMissing {
                path: layout
                    .original(role)
                    .join(naming::original_frame_name(&asset_id, role)),
            };
            let (first, last) = match (first, last) {
                (Some(first), Some(last)) => (first, last),
                (None, _) => {
                    problems.push(missing(Role::First));
                    continue;
                }
                (_, None) => {
                    problems.push(missing(Role::Last));
                    continue;
                }
            };
            match (image::image_dimensions(&first), image::image_dimensions(&last)) {
                (Ok(first_size), Ok(last_size)) => pairs.push(FramePair {
                    first: FrameRecord {
                        asset_id: asset_id.clone(),
                        role: Role::First,
                        path: first,
                        size: first_size.into(),
                    },
                    last: FrameRecord {
                        asset_id: asset_id.clone(),
                        role: Role::Last,
                        path: last,
                        size: last_size.into(),
                    },
                    asset_id,
                }),
                (Err(e), _) | (_, Err(e)) => problems.push(UnitFailure::ExtractionFailed {
                    asset_id,
                    reason: format!("unreadable frame: {e}"),
                }),
            }
        }
        (pairs, problems)
    })
    .await
    .map_err(std::io::Error::other)?;

    Ok(collected)
}

/// Encodes `image` in the format its extension names.
fn encode_image(image: &DynamicImage, ext: &str) -> image::ImageResult<Vec<u8>> {
    let format = ImageFormat::from_extension(ext).unwrap_or(ImageFormat::Jpeg);
    let mut bytes = Vec::new();
    if format == ImageFormat::Jpeg {
        let rgb = image.to_rgb8();
        let mut encoder = jpeg::JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
        encoder.encode(&rgb, rgb.width(), rgb.height(), image::ExtendedColorType::Rgb8)?;
    } else {
        image.write_to(&mut Cursor::new(&mut bytes), format)?;
    }
    Ok(bytes)
}

async fn save_image(image: DynamicImage, path: &Path) -> Result<(), ServiceError> {
    let ext = naming::extension_of(path);
    let bytes = tokio::task::spawn_blocking(move || encode_image(&image, &ext))
        .await
        .map_err(std::io::Error::other)??;
    fs_utils::write_atomic(path, bytes).await?;
    Ok(())
}

/// Finds a standalone image set: one image file, or every image under a
/// directory (recursively), sorted by path.
pub fn discover_images(source: &Path) -> PipelineResult<Vec<PathBuf>> {
    fs_utils::walk_files(source, |path| {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(naming::is_image_extension)
    })
}

/// Size of an artifact already on disk, if it is there and readable.
async fn existing_size(path: &Path) -> Option<Dimensions> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || image::image_dimensions(path).ok())
        .await
        .ok()
        .flatten()
        .map(Dimensions::from)
}

impl Augmenter {
    pub fn new(
        images: Arc<dyn ImageGenerator>,
        layout: Layout,
        options: AugmentOptions,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            images,
            layout,
            options,
            cancel,
        }
    }

    /// Augments every extracted frame pair on disk with every catalog prompt.
    pub async fn run(&self, catalog: &PromptCatalog) -> PipelineResult<BatchReport> {
        let (pairs, problems) = collect_frame_pairs(&self.layout).await?;
        info!(
            assets = pairs.len(),
            prompts = catalog.len(),
            "Augmenting frame pairs"
        );
        let mut report = self.augment_pairs(&pairs, catalog).await;
        for problem in problems {
            warn!("{}", problem);
            report.note(problem);
        }
        Ok(report.finish())
    }

    pub async fn augment_pairs(
        &self,
        pairs: &[FramePair],
        catalog: &PromptCatalog,
    ) -> BatchReport {
        let mut report = BatchReport::new("augment");

        let mut units = Vec::new();
        for pair in pairs {
            if !pair.sizes_agree() {
                warn!(
                    asset_id = %pair.asset_id,
                    first = %pair.first.size,
                    last = %pair.last.size,
                    "First and last frame sizes differ, asset not augmented"
                );
                report.note(UnitFailure::dimension_mismatch(
                    &pair.asset_id,
                    pair.first.size,
                    pair.last.size,
                ));
                continue;
            }
            units.extend(catalog.iter().map(|prompt| (pair, prompt)));
        }

        let outcomes: Vec<Vec<UnitOutcome>> = stream::iter(units)
            .map(|(pair, prompt)| self.augment_unit(pair, prompt))
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;
        report.extend(outcomes.into_iter().flatten());
        report.finish()
    }

    fn output_path(&self, frame: &FrameRecord, prompt_id: u32) -> PathBuf {
        let key = ProvenanceKey::new(&frame.asset_id, frame.role, prompt_id);
        self.layout
            .augmented(frame.role)
            .join(key.file_name(&naming::extension_of(&frame.path)))
    }

    async fn augment_unit(&self, pair: &FramePair, prompt: &PromptSpec) -> Vec<UnitOutcome> {
        let mut outcomes = Vec::with_capacity(2);

        let first_out = self.output_path(&pair.first, prompt.prompt_id);
        let existing = if self.options.force {
            None
        } else {
            existing_size(&first_out).await
        };
        let forwarded = match existing {
            Some(size) => {
                debug!(
                    asset_id = %pair.asset_id,
                    prompt_id = prompt.prompt_id,
                    "First frame already augmented"
                );
                outcomes.push(UnitOutcome::Skipped);
                size
            }
            None => {
                let requested = self.options.size_policy.resolve(pair.first.size);
                let rendered = self
                    .render_frame(&pair.first, prompt, requested, &first_out, false)
                    .await;
                match rendered {
                    Ok(frame) => {
                        outcomes.push(UnitOutcome::Succeeded);
                        frame.size
                    }
                    Err(outcome) => {
                        outcomes.push(outcome);
                        return outcomes;
                    }
                }
            }
        };

        let last_out = self.output_path(&pair.last, prompt.prompt_id);
        if !self.options.force && existing_size(&last_out).await == Some(forwarded) {
            outcomes.push(UnitOutcome::Skipped);
            return outcomes;
        }
        let outcome = match self
            .render_frame(&pair.last, prompt, forwarded, &last_out, true)
            .await
        {
            Ok(_) => UnitOutcome::Succeeded,
            Err(outcome) => outcome,
        };
        outcomes.push(outcome);
        outcomes
    }

    /// One generation call plus the write. Returns the size that landed on
    /// disk; with `conform` set that is always `size`.
    async fn render(
        &self,
        source: &Path,
        prompt: &str,
        size: Dimensions,
        out: &Path,
        conform: bool,
        label: &str,
    ) -> Result<Dimensions, ServiceError> {
        if self.cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }

        let request = ImageRequest {
            source: source.to_path_buf(),
            prompt: prompt.to_string(),
            size,
        };
        let image = retry::with_retry(&self.options.retry, label, || {
            self.images.generate(request.clone())
        })
        .await?;
        let actual = Dimensions::from(image.dimensions());
        let image = if conform && actual != size {
            warn!(
                unit = label,
                forwarded = %size,
                returned = %actual,
                "Service ignored the forwarded size, resizing to match the first frame"
            );
            image.resize_exact(size.width, size.height, FilterType::Lanczos3)
        } else {
            image
        };
        let written = Dimensions::from(image.dimensions());
        save_image(image, out).await?;
        debug!(unit = label, requested = %size, written = %written, "Image written");
        Ok(written)
    }

    async fn render_frame(
        &self,
        frame: &FrameRecord,
        prompt: &PromptSpec,
        size: Dimensions,
        out: &Path,
        conform: bool,
    ) -> Result<AugmentedFrame, UnitOutcome> {
        let prompt_id = prompt.prompt_id;
        let label = format!("{}/{}/prompt{}", frame.asset_id, frame.role, prompt_id);
        match self
            .render(&frame.path, &prompt.text, size, out, conform, &label)
            .await
        {
            Ok(written) => Ok(AugmentedFrame {
                asset_id: frame.asset_id.clone(),
                role: frame.role,
                prompt_id,
                path: out.to_path_buf(),
                size: written,
            }),
            Err(ServiceError::Cancelled) => Err(UnitOutcome::Cancelled),
            Err(ServiceError::SourceMissing(path)) => {
                warn!(path = %path.display(), "Source frame missing");
                Err(UnitOutcome::Failed(UnitFailure::SourceMissing { path }))
            }
            Err(e) => {
                warn!(
                    asset_id = %frame.asset_id,
                    role = %frame.role,
                    prompt_id,
                    "Augmentation failed: {e}"
                );
                Err(UnitOutcome::Failed(UnitFailure::AugmentationFailed {
                    asset_id: frame.asset_id.clone(),
                    role: frame.role,
                    prompt_id,
                    reason: e.to_string(),
                }))
            }
        }
    }

    /// Renders every catalog prompt over a standalone image set into the
    /// image-variant namespace, at each image's own size or the uniform
    /// target. Images sharing a stem are rejected after the first.
    pub async fn augment_images(
        &self,
        source: &Path,
        catalog: &PromptCatalog,
    ) -> PipelineResult<BatchReport> {
        let (images, duplicates) = naming::unique_asset_ids(discover_images(source)?);
        let mut report = BatchReport::new("augment-images");
        for (stem, path, kept) in duplicates {
            warn!(stem = %stem, path = %path.display(), "Duplicate image stem, skipped");
            report.note(UnitFailure::ImageRejected {
                path,
                reason: format!("duplicate image name, already taken by {}", kept.display()),
            });
        }

        let mut units = Vec::new();
        let mut readable = 0;
        for (stem, path) in images {
            let Some(native) = existing_size(&path).await else {
                warn!(path = %path.display(), "Unreadable image, skipped");
                report.note(UnitFailure::ImageRejected {
                    path,
                    reason: "unreadable image".to_string(),
                });
                continue;
            };
            readable += 1;
            for prompt in catalog.iter() {
                units.push((stem.clone(), path.clone(), native, prompt));
            }
        }
        info!(
            images = readable,
            prompts = catalog.len(),
            "Augmenting image set"
        );

        let outcomes: Vec<UnitOutcome> = stream::iter(units)
            .map(|(stem, path, native, prompt)| self.augment_image(stem, path, native, prompt))
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;
        report.extend(outcomes);
        Ok(report.finish())
    }

    async fn augment_image(
        &self,
        stem: String,
        source: PathBuf,
        native: Dimensions,
        prompt: &PromptSpec,
    ) -> UnitOutcome {
        let ext = naming::extension_of(&source);
        let out = self
            .layout
            .images()
            .join(naming::variant_name(&stem, prompt.prompt_id, &ext));
        if !self.options.force && existing_size(&out).await.is_some() {
            return UnitOutcome::Skipped;
        }

        let size = self.options.size_policy.resolve(native);
        let label = format!("{stem}/prompt{}", prompt.prompt_id);
        match self
            .render(&source, &prompt.text, size, &out, false, &label)
            .await
        {
            Ok(_) => UnitOutcome::Succeeded,
            Err(ServiceError::Cancelled) => UnitOutcome::Cancelled,
            Err(ServiceError::SourceMissing(path)) => {
                warn!(path = %path.display(), "Source image missing");
                UnitOutcome::Failed(UnitFailure::SourceMissing { path })
            }
            Err(e) => {
                warn!(
                    source = %source.display(),
                    prompt_id = prompt.prompt_id,
                    "Augmentation failed: {e}"
                );
                UnitOutcome::Failed(UnitFailure::ImageAugmentationFailed {
                    source,
                    prompt_id: prompt.prompt_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Corrective re-pass: re-submits every augmented frame with the
    /// gear-removal prompt and writes the result to the corrected
    /// namespaces under the sentinel id. Originals are left in place.
    pub async fn correct(
        &self,
        catalog: &PromptCatalog,
        sentinel: u32,
    ) -> PipelineResult<BatchReport> {
        catalog.check_sentinel(sentinel)?;

        let mut sources = Vec::new();
        for role in Role::ALL {
            for path in fs_utils::list_files(&self.layout.augmented(role)).await? {
                let parsed = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(ProvenanceKey::parse);
                if let Some((key, ext)) = parsed {
                    if key.role == role {
                        let out = self
                            .layout
                            .corrected(role)
                            .join(naming::corrected_name(&key, &ext, sentinel));
                        sources.push((path, out));
                    }
                }
            }
        }
        Ok(self.correct_all("correct", sentinel, sources).await)
    }

    /// The corrective re-pass over the image-variant namespace. Each
    /// variant's copy appends the sentinel to the variant's own stem.
    pub async fn correct_images(
        &self,
        catalog: &PromptCatalog,
        sentinel: u32,
    ) -> PipelineResult<BatchReport> {
        catalog.check_sentinel(sentinel)?;

        let mut sources = Vec::new();
        for path in fs_utils::list_files(&self.layout.images()).await? {
            let parsed = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(naming::parse_variant);
            if let Some((stem, prompt_id, ext)) = parsed {
                let stem = format!("{stem}_prompt{prompt_id}");
                let out = self
                    .layout
                    .corrected_images()
                    .join(naming::variant_name(&stem, sentinel, &ext));
                sources.push((path, out));
            }
        }
        Ok(self.correct_all("correct-images", sentinel, sources).await)
    }

    async fn correct_all(
        &self,
        stage: &'static str,
        sentinel: u32,
        sources: Vec<(PathBuf, PathBuf)>,
    ) -> BatchReport {
        info!(stage, frames = sources.len(), sentinel, "Running corrective pass");

        let outcomes: Vec<UnitOutcome> = stream::iter(sources)
            .map(|(source, out)| self.correct_one(source, out))
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        let mut report = BatchReport::new(stage);
        report.extend(outcomes);
        report.finish()
    }

    async fn correct_one(&self, source: PathBuf, out: PathBuf) -> UnitOutcome {
        if !self.options.force && existing_size(&out).await.is_some() {
            return UnitOutcome::Skipped;
        }
        if self.cancel.is_cancelled() {
            return UnitOutcome::Cancelled;
        }
        let Some(size) = existing_size(&source).await else {
            return UnitOutcome::Failed(UnitFailure::SourceMissing { path: source });
        };

        let label = format!("correct/{}", source.display());
        match self
            .render(&source, CORRECTION_PROMPT, size, &out, false, &label)
            .await
        {
            Ok(_) => UnitOutcome::Succeeded,
            Err(ServiceError::Cancelled) => UnitOutcome::Cancelled,
            Err(e) => {
                warn!(source = %source.display(), "Correction failed: {e}");
                UnitOutcome::Failed(UnitFailure::CorrectionFailed {
                    source,
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::error::ServiceResult;

    /// Records every call. Optionally snaps widths and heights down to a
    /// multiple of `snap`, and fails calls whose source file name and
    /// prompt match an entry in `fail_on`.
    #[derive(Default)]
    pub(crate) struct FakeImages {
        pub calls: Mutex<Vec<(String, Dimensions)>>,
        pub snap: Option<u32>,
        pub fail_on: Vec<(String, String)>,
        pub ignore_size: Option<Dimensions>,
    }

    impl FakeImages {
        pub(crate) fn calls(&self) -> Vec<(String, Dimensions)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ImageGenerator for FakeImages {
        async fn generate(&self, request: ImageRequest) -> ServiceResult<DynamicImage> {
            if !request.source.is_file() {
                return Err(ServiceError::SourceMissing(request.source));
            }
            let name = request
                .source
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned();
            self.calls.lock().unwrap().push((name.clone(), request.size));
            if self
                .fail_on
                .iter()
                .any(|(file, prompt)| *file == name && *prompt == request.prompt)
            {
                return Err(ServiceError::Status {
                    status: 500,
                    body: "boom".into(),
                });
            }
            let mut size = request.size;
            if let Some(snap) = self.snap {
                size = Dimensions::new(size.width / snap * snap, size.height / snap * snap);
            }
            if let (Some(fixed), true) = (self.ignore_size, name.contains("_last_frame")) {
                size = fixed;
            }
            Ok(DynamicImage::new_rgb8(size.width, size.height))
        }
    }

    pub(crate) fn write_frames(
        layout: &Layout,
        asset_id: &str,
        first: (u32, u32),
        last: (u32, u32),
    ) {
        for (role, (w, h)) in [(Role::First, first), (Role::Last, last)] {
            let dir = layout.original(role);
            std::fs::create_dir_all(&dir).unwrap();
            DynamicImage::new_rgb8(w, h)
                .save(dir.join(naming::original_frame_name(asset_id, role)))
                .unwrap();
        }
    }

    fn augmenter(images: Arc<FakeImages>, layout: &Layout, size_policy: SizePolicy) -> Augmenter {
        Augmenter::new(
            images,
            layout.clone(),
            AugmentOptions {
                size_policy,
                concurrency: 3,
                ..AugmentOptions::default()
            },
            CancelFlag::new(),
        )
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_two_prompt_scenario_produces_four_frames() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        write_frames(&layout, "A", (100, 100), (100, 100));
        let images = Arc::new(FakeImages::default());
        let catalog = PromptCatalog::from_texts(["red suit", "blue suit"]);

        let report = augmenter(images.clone(), &layout, SizePolicy::Native)
            .run(&catalog)
            .await
            .unwrap();

        assert_eq!(report.succeeded, 4);
        assert!(report.is_clean());
        assert_eq!(
            names_in(&layout.augmented(Role::First)),
            vec!["A_first_frame_aug_prompt0.jpg", "A_first_frame_aug_prompt1.jpg"]
        );
        assert_eq!(
            names_in(&layout.augmented(Role::Last)),
            vec!["A_last_frame_aug_prompt0.jpg", "A_last_frame_aug_prompt1.jpg"]
        );
        assert!(images
            .calls()
            .iter()
            .all(|(_, size)| *size == Dimensions::new(100, 100)));
    }

    #[tokio::test]
    async fn test_last_frame_gets_actual_first_size_not_request() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        write_frames(&layout, "A", (100, 100), (100, 100));
        let images = Arc::new(FakeImages {
            snap: Some(64),
            ..FakeImages::default()
        });
        let catalog = PromptCatalog::from_texts(["red suit"]);

        augmenter(images.clone(), &layout, SizePolicy::Uniform(Dimensions::new(1000, 700)))
            .run(&catalog)
            .await
            .unwrap();

        let calls = images.calls();
        assert_eq!(
            calls,
            vec![
                ("A_first_frame.jpg".to_string(), Dimensions::new(1000, 700)),
                ("A_last_frame.jpg".to_string(), Dimensions::new(960, 640)),
            ]
        );
        let first = layout.augmented(Role::First).join("A_first_frame_aug_prompt0.jpg");
        let last = layout.augmented(Role::Last).join("A_last_frame_aug_prompt0.jpg");
        assert_eq!(image::image_dimensions(&first).unwrap(), (960, 640));
        assert_eq!(image::image_dimensions(&last).unwrap(), (960, 640));
    }

    #[tokio::test]
    async fn test_last_frame_is_conformed_when_service_ignores_size() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        write_frames(&layout, "A", (64, 48), (64, 48));
        let images = Arc::new(FakeImages {
            ignore_size: Some(Dimensions::new(32, 32)),
            ..FakeImages::default()
        });
        let catalog = PromptCatalog::from_texts(["red suit"]);

        let report = augmenter(images, &layout, SizePolicy::Native)
            .run(&catalog)
            .await
            .unwrap();

        assert_eq!(report.succeeded, 2);
        let last = layout.augmented(Role::Last).join("A_last_frame_aug_prompt0.jpg");
        assert_eq!(image::image_dimensions(&last).unwrap(), (64, 48));
    }

    #[tokio::test]
    async fn test_mismatched_asset_is_never_augmented() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        write_frames(&layout, "A", (100, 100), (100, 90));
        write_frames(&layout, "B", (50, 50), (50, 50));
        let images = Arc::new(FakeImages::default());
        let catalog = PromptCatalog::from_texts(["red suit"]);

        let report = augmenter(images.clone(), &layout, SizePolicy::Native)
            .run(&catalog)
            .await
            .unwrap();

        assert!(images.calls().iter().all(|(name, _)| name.starts_with("B_")));
        assert_eq!(report.succeeded, 2);
        assert_eq!(
            report.failures,
            vec![UnitFailure::DimensionMismatch {
                asset_id: "A".into(),
                first: (100, 100),
                last: (100, 90),
            }]
        );
    }

    #[tokio::test]
    async fn test_failed_first_frame_skips_its_last_frame() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        write_frames(&layout, "A", (100, 100), (100, 100));
        let images = Arc::new(FakeImages {
            fail_on: vec![("A_first_frame.jpg".into(), "blue suit".into())],
            ..FakeImages::default()
        });
        let catalog = PromptCatalog::from_texts(["red suit", "blue suit"]);

        let report = augmenter(images.clone(), &layout, SizePolicy::Native)
            .run(&catalog)
            .await
            .unwrap();

        assert_eq!(images.calls().len(), 3);
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 2);
        assert!(matches!(
            &report.failures[..],
            [UnitFailure::AugmentationFailed {
                asset_id,
                role: Role::First,
                prompt_id: 1,
                ..
            }] if asset_id == "A"
        ));
        assert!(!layout
            .augmented(Role::Last)
            .join("A_last_frame_aug_prompt1.jpg")
            .exists());
    }

    #[tokio::test]
    async fn test_rerun_skips_existing_and_resumes_missing_last() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        write_frames(&layout, "A", (100, 100), (100, 100));
        let catalog = PromptCatalog::from_texts(["red suit", "blue suit"]);
        augmenter(Arc::new(FakeImages::default()), &layout, SizePolicy::Native)
            .run(&catalog)
            .await
            .unwrap();
        let lost = layout.augmented(Role::Last).join("A_last_frame_aug_prompt1.jpg");
        std::fs::remove_file(lost).unwrap();

        let images = Arc::new(FakeImages::default());
        let uniform = SizePolicy::Uniform(Dimensions::new(640, 480));
        let report = augmenter(images.clone(), &layout, uniform)
            .run(&catalog)
            .await
            .unwrap();

        // Only the missing half is regenerated, at the size of the first
        // frame already on disk rather than the new uniform target.
        assert_eq!(
            images.calls(),
            vec![("A_last_frame.jpg".to_string(), Dimensions::new(100, 100))]
        );
        assert_eq!(report.skipped, 3);
        assert_eq!(report.succeeded, 1);
    }

    #[tokio::test]
    async fn test_cancelled_batch_issues_no_calls() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        write_frames(&layout, "A", (100, 100), (100, 100));
        let images = Arc::new(FakeImages::default());
        let cancel = CancelFlag::new();
        cancel.cancel();
        let augmenter = Augmenter::new(images.clone(), layout, AugmentOptions::default(), cancel);

        let report = augmenter
            .run(&PromptCatalog::from_texts(["red suit", "blue suit"]))
            .await
            .unwrap();

        assert!(images.calls().is_empty());
        assert_eq!(report.cancelled, 2);
    }

    #[tokio::test]
    async fn test_missing_counterpart_is_reported() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        write_frames(&layout, "A", (100, 100), (100, 100));
        std::fs::remove_file(layout.original(Role::Last).join("A_last_frame.jpg")).unwrap();

        let (pairs, problems) = collect_frame_pairs(&layout).await.unwrap();

        assert!(pairs.is_empty());
        assert_eq!(
            problems,
            vec![UnitFailure::SourceMissing {
                path: layout.original(Role::Last).join("A_last_frame.jpg")
            }]
        );
    }

    #[tokio::test]
    async fn test_correction_pass_writes_separate_namespace() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        write_frames(&layout, "A", (80, 60), (80, 60));
        let catalog = PromptCatalog::from_texts(["red suit"]);
        let images = Arc::new(FakeImages::default());
        let augmenter = augmenter(images.clone(), &layout, SizePolicy::Native);
        augmenter.run(&catalog).await.unwrap();
        std::fs::write(layout.augmented(Role::First).join("stray_file.jpg"), b"x").unwrap();

        let report = augmenter.correct(&catalog, 999).await.unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(
            names_in(&layout.corrected(Role::First)),
            vec!["A_first_frame_aug_prompt0_prompt999.jpg"]
        );
        assert_eq!(
            names_in(&layout.corrected(Role::Last)),
            vec!["A_last_frame_aug_prompt0_prompt999.jpg"]
        );
        assert!(layout
            .augmented(Role::First)
            .join("A_first_frame_aug_prompt0.jpg")
            .exists());
        let correction_calls = images.calls().into_iter().skip(2).collect::<Vec<_>>();
        assert!(correction_calls
            .iter()
            .all(|(_, size)| *size == Dimensions::new(80, 60)));
    }

    #[tokio::test]
    async fn test_correction_rejects_colliding_sentinel() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        let catalog = PromptCatalog::from_texts(["a", "b", "c"]);
        let result = augmenter(Arc::new(FakeImages::default()), &layout, SizePolicy::Native)
            .correct(&catalog, 2)
            .await;
        assert!(matches!(
            result,
            Err(crate::error::PipelineError::SentinelCollision { .. })
        ));
    }

    fn write_image(path: &Path, (w, h): (u32, u32)) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        DynamicImage::new_rgb8(w, h).save(path).unwrap();
    }

    #[tokio::test]
    async fn test_image_set_keeps_native_sizes_and_corrects_variants() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("img");
        write_image(&source.join("a.png"), (100, 80));
        write_image(&source.join("sub/b.jpg"), (60, 40));
        write_image(&source.join("sub2/a.jpg"), (30, 30));
        std::fs::write(source.join("notes.txt"), "not an image").unwrap();
        let layout = Layout::new(dir.path().join("out"));
        let catalog = PromptCatalog::from_texts(["red suit", "blue suit"]);
        let images = Arc::new(FakeImages::default());
        let augmenter = augmenter(images.clone(), &layout, SizePolicy::Native);

        let report = augmenter.augment_images(&source, &catalog).await.unwrap();

        assert_eq!(report.succeeded, 4);
        assert!(matches!(
            &report.failures[..],
            [UnitFailure::ImageRejected { path, reason }]
                if path.ends_with("sub2/a.jpg") && reason.contains("duplicate")
        ));
        assert_eq!(
            names_in(&layout.images()),
            vec!["a_prompt0.png", "a_prompt1.png", "b_prompt0.jpg", "b_prompt1.jpg"]
        );
        let size_of = |name: &str| {
            Dimensions::from(image::image_dimensions(layout.images().join(name)).unwrap())
        };
        assert_eq!(size_of("a_prompt1.png"), Dimensions::new(100, 80));
        assert_eq!(size_of("b_prompt0.jpg"), Dimensions::new(60, 40));
        assert!(images.calls().iter().all(|(name, _)| name != "a.jpg"));

        let corrected = augmenter.correct_images(&catalog, 999).await.unwrap();
        assert_eq!(corrected.succeeded, 4);
        assert_eq!(
            names_in(&layout.corrected_images()),
            vec![
                "a_prompt0_prompt999.png",
                "a_prompt1_prompt999.png",
                "b_prompt0_prompt999.jpg",
                "b_prompt1_prompt999.jpg",
            ]
        );
        let corrected_size = image::image_dimensions(
            layout.corrected_images().join("b_prompt1_prompt999.jpg"),
        )
        .unwrap();
        assert_eq!(corrected_size, (60, 40));
        assert_eq!(names_in(&layout.images()).len(), 4);
    }

    #[tokio::test]
    async fn test_image_set_uniform_size_and_failed_prompt() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("b.jpg");
        write_image(&source, (60, 40));
        let layout = Layout::new(dir.path().join("out"));
        let catalog = PromptCatalog::from_texts(["red suit", "blue suit"]);
        let images = Arc::new(FakeImages {
            fail_on: vec![("b.jpg".into(), "blue suit".into())],
            ..FakeImages::default()
        });
        let uniform = SizePolicy::Uniform(Dimensions::new(64, 48));

        let report = augmenter(images.clone(), &layout, uniform)
            .augment_images(&source, &catalog)
            .await
            .unwrap();

        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert!(matches!(
            &report.failures[..],
            [UnitFailure::ImageAugmentationFailed { prompt_id: 1, .. }]
        ));
        assert!(images
            .calls()
            .iter()
            .all(|(_, size)| *size == Dimensions::new(64, 48)));
        assert_eq!(names_in(&layout.images()), vec!["b_prompt0.jpg"]);

        let rerun = augmenter(Arc::new(FakeImages::default()), &layout, uniform)
            .augment_images(&source, &catalog)
            .await
            .unwrap();
        assert_eq!(rerun.skipped, 1);
        assert_eq!(rerun.succeeded, 1);
    }

    #[tokio::test]
    async fn test_image_set_rejects_non_image_source() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("notes.txt");
        std::fs::write(&source, "text").unwrap();
        let layout = Layout::new(dir.path().join("out"));
        let result = augmenter(Arc::new(FakeImages::default()), &layout, SizePolicy::Native)
            .augment_images(&source, &PromptCatalog::from_texts(["a"]))
            .await;
        assert!(matches!(
            result,
            Err(crate::error::PipelineError::InvalidSource(_))
        ));
    }

    #[test]
    fn test_encode_image_follows_extension() {
        let image = DynamicImage::new_rgba8(4, 3);
        let jpeg = encode_image(&image, "jpg").unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);
        let png = encode_image(&image, "png").unwrap();
        assert_eq!(image::guess_format(&png).unwrap(), ImageFormat::Png);
    }
}
