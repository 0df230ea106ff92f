//! Filename grammar shared by every stage.
//!
//! There is no manifest: the `(asset_id, role, prompt_id)` triple lives in
//! the artifact name, so encode and decode are kept side by side here and
//! nowhere else builds or splits these names.
//!
//! ```text
//! original   {asset}_{role}_frame.{ext}
//! augmented  {asset}_{role}_frame_aug_prompt{id}.{ext}
//! corrected  {asset}_{role}_frame_aug_prompt{id}_prompt{sentinel}.{ext}
//! clip       {asset}_aug{id}.mp4          (extra video prompts: _v{k})
//! variant    {image}_prompt{id}.{ext}     (standalone image sets)
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::models::Role;

pub const FRAME_EXTENSION: &str = "jpg";
pub const CLIP_EXTENSION: &str = "mp4";

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp"];

static ORIGINAL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+)_(first|last)_frame\.([A-Za-z0-9]+)$").expect("valid original frame regex")
});

static AUGMENTED_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+)_(first|last)_frame_aug_prompt(\d+)\.([A-Za-z0-9]+)$")
        .expect("valid augmented frame regex")
});

static VARIANT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+)_prompt(\d+)\.([A-Za-z0-9]+)$").expect("valid image variant regex")
});

/// The provenance key carried by every augmented artifact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProvenanceKey {
    pub asset_id: String,
    pub role: Role,
    pub prompt_id: u32,
}

impl ProvenanceKey {
    pub fn new(asset_id: impl Into<String>, role: Role, prompt_id: u32) -> Self {
        Self {
            asset_id: asset_id.into(),
            role,
            prompt_id,
        }
    }

    /// `{asset}_{role}_frame_aug_prompt{id}.{ext}`
    pub fn file_name(&self, ext: &str) -> String {
        format!(
            "{}_aug_prompt{}.{}",
            frame_stem(&self.asset_id, self.role),
            self.prompt_id,
            ext
        )
    }

    /// Decodes an augmented frame name into its key and extension.
    ///
    /// Anything outside the grammar, including names with a non-image
    /// extension, yields `None`.
    pub fn parse(file_name: &str) -> Option<(Self, String)> {
        let caps = AUGMENTED_PATTERN.captures(file_name)?;
        let ext = caps[4].to_string();
        if !is_image_extension(&ext) {
            return None;
        }
        let key = Self {
            asset_id: caps[1].to_string(),
            role: caps[2].parse().ok()?,
            prompt_id: caps[3].parse().ok()?,
        };
        Some((key, ext))
    }
}

/// `{asset}_{role}_frame`, the stem every frame artifact starts from.
pub fn frame_stem(asset_id: &str, role: Role) -> String {
    format!("{asset_id}_{role}_frame")
}

pub fn original_frame_name(asset_id: &str, role: Role) -> String {
    format!("{}.{}", frame_stem(asset_id, role), FRAME_EXTENSION)
}

/// Decodes an extracted frame name into `(asset_id, role)`.
pub fn parse_original_frame(file_name: &str) -> Option<(String, Role)> {
    let caps = ORIGINAL_PATTERN.captures(file_name)?;
    if !is_image_extension(&caps[3]) {
        return None;
    }
    Some((caps[1].to_string(), caps[2].parse().ok()?))
}

/// Name for an augmented frame after the corrective re-pass.
pub fn corrected_name(key: &ProvenanceKey, ext: &str, sentinel: u32) -> String {
    let augmented = key.file_name(ext);
    let stem = augmented
        .strip_suffix(&format!(".{ext}"))
        .unwrap_or(&augmented);
    format!("{stem}_prompt{sentinel}.{ext}")
}

/// `{asset}_aug{prompt_id}.mp4`; video prompts past the first get `_v{k}`.
pub fn clip_name(asset_id: &str, prompt_id: u32, video_prompt_index: usize) -> String {
    if video_prompt_index == 0 {
        format!("{asset_id}_aug{prompt_id}.{CLIP_EXTENSION}")
    } else {
        format!("{asset_id}_aug{prompt_id}_v{video_prompt_index}.{CLIP_EXTENSION}")
    }
}

/// `{stem}_prompt{prompt_id}.{ext}`, one variant of a standalone image.
///
/// Applied to a variant's own stem this also names its corrected copy.
pub fn variant_name(stem: &str, prompt_id: u32, ext: &str) -> String {
    format!("{stem}_prompt{prompt_id}.{ext}")
}

/// Decodes a variant name into `(stem, prompt_id, ext)`. The stem is the
/// longest match, so a corrected variant yields its sentinel id.
pub fn parse_variant(file_name: &str) -> Option<(String, u32, String)> {
    let caps = VARIANT_PATTERN.captures(file_name)?;
    let ext = caps[3].to_string();
    if !is_image_extension(&ext) {
        return None;
    }
    Some((caps[1].to_string(), caps[2].parse().ok()?, ext))
}

/// Keys `paths` by asset id, keeping the first path for each id.
///
/// Returns the kept `(asset_id, path)` list and, for every later path that
/// collides, `(asset_id, path, kept_path)`. Both lists keep input order.
pub fn unique_asset_ids(
    paths: Vec<PathBuf>,
) -> (Vec<(String, PathBuf)>, Vec<(String, PathBuf, PathBuf)>) {
    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    let mut kept = Vec::new();
    let mut duplicates = Vec::new();
    for path in paths {
        let id = asset_id(&path).unwrap_or_else(|| path.display().to_string());
        match seen.get(&id) {
            Some(first) => duplicates.push((id, path, first.clone())),
            None => {
                seen.insert(id.clone(), path.clone());
                kept.push((id, path));
            }
        }
    }
    (kept, duplicates)
}

/// Asset id of a source clip: its file stem.
pub fn asset_id(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_owned)
}

pub fn is_image_extension(ext: &str) -> bool {
    let ext = ext.to_ascii_lowercase();
    IMAGE_EXTENSIONS.contains(&ext.as_str())
}

/// Extension of `path` as written, falling back to the default frame format.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| is_image_extension(ext))
        .map(str::to_owned)
        .unwrap_or_else(|| FRAME_EXTENSION.to_owned())
}
