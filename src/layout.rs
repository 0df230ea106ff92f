//! Directory namespaces under an output root.

use std::path::{Path, PathBuf};

use crate::models::Role;

const ORIGINAL_FIRST: &str = "original_first_frames";
const ORIGINAL_LAST: &str = "original_last_frames";
const AUGMENTED_FIRST: &str = "augmented_first_frames";
const AUGMENTED_LAST: &str = "augmented_last_frames";
const CORRECTED_FIRST: &str = "corrected_first_frames";
const CORRECTED_LAST: &str = "corrected_last_frames";
const CLIPS: &str = "synthesized_clips";
const AUGMENTED_IMAGES: &str = "augmented_images";
const CORRECTED_IMAGES: &str = "corrected_images";

/// Where each stage reads and writes.
///
/// First and last frames never share a directory, so a role-qualified
/// filename is unique within its namespace and concurrent writers for
/// different units cannot collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
    clips: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let clips = root.join(CLIPS);
        Self { root, clips }
    }

    pub fn with_clips_dir(mut self, clips: impl Into<PathBuf>) -> Self {
        self.clips = clips.into();
        self
    }

    pub fn original(&self, role: Role) -> PathBuf {
        self.root.join(match role {
            Role::First => ORIGINAL_FIRST,
            Role::Last => ORIGINAL_LAST,
        })
    }

    pub fn augmented(&self, role: Role) -> PathBuf {
        self.root.join(match role {
            Role::First => AUGMENTED_FIRST,
            Role::Last => AUGMENTED_LAST,
        })
    }

    pub fn corrected(&self, role: Role) -> PathBuf {
        self.root.join(match role {
            Role::First => CORRECTED_FIRST,
            Role::Last => CORRECTED_LAST,
        })
    }

    pub fn clips(&self) -> &Path {
        &self.clips
    }

    /// Variants of a standalone image set.
    pub fn images(&self) -> PathBuf {
        self.root.join(AUGMENTED_IMAGES)
    }

    pub fn corrected_images(&self) -> PathBuf {
        self.root.join(CORRECTED_IMAGES)
    }
}
