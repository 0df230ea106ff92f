//! Records that flow through the pipeline.
//!
//! Everything here is plain data. The durable form of each record is a file
//! in one of the [`Layout`](crate::layout::Layout) namespaces, and the
//! filename alone carries its provenance key.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Which end of the source clip a frame was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    First,
    Last,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::First, Role::Last];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::First => "first",
            Role::Last => "last",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(Role::First),
            "last" => Ok(Role::Last),
            other => Err(format!("unknown frame role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Dimensions {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// A source clip. `asset_id` is the file stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoAsset {
    pub asset_id: String,
    pub path: PathBuf,
    pub frame_size: Dimensions,
}

/// One extracted still, first or last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord {
    pub asset_id: String,
    pub role: Role,
    pub path: PathBuf,
    pub size: Dimensions,
}

/// The first and last frame of one asset, ready for augmentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePair {
    pub asset_id: String,
    pub first: FrameRecord,
    pub last: FrameRecord,
}

impl FramePair {
    pub fn sizes_agree(&self) -> bool {
        self.first.size == self.last.size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSpec {
    pub prompt_id: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AugmentedFrame {
    pub asset_id: String,
    pub role: Role,
    pub prompt_id: u32,
    pub path: PathBuf,
    pub size: Dimensions,
}

/// First and last augmented frame sharing `(asset_id, prompt_id)`.
///
/// Never persisted. Recomputed from directory listings on every match run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchedPair {
    pub asset_id: String,
    pub prompt_id: u32,
    pub first_frame: PathBuf,
    pub last_frame: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedClip {
    pub asset_id: String,
    pub prompt_id: u32,
    pub path: PathBuf,
}
