//! Per-unit outcomes and the batch summary every stage ends with.

use std::fmt;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::models::{Dimensions, Role};

/// A unit of work that did not produce its artifact.
///
/// Each variant carries the key needed to re-run exactly that unit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnitFailure {
    ExtractionFailed {
        asset_id: String,
        reason: String,
    },
    DimensionMismatch {
        asset_id: String,
        first: (u32, u32),
        last: (u32, u32),
    },
    SourceMissing {
        path: PathBuf,
    },
    AugmentationFailed {
        asset_id: String,
        role: Role,
        prompt_id: u32,
        reason: String,
    },
    CorrectionFailed {
        source: PathBuf,
        reason: String,
    },
    /// A standalone image that was not augmented at all.
    ImageRejected {
        path: PathBuf,
        reason: String,
    },
    ImageAugmentationFailed {
        source: PathBuf,
        prompt_id: u32,
        reason: String,
    },
    UnmatchedFirst {
        asset_id: String,
        prompt_id: u32,
    },
    UnmatchedLast {
        asset_id: String,
        prompt_id: u32,
    },
    NoVideoProduced {
        asset_id: String,
        prompt_id: u32,
    },
    SynthesisFailed {
        asset_id: String,
        prompt_id: u32,
        reason: String,
    },
}

impl UnitFailure {
    pub fn dimension_mismatch(
        asset_id: impl Into<String>,
        first: Dimensions,
        last: Dimensions,
    ) -> Self {
        Self::DimensionMismatch {
            asset_id: asset_id.into(),
            first: (first.width, first.height),
            last: (last.width, last.height),
        }
    }
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitFailure::ExtractionFailed { asset_id, reason } => {
                write!(f, "extraction failed for {asset_id}: {reason}")
            }
            UnitFailure::DimensionMismatch {
                asset_id,
                first,
                last,
            } => write!(
                f,
                "frame size mismatch for {asset_id}: first {}x{}, last {}x{}",
                first.0, first.1, last.0, last.1
            ),
            UnitFailure::SourceMissing { path } => {
                write!(f, "source missing: {}", path.display())
            }
            UnitFailure::AugmentationFailed {
                asset_id,
                role,
                prompt_id,
                reason,
            } => write!(
                f,
                "augmentation failed for {asset_id} ({role}, prompt {prompt_id}): {reason}"
            ),
            UnitFailure::CorrectionFailed { source, reason } => {
                write!(f, "correction failed for {}: {reason}", source.display())
            }
            UnitFailure::ImageRejected { path, reason } => {
                write!(f, "image {} skipped: {reason}", path.display())
            }
            UnitFailure::ImageAugmentationFailed {
                source,
                prompt_id,
                reason,
            } => write!(
                f,
                "augmentation failed for {} (prompt {prompt_id}): {reason}",
                source.display()
            ),
            UnitFailure::UnmatchedFirst {
                asset_id,
                prompt_id,
            } => write!(f, "no last frame for {asset_id}, prompt {prompt_id}"),
            UnitFailure::UnmatchedLast {
                asset_id,
                prompt_id,
            } => write!(f, "no first frame for {asset_id}, prompt {prompt_id}"),
            UnitFailure::NoVideoProduced {
                asset_id,
                prompt_id,
            } => write!(f, "no video produced for {asset_id}, prompt {prompt_id}"),
            UnitFailure::SynthesisFailed {
                asset_id,
                prompt_id,
                reason,
            } => write!(
                f,
                "synthesis failed for {asset_id}, prompt {prompt_id}: {reason}"
            ),
        }
    }
}

/// What happened to one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Succeeded,
    /// The artifact was already on disk and was left alone.
    Skipped,
    /// The batch was cancelled before this unit's call was issued.
    Cancelled,
    Failed(UnitFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub stage: &'static str,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub failures: Vec<UnitFailure>,
}

impl BatchReport {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            attempted: 0,
            succeeded: 0,
            skipped: 0,
            cancelled: 0,
            failures: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Succeeded => {
                self.attempted += 1;
                self.succeeded += 1;
            }
            UnitOutcome::Skipped => self.skipped += 1,
            UnitOutcome::Cancelled => self.cancelled += 1,
            UnitOutcome::Failed(failure) => {
                self.attempted += 1;
                self.failures.push(failure);
            }
        }
    }

    /// Records a problem that is reported but was never an attempted call,
    /// such as an asset rejected before augmentation.
    pub fn note(&mut self, failure: UnitFailure) {
        self.failures.push(failure);
    }

    pub fn extend(&mut self, outcomes: impl IntoIterator<Item = UnitOutcome>) {
        for outcome in outcomes {
            self.record(outcome);
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.cancelled == 0
    }

    /// Sorts failure keys so the summary is stable across runs.
    pub fn finish(mut self) -> Self {
        self.failures.sort();
        self
    }

    pub fn log_summary(&self) {
        info!(
            stage = self.stage,
            attempted = self.attempted,
            succeeded = self.succeeded,
            skipped = self.skipped,
            cancelled = self.cancelled,
            failed = self.failed(),
            "Stage finished"
        );
        for failure in &self.failures {
            warn!(stage = self.stage, "{}", failure);
        }
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "[{}] attempted {}, succeeded {}, skipped {}, cancelled {}, failed {}",
            self.stage,
            self.attempted,
            self.succeeded,
            self.skipped,
            self.cancelled,
            self.failed()
        )?;
        for failure in &self.failures {
            writeln!(f, "  - {failure}")?;
        }
        Ok(())
    }
}
