//! Pair Matcher.
//!
//! Joins the augmented-first and augmented-last namespaces on
//! `(asset_id, prompt_id)` using nothing but filenames. The result depends
//! only on the two directory listings; both are sorted before the join so
//! repeated runs agree even when the filesystem lists entries in a
//! different order.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::PipelineResult;
use crate::fs_utils;
use crate::models::{MatchedPair, Role};
use crate::naming::ProvenanceKey;
use crate::report::{BatchReport, UnitFailure};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchReport {
    /// Sorted by `(asset_id, prompt_id)`.
    pub pairs: Vec<MatchedPair>,
    pub unmatched_first: Vec<(String, u32)>,
    pub unmatched_last: Vec<(String, u32)>,
}

impl MatchReport {
    pub fn to_batch_report(&self) -> BatchReport {
        let mut report = BatchReport::new("match");
        report.succeeded = self.pairs.len();
        report.attempted = self.pairs.len() + self.unmatched_first.len();
        for (asset_id, prompt_id) in &self.unmatched_first {
            report.note(UnitFailure::UnmatchedFirst {
                asset_id: asset_id.clone(),
                prompt_id: *prompt_id,
            });
        }
        for (asset_id, prompt_id) in &self.unmatched_last {
            report.note(UnitFailure::UnmatchedLast {
                asset_id: asset_id.clone(),
                prompt_id: *prompt_id,
            });
        }
        report.finish()
    }
}

/// Keys every file in `files` that parses as an augmented frame of `role`.
fn keyed(files: Vec<PathBuf>, role: Role) -> Vec<((String, u32), PathBuf)> {
    files
        .into_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            let (key, _) = ProvenanceKey::parse(name)?;
            (key.role == role).then(|| ((key.asset_id, key.prompt_id), path))
        })
        .collect()
}

/// Pure join over two listings.
pub fn join(first_files: Vec<PathBuf>, last_files: Vec<PathBuf>) -> MatchReport {
    let mut first_files = first_files;
    let mut last_files = last_files;
    first_files.sort();
    last_files.sort();

    // On duplicate keys (same frame under two extensions) the
    // lexicographically first path wins and the rest are reported as
    // unmatched, the same as surplus last frames below.
    let mut firsts: BTreeMap<(String, u32), PathBuf> = BTreeMap::new();
    let mut unmatched_first = Vec::new();
    for (key, path) in keyed(first_files, Role::First) {
        match firsts.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(path);
            }
            Entry::Occupied(slot) => unmatched_first.push(slot.key().clone()),
        }
    }

    let mut pairs = Vec::new();
    let mut unmatched_last = Vec::new();
    for (key, last_frame) in keyed(last_files, Role::Last) {
        // Removing on hit stops a second last frame pairing with the same
        // first frame and leaves only true orphans behind.
        match firsts.remove(&key) {
            Some(first_frame) => pairs.push(MatchedPair {
                asset_id: key.0,
                prompt_id: key.1,
                first_frame,
                last_frame,
            }),
            None => unmatched_last.push(key),
        }
    }

    pairs.sort();
    unmatched_first.extend(firsts.into_keys());
    unmatched_first.sort();
    unmatched_first.dedup();
    unmatched_last.sort();
    unmatched_last.dedup();
    MatchReport {
        pairs,
        unmatched_first,
        unmatched_last,
    }
}

/// Lists both namespaces and joins them.
pub async fn match_pairs(
    first_dir: &Path,
    last_dir: &Path,
) -> PipelineResult<MatchReport> {
    let first_files = fs_utils::list_files(first_dir).await?;
    let last_files = fs_utils::list_files(last_dir).await?;
    let report = join(first_files, last_files);

    info!(
        pairs = report.pairs.len(),
        unmatched_first = report.unmatched_first.len(),
        unmatched_last = report.unmatched_last.len(),
        "Matched augmented frames"
    );
    for (asset_id, prompt_id) in &report.unmatched_first {
        warn!(asset_id = %asset_id, prompt_id, "No matching last frame");
    }
    for (asset_id, prompt_id) in &report.unmatched_last {
        warn!(asset_id = %asset_id, prompt_id, "No matching first frame");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths(dir: &str, names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| Path::new(dir).join(n)).collect()
    }

    const FIRSTS: &[&str] = &["A_first_frame_aug_prompt0.jpg", "A_first_frame_aug_prompt1.jpg"];
    const LASTS: &[&str] = &["A_last_frame_aug_prompt0.jpg", "A_last_frame_aug_prompt1.jpg"];

    #[test]
    fn test_full_scenario_matches_every_prompt() {
        let report = join(paths("f", FIRSTS), paths("l", LASTS));
        assert_eq!(report.pairs.len(), 2);
        assert!(report.unmatched_first.is_empty());
        assert!(report.unmatched_last.is_empty());
        assert_eq!(report.pairs[0].prompt_id, 0);
        assert_eq!(
            report.pairs[1],
            MatchedPair {
                asset_id: "A".into(),
                prompt_id: 1,
                first_frame: PathBuf::from("f/A_first_frame_aug_prompt1.jpg"),
                last_frame: PathBuf::from("l/A_last_frame_aug_prompt1.jpg"),
            }
        );
    }

    #[test]
    fn test_missing_last_frame_leaves_one_unmatched() {
        let report = join(paths("f", FIRSTS), paths("l", &LASTS[..1]));
        assert_eq!(report.pairs.len(), 1);
        assert_eq!(report.pairs[0].prompt_id, 0);
        assert_eq!(report.unmatched_first, vec![("A".to_string(), 1)]);
    }

    #[test]
    fn test_stray_and_wrong_role_files_are_ignored() {
        let mut firsts = paths("f", FIRSTS);
        firsts.extend(paths("f", &["stray_file.jpg", "A_last_frame_aug_prompt0.jpg", "notes.txt"]));
        let mut lasts = paths("l", LASTS);
        lasts.extend(paths("l", &["stray_file.jpg", "A_first_frame_aug_prompt1.jpg"]));

        let report = join(firsts, lasts);
        assert_eq!(report.pairs.len(), 2);
        assert!(report.unmatched_first.is_empty());
        assert!(report.unmatched_last.is_empty());
    }

    #[test]
    fn test_listing_order_does_not_matter() {
        let forward = join(paths("f", FIRSTS), paths("l", LASTS));
        let mut reversed_firsts = paths("f", FIRSTS);
        reversed_firsts.reverse();
        let mut reversed_lasts = paths("l", LASTS);
        reversed_lasts.reverse();
        assert_eq!(forward, join(reversed_firsts, reversed_lasts));
    }

    #[test]
    fn test_second_last_frame_cannot_reuse_a_first_frame() {
        let lasts = paths(
            "l",
            &["A_last_frame_aug_prompt0.jpg", "A_last_frame_aug_prompt0.png"],
        );
        let report = join(paths("f", &FIRSTS[..1]), lasts);
        assert_eq!(report.pairs.len(), 1);
        assert_eq!(
            report.pairs[0].last_frame,
            PathBuf::from("l/A_last_frame_aug_prompt0.jpg")
        );
        assert_eq!(report.unmatched_last, vec![("A".to_string(), 0)]);
    }

    #[test]
    fn test_surplus_first_frame_is_reported() {
        let firsts = paths(
            "f",
            &["A_first_frame_aug_prompt0.jpg", "A_first_frame_aug_prompt0.png"],
        );
        let report = join(firsts, paths("l", &["A_last_frame_aug_prompt0.jpg"]));
        assert_eq!(report.pairs.len(), 1);
        assert_eq!(
            report.pairs[0].first_frame,
            PathBuf::from("f/A_first_frame_aug_prompt0.jpg")
        );
        assert_eq!(report.unmatched_first, vec![("A".to_string(), 0)]);
        assert!(report.unmatched_last.is_empty());
    }

    #[tokio::test]
    async fn test_match_pairs_reads_directories() {
        let dir = TempDir::new().unwrap();
        let first_dir = dir.path().join("augmented_first_frames");
        let last_dir = dir.path().join("augmented_last_frames");
        std::fs::create_dir_all(&first_dir).unwrap();
        std::fs::create_dir_all(&last_dir).unwrap();
        for name in FIRSTS {
            std::fs::write(first_dir.join(name), b"").unwrap();
        }
        std::fs::write(last_dir.join(LASTS[0]), b"").unwrap();
        std::fs::write(last_dir.join("stray_file.jpg"), b"").unwrap();

        let first_run = match_pairs(&first_dir, &last_dir).await.unwrap();
        let second_run = match_pairs(&first_dir, &last_dir).await.unwrap();

        assert_eq!(first_run, second_run);
        assert_eq!(first_run.pairs.len(), 1);
        assert_eq!(first_run.unmatched_first, vec![("A".to_string(), 1)]);

        let batch = first_run.to_batch_report();
        assert_eq!(batch.succeeded, 1);
        assert_eq!(
            batch.failures,
            vec![UnitFailure::UnmatchedFirst {
                asset_id: "A".into(),
                prompt_id: 1
            }]
        );
    }

    #[tokio::test]
    async fn test_missing_directories_match_nothing() {
        let dir = TempDir::new().unwrap();
        let report = match_pairs(&dir.path().join("a"), &dir.path().join("b"))
            .await
            .unwrap();
        assert_eq!(report, MatchReport::default());
    }
}
