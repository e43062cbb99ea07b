//! Per-task progress markers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Progress of one task, keyed in the store by task ID.
///
/// Markers only move forward: every `advance_*` keeps the larger of the
/// stored and the offered value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Completion time of the last full pass
    #[serde(default)]
    pub last_run_time: Option<DateTime<Utc>>,

    /// Highest pull request number published
    #[serde(default)]
    pub last_pr_number: u64,

    /// Newest commit time published, per branch
    #[serde(default)]
    pub last_commit_time: BTreeMap<String, DateTime<Utc>>,

    /// Newest issue creation time published
    #[serde(default)]
    pub last_issue_time: DateTime<Utc>,
}

impl CheckpointRecord {
    /// First-run record: every time marker starts at `floor`, PR marker at 0.
    pub fn initial(floor: DateTime<Utc>, branches: &[String]) -> Self {
        Self {
            last_run_time: None,
            last_pr_number: 0,
            last_commit_time: branches.iter().map(|b| (b.clone(), floor)).collect(),
            last_issue_time: floor,
        }
    }

    /// Add markers for branches configured after the record was created.
    ///
    /// Returns true if any branch was added.
    pub fn ensure_branches(&mut self, branches: &[String], floor: DateTime<Utc>) -> bool {
        let mut added = false;
        for branch in branches {
            if !self.last_commit_time.contains_key(branch) {
                self.last_commit_time.insert(branch.clone(), floor);
                added = true;
            }
        }
        added
    }

    /// Commit marker for a branch, if known.
    pub fn commit_marker(&self, branch: &str) -> Option<DateTime<Utc>> {
        self.last_commit_time.get(branch).copied()
    }

    pub fn advance_commit(&mut self, branch: &str, at: DateTime<Utc>) {
        let marker = self
            .last_commit_time
            .entry(branch.to_string())
            .or_insert(at);
        if at > *marker {
            *marker = at;
        }
    }

    pub fn advance_pull_request(&mut self, number: u64) {
        self.last_pr_number = self.last_pr_number.max(number);
    }

    pub fn advance_issue(&mut self, at: DateTime<Utc>) {
        self.last_issue_time = self.last_issue_time.max(at);
    }
}
