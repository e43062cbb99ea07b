//! Output documents shipped to sinks.
//!
//! Each kind exposes its ordering key through [`Marker`] so checkpoint
//! advancement never needs to inspect untyped JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordering key of a document, used to advance checkpoint markers.
pub trait Marker {
    type Key: Ord + Copy + std::fmt::Debug;

    fn marker(&self) -> Self::Key;
}

/// A git hosting user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub user: String,
}

/// A commit on an audited branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub document_type: String,
    pub repo_type: String,
    pub repo_name: String,
    pub repo_url: String,
    pub commit_url: String,
    pub created_at: DateTime<Utc>,
    pub message: String,
    pub committer: User,
    pub sha: String,
}

impl Marker for Commit {
    type Key = DateTime<Utc>;

    fn marker(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Head side of a pull request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestFromRepo {
    pub name: String,
    pub url: String,
    pub private: bool,
    pub sha: String,
    pub branch: String,
    pub by_user: User,
}

/// Base side of a pull request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeToRepo {
    pub name: String,
    pub url: String,
    pub private: bool,
    pub sha: String,
    pub branch: String,
}

/// A pull request in any state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub document_type: String,
    pub repo_type: String,
    pub repo_name: String,
    pub repo_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub state: String,
    pub pull_request_no: String,
    #[serde(skip)]
    pub number: u64,
    pub title: String,
    pub url: String,
    pub merged_at: Option<DateTime<Utc>>,
    pub merge_commit_sha: String,
    pub reviewers: Vec<User>,
    pub request_from_repo: RequestFromRepo,
    pub merge_to_repo: MergeToRepo,
}

impl Marker for PullRequest {
    type Key = u64;

    fn marker(&self) -> u64 {
        self.number
    }
}

/// An issue that is not a pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub document_type: String,
    pub repo_type: String,
    pub repo_name: String,
    pub repo_url: String,
    pub issue_no: String,
    pub state: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub url: String,
    pub created_by: User,
    pub assignees: Vec<User>,
}

impl Marker for Issue {
    type Key = DateTime<Utc>;

    fn marker(&self) -> DateTime<Utc> {
        self.created_at
    }
}
