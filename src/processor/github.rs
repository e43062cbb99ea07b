//! GitHub REST payload transformation.

use super::{Batch, Commit, DocumentFormatter, Issue, MergeToRepo, PullRequest, RequestFromRepo, User};
use crate::models::{AuditError, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

const REPO_TYPE: &str = "github";

#[derive(Debug, Deserialize)]
struct GhUser {
    id: i64,
    #[serde(default)]
    login: String,
}

impl From<&GhUser> for User {
    fn from(u: &GhUser) -> Self {
        User {
            id: u.id.to_string(),
            user: u.login.clone(),
        }
    }
}

fn user_or_default(u: Option<&GhUser>) -> User {
    u.map(User::from).unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct GhCommitSignature {
    #[serde(default)]
    name: String,
    date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GhCommitDetail {
    #[serde(default)]
    message: String,
    author: Option<GhCommitSignature>,
    committer: GhCommitSignature,
}

#[derive(Debug, Deserialize)]
struct GhCommit {
    sha: String,
    url: String,
    commit: GhCommitDetail,
    committer: Option<GhUser>,
}

#[derive(Debug, Deserialize)]
struct GhRepo {
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    private: bool,
}

#[derive(Debug, Deserialize)]
struct GhRef {
    #[serde(rename = "ref")]
    branch: String,
    sha: String,
    user: Option<GhUser>,
    repo: Option<GhRepo>,
}

#[derive(Debug, Deserialize)]
struct GhPullRequest {
    number: u64,
    state: String,
    #[serde(default)]
    title: String,
    url: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    merged_at: Option<DateTime<Utc>>,
    merge_commit_sha: Option<String>,
    #[serde(default)]
    requested_reviewers: Vec<GhUser>,
    head: GhRef,
    base: GhRef,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    state: String,
    #[serde(default)]
    title: String,
    url: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    user: Option<GhUser>,
    #[serde(default)]
    assignees: Vec<GhUser>,
    pull_request: Option<serde_json::Value>,
}

fn decode<T: for<'de> Deserialize<'de>>(data: &[u8], kind: &str) -> Result<Vec<T>> {
    serde_json::from_slice(data)
        .map_err(|e| AuditError::ParseError(format!("Invalid {kind} payload: {e}")))
}

/// Transforms GitHub API payloads for one repository.
#[derive(Debug, Clone)]
pub struct GithubProcessor {
    repo_name: String,
    repo_url: String,
    formatter: Arc<DocumentFormatter>,
}

impl GithubProcessor {
    pub fn new(
        repo_name: impl Into<String>,
        repo_url: impl Into<String>,
        formatter: Arc<DocumentFormatter>,
    ) -> Self {
        Self {
            repo_name: repo_name.into(),
            repo_url: repo_url.into(),
            formatter,
        }
    }

    /// Commits listed by `GET /repos/{owner}/{repo}/commits`.
    pub fn process_commits(
        &self,
        data: &[u8],
        tags: &HashMap<String, String>,
    ) -> Result<Batch<Commit>> {
        let raw: Vec<GhCommit> = decode(data, "commit")?;
        let commits = raw
            .into_iter()
            .map(|c| {
                let author = c
                    .commit
                    .author
                    .as_ref()
                    .map(|a| a.name.clone())
                    .unwrap_or_else(|| c.commit.committer.name.clone());
                Commit {
                    document_type: "commit".to_string(),
                    repo_type: REPO_TYPE.to_string(),
                    repo_name: self.repo_name.clone(),
                    repo_url: self.repo_url.clone(),
                    commit_url: c.url,
                    created_at: c.commit.committer.date,
                    message: c.commit.message,
                    committer: User {
                        id: c.committer.map(|u| u.id.to_string()).unwrap_or_default(),
                        user: author,
                    },
                    sha: c.sha,
                }
            })
            .collect();
        Batch::render(commits, &self.formatter, tags)
    }

    /// Pull requests listed by `GET /repos/{owner}/{repo}/pulls`.
    pub fn process_pull_requests(
        &self,
        data: &[u8],
        tags: &HashMap<String, String>,
    ) -> Result<Batch<PullRequest>> {
        let raw: Vec<GhPullRequest> = decode(data, "pull request")?;
        let pulls = raw
            .into_iter()
            .map(|p| {
                let head_repo = p.head.repo.as_ref();
                let base_repo = p.base.repo.as_ref();
                PullRequest {
                    document_type: "pull_request".to_string(),
                    repo_type: REPO_TYPE.to_string(),
                    repo_name: self.repo_name.clone(),
                    repo_url: self.repo_url.clone(),
                    created_at: p.created_at,
                    updated_at: p.updated_at,
                    closed_at: p.closed_at,
                    state: p.state,
                    pull_request_no: p.number.to_string(),
                    number: p.number,
                    title: p.title,
                    url: p.url,
                    merged_at: p.merged_at,
                    merge_commit_sha: p.merge_commit_sha.unwrap_or_default(),
                    reviewers: p.requested_reviewers.iter().map(User::from).collect(),
                    request_from_repo: RequestFromRepo {
                        name: head_repo.map(|r| r.full_name.clone()).unwrap_or_default(),
                        url: head_repo.map(|r| r.url.clone()).unwrap_or_default(),
                        private: head_repo.is_some_and(|r| r.private),
                        sha: p.head.sha.clone(),
                        branch: p.head.branch.clone(),
                        by_user: user_or_default(p.head.user.as_ref()),
                    },
                    merge_to_repo: MergeToRepo {
                        name: base_repo.map(|r| r.full_name.clone()).unwrap_or_default(),
                        url: base_repo.map(|r| r.url.clone()).unwrap_or_default(),
                        private: base_repo.is_some_and(|r| r.private),
                        sha: p.base.sha.clone(),
                        branch: p.base.branch.clone(),
                    },
                }
            })
            .collect();
        Batch::render(pulls, &self.formatter, tags)
    }

    /// Issues listed by `GET /repos/{owner}/{repo}/issues`.
    ///
    /// GitHub lists pull requests as issues too; those are dropped here.
    pub fn process_issues(
        &self,
        data: &[u8],
        tags: &HashMap<String, String>,
    ) -> Result<Batch<Issue>> {
        let raw: Vec<GhIssue> = decode(data, "issue")?;
        let issues = raw
            .into_iter()
            .filter(|i| i.pull_request.is_none())
            .map(|i| Issue {
                document_type: "issue".to_string(),
                repo_type: REPO_TYPE.to_string(),
                repo_name: self.repo_name.clone(),
                repo_url: self.repo_url.clone(),
                issue_no: i.number.to_string(),
                state: i.state,
                title: i.title,
                created_at: i.created_at,
                updated_at: i.updated_at,
                closed_at: i.closed_at,
                url: i.url,
                created_by: user_or_default(i.user.as_ref()),
                assignees: i.assignees.iter().map(User::from).collect(),
            })
            .collect();
        Batch::render(issues, &self.formatter, tags)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::json;

    pub fn commit(sha: &str, date: &str) -> serde_json::Value {
        json!({
            "sha": sha,
            "url": format!("https://api.github.com/repos/acme/widgets/commits/{sha}"),
            "commit": {
                "message": format!("change {sha}"),
                "author": {"name": "Ada", "date": date},
                "committer": {"name": "GitHub", "date": date}
            },
            "committer": {"id": 42, "login": "ada"}
        })
    }

    pub fn pull_request(number: u64) -> serde_json::Value {
        json!({
            "number": number,
            "state": "open",
            "title": format!("PR {number}"),
            "url": format!("https://api.github.com/repos/acme/widgets/pulls/{number}"),
            "created_at": "2024-03-01T10:00:00Z",
            "updated_at": "2024-03-02T10:00:00Z",
            "closed_at": null,
            "merged_at": null,
            "merge_commit_sha": "deadbeef",
            "requested_reviewers": [{"id": 7, "login": "grace"}],
            "head": {
                "ref": "feature",
                "sha": "aaa",
                "user": {"id": 42, "login": "ada"},
                "repo": {"full_name": "ada/widgets", "url": "https://api.github.com/repos/ada/widgets", "private": false}
            },
            "base": {
                "ref": "main",
                "sha": "bbb",
                "user": {"id": 1, "login": "acme"},
                "repo": {"full_name": "acme/widgets", "url": "https://api.github.com/repos/acme/widgets", "private": true}
            }
        })
    }

    pub fn issue(number: u64, created_at: &str, is_pull: bool) -> serde_json::Value {
        let mut value = json!({
            "number": number,
            "state": "open",
            "title": format!("Issue {number}"),
            "url": format!("https://api.github.com/repos/acme/widgets/issues/{number}"),
            "created_at": created_at,
            "updated_at": created_at,
            "closed_at": null,
            "user": {"id": 42, "login": "ada"},
            "assignees": [{"id": 7, "login": "grace"}]
        });
        if is_pull {
            value["pull_request"] = json!({"url": "https://api.github.com/repos/acme/widgets/pulls/1"});
        }
        value
    }
}
