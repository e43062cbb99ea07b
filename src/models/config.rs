//! Configuration models for github-audit.
//!
//! Everything the operator can tune lives here: which repositories to audit,
//! how often, and where the resulting documents are shipped.
//!
//! Loading is three steps: parse TOML, populate defaults (branch list, access
//! token overrides from the environment), then validate. Validation reports
//! every problem it finds rather than stopping at the first one.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Branch audited when a job lists none.
pub const DEFAULT_BRANCH: &str = "master";

/// Cadence used when a polling interval cannot be converted.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Top-level configuration for github-audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log file path; logs go to stderr when unset
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Checkpoint file holding per-task progress markers
    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: PathBuf,

    /// Seconds between checkpoint snapshots
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,

    /// Optional JSON file with document key renames and global keys
    #[serde(default)]
    pub formatter_file: Option<PathBuf>,

    /// Repositories to audit
    #[serde(default)]
    pub audit_jobs: Vec<AuditJob>,

    /// Sinks receiving the audit documents
    #[serde(default)]
    pub targets: Vec<Target>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_checkpoint_file() -> PathBuf {
    PathBuf::from("taskStats.json")
}

fn default_checkpoint_interval() -> u64 {
    30
}

/// One repository to audit on a fixed cadence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditJob {
    /// Job name, also the name of the env var that may override the access token
    #[serde(default)]
    pub name: String,

    /// Polling interval, `<integer>[s|m|h|d]` (e.g. "30s", "10m", "1d")
    #[serde(default)]
    pub polling_interval: String,

    /// Repository host type; only "github" is supported
    #[serde(default)]
    pub repo_type: String,

    /// Repository owner (user or organisation)
    #[serde(default)]
    pub repo_owner: String,

    /// Repository name
    #[serde(default)]
    pub repo_name: String,

    /// API base URL override (GitHub Enterprise, tests)
    #[serde(default)]
    pub api_url: Option<String>,

    /// Extra key/values merged into every document
    #[serde(default)]
    pub tags: HashMap<String, String>,

    /// Free-form metadata, carried but not interpreted
    #[serde(default)]
    pub metadata: Option<toml::Table>,

    /// Targets receiving this job's documents
    #[serde(default)]
    pub output: OutputConfig,

    /// Repository location and credentials
    #[serde(default)]
    pub repo_config: RepoConfig,
}

/// Names of the targets an audit job publishes to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub target_name: Vec<String>,
}

/// Repository location, credentials and monitored branches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(default)]
    pub repo_url: String,

    #[serde(default)]
    pub credentials: Credentials,

    #[serde(default)]
    pub branches: Vec<String>,
}

/// Repository credentials. Either username or email is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub email: String,

    /// Base64-encoded personal access token
    #[serde(default)]
    pub access_token: String,
}

impl Credentials {
    /// Identity used in log lines and credential errors.
    pub fn principal(&self) -> &str {
        if self.username.is_empty() {
            &self.email
        } else {
            &self.username
        }
    }
}

/// A sink receiving audit documents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub name: String,

    /// Sink type: "elasticsearch" or "kafka-rest"
    #[serde(rename = "type", default)]
    pub target_type: String,

    /// Sink specific settings; values may contain ${ENV_VAR}
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl Target {
    /// Settings with environment placeholders expanded.
    pub fn expanded_config(&self) -> HashMap<String, String> {
        expand_values(&self.config)
    }
}

impl AuditJob {
    /// Scheduling cadence, falling back to five minutes when unparsable.
    pub fn cadence(&self) -> Duration {
        parse_polling_interval(&self.polling_interval).unwrap_or(DEFAULT_POLLING_INTERVAL)
    }

    /// Task identity: `{name}${owner}${repo}`.
    pub fn task_id(&self) -> String {
        format!("{}${}${}", self.name, self.repo_owner, self.repo_name)
    }
}

impl Config {
    /// Load, default and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.populate_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration file without defaulting or validating it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Fill optional fields, reading token overrides from the process environment.
    pub fn populate_defaults(&mut self) {
        self.populate_defaults_with(|name| std::env::var(name).ok());
    }

    /// Fill optional fields using `lookup` to resolve token overrides.
    ///
    /// The override variable is named after the audit job.
    pub fn populate_defaults_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for job in &mut self.audit_jobs {
            if job.repo_config.branches.is_empty() {
                job.repo_config.branches.push(DEFAULT_BRANCH.to_string());
            }
            if job.name.is_empty() {
                continue;
            }
            if let Some(token) = lookup(&job.name).filter(|t| !t.is_empty()) {
                job.repo_config.credentials.access_token = token;
            }
        }
    }

    /// Check mandatory fields across all jobs and targets.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();

        if self.audit_jobs.is_empty() {
            issues.push(ValidationIssue::MissingAuditJob);
        }
        if self.targets.is_empty() {
            issues.push(ValidationIssue::MissingTarget);
        }
        if parse_log_level(&self.log_level).is_none() {
            issues.push(ValidationIssue::LogLevel(self.log_level.clone()));
        }

        for (index, job) in self.audit_jobs.iter().enumerate() {
            if job.name.is_empty() {
                issues.push(ValidationIssue::MissingJobName { index });
            }
            let job_name = if job.name.is_empty() {
                format!("#{index}")
            } else {
                job.name.clone()
            };
            let creds = &job.repo_config.credentials;

            if creds.access_token.is_empty() {
                issues.push(ValidationIssue::MissingAccessToken(job_name.clone()));
            }
            if creds.username.is_empty() && creds.email.is_empty() {
                issues.push(ValidationIssue::MissingUsernameEmail(job_name.clone()));
            }
            if job.repo_owner.is_empty() {
                issues.push(ValidationIssue::MissingRepoOwner(job_name.clone()));
            }
            if job.repo_name.is_empty() {
                issues.push(ValidationIssue::MissingRepoName(job_name.clone()));
            }
            if job.repo_config.repo_url.is_empty() {
                issues.push(ValidationIssue::MissingRepoUrl(job_name.clone()));
            }
            if job.repo_type.is_empty() {
                issues.push(ValidationIssue::MissingRepoType(job_name.clone()));
            }
            if job.output.target_name.is_empty() {
                issues.push(ValidationIssue::MissingTargetNameList(job_name.clone()));
            }
            for target in &job.output.target_name {
                if !self.targets.iter().any(|t| &t.name == target) {
                    issues.push(ValidationIssue::UnknownTarget {
                        job: job_name.clone(),
                        target: target.clone(),
                    });
                }
            }
            if job.polling_interval.is_empty() {
                issues.push(ValidationIssue::MissingPollingInterval(job_name));
            } else if parse_polling_interval(&job.polling_interval).is_none() {
                issues.push(ValidationIssue::PollingIntervalFormat {
                    job: job_name,
                    value: job.polling_interval.clone(),
                });
            }
        }

        for (index, target) in self.targets.iter().enumerate() {
            if target.name.is_empty() {
                issues.push(ValidationIssue::MissingTargetName { index });
            }
            if target.target_type.is_empty() {
                issues.push(ValidationIssue::MissingTargetType(target.name.clone()));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues))
        }
    }

    /// Targets an audit job publishes to, in configuration order.
    pub fn targets_for(&self, job: &AuditJob) -> Vec<Target> {
        self.targets
            .iter()
            .filter(|t| job.output.target_name.contains(&t.name))
            .cloned()
            .collect()
    }

    /// Configured log level.
    pub fn tracing_level(&self) -> Option<tracing::Level> {
        parse_log_level(&self.log_level)
    }
}

/// Parse a log level name.
pub fn parse_log_level(s: &str) -> Option<tracing::Level> {
    match s.to_ascii_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}

/// Convert a polling interval of the form `<integer>[s|m|h|d]`.
///
/// Returns `None` for malformed or zero intervals.
pub fn parse_polling_interval(s: &str) -> Option<Duration> {
    static INTERVAL: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"^(\d+)([smhd])$").expect("interval regex is valid"));

    let caps = INTERVAL.captures(s.trim())?;
    let amount: u64 = caps[1].parse().ok()?;
    if amount == 0 {
        return None;
    }
    let unit = match &caps[2] {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => 24 * 60 * 60,
    };
    amount.checked_mul(unit).map(Duration::from_secs)
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    static PLACEHOLDER: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("placeholder regex is valid"));

    let mut result = s.to_string();
    for cap in PLACEHOLDER.captures_iter(s) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }
    result
}

/// Expand environment variables in all values of a map.
pub fn expand_values(values: &HashMap<String, String>) -> HashMap<String, String> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationIssue {
    #[error("no audit job defined")]
    MissingAuditJob,

    #[error("no target defined")]
    MissingTarget,

    #[error("unknown log level '{0}'")]
    LogLevel(String),

    #[error("audit job #{index}: missing name")]
    MissingJobName { index: usize },

    #[error("audit job '{0}': missing access token")]
    MissingAccessToken(String),

    #[error("audit job '{0}': missing username or email")]
    MissingUsernameEmail(String),

    #[error("audit job '{0}': missing repository owner")]
    MissingRepoOwner(String),

    #[error("audit job '{0}': missing repository name")]
    MissingRepoName(String),

    #[error("audit job '{0}': missing repository URL")]
    MissingRepoUrl(String),

    #[error("audit job '{0}': missing repository type")]
    MissingRepoType(String),

    #[error("audit job '{0}': missing target name in output")]
    MissingTargetNameList(String),

    #[error("audit job '{job}': target '{target}' is not defined")]
    UnknownTarget { job: String, target: String },

    #[error("audit job '{0}': missing polling interval")]
    MissingPollingInterval(String),

    #[error("audit job '{job}': polling interval '{value}' is not of the form <n>[s|m|h|d]")]
    PollingIntervalFormat { job: String, value: String },

    #[error("target #{index}: missing name")]
    MissingTargetName { index: usize },

    #[error("target '{0}': missing type")]
    MissingTargetType(String),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {}", join_issues(.0))]
    Invalid(Vec<ValidationIssue>),
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Example configuration printed by `github-audit example`.
pub const EXAMPLE_CONFIG: &str = r#"# github-audit configuration file

log_level = "info"
# log_path = "github-audit.log"
checkpoint_file = "taskStats.json"
checkpoint_interval_secs = 30
# formatter_file = "formatter.json"

[[audit_jobs]]
name = "job1"
polling_interval = "10m"
repo_type = "github"
repo_owner = "acme"
repo_name = "widgets"
tags = { team = "platform", env = "prod" }

[audit_jobs.output]
target_name = ["es", "kafka"]

[audit_jobs.repo_config]
repo_url = "https://github.com/acme/widgets"
branches = ["main", "dev"]

[audit_jobs.repo_config.credentials]
username = "audit-bot"
# base64 encoded; the env var named after the job ("job1") overrides it
access_token = "Z2hwX2V4YW1wbGU="

[[targets]]
name = "es"
type = "elasticsearch"

[targets.config]
protocol = "http"
host = "localhost"
port = "9200"
index = "github"
path = "audit"
username = "elastic"
password = "${ES_PASSWORD}"
old_es = "false"

[[targets]]
name = "kafka"
type = "kafka-rest"

[targets.config]
protocol = "http"
host = "localhost"
port = "8082"
topic = "github-audit"
"#;
