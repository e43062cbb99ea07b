//! Core data models for github-audit.
//!
//! - `Config`: audit jobs, targets and process settings (TOML)
//! - `AuditError` / `ConfigError`: error taxonomy

mod config;
mod error;

pub use config::*;
pub use error::*;
