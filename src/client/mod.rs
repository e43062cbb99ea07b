//! Source provider clients.
//!
//! - `SourceConnector` / `SourceProvider`: the seam the sync pipeline consumes
//! - `GithubClient`: GitHub REST implementation with pagination and retries
//! - `RateLimiter`: shared `x-ratelimit-*` tracking

mod connector;
mod github;
mod rate_limiter;

pub use connector::*;
pub use github::*;
pub use rate_limiter::*;
