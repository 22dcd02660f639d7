//! issue-tally GitHub infrastructure adapter.
//!
//! Implements [`pipeline::RepositorySource`] against the GitHub REST API using
//! [`reqwest`].
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain domain rules.
//! All GitHub API details (authentication, pagination, rate-limit headers,
//! status-code mapping) are handled here; the orchestrator never sees them.
//!
//! ## Endpoints
//!
//! | Capability | Endpoint |
//! |------------|----------|
//! | list repositories | `GET /orgs/{org}/repos?per_page=100&type=all` |
//! | open-issue count | `GET /repositories/{id}/issues?state=open&per_page=100` |
//!
//! Both follow `Link: <…>; rel="next"` until the last page. The issues endpoint
//! also returns pull requests; those are not counted.

mod client;

pub use client::{GithubClient, GithubClientError, GithubConfig, DEFAULT_API_URL};
