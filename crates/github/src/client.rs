//! [`GithubClient`]: the reqwest-backed [`RepositorySource`].

use std::time::Duration;

use async_trait::async_trait;
use pipeline::{OrganizationName, RemoteError, RepositoryId, RepositoryRef, RepositorySource};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, LINK};
use reqwest::Response;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use tracing::debug;

/// Public GitHub REST endpoint.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

const API_VERSION: &str = "2022-11-28";
const PAGE_SIZE: u32 = 100;
const MAX_ERROR_BODY: usize = 512;

/// Connection settings for [`GithubClient`].
#[derive(Debug, Clone)]
pub struct GithubConfig {
    /// Base URL of the REST API, without a trailing slash.
    pub api_url: String,
    /// Personal access or installation token. Anonymous access when `None`.
    pub token: Option<String>,
    /// Sent on every request; GitHub rejects requests without one.
    pub user_agent: String,
    /// Upper bound on a single HTTP exchange, body included.
    pub request_timeout: Duration,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
            user_agent: concat!("issue-tally/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Failure to construct a [`GithubClient`].
#[derive(Debug, thiserror::Error)]
pub enum GithubClientError {
    /// The token contains bytes not allowed in an HTTP header.
    #[error("GitHub token is not a valid header value")]
    InvalidToken(#[from] reqwest::header::InvalidHeaderValue),

    /// The TLS backend or connection pool could not be set up.
    #[error("Failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct RepositoryItem {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct IssueItem {
    pull_request: Option<IgnoredAny>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
}

/// GitHub REST client implementing [`RepositorySource`].
///
/// Cheap to clone; the underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    request_timeout: Duration,
}

impl GithubClient {
    /// Builds the client with GitHub's versioned JSON headers, adding bearer
    /// authentication when a token is configured.
    ///
    /// Fails if the token cannot be sent as a header value.
    pub fn new(config: GithubConfig) -> Result<Self, GithubClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            HeaderName::from_static("x-github-api-version"),
            HeaderValue::from_static(API_VERSION),
        );
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
        })
    }

    /// The base URL requests are sent to, without a trailing slash.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Fetches every page starting at `url`, handing each page to `on_page`.
    async fn for_each_page<T, F>(
        &self,
        mut url: String,
        resource: &str,
        mut on_page: F,
    ) -> Result<(), RemoteError>
    where
        T: DeserializeOwned,
        F: FnMut(Vec<T>),
    {
        let mut page = 1u32;
        loop {
            debug!(resource, page, "Fetching page");
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| self.transport_error(e))?;

            if !response.status().is_success() {
                return Err(classify(response, resource).await);
            }

            let next = next_page_url(response.headers());
            let items = response
                .json::<Vec<T>>()
                .await
                .map_err(|e| self.transport_error(e))?;
            on_page(items);

            match next {
                Some(next) => {
                    url = next;
                    page += 1;
                }
                None => return Ok(()),
            }
        }
    }

    fn transport_error(&self, error: reqwest::Error) -> RemoteError {
        if error.is_timeout() {
            RemoteError::Timeout {
                after: self.request_timeout,
            }
        } else if error.is_decode() {
            RemoteError::UnexpectedStatus {
                status: 200,
                body: format!("Undecodable response body: {error}"),
            }
        } else {
            RemoteError::Transport {
                message: error.to_string(),
            }
        }
    }
}

#[async_trait]
impl RepositorySource for GithubClient {
    async fn list_repositories(
        &self,
        organization: &OrganizationName,
    ) -> Result<Vec<RepositoryRef>, RemoteError> {
        let url = format!(
            "{}/orgs/{}/repos?per_page={PAGE_SIZE}&type=all",
            self.api_url, organization
        );
        let resource = format!("organization {organization}");

        let mut repositories = Vec::new();
        self.for_each_page::<RepositoryItem, _>(url, &resource, |items| {
            repositories.extend(
                items
                    .into_iter()
                    .map(|item| RepositoryRef::new(RepositoryId::new(item.id), item.name)),
            );
        })
        .await?;

        debug!(
            organization = %organization,
            count = repositories.len(),
            "Listed repositories"
        );
        Ok(repositories)
    }

    async fn open_issue_count(&self, repository: RepositoryId) -> Result<u64, RemoteError> {
        let url = format!(
            "{}/repositories/{}/issues?state=open&per_page={PAGE_SIZE}",
            self.api_url, repository
        );
        let resource = format!("repository {repository}");

        let mut open_issues = 0u64;
        self.for_each_page::<IssueItem, _>(url, &resource, |items| {
            open_issues += items
                .iter()
                .filter(|item| item.pull_request.is_none())
                .count() as u64;
        })
        .await?;

        Ok(open_issues)
    }
}

/// Maps a non-success response onto the domain error vocabulary.
async fn classify(response: Response, resource: &str) -> RemoteError {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();

    match status {
        404 => RemoteError::NotFound {
            resource: resource.to_string(),
        },
        401 => RemoteError::Auth {
            message: api_message(&body),
        },
        403 | 429 if is_rate_limited(&headers) || status == 429 => RemoteError::RateLimited {
            retry_after: retry_after(&headers),
        },
        403 => RemoteError::Auth {
            message: api_message(&body),
        },
        _ => RemoteError::UnexpectedStatus {
            status,
            body: truncate(body),
        },
    }
}

fn is_rate_limited(headers: &HeaderMap) -> bool {
    headers.contains_key("retry-after")
        || header_str(headers, "x-ratelimit-remaining").is_some_and(|v| v.trim() == "0")
}

/// `retry-after` wins; otherwise the primary limit's reset instant.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(seconds) = header_str(headers, "retry-after").and_then(|v| v.trim().parse().ok()) {
        return Some(Duration::from_secs(seconds));
    }

    let reset: i64 = header_str(headers, "x-ratelimit-reset")?.trim().parse().ok()?;
    let wait = reset.saturating_sub(chrono::Utc::now().timestamp());
    Some(Duration::from_secs(wait.max(0) as u64))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

fn api_message(body: &str) -> String {
    serde_json::from_str::<ApiMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| truncate(body.to_string()))
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

/// Extracts the `rel="next"` target from a `Link` header.
fn next_page_url(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|entry| {
        let mut sections = entry.split(';');
        let url = sections
            .next()?
            .trim()
            .strip_prefix('<')?
            .strip_suffix('>')?;
        sections
            .any(|param| param.trim() == r#"rel="next""#)
            .then(|| url.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;

    fn client_for(server: &ServerGuard) -> GithubClient {
        GithubClient::new(GithubConfig {
            api_url: server.url(),
            token: Some("secret".to_string()),
            ..GithubConfig::default()
        })
        .expect("client should build")
    }

    fn org(name: &str) -> OrganizationName {
        OrganizationName::new(name).expect("valid organization")
    }

    #[test]
    fn test_next_page_url_picks_next_relation() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                r#"<https://api.github.com/x?page=2>; rel="next", <https://api.github.com/x?page=5>; rel="last""#,
            ),
        );

        assert_eq!(
            next_page_url(&headers).as_deref(),
            Some("https://api.github.com/x?page=2")
        );
    }

    #[test]
    fn test_next_page_url_absent_on_last_page() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(r#"<https://api.github.com/x?page=1>; rel="first""#),
        );

        assert_eq!(next_page_url(&headers), None);
        assert_eq!(next_page_url(&HeaderMap::new()), None);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let body = "é".repeat(MAX_ERROR_BODY);
        let cut = truncate(body);
        assert!(cut.len() <= MAX_ERROR_BODY);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_invalid_token_is_rejected() {
        let result = GithubClient::new(GithubConfig {
            token: Some("bad\ntoken".to_string()),
            ..GithubConfig::default()
        });

        assert!(matches!(result, Err(GithubClientError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_list_repositories_follows_pagination() {
        let mut server = Server::new_async().await;
        let next = format!("{}/organizations/42/repos?per_page=100&type=all&page=2", server.url());

        let first = server
            .mock("GET", "/orgs/acme/repos")
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer secret")
            .match_header("accept", "application/vnd.github+json")
            .with_status(200)
            .with_header("link", &format!(r#"<{next}>; rel="next""#))
            .with_body(json!([{ "id": 1, "name": "api" }, { "id": 2, "name": "web" }]).to_string())
            .create_async()
            .await;
        let second = server
            .mock("GET", "/organizations/42/repos")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!([{ "id": 3, "name": "docs", "private": true }]).to_string())
            .create_async()
            .await;

        let repositories = client_for(&server)
            .list_repositories(&org("acme"))
            .await
            .expect("listing should succeed");

        first.assert_async().await;
        second.assert_async().await;
        let names: Vec<_> = repositories.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["api", "web", "docs"]);
        assert_eq!(repositories[2].id, RepositoryId::new(3));
    }

    #[tokio::test]
    async fn test_list_repositories_unknown_org_is_not_found() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/orgs/ghost/repos")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"message":"Not Found"}"#)
            .create_async()
            .await;

        let error = client_for(&server)
            .list_repositories(&org("ghost"))
            .await
            .expect_err("listing should fail");

        assert!(matches!(error, RemoteError::NotFound { .. }));
        assert!(!error.retry_policy().is_retryable());
    }

    #[tokio::test]
    async fn test_bad_credentials_map_to_auth() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/orgs/acme/repos")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"message":"Bad credentials"}"#)
            .create_async()
            .await;

        let error = client_for(&server)
            .list_repositories(&org("acme"))
            .await
            .expect_err("listing should fail");

        match error {
            RemoteError::Auth { message } => assert_eq!(message, "Bad credentials"),
            other => panic!("expected Auth, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exhausted_rate_limit_is_retryable() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/repositories/7/issues")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_header("x-ratelimit-remaining", "0")
            .with_header("retry-after", "60")
            .with_body(r#"{"message":"API rate limit exceeded"}"#)
            .create_async()
            .await;

        let error = client_for(&server)
            .open_issue_count(RepositoryId::new(7))
            .await
            .expect_err("count should fail");

        assert!(matches!(
            error,
            RemoteError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(60)
        ));
        assert!(error.retry_policy().is_retryable());
    }

    #[tokio::test]
    async fn test_forbidden_without_rate_limit_is_auth() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/repositories/7/issues")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_header("x-ratelimit-remaining", "4999")
            .with_body(r#"{"message":"Resource not accessible by integration"}"#)
            .create_async()
            .await;

        let error = client_for(&server)
            .open_issue_count(RepositoryId::new(7))
            .await
            .expect_err("count should fail");

        assert!(matches!(error, RemoteError::Auth { .. }));
    }

    #[tokio::test]
    async fn test_open_issue_count_excludes_pull_requests_across_pages() {
        let mut server = Server::new_async().await;
        let next = format!(
            "{}/repositories/9/issues?state=open&per_page=100&page=2",
            server.url()
        );

        server
            .mock("GET", "/repositories/9/issues")
            .match_query(Matcher::Regex("^state=open&per_page=100$".to_string()))
            .with_status(200)
            .with_header("link", &format!(r#"<{next}>; rel="next""#))
            .with_body(
                json!([
                    { "number": 1 },
                    { "number": 2, "pull_request": { "url": "https://example.test/pr/2" } },
                    { "number": 3 }
                ])
                .to_string(),
            )
            .create_async()
            .await;
        server
            .mock("GET", "/repositories/9/issues")
            .match_query(Matcher::Regex("page=2".to_string()))
            .with_status(200)
            .with_body(json!([{ "number": 4 }]).to_string())
            .create_async()
            .await;

        let count = client_for(&server)
            .open_issue_count(RepositoryId::new(9))
            .await
            .expect("count should succeed");

        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_server_error_is_unexpected_status_and_retryable() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/repositories/5/issues")
            .match_query(Matcher::Any)
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let error = client_for(&server)
            .open_issue_count(RepositoryId::new(5))
            .await
            .expect_err("count should fail");

        match &error {
            RemoteError::UnexpectedStatus { status, body } => {
                assert_eq!(*status, 502);
                assert_eq!(body, "bad gateway");
            }
            other => panic!("expected UnexpectedStatus, got {other:?}"),
        }
        assert!(error.retry_policy().is_retryable());
    }

    #[tokio::test]
    async fn test_empty_repository_counts_zero() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/repositories/1/issues")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let count = client_for(&server)
            .open_issue_count(RepositoryId::new(1))
            .await
            .expect("count should succeed");

        assert_eq!(count, 0);
    }
}
