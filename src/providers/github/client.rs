use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ETAG, IF_NONE_MATCH, LINK, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::auth::{Authenticator, Credentials};
use crate::error::{ExporterError, Result};

use super::cache::{CachedResponse, ResponseCache};
use super::pagination::{paginate, BackoffPolicy, Page, Paginated, PER_PAGE};
use super::types::{
    RepositoriesResponse, Repository, RepositoryName, Runner, RunnersResponse, Workflow, WorkflowRun,
    WorkflowRunUsage, WorkflowRunsResponse, WorkflowUsage, WorkflowsResponse,
};

const PUBLIC_API_URL: &str = "https://api.github.com/";
const API_VERSION: &str = "2022-11-28";

/// Wait applied to a 403/429 response that carries no rate-limit headers.
const DEFAULT_RATE_LIMIT_WAIT_SECONDS: i64 = 60;

/// GitHub REST API client for Actions data.
pub struct GitHubClient {
    /// HTTP client
    http: reqwest::Client,
    /// Base URL for GitHub API, always ending with '/'
    api_url: Url,
    /// Bearer token source
    auth: Authenticator,
    /// Conditional-request cache
    cache: ResponseCache,
}

/// Normalizes the configured API URL.
///
/// An empty value or `api.github.com` selects the public API; anything else
/// is treated as a GitHub Enterprise API base such as
/// `https://github.example.com/api/v3`.
pub fn api_base_url(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "api.github.com" {
        return Url::parse(PUBLIC_API_URL)
            .map_err(|e| ExporterError::Config(format!("Invalid base URL: {e}")));
    }

    let mut url = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    if !url.ends_with('/') {
        url.push('/');
    }

    Url::parse(&url).map_err(|e| ExporterError::Config(format!("Invalid base URL '{raw}': {e}")))
}

impl GitHubClient {
    /// Create a new GitHub API client.
    ///
    /// # Arguments
    ///
    /// * `api_url` - GitHub API base URL (see [`api_base_url`])
    /// * `credentials` - How requests are authenticated
    /// * `cache_size_bytes` - Capacity of the response cache, 0 disables it
    /// * `timeout` - Per-request timeout
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the URL is invalid or the HTTP client
    /// cannot be built.
    pub fn new(
        api_url: &str,
        credentials: Credentials,
        cache_size_bytes: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("x-github-api-version", HeaderValue::from_static(API_VERSION));

        let http = reqwest::Client::builder()
            .user_agent(concat!("github-actions-exporter/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| ExporterError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_url: api_base_url(api_url)?,
            auth: Authenticator::new(credentials),
            cache: ResponseCache::new(cache_size_bytes),
        })
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    fn endpoint(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self
            .api_url
            .join(path)
            .map_err(|e| ExporterError::Config(format!("Invalid API URL for {path}: {e}")))?;

        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }

        Ok(url)
    }

    fn page_query(page: u32) -> Vec<(&'static str, String)> {
        vec![("per_page", PER_PAGE.to_string()), ("page", page.to_string())]
    }

    /// Performs an authenticated GET and decodes the body.
    ///
    /// Returns the decoded body and the next page advertised by the `Link`
    /// header. Responses carrying an `ETag` are cached; a `304 Not Modified`
    /// replays the cached body.
    async fn get_json<R: DeserializeOwned>(&self, url: Url) -> Result<(R, Option<u32>)> {
        let key = url.as_str().to_string();
        let cached = self.cache.get(&key);

        let mut request = self.http.get(url);
        if let Some(token) = self.auth.bearer(&self.http, &self.api_url).await? {
            request = request.bearer_auth(token.as_str());
        }
        if let Some(cached) = &cached {
            request = request.header(IF_NONE_MATCH, cached.etag.as_str());
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            if let Some(cached) = cached {
                debug!("Not modified: {key}");
                return Ok((serde_json::from_str(&cached.body)?, cached.next_page));
            }
        }

        if let Some(reset) = rate_limit_reset(&response, Utc::now()) {
            return Err(ExporterError::RateLimited { reset });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(ExporterError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let next_page = response
            .headers()
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(next_page_from_link);
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);

        let body = response.text().await?;
        let decoded = serde_json::from_str(&body)?;

        if let Some(etag) = etag {
            self.cache.insert(
                &key,
                CachedResponse {
                    etag,
                    body,
                    next_page,
                },
            );
            debug!(
                "Response cache holds {} entries, {} bytes",
                self.cache.len(),
                self.cache.size_bytes()
            );
        }

        Ok((decoded, next_page))
    }

    /// Fetch one page of repositories of an organization.
    pub async fn list_org_repositories(&self, org: &str, page: u32) -> Result<Page<Repository>> {
        let url = self.endpoint(&format!("orgs/{org}/repos"), &Self::page_query(page))?;
        let (response, next) = self.get_json::<RepositoriesResponse>(url).await?;
        Ok(Page {
            items: response.0,
            next,
        })
    }

    /// Fetch one page of workflow definitions of a repository.
    pub async fn list_workflows(&self, repo: &RepositoryName, page: u32) -> Result<Page<Workflow>> {
        let url = self.endpoint(
            &format!("repos/{repo}/actions/workflows"),
            &Self::page_query(page),
        )?;
        let (response, next) = self.get_json::<WorkflowsResponse>(url).await?;
        Ok(Page {
            items: response.workflows,
            next,
        })
    }

    /// Fetch one page of workflow runs created at or after `created_since`.
    pub async fn list_workflow_runs(
        &self,
        repo: &RepositoryName,
        created_since: DateTime<Utc>,
        page: u32,
    ) -> Result<Page<WorkflowRun>> {
        let mut query = Self::page_query(page);
        query.push((
            "created",
            format!(">={}", created_since.format("%Y-%m-%dT%H:%M:%SZ")),
        ));

        let url = self.endpoint(&format!("repos/{repo}/actions/runs"), &query)?;
        let (response, next) = self.get_json::<WorkflowRunsResponse>(url).await?;
        Ok(Page {
            items: response.workflow_runs,
            next,
        })
    }

    /// Fetch one page of self-hosted runners of a repository.
    pub async fn list_repository_runners(
        &self,
        repo: &RepositoryName,
        page: u32,
    ) -> Result<Page<Runner>> {
        let url = self.endpoint(
            &format!("repos/{repo}/actions/runners"),
            &Self::page_query(page),
        )?;
        let (response, next) = self.get_json::<RunnersResponse>(url).await?;
        Ok(Page {
            items: response.runners,
            next,
        })
    }

    /// Fetch one page of self-hosted runners of an organization.
    pub async fn list_organization_runners(&self, org: &str, page: u32) -> Result<Page<Runner>> {
        let url = self.endpoint(&format!("orgs/{org}/actions/runners"), &Self::page_query(page))?;
        let (response, next) = self.get_json::<RunnersResponse>(url).await?;
        Ok(Page {
            items: response.runners,
            next,
        })
    }

    /// Fetch the timing of a single workflow run.
    pub async fn get_workflow_run_usage(
        &self,
        repo: &RepositoryName,
        run_id: u64,
    ) -> Result<WorkflowRunUsage> {
        let url = self.endpoint(&format!("repos/{repo}/actions/runs/{run_id}/timing"), &[])?;
        let (usage, _) = self.get_json::<WorkflowRunUsage>(url).await?;
        Ok(usage)
    }

    /// Fetch the billable usage of a workflow definition.
    pub async fn get_workflow_usage(
        &self,
        repo: &RepositoryName,
        workflow_id: u64,
    ) -> Result<WorkflowUsage> {
        let url = self.endpoint(
            &format!("repos/{repo}/actions/workflows/{workflow_id}/timing"),
            &[],
        )?;
        let (usage, _) = self.get_json::<WorkflowUsage>(url).await?;
        Ok(usage)
    }

    /// All repositories of an organization.
    pub async fn org_repositories(&self, org: &str) -> Paginated<Repository> {
        paginate(
            &format!("ListByOrg {org}"),
            &BackoffPolicy::pages(),
            |page| self.list_org_repositories(org, page),
        )
        .await
    }

    /// All workflow definitions of a repository.
    pub async fn workflows(&self, repo: &RepositoryName) -> Paginated<Workflow> {
        paginate(
            &format!("ListWorkflows {repo}"),
            &BackoffPolicy::pages(),
            |page| self.list_workflows(repo, page),
        )
        .await
    }

    /// All workflow runs of a repository created at or after `created_since`.
    pub async fn workflow_runs(
        &self,
        repo: &RepositoryName,
        created_since: DateTime<Utc>,
    ) -> Paginated<WorkflowRun> {
        paginate(
            &format!("ListRepositoryWorkflowRuns {repo}"),
            &BackoffPolicy::pages(),
            |page| self.list_workflow_runs(repo, created_since, page),
        )
        .await
    }

    /// All self-hosted runners of a repository.
    pub async fn repository_runners(&self, repo: &RepositoryName) -> Paginated<Runner> {
        paginate(
            &format!("ListRunners {repo}"),
            &BackoffPolicy::pages(),
            |page| self.list_repository_runners(repo, page),
        )
        .await
    }

    /// All self-hosted runners of an organization.
    pub async fn organization_runners(&self, org: &str) -> Paginated<Runner> {
        paginate(
            &format!("ListOrganizationRunners {org}"),
            &BackoffPolicy::pages(),
            |page| self.list_organization_runners(org, page),
        )
        .await
    }
}

/// Extracts the page number of the `rel="next"` entry of a `Link` header.
pub(super) fn next_page_from_link(link: &str) -> Option<u32> {
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.split(';').any(|p| p.trim() == "rel=\"next\"") {
            return None;
        }

        let target = target.trim().trim_start_matches('<').trim_end_matches('>');
        let url = Url::parse(target).ok()?;
        url.query_pairs()
            .find(|(key, _)| key == "page")
            .and_then(|(_, value)| value.parse().ok())
    })
}

/// Returns the reset instant if the response signals an exhausted rate limit.
fn rate_limit_reset(response: &Response, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let status = response.status();
    if status != StatusCode::FORBIDDEN && status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }

    let headers = response.headers();
    let header_i64 = |name: &str| -> Option<i64> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    };

    if let Some(seconds) = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
    {
        return Some(wait_until(now, seconds));
    }

    if header_i64("x-ratelimit-remaining") == Some(0) {
        let reset = header_i64("x-ratelimit-reset")
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(|| wait_until(now, DEFAULT_RATE_LIMIT_WAIT_SECONDS));
        return Some(reset);
    }

    (status == StatusCode::TOO_MANY_REQUESTS)
        .then(|| wait_until(now, DEFAULT_RATE_LIMIT_WAIT_SECONDS))
}

/// `now` plus `seconds`, falling back to the default wait when the sum does
/// not fit the calendar.
fn wait_until(now: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    chrono::Duration::try_seconds(seconds)
        .and_then(|wait| now.checked_add_signed(wait))
        .or_else(|| {
            chrono::Duration::try_seconds(DEFAULT_RATE_LIMIT_WAIT_SECONDS)
                .and_then(|wait| now.checked_add_signed(wait))
        })
        .unwrap_or(now)
}
