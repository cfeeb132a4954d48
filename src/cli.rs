use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;

use crate::config::Config;
use crate::exporter::Exporter;

#[derive(Parser, Debug)]
#[command(name = "github-actions-exporter")]
#[command(author, version, about = "Prometheus exporter for GitHub Actions", long_about = None)]
pub struct Cli {
    /// Configuration file (toml, json or yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// GitHub personal access token
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// GitHub App identifier
    #[arg(long, env = "GITHUB_APP_ID")]
    github_app_id: Option<u64>,

    /// GitHub App installation identifier
    #[arg(long, env = "GITHUB_APP_INSTALLATION_ID")]
    github_app_installation_id: Option<u64>,

    /// Path to the GitHub App private key
    #[arg(long, env = "GITHUB_APP_PRIVATE_KEY", hide_env_values = true)]
    github_app_private_key: Option<String>,

    /// GitHub API URL, `api.github.com` or an Enterprise API base
    #[arg(long, env = "GITHUB_API_URL")]
    github_api_url: Option<String>,

    /// Repositories to monitor (owner/repo, comma separated)
    #[arg(long, env = "GITHUB_REPOS", value_delimiter = ',')]
    github_repos: Option<Vec<String>>,

    /// Organizations whose repositories are monitored (comma separated)
    #[arg(long, env = "GITHUB_ORGAS", value_delimiter = ',')]
    github_orgas: Option<Vec<String>>,

    /// Refresh interval of run and runner metrics, in seconds
    #[arg(long, env = "GITHUB_REFRESH")]
    github_refresh: Option<u64>,

    /// Refresh interval of the workflow definitions, in seconds
    #[arg(long, env = "WORKFLOW_CACHE_REFRESH_INTERVAL_SECONDS", allow_negative_numbers = true)]
    workflow_cache_refresh_interval_seconds: Option<i64>,

    /// Billable usage interval as a multiple of the refresh interval
    #[arg(long, env = "BILLING_REFRESH_MULTIPLIER")]
    billing_refresh_multiplier: Option<u32>,

    /// Size of the HTTP response cache in bytes
    #[arg(long, env = "GITHUB_CACHE_SIZE_BYTES")]
    github_cache_size_bytes: Option<usize>,

    /// Only fetch runs created within this many hours
    #[arg(long, env = "FETCH_MAX_WORKFLOW_CREATION_AGE_HOURS")]
    fetch_max_workflow_creation_age_hours: Option<u64>,

    /// Labels of the workflow run metrics (comma separated)
    #[arg(long, env = "EXPORT_FIELDS_WORKFLOW_RUN")]
    export_fields_workflow_run: Option<String>,

    /// Fetch run timings for github_workflow_run_duration_ms
    #[arg(long, env = "FETCH_WORKFLOW_RUN_USAGE")]
    fetch_workflow_run_usage: Option<bool>,

    /// Timeout of a single GitHub API request, in seconds
    #[arg(long, env = "GITHUB_REQUEST_TIMEOUT")]
    github_request_timeout: Option<u64>,

    /// Wait before the first collection cycle, in seconds
    #[arg(long, env = "STARTUP_GRACE_SECONDS")]
    startup_grace_seconds: Option<u64>,

    /// Port of the metrics endpoint
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,
}

impl Cli {
    /// Applies flags and environment variables on top of the file configuration.
    fn apply(&self, config: &mut Config) {
        let github = &mut config.github;
        if let Some(token) = &self.github_token {
            github.token = Some(token.clone());
        }
        if let Some(app_id) = self.github_app_id {
            github.app_id = Some(app_id);
        }
        if let Some(installation_id) = self.github_app_installation_id {
            github.app_installation_id = Some(installation_id);
        }
        if let Some(key) = &self.github_app_private_key {
            github.app_private_key = Some(key.clone());
        }
        if let Some(url) = &self.github_api_url {
            github.api_url = url.clone();
        }
        if let Some(repos) = &self.github_repos {
            github.repositories = trimmed(repos);
        }
        if let Some(orgas) = &self.github_orgas {
            github.organizations = trimmed(orgas);
        }
        if let Some(refresh) = self.github_refresh {
            github.refresh = refresh;
        }
        if let Some(seconds) = self.workflow_cache_refresh_interval_seconds {
            github.workflow_cache_refresh = seconds;
        }
        if let Some(multiplier) = self.billing_refresh_multiplier {
            github.billing_refresh_multiplier = multiplier;
        }
        if let Some(size) = self.github_cache_size_bytes {
            github.cache_size_bytes = size;
        }
        if let Some(hours) = self.fetch_max_workflow_creation_age_hours {
            github.max_workflow_creation_age_hours = hours;
        }
        if let Some(timeout) = self.github_request_timeout {
            github.request_timeout = timeout;
        }
        if let Some(grace) = self.startup_grace_seconds {
            github.startup_grace = grace;
        }

        if let Some(fields) = &self.export_fields_workflow_run {
            config.metrics.workflow_fields = fields.clone();
        }
        if let Some(fetch) = self.fetch_workflow_run_usage {
            config.metrics.fetch_workflow_run_usage = fetch;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
    }

    pub async fn execute(&self) -> Result<()> {
        let mut config = Config::load(self.config.as_deref())?;
        self.apply(&mut config);

        info!(
            "Monitoring {} repositories and {} organizations",
            config.github.repositories.len(),
            config.github.organizations.len()
        );

        Exporter::new(config)?.run().await
    }
}

fn trimmed(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}
