use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ExporterError;
use crate::fields::{FieldSet, DEFAULT_WORKFLOW_FIELDS};
use crate::providers::github::api_base_url;

/// Lower bound of the workflow definition refresh interval.
pub const MIN_WORKFLOW_CACHE_REFRESH_SECONDS: u64 = 60;

/// Configuration of the exporter.
///
/// Loaded from an optional file, then overridden by command line flags and
/// environment variables (see [`crate::cli::Cli`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// GitHub access and polling
    #[serde(default)]
    pub github: GitHubConfig,

    /// Published metrics
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Metrics endpoint
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GitHubConfig {
    /// GitHub personal access token
    pub token: Option<String>,

    /// GitHub App identifier
    pub app_id: Option<u64>,

    /// GitHub App installation identifier
    pub app_installation_id: Option<u64>,

    /// Path to the GitHub App private key (PEM), or the key itself
    pub app_private_key: Option<String>,

    /// GitHub API base URL, `api.github.com` or an Enterprise API base
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Monitored repositories (`owner/repo`), takes precedence over organizations
    #[serde(default)]
    pub repositories: Vec<String>,

    /// Organizations whose repositories are monitored
    #[serde(default)]
    pub organizations: Vec<String>,

    /// Refresh interval of the run and runner collectors, in seconds
    #[serde(default = "default_refresh")]
    pub refresh: u64,

    /// Refresh interval of the workflow definition cache, in seconds
    #[serde(default = "default_workflow_cache_refresh")]
    pub workflow_cache_refresh: i64,

    /// Billing collector interval, as a multiple of `refresh`
    #[serde(default = "default_billing_refresh_multiplier")]
    pub billing_refresh_multiplier: u32,

    /// Size of the HTTP response cache in bytes, 0 disables it
    #[serde(default = "default_cache_size_bytes")]
    pub cache_size_bytes: usize,

    /// Only runs created within this many hours are fetched
    #[serde(default = "default_max_workflow_creation_age_hours")]
    pub max_workflow_creation_age_hours: u64,

    /// Timeout of a single API request, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Delay between the first cache refresh and the first collector cycle, in seconds
    #[serde(default = "default_startup_grace")]
    pub startup_grace: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricsConfig {
    /// Comma separated label list of the workflow run metrics
    #[serde(default = "default_workflow_fields")]
    pub workflow_fields: String,

    /// Fetch run timings and publish `github_workflow_run_duration_ms`
    #[serde(default = "default_true")]
    pub fetch_workflow_run_usage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Port of the metrics endpoint
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            app_id: None,
            app_installation_id: None,
            app_private_key: None,
            api_url: default_api_url(),
            repositories: Vec::new(),
            organizations: Vec::new(),
            refresh: default_refresh(),
            workflow_cache_refresh: default_workflow_cache_refresh(),
            billing_refresh_multiplier: default_billing_refresh_multiplier(),
            cache_size_bytes: default_cache_size_bytes(),
            max_workflow_creation_age_hours: default_max_workflow_creation_age_hours(),
            request_timeout: default_request_timeout(),
            startup_grace: default_startup_grace(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            workflow_fields: default_workflow_fields(),
            fetch_workflow_run_usage: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn default_api_url() -> String {
    "api.github.com".to_string()
}

fn default_refresh() -> u64 {
    60
}

fn default_workflow_cache_refresh() -> i64 {
    3600
}

fn default_billing_refresh_multiplier() -> u32 {
    5
}

fn default_cache_size_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_workflow_creation_age_hours() -> u64 {
    720
}

fn default_request_timeout() -> u64 {
    30
}

fn default_startup_grace() -> u64 {
    10
}

fn default_workflow_fields() -> String {
    DEFAULT_WORKFLOW_FIELDS.to_string()
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    9999
}

impl GitHubConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh)
    }

    /// Interval of the workflow definition refresher.
    ///
    /// Non-positive values select the default, anything below one minute is
    /// raised to one minute.
    pub fn workflow_cache_refresh_interval(&self) -> Duration {
        let seconds = u64::try_from(self.workflow_cache_refresh)
            .ok()
            .filter(|s| *s > 0)
            .unwrap_or(3600);
        Duration::from_secs(seconds.max(MIN_WORKFLOW_CACHE_REFRESH_SECONDS))
    }

    pub fn billing_interval(&self) -> Duration {
        self.refresh_interval().saturating_mul(self.billing_refresh_multiplier)
    }

    /// Lookback window of the run listing; zero selects twelve hours.
    pub fn max_workflow_creation_age(&self) -> chrono::Duration {
        let hours = match self.max_workflow_creation_age_hours {
            0 => 12,
            hours => hours,
        };
        i64::try_from(hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace)
    }
}

impl MetricsConfig {
    /// Parsed label list of the workflow run metrics.
    pub fn workflow_fields(&self) -> crate::error::Result<FieldSet> {
        FieldSet::parse(&self.workflow_fields)
    }
}

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path
    /// 2. ./exporter.toml
    /// 3. ./exporter.json
    /// 4. ./exporter.yaml
    /// 5. ./exporter.yml
    ///
    /// Returns default configuration if no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        let candidates = ["exporter.toml", "exporter.json", "exporter.yaml", "exporter.yml"];

        for candidate in &candidates {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::load_from_path(path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file path.
    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display())),
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display())),
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse config file: {}", path.display())),
        }
    }

    /// Checks everything that would otherwise fail after startup.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid label list, a zero refresh
    /// interval or billing multiplier, or an unparsable API URL.
    pub fn validate(&self) -> crate::error::Result<FieldSet> {
        let fields = self.metrics.workflow_fields()?;

        if self.github.refresh == 0 {
            return Err(ExporterError::Config(
                "Refresh interval must be at least one second".to_string(),
            ));
        }
        if self.github.billing_refresh_multiplier == 0 {
            return Err(ExporterError::Config(
                "Billing refresh multiplier must be at least 1".to_string(),
            ));
        }
        if self
            .github
            .refresh_interval()
            .checked_mul(self.github.billing_refresh_multiplier)
            .is_none()
        {
            return Err(ExporterError::Config(format!(
                "Billing interval of {}s times {} is too large",
                self.github.refresh, self.github.billing_refresh_multiplier
            )));
        }
        api_base_url(&self.github.api_url)?;

        Ok(fields)
    }
}
