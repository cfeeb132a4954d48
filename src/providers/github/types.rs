use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ExporterError;

/// Repository identifier in `owner/name` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryName(String);

impl RepositoryName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RepositoryName {
    type Err = ExporterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
            return Err(ExporterError::Config(format!(
                "Repository '{s}' must be in format 'owner/repo'"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Repository as returned by the organization repository listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    /// Full name in `owner/name` form
    #[serde(default)]
    pub full_name: Option<String>,
}

/// Workflow definition of a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Numeric workflow identifier
    pub id: u64,
    /// Human readable workflow name
    #[serde(default)]
    pub name: Option<String>,
    /// GraphQL node identifier
    #[serde(default)]
    pub node_id: Option<String>,
    /// Workflow state (e.g., "active", "disabled_manually")
    #[serde(default)]
    pub state: Option<String>,
}

/// GitHub Actions workflow run.
///
/// Every attribute is optional: the API omits or nulls fields depending on the
/// run's age and trigger, and a missing value renders as the zero value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowRun {
    /// Unique identifier for the workflow run
    pub id: Option<u64>,
    /// GraphQL node identifier
    pub node_id: Option<String>,
    /// Identifier of the workflow definition this run belongs to
    pub workflow_id: Option<u64>,
    /// Head branch or tag name
    pub head_branch: Option<String>,
    /// SHA of the head commit
    pub head_sha: Option<String>,
    /// Path to the workflow file
    pub path: Option<String>,
    /// Display title for the run
    pub display_title: Option<String>,
    /// Run number
    pub run_number: Option<u64>,
    /// Attempt number of the run
    pub run_attempt: Option<u64>,
    /// Event that triggered the run
    pub event: Option<String>,
    /// Status of the run
    pub status: Option<String>,
    /// Conclusion of the run (success, failure, etc.)
    pub conclusion: Option<String>,
    /// Pull requests associated with the run
    #[serde(deserialize_with = "skip_malformed")]
    pub pull_requests: Vec<PullRequest>,
    /// Commit the run was triggered on
    pub head_commit: Option<HeadCommit>,
    /// User who initiated the run
    pub actor: Option<Actor>,
    /// User who triggered the latest attempt
    pub triggering_actor: Option<Actor>,
    /// When the run was created
    pub created_at: Option<DateTime<Utc>>,
    /// When the run was last updated
    pub updated_at: Option<DateTime<Utc>>,
    /// When the latest attempt started
    pub run_started_at: Option<DateTime<Utc>>,
}

/// Minimal pull request reference attached to a workflow run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PullRequest {
    pub number: Option<u64>,
    pub title: Option<String>,
    pub base: Option<BranchRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchRef {
    #[serde(rename = "ref")]
    pub ref_: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadCommit {
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Actor {
    pub login: Option<String>,
}

/// Self-hosted runner, scoped to a repository or an organization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Runner {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub os: Option<String>,
    pub status: Option<String>,
    pub busy: Option<bool>,
}

/// Timing of a single workflow run (`actions/runs/{id}/timing`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkflowRunUsage {
    pub run_duration_ms: Option<u64>,
}

/// Billable usage of a workflow definition (`actions/workflows/{id}/timing`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkflowUsage {
    /// Billable time keyed by operating system label (e.g., "UBUNTU")
    pub billable: Option<HashMap<String, Option<WorkflowBill>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkflowBill {
    pub total_ms: Option<u64>,
}

/// Decodes a list, treating `null` as empty and dropping elements that do
/// not decode so one bad record never fails the page.
fn skip_malformed<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let values = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(values
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                let record = std::any::type_name::<T>().rsplit("::").next().unwrap_or("record");
                warn!("Skipping malformed {record}: {e}");
                None
            }
        })
        .collect())
}

/// Response from GitHub API for organization repositories.
#[derive(Debug, Deserialize)]
pub(super) struct RepositoriesResponse(
    #[serde(deserialize_with = "skip_malformed")] pub Vec<Repository>,
);

/// Response from GitHub API for workflow runs.
#[derive(Debug, Deserialize)]
pub(super) struct WorkflowRunsResponse {
    #[serde(default, deserialize_with = "skip_malformed")]
    pub workflow_runs: Vec<WorkflowRun>,
}

/// Response from GitHub API for workflow definitions.
#[derive(Debug, Deserialize)]
pub(super) struct WorkflowsResponse {
    #[serde(default, deserialize_with = "skip_malformed")]
    pub workflows: Vec<Workflow>,
}

/// Response from GitHub API for self-hosted runners.
#[derive(Debug, Deserialize)]
pub(super) struct RunnersResponse {
    #[serde(default, deserialize_with = "skip_malformed")]
    pub runners: Vec<Runner>,
}

/// Links for GitHub resources.
pub mod links {
    /// Generate URL for a workflow run.
    pub fn workflow_run_url(repository: &str, run_id: u64) -> String {
        format!("https://github.com/{repository}/actions/runs/{run_id}")
    }
}
