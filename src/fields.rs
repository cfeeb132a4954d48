//! Label derivation for workflow runs.
//!
//! Turns a raw run into the ordered label vector of `github_workflow_run_status`
//! and maps its status/conclusion pair to the numeric status code.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::ExporterError;
use crate::providers::github::types::{RepositoryName, WorkflowRun};
use crate::state::WorkflowSnapshot;

/// Label value used when a run's workflow is missing from the definition cache.
pub const UNKNOWN_WORKFLOW_NAME: &str = "unknown_workflow_name";

/// Duration reported when neither the usage endpoint nor the run's timestamps
/// yield a value.
pub const DURATION_NOT_COMPUTABLE: f64 = -1.0;

pub const DEFAULT_WORKFLOW_FIELDS: &str = "repo,workflow_id,workflow_name,run_id,run_number,run_attempt,event,status,conclusion,head_branch,derived_target_branch,pr_number,derived_commit_pr_title,display_title,actor_login,triggering_actor_login,created_at_unix,updated_at_unix,run_started_at_unix,path";

/// A label of the workflow run metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunField {
    Repo,
    RunId,
    NodeId,
    HeadBranch,
    HeadSha,
    Path,
    RunNumber,
    RunAttempt,
    Event,
    DisplayTitle,
    Status,
    Conclusion,
    WorkflowId,
    WorkflowName,
    PrNumber,
    ActorLogin,
    TriggeringActorLogin,
    CreatedAtUnix,
    UpdatedAtUnix,
    RunStartedAtUnix,
    DerivedTargetBranch,
    DerivedCommitPrTitle,
}

impl RunField {
    pub const ALL: [RunField; 22] = [
        Self::Repo,
        Self::RunId,
        Self::NodeId,
        Self::HeadBranch,
        Self::HeadSha,
        Self::Path,
        Self::RunNumber,
        Self::RunAttempt,
        Self::Event,
        Self::DisplayTitle,
        Self::Status,
        Self::Conclusion,
        Self::WorkflowId,
        Self::WorkflowName,
        Self::PrNumber,
        Self::ActorLogin,
        Self::TriggeringActorLogin,
        Self::CreatedAtUnix,
        Self::UpdatedAtUnix,
        Self::RunStartedAtUnix,
        Self::DerivedTargetBranch,
        Self::DerivedCommitPrTitle,
    ];

    /// Label name as it appears in the exposition format.
    pub fn name(self) -> &'static str {
        match self {
            Self::Repo => "repo",
            Self::RunId => "run_id",
            Self::NodeId => "node_id",
            Self::HeadBranch => "head_branch",
            Self::HeadSha => "head_sha",
            Self::Path => "path",
            Self::RunNumber => "run_number",
            Self::RunAttempt => "run_attempt",
            Self::Event => "event",
            Self::DisplayTitle => "display_title",
            Self::Status => "status",
            Self::Conclusion => "conclusion",
            Self::WorkflowId => "workflow_id",
            Self::WorkflowName => "workflow_name",
            Self::PrNumber => "pr_number",
            Self::ActorLogin => "actor_login",
            Self::TriggeringActorLogin => "triggering_actor_login",
            Self::CreatedAtUnix => "created_at_unix",
            Self::UpdatedAtUnix => "updated_at_unix",
            Self::RunStartedAtUnix => "run_started_at_unix",
            Self::DerivedTargetBranch => "derived_target_branch",
            Self::DerivedCommitPrTitle => "derived_commit_pr_title",
        }
    }

    /// Extracts this field's label value from a run.
    pub fn extract(self, run: &RunLabels<'_>) -> String {
        let raw = run.run;
        match self {
            Self::Repo => run.repository.to_string(),
            Self::RunId => raw.id.unwrap_or_default().to_string(),
            Self::NodeId => text(&raw.node_id),
            Self::HeadBranch => text(&raw.head_branch),
            Self::HeadSha => text(&raw.head_sha),
            Self::Path => text(&raw.path),
            Self::RunNumber => raw.run_number.unwrap_or_default().to_string(),
            Self::RunAttempt => raw.run_attempt.unwrap_or_default().to_string(),
            Self::Event => text(&raw.event),
            Self::DisplayTitle => text(&raw.display_title),
            Self::Status => text(&raw.status),
            Self::Conclusion => text(&raw.conclusion),
            Self::WorkflowId => raw.workflow_id.unwrap_or_default().to_string(),
            Self::WorkflowName => run.workflow_name.to_string(),
            Self::PrNumber => raw
                .pull_requests
                .first()
                .and_then(|pr| pr.number)
                .map(|n| n.to_string())
                .unwrap_or_default(),
            Self::ActorLogin => raw
                .actor
                .as_ref()
                .map(|a| text(&a.login))
                .unwrap_or_default(),
            Self::TriggeringActorLogin => raw
                .triggering_actor
                .as_ref()
                .map(|a| text(&a.login))
                .unwrap_or_default(),
            Self::CreatedAtUnix => unix_seconds(raw.created_at),
            Self::UpdatedAtUnix => unix_seconds(raw.updated_at),
            Self::RunStartedAtUnix => unix_seconds(raw.run_started_at),
            Self::DerivedTargetBranch => run.target_branch.clone(),
            Self::DerivedCommitPrTitle => run.title.clone(),
        }
    }
}

impl FromStr for RunField {
    type Err = ExporterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|field| field.name() == s)
            .ok_or_else(|| ExporterError::Config(format!("Unknown workflow run field '{s}'")))
    }
}

impl fmt::Display for RunField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered list of labels for the workflow run metrics, validated at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSet(Vec<RunField>);

impl FieldSet {
    /// Parses a comma-separated list of field names.
    ///
    /// # Errors
    ///
    /// Fails on an empty list, an unknown field name or a duplicated field,
    /// since the metric could not be registered with those labels.
    pub fn parse(list: &str) -> Result<Self, ExporterError> {
        let mut fields = Vec::new();
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let field: RunField = name.parse()?;
            if fields.contains(&field) {
                return Err(ExporterError::Config(format!(
                    "Workflow run field '{name}' is listed twice"
                )));
            }
            fields.push(field);
        }

        if fields.is_empty() {
            return Err(ExporterError::Config(
                "Workflow run field list is empty".to_string(),
            ));
        }

        Ok(Self(fields))
    }

    pub fn label_names(&self) -> Vec<&'static str> {
        self.0.iter().map(|f| f.name()).collect()
    }

    /// Label values of `run`, one per configured field and in the same order.
    pub fn label_values(&self, run: &RunLabels<'_>) -> Vec<String> {
        self.0.iter().map(|field| field.extract(run)).collect()
    }
}

impl Default for FieldSet {
    fn default() -> Self {
        Self(
            DEFAULT_WORKFLOW_FIELDS
                .split(',')
                .filter_map(|name| name.parse().ok())
                .collect(),
        )
    }
}

/// A run together with the values derived from more than one of its attributes.
pub struct RunLabels<'a> {
    pub repository: &'a RepositoryName,
    pub run: &'a WorkflowRun,
    pub workflow_name: &'a str,
    pub target_branch: String,
    pub title: String,
}

impl<'a> RunLabels<'a> {
    pub fn new(
        repository: &'a RepositoryName,
        run: &'a WorkflowRun,
        workflows: &'a WorkflowSnapshot,
    ) -> Self {
        let workflow_name = run
            .workflow_id
            .and_then(|id| workflows.workflow(repository, id))
            .and_then(|w| w.name.as_deref())
            .unwrap_or(UNKNOWN_WORKFLOW_NAME);

        Self {
            repository,
            run,
            workflow_name,
            target_branch: target_branch(run),
            title: commit_or_pr_title(run),
        }
    }
}

fn text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn unix_seconds(value: Option<DateTime<Utc>>) -> String {
    value.map_or_else(|| "0".to_string(), |t| t.timestamp().to_string())
}

fn is_pull_request_event(run: &WorkflowRun) -> bool {
    run.event.as_deref() == Some("pull_request")
}

/// Branch a run targets: the pull request base for pull request events,
/// otherwise the run's head branch.
pub fn target_branch(run: &WorkflowRun) -> String {
    if is_pull_request_event(run) {
        let base = run
            .pull_requests
            .first()
            .and_then(|pr| pr.base.as_ref())
            .and_then(|base| base.ref_.clone());
        if let Some(base) = base {
            return base;
        }
    }

    text(&run.head_branch)
}

/// Human title of a run: pull request title, display title, then the first
/// line of the head commit message.
pub fn commit_or_pr_title(run: &WorkflowRun) -> String {
    if is_pull_request_event(run) {
        if let Some(title) = run.pull_requests.first().and_then(|pr| pr.title.clone()) {
            return title;
        }
    }

    if let Some(title) = run.display_title.as_deref().filter(|t| !t.is_empty()) {
        return title.to_string();
    }

    run.head_commit
        .as_ref()
        .and_then(|commit| commit.message.as_deref())
        .and_then(|message| message.lines().next())
        .map(|line| line.trim().to_string())
        .unwrap_or_default()
}

/// Numeric code of a run's status and conclusion.
///
/// | status | conclusion | code |
/// |---|---|---|
/// | completed | success / failure / skipped / cancelled / neutral / timed_out | 1 / 0 / 2 / 5 / 6 / 7 |
/// | completed | anything else | 8 |
/// | in_progress, requested, waiting | any | 3 |
/// | queued | any | 4 |
/// | action_required | any | 9 |
/// | stale | any | 10 |
/// | anything else | any | 99 |
pub fn status_code(status: &str, conclusion: &str) -> f64 {
    match status {
        "completed" => match conclusion {
            "success" => 1.0,
            "failure" => 0.0,
            "skipped" => 2.0,
            "cancelled" => 5.0,
            "neutral" => 6.0,
            "timed_out" => 7.0,
            _ => 8.0,
        },
        "in_progress" | "requested" | "waiting" => 3.0,
        "queued" => 4.0,
        "action_required" => 9.0,
        "stale" => 10.0,
        _ => 99.0,
    }
}

pub fn run_status_code(run: &WorkflowRun) -> f64 {
    status_code(
        run.status.as_deref().unwrap_or_default(),
        run.conclusion.as_deref().unwrap_or_default(),
    )
}

/// Duration of a run in milliseconds.
///
/// Prefers the value reported by the usage endpoint. Without it, a run in a
/// terminal state (`completed` or `stale`) whose update time is strictly after
/// its start time reports the difference; anything else reports
/// [`DURATION_NOT_COMPUTABLE`].
#[allow(clippy::cast_precision_loss)]
pub fn run_duration_ms(reported_ms: Option<u64>, run: &WorkflowRun) -> f64 {
    if let Some(ms) = reported_ms {
        return ms as f64;
    }

    let terminal = matches!(run.status.as_deref(), Some("completed" | "stale"));
    match (terminal, run.run_started_at, run.updated_at) {
        (true, Some(started), Some(updated)) if updated > started => {
            (updated - started).num_milliseconds() as f64
        }
        _ => DURATION_NOT_COMPUTABLE,
    }
}
