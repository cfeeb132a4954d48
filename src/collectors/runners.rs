use std::sync::Arc;

use log::warn;
use prometheus::GaugeVec;

use crate::metrics::Series;
use crate::providers::github::types::Runner;
use crate::providers::github::GitHubClient;
use crate::state::SharedState;

use super::{Collector, Publication};

/// Gauge value and labels of a runner, `None` when any attribute is missing.
///
/// The first label is the owning repository or organization.
fn runner_series(owner: &str, runner: &Runner) -> Option<Series> {
    let id = runner.id?;
    let name = runner.name.as_deref()?;
    let os = runner.os.as_deref()?;
    let status = runner.status.as_deref()?;
    let busy = runner.busy?;

    let value = if status == "online" { 1.0 } else { 0.0 };
    Some(Series::new(
        vec![
            owner.to_string(),
            os.to_string(),
            name.to_string(),
            id.to_string(),
            busy.to_string(),
        ],
        value,
    ))
}

fn runners_to_series(owner: &str, runners: &[Runner]) -> Vec<Series> {
    runners
        .iter()
        .filter_map(|runner| {
            let series = runner_series(owner, runner);
            if series.is_none() {
                warn!("Skipping runner of {owner} with incomplete data (id {:?})", runner.id);
            }
            series
        })
        .collect()
}

/// Publishes `github_runner_status` for every monitored repository.
pub struct RepositoryRunnerCollector {
    client: Arc<GitHubClient>,
    state: Arc<SharedState>,
    gauge: GaugeVec,
}

impl RepositoryRunnerCollector {
    pub fn new(client: Arc<GitHubClient>, state: Arc<SharedState>, gauge: GaugeVec) -> Self {
        Self {
            client,
            state,
            gauge,
        }
    }
}

impl Collector for RepositoryRunnerCollector {
    fn name(&self) -> &'static str {
        "repository runners"
    }

    async fn collect(&self) -> Vec<Publication> {
        let repositories = self.state.repositories.load();

        let mut series = Vec::new();
        for repository in repositories.iter() {
            let fetched = self.client.repository_runners(repository).await;
            if let Some(e) = &fetched.error {
                warn!("Failed to list runners of {repository}: {e}");
            }
            series.extend(runners_to_series(repository.as_str(), &fetched.items));
        }

        vec![Publication::new(&self.gauge, series)]
    }
}

/// Publishes `github_runner_organization_status` for every configured organization.
pub struct OrganizationRunnerCollector {
    client: Arc<GitHubClient>,
    organizations: Vec<String>,
    gauge: GaugeVec,
}

impl OrganizationRunnerCollector {
    pub fn new(client: Arc<GitHubClient>, organizations: Vec<String>, gauge: GaugeVec) -> Self {
        Self {
            client,
            organizations,
            gauge,
        }
    }
}

impl Collector for OrganizationRunnerCollector {
    fn name(&self) -> &'static str {
        "organization runners"
    }

    async fn collect(&self) -> Vec<Publication> {
        let mut series = Vec::new();
        for organization in self.organizations.iter().filter(|o| !o.is_empty()) {
            let fetched = self.client.organization_runners(organization).await;
            if let Some(e) = &fetched.error {
                warn!("Failed to list runners of organization {organization}: {e}");
            }
            series.extend(runners_to_series(organization, &fetched.items));
        }

        vec![Publication::new(&self.gauge, series)]
    }
}
