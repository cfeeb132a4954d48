use std::sync::Arc;

use log::{debug, warn};
use prometheus::GaugeVec;

use crate::metrics::Series;
use crate::providers::github::pagination::BackoffPolicy;
use crate::providers::github::types::{RepositoryName, Workflow, WorkflowUsage};
use crate::providers::github::GitHubClient;
use crate::state::SharedState;

use super::{Collector, Publication};

/// Publishes `github_workflow_usage_seconds` for every cached workflow definition.
pub struct BillingCollector {
    client: Arc<GitHubClient>,
    state: Arc<SharedState>,
    gauge: GaugeVec,
    policy: BackoffPolicy,
}

impl BillingCollector {
    pub fn new(client: Arc<GitHubClient>, state: Arc<SharedState>, gauge: GaugeVec) -> Self {
        Self {
            client,
            state,
            gauge,
            policy: BackoffPolicy::single_call(),
        }
    }

    #[cfg(test)]
    fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// One series per operating system present in `usage`.
///
/// Returns nothing for a definition missing any identifying attribute.
#[allow(clippy::cast_precision_loss)]
fn usage_series(repository: &RepositoryName, workflow: &Workflow, usage: &WorkflowUsage) -> Vec<Series> {
    let (Some(name), Some(node_id), Some(state)) = (
        workflow.name.as_deref(),
        workflow.node_id.as_deref(),
        workflow.state.as_deref(),
    ) else {
        return Vec::new();
    };

    let Some(billable) = &usage.billable else {
        return Vec::new();
    };

    let mut series: Vec<Series> = billable
        .iter()
        .filter_map(|(os, bill)| {
            let total_ms = bill.as_ref()?.total_ms?;
            Some(Series::new(
                vec![
                    repository.to_string(),
                    workflow.id.to_string(),
                    node_id.to_string(),
                    name.to_string(),
                    state.to_string(),
                    os.to_uppercase(),
                ],
                total_ms as f64 / 1000.0,
            ))
        })
        .collect();
    series.sort_by(|a, b| a.labels.cmp(&b.labels));
    series
}

fn is_complete(workflow: &Workflow) -> bool {
    workflow.name.is_some() && workflow.node_id.is_some() && workflow.state.is_some()
}

impl Collector for BillingCollector {
    fn name(&self) -> &'static str {
        "billable usage"
    }

    async fn collect(&self) -> Vec<Publication> {
        let snapshot = self.state.workflows.load();
        if snapshot.is_empty() {
            debug!("No cached workflow definitions, clearing billable usage");
        }

        let mut series = Vec::new();
        for (repository, workflow) in snapshot.iter_sorted() {
            if !is_complete(workflow) {
                warn!(
                    "Skipping workflow {} of {repository} with incomplete definition",
                    workflow.id
                );
                continue;
            }

            let what = format!("GetWorkflowUsageByID {repository}#{}", workflow.id);
            let usage = self
                .policy
                .retry(&what, || self.client.get_workflow_usage(repository, workflow.id))
                .await;

            match usage {
                Ok(usage) => series.extend(usage_series(repository, workflow, &usage)),
                Err(e) => warn!("Failed to get usage of workflow {} of {repository}: {e}", workflow.id),
            }
        }

        vec![Publication::new(&self.gauge, series)]
    }
}
