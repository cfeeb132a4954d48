use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use prometheus::GaugeVec;

use crate::fields::{run_duration_ms, run_status_code, FieldSet, RunLabels};
use crate::metrics::Series;
use crate::providers::github::types::{links, RepositoryName};
use crate::providers::github::GitHubClient;
use crate::state::{SharedState, WorkflowSnapshot};

use super::{Collector, Publication};

/// Publishes the status, and optionally the duration, of recent workflow runs.
pub struct WorkflowRunCollector {
    client: Arc<GitHubClient>,
    state: Arc<SharedState>,
    fields: FieldSet,
    status_gauge: GaugeVec,
    duration_gauge: Option<GaugeVec>,
    max_age: chrono::Duration,
}

impl WorkflowRunCollector {
    pub fn new(
        client: Arc<GitHubClient>,
        state: Arc<SharedState>,
        fields: FieldSet,
        status_gauge: GaugeVec,
        duration_gauge: Option<GaugeVec>,
        max_age: chrono::Duration,
    ) -> Self {
        Self {
            client,
            state,
            fields,
            status_gauge,
            duration_gauge,
            max_age,
        }
    }

    fn created_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    async fn reported_duration(&self, repository: &RepositoryName, run_id: u64) -> Option<u64> {
        match self.client.get_workflow_run_usage(repository, run_id).await {
            Ok(usage) => usage.run_duration_ms,
            Err(e) => {
                debug!("No timing for run {run_id} of {repository}, using timestamps: {e}");
                None
            }
        }
    }

    async fn collect_repository(
        &self,
        repository: &RepositoryName,
        workflows: &WorkflowSnapshot,
        since: DateTime<Utc>,
        status: &mut Vec<Series>,
        duration: &mut Vec<Series>,
    ) {
        let fetched = self.client.workflow_runs(repository, since).await;
        if let Some(e) = &fetched.error {
            warn!(
                "Failed to list workflow runs of {repository}, keeping {} fetched runs: {e}",
                fetched.items.len()
            );
        }

        for run in &fetched.items {
            let Some(run_id) = run.id else {
                warn!("Skipping workflow run without id in {repository}");
                continue;
            };

            let labels = self
                .fields
                .label_values(&RunLabels::new(repository, run, workflows));

            if self.duration_gauge.is_some() {
                let reported = self.reported_duration(repository, run_id).await;
                duration.push(Series::new(labels.clone(), run_duration_ms(reported, run)));
            }

            debug!(
                "{} is {:?}/{:?}",
                links::workflow_run_url(repository.as_str(), run_id),
                run.status,
                run.conclusion
            );
            status.push(Series::new(labels, run_status_code(run)));
        }
    }
}

impl Collector for WorkflowRunCollector {
    fn name(&self) -> &'static str {
        "workflow runs"
    }

    async fn collect(&self) -> Vec<Publication> {
        let repositories = self.state.repositories.load();
        let workflows = self.state.workflows.load();
        let since = self.created_since(Utc::now());

        let mut status = Vec::new();
        let mut duration = Vec::new();
        for repository in repositories.iter() {
            self.collect_repository(repository, &workflows, since, &mut status, &mut duration)
                .await;
        }

        let mut publications = vec![Publication::new(&self.status_gauge, status)];
        if let Some(gauge) = &self.duration_gauge {
            publications.push(Publication::new(gauge, duration));
        }
        publications
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::auth::{Credentials, Token};
    use crate::collectors::run_once;
    use crate::metrics::ExporterMetrics;
    use mockito::{Matcher, Server, ServerGuard};
    use prometheus::core::Collector as _;
    use std::time::Duration;

    fn create_client(url: &str) -> Arc<GitHubClient> {
        Arc::new(
            GitHubClient::new(
                url,
                Credentials::Token(Token::from("test-token")),
                0,
                Duration::from_secs(5),
            )
            .unwrap(),
        )
    }

    fn create_state(repositories: &[&str]) -> Arc<SharedState> {
        let state = SharedState::default();
        state
            .repositories
            .replace(repositories.iter().map(|r| r.parse().unwrap()).collect());
        Arc::new(state)
    }

    fn create_collector(
        server: &ServerGuard,
        state: Arc<SharedState>,
        metrics: &ExporterMetrics,
        fields: FieldSet,
    ) -> WorkflowRunCollector {
        WorkflowRunCollector::new(
            create_client(&server.url()),
            state,
            fields,
            metrics.workflow_run_status.clone(),
            metrics.workflow_run_duration.clone(),
            chrono::Duration::hours(12),
        )
    }

    fn published(gauge: &GaugeVec) -> Vec<(Vec<String>, f64)> {
        let mut out: Vec<_> = gauge.collect()[0]
            .get_metric()
            .iter()
            .map(|m| {
                let labels: Vec<String> = m
                    .get_label()
                    .iter()
                    .map(|l| l.get_value().to_string())
                    .collect();
                (labels, m.get_gauge().get_value())
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    async fn mock_runs(server: &mut ServerGuard, repo: &str, body: &str) -> mockito::Mock {
        server
            .mock("GET", format!("/repos/{repo}/actions/runs").as_str())
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_two_repositories_then_one_run_left() {
        let mut server = Server::new_async().await;
        let fields = FieldSet::parse("repo,run_id,status").unwrap();
        let metrics = ExporterMetrics::new(&fields, false).unwrap();
        let state = create_state(&["octo/app", "octo/lib"]);
        let collector = create_collector(&server, state, &metrics, fields);

        let app = mock_runs(
            &mut server,
            "octo/app",
            r#"{"workflow_runs": [{"id": 1, "status": "completed", "conclusion": "success"}]}"#,
        )
        .await;
        let lib = mock_runs(
            &mut server,
            "octo/lib",
            r#"{"workflow_runs": [{"id": 2, "status": "in_progress", "conclusion": null}]}"#,
        )
        .await;

        run_once(&collector).await;
        assert_eq!(
            published(&metrics.workflow_run_status),
            vec![
                (vec!["octo/app".into(), "1".into(), "completed".into()], 1.0),
                (vec!["octo/lib".into(), "2".into(), "in_progress".into()], 3.0),
            ]
        );

        app.remove_async().await;
        lib.remove_async().await;
        let _app = mock_runs(&mut server, "octo/app", r#"{"workflow_runs": []}"#).await;
        let _lib = mock_runs(
            &mut server,
            "octo/lib",
            r#"{"workflow_runs": [{"id": 2, "status": "completed", "conclusion": "failure"}]}"#,
        )
        .await;

        run_once(&collector).await;
        assert_eq!(
            published(&metrics.workflow_run_status),
            vec![(vec!["octo/lib".into(), "2".into(), "completed".into()], 0.0)]
        );
    }

    #[tokio::test]
    async fn test_failing_repository_does_not_abort_cycle() {
        let mut server = Server::new_async().await;
        let fields = FieldSet::parse("repo,status").unwrap();
        let metrics = ExporterMetrics::new(&fields, false).unwrap();
        let state = create_state(&["octo/broken", "octo/app"]);
        let collector = create_collector(&server, state, &metrics, fields);

        let _broken = server
            .mock("GET", "/repos/octo/broken/actions/runs")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"message": "Not Found"}"#)
            .create_async()
            .await;
        let _app = mock_runs(
            &mut server,
            "octo/app",
            r#"{"workflow_runs": [{"id": 1, "status": "queued"}, {"status": "queued"}]}"#,
        )
        .await;

        run_once(&collector).await;
        assert_eq!(
            published(&metrics.workflow_run_status),
            vec![(vec!["octo/app".into(), "queued".into()], 4.0)]
        );
    }

    #[tokio::test]
    async fn test_duration_falls_back_when_timing_fails() {
        let mut server = Server::new_async().await;
        let fields = FieldSet::parse("repo,run_id").unwrap();
        let metrics = ExporterMetrics::new(&fields, true).unwrap();
        let state = create_state(&["octo/app"]);
        let collector = create_collector(&server, state, &metrics, fields);

        let _runs = mock_runs(
            &mut server,
            "octo/app",
            r#"{"workflow_runs": [
                {"id": 1, "status": "completed", "conclusion": "success",
                 "run_started_at": "2024-05-01T10:00:00Z", "updated_at": "2024-05-01T10:00:05Z"},
                {"id": 2, "status": "completed", "conclusion": "success",
                 "run_started_at": "2024-05-01T10:00:05Z", "updated_at": "2024-05-01T10:00:05Z"},
                {"id": 3, "status": "completed", "conclusion": "success"}
            ]}"#,
        )
        .await;
        let _failing = server
            .mock(
                "GET",
                Matcher::Regex(r"^/repos/octo/app/actions/runs/[12]/timing$".to_string()),
            )
            .with_status(500)
            .create_async()
            .await;
        let _timed = server
            .mock("GET", "/repos/octo/app/actions/runs/3/timing")
            .with_status(200)
            .with_body(r#"{"run_duration_ms": 42000}"#)
            .create_async()
            .await;

        run_once(&collector).await;

        let duration = metrics.workflow_run_duration.as_ref().unwrap();
        assert_eq!(
            published(duration),
            vec![
                (vec!["octo/app".into(), "1".into()], 5000.0),
                (vec!["octo/app".into(), "2".into()], -1.0),
                (vec!["octo/app".into(), "3".into()], 42000.0),
            ]
        );
    }

    #[test]
    fn test_created_since_saturates() {
        let client = create_client("https://api.github.com");
        let collector = WorkflowRunCollector {
            client,
            state: create_state(&[]),
            fields: FieldSet::default(),
            status_gauge: GaugeVec::new(prometheus::Opts::new("t", "t"), &["a"]).unwrap(),
            duration_gauge: None,
            max_age: chrono::Duration::MAX,
        };

        assert_eq!(collector.created_since(Utc::now()), DateTime::<Utc>::MIN_UTC);
    }
}
