//! Wires the client, shared state, collectors and metrics endpoint together.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::auth::Credentials;
use crate::collectors::{
    run_periodically, BillingCollector, OrganizationRunnerCollector, RepositoryRunnerCollector,
    WorkflowRunCollector,
};
use crate::config::Config;
use crate::fields::FieldSet;
use crate::metrics::ExporterMetrics;
use crate::providers::github::GitHubClient;
use crate::refresher::Refresher;
use crate::server;
use crate::state::SharedState;

pub struct Exporter {
    config: Config,
    fields: FieldSet,
    client: Arc<GitHubClient>,
    metrics: ExporterMetrics,
    state: Arc<SharedState>,
}

impl Exporter {
    /// Validates `config` and builds everything that can fail before polling starts.
    pub fn new(config: Config) -> Result<Self> {
        let fields = config.validate().context("Invalid configuration")?;
        let credentials =
            Credentials::from_config(&config.github).context("Invalid GitHub credentials")?;

        let client = GitHubClient::new(
            &config.github.api_url,
            credentials,
            config.github.cache_size_bytes,
            config.github.request_timeout(),
        )
        .context("Failed to create GitHub client")?;
        info!("Using GitHub API at {}", client.api_url());

        let metrics = ExporterMetrics::new(&fields, config.metrics.fetch_workflow_run_usage)
            .context("Failed to register metrics")?;

        Ok(Self {
            client: Arc::new(client),
            state: Arc::new(SharedState::default()),
            metrics,
            fields,
            config,
        })
    }

    fn spawn_collectors(&self) -> Vec<JoinHandle<()>> {
        let github = &self.config.github;
        let refresh = github.refresh_interval();
        let mut tasks = Vec::new();

        let runs = WorkflowRunCollector::new(
            self.client.clone(),
            self.state.clone(),
            self.fields.clone(),
            self.metrics.workflow_run_status.clone(),
            self.metrics.workflow_run_duration.clone(),
            github.max_workflow_creation_age(),
        );
        tasks.push(tokio::spawn(run_periodically(Arc::new(runs), refresh)));

        let runners = RepositoryRunnerCollector::new(
            self.client.clone(),
            self.state.clone(),
            self.metrics.runner_status.clone(),
        );
        tasks.push(tokio::spawn(run_periodically(Arc::new(runners), refresh)));

        if github.organizations.iter().any(|o| !o.is_empty()) {
            let org_runners = OrganizationRunnerCollector::new(
                self.client.clone(),
                github.organizations.clone(),
                self.metrics.organization_runner_status.clone(),
            );
            tasks.push(tokio::spawn(run_periodically(Arc::new(org_runners), refresh)));
        }

        let billing = BillingCollector::new(
            self.client.clone(),
            self.state.clone(),
            self.metrics.workflow_usage.clone(),
        );
        tasks.push(tokio::spawn(run_periodically(
            Arc::new(billing),
            github.billing_interval(),
        )));

        tasks
    }

    /// Starts polling and serves the metrics endpoint until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.server.port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind metrics endpoint on {addr}"))?;

        self.serve_until(listener, wait_for_ctrl_c()).await
    }

    /// Serves `listener` right away and starts the collectors after the
    /// startup grace period, until `shutdown` resolves.
    async fn serve_until<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let github = &self.config.github;
        if github.repositories.is_empty() && github.organizations.is_empty() {
            warn!("No repositories or organizations configured, nothing will be collected");
        }

        let refresher = Refresher::new(
            self.client.clone(),
            self.state.clone(),
            github.repositories.clone(),
            github.organizations.clone(),
        );
        let mut tasks = vec![tokio::spawn(
            refresher.run(github.workflow_cache_refresh_interval()),
        )];

        let mut server = tokio::spawn(server::serve(listener, self.metrics.clone(), shutdown));

        let grace = github.startup_grace();
        info!("Waiting {}s for the first repository refresh", grace.as_secs());
        let served = tokio::select! {
            served = &mut server => served,
            () = tokio::time::sleep(grace) => {
                tasks.extend(self.spawn_collectors());
                (&mut server).await
            }
        };

        for task in &tasks {
            task.abort();
        }
        join_all(tasks).await;

        served
            .context("Metrics endpoint task failed")?
            .context("Metrics endpoint failed")
    }
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_invalid_fields_fail_at_startup() {
        let mut config = Config::default();
        config.metrics.workflow_fields = "repo,not_a_field".to_string();

        let error = Exporter::new(config).err().unwrap();
        assert!(format!("{error:#}").contains("not_a_field"));
    }

    #[test]
    fn test_unreadable_private_key_fails_at_startup() {
        let mut config = Config::default();
        config.github.app_id = Some(1);
        config.github.app_installation_id = Some(2);
        config.github.app_private_key = Some("/does/not/exist.pem".to_string());

        assert!(Exporter::new(config).is_err());
    }

    #[test]
    fn test_duration_gauge_follows_usage_toggle() {
        let mut config = Config::default();
        config.metrics.fetch_workflow_run_usage = false;

        let exporter = Exporter::new(config).unwrap();
        assert!(exporter.metrics.workflow_run_duration.is_none());
    }

    #[tokio::test]
    async fn test_metrics_served_during_startup_grace() {
        let mut config = Config::default();
        config.github.startup_grace = 3600;
        let exporter = Exporter::new(config).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(exporter.serve_until(listener, async move {
            let _ = stopped.await;
        }));

        let response = tokio::time::timeout(
            Duration::from_secs(5),
            reqwest::get(format!("http://{addr}/healthz")),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(response.status().is_success());

        stop.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
