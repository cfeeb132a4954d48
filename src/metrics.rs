//! Prometheus gauges published by the exporter.

use prometheus::{GaugeVec, Opts, Registry, TextEncoder};

use crate::error::Result;
use crate::fields::FieldSet;

pub const RUNNER_LABELS: [&str; 5] = [
    "repo_full_name",
    "runner_os",
    "runner_name",
    "runner_id",
    "runner_busy",
];

pub const ORGANIZATION_RUNNER_LABELS: [&str; 5] = [
    "organization_name",
    "runner_os",
    "runner_name",
    "runner_id",
    "runner_busy",
];

pub const WORKFLOW_USAGE_LABELS: [&str; 6] = [
    "repo",
    "workflow_id",
    "workflow_node_id",
    "workflow_name",
    "workflow_state",
    "os_type",
];

/// One label combination and its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub labels: Vec<String>,
    pub value: f64,
}

impl Series {
    pub fn new(labels: Vec<String>, value: f64) -> Self {
        Self { labels, value }
    }
}

/// Replaces every published combination of `gauge` with `series`.
///
/// The previous cycle's combinations are dropped first so that series which no
/// longer occur disappear instead of keeping their last value.
pub fn publish(gauge: &GaugeVec, series: &[Series]) {
    gauge.reset();
    for s in series {
        let labels: Vec<&str> = s.labels.iter().map(String::as_str).collect();
        gauge.with_label_values(&labels).set(s.value);
    }
}

/// Gauges of the exporter and the registry they are exposed through.
#[derive(Clone)]
pub struct ExporterMetrics {
    registry: Registry,
    pub runner_status: GaugeVec,
    pub organization_runner_status: GaugeVec,
    pub workflow_run_status: GaugeVec,
    /// Only registered when run timings are fetched
    pub workflow_run_duration: Option<GaugeVec>,
    pub workflow_usage: GaugeVec,
}

impl ExporterMetrics {
    /// Creates and registers every gauge.
    ///
    /// The run gauges use the configured label list, in order.
    pub fn new(run_fields: &FieldSet, with_run_duration: bool) -> Result<Self> {
        let registry = Registry::new();
        let run_labels = run_fields.label_names();

        let runner_status = GaugeVec::new(
            Opts::new(
                "github_runner_status",
                "runner status: 1 if online, 0 otherwise",
            ),
            &RUNNER_LABELS,
        )?;
        let organization_runner_status = GaugeVec::new(
            Opts::new(
                "github_runner_organization_status",
                "organization runner status: 1 if online, 0 otherwise",
            ),
            &ORGANIZATION_RUNNER_LABELS,
        )?;
        let workflow_run_status = GaugeVec::new(
            Opts::new(
                "github_workflow_run_status",
                "Workflow run status: 0 failure, 1 success, 2 skipped, 3 in progress, 4 queued, 5 cancelled, 6 neutral, 7 timed out, 8 other conclusion, 9 action required, 10 stale, 99 unknown",
            ),
            &run_labels,
        )?;
        let workflow_usage = GaugeVec::new(
            Opts::new(
                "github_workflow_usage_seconds",
                "Number of billable seconds used by a specific workflow during the current billing cycle",
            ),
            &WORKFLOW_USAGE_LABELS,
        )?;

        registry.register(Box::new(runner_status.clone()))?;
        registry.register(Box::new(organization_runner_status.clone()))?;
        registry.register(Box::new(workflow_run_status.clone()))?;
        registry.register(Box::new(workflow_usage.clone()))?;

        let workflow_run_duration = if with_run_duration {
            let gauge = GaugeVec::new(
                Opts::new(
                    "github_workflow_run_duration_ms",
                    "Workflow run duration in milliseconds, -1 when not computable",
                ),
                &run_labels,
            )?;
            registry.register(Box::new(gauge.clone()))?;
            Some(gauge)
        } else {
            None
        };

        Ok(Self {
            registry,
            runner_status,
            organization_runner_status,
            workflow_run_status,
            workflow_run_duration,
            workflow_usage,
        })
    }

    /// Renders every registered gauge in the text exposition format.
    pub fn gather(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        Ok(encoder.encode_to_string(&metric_families)?)
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;
    use prometheus::core::Collector;

    fn create_metrics() -> ExporterMetrics {
        ExporterMetrics::new(&FieldSet::parse("repo,status").unwrap(), true).unwrap()
    }

    fn series(repo: &str, status: &str, value: f64) -> Series {
        Series::new(vec![repo.to_string(), status.to_string()], value)
    }

    fn values(gauge: &GaugeVec) -> Vec<(Vec<String>, f64)> {
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

    #[test]
    fn test_publish_twice_equals_publish_once() {
        let metrics = create_metrics();
        let batch = vec![
            series("octo/app", "completed", 1.0),
            series("octo/lib", "in_progress", 3.0),
        ];

        publish(&metrics.workflow_run_status, &batch);
        let once = values(&metrics.workflow_run_status);
        publish(&metrics.workflow_run_status, &batch);
        let twice = values(&metrics.workflow_run_status);

        assert_eq!(once.len(), 2);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_publish_drops_previous_combinations() {
        let metrics = create_metrics();
        publish(
            &metrics.workflow_run_status,
            &[
                series("octo/app", "completed", 1.0),
                series("octo/lib", "in_progress", 3.0),
            ],
        );
        publish(
            &metrics.workflow_run_status,
            &[series("octo/lib", "completed", 0.0)],
        );

        assert_eq!(
            values(&metrics.workflow_run_status),
            vec![(vec!["octo/lib".to_string(), "completed".to_string()], 0.0)]
        );
    }

    #[test]
    fn test_gather_exposes_metric_names() {
        let metrics = create_metrics();
        publish(&metrics.workflow_run_status, &[series("octo/app", "queued", 4.0)]);
        publish(
            &metrics.workflow_usage,
            &[Series::new(
                ["octo/app", "1", "W_1", "CI", "active", "UBUNTU"]
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
                120.0,
            )],
        );

        let text = metrics.gather().unwrap();
        assert!(text.contains("github_workflow_run_status{repo=\"octo/app\",status=\"queued\"} 4"));
        assert!(text.contains("github_workflow_usage_seconds{"));
        assert!(text.contains("os_type=\"UBUNTU\""));
    }

    #[test]
    fn test_duration_gauge_is_optional() {
        let fields = FieldSet::default();
        assert!(ExporterMetrics::new(&fields, false)
            .unwrap()
            .workflow_run_duration
            .is_none());
        assert!(ExporterMetrics::new(&fields, true)
            .unwrap()
            .workflow_run_duration
            .is_some());
    }
}
