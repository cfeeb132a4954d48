//! Periodic collectors.
//!
//! Every collector follows the same cycle: fetch from the API, derive series,
//! then publish them with [`crate::metrics::publish`]. Only the fetch and
//! derivation differ, so each collector implements [`Collector`] and the
//! ticking is shared in [`run_periodically`].

pub mod billing;
pub mod runners;
pub mod runs;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use prometheus::GaugeVec;
use tokio::time::MissedTickBehavior;

use crate::metrics::{publish, Series};

pub use billing::BillingCollector;
pub use runners::{OrganizationRunnerCollector, RepositoryRunnerCollector};
pub use runs::WorkflowRunCollector;

/// Series produced for one gauge during a cycle.
pub struct Publication {
    pub gauge: GaugeVec,
    pub series: Vec<Series>,
}

impl Publication {
    pub fn new(gauge: &GaugeVec, series: Vec<Series>) -> Self {
        Self {
            gauge: gauge.clone(),
            series,
        }
    }
}

pub trait Collector: Send + Sync + 'static {
    /// Name used in log lines.
    fn name(&self) -> &'static str;

    /// Fetches and derives one cycle's worth of series.
    ///
    /// Failures are logged and contained; whatever could be collected is
    /// returned.
    fn collect(&self) -> impl Future<Output = Vec<Publication>> + Send;
}

/// Runs one full cycle: collect, then replace the published series.
pub async fn run_once<C: Collector>(collector: &C) {
    info!("{}: starting collection cycle", collector.name());

    let publications = collector.collect().await;
    for publication in &publications {
        publish(&publication.gauge, &publication.series);
    }

    let total: usize = publications.iter().map(|p| p.series.len()).sum();
    info!("{}: finished collection cycle, {total} series", collector.name());
}

/// Runs `collector` every `interval`, starting immediately.
///
/// A cycle that overruns the interval delays the next one rather than
/// triggering catch-up cycles.
pub async fn run_periodically<C: Collector>(collector: Arc<C>, interval: Duration) {
    debug!("{} will refresh every {}s", collector.name(), interval.as_secs());

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        run_once(collector.as_ref()).await;
    }
}
