//! Telemetry sink.
//!
//! A thin wrapper over the `metrics` facade, carried explicitly through
//! [`crate::StateInner`] rather than relying on the facade's global
//! recorder alone — components that emit telemetry take `&Analytics`
//! the same way they take `&Database`, so call sites are legible about
//! what they depend on.

use std::sync::Arc;

use metrics_exporter_prometheus::{PrometheusHandle, PrometheusBuilder};

/// Observability sink for the cache core, eviction, fsck, and migration
/// pipelines.
#[derive(Debug, Clone)]
pub struct Analytics {
    handle: Arc<PrometheusHandle>,
}

impl Analytics {
    /// Installs the process-wide Prometheus recorder and returns a handle
    /// for both emitting metrics and rendering `/metrics`.
    pub fn install() -> Self {
        let builder = PrometheusBuilder::new();
        let handle = builder
            .install_recorder()
            .expect("failed to install the Prometheus recorder");
        Self { handle: Arc::new(handle) }
    }

    /// Renders the current metrics in Prometheus exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    pub fn record_upstream_fetch(&self, kind: &'static str) {
        metrics::counter!("ncps_upstream_fetches_total", "kind" => kind).increment(1);
    }

    pub fn record_coalesced_wait(&self, kind: &'static str) {
        metrics::counter!("ncps_coalesced_waits_total", "kind" => kind).increment(1);
    }

    pub fn record_chunk_dedup(&self, is_new: bool) {
        let label = if is_new { "new" } else { "deduplicated" };
        metrics::counter!("ncps_chunks_total", "outcome" => label).increment(1);
    }

    pub fn record_eviction(&self, narfiles_evicted: u64, bytes_reclaimed: u64) {
        metrics::counter!("ncps_eviction_runs_total").increment(1);
        metrics::counter!("ncps_eviction_narfiles_total").increment(narfiles_evicted);
        metrics::counter!("ncps_eviction_bytes_reclaimed_total").increment(bytes_reclaimed);
    }

    pub fn record_fsck_issue(&self, class: &'static str, repaired: bool) {
        let outcome = if repaired { "repaired" } else { "found" };
        metrics::counter!("ncps_fsck_issues_total", "class" => class, "outcome" => outcome)
            .increment(1);
    }

    /// Records an uncaught panic from a background task, per the
    /// "trap panics at the task boundary" discipline: log, don't crash.
    pub fn record_task_panic(&self, task: &'static str) {
        metrics::counter!("ncps_task_panics_total", "task" => task).increment(1);
        tracing::error!(task, "background task panicked; task terminated, process continues");
    }
}
