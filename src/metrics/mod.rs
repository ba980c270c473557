//! Prometheus metrics for bufmesh
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.
//! Useful for Grafana dashboards, alerts, and capacity planning.

use std::sync::Arc;

use prometheus::{IntCounter, IntGauge, Opts, Registry};

mod server;

pub use server::MetricsServer;

/// All bufmesh metrics in one place
pub struct Metrics {
    pub registry: Registry,

    // Cluster metrics
    pub view_changes_total: IntCounter,
    pub cluster_members_current: IntGauge,
    pub partition_suspected_total: IntCounter,

    // Replication metrics
    pub ops_broadcast_total: IntCounter,
    pub ops_applied_total: IntCounter,
    pub ops_stale_total: IntCounter,
    pub replicas_current: IntGauge,

    // Buffer directory metrics
    pub buffers_owned_current: IntGauge,
    pub buffer_bytes_current: IntGauge,
    pub buffers_purged_total: IntCounter,
    pub fetches_total: IntCounter,
    pub fetch_retries_total: IntCounter,
    pub fetch_failures_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();

        // Cluster metrics
        let view_changes_total = IntCounter::with_opts(Opts::new(
            "bufmesh_view_changes_total",
            "Total cluster view changes since startup",
        ))
        .unwrap();

        let cluster_members_current = IntGauge::with_opts(Opts::new(
            "bufmesh_cluster_members_current",
            "Current number of members in the cluster view",
        ))
        .unwrap();

        let partition_suspected_total = IntCounter::with_opts(Opts::new(
            "bufmesh_partition_suspected_total",
            "Total partition suspicion advisories raised",
        ))
        .unwrap();

        // Replication metrics
        let ops_broadcast_total = IntCounter::with_opts(Opts::new(
            "bufmesh_ops_broadcast_total",
            "Total replication operations broadcast to peers",
        ))
        .unwrap();

        let ops_applied_total = IntCounter::with_opts(Opts::new(
            "bufmesh_ops_applied_total",
            "Total peer-originated operations applied locally",
        ))
        .unwrap();

        let ops_stale_total = IntCounter::with_opts(Opts::new(
            "bufmesh_ops_stale_total",
            "Total peer-originated operations dropped as stale",
        ))
        .unwrap();

        let replicas_current = IntGauge::with_opts(Opts::new(
            "bufmesh_replicas_current",
            "Current number of replica keys known locally",
        ))
        .unwrap();

        // Buffer directory metrics
        let buffers_owned_current = IntGauge::with_opts(Opts::new(
            "bufmesh_buffers_owned_current",
            "Current number of buffers owned by this node",
        ))
        .unwrap();

        let buffer_bytes_current = IntGauge::with_opts(Opts::new(
            "bufmesh_buffer_bytes_current",
            "Current bytes of buffer payloads owned by this node",
        ))
        .unwrap();

        let buffers_purged_total = IntCounter::with_opts(Opts::new(
            "bufmesh_buffers_purged_total",
            "Total buffer references purged after their owner left the view",
        ))
        .unwrap();

        let fetches_total = IntCounter::with_opts(Opts::new(
            "bufmesh_fetches_total",
            "Total buffer fetch attempts",
        ))
        .unwrap();

        let fetch_retries_total = IntCounter::with_opts(Opts::new(
            "bufmesh_fetch_retries_total",
            "Total fetches retried against a re-resolved owner",
        ))
        .unwrap();

        let fetch_failures_total = IntCounter::with_opts(Opts::new(
            "bufmesh_fetch_failures_total",
            "Total fetches that failed after retry",
        ))
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(view_changes_total.clone()))
            .unwrap();
        registry
            .register(Box::new(cluster_members_current.clone()))
            .unwrap();
        registry
            .register(Box::new(partition_suspected_total.clone()))
            .unwrap();
        registry
            .register(Box::new(ops_broadcast_total.clone()))
            .unwrap();
        registry
            .register(Box::new(ops_applied_total.clone()))
            .unwrap();
        registry.register(Box::new(ops_stale_total.clone())).unwrap();
        registry
            .register(Box::new(replicas_current.clone()))
            .unwrap();
        registry
            .register(Box::new(buffers_owned_current.clone()))
            .unwrap();
        registry
            .register(Box::new(buffer_bytes_current.clone()))
            .unwrap();
        registry
            .register(Box::new(buffers_purged_total.clone()))
            .unwrap();
        registry.register(Box::new(fetches_total.clone())).unwrap();
        registry
            .register(Box::new(fetch_retries_total.clone()))
            .unwrap();
        registry
            .register(Box::new(fetch_failures_total.clone()))
            .unwrap();

        Arc::new(Metrics {
            registry,
            view_changes_total,
            cluster_members_current,
            partition_suspected_total,
            ops_broadcast_total,
            ops_applied_total,
            ops_stale_total,
            replicas_current,
            buffers_owned_current,
            buffer_bytes_current,
            buffers_purged_total,
            fetches_total,
            fetch_retries_total,
            fetch_failures_total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_instruments_registered() {
        let metrics = Metrics::new();
        metrics.view_changes_total.inc();
        metrics.cluster_members_current.set(3);
        metrics.fetches_total.inc();

        let families = metrics.registry.gather();
        assert_eq!(families.len(), 13);
        assert!(families
            .iter()
            .all(|f| f.get_name().starts_with("bufmesh_")));
    }
}
