//! # Prometheus Metrics
//!
//! Operational metrics for one [`StateStore`](crate::store::StateStore).
//! Each store owns a dedicated [`prometheus::Registry`] so that several
//! stores in one process (tests, benches) never collide on metric names.
//! The embedding process decides how to expose them; [`EngineMetrics::encode`]
//! renders the Prometheus text format.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::error::{EngineError, EngineResult};

/// Metric handles for a store. Cheap to clone.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    /// Transitions made durable.
    pub commits_total: IntCounter,
    /// Transitions refused, labelled by error kind.
    pub rejections_total: IntCounterVec,
    /// Checkpoints finalized.
    pub checkpoints_total: IntCounter,
    /// Peer states adopted through `sync_from_peer`.
    pub peer_syncs_total: IntCounter,
    /// 1 while the store is in SAFE_MODE.
    pub safe_mode: IntGauge,
    /// Committed transitions since genesis.
    pub transition_count: IntGauge,
    /// Wall time of `commit_transaction`, in seconds.
    pub commit_latency_seconds: Histogram,
    /// Wall time of the last boot recovery, in seconds.
    pub recovery_duration_seconds: Histogram,
}

impl EngineMetrics {
    /// Create and register every metric.
    pub fn new() -> EngineResult<Self> {
        let registry = Registry::new_custom(Some("verity".into()), None)?;

        let commits_total = IntCounter::new("commits_total", "Transitions made durable")?;
        registry.register(Box::new(commits_total.clone()))?;

        let rejections_total = IntCounterVec::new(
            Opts::new("rejections_total", "Transitions refused by the store"),
            &["kind"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let checkpoints_total =
            IntCounter::new("checkpoints_total", "Checkpoints finalized by this store")?;
        registry.register(Box::new(checkpoints_total.clone()))?;

        let peer_syncs_total =
            IntCounter::new("peer_syncs_total", "Peer states adopted after root verification")?;
        registry.register(Box::new(peer_syncs_total.clone()))?;

        let safe_mode = IntGauge::new("safe_mode", "1 while the store refuses writes")?;
        registry.register(Box::new(safe_mode.clone()))?;

        let transition_count =
            IntGauge::new("transition_count", "Committed transitions since genesis")?;
        registry.register(Box::new(transition_count.clone()))?;

        let commit_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("commit_latency_seconds", "Durable commit latency in seconds")
                .buckets(vec![
                    0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1,
                ]),
        )?;
        registry.register(Box::new(commit_latency_seconds.clone()))?;

        let recovery_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("recovery_duration_seconds", "Boot recovery time in seconds")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.2, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(recovery_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            commits_total,
            rejections_total,
            checkpoints_total,
            peer_syncs_total,
            safe_mode,
            transition_count,
            commit_latency_seconds,
            recovery_duration_seconds,
        })
    }

    pub(crate) fn record_rejection(&self, error: &EngineError) {
        let kind = format!("{:?}", error.kind()).to_lowercase();
        self.rejections_total.with_label_values(&[kind.as_str()]).inc();
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode(&self) -> EngineResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| EngineError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_contains_prefixed_names() {
        let m = EngineMetrics::new().unwrap();
        m.commits_total.inc();
        m.record_rejection(&EngineError::SafeMode);
        let text = m.encode().unwrap();
        assert!(text.contains("verity_commits_total 1"));
        assert!(text.contains("verity_rejections_total{kind=\"rejected\"} 1"));
    }

    #[test]
    fn registries_are_independent() {
        let a = EngineMetrics::new().unwrap();
        let b = EngineMetrics::new().unwrap();
        a.commits_total.inc();
        assert_eq!(b.commits_total.get(), 0);
    }
}
