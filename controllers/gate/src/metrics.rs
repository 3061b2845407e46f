//! Prometheus metrics for the gate controller.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crds::WarmPoolState;

use crate::error::ControllerError;
use crate::reconciler::Disposition;
use crate::warm_pool::PoolTally;

const NAMESPACE: &str = "maroonedpods";

/// Kind label of `vmis_created_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmiKind {
    Dedicated,
    Pool,
}

impl VmiKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Dedicated => "dedicated",
            Self::Pool => "pool",
        }
    }
}

/// Collectors registered on a registry owned by this struct.
pub struct Metrics {
    registry: Registry,
    warm_pool_vmis: IntGaugeVec,
    reconcile_total: IntCounterVec,
    vmis_created_total: IntCounterVec,
    vmis_returned_total: IntCounter,
    queue_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None)?;

        let warm_pool_vmis = IntGaugeVec::new(
            Opts::new("warm_pool_vmis", "Pool VMIs grouped by warm pool state"),
            &["state"],
        )?;
        let reconcile_total = IntCounterVec::new(
            Opts::new("reconcile_total", "Pod reconciliations grouped by disposition"),
            &["disposition"],
        )?;
        let vmis_created_total = IntCounterVec::new(
            Opts::new("vmis_created_total", "VMIs created grouped by kind"),
            &["kind"],
        )?;
        let vmis_returned_total =
            IntCounter::new("vmis_returned_total", "Claimed VMIs returned to the warm pool")?;
        let queue_depth = IntGauge::new("queue_depth", "Pod keys waiting in the work queue")?;

        registry.register(Box::new(warm_pool_vmis.clone()))?;
        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(vmis_created_total.clone()))?;
        registry.register(Box::new(vmis_returned_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            warm_pool_vmis,
            reconcile_total,
            vmis_created_total,
            vmis_returned_total,
            queue_depth,
        })
    }

    pub fn record_pool(&self, tally: &PoolTally) {
        for (state, count) in [
            (WarmPoolState::Creating, tally.creating),
            (WarmPoolState::Available, tally.available),
            (WarmPoolState::Claimed, tally.claimed),
        ] {
            self.warm_pool_vmis
                .with_label_values(&[state.as_label()])
                .set(i64::try_from(count).unwrap_or(i64::MAX));
        }
    }

    pub fn record_disposition(&self, disposition: Disposition) {
        self.reconcile_total.with_label_values(&[disposition.as_str()]).inc();
    }

    pub fn record_vmi_created(&self, kind: VmiKind) {
        self.vmis_created_total.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn record_vmi_returned(&self) {
        self.vmis_returned_total.inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    /// Text exposition of every collector.
    pub fn render(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| ControllerError::InvalidConfig(format!("metrics are not UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_values() {
        let metrics = Metrics::new().unwrap();
        metrics.record_pool(&PoolTally {
            creating: 1,
            available: 2,
            claimed: 3,
            unrecognized: 0,
        });
        metrics.record_disposition(Disposition::BackOff);
        metrics.record_vmi_created(VmiKind::Dedicated);
        metrics.set_queue_depth(4);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"maroonedpods_warm_pool_vmis{state="claimed"} 3"#));
        assert!(text.contains(r#"maroonedpods_reconcile_total{disposition="backoff"} 1"#));
        assert!(text.contains(r#"maroonedpods_vmis_created_total{kind="dedicated"} 1"#));
        assert!(text.contains("maroonedpods_queue_depth 4"));
    }
}
