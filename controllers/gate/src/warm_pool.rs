//! Warm pool manager.
//!
//! Pool state lives in VMI labels. Every tick re-derives the pool from the
//! VMI cache, promotes booted VMIs, publishes counts on the config status
//! and grows or trims the pool towards `spec.warmPoolSize`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crds::{MaroonedPodsConfig, MaroonedPodsConfigStatus, VirtualMachineInstance, WarmPoolState};

use crate::cluster::ClusterApi;
use crate::config::JoinConfig;
use crate::error::ControllerError;
use crate::metrics::{Metrics, VmiKind};
use crate::patches;
use crate::reconciler::claim::return_to_pool;
use crate::sizing::VmDefaults;
use crate::store::Stores;
use crate::vmi_builder::{generate_pool_vmi_name, pool_vmi};

/// Pool VMIs by state label. `unrecognized` counts labels outside the known states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolTally {
    pub creating: usize,
    pub available: usize,
    pub claimed: usize,
    pub unrecognized: usize,
}

impl PoolTally {
    /// Unclaimed VMIs, the ones counting towards the desired size.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.creating + self.available
    }

    fn status(&self) -> MaroonedPodsConfigStatus {
        let count = |n: usize| i32::try_from(n).unwrap_or(i32::MAX);
        MaroonedPodsConfigStatus {
            warm_pool_total: count(self.total()),
            warm_pool_available: count(self.available),
            warm_pool_claimed: count(self.claimed),
            last_pool_update: Some(Utc::now()),
        }
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub tally: PoolTally,
    pub promoted: usize,
    pub created: usize,
    pub create_failed: usize,
    pub deleted: usize,
    pub reclaimed: usize,
    pub status_written: bool,
}

pub struct WarmPoolManager {
    stores: Stores,
    cluster: Arc<dyn ClusterApi>,
    metrics: Arc<Metrics>,
    pool_namespace: String,
    join: JoinConfig,
}

impl WarmPoolManager {
    #[must_use]
    pub fn new(
        stores: Stores,
        cluster: Arc<dyn ClusterApi>,
        metrics: Arc<Metrics>,
        pool_namespace: String,
        join: JoinConfig,
    ) -> Self {
        Self {
            stores,
            cluster,
            metrics,
            pool_namespace,
            join,
        }
    }

    /// Tick every `interval` until `token` is cancelled.
    pub async fn run(&self, interval: Duration, token: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Starting warm pool manager");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.reconcile().await;
                }
            }
        }
        info!("Warm pool manager stopped");
    }

    /// One pass over the pool. Write failures are logged and counted; the
    /// rest of the pass still runs and the next tick starts from a fresh scan.
    pub async fn reconcile(&self) -> PoolReport {
        let config = self.stores.configs.active();
        let members = self.stores.vmis.pool_members();
        let mut report = PoolReport::default();

        let desired = config.as_ref().map_or(0, |config| config.spec.warm_pool_size);
        let Some(config) = config.filter(|_| desired > 0) else {
            report.tally = tally(&members);
            self.metrics.record_pool(&report.tally);
            debug!("Warm pool disabled");
            return report;
        };
        let defaults = VmDefaults::from_config(Some(&*config));

        let mut available = Vec::new();
        let mut claimed = Vec::new();
        for vmi in &members {
            match vmi.pool_state() {
                Some(WarmPoolState::Creating) => match self.try_promote(vmi).await {
                    Some(promoted) => {
                        report.promoted += 1;
                        report.tally.available += 1;
                        available.push(promoted);
                    }
                    None => report.tally.creating += 1,
                },
                Some(WarmPoolState::Available) => {
                    report.tally.available += 1;
                    available.push(Arc::clone(vmi));
                }
                Some(WarmPoolState::Claimed) => {
                    report.tally.claimed += 1;
                    claimed.push(vmi);
                }
                None => report.tally.unrecognized += 1,
            }
        }
        if report.tally.unrecognized > 0 {
            warn!(count = report.tally.unrecognized, "Pool VMIs with an unknown state label");
        }
        self.metrics.record_pool(&report.tally);

        report.status_written = match self.publish_status(&config, &report.tally).await {
            Ok(written) => written,
            Err(e) => {
                e.log("Failed to update pool status");
                false
            }
        };

        let desired = usize::try_from(desired).unwrap_or(usize::MAX);
        let total = report.tally.total();
        if total < desired {
            (report.created, report.create_failed) = self.grow(desired - total, &defaults).await;
        }
        if report.tally.available > desired {
            report.deleted = self.trim(&available, report.tally.available - desired).await;
        }
        report.reclaimed = self.reclaim_orphans(&claimed, &defaults).await;

        info!(
            creating = report.tally.creating,
            available = report.tally.available,
            claimed = report.tally.claimed,
            desired,
            created = report.created,
            create_failed = report.create_failed,
            deleted = report.deleted,
            reclaimed = report.reclaimed,
            "Warm pool reconciled"
        );
        report
    }

    /// Relabel a creating VMI as available once it runs and its node
    /// registered. Returns the VMI as stored after the relabel.
    async fn try_promote(&self, vmi: &VirtualMachineInstance) -> Option<Arc<VirtualMachineInstance>> {
        let (Some(namespace), Some(name)) = (vmi.metadata.namespace.as_deref(), vmi.metadata.name.as_deref()) else {
            return None;
        };
        if !vmi.is_running() || self.stores.nodes.get(name).is_none() {
            return None;
        }
        let patch = patches::promote_vmi(vmi.metadata.resource_version.as_deref());
        match self.cluster.patch_vmi(namespace, name, &patch).await {
            Ok(promoted) => {
                info!(vmi = name, "Promoted pool VMI to available");
                Some(Arc::new(promoted))
            }
            Err(e) => {
                e.log(&format!("Failed to promote pool VMI {name}"));
                None
            }
        }
    }

    async fn publish_status(&self, config: &MaroonedPodsConfig, tally: &PoolTally) -> Result<bool, ControllerError> {
        let status = tally.status();
        let current = config.status.clone().unwrap_or_default();
        if !status.counts_differ(&current) {
            return Ok(false);
        }
        let Some(name) = config.metadata.name.as_deref() else {
            return Ok(false);
        };
        self.cluster
            .patch_config_status(name, &patches::config_status(&status)?)
            .await?;
        debug!(config = name, total = status.warm_pool_total, "Updated pool status");
        Ok(true)
    }

    /// Create up to `count` pool VMIs. Returns `(created, failed)`.
    async fn grow(&self, count: usize, defaults: &VmDefaults) -> (usize, usize) {
        let (mut created, mut failed) = (0, 0);
        for _ in 0..count {
            let name = generate_pool_vmi_name();
            let vmi = pool_vmi(&self.pool_namespace, &name, defaults, &self.join);
            match self.cluster.create_vmi(&vmi).await {
                Ok(_) => {
                    info!(vmi = %name, namespace = %self.pool_namespace, "Created pool VMI");
                    self.metrics.record_vmi_created(VmiKind::Pool);
                    created += 1;
                }
                Err(e) if e.is_conflict() => debug!(vmi = %name, "Pool VMI name already taken"),
                Err(e) => {
                    e.log(&format!("Failed to create pool VMI {name}"));
                    failed += 1;
                }
            }
        }
        (created, failed)
    }

    /// Delete the last `count` available VMIs by name. Each delete is pinned to
    /// the cached resourceVersion, so a VMI claimed since the scan survives.
    async fn trim(&self, available: &[Arc<VirtualMachineInstance>], count: usize) -> usize {
        let mut deleted = 0;
        for vmi in available.iter().rev().take(count) {
            let (Some(namespace), Some(name)) = (vmi.metadata.namespace.as_deref(), vmi.metadata.name.as_deref())
            else {
                continue;
            };
            match self
                .cluster
                .delete_vmi(namespace, name, vmi.metadata.resource_version.as_deref())
                .await
            {
                Ok(()) => {
                    info!(vmi = name, "Trimmed pool VMI");
                    deleted += 1;
                }
                Err(e) => e.log(&format!("Failed to trim pool VMI {name}")),
            }
        }
        deleted
    }

    /// Return claimed VMIs whose pod is gone from the cache.
    async fn reclaim_orphans(&self, claimed: &[&Arc<VirtualMachineInstance>], defaults: &VmDefaults) -> usize {
        let mut reclaimed = 0;
        for vmi in claimed {
            let Some((namespace, name)) = vmi.claimed_by().and_then(|key| key.split_once('/')) else {
                continue;
            };
            if self.stores.pods.get(namespace, name).is_some() {
                continue;
            }
            match return_to_pool(
                self.cluster.as_ref(),
                &self.stores.nodes,
                &self.metrics,
                vmi,
                &defaults.taint_key,
            )
            .await
            {
                Ok(()) => reclaimed += 1,
                Err(e) => e.log("Failed to reclaim orphaned pool VMI"),
            }
        }
        reclaimed
    }
}

/// Count pool VMIs by state label without promoting anything.
#[must_use]
pub fn tally(members: &[Arc<VirtualMachineInstance>]) -> PoolTally {
    members.iter().fold(PoolTally::default(), |mut tally, vmi| {
        match vmi.pool_state() {
            Some(WarmPoolState::Creating) => tally.creating += 1,
            Some(WarmPoolState::Available) => tally.available += 1,
            Some(WarmPoolState::Claimed) => tally.claimed += 1,
            None => tally.unrecognized += 1,
        }
        tally
    })
}
