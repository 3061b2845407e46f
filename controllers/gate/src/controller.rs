//! Main controller implementation.
//!
//! `Controller` owns the reflectors, the gate engine and the HTTP endpoint,
//! and runs them until a shutdown signal arrives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{Api, Client};
use kube_runtime::reflector::{self, Store};
use kube_runtime::watcher;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crds::{MaroonedPodsConfig, VirtualMachineInstance};

use crate::backoff::ItemBackoff;
use crate::cluster::KubeClusterApi;
use crate::config::ControllerConfig;
use crate::engine::GateEngine;
use crate::error::ControllerError;
use crate::events::KubeEventPublisher;
use crate::http::{self, HttpState};
use crate::metrics::Metrics;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::store::{ConfigStore, NodeStore, PodStore, Stores, VmiStore};
use crate::warm_pool::WarmPoolManager;
use crate::watcher::{reflect, watch_configs, watch_pods};

pub struct Controller {
    config: ControllerConfig,
    engine: Arc<GateEngine>,
    metrics: Arc<Metrics>,
    pod_store: Store<Pod>,
    vmi_store: Store<VirtualMachineInstance>,
    node_store: Store<Node>,
    config_store: Store<MaroonedPodsConfig>,
    enqueue_all: Option<mpsc::Receiver<()>>,
    pod_watcher: JoinHandle<Result<(), ControllerError>>,
    vmi_watcher: JoinHandle<Result<(), ControllerError>>,
    node_watcher: JoinHandle<Result<(), ControllerError>>,
    config_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Connect to the cluster and start the reflectors.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing MaroonedPods controller");

        let client = Client::try_default().await?;

        let (pod_store, pod_writer) = reflector::store::<Pod>();
        let (vmi_store, vmi_writer) = reflector::store::<VirtualMachineInstance>();
        let (node_store, node_writer) = reflector::store::<Node>();
        let (config_store, config_writer) = reflector::store::<MaroonedPodsConfig>();

        let stores = Stores {
            pods: PodStore::new(pod_store.clone()),
            vmis: VmiStore::new(vmi_store.clone()),
            nodes: NodeStore::new(node_store.clone()),
            configs: ConfigStore::new(config_store.clone()),
        };

        let metrics = Arc::new(Metrics::new()?);
        let cluster = Arc::new(KubeClusterApi::new(client.clone()));
        let events = Arc::new(KubeEventPublisher::new(client.clone(), &config.controller_name));

        let reconciler = Reconciler::new(
            stores.clone(),
            cluster.clone(),
            events,
            metrics.clone(),
            config.join.clone(),
        );
        let pool_manager = WarmPoolManager::new(
            stores.clone(),
            cluster,
            metrics.clone(),
            config.pool_namespace.clone(),
            config.join.clone(),
        );
        let engine = Arc::new(GateEngine::new(
            reconciler,
            pool_manager,
            Arc::new(WorkQueue::new(ItemBackoff::default())),
            metrics.clone(),
            stores,
            config.pool_reconcile_interval,
        ));

        let (pulse_tx, pulse_rx) = mpsc::channel(1);

        let pod_watcher = tokio::spawn(watch_pods(Api::all(client.clone()), pod_writer, engine.clone()));
        let vmi_watcher = tokio::spawn(reflect(
            Api::<VirtualMachineInstance>::all(client.clone()),
            watcher::Config::default(),
            vmi_writer,
        ));
        let node_watcher = tokio::spawn(reflect(
            Api::<Node>::all(client.clone()),
            watcher::Config::default(),
            node_writer,
        ));
        let config_watcher = tokio::spawn(watch_configs(Api::all(client), config_writer, pulse_tx));

        Ok(Self {
            config,
            engine,
            metrics,
            pod_store,
            vmi_store,
            node_store,
            config_store,
            enqueue_all: Some(pulse_rx),
            pod_watcher,
            vmi_watcher,
            node_watcher,
            config_watcher,
        })
    }

    /// Wait for the caches, then run the engine until SIGINT or SIGTERM.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        self.wait_for_caches().await?;
        info!("Caches synced");

        let token = CancellationToken::new();
        let leader = Arc::new(AtomicBool::new(false));
        let http_server = tokio::spawn(http::serve(
            self.config.metrics_addr,
            HttpState {
                metrics: self.metrics.clone(),
                leader: leader.clone(),
            },
            token.clone(),
        ));

        let enqueue_all = self
            .enqueue_all
            .take()
            .ok_or_else(|| ControllerError::InvalidConfig("controller already ran".to_string()))?;
        self.engine.enqueue_all();
        let engine = tokio::spawn(self.engine.clone().run(
            token.clone(),
            self.config.worker_threads,
            enqueue_all,
        ));
        leader.store(true, Ordering::Release);
        info!("MaroonedPods controller running");

        let outcome = tokio::select! {
            () = shutdown_signal() => Ok(()),
            result = &mut self.pod_watcher => watcher_exit("Pod", result),
            result = &mut self.vmi_watcher => watcher_exit("VirtualMachineInstance", result),
            result = &mut self.node_watcher => watcher_exit("Node", result),
            result = &mut self.config_watcher => watcher_exit("MaroonedPodsConfig", result),
        };

        leader.store(false, Ordering::Release);
        token.cancel();
        if let Err(e) = engine.await {
            warn!("Gate engine task failed: {}", e);
        }
        match http_server.await {
            Ok(Err(e)) => e.log("HTTP server failed"),
            Err(e) => warn!("HTTP server task failed: {}", e),
            Ok(Ok(())) => {}
        }
        for handle in [&self.pod_watcher, &self.vmi_watcher, &self.node_watcher, &self.config_watcher] {
            handle.abort();
        }
        info!("MaroonedPods controller stopped");
        outcome
    }

    async fn wait_for_caches(&self) -> Result<(), ControllerError> {
        let synced = |kind: &str, e: reflector::store::WriterDropped| {
            ControllerError::Watch(format!("{kind} cache never synced: {e}"))
        };
        self.pod_store.wait_until_ready().await.map_err(|e| synced("Pod", e))?;
        self.vmi_store
            .wait_until_ready()
            .await
            .map_err(|e| synced("VirtualMachineInstance", e))?;
        self.node_store.wait_until_ready().await.map_err(|e| synced("Node", e))?;
        self.config_store
            .wait_until_ready()
            .await
            .map_err(|e| synced("MaroonedPodsConfig", e))?;
        Ok(())
    }
}

fn watcher_exit(
    kind: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    result.map_err(|e| ControllerError::Watch(format!("{kind} watcher panicked: {e}")))?
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}
