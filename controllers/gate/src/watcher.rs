//! Kubernetes resource watchers.
//!
//! Each watcher feeds a reflector store the engine reads from. Pod events are
//! also forwarded to the engine, and config changes pulse an enqueue-all.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Resource};
use kube_runtime::reflector::{self, store::Writer};
use kube_runtime::{WatchStreamExt, watcher};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crds::MaroonedPodsConfig;
use crds::labels::MAROON_LABEL;

use crate::engine::GateEngine;
use crate::error::ControllerError;

/// Pods opted in to marooning.
#[must_use]
pub fn pod_watch_config() -> watcher::Config {
    watcher::Config::default().labels(MAROON_LABEL)
}

/// Keep `writer`'s store in sync with `api`. Stream errors are retried with
/// backoff; the future only returns if the stream ends.
pub async fn reflect<K>(api: Api<K>, config: watcher::Config, writer: Writer<K>) -> Result<(), ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    let kind = K::kind(&K::DynamicType::default()).into_owned();
    info!("Starting {} watcher", kind);

    let mut stream = reflector::reflector(writer, watcher(api, config)).default_backoff().boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::InitDone) => debug!("{} watcher initialization complete", kind),
            Ok(_) => {}
            Err(e) => warn!("{} watch stream error: {}", kind, e),
        }
    }
    Err(ControllerError::Watch(format!("{kind} watch stream ended")))
}

/// Reflect marooned pods and hand every change to the engine.
pub async fn watch_pods(api: Api<Pod>, writer: Writer<Pod>, engine: Arc<GateEngine>) -> Result<(), ControllerError> {
    info!("Starting Pod watcher");

    let mut stream = reflector::reflector(writer, watcher(api, pod_watch_config()))
        .default_backoff()
        .boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod)) => engine.on_pod_applied(&pod),
            Ok(watcher::Event::Delete(pod)) => {
                debug!("Pod deleted: {}", pod.metadata.name.as_deref().unwrap_or("<unknown>"));
                engine.on_pod_deleted(&pod).await;
            }
            Ok(watcher::Event::Init) => debug!("Pod watcher initialized"),
            Ok(watcher::Event::InitDone) => info!("Pod watcher initialization complete"),
            Err(e) => warn!("Pod watch stream error: {}", e),
        }
    }
    Err(ControllerError::Watch("Pod watch stream ended".to_string()))
}

/// Reflect `MaroonedPodsConfig` and pulse `enqueue_all` on every change, so
/// gated pods are re-evaluated against the new settings.
pub async fn watch_configs(
    api: Api<MaroonedPodsConfig>,
    writer: Writer<MaroonedPodsConfig>,
    enqueue_all: mpsc::Sender<()>,
) -> Result<(), ControllerError> {
    info!("Starting MaroonedPodsConfig watcher");

    let mut stream = reflector::reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(config) | watcher::Event::Delete(config)) => {
                debug!(
                    "MaroonedPodsConfig changed: {}",
                    config.metadata.name.as_deref().unwrap_or("<unknown>")
                );
                // A pulse already pending covers this change too.
                let _ = enqueue_all.try_send(());
            }
            Ok(_) => {}
            Err(e) => warn!("MaroonedPodsConfig watch stream error: {}", e),
        }
    }
    Err(ControllerError::Watch("MaroonedPodsConfig watch stream ended".to_string()))
}
