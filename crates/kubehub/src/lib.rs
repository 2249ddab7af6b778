//! Ditto kubehub: cluster plumbing for the replication engine.
//!
//! Watches one resource kind plus the namespaces, and drives a
//! [`Replicator`] from a single serialized event loop, so the engine never
//! needs locks. Also home to the shipped object ports (secrets in
//! [`secrets`], config maps in [`configmaps`]).

#![forbid(unsafe_code)]

pub mod configmaps;
pub mod secrets;

use std::fmt::Debug;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, ListParams, ObjectMeta},
    runtime::watcher::{self, Event},
    Client, Resource,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ditto_core::{AnnotationKeys, Meta};
use ditto_engine::{ActionError, ObjectActions, Replicator, ReplicatorOptions};

pub use configmaps::ConfigMapActions;
pub use secrets::SecretActions;

// Reuse a single kube client across controllers; TLS/config setup is costly.
static KUBE_CLIENT: tokio::sync::OnceCell<Client> = tokio::sync::OnceCell::const_new();

pub async fn get_kube_client() -> Result<Client> {
    KUBE_CLIENT
        .get_or_try_init(|| async { Client::try_default().await.map_err(anyhow::Error::from) })
        .await
        .map(Clone::clone)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Tunables shared by every controller this process runs.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Treat every source as allowing replication unless it explicitly
    /// disallows it.
    pub allow_all: bool,
    /// Period of the full local resync.
    pub resync: Duration,
    /// Prefix of the annotation vocabulary.
    pub prefix: String,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            allow_all: false,
            resync: Duration::from_secs(1800),
            prefix: ditto_core::DEFAULT_PREFIX.to_string(),
        }
    }
}

/// The engine's view of Kubernetes object metadata.
pub fn meta_view(meta: &ObjectMeta) -> Meta {
    Meta {
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        resource_version: meta.resource_version.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
    }
}

/// Kubernetes metadata for an engine-produced view.
pub fn object_meta(meta: Meta) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(meta.namespace),
        name: Some(meta.name),
        resource_version: (!meta.resource_version.is_empty()).then_some(meta.resource_version),
        annotations: Some(meta.annotations),
        labels: (!meta.labels.is_empty()).then_some(meta.labels),
        ..Default::default()
    }
}

/// Classifies client errors by how the engine reacts to them.
pub fn action_error(err: kube::Error) -> ActionError {
    match err {
        kube::Error::Api(response) if response.code == 409 => {
            ActionError::Conflict(response.to_string())
        }
        kube::Error::Api(response) if response.code == 404 => {
            ActionError::NotFound(response.to_string())
        }
        other => ActionError::Transport(other.to_string()),
    }
}

/// Raw watch deliveries, shared by the object and namespace watchers.
#[derive(Debug)]
pub enum WatchEvent<K> {
    Applied(K),
    Deleted(K),
    Restarted(Vec<K>),
}

/// Long-lived list+watch loop with exponential backoff. The kube watcher
/// re-lists on desync (410), which surfaces here as a `Restarted` batch.
/// Ends when the receiving side goes away.
pub async fn run_watch<K>(api: Api<K>, tx: mpsc::Sender<WatchEvent<K>>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let backoff_max = env_u64("DITTO_WATCH_BACKOFF_MAX_SECS", 30);
    let mut backoff: u64 = 1;
    loop {
        let stream = watcher::watcher(api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);
        let mut received = false;
        loop {
            match stream.try_next().await {
                Ok(Some(Event::Applied(object))) => {
                    received = true;
                    if tx.send(WatchEvent::Applied(object)).await.is_err() {
                        return;
                    }
                }
                Ok(Some(Event::Deleted(object))) => {
                    received = true;
                    if tx.send(WatchEvent::Deleted(object)).await.is_err() {
                        return;
                    }
                }
                Ok(Some(Event::Restarted(list))) => {
                    received = true;
                    debug!(count = list.len(), "watch listed");
                    if tx.send(WatchEvent::Restarted(list)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    warn!("watch stream ended");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "watch stream error; will backoff and restart");
                    counter!("watch_errors_total", 1u64);
                    break;
                }
            }
        }
        if received {
            backoff = 1;
        }
        tokio::time::sleep(Duration::from_secs(backoff.min(backoff_max))).await;
        backoff = (backoff * 2).min(backoff_max).max(1);
        counter!("watch_restarts_total", 1u64);
    }
}

/// A running controller: one engine plus its watch loops.
pub struct ReplicatorHandle {
    stop: oneshot::Sender<()>,
    synced: watch::Receiver<bool>,
    driver: JoinHandle<()>,
}

impl ReplicatorHandle {
    /// True once the initial object list has been applied.
    pub fn synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolves once the initial object list has been applied.
    pub async fn wait_synced(&mut self) {
        while !*self.synced.borrow() {
            if self.synced.changed().await.is_err() {
                return;
            }
        }
    }

    /// Signals the loops to stop; the in-flight handler finishes first.
    pub fn stop(self) -> JoinHandle<()> {
        let _ = self.stop.send(());
        self.driver
    }
}

/// Starts the secret replicator on the given client.
pub async fn spawn_secret_replicator(
    client: Client,
    options: ControllerOptions,
) -> Result<ReplicatorHandle> {
    let api = Api::all(client.clone());
    let actions = SecretActions::new(client.clone());
    spawn_controller("secret", client, api, actions, options).await
}

/// Starts the config map replicator on the given client.
pub async fn spawn_config_map_replicator(
    client: Client,
    options: ControllerOptions,
) -> Result<ReplicatorHandle> {
    let api = Api::all(client.clone());
    let actions = ConfigMapActions::new(client.clone());
    spawn_controller("config map", client, api, actions, options).await
}

async fn spawn_controller<K, A>(
    kind: &'static str,
    client: Client,
    api: Api<K>,
    actions: A,
    options: ControllerOptions,
) -> Result<ReplicatorHandle>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    A: ObjectActions<Object = K> + 'static,
{
    let mut engine_options = ReplicatorOptions::new(kind);
    engine_options.allow_all = options.allow_all;
    engine_options.keys = AnnotationKeys::with_prefix(&options.prefix);
    let mut repl = Replicator::new(actions, engine_options);

    // the namespace set must be complete before the first object pass, or
    // pushes would be wrongly deferred
    let namespaces: Api<Namespace> = Api::all(client);
    let initial = namespaces
        .list(&ListParams::default())
        .await
        .context("listing namespaces")?;
    repl.seed_namespaces(initial.items.iter().filter_map(|ns| ns.metadata.name.clone()));

    let cap = env_usize("DITTO_QUEUE_CAP", 1024);
    let (object_tx, mut object_rx) = mpsc::channel::<WatchEvent<K>>(cap);
    let (namespace_tx, mut namespace_rx) = mpsc::channel::<WatchEvent<Namespace>>(cap);
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let (synced_tx, synced_rx) = watch::channel(false);

    let object_watch = tokio::spawn(run_watch(api, object_tx));
    let namespace_watch = tokio::spawn(run_watch(namespaces, namespace_tx));

    let resync = options.resync;
    let driver = tokio::spawn(async move {
        info!(kind, "controller starting");
        let mut ticker = tokio::time::interval(resync);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first interval tick fires immediately; consume it
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    info!(kind, "stopping controller");
                    break;
                }
                event = object_rx.recv() => match event {
                    None => break,
                    Some(WatchEvent::Applied(object)) => repl.object_added(object).await,
                    Some(WatchEvent::Deleted(object)) => repl.object_deleted(object).await,
                    Some(WatchEvent::Restarted(list)) => {
                        repl.objects_relisted(list).await;
                        let _ = synced_tx.send(true);
                    }
                },
                event = namespace_rx.recv() => match event {
                    None => break,
                    Some(WatchEvent::Applied(ns)) => {
                        if let Some(name) = ns.metadata.name.as_deref() {
                            repl.namespace_added(name).await;
                        }
                    }
                    Some(WatchEvent::Deleted(ns)) => {
                        if let Some(name) = ns.metadata.name.as_deref() {
                            repl.namespace_deleted(name);
                        }
                    }
                    Some(WatchEvent::Restarted(list)) => {
                        repl.namespaces_relisted(
                            list.iter().filter_map(|ns| ns.metadata.name.clone()).collect(),
                        )
                        .await;
                    }
                },
                _ = ticker.tick() => {
                    debug!(kind, "resync");
                    repl.resync().await;
                }
            }
        }
        object_watch.abort();
        namespace_watch.abort();
    });

    Ok(ReplicatorHandle {
        stop: stop_tx,
        synced: synced_rx,
        driver,
    })
}
