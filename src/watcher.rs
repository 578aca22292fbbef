// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Resource watcher: shared caches and event fan-out.
//!
//! The watcher owns one list+watch cache per resource type (pods, nodes,
//! `NodeAssignmentGroup`s, `PodAssignmentRule`s, `ClusterPodAssignmentRule`s)
//! and routes every add/update/delete event to the registered controller
//! subscribers. Subscribers do nothing but enqueue into their work queues, so
//! dispatch stays synchronous on the watch task.
//!
//! Leadership gates the subscriber lists, not the caches: on leader gain the
//! elected controllers are registered and the node cache is resynced so every
//! node is observed once as an add; on leader loss the lists are cleared
//! while the caches keep running to serve the admission webhook.

use std::fmt::Debug;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context as _, Result};
use futures::{pin_mut, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, Lookup, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use serde::de::DeserializeOwned;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::ValetConfig;
use crate::constants::CACHE_SYNC_TIMEOUT_SECS;
use crate::context::{Context, Stores};
use crate::crd::{ClusterPodAssignmentRule, NodeAssignmentGroup, PodAssignmentRule};
use crate::reconcilers::nodeassignment::NodeAssignmentController;
use crate::reconcilers::packleft::PackLeftController;
use crate::reconcilers::podassignment::PodAssignmentController;

/// A controller that processes node events.
pub trait NodeController: Send + Sync {
    fn on_add_node(&self, node: &Node);
    fn on_update_node(&self, old: &Node, new: &Node);
    fn on_delete_node(&self, node: &Node);
}

/// A controller that processes `NodeAssignmentGroup` events.
pub trait NagController: Send + Sync {
    fn on_add_nag(&self, nag: &NodeAssignmentGroup);
    fn on_update_nag(&self, old: &NodeAssignmentGroup, new: &NodeAssignmentGroup);
    fn on_delete_nag(&self, nag: &NodeAssignmentGroup);
}

/// A controller that processes pod events.
pub trait PodController: Send + Sync {
    fn on_add_pod(&self, pod: &Pod);
    fn on_update_pod(&self, old: &Pod, new: &Pod);
    fn on_delete_pod(&self, pod: &Pod);
}

enum CacheEvent<K> {
    Add(K),
    Update(Arc<K>, K),
    Delete(K),
}

struct Writers {
    pods: Writer<Pod>,
    nodes: Writer<Node>,
    nags: Writer<NodeAssignmentGroup>,
    pars: Writer<PodAssignmentRule>,
    cpars: Writer<ClusterPodAssignmentRule>,
}

/// Shares the resource caches and fans events out to controllers.
pub struct ResourceWatcher {
    ctx: Arc<Context>,
    config: ValetConfig,

    node_controllers: RwLock<Vec<Arc<dyn NodeController>>>,
    nag_controllers: RwLock<Vec<Arc<dyn NagController>>>,
    pod_controllers: RwLock<Vec<Arc<dyn PodController>>>,

    nag_ctlr: Arc<NodeAssignmentController>,
    packleft_ctlr: Arc<PackLeftController>,
    pod_ctlr: Arc<PodAssignmentController>,

    writers: Mutex<Option<Writers>>,
}

impl ResourceWatcher {
    /// Build the caches, the shared context, and the controllers.
    #[must_use]
    pub fn new(client: Client, config: ValetConfig) -> Self {
        let (pods, pod_writer) = reflector::store();
        let (nodes, node_writer) = reflector::store();
        let (nags, nag_writer) = reflector::store();
        let (pars, par_writer) = reflector::store();
        let (cpars, cpar_writer) = reflector::store();

        let ctx = Arc::new(Context {
            client,
            stores: Stores {
                pods,
                nodes,
                nags,
                pars,
                cpars,
            },
        });

        let nag_ctlr = Arc::new(NodeAssignmentController::new(
            ctx.clone(),
            config.nag_controller.threadiness,
        ));
        let packleft_ctlr = Arc::new(PackLeftController::new(
            ctx.clone(),
            config.packleft_controller.threadiness,
        ));
        let pod_ctlr = Arc::new(PodAssignmentController::new(
            ctx.clone(),
            config.pod_controller.threadiness,
        ));

        Self {
            ctx,
            config,
            node_controllers: RwLock::new(Vec::new()),
            nag_controllers: RwLock::new(Vec::new()),
            pod_controllers: RwLock::new(Vec::new()),
            nag_ctlr,
            packleft_ctlr,
            pod_ctlr,
            writers: Mutex::new(Some(Writers {
                pods: pod_writer,
                nodes: node_writer,
                nags: nag_writer,
                pars: par_writer,
                cpars: cpar_writer,
            })),
        }
    }

    /// The shared context (client + caches).
    #[must_use]
    pub fn context(&self) -> Arc<Context> {
        self.ctx.clone()
    }

    /// Start the watch tasks and the enabled controllers' queue workers.
    ///
    /// Call [`wait_for_cache_sync`] afterwards before serving traffic.
    ///
    /// # Panics
    ///
    /// Panics if called twice; the store writers can only be consumed once.
    ///
    /// [`wait_for_cache_sync`]: ResourceWatcher::wait_for_cache_sync
    pub fn run(self: &Arc<Self>) {
        info!("Starting resource caches");
        let writers = self
            .writers
            .lock()
            .expect("writer state poisoned")
            .take()
            .expect("ResourceWatcher::run called twice");

        let client = self.ctx.client.clone();

        let rw = self.clone();
        spawn_watch(
            Api::<Pod>::all(client.clone()),
            writers.pods,
            self.ctx.stores.pods.clone(),
            move |ev| rw.dispatch_pod(&ev),
            "pod",
        );

        let rw = self.clone();
        spawn_watch(
            Api::<Node>::all(client.clone()),
            writers.nodes,
            self.ctx.stores.nodes.clone(),
            move |ev| rw.dispatch_node(&ev),
            "node",
        );

        let rw = self.clone();
        spawn_watch(
            Api::<NodeAssignmentGroup>::all(client.clone()),
            writers.nags,
            self.ctx.stores.nags.clone(),
            move |ev| rw.dispatch_nag(&ev),
            "nag",
        );

        // Rule caches feed the admission webhook directly; no subscribers
        spawn_watch(
            Api::<PodAssignmentRule>::all(client.clone()),
            writers.pars,
            self.ctx.stores.pars.clone(),
            |_| {},
            "par",
        );
        spawn_watch(
            Api::<ClusterPodAssignmentRule>::all(client),
            writers.cpars,
            self.ctx.stores.cpars.clone(),
            |_| {},
            "cpar",
        );

        if self.config.nag_controller.enabled {
            info!("Starting node assignment controller");
            self.nag_ctlr.run();
        }
        if self.config.packleft_controller.enabled {
            info!("Starting pack-left controller");
            self.packleft_ctlr.run();
        }
        if self.config.pod_controller.enabled {
            info!("Starting pod assignment controller");
            self.pod_ctlr.run();
        }
    }

    /// Block until every cache has completed its initial list.
    ///
    /// # Errors
    ///
    /// Returns an error when a cache fails to sync within the startup
    /// timeout; startup must abort in that case.
    pub async fn wait_for_cache_sync(&self) -> Result<()> {
        let deadline = Duration::from_secs(CACHE_SYNC_TIMEOUT_SECS);
        let stores = &self.ctx.stores;

        timeout(deadline, stores.pods.wait_until_ready())
            .await
            .context("timed out waiting for pod cache to sync")??;
        info!("pod cache has synced");
        timeout(deadline, stores.nodes.wait_until_ready())
            .await
            .context("timed out waiting for node cache to sync")??;
        info!("node cache has synced");
        timeout(deadline, stores.nags.wait_until_ready())
            .await
            .context("timed out waiting for nag cache to sync")??;
        info!("nag cache has synced");
        timeout(deadline, stores.pars.wait_until_ready())
            .await
            .context("timed out waiting for par cache to sync")??;
        info!("par cache has synced");
        timeout(deadline, stores.cpars.wait_until_ready())
            .await
            .context("timed out waiting for cpar cache to sync")??;
        info!("cpar cache has synced");

        Ok(())
    }

    /// Register the enabled controllers and resync the node cache.
    ///
    /// Called on leadership gain. The resync redelivers every cached node as
    /// an add so the reconcilers observe state they may have missed during
    /// the leader switch; all controllers are state-seeking, so this is safe.
    pub fn start_elected_components(&self) {
        info!("Starting elected components");

        if self.config.pod_controller.enabled {
            self.add_pod_controller(self.pod_ctlr.clone());
        }
        if self.config.nag_controller.enabled {
            self.add_node_controller(self.nag_ctlr.clone());
            self.add_nag_controller(self.nag_ctlr.clone());
        }
        if self.config.packleft_controller.enabled {
            self.add_node_controller(self.packleft_ctlr.clone());
            self.add_nag_controller(self.packleft_ctlr.clone());
            self.add_pod_controller(self.packleft_ctlr.clone());
        }

        let controllers = self.node_controllers.read().expect("subscriber lock");
        for node in self.ctx.stores.nodes.state() {
            for ctlr in controllers.iter() {
                ctlr.on_add_node(&node);
            }
        }
    }

    /// Clear every subscriber list.
    ///
    /// Called on leadership loss. The caches keep running so the admission
    /// webhook continues to serve from them.
    pub fn stop_elected_components(&self) {
        info!("Stopping elected components");
        self.node_controllers.write().expect("subscriber lock").clear();
        self.nag_controllers.write().expect("subscriber lock").clear();
        self.pod_controllers.write().expect("subscriber lock").clear();
    }

    fn add_node_controller(&self, controller: Arc<dyn NodeController>) {
        self.node_controllers
            .write()
            .expect("subscriber lock")
            .push(controller);
    }

    fn add_nag_controller(&self, controller: Arc<dyn NagController>) {
        self.nag_controllers
            .write()
            .expect("subscriber lock")
            .push(controller);
    }

    fn add_pod_controller(&self, controller: Arc<dyn PodController>) {
        self.pod_controllers
            .write()
            .expect("subscriber lock")
            .push(controller);
    }

    fn dispatch_node(&self, event: &CacheEvent<Node>) {
        let controllers = self.node_controllers.read().expect("subscriber lock");
        for ctlr in controllers.iter() {
            match event {
                CacheEvent::Add(node) => ctlr.on_add_node(node),
                CacheEvent::Update(old, new) => ctlr.on_update_node(old, new),
                CacheEvent::Delete(node) => ctlr.on_delete_node(node),
            }
        }
    }

    fn dispatch_nag(&self, event: &CacheEvent<NodeAssignmentGroup>) {
        let controllers = self.nag_controllers.read().expect("subscriber lock");
        for ctlr in controllers.iter() {
            match event {
                CacheEvent::Add(nag) => ctlr.on_add_nag(nag),
                CacheEvent::Update(old, new) => ctlr.on_update_nag(old, new),
                CacheEvent::Delete(nag) => ctlr.on_delete_nag(nag),
            }
        }
    }

    fn dispatch_pod(&self, event: &CacheEvent<Pod>) {
        let controllers = self.pod_controllers.read().expect("subscriber lock");
        for ctlr in controllers.iter() {
            match event {
                CacheEvent::Add(pod) => ctlr.on_add_pod(pod),
                CacheEvent::Update(old, new) => ctlr.on_update_pod(old, new),
                CacheEvent::Delete(pod) => ctlr.on_delete_pod(pod),
            }
        }
    }

    /// Shut down every controller queue.
    pub fn shutdown(&self) {
        self.stop_elected_components();
        self.nag_ctlr.shutdown();
        self.packleft_ctlr.shutdown();
        self.pod_ctlr.shutdown();
    }
}

/// Drive one resource watch forever: apply each event to the store writer,
/// then hand it to the dispatcher with the pre-event snapshot for updates.
fn spawn_watch<K, D>(
    api: Api<K>,
    mut writer: Writer<K>,
    store: Store<K>,
    dispatch: D,
    kind: &'static str,
) where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    D: Fn(CacheEvent<K>) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            info!("starting {kind} informer");
            let stream = watcher::watcher(api.clone(), watcher::Config::default()).default_backoff();
            pin_mut!(stream);
            loop {
                match stream.try_next().await {
                    Ok(Some(event)) => {
                        match &event {
                            Event::Apply(obj) | Event::InitApply(obj) => {
                                let old = store.get(&obj.to_object_ref(()));
                                writer.apply_watcher_event(&event);
                                match old {
                                    Some(old) => dispatch(CacheEvent::Update(old, obj.clone())),
                                    None => dispatch(CacheEvent::Add(obj.clone())),
                                }
                            }
                            Event::Delete(obj) => {
                                writer.apply_watcher_event(&event);
                                dispatch(CacheEvent::Delete(obj.clone()));
                            }
                            Event::Init | Event::InitDone => {
                                writer.apply_watcher_event(&event);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("{kind} watch error: {err}");
                    }
                }
            }
            warn!("{kind} watch stream ended; restarting");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}
