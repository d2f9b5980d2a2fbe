//! # Multi-model routing
//!
//! [`InstanceRouter`] keeps one [`ServerHandle`] per model name, bringing
//! instances up on first use and stopping them when they are unloaded or
//! have sat idle for too long.

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;
use crate::config::RouterConfig;
use crate::core::WorkerHandle;
use crate::error::{RouteError, ServerError, SpawnError};
use crate::server::{HealthState, ServerHandle};
use crate::task::{Task, TaskId};

/// Brings up a server instance for a model.
///
/// Implementations load weights, build an [`Engine`](crate::Engine) and call
/// [`ServerHandle::spawn`]. The router guarantees at most one call in flight
/// per model.
#[async_trait]
pub trait InstanceSpawner: Send + Sync + 'static {
    async fn spawn(&self, model: &str) -> Result<ServerHandle, SpawnError>;
}

/// Lifecycle of a routed instance, as reported by [`InstanceRouter::models`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceState {
    Spawning,
    Ready,
    /// Unloaded; stopped by the next reaper pass once it has no work.
    Draining,
    /// Shutting down; the entry disappears once the instance has exited.
    Stopped,
}

type SpawnFuture = Shared<BoxFuture<'static, Result<ServerHandle, SpawnError>>>;

enum Lifecycle {
    Spawning(SpawnFuture),
    Ready(ServerHandle),
    Draining(ServerHandle),
    Stopped,
}

impl Lifecycle {
    fn state(&self) -> InstanceState {
        match self {
            Lifecycle::Spawning(_) => InstanceState::Spawning,
            Lifecycle::Ready(_) => InstanceState::Ready,
            Lifecycle::Draining(_) => InstanceState::Draining,
            Lifecycle::Stopped => InstanceState::Stopped,
        }
    }
}

struct Entry {
    /// Distinguishes this instance from a later one for the same model.
    id: Uuid,
    lifecycle: Lifecycle,
    last_used: Instant,
}

/// # InstanceRouter
///
/// Routes tasks to per-model server instances.
///
/// Concurrent requests for a model that is not loaded share one in-flight
/// spawn: the spawner runs exactly once and every waiter receives its
/// outcome, success or the same [`SpawnError`]. A failed spawn leaves no
/// trace, so the next request tries again. Requests for other models never
/// wait on it.
///
/// ## Usage
///
/// ```ignore
/// let router = Arc::new(InstanceRouter::new(spawner, RouterConfig::default()));
/// let reaper = router.start_reaper();
///
/// let (server, task_id) = router.route(task, "small").await?;
/// let result = server.await_result(task_id, timeout).await?;
/// ```
pub struct InstanceRouter<S: InstanceSpawner> {
    spawner: Arc<S>,
    config: RouterConfig,
    instances: Mutex<HashMap<String, Entry>>,
}

impl<S: InstanceSpawner> InstanceRouter<S> {
    pub fn new(spawner: S, config: RouterConfig) -> Self {
        Self {
            spawner: Arc::new(spawner),
            config,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Submits `task` to the instance serving `model`, spawning it if needed.
    ///
    /// An instance that stops between lookup and submission (the reaper got
    /// to it first) is replaced once.
    ///
    /// # Returns
    ///
    /// The instance the task was submitted to, for awaiting or streaming its
    /// results, and the task id.
    pub async fn route(&self, task: Task, model: &str) -> Result<(ServerHandle, TaskId), RouteError> {
        let server = self.instance(model).await?;
        match server.submit(task.clone()) {
            Err(ServerError::ShuttingDown) => {
                debug!(model, "instance stopped before submission, resolving again");
                let server = self.instance(model).await?;
                let task_id = server.submit(task)?;
                Ok((server, task_id))
            }
            submitted => Ok((server, submitted?)),
        }
    }

    /// Marks a ready instance as draining. Returns `false` if `model` has no
    /// ready instance.
    pub fn unload(&self, model: &str) -> bool {
        let mut instances = self.instances.lock();
        let Some(entry) = instances.get_mut(model) else {
            return false;
        };
        if let Lifecycle::Ready(server) = &entry.lifecycle {
            let server = server.clone();
            entry.lifecycle = Lifecycle::Draining(server);
            info!(model, "instance draining");
            return true;
        }
        false
    }

    /// Stops draining instances that have no work left, and ready instances
    /// unused for longer than the idle timeout.
    ///
    /// # Returns
    ///
    /// The models whose instances were stopped.
    pub async fn reap(&self, now: Instant) -> Vec<String> {
        let idle_timeout = self.config.idle_timeout;
        self.stop_where(|entry| match &entry.lifecycle {
            Lifecycle::Draining(server) => server.is_idle(),
            Lifecycle::Ready(server) => {
                now.saturating_duration_since(entry.last_used) > idle_timeout && server.is_idle()
            }
            _ => false,
        })
        .await
    }

    /// Stops every live instance.
    pub async fn shutdown(&self) -> Vec<String> {
        self.stop_where(|entry| matches!(entry.lifecycle, Lifecycle::Ready(_) | Lifecycle::Draining(_)))
            .await
    }

    /// Current state of each known model.
    pub fn models(&self) -> Vec<(String, InstanceState)> {
        let instances = self.instances.lock();
        let mut models: Vec<_> = instances
            .iter()
            .map(|(model, entry)| (model.clone(), entry.lifecycle.state()))
            .collect();
        models.sort_by(|a, b| a.0.cmp(&b.0));
        models
    }

    /// Runs [`reap`](Self::reap) every `reap_interval` until the returned
    /// handle is stopped or dropped.
    pub fn start_reaper(self: &Arc<Self>) -> Reaper {
        let router = Arc::clone(self);
        let period = self.config.reap_interval;
        let worker = WorkerHandle::new(move |shutdown, _notifier| {
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        now = interval.tick() => {
                            let stopped = router.reap(now).await;
                            if !stopped.is_empty() {
                                debug!(?stopped, "reaper pass");
                            }
                        }
                    }
                }
            })
        });
        Reaper { worker }
    }

    async fn instance(&self, model: &str) -> Result<ServerHandle, SpawnError> {
        let (id, spawning) = {
            let mut instances = self.instances.lock();
            let now = Instant::now();
            let live = match instances.get_mut(model) {
                Some(entry) => {
                    entry.last_used = now;
                    match &entry.lifecycle {
                        Lifecycle::Ready(server) if !is_down(server) => return Ok(server.clone()),
                        Lifecycle::Draining(server) if !is_down(server) => {
                            let server = server.clone();
                            entry.lifecycle = Lifecycle::Ready(server.clone());
                            info!(model, "draining instance back in use");
                            return Ok(server);
                        }
                        Lifecycle::Spawning(spawning) => Some((entry.id, spawning.clone())),
                        // Stopped or stopping; a fresh instance takes its place.
                        _ => None,
                    }
                }
                None => None,
            };
            match live {
                Some(live) => live,
                None => {
                    let id = Uuid::new_v4();
                    let spawning = self.start_spawn(model);
                    info!(model, instance = %id, "spawning instance");
                    instances.insert(
                        model.to_string(),
                        Entry {
                            id,
                            lifecycle: Lifecycle::Spawning(spawning.clone()),
                            last_used: now,
                        },
                    );
                    (id, spawning)
                }
            }
        };

        let result = spawning.await;

        let mut instances = self.instances.lock();
        let current = instances.get(model).is_some_and(|entry| entry.id == id);
        if current {
            match &result {
                Ok(server) => {
                    if let Some(entry) = instances.get_mut(model) {
                        if matches!(entry.lifecycle, Lifecycle::Spawning(_)) {
                            entry.lifecycle = Lifecycle::Ready(server.clone());
                            info!(model, instance = %id, "instance ready");
                        }
                    }
                }
                Err(e) => {
                    warn!(model, error = %e, "instance spawn failed");
                    instances.remove(model);
                }
            }
        }
        result
    }

    /// Runs the spawner in its own task, so the spawn completes even if every
    /// waiter goes away.
    fn start_spawn(&self, model: &str) -> SpawnFuture {
        let spawner = Arc::clone(&self.spawner);
        let name = model.to_string();
        let spawned = tokio::spawn(async move { spawner.spawn(&name).await });
        let model = model.to_string();
        async move {
            spawned.await.unwrap_or_else(|e| {
                Err(SpawnError {
                    model,
                    reason: format!("spawner task failed: {e}"),
                })
            })
        }
        .boxed()
        .shared()
    }

    async fn stop_where<P>(&self, mut predicate: P) -> Vec<String>
    where
        P: FnMut(&Entry) -> bool,
    {
        let stopping: Vec<(String, Uuid, ServerHandle)> = {
            let mut instances = self.instances.lock();
            let mut stopping = Vec::new();
            for (model, entry) in instances.iter_mut() {
                if !predicate(&*entry) {
                    continue;
                }
                if let Lifecycle::Ready(server) | Lifecycle::Draining(server) =
                    std::mem::replace(&mut entry.lifecycle, Lifecycle::Stopped)
                {
                    stopping.push((model.clone(), entry.id, server));
                }
            }
            stopping
        };

        for (model, _, server) in &stopping {
            info!(model, "stopping instance");
            server.shutdown();
        }
        for (_, _, server) in &stopping {
            server.join().await;
        }

        let mut instances = self.instances.lock();
        for (model, id, _) in &stopping {
            if instances.get(model).is_some_and(|entry| entry.id == *id) {
                instances.remove(model);
            }
        }
        stopping.into_iter().map(|(model, _, _)| model).collect()
    }
}

fn is_down(server: &ServerHandle) -> bool {
    matches!(server.health(), HealthState::ShuttingDown | HealthState::Stopped)
}

/// Handle to the background reaper started by
/// [`InstanceRouter::start_reaper`]. Dropping it stops the reaper.
pub struct Reaper {
    worker: WorkerHandle,
}

impl Reaper {
    pub fn stop(&self) {
        self.worker.shutdown();
    }

    pub async fn join(&self) {
        self.worker.join().await
    }
}
