//! Per-process coordination facade.
//!
//! A `Coordinator` represents this process's world in the cluster. It:
//! - registers the world and keeps its heartbeat fresh
//! - listens for coordination messages and resumes handed-off plans
//! - runs the startup validity sweeps for executor worlds
//! - exposes invalidation, auto-execute and the validity checks
//!
//! Multiple coordinators can run against the same persistence backend to
//! form (or, in tests, simulate) a multi-world cluster.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::auto_execute::{AutoExecutor, ResumedPlan};
use crate::connector::{Connector, CoordinationMessage};
use crate::error::{CoordinationError, CoordinationResult};
use crate::executor::{Executor, InlineExecutor};
use crate::invalidator::{InvalidationOutcome, Invalidator};
use crate::lock_table::LockTable;
use crate::model::{Lock, LockFilter, LockKind, World, WorldFilter, WorldKind};
use crate::persistence::{AcquireOutcome, Persistence};
use crate::registry::WorldRegistry;
use crate::validity::{ValidityChecker, WorldValidity};

/// Configuration for a single coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub kind: WorldKind,

    /// Run the startup validity sweeps. `None` applies the kind default:
    /// enabled for executors, disabled for clients.
    pub auto_validity_check: Option<bool>,

    /// How long a heartbeat is trusted.
    pub validity_timeout: Duration,

    /// Heartbeat refresh interval.
    pub heartbeat_interval: Duration,

    /// Claim the delayed-dispatch role on startup.
    pub delayed_executor: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            kind: WorldKind::Executor,
            auto_validity_check: None,
            validity_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(20),
            delayed_executor: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn auto_validity_check_enabled(&self) -> bool {
        self.auto_validity_check
            .unwrap_or(self.kind == WorldKind::Executor)
    }

    fn validity_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.validity_timeout.as_millis() as i64)
    }
}

/// A world's coordinator handle.
pub struct Coordinator {
    config: CoordinatorConfig,
    world: World,
    persistence: Box<dyn Persistence>,
    locks: LockTable,
    registry: WorldRegistry,
    connector: Box<dyn Connector>,
    executor: Option<Box<dyn Executor>>,
    handles: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Create a coordinator. Executor worlds get the inline executor unless
    /// [`Coordinator::with_executor`] installs another one.
    pub fn new(
        config: CoordinatorConfig,
        persistence: Box<dyn Persistence>,
        connector: Box<dyn Connector>,
    ) -> Self {
        let world = World::new(config.kind);
        let executor: Option<Box<dyn Executor>> = match config.kind {
            WorldKind::Executor => Some(Box::new(InlineExecutor::new(
                world.id,
                persistence.clone(),
            ))),
            WorldKind::Client => None,
        };
        let locks = LockTable::new(persistence.clone());
        let registry = WorldRegistry::new(persistence.clone(), config.validity_timeout_chrono());
        Coordinator {
            config,
            world,
            persistence,
            locks,
            registry,
            connector,
            executor,
            handles: Vec::new(),
        }
    }

    pub fn with_executor(mut self, executor: Box<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn registry(&self) -> &WorldRegistry {
        &self.registry
    }

    /// Register the world, start background tasks and (for executors with
    /// auto checks enabled) sweep the cluster before announcing readiness.
    pub async fn start(&mut self) -> CoordinationResult<()> {
        self.registry.register(&self.world).await?;

        self.start_message_pump().await;
        self.start_heartbeat_task();

        if self.config.delayed_executor {
            let kind = LockKind::DelayedExecutor {
                world: self.world.id,
            };
            if let AcquireOutcome::HeldBy(holder) =
                self.locks.acquire(kind, self.world.id).await?
            {
                warn!(held_by = %holder, "delayed-executor role already claimed");
            }
        }

        if self.config.auto_validity_check_enabled() {
            self.worlds_validity_check(true, &WorldFilter::default())
                .await?;
            self.locks_validity_check().await?;
        }

        info!(
            world_id = %self.world.id,
            kind = self.world.kind.as_str(),
            "world ready"
        );
        Ok(())
    }

    async fn start_message_pump(&mut self) {
        let mut rx = self.connector.start_listening(self.world.id).await;
        let executor = self.executor.clone();
        let world_id = self.world.id;
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    CoordinationMessage::ResumeExecution { plan_id }
                    | CoordinationMessage::PlanReassigned { plan_id, .. } => {
                        let Some(executor) = executor.clone() else {
                            warn!(%plan_id, "received plan without a local executor");
                            continue;
                        };
                        tokio::spawn(async move {
                            if let Err(err) = executor.execute(plan_id).await {
                                error!(%plan_id, error = %err, "handed-off execution failed");
                            }
                        });
                    }
                    CoordinationMessage::Ping => {}
                }
            }
            info!(world_id = %world_id, "message pump stopped");
        });
        self.handles.push(handle);
    }

    fn start_heartbeat_task(&mut self) {
        let registry = self.registry.clone();
        let world_id = self.world.id;
        let interval = self.config.heartbeat_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = registry.heartbeat(world_id).await {
                    warn!(world_id = %world_id, error = %err, "heartbeat failed");
                }
            }
        });
        self.handles.push(handle);
    }

    /// Stop background tasks, surrender every held lock and deregister.
    pub async fn stop(&mut self) {
        info!(world_id = %self.world.id, "stopping world");

        for handle in self.handles.drain(..) {
            handle.abort();
        }
        if let Some(executor) = &self.executor {
            if let Err(err) = executor.terminate().await {
                warn!(error = %err, "executor termination failed");
            }
        }
        match self.locks.owned_by(self.world.id).await {
            Ok(owned) => {
                for lock in owned {
                    if let Err(err) = self.locks.release_id(&lock.id, Some(self.world.id)).await {
                        warn!(lock_id = %lock.id, error = %err, "failed to release lock on shutdown");
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to enumerate own locks on shutdown"),
        }
        if let Err(err) = self.registry.deregister(self.world.id).await {
            warn!(error = %err, "failed to deregister on shutdown");
        }
        self.connector.stop_listening(self.world.id).await;
    }

    fn invalidator(&self) -> Invalidator {
        Invalidator::new(
            self.world.clone(),
            self.persistence.clone(),
            self.locks.clone(),
            self.registry.clone(),
            self.connector.clone(),
            self.executor.clone(),
        )
    }

    fn validity_checker(&self) -> ValidityChecker {
        ValidityChecker::new(
            self.world.id,
            self.persistence.clone(),
            self.locks.clone(),
            self.registry.clone(),
        )
    }

    /// Declare another world dead and reclaim its resources.
    pub async fn invalidate(&self, target: &World) -> CoordinationResult<InvalidationOutcome> {
        self.invalidator().invalidate(target).await
    }

    /// Resume plans left without an owner, on this world's executor.
    pub async fn auto_execute(&self) -> CoordinationResult<Vec<ResumedPlan>> {
        let Some(executor) = self.executor.clone() else {
            return Err(CoordinationError::Executor(
                "auto-execute requires a local executor".to_string(),
            ));
        };
        AutoExecutor::new(
            self.world.clone(),
            self.persistence.clone(),
            self.locks.clone(),
            executor,
        )
        .auto_execute()
        .await
    }

    pub async fn worlds_validity_check(
        &self,
        invalidate: bool,
        filter: &WorldFilter,
    ) -> CoordinationResult<std::collections::HashMap<crate::model::WorldId, WorldValidity>> {
        self.validity_checker()
            .worlds_validity_check(invalidate, filter, &self.invalidator())
            .await
    }

    pub async fn locks_validity_check(&self) -> CoordinationResult<Vec<Lock>> {
        self.validity_checker().locks_validity_check().await
    }

    /// Alias for the lock sweep, matching the public client surface.
    pub async fn clean_orphaned_locks(&self) -> CoordinationResult<Vec<Lock>> {
        self.locks_validity_check().await
    }

    /// Current cluster counters, for diagnostics.
    pub async fn stats(&self) -> CoordinationResult<CoordinatorStats> {
        let worlds = self.registry.find_worlds(&WorldFilter::default(), true).await?;
        let locks = self.locks.find(&LockFilter::default()).await?;
        let own_locks = locks
            .iter()
            .filter(|l| l.owner_world_id == Some(self.world.id))
            .count();
        Ok(CoordinatorStats {
            worlds_registered: worlds.len(),
            locks_total: locks.len(),
            locks_held: own_locks,
        })
    }
}

/// Counters for one coordinator's view of the cluster.
#[derive(Debug, Clone)]
pub struct CoordinatorStats {
    pub worlds_registered: usize,
    pub locks_total: usize,
    pub locks_held: usize,
}
