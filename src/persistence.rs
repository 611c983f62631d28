//! Abstract persistence gateway consumed by the coordination core.
//!
//! Any transactional store can sit behind [`Persistence`]; the crate ships
//! [`crate::memory::MemoryPersistence`] for tests and single-process use.
//! Every mutation must be atomic against concurrent readers of the same row,
//! and lock operations must serialize per lock id.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{
    ExecutionPlan, Lock, LockFilter, PlanFilter, PlanId, Step, World, WorldFilter, WorldId,
};

/// The common persistence error.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict on {entity} {id}: stale version {stale}")]
    Conflict {
        entity: &'static str,
        id: String,
        stale: u64,
    },

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl PersistenceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Utility type alias for persistence results.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Outcome of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    HeldBy(WorldId),
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired)
    }
}

/// Outcome of a lock release attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotHeld,
    WrongOwner(WorldId),
}

/// Typed CRUD over plans, steps, locks and worlds.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync {
    fn clone_box(&self) -> Box<dyn Persistence>;

    // ------------------------------------------------------------------
    // Plans & steps
    // ------------------------------------------------------------------

    async fn load_plan(&self, id: PlanId) -> PersistenceResult<ExecutionPlan>;

    /// Persist a plan under optimistic concurrency. The stored version must
    /// match `plan.version`; on success the new version is returned.
    async fn save_plan(&self, plan: &ExecutionPlan) -> PersistenceResult<u64>;

    async fn delete_plans(&self, filter: &PlanFilter) -> PersistenceResult<usize>;

    async fn find_plans(&self, filter: &PlanFilter) -> PersistenceResult<Vec<ExecutionPlan>>;

    async fn load_step(&self, plan_id: PlanId, step_id: u64) -> PersistenceResult<Step>;

    async fn save_step(&self, plan_id: PlanId, step: &Step) -> PersistenceResult<()>;

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    /// Acquire a named lock. Re-acquiring a lock the owner already holds
    /// refreshes its payload and succeeds.
    async fn acquire(&self, lock: &Lock) -> PersistenceResult<AcquireOutcome>;

    /// Release a lock, verifying ownership when `expected_owner` is given.
    async fn release(
        &self,
        lock_id: &str,
        expected_owner: Option<WorldId>,
    ) -> PersistenceResult<ReleaseOutcome>;

    /// Atomically move a lock from one owner to another. Fails the transfer
    /// (returning the current holder) when `from` no longer owns the lock.
    async fn transfer(
        &self,
        lock_id: &str,
        from: WorldId,
        to: WorldId,
    ) -> PersistenceResult<AcquireOutcome>;

    async fn find_locks(&self, filter: &LockFilter) -> PersistenceResult<Vec<Lock>>;

    // ------------------------------------------------------------------
    // Worlds
    // ------------------------------------------------------------------

    async fn register_world(&self, world: &World) -> PersistenceResult<()>;

    async fn heartbeat_world(&self, id: WorldId, now: DateTime<Utc>) -> PersistenceResult<()>;

    async fn deregister_world(&self, id: WorldId) -> PersistenceResult<()>;

    async fn find_worlds(
        &self,
        filter: &WorldFilter,
        include_stale: bool,
        staleness: StalenessWindow,
    ) -> PersistenceResult<Vec<World>>;
}

impl Clone for Box<dyn Persistence> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Load, mutate and save a plan under optimistic concurrency.
///
/// A conflicting save (or a mutation rejected against a stale snapshot) is
/// retried once against a fresh load; a second failure propagates. Mutation
/// closures are expected to re-check plan state so a retry converges.
pub async fn update_plan<F>(
    store: &dyn Persistence,
    id: PlanId,
    mutate: F,
) -> PersistenceResult<ExecutionPlan>
where
    F: Fn(&mut ExecutionPlan) -> Result<(), crate::model::IllegalTransition> + Send,
{
    let mut retried = false;
    loop {
        let mut plan = store.load_plan(id).await?;
        match mutate(&mut plan) {
            Ok(()) => {}
            Err(_) if !retried => {
                retried = true;
                continue;
            }
            Err(err) => return Err(PersistenceError::Message(err.to_string())),
        }
        match store.save_plan(&plan).await {
            Ok(version) => {
                plan.version = version;
                return Ok(plan);
            }
            Err(err) if err.is_conflict() && !retried => {
                retried = true;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Staleness horizon applied by `find_worlds` when stale rows are excluded.
#[derive(Debug, Clone, Copy)]
pub struct StalenessWindow {
    pub now: DateTime<Utc>,
    pub timeout: chrono::Duration,
}

impl StalenessWindow {
    pub fn new(timeout: chrono::Duration) -> Self {
        Self {
            now: Utc::now(),
            timeout,
        }
    }
}
