//! Consistency sweeps over worlds and locks.
//!
//! Run on executor startup and on demand. The world check gives a definite
//! verdict for every queried world; the lock check removes every lock that
//! no longer references a live owner or a resumable plan.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::error::CoordinationResult;
use crate::invalidator::{InvalidationOutcome, Invalidator};
use crate::lock_table::LockTable;
use crate::model::{Lock, LockFilter, LockKind, PlanResult, PlanState, WorldFilter, WorldId};
use crate::persistence::{Persistence, ReleaseOutcome};
use crate::registry::WorldRegistry;

/// Verdict for one world in a validity sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldValidity {
    Valid,
    /// Stale, but left in place (or its invalidation is already running
    /// elsewhere, or failed and will be retried).
    Invalid,
    Invalidated,
}

pub struct ValidityChecker {
    own_world_id: WorldId,
    persistence: Box<dyn Persistence>,
    locks: LockTable,
    registry: WorldRegistry,
}

impl ValidityChecker {
    pub fn new(
        own_world_id: WorldId,
        persistence: Box<dyn Persistence>,
        locks: LockTable,
        registry: WorldRegistry,
    ) -> Self {
        Self {
            own_world_id,
            persistence,
            locks,
            registry,
        }
    }

    /// Scan the registry and give every queried world a verdict. Stale
    /// worlds are invalidated through `invalidator` only when `invalidate`
    /// is set; a failed or already-running invalidation reports `Invalid`
    /// rather than hiding the world.
    pub async fn worlds_validity_check(
        &self,
        invalidate: bool,
        filter: &WorldFilter,
        invalidator: &Invalidator,
    ) -> CoordinationResult<HashMap<WorldId, WorldValidity>> {
        let now = chrono::Utc::now();
        let timeout = self.registry.validity_timeout();
        let mut verdicts = HashMap::new();

        for world in self.registry.find_worlds(filter, true).await? {
            if world.id == self.own_world_id || !world.is_stale(now, timeout) {
                verdicts.insert(world.id, WorldValidity::Valid);
                continue;
            }
            if !invalidate {
                verdicts.insert(world.id, WorldValidity::Invalid);
                continue;
            }
            let verdict = match invalidator.invalidate(&world).await {
                Ok(InvalidationOutcome::Completed(_)) => WorldValidity::Invalidated,
                Ok(InvalidationOutcome::AlreadyRunning) => WorldValidity::Invalid,
                Err(err) => {
                    warn!(world_id = %world.id, error = %err, "invalidation failed during validity check");
                    WorldValidity::Invalid
                }
            };
            verdicts.insert(world.id, verdict);
        }
        Ok(verdicts)
    }

    /// Release every orphaned lock and return what was removed.
    ///
    /// A lock is orphaned when its owner is no longer registered, or when a
    /// singleton-action lock references a plan that is gone or settled.
    pub async fn locks_validity_check(&self) -> CoordinationResult<Vec<Lock>> {
        let registered: HashSet<WorldId> = self
            .registry
            .find_worlds(&WorldFilter::default(), true)
            .await?
            .into_iter()
            .map(|w| w.id)
            .collect();

        let mut removed = Vec::new();
        for lock in self.locks.find(&LockFilter::default()).await? {
            let owner_missing = match lock.owner_world_id {
                None => true,
                Some(owner) => !registered.contains(&owner),
            };
            let orphaned = owner_missing || self.singleton_orphaned(&lock).await?;
            if !orphaned {
                continue;
            }
            match self
                .locks
                .release_id(&lock.id, lock.owner_world_id)
                .await?
            {
                ReleaseOutcome::Released => {
                    info!(lock_id = %lock.id, "released orphaned lock");
                    removed.push(lock);
                }
                // Raced with its owner or another sweep; nothing to reclaim.
                ReleaseOutcome::NotHeld | ReleaseOutcome::WrongOwner(_) => {}
            }
        }
        Ok(removed)
    }

    async fn singleton_orphaned(&self, lock: &Lock) -> CoordinationResult<bool> {
        let LockKind::SingletonAction { plan, .. } = &lock.kind else {
            return Ok(false);
        };
        let plan = match self.persistence.load_plan(*plan).await {
            Ok(plan) => plan,
            Err(err) if err.is_not_found() => return Ok(true),
            Err(err) => return Err(err.into()),
        };
        Ok(plan.state == PlanState::Stopped
            || (plan.state == PlanState::Paused
                && matches!(
                    plan.result,
                    PlanResult::Error | PlanResult::Warning | PlanResult::Success
                )))
    }
}
