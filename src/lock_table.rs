//! Typed operations over the durable lock table.
//!
//! All cross-world mutual exclusion flows through here. Operations are
//! serializable per lock id; the backing store records the observable lock
//! log consumed by the scenario tests.

use crate::model::{Lock, LockFilter, LockKind, WorldId};
use crate::persistence::{AcquireOutcome, Persistence, PersistenceResult, ReleaseOutcome};

#[derive(Clone)]
pub struct LockTable {
    persistence: Box<dyn Persistence>,
}

impl LockTable {
    pub fn new(persistence: Box<dyn Persistence>) -> Self {
        Self { persistence }
    }

    pub async fn acquire(&self, kind: LockKind, owner: WorldId) -> PersistenceResult<AcquireOutcome> {
        self.persistence.acquire(&Lock::new(kind, owner)).await
    }

    pub async fn release(
        &self,
        kind: &LockKind,
        expected_owner: Option<WorldId>,
    ) -> PersistenceResult<ReleaseOutcome> {
        self.release_id(&kind.lock_id(), expected_owner).await
    }

    pub async fn release_id(
        &self,
        lock_id: &str,
        expected_owner: Option<WorldId>,
    ) -> PersistenceResult<ReleaseOutcome> {
        self.persistence.release(lock_id, expected_owner).await
    }

    /// Hand a lock from one owner to another without an unlocked window.
    pub async fn transfer(
        &self,
        kind: &LockKind,
        from: WorldId,
        to: WorldId,
    ) -> PersistenceResult<AcquireOutcome> {
        self.persistence.transfer(&kind.lock_id(), from, to).await
    }

    pub async fn find(&self, filter: &LockFilter) -> PersistenceResult<Vec<Lock>> {
        self.persistence.find_locks(filter).await
    }

    /// Every lock a world holds, ordered by reclamation category
    /// (planning, execution, singleton, misc) and then id. The invalidator
    /// relies on this ordering for its deterministic lock log.
    pub async fn owned_by(&self, world: WorldId) -> PersistenceResult<Vec<Lock>> {
        let mut locks = self.find(&LockFilter::owned_by(world)).await?;
        locks.sort_by(|a, b| {
            a.kind
                .category()
                .cmp(&b.kind.category())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(locks)
    }

    /// The lock currently covering a plan, if any.
    pub async fn plan_lock(&self, plan: crate::model::PlanId) -> PersistenceResult<Option<Lock>> {
        let locks = self
            .find(&LockFilter::with_prefix(format!("execution-plan:{plan}")))
            .await?;
        Ok(locks.into_iter().next())
    }
}
