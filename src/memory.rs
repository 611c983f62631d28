//! In-memory persistence used by tests and single-process deployments.
//!
//! Each table is a mutex-guarded map, which gives the per-row atomicity the
//! gateway contract requires and serializes lock operations per id. The
//! instance also records an observable lock log (`lock <id>` / `unlock <id>`
//! in operation order) that the scenario tests assert against.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::model::{
    ExecutionPlan, Lock, LockFilter, PlanFilter, PlanId, Step, World, WorldFilter, WorldId,
};
use crate::persistence::{
    AcquireOutcome, Persistence, PersistenceError, PersistenceResult, ReleaseOutcome,
    StalenessWindow,
};

#[derive(Clone, Default)]
pub struct MemoryPersistence {
    plans: Arc<Mutex<HashMap<PlanId, ExecutionPlan>>>,
    locks: Arc<Mutex<HashMap<String, Lock>>>,
    worlds: Arc<Mutex<HashMap<WorldId, World>>>,
    lock_log: Arc<Mutex<Vec<String>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire/release history in operation order.
    pub fn lock_log(&self) -> Vec<String> {
        self.lock_log.lock().expect("lock log poisoned").clone()
    }

    pub fn clear_lock_log(&self) {
        self.lock_log.lock().expect("lock log poisoned").clear();
    }

    fn log(&self, entry: String) {
        self.lock_log.lock().expect("lock log poisoned").push(entry);
    }

    /// Seed a plan directly, bypassing version checks. Test setup only.
    pub fn insert_plan(&self, plan: ExecutionPlan) {
        let mut plans = self.plans.lock().expect("plans poisoned");
        plans.insert(plan.id, plan);
    }
}

#[async_trait::async_trait]
impl Persistence for MemoryPersistence {
    fn clone_box(&self) -> Box<dyn Persistence> {
        Box::new(self.clone())
    }

    async fn load_plan(&self, id: PlanId) -> PersistenceResult<ExecutionPlan> {
        let plans = self.plans.lock().expect("plans poisoned");
        plans
            .get(&id)
            .cloned()
            .ok_or_else(|| PersistenceError::not_found("plan", id))
    }

    async fn save_plan(&self, plan: &ExecutionPlan) -> PersistenceResult<u64> {
        let mut plans = self.plans.lock().expect("plans poisoned");
        if let Some(stored) = plans.get(&plan.id) {
            if stored.version != plan.version {
                return Err(PersistenceError::Conflict {
                    entity: "plan",
                    id: plan.id.to_string(),
                    stale: plan.version,
                });
            }
        }
        let mut next = plan.clone();
        next.version = plan.version + 1;
        let version = next.version;
        plans.insert(next.id, next);
        Ok(version)
    }

    async fn delete_plans(&self, filter: &PlanFilter) -> PersistenceResult<usize> {
        let mut plans = self.plans.lock().expect("plans poisoned");
        let before = plans.len();
        plans.retain(|_, plan| !filter.matches(plan));
        Ok(before - plans.len())
    }

    async fn find_plans(&self, filter: &PlanFilter) -> PersistenceResult<Vec<ExecutionPlan>> {
        let plans = self.plans.lock().expect("plans poisoned");
        let mut found: Vec<ExecutionPlan> =
            plans.values().filter(|p| filter.matches(p)).cloned().collect();
        found.sort_by_key(|p| p.id.to_string());
        Ok(found)
    }

    async fn load_step(&self, plan_id: PlanId, step_id: u64) -> PersistenceResult<Step> {
        let plans = self.plans.lock().expect("plans poisoned");
        let plan = plans
            .get(&plan_id)
            .ok_or_else(|| PersistenceError::not_found("plan", plan_id))?;
        plan.steps
            .get(&step_id)
            .cloned()
            .ok_or_else(|| PersistenceError::not_found("step", step_id))
    }

    async fn save_step(&self, plan_id: PlanId, step: &Step) -> PersistenceResult<()> {
        let mut plans = self.plans.lock().expect("plans poisoned");
        let plan = plans
            .get_mut(&plan_id)
            .ok_or_else(|| PersistenceError::not_found("plan", plan_id))?;
        plan.steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn acquire(&self, lock: &Lock) -> PersistenceResult<AcquireOutcome> {
        let mut locks = self.locks.lock().expect("locks poisoned");
        let current_owner = locks.get(&lock.id).map(|held| held.owner_world_id);
        match current_owner {
            Some(Some(owner)) if Some(owner) != lock.owner_world_id => {
                Ok(AcquireOutcome::HeldBy(owner))
            }
            // Same owner refreshes the payload without a new log entry.
            Some(_) => {
                locks.insert(lock.id.clone(), lock.clone());
                Ok(AcquireOutcome::Acquired)
            }
            None => {
                locks.insert(lock.id.clone(), lock.clone());
                drop(locks);
                self.log(format!("lock {}", lock.id));
                Ok(AcquireOutcome::Acquired)
            }
        }
    }

    async fn release(
        &self,
        lock_id: &str,
        expected_owner: Option<WorldId>,
    ) -> PersistenceResult<ReleaseOutcome> {
        let mut locks = self.locks.lock().expect("locks poisoned");
        let Some(held) = locks.get(lock_id) else {
            return Ok(ReleaseOutcome::NotHeld);
        };
        if let Some(expected) = expected_owner {
            match held.owner_world_id {
                Some(actual) if actual != expected => {
                    return Ok(ReleaseOutcome::WrongOwner(actual));
                }
                None => return Ok(ReleaseOutcome::NotHeld),
                _ => {}
            }
        }
        locks.remove(lock_id);
        drop(locks);
        self.log(format!("unlock {lock_id}"));
        Ok(ReleaseOutcome::Released)
    }

    async fn transfer(
        &self,
        lock_id: &str,
        from: WorldId,
        to: WorldId,
    ) -> PersistenceResult<AcquireOutcome> {
        let mut locks = self.locks.lock().expect("locks poisoned");
        let held = locks
            .get_mut(lock_id)
            .ok_or_else(|| PersistenceError::not_found("lock", lock_id))?;
        match held.owner_world_id {
            Some(owner) if owner != from => Ok(AcquireOutcome::HeldBy(owner)),
            _ => {
                held.owner_world_id = Some(to);
                drop(locks);
                self.log(format!("unlock {lock_id}"));
                self.log(format!("lock {lock_id}"));
                Ok(AcquireOutcome::Acquired)
            }
        }
    }

    async fn find_locks(&self, filter: &LockFilter) -> PersistenceResult<Vec<Lock>> {
        let locks = self.locks.lock().expect("locks poisoned");
        let mut found: Vec<Lock> = locks.values().filter(|l| filter.matches(l)).cloned().collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn register_world(&self, world: &World) -> PersistenceResult<()> {
        let mut worlds = self.worlds.lock().expect("worlds poisoned");
        worlds.insert(world.id, world.clone());
        Ok(())
    }

    async fn heartbeat_world(&self, id: WorldId, now: DateTime<Utc>) -> PersistenceResult<()> {
        let mut worlds = self.worlds.lock().expect("worlds poisoned");
        let world = worlds
            .get_mut(&id)
            .ok_or_else(|| PersistenceError::not_found("world", id))?;
        world.last_seen = now;
        Ok(())
    }

    async fn deregister_world(&self, id: WorldId) -> PersistenceResult<()> {
        // Idempotent: invalidation may race a clean shutdown.
        let mut worlds = self.worlds.lock().expect("worlds poisoned");
        worlds.remove(&id);
        Ok(())
    }

    async fn find_worlds(
        &self,
        filter: &WorldFilter,
        include_stale: bool,
        staleness: StalenessWindow,
    ) -> PersistenceResult<Vec<World>> {
        let worlds = self.worlds.lock().expect("worlds poisoned");
        let mut found: Vec<World> = worlds
            .values()
            .filter(|w| filter.matches(w))
            .filter(|w| include_stale || !w.is_stale(staleness.now, staleness.timeout))
            .cloned()
            .collect();
        found.sort_by_key(|w| w.id.to_string());
        Ok(found)
    }
}
