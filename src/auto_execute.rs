//! Cluster-serialized sweep that resumes plans left without an owner.

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CoordinationResult;
use crate::executor::Executor;
use crate::lock_table::LockTable;
use crate::model::{
    EVENT_START_EXECUTION, ExecutionPlan, LockKind, LockRole, PlanFilter, PlanId, PlanResult,
    PlanState, World,
};
use crate::persistence::{self, AcquireOutcome, Persistence};

pub type ResumedPlan = (PlanId, JoinHandle<CoordinationResult<ExecutionPlan>>);

pub struct AutoExecutor {
    world: World,
    persistence: Box<dyn Persistence>,
    locks: LockTable,
    executor: Box<dyn Executor>,
}

impl AutoExecutor {
    pub fn new(
        world: World,
        persistence: Box<dyn Persistence>,
        locks: LockTable,
        executor: Box<dyn Executor>,
    ) -> Self {
        Self {
            world,
            persistence,
            locks,
            executor,
        }
    }

    /// Resume every plan that has no live execution lock. Returns the
    /// spawned executions; the `auto-execute` lock is held only for the
    /// dispatch scan, not until the plans finish.
    pub async fn auto_execute(&self) -> CoordinationResult<Vec<ResumedPlan>> {
        match self
            .locks
            .acquire(LockKind::AutoExecute, self.world.id)
            .await?
        {
            AcquireOutcome::HeldBy(holder) => {
                debug!(held_by = %holder, "auto-execute sweep already running");
                return Ok(Vec::new());
            }
            AcquireOutcome::Acquired => {}
        }

        let resumed = self.sweep().await;

        if let Err(err) = self
            .locks
            .release(&LockKind::AutoExecute, Some(self.world.id))
            .await
        {
            warn!(error = %err, "failed to release auto-execute lock");
        }

        resumed
    }

    async fn sweep(&self) -> CoordinationResult<Vec<ResumedPlan>> {
        let mut candidates = Vec::new();
        for state in [PlanState::Planned, PlanState::Running] {
            candidates.extend(
                self.persistence
                    .find_plans(&PlanFilter {
                        state: Some(state),
                        ..PlanFilter::default()
                    })
                    .await?,
            );
        }
        // Paused plans are resumable unless a user has to intervene first.
        candidates.extend(
            self.persistence
                .find_plans(&PlanFilter {
                    state: Some(PlanState::Paused),
                    ..PlanFilter::default()
                })
                .await?
                .into_iter()
                .filter(|p| p.result != PlanResult::Error),
        );

        let mut resumed = Vec::new();
        for plan in candidates {
            if self.locks.plan_lock(plan.id).await?.is_some() {
                continue;
            }
            let kind = LockKind::ExecutionPlan {
                plan: plan.id,
                role: LockRole::Execution,
            };
            match self.locks.acquire(kind, self.world.id).await? {
                AcquireOutcome::Acquired => {}
                // Lost the claim, usually to an invalidator mid-reassignment.
                AcquireOutcome::HeldBy(_) => continue,
            }

            let world_id = self.world.id;
            let marked =
                persistence::update_plan(self.persistence.as_ref(), plan.id, move |p| {
                    if p.state.is_terminal() {
                        return Ok(());
                    }
                    p.append_history(EVENT_START_EXECUTION, world_id);
                    p.executor_world_id = Some(world_id);
                    Ok(())
                })
                .await;
            if let Err(err) = marked {
                warn!(plan_id = %plan.id, error = %err, "failed to mark resumed plan");
                let kind = LockKind::ExecutionPlan {
                    plan: plan.id,
                    role: LockRole::Execution,
                };
                let _ = self.locks.release(&kind, Some(self.world.id)).await;
                continue;
            }

            let executor = self.executor.clone();
            let plan_id = plan.id;
            let handle = tokio::spawn(async move { executor.execute(plan_id).await });
            resumed.push((plan_id, handle));
        }
        Ok(resumed)
    }
}
