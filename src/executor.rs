//! Executor contract consumed by the coordination core.
//!
//! The core hands plan ids to an executor and observes the finished plan; it
//! never reaches into a dead world's executor. [`InlineExecutor`] is the
//! in-process implementation used by the demo binary and the test suites: it
//! drives every remaining step to success and closes the plan out.

use crate::error::{CoordinationError, CoordinationResult};
use crate::model::{
    EVENT_FINISH_EXECUTION, ExecutionPlan, LockKind, LockRole, PlanId, PlanState, StepState,
    WorldId,
};
use crate::persistence::{self, Persistence};

#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    fn clone_box(&self) -> Box<dyn Executor>;

    /// Run the plan to a settled state and return the final record.
    async fn execute(&self, plan_id: PlanId) -> CoordinationResult<ExecutionPlan>;

    /// Stop accepting work and wind down in-flight executions.
    async fn terminate(&self) -> CoordinationResult<()>;
}

impl Clone for Box<dyn Executor> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Executor that completes plans inline on the calling task.
#[derive(Clone)]
pub struct InlineExecutor {
    world_id: WorldId,
    persistence: Box<dyn Persistence>,
}

impl InlineExecutor {
    pub fn new(world_id: WorldId, persistence: Box<dyn Persistence>) -> Self {
        Self {
            world_id,
            persistence,
        }
    }
}

#[async_trait::async_trait]
impl Executor for InlineExecutor {
    fn clone_box(&self) -> Box<dyn Executor> {
        Box::new(self.clone())
    }

    async fn execute(&self, plan_id: PlanId) -> CoordinationResult<ExecutionPlan> {
        let world_id = self.world_id;
        let plan = persistence::update_plan(self.persistence.as_ref(), plan_id, move |plan| {
            // A settled plan is left untouched so re-delivery is harmless.
            if plan.state == PlanState::Stopped {
                return Ok(());
            }
            if plan.state == PlanState::Planning {
                plan.transition(PlanState::Planned)?;
            }
            if plan.state != PlanState::Running {
                plan.transition(PlanState::Running)?;
            }
            for step in plan.steps.values_mut() {
                if matches!(step.state, StepState::Pending | StepState::Running) {
                    step.state = StepState::Success;
                }
            }
            plan.executor_world_id = Some(world_id);
            plan.append_history(EVENT_FINISH_EXECUTION, world_id);
            plan.transition(PlanState::Stopped)?;
            plan.result = plan.derive_result();
            Ok(())
        })
        .await
        .map_err(CoordinationError::from)?;

        // The plan settled, so its execution lock has no further holder.
        let kind = LockKind::ExecutionPlan {
            plan: plan_id,
            role: LockRole::Execution,
        };
        self.persistence
            .release(&kind.lock_id(), Some(self.world_id))
            .await?;

        Ok(plan)
    }

    async fn terminate(&self) -> CoordinationResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPersistence;
    use crate::model::{Lock, PlanResult, Step};
    use crate::persistence::Persistence;

    #[tokio::test]
    async fn inline_executor_settles_a_planned_plan() {
        let store = MemoryPersistence::new();
        let world = WorldId::new();
        let mut plan = ExecutionPlan::new(world).with_step(Step::new(1, "Sync"));
        plan.transition(PlanState::Planned).expect("planned");
        store.insert_plan(plan.clone());
        store
            .acquire(&Lock::new(
                LockKind::ExecutionPlan {
                    plan: plan.id,
                    role: LockRole::Execution,
                },
                world,
            ))
            .await
            .expect("lock");

        let executor = InlineExecutor::new(world, store.clone_box());
        let finished = executor.execute(plan.id).await.expect("execute");

        assert_eq!(finished.state, PlanState::Stopped);
        assert_eq!(finished.result, PlanResult::Success);
        assert_eq!(finished.history_names(), vec![EVENT_FINISH_EXECUTION]);
        assert!(store
            .find_locks(&crate::model::LockFilter::with_prefix("execution-plan:"))
            .await
            .expect("find")
            .is_empty());
    }
}
