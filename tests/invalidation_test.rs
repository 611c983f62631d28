//! Tests for dead-world invalidation.
//!
//! Each test seeds the shared store with worlds, plans and locks the way a
//! crashed process would have left them, then drives `invalidate` from a
//! surviving world and asserts on plan state, execution history and the
//! observable lock log.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;

use steward::{
    CoordinationError, CoordinationResult, Coordinator, CoordinatorConfig,
    EVENT_START_EXECUTION, EVENT_TERMINATE_EXECUTION, ExecutionPlan, Executor, InProcessConnector,
    InlineExecutor, Lock, LockFilter, LockKind, LockRole, MemoryPersistence, Persistence, PlanId,
    PlanResult, PlanState, RescueStrategy, Step, StepState, World, WorldKind,
};

fn test_config(kind: WorldKind) -> CoordinatorConfig {
    CoordinatorConfig {
        kind,
        auto_validity_check: Some(false),
        validity_timeout: Duration::from_millis(200),
        heartbeat_interval: Duration::from_millis(50),
        delayed_executor: false,
    }
}

/// Executor that blocks on a semaphore before running, so tests can observe
/// cluster state between dispatch and completion.
#[derive(Clone)]
struct GatedExecutor {
    inner: InlineExecutor,
    gate: Arc<Semaphore>,
}

#[async_trait::async_trait]
impl Executor for GatedExecutor {
    fn clone_box(&self) -> Box<dyn Executor> {
        Box::new(self.clone())
    }

    async fn execute(&self, plan_id: PlanId) -> CoordinationResult<ExecutionPlan> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| CoordinationError::Executor("gate closed".to_string()))?;
        self.inner.execute(plan_id).await
    }

    async fn terminate(&self) -> CoordinationResult<()> {
        Ok(())
    }
}

/// Start an executor coordinator whose executions wait on the returned gate.
async fn start_gated_executor(
    store: &MemoryPersistence,
    connector: &InProcessConnector,
) -> Result<(Coordinator, Arc<Semaphore>)> {
    let coordinator = Coordinator::new(
        test_config(WorldKind::Executor),
        store.clone_box(),
        Box::new(connector.clone()),
    );
    let gate = Arc::new(Semaphore::new(0));
    let gated = GatedExecutor {
        inner: InlineExecutor::new(coordinator.world().id, store.clone_box()),
        gate: gate.clone(),
    };
    let mut coordinator = coordinator.with_executor(Box::new(gated));
    coordinator.start().await?;
    Ok((coordinator, gate))
}

/// Register a world row directly, as a process that later crashed would have.
async fn register_world(store: &MemoryPersistence, kind: WorldKind) -> Result<World> {
    let world = World::new(kind);
    store.register_world(&world).await?;
    Ok(world)
}

/// Seed a plan running on `executor`, holding its execution lock.
async fn seed_running_plan(
    store: &MemoryPersistence,
    executor: &World,
    rescue: RescueStrategy,
) -> Result<ExecutionPlan> {
    let mut plan = ExecutionPlan::new(executor.id)
        .with_step(Step::new(1, "DummyAction"))
        .with_rescue(rescue);
    plan.transition(PlanState::Planned)?;
    plan.transition(PlanState::Running)?;
    plan.steps.get_mut(&1).expect("step 1").state = StepState::Running;
    plan.append_history(EVENT_START_EXECUTION, executor.id);
    plan.executor_world_id = Some(executor.id);
    store.insert_plan(plan.clone());
    store
        .acquire(&Lock::new(
            LockKind::ExecutionPlan {
                plan: plan.id,
                role: LockRole::Execution,
            },
            executor.id,
        ))
        .await?;
    Ok(plan)
}

fn history(plan: &ExecutionPlan) -> Vec<(String, steward::WorldId)> {
    plan.execution_history
        .iter()
        .map(|e| (e.name.clone(), e.world_id))
        .collect()
}

#[tokio::test]
async fn reassigns_running_plan_to_surviving_executor() -> Result<()> {
    let store = MemoryPersistence::new();
    let connector = InProcessConnector::new();

    let e1 = register_world(&store, WorldKind::Executor).await?;
    let plan = seed_running_plan(&store, &e1, RescueStrategy::Pause).await?;
    let (e2, gate) = start_gated_executor(&store, &connector).await?;

    let report = e2
        .invalidate(&e1)
        .await?
        .report()
        .expect("first invalidation runs");

    let reassigned = store.load_plan(plan.id).await?;
    assert_eq!(
        history(&reassigned),
        vec![
            (EVENT_START_EXECUTION.to_string(), e1.id),
            (EVENT_TERMINATE_EXECUTION.to_string(), e1.id),
            (EVENT_START_EXECUTION.to_string(), e2.world().id),
        ]
    );
    assert_eq!(reassigned.state, PlanState::Running);
    assert_eq!(reassigned.executor_world_id, Some(e2.world().id));

    let lock = store
        .find_locks(&LockFilter::with_prefix(format!("execution-plan:{}", plan.id)))
        .await?;
    assert_eq!(lock.len(), 1);
    assert_eq!(lock[0].owner_world_id, Some(e2.world().id));

    gate.add_permits(1);
    for (_, handle) in report.dispatched {
        handle.await??;
    }
    let finished = store.load_plan(plan.id).await?;
    assert_eq!(finished.state, PlanState::Stopped);
    Ok(())
}

#[tokio::test]
async fn pauses_plan_when_no_executor_survives() -> Result<()> {
    let store = MemoryPersistence::new();
    let connector = InProcessConnector::new();

    let e1 = register_world(&store, WorldKind::Executor).await?;
    let plan = seed_running_plan(&store, &e1, RescueStrategy::Pause).await?;

    // The other executor shuts down cleanly before the crash is noticed.
    let mut e2 = Coordinator::new(
        test_config(WorldKind::Executor),
        store.clone_box(),
        Box::new(connector.clone()),
    );
    e2.start().await?;
    e2.stop().await;

    let mut client = Coordinator::new(
        test_config(WorldKind::Client),
        store.clone_box(),
        Box::new(connector.clone()),
    );
    client.start().await?;

    client
        .invalidate(&e1)
        .await?
        .report()
        .expect("invalidation runs");

    let paused = store.load_plan(plan.id).await?;
    assert_eq!(paused.state, PlanState::Paused);
    assert_eq!(paused.result, PlanResult::Pending);
    assert_eq!(
        history(&paused),
        vec![
            (EVENT_START_EXECUTION.to_string(), e1.id),
            (EVENT_TERMINATE_EXECUTION.to_string(), e1.id),
        ]
    );
    assert!(
        store
            .find_locks(&LockFilter::with_prefix("execution-plan:"))
            .await?
            .is_empty(),
        "no execution lock may remain"
    );
    Ok(())
}

#[tokio::test]
async fn skip_rescue_closes_plan_and_skips_unfinished_steps() -> Result<()> {
    let store = MemoryPersistence::new();
    let connector = InProcessConnector::new();

    let old_executor = register_world(&store, WorldKind::Executor).await?;
    let mut plan = ExecutionPlan::new(old_executor.id)
        .with_step(Step::new(1, "SkippableDummy"))
        .with_step(Step::new(2, "SkippableDummy"))
        .with_rescue(RescueStrategy::Skip);
    plan.transition(PlanState::Planned)?;
    plan.transition(PlanState::Running)?;
    plan.steps.get_mut(&1).expect("step 1").state = StepState::Success;
    plan.steps.get_mut(&2).expect("step 2").state = StepState::Error;
    plan.append_history(EVENT_START_EXECUTION, old_executor.id);
    store.insert_plan(plan.clone());
    store
        .acquire(&Lock::new(
            LockKind::ExecutionPlan {
                plan: plan.id,
                role: LockRole::Execution,
            },
            old_executor.id,
        ))
        .await?;

    let (live, _gate) = start_gated_executor(&store, &connector).await?;
    store.clear_lock_log();

    live.invalidate(&old_executor)
        .await?
        .report()
        .expect("invalidation runs");

    let stopped = store.load_plan(plan.id).await?;
    assert_eq!(stopped.state, PlanState::Stopped);
    assert_eq!(stopped.steps[&1].state, StepState::Success);
    assert_eq!(stopped.steps[&2].state, StepState::Skipped);
    assert_eq!(stopped.result, PlanResult::Warning);
    assert!(
        store
            .lock_log()
            .contains(&format!("unlock execution-plan:{}", plan.id)),
        "lock log records the execution lock release"
    );
    Ok(())
}

#[tokio::test]
async fn concurrent_invalidation_observes_lock_and_backs_off() -> Result<()> {
    let store = MemoryPersistence::new();
    let connector = InProcessConnector::new();

    let target = register_world(&store, WorldKind::Executor).await?;
    let rival = register_world(&store, WorldKind::Executor).await?;
    let (live, _gate) = start_gated_executor(&store, &connector).await?;

    // A rival world is mid-invalidation: the guard lock is held.
    store
        .acquire(&Lock::new(
            LockKind::WorldInvalidation { world: target.id },
            rival.id,
        ))
        .await?;
    store.clear_lock_log();

    let outcome = live.invalidate(&target).await?;
    assert!(outcome.report().is_none(), "second caller must back off");
    assert!(store.lock_log().is_empty(), "back-off emits no log entries");

    // Once the rival finishes, a retry performs exactly one run.
    store
        .release(
            &format!("world-invalidation:{}", target.id),
            Some(rival.id),
        )
        .await?;
    store.clear_lock_log();

    live.invalidate(&target).await?.report().expect("runs now");
    let guard_id = format!("world-invalidation:{}", target.id);
    assert_eq!(
        store.lock_log(),
        vec![format!("lock {guard_id}"), format!("unlock {guard_id}")]
    );
    Ok(())
}

#[tokio::test]
async fn execution_lock_for_missing_plan_is_released_without_error() -> Result<()> {
    let store = MemoryPersistence::new();
    let connector = InProcessConnector::new();

    let dead = register_world(&store, WorldKind::Executor).await?;
    let missing = PlanId::new();
    store
        .acquire(&Lock::new(
            LockKind::ExecutionPlan {
                plan: missing,
                role: LockRole::Execution,
            },
            dead.id,
        ))
        .await?;

    let (live, _gate) = start_gated_executor(&store, &connector).await?;
    store.clear_lock_log();

    live.invalidate(&dead).await?.report().expect("runs");

    let guard_id = format!("world-invalidation:{}", dead.id);
    assert_eq!(
        store.lock_log(),
        vec![
            format!("lock {guard_id}"),
            format!("unlock execution-plan:{missing}"),
            format!("unlock {guard_id}"),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn dead_planner_hands_finished_plan_to_live_executor() -> Result<()> {
    let store = MemoryPersistence::new();
    let connector = InProcessConnector::new();

    let client = register_world(&store, WorldKind::Client).await?;
    let plan = ExecutionPlan::new(client.id).with_step(Step::new(1, "DummyAction"));
    store.insert_plan(plan.clone());
    store
        .acquire(&Lock::new(
            LockKind::ExecutionPlan {
                plan: plan.id,
                role: LockRole::Planning,
            },
            client.id,
        ))
        .await?;

    let (executor, gate) = start_gated_executor(&store, &connector).await?;
    store.clear_lock_log();

    let report = executor
        .invalidate(&client)
        .await?
        .report()
        .expect("invalidation runs");

    let guard_id = format!("world-invalidation:{}", client.id);
    let plan_lock_id = format!("execution-plan:{}", plan.id);
    assert_eq!(
        store.lock_log(),
        vec![
            format!("lock {guard_id}"),
            format!("unlock {plan_lock_id}"),
            format!("lock {plan_lock_id}"),
            format!("unlock {guard_id}"),
        ]
    );

    gate.add_permits(1);
    for (_, handle) in report.dispatched {
        handle.await??;
    }
    let finished = store.load_plan(plan.id).await?;
    assert_eq!(finished.state, PlanState::Stopped);
    Ok(())
}

#[tokio::test]
async fn dead_planner_with_partial_steps_stops_the_plan() -> Result<()> {
    let store = MemoryPersistence::new();
    let connector = InProcessConnector::new();

    let client = register_world(&store, WorldKind::Client).await?;
    let mut plan = ExecutionPlan::new(client.id).with_step(Step::new(1, "DummyAction"));
    plan.steps.get_mut(&1).expect("step 1").state = StepState::Running;
    store.insert_plan(plan.clone());
    store
        .acquire(&Lock::new(
            LockKind::ExecutionPlan {
                plan: plan.id,
                role: LockRole::Planning,
            },
            client.id,
        ))
        .await?;

    let (executor, _gate) = start_gated_executor(&store, &connector).await?;
    executor
        .invalidate(&client)
        .await?
        .report()
        .expect("invalidation runs");

    let stopped = store.load_plan(plan.id).await?;
    assert_eq!(stopped.state, PlanState::Stopped);
    assert!(
        store
            .find_locks(&LockFilter::with_prefix("execution-plan:"))
            .await?
            .is_empty(),
        "a mid-plan death leaves no execution lock"
    );
    Ok(())
}

#[tokio::test]
async fn invalidation_never_reopens_a_stopped_plan() -> Result<()> {
    let store = MemoryPersistence::new();
    let connector = InProcessConnector::new();

    let dead = register_world(&store, WorldKind::Executor).await?;
    let mut plan = ExecutionPlan::new(dead.id).with_step(Step::new(1, "DummyAction"));
    plan.transition(PlanState::Planned)?;
    plan.transition(PlanState::Running)?;
    plan.steps.get_mut(&1).expect("step 1").state = StepState::Success;
    plan.append_history(EVENT_START_EXECUTION, dead.id);
    plan.transition(PlanState::Stopped)?;
    plan.result = PlanResult::Success;
    store.insert_plan(plan.clone());
    // The lock outlived the plan: the executor died after finishing but
    // before releasing.
    store
        .acquire(&Lock::new(
            LockKind::ExecutionPlan {
                plan: plan.id,
                role: LockRole::Execution,
            },
            dead.id,
        ))
        .await?;

    let (live, _gate) = start_gated_executor(&store, &connector).await?;
    live.invalidate(&dead).await?.report().expect("runs");

    let untouched = store.load_plan(plan.id).await?;
    assert_eq!(untouched.state, PlanState::Stopped);
    assert_eq!(untouched.result, PlanResult::Success);
    assert_eq!(
        history(&untouched),
        vec![(EVENT_START_EXECUTION.to_string(), dead.id)],
        "terminal plans gain no new history"
    );
    assert!(
        store
            .find_locks(&LockFilter::with_prefix("execution-plan:"))
            .await?
            .is_empty()
    );
    Ok(())
}

#[tokio::test]
async fn plan_without_steps_is_marked_invalid_and_closed() -> Result<()> {
    let store = MemoryPersistence::new();
    let connector = InProcessConnector::new();

    let dead = register_world(&store, WorldKind::Executor).await?;
    // A running plan whose steps were lost is unusable as stored.
    let mut plan = ExecutionPlan::new(dead.id);
    plan.transition(PlanState::Planned)?;
    plan.transition(PlanState::Running)?;
    plan.append_history(EVENT_START_EXECUTION, dead.id);
    store.insert_plan(plan.clone());
    store
        .acquire(&Lock::new(
            LockKind::ExecutionPlan {
                plan: plan.id,
                role: LockRole::Execution,
            },
            dead.id,
        ))
        .await?;

    let (live, _gate) = start_gated_executor(&store, &connector).await?;
    live.invalidate(&dead).await?.report().expect("runs");

    let reconciled = store.load_plan(plan.id).await?;
    assert!(!reconciled.is_valid());
    assert!(reconciled.exception.is_some());
    assert_eq!(reconciled.state, PlanState::Stopped);
    assert_eq!(reconciled.result, PlanResult::Error);
    assert!(
        store
            .find_locks(&LockFilter::with_prefix("execution-plan:"))
            .await?
            .is_empty()
    );
    Ok(())
}

#[tokio::test]
async fn singleton_and_role_locks_are_released_unconditionally() -> Result<()> {
    let store = MemoryPersistence::new();
    let connector = InProcessConnector::new();

    let dead = register_world(&store, WorldKind::Executor).await?;
    store
        .acquire(&Lock::new(
            LockKind::SingletonAction {
                class: "UniqueSync".to_string(),
                plan: PlanId::new(),
            },
            dead.id,
        ))
        .await?;
    store
        .acquire(&Lock::new(
            LockKind::DelayedExecutor { world: dead.id },
            dead.id,
        ))
        .await?;

    let (live, _gate) = start_gated_executor(&store, &connector).await?;
    live.invalidate(&dead).await?.report().expect("runs");

    let remaining = store.find_locks(&LockFilter::owned_by(dead.id)).await?;
    assert!(remaining.is_empty(), "dead world holds nothing afterwards");
    Ok(())
}
