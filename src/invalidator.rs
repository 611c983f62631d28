//! Reclamation of a dead world's locks and plans.
//!
//! `invalidate` is the only path that touches another world's resources. The
//! whole run is serialized per target by the `world-invalidation` lock, and
//! every mutation inside it is idempotent: a crashed invalidator leaves the
//! outer lock behind, which makes the crashed run itself reclaimable by the
//! next caller.

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connector::{Connector, CoordinationMessage};
use crate::error::{CoordinationError, CoordinationResult};
use crate::executor::Executor;
use crate::lock_table::LockTable;
use crate::model::{
    EVENT_START_EXECUTION, EVENT_TERMINATE_EXECUTION, ExecutionPlan, Lock, LockCategory, LockKind,
    LockRole, PlanId, PlanResult, PlanState, RescueStrategy, World, WorldId,
};
use crate::persistence::{self, AcquireOutcome, Persistence};
use crate::registry::WorldRegistry;

/// Result of one `invalidate` call.
pub enum InvalidationOutcome {
    /// Another world holds the invalidation lock for this target; nothing
    /// was touched.
    AlreadyRunning,
    Completed(InvalidationReport),
}

impl InvalidationOutcome {
    pub fn report(self) -> Option<InvalidationReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::AlreadyRunning => None,
        }
    }
}

/// What one completed invalidation run did.
#[derive(Default)]
pub struct InvalidationReport {
    /// Plans whose execution moved to a live executor.
    pub reassigned: Vec<PlanId>,
    /// Plans closed out (mid-planning deaths, skip rescues, bad records).
    pub stopped: Vec<PlanId>,
    /// Plans parked because no executor was alive.
    pub paused: Vec<PlanId>,
    /// Locally spawned executions for plans handed to this world.
    pub dispatched: Vec<(PlanId, JoinHandle<CoordinationResult<ExecutionPlan>>)>,
}

/// Pending work recorded during reclamation and dispatched only after the
/// outer invalidation lock is released, so the lock log stays deterministic.
enum Dispatch {
    /// Plan freshly locked for execution after its planner died.
    Fresh { plan_id: PlanId, owner: WorldId },
    /// Plan whose execution lock moved from the dead world to `owner`.
    Reassigned {
        plan_id: PlanId,
        owner: WorldId,
        from: WorldId,
    },
}

pub struct Invalidator {
    world: World,
    persistence: Box<dyn Persistence>,
    locks: LockTable,
    registry: WorldRegistry,
    connector: Box<dyn Connector>,
    executor: Option<Box<dyn Executor>>,
}

impl Invalidator {
    pub fn new(
        world: World,
        persistence: Box<dyn Persistence>,
        locks: LockTable,
        registry: WorldRegistry,
        connector: Box<dyn Connector>,
        executor: Option<Box<dyn Executor>>,
    ) -> Self {
        Self {
            world,
            persistence,
            locks,
            registry,
            connector,
            executor,
        }
    }

    /// Declare `target` dead and reclaim everything it holds.
    pub async fn invalidate(&self, target: &World) -> CoordinationResult<InvalidationOutcome> {
        let guard = LockKind::WorldInvalidation { world: target.id };
        match self.locks.acquire(guard.clone(), self.world.id).await? {
            AcquireOutcome::HeldBy(holder) => {
                debug!(
                    target_world = %target.id,
                    held_by = %holder,
                    "invalidation already in progress"
                );
                return Ok(InvalidationOutcome::AlreadyRunning);
            }
            AcquireOutcome::Acquired => {}
        }

        let outcome = self.reclaim(target).await;

        // Abandoning a failed run still releases the outer lock; the target
        // stays eligible for a later retry.
        if let Err(err) = self.locks.release(&guard, Some(self.world.id)).await {
            warn!(target_world = %target.id, error = %err, "failed to release invalidation lock");
        }

        let (mut report, dispatches) = outcome?;
        self.dispatch_all(dispatches, &mut report).await;

        info!(
            target_world = %target.id,
            reassigned = report.reassigned.len(),
            stopped = report.stopped.len(),
            paused = report.paused.len(),
            "world invalidated"
        );
        Ok(InvalidationOutcome::Completed(report))
    }

    async fn reclaim(
        &self,
        target: &World,
    ) -> CoordinationResult<(InvalidationReport, Vec<Dispatch>)> {
        // Deregistration is visible to every subsequent find_worlds call.
        self.registry.deregister(target.id).await?;

        let mut report = InvalidationReport::default();
        let mut dispatches = Vec::new();

        // owned_by orders planning, execution, singleton, misc.
        for lock in self.locks.owned_by(target.id).await? {
            match lock.kind.category() {
                LockCategory::Planning => {
                    self.reclaim_planning(target, &lock, &mut report, &mut dispatches)
                        .await?;
                }
                LockCategory::Execution => {
                    self.reclaim_execution(target, &lock, &mut report, &mut dispatches)
                        .await?;
                }
                LockCategory::Singleton | LockCategory::Misc => {
                    // Released unconditionally; a still-live plan rebuilds
                    // its singleton lock on its next transition.
                    self.locks.release_id(&lock.id, lock.owner_world_id).await?;
                }
            }
        }

        Ok((report, dispatches))
    }

    /// A client died while holding a plan's planning lock.
    async fn reclaim_planning(
        &self,
        target: &World,
        lock: &Lock,
        report: &mut InvalidationReport,
        dispatches: &mut Vec<Dispatch>,
    ) -> CoordinationResult<()> {
        self.locks.release_id(&lock.id, Some(target.id)).await?;

        let Some(plan_id) = lock.kind.plan_id() else {
            return Ok(());
        };
        let plan = match self.persistence.load_plan(plan_id).await {
            Ok(plan) => plan,
            Err(err) if err.is_not_found() => {
                info!(%plan_id, "planning lock referenced a missing plan");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        // Terminal plans keep their outcome; the lock alone was stale.
        if plan.state.is_terminal() {
            return Ok(());
        }

        if plan.state == PlanState::Planning && plan.has_started_steps() {
            // Died mid-plan with partial steps: the plan cannot be trusted
            // to execute, close it out.
            let target_id = target.id;
            persistence::update_plan(self.persistence.as_ref(), plan_id, move |p| {
                if p.state.is_terminal() {
                    return Ok(());
                }
                p.append_history(EVENT_TERMINATE_EXECUTION, target_id);
                p.transition(PlanState::Stopped)?;
                Ok(())
            })
            .await?;
            report.stopped.push(plan_id);
            return Ok(());
        }

        // Planning finished (or never produced observable progress): lock
        // the plan for execution on behalf of a live executor and let the
        // resume path pick it up.
        let Some(owner) = self.choose_executor(target.id).await? else {
            warn!(%plan_id, "no live executor to adopt plan from dead planner");
            return Ok(());
        };
        let kind = LockKind::ExecutionPlan {
            plan: plan_id,
            role: LockRole::Execution,
        };
        match self.locks.acquire(kind, owner).await? {
            AcquireOutcome::Acquired => {
                dispatches.push(Dispatch::Fresh { plan_id, owner });
                report.reassigned.push(plan_id);
            }
            AcquireOutcome::HeldBy(holder) => {
                debug!(%plan_id, held_by = %holder, "plan already locked for execution");
            }
        }
        Ok(())
    }

    /// An executor died while holding a plan's execution lock.
    async fn reclaim_execution(
        &self,
        target: &World,
        lock: &Lock,
        report: &mut InvalidationReport,
        dispatches: &mut Vec<Dispatch>,
    ) -> CoordinationResult<()> {
        let Some(plan_id) = lock.kind.plan_id() else {
            self.locks.release_id(&lock.id, lock.owner_world_id).await?;
            return Ok(());
        };

        let plan = match self.persistence.load_plan(plan_id).await {
            Ok(plan) => plan,
            Err(err) if err.is_not_found() => {
                info!(%plan_id, "execution lock referenced a missing plan");
                self.locks.release_id(&lock.id, Some(target.id)).await?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        // Terminal plans keep their outcome; the lock alone was stale.
        if plan.state.is_terminal() {
            self.locks.release_id(&lock.id, Some(target.id)).await?;
            return Ok(());
        }

        if let Err(err) = ensure_consistent(&plan) {
            warn!(%plan_id, error = %err, "plan record is inconsistent, closing it out");
            let target_id = target.id;
            let reason = err.to_string();
            persistence::update_plan(self.persistence.as_ref(), plan_id, move |p| {
                if p.state.is_terminal() {
                    return Ok(());
                }
                p.append_history(EVENT_TERMINATE_EXECUTION, target_id);
                p.mark_invalid(reason.clone());
                p.transition(PlanState::Stopped)?;
                Ok(())
            })
            .await?;
            self.locks.release_id(&lock.id, Some(target.id)).await?;
            report.stopped.push(plan_id);
            return Ok(());
        }

        match plan.rescue_strategy {
            RescueStrategy::Skip => {
                let target_id = target.id;
                persistence::update_plan(self.persistence.as_ref(), plan_id, move |p| {
                    if p.state.is_terminal() {
                        return Ok(());
                    }
                    p.append_history(EVENT_TERMINATE_EXECUTION, target_id);
                    p.skip_unfinished_steps();
                    p.transition(PlanState::Stopped)?;
                    p.result = p.derive_result();
                    Ok(())
                })
                .await?;
                self.locks.release_id(&lock.id, Some(target.id)).await?;
                report.stopped.push(plan_id);
            }
            RescueStrategy::Pause => {
                match self.choose_executor(target.id).await? {
                    Some(owner) => {
                        let target_id = target.id;
                        persistence::update_plan(self.persistence.as_ref(), plan_id, move |p| {
                            if p.state.is_terminal() {
                                return Ok(());
                            }
                            p.append_history(EVENT_TERMINATE_EXECUTION, target_id);
                            p.append_history(EVENT_START_EXECUTION, owner);
                            if p.state == PlanState::Planning {
                                p.transition(PlanState::Planned)?;
                            }
                            // Running -> Running is the reassignment edge.
                            p.transition(PlanState::Running)?;
                            p.executor_world_id = Some(owner);
                            Ok(())
                        })
                        .await?;
                        match self.locks.transfer(&lock.kind, target.id, owner).await {
                            Ok(AcquireOutcome::Acquired) => {
                                dispatches.push(Dispatch::Reassigned {
                                    plan_id,
                                    owner,
                                    from: target.id,
                                });
                                report.reassigned.push(plan_id);
                            }
                            Ok(AcquireOutcome::HeldBy(holder)) => {
                                debug!(%plan_id, held_by = %holder, "execution lock changed hands during reclamation");
                            }
                            Err(err) if err.is_not_found() => {
                                debug!(%plan_id, "execution lock vanished during reclamation");
                            }
                            Err(err) => return Err(err.into()),
                        }
                    }
                    None => {
                        let target_id = target.id;
                        persistence::update_plan(self.persistence.as_ref(), plan_id, move |p| {
                            if p.state.is_terminal() {
                                return Ok(());
                            }
                            p.append_history(EVENT_TERMINATE_EXECUTION, target_id);
                            if p.state == PlanState::Running {
                                p.transition(PlanState::Paused)?;
                            }
                            p.result = PlanResult::Pending;
                            p.executor_world_id = None;
                            Ok(())
                        })
                        .await?;
                        self.locks.release_id(&lock.id, Some(target.id)).await?;
                        report.paused.push(plan_id);
                    }
                }
            }
        }
        Ok(())
    }

    /// The executor that should adopt reclaimed work: this world when it
    /// runs an executor, otherwise any live executor.
    async fn choose_executor(&self, exclude: WorldId) -> CoordinationResult<Option<WorldId>> {
        if self.executor.is_some() && self.world.is_executor() && self.world.id != exclude {
            return Ok(Some(self.world.id));
        }
        let live = self.registry.live_executors(Some(exclude)).await?;
        Ok(live.into_iter().map(|w| w.id).next())
    }

    /// Run deferred dispatches once the outer lock is gone. Transport
    /// failures are logged only; the target was presumed dead already and
    /// the plan stays resumable by the sweep.
    async fn dispatch_all(&self, dispatches: Vec<Dispatch>, report: &mut InvalidationReport) {
        for dispatch in dispatches {
            match dispatch {
                Dispatch::Fresh { plan_id, owner } => {
                    let marked = persistence::update_plan(
                        self.persistence.as_ref(),
                        plan_id,
                        move |p| {
                            if p.state.is_terminal() {
                                return Ok(());
                            }
                            p.append_history(EVENT_START_EXECUTION, owner);
                            p.executor_world_id = Some(owner);
                            Ok(())
                        },
                    )
                    .await;
                    if let Err(err) = marked {
                        warn!(%plan_id, error = %err, "failed to mark adopted plan");
                        continue;
                    }
                    if let Some(handle) = self
                        .deliver(plan_id, owner, CoordinationMessage::ResumeExecution { plan_id })
                        .await
                    {
                        report.dispatched.push((plan_id, handle));
                    }
                }
                Dispatch::Reassigned {
                    plan_id,
                    owner,
                    from,
                } => {
                    if let Some(handle) = self
                        .deliver(
                            plan_id,
                            owner,
                            CoordinationMessage::PlanReassigned { plan_id, from },
                        )
                        .await
                    {
                        report.dispatched.push((plan_id, handle));
                    }
                }
            }
        }
    }

    /// Hand a plan to its new owner: spawn locally when the owner is this
    /// world, otherwise notify it over the connector.
    async fn deliver(
        &self,
        plan_id: PlanId,
        owner: WorldId,
        message: CoordinationMessage,
    ) -> Option<JoinHandle<CoordinationResult<ExecutionPlan>>> {
        if owner == self.world.id {
            if let Some(executor) = &self.executor {
                let executor = executor.clone();
                return Some(tokio::spawn(async move { executor.execute(plan_id).await }));
            }
        }
        if let Err(err) = self.connector.send(owner, message).await {
            warn!(%plan_id, world_id = %owner, error = %err, "failed to notify executor");
        }
        None
    }
}

/// A plan that claims to be underway must have steps to run.
fn ensure_consistent(plan: &ExecutionPlan) -> Result<(), CoordinationError> {
    if matches!(
        plan.state,
        PlanState::Planned | PlanState::Scheduled | PlanState::Running
    ) && plan.steps.is_empty()
    {
        return Err(CoordinationError::DataConsistency(format!(
            "plan {} has no steps",
            plan.id
        )));
    }
    Ok(())
}
