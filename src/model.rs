//! Data model for the coordination core.
//!
//! Worlds, locks, execution plans, steps and history events are the durable
//! records shared by every process in the fleet. All cross-world reasoning
//! happens over ids resolved against persistence, so the records here are
//! plain data with no pointers between them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Type Aliases & Newtypes
// ============================================================================

/// Unique identifier for a world (one participating process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorldId(pub Uuid);

impl WorldId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorldId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanId(pub Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Worlds
// ============================================================================

/// Role of a world in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorldKind {
    /// Plans work but never runs it.
    Client,
    /// Runs execution plans.
    Executor,
}

impl WorldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Executor => "executor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "client" => Some(Self::Client),
            "executor" => Some(Self::Executor),
            _ => None,
        }
    }
}

/// A registered participant in the cluster.
///
/// At most one live registration exists per id; re-registering replaces the
/// previous row. Only the owning world writes `last_seen`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct World {
    pub id: WorldId,
    pub kind: WorldKind,
    pub meta: HashMap<String, String>,
    pub last_seen: DateTime<Utc>,
}

impl World {
    pub fn new(kind: WorldKind) -> Self {
        Self {
            id: WorldId::new(),
            kind,
            meta: HashMap::new(),
            last_seen: Utc::now(),
        }
    }

    pub fn is_executor(&self) -> bool {
        self.kind == WorldKind::Executor
    }

    /// True when the heartbeat is older than `timeout` relative to `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_seen > timeout
    }
}

// ============================================================================
// Locks
// ============================================================================

/// Whether an `execution-plan` lock covers planning or execution.
///
/// Both phases share one lock id per plan, so planning and execution can
/// never overlap; the role travels in the lock payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockRole {
    Planning,
    Execution,
}

/// Reclamation ordering bucket for a lock, processed planning first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockCategory {
    Planning,
    Execution,
    Singleton,
    Misc,
}

/// The named lock kinds understood by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    /// Held by the world reclaiming the referenced world.
    WorldInvalidation { world: WorldId },
    /// Held by whoever owns a plan's planning or execution.
    ExecutionPlan { plan: PlanId, role: LockRole },
    /// Held while a uniquely named action is in flight anywhere.
    SingletonAction { class: String, plan: PlanId },
    /// Cluster-wide singleton for the resume sweep.
    AutoExecute,
    /// Held by a world running the delayed-dispatch role.
    DelayedExecutor { world: WorldId },
}

impl LockKind {
    /// Durable lock id. Serialization is one `class:payload` string so id
    /// prefix filters can select whole kinds.
    pub fn lock_id(&self) -> String {
        match self {
            Self::WorldInvalidation { world } => format!("world-invalidation:{world}"),
            Self::ExecutionPlan { plan, .. } => format!("execution-plan:{plan}"),
            Self::SingletonAction { class, .. } => format!("singleton-action:{class}"),
            Self::AutoExecute => "auto-execute".to_string(),
            Self::DelayedExecutor { world } => format!("delayed-executor:{world}"),
        }
    }

    /// Plan referenced by the lock payload, when there is one.
    pub fn plan_id(&self) -> Option<PlanId> {
        match self {
            Self::ExecutionPlan { plan, .. } | Self::SingletonAction { plan, .. } => Some(*plan),
            _ => None,
        }
    }

    pub fn category(&self) -> LockCategory {
        match self {
            Self::ExecutionPlan {
                role: LockRole::Planning,
                ..
            } => LockCategory::Planning,
            Self::ExecutionPlan {
                role: LockRole::Execution,
                ..
            } => LockCategory::Execution,
            Self::SingletonAction { .. } => LockCategory::Singleton,
            _ => LockCategory::Misc,
        }
    }
}

/// A durable named lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub id: String,
    pub owner_world_id: Option<WorldId>,
    pub kind: LockKind,
}

impl Lock {
    pub fn new(kind: LockKind, owner: WorldId) -> Self {
        Self {
            id: kind.lock_id(),
            owner_world_id: Some(owner),
            kind,
        }
    }
}

// ============================================================================
// Status Enums
// ============================================================================

/// State of an execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanState {
    Planning,
    Planned,
    Scheduled,
    Running,
    Paused,
    Stopped,
}

impl PlanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Planned => "planned",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planning" => Some(Self::Planning),
            "planned" => Some(Self::Planned),
            "scheduled" => Some(Self::Scheduled),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// Overall result of an execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanResult {
    Pending,
    Success,
    Warning,
    Error,
}

impl PlanResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// State of a single step. The core only ever reads and writes this field;
/// everything else about a step belongs to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    Pending,
    Running,
    Success,
    Error,
    Skipped,
    Suspended,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Skipped => "skipped",
            Self::Suspended => "suspended",
        }
    }
}

// ============================================================================
// Steps & History
// ============================================================================

/// One step of an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: u64,
    pub action_class: String,
    pub state: StepState,
}

impl Step {
    pub fn new(id: u64, action_class: impl Into<String>) -> Self {
        Self {
            id,
            action_class: action_class.into(),
            state: StepState::Pending,
        }
    }
}

/// Append-only execution history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub name: String,
    pub world_id: WorldId,
    pub at: DateTime<Utc>,
}

pub const EVENT_START_EXECUTION: &str = "start execution";
pub const EVENT_TERMINATE_EXECUTION: &str = "terminate execution";
pub const EVENT_FINISH_EXECUTION: &str = "finish execution";
pub const EVENT_PAUSE_EXECUTION: &str = "pause execution";

// ============================================================================
// Execution Plans
// ============================================================================

/// Policy consulted when cleaning up a plan whose executor died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RescueStrategy {
    /// Leave the plan paused for a later resume.
    #[default]
    Pause,
    /// Skip whatever did not finish and close the plan out.
    Skip,
}

#[derive(Debug, Error)]
#[error("illegal plan transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: PlanState,
    pub to: PlanState,
}

/// The durable record of one workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: PlanId,
    pub state: PlanState,
    pub result: PlanResult,
    pub steps: BTreeMap<u64, Step>,
    pub execution_history: Vec<HistoryEvent>,
    pub planner_world_id: WorldId,
    pub executor_world_id: Option<WorldId>,
    pub rescue_strategy: RescueStrategy,
    /// Populated when the stored record turned out to be inconsistent.
    pub exception: Option<String>,
    /// Optimistic concurrency token, bumped by every successful save.
    pub version: u64,
}

impl ExecutionPlan {
    pub fn new(planner: WorldId) -> Self {
        Self {
            id: PlanId::new(),
            state: PlanState::Planning,
            result: PlanResult::Pending,
            steps: BTreeMap::new(),
            execution_history: Vec::new(),
            planner_world_id: planner,
            executor_world_id: None,
            rescue_strategy: RescueStrategy::default(),
            exception: None,
            version: 0,
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.insert(step.id, step);
        self
    }

    pub fn with_rescue(mut self, rescue: RescueStrategy) -> Self {
        self.rescue_strategy = rescue;
        self
    }

    /// False once the record has been flagged inconsistent.
    pub fn is_valid(&self) -> bool {
        self.exception.is_none()
    }

    pub fn mark_invalid(&mut self, reason: impl Into<String>) {
        self.exception = Some(reason.into());
        self.result = PlanResult::Error;
    }

    /// True when planning has produced any observable step progress.
    pub fn has_started_steps(&self) -> bool {
        self.steps.values().any(|s| s.state != StepState::Pending)
    }

    /// Action classes of steps that require a singleton lock footprint.
    pub fn action_classes(&self) -> Vec<String> {
        let mut classes: Vec<String> =
            self.steps.values().map(|s| s.action_class.clone()).collect();
        classes.sort();
        classes.dedup();
        classes
    }

    /// Move the plan to `to`, enforcing the legal transition graph.
    ///
    /// `Running -> Running` is legal and models reassignment; terminal states
    /// are never left again.
    pub fn transition(&mut self, to: PlanState) -> Result<(), IllegalTransition> {
        use PlanState::*;
        let legal = matches!(
            (self.state, to),
            (Planning, Planned)
                | (Planning, Stopped)
                | (Planned, Scheduled)
                | (Planned, Running)
                | (Planned, Stopped)
                | (Scheduled, Running)
                | (Scheduled, Stopped)
                | (Running, Running)
                | (Running, Paused)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, Stopped)
        );
        if !legal {
            return Err(IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Append a history event, keeping per-plan timestamps non-decreasing.
    pub fn append_history(&mut self, name: &str, world_id: WorldId) {
        let mut at = Utc::now();
        if let Some(last) = self.execution_history.last() {
            if last.at > at {
                at = last.at;
            }
        }
        self.execution_history.push(HistoryEvent {
            name: name.to_string(),
            world_id,
            at,
        });
    }

    /// Event names in append order, for assertions and diagnostics.
    pub fn history_names(&self) -> Vec<&str> {
        self.execution_history
            .iter()
            .map(|e| e.name.as_str())
            .collect()
    }

    /// Apply the `skip` rescue: every unfinished or failed step becomes
    /// `Skipped`. Returns how many steps were touched.
    pub fn skip_unfinished_steps(&mut self) -> usize {
        let mut skipped = 0;
        for step in self.steps.values_mut() {
            if matches!(
                step.state,
                StepState::Pending | StepState::Running | StepState::Error
            ) {
                step.state = StepState::Skipped;
                skipped += 1;
            }
        }
        skipped
    }

    /// Result derived from step outcomes once a plan closes out.
    pub fn derive_result(&self) -> PlanResult {
        if self.steps.values().any(|s| s.state == StepState::Error) {
            PlanResult::Error
        } else if self.steps.values().any(|s| s.state == StepState::Skipped) {
            PlanResult::Warning
        } else {
            PlanResult::Success
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Filter for plan queries and deletions.
#[derive(Debug, Clone, Default)]
pub struct PlanFilter {
    pub id: Option<PlanId>,
    pub state: Option<PlanState>,
}

impl PlanFilter {
    pub fn matches(&self, plan: &ExecutionPlan) -> bool {
        self.id.is_none_or(|id| id == plan.id)
            && self.state.is_none_or(|state| state == plan.state)
    }
}

/// Filter for lock queries.
#[derive(Debug, Clone, Default)]
pub struct LockFilter {
    pub id_prefix: Option<String>,
    pub owner: Option<WorldId>,
    pub category: Option<LockCategory>,
}

impl LockFilter {
    pub fn owned_by(owner: WorldId) -> Self {
        Self {
            owner: Some(owner),
            ..Self::default()
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            id_prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, lock: &Lock) -> bool {
        self.id_prefix
            .as_deref()
            .is_none_or(|p| lock.id.starts_with(p))
            && self.owner.is_none_or(|o| lock.owner_world_id == Some(o))
            && self
                .category
                .is_none_or(|c| lock.kind.category() == c)
    }
}

/// Filter for world queries.
#[derive(Debug, Clone, Default)]
pub struct WorldFilter {
    pub id: Option<WorldId>,
    pub kind: Option<WorldKind>,
}

impl WorldFilter {
    pub fn executors() -> Self {
        Self {
            kind: Some(WorldKind::Executor),
            ..Self::default()
        }
    }

    pub fn matches(&self, world: &World) -> bool {
        self.id.is_none_or(|id| id == world.id)
            && self.kind.is_none_or(|kind| kind == world.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_ids_encode_kind_and_payload() {
        let world = WorldId::new();
        let plan = PlanId::new();
        assert_eq!(
            LockKind::WorldInvalidation { world }.lock_id(),
            format!("world-invalidation:{world}")
        );
        assert_eq!(
            LockKind::ExecutionPlan {
                plan,
                role: LockRole::Planning
            }
            .lock_id(),
            format!("execution-plan:{plan}")
        );
        assert_eq!(
            LockKind::SingletonAction {
                class: "UniqueSync".to_string(),
                plan
            }
            .lock_id(),
            "singleton-action:UniqueSync"
        );
        assert_eq!(LockKind::AutoExecute.lock_id(), "auto-execute");
    }

    #[test]
    fn planning_and_execution_roles_share_a_lock_id() {
        let plan = PlanId::new();
        let planning = LockKind::ExecutionPlan {
            plan,
            role: LockRole::Planning,
        };
        let execution = LockKind::ExecutionPlan {
            plan,
            role: LockRole::Execution,
        };
        assert_eq!(planning.lock_id(), execution.lock_id());
        assert_eq!(planning.category(), LockCategory::Planning);
        assert_eq!(execution.category(), LockCategory::Execution);
    }

    #[test]
    fn terminal_state_is_never_left() {
        let mut plan = ExecutionPlan::new(WorldId::new());
        plan.transition(PlanState::Stopped).expect("planning can stop");
        for target in [
            PlanState::Planning,
            PlanState::Planned,
            PlanState::Running,
            PlanState::Paused,
        ] {
            assert!(plan.transition(target).is_err(), "stopped -> {target:?}");
        }
        assert_eq!(plan.state, PlanState::Stopped);
    }

    #[test]
    fn running_to_running_models_reassignment() {
        let mut plan = ExecutionPlan::new(WorldId::new());
        plan.transition(PlanState::Planned).expect("planned");
        plan.transition(PlanState::Running).expect("running");
        assert!(plan.transition(PlanState::Running).is_ok());
    }

    #[test]
    fn history_timestamps_are_monotonic() {
        let mut plan = ExecutionPlan::new(WorldId::new());
        let world = WorldId::new();
        for _ in 0..5 {
            plan.append_history(EVENT_START_EXECUTION, world);
        }
        let times: Vec<_> = plan.execution_history.iter().map(|e| e.at).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn skip_rescue_touches_only_unfinished_steps() {
        let mut plan = ExecutionPlan::new(WorldId::new())
            .with_step(Step::new(1, "Sync"))
            .with_step(Step::new(2, "Sync"))
            .with_step(Step::new(3, "Sync"));
        plan.steps.get_mut(&1).unwrap().state = StepState::Success;
        plan.steps.get_mut(&2).unwrap().state = StepState::Error;

        assert_eq!(plan.skip_unfinished_steps(), 2);
        assert_eq!(plan.steps[&1].state, StepState::Success);
        assert_eq!(plan.steps[&2].state, StepState::Skipped);
        assert_eq!(plan.steps[&3].state, StepState::Skipped);
        assert_eq!(plan.derive_result(), PlanResult::Warning);
    }

    #[test]
    fn action_classes_are_deduplicated_and_sorted() {
        let plan = ExecutionPlan::new(WorldId::new())
            .with_step(Step::new(1, "UniqueSync"))
            .with_step(Step::new(2, "Fetch"))
            .with_step(Step::new(3, "UniqueSync"));
        assert_eq!(plan.action_classes(), vec!["Fetch", "UniqueSync"]);
    }

    #[test]
    fn stale_worlds_age_out() {
        let mut world = World::new(WorldKind::Executor);
        let now = Utc::now();
        world.last_seen = now - chrono::Duration::milliseconds(500);
        assert!(world.is_stale(now, chrono::Duration::milliseconds(200)));
        assert!(!world.is_stale(now, chrono::Duration::seconds(1)));
    }
}
