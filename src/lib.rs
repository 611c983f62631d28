//! Steward - the consistency core for durable workflow fleets
//!
//! This crate keeps a fleet of cooperating processes ("worlds") coherent
//! while they plan and execute durable multi-step workflows against a shared
//! persistence backend. The key components are:
//!
//! ## Coordination
//!
//! - [`Coordinator`]: one world's handle on the cluster (registration,
//!   heartbeats, startup sweeps, shutdown)
//! - [`Invalidator`]: declares a dead world and reclaims its locks and plans
//! - [`AutoExecutor`]: the cluster-serialized sweep resuming ownerless plans
//! - [`ValidityChecker`]: consistency sweeps over worlds and locks
//!
//! ## Shared state
//!
//! - [`Persistence`]: typed CRUD over plans, steps, locks and worlds;
//!   [`MemoryPersistence`] backs tests and single-process deployments
//! - [`LockTable`]: durable named locks, the only cross-world arbiter
//! - [`WorldRegistry`]: live participants and their heartbeats

pub mod auto_execute;
pub mod config;
pub mod connector;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod invalidator;
pub mod lock_table;
pub mod memory;
pub mod model;
pub mod observability;
pub mod persistence;
pub mod registry;
pub mod validity;

// Configuration
pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorStats};

// Data model
pub use model::{
    EVENT_FINISH_EXECUTION, EVENT_PAUSE_EXECUTION, EVENT_START_EXECUTION,
    EVENT_TERMINATE_EXECUTION, ExecutionPlan, HistoryEvent, Lock, LockCategory, LockFilter,
    LockKind, LockRole, PlanFilter, PlanId, PlanResult, PlanState, RescueStrategy, Step,
    StepState, World, WorldFilter, WorldId, WorldKind,
};

// Persistence
pub use memory::MemoryPersistence;
pub use persistence::{
    AcquireOutcome, Persistence, PersistenceError, PersistenceResult, ReleaseOutcome,
};

// Coordination primitives
pub use auto_execute::{AutoExecutor, ResumedPlan};
pub use connector::{Connector, ConnectorError, CoordinationMessage, InProcessConnector};
pub use error::{CoordinationError, CoordinationResult};
pub use executor::{Executor, InlineExecutor};
pub use invalidator::{InvalidationOutcome, InvalidationReport, Invalidator};
pub use lock_table::LockTable;
pub use registry::WorldRegistry;
pub use validity::{ValidityChecker, WorldValidity};
