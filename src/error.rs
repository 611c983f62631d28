//! Crate-level coordination error.
//!
//! A thin wrapper over the subsystem errors rather than a god error; each
//! subsystem keeps its own concrete type.

use thiserror::Error;

use crate::connector::ConnectorError;
use crate::persistence::PersistenceError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoordinationError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Transport(#[from] ConnectorError),

    /// A plan loaded but its stored shape is unusable (e.g. steps missing).
    #[error("data consistency: {0}")]
    DataConsistency(String),

    #[error("executor failure: {0}")]
    Executor(String),
}

impl CoordinationError {
    /// NotFound is never fatal during reclamation; callers treat it as
    /// "already reclaimed".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Persistence(e) if e.is_not_found())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Persistence(e) if e.is_conflict())
    }
}

pub type CoordinationResult<T> = Result<T, CoordinationError>;
