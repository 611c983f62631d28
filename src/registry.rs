//! World registry: registration, heartbeats and staleness queries.

use chrono::Utc;

use crate::model::{World, WorldFilter, WorldId};
use crate::persistence::{Persistence, PersistenceResult, StalenessWindow};

#[derive(Clone)]
pub struct WorldRegistry {
    persistence: Box<dyn Persistence>,
    validity_timeout: chrono::Duration,
}

impl WorldRegistry {
    pub fn new(persistence: Box<dyn Persistence>, validity_timeout: chrono::Duration) -> Self {
        Self {
            persistence,
            validity_timeout,
        }
    }

    pub fn validity_timeout(&self) -> chrono::Duration {
        self.validity_timeout
    }

    pub async fn register(&self, world: &World) -> PersistenceResult<()> {
        self.persistence.register_world(world).await
    }

    pub async fn heartbeat(&self, id: WorldId) -> PersistenceResult<()> {
        self.persistence.heartbeat_world(id, Utc::now()).await
    }

    pub async fn deregister(&self, id: WorldId) -> PersistenceResult<()> {
        self.persistence.deregister_world(id).await
    }

    pub async fn find_worlds(
        &self,
        filter: &WorldFilter,
        include_stale: bool,
    ) -> PersistenceResult<Vec<World>> {
        self.persistence
            .find_worlds(filter, include_stale, StalenessWindow::new(self.validity_timeout))
            .await
    }

    /// Live executor worlds, optionally excluding one id (typically the
    /// world currently being reclaimed).
    pub async fn live_executors(
        &self,
        exclude: Option<WorldId>,
    ) -> PersistenceResult<Vec<World>> {
        let executors = self.find_worlds(&WorldFilter::executors(), false).await?;
        Ok(executors
            .into_iter()
            .filter(|w| Some(w.id) != exclude)
            .collect())
    }

    pub async fn is_registered(&self, id: WorldId) -> PersistenceResult<bool> {
        let found = self
            .find_worlds(
                &WorldFilter {
                    id: Some(id),
                    ..WorldFilter::default()
                },
                true,
            )
            .await?;
        Ok(!found.is_empty())
    }
}
