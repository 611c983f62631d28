//! Message transport between worlds.
//!
//! Messages are a tagged sum dispatched explicitly by the receiver loop.
//! Production deployments plug in a networked connector; tests and the demo
//! binary use [`InProcessConnector`], whose `stop_listening` doubles as a
//! simulated partition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{PlanId, WorldId};

const MAILBOX_DEPTH: usize = 128;

/// Coordination traffic between worlds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoordinationMessage {
    /// Ask an executor to pick an execution plan back up.
    ResumeExecution { plan_id: PlanId },
    /// Inform an executor it now owns a plan reclaimed from a dead world.
    PlanReassigned { plan_id: PlanId, from: WorldId },
    Ping,
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("world {0} is not listening")]
    Unreachable(WorldId),

    #[error("mailbox for world {0} is closed")]
    Closed(WorldId),
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    fn clone_box(&self) -> Box<dyn Connector>;

    async fn send(&self, target: WorldId, message: CoordinationMessage) -> ConnectorResult<()>;

    /// Open this world's mailbox and return the receiving half.
    async fn start_listening(&self, world: WorldId) -> mpsc::Receiver<CoordinationMessage>;

    async fn stop_listening(&self, world: WorldId);
}

impl Clone for Box<dyn Connector> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Direct in-process connector backed by per-world channels.
#[derive(Clone, Default)]
pub struct InProcessConnector {
    mailboxes: Arc<Mutex<HashMap<WorldId, mpsc::Sender<CoordinationMessage>>>>,
}

impl InProcessConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Connector for InProcessConnector {
    fn clone_box(&self) -> Box<dyn Connector> {
        Box::new(self.clone())
    }

    async fn send(&self, target: WorldId, message: CoordinationMessage) -> ConnectorResult<()> {
        let sender = {
            let mailboxes = self.mailboxes.lock().expect("mailboxes poisoned");
            mailboxes
                .get(&target)
                .cloned()
                .ok_or(ConnectorError::Unreachable(target))?
        };
        sender
            .send(message)
            .await
            .map_err(|_| ConnectorError::Closed(target))
    }

    async fn start_listening(&self, world: WorldId) -> mpsc::Receiver<CoordinationMessage> {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        let mut mailboxes = self.mailboxes.lock().expect("mailboxes poisoned");
        mailboxes.insert(world, tx);
        rx
    }

    async fn stop_listening(&self, world: WorldId) {
        let mut mailboxes = self.mailboxes.lock().expect("mailboxes poisoned");
        mailboxes.remove(&world);
    }
}
