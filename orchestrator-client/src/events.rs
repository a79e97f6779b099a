//! Lifecycle notifications for code embedding the client.
//!
//! A thin wrapper over [`tokio::sync::broadcast`]: publishing never blocks, each subscriber gets
//! its own receiver, and only events sent after `subscribe` are observed. Subscribe before
//! calling `init` to see the `Init` event.

use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{InstanceConfig, RemoteTask};

pub const DEFAULT_EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Registration and module activation finished; carries the fetched configuration.
    Init(InstanceConfig),
    /// The orchestrator asked this instance to exit. Emitted at most once per client, right
    /// before the client destroys itself.
    Exit(RemoteTask),
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Init(_) => "init",
            LifecycleEvent::Exit(_) => "exit",
        }
    }
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    /// Capacity is shared by all receivers and clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            debug!(event = name, "no lifecycle subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
