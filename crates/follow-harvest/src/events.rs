//! Outbound events: crawl progress and batch completion.
//!
//! The [`EventBus`] is a `tokio::sync::broadcast` channel. Any consumer (a
//! live counter, a notification surface, the stdio protocol) can subscribe
//! independently. With no subscribers, events are dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::crawl::ExitReason;

/// Every event the harvester emits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HarvestEvent {
    /// The presence store grew during a crawl.
    Progress { count: usize },
    /// A batch of actions finished.
    BatchDone { count: usize },
    /// A crawl session reached `Done`.
    #[serde(rename_all = "camelCase")]
    CrawlComplete {
        count: usize,
        reason: ExitReason,
        elapsed_ms: u64,
    },
}

/// Fan-out channel for [`HarvestEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HarvestEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: HarvestEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HarvestEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
