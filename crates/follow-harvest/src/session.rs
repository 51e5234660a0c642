//! Harvest session: the inbound interface over one render surface.
//!
//! Owns the stores for as long as the caller keeps the session, so a
//! `resume` load extends the previous enumeration instead of restarting it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::config::HarvestConfig;
use crate::correlator::{IngestReport, PayloadCorrelator};
use crate::crawl::{CrawlDriver, CrawlOutcome};
use crate::error::{HarvestError, HarvestResult};
use crate::events::{EventBus, HarvestEvent};
use crate::executor::{BatchExecutor, BatchReport};
use crate::harvester::DomHarvester;
use crate::store::HarvestStores;
use crate::surface::{bounded, RenderSurface};
use crate::types::{CanonicalRecord, MemberIdentity};

/// Sender half of the payload channel. Intercepted response bodies pushed
/// here are absorbed at the crawl's next suspension point.
pub type PayloadSink = mpsc::UnboundedSender<String>;

/// Whether `path` is a following-list view (`/<handle>/following`, with or
/// without a trailing segment).
pub fn is_following_view(path: &str) -> bool {
    path.split(['?', '#'])
        .next()
        .is_some_and(|p| p.split('/').any(|seg| seg == "following"))
}

/// Wire result of an unfollow batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub completed_count: usize,
}

pub struct FollowingHarvester {
    surface: Arc<dyn RenderSurface>,
    config: HarvestConfig,
    stores: HarvestStores,
    harvester: DomHarvester,
    correlator: PayloadCorrelator,
    executor: BatchExecutor,
    events: EventBus,
    payload_tx: PayloadSink,
    payload_rx: mpsc::UnboundedReceiver<String>,
}

impl FollowingHarvester {
    pub fn new(surface: Arc<dyn RenderSurface>, config: HarvestConfig) -> Self {
        Self::with_events(surface, config, EventBus::default())
    }

    pub fn with_events(
        surface: Arc<dyn RenderSurface>,
        config: HarvestConfig,
        events: EventBus,
    ) -> Self {
        let (payload_tx, payload_rx) = mpsc::unbounded_channel();
        Self {
            harvester: DomHarvester::new(&config),
            executor: BatchExecutor::new(config.executor.clone(), config.crawl.op_timeout()),
            correlator: PayloadCorrelator::new(),
            stores: HarvestStores::new(),
            surface,
            config,
            events,
            payload_tx,
            payload_rx,
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn stores(&self) -> &HarvestStores {
        &self.stores
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HarvestEvent> {
        self.events.subscribe()
    }

    pub fn payload_sink(&self) -> PayloadSink {
        self.payload_tx.clone()
    }

    /// Liveness probe: the surface answers and shows a following view.
    pub async fn ping(&self) -> bool {
        self.ensure_view().await.is_ok()
    }

    /// Fail with `WrongView` unless the surface shows a following list.
    /// A surface that does not answer within the operation timeout is a
    /// `Surface` error.
    pub async fn ensure_view(&self) -> HarvestResult<()> {
        let path = bounded(self.config.crawl.op_timeout(), self.surface.current_path())
            .await
            .map_err(HarvestError::Surface)?;
        if is_following_view(&path) {
            Ok(())
        } else {
            Err(HarvestError::WrongView(path))
        }
    }

    /// Enumerate the list until `limit` members are known or the crawl
    /// gives up. Returns nothing when the active view is not a following
    /// list.
    pub async fn load_following(
        &mut self,
        limit: usize,
        resume: bool,
    ) -> HarvestResult<Vec<CanonicalRecord>> {
        match self.crawl(limit, resume).await {
            Ok(outcome) => Ok(outcome.records),
            Err(HarvestError::WrongView(path)) => {
                tracing::warn!("not a following view ({path}); nothing loaded");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`Self::load_following`], but reports the wrong-view case as an
    /// error and returns the full crawl outcome. A `limit` of zero means the
    /// configured target count.
    pub async fn crawl(&mut self, limit: usize, resume: bool) -> HarvestResult<CrawlOutcome> {
        self.ensure_view().await?;
        let limit = if limit == 0 {
            self.config.crawl.target_count
        } else {
            limit
        };

        if resume {
            tracing::info!(
                "resuming load: limit={limit} known={}",
                self.stores.presence.len()
            );
        } else {
            self.stores.reset();
            tracing::info!("starting load: limit={limit}");
        }
        self.stores.begin_crawl();

        let mut crawl = self.config.crawl.clone();
        crawl.target_count = limit;
        CrawlDriver::new(
            self.surface.as_ref(),
            &self.harvester,
            &mut self.stores,
            &mut self.payload_rx,
            &crawl,
            &self.events,
        )
        .run()
        .await
    }

    pub async fn unfollow_users(&mut self, identities: &[MemberIdentity]) -> BatchOutcome {
        let report = self.unfollow_report(identities).await;
        BatchOutcome {
            completed_count: report.completed,
        }
    }

    pub async fn unfollow_report(&mut self, identities: &[MemberIdentity]) -> BatchReport {
        self.executor
            .run(self.surface.as_ref(), identities, &self.events)
            .await
    }

    /// Absorb one intercepted response body immediately.
    pub fn ingest_network_payload(&mut self, raw: &str) -> IngestReport {
        self.correlator.ingest(raw, &mut self.stores.metadata)
    }
}
