//! Crawl Driver: scroll a virtualized list until every member has been
//! rendered at least once, then merge.
//!
//! `Priming -> Stepping -> (Settling | Stepping) -> Done`. The surface is
//! treated as an oracle that is polled after every driven step and also on
//! each change notification; neither channel alone is trusted to see every
//! window. All work runs on one task: notifications and payloads are only
//! handled at the driver's own suspension points, so scans never interleave.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::CrawlConfig;
use crate::correlator::PayloadCorrelator;
use crate::error::{HarvestError, HarvestResult};
use crate::events::{EventBus, HarvestEvent};
use crate::harvester::DomHarvester;
use crate::merge::merge_records;
use crate::store::HarvestStores;
use crate::surface::{bounded, ControlQuery, RenderSurface, ScrollMetrics};
use crate::types::CanonicalRecord;

/// Generic controls whose label contains "more" are treated as pagination.
const LOAD_MORE_SELECTOR: &str = r#"div[role="button"]"#;
const LOAD_MORE_LABEL: &str = r"show more|see more|\bmore\b";

/// Why stepping stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitReason {
    TargetReached,
    IdleTimeout,
    HardCap,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TargetReached => write!(f, "target reached"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::HardCap => write!(f, "hard cap"),
        }
    }
}

/// Driver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlState {
    Priming,
    Stepping,
    Settling(ExitReason),
    Done(ExitReason),
}

/// Result of one crawl session.
#[derive(Debug, Clone)]
pub struct CrawlOutcome {
    pub records: Vec<CanonicalRecord>,
    pub reason: ExitReason,
    pub steps: u32,
    pub stalls: u32,
    pub elapsed: Duration,
}

/// One crawl session over borrowed stores.
pub struct CrawlDriver<'a> {
    surface: &'a dyn RenderSurface,
    harvester: &'a DomHarvester,
    correlator: PayloadCorrelator,
    stores: &'a mut HarvestStores,
    payloads: &'a mut mpsc::UnboundedReceiver<String>,
    config: &'a CrawlConfig,
    events: &'a EventBus,
    changes: Option<mpsc::UnboundedReceiver<()>>,
    state: CrawlState,
    started: Instant,
    last_increase: Instant,
    total: usize,
    steps: u32,
    stalls: u32,
}

impl<'a> CrawlDriver<'a> {
    pub fn new(
        surface: &'a dyn RenderSurface,
        harvester: &'a DomHarvester,
        stores: &'a mut HarvestStores,
        payloads: &'a mut mpsc::UnboundedReceiver<String>,
        config: &'a CrawlConfig,
        events: &'a EventBus,
    ) -> Self {
        let now = Instant::now();
        Self {
            surface,
            harvester,
            correlator: PayloadCorrelator::new(),
            stores,
            payloads,
            config,
            events,
            changes: None,
            state: CrawlState::Priming,
            started: now,
            last_increase: now,
            total: 0,
            steps: 0,
            stalls: 0,
        }
    }

    pub fn state(&self) -> CrawlState {
        self.state
    }

    /// Drive the state machine to `Done`.
    pub async fn run(mut self) -> HarvestResult<CrawlOutcome> {
        self.started = Instant::now();
        loop {
            match self.state {
                CrawlState::Priming => {
                    self.prime().await?;
                    self.state = CrawlState::Stepping;
                }
                CrawlState::Stepping => {
                    self.state = match self.exit_reason() {
                        Some(reason) => {
                            tracing::info!(
                                "crawl stopping ({reason}): members={} steps={} stalls={}",
                                self.total,
                                self.steps,
                                self.stalls
                            );
                            CrawlState::Settling(reason)
                        }
                        None => {
                            self.step().await;
                            CrawlState::Stepping
                        }
                    };
                }
                CrawlState::Settling(reason) => {
                    self.settle().await;
                    self.state = CrawlState::Done(reason);
                }
                CrawlState::Done(reason) => {
                    let records = merge_records(&self.stores.presence, &self.stores.metadata);
                    let elapsed = self.started.elapsed();
                    self.events.emit(HarvestEvent::CrawlComplete {
                        count: records.len(),
                        reason,
                        elapsed_ms: elapsed.as_millis() as u64,
                    });
                    return Ok(CrawlOutcome {
                        records,
                        reason,
                        steps: self.steps,
                        stalls: self.stalls,
                        elapsed,
                    });
                }
            }
        }
    }

    async fn prime(&mut self) -> HarvestResult<()> {
        let surface = self.surface;
        match bounded(self.op_limit(), surface.locate_scroller()).await {
            Ok(true) => {}
            Ok(false) => return Err(HarvestError::NoScrollSurface),
            Err(e) => return Err(HarvestError::Surface(e)),
        }

        self.drain_payloads();
        self.scan("prime").await;
        self.total = self.stores.presence.len();
        self.last_increase = Instant::now();
        if self.total > 0 {
            self.events.emit(HarvestEvent::Progress { count: self.total });
        }

        match bounded(self.op_limit(), surface.watch_changes()).await {
            Ok(rx) => self.changes = Some(rx),
            Err(e) => tracing::warn!("change notifications unavailable, polling only: {e:#}"),
        }
        tracing::info!("crawl started: baseline={}", self.total);
        Ok(())
    }

    /// One scroll advance plus the redundant nudges, a pause, and a forced
    /// scan. Retries once at half magnitude if the surface did not move.
    async fn step(&mut self) {
        let surface = self.surface;
        let step_px = f64::from(self.config.step_px);
        self.steps += 1;

        let before = self.metrics().await;

        self.nudge("scroll", surface.scroll_by(step_px, self.config.scroll_animation()))
            .await;
        self.nudge("reveal-last", surface.reveal_last_fragment()).await;
        self.nudge("wheel", surface.dispatch_wheel(self.config.wheel_delta()))
            .await;
        self.nudge("page-down", surface.dispatch_page_down()).await;
        let load_more = ControlQuery::document(LOAD_MORE_SELECTOR).labelled(LOAD_MORE_LABEL);
        match bounded(self.op_limit(), surface.activate(&load_more)).await {
            Ok(true) => tracing::debug!("activated load-more control"),
            Ok(false) => {}
            Err(e) => tracing::debug!("load-more probe failed: {e:#}"),
        }
        self.absorb_pending_changes().await;

        self.pause(self.config.step_pause()).await;
        self.scan("step").await;

        let after = self.metrics().await;
        if let (Some(b), Some(a)) = (before, after) {
            if b == a {
                self.stalls += 1;
                tracing::debug!(
                    "surface did not move (top={} height={}); half-step retry",
                    a.top,
                    a.height
                );
                self.nudge(
                    "half-step",
                    surface.scroll_by(step_px / 2.0, self.config.scroll_animation()),
                )
                .await;
                self.scan("half-step").await;
            }
        }
    }

    /// Quiet period, unsubscribe, final scan. Part of what is left of the
    /// hard cap is held back so the final scan always gets a window.
    async fn settle(&mut self) {
        let remaining = self.remaining();
        let reserve = (remaining / 2).min(self.config.op_timeout());
        self.pause(self.config.settle().min(remaining - reserve)).await;

        self.changes = None;
        let surface = self.surface;
        if let Err(e) = bounded(self.op_limit(), surface.unwatch_changes()).await {
            tracing::debug!("unwatch failed: {e:#}");
        }

        match bounded(self.op_limit(), surface.fragments()).await {
            Ok(frags) => {
                self.harvester.scan_fragments(&frags, self.stores);
            }
            Err(e) => tracing::warn!("final scan failed: {e:#}"),
        }
        self.drain_payloads();
        self.track_growth();
    }

    fn exit_reason(&self) -> Option<ExitReason> {
        if self.stores.presence.len() >= self.config.target_count {
            Some(ExitReason::TargetReached)
        } else if self.last_increase.elapsed() >= self.config.max_idle() {
            Some(ExitReason::IdleTimeout)
        } else if self.started.elapsed() >= self.config.stepping_budget() {
            Some(ExitReason::HardCap)
        } else {
            None
        }
    }

    /// Wait for `duration`, servicing notifications and payloads meanwhile.
    async fn pause(&mut self, duration: Duration) {
        let sleep = tokio::time::sleep(duration.min(self.remaining()));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                Some(()) = next_change(&mut self.changes) => {
                    self.coalesce_changes();
                    self.scan("change").await;
                }
                Some(raw) = self.payloads.recv() => {
                    self.correlator.ingest(&raw, &mut self.stores.metadata);
                }
            }
        }
    }

    /// Scan once if any notifications are queued.
    async fn absorb_pending_changes(&mut self) {
        if self.coalesce_changes() > 0 {
            self.scan("change").await;
        }
        self.drain_payloads();
    }

    fn coalesce_changes(&mut self) -> usize {
        let mut n = 0;
        if let Some(rx) = self.changes.as_mut() {
            while rx.try_recv().is_ok() {
                n += 1;
            }
        }
        n
    }

    fn drain_payloads(&mut self) {
        while let Ok(raw) = self.payloads.try_recv() {
            self.correlator.ingest(&raw, &mut self.stores.metadata);
        }
    }

    async fn scan(&mut self, trigger: &'static str) {
        let limit = self.op_limit();
        let surface = self.surface;
        match bounded(limit, surface.fragments()).await {
            Ok(frags) => {
                let report = self.harvester.scan_fragments(&frags, self.stores);
                if report.new_identities > 0 {
                    tracing::debug!(
                        "{trigger} scan: +{} members ({} fresh fragments)",
                        report.new_identities,
                        report.fresh
                    );
                }
            }
            Err(e) => tracing::debug!("{trigger} scan skipped: {e:#}"),
        }
        self.track_growth();
    }

    fn track_growth(&mut self) {
        let n = self.stores.presence.len();
        if n > self.total {
            self.total = n;
            self.last_increase = Instant::now();
            self.events.emit(HarvestEvent::Progress { count: n });
        }
    }

    async fn nudge<F>(&mut self, what: &'static str, fut: F)
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        if let Err(e) = bounded(self.op_limit(), fut).await {
            tracing::debug!("{what} nudge failed: {e:#}");
        }
        self.absorb_pending_changes().await;
    }

    async fn metrics(&self) -> Option<ScrollMetrics> {
        bounded(self.op_limit(), self.surface.scroll_metrics())
            .await
            .ok()
    }

    /// Time left before the current phase must end: the stepping budget
    /// while priming or stepping, the hard cap afterwards.
    fn remaining(&self) -> Duration {
        let budget = match self.state {
            CrawlState::Priming | CrawlState::Stepping => self.config.stepping_budget(),
            CrawlState::Settling(_) | CrawlState::Done(_) => self.config.hard_cap(),
        };
        budget.saturating_sub(self.started.elapsed())
    }

    /// Per-call limit: the operation timeout, clamped to the phase budget.
    fn op_limit(&self) -> Duration {
        self.config.op_timeout().min(self.remaining())
    }
}

async fn next_change(changes: &mut Option<mpsc::UnboundedReceiver<()>>) -> Option<()> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
