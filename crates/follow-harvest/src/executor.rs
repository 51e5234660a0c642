//! Batch Action Executor: sequential, rate-limited unfollow over a list of
//! identities.
//!
//! Only members currently rendered can be acted on; anything else is
//! skipped. The batch never aborts on a per-member failure.

use rand::Rng;
use regex::escape;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ExecutorConfig;
use crate::events::{EventBus, HarvestEvent};
use crate::surface::{bounded, ControlQuery, Fragment, RenderSurface};
use crate::types::{FragmentToken, MemberIdentity};

/// Why an identity was not acted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "reason", content = "detail")]
pub enum SkipReason {
    /// No rendered fragment links to the member's profile.
    NotRendered,
    /// The fragment has no action control (already actioned, or not a
    /// member cell).
    NoControl,
    /// The surface failed while locating or activating.
    Failed(String),
}

/// Result of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub completed: usize,
    pub skipped: Vec<(MemberIdentity, SkipReason)>,
}

pub struct BatchExecutor {
    config: ExecutorConfig,
    /// Upper bound on each surface call.
    op_timeout: Duration,
    link_selector: Selector,
}

impl BatchExecutor {
    pub fn new(config: ExecutorConfig, op_timeout: Duration) -> Self {
        Self {
            config,
            op_timeout,
            link_selector: Selector::parse("a[href]").expect("link selector is valid"),
        }
    }

    /// Act on each identity in order, pausing between consecutive members.
    pub async fn run(
        &self,
        surface: &dyn RenderSurface,
        identities: &[MemberIdentity],
        events: &EventBus,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        tracing::info!("unfollow batch started: {} members", identities.len());

        for (i, identity) in identities.iter().enumerate() {
            match self.act_on(surface, identity).await {
                Ok(()) => {
                    report.completed += 1;
                    tracing::debug!("unfollowed {identity}");
                }
                Err(reason) => {
                    tracing::info!("skipping {identity}: {reason:?}");
                    report.skipped.push((identity.clone(), reason));
                }
            }

            if i + 1 < identities.len() {
                tokio::time::sleep(self.next_delay()).await;
            }
        }

        tracing::info!(
            "unfollow batch done: completed={} skipped={}",
            report.completed,
            report.skipped.len()
        );
        events.emit(HarvestEvent::BatchDone {
            count: report.completed,
        });
        report
    }

    async fn act_on(
        &self,
        surface: &dyn RenderSurface,
        identity: &MemberIdentity,
    ) -> Result<(), SkipReason> {
        let fragments = bounded(self.op_timeout, surface.fragments())
            .await
            .map_err(|e| SkipReason::Failed(format!("{e:#}")))?;
        let token = self
            .locate(&fragments, identity)
            .ok_or(SkipReason::NotRendered)?;

        let control = ControlQuery::within(
            token,
            format!(r#"[data-testid$="{}"]"#, self.config.control_marker_suffix),
        );
        let activated = bounded(self.op_timeout, surface.activate(&control))
            .await
            .map_err(|e| SkipReason::Failed(format!("{e:#}")))?;
        if !activated {
            return Err(SkipReason::NoControl);
        }

        tokio::time::sleep(self.config.confirm_delay()).await;
        self.confirm(surface).await;
        Ok(())
    }

    /// Click the dedicated confirmation control, else a generic button
    /// labelled with the action verb. Absence is not an error.
    async fn confirm(&self, surface: &dyn RenderSurface) {
        let marker = ControlQuery::document(format!(
            r#"[data-testid="{}"]"#,
            self.config.confirm_marker
        ));
        let verb = ControlQuery::document(r#"div[role="button"]"#)
            .labelled(format!(r"^\s*{}\s*$", escape(&self.config.action_verb)));

        for query in [marker, verb] {
            match bounded(self.op_timeout, surface.activate(&query)).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => tracing::debug!("confirmation probe failed: {e:#}"),
            }
        }
        tracing::debug!("no confirmation control appeared");
    }

    /// Token of the first fragment linking to `/{identity}`.
    fn locate(&self, fragments: &[Fragment], identity: &MemberIdentity) -> Option<FragmentToken> {
        let href = format!("/{identity}");
        fragments
            .iter()
            .find(|f| {
                Html::parse_fragment(&f.html)
                    .select(&self.link_selector)
                    .any(|a| a.value().attr("href") == Some(href.as_str()))
            })
            .map(|f| f.token)
    }

    fn next_delay(&self) -> Duration {
        let jitter = if self.config.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.config.jitter_ms)
        };
        Duration::from_millis(self.config.base_delay_ms + jitter)
    }
}
