//! Render surface abstraction.
//!
//! Defines the [`RenderSurface`] trait the harvester drives: query rendered
//! list-item fragments, scroll, dispatch synthetic input, click controls and
//! observe subtree changes. The browser-backed implementation lives in the
//! CLI crate; [`virtual_list::VirtualListSurface`] simulates one offline.

pub mod virtual_list;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::types::FragmentToken;

/// One rendered list item at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Stable for as long as this physical element stays mounted.
    pub token: FragmentToken,
    /// Outer HTML of the element.
    pub html: String,
}

/// Scroll position and scrollable extent of the list container.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScrollMetrics {
    pub top: f64,
    pub height: f64,
}

/// Which control to activate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlQuery {
    /// Restrict the search to one fragment; `None` searches the document.
    pub scope: Option<FragmentToken>,
    /// CSS selector.
    pub selector: String,
    /// Case-insensitive regular expression matched against the element's
    /// text. `None` accepts the first selector match.
    pub label: Option<String>,
}

impl ControlQuery {
    pub fn document(selector: impl Into<String>) -> Self {
        Self {
            scope: None,
            selector: selector.into(),
            label: None,
        }
    }

    pub fn within(token: FragmentToken, selector: impl Into<String>) -> Self {
        Self {
            scope: Some(token),
            selector: selector.into(),
            label: None,
        }
    }

    pub fn labelled(mut self, pattern: impl Into<String>) -> Self {
        self.label = Some(pattern.into());
        self
    }
}

/// The host page the harvester operates on.
#[async_trait]
pub trait RenderSurface: Send + Sync {
    /// Path component of the current view's URL.
    async fn current_path(&self) -> Result<String>;
    /// Whether a scrollable list container can be found.
    async fn locate_scroller(&self) -> Result<bool>;
    /// Every list-item fragment currently rendered.
    async fn fragments(&self) -> Result<Vec<Fragment>>;
    /// Current scroll position and extent of the list container.
    async fn scroll_metrics(&self) -> Result<ScrollMetrics>;
    /// Scroll by `px`, animated over `duration`.
    async fn scroll_by(&self, px: f64, duration: Duration) -> Result<()>;
    /// Bring the last rendered fragment to the bottom of the viewport.
    async fn reveal_last_fragment(&self) -> Result<()>;
    /// Dispatch a synthetic wheel event on the container.
    async fn dispatch_wheel(&self, delta_y: f64) -> Result<()>;
    /// Dispatch a synthetic page-advance key.
    async fn dispatch_page_down(&self) -> Result<()>;
    /// Click the control described by `query`. Returns whether one was found.
    async fn activate(&self, query: &ControlQuery) -> Result<bool>;
    /// Start observing subtree mutations. Each message is one notification.
    async fn watch_changes(&self) -> Result<mpsc::UnboundedReceiver<()>>;
    /// Stop observing.
    async fn unwatch_changes(&self) -> Result<()>;
}

/// Await one surface call for at most `limit`. An elapsed timer becomes an
/// error like any other surface failure.
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(anyhow::anyhow!("surface call timed out after {limit:?}")),
    }
}
