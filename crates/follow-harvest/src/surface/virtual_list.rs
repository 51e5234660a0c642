//! A simulated virtualized, infinitely-scrolling list.
//!
//! Rows are fixed height. Only the rows intersecting the viewport plus an
//! overscan band are mounted; a row that leaves the band is unmounted and
//! gets a fresh fragment token if it comes back. Data arrives in pages: a
//! page loads when the viewport nears the loaded tail (or when the
//! "Show more" control is clicked, if configured), and every page load
//! pushes a timeline payload into the attached payload sink.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use scraper::{Html, Selector};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use super::{ControlQuery, Fragment, RenderSurface, ScrollMetrics};
use crate::types::FragmentToken;

/// One member of the simulated list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimMember {
    pub handle: String,
    pub display_name: String,
    pub avatar: String,
    pub follows_you: bool,
}

impl SimMember {
    pub fn new(handle: impl Into<String>, display_name: impl Into<String>) -> Self {
        let handle = handle.into();
        Self {
            avatar: format!("https://pbs.example.com/profile_images/{handle}_normal.jpg"),
            handle,
            display_name: display_name.into(),
            follows_you: false,
        }
    }

    pub fn following_back(mut self) -> Self {
        self.follows_you = true;
        self
    }

    /// `count` generated members; every `follow_back_every`-th follows back.
    pub fn generate(count: usize, follow_back_every: Option<usize>) -> Vec<Self> {
        (0..count)
            .map(|i| {
                let m = Self::new(format!("member_{i:05}"), format!("Member {i}"));
                match follow_back_every {
                    Some(k) if k > 0 && i % k == 0 => m.following_back(),
                    _ => m,
                }
            })
            .collect()
    }
}

/// Geometry and paging of the simulated list.
#[derive(Debug, Clone)]
pub struct VirtualListConfig {
    pub row_height: f64,
    pub viewport_height: f64,
    /// Rows mounted above and below the viewport.
    pub overscan_rows: usize,
    pub page_size: usize,
    /// Path reported by `current_path`.
    pub path: String,
    pub has_scroller: bool,
    /// Pages load only when the "Show more" control is clicked.
    pub requires_load_more: bool,
    /// Ordering tokens count down from this instant, one minute per row.
    pub newest_follow: DateTime<Utc>,
}

impl Default for VirtualListConfig {
    fn default() -> Self {
        Self {
            row_height: 80.0,
            viewport_height: 800.0,
            overscan_rows: 10,
            page_size: 10,
            path: "/operator/following".to_string(),
            has_scroller: true,
            requires_load_more: false,
            newest_follow: DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
        }
    }
}

struct SimState {
    members: Vec<SimMember>,
    loaded: usize,
    top: f64,
    mounted: BTreeMap<usize, FragmentToken>,
    next_token: u64,
    watchers: Vec<mpsc::UnboundedSender<()>>,
    payload_sink: Option<mpsc::UnboundedSender<String>>,
    pending_confirm: Option<usize>,
    unfollowed: Vec<String>,
    pages_loaded: usize,
}

/// In-memory [`RenderSurface`] with render virtualization.
pub struct VirtualListSurface {
    config: VirtualListConfig,
    state: Mutex<SimState>,
}

impl VirtualListSurface {
    /// A non-positive or non-finite `row_height` falls back to the default.
    pub fn new(members: Vec<SimMember>, mut config: VirtualListConfig) -> Self {
        if !(config.row_height.is_finite() && config.row_height > 0.0) {
            tracing::warn!(
                "invalid row height {}; using the default",
                config.row_height
            );
            config.row_height = VirtualListConfig::default().row_height;
        }
        let mut state = SimState {
            loaded: config.page_size.min(members.len()),
            members,
            top: 0.0,
            mounted: BTreeMap::new(),
            next_token: 0,
            watchers: Vec::new(),
            payload_sink: None,
            pending_confirm: None,
            unfollowed: Vec::new(),
            pages_loaded: 1,
        };
        remount(&config, &mut state);
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Route page-load payloads to `sink`. Pages already loaded are sent
    /// immediately.
    pub async fn attach_payload_sink(&self, sink: mpsc::UnboundedSender<String>) {
        let mut st = self.state.lock().await;
        for page_start in (0..st.loaded).step_by(self.config.page_size.max(1)) {
            let end = (page_start + self.config.page_size).min(st.loaded);
            let _ = sink.send(timeline_payload(&self.config, &st.members, page_start, end));
        }
        st.payload_sink = Some(sink);
    }

    /// Handles whose unfollow was confirmed, in order.
    pub async fn unfollowed(&self) -> Vec<String> {
        self.state.lock().await.unfollowed.clone()
    }

    /// Rows currently loaded (not necessarily mounted).
    pub async fn loaded(&self) -> usize {
        self.state.lock().await.loaded
    }

    pub async fn pages_loaded(&self) -> usize {
        self.state.lock().await.pages_loaded
    }

    /// Jump to an absolute scroll offset, as a user would.
    pub async fn scroll_to(&self, top: f64) {
        let mut st = self.state.lock().await;
        set_top(&self.config, &mut st, top);
    }
}

#[async_trait]
impl RenderSurface for VirtualListSurface {
    async fn current_path(&self) -> Result<String> {
        Ok(self.config.path.clone())
    }

    async fn locate_scroller(&self) -> Result<bool> {
        Ok(self.config.has_scroller)
    }

    async fn fragments(&self) -> Result<Vec<Fragment>> {
        let st = self.state.lock().await;
        Ok(st
            .mounted
            .iter()
            .map(|(&row, &token)| Fragment {
                token,
                html: render_row(&st.members[row], st.unfollowed.contains(&st.members[row].handle)),
            })
            .collect())
    }

    async fn scroll_metrics(&self) -> Result<ScrollMetrics> {
        let st = self.state.lock().await;
        Ok(ScrollMetrics {
            top: st.top,
            height: extent(&self.config, &st),
        })
    }

    async fn scroll_by(&self, px: f64, duration: Duration) -> Result<()> {
        tokio::time::sleep(duration).await;
        let mut st = self.state.lock().await;
        let target = st.top + px;
        set_top(&self.config, &mut st, target);
        Ok(())
    }

    async fn reveal_last_fragment(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        let Some((&last, _)) = st.mounted.iter().next_back() else {
            return Ok(());
        };
        let target = (last + 1) as f64 * self.config.row_height - self.config.viewport_height;
        set_top(&self.config, &mut st, target);
        Ok(())
    }

    async fn dispatch_wheel(&self, delta_y: f64) -> Result<()> {
        let mut st = self.state.lock().await;
        let target = st.top + delta_y;
        set_top(&self.config, &mut st, target);
        Ok(())
    }

    async fn dispatch_page_down(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        let target = st.top + self.config.viewport_height * 0.9;
        set_top(&self.config, &mut st, target);
        Ok(())
    }

    async fn activate(&self, query: &ControlQuery) -> Result<bool> {
        let mut st = self.state.lock().await;
        activate_in(&self.config, &mut st, query)
    }

    async fn watch_changes(&self) -> Result<mpsc::UnboundedReceiver<()>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.watchers.push(tx);
        Ok(rx)
    }

    async fn unwatch_changes(&self) -> Result<()> {
        self.state.lock().await.watchers.clear();
        Ok(())
    }
}

fn extent(config: &VirtualListConfig, st: &SimState) -> f64 {
    st.loaded as f64 * config.row_height
}

fn set_top(config: &VirtualListConfig, st: &mut SimState, target: f64) {
    let max_top = (extent(config, st) - config.viewport_height).max(0.0);
    st.top = target.clamp(0.0, max_top);
    if !config.requires_load_more && st.top + 2.0 * config.viewport_height >= extent(config, st) {
        load_next_page(config, st);
    }
    remount(config, st);
}

fn load_next_page(config: &VirtualListConfig, st: &mut SimState) -> bool {
    if st.loaded >= st.members.len() {
        return false;
    }
    let start = st.loaded;
    st.loaded = (start + config.page_size.max(1)).min(st.members.len());
    st.pages_loaded += 1;
    if let Some(sink) = &st.payload_sink {
        let _ = sink.send(timeline_payload(config, &st.members, start, st.loaded));
    }
    true
}

/// Mount the rows intersecting the viewport band; notify on any change.
fn remount(config: &VirtualListConfig, st: &mut SimState) {
    let first_visible = (st.top / config.row_height).floor() as usize;
    let last_visible = ((st.top + config.viewport_height) / config.row_height).ceil() as usize;
    let first = first_visible.saturating_sub(config.overscan_rows);
    let end = last_visible.saturating_add(config.overscan_rows).min(st.loaded);

    let before = st.mounted.len();
    st.mounted.retain(|row, _| (first..end).contains(row));
    let mut changed = st.mounted.len() != before;
    for row in first..end {
        if !st.mounted.contains_key(&row) {
            st.next_token += 1;
            st.mounted.insert(row, FragmentToken(st.next_token));
            changed = true;
        }
    }
    if changed {
        notify(st);
    }
}

fn notify(st: &mut SimState) {
    st.watchers.retain(|w| w.send(()).is_ok());
}

fn activate_in(config: &VirtualListConfig, st: &mut SimState, query: &ControlQuery) -> Result<bool> {
    let selector =
        Selector::parse(&query.selector).map_err(|e| anyhow!("bad selector {:?}: {e:?}", query.selector))?;
    let label = match &query.label {
        Some(p) => Some(RegexBuilder::new(p).case_insensitive(true).build()?),
        None => None,
    };

    let (html, scoped_row) = match query.scope {
        Some(token) => {
            let Some((&row, _)) = st.mounted.iter().find(|(_, t)| **t == token) else {
                return Ok(false);
            };
            let member = &st.members[row];
            (render_row(member, st.unfollowed.contains(&member.handle)), Some(row))
        }
        None => (render_document(config, st), None),
    };

    let action = {
        let doc = Html::parse_fragment(&html);
        doc.select(&selector)
            .find(|el| match &label {
                Some(re) => re.is_match(&el.text().collect::<String>()),
                None => true,
            })
            .and_then(|el| el.value().attr("data-sim-action").map(str::to_string))
    };

    let Some(action) = action else {
        return Ok(false);
    };
    match action.as_str() {
        "unfollow" => {
            let Some(row) = scoped_row.or_else(|| st.mounted.keys().next().copied()) else {
                bail!("unfollow control outside any row");
            };
            st.pending_confirm = Some(row);
        }
        "confirm" => {
            if let Some(row) = st.pending_confirm.take() {
                let handle = st.members[row].handle.clone();
                st.unfollowed.push(handle);
                notify(st);
            }
        }
        "cancel" => st.pending_confirm = None,
        "load-more" => {
            if load_next_page(config, st) {
                remount(config, st);
            }
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn render_document(config: &VirtualListConfig, st: &SimState) -> String {
    let mut html = String::from(
        r#"<nav><a href="/home">Home</a><a href="/explore">Explore</a></nav><section aria-labelledby="accessible-list-1">"#,
    );
    for &row in st.mounted.keys() {
        let member = &st.members[row];
        html.push_str(&render_row(member, st.unfollowed.contains(&member.handle)));
    }
    html.push_str("</section>");
    if config.requires_load_more && st.loaded < st.members.len() {
        html.push_str(r#"<div role="button" data-sim-action="load-more"><span>Show more</span></div>"#);
    }
    if st.pending_confirm.is_some() {
        html.push_str(
            r#"<div data-testid="confirmationSheetDialog"><div role="button" data-testid="confirmationSheetConfirm" data-sim-action="confirm"><span>Unfollow</span></div><div role="button" data-testid="confirmationSheetCancel" data-sim-action="cancel"><span>Cancel</span></div></div>"#,
        );
    }
    html
}

fn render_row(m: &SimMember, unfollowed: bool) -> String {
    let handle = escape_html(&m.handle);
    let name = escape_html(&m.display_name);
    let badge = if m.follows_you {
        r#"<div><span>Follows you</span></div>"#
    } else {
        ""
    };
    let button = if unfollowed {
        format!(r#"<div role="button" data-testid="{handle}-follow"><span>Follow</span></div>"#)
    } else {
        format!(
            r#"<div role="button" data-testid="{handle}-unfollow" data-sim-action="unfollow"><span>Following</span></div>"#
        )
    };
    format!(
        r#"<div data-testid="UserCell"><a href="/i/connect_people">Who to follow</a><a href="/{handle}" role="link"><img alt="" src="{avatar}"></a><div><a href="/{handle}"><div dir="auto"><span>{name}</span></div></a><a href="/{handle}"><span>@{handle}</span></a>{badge}</div>{button}</div>"#,
        avatar = escape_html(&m.avatar),
    )
}

fn timeline_payload(config: &VirtualListConfig, members: &[SimMember], start: usize, end: usize) -> String {
    let newest_ms = config.newest_follow.timestamp_millis();
    let entries: Vec<Value> = members[start..end]
        .iter()
        .enumerate()
        .map(|(offset, m)| {
            let row = (start + offset) as i64;
            json!({
                "entryId": format!("user-{}", m.handle),
                "sortIndex": (newest_ms - row * 60_000).to_string(),
                "content": { "itemContent": { "user_results": { "result": {
                    "legacy": {
                        "screen_name": m.handle,
                        "name": m.display_name,
                        "status": { "created_at": "Tue Nov 14 22:13:20 +0000 2023" }
                    }
                }}}}
            })
        })
        .collect();
    json!({
        "data": { "user": { "result": { "timeline": { "timeline": {
            "instructions": [ { "type": "TimelineAddEntries", "entries": entries } ]
        }}}}}
    })
    .to_string()
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface(n: usize) -> VirtualListSurface {
        VirtualListSurface::new(SimMember::generate(n, None), VirtualListConfig::default())
    }

    #[tokio::test]
    async fn test_initial_window_is_partial() {
        let s = surface(100);
        let frags = s.fragments().await.unwrap();
        // First page only: 10 rows loaded, all inside viewport + overscan.
        assert_eq!(frags.len(), 10);
        assert_eq!(s.loaded().await, 10);
    }

    #[tokio::test]
    async fn test_zero_row_height_falls_back_to_default() {
        let s = VirtualListSurface::new(
            SimMember::generate(30, None),
            VirtualListConfig {
                row_height: 0.0,
                ..VirtualListConfig::default()
            },
        );
        assert_eq!(s.fragments().await.unwrap().len(), 10);
        s.dispatch_page_down().await.unwrap();
        assert_eq!(s.scroll_metrics().await.unwrap().height, 20.0 * 80.0);
    }

    #[tokio::test]
    async fn test_scrolling_recycles_tokens() {
        let s = surface(200);
        let first = s.fragments().await.unwrap()[0].token;
        for _ in 0..20 {
            s.dispatch_wheel(800.0).await.unwrap();
        }
        s.scroll_to(0.0).await;
        let again = s.fragments().await.unwrap()[0].token;
        assert_ne!(first, again, "remounted row must get a fresh token");
    }

    #[tokio::test]
    async fn test_watchers_notified_on_window_change() {
        let s = surface(100);
        let mut rx = s.watch_changes().await.unwrap();
        s.dispatch_page_down().await.unwrap();
        assert!(rx.try_recv().is_ok());
        s.unwatch_changes().await.unwrap();
        s.dispatch_page_down().await.unwrap();
        while rx.try_recv().is_ok() {}
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_page_loads_emit_payloads() {
        let s = surface(30);
        let (tx, mut rx) = mpsc::unbounded_channel();
        s.attach_payload_sink(tx).await;
        assert!(rx.try_recv().unwrap().contains("member_00000"));
        s.dispatch_wheel(400.0).await.unwrap();
        assert!(rx.try_recv().unwrap().contains("member_00010"));
    }

    #[tokio::test]
    async fn test_load_more_control() {
        let config = VirtualListConfig {
            requires_load_more: true,
            ..VirtualListConfig::default()
        };
        let s = VirtualListSurface::new(SimMember::generate(25, None), config);
        s.dispatch_wheel(5000.0).await.unwrap();
        assert_eq!(s.loaded().await, 10);
        let clicked = s
            .activate(&ControlQuery::document(r#"div[role="button"]"#).labelled("show more|see more"))
            .await
            .unwrap();
        assert!(clicked);
        assert_eq!(s.loaded().await, 20);
    }

    #[tokio::test]
    async fn test_unfollow_requires_confirmation() {
        let s = surface(5);
        let token = s.fragments().await.unwrap()[2].token;
        let ok = s
            .activate(&ControlQuery::within(token, r#"[data-testid$="-unfollow"]"#))
            .await
            .unwrap();
        assert!(ok);
        assert!(s.unfollowed().await.is_empty());
        let ok = s
            .activate(&ControlQuery::document(r#"[data-testid="confirmationSheetConfirm"]"#))
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(s.unfollowed().await, vec!["member_00002".to_string()]);
        // No sheet open any more.
        let ok = s
            .activate(&ControlQuery::document(r#"[data-testid="confirmationSheetConfirm"]"#))
            .await
            .unwrap();
        assert!(!ok);
    }
}
