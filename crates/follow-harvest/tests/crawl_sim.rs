//! End-to-end crawls against the simulated virtualized list.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use follow_harvest::*;

// ─────────────────────── helpers ───────────────────────

fn quick_config() -> HarvestConfig {
    let mut cfg = HarvestConfig::default();
    cfg.crawl.max_idle_ms = 3_000;
    cfg.crawl.hard_cap_ms = 120_000;
    cfg
}

fn sim(members: Vec<SimMember>, config: VirtualListConfig) -> Arc<VirtualListSurface> {
    Arc::new(VirtualListSurface::new(members, config))
}

async fn harvester_over(surface: Arc<VirtualListSurface>, cfg: HarvestConfig) -> FollowingHarvester {
    let h = FollowingHarvester::new(surface.clone(), cfg);
    surface.attach_payload_sink(h.payload_sink()).await;
    h
}

fn handle_row(id: &MemberIdentity) -> usize {
    id.as_str()
        .trim_start_matches("member_")
        .parse()
        .expect("generated handle")
}

/// Produces one never-seen member on every snapshot and never moves.
struct TrickleSurface {
    next: AtomicU64,
    hang_scroll: bool,
}

#[async_trait]
impl RenderSurface for TrickleSurface {
    async fn current_path(&self) -> Result<String> {
        Ok("/me/following".into())
    }
    async fn locate_scroller(&self) -> Result<bool> {
        Ok(true)
    }
    async fn fragments(&self) -> Result<Vec<Fragment>> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Fragment {
            token: FragmentToken(n),
            html: format!(r#"<div><a href="/t{n}"><div dir="auto"><span>T {n}</span></div></a></div>"#),
        }])
    }
    async fn scroll_metrics(&self) -> Result<ScrollMetrics> {
        Ok(ScrollMetrics { top: 0.0, height: 0.0 })
    }
    async fn scroll_by(&self, _px: f64, _duration: Duration) -> Result<()> {
        if self.hang_scroll {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
    async fn reveal_last_fragment(&self) -> Result<()> {
        Ok(())
    }
    async fn dispatch_wheel(&self, _delta_y: f64) -> Result<()> {
        Ok(())
    }
    async fn dispatch_page_down(&self) -> Result<()> {
        Ok(())
    }
    async fn activate(&self, _query: &ControlQuery) -> Result<bool> {
        Ok(false)
    }
    async fn watch_changes(&self) -> Result<mpsc::UnboundedReceiver<()>> {
        anyhow::bail!("no observer")
    }
    async fn unwatch_changes(&self) -> Result<()> {
        Ok(())
    }
}

/// Renders one fixed member, never moves, and records every `scroll_by`.
#[derive(Default)]
struct FrozenSurface {
    scrolls: Mutex<Vec<f64>>,
}

impl FrozenSurface {
    fn scrolls(&self) -> Vec<f64> {
        self.scrolls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RenderSurface for FrozenSurface {
    async fn current_path(&self) -> Result<String> {
        Ok("/me/following".into())
    }
    async fn locate_scroller(&self) -> Result<bool> {
        Ok(true)
    }
    async fn fragments(&self) -> Result<Vec<Fragment>> {
        Ok(vec![Fragment {
            token: FragmentToken(1),
            html: r#"<div><a href="/solo"><div dir="auto"><span>Solo</span></div></a></div>"#.into(),
        }])
    }
    async fn scroll_metrics(&self) -> Result<ScrollMetrics> {
        Ok(ScrollMetrics { top: 400.0, height: 2_000.0 })
    }
    async fn scroll_by(&self, px: f64, _duration: Duration) -> Result<()> {
        self.scrolls.lock().unwrap().push(px);
        Ok(())
    }
    async fn reveal_last_fragment(&self) -> Result<()> {
        Ok(())
    }
    async fn dispatch_wheel(&self, _delta_y: f64) -> Result<()> {
        Ok(())
    }
    async fn dispatch_page_down(&self) -> Result<()> {
        Ok(())
    }
    async fn activate(&self, _query: &ControlQuery) -> Result<bool> {
        Ok(false)
    }
    async fn watch_changes(&self) -> Result<mpsc::UnboundedReceiver<()>> {
        anyhow::bail!("no observer")
    }
    async fn unwatch_changes(&self) -> Result<()> {
        Ok(())
    }
}

// ─────────────────────── enumeration ───────────────────────

#[tokio::test(start_paused = true)]
async fn test_enumerates_whole_list_and_correlates() {
    let members = SimMember::generate(120, Some(4));
    let surface = sim(members, VirtualListConfig::default());
    let mut h = harvester_over(surface.clone(), quick_config()).await;

    let outcome = h.crawl(10_000, false).await.unwrap();
    assert_eq!(outcome.reason, ExitReason::IdleTimeout);
    assert_eq!(outcome.records.len(), 120);

    let newest = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
    for record in &outcome.records {
        let row = handle_row(&record.identity);
        assert_eq!(record.reciprocal, row % 4 == 0, "{}", record.identity);
        assert_eq!(record.display_name, format!("Member {row}"));
        assert_eq!(record.profile_ref, format!("https://x.com/{}", record.identity));
        assert_eq!(
            record.first_seen_at,
            Some(newest - chrono::Duration::minutes(row as i64))
        );
        assert!(record.last_activity_at.is_some());
    }
}

#[tokio::test(start_paused = true)]
async fn test_records_in_discovery_order() {
    let surface = sim(SimMember::generate(60, None), VirtualListConfig::default());
    let mut h = harvester_over(surface, quick_config()).await;

    let records = h.load_following(10_000, false).await.unwrap();
    let rows: Vec<usize> = records.iter().map(|r| handle_row(&r.identity)).collect();
    let mut sorted = rows.clone();
    sorted.sort_unstable();
    assert_eq!(rows, sorted);
}

#[tokio::test(start_paused = true)]
async fn test_load_more_affordance_is_used() {
    let config = VirtualListConfig {
        requires_load_more: true,
        ..VirtualListConfig::default()
    };
    let surface = sim(SimMember::generate(60, None), config);
    let mut h = harvester_over(surface.clone(), quick_config()).await;

    let records = h.load_following(10_000, false).await.unwrap();
    assert_eq!(records.len(), 60);
    assert_eq!(surface.pages_loaded().await, 6);
}

#[tokio::test(start_paused = true)]
async fn test_target_stops_early() {
    let surface = sim(SimMember::generate(500, None), VirtualListConfig::default());
    let mut h = harvester_over(surface.clone(), quick_config()).await;

    let outcome = h.crawl(40, false).await.unwrap();
    assert_eq!(outcome.reason, ExitReason::TargetReached);
    assert!(outcome.records.len() >= 40);
    assert!(surface.loaded().await < 500);
}

#[tokio::test(start_paused = true)]
async fn test_zero_limit_means_configured_target() {
    let surface = sim(SimMember::generate(60, None), VirtualListConfig::default());
    let mut h = harvester_over(surface, quick_config()).await;

    let outcome = h.crawl(0, false).await.unwrap();
    assert_eq!(outcome.reason, ExitReason::IdleTimeout);
    assert_eq!(outcome.records.len(), 60);
}

// ─────────────────────── resume ───────────────────────

#[tokio::test(start_paused = true)]
async fn test_resume_extends_previous_load() {
    let surface = sim(SimMember::generate(400, Some(5)), VirtualListConfig::default());
    let mut h = harvester_over(surface, quick_config()).await;

    let first = h.load_following(50, false).await.unwrap();
    assert!(first.len() >= 50);

    let second = h.load_following(150, true).await.unwrap();
    assert!(second.len() >= 150);

    let ids: std::collections::HashSet<_> = second.iter().map(|r| r.identity.clone()).collect();
    assert_eq!(ids.len(), second.len(), "no identity duplicated");
    for r in &first {
        assert!(ids.contains(&r.identity), "{} lost on resume", r.identity);
    }
}

#[tokio::test(start_paused = true)]
async fn test_fresh_load_resets_stores() {
    let surface = sim(SimMember::generate(30, None), VirtualListConfig::default());
    let mut h = harvester_over(surface, quick_config()).await;

    h.load_following(10_000, false).await.unwrap();
    h.ingest_network_payload(
        r#"{"data":{"user":{"result":{"timeline":{"timeline":{"instructions":[{"entries":[
            {"sortIndex":"1600000000000","content":{"itemContent":{"user_results":{"result":{"legacy":{"screen_name":"ghost"}}}}}}
        ]}]}}}}}}"#,
    );
    assert!(h.stores().metadata.get(&MemberIdentity::from("ghost")).is_some());

    h.load_following(10_000, false).await.unwrap();
    assert!(h.stores().metadata.get(&MemberIdentity::from("ghost")).is_none());
}

// ─────────────────────── failure and bounds ───────────────────────

#[tokio::test(start_paused = true)]
async fn test_missing_scroller_fails_fast() {
    let config = VirtualListConfig {
        has_scroller: false,
        ..VirtualListConfig::default()
    };
    let surface = sim(SimMember::generate(10, None), config);
    let mut h = harvester_over(surface, quick_config()).await;

    let err = h.load_following(100, false).await.unwrap_err();
    assert!(matches!(err, HarvestError::NoScrollSurface));
    assert!(err.is_configuration());
}

#[tokio::test(start_paused = true)]
async fn test_hard_cap_bounds_endless_growth() {
    let surface = Arc::new(TrickleSurface {
        next: AtomicU64::new(0),
        hang_scroll: false,
    });
    let mut cfg = HarvestConfig::default();
    cfg.crawl.hard_cap_ms = 20_000;
    let mut h = FollowingHarvester::new(surface, cfg);

    let started = tokio::time::Instant::now();
    let outcome = h.crawl(1_000_000, false).await.unwrap();
    assert_eq!(outcome.reason, ExitReason::HardCap);
    assert!(started.elapsed() <= Duration::from_millis(20_000));
    assert!(!outcome.records.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_hard_cap_bounds_hanging_surface() {
    let surface = Arc::new(TrickleSurface {
        next: AtomicU64::new(0),
        hang_scroll: true,
    });
    let mut cfg = HarvestConfig::default();
    cfg.crawl.hard_cap_ms = 8_000;
    cfg.crawl.max_idle_ms = 60_000;
    cfg.crawl.op_timeout_ms = 3_000;
    let mut h = FollowingHarvester::new(surface, cfg);

    let started = tokio::time::Instant::now();
    let outcome = h.crawl(1_000_000, false).await.unwrap();
    assert_eq!(outcome.reason, ExitReason::HardCap);
    assert!(started.elapsed() <= Duration::from_millis(8_000));
}

// ─────────────────────── stall retry ───────────────────────

#[tokio::test(start_paused = true)]
async fn test_stalled_step_retries_once_at_half_magnitude() {
    let surface = Arc::new(FrozenSurface::default());
    let cfg = quick_config();
    let step_px = f64::from(cfg.crawl.step_px);
    let mut h = FollowingHarvester::new(surface.clone(), cfg);

    let outcome = h.crawl(100, false).await.unwrap();
    assert_eq!(outcome.reason, ExitReason::IdleTimeout);
    assert_eq!(outcome.records.len(), 1);
    assert!(outcome.stalls > 0);
    assert_eq!(outcome.stalls, outcome.steps);

    let expected: Vec<f64> = (0..outcome.steps)
        .flat_map(|_| [step_px, step_px / 2.0])
        .collect();
    assert_eq!(surface.scrolls(), expected);
}

#[tokio::test(start_paused = true)]
async fn test_moving_list_records_no_stalls() {
    let surface = sim(SimMember::generate(500, None), VirtualListConfig::default());
    let mut h = harvester_over(surface, quick_config()).await;

    let outcome = h.crawl(40, false).await.unwrap();
    assert_eq!(outcome.reason, ExitReason::TargetReached);
    assert!(outcome.steps > 0);
    assert_eq!(outcome.stalls, 0);
}

// ─────────────────────── events ───────────────────────

#[tokio::test(start_paused = true)]
async fn test_progress_then_completion_events() {
    let surface = sim(SimMember::generate(45, None), VirtualListConfig::default());
    let mut h = harvester_over(surface, quick_config()).await;
    let mut rx = h.subscribe();

    h.load_following(10_000, false).await.unwrap();

    let mut last = 0;
    let mut completed = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            HarvestEvent::Progress { count } => {
                assert!(count > last);
                last = count;
            }
            HarvestEvent::CrawlComplete { count, reason, .. } => completed = Some((count, reason)),
            HarvestEvent::BatchDone { .. } => panic!("no batch ran"),
        }
    }
    assert_eq!(last, 45);
    assert_eq!(completed, Some((45, ExitReason::IdleTimeout)));
}

// ─────────────────────── scan properties ───────────────────────

#[tokio::test]
async fn test_scan_is_idempotent_on_unchanged_surface() {
    let surface = VirtualListSurface::new(SimMember::generate(25, Some(2)), VirtualListConfig::default());
    let harvester = DomHarvester::new(&HarvestConfig::default());
    let mut stores = HarvestStores::new();

    let first = harvester.scan_visible(&surface, &mut stores).await.unwrap();
    assert!(first.new_identities > 0);
    let presence = stores.presence.len();
    let metadata = stores.metadata.len();

    let second = harvester.scan_visible(&surface, &mut stores).await.unwrap();
    assert_eq!(second.fresh, 0);
    assert_eq!(stores.presence.len(), presence);
    assert_eq!(stores.metadata.len(), metadata);
}

#[test]
fn test_first_non_empty_name_across_three_fragments() {
    let harvester = DomHarvester::new(&HarvestConfig::default());
    let mut stores = HarvestStores::new();
    let cell = |token: u64, name: &str, badge: &str| Fragment {
        token: FragmentToken(token),
        html: format!(
            r#"<div data-testid="UserCell"><a href="/dup"><div dir="auto"><span>{name}</span></div></a>{badge}</div>"#
        ),
    };

    harvester.scan_fragments(&[cell(1, "", "")], &mut stores);
    harvester.scan_fragments(&[cell(2, "Early Name", "<span>Follows you</span>")], &mut stores);
    harvester.scan_fragments(&[cell(3, "Late Name", "")], &mut stores);

    let merged = merge_records(&stores.presence, &stores.metadata);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].display_name, "Early Name");
    assert!(merged[0].reciprocal, "reciprocity is sticky");
}
