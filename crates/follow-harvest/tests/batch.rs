//! Unfollow batches against the simulated list.

use std::sync::Arc;

use follow_harvest::*;

fn fast_config() -> HarvestConfig {
    let mut cfg = HarvestConfig::default();
    cfg.executor.base_delay_ms = 50;
    cfg.executor.jitter_ms = 25;
    cfg.executor.confirm_delay_ms = 10;
    cfg
}

fn ids(handles: &[&str]) -> Vec<MemberIdentity> {
    handles.iter().map(|h| MemberIdentity::from(*h)).collect()
}

#[tokio::test(start_paused = true)]
async fn test_batch_confirms_rendered_members() {
    let surface = Arc::new(VirtualListSurface::new(
        SimMember::generate(20, None),
        VirtualListConfig::default(),
    ));
    let mut h = FollowingHarvester::new(surface.clone(), fast_config());
    let mut rx = h.subscribe();

    let outcome = h
        .unfollow_users(&ids(&["member_00001", "member_00003"]))
        .await;
    assert_eq!(outcome.completed_count, 2);
    assert_eq!(surface.unfollowed().await, vec!["member_00001", "member_00003"]);
    assert_eq!(rx.try_recv().unwrap(), HarvestEvent::BatchDone { count: 2 });
}

#[tokio::test(start_paused = true)]
async fn test_unrendered_member_is_skipped_without_error() {
    let surface = Arc::new(VirtualListSurface::new(
        SimMember::generate(200, None),
        VirtualListConfig::default(),
    ));
    let mut h = FollowingHarvester::new(surface.clone(), fast_config());

    let report = h
        .unfollow_report(&ids(&["member_00150", "member_00002", "nobody"]))
        .await;
    assert_eq!(report.completed, 1);
    assert_eq!(
        report.skipped,
        vec![
            (MemberIdentity::from("member_00150"), SkipReason::NotRendered),
            (MemberIdentity::from("nobody"), SkipReason::NotRendered),
        ]
    );
    assert_eq!(surface.unfollowed().await, vec!["member_00002"]);
}

#[tokio::test(start_paused = true)]
async fn test_repeat_action_finds_no_control() {
    let surface = Arc::new(VirtualListSurface::new(
        SimMember::generate(5, None),
        VirtualListConfig::default(),
    ));
    let mut h = FollowingHarvester::new(surface.clone(), fast_config());

    assert_eq!(h.unfollow_users(&ids(&["member_00000"])).await.completed_count, 1);
    let report = h.unfollow_report(&ids(&["member_00000"])).await;
    assert_eq!(report.completed, 0);
    assert_eq!(
        report.skipped,
        vec![(MemberIdentity::from("member_00000"), SkipReason::NoControl)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_batch_paces_between_members() {
    let surface = Arc::new(VirtualListSurface::new(
        SimMember::generate(10, None),
        VirtualListConfig::default(),
    ));
    let mut h = FollowingHarvester::new(surface, fast_config());

    let started = tokio::time::Instant::now();
    h.unfollow_users(&ids(&["member_00000", "member_00001", "member_00002"]))
        .await;
    let elapsed = started.elapsed().as_millis();
    // Three confirm delays plus two inter-member pauses.
    assert!(elapsed >= 3 * 10 + 2 * 50, "elapsed {elapsed}ms");
    assert!(elapsed <= 3 * 10 + 2 * 75, "elapsed {elapsed}ms");
}

#[tokio::test(start_paused = true)]
async fn test_empty_batch_still_reports() {
    let surface = Arc::new(VirtualListSurface::new(Vec::new(), VirtualListConfig::default()));
    let mut h = FollowingHarvester::new(surface, fast_config());
    let mut rx = h.subscribe();

    assert_eq!(h.unfollow_users(&[]).await.completed_count, 0);
    assert_eq!(rx.try_recv().unwrap(), HarvestEvent::BatchDone { count: 0 });
}
