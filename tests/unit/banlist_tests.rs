//! Ban list: threshold, sliding window, summary.

use std::time::Duration;

use arras_node::http::BanList;

#[test]
fn source_is_banned_at_the_threshold() {
    let bans = BanList::new(5, Duration::from_secs(300));

    for _ in 0..4 {
        bans.track("10.0.0.1");
        assert!(!bans.is_banned("10.0.0.1"), "below threshold must pass");
    }
    bans.track("10.0.0.1");
    assert!(bans.is_banned("10.0.0.1"), "fifth strike must ban");
    assert!(bans.is_banned("10.0.0.1"), "ban must persist");
}

#[test]
fn untracked_sources_are_never_banned() {
    let bans = BanList::new(5, Duration::from_secs(300));
    assert!(!bans.is_banned("192.168.1.1"));
}

#[test]
fn sources_are_tracked_independently() {
    let bans = BanList::new(2, Duration::from_secs(300));
    bans.track("10.0.0.1");
    bans.track("10.0.0.1");
    bans.track("10.0.0.2");

    assert!(bans.is_banned("10.0.0.1"));
    assert!(!bans.is_banned("10.0.0.2"));
}

#[test]
fn ban_expires_after_the_window() {
    let bans = BanList::new(2, Duration::from_millis(50));
    bans.track("10.0.0.1");
    bans.track("10.0.0.1");
    assert!(bans.is_banned("10.0.0.1"));

    std::thread::sleep(Duration::from_millis(80));
    assert!(!bans.is_banned("10.0.0.1"), "expired ban must clear");
    // after expiry the source starts from a clean slate
    bans.track("10.0.0.1");
    assert!(!bans.is_banned("10.0.0.1"));
}

#[test]
fn summary_partitions_banned_and_tracked() {
    let bans = BanList::new(2, Duration::from_secs(300));
    bans.track("10.0.0.1");
    bans.track("10.0.0.1");
    bans.track("10.0.0.2");

    let summary = bans.summary();
    let banned = summary["banned"].as_array().unwrap();
    let tracked = summary["tracked"].as_array().unwrap();
    assert_eq!(banned.len(), 1);
    assert_eq!(banned[0], "10.0.0.1");
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0], "10.0.0.2");
}

#[test]
fn cleanup_drops_expired_entries() {
    let bans = BanList::new(5, Duration::from_millis(30));
    bans.track("10.0.0.1");
    std::thread::sleep(Duration::from_millis(60));
    bans.cleanup();

    let summary = bans.summary();
    assert!(summary["tracked"].as_array().unwrap().is_empty());
    assert!(summary["banned"].as_array().unwrap().is_empty());
}
