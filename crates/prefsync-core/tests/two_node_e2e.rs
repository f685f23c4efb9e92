//! Two-node end-to-end replication
//!
//! Both nodes run the full `PrefSync` stack on one in-process PAN: the change
//! detector, the debounced batcher, the remote listener and the applier.

mod common;

use std::collections::BTreeSet;

use common::{eventually, TestNode};
use prefsync_core::{sync_filter, LocalStore, MemoryPan, PrefValue, StoreEdits};
use tokio::time::{sleep, Duration};

async fn resumed_pair(pan: &MemoryPan) -> (TestNode, TestNode) {
    let a = TestNode::new(pan, "watch");
    let b = TestNode::new(pan, "phone");
    a.sync.resume().unwrap();
    b.sync.resume().unwrap();
    // Let the first-run pulls and marker pushes settle
    sleep(Duration::from_secs(5)).await;
    (a, b)
}

#[tokio::test(start_paused = true)]
async fn test_every_value_kind_replicates() {
    let pan = MemoryPan::new();
    let (a, b) = resumed_pair(&pan).await;

    let tags: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    let mut edits = StoreEdits::new();
    edits
        .put("flag", PrefValue::Bool(true))
        .put("ratio", PrefValue::Float(0.75))
        .put("count", PrefValue::Int(-3))
        .put("epoch", PrefValue::Long(1_700_000_000_000))
        .put("name", PrefValue::from("Ada"))
        .put("tags", PrefValue::StringSet(tags));
    a.store.commit(edits).unwrap();

    eventually(|| {
        let mut on_a = a.store.get_all().unwrap();
        let mut on_b = b.store.get_all().unwrap();
        on_a.retain(|key, _| key != prefsync_core::KEY_SYNC_DONE);
        on_b.retain(|key, _| key != prefsync_core::KEY_SYNC_DONE);
        on_a.len() == 6 && on_a == on_b
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_delete_replicates_and_settles() {
    let pan = MemoryPan::new();
    let (a, b) = resumed_pair(&pan).await;

    a.store.put("volume", PrefValue::Int(5)).unwrap();
    eventually(|| b.store.get("volume").unwrap() == Some(PrefValue::Int(5))).await;
    // Wait out the peer's re-send of the value it just received
    sleep(Duration::from_secs(5)).await;

    a.store.remove("volume").unwrap();
    eventually(|| !b.store.contains("volume").unwrap()).await;

    sleep(Duration::from_secs(5)).await;
    assert!(!a.store.contains("volume").unwrap());
    assert!(!b.store.contains("volume").unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_removal_after_multi_key_batch_replicates() {
    let pan = MemoryPan::new();
    let (a, b) = resumed_pair(&pan).await;

    let mut edits = StoreEdits::new();
    edits
        .put("theme", PrefValue::from("dark"))
        .put("volume", PrefValue::Int(5));
    a.store.commit(edits).unwrap();
    eventually(|| b.store.get("theme").unwrap() == Some(PrefValue::from("dark"))).await;
    sleep(Duration::from_secs(5)).await;

    a.store.remove("theme").unwrap();
    eventually(|| !b.store.contains("theme").unwrap()).await;

    sleep(Duration::from_secs(5)).await;
    assert!(!a.store.contains("theme").unwrap());
    assert!(!b.store.contains("theme").unwrap());
    assert_eq!(b.store.get("volume").unwrap(), Some(PrefValue::Int(5)));
}

#[tokio::test(start_paused = true)]
async fn test_non_finite_floats_replicate_and_settle() {
    let pan = MemoryPan::new();
    let (a, b) = resumed_pair(&pan).await;

    let mut edits = StoreEdits::new();
    edits
        .put("ratio", PrefValue::Float(f64::NAN))
        .put("ceiling", PrefValue::Float(f64::INFINITY))
        .put("offset", PrefValue::Float(-0.0));
    a.store.commit(edits).unwrap();

    eventually(|| {
        b.store.get("ratio").unwrap() == Some(PrefValue::Float(f64::NAN))
            && b.store.get("ceiling").unwrap() == Some(PrefValue::Float(f64::INFINITY))
            && b.store.get("offset").unwrap() == Some(PrefValue::Float(-0.0))
    })
    .await;
    sleep(Duration::from_secs(5)).await;

    let puts = (a.puts().len(), b.puts().len());
    sleep(Duration::from_secs(30)).await;
    assert_eq!((a.puts().len(), b.puts().len()), puts);
}

#[tokio::test(start_paused = true)]
async fn test_replication_has_no_feedback_loop() {
    let pan = MemoryPan::new();
    let (a, b) = resumed_pair(&pan).await;

    a.store.put("theme", PrefValue::from("dark")).unwrap();
    eventually(|| b.store.get("theme").unwrap() == Some(PrefValue::from("dark"))).await;
    sleep(Duration::from_secs(5)).await;

    let commits = (a.store.commit_count(), b.store.commit_count());
    let puts = (a.puts().len(), b.puts().len());
    sleep(Duration::from_secs(30)).await;

    assert_eq!((a.store.commit_count(), b.store.commit_count()), commits);
    assert_eq!((a.puts().len(), b.puts().len()), puts);
}

#[tokio::test(start_paused = true)]
async fn test_filter_limits_outbound_changes() {
    let pan = MemoryPan::new();
    let (a, b) = resumed_pair(&pan).await;
    a.sync
        .set_filter(Some(sync_filter(|key: &str| key.starts_with("shared."))));

    a.store.put("shared.units", PrefValue::from("metric")).unwrap();
    a.store.put("local.window", PrefValue::Int(3)).unwrap();

    eventually(|| b.store.contains("shared.units").unwrap()).await;
    sleep(Duration::from_secs(5)).await;
    assert!(!b.store.contains("local.window").unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_pulls_existing_values() {
    let pan = MemoryPan::new();
    let a = TestNode::new(&pan, "watch");
    a.sync.resume().unwrap();
    a.store.put("brightness", PrefValue::Int(80)).unwrap();
    sleep(Duration::from_secs(3)).await;

    let b = TestNode::new(&pan, "phone");
    b.sync.resume().unwrap();
    eventually(|| b.store.get("brightness").unwrap() == Some(PrefValue::Int(80))).await;
}

#[tokio::test(start_paused = true)]
async fn test_paused_node_still_receives() {
    let pan = MemoryPan::new();
    let (a, b) = resumed_pair(&pan).await;
    b.sync.pause();

    a.store.put("ringer", PrefValue::Bool(false)).unwrap();
    eventually(|| b.store.get("ringer").unwrap() == Some(PrefValue::Bool(false))).await;

    b.store.put("ringer", PrefValue::Bool(true)).unwrap();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(a.store.get("ringer").unwrap(), Some(PrefValue::Bool(false)));
}
