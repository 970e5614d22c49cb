//! Lifecycle state machine scenarios over the simulated swarm.

use std::sync::Arc;
use std::time::Duration;

use tidefs_core::catalog::ItemCatalog;
use tidefs_core::config::SwarmConfig;
use tidefs_core::registry::EngineRegistry;
use tidefs_core::store::{ItemPatch, ItemSource, ItemState};
use tidefs_core::vfs::FsError;

use crate::support::{TestBed, eventually, magnet_for};

#[tokio::test]
async fn fresh_item_leeches_then_seeds_after_interest_grace() {
    let bed = TestBed::new().await;
    bed.insert_magnet("alpha", None).await;
    let daemon = bed.start_daemon().await;

    // First acquisition with no stored state persists LEECH; under test
    // timings the grace window may already have advanced it to SEED
    assert!(
        eventually(Duration::from_secs(2), || async {
            matches!(
                bed.fetch("alpha").await.and_then(|i| i.state),
                Some(ItemState::Leech) | Some(ItemState::Seed)
            )
        })
        .await
    );

    // The simulated swarm wants nothing; after the grace window the item
    // becomes a seed and the state is persisted
    assert!(
        eventually(Duration::from_secs(2), || async {
            bed.fetch("alpha").await.and_then(|i| i.state) == Some(ItemState::Seed)
        })
        .await
    );

    daemon.shutdown().await;
}

#[tokio::test]
async fn renewed_interest_forces_seed_back_to_leech() {
    let bed = TestBed::new().await;
    bed.insert_magnet("alpha", None).await;
    let daemon = bed.start_daemon().await;

    assert!(
        eventually(Duration::from_secs(2), || async {
            bed.fetch("alpha").await.and_then(|i| i.state) == Some(ItemState::Seed)
        })
        .await
    );

    let control = bed
        .launcher
        .control_for(&ItemSource::Magnet(magnet_for("alpha")))
        .unwrap();
    control.interested().await;

    assert!(
        eventually(Duration::from_secs(2), || async {
            let item = bed.fetch("alpha").await.unwrap();
            item.state == Some(ItemState::Leech) && item.seed_hours == 0
        })
        .await
    );

    daemon.shutdown().await;
}

#[tokio::test]
async fn retained_seed_with_idle_reads_is_freed() {
    let bed = TestBed::new().await;
    let record = bed.insert_magnet("beta", None).await;
    // One hour short of the retention threshold, never read
    bed.store
        .update(
            record.id,
            ItemPatch {
                state: Some(ItemState::Seed),
                seed_hours: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let daemon = bed.start_daemon().await;

    assert!(
        eventually(Duration::from_secs(3), || async {
            bed.fetch("beta").await.and_then(|i| i.state) == Some(ItemState::Freed)
        })
        .await
    );

    // The engine is gone and its cached pieces discarded
    let control = bed
        .launcher
        .control_for(&ItemSource::Magnet(magnet_for("beta")))
        .unwrap();
    assert!(control.engine.is_destroyed());
    assert!(control.engine.is_purged());
    assert!(daemon.registry().entry(record.id).await.is_none());

    daemon.shutdown().await;
}

#[tokio::test]
async fn delete_requested_item_is_fully_torn_down() {
    let bed = TestBed::new().await;
    let record = bed.insert_magnet("delta", None).await;
    bed.store
        .update(
            record.id,
            ItemPatch {
                delete_requested: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let daemon = bed.start_daemon().await;

    // Engine starts, reaches readiness once, then everything is removed
    assert!(
        eventually(Duration::from_secs(3), || async {
            bed.store.fetch_all().await.unwrap().is_empty()
        })
        .await
    );

    let control = bed
        .launcher
        .control_for(&ItemSource::Magnet(magnet_for("delta")))
        .unwrap();
    assert!(control.engine.is_destroyed());
    assert!(control.engine.is_purged());

    let vfs = daemon.vfs();
    assert_eq!(vfs.open("/delta/video.mp4"), Err(FsError::NotFound));

    daemon.shutdown().await;
}

#[tokio::test]
async fn deleting_a_live_item_removes_it_from_the_namespace() {
    let bed = TestBed::new().await;
    let record = bed.insert_magnet("epsilon", None).await;
    let daemon = bed.start_daemon().await;
    let vfs = daemon.vfs();

    assert!(
        eventually(Duration::from_secs(2), || {
            let vfs = vfs.clone();
            async move { vfs.getattr("/epsilon/video.mp4").is_ok() }
        })
        .await
    );

    // External writer flags deletion while the engine is live
    bed.store
        .update(
            record.id,
            ItemPatch {
                delete_requested: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(3), || async {
            bed.store.fetch_all().await.unwrap().is_empty()
        })
        .await
    );
    assert!(
        eventually(Duration::from_secs(2), || {
            let vfs = vfs.clone();
            async move { vfs.open("/epsilon/video.mp4") == Err(FsError::NotFound) }
        })
        .await
    );

    daemon.shutdown().await;
}

#[tokio::test]
async fn rapid_concurrent_acquires_launch_one_engine() {
    let bed = TestBed::new().await;
    bed.insert_magnet("zeta", None).await;

    let catalog = Arc::new(ItemCatalog::new(bed.store.clone()));
    catalog.sync_from_store().await;
    let registry = EngineRegistry::new(bed.launcher.clone(), catalog.clone(), SwarmConfig::default());

    let item = catalog
        .snapshot()
        .into_iter()
        .find(|i| i.name == "zeta")
        .unwrap();

    let acquires = (0..16).map(|_| {
        let registry = registry.clone();
        let item = item.clone();
        tokio::spawn(async move { registry.acquire(&item).await.unwrap() })
    });
    let entries = futures::future::join_all(acquires).await;

    assert_eq!(bed.launcher.launch_count(), 1);
    let first = entries[0].as_ref().unwrap().item_id;
    for entry in &entries {
        assert_eq!(entry.as_ref().unwrap().item_id, first);
    }

    registry.shutdown().await;
}
