//! Usage accounting over live engines.

use std::time::Duration;

use tidefs_core::store::ItemSource;

use crate::support::{TestBed, eventually, magnet_for};

#[tokio::test]
async fn transfer_deltas_and_last_read_are_persisted() {
    let bed = TestBed::new().await;
    bed.insert_magnet("alpha", None).await;
    let daemon = bed.start_daemon().await;
    let vfs = daemon.vfs();

    assert!(
        eventually(Duration::from_secs(2), || {
            let vfs = vfs.clone();
            async move { vfs.getattr("/alpha/video.mp4").is_ok() }
        })
        .await
    );

    // Reading advances the engine's download counter and marks the access
    let fh = vfs.open("/alpha/video.mp4").unwrap();
    let data = vfs.read("/alpha/video.mp4", fh, 0, 8192).await.unwrap();
    assert_eq!(data.len(), 8192);
    vfs.release(fh);

    // Simulated peer traffic on the upload side
    let control = bed
        .launcher
        .control_for(&ItemSource::Magnet(magnet_for("alpha")))
        .unwrap();
    control.add_uploaded(5000);

    // The accountant flushes deltas and the last-read timestamp on its
    // own cadence
    assert!(
        eventually(Duration::from_secs(2), || async {
            let item = bed.fetch("alpha").await.unwrap();
            item.total_downloaded >= 8192 && item.total_uploaded >= 5000
        })
        .await
    );
    assert!(
        eventually(Duration::from_secs(2), || async {
            bed.fetch("alpha").await.unwrap().last_read_at.is_some()
        })
        .await
    );

    daemon.shutdown().await;
}

#[tokio::test]
async fn idle_engines_cause_no_store_writes() {
    let bed = TestBed::new().await;
    bed.insert_magnet("beta", None).await;
    let daemon = bed.start_daemon().await;

    // Let the engine settle into a steady state with no traffic
    assert!(
        eventually(Duration::from_secs(2), || async {
            bed.fetch("beta").await.and_then(|i| i.state).is_some()
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(150)).await;

    let item = bed.fetch("beta").await.unwrap();
    assert_eq!(item.total_uploaded, 0);
    assert_eq!(item.total_downloaded, 0);
    assert!(item.last_read_at.is_none());

    daemon.shutdown().await;
}
