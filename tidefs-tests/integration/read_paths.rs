//! Read-session behavior through the filesystem bridge.

use std::time::Duration;

use tidefs_core::store::{FileEntry, ItemPatch, ItemSource, ItemState};
use tidefs_core::vfs::FsError;
use tidefs_sim::{expected_content, source_seed};

use crate::support::{TestBed, eventually, magnet_for};

const VIDEO_LEN: u64 = 64 * 1024;

async fn ready_daemon(bed: &TestBed, name: &str) -> tidefs_core::daemon::TidefsDaemon {
    bed.insert_magnet(name, None).await;
    let daemon = bed.start_daemon().await;
    let vfs = daemon.vfs();
    let path = format!("/{name}/video.mp4");
    assert!(
        eventually(Duration::from_secs(2), || {
            let vfs = vfs.clone();
            let path = path.clone();
            async move { vfs.getattr(&path).is_ok() }
        })
        .await
    );
    daemon
}

#[tokio::test]
async fn read_matches_linear_scan_at_any_offset() {
    let bed = TestBed::new().await;
    let daemon = ready_daemon(&bed, "alpha").await;
    let vfs = daemon.vfs();
    let seed = source_seed(&ItemSource::Magnet(magnet_for("alpha")));

    let fh = vfs.open("/alpha/video.mp4").unwrap();
    for (offset, len) in [(0u64, 4096u32), (10_000, 1024), (VIDEO_LEN - 100, 100), (1, 1)] {
        let data = vfs.read("/alpha/video.mp4", fh, offset, len).await.unwrap();
        assert_eq!(
            &data[..],
            &expected_content(seed, 0, offset..offset + u64::from(len))[..],
            "mismatch at offset {offset}"
        );
    }
    vfs.release(fh);

    daemon.shutdown().await;
}

#[tokio::test]
async fn overlapping_reads_match_one_sequential_read() {
    let bed = TestBed::new().await;
    let daemon = ready_daemon(&bed, "alpha").await;
    let vfs = daemon.vfs();
    let seed = source_seed(&ItemSource::Magnet(magnet_for("alpha")));

    // A read at 0..1000 followed by a seek back to 500 must produce the
    // same bytes as one linear read of the first 1500, sliced
    let fh = vfs.open("/alpha/video.mp4").unwrap();
    let first = vfs.read("/alpha/video.mp4", fh, 0, 1000).await.unwrap();
    let second = vfs.read("/alpha/video.mp4", fh, 500, 1000).await.unwrap();
    vfs.release(fh);

    let linear = expected_content(seed, 0, 0..1500);
    assert_eq!(&first[..], &linear[0..1000]);
    assert_eq!(&second[..], &linear[500..1500]);

    daemon.shutdown().await;
}

#[tokio::test]
async fn reads_clamp_to_declared_length() {
    let bed = TestBed::new().await;
    let daemon = ready_daemon(&bed, "alpha").await;
    let vfs = daemon.vfs();

    let fh = vfs.open("/alpha/video.mp4").unwrap();
    let tail = vfs
        .read("/alpha/video.mp4", fh, VIDEO_LEN - 10, 4096)
        .await
        .unwrap();
    assert_eq!(tail.len(), 10);

    let past_end = vfs
        .read("/alpha/video.mp4", fh, VIDEO_LEN + 5, 4096)
        .await
        .unwrap();
    assert!(past_end.is_empty());
    vfs.release(fh);

    daemon.shutdown().await;
}

#[tokio::test]
async fn open_and_release_are_safe_on_unknown_targets() {
    let bed = TestBed::new().await;
    let daemon = ready_daemon(&bed, "alpha").await;
    let vfs = daemon.vfs();

    assert_eq!(vfs.open("/alpha/not-here.bin"), Err(FsError::NotFound));
    // Releasing a handle that was never opened is a no-op
    vfs.release(9999);
    // Reading through an unopened handle fails cleanly
    assert_eq!(
        vfs.read("/alpha/video.mp4", 9999, 0, 16).await,
        Err(FsError::NotFound)
    );

    daemon.shutdown().await;
}

#[tokio::test]
async fn freed_item_with_cached_file_list_resumes_on_read() {
    let bed = TestBed::new().await;
    // A previous run resolved the file list and later freed the item
    let record = bed.insert_magnet("gamma", None).await;
    bed.store
        .update(
            record.id,
            ItemPatch {
                file_list: Some(vec![
                    FileEntry {
                        path: "gamma/video.mp4".to_string(),
                        length: VIDEO_LEN,
                    },
                    FileEntry {
                        path: "gamma/extras/sample.txt".to_string(),
                        length: 4 * 1024,
                    },
                ]),
                state: Some(ItemState::Freed),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let daemon = bed.start_daemon().await;
    let vfs = daemon.vfs();
    let seed = source_seed(&ItemSource::Magnet(magnet_for("gamma")));

    // The path resolves from the cached list with no engine running
    assert!(
        eventually(Duration::from_secs(2), || {
            let vfs = vfs.clone();
            async move { vfs.getattr("/gamma/video.mp4").is_ok() }
        })
        .await
    );
    assert!(daemon.registry().entry(record.id).await.is_none());

    // The read starts an engine, waits for readiness, and completes
    let fh = vfs.open("/gamma/video.mp4").unwrap();
    let data = vfs.read("/gamma/video.mp4", fh, 100, 200).await.unwrap();
    assert_eq!(&data[..], &expected_content(seed, 0, 100..300)[..]);
    vfs.release(fh);

    // Freed resumes into Leech
    assert!(
        eventually(Duration::from_secs(2), || async {
            bed.fetch("gamma").await.map(|i| i.state) == Some(Some(ItemState::Leech))
        })
        .await
    );

    daemon.shutdown().await;
}
