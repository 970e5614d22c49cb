//! Namespace resolution over the running daemon.

use std::time::Duration;

use tidefs_core::vfs::{FsError, NodeKind};

use crate::support::{TestBed, eventually};

#[tokio::test]
async fn readdir_lists_items_and_categories_without_duplicates() {
    let bed = TestBed::new().await;
    bed.insert_magnet("alpha", None).await;
    bed.insert_magnet("beta", Some("movies")).await;
    let daemon = bed.start_daemon().await;
    let vfs = daemon.vfs();

    assert!(
        eventually(Duration::from_secs(2), || {
            let vfs = vfs.clone();
            async move { vfs.readdir("/").map(|c| c.len() == 2).unwrap_or(false) }
        })
        .await
    );

    let mut root = vfs.readdir("/").unwrap();
    root.sort();
    assert_eq!(root, vec!["alpha".to_string(), "movies".to_string()]);

    // Every item resolves to the same simulated layout
    let mut alpha = vfs.readdir("/alpha").unwrap();
    alpha.sort();
    assert_eq!(alpha, vec!["extras".to_string(), "video.mp4".to_string()]);
    assert_eq!(
        vfs.readdir("/movies/beta/extras").unwrap(),
        vec!["sample.txt".to_string()]
    );

    assert_eq!(vfs.readdir("/nonexistent"), Err(FsError::NotFound));

    daemon.shutdown().await;
}

#[tokio::test]
async fn getattr_reports_stable_declared_sizes() {
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

    let attr = vfs.getattr("/alpha/video.mp4").unwrap();
    assert_eq!(attr.kind, NodeKind::File);
    assert_eq!(attr.size, 64 * 1024);

    // Size never changes once resolved
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(vfs.getattr("/alpha/video.mp4").unwrap().size, 64 * 1024);

    let dir = vfs.getattr("/alpha/extras").unwrap();
    assert_eq!(dir.kind, NodeKind::Directory);

    assert_eq!(vfs.getattr("/alpha/missing"), Err(FsError::NotFound));

    daemon.shutdown().await;
}

#[tokio::test]
async fn identical_filenames_coexist_under_item_directories() {
    let bed = TestBed::new().await;
    bed.insert_magnet("one", None).await;
    bed.insert_magnet("two", None).await;
    let daemon = bed.start_daemon().await;
    let vfs = daemon.vfs();

    // Both items carry a file named video.mp4; each lives under its own
    // item directory, so there is no collision
    assert!(
        eventually(Duration::from_secs(2), || {
            let vfs = vfs.clone();
            async move {
                vfs.getattr("/one/video.mp4").is_ok() && vfs.getattr("/two/video.mp4").is_ok()
            }
        })
        .await
    );

    daemon.shutdown().await;
}
