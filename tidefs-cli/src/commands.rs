//! CLI command implementations

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Subcommand;
use tidefs_core::config::TidefsConfig;
use tidefs_core::daemon::TidefsDaemon;
use tidefs_core::store::{
    InfoHash, ItemId, ItemPatch, ItemSource, JsonFileStore, NewItem, RecordStore,
};
use tidefs_core::vfs::fuse::{self, MountOptions};
use tidefs_sim::SimLauncher;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Track a torrent by magnet link
    Add {
        /// Magnet link
        magnet: String,
        /// Optional grouping label (one extra directory level in the mount)
        #[arg(short, long)]
        category: Option<String>,
    },
    /// Track a torrent from a .torrent file
    AddFile {
        /// Path to the .torrent file
        path: PathBuf,
        /// Optional grouping label
        #[arg(short, long)]
        category: Option<String>,
    },
    /// List tracked items
    List,
    /// Flag an item for deletion; a running mount tears it down
    Remove {
        /// Item id as shown by `tidefs list`
        id: u64,
    },
    /// Mount tracked items under a directory
    Mount {
        /// Mountpoint directory
        mountpoint: PathBuf,
        /// Use the in-memory simulated swarm backend
        #[arg(long)]
        simulation: bool,
        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands, store_path: Option<PathBuf>) -> anyhow::Result<()> {
    let store_path = store_path.unwrap_or_else(JsonFileStore::default_path);
    match command {
        Commands::Add { magnet, category } => add_magnet(store_path, magnet, category).await,
        Commands::AddFile { path, category } => add_file(store_path, path, category).await,
        Commands::List => list_items(store_path).await,
        Commands::Remove { id } => remove_item(store_path, id).await,
        Commands::Mount {
            mountpoint,
            simulation,
            allow_other,
        } => mount(store_path, mountpoint, simulation, allow_other).await,
    }
}

/// Track a torrent by magnet link.
///
/// The file list is resolved by the mount daemon on first engine readiness;
/// adding needs no network activity.
///
/// # Errors
/// - Invalid magnet link, or the store is unwritable
async fn add_magnet(
    store_path: PathBuf,
    magnet: String,
    category: Option<String>,
) -> anyhow::Result<()> {
    let parsed = parse_magnet(&magnet)?;
    let name = parsed
        .display_name
        .unwrap_or_else(|| format!("item_{}", &parsed.info_hash.to_string()[..8]));

    let store = JsonFileStore::open(&store_path).await?;
    let record = store
        .insert(NewItem {
            source: ItemSource::Magnet(magnet),
            name,
            info_hash: Some(parsed.info_hash),
            category,
        })
        .await?;

    println!("Added item {}: {}", record.id, record.name);
    println!("  Info hash: {}", parsed.info_hash);
    Ok(())
}

/// Track a torrent from a .torrent file, stored as an opaque descriptor.
///
/// # Errors
/// - The file cannot be read, or the store is unwritable
async fn add_file(
    store_path: PathBuf,
    path: PathBuf,
    category: Option<String>,
) -> anyhow::Result<()> {
    let descriptor = tokio::fs::read(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "torrent".to_string());

    let store = JsonFileStore::open(&store_path).await?;
    let record = store
        .insert(NewItem {
            source: ItemSource::RawDescriptor(hex::encode(descriptor)),
            name,
            info_hash: None,
            category,
        })
        .await?;

    println!("Added item {}: {}", record.id, record.name);
    Ok(())
}

/// List tracked items with their state and usage totals.
///
/// # Errors
/// - The store cannot be read
async fn list_items(store_path: PathBuf) -> anyhow::Result<()> {
    let store = JsonFileStore::open(&store_path).await?;
    let mut items = store.fetch_all().await?;
    items.sort_by_key(|i| i.id);

    if items.is_empty() {
        println!("No items tracked yet.");
        println!("Use 'tidefs add <magnet-link>' to track a torrent.");
        return Ok(());
    }

    println!(
        "{:>4}  {:<6}  {:>5}  {:>10}  {:>10}  {:<12}  NAME",
        "ID", "STATE", "SEEDH", "UPLOADED", "DOWNLOADED", "CATEGORY"
    );
    for item in items {
        let state = item
            .state
            .map_or("-".to_string(), |s| s.to_string());
        let flag = if item.delete_requested { " (deleting)" } else { "" };
        println!(
            "{:>4}  {:<6}  {:>5}  {:>10}  {:>10}  {:<12}  {}{}",
            item.id,
            state,
            item.seed_hours,
            format_bytes(item.total_uploaded),
            format_bytes(item.total_downloaded),
            item.category.as_deref().unwrap_or("-"),
            item.name,
            flag,
        );
    }
    Ok(())
}

/// Flag an item for deletion.
///
/// The actual teardown (engine destruction, cache purge, record removal)
/// happens in the mount daemon once the item's engine reports readiness.
///
/// # Errors
/// - No item with this id, or the store is unwritable
async fn remove_item(store_path: PathBuf, id: u64) -> anyhow::Result<()> {
    let store = JsonFileStore::open(&store_path).await?;
    store
        .update(
            ItemId(id),
            ItemPatch {
                delete_requested: Some(true),
                ..Default::default()
            },
        )
        .await?;

    println!("Item {id} flagged for deletion.");
    println!("A running mount will tear it down and drop the record.");
    Ok(())
}

/// Run the mount daemon until interrupted.
///
/// # Errors
/// - No backend selected, the store cannot be opened, or the kernel mount
///   fails
async fn mount(
    store_path: PathBuf,
    mountpoint: PathBuf,
    simulation: bool,
    allow_other: bool,
) -> anyhow::Result<()> {
    if !simulation {
        bail!(
            "no production swarm backend is configured; \
             pass --simulation to use the in-memory engine"
        );
    }

    let config = TidefsConfig::from_env();
    let store: Arc<dyn RecordStore> = Arc::new(JsonFileStore::open(&store_path).await?);
    let launcher = SimLauncher::with_defaults();

    let daemon = TidefsDaemon::start(config, store, launcher).await;
    let session = fuse::mount(
        daemon.vfs(),
        &mountpoint,
        &MountOptions {
            allow_other,
            auto_unmount: true,
        },
    )
    .with_context(|| format!("mounting at {}", mountpoint.display()))?;

    println!("Mounted at {} (Ctrl+C to unmount)", mountpoint.display());
    tokio::signal::ctrl_c().await?;
    println!();

    drop(session);
    daemon.shutdown().await;
    Ok(())
}

struct ParsedMagnet {
    info_hash: InfoHash,
    display_name: Option<String>,
}

/// Validate a magnet link and extract the info hash and display name.
fn parse_magnet(url: &str) -> anyhow::Result<ParsedMagnet> {
    let magnet = magnet_url::Magnet::new(url)
        .map_err(|e| anyhow::anyhow!("invalid magnet link: {e}"))?;

    let info_hash = extract_info_hash(url)?;
    Ok(ParsedMagnet {
        info_hash,
        display_name: magnet.display_name().map(|s| s.to_string()),
    })
}

/// Pull the `xt=urn:btih:` hex digest out of a magnet URI.
fn extract_info_hash(url: &str) -> anyhow::Result<InfoHash> {
    for param in url.split(['?', '&']) {
        if let Some(value) = param.strip_prefix("xt=urn:btih:") {
            return value
                .to_lowercase()
                .parse::<InfoHash>()
                .map_err(|e| anyhow::anyhow!("invalid info hash in magnet link: {e}"));
        }
    }
    bail!("magnet link has no xt=urn:btih parameter")
}

fn format_bytes(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / 1_048_576.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_info_hash_valid() {
        let url = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Test";
        let info_hash = extract_info_hash(url).unwrap();
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_extract_info_hash_uppercase() {
        let url = "magnet:?xt=urn:btih:0123456789ABCDEF0123456789ABCDEF01234567";
        assert!(extract_info_hash(url).is_ok());
    }

    #[test]
    fn test_extract_info_hash_missing() {
        assert!(extract_info_hash("magnet:?dn=NoHash").is_err());
    }

    #[test]
    fn test_extract_info_hash_wrong_length() {
        assert!(extract_info_hash("magnet:?xt=urn:btih:0123").is_err());
    }

    #[tokio::test]
    async fn test_add_and_list_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("items.json");
        let magnet =
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Example".to_string();

        add_magnet(store_path.clone(), magnet, Some("tv".into()))
            .await
            .unwrap();

        let store = JsonFileStore::open(&store_path).await.unwrap();
        let items = store.fetch_all().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "Example");
        assert_eq!(items[0].category.as_deref(), Some("tv"));

        remove_item(store_path.clone(), items[0].id.as_u64())
            .await
            .unwrap();
        let items = store.fetch_all().await.unwrap();
        assert!(items[0].delete_requested);
    }
}
