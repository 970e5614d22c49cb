//! Namespace resolution for the mounted tree.
//!
//! Builds a flat file index from the current tracked items and synthesizes
//! directory listings from path prefixes. The index is an immutable snapshot
//! swapped atomically on refresh; directories are derived from file paths,
//! never stored. Categorized items gain one extra directory level above
//! their own directory; uncategorized items sit at the root.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::catalog::ItemCatalog;
use crate::store::{FileEntry, ItemId, TrackedItem};

/// Resolution result for one normalized path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathTarget {
    /// The path names a file
    File(FileRef),
    /// The path is a prefix of at least one file path
    Directory,
}

/// Locator for one file within one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRef {
    pub item_id: ItemId,
    /// Index into the item's cached file list
    pub file_index: usize,
    /// Declared length in bytes
    pub length: u64,
}

/// Immutable path index over one generation of the item catalog.
pub struct NamespaceIndex {
    generation: u64,
    by_path: HashMap<String, FileRef>,
    // Sorted, for prefix scans
    paths: Vec<String>,
}

impl NamespaceIndex {
    fn empty() -> Self {
        Self {
            generation: 0,
            by_path: HashMap::new(),
            paths: Vec::new(),
        }
    }

    fn build(generation: u64, items: &[Arc<TrackedItem>]) -> Self {
        let mut by_path = HashMap::new();

        for item in items {
            // Unresolved and to-be-deleted items contribute no paths
            if !item.is_resolved() || item.delete_requested {
                continue;
            }
            for (file_index, file) in item.file_list.iter().enumerate() {
                let path = match &item.category {
                    Some(category) => format!("{category}/{}", file.path),
                    None => file.path.clone(),
                };
                let path = normalize(&path).to_string();
                let file_ref = FileRef {
                    item_id: item.id,
                    file_index,
                    length: file.length,
                };
                if by_path.insert(path.clone(), file_ref).is_some() {
                    tracing::warn!("Duplicate mount path {path:?}, later item wins");
                }
            }
        }

        let mut paths: Vec<String> = by_path.keys().cloned().collect();
        paths.sort_unstable();

        Self {
            generation,
            by_path,
            paths,
        }
    }

    /// Resolves a path to a file or derived directory.
    ///
    /// The root resolves to a directory even when no items are tracked.
    pub fn resolve(&self, path: &str) -> Option<PathTarget> {
        let path = normalize(path);
        if path.is_empty() {
            return Some(PathTarget::Directory);
        }
        if let Some(file_ref) = self.by_path.get(path) {
            return Some(PathTarget::File(*file_ref));
        }
        if self.is_directory(path) {
            return Some(PathTarget::Directory);
        }
        None
    }

    /// Immediate child names beneath a path prefix, deduplicated.
    ///
    /// Returns `None` when the prefix matches nothing.
    pub fn children(&self, path: &str) -> Option<Vec<String>> {
        let path = normalize(path);
        let needle = if path.is_empty() {
            String::new()
        } else {
            format!("{path}/")
        };

        let start = self.paths.partition_point(|p| p.as_str() < needle.as_str());
        let mut names = BTreeSet::new();
        for p in &self.paths[start..] {
            if !p.starts_with(&needle) {
                break;
            }
            let rest = &p[needle.len()..];
            let first = rest.split('/').next().unwrap_or(rest);
            names.insert(first.to_string());
        }

        if names.is_empty() && !path.is_empty() {
            return None;
        }
        Some(names.into_iter().collect())
    }

    fn is_directory(&self, path: &str) -> bool {
        let needle = format!("{path}/");
        let idx = self.paths.partition_point(|p| p.as_str() < needle.as_str());
        self.paths
            .get(idx)
            .is_some_and(|p| p.starts_with(&needle))
    }
}

/// Strips leading and trailing slashes; kernel callbacks hand in absolute
/// paths while the index stores relative ones.
fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

/// Forces every file path to live under the item's own directory.
///
/// Single-file torrents report bare filenames; prefixing with the item name
/// keeps two items with identical filenames from colliding in the mount.
pub fn namespaced_file_list(item_name: &str, files: Vec<FileEntry>) -> Vec<FileEntry> {
    files
        .into_iter()
        .map(|mut file| {
            let under_item = file
                .path
                .strip_prefix(item_name)
                .is_some_and(|rest| rest.starts_with('/'));
            if !under_item {
                file.path = format!("{item_name}/{}", file.path);
            }
            file
        })
        .collect()
}

/// Atomically swapped namespace snapshot, rebuilt when the catalog moves.
pub struct NamespaceResolver {
    catalog: Arc<ItemCatalog>,
    cached: RwLock<Arc<NamespaceIndex>>,
}

impl NamespaceResolver {
    pub fn new(catalog: Arc<ItemCatalog>) -> Self {
        Self {
            catalog,
            cached: RwLock::new(Arc::new(NamespaceIndex::empty())),
        }
    }

    /// Current index snapshot.
    pub fn index(&self) -> Arc<NamespaceIndex> {
        self.cached.read().clone()
    }

    /// Rebuilds the index if the catalog generation moved; otherwise a no-op.
    pub fn refresh(&self) {
        let generation = self.catalog.generation();
        if self.cached.read().generation == generation {
            return;
        }

        let items = self.catalog.snapshot();
        let index = Arc::new(NamespaceIndex::build(generation, &items));
        tracing::debug!(
            "Rebuilt namespace index: {} paths, generation {generation}",
            index.paths.len()
        );
        *self.cached.write() = index;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ItemSource, TrackedItem};

    fn item(id: u64, name: &str, category: Option<&str>, files: &[(&str, u64)]) -> Arc<TrackedItem> {
        Arc::new(TrackedItem {
            id: ItemId(id),
            source: ItemSource::Magnet(format!("magnet:?xt=urn:btih:{name}")),
            name: name.to_string(),
            info_hash: None,
            category: category.map(|c| c.to_string()),
            file_list: files
                .iter()
                .map(|(path, length)| FileEntry {
                    path: path.to_string(),
                    length: *length,
                })
                .collect(),
            state: None,
            seed_hours: 0,
            total_uploaded: 0,
            total_downloaded: 0,
            last_read_at: None,
            delete_requested: false,
        })
    }

    #[test]
    fn test_root_children_are_item_and_category_names() {
        let items = vec![
            item(1, "alpha", None, &[("alpha/a.mp4", 10)]),
            item(2, "beta", Some("movies"), &[("beta/b.mp4", 20)]),
        ];
        let index = NamespaceIndex::build(1, &items);

        let children = index.children("/").unwrap();
        assert_eq!(children, vec!["alpha".to_string(), "movies".to_string()]);
    }

    #[test]
    fn test_children_dedupes_first_segments() {
        let items = vec![item(
            1,
            "alpha",
            None,
            &[
                ("alpha/s1/e1.mkv", 1),
                ("alpha/s1/e2.mkv", 1),
                ("alpha/s2/e1.mkv", 1),
            ],
        )];
        let index = NamespaceIndex::build(1, &items);

        assert_eq!(index.children("alpha").unwrap(), vec!["s1", "s2"]);
        assert_eq!(index.children("alpha/s1").unwrap(), vec!["e1.mkv", "e2.mkv"]);
        assert!(index.children("alpha/s3").is_none());
    }

    #[test]
    fn test_resolve_file_directory_and_missing() {
        let items = vec![item(2, "beta", Some("movies"), &[("beta/b.mp4", 20)])];
        let index = NamespaceIndex::build(1, &items);

        match index.resolve("/movies/beta/b.mp4") {
            Some(PathTarget::File(file_ref)) => {
                assert_eq!(file_ref.item_id, ItemId(2));
                assert_eq!(file_ref.length, 20);
            }
            other => panic!("expected file, got {other:?}"),
        }
        assert_eq!(index.resolve("movies"), Some(PathTarget::Directory));
        assert_eq!(index.resolve("movies/beta"), Some(PathTarget::Directory));
        assert_eq!(index.resolve(""), Some(PathTarget::Directory));
        assert_eq!(index.resolve("movies/beta/missing.mp4"), None);
        assert_eq!(index.resolve("books"), None);
    }

    #[test]
    fn test_same_filename_under_distinct_item_dirs() {
        let items = vec![
            item(1, "one", None, &[("one/video.mp4", 10)]),
            item(2, "two", None, &[("two/video.mp4", 20)]),
        ];
        let index = NamespaceIndex::build(1, &items);

        assert!(matches!(
            index.resolve("one/video.mp4"),
            Some(PathTarget::File(f)) if f.length == 10
        ));
        assert!(matches!(
            index.resolve("two/video.mp4"),
            Some(PathTarget::File(f)) if f.length == 20
        ));
    }

    #[test]
    fn test_unresolved_and_deleted_items_are_invisible() {
        let mut deleting = (*item(1, "gone", None, &[("gone/a.bin", 1)])).clone();
        deleting.delete_requested = true;
        let items = vec![
            Arc::new(deleting),
            item(2, "empty", None, &[]),
            item(3, "live", None, &[("live/a.bin", 1)]),
        ];
        let index = NamespaceIndex::build(1, &items);

        assert_eq!(index.children("").unwrap(), vec!["live"]);
        assert_eq!(index.resolve("gone/a.bin"), None);
    }

    #[test]
    fn test_namespaced_file_list_prefixes_bare_paths() {
        let files = vec![
            FileEntry {
                path: "video.mp4".into(),
                length: 1,
            },
            FileEntry {
                path: "show/e1.mkv".into(),
                length: 2,
            },
            FileEntry {
                path: "showreel.mp4".into(),
                length: 3,
            },
        ];
        let namespaced = namespaced_file_list("show", files);

        assert_eq!(namespaced[0].path, "show/video.mp4");
        assert_eq!(namespaced[1].path, "show/e1.mkv");
        assert_eq!(namespaced[2].path, "show/showreel.mp4");
    }
}
