use std::collections::{BTreeMap, HashSet};

use api::index::{AlbumSummary, MediaFile, MediaIndex, OtherFile};
use api::inventory::{InventoryResult, ItemKind};
use api::media_types::{MediaCategory, MediaTypes};

struct DirAgg {
    parent: Option<String>,
    depth: usize,
    children: Vec<String>,
    direct_images: u64,
    has_image_descendant: bool,
    mtime_ms: Option<i64>,
}

fn parent_of(rel_path: &str) -> String {
    match rel_path.rfind('/') {
        Some(idx) => rel_path[..idx].to_string(),
        None => String::new(),
    }
}

fn depth_of(rel_path: &str) -> usize {
    if rel_path.is_empty() {
        0
    } else {
        rel_path.matches('/').count() + 1
    }
}

fn ext_of(rel_path: &str) -> String {
    let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[idx..].to_ascii_lowercase(),
        _ => String::new(),
    }
}

/// builds the full MediaIndex from a raw inventory: directory aggregates,
/// album detection, and the scattered/video/game/other partitions, per the
/// folder-classification algorithm.
#[tracing::instrument(skip(inventory, media_types))]
pub fn build_index(inventory: &InventoryResult, media_types: &MediaTypes) -> MediaIndex {
    let mut dirs: BTreeMap<String, DirAgg> = BTreeMap::new();
    dirs.insert(
        String::new(),
        DirAgg {
            parent: None,
            depth: 0,
            children: Vec::new(),
            direct_images: 0,
            has_image_descendant: false,
            mtime_ms: None,
        },
    );

    for item in &inventory.items {
        if item.kind == ItemKind::Dir {
            dirs.insert(
                item.rel_path.clone(),
                DirAgg {
                    parent: Some(parent_of(&item.rel_path)),
                    depth: depth_of(&item.rel_path),
                    children: Vec::new(),
                    direct_images: 0,
                    has_image_descendant: false,
                    mtime_ms: item.mtime_ms,
                },
            );
        }
    }

    let child_links: Vec<(String, String)> = dirs
        .iter()
        .filter_map(|(rel_path, agg)| agg.parent.clone().map(|parent| (parent, rel_path.clone())))
        .collect();
    for (parent, child) in child_links {
        if let Some(agg) = dirs.get_mut(&parent) {
            agg.children.push(child);
        }
    }

    let mut images: Vec<MediaFile> = Vec::new();
    let mut videos: Vec<MediaFile> = Vec::new();
    let mut games_and_others: Vec<OtherFile> = Vec::new();

    for item in &inventory.items {
        if item.kind != ItemKind::File {
            continue;
        }
        let folder_rel_path = parent_of(&item.rel_path);
        if !dirs.contains_key(&folder_rel_path) {
            continue;
        }
        let ext = ext_of(&item.rel_path);
        let category = media_types.categorize(&ext);
        let media_file = MediaFile {
            rel_path: item.rel_path.clone(),
            folder_rel_path: folder_rel_path.clone(),
            ext,
            size_bytes: item.size_bytes,
            mtime_ms: item.mtime_ms,
        };

        match category {
            MediaCategory::Image => {
                if let Some(agg) = dirs.get_mut(&folder_rel_path) {
                    agg.direct_images += 1;
                }
                images.push(media_file);
            }
            MediaCategory::Video => videos.push(media_file),
            MediaCategory::Game | MediaCategory::Other => {
                games_and_others.push(OtherFile { media: media_file, category })
            }
        }
    }

    let mut by_depth: Vec<String> = dirs.keys().cloned().collect();
    by_depth.sort_by_key(|rel_path| std::cmp::Reverse(dirs[rel_path].depth));
    for rel_path in by_depth {
        let has_image_descendant = dirs[&rel_path]
            .children
            .iter()
            .any(|child| dirs[child].direct_images > 0 || dirs[child].has_image_descendant);
        if let Some(agg) = dirs.get_mut(&rel_path) {
            agg.has_image_descendant = has_image_descendant;
        }
    }

    let albums: HashSet<String> = dirs
        .iter()
        .filter(|(rel_path, agg)| {
            !rel_path.is_empty() && agg.direct_images >= 1 && !agg.has_image_descendant
        })
        .map(|(rel_path, _)| rel_path.clone())
        .collect();

    let mut album_summaries: Vec<AlbumSummary> = albums
        .iter()
        .map(|rel_path| {
            let agg = &dirs[rel_path];
            let name = rel_path.rsplit('/').next().unwrap_or(rel_path).to_string();
            AlbumSummary {
                rel_path: rel_path.clone(),
                name,
                title: rel_path.clone(),
                image_count: agg.direct_images,
                mtime_ms: agg.mtime_ms,
            }
        })
        .collect();

    let mut scattered_images: Vec<MediaFile> = Vec::new();
    for image in images {
        if !has_album_ancestor(&image.folder_rel_path, &albums) {
            scattered_images.push(image);
        }
    }

    album_summaries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    scattered_images.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    videos.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    games_and_others.sort_by(|a, b| a.media.rel_path.cmp(&b.media.rel_path));

    let games: Vec<OtherFile> = games_and_others
        .iter()
        .filter(|f| f.category == MediaCategory::Game)
        .cloned()
        .collect();
    let others: Vec<OtherFile> = games_and_others
        .into_iter()
        .filter(|f| f.category == MediaCategory::Other)
        .collect();

    let mut stats = inventory.stats.clone();
    stats.0.insert("albums".to_string(), album_summaries.len() as i64);
    stats
        .0
        .insert("scattered_images".to_string(), scattered_images.len() as i64);
    stats.0.insert("videos".to_string(), videos.len() as i64);
    stats.0.insert("games".to_string(), games.len() as i64);
    stats.0.insert("others".to_string(), others.len() as i64);

    MediaIndex {
        media_root_abs: inventory.media_root_abs.clone(),
        scanned_at_ms: inventory.scanned_at_ms,
        albums: album_summaries,
        scattered_images,
        videos,
        games,
        others,
        stats,
    }
}

fn has_album_ancestor(folder_rel_path: &str, albums: &HashSet<String>) -> bool {
    let mut current = folder_rel_path;
    loop {
        if albums.contains(current) {
            return true;
        }
        if current.is_empty() {
            return false;
        }
        current = match current.rfind('/') {
            Some(idx) => &current[..idx],
            None => "",
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::inventory::{InventoryItem, InventoryStats};

    fn item(rel_path: &str, kind: ItemKind) -> InventoryItem {
        InventoryItem {
            rel_path: rel_path.to_string(),
            kind,
            size_bytes: if kind == ItemKind::File { Some(10) } else { None },
            mtime_ms: Some(1_000),
        }
    }

    #[test]
    fn classifies_album_and_scattered() {
        let inventory = InventoryResult {
            media_root_abs: "/media".to_string(),
            scanned_at_ms: 0,
            items: vec![
                item("vacation", ItemKind::Dir),
                item("vacation/a.jpg", ItemKind::File),
                item("vacation/b.jpg", ItemKind::File),
                item("loose.jpg", ItemKind::File),
                item("clip.mp4", ItemKind::File),
            ],
            warnings: vec![],
            stats: InventoryStats::new(),
        };
        let index = build_index(&inventory, &MediaTypes::defaults());

        assert_eq!(index.albums.len(), 1);
        assert_eq!(index.albums[0].rel_path, "vacation");
        assert_eq!(index.albums[0].image_count, 2);
        assert_eq!(index.scattered_images.len(), 1);
        assert_eq!(index.scattered_images[0].rel_path, "loose.jpg");
        assert_eq!(index.videos.len(), 1);
    }

    #[test]
    fn nested_album_excludes_ancestor_from_album_status() {
        let inventory = InventoryResult {
            media_root_abs: "/media".to_string(),
            scanned_at_ms: 0,
            items: vec![
                item("trip", ItemKind::Dir),
                item("trip/day1", ItemKind::Dir),
                item("trip/day1/a.jpg", ItemKind::File),
                item("trip/day2", ItemKind::Dir),
                item("trip/day2/b.jpg", ItemKind::File),
            ],
            warnings: vec![],
            stats: InventoryStats::new(),
        };
        let index = build_index(&inventory, &MediaTypes::defaults());

        let album_paths: Vec<_> = index.albums.iter().map(|a| a.rel_path.as_str()).collect();
        assert!(album_paths.contains(&"trip/day1"));
        assert!(album_paths.contains(&"trip/day2"));
        assert!(!album_paths.contains(&"trip"));
        assert!(index.scattered_images.is_empty());
    }

    #[test]
    fn lists_are_sorted_ascending() {
        let inventory = InventoryResult {
            media_root_abs: "/media".to_string(),
            scanned_at_ms: 0,
            items: vec![
                item("b.mp4", ItemKind::File),
                item("a.mp4", ItemKind::File),
            ],
            warnings: vec![],
            stats: InventoryStats::new(),
        };
        let index = build_index(&inventory, &MediaTypes::defaults());
        assert_eq!(index.videos[0].rel_path, "a.mp4");
        assert_eq!(index.videos[1].rel_path, "b.mp4");
    }
}
