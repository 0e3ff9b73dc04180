use std::path::Path;
use std::time::UNIX_EPOCH;

use api::inventory::{InventoryItem, InventoryResult, InventoryStats, InventoryWarning, ItemKind, WarningCode};
use tracing::debug;
use walkdir::WalkDir;

fn mtime_ms(meta: &std::fs::Metadata) -> Option<i64> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// `_trash` (case-insensitive, first path segment only) is the mutation
/// service's own staging area, never a real album -- it is never shown in
/// listings and never descended into.
fn is_trash_segment(rel_path: &str) -> bool {
    rel_path
        .split('/')
        .next()
        .map(|seg| seg.eq_ignore_ascii_case("_trash"))
        .unwrap_or(false)
}

/// walks `media_root` depth-first, producing an ordered inventory of every
/// file and directory below it. symlinks are never followed: each one is
/// recorded as a warning and excluded from `items` rather than aborting the
/// scan.
#[tracing::instrument(skip(media_root))]
pub fn scan_inventory(media_root: &Path) -> InventoryResult {
    let mut items = Vec::new();
    let mut warnings = Vec::new();
    let mut stats = InventoryStats::new();

    let mut walker = WalkDir::new(media_root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let rel_path = err
                    .path()
                    .and_then(|p| p.strip_prefix(media_root).ok())
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                warnings.push(InventoryWarning {
                    code: WarningCode::ScandirFailed,
                    rel_path,
                    message: err.to_string(),
                });
                stats.incr("scandir_errors");
                continue;
            }
        };

        let rel_path = match entry.path().strip_prefix(media_root) {
            Ok(p) => p.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };

        if is_trash_segment(&rel_path) {
            debug!(rel_path = %rel_path, "skipping _trash entry");
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            stats.incr("skipped_trash");
            continue;
        }

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            debug!(rel_path = %rel_path, "skipping symlink entry");
            warnings.push(InventoryWarning {
                code: WarningCode::LinkSkipped,
                rel_path,
                message: "symlinks are never followed".to_string(),
            });
            stats.incr("skipped_links");
            continue;
        }

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                warnings.push(InventoryWarning {
                    code: WarningCode::StatFailed,
                    rel_path,
                    message: err.to_string(),
                });
                stats.incr("stat_errors");
                continue;
            }
        };

        let kind = if meta.is_dir() {
            stats.incr("dirs");
            ItemKind::Dir
        } else {
            stats.incr("files");
            ItemKind::File
        };

        items.push(InventoryItem {
            rel_path,
            kind,
            size_bytes: if meta.is_file() { Some(meta.len()) } else { None },
            mtime_ms: mtime_ms(&meta),
        });
    }

    let media_root_abs = media_root.to_string_lossy().to_string();
    InventoryResult {
        media_root_abs,
        scanned_at_ms: now_ms(),
        items,
        warnings,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn scan_collects_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("album")).unwrap();
        fs::write(dir.path().join("album/a.jpg"), b"x").unwrap();
        fs::write(dir.path().join("loose.txt"), b"y").unwrap();

        let result = scan_inventory(dir.path());
        let rel_paths: Vec<_> = result.items.iter().map(|i| i.rel_path.clone()).collect();

        assert!(rel_paths.contains(&"album".to_string()));
        assert!(rel_paths.contains(&"album/a.jpg".to_string()));
        assert!(rel_paths.contains(&"loose.txt".to_string()));
        assert!(result.warnings.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn scan_reports_symlinks_as_warnings() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        symlink(target.path(), dir.path().join("link")).unwrap();

        let result = scan_inventory(dir.path());
        assert!(result.items.iter().all(|i| i.rel_path != "link"));
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].code, WarningCode::LinkSkipped);
    }

    #[test]
    fn scan_skips_trash_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("album")).unwrap();
        fs::write(dir.path().join("album/a.jpg"), b"x").unwrap();
        fs::create_dir_all(dir.path().join("_TRASH/abc123")).unwrap();
        fs::write(dir.path().join("_TRASH/abc123/a.jpg"), b"z").unwrap();

        let result = scan_inventory(dir.path());
        let rel_paths: Vec<_> = result.items.iter().map(|i| i.rel_path.clone()).collect();

        assert!(rel_paths.contains(&"album".to_string()));
        assert!(rel_paths.iter().all(|p| !p.to_ascii_lowercase().starts_with("_trash")));
        assert_eq!(result.stats.0.get("skipped_trash"), Some(&1));
    }
}
