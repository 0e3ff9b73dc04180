use std::fs;
use std::path::{Path, PathBuf};

use api::error::{ApiError, ErrorCode};

/// trims, slash-normalizes, and rejects anything that could escape
/// MediaRoot -- absolute paths, UNC paths, drive letters, and `..` segments.
/// the empty string denotes MediaRoot itself.
pub fn normalize_rel_path(rel_path: &str) -> Result<String, ApiError> {
    let trimmed = rel_path.trim();
    if trimmed.is_empty() || trimmed == "." {
        return Ok(String::new());
    }

    let slashed = trimmed.replace('\\', "/");

    if slashed.starts_with("//") {
        return Err(ApiError::new(
            ErrorCode::SandboxViolation,
            "rel_path must not be a UNC path",
        ));
    }
    if slashed.starts_with('/') {
        return Err(ApiError::new(
            ErrorCode::SandboxViolation,
            "rel_path must not be absolute",
        ));
    }
    if is_drive_letter_prefixed(&slashed) {
        return Err(ApiError::new(
            ErrorCode::SandboxViolation,
            "rel_path must not include a drive letter",
        ));
    }

    let mut parts = Vec::new();
    for part in slashed.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if part == ".." {
            return Err(ApiError::new(
                ErrorCode::SandboxViolation,
                "rel_path must not contain '..'",
            ));
        }
        parts.push(part);
    }

    Ok(parts.join("/"))
}

fn is_drive_letter_prefixed(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn norm_case(path: &Path) -> PathBuf {
    // windows normcase would lowercase and flip separators; this codebase
    // targets case-sensitive unix-like filesystems, so normcase is identity
    path.to_path_buf()
}

fn is_within_root(root: &Path, path: &Path) -> bool {
    let root = norm_case(root);
    let path = norm_case(path);
    path.starts_with(&root)
}

#[cfg(unix)]
fn is_reparse_point(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(not(unix))]
fn is_reparse_point(meta: &fs::Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x400;
    meta.file_attributes() & FILE_ATTRIBUTE_REPARSE_POINT != 0
}

/// read-only value wrapping a validated, existing MediaRoot directory; every
/// filesystem operation in the system goes through `resolve`
#[derive(Clone, Debug)]
pub struct Sandbox {
    media_root: PathBuf,
}

impl Sandbox {
    pub fn new(media_root: impl Into<PathBuf>) -> Result<Self, ApiError> {
        let media_root = media_root.into();
        let meta = fs::metadata(&media_root).map_err(|err| {
            ApiError::new(
                ErrorCode::StatFailed,
                format!("MediaRoot does not exist: {media_root:?} ({err})"),
            )
        })?;
        if !meta.is_dir() {
            return Err(ApiError::new(
                ErrorCode::NotADir,
                format!("MediaRoot is not a directory: {media_root:?}"),
            ));
        }
        Ok(Sandbox { media_root })
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    /// join MediaRoot with `rel_path`'s segments and validate containment;
    /// the final path (and any prefix of it) must already exist
    pub fn resolve(&self, rel_path: &str) -> Result<PathBuf, ApiError> {
        self.resolve_impl(rel_path, false)
    }

    /// like `resolve`, but permits the final segments to not exist yet --
    /// used for destination paths of move/restore before they are created
    pub fn resolve_allow_missing(&self, rel_path: &str) -> Result<PathBuf, ApiError> {
        self.resolve_impl(rel_path, true)
    }

    fn resolve_impl(&self, rel_path: &str, allow_missing: bool) -> Result<PathBuf, ApiError> {
        let rel_path = normalize_rel_path(rel_path)?;
        if rel_path.is_empty() {
            return Ok(self.media_root.clone());
        }

        let mut abs_path = self.media_root.clone();
        for seg in rel_path.split('/') {
            abs_path.push(seg);
        }

        if !is_within_root(&self.media_root, &abs_path) {
            return Err(ApiError::new(
                ErrorCode::SandboxViolation,
                "path escapes MediaRoot by prefix check",
            ));
        }

        self.reject_reparse_traversal(&rel_path, allow_missing)?;
        Ok(abs_path)
    }

    fn reject_reparse_traversal(&self, rel_path: &str, allow_missing: bool) -> Result<(), ApiError> {
        let mut current = self.media_root.clone();
        for seg in rel_path.split('/') {
            current.push(seg);

            let meta = match fs::symlink_metadata(&current) {
                Ok(meta) => meta,
                Err(err) if allow_missing && err.kind() == std::io::ErrorKind::NotFound => break,
                Err(err) => {
                    return Err(ApiError::new(
                        ErrorCode::SandboxViolation,
                        format!("cannot stat path segment {current:?}: {err}"),
                    ));
                }
            };

            if meta.is_symlink() || is_reparse_point(&meta) {
                return Err(ApiError::new(
                    ErrorCode::SandboxViolation,
                    format!("reparse/symlink segment is not allowed: {current:?}"),
                ));
            }
        }

        // if the full path exists, also verify its fully-resolved form stays
        // inside MediaRoot -- catches a symlink *target* that itself points
        // to an in-bounds-looking but actually escaping location
        let full = {
            let mut full = self.media_root.clone();
            for seg in rel_path.split('/') {
                full.push(seg);
            }
            full
        };
        if let Ok(resolved) = fs::canonicalize(&full) {
            if !is_within_root(&self.media_root, &resolved) {
                return Err(ApiError::new(
                    ErrorCode::SandboxViolation,
                    "path resolves outside MediaRoot",
                ));
            }
        }

        Ok(())
    }
}

/// lists the direct file children of `dir` whose lowercased extension is in
/// `exts`, sorted case-foldedly. shared by the album-images HTTP endpoint
/// and the album-cover/video-mosaic candidate selection, both of which need
/// the same "direct image children" notion without depending on each other.
pub async fn list_dir_filenames_with_ext(
    dir: &Path,
    exts: &std::collections::HashSet<String>,
) -> Result<Vec<String>, ApiError> {
    let mut read_dir = tokio::fs::read_dir(dir)
        .await
        .map_err(|err| ApiError::new(ErrorCode::ReadDirFailed, err.to_string()))?;

    let mut names = Vec::new();
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|err| ApiError::new(ErrorCode::ReadDirFailed, err.to_string()))?
    {
        let file_type = match entry.file_type().await {
            Ok(t) => t,
            Err(_) => continue,
        };
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let ext = name
            .rfind('.')
            .map(|idx| name[idx..].to_ascii_lowercase())
            .unwrap_or_default();
        if exts.contains(&ext) {
            names.push(name);
        }
    }
    names.sort_by_key(|n| n.to_ascii_lowercase());
    names.dedup();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dot_segments() {
        assert_eq!(normalize_rel_path("a/./b/").unwrap(), "a/b");
        assert_eq!(normalize_rel_path("").unwrap(), "");
        assert_eq!(normalize_rel_path(".").unwrap(), "");
    }

    #[test]
    fn normalize_rejects_traversal() {
        assert!(normalize_rel_path("a/../b").is_err());
        assert!(normalize_rel_path("/abs").is_err());
        assert!(normalize_rel_path("//unc/share").is_err());
        assert!(normalize_rel_path("C:/windows").is_err());
    }

    #[test]
    fn resolve_stays_within_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("album")).unwrap();
        std::fs::write(dir.path().join("album/a.jpg"), b"x").unwrap();

        let sandbox = Sandbox::new(dir.path()).unwrap();
        let resolved = sandbox.resolve("album/a.jpg").unwrap();
        assert!(resolved.starts_with(dir.path()));
    }

    #[test]
    fn resolve_rejects_missing_segment_unless_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(dir.path()).unwrap();

        assert!(sandbox.resolve("missing/file.txt").is_err());
        assert!(sandbox.resolve_allow_missing("missing/file.txt").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn resolve_rejects_symlink_segment() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        symlink(outside.path(), dir.path().join("sym")).unwrap();

        let sandbox = Sandbox::new(dir.path()).unwrap();
        let err = sandbox.resolve("sym/file.txt").unwrap_err();
        assert_eq!(err.code, ErrorCode::SandboxViolation);
    }
}
