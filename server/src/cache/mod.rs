use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;

use api::error::{ApiError, ErrorCode};
use common::config::KeyMode;
use common::hash::sha1_hex;

use crate::cache::thumb::WarmResult;
use crate::service::ESInner;

pub mod cover;
pub mod mosaic;
pub mod msg;
pub mod svc;
pub mod thumb;

#[async_trait]
pub trait ESCacheService: ESInner {
    async fn ensure_thumb(&self, rel_path: &str) -> anyhow::Result<PathBuf>;

    async fn ensure_cover(&self, album_rel: &str) -> anyhow::Result<PathBuf>;

    async fn ensure_mosaic(&self, rel_path: &str) -> anyhow::Result<PathBuf>;

    async fn warm_thumbs(&self, rel_paths: Vec<String>) -> anyhow::Result<WarmResult>;
}

/// content identity of a source file used to bind a derivative's
/// fingerprint to the state of the file it was rendered from
#[derive(Clone, Debug)]
pub struct SourceState {
    pub mtime_ns: i128,
    pub size_bytes: u64,
}

pub async fn stat_source(path: &Path) -> Result<SourceState, ApiError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|err| ApiError::new(ErrorCode::NotFound, format!("{path:?}: {err}")))?;
    if !meta.is_file() {
        return Err(ApiError::new(ErrorCode::NotAFile, format!("{path:?}")));
    }
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i128)
        .unwrap_or(0);
    Ok(SourceState {
        mtime_ns,
        size_bytes: meta.len(),
    })
}

/// `mtime|<rel>|<mtime_ns>|<size>` or `sha1|<sha1(bytes)>` depending on the
/// configured key mode
pub async fn key_body(
    key_mode: KeyMode,
    rel_path: &str,
    path: &Path,
    state: &SourceState,
) -> Result<String, ApiError> {
    match key_mode {
        KeyMode::Mtime => Ok(format!(
            "mtime|{rel_path}|{}|{}",
            state.mtime_ns, state.size_bytes
        )),
        KeyMode::Sha1 => {
            let digest = common::hash::sha1_file(path)
                .await
                .map_err(|err| ApiError::new(ErrorCode::ThumbnailFailed, err.to_string()))?;
            Ok(format!("sha1|{digest}"))
        }
    }
}

/// per-image fragment for multi-image fingerprints (album cover, video
/// mosaic): `<rel>:<mtime_ns>:<size>` for mtime mode, `<sha1(bytes)>` for
/// sha1 mode -- unlike `key_body`, carries no `mtime|`/`sha1|` tag of its
/// own since the enclosing fingerprint already names the key mode once.
pub async fn per_image_part(
    key_mode: KeyMode,
    rel_path: &str,
    path: &Path,
    state: &SourceState,
) -> Result<String, ApiError> {
    match key_mode {
        KeyMode::Mtime => Ok(format!("{rel_path}:{}:{}", state.mtime_ns, state.size_bytes)),
        KeyMode::Sha1 => common::hash::sha1_file(path)
            .await
            .map_err(|err| ApiError::new(ErrorCode::ThumbnailFailed, err.to_string())),
    }
}

pub fn key_mode_tag(key_mode: KeyMode) -> &'static str {
    match key_mode {
        KeyMode::Mtime => "mtime",
        KeyMode::Sha1 => "sha1",
    }
}

/// `sha1("v1|jpeg|s=<size>|q=<quality>|<keymode>|<keybody>")` style
/// fingerprint shared by thumbnails, album covers, and video mosaics
pub fn fingerprint(parts: &[&str]) -> String {
    sha1_hex(parts.join("|").as_bytes())
}

/// two-level hex-sharded path: `<root>/<kind>/<aa>/<bb>/<hex>.jpg`
pub fn shard_path(root: &Path, kind: &str, hex: &str) -> PathBuf {
    root.join(kind).join(&hex[0..2]).join(&hex[2..4]).join(format!("{hex}.jpg"))
}

/// writes `bytes` to a `.tmp` sibling of `dest` and atomically renames it
/// into place, creating parent directories as needed
pub async fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<(), ApiError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| ApiError::new(ErrorCode::ThumbnailFailed, err.to_string()))?;
    }
    let tmp = dest.with_extension("tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|err| ApiError::new(ErrorCode::ThumbnailFailed, err.to_string()))?;
    tokio::fs::rename(&tmp, dest)
        .await
        .map_err(|err| ApiError::new(ErrorCode::ThumbnailFailed, err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_path_splits_first_four_hex_chars() {
        let root = Path::new("/cache");
        let path = shard_path(root, "thumbs", "abcdef0123");
        assert_eq!(path, Path::new("/cache/thumbs/ab/cd/abcdef0123.jpg"));
    }

    #[test]
    fn fingerprint_is_stable_for_same_inputs() {
        let a = fingerprint(&["v1", "jpeg", "s=320"]);
        let b = fingerprint(&["v1", "jpeg", "s=320"]);
        assert_eq!(a, b);
    }
}
