use std::path::{Path, PathBuf};

use serde::Deserialize;

use api::media_types::{MediaTypes, MediaTypesFile};

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("cache")
}

fn default_op_log_path() -> PathBuf {
    PathBuf::from("operations.jsonl")
}

fn default_thumb_size() -> u32 {
    320
}

fn default_thumb_quality() -> u8 {
    85
}

fn default_thumb_workers() -> usize {
    4
}

fn default_thumb_queue_capacity() -> usize {
    2048
}

fn default_trash_retention_days() -> u64 {
    10
}

fn default_trash_cleanup_throttle_sec() -> u64 {
    3600
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    Mtime,
    Sha1,
}

impl Default for KeyMode {
    fn default() -> Self {
        KeyMode::Mtime
    }
}

/// on-disk shape of the JSON config file; field presence/absence is
/// distinguished from an empty string, which is treated as absent
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    media_root: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    cache_root: Option<String>,
    #[serde(default)]
    op_log_path: Option<String>,
    #[serde(default)]
    media_types_path: Option<String>,
    #[serde(default)]
    key_mode: Option<KeyMode>,
    #[serde(default)]
    thumb_size: Option<u32>,
    #[serde(default)]
    thumb_quality: Option<u8>,
    #[serde(default)]
    thumb_workers: Option<usize>,
    #[serde(default)]
    thumb_queue_capacity: Option<usize>,
    #[serde(default)]
    trash_retention_days: Option<u64>,
    #[serde(default)]
    trash_cleanup_throttle_sec: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub media_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub cache_root: PathBuf,
    pub op_log_path: PathBuf,
    pub media_types_path: Option<PathBuf>,
    pub confirm_secret: Vec<u8>,
    pub key_mode: KeyMode,
    pub thumb_size: u32,
    pub thumb_quality: u8,
    pub thumb_workers: usize,
    pub thumb_queue_capacity: usize,
    pub trash_retention_days: u64,
    pub trash_cleanup_throttle_sec: u64,
    pub media_types: MediaTypes,
}

impl ServerConfig {
    pub fn mosaic_workers(&self) -> usize {
        (self.thumb_workers / 2).max(1)
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.trim().is_empty())
}

/// loads the server config from `path`, merging in defaults for every field
/// the file omits, and reading `confirm_secret` out of the `CONFIRM_SECRET`
/// environment variable rather than the file. Panics on any I/O, parse, or
/// missing-secret failure: this is top-level process startup and there is
/// nothing sensible to run with instead.
#[tracing::instrument]
pub async fn read_config(path: &Path) -> ServerConfig {
    let raw = tokio::fs::read_to_string(path)
        .await
        .unwrap_or_else(|err| panic!("failed to read config file {path:?}: {err}"));
    let file: ConfigFile = serde_json::from_str(&raw)
        .unwrap_or_else(|err| panic!("failed to parse config file {path:?}: {err}"));

    let media_root = non_empty(file.media_root)
        .map(PathBuf::from)
        .unwrap_or_else(|| panic!("config file {path:?} must set media_root"));

    let confirm_secret = std::env::var("CONFIRM_SECRET")
        .unwrap_or_else(|_| panic!("CONFIRM_SECRET environment variable must be set"))
        .into_bytes();

    let media_types_path = non_empty(file.media_types_path).map(PathBuf::from);
    let media_types = read_media_types(media_types_path.as_deref())
        .await
        .unwrap_or_else(|err| panic!("failed to load media types file: {err}"));

    ServerConfig {
        media_root,
        host: non_empty(file.host).unwrap_or_else(default_host),
        port: file.port.unwrap_or_else(default_port),
        cache_root: non_empty(file.cache_root)
            .map(PathBuf::from)
            .unwrap_or_else(default_cache_root),
        op_log_path: non_empty(file.op_log_path)
            .map(PathBuf::from)
            .unwrap_or_else(default_op_log_path),
        media_types_path,
        confirm_secret,
        key_mode: file.key_mode.unwrap_or_default(),
        thumb_size: file.thumb_size.unwrap_or_else(default_thumb_size),
        thumb_quality: file.thumb_quality.unwrap_or_else(default_thumb_quality),
        thumb_workers: file.thumb_workers.unwrap_or_else(default_thumb_workers),
        thumb_queue_capacity: file
            .thumb_queue_capacity
            .unwrap_or_else(default_thumb_queue_capacity),
        trash_retention_days: file
            .trash_retention_days
            .unwrap_or_else(default_trash_retention_days),
        trash_cleanup_throttle_sec: file
            .trash_cleanup_throttle_sec
            .unwrap_or_else(default_trash_cleanup_throttle_sec),
        media_types,
    }
}

/// loads media-type overrides from `path` if given, merged onto
/// `MediaTypes::defaults()`; a missing `path` (None) yields defaults
/// untouched, matching the python loader's fallback behavior
#[tracing::instrument]
pub async fn read_media_types(path: Option<&Path>) -> anyhow::Result<MediaTypes> {
    let Some(path) = path else {
        return Ok(MediaTypes::defaults());
    };
    let raw = tokio::fs::read_to_string(path).await?;
    let file: MediaTypesFile = serde_json::from_str(&raw)?;
    file.into_media_types().map_err(|err| anyhow::anyhow!(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        tokio::fs::write(&config_path, r#"{"media_root": "/srv/media"}"#)
            .await
            .unwrap();

        unsafe {
            std::env::set_var("CONFIRM_SECRET", "unit-test-secret");
        }
        let config = read_config(&config_path).await;

        assert_eq!(config.media_root, PathBuf::from("/srv/media"));
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.thumb_size, 320);
        assert_eq!(config.mosaic_workers(), 2);
    }

    #[tokio::test]
    async fn read_media_types_without_path_uses_defaults() {
        let types = read_media_types(None).await.unwrap();
        assert_eq!(types.categorize(".jpg"), api::media_types::MediaCategory::Image);
    }

    #[tokio::test]
    async fn read_media_types_merges_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("media_types.json");
        tokio::fs::write(&path, r#"{"images": [".jxl"]}"#)
            .await
            .unwrap();

        let types = read_media_types(Some(&path)).await.unwrap();
        assert_eq!(types.categorize(".jxl"), api::media_types::MediaCategory::Image);
        assert_eq!(types.categorize(".mp4"), api::media_types::MediaCategory::Video);
    }
}
