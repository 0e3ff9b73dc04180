use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, Level};

use api::error::{ApiError, ErrorCode};
use api::index::{AlbumImagesResult, MediaIndex};
use common::awaitcache::AwaitCache;
use common::config::ServerConfig;
use common::sandbox::Sandbox;

use crate::fs::{index::build_index, msg::FsMsg, scan::scan_inventory, ESFsService};
use crate::service::{ESInner, ESMReceiver, ESMRegistry, EntanglementService, ServiceType, ESM};

/// a single-slot, explicitly-refreshable holder of the last built MediaIndex.
/// concurrent refreshes coalesce into one scan+build by routing through
/// `inflight`; a failed build leaves the previous value (if any) untouched.
pub struct IndexCache {
    slot: RwLock<Option<MediaIndex>>,
    inflight: AwaitCache<(), MediaIndex>,
}

impl IndexCache {
    pub fn new() -> Self {
        IndexCache {
            slot: RwLock::new(None),
            inflight: AwaitCache::new(),
        }
    }

    pub async fn get(&self, refresh: bool, sandbox: &Sandbox, config: &ServerConfig) -> Result<MediaIndex, ApiError> {
        if !refresh {
            if let Some(existing) = self.slot.read().await.clone() {
                return Ok(existing);
            }
        }

        let media_root = sandbox.media_root().to_path_buf();
        let media_types = config.media_types.clone();

        let built = self
            .inflight
            .get_or_compute((), || async move {
                let inventory = tokio::task::spawn_blocking(move || scan_inventory(&media_root))
                    .await
                    .map_err(|err| {
                        ApiError::new(ErrorCode::IndexBuildFailed, format!("scan task panicked: {err}"))
                    })?;
                let index = build_index(&inventory, &media_types);
                Ok(index)
            })
            .await?;

        *self.slot.write().await = Some(built.clone());
        Ok(built)
    }
}

impl Default for IndexCache {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FsService {
    config: Arc<ServerConfig>,
    receiver: Arc<Mutex<ESMReceiver>>,
}

#[async_trait]
impl EntanglementService for FsService {
    type Inner = FsState;

    fn create(config: Arc<ServerConfig>, registry: &ESMRegistry) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel::<ESM>(1024);
        registry
            .insert(ServiceType::Fs, tx)
            .expect("failed to insert sender for fs service");

        FsService {
            config,
            receiver: Arc::new(Mutex::new(rx)),
        }
    }

    #[instrument(level = Level::DEBUG, skip(self, registry))]
    async fn start(&self, registry: &ESMRegistry) -> anyhow::Result<()> {
        info!("starting fs service");

        let receiver = Arc::clone(&self.receiver);
        let state = Arc::new(FsState::new(self.config.clone(), registry.clone())?);

        tokio::task::spawn(async move {
            let mut receiver = receiver.lock().await;
            while let Some(msg) = receiver.recv().await {
                let state = Arc::clone(&state);
                tokio::task::spawn(async move {
                    if let Err(err) = state.message_handler(msg).await {
                        error!(service = "fs", error = %err, "message handler failed");
                    }
                });
            }
        });

        debug!("started fs service");
        Ok(())
    }
}

pub struct FsState {
    config: Arc<ServerConfig>,
    registry: ESMRegistry,
    sandbox: Sandbox,
    index_cache: IndexCache,
}

#[async_trait]
impl ESInner for FsState {
    fn new(config: Arc<ServerConfig>, registry: ESMRegistry) -> anyhow::Result<Self> {
        let sandbox = Sandbox::new(&config.media_root)?;
        Ok(FsState {
            config,
            registry,
            sandbox,
            index_cache: IndexCache::new(),
        })
    }

    fn registry(&self) -> ESMRegistry {
        self.registry.clone()
    }

    async fn message_handler(&self, esm: ESM) -> anyhow::Result<()> {
        match esm {
            ESM::Fs(message) => match message {
                FsMsg::GetIndex { resp, refresh } => {
                    self.respond(resp, self.get_index(refresh)).await
                }
                FsMsg::AlbumImages { resp, album_rel } => {
                    self.respond(resp, self.album_images(&album_rel)).await
                }
            },
            _ => Err(anyhow::Error::msg("fs service received a message for another service")),
        }
    }
}

#[async_trait]
impl ESFsService for FsState {
    #[instrument(skip(self))]
    async fn get_index(&self, refresh: bool) -> anyhow::Result<MediaIndex> {
        Ok(self.index_cache.get(refresh, &self.sandbox, &self.config).await?)
    }

    #[instrument(skip(self))]
    async fn album_images(&self, album_rel: &str) -> anyhow::Result<AlbumImagesResult> {
        let abs_path = self.sandbox.resolve(album_rel)?;
        let meta = tokio::fs::metadata(&abs_path)
            .await
            .map_err(|err| ApiError::new(ErrorCode::NotFound, format!("{album_rel}: {err}")))?;
        if !meta.is_dir() {
            return Err(ApiError::new(ErrorCode::NotADir, album_rel.to_string()).into());
        }

        let mut read_dir = tokio::fs::read_dir(&abs_path)
            .await
            .map_err(|err| ApiError::new(ErrorCode::ReadDirFailed, format!("{album_rel}: {err}")))?;

        let mut names = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|err| ApiError::new(ErrorCode::ReadDirFailed, format!("{album_rel}: {err}")))?
        {
            let file_type = entry.file_type().await.ok();
            if file_type.map(|t| t.is_file()).unwrap_or(false) {
                let name = entry.file_name().to_string_lossy().to_string();
                let ext = name
                    .rsplit('.')
                    .next()
                    .map(|e| format!(".{}", e.to_ascii_lowercase()))
                    .unwrap_or_default();
                if self.config.media_types.image_exts.contains(&ext) {
                    names.push(name);
                }
            }
        }
        names.sort_by_key(|n| n.to_ascii_lowercase());

        let items: Vec<String> = names
            .into_iter()
            .map(|name| {
                if album_rel.is_empty() {
                    name
                } else {
                    format!("{album_rel}/{name}")
                }
            })
            .collect();

        Ok(AlbumImagesResult {
            album_rel_path: album_rel.to_string(),
            count: items.len(),
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(media_root: std::path::PathBuf) -> ServerConfig {
        ServerConfig {
            media_root,
            host: "127.0.0.1".to_string(),
            port: 0,
            cache_root: std::path::PathBuf::from("cache"),
            op_log_path: std::path::PathBuf::from("ops.jsonl"),
            media_types_path: None,
            confirm_secret: b"test".to_vec(),
            key_mode: common::config::KeyMode::Mtime,
            thumb_size: 320,
            thumb_quality: 85,
            thumb_workers: 4,
            thumb_queue_capacity: 2048,
            trash_retention_days: 10,
            trash_cleanup_throttle_sec: 3600,
            media_types: api::media_types::MediaTypes::defaults(),
        }
    }

    #[tokio::test]
    async fn index_cache_coalesces_concurrent_refresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("album")).unwrap();
        std::fs::write(dir.path().join("album/a.jpg"), b"x").unwrap();

        let sandbox = Sandbox::new(dir.path()).unwrap();
        let config = test_config(dir.path().to_path_buf());
        let cache = Arc::new(IndexCache::new());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let sandbox = sandbox.clone();
            let config_media_root = config.media_root.clone();
            handles.push(tokio::spawn(async move {
                let mut cfg = test_config(config_media_root);
                cfg.media_types = api::media_types::MediaTypes::defaults();
                cache.get(true, &sandbox, &cfg).await
            }));
        }

        for h in handles {
            let index = h.await.unwrap().unwrap();
            assert_eq!(index.albums.len(), 1);
        }
    }

    #[tokio::test]
    async fn album_images_lists_sorted_direct_images() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("album")).unwrap();
        std::fs::write(dir.path().join("album/b.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("album/A.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("album/notes.txt"), b"x").unwrap();

        let config = Arc::new(test_config(dir.path().to_path_buf()));
        let registry = ESMRegistry::new();
        let state = FsState::new(config, registry).unwrap();

        let result = state.album_images("album").await.unwrap();
        assert_eq!(result.count, 2);
        assert_eq!(result.items, vec!["album/A.jpg", "album/b.jpg"]);
    }
}
