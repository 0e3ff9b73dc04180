use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, Level};

use common::config::ServerConfig;
use common::sandbox::Sandbox;

use crate::cache::cover::AlbumCoverCache;
use crate::cache::mosaic::VideoMosaicCache;
use crate::cache::msg::CacheMsg;
use crate::cache::thumb::{ThumbCache, WarmResult};
use crate::cache::ESCacheService;
use crate::service::{ESInner, ESMReceiver, ESMRegistry, EntanglementService, ServiceType, ESM};

pub struct CacheService {
    config: Arc<ServerConfig>,
    receiver: Arc<Mutex<ESMReceiver>>,
}

#[async_trait]
impl EntanglementService for CacheService {
    type Inner = CacheState;

    fn create(config: Arc<ServerConfig>, registry: &ESMRegistry) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel::<ESM>(1024);
        registry
            .insert(ServiceType::Cache, tx)
            .expect("failed to insert sender for cache service");

        CacheService {
            config,
            receiver: Arc::new(Mutex::new(rx)),
        }
    }

    #[instrument(level = Level::DEBUG, skip(self, registry))]
    async fn start(&self, registry: &ESMRegistry) -> anyhow::Result<()> {
        info!("starting cache service");

        let receiver = Arc::clone(&self.receiver);
        let state = Arc::new(CacheState::new(self.config.clone(), registry.clone())?);

        tokio::task::spawn(async move {
            let mut receiver = receiver.lock().await;
            while let Some(msg) = receiver.recv().await {
                let state = Arc::clone(&state);
                tokio::task::spawn(async move {
                    if let Err(err) = state.message_handler(msg).await {
                        error!(service = "cache", error = %err, "message handler failed");
                    }
                });
            }
        });

        debug!("started cache service");
        Ok(())
    }
}

pub struct CacheState {
    config: Arc<ServerConfig>,
    registry: ESMRegistry,
    sandbox: Sandbox,
    thumbs: ThumbCache,
    covers: AlbumCoverCache,
    mosaics: VideoMosaicCache,
}

#[async_trait]
impl ESInner for CacheState {
    fn new(config: Arc<ServerConfig>, registry: ESMRegistry) -> anyhow::Result<Self> {
        let sandbox = Sandbox::new(&config.media_root)?;
        Ok(CacheState {
            thumbs: ThumbCache::new(&config),
            covers: AlbumCoverCache::new(&config),
            mosaics: VideoMosaicCache::new(&config),
            config,
            registry,
            sandbox,
        })
    }

    fn registry(&self) -> ESMRegistry {
        self.registry.clone()
    }

    async fn message_handler(&self, esm: ESM) -> anyhow::Result<()> {
        match esm {
            ESM::Cache(message) => match message {
                CacheMsg::EnsureThumb { resp, rel_path } => {
                    self.respond(resp, self.ensure_thumb(&rel_path)).await
                }
                CacheMsg::EnsureCover { resp, album_rel } => {
                    self.respond(resp, self.ensure_cover(&album_rel)).await
                }
                CacheMsg::EnsureMosaic { resp, rel_path } => {
                    self.respond(resp, self.ensure_mosaic(&rel_path)).await
                }
                CacheMsg::WarmThumbs { resp, rel_paths } => {
                    self.respond(resp, self.warm_thumbs(rel_paths)).await
                }
            },
            _ => Err(anyhow::Error::msg("cache service received a message for another service")),
        }
    }
}

#[async_trait]
impl ESCacheService for CacheState {
    #[instrument(skip(self))]
    async fn ensure_thumb(&self, rel_path: &str) -> anyhow::Result<std::path::PathBuf> {
        Ok(self.thumbs.ensure(rel_path, &self.sandbox, &self.config.media_types).await?)
    }

    #[instrument(skip(self))]
    async fn ensure_cover(&self, album_rel: &str) -> anyhow::Result<std::path::PathBuf> {
        Ok(self.covers.ensure(album_rel, &self.sandbox, &self.config.media_types).await?)
    }

    #[instrument(skip(self))]
    async fn ensure_mosaic(&self, rel_path: &str) -> anyhow::Result<std::path::PathBuf> {
        Ok(self.mosaics.ensure(rel_path, &self.sandbox, &self.config.media_types).await?)
    }

    #[instrument(skip(self, rel_paths))]
    async fn warm_thumbs(&self, rel_paths: Vec<String>) -> anyhow::Result<WarmResult> {
        let mut entries = Vec::with_capacity(rel_paths.len());
        let mut rejected = 0;
        for rel_path in rel_paths {
            match self.sandbox.resolve(&rel_path) {
                Ok(abs_path) => entries.push((rel_path, abs_path)),
                Err(_) => rejected += 1,
            }
        }
        let mut result = self
            .thumbs
            .enqueue_many(entries, &self.sandbox, &self.config.media_types)
            .await;
        result.rejected += rejected;
        Ok(result)
    }
}
