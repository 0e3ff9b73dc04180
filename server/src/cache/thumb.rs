use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, warn};

use api::error::{ApiError, ErrorCode};
use api::media_types::MediaCategory;
use common::awaitcache::AwaitCache;
use common::config::{KeyMode, ServerConfig};
use common::sandbox::Sandbox;

use crate::cache::{fingerprint, key_body, key_mode_tag, shard_path, stat_source, write_atomic};

const GENERATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Default)]
pub struct WarmResult {
    pub accepted: usize,
    pub skipped_cached: usize,
    pub rejected: usize,
}

/// content-addressed JPEG thumbnails for arbitrary images in MediaRoot,
/// generated on demand with a bounded worker pool and a warm-up queue.
pub struct ThumbCache {
    cache_root: PathBuf,
    size: u32,
    quality: u8,
    key_mode: KeyMode,
    semaphore: Arc<Semaphore>,
    inflight: AwaitCache<String, PathBuf>,
    warm_pending: Arc<DashSet<String>>,
    warm_tx: tokio::sync::mpsc::Sender<WarmJob>,
}

enum WarmJob {
    Render(String, PathBuf),
    Shutdown,
}

impl ThumbCache {
    pub fn new(config: &ServerConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.thumb_workers.max(1)));
        let (warm_tx, warm_rx) = tokio::sync::mpsc::channel(config.thumb_queue_capacity.max(1));
        let warm_pending = Arc::new(DashSet::new());

        let cache = ThumbCache {
            cache_root: config.cache_root.clone(),
            size: config.thumb_size,
            quality: config.thumb_quality,
            key_mode: config.key_mode,
            semaphore: semaphore.clone(),
            inflight: AwaitCache::new(),
            warm_pending: warm_pending.clone(),
            warm_tx,
        };

        spawn_warm_workers(
            config.thumb_workers.max(1),
            warm_rx,
            cache.cache_root.clone(),
            cache.size,
            cache.quality,
            cache.key_mode,
            semaphore,
            warm_pending,
        );

        cache
    }

    #[tracing::instrument(skip(self, sandbox, media_types))]
    pub async fn ensure(
        &self,
        rel_path: &str,
        sandbox: &Sandbox,
        media_types: &api::media_types::MediaTypes,
    ) -> Result<PathBuf, ApiError> {
        let abs_path = sandbox.resolve(rel_path)?;
        validate_image_ext(rel_path, media_types)?;
        let state = stat_source(&abs_path).await?;
        let keybody = key_body(self.key_mode, rel_path, &abs_path, &state).await?;
        let fp = fingerprint(&[
            "v1",
            "jpeg",
            &format!("s={}", self.size),
            &format!("q={}", self.quality),
            key_mode_tag(self.key_mode),
            &keybody,
        ]);
        let cache_path = shard_path(&self.cache_root, "thumbs", &fp);

        if tokio::fs::metadata(&cache_path).await.is_ok() {
            return Ok(cache_path);
        }

        let size = self.size;
        let quality = self.quality;
        let semaphore = self.semaphore.clone();
        let abs_path_for_render = abs_path.clone();
        let cache_path_for_render = cache_path.clone();

        let result = tokio::time::timeout(
            GENERATION_TIMEOUT,
            self.inflight.get_or_compute(fp.clone(), move || async move {
                if tokio::fs::metadata(&cache_path_for_render).await.is_ok() {
                    return Ok(cache_path_for_render);
                }
                let _permit = semaphore.acquire().await.map_err(|_| {
                    ApiError::new(ErrorCode::ThumbRateLimited, "semaphore closed")
                })?;
                render_thumb(&abs_path_for_render, &cache_path_for_render, size, quality).await?;
                Ok(cache_path_for_render)
            }),
        )
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(ApiError::new(
                ErrorCode::ThumbRateLimited,
                "timed out waiting for a thumbnail worker",
            )),
        }
    }

    /// dedupe against in-flight warm requests; full queue returns false
    pub fn enqueue(&self, rel_path: String, abs_path: PathBuf) -> bool {
        if !self.warm_pending.insert(rel_path.clone()) {
            return true;
        }
        match self.warm_tx.try_send(WarmJob::Render(rel_path.clone(), abs_path)) {
            Ok(()) => true,
            Err(_) => {
                self.warm_pending.remove(&rel_path);
                false
            }
        }
    }

    pub async fn enqueue_many(
        &self,
        entries: Vec<(String, PathBuf)>,
        sandbox: &Sandbox,
        media_types: &api::media_types::MediaTypes,
    ) -> WarmResult {
        let mut result = WarmResult::default();
        for (rel_path, _) in &entries {
            if validate_image_ext(rel_path, media_types).is_err() {
                result.rejected += 1;
                continue;
            }
            let abs_path = match sandbox.resolve(rel_path) {
                Ok(p) => p,
                Err(_) => {
                    result.rejected += 1;
                    continue;
                }
            };

            let state = match stat_source(&abs_path).await {
                Ok(s) => s,
                Err(_) => {
                    result.rejected += 1;
                    continue;
                }
            };
            let keybody = match key_body(self.key_mode, rel_path, &abs_path, &state).await {
                Ok(k) => k,
                Err(_) => {
                    result.rejected += 1;
                    continue;
                }
            };
            let fp = fingerprint(&[
                "v1",
                "jpeg",
                &format!("s={}", self.size),
                &format!("q={}", self.quality),
                key_mode_tag(self.key_mode),
                &keybody,
            ]);
            let cache_path = shard_path(&self.cache_root, "thumbs", &fp);
            if tokio::fs::metadata(&cache_path).await.is_ok() {
                result.skipped_cached += 1;
                continue;
            }
            if self.enqueue(rel_path.clone(), abs_path) {
                result.accepted += 1;
            } else {
                result.rejected += 1;
            }
        }
        result
    }

    pub async fn close(&self) {
        let _ = self.warm_tx.send(WarmJob::Shutdown).await;
    }
}

fn validate_image_ext(
    rel_path: &str,
    media_types: &api::media_types::MediaTypes,
) -> Result<(), ApiError> {
    let ext = rel_path
        .rsplit('.')
        .next()
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    if media_types.categorize(&ext) != MediaCategory::Image {
        return Err(ApiError::new(
            ErrorCode::UnsupportedMediaType,
            format!("{rel_path} is not a recognized image type"),
        ));
    }
    Ok(())
}

async fn render_thumb(src: &Path, dest: &Path, size: u32, quality: u8) -> Result<(), ApiError> {
    let src = src.to_path_buf();
    let bytes = tokio::task::spawn_blocking(move || common::render::render_blur_fit_jpeg(&src, size, quality))
    .await
    .map_err(|err| ApiError::new(ErrorCode::ThumbnailFailed, format!("render task panicked: {err}")))??;

    write_atomic(dest, &bytes).await
}

#[allow(clippy::too_many_arguments)]
fn spawn_warm_workers(
    worker_count: usize,
    warm_rx: tokio::sync::mpsc::Receiver<WarmJob>,
    cache_root: PathBuf,
    size: u32,
    quality: u8,
    key_mode: KeyMode,
    semaphore: Arc<Semaphore>,
    warm_pending: Arc<DashSet<String>>,
) {
    let warm_rx = Arc::new(Mutex::new(warm_rx));
    for worker_id in 0..worker_count {
        let warm_rx = warm_rx.clone();
        let cache_root = cache_root.clone();
        let semaphore = semaphore.clone();
        let warm_pending = warm_pending.clone();
        tokio::task::spawn(async move {
            loop {
                let job = {
                    let mut rx = warm_rx.lock().await;
                    rx.recv().await
                };
                match job {
                    Some(WarmJob::Render(rel_path, abs_path)) => {
                        let state = match stat_source(&abs_path).await {
                            Ok(s) => s,
                            Err(err) => {
                                debug!(rel_path, %err, "warm job source vanished");
                                warm_pending.remove(&rel_path);
                                continue;
                            }
                        };
                        let keybody = match key_body(key_mode, &rel_path, &abs_path, &state).await {
                            Ok(k) => k,
                            Err(err) => {
                                debug!(rel_path, %err, "warm job fingerprint failed");
                                warm_pending.remove(&rel_path);
                                continue;
                            }
                        };
                        let fp = fingerprint(&[
                            "v1",
                            "jpeg",
                            &format!("s={size}"),
                            &format!("q={quality}"),
                            key_mode_tag(key_mode),
                            &keybody,
                        ]);
                        let dest = shard_path(&cache_root, "thumbs", &fp);
                        if tokio::fs::metadata(&dest).await.is_err() {
                            let _permit = semaphore.acquire().await;
                            if let Err(err) = render_thumb(&abs_path, &dest, size, quality).await {
                                error!(rel_path, %err, "warm render failed");
                            }
                        }
                        warm_pending.remove(&rel_path);
                    }
                    Some(WarmJob::Shutdown) | None => {
                        debug!(worker_id, "thumb warm worker shutting down");
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(media_root: PathBuf, cache_root: PathBuf) -> ServerConfig {
        ServerConfig {
            media_root,
            host: "127.0.0.1".to_string(),
            port: 0,
            cache_root,
            op_log_path: PathBuf::from("ops.jsonl"),
            media_types_path: None,
            confirm_secret: b"test".to_vec(),
            key_mode: KeyMode::Mtime,
            thumb_size: 64,
            thumb_quality: 80,
            thumb_workers: 2,
            thumb_queue_capacity: 16,
            trash_retention_days: 10,
            trash_cleanup_throttle_sec: 3600,
            media_types: api::media_types::MediaTypes::defaults(),
        }
    }

    fn write_test_jpeg(path: &Path) {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(32, 20, image::Rgb([10, 20, 30])));
        img.save_with_format(path, image::ImageFormat::Jpeg).unwrap();
    }

    #[tokio::test]
    async fn ensure_generates_and_reuses_fingerprint() {
        let media_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        write_test_jpeg(&media_dir.path().join("a.jpg"));

        let config = test_config(media_dir.path().to_path_buf(), cache_dir.path().to_path_buf());
        let sandbox = Sandbox::new(media_dir.path()).unwrap();
        let cache = ThumbCache::new(&config);

        let path1 = cache.ensure("a.jpg", &sandbox, &config.media_types).await.unwrap();
        assert!(path1.exists());
        let path2 = cache.ensure("a.jpg", &sandbox, &config.media_types).await.unwrap();
        assert_eq!(path1, path2);
    }

    #[tokio::test]
    async fn ensure_rejects_non_image_extension() {
        let media_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        std::fs::write(media_dir.path().join("notes.txt"), b"hi").unwrap();

        let config = test_config(media_dir.path().to_path_buf(), cache_dir.path().to_path_buf());
        let sandbox = Sandbox::new(media_dir.path()).unwrap();
        let cache = ThumbCache::new(&config);

        let err = cache.ensure("notes.txt", &sandbox, &config.media_types).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedMediaType);
    }

    #[tokio::test]
    async fn concurrent_ensure_calls_generate_once() {
        let media_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        write_test_jpeg(&media_dir.path().join("a.jpg"));

        let config = test_config(media_dir.path().to_path_buf(), cache_dir.path().to_path_buf());
        let sandbox = Sandbox::new(media_dir.path()).unwrap();
        let cache = Arc::new(ThumbCache::new(&config));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let cache = cache.clone();
            let sandbox = sandbox.clone();
            let media_types = config.media_types.clone();
            handles.push(tokio::spawn(async move {
                cache.ensure("a.jpg", &sandbox, &media_types).await
            }));
        }
        let mut paths = Vec::new();
        for h in handles {
            paths.push(h.await.unwrap().unwrap());
        }
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
    }
}
