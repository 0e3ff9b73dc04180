use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use tokio::sync::Semaphore;

use api::error::{ApiError, ErrorCode};
use api::media_types::MediaTypes;
use common::awaitcache::AwaitCache;
use common::config::{KeyMode, ServerConfig};
use common::hash::{prng_seed_from_sha1, sha1_hex};
use common::sandbox::{list_dir_filenames_with_ext, Sandbox};

use crate::cache::{fingerprint, key_mode_tag, per_image_part, shard_path, stat_source, write_atomic};

const GENERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// deterministically sampled 2x2 blur-fit mosaic of an album's direct image
/// children, content-addressed on the album's listing and each member's
/// state so a single file change or reorder rolls the fingerprint.
pub struct AlbumCoverCache {
    cache_root: PathBuf,
    size: u32,
    quality: u8,
    key_mode: KeyMode,
    semaphore: Arc<Semaphore>,
    inflight: AwaitCache<String, PathBuf>,
}

impl AlbumCoverCache {
    pub fn new(config: &ServerConfig) -> Self {
        AlbumCoverCache {
            cache_root: config.cache_root.clone(),
            size: config.thumb_size,
            quality: config.thumb_quality,
            key_mode: config.key_mode,
            semaphore: Arc::new(Semaphore::new(config.thumb_workers.max(1))),
            inflight: AwaitCache::new(),
        }
    }

    #[tracing::instrument(skip(self, sandbox, media_types))]
    pub async fn ensure(
        &self,
        album_rel: &str,
        sandbox: &Sandbox,
        media_types: &MediaTypes,
    ) -> Result<PathBuf, ApiError> {
        let abs_dir = sandbox.resolve(album_rel)?;
        let dir_meta = tokio::fs::metadata(&abs_dir)
            .await
            .map_err(|err| ApiError::new(ErrorCode::NotFound, format!("{album_rel}: {err}")))?;
        if !dir_meta.is_dir() {
            return Err(ApiError::new(ErrorCode::NotADir, album_rel.to_string()));
        }
        let dir_mtime_ns = dir_meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i128)
            .unwrap_or(0);

        let candidates = list_dir_filenames_with_ext(&abs_dir, &media_types.image_exts).await?;
        if candidates.is_empty() {
            return Err(ApiError::new(ErrorCode::AlbumEmpty, album_rel.to_string()));
        }

        let listing_hash = sha1_hex(candidates.join("\0").as_bytes());
        let seed_digest = sha1_hex(
            format!(
                "v1|{album_rel}|m={dir_mtime_ns}|n={}|h={listing_hash}",
                candidates.len()
            )
            .as_bytes(),
        );
        let selected = sample_four(&candidates, &seed_digest);

        let mut per_image_parts = Vec::with_capacity(4);
        let mut abs_selected = Vec::with_capacity(4);
        for name in &selected {
            let rel = if album_rel.is_empty() {
                name.clone()
            } else {
                format!("{album_rel}/{name}")
            };
            let abs = sandbox.resolve(&rel)?;
            let state = stat_source(&abs).await?;
            per_image_parts.push(per_image_part(self.key_mode, &rel, &abs, &state).await?);
            abs_selected.push(abs);
        }

        let mut parts = vec![
            "v1".to_string(),
            "jpeg".to_string(),
            "layout=2x2".to_string(),
            "style=blur-fit".to_string(),
            format!("s={}", self.size),
            format!("q={}", self.quality),
            key_mode_tag(self.key_mode).to_string(),
            format!("album={album_rel}"),
            format!("m={dir_mtime_ns}"),
            format!("n={}", candidates.len()),
            format!("h={listing_hash}"),
        ];
        parts.extend(per_image_parts);
        let fp = fingerprint(&parts.iter().map(String::as_str).collect::<Vec<_>>());
        let cache_path = shard_path(&self.cache_root, "album-covers", &fp);

        if tokio::fs::metadata(&cache_path).await.is_ok() {
            return Ok(cache_path);
        }

        let size = self.size;
        let quality = self.quality;
        let semaphore = self.semaphore.clone();
        let cache_path_for_render = cache_path.clone();
        let abs_selected_for_render = abs_selected.clone();

        let result = tokio::time::timeout(
            GENERATION_TIMEOUT,
            self.inflight.get_or_compute(fp.clone(), move || async move {
                if tokio::fs::metadata(&cache_path_for_render).await.is_ok() {
                    return Ok(cache_path_for_render);
                }
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| ApiError::new(ErrorCode::ThumbRateLimited, "semaphore closed"))?;
                render_cover(&abs_selected_for_render, &cache_path_for_render, size, quality).await?;
                Ok(cache_path_for_render)
            }),
        )
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(ApiError::new(
                ErrorCode::ThumbRateLimited,
                "timed out waiting for an album cover worker",
            )),
        }
    }
}

/// picks 4 filenames deterministically from `candidates` seeded by
/// `seed_digest`: without replacement when there are at least 4, otherwise
/// samples all and pads by random choice from the sampled subset
fn sample_four(candidates: &[String], seed_digest: &str) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(prng_seed_from_sha1(seed_digest));
    if candidates.len() >= 4 {
        candidates
            .choose_multiple(&mut rng, 4)
            .cloned()
            .collect()
    } else {
        let mut selected: Vec<String> = candidates.to_vec();
        while selected.len() < 4 {
            let pick = candidates.choose(&mut rng).expect("candidates is non-empty");
            selected.push(pick.clone());
        }
        selected
    }
}

async fn render_cover(
    abs_paths: &[PathBuf],
    dest: &std::path::Path,
    size: u32,
    quality: u8,
) -> Result<(), ApiError> {
    let paths: [PathBuf; 4] = abs_paths
        .to_vec()
        .try_into()
        .map_err(|_| ApiError::new(ErrorCode::AlbumCoverFailed, "expected exactly 4 source images"))?;
    let bytes = tokio::task::spawn_blocking(move || {
        let refs = [
            paths[0].as_path(),
            paths[1].as_path(),
            paths[2].as_path(),
            paths[3].as_path(),
        ];
        common::render::render_mosaic_jpeg(&refs, size, quality)
    })
    .await
    .map_err(|err| ApiError::new(ErrorCode::AlbumCoverFailed, format!("render task panicked: {err}")))??;

    write_atomic(dest, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

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
            media_types: MediaTypes::defaults(),
        }
    }

    fn write_test_jpeg(path: &Path) {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(32, 20, image::Rgb([10, 20, 30])));
        img.save_with_format(path, image::ImageFormat::Jpeg).unwrap();
    }

    #[tokio::test]
    async fn ensure_renders_and_reuses_fingerprint_for_album() {
        let media_dir = tempfile::tempdir().unwrap();
        let album = media_dir.path().join("vacation");
        std::fs::create_dir(&album).unwrap();
        for name in ["a.jpg", "b.jpg", "c.jpg", "d.jpg", "e.jpg"] {
            write_test_jpeg(&album.join(name));
        }
        let cache_dir = tempfile::tempdir().unwrap();

        let config = test_config(media_dir.path().to_path_buf(), cache_dir.path().to_path_buf());
        let sandbox = Sandbox::new(media_dir.path()).unwrap();
        let cache = AlbumCoverCache::new(&config);

        let path1 = cache.ensure("vacation", &sandbox, &config.media_types).await.unwrap();
        assert!(path1.exists());
        let path2 = cache.ensure("vacation", &sandbox, &config.media_types).await.unwrap();
        assert_eq!(path1, path2);
    }

    #[tokio::test]
    async fn ensure_pads_when_fewer_than_four_images() {
        let media_dir = tempfile::tempdir().unwrap();
        let album = media_dir.path().join("small");
        std::fs::create_dir(&album).unwrap();
        write_test_jpeg(&album.join("only.jpg"));
        let cache_dir = tempfile::tempdir().unwrap();

        let config = test_config(media_dir.path().to_path_buf(), cache_dir.path().to_path_buf());
        let sandbox = Sandbox::new(media_dir.path()).unwrap();
        let cache = AlbumCoverCache::new(&config);

        let path = cache.ensure("small", &sandbox, &config.media_types).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn ensure_rejects_empty_album() {
        let media_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(media_dir.path().join("empty")).unwrap();
        let cache_dir = tempfile::tempdir().unwrap();

        let config = test_config(media_dir.path().to_path_buf(), cache_dir.path().to_path_buf());
        let sandbox = Sandbox::new(media_dir.path()).unwrap();
        let cache = AlbumCoverCache::new(&config);

        let err = cache.ensure("empty", &sandbox, &config.media_types).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AlbumEmpty);
    }

    #[tokio::test]
    async fn ensure_rejects_missing_album() {
        let media_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();

        let config = test_config(media_dir.path().to_path_buf(), cache_dir.path().to_path_buf());
        let sandbox = Sandbox::new(media_dir.path()).unwrap();
        let cache = AlbumCoverCache::new(&config);

        let err = cache.ensure("nope", &sandbox, &config.media_types).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }
}
