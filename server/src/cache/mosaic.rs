use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::warn;

use api::error::{ApiError, ErrorCode};
use api::media_types::{MediaCategory, MediaTypes};
use common::awaitcache::AwaitCache;
use common::config::{KeyMode, ServerConfig};
use common::sandbox::Sandbox;

use crate::cache::{fingerprint, key_body, key_mode_tag, shard_path, stat_source, write_atomic};

const GENERATION_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const EXTRACT_TIMEOUT: Duration = Duration::from_secs(30);
const FRAME_COUNT: usize = 4;
const FALLBACK_TIMESTAMPS: [f64; FRAME_COUNT] = [0.0, 1.0, 2.0, 3.0];

/// content-addressed JPEG 2x2 mosaics of four extracted video frames,
/// generated on demand via an external `ffprobe`/`ffmpeg` toolchain.
pub struct VideoMosaicCache {
    cache_root: PathBuf,
    size: u32,
    quality: u8,
    key_mode: KeyMode,
    semaphore: Arc<Semaphore>,
    inflight: AwaitCache<String, PathBuf>,
}

impl VideoMosaicCache {
    pub fn new(config: &ServerConfig) -> Self {
        VideoMosaicCache {
            cache_root: config.cache_root.clone(),
            size: config.thumb_size,
            quality: config.thumb_quality,
            key_mode: config.key_mode,
            semaphore: Arc::new(Semaphore::new(config.mosaic_workers())),
            inflight: AwaitCache::new(),
        }
    }

    #[tracing::instrument(skip(self, sandbox, media_types))]
    pub async fn ensure(
        &self,
        rel_path: &str,
        sandbox: &Sandbox,
        media_types: &MediaTypes,
    ) -> Result<PathBuf, ApiError> {
        let abs_path = sandbox.resolve(rel_path)?;
        validate_video_ext(rel_path, media_types)?;
        let state = stat_source(&abs_path).await?;
        let keybody = key_body(self.key_mode, rel_path, &abs_path, &state).await?;
        let fp = fingerprint(&[
            "v1",
            "jpeg",
            &format!("s={}", self.size),
            &format!("q={}", self.quality),
            "frames=4",
            key_mode_tag(self.key_mode),
            &keybody,
        ]);
        let cache_path = shard_path(&self.cache_root, "video-mosaics", &fp);

        if tokio::fs::metadata(&cache_path).await.is_ok() {
            return Ok(cache_path);
        }

        // the binary must be resolvable now, not only when a cache hit would
        // have let us skip invoking it entirely
        ensure_ffmpeg_available().await?;

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
                    ApiError::new(ErrorCode::VideoMosaicRateLimited, "semaphore closed")
                })?;
                render_mosaic(&abs_path_for_render, &cache_path_for_render, size, quality).await?;
                Ok(cache_path_for_render)
            }),
        )
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(ApiError::new(
                ErrorCode::VideoMosaicRateLimited,
                "timed out waiting for a video mosaic worker",
            )),
        }
    }
}

fn validate_video_ext(rel_path: &str, media_types: &MediaTypes) -> Result<(), ApiError> {
    let ext = rel_path
        .rsplit('.')
        .next()
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    if media_types.categorize(&ext) != MediaCategory::Video {
        return Err(ApiError::new(
            ErrorCode::UnsupportedMediaType,
            format!("{rel_path} is not a recognized video type"),
        ));
    }
    Ok(())
}

async fn ensure_ffmpeg_available() -> Result<(), ApiError> {
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        Command::new("ffmpeg").arg("-version").stdout(Stdio::null()).stderr(Stdio::null()).status(),
    )
    .await;
    match output {
        Ok(Ok(status)) if status.success() => Ok(()),
        _ => Err(ApiError::new(
            ErrorCode::FfmpegNotAvailable,
            "ffmpeg executable could not be located",
        )),
    }
}

async fn probe_duration_secs(path: &Path) -> Option<f64> {
    let out = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new("ffprobe")
            .arg("-v").arg("error")
            .arg("-show_entries").arg("format=duration")
            .arg("-of").arg("default=noprint_wrappers=1:nokey=1")
            .arg(path)
            .stderr(Stdio::null())
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    if !out.status.success() {
        return None;
    }
    String::from_utf8_lossy(&out.stdout).trim().parse::<f64>().ok().filter(|d| d.is_finite() && *d > 0.0)
}

fn timestamps_for(duration: Option<f64>) -> [f64; FRAME_COUNT] {
    match duration {
        Some(duration) => {
            let cap = (duration - 0.05).max(0.0);
            [0.05, 0.25, 0.50, 0.75].map(|frac| (duration * frac).min(cap).max(0.0))
        }
        None => FALLBACK_TIMESTAMPS,
    }
}

async fn extract_frame(src: &Path, timestamp: f64, dest_png: &Path) -> Result<(), ApiError> {
    let run = |ts: f64, dest: &Path| {
        Command::new("ffmpeg")
            .arg("-v").arg("quiet")
            .arg("-ss").arg(format!("{ts:.3}"))
            .arg("-i").arg(src)
            .arg("-frames:v").arg("1")
            .arg("-an").arg("-sn").arg("-dn")
            .arg("-f").arg("image2")
            .arg("-y")
            .arg(dest)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
    };

    let first = tokio::time::timeout(EXTRACT_TIMEOUT, run(timestamp, dest_png)).await;
    let ok = matches!(first, Ok(Ok(status)) if status.success()) && tokio::fs::metadata(dest_png).await.is_ok();
    if ok {
        return Ok(());
    }
    if matches!(first, Err(_)) {
        warn!(?timestamp, "ffmpeg frame extraction timed out, retrying at t=0");
    }

    let retry = tokio::time::timeout(EXTRACT_TIMEOUT, run(0.0, dest_png)).await;
    match retry {
        Ok(Ok(status)) if status.success() && tokio::fs::metadata(dest_png).await.is_ok() => Ok(()),
        Err(_) => Err(ApiError::new(ErrorCode::FfmpegTimeout, "ffmpeg frame extraction timed out")),
        _ => Err(ApiError::new(ErrorCode::FfmpegFailed, "ffmpeg frame extraction failed")),
    }
}

async fn render_mosaic(src: &Path, dest: &Path, size: u32, quality: u8) -> Result<(), ApiError> {
    let duration = probe_duration_secs(src).await;
    let timestamps = timestamps_for(duration);

    let temp_dir = std::env::temp_dir();
    let batch_id: u64 = rand::rng().random();
    let mut frame_paths = Vec::with_capacity(FRAME_COUNT);
    for (idx, ts) in timestamps.iter().enumerate() {
        let frame_path = temp_dir.join(format!("entanglement-mosaic-{batch_id:x}-{idx}.png"));
        extract_frame(src, *ts, &frame_path).await?;
        frame_paths.push(frame_path);
    }

    let bytes_result = {
        let frame_paths_for_render = frame_paths.clone();
        tokio::task::spawn_blocking(move || {
            let refs: [&Path; FRAME_COUNT] = [
                frame_paths_for_render[0].as_path(),
                frame_paths_for_render[1].as_path(),
                frame_paths_for_render[2].as_path(),
                frame_paths_for_render[3].as_path(),
            ];
            common::render::render_mosaic_jpeg(&refs, size, quality)
        })
        .await
    };

    for frame_path in &frame_paths {
        let _ = tokio::fs::remove_file(frame_path).await;
    }

    let bytes = bytes_result
        .map_err(|err| ApiError::new(ErrorCode::VideoMosaicFailed, format!("render task panicked: {err}")))??;
    write_atomic(dest, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_use_percentages_of_duration() {
        let ts = timestamps_for(Some(100.0));
        assert_eq!(ts, [5.0, 25.0, 50.0, 75.0]);
    }

    #[test]
    fn timestamps_clamp_near_end_of_short_clips() {
        let ts = timestamps_for(Some(0.2));
        for t in ts {
            assert!(t <= 0.15);
        }
    }

    #[test]
    fn timestamps_fall_back_when_duration_unknown() {
        assert_eq!(timestamps_for(None), FALLBACK_TIMESTAMPS);
    }
}
