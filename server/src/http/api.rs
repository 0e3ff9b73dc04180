use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_NONE_MATCH, LAST_MODIFIED},
        HeaderMap, HeaderValue, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use api::error::{ApiError, ErrorCode};
use api::fileops::{DeleteOutcome, MoveOutcome};
use api::index::{AlbumImagesResult, MediaIndex};

use crate::cache::msg::CacheMsg;
use crate::cache::thumb::WarmResult;
use crate::fileops::msg::FileOpsMsg;
use crate::fs::msg::FsMsg;
use crate::http::{AppError, AppState};
use crate::service::{ESMResp, ESMRegistry, ServiceType, ESM};

/// round-trips a message through the registry: look up the service's
/// sender, hand it a oneshot along with the message, and await the reply.
/// every http handler below goes through this instead of holding its own
/// reference to a service, the same separation of concerns the actor layer
/// gives the rest of the server.
async fn call<T, F>(registry: &ESMRegistry, service: ServiceType, make_msg: F) -> anyhow::Result<T>
where
    T: Send + Sync + 'static,
    F: FnOnce(ESMResp<T>) -> ESM,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    registry
        .get(&service)?
        .send(make_msg(tx))
        .await
        .map_err(|_| anyhow::anyhow!("{service:?} service channel closed"))?;
    rx.await.map_err(|_| anyhow::anyhow!("{service:?} service dropped its response"))?
}

pub(super) async fn not_found(uri: Uri) -> Response {
    let err = ApiError::new(ErrorCode::NotFound, format!("unknown endpoint: {}", uri.path()));
    AppError::from(err).into_response()
}

#[instrument(skip_all)]
pub(super) async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
pub struct RefreshQuery {
    #[serde(default)]
    refresh: Option<String>,
}

fn wants_refresh(query: &RefreshQuery) -> bool {
    match &query.refresh {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        None => false,
    }
}

async fn get_index(state: &AppState, refresh: bool) -> Result<MediaIndex, AppError> {
    Ok(call(&state.registry, ServiceType::Fs, |resp| {
        ESM::Fs(FsMsg::GetIndex { resp, refresh })
    })
    .await?)
}

#[instrument(skip(state))]
pub(super) async fn albums(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RefreshQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let index = get_index(&state, wants_refresh(&query)).await?;
    Ok(Json(json!({
        "media_root": index.media_root_abs,
        "scanned_at_ms": index.scanned_at_ms,
        "items": index.albums,
    })))
}

#[instrument(skip(state))]
pub(super) async fn scattered(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RefreshQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let index = get_index(&state, wants_refresh(&query)).await?;
    Ok(Json(json!({
        "media_root": index.media_root_abs,
        "scanned_at_ms": index.scanned_at_ms,
        "items": index.scattered_images,
    })))
}

#[instrument(skip(state))]
pub(super) async fn videos(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RefreshQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let index = get_index(&state, wants_refresh(&query)).await?;
    Ok(Json(json!({
        "media_root": index.media_root_abs,
        "scanned_at_ms": index.scanned_at_ms,
        "items": index.videos,
    })))
}

#[instrument(skip(state))]
pub(super) async fn others(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RefreshQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let index = get_index(&state, wants_refresh(&query)).await?;
    Ok(Json(json!({
        "media_root": index.media_root_abs,
        "scanned_at_ms": index.scanned_at_ms,
        "games": index.games,
        "others": index.others,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    path: String,
}

#[instrument(skip(state))]
pub(super) async fn album_images(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> Result<Json<AlbumImagesResult>, AppError> {
    let result = call(&state.registry, ServiceType::Fs, |resp| {
        ESM::Fs(FsMsg::AlbumImages {
            resp,
            album_rel: query.path,
        })
    })
    .await?;
    Ok(Json(result))
}

/// shared response builder for the three content-addressed derivative
/// endpoints: thumb/album-cover/video-mosaic all serve a JPEG keyed by the
/// fingerprint baked into the cache file's name, and all honor the same
/// conditional-GET contract.
async fn derivative_response(
    state: &AppState,
    headers: &HeaderMap,
    source_rel: &str,
    cache_path: PathBuf,
) -> Result<Response, AppError> {
    let hex = cache_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let etag = format!("\"{hex}\"");

    let mut resp_headers = HeaderMap::new();
    resp_headers.insert(ETAG, HeaderValue::from_str(&etag)?);
    resp_headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=0, must-revalidate"),
    );
    if let Some(modified) = source_mtime(state, source_rel).await {
        resp_headers.insert(LAST_MODIFIED, HeaderValue::from_str(&modified)?);
    }

    if let Some(candidate) = headers.get(IF_NONE_MATCH) {
        if candidate.to_str().ok() == Some(etag.as_str()) {
            return Ok((StatusCode::NOT_MODIFIED, resp_headers).into_response());
        }
    }

    let bytes = tokio::fs::read(&cache_path).await?;
    resp_headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
    Ok((StatusCode::OK, resp_headers, bytes).into_response())
}

async fn source_mtime(state: &AppState, source_rel: &str) -> Option<String> {
    let abs = state.sandbox.resolve(source_rel).ok()?;
    let meta = tokio::fs::metadata(&abs).await.ok()?;
    let modified = meta.modified().ok()?;
    let dt: chrono::DateTime<chrono::Utc> = modified.into();
    Some(dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

#[instrument(skip(state, headers))]
pub(super) async fn thumb(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> Result<Response, AppError> {
    let cache_path = call(&state.registry, ServiceType::Cache, |resp| {
        ESM::Cache(CacheMsg::EnsureThumb {
            resp,
            rel_path: query.path.clone(),
        })
    })
    .await?;
    derivative_response(&state, &headers, &query.path, cache_path).await
}

#[instrument(skip(state, headers))]
pub(super) async fn album_cover(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> Result<Response, AppError> {
    let cache_path = call(&state.registry, ServiceType::Cache, |resp| {
        ESM::Cache(CacheMsg::EnsureCover {
            resp,
            album_rel: query.path.clone(),
        })
    })
    .await?;
    derivative_response(&state, &headers, &query.path, cache_path).await
}

#[instrument(skip(state, headers))]
pub(super) async fn video_mosaic(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> Result<Response, AppError> {
    let cache_path = call(&state.registry, ServiceType::Cache, |resp| {
        ESM::Cache(CacheMsg::EnsureMosaic {
            resp,
            rel_path: query.path.clone(),
        })
    })
    .await?;
    derivative_response(&state, &headers, &query.path, cache_path).await
}

#[derive(Debug, Deserialize)]
pub struct DeleteBody {
    path: String,
    #[serde(default)]
    confirm: bool,
    #[serde(default)]
    confirm_token: Option<String>,
}

#[instrument(skip(state))]
pub(super) async fn delete(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeleteBody>,
) -> Result<Json<DeleteOutcome>, AppError> {
    let outcome = call(&state.registry, ServiceType::FileOps, |resp| {
        ESM::FileOps(FileOpsMsg::Delete {
            resp,
            path: body.path,
            confirm: body.confirm,
            confirm_token: body.confirm_token,
        })
    })
    .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct MoveBody {
    src: String,
    dst: String,
    #[serde(default)]
    create_parents: bool,
    #[serde(default)]
    confirm: bool,
    #[serde(default)]
    confirm_token: Option<String>,
}

#[instrument(skip(state))]
pub(super) async fn move_entry(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MoveBody>,
) -> Result<Json<MoveOutcome>, AppError> {
    let outcome = call(&state.registry, ServiceType::FileOps, |resp| {
        ESM::FileOps(FileOpsMsg::Move {
            resp,
            src: body.src,
            dst: body.dst,
            create_parents: body.create_parents,
            confirm: body.confirm,
            confirm_token: body.confirm_token,
        })
    })
    .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct WarmBody {
    paths: Vec<String>,
}

#[instrument(skip(state))]
pub(super) async fn warm_thumbs(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WarmBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let result: WarmResult = call(&state.registry, ServiceType::Cache, |resp| {
        ESM::Cache(CacheMsg::WarmThumbs {
            resp,
            rel_paths: body.paths,
        })
    })
    .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "ok": true,
            "accepted": result.accepted,
            "skipped_cached": result.skipped_cached,
            "rejected": result.rejected,
        })),
    ))
}
