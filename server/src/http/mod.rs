use std::sync::Arc;

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use regex::Regex;
use tower_http::set_header::SetResponseHeaderLayer;

use common::config::ServerConfig;
use common::sandbox::Sandbox;

use crate::service::ESMRegistry;

pub mod api;
pub mod error;
pub mod stream;

pub use error::AppError;

/// shared axum handler state. path resolution needs no actor round-trip (a
/// `Sandbox` is just a validated root path), everything else -- scanning,
/// caching, mutating -- goes through the registry.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: ESMRegistry,
    pub sandbox: Sandbox,
    pub range_regex: Regex,
}

impl AppState {
    pub fn new(config: Arc<ServerConfig>, registry: ESMRegistry) -> anyhow::Result<Self> {
        let sandbox = Sandbox::new(&config.media_root)?;
        let range_regex = Regex::new(r"(\d*)-(\d*)")?;
        Ok(AppState {
            config,
            registry,
            sandbox,
            range_regex,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(api::health))
        .route("/api/albums", get(api::albums))
        .route("/api/scattered", get(api::scattered))
        .route("/api/videos", get(api::videos))
        .route("/api/others", get(api::others))
        .route("/api/album-images", get(api::album_images))
        .route("/api/thumb", get(api::thumb))
        .route("/api/album-cover", get(api::album_cover))
        .route("/api/video-mosaic", get(api::video_mosaic))
        .route("/api/media", get(stream::stream_media))
        .route("/api/delete", post(api::delete))
        .route("/api/move", post(api::move_entry))
        .route("/api/thumbs/warm", post(api::warm_thumbs))
        .fallback(api::not_found)
        .layer(middleware::from_fn(cors_preflight))
        .layer(SetResponseHeaderLayer::if_not_present(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("access-control-allow-origin"),
            HeaderValue::from_static("*"),
        ))
        .with_state(state)
}

/// short-circuits every `OPTIONS` request with the CORS preflight response
/// the original server's `do_OPTIONS` sends, regardless of path.
async fn cors_preflight(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return (
            StatusCode::NO_CONTENT,
            [
                (
                    HeaderName::from_static("access-control-allow-methods"),
                    "GET, POST, OPTIONS",
                ),
                (
                    HeaderName::from_static("access-control-allow-headers"),
                    "Content-Type",
                ),
            ],
        )
            .into_response();
    }
    next.run(req).await
}
