use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{arg, command, Parser};

use common::config::read_config;

use crate::cache::svc::CacheService;
use crate::fileops::svc::FileOpsService;
use crate::fs::svc::FsService;
use crate::http::AppState;
use crate::service::{EntanglementService, ESMRegistry};

mod cache;
mod fileops;
mod fs;
mod http;
mod service;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// config file
    #[arg(short, long, default_value = "/etc/mediaserver/config.json")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Arc::new(read_config(&PathBuf::from(cli.config)).await);

    let registry = ESMRegistry::new();

    let fs_service = FsService::create(config.clone(), &registry);
    let cache_service = CacheService::create(config.clone(), &registry);
    let fileops_service = FileOpsService::create(config.clone(), &registry);

    fs_service.start(&registry).await.context("failed to start fs service")?;
    cache_service.start(&registry).await.context("failed to start cache service")?;
    fileops_service
        .start(&registry)
        .await
        .context("failed to start fileops service")?;

    let state = Arc::new(AppState::new(config.clone(), registry)?);
    let app = http::router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(addr = %addr, media_root = ?config.media_root, "serving");
    axum::serve(listener, app).await.context("server exited")?;

    Ok(())
}
