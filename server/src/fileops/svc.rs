use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn, Level};

use api::error::{ApiError, ErrorCode};
use api::fileops::{
    ConfirmTokenPayload, DeleteOutcome, FileInfo, MoveOutcome, MovePreview, MutationOutcome,
    MutationPreview, MutationResult, OpKind, PathStatePreview, RestoreOutcome, TrashEmptyOutcome,
    TrashEmptyPreview, TrashEmptyResult, TrashEntryMeta,
};
use common::config::ServerConfig;
use common::sandbox::{normalize_rel_path, Sandbox};

use crate::fileops::msg::FileOpsMsg;
use crate::fileops::oplog::OpLog;
use crate::fileops::ESFileOpsService;
use crate::service::{ESInner, ESMReceiver, ESMRegistry, EntanglementService, ServiceType, ESM};

pub struct FileOpsService {
    config: Arc<ServerConfig>,
    receiver: Arc<Mutex<ESMReceiver>>,
}

#[async_trait]
impl EntanglementService for FileOpsService {
    type Inner = FileOpsState;

    fn create(config: Arc<ServerConfig>, registry: &ESMRegistry) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel::<ESM>(1024);
        registry
            .insert(ServiceType::FileOps, tx)
            .expect("failed to insert sender for fileops service");

        FileOpsService {
            config,
            receiver: Arc::new(Mutex::new(rx)),
        }
    }

    #[instrument(level = Level::DEBUG, skip(self, registry))]
    async fn start(&self, registry: &ESMRegistry) -> anyhow::Result<()> {
        info!("starting fileops service");

        let receiver = Arc::clone(&self.receiver);
        let state = Arc::new(FileOpsState::new(self.config.clone(), registry.clone())?);

        tokio::task::spawn(async move {
            let mut receiver = receiver.lock().await;
            while let Some(msg) = receiver.recv().await {
                let state = Arc::clone(&state);
                tokio::task::spawn(async move {
                    if let Err(err) = state.message_handler(msg).await {
                        error!(service = "fileops", error = %err, "message handler failed");
                    }
                });
            }
        });

        debug!("started fileops service");
        Ok(())
    }
}

pub struct FileOpsState {
    config: Arc<ServerConfig>,
    registry: ESMRegistry,
    sandbox: Sandbox,
    oplog: OpLog,
    last_cleanup: Mutex<Option<Instant>>,
}

#[async_trait]
impl ESInner for FileOpsState {
    fn new(config: Arc<ServerConfig>, registry: ESMRegistry) -> anyhow::Result<Self> {
        let sandbox = Sandbox::new(&config.media_root)?;
        let oplog = OpLog::new(config.op_log_path.clone());
        Ok(FileOpsState {
            config,
            registry,
            sandbox,
            oplog,
            last_cleanup: Mutex::new(None),
        })
    }

    fn registry(&self) -> ESMRegistry {
        self.registry.clone()
    }

    async fn message_handler(&self, esm: ESM) -> anyhow::Result<()> {
        match esm {
            ESM::FileOps(message) => match message {
                FileOpsMsg::Delete { resp, path, confirm, confirm_token } => {
                    self.respond(resp, self.delete(&path, confirm, confirm_token)).await
                }
                FileOpsMsg::Move { resp, src, dst, create_parents, confirm, confirm_token } => {
                    self.respond(
                        resp,
                        self.move_entry(&src, &dst, create_parents, confirm, confirm_token),
                    )
                    .await
                }
                FileOpsMsg::TrashRestore { resp, path, confirm, confirm_token } => {
                    self.respond(resp, self.trash_restore(&path, confirm, confirm_token)).await
                }
                FileOpsMsg::TrashEmpty { resp, confirm, confirm_token } => {
                    self.respond(resp, self.trash_empty(confirm, confirm_token)).await
                }
            },
            _ => Err(anyhow::Error::msg("fileops service received a message for another service")),
        }
    }
}

#[async_trait]
impl ESFileOpsService for FileOpsState {
    #[instrument(skip(self, confirm_token))]
    async fn delete(
        &self,
        rel_path: &str,
        confirm: bool,
        confirm_token: Option<String>,
    ) -> anyhow::Result<DeleteOutcome> {
        let rel_path = normalize_rel_path(rel_path)?;
        if rel_path.is_empty() {
            return Err(ApiError::new(ErrorCode::RootForbidden, "refusing to delete MediaRoot root").into());
        }
        if rel_path == api::TRASH_DIR_NAME {
            return Err(ApiError::new(
                ErrorCode::TrashRootForbidden,
                "refusing to delete trash root (use trash_empty instead)",
            )
            .into());
        }

        self.maybe_cleanup_trash(false).await;

        let trash_prefix = format!("{}/", api::TRASH_DIR_NAME);
        if rel_path.starts_with(&trash_prefix) {
            Ok(self.purge_from_trash(&rel_path, confirm, confirm_token).await?)
        } else {
            Ok(self.archive_to_trash(&rel_path, confirm, confirm_token).await?)
        }
    }

    #[instrument(skip(self, confirm_token))]
    async fn move_entry(
        &self,
        src_rel_path: &str,
        dst_rel_path: &str,
        create_parents: bool,
        confirm: bool,
        confirm_token: Option<String>,
    ) -> anyhow::Result<MoveOutcome> {
        let src = normalize_rel_path(src_rel_path)?;
        let dst = normalize_rel_path(dst_rel_path)?;
        if src.is_empty() || dst.is_empty() {
            return Err(ApiError::new(ErrorCode::InvalidPath, "src/dst must not be MediaRoot root").into());
        }

        let abs_src = self.sandbox.resolve(&src)?;
        let src_info = file_info(&abs_src).await?;

        let (dst_parent_rel, dst_name) = split_parent(&dst);
        if dst_name.is_empty() {
            return Err(ApiError::new(ErrorCode::InvalidPath, "dst must not be a directory path").into());
        }

        if src_info.is_dir {
            let abs_dst_candidate = join_rel(self.sandbox.media_root(), &dst);
            if abs_dst_candidate != abs_src && abs_dst_candidate.starts_with(&abs_src) {
                return Err(ApiError::new(
                    ErrorCode::InvalidMove,
                    "refusing to move a directory into itself",
                )
                .into());
            }
        }

        let dst_parent_abs_candidate = self.sandbox.resolve_allow_missing(&dst_parent_rel)?;
        if !dst_parent_rel.is_empty() {
            match tokio::fs::metadata(&dst_parent_abs_candidate).await {
                Ok(meta) if !meta.is_dir() => {
                    return Err(ApiError::new(
                        ErrorCode::DstParentNotDir,
                        "destination parent is not a directory",
                    )
                    .into());
                }
                Ok(_) => {}
                Err(_) if !create_parents => {
                    return Err(ApiError::new(
                        ErrorCode::DstParentMissing,
                        "destination parent directory does not exist (set create_parents=true to create it)",
                    )
                    .into());
                }
                Err(_) => {}
            }
        }

        let abs_dst_candidate = dst_parent_abs_candidate.join(&dst_name);
        if tokio::fs::metadata(&abs_dst_candidate).await.is_ok() {
            return Err(ApiError::new(ErrorCode::DstExists, "destination already exists").into());
        }

        let payload = ConfirmTokenPayload::Move {
            src_rel_path: src.clone(),
            dst_rel_path: dst.clone(),
            is_dir: src_info.is_dir,
            size_bytes: src_info.size_bytes,
            mtime_ms: src_info.mtime_ms,
            create_parents,
        };
        let expected_token = common::hash::confirm_token(&self.config.confirm_secret, &payload)?;

        if !confirm {
            return Ok(MutationOutcome::Preview(MutationPreview {
                ok: true,
                action: "move",
                delete_mode: None,
                confirm_required: true,
                preview: MovePreview {
                    src_rel_path: src,
                    dst_rel_path: dst,
                    create_parents,
                    is_dir: src_info.is_dir,
                    size_bytes: src_info.size_bytes,
                    mtime_ms: src_info.mtime_ms,
                },
                confirm_token: expected_token,
            }));
        }
        check_confirm_token(&self.config.confirm_secret, &payload, confirm_token.as_deref())?;

        if create_parents && !dst_parent_rel.is_empty() {
            tokio::fs::create_dir_all(&dst_parent_abs_candidate)
                .await
                .map_err(|err| ApiError::new(ErrorCode::MoveFailed, err.to_string()))?;
        }
        let dst_parent_abs_checked = if dst_parent_rel.is_empty() {
            self.sandbox.media_root().to_path_buf()
        } else {
            self.sandbox.resolve(&dst_parent_rel)?
        };
        let abs_dst = dst_parent_abs_checked.join(&dst_name);
        if tokio::fs::metadata(&abs_dst).await.is_ok() {
            return Err(ApiError::new(ErrorCode::DstExists, "destination already exists").into());
        }

        if let Err(err) = rename_or_copy(abs_src, abs_dst, src_info.is_dir).await {
            self.oplog
                .record(OpKind::Move, src.clone(), Some(dst.clone()), src_info.is_dir, false, Some(err.to_string()))
                .await
                .ok();
            return Err(ApiError::new(ErrorCode::MoveFailed, err.to_string()).into());
        }

        let log_entry = self
            .oplog
            .record(OpKind::Move, src.clone(), Some(dst.clone()), src_info.is_dir, true, None)
            .await?;
        Ok(MutationOutcome::Executed(MutationResult {
            ok: true,
            action: "move",
            delete_mode: None,
            executed: true,
            src_rel_path: src,
            dst_rel_path: Some(dst),
            log: log_entry,
        }))
    }

    #[instrument(skip(self, confirm_token))]
    async fn trash_restore(
        &self,
        rel_path: &str,
        confirm: bool,
        confirm_token: Option<String>,
    ) -> anyhow::Result<RestoreOutcome> {
        let rel_path = normalize_rel_path(rel_path)?;
        if rel_path.is_empty() {
            return Err(ApiError::new(ErrorCode::InvalidPath, "path must not be MediaRoot root").into());
        }
        if rel_path == api::TRASH_DIR_NAME {
            return Err(ApiError::new(ErrorCode::TrashRootForbidden, "refusing to restore trash root").into());
        }
        let trash_prefix = format!("{}/", api::TRASH_DIR_NAME);
        if !rel_path.starts_with(&trash_prefix) {
            return Err(ApiError::new(ErrorCode::NotInTrash, "path must be inside MediaRoot/_trash").into());
        }

        self.maybe_cleanup_trash(false).await;

        let parts: Vec<&str> = rel_path.split('/').collect();
        if parts.len() < 2 || parts[1].is_empty() {
            return Err(ApiError::new(ErrorCode::InvalidPath, "invalid trash path").into());
        }
        let entry_dir_rel = format!("{}/{}", parts[0], parts[1]);
        let entry_dir_abs = self.sandbox.resolve(&entry_dir_rel)?;
        let entry_is_dir = tokio::fs::metadata(&entry_dir_abs).await.map(|m| m.is_dir()).unwrap_or(false);
        if !entry_is_dir {
            return Err(ApiError::new(ErrorCode::TrashEntryNotDir, "trash entry is not a directory").into());
        }

        let meta = read_trash_meta(&entry_dir_abs).await?;
        if meta.src_rel_path.is_empty() {
            return Err(ApiError::new(ErrorCode::TrashMetaInvalid, "trash metadata missing src_rel_path").into());
        }
        if meta.payload_name.is_empty() {
            return Err(ApiError::new(ErrorCode::TrashMetaInvalid, "trash metadata missing payload_name").into());
        }
        let normalized_src = normalize_rel_path(&meta.src_rel_path)?;
        if normalized_src.starts_with(&trash_prefix) {
            return Err(ApiError::new(
                ErrorCode::TrashMetaInvalid,
                "trash metadata src_rel_path points into _trash",
            )
            .into());
        }

        let payload_abs = entry_dir_abs.join(&meta.payload_name);
        let payload_rel = format!("{entry_dir_rel}/{}", meta.payload_name);
        let info = file_info(&payload_abs).await?;

        let dst_rel_path = normalized_src;
        let (dst_parent_rel, dst_name) = split_parent(&dst_rel_path);
        if dst_name.is_empty() {
            return Err(ApiError::new(ErrorCode::InvalidPath, "invalid restore destination path").into());
        }

        let dst_parent_abs = self.sandbox.resolve_allow_missing(&dst_parent_rel)?;
        let abs_dst_candidate = if dst_parent_rel.is_empty() {
            self.sandbox.media_root().to_path_buf()
        } else {
            dst_parent_abs.clone()
        }
        .join(&dst_name);
        if tokio::fs::metadata(&abs_dst_candidate).await.is_ok() {
            return Err(ApiError::new(ErrorCode::DstExists, "restore destination already exists").into());
        }

        let payload = ConfirmTokenPayload::Restore {
            src_rel_path: payload_rel.clone(),
            dst_rel_path: dst_rel_path.clone(),
            is_dir: info.is_dir,
            size_bytes: info.size_bytes,
            mtime_ms: info.mtime_ms,
        };
        let expected_token = common::hash::confirm_token(&self.config.confirm_secret, &payload)?;

        if !confirm {
            return Ok(MutationOutcome::Preview(MutationPreview {
                ok: true,
                action: "restore",
                delete_mode: None,
                confirm_required: true,
                preview: PathStatePreview {
                    src_rel_path: payload_rel,
                    dst_rel_path: Some(dst_rel_path),
                    is_dir: info.is_dir,
                    size_bytes: info.size_bytes,
                    mtime_ms: info.mtime_ms,
                },
                confirm_token: expected_token,
            }));
        }
        check_confirm_token(&self.config.confirm_secret, &payload, confirm_token.as_deref())?;

        if !dst_parent_rel.is_empty() {
            tokio::fs::create_dir_all(&dst_parent_abs)
                .await
                .map_err(|err| ApiError::new(ErrorCode::RestoreFailed, err.to_string()))?;
        }
        let dst_parent_abs_checked = if dst_parent_rel.is_empty() {
            self.sandbox.media_root().to_path_buf()
        } else {
            self.sandbox.resolve(&dst_parent_rel)?
        };
        let abs_dst = dst_parent_abs_checked.join(&dst_name);
        if tokio::fs::metadata(&abs_dst).await.is_ok() {
            return Err(ApiError::new(ErrorCode::DstExists, "restore destination already exists").into());
        }

        if let Err(err) = rename_or_copy(payload_abs, abs_dst, info.is_dir).await {
            self.oplog
                .record(OpKind::Restore, payload_rel.clone(), Some(dst_rel_path.clone()), info.is_dir, false, Some(err.to_string()))
                .await
                .ok();
            return Err(ApiError::new(ErrorCode::RestoreFailed, err.to_string()).into());
        }

        let _ = tokio::fs::remove_file(entry_dir_abs.join(api::TRASH_META_FILENAME)).await;
        let _ = tokio::fs::remove_dir(&entry_dir_abs).await;

        let log_entry = self
            .oplog
            .record(OpKind::Restore, payload_rel.clone(), Some(dst_rel_path.clone()), info.is_dir, true, None)
            .await?;
        Ok(MutationOutcome::Executed(MutationResult {
            ok: true,
            action: "restore",
            delete_mode: None,
            executed: true,
            src_rel_path: payload_rel,
            dst_rel_path: Some(dst_rel_path),
            log: log_entry,
        }))
    }

    #[instrument(skip(self, confirm_token))]
    async fn trash_empty(
        &self,
        confirm: bool,
        confirm_token: Option<String>,
    ) -> anyhow::Result<TrashEmptyOutcome> {
        self.maybe_cleanup_trash(false).await;
        let trash_abs = self.ensure_trash_dir().await?;

        let mut entries = list_entry_names(&trash_abs).await?;
        entries.sort();

        let trash_mtime_ms = tokio::fs::metadata(&trash_abs)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64);

        let entries_sha1 = common::hash::sha1_hex(entries.join("\n").as_bytes());
        let payload = ConfirmTokenPayload::TrashEmpty {
            entries_sha1,
            count: entries.len(),
            trash_mtime_ms,
        };
        let expected_token = common::hash::confirm_token(&self.config.confirm_secret, &payload)?;

        if !confirm {
            return Ok(TrashEmptyOutcome::Preview(MutationPreview {
                ok: true,
                action: "trash_empty",
                delete_mode: None,
                confirm_required: true,
                preview: TrashEmptyPreview {
                    trash_rel_path: api::TRASH_DIR_NAME.to_string(),
                    count: entries.len(),
                    retention_days: self.config.trash_retention_days,
                },
                confirm_token: expected_token,
            }));
        }
        check_confirm_token(&self.config.confirm_secret, &payload, confirm_token.as_deref())?;

        let mut removed = 0usize;
        let mut first_error: Option<String> = None;
        for name in &entries {
            let abs_entry = trash_abs.join(name);
            match safe_remove_path(&abs_entry).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    first_error = Some(err.to_string());
                    break;
                }
            }
        }

        if let Some(err) = first_error {
            self.oplog
                .record(OpKind::Purge, api::TRASH_DIR_NAME, None, true, false, Some(err.clone()))
                .await
                .ok();
            return Err(ApiError::new(ErrorCode::TrashEmptyFailed, err).into());
        }

        let log_entry = self
            .oplog
            .record(OpKind::Purge, api::TRASH_DIR_NAME, None, true, true, None)
            .await?;
        Ok(TrashEmptyOutcome::Executed(TrashEmptyResult {
            ok: true,
            action: "trash_empty",
            executed: true,
            removed,
            log: log_entry,
        }))
    }
}

impl FileOpsState {
    async fn archive_to_trash(
        &self,
        rel_path: &str,
        confirm: bool,
        confirm_token: Option<String>,
    ) -> Result<DeleteOutcome, ApiError> {
        let abs_path = self.sandbox.resolve(rel_path)?;
        let info = file_info(&abs_path).await?;

        let payload = ConfirmTokenPayload::Archive {
            src_rel_path: rel_path.to_string(),
            dst_rel_path: None,
            is_dir: info.is_dir,
            size_bytes: info.size_bytes,
            mtime_ms: info.mtime_ms,
        };
        let expected_token = common::hash::confirm_token(&self.config.confirm_secret, &payload)?;
        let base_name = rel_path.rsplit('/').next().unwrap_or(rel_path).to_string();
        let trash_entry_rel = format!("{}/{}", api::TRASH_DIR_NAME, expected_token);
        let dst_rel_path = format!("{trash_entry_rel}/{base_name}");

        if !confirm {
            return Ok(MutationOutcome::Preview(MutationPreview {
                ok: true,
                action: "delete",
                delete_mode: Some("archive"),
                confirm_required: true,
                preview: PathStatePreview {
                    src_rel_path: rel_path.to_string(),
                    dst_rel_path: Some(dst_rel_path),
                    is_dir: info.is_dir,
                    size_bytes: info.size_bytes,
                    mtime_ms: info.mtime_ms,
                },
                confirm_token: expected_token,
            }));
        }
        check_confirm_token(&self.config.confirm_secret, &payload, confirm_token.as_deref())?;

        self.ensure_trash_dir().await?;
        let entry_dir_abs = self.sandbox.resolve_allow_missing(&trash_entry_rel)?;
        if tokio::fs::metadata(&entry_dir_abs).await.is_ok() {
            return Err(ApiError::new(
                ErrorCode::TrashEntryExists,
                "trash entry already exists; retry delete preview",
            ));
        }
        tokio::fs::create_dir_all(&entry_dir_abs)
            .await
            .map_err(|err| ApiError::new(ErrorCode::TrashCreateFailed, format!("cannot create trash entry: {err}")))?;

        let abs_dst = entry_dir_abs.join(&base_name);
        let meta = TrashEntryMeta {
            version: 1,
            archived_at_ms: now_ms(),
            src_rel_path: rel_path.to_string(),
            dst_rel_path: dst_rel_path.clone(),
            payload_name: base_name,
            is_dir: info.is_dir,
            size_bytes: info.size_bytes,
            mtime_ms: info.mtime_ms,
        };

        if let Err(err) = tokio::fs::rename(&abs_path, &abs_dst).await {
            let _ = tokio::fs::remove_dir_all(&entry_dir_abs).await;
            self.oplog
                .record(OpKind::Archive, rel_path.to_string(), Some(dst_rel_path.clone()), info.is_dir, false, Some(err.to_string()))
                .await
                .ok();
            return Err(ApiError::new(ErrorCode::ArchiveFailed, err.to_string()));
        }

        if let Err(err) = write_json_file(&entry_dir_abs.join(api::TRASH_META_FILENAME), &meta).await {
            let _ = tokio::fs::remove_dir_all(&entry_dir_abs).await;
            self.oplog
                .record(OpKind::Archive, rel_path.to_string(), Some(dst_rel_path.clone()), info.is_dir, false, Some(err.message.clone()))
                .await
                .ok();
            return Err(err);
        }

        let log_entry = self
            .oplog
            .record(OpKind::Archive, rel_path.to_string(), Some(dst_rel_path.clone()), info.is_dir, true, None)
            .await?;

        Ok(MutationOutcome::Executed(MutationResult {
            ok: true,
            action: "delete",
            delete_mode: Some("archive"),
            executed: true,
            src_rel_path: rel_path.to_string(),
            dst_rel_path: Some(dst_rel_path),
            log: log_entry,
        }))
    }

    async fn purge_from_trash(
        &self,
        rel_path: &str,
        confirm: bool,
        confirm_token: Option<String>,
    ) -> Result<DeleteOutcome, ApiError> {
        let abs_path = self.sandbox.resolve(rel_path)?;
        let info = file_info(&abs_path).await?;

        let payload = ConfirmTokenPayload::Purge {
            src_rel_path: rel_path.to_string(),
            dst_rel_path: None,
            is_dir: info.is_dir,
            size_bytes: info.size_bytes,
            mtime_ms: info.mtime_ms,
        };
        let expected_token = common::hash::confirm_token(&self.config.confirm_secret, &payload)?;

        if !confirm {
            return Ok(MutationOutcome::Preview(MutationPreview {
                ok: true,
                action: "delete",
                delete_mode: Some("purge"),
                confirm_required: true,
                preview: PathStatePreview {
                    src_rel_path: rel_path.to_string(),
                    dst_rel_path: None,
                    is_dir: info.is_dir,
                    size_bytes: info.size_bytes,
                    mtime_ms: info.mtime_ms,
                },
                confirm_token: expected_token,
            }));
        }
        check_confirm_token(&self.config.confirm_secret, &payload, confirm_token.as_deref())?;

        let remove_result = if info.is_dir {
            tokio::fs::remove_dir_all(&abs_path).await
        } else {
            tokio::fs::remove_file(&abs_path).await
        };
        if let Err(err) = remove_result {
            self.oplog
                .record(OpKind::Purge, rel_path.to_string(), None, info.is_dir, false, Some(err.to_string()))
                .await
                .ok();
            return Err(ApiError::new(ErrorCode::PurgeFailed, err.to_string()));
        }

        let log_entry = self
            .oplog
            .record(OpKind::Purge, rel_path.to_string(), None, info.is_dir, true, None)
            .await?;
        Ok(MutationOutcome::Executed(MutationResult {
            ok: true,
            action: "delete",
            delete_mode: Some("purge"),
            executed: true,
            src_rel_path: rel_path.to_string(),
            dst_rel_path: None,
            log: log_entry,
        }))
    }

    async fn ensure_trash_dir(&self) -> Result<PathBuf, ApiError> {
        let candidate = self.sandbox.media_root().join(api::TRASH_DIR_NAME);
        if tokio::fs::metadata(&candidate).await.is_ok() {
            let checked = self.sandbox.resolve(api::TRASH_DIR_NAME)?;
            let meta = tokio::fs::metadata(&checked)
                .await
                .map_err(|err| ApiError::new(ErrorCode::TrashCreateFailed, err.to_string()))?;
            if !meta.is_dir() {
                return Err(ApiError::new(
                    ErrorCode::TrashEntryNotDir,
                    format!("{} exists but is not a directory", api::TRASH_DIR_NAME),
                ));
            }
            return Ok(checked);
        }
        tokio::fs::create_dir_all(&candidate)
            .await
            .map_err(|err| ApiError::new(ErrorCode::TrashCreateFailed, format!("failed to create {}: {err}", api::TRASH_DIR_NAME)))?;
        self.sandbox.resolve(api::TRASH_DIR_NAME)
    }

    async fn maybe_cleanup_trash(&self, force: bool) {
        let now = Instant::now();
        {
            let mut last = self.last_cleanup.lock().await;
            if !force {
                if let Some(prev) = *last {
                    if now.duration_since(prev) < Duration::from_secs(self.config.trash_cleanup_throttle_sec) {
                        return;
                    }
                }
            }
            *last = Some(now);
        }
        if let Err(err) = self.cleanup_trash(self.config.trash_retention_days).await {
            warn!(error = %err, "trash cleanup failed");
        }
    }

    /// best-effort expiry of trash entries older than `retention_days`,
    /// folded into the request path rather than run as a standalone task
    async fn cleanup_trash(&self, retention_days: u64) -> Result<(), ApiError> {
        let retention_ms = retention_days as i64 * 24 * 60 * 60 * 1000;
        let now_ms = now_ms();
        let trash_abs = self.ensure_trash_dir().await?;

        let mut read_dir = match tokio::fs::read_dir(&trash_abs).await {
            Ok(rd) => rd,
            Err(_) => return Ok(()),
        };

        while let Some(entry) = read_dir.next_entry().await.ok().flatten() {
            let path = entry.path();
            let meta = match tokio::fs::symlink_metadata(&path).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            let entry_mtime_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(now_ms);

            let is_dir = meta.is_dir() && !meta.is_symlink();
            let mut archived_at_ms = entry_mtime_ms;
            let mut dst_rel_path_hint: Option<String> = None;
            if is_dir {
                if let Ok(entry_meta) = read_trash_meta(&path).await {
                    archived_at_ms = entry_meta.archived_at_ms;
                    if !entry_meta.dst_rel_path.is_empty() {
                        dst_rel_path_hint = Some(entry_meta.dst_rel_path);
                    }
                }
            }

            if now_ms - archived_at_ms <= retention_ms {
                continue;
            }

            let entry_name = entry.file_name().to_string_lossy().to_string();
            let entry_rel_path = format!("{}/{}", api::TRASH_DIR_NAME, entry_name);
            let log_src = dst_rel_path_hint.unwrap_or_else(|| entry_rel_path.clone());

            match safe_remove_path(&path).await {
                Ok(()) => {
                    self.oplog.record(OpKind::Purge, log_src, None, is_dir, true, None).await.ok();
                }
                Err(err) => {
                    self.oplog
                        .record(OpKind::Purge, entry_rel_path, None, is_dir, false, Some(err.to_string()))
                        .await
                        .ok();
                }
            }
        }
        Ok(())
    }
}

fn join_rel(root: &Path, rel: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for seg in rel.split('/').filter(|s| !s.is_empty()) {
        out.push(seg);
    }
    out
}

fn split_parent(rel_path: &str) -> (String, String) {
    match rel_path.rfind('/') {
        Some(idx) => (rel_path[..idx].to_string(), rel_path[idx + 1..].to_string()),
        None => (String::new(), rel_path.to_string()),
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

async fn file_info(abs_path: &Path) -> Result<FileInfo, ApiError> {
    let meta = tokio::fs::symlink_metadata(abs_path)
        .await
        .map_err(|err| ApiError::new(ErrorCode::StatFailed, format!("cannot stat path: {err}")))?;
    let is_dir = meta.is_dir();
    let size_bytes = if is_dir { None } else { Some(meta.len()) };
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64);
    Ok(FileInfo { is_dir, size_bytes, mtime_ms })
}

/// unlinks a symlink in place, otherwise removes a directory tree or a
/// single file -- mirrors the python implementation's special-casing of
/// reparse points so a malicious trash entry can't trick cleanup into
/// following it
async fn safe_remove_path(abs_path: &Path) -> std::io::Result<()> {
    let meta = tokio::fs::symlink_metadata(abs_path).await?;
    if meta.is_symlink() {
        return tokio::fs::remove_file(abs_path).await;
    }
    if meta.is_dir() {
        tokio::fs::remove_dir_all(abs_path).await
    } else {
        tokio::fs::remove_file(abs_path).await
    }
}

async fn list_entry_names(dir: &Path) -> Result<Vec<String>, ApiError> {
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(_) => return Ok(Vec::new()),
    };
    let mut names = Vec::new();
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|err| ApiError::new(ErrorCode::TrashListFailed, err.to_string()))?
    {
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    Ok(names)
}

async fn read_trash_meta(entry_dir_abs: &Path) -> Result<TrashEntryMeta, ApiError> {
    let meta_path = entry_dir_abs.join(api::TRASH_META_FILENAME);
    let raw = tokio::fs::read_to_string(&meta_path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ApiError::new(ErrorCode::TrashMetaMissing, "trash entry metadata is missing")
        } else {
            ApiError::new(ErrorCode::TrashMetaReadFailed, format!("cannot read trash metadata: {err}"))
        }
    })?;
    serde_json::from_str(&raw)
        .map_err(|err| ApiError::new(ErrorCode::TrashMetaInvalid, format!("invalid trash metadata JSON: {err}")))
}

async fn write_json_file(path: &Path, data: &TrashEntryMeta) -> Result<(), ApiError> {
    let body = serde_json::to_vec_pretty(data)
        .map_err(|err| ApiError::new(ErrorCode::TrashCreateFailed, err.to_string()))?;
    tokio::fs::write(path, body)
        .await
        .map_err(|err| ApiError::new(ErrorCode::TrashCreateFailed, err.to_string()))
}

fn check_confirm_token<T: serde::Serialize>(
    secret: &[u8],
    payload: &T,
    token: Option<&str>,
) -> Result<(), ApiError> {
    let token = match token {
        Some(t) if !t.is_empty() => t,
        _ => {
            return Err(ApiError::new(
                ErrorCode::ConfirmTokenRequired,
                "missing 'confirm_token' for confirmed operation",
            ));
        }
    };
    if common::hash::verify_confirm_token(secret, payload, token)? {
        Ok(())
    } else {
        Err(ApiError::new(
            ErrorCode::StaleConfirmToken,
            "confirm_token does not match current state; re-fetch preview and confirm again",
        ))
    }
}

/// renames `src` to `dst`, falling back to a copy-then-remove when the two
/// paths don't share a filesystem (rename returns EXDEV in that case)
async fn rename_or_copy(src: PathBuf, dst: PathBuf, is_dir: bool) -> std::io::Result<()> {
    if tokio::fs::rename(&src, &dst).await.is_ok() {
        return Ok(());
    }
    if is_dir {
        tokio::task::spawn_blocking(move || {
            copy_dir_recursive(&src, &dst)?;
            std::fs::remove_dir_all(&src)
        })
        .await
        .unwrap_or_else(|err| Err(std::io::Error::other(err)))
    } else {
        tokio::fs::copy(&src, &dst).await?;
        tokio::fs::remove_file(&src).await
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry.path().strip_prefix(src).map_err(std::io::Error::other)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(media_root: PathBuf) -> ServerConfig {
        ServerConfig {
            media_root,
            host: "127.0.0.1".to_string(),
            port: 0,
            cache_root: PathBuf::from("cache"),
            op_log_path: PathBuf::from("ops.jsonl"),
            media_types_path: None,
            confirm_secret: b"test-secret".to_vec(),
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

    fn state(media_root: PathBuf, op_log_path: PathBuf) -> FileOpsState {
        let mut config = test_config(media_root);
        config.op_log_path = op_log_path;
        let config = Arc::new(config);
        let registry = ESMRegistry::new();
        FileOpsState::new(config, registry).unwrap()
    }

    #[tokio::test]
    async fn delete_without_confirm_returns_preview() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.jpg"), b"x").await.unwrap();
        let oplog_path = dir.path().join("ops.jsonl");
        let st = state(dir.path().to_path_buf(), oplog_path);

        let outcome = st.delete("a.jpg", false, None).await.unwrap();
        match outcome {
            MutationOutcome::Preview(preview) => {
                assert!(preview.confirm_required);
                assert_eq!(preview.delete_mode, Some("archive"));
                assert_eq!(preview.preview.src_rel_path, "a.jpg");
            }
            MutationOutcome::Executed(_) => panic!("expected preview"),
        }
    }

    #[tokio::test]
    async fn delete_confirm_archives_into_trash() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.jpg"), b"x").await.unwrap();
        let oplog_path = dir.path().join("ops.jsonl");
        let st = state(dir.path().to_path_buf(), oplog_path);

        let preview = match st.delete("a.jpg", false, None).await.unwrap() {
            MutationOutcome::Preview(p) => p,
            _ => panic!("expected preview"),
        };
        let outcome = st
            .delete("a.jpg", true, Some(preview.confirm_token.clone()))
            .await
            .unwrap();
        match outcome {
            MutationOutcome::Executed(result) => {
                assert!(result.executed);
                assert!(result.dst_rel_path.unwrap().starts_with("_trash/"));
            }
            MutationOutcome::Preview(_) => panic!("expected execution"),
        }
        assert!(!dir.path().join("a.jpg").exists());
    }

    #[tokio::test]
    async fn delete_confirm_with_stale_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.jpg"), b"x").await.unwrap();
        let oplog_path = dir.path().join("ops.jsonl");
        let st = state(dir.path().to_path_buf(), oplog_path);

        let err = st.delete("a.jpg", true, Some("bogus".to_string())).await.unwrap_err();
        let api_err = err.downcast::<ApiError>().unwrap();
        assert_eq!(api_err.code, ErrorCode::StaleConfirmToken);
    }

    #[tokio::test]
    async fn delete_root_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let oplog_path = dir.path().join("ops.jsonl");
        let st = state(dir.path().to_path_buf(), oplog_path);

        let err = st.delete("", false, None).await.unwrap_err();
        let api_err = err.downcast::<ApiError>().unwrap();
        assert_eq!(api_err.code, ErrorCode::RootForbidden);
    }

    #[tokio::test]
    async fn move_entry_rejects_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.jpg"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("b.jpg"), b"y").await.unwrap();
        let oplog_path = dir.path().join("ops.jsonl");
        let st = state(dir.path().to_path_buf(), oplog_path);

        let err = st.move_entry("a.jpg", "b.jpg", false, false, None).await.unwrap_err();
        let api_err = err.downcast::<ApiError>().unwrap();
        assert_eq!(api_err.code, ErrorCode::DstExists);
    }

    #[tokio::test]
    async fn move_entry_confirm_renames_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.jpg"), b"x").await.unwrap();
        let oplog_path = dir.path().join("ops.jsonl");
        let st = state(dir.path().to_path_buf(), oplog_path);

        let preview = match st.move_entry("a.jpg", "b.jpg", false, false, None).await.unwrap() {
            MutationOutcome::Preview(p) => p,
            _ => panic!("expected preview"),
        };
        let outcome = st
            .move_entry("a.jpg", "b.jpg", false, true, Some(preview.confirm_token))
            .await
            .unwrap();
        assert!(matches!(outcome, MutationOutcome::Executed(_)));
        assert!(dir.path().join("b.jpg").exists());
        assert!(!dir.path().join("a.jpg").exists());
    }

    #[tokio::test]
    async fn trash_empty_removes_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.jpg"), b"x").await.unwrap();
        let oplog_path = dir.path().join("ops.jsonl");
        let st = state(dir.path().to_path_buf(), oplog_path);

        let preview = match st.delete("a.jpg", false, None).await.unwrap() {
            MutationOutcome::Preview(p) => p,
            _ => panic!("expected preview"),
        };
        st.delete("a.jpg", true, Some(preview.confirm_token)).await.unwrap();

        let empty_preview = match st.trash_empty(false, None).await.unwrap() {
            TrashEmptyOutcome::Preview(p) => p,
            _ => panic!("expected preview"),
        };
        assert_eq!(empty_preview.preview.count, 1);

        let result = st.trash_empty(true, Some(empty_preview.confirm_token)).await.unwrap();
        match result {
            TrashEmptyOutcome::Executed(r) => assert_eq!(r.removed, 1),
            TrashEmptyOutcome::Preview(_) => panic!("expected execution"),
        }
    }

    #[tokio::test]
    async fn trash_restore_recreates_original_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.jpg"), b"hello").await.unwrap();
        let oplog_path = dir.path().join("ops.jsonl");
        let st = state(dir.path().to_path_buf(), oplog_path);

        let preview = match st.delete("a.jpg", false, None).await.unwrap() {
            MutationOutcome::Preview(p) => p,
            _ => panic!("expected preview"),
        };
        let archived = match st.delete("a.jpg", true, Some(preview.confirm_token)).await.unwrap() {
            MutationOutcome::Executed(r) => r,
            _ => panic!("expected execution"),
        };
        let trash_path = archived.dst_rel_path.unwrap();

        let restore_preview = match st.trash_restore(&trash_path, false, None).await.unwrap() {
            MutationOutcome::Preview(p) => p,
            _ => panic!("expected preview"),
        };
        let restored = st
            .trash_restore(&trash_path, true, Some(restore_preview.confirm_token))
            .await
            .unwrap();
        assert!(matches!(restored, MutationOutcome::Executed(_)));
        assert_eq!(tokio::fs::read_to_string(dir.path().join("a.jpg")).await.unwrap(), "hello");
    }
}
