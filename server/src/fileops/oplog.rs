use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use api::error::{ApiError, ErrorCode};
use api::fileops::{OpKind, OperationLogEntry};

/// append-only JSONL mutation log, one line per archive/purge/move/restore
/// attempt (successful or not). writes are serialized through a mutex since
/// multiple fileops calls can be in flight concurrently on the same file.
pub struct OpLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl OpLog {
    pub fn new(path: PathBuf) -> Self {
        OpLog {
            path,
            lock: Mutex::new(()),
        }
    }

    pub async fn record(
        &self,
        op: OpKind,
        src_rel_path: impl Into<String>,
        dst_rel_path: Option<String>,
        is_dir: bool,
        success: bool,
        error: Option<String>,
    ) -> Result<OperationLogEntry, ApiError> {
        let entry = OperationLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            ts_ms: now_ms(),
            op,
            src_rel_path: src_rel_path.into(),
            dst_rel_path,
            is_dir,
            success,
            error,
        };
        self.append(&entry).await?;
        Ok(entry)
    }

    async fn append(&self, entry: &OperationLogEntry) -> Result<(), ApiError> {
        let mut line = serde_json::to_vec(entry)
            .map_err(|err| ApiError::new(ErrorCode::FileopsFailed, format!("cannot serialize op-log entry: {err}")))?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| ApiError::new(ErrorCode::FileopsFailed, err.to_string()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| ApiError::new(ErrorCode::FileopsFailed, format!("cannot open op log: {err}")))?;
        file.write_all(&line)
            .await
            .map_err(|err| ApiError::new(ErrorCode::FileopsFailed, format!("cannot write op log: {err}")))?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_appends_one_jsonl_line_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let log = OpLog::new(dir.path().join("ops.jsonl"));

        log.record(OpKind::Archive, "a.jpg", Some("_trash/x/a.jpg".to_string()), false, true, None)
            .await
            .unwrap();
        log.record(OpKind::Move, "b.jpg", Some("c.jpg".to_string()), false, false, Some("boom".to_string()))
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(dir.path().join("ops.jsonl")).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["op"], "archive");
        assert_eq!(first["success"], true);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["error"], "boom");
    }
}
