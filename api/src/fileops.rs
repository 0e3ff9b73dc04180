use serde::{Deserialize, Serialize};

/// on-disk `_trash/<token>/meta.json` -- version-tagged so a future format
/// change can be detected rather than silently misparsed
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrashEntryMeta {
    pub version: u32,
    pub archived_at_ms: i64,
    pub src_rel_path: String,
    pub dst_rel_path: String,
    pub payload_name: String,
    pub is_dir: bool,
    pub size_bytes: Option<u64>,
    pub mtime_ms: Option<i64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Delete,
    Move,
    Archive,
    Restore,
    Purge,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub id: String,
    pub ts_ms: i64,
    pub op: OpKind,
    pub src_rel_path: String,
    pub dst_rel_path: Option<String>,
    pub is_dir: bool,
    pub success: bool,
    pub error: Option<String>,
}

/// observed mutable state of a filesystem entry, bound into a confirm token
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileInfo {
    pub is_dir: bool,
    pub size_bytes: Option<u64>,
    pub mtime_ms: Option<i64>,
}

/// canonical payloads a confirm token is computed over -- field order does
/// not matter since serialization always sorts keys (see common::hash::canonical_json)
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ConfirmTokenPayload {
    Archive {
        src_rel_path: String,
        dst_rel_path: Option<String>,
        is_dir: bool,
        size_bytes: Option<u64>,
        mtime_ms: Option<i64>,
    },
    Purge {
        src_rel_path: String,
        dst_rel_path: Option<String>,
        is_dir: bool,
        size_bytes: Option<u64>,
        mtime_ms: Option<i64>,
    },
    Move {
        src_rel_path: String,
        dst_rel_path: String,
        is_dir: bool,
        size_bytes: Option<u64>,
        mtime_ms: Option<i64>,
        create_parents: bool,
    },
    Restore {
        src_rel_path: String,
        dst_rel_path: String,
        is_dir: bool,
        size_bytes: Option<u64>,
        mtime_ms: Option<i64>,
    },
    TrashEmpty {
        entries_sha1: String,
        count: usize,
        trash_mtime_ms: Option<i64>,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct MutationPreview<T: Serialize> {
    pub ok: bool,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_mode: Option<&'static str>,
    pub confirm_required: bool,
    pub preview: T,
    pub confirm_token: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct MutationResult {
    pub ok: bool,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_mode: Option<&'static str>,
    pub executed: bool,
    pub src_rel_path: String,
    pub dst_rel_path: Option<String>,
    pub log: OperationLogEntry,
}

/// preview payload shared by archive/purge/restore: the observed state of
/// the entry plus where it came from and where it is headed
#[derive(Clone, Debug, Serialize)]
pub struct PathStatePreview {
    pub src_rel_path: String,
    pub dst_rel_path: Option<String>,
    pub is_dir: bool,
    pub size_bytes: Option<u64>,
    pub mtime_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct MovePreview {
    pub src_rel_path: String,
    pub dst_rel_path: String,
    pub create_parents: bool,
    pub is_dir: bool,
    pub size_bytes: Option<u64>,
    pub mtime_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrashEmptyPreview {
    pub trash_rel_path: String,
    pub count: usize,
    pub retention_days: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrashEmptyResult {
    pub ok: bool,
    pub action: &'static str,
    pub executed: bool,
    pub removed: usize,
    pub log: OperationLogEntry,
}

/// what a two-phase fileops call returns: a preview carrying a confirm
/// token, or the executed mutation's result
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum MutationOutcome<P: Serialize> {
    Preview(MutationPreview<P>),
    Executed(MutationResult),
}

pub type DeleteOutcome = MutationOutcome<PathStatePreview>;
pub type MoveOutcome = MutationOutcome<MovePreview>;
pub type RestoreOutcome = MutationOutcome<PathStatePreview>;

/// trash_empty's preview/result shapes don't fit `MutationPreview`/
/// `MutationResult` (no single src/dst path, a `removed` count instead of
/// `executed`'s echo), so it gets its own outcome enum
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum TrashEmptyOutcome {
    Preview(MutationPreview<TrashEmptyPreview>),
    Executed(TrashEmptyResult),
}
