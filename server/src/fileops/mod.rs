use async_trait::async_trait;

use api::fileops::{DeleteOutcome, MoveOutcome, RestoreOutcome, TrashEmptyOutcome};

use crate::service::ESInner;

pub mod oplog;
pub mod msg;
pub mod svc;

/// two-phase mutation surface over MediaRoot: a first call with
/// `confirm=false` returns a preview and a confirm token bound to the
/// observed state of the entry; a second call with the same token and
/// `confirm=true` executes it. A stale token (the entry changed between
/// preview and confirm) is rejected rather than silently re-previewed.
#[async_trait]
pub trait ESFileOpsService: ESInner {
    async fn delete(
        &self,
        rel_path: &str,
        confirm: bool,
        confirm_token: Option<String>,
    ) -> anyhow::Result<DeleteOutcome>;

    async fn move_entry(
        &self,
        src_rel_path: &str,
        dst_rel_path: &str,
        create_parents: bool,
        confirm: bool,
        confirm_token: Option<String>,
    ) -> anyhow::Result<MoveOutcome>;

    async fn trash_restore(
        &self,
        rel_path: &str,
        confirm: bool,
        confirm_token: Option<String>,
    ) -> anyhow::Result<RestoreOutcome>;

    async fn trash_empty(
        &self,
        confirm: bool,
        confirm_token: Option<String>,
    ) -> anyhow::Result<TrashEmptyOutcome>;
}
