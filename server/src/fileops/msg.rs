use api::fileops::{DeleteOutcome, MoveOutcome, RestoreOutcome, TrashEmptyOutcome};

use crate::service::ESMResp;

#[derive(Debug)]
pub enum FileOpsMsg {
    Delete {
        resp: ESMResp<DeleteOutcome>,
        path: String,
        confirm: bool,
        confirm_token: Option<String>,
    },
    Move {
        resp: ESMResp<MoveOutcome>,
        src: String,
        dst: String,
        create_parents: bool,
        confirm: bool,
        confirm_token: Option<String>,
    },
    TrashRestore {
        resp: ESMResp<RestoreOutcome>,
        path: String,
        confirm: bool,
        confirm_token: Option<String>,
    },
    TrashEmpty {
        resp: ESMResp<TrashEmptyOutcome>,
        confirm: bool,
        confirm_token: Option<String>,
    },
}
