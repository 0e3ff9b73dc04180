use std::path::PathBuf;

use crate::cache::thumb::WarmResult;
use crate::service::ESMResp;

#[derive(Debug)]
pub enum CacheMsg {
    EnsureThumb {
        resp: ESMResp<PathBuf>,
        rel_path: String,
    },
    EnsureCover {
        resp: ESMResp<PathBuf>,
        album_rel: String,
    },
    EnsureMosaic {
        resp: ESMResp<PathBuf>,
        rel_path: String,
    },
    WarmThumbs {
        resp: ESMResp<WarmResult>,
        rel_paths: Vec<String>,
    },
}
