use api::index::{AlbumImagesResult, MediaIndex};

use crate::service::ESMResp;

#[derive(Debug)]
pub enum FsMsg {
    GetIndex {
        resp: ESMResp<MediaIndex>,
        refresh: bool,
    },
    AlbumImages {
        resp: ESMResp<AlbumImagesResult>,
        album_rel: String,
    },
}
