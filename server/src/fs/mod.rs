use async_trait::async_trait;

use api::index::{AlbumImagesResult, MediaIndex};

use crate::service::ESInner;

pub mod index;
pub mod msg;
pub mod scan;
pub mod svc;

#[async_trait]
pub trait ESFsService: ESInner {
    async fn get_index(&self, refresh: bool) -> anyhow::Result<MediaIndex>;

    async fn album_images(&self, album_rel: &str) -> anyhow::Result<AlbumImagesResult>;
}
