use serde::{Deserialize, Serialize};

use crate::inventory::InventoryStats;
use crate::media_types::MediaCategory;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlbumSummary {
    pub rel_path: String,
    pub name: String,
    pub title: String,
    pub image_count: u64,
    pub mtime_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaFile {
    pub rel_path: String,
    pub folder_rel_path: String,
    pub ext: String,
    pub size_bytes: Option<u64>,
    pub mtime_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OtherFile {
    #[serde(flatten)]
    pub media: MediaFile,
    pub category: MediaCategory,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlbumImagesResult {
    pub album_rel_path: String,
    pub count: usize,
    pub items: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaIndex {
    pub media_root_abs: String,
    pub scanned_at_ms: i64,
    pub albums: Vec<AlbumSummary>,
    pub scattered_images: Vec<MediaFile>,
    pub videos: Vec<MediaFile>,
    pub games: Vec<OtherFile>,
    pub others: Vec<OtherFile>,
    pub stats: InventoryStats,
}
