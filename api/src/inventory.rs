use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Dir,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InventoryItem {
    pub rel_path: String,
    pub kind: ItemKind,
    pub size_bytes: Option<u64>,
    pub mtime_ms: Option<i64>,
}

/// scanner warning codes -- never fatal, always collected
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCode {
    StatFailed,
    LinkOutOfBounds,
    LinkSkipped,
    ScandirFailed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InventoryWarning {
    pub code: WarningCode,
    pub rel_path: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InventoryStats(pub BTreeMap<String, i64>);

impl InventoryStats {
    pub fn new() -> Self {
        InventoryStats(BTreeMap::new())
    }

    pub fn incr(&mut self, counter: &str) {
        *self.0.entry(counter.to_string()).or_insert(0) += 1;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InventoryResult {
    pub media_root_abs: String,
    pub scanned_at_ms: i64,
    pub items: Vec<InventoryItem>,
    pub warnings: Vec<InventoryWarning>,
    pub stats: InventoryStats,
}
