pub mod error;
pub mod fileops;
pub mod index;
pub mod inventory;
pub mod media_types;

/// root directories written into MediaRoot by the system itself, as opposed
/// to content owned by the user
pub const TRASH_DIR_NAME: &str = "_trash";
pub const TRASH_META_FILENAME: &str = "meta.json";
