use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub const DEFAULT_IMAGE_EXTS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp", ".tif", ".tiff", ".heic", ".avif", ".svg",
];

pub const DEFAULT_VIDEO_EXTS: &[&str] = &[
    ".mp4", ".mkv", ".mov", ".avi", ".wmv", ".flv", ".webm", ".m4v", ".mpg", ".mpeg", ".ts",
];

pub const DEFAULT_GAME_EXTS: &[&str] = &[".exe", ".bat", ".cmd", ".com", ".lnk", ".url"];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaCategory {
    Image,
    Video,
    Game,
    Other,
}

/// frozen bundle of lowercased, dot-prefixed extension sets -- a config file
/// may override any subset, with the rest falling back to the defaults above
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MediaTypes {
    pub image_exts: HashSet<String>,
    pub video_exts: HashSet<String>,
    pub game_exts: HashSet<String>,
}

impl Default for MediaTypes {
    fn default() -> Self {
        MediaTypes::defaults()
    }
}

impl MediaTypes {
    pub fn defaults() -> Self {
        MediaTypes {
            image_exts: DEFAULT_IMAGE_EXTS.iter().map(|s| s.to_string()).collect(),
            video_exts: DEFAULT_VIDEO_EXTS.iter().map(|s| s.to_string()).collect(),
            game_exts: DEFAULT_GAME_EXTS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// categorize a lowercased, dot-prefixed extension; image -> video -> game -> other
    pub fn categorize(&self, ext: &str) -> MediaCategory {
        let ext = ext.to_ascii_lowercase();
        if self.image_exts.contains(&ext) {
            MediaCategory::Image
        } else if self.video_exts.contains(&ext) {
            MediaCategory::Video
        } else if self.game_exts.contains(&ext) {
            MediaCategory::Game
        } else {
            MediaCategory::Other
        }
    }
}

/// raw shape of the optional "media-types file" (spec.md section 6): any
/// subset of the three lists, each a JSON array of extension strings
#[derive(Debug, Deserialize)]
pub struct MediaTypesFile {
    pub images: Option<Vec<String>>,
    pub videos: Option<Vec<String>>,
    pub games: Option<Vec<String>>,
}

pub fn normalize_ext_list(values: &[String]) -> Result<HashSet<String>, String> {
    let mut exts = HashSet::new();
    for raw in values {
        let ext = raw.trim().to_ascii_lowercase();
        if ext.is_empty() {
            continue;
        }
        if !ext.starts_with('.') {
            return Err(format!("invalid extension (must start with '.'): {raw:?}"));
        }
        exts.insert(ext);
    }
    Ok(exts)
}

impl MediaTypesFile {
    /// merge this file's overrides onto the defaults, the way
    /// `load_media_types` does in the original python implementation
    pub fn into_media_types(self) -> Result<MediaTypes, String> {
        let defaults = MediaTypes::defaults();

        let image_exts = match self.images {
            Some(v) => normalize_ext_list(&v)?,
            None => defaults.image_exts,
        };
        let video_exts = match self.videos {
            Some(v) => normalize_ext_list(&v)?,
            None => defaults.video_exts,
        };
        let game_exts = match self.games {
            Some(v) => normalize_ext_list(&v)?,
            None => defaults.game_exts,
        };

        Ok(MediaTypes {
            image_exts,
            video_exts,
            game_exts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorize_defaults() {
        let mt = MediaTypes::defaults();
        assert_eq!(mt.categorize(".JPG"), MediaCategory::Image);
        assert_eq!(mt.categorize(".mp4"), MediaCategory::Video);
        assert_eq!(mt.categorize(".exe"), MediaCategory::Game);
        assert_eq!(mt.categorize(".txt"), MediaCategory::Other);
    }

    #[test]
    fn normalize_rejects_missing_dot() {
        assert!(normalize_ext_list(&["jpg".to_string()]).is_err());
    }

    #[test]
    fn file_overrides_merge_with_defaults() {
        let file = MediaTypesFile {
            images: Some(vec![".foo".to_string()]),
            videos: None,
            games: None,
        };
        let mt = file.into_media_types().unwrap();
        assert!(mt.image_exts.contains(".foo"));
        assert!(mt.video_exts.contains(".mp4"));
    }
}
