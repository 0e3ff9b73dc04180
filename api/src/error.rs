use std::fmt;

use http::StatusCode;
use serde::Serialize;

/// error taxonomy, part of the external HTTP contract -- codes must not be
/// renamed without updating every client that matches on them
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[allow(non_camel_case_types)]
pub enum ErrorCode {
    InvalidRequest,
    InvalidJson,
    InvalidContentLength,
    InvalidPath,
    InvalidMove,
    SandboxViolation,
    NotFound,
    NotAFile,
    NotADir,
    StatFailed,
    ReadDirFailed,
    UnsupportedMediaType,
    RootForbidden,
    TrashRootForbidden,
    NotInTrash,
    DstExists,
    DstParentNotDir,
    DstParentMissing,
    TrashEntryExists,
    TrashEntryNotDir,
    StaleConfirmToken,
    ConfirmTokenRequired,
    TrashMetaMissing,
    ThumbRateLimited,
    VideoMosaicRateLimited,
    IndexBuildFailed,
    FileopsFailed,
    DeleteFailed,
    ArchiveFailed,
    PurgeFailed,
    MoveFailed,
    RestoreFailed,
    TrashEmptyFailed,
    ThumbnailFailed,
    AlbumCoverFailed,
    AlbumEmpty,
    VideoMosaicFailed,
    PillowNotInstalled,
    FfmpegNotAvailable,
    FfmpegFailed,
    FfmpegTimeout,
    TrashMetaInvalid,
    TrashMetaReadFailed,
    TrashCreateFailed,
    TrashListFailed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::InvalidJson => "INVALID_JSON",
            ErrorCode::InvalidContentLength => "INVALID_CONTENT_LENGTH",
            ErrorCode::InvalidPath => "INVALID_PATH",
            ErrorCode::InvalidMove => "INVALID_MOVE",
            ErrorCode::SandboxViolation => "SANDBOX_VIOLATION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::NotAFile => "NOT_A_FILE",
            ErrorCode::NotADir => "NOT_A_DIR",
            ErrorCode::StatFailed => "STAT_FAILED",
            ErrorCode::ReadDirFailed => "READ_DIR_FAILED",
            ErrorCode::UnsupportedMediaType => "UNSUPPORTED_MEDIA_TYPE",
            ErrorCode::RootForbidden => "ROOT_FORBIDDEN",
            ErrorCode::TrashRootForbidden => "TRASH_ROOT_FORBIDDEN",
            ErrorCode::NotInTrash => "NOT_IN_TRASH",
            ErrorCode::DstExists => "DST_EXISTS",
            ErrorCode::DstParentNotDir => "DST_PARENT_NOT_DIR",
            ErrorCode::DstParentMissing => "DST_PARENT_MISSING",
            ErrorCode::TrashEntryExists => "TRASH_ENTRY_EXISTS",
            ErrorCode::TrashEntryNotDir => "TRASH_ENTRY_NOT_DIR",
            ErrorCode::StaleConfirmToken => "STALE_CONFIRM_TOKEN",
            ErrorCode::ConfirmTokenRequired => "CONFIRM_TOKEN_REQUIRED",
            ErrorCode::TrashMetaMissing => "TRASH_META_MISSING",
            ErrorCode::ThumbRateLimited => "THUMB_RATE_LIMITED",
            ErrorCode::VideoMosaicRateLimited => "VIDEO_MOSAIC_RATE_LIMITED",
            ErrorCode::IndexBuildFailed => "INDEX_BUILD_FAILED",
            ErrorCode::FileopsFailed => "FILEOPS_FAILED",
            ErrorCode::DeleteFailed => "DELETE_FAILED",
            ErrorCode::ArchiveFailed => "ARCHIVE_FAILED",
            ErrorCode::PurgeFailed => "PURGE_FAILED",
            ErrorCode::MoveFailed => "MOVE_FAILED",
            ErrorCode::RestoreFailed => "RESTORE_FAILED",
            ErrorCode::TrashEmptyFailed => "TRASH_EMPTY_FAILED",
            ErrorCode::ThumbnailFailed => "THUMBNAIL_FAILED",
            ErrorCode::AlbumCoverFailed => "ALBUM_COVER_FAILED",
            ErrorCode::AlbumEmpty => "ALBUM_EMPTY",
            ErrorCode::VideoMosaicFailed => "VIDEO_MOSAIC_FAILED",
            ErrorCode::PillowNotInstalled => "PILLOW_NOT_INSTALLED",
            ErrorCode::FfmpegNotAvailable => "FFMPEG_NOT_AVAILABLE",
            ErrorCode::FfmpegFailed => "FFMPEG_FAILED",
            ErrorCode::FfmpegTimeout => "FFMPEG_TIMEOUT",
            ErrorCode::TrashMetaInvalid => "TRASH_META_INVALID",
            ErrorCode::TrashMetaReadFailed => "TRASH_META_READ_FAILED",
            ErrorCode::TrashCreateFailed => "TRASH_CREATE_FAILED",
            ErrorCode::TrashListFailed => "TRASH_LIST_FAILED",
        }
    }

    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequest
            | ErrorCode::InvalidJson
            | ErrorCode::InvalidContentLength
            | ErrorCode::InvalidPath
            | ErrorCode::InvalidMove
            | ErrorCode::SandboxViolation
            | ErrorCode::ConfirmTokenRequired => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound
            | ErrorCode::NotAFile
            | ErrorCode::NotADir
            | ErrorCode::StatFailed
            | ErrorCode::ReadDirFailed
            | ErrorCode::AlbumEmpty => StatusCode::NOT_FOUND,
            ErrorCode::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ErrorCode::RootForbidden | ErrorCode::TrashRootForbidden | ErrorCode::NotInTrash => {
                StatusCode::FORBIDDEN
            }
            ErrorCode::DstExists
            | ErrorCode::DstParentNotDir
            | ErrorCode::DstParentMissing
            | ErrorCode::TrashEntryExists
            | ErrorCode::TrashEntryNotDir
            | ErrorCode::StaleConfirmToken
            | ErrorCode::TrashMetaMissing => StatusCode::CONFLICT,
            ErrorCode::ThumbRateLimited | ErrorCode::VideoMosaicRateLimited => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ErrorCode::PillowNotInstalled | ErrorCode::FfmpegNotAvailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorCode::FfmpegFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::FfmpegTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::IndexBuildFailed
            | ErrorCode::FileopsFailed
            | ErrorCode::DeleteFailed
            | ErrorCode::ArchiveFailed
            | ErrorCode::PurgeFailed
            | ErrorCode::MoveFailed
            | ErrorCode::RestoreFailed
            | ErrorCode::TrashEmptyFailed
            | ErrorCode::ThumbnailFailed
            | ErrorCode::AlbumCoverFailed
            | ErrorCode::VideoMosaicFailed
            | ErrorCode::TrashMetaInvalid
            | ErrorCode::TrashMetaReadFailed
            | ErrorCode::TrashCreateFailed
            | ErrorCode::TrashListFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// the error type every fallible core-service call returns at its public
/// seam; internal plumbing still uses anyhow::Result and gets mapped into
/// one of these at the boundary (see server::http::error)
#[derive(Clone, Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ApiError {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}
