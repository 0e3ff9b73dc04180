use std::io::SeekFrom;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{
        header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
};
use mime_guess::MimeGuess;
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::AsyncSeekExt;
use tokio_stream::StreamExt;
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::instrument;

use crate::http::{AppError, AppState};

#[derive(Debug, Deserialize)]
pub struct MediaQuery {
    path: String,
}

/// streams a file out of MediaRoot, honoring a single-range `Range: bytes=`
/// request the way a video player's seek bar does. errors resolving the
/// path go through `AppError`; a malformed or out-of-bounds range is reported
/// as 416 directly, since it is not a failure of the underlying file.
#[instrument(skip(state, headers))]
pub(super) async fn stream_media(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Query(query): Query<MediaQuery>,
) -> Result<Response, AppError> {
    let abs_path = state.sandbox.resolve(&query.path)?;

    let mut file_handle = File::open(&abs_path).await?;
    let length = file_handle.metadata().await?.len();

    let (partial, range) = match headers.get(RANGE) {
        None => (false, Ok((0, length))),
        Some(val) => (true, parse_ranges(&state.range_regex, val.to_str()?, length)),
    };

    let (start, end) = match range {
        Ok(v) => v,
        Err(()) => {
            let mut headers = HeaderMap::new();
            headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
            headers.insert(
                CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes */{length}"))?,
            );
            return Ok((StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response());
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(end - start));
    if partial {
        headers.insert(
            CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {start}-{}/{length}", end - 1))?,
        );
    }

    if let Some(mime) = MimeGuess::from_path(&abs_path).first() {
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(mime.essence_str())?);
    }

    let body = if partial {
        file_handle.seek(SeekFrom::Current(start.try_into()?)).await?;
        Body::from_stream(FramedRead::new(file_handle, BytesCodec::new()).take((end - start).try_into()?))
    } else {
        Body::from_stream(FramedRead::new(file_handle, BytesCodec::new()))
    };

    let code = if partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    Ok((code, headers, body).into_response())
}

/// http range header parser, adapted from
/// https://github.com/dicej/tagger/blob/master/server/src/media.rs -- returns
/// `Err(())` for anything that should be reported as 416, since the caller
/// needs `length` (not available here) to build that response.
fn parse_ranges(regex: &regex::Regex, ranges: &str, length: u64) -> Result<(u64, u64), ()> {
    if !ranges.starts_with("bytes=") {
        return Err(());
    }

    let mut match_iter = regex
        .captures_iter(ranges)
        .map(|c| c.extract::<2>())
        .map(|(_, [s, e])| parse_endpoints(s, e));

    let (start, end) = match match_iter.next() {
        None => return Ok((0, length)),
        Some(range) => {
            let range = range?;
            // start is used in seek(), zero-indexed. end is used as a byte
            // count for take(), one-indexed. both s and e in "s-e" are
            // zero-indexed, so (end - start) is made to be the total count
            // while start stays a zero-indexed position.
            match range {
                (Some(s), Some(e)) => (s, e + 1),
                (Some(s), None) => (s, length),
                (None, Some(e)) => (length.saturating_sub(e), length),
                (None, None) => (0, length),
            }
        }
    };

    if start > length || end > length || start > end || end == 0 {
        return Err(());
    }

    if match_iter.next().is_some() {
        return Err(());
    }

    Ok((start, end))
}

fn parse_endpoints(start: &str, end: &str) -> Result<(Option<u64>, Option<u64>), ()> {
    let parse = |s: &str| match s {
        "" => Ok(None),
        s => s.parse::<u64>().map(Some).map_err(|_| ()),
    };
    Ok((parse(start)?, parse(end)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn re() -> regex::Regex {
        regex::Regex::new(r"(\d*)-(\d*)").unwrap()
    }

    #[test]
    fn parses_start_end_range() {
        assert_eq!(parse_ranges(&re(), "bytes=2-5", 10), Ok((2, 6)));
    }

    #[test]
    fn parses_open_ended_range() {
        assert_eq!(parse_ranges(&re(), "bytes=2-", 10), Ok((2, 10)));
    }

    #[test]
    fn parses_suffix_range() {
        assert_eq!(parse_ranges(&re(), "bytes=-2", 10), Ok((8, 10)));
    }

    #[test]
    fn rejects_out_of_bounds_range() {
        assert_eq!(parse_ranges(&re(), "bytes=999-", 10), Err(()));
    }

    #[test]
    fn rejects_missing_unit() {
        assert_eq!(parse_ranges(&re(), "2-5", 10), Err(()));
    }
}
