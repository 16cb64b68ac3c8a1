//! Transcoding route handlers: playlists, segments, seeks and sessions.

use axum::extract::{Path, Query, State};
use axum::Extension;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use mq_core::{ContentId, Error, SessionId, SessionKey};
use mq_media::hls::{MasterPlaylist, Variant};
use mq_transcode::{SeekOutcome, SessionSnapshot};
use serde::{Deserialize, Serialize};

use crate::context::AppContext;
use crate::error::AppError;
use crate::middleware::request_id::RequestId;

const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const TS_CONTENT_TYPE: &str = "video/mp2t";
/// H.264 High 4.0 plus AAC-LC, which is what the encoder produces.
const VARIANT_CODECS: &str = "avc1.640028,mp4a.40.2";

#[derive(Debug, Deserialize)]
pub struct PlaylistQuery {
    /// Seek to this offset before returning the playlist.
    pub start: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct SeekRequest {
    pub offset_secs: f64,
}

#[derive(Debug, Serialize)]
pub struct SeekResponse {
    pub session_id: SessionId,
    pub offset_secs: f64,
    pub segment_index: u64,
    pub outcome: SeekOutcome,
}

/// Parse `N.ts` into a timeline index.
fn parse_segment_file(file: &str) -> Result<u64, Error> {
    file.strip_suffix(".ts")
        .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| Error::Validation(format!("invalid segment name '{file}'")))
}

/// GET /api/transcode/{content}/master.m3u8
pub async fn master_playlist(
    State(ctx): State<AppContext>,
    Path(content): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let content = ContentId::parse(&content)?;
    ctx.registry.source(&content).await?;

    let playlist = MasterPlaylist {
        variants: ctx
            .registry
            .qualities()
            .iter()
            .map(|q| Variant {
                bandwidth: u64::from(q.video_bitrate_kbps + q.audio_bitrate_kbps) * 1000,
                codecs: VARIANT_CODECS.to_string(),
                name: Some(q.id.to_string()),
                uri: format!("{}/index.m3u8", q.id),
            })
            .collect(),
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HLS_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        playlist.to_string(),
    ))
}

/// GET /api/transcode/{content}/{quality}/index.m3u8
///
/// Always the full-length VOD playlist, whatever the encoder has produced.
pub async fn media_playlist(
    State(ctx): State<AppContext>,
    Path((content, quality)): Path<(String, String)>,
    Query(params): Query<PlaylistQuery>,
) -> Result<impl IntoResponse, AppError> {
    let key = SessionKey::parse(&content, &quality)?;
    let session = match params.start {
        Some(start) => ctx.registry.request_seek(&key, start).await?.0,
        None => ctx.registry.get_or_create(&key).await?,
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HLS_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        session.playlist().to_string(),
    ))
}

/// GET /api/transcode/{content}/{quality}/segment/{file}
pub async fn segment(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    Path((content, quality, file)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let key = SessionKey::parse(&content, &quality).map_err(AppError::tagged(&request_id))?;
    let index = parse_segment_file(&file).map_err(AppError::tagged(&request_id))?;

    let segment = ctx
        .registry
        .fetch_segment(&key, index)
        .await
        .map_err(AppError::tagged(&request_id))?;
    let bytes = tokio::fs::read(&segment.path).await.map_err(|e| {
        tracing::warn!(path = %segment.path.display(), error = %e, "ready segment unreadable");
        AppError::tagged(&request_id)(Error::from(e))
    })?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, TS_CONTENT_TYPE),
            (header::CACHE_CONTROL, "max-age=3600"),
        ],
        bytes,
    ))
}

/// POST /api/transcode/{content}/{quality}/seek
pub async fn seek(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    Path((content, quality)): Path<(String, String)>,
    Json(req): Json<SeekRequest>,
) -> Result<Json<SeekResponse>, AppError> {
    let key = SessionKey::parse(&content, &quality).map_err(AppError::tagged(&request_id))?;
    let (session, outcome) = ctx
        .registry
        .request_seek(&key, req.offset_secs)
        .await
        .map_err(AppError::tagged(&request_id))?;

    let offset_secs = req
        .offset_secs
        .min(session.manifest().total_duration_secs());
    Ok(Json(SeekResponse {
        session_id: session.id(),
        offset_secs,
        segment_index: session.manifest().index_for_offset(offset_secs),
        outcome,
    }))
}

/// DELETE /api/transcode/{content}/{quality}
pub async fn stop_session(
    State(ctx): State<AppContext>,
    Path((content, quality)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let key = SessionKey::parse(&content, &quality)?;
    ctx.registry.stop(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/transcode/sessions
pub async fn list_sessions(State(ctx): State<AppContext>) -> Json<Vec<SessionSnapshot>> {
    Json(ctx.registry.snapshots())
}

/// GET /api/qualities
pub async fn list_qualities(
    State(ctx): State<AppContext>,
) -> Json<Vec<mq_core::config::QualityProfile>> {
    Json(ctx.registry.qualities().to_vec())
}
