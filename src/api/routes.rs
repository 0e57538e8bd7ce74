use crate::AppState;
use crate::html;
use crate::pipeline::{MjpegStream, spawn_stream};
use crate::session::{session_cookie, session_id};
use crate::source::MediaSource;
use crate::stream;
use axum::body::Body;
use axum::extract::{Extension, Multipart};
use axum::extract::multipart::Field;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{Html, IntoResponse, Json, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::path::Path;
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, error, info, warn};

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
    pub classes: usize,
}

/// Turns a client-supplied file name into one that is safe to join onto a directory.
///
/// Path separators become spaces, whitespace runs become `_`, anything outside
/// `[A-Za-z0-9_.-]` is dropped and leading or trailing `.`/`_` are stripped.
/// Returns `None` when nothing is left.
pub fn secure_filename(filename: &str) -> Option<String> {
    let spaced = filename.replace(['/', '\\'], " ");
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    let trimmed = kept.trim_matches(|c| c == '.' || c == '_');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Session id of the request when its cookie names a live session.
fn known_session(state: &AppState, headers: &HeaderMap) -> Option<String> {
    session_id(headers).filter(|id| state.sessions.contains(id))
}

/// Session id of the request, plus a `Set-Cookie` header when a new session had to be created.
fn resolve_session(state: &AppState, headers: &HeaderMap) -> (String, HeaderMap) {
    let mut response_headers = HeaderMap::new();
    if let Some(id) = known_session(state, headers) {
        return (id, response_headers);
    }

    let id = state.sessions.create();
    if let Ok(cookie) = HeaderValue::from_str(&session_cookie(&id)) {
        response_headers.insert(header::SET_COOKIE, cookie);
    }
    (id, response_headers)
}

fn upload_error(status: StatusCode, cookies: HeaderMap, message: &str) -> Response {
    (status, cookies, Html(html::upload_page(None, Some(message)))).into_response()
}

fn server_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(html::server_error_page()),
    )
        .into_response()
}

fn stream_response(chunks: MjpegStream) -> Response {
    let body = Body::from_stream(chunks.map(Ok::<Bytes, Infallible>));
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, stream::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

pub async fn home(Extension(state): Extension<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(id) = known_session(&state, &headers) {
        state.sessions.clear(&id);
    }
    (StatusCode::OK, Html(html::index_page()))
}

pub async fn upload_page() -> impl IntoResponse {
    (StatusCode::OK, Html(html::upload_page(None, None)))
}

#[axum::debug_handler]
pub async fn upload_media(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let (id, cookies) = resolve_session(&state, &headers);

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "Malformed upload");
                return upload_error(err.status(), cookies, "The upload could not be read");
            }
        };
        if field.name() != Some("file") {
            continue;
        }

        let Some(filename) = field.file_name().and_then(secure_filename) else {
            return upload_error(StatusCode::BAD_REQUEST, cookies, "Please choose a file to upload");
        };

        info!(session = %id, %filename, "Uploading file");
        let upload_path = state.uploads_dir().join(&filename);
        // Sanitized names never start with '.', so the partial file cannot clash with an upload
        let partial_path = state
            .uploads_dir()
            .join(format!(".{}.part", uuid::Uuid::new_v4()));
        return match save_field(field, &partial_path).await {
            Ok(0) => {
                let _ = tokio::fs::remove_file(&partial_path).await;
                upload_error(StatusCode::BAD_REQUEST, cookies, "The uploaded file is empty")
            }
            Ok(bytes) => {
                if let Err(err) = tokio::fs::rename(&partial_path, &upload_path).await {
                    error!(path = %upload_path.display(), %err, "Failed to move upload into place");
                    let _ = tokio::fs::remove_file(&partial_path).await;
                    return upload_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        cookies,
                        "Failed to save upload file",
                    );
                }
                state.sessions.set_media_path(&id, &upload_path);
                info!(session = %id, path = %upload_path.display(), bytes, "Upload saved");
                (
                    StatusCode::OK,
                    cookies,
                    Html(html::upload_page(Some(&filename), None)),
                )
                    .into_response()
            }
            Err((status, message)) => upload_error(status, cookies, message),
        };
    }

    upload_error(StatusCode::BAD_REQUEST, cookies, "Please choose a file to upload")
}

/// Streams a multipart field to disk. Removes the partial file on failure.
async fn save_field(
    mut field: Field<'_>,
    upload_path: &Path,
) -> Result<u64, (StatusCode, &'static str)> {
    let Ok(mut file) = tokio::fs::File::create(upload_path).await else {
        error!(path = %upload_path.display(), "Failed to create upload file");
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to create upload file",
        ));
    };

    let mut written = 0u64;
    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                if file.write_all(&chunk).await.is_err() {
                    error!(path = %upload_path.display(), "Failed to write to upload file");
                    let _ = tokio::fs::remove_file(upload_path).await;
                    return Err((
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to write to upload file",
                    ));
                }
                written += chunk.len() as u64;
            }
            Ok(None) => break,
            Err(err) => {
                warn!(path = %upload_path.display(), %err, "Upload interrupted");
                let _ = tokio::fs::remove_file(upload_path).await;
                return Err((err.status(), "The upload could not be read"));
            }
        }
    }

    if file.flush().await.is_err() {
        error!(path = %upload_path.display(), "Failed to flush upload file");
        let _ = tokio::fs::remove_file(upload_path).await;
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to flush upload file",
        ));
    }

    Ok(written)
}

pub async fn media(Extension(state): Extension<AppState>, headers: HeaderMap) -> Response {
    let Some((id, media_path)) = known_session(&state, &headers)
        .and_then(|id| state.sessions.media_path(&id).map(|path| (id, path)))
    else {
        debug!("No media uploaded for session");
        return upload_error(StatusCode::BAD_REQUEST, HeaderMap::new(), "Upload a file first");
    };

    let source = MediaSource::from_path(media_path);
    let settings = state.stream_settings(source.is_image());
    match spawn_stream(source.clone(), state.annotator(), settings).await {
        Ok(chunks) => {
            info!(session = %id, %source, "Streaming media");
            stream_response(chunks)
        }
        Err(err) => {
            error!(session = %id, %source, %err, "Failed to open media");
            server_error()
        }
    }
}

pub async fn webapp(Extension(state): Extension<AppState>) -> Response {
    let source = MediaSource::camera(&state.config.webcam);
    let settings = state.stream_settings(false);
    match spawn_stream(source.clone(), state.annotator(), settings).await {
        Ok(chunks) => {
            info!(%source, "Streaming webcam");
            stream_response(chunks)
        }
        Err(err) => {
            error!(%source, %err, "Failed to open webcam");
            server_error()
        }
    }
}

pub async fn health(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
            model: state.config.model_path.clone(),
            classes: state.classes.len(),
        }),
    )
}

pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Html(html::not_found_page()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_filename_matches_werkzeug() {
        assert_eq!(secure_filename("My cool movie.mov").as_deref(), Some("My_cool_movie.mov"));
        assert_eq!(
            secure_filename("../../../etc/passwd").as_deref(),
            Some("etc_passwd")
        );
        assert_eq!(
            secure_filename("i contain cool \u{fc}ml\u{e4}uts.txt").as_deref(),
            Some("i_contain_cool_mluts.txt")
        );
        assert_eq!(secure_filename("..\\board.png").as_deref(), Some("board.png"));
        assert_eq!(secure_filename("_.hidden_").as_deref(), Some("hidden"));
    }

    #[test]
    fn secure_filename_rejects_empty_results() {
        assert_eq!(secure_filename(""), None);
        assert_eq!(secure_filename("../.."), None);
        assert_eq!(secure_filename("\u{4e2d}\u{6587}"), None);
    }
}
