//! Stream and file handlers.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension,
};
use futures_util::TryStreamExt;
use tower::util::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};
use tracing::Instrument;

use crs_types::Color;

use super::{remote_host, request_span, ConnMeta, HandlerState};

/// Buffer size for the in-memory pipe feeding a streamed response body.
const PIPE_BUFFER: usize = 2048;

/// `GET /i/{id}`: the input half of a session.
///
/// Operator lines are streamed down the response body, one chunk per line,
/// for as long as the session lasts.
pub(crate) async fn input_handler(
    State(state): State<Arc<HandlerState>>,
    Extension(meta): Extension<ConnMeta>,
    Path(id): Path<String>,
    req: Request,
) -> Response {
    let (parts, _) = req.into_parts();
    let span = request_span(&meta, &parts, Some(&id));
    let peer = remote_host(&meta.peer);

    let (writer, reader) = tokio::io::duplex(PIPE_BUFFER);
    let broker = state.broker.clone();
    let token = meta.token.clone();
    tokio::spawn(
        async move {
            broker.connect_in(&token, &peer, writer, id.as_bytes()).await;
        }
        .instrument(span),
    );

    Body::from_stream(tokio_util::io::ReaderStream::new(reader)).into_response()
}

/// `POST/PUT /o/{id}`: the output half of a session.
///
/// The request body carries the shell's output; the response is sent once the
/// body ends.
pub(crate) async fn output_handler(
    State(state): State<Arc<HandlerState>>,
    Extension(meta): Extension<ConnMeta>,
    Path(id): Path<String>,
    req: Request,
) -> StatusCode {
    let (parts, body) = req.into_parts();
    let span = request_span(&meta, &parts, Some(&id));
    let peer = remote_host(&meta.peer);

    let reader = tokio_util::io::StreamReader::new(
        body.into_data_stream().map_err(std::io::Error::other),
    );
    state
        .broker
        .connect_out(&meta.token, &peer, reader, id.as_bytes())
        .instrument(span)
        .await;

    StatusCode::OK
}

/// `POST /io`: both halves of a session on one request.
///
/// The streaming response is returned before the request body is consumed,
/// which doubles as the initial flush full-duplex clients wait for.
pub(crate) async fn in_out_handler(
    State(state): State<Arc<HandlerState>>,
    Extension(meta): Extension<ConnMeta>,
    req: Request,
) -> Response {
    let (parts, body) = req.into_parts();
    let span = request_span(&meta, &parts, None);
    let peer = remote_host(&meta.peer);

    let reader = tokio_util::io::StreamReader::new(
        body.into_data_stream().map_err(std::io::Error::other),
    );
    let (writer, resp_reader) = tokio::io::duplex(PIPE_BUFFER);
    let broker = state.broker.clone();
    let token = meta.token.clone();
    tokio::spawn(
        async move {
            broker.connect_in_out(&token, &peer, writer, reader).await;
        }
        .instrument(span),
    );

    Body::from_stream(tokio_util::io::ReaderStream::new(resp_reader)).into_response()
}

/// Fallback: serve static files when a directory is configured, 404 otherwise.
///
/// If the configured path is a single regular file, that file is served for
/// every request path.
pub(crate) async fn file_handler(
    State(state): State<Arc<HandlerState>>,
    Extension(meta): Extension<ConnMeta>,
    req: Request,
) -> Response {
    let Some(dir) = state.static_dir.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let (parts, body) = req.into_parts();
    let span = request_span(&meta, &parts, None);
    let req = Request::from_parts(parts, body);
    let peer = remote_host(&meta.peer);

    async move {
        state
            .r_log(Color::Blue, &peer, format!("File requested: {}", req.uri()))
            .await;

        let md = match tokio::fs::metadata(&dir).await {
            Ok(md) => md,
            Err(err) => {
                tracing::error!(error = %err, path = %dir.display(), "Could not open static root");
                state
                    .r_error(&peer, format!("Could not open {}: {}", dir.display(), err))
                    .await;
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        // A single regular file is served for every path.
        let served = if md.is_file() {
            ServeFile::new(&dir).oneshot(req).await
        } else {
            ServeDir::new(&dir).oneshot(req).await
        };
        match served {
            Ok(resp) => resp.into_response(),
            Err(err) => {
                tracing::error!(error = %err, "Static file serve failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
    .instrument(span)
    .await
}
