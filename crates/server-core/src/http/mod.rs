//! HTTP handler set and per-connection plumbing.
//!
//! The router is TLS-agnostic; the server injects a [`ConnMeta`] extension per
//! connection carrying the peer address, the negotiated SNI, and the
//! connection's cancellation token.

mod handlers;
mod script;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    http::{header, request::Parts},
    routing::{get, post},
    Extension, Router,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crs_types::{Color, OutLine};

use crate::broker::Broker;

pub use script::DEFAULT_TEMPLATE;

/// Shared state behind every handler.
pub(crate) struct HandlerState {
    /// The session broker handlers connect streams to.
    pub broker: Arc<Broker>,
    /// Lines for the operator terminal.
    pub output: mpsc::Sender<OutLine>,
    /// The listener's public-key fingerprint, for generated scripts.
    pub fingerprint: String,
    /// Port we're listening on, appended to SNI-derived callback URLs.
    pub listen_port: u16,
    /// Optional callback-template file, re-read on every request.
    pub template_file: Option<PathBuf>,
    /// Optional static-file directory (or single file).
    pub static_dir: Option<PathBuf>,
}

impl HandlerState {
    /// Sends a colored line to the operator, prefixed with the peer host.
    pub(crate) async fn r_log(&self, color: Color, peer: &str, msg: String) {
        let _ = self
            .output
            .send(OutLine::line(color, format!("[{peer}] {msg}")))
            .await;
    }

    /// Sends a red line to the operator, prefixed with the peer host.
    pub(crate) async fn r_error(&self, peer: &str, msg: String) {
        self.r_log(Color::Red, peer, msg).await;
    }
}

/// Per-connection request metadata, injected by the server's accept loop.
#[derive(Clone)]
pub(crate) struct ConnMeta {
    /// Peer TCP address.
    pub peer: SocketAddr,
    /// SNI the client presented during the TLS handshake, if any.
    pub sni: Option<String>,
    /// Cancelled when the connection (or the server) goes away.
    pub token: CancellationToken,
}

/// Returns a router serving the full handler set, ready to be layered with a
/// [`ConnMeta`] extension.
pub(crate) fn router(state: Arc<HandlerState>) -> Router {
    Router::new()
        .route("/i/{id}", get(handlers::input_handler))
        .route(
            "/o/{id}",
            post(handlers::output_handler).put(handlers::output_handler),
        )
        .route("/io", post(handlers::in_out_handler))
        .route("/io/{*rest}", post(handlers::in_out_handler))
        .route("/c", get(script::script_handler))
        .fallback(handlers::file_handler)
        .with_state(state)
}

/// Serves `router` for a single connection carrying `meta`.
pub(crate) fn conn_service(router: Router, meta: ConnMeta) -> Router {
    router.layer(Extension(meta))
}

/// Just the host part of the peer address, for operator messages.
pub(crate) fn remote_host(peer: &SocketAddr) -> String {
    peer.ip().to_string()
}

/// A span carrying the request context every handler logs under.
pub(crate) fn request_span(meta: &ConnMeta, parts: &Parts, id: Option<&str>) -> tracing::Span {
    tracing::info_span!(
        "request",
        remote_addr = %meta.peer,
        method = %parts.method,
        request_uri = %parts.uri,
        protocol = ?parts.version,
        host = header_str(parts, header::HOST),
        sni = meta.sni.as_deref().unwrap_or(""),
        user_agent = header_str(parts, header::USER_AGENT),
        id = id.unwrap_or(""),
    )
}

fn header_str(parts: &Parts, name: header::HeaderName) -> &str {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use futures_util::StreamExt;
    use tower::util::ServiceExt;

    use crs_types::Color;

    use super::*;

    struct Rig {
        app: Router,
        broker: Arc<Broker>,
        input_tx: mpsc::Sender<String>,
        output_rx: mpsc::Receiver<OutLine>,
        token: CancellationToken,
    }

    fn rig_with(static_dir: Option<PathBuf>) -> Rig {
        let (input_tx, input_rx) = mpsc::channel(1024);
        let (output_tx, output_rx) = mpsc::channel(1024);
        let broker = Broker::new(input_rx, output_tx.clone()).unwrap();
        let state = Arc::new(HandlerState {
            broker: broker.clone(),
            output: output_tx,
            fingerprint: "TESTFP".to_string(),
            listen_port: 4444,
            template_file: None,
            static_dir,
        });
        let token = CancellationToken::new();
        let app = conn_service(
            router(state),
            ConnMeta {
                peer: "10.0.0.9:55555".parse().unwrap(),
                sni: None,
                token: token.clone(),
            },
        );
        Rig {
            app,
            broker,
            input_tx,
            output_rx,
            token,
        }
    }

    fn rig() -> Rig {
        rig_with(None)
    }

    async fn body_string(resp: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn script_handler_400s_with_no_callback_source() {
        let rig = rig();
        let req = Request::builder().uri("/c").body(Body::empty()).unwrap();
        let resp = rig.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn script_handler_renders_the_bootstrap() {
        let rig = rig();
        let req = Request::builder()
            .uri("/c?c2=example.com:8443")
            .body(Body::empty())
            .unwrap();
        let resp = rig.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        assert!(body.contains("https://example.com:8443"), "{body}");
        assert!(body.contains("sha256//TESTFP"), "{body}");
        assert!(!body.contains("{{"), "{body}");
    }

    #[tokio::test]
    async fn input_handler_streams_operator_lines() {
        let mut rig = rig();
        let req = Request::builder()
            .uri("/i/abc")
            .body(Body::empty())
            .unwrap();
        let resp = rig.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // The input half registers; once we type a line it appears as a
        // body chunk with a trailing newline.
        rig.input_tx.send("whoami".to_string()).await.unwrap();
        let mut stream = resp.into_body().into_data_stream();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"whoami\n");

        // Killing the connection ends the stream.
        rig.token.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn output_handler_feeds_the_operator_terminal() {
        let mut rig = rig();

        // Pair the input half first so the session is complete.
        let (in_w, _in_r) = tokio::io::duplex(2048);
        let broker = rig.broker.clone();
        let token = rig.token.clone();
        tokio::spawn(async move {
            broker.connect_in(&token, "10.0.0.9", in_w, b"abc").await;
        });

        let req = Request::builder()
            .method("POST")
            .uri("/o/abc")
            .body(Body::from("output line\n"))
            .unwrap();
        let resp = rig.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        loop {
            let line = rig.output_rx.recv().await.unwrap();
            if line.plain {
                assert_eq!(line.line, "output line\n");
                break;
            }
        }
    }

    #[tokio::test]
    async fn output_handler_reports_wrong_key_but_still_200s() {
        let mut rig = rig();

        // A full session under one key.
        let (in_w, _in_r) = tokio::io::duplex(2048);
        let (_out_w, out_r) = tokio::io::duplex(2048);
        let broker = rig.broker.clone();
        let token = rig.token.clone();
        tokio::spawn(async move {
            broker.connect_in(&token, "10.0.0.9", in_w, b"abc").await;
        });
        let broker = rig.broker.clone();
        let token = rig.token.clone();
        tokio::spawn(async move {
            broker.connect_out(&token, "10.0.0.9", out_r, b"abc").await;
        });
        loop {
            let line = rig.output_rx.recv().await.unwrap();
            if line.line.contains(crate::events::SHELL_READY_MESSAGE) {
                break;
            }
        }

        let req = Request::builder()
            .method("POST")
            .uri("/o/xyz")
            .body(Body::from("boo"))
            .unwrap();
        let resp = rig.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_string(resp).await.is_empty());

        let rejection = loop {
            let line = rig.output_rx.recv().await.unwrap();
            if line.line.contains("xyz") {
                break line;
            }
        };
        assert_eq!(rejection.color, Color::Red);
    }

    #[tokio::test]
    async fn fallback_is_404_without_a_static_dir() {
        let rig = rig();
        let req = Request::builder()
            .uri("/loot.tar")
            .body(Body::empty())
            .unwrap();
        let resp = rig.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn static_dir_serves_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hi\n").unwrap();
        let rig = rig_with(Some(dir.path().to_path_buf()));

        let req = Request::builder()
            .uri("/hello.txt")
            .body(Body::empty())
            .unwrap();
        let resp = rig.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "hi\n");
    }

    #[tokio::test]
    async fn static_single_file_is_served_for_every_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("only.txt");
        std::fs::write(&file, "the one file\n").unwrap();
        let rig = rig_with(Some(file));

        let req = Request::builder()
            .uri("/anything/at/all")
            .body(Body::empty())
            .unwrap();
        let resp = rig.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "the one file\n");
    }
}
