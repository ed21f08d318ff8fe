//! Turns stream I/O into operator-terminal I/O.
//!
//! The [`Broker`] owns the single-session state machine: it pairs exactly one
//! input stream with exactly one output stream by session key, proxies
//! operator lines out and shell output in while the session is up, and makes
//! sure the sibling half is cancelled when either half dies.

use std::sync::Arc;

use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, Mutex},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crs_types::{OutLine, SessionEvent};

use crate::{
    events::{self, EVENT_BUFFER},
    ServerError, ServerResult,
};

/// Size of the bidirectional sentinel key, in bytes.
const BIDIR_KEY_LEN: usize = 1024;

/// Chunk size for reads from the shell's output stream.
const OUT_CHUNK_LEN: usize = 2048;

/// A stream direction, as seen from the operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Input,
    Output,
}

impl Direction {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }

    /// The direction, capitalized, for operator messages.
    fn title(self) -> &'static str {
        match self {
            Direction::Input => "Input",
            Direction::Output => "Output",
        }
    }
}

/// Pairing state, guarded by one lock.
///
/// Invariant: `key` is empty exactly when both cancel slots are `None` and no
/// half is tearing down. A non-empty `key` with only one slot set is a session
/// waiting for its other half.
#[derive(Default)]
struct PairState {
    /// Key of the currently pairing/paired session; empty when idle.
    key: Vec<u8>,
    /// Cancellation handle for the current input half.
    cancel_in: Option<CancellationToken>,
    /// Cancellation handle for the current output half.
    cancel_out: Option<CancellationToken>,
    /// Cleared during shutdown; no further halves are accepted.
    no_more: bool,
}

/// Why a proxy loop stopped.
#[derive(Debug, thiserror::Error)]
enum ProxyError {
    #[error("sending line: {0}")]
    Send(std::io::Error),
    #[error("flushing line: {0}")]
    Flush(std::io::Error),
    #[error("reading output: {0}")]
    Read(std::io::Error),
}

impl ProxyError {
    /// Errors which just indicate "normal" termination.
    fn is_normal_termination(&self) -> bool {
        use std::io::ErrorKind;
        let kind = match self {
            ProxyError::Send(e) | ProxyError::Flush(e) | ProxyError::Read(e) => e.kind(),
        };
        matches!(kind, ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe)
    }
}

/// Handles I/O from shells.
///
/// It ensures only one shell is connected at once, but also makes sure it
/// disconnects properly. All methods are safe for concurrent use; pass the
/// broker around as an `Arc`.
pub struct Broker {
    state: Mutex<PairState>,
    /// Lines typed by the operator. Locked by the active input half.
    input: Mutex<mpsc::Receiver<String>>,
    /// Lines for the operator terminal.
    output: mpsc::Sender<OutLine>,
    /// Sentinel key pairing the two halves of one bidirectional stream.
    bidir_key: Vec<u8>,
    /// Internal event queue, drained by [`Broker::run`].
    ev_tx: mpsc::Sender<SessionEvent>,
    ev_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    /// Registered event listeners; the lock is held during fan-out.
    listeners: Mutex<Vec<mpsc::Sender<SessionEvent>>>,
    /// Tracks in-flight halves so shutdown can wait for them.
    tracker: TaskTracker,
}

impl Broker {
    /// Returns a new broker, ready for use.
    pub fn new(
        input: mpsc::Receiver<String>,
        output: mpsc::Sender<OutLine>,
    ) -> ServerResult<Arc<Self>> {
        let mut bidir_key = vec![0u8; BIDIR_KEY_LEN];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bidir_key)
            .map_err(|e| ServerError::SentinelKey(e.to_string()))?;

        let (ev_tx, ev_rx) = mpsc::channel(EVENT_BUFFER);

        Ok(Arc::new(Self {
            state: Mutex::new(PairState::default()),
            input: Mutex::new(input),
            output,
            bidir_key,
            ev_tx,
            ev_rx: Mutex::new(Some(ev_rx)),
            listeners: Mutex::new(Vec::new()),
            tracker: TaskTracker::new(),
        }))
    }

    /// Runs the event dispatcher until `ctx` is cancelled, then drains.
    ///
    /// On cancellation no further halves are accepted, and `run` only returns
    /// once every in-flight half has finished.
    pub async fn run(&self, ctx: CancellationToken) -> ServerResult<()> {
        let mut ev_rx = self
            .ev_rx
            .lock()
            .await
            .take()
            .ok_or(ServerError::AlreadyRunning)?;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                ev = ev_rx.recv() => {
                    let Some(ev) = ev else { break };
                    let listeners = self.listeners.lock().await;
                    for l in listeners.iter() {
                        let _ = l.send(ev).await;
                    }
                }
            }
        }

        tracing::info!("Shutting down");
        self.state.lock().await.no_more = true;
        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }

    /// Starts events being sent to `tx`.
    ///
    /// `tx` should be buffered generously (the server uses 1024): the
    /// dispatcher blocks on slow listeners.
    pub async fn add_event_listener(&self, tx: mpsc::Sender<SessionEvent>) {
        let mut listeners = self.listeners.lock().await;
        if !listeners.iter().any(|l| l.same_channel(&tx)) {
            listeners.push(tx);
        }
    }

    /// Removes `tx` from the set of listeners.
    ///
    /// The channel is never closed by the broker; it just stops receiving
    /// events once this returns.
    pub async fn remove_event_listener(&self, tx: &mpsc::Sender<SessionEvent>) {
        self.listeners
            .lock()
            .await
            .retain(|l| !l.same_channel(tx));
    }

    /// Connects `w` to a shell with the given key, which should match a
    /// corresponding [`Broker::connect_out`] call.
    ///
    /// Operator lines are written to `w`, one per line with a trailing
    /// newline, flushing after each. Returns when `ctx` is cancelled, the
    /// operator input channel closes, a write fails, or the session's other
    /// half dies. `addr` is used for operator messages.
    pub async fn connect_in<W>(&self, ctx: &CancellationToken, addr: &str, w: W, key: &[u8])
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.tracker
            .track_future(async {
                let Some(child) = self.register(ctx, addr, Direction::Input, key).await else {
                    return;
                };
                let res = self.proxy_in(&child, w).await;
                self.finish(addr, Direction::Input, key, res).await;
            })
            .await
    }

    /// Connects `r` to a shell with the given key, which should match a
    /// corresponding [`Broker::connect_in`] call.
    ///
    /// Output is read in small chunks and forwarded to the operator terminal
    /// as plain lines.
    pub async fn connect_out<R>(&self, ctx: &CancellationToken, addr: &str, r: R, key: &[u8])
    where
        R: AsyncRead + Unpin + Send,
    {
        self.tracker
            .track_future(async {
                let Some(child) = self.register(ctx, addr, Direction::Output, key).await else {
                    return;
                };
                let res = self.proxy_out(&child, r).await;
                self.finish(addr, Direction::Output, key, res).await;
            })
            .await
    }

    /// Connects a bidirectional stream to a shell.
    ///
    /// Both directions run under the broker's bidirectional sentinel key, so
    /// they pair with each other and never with an external half. `w` and `r`
    /// may be two ends of the same stream.
    pub async fn connect_in_out<W, R>(&self, ctx: &CancellationToken, addr: &str, w: W, r: R)
    where
        W: AsyncWrite + Unpin + Send,
        R: AsyncRead + Unpin + Send,
    {
        tokio::join!(
            self.connect_in(ctx, addr, w, &self.bidir_key),
            self.connect_out(ctx, addr, r, &self.bidir_key),
        );
    }

    /// The channel carrying lines to the operator terminal.
    pub(crate) fn output(&self) -> &mpsc::Sender<OutLine> {
        &self.output
    }

    /// Registration half of the pairing protocol.
    ///
    /// Returns the child cancellation token for the proxy loop, or `None`
    /// when the half was rejected (which has already been reported).
    async fn register(
        &self,
        ctx: &CancellationToken,
        addr: &str,
        dir: Direction,
        key: &[u8],
    ) -> Option<CancellationToken> {
        let mut st = self.state.lock().await;

        if st.no_more {
            return None;
        }

        if key.is_empty() {
            tracing::error!(direction = dir.as_str(), "Key missing");
            self.error_line(addr, "Missing Key").await;
            return None;
        }

        let is_bidir = key == self.bidir_key.as_slice();

        let PairState {
            key: active,
            cancel_in,
            cancel_out,
            ..
        } = &mut *st;
        let (us, other) = match dir {
            Direction::Input => (cancel_in, cancel_out),
            Direction::Output => (cancel_out, cancel_in),
        };

        // A previous shell may still be disconnecting; its halves can't be
        // raced by a new session.
        if active.is_empty() && (us.is_some() || other.is_some()) {
            tracing::error!(direction = dir.as_str(), "Previous shell disconnecting");
            let msg = if is_bidir {
                format!(
                    "Rejected {} side of bidirectional connection \
                     while waiting for shell disconnect",
                    dir.as_str(),
                )
            } else {
                format!(
                    "Rejected {} connection with ID {:?} \
                     while waiting for shell disconnect",
                    dir.as_str(),
                    String::from_utf8_lossy(key),
                )
            };
            self.error_line(addr, &msg).await;
            return None;
        }

        // Don't double-connect.
        if us.is_some() {
            tracing::error!(direction = dir.as_str(), "Connection already established");
            let msg = if is_bidir {
                format!(
                    "Rejected unexpected {} side of bidirectional connection",
                    dir.as_str(),
                )
            } else if active.as_slice() == self.bidir_key.as_slice() {
                format!(
                    "Rejected {} connection with ID {:?}; \
                     a bidirectional connection is already up",
                    dir.as_str(),
                    String::from_utf8_lossy(key),
                )
            } else {
                format!(
                    "Rejected unexpected {} connection with ID {:?}",
                    dir.as_str(),
                    String::from_utf8_lossy(key),
                )
            };
            self.error_line(addr, &msg).await;
            return None;
        }

        // Make sure we have the right key if something's already connected.
        if !active.is_empty() && !bool::from(key.ct_eq(active.as_slice())) {
            tracing::error!(
                direction = dir.as_str(),
                key = %String::from_utf8_lossy(active),
                incorrect_key = %String::from_utf8_lossy(key),
                "Incorrect key",
            );
            let msg = if is_bidir {
                format!(
                    "Rejected {} side of bidirectional connection, \
                     expected unidirectional {} connection with ID {:?}",
                    dir.as_str(),
                    dir.as_str(),
                    String::from_utf8_lossy(active),
                )
            } else if active.as_slice() == self.bidir_key.as_slice() {
                format!(
                    "Rejected {} connection with ID {:?}, \
                     expected the {} side of a bidirectional connection",
                    dir.as_str(),
                    String::from_utf8_lossy(key),
                    dir.as_str(),
                )
            } else {
                format!(
                    "Rejected {} connection with ID {:?}, expected {:?}",
                    dir.as_str(),
                    String::from_utf8_lossy(key),
                    String::from_utf8_lossy(active),
                )
            };
            self.error_line(addr, &msg).await;
            return None;
        }

        // Looks like we're all set.
        let child = ctx.child_token();
        *us = Some(child.clone());

        tracing::info!(direction = dir.as_str(), "New connection");
        if !is_bidir {
            self.log_line(
                addr,
                &format!(
                    "{} connected: ID {:?}",
                    dir.title(),
                    String::from_utf8_lossy(key),
                ),
            )
            .await;
        }

        // If we've got both sides, let the operator know.
        if us.is_some() && other.is_some() {
            self.log_line(addr, events::SHELL_READY_MESSAGE).await;
            let _ = self.ev_tx.send(SessionEvent::Connected).await;
        }

        *active = key.to_vec();
        Some(child)
    }

    /// Teardown half of the pairing protocol.
    async fn finish(
        &self,
        addr: &str,
        dir: Direction,
        key: &[u8],
        res: Result<(), ProxyError>,
    ) {
        let conn = if key == self.bidir_key.as_slice() {
            "side of bidirectional connection"
        } else {
            "connection"
        };
        let msg = format!("{} {} closed", dir.title(), conn);
        match res {
            Err(err) if !err.is_normal_termination() => {
                tracing::error!(direction = dir.as_str(), error = %err, "Disconnected");
                self.error_line(addr, &format!("{msg}: {err}")).await;
            }
            _ => {
                tracing::info!(direction = dir.as_str(), "Disconnected");
                self.error_line(addr, &msg).await;
            }
        }

        let mut st = self.state.lock().await;
        let st = &mut *st;
        st.key.clear();
        let (us, other) = match dir {
            Direction::Input => (&mut st.cancel_in, &mut st.cancel_out),
            Direction::Output => (&mut st.cancel_out, &mut st.cancel_in),
        };
        *us = None;
        if let Some(sibling) = other {
            sibling.cancel();
        }

        // If both sides of the shell are gone, tell the operator.
        if st.cancel_in.is_none() && st.cancel_out.is_none() {
            self.error_line(addr, events::SHELL_GONE_MESSAGE).await;
            let _ = self.ev_tx.send(SessionEvent::Disconnected).await;
        }
    }

    /// Proxies operator lines to the input stream's writer.
    async fn proxy_in<W>(&self, ctx: &CancellationToken, mut w: W) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        // Sole reader of operator input while this half is up.
        let mut input = self.input.lock().await;
        loop {
            tokio::select! {
                line = input.recv() => {
                    // A closed input channel means the operator is gone.
                    let Some(mut line) = line else { return Ok(()) };
                    line.push('\n');
                    w.write_all(line.as_bytes())
                        .await
                        .map_err(ProxyError::Send)?;
                    w.flush().await.map_err(ProxyError::Flush)?;
                    tracing::info!(data = %line, "Shell I/O");
                }
                _ = ctx.cancelled() => return Ok(()),
            }
        }
    }

    /// Proxies the output stream's reader to the operator terminal.
    async fn proxy_out<R>(&self, ctx: &CancellationToken, mut r: R) -> Result<(), ProxyError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf = [0u8; OUT_CHUNK_LEN];
        loop {
            tokio::select! {
                res = r.read(&mut buf) => {
                    let n = match res {
                        Ok(0) => return Ok(()),
                        Ok(n) => n,
                        Err(e) => {
                            let err = ProxyError::Read(e);
                            if err.is_normal_termination() {
                                return Ok(());
                            }
                            return Err(err);
                        }
                    };
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    tokio::select! {
                        _ = self.output.send(OutLine::plain(chunk.clone())) => {
                            tracing::info!(data = %chunk, "Shell I/O");
                        }
                        _ = ctx.cancelled() => return Ok(()),
                    }
                }
                _ = ctx.cancelled() => return Ok(()),
            }
        }
    }
}
