use thiserror::Error;

/// Errors that can occur in server-core operations
#[derive(Error, Debug)]
pub enum ServerError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS listener error
    #[error("TLS error: {0}")]
    Tls(#[from] tls_core::TlsError),

    /// The broker could not generate its bidirectional sentinel key.
    #[error("generating random bidirectional sentinel key: {0}")]
    SentinelKey(String),

    /// The broker's event dispatcher was started twice.
    #[error("broker is already running")]
    AlreadyRunning,

    /// No usable address could be found for callback help lines.
    #[error("no interfaces have addresses")]
    NoAddresses,

    /// One-shell mode closed the listener after the first session ended.
    ///
    /// This is a sentinel, not a failure: the caller should treat it as a
    /// normal exit.
    #[error("one-shell mode: listener closed")]
    OneShellClosed,
}

/// Result type alias for server-core operations
pub type ServerResult<T> = Result<T, ServerError>;
