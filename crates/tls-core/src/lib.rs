//! TLS listener with a self-signed certificate.
//!
//! The listener handshakes with a certificate that is either loaded from a
//! cache file or freshly generated, and exposes the certificate's public-key
//! fingerprint (`base64(SHA-256(DER(SubjectPublicKeyInfo)))`) so callers can
//! pin it, e.g. with `curl --pinnedpubkey 'sha256//<fingerprint>'`.

mod archive;
mod cert;
mod listener;

pub use archive::{load_cached_certificate, save_certificate};
pub use cert::{
    generate_self_signed, get_certificate, pubkey_fingerprint, CertifiedPair,
    DEFAULT_LIFESPAN, DEFAULT_SUBJECT,
};
pub use listener::Listener;

use thiserror::Error;

/// Errors that can occur while setting up or running the TLS listener.
#[derive(Error, Debug)]
pub enum TlsError {
    /// The certificate cache file exists but is unusable.
    #[error("certificate cache file corrupt: {0}")]
    CertFileCorrupt(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate generation failed.
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    /// rustls rejected the certificate or configuration.
    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),

    /// A certificate could not be parsed.
    #[error("certificate parse error: {0}")]
    CertParse(String),
}

/// Result type alias for tls-core operations
pub type TlsResult<T> = Result<T, TlsError>;
