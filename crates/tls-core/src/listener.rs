//! TCP listener wrapper that handshakes TLS with the self-signed certificate.

use std::{net::SocketAddr, net::IpAddr, path::Path, sync::Arc, time::Duration};

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::{cert, TlsResult};

/// Listens for TLS connections and handshakes with a self-signed certificate.
///
/// The fingerprint is the sole shared secret between the operator and the
/// target: anyone who can pin it can trust the connection despite the
/// certificate being self-signed.
pub struct Listener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
    fingerprint: String,
}

impl Listener {
    /// Bind `address` and prepare to handshake with the certificate from
    /// `cert_file`, generating (and caching) one if the file doesn't exist.
    ///
    /// `subject` and `lifespan` only matter when a certificate is generated;
    /// pass empty SAN slices for a bare-bones certificate.
    pub async fn bind(
        address: &str,
        subject: &str,
        lifespan: Duration,
        cert_file: Option<&Path>,
        dns_names: &[String],
        ip_addresses: &[IpAddr],
    ) -> TlsResult<Self> {
        let pair = cert::get_certificate(subject, dns_names, ip_addresses, lifespan, cert_file)?;
        let fingerprint = pair.fingerprint()?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![pair.cert_der], pair.key_der)?;
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let inner = TcpListener::bind(address).await?;

        Ok(Self {
            inner,
            acceptor,
            fingerprint,
        })
    }

    /// Accept the next TCP connection.
    ///
    /// The TLS handshake is left to the caller (via [`Listener::acceptor`]) so
    /// slow handshakes can be moved off the accept loop.
    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }

    /// The acceptor which upgrades accepted connections to TLS.
    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }

    /// The address we're actually listening on.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Base64-encoded SHA-256 hash of the certificate's public key, suitable
    /// for `curl --pinnedpubkey 'sha256//<fingerprint>'`.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::DEFAULT_LIFESPAN;

    #[tokio::test]
    async fn bind_reports_os_assigned_port() {
        let l = Listener::bind("127.0.0.1:0", "test", DEFAULT_LIFESPAN, None, &[], &[])
            .await
            .unwrap();
        assert_ne!(l.local_addr().unwrap().port(), 0);
        assert!(!l.fingerprint().is_empty());
    }

    #[tokio::test]
    async fn fingerprint_matches_cached_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.txtar");

        let a = Listener::bind(
            "127.0.0.1:0",
            "test",
            DEFAULT_LIFESPAN,
            Some(&path),
            &[],
            &[],
        )
        .await
        .unwrap();
        let b = Listener::bind(
            "127.0.0.1:0",
            "test",
            DEFAULT_LIFESPAN,
            Some(&path),
            &[],
            &[],
        )
        .await
        .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
