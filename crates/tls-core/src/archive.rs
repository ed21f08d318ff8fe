//! Certificate cache file reading and writing.
//!
//! The cache is a small textual archive holding two named sections, `cert`
//! and `key`, each PEM, behind a comment line recording when the pair was
//! generated. The format is trivially inspectable with a pager and easy to
//! copy between hosts.

use std::{
    fs,
    io::Write,
    os::unix::fs::{DirBuilderExt, OpenOptionsExt},
    path::Path,
};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::{cert::CertifiedPair, pubkey_fingerprint, TlsError, TlsResult};

/// Section names inside the archive.
const CERT_SECTION: &str = "cert";
const KEY_SECTION: &str = "key";

/// Load a certificate previously written by [`save_certificate`].
pub fn load_cached_certificate(cert_file: &Path) -> TlsResult<CertifiedPair> {
    let raw = fs::read_to_string(cert_file)?;

    enum Section {
        Preamble,
        Cert,
        Key,
        Other,
    }

    let mut cert_pem = String::new();
    let mut key_pem = String::new();
    let mut section = Section::Preamble;
    for line in raw.lines() {
        if let Some(name) = section_name(line) {
            section = match name {
                CERT_SECTION => Section::Cert,
                KEY_SECTION => Section::Key,
                _ => Section::Other,
            };
            continue;
        }
        let target = match section {
            Section::Cert => &mut cert_pem,
            Section::Key => &mut key_pem,
            Section::Preamble | Section::Other => continue,
        };
        target.push_str(line);
        target.push('\n');
    }

    if cert_pem.is_empty() {
        return Err(TlsError::CertFileCorrupt(format!(
            "{}: PEM-encoded certificate missing",
            cert_file.display()
        )));
    }
    if key_pem.is_empty() {
        return Err(TlsError::CertFileCorrupt(format!(
            "{}: PEM-encoded key missing",
            cert_file.display()
        )));
    }

    parse_pair(cert_file, cert_pem, key_pem)
}

/// Save PEM-encoded certificate and key to `cert_file`.
///
/// Parent directories are created as needed with 0700 permissions; the file
/// itself is written 0600 since it holds the private key.
pub fn save_certificate(cert_file: &Path, cert_pem: &str, key_pem: &str) -> TlsResult<()> {
    if let Some(dir) = cert_file.parent() {
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(cert_file)?;
    write!(
        f,
        "Generated {}\n-- {CERT_SECTION} --\n{}-- {KEY_SECTION} --\n{}",
        chrono::Utc::now().to_rfc3339(),
        ensure_trailing_newline(cert_pem),
        ensure_trailing_newline(key_pem),
    )?;

    Ok(())
}

/// Parse a `-- name --` section marker.
fn section_name(line: &str) -> Option<&str> {
    let name = line.strip_prefix("-- ")?.strip_suffix(" --")?;
    (!name.is_empty()).then_some(name)
}

fn ensure_trailing_newline(s: &str) -> String {
    if s.ends_with('\n') {
        s.to_string()
    } else {
        format!("{s}\n")
    }
}

/// Turn the two PEM sections back into a usable key pair.
fn parse_pair(cert_file: &Path, cert_pem: String, key_pem: String) -> TlsResult<CertifiedPair> {
    let cert_der: CertificateDer<'static> =
        rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .transpose()
            .map_err(|e| corrupt(cert_file, &format!("bad certificate PEM: {e}")))?
            .ok_or_else(|| corrupt(cert_file, "no certificate in cert section"))?;

    let key_der: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| corrupt(cert_file, &format!("bad key PEM: {e}")))?
            .ok_or_else(|| corrupt(cert_file, "no private key in key section"))?;

    // Parsing the fingerprint doubles as a sanity check on the certificate.
    pubkey_fingerprint(&cert_der)
        .map_err(|e| corrupt(cert_file, &format!("unparseable certificate: {e}")))?;

    Ok(CertifiedPair {
        cert_pem,
        key_pem,
        cert_der,
        key_der,
    })
}

fn corrupt(cert_file: &Path, why: &str) -> TlsError {
    TlsError::CertFileCorrupt(format!("{}: {why}", cert_file.display()))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::cert::{generate_self_signed, get_certificate, DEFAULT_LIFESPAN};

    #[test]
    fn save_load_round_trip_preserves_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.txtar");

        let pair = generate_self_signed("test", &[], &[], DEFAULT_LIFESPAN).unwrap();
        save_certificate(&path, &pair.cert_pem, &pair.key_pem).unwrap();

        let loaded = load_cached_certificate(&path).unwrap();
        assert_eq!(
            pair.fingerprint().unwrap(),
            loaded.fingerprint().unwrap(),
        );
    }

    #[test]
    fn get_certificate_caches_and_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("cert.txtar");

        let first = get_certificate("test", &[], &[], DEFAULT_LIFESPAN, Some(&path)).unwrap();
        let second = get_certificate("test", &[], &[], DEFAULT_LIFESPAN, Some(&path)).unwrap();
        assert_eq!(
            first.fingerprint().unwrap(),
            second.fingerprint().unwrap(),
            "second call must load the cached pair",
        );
    }

    #[test]
    fn cache_file_has_restrictive_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("cert.txtar");

        get_certificate("test", &[], &[], DEFAULT_LIFESPAN, Some(&path)).unwrap();

        let file_mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    fn archive_missing_key_section_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.txtar");

        let pair = generate_self_signed("test", &[], &[], DEFAULT_LIFESPAN).unwrap();
        fs::write(
            &path,
            format!("Generated sometime\n-- cert --\n{}", pair.cert_pem),
        )
        .unwrap();

        match load_cached_certificate(&path) {
            Err(TlsError::CertFileCorrupt(msg)) => assert!(msg.contains("key missing")),
            other => panic!("expected CertFileCorrupt, got {other:?}"),
        }
    }

    #[test]
    fn archive_with_garbage_pem_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.txtar");
        fs::write(&path, "-- cert --\nnot pem\n-- key --\nalso not pem\n").unwrap();

        assert!(matches!(
            load_cached_certificate(&path),
            Err(TlsError::CertFileCorrupt(_))
        ));
    }

    #[test]
    fn missing_file_is_not_found_not_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.txtar");
        match load_cached_certificate(&path) {
            Err(TlsError::Io(err)) => {
                assert_eq!(err.kind(), std::io::ErrorKind::NotFound)
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
