//! Callback bootstrap script generation.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Extension,
};
use tracing::Instrument;

use crs_types::Color;

use super::{remote_host, request_span, ConnMeta, HandlerState};

/// The built-in callback script, used when no template file is configured.
pub const DEFAULT_TEMPLATE: &str = include_str!("script.tmpl");

/// URL parameter or header which may be set in requests to `/c` to give the
/// URL to which to call back.
const C2_PARAM: &str = "c2";

/// Default HTTPS port, not appended to SNI-derived callback URLs.
const HTTPS_PORT: u16 = 443;

/// Values substituted into the callback template.
struct TemplateParams {
    fingerprint: String,
    url: String,
    id: String,
}

/// `GET /c`: serve up a script for calling us back.
pub(crate) async fn script_handler(
    State(state): State<Arc<HandlerState>>,
    Extension(meta): Extension<ConnMeta>,
    req: Request,
) -> Response {
    let (parts, _) = req.into_parts();
    let span = request_span(&meta, &parts, None);
    let peer = remote_host(&meta.peer);

    async move {
        let url = match c2_url(&parts, meta.sni.as_deref(), state.listen_port) {
            Ok(url) => url,
            Err(why) => {
                tracing::error!(error = %why, "Could not determine callback URL");
                state
                    .r_error(&peer, format!("Could not determine callback URL: {why}"))
                    .await;
                return (StatusCode::BAD_REQUEST, "Huh?\n").into_response();
            }
        };

        // The template file is re-read every request so the operator can
        // iterate on it while we run.
        let template = match &state.template_file {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(t) => t,
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        path = %path.display(),
                        "Failed to read callback template",
                    );
                    state
                        .r_error(
                            &peer,
                            format!(
                                "Failed to read callback template {}: {}",
                                path.display(),
                                err,
                            ),
                        )
                        .await;
                    return (StatusCode::INTERNAL_SERVER_ERROR, "Bother.\n").into_response();
                }
            },
            None => DEFAULT_TEMPLATE.to_string(),
        };

        let params = TemplateParams {
            fingerprint: state.fingerprint.clone(),
            url,
            id: random_id(),
        };
        let body = render(&template, &params);

        tracing::info!(id = %params.id, url = %params.url, "Sent script");
        state
            .r_log(
                Color::Cyan,
                &peer,
                format!("Sent script: ID:{} URL:{}", params.id, params.url),
            )
            .await;

        body.into_response()
    }
    .instrument(span)
    .await
}

/// Substitute the template's placeholders.
fn render(template: &str, params: &TemplateParams) -> String {
    template
        .replace("{{FINGERPRINT}}", &params.fingerprint)
        .replace("{{URL}}", &params.url)
        .replace("{{ID}}", &params.id)
}

/// A fresh random session ID: a base36-encoded random 64-bit number.
fn random_id() -> String {
    base36(rand::random::<u64>())
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Work out where the script should call back to.
///
/// We try a query parameter, a `c2:` header, the (punycoded) `Host:` header,
/// and the SNI, in that order. The listen port is appended to SNI-derived
/// URLs when it isn't the default HTTPS port.
fn c2_url(parts: &Parts, sni: Option<&str>, listen_port: u16) -> Result<String, String> {
    if let Some(query) = parts.uri.query() {
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            if k == C2_PARAM && !v.is_empty() {
                return Ok(v.into_owned());
            }
        }
    }

    if let Some(v) = parts
        .headers
        .get(C2_PARAM)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Ok(v.to_string());
    }

    if let Some(host) = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return punycode_host(host);
    }

    // No Host header. Probably HTTP/1.0. Try the SNI.
    if let Some(name) = sni.filter(|s| !s.is_empty()) {
        if listen_port != HTTPS_PORT {
            return Ok(format!("{name}:{listen_port}"));
        }
        return Ok(name.to_string());
    }

    Err("out of ideas".to_string())
}

/// Punycode the name part of a possibly-`host:port` string.
fn punycode_host(host: &str) -> Result<String, String> {
    if host.is_ascii() {
        return Ok(host.to_string());
    }
    let (name, port) = match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            (name, Some(port))
        }
        _ => (host, None),
    };
    let parsed =
        url::Host::parse(name).map_err(|e| format!("punycoding {host}: {e}"))?;
    Ok(match port {
        Some(port) => format!("{parsed}:{port}"),
        None => parsed.to_string(),
    })
}
