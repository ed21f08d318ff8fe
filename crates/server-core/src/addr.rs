//! Listen-address enumeration for operator help lines.

use std::{
    cmp::Ordering,
    net::{IpAddr, SocketAddr},
};

use crate::{ServerError, ServerResult};

/// All the `host:port` strings a target could plausibly reach us on.
///
/// A wildcard listen address is expanded to every non-loopback interface
/// address (IPv6 only when `ipv6` is set); an explicit address is used as-is.
/// `extra` entries are merged in, gaining the listen port when they don't
/// carry one. The result is sorted and de-duplicated: non-address strings
/// first (lexicographically), then addresses by (address, port) with IPv4
/// before IPv6.
pub fn listen_addresses(
    listen: SocketAddr,
    extra: &[String],
    ipv6: bool,
) -> ServerResult<Vec<String>> {
    let port = listen.port();
    let mut out = Vec::new();

    if listen.ip().is_unspecified() {
        let ifas = local_ip_address::list_afinet_netifas()
            .map_err(|e| ServerError::Io(std::io::Error::other(e)))?;
        for (_name, ip) in ifas {
            if ip.is_loopback() {
                continue;
            }
            if ip.is_ipv6() && !ipv6 {
                continue;
            }
            out.push(SocketAddr::new(ip, port).to_string());
        }
    } else {
        out.push(listen.to_string());
    }

    for a in extra {
        out.push(with_port(a, port));
    }

    out.sort_by(|a, b| cmp_addr(a, b));
    out.dedup();

    if out.is_empty() {
        return Err(ServerError::NoAddresses);
    }

    Ok(out)
}

/// Append the listen port to an address which doesn't already carry one.
fn with_port(addr: &str, port: u16) -> String {
    if addr.parse::<SocketAddr>().is_ok() {
        return addr.to_string();
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return SocketAddr::new(ip, port).to_string();
    }
    match addr.rsplit_once(':') {
        Some((name, p)) if !name.contains(':') && p.parse::<u16>().is_ok() => addr.to_string(),
        _ => format!("{addr}:{port}"),
    }
}

/// Non-parseable strings sort lexicographically first; then parseable
/// addresses by (address, port) with IPv4 before IPv6.
fn cmp_addr(a: &str, b: &str) -> Ordering {
    match (a.parse::<SocketAddr>(), b.parse::<SocketAddr>()) {
        (Err(_), Err(_)) => a.cmp(b),
        (Err(_), Ok(_)) => Ordering::Less,
        (Ok(_), Err(_)) => Ordering::Greater,
        (Ok(sa), Ok(sb)) => cmp_ip(sa.ip(), sb.ip()).then(sa.port().cmp(&sb.port())),
    }
}

fn cmp_ip(a: IpAddr, b: IpAddr) -> Ordering {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets().cmp(&b.octets()),
        (IpAddr::V6(a), IpAddr::V6(b)) => a.octets().cmp(&b.octets()),
        (IpAddr::V4(_), IpAddr::V6(_)) => Ordering::Less,
        (IpAddr::V6(_), IpAddr::V4(_)) => Ordering::Greater,
    }
}
