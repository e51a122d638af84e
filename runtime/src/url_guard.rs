//! SSRF guard: admission policy for any outbound fetch URL.

use std::net::IpAddr;
use thiserror::Error;
use url::Url;

use crate::config::SsrfConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("unsupported scheme '{0}', only http/https allowed")]
    UnsupportedScheme(String),
    #[error("no host in URL")]
    MissingHost,
    #[error("disallowed port {0}")]
    DisallowedPort(u16),
    #[error("host '{0}' resolves to a private or loopback address")]
    PrivateAddress(String),
    #[error("host '{0}' is not on the configured allowlist")]
    NotAllowlisted(String),
    #[error("invalid URL: {0}")]
    Unparseable(String),
    #[error("host '{0}' did not resolve to any address")]
    MissingResolution(String),
}

/// Validates a URL against the admission policy. `resolve` is injected so
/// tests can simulate DNS results without touching the network.
pub fn check_url(raw: &str, cfg: &SsrfConfig, resolve: impl Fn(&str) -> Vec<IpAddr>) -> Result<Url, GuardError> {
    let url = Url::parse(raw).map_err(|e| GuardError::Unparseable(e.to_string()))?;

    if !cfg.enabled {
        return Ok(url);
    }

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(GuardError::UnsupportedScheme(other.to_string())),
    }

    if let Some(port) = url.port() {
        if port != 80 && port != 443 {
            return Err(GuardError::DisallowedPort(port));
        }
    }

    let host = url.host_str().ok_or(GuardError::MissingHost)?.to_string();

    if !cfg.allowed_hosts.is_empty() {
        let allowed = cfg
            .allowed_hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(&host));
        if !allowed {
            return Err(GuardError::NotAllowlisted(host));
        }
    }

    let resolved = resolve(&host);
    if resolved.is_empty() {
        return Err(GuardError::MissingResolution(host));
    }
    for addr in resolved {
        if is_private_or_loopback(&addr) {
            return Err(GuardError::PrivateAddress(host));
        }
    }

    Ok(url)
}

/// Real DNS resolution, used outside of tests.
pub fn resolve_host(host: &str) -> Vec<IpAddr> {
    use std::net::ToSocketAddrs;
    format!("{host}:0")
        .to_socket_addrs()
        .map(|it| it.map(|sa| sa.ip()).collect())
        .unwrap_or_default()
}

fn is_private_or_loopback(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.octets()[0] == 169 && v4.octets()[1] == 254
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn loopback(_: &str) -> Vec<IpAddr> {
        vec![IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))]
    }
    fn public(_: &str) -> Vec<IpAddr> {
        vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))]
    }
    fn private_10(_: &str) -> Vec<IpAddr> {
        vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))]
    }
    fn unresolvable(_: &str) -> Vec<IpAddr> {
        vec![]
    }

    #[test]
    fn rejects_loopback() {
        let cfg = SsrfConfig { enabled: true, allowed_hosts: vec![] };
        let err = check_url("http://localhost/x", &cfg, loopback).unwrap_err();
        assert!(matches!(err, GuardError::PrivateAddress(_)));
    }

    #[test]
    fn rejects_private_range() {
        let cfg = SsrfConfig { enabled: true, allowed_hosts: vec![] };
        let err = check_url("http://internal.example/x", &cfg, private_10).unwrap_err();
        assert!(matches!(err, GuardError::PrivateAddress(_)));
    }

    #[test]
    fn rejects_non_http_scheme() {
        let cfg = SsrfConfig { enabled: true, allowed_hosts: vec![] };
        let err = check_url("ftp://example.com/x", &cfg, public).unwrap_err();
        assert!(matches!(err, GuardError::UnsupportedScheme(_)));
    }

    #[test]
    fn rejects_unusual_port() {
        let cfg = SsrfConfig { enabled: true, allowed_hosts: vec![] };
        let err = check_url("http://example.com:8081/x", &cfg, public).unwrap_err();
        assert!(matches!(err, GuardError::DisallowedPort(8081)));
    }

    #[test]
    fn allows_public_host_with_empty_allowlist() {
        let cfg = SsrfConfig { enabled: true, allowed_hosts: vec![] };
        assert!(check_url("https://example.com/x", &cfg, public).is_ok());
    }

    #[test]
    fn enforces_nonempty_allowlist() {
        let cfg = SsrfConfig { enabled: true, allowed_hosts: vec!["allowed.example".to_string()] };
        assert!(check_url("https://allowed.example/x", &cfg, public).is_ok());
        assert!(check_url("https://other.example/x", &cfg, public).is_err());
    }

    #[test]
    fn rejects_host_that_fails_to_resolve() {
        let cfg = SsrfConfig { enabled: true, allowed_hosts: vec![] };
        let err = check_url("http://nowhere.invalid/x", &cfg, unresolvable).unwrap_err();
        assert!(matches!(err, GuardError::MissingResolution(_)));
    }

    #[test]
    fn disabled_guard_passes_everything() {
        let cfg = SsrfConfig { enabled: false, allowed_hosts: vec![] };
        assert!(check_url("http://localhost/x", &cfg, loopback).is_ok());
    }
}
