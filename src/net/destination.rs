use crate::utils::error::{Result, SockPoolError};
use std::fmt;
use std::str::FromStr;

/// Unix-domain destinations name a filesystem path and skip host/port parsing.
const UNIX_LITERAL_PREFIXES: [&str; 2] = ["unix://", "udg://"];

/// Transport schemes a destination may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tcp,
    Udp,
    Unix,
    Udg,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Udp => "udp",
            Scheme::Unix => "unix",
            Scheme::Udg => "udg",
        }
    }

    /// Datagram schemes have no stream to peek for a closed peer.
    pub fn is_datagram(&self) -> bool {
        matches!(self, Scheme::Udp | Scheme::Udg)
    }
}

impl FromStr for Scheme {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Scheme::Tcp),
            "udp" => Ok(Scheme::Udp),
            "unix" => Ok(Scheme::Unix),
            "udg" => Ok(Scheme::Udg),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical pool lookup key for a destination.
///
/// Either `scheme://host:port` with lowercase scheme and host, or a `unix://`/`udg://`
/// URI kept exactly as the caller wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedKey(String);

impl NormalizedKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scheme(&self) -> Scheme {
        self.0
            .split_once("://")
            .and_then(|(scheme, _)| scheme.parse().ok())
            // Only normalize() constructs keys, and it only accepts known schemes.
            .unwrap_or(Scheme::Tcp)
    }

    /// Everything after `scheme://`: `host:port`, or the socket path for unix keys.
    pub fn target(&self) -> &str {
        self.0
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for NormalizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NormalizedKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn is_unix_literal(uri: &str) -> bool {
    UNIX_LITERAL_PREFIXES.iter().any(|literal| {
        uri.get(..literal.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(literal))
    })
}

/// Validate a connection target and reduce it to its pool key.
pub fn normalize(uri: &str) -> Result<NormalizedKey> {
    if is_unix_literal(uri) {
        return Ok(NormalizedKey(uri.to_string()));
    }

    let (scheme, authority) = uri
        .split_once("://")
        .ok_or_else(|| SockPoolError::invalid_destination(uri, "missing scheme"))?;

    if scheme.is_empty() {
        return Err(SockPoolError::invalid_destination(uri, "missing scheme"));
    }
    let scheme: Scheme = scheme.parse().map_err(|_| {
        SockPoolError::invalid_destination(
            uri,
            format!("unsupported scheme {scheme:?}, expected tcp, udp, unix or udg"),
        )
    })?;

    if authority.contains('@') {
        return Err(SockPoolError::invalid_destination(uri, "user info is not allowed"));
    }
    if authority.contains('?') {
        return Err(SockPoolError::invalid_destination(uri, "query string is not allowed"));
    }
    if authority.contains('#') {
        return Err(SockPoolError::invalid_destination(uri, "fragment is not allowed"));
    }
    if authority.contains('/') {
        return Err(SockPoolError::invalid_destination(uri, "path is not allowed"));
    }

    let (host, port) = split_host_port(uri, authority)?;
    let port = parse_port(uri, port)?;

    Ok(NormalizedKey(format!(
        "{}://{}:{}",
        scheme,
        host.to_ascii_lowercase(),
        port
    )))
}

fn split_host_port<'a>(uri: &str, authority: &'a str) -> Result<(&'a str, &'a str)> {
    let (host, port) = if authority.starts_with('[') {
        let end = authority
            .find(']')
            .ok_or_else(|| SockPoolError::invalid_destination(uri, "unterminated IPv6 host"))?;
        let (host, rest) = authority.split_at(end + 1);
        if host.len() <= 2 {
            return Err(SockPoolError::invalid_destination(uri, "missing host"));
        }
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| SockPoolError::invalid_destination(uri, "missing port"))?;
        (host, port)
    } else {
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| SockPoolError::invalid_destination(uri, "missing port"))?;
        if host.contains(':') {
            return Err(SockPoolError::invalid_destination(
                uri,
                "IPv6 hosts must be enclosed in brackets",
            ));
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(SockPoolError::invalid_destination(uri, "missing host"));
    }
    if host.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(SockPoolError::invalid_destination(uri, "malformed host"));
    }

    Ok((host, port))
}

fn parse_port(uri: &str, port: &str) -> Result<u16> {
    if port.is_empty() {
        return Err(SockPoolError::invalid_destination(uri, "missing port"));
    }
    if !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SockPoolError::invalid_destination(uri, "port is not numeric"));
    }
    match port.parse::<u16>() {
        Ok(0) => Err(SockPoolError::invalid_destination(uri, "port 0 is not allowed")),
        Ok(port) => Ok(port),
        Err(_) => Err(SockPoolError::invalid_destination(uri, "port out of range")),
    }
}
