use anyhow::{
    Error,
    Result,
};

/// The parts of a WebSocket URL needed to open a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketUrl {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    /// Path and query string, sent in the request line.
    pub resource: String,
}

impl WebSocketUrl {
    /// The value of the `Host` header.
    pub fn host_header(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parses a `ws://` or `wss://` URL.
///
/// Default ports are 80 and 443. Fragments are not allowed in WebSocket URLs.
pub fn parse_url(url: &str) -> Result<WebSocketUrl> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| Error::msg(format!("invalid url '{url}'")))?;
    let secure = match scheme.to_lowercase().as_str() {
        "ws" => false,
        "wss" => true,
        _ => {
            return Err(Error::msg(format!(
                "invalid scheme '{scheme}' for websocket url (must be 'ws' or 'wss')"
            )));
        }
    };
    if rest.contains('#') {
        return Err(Error::msg("invalid url: fragment identifier not allowed"));
    }

    let (authority, resource) = match rest.find(['/', '?']) {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    let resource = if resource.is_empty() {
        "/".to_owned()
    } else if resource.starts_with('?') {
        format!("/{resource}")
    } else {
        resource.to_owned()
    };

    let (host, port) = if let Some(after) = authority.strip_prefix('[') {
        let (host, after) = after
            .split_once(']')
            .ok_or_else(|| Error::msg(format!("invalid host in url '{url}'")))?;
        (host, after.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    if host.is_empty() {
        return Err(Error::msg(format!("missing host in url '{url}'")));
    }
    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| Error::msg(format!("invalid port '{port}' in url '{url}'")))?,
        None if secure => 443,
        None => 80,
    };

    Ok(WebSocketUrl {
        secure,
        host: host.to_owned(),
        port,
        resource,
    })
}
