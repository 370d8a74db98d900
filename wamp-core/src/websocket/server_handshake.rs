use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use base64::Engine;
use bytes::BytesMut;
use log::{
    debug,
    warn,
};
use regex::Regex;
use sha1::{
    Digest,
    Sha1,
};
use thiserror::Error;
use tokio::io::{
    AsyncRead,
    AsyncReadExt,
    AsyncWrite,
    AsyncWriteExt,
};

use crate::{
    core::types::HashMap,
    websocket::{
        compression::PerMessageCompress,
        connection::{
            ConnectionCounter,
            Handshake,
            WebSocketConnection,
        },
        error::WebSocketError,
        http::{
            Extension,
            HttpHead,
            error_response,
            find_head_end,
            parse_extensions,
        },
        options::ServerOptions,
        protocol::{
            ProtocolConfig,
            WebSocketProtocol,
        },
    },
};

/// The GUID appended to the client key when computing the accept value.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const FLASH_POLICY_REQUEST: &[u8] = b"<policy-file-request/>\0";
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Computes the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// A validated WebSocket opening handshake request.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRequest {
    /// The peer address, after applying trusted `X-Forwarded-For` hops.
    pub peer: String,
    /// All request headers, keyed by lowercase name.
    pub headers: HashMap<String, String>,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub params: HashMap<String, Vec<String>>,
    pub version: u32,
    pub origin: Option<String>,
    /// Requested subprotocols, in order of preference.
    pub protocols: Vec<String>,
    /// Extensions offered by the client.
    pub extensions: Vec<Extension>,
}

/// How the application accepts a connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionAccept {
    /// The selected subprotocol, which must be one of the requested ones.
    pub protocol: Option<String>,
    /// Extra headers on the handshake response.
    pub headers: Vec<(String, String)>,
}

/// Error for denying a connection with a specific HTTP status.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct ConnectionDeny {
    pub code: u16,
    pub reason: String,
}

impl ConnectionDeny {
    pub const BAD_REQUEST: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const NOT_ACCEPTABLE: u16 = 406;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;

    pub fn new<S>(code: u16, reason: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Decides whether a validated request is accepted.
///
/// Returning a [`ConnectionDeny`] error responds with its status. Any other error responds with
/// 500.
#[async_trait]
pub trait ConnectHandler: Send + Sync {
    async fn on_connect(&self, request: &ConnectionRequest) -> Result<ConnectionAccept>;
}

/// Accepts every connection without a subprotocol.
#[derive(Debug, Default)]
pub struct AcceptAll;

#[async_trait]
impl ConnectHandler for AcceptAll {
    async fn on_connect(&self, _: &ConnectionRequest) -> Result<ConnectionAccept> {
        Ok(ConnectionAccept::default())
    }
}

/// An opening handshake that cannot proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Fail the handshake with an HTTP error.
    Fail {
        status: u16,
        reason: String,
        headers: Vec<(String, String)>,
    },
    /// A plain HTTP request, answered with the status page.
    StatusPage,
}

impl Rejection {
    fn fail<S>(status: u16, reason: S) -> Self
    where
        S: Into<String>,
    {
        Self::Fail {
            status,
            reason: reason.into(),
            headers: Vec::new(),
        }
    }
}

fn single_header<'h>(head: &'h HttpHead, key: &str, name: &str) -> Result<Option<&'h str>, Rejection> {
    if head.count(key) > 1 {
        return Err(Rejection::fail(
            400,
            format!("HTTP {name} header appears more than once in opening handshake request"),
        ));
    }
    Ok(head.header(key))
}

fn parse_query(query: &str) -> HashMap<String, Vec<String>> {
    let mut params = HashMap::<String, Vec<String>>::default();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(key.to_owned())
            .or_default()
            .push(value.to_owned());
    }
    params
}

/// Converts origin wildcard patterns to regular expressions, where `*` matches anything.
pub fn origin_patterns(origins: &[String]) -> Result<Vec<Regex>> {
    origins
        .iter()
        .map(|origin| {
            let pattern = format!("^{}$", regex::escape(origin).replace(r"\*", ".*"));
            Regex::new(&pattern).map_err(Error::new)
        })
        .collect()
}

/// Normalizes an origin to `scheme://host:port`.
///
/// Returns `None` for the null origin, which includes `file:` origins.
fn normalize_origin(origin: &str) -> Result<Option<String>, Rejection> {
    let lower = origin.to_lowercase();
    if lower == "null" || lower.starts_with("file:") {
        return Ok(None);
    }
    let invalid = || Rejection::fail(400, format!("invalid origin '{origin}'"));
    let (scheme, rest) = lower.split_once("://").ok_or_else(invalid)?;
    let default_port = match scheme {
        "http" | "ws" => 80,
        "https" | "wss" => 443,
        _ => return Err(invalid()),
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let (host, port) = match authority.strip_prefix('[') {
        Some(after) => {
            let (host, after) = after.split_once(']').ok_or_else(invalid)?;
            (host, after.strip_prefix(':'))
        }
        None => match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        },
    };
    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
        None => default_port,
    };
    if host.is_empty() {
        return Err(invalid());
    }
    Ok(Some(format!("{scheme}://{host}:{port}")))
}

fn check_key(key: &str) -> Result<(), Rejection> {
    if key.len() != 24 {
        return Err(Rejection::fail(
            400,
            format!("bad Sec-WebSocket-Key (length must be 24 ASCII chars) '{key}'"),
        ));
    }
    if !key.ends_with("==") {
        return Err(Rejection::fail(
            400,
            format!("bad Sec-WebSocket-Key (invalid base64 encoding) '{key}'"),
        ));
    }
    if let Some(c) = key[..22]
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '+' || *c == '/'))
    {
        return Err(Rejection::fail(
            400,
            format!("bad character '{c}' in Sec-WebSocket-Key (invalid base64 encoding) '{key}'"),
        ));
    }
    Ok(())
}

/// Validates an opening handshake request.
///
/// Returns the request and the client key.
pub fn check_request(
    head: &HttpHead,
    peer: &str,
    options: &ServerOptions,
    origins: &[Regex],
) -> Result<(ConnectionRequest, String), Rejection> {
    let parts = head.status_line.split_whitespace().collect::<Vec<_>>();
    if parts.len() != 3 {
        return Err(Rejection::fail(
            400,
            format!("Bad HTTP request status line '{}'", head.status_line),
        ));
    }
    if parts[0] != "GET" {
        return Err(Rejection::fail(
            405,
            format!("HTTP method '{}' not allowed", parts[0]),
        ));
    }
    if parts[2] != "HTTP/1.1" {
        return Err(Rejection::fail(
            505,
            format!("Unsupported HTTP version '{}'", parts[2]),
        ));
    }

    let uri = parts[1];
    if uri.contains('#') {
        return Err(Rejection::fail(
            400,
            format!("HTTP requested resource contains a fragment identifier '{uri}'"),
        ));
    }
    let (path, query) = uri.split_once('?').unwrap_or((uri, ""));

    let mut request = ConnectionRequest {
        peer: peer.to_owned(),
        headers: head.headers().clone(),
        path: path.to_owned(),
        params: parse_query(query),
        ..Default::default()
    };

    if options.trust_x_forwarded_for > 0 {
        if let Some(forwarded) = head.header("x-forwarded-for") {
            let addresses = forwarded.split(',').map(|s| s.trim()).collect::<Vec<_>>();
            let i = addresses.len().saturating_sub(options.trust_x_forwarded_for);
            if let Some(address) = addresses.get(i).filter(|address| !address.is_empty()) {
                request.peer = (*address).to_owned();
            }
        }
    }

    let host = single_header(head, "host", "Host")?.ok_or_else(|| {
        Rejection::fail(400, "HTTP Host header missing in opening handshake request")
    })?;
    let (host_name, port) = match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() && !port.contains(']') => {
            let port = port.parse::<u16>().map_err(|_| {
                Rejection::fail(
                    400,
                    format!("invalid port '{port}' in HTTP Host header '{host}'"),
                )
            })?;
            (name, port)
        }
        _ => (host, 80),
    };
    request.host = host_name.to_owned();
    request.port = port;

    if head.header("upgrade").is_none() {
        if options.web_status {
            return Err(Rejection::StatusPage);
        }
        return Err(Rejection::fail(426, "HTTP Upgrade header missing"));
    }
    if !head.has_token("upgrade", "websocket") {
        return Err(Rejection::fail(
            400,
            format!(
                "HTTP Upgrade headers do not include 'websocket' value (case-insensitive) : {}",
                head.header("upgrade").unwrap_or_default()
            ),
        ));
    }
    match head.header("connection") {
        None => return Err(Rejection::fail(400, "HTTP Connection header missing")),
        Some(connection) if !head.has_token("connection", "upgrade") => {
            return Err(Rejection::fail(
                400,
                format!(
                    "HTTP Connection headers do not include 'upgrade' value (case-insensitive) : {connection}"
                ),
            ));
        }
        Some(_) => (),
    }

    let version = single_header(head, "sec-websocket-version", "Sec-WebSocket-Version")?
        .ok_or_else(|| {
            Rejection::fail(
                400,
                "WebSocket connection denied - Hixie76 protocol not supported.",
            )
        })?;
    let version = version.parse::<u32>().map_err(|_| {
        Rejection::fail(
            400,
            format!(
                "could not parse HTTP Sec-WebSocket-Version header '{version}' in opening handshake request"
            ),
        )
    })?;
    if !options.versions.contains(&version) {
        let mut supported = options.versions.clone();
        supported.sort_unstable_by(|a, b| b.cmp(a));
        let supported = supported
            .iter()
            .map(|version| version.to_string())
            .collect::<Vec<_>>()
            .join(",");
        return Err(Rejection::Fail {
            status: 400,
            reason: format!(
                "WebSocket version {version} not supported (supported versions: {supported})"
            ),
            headers: Vec::from_iter([("Sec-WebSocket-Version".to_owned(), supported)]),
        });
    }
    request.version = version;

    if let Some(protocols) =
        single_header(head, "sec-websocket-protocol", "Sec-WebSocket-Protocol")?
    {
        for protocol in protocols.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
            if request.protocols.iter().any(|existing| existing == protocol) {
                return Err(Rejection::fail(
                    400,
                    format!(
                        "duplicate protocol '{protocol}' specified in HTTP Sec-WebSocket-Protocol header"
                    ),
                ));
            }
            request.protocols.push(protocol.to_owned());
        }
    }

    let origin_key = if version < 13 {
        "sec-websocket-origin"
    } else {
        "origin"
    };
    if let Some(origin) = single_header(head, origin_key, "Origin")? {
        request.origin = Some(origin.to_owned());
        match normalize_origin(origin) {
            Ok(None) => {
                if !options.allow_null_origin {
                    return Err(Rejection::fail(
                        403,
                        format!("WebSocket connection denied: origin '{origin}' not allowed"),
                    ));
                }
            }
            Ok(Some(normalized)) => {
                if !origins.iter().any(|pattern| pattern.is_match(&normalized)) {
                    return Err(Rejection::fail(
                        403,
                        format!("WebSocket connection denied: origin '{origin}' not allowed"),
                    ));
                }
            }
            Err(_) if options.allowed_origins.iter().any(|origin| origin == "*") => (),
            Err(rejection) => return Err(rejection),
        }
    }

    let key = single_header(head, "sec-websocket-key", "Sec-WebSocket-Key")?
        .ok_or_else(|| Rejection::fail(400, "HTTP Sec-WebSocket-Key header missing"))?;
    check_key(key)?;

    if let Some(extensions) =
        single_header(head, "sec-websocket-extensions", "Sec-WebSocket-Extensions")?
    {
        request.extensions = parse_extensions(extensions);
    }

    Ok((request, key.to_owned()))
}

/// Builds the `101 Switching Protocols` response.
pub fn switching_protocols_response(
    options: &ServerOptions,
    accept: &ConnectionAccept,
    key: &str,
    extensions: &[String],
) -> String {
    let mut response = "HTTP/1.1 101 Switching Protocols\r\n".to_owned();
    if !options.server.is_empty() {
        response.push_str(&format!("Server: {}\r\n", options.server));
    }
    response.push_str("Upgrade: WebSocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    for (key, value) in options.headers.iter().chain(accept.headers.iter()) {
        response.push_str(&format!("{key}: {value}\r\n"));
    }
    if let Some(protocol) = &accept.protocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }
    response.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept_key(key)));
    if !extensions.is_empty() {
        response.push_str(&format!(
            "Sec-WebSocket-Extensions: {}\r\n",
            extensions.join(", ")
        ));
    }
    response.push_str("\r\n");
    response
}

/// Builds the status page served to plain HTTP requests.
pub fn status_page_response(options: &ServerOptions) -> String {
    let body = format!(
        "<!DOCTYPE html>\n<html>\n<body>\n<h1>{}</h1>\n<p>This is a WebSocket endpoint. Connect to it with a WebSocket client.</p>\n</body>\n</html>\n",
        options.server
    );
    let mut response = "HTTP/1.1 200 OK\r\n".to_owned();
    if !options.server.is_empty() {
        response.push_str(&format!("Server: {}\r\n", options.server));
    }
    response.push_str("Content-Type: text/html; charset=UTF-8\r\n");
    response.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    response.push_str(&body);
    response
}

async fn read_head<S>(stream: &mut S, options: &ServerOptions) -> Result<Option<(HttpHead, Vec<u8>)>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(4096);
    loop {
        if let Some(end) = find_head_end(&buffer) {
            let head = HttpHead::parse(&buffer[..end]);
            return Ok(Some((head, buffer[end..].to_vec())));
        }
        if options.serve_flash_socket_policy
            && buffer
                .windows(FLASH_POLICY_REQUEST.len())
                .any(|window| window == FLASH_POLICY_REQUEST)
        {
            debug!("Serving Flash socket policy");
            stream
                .write_all(options.flash_socket_policy.as_bytes())
                .await?;
            stream.flush().await?;
            return Ok(None);
        }
        if buffer.len() > MAX_HEAD_SIZE {
            let reason = "HTTP request head too large";
            stream
                .write_all(error_response(400, reason, &[]).as_bytes())
                .await?;
            return Err(WebSocketError::handshake(400, reason).into());
        }
        if stream.read_buf(&mut buffer).await? == 0 {
            return Err(WebSocketError::handshake(
                400,
                "connection closed during opening handshake",
            )
            .into());
        }
    }
}

async fn fail<S>(stream: &mut S, status: u16, reason: String, headers: &[(String, String)]) -> Error
where
    S: AsyncWrite + Unpin,
{
    warn!("Failing WebSocket opening handshake ({status}): {reason}");
    let response = error_response(status, &reason, headers);
    // The peer may already be gone.
    stream.write_all(response.as_bytes()).await.ok();
    stream.flush().await.ok();
    WebSocketError::handshake(status, reason).into()
}

async fn accept_inner<S>(
    mut stream: S,
    peer: String,
    options: &ServerOptions,
    handler: &dyn ConnectHandler,
    counter: &ConnectionCounter,
) -> Result<Option<WebSocketConnection>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (head, leftover) = match read_head(&mut stream, options).await? {
        Some(head) => head,
        None => return Ok(None),
    };
    let origins = origin_patterns(&options.allowed_origins)?;
    let (request, key) = match check_request(&head, &peer, options, &origins) {
        Ok(request) => request,
        Err(Rejection::StatusPage) => {
            stream
                .write_all(status_page_response(options).as_bytes())
                .await?;
            stream.flush().await?;
            return Ok(None);
        }
        Err(Rejection::Fail {
            status,
            reason,
            headers,
        }) => return Err(fail(&mut stream, status, reason, &headers).await),
    };

    let guard = match counter.try_acquire(options.max_connections) {
        Some(guard) => guard,
        None => {
            return Err(fail(
                &mut stream,
                503,
                "maximum number of connections reached".to_owned(),
                &[],
            )
            .await);
        }
    };

    let mut compress: Option<Box<dyn PerMessageCompress>> = None;
    let mut extensions = Vec::new();
    for negotiator in &options.per_message_compression {
        let offers = request
            .extensions
            .iter()
            .filter(|offer| offer.name == negotiator.extension_name())
            .cloned()
            .collect::<Vec<_>>();
        if offers.is_empty() {
            continue;
        }
        if let Some(accept) = negotiator.accept_offers(&offers) {
            extensions.push(accept.response);
            compress = Some(accept.compress);
            break;
        }
    }

    let accept = match handler.on_connect(&request).await {
        Ok(accept) => accept,
        Err(err) => {
            let (status, reason) = match err.downcast::<ConnectionDeny>() {
                Ok(deny) => (deny.code, deny.reason),
                Err(err) => (500, format!("Internal server error: {err}")),
            };
            return Err(fail(&mut stream, status, reason, &[]).await);
        }
    };
    if let Some(protocol) = &accept.protocol {
        if !request.protocols.contains(protocol) {
            let reason = format!(
                "Internal server error: protocol '{protocol}' accepted must be from the list client sent"
            );
            return Err(fail(&mut stream, 500, reason, &[]).await);
        }
    }

    let response = switching_protocols_response(options, &accept, &key, &extensions);
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    debug!(
        "Accepted WebSocket connection from {} (protocol = {:?})",
        request.peer, accept.protocol
    );

    let protocol = WebSocketProtocol::new(ProtocolConfig::server(options), &request.peer, compress);
    Ok(Some(WebSocketConnection::start(
        stream,
        protocol,
        Handshake {
            peer: request.peer,
            protocol: accept.protocol,
            extensions,
            leftover,
        },
        Some(guard),
    )))
}

/// Runs the server side of the opening handshake on a new stream.
///
/// Returns `None` if the request was answered without upgrading, such as with the status page.
pub async fn accept<S>(
    stream: S,
    peer: String,
    options: &ServerOptions,
    handler: &dyn ConnectHandler,
    counter: &ConnectionCounter,
) -> Result<Option<WebSocketConnection>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handshake = accept_inner(stream, peer, options, handler, counter);
    match options.protocol.open_handshake_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(WebSocketError::Timeout(
                "WebSocket opening handshake timeout (peer did not finish the opening handshake in time)"
                    .to_owned(),
            )
            .into()),
        },
        None => handshake.await,
    }
}
