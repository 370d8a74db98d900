use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use bytes::BytesMut;
use log::debug;
use tokio::{
    io::{
        AsyncRead,
        AsyncReadExt,
        AsyncWrite,
        AsyncWriteExt,
    },
    net::TcpStream,
};

use crate::websocket::{
    compression::PerMessageCompress,
    connection::{
        Handshake,
        WebSocketConnection,
    },
    error::WebSocketError,
    http::{
        HttpHead,
        find_head_end,
        parse_extensions,
    },
    options::ClientOptions,
    protocol::{
        ProtocolConfig,
        WebSocketProtocol,
    },
    server_handshake::accept_key,
    url::{
        WebSocketUrl,
        parse_url,
    },
};

/// A bidirectional byte stream a WebSocket connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Starts TLS on a connected stream, for `wss` URLs.
#[async_trait]
pub trait TlsUpgrader: Send + Sync {
    async fn upgrade(&self, stream: TcpStream, host: &str) -> Result<Box<dyn AsyncStream>>;
}

/// Generates a fresh `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    base64::engine::general_purpose::STANDARD.encode(rand::random::<[u8; 16]>())
}

/// Builds the opening handshake request.
pub fn build_request(url: &WebSocketUrl, options: &ClientOptions, key: &str) -> String {
    let mut request = format!("GET {} HTTP/1.1\r\n", url.resource);
    if !options.user_agent.is_empty() {
        request.push_str(&format!("User-Agent: {}\r\n", options.user_agent));
    }
    request.push_str(&format!("Host: {}\r\n", url.host_header()));
    request.push_str("Upgrade: WebSocket\r\n");
    request.push_str("Connection: Upgrade\r\n");
    request.push_str("Pragma: no-cache\r\n");
    request.push_str("Cache-Control: no-cache\r\n");
    for (key, value) in &options.headers {
        request.push_str(&format!("{key}: {value}\r\n"));
    }
    request.push_str(&format!("Sec-WebSocket-Key: {key}\r\n"));
    if let Some(origin) = &options.origin {
        request.push_str(&format!("Origin: {origin}\r\n"));
    }
    if !options.protocols.is_empty() {
        request.push_str(&format!(
            "Sec-WebSocket-Protocol: {}\r\n",
            options.protocols.join(",")
        ));
    }
    let offers = options
        .per_message_compression_offers
        .iter()
        .map(|offer| offer.offer())
        .collect::<Vec<_>>();
    if !offers.is_empty() {
        request.push_str(&format!(
            "Sec-WebSocket-Extensions: {}\r\n",
            offers.join(", ")
        ));
    }
    request.push_str(&format!("Sec-WebSocket-Version: {}\r\n", options.version));
    request.push_str("\r\n");
    request
}

/// The outcome of a successful opening handshake response.
#[derive(Debug)]
pub struct ServerResponse {
    pub protocol: Option<String>,
    pub extensions: Vec<String>,
    pub compress: Option<Box<dyn PerMessageCompress>>,
}

fn protocol_error<S>(reason: S) -> anyhow::Error
where
    S: Into<String>,
{
    WebSocketError::Protocol(reason.into()).into()
}

/// Validates the opening handshake response.
pub fn check_response(head: &HttpHead, key: &str, options: &ClientOptions) -> Result<ServerResponse> {
    let mut parts = head.status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let status = parts.next().unwrap_or_default();
    let reason = parts.next().unwrap_or_default();
    if version != "HTTP/1.1" {
        return Err(protocol_error(format!(
            "Unsupported HTTP version '{version}'"
        )));
    }
    let status = status.parse::<u16>().map_err(|_| {
        protocol_error(format!(
            "Bad HTTP response status line '{}'",
            head.status_line
        ))
    })?;
    if status != 101 {
        return Err(WebSocketError::handshake(status, reason).into());
    }

    match head.header("upgrade") {
        None => return Err(protocol_error("HTTP Upgrade header missing")),
        Some(upgrade) if !upgrade.eq_ignore_ascii_case("websocket") => {
            return Err(protocol_error(format!(
                "HTTP Upgrade header different from 'websocket' (case-insensitive) : {upgrade}"
            )));
        }
        Some(_) => (),
    }
    match head.header("connection") {
        None => return Err(protocol_error("HTTP Connection header missing")),
        Some(connection) if !head.has_token("connection", "upgrade") => {
            return Err(protocol_error(format!(
                "HTTP Connection header does not include 'upgrade' value (case-insensitive) : {connection}"
            )));
        }
        Some(_) => (),
    }

    if head.count("sec-websocket-accept") > 1 {
        return Err(protocol_error(
            "HTTP Sec-WebSocket-Accept header appears more than once in opening handshake response",
        ));
    }
    let accept = head
        .header("sec-websocket-accept")
        .ok_or_else(|| protocol_error("HTTP Sec-WebSocket-Accept header missing"))?;
    let expected = accept_key(key);
    if accept != expected {
        return Err(protocol_error(format!(
            "HTTP Sec-WebSocket-Accept bogus value : expected {expected} / got {accept}"
        )));
    }

    let mut response = ServerResponse {
        protocol: None,
        extensions: Vec::new(),
        compress: None,
    };
    if let Some(extensions) = head.header("sec-websocket-extensions") {
        for extension in parse_extensions(extensions) {
            let negotiator = options
                .per_message_compression_offers
                .iter()
                .find(|offer| offer.extension_name() == extension.name)
                .ok_or_else(|| {
                    protocol_error(format!(
                        "server wants to use extension '{}' we did not request, have not implemented or did not enable",
                        extension.name
                    ))
                })?;
            if response.compress.is_some() {
                return Err(protocol_error(
                    "multiple occurrence of a permessage-compress extension",
                ));
            }
            let compress = negotiator.accept_response(&extension).map_err(|err| {
                protocol_error(format!(
                    "failed to accept response for extension '{}': {err}",
                    extension.name
                ))
            })?;
            response.extensions.push(extension.name.clone());
            response.compress = Some(compress);
        }
    }

    if let Some(protocol) = head.header("sec-websocket-protocol") {
        if !options.protocols.iter().any(|requested| requested == protocol) {
            return Err(protocol_error(format!(
                "subprotocol selected by server ({protocol}) not in subprotocol list requested by client ({})",
                options.protocols.join(", ")
            )));
        }
        response.protocol = Some(protocol.to_owned());
    }

    Ok(response)
}

async fn read_head<S>(stream: &mut S) -> Result<(HttpHead, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(4096);
    loop {
        if let Some(end) = find_head_end(&buffer) {
            return Ok((HttpHead::parse(&buffer[..end]), buffer[end..].to_vec()));
        }
        if stream.read_buf(&mut buffer).await? == 0 {
            return Err(protocol_error(
                "connection closed during opening handshake",
            ));
        }
    }
}

/// Opens a tunnel through an HTTP proxy with `CONNECT`.
pub async fn proxy_connect<S>(stream: &mut S, url: &WebSocketUrl) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = url.host_header();
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await?;
    stream.flush().await?;

    let (head, _) = read_head(stream).await?;
    let mut parts = head.status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let status = parts.next().unwrap_or_default();
    let reason = parts.next().unwrap_or_default();
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(protocol_error(format!(
            "Unsupported HTTP version '{version}' from proxy"
        )));
    }
    let status = status.parse::<u16>().map_err(|_| {
        protocol_error(format!(
            "Bad HTTP response status line '{}' from proxy",
            head.status_line
        ))
    })?;
    if !(200..300).contains(&status) {
        return Err(WebSocketError::handshake(status, format!("HTTP proxy connect failed: {reason}")).into());
    }
    debug!("Opened tunnel to {target} through HTTP proxy");
    Ok(())
}

/// Runs the client side of the opening handshake over a connected stream.
pub async fn handshake<S>(
    mut stream: S,
    url: &WebSocketUrl,
    options: &ClientOptions,
) -> Result<WebSocketConnection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let key = generate_key();
    stream
        .write_all(build_request(url, options, &key).as_bytes())
        .await?;
    stream.flush().await?;

    let (head, leftover) = read_head(&mut stream).await?;
    let response = check_response(&head, &key, options)?;
    debug!(
        "WebSocket connection to {} opened (protocol = {:?})",
        url.host_header(),
        response.protocol
    );

    let protocol = WebSocketProtocol::new(
        ProtocolConfig::client(options),
        url.host_header(),
        response.compress,
    );
    Ok(WebSocketConnection::start(
        stream,
        protocol,
        Handshake {
            peer: url.host_header(),
            protocol: response.protocol,
            extensions: response.extensions,
            leftover,
        },
        None,
    ))
}

async fn connect_inner(
    url: &WebSocketUrl,
    options: &ClientOptions,
    tls: Option<Arc<dyn TlsUpgrader>>,
) -> Result<WebSocketConnection> {
    let stream = match &options.proxy {
        Some((host, port)) => {
            let mut stream = TcpStream::connect((host.as_str(), *port)).await?;
            proxy_connect(&mut stream, url).await?;
            stream
        }
        None => TcpStream::connect((url.host.as_str(), url.port)).await?,
    };
    stream.set_nodelay(options.protocol.tcp_no_delay)?;

    if url.secure {
        let tls = tls.ok_or_else(|| {
            protocol_error(format!(
                "cannot connect to {}: no TLS upgrader configured",
                url.host_header()
            ))
        })?;
        let stream = tls.upgrade(stream, &url.host).await?;
        handshake(stream, url, options).await
    } else {
        handshake(stream, url, options).await
    }
}

/// Connects to a WebSocket server.
pub async fn connect(
    url: &str,
    options: &ClientOptions,
    tls: Option<Arc<dyn TlsUpgrader>>,
) -> Result<WebSocketConnection> {
    options.validate()?;
    let url = parse_url(url)?;
    let connect = connect_inner(&url, options, tls);
    match options.protocol.open_handshake_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(WebSocketError::Timeout(
                "WebSocket opening handshake timeout (peer did not finish the opening handshake in time)"
                    .to_owned(),
            )
            .into()),
        },
        None => connect.await,
    }
}
