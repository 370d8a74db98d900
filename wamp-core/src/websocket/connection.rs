use std::{
    fmt::Debug,
    pin::Pin,
    sync::{
        Arc,
        atomic::{
            AtomicUsize,
            Ordering,
        },
    },
    task,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Sink,
    Stream,
};
use log::{
    debug,
    error,
};
use tokio::{
    io::{
        AsyncRead,
        AsyncReadExt,
        AsyncWrite,
        AsyncWriteExt,
        ReadHalf,
        WriteHalf,
    },
    sync::{
        mpsc::{
            UnboundedReceiver,
            UnboundedSender,
            unbounded_channel,
        },
        watch,
    },
};

use crate::websocket::{
    close::{
        CloseCode,
        CloseStatus,
    },
    error::WebSocketError,
    protocol::{
        ProtocolEvent,
        WebSocketMessage,
        WebSocketProtocol,
    },
};

/// Delay between chunks of a synchronized write.
const QUEUED_WRITE_DELAY: Duration = Duration::from_micros(10);

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Counts open connections against a limit.
#[derive(Debug, Clone, Default)]
pub struct ConnectionCounter {
    count: Arc<AtomicUsize>,
}

impl ConnectionCounter {
    /// The number of connections currently counted.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Counts a new connection, unless `max` connections are already open.
    ///
    /// A `max` of zero means unlimited.
    pub fn try_acquire(&self, max: usize) -> Option<ConnectionGuard> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if max > 0 && current >= max {
                return None;
            }
            match self.count.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(ConnectionGuard {
                        count: self.count.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// A counted connection, released on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

enum Command {
    Send(WebSocketMessage),
    Ping(Vec<u8>),
    Close {
        code: Option<CloseCode>,
        reason: Option<String>,
    },
}

/// An open WebSocket connection.
///
/// The protocol runs on its own task, which owns the underlying stream. The connection is a
/// [`Stream`] of received messages and a [`Sink`] of messages to send. The stream ends when the
/// connection closes. If this end failed the connection, the error is produced as the last item.
pub struct WebSocketConnection {
    peer: String,
    protocol: Option<String>,
    extensions: Vec<String>,
    command_tx: UnboundedSender<Command>,
    message_rx: UnboundedReceiver<Result<WebSocketMessage>>,
    status_rx: watch::Receiver<Option<CloseStatus>>,
    close_sent: bool,
}

impl Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .field("extensions", &self.extensions)
            .finish()
    }
}

/// The result of a successful opening handshake.
pub struct Handshake {
    pub peer: String,
    /// The negotiated subprotocol.
    pub protocol: Option<String>,
    /// The accepted extension responses.
    pub extensions: Vec<String>,
    /// Octets received after the handshake.
    pub leftover: Vec<u8>,
}

impl WebSocketConnection {
    /// Starts running the protocol over the stream, which has completed the opening handshake.
    pub fn start<S>(
        stream: S,
        mut protocol: WebSocketProtocol,
        handshake: Handshake,
        guard: Option<ConnectionGuard>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (command_tx, command_rx) = unbounded_channel();
        let (message_tx, message_rx) = unbounded_channel();
        let (status_tx, status_rx) = watch::channel(None);

        protocol.open();
        if !handshake.leftover.is_empty() {
            protocol.receive(&handshake.leftover);
        }

        let driver = Driver {
            peer: handshake.peer.clone(),
            protocol,
            command_rx,
            message_tx,
            status_tx,
            _guard: guard,
        };
        tokio::spawn(driver.run(stream));

        Self {
            peer: handshake.peer,
            protocol: handshake.protocol,
            extensions: handshake.extensions,
            command_tx,
            message_rx,
            status_rx,
            close_sent: false,
        }
    }

    /// The address of the peer.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// The negotiated subprotocol.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// The accepted extensions.
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    fn command(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| WebSocketError::Closed.into())
    }

    /// Sends a message.
    pub fn send_message(&self, message: WebSocketMessage) -> Result<()> {
        self.command(Command::Send(message))
    }

    /// Sends a ping.
    pub fn ping(&self, payload: Vec<u8>) -> Result<()> {
        self.command(Command::Ping(payload))
    }

    /// Starts the closing handshake.
    pub fn close(&mut self, code: Option<CloseCode>, reason: Option<String>) -> Result<()> {
        self.close_sent = true;
        self.command(Command::Close { code, reason })
    }

    /// The close status, if the connection is closed.
    pub fn close_status(&self) -> Option<CloseStatus> {
        self.status_rx.borrow().clone()
    }

    /// Waits for the connection to close.
    pub async fn closed(&self) -> CloseStatus {
        let mut status_rx = self.status_rx.clone();
        match status_rx.wait_for(|status| status.is_some()).await {
            Ok(status) => status.clone().unwrap_or_else(Self::lost_status),
            Err(_) => Self::lost_status(),
        }
    }

    fn lost_status() -> CloseStatus {
        CloseStatus {
            was_clean: false,
            code: Some(CloseCode::ABNORMAL_CLOSE),
            reason: Some("connection task ended".to_owned()),
        }
    }
}

impl Stream for WebSocketConnection {
    type Item = Result<WebSocketMessage>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        self.message_rx.poll_recv(cx)
    }
}

impl Sink<WebSocketMessage> for WebSocketConnection {
    type Error = Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        if self.command_tx.is_closed() {
            task::Poll::Ready(Err(WebSocketError::Closed.into()))
        } else {
            task::Poll::Ready(Ok(()))
        }
    }

    fn start_send(
        self: Pin<&mut Self>,
        item: WebSocketMessage,
    ) -> std::result::Result<(), Self::Error> {
        self.send_message(item)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        if !self.close_sent {
            // The driver may already be gone.
            self.close(Some(CloseCode::NORMAL), None).ok();
        }
        task::Poll::Ready(Ok(()))
    }
}

/// The task that owns the stream and runs the protocol engine.
struct Driver {
    peer: String,
    protocol: WebSocketProtocol,
    command_rx: UnboundedReceiver<Command>,
    message_tx: UnboundedSender<Result<WebSocketMessage>>,
    status_tx: watch::Sender<Option<CloseStatus>>,
    _guard: Option<ConnectionGuard>,
}

impl Driver {
    async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        if let Err(err) = self.drive(&mut reader, &mut writer).await {
            debug!("WebSocket connection to {} ended: {err}", self.peer);
        }
        // Ignore errors, since the peer may have already closed the stream.
        writer.shutdown().await.ok();

        let status = self.protocol.connection_lost();
        debug!(
            "WebSocket connection to {} closed (clean = {}, code = {:?}, reason = {:?})",
            self.peer, status.was_clean, status.code, status.reason
        );
        if let Some(failure) = self.protocol.failure() {
            self.message_tx.send(Err(failure.clone().into())).ok();
        }
        self.status_tx.send(Some(status)).ok();
    }

    async fn drive<S>(
        &mut self,
        reader: &mut ReadHalf<S>,
        writer: &mut WriteHalf<S>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut commands_open = true;
        loop {
            self.flush(writer).await?;
            self.forward_events();
            if self.protocol.should_drop() {
                return Ok(());
            }

            let deadline = self.protocol.next_deadline();
            tokio::select! {
                read = reader.read(&mut buffer) => {
                    match read? {
                        0 => return Ok(()),
                        n => self.protocol.receive(&buffer[..n]),
                    }
                }
                command = self.command_rx.recv(), if commands_open => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            // The application dropped the connection.
                            commands_open = false;
                            self.protocol.send_close(Some(CloseCode::NORMAL), None).ok();
                        }
                    }
                }
                _ = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.protocol.handle_timeout();
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        let result = match command {
            Command::Send(message) => {
                let binary = message.is_binary();
                self.protocol.send_message(message.payload(), binary)
            }
            Command::Ping(payload) => self.protocol.send_ping(&payload),
            Command::Close { code, reason } => self.protocol.send_close(code, reason.as_deref()),
        };
        if let Err(err) = result {
            error!("Failed to process command for {}: {err}", self.peer);
        }
    }

    async fn flush<S>(&mut self, writer: &mut WriteHalf<S>) -> Result<()>
    where
        S: AsyncWrite,
    {
        let mut wrote = false;
        while let Some(outgoing) = self.protocol.poll_transmit() {
            writer.write_all(&outgoing.data).await?;
            wrote = true;
            if outgoing.sync {
                writer.flush().await?;
                tokio::time::sleep(QUEUED_WRITE_DELAY).await;
            }
        }
        if wrote {
            writer.flush().await?;
        }
        Ok(())
    }

    fn forward_events(&mut self) {
        while let Some(event) = self.protocol.poll_event() {
            match event {
                ProtocolEvent::Message(message) => {
                    // The application may have stopped listening.
                    self.message_tx.send(Ok(message)).ok();
                }
                ProtocolEvent::Ping(payload) => {
                    debug!("Received ping from {} ({} octets)", self.peer, payload.len())
                }
                ProtocolEvent::Pong(payload) => {
                    debug!("Received pong from {} ({} octets)", self.peer, payload.len())
                }
            }
        }
    }
}
