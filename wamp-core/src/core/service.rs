use std::sync::Arc;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    SinkExt,
    StreamExt,
};
use log::{
    debug,
    error,
    warn,
};
use tokio::{
    sync::{
        broadcast,
        mpsc::{
            UnboundedReceiver,
            UnboundedSender,
            unbounded_channel,
        },
    },
    task::JoinHandle,
};

use crate::{
    core::{
        error::{
            InteractionError,
            ProtocolError,
        },
        stream::MessageStream,
    },
    message::{
        cache::CachedMessage,
        common::abort_message_for_error,
        message::Message,
    },
    serializer::serializer::Serializer,
    transport::transport::Transport,
};

/// A sender of messages to a running [`Service`].
#[derive(Debug, Clone)]
pub struct MessageSender {
    tx: UnboundedSender<Arc<CachedMessage>>,
}

impl MessageSender {
    pub(crate) fn new(tx: UnboundedSender<Arc<CachedMessage>>) -> Self {
        Self { tx }
    }

    /// Sends a message.
    pub fn send(&self, message: Message) -> Result<()> {
        self.send_cached(Arc::new(CachedMessage::new(message)))
    }

    /// Sends a message that may be shared with other services.
    pub fn send_cached(&self, message: Arc<CachedMessage>) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::msg("service message channel closed"))
    }

    /// Whether the service has stopped accepting messages.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A handle to an asynchronously-running [`Service`].
pub struct ServiceHandle {
    start_handle: JoinHandle<()>,
    cancel_tx: broadcast::Sender<()>,
    message_tx: MessageSender,
}

impl ServiceHandle {
    /// Joins the task running the service.
    pub async fn join(self) -> Result<()> {
        self.start_handle.await.map_err(Error::new)
    }

    /// Cancels the service.
    ///
    /// Cancellation is the correct way to cleanly exit a service.
    pub fn cancel(&self) -> Result<()> {
        self.cancel_tx.send(()).map(|_| ()).map_err(Error::new)
    }

    /// The message transmission channel.
    pub fn message_tx(&self) -> MessageSender {
        self.message_tx.clone()
    }
}

/// The core asynchronous service that sends and receives WAMP messages over an underlying
/// transport.
///
/// Received messages are passed in order to a channel for higher layers (a single session on a
/// router or a peer) to process.
///
/// Canceling the service *will not* inject an ABORT message. Higher layers are expected to send
/// ABORT or GOODBYE before canceling. The only message injected at this layer is an ABORT for a
/// message that could not be parsed, since the stream is closed immediately afterwards.
pub struct Service {
    name: String,
    stream: MessageStream,
    message_tx: UnboundedSender<Message>,
    message_rx: Option<UnboundedReceiver<Message>>,
    end_tx: broadcast::Sender<()>,
    _end_rx: broadcast::Receiver<()>,
    cancel_tx: broadcast::Sender<()>,
    cancel_rx: broadcast::Receiver<()>,

    user_message_tx: UnboundedSender<Arc<CachedMessage>>,
    user_message_rx: UnboundedReceiver<Arc<CachedMessage>>,
}

impl Service {
    /// Creates a new service with the given transport and serialization.
    pub fn new(
        name: String,
        transport: Box<dyn Transport>,
        serializer: Box<dyn Serializer>,
    ) -> Self {
        let stream = MessageStream::new(transport, serializer);
        let (message_tx, message_rx) = unbounded_channel();
        let (end_tx, end_rx) = broadcast::channel(1);
        let (cancel_tx, cancel_rx) = broadcast::channel(1);
        let (user_message_tx, user_message_rx) = unbounded_channel();
        Self {
            name,
            stream,
            message_tx,
            message_rx: Some(message_rx),
            end_tx,
            _end_rx: end_rx,
            cancel_tx,
            cancel_rx,
            user_message_tx,
            user_message_rx,
        }
    }

    /// Takes the receiver of incoming messages.
    ///
    /// There is exactly one receiver, so messages are handled in the order they arrive.
    pub fn take_message_rx(&mut self) -> Option<UnboundedReceiver<Message>> {
        self.message_rx.take()
    }

    /// The end receiver channel.
    pub fn end_rx(&self) -> broadcast::Receiver<()> {
        self.end_tx.subscribe()
    }

    /// Starts the service asynchronously.
    ///
    /// This method takes ownership of the service. All future interactions with the service should
    /// be made through the returned handle.
    pub fn start(self) -> ServiceHandle {
        let cancel_tx = self.cancel_tx.clone();
        let message_tx = MessageSender::new(self.user_message_tx.clone());
        let start_handle = tokio::spawn(self.run());
        ServiceHandle {
            start_handle,
            cancel_tx,
            message_tx,
        }
    }

    async fn run(mut self) {
        if let Err(err) = self.service_loop().await {
            if err.downcast_ref::<ProtocolError>().is_some() {
                warn!("Service {} closed for protocol violation: {err}", self.name);
            } else {
                error!("Service {} failed: {err}", self.name);
            }
        }
        if let Err(err) = self.end().await {
            error!("Failed to end service {}: {err}", self.name);
        }
    }

    async fn service_loop(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                message = self.stream.next() => {
                    match message {
                        Some(Ok(message)) => {
                            self.message_tx.send(message)?;
                        }
                        Some(Err(err)) => {
                            if let Some(protocol_error) = err.downcast_ref::<ProtocolError>() {
                                // The stream will be closed, so the peer must learn why here.
                                let abort = abort_message_for_error(
                                    &InteractionError::ProtocolViolation(protocol_error.to_string()).into(),
                                );
                                // The stream may already be closed.
                                self.stream.send(Arc::new(CachedMessage::new(abort))).await.ok();
                            }
                            return Err(err);
                        }
                        None => {
                            debug!("Service {} stream ended", self.name);
                            return Ok(());
                        }
                    }
                }
                message = self.user_message_rx.recv() => {
                    match message {
                        Some(message) => {
                            self.stream.send(message).await?;
                        }
                        None => {
                            return Err(Error::msg("user message stream closed"));
                        }
                    }
                }
                _ = self.cancel_rx.recv() => {
                    // Flush what was queued before cancellation, such as a final GOODBYE.
                    while let Ok(message) = self.user_message_rx.try_recv() {
                        self.stream.send(message).await?;
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn end(&mut self) -> Result<()> {
        // Ignore error with the stream, since it may already be closed.
        self.stream.close().await.ok();
        self.end_tx.send(())?;
        Ok(())
    }
}
