use std::{
    pin::Pin,
    task,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Sink,
    SinkExt,
    Stream,
    StreamExt,
};

use crate::{
    core::error::ProtocolError,
    serializer::serializer::SerializerType,
    transport::transport::Transport,
    websocket::{
        connection::WebSocketConnection,
        protocol::WebSocketMessage,
    },
};

/// A transport implemented over a WebSocket connection.
///
/// Text serializers exchange text messages, and binary serializers exchange binary messages.
#[derive(Debug)]
pub struct WebSocketTransport {
    connection: WebSocketConnection,
    binary: bool,
}

impl WebSocketTransport {
    pub fn new(connection: WebSocketConnection, serializer_type: SerializerType) -> Self {
        Self {
            connection,
            binary: serializer_type.binary(),
        }
    }
}

impl Transport for WebSocketTransport {}

impl Stream for WebSocketTransport {
    type Item = Result<Vec<u8>>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        match futures_util::ready!(self.connection.poll_next_unpin(cx)) {
            Some(Ok(message)) => {
                if message.is_binary() != self.binary {
                    let expected = if self.binary { "binary" } else { "text" };
                    task::Poll::Ready(Some(Err(ProtocolError::new(format!(
                        "expected {expected} message"
                    ))
                    .into())))
                } else {
                    task::Poll::Ready(Some(Ok(message.into_payload())))
                }
            }
            Some(Err(err)) => task::Poll::Ready(Some(Err(err))),
            None => task::Poll::Ready(None),
        }
    }
}

impl Sink<Vec<u8>> for WebSocketTransport {
    type Error = Error;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.connection.poll_ready_unpin(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Vec<u8>) -> std::result::Result<(), Self::Error> {
        let message = if self.binary {
            WebSocketMessage::Binary(item)
        } else {
            WebSocketMessage::Text(String::from_utf8(item)?)
        };
        self.connection.start_send_unpin(message)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.connection.poll_flush_unpin(cx)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.connection.poll_close_unpin(cx)
    }
}
