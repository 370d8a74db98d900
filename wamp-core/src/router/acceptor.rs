use anyhow::Result;
use async_trait::async_trait;
use log::debug;

use crate::{
    serializer::serializer::SerializerType,
    websocket::server_handshake::{
        ConnectHandler,
        ConnectionAccept,
        ConnectionDeny,
        ConnectionRequest,
    },
};

/// Accepts WebSocket connections that speak one of the router's WAMP subprotocols.
#[derive(Debug)]
pub struct WampConnectHandler {
    serializers: Vec<SerializerType>,
}

impl WampConnectHandler {
    /// Creates a handler for the allowed serializers, in order of preference.
    pub fn new(serializers: Vec<SerializerType>) -> Self {
        Self { serializers }
    }

    /// Selects the serializer for the requested subprotocols.
    ///
    /// A client that requests no subprotocol is assumed to speak JSON.
    pub fn select(&self, protocols: &[String]) -> Option<SerializerType> {
        if protocols.is_empty() {
            return self
                .serializers
                .contains(&SerializerType::Json)
                .then_some(SerializerType::Json);
        }
        protocols
            .iter()
            .filter_map(|protocol| SerializerType::try_from(protocol.as_str()).ok())
            .find(|serializer| self.serializers.contains(serializer))
    }
}

#[async_trait]
impl ConnectHandler for WampConnectHandler {
    async fn on_connect(&self, request: &ConnectionRequest) -> Result<ConnectionAccept> {
        let serializer = self.select(&request.protocols).ok_or_else(|| {
            ConnectionDeny::new(
                ConnectionDeny::BAD_REQUEST,
                format!(
                    "this server only speaks WebSocket subprotocols {}",
                    self.serializers
                        .iter()
                        .map(|serializer| serializer.uri().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )
        })?;
        debug!(
            "Accepted WebSocket connection from {} with serializer {}",
            request.peer,
            serializer.uri()
        );
        Ok(ConnectionAccept {
            protocol: (!request.protocols.is_empty()).then(|| serializer.uri().to_string()),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod acceptor_test {
    use crate::{
        router::acceptor::WampConnectHandler,
        serializer::serializer::SerializerType,
        websocket::server_handshake::{
            ConnectHandler,
            ConnectionDeny,
            ConnectionRequest,
        },
    };

    fn request(protocols: &[&str]) -> ConnectionRequest {
        ConnectionRequest {
            peer: "127.0.0.1:5000".to_owned(),
            protocols: protocols.iter().map(|protocol| (*protocol).to_owned()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn selects_first_supported_protocol() {
        let handler = WampConnectHandler::new(Vec::from_iter([
            SerializerType::Json,
            SerializerType::MessagePack,
        ]));
        let accept = handler
            .on_connect(&request(&["wamp.2.cbor", "wamp.2.msgpack", "wamp.2.json"]))
            .await
            .unwrap();
        pretty_assertions::assert_eq!(accept.protocol.as_deref(), Some("wamp.2.msgpack"));
    }

    #[tokio::test]
    async fn falls_back_to_json_without_protocols() {
        let handler = WampConnectHandler::new(Vec::from_iter([SerializerType::Json]));
        let accept = handler.on_connect(&request(&[])).await.unwrap();
        pretty_assertions::assert_eq!(accept.protocol, None);
        pretty_assertions::assert_eq!(handler.select(&[]), Some(SerializerType::Json));

        let handler = WampConnectHandler::new(Vec::from_iter([SerializerType::MessagePack]));
        assert_matches::assert_matches!(handler.select(&[]), None);
    }

    #[tokio::test]
    async fn denies_unsupported_protocols() {
        let handler = WampConnectHandler::new(Vec::from_iter([SerializerType::Json]));
        let err = handler
            .on_connect(&request(&["wamp.2.msgpack"]))
            .await
            .unwrap_err();
        assert_matches::assert_matches!(err.downcast_ref::<ConnectionDeny>(), Some(deny) => {
            pretty_assertions::assert_eq!(deny.code, ConnectionDeny::BAD_REQUEST);
            pretty_assertions::assert_eq!(
                deny.reason,
                "this server only speaks WebSocket subprotocols wamp.2.json"
            );
        });
    }
}
