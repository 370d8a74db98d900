use std::sync::OnceLock;

use anyhow::Result;
use bytes::Bytes;

use crate::{
    message::message::Message,
    serializer::serializer::{
        SERIALIZER_COUNT,
        Serializer,
    },
};

/// A message that remembers its serialized form for each serializer.
///
/// The same EVENT is often sent to many subscribers that share a serializer, so it only needs to be
/// serialized once.
#[derive(Debug)]
pub struct CachedMessage {
    message: Message,
    serialized: [OnceLock<Bytes>; SERIALIZER_COUNT],
}

impl CachedMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            serialized: Default::default(),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Mutable access to the message, which drops every cached serialization.
    pub fn message_mut(&mut self) -> &mut Message {
        self.uncache();
        &mut self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    /// Drops every cached serialization.
    pub fn uncache(&mut self) {
        for serialized in &mut self.serialized {
            serialized.take();
        }
    }

    /// Whether the message has been serialized by the serializer with the given id.
    pub fn is_cached(&self, serializer_id: usize) -> bool {
        self.serialized
            .get(serializer_id)
            .is_some_and(|serialized| serialized.get().is_some())
    }

    /// The serialized message, serializing it only on first use.
    pub fn serialized(&self, serializer: &dyn Serializer) -> Result<Bytes> {
        let Some(cache) = self.serialized.get(serializer.serializer_type().id()) else {
            return Ok(Bytes::from(serializer.serialize(&self.message)?));
        };
        if let Some(bytes) = cache.get() {
            return Ok(bytes.clone());
        }
        let bytes = Bytes::from(serializer.serialize(&self.message)?);
        Ok(cache.get_or_init(|| bytes).clone())
    }
}

impl From<Message> for CachedMessage {
    fn from(value: Message) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod cache_test {
    use crate::{
        core::id::Id,
        message::{
            cache::CachedMessage,
            message::{
                Message,
                PublishedMessage,
            },
        },
        serializer::{
            json::JsonSerializer,
            message_pack::MessagePackSerializer,
            serializer::{
                Serializer,
                SerializerType,
            },
        },
    };

    fn published(publication: u64) -> Message {
        Message::Published(PublishedMessage {
            publish_request: Id::try_from(1).unwrap(),
            publication: Id::try_from(publication).unwrap(),
        })
    }

    #[test]
    fn caches_per_serializer() {
        let message = CachedMessage::new(published(2));
        assert!(!message.is_cached(SerializerType::Json.id()));

        let json = JsonSerializer::default();
        pretty_assertions::assert_eq!(message.serialized(&json).unwrap().as_ref(), b"[17,1,2]");
        assert!(message.is_cached(SerializerType::Json.id()));
        assert!(!message.is_cached(SerializerType::MessagePack.id()));

        let message_pack = MessagePackSerializer::default();
        let bytes = message.serialized(&message_pack).unwrap();
        pretty_assertions::assert_eq!(
            message_pack.deserialize(&bytes).unwrap(),
            published(2)
        );
        assert!(message.is_cached(SerializerType::MessagePack.id()));
    }

    #[test]
    fn mutation_drops_cache() {
        let json = JsonSerializer::default();
        let mut message = CachedMessage::new(published(2));
        message.serialized(&json).unwrap();
        *message.message_mut() = published(3);
        assert!(!message.is_cached(SerializerType::Json.id()));
        pretty_assertions::assert_eq!(message.serialized(&json).unwrap().as_ref(), b"[17,1,3]");
    }
}
