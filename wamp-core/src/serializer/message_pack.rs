use anyhow::Result;

use crate::{
    core::{
        error::ProtocolError,
        types::Value,
    },
    message::message::Message,
    serializer::serializer::{
        Serializer,
        SerializerType,
        message_from_value,
    },
};

/// A serializer implemented for MessagePack.
#[derive(Debug, Default)]
pub struct MessagePackSerializer {}

impl Serializer for MessagePackSerializer {
    fn serializer_type(&self) -> SerializerType {
        SerializerType::MessagePack
    }

    fn serialize(&self, value: &Message) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(&Value::List(value.marshal()))?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        let value = rmp_serde::from_slice::<Value>(bytes)
            .map_err(|err| ProtocolError::new(format!("invalid MessagePack: {err}")))?;
        message_from_value(value)
    }
}
