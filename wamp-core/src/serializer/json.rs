use anyhow::Result;
use base64::Engine;

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

/// Prefix of a JSON string that carries base64-encoded binary data.
const BINARY_PREFIX: char = '\0';

/// A serializer implemented for JavaScript Object Notation.
///
/// JSON has no binary type, so binary values are sent as a string made of a NUL character followed
/// by the base64 encoding of the bytes.
#[derive(Debug, Default)]
pub struct JsonSerializer {}

fn encode_binary(value: &mut Value) {
    match value {
        Value::Bytes(bytes) => {
            let mut encoded = String::from(BINARY_PREFIX);
            base64::engine::general_purpose::STANDARD.encode_string(bytes, &mut encoded);
            *value = Value::String(encoded);
        }
        Value::List(list) => list.iter_mut().for_each(encode_binary),
        Value::Dictionary(dictionary) => dictionary.values_mut().for_each(encode_binary),
        _ => (),
    }
}

fn decode_binary(value: &mut Value) -> Result<(), ProtocolError> {
    match value {
        Value::String(string) => {
            if let Some(encoded) = string.strip_prefix(BINARY_PREFIX) {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|err| ProtocolError::new(format!("invalid binary string: {err}")))?;
                *value = Value::Bytes(bytes);
            }
        }
        Value::List(list) => {
            for value in list {
                decode_binary(value)?;
            }
        }
        Value::Dictionary(dictionary) => {
            for value in dictionary.values_mut() {
                decode_binary(value)?;
            }
        }
        _ => (),
    }
    Ok(())
}

impl Serializer for JsonSerializer {
    fn serializer_type(&self) -> SerializerType {
        SerializerType::Json
    }

    fn serialize(&self, value: &Message) -> Result<Vec<u8>> {
        let mut value = Value::List(value.marshal());
        encode_binary(&mut value);
        Ok(serde_json::to_vec(&value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        let mut value = serde_json::from_slice::<Value>(bytes)
            .map_err(|err| ProtocolError::new(format!("invalid JSON: {err}")))?;
        decode_binary(&mut value)?;
        message_from_value(value)
    }
}
