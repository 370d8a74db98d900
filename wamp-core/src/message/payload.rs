use crate::{
    core::{
        error::ProtocolError,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::is_custom_attribute,
    },
    message::validate::optional_string,
};

/// Application payload carried by ERROR, PUBLISH, EVENT, CALL, RESULT, INVOCATION, and YIELD.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Positional and keyword arguments, which the router can inspect.
    Arguments {
        arguments: List,
        arguments_keyword: Dictionary,
    },
    /// An opaque binary payload, described by the `enc_*` options of the message.
    Transparent(Vec<u8>),
}

impl Default for Payload {
    fn default() -> Self {
        Self::Arguments {
            arguments: List::default(),
            arguments_keyword: Dictionary::default(),
        }
    }
}

impl Payload {
    pub fn new(arguments: List, arguments_keyword: Dictionary) -> Self {
        Self::Arguments {
            arguments,
            arguments_keyword,
        }
    }

    /// A payload of only positional arguments.
    pub fn from_arguments(arguments: List) -> Self {
        Self::new(arguments, Dictionary::default())
    }

    pub fn is_transparent(&self) -> bool {
        matches!(self, Self::Transparent(_))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Arguments {
                arguments,
                arguments_keyword,
            } => arguments.is_empty() && arguments_keyword.is_empty(),
            Self::Transparent(_) => false,
        }
    }

    /// Positional arguments, empty for transparent payloads.
    pub fn arguments(&self) -> &[Value] {
        match self {
            Self::Arguments { arguments, .. } => arguments,
            Self::Transparent(_) => &[],
        }
    }

    /// Keyword arguments, if the payload is not transparent.
    pub fn arguments_keyword(&self) -> Option<&Dictionary> {
        match self {
            Self::Arguments {
                arguments_keyword, ..
            } => Some(arguments_keyword),
            Self::Transparent(_) => None,
        }
    }

    /// Reads the payload from the trailing elements of a message.
    ///
    /// `options` is the details or options dictionary of the message, which must describe the
    /// encoding of a transparent payload.
    pub(crate) fn parse(
        message: &str,
        options: &Dictionary,
        mut rest: impl Iterator<Item = Value>,
    ) -> Result<Self, ProtocolError> {
        let payload = match rest.next() {
            None => Self::default(),
            Some(Value::List(arguments)) => {
                let arguments_keyword = match rest.next() {
                    None => Dictionary::default(),
                    Some(Value::Dictionary(arguments_keyword)) => arguments_keyword,
                    Some(value) => {
                        return Err(ProtocolError::new(format!(
                            "invalid type {} for 'kwargs' in {message}",
                            value.type_name()
                        )));
                    }
                };
                Self::Arguments {
                    arguments,
                    arguments_keyword,
                }
            }
            Some(Value::Bytes(payload)) => {
                if rest.next().is_some() {
                    return Err(ProtocolError::new(format!(
                        "unexpected element after transparent payload in {message}"
                    )));
                }
                Self::Transparent(payload)
            }
            Some(value) => {
                return Err(ProtocolError::new(format!(
                    "invalid type {} for 'args' in {message}",
                    value.type_name()
                )));
            }
        };
        validate_encoding(message, options, payload.is_transparent())?;
        Ok(payload)
    }

    /// Appends the payload to a marshaled message, omitting empty trailing elements.
    pub(crate) fn marshal_into(&self, list: &mut List) {
        match self {
            Self::Arguments {
                arguments,
                arguments_keyword,
            } => {
                if !arguments_keyword.is_empty() {
                    list.push(Value::List(arguments.clone()));
                    list.push(Value::Dictionary(arguments_keyword.clone()));
                } else if !arguments.is_empty() {
                    list.push(Value::List(arguments.clone()));
                }
            }
            Self::Transparent(payload) => list.push(Value::Bytes(payload.clone())),
        }
    }
}

const ENCODING_ALGORITHMS: [&str; 2] = ["cryptobox", "mqtt"];
const ENCODING_SERIALIZERS: [&str; 4] = ["json", "msgpack", "cbor", "ubjson"];

fn validate_encoding(
    message: &str,
    options: &Dictionary,
    transparent: bool,
) -> Result<(), ProtocolError> {
    let algorithm = optional_string(message, options, "enc_algo")?;
    match algorithm {
        Some(algorithm) => {
            if !ENCODING_ALGORITHMS.contains(&algorithm) && !is_custom_attribute(algorithm) {
                return Err(ProtocolError::new(format!(
                    "invalid value {algorithm} for 'enc_algo' in {message}"
                )));
            }
        }
        None => {
            if transparent {
                return Err(ProtocolError::new(format!(
                    "transparent payload in {message} requires 'enc_algo'"
                )));
            }
        }
    }
    if let Some(serializer) = optional_string(message, options, "enc_serializer")? {
        if !ENCODING_SERIALIZERS.contains(&serializer) && !is_custom_attribute(serializer) {
            return Err(ProtocolError::new(format!(
                "invalid value {serializer} for 'enc_serializer' in {message}"
            )));
        }
    }
    optional_string(message, options, "enc_key")?;
    Ok(())
}
