use std::ops::RangeInclusive;

use crate::core::{
    error::ProtocolError,
    id::Id,
    match_style::MatchStyle,
    types::{
        Dictionary,
        Integer,
        List,
        Value,
    },
    uri::{
        Uri,
        is_custom_attribute,
    },
};

/// Reads the positional fields of a raw message in order.
#[derive(Debug)]
pub(crate) struct Fields {
    message: &'static str,
    values: std::vec::IntoIter<Value>,
}

impl Fields {
    /// Checks the length of the raw message and skips over its type code.
    pub fn new(
        message: &'static str,
        list: List,
        lengths: RangeInclusive<usize>,
    ) -> Result<Self, ProtocolError> {
        if !lengths.contains(&list.len()) {
            return Err(ProtocolError::new(format!(
                "invalid message length {} for {message}",
                list.len()
            )));
        }
        let mut values = list.into_iter();
        values.next();
        Ok(Self { message, values })
    }

    fn next(&mut self, field: &str) -> Result<Value, ProtocolError> {
        self.values
            .next()
            .ok_or_else(|| ProtocolError::new(format!("missing '{field}' in {}", self.message)))
    }

    fn invalid_type(&self, field: &str, value: &Value) -> ProtocolError {
        ProtocolError::new(format!(
            "invalid type {} for '{field}' in {}",
            value.type_name(),
            self.message
        ))
    }

    pub fn id(&mut self, field: &str) -> Result<Id, ProtocolError> {
        let value = self.next(field)?;
        value
            .integer()
            .and_then(|id| Id::try_from(id).ok())
            .ok_or_else(|| {
                ProtocolError::new(format!("invalid value for '{field}' in {}", self.message))
            })
    }

    pub fn integer(&mut self, field: &str) -> Result<Integer, ProtocolError> {
        let value = self.next(field)?;
        value.integer().ok_or_else(|| self.invalid_type(field, &value))
    }

    pub fn string(&mut self, field: &str) -> Result<String, ProtocolError> {
        let value = self.next(field)?;
        match value {
            Value::String(value) => Ok(value),
            value => Err(self.invalid_type(field, &value)),
        }
    }

    pub fn dictionary(&mut self, field: &str) -> Result<Dictionary, ProtocolError> {
        let value = self.next(field)?;
        let dictionary = match value {
            Value::Dictionary(dictionary) => dictionary,
            value => return Err(self.invalid_type(field, &value)),
        };
        validate_custom_keys(self.message, &dictionary)?;
        Ok(dictionary)
    }

    /// Reads a URI, allowing empty components according to the match style.
    pub fn uri(&mut self, field: &str, match_style: MatchStyle) -> Result<Uri, ProtocolError> {
        let value = self.string(field)?;
        Uri::for_match(value, match_style).map_err(|_| {
            ProtocolError::new(format!("invalid URI for '{field}' in {}", self.message))
        })
    }

    /// The remaining fields, which hold the payload.
    pub fn rest(self) -> impl Iterator<Item = Value> {
        self.values
    }
}

/// Validates that implementation-defined keys follow the `x_<name>` pattern.
pub(crate) fn validate_custom_keys(
    message: &str,
    dictionary: &Dictionary,
) -> Result<(), ProtocolError> {
    match dictionary
        .keys()
        .find(|key| key.starts_with("x_") && !is_custom_attribute(key.as_str()))
    {
        Some(key) => Err(ProtocolError::new(format!(
            "invalid attribute '{key}' in {message}"
        ))),
        None => Ok(()),
    }
}

fn invalid_option(message: &str, key: &str, value: &Value) -> ProtocolError {
    ProtocolError::new(format!(
        "invalid type {} for '{key}' in {message}",
        value.type_name()
    ))
}

pub(crate) fn optional_string<'a>(
    message: &str,
    dictionary: &'a Dictionary,
    key: &str,
) -> Result<Option<&'a str>, ProtocolError> {
    match dictionary.get(key) {
        None => Ok(None),
        Some(value) => value
            .string()
            .map(Some)
            .ok_or_else(|| invalid_option(message, key, value)),
    }
}

pub(crate) fn optional_bool(
    message: &str,
    dictionary: &Dictionary,
    key: &str,
) -> Result<Option<bool>, ProtocolError> {
    match dictionary.get(key) {
        None => Ok(None),
        Some(value) => value
            .bool()
            .map(Some)
            .ok_or_else(|| invalid_option(message, key, value)),
    }
}

pub(crate) fn optional_integer(
    message: &str,
    dictionary: &Dictionary,
    key: &str,
) -> Result<Option<Integer>, ProtocolError> {
    match dictionary.get(key) {
        None => Ok(None),
        Some(value) => value
            .integer()
            .map(Some)
            .ok_or_else(|| invalid_option(message, key, value)),
    }
}

pub(crate) fn optional_id(
    message: &str,
    dictionary: &Dictionary,
    key: &str,
) -> Result<Option<Id>, ProtocolError> {
    match optional_integer(message, dictionary, key)? {
        None => Ok(None),
        Some(id) => Id::try_from(id).map(Some).map_err(|_| {
            ProtocolError::new(format!("invalid value {id} for '{key}' in {message}"))
        }),
    }
}

pub(crate) fn optional_dictionary<'a>(
    message: &str,
    dictionary: &'a Dictionary,
    key: &str,
) -> Result<Option<&'a Dictionary>, ProtocolError> {
    match dictionary.get(key) {
        None => Ok(None),
        Some(value) => value
            .dictionary()
            .map(Some)
            .ok_or_else(|| invalid_option(message, key, value)),
    }
}

pub(crate) fn optional_uri(
    message: &str,
    dictionary: &Dictionary,
    key: &str,
) -> Result<Option<Uri>, ProtocolError> {
    match optional_string(message, dictionary, key)? {
        None => Ok(None),
        Some(uri) => Uri::try_from(uri).map(Some).map_err(|_| {
            ProtocolError::new(format!("invalid URI {uri} for '{key}' in {message}"))
        }),
    }
}

pub(crate) fn optional_string_list<'a>(
    message: &str,
    dictionary: &'a Dictionary,
    key: &str,
) -> Result<Option<Vec<&'a str>>, ProtocolError> {
    let list = match dictionary.get(key) {
        None => return Ok(None),
        Some(value) => value
            .list()
            .ok_or_else(|| invalid_option(message, key, value))?,
    };
    list.iter()
        .map(|value| {
            value
                .string()
                .ok_or_else(|| invalid_option(message, key, value))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

pub(crate) fn optional_id_list(
    message: &str,
    dictionary: &Dictionary,
    key: &str,
) -> Result<Option<Vec<Id>>, ProtocolError> {
    let list = match dictionary.get(key) {
        None => return Ok(None),
        Some(value) => value
            .list()
            .ok_or_else(|| invalid_option(message, key, value))?,
    };
    list.iter()
        .map(|value| {
            value
                .integer()
                .and_then(|id| Id::try_from(id).ok())
                .ok_or_else(|| invalid_option(message, key, value))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Reads an option whose string value must name a variant of `T`.
pub(crate) fn optional_enum<T>(
    message: &str,
    dictionary: &Dictionary,
    key: &str,
) -> Result<Option<T>, ProtocolError>
where
    T: for<'a> TryFrom<&'a str>,
{
    match optional_string(message, dictionary, key)? {
        None => Ok(None),
        Some(value) => T::try_from(value).map(Some).map_err(|_| {
            ProtocolError::new(format!("invalid value {value} for '{key}' in {message}"))
        }),
    }
}

/// Validates a `roles` dictionary, where every role must be one of `allowed`.
pub(crate) fn validate_roles(
    message: &str,
    details: &Dictionary,
    allowed: &[&str],
) -> Result<(), ProtocolError> {
    let roles = optional_dictionary(message, details, "roles")?
        .ok_or_else(|| ProtocolError::new(format!("missing 'roles' in {message}")))?;
    if roles.is_empty() {
        return Err(ProtocolError::new(format!("empty 'roles' in {message}")));
    }
    for (role, features) in roles {
        if !allowed.contains(&role.as_str()) {
            return Err(ProtocolError::new(format!(
                "invalid role '{role}' in {message}"
            )));
        }
        let features = features
            .dictionary()
            .ok_or_else(|| invalid_option(message, role, features))?;
        if let Some(features) = optional_dictionary(message, features, "features")? {
            if let Some((feature, value)) = features.iter().find(|(_, value)| value.bool().is_none())
            {
                return Err(invalid_option(message, feature, value));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod validate_test {
    use crate::{
        core::{
            invocation_policy::InvocationPolicy,
            types::{
                Dictionary,
                List,
                Value,
            },
        },
        message::validate::{
            Fields,
            optional_enum,
            optional_id_list,
            validate_custom_keys,
            validate_roles,
        },
    };

    fn dictionary<const N: usize>(entries: [(&str, Value); N]) -> Dictionary {
        entries
            .into_iter()
            .map(|(key, value)| (key.to_owned(), value))
            .collect()
    }

    #[test]
    fn checks_message_length() {
        let list = List::from_iter([Value::Integer(34), Value::Integer(1)]);
        assert_matches::assert_matches!(Fields::new("UNSUBSCRIBE", list, 3..=3), Err(err) => {
            pretty_assertions::assert_eq!(
                err.to_string(),
                "invalid message length 2 for UNSUBSCRIBE"
            );
        });
    }

    #[test]
    fn reads_fields_in_order() {
        let list = List::from_iter([
            Value::Integer(32),
            Value::Integer(1),
            Value::Dictionary(Dictionary::default()),
            Value::from("com.x"),
        ]);
        let mut fields = Fields::new("SUBSCRIBE", list, 4..=4).unwrap();
        pretty_assertions::assert_eq!(fields.id("request").unwrap().value(), 1);
        assert!(fields.dictionary("options").unwrap().is_empty());
        pretty_assertions::assert_eq!(fields.string("topic").unwrap(), "com.x");
        assert_matches::assert_matches!(fields.string("extra"), Err(_));
    }

    #[test]
    fn rejects_ids_out_of_range() {
        let list = List::from_iter([
            Value::Integer(34),
            Value::Integer(9007199254740993),
            Value::Integer(1),
        ]);
        let mut fields = Fields::new("UNSUBSCRIBE", list, 3..=3).unwrap();
        assert_matches::assert_matches!(fields.id("request"), Err(_));
    }

    #[test]
    fn validates_custom_keys() {
        assert_matches::assert_matches!(
            validate_custom_keys("CALL", &dictionary([("x_trace_id", Value::from("a"))])),
            Ok(())
        );
        assert_matches::assert_matches!(
            validate_custom_keys("CALL", &dictionary([("x_1", Value::from("a"))])),
            Err(_)
        );
        assert_matches::assert_matches!(
            validate_custom_keys("CALL", &dictionary([("other", Value::from("a"))])),
            Ok(())
        );
    }

    #[test]
    fn validates_enum_options() {
        let options = dictionary([("invoke", Value::from("roundrobin"))]);
        assert_matches::assert_matches!(
            optional_enum::<InvocationPolicy>("REGISTER", &options, "invoke"),
            Ok(Some(InvocationPolicy::RoundRobin))
        );
        let options = dictionary([("invoke", Value::from("everyone"))]);
        assert_matches::assert_matches!(
            optional_enum::<InvocationPolicy>("REGISTER", &options, "invoke"),
            Err(_)
        );
    }

    #[test]
    fn validates_id_lists() {
        let options = dictionary([(
            "exclude",
            Value::List(List::from_iter([Value::Integer(1), Value::from("a")])),
        )]);
        assert_matches::assert_matches!(optional_id_list("PUBLISH", &options, "exclude"), Err(_));
    }

    #[test]
    fn validates_roles() {
        let details = dictionary([(
            "roles",
            Value::Dictionary(dictionary([(
                "subscriber",
                Value::Dictionary(dictionary([(
                    "features",
                    Value::Dictionary(dictionary([(
                        "pattern_based_subscription",
                        Value::Bool(true),
                    )])),
                )])),
            )])),
        )]);
        assert_matches::assert_matches!(
            validate_roles("HELLO", &details, &["subscriber", "publisher"]),
            Ok(())
        );
        assert_matches::assert_matches!(validate_roles("HELLO", &details, &["caller"]), Err(_));
        assert_matches::assert_matches!(
            validate_roles("HELLO", &Dictionary::default(), &["caller"]),
            Err(_)
        );
    }
}
