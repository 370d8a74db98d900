use anyhow::{
    Error,
    Result,
};

use crate::{
    auth::{
        auth_method::AuthMethod,
        identity::Identity,
    },
    core::types::{
        Dictionary,
        List,
        Value,
    },
    message::message::{
        AuthenticateMessage,
        ChallengeMessage,
        HelloMessage,
        WelcomeMessage,
    },
};

/// The client's first message of an authentication method, carried in HELLO.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ClientFirstMessage {
    /// The identity of the user performing authentication, if any.
    pub id: Option<String>,
    /// Offered authentication methods, in order of preference.
    pub methods: Vec<AuthMethod>,
    /// Extra data.
    pub extra: Dictionary,
}

impl ClientFirstMessage {
    /// Embeds the authentication information into a HELLO message.
    ///
    /// Methods already listed in the message are kept ahead of the new ones.
    pub fn embed_into_hello_message(self, message: &mut HelloMessage) {
        let methods = self
            .methods
            .into_iter()
            .map(|method| Value::String(method.into()))
            .collect::<List>();
        let entry = message
            .details
            .entry("authmethods".to_owned())
            .or_insert_with(|| Value::List(List::default()));
        match entry {
            Value::List(list) => list.extend(methods),
            _ => *entry = Value::List(methods),
        }

        if let Some(id) = self.id {
            message
                .details
                .insert("authid".to_owned(), Value::String(id));
        }

        if !self.extra.is_empty() {
            let entry = message
                .details
                .entry("authextra".to_owned())
                .or_insert_with(|| Value::Dictionary(Dictionary::default()));
            match entry {
                Value::Dictionary(dictionary) => dictionary.extend(self.extra),
                _ => *entry = Value::Dictionary(self.extra),
            }
        }
    }
}

impl TryFrom<&HelloMessage> for ClientFirstMessage {
    type Error = Error;
    fn try_from(value: &HelloMessage) -> Result<Self, Self::Error> {
        let id = match value.details.get("authid") {
            Some(id) => Some(
                id.string()
                    .ok_or_else(|| Error::msg("authid must be a string"))?
                    .to_owned(),
            ),
            None => None,
        };
        // Unknown methods are skipped, since the client may support more than the router.
        let methods = value
            .auth_methods()
            .iter()
            .filter_map(|method| AuthMethod::try_from(method.as_str()).ok())
            .collect();
        let extra = match value.details.get("authextra") {
            Some(extra) => extra
                .dictionary()
                .ok_or_else(|| Error::msg("authextra must be a dictionary"))?
                .clone(),
            None => Dictionary::default(),
        };
        Ok(Self { id, methods, extra })
    }
}

/// The server's first message of an authentication method, carried in CHALLENGE.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ServerFirstMessage {
    /// The selected authentication method.
    pub method: AuthMethod,
    /// Extra data.
    pub extra: Dictionary,
}

impl From<ServerFirstMessage> for ChallengeMessage {
    fn from(value: ServerFirstMessage) -> Self {
        Self {
            auth_method: value.method.into(),
            extra: value.extra,
        }
    }
}

impl TryFrom<&ChallengeMessage> for ServerFirstMessage {
    type Error = Error;
    fn try_from(value: &ChallengeMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            method: AuthMethod::try_from(value.auth_method.as_str())?,
            extra: value.extra.clone(),
        })
    }
}

/// The client's final message of an authentication method, carried in AUTHENTICATE.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ClientFinalMessage {
    /// The client's signature over the challenge.
    pub signature: String,
    /// Extra data.
    pub extra: Dictionary,
}

impl From<ClientFinalMessage> for AuthenticateMessage {
    fn from(value: ClientFinalMessage) -> Self {
        Self {
            signature: value.signature,
            extra: value.extra,
        }
    }
}

impl From<&AuthenticateMessage> for ClientFinalMessage {
    fn from(value: &AuthenticateMessage) -> Self {
        Self {
            signature: value.signature.clone(),
            extra: value.extra.clone(),
        }
    }
}

/// The server's final message of an authentication method, carried in WELCOME.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ServerFinalMessage {
    /// The identity the client was actually authenticated as.
    pub identity: Identity,
    /// The authentication method.
    pub method: AuthMethod,
    /// The actual provider of authentication.
    pub provider: String,
    /// Extra data.
    pub extra: Dictionary,
}

impl ServerFinalMessage {
    /// Embeds the authentication information into a WELCOME message.
    pub fn embed_into_welcome_message(self, message: &mut WelcomeMessage) {
        message
            .details
            .insert("authid".to_owned(), Value::String(self.identity.id));
        message
            .details
            .insert("authrole".to_owned(), Value::String(self.identity.role));
        message
            .details
            .insert("authmethod".to_owned(), Value::String(self.method.into()));
        message
            .details
            .insert("authprovider".to_owned(), Value::String(self.provider));
        if !self.extra.is_empty() {
            message
                .details
                .insert("authextra".to_owned(), Value::Dictionary(self.extra));
        }
    }
}

fn required_string<'a>(details: &'a Dictionary, key: &str) -> Result<&'a str> {
    details
        .get(key)
        .ok_or_else(|| Error::msg(format!("missing {key}")))?
        .string()
        .ok_or_else(|| Error::msg(format!("{key} must be a string")))
}

impl TryFrom<&WelcomeMessage> for ServerFinalMessage {
    type Error = Error;
    fn try_from(value: &WelcomeMessage) -> Result<Self, Self::Error> {
        let id = required_string(&value.details, "authid")?.to_owned();
        let role = required_string(&value.details, "authrole")?.to_owned();
        let method = AuthMethod::try_from(required_string(&value.details, "authmethod")?)?;
        let provider = required_string(&value.details, "authprovider")?.to_owned();
        let extra = match value.details.get("authextra") {
            Some(extra) => extra
                .dictionary()
                .ok_or_else(|| Error::msg("authextra must be a dictionary"))?
                .clone(),
            None => Dictionary::default(),
        };
        Ok(Self {
            identity: Identity { id, role },
            method,
            provider,
            extra,
        })
    }
}

#[cfg(test)]
mod message_test {
    use crate::{
        auth::{
            auth_method::AuthMethod,
            identity::Identity,
            message::{
                ClientFirstMessage,
                ServerFinalMessage,
            },
        },
        core::{
            id::Id,
            types::{
                Dictionary,
                List,
                Value,
            },
        },
        message::message::{
            HelloMessage,
            WelcomeMessage,
        },
    };

    #[test]
    fn reads_client_first_message_from_hello() {
        let hello = HelloMessage {
            realm: "com.example".try_into().unwrap(),
            details: Dictionary::from_iter([
                (
                    "authmethods".to_owned(),
                    Value::List(List::from_iter([
                        Value::from("cryptosign"),
                        Value::from("ticket"),
                    ])),
                ),
                ("authid".to_owned(), Value::from("alice")),
            ]),
        };
        pretty_assertions::assert_eq!(
            ClientFirstMessage::try_from(&hello).unwrap(),
            ClientFirstMessage {
                id: Some("alice".to_owned()),
                methods: Vec::from_iter([AuthMethod::Ticket]),
                extra: Dictionary::default(),
            }
        );
    }

    #[test]
    fn embeds_client_first_message_after_existing_methods() {
        let mut hello = HelloMessage {
            realm: "com.example".try_into().unwrap(),
            details: Dictionary::from_iter([(
                "authmethods".to_owned(),
                Value::List(List::from_iter([Value::from("anonymous")])),
            )]),
        };
        ClientFirstMessage {
            id: Some("bob".to_owned()),
            methods: Vec::from_iter([AuthMethod::WampCra]),
            extra: Dictionary::default(),
        }
        .embed_into_hello_message(&mut hello);
        pretty_assertions::assert_eq!(
            hello.auth_methods(),
            Vec::from_iter(["anonymous".to_owned(), "wampcra".to_owned()])
        );
        pretty_assertions::assert_eq!(hello.auth_id(), Some("bob"));
        assert!(!hello.details.contains_key("authextra"));
    }

    #[test]
    fn server_final_message_survives_welcome() {
        let message = ServerFinalMessage {
            identity: Identity {
                id: "alice".to_owned(),
                role: "user".to_owned(),
            },
            method: AuthMethod::Ticket,
            provider: "static".to_owned(),
            extra: Dictionary::default(),
        };
        let mut welcome = WelcomeMessage {
            session: Id::try_from(1).unwrap(),
            details: Dictionary::default(),
        };
        message.clone().embed_into_welcome_message(&mut welcome);
        pretty_assertions::assert_eq!(ServerFinalMessage::try_from(&welcome).unwrap(), message);
    }
}
