use crate::{
    core::{
        cancel::{
            CallCancelMode,
            InterruptMode,
        },
        error::ProtocolError,
        id::Id,
        invocation_policy::InvocationPolicy,
        match_style::MatchStyle,
        types::{
            Dictionary,
            Integer,
            List,
            Value,
        },
        uri::Uri,
    },
    message::{
        payload::Payload,
        validate::{
            Fields,
            optional_bool,
            optional_dictionary,
            optional_enum,
            optional_id,
            optional_id_list,
            optional_integer,
            optional_string,
            optional_string_list,
            optional_uri,
            validate_roles,
        },
    },
};

/// A HELLO message for a peer to initiate a WAMP session in a realm.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HelloMessage {
    pub realm: Uri,
    pub details: Dictionary,
}

/// A WELCOME message for a router to confirm a peer's WAMP session in a realm.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WelcomeMessage {
    pub session: Id,
    pub details: Dictionary,
}

/// An ABORT message for quickly terminating a WAMP session.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AbortMessage {
    pub details: Dictionary,
    pub reason: Uri,
}

/// A CHALLENGE message for a router to challenge a peer's authentication.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChallengeMessage {
    pub auth_method: String,
    pub extra: Dictionary,
}

/// An AUTHENTICATE message for a peer to respond to an authentication challenge.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AuthenticateMessage {
    pub signature: String,
    pub extra: Dictionary,
}

/// A GOODBYE message for ending a WAMP session with a two-way handshake.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GoodbyeMessage {
    pub details: Dictionary,
    pub reason: Uri,
}

/// A HEARTBEAT message for keeping a session alive.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HeartbeatMessage {
    pub incoming: Integer,
    pub outgoing: Integer,
    pub discard: Option<String>,
}

/// An ERROR message for communicating an error in response to a single request.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ErrorMessage {
    pub request_type: Integer,
    pub request: Id,
    pub details: Dictionary,
    pub error: Uri,
    pub payload: Payload,
}

/// A PUBLISH message for publishing an event to a topic.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PublishMessage {
    pub request: Id,
    pub options: Dictionary,
    pub topic: Uri,
    pub payload: Payload,
}

/// A PUBLISHED message for confirming an event was published.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PublishedMessage {
    pub publish_request: Id,
    pub publication: Id,
}

/// A SUBSCRIBE message for subscribing to a topic.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SubscribeMessage {
    pub request: Id,
    pub options: Dictionary,
    pub topic: Uri,
}

/// A SUBSCRIBED message for confirming a peer has subscribed to a topic.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SubscribedMessage {
    pub subscribe_request: Id,
    pub subscription: Id,
}

/// An UNSUBSCRIBE message for unsubscribing from a topic.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UnsubscribeMessage {
    pub request: Id,
    pub subscribed_subscription: Id,
}

/// An UNSUBSCRIBED message for confirming a peer has unsubscribed from a topic.
///
/// When the router revokes a subscription, the request is `0` and the details name the
/// subscription and the reason.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UnsubscribedMessage {
    pub unsubscribe_request: Id,
    pub details: Dictionary,
}

/// An EVENT message for relaying a published event to subscribers.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EventMessage {
    pub subscribed_subscription: Id,
    pub published_publication: Id,
    pub details: Dictionary,
    pub payload: Payload,
}

/// A CALL message for invoking a procedure.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CallMessage {
    pub request: Id,
    pub options: Dictionary,
    pub procedure: Uri,
    pub payload: Payload,
}

/// A CANCEL message for canceling an active call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CancelMessage {
    pub call_request: Id,
    pub options: Dictionary,
}

/// A RESULT message for sending the result of a procedure invocation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResultMessage {
    pub call_request: Id,
    pub details: Dictionary,
    pub payload: Payload,
}

/// A REGISTER message for registering a procedure in the realm.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RegisterMessage {
    pub request: Id,
    pub options: Dictionary,
    pub procedure: Uri,
}

/// A REGISTERED message for confirming a procedure has been registered.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RegisteredMessage {
    pub register_request: Id,
    pub registration: Id,
}

/// An UNREGISTER message for unregistering a procedure in the realm.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UnregisterMessage {
    pub request: Id,
    pub registered_registration: Id,
}

/// An UNREGISTERED message for confirming a procedure has been unregistered.
///
/// When the router revokes a registration, the request is `0` and the details name the
/// registration and the reason.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UnregisteredMessage {
    pub unregister_request: Id,
    pub details: Dictionary,
}

/// An INVOCATION message for invoking a procedure on its callee.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InvocationMessage {
    pub request: Id,
    pub registered_registration: Id,
    pub details: Dictionary,
    pub payload: Payload,
}

/// An INTERRUPT message for interrupting an invocation on its callee.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InterruptMessage {
    pub invocation_request: Id,
    pub options: Dictionary,
}

/// A YIELD message for yielding the result of an invocation from the callee.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct YieldMessage {
    pub invocation_request: Id,
    pub options: Dictionary,
    pub payload: Payload,
}

fn flag(dictionary: &Dictionary, key: &str) -> bool {
    dictionary.get(key).and_then(Value::bool).unwrap_or(false)
}

fn ids(dictionary: &Dictionary, key: &str) -> Vec<Id> {
    dictionary
        .get(key)
        .and_then(Value::list)
        .map(|list| {
            list.iter()
                .filter_map(|id| id.integer().and_then(|id| Id::try_from(id).ok()))
                .collect()
        })
        .unwrap_or_default()
}

fn strings(dictionary: &Dictionary, key: &str) -> Vec<String> {
    dictionary
        .get(key)
        .and_then(Value::list)
        .map(|list| {
            list.iter()
                .filter_map(|value| value.string().map(|value| value.to_owned()))
                .collect()
        })
        .unwrap_or_default()
}

fn enum_option<T>(dictionary: &Dictionary, key: &str) -> T
where
    T: for<'a> TryFrom<&'a str> + Default,
{
    dictionary
        .get(key)
        .and_then(Value::string)
        .and_then(|value| T::try_from(value).ok())
        .unwrap_or_default()
}

impl HelloMessage {
    /// Authentication methods offered by the peer, in order of preference.
    pub fn auth_methods(&self) -> Vec<String> {
        strings(&self.details, "authmethods")
    }

    pub fn auth_id(&self) -> Option<&str> {
        self.details.get("authid").and_then(Value::string)
    }

    /// Roles announced by the peer.
    pub fn roles(&self) -> Option<&Dictionary> {
        self.details.get("roles").and_then(Value::dictionary)
    }
}

impl PublishMessage {
    pub fn acknowledge(&self) -> bool {
        flag(&self.options, "acknowledge")
    }

    /// Whether the publisher is excluded from receiving the event, which is the default.
    pub fn exclude_me(&self) -> bool {
        self.options
            .get("exclude_me")
            .and_then(Value::bool)
            .unwrap_or(true)
    }

    pub fn disclose_me(&self) -> bool {
        flag(&self.options, "disclose_me")
    }

    pub fn exclude(&self) -> Vec<Id> {
        ids(&self.options, "exclude")
    }

    pub fn exclude_authid(&self) -> Vec<String> {
        strings(&self.options, "exclude_authid")
    }

    pub fn exclude_authrole(&self) -> Vec<String> {
        strings(&self.options, "exclude_authrole")
    }

    pub fn eligible(&self) -> Option<Vec<Id>> {
        self.options
            .contains_key("eligible")
            .then(|| ids(&self.options, "eligible"))
    }

    pub fn eligible_authid(&self) -> Option<Vec<String>> {
        self.options
            .contains_key("eligible_authid")
            .then(|| strings(&self.options, "eligible_authid"))
    }

    pub fn eligible_authrole(&self) -> Option<Vec<String>> {
        self.options
            .contains_key("eligible_authrole")
            .then(|| strings(&self.options, "eligible_authrole"))
    }
}

impl SubscribeMessage {
    pub fn match_style(&self) -> MatchStyle {
        enum_option(&self.options, "match")
    }
}

impl CallMessage {
    pub fn receive_progress(&self) -> bool {
        flag(&self.options, "receive_progress")
    }

    pub fn disclose_me(&self) -> bool {
        flag(&self.options, "disclose_me")
    }

    /// Call timeout in milliseconds, if any.
    pub fn timeout(&self) -> Option<Integer> {
        self.options
            .get("timeout")
            .and_then(Value::integer)
            .filter(|timeout| *timeout > 0)
    }
}

impl CancelMessage {
    pub fn mode(&self) -> CallCancelMode {
        enum_option(&self.options, "mode")
    }
}

impl ResultMessage {
    pub fn progress(&self) -> bool {
        flag(&self.details, "progress")
    }
}

impl RegisterMessage {
    pub fn match_style(&self) -> MatchStyle {
        enum_option(&self.options, "match")
    }

    pub fn invocation_policy(&self) -> InvocationPolicy {
        enum_option(&self.options, "invoke")
    }

    pub fn force_reregister(&self) -> bool {
        flag(&self.options, "force_reregister")
    }

    pub fn disclose_caller(&self) -> bool {
        flag(&self.options, "disclose_caller")
    }
}

impl InterruptMessage {
    pub fn mode(&self) -> InterruptMode {
        enum_option(&self.options, "mode")
    }
}

impl YieldMessage {
    pub fn progress(&self) -> bool {
        flag(&self.options, "progress")
    }
}

/// A WAMP message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(HelloMessage),
    Welcome(WelcomeMessage),
    Abort(AbortMessage),
    Challenge(ChallengeMessage),
    Authenticate(AuthenticateMessage),
    Goodbye(GoodbyeMessage),
    Heartbeat(HeartbeatMessage),
    Error(ErrorMessage),
    Publish(PublishMessage),
    Published(PublishedMessage),
    Subscribe(SubscribeMessage),
    Subscribed(SubscribedMessage),
    Unsubscribe(UnsubscribeMessage),
    Unsubscribed(UnsubscribedMessage),
    Event(EventMessage),
    Call(CallMessage),
    Cancel(CancelMessage),
    Result(ResultMessage),
    Register(RegisterMessage),
    Registered(RegisteredMessage),
    Unregister(UnregisterMessage),
    Unregistered(UnregisteredMessage),
    Invocation(InvocationMessage),
    Interrupt(InterruptMessage),
    Yield(YieldMessage),
}

const PEER_ROLES: [&str; 4] = ["subscriber", "publisher", "caller", "callee"];
const ROUTER_ROLES: [&str; 2] = ["broker", "dealer"];

impl Message {
    pub const HELLO_TAG: Integer = 1;
    pub const WELCOME_TAG: Integer = 2;
    pub const ABORT_TAG: Integer = 3;
    pub const CHALLENGE_TAG: Integer = 4;
    pub const AUTHENTICATE_TAG: Integer = 5;
    pub const GOODBYE_TAG: Integer = 6;
    pub const HEARTBEAT_TAG: Integer = 7;
    pub const ERROR_TAG: Integer = 8;
    pub const PUBLISH_TAG: Integer = 16;
    pub const PUBLISHED_TAG: Integer = 17;
    pub const SUBSCRIBE_TAG: Integer = 32;
    pub const SUBSCRIBED_TAG: Integer = 33;
    pub const UNSUBSCRIBE_TAG: Integer = 34;
    pub const UNSUBSCRIBED_TAG: Integer = 35;
    pub const EVENT_TAG: Integer = 36;
    pub const CALL_TAG: Integer = 48;
    pub const CANCEL_TAG: Integer = 49;
    pub const RESULT_TAG: Integer = 50;
    pub const REGISTER_TAG: Integer = 64;
    pub const REGISTERED_TAG: Integer = 65;
    pub const UNREGISTER_TAG: Integer = 66;
    pub const UNREGISTERED_TAG: Integer = 67;
    pub const INVOCATION_TAG: Integer = 68;
    pub const INTERRUPT_TAG: Integer = 69;
    pub const YIELD_TAG: Integer = 70;

    /// Message types an ERROR may respond to.
    const ERROR_REQUEST_TYPES: [Integer; 8] = [
        Self::SUBSCRIBE_TAG,
        Self::UNSUBSCRIBE_TAG,
        Self::PUBLISH_TAG,
        Self::REGISTER_TAG,
        Self::UNREGISTER_TAG,
        Self::CALL_TAG,
        Self::INVOCATION_TAG,
        Self::CANCEL_TAG,
    ];

    /// The message type code.
    pub fn tag(&self) -> Integer {
        match self {
            Self::Hello(_) => Self::HELLO_TAG,
            Self::Welcome(_) => Self::WELCOME_TAG,
            Self::Abort(_) => Self::ABORT_TAG,
            Self::Challenge(_) => Self::CHALLENGE_TAG,
            Self::Authenticate(_) => Self::AUTHENTICATE_TAG,
            Self::Goodbye(_) => Self::GOODBYE_TAG,
            Self::Heartbeat(_) => Self::HEARTBEAT_TAG,
            Self::Error(_) => Self::ERROR_TAG,
            Self::Publish(_) => Self::PUBLISH_TAG,
            Self::Published(_) => Self::PUBLISHED_TAG,
            Self::Subscribe(_) => Self::SUBSCRIBE_TAG,
            Self::Subscribed(_) => Self::SUBSCRIBED_TAG,
            Self::Unsubscribe(_) => Self::UNSUBSCRIBE_TAG,
            Self::Unsubscribed(_) => Self::UNSUBSCRIBED_TAG,
            Self::Event(_) => Self::EVENT_TAG,
            Self::Call(_) => Self::CALL_TAG,
            Self::Cancel(_) => Self::CANCEL_TAG,
            Self::Result(_) => Self::RESULT_TAG,
            Self::Register(_) => Self::REGISTER_TAG,
            Self::Registered(_) => Self::REGISTERED_TAG,
            Self::Unregister(_) => Self::UNREGISTER_TAG,
            Self::Unregistered(_) => Self::UNREGISTERED_TAG,
            Self::Invocation(_) => Self::INVOCATION_TAG,
            Self::Interrupt(_) => Self::INTERRUPT_TAG,
            Self::Yield(_) => Self::YIELD_TAG,
        }
    }

    /// The message name, mostly for logging.
    pub fn message_name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "HELLO",
            Self::Welcome(_) => "WELCOME",
            Self::Abort(_) => "ABORT",
            Self::Challenge(_) => "CHALLENGE",
            Self::Authenticate(_) => "AUTHENTICATE",
            Self::Goodbye(_) => "GOODBYE",
            Self::Heartbeat(_) => "HEARTBEAT",
            Self::Error(_) => "ERROR",
            Self::Publish(_) => "PUBLISH",
            Self::Published(_) => "PUBLISHED",
            Self::Subscribe(_) => "SUBSCRIBE",
            Self::Subscribed(_) => "SUBSCRIBED",
            Self::Unsubscribe(_) => "UNSUBSCRIBE",
            Self::Unsubscribed(_) => "UNSUBSCRIBED",
            Self::Event(_) => "EVENT",
            Self::Call(_) => "CALL",
            Self::Cancel(_) => "CANCEL",
            Self::Result(_) => "RESULT",
            Self::Register(_) => "REGISTER",
            Self::Registered(_) => "REGISTERED",
            Self::Unregister(_) => "UNREGISTER",
            Self::Unregistered(_) => "UNREGISTERED",
            Self::Invocation(_) => "INVOCATION",
            Self::Interrupt(_) => "INTERRUPT",
            Self::Yield(_) => "YIELD",
        }
    }

    /// The request ID on the message.
    pub fn request_id(&self) -> Option<Id> {
        match self {
            Self::Error(message) => Some(message.request),
            Self::Publish(message) => Some(message.request),
            Self::Published(message) => Some(message.publish_request),
            Self::Subscribe(message) => Some(message.request),
            Self::Subscribed(message) => Some(message.subscribe_request),
            Self::Unsubscribe(message) => Some(message.request),
            Self::Unsubscribed(message) => Some(message.unsubscribe_request),
            Self::Call(message) => Some(message.request),
            Self::Cancel(message) => Some(message.call_request),
            Self::Result(message) => Some(message.call_request),
            Self::Register(message) => Some(message.request),
            Self::Registered(message) => Some(message.register_request),
            Self::Unregister(message) => Some(message.request),
            Self::Unregistered(message) => Some(message.unregister_request),
            Self::Invocation(message) => Some(message.request),
            Self::Interrupt(message) => Some(message.invocation_request),
            Self::Yield(message) => Some(message.invocation_request),
            _ => None,
        }
    }

    /// The details dictionary on the message.
    pub fn details(&self) -> Option<&Dictionary> {
        match self {
            Self::Hello(message) => Some(&message.details),
            Self::Welcome(message) => Some(&message.details),
            Self::Abort(message) => Some(&message.details),
            Self::Goodbye(message) => Some(&message.details),
            Self::Error(message) => Some(&message.details),
            Self::Unsubscribed(message) => Some(&message.details),
            Self::Event(message) => Some(&message.details),
            Self::Result(message) => Some(&message.details),
            Self::Unregistered(message) => Some(&message.details),
            Self::Invocation(message) => Some(&message.details),
            _ => None,
        }
    }

    /// The error reason on the message.
    pub fn reason(&self) -> Option<&Uri> {
        match self {
            Self::Abort(message) => Some(&message.reason),
            Self::Goodbye(message) => Some(&message.reason),
            Self::Error(message) => Some(&message.error),
            _ => None,
        }
    }

    /// Parses a message from its list form.
    pub fn parse(list: List) -> Result<Self, ProtocolError> {
        let tag = match list.first() {
            Some(Value::Integer(tag)) => *tag,
            Some(value) => {
                return Err(ProtocolError::new(format!(
                    "invalid type {} for message type",
                    value.type_name()
                )));
            }
            None => return Err(ProtocolError::new("empty message")),
        };
        match tag {
            Self::HELLO_TAG => parse_hello(list),
            Self::WELCOME_TAG => parse_welcome(list),
            Self::ABORT_TAG => parse_abort(list),
            Self::CHALLENGE_TAG => parse_challenge(list),
            Self::AUTHENTICATE_TAG => parse_authenticate(list),
            Self::GOODBYE_TAG => parse_goodbye(list),
            Self::HEARTBEAT_TAG => parse_heartbeat(list),
            Self::ERROR_TAG => parse_error(list),
            Self::PUBLISH_TAG => parse_publish(list),
            Self::PUBLISHED_TAG => parse_published(list),
            Self::SUBSCRIBE_TAG => parse_subscribe(list),
            Self::SUBSCRIBED_TAG => parse_subscribed(list),
            Self::UNSUBSCRIBE_TAG => parse_unsubscribe(list),
            Self::UNSUBSCRIBED_TAG => parse_unsubscribed(list),
            Self::EVENT_TAG => parse_event(list),
            Self::CALL_TAG => parse_call(list),
            Self::CANCEL_TAG => parse_cancel(list),
            Self::RESULT_TAG => parse_result(list),
            Self::REGISTER_TAG => parse_register(list),
            Self::REGISTERED_TAG => parse_registered(list),
            Self::UNREGISTER_TAG => parse_unregister(list),
            Self::UNREGISTERED_TAG => parse_unregistered(list),
            Self::INVOCATION_TAG => parse_invocation(list),
            Self::INTERRUPT_TAG => parse_interrupt(list),
            Self::YIELD_TAG => parse_yield(list),
            _ => Err(ProtocolError::new(format!("unknown message type {tag}"))),
        }
    }

    /// Marshals the message into its list form.
    pub fn marshal(&self) -> List {
        let mut list = List::from_iter([Value::Integer(self.tag())]);
        match self {
            Self::Hello(message) => {
                list.push(Value::from(message.realm.as_str()));
                list.push(Value::Dictionary(message.details.clone()));
            }
            Self::Welcome(message) => {
                list.push(Value::from(message.session));
                list.push(Value::Dictionary(message.details.clone()));
            }
            Self::Abort(message) => {
                list.push(Value::Dictionary(message.details.clone()));
                list.push(Value::from(message.reason.as_str()));
            }
            Self::Challenge(message) => {
                list.push(Value::from(message.auth_method.as_str()));
                list.push(Value::Dictionary(message.extra.clone()));
            }
            Self::Authenticate(message) => {
                list.push(Value::from(message.signature.as_str()));
                list.push(Value::Dictionary(message.extra.clone()));
            }
            Self::Goodbye(message) => {
                list.push(Value::Dictionary(message.details.clone()));
                list.push(Value::from(message.reason.as_str()));
            }
            Self::Heartbeat(message) => {
                list.push(Value::Integer(message.incoming));
                list.push(Value::Integer(message.outgoing));
                if let Some(discard) = &message.discard {
                    list.push(Value::from(discard.as_str()));
                }
            }
            Self::Error(message) => {
                list.push(Value::Integer(message.request_type));
                list.push(Value::from(message.request));
                list.push(Value::Dictionary(message.details.clone()));
                list.push(Value::from(message.error.as_str()));
                message.payload.marshal_into(&mut list);
            }
            Self::Publish(message) => {
                list.push(Value::from(message.request));
                list.push(Value::Dictionary(message.options.clone()));
                list.push(Value::from(message.topic.as_str()));
                message.payload.marshal_into(&mut list);
            }
            Self::Published(message) => {
                list.push(Value::from(message.publish_request));
                list.push(Value::from(message.publication));
            }
            Self::Subscribe(message) => {
                list.push(Value::from(message.request));
                list.push(Value::Dictionary(message.options.clone()));
                list.push(Value::from(message.topic.as_str()));
            }
            Self::Subscribed(message) => {
                list.push(Value::from(message.subscribe_request));
                list.push(Value::from(message.subscription));
            }
            Self::Unsubscribe(message) => {
                list.push(Value::from(message.request));
                list.push(Value::from(message.subscribed_subscription));
            }
            Self::Unsubscribed(message) => {
                list.push(Value::from(message.unsubscribe_request));
                if !message.details.is_empty() {
                    list.push(Value::Dictionary(message.details.clone()));
                }
            }
            Self::Event(message) => {
                list.push(Value::from(message.subscribed_subscription));
                list.push(Value::from(message.published_publication));
                list.push(Value::Dictionary(message.details.clone()));
                message.payload.marshal_into(&mut list);
            }
            Self::Call(message) => {
                list.push(Value::from(message.request));
                list.push(Value::Dictionary(message.options.clone()));
                list.push(Value::from(message.procedure.as_str()));
                message.payload.marshal_into(&mut list);
            }
            Self::Cancel(message) => {
                list.push(Value::from(message.call_request));
                list.push(Value::Dictionary(message.options.clone()));
            }
            Self::Result(message) => {
                list.push(Value::from(message.call_request));
                list.push(Value::Dictionary(message.details.clone()));
                message.payload.marshal_into(&mut list);
            }
            Self::Register(message) => {
                list.push(Value::from(message.request));
                list.push(Value::Dictionary(message.options.clone()));
                list.push(Value::from(message.procedure.as_str()));
            }
            Self::Registered(message) => {
                list.push(Value::from(message.register_request));
                list.push(Value::from(message.registration));
            }
            Self::Unregister(message) => {
                list.push(Value::from(message.request));
                list.push(Value::from(message.registered_registration));
            }
            Self::Unregistered(message) => {
                list.push(Value::from(message.unregister_request));
                if !message.details.is_empty() {
                    list.push(Value::Dictionary(message.details.clone()));
                }
            }
            Self::Invocation(message) => {
                list.push(Value::from(message.request));
                list.push(Value::from(message.registered_registration));
                list.push(Value::Dictionary(message.details.clone()));
                message.payload.marshal_into(&mut list);
            }
            Self::Interrupt(message) => {
                list.push(Value::from(message.invocation_request));
                list.push(Value::Dictionary(message.options.clone()));
            }
            Self::Yield(message) => {
                list.push(Value::from(message.invocation_request));
                list.push(Value::Dictionary(message.options.clone()));
                message.payload.marshal_into(&mut list);
            }
        }
        list
    }
}

impl From<Id> for Value {
    fn from(value: Id) -> Self {
        Value::Integer(value.value())
    }
}

fn parse_hello(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "HELLO";
    let mut fields = Fields::new(NAME, list, 3..=3)?;
    let realm = fields.uri("realm", MatchStyle::Exact)?;
    let details = fields.dictionary("details")?;
    validate_roles(NAME, &details, &PEER_ROLES)?;
    optional_string_list(NAME, &details, "authmethods")?;
    optional_string(NAME, &details, "authid")?;
    optional_string(NAME, &details, "authrole")?;
    optional_dictionary(NAME, &details, "authextra")?;
    optional_string(NAME, &details, "agent")?;
    optional_bool(NAME, &details, "resumable")?;
    optional_id(NAME, &details, "resume_session")?;
    optional_string(NAME, &details, "resume_token")?;
    Ok(Message::Hello(HelloMessage { realm, details }))
}

fn parse_welcome(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "WELCOME";
    let mut fields = Fields::new(NAME, list, 3..=3)?;
    let session = fields.id("session")?;
    let details = fields.dictionary("details")?;
    validate_roles(NAME, &details, &ROUTER_ROLES)?;
    for key in ["authid", "authrole", "authmethod", "authprovider", "agent", "resume_token"] {
        optional_string(NAME, &details, key)?;
    }
    optional_dictionary(NAME, &details, "authextra")?;
    optional_bool(NAME, &details, "resumed")?;
    optional_bool(NAME, &details, "resumable")?;
    Ok(Message::Welcome(WelcomeMessage { session, details }))
}

fn parse_abort(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "ABORT";
    let mut fields = Fields::new(NAME, list, 3..=3)?;
    let details = fields.dictionary("details")?;
    let reason = fields.uri("reason", MatchStyle::Exact)?;
    optional_string(NAME, &details, "message")?;
    Ok(Message::Abort(AbortMessage { details, reason }))
}

fn parse_challenge(list: List) -> Result<Message, ProtocolError> {
    let mut fields = Fields::new("CHALLENGE", list, 3..=3)?;
    let auth_method = fields.string("method")?;
    let extra = fields.dictionary("extra")?;
    Ok(Message::Challenge(ChallengeMessage { auth_method, extra }))
}

fn parse_authenticate(list: List) -> Result<Message, ProtocolError> {
    let mut fields = Fields::new("AUTHENTICATE", list, 3..=3)?;
    let signature = fields.string("signature")?;
    let extra = fields.dictionary("extra")?;
    Ok(Message::Authenticate(AuthenticateMessage { signature, extra }))
}

fn parse_goodbye(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "GOODBYE";
    let mut fields = Fields::new(NAME, list, 3..=3)?;
    let details = fields.dictionary("details")?;
    let reason = fields.uri("reason", MatchStyle::Exact)?;
    optional_string(NAME, &details, "message")?;
    optional_bool(NAME, &details, "resumable")?;
    Ok(Message::Goodbye(GoodbyeMessage { details, reason }))
}

fn parse_heartbeat(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "HEARTBEAT";
    let length = list.len();
    let mut fields = Fields::new(NAME, list, 3..=4)?;
    let incoming = fields.integer("incoming")?;
    let outgoing = fields.integer("outgoing")?;
    if outgoing == 0 {
        return Err(ProtocolError::new(format!(
            "invalid value 0 for 'outgoing' in {NAME}"
        )));
    }
    let discard = if length == 4 {
        Some(fields.string("discard")?)
    } else {
        None
    };
    Ok(Message::Heartbeat(HeartbeatMessage {
        incoming,
        outgoing,
        discard,
    }))
}

fn parse_error(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "ERROR";
    let mut fields = Fields::new(NAME, list, 5..=7)?;
    let request_type = fields.integer("request_type")?;
    if !Message::ERROR_REQUEST_TYPES.contains(&request_type) {
        return Err(ProtocolError::new(format!(
            "invalid value {request_type} for 'request_type' in {NAME}"
        )));
    }
    let request = fields.id("request")?;
    let details = fields.dictionary("details")?;
    let error = fields.uri("error", MatchStyle::Exact)?;
    let payload = Payload::parse(NAME, &details, fields.rest())?;
    Ok(Message::Error(ErrorMessage {
        request_type,
        request,
        details,
        error,
        payload,
    }))
}

fn parse_publish(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "PUBLISH";
    let mut fields = Fields::new(NAME, list, 4..=6)?;
    let request = fields.id("request")?;
    let options = fields.dictionary("options")?;
    let topic = fields.uri("topic", MatchStyle::Exact)?;
    for key in ["acknowledge", "exclude_me", "disclose_me", "retain"] {
        optional_bool(NAME, &options, key)?;
    }
    optional_id_list(NAME, &options, "exclude")?;
    optional_id_list(NAME, &options, "eligible")?;
    for key in [
        "exclude_authid",
        "exclude_authrole",
        "eligible_authid",
        "eligible_authrole",
    ] {
        optional_string_list(NAME, &options, key)?;
    }
    let payload = Payload::parse(NAME, &options, fields.rest())?;
    Ok(Message::Publish(PublishMessage {
        request,
        options,
        topic,
        payload,
    }))
}

fn parse_published(list: List) -> Result<Message, ProtocolError> {
    let mut fields = Fields::new("PUBLISHED", list, 3..=3)?;
    Ok(Message::Published(PublishedMessage {
        publish_request: fields.id("request")?,
        publication: fields.id("publication")?,
    }))
}

fn parse_subscribe(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "SUBSCRIBE";
    let mut fields = Fields::new(NAME, list, 4..=4)?;
    let request = fields.id("request")?;
    let options = fields.dictionary("options")?;
    let match_style = optional_enum::<MatchStyle>(NAME, &options, "match")?.unwrap_or_default();
    optional_bool(NAME, &options, "get_retained")?;
    let topic = fields.uri("topic", match_style)?;
    Ok(Message::Subscribe(SubscribeMessage {
        request,
        options,
        topic,
    }))
}

fn parse_subscribed(list: List) -> Result<Message, ProtocolError> {
    let mut fields = Fields::new("SUBSCRIBED", list, 3..=3)?;
    Ok(Message::Subscribed(SubscribedMessage {
        subscribe_request: fields.id("request")?,
        subscription: fields.id("subscription")?,
    }))
}

fn parse_unsubscribe(list: List) -> Result<Message, ProtocolError> {
    let mut fields = Fields::new("UNSUBSCRIBE", list, 3..=3)?;
    Ok(Message::Unsubscribe(UnsubscribeMessage {
        request: fields.id("request")?,
        subscribed_subscription: fields.id("subscription")?,
    }))
}

fn parse_unsubscribed(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "UNSUBSCRIBED";
    let length = list.len();
    let mut fields = Fields::new(NAME, list, 2..=3)?;
    let unsubscribe_request = fields.id("request")?;
    let details = if length == 3 {
        fields.dictionary("details")?
    } else {
        Dictionary::default()
    };
    optional_id(NAME, &details, "subscription")?;
    optional_uri(NAME, &details, "reason")?;
    Ok(Message::Unsubscribed(UnsubscribedMessage {
        unsubscribe_request,
        details,
    }))
}

fn parse_event(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "EVENT";
    let mut fields = Fields::new(NAME, list, 4..=6)?;
    let subscribed_subscription = fields.id("subscription")?;
    let published_publication = fields.id("publication")?;
    let details = fields.dictionary("details")?;
    optional_id(NAME, &details, "publisher")?;
    optional_string(NAME, &details, "publisher_authid")?;
    optional_string(NAME, &details, "publisher_authrole")?;
    optional_uri(NAME, &details, "topic")?;
    optional_bool(NAME, &details, "retained")?;
    let payload = Payload::parse(NAME, &details, fields.rest())?;
    Ok(Message::Event(EventMessage {
        subscribed_subscription,
        published_publication,
        details,
        payload,
    }))
}

fn parse_call(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "CALL";
    let mut fields = Fields::new(NAME, list, 4..=6)?;
    let request = fields.id("request")?;
    let options = fields.dictionary("options")?;
    let procedure = fields.uri("procedure", MatchStyle::Exact)?;
    optional_integer(NAME, &options, "timeout")?;
    optional_bool(NAME, &options, "receive_progress")?;
    optional_bool(NAME, &options, "disclose_me")?;
    let payload = Payload::parse(NAME, &options, fields.rest())?;
    Ok(Message::Call(CallMessage {
        request,
        options,
        procedure,
        payload,
    }))
}

fn parse_cancel(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "CANCEL";
    let mut fields = Fields::new(NAME, list, 3..=3)?;
    let call_request = fields.id("request")?;
    let options = fields.dictionary("options")?;
    optional_enum::<CallCancelMode>(NAME, &options, "mode")?;
    Ok(Message::Cancel(CancelMessage {
        call_request,
        options,
    }))
}

fn parse_result(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "RESULT";
    let mut fields = Fields::new(NAME, list, 3..=5)?;
    let call_request = fields.id("request")?;
    let details = fields.dictionary("details")?;
    optional_bool(NAME, &details, "progress")?;
    let payload = Payload::parse(NAME, &details, fields.rest())?;
    Ok(Message::Result(ResultMessage {
        call_request,
        details,
        payload,
    }))
}

fn parse_register(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "REGISTER";
    let mut fields = Fields::new(NAME, list, 4..=4)?;
    let request = fields.id("request")?;
    let options = fields.dictionary("options")?;
    let match_style = optional_enum::<MatchStyle>(NAME, &options, "match")?.unwrap_or_default();
    optional_enum::<InvocationPolicy>(NAME, &options, "invoke")?;
    if let Some(concurrency) = optional_integer(NAME, &options, "concurrency")? {
        if concurrency < 1 {
            return Err(ProtocolError::new(format!(
                "invalid value {concurrency} for 'concurrency' in {NAME}"
            )));
        }
    }
    optional_bool(NAME, &options, "force_reregister")?;
    optional_bool(NAME, &options, "disclose_caller")?;
    let procedure = fields.uri("procedure", match_style)?;
    Ok(Message::Register(RegisterMessage {
        request,
        options,
        procedure,
    }))
}

fn parse_registered(list: List) -> Result<Message, ProtocolError> {
    let mut fields = Fields::new("REGISTERED", list, 3..=3)?;
    Ok(Message::Registered(RegisteredMessage {
        register_request: fields.id("request")?,
        registration: fields.id("registration")?,
    }))
}

fn parse_unregister(list: List) -> Result<Message, ProtocolError> {
    let mut fields = Fields::new("UNREGISTER", list, 3..=3)?;
    Ok(Message::Unregister(UnregisterMessage {
        request: fields.id("request")?,
        registered_registration: fields.id("registration")?,
    }))
}

fn parse_unregistered(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "UNREGISTERED";
    let length = list.len();
    let mut fields = Fields::new(NAME, list, 2..=3)?;
    let unregister_request = fields.id("request")?;
    let details = if length == 3 {
        fields.dictionary("details")?
    } else {
        Dictionary::default()
    };
    optional_id(NAME, &details, "registration")?;
    optional_uri(NAME, &details, "reason")?;
    Ok(Message::Unregistered(UnregisteredMessage {
        unregister_request,
        details,
    }))
}

fn parse_invocation(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "INVOCATION";
    let mut fields = Fields::new(NAME, list, 4..=6)?;
    let request = fields.id("request")?;
    let registered_registration = fields.id("registration")?;
    let details = fields.dictionary("details")?;
    optional_integer(NAME, &details, "timeout")?;
    optional_bool(NAME, &details, "receive_progress")?;
    optional_id(NAME, &details, "caller")?;
    optional_string(NAME, &details, "caller_authid")?;
    optional_string(NAME, &details, "caller_authrole")?;
    optional_uri(NAME, &details, "procedure")?;
    let payload = Payload::parse(NAME, &details, fields.rest())?;
    Ok(Message::Invocation(InvocationMessage {
        request,
        registered_registration,
        details,
        payload,
    }))
}

fn parse_interrupt(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "INTERRUPT";
    let mut fields = Fields::new(NAME, list, 3..=3)?;
    let invocation_request = fields.id("request")?;
    let options = fields.dictionary("options")?;
    optional_enum::<InterruptMode>(NAME, &options, "mode")?;
    Ok(Message::Interrupt(InterruptMessage {
        invocation_request,
        options,
    }))
}

fn parse_yield(list: List) -> Result<Message, ProtocolError> {
    const NAME: &str = "YIELD";
    let mut fields = Fields::new(NAME, list, 3..=5)?;
    let invocation_request = fields.id("request")?;
    let options = fields.dictionary("options")?;
    optional_bool(NAME, &options, "progress")?;
    let payload = Payload::parse(NAME, &options, fields.rest())?;
    Ok(Message::Yield(YieldMessage {
        invocation_request,
        options,
        payload,
    }))
}

#[cfg(test)]
mod message_test {
    use crate::{
        core::{
            id::Id,
            invocation_policy::InvocationPolicy,
            match_style::MatchStyle,
            types::{
                Dictionary,
                List,
                Value,
            },
            uri::Uri,
        },
        message::{
            message::{
                CallMessage,
                ErrorMessage,
                EventMessage,
                HelloMessage,
                Message,
                PublishMessage,
                RegisterMessage,
                UnsubscribedMessage,
            },
            payload::Payload,
        },
    };

    fn parse_json(json: &str) -> Result<Message, String> {
        let list = serde_json::from_str::<Value>(json)
            .unwrap()
            .into_list()
            .unwrap();
        Message::parse(list).map_err(|err| err.to_string())
    }

    fn to_json(message: &Message) -> String {
        serde_json::to_string(&Value::List(message.marshal())).unwrap()
    }

    fn dictionary<const N: usize>(entries: [(&str, Value); N]) -> Dictionary {
        entries
            .into_iter()
            .map(|(key, value)| (key.to_owned(), value))
            .collect()
    }

    #[test]
    fn parses_hello_with_roles() {
        assert_matches::assert_matches!(
            parse_json(r#"[1, "r1", {"roles": {"subscriber": {}, "caller": {"features": {"progressive_call_results": true}}}, "authmethods": ["ticket"], "authid": "joe"}]"#),
            Ok(Message::Hello(message)) => {
                pretty_assertions::assert_eq!(message.realm.as_str(), "r1");
                pretty_assertions::assert_eq!(message.auth_methods(), Vec::from_iter(["ticket".to_owned()]));
                assert_matches::assert_matches!(message.auth_id(), Some("joe"));
                assert!(message.roles().unwrap().contains_key("caller"));
            }
        );
    }

    #[test]
    fn rejects_invalid_hello() {
        assert_matches::assert_matches!(parse_json(r#"[1, "r1", {}]"#), Err(err) => {
            assert!(err.contains("roles"), "{err}");
        });
        assert_matches::assert_matches!(parse_json(r#"[1, "r1", {"roles": {"broker": {}}}]"#), Err(err) => {
            assert!(err.contains("invalid role 'broker'"), "{err}");
        });
        assert_matches::assert_matches!(parse_json(r#"[1, "r1", {"roles": {"caller": {}}, "authid": 1}]"#), Err(_));
        assert_matches::assert_matches!(parse_json(r#"[1, "r 1", {"roles": {"caller": {}}}]"#), Err(_));
        assert_matches::assert_matches!(parse_json(r#"[1, "r1"]"#), Err(err) => {
            pretty_assertions::assert_eq!(err, "invalid message length 2 for HELLO");
        });
    }

    #[test]
    fn parses_subscribe_with_pattern() {
        assert_matches::assert_matches!(
            parse_json(r#"[32, 1, {"match": "wildcard"}, "com..topic"]"#),
            Ok(Message::Subscribe(message)) => {
                pretty_assertions::assert_eq!(message.match_style(), MatchStyle::Wildcard);
                pretty_assertions::assert_eq!(message.topic.as_str(), "com..topic");
            }
        );
        assert_matches::assert_matches!(parse_json(r#"[32, 1, {}, "com..topic"]"#), Err(_));
        assert_matches::assert_matches!(parse_json(r#"[32, 1, {"match": "fuzzy"}, "com.x"]"#), Err(_));
    }

    #[test]
    fn parses_register_options() {
        assert_matches::assert_matches!(
            parse_json(r#"[64, 3, {"match": "prefix", "invoke": "roundrobin", "force_reregister": true}, "com.myapp."]"#),
            Ok(Message::Register(message)) => {
                pretty_assertions::assert_eq!(message, RegisterMessage {
                    request: Id::try_from(3).unwrap(),
                    options: dictionary([
                        ("match", Value::from("prefix")),
                        ("invoke", Value::from("roundrobin")),
                        ("force_reregister", Value::Bool(true)),
                    ]),
                    procedure: Uri::for_match("com.myapp.", MatchStyle::Prefix).unwrap(),
                });
                pretty_assertions::assert_eq!(message.invocation_policy(), InvocationPolicy::RoundRobin);
                assert!(message.force_reregister());
            }
        );
        assert_matches::assert_matches!(parse_json(r#"[64, 3, {"concurrency": 0}, "com.x"]"#), Err(_));
        assert_matches::assert_matches!(parse_json(r#"[64, 3, {"force_reregister": 1}, "com.x"]"#), Err(_));
    }

    #[test]
    fn parses_call_with_arguments() {
        assert_matches::assert_matches!(
            parse_json(r#"[48, 9, {"receive_progress": true}, "com.add", [2, 3]]"#),
            Ok(Message::Call(message)) => {
                pretty_assertions::assert_eq!(message, CallMessage {
                    request: Id::try_from(9).unwrap(),
                    options: dictionary([("receive_progress", Value::Bool(true))]),
                    procedure: Uri::try_from("com.add").unwrap(),
                    payload: Payload::from_arguments(List::from_iter([Value::Integer(2), Value::Integer(3)])),
                });
                assert!(message.receive_progress());
            }
        );
        assert_matches::assert_matches!(parse_json(r#"[48, 9, {}, "com.add", [2], {}, 1]"#), Err(_));
        assert_matches::assert_matches!(parse_json(r#"[48, 9, {}, "com.add", {"a": 1}]"#), Err(_));
    }

    #[test]
    fn validates_error_request_type() {
        assert_matches::assert_matches!(
            parse_json(r#"[8, 68, 12, {}, "com.myapp.error", ["oops"]]"#),
            Ok(Message::Error(message)) => {
                pretty_assertions::assert_eq!(message.request_type, Message::INVOCATION_TAG);
                pretty_assertions::assert_eq!(message.payload.arguments(), &[Value::from("oops")]);
            }
        );
        assert_matches::assert_matches!(parse_json(r#"[8, 2, 12, {}, "com.myapp.error"]"#), Err(_));
        assert_matches::assert_matches!(parse_json(r#"[8, 68, 12, {}]"#), Err(_));
    }

    #[test]
    fn parses_unsubscribed_with_and_without_details() {
        assert_matches::assert_matches!(
            parse_json(r#"[35, 5]"#),
            Ok(Message::Unsubscribed(message)) => {
                pretty_assertions::assert_eq!(message, UnsubscribedMessage {
                    unsubscribe_request: Id::try_from(5).unwrap(),
                    details: Dictionary::default(),
                });
            }
        );
        assert_matches::assert_matches!(
            parse_json(r#"[35, 0, {"subscription": 7, "reason": "wamp.close.killed"}]"#),
            Ok(Message::Unsubscribed(message)) => {
                pretty_assertions::assert_eq!(message.unsubscribe_request, Id::MIN);
            }
        );
        assert_matches::assert_matches!(parse_json(r#"[35, 0, {"reason": "bad reason"}]"#), Err(_));
    }

    #[test]
    fn validates_heartbeat() {
        assert_matches::assert_matches!(
            parse_json(r#"[7, 0, 1, "padding"]"#),
            Ok(Message::Heartbeat(message)) => {
                pretty_assertions::assert_eq!(message.discard.as_deref(), Some("padding"));
            }
        );
        assert_matches::assert_matches!(parse_json(r#"[7, 1, 0]"#), Err(_));
    }

    #[test]
    fn rejects_unknown_message_types() {
        assert_matches::assert_matches!(parse_json(r#"[99, 1]"#), Err(err) => {
            pretty_assertions::assert_eq!(err, "unknown message type 99");
        });
        assert_matches::assert_matches!(parse_json(r#"["HELLO", 1]"#), Err(_));
        assert_matches::assert_matches!(parse_json(r#"[]"#), Err(_));
    }

    #[test]
    fn rejects_invalid_custom_attributes() {
        assert_matches::assert_matches!(
            parse_json(r#"[16, 1, {"x_trace": "a"}, "com.x"]"#),
            Ok(Message::Publish(message)) => {
                assert!(message.options.contains_key("x_trace"));
            }
        );
        assert_matches::assert_matches!(parse_json(r#"[16, 1, {"x_Trace": "a"}, "com.x"]"#), Err(_));
    }

    #[test]
    fn marshals_minimal_lists() {
        pretty_assertions::assert_eq!(
            to_json(&Message::Event(EventMessage {
                subscribed_subscription: Id::try_from(5).unwrap(),
                published_publication: Id::try_from(6).unwrap(),
                details: Dictionary::default(),
                payload: Payload::default(),
            })),
            "[36,5,6,{}]"
        );
        pretty_assertions::assert_eq!(
            to_json(&Message::Error(ErrorMessage {
                request_type: Message::PUBLISH_TAG,
                request: Id::try_from(42).unwrap(),
                details: Dictionary::default(),
                error: Uri::try_from("wamp.error.not_authorized").unwrap(),
                payload: Payload::from_arguments(List::from_iter([Value::from("no")])),
            })),
            r#"[8,16,42,{},"wamp.error.not_authorized",["no"]]"#
        );
        pretty_assertions::assert_eq!(
            to_json(&Message::Publish(PublishMessage {
                request: Id::try_from(7).unwrap(),
                options: Dictionary::default(),
                topic: Uri::try_from("com.x").unwrap(),
                payload: Payload::new(
                    List::default(),
                    dictionary([("k", Value::from("v"))])
                ),
            })),
            r#"[16,7,{},"com.x",[],{"k":"v"}]"#
        );
    }

    #[test]
    fn parses_marshaled_messages() {
        let messages = [
            Message::Hello(HelloMessage {
                realm: Uri::try_from("com.myapp.realm").unwrap(),
                details: dictionary([(
                    "roles",
                    Value::Dictionary(dictionary([(
                        "publisher",
                        Value::Dictionary(Dictionary::default()),
                    )])),
                )]),
            }),
            Message::Publish(PublishMessage {
                request: Id::try_from(7).unwrap(),
                options: dictionary([("acknowledge", Value::Bool(true))]),
                topic: Uri::try_from("com.x").unwrap(),
                payload: Payload::new(
                    List::from_iter([Value::Integer(1), Value::SignedInteger(-2)]),
                    dictionary([("k", Value::from("v"))]),
                ),
            }),
            Message::Event(EventMessage {
                subscribed_subscription: Id::try_from(5).unwrap(),
                published_publication: Id::try_from(6).unwrap(),
                details: dictionary([("enc_algo", Value::from("cryptobox"))]),
                payload: Payload::Transparent(Vec::from_iter([0, 1, 2])),
            }),
        ];
        for message in messages {
            pretty_assertions::assert_eq!(Message::parse(message.marshal()), Ok(message));
        }
    }
}
