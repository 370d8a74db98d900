use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use log::{
    debug,
    info,
    trace,
    warn,
};
use tokio::sync::{
    broadcast,
    mpsc::UnboundedSender,
};

use crate::{
    core::{
        close::CloseReason,
        error::{
            BasicError,
            ChannelTransmittableError,
            ChannelTransmittableResult,
            InteractionError,
        },
        id::{
            Id,
            IdAllocator,
            SequentialIdAllocator,
        },
        service::MessageSender,
        types::{
            Dictionary,
            HashMap,
            List,
            Value,
        },
        uri::Uri,
    },
    message::{
        common::{
            abort_message_for_error,
            goodbye_and_out,
        },
        message::{
            ChallengeMessage,
            ErrorMessage,
            Message,
            WelcomeMessage,
            YieldMessage,
        },
        payload::Payload,
    },
};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const RESULT_CHANNEL_CAPACITY: usize = 64;

/// An event received on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// The publication ID, assigned by the broker.
    pub publication: Id,
    /// The event payload.
    pub payload: Payload,
    /// Event details.
    pub details: Dictionary,
}

impl Event {
    /// The topic the event was published to, present on pattern-based subscriptions.
    pub fn topic(&self) -> Option<&str> {
        self.details.get("topic").and_then(Value::string)
    }

    /// The publishing session, if disclosed.
    pub fn publisher(&self) -> Option<Id> {
        self.details
            .get("publisher")
            .and_then(Value::integer)
            .and_then(|id| Id::try_from(id).ok())
    }
}

/// The result of a procedure invocation, produced by a callee.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RpcYield {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

impl From<RpcYield> for Payload {
    fn from(value: RpcYield) -> Self {
        Payload::new(value.arguments, value.arguments_keyword)
    }
}

/// An invocation of a registered procedure.
///
/// The callee answers the invocation with [`Self::respond`]. Progressive results may be sent
/// beforehand with [`Self::progress`] when the caller asked for them.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// The invocation request ID, assigned by the dealer.
    pub id: Id,
    /// The registration being invoked.
    pub registration: Id,
    /// The call payload.
    pub payload: Payload,
    /// Invocation details.
    pub details: Dictionary,

    message_tx: UnboundedSender<Message>,
}

impl Invocation {
    /// The procedure that was called, present on pattern-based registrations.
    pub fn procedure(&self) -> Option<&str> {
        self.details.get("procedure").and_then(Value::string)
    }

    /// The calling session, if disclosed.
    pub fn caller(&self) -> Option<Id> {
        self.details
            .get("caller")
            .and_then(Value::integer)
            .and_then(|id| Id::try_from(id).ok())
    }

    /// The authentication ID of the calling session, if disclosed.
    pub fn caller_auth_id(&self) -> Option<&str> {
        self.details.get("caller_authid").and_then(Value::string)
    }

    /// Whether the caller accepts progressive results.
    pub fn receive_progress(&self) -> bool {
        self.details
            .get("receive_progress")
            .and_then(Value::bool)
            .unwrap_or(false)
    }

    /// The call timeout requested by the caller.
    pub fn timeout(&self) -> Option<Duration> {
        self.details
            .get("timeout")
            .and_then(Value::integer)
            .filter(|timeout| *timeout > 0)
            .map(Duration::from_millis)
    }

    fn send(&self, message: Message) -> Result<()> {
        self.message_tx.send(message).map_err(Error::new)
    }

    /// Sends a progressive result.
    pub fn progress(&self, result: RpcYield) -> Result<()> {
        if !self.receive_progress() {
            return Err(BasicError::NotAllowed(
                "caller did not request progressive results".to_owned(),
            )
            .into());
        }
        self.send(Message::Yield(YieldMessage {
            invocation_request: self.id,
            options: Dictionary::from_iter([("progress".to_owned(), Value::Bool(true))]),
            payload: result.into(),
        }))
    }

    /// Sends the final result, or an error, for the invocation.
    pub fn respond(self, result: Result<RpcYield>) -> Result<()> {
        match result {
            Ok(result) => self.respond_ok(result),
            Err(err) => self.respond_error(&err),
        }
    }

    /// Sends the final result for the invocation.
    pub fn respond_ok(self, result: RpcYield) -> Result<()> {
        self.send(Message::Yield(YieldMessage {
            invocation_request: self.id,
            options: Dictionary::default(),
            payload: result.into(),
        }))
    }

    /// Sends an error for the invocation.
    ///
    /// The error URI is derived from the error, so a [`crate::core::error::WampError`] reaches the
    /// caller unchanged.
    pub fn respond_error(self, error: &Error) -> Result<()> {
        self.send(Message::Error(ErrorMessage {
            request_type: Message::INVOCATION_TAG,
            request: self.id,
            details: Dictionary::default(),
            error: Uri::for_error(error),
            payload: Payload::from_arguments(List::from_iter([Value::String(error.to_string())])),
        }))
    }
}

/// Messages passed from the session to the peer object.
pub mod peer_session_message {
    use tokio::sync::broadcast;

    use crate::{
        core::{
            id::Id,
            uri::Uri,
        },
        message::{
            message::WelcomeMessage,
            payload::Payload,
        },
        peer::session::{
            Event,
            Invocation,
        },
    };

    #[derive(Debug, Clone)]
    pub struct EstablishedSession {
        pub realm: Uri,
        pub welcome_message: WelcomeMessage,
    }

    #[derive(Debug)]
    pub struct Subscription {
        pub request_id: Id,
        pub subscription_id: Id,
        pub event_rx: broadcast::Receiver<Event>,
    }

    impl Clone for Subscription {
        fn clone(&self) -> Self {
            Self {
                request_id: self.request_id,
                subscription_id: self.subscription_id,
                event_rx: self.event_rx.resubscribe(),
            }
        }
    }

    #[derive(Debug)]
    pub struct Registration {
        pub request_id: Id,
        pub registration_id: Id,
        pub invocation_rx: broadcast::Receiver<Invocation>,
    }

    impl Clone for Registration {
        fn clone(&self) -> Self {
            Self {
                request_id: self.request_id,
                registration_id: self.registration_id,
                invocation_rx: self.invocation_rx.resubscribe(),
            }
        }
    }

    /// Acknowledgement of a request that carries no data.
    #[derive(Debug, Clone, Copy)]
    pub struct Acknowledgement {
        pub request_id: Id,
    }

    #[derive(Debug, Clone)]
    pub struct RpcResult {
        pub request_id: Id,
        pub payload: Payload,
        pub progress: bool,
    }
}

type ResultSender<T> = broadcast::Sender<ChannelTransmittableResult<T>>;
type ResultReceiver<T> = broadcast::Receiver<ChannelTransmittableResult<T>>;

fn error_from_abort(reason: &Uri, details: &Dictionary) -> ChannelTransmittableError {
    ChannelTransmittableError {
        reason: reason.clone(),
        message: details
            .get("message")
            .and_then(Value::string)
            .unwrap_or_default()
            .to_owned(),
        request_id: None,
    }
}

fn error_from_error_message(message: &ErrorMessage) -> ChannelTransmittableError {
    ChannelTransmittableError {
        reason: message.error.clone(),
        message: message
            .payload
            .arguments()
            .first()
            .and_then(Value::string)
            .unwrap_or_default()
            .to_owned(),
        request_id: Some(message.request),
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
enum SessionState {
    #[default]
    Closed,
    Establishing {
        realm: Uri,
    },
    Established {
        session_id: Id,
    },
    Closing,
}

impl SessionState {
    fn allowed_state_transition(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Closed, Self::Establishing { .. }) => true,
            (Self::Establishing { .. }, Self::Closed) => true,
            (Self::Establishing { .. }, Self::Established { .. }) => true,
            (Self::Established { .. }, Self::Closing) => true,
            (Self::Established { .. }, Self::Closed) => true,
            (Self::Closing, Self::Closed) => true,
            _ => false,
        }
    }
}

/// A handle to the peer's session, for subscribing to the results of requests.
pub struct SessionHandle {
    id_allocator: Arc<dyn IdAllocator>,
    current_session_id: Arc<std::sync::Mutex<Option<Id>>>,
    established_session_tx: ResultSender<peer_session_message::EstablishedSession>,
    auth_challenge_tx: broadcast::Sender<ChallengeMessage>,
    closed_session_tx: broadcast::Sender<()>,
    subscribed_tx: ResultSender<peer_session_message::Subscription>,
    unsubscribed_tx: ResultSender<peer_session_message::Acknowledgement>,
    published_tx: ResultSender<peer_session_message::Acknowledgement>,
    registered_tx: ResultSender<peer_session_message::Registration>,
    unregistered_tx: ResultSender<peer_session_message::Acknowledgement>,
    rpc_result_tx: ResultSender<peer_session_message::RpcResult>,
}

impl SessionHandle {
    pub fn id_allocator(&self) -> Arc<dyn IdAllocator> {
        self.id_allocator.clone()
    }

    pub fn current_session_id(&self) -> Option<Id> {
        self.current_session_id
            .lock()
            .ok()
            .and_then(|session_id| *session_id)
    }

    pub fn established_session_rx(
        &self,
    ) -> ResultReceiver<peer_session_message::EstablishedSession> {
        self.established_session_tx.subscribe()
    }

    pub fn auth_challenge_rx(
        &self,
    ) -> broadcast::Receiver<ChallengeMessage> {
        self.auth_challenge_tx.subscribe()
    }

    pub fn closed_session_rx(&self) -> broadcast::Receiver<()> {
        self.closed_session_tx.subscribe()
    }

    pub fn subscribed_rx(&self) -> ResultReceiver<peer_session_message::Subscription> {
        self.subscribed_tx.subscribe()
    }

    pub fn unsubscribed_rx(&self) -> ResultReceiver<peer_session_message::Acknowledgement> {
        self.unsubscribed_tx.subscribe()
    }

    pub fn published_rx(&self) -> ResultReceiver<peer_session_message::Acknowledgement> {
        self.published_tx.subscribe()
    }

    pub fn registered_rx(&self) -> ResultReceiver<peer_session_message::Registration> {
        self.registered_tx.subscribe()
    }

    pub fn unregistered_rx(&self) -> ResultReceiver<peer_session_message::Acknowledgement> {
        self.unregistered_tx.subscribe()
    }

    pub fn rpc_result_rx(&self) -> ResultReceiver<peer_session_message::RpcResult> {
        self.rpc_result_tx.subscribe()
    }
}

/// The client side of a WAMP session.
///
/// A session object lives as long as its connection, so it may establish multiple WAMP sessions
/// one after another.
pub struct Session {
    name: String,
    state: SessionState,
    message_tx: UnboundedSender<Message>,
    service_message_tx: MessageSender,
    id_allocator: Arc<dyn IdAllocator>,
    current_session_id: Arc<std::sync::Mutex<Option<Id>>>,

    subscriptions: HashMap<Id, broadcast::Sender<Event>>,
    procedures: HashMap<Id, broadcast::Sender<Invocation>>,
    // Request ID to the subscription or registration it removes.
    pending_unsubscribes: HashMap<Id, Id>,
    pending_unregisters: HashMap<Id, Id>,

    established_session_tx: ResultSender<peer_session_message::EstablishedSession>,
    auth_challenge_tx: broadcast::Sender<ChallengeMessage>,
    closed_session_tx: broadcast::Sender<()>,
    subscribed_tx: ResultSender<peer_session_message::Subscription>,
    unsubscribed_tx: ResultSender<peer_session_message::Acknowledgement>,
    published_tx: ResultSender<peer_session_message::Acknowledgement>,
    registered_tx: ResultSender<peer_session_message::Registration>,
    unregistered_tx: ResultSender<peer_session_message::Acknowledgement>,
    rpc_result_tx: ResultSender<peer_session_message::RpcResult>,
}

impl Session {
    pub fn new(
        name: String,
        message_tx: UnboundedSender<Message>,
        service_message_tx: MessageSender,
    ) -> Self {
        let (established_session_tx, _) = broadcast::channel(16);
        let (auth_challenge_tx, _) = broadcast::channel(16);
        let (closed_session_tx, _) = broadcast::channel(16);
        let (subscribed_tx, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        let (unsubscribed_tx, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        let (published_tx, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        let (registered_tx, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        let (unregistered_tx, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        let (rpc_result_tx, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        Self {
            name,
            state: SessionState::default(),
            message_tx,
            service_message_tx,
            id_allocator: Arc::new(SequentialIdAllocator::default()),
            current_session_id: Arc::new(std::sync::Mutex::new(None)),
            subscriptions: HashMap::default(),
            procedures: HashMap::default(),
            pending_unsubscribes: HashMap::default(),
            pending_unregisters: HashMap::default(),
            established_session_tx,
            auth_challenge_tx,
            closed_session_tx,
            subscribed_tx,
            unsubscribed_tx,
            published_tx,
            registered_tx,
            unregistered_tx,
            rpc_result_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn session_handle(&self) -> SessionHandle {
        SessionHandle {
            id_allocator: self.id_allocator.clone(),
            current_session_id: self.current_session_id.clone(),
            established_session_tx: self.established_session_tx.clone(),
            auth_challenge_tx: self.auth_challenge_tx.clone(),
            closed_session_tx: self.closed_session_tx.clone(),
            subscribed_tx: self.subscribed_tx.clone(),
            unsubscribed_tx: self.unsubscribed_tx.clone(),
            published_tx: self.published_tx.clone(),
            registered_tx: self.registered_tx.clone(),
            unregistered_tx: self.unregistered_tx.clone(),
            rpc_result_tx: self.rpc_result_tx.clone(),
        }
    }

    /// Sends a message to the router, tracking the session state it implies.
    pub fn send_message(&mut self, message: Message) -> Result<()> {
        self.transition_state_from_sending_message(&message)?;
        self.service_message_tx.send(message)
    }

    fn transition_state_from_sending_message(&mut self, message: &Message) -> Result<()> {
        let next_state = match message {
            Message::Hello(message) => SessionState::Establishing {
                realm: message.realm.clone(),
            },
            Message::Abort(_) => SessionState::Closed,
            Message::Goodbye(_) => match self.state {
                SessionState::Closing => SessionState::Closed,
                _ => SessionState::Closing,
            },
            Message::Unsubscribe(message) => {
                self.pending_unsubscribes
                    .insert(message.request, message.subscribed_subscription);
                return Ok(());
            }
            Message::Unregister(message) => {
                self.pending_unregisters
                    .insert(message.request, message.registered_registration);
                return Ok(());
            }
            _ => return Ok(()),
        };
        self.transition_state(next_state)
    }

    /// Handles a message from the router.
    ///
    /// A message the session cannot handle aborts the session.
    pub async fn handle_message(&mut self, message: Message) -> Result<()> {
        trace!("Peer {} received message: {message:?}", self.name);
        if let Err(err) = self.handle_message_on_state_machine(message) {
            if !self.closed() {
                self.send_message(abort_message_for_error(&err))?;
            }
            return Err(err);
        }
        Ok(())
    }

    fn handle_message_on_state_machine(&mut self, message: Message) -> Result<()> {
        match self.state {
            SessionState::Closed => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on a closed session",
                message.message_name()
            ))
            .into()),
            SessionState::Establishing { .. } => self.handle_establishing(message),
            SessionState::Established { .. } => self.handle_established(message),
            SessionState::Closing => self.handle_closing(message),
        }
    }

    fn handle_establishing(&mut self, message: Message) -> Result<()> {
        let realm = match &self.state {
            SessionState::Establishing { realm } => realm.clone(),
            _ => return Err(Error::msg("session is not in the establishing state")),
        };
        match message {
            Message::Welcome(message) => self.establish(realm, message),
            Message::Challenge(message) => {
                self.auth_challenge_tx.send(message).ok();
                Ok(())
            }
            Message::Abort(message) => {
                self.transition_state(SessionState::Closed)?;
                self.established_session_tx
                    .send(Err(error_from_abort(&message.reason, &message.details)))
                    .ok();
                Ok(())
            }
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on an establishing session",
                message.message_name()
            ))
            .into()),
        }
    }

    fn establish(&mut self, realm: Uri, message: WelcomeMessage) -> Result<()> {
        let session_id = message.session;
        self.transition_state(SessionState::Established { session_id })?;
        if let Ok(mut current_session_id) = self.current_session_id.lock() {
            *current_session_id = Some(session_id);
        }
        info!(
            "Peer {} started session {session_id} on realm {realm}",
            self.name
        );
        self.established_session_tx
            .send(Ok(peer_session_message::EstablishedSession {
                realm,
                welcome_message: message,
            }))
            .ok();
        Ok(())
    }

    fn handle_established(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Abort(message) => {
                warn!(
                    "Peer session {} aborted by router: {} {:?}",
                    self.name, message.reason, message.details
                );
                self.transition_state(SessionState::Closed)
            }
            Message::Goodbye(message) => {
                match CloseReason::try_from(&message.reason) {
                    Ok(reason) => info!("Peer session {} closed by router: {reason}", self.name),
                    Err(_) => info!(
                        "Peer session {} closed by router for an unrecognized reason: {}",
                        self.name, message.reason
                    ),
                }
                self.transition_state(SessionState::Closing)?;
                self.send_message(goodbye_and_out())
            }
            Message::Heartbeat(_) => Ok(()),
            Message::Subscribed(message) => {
                let (event_tx, event_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
                // Subscriptions are shared, so a second SUBSCRIBE to the same topic must reuse the
                // existing channel.
                let event_rx = match self.subscriptions.get(&message.subscription) {
                    Some(event_tx) => event_tx.subscribe(),
                    None => {
                        self.subscriptions.insert(message.subscription, event_tx);
                        event_rx
                    }
                };
                self.subscribed_tx
                    .send(Ok(peer_session_message::Subscription {
                        request_id: message.subscribe_request,
                        subscription_id: message.subscription,
                        event_rx,
                    }))
                    .ok();
                Ok(())
            }
            Message::Unsubscribed(message) => {
                let subscription = self
                    .pending_unsubscribes
                    .remove(&message.unsubscribe_request)
                    .or_else(|| {
                        message
                            .details
                            .get("subscription")
                            .and_then(Value::integer)
                            .and_then(|id| Id::try_from(id).ok())
                    });
                if let Some(subscription) = subscription {
                    self.subscriptions.remove(&subscription);
                }
                self.unsubscribed_tx
                    .send(Ok(peer_session_message::Acknowledgement {
                        request_id: message.unsubscribe_request,
                    }))
                    .ok();
                Ok(())
            }
            Message::Published(message) => {
                self.published_tx
                    .send(Ok(peer_session_message::Acknowledgement {
                        request_id: message.publish_request,
                    }))
                    .ok();
                Ok(())
            }
            Message::Event(message) => {
                match self.subscriptions.get(&message.subscribed_subscription) {
                    Some(event_tx) => {
                        event_tx
                            .send(Event {
                                publication: message.published_publication,
                                payload: message.payload,
                                details: message.details,
                            })
                            .ok();
                    }
                    None => debug!(
                        "Peer {} dropped event for unknown subscription {}",
                        self.name, message.subscribed_subscription
                    ),
                }
                Ok(())
            }
            Message::Registered(message) => {
                let (invocation_tx, invocation_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
                self.procedures.insert(message.registration, invocation_tx);
                self.registered_tx
                    .send(Ok(peer_session_message::Registration {
                        request_id: message.register_request,
                        registration_id: message.registration,
                        invocation_rx,
                    }))
                    .ok();
                Ok(())
            }
            Message::Unregistered(message) => {
                // The router revokes registrations with a request ID of 0.
                let revoked = message
                    .details
                    .get("registration")
                    .and_then(Value::integer)
                    .and_then(|id| Id::try_from(id).ok());
                if let Some(registration) = revoked {
                    info!(
                        "Peer {} lost registration {registration}: {:?}",
                        self.name,
                        message.details.get("reason")
                    );
                    self.procedures.remove(&registration);
                }
                if let Some(registration) =
                    self.pending_unregisters.remove(&message.unregister_request)
                {
                    self.procedures.remove(&registration);
                }
                if message.unregister_request != Id::MIN {
                    self.unregistered_tx
                        .send(Ok(peer_session_message::Acknowledgement {
                            request_id: message.unregister_request,
                        }))
                        .ok();
                }
                Ok(())
            }
            Message::Invocation(message) => {
                match self.procedures.get(&message.registered_registration) {
                    Some(invocation_tx) => {
                        invocation_tx
                            .send(Invocation {
                                id: message.request,
                                registration: message.registered_registration,
                                payload: message.payload,
                                details: message.details,
                                message_tx: self.message_tx.clone(),
                            })
                            .ok();
                    }
                    None => {
                        let err = InteractionError::NoSuchRegistration.into();
                        self.service_message_tx.send(Message::Error(ErrorMessage {
                            request_type: Message::INVOCATION_TAG,
                            request: message.request,
                            details: Dictionary::default(),
                            error: Uri::for_error(&err),
                            payload: Payload::default(),
                        }))?;
                    }
                }
                Ok(())
            }
            Message::Interrupt(message) => {
                debug!(
                    "Peer {} ignoring INTERRUPT for invocation {}",
                    self.name, message.invocation_request
                );
                Ok(())
            }
            Message::Result(message) => {
                let progress = message.progress();
                self.rpc_result_tx
                    .send(Ok(peer_session_message::RpcResult {
                        request_id: message.call_request,
                        payload: message.payload,
                        progress,
                    }))
                    .ok();
                Ok(())
            }
            Message::Error(message) => self.handle_error(message),
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on an established session",
                message.message_name()
            ))
            .into()),
        }
    }

    fn handle_error(&mut self, message: ErrorMessage) -> Result<()> {
        let error = error_from_error_message(&message);
        match message.request_type {
            Message::SUBSCRIBE_TAG => {
                self.subscribed_tx.send(Err(error)).ok();
            }
            Message::UNSUBSCRIBE_TAG => {
                self.pending_unsubscribes.remove(&message.request);
                self.unsubscribed_tx.send(Err(error)).ok();
            }
            Message::PUBLISH_TAG => {
                self.published_tx.send(Err(error)).ok();
            }
            Message::REGISTER_TAG => {
                self.registered_tx.send(Err(error)).ok();
            }
            Message::UNREGISTER_TAG => {
                self.pending_unregisters.remove(&message.request);
                self.unregistered_tx.send(Err(error)).ok();
            }
            Message::CALL_TAG => {
                self.rpc_result_tx.send(Err(error)).ok();
            }
            request_type => {
                return Err(InteractionError::ProtocolViolation(format!(
                    "received ERROR message for unexpected request type {request_type}"
                ))
                .into());
            }
        }
        Ok(())
    }

    fn handle_closing(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Goodbye(_) | Message::Abort(_) => self.transition_state(SessionState::Closed),
            message => {
                debug!(
                    "Peer {} ignoring {} message on a closing session",
                    self.name,
                    message.message_name()
                );
                Ok(())
            }
        }
    }

    fn transition_state(&mut self, state: SessionState) -> Result<()> {
        if state == self.state {
            return Ok(());
        }

        if !self.state.allowed_state_transition(&state) {
            return Err(BasicError::Internal(format!(
                "invalid state transition from {:?} to {state:?}",
                self.state
            ))
            .into());
        }

        debug!(
            "Peer {} transitioned from {:?} to {state:?}",
            self.name, self.state
        );
        self.state = state;

        if self.state == SessionState::Closed {
            // Dropping the senders closes every event and invocation stream of the session.
            self.subscriptions.clear();
            self.procedures.clear();
            self.pending_unsubscribes.clear();
            self.pending_unregisters.clear();
            if let Ok(mut current_session_id) = self.current_session_id.lock() {
                *current_session_id = None;
            }
            self.closed_session_tx.send(()).ok();
        }

        Ok(())
    }
}
