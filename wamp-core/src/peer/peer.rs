use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Stream,
    StreamExt,
};
use log::{
    debug,
    error,
    info,
};
use thiserror::Error;
use tokio::{
    sync::{
        Mutex,
        broadcast::{
            self,
            error::RecvError,
        },
        mpsc::{
            self,
            UnboundedReceiver,
            UnboundedSender,
            unbounded_channel,
        },
    },
    task::JoinHandle,
};

use crate::{
    auth::{
        authenticator::ClientAuthenticator,
        message::{
            ServerFinalMessage,
            ServerFirstMessage,
        },
    },
    core::{
        close::CloseReason,
        error::{
            BasicError,
            ChannelTransmittableError,
            ChannelTransmittableResult,
        },
        features::peer_roles_announcement,
        id::Id,
        invocation_policy::InvocationPolicy,
        match_style::MatchStyle,
        roles::PeerRole,
        service::{
            Service,
            ServiceHandle,
        },
        types::{
            Dictionary,
            HashSet,
            List,
            Value,
        },
        uri::Uri,
    },
    message::{
        common::{
            abort_message_for_error,
            goodbye_with_close_reason,
        },
        message::{
            CallMessage,
            ChallengeMessage,
            HelloMessage,
            Message,
            PublishMessage,
            RegisterMessage,
            SubscribeMessage,
            UnregisterMessage,
            UnsubscribeMessage,
        },
        payload::Payload,
    },
    peer::session::{
        Event,
        Invocation,
        Session,
        SessionHandle,
        peer_session_message,
    },
    serializer::serializer::{
        SerializerType,
        new_serializer,
    },
    transport::web_socket_transport::WebSocketTransport,
    websocket::{
        client_handshake,
        options::ClientOptions,
    },
};

const DEFAULT_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

/// Configuration for a [`Peer`].
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Name of the peer, used for logging.
    pub name: String,
    /// Agent name, communicated to the router.
    pub agent: String,
    /// Roles implemented by the peer.
    pub roles: HashSet<PeerRole>,
    /// Allowed serializers, in order of preference.
    ///
    /// The actual serializer is selected when the connection with the router is established.
    pub serializers: Vec<SerializerType>,
    /// WebSocket client options.
    ///
    /// Requested subprotocols are derived from [`Self::serializers`].
    pub web_socket: ClientOptions,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: "peer".to_owned(),
            agent: DEFAULT_AGENT.to_owned(),
            roles: HashSet::from_iter([
                PeerRole::Caller,
                PeerRole::Callee,
                PeerRole::Publisher,
                PeerRole::Subscriber,
            ]),
            serializers: Vec::from_iter([SerializerType::Json, SerializerType::MessagePack]),
            web_socket: ClientOptions::default(),
        }
    }
}

impl PeerConfig {
    fn validate(&self) -> Result<()> {
        if self.serializers.is_empty() {
            return Err(BasicError::InvalidArgument(
                "peer must allow at least one serializer".to_owned(),
            )
            .into());
        }
        if self.roles.is_empty() {
            return Err(BasicError::InvalidArgument(
                "peer must implement at least one role".to_owned(),
            )
            .into());
        }
        self.web_socket.validate()
    }
}

/// Options for subscribing to a topic.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionOptions {
    pub match_style: Option<MatchStyle>,
}

/// Options for registering a procedure.
#[derive(Debug, Default, Clone)]
pub struct ProcedureOptions {
    pub match_style: Option<MatchStyle>,
    pub invocation_policy: InvocationPolicy,
    /// Asks the router to disclose callers to the callee.
    pub disclose_caller: bool,
    /// Takes over a single-callee registration held by another session.
    pub force_reregister: bool,
}

/// Options for publishing an event.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Waits for the broker to acknowledge the publication.
    pub acknowledge: bool,
    /// Whether the publisher is excluded from receiving its own event.
    pub exclude_me: bool,
    /// Asks the router to disclose the publisher to subscribers.
    pub disclose_me: bool,
    /// Sessions that must not receive the event.
    pub exclude: Vec<Id>,
    /// Sessions that may receive the event.
    pub eligible: Option<Vec<Id>>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            acknowledge: true,
            exclude_me: true,
            disclose_me: false,
            exclude: Vec::new(),
            eligible: None,
        }
    }
}

impl PublishOptions {
    fn into_dictionary(self) -> Dictionary {
        fn ids(ids: Vec<Id>) -> Value {
            Value::List(ids.into_iter().map(|id| Value::Integer(id.value())).collect())
        }

        let mut options = Dictionary::default();
        if self.acknowledge {
            options.insert("acknowledge".to_owned(), Value::Bool(true));
        }
        if !self.exclude_me {
            options.insert("exclude_me".to_owned(), Value::Bool(false));
        }
        if self.disclose_me {
            options.insert("disclose_me".to_owned(), Value::Bool(true));
        }
        if !self.exclude.is_empty() {
            options.insert("exclude".to_owned(), ids(self.exclude));
        }
        if let Some(eligible) = self.eligible {
            options.insert("eligible".to_owned(), ids(eligible));
        }
        options
    }
}

/// An event to publish to a topic.
#[derive(Debug, Default, Clone)]
pub struct PublishedEvent {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub options: PublishOptions,
}

/// A subscription to a topic.
#[derive(Debug)]
pub struct Subscription {
    /// The subscription ID.
    pub id: Id,
    /// The event receiver channel.
    ///
    /// The channel closes when the peer unsubscribes or the session ends.
    pub event_rx: broadcast::Receiver<Event>,
}

/// A registration of a procedure.
#[derive(Debug)]
pub struct Procedure {
    /// The registration ID.
    pub id: Id,
    /// The invocation receiver channel.
    ///
    /// The channel closes when the peer unregisters, the registration is revoked, or the session
    /// ends.
    pub invocation_rx: broadcast::Receiver<Invocation>,
}

impl Clone for Procedure {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            invocation_rx: self.invocation_rx.resubscribe(),
        }
    }
}

/// A procedure call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RpcCall {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub timeout: Option<Duration>,
    /// Asks the router to disclose the caller to the callee.
    pub disclose_me: bool,
}

/// A result of a procedure call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RpcResult {
    pub payload: Payload,
    pub progress: bool,
}

/// A pending procedure call that produces one or more progressive results.
#[derive(Debug)]
pub struct ProgressivePendingRpc {
    results_join_handle: JoinHandle<Result<()>>,
    result_rx: UnboundedReceiver<ChannelTransmittableResult<RpcResult>>,
    done: bool,
}

impl Drop for ProgressivePendingRpc {
    fn drop(&mut self) {
        self.results_join_handle.abort();
    }
}

impl ProgressivePendingRpc {
    /// Returns true if the call has received all of its results.
    pub fn done(&self) -> bool {
        self.done
    }

    /// Waits for the next result of the procedure call.
    ///
    /// Returns `None` after the final result.
    pub async fn next_result(&mut self) -> Result<Option<RpcResult>> {
        if self.done {
            return Ok(None);
        }
        match self.result_rx.recv().await {
            Some(Ok(result)) => {
                self.done = !result.progress;
                Ok(Some(result))
            }
            Some(Err(err)) => {
                self.done = true;
                Err(err.into_error())
            }
            None => {
                self.done = true;
                Err(Error::msg("procedure call finished with no result"))
            }
        }
    }

    /// Waits for the final result, skipping progressive results.
    pub async fn result(mut self) -> Result<RpcResult> {
        loop {
            match self.next_result().await? {
                Some(result) if !result.progress => return Ok(result),
                Some(_) => continue,
                None => return Err(Error::msg("procedure call finished with no result")),
            }
        }
    }

    /// Wraps the pending call as a stream of results.
    ///
    /// The stream is finished on the last result or error.
    pub fn into_stream(self) -> impl Stream<Item = Result<RpcResult>> {
        futures_util::stream::unfold(self, move |mut rpc| async {
            match rpc.next_result().await {
                Ok(Some(result)) => Some((Ok(result), rpc)),
                Ok(None) => None,
                Err(err) => Some((Err(err), rpc)),
            }
        })
        .boxed()
    }
}

/// Error for a peer not being connected for some operation.
#[derive(Debug, Error)]
#[error("peer is not connected")]
pub struct PeerNotConnectedError;

struct PeerState {
    service: ServiceHandle,
    session: SessionHandle,
    message_tx: UnboundedSender<Message>,
}

/// A WAMP peer (a.k.a., client) that connects to a WAMP router over WebSocket, establishes
/// sessions in a realm, and interacts with resources in the realm.
pub struct Peer {
    config: PeerConfig,

    session_finished_tx: broadcast::Sender<()>,
    connection_finished_tx: broadcast::Sender<()>,
    drop_tx: broadcast::Sender<()>,

    peer_state: Arc<Mutex<Option<PeerState>>>,
}

impl Peer {
    /// Creates a new peer.
    pub fn new(config: PeerConfig) -> Result<Self> {
        config.validate()?;
        let (session_finished_tx, _) = broadcast::channel(16);
        let (connection_finished_tx, _) = broadcast::channel(16);
        let (drop_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            session_finished_tx,
            connection_finished_tx,
            drop_tx,
            peer_state: Arc::new(Mutex::new(None)),
        })
    }

    /// Receiver channel for a single session finishing.
    pub fn session_finished_rx(&self) -> broadcast::Receiver<()> {
        self.session_finished_tx.subscribe()
    }

    fn connection_finished_rx(&self) -> broadcast::Receiver<()> {
        self.connection_finished_tx.subscribe()
    }

    /// The current session ID, as given by the router.
    pub async fn current_session_id(&self) -> Option<Id> {
        self.peer_state
            .lock()
            .await
            .as_ref()
            .and_then(|peer_state| peer_state.session.current_session_id())
    }

    /// Connects to a router.
    ///
    /// This method merely establishes a WebSocket connection with the router. It does not establish
    /// any WAMP session, so the connection may be reused across multiple sessions.
    pub async fn connect(&self, url: &str) -> Result<()> {
        let mut options = self.config.web_socket.clone();
        options.protocols = self
            .config
            .serializers
            .iter()
            .map(|serializer| serializer.uri().to_string())
            .collect();
        if options.user_agent.is_empty() {
            options.user_agent = self.config.agent.clone();
        }

        let connection = client_handshake::connect(url, &options, None).await?;
        let serializer = match connection.protocol() {
            Some(protocol) => SerializerType::try_from(protocol).map_err(Error::msg)?,
            None => return Err(Error::msg("handshake did not produce a subprotocol")),
        };
        info!(
            "WAMP connection established with {url} for peer {} using {serializer}",
            self.config.name
        );

        let transport = WebSocketTransport::new(connection, serializer);
        let service = Service::new(
            self.config.name.clone(),
            Box::new(transport),
            new_serializer(serializer),
        );
        self.start_service(service).await
    }

    async fn start_service(&self, mut service: Service) -> Result<()> {
        // A peer holds at most one connection.
        self.disconnect().await?;

        let service_message_rx = service
            .take_message_rx()
            .ok_or_else(|| Error::msg("service has no message receiver"))?;
        let end_rx = service.end_rx();
        let drop_rx = self.drop_tx.subscribe();
        let service_handle = service.start();

        let (message_tx, message_rx) = unbounded_channel();
        let session = Session::new(
            self.config.name.clone(),
            message_tx.clone(),
            service_handle.message_tx(),
        );
        let session_handle = session.session_handle();

        *self.peer_state.lock().await = Some(PeerState {
            service: service_handle,
            session: session_handle,
            message_tx,
        });

        tokio::spawn(Self::message_handler(
            session,
            self.peer_state.clone(),
            self.session_finished_tx.clone(),
            self.connection_finished_tx.clone(),
            message_rx,
            service_message_rx,
            end_rx,
            drop_rx,
        ));

        Ok(())
    }

    async fn message_handler(
        mut session: Session,
        peer_state: Arc<Mutex<Option<PeerState>>>,
        session_finished_tx: broadcast::Sender<()>,
        connection_finished_tx: broadcast::Sender<()>,
        mut message_rx: UnboundedReceiver<Message>,
        mut service_message_rx: UnboundedReceiver<Message>,
        end_rx: broadcast::Receiver<()>,
        drop_rx: broadcast::Receiver<()>,
    ) {
        loop {
            let result = Self::session_loop(
                &mut session,
                &mut message_rx,
                &mut service_message_rx,
                end_rx.resubscribe(),
                drop_rx.resubscribe(),
            )
            .await;

            session_finished_tx.send(()).ok();

            match result {
                Ok(done) => {
                    info!("Peer session {} finished", session.name());
                    if !done {
                        continue;
                    }
                }
                Err(err) => {
                    error!("Peer session {} failed: {err:#}", session.name());
                }
            }

            info!(
                "Peer session {} is disconnecting from the router",
                session.name()
            );
            break;
        }

        // The connection can no longer be used by the peer object.
        if let Some(state) = peer_state.lock().await.take() {
            if let Err(err) = state.service.cancel() {
                debug!("Failed to cancel service for {}: {err}", session.name());
            }
        }
        connection_finished_tx.send(()).ok();
    }

    /// Runs a single WAMP session over the connection.
    ///
    /// Returns whether the connection is done.
    async fn session_loop(
        session: &mut Session,
        message_rx: &mut UnboundedReceiver<Message>,
        service_message_rx: &mut UnboundedReceiver<Message>,
        mut end_rx: broadcast::Receiver<()>,
        mut drop_rx: broadcast::Receiver<()>,
    ) -> Result<bool> {
        let mut finish_on_close = false;
        loop {
            tokio::select! {
                // Received a message from this peer object.
                message = message_rx.recv() => {
                    let message = match message {
                        Some(message) => message,
                        None => return Err(Error::msg("failed to receive message from peer channel")),
                    };
                    let message_name = message.message_name();
                    if let Err(err) = session.send_message(message) {
                        return Err(err.context(format!("failed to send {message_name} message")));
                    }
                }
                // Received a message from the service.
                message = service_message_rx.recv() => {
                    let message = match message {
                        Some(message) => message,
                        None => return Ok(true),
                    };
                    let message_name = message.message_name();
                    if let Err(err) = session.handle_message(message).await {
                        return Err(err.context(format!("failed to handle {message_name} message")));
                    }
                }
                // Service ended, so the transport is gone.
                _ = end_rx.recv() => {
                    // The router may have explained itself right before closing.
                    while let Ok(message) = service_message_rx.try_recv() {
                        if let Err(err) = session.handle_message(message).await {
                            debug!("Failed to handle message after service ended: {err:#}");
                        }
                    }
                    return Ok(true);
                }
                // Peer was dropped.
                _ = drop_rx.recv() => return Ok(true),
            }

            if session.closed() {
                if finish_on_close {
                    break;
                }
            } else {
                finish_on_close = true;
            }
        }
        Ok(false)
    }

    async fn with_peer_state<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&PeerState) -> T,
    {
        match self.peer_state.lock().await.as_ref() {
            Some(peer_state) => Ok(f(peer_state)),
            None => Err(PeerNotConnectedError.into()),
        }
    }

    /// Joins the realm, establishing a WAMP session.
    ///
    /// The session exists until [`Self::leave_realm`] is called, the router closes it, or the
    /// connection is lost.
    pub async fn join_realm(&self, realm: &str) -> Result<()> {
        self.join_realm_internal(realm, None).await
    }

    /// Joins the realm, answering authentication challenges with the given authenticator.
    pub async fn join_realm_with_authentication(
        &self,
        realm: &str,
        authenticator: Box<dyn ClientAuthenticator>,
    ) -> Result<()> {
        self.join_realm_internal(realm, Some(authenticator)).await
    }

    async fn join_realm_internal(
        &self,
        realm: &str,
        authenticator: Option<Box<dyn ClientAuthenticator>>,
    ) -> Result<()> {
        let mut connection_finished_rx = self.connection_finished_rx();
        let (message_tx, mut established_session_rx, mut auth_challenge_rx) = self
            .with_peer_state(|peer_state| {
                (
                    peer_state.message_tx.clone(),
                    peer_state.session.established_session_rx(),
                    peer_state.session.auth_challenge_rx(),
                )
            })
            .await?;

        let mut details = Dictionary::default();
        details.insert("agent".to_owned(), Value::String(self.config.agent.clone()));
        details.insert(
            "roles".to_owned(),
            Value::Dictionary(peer_roles_announcement(&self.config.roles)),
        );
        let mut message = HelloMessage {
            realm: Uri::try_from(realm)?,
            details,
        };
        if let Some(authenticator) = &authenticator {
            authenticator.hello().await?.embed_into_hello_message(&mut message);
        }

        message_tx.send(Message::Hello(message))?;

        loop {
            tokio::select! {
                result = established_session_rx.recv() => {
                    let established = result?.map_err(ChannelTransmittableError::into_error)?;
                    match self.validate_new_established_session(established, authenticator.as_deref(), realm).await {
                        Ok(()) => break,
                        Err(err) => {
                            message_tx.send(abort_message_for_error(&err))?;
                            return Err(err.context("failed to validate newly established session"));
                        }
                    }
                }
                challenge = auth_challenge_rx.recv() => {
                    match Self::handle_challenge(challenge?, authenticator.as_deref()).await {
                        Ok(response) => message_tx.send(response)?,
                        Err(err) => {
                            message_tx.send(abort_message_for_error(&err))?;
                            return Err(err.context("failed to handle authentication challenge"));
                        }
                    }
                }
                _ = connection_finished_rx.recv() => {
                    // The reason we disconnected may have been communicated.
                    if let Ok(Err(err)) = established_session_rx.try_recv() {
                        return Err(err.into_error());
                    }
                    return Err(PeerNotConnectedError.into());
                }
            }
        }

        Ok(())
    }

    async fn handle_challenge(
        challenge: ChallengeMessage,
        authenticator: Option<&dyn ClientAuthenticator>,
    ) -> Result<Message> {
        let authenticator = authenticator.ok_or_else(|| {
            BasicError::NotAllowed("received a challenge without an authenticator".to_owned())
        })?;
        let challenge = ServerFirstMessage::try_from(&challenge)?;
        if challenge.method != authenticator.auth_method() {
            return Err(BasicError::NotAllowed(format!(
                "received challenge for unsupported auth method {}",
                challenge.method
            ))
            .into());
        }
        Ok(Message::Authenticate(
            authenticator.handle_challenge(challenge).await?.into(),
        ))
    }

    async fn validate_new_established_session(
        &self,
        session: peer_session_message::EstablishedSession,
        authenticator: Option<&dyn ClientAuthenticator>,
        realm: &str,
    ) -> Result<()> {
        if session.realm.as_ref() != realm {
            return Err(Error::msg(format!(
                "joined realm {}, expected {realm}",
                session.realm
            )));
        }
        if let Some(authenticator) = authenticator {
            authenticator
                .verify_signature(ServerFinalMessage::try_from(&session.welcome_message)?)
                .await?;
        }
        Ok(())
    }

    /// Leaves the realm, closing the WAMP session.
    pub async fn leave_realm(&self) -> Result<()> {
        let mut connection_finished_rx = self.connection_finished_rx();
        let (message_tx, mut closed_session_rx) = self
            .with_peer_state(|peer_state| {
                (
                    peer_state.message_tx.clone(),
                    peer_state.session.closed_session_rx(),
                )
            })
            .await?;

        message_tx.send(goodbye_with_close_reason(CloseReason::Normal))?;

        tokio::select! {
            result = closed_session_rx.recv() => result.map_err(Error::new),
            _ = connection_finished_rx.recv() => {
                // We may have closed successfully.
                if closed_session_rx.try_recv().is_ok() {
                    return Ok(());
                }
                Err(PeerNotConnectedError.into())
            }
        }
    }

    /// Disconnects from the router.
    pub async fn disconnect(&self) -> Result<()> {
        let mut connection_finished_rx = self.connection_finished_rx();
        let peer_state = self.peer_state.lock().await.take();
        if let Some(peer_state) = peer_state {
            info!(
                "Peer {} was instructed to disconnect from the router",
                self.config.name
            );
            peer_state.service.cancel()?;
            peer_state.service.join().await?;
            // The message handler must not outlive the connection it serves.
            connection_finished_rx.recv().await.ok();
        }
        Ok(())
    }

    /// Sends a request and waits for the session to answer it.
    async fn request<T, F>(
        &self,
        build: F,
        result_rx: impl FnOnce(&SessionHandle) -> broadcast::Receiver<ChannelTransmittableResult<T>>,
        request_id_of: fn(&T) -> Id,
    ) -> Result<T>
    where
        T: Clone,
        F: FnOnce(Id) -> Message,
    {
        let (message_tx, id_allocator, mut rx) = self
            .with_peer_state(|peer_state| {
                (
                    peer_state.message_tx.clone(),
                    peer_state.session.id_allocator(),
                    result_rx(&peer_state.session),
                )
            })
            .await?;
        let request_id = id_allocator.generate_id().await;
        message_tx.send(build(request_id))?;

        let mut session_finished_rx = self.session_finished_rx();
        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(Ok(value)) => {
                            if request_id_of(&value) == request_id {
                                return Ok(value);
                            }
                        }
                        Ok(Err(err)) => {
                            if err.request_id.is_some_and(|id| id == request_id) {
                                return Err(err.into_error());
                            }
                        }
                        Err(RecvError::Lagged(_)) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                _ = session_finished_rx.recv() => {
                    return Err(PeerNotConnectedError.into());
                }
            }
        }
    }

    /// Subscribes to a topic in the realm.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.subscribe_with_options(topic, SubscriptionOptions::default())
            .await
    }

    /// Subscribes to a topic in the realm with additional options.
    pub async fn subscribe_with_options(
        &self,
        topic: &str,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        let match_style = options.match_style.unwrap_or_default();
        let topic = Uri::for_match(topic, match_style)?;
        let mut message_options = Dictionary::default();
        if let Some(match_style) = options.match_style {
            message_options.insert("match".to_owned(), Value::String(match_style.to_string()));
        }
        let subscription = self
            .request(
                |request| {
                    Message::Subscribe(SubscribeMessage {
                        request,
                        options: message_options,
                        topic,
                    })
                },
                SessionHandle::subscribed_rx,
                |subscription| subscription.request_id,
            )
            .await?;
        Ok(Subscription {
            id: subscription.subscription_id,
            event_rx: subscription.event_rx,
        })
    }

    /// Removes a subscription.
    pub async fn unsubscribe(&self, id: Id) -> Result<()> {
        self.request(
            |request| {
                Message::Unsubscribe(UnsubscribeMessage {
                    request,
                    subscribed_subscription: id,
                })
            },
            SessionHandle::unsubscribed_rx,
            |ack| ack.request_id,
        )
        .await?;
        Ok(())
    }

    /// Publishes an event to a topic.
    ///
    /// Unless acknowledgement is disabled, waits for the broker to accept the publication.
    pub async fn publish(&self, topic: &str, event: PublishedEvent) -> Result<()> {
        let topic = Uri::try_from(topic)?;
        let acknowledge = event.options.acknowledge;
        let build = |request| {
            Message::Publish(PublishMessage {
                request,
                options: event.options.into_dictionary(),
                topic,
                payload: Payload::new(event.arguments, event.arguments_keyword),
            })
        };
        if !acknowledge {
            let (message_tx, id_allocator) = self
                .with_peer_state(|peer_state| {
                    (
                        peer_state.message_tx.clone(),
                        peer_state.session.id_allocator(),
                    )
                })
                .await?;
            message_tx.send(build(id_allocator.generate_id().await))?;
            return Ok(());
        }
        self.request(build, SessionHandle::published_rx, |ack| ack.request_id)
            .await?;
        Ok(())
    }

    /// Registers a procedure.
    pub async fn register(&self, procedure: &str) -> Result<Procedure> {
        self.register_with_options(procedure, ProcedureOptions::default())
            .await
    }

    /// Registers a procedure with additional options.
    pub async fn register_with_options(
        &self,
        procedure: &str,
        options: ProcedureOptions,
    ) -> Result<Procedure> {
        let procedure = Uri::for_match(procedure, options.match_style.unwrap_or_default())?;
        let mut message_options = Dictionary::default();
        if let Some(match_style) = options.match_style {
            message_options.insert("match".to_owned(), Value::String(match_style.to_string()));
        }
        if options.invocation_policy != InvocationPolicy::Single {
            message_options.insert(
                "invoke".to_owned(),
                Value::String(options.invocation_policy.to_string()),
            );
        }
        if options.disclose_caller {
            message_options.insert("disclose_caller".to_owned(), Value::Bool(true));
        }
        if options.force_reregister {
            message_options.insert("force_reregister".to_owned(), Value::Bool(true));
        }
        let registration = self
            .request(
                |request| {
                    Message::Register(RegisterMessage {
                        request,
                        options: message_options,
                        procedure,
                    })
                },
                SessionHandle::registered_rx,
                |registration| registration.request_id,
            )
            .await?;
        Ok(Procedure {
            id: registration.registration_id,
            invocation_rx: registration.invocation_rx,
        })
    }

    /// Removes a procedure registration.
    pub async fn unregister(&self, id: Id) -> Result<()> {
        self.request(
            |request| {
                Message::Unregister(UnregisterMessage {
                    request,
                    registered_registration: id,
                })
            },
            SessionHandle::unregistered_rx,
            |ack| ack.request_id,
        )
        .await?;
        Ok(())
    }

    async fn wait_for_results(
        request_id: Id,
        mut session_rpc_result_rx: broadcast::Receiver<
            ChannelTransmittableResult<peer_session_message::RpcResult>,
        >,
        mut session_finished_rx: broadcast::Receiver<()>,
        rpc_result_tx: mpsc::UnboundedSender<ChannelTransmittableResult<RpcResult>>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                rpc_result = session_rpc_result_rx.recv() => {
                    match rpc_result {
                        Ok(Ok(rpc_result)) => {
                            if rpc_result.request_id == request_id {
                                let progress = rpc_result.progress;
                                rpc_result_tx.send(Ok(RpcResult {
                                    payload: rpc_result.payload,
                                    progress,
                                }))?;
                                if !progress {
                                    break;
                                }
                            }
                        }
                        Ok(Err(err)) => {
                            if err.request_id.is_some_and(|id| id == request_id) {
                                rpc_result_tx.send(Err(err))?;
                                break;
                            }
                        }
                        Err(RecvError::Lagged(_)) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                _ = session_finished_rx.recv() => {
                    rpc_result_tx.send(Err(Error::from(PeerNotConnectedError).into()))?;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn initiate_call(
        &self,
        procedure: &str,
        rpc_call: RpcCall,
        receive_progress: bool,
    ) -> Result<ProgressivePendingRpc> {
        let procedure = Uri::try_from(procedure)?;
        let (message_tx, id_allocator, session_rpc_result_rx) = self
            .with_peer_state(|peer_state| {
                (
                    peer_state.message_tx.clone(),
                    peer_state.session.id_allocator(),
                    peer_state.session.rpc_result_rx(),
                )
            })
            .await?;
        let request_id = id_allocator.generate_id().await;

        let mut options = Dictionary::default();
        if receive_progress {
            options.insert("receive_progress".to_owned(), Value::Bool(true));
        }
        if let Some(timeout) = rpc_call.timeout {
            options.insert(
                "timeout".to_owned(),
                Value::Integer(timeout.as_millis() as u64),
            );
        }
        if rpc_call.disclose_me {
            options.insert("disclose_me".to_owned(), Value::Bool(true));
        }

        // Subscribe to results before the call goes out, so no result can be missed.
        let (rpc_result_tx, result_rx) = unbounded_channel();
        let results_join_handle = tokio::spawn(Self::wait_for_results(
            request_id,
            session_rpc_result_rx,
            self.session_finished_rx(),
            rpc_result_tx,
        ));

        message_tx.send(Message::Call(CallMessage {
            request: request_id,
            options,
            procedure,
            payload: Payload::new(rpc_call.arguments, rpc_call.arguments_keyword),
        }))?;

        Ok(ProgressivePendingRpc {
            results_join_handle,
            result_rx,
            done: false,
        })
    }

    /// Calls a procedure and waits for its result.
    pub async fn call(&self, procedure: &str, rpc_call: RpcCall) -> Result<RpcResult> {
        self.initiate_call(procedure, rpc_call, false)
            .await?
            .result()
            .await
    }

    /// Calls a procedure, expecting one or more progressive results.
    pub async fn call_with_progress(
        &self,
        procedure: &str,
        rpc_call: RpcCall,
    ) -> Result<ProgressivePendingRpc> {
        self.initiate_call(procedure, rpc_call, true).await
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.drop_tx.send(()).ok();
    }
}
