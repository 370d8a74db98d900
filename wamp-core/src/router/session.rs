use std::{
    fmt::Debug,
    sync::Arc,
};

use anyhow::{
    Error,
    Result,
};
use log::{
    debug,
    error,
    info,
    warn,
};
use tokio::sync::{
    mpsc::UnboundedSender,
    watch,
};

use crate::{
    auth::{
        Identity,
        anonymous::AnonymousServerAuthenticator,
        auth_method::AuthMethod,
        authenticator::{
            ChallengeResult,
            ServerAuthenticator,
        },
        message::{
            ClientFinalMessage,
            ClientFirstMessage,
            ServerFinalMessage,
        },
    },
    core::{
        cancel::InterruptMode,
        close::CloseReason,
        error::{
            BasicError,
            InteractionError,
        },
        features::router_roles_announcement,
        id::Id,
        match_style::MatchStyle,
        service::MessageSender,
        types::{
            Dictionary,
            Value,
        },
        uri::Uri,
    },
    message::{
        cache::CachedMessage,
        common::{
            abort_message_for_error,
            call_error,
            error_for_request,
            goodbye_and_out,
            goodbye_with_close_reason,
        },
        message::{
            CallMessage,
            ErrorMessage,
            EventMessage,
            HelloMessage,
            InterruptMessage,
            InvocationMessage,
            Message,
            PublishMessage,
            PublishedMessage,
            RegisterMessage,
            RegisteredMessage,
            ResultMessage,
            SubscribeMessage,
            SubscribedMessage,
            UnregisterMessage,
            UnregisteredMessage,
            UnsubscribeMessage,
            UnsubscribedMessage,
            WelcomeMessage,
            YieldMessage,
        },
    },
    router::{
        broker::ReceiverFilter,
        context::RouterContext,
        dealer::{
            PendingInvocation,
            RegisterOptions,
        },
        realm::RealmSession,
    },
};

/// Information about an established session, shared with policies and other sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: Id,
    pub realm: Uri,
    pub identity: Identity,
    pub auth_method: AuthMethod,
    pub auth_provider: String,
    /// Roles announced by the peer in HELLO.
    pub roles: Dictionary,
}

impl SessionInfo {
    /// Whether the peer announced a feature for its callee role.
    pub fn callee_feature(&self, feature: &str) -> bool {
        self.roles
            .get("callee")
            .and_then(|role| role.dictionary())
            .and_then(|role| role.get("features"))
            .and_then(|features| features.dictionary())
            .and_then(|features| features.get(feature))
            .and_then(|value| value.bool())
            .unwrap_or(false)
    }
}

/// A handle to a router session, which can be saved separately from the session's lifecycle.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    message_tx: UnboundedSender<Message>,
    closed_rx: watch::Receiver<bool>,
}

impl SessionHandle {
    /// Sends a message through the session's state machine.
    pub fn send_message(&self, message: Message) -> Result<()> {
        self.message_tx.send(message).map_err(Error::new)
    }

    /// Closes the session with a GOODBYE.
    pub fn close(&self, close_reason: CloseReason) -> Result<()> {
        self.send_message(goodbye_with_close_reason(close_reason))
    }

    /// Waits for the session to move to the CLOSED state.
    pub async fn closed(&self) {
        let mut closed_rx = self.closed_rx.clone();
        // An error means the session was dropped, which is just as closed.
        closed_rx.wait_for(|closed| *closed).await.ok();
    }
}

#[derive(Default)]
enum SessionState {
    #[default]
    Closed,
    Authenticating {
        realm: Uri,
        authenticator: Box<dyn ServerAuthenticator>,
        roles: Dictionary,
    },
    Established {
        info: Arc<SessionInfo>,
    },
    Closing,
}

impl Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Authenticating { realm, .. } => f
                .debug_struct("Authenticating")
                .field("realm", realm)
                .finish_non_exhaustive(),
            Self::Established { info } => f
                .debug_struct("Established")
                .field("realm", &info.realm)
                .field("authid", &info.identity.id)
                .finish_non_exhaustive(),
            Self::Closing => write!(f, "Closing"),
        }
    }
}

impl SessionState {
    fn is_same_state(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Closed, Self::Closed) => true,
            (Self::Authenticating { .. }, Self::Authenticating { .. }) => true,
            (Self::Established { .. }, Self::Established { .. }) => true,
            (Self::Closing, Self::Closing) => true,
            _ => false,
        }
    }

    fn allowed_state_transition(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Closed, Self::Authenticating { .. }) => true,
            (Self::Closed, Self::Established { .. }) => true,
            (Self::Authenticating { .. }, Self::Established { .. }) => true,
            (Self::Authenticating { .. }, Self::Closed) => true,
            (Self::Established { .. }, Self::Closing) => true,
            (Self::Established { .. }, Self::Closed) => true,
            (Self::Closing, Self::Closed) => true,
            _ => false,
        }
    }
}

fn authorized(result: Result<bool>, action: &str, uri: &Uri) -> Result<()> {
    match result {
        Ok(true) => Ok(()),
        Ok(false) => Err(InteractionError::NotAuthorized(format!(
            "session not authorized to {action} '{uri}'"
        ))
        .into()),
        Err(err) => Err(InteractionError::AuthorizationFailed(err.to_string()).into()),
    }
}

fn invalid_argument(error: Error) -> Error {
    BasicError::InvalidArgument(error.to_string()).into()
}

fn authentication_failed(error: Error) -> Error {
    if error.is::<InteractionError>() {
        return error;
    }
    InteractionError::AuthenticationFailed(error.to_string()).into()
}

/// The router end of a WAMP session.
///
/// Handles WAMP messages in a state machine and holds all session-scoped state. The session is
/// owned by the connection loop, which feeds it messages one at a time.
pub struct Session {
    id: Id,
    state: SessionState,
    message_tx: UnboundedSender<Message>,
    service_message_tx: MessageSender,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    /// Creates a new session over a service.
    pub fn new(
        id: Id,
        message_tx: UnboundedSender<Message>,
        service_message_tx: MessageSender,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            id,
            state: SessionState::default(),
            message_tx,
            service_message_tx,
            closed_tx,
        }
    }

    /// The session ID.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Checks if the session is closed.
    pub fn closed(&self) -> bool {
        matches!(self.state, SessionState::Closed)
    }

    /// Closes the session without a closing handshake, such as when its transport is gone.
    ///
    /// All of the session's resources in its realm are released.
    pub async fn abandon(&mut self, context: &RouterContext) -> Result<()> {
        self.transition_state(context, SessionState::Closed).await
    }

    /// Generates a handle to the session.
    pub fn session_handle(&self) -> SessionHandle {
        SessionHandle {
            message_tx: self.message_tx.clone(),
            closed_rx: self.closed_tx.subscribe(),
        }
    }

    fn info(&self) -> Result<Arc<SessionInfo>> {
        match &self.state {
            SessionState::Established { info } => Ok(info.clone()),
            _ => Err(BasicError::Internal("session is not in the established state".to_owned()).into()),
        }
    }

    /// Sends a reply that does not affect the session state.
    fn reply(&self, message: Message) -> Result<()> {
        self.service_message_tx.send(message)
    }

    /// Sends a message to the peer, transitioning the session state first.
    pub async fn send_message(&mut self, context: &RouterContext, message: Message) -> Result<()> {
        if !self
            .transition_state_from_sending_message(context, &message)
            .await?
        {
            debug!(
                "Dropped {} message for router session {} in state {:?}",
                message.message_name(),
                self.id,
                self.state
            );
            return Ok(());
        }
        self.service_message_tx.send(message)
    }

    async fn transition_state_from_sending_message(
        &mut self,
        context: &RouterContext,
        message: &Message,
    ) -> Result<bool> {
        let next_state = match message {
            Message::Abort(_) => SessionState::Closed,
            Message::Goodbye(_) => match self.state {
                SessionState::Established { .. } => SessionState::Closing,
                SessionState::Closing => SessionState::Closed,
                _ => return Ok(false),
            },
            _ => return Ok(true),
        };
        self.transition_state(context, next_state).await?;
        Ok(true)
    }

    /// Handles a message over the session state machine.
    ///
    /// An error is fatal to the session: the peer receives an ABORT, and the error is returned.
    pub async fn handle_message(&mut self, context: &RouterContext, message: Message) -> Result<()> {
        debug!("Received message for session {}: {message:?}", self.id);
        if let Err(err) = self.handle_message_on_state_machine(context, message).await {
            self.send_message(context, abort_message_for_error(&err))
                .await?;
            return Err(err);
        }
        Ok(())
    }

    async fn handle_message_on_state_machine(
        &mut self,
        context: &RouterContext,
        message: Message,
    ) -> Result<()> {
        match self.state {
            SessionState::Closed => self.handle_closed(context, message).await,
            SessionState::Authenticating { .. } => {
                self.handle_authenticating(context, message).await
            }
            SessionState::Established { .. } => self.handle_established(context, message).await,
            SessionState::Closing => self.handle_closing(context, message).await,
        }
    }

    async fn handle_closed(&mut self, context: &RouterContext, message: Message) -> Result<()> {
        match message {
            Message::Hello(message) => self.handle_hello(context, message).await,
            Message::Abort(_) => Ok(()),
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on a closed session",
                message.message_name()
            ))
            .into()),
        }
    }

    fn check_uri(context: &RouterContext, uri: &Uri, match_style: MatchStyle) -> Result<()> {
        if !uri.check(context.router().config.uri_check, match_style.into()) {
            return Err(InteractionError::InvalidUri(format!("invalid URI '{uri}'")).into());
        }
        Ok(())
    }

    async fn handle_hello(&mut self, context: &RouterContext, message: HelloMessage) -> Result<()> {
        Self::check_uri(context, &message.realm, MatchStyle::Exact)?;
        let router = context.router();
        let authentication = router
            .realm_manager
            .authentication(&message.realm, router.config.dynamic_realms)
            .await?;

        let mut client_first = ClientFirstMessage::try_from(&message)
            .map_err(|err| InteractionError::ProtocolViolation(err.to_string()))?;
        if client_first.methods.is_empty() {
            client_first.methods.push(AuthMethod::Anonymous);
        }
        let factory = client_first.methods.iter().find_map(|method| {
            authentication
                .methods
                .iter()
                .find(|factory| factory.auth_method() == *method)
        });
        let authenticator = match factory {
            Some(factory) => factory.new_authenticator(),
            None if !authentication.required => {
                Box::new(AnonymousServerAuthenticator::default()) as Box<dyn ServerAuthenticator>
            }
            None => return Err(InteractionError::NoAuthMethod.into()),
        };
        debug!(
            "Router session {} authenticating with {}",
            self.id,
            authenticator.auth_method()
        );

        let roles = message.roles().cloned().unwrap_or_default();
        match authenticator
            .challenge(client_first)
            .await
            .map_err(authentication_failed)?
        {
            ChallengeResult::Accept(server_final) => {
                self.establish(context, message.realm, roles, server_final)
                    .await
            }
            ChallengeResult::Challenge(server_first) => {
                self.transition_state(
                    context,
                    SessionState::Authenticating {
                        realm: message.realm,
                        authenticator,
                        roles,
                    },
                )
                .await?;
                self.send_message(context, Message::Challenge(server_first.into()))
                    .await
            }
        }
    }

    async fn handle_authenticating(
        &mut self,
        context: &RouterContext,
        message: Message,
    ) -> Result<()> {
        match message {
            Message::Authenticate(message) => {
                let (realm, roles, result) = match &self.state {
                    SessionState::Authenticating {
                        realm,
                        authenticator,
                        roles,
                    } => (
                        realm.clone(),
                        roles.clone(),
                        authenticator
                            .authenticate(ClientFinalMessage::from(&message))
                            .await,
                    ),
                    _ => {
                        return Err(BasicError::Internal(
                            "session is not authenticating".to_owned(),
                        )
                        .into());
                    }
                };
                let server_final = result.map_err(authentication_failed)?;
                self.establish(context, realm, roles, server_final).await
            }
            Message::Abort(_) => self.transition_state(context, SessionState::Closed).await,
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on an authenticating session",
                message.message_name()
            ))
            .into()),
        }
    }

    async fn establish(
        &mut self,
        context: &RouterContext,
        realm: Uri,
        roles: Dictionary,
        server_final: ServerFinalMessage,
    ) -> Result<()> {
        let info = Arc::new(SessionInfo {
            id: self.id,
            realm,
            identity: server_final.identity.clone(),
            auth_method: server_final.method,
            auth_provider: server_final.provider.clone(),
            roles,
        });

        let router = context.router();
        loop {
            let realm = router
                .realm_manager
                .get_or_create(&info.realm, router.config.dynamic_realms)
                .await?;
            let mut realm = realm.lock().await;
            // The realm was destroyed after the lookup, so a new one must be created.
            if realm.destroyed() {
                continue;
            }
            realm.sessions.insert(
                self.id,
                RealmSession {
                    info: info.clone(),
                    sender: self.service_message_tx.clone(),
                    handle: self.session_handle(),
                },
            );
            info!(
                "Session {} joined realm {} as {}",
                self.id,
                realm.uri(),
                info.identity.id
            );
            break;
        }

        self.transition_state(context, SessionState::Established { info })
            .await?;

        let mut welcome = WelcomeMessage {
            session: self.id,
            details: Dictionary::from_iter([
                ("agent".to_owned(), Value::String(router.config.agent.clone())),
                (
                    "roles".to_owned(),
                    Value::Dictionary(router_roles_announcement(
                        &router.config.roles,
                        &router.config.pub_sub_features,
                        &router.config.rpc_features,
                    )),
                ),
            ]),
        };
        server_final.embed_into_welcome_message(&mut welcome);
        self.send_message(context, Message::Welcome(welcome)).await
    }

    async fn handle_established(&mut self, context: &RouterContext, message: Message) -> Result<()> {
        match &message {
            Message::Abort(_) => {
                warn!("Router session {} aborted by peer: {message:?}", self.id);
                self.transition_state(context, SessionState::Closed).await
            }
            Message::Goodbye(_) => {
                self.transition_state(context, SessionState::Closing)
                    .await?;
                self.send_message(context, goodbye_and_out()).await
            }
            Message::Heartbeat(_) => Ok(()),
            Message::Subscribe(subscribe_message) => {
                if let Err(err) = self.handle_subscribe(context, subscribe_message).await {
                    self.reply(error_for_request(&message, &err))?;
                }
                Ok(())
            }
            Message::Unsubscribe(unsubscribe_message) => {
                if let Err(err) = self.handle_unsubscribe(context, unsubscribe_message).await {
                    self.reply(error_for_request(&message, &err))?;
                }
                Ok(())
            }
            Message::Publish(publish_message) => {
                if let Err(err) = self.handle_publish(context, publish_message).await {
                    if publish_message.acknowledge() {
                        self.reply(error_for_request(&message, &err))?;
                    } else {
                        debug!(
                            "Dropped publication from router session {} to {}: {err}",
                            self.id, publish_message.topic
                        );
                    }
                }
                Ok(())
            }
            Message::Register(register_message) => {
                if let Err(err) = self.handle_register(context, register_message).await {
                    self.reply(error_for_request(&message, &err))?;
                }
                Ok(())
            }
            Message::Unregister(unregister_message) => {
                if let Err(err) = self.handle_unregister(context, unregister_message).await {
                    self.reply(error_for_request(&message, &err))?;
                }
                Ok(())
            }
            Message::Call(call_message) => {
                if let Err(err) = self.handle_call(context, call_message).await {
                    self.reply(error_for_request(&message, &err))?;
                }
                Ok(())
            }
            Message::Cancel(_) => self.reply(error_for_request(
                &message,
                &InteractionError::NotImplemented("call canceling is not supported".to_owned())
                    .into(),
            )),
            Message::Yield(yield_message) => self.handle_yield(context, yield_message).await,
            Message::Error(error_message) => {
                self.handle_invocation_error(context, error_message).await
            }
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on an established session",
                message.message_name()
            ))
            .into()),
        }
    }

    async fn handle_subscribe(&self, context: &RouterContext, message: &SubscribeMessage) -> Result<()> {
        let info = self.info()?;
        let match_style = message.match_style();
        Self::check_uri(context, &message.topic, match_style)?;
        let router = context.router();
        authorized(
            router
                .pub_sub_policies
                .authorize_subscribe(&info, &message.topic, match_style)
                .await,
            "subscribe to topic",
            &message.topic,
        )?;

        let candidate = router.id_allocator.generate_id().await;
        let mut context = context.realm_context(&info.realm).await?;
        let subscription = context.realm_mut().broker.subscribe(
            self.id,
            message.topic.clone(),
            match_style,
            candidate,
        );
        // Sent while the realm is locked, so no EVENT can overtake the confirmation.
        self.reply(Message::Subscribed(SubscribedMessage {
            subscribe_request: message.request,
            subscription,
        }))
    }

    async fn handle_unsubscribe(
        &self,
        context: &RouterContext,
        message: &UnsubscribeMessage,
    ) -> Result<()> {
        let info = self.info()?;
        let mut context = context.realm_context(&info.realm).await?;
        context
            .realm_mut()
            .broker
            .unsubscribe(self.id, message.subscribed_subscription)?;
        self.reply(Message::Unsubscribed(UnsubscribedMessage {
            unsubscribe_request: message.request,
            details: Dictionary::default(),
        }))
    }

    async fn handle_publish(&self, context: &RouterContext, message: &PublishMessage) -> Result<()> {
        let info = self.info()?;
        Self::check_uri(context, &message.topic, MatchStyle::Exact)?;
        let router = context.router();
        router
            .pub_sub_policies
            .validate_event(&info, &message.topic, &message.payload)
            .await
            .map_err(invalid_argument)?;
        authorized(
            router
                .pub_sub_policies
                .authorize_publish(&info, &message.topic)
                .await,
            "publish to topic",
            &message.topic,
        )?;
        let disclose = message.disclose_me()
            && router
                .pub_sub_policies
                .allow_disclose_publisher(&info, &message.topic);

        let publication = router.id_allocator.generate_id().await;
        let context = context.realm_context(&info.realm).await?;
        let realm = context.realm();
        if message.acknowledge() {
            self.reply(Message::Published(PublishedMessage {
                publish_request: message.request,
                publication,
            }))?;
        }

        let filter = ReceiverFilter::new(self.id, message);
        for subscription in realm.broker.matching_subscriptions(&message.topic) {
            let mut details = Dictionary::default();
            if disclose {
                details.insert("publisher".to_owned(), Value::Integer(self.id.value()));
                details.insert(
                    "publisher_authid".to_owned(),
                    Value::String(info.identity.id.clone()),
                );
                details.insert(
                    "publisher_authrole".to_owned(),
                    Value::String(info.identity.role.clone()),
                );
            }
            if subscription.match_style != MatchStyle::Exact {
                details.insert(
                    "topic".to_owned(),
                    Value::String(message.topic.as_str().to_owned()),
                );
            }
            let event = Arc::new(CachedMessage::new(Message::Event(EventMessage {
                subscribed_subscription: subscription.id,
                published_publication: publication,
                details,
                payload: message.payload.clone(),
            })));

            for subscriber in subscription.subscribers {
                let Some(receiver) = realm.sessions.get(&subscriber) else {
                    continue;
                };
                if !filter.allows(subscriber, &receiver.info.identity) {
                    continue;
                }
                if let Err(err) = receiver.sender.send_cached(event.clone()) {
                    debug!("Failed to send EVENT to session {subscriber}: {err}");
                }
            }
        }
        Ok(())
    }

    async fn handle_register(&self, context: &RouterContext, message: &RegisterMessage) -> Result<()> {
        let info = self.info()?;
        let options = RegisterOptions {
            match_style: message.match_style(),
            invocation_policy: message.invocation_policy(),
            force_reregister: message.force_reregister(),
            disclose_caller: message.disclose_caller(),
        };
        Self::check_uri(context, &message.procedure, options.match_style)?;
        context
            .realm_context(&info.realm)
            .await?
            .realm()
            .dealer
            .check_register(self.id, &message.procedure, &options)?;
        let router = context.router();
        authorized(
            router
                .rpc_policies
                .authorize_register(&info, &message.procedure, options.match_style)
                .await,
            "register procedure",
            &message.procedure,
        )?;

        let candidate = router.id_allocator.generate_id().await;
        let mut context = context.realm_context(&info.realm).await?;
        let realm = context.realm_mut();
        let (registration, revoked) =
            realm
                .dealer
                .register(self.id, message.procedure.clone(), options, candidate)?;
        if let Some(revoked) = revoked {
            info!(
                "Registration {} for {} revoked by session {}",
                revoked.registration, message.procedure, self.id
            );
            let unregistered = Arc::new(CachedMessage::new(Message::Unregistered(
                UnregisteredMessage {
                    unregister_request: Id::MIN,
                    details: Dictionary::from_iter([
                        (
                            "registration".to_owned(),
                            Value::Integer(revoked.registration.value()),
                        ),
                        (
                            "reason".to_owned(),
                            Value::String(CloseReason::Killed.uri().as_str().to_owned()),
                        ),
                    ]),
                },
            )));
            for callee in revoked.callees {
                if let Some(session) = realm.sessions.get(&callee) {
                    session.sender.send_cached(unregistered.clone()).ok();
                }
            }
        }

        // Sent while the realm is locked, so no INVOCATION can overtake the confirmation.
        self.reply(Message::Registered(RegisteredMessage {
            register_request: message.request,
            registration,
        }))
    }

    async fn handle_unregister(
        &self,
        context: &RouterContext,
        message: &UnregisterMessage,
    ) -> Result<()> {
        let info = self.info()?;
        let mut context = context.realm_context(&info.realm).await?;
        context
            .realm_mut()
            .dealer
            .unregister(self.id, message.registered_registration)?;
        self.reply(Message::Unregistered(UnregisteredMessage {
            unregister_request: message.request,
            details: Dictionary::default(),
        }))
    }

    async fn handle_call(&self, context: &RouterContext, message: &CallMessage) -> Result<()> {
        let info = self.info()?;
        Self::check_uri(context, &message.procedure, MatchStyle::Exact)?;
        let router = context.router();
        router
            .rpc_policies
            .validate_call(&info, &message.procedure, &message.payload)
            .await
            .map_err(invalid_argument)?;
        if context
            .realm_context(&info.realm)
            .await?
            .realm()
            .dealer
            .lookup(&message.procedure)
            .is_none()
        {
            return Err(InteractionError::NoSuchProcedure.into());
        }
        authorized(
            router
                .rpc_policies
                .authorize_call(&info, &message.procedure)
                .await,
            "call procedure",
            &message.procedure,
        )?;

        let invocation = router.id_allocator.generate_id().await;
        let mut context = context.realm_context(&info.realm).await?;
        let realm = context.realm_mut();
        // The registration may have gone away while the call was authorized.
        let route = realm
            .dealer
            .route(&message.procedure)
            .ok_or(InteractionError::NoSuchProcedure)?;
        let callee = realm
            .sessions
            .get(&route.callee.session)
            .map(|session| session.sender.clone())
            .ok_or_else(|| BasicError::Internal("callee session is missing".to_owned()))?;

        let mut details = Dictionary::default();
        if message.receive_progress() {
            details.insert("receive_progress".to_owned(), Value::Bool(true));
        }
        if let Some(timeout) = message.timeout() {
            details.insert("timeout".to_owned(), Value::Integer(timeout));
        }
        if (message.disclose_me() || route.callee.disclose_caller)
            && router
                .rpc_policies
                .allow_disclose_caller(&info, &message.procedure)
        {
            details.insert("caller".to_owned(), Value::Integer(self.id.value()));
            details.insert(
                "caller_authid".to_owned(),
                Value::String(info.identity.id.clone()),
            );
            details.insert(
                "caller_authrole".to_owned(),
                Value::String(info.identity.role.clone()),
            );
        }
        if route.match_style != MatchStyle::Exact {
            details.insert(
                "procedure".to_owned(),
                Value::String(message.procedure.as_str().to_owned()),
            );
        }

        realm.dealer.insert_pending(
            invocation,
            PendingInvocation {
                caller: self.id,
                call_request: message.request,
                callee: route.callee.session,
                procedure: message.procedure.clone(),
                receive_progress: message.receive_progress(),
            },
        );
        if let Err(err) = callee.send(Message::Invocation(InvocationMessage {
            request: invocation,
            registered_registration: route.registration,
            details,
            payload: message.payload.clone(),
        })) {
            realm.dealer.remove_pending(invocation);
            return Err(InteractionError::Canceled(format!("callee unavailable: {err}")).into());
        }
        Ok(())
    }

    async fn handle_yield(&self, context: &RouterContext, message: &YieldMessage) -> Result<()> {
        let info = self.info()?;
        let pending = {
            let mut realm_context = context.realm_context(&info.realm).await?;
            let dealer = &mut realm_context.realm_mut().dealer;
            let pending = dealer
                .pending(message.invocation_request)
                .filter(|pending| pending.callee == self.id)
                .cloned();
            match pending {
                Some(pending) => pending,
                None if dealer.take_abandoned(
                    message.invocation_request,
                    self.id,
                    !message.progress(),
                ) =>
                {
                    debug!(
                        "Dropped result of invocation {} abandoned by its caller",
                        message.invocation_request
                    );
                    return Ok(());
                }
                None => {
                    return Err(InteractionError::ProtocolViolation(format!(
                        "received YIELD for unknown invocation {}",
                        message.invocation_request
                    ))
                    .into());
                }
            }
        };

        let validation = context
            .router()
            .rpc_policies
            .validate_call_result(&info, &pending.procedure, &message.payload)
            .await;
        let progress = message.progress();

        let mut context = context.realm_context(&info.realm).await?;
        let realm = context.realm_mut();
        if !progress || validation.is_err() {
            realm.dealer.remove_pending(message.invocation_request);
        }
        let Some(caller) = realm.sessions.get(&pending.caller) else {
            debug!(
                "Dropped result of invocation {} for departed caller {}",
                message.invocation_request, pending.caller
            );
            return Ok(());
        };
        let reply = match validation {
            Ok(()) => {
                if progress && !pending.receive_progress {
                    return Ok(());
                }
                let details = if progress {
                    Dictionary::from_iter([("progress".to_owned(), Value::Bool(true))])
                } else {
                    Dictionary::default()
                };
                Message::Result(ResultMessage {
                    call_request: pending.call_request,
                    details,
                    payload: message.payload.clone(),
                })
            }
            Err(err) => call_error(pending.call_request, &invalid_argument(err)),
        };
        if let Err(err) = caller.sender.send(reply) {
            debug!("Failed to send RESULT to session {}: {err}", pending.caller);
        }
        Ok(())
    }

    async fn handle_invocation_error(
        &self,
        context: &RouterContext,
        message: &ErrorMessage,
    ) -> Result<()> {
        if message.request_type != Message::INVOCATION_TAG {
            return Err(InteractionError::ProtocolViolation(format!(
                "received ERROR for request type {}",
                message.request_type
            ))
            .into());
        }
        let info = self.info()?;
        let mut context = context.realm_context(&info.realm).await?;
        let realm = context.realm_mut();
        if !realm
            .dealer
            .pending(message.request)
            .is_some_and(|pending| pending.callee == self.id)
        {
            if realm.dealer.take_abandoned(message.request, self.id, true) {
                debug!(
                    "Dropped error of invocation {} abandoned by its caller",
                    message.request
                );
                return Ok(());
            }
            return Err(InteractionError::ProtocolViolation(format!(
                "received ERROR for unknown invocation {}",
                message.request
            ))
            .into());
        }
        let Some(pending) = realm.dealer.remove_pending(message.request) else {
            return Ok(());
        };
        if let Some(caller) = realm.sessions.get(&pending.caller) {
            caller
                .sender
                .send(Message::Error(ErrorMessage {
                    request_type: Message::CALL_TAG,
                    request: pending.call_request,
                    details: message.details.clone(),
                    error: message.error.clone(),
                    payload: message.payload.clone(),
                }))
                .ok();
        }
        Ok(())
    }

    async fn handle_closing(&mut self, context: &RouterContext, message: Message) -> Result<()> {
        match message {
            Message::Goodbye(_) | Message::Abort(_) => {
                self.transition_state(context, SessionState::Closed).await
            }
            _ => Ok(()),
        }
    }

    async fn transition_state(&mut self, context: &RouterContext, state: SessionState) -> Result<()> {
        if self.state.is_same_state(&state) {
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
            "Router session {} transitioned from {:?} to {state:?}",
            self.id, self.state
        );
        let previous = std::mem::replace(&mut self.state, state);
        if let SessionState::Established { info } = previous {
            self.leave_realm(context, &info).await;
        }
        if let SessionState::Closed = self.state {
            self.closed_tx.send_replace(true);
        }
        Ok(())
    }

    async fn leave_realm(&self, context: &RouterContext, info: &SessionInfo) {
        let mut realm_context = match context.realm_context(&info.realm).await {
            Ok(realm_context) => realm_context,
            Err(err) => {
                error!(
                    "Failed to clean up session {}, due to error getting context for realm {}: {err}",
                    self.id, info.realm
                );
                return;
            }
        };

        let realm = realm_context.realm_mut();
        realm.sessions.remove(&self.id);
        realm.broker.remove_session(self.id);
        let removed = realm.dealer.remove_session(self.id);
        let canceled = Error::from(InteractionError::Canceled("callee disconnected".to_owned()));
        for pending in removed.canceled {
            if let Some(caller) = realm.sessions.get(&pending.caller) {
                caller
                    .sender
                    .send(call_error(pending.call_request, &canceled))
                    .ok();
            }
        }
        for (invocation, pending) in removed.abandoned {
            let Some(callee) = realm.sessions.get(&pending.callee) else {
                continue;
            };
            if !callee.info.callee_feature("call_canceling") {
                continue;
            }
            callee
                .sender
                .send(Message::Interrupt(InterruptMessage {
                    invocation_request: invocation,
                    options: Dictionary::from_iter([(
                        "mode".to_owned(),
                        Value::String(InterruptMode::Kill.to_string()),
                    )]),
                }))
                .ok();
        }
        info!("Session {} left realm {}", self.id, info.realm);
        drop(realm_context);

        context
            .router()
            .realm_manager
            .remove_if_empty(&info.realm)
            .await;
    }
}

#[cfg(test)]
mod session_test {
    use std::sync::Arc;

    use crate::{
        auth::anonymous::AnonymousServerAuthenticator,
        core::{
            id::Id,
            types::Dictionary,
            uri::Uri,
        },
        router::session::{
            SessionInfo,
            SessionState,
        },
    };

    fn established() -> SessionState {
        SessionState::Established {
            info: Arc::new(SessionInfo {
                id: Id::FIRST,
                realm: Uri::try_from("com.example.realm").unwrap(),
                identity: Default::default(),
                auth_method: Default::default(),
                auth_provider: "static".to_owned(),
                roles: Dictionary::default(),
            }),
        }
    }

    fn authenticating() -> SessionState {
        SessionState::Authenticating {
            realm: Uri::try_from("com.example.realm").unwrap(),
            authenticator: Box::new(AnonymousServerAuthenticator::default()),
            roles: Dictionary::default(),
        }
    }

    #[test]
    fn allows_handshake_transitions() {
        assert!(SessionState::Closed.allowed_state_transition(&authenticating()));
        assert!(SessionState::Closed.allowed_state_transition(&established()));
        assert!(authenticating().allowed_state_transition(&established()));
        assert!(authenticating().allowed_state_transition(&SessionState::Closed));
        assert!(established().allowed_state_transition(&SessionState::Closing));
        assert!(SessionState::Closing.allowed_state_transition(&SessionState::Closed));
    }

    #[test]
    fn rejects_skipping_handshake_steps() {
        assert!(!SessionState::Closed.allowed_state_transition(&SessionState::Closing));
        assert!(!authenticating().allowed_state_transition(&SessionState::Closing));
        assert!(!SessionState::Closing.allowed_state_transition(&established()));
        assert!(!established().allowed_state_transition(&authenticating()));
    }

    #[test]
    fn compares_states_by_kind() {
        assert!(established().is_same_state(&established()));
        assert!(!established().is_same_state(&SessionState::Closing));
        pretty_assertions::assert_eq!(format!("{:?}", SessionState::Closed), "Closed");
    }
}
