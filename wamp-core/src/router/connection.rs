use anyhow::{
    Error,
    Result,
};
use log::{
    error,
    info,
};
use tokio::sync::{
    broadcast,
    mpsc::{
        UnboundedReceiver,
        unbounded_channel,
    },
};
use uuid::Uuid;

use crate::{
    core::service::{
        MessageSender,
        Service,
    },
    message::message::Message,
    router::{
        context::RouterContext,
        session::Session,
    },
};

/// A connection from a router to a client.
///
/// On its own, a connection is not very meaningful. When started, it uses a WAMP [`Service`] to
/// send and receive messages on an underlying transport. Messages are used to set up and manage a
/// [`Session`], which handles all interactions with the router.
#[derive(Debug)]
pub struct Connection {
    uuid: Uuid,
}

impl Connection {
    /// Creates a new connection.
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
        }
    }

    /// The unique identifier of the connection.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Starts the connection on the runtime.
    pub fn start(self, context: RouterContext, service: Service) {
        tokio::spawn(self.run(context, service));
    }

    async fn run(self, context: RouterContext, service: Service) {
        self.run_service(&context, service).await;
        info!("Connection {} closed", self.uuid);
    }

    async fn run_service(&self, context: &RouterContext, mut service: Service) {
        let mut message_rx = match service.take_message_rx() {
            Some(message_rx) => message_rx,
            None => {
                error!("Service for connection {} has no message receiver", self.uuid);
                return;
            }
        };
        let end_rx = service.end_rx();

        let service_handle = service.start();
        loop {
            if !self
                .run_session(
                    context,
                    service_handle.message_tx(),
                    &mut message_rx,
                    end_rx.resubscribe(),
                )
                .await
            {
                continue;
            }

            info!("Connection {} will have no more sessions", self.uuid);
            break;
        }

        if let Err(err) = service_handle.cancel() {
            error!(
                "Failed to cancel service for connection {}: {err}",
                self.uuid
            );
        }

        if let Err(err) = service_handle.join().await {
            error!("Failed to join service for connection {}: {err}", self.uuid);
        }
    }

    /// Runs a single session over the connection.
    ///
    /// Returns whether the connection is done, so that no further sessions should be started.
    async fn run_session(
        &self,
        context: &RouterContext,
        service_message_tx: MessageSender,
        service_message_rx: &mut UnboundedReceiver<Message>,
        end_rx: broadcast::Receiver<()>,
    ) -> bool {
        if context.router().ending() {
            return true;
        }

        let session_id = context.router().id_allocator.generate_id().await;
        let (message_tx, message_rx) = unbounded_channel();
        let mut session = Session::new(session_id, message_tx, service_message_tx);

        info!(
            "Proactively starting router session {} for connection {}",
            session_id, self.uuid
        );

        let done = match self
            .session_loop(context, &mut session, message_rx, service_message_rx, end_rx)
            .await
        {
            Ok(done) => {
                info!(
                    "Router session {} for connection {} finished",
                    session.id(),
                    self.uuid
                );
                done
            }
            Err(err) => {
                error!(
                    "Router session {} for connection {} failed: {err:#}",
                    session.id(),
                    self.uuid
                );
                true
            }
        };

        // A session that did not close cleanly still holds resources in its realm.
        if !session.closed() {
            if let Err(err) = session.abandon(context).await {
                error!("Failed to clean up router session {}: {err}", session.id());
            }
        }
        done
    }

    async fn session_loop(
        &self,
        context: &RouterContext,
        session: &mut Session,
        mut message_rx: UnboundedReceiver<Message>,
        service_message_rx: &mut UnboundedReceiver<Message>,
        mut end_rx: broadcast::Receiver<()>,
    ) -> Result<bool> {
        let mut finish_on_close = false;
        let mut router_end_rx = context.router().end_rx();

        loop {
            tokio::select! {
                // Received a message from some part of the router.
                message = message_rx.recv() => {
                    let message = match message {
                        Some(message) => message,
                        None => return Err(Error::msg("failed to receive message from session channel")),
                    };
                    let message_name = message.message_name();
                    if let Err(err) = session.send_message(context, message).await {
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
                    if let Err(err) = session.handle_message(context, message).await {
                        return Err(err.context(format!("failed to handle {message_name} message")));
                    }
                }
                // Service ended, so the transport is gone.
                _ = end_rx.recv() => return Ok(true),
                // Router ended, which is only clean if the session already closed.
                _ = router_end_rx.recv() => {
                    if session.closed() {
                        return Ok(true);
                    }
                    return Err(Error::msg("router ended abruptly"));
                }
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
}
