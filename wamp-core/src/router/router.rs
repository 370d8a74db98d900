use std::{
    net::{
        IpAddr,
        Ipv4Addr,
        SocketAddr,
    },
    sync::atomic::{
        AtomicBool,
        Ordering,
    },
};

use anyhow::{
    Error,
    Result,
};
use log::{
    debug,
    error,
    info,
};
use tokio::{
    net::{
        TcpListener,
        TcpStream,
    },
    sync::broadcast,
    task::JoinHandle,
};

use crate::{
    core::{
        close::CloseReason,
        features::{
            PubSubFeatures,
            RpcFeatures,
        },
        id::{
            IdAllocator,
            RandomIdAllocator,
        },
        roles::RouterRole,
        service::Service,
        types::HashSet,
        uri::UriCheck,
    },
    router::{
        acceptor::WampConnectHandler,
        app::{
            pub_sub::PubSubPolicies,
            rpc::RpcPolicies,
        },
        connection::Connection,
        context::RouterContext,
        realm::{
            RealmConfig,
            RealmManager,
        },
    },
    serializer::serializer::{
        SerializerType,
        new_serializer,
    },
    transport::web_socket_transport::WebSocketTransport,
    websocket::{
        connection::ConnectionCounter,
        options::ServerOptions,
        server_handshake,
    },
};

const DEFAULT_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

/// Configuration for a [`Router`].
#[derive(Debug)]
pub struct RouterConfig {
    /// IP address the router starts on.
    pub address: IpAddr,
    /// Network port the router starts on.
    pub port: u16,
    /// Agent name, communicated to peers.
    pub agent: String,
    /// Roles implemented by the router.
    pub roles: HashSet<RouterRole>,
    /// Advanced pub/sub features announced to peers.
    pub pub_sub_features: PubSubFeatures,
    /// Advanced RPC features announced to peers.
    pub rpc_features: RpcFeatures,
    /// Realms available on the router.
    pub realms: Vec<RealmConfig>,
    /// Whether realms that are not configured are created when a peer joins them.
    pub dynamic_realms: bool,
    /// How strictly URIs in requests are checked.
    pub uri_check: UriCheck,
    /// Allowed serializers, in order of preference.
    ///
    /// The actual serializer is selected when the connection with the router is established.
    pub serializers: Vec<SerializerType>,
    /// WebSocket server options.
    pub web_socket: ServerOptions,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 0,
            agent: DEFAULT_AGENT.to_owned(),
            roles: HashSet::from_iter([RouterRole::Broker, RouterRole::Dealer]),
            pub_sub_features: PubSubFeatures::default(),
            rpc_features: RpcFeatures::default(),
            realms: Vec::default(),
            dynamic_realms: false,
            uri_check: UriCheck::default(),
            serializers: Vec::from_iter([SerializerType::Json, SerializerType::MessagePack]),
            web_socket: ServerOptions::default(),
        }
    }
}

/// A handle to an asynchronously-running [`Router`].
///
/// The router's ownership is transferred away when it starts. This handle allows interaction with
/// the router as it is running asynchronously.
pub struct RouterHandle {
    start_handle: JoinHandle<()>,
    local_addr: SocketAddr,
    cancel_tx: broadcast::Sender<()>,
}

impl RouterHandle {
    /// Joins the router task, effectively waiting for the router to stop altogether.
    pub async fn join(self) -> Result<()> {
        self.start_handle.await.map_err(Error::new)
    }

    /// Cancels the router.
    ///
    /// Cancellation is asynchronous. Use [`Self::join`] to wait for the router to stop.
    pub fn cancel(&self) -> Result<()> {
        self.cancel_tx.send(()).map(|_| ()).map_err(Error::new)
    }

    /// The local address of the router.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The WebSocket URL for connecting to the router.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }
}

/// A WAMP router (a.k.a., server) that accepts incoming connections and handles sessions.
pub struct Router {
    /// The router configuration when created.
    pub(crate) config: RouterConfig,

    /// Policies for pub/sub functionality.
    pub(crate) pub_sub_policies: Box<dyn PubSubPolicies>,

    /// Policies for RPC functionality.
    pub(crate) rpc_policies: Box<dyn RpcPolicies>,

    /// Realm manager.
    pub(crate) realm_manager: RealmManager,

    // Allocator for global IDs.
    pub(crate) id_allocator: Box<dyn IdAllocator>,

    connect_handler: WampConnectHandler,
    connection_counter: ConnectionCounter,
    ending: AtomicBool,
    cancel_tx: broadcast::Sender<()>,
    end_tx: broadcast::Sender<()>,
    _end_rx: broadcast::Receiver<()>,
}

impl Router {
    /// Creates a new [`Router`].
    pub fn new(
        config: RouterConfig,
        pub_sub_policies: Box<dyn PubSubPolicies>,
        rpc_policies: Box<dyn RpcPolicies>,
    ) -> Result<Self> {
        config.web_socket.validate()?;
        if config.serializers.is_empty() {
            return Err(Error::msg("router must allow at least one serializer"));
        }
        let realm_manager = RealmManager::new(config.realms.iter().cloned());
        let connect_handler = WampConnectHandler::new(config.serializers.clone());
        let (cancel_tx, _) = broadcast::channel(1);
        let (end_tx, end_rx) = broadcast::channel(1);
        Ok(Self {
            config,
            pub_sub_policies,
            rpc_policies,
            realm_manager,
            id_allocator: Box::new(RandomIdAllocator::default()),
            connect_handler,
            connection_counter: ConnectionCounter::default(),
            ending: AtomicBool::new(false),
            cancel_tx,
            end_tx,
            _end_rx: end_rx,
        })
    }

    /// Receiver channel for determining when the router ends.
    pub(crate) fn end_rx(&self) -> broadcast::Receiver<()> {
        self.end_tx.subscribe()
    }

    /// Whether the router is shutting down, so connections should not start new sessions.
    pub(crate) fn ending(&self) -> bool {
        self.ending.load(Ordering::Acquire)
    }

    /// Starts the router asynchronously.
    ///
    /// The returned handle can be used to interact with the router since its ownership is
    /// transferred away.
    pub async fn start(self) -> Result<RouterHandle> {
        let addr = format!("{}:{}", self.config.address, self.config.port);
        info!(
            "Starting router {} at {addr}: {:?}",
            self.config.agent, self.config
        );
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        let cancel_tx = self.cancel_tx.clone();
        let context = RouterContext::new(self);
        let start_handle = tokio::spawn(Self::handle_connections(context, listener));

        Ok(RouterHandle {
            start_handle,
            local_addr,
            cancel_tx,
        })
    }

    async fn handle_connections(context: RouterContext, listener: TcpListener) {
        Self::connection_loop(&context, listener).await;
        Self::shut_down(&context).await;
        if let Err(err) = context.router().end_tx.send(()) {
            error!("Failed to write to end_tx channel after router connection loop ended: {err}");
        }
        info!("Router {} stopped", context.router().config.agent);
    }

    async fn connection_loop(context: &RouterContext, listener: TcpListener) {
        let mut cancel_rx = context.router().cancel_tx.subscribe();

        loop {
            tokio::select! {
                accept = listener.accept() => {
                    let (stream, addr) = match accept {
                        Ok((stream, addr)) => (stream, addr),
                        Err(err) => {
                            error!("Failed to accept TCP connection: {err}");
                            break;
                        }
                    };
                    tokio::spawn(Self::handle_connection(context.clone(), addr, stream));
                }
                _ = cancel_rx.recv() => {
                    break;
                }
            }
        }
    }

    async fn handle_connection(context: RouterContext, addr: SocketAddr, stream: TcpStream) {
        if let Err(err) = Self::start_connection(&context, addr, stream).await {
            error!("Failed to start handling connection from {addr}: {err}");
        }
    }

    async fn start_connection(
        context: &RouterContext,
        addr: SocketAddr,
        stream: TcpStream,
    ) -> Result<()> {
        debug!("Incoming TCP connection from {addr}");
        let router = context.router();
        if router.config.web_socket.protocol.tcp_no_delay {
            stream.set_nodelay(true)?;
        }
        let connection = match server_handshake::accept(
            stream,
            addr.to_string(),
            &router.config.web_socket,
            &router.connect_handler,
            &router.connection_counter,
        )
        .await?
        {
            Some(connection) => connection,
            None => {
                debug!("Connection from {addr} was answered without upgrading");
                return Ok(());
            }
        };

        let serializer = match connection.protocol() {
            Some(protocol) => SerializerType::try_from(protocol).map_err(Error::msg)?,
            None => SerializerType::Json,
        };
        debug!("WAMP connection established with {addr} using {serializer}");

        let connection_handle = Connection::new();
        let uuid = connection_handle.uuid();
        let transport = WebSocketTransport::new(connection, serializer);
        let service = Service::new(
            uuid.to_string(),
            Box::new(transport),
            new_serializer(serializer),
        );
        info!("Created connection {uuid} for {addr}");
        connection_handle.start(context.clone(), service);
        Ok(())
    }

    async fn shut_down(context: &RouterContext) {
        let router = context.router();
        router.ending.store(true, Ordering::Release);
        for uri in router.realm_manager.uris().await {
            if let Err(err) = router
                .realm_manager
                .shut_down(&uri, CloseReason::SystemShutdown)
                .await
            {
                error!("Failed to shut down realm {uri}: {err}");
            }
        }
    }
}
