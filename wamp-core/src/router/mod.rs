mod acceptor;
mod app;
mod broker;
mod connection;
mod context;
mod dealer;
mod realm;
mod router;
mod session;

pub use acceptor::WampConnectHandler;
pub use app::{
    pub_sub::{
        EmptyPubSubPolicies,
        PubSubPolicies,
    },
    rpc::{
        EmptyRpcPolicies,
        RpcPolicies,
    },
};
pub use realm::{
    RealmAuthenticationConfig,
    RealmConfig,
};
pub use router::{
    Router,
    RouterConfig,
    RouterHandle,
};
pub use session::SessionInfo;
