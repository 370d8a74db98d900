mod peer;
mod session;

pub use peer::{
    Peer,
    PeerConfig,
    PeerNotConnectedError,
    Procedure,
    ProcedureOptions,
    ProgressivePendingRpc,
    PublishOptions,
    PublishedEvent,
    RpcCall,
    RpcResult,
    Subscription,
    SubscriptionOptions,
};
pub use session::{
    Event,
    Invocation,
    RpcYield,
};
