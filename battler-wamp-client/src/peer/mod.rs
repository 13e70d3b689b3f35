pub mod callee;
pub mod caller;
pub mod connection;
pub mod pending;
pub mod processor;
pub mod publisher;
pub mod state_machine;
pub mod subscriber;
mod web_socket_connection;

pub use callee::{
    CancellationSignal,
    Invocation,
    InvocationHandler,
    ProcedureOptions,
    Registration,
    RpcYield,
};
pub use caller::{
    CallOptions,
    PendingRpc,
    PendingRpcResult,
    RpcCall,
    RpcResult,
};
pub use connection::{
    Connection,
    ConnectionConfig,
    DEFAULT_AGENT,
};
pub use publisher::{
    Publication,
    PublishOptions,
    PublishedEvent,
};
pub use state_machine::ConnectionState;
pub use subscriber::{
    Event,
    EventHandler,
    Subscription,
    SubscriptionOptions,
};
pub use web_socket_connection::new_web_socket_connection;
