mod broadcaster;
mod connection_pool;
mod execution_service;

pub use broadcaster::{BroadcastError, OutputBroadcaster, Publisher, Subscription};
pub use connection_pool::{
    ConnectionError, ConnectionPool, PoolLease, PooledConnection,
};
pub use execution_service::{ExecutionService, StartExecution, StopOutcome};
