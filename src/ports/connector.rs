use std::sync::Arc;

use async_trait::async_trait;

use crate::{config::PoolConfig, error::GatewayResult};

/// Connector defines the port (interface) the connection pool uses to open
/// and close connection handles for a destination.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Handle lent to callers while a connection is checked out
    type Handle: Send + Sync + 'static;

    /// Open a new connection handle for `destination`.
    ///
    /// # Arguments
    /// * `destination` - Base URL (scheme, host, port) the handle talks to
    /// * `config` - Pool configuration (connect timeout, compression flag, ...)
    async fn connect(&self, destination: &str, config: &PoolConfig)
    -> GatewayResult<Self::Handle>;

    /// Close a handle that the pool is discarding.
    ///
    /// Callers may still hold clones of the `Arc`; the default drops the pool's reference.
    async fn close(&self, destination: &str, handle: Arc<Self::Handle>) {
        let _ = destination;
        drop(handle);
    }
}
