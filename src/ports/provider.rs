use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config::ProviderConfig,
    core::request::{ProviderResponse, RequestDescriptor},
    error::GatewayResult,
};

/// Provider defines the port (interface) every backend adapter implements.
///
/// `H` is the connection handle type lent by the pool (see [`Connector`](super::Connector)).
#[async_trait]
pub trait Provider<H>: Send + Sync + 'static
where
    H: Send + Sync + 'static,
{
    /// Normalized dependency id
    fn id(&self) -> &str;

    /// Destination whose pooled connections this provider uses
    fn destination(&self) -> &str;

    /// Capability tags this provider serves
    fn capabilities(&self) -> &[String];

    /// One-time initialization run when the instance is registered.
    /// An error marks the instance unhealthy.
    async fn initialize(&self) -> GatewayResult<()> {
        Ok(())
    }

    /// Execute one attempt of a request over the given connection handle.
    ///
    /// The dispatcher runs this inside the retry executor, so a single call
    /// must never retry on its own.
    async fn execute(
        &self,
        request: &RequestDescriptor,
        connection: &H,
    ) -> GatewayResult<ProviderResponse>;

    /// Release resources held by the instance
    async fn dispose(&self) -> GatewayResult<()> {
        Ok(())
    }
}

/// Shared, type-erased provider instance
pub type SharedProvider<H> = Arc<dyn Provider<H>>;

/// Builds provider instances for one dependency id.
pub trait ProviderFactory<H>: Send + Sync + 'static
where
    H: Send + Sync + 'static,
{
    fn create(&self, id: &str, config: &ProviderConfig) -> eyre::Result<SharedProvider<H>>;
}

impl<H, F> ProviderFactory<H> for F
where
    H: Send + Sync + 'static,
    F: Fn(&str, &ProviderConfig) -> eyre::Result<SharedProvider<H>> + Send + Sync + 'static,
{
    fn create(&self, id: &str, config: &ProviderConfig) -> eyre::Result<SharedProvider<H>> {
        self(id, config)
    }
}
