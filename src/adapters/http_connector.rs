use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use crate::{
    config::PoolConfig,
    error::{GatewayError, GatewayResult},
    ports::Connector,
};

const USER_AGENT: &str = concat!("conduit/", env!("CARGO_PKG_VERSION"));

/// Connector handing out one `reqwest::Client` per pooled connection.
///
/// Each client keeps at most one idle socket to its destination, so a pooled
/// handle maps onto a single reusable connection. Sockets are opened lazily on
/// the first request.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector;

impl HttpConnector {
    pub fn new() -> Self {
        Self
    }

    fn build_client(destination: &str, config: &PoolConfig) -> GatewayResult<Client> {
        let url = Url::parse(destination)
            .map_err(|e| GatewayError::Usage(format!("invalid destination '{destination}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(GatewayError::Usage(format!(
                "destination '{destination}' must use http or https"
            )));
        }

        Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(config.max_idle())
            .tcp_keepalive(config.keep_alive())
            .gzip(config.compression)
            .build()
            .map_err(|e| GatewayError::Network(format!("failed to build client for {destination}: {e}")))
    }
}

#[async_trait]
impl Connector for HttpConnector {
    type Handle = Client;

    async fn connect(&self, destination: &str, config: &PoolConfig) -> GatewayResult<Client> {
        let client = Self::build_client(destination, config)?;
        tracing::debug!(destination, compression = config.compression, "Built HTTP client");
        Ok(client)
    }
}
