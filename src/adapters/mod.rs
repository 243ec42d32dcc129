pub mod http_connector;
pub mod http_provider;

/// Re-export commonly used types from adapters
pub use http_connector::HttpConnector;
pub use http_provider::{HttpJsonProvider, HttpJsonProviderFactory};
