pub mod connector;
pub mod provider;

pub use connector::Connector;
pub use provider::{Provider, ProviderFactory, SharedProvider};
