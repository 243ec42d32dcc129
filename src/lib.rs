//! Conduit - the resilience and dispatch layer of a multi-provider gateway.
//!
//! Conduit sits between callers and remote dependencies (model providers and
//! similar services). It bounds and reuses network connections, retries
//! transient failures behind per-dependency circuit breakers, coalesces
//! identical concurrent requests into one execution, and resolves which
//! dependency serves a request.
//!
//! # Components
//! - [`core::ConnectionPool`]: per-destination handle reuse with per-destination
//!   and global caps; unpooled overflow handles instead of blocking
//! - [`core::RetryExecutor`] and [`core::CircuitBreakerRegistry`]: exponential
//!   backoff with jitter, gated by a Closed/Open/HalfOpen breaker per dependency
//! - [`core::RequestCoordinator`]: SHA-256 request fingerprints, in-flight
//!   coalescing and bounded per-dependency performance history
//! - [`core::ProviderRegistry`]: factories, cached instances, capability and
//!   model-prefix routing
//! - [`core::Dispatcher`]: composes all of the above into one request lifecycle
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use conduit::{
//!     Dispatcher, RequestDescriptor,
//!     adapters::{HttpConnector, HttpJsonProviderFactory},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = conduit::config::load_config("conduit.yaml").await?;
//! let dispatcher = Dispatcher::new(config.clone(), Arc::new(HttpConnector::new()));
//! for id in config.providers.keys() {
//!     dispatcher
//!         .registry()
//!         .register_constructor(id, HttpJsonProviderFactory, Vec::<String>::new())
//!         .await;
//! }
//! dispatcher.start().await;
//!
//! let response = dispatcher
//!     .dispatch(RequestDescriptor::new("gpt-4o-mini", "chat"))
//!     .await?;
//! println!("{}", response.body);
//! dispatcher.shutdown().await;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Ports (traits) live in [`ports`]: a [`ports::Connector`] opens connection
//! handles for the pool and a [`ports::Provider`] executes requests over them.
//! [`adapters`] holds the HTTP implementations. Everything in `core` is
//! explicitly constructed; there are no process-wide singletons.
//!
//! # Error Handling
//! Core operations return [`GatewayResult`], whose [`GatewayError`] variants
//! separate transient failures (retried per configuration) from usage errors,
//! circuit rejections and creation failures. Application plumbing (config
//! loading, the CLI) uses `eyre::Result` with `WrapErr` context.
//!
//! # Concurrency & Data Structures
//! Shared maps are `scc::HashMap` (per-entry locking), so different
//! dependencies never contend on one lock.
pub mod config;
pub mod error;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the types most callers need
pub use crate::{
    core::{
        ConnectionPool, ContentEntry, Dispatcher, ProviderRegistry, ProviderResponse,
        RequestCoordinator, RequestDescriptor, RetryExecutor,
    },
    error::{GatewayError, GatewayResult},
};
