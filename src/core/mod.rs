pub mod circuit_breaker;
pub mod coordinator;
pub mod dispatcher;
pub mod fingerprint;
pub mod pool;
pub mod registry;
pub mod request;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState};
pub use coordinator::{
    DependencyMetricsSnapshot, InFlight, InFlightTicket, InFlightWaiter, RequestCoordinator,
};
pub use dispatcher::{Dispatcher, DispatcherStats};
pub use fingerprint::{RequestFingerprint, create_fingerprint, fingerprint_request};
pub use pool::{ConnectionPool, DestinationStats, PoolStats, PooledClient};
pub use registry::{InitializationReport, ProviderRegistry};
pub use request::{ContentEntry, ProviderResponse, RequestDescriptor};
pub use retry::{RetryAttempt, RetryExecutor, RetryStats};
