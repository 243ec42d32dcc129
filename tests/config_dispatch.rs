// A dispatcher built from a configuration file routes, retries and trips breakers
#[cfg(test)]
mod test {
    use std::{
        io::Write,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;
    use conduit::{
        Dispatcher, GatewayError, GatewayResult, ProviderResponse, RequestDescriptor,
        config::{PoolConfig, ProviderConfig, load_config},
        core::CircuitState,
        ports::{Connector, Provider, SharedProvider},
    };
    use serde_json::json;
    use tempfile::NamedTempFile;

    struct LoopbackConnector;

    #[async_trait]
    impl Connector for LoopbackConnector {
        type Handle = ();

        async fn connect(&self, _destination: &str, _config: &PoolConfig) -> GatewayResult<()> {
            Ok(())
        }
    }

    struct ScriptedProvider {
        id: String,
        destination: String,
        capabilities: Vec<String>,
        calls: Arc<AtomicUsize>,
        healthy: bool,
    }

    #[async_trait]
    impl Provider<()> for ScriptedProvider {
        fn id(&self) -> &str {
            &self.id
        }

        fn destination(&self) -> &str {
            &self.destination
        }

        fn capabilities(&self) -> &[String] {
            &self.capabilities
        }

        async fn execute(
            &self,
            request: &RequestDescriptor,
            _connection: &(),
        ) -> GatewayResult<ProviderResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy {
                Ok(ProviderResponse::new(&self.id, &request.target, json!("ok")))
            } else {
                Err(GatewayError::Network("connection reset".into()))
            }
        }
    }

    const CONFIG: &str = r#"
retry:
  max_attempts: 2
  initial_delay_ms: 1
  max_delay_ms: 2
  jitter_factor: 0.0
circuit_breaker:
  failure_threshold: 2
  recovery_timeout_ms: 600000
providers:
  alpha:
    destination: "http://alpha.internal"
    model_prefixes: ["alpha-"]
    capabilities: ["chat"]
  beta:
    destination: "http://beta.internal"
    model_prefixes: ["beta-"]
    capabilities: ["chat", "embeddings"]
  gamma:
    destination: "http://gamma.internal"
    enabled: false
"#;

    async fn dispatcher_from_file() -> (Dispatcher<LoopbackConnector>, Arc<AtomicUsize>) {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(file, "{CONFIG}").unwrap();
        let config = load_config(file.path().to_str().unwrap()).await.unwrap();

        let dispatcher = Dispatcher::new(config.clone(), Arc::new(LoopbackConnector));
        let calls = Arc::new(AtomicUsize::new(0));
        for id in config.providers.keys() {
            let calls = Arc::clone(&calls);
            dispatcher
                .registry()
                .register_constructor(
                    id,
                    move |id: &str, config: &ProviderConfig| -> eyre::Result<SharedProvider<()>> {
                        Ok(Arc::new(ScriptedProvider {
                            id: id.to_string(),
                            destination: config.destination.clone(),
                            capabilities: config.capabilities.clone(),
                            calls: Arc::clone(&calls),
                            healthy: id != "beta",
                        }))
                    },
                    Vec::<String>::new(),
                )
                .await;
        }
        (dispatcher, calls)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_reports_configured_providers() {
        let (dispatcher, _) = dispatcher_from_file().await;
        let report = dispatcher.start().await;
        assert_eq!(report.healthy, vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(report.skipped, vec!["gamma".to_string()]);
        assert!(report.is_fully_healthy());
        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_routes_by_configured_prefix() {
        let (dispatcher, _) = dispatcher_from_file().await;
        dispatcher.start().await;

        let response = dispatcher
            .dispatch(RequestDescriptor::new("Alpha-Small", "chat"))
            .await
            .unwrap();
        assert_eq!(response.dependency_id, "alpha");
        assert_eq!(response.body, json!("ok"));

        let stats = dispatcher.stats().await;
        assert!(stats.pool.destination("http://alpha.internal").is_some());
        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_repeated_failures_open_the_breaker() {
        let (dispatcher, calls) = dispatcher_from_file().await;
        dispatcher.start().await;

        for prompt in ["one", "two"] {
            let result = dispatcher
                .dispatch(RequestDescriptor::new("beta-1", "chat").with_parameter("prompt", prompt))
                .await;
            assert!(matches!(result, Err(GatewayError::Network(_))));
        }
        // two attempts per dispatch
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(dispatcher.breakers().state("beta").await, CircuitState::Open);

        let rejected = dispatcher
            .dispatch(RequestDescriptor::new("beta-1", "chat").with_parameter("prompt", "three"))
            .await;
        assert!(matches!(rejected, Err(GatewayError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let stats = dispatcher.stats().await;
        assert_eq!(stats.retry.circuit_rejections, 1);
        assert_eq!(stats.retry.failures, 2);
        let beta = stats
            .dependencies
            .iter()
            .find(|d| d.dependency == "beta")
            .unwrap();
        assert_eq!(beta.error_counts.get("network"), Some(&2));
        assert_eq!(beta.error_counts.get("circuit_open"), Some(&1));

        // other dependencies are unaffected
        assert!(dispatcher
            .dispatch(RequestDescriptor::new("alpha-1", "chat"))
            .await
            .is_ok());
        dispatcher.shutdown().await;
    }
}
