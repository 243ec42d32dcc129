// A dispatch dropped mid-flight must give back its connection and its in-flight entry
#[cfg(test)]
mod test {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use conduit::{
        ContentEntry, Dispatcher, GatewayError, GatewayResult, ProviderResponse,
        RequestDescriptor,
        config::{GatewayConfig, PoolConfig, ProviderConfig, RetryConfig},
        ports::{Connector, Provider, SharedProvider},
    };
    use serde_json::json;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct CountingConnector {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        type Handle = ();

        async fn connect(&self, _destination: &str, _config: &PoolConfig) -> GatewayResult<()> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct GatedProvider {
        id: String,
        capabilities: Vec<String>,
        gate: Arc<Semaphore>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Provider<()> for GatedProvider {
        fn id(&self) -> &str {
            &self.id
        }

        fn destination(&self) -> &str {
            "http://gated"
        }

        fn capabilities(&self) -> &[String] {
            &self.capabilities
        }

        async fn execute(
            &self,
            request: &RequestDescriptor,
            _connection: &(),
        ) -> GatewayResult<ProviderResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| GatewayError::Operation(e.to_string()))?;
            permit.forget();
            Ok(ProviderResponse::new(
                &self.id,
                &request.target,
                json!({ "call": call }),
            ))
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher<CountingConnector>>,
        connector: Arc<CountingConnector>,
        gate: Arc<Semaphore>,
        calls: Arc<AtomicUsize>,
    }

    async fn harness() -> Harness {
        let config = GatewayConfig::builder()
            .pool(PoolConfig {
                max_connections_per_destination: 1,
                max_total_connections: 1,
                ..PoolConfig::default()
            })
            .retry(RetryConfig {
                max_attempts: 1,
                ..RetryConfig::default()
            })
            .provider(
                "gated",
                ProviderConfig::new("http://gated")
                    .with_model_prefixes(["gated-"])
                    .with_capabilities(["chat"]),
            )
            .build();
        let connector = Arc::new(CountingConnector::default());
        let dispatcher = Arc::new(Dispatcher::new(config, Arc::clone(&connector)));

        let gate = Arc::new(Semaphore::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let (factory_gate, factory_calls) = (Arc::clone(&gate), Arc::clone(&calls));
        dispatcher
            .registry()
            .register_constructor(
                "gated",
                move |id: &str, config: &ProviderConfig| -> eyre::Result<SharedProvider<()>> {
                    Ok(Arc::new(GatedProvider {
                        id: id.to_string(),
                        capabilities: config.capabilities.clone(),
                        gate: Arc::clone(&factory_gate),
                        calls: Arc::clone(&factory_calls),
                    }))
                },
                Vec::<String>::new(),
            )
            .await;
        dispatcher.start().await;
        Harness {
            dispatcher,
            connector,
            gate,
            calls,
        }
    }

    fn request(prompt: &str) -> RequestDescriptor {
        RequestDescriptor::new("gated-1", "chat").with_content(ContentEntry::text("user", prompt))
    }

    async fn wait_for_calls(calls: &AtomicUsize, expected: usize) {
        while calls.load(Ordering::SeqCst) < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_until_settled(dispatcher: &Dispatcher<CountingConnector>) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while dispatcher.coordinator().in_flight_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("in-flight entry was never resolved");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_aborted_dispatch_returns_its_connection() {
        let Harness {
            dispatcher,
            connector,
            gate,
            calls,
        } = harness().await;

        let aborted = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.dispatch(request("first")).await })
        };
        wait_for_calls(&calls, 1).await;
        aborted.abort();
        assert!(aborted.await.unwrap_err().is_cancelled());
        wait_until_settled(&dispatcher).await;

        gate.add_permits(3);
        for prompt in ["second", "third", "fourth"] {
            dispatcher.dispatch(request(prompt)).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let stats = dispatcher.stats().await;
        assert_eq!(stats.pool.overflow_created, 0);
        let gated = stats.pool.destination("http://gated").unwrap();
        assert_eq!(gated.active, 0);
        assert_eq!(gated.idle, 1);
        assert_eq!(gated.cache_hits, 3);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.pool().sweep_idle().await, 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_aborted_leader_releases_its_followers() {
        let Harness {
            dispatcher,
            gate,
            calls,
            ..
        } = harness().await;

        let leader = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.dispatch(request("same")).await })
        };
        wait_for_calls(&calls, 1).await;
        let follower = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.dispatch(request("same")).await })
        };
        // let the duplicate join the leader's entry
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());

        let outcome = tokio::time::timeout(Duration::from_secs(2), follower)
            .await
            .expect("follower stayed blocked after its leader was dropped")
            .unwrap();
        match outcome {
            Err(GatewayError::Operation(message)) => assert!(message.contains("abandoned")),
            other => panic!("unexpected follower outcome: {other:?}"),
        }
        wait_until_settled(&dispatcher).await;

        // the fingerprint is free again
        gate.add_permits(1);
        let response = dispatcher.dispatch(request("same")).await.unwrap();
        assert_eq!(response.body, json!({ "call": 1 }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        dispatcher.shutdown().await;
    }
}
