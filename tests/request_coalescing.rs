// Concurrent identical requests must share one underlying execution
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

    struct LoopbackConnector;

    #[async_trait]
    impl Connector for LoopbackConnector {
        type Handle = ();

        async fn connect(&self, _destination: &str, _config: &PoolConfig) -> GatewayResult<()> {
            Ok(())
        }
    }

    /// Blocks every execution until the test hands out a permit
    struct GatedProvider {
        id: String,
        capabilities: Vec<String>,
        gate: Arc<Semaphore>,
        calls: Arc<AtomicUsize>,
        fail: bool,
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
            if self.fail {
                return Err(GatewayError::Status {
                    status: 400,
                    message: "rejected".into(),
                });
            }
            Ok(ProviderResponse::new(
                &self.id,
                &request.target,
                json!({ "call": call }),
            ))
        }
    }

    async fn gated_dispatcher(
        fail: bool,
    ) -> (Arc<Dispatcher<LoopbackConnector>>, Arc<Semaphore>, Arc<AtomicUsize>) {
        let config = GatewayConfig::builder()
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
        let dispatcher = Arc::new(Dispatcher::new(config, Arc::new(LoopbackConnector)));

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
                        fail,
                    }))
                },
                Vec::<String>::new(),
            )
            .await;
        dispatcher.start().await;
        (dispatcher, gate, calls)
    }

    fn request() -> RequestDescriptor {
        RequestDescriptor::new("gated-1", "chat")
            .with_content(ContentEntry::text("user", "hello"))
            .with_parameter("temperature", 0.0)
    }

    async fn wait_for_first_call(calls: &AtomicUsize) {
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // let every duplicate reach the coordinator
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_duplicates_execute_once() {
        let (dispatcher, gate, calls) = gated_dispatcher(false).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dispatcher = Arc::clone(&dispatcher);
            handles.push(tokio::spawn(async move { dispatcher.dispatch(request()).await }));
        }

        wait_for_first_call(&calls).await;
        assert_eq!(dispatcher.coordinator().in_flight_count(), 1);
        gate.add_permits(1);

        let mut responses = Vec::new();
        for handle in handles {
            responses.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(responses.iter().all(|r| r == &responses[0]));
        assert_eq!(responses[0].body, json!({ "call": 0 }));

        // once resolved, the same request runs again
        gate.add_permits(1);
        let again = dispatcher.dispatch(request()).await.unwrap();
        assert_eq!(again.body, json!({ "call": 1 }));

        let stats = dispatcher.stats().await;
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.dependencies[0].total_requests, 2);
        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failures_are_shared_by_all_waiters() {
        let (dispatcher, gate, calls) = gated_dispatcher(true).await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let dispatcher = Arc::clone(&dispatcher);
            handles.push(tokio::spawn(async move { dispatcher.dispatch(request()).await }));
        }

        wait_for_first_call(&calls).await;
        gate.add_permits(1);

        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(
                result,
                Err(GatewayError::Status {
                    status: 400,
                    message: "rejected".into()
                })
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_different_requests_do_not_coalesce() {
        let (dispatcher, gate, calls) = gated_dispatcher(false).await;
        gate.add_permits(2);

        let first = Arc::clone(&dispatcher);
        let a = tokio::spawn(async move { first.dispatch(request()).await });
        let second = Arc::clone(&dispatcher);
        let b = tokio::spawn(async move {
            second
                .dispatch(request().with_parameter("temperature", 1.0))
                .await
        });

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        dispatcher.shutdown().await;
    }
}
