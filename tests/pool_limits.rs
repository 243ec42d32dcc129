// Pool caps must hold under concurrent acquisition
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
        ConnectionPool, GatewayResult, config::PoolConfig, core::PooledClient, ports::Connector,
    };

    #[derive(Default)]
    struct SlowConnector {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl Connector for SlowConnector {
        type Handle = usize;

        async fn connect(&self, _destination: &str, _config: &PoolConfig) -> GatewayResult<usize> {
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }

        async fn close(&self, _destination: &str, _handle: Arc<usize>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> PoolConfig {
        PoolConfig {
            max_connections_per_destination: 3,
            max_total_connections: 5,
            ..PoolConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_caps_hold_under_concurrency() {
        let connector = Arc::new(SlowConnector::default());
        let pool = Arc::new(ConnectionPool::new(Arc::clone(&connector)));
        pool.initialize(config());

        let mut handles = Vec::new();
        for i in 0..40 {
            let pool = Arc::clone(&pool);
            let destination = if i % 2 == 0 { "http://a" } else { "http://b" };
            handles.push(tokio::spawn(async move {
                pool.get_client(destination).await
            }));
        }

        let mut clients: Vec<PooledClient<usize>> = Vec::new();
        for handle in handles {
            clients.push(handle.await.unwrap().unwrap());
        }

        let pooled = clients.iter().filter(|c| c.is_pooled()).count();
        let stats = pool.stats().await;
        assert!(pooled <= 5);
        assert_eq!(stats.total_connections, pooled);
        for destination in &stats.destinations {
            assert!(destination.tracked() <= 3, "{destination:?}");
        }
        assert_eq!(stats.overflow_created as usize, 40 - pooled);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 40);

        for client in clients {
            pool.release_client(client).await.unwrap();
        }

        let stats = pool.stats().await;
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, pooled);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 40 - pooled);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_three_calls_with_cap_two() {
        let connector = Arc::new(SlowConnector::default());
        let pool = Arc::new(ConnectionPool::new(Arc::clone(&connector)));
        pool.initialize(PoolConfig {
            max_connections_per_destination: 2,
            ..PoolConfig::default()
        });

        let (a, b, c) = tokio::join!(
            pool.get_client("X"),
            pool.get_client("X"),
            pool.get_client("X")
        );
        let clients = [a.unwrap(), b.unwrap(), c.unwrap()];

        assert_eq!(clients.iter().filter(|c| c.is_pooled()).count(), 2);
        let stats = pool.stats().await;
        let x = stats.destination("X").unwrap();
        assert_eq!(x.tracked(), 2);
        assert_eq!(x.cache_misses, 3);
        assert_eq!(x.overflow_created, 1);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_released_connections_are_reused() {
        let connector = Arc::new(SlowConnector::default());
        let pool = Arc::new(ConnectionPool::new(Arc::clone(&connector)));
        pool.initialize(config());

        for _ in 0..10 {
            let client = pool.get_client("http://a").await.unwrap();
            pool.release_client(client).await.unwrap();
        }

        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        let stats = pool.stats().await;
        let a = stats.destination("http://a").unwrap();
        assert_eq!(a.cache_hits, 9);
        assert!((a.hit_rate - 0.9).abs() < 1e-9);
        pool.shutdown().await;
    }
}
