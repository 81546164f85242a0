//! Outbound RPC client: per-address pools of gRPC channels.
//!
//! A pool is created lazily on the first call for an address and lives for
//! the rest of the process. Creation is serialized per address: concurrent
//! callers for the same unseen address wait on a single dial instead of
//! racing. A failed dial is not cached, so the next call retries.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OnceCell;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult};

/// Boxed future returned by [`Dialer::dial`].
pub type DialFuture<'a> = Pin<Box<dyn Future<Output = ClusterResult<Channel>> + Send + 'a>>;

/// Opens one channel to a peer.
pub trait Dialer: Send + Sync {
    fn dial<'a>(&'a self, addr: &'a str) -> DialFuture<'a>;
}

/// Dials peers over plaintext HTTP/2.
#[derive(Debug, Clone)]
pub struct GrpcDialer {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl GrpcDialer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            connect_timeout: timeout,
            request_timeout: timeout,
        }
    }
}

impl Default for GrpcDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Dialer for GrpcDialer {
    fn dial<'a>(&'a self, addr: &'a str) -> DialFuture<'a> {
        Box::pin(async move {
            let endpoint = format!("http://{addr}");
            let ep = Endpoint::from_shared(endpoint.clone())
                .map_err(|e| ClusterError::Transport(format!("invalid endpoint {endpoint}: {e}")))?
                .connect_timeout(self.connect_timeout)
                .timeout(self.request_timeout);

            ep.connect().await.map_err(|e| {
                warn!(%addr, error = %e, "failed to connect");
                ClusterError::Transport(format!("connect to {endpoint}: {e}"))
            })
        })
    }
}

/// Fixed set of open channels to one peer.
#[derive(Debug)]
pub struct ConnArray {
    addr: String,
    conns: Vec<Channel>,
    next: AtomicUsize,
}

impl ConnArray {
    /// Next channel, round-robin.
    pub fn get(&self) -> Channel {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        self.conns[idx].clone()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

type PoolSlot = Arc<OnceCell<Arc<ConnArray>>>;

/// Client for inter-node calls, shared by everything that reaches a peer.
pub struct RpcClient {
    dialer: Arc<dyn Dialer>,
    pool_size: usize,
    pools: Mutex<HashMap<String, PoolSlot>>,
}

impl RpcClient {
    pub fn new(dialer: Arc<dyn Dialer>, pool_size: usize) -> Self {
        Self {
            dialer,
            pool_size: pool_size.max(1),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Pool for `addr`, dialing it on first use.
    pub async fn get_conn_array(&self, addr: &str) -> ClusterResult<Arc<ConnArray>> {
        let slot = {
            let mut pools = self.pools.lock().expect("pools lock");
            Arc::clone(pools.entry(addr.to_string()).or_default())
        };

        if let Some(array) = slot.get() {
            debug!(%addr, "connection pool reused");
            return Ok(Arc::clone(array));
        }

        let array = slot
            .get_or_try_init(|| async {
                let mut conns = Vec::with_capacity(self.pool_size);
                for _ in 0..self.pool_size {
                    conns.push(self.dialer.dial(addr).await?);
                }
                info!(%addr, size = conns.len(), "connection pool created");
                Ok::<_, ClusterError>(Arc::new(ConnArray {
                    addr: addr.to_string(),
                    conns,
                    next: AtomicUsize::new(0),
                }))
            })
            .await?;

        Ok(Arc::clone(array))
    }

    /// Number of addresses with a live pool.
    pub fn pool_count(&self) -> usize {
        let pools = self.pools.lock().expect("pools lock");
        pools.values().filter(|slot| slot.initialized()).count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    /// Counts dials and hands out lazy channels that never touch the network.
    struct CountingDialer {
        dials: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl CountingDialer {
        fn new(fail: bool) -> Self {
            Self {
                dials: AtomicUsize::new(0),
                fail,
                delay: Duration::from_millis(20),
            }
        }
    }

    impl Dialer for CountingDialer {
        fn dial<'a>(&'a self, addr: &'a str) -> DialFuture<'a> {
            Box::pin(async move {
                self.dials.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                if self.fail {
                    return Err(ClusterError::Transport(format!("refused {addr}")));
                }
                Ok(Endpoint::from_shared(format!("http://{addr}"))
                    .unwrap()
                    .connect_lazy())
            })
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_pool() {
        let dialer = Arc::new(CountingDialer::new(false));
        let client = Arc::new(RpcClient::new(dialer.clone(), 3));

        let a = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.get_conn_array("127.0.0.1:7001").await })
        };
        let b = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.get_conn_array("127.0.0.1:7001").await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 3);
        assert_eq!(client.pool_count(), 1);
    }

    #[tokio::test]
    async fn existing_pool_is_returned_without_dialing() {
        let dialer = Arc::new(CountingDialer::new(false));
        let client = RpcClient::new(dialer.clone(), 2);

        let first = client.get_conn_array("127.0.0.1:7001").await.unwrap();
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);

        let again = client.get_conn_array("127.0.0.1:7001").await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn separate_addresses_get_separate_pools() {
        let dialer = Arc::new(CountingDialer::new(false));
        let client = RpcClient::new(dialer.clone(), 1);

        let a = client.get_conn_array("127.0.0.1:7001").await.unwrap();
        let b = client.get_conn_array("127.0.0.1:7002").await.unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(b.addr(), "127.0.0.1:7002");
        assert_eq!(client.pool_count(), 2);
    }

    #[tokio::test]
    async fn dial_failure_is_not_cached() {
        let dialer = Arc::new(CountingDialer::new(true));
        let client = RpcClient::new(dialer.clone(), 2);

        let err = client.get_conn_array("127.0.0.1:7001").await.unwrap_err();
        assert!(matches!(err, ClusterError::Transport(_)));

        let _ = client.get_conn_array("127.0.0.1:7001").await;
        // The first dial of each attempt fails, so each attempt dials once.
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert_eq!(client.pool_count(), 0);
    }

    #[tokio::test]
    async fn get_rotates_over_pool() {
        let dialer = Arc::new(CountingDialer::new(false));
        let client = RpcClient::new(dialer, 2);

        let array = client.get_conn_array("127.0.0.1:7001").await.unwrap();
        assert_eq!(array.len(), 2);

        array.get();
        array.get();
        array.get();
        assert_eq!(array.next.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn real_dial_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = RpcClient::new(Arc::new(GrpcDialer::new(Duration::from_millis(500))), 1);
        let err = client.get_conn_array(&addr).await.unwrap_err();
        assert!(matches!(err, ClusterError::Transport(_)));
    }
}
