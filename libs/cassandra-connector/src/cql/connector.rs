use futures::FutureExt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::config::ConnectionConfig;
use super::driver::{ClusterHandle, ClusterSettings, Driver, Host, SessionHandle};
use super::topology::{alternative_configs, closest_live_host, dc_local_hosts};
use crate::cache::RefCountedCache;
use crate::common::ConnectorResult;

/// Session type produced by a driver's clusters
pub type DriverSession<D> = <<D as Driver>::Cluster as ClusterHandle>::Session;

/// Cluster handles of one driver, keyed by connection config
///
/// Built with [`cluster_cache`] and shared by every [`ConnectionManager`]
/// that should reuse the same clusters.
pub struct ClusterCache<D: Driver> {
    clusters: Arc<RefCountedCache<ConnectionConfig, D::Cluster>>,
}

impl<D: Driver> ClusterCache<D> {
    /// Cluster for `config`, connecting on a miss
    pub async fn acquire(&self, config: &ConnectionConfig) -> ConnectorResult<Arc<D::Cluster>> {
        self.clusters.acquire(config).await
    }

    /// Give a cluster back; it is closed once unused for `keep_alive`
    pub fn release(&self, cluster: &Arc<D::Cluster>, keep_alive: Duration) {
        self.clusters.release_with_delay(cluster, keep_alive);
    }

    /// Close unused clusters whose keep-alive has elapsed
    pub fn evict_idle(&self) -> usize {
        self.clusters.evict_idle()
    }

    /// Close every cluster, in use or not
    pub fn shutdown(&self) {
        self.clusters.shutdown();
    }

    pub fn contains(&self, config: &ConnectionConfig) -> bool {
        self.clusters.contains(config)
    }

    pub fn ref_count(&self, config: &ConnectionConfig) -> Option<usize> {
        self.clusters.ref_count(config)
    }

    /// Number of open clusters
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

/// Build the cluster cache for a driver
///
/// Misses connect through the driver in a single attempt, destroyed entries
/// close their cluster, and every new cluster is also reachable under configs
/// narrowed to its datacenter-local hosts.
///
/// # Example
///
/// ```ignore
/// use cassandra_connector::cql::{ConnectionManager, cluster_cache};
///
/// let cache = cluster_cache(MyDriver::default());
/// let a = ConnectionManager::new(config.clone(), cache.clone());
/// let b = ConnectionManager::new(config, cache);
/// // a and b share one cluster handle, each opens its own sessions
/// ```
pub fn cluster_cache<D: Driver>(driver: D) -> Arc<ClusterCache<D>> {
    let driver = Arc::new(driver);

    let clusters = RefCountedCache::new(move |config: ConnectionConfig| {
        let driver = Arc::clone(&driver);
        async move {
            let settings = ClusterSettings::from(&config);
            info!(hosts = ?config.hosts, port = config.native_port, "Connecting to Cassandra cluster");

            let cluster = driver.connect(&settings).await.inspect_err(|e| {
                warn!(hosts = ?config.hosts, error = %e, "Failed to connect to Cassandra cluster");
            })?;

            info!(
                hosts = ?config.hosts,
                nodes = cluster.topology().len(),
                "Connected to Cassandra cluster"
            );
            Ok(Arc::new(cluster))
        }
        .boxed()
    })
    .with_destroy(|cluster: Arc<D::Cluster>| {
        info!("Closing Cassandra cluster connection");
        cluster.close();
    })
    .with_alternative_keys(|config: &ConnectionConfig, cluster: &D::Cluster| {
        alternative_configs(config, &cluster.topology())
    });

    Arc::new(ClusterCache {
        clusters: Arc::new(clusters),
    })
}

/// Scoped access to the shared cluster for one connection config
///
/// Holds the config, which gets narrowed to the datacenter-local hosts after
/// the first successful connection. Clusters come from a shared
/// [`ClusterCache`] and are released (after the config's keep-alive) when a
/// scope ends, including on error or panic.
pub struct ConnectionManager<D: Driver> {
    config: RwLock<ConnectionConfig>,
    cache: Arc<ClusterCache<D>>,
}

impl<D: Driver> ConnectionManager<D> {
    pub fn new(config: ConnectionConfig, cache: Arc<ClusterCache<D>>) -> Self {
        Self {
            config: RwLock::new(config),
            cache,
        }
    }

    /// Current config, possibly narrowed
    pub fn config(&self) -> ConnectionConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run `f` with the shared cluster handle
    pub async fn with_cluster<F, Fut, R>(&self, f: F) -> ConnectorResult<R>
    where
        F: FnOnce(Arc<D::Cluster>) -> Fut,
        Fut: Future<Output = ConnectorResult<R>>,
    {
        let config = self.config();
        let cluster = self.cache.acquire(&config).await?;
        let lease = ClusterLease::<D> {
            cache: Arc::clone(&self.cache),
            cluster,
            keep_alive: config.keep_alive(),
        };

        self.narrow_hosts(&config, &lease.cluster.topology());

        f(Arc::clone(&lease.cluster)).await
    }

    /// Run `f` with a fresh session on the shared cluster
    ///
    /// The session is closed once `f` completes. If `f` panics the close runs
    /// on a background task.
    pub async fn with_session<F, Fut, R>(&self, f: F) -> ConnectorResult<R>
    where
        F: FnOnce(Arc<DriverSession<D>>) -> Fut,
        Fut: Future<Output = ConnectorResult<R>>,
    {
        self.with_cluster(|cluster| async move {
            let session = Arc::new(cluster.open_session().await?);
            let mut guard = SessionGuard {
                session: Some(Arc::clone(&session)),
            };

            let result = f(session).await;

            if let Some(session) = guard.session.take() {
                session.close().await;
            }
            result
        })
        .await
    }

    /// A live host, preferring the local datacenter
    pub async fn closest_live_host(&self) -> ConnectorResult<IpAddr> {
        self.with_cluster(|cluster| async move {
            let config = self.config();
            closest_live_host(
                &config.hosts,
                config.local_datacenter.as_deref(),
                &cluster.topology(),
            )
        })
        .await
    }

    fn narrow_hosts(&self, used: &ConnectionConfig, topology: &[Host]) {
        let local = dc_local_hosts(&used.hosts, topology);
        if local.is_empty() || local == used.hosts {
            return;
        }

        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        if config.hosts == used.hosts {
            debug!(from = ?used.hosts, to = ?local, "Narrowed hosts to local datacenter");
            *config = used.with_hosts(local);
        }
    }
}

struct ClusterLease<D: Driver> {
    cache: Arc<ClusterCache<D>>,
    cluster: Arc<D::Cluster>,
    keep_alive: Duration,
}

impl<D: Driver> Drop for ClusterLease<D> {
    fn drop(&mut self) {
        self.cache.release(&self.cluster, self.keep_alive);
    }
}

struct SessionGuard<S: SessionHandle> {
    session: Option<Arc<S>>,
}

impl<S: SessionHandle> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { session.close().await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ConnectorError;
    use crate::cql::mock::MockDriver;
    use std::collections::BTreeSet;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn topology() -> Vec<Host> {
        vec![
            Host::up(ip("10.0.0.1"), Some("dc1")),
            Host::up(ip("10.0.0.2"), Some("dc1")),
            Host::up(ip("10.0.1.1"), Some("dc2")),
        ]
    }

    fn config(hosts: &[&str]) -> ConnectionConfig {
        ConnectionConfig::new(hosts.iter().map(|h| ip(h))).with_keep_alive(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_with_cluster_narrows_hosts_to_local_dc() {
        let driver = MockDriver::new(topology());
        let cache = cluster_cache(driver.clone());
        let manager = ConnectionManager::new(config(&["10.0.0.1"]), cache);

        manager.with_cluster(|_| async { Ok(()) }).await.unwrap();

        let expected: BTreeSet<IpAddr> = [ip("10.0.0.1"), ip("10.0.0.2")].into();
        assert_eq!(manager.config().hosts, expected);
        assert_eq!(driver.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_cluster_released_on_error() {
        let driver = MockDriver::new(topology());
        let cache = cluster_cache(driver.clone());
        let manager = ConnectionManager::new(config(&["10.0.0.1"]), cache.clone());

        let result: ConnectorResult<()> = manager
            .with_cluster(|_| async { Err(ConnectorError::Execution("boom".into())) })
            .await;

        assert!(result.is_err());
        assert!(cache.is_empty());
        assert_eq!(driver.close_count(), 1);
    }

    #[tokio::test]
    async fn test_equivalent_configs_share_cluster() {
        let driver = MockDriver::new(topology());
        let cache = cluster_cache(driver.clone());
        let keep_alive = Duration::from_secs(60);
        let a = ConnectionManager::new(config(&["10.0.0.1"]).with_keep_alive(keep_alive), cache.clone());
        let b = ConnectionManager::new(config(&["10.0.0.2"]).with_keep_alive(keep_alive), cache);

        let first = a.with_cluster(|cluster| async move { Ok(cluster) }).await.unwrap();
        let second = b.with_cluster(|cluster| async move { Ok(cluster) }).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(driver.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_propagates_without_retrying() {
        let driver = MockDriver::new(topology()).failing_connect();
        let cache = cluster_cache(driver.clone());
        let manager = ConnectionManager::new(ConnectionConfig::new([ip("10.0.0.1")]), cache.clone());

        let started = std::time::Instant::now();
        let result = manager.with_cluster(|_| async { Ok(()) }).await;

        assert!(matches!(result, Err(ConnectorError::ConnectionFailed(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(driver.connect_attempts(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_with_session_closes_session() {
        let driver = MockDriver::new(topology());
        let manager = ConnectionManager::new(config(&["10.0.0.1"]), cluster_cache(driver.clone()));

        let sessions = manager
            .with_session(|session| async move { Ok(Arc::strong_count(&session)) })
            .await
            .unwrap();

        assert!(sessions >= 1);
        assert_eq!(driver.sessions_opened(), 1);
        assert_eq!(driver.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn test_closest_live_host() {
        let driver = MockDriver::new(topology());
        let manager = ConnectionManager::new(config(&["10.0.1.1"]), cluster_cache(driver));
        assert_eq!(manager.closest_live_host().await.unwrap(), ip("10.0.1.1"));
    }
}
