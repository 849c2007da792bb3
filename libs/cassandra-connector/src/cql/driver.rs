//! Seams between the connector and a wire-protocol client
//!
//! A [`Driver`] builds cluster handles, a [`ClusterHandle`] reports topology
//! and opens sessions, a [`SessionHandle`] prepares and executes statements.
//! The connector never talks to the network itself.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use super::config::{ConnectionConfig, Credentials};
use crate::common::ConnectorResult;
use crate::types::ProtocolVersion;
use crate::writer::Statement;

/// A node as seen in the cluster topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub address: IpAddr,
    /// Unknown for nodes whose metadata has not been fetched yet
    pub datacenter: Option<String>,
    pub is_up: bool,
}

impl Host {
    pub fn up(address: IpAddr, datacenter: Option<&str>) -> Self {
        Self {
            address,
            datacenter: datacenter.map(str::to_string),
            is_up: true,
        }
    }

    pub fn down(address: IpAddr, datacenter: Option<&str>) -> Self {
        Self {
            is_up: false,
            ..Self::up(address, datacenter)
        }
    }
}

/// Load balancing preference handed to the driver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadBalancing {
    /// Route to this datacenter first; `None` infers it from the contact
    /// points once the topology is known
    pub local_datacenter: Option<String>,
}

/// Everything a driver needs to build a cluster handle
///
/// Connecting is a single attempt bounded by `connect_timeout`; retries and
/// reconnection are left to the driver's own policies.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub contact_points: Vec<SocketAddr>,
    pub credentials: Option<Credentials>,
    /// Retries of a failed statement
    pub query_retry_count: u32,
    /// First and longest delay between reconnection attempts to a node
    pub reconnection_delay: (Duration, Duration),
    pub load_balancing: LoadBalancing,
    pub connect_timeout: Duration,
}

impl From<&ConnectionConfig> for ClusterSettings {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            contact_points: config.contact_points(),
            credentials: config.credentials.clone(),
            query_retry_count: config.query_retry_count,
            reconnection_delay: config.reconnection_delay(),
            load_balancing: LoadBalancing {
                local_datacenter: config.local_datacenter.clone(),
            },
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// Builds cluster handles from connection settings
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Cluster: ClusterHandle;

    /// Establish a cluster handle; fails when no contact point is reachable
    async fn connect(&self, settings: &ClusterSettings) -> ConnectorResult<Self::Cluster>;
}

/// A connected cluster, shared between writers through the cluster cache
#[async_trait]
pub trait ClusterHandle: Send + Sync + 'static {
    type Session: SessionHandle;

    /// Current view of the cluster nodes
    fn topology(&self) -> Vec<Host>;

    async fn open_session(&self) -> ConnectorResult<Self::Session>;

    /// Release every connection held by the handle
    fn close(&self);
}

/// A session scoped to one unit of work
#[async_trait]
pub trait SessionHandle: Send + Sync + 'static {
    type Prepared: Clone + Send + Sync + 'static;

    async fn prepare(&self, cql: &str) -> ConnectorResult<Self::Prepared>;

    fn protocol_version(&self) -> ProtocolVersion;

    /// Execute a single bound statement or an unlogged batch
    async fn execute(&self, statement: Statement<Self::Prepared>) -> ConnectorResult<()>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_settings_from_config() {
        let config = ConnectionConfig::new(["10.0.0.1".parse().unwrap()])
            .with_native_port(19042)
            .with_datacenter("dc1")
            .with_query_retry_count(4);

        let settings = ClusterSettings::from(&config);
        assert_eq!(settings.contact_points, vec!["10.0.0.1:19042".parse().unwrap()]);
        assert_eq!(settings.load_balancing.local_datacenter.as_deref(), Some("dc1"));
        assert_eq!(settings.query_retry_count, 4);
        assert_eq!(settings.connect_timeout, Duration::from_secs(5));
    }
}
