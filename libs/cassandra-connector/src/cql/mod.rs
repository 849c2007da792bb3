//! Cluster connections
//!
//! A [`ConnectionManager`] resolves a [`ConnectionConfig`] to a cluster handle
//! shared through a [`RefCountedCache`](crate::cache::RefCountedCache) and
//! opens a session per unit of work. The driver sits behind the [`Driver`],
//! [`ClusterHandle`] and [`SessionHandle`] traits; `mock` provides an
//! in-memory implementation, `scylla` the real one.
//!
//! # Example
//!
//! ```ignore
//! use cassandra_connector::cql::{ConnectionConfig, ConnectionManager};
//! use cassandra_connector::cql::scylla::shared_cluster_cache;
//!
//! let config = ConnectionConfig::new(["10.0.0.1".parse()?]).with_datacenter("dc1");
//! let manager = ConnectionManager::new(config, shared_cluster_cache());
//!
//! manager
//!     .with_session(|session| async move { session.prepare("SELECT now() FROM system.local").await })
//!     .await?;
//! ```

pub mod config;
mod connector;
mod driver;
pub mod mock;
#[cfg(feature = "scylla")]
pub mod scylla;
pub mod topology;

pub use config::{ConnectionConfig, Credentials};
pub use connector::{ClusterCache, ConnectionManager, DriverSession, cluster_cache};
pub use driver::{ClusterHandle, ClusterSettings, Driver, Host, LoadBalancing, SessionHandle};
