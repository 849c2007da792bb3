//! Bulk writer for Cassandra/ScyllaDB
//!
//! Writes large record streams into a table with bounded parallelism while
//! sharing one cluster connection between every writer that points at the
//! same cluster.
//!
//! # Features
//!
//! - `config` (default) - `core_config::FromEnv` for [`cql::ConnectionConfig`] and [`writer::WriteConf`]
//! - `scylla` - driver adapter for the `scylla` crate, compatible with Apache Cassandra and ScyllaDB
//!
//! # Example
//!
//! ```ignore
//! use cassandra_connector::cql::{ConnectionConfig, ConnectionManager, scylla::shared_cluster_cache};
//! use cassandra_connector::types::{ColumnValue, CqlType};
//! use cassandra_connector::writer::{ColumnDef, FnRowWriter, TableDef, TableWriter, WriteConf};
//! use std::sync::Arc;
//!
//! let manager = Arc::new(ConnectionManager::new(ConnectionConfig::from_env()?, shared_cluster_cache()));
//! let table = TableDef::new(
//!     "shop",
//!     "orders",
//!     vec![
//!         ColumnDef::partition_key("id", CqlType::Uuid),
//!         ColumnDef::regular("total", CqlType::Double),
//!     ],
//! );
//! let rows = FnRowWriter::new(["id", "total"], |order: &Order, out: &mut [Option<ColumnValue>]| {
//!     out[0] = Some(order.id.into());
//!     out[1] = Some(order.total.into());
//! });
//!
//! let writer = TableWriter::new(manager, table, rows, WriteConf::from_env()?)?;
//! let stats = writer.write(orders).await?;
//! ```

pub mod cache;
pub mod common;
pub mod cql;
pub mod types;
pub mod writer;

pub use cache::RefCountedCache;
pub use common::{ConnectorError, ConnectorResult};
pub use cql::{ConnectionConfig, ConnectionManager};
pub use writer::{TableWriter, WriteConf, WriteStats};
