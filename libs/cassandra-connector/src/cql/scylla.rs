//! Driver adapter for the `scylla` crate
//!
//! One scylla `Session` (a pooled connection to the whole cluster) backs one
//! cluster handle; sessions opened from it share that pool. Requests are
//! routed token-aware with the local datacenter preferred. Without a
//! configured datacenter the one holding most contact points is preferred once
//! the session has fetched the topology. Failed statements are retried at most
//! `query_retry_count` times.

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use scylla::client::execution_profile::{ExecutionProfile, ExecutionProfileHandle};
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::policies::load_balancing::DefaultPolicy;
use scylla::policies::retry::{DefaultRetryPolicy, RequestInfo, RetryDecision, RetryPolicy, RetrySession};
use scylla::statement::Consistency as ScyllaConsistency;
use scylla::statement::batch::{Batch as ScyllaBatch, BatchType};
use scylla::statement::prepared::PreparedStatement;
use scylla::value::{Counter, CqlTimestamp, CqlTimeuuid, CqlValue};
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use super::connector::{ClusterCache, cluster_cache};
use super::driver::{ClusterHandle, ClusterSettings, Driver, Host, SessionHandle};
use super::topology;
use crate::common::{ConnectorError, ConnectorResult};
use crate::types::{ColumnValue, CqlType, ProtocolVersion};
use crate::writer::{BoundStatement, Consistency, Statement};

static SHARED_CLUSTER_CACHE: OnceCell<Arc<ClusterCache<ScyllaDriver>>> = OnceCell::new();

/// Process-wide cluster cache for the scylla driver
///
/// Every [`ConnectionManager`](super::ConnectionManager) built on this cache
/// shares clusters with every other one in the process.
pub fn shared_cluster_cache() -> Arc<ClusterCache<ScyllaDriver>> {
    Arc::clone(SHARED_CLUSTER_CACHE.get_or_init(|| {
        info!("Initializing shared Cassandra cluster cache");
        cluster_cache(ScyllaDriver)
    }))
}

/// Close every cached cluster, in use or not
///
/// Call at process teardown.
pub fn shutdown_shared_cluster_cache() {
    if let Some(cache) = SHARED_CLUSTER_CACHE.get() {
        cache.shutdown();
    }
}

/// [`Driver`] backed by the scylla rust driver
#[derive(Debug, Clone, Copy, Default)]
pub struct ScyllaDriver;

#[async_trait]
impl Driver for ScyllaDriver {
    type Cluster = ScyllaCluster;

    async fn connect(&self, settings: &ClusterSettings) -> ConnectorResult<ScyllaCluster> {
        let retry_policy: Arc<dyn RetryPolicy> = Arc::new(BoundedRetryPolicy::new(settings.query_retry_count));
        let configured_dc = settings.load_balancing.local_datacenter.clone();
        let mut profile_handle = execution_profile(configured_dc.clone(), &retry_policy).into_handle();

        let mut builder = SessionBuilder::new()
            .known_nodes_addr(&settings.contact_points)
            .connection_timeout(settings.connect_timeout)
            .default_execution_profile_handle(profile_handle.clone());

        if let Some(credentials) = &settings.credentials {
            builder = builder.user(&credentials.username, &credentials.password);
        }

        let session = builder.build().await?;
        info!(contact_points = ?settings.contact_points, "Scylla session established");

        if configured_dc.is_none() {
            prefer_inferred_datacenter(&session, &settings.contact_points, &retry_policy, &mut profile_handle);
        }

        Ok(ScyllaCluster {
            session: Mutex::new(Some(Arc::new(session))),
        })
    }
}

fn execution_profile(local_datacenter: Option<String>, retry_policy: &Arc<dyn RetryPolicy>) -> ExecutionProfile {
    let mut policy = DefaultPolicy::builder().token_aware(true);
    if let Some(dc) = local_datacenter {
        policy = policy.prefer_datacenter(dc);
    }

    ExecutionProfile::builder()
        .load_balancing_policy(policy.build())
        .retry_policy(Arc::clone(retry_policy))
        .build()
}

/// Remap the session's default profile to prefer the contact points' datacenter
fn prefer_inferred_datacenter(
    session: &Session,
    contact_points: &[SocketAddr],
    retry_policy: &Arc<dyn RetryPolicy>,
    profile_handle: &mut ExecutionProfileHandle,
) {
    let contact_hosts: BTreeSet<IpAddr> = contact_points.iter().map(|addr| addr.ip()).collect();
    let Some(dc) = topology::infer_local_datacenter(&contact_hosts, &hosts(session)) else {
        debug!("No datacenter inferred from contact points; routing is not datacenter-aware");
        return;
    };

    info!(datacenter = %dc, "Preferring datacenter of the contact points");
    profile_handle.map_to_another_profile(execution_profile(Some(dc), retry_policy));
}

fn hosts(session: &Session) -> Vec<Host> {
    session
        .get_cluster_state()
        .get_nodes_info()
        .iter()
        .map(|node| Host {
            address: node.address.ip(),
            datacenter: node.datacenter.clone(),
            is_up: !node.is_down(),
        })
        .collect()
}

/// Driver default retry decisions, capped at a fixed number of retries per statement
#[derive(Debug)]
struct BoundedRetryPolicy {
    inner: DefaultRetryPolicy,
    max_retries: u32,
}

impl BoundedRetryPolicy {
    fn new(max_retries: u32) -> Self {
        Self {
            inner: DefaultRetryPolicy::new(),
            max_retries,
        }
    }
}

impl RetryPolicy for BoundedRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(BoundedRetrySession {
            inner: self.inner.new_session(),
            retries: 0,
            max_retries: self.max_retries,
        })
    }
}

struct BoundedRetrySession {
    inner: Box<dyn RetrySession>,
    retries: u32,
    max_retries: u32,
}

impl RetrySession for BoundedRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
        let decision = self.inner.decide_should_retry(request_info);
        cap_retries(decision, &mut self.retries, self.max_retries)
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.retries = 0;
    }
}

fn cap_retries(decision: RetryDecision, retries: &mut u32, max_retries: u32) -> RetryDecision {
    match decision {
        RetryDecision::RetrySameTarget(_) | RetryDecision::RetryNextTarget(_) if *retries >= max_retries => {
            RetryDecision::DontRetry
        }
        RetryDecision::RetrySameTarget(_) | RetryDecision::RetryNextTarget(_) => {
            *retries += 1;
            decision
        }
        other => other,
    }
}

/// Cluster handle wrapping one scylla `Session`
pub struct ScyllaCluster {
    session: Mutex<Option<Arc<Session>>>,
}

impl ScyllaCluster {
    fn session(&self) -> Option<Arc<Session>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ClusterHandle for ScyllaCluster {
    type Session = ScyllaSession;

    fn topology(&self) -> Vec<Host> {
        self.session().map(|session| hosts(&session)).unwrap_or_default()
    }

    async fn open_session(&self) -> ConnectorResult<ScyllaSession> {
        let session = self
            .session()
            .ok_or_else(|| ConnectorError::Session("cluster connection is closed".to_string()))?;
        Ok(ScyllaSession { session })
    }

    fn close(&self) {
        // connections close once the last session referencing the pool is dropped
        if self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!("Scylla cluster handle closed");
        }
    }
}

/// Session sharing its cluster's connection pool
pub struct ScyllaSession {
    session: Arc<Session>,
}

#[async_trait]
impl SessionHandle for ScyllaSession {
    type Prepared = PreparedStatement;

    async fn prepare(&self, cql: &str) -> ConnectorResult<PreparedStatement> {
        Ok(self.session.prepare(cql).await?)
    }

    fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::V4
    }

    async fn execute(&self, statement: Statement<PreparedStatement>) -> ConnectorResult<()> {
        match statement {
            Statement::Bound(bound) => {
                let mut prepared = bound.prepared().clone();
                prepared.set_is_idempotent(true);
                prepared.set_consistency(to_scylla_consistency(bound.consistency()));
                self.session
                    .execute_unpaged(&prepared, to_cql_values(&bound)?)
                    .await?;
            }
            Statement::Batch(batch) => {
                let mut scylla_batch = ScyllaBatch::new(BatchType::Unlogged);
                scylla_batch.set_consistency(to_scylla_consistency(batch.consistency()));
                scylla_batch.set_is_idempotent(true);

                let mut values = Vec::with_capacity(batch.statements().len());
                for bound in batch.statements() {
                    scylla_batch.append_statement(bound.prepared().clone());
                    values.push(to_cql_values(bound)?);
                }
                self.session.batch(&scylla_batch, values).await?;
            }
        }
        Ok(())
    }

    async fn close(&self) {}
}

fn to_scylla_consistency(consistency: Consistency) -> ScyllaConsistency {
    match consistency {
        Consistency::Any => ScyllaConsistency::Any,
        Consistency::One => ScyllaConsistency::One,
        Consistency::Two => ScyllaConsistency::Two,
        Consistency::Three => ScyllaConsistency::Three,
        Consistency::Quorum => ScyllaConsistency::Quorum,
        Consistency::All => ScyllaConsistency::All,
        Consistency::LocalQuorum => ScyllaConsistency::LocalQuorum,
        Consistency::EachQuorum => ScyllaConsistency::EachQuorum,
        Consistency::LocalOne => ScyllaConsistency::LocalOne,
    }
}

fn to_cql_values(bound: &BoundStatement<PreparedStatement>) -> ConnectorResult<Vec<Option<CqlValue>>> {
    bound
        .values()
        .iter()
        .zip(bound.column_types())
        .map(|(value, cql_type)| value.as_ref().map(|v| to_cql_value(v, cql_type)).transpose())
        .collect()
}

fn to_cql_value(value: &ColumnValue, cql_type: &CqlType) -> ConnectorResult<CqlValue> {
    use ColumnValue as V;

    let cql = match (cql_type, value) {
        (CqlType::Ascii, V::Text(s)) => CqlValue::Ascii(s.clone()),
        (CqlType::Text | CqlType::Varchar, V::Text(s)) => CqlValue::Text(s.clone()),
        (CqlType::Int, V::Int(n)) => CqlValue::Int(*n),
        (CqlType::BigInt, V::BigInt(n)) => CqlValue::BigInt(*n),
        (CqlType::Counter, V::BigInt(n)) => CqlValue::Counter(Counter(*n)),
        (CqlType::SmallInt, V::SmallInt(n)) => CqlValue::SmallInt(*n),
        (CqlType::TinyInt, V::TinyInt(n)) => CqlValue::TinyInt(*n),
        (CqlType::Boolean, V::Boolean(b)) => CqlValue::Boolean(*b),
        (CqlType::Float, V::Float(x)) => CqlValue::Float(*x),
        (CqlType::Double, V::Double(x)) => CqlValue::Double(*x),
        (CqlType::Timestamp, V::Timestamp(t)) => {
            CqlValue::Timestamp(CqlTimestamp(t.timestamp_millis()))
        }
        (CqlType::Uuid, V::Uuid(u)) => CqlValue::Uuid(*u),
        (CqlType::TimeUuid, V::Uuid(u)) => CqlValue::Timeuuid(CqlTimeuuid::from(*u)),
        (CqlType::Blob, V::Blob(bytes)) => CqlValue::Blob(bytes.clone()),
        (CqlType::Inet, V::Inet(ip)) => CqlValue::Inet(*ip),
        (CqlType::List(element), V::List(items)) => CqlValue::List(
            items
                .iter()
                .map(|item| to_cql_value(item, element))
                .collect::<ConnectorResult<_>>()?,
        ),
        (CqlType::Set(element), V::List(items)) => CqlValue::Set(
            items
                .iter()
                .map(|item| to_cql_value(item, element))
                .collect::<ConnectorResult<_>>()?,
        ),
        (CqlType::Map(key_type, value_type), V::Map(pairs)) => CqlValue::Map(
            pairs
                .iter()
                .map(|(k, v)| Ok((to_cql_value(k, key_type)?, to_cql_value(v, value_type)?)))
                .collect::<ConnectorResult<_>>()?,
        ),
        _ => {
            return Err(ConnectorError::Internal(format!(
                "{} value bound to {cql_type} column",
                value.kind()
            )));
        }
    };

    Ok(cql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::{ConnectionConfig, ConnectionManager};

    #[test]
    fn test_collection_values_follow_column_type() {
        let items = ColumnValue::List(vec![ColumnValue::Int(1), ColumnValue::Int(2)]);

        let list = to_cql_value(&items, &CqlType::list(CqlType::Int)).unwrap();
        assert_eq!(list, CqlValue::List(vec![CqlValue::Int(1), CqlValue::Int(2)]));

        let set = to_cql_value(&items, &CqlType::set(CqlType::Int)).unwrap();
        assert_eq!(set, CqlValue::Set(vec![CqlValue::Int(1), CqlValue::Int(2)]));

        assert!(to_cql_value(&items, &CqlType::Int).is_err());
    }

    #[test]
    fn test_consistency_mapping() {
        assert_eq!(to_scylla_consistency(Consistency::LocalOne), ScyllaConsistency::LocalOne);
        assert_eq!(to_scylla_consistency(Consistency::EachQuorum), ScyllaConsistency::EachQuorum);
    }

    #[test]
    fn test_retries_capped_per_statement() {
        let mut retries = 0;

        let first = cap_retries(RetryDecision::RetryNextTarget(None), &mut retries, 2);
        assert!(matches!(first, RetryDecision::RetryNextTarget(None)));
        let second = cap_retries(RetryDecision::RetrySameTarget(None), &mut retries, 2);
        assert!(matches!(second, RetryDecision::RetrySameTarget(None)));
        assert_eq!(retries, 2);

        let third = cap_retries(RetryDecision::RetryNextTarget(None), &mut retries, 2);
        assert!(matches!(third, RetryDecision::DontRetry));
        assert_eq!(retries, 2);

        // decisions that do not retry pass through uncounted
        let ignored = cap_retries(RetryDecision::IgnoreWriteError, &mut retries, 2);
        assert!(matches!(ignored, RetryDecision::IgnoreWriteError));
    }

    #[test]
    fn test_zero_retries_never_retries() {
        let mut retries = 0;
        let decision = cap_retries(RetryDecision::RetrySameTarget(None), &mut retries, 0);
        assert!(matches!(decision, RetryDecision::DontRetry));
    }

    #[tokio::test]
    #[ignore] // Requires actual Cassandra
    async fn test_shared_cache_connects() {
        let host = std::env::var("CASSANDRA_CONNECTION_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let config = ConnectionConfig::new([host.parse().unwrap()]);
        let manager = ConnectionManager::new(config, shared_cluster_cache());

        let host = manager.closest_live_host().await;
        assert!(host.is_ok());

        shutdown_shared_cluster_cache();
    }
}
