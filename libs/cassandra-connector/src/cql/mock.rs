//! In-memory driver for testing
//!
//! Simulates a cluster topology, records every prepared query and executed
//! statement, and can inject connection failures, statement failures, panics
//! and latency.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::driver::{ClusterHandle, ClusterSettings, Driver, Host, SessionHandle};
use crate::common::{ConnectorError, ConnectorResult};
use crate::types::ProtocolVersion;
use crate::writer::Statement;

type StatementPredicate = Arc<dyn Fn(&Statement<MockPrepared>) -> bool + Send + Sync>;

/// Prepared statement handle of the mock driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPrepared {
    pub id: usize,
    pub cql: String,
}

impl MockPrepared {
    pub fn new(id: usize, cql: impl Into<String>) -> Self {
        Self { id, cql: cql.into() }
    }
}

#[derive(Default)]
struct MockState {
    connect_attempts: AtomicUsize,
    connects: AtomicUsize,
    cluster_closes: AtomicUsize,
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    prepared: Mutex<Vec<String>>,
    executed: Mutex<Vec<Statement<MockPrepared>>>,
}

/// Mock driver; clones share their recorded state
#[derive(Clone)]
pub struct MockDriver {
    topology: Vec<Host>,
    fail_connect: bool,
    protocol_version: ProtocolVersion,
    latency: Duration,
    fail_when: Option<StatementPredicate>,
    panic_when: Option<StatementPredicate>,
    state: Arc<MockState>,
}

impl MockDriver {
    /// Create a mock driver reporting the given topology
    pub fn new(topology: Vec<Host>) -> Self {
        Self {
            topology,
            fail_connect: false,
            protocol_version: ProtocolVersion::V4,
            latency: Duration::ZERO,
            fail_when: None,
            panic_when: None,
            state: Arc::new(MockState::default()),
        }
    }

    /// One live node at 127.0.0.1 in `dc1`
    pub fn single_node() -> Self {
        Self::new(vec![Host::up([127, 0, 0, 1].into(), Some("dc1"))])
    }

    /// Every connection attempt fails
    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Delay every execution
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail executions of statements matching `predicate`
    pub fn fail_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Statement<MockPrepared>) -> bool + Send + Sync + 'static,
    {
        self.fail_when = Some(Arc::new(predicate));
        self
    }

    /// Panic while executing statements matching `predicate`
    pub fn panic_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Statement<MockPrepared>) -> bool + Send + Sync + 'static,
    {
        self.panic_when = Some(Arc::new(predicate));
        self
    }

    /// Number of connect calls, failed ones included
    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of successful connects
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of cluster closes
    pub fn close_count(&self) -> usize {
        self.state.cluster_closes.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.sessions_closed.load(Ordering::SeqCst)
    }

    /// Highest number of concurrently executing statements seen
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every prepared query, in order
    pub async fn prepared_queries(&self) -> Vec<String> {
        self.state.prepared.lock().await.clone()
    }

    /// Every executed statement (failed ones included), in completion order
    pub async fn executed(&self) -> Vec<Statement<MockPrepared>> {
        self.state.executed.lock().await.clone()
    }

    /// Rows across all executed statements
    pub async fn executed_rows(&self) -> usize {
        self.state
            .executed
            .lock()
            .await
            .iter()
            .map(Statement::row_count)
            .sum()
    }
}

#[async_trait]
impl Driver for MockDriver {
    type Cluster = MockCluster;

    async fn connect(&self, settings: &ClusterSettings) -> ConnectorResult<MockCluster> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            return Err(ConnectorError::ConnectionFailed(format!(
                "no contact point reachable among {:?}",
                settings.contact_points
            )));
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockCluster {
            driver: self.clone(),
        })
    }
}

/// Cluster handle of the mock driver
pub struct MockCluster {
    driver: MockDriver,
}

#[async_trait]
impl ClusterHandle for MockCluster {
    type Session = MockSession;

    fn topology(&self) -> Vec<Host> {
        self.driver.topology.clone()
    }

    async fn open_session(&self) -> ConnectorResult<MockSession> {
        self.driver.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession {
            driver: self.driver.clone(),
        })
    }

    fn close(&self) {
        self.driver.state.cluster_closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Session of the mock driver
pub struct MockSession {
    driver: MockDriver,
}

#[async_trait]
impl SessionHandle for MockSession {
    type Prepared = MockPrepared;

    async fn prepare(&self, cql: &str) -> ConnectorResult<MockPrepared> {
        let mut prepared = self.driver.state.prepared.lock().await;
        prepared.push(cql.to_string());
        Ok(MockPrepared::new(prepared.len() - 1, cql))
    }

    fn protocol_version(&self) -> ProtocolVersion {
        self.driver.protocol_version
    }

    async fn execute(&self, statement: Statement<MockPrepared>) -> ConnectorResult<()> {
        let state = &self.driver.state;
        let in_flight = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if !self.driver.latency.is_zero() {
            tokio::time::sleep(self.driver.latency).await;
        }

        let failed = self.driver.fail_when.as_ref().is_some_and(|p| p(&statement));
        let panics = self.driver.panic_when.as_ref().is_some_and(|p| p(&statement));
        state.executed.lock().await.push(statement);
        state.in_flight.fetch_sub(1, Ordering::SeqCst);

        if panics {
            panic!("mock driver panic");
        }
        if failed {
            return Err(ConnectorError::Execution("mock failure".to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.driver.state.sessions_closed.fetch_add(1, Ordering::SeqCst);
    }
}
