use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::batch::{BatchBuilder, BoundStatement, Statement};
use super::conf::{BatchSize, DEFAULT_BATCH_SIZE_BYTES, SAMPLE_SIZE, WriteConf};
use super::executor::AsyncQueryExecutor;
use super::metrics::WriterMetrics;
use super::row::{RowWriter, TableDef};
use crate::common::{ConnectorError, ConnectorResult};
use crate::cql::{ConnectionManager, Driver, DriverSession, SessionHandle};

/// Outcome of a successful write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStats {
    pub rows: u64,
    /// Statements and batches sent
    pub statements: u64,
    /// Serialized bytes of all non-null values
    pub bytes: u64,
    pub rows_per_batch: usize,
    pub elapsed: Duration,
}

/// Rows per batch for a byte budget, given the largest sampled row
///
/// Leaves a factor of two of headroom for rows bigger than any sampled one.
pub fn rows_per_batch(byte_budget: usize, max_row_size: usize) -> usize {
    (byte_budget / (max_row_size.max(1) * 2)).max(1)
}

type PreparedOf<D> = <DriverSession<D> as SessionHandle>::Prepared;

#[derive(Default)]
struct Tally {
    rows: u64,
    bytes: u64,
}

/// Writes streams of records into one table
///
/// Each [`write`](TableWriter::write) opens its own session, sizes batches,
/// dispatches them with bounded parallelism and fails as a whole if any
/// statement failed. Delivery is at-least-once: re-running a failed write
/// re-sends every record.
///
/// # Example
///
/// ```ignore
/// let writer = TableWriter::new(manager, table, row_writer, WriteConf::from_env()?)?;
/// let stats = writer.write(records).await?;
/// ```
pub struct TableWriter<D: Driver, R, W> {
    manager: Arc<ConnectionManager<D>>,
    table: TableDef,
    writer: W,
    conf: WriteConf,
    columns: Vec<String>,
    query: String,
    metrics: WriterMetrics,
    _record: PhantomData<fn(&R)>,
}

impl<D, R, W> TableWriter<D, R, W>
where
    D: Driver,
    W: RowWriter<R>,
{
    /// Fails with a schema error when the writer's columns do not fit `table`
    pub fn new(
        manager: Arc<ConnectionManager<D>>,
        table: TableDef,
        writer: W,
        conf: WriteConf,
    ) -> ConnectorResult<Self> {
        let columns = writer.column_names().to_vec();
        table.select(&columns)?;
        let query = table.insert_query(&columns, &conf);
        let metrics = WriterMetrics::new(&table.keyspace, &table.table);

        Ok(Self {
            manager,
            table,
            writer,
            conf,
            columns,
            query,
            metrics,
            _record: PhantomData,
        })
    }

    pub fn insert_query(&self) -> &str {
        &self.query
    }

    pub fn conf(&self) -> &WriteConf {
        &self.conf
    }

    /// Write every record, waiting for all statements to settle
    pub async fn write<I>(&self, records: I) -> ConnectorResult<WriteStats>
    where
        I: IntoIterator<Item = R>,
    {
        let started = Instant::now();
        let result = self
            .manager
            .with_session(|session| self.write_with_session(session, records.into_iter(), started))
            .await;

        self.metrics.write_finished(started.elapsed(), result.is_ok());
        result
    }

    async fn write_with_session(
        &self,
        session: Arc<DriverSession<D>>,
        records: impl Iterator<Item = R>,
        started: Instant,
    ) -> ConnectorResult<WriteStats> {
        let prepared = session.prepare(&self.query).await?;
        let builder = BatchBuilder::new(
            prepared,
            &self.table,
            &self.columns,
            session.protocol_version(),
            self.conf.consistency,
        )?;
        let executor = AsyncQueryExecutor::new(Arc::clone(&session), self.conf.parallelism_level)
            .with_metrics(self.metrics.clone());

        let mut tally = Tally::default();
        let dispatched = self.dispatch(&builder, &executor, records, &mut tally).await;

        // everything already submitted settles before any error is raised
        let stats = executor.drain().await?;
        let rows_per_batch = dispatched?;

        if stats.failed > 0 {
            error!(
                table = %self.table.qualified_name(),
                failed = stats.failed,
                attempted = stats.submitted,
                "Write failed"
            );
            return Err(ConnectorError::WriteFailed {
                keyspace: self.table.keyspace.clone(),
                table: self.table.table.clone(),
                failed: stats.failed,
                attempted: stats.submitted,
            });
        }

        let write_stats = WriteStats {
            rows: tally.rows,
            statements: stats.submitted,
            bytes: tally.bytes,
            rows_per_batch,
            elapsed: started.elapsed(),
        };
        info!(
            table = %self.table.qualified_name(),
            rows = write_stats.rows,
            statements = write_stats.statements,
            bytes = write_stats.bytes,
            elapsed_ms = write_stats.elapsed.as_millis() as u64,
            "Wrote {} rows to {}",
            write_stats.rows,
            self.table.qualified_name()
        );
        Ok(write_stats)
    }

    /// Size batches and submit every record; returns the rows per batch used
    async fn dispatch(
        &self,
        builder: &BatchBuilder<PreparedOf<D>>,
        executor: &AsyncQueryExecutor<DriverSession<D>>,
        mut records: impl Iterator<Item = R>,
        tally: &mut Tally,
    ) -> ConnectorResult<usize> {
        let rows_per_batch = match self.conf.batch_size {
            BatchSize::RowsInBatch(count) => count.max(1),
            batch_size => {
                let budget = batch_size.byte_budget().unwrap_or(DEFAULT_BATCH_SIZE_BYTES);
                let mut max_row_size = 0;

                for record in records.by_ref().take(SAMPLE_SIZE) {
                    let bound = builder.bind(&self.writer, &record)?;
                    max_row_size = max_row_size.max(bound.bytes_count());
                    tally.rows += 1;
                    tally.bytes += bound.bytes_count() as u64;
                    executor.execute_async(Statement::Bound(bound)).await?;
                }

                let rows = rows_per_batch(budget, max_row_size);
                debug!(budget, max_row_size, rows_per_batch = rows, "Sized batches from sample");
                rows
            }
        };

        let mut chunk = Vec::with_capacity(rows_per_batch);
        for record in records {
            chunk.push(builder.bind(&self.writer, &record)?);
            if chunk.len() == rows_per_batch {
                self.submit(builder, executor, std::mem::take(&mut chunk), tally)
                    .await?;
            }
        }
        self.submit(builder, executor, chunk, tally).await?;

        Ok(rows_per_batch)
    }

    async fn submit(
        &self,
        builder: &BatchBuilder<PreparedOf<D>>,
        executor: &AsyncQueryExecutor<DriverSession<D>>,
        chunk: Vec<BoundStatement<PreparedOf<D>>>,
        tally: &mut Tally,
    ) -> ConnectorResult<()> {
        let Some(statement) = builder.assemble(chunk) else {
            return Ok(());
        };
        tally.rows += statement.row_count() as u64;
        tally.bytes += statement.bytes_count() as u64;
        executor.execute_async(statement).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::mock::MockDriver;
    use crate::cql::{ConnectionConfig, cluster_cache};
    use crate::types::{ColumnValue, CqlType};
    use crate::writer::conf::Consistency;
    use crate::writer::row::{ColumnDef, FnRowWriter};

    fn manager(driver: &MockDriver) -> Arc<ConnectionManager<MockDriver>> {
        let config = ConnectionConfig::new(["127.0.0.1".parse().unwrap()]);
        Arc::new(ConnectionManager::new(config, cluster_cache(driver.clone())))
    }

    fn table() -> TableDef {
        TableDef::new(
            "ks",
            "kv",
            vec![
                ColumnDef::partition_key("k", CqlType::Int),
                ColumnDef::regular("v", CqlType::Text),
            ],
        )
    }

    type KvWriter = FnRowWriter<fn(&(i32, String), &mut [Option<ColumnValue>])>;

    fn kv_writer() -> KvWriter {
        fn read(record: &(i32, String), out: &mut [Option<ColumnValue>]) {
            out[0] = Some(record.0.into());
            out[1] = Some(record.1.clone().into());
        }
        FnRowWriter::new(["k", "v"], read as fn(&(i32, String), &mut [Option<ColumnValue>]))
    }

    fn records(count: i32) -> Vec<(i32, String)> {
        (0..count).map(|k| (k, format!("value-{k}"))).collect()
    }

    #[test]
    fn test_rows_per_batch() {
        assert_eq!(rows_per_batch(16384, 200), 40);
        assert_eq!(rows_per_batch(16384, 0), 8192);
        assert_eq!(rows_per_batch(100, 500), 1);
    }

    #[tokio::test]
    async fn test_fixed_row_count_batches() {
        let driver = MockDriver::single_node();
        let conf = WriteConf::default().with_batch_size(BatchSize::RowsInBatch(3));
        let writer = TableWriter::new(manager(&driver), table(), kv_writer(), conf).unwrap();

        let stats = writer.write(records(7)).await.unwrap();

        assert_eq!(stats.rows, 7);
        assert_eq!(stats.statements, 3);
        assert_eq!(stats.rows_per_batch, 3);
        let mut sizes: Vec<usize> = driver.executed().await.iter().map(Statement::row_count).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 3, 3]);
    }

    #[tokio::test]
    async fn test_prepares_insert_with_consistency() {
        let driver = MockDriver::single_node();
        let conf = WriteConf::default()
            .with_consistency(Consistency::Quorum)
            .with_ttl(10);
        let writer = TableWriter::new(manager(&driver), table(), kv_writer(), conf).unwrap();
        writer.write(records(2)).await.unwrap();

        assert_eq!(
            driver.prepared_queries().await,
            vec![r#"INSERT INTO "ks"."kv" ("k", "v") VALUES (?, ?) USING TTL 10"#]
        );
        assert!(driver
            .executed()
            .await
            .iter()
            .all(|s| s.consistency() == Consistency::Quorum));
    }

    #[tokio::test]
    async fn test_empty_input_writes_nothing() {
        let driver = MockDriver::single_node();
        let writer =
            TableWriter::new(manager(&driver), table(), kv_writer(), WriteConf::default()).unwrap();

        let stats = writer.write(Vec::new()).await.unwrap();
        assert_eq!(stats.rows, 0);
        assert_eq!(stats.statements, 0);
        assert!(driver.executed().await.is_empty());
    }

    #[test]
    fn test_missing_primary_key_column_is_rejected() {
        let driver = MockDriver::single_node();
        let writer = FnRowWriter::new(["v"], |_: &String, _: &mut [Option<ColumnValue>]| {});
        let result =
            TableWriter::<_, String, _>::new(manager(&driver), table(), writer, WriteConf::default());
        assert!(matches!(result, Err(ConnectorError::Schema(_))));
    }
}
