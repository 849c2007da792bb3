//! Bulk writes into one table
//!
//! [`TableWriter`] turns records into bound statements through a
//! [`RowWriter`], groups them with a [`BatchBuilder`] and hands them to an
//! [`AsyncQueryExecutor`] that bounds how many are in flight.

mod batch;
mod conf;
mod executor;
mod metrics;
mod pipeline;
mod row;

pub use batch::{Batch, BatchBuilder, BoundStatement, Statement};
pub use conf::{
    BatchSize, Consistency, DEFAULT_BATCH_SIZE_BYTES, DEFAULT_PARALLELISM_LEVEL, SAMPLE_SIZE,
    WriteConf,
};
pub use executor::{AsyncQueryExecutor, ExecutionStats};
pub use metrics::WriterMetrics;
pub use pipeline::{TableWriter, WriteStats, rows_per_batch};
pub use row::{ColumnDef, ColumnRole, FnRowWriter, RowWriter, TableDef};
