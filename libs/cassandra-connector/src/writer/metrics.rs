//! Writer metrics
//!
//! Recorded through the `metrics` facade; without an installed recorder these
//! calls are no-ops.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metrics helper labeled with the target table
#[derive(Clone, Debug)]
pub struct WriterMetrics {
    keyspace: String,
    table: String,
}

impl WriterMetrics {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
        }
    }

    /// Record a statement that was written
    pub fn statement_succeeded(&self, rows: usize, bytes: usize) {
        counter!(
            "cassandra_writer_statements_total",
            "keyspace" => self.keyspace.clone(),
            "table" => self.table.clone(),
            "status" => "success"
        )
        .increment(1);

        counter!(
            "cassandra_writer_rows_written_total",
            "keyspace" => self.keyspace.clone(),
            "table" => self.table.clone()
        )
        .increment(rows as u64);

        counter!(
            "cassandra_writer_bytes_written_total",
            "keyspace" => self.keyspace.clone(),
            "table" => self.table.clone()
        )
        .increment(bytes as u64);
    }

    /// Record a statement that failed (or whose task panicked)
    pub fn statement_failed(&self) {
        counter!(
            "cassandra_writer_statements_total",
            "keyspace" => self.keyspace.clone(),
            "table" => self.table.clone(),
            "status" => "failed"
        )
        .increment(1);
    }

    /// Update the in-flight statements gauge
    pub fn in_flight(&self, count: usize) {
        gauge!(
            "cassandra_writer_in_flight",
            "keyspace" => self.keyspace.clone(),
            "table" => self.table.clone()
        )
        .set(count as f64);
    }

    /// Record the duration of a whole write
    pub fn write_finished(&self, duration: Duration, success: bool) {
        histogram!(
            "cassandra_writer_write_duration_seconds",
            "keyspace" => self.keyspace.clone(),
            "table" => self.table.clone(),
            "status" => if success { "success" } else { "failed" }
        )
        .record(duration.as_secs_f64());
    }
}
