//! Binding records to a prepared insert and grouping them into batches

use std::sync::Arc;

use super::conf::Consistency;
use super::row::{ColumnDef, RowWriter, TableDef};
use crate::common::{ConnectorError, ConnectorResult};
use crate::types::{ColumnValue, CqlType, ProtocolVersion, codec};

/// A prepared statement bound to one record's values
///
/// Carries both the converted values and their serialized form; `None`
/// entries are nulls.
#[derive(Debug, Clone)]
pub struct BoundStatement<P> {
    prepared: P,
    types: Arc<[CqlType]>,
    values: Vec<Option<ColumnValue>>,
    serialized: Vec<Option<Vec<u8>>>,
    bytes_count: usize,
    routing_key: Option<Vec<u8>>,
    consistency: Consistency,
}

impl<P> BoundStatement<P> {
    pub fn prepared(&self) -> &P {
        &self.prepared
    }

    /// Column types in column order
    pub fn column_types(&self) -> &[CqlType] {
        &self.types
    }

    /// Converted values in column order
    pub fn values(&self) -> &[Option<ColumnValue>] {
        &self.values
    }

    /// Serialized values in column order
    pub fn serialized_values(&self) -> &[Option<Vec<u8>>] {
        &self.serialized
    }

    /// Sum of the serialized lengths of all non-null values
    pub fn bytes_count(&self) -> usize {
        self.bytes_count
    }

    pub fn routing_key(&self) -> Option<&[u8]> {
        self.routing_key.as_deref()
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }
}

/// Unlogged batch of statements sharing a routing key and consistency level
#[derive(Debug, Clone)]
pub struct Batch<P> {
    statements: Vec<BoundStatement<P>>,
    routing_key: Option<Vec<u8>>,
    consistency: Consistency,
}

impl<P> Batch<P> {
    pub fn statements(&self) -> &[BoundStatement<P>] {
        &self.statements
    }

    pub fn routing_key(&self) -> Option<&[u8]> {
        self.routing_key.as_deref()
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }
}

/// Unit of work handed to a session
#[derive(Debug, Clone)]
pub enum Statement<P> {
    Bound(BoundStatement<P>),
    Batch(Batch<P>),
}

impl<P> Statement<P> {
    /// Bound statements in submission order
    pub fn bound_statements(&self) -> &[BoundStatement<P>] {
        match self {
            Statement::Bound(statement) => std::slice::from_ref(statement),
            Statement::Batch(batch) => &batch.statements,
        }
    }

    pub fn row_count(&self) -> usize {
        self.bound_statements().len()
    }

    pub fn bytes_count(&self) -> usize {
        self.bound_statements().iter().map(BoundStatement::bytes_count).sum()
    }

    pub fn consistency(&self) -> Consistency {
        match self {
            Statement::Bound(statement) => statement.consistency,
            Statement::Batch(batch) => batch.consistency,
        }
    }

    pub fn routing_key(&self) -> Option<&[u8]> {
        match self {
            Statement::Bound(statement) => statement.routing_key(),
            Statement::Batch(batch) => batch.routing_key(),
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Statement::Batch(_))
    }
}

/// Binds records to a prepared insert and assembles statements into batches
pub struct BatchBuilder<P> {
    prepared: P,
    columns: Vec<ColumnDef>,
    types: Arc<[CqlType]>,
    /// Positions of the partition key components among `columns`
    partition_key: Vec<usize>,
    protocol_version: ProtocolVersion,
    consistency: Consistency,
}

impl<P: Clone> BatchBuilder<P> {
    /// Fails with a schema error if `column_names` do not fit `table`
    pub fn new(
        prepared: P,
        table: &TableDef,
        column_names: &[String],
        protocol_version: ProtocolVersion,
        consistency: Consistency,
    ) -> ConnectorResult<Self> {
        let columns = table.select(column_names)?;
        let partition_key = table
            .partition_key()
            .filter_map(|pk| column_names.iter().position(|name| *name == pk.name))
            .collect();
        let types = columns.iter().map(|c| c.cql_type.clone()).collect();

        Ok(Self {
            prepared,
            columns,
            types,
            partition_key,
            protocol_version,
            consistency,
        })
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Read, convert and serialize one record
    pub fn bind<R, W>(&self, writer: &W, record: &R) -> ConnectorResult<BoundStatement<P>>
    where
        W: RowWriter<R> + ?Sized,
    {
        let mut raw = vec![None; self.columns.len()];
        writer.read_column_values(record, &mut raw);

        let mut values = Vec::with_capacity(raw.len());
        let mut serialized = Vec::with_capacity(raw.len());
        let mut bytes_count = 0;

        for (column, value) in self.columns.iter().zip(raw) {
            let Some(value) = value else {
                values.push(None);
                serialized.push(None);
                continue;
            };

            let converted = column
                .cql_type
                .convert(value)
                .map_err(|details| ConnectorError::conversion(&column.name, details))?;
            let bytes = codec::serialize(&converted, &column.cql_type, self.protocol_version)
                .map_err(|details| ConnectorError::conversion(&column.name, details))?;

            bytes_count += bytes.len();
            values.push(Some(converted));
            serialized.push(Some(bytes));
        }

        let routing_key = self.routing_key(&serialized);

        Ok(BoundStatement {
            prepared: self.prepared.clone(),
            types: Arc::clone(&self.types),
            values,
            serialized,
            bytes_count,
            routing_key,
            consistency: self.consistency,
        })
    }

    /// Single-column keys are the raw value; composite keys concatenate
    /// `[u16 length][bytes][0x00]` per component. Any null component yields no key.
    fn routing_key(&self, serialized: &[Option<Vec<u8>>]) -> Option<Vec<u8>> {
        match self.partition_key.as_slice() {
            [] => None,
            [single] => serialized.get(*single).cloned().flatten(),
            components => {
                let mut key = Vec::new();
                for index in components {
                    let bytes = serialized.get(*index)?.as_ref()?;
                    let len = u16::try_from(bytes.len()).ok()?;
                    key.extend_from_slice(&len.to_be_bytes());
                    key.extend_from_slice(bytes);
                    key.push(0);
                }
                Some(key)
            }
        }
    }

    /// Group statements under one routing key and consistency level
    ///
    /// A single statement is returned as is; an empty group yields nothing.
    pub fn assemble(&self, mut statements: Vec<BoundStatement<P>>) -> Option<Statement<P>> {
        match statements.len() {
            0 => None,
            1 => statements.pop().map(Statement::Bound),
            _ => {
                let routing_key = statements[0].routing_key.clone();
                Some(Statement::Batch(Batch {
                    statements,
                    routing_key,
                    consistency: self.consistency,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::row::FnRowWriter;
    use chrono::{DateTime, Utc};

    #[derive(Clone)]
    struct Reading {
        sensor: String,
        bucket: i32,
        value: Option<i64>,
        ok: bool,
        at: DateTime<Utc>,
    }

    fn table() -> TableDef {
        TableDef::new(
            "metrics",
            "readings",
            vec![
                ColumnDef::partition_key("sensor", CqlType::Text),
                ColumnDef::partition_key("bucket", CqlType::Int),
                ColumnDef::clustering("at", CqlType::Timestamp),
                ColumnDef::regular("value", CqlType::BigInt),
                ColumnDef::regular("ok", CqlType::Boolean),
            ],
        )
    }

    fn writer() -> FnRowWriter<impl Fn(&Reading, &mut [Option<ColumnValue>]) + Send + Sync> {
        FnRowWriter::new(
            ["sensor", "bucket", "at", "value", "ok"],
            |r: &Reading, out: &mut [Option<ColumnValue>]| {
                out[0] = Some(r.sensor.clone().into());
                out[1] = Some(r.bucket.into());
                out[2] = Some(r.at.into());
                out[3] = r.value.map(Into::into);
                out[4] = Some(r.ok.into());
            },
        )
    }

    fn builder() -> BatchBuilder<&'static str> {
        let columns: Vec<String> = ["sensor", "bucket", "at", "value", "ok"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        BatchBuilder::new("insert", &table(), &columns, ProtocolVersion::V4, Consistency::Quorum)
            .unwrap()
    }

    fn reading(sensor: &str, value: Option<i64>) -> Reading {
        Reading {
            sensor: sensor.to_string(),
            bucket: 1,
            value,
            ok: true,
            at: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
        }
    }

    #[test]
    fn test_bytes_count_is_sum_of_non_null_values() {
        let builder = builder();
        let writer = writer();

        let full = builder.bind(&writer, &reading("s1", Some(5))).unwrap();
        // text 2 + int 4 + timestamp 8 + bigint 8 + boolean 1
        assert_eq!(full.bytes_count(), 23);

        let with_null = builder.bind(&writer, &reading("s1", None)).unwrap();
        assert_eq!(with_null.bytes_count(), 15);
        assert_eq!(with_null.serialized_values()[3], None);
        assert_eq!(with_null.values()[3], None);
    }

    #[test]
    fn test_all_null_record_has_zero_bytes() {
        let table = TableDef::new("ks", "t", vec![ColumnDef::partition_key("id", CqlType::Int)]);
        let builder = BatchBuilder::new((), &table, &["id".to_string()], ProtocolVersion::V4, Consistency::One)
            .unwrap();
        let nulls = FnRowWriter::new(["id"], |_: &(), _: &mut [Option<ColumnValue>]| {});

        let bound = builder.bind(&nulls, &()).unwrap();
        assert_eq!(bound.bytes_count(), 0);
        assert_eq!(bound.routing_key(), None);
    }

    #[test]
    fn test_values_round_trip_through_serialization() {
        let builder = builder();
        let record = reading("sensor-7", Some(i64::MIN));
        let bound = builder.bind(&writer(), &record).unwrap();

        let decoded: Vec<ColumnValue> = builder
            .columns()
            .iter()
            .zip(bound.serialized_values())
            .map(|(column, bytes)| {
                codec::deserialize(bytes.as_ref().unwrap(), &column.cql_type, ProtocolVersion::V4).unwrap()
            })
            .collect();

        assert_eq!(
            decoded,
            vec![
                ColumnValue::Text("sensor-7".into()),
                ColumnValue::Int(1),
                ColumnValue::Timestamp(record.at),
                ColumnValue::BigInt(i64::MIN),
                ColumnValue::Boolean(true),
            ]
        );
    }

    #[test]
    fn test_composite_routing_key() {
        let bound = builder().bind(&writer(), &reading("ab", None)).unwrap();
        assert_eq!(
            bound.routing_key().unwrap(),
            &[0, 2, b'a', b'b', 0, 0, 4, 0, 0, 0, 1, 0][..]
        );
    }

    #[test]
    fn test_single_column_routing_key_is_raw_value() {
        let table = TableDef::new("ks", "t", vec![ColumnDef::partition_key("id", CqlType::Int)]);
        let builder = BatchBuilder::new((), &table, &["id".to_string()], ProtocolVersion::V4, Consistency::One)
            .unwrap();
        let ids = FnRowWriter::new(["id"], |id: &i32, out: &mut [Option<ColumnValue>]| {
            out[0] = Some((*id).into());
        });

        let bound = builder.bind(&ids, &258).unwrap();
        assert_eq!(bound.routing_key().unwrap(), &[0, 0, 1, 2][..]);
    }

    #[test]
    fn test_conversion_failure_names_column() {
        let table = TableDef::new("ks", "t", vec![ColumnDef::partition_key("id", CqlType::Int)]);
        let builder = BatchBuilder::new((), &table, &["id".to_string()], ProtocolVersion::V4, Consistency::One)
            .unwrap();
        let bad = FnRowWriter::new(["id"], |_: &(), out: &mut [Option<ColumnValue>]| {
            out[0] = Some("not-a-number".into());
        });

        let err = builder.bind(&bad, &()).unwrap_err();
        assert!(matches!(err, ConnectorError::Conversion { ref column, .. } if column == "id"));
    }

    #[test]
    fn test_assemble_single_statement_is_unbatched() {
        let builder = builder();
        let bound = builder.bind(&writer(), &reading("s1", None)).unwrap();

        let statement = builder.assemble(vec![bound]).unwrap();
        assert!(!statement.is_batch());
        assert_eq!(statement.consistency(), Consistency::Quorum);
        assert!(builder.assemble(Vec::new()).is_none());
    }

    #[test]
    fn test_assemble_uses_first_routing_key() {
        let builder = builder();
        let writer = writer();
        let statements: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|s| builder.bind(&writer, &reading(s, Some(1))).unwrap())
            .collect();
        let first_key = statements[0].routing_key().map(<[u8]>::to_vec);
        let total: usize = statements.iter().map(BoundStatement::bytes_count).sum();

        let statement = builder.assemble(statements).unwrap();
        assert!(statement.is_batch());
        assert_eq!(statement.row_count(), 3);
        assert_eq!(statement.bytes_count(), total);
        assert_eq!(statement.routing_key().map(<[u8]>::to_vec), first_key);
        assert_eq!(statement.consistency(), Consistency::Quorum);
    }
}
