use std::fmt::Write as _;

use super::conf::WriteConf;
use crate::common::{ConnectorError, ConnectorResult};
use crate::types::{ColumnValue, CqlType};

/// Role of a column in its table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnRole {
    PartitionKey,
    Clustering,
    Regular,
    Static,
}

impl ColumnRole {
    pub fn is_primary_key(&self) -> bool {
        matches!(self, ColumnRole::PartitionKey | ColumnRole::Clustering)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub cql_type: CqlType,
    pub role: ColumnRole,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, cql_type: CqlType, role: ColumnRole) -> Self {
        Self {
            name: name.into(),
            cql_type,
            role,
        }
    }

    pub fn partition_key(name: impl Into<String>, cql_type: CqlType) -> Self {
        Self::new(name, cql_type, ColumnRole::PartitionKey)
    }

    pub fn clustering(name: impl Into<String>, cql_type: CqlType) -> Self {
        Self::new(name, cql_type, ColumnRole::Clustering)
    }

    pub fn regular(name: impl Into<String>, cql_type: CqlType) -> Self {
        Self::new(name, cql_type, ColumnRole::Regular)
    }
}

/// Target table metadata
///
/// Partition key components are taken in column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub keyspace: String,
    pub table: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn partition_key(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns
            .iter()
            .filter(|c| c.role == ColumnRole::PartitionKey)
    }

    /// Resolve written column names against the table
    ///
    /// Every name must exist and every primary key column must be written.
    pub fn select(&self, names: &[String]) -> ConnectorResult<Vec<ColumnDef>> {
        let selected = names
            .iter()
            .map(|name| {
                self.column(name).cloned().ok_or_else(|| {
                    ConnectorError::Schema(format!(
                        "column \"{name}\" not found in table {}",
                        self.qualified_name()
                    ))
                })
            })
            .collect::<ConnectorResult<Vec<_>>>()?;

        let missing: Vec<&str> = self
            .columns
            .iter()
            .filter(|c| c.role.is_primary_key() && !names.contains(&c.name))
            .map(|c| c.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(ConnectorError::Schema(format!(
                "primary key column(s) {} of table {} are not written",
                missing.join(", "),
                self.qualified_name()
            )));
        }

        Ok(selected)
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote(&self.keyspace), quote(&self.table))
    }

    /// `INSERT` statement for the given columns, honoring TTL and timestamp
    pub fn insert_query(&self, columns: &[String], conf: &WriteConf) -> String {
        let names: Vec<String> = columns.iter().map(|c| quote(c)).collect();
        let markers = vec!["?"; columns.len()];

        let mut query = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.qualified_name(),
            names.join(", "),
            markers.join(", ")
        );

        let mut options = Vec::new();
        if let Some(ttl) = conf.ttl {
            options.push(format!("TTL {ttl}"));
        }
        if let Some(timestamp) = conf.timestamp {
            options.push(format!("TIMESTAMP {timestamp}"));
        }
        if !options.is_empty() {
            let _ = write!(query, " USING {}", options.join(" AND "));
        }

        query
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

/// Extracts column values from records of type `R`
///
/// Values are written positionally into the buffer in the order of
/// [`column_names`](RowWriter::column_names); `None` writes a null.
pub trait RowWriter<R>: Send + Sync {
    fn column_names(&self) -> &[String];

    fn read_column_values(&self, record: &R, buffer: &mut [Option<ColumnValue>]);

    /// Rough in-memory size of a record's values
    fn estimate_size_in_bytes(&self, record: &R) -> usize {
        let mut buffer = vec![None; self.column_names().len()];
        self.read_column_values(record, &mut buffer);
        buffer.iter().flatten().map(ColumnValue::estimated_size).sum()
    }
}

/// [`RowWriter`] built from a column list and a closure
///
/// ```ignore
/// let writer = FnRowWriter::new(["id", "name"], |user: &User, out: &mut [Option<ColumnValue>]| {
///     out[0] = Some(user.id.into());
///     out[1] = user.name.clone().map(Into::into);
/// });
/// ```
pub struct FnRowWriter<F> {
    columns: Vec<String>,
    read: F,
}

impl<F> FnRowWriter<F> {
    pub fn new<I, S>(columns: I, read: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            read,
        }
    }
}

impl<R, F> RowWriter<R> for FnRowWriter<F>
where
    F: Fn(&R, &mut [Option<ColumnValue>]) + Send + Sync,
{
    fn column_names(&self) -> &[String] {
        &self.columns
    }

    fn read_column_values(&self, record: &R, buffer: &mut [Option<ColumnValue>]) {
        (self.read)(record, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> TableDef {
        TableDef::new(
            "ks",
            "events",
            vec![
                ColumnDef::partition_key("id", CqlType::Int),
                ColumnDef::clustering("at", CqlType::Timestamp),
                ColumnDef::regular("name", CqlType::Text),
                ColumnDef::new("owner", CqlType::Text, ColumnRole::Static),
            ],
        )
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_insert_query_shape() {
        let query = events().insert_query(&names(&["id", "at", "name"]), &WriteConf::default());
        assert_eq!(
            query,
            r#"INSERT INTO "ks"."events" ("id", "at", "name") VALUES (?, ?, ?)"#
        );
    }

    #[test]
    fn test_insert_query_with_ttl_and_timestamp() {
        let conf = WriteConf::default().with_ttl(3600).with_timestamp(1_700_000_000_000_000);
        let query = events().insert_query(&names(&["id", "at"]), &conf);
        assert!(query.ends_with(" USING TTL 3600 AND TIMESTAMP 1700000000000000"));

        let conf = WriteConf::default().with_timestamp(5);
        assert!(events().insert_query(&names(&["id", "at"]), &conf).ends_with(" USING TIMESTAMP 5"));
    }

    #[test]
    fn test_identifiers_quoted_verbatim() {
        let table = TableDef::new("Ks", "Mixed\"Case", vec![ColumnDef::partition_key("Id", CqlType::Int)]);
        let query = table.insert_query(&names(&["Id"]), &WriteConf::default());
        assert_eq!(query, r#"INSERT INTO "Ks"."Mixed"Case" ("Id") VALUES (?)"#);

        let table = TableDef::new("ks", "my\"tbl", vec![ColumnDef::partition_key("a\"b", CqlType::Int)]);
        let query = table.insert_query(&names(&["a\"b"]), &WriteConf::default());
        assert_eq!(query, r#"INSERT INTO "ks"."my"tbl" ("a"b") VALUES (?)"#);
    }

    #[test]
    fn test_select_validates_columns() {
        let table = events();
        assert_eq!(table.select(&names(&["at", "id"])).unwrap().len(), 2);

        let err = table.select(&names(&["id", "at", "nope"])).unwrap_err();
        assert!(matches!(err, ConnectorError::Schema(ref m) if m.contains("nope")));

        let err = table.select(&names(&["id", "name"])).unwrap_err();
        assert!(matches!(err, ConnectorError::Schema(ref m) if m.contains("at")));
    }

    struct Event {
        id: i32,
        name: Option<String>,
    }

    #[test]
    fn test_fn_row_writer() {
        let writer = FnRowWriter::new(["id", "name"], |event: &Event, out: &mut [Option<ColumnValue>]| {
            out[0] = Some(event.id.into());
            out[1] = event.name.clone().map(Into::into);
        });

        let mut buffer = vec![None; 2];
        writer.read_column_values(&Event { id: 7, name: None }, &mut buffer);
        assert_eq!(buffer, vec![Some(ColumnValue::Int(7)), None]);

        let named = Event {
            id: 7,
            name: Some("abc".to_string()),
        };
        assert_eq!(writer.estimate_size_in_bytes(&named), 7);
    }
}
