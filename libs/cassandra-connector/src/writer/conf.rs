#[cfg(feature = "config")]
use core_config::{ConfigError, FromEnv, env_or_default, env_parse, env_parse_optional};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Byte budget used by [`BatchSize::Automatic`]
pub const DEFAULT_BATCH_SIZE_BYTES: usize = 16 * 1024;

/// Records sampled to estimate the row size for byte-based batching
pub const SAMPLE_SIZE: usize = 128;

pub const DEFAULT_PARALLELISM_LEVEL: usize = 8;

/// How many rows go into one unlogged batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSize {
    /// Byte-based batching with the default budget
    #[default]
    Automatic,
    /// Fixed number of rows per batch
    RowsInBatch(usize),
    /// Rows per batch derived from a byte budget and sampled row sizes
    BytesInBatch(usize),
}

impl BatchSize {
    /// Combine a row setting (`auto` or a count) with an optional byte budget
    ///
    /// A row count wins over the byte budget; `auto` uses the byte budget when
    /// one is given.
    pub fn from_settings(rows: &str, bytes: Option<usize>) -> Result<Self, String> {
        let rows = rows.trim();
        if rows.eq_ignore_ascii_case("auto") {
            return match bytes {
                Some(0) => Err("batch byte budget must be positive".to_string()),
                Some(budget) => Ok(BatchSize::BytesInBatch(budget)),
                None => Ok(BatchSize::Automatic),
            };
        }

        match rows.parse::<usize>() {
            Ok(0) => Err("batch row count must be positive".to_string()),
            Ok(count) => Ok(BatchSize::RowsInBatch(count)),
            Err(_) => Err(format!("invalid batch size '{rows}', expected 'auto' or a row count")),
        }
    }

    /// Byte budget when batching by size
    pub fn byte_budget(&self) -> Option<usize> {
        match self {
            BatchSize::Automatic => Some(DEFAULT_BATCH_SIZE_BYTES),
            BatchSize::BytesInBatch(budget) => Some(*budget),
            BatchSize::RowsInBatch(_) => None,
        }
    }
}

/// Accepts `auto`, a row count (`100`) or a byte budget (`4096b`, `4096 bytes`)
impl FromStr for BatchSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let bytes = lower
            .strip_suffix("bytes")
            .or_else(|| lower.strip_suffix('b'))
            .map(str::trim);

        match bytes {
            Some(budget) => match budget.parse::<usize>() {
                Ok(0) | Err(_) => Err(format!("invalid byte budget '{s}'")),
                Ok(budget) => Ok(BatchSize::BytesInBatch(budget)),
            },
            None => BatchSize::from_settings(&lower, None),
        }
    }
}

impl fmt::Display for BatchSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchSize::Automatic => write!(f, "auto"),
            BatchSize::RowsInBatch(count) => write!(f, "{count}"),
            BatchSize::BytesInBatch(budget) => write!(f, "{budget} bytes"),
        }
    }
}

/// Consistency level attached to every written statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Consistency {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    #[default]
    LocalOne,
}

impl Consistency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Consistency::Any => "ANY",
            Consistency::One => "ONE",
            Consistency::Two => "TWO",
            Consistency::Three => "THREE",
            Consistency::Quorum => "QUORUM",
            Consistency::All => "ALL",
            Consistency::LocalQuorum => "LOCAL_QUORUM",
            Consistency::EachQuorum => "EACH_QUORUM",
            Consistency::LocalOne => "LOCAL_ONE",
        }
    }
}

impl FromStr for Consistency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        let level = match normalized.as_str() {
            "ANY" => Consistency::Any,
            "ONE" => Consistency::One,
            "TWO" => Consistency::Two,
            "THREE" => Consistency::Three,
            "QUORUM" => Consistency::Quorum,
            "ALL" => Consistency::All,
            "LOCAL_QUORUM" => Consistency::LocalQuorum,
            "EACH_QUORUM" => Consistency::EachQuorum,
            "LOCAL_ONE" => Consistency::LocalOne,
            _ => return Err(format!("unknown consistency level '{s}'")),
        };
        Ok(level)
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings of one write operation
///
/// # Example
///
/// ```ignore
/// use cassandra_connector::writer::{BatchSize, Consistency, WriteConf};
///
/// let conf = WriteConf::default()
///     .with_batch_size(BatchSize::RowsInBatch(50))
///     .with_consistency(Consistency::LocalQuorum)
///     .with_ttl(86_400);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConf {
    pub batch_size: BatchSize,
    pub consistency: Consistency,
    /// Maximum statements in flight
    pub parallelism_level: usize,
    /// Time to live of written cells, in seconds
    pub ttl: Option<u32>,
    /// Write timestamp, in microseconds since the epoch
    pub timestamp: Option<i64>,
}

impl Default for WriteConf {
    fn default() -> Self {
        Self {
            batch_size: BatchSize::Automatic,
            consistency: Consistency::LocalOne,
            parallelism_level: DEFAULT_PARALLELISM_LEVEL,
            ttl: None,
            timestamp: None,
        }
    }
}

impl WriteConf {
    pub fn with_batch_size(mut self, batch_size: BatchSize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    /// Clamped to at least one
    pub fn with_parallelism_level(mut self, level: usize) -> Self {
        self.parallelism_level = level.max(1);
        self
    }

    pub fn with_ttl(mut self, seconds: u32) -> Self {
        self.ttl = Some(seconds);
        self
    }

    pub fn with_timestamp(mut self, micros: i64) -> Self {
        self.timestamp = Some(micros);
        self
    }
}

/// Load WriteConf from environment variables
///
/// Environment variables:
/// - `CASSANDRA_OUTPUT_BATCH_SIZE_ROWS` (optional, default: `auto`)
/// - `CASSANDRA_OUTPUT_BATCH_SIZE_BYTES` (optional, default: 16384)
/// - `CASSANDRA_OUTPUT_CONSISTENCY_LEVEL` (optional, default: `LOCAL_ONE`)
/// - `CASSANDRA_OUTPUT_CONCURRENT_WRITES` (optional, default: 8)
/// - `CASSANDRA_OUTPUT_TTL` (optional, seconds)
#[cfg(feature = "config")]
impl FromEnv for WriteConf {
    fn from_env() -> Result<Self, ConfigError> {
        let rows = env_or_default("CASSANDRA_OUTPUT_BATCH_SIZE_ROWS", "auto");
        let bytes = env_parse_optional("CASSANDRA_OUTPUT_BATCH_SIZE_BYTES")?;
        let batch_size =
            BatchSize::from_settings(&rows, bytes).map_err(|details| ConfigError::ParseError {
                key: "CASSANDRA_OUTPUT_BATCH_SIZE_ROWS".to_string(),
                details,
            })?;

        let parallelism_level: usize =
            env_parse("CASSANDRA_OUTPUT_CONCURRENT_WRITES", DEFAULT_PARALLELISM_LEVEL)?;
        if parallelism_level == 0 {
            return Err(ConfigError::ParseError {
                key: "CASSANDRA_OUTPUT_CONCURRENT_WRITES".to_string(),
                details: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            batch_size,
            consistency: env_parse("CASSANDRA_OUTPUT_CONSISTENCY_LEVEL", Consistency::LocalOne)?,
            parallelism_level,
            ttl: env_parse_optional("CASSANDRA_OUTPUT_TTL")?,
            timestamp: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size_from_settings() {
        assert_eq!(BatchSize::from_settings("auto", None), Ok(BatchSize::Automatic));
        assert_eq!(BatchSize::from_settings("AUTO", Some(4096)), Ok(BatchSize::BytesInBatch(4096)));
        assert_eq!(BatchSize::from_settings(" 25 ", Some(4096)), Ok(BatchSize::RowsInBatch(25)));
        assert!(BatchSize::from_settings("0", None).is_err());
        assert!(BatchSize::from_settings("lots", None).is_err());
        assert!(BatchSize::from_settings("auto", Some(0)).is_err());
    }

    #[test]
    fn test_batch_size_from_str() {
        assert_eq!("auto".parse(), Ok(BatchSize::Automatic));
        assert_eq!("12".parse(), Ok(BatchSize::RowsInBatch(12)));
        assert_eq!("4096b".parse(), Ok(BatchSize::BytesInBatch(4096)));
        assert_eq!("4096 bytes".parse(), Ok(BatchSize::BytesInBatch(4096)));
        assert!("-3".parse::<BatchSize>().is_err());
        assert!("bytes".parse::<BatchSize>().is_err());
    }

    #[test]
    fn test_byte_budget() {
        assert_eq!(BatchSize::Automatic.byte_budget(), Some(16384));
        assert_eq!(BatchSize::BytesInBatch(100).byte_budget(), Some(100));
        assert_eq!(BatchSize::RowsInBatch(5).byte_budget(), None);
    }

    #[test]
    fn test_consistency_parsing() {
        assert_eq!("local_quorum".parse(), Ok(Consistency::LocalQuorum));
        assert_eq!("LOCAL-ONE".parse(), Ok(Consistency::LocalOne));
        assert_eq!(" all ".parse(), Ok(Consistency::All));
        assert!("most".parse::<Consistency>().is_err());
        assert_eq!(Consistency::EachQuorum.to_string(), "EACH_QUORUM");
    }

    #[test]
    fn test_write_conf_defaults_and_builders() {
        let conf = WriteConf::default();
        assert_eq!(conf.batch_size, BatchSize::Automatic);
        assert_eq!(conf.consistency, Consistency::LocalOne);
        assert_eq!(conf.parallelism_level, 8);

        let conf = conf.with_parallelism_level(0).with_ttl(60).with_timestamp(1_000);
        assert_eq!(conf.parallelism_level, 1);
        assert_eq!(conf.ttl, Some(60));
        assert_eq!(conf.timestamp, Some(1_000));
    }

    #[test]
    fn test_write_conf_serde() {
        let conf = WriteConf::default().with_batch_size(BatchSize::RowsInBatch(3));
        let json = serde_json::to_string(&conf).unwrap();
        assert!(json.contains("\"rows_in_batch\":3"));
        assert!(json.contains("\"LOCAL_ONE\""));

        let parsed: WriteConf = serde_json::from_str(r#"{"consistency":"QUORUM"}"#).unwrap();
        assert_eq!(parsed.consistency, Consistency::Quorum);
        assert_eq!(parsed.parallelism_level, 8);
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_write_conf_from_env() {
        temp_env::with_vars(
            [
                ("CASSANDRA_OUTPUT_BATCH_SIZE_ROWS", Some("auto")),
                ("CASSANDRA_OUTPUT_BATCH_SIZE_BYTES", Some("2048")),
                ("CASSANDRA_OUTPUT_CONSISTENCY_LEVEL", Some("quorum")),
                ("CASSANDRA_OUTPUT_CONCURRENT_WRITES", Some("4")),
                ("CASSANDRA_OUTPUT_TTL", Some("600")),
            ],
            || {
                let conf = WriteConf::from_env().unwrap();
                assert_eq!(conf.batch_size, BatchSize::BytesInBatch(2048));
                assert_eq!(conf.consistency, Consistency::Quorum);
                assert_eq!(conf.parallelism_level, 4);
                assert_eq!(conf.ttl, Some(600));
            },
        );
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_write_conf_from_env_defaults() {
        temp_env::with_vars_unset(
            [
                "CASSANDRA_OUTPUT_BATCH_SIZE_ROWS",
                "CASSANDRA_OUTPUT_BATCH_SIZE_BYTES",
                "CASSANDRA_OUTPUT_CONSISTENCY_LEVEL",
                "CASSANDRA_OUTPUT_CONCURRENT_WRITES",
                "CASSANDRA_OUTPUT_TTL",
            ],
            || {
                assert_eq!(WriteConf::from_env().unwrap(), WriteConf::default());
            },
        );
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_write_conf_from_env_rejects_bad_values() {
        temp_env::with_var("CASSANDRA_OUTPUT_BATCH_SIZE_ROWS", Some("many"), || {
            let err = WriteConf::from_env().unwrap_err();
            assert!(err.to_string().contains("CASSANDRA_OUTPUT_BATCH_SIZE_ROWS"));
        });
        temp_env::with_var("CASSANDRA_OUTPUT_CONCURRENT_WRITES", Some("0"), || {
            assert!(WriteConf::from_env().is_err());
        });
        temp_env::with_var("CASSANDRA_OUTPUT_CONSISTENCY_LEVEL", Some("some"), || {
            assert!(WriteConf::from_env().is_err());
        });
    }
}
