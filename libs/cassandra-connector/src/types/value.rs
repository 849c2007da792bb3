use chrono::{DateTime, Utc};
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// Column type as declared in the table schema
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CqlType {
    Ascii,
    Text,
    Varchar,
    Int,
    BigInt,
    Counter,
    SmallInt,
    TinyInt,
    Boolean,
    Float,
    Double,
    Timestamp,
    Uuid,
    TimeUuid,
    Blob,
    Inet,
    List(Box<CqlType>),
    Set(Box<CqlType>),
    Map(Box<CqlType>, Box<CqlType>),
}

impl CqlType {
    pub fn list(element: CqlType) -> Self {
        CqlType::List(Box::new(element))
    }

    pub fn set(element: CqlType) -> Self {
        CqlType::Set(Box::new(element))
    }

    pub fn map(key: CqlType, value: CqlType) -> Self {
        CqlType::Map(Box::new(key), Box::new(value))
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, CqlType::List(_) | CqlType::Set(_) | CqlType::Map(_, _))
    }

    /// Convert a raw record value into the representation this type serializes
    ///
    /// Numbers widen freely and narrow only when the value fits, strings are
    /// parsed, and any scalar can be rendered into a text column.
    pub fn convert(&self, value: ColumnValue) -> Result<ColumnValue, String> {
        use ColumnValue as V;

        let found = value.kind();
        let mismatch = || format!("cannot convert {found} to {self}");

        let converted = match self {
            CqlType::Ascii | CqlType::Text | CqlType::Varchar => {
                let text = match value {
                    V::Text(s) => s,
                    V::Blob(_) | V::List(_) | V::Map(_) => return Err(mismatch()),
                    other => other.to_string(),
                };
                if *self == CqlType::Ascii && !text.is_ascii() {
                    return Err(format!("'{text}' is not ASCII"));
                }
                V::Text(text)
            }
            CqlType::Int => match value {
                V::Text(s) => V::Int(parse(&s)?),
                other => V::Int(
                    other
                        .as_i64()
                        .and_then(|n| i32::try_from(n).ok())
                        .ok_or_else(mismatch)?,
                ),
            },
            CqlType::BigInt | CqlType::Counter => match value {
                V::Text(s) => V::BigInt(parse(&s)?),
                other => V::BigInt(other.as_i64().ok_or_else(mismatch)?),
            },
            CqlType::SmallInt => match value {
                V::Text(s) => V::SmallInt(parse(&s)?),
                other => V::SmallInt(
                    other
                        .as_i64()
                        .and_then(|n| i16::try_from(n).ok())
                        .ok_or_else(mismatch)?,
                ),
            },
            CqlType::TinyInt => match value {
                V::Text(s) => V::TinyInt(parse(&s)?),
                other => V::TinyInt(
                    other
                        .as_i64()
                        .and_then(|n| i8::try_from(n).ok())
                        .ok_or_else(mismatch)?,
                ),
            },
            CqlType::Boolean => match value {
                V::Boolean(b) => V::Boolean(b),
                V::Text(s) => V::Boolean(parse(&s.to_ascii_lowercase())?),
                _ => return Err(mismatch()),
            },
            CqlType::Float => match value {
                V::Float(f) => V::Float(f),
                V::Double(d) => V::Float(d as f32),
                V::Text(s) => V::Float(parse(&s)?),
                other => V::Float(other.as_i64().ok_or_else(mismatch)? as f32),
            },
            CqlType::Double => match value {
                V::Double(d) => V::Double(d),
                V::Float(f) => V::Double(f as f64),
                V::Text(s) => V::Double(parse(&s)?),
                other => V::Double(other.as_i64().ok_or_else(mismatch)? as f64),
            },
            CqlType::Timestamp => match value {
                V::Timestamp(t) => V::Timestamp(t),
                V::Text(s) => V::Timestamp(
                    DateTime::parse_from_rfc3339(s.trim())
                        .map_err(|e| format!("invalid timestamp '{s}': {e}"))?
                        .with_timezone(&Utc),
                ),
                other => {
                    let millis = other.as_i64().ok_or_else(mismatch)?;
                    V::Timestamp(
                        DateTime::from_timestamp_millis(millis)
                            .ok_or_else(|| format!("timestamp {millis} out of range"))?,
                    )
                }
            },
            CqlType::Uuid | CqlType::TimeUuid => {
                let uuid = match value {
                    V::Uuid(u) => u,
                    V::Text(s) => parse::<Uuid>(&s)?,
                    _ => return Err(mismatch()),
                };
                if *self == CqlType::TimeUuid && uuid.get_version_num() != 1 {
                    return Err(format!("{uuid} is not a time-based (version 1) UUID"));
                }
                V::Uuid(uuid)
            }
            CqlType::Blob => match value {
                V::Blob(bytes) => V::Blob(bytes),
                _ => return Err(mismatch()),
            },
            CqlType::Inet => match value {
                V::Inet(ip) => V::Inet(ip),
                V::Text(s) => V::Inet(parse(&s)?),
                _ => return Err(mismatch()),
            },
            CqlType::List(element) | CqlType::Set(element) => match value {
                V::List(items) => V::List(
                    items
                        .into_iter()
                        .map(|item| element.convert(item))
                        .collect::<Result<_, _>>()?,
                ),
                _ => return Err(mismatch()),
            },
            CqlType::Map(key_type, value_type) => match value {
                V::Map(pairs) => V::Map(
                    pairs
                        .into_iter()
                        .map(|(k, v)| -> Result<_, String> {
                            Ok((key_type.convert(k)?, value_type.convert(v)?))
                        })
                        .collect::<Result<_, _>>()?,
                ),
                _ => return Err(mismatch()),
            },
        };

        Ok(converted)
    }
}

fn parse<T>(text: &str) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    text.trim()
        .parse()
        .map_err(|e| format!("cannot parse '{text}': {e}"))
}

impl fmt::Display for CqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CqlType::Ascii => write!(f, "ascii"),
            CqlType::Text => write!(f, "text"),
            CqlType::Varchar => write!(f, "varchar"),
            CqlType::Int => write!(f, "int"),
            CqlType::BigInt => write!(f, "bigint"),
            CqlType::Counter => write!(f, "counter"),
            CqlType::SmallInt => write!(f, "smallint"),
            CqlType::TinyInt => write!(f, "tinyint"),
            CqlType::Boolean => write!(f, "boolean"),
            CqlType::Float => write!(f, "float"),
            CqlType::Double => write!(f, "double"),
            CqlType::Timestamp => write!(f, "timestamp"),
            CqlType::Uuid => write!(f, "uuid"),
            CqlType::TimeUuid => write!(f, "timeuuid"),
            CqlType::Blob => write!(f, "blob"),
            CqlType::Inet => write!(f, "inet"),
            CqlType::List(e) => write!(f, "list<{e}>"),
            CqlType::Set(e) => write!(f, "set<{e}>"),
            CqlType::Map(k, v) => write!(f, "map<{k}, {v}>"),
        }
    }
}

/// A single column value read from a record
///
/// Sets and lists share the `List` representation; the column type decides how
/// it is written.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Text(String),
    Int(i32),
    BigInt(i64),
    SmallInt(i16),
    TinyInt(i8),
    Boolean(bool),
    Float(f32),
    Double(f64),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    Blob(Vec<u8>),
    Inet(IpAddr),
    List(Vec<ColumnValue>),
    Map(Vec<(ColumnValue, ColumnValue)>),
}

impl ColumnValue {
    /// Short name of the variant, used in conversion errors
    pub fn kind(&self) -> &'static str {
        match self {
            ColumnValue::Text(_) => "text",
            ColumnValue::Int(_) => "int",
            ColumnValue::BigInt(_) => "bigint",
            ColumnValue::SmallInt(_) => "smallint",
            ColumnValue::TinyInt(_) => "tinyint",
            ColumnValue::Boolean(_) => "boolean",
            ColumnValue::Float(_) => "float",
            ColumnValue::Double(_) => "double",
            ColumnValue::Timestamp(_) => "timestamp",
            ColumnValue::Uuid(_) => "uuid",
            ColumnValue::Blob(_) => "blob",
            ColumnValue::Inet(_) => "inet",
            ColumnValue::List(_) => "list",
            ColumnValue::Map(_) => "map",
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Int(n) => Some(*n as i64),
            ColumnValue::BigInt(n) => Some(*n),
            ColumnValue::SmallInt(n) => Some(*n as i64),
            ColumnValue::TinyInt(n) => Some(*n as i64),
            _ => None,
        }
    }

    /// Rough in-memory size, used for cheap record size estimates
    pub fn estimated_size(&self) -> usize {
        match self {
            ColumnValue::Text(s) => s.len(),
            ColumnValue::Int(_) | ColumnValue::Float(_) => 4,
            ColumnValue::BigInt(_) | ColumnValue::Double(_) | ColumnValue::Timestamp(_) => 8,
            ColumnValue::SmallInt(_) => 2,
            ColumnValue::TinyInt(_) | ColumnValue::Boolean(_) => 1,
            ColumnValue::Uuid(_) => 16,
            ColumnValue::Blob(b) => b.len(),
            ColumnValue::Inet(IpAddr::V4(_)) => 4,
            ColumnValue::Inet(IpAddr::V6(_)) => 16,
            ColumnValue::List(items) => items.iter().map(|v| 4 + v.estimated_size()).sum(),
            ColumnValue::Map(pairs) => pairs
                .iter()
                .map(|(k, v)| 8 + k.estimated_size() + v.estimated_size())
                .sum(),
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Text(s) => write!(f, "{s}"),
            ColumnValue::Int(n) => write!(f, "{n}"),
            ColumnValue::BigInt(n) => write!(f, "{n}"),
            ColumnValue::SmallInt(n) => write!(f, "{n}"),
            ColumnValue::TinyInt(n) => write!(f, "{n}"),
            ColumnValue::Boolean(b) => write!(f, "{b}"),
            ColumnValue::Float(x) => write!(f, "{x}"),
            ColumnValue::Double(x) => write!(f, "{x}"),
            ColumnValue::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            ColumnValue::Uuid(u) => write!(f, "{u}"),
            ColumnValue::Blob(bytes) => {
                write!(f, "0x")?;
                bytes.iter().try_for_each(|b| write!(f, "{b:02x}"))
            }
            ColumnValue::Inet(ip) => write!(f, "{ip}"),
            ColumnValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            ColumnValue::Map(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for ColumnValue {
            fn from(value: $ty) -> Self {
                ColumnValue::$variant(value)
            }
        })*
    };
}

impl_from! {
    String => Text,
    i32 => Int,
    i64 => BigInt,
    i16 => SmallInt,
    i8 => TinyInt,
    bool => Boolean,
    f32 => Float,
    f64 => Double,
    DateTime<Utc> => Timestamp,
    Uuid => Uuid,
    Vec<u8> => Blob,
    IpAddr => Inet,
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        ColumnValue::Text(value.to_string())
    }
}
