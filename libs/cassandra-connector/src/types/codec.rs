//! Native protocol value encoding
//!
//! Values are written in the big-endian layouts of the CQL binary protocol.
//! Collections are prefixed with their element count and every element with
//! its byte length; protocol v2 uses 16-bit sizes there, v3 and later 32-bit.
//!
//! The encoded length of a bound value is what batch sizing measures. Drivers
//! may encode values themselves (the scylla adapter hands them over as
//! `CqlValue`s); both follow the same protocol layouts, so the sizes agree.

#[cfg(test)]
use chrono::DateTime;
use std::net::IpAddr;
#[cfg(test)]
use std::net::{Ipv4Addr, Ipv6Addr};
#[cfg(test)]
use uuid::Uuid;

use super::{ColumnValue, CqlType};

/// Negotiated native protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V2 = 2,
    V3 = 3,
    V4 = 4,
    V5 = 5,
}

impl ProtocolVersion {
    fn uses_short_sizes(self) -> bool {
        self == ProtocolVersion::V2
    }
}

/// Serialize a converted value for a column of type `cql_type`
pub fn serialize(
    value: &ColumnValue,
    cql_type: &CqlType,
    version: ProtocolVersion,
) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    write_value(&mut out, value, cql_type, version)?;
    Ok(out)
}

fn write_value(
    out: &mut Vec<u8>,
    value: &ColumnValue,
    cql_type: &CqlType,
    version: ProtocolVersion,
) -> Result<(), String> {
    use ColumnValue as V;

    match (cql_type, value) {
        (CqlType::Ascii | CqlType::Text | CqlType::Varchar, V::Text(s)) => {
            out.extend_from_slice(s.as_bytes())
        }
        (CqlType::Int, V::Int(n)) => out.extend_from_slice(&n.to_be_bytes()),
        (CqlType::BigInt | CqlType::Counter, V::BigInt(n)) => {
            out.extend_from_slice(&n.to_be_bytes())
        }
        (CqlType::SmallInt, V::SmallInt(n)) => {
            require_v4(cql_type, version)?;
            out.extend_from_slice(&n.to_be_bytes())
        }
        (CqlType::TinyInt, V::TinyInt(n)) => {
            require_v4(cql_type, version)?;
            out.extend_from_slice(&n.to_be_bytes())
        }
        (CqlType::Boolean, V::Boolean(b)) => out.push(u8::from(*b)),
        (CqlType::Float, V::Float(x)) => out.extend_from_slice(&x.to_be_bytes()),
        (CqlType::Double, V::Double(x)) => out.extend_from_slice(&x.to_be_bytes()),
        (CqlType::Timestamp, V::Timestamp(t)) => {
            out.extend_from_slice(&t.timestamp_millis().to_be_bytes())
        }
        (CqlType::Uuid | CqlType::TimeUuid, V::Uuid(u)) => out.extend_from_slice(u.as_bytes()),
        (CqlType::Blob, V::Blob(bytes)) => out.extend_from_slice(bytes),
        (CqlType::Inet, V::Inet(IpAddr::V4(ip))) => out.extend_from_slice(&ip.octets()),
        (CqlType::Inet, V::Inet(IpAddr::V6(ip))) => out.extend_from_slice(&ip.octets()),
        (CqlType::List(element) | CqlType::Set(element), V::List(items)) => {
            write_size(out, items.len(), version)?;
            for item in items {
                write_element(out, item, element, version)?;
            }
        }
        (CqlType::Map(key_type, value_type), V::Map(pairs)) => {
            write_size(out, pairs.len(), version)?;
            for (k, v) in pairs {
                write_element(out, k, key_type, version)?;
                write_element(out, v, value_type, version)?;
            }
        }
        _ => return Err(format!("{} value does not match column type {cql_type}", value.kind())),
    }

    Ok(())
}

fn write_element(
    out: &mut Vec<u8>,
    value: &ColumnValue,
    cql_type: &CqlType,
    version: ProtocolVersion,
) -> Result<(), String> {
    let bytes = serialize(value, cql_type, version)?;
    write_size(out, bytes.len(), version)?;
    out.extend_from_slice(&bytes);
    Ok(())
}

fn write_size(out: &mut Vec<u8>, size: usize, version: ProtocolVersion) -> Result<(), String> {
    if version.uses_short_sizes() {
        let size = u16::try_from(size).map_err(|_| format!("size {size} exceeds protocol v2 limit"))?;
        out.extend_from_slice(&size.to_be_bytes());
    } else {
        let size = i32::try_from(size).map_err(|_| format!("size {size} exceeds i32"))?;
        out.extend_from_slice(&size.to_be_bytes());
    }
    Ok(())
}

fn require_v4(cql_type: &CqlType, version: ProtocolVersion) -> Result<(), String> {
    if version < ProtocolVersion::V4 {
        return Err(format!("{cql_type} requires protocol v4 or later, negotiated {version:?}"));
    }
    Ok(())
}

/// Decode bytes produced by [`serialize`] back into a value
#[cfg(test)]
pub(crate) fn deserialize(
    bytes: &[u8],
    cql_type: &CqlType,
    version: ProtocolVersion,
) -> Result<ColumnValue, String> {
    let mut reader = Reader { bytes, pos: 0 };
    let value = reader.read_value(cql_type, version, bytes.len())?;
    if reader.pos != bytes.len() {
        return Err(format!("{} trailing byte(s) after {cql_type}", bytes.len() - reader.pos));
    }
    Ok(value)
}

#[cfg(test)]
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

#[cfg(test)]
impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.bytes.len());
        let end = end.ok_or_else(|| format!("expected {n} byte(s) at offset {}", self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], String> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn read_size(&mut self, version: ProtocolVersion) -> Result<usize, String> {
        if version.uses_short_sizes() {
            Ok(u16::from_be_bytes(self.array()?) as usize)
        } else {
            let size = i32::from_be_bytes(self.array()?);
            usize::try_from(size).map_err(|_| format!("negative size {size}"))
        }
    }

    fn read_element(&mut self, cql_type: &CqlType, version: ProtocolVersion) -> Result<ColumnValue, String> {
        let len = self.read_size(version)?;
        let slice = self.take(len)?;
        deserialize(slice, cql_type, version)
    }

    fn read_value(
        &mut self,
        cql_type: &CqlType,
        version: ProtocolVersion,
        len: usize,
    ) -> Result<ColumnValue, String> {
        use ColumnValue as V;

        let value = match cql_type {
            CqlType::Ascii | CqlType::Text | CqlType::Varchar => V::Text(
                String::from_utf8(self.take(len)?.to_vec()).map_err(|e| e.to_string())?,
            ),
            CqlType::Int => V::Int(i32::from_be_bytes(self.array()?)),
            CqlType::BigInt | CqlType::Counter => V::BigInt(i64::from_be_bytes(self.array()?)),
            CqlType::SmallInt => V::SmallInt(i16::from_be_bytes(self.array()?)),
            CqlType::TinyInt => V::TinyInt(i8::from_be_bytes(self.array()?)),
            CqlType::Boolean => V::Boolean(self.array::<1>()?[0] != 0),
            CqlType::Float => V::Float(f32::from_be_bytes(self.array()?)),
            CqlType::Double => V::Double(f64::from_be_bytes(self.array()?)),
            CqlType::Timestamp => {
                let millis = i64::from_be_bytes(self.array()?);
                V::Timestamp(
                    DateTime::from_timestamp_millis(millis)
                        .ok_or_else(|| format!("timestamp {millis} out of range"))?,
                )
            }
            CqlType::Uuid | CqlType::TimeUuid => V::Uuid(Uuid::from_bytes(self.array()?)),
            CqlType::Blob => V::Blob(self.take(len)?.to_vec()),
            CqlType::Inet => match len {
                4 => V::Inet(IpAddr::V4(Ipv4Addr::from(self.array::<4>()?))),
                16 => V::Inet(IpAddr::V6(Ipv6Addr::from(self.array::<16>()?))),
                other => return Err(format!("invalid inet length {other}")),
            },
            CqlType::List(element) | CqlType::Set(element) => {
                let count = self.read_size(version)?;
                let items = (0..count)
                    .map(|_| self.read_element(element, version))
                    .collect::<Result<_, _>>()?;
                V::List(items)
            }
            CqlType::Map(key_type, value_type) => {
                let count = self.read_size(version)?;
                let mut pairs = Vec::with_capacity(count);
                for _ in 0..count {
                    let k = self.read_element(key_type, version)?;
                    let v = self.read_element(value_type, version)?;
                    pairs.push((k, v));
                }
                V::Map(pairs)
            }
        };

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_layouts() {
        let v4 = ProtocolVersion::V4;
        assert_eq!(serialize(&ColumnValue::Int(1), &CqlType::Int, v4).unwrap(), vec![0, 0, 0, 1]);
        assert_eq!(serialize(&ColumnValue::BigInt(-1), &CqlType::BigInt, v4).unwrap(), vec![0xff; 8]);
        assert_eq!(serialize(&ColumnValue::Boolean(true), &CqlType::Boolean, v4).unwrap(), vec![1]);
        assert_eq!(serialize(&"héllo".into(), &CqlType::Text, v4).unwrap().len(), 6);
    }

    #[test]
    fn test_collection_size_width_depends_on_version() {
        let list = ColumnValue::List(vec![ColumnValue::Int(7)]);
        let ty = CqlType::list(CqlType::Int);

        let v2 = serialize(&list, &ty, ProtocolVersion::V2).unwrap();
        assert_eq!(v2, vec![0, 1, 0, 4, 0, 0, 0, 7]);

        let v3 = serialize(&list, &ty, ProtocolVersion::V3).unwrap();
        assert_eq!(v3, vec![0, 0, 0, 1, 0, 0, 0, 4, 0, 0, 0, 7]);
    }

    #[test]
    fn test_small_ints_need_v4() {
        assert!(serialize(&ColumnValue::SmallInt(1), &CqlType::SmallInt, ProtocolVersion::V3).is_err());
        assert_eq!(
            serialize(&ColumnValue::TinyInt(-2), &CqlType::TinyInt, ProtocolVersion::V4).unwrap(),
            vec![0xfe]
        );
    }

    #[test]
    fn test_mismatched_value_is_rejected() {
        let err = serialize(&ColumnValue::Int(1), &CqlType::Text, ProtocolVersion::V4).unwrap_err();
        assert!(err.contains("does not match"));
    }

    #[test]
    fn test_map_and_inet_decode() {
        let version = ProtocolVersion::V4;
        let ty = CqlType::map(CqlType::Text, CqlType::Inet);
        let value = ColumnValue::Map(vec![
            ("a".into(), ColumnValue::Inet("10.0.0.1".parse().unwrap())),
            ("b".into(), ColumnValue::Inet("::1".parse().unwrap())),
        ]);

        let bytes = serialize(&value, &ty, version).unwrap();
        assert_eq!(deserialize(&bytes, &ty, version).unwrap(), value);
    }

    #[test]
    fn test_truncated_input_fails() {
        assert!(deserialize(&[0, 0, 1], &CqlType::Int, ProtocolVersion::V4).is_err());
        assert!(deserialize(&[0, 0, 0, 1, 9], &CqlType::Int, ProtocolVersion::V4).is_err());
    }
}
