//! Column types, record values and their wire encoding

pub mod codec;
mod value;

pub use codec::ProtocolVersion;
pub use value::{ColumnValue, CqlType};
