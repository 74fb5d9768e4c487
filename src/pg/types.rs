//! PostgreSQL type identifiers and query parameter values.
//!
//! Parameters travel in text format: every [`Value`] renders itself the way
//! the server's input functions expect, and the server infers the type.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use bytes::Bytes;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    /// Lets the server infer the parameter type.
    pub const UNSPECIFIED: Oid = Oid(0);

    // Boolean types
    pub const BOOL: Oid = Oid(16);

    // Binary data
    pub const BYTEA: Oid = Oid(17);

    // Character types
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);

    // Text types
    pub const TEXT: Oid = Oid(25);

    // OID type
    pub const OID_TYPE: Oid = Oid(26);

    // Floating point types
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);

    /// Type of an untyped literal such as `select 'test'`.
    pub const UNKNOWN: Oid = Oid(705);

    // String types
    pub const VARCHAR: Oid = Oid(1043);
    pub const BPCHAR: Oid = Oid(1042);

    // Date/time types
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const TIMETZ: Oid = Oid(1266);

    // UUID
    pub const UUID: Oid = Oid(2950);

    // JSON types
    pub const JSON: Oid = Oid(114);
    pub const JSONB: Oid = Oid(3802);

    // Numeric
    pub const NUMERIC: Oid = Oid(1700);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID_TYPE)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }

    /// SQL name of the type, used in conversion errors.
    pub fn name(self) -> &'static str {
        match self {
            Oid::BOOL => "bool",
            Oid::BYTEA => "bytea",
            Oid::CHAR => "char",
            Oid::NAME => "name",
            Oid::INT8 => "int8",
            Oid::INT2 => "int2",
            Oid::INT4 => "int4",
            Oid::TEXT => "text",
            Oid::OID_TYPE => "oid",
            Oid::FLOAT4 => "float4",
            Oid::FLOAT8 => "float8",
            Oid::UNKNOWN => "unknown",
            Oid::VARCHAR => "varchar",
            Oid::BPCHAR => "bpchar",
            Oid::DATE => "date",
            Oid::TIME => "time",
            Oid::TIMESTAMP => "timestamp",
            Oid::TIMESTAMPTZ => "timestamptz",
            Oid::INTERVAL => "interval",
            Oid::TIMETZ => "timetz",
            Oid::UUID => "uuid",
            Oid::JSON => "json",
            Oid::JSONB => "jsonb",
            Oid::NUMERIC => "numeric",
            _ => "other",
        }
    }
}

// ============================================================================
// Parameter Values
// ============================================================================

/// A query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(Decimal),
    Text(String),
    Bytea(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    Uuid(Uuid),
    Json(serde_json::Value),
}

impl Value {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render the value in PostgreSQL text format, `None` for NULL.
    pub fn encode_text(&self) -> Option<Bytes> {
        let text = match self {
            Value::Null => return None,
            Value::Bool(v) => (if *v { "t" } else { "f" }).to_string(),
            Value::Int2(v) => v.to_string(),
            Value::Int4(v) => v.to_string(),
            Value::Int8(v) => v.to_string(),
            Value::Float4(v) if v.is_finite() => v.to_string(),
            Value::Float8(v) if v.is_finite() => v.to_string(),
            Value::Float4(v) => special_float(f64::from(*v)),
            Value::Float8(v) => special_float(*v),
            Value::Numeric(v) => v.to_string(),
            Value::Text(v) => v.clone(),
            Value::Bytea(v) => hex_text(v),
            Value::Date(v) => v.format("%Y-%m-%d").to_string(),
            Value::Time(v) => v.format("%H:%M:%S%.f").to_string(),
            Value::Timestamp(v) => v.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            Value::Uuid(v) => v.hyphenated().to_string(),
            Value::Json(v) => v.to_string(),
        };
        Some(Bytes::from(text))
    }
}

/// Spelling the server accepts for non-finite floats.
fn special_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v > 0.0 {
        "Infinity".to_string()
    } else {
        "-Infinity".to_string()
    }
}

/// BYTEA hex format: `\x` followed by two lowercase hex digits per byte.
fn hex_text(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        // Writing to a String cannot fail
        let _ = write!(out, "{:02x}", b);
    }
    out
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    Decimal => Numeric,
    String => Text,
    &str => Text,
    Vec<u8> => Bytea,
    &[u8] => Bytea,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => Timestamp,
    Uuid => Uuid,
    serde_json::Value => Json,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
