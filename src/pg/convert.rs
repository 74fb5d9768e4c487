//! Text-format column value conversion.
//!
//! Each function takes the column's declared type and the raw bytes the
//! server sent, and either produces the requested Rust value or a
//! `PgError::Conversion`. NULL never reaches these functions.

use std::str::FromStr;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::error::{PgError, PgResult};
use super::types::Oid;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

fn text(data: &[u8]) -> PgResult<&str> {
    std::str::from_utf8(data).map_err(|_| PgError::conversion("Column value is not valid UTF-8"))
}

/// Reject columns whose declared type cannot produce `target`.
fn accept(oid: Oid, allowed: bool, target: &str) -> PgResult<()> {
    if allowed || oid.is_text_like() {
        Ok(())
    } else {
        Err(PgError::conversion(format!(
            "Cannot convert {} to {}",
            oid.name(),
            target
        )))
    }
}

fn invalid(value: &str, target: &str) -> PgError {
    PgError::conversion(format!("Invalid {} value: '{}'", target, value))
}

pub(crate) fn to_string(_oid: Oid, data: &[u8]) -> PgResult<String> {
    text(data).map(str::to_string)
}

pub(crate) fn to_char(oid: Oid, data: &[u8]) -> PgResult<char> {
    accept(oid, false, "char")?;
    let s = text(data)?;
    let mut chars = s.trim_end_matches(' ').chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        // A blank CHAR(1) is trimmed to nothing
        (None, _) if !s.is_empty() => Ok(' '),
        _ => Err(invalid(s, "char")),
    }
}

pub(crate) fn to_bool(oid: Oid, data: &[u8]) -> PgResult<bool> {
    accept(oid, oid == Oid::BOOL, "bool")?;
    match text(data)? {
        "t" | "true" => Ok(true),
        "f" | "false" => Ok(false),
        other => Err(invalid(other, "bool")),
    }
}

pub(crate) fn to_integer<T>(oid: Oid, data: &[u8]) -> PgResult<T>
where
    T: FromStr,
{
    let target = std::any::type_name::<T>();
    accept(oid, oid.is_integer() || oid == Oid::NUMERIC, target)?;
    let s = text(data)?;
    s.trim()
        .parse::<T>()
        .map_err(|_| invalid(s, target))
}

pub(crate) fn to_decimal(oid: Oid, data: &[u8]) -> PgResult<Decimal> {
    accept(
        oid,
        oid.is_integer() || oid.is_float() || oid == Oid::NUMERIC,
        "decimal",
    )?;
    let s = text(data)?.trim();
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .map_err(|_| invalid(s, "decimal"))
}

pub(crate) fn to_float<T>(oid: Oid, data: &[u8]) -> PgResult<T>
where
    T: FromStr,
{
    let target = std::any::type_name::<T>();
    accept(
        oid,
        oid.is_integer() || oid.is_float() || oid == Oid::NUMERIC,
        target,
    )?;
    // Rust's float parser accepts "Infinity", "-Infinity" and "NaN"
    let s = text(data)?;
    s.trim().parse::<T>().map_err(|_| invalid(s, target))
}

pub(crate) fn to_date(oid: Oid, data: &[u8]) -> PgResult<NaiveDate> {
    accept(
        oid,
        matches!(oid, Oid::DATE | Oid::TIMESTAMP | Oid::TIMESTAMPTZ),
        "date",
    )?;
    let s = text(data)?;
    s.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, DATE_FORMAT).ok())
        .ok_or_else(|| invalid(s, "date"))
}

pub(crate) fn to_time(oid: Oid, data: &[u8]) -> PgResult<NaiveTime> {
    accept(oid, matches!(oid, Oid::TIME | Oid::TIMETZ), "time")?;
    let s = text(data)?;
    let (local, offset) = split_offset(s, 0).ok_or_else(|| invalid(s, "time"))?;
    let time = NaiveTime::parse_from_str(local, TIME_FORMAT).map_err(|_| invalid(s, "time"))?;
    // Wrap around midnight; the day carry is irrelevant for a time of day
    let (utc, _) = time.overflowing_sub_signed(offset);
    Ok(utc)
}

pub(crate) fn to_timestamp(oid: Oid, data: &[u8]) -> PgResult<NaiveDateTime> {
    accept(
        oid,
        matches!(oid, Oid::TIMESTAMP | Oid::TIMESTAMPTZ),
        "timestamp",
    )?;
    let s = text(data)?;
    // The date part contains '-' separators, so offsets are searched after it
    let (local, offset) = split_offset(s, 10).ok_or_else(|| invalid(s, "timestamp"))?;
    let timestamp = NaiveDateTime::parse_from_str(local, TIMESTAMP_FORMAT)
        .map_err(|_| invalid(s, "timestamp"))?;
    timestamp
        .checked_sub_signed(offset)
        .ok_or_else(|| invalid(s, "timestamp"))
}

/// Split a trailing UTC offset (`Z`, `+HH`, `-HH:MM`, `+HH:MM:SS`) off `s`,
/// looking for the sign at or after byte `from`.
fn split_offset(s: &str, from: usize) -> Option<(&str, Duration)> {
    if let Some(local) = s.strip_suffix('Z') {
        return Some((local, Duration::zero()));
    }
    let Some(pos) = s.get(from..)?.rfind(['+', '-']).map(|p| p + from) else {
        return Some((s, Duration::zero()));
    };

    let (local, offset) = s.split_at(pos);
    let sign = if offset.starts_with('-') { -1 } else { 1 };
    let mut seconds = 0i64;
    for (i, part) in offset[1..].split(':').enumerate() {
        if i > 2 || part.len() != 2 {
            return None;
        }
        let n: i64 = part.parse().ok()?;
        seconds += n * [3600, 60, 1][i];
    }
    Some((local, Duration::seconds(sign * seconds)))
}

pub(crate) fn to_bytes(oid: Oid, data: &[u8]) -> PgResult<Vec<u8>> {
    accept(oid, oid == Oid::BYTEA, "bytes")?;
    match data.strip_prefix(b"\\x") {
        Some(hex) => decode_hex(hex),
        None => decode_escape(data),
    }
}

fn decode_hex(hex: &[u8]) -> PgResult<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(PgError::conversion("Odd number of hex digits in bytea"));
    }
    hex.chunks_exact(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                .ok_or_else(|| PgError::conversion("Invalid hex digit in bytea"))
        })
        .collect()
}

/// Legacy escape format: `\\` for a backslash, `\ooo` for an octal byte.
fn decode_escape(data: &[u8]) -> PgResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] != b'\\' {
            out.push(data[i]);
            i += 1;
        } else if data.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
        } else {
            let byte = data
                .get(i + 1..i + 4)
                .filter(|oct| oct.iter().all(|b| (b'0'..=b'7').contains(b)))
                .map(|oct| oct.iter().fold(0u16, |acc, b| acc * 8 + u16::from(b - b'0')))
                .and_then(|n| u8::try_from(n).ok())
                .ok_or_else(|| PgError::conversion("Invalid escape sequence in bytea"))?;
            out.push(byte);
            i += 4;
        }
    }
    Ok(out)
}

pub(crate) fn to_uuid(oid: Oid, data: &[u8]) -> PgResult<Uuid> {
    accept(oid, oid == Oid::UUID, "uuid")?;
    let s = text(data)?;
    Uuid::parse_str(s).map_err(|_| invalid(s, "uuid"))
}

pub(crate) fn to_json(oid: Oid, data: &[u8]) -> PgResult<serde_json::Value> {
    accept(oid, matches!(oid, Oid::JSON | Oid::JSONB), "json")?;
    serde_json::from_slice(data).map_err(|e| PgError::conversion(format!("Invalid json: {}", e)))
}
