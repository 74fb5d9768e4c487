//! Query results.
//!
//! - `ResultBuilder`: accumulates protocol events for the operation in flight
//! - `ResultSet`: the finished, read-only result handed to the caller
//! - `Row`: raw column values, converted on demand by the typed getters

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::convert;
use super::error::{PgError, PgResult};
use super::protocol::{FieldDescription, RowValues};
use super::types::Oid;

// ============================================================================
// Columns
// ============================================================================

/// Column metadata shared by a result set and all of its rows.
#[derive(Debug, Default)]
pub struct Columns {
    fields: Vec<FieldDescription>,
    /// Lowercased column name -> first column index with that name
    by_name: HashMap<String, usize>,
}

impl Columns {
    fn new(fields: Vec<FieldDescription>) -> Self {
        let mut by_name = HashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            by_name.entry(field.name.to_lowercase()).or_insert(i);
        }
        Self { fields, by_name }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FieldDescription> {
        self.fields.get(index)
    }

    /// Index of the first column named `name`, ignoring case.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(&name.to_lowercase()).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldDescription> {
        self.fields.iter()
    }
}

/// Something that selects a column: a position or a column name.
pub trait ColumnIndex {
    fn position(&self, columns: &Columns) -> PgResult<usize>;
}

impl ColumnIndex for usize {
    fn position(&self, columns: &Columns) -> PgResult<usize> {
        if *self < columns.len() {
            Ok(*self)
        } else {
            Err(PgError::conversion(format!(
                "Column index {} out of range (0..{})",
                self,
                columns.len()
            )))
        }
    }
}

impl ColumnIndex for str {
    fn position(&self, columns: &Columns) -> PgResult<usize> {
        columns
            .index_of(self)
            .ok_or_else(|| PgError::conversion(format!("Unknown column: {}", self)))
    }
}

impl ColumnIndex for String {
    fn position(&self, columns: &Columns) -> PgResult<usize> {
        self.as_str().position(columns)
    }
}

impl<T: ColumnIndex + ?Sized> ColumnIndex for &T {
    fn position(&self, columns: &Columns) -> PgResult<usize> {
        (**self).position(columns)
    }
}

// ============================================================================
// Result Accumulator
// ============================================================================

/// Builds the result of the operation in flight from protocol events.
#[derive(Debug)]
pub(crate) struct ResultBuilder {
    columns: Arc<Columns>,
    rows: Vec<Row>,
    command_tag: String,
    updated_rows: u64,
}

impl ResultBuilder {
    /// Seeded from a RowDescription.
    pub(crate) fn new(fields: Vec<FieldDescription>) -> Self {
        Self {
            columns: Arc::new(Columns::new(fields)),
            rows: Vec::new(),
            command_tag: String::new(),
            updated_rows: 0,
        }
    }

    /// For statements that return no rows.
    pub(crate) fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub(crate) fn push_row(&mut self, values: RowValues) {
        self.rows.push(Row {
            values,
            columns: Arc::clone(&self.columns),
        });
    }

    pub(crate) fn complete(&mut self, tag: String) {
        self.updated_rows = updated_rows(&tag);
        self.command_tag = tag;
    }

    pub(crate) fn finish(self) -> ResultSet {
        ResultSet {
            columns: self.columns,
            rows: self.rows,
            command_tag: self.command_tag,
            updated_rows: self.updated_rows,
        }
    }
}

/// Row count carried by a command tag: the last word when numeric.
///
/// `INSERT 0 3` -> 3, `SELECT 2` -> 2, `BEGIN` -> 0.
fn updated_rows(tag: &str) -> u64 {
    tag.rsplit(' ')
        .next()
        .and_then(|last| last.parse().ok())
        .unwrap_or(0)
}

// ============================================================================
// Result Set
// ============================================================================

/// Result of a query execution.
#[derive(Debug, Default)]
pub struct ResultSet {
    columns: Arc<Columns>,
    rows: Vec<Row>,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    command_tag: String,
    updated_rows: u64,
}

impl ResultSet {
    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&Row> {
        self.rows.get(index)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    pub fn command_tag(&self) -> &str {
        &self.command_tag
    }

    /// Rows affected by a DML statement (or returned by a SELECT).
    pub fn updated_rows(&self) -> u64 {
        self.updated_rows
    }
}

impl std::ops::Index<usize> for ResultSet {
    type Output = Row;

    fn index(&self, index: usize) -> &Row {
        &self.rows[index]
    }
}

impl IntoIterator for ResultSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

// ============================================================================
// Row
// ============================================================================

/// One row of text-format column values.
#[derive(Debug, Clone)]
pub struct Row {
    values: RowValues,
    columns: Arc<Columns>,
}

impl Row {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    /// Raw wire bytes of a column, `None` for NULL.
    pub fn raw<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<Option<&Bytes>> {
        let i = index.position(&self.columns)?;
        self.values
            .get(i)
            .map(Option::as_ref)
            .ok_or_else(|| PgError::conversion(format!("Row has no value for column {}", i)))
    }

    pub fn is_null<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<bool> {
        Ok(self.raw(index)?.is_none())
    }

    /// Look up a cell and run `conv` on it unless it is NULL.
    fn convert<I, T>(&self, index: &I, conv: fn(Oid, &[u8]) -> PgResult<T>) -> PgResult<Option<T>>
    where
        I: ColumnIndex + ?Sized,
    {
        let i = index.position(&self.columns)?;
        let oid = self
            .columns
            .get(i)
            .map(|f| f.type_oid)
            .unwrap_or(Oid::UNKNOWN);
        match self.values.get(i) {
            Some(Some(data)) => conv(oid, data).map(Some),
            Some(None) => Ok(None),
            None => Err(PgError::conversion(format!(
                "Row has no value for column {}",
                i
            ))),
        }
    }

    pub fn get_string<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<Option<String>> {
        self.convert(index, convert::to_string)
    }

    pub fn get_char<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<Option<char>> {
        self.convert(index, convert::to_char)
    }

    pub fn get_bool<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<Option<bool>> {
        self.convert(index, convert::to_bool)
    }

    pub fn get_i8<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<Option<i8>> {
        self.convert(index, convert::to_integer::<i8>)
    }

    pub fn get_i16<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<Option<i16>> {
        self.convert(index, convert::to_integer::<i16>)
    }

    pub fn get_i32<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<Option<i32>> {
        self.convert(index, convert::to_integer::<i32>)
    }

    pub fn get_i64<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<Option<i64>> {
        self.convert(index, convert::to_integer::<i64>)
    }

    /// Integers wider than INT8, e.g. large NUMERIC values.
    pub fn get_i128<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<Option<i128>> {
        self.convert(index, convert::to_integer::<i128>)
    }

    pub fn get_decimal<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<Option<Decimal>> {
        self.convert(index, convert::to_decimal)
    }

    pub fn get_f32<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<Option<f32>> {
        self.convert(index, convert::to_float::<f32>)
    }

    pub fn get_f64<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<Option<f64>> {
        self.convert(index, convert::to_float::<f64>)
    }

    pub fn get_date<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<Option<NaiveDate>> {
        self.convert(index, convert::to_date)
    }

    /// Time of day. Zoned values are shifted to UTC.
    pub fn get_time<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<Option<NaiveTime>> {
        self.convert(index, convert::to_time)
    }

    /// Timestamp. Zoned values are shifted to UTC.
    pub fn get_timestamp<I: ColumnIndex + ?Sized>(
        &self,
        index: &I,
    ) -> PgResult<Option<NaiveDateTime>> {
        self.convert(index, convert::to_timestamp)
    }

    pub fn get_bytes<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<Option<Vec<u8>>> {
        self.convert(index, convert::to_bytes)
    }

    pub fn get_uuid<I: ColumnIndex + ?Sized>(&self, index: &I) -> PgResult<Option<Uuid>> {
        self.convert(index, convert::to_uuid)
    }

    pub fn get_json<I: ColumnIndex + ?Sized>(
        &self,
        index: &I,
    ) -> PgResult<Option<serde_json::Value>> {
        self.convert(index, convert::to_json)
    }
}
