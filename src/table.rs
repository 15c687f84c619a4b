//! Tabular carriers for partitioned pipeline data.
//!
//! Two shapes travel through the pipeline:
//! - [`FeatureTable`]: the numeric, feature-engineered view of one partition that
//!   models are fitted on.
//! - [`RecordTable`]: the original record set of one partition (mixed types) that
//!   receives the cluster label column.
//!
//! Both are keyed by partition name in a [`Partitioned`] map. Writers that need a
//! single table go through [`flatten_partitions`]; sources that deliver a single
//! table go through [`split_partitions`].

use std::collections::BTreeMap;
use std::fmt;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Partition name → per-partition payload. Ordered so every stage iterates the same way.
pub type Partitioned<T> = BTreeMap<String, T>;
pub type PartitionedFeatures = Partitioned<FeatureTable>;
pub type PartitionedRecords = Partitioned<RecordTable>;

#[derive(Debug, Error, PartialEq)]
pub enum TableError {
    #[error("column not found: {0}")]
    MissingColumn(String),
    #[error("column already present: {0}")]
    DuplicateColumn(String),
    #[error("row {row} has {found} cells, expected {expected}")]
    RowWidth {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("column has {found} values, table has {expected} rows")]
    LengthMismatch { expected: usize, found: usize },
    #[error("column {column} holds a non-numeric value at row {row}")]
    NonNumeric { column: String, row: usize },
    #[error("row {row} has no usable partition key in column {column}")]
    InvalidKey { column: String, row: usize },
    #[error("partition key column {column} mixes value types at row {row}")]
    MixedKeyTypes { column: String, row: usize },
    #[error("row {row} is not a JSON object")]
    NotAnObject { row: usize },
    #[error("feature matrix has {found} columns but {expected} names")]
    Shape { expected: usize, found: usize },
}

/// A single value of a record table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    /// Numeric view used when building feature matrices. Null maps to NaN.
    #[must_use]
    pub fn as_feature(&self) -> Option<f64> {
        match self {
            Cell::Null => Some(f64::NAN),
            Cell::Int(v) => Some(*v as f64),
            Cell::Float(v) => Some(*v),
            Cell::Bool(_) | Cell::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn from_json(value: Value) -> Self {
        match value {
            Value::Null => Cell::Null,
            Value::Bool(b) => Cell::Bool(b),
            Value::Number(n) => n
                .as_i64()
                .map(Cell::Int)
                .or_else(|| n.as_f64().map(Cell::Float))
                .unwrap_or(Cell::Null),
            Value::String(s) => Cell::Text(s),
            other => Cell::Text(other.to_string()),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Cell::Null => Value::Null,
            Cell::Bool(b) => Value::Bool(*b),
            Cell::Int(v) => Value::from(*v),
            Cell::Float(v) => serde_json::Number::from_f64(*v).map_or(Value::Null, Value::Number),
            Cell::Text(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => f.write_str("null"),
            Cell::Bool(b) => write!(f, "{b}"),
            Cell::Int(v) => write!(f, "{v}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Int(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Float(value)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::Bool(value)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(value: Option<T>) -> Self {
        value.map_or(Cell::Null, Into::into)
    }
}

/// Row-major table with named columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordTable {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl RecordTable {
    #[must_use]
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Result<Self, TableError> {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), TableError> {
        if row.len() != self.columns.len() {
            return Err(TableError::RowWidth {
                row: self.rows.len(),
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Result<Vec<&Cell>, TableError> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| TableError::MissingColumn(name.to_string()))?;
        Ok(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Returns a copy with `values` appended as a new last column.
    pub fn with_column(&self, name: &str, values: Vec<Cell>) -> Result<Self, TableError> {
        if self.column_index(name).is_some() {
            return Err(TableError::DuplicateColumn(name.to_string()));
        }
        if values.len() != self.rows.len() {
            return Err(TableError::LengthMismatch {
                expected: self.rows.len(),
                found: values.len(),
            });
        }

        let mut columns = self.columns.clone();
        columns.push(name.to_string());
        let rows = self
            .rows
            .iter()
            .zip(values)
            .map(|(row, value)| {
                let mut row = row.clone();
                row.push(value);
                row
            })
            .collect();
        Ok(Self { columns, rows })
    }


    /// Builds the numeric feature view, skipping the `exclude` columns.
    pub fn to_features(&self, exclude: &[&str]) -> Result<FeatureTable, TableError> {
        let keep: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, name)| !exclude.contains(&name.as_str()))
            .map(|(idx, _)| idx)
            .collect();

        let mut values = Array2::<f64>::zeros((self.rows.len(), keep.len()));
        for (r, row) in self.rows.iter().enumerate() {
            for (c, &idx) in keep.iter().enumerate() {
                values[[r, c]] = row[idx].as_feature().ok_or_else(|| TableError::NonNumeric {
                    column: self.columns[idx].clone(),
                    row: r,
                })?;
            }
        }

        let columns = keep.iter().map(|&idx| self.columns[idx].clone()).collect();
        FeatureTable::new(columns, values)
    }

    /// One JSON object per row, in column order.
    #[must_use]
    pub fn to_json_rows(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(name, cell)| (name.clone(), cell.to_json()))
                    .collect()
            })
            .collect()
    }

    /// Inverse of [`RecordTable::to_json_rows`]. Columns are ordered by first appearance;
    /// keys missing from a row become null.
    pub fn from_json_rows(rows: Vec<Value>) -> Result<Self, TableError> {
        let mut objects = Vec::with_capacity(rows.len());
        for (idx, row) in rows.into_iter().enumerate() {
            match row {
                Value::Object(map) => objects.push(map),
                _ => return Err(TableError::NotAnObject { row: idx }),
            }
        }

        let mut columns: Vec<String> = Vec::new();
        for object in &objects {
            for key in object.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = objects
            .into_iter()
            .map(|mut object| {
                columns
                    .iter()
                    .map(|name| object.remove(name).map_or(Cell::Null, Cell::from_json))
                    .collect()
            })
            .collect();
        Ok(Self { columns, rows })
    }
}

/// Numeric feature matrix of one partition, row-aligned with its record table.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    columns: Vec<String>,
    values: Array2<f64>,
}

impl FeatureTable {
    pub fn new(columns: Vec<String>, values: Array2<f64>) -> Result<Self, TableError> {
        if columns.len() != values.ncols() {
            return Err(TableError::Shape {
                expected: columns.len(),
                found: values.ncols(),
            });
        }
        Ok(Self { columns, values })
    }

    pub fn from_rows(columns: Vec<String>, rows: &[Vec<f64>]) -> Result<Self, TableError> {
        let mut values = Array2::<f64>::zeros((rows.len(), columns.len()));
        for (r, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(TableError::RowWidth {
                    row: r,
                    expected: columns.len(),
                    found: row.len(),
                });
            }
            for (c, value) in row.iter().enumerate() {
                values[[r, c]] = *value;
            }
        }
        Ok(Self { columns, values })
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    #[must_use]
    pub fn n_samples(&self) -> usize {
        self.values.nrows()
    }

    #[must_use]
    pub fn n_features(&self) -> usize {
        self.values.ncols()
    }
}

/// Concatenates every partition into one table, adding the partition name as
/// `key_column` after the data columns. Columns are unioned in first-seen order;
/// a partition that lacks a column contributes nulls for it.
pub fn flatten_partitions(
    partitions: &PartitionedRecords,
    key_column: &str,
) -> Result<RecordTable, TableError> {
    let mut columns: Vec<String> = Vec::new();
    for table in partitions.values() {
        if table.column_index(key_column).is_some() {
            return Err(TableError::DuplicateColumn(key_column.to_string()));
        }
        for name in table.columns() {
            if !columns.contains(name) {
                columns.push(name.clone());
            }
        }
    }

    let mut flat_columns = columns.clone();
    flat_columns.push(key_column.to_string());
    let mut flat = RecordTable::new(flat_columns);

    for (partition, table) in partitions {
        let positions: Vec<Option<usize>> =
            columns.iter().map(|name| table.column_index(name)).collect();
        for row in table.rows() {
            let mut out: Vec<Cell> = positions
                .iter()
                .map(|pos| pos.map_or(Cell::Null, |idx| row[idx].clone()))
                .collect();
            out.push(Cell::Text(partition.clone()));
            flat.push_row(out)?;
        }
    }

    Ok(flat)
}

/// Splits a single table into partitions by the value of `key_column`, which is
/// removed from the partition tables. Row order inside a partition is preserved.
pub fn split_partitions(
    table: &RecordTable,
    key_column: &str,
) -> Result<PartitionedRecords, TableError> {
    let key_idx = table
        .column_index(key_column)
        .ok_or_else(|| TableError::MissingColumn(key_column.to_string()))?;
    let columns: Vec<String> = table
        .columns()
        .iter()
        .filter(|name| name.as_str() != key_column)
        .cloned()
        .collect();

    let mut partitions = PartitionedRecords::new();
    let mut key_kind = None;
    for (r, row) in table.rows().iter().enumerate() {
        let kind = std::mem::discriminant(&row[key_idx]);
        if *key_kind.get_or_insert(kind) != kind {
            return Err(TableError::MixedKeyTypes {
                column: key_column.to_string(),
                row: r,
            });
        }
        let key = match &row[key_idx] {
            Cell::Null | Cell::Float(_) => {
                return Err(TableError::InvalidKey {
                    column: key_column.to_string(),
                    row: r,
                });
            }
            other => other.to_string(),
        };
        let mut rest = row.clone();
        rest.remove(key_idx);
        partitions
            .entry(key)
            .or_insert_with(|| RecordTable::new(columns.clone()))
            .push_row(rest)?;
    }
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stores() -> RecordTable {
        RecordTable::from_rows(
            vec!["STORE_NBR".into(), "TOTAL_SALES".into()],
            vec![
                vec![Cell::Int(101), Cell::Float(12.5)],
                vec![Cell::Int(102), Cell::Null],
                vec![Cell::Int(103), Cell::Float(7.0)],
            ],
        )
        .expect("valid table")
    }

    #[test]
    fn push_row_rejects_wrong_width() {
        let mut table = RecordTable::new(vec!["a".into(), "b".into()]);
        let err = table.push_row(vec![Cell::Int(1)]).unwrap_err();
        assert_eq!(
            err,
            TableError::RowWidth {
                row: 0,
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn with_column_appends_and_keeps_original() {
        let table = stores();
        let labeled = table
            .with_column("cluster", vec![Cell::Int(0), Cell::Int(1), Cell::Int(0)])
            .expect("append succeeds");

        assert_eq!(labeled.column_count(), table.column_count() + 1);
        assert_eq!(labeled.row_count(), table.row_count());
        assert_eq!(labeled.columns().last().map(String::as_str), Some("cluster"));
        assert_eq!(labeled.rows()[1][0], Cell::Int(102));
        assert_eq!(table.column_count(), 2);
    }

    #[test]
    fn with_column_rejects_duplicates_and_bad_lengths() {
        let table = stores();
        assert_eq!(
            table.with_column("STORE_NBR", vec![Cell::Null; 3]),
            Err(TableError::DuplicateColumn("STORE_NBR".into()))
        );
        assert_eq!(
            table.with_column("cluster", vec![Cell::Int(0)]),
            Err(TableError::LengthMismatch {
                expected: 3,
                found: 1
            })
        );
    }

    #[test]
    fn to_features_maps_null_to_nan() {
        let features = stores().to_features(&["STORE_NBR"]).expect("numeric");
        assert_eq!(features.columns(), &["TOTAL_SALES".to_string()]);
        assert_eq!(features.n_samples(), 3);
        assert!(features.values()[[1, 0]].is_nan());
        assert!((features.values()[[2, 0]] - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn to_features_rejects_text() {
        let table = RecordTable::from_rows(
            vec!["name".into()],
            vec![vec![Cell::Text("north".into())]],
        )
        .unwrap();
        assert_eq!(
            table.to_features(&[]),
            Err(TableError::NonNumeric {
                column: "name".into(),
                row: 0
            })
        );
    }

    #[test]
    fn flatten_adds_partition_column_and_unions_schemas() {
        let mut partitions = PartitionedRecords::new();
        partitions.insert("drinks".into(), stores());
        partitions.insert(
            "snacks".into(),
            RecordTable::from_rows(
                vec!["STORE_NBR".into(), "REGION".into()],
                vec![vec![Cell::Int(7), Cell::Text("west".into())]],
            )
            .unwrap(),
        );

        let flat = flatten_partitions(&partitions, "category").expect("flatten succeeds");

        assert_eq!(
            flat.columns(),
            &["STORE_NBR", "TOTAL_SALES", "REGION", "category"].map(String::from)
        );
        assert_eq!(flat.row_count(), 4);
        assert_eq!(flat.rows()[0][3], Cell::Text("drinks".into()));
        assert_eq!(flat.rows()[0][2], Cell::Null);
        assert_eq!(flat.rows()[3][1], Cell::Null);
        assert_eq!(flat.rows()[3][3], Cell::Text("snacks".into()));
    }

    #[test]
    fn flatten_rejects_existing_key_column() {
        let mut partitions = PartitionedRecords::new();
        partitions.insert(
            "a".into(),
            RecordTable::from_rows(vec!["category".into()], vec![vec![Cell::Int(1)]]).unwrap(),
        );
        assert_eq!(
            flatten_partitions(&partitions, "category"),
            Err(TableError::DuplicateColumn("category".into()))
        );
    }

    #[test]
    fn split_is_inverse_of_flatten() {
        let mut partitions = PartitionedRecords::new();
        partitions.insert("drinks".into(), stores());
        partitions.insert("snacks".into(), stores());

        let flat = flatten_partitions(&partitions, "category").unwrap();
        let split = split_partitions(&flat, "category").unwrap();

        assert_eq!(split, partitions);
    }

    #[test]
    fn split_rejects_null_keys() {
        let table = RecordTable::from_rows(
            vec!["category".into(), "x".into()],
            vec![vec![Cell::Null, Cell::Int(1)]],
        )
        .unwrap();
        assert!(matches!(
            split_partitions(&table, "category"),
            Err(TableError::InvalidKey { row: 0, .. })
        ));
    }

    #[test]
    fn split_rejects_keys_of_different_types() {
        let table = RecordTable::from_rows(
            vec!["category".into(), "x".into()],
            vec![
                vec![Cell::Int(5), Cell::Int(1)],
                vec![Cell::Text("5".into()), Cell::Int(2)],
            ],
        )
        .unwrap();
        assert!(matches!(
            split_partitions(&table, "category"),
            Err(TableError::MixedKeyTypes { row: 1, .. })
        ));
    }

    #[test]
    fn json_rows_preserve_column_order_and_fill_gaps() {
        let table = RecordTable::from_json_rows(vec![
            json!({"STORE_NBR": 1, "SALES": 2.5}),
            json!({"STORE_NBR": 2, "REGION": "east"}),
        ])
        .unwrap();

        assert_eq!(table.columns(), &["STORE_NBR", "SALES", "REGION"].map(String::from));
        assert_eq!(table.rows()[0][2], Cell::Null);
        assert_eq!(table.rows()[1][1], Cell::Null);
        assert_eq!(table.to_json_rows()[1]["REGION"], json!("east"));
    }
}
