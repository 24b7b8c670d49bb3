//! Row-oriented typed table used between CSV input and Parquet fragments/artifacts.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{Array, ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema, SchemaRef};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use procura_storage::{atomic_replace, sha256_hex};
use thiserror::Error;

/// Cell values treated as missing when reading CSV input.
const NULL_TOKENS: [&str; 9] = ["", "NA", "N/A", "#N/A", "NaN", "nan", "NULL", "null", "None"];

#[derive(Debug, Error)]
pub enum TableError {
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("arrow: {0}")]
    Arrow(#[from] ArrowError),
    #[error("parquet: {0}")]
    Parquet(#[from] ParquetError),
    #[error("table has no columns")]
    NoColumns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Int,
    Float,
    Text,
}

impl ColumnKind {
    /// Smallest kind that can hold values of both.
    pub fn widen(self, other: ColumnKind) -> ColumnKind {
        use ColumnKind::*;
        match (self, other) {
            (Int, Int) => Int,
            (Int, Float) | (Float, Int) | (Float, Float) => Float,
            _ => Text,
        }
    }

    pub fn data_type(self) -> DataType {
        match self {
            ColumnKind::Int => DataType::Int64,
            ColumnKind::Float => DataType::Float64,
            ColumnKind::Text => DataType::Utf8,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn to_text(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Int(v) => Some(v.to_string()),
            Cell::Float(v) => Some(v.to_string()),
            Cell::Text(v) => Some(v.clone()),
        }
    }

    /// Convert into `kind`; callers only widen, never narrow.
    pub fn widen_to(self, kind: ColumnKind) -> Cell {
        match (self, kind) {
            (Cell::Null, _) => Cell::Null,
            (Cell::Int(v), ColumnKind::Float) => Cell::Float(v as f64),
            (Cell::Int(v), ColumnKind::Text) => Cell::Text(v.to_string()),
            (Cell::Float(v), ColumnKind::Text) => Cell::Text(v.to_string()),
            (cell, _) => cell,
        }
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Cell::Null, Cell::Null) => true,
            (Cell::Int(a), Cell::Int(b)) => a == b,
            (Cell::Float(a), Cell::Float(b)) => a.to_bits() == b.to_bits(),
            (Cell::Text(a), Cell::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Cell {}

impl Hash for Cell {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Cell::Null => {}
            Cell::Int(v) => v.hash(state),
            Cell::Float(v) => v.to_bits().hash(state),
            Cell::Text(v) => v.hash(state),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    columns: Vec<Column>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<Column>, rows: Vec<Vec<Cell>>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn into_parts(self) -> (Vec<Column>, Vec<Vec<Cell>>) {
        (self.columns, self.rows)
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_is_all_null(&self, index: usize) -> bool {
        self.rows.iter().all(|row| row[index].is_null())
    }

    /// Load a CSV file with a header row, inferring Int/Float/Text per column.
    pub fn from_csv(path: &Path) -> Result<Self, TableError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)?;

        let headers = dedupe_headers(
            reader
                .byte_headers()?
                .iter()
                .map(|h| {
                    String::from_utf8_lossy(h)
                        .trim_start_matches('\u{feff}')
                        .trim()
                        .to_string()
                })
                .collect(),
        );
        if headers.is_empty() || (headers.len() == 1 && headers[0].is_empty()) {
            return Err(TableError::NoColumns);
        }

        let width = headers.len();
        let mut raw_columns: Vec<Vec<Option<String>>> = vec![Vec::new(); width];
        for record in reader.byte_records() {
            let record = record?;
            for (i, column) in raw_columns.iter_mut().enumerate() {
                let value = record
                    .get(i)
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .filter(|v| !NULL_TOKENS.contains(&v.trim()));
                column.push(value);
            }
        }

        let num_rows = raw_columns.first().map(Vec::len).unwrap_or(0);
        let mut columns = Vec::with_capacity(width);
        let mut rows: Vec<Vec<Cell>> = (0..num_rows).map(|_| Vec::with_capacity(width)).collect();
        for (name, values) in headers.into_iter().zip(raw_columns) {
            let kind = infer_kind(&values);
            for (row, value) in rows.iter_mut().zip(values) {
                row.push(parse_cell(value, kind));
            }
            columns.push(Column { name, kind });
        }
        Ok(Self { columns, rows })
    }

    /// Set `name` to `value` on every row, replacing an existing column of that name.
    pub fn set_text_column(&mut self, name: &str, value: &str) {
        match self.columns.iter().position(|c| c.name == name) {
            Some(index) => {
                self.columns[index].kind = ColumnKind::Text;
                for row in &mut self.rows {
                    row[index] = Cell::Text(value.to_string());
                }
            }
            None => {
                self.columns.push(Column {
                    name: name.to_string(),
                    kind: ColumnKind::Text,
                });
                for row in &mut self.rows {
                    row.push(Cell::Text(value.to_string()));
                }
            }
        }
    }

    /// Hash of the sorted column names, leaving out `excluded` (the provenance columns).
    pub fn signature(&self, excluded: &[&str]) -> String {
        let mut names: Vec<&str> = self
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .filter(|n| !excluded.contains(n))
            .collect();
        names.sort_unstable();
        sha256_hex(names.join("|").as_bytes())
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.columns
                .iter()
                .map(|c| ArrowField::new(&c.name, c.kind.data_type(), true))
                .collect::<Vec<_>>(),
        ))
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch, TableError> {
        if self.columns.is_empty() {
            return Err(TableError::NoColumns);
        }
        let arrays: Vec<ArrayRef> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, column)| -> ArrayRef {
                let cells = self.rows.iter().map(|row| &row[i]);
                match column.kind {
                    ColumnKind::Int => Arc::new(Int64Array::from(
                        cells
                            .map(|c| match c {
                                Cell::Int(v) => Some(*v),
                                _ => None,
                            })
                            .collect::<Vec<_>>(),
                    )),
                    ColumnKind::Float => Arc::new(Float64Array::from(
                        cells
                            .map(|c| match c {
                                Cell::Float(v) => Some(*v),
                                Cell::Int(v) => Some(*v as f64),
                                _ => None,
                            })
                            .collect::<Vec<_>>(),
                    )),
                    ColumnKind::Text => Arc::new(StringArray::from(
                        cells.map(Cell::to_text).collect::<Vec<_>>(),
                    )),
                }
            })
            .collect();
        Ok(RecordBatch::try_new(self.schema(), arrays)?)
    }

    pub fn from_record_batches(schema: &Schema, batches: &[RecordBatch]) -> Result<Self, TableError> {
        let mut columns = Vec::with_capacity(schema.fields().len());
        for field in schema.fields() {
            columns.push(Column {
                name: field.name().clone(),
                kind: kind_for(field.data_type()),
            });
        }

        let mut rows = Vec::new();
        for batch in batches {
            let arrays = batch
                .columns()
                .iter()
                .zip(&columns)
                .map(|(array, column)| coerce_array(array, column.kind))
                .collect::<Result<Vec<_>, _>>()?;
            for r in 0..batch.num_rows() {
                rows.push(
                    arrays
                        .iter()
                        .zip(&columns)
                        .map(|(array, column)| read_cell(array.as_ref(), column.kind, r))
                        .collect(),
                );
            }
        }
        Ok(Self { columns, rows })
    }

    pub fn read_parquet(path: &Path) -> Result<Self, TableError> {
        let file = File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let schema = builder.schema().clone();
        let reader = builder.build()?;
        let batches = reader.collect::<Result<Vec<_>, ArrowError>>()?;
        Self::from_record_batches(&schema, &batches)
    }

    /// Write as Parquet, atomically replacing whatever was at `path`.
    pub fn write_parquet(&self, path: &Path) -> anyhow::Result<()> {
        let batch = self.to_record_batch()?;
        atomic_replace(path, |file| {
            let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
            writer.write(&batch)?;
            writer.close()?;
            Ok(())
        })
    }
}

/// Column names of every Parquet file in `dir`, optionally descending into subdirectories.
pub fn parquet_columns(dir: &Path, recursive: bool) -> std::io::Result<Vec<(PathBuf, Result<Vec<String>, String>)>> {
    let mut files = Vec::new();
    collect_parquet_files(dir, recursive, &mut files)?;
    Ok(files
        .into_iter()
        .map(|path| {
            let columns = File::open(&path)
                .map_err(|e| e.to_string())
                .and_then(|f| ParquetRecordBatchReaderBuilder::try_new(f).map_err(|e| e.to_string()))
                .map(|b| b.schema().fields().iter().map(|f| f.name().clone()).collect());
            (path, columns)
        })
        .collect())
}

/// Sorted `*.parquet` files under `dir`; hidden temp files are ignored.
pub fn collect_parquet_files(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let mut entries = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .collect::<Vec<_>>();
    entries.sort();
    for path in entries {
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if hidden {
            continue;
        }
        if path.is_dir() {
            if recursive {
                collect_parquet_files(&path, true, out)?;
            }
        } else if path.extension().is_some_and(|ext| ext == "parquet") {
            out.push(path);
        }
    }
    Ok(())
}

/// Repeated headers get the first free `.N` suffix. Suffixed names never take a
/// name that appears literally in the header row, so no column is shadowed.
fn dedupe_headers(headers: Vec<String>) -> Vec<String> {
    let literal: HashSet<String> = headers.iter().cloned().collect();
    let mut used = HashSet::new();
    let mut next_suffix = HashMap::<String, usize>::new();
    headers
        .into_iter()
        .map(|name| {
            if used.insert(name.clone()) {
                return name;
            }
            let suffix = next_suffix.entry(name.clone()).or_insert(1);
            loop {
                let candidate = format!("{name}.{suffix}");
                *suffix += 1;
                if !literal.contains(&candidate) && used.insert(candidate.clone()) {
                    return candidate;
                }
            }
        })
        .collect()
}

fn has_leading_zero(value: &str) -> bool {
    let digits = value.trim_start_matches(['-', '+']);
    digits.len() > 1 && digits.starts_with('0') && !digits.starts_with("0.")
}

fn looks_int(value: &str) -> bool {
    value.parse::<i64>().is_ok() && !has_leading_zero(value)
}

fn looks_float(value: &str) -> bool {
    value.parse::<f64>().is_ok()
        && value.bytes().any(|b| b.is_ascii_digit())
        && !has_leading_zero(value)
}

fn infer_kind(values: &[Option<String>]) -> ColumnKind {
    let mut all_int = true;
    let mut all_float = true;
    let mut any = false;
    for value in values.iter().flatten() {
        let value = value.trim();
        any = true;
        if all_int && !looks_int(value) {
            all_int = false;
        }
        if !all_int && !looks_float(value) {
            all_float = false;
            break;
        }
    }
    match (any, all_int, all_float) {
        (false, _, _) => ColumnKind::Text,
        (true, true, _) => ColumnKind::Int,
        (true, false, true) => ColumnKind::Float,
        _ => ColumnKind::Text,
    }
}

fn parse_cell(value: Option<String>, kind: ColumnKind) -> Cell {
    let Some(value) = value else {
        return Cell::Null;
    };
    match kind {
        ColumnKind::Int => value.trim().parse().map(Cell::Int).unwrap_or(Cell::Null),
        ColumnKind::Float => value.trim().parse().map(Cell::Float).unwrap_or(Cell::Null),
        ColumnKind::Text => Cell::Text(value),
    }
}

fn kind_for(data_type: &DataType) -> ColumnKind {
    if data_type.is_integer() {
        ColumnKind::Int
    } else if data_type.is_floating() {
        ColumnKind::Float
    } else {
        ColumnKind::Text
    }
}

fn coerce_array(array: &ArrayRef, kind: ColumnKind) -> Result<ArrayRef, ArrowError> {
    let target = kind.data_type();
    if array.data_type() == &target {
        Ok(Arc::clone(array))
    } else {
        arrow_cast::cast(array, &target)
    }
}

fn read_cell(array: &dyn Array, kind: ColumnKind, row: usize) -> Cell {
    if array.is_null(row) {
        return Cell::Null;
    }
    match kind {
        ColumnKind::Int => array
            .as_any()
            .downcast_ref::<Int64Array>()
            .map(|a| Cell::Int(a.value(row)))
            .unwrap_or(Cell::Null),
        ColumnKind::Float => array
            .as_any()
            .downcast_ref::<Float64Array>()
            .map(|a| Cell::Float(a.value(row)))
            .unwrap_or(Cell::Null),
        ColumnKind::Text => array
            .as_any()
            .downcast_ref::<StringArray>()
            .map(|a| Cell::Text(a.value(row).to_string()))
            .unwrap_or(Cell::Null),
    }
}
