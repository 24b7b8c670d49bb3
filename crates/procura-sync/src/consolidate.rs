//! Unions every fragment of a table into one deduplicated artifact under `final/`.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use procura_core::{DataLayout, EventSink, PipelineEvent, SkipReason, Stage};
use serde::Serialize;
use tracing::info;

use crate::table::{collect_parquet_files, Cell, Column, ColumnKind, Table};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub table: String,
    pub fragments: usize,
    pub rows: usize,
    pub columns: usize,
    pub duplicates_removed: usize,
    pub artifact: PathBuf,
}

pub struct Consolidator {
    layout: DataLayout,
    sink: Arc<dyn EventSink>,
}

impl Consolidator {
    pub fn new(layout: DataLayout, sink: Arc<dyn EventSink>) -> Self {
        Self { layout, sink }
    }

    /// Rebuild every table's final artifact from its fragments.
    pub fn consolidate(&self) -> Result<Vec<TableReport>> {
        let fragments_dir = self.layout.fragments_dir();
        if !fragments_dir.is_dir() {
            info!(path = %fragments_dir.display(), "no fragment store; nothing to consolidate");
            return Ok(Vec::new());
        }

        let mut table_dirs = Vec::new();
        for entry in std::fs::read_dir(&fragments_dir)
            .with_context(|| format!("listing {}", fragments_dir.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                table_dirs.push(entry.path());
            }
        }
        table_dirs.sort();

        let mut reports = Vec::new();
        for dir in table_dirs {
            let table = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if let Some(report) = self.consolidate_table(&table, &dir)? {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    fn consolidate_table(&self, table: &str, dir: &Path) -> Result<Option<TableReport>> {
        let mut files = Vec::new();
        collect_parquet_files(dir, true, &mut files)
            .with_context(|| format!("listing fragments in {}", dir.display()))?;

        let mut loaded = Vec::with_capacity(files.len());
        for file in &files {
            match Table::read_parquet(file) {
                Ok(fragment) => loaded.push(fragment),
                Err(err) => self.skip(
                    table,
                    SkipReason::UnreadableFragment {
                        path: file.display().to_string(),
                        error: err.to_string(),
                    },
                ),
            }
        }
        if loaded.is_empty() {
            self.skip(table, SkipReason::NoReadableFragments);
            return Ok(None);
        }

        let fragments = loaded.len();
        let (merged, duplicates_removed) = union_tables(loaded);
        let artifact = self.layout.final_artifact(table);
        merged
            .write_parquet(&artifact)
            .with_context(|| format!("writing consolidated artifact {}", artifact.display()))?;

        self.sink.emit(PipelineEvent::TableConsolidated {
            table: table.to_string(),
            rows: merged.num_rows(),
            columns: merged.columns().len(),
            duplicates_removed,
        });
        Ok(Some(TableReport {
            table: table.to_string(),
            fragments,
            rows: merged.num_rows(),
            columns: merged.columns().len(),
            duplicates_removed,
            artifact,
        }))
    }

    fn skip(&self, table: &str, reason: SkipReason) {
        self.sink.emit(PipelineEvent::Skipped {
            stage: Stage::Consolidate,
            source: None,
            id: table.to_string(),
            reason,
        });
    }
}

/// Union `tables` onto their sorted superset of columns, padding missing columns
/// with nulls and dropping rows identical to an earlier one. Returns the merged
/// table and the number of rows dropped.
///
/// A column's kind is the widening of its kinds across tables; a column that is
/// entirely null in some table does not take part in that decision.
pub fn union_tables(tables: Vec<Table>) -> (Table, usize) {
    let mut kinds: BTreeMap<String, Option<ColumnKind>> = BTreeMap::new();
    for table in &tables {
        for (index, column) in table.columns().iter().enumerate() {
            let slot = kinds.entry(column.name.clone()).or_insert(None);
            if !table.column_is_all_null(index) {
                *slot = Some(slot.map_or(column.kind, |k| k.widen(column.kind)));
            }
        }
    }
    let columns: Vec<Column> = kinds
        .into_iter()
        .map(|(name, kind)| Column {
            name,
            kind: kind.unwrap_or(ColumnKind::Text),
        })
        .collect();
    let positions: BTreeMap<&str, usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name.as_str(), i))
        .collect();

    let mut seen: HashSet<Vec<Cell>> = HashSet::new();
    let mut rows = Vec::new();
    let mut duplicates = 0;
    for table in tables {
        let (source_columns, source_rows) = table.into_parts();
        let targets: Vec<usize> = source_columns
            .iter()
            .map(|c| positions[c.name.as_str()])
            .collect();
        for source_row in source_rows {
            let mut row = vec![Cell::Null; columns.len()];
            for (cell, &target) in source_row.into_iter().zip(&targets) {
                row[target] = cell.widen_to(columns[target].kind);
            }
            if seen.contains(&row) {
                duplicates += 1;
            } else {
                seen.insert(row.clone());
                rows.push(row);
            }
        }
    }

    (Table::new(columns, rows), duplicates)
}
