//! Turns extracted CSV exports into provenance-tagged, signature-partitioned Parquet fragments.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use procura_core::{
    DataLayout, EventSink, FragmentKey, PipelineEvent, SkipReason, Stage, Vintage,
    PROVENANCE_COLUMNS,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::table::Table;

/// Per-table CSV files each extracted archive is expected to contain.
pub const DEFAULT_EXPECTED_TABLES: [&str; 22] = [
    "com_awa_ite_additionalClassific.csv",
    "com_awa_ite_tot_exchangeRates.csv",
    "com_awa_items.csv",
    "com_awa_suppliers.csv",
    "com_awa_val_exchangeRates.csv",
    "com_awards.csv",
    "com_con_documents.csv",
    "com_con_ite_additionalClassific.csv",
    "com_con_ite_tot_exchangeRates.csv",
    "com_con_items.csv",
    "com_con_val_exchangeRates.csv",
    "com_contracts.csv",
    "com_par_additionalIdentifiers.csv",
    "com_parties.csv",
    "com_sources.csv",
    "com_ten_documents.csv",
    "com_ten_ite_additionalClassific.csv",
    "com_ten_ite_tot_exchangeRates.csv",
    "com_ten_items.csv",
    "com_ten_tenderers.csv",
    "records.csv",
    "releases.csv",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeSummary {
    /// Ids for which at least the id itself was valid and its extraction directory found.
    pub processed_ids: Vec<String>,
    pub skipped_ids: Vec<String>,
    pub fragments_written: usize,
    pub files_skipped: usize,
}

pub struct Normalizer {
    layout: DataLayout,
    expected_tables: Vec<String>,
    sink: Arc<dyn EventSink>,
}

impl Normalizer {
    pub fn new(layout: DataLayout, expected_tables: Vec<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            layout,
            expected_tables,
            sink,
        }
    }

    /// Normalize `ids`, or every extracted id when `None`.
    ///
    /// Bad ids and unreadable files are skipped and reported; only a failure to
    /// write a fragment is returned as an error.
    pub fn normalize(&self, ids: Option<&[String]>) -> Result<NormalizeSummary> {
        let ids = match ids {
            Some(ids) => ids.to_vec(),
            None => self.extracted_ids()?,
        };

        let mut summary = NormalizeSummary::default();
        for id in &ids {
            let vintage = match Vintage::parse_object_id(id) {
                Ok(vintage) => vintage,
                Err(err) => {
                    self.skip(id, SkipReason::MalformedId { error: err.to_string() });
                    summary.skipped_ids.push(id.clone());
                    continue;
                }
            };

            let extraction = self.layout.extraction_dir(id);
            if !extraction.is_dir() {
                self.skip(
                    id,
                    SkipReason::MissingExtraction {
                        path: extraction.display().to_string(),
                    },
                );
                summary.skipped_ids.push(id.clone());
                continue;
            }

            self.clear_fragments(id)?;
            for file_name in &self.expected_tables {
                let csv_path = extraction.join(file_name);
                if !csv_path.is_file() {
                    debug!(id, file = file_name.as_str(), "expected table not present");
                    continue;
                }
                if self.normalize_file(id, &vintage, &csv_path, file_name)? {
                    summary.fragments_written += 1;
                } else {
                    summary.files_skipped += 1;
                }
            }
            summary.processed_ids.push(id.clone());
        }

        info!(
            processed = summary.processed_ids.len(),
            skipped = summary.skipped_ids.len(),
            fragments = summary.fragments_written,
            "normalization finished"
        );
        Ok(summary)
    }

    /// Returns `Ok(false)` when the file was skipped as unreadable.
    fn normalize_file(&self, id: &str, vintage: &Vintage, csv_path: &Path, file_name: &str) -> Result<bool> {
        let mut table = match Table::from_csv(csv_path) {
            Ok(table) => table,
            Err(err) => {
                self.skip(
                    id,
                    SkipReason::UnreadableFile {
                        path: csv_path.display().to_string(),
                        error: err.to_string(),
                    },
                );
                return Ok(false);
            }
        };

        let signature = table.signature(&PROVENANCE_COLUMNS);
        for (column, value) in PROVENANCE_COLUMNS.iter().zip(vintage.values()) {
            table.set_text_column(column, value);
        }

        let key = FragmentKey {
            table: table_name(file_name).to_string(),
            signature,
            object_id: id.to_string(),
        };
        let path = self.layout.fragment_path(&key);
        table
            .write_parquet(&path)
            .with_context(|| format!("writing fragment {}", path.display()))?;

        self.sink.emit(PipelineEvent::FragmentWritten {
            table: key.table,
            signature: key.signature,
            id: id.to_string(),
            rows: table.num_rows(),
        });
        Ok(true)
    }

    /// Drop every fragment previously written for `id`, in any table and under any
    /// signature. The current extraction alone decides which fragments the id has.
    fn clear_fragments(&self, id: &str) -> Result<()> {
        let fragments_dir = self.layout.fragments_dir();
        if !fragments_dir.is_dir() {
            return Ok(());
        }
        let file_name = format!("{id}.parquet");
        for table_dir in subdirectories(&fragments_dir)? {
            for signature_dir in subdirectories(&table_dir)? {
                let stale = signature_dir.join(&file_name);
                if stale.is_file() {
                    std::fs::remove_file(&stale)
                        .with_context(|| format!("removing stale fragment {}", stale.display()))?;
                    debug!(path = %stale.display(), "removed stale fragment");
                }
            }
        }
        Ok(())
    }

    fn extracted_ids(&self) -> Result<Vec<String>> {
        let dir = self.layout.extracted_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir).with_context(|| format!("listing {}", dir.display()))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn skip(&self, id: &str, reason: SkipReason) {
        self.sink.emit(PipelineEvent::Skipped {
            stage: Stage::Normalize,
            source: None,
            id: id.to_string(),
            reason,
        });
    }
}

/// `com_contracts.csv` -> `com_contracts`.
pub fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn table_name(file_name: &str) -> &str {
    file_name.strip_suffix(".csv").unwrap_or(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Cell, ColumnKind};
    use procura_core::MemorySink;
    use tempfile::tempdir;

    fn extract(layout: &DataLayout, id: &str, files: &[(&str, &str)]) {
        let dir = layout.extraction_dir(id);
        std::fs::create_dir_all(&dir).unwrap();
        for (name, body) in files {
            std::fs::write(dir.join(name), body).unwrap();
        }
    }

    fn normalizer(layout: &DataLayout, sink: Arc<MemorySink>) -> Normalizer {
        Normalizer::new(
            layout.clone(),
            vec!["com_contracts.csv".into(), "com_parties.csv".into()],
            sink,
        )
    }

    #[test]
    fn fragments_are_tagged_and_partitioned_by_signature() {
        let dir = tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        extract(&layout, "v3-2024-05", &[("com_contracts.csv", "b,a\n2,1\n")]);
        extract(&layout, "v3-2024-06", &[("com_contracts.csv", "a,b\n5,6\n")]);
        extract(&layout, "v2-2019-01", &[("com_contracts.csv", "a,c\n7,8\n")]);

        let sink = Arc::new(MemorySink::new());
        let summary = normalizer(&layout, sink).normalize(None).unwrap();
        assert_eq!(summary.fragments_written, 3);
        assert_eq!(summary.processed_ids, vec!["v2-2019-01", "v3-2024-05", "v3-2024-06"]);

        let ab = crate::table::Table::new(
            vec![
                crate::table::Column { name: "a".into(), kind: ColumnKind::Int },
                crate::table::Column { name: "b".into(), kind: ColumnKind::Int },
            ],
            vec![],
        )
        .signature(&PROVENANCE_COLUMNS);
        let key = FragmentKey {
            table: "com_contracts".into(),
            signature: ab.clone(),
            object_id: "v3-2024-05".into(),
        };
        let fragment = Table::read_parquet(&layout.fragment_path(&key)).unwrap();
        assert_eq!(fragment.column_names(), vec!["b", "a", "version", "year", "month"]);
        assert_eq!(
            fragment.rows()[0],
            vec![
                Cell::Int(2),
                Cell::Int(1),
                Cell::Text("v3".into()),
                Cell::Text("2024".into()),
                Cell::Text("05".into())
            ]
        );

        let partitions = std::fs::read_dir(layout.fragments_dir().join("com_contracts"))
            .unwrap()
            .count();
        assert_eq!(partitions, 2);
    }

    #[test]
    fn bad_id_is_skipped_and_batch_continues() {
        let dir = tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        extract(&layout, "v3-2024-05", &[("com_parties.csv", "name\nacme\n")]);

        let sink = Arc::new(MemorySink::new());
        let ids = vec!["badformat".to_string(), "v3-2024-05".to_string()];
        let summary = normalizer(&layout, sink.clone()).normalize(Some(&ids)).unwrap();

        assert_eq!(summary.skipped_ids, vec!["badformat"]);
        assert_eq!(summary.processed_ids, vec!["v3-2024-05"]);
        assert_eq!(summary.fragments_written, 1);
        assert_eq!(sink.skipped_ids(Stage::Normalize), vec!["badformat"]);
    }

    #[test]
    fn unreadable_file_does_not_stop_sibling_files() {
        let dir = tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        extract(
            &layout,
            "v3-2024-05",
            &[("com_contracts.csv", ""), ("com_parties.csv", "name\nacme\n")],
        );

        let sink = Arc::new(MemorySink::new());
        let summary = normalizer(&layout, sink.clone()).normalize(None).unwrap();
        assert_eq!(summary.fragments_written, 1);
        assert_eq!(summary.files_skipped, 1);
        assert!(sink.events().iter().any(|e| matches!(
            e,
            PipelineEvent::Skipped { reason: SkipReason::UnreadableFile { .. }, .. }
        )));
    }

    #[test]
    fn rerun_replaces_fragments_instead_of_appending() {
        let dir = tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        extract(&layout, "v3-2024-05", &[("com_parties.csv", "name\nacme\nglobex\n")]);

        let sink = Arc::new(MemorySink::new());
        let n = normalizer(&layout, sink);
        n.normalize(None).unwrap();
        n.normalize(None).unwrap();

        let mut files = Vec::new();
        crate::table::collect_parquet_files(&layout.fragments_dir(), true, &mut files).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(Table::read_parquet(&files[0]).unwrap().num_rows(), 2);
    }

    #[test]
    fn changed_columns_for_same_id_supersede_old_fragment() {
        let dir = tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        extract(&layout, "v3-2024-05", &[("com_parties.csv", "name\nacme\n")]);
        let n = normalizer(&layout, Arc::new(MemorySink::new()));
        n.normalize(None).unwrap();

        extract(&layout, "v3-2024-05", &[("com_parties.csv", "name,role\nacme,buyer\n")]);
        n.normalize(None).unwrap();

        let mut files = Vec::new();
        crate::table::collect_parquet_files(&layout.fragments_dir(), true, &mut files).unwrap();
        assert_eq!(files.len(), 1);
        let table = Table::read_parquet(&files[0]).unwrap();
        assert!(table.column_names().contains(&"role"));
    }

    #[test]
    fn refetched_object_keeps_only_fragments_of_its_current_tables() {
        let dir = tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        extract(
            &layout,
            "v3-2024-05",
            &[("com_contracts.csv", "ocid\nA-1\n"), ("com_parties.csv", "name\nacme\n")],
        );
        extract(&layout, "v3-2024-06", &[("com_contracts.csv", "ocid\nB-1\n")]);
        let n = normalizer(&layout, Arc::new(MemorySink::new()));
        n.normalize(None).unwrap();

        // The newer archive drops the contracts table and ships a broken parties file.
        let extraction = layout.extraction_dir("v3-2024-05");
        std::fs::remove_dir_all(&extraction).unwrap();
        extract(&layout, "v3-2024-05", &[("com_parties.csv", "")]);
        let summary = n.normalize(Some(&["v3-2024-05".to_string()])).unwrap();
        assert_eq!(summary.fragments_written, 0);
        assert_eq!(summary.files_skipped, 1);

        let mut files = Vec::new();
        crate::table::collect_parquet_files(&layout.fragments_dir(), true, &mut files).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["v3-2024-06.parquet"]);
    }

    #[test]
    fn explicit_empty_id_list_is_a_no_op() {
        let dir = tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        extract(&layout, "v3-2024-05", &[("com_parties.csv", "name\nacme\n")]);
        let summary = normalizer(&layout, Arc::new(MemorySink::new()))
            .normalize(Some(&[]))
            .unwrap();
        assert_eq!(summary, NormalizeSummary::default());
        assert!(!layout.fragments_dir().exists());
    }

    #[test]
    fn missing_extraction_is_reported() {
        let dir = tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        let sink = Arc::new(MemorySink::new());
        let ids = vec!["v3-2024-07".to_string()];
        let summary = normalizer(&layout, sink.clone()).normalize(Some(&ids)).unwrap();
        assert_eq!(summary.skipped_ids, ids);
        assert_eq!(sink.skipped_ids(Stage::Normalize), ids);
    }
}
