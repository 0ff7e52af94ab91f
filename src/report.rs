use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::HarvestError;
use crate::record::Record;

/// Columns of the file-list report, in output order.
pub const FILE_COLUMNS: &[&str] = &[
    "_timestamp",
    "_version_",
    "cf_standard_name",
    "checksum",
    "checksum_type",
    "cmor_table",
    "data_node",
    "dataset_functional_id",
    "dataset_local_path",
    "dataset_path",
    "dataset_path_without_version",
    "dataset_version",
    "description",
    "drs_id",
    "ensemble",
    "experiment",
    "experiment_family",
    "file_functional_id",
    "filename",
    "forcing",
    "format",
    "index_node",
    "instance_id",
    "institute",
    "latest",
    "local_path",
    "master_id",
    "model",
    "priority",
    "product",
    "project",
    "realm",
    "replica",
    "score",
    "size",
    "status",
    "time_frequency",
    "timestamp",
    "tracking_id",
    "type",
    "url",
    "variable",
    "variable_long_name",
    "variable_units",
    "version",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DedupSummary {
    pub rows_read: usize,
    pub rows_written: usize,
}

/// Receives the records of a file list one at a time.
pub trait RecordSink {
    fn record(&mut self, record: &Record) -> Result<(), HarvestError>;
}

impl RecordSink for Vec<Record> {
    fn record(&mut self, record: &Record) -> Result<(), HarvestError> {
        self.push(record.clone());
        Ok(())
    }
}

/// Streams file-list rows into a temporary file next to `path`; the report
/// only appears at `path` once [`FileListWriter::finish`] succeeds.
pub struct FileListWriter {
    path: Utf8PathBuf,
    writer: csv::Writer<NamedTempFile>,
    rows: usize,
}

impl FileListWriter {
    pub fn create(path: &Utf8Path) -> Result<Self, HarvestError> {
        let temp = temp_file_beside(path)?;
        let mut writer = csv::Writer::from_writer(temp);
        writer.write_record(FILE_COLUMNS).map_err(csv_error)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            rows: 0,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Flushes and moves the report into place. Returns the row count.
    pub fn finish(self) -> Result<usize, HarvestError> {
        let Self { path, writer, rows } = self;
        let temp = writer
            .into_inner()
            .map_err(|err| HarvestError::Csv(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        Ok(rows)
    }
}

impl RecordSink for FileListWriter {
    fn record(&mut self, record: &Record) -> Result<(), HarvestError> {
        self.writer
            .write_record(FILE_COLUMNS.iter().map(|column| record.column(column)))
            .map_err(csv_error)?;
        self.rows += 1;
        Ok(())
    }
}

pub fn write_file_list(path: &Utf8Path, records: &[Record]) -> Result<(), HarvestError> {
    let mut writer = FileListWriter::create(path)?;
    for record in records {
        writer.record(record)?;
    }
    writer.finish()?;
    Ok(())
}

/// Keeps one row per filename: the one with the highest
/// `(filename, dataset_version, _version_)`. Output is ordered by filename.
pub fn dedup_file_list(input: &Utf8Path, output: &Utf8Path) -> Result<DedupSummary, HarvestError> {
    let mut reader = csv::Reader::from_path(input.as_std_path()).map_err(csv_error)?;
    let headers = reader.headers().map_err(csv_error)?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|header| header == name)
            .ok_or_else(|| HarvestError::Csv(format!("missing column {name} in {input}")))
    };
    let filename_idx = column("filename")?;
    let dataset_version_idx = column("dataset_version")?;
    let solr_version_idx = column("_version_")?;

    let mut best: BTreeMap<String, csv::StringRecord> = BTreeMap::new();
    let mut rows_read = 0usize;
    for row in reader.records() {
        let row = row.map_err(csv_error)?;
        rows_read += 1;
        let filename = row.get(filename_idx).unwrap_or_default().to_string();
        let replace = match best.get(&filename) {
            None => true,
            Some(current) => {
                let ordering = compare_versions(
                    row.get(dataset_version_idx),
                    current.get(dataset_version_idx),
                )
                .then_with(|| compare_versions(row.get(solr_version_idx), current.get(solr_version_idx)));
                ordering == Ordering::Greater
            }
        };
        if replace {
            best.insert(filename, row);
        }
    }

    let mut buffer = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut buffer);
        writer.write_record(&headers).map_err(csv_error)?;
        for row in best.values() {
            writer.write_record(row).map_err(csv_error)?;
        }
        writer.flush().map_err(|err| HarvestError::Csv(err.to_string()))?;
    }
    write_bytes_atomic(output, &buffer)?;

    Ok(DedupSummary {
        rows_read,
        rows_written: best.len(),
    })
}

// Numeric when both sides are numbers, lexical otherwise.
fn compare_versions(left: Option<&str>, right: Option<&str>) -> Ordering {
    let left = left.unwrap_or_default();
    let right = right.unwrap_or_default();
    match (left.parse::<u64>(), right.parse::<u64>()) {
        (Ok(left), Ok(right)) => left.cmp(&right),
        _ => left.cmp(right),
    }
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), HarvestError> {
    let mut temp = temp_file_beside(path)?;
    temp.write_all(content)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Ok(())
}

fn temp_file_beside(path: &Utf8Path) -> Result<NamedTempFile, HarvestError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    tempfile::Builder::new()
        .prefix("esgf-harvest")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))
}

fn csv_error(err: csv::Error) -> HarvestError {
    HarvestError::Csv(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_compare_numerically() {
        assert_eq!(compare_versions(Some("9"), Some("10")), Ordering::Less);
        assert_eq!(compare_versions(Some("b"), Some("a")), Ordering::Greater);
        assert_eq!(compare_versions(None, Some("")), Ordering::Equal);
    }
}
