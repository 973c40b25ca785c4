use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

/// CSV table that collection runs append to in batches and resume from.
///
/// Keys already present on disk are reported as processed so a restarted run
/// skips them. A missing or empty file starts a new table; an existing header
/// without the key column is an error rather than something to append to.
#[derive(Debug)]
pub struct CheckpointTable {
    path: PathBuf,
    key_column: String,
    header: Option<csv::StringRecord>,
    processed: HashSet<String>,
}

impl CheckpointTable {
    pub fn open(path: impl Into<PathBuf>, key_column: &str) -> anyhow::Result<Self> {
        let path = path.into();
        let (header, processed) = match read_existing(&path, key_column)? {
            Some((header, processed)) => (Some(header), processed),
            None => (None, HashSet::new()),
        };
        if !processed.is_empty() {
            info!(
                path = %path.display(),
                resumed = processed.len(),
                "resuming from checkpoint"
            );
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating checkpoint directory {}", parent.display()))?;
        }
        Ok(Self {
            path,
            key_column: key_column.to_string(),
            header,
            processed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    pub fn is_processed(&self, key: &str) -> bool {
        self.processed.contains(key)
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Appends a batch; the header is only written when the file is new or empty.
    /// Rows whose columns differ from the header on disk are refused.
    pub fn append<T, F>(&mut self, rows: &[T], key_of: F) -> anyhow::Result<()>
    where
        T: Serialize,
        F: Fn(&T) -> &str,
    {
        let Some(first) = rows.first() else {
            return Ok(());
        };

        let has_content = fs::metadata(&self.path)
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);
        if has_content {
            let expected = serialized_header(first)?;
            let on_disk = match &self.header {
                Some(header) => header.clone(),
                None => read_header(&self.path)?,
            };
            if on_disk != expected {
                bail!(
                    "checkpoint {} has columns [{}], rows have [{}]",
                    self.path.display(),
                    on_disk.iter().collect::<Vec<_>>().join(","),
                    expected.iter().collect::<Vec<_>>().join(",")
                );
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening checkpoint {}", self.path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(!has_content)
            .from_writer(file);

        for row in rows {
            writer
                .serialize(row)
                .with_context(|| format!("writing checkpoint row to {}", self.path.display()))?;
            self.processed.insert(key_of(row).to_string());
        }
        writer
            .flush()
            .with_context(|| format!("flushing checkpoint {}", self.path.display()))?;
        if self.header.is_none() {
            self.header = Some(serialized_header(first)?);
        }

        debug!(
            path = %self.path.display(),
            batch = rows.len(),
            total = self.processed.len(),
            "checkpoint saved"
        );
        Ok(())
    }
}

fn read_header(path: &Path) -> anyhow::Result<csv::StringRecord> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening checkpoint {}", path.display()))?;
    reader
        .headers()
        .cloned()
        .with_context(|| format!("reading checkpoint header {}", path.display()))
}

/// Header and keys of a checkpoint already on disk, or `None` when there is
/// nothing to resume.
fn read_existing(
    path: &Path,
    key_column: &str,
) -> anyhow::Result<Option<(csv::StringRecord, HashSet<String>)>> {
    let has_content = fs::metadata(path).map(|meta| meta.len() > 0).unwrap_or(false);
    if !has_content {
        return Ok(None);
    }

    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening checkpoint {}", path.display()))?;
    let header = reader
        .headers()
        .cloned()
        .with_context(|| format!("reading checkpoint header {}", path.display()))?;
    let Some(index) = header.iter().position(|h| h == key_column) else {
        bail!(
            "checkpoint {} has no {key_column} column; move it aside or delete it",
            path.display()
        );
    };

    let processed = reader
        .records()
        .filter_map(Result::ok)
        .filter_map(|record| record.get(index).map(str::to_string))
        .filter(|key| !key.is_empty())
        .collect();
    Ok(Some((header, processed)))
}

/// Column names `row` serializes to.
fn serialized_header<T: Serialize>(row: &T) -> anyhow::Result<csv::StringRecord> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.serialize(row).context("serializing checkpoint header")?;
    let bytes = writer.into_inner().context("flushing checkpoint header")?;
    let mut reader = csv::Reader::from_reader(bytes.as_slice());
    reader
        .headers()
        .cloned()
        .context("reading serialized checkpoint header")
}

/// Overwrites `path` with the full table. Used for listing-style sources that are
/// re-collected in one pass.
pub fn write_csv_table<T: Serialize>(path: &Path, rows: &[T]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating table directory {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating table {}", path.display()))?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("writing row to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing table {}", path.display()))?;
    Ok(())
}

/// Reads a whole table written by [`write_csv_table`] or [`CheckpointTable`].
pub fn read_csv_table<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening table {}", path.display()))?;
    reader
        .deserialize()
        .enumerate()
        .map(|(index, row)| {
            row.with_context(|| format!("decoding row {} of {}", index + 1, path.display()))
        })
        .collect()
}
