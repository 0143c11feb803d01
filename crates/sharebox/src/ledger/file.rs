//! CSV persistence for ledger and shard files.
//!
//! Writes never touch the live file: the complete new content goes to a
//! temporary file next to it which then replaces the original by rename.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::LedgerError;

fn io_error(path: &Path, source: std::io::Error) -> LedgerError {
    LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn csv_error(path: &Path, source: csv::Error) -> LedgerError {
    LedgerError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads every well-formed row of a CSV file.
///
/// A missing file reads as empty. Rows with fewer than `min_columns`
/// fields, or whose fields fail to decode, are skipped.
pub(crate) fn read_rows<R: DeserializeOwned>(
    path: &Path,
    has_header: bool,
    min_columns: usize,
) -> Result<Vec<R>, LedgerError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(path, e)),
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_header)
        .flexible(true)
        .from_reader(file);

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| csv_error(path, e))?;
        if record.len() < min_columns {
            log::debug!(
                "Skipping short row {} in {} ({} columns)",
                line + 1,
                path.display(),
                record.len()
            );
            continue;
        }
        match record.deserialize::<R>(None) {
            Ok(row) => rows.push(row),
            Err(e) => {
                log::warn!("Skipping unreadable row {} in {}: {}", line + 1, path.display(), e);
            }
        }
    }

    Ok(rows)
}

/// Counts data rows without decoding them.
pub(crate) fn count_rows(path: &Path, has_header: bool) -> Result<usize, LedgerError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_error(path, e)),
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_header)
        .flexible(true)
        .from_reader(file);

    let mut count = 0;
    for record in reader.records() {
        record.map_err(|e| csv_error(path, e))?;
        count += 1;
    }
    Ok(count)
}

/// Replaces `path` with `header` (if any) followed by `rows`.
pub(crate) fn write_rows<R: Serialize>(
    path: &Path,
    header: Option<&[&str]>,
    rows: &[R],
) -> Result<(), LedgerError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| io_error(parent, e))?;
    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(&mut temp);
        if let Some(header) = header {
            writer
                .write_record(header)
                .map_err(|e| csv_error(path, e))?;
        }
        for row in rows {
            writer.serialize(row).map_err(|e| csv_error(path, e))?;
        }
        writer.flush().map_err(|e| io_error(path, e))?;
    }
    temp.flush().map_err(|e| io_error(path, e))?;
    temp.as_file().sync_all().map_err(|e| io_error(path, e))?;

    temp.persist(path).map_err(|e| LedgerError::Persist {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}
