// src/cache/write.rs

use arrow::{
    array::{ArrayRef, UInt32Array},
    compute::{cast, take_record_batch},
    datatypes::{DataType, Schema, SchemaRef},
    record_batch::RecordBatch,
};
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use rayon::prelude::*;
use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, warn};

use super::{
    CacheLayout, CacheSummary, COLUMNS_METADATA_KEY, NULL_PARTITION, PARTITION_METADATA_KEY,
    PARTITION_NORMALIZED_KEY, SCHEMA_FILE,
};
use crate::config::TableOptions;
use crate::error::{Error, Result};
use crate::process::{as_utf8, normalize_text, row_index};

/// Percent-escape bytes that cannot appear in a directory name.
pub fn escape_partition_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for (i, ch) in value.chars().enumerate() {
        let unsafe_char = matches!(
            ch,
            '/' | '\\' | '%' | '=' | ':' | '*' | '?' | '"' | '<' | '>' | '|'
        ) || ch.is_control()
            || (i == 0 && ch == '.');
        if unsafe_char {
            let mut buf = [0u8; 4];
            for b in ch.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{:02X}", b));
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Inverse of [`escape_partition_value`]. Malformed escapes are kept verbatim.
pub fn unescape_partition_value(escaped: &str) -> String {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `schema` tagged with the source column order and, for partitioned
/// caches, the partition column and whether its values were upper-cased.
fn tagged_schema(schema: &Schema, partition: Option<(&str, bool)>) -> Result<SchemaRef> {
    let all: Vec<&String> = schema.fields().iter().map(|f| f.name()).collect();
    let mut metadata: HashMap<String, String> = schema.metadata().clone();
    metadata.insert(COLUMNS_METADATA_KEY.to_string(), serde_json::to_string(&all)?);
    if let Some((col, normalized)) = partition {
        metadata.insert(PARTITION_METADATA_KEY.to_string(), col.to_string());
        metadata.insert(PARTITION_NORMALIZED_KEY.to_string(), normalized.to_string());
    }
    Ok(Arc::new(Schema::new_with_metadata(
        schema.fields().clone(),
        metadata,
    )))
}

/// Same batch with column `idx` cast to Utf8, values otherwise untouched.
fn with_text_column(batch: &RecordBatch, idx: usize) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields: Vec<_> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    let mut cols: Vec<ArrayRef> = batch.columns().to_vec();
    cols[idx] = cast(&cols[idx], &DataType::Utf8)?;
    fields[idx] = fields[idx].clone().with_data_type(DataType::Utf8);
    Ok(RecordBatch::try_new(
        Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone())),
        cols,
    )?)
}

/// Write one Parquet file via a temporary sibling, then move it into place.
fn write_parquet_file(path: &Path, batch: &RecordBatch, props: WriterProperties) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let file = File::create(&tmp_path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    fs::rename(&tmp_path, path)?;
    debug!(path = %path.display(), rows = batch.num_rows(), "wrote parquet file");
    Ok(())
}

fn ensure_writable(target: &Path, overwrite: bool) -> Result<()> {
    if target.exists() && !overwrite {
        return Err(Error::AlreadyExists {
            path: target.to_path_buf(),
        });
    }
    Ok(())
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".staging");
    target.with_file_name(name)
}

/// Move `staged` over `target`, removing any previous cache first.
fn swap_into_place(staged: &Path, target: &Path) -> Result<()> {
    if target.is_dir() {
        fs::remove_dir_all(target)?;
    } else if target.exists() {
        fs::remove_file(target)?;
    }
    fs::rename(staged, target)?;
    Ok(())
}

pub(super) fn write_partitioned(
    target: &Path,
    batch: &RecordBatch,
    partition_column: &str,
    text_columns: &[String],
    overwrite: bool,
    options: &TableOptions,
) -> Result<CacheSummary> {
    // 1) refuse to clobber an existing cache unless asked
    ensure_writable(target, overwrite)?;
    let part_idx = batch
        .schema_ref()
        .index_of(partition_column)
        .map_err(|_| Error::unknown_column(partition_column, "partition column"))?;

    // 2) sanitize text columns; the partition column is stored as text and
    //    upper-cased only when it is one of them
    let normalized = text_columns.iter().any(|c| c == partition_column);
    let batch = with_text_column(&normalize_text(batch, text_columns)?, part_idx)?;
    let rows = batch.num_rows();

    // 3) row indices per distinct value
    let keys = as_utf8(batch.column(part_idx))?;
    let mut groups: BTreeMap<Option<String>, Vec<u32>> = BTreeMap::new();
    for (row, key) in keys.iter().enumerate() {
        groups
            .entry(key.map(str::to_string))
            .or_default()
            .push(row_index(row)?);
    }

    // partition values live in directory names, not in the files
    let full_schema = tagged_schema(&batch.schema(), Some((partition_column, normalized)))?;
    let data = batch.with_schema(full_schema.clone())?;
    let mut data_cols: Vec<usize> = (0..data.num_columns()).collect();
    data_cols.remove(part_idx);
    let data = data.project(&data_cols)?;

    // 4) write into a staging directory, one file per partition
    let staged = staging_path(target);
    if staged.exists() {
        warn!(path = %staged.display(), "removing leftover staging directory");
        fs::remove_dir_all(&staged)?;
    }
    fs::create_dir_all(&staged)?;
    write_parquet_file(
        &staged.join(SCHEMA_FILE),
        &RecordBatch::new_empty(full_schema),
        options.writer_properties()?,
    )?;

    let props = options.writer_properties()?;
    groups
        .par_iter()
        .map(|(key, rows)| -> Result<()> {
            let dir_value = match key {
                Some(v) => escape_partition_value(v),
                None => NULL_PARTITION.to_string(),
            };
            let dir = staged.join(format!("{}={}", partition_column, dir_value));
            fs::create_dir_all(&dir)?;
            let indices = UInt32Array::from(rows.clone());
            let part = take_record_batch(&data, &indices)?;
            write_parquet_file(&dir.join("part-0.parquet"), &part, props.clone())
        })
        .collect::<Result<Vec<()>>>()?;

    // 5) replace the previous cache
    swap_into_place(&staged, target)?;

    Ok(CacheSummary {
        path: target.to_path_buf(),
        layout: CacheLayout::Partitioned,
        partitions: groups.len(),
        rows,
    })
}

pub(super) fn write_flat(
    target: &Path,
    batch: &RecordBatch,
    text_columns: &[String],
    overwrite: bool,
    options: &TableOptions,
) -> Result<CacheSummary> {
    ensure_writable(target, overwrite)?;
    let batch = normalize_text(batch, text_columns)?;
    let schema = tagged_schema(&batch.schema(), None)?;
    let batch = batch.with_schema(schema)?;

    let staged = staging_path(target);
    write_parquet_file(&staged, &batch, options.writer_properties()?)?;
    swap_into_place(&staged, target)?;

    Ok(CacheSummary {
        path: target.to_path_buf(),
        layout: CacheLayout::Flat,
        partitions: 1,
        rows: batch.num_rows(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_keeps_plain_names_readable() {
        assert_eq!(escape_partition_value("CREATININE SERUM"), "CREATININE SERUM");
        assert_eq!(escape_partition_value("BP S/D"), "BP S%2FD");
        assert_eq!(escape_partition_value("50% O2"), "50%25 O2");
        assert_eq!(escape_partition_value(".."), "%2E.");
    }

    #[test]
    fn unescape_inverts_escape() {
        for v in ["BP S/D", "a=b", "50% O2", "..", "C:\\X", "plain", "%"] {
            assert_eq!(unescape_partition_value(&escape_partition_value(v)), v);
        }
        assert_eq!(unescape_partition_value("100%"), "100%");
        assert_eq!(unescape_partition_value("%zz"), "%zz");
    }
}
