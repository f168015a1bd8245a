// src/cache/read.rs

use arrow::{
    array::{new_null_array, ArrayRef, StringArray},
    compute::{cast, concat_batches},
    datatypes::{DataType, Schema, SchemaRef},
    record_batch::RecordBatch,
};
use glob::{glob, Pattern};
use parquet::{arrow::arrow_reader::ParquetRecordBatchReaderBuilder, errors::ParquetError};
use std::{
    collections::BTreeSet,
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, instrument};

use super::{
    unescape_partition_value, CacheLayout, PartitionedCache, COLUMNS_METADATA_KEY,
    NULL_PARTITION, PARTITION_METADATA_KEY, PARTITION_NORMALIZED_KEY, SCHEMA_FILE,
};
use crate::error::{Error, Result};
use crate::query::Predicates;

fn open(path: &Path) -> Result<ParquetRecordBatchReaderBuilder<File>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound {
            path: path.to_path_buf(),
        },
        _ => e.into(),
    })?;
    Ok(ParquetRecordBatchReaderBuilder::try_new(file)?)
}

/// Whole file as one batch, with the schema the file was written with.
fn read_file(path: &Path) -> Result<RecordBatch> {
    let builder = open(path)?;
    let schema = builder.schema().clone();
    let batches = builder
        .build()?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(concat_batches(&schema, &batches)?)
}

fn file_schema(path: &Path) -> Result<SchemaRef> {
    Ok(open(path)?.schema().clone())
}

/// `Some(value)` for `<column>=<value>`, `None` for the null partition.
fn partition_value(file: &Path) -> Option<Option<String>> {
    let dir = file.parent()?.file_name()?.to_str()?;
    let (_, value) = dir.split_once('=')?;
    Some((value != NULL_PARTITION).then(|| unescape_partition_value(value)))
}

/// Partition column of a cache whose partition values were upper-cased.
pub(super) fn normalized_partition_column(schema: &Schema) -> Option<&str> {
    let metadata = schema.metadata();
    match metadata.get(PARTITION_NORMALIZED_KEY).map(String::as_str) {
        Some("true") => metadata.get(PARTITION_METADATA_KEY).map(String::as_str),
        _ => None,
    }
}

/// Values every predicate on `column` admits, upper-cased when the stored
/// keys are. `None` when nothing constrains the column.
fn admitted_values(
    predicates: &Predicates,
    column: &str,
    normalized: bool,
) -> Option<BTreeSet<String>> {
    predicates
        .iter()
        .filter(|p| p.column == column)
        .map(|p| {
            p.values
                .iter()
                .map(|v| if normalized { v.to_uppercase() } else { v.clone() })
                .collect::<BTreeSet<_>>()
        })
        .reduce(|a, b| a.intersection(&b).cloned().collect())
}

fn read_partitioned(root: &Path, predicates: Option<&Predicates>) -> Result<RecordBatch> {
    // 1) full schema and partition column from the root schema file
    let schema = file_schema(&root.join(SCHEMA_FILE))?;
    let partition_column = schema
        .metadata()
        .get(PARTITION_METADATA_KEY)
        .cloned()
        .ok_or_else(|| {
            ParquetError::General(format!(
                "{} has no `{}` metadata",
                root.display(),
                PARTITION_METADATA_KEY
            ))
        })?;
    let normalized = normalized_partition_column(&schema).is_some();
    let admitted = predicates.and_then(|p| admitted_values(p, &partition_column, normalized));

    // 2) list partition files, skipping ruled-out values
    let pattern = format!(
        "{}/*=*/*.parquet",
        Pattern::escape(&root.to_string_lossy())
    );
    let mut files: Vec<(PathBuf, Option<String>)> = Vec::new();
    let mut pruned = 0usize;
    for entry in glob(&pattern).map_err(|e| ParquetError::General(e.to_string()))? {
        let path = entry.map_err(|e| Error::Io(std::io::Error::from(e)))?;
        let Some(value) = partition_value(&path) else {
            continue;
        };
        let keep = match (&admitted, &value) {
            (None, _) => true,
            (Some(set), Some(v)) => set.contains(v),
            (Some(_), None) => false,
        };
        if keep {
            files.push((path, value));
        } else {
            pruned += 1;
        }
    }
    debug!(root = %root.display(), files = files.len(), pruned, "partition scan");

    // 3) rebuild each file to the full schema, partition column restored
    let mut parts = Vec::with_capacity(files.len());
    for (path, value) in files {
        let data = read_file(&path)?;
        let rows = data.num_rows();
        let cols: Vec<ArrayRef> = schema
            .fields()
            .iter()
            .map(|field| -> Result<ArrayRef> {
                if field.name() == &partition_column {
                    let arr: ArrayRef = match &value {
                        Some(v) => Arc::new(StringArray::from(vec![v.as_str(); rows])),
                        None => new_null_array(&DataType::Utf8, rows),
                    };
                    return Ok(cast(&arr, field.data_type())?);
                }
                match data.column_by_name(field.name()) {
                    Some(col) if col.data_type() == field.data_type() => Ok(col.clone()),
                    Some(col) => Ok(cast(col, field.data_type())?),
                    None => Ok(new_null_array(field.data_type(), rows)),
                }
            })
            .collect::<Result<_>>()?;
        parts.push(RecordBatch::try_new(schema.clone(), cols)?);
    }
    Ok(concat_batches(&schema, &parts)?)
}

/// Load the active cache; partitioned caches skip partitions `predicates`
/// cannot match. Filtering itself is left to the caller.
#[instrument(level = "debug", skip(cache, predicates))]
pub(super) fn read_cache(
    cache: &PartitionedCache,
    predicates: Option<&Predicates>,
) -> Result<RecordBatch> {
    match cache.layout() {
        Some(CacheLayout::Partitioned) => read_partitioned(&cache.part_dir, predicates),
        Some(CacheLayout::Flat) => read_file(&cache.flat_file),
        None => Err(Error::NotFound {
            path: cache.part_dir.clone(),
        }),
    }
}

/// Source column order recorded at build time.
pub(super) fn cached_columns(cache: &PartitionedCache) -> Result<Vec<String>> {
    let schema = match cache.layout() {
        Some(CacheLayout::Partitioned) => file_schema(&cache.part_dir.join(SCHEMA_FILE))?,
        Some(CacheLayout::Flat) => file_schema(&cache.flat_file)?,
        None => {
            return Err(Error::NotFound {
                path: cache.part_dir.clone(),
            })
        }
    };
    match schema.metadata().get(COLUMNS_METADATA_KEY) {
        Some(json) => Ok(serde_json::from_str(json)?),
        None => Ok(schema.fields().iter().map(|f| f.name().clone()).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Predicate;

    #[test]
    fn partition_value_from_directory() {
        let p = Path::new("/c/X.part/order_name=BP S%2FD/part-0.parquet");
        assert_eq!(partition_value(p), Some(Some("BP S/D".to_string())));
        let null = PathBuf::from(format!("/c/X.part/order_name={}/part-0.parquet", NULL_PARTITION));
        assert_eq!(partition_value(&null), Some(None));
        assert_eq!(partition_value(Path::new("/c/X.part/_schema.parquet")), None);
    }

    #[test]
    fn admitted_values_intersect_and_upper_case() {
        let mut p = Predicates::new().with("order_name", ["cabg", "tavr"]);
        p.push(Predicate::new("order_name", ["TAVR", "PCI"]));
        let got = admitted_values(&p, "order_name", true).unwrap();
        assert_eq!(got.into_iter().collect::<Vec<_>>(), vec!["TAVR"]);
        assert!(admitted_values(&p, "encounter_id", true).is_none());
    }

    #[test]
    fn admitted_values_keep_case_for_raw_keys() {
        let p = Predicates::new().with("lab_result_unit", ["mg/dL"]);
        let got = admitted_values(&p, "lab_result_unit", false).unwrap();
        assert_eq!(got.into_iter().collect::<Vec<_>>(), vec!["mg/dL"]);
    }
}
