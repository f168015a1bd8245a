// src/cache/mod.rs
mod read;
mod write;

pub use write::{escape_partition_value, unescape_partition_value};

use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, instrument};

use crate::config::TableOptions;
use crate::error::Result;
use crate::query::{Predicates, QueryEngine};

pub const PART_SUFFIX: &str = ".part";
pub const FLAT_SUFFIX: &str = ".parquet";
/// Schema-level metadata key holding the source column order as a JSON list.
pub const COLUMNS_METADATA_KEY: &str = "tricorder.columns";
/// Schema-level metadata key naming the partition column.
pub const PARTITION_METADATA_KEY: &str = "tricorder.partition_column";
/// Schema-level metadata key: `"true"` when partition values were upper-cased.
pub const PARTITION_NORMALIZED_KEY: &str = "tricorder.partition_normalized";
/// Directory value for rows whose partition column is null.
pub const NULL_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";
/// Zero-row file at the root of a partitioned cache carrying the full schema.
pub const SCHEMA_FILE: &str = "_schema.parquet";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLayout {
    /// `<stem>.part/<column>=<value>/part-0.parquet`
    Partitioned,
    /// `<stem>.parquet`
    Flat,
}

/// Result of a cache build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheSummary {
    pub path: PathBuf,
    pub layout: CacheLayout,
    pub partitions: usize,
    pub rows: usize,
}

/// Where a cache stands relative to its source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub layout: Option<CacheLayout>,
    pub path: Option<PathBuf>,
    pub built_at: Option<DateTime<Utc>>,
    pub source_modified: Option<DateTime<Utc>>,
    /// Source was modified after the cache was written.
    pub stale: bool,
}

/// On-disk columnar cache for one export file.
///
/// The cache never invalidates itself; [`status`](Self::status) reports when
/// the source is newer and a rebuild with `overwrite` is up to the caller.
#[derive(Debug, Clone)]
pub struct PartitionedCache {
    part_dir: PathBuf,
    flat_file: PathBuf,
    options: TableOptions,
}

impl PartitionedCache {
    /// Cache paths sit next to `source`: `X.csv` → `X.part/` and `X.parquet`.
    pub fn for_source(source: &Path, options: TableOptions) -> Self {
        let root = source.parent().unwrap_or_else(|| Path::new(""));
        let stem = source
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.split('.').next())
            .unwrap_or_default();
        Self {
            part_dir: root.join(format!("{}{}", stem, PART_SUFFIX)),
            flat_file: root.join(format!("{}{}", stem, FLAT_SUFFIX)),
            options,
        }
    }

    pub fn part_path(&self) -> &Path {
        &self.part_dir
    }

    pub fn flat_path(&self) -> &Path {
        &self.flat_file
    }

    pub fn exists(&self) -> bool {
        self.part_dir.exists() || self.flat_file.exists()
    }

    /// The layout reads will use; partitioned wins when both exist.
    pub fn layout(&self) -> Option<CacheLayout> {
        if self.part_dir.exists() {
            Some(CacheLayout::Partitioned)
        } else if self.flat_file.exists() {
            Some(CacheLayout::Flat)
        } else {
            None
        }
    }

    /// Cache paths present on disk, partitioned first.
    pub fn cache_paths(&self) -> Vec<PathBuf> {
        [&self.part_dir, &self.flat_file]
            .into_iter()
            .filter(|p| p.exists())
            .cloned()
            .collect()
    }

    fn active_path(&self) -> Option<&Path> {
        match self.layout()? {
            CacheLayout::Partitioned => Some(&self.part_dir),
            CacheLayout::Flat => Some(&self.flat_file),
        }
    }

    /// Partition `batch` on `partition_column` after upper-casing `text_columns`.
    #[instrument(level = "info", skip(self, batch, text_columns), fields(path = %self.part_dir.display()))]
    pub fn build(
        &self,
        batch: &RecordBatch,
        partition_column: &str,
        text_columns: &[String],
        overwrite: bool,
    ) -> Result<CacheSummary> {
        let summary = write::write_partitioned(
            &self.part_dir,
            batch,
            partition_column,
            text_columns,
            overwrite,
            &self.options,
        )?;
        info!(
            partitions = summary.partitions,
            rows = summary.rows,
            "partitioned cache written"
        );
        Ok(summary)
    }

    /// Single-file form of the cache.
    #[instrument(level = "info", skip(self, batch, text_columns), fields(path = %self.flat_file.display()))]
    pub fn build_flat(
        &self,
        batch: &RecordBatch,
        text_columns: &[String],
        overwrite: bool,
    ) -> Result<CacheSummary> {
        let summary =
            write::write_flat(&self.flat_file, batch, text_columns, overwrite, &self.options)?;
        info!(rows = summary.rows, "flat cache written");
        Ok(summary)
    }

    /// Load the cache, skipping partitions the predicates rule out, then filter.
    pub fn read(&self, predicates: &Predicates, engine: &QueryEngine) -> Result<RecordBatch> {
        let batch = read::read_cache(self, Some(predicates))?;
        match read::normalized_partition_column(batch.schema_ref()) {
            Some(column) => engine.with_text_column(column).filter(&batch, predicates),
            None => engine.filter(&batch, predicates),
        }
    }

    /// Every cached row.
    pub fn read_all(&self) -> Result<RecordBatch> {
        read::read_cache(self, None)
    }

    /// Column names in source order, from cache metadata.
    pub fn columns(&self) -> Result<Vec<String>> {
        read::cached_columns(self)
    }

    /// Modification times of the active cache and `source`.
    pub fn status(&self, source: &Path) -> Result<CacheStatus> {
        let modified = |p: &Path| -> Option<DateTime<Utc>> {
            fs::metadata(p)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from)
        };

        let layout = self.layout();
        let path = self.active_path().map(Path::to_path_buf);
        let built_at = match layout {
            Some(CacheLayout::Partitioned) => modified(&self.part_dir.join(SCHEMA_FILE))
                .or_else(|| modified(&self.part_dir)),
            Some(CacheLayout::Flat) => modified(&self.flat_file),
            None => None,
        };
        let source_modified = modified(source);
        let stale = matches!((built_at, source_modified), (Some(b), Some(s)) if s > b);

        Ok(CacheStatus {
            layout,
            path,
            built_at,
            source_modified,
            stale,
        })
    }
}
