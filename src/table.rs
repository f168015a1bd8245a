// src/table.rs

use arrow::{
    datatypes::{Field, Schema},
    record_batch::RecordBatch,
};
use once_cell::sync::OnceCell;
use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheSummary, PartitionedCache};
use crate::config::TableOptions;
use crate::error::{Error, Result};
use crate::process::{as_utf8, convert_to_expected_types, normalize_text, LoadReport};
use crate::query::{pivot_mean, Predicates, QueryEngine};
use crate::schema::{TableDescriptor, TableKind};
use crate::source::RawSource;

/// How [`Table::sel_with`] resolves a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectOptions {
    /// Read through the cache when one exists.
    pub use_cache: bool,
    /// Apply the catalog's rename map to the output columns.
    pub rename_columns: bool,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            rename_columns: true,
        }
    }
}

/// Raw file loaded once, typed and normalized.
struct Loaded {
    batch: RecordBatch,
    report: LoadReport,
}

/// One clinical export: its raw file, its cache and the queries over them.
///
/// Header, unique values and the full raw load are each computed at most
/// once per instance and dropped with it. Nothing here writes to disk except
/// the `partition*` methods.
pub struct Table {
    descriptor: TableDescriptor,
    source: RawSource,
    cache: PartitionedCache,
    engine: QueryEngine,
    columns: OnceCell<Vec<String>>,
    unique: OnceCell<Vec<String>>,
    loaded: OnceCell<Loaded>,
    select_report: Mutex<Option<LoadReport>>,
}

impl Table {
    /// Table for an export whose kind is known from its file name.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_options(path, TableOptions::default())
    }

    pub fn with_options<P: AsRef<Path>>(path: P, options: TableOptions) -> Result<Self> {
        Ok(Self::from_descriptor(
            TableDescriptor::from_path(path)?,
            options,
        ))
    }

    /// Table for a file whose name does not follow the export naming.
    pub fn for_kind<P: AsRef<Path>>(path: P, kind: TableKind, options: TableOptions) -> Self {
        Self::from_descriptor(TableDescriptor::for_kind(path, kind), options)
    }

    fn from_descriptor(descriptor: TableDescriptor, options: TableOptions) -> Self {
        let cache = PartitionedCache::for_source(&descriptor.file_path, options.clone());
        let source = RawSource::new(descriptor.file_path.clone(), options);
        let engine = QueryEngine::for_descriptor(&descriptor);
        Self {
            descriptor,
            source,
            cache,
            engine,
            columns: OnceCell::new(),
            unique: OnceCell::new(),
            loaded: OnceCell::new(),
            select_report: Mutex::new(None),
        }
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub fn kind(&self) -> TableKind {
        self.descriptor.table_kind
    }

    pub fn path(&self) -> &Path {
        self.source.path()
    }

    pub fn cache(&self) -> &PartitionedCache {
        &self.cache
    }

    /// Column names in file order, from the raw header. When only a cache is
    /// on disk its recorded column order stands in.
    pub fn columns(&self) -> Result<&[String]> {
        self.columns
            .get_or_try_init(|| {
                if !self.source.exists() && self.cache.exists() {
                    debug!(path = %self.path().display(), "raw file absent; using cache header");
                    return self.cache.columns();
                }
                self.source.columns()
            })
            .map(Vec::as_slice)
    }

    fn search_column(&self) -> Result<&str> {
        self.descriptor
            .search_column
            .as_deref()
            .ok_or(Error::NoSearchColumn {
                kind: self.descriptor.table_kind,
            })
    }

    fn ensure_known<'c>(
        &self,
        columns: impl IntoIterator<Item = &'c str>,
        context: impl Fn() -> String,
    ) -> Result<()> {
        let known = self.columns()?;
        for column in columns {
            if !known.iter().any(|k| k == column) {
                return Err(Error::unknown_column(column, context()));
            }
        }
        Ok(())
    }

    /// Upper-cased non-null values of `column`, in file order.
    fn column_values(&self, column: &str) -> Result<Vec<String>> {
        let raw = self.descriptor.raw_column_name(column);
        self.ensure_known([raw], || format!("{}", self.path().display()))?;
        let arr = self.source.load_column(raw)?;
        Ok(as_utf8(&arr)?
            .iter()
            .flatten()
            .map(str::to_uppercase)
            .collect())
    }

    /// Distinct normalized values of the search column, first-seen order.
    pub fn unique(&self) -> Result<&[String]> {
        self.unique
            .get_or_try_init(|| {
                let column = self.search_column()?;
                self.unique_in(column)
            })
            .map(Vec::as_slice)
    }

    /// Distinct normalized values of any column. Not memoized.
    pub fn unique_in(&self, column: &str) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        Ok(self
            .column_values(column)?
            .into_iter()
            .filter(|v| seen.insert(v.clone()))
            .collect())
    }

    /// Unique search-column values containing `query`, ignoring case.
    pub fn search(&self, query: &str) -> Result<Vec<String>> {
        Ok(QueryEngine::search(self.unique()?, query))
    }

    /// Values of `column` containing `query`, one entry per matching row.
    pub fn search_in(&self, query: &str, column: &str) -> Result<Vec<String>> {
        Ok(QueryEngine::search(&self.column_values(column)?, query))
    }

    fn loaded(&self) -> Result<&Loaded> {
        self.loaded.get_or_try_init(|| {
            let (batch, report) = self.source.load(&self.descriptor.expected_dtypes)?;
            let batch = normalize_text(&batch, &self.descriptor.text_columns)?;
            Ok(Loaded { batch, report })
        })
    }

    /// Downgrades recorded by the raw load, once one has happened.
    pub fn load_report(&self) -> Option<&LoadReport> {
        self.loaded.get().map(|l| &l.report)
    }

    /// Downgrades from the type conformance of the most recent `sel*` call,
    /// whichever path served it.
    pub fn select_report(&self) -> Option<LoadReport> {
        self.select_report.lock().ok().and_then(|r| r.clone())
    }

    /// Rows matching every predicate, read through the cache when present.
    pub fn sel(&self, predicates: &Predicates) -> Result<RecordBatch> {
        self.sel_with(predicates, SelectOptions::default())
    }

    /// Rows whose search column holds one of `values`.
    pub fn sel_default<I, V>(&self, values: I) -> Result<RecordBatch>
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        let column = self.search_column()?.to_string();
        self.sel(&Predicates::new().with(column, values))
    }

    #[instrument(level = "info", skip(self, predicates), fields(path = %self.path().display(), query = %predicates))]
    pub fn sel_with(&self, predicates: &Predicates, options: SelectOptions) -> Result<RecordBatch> {
        // 1) resolve renamed columns and reject unknown ones before reading rows
        let predicates = predicates.map_columns(|c| self.descriptor.raw_column_name(c).to_string());
        self.ensure_known(predicates.columns(), || format!("query {}", predicates))?;

        // 2) cache path, falling back to the raw file
        let mut selected = None;
        if options.use_cache && self.cache.exists() {
            match self.cache.status(self.path()) {
                Ok(status) if status.stale => warn!(
                    cache = ?status.path,
                    "source is newer than its cache; rebuild with overwrite to refresh"
                ),
                _ => {}
            }
            match self.cache.read(&predicates, &self.engine) {
                Ok(batch) => selected = Some(batch),
                Err(e) => warn!(error = %e, "cache read failed; using raw file"),
            }
        }
        let batch = match selected {
            Some(batch) => batch,
            None => self.engine.filter(&self.loaded()?.batch, &predicates)?,
        };

        // 3) required columns, declared types, output names
        let batch = QueryEngine::drop_nulls(&batch, &self.descriptor.required_columns)?;
        let (batch, report) = convert_to_expected_types(&batch, &self.descriptor.expected_dtypes)?;
        if !report.is_clean() {
            let columns: Vec<&str> = report.downgraded_columns().collect();
            debug!(?columns, "selection kept text columns");
        }
        if let Ok(mut last) = self.select_report.lock() {
            *last = Some(report);
        }
        let no_renames = BTreeMap::new();
        let renames = if options.rename_columns {
            &self.descriptor.rename_map
        } else {
            &no_renames
        };
        let batch = rename_columns(&batch, renames)?;
        info!(rows = batch.num_rows(), "selected");
        Ok(batch)
    }

    /// Selected observations pivoted wide, one mean column per category.
    pub fn sel_pivot(&self, predicates: &Predicates) -> Result<RecordBatch> {
        let layout = self.descriptor.pivot.as_ref().ok_or(Error::NoPivotLayout {
            kind: self.descriptor.table_kind,
        })?;
        let long = self.sel_with(
            predicates,
            SelectOptions {
                rename_columns: false,
                ..Default::default()
            },
        )?;
        let wide = pivot_mean(&long, layout)?;
        rename_columns(&wide, &self.descriptor.rename_map)
    }

    /// Partitioned cache on the search column.
    pub fn partition(&self, overwrite: bool) -> Result<CacheSummary> {
        let column = self.search_column()?.to_string();
        self.partition_on(&column, overwrite)
    }

    pub fn partition_on(&self, column: &str, overwrite: bool) -> Result<CacheSummary> {
        let column = self.descriptor.raw_column_name(column);
        self.ensure_known([column], || "partition column".to_string())?;
        let loaded = self.loaded()?;
        self.cache
            .build(&loaded.batch, column, &self.descriptor.text_columns, overwrite)
    }

    /// Single-file cache of the whole table.
    pub fn partition_flat(&self, overwrite: bool) -> Result<CacheSummary> {
        let loaded = self.loaded()?;
        self.cache
            .build_flat(&loaded.batch, &self.descriptor.text_columns, overwrite)
    }

    /// Paths of the caches currently on disk.
    pub fn cache_paths(&self) -> Vec<PathBuf> {
        self.cache.cache_paths()
    }
}

/// Rename fields per `renames`; output carries no schema metadata.
fn rename_columns(batch: &RecordBatch, renames: &BTreeMap<String, String>) -> Result<RecordBatch> {
    let fields: Vec<Field> = batch
        .schema_ref()
        .fields()
        .iter()
        .map(|f| match renames.get(f.name()) {
            Some(to) => f.as_ref().clone().with_name(to),
            None => f.as_ref().clone(),
        })
        .collect();
    Ok(RecordBatch::try_new(
        Arc::new(Schema::new(fields)),
        batch.columns().to_vec(),
    )?)
}
