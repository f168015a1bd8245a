// src/source.rs
use arrow::{
    array::ArrayRef,
    compute::concat_batches,
    csv::{reader::Format, ReaderBuilder},
    datatypes::{DataType, Field, Schema, SchemaRef},
    record_batch::{RecordBatch, RecordBatchReader},
};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tracing::{debug, info, instrument};

use crate::config::TableOptions;
use crate::error::{Error, Result};
use crate::process::{convert_to_expected_types, LoadReport};
use crate::schema::SemanticType;

/// Reader over one delimited export file.
#[derive(Debug, Clone)]
pub struct RawSource {
    path: PathBuf,
    options: TableOptions,
}

impl RawSource {
    pub fn new(path: impl Into<PathBuf>, options: TableOptions) -> Self {
        Self {
            path: path.into(),
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn open(&self) -> Result<File> {
        File::open(&self.path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound {
                path: self.path.clone(),
            },
            _ => Error::Io(e),
        })
    }

    fn format(&self) -> Format {
        Format::default()
            .with_header(true)
            .with_delimiter(self.options.delimiter)
    }

    fn malformed(&self, source: arrow::error::ArrowError) -> Error {
        Error::MalformedInput {
            path: self.path.clone(),
            source,
        }
    }

    /// Header names, read from the header plus a few sample rows.
    pub fn columns(&self) -> Result<Vec<String>> {
        let file = self.open()?;
        let (schema, _) = self
            .format()
            .infer_schema(BufReader::new(file), Some(self.options.header_sample_rows))
            .map_err(|e| self.malformed(e))?;
        Ok(schema.fields().iter().map(|f| f.name().clone()).collect())
    }

    /// Every column typed as text; the reader never guesses types.
    fn text_schema(&self) -> Result<SchemaRef> {
        let fields: Vec<Field> = self
            .columns()?
            .into_iter()
            .map(|name| Field::new(name, DataType::Utf8, true))
            .collect();
        Ok(Arc::new(Schema::new(fields)))
    }

    fn read(&self, schema: SchemaRef, projection: Option<Vec<usize>>) -> Result<RecordBatch> {
        let file = self.open()?;
        let mut builder = ReaderBuilder::new(schema)
            .with_format(self.format())
            .with_batch_size(self.options.batch_size);
        if let Some(projection) = projection {
            builder = builder.with_projection(projection);
        }
        let reader = builder
            .build(BufReader::new(file))
            .map_err(|e| self.malformed(e))?;
        let out_schema = reader.schema();

        let mut batches = Vec::new();
        let mut rows = 0usize;
        for batch in reader {
            let batch = batch.map_err(|e| self.malformed(e))?;
            if let Some(max) = self.options.max_rows {
                if rows + batch.num_rows() >= max {
                    batches.push(batch.slice(0, max - rows));
                    debug!(max_rows = max, "row cap reached");
                    break;
                }
            }
            rows += batch.num_rows();
            batches.push(batch);
        }

        concat_batches(&out_schema, &batches).map_err(Into::into)
    }

    /// Whole file as text columns.
    pub fn load_text(&self) -> Result<RecordBatch> {
        let schema = self.text_schema()?;
        self.read(schema, None)
    }

    /// Whole file, with declared columns cast to their types where every value fits.
    #[instrument(level = "info", skip(self, dtypes), fields(path = %self.path.display()))]
    pub fn load(
        &self,
        dtypes: &BTreeMap<String, SemanticType>,
    ) -> Result<(RecordBatch, LoadReport)> {
        let start = Instant::now();
        let text = self.load_text()?;
        let (batch, report) = convert_to_expected_types(&text, dtypes)?;
        info!(
            rows = batch.num_rows(),
            columns = batch.num_columns(),
            downgraded = report.downgraded.len(),
            elapsed = ?start.elapsed(),
            "loaded raw table"
        );
        Ok((batch, report))
    }

    /// One column as text, without materializing the rest of the file.
    pub fn load_column(&self, name: &str) -> Result<ArrayRef> {
        let schema = self.text_schema()?;
        let idx = schema.index_of(name).map_err(|_| Error::MissingColumn {
            column: name.to_string(),
            path: self.path.clone(),
        })?;
        let batch = self.read(schema, Some(vec![idx]))?;
        Ok(batch.column(0).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Downgrade;
    use anyhow::Result;
    use arrow::array::{Array, StringArray, UInt64Array};
    use std::fs;
    use tempfile::TempDir;

    fn write_csv(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        path
    }

    const LABS: &str = "encounter_id,lab_component_name,lab_result_value,lab_collection_days_since_birth\n\
1,Creatinine Serum,1.1,20000\n\
1,Troponin I,0.01,20000\n\
2,Creatinine Serum,0.9,>32507\n";

    #[test]
    fn columns_reads_header() -> Result<()> {
        let dir = TempDir::new()?;
        let src = RawSource::new(write_csv(&dir, "labs.csv", LABS), TableOptions::default());
        assert_eq!(
            src.columns()?,
            vec![
                "encounter_id",
                "lab_component_name",
                "lab_result_value",
                "lab_collection_days_since_birth"
            ]
        );
        Ok(())
    }

    #[test]
    fn missing_file_is_not_found() {
        let src = RawSource::new("/nonexistent/Table3_Lab.csv", TableOptions::default());
        assert!(matches!(src.columns(), Err(Error::NotFound { .. })));
        assert!(matches!(
            src.load(&BTreeMap::new()),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn load_casts_clean_columns_and_reports_downgrades() -> Result<()> {
        let dir = TempDir::new()?;
        let src = RawSource::new(write_csv(&dir, "labs.csv", LABS), TableOptions::default());
        let dtypes: BTreeMap<String, SemanticType> = [
            ("encounter_id".to_string(), SemanticType::UnsignedInt),
            (
                "lab_collection_days_since_birth".to_string(),
                SemanticType::UnsignedInt,
            ),
        ]
        .into_iter()
        .collect();

        let (batch, report) = src.load(&dtypes)?;
        assert_eq!(batch.num_rows(), 3);
        let ids = batch
            .column(0)
            .as_any()
            .downcast_ref::<UInt64Array>()
            .unwrap();
        assert_eq!(ids.values().to_vec(), vec![1, 1, 2]);
        assert_eq!(batch.column(3).data_type(), &DataType::Utf8);
        assert_eq!(
            report.downgraded,
            vec![Downgrade {
                column: "lab_collection_days_since_birth".into(),
                target: SemanticType::UnsignedInt,
                failed_rows: 1,
            }]
        );
        Ok(())
    }

    #[test]
    fn load_column_projects_one_column() -> Result<()> {
        let dir = TempDir::new()?;
        let src = RawSource::new(write_csv(&dir, "labs.csv", LABS), TableOptions::default());
        let col = src.load_column("lab_component_name")?;
        let names = col.as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(names.len(), 3);
        assert_eq!(names.value(1), "Troponin I");

        assert!(matches!(
            src.load_column("nope"),
            Err(Error::MissingColumn { column, .. }) if column == "nope"
        ));
        Ok(())
    }

    #[test]
    fn max_rows_caps_the_load() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = TableOptions {
            max_rows: Some(2),
            batch_size: 1,
            ..Default::default()
        };
        let src = RawSource::new(write_csv(&dir, "labs.csv", LABS), opts);
        assert_eq!(src.load_text()?.num_rows(), 2);
        Ok(())
    }

    #[test]
    fn ragged_rows_are_malformed() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_csv(&dir, "bad.csv", "a,b\n1,2\n3,4,5,6\n");
        let src = RawSource::new(path, TableOptions::default());
        assert!(matches!(src.load_text(), Err(Error::MalformedInput { .. })));
        Ok(())
    }

    #[test]
    fn pipe_delimited_input() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_csv(&dir, "p.csv", "a|b\n1|x\n");
        let opts = TableOptions {
            delimiter: b'|',
            ..Default::default()
        };
        let src = RawSource::new(path, opts);
        assert_eq!(src.columns()?, vec!["a", "b"]);
        assert_eq!(src.load_text()?.num_rows(), 1);
        Ok(())
    }
}
