// src/query/mod.rs
pub mod pivot;
pub mod predicate;

pub use pivot::pivot_mean;
pub use predicate::{Predicate, Predicates};

use arrow::{
    array::{BooleanArray, StringArray},
    compute::{and, cast, filter_record_batch, is_not_null},
    datatypes::DataType,
    record_batch::RecordBatch,
};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::process::{as_utf8, strip_sentinel};
use crate::schema::{is_day_offset_column, TableDescriptor, SENTINEL_TOKENS};

/// Canonical text of a boolean predicate literal, matching how Arrow renders
/// boolean cells. Anything unrecognized is returned unchanged.
fn boolean_literal(value: &str) -> String {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" => "true".to_string(),
        "0" | "false" | "f" | "no" | "n" => "false".to_string(),
        _ => value.to_string(),
    }
}

/// Applies predicates and sentinel exclusion to an in-memory table.
#[derive(Debug, Clone, Default)]
pub struct QueryEngine {
    /// Predicate values on these columns are upper-cased to match normalized data.
    text_columns: Vec<String>,
    /// Validated like day offsets even when the name does not say so.
    sentinel_columns: Vec<String>,
}

impl QueryEngine {
    pub fn new(text_columns: Vec<String>, sentinel_columns: Vec<String>) -> Self {
        Self {
            text_columns,
            sentinel_columns,
        }
    }

    pub fn for_descriptor(descriptor: &TableDescriptor) -> Self {
        Self::new(
            descriptor.text_columns.clone(),
            descriptor.sentinel_columns.clone(),
        )
    }

    /// Same engine, also normalizing predicate values on `column`.
    pub fn with_text_column(&self, column: &str) -> Self {
        let mut engine = self.clone();
        if !engine.text_columns.iter().any(|c| c == column) {
            engine.text_columns.push(column.to_string());
        }
        engine
    }

    fn validated_columns<'b>(&self, batch: &'b RecordBatch) -> Vec<&'b str> {
        batch
            .schema_ref()
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .filter(|n| is_day_offset_column(n) || self.sentinel_columns.iter().any(|c| c == n))
            .collect()
    }

    fn membership_mask(&self, batch: &RecordBatch, predicate: &Predicate) -> Result<BooleanArray> {
        let idx = batch
            .schema_ref()
            .index_of(&predicate.column)
            .map_err(|_| Error::unknown_column(&predicate.column, format!("predicate {}", predicate)))?;

        let normalize = self.text_columns.iter().any(|c| c == &predicate.column);
        let wanted: BTreeSet<String> = if batch.column(idx).data_type() == &DataType::Boolean {
            predicate.values.iter().map(|v| boolean_literal(v)).collect()
        } else if normalize {
            predicate.values.iter().map(|v| v.to_uppercase()).collect()
        } else {
            predicate.values.clone()
        };

        let text = cast(batch.column(idx), &DataType::Utf8)?;
        let sarr: &StringArray = as_utf8(&text)?;
        Ok(sarr
            .iter()
            .map(|opt| Some(opt.is_some_and(|v| wanted.contains(v))))
            .collect())
    }

    /// Keep rows matching every predicate, then drop rows whose day-offset
    /// columns hold anything but a non-negative integer.
    pub fn filter(&self, batch: &RecordBatch, predicates: &Predicates) -> Result<RecordBatch> {
        // 1) reject unknown columns before touching any data
        for column in predicates.columns() {
            if batch.schema_ref().index_of(column).is_err() {
                return Err(Error::unknown_column(column, format!("query {}", predicates)));
            }
        }

        // 2) AND of set-membership masks
        let mut out = batch.clone();
        if !predicates.is_empty() {
            let mut mask: Option<BooleanArray> = None;
            for predicate in predicates {
                let m = self.membership_mask(batch, predicate)?;
                mask = Some(match mask {
                    Some(prev) => and(&prev, &m)?,
                    None => m,
                });
            }
            if let Some(mask) = mask {
                out = filter_record_batch(&out, &mask)?;
            }
        }
        debug!(rows_in = batch.num_rows(), rows_out = out.num_rows(), "predicates applied");

        // 3) sentinel exclusion
        for column in self.validated_columns(batch) {
            let (clean, residual) = strip_sentinel(&out, column, SENTINEL_TOKENS)?;
            if residual.num_rows() > 0 {
                info!(column, excluded = residual.num_rows(), "excluded censored day offsets");
            }
            out = clean;
        }
        Ok(out)
    }

    /// Drop rows null in any of `columns`; columns not in the table are ignored.
    pub fn drop_nulls(batch: &RecordBatch, columns: &[String]) -> Result<RecordBatch> {
        let mut out = batch.clone();
        for column in columns {
            let Ok(idx) = out.schema_ref().index_of(column) else {
                continue;
            };
            let mask = is_not_null(out.column(idx))?;
            out = filter_record_batch(&out, &mask)?;
        }
        Ok(out)
    }

    /// Entries of `values` containing `query`, ignoring case, in their original order.
    pub fn search<S: AsRef<str>>(values: &[S], query: &str) -> Vec<String> {
        let needle = query.to_uppercase();
        values
            .iter()
            .map(AsRef::as_ref)
            .filter(|v| v.to_uppercase().contains(&needle))
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, UInt64Array};
    use arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    fn labs() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("encounter_id", DataType::UInt64, true),
            Field::new("lab_component_name", DataType::Utf8, true),
            Field::new("lab_collection_days_since_birth", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(UInt64Array::from(vec![
                    Some(1),
                    Some(1),
                    Some(2),
                    Some(2),
                    None,
                ])),
                Arc::new(StringArray::from(vec![
                    "CREATININE SERUM",
                    "TROPONIN I",
                    "CREATININE SERUM",
                    "TROPONIN I",
                    "CREATININE SERUM",
                ])),
                Arc::new(StringArray::from(vec![
                    "20000", "20000", "20001", ">32507", "20002",
                ])),
            ],
        )
        .unwrap()
    }

    fn engine() -> QueryEngine {
        QueryEngine::new(
            vec!["lab_component_name".into()],
            vec!["lab_collection_days_since_birth".into()],
        )
    }

    fn ids(batch: &RecordBatch) -> Vec<Option<u64>> {
        batch
            .column(0)
            .as_any()
            .downcast_ref::<UInt64Array>()
            .unwrap()
            .iter()
            .collect()
    }

    #[test]
    fn predicates_are_anded() {
        let p = Predicates::new()
            .with("lab_component_name", ["creatinine serum"])
            .with("encounter_id", [1]);
        let out = engine().filter(&labs(), &p).unwrap();
        assert_eq!(ids(&out), vec![Some(1)]);
    }

    #[test]
    fn empty_predicates_only_strip_sentinels() {
        let out = engine().filter(&labs(), &Predicates::new()).unwrap();
        assert_eq!(out.num_rows(), 4);
    }

    #[test]
    fn unknown_column_is_rejected() {
        let p = Predicates::new().with("flowsheet_value", ["1"]);
        let err = engine().filter(&labs(), &p).unwrap_err();
        assert!(matches!(err, Error::UnknownColumn { column, .. } if column == "flowsheet_value"));
    }

    #[test]
    fn drop_nulls_removes_missing_ids() {
        let out =
            QueryEngine::drop_nulls(&labs(), &["encounter_id".into(), "absent".into()]).unwrap();
        assert_eq!(out.num_rows(), 4);
        assert_eq!(out.column(0).null_count(), 0);
    }

    #[test]
    fn boolean_columns_accept_numeric_literals() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("encounter_id", DataType::UInt64, true),
            Field::new("death_during_encounter", DataType::Boolean, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(UInt64Array::from(vec![1, 2, 3])),
                Arc::new(BooleanArray::from(vec![Some(true), Some(false), None])),
            ],
        )
        .unwrap();
        let engine = QueryEngine::default();

        let dead = engine
            .filter(&batch, &Predicates::new().with("death_during_encounter", [1]))
            .unwrap();
        assert_eq!(ids(&dead), vec![Some(1)]);
        let alive = engine
            .filter(&batch, &Predicates::new().with("death_during_encounter", ["False"]))
            .unwrap();
        assert_eq!(ids(&alive), vec![Some(2)]);
        let none = engine
            .filter(&batch, &Predicates::new().with("death_during_encounter", ["maybe"]))
            .unwrap();
        assert_eq!(none.num_rows(), 0);
    }

    #[test]
    fn search_is_case_insensitive_and_ordered() {
        let values = vec!["CABG", "tavr", "cabg redo", "PCI"];
        assert_eq!(QueryEngine::search(&values, "Cab"), vec!["CABG", "cabg redo"]);
        assert!(QueryEngine::search(&values, "xyz").is_empty());
    }
}
