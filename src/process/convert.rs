use arrow::{
    array::{Array, ArrayRef},
    compute::{cast_with_options, CastOptions},
    datatypes::{Field, Schema},
    record_batch::RecordBatch,
};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::warn;

use crate::error::Result;
use crate::schema::{map_to_arrow_type, SemanticType};

/// A column that kept its text form because some values would not cast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Downgrade {
    pub column: String,
    pub target: SemanticType,
    /// Non-null cells that failed the cast.
    pub failed_rows: usize,
}

/// What the typed load had to give up on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub rows: usize,
    pub downgraded: Vec<Downgrade>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.downgraded.is_empty()
    }

    pub fn downgraded_columns(&self) -> impl Iterator<Item = &str> {
        self.downgraded.iter().map(|d| d.column.as_str())
    }
}

/// Outcome of casting one column.
pub enum CastOutcome {
    Cast(ArrayRef),
    Downgraded { failed_rows: usize },
}

/// Cast `arr` to `target`, refusing to silently null out values.
///
/// A strict cast is tried first; when it fails, a lenient cast counts the cells
/// that would have been lost.
pub fn try_cast_column(arr: &ArrayRef, target: SemanticType) -> Result<CastOutcome> {
    let to = map_to_arrow_type(target);
    if arr.data_type() == &to {
        return Ok(CastOutcome::Cast(arr.clone()));
    }

    let strict = CastOptions {
        safe: false,
        ..Default::default()
    };
    match cast_with_options(arr, &to, &strict) {
        Ok(out) => Ok(CastOutcome::Cast(out)),
        Err(_) => {
            let lenient = cast_with_options(arr, &to, &CastOptions::default())?;
            let failed_rows = lenient.null_count().saturating_sub(arr.null_count());
            Ok(CastOutcome::Downgraded { failed_rows })
        }
    }
}

/// Convert columns named in `dtypes` to their declared types.
///
/// Columns that fail keep their current type and are listed in the report.
/// Columns absent from the batch are ignored.
pub fn convert_to_expected_types(
    batch: &RecordBatch,
    dtypes: &BTreeMap<String, SemanticType>,
) -> Result<(RecordBatch, LoadReport)> {
    let mut report = LoadReport {
        rows: batch.num_rows(),
        ..Default::default()
    };
    let schema = batch.schema();
    let mut fields: Vec<Field> = Vec::with_capacity(batch.num_columns());
    let mut out: Vec<ArrayRef> = Vec::with_capacity(batch.num_columns());

    for (fld, arr) in schema.fields().iter().zip(batch.columns()) {
        let Some(&target) = dtypes.get(fld.name()) else {
            fields.push(fld.as_ref().clone());
            out.push(arr.clone());
            continue;
        };

        match try_cast_column(arr, target)? {
            CastOutcome::Cast(col) => {
                fields.push(fld.as_ref().clone().with_data_type(col.data_type().clone()));
                out.push(col);
            }
            CastOutcome::Downgraded { failed_rows } => {
                warn!(
                    column = %fld.name(),
                    target = %target,
                    failed_rows,
                    "column kept as {} after cast failure",
                    arr.data_type()
                );
                report.downgraded.push(Downgrade {
                    column: fld.name().clone(),
                    target,
                    failed_rows,
                });
                fields.push(fld.as_ref().clone());
                out.push(arr.clone());
            }
        }
    }

    let schema = Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()));
    Ok((RecordBatch::try_new(schema, out)?, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{BooleanArray, StringArray, UInt64Array};
    use arrow::datatypes::DataType;

    fn text_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("encounter_id", DataType::Utf8, true),
            Field::new("flowsheet_days_since_birth", DataType::Utf8, true),
            Field::new("death_during_encounter", DataType::Utf8, true),
            Field::new("note", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("1"), Some("2"), None])),
                Arc::new(StringArray::from(vec![
                    Some("100"),
                    Some(">32507"),
                    Some("garbled"),
                ])),
                Arc::new(StringArray::from(vec![
                    Some("true"),
                    Some("false"),
                    Some("true"),
                ])),
                Arc::new(StringArray::from(vec![Some("a"), Some("b"), Some("c")])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn clean_columns_cast_and_garbled_columns_downgrade() {
        let dtypes: BTreeMap<String, SemanticType> = [
            ("encounter_id", SemanticType::UnsignedInt),
            ("flowsheet_days_since_birth", SemanticType::UnsignedInt),
            ("death_during_encounter", SemanticType::Boolean),
            ("absent", SemanticType::Float),
        ]
        .into_iter()
        .map(|(c, t)| (c.to_string(), t))
        .collect();

        let (out, report) = convert_to_expected_types(&text_batch(), &dtypes).unwrap();

        let ids = out
            .column(0)
            .as_any()
            .downcast_ref::<UInt64Array>()
            .unwrap();
        assert_eq!(ids.value(1), 2);
        assert!(ids.is_null(2));
        assert_eq!(out.column(1).data_type(), &DataType::Utf8);
        assert!(out
            .column(2)
            .as_any()
            .downcast_ref::<BooleanArray>()
            .unwrap()
            .value(0));
        assert_eq!(out.column(3).data_type(), &DataType::Utf8);

        assert_eq!(report.rows, 3);
        assert_eq!(
            report.downgraded,
            vec![Downgrade {
                column: "flowsheet_days_since_birth".into(),
                target: SemanticType::UnsignedInt,
                failed_rows: 2,
            }]
        );
        assert_eq!(
            report.downgraded_columns().collect::<Vec<_>>(),
            vec!["flowsheet_days_since_birth"]
        );
    }

    #[test]
    fn already_typed_column_passes_through() {
        let arr: ArrayRef = Arc::new(UInt64Array::from(vec![1, 2]));
        match try_cast_column(&arr, SemanticType::UnsignedInt).unwrap() {
            CastOutcome::Cast(out) => assert_eq!(&out, &arr),
            CastOutcome::Downgraded { .. } => panic!("expected a cast"),
        }
    }
}
