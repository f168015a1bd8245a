use arrow::{
    array::{Array, ArrayRef, BooleanArray, StringArray},
    compute::{cast, filter_record_batch, not},
    datatypes::DataType,
    record_batch::RecordBatch,
};
use std::sync::Arc;
use tracing::debug;

use super::as_utf8;
use crate::error::{Error, Result};

/// Upper-case the listed free-text columns so matching is case-insensitive.
///
/// Columns missing from `batch` are skipped. Non-text columns are cast to text
/// first. Running it twice gives the same table.
pub fn normalize_text(batch: &RecordBatch, columns: &[String]) -> Result<RecordBatch> {
    if columns.is_empty() {
        return Ok(batch.clone());
    }

    let schema = batch.schema();
    let mut fields = Vec::with_capacity(batch.num_columns());
    let mut cols = Vec::with_capacity(batch.num_columns());
    for (field, arr) in schema.fields().iter().zip(batch.columns()) {
        if columns.iter().any(|c| c == field.name()) {
            let text = cast(arr, &DataType::Utf8)?;
            let sarr = as_utf8(&text)?;
            let upper: StringArray = sarr.iter().map(|opt| opt.map(str::to_uppercase)).collect();
            fields.push(field.as_ref().clone().with_data_type(DataType::Utf8));
            cols.push(Arc::new(upper) as ArrayRef);
            continue;
        }
        fields.push(field.as_ref().clone());
        cols.push(arr.clone());
    }

    let schema = Arc::new(arrow::datatypes::Schema::new_with_metadata(
        fields,
        schema.metadata().clone(),
    ));
    RecordBatch::try_new(schema, cols).map_err(Into::into)
}

/// True when `value` is a plain non-negative integer: digits only, no sign.
pub fn is_non_negative_integer(value: &str) -> bool {
    let v = value.trim();
    !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit())
}

/// Split `batch` into rows whose `column` holds a clean non-negative integer and
/// the residual rows (censor tokens, other text, nulls, negatives).
pub fn strip_sentinel(
    batch: &RecordBatch,
    column: &str,
    tokens: &[&str],
) -> Result<(RecordBatch, RecordBatch)> {
    let idx = batch
        .schema()
        .index_of(column)
        .map_err(|_| Error::unknown_column(column, "sentinel check"))?;

    let text = cast(batch.column(idx), &DataType::Utf8)?;
    let sarr = as_utf8(&text)?;

    let keep: BooleanArray = sarr
        .iter()
        .map(|opt| {
            Some(match opt {
                Some(v) => {
                    let v = v.trim();
                    !tokens.iter().any(|t| v.starts_with(t)) && is_non_negative_integer(v)
                }
                None => false,
            })
        })
        .collect();

    let clean = filter_record_batch(batch, &keep)?;
    let residual = filter_record_batch(batch, &not(&keep)?)?;
    if residual.num_rows() > 0 {
        debug!(
            column,
            kept = clean.num_rows(),
            dropped = residual.num_rows(),
            "segregated sentinel rows"
        );
    }
    Ok((clean, residual))
}
