use arrow::{
    array::{Array, ArrayRef, Float64Array, StringArray, UInt32Array},
    compute::{cast, lexsort_to_indices, take, SortColumn},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use tracing::debug;

use crate::error::{Error, Result};
use crate::process::{as_utf8, row_index};
use crate::schema::PivotLayout;

fn text_at(arr: &StringArray, row: usize) -> Option<&str> {
    (!arr.is_null(row)).then(|| arr.value(row))
}

#[derive(Default)]
struct Group {
    first_row: u32,
    cells: HashMap<String, (f64, usize)>,
}

/// Reshape long observations into one row per index tuple and one Float64
/// column per category, averaging repeated observations.
///
/// Rows with a null category or a value that does not parse as a number are
/// skipped. Output rows are sorted by the index columns; category columns are
/// sorted by name.
pub fn pivot_mean(batch: &RecordBatch, layout: &PivotLayout) -> Result<RecordBatch> {
    let schema = batch.schema();
    let lookup = |name: &str| {
        schema
            .index_of(name)
            .map_err(|_| Error::unknown_column(name, "pivot layout"))
    };
    let index_idx: Vec<usize> = layout
        .index
        .iter()
        .map(|c| lookup(c))
        .collect::<Result<_>>()?;
    let category_idx = lookup(&layout.columns)?;
    let value_idx = lookup(&layout.values)?;

    // 1) text views of everything the grouping touches
    let index_text: Vec<ArrayRef> = index_idx
        .iter()
        .map(|&i| cast(batch.column(i), &DataType::Utf8))
        .collect::<std::result::Result<_, _>>()?;
    let index_text: Vec<_> = index_text.iter().map(as_utf8).collect::<Result<_>>()?;
    let categories_arr = cast(batch.column(category_idx), &DataType::Utf8)?;
    let categories_arr = as_utf8(&categories_arr)?;
    let values_arr = cast(batch.column(value_idx), &DataType::Utf8)?;
    let values_arr = as_utf8(&values_arr)?;

    // 2) accumulate sum/count per (index tuple, category)
    let mut group_ids: HashMap<Vec<Option<String>>, usize> = HashMap::new();
    let mut groups: Vec<Group> = Vec::new();
    let mut categories: BTreeSet<String> = BTreeSet::new();
    let mut skipped = 0usize;

    for row in 0..batch.num_rows() {
        let (Some(category), Some(value)) = (
            text_at(categories_arr, row),
            text_at(values_arr, row).and_then(|v| v.trim().parse::<f64>().ok()),
        ) else {
            skipped += 1;
            continue;
        };

        let key: Vec<Option<String>> = index_text
            .iter()
            .map(|arr| text_at(arr, row).map(str::to_string))
            .collect();
        let first_row = row_index(row)?;
        let gid = *group_ids.entry(key).or_insert_with(|| {
            groups.push(Group {
                first_row,
                ..Default::default()
            });
            groups.len() - 1
        });
        let cell = groups[gid].cells.entry(category.to_string()).or_insert((0.0, 0));
        cell.0 += value;
        cell.1 += 1;
        categories.insert(category.to_string());
    }
    debug!(groups = groups.len(), categories = categories.len(), skipped, "pivoted");

    // 3) index columns at each group's first row, sorted on their typed values
    let reps = UInt32Array::from(groups.iter().map(|g| g.first_row).collect::<Vec<_>>());
    let index_cols: Vec<ArrayRef> = index_idx
        .iter()
        .map(|&i| take(batch.column(i), &reps, None))
        .collect::<std::result::Result<_, _>>()?;
    let order = if index_cols.is_empty() {
        UInt32Array::from(
            (0..groups.len())
                .map(row_index)
                .collect::<Result<Vec<_>>>()?,
        )
    } else {
        let sort_cols: Vec<SortColumn> = index_cols
            .iter()
            .map(|c| SortColumn {
                values: c.clone(),
                options: None,
            })
            .collect();
        lexsort_to_indices(&sort_cols, None)?
    };

    let mut fields: Vec<Field> = index_idx
        .iter()
        .map(|&i| schema.field(i).clone())
        .collect();
    let mut cols: Vec<ArrayRef> = index_cols
        .iter()
        .map(|c| take(c, &order, None))
        .collect::<std::result::Result<_, _>>()?;

    // 4) one mean column per category
    for category in &categories {
        let means: Float64Array = order
            .values()
            .iter()
            .map(|&g| {
                groups[g as usize]
                    .cells
                    .get(category)
                    .map(|(sum, n)| sum / *n as f64)
            })
            .collect();
        fields.push(Field::new(category, DataType::Float64, true));
        cols.push(Arc::new(means));
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), cols).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::UInt64Array;

    fn flowsheet() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("encounter_id", DataType::UInt64, true),
            Field::new("flowsheet_days_since_birth", DataType::UInt64, true),
            Field::new("display_name", DataType::Utf8, true),
            Field::new("flowsheet_value", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(UInt64Array::from(vec![10, 2, 2, 2, 2, 2])),
                Arc::new(UInt64Array::from(vec![500, 400, 400, 400, 401, 401])),
                Arc::new(StringArray::from(vec![
                    Some("PULSE"),
                    Some("PULSE"),
                    Some("PULSE"),
                    Some("SPO2"),
                    Some("PULSE"),
                    None,
                ])),
                Arc::new(StringArray::from(vec![
                    Some("80"),
                    Some("60"),
                    Some("70"),
                    Some("97"),
                    Some(""),
                    Some("1"),
                ])),
            ],
        )
        .unwrap()
    }

    fn layout() -> PivotLayout {
        PivotLayout {
            index: vec!["encounter_id".into(), "flowsheet_days_since_birth".into()],
            columns: "display_name".into(),
            values: "flowsheet_value".into(),
        }
    }

    #[test]
    fn pivots_and_averages() {
        let out = pivot_mean(&flowsheet(), &layout()).unwrap();
        let schema = out.schema();
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(
            names,
            vec!["encounter_id", "flowsheet_days_since_birth", "PULSE", "SPO2"]
        );
        // (2,400) and (10,500); (2,401) had no numeric values
        assert_eq!(out.num_rows(), 2);

        let ids = out
            .column(0)
            .as_any()
            .downcast_ref::<UInt64Array>()
            .unwrap();
        assert_eq!(ids.values().to_vec(), vec![2, 10]);

        let pulse = out
            .column(2)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(pulse.value(0), 65.0);
        assert_eq!(pulse.value(1), 80.0);

        let spo2 = out
            .column(3)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(spo2.value(0), 97.0);
        assert!(spo2.is_null(1));
    }

    #[test]
    fn unknown_layout_column() {
        let mut l = layout();
        l.values = "nope".into();
        assert!(matches!(
            pivot_mean(&flowsheet(), &l),
            Err(Error::UnknownColumn { .. })
        ));
    }
}
