// src/process/mod.rs
pub mod convert;
pub mod sanitize;

pub use convert::{convert_to_expected_types, try_cast_column, CastOutcome, Downgrade, LoadReport};
pub use sanitize::{is_non_negative_integer, normalize_text, strip_sentinel};

use arrow::{
    array::{Array, ArrayRef, StringArray},
    error::ArrowError,
};

use crate::error::Result;

/// `row` as an Arrow take index.
pub(crate) fn row_index(row: usize) -> Result<u32> {
    u32::try_from(row).map_err(|_| {
        ArrowError::InvalidArgumentError(format!("row {} exceeds the u32 index range", row))
            .into()
    })
}

/// Borrow `arr` as a Utf8 array.
pub(crate) fn as_utf8(arr: &ArrayRef) -> Result<&StringArray> {
    arr.as_any().downcast_ref::<StringArray>().ok_or_else(|| {
        ArrowError::CastError(format!("expected Utf8 column, got {}", arr.data_type())).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_index_rejects_overflow() {
        assert_eq!(row_index(7).unwrap(), 7);
        assert_eq!(row_index(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(row_index(u32::MAX as usize + 1).is_err());
    }
}
