use std::{io, path::PathBuf};
use thiserror::Error;

use crate::schema::TableKind;

/// Errors surfaced at the `Table` call boundary.
///
/// Value-level problems (a cell that does not fit its declared type, a censored
/// day count) are not errors: they downgrade a column in the
/// [`LoadReport`](crate::process::LoadReport) or exclude the row.
#[derive(Error, Debug)]
pub enum Error {
    /// Source file or cache path is absent.
    #[error("file not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// A column the operation needs is not in the file header.
    #[error("column `{column}` not found in {}", path.display())]
    MissingColumn { column: String, path: PathBuf },

    /// A predicate or search names a column the table does not have.
    #[error("unknown column `{column}` in {context}")]
    UnknownColumn { column: String, context: String },

    /// Cache build target is already on disk and overwrite was not requested.
    #[error("cache already exists at {}; rebuild with overwrite to replace it", path.display())]
    AlreadyExists { path: PathBuf },

    /// The file cannot be read as rows and columns at all.
    #[error("malformed input {}: {source}", path.display())]
    MalformedInput {
        path: PathBuf,
        #[source]
        source: arrow::error::ArrowError,
    },

    #[error("no table kind registered for file name `{file_name}`")]
    UnknownTableKind { file_name: String },

    #[error("{kind} has no default search column; name the column explicitly")]
    NoSearchColumn { kind: TableKind },

    #[error("{kind} has no pivot layout")]
    NoPivotLayout { kind: TableKind },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn unknown_column(column: impl Into<String>, context: impl Into<String>) -> Self {
        Error::UnknownColumn {
            column: column.into(),
            context: context.into(),
        }
    }
}
