//! Typed, cached access to clinical export tables.
//!
//! A [`Table`] wraps one delimited export file. Queries read either the raw
//! file or a Parquet cache built next to it, and both paths return the same
//! sanitized rows.

pub mod cache;
pub mod config;
pub mod error;
pub mod process;
pub mod query;
pub mod schema;
pub mod source;
pub mod table;

pub use cache::{CacheLayout, CacheStatus, CacheSummary, PartitionedCache};
pub use config::{CacheCompression, TableOptions};
pub use error::{Error, Result};
pub use process::LoadReport;
pub use query::{Predicate, Predicates, QueryEngine};
pub use schema::{SemanticType, TableDescriptor, TableKind};
pub use source::RawSource;
pub use table::{SelectOptions, Table};
