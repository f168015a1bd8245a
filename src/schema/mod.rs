pub mod arrow;
pub mod catalog;

pub use self::arrow::{map_to_arrow_type, SemanticType};
pub use catalog::{
    is_day_offset_column, PivotLayout, TableDescriptor, TableKind, SENTINEL_TOKENS,
};
