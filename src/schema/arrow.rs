// src/schema/arrow.rs

use arrow::datatypes::DataType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic column types declared by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    UnsignedInt,
    SignedInt,
    Float,
    Text,
    Boolean,
}

/// Map a catalog type into the Arrow DataType a clean column is cast to.
///
/// - UnsignedInt → UInt64
/// - SignedInt   → Int64
/// - Float       → Float64
/// - Text        → Utf8
/// - Boolean     → Boolean
pub fn map_to_arrow_type(ty: SemanticType) -> DataType {
    match ty {
        SemanticType::UnsignedInt => DataType::UInt64,
        SemanticType::SignedInt => DataType::Int64,
        SemanticType::Float => DataType::Float64,
        SemanticType::Text => DataType::Utf8,
        SemanticType::Boolean => DataType::Boolean,
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SemanticType::UnsignedInt => "unsigned integer",
            SemanticType::SignedInt => "signed integer",
            SemanticType::Float => "float",
            SemanticType::Text => "string",
            SemanticType::Boolean => "boolean",
        };
        f.write_str(s)
    }
}
