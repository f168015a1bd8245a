// src/schema/catalog.rs

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use super::arrow::SemanticType::{self, Boolean, SignedInt, Text, UnsignedInt};
use crate::error::{Error, Result};

/// Columns whose name marks a day offset from date of birth.
static DAY_OFFSET_COLUMN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"days_(from|since)").expect("static regex"));

/// Censor prefixes the exports substitute for out-of-range numbers.
pub const SENTINEL_TOKENS: &[&str] = &["<", ">"];

/// True for columns holding a day count relative to date of birth.
pub fn is_day_offset_column(name: &str) -> bool {
    DAY_OFFSET_COLUMN.is_match(name)
}

/// The seven clinical export types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Encounters,
    Flowsheet,
    Labs,
    Medications,
    Transfusions,
    Procedures,
    Diagnoses,
}

impl TableKind {
    pub const ALL: [TableKind; 7] = [
        TableKind::Encounters,
        TableKind::Flowsheet,
        TableKind::Labs,
        TableKind::Medications,
        TableKind::Transfusions,
        TableKind::Procedures,
        TableKind::Diagnoses,
    ];

    /// Resolve the kind from an export's file name.
    pub fn from_file_name(file_name: &str) -> Result<Self> {
        match file_name {
            "Table1_Encounter_Info.csv" => Ok(TableKind::Encounters),
            "Table2_Flowsheet.csv" => Ok(TableKind::Flowsheet),
            "Table3_Lab.csv" => Ok(TableKind::Labs),
            "Table4_Administered_Medication.csv" | "Table4_Administered_Medications.csv" => {
                Ok(TableKind::Medications)
            }
            "Table5_Blood_Transfusion.csv" => Ok(TableKind::Transfusions),
            "Table6_Procedures.csv" => Ok(TableKind::Procedures),
            "Table7_DX.csv" => Ok(TableKind::Diagnoses),
            other => Err(Error::UnknownTableKind {
                file_name: other.to_string(),
            }),
        }
    }

    /// Canonical export file name.
    pub fn file_name(self) -> &'static str {
        match self {
            TableKind::Encounters => "Table1_Encounter_Info.csv",
            TableKind::Flowsheet => "Table2_Flowsheet.csv",
            TableKind::Labs => "Table3_Lab.csv",
            TableKind::Medications => "Table4_Administered_Medication.csv",
            TableKind::Transfusions => "Table5_Blood_Transfusion.csv",
            TableKind::Procedures => "Table6_Procedures.csv",
            TableKind::Diagnoses => "Table7_DX.csv",
        }
    }

    pub fn search_column(self) -> Option<&'static str> {
        Some(match self {
            TableKind::Encounters => "encounter_id",
            TableKind::Flowsheet => "display_name",
            TableKind::Labs => "lab_component_name",
            TableKind::Medications => "medication_name",
            TableKind::Transfusions => "transfusion_name",
            TableKind::Procedures => "order_name",
            TableKind::Diagnoses => "CodeDescription",
        })
    }

    pub fn expected_dtypes(self) -> &'static [(&'static str, SemanticType)] {
        match self {
            TableKind::Encounters => &[
                ("encounter_id", UnsignedInt),
                ("person_id", UnsignedInt),
                ("age", UnsignedInt),
                ("financial_class", Text),
                ("death_during_encounter", Boolean),
            ],
            TableKind::Flowsheet => &[
                ("encounter_id", UnsignedInt),
                ("flowsheet_days_since_birth", UnsignedInt),
                ("display_name", Text),
            ],
            TableKind::Labs => &[
                ("encounter_id", UnsignedInt),
                ("lab_component_name", Text),
                ("lab_result_value", Text),
                ("lab_collection_days_since_birth", UnsignedInt),
            ],
            TableKind::Medications => &[
                ("encounter_id", UnsignedInt),
                ("administered_days_since_birth", SignedInt),
                ("administered_time", Text),
                ("medication_name", Text),
            ],
            TableKind::Transfusions => &[("encounter_id", UnsignedInt), ("transfusion_name", Text)],
            TableKind::Procedures => &[("encounter_id", UnsignedInt), ("order_name", Text)],
            TableKind::Diagnoses => &[
                ("person_id", UnsignedInt),
                ("CodeDescription", Text),
                ("Provenance", Text),
            ],
        }
    }

    /// Free-text columns upper-cased before any matching.
    pub fn text_columns(self) -> &'static [&'static str] {
        match self {
            TableKind::Encounters => &[],
            TableKind::Flowsheet => &["display_name", "flowsheet_value"],
            TableKind::Labs => &["lab_component_name"],
            TableKind::Medications => &["medication_name"],
            TableKind::Transfusions => &["transfusion_name"],
            TableKind::Procedures => &["order_name"],
            TableKind::Diagnoses => &["CodeDescription"],
        }
    }

    pub fn sentinel_columns(self) -> &'static [&'static str] {
        match self {
            TableKind::Encounters | TableKind::Diagnoses => &[],
            TableKind::Flowsheet => &["flowsheet_days_since_birth"],
            TableKind::Labs => &["lab_collection_days_since_birth"],
            TableKind::Medications => &["administered_days_since_birth"],
            TableKind::Transfusions | TableKind::Procedures => &["days_from_dob_procstart"],
        }
    }

    pub fn rename_map(self) -> &'static [(&'static str, &'static str)] {
        match self {
            TableKind::Flowsheet => &[
                ("flowsheet_days_since_birth", "days_from_dob"),
                ("display_name", "name"),
                ("flowsheet_value", "value"),
                ("flowsheet_time", "time"),
            ],
            TableKind::Labs => &[
                ("lab_collection_days_since_birth", "days_from_dob"),
                ("lab_component_name", "name"),
                ("lab_result_value", "value"),
                ("lab_result_unit", "unit"),
                ("lab_collection_time", "time"),
            ],
            TableKind::Procedures => &[("order_name", "procedure")],
            _ => &[],
        }
    }

    /// Rows null in these columns never reach a caller.
    pub fn required_columns(self) -> &'static [&'static str] {
        match self {
            TableKind::Diagnoses => &[],
            _ => &["encounter_id"],
        }
    }

    pub fn pivot_layout(self) -> Option<PivotLayout> {
        match self {
            TableKind::Flowsheet => Some(PivotLayout {
                index: vec![
                    "encounter_id".into(),
                    "flowsheet_days_since_birth".into(),
                ],
                columns: "display_name".into(),
                values: "flowsheet_value".into(),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TableKind::Encounters => "encounters",
            TableKind::Flowsheet => "flowsheet",
            TableKind::Labs => "labs",
            TableKind::Medications => "medications",
            TableKind::Transfusions => "transfusions",
            TableKind::Procedures => "procedures",
            TableKind::Diagnoses => "diagnoses",
        };
        f.write_str(s)
    }
}

/// Long-to-wide reshaping for observation tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PivotLayout {
    pub index: Vec<String>,
    pub columns: String,
    pub values: String,
}

/// Everything the layer knows about one export file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDescriptor {
    pub file_path: PathBuf,
    pub data_root: PathBuf,
    pub table_kind: TableKind,
    pub search_column: Option<String>,
    pub expected_dtypes: BTreeMap<String, SemanticType>,
    pub rename_map: BTreeMap<String, String>,
    pub sentinel_columns: Vec<String>,
    pub text_columns: Vec<String>,
    pub required_columns: Vec<String>,
    pub pivot: Option<PivotLayout>,
}

impl TableDescriptor {
    /// Descriptor for `file_path`, with the kind taken from its file name.
    pub fn from_path<P: AsRef<Path>>(file_path: P) -> Result<Self> {
        let file_path = file_path.as_ref();
        let file_name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::UnknownTableKind {
                file_name: file_path.display().to_string(),
            })?;
        let kind = TableKind::from_file_name(file_name)?;
        Ok(Self::for_kind(file_path, kind))
    }

    /// Descriptor binding an arbitrarily named file to `kind`.
    pub fn for_kind<P: AsRef<Path>>(file_path: P, kind: TableKind) -> Self {
        let file_path = file_path.as_ref().to_path_buf();
        let data_root = file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let owned = |cols: &[&str]| cols.iter().map(|c| c.to_string()).collect::<Vec<_>>();

        TableDescriptor {
            data_root,
            table_kind: kind,
            search_column: kind.search_column().map(str::to_string),
            expected_dtypes: kind
                .expected_dtypes()
                .iter()
                .map(|(c, t)| (c.to_string(), *t))
                .collect(),
            rename_map: kind
                .rename_map()
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
            sentinel_columns: owned(kind.sentinel_columns()),
            text_columns: owned(kind.text_columns()),
            required_columns: owned(kind.required_columns()),
            pivot: kind.pivot_layout(),
            file_path,
        }
    }

    /// Raw column name for `name`, which may be raw or renamed.
    pub fn raw_column_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.rename_map
            .iter()
            .find(|(_, to)| to.as_str() == name)
            .map(|(from, _)| from.as_str())
            .unwrap_or(name)
    }

    pub fn is_text_column(&self, name: &str) -> bool {
        self.text_columns.iter().any(|c| c == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_round_trips_through_its_file_name() {
        for kind in TableKind::ALL {
            assert_eq!(TableKind::from_file_name(kind.file_name()).unwrap(), kind);
        }
        assert_eq!(
            TableKind::from_file_name("Table4_Administered_Medications.csv").unwrap(),
            TableKind::Medications
        );
    }

    #[test]
    fn unknown_file_name_is_rejected() {
        let err = TableDescriptor::from_path("/data/raw/Table9_Mystery.csv").unwrap_err();
        assert!(matches!(err, Error::UnknownTableKind { file_name } if file_name == "Table9_Mystery.csv"));
    }

    #[test]
    fn descriptor_carries_catalog_entry() {
        let d = TableDescriptor::from_path("/data/raw/Table3_Lab.csv").unwrap();
        assert_eq!(d.table_kind, TableKind::Labs);
        assert_eq!(d.data_root, PathBuf::from("/data/raw"));
        assert_eq!(d.search_column.as_deref(), Some("lab_component_name"));
        assert_eq!(d.expected_dtypes["encounter_id"], UnsignedInt);
        assert_eq!(d.rename_map["lab_component_name"], "name");
        assert_eq!(d.raw_column_name("name"), "lab_component_name");
        assert_eq!(d.raw_column_name("encounter_id"), "encounter_id");
        assert!(d.is_text_column("lab_component_name"));
    }

    #[test]
    fn search_and_sentinel_columns_are_text_or_day_offsets() {
        for kind in TableKind::ALL {
            for col in kind.sentinel_columns() {
                assert!(is_day_offset_column(col), "{kind}: {col}");
            }
            let search = kind.search_column().unwrap();
            assert!(
                kind.text_columns().contains(&search) || kind == TableKind::Encounters,
                "{kind}: {search}"
            );
        }
    }

    #[test]
    fn day_offset_detection() {
        assert!(is_day_offset_column("days_from_dob_procstart"));
        assert!(is_day_offset_column("flowsheet_days_since_birth"));
        assert!(!is_day_offset_column("encounter_id"));
        assert!(!is_day_offset_column("days"));
    }
}
