// src/config.rs
use parquet::basic::{BrotliLevel, Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::{Error, Result};

/// Knobs for reading raw exports and writing caches.
///
/// Every field has a default, so a YAML file only needs the keys it changes:
///
/// ```yaml
/// delimiter: "|"
/// max_rows: 500000
/// compression:
///   zstd: 3
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableOptions {
    /// Field delimiter of the raw export.
    #[serde(with = "delimiter_char")]
    pub delimiter: u8,
    /// Rows per Arrow batch while parsing the raw file.
    pub batch_size: usize,
    /// Rows read after the header by `columns()`.
    pub header_sample_rows: usize,
    /// Upper bound on rows materialized by a raw load; `None` reads everything.
    pub max_rows: Option<usize>,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub compression: CacheCompression,
    pub max_row_group_size: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            batch_size: 65_536,
            header_sample_rows: 5,
            max_rows: None,
            compression: CacheCompression::default(),
            max_row_group_size: 1_000_000,
        }
    }
}

impl TableOptions {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound {
                path: path.to_path_buf(),
            },
            _ => Error::Io(e),
        })?;
        Self::from_yaml_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let opts: TableOptions =
            serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        if opts.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        Ok(opts)
    }

    /// Parquet writer properties for cache files.
    pub fn writer_properties(&self) -> Result<WriterProperties> {
        Ok(WriterProperties::builder()
            .set_compression(self.compression.to_parquet()?)
            .set_dictionary_enabled(true)
            .set_max_row_group_size(self.max_row_group_size)
            .build())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCompression {
    Uncompressed,
    Snappy,
    Brotli(u32),
    Zstd(i32),
}

impl Default for CacheCompression {
    fn default() -> Self {
        CacheCompression::Brotli(5)
    }
}

impl CacheCompression {
    fn to_parquet(self) -> Result<Compression> {
        Ok(match self {
            CacheCompression::Uncompressed => Compression::UNCOMPRESSED,
            CacheCompression::Snappy => Compression::SNAPPY,
            CacheCompression::Brotli(level) => Compression::BROTLI(
                BrotliLevel::try_new(level).map_err(|e| Error::Config(e.to_string()))?,
            ),
            CacheCompression::Zstd(level) => Compression::ZSTD(
                ZstdLevel::try_new(level).map_err(|e| Error::Config(e.to_string()))?,
            ),
        })
    }
}

/// Delimiters are written as one-character strings in YAML.
mod delimiter_char {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &u8, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&(*d as char).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u8, D::Error> {
        let s = String::deserialize(d)?;
        match s.as_bytes() {
            [b] => Ok(*b),
            _ => Err(D::Error::custom(format!(
                "delimiter must be a single ASCII character, got {:?}",
                s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn yaml_overrides_only_named_fields() -> Result<()> {
        let opts = TableOptions::from_yaml_str("delimiter: \"|\"\nmax_rows: 10\n")?;
        assert_eq!(opts.delimiter, b'|');
        assert_eq!(opts.max_rows, Some(10));
        assert_eq!(opts.batch_size, TableOptions::default().batch_size);
        assert_eq!(opts.compression, CacheCompression::Brotli(5));
        Ok(())
    }

    #[test]
    fn compression_variants_parse() -> Result<()> {
        let opts = TableOptions::from_yaml_str("compression:\n  zstd: 3\n")?;
        assert_eq!(opts.compression, CacheCompression::Zstd(3));
        opts.writer_properties()?;

        let opts = TableOptions::from_yaml_str("compression: snappy\n")?;
        assert_eq!(opts.compression, CacheCompression::Snappy);
        Ok(())
    }

    #[test]
    fn rejects_multi_char_delimiter_and_zero_batch() {
        assert!(matches!(
            TableOptions::from_yaml_str("delimiter: \";;\"\n"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            TableOptions::from_yaml_str("batch_size: 0\n"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn bad_brotli_level_is_config_error() {
        let opts = TableOptions {
            compression: CacheCompression::Brotli(99),
            ..Default::default()
        };
        assert!(matches!(opts.writer_properties(), Err(Error::Config(_))));
    }
}
