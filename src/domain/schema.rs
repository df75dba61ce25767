//! Column names and types inferred from a delimited file.

use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::domain::error::QueryError;
use crate::domain::reader::FileReader;
use crate::domain::temporal::{parse_date, parse_duration};

/// Column and expression types, ordered from narrowest to widest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DataType {
    Null,
    Int,
    Float,
    Date,
    Duration,
    Text,
}

impl DataType {
    pub fn is_numeric(self) -> bool {
        matches!(self, DataType::Int | DataType::Float)
    }

    /// Index into the type-combination table.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Null => "null",
            DataType::Int => "integer",
            DataType::Float => "float",
            DataType::Date => "date",
            DataType::Duration => "duration",
            DataType::Text => "text",
        };
        f.write_str(name)
    }
}

static LEADING_ZERO: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^0\d+$").unwrap());

/// Narrowest type able to hold `text`, never narrower than `current`.
pub fn narrowest_type(text: &str, current: DataType) -> DataType {
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("null") || text == "NA" {
        return current;
    }
    if LEADING_ZERO.is_match(text) {
        return DataType::Text;
    }
    let found = if text.parse::<i64>().is_ok() {
        DataType::Int
    } else if text.parse::<f64>().is_ok() && text.contains(|c: char| c.is_ascii_digit()) {
        DataType::Float
    } else if parse_date(text).is_some() {
        if parse_duration(text).is_some() {
            DataType::Duration
        } else {
            DataType::Date
        }
    } else if parse_duration(text).is_some() {
        DataType::Duration
    } else {
        DataType::Text
    };
    found.max(current)
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ColumnDetail {
    pub name: String,
    pub data_type: DataType,
    /// 1-based column position.
    pub position: usize,
}

/// How a file is read: field delimiter, header presence and sample size.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub delimiter: u8,
    pub has_header: bool,
    pub sample_rows: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
            sample_rows: 10_000,
        }
    }
}

/// An opened input file: its inferred schema plus a positioned reader.
#[derive(Debug)]
pub struct FileData {
    pub path: PathBuf,
    pub size: u64,
    pub columns: Vec<ColumnDetail>,
    pub has_header: bool,
    names: HashMap<String, usize>,
    pub reader: FileReader,
}

impl FileData {
    /// Open `path`, name its columns and infer their types from a sample.
    pub fn open(path: &Path, options: ReadOptions) -> Result<FileData, QueryError> {
        let schema_err = |reason: String| QueryError::Schema {
            path: path.display().to_string(),
            reason,
        };
        let size = std::fs::metadata(path)
            .map_err(|e| schema_err(e.to_string()))?
            .len();
        let mut reader = FileReader::open(path, options.delimiter, false)
            .map_err(|e| schema_err(e.to_string()))?;

        if !reader.read().map_err(|e| schema_err(e.to_string()))? {
            return Err(schema_err("file is empty".to_string()));
        }
        let width = reader.current().len();
        let names: Vec<String> = if options.has_header {
            reader.current().iter().map(|n| n.trim().to_string()).collect()
        } else {
            (1..=width).map(|i| format!("col{i}")).collect()
        };
        let mut types = vec![DataType::Null; width];
        let mut sampled = 0;
        if !options.has_header {
            sample_row(&reader, &mut types);
            sampled += 1;
        }

        while sampled < options.sample_rows
            && reader.read().map_err(|e| schema_err(e.to_string()))?
        {
            sample_row(&reader, &mut types);
            sampled += 1;
        }

        reader.rewind(options.has_header).map_err(|e| schema_err(e.to_string()))?;

        let mut lookup = HashMap::new();
        let columns = names
            .into_iter()
            .zip(types)
            .enumerate()
            .map(|(i, (name, data_type))| {
                lookup.entry(name.to_lowercase()).or_insert(i);
                ColumnDetail {
                    name,
                    data_type,
                    position: i + 1,
                }
            })
            .collect();

        tracing::debug!(path = %path.display(), width, sampled, "inferred schema");

        Ok(FileData {
            path: path.to_path_buf(),
            size,
            columns,
            has_header: options.has_header,
            names: lookup,
            reader,
        })
    }

    /// Case-insensitive column lookup; the first of duplicate names wins.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.get(&name.to_lowercase()).copied()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Return the reader to the first data row.
    pub fn rewind(&mut self) -> Result<(), QueryError> {
        Ok(self.reader.rewind(self.has_header)?)
    }

    /// File name without directory or extension, used as an implicit alias.
    pub fn stem(&self) -> Option<String> {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
    }
}

fn sample_row(reader: &FileReader, types: &mut [DataType]) {
    for (ty, cell) in types.iter_mut().zip(reader.current().iter()) {
        *ty = narrowest_type(cell, *ty);
    }
}
