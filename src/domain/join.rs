//! Sorted key indexes over joined files.
//!
//! An index is built by one forward scan of the joined file and probed with
//! a binary search for the run of equal keys.

use csv::StringRecord;
use std::ops::Range;

use crate::domain::ast::{JoinClause, JoinStrategy};
use crate::domain::engine::CancelToken;
use crate::domain::error::QueryError;
use crate::domain::eval::{Evaluator, GroupAccess};
use crate::domain::reader::FileReader;
use crate::domain::schema::FileData;
use crate::domain::value::Value;

#[derive(Debug)]
pub enum JoinIndex {
    /// Whole records held in memory.
    Small(Vec<(Value, StringRecord)>),
    /// Byte offsets; matches are re-read from the file.
    Big(Vec<(Value, u64)>),
}

impl JoinIndex {
    /// Scan the joined file, evaluating the join key for each record. Rows
    /// with a null key can never match and are left out.
    pub fn build(
        clause: &JoinClause,
        files: &mut [FileData],
        evaluator: &mut Evaluator,
        cancel: &CancelToken,
    ) -> Result<JoinIndex, QueryError> {
        let file = clause.file;
        files[file].rewind()?;
        let mut small = Vec::new();
        let mut big = Vec::new();
        while !cancel.is_cancelled() && files[file].reader.read()? {
            let key = evaluator.eval(&clause.joined, files, &mut GroupAccess::None)?;
            if key.is_null() {
                continue;
            }
            let reader = &files[file].reader;
            match clause.strategy {
                JoinStrategy::Small => small.push((key, reader.current().clone())),
                JoinStrategy::Big => big.push((key, reader.offset())),
            }
        }

        let index = match clause.strategy {
            JoinStrategy::Small => {
                small.sort_by(|a, b| a.0.cmp(&b.0));
                JoinIndex::Small(small)
            }
            JoinStrategy::Big => {
                big.sort_by(|a, b| a.0.cmp(&b.0));
                files[file].reader.prepare_reread();
                JoinIndex::Big(big)
            }
        };
        tracing::debug!(
            path = %files[file].path.display(),
            strategy = ?clause.strategy,
            entries = index.len(),
            "built join index"
        );
        Ok(index)
    }

    pub fn len(&self) -> usize {
        match self {
            JoinIndex::Small(entries) => entries.len(),
            JoinIndex::Big(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Positions of every entry whose key equals `key`, in file order.
    pub fn probe(&self, key: &Value) -> Range<usize> {
        if key.is_null() {
            return 0..0;
        }
        match self {
            JoinIndex::Small(entries) => equal_run(entries, key),
            JoinIndex::Big(entries) => equal_run(entries, key),
        }
    }

    /// Make entry `position` the reader's current record.
    pub fn restore(&self, position: usize, reader: &mut FileReader) -> Result<(), QueryError> {
        match self {
            JoinIndex::Small(entries) => {
                if let Some((_, record)) = entries.get(position) {
                    reader.load(record);
                }
            }
            JoinIndex::Big(entries) => {
                if let Some((_, offset)) = entries.get(position) {
                    reader.read_at(*offset)?;
                }
            }
        }
        Ok(())
    }
}

fn equal_run<T>(entries: &[(Value, T)], key: &Value) -> Range<usize> {
    let start = entries.partition_point(|(k, _)| k < key);
    let end = start + entries[start..].partition_point(|(k, _)| k == key);
    start..end
}
