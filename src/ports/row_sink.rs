//! Streaming output port for query results.

use crate::domain::error::QueryError;
use crate::domain::schema::ColumnDetail;
use crate::domain::value::Value;

/// Receives a result header, then one call per output row.
pub trait RowSink {
    fn header(&mut self, columns: &[ColumnDetail]) -> Result<(), QueryError>;

    fn row(&mut self, row: &[Value]) -> Result<(), QueryError>;

    /// Called once after the last row, including when the query was cancelled.
    fn finish(&mut self) -> Result<(), QueryError> {
        Ok(())
    }
}

/// Collects rows in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub columns: Vec<ColumnDetail>,
    pub rows: Vec<Vec<Value>>,
}

impl RowSink for MemorySink {
    fn header(&mut self, columns: &[ColumnDetail]) -> Result<(), QueryError> {
        self.columns = columns.to_vec();
        Ok(())
    }

    fn row(&mut self, row: &[Value]) -> Result<(), QueryError> {
        self.rows.push(row.to_vec());
        Ok(())
    }
}
