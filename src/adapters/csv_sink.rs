//! CSV output adapter for query results.

use std::io::Write;

use crate::domain::error::QueryError;
use crate::domain::schema::ColumnDetail;
use crate::domain::value::Value;
use crate::ports::row_sink::RowSink;

/// Writes the header row and every result row as delimited text.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
    write_header: bool,
    fields: Vec<String>,
}

impl<W: Write> CsvSink<W> {
    pub fn new(inner: W, delimiter: u8) -> Self {
        let writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_writer(inner);
        Self {
            writer,
            write_header: true,
            fields: Vec::new(),
        }
    }

    pub fn without_header(mut self) -> Self {
        self.write_header = false;
        self
    }

    /// Flush and hand back the underlying writer.
    pub fn into_inner(self) -> Result<W, QueryError> {
        self.writer
            .into_inner()
            .map_err(|e| QueryError::Io(e.into_error()))
    }
}

impl<W: Write> RowSink for CsvSink<W> {
    fn header(&mut self, columns: &[ColumnDetail]) -> Result<(), QueryError> {
        if self.write_header {
            self.writer
                .write_record(columns.iter().map(|c| c.name.as_str()))?;
        }
        Ok(())
    }

    fn row(&mut self, row: &[Value]) -> Result<(), QueryError> {
        self.fields.clear();
        self.fields.extend(row.iter().map(Value::to_string));
        self.writer.write_record(&self.fields)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), QueryError> {
        self.writer.flush()?;
        Ok(())
    }
}
