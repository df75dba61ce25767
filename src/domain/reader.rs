//! Sequential and byte-offset reads over a delimited file.

use csv::{Position, StringRecord};
use std::fs::File;
use std::path::Path;

#[derive(Debug)]
pub struct FileReader {
    csv: csv::Reader<File>,
    record: StringRecord,
    /// Byte offset where the current record starts.
    offset: u64,
    longest_record: usize,
    /// Set while an unmatched outer join presents this file as all nulls.
    null_row: bool,
}

impl FileReader {
    pub fn open(path: &Path, delimiter: u8, skip_header: bool) -> Result<FileReader, csv::Error> {
        let csv = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter)
            .from_path(path)?;
        let mut reader = FileReader {
            csv,
            record: StringRecord::new(),
            offset: 0,
            longest_record: 0,
            null_row: false,
        };
        if skip_header {
            reader.read()?;
        }
        Ok(reader)
    }

    /// Advance to the next record. Returns false at end of file.
    pub fn read(&mut self) -> Result<bool, csv::Error> {
        self.null_row = false;
        if !self.csv.read_record(&mut self.record)? {
            return Ok(false);
        }
        self.offset = self.record.position().map(|p| p.byte()).unwrap_or(0);
        let end = self.csv.position().byte();
        self.longest_record = self.longest_record.max((end - self.offset) as usize);
        Ok(true)
    }

    /// Re-read the record starting at `offset`.
    pub fn read_at(&mut self, offset: u64) -> Result<bool, csv::Error> {
        let mut pos = Position::new();
        pos.set_byte(offset);
        self.csv.seek(pos)?;
        self.read()
    }

    /// Return to the first data row.
    pub fn rewind(&mut self, skip_header: bool) -> Result<(), csv::Error> {
        self.csv.seek(Position::new())?;
        if skip_header {
            self.read()?;
        }
        Ok(())
    }

    /// Size the record buffer for random-access re-reads.
    pub fn prepare_reread(&mut self) {
        let fields = self.record.len();
        self.record = StringRecord::with_capacity(self.longest_record, fields);
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn current(&self) -> &StringRecord {
        &self.record
    }

    /// Replace the current record with one held in memory.
    pub fn load(&mut self, record: &StringRecord) {
        self.null_row = false;
        self.record.clone_from(record);
    }

    pub fn set_null_row(&mut self) {
        self.null_row = true;
    }

    /// Raw text of a field of the current record; `None` when the row is a
    /// null row or the record is too short.
    pub fn cell(&self, index: usize) -> Option<&str> {
        if self.null_row {
            return None;
        }
        self.record.get(index)
    }
}
