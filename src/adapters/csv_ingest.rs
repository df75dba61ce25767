//! Bulk conversion of CSV text to header-keyed maps on a worker pool.
//!
//! Lines are fed to the workers over a job channel and results drained from
//! a result channel, so output order is not guaranteed.

use std::collections::HashMap;
use std::io::BufRead;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::domain::error::QueryError;

pub type Record = HashMap<String, String>;

pub const DEFAULT_WORKERS: usize = 2;

/// Keep letters, digits, spaces and underscores of a header name.
fn clean_header(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ' || *c == '_')
        .collect::<String>()
        .trim()
        .to_string()
}

fn split_line(line: &str, delimiter: u8) -> Result<Vec<String>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_reader(line.as_bytes());
    let mut record = csv::StringRecord::new();
    reader.read_record(&mut record)?;
    Ok(record.iter().map(str::to_string).collect())
}

/// Convert every line after the header into a map from header name to
/// field. Blank lines are skipped; fields beyond the header are dropped.
pub fn to_maps<R: BufRead>(
    input: R,
    delimiter: u8,
    workers: usize,
) -> Result<Vec<Record>, QueryError> {
    let mut lines = input.lines();
    let header: Vec<String> = match lines.next() {
        Some(line) => split_line(&line?, delimiter)?
            .iter()
            .map(|h| clean_header(h))
            .collect(),
        None => return Ok(Vec::new()),
    };
    let header = Arc::new(header);
    let workers = workers.max(1);

    let (job_tx, job_rx) = mpsc::channel::<String>();
    let (result_tx, result_rx) = mpsc::channel::<Result<Record, csv::Error>>();
    let job_rx = Arc::new(Mutex::new(job_rx));

    std::thread::scope(|scope| -> Result<Vec<Record>, QueryError> {
        for _ in 0..workers {
            let jobs = Arc::clone(&job_rx);
            let results = result_tx.clone();
            let header = Arc::clone(&header);
            scope.spawn(move || {
                loop {
                    let job = match jobs.lock() {
                        Ok(rx) => rx.recv(),
                        Err(_) => return,
                    };
                    let Ok(line) = job else { return };
                    let record = split_line(&line, delimiter).map(|fields| {
                        header
                            .iter()
                            .cloned()
                            .zip(fields)
                            .collect::<Record>()
                    });
                    if results.send(record).is_err() {
                        return;
                    }
                }
            });
        }
        drop(result_tx);

        let mut queued = 0usize;
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if job_tx.send(line).is_err() {
                break;
            }
            queued += 1;
        }
        drop(job_tx);
        tracing::debug!(lines = queued, workers, "queued csv lines");

        let mut records = Vec::with_capacity(queued);
        for result in result_rx {
            records.push(result?);
        }
        Ok(records)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted_names(records: &[Record]) -> Vec<String> {
        let mut names: Vec<String> = records.iter().map(|r| r["name"].clone()).collect();
        names.sort();
        names
    }

    #[test]
    fn converts_lines_to_maps() {
        let input = "name, Age!\nann, 31\nbob,27\n\ncid,40\n";
        let records = to_maps(input.as_bytes(), b',', 3).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(sorted_names(&records), vec!["ann", "bob", "cid"]);
        let bob = records.iter().find(|r| r["name"] == "bob").unwrap();
        assert_eq!(bob["Age"], "27");
    }

    #[test]
    fn quoted_fields_and_other_delimiters() {
        let input = "name;note\n\"x;y\";hello\n";
        let records = to_maps(input.as_bytes(), b';', 1).unwrap();
        assert_eq!(records[0]["name"], "x;y");
        assert_eq!(records[0]["note"], "hello");
    }

    #[test]
    fn empty_input_gives_no_records() {
        assert!(to_maps("".as_bytes(), b',', 2).unwrap().is_empty());
        assert!(to_maps("a,b\n".as_bytes(), b',', 2).unwrap().is_empty());
    }

    #[test]
    fn zero_workers_still_runs() {
        let records = to_maps("name\nz\n".as_bytes(), b',', 0).unwrap();
        assert_eq!(sorted_names(&records), vec!["z"]);
    }
}
