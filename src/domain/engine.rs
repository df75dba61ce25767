//! Query engine facade: compile, analyze and execute one query at a time.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::domain::ast::Query;
use crate::domain::config_validation::{parse_delimiter, validate_engine_config};
use crate::domain::error::QueryError;
use crate::domain::eval::Evaluator;
use crate::domain::executor::Executor;
use crate::domain::functions::Ciphers;
use crate::domain::parser::parse;
use crate::domain::rewrite::{analyze, output_columns};
use crate::domain::schema::{ColumnDetail, FileData, ReadOptions};
use crate::domain::value::Value;
use crate::ports::config_port::ConfigPort;
use crate::ports::row_sink::{MemorySink, RowSink};

pub const DEFAULT_JOIN_SIZE_THRESHOLD: u64 = 100_000_000;
pub const DEFAULT_SAMPLE_ROWS: usize = 10_000;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub delimiter: u8,
    /// Joined files larger than this many bytes are indexed by offset
    /// instead of held in memory.
    pub join_size_threshold: u64,
    /// Rows sampled per file when inferring column types.
    pub sample_rows: usize,
    pub progress_interval: Duration,
    /// Default password for `encrypt`/`decrypt`.
    pub password: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delimiter: b',',
            join_size_threshold: DEFAULT_JOIN_SIZE_THRESHOLD,
            sample_rows: DEFAULT_SAMPLE_ROWS,
            progress_interval: Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS),
            password: None,
        }
    }
}

impl EngineConfig {
    /// Read the `[engine]` and `[crypto]` sections, falling back to defaults
    /// for missing keys.
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, QueryError> {
        validate_engine_config(config)?;
        let defaults = Self::default();
        let int = |key: &str| config.get_int("engine", key).ok().flatten();

        Ok(Self {
            delimiter: config
                .get_string("engine", "delimiter")
                .and_then(|d| parse_delimiter(&d))
                .unwrap_or(defaults.delimiter),
            join_size_threshold: int("join_size_threshold")
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(defaults.join_size_threshold),
            sample_rows: int("sample_rows")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(defaults.sample_rows),
            progress_interval: int("progress_interval_ms")
                .and_then(|v| u64::try_from(v).ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.progress_interval),
            password: config
                .get_string("crypto", "password")
                .filter(|p| !p.is_empty()),
        })
    }

    pub(crate) fn read_options(&self, has_header: bool) -> ReadOptions {
        ReadOptions {
            delimiter: self.delimiter,
            has_header,
            sample_rows: self.sample_rows,
        }
    }
}

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct QueryStats {
    pub row_count: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct QueryResult {
    pub columns: Vec<ColumnDetail>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub cancelled: bool,
}

impl QueryResult {
    /// Values of the named output column.
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let index = self
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))?;
        Some(self.rows.iter().filter_map(|r| r.get(index)).collect())
    }
}

/// Inferred layout of a single file.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FileSummary {
    pub path: String,
    pub columns: Vec<ColumnDetail>,
    pub rows: u64,
}

#[derive(Debug, Default)]
pub struct Engine {
    config: EngineConfig,
    cancel: CancelToken,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            cancel: CancelToken::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token that cancels the running query. The flag is cleared when the
    /// next query starts.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run `text` and collect every row.
    pub fn query(&self, text: &str) -> Result<QueryResult, QueryError> {
        let mut sink = MemorySink::default();
        let stats = self.query_to_sink(text, &mut sink)?;
        Ok(QueryResult {
            columns: sink.columns,
            rows: sink.rows,
            row_count: stats.row_count,
            cancelled: stats.cancelled,
        })
    }

    /// Run `text`, streaming the header and rows to `sink`.
    pub fn query_to_sink(
        &self,
        text: &str,
        sink: &mut dyn RowSink,
    ) -> Result<QueryStats, QueryError> {
        self.cancel.reset();
        let started = Instant::now();
        let (query, files) = self.compile(text)?;
        let ciphers = Ciphers::prepare(&query, self.config.password.as_deref())?;
        let evaluator = Evaluator::new(&query, ciphers);

        let stats = Executor::new(
            &query,
            files,
            evaluator,
            &self.cancel,
            self.config.progress_interval,
        )
        .run(sink)?;
        tracing::info!(
            rows = stats.row_count,
            cancelled = stats.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query finished"
        );
        Ok(stats)
    }

    /// Run `text` with every `@file` replaced by `path`.
    pub fn query_file(&self, path: &Path, text: &str) -> Result<QueryResult, QueryError> {
        let quoted = format!("'{}'", path.display());
        self.query(&text.replace("@file", &quoted))
    }

    /// Compile `text` without running it and return its output columns.
    pub fn describe(&self, text: &str) -> Result<Vec<ColumnDetail>, QueryError> {
        let (query, _files) = self.compile(text)?;
        Ok(output_columns(&query))
    }

    /// Infer the columns of `path` and count its data rows.
    pub fn describe_file(&self, path: &Path) -> Result<FileSummary, QueryError> {
        let mut data = FileData::open(path, self.config.read_options(true))?;
        let mut rows = 0;
        while data.reader.read()? {
            rows += 1;
        }
        Ok(FileSummary {
            path: path.display().to_string(),
            columns: data.columns,
            rows,
        })
    }

    fn compile(&self, text: &str) -> Result<(Query, Vec<FileData>), QueryError> {
        let (mut query, files) = parse(text, &self.config)?;
        analyze(&mut query)?;
        tracing::debug!(
            files = files.len(),
            selections = query.selections.len(),
            grouping = query.grouping,
            "compiled query"
        );
        Ok((query, files))
    }
}

/// Split a batch on `;` outside quotes, dropping blank statements.
pub fn split_batch(text: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in text.chars() {
        match (quote, c) {
            (None, ';') => {
                statements.push(std::mem::take(&mut current));
                continue;
            }
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            _ => {}
        }
        current.push(c);
    }
    statements.push(current);
    statements
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;

    #[test]
    fn split_batch_respects_quotes() {
        let batch = "select * from 'a;b.csv'; select \"x;\" from t ;; ";
        assert_eq!(
            split_batch(batch),
            vec!["select * from 'a;b.csv'", "select \"x;\" from t"]
        );
    }

    #[test]
    fn split_batch_of_blank_text_is_empty() {
        assert!(split_batch("  ; \n ;").is_empty());
    }

    #[test]
    fn config_defaults_and_overrides() {
        let adapter = FileConfigAdapter::from_string(
            "[engine]\ndelimiter = |\nsample_rows = 50\n[crypto]\npassword = hunter2\n",
        )
        .unwrap();
        let config = EngineConfig::from_config(&adapter).unwrap();
        assert_eq!(config.delimiter, b'|');
        assert_eq!(config.sample_rows, 50);
        assert_eq!(config.join_size_threshold, DEFAULT_JOIN_SIZE_THRESHOLD);
        assert_eq!(config.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn config_rejects_bad_values() {
        let adapter = FileConfigAdapter::from_string("[engine]\nsample_rows = many\n").unwrap();
        let err = EngineConfig::from_config(&adapter).unwrap_err();
        assert!(matches!(err, QueryError::ConfigInvalid { .. }));
    }

    #[test]
    fn cancel_token_is_shared_and_reset() {
        let engine = Engine::default();
        let token = engine.cancel_token();
        token.cancel();
        assert!(engine.cancel.is_cancelled());
        engine.cancel.reset();
        assert!(!token.is_cancelled());
    }
}
