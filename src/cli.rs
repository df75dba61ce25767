//! CLI definition and dispatch.

use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::adapters::csv_sink::CsvSink;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::config_validation::parse_delimiter;
use crate::domain::engine::{split_batch, Engine, EngineConfig, QueryStats};
use crate::domain::error::QueryError;
use crate::logging::{init_logging, resolve_level};
use crate::ports::config_port::ConfigPort;

#[derive(Parser, Debug)]
#[command(name = "csvquery", about = "Run SQL-like queries over delimited text files")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
    /// Query to run. Without it, a `;`-separated batch is read from stdin
    #[arg(short = 'c', long = "command")]
    pub query: Option<String>,
    /// Write results to this file instead of stdout
    #[arg(short, long)]
    pub save: Option<PathBuf>,
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Field delimiter for input and output (`tab` for tabs)
    #[arg(short, long, global = true)]
    pub delimiter: Option<String>,
    /// Default password for encrypt and decrypt
    #[arg(long)]
    pub password: Option<String>,
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the inferred columns of a file
    Describe { file: PathBuf },
}

pub fn run(cli: Cli) -> ExitCode {
    let adapter = match cli.config.as_ref().map(load_config).transpose() {
        Ok(a) => a,
        Err(code) => return code,
    };
    init_logging(&resolve_level(
        cli.log_level.as_deref(),
        adapter.as_ref().map(|a| a as &dyn ConfigPort),
    ));

    let config = match build_engine_config(
        adapter.as_ref(),
        cli.delimiter.as_deref(),
        cli.password.as_deref(),
    ) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return (&e).into();
        }
    };
    let engine = Engine::new(config);

    match &cli.command {
        Some(Command::Describe { file }) => run_describe(&engine, file),
        None => run_queries(&engine, cli.query.as_deref(), cli.save.as_deref()),
    }
}

pub fn load_config(path: &PathBuf) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(|err| {
        eprintln!("error: {err}");
        ExitCode::from(&err)
    })
}

/// Engine settings from the config file, if any, with command-line flags
/// taking precedence.
pub fn build_engine_config(
    adapter: Option<&FileConfigAdapter>,
    delimiter: Option<&str>,
    password: Option<&str>,
) -> Result<EngineConfig, QueryError> {
    let mut config = match adapter {
        Some(a) => EngineConfig::from_config(a)?,
        None => EngineConfig::default(),
    };
    if let Some(d) = delimiter {
        config.delimiter = parse_delimiter(d).ok_or_else(|| QueryError::ConfigInvalid {
            section: "cli".to_string(),
            key: "delimiter".to_string(),
            reason: format!("'{d}' is not a single-byte delimiter"),
        })?;
    }
    if let Some(p) = password.filter(|p| !p.is_empty()) {
        config.password = Some(p.to_string());
    }
    Ok(config)
}

/// Output file for the `index`th (1-based) of `total` queries. A batch
/// writes `<stem>-N.csv` next to the requested path.
pub fn save_path(base: &Path, index: usize, total: usize) -> PathBuf {
    if total <= 1 {
        return base.to_path_buf();
    }
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "result".to_string());
    base.with_file_name(format!("{stem}-{index}.csv"))
}

fn run_describe(engine: &Engine, file: &Path) -> ExitCode {
    let summary = match engine.describe_file(file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            return (&e).into();
        }
    };
    println!("{}", summary.path);
    for column in &summary.columns {
        println!("{:>4}  {:<24} {}", column.position, column.name, column.data_type);
    }
    println!("{} rows", summary.rows);
    ExitCode::SUCCESS
}

fn run_queries(engine: &Engine, query: Option<&str>, save: Option<&Path>) -> ExitCode {
    // Stage 1: Collect statements
    let statements = match query {
        Some(q) => vec![q.to_string()],
        None => {
            let mut batch = String::new();
            if let Err(e) = io::stdin().read_to_string(&mut batch) {
                let err = QueryError::Io(e);
                eprintln!("error: {err}");
                return (&err).into();
            }
            split_batch(&batch)
        }
    };
    if statements.is_empty() {
        eprintln!("error: no query given");
        return ExitCode::from(4);
    }

    // Stage 2: Run each statement; a failure is reported and the batch goes on
    let total = statements.len();
    let mut status = ExitCode::SUCCESS;
    let mut failed = false;
    for (i, text) in statements.iter().enumerate() {
        let outcome = match save {
            Some(base) => run_to_file(engine, text, &save_path(base, i + 1, total)),
            None => {
                if i > 0 {
                    println!();
                }
                run_to_stdout(engine, text)
            }
        };
        match outcome {
            Ok(stats) => {
                if stats.cancelled {
                    eprintln!("query {} cancelled after {} rows", i + 1, stats.row_count);
                }
                tracing::info!(query = i + 1, rows = stats.row_count, "query done");
            }
            Err(e) => {
                report(&e, text);
                if !failed {
                    status = (&e).into();
                    failed = true;
                }
            }
        }
    }
    status
}

fn run_to_stdout(engine: &Engine, text: &str) -> Result<QueryStats, QueryError> {
    let stdout = io::stdout();
    let mut sink = CsvSink::new(stdout.lock(), engine.config().delimiter);
    let stats = engine.query_to_sink(text, &mut sink)?;
    sink.into_inner()?.flush()?;
    Ok(stats)
}

fn run_to_file(engine: &Engine, text: &str, path: &Path) -> Result<QueryStats, QueryError> {
    let file = File::create(path).map_err(|e| QueryError::Schema {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut sink = CsvSink::new(BufWriter::new(file), engine.config().delimiter);
    let stats = engine.query_to_sink(text, &mut sink)?;
    sink.into_inner()?.flush()?;
    eprintln!("saved {} rows to {}", stats.row_count, path.display());
    Ok(stats)
}

fn report(err: &QueryError, text: &str) {
    match err {
        QueryError::Parse(p) => eprintln!("error:\n{}", p.display_with_context(text)),
        _ => eprintln!("error: {err}"),
    }
}
