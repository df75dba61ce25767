//! Configuration validation.
//!
//! Checks every engine setting before a query runs; missing keys are fine,
//! malformed ones are not.

use crate::domain::error::QueryError;
use crate::ports::config_port::ConfigPort;

pub const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

pub fn validate_engine_config(config: &dyn ConfigPort) -> Result<(), QueryError> {
    validate_delimiter(config)?;
    validate_join_size_threshold(config)?;
    validate_sample_rows(config)?;
    validate_progress_interval(config)?;
    validate_log_level(config)?;
    Ok(())
}

/// Single-byte field delimiter; `tab` and `\t` name the tab character.
pub fn parse_delimiter(text: &str) -> Option<u8> {
    match text {
        "tab" | "\\t" | "\t" => Some(b'\t'),
        _ => match text.trim().as_bytes() {
            [b] if b.is_ascii() && *b != b'"' && *b != b'\n' => Some(*b),
            _ => None,
        },
    }
}

fn validate_delimiter(config: &dyn ConfigPort) -> Result<(), QueryError> {
    match config.get_string("engine", "delimiter") {
        None => Ok(()),
        Some(d) if parse_delimiter(&d).is_some() => Ok(()),
        Some(d) => Err(QueryError::ConfigInvalid {
            section: "engine".to_string(),
            key: "delimiter".to_string(),
            reason: format!("'{d}' is not a single-byte delimiter"),
        }),
    }
}

fn positive_int(config: &dyn ConfigPort, key: &str, allow_zero: bool) -> Result<(), QueryError> {
    let invalid = |reason: String| QueryError::ConfigInvalid {
        section: "engine".to_string(),
        key: key.to_string(),
        reason,
    };
    match config.get_int("engine", key).map_err(invalid)? {
        Some(v) if v < 0 || (v == 0 && !allow_zero) => Err(invalid(format!(
            "{key} must be {}",
            if allow_zero { "non-negative" } else { "positive" }
        ))),
        _ => Ok(()),
    }
}

fn validate_join_size_threshold(config: &dyn ConfigPort) -> Result<(), QueryError> {
    positive_int(config, "join_size_threshold", true)
}

fn validate_sample_rows(config: &dyn ConfigPort) -> Result<(), QueryError> {
    positive_int(config, "sample_rows", false)
}

fn validate_progress_interval(config: &dyn ConfigPort) -> Result<(), QueryError> {
    positive_int(config, "progress_interval_ms", true)
}

fn validate_log_level(config: &dyn ConfigPort) -> Result<(), QueryError> {
    match config.get_string("logging", "level") {
        None => Ok(()),
        Some(level) if LOG_LEVELS.contains(&level.to_lowercase().as_str()) => Ok(()),
        Some(level) => Err(QueryError::ConfigInvalid {
            section: "logging".to_string(),
            key: "level".to_string(),
            reason: format!("unknown level '{level}', expected one of {}", LOG_LEVELS.join(", ")),
        }),
    }
}
