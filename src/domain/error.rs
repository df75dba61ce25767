//! Error types for lexing, parsing, type checking and execution.

/// A character the lexer could not place in any token.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("lex error at line {line}, column {col}: {message}")]
pub struct LexError {
    pub message: String,
    pub found: char,
    pub line: usize,
    pub col: usize,
}

/// A parse error with the line and column of the offending token.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("parse error at line {line}, column {col}: {message}")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl ParseError {
    /// Format the error with a caret under the offending column of the query.
    pub fn display_with_context(&self, input: &str) -> String {
        let source_line = input.lines().nth(self.line.saturating_sub(1)).unwrap_or("");
        let caret = " ".repeat(self.col.saturating_sub(1)) + "^";
        format!(
            "{input}\n{caret}\n{err}",
            input = source_line,
            caret = caret,
            err = self
        )
    }
}

/// Top-level error type for csvquery.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("cannot open {path}: {reason}")]
    Schema { path: String, reason: String },

    #[error("type error: {reason}")]
    Type { reason: String },

    #[error("execution error: {reason}")]
    Execution { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl QueryError {
    pub fn type_error(reason: impl Into<String>) -> Self {
        QueryError::Type {
            reason: reason.into(),
        }
    }

    pub fn execution(reason: impl Into<String>) -> Self {
        QueryError::Execution {
            reason: reason.into(),
        }
    }
}

impl From<csv::Error> for QueryError {
    fn from(err: csv::Error) -> Self {
        QueryError::Execution {
            reason: err.to_string(),
        }
    }
}

impl From<&QueryError> for std::process::ExitCode {
    fn from(err: &QueryError) -> Self {
        let code: u8 = match err {
            QueryError::Io(_) => 1,
            QueryError::ConfigParse { .. } | QueryError::ConfigInvalid { .. } => 2,
            QueryError::Schema { .. } => 3,
            QueryError::Lex(_) | QueryError::Parse(_) | QueryError::Type { .. } => 4,
            QueryError::Execution { .. } => 5,
        };
        std::process::ExitCode::from(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_context_points_at_column() {
        let err = ParseError {
            message: "expected FROM".to_string(),
            line: 2,
            col: 5,
        };
        let rendered = err.display_with_context("select a\nfrm x.csv");
        let mut lines = rendered.lines();
        assert_eq!(lines.next(), Some("frm x.csv"));
        assert_eq!(lines.next(), Some("    ^"));
        assert!(lines.next().unwrap().contains("line 2, column 5"));
    }

    #[test]
    fn lex_error_converts_into_query_error() {
        let err: QueryError = LexError {
            message: "unterminated quote".to_string(),
            found: '\'',
            line: 1,
            col: 8,
        }
        .into();
        assert!(matches!(err, QueryError::Lex(_)));
        assert!(err.to_string().contains("unterminated quote"));
    }

    #[test]
    fn exit_codes_group_by_kind() {
        use std::process::ExitCode;
        // ExitCode doesn't implement PartialEq, so compare debug output
        let type_err = QueryError::type_error("bad");
        let exec_err = QueryError::execution("boom");
        assert_eq!(
            format!("{:?}", ExitCode::from(&type_err)),
            format!("{:?}", ExitCode::from(4))
        );
        assert_eq!(
            format!("{:?}", ExitCode::from(&exec_err)),
            format!("{:?}", ExitCode::from(5))
        );
    }
}
