//! Query engine: lexing, parsing, analysis and execution.

pub mod error;
pub mod value;
pub mod temporal;
pub mod schema;
pub mod reader;
pub mod lexer;
pub mod ast;
pub mod parser;
pub mod typecheck;
pub mod rewrite;
pub mod functions;
pub mod eval;
pub mod join;
pub mod group;
pub mod progress;
pub mod executor;
pub mod engine;
pub mod config_validation;
