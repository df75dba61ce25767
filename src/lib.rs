//! csvquery: SQL-like queries over delimited text files.
//!
//! Hexagonal architecture: the query engine in [`domain`], port traits in
//! [`ports`], file-backed implementations in [`adapters`].

pub mod domain;
pub mod ports;
pub mod adapters;
pub mod cli;
pub mod logging;
