//! Concrete adapter implementations for ports.

pub mod csv_ingest;
pub mod csv_sink;
pub mod file_config_adapter;
