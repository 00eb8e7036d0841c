//! Data storage modules.

pub mod storage;

pub use storage::{write_json_atomic, write_json_pretty, CsvSampleSink};
