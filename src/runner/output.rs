//! Per-run output layout.
//!
//! ```text
//! {session}/{experiment}/{METHOD}/files/ch{ch}[_c{tag}]_{timestamp}_{title}.csv
//! {session}/{experiment}/{METHOD}/logs/ch{ch}[_c{tag}]_{timestamp}_{title}.json
//! ```

use crate::data::storage::write_json_pretty;
use crate::error::AppResult;
use crate::experiment::MethodKind;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Filename timestamp for a run starting at `now`.
pub fn run_timestamp(now: DateTime<Local>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// Data and log destinations of a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    /// `.../files/{stem}.csv`
    pub data: PathBuf,
    /// `.../logs/{stem}.json`
    pub log: PathBuf,
}

impl RunPaths {
    /// Paths for one run under `experiment_dir`.
    pub fn derive(
        experiment_dir: &Path,
        channel: usize,
        method: MethodKind,
        concentration: Option<&str>,
        timestamp: &str,
        title: &str,
    ) -> Self {
        let conc = concentration.map(|c| format!("_c{c}")).unwrap_or_default();
        let stem = format!("ch{channel}{conc}_{timestamp}_{}", title.replace(' ', "_"));
        let method_dir = experiment_dir.join(method.code());
        Self {
            data: method_dir.join("files").join(format!("{stem}.csv")),
            log: method_dir.join("logs").join(format!("{stem}.json")),
        }
    }
}

/// Metadata written next to each completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    /// Channel index
    pub channel: usize,
    /// Measurement technique
    pub method: MethodKind,
    /// Run title
    pub title: String,
    /// Same timestamp as in the file names
    pub timestamp: String,
    /// Concrete parameters, with plan-file key names
    pub parameters: Value,
    /// Concentration tag, `null` when absent
    pub concentration: Option<String>,
}

impl RunLog {
    /// Write as pretty JSON to `path`.
    pub fn write(&self, path: &Path) -> AppResult<()> {
        write_json_pretty(path, self)
    }
}
