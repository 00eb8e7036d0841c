//! Session persistence and the in-memory measurement accumulator.
//!
//! A session directory accumulates every measurement collected against it over any
//! number of program runs. At the end of each run the saved record is loaded, the
//! new measurements are appended, and the whole document is written back in place.

use crate::data::storage::write_json_atomic;
use crate::error::AppResult;
use crate::instrument::Measurement;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// On-disk session document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFile {
    /// Session name
    pub name: String,
    /// Time of the last save
    pub updated: DateTime<Utc>,
    /// Every measurement ever saved, oldest first
    #[serde(default)]
    pub measurements: Vec<Measurement>,
}

/// Load/merge/save for `{session_dir}/{name}.session.json`.
#[derive(Debug, Clone)]
pub struct SessionStore {
    session_dir: PathBuf,
    name: String,
}

impl SessionStore {
    /// Store for the session `name` in `session_dir`.
    pub fn new<P: Into<PathBuf>>(session_dir: P, name: &str) -> Self {
        Self {
            session_dir: session_dir.into(),
            name: name.to_string(),
        }
    }

    /// Session name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the session and its experiments.
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Session document path.
    pub fn path(&self) -> PathBuf {
        self.session_dir.join(format!("{}.session.json", self.name))
    }

    /// Previously saved measurements, or none when the session is new.
    pub fn load(&self) -> AppResult<Vec<Measurement>> {
        let path = self.path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        info!(path = %path.display(), "Loading existing session");
        let text = std::fs::read_to_string(&path)?;
        let file: SessionFile = serde_json::from_str(&text)?;
        Ok(file.measurements)
    }

    /// Existing records followed by the new ones. Nothing is dropped or reordered.
    pub fn merge(mut existing: Vec<Measurement>, new: Vec<Measurement>) -> Vec<Measurement> {
        existing.extend(new);
        existing
    }

    /// Overwrite the session document with `records`.
    pub fn save(&self, records: &[Measurement]) -> AppResult<PathBuf> {
        std::fs::create_dir_all(&self.session_dir)?;
        let path = self.path();
        let file = SessionFile {
            name: self.name.clone(),
            updated: Utc::now(),
            measurements: records.to_vec(),
        };
        write_json_atomic(&path, &file)?;
        info!(path = %path.display(), measurements = records.len(), "Session updated");
        Ok(path)
    }
}

/// Append-only measurement list shared by all channel tasks.
///
/// Appends from different channels are serialized by a single mutex; the lock is
/// never held across an await point.
#[derive(Debug, Clone, Default)]
pub struct SessionCollector {
    inner: Arc<Mutex<Vec<Measurement>>>,
}

impl SessionCollector {
    /// An empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one measurement.
    pub fn push(&self, measurement: Measurement) {
        self.inner.lock().push(measurement);
    }

    /// Number of collected measurements.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True if nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Take everything collected so far, leaving the collector empty.
    pub fn drain(&self) -> Vec<Measurement> {
        std::mem::take(&mut *self.inner.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::MethodKind;
    use crate::instrument::SampleRecord;

    fn measurement(channel: usize, title: &str) -> Measurement {
        let mut m = Measurement::new(channel, MethodKind::Cv, Utc::now()).with_title(title);
        m.points.push(SampleRecord::new(0.1, 0.2));
        m
    }

    #[test]
    fn test_missing_file_is_empty_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("never_created"), "s1");
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_merge_save_load_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), "s1");

        let first = vec![measurement(0, "a"), measurement(1, "b")];
        store.save(&first).unwrap();

        let second = vec![measurement(0, "c")];
        let merged = SessionStore::merge(store.load().unwrap(), second.clone());
        store.save(&merged).unwrap();

        let reloaded = store.load().unwrap();
        let titles: Vec<_> = reloaded.iter().map(|m| m.title.as_str()).collect();
        assert_eq!(titles, ["a", "b", "c"]);
        assert_eq!(reloaded[0], first[0]);
        assert_eq!(reloaded[2], second[0]);
        assert_eq!(store.path(), dir.path().join("s1.session.json"));
    }

    #[test]
    fn test_collector_is_shared_between_clones() {
        let collector = SessionCollector::new();
        let clone = collector.clone();
        clone.push(measurement(0, "x"));
        collector.push(measurement(1, "y"));
        assert_eq!(collector.len(), 2);
        assert_eq!(clone.drain().len(), 2);
        assert!(collector.is_empty());
    }
}
