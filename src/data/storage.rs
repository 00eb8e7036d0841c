//! Data storage writers: streaming CSV sinks and JSON documents.
use crate::{
    error::AppResult,
    experiment::MethodKind,
    instrument::{SampleRecord, SampleSink},
};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

// ============================================================================
// CSV Sample Sink
// ============================================================================

/// Two-column CSV sink that persists every delivered batch immediately.
///
/// The header is chosen from the method: time/current for multi-step
/// amperometry, potential/current for everything else. Nothing is written after
/// the last sample row, so a file cut short by a crash is still a valid table.
pub struct CsvSampleSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: usize,
}

impl CsvSampleSink {
    /// Create the file (and parent directories) and write the header row.
    pub fn create<P: AsRef<Path>>(path: P, method: MethodKind) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(Self::header(method))?;
        writer.flush()?;
        debug!(path = %path.display(), "CSV sink opened");
        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }

    /// Column names for `method`.
    pub fn header(method: MethodKind) -> [&'static str; 2] {
        if method.is_time_based() {
            ["Time (s)", "Current (uA)"]
        } else {
            ["Potential (V)", "Current (uA)"]
        }
    }

    /// Destination file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of sample rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Flush and close, returning the number of sample rows.
    pub fn finish(mut self) -> AppResult<usize> {
        self.writer.flush()?;
        Ok(self.rows)
    }
}

impl SampleSink for CsvSampleSink {
    fn write_batch(&mut self, batch: &[SampleRecord]) -> AppResult<()> {
        for point in batch {
            self.writer
                .write_record([point.x.to_string(), point.y.to_string()])?;
        }
        self.writer.flush()?;
        self.rows += batch.len();
        Ok(())
    }
}

// ============================================================================
// JSON documents
// ============================================================================

fn encode_pretty<T: Serialize + ?Sized, W: Write>(writer: W, value: &T) -> AppResult<()> {
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(writer, formatter);
    value.serialize(&mut ser)?;
    Ok(())
}

/// Write `value` as 4-space indented JSON, creating parent directories.
pub fn write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    encode_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

/// Like [`write_json_pretty`], but through a sibling temp file renamed over `path`,
/// so readers never observe a half-written document.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> AppResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    write_json_pretty(&tmp, value)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_sink_streams_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("run.csv");
        let mut sink = CsvSampleSink::create(&path, MethodKind::Cv).unwrap();

        sink.write_batch(&[SampleRecord::new(0.1, 1.5), SampleRecord::new(0.2, 2.5)])
            .unwrap();
        // Visible on disk before the sink is finished.
        let partial = std::fs::read_to_string(&path).unwrap();
        assert_eq!(partial, "Potential (V),Current (uA)\n0.1,1.5\n0.2,2.5\n");

        sink.write_batch(&[SampleRecord::new(0.3, -1.0)]).unwrap();
        assert_eq!(sink.finish().unwrap(), 3);
        let full = std::fs::read_to_string(&path).unwrap();
        assert!(full.ends_with("0.3,-1\n"));
    }

    #[test]
    fn test_msa_header_is_time_based() {
        assert_eq!(
            CsvSampleSink::header(MethodKind::Msa),
            ["Time (s)", "Current (uA)"]
        );
        assert_eq!(
            CsvSampleSink::header(MethodKind::Lsv),
            ["Potential (V)", "Current (uA)"]
        );
    }

    #[test]
    fn test_json_written_with_four_space_indent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_json_atomic(&path, &serde_json::json!({ "channel": 0 })).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "{\n    \"channel\": 0\n}");
        assert!(!dir.path().join("doc.json.tmp").exists());
    }
}
