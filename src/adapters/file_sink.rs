//! Append-only JSON-lines journal.
//!
//! One [`EventRecord`] per line, flushed after every write so a crash
//! loses at most the row being written.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::app::ports::RecordSink;
use crate::error::PersistError;
use crate::router::codec::EventRecord;

pub struct JsonlRecordSink {
    path: PathBuf,
    writer: BufWriter<File>,
    rows: u64,
}

impl JsonlRecordSink {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PersistError::Unavailable(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written since open.
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

impl RecordSink for JsonlRecordSink {
    fn write(&mut self, record: &EventRecord) -> Result<(), PersistError> {
        let mut line =
            serde_json::to_vec(record).map_err(|e| PersistError::Encode(e.to_string()))?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .and_then(|()| self.writer.flush())
            .map_err(|e| PersistError::WriteFailed(e.to_string()))?;
        self.rows += 1;
        Ok(())
    }
}
