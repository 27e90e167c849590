//! Scanner that replays reader output captured to JSON files.
//!
//! Each file holds what a reader reports for one scan window, either
//! `{"tags": [{"epc": "...", "timestamp": "..."}]}` or a bare list of tags.
//! Given several files, successive scans walk through them and then keep
//! returning the last one.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ortrack_protocol::{parse_scan_payload, ScanPayload};
use tracing::debug;

use crate::adapters::{ScanError, Scanner};
use crate::config::ReaderConfig;

pub struct FileScanner {
    paths: Vec<PathBuf>,
    cursor: AtomicUsize,
}

impl FileScanner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::sequence(vec![path.into()])
    }

    pub fn sequence(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            cursor: AtomicUsize::new(0),
        }
    }

    fn next_path(&self) -> Option<&PathBuf> {
        let position = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.paths
            .get(position)
            .or_else(|| self.paths.last())
    }
}

impl Scanner for FileScanner {
    fn scan(&self, duration: Duration, reader: &ReaderConfig) -> Result<ScanPayload, ScanError> {
        let path = self
            .next_path()
            .ok_or_else(|| ScanError::Unavailable("no scan files configured".to_string()))?;

        debug!(
            path = %path.display(),
            reader = %reader.name,
            duration_ms = duration.as_millis() as u64,
            "Reading scan capture"
        );

        let content = fs_err::read_to_string(path)
            .map_err(|err| ScanError::Transport(err.to_string()))?;
        let value: serde_json::Value = serde_json::from_str(&content)
            .map_err(|err| ScanError::Malformed(format!("{}: {}", path.display(), err)))?;
        parse_scan_payload(value).map_err(|info| ScanError::Malformed(info.message))
    }
}
