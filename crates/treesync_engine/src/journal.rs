//! Side log of built transmissions and received responses.
//!
//! Files are named from the creation time of their content
//! (`2024_03_01_14_05_09_123.tsync`, responses add `_response`) and hold the
//! CBOR `Exchange` envelope. The journal is an audit trail, never state:
//! write failures are logged and ignored.

use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use treesync_protocol::{Exchange, Transmission, TransmissionResponse};

/// Journal file extension.
pub const JOURNAL_EXTENSION: &str = "tsync";

const NAME_FORMAT: &str = "%Y_%m_%d_%H_%M_%S_%3f";

/// Writes exchanges to a directory, if one is configured.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    dir: Option<PathBuf>,
}

impl Journal {
    /// Creates a journal writing into `dir`; `None` disables it.
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// True if a directory is configured.
    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// File name for content created at `at`.
    pub fn file_name(at: DateTime<Utc>, response: bool) -> String {
        let stamp = at.format(NAME_FORMAT);
        if response {
            format!("{stamp}_response.{JOURNAL_EXTENSION}")
        } else {
            format!("{stamp}.{JOURNAL_EXTENSION}")
        }
    }

    /// Records a built transmission.
    pub fn write_transmission(&self, tx: &Transmission) -> Option<PathBuf> {
        self.write(tx.timestamp, false, &Exchange::Transmission(tx.clone()))
    }

    /// Records a received response.
    pub fn write_response(&self, response: &TransmissionResponse) -> Option<PathBuf> {
        self.write(response.timestamp, true, &Exchange::Response(response.clone()))
    }

    fn write(&self, at: DateTime<Utc>, response: bool, exchange: &Exchange) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        match Self::try_write(dir, at, response, exchange) {
            Ok(path) => {
                debug!(path = %path.display(), "journal entry written");
                Some(path)
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "failed to write journal entry");
                None
            }
        }
    }

    fn try_write(
        dir: &Path,
        at: DateTime<Utc>,
        response: bool,
        exchange: &Exchange,
    ) -> SyncResult<PathBuf> {
        fs::create_dir_all(dir)?;
        let name = Self::file_name(at, response);
        let mut path = dir.join(&name);
        let mut n = 1;
        while path.exists() {
            let stem = name.trim_end_matches(&format!(".{JOURNAL_EXTENSION}"));
            path = dir.join(format!("{stem}_{n}.{JOURNAL_EXTENSION}"));
            n += 1;
        }
        fs::write(&path, exchange.encode()?)?;
        Ok(path)
    }

    /// Journal files in `dir`, oldest first.
    pub fn list(dir: &Path) -> SyncResult<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |ext| ext == JOURNAL_EXTENSION))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Reads one journal file.
    pub fn read(path: &Path) -> SyncResult<Exchange> {
        let bytes = fs::read(path)?;
        Ok(Exchange::decode(&bytes)?)
    }
}
