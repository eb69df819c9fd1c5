// Same-device mirror of the live snapshot.
//
// Instances on one machine share a JSON file. Each optimistic local change
// is published there immediately, and peers pick it up on their next poll
// without waiting for the durable store.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auction::AuctionSnapshot;

/// What is written to the mirror file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRecord {
    /// Milliseconds since the epoch, strictly increasing per writer.
    pub written_at_ms: i64,
    pub writer: String,
    pub snapshot: AuctionSnapshot,
}

pub struct LocalMirror {
    path: PathBuf,
    writer: String,
    /// Newest record this instance has written or applied.
    last_seen_ms: i64,
}

impl LocalMirror {
    /// A mirror at `path` with a writer id unique to this process.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let writer = format!("{}-{}", std::process::id(), Utc::now().timestamp_micros());
        Self::with_writer(path, writer)
    }

    pub fn with_writer(path: impl Into<PathBuf>, writer: impl Into<String>) -> Self {
        LocalMirror {
            path: path.into(),
            writer: writer.into(),
            last_seen_ms: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `snapshot` to the mirror file (temp file + rename, so readers
    /// never see a partial record).
    pub fn publish(&mut self, snapshot: &AuctionSnapshot) -> Result<()> {
        let written_at_ms = Utc::now().timestamp_millis().max(self.last_seen_ms + 1);
        let record = MirrorRecord {
            written_at_ms,
            writer: self.writer.clone(),
            snapshot: snapshot.clone(),
        };
        let json = serde_json::to_vec(&record).context("failed to serialize mirror record")?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        self.last_seen_ms = written_at_ms;
        Ok(())
    }

    /// Return a snapshot published by another instance since the last call,
    /// if there is one. Our own writes and stale records are skipped.
    pub fn poll(&mut self) -> Result<Option<AuctionSnapshot>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        let record: MirrorRecord =
            serde_json::from_slice(&bytes).context("failed to parse mirror record")?;

        if record.written_at_ms <= self.last_seen_ms {
            return Ok(None);
        }
        self.last_seen_ms = record.written_at_ms;
        if record.writer == self.writer {
            return Ok(None);
        }
        debug!("Applying mirrored snapshot from {}", record.writer);
        Ok(Some(record.snapshot))
    }
}
