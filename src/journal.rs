use serde::{Serialize, Deserialize};
use std::path::{Path, PathBuf};
use std::fs::{OpenOptions, File};
use std::io::{BufReader, BufWriter, Write, BufRead};
use chrono::Utc;

use crate::error::{DeployError, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStatus {
    Completed,
    Failed,
    SizeMismatch,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeployJournalEntry {
    pub timestamp: String,
    pub session_id: String,
    pub peer: String,
    pub destination: String,
    pub status: DeployStatus,
    pub items: u64,
    pub bytes: u64,
    pub error: Option<String>,
}

impl DeployJournalEntry {
    pub fn new(session_id: &str, peer: &str, destination: &str, status: DeployStatus) -> Self {
        DeployJournalEntry {
            timestamp: Utc::now().to_rfc3339(),
            session_id: session_id.to_string(),
            peer: peer.to_string(),
            destination: destination.to_string(),
            status,
            items: 0,
            bytes: 0,
            error: None,
        }
    }

    pub fn with_counts(mut self, items: u64, bytes: u64) -> Self {
        self.items = items;
        self.bytes = bytes;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Append-only JSONL record of destination outcomes
#[derive(Debug, Clone)]
pub struct DeployJournal {
    path: PathBuf,
}

impl DeployJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DeployJournal { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_entry(&self, entry: &DeployJournalEntry) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| DeployError::io(&self.path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)
            .map_err(|e| DeployError::io(&self.path, e.into()))?;
        writer.write_all(b"\n").map_err(|e| DeployError::io(&self.path, e))?;
        writer.flush().map_err(|e| DeployError::io(&self.path, e))?;
        Ok(())
    }

    pub fn read_journal(&self) -> Result<Vec<DeployJournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).map_err(|e| DeployError::io(&self.path, e))?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| DeployError::io(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: DeployJournalEntry = serde_json::from_str(&line)
                .map_err(|e| DeployError::io(&self.path, e.into()))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}
