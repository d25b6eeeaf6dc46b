//! Append-only transaction log.
//!
//! Every transfer state change lands here, in memory and optionally in a
//! JSON-lines file. The log is queryable per transfer or for the most
//! recent transfer.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use starlift_core::id::TransferId;

use crate::transfer::{TransactionEvent, TransferState};

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("transaction log io: {0}")]
    Io(#[from] std::io::Error),

    #[error("transaction log line {line}: {detail}")]
    Parse { line: usize, detail: String },

    #[error("transaction event encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
pub struct TransactionLog {
    events: Vec<TransactionEvent>,
    sink: Option<(PathBuf, File)>,
}

impl TransactionLog {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A log that also appends to `path`, creating it if needed.
    pub fn with_file(path: &Path) -> Result<Self, LogError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            events: Vec::new(),
            sink: Some((path.to_path_buf(), file)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|(p, _)| p.as_path())
    }

    /// Record an event. The in-memory copy is kept even if the file write
    /// fails.
    pub fn append(&mut self, event: TransactionEvent) -> Result<(), LogError> {
        let written = match &mut self.sink {
            Some((_, file)) => serde_json::to_string(&event)
                .map_err(LogError::from)
                .and_then(|line| writeln!(file, "{line}").map_err(LogError::from)),
            None => Ok(()),
        };
        self.events.push(event);
        written
    }

    pub fn events(&self) -> &[TransactionEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn for_transfer(&self, id: TransferId) -> Vec<&TransactionEvent> {
        self.events.iter().filter(|e| e.transfer_id == id).collect()
    }

    /// The states a transfer has passed through, in order.
    pub fn states(&self, id: TransferId) -> Vec<TransferState> {
        self.for_transfer(id).iter().map(|e| e.state).collect()
    }

    pub fn most_recent(&self) -> Option<&TransactionEvent> {
        self.events.last()
    }

    /// Events of the transfer that logged last.
    pub fn most_recent_transfer(&self) -> Vec<&TransactionEvent> {
        match self.most_recent() {
            Some(last) => self.for_transfer(last.transfer_id),
            None => Vec::new(),
        }
    }

    /// Read a JSON-lines log back from disk.
    pub fn load(path: &Path) -> Result<Vec<TransactionEvent>, LogError> {
        let reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line).map_err(|e| LogError::Parse {
                line: i + 1,
                detail: e.to_string(),
            })?;
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferRecord;
    use starlift_core::id::{ExportId, InstanceId};

    fn events_for(id: u64, start: u64) -> Vec<TransactionEvent> {
        let (mut r, created) = TransferRecord::create(
            TransferId(id),
            "alpha",
            InstanceId(1),
            InstanceId(2),
            ExportId(id),
            start,
        );
        let locked = r.transition(TransferState::Locked, start + 5, "").unwrap();
        vec![created, locked]
    }

    #[test]
    fn queries_by_transfer_and_most_recent() {
        let mut log = TransactionLog::in_memory();
        for e in events_for(1, 0).into_iter().chain(events_for(2, 100)) {
            log.append(e).unwrap();
        }
        assert_eq!(log.len(), 4);
        assert_eq!(
            log.states(TransferId(1)),
            vec![TransferState::Created, TransferState::Locked]
        );
        assert_eq!(log.most_recent().unwrap().transfer_id, TransferId(2));
        assert_eq!(log.most_recent_transfer().len(), 2);
    }

    #[test]
    fn file_sink_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.jsonl");
        {
            let mut log = TransactionLog::with_file(&path).unwrap();
            for e in events_for(7, 10) {
                log.append(e).unwrap();
            }
            assert_eq!(log.path(), Some(path.as_path()));
        }
        // Reopening appends rather than truncating.
        let mut log = TransactionLog::with_file(&path).unwrap();
        for e in events_for(8, 20) {
            log.append(e).unwrap();
        }
        let loaded = TransactionLog::load(&path).unwrap();
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded[1].delta_ms, 5);
        assert_eq!(loaded[3].transfer_id, TransferId(8));
    }

    #[test]
    fn corrupt_line_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "\n{oops\n").unwrap();
        let err = TransactionLog::load(&path).unwrap_err();
        assert!(matches!(err, LogError::Parse { line: 2, .. }));
    }
}
