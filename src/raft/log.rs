use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use bytes::Bytes;

/// One replicated log entry. The index is implicit: an entry's position
/// in the in-memory vector is its index, with position 0 held by the
/// sentinel (term -1, empty command) that anchors consistency checks.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub term: i32,
    pub command: Bytes,
}

#[derive(Debug)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> RaftLog {
        RaftLog {
            entries: vec![LogEntry {
                term: -1,
                command: Bytes::new(),
            }],
        }
    }

    /// Number of slots including the sentinel; this is the xLen hint.
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_index(&self) -> u64 {
        (self.entries.len() - 1) as u64
    }

    pub fn last_term(&self) -> i32 {
        self.entries[self.entries.len() - 1].term
    }

    pub fn term_at(&self, index: u64) -> Option<i32> {
        self.entries.get(index as usize).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize)
    }

    pub fn append(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// Drop every entry at `from` and beyond.
    pub fn truncate(&mut self, from: u64) {
        self.entries.truncate(from.max(1) as usize);
    }

    pub fn entries_from(&self, index: u64) -> &[LogEntry] {
        let start = (index as usize).min(self.entries.len());
        &self.entries[start..]
    }

    /// First index carrying `term`, the xIndex hint.
    pub fn first_index_of_term(&self, term: i32) -> Option<u64> {
        self.entries
            .iter()
            .position(|e| e.term == term)
            .map(|i| i as u64)
    }

    pub fn last_index_of_term(&self, term: i32) -> Option<u64> {
        self.entries
            .iter()
            .rposition(|e| e.term == term)
            .map(|i| i as u64)
    }

    /// True when (last_term, last_index) is at least as up-to-date as
    /// this log, the vote-granting rule.
    pub fn other_is_up_to_date(&self, other_last_index: u64, other_last_term: i32) -> bool {
        other_last_term > self.last_term()
            || (other_last_term == self.last_term() && other_last_index >= self.last_index())
    }
}

/// Split persistent layout: a fixed-size header file with currentTerm
/// and votedFor as big-endian 32-bit integers, and a log file of
/// length-prefixed, term-tagged entries. Both are fsynced before any
/// RPC reply that depends on them.
pub struct Storage {
    hdr: File,
    log: File,
    log_path: PathBuf,
}

impl Storage {
    /// Open (or create) the node's state files, returning the restored
    /// term, vote and log. A partially written trailing entry, left by
    /// a crash mid-append, is discarded.
    pub fn open(dir: &str, node_id: u32) -> std::io::Result<(Storage, i32, i32, RaftLog)> {
        std::fs::create_dir_all(dir)?;
        let hdr_path = PathBuf::from(dir).join(format!("node-{}.raof", node_id));
        let log_path = PathBuf::from(dir).join(format!("node-{}.log", node_id));

        let mut hdr = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&hdr_path)?;
        let mut term = 0i32;
        let mut voted_for = -1i32;
        let mut hdr_bytes = Vec::new();
        hdr.read_to_end(&mut hdr_bytes)?;
        if hdr_bytes.len() >= 8 {
            term = i32::from_be_bytes([hdr_bytes[0], hdr_bytes[1], hdr_bytes[2], hdr_bytes[3]]);
            voted_for =
                i32::from_be_bytes([hdr_bytes[4], hdr_bytes[5], hdr_bytes[6], hdr_bytes[7]]);
        }

        let mut log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&log_path)?;
        let mut raw = Vec::new();
        log_file.read_to_end(&mut raw)?;
        let mut log = RaftLog::new();
        let mut pos = 0usize;
        let mut valid = 0usize;
        while pos + 8 <= raw.len() {
            let len = u32::from_be_bytes([raw[pos], raw[pos + 1], raw[pos + 2], raw[pos + 3]])
                as usize;
            let term = i32::from_be_bytes([
                raw[pos + 4],
                raw[pos + 5],
                raw[pos + 6],
                raw[pos + 7],
            ]);
            if pos + 8 + len > raw.len() {
                break;
            }
            log.append(LogEntry {
                term,
                command: Bytes::copy_from_slice(&raw[pos + 8..pos + 8 + len]),
            });
            pos += 8 + len;
            valid = pos;
        }
        if valid < raw.len() {
            log_file.set_len(valid as u64)?;
            log_file.sync_all()?;
        }
        log_file.seek(SeekFrom::End(0))?;

        Ok((
            Storage {
                hdr,
                log: log_file,
                log_path,
            },
            term,
            voted_for,
            log,
        ))
    }

    pub fn save_hdr(&mut self, term: i32, voted_for: i32) -> std::io::Result<()> {
        self.hdr.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&term.to_be_bytes());
        buf[4..].copy_from_slice(&voted_for.to_be_bytes());
        self.hdr.write_all(&buf)?;
        self.hdr.sync_data()
    }

    /// Incrementally append entries to the log file.
    pub fn append_entries(&mut self, entries: &[LogEntry]) -> std::io::Result<()> {
        let mut buf = Vec::new();
        for entry in entries {
            buf.extend_from_slice(&(entry.command.len() as u32).to_be_bytes());
            buf.extend_from_slice(&entry.term.to_be_bytes());
            buf.extend_from_slice(&entry.command);
        }
        self.log.write_all(&buf)?;
        self.log.sync_data()
    }

    /// Rewrite the whole log file. Used after a conflict truncation,
    /// which is rare enough that the full rewrite is the simple,
    /// correct choice.
    pub fn rewrite_log(&mut self, log: &RaftLog) -> std::io::Result<()> {
        let mut file = File::create(&self.log_path)?;
        let mut buf = Vec::new();
        for entry in log.entries_from(1) {
            buf.extend_from_slice(&(entry.command.len() as u32).to_be_bytes());
            buf.extend_from_slice(&entry.term.to_be_bytes());
            buf.extend_from_slice(&entry.command);
        }
        file.write_all(&buf)?;
        file.sync_all()?;
        file.seek(SeekFrom::End(0))?;
        self.log = file;
        Ok(())
    }
}
