// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! An append-only log of run events, one tab-separated line per event.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::Path,
    sync::Mutex,
};

use {
    chrono::{Local, NaiveDateTime},
    log::warn,
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.%f";

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[derive(Debug)]
pub struct Journal {
    file: Mutex<File>,
}

impl Journal {
    /// Open (creating if needed) the journal at `path`. New records are appended.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Writes a single record to the journal.
    pub fn write_record(&self, record: &Record) -> io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("journal lock poisoned"))?;
        file.write_all(&[record.as_string().as_bytes(), b"\n"].concat())
    }

    /// Read every record in the journal at `path`, sorted by timestamp in ascending order.
    ///
    /// Lines that are not valid records, such as one cut short when a write was interrupted,
    /// are logged and skipped.
    pub fn read_all(path: &Path) -> io::Result<Vec<Record>> {
        let file = File::open(path)?;
        let mut records = Vec::new();
        for (n, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = String::from_utf8_lossy(&line?).into_owned();
            match Record::from_string(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("{}:{}: skipping bad record: {e}", path.display(), n + 1),
            }
        }
        records.sort_by_key(|record| record.timestamp);
        Ok(records)
    }
}

/// A single event in the journal.
#[derive(Debug, PartialEq)]
pub struct Record {
    pub timestamp: NaiveDateTime,
    pub event: Event,
    /// The cluster or host the event is about.
    pub obj_id: String,
    pub comment: Option<String>,
}

impl Record {
    pub fn new(event: Event, obj_id: &str, comment: Option<String>) -> Self {
        Record {
            timestamp: Local::now().naive_local(),
            event,
            obj_id: obj_id.to_string(),
            comment,
        }
    }

    pub fn as_string(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.event,
            self.obj_id,
            match self.comment {
                Some(ref comment) => comment.replace('\n', " "),
                None => String::new(),
            },
        )
    }

    pub fn from_string(record: &str) -> io::Result<Self> {
        let mut fields = record.splitn(4, '\t');
        let Some(timestamp) = fields.next() else {
            return Err(invalid("missing timestamp field".to_string()));
        };
        let Some(event) = fields.next() else {
            return Err(invalid(format!("missing event field in '{record}'")));
        };
        let Some(obj_id) = fields.next() else {
            return Err(invalid(format!("missing object field in '{record}'")));
        };
        let comment = fields.next().filter(|c| !c.is_empty());

        let timestamp = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
            .map_err(|e| invalid(format!("failed to parse timestamp '{timestamp}': {e}")))?;

        Ok(Self {
            timestamp,
            event: Event::try_from(event)?,
            obj_id: obj_id.to_string(),
            comment: comment.map(|c| c.to_string()),
        })
    }
}

/// All events that can be recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    RunStart,
    PreflightFailed,
    /// One playbook attempt finished; the comment holds its status and command.
    Playbook,
    Deployed,
    Verified,
    Reset,
    RunFailed,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            "{}",
            match self {
                Self::RunStart => "run-start",
                Self::PreflightFailed => "preflight-failed",
                Self::Playbook => "playbook",
                Self::Deployed => "deployed",
                Self::Verified => "verified",
                Self::Reset => "reset",
                Self::RunFailed => "run-failed",
            }
        )
    }
}

impl TryFrom<&str> for Event {
    type Error = io::Error;
    fn try_from(val: &str) -> Result<Self, Self::Error> {
        Ok(match val {
            "run-start" => Self::RunStart,
            "preflight-failed" => Self::PreflightFailed,
            "playbook" => Self::Playbook,
            "deployed" => Self::Deployed,
            "verified" => Self::Verified,
            "reset" => Self::Reset,
            "run-failed" => Self::RunFailed,
            _ => return Err(invalid(format!("failed to parse '{val}' as Event"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_with_tabs_survives() {
        let record = Record::new(
            Event::RunFailed,
            "cluster.local",
            Some("execution failed:\tplaybook exited with status 2".to_string()),
        );
        let parsed = Record::from_string(&record.as_string()).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn bad_lines_are_rejected() {
        assert!(Record::from_string("2025-01-01T00:00:00.0\tbogus\tx\t").is_err());
        assert!(Record::from_string("yesterday\tdeployed\tx\t").is_err());
        assert!(Record::from_string("2025-01-01T00:00:00.0").is_err());
    }

    #[test]
    fn journal_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        {
            let journal = Journal::open(&path).unwrap();
            journal
                .write_record(&Record::new(Event::RunStart, "c1", None))
                .unwrap();
        }
        let journal = Journal::open(&path).unwrap();
        journal
            .write_record(&Record::new(Event::Deployed, "c1", Some("ok".to_string())))
            .unwrap();

        let records = Journal::read_all(&path).unwrap();
        let events: Vec<Event> = records.iter().map(|r| r.event).collect();
        assert_eq!(events, vec![Event::RunStart, Event::Deployed]);
        assert_eq!(records[0].comment, None);
        assert_eq!(records[1].comment.as_deref(), Some("ok"));
    }

    #[test]
    fn bad_lines_do_not_hide_good_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        let journal = Journal::open(&path).unwrap();
        journal
            .write_record(&Record::new(Event::RunStart, "c1", None))
            .unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"garbage\n2025-01-01T00:0\xff\n").unwrap();
        }
        journal
            .write_record(&Record::new(Event::Deployed, "c1", None))
            .unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"2025-01-01T00:00:00.0\tdepl").unwrap();
        }

        let records = Journal::read_all(&path).unwrap();
        let events: Vec<Event> = records.iter().map(|r| r.event).collect();
        assert_eq!(events, vec![Event::RunStart, Event::Deployed]);
    }
}
