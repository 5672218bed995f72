//! Task source: turns a CSV stream of query parameters into [`Task`] values.
//!
//! The first record must be the header `hostname,start_time,end_time`. Every
//! following record is either a well-formed task or a [`RecordError`]; a bad
//! record never stops the stream.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Timestamp layout of the start and end columns.
pub const DATE_TIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

/// Header every input must begin with.
pub const EXPECTED_HEADER: &str = "hostname,start_time,end_time";

const FIELD_COUNT: usize = 3;

/// One query to execute: a host and the time range to aggregate over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub host: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Errors that prevent the source from producing anything at all.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("could not read header: input is empty")]
    Empty,

    #[error("could not read header: {0}")]
    Read(#[from] csv::Error),

    #[error("invalid header, expected: hostname,start_time,end_time but given: {found}")]
    InvalidHeader { found: String },
}

/// A single malformed record. Carries the input line it started on.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record on line {line}: {source}")]
    Malformed { line: u64, source: csv::Error },

    #[error("record on line {line}: invalid line length {found}, must be equal to 3")]
    FieldCount { line: u64, found: usize },

    #[error("record on line {line}: empty host name")]
    EmptyHost { line: u64 },

    #[error("record on line {line}: bare \" in field {field}")]
    StrayQuote { line: u64, field: usize },

    #[error("record on line {line}: invalid {column} value {value:?}: {source}")]
    InvalidTimestamp {
        line: u64,
        column: &'static str,
        value: String,
        source: chrono::ParseError,
    },
}

impl RecordError {
    pub fn line(&self) -> u64 {
        match self {
            RecordError::Malformed { line, .. }
            | RecordError::FieldCount { line, .. }
            | RecordError::EmptyHost { line }
            | RecordError::StrayQuote { line, .. }
            | RecordError::InvalidTimestamp { line, .. } => *line,
        }
    }
}

/// Iterator over the records of a CSV input, after header validation.
pub struct TaskSource<R: Read> {
    reader: csv::Reader<R>,
    record: csv::StringRecord,
    done: bool,
}

impl<R: Read> TaskSource<R> {
    /// Wrap a reader and validate its header line.
    pub fn new(input: R) -> Result<Self, SourceError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(input);

        let mut header = csv::StringRecord::new();
        if !reader.read_record(&mut header)? {
            return Err(SourceError::Empty);
        }

        let found = header.iter().collect::<Vec<_>>().join(",");
        if found != EXPECTED_HEADER {
            return Err(SourceError::InvalidHeader { found });
        }

        Ok(Self {
            reader,
            record: csv::StringRecord::new(),
            done: false,
        })
    }
}

impl<R: Read> Iterator for TaskSource<R> {
    type Item = Result<Task, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let line = self.reader.position().line();
        match self.reader.read_record(&mut self.record) {
            Ok(false) => {
                self.done = true;
                None
            }
            Ok(true) => Some(parse_record(&self.record, line)),
            Err(source) => {
                // An I/O failure will repeat forever; report it once and stop.
                if source.is_io_error() {
                    self.done = true;
                }
                Some(Err(RecordError::Malformed { line, source }))
            }
        }
    }
}

fn parse_record(record: &csv::StringRecord, line: u64) -> Result<Task, RecordError> {
    // The reader keeps a quote inside an unquoted field as a literal; treat
    // it as malformed. Properly quoted fields arrive here unquoted.
    if let Some(field) = record.iter().position(|f| f.contains('"')) {
        return Err(RecordError::StrayQuote {
            line,
            field: field + 1,
        });
    }

    if record.len() != FIELD_COUNT {
        return Err(RecordError::FieldCount {
            line,
            found: record.len(),
        });
    }

    let host = &record[0];
    if host.is_empty() {
        return Err(RecordError::EmptyHost { line });
    }

    let start = parse_timestamp(&record[1], "start time", line)?;
    let end = parse_timestamp(&record[2], "end time", line)?;

    Ok(Task {
        host: host.to_string(),
        start,
        end,
    })
}

fn parse_timestamp(
    value: &str,
    column: &'static str,
    line: u64,
) -> Result<DateTime<Utc>, RecordError> {
    NaiveDateTime::parse_from_str(value, DATE_TIME_LAYOUT)
        .map(|t| t.and_utc())
        .map_err(|source| RecordError::InvalidTimestamp {
            line,
            column,
            value: value.to_string(),
            source,
        })
}

/// Open the CSV input: the named file, or stdin when no path is given.
pub fn open_input(path: Option<&Path>) -> Result<Box<dyn Read + Send>> {
    match path {
        None => Ok(Box::new(io::stdin())),
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("could not open csv file {}", path.display()))?;
            Ok(Box::new(file))
        }
    }
}
