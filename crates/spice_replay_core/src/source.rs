//! Command sources.
//!
//! A [`CommandSource`] decodes a recording into display commands on demand
//! and owns every command it hands out until that command is released.
//!
//! [`RecordFileSource`] reads text-mode SPICE recordings:
//!
//! ```text
//! SPICE_REPLAY 1
//! binary 0
//! event 0 0 1 1234567
//! <command body lines>
//! event 1 0 2 1234890
//! ...
//! ```
//!
//! The body of an event is every line up to the next `event` header. Bodies
//! are kept opaque; decoding QXL structures is up to the consumer.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::command::{CommandId, CommandKind, ReplayCommand};
use crate::error::{ReplayError, Result};

/// Surface capacity used for every replay.
pub const MAX_SURFACES: u32 = 1024;

/// Recording format version this source understands.
pub const RECORDING_VERSION: u32 = 1;

/// `what` value of an event carrying a display (QXL) command.
const DISPLAY_EVENT: u32 = 0;

/// Produces display commands from a recording.
pub trait CommandSource: Send {
    /// Decode the next display command.
    ///
    /// `Ok(None)` means the recording is exhausted. Callers treat errors the
    /// same way; a recording is never retried.
    fn next_command(&mut self) -> Result<Option<ReplayCommand>>;

    /// Take back a delivered command. Returns `false` if `id` is not
    /// outstanding (already released, or never delivered).
    fn release_command(&mut self, id: CommandId) -> bool;

    /// Release everything and stop producing commands.
    fn close(&mut self);

    /// Surface capacity the recording was opened with.
    fn max_surfaces(&self) -> u32;
}

#[derive(Debug, Clone, Copy)]
struct EventHeader {
    counter: u64,
    what: u32,
    kind: u32,
    timestamp: u64,
}

/// Text-mode SPICE recording reader.
pub struct RecordFileSource<R = BufReader<File>> {
    reader: R,
    /// Line number of the last line read (1-based).
    line_no: usize,
    /// An `event` header line already read, with its line number.
    pending: Option<(Vec<u8>, usize)>,
    exhausted: bool,
    closed: bool,
    next_id: u64,
    outstanding: FxHashMap<CommandId, Arc<[u8]>>,
    max_surfaces: u32,
    version: u32,
}

impl RecordFileSource {
    /// Open a recording file.
    pub fn open(path: impl AsRef<Path>, max_surfaces: u32) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ReplayError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(BufReader::new(file), max_surfaces)
    }
}

impl<R: BufRead> RecordFileSource<R> {
    /// Read a recording from any buffered reader. The header is checked
    /// eagerly.
    pub fn from_reader(reader: R, max_surfaces: u32) -> Result<Self> {
        let mut source = Self {
            reader,
            line_no: 0,
            pending: None,
            exhausted: false,
            closed: false,
            next_id: 0,
            outstanding: FxHashMap::default(),
            max_surfaces,
            version: 0,
        };
        source.read_preamble()?;
        Ok(source)
    }

    /// Format version from the header.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Number of delivered commands not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let read = self
            .reader
            .read_until(b'\n', &mut line)
            .map_err(|e| ReplayError::Decode {
                line: self.line_no + 1,
                reason: e.to_string(),
            })?;
        if read == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        Ok(Some(line))
    }

    fn read_preamble(&mut self) -> Result<()> {
        let header = loop {
            match self.read_line()? {
                Some(line) if is_blank(&line) => continue,
                Some(line) => break line,
                None => {
                    return Err(ReplayError::UnsupportedRecording(
                        "empty recording".to_string(),
                    ))
                }
            }
        };

        let text = String::from_utf8_lossy(&header);
        let mut fields = text.split_ascii_whitespace();
        if fields.next() != Some("SPICE_REPLAY") {
            return Err(ReplayError::UnsupportedRecording(format!(
                "missing SPICE_REPLAY header (found {:?})",
                text.trim_end()
            )));
        }
        self.version = fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ReplayError::Decode {
                line: self.line_no,
                reason: "header has no version".to_string(),
            })?;
        if self.version != RECORDING_VERSION {
            return Err(ReplayError::UnsupportedRecording(format!(
                "version {} (expected {RECORDING_VERSION})",
                self.version
            )));
        }

        while let Some(line) = self.read_line()? {
            if is_blank(&line) {
                continue;
            }
            if line.starts_with(b"binary ") {
                let text = String::from_utf8_lossy(&line);
                match text.split_ascii_whitespace().nth(1) {
                    Some("0") => continue,
                    Some("1") => {
                        return Err(ReplayError::UnsupportedRecording(
                            "binary recordings need the native decoder".to_string(),
                        ))
                    }
                    _ => {
                        return Err(ReplayError::Decode {
                            line: self.line_no,
                            reason: format!("bad binary flag {:?}", text.trim_end()),
                        })
                    }
                }
            }
            if is_event(&line) {
                self.pending = Some((line, self.line_no));
                return Ok(());
            }
            return Err(ReplayError::Decode {
                line: self.line_no,
                reason: "data before the first event".to_string(),
            });
        }

        self.exhausted = true;
        Ok(())
    }

    /// Read the next event header and its body.
    fn next_event(&mut self) -> Result<Option<(EventHeader, Vec<u8>)>> {
        let (raw, line) = match self.pending.take() {
            Some(pending) => pending,
            None => loop {
                if self.exhausted {
                    return Ok(None);
                }
                match self.read_line()? {
                    Some(line) if is_blank(&line) => continue,
                    Some(line) if is_event(&line) => break (line, self.line_no),
                    Some(_) => {
                        return Err(ReplayError::Decode {
                            line: self.line_no,
                            reason: "data outside an event".to_string(),
                        })
                    }
                    None => {
                        self.exhausted = true;
                        return Ok(None);
                    }
                }
            },
        };
        let header = parse_event_header(&raw, line)?;

        let mut body = Vec::new();
        loop {
            match self.read_line()? {
                Some(next) if is_event(&next) => {
                    self.pending = Some((next, self.line_no));
                    break;
                }
                Some(next) => body.extend_from_slice(&next),
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }
        Ok(Some((header, body)))
    }
}

impl<R: BufRead + Send> CommandSource for RecordFileSource<R> {
    fn next_command(&mut self) -> Result<Option<ReplayCommand>> {
        if self.closed {
            return Ok(None);
        }
        while let Some((header, body)) = self.next_event()? {
            if header.what != DISPLAY_EVENT {
                debug!(
                    counter = header.counter,
                    what = header.what,
                    "skipping non-display event"
                );
                continue;
            }

            let id = CommandId::new(self.next_id);
            self.next_id += 1;
            let payload: Arc<[u8]> = Arc::from(body);
            self.outstanding.insert(id, payload.clone());

            let command = ReplayCommand::new(id, CommandKind::from_raw(header.kind), payload)
                .with_timestamp(header.timestamp);
            trace!(%id, kind = %command.kind, counter = header.counter, "decoded command");
            return Ok(Some(command));
        }
        Ok(None)
    }

    fn release_command(&mut self, id: CommandId) -> bool {
        if self.outstanding.remove(&id).is_some() {
            trace!(%id, "released command");
            true
        } else {
            warn!(%id, "release of a command that is not outstanding");
            false
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        if !self.outstanding.is_empty() {
            debug!(
                outstanding = self.outstanding.len(),
                "closing recording with unreleased commands"
            );
        }
        self.outstanding.clear();
        self.closed = true;
    }

    fn max_surfaces(&self) -> u32 {
        self.max_surfaces
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

fn is_event(line: &[u8]) -> bool {
    line.starts_with(b"event ")
}

fn parse_event_header(raw: &[u8], line: usize) -> Result<EventHeader> {
    let malformed = |reason: &str| ReplayError::Decode {
        line,
        reason: reason.to_string(),
    };

    let text = std::str::from_utf8(raw).map_err(|_| malformed("event header is not UTF-8"))?;
    let fields: Vec<&str> = text.split_ascii_whitespace().skip(1).collect();
    if fields.len() != 4 {
        return Err(malformed("event header needs counter, what, type and timestamp"));
    }

    Ok(EventHeader {
        counter: fields[0].parse().map_err(|_| malformed("bad event counter"))?,
        what: fields[1].parse().map_err(|_| malformed("bad event kind"))?,
        kind: fields[2].parse().map_err(|_| malformed("bad command type"))?,
        timestamp: fields[3].parse().map_err(|_| malformed("bad timestamp"))?,
    })
}
