//! Display command handles and queue items.
//!
//! A [`ReplayCommand`] is a borrowed view of a command owned by the
//! [`CommandSource`](crate::CommandSource): the payload is shared, and the
//! source keeps its own reference until the command is released.

use std::fmt;
use std::sync::Arc;

/// Identifier of a delivered command, unique within one source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u64);

impl CommandId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// QXL command type carried by a recorded event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Nop,
    Draw,
    Update,
    Cursor,
    Message,
    Surface,
    Unknown(u32),
}

impl CommandKind {
    /// Map the numeric type found in a recording.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Nop,
            1 => Self::Draw,
            2 => Self::Update,
            3 => Self::Cursor,
            4 => Self::Message,
            5 => Self::Surface,
            other => Self::Unknown(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Draw => "draw",
            Self::Update => "update",
            Self::Cursor => "cursor",
            Self::Message => "message",
            Self::Surface => "surface",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "unknown({raw})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A display command handed to the protocol server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayCommand {
    /// Identifier used to release the command back to its source.
    pub id: CommandId,
    pub kind: CommandKind,
    /// Memory slot group the command's addresses live in.
    pub group_id: u32,
    pub flags: u32,
    /// Timestamp recorded with the event (microseconds).
    pub timestamp: u64,
    /// Raw command body as stored in the recording.
    pub payload: Arc<[u8]>,
}

impl ReplayCommand {
    pub fn new(id: CommandId, kind: CommandKind, payload: Arc<[u8]>) -> Self {
        Self {
            id,
            kind,
            group_id: 0,
            flags: 0,
            timestamp: 0,
            payload,
        }
    }

    /// Set the recording timestamp.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// An entry in the [`ReplayQueue`](crate::ReplayQueue).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueItem {
    Command(ReplayCommand),
    /// The source is exhausted; nothing follows.
    EndOfStream,
}

impl QueueItem {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}
