use serde::{Deserialize, Serialize};

/// What the coordinator tells the group at the start of every iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Announcement {
    /// The next data broadcast carries `len` bytes (never 0)
    Chunk { len: u64 },
    /// End of stream, the zero-length sentinel
    Done,
}

impl Announcement {
    /// Builds the announcement for a freshly filled chunk, an empty chunk is the sentinel.
    pub fn from_len(len: usize) -> Self {
        if len == 0 {
            Announcement::Done
        } else {
            Announcement::Chunk { len: len as u64 }
        }
    }

    /// Announced chunk length, 0 for the sentinel
    pub fn chunk_len(&self) -> u64 {
        match self {
            Announcement::Chunk { len } => *len,
            Announcement::Done => 0,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Announcement::Done)
    }
}

/// Coordinator -> member messages
#[derive(Debug, Deserialize, Serialize)]
pub enum Directive {
    Announce(Announcement),
    // implies `len` raw bytes follow immediately after this message
    Data { len: u64 },
    Reduced { max: f64 },
    /// The group is going down, `rank` is the member whose failure caused it
    Abort { rank: usize, reason: String },
}

/// First message on every member connection
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Hello {
    pub rank: usize,
    pub world_size: usize,
    pub version: common::version::ProtocolVersion,
}

/// Member -> coordinator messages
#[derive(Debug, Deserialize, Serialize)]
pub enum Report {
    Hello(Hello),
    Ack,
    Value(f64),
    Fault { reason: String },
}
