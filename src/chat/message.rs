//! Wire types for the client protocol and the replication stream.
//!
//! Everything after the username handshake is one JSON object per line.
//! Clients send [`ClientFrame`]s, instances answer with [`Reply`]s, and every
//! routed message is copied to the sink as a [`ReplicationRecord`].

use serde::{Deserialize, Serialize};

/// The `type` of a client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Private,
    Group,
    Join,
}

/// A frame sent by a client after the handshake.
///
/// `{"type": "private", "target": "bob", "message": "hi"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub message: String,
}

impl ClientFrame {
    pub fn private(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Private,
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn group(group: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Group,
            target: group.into(),
            message: message.into(),
        }
    }

    /// The bridge names the group in `message`; `target` is accepted too.
    pub fn join(group: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Join,
            target: String::new(),
            message: group.into(),
        }
    }

    /// Serialize to a JSON line (JSON + `\n`).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

/// Acknowledgement status returned to the sender of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Delivered,
    Offline,
    GroupSent,
}

/// Anything an instance (or the dispatcher) writes back to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    /// `{"ack": "delivered"}`
    Ack { ack: AckStatus },
    /// `{"info": "joined <group>"}`
    Info { info: String },
    /// A message routed to this client.
    Delivery {
        from: String,
        message: String,
        clock: u64,
    },
    /// Failure signal written right before the connection is closed.
    Error { error: String },
}

impl Reply {
    pub fn ack(status: AckStatus) -> Self {
        Self::Ack { ack: status }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::Info { info: text.into() }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            error: reason.into(),
        }
    }

    /// Serialize to a JSON line (JSON + `\n`).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line (strips trailing newline/whitespace).
    pub fn from_line(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim_end())
    }
}

/// A routed message, stamped once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub kind: FrameKind,
    pub sender: String,
    /// Username for `private`, group name for `group` and `join`.
    pub target: String,
    pub text: String,
    /// Lamport timestamp from the instance clock.
    pub lamport: u64,
    /// Unix seconds at the instance when the frame was processed.
    pub wallclock: i64,
}

impl ChatMessage {
    /// Stamp a client frame from `sender`.
    pub fn from_frame(sender: &str, frame: ClientFrame, lamport: u64, wallclock: i64) -> Self {
        let target = match frame.kind {
            FrameKind::Join if !frame.message.is_empty() => frame.message.clone(),
            _ => frame.target,
        };
        Self {
            kind: frame.kind,
            sender: sender.to_owned(),
            target,
            text: frame.message,
            lamport,
            wallclock,
        }
    }

    /// The frame delivered to the recipient of a private message.
    pub fn delivery(&self) -> Reply {
        Reply::Delivery {
            from: self.sender.clone(),
            message: self.text.clone(),
            clock: self.lamport,
        }
    }

    /// The copy sent to the replication sink. Joins are not replicated.
    pub fn replication_record(&self) -> Option<ReplicationRecord> {
        let (kind, to, group) = match self.kind {
            FrameKind::Private => (RecordKind::Private, Some(self.target.clone()), None),
            FrameKind::Group => (RecordKind::Group, None, Some(self.target.clone())),
            FrameKind::Join => return None,
        };
        Some(ReplicationRecord {
            kind,
            from: self.sender.clone(),
            to,
            group,
            message: self.text.clone(),
            clock: self.lamport,
            ts: self.wallclock,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Private,
    Group,
}

/// One replicated message, as written to the sink.
///
/// Private records carry `to`, group records carry `group`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRecord {
    pub kind: RecordKind,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub message: String,
    pub clock: u64,
    pub ts: i64,
}

impl ReplicationRecord {
    /// Serialize to a JSON line (JSON + `\n`).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}
