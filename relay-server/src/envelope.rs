//! Wire frames exchanged with clients and routed between nodes.
//!
//! Frames are JSON text. Field names are PascalCase on the wire:
//!
//! ```json
//! {"Id":7}
//! {"Data":"hi","Target":0,"Type":"group"}
//! {"Data":"hi","Target":0,"Type":"group","FormId":1}
//! ```

use serde::{Deserialize, Serialize};

use crate::UserId;

/// Sender ID stamped on frames the relay generates itself.
pub const SYSTEM_SENDER: UserId = -1;

/// Notice returned to a `once` sender whose target has no presence record.
pub const OFFLINE_NOTICE: &str = "当前用户不在线";

/// Raw-text reply to a frame that is not a valid client frame.
pub const MALFORMED_FRAME: &str = "message resolution failed";

/// Raw-text reply to a frame with an unknown `Type`.
pub const ILLEGAL_TYPE: &str = "illegal message type";

/// Raw-text reply when a message could not be handed to the broker.
pub const PUSH_FAILED: &str = "message push failed";

/// First frame sent to a client after the upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Greeting {
    pub id: UserId,
}

/// Frame sent by a client. Missing fields take their zero value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClientFrame {
    pub data: String,
    pub target: UserId,
    #[serde(rename = "Type")]
    pub kind: String,
}

/// Routed message unit: what the broker carries and clients receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub target: UserId,
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(default = "system_sender")]
    pub form_id: UserId,
}

fn system_sender() -> UserId {
    SYSTEM_SENDER
}

/// Routing classes understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Every connection on every live node.
    Group,
    /// The single connection holding `Target`.
    Once,
}

impl Kind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "group" => Some(Self::Group),
            "once" => Some(Self::Once),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Once => "once",
        }
    }
}

impl Envelope {
    /// Stamp a client frame with its sender's identity.
    pub fn from_client(frame: ClientFrame, sender: UserId) -> Self {
        Self {
            data: frame.data,
            target: frame.target,
            kind: frame.kind,
            form_id: sender,
        }
    }

    /// Notice telling `sender` that its `once` target is not online.
    pub fn offline_notice(sender: UserId) -> Self {
        Self {
            data: OFFLINE_NOTICE.to_string(),
            target: sender,
            kind: Kind::Once.as_str().to_string(),
            form_id: SYSTEM_SENDER,
        }
    }

    pub fn kind(&self) -> Option<Kind> {
        Kind::parse(&self.kind)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Greeting {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
