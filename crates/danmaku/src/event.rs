//! Events delivered to the application.
//!
//! [`RoomChatEvent`] carries decoded commands to the chat callback. [`RoomStatus`]
//! reports connection-level changes (live, reconnecting, left, failed) over a
//! broadcast channel, since some of them happen long after `enter_room` returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::RoomInfo;
use crate::message::{ChatCommand, DanmakuEvent};

/// Room metadata captured when the room was entered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub title: String,
    pub owner_name: String,
    pub owner_face: String,
    pub area_name: String,
    pub online: u64,
}

impl From<&RoomInfo> for RoomSnapshot {
    fn from(info: &RoomInfo) -> Self {
        Self {
            title: info.title.clone(),
            owner_name: info.owner_name.clone(),
            owner_face: info.owner_face.clone(),
            area_name: info.area_name.clone(),
            online: info.online,
        }
    }
}

/// A decoded command together with the room it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomChatEvent {
    pub room_id: u64,
    pub room: RoomSnapshot,
    pub command: ChatCommand,
    pub received_at: DateTime<Utc>,
}

impl RoomChatEvent {
    /// The chat message, if this event is one.
    pub fn danmaku(&self) -> Option<&DanmakuEvent> {
        match &self.command {
            ChatCommand::Danmaku(event) => Some(event),
            ChatCommand::Other { .. } => None,
        }
    }
}

/// Why a room session ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureReason {
    /// The server answered the handshake with a non-zero code.
    AuthRejected { code: i64 },
    /// The socket kept closing and the reconnect budget ran out.
    ReconnectExhausted { attempts: u32 },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthRejected { code } => write!(f, "authentication rejected (code {code})"),
            Self::ReconnectExhausted { attempts } => {
                write!(f, "gave up after {attempts} reconnect attempts")
            }
        }
    }
}

/// Connection-level notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoomStatus {
    /// Handshake accepted, chat is flowing.
    Live { room_id: u64 },
    /// The socket closed and a reconnect is scheduled.
    Reconnecting {
        room_id: u64,
        attempt: u32,
        max_attempts: u32,
    },
    /// The room was left on request.
    Left { room_id: u64 },
    /// The session ended and will not be retried.
    Failed { room_id: u64, reason: FailureReason },
}
