//! Chat command decoding.
//!
//! Command bodies are JSON objects keyed by `cmd`. Only `DANMU_MSG` is decoded into
//! a typed struct; everything else is handed on untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DanmakuError, Result};

/// Command name of a chat message.
pub const DANMU_MSG: &str = "DANMU_MSG";

/// A decoded command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatCommand {
    /// `DANMU_MSG`
    Danmaku(DanmakuEvent),
    /// Any other command, kept as the server sent it.
    Other { command: String, payload: Value },
}

impl ChatCommand {
    /// The command name as sent by the server.
    pub fn command(&self) -> &str {
        match self {
            Self::Danmaku(_) => DANMU_MSG,
            Self::Other { command, .. } => command,
        }
    }
}

/// Fan medal shown next to a sender's name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Medal {
    pub name: String,
    pub level: u32,
    pub color: u32,
    /// Streamer the medal belongs to
    pub owner_name: String,
    pub owner_room_id: u64,
}

/// A single chat message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DanmakuEvent {
    pub text: String,
    pub sender_uid: u64,
    pub sender_name: String,
    pub timestamp_ms: u64,
    pub color: u32,
    pub font_size: u32,
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medal: Option<Medal>,
    pub user_level: u32,
    pub is_vip: bool,
    pub is_svip: bool,
    pub is_admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl DanmakuEvent {
    /// Build from the positional `info` array of a `DANMU_MSG`.
    ///
    /// Layout:
    ///
    /// | index | contents |
    /// |-------|----------|
    /// | `info[0][1..=4]` | mode, font size, color, timestamp (ms) |
    /// | `info[1]` | text |
    /// | `info[2][0..=4]` | uid, name, admin, vip, svip (flags are 1/0) |
    /// | `info[3]` | medal: level, name, owner name, owner room id, color |
    /// | `info[4][0]` | user level |
    /// | `info[5][0]` | title |
    ///
    /// Missing or short arrays never fail; the field keeps its zero value.
    pub fn from_info(info: &[Value]) -> Self {
        let meta = Positional(info.first());
        let user = Positional(info.get(2));
        let medal = Positional(info.get(3));
        let level = Positional(info.get(4));
        let title = Positional(info.get(5));

        Self {
            text: info.get(1).and_then(Value::as_str).unwrap_or_default().to_string(),
            sender_uid: user.u64(0),
            sender_name: user.string(1),
            timestamp_ms: meta.u64(4),
            color: meta.u32(3),
            font_size: meta.u32(2),
            mode: meta.u32(1),
            medal: (!medal.is_empty()).then(|| Medal {
                level: medal.u32(0),
                name: medal.string(1),
                owner_name: medal.string(2),
                owner_room_id: medal.u64(3),
                color: medal.u32(4),
            }),
            user_level: level.u32(0),
            is_admin: user.flag(2),
            is_vip: user.flag(3),
            is_svip: user.flag(4),
            title: Some(title.string(0)).filter(|t| !t.is_empty()),
        }
    }
}

/// Bounds-checked view over one nested array of `info`.
#[derive(Clone, Copy)]
struct Positional<'a>(Option<&'a Value>);

impl<'a> Positional<'a> {
    fn get(&self, index: usize) -> Option<&'a Value> {
        self.0.and_then(Value::as_array).and_then(|a| a.get(index))
    }

    fn is_empty(&self) -> bool {
        self.0
            .and_then(Value::as_array)
            .is_none_or(|a| a.is_empty())
    }

    fn u64(&self, index: usize) -> u64 {
        self.get(index)
            .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
            .unwrap_or_default()
    }

    fn u32(&self, index: usize) -> u32 {
        u32::try_from(self.u64(index)).unwrap_or_default()
    }

    fn string(&self, index: usize) -> String {
        self.get(index)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn flag(&self, index: usize) -> bool {
        self.u64(index) == 1
    }
}

/// Decode one JSON command body.
pub fn decode_command(body: &[u8]) -> Result<ChatCommand> {
    let json: Value = serde_json::from_slice(body)
        .map_err(|e| DanmakuError::malformed(format!("invalid JSON: {e}")))?;

    let command = json
        .get("cmd")
        .and_then(Value::as_str)
        .ok_or_else(|| DanmakuError::malformed("missing cmd field"))?;

    // Variants such as "DANMU_MSG:4:0:2:2:2:0" carry the same payload.
    let base = command.split(':').next().unwrap_or(command);

    if base == DANMU_MSG {
        let info = json
            .get("info")
            .and_then(Value::as_array)
            .ok_or_else(|| DanmakuError::malformed("DANMU_MSG without info array"))?;
        return Ok(ChatCommand::Danmaku(DanmakuEvent::from_info(info)));
    }

    Ok(ChatCommand::Other {
        command: command.to_string(),
        payload: json,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_info(info: Value) -> DanmakuEvent {
        let body = serde_json::to_vec(&json!({ "cmd": "DANMU_MSG", "info": info })).unwrap();
        match decode_command(&body).unwrap() {
            ChatCommand::Danmaku(event) => event,
            other => panic!("Unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_danmu_msg() {
        let event = decode_info(json!([
            [0, 1, 25, 16777215, 1690000000000_u64],
            "hello",
            [123, "alice", 0, 0, 0],
            [],
            [10]
        ]));

        assert_eq!(event.text, "hello");
        assert_eq!(event.sender_uid, 123);
        assert_eq!(event.sender_name, "alice");
        assert_eq!(event.mode, 1);
        assert_eq!(event.font_size, 25);
        assert_eq!(event.color, 16777215);
        assert_eq!(event.timestamp_ms, 1690000000000);
        assert_eq!(event.user_level, 10);
        assert!(!event.is_vip);
        assert!(!event.is_svip);
        assert!(!event.is_admin);
        assert_eq!(event.medal, None);
        assert_eq!(event.title, None);
    }

    #[test]
    fn test_parse_medal() {
        let event = decode_info(json!([
            [0, 1, 25, 16777215, 1690000000000_u64],
            "hi",
            [1, "bob", 1, 1, 0],
            [5, "Fan", "Streamer", 9999, 16711680],
            [3],
            ["title-1"]
        ]));

        assert_eq!(
            event.medal,
            Some(Medal {
                level: 5,
                name: "Fan".to_string(),
                owner_name: "Streamer".to_string(),
                owner_room_id: 9999,
                color: 16711680,
            })
        );
        assert!(event.is_admin);
        assert!(event.is_vip);
        assert!(!event.is_svip);
        assert_eq!(event.title.as_deref(), Some("title-1"));
    }

    #[test]
    fn test_short_arrays_default() {
        let event = decode_info(json!([[0], "only text"]));
        assert_eq!(
            event,
            DanmakuEvent {
                text: "only text".to_string(),
                ..Default::default()
            }
        );

        assert_eq!(decode_info(json!([])), DanmakuEvent::default());
    }

    #[test]
    fn test_wrong_types_default() {
        let event = decode_info(json!(["x", 42, {"uid": 1}, "medal", null]));
        assert_eq!(event, DanmakuEvent::default());
    }

    #[test]
    fn test_command_variant_suffix() {
        let body = br#"{"cmd":"DANMU_MSG:4:0:2:2:2:0","info":[[0,1,25,0,0],"x",[7,"u"]]}"#;
        match decode_command(body).unwrap() {
            ChatCommand::Danmaku(event) => {
                assert_eq!(event.text, "x");
                assert_eq!(event.sender_uid, 7);
            }
            other => panic!("Unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_other_command_passthrough() {
        let body = br#"{"cmd":"SEND_GIFT","data":{"giftName":"Rocket","num":5}}"#;
        let command = decode_command(body).unwrap();
        assert_eq!(command.command(), "SEND_GIFT");
        match command {
            ChatCommand::Other { payload, .. } => {
                assert_eq!(payload["data"]["giftName"], "Rocket");
            }
            other => panic!("Unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            decode_command(b"not json"),
            Err(DanmakuError::MalformedPayload(_))
        ));
        assert!(matches!(
            decode_command(br#"{"data":1}"#),
            Err(DanmakuError::MalformedPayload(_))
        ));
        assert!(matches!(
            decode_command(br#"{"cmd":"DANMU_MSG"}"#),
            Err(DanmakuError::MalformedPayload(_))
        ));
    }
}
