//! Danmaku: Bilibili live chat protocol engine.
//!
//! This crate speaks the binary protocol of the Bilibili live chat socket and keeps
//! a room session alive across disconnects.
//!
//! ## Protocol
//!
//! - [`packet`] - 16-byte big-endian frame header, [`encode`] / [`split_frames`]
//! - [`compression`] - zlib / brotli bodies, flattened by [`Unpacker`]
//! - [`message`] - JSON commands, [`DanmakuEvent`] for `DANMU_MSG`
//!
//! ## Session
//!
//! - [`Lifecycle`] - pure connection state machine with the reconnect rules
//! - [`LiveClient`] - async driver: socket task, heartbeat, reconnect delay
//! - [`LiveRoomApi`] / [`BilibiliApi`] - HTTP collaborator (room info, token, web heartbeat)
//! - [`Connector`] / [`WsConnector`] - socket abstraction over `tokio-tungstenite`
//!
//! ## Events
//!
//! - [`RoomChatEvent`] - every decoded command, passed to the chat callback
//! - [`RoomStatus`] - live / reconnecting / left / failed, via [`LiveClient::subscribe`]

pub mod api;
pub mod client;
pub mod compression;
pub mod config;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod message;
pub mod packet;
pub mod transport;
mod wbi;

pub use api::{BilibiliApi, DanmuInfo, DanmuServer, LiveRoomApi, RoomInfo};
pub use client::{ChatHandler, LiveClient};
pub use compression::{Packet, Unpacker};
pub use config::{LiveConfig, ReconnectPolicy};
pub use error::{DanmakuError, FrameError, Result};
pub use event::{FailureReason, RoomChatEvent, RoomSnapshot, RoomStatus};
pub use lifecycle::{ConnectionState, Effect, Lifecycle, LifecycleEvent, RoomSession};
pub use message::{ChatCommand, DanmakuEvent, Medal, decode_command};
pub use packet::{FrameHeader, Operation, ProtocolVersion, encode, parse_header, split_frames};
pub use transport::{Connector, Socket, WsConnector};
