//! HTTP side of a live room session.
//!
//! The socket needs a token and a host before it can open, and the server expects a
//! web heartbeat alongside the socket one. [`LiveRoomApi`] is the seam the client is
//! built on; [`BilibiliApi`] talks to the real endpoints.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::{DanmakuError, Result};
use crate::transport::install_rustls_provider;
use crate::wbi::WbiSigner;

pub const DEFAULT_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

const ROOM_INFO_URL: &str = "https://api.live.bilibili.com/xlive/web-room/v1/index/getInfoByRoom";
const DANMU_INFO_URL: &str = "https://api.live.bilibili.com/xlive/web-room/v1/index/getDanmuInfo";
const ROOM_ENTRY_URL: &str =
    "https://api.live.bilibili.com/xlive/web-room/v1/index/roomEntryAction";
const WEB_HEARTBEAT_URL: &str =
    "https://live-trace.bilibili.com/xlive/rdata-interface/v1/heartbeat/webHeartBeat";

/// Room metadata returned by `getInfoByRoom`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomInfo {
    /// Real room id (short ids resolve to this)
    pub room_id: u64,
    pub short_id: u64,
    /// Streamer uid
    pub uid: u64,
    pub title: String,
    pub area_name: String,
    pub parent_area_name: String,
    pub online: u64,
    /// 0 offline, 1 live, 2 rotating replays
    pub live_status: u8,
    pub owner_name: String,
    pub owner_face: String,
}

/// One chat server from `host_list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DanmuServer {
    pub host: String,
    pub port: u16,
    pub wss_port: u16,
    pub ws_port: u16,
}

impl DanmuServer {
    pub fn wss_url(&self) -> String {
        format!("wss://{}:{}/sub", self.host, self.wss_port)
    }
}

/// Socket credentials returned by `getDanmuInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DanmuInfo {
    pub token: String,
    pub host_list: Vec<DanmuServer>,
}

impl DanmuInfo {
    /// URL of the first listed server.
    ///
    /// Fails when the token or the host list is empty, since neither can open a session.
    pub fn server_url(&self) -> Result<String> {
        if self.token.is_empty() {
            return Err(DanmakuError::api("getDanmuInfo returned an empty token"));
        }
        self.host_list
            .first()
            .filter(|server| !server.host.is_empty())
            .map(DanmuServer::wss_url)
            .ok_or_else(|| DanmakuError::api("getDanmuInfo returned no usable host"))
    }
}

/// HTTP collaborator of [`LiveClient`](crate::LiveClient).
#[async_trait]
pub trait LiveRoomApi: Send + Sync + 'static {
    /// Room metadata. Failure aborts entering the room.
    async fn room_info(&self, room_id: u64) -> Result<RoomInfo>;

    /// Token and server list for the chat socket. Failure aborts entering the room.
    async fn danmu_info(&self, room_id: u64) -> Result<DanmuInfo>;

    /// Report the room entry. Callers treat failure as non-fatal.
    async fn report_entry(&self, _room_id: u64) -> Result<()> {
        Ok(())
    }

    /// Web heartbeat sent next to every socket heartbeat.
    async fn heartbeat(&self, room_id: u64) -> Result<()>;

    /// User id sent in the handshake, `0` for anonymous sessions.
    fn uid(&self) -> u64 {
        0
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn check(&self, endpoint: &str) -> Result<()> {
        if self.code != 0 {
            return Err(DanmakuError::api(format!(
                "{endpoint} returned code {}: {}",
                self.code, self.message
            )));
        }
        Ok(())
    }

    fn into_data(self, endpoint: &str) -> Result<T> {
        self.check(endpoint)?;
        self.data
            .ok_or_else(|| DanmakuError::api(format!("{endpoint} returned no data")))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRoomInfo {
    room_id: u64,
    short_id: u64,
    uid: u64,
    title: String,
    area_name: String,
    parent_area_name: String,
    online: u64,
    live_status: u8,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawBaseInfo {
    uname: String,
    face: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAnchorInfo {
    base_info: RawBaseInfo,
}

#[derive(Debug, Deserialize)]
struct RoomInfoData {
    room_info: RawRoomInfo,
    #[serde(default)]
    anchor_info: RawAnchorInfo,
}

impl From<RoomInfoData> for RoomInfo {
    fn from(data: RoomInfoData) -> Self {
        let RoomInfoData {
            room_info: room,
            anchor_info,
        } = data;
        Self {
            room_id: room.room_id,
            short_id: room.short_id,
            uid: room.uid,
            title: room.title,
            area_name: room.area_name,
            parent_area_name: room.parent_area_name,
            online: room.online,
            live_status: room.live_status,
            owner_name: anchor_info.base_info.uname,
            owner_face: anchor_info.base_info.face,
        }
    }
}

/// Extract a cookie value from a `Cookie` header string.
pub fn extract_cookie_value(cookies: &str, name: &str) -> Option<String> {
    cookies.split(';').find_map(|cookie| {
        let (key, value) = cookie.trim().split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_string())
    })
}

/// `hb` parameter of the web heartbeat.
pub fn heartbeat_payload(room_id: u64) -> String {
    STANDARD.encode(format!("60|{room_id}|1|0"))
}

/// [`LiveRoomApi`] backed by the Bilibili web endpoints.
pub struct BilibiliApi {
    client: Client,
    cookies: Option<String>,
    uid: u64,
    wbi: WbiSigner,
}

impl BilibiliApi {
    /// Anonymous client with the given per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        install_rustls_provider();
        let client = Client::builder()
            .user_agent(DEFAULT_UA)
            .timeout(timeout)
            .build()?;
        Ok(Self::with_client(client))
    }

    /// Wrap an existing client.
    ///
    /// The client must be built after a rustls provider is installed, e.g. through
    /// [`install_rustls_provider`].
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            cookies: None,
            uid: 0,
            wbi: WbiSigner::new(),
        }
    }

    /// Attach login cookies.
    ///
    /// The handshake uid is only taken from `DedeUserID` when `SESSDATA` is present too;
    /// a uid without a matching session gets the socket reset by the server.
    pub fn with_cookies(mut self, cookies: impl Into<String>) -> Self {
        let cookies = cookies.into();
        let cookies = cookies.trim();
        if cookies.is_empty() {
            return self;
        }
        self.uid = extract_cookie_value(cookies, "SESSDATA")
            .and_then(|_| extract_cookie_value(cookies, "DedeUserID"))
            .and_then(|uid| uid.parse().ok())
            .unwrap_or(0);
        self.cookies = Some(cookies.to_string());
        self
    }

    fn request(&self, method: Method, url: &str, room_id: u64) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, url)
            .header(reqwest::header::USER_AGENT, DEFAULT_UA)
            .header(
                reqwest::header::REFERER,
                format!("https://live.bilibili.com/{room_id}"),
            )
            .header(reqwest::header::ORIGIN, "https://live.bilibili.com");
        if let Some(cookies) = &self.cookies {
            req = req.header(reqwest::header::COOKIE, cookies);
        }
        req
    }
}

#[async_trait]
impl LiveRoomApi for BilibiliApi {
    async fn room_info(&self, room_id: u64) -> Result<RoomInfo> {
        let envelope: Envelope<RoomInfoData> = self
            .request(Method::GET, ROOM_INFO_URL, room_id)
            .query(&[("room_id", room_id)])
            .send()
            .await?
            .json()
            .await?;
        let info = RoomInfo::from(envelope.into_data("getInfoByRoom")?);
        debug!(room_id, real_room_id = info.room_id, title = %info.title, "Fetched room info");
        Ok(info)
    }

    async fn danmu_info(&self, room_id: u64) -> Result<DanmuInfo> {
        let params = vec![
            ("id", room_id.to_string()),
            ("type", "0".to_string()),
            ("web_location", "444.8".to_string()),
        ];
        let query = self.wbi.sign(&self.client, DEFAULT_UA, params).await?;
        let url = format!("{DANMU_INFO_URL}?{query}");

        let envelope: Envelope<DanmuInfo> = self
            .request(Method::GET, &url, room_id)
            .send()
            .await?
            .json()
            .await?;
        let info = envelope.into_data("getDanmuInfo")?;
        debug!(room_id, hosts = info.host_list.len(), "Fetched danmu info");
        Ok(info)
    }

    async fn report_entry(&self, room_id: u64) -> Result<()> {
        let csrf = self
            .cookies
            .as_deref()
            .and_then(|c| extract_cookie_value(c, "bili_jct"))
            .ok_or_else(|| DanmakuError::api("roomEntryAction needs the bili_jct cookie"))?;

        let envelope: Envelope<Value> = self
            .request(Method::POST, ROOM_ENTRY_URL, room_id)
            .query(&[("csrf", csrf.as_str())])
            .json(&serde_json::json!({ "room_id": room_id, "platform": "pc" }))
            .send()
            .await?
            .json()
            .await?;
        envelope.check("roomEntryAction")
    }

    async fn heartbeat(&self, room_id: u64) -> Result<()> {
        let hb = heartbeat_payload(room_id);
        let envelope: Envelope<Value> = self
            .request(Method::GET, WEB_HEARTBEAT_URL, room_id)
            .query(&[("hb", hb.as_str()), ("pf", "web")])
            .send()
            .await?
            .json()
            .await?;
        envelope.check("webHeartBeat")
    }

    fn uid(&self) -> u64 {
        self.uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_payload() {
        assert_eq!(heartbeat_payload(12345), "NjB8MTIzNDV8MXww");
    }

    #[test]
    fn test_cookie_uid_requires_session() {
        let anonymous = || BilibiliApi::new(Duration::from_secs(1)).unwrap();

        let api = anonymous().with_cookies("DedeUserID=42; SESSDATA=abc; bili_jct=x");
        assert_eq!(api.uid(), 42);

        let api = anonymous().with_cookies("DedeUserID=42");
        assert_eq!(api.uid(), 0);

        let api = anonymous().with_cookies("   ");
        assert_eq!(api.uid(), 0);
        assert!(api.cookies.is_none());
    }

    #[test]
    fn test_extract_cookie_value() {
        let cookies = "SESSDATA=abc123; bili_jct=xyz789; empty=";
        assert_eq!(
            extract_cookie_value(cookies, "bili_jct"),
            Some("xyz789".to_string())
        );
        assert_eq!(extract_cookie_value(cookies, "empty"), None);
        assert_eq!(extract_cookie_value(cookies, "missing"), None);
    }

    #[test]
    fn test_parse_room_info() {
        let body = r#"{
            "code": 0,
            "message": "0",
            "data": {
                "room_info": {
                    "uid": 9617619, "room_id": 21452505, "short_id": 0,
                    "title": "evening stream", "live_status": 1,
                    "area_name": "Music", "parent_area_name": "Entertainment",
                    "online": 3310
                },
                "anchor_info": { "base_info": { "uname": "streamer", "face": "https://i0.hdslb.com/face.jpg" } }
            }
        }"#;
        let envelope: Envelope<RoomInfoData> = serde_json::from_str(body).unwrap();
        let info = RoomInfo::from(envelope.into_data("getInfoByRoom").unwrap());
        assert_eq!(info.room_id, 21452505);
        assert_eq!(info.title, "evening stream");
        assert_eq!(info.owner_name, "streamer");
        assert_eq!(info.live_status, 1);
        assert_eq!(info.online, 3310);
    }

    #[test]
    fn test_error_envelope() {
        let envelope: Envelope<RoomInfoData> =
            serde_json::from_str(r#"{"code":19002000,"message":"room not found","data":null}"#)
                .unwrap();
        assert!(matches!(
            envelope.into_data("getInfoByRoom"),
            Err(DanmakuError::Api(msg)) if msg.contains("19002000")
        ));
    }

    #[test]
    fn test_server_url() {
        let info: DanmuInfo = serde_json::from_str(
            r#"{"token":"tok","host_list":[
                {"host":"zj-cn-live-comet.chat.bilibili.com","port":2243,"wss_port":443,"ws_port":2244},
                {"host":"broadcastlv.chat.bilibili.com","port":2243,"wss_port":443,"ws_port":2244}
            ]}"#,
        )
        .unwrap();
        assert_eq!(
            info.server_url().unwrap(),
            "wss://zj-cn-live-comet.chat.bilibili.com:443/sub"
        );

        let no_hosts = DanmuInfo {
            token: "tok".to_string(),
            host_list: vec![],
        };
        assert!(matches!(no_hosts.server_url(), Err(DanmakuError::Api(_))));

        let no_token = DanmuInfo {
            token: String::new(),
            ..info
        };
        assert!(matches!(no_token.server_url(), Err(DanmakuError::Api(_))));
    }
}
