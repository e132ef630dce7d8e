//! WBI request signing for Bilibili web APIs.
//!
//! `getDanmuInfo` rejects unsigned requests. The signing keys come from the `nav`
//! endpoint and rotate daily, so they are cached per API instance.

use md5::{Digest, Md5};
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{DanmakuError, Result};

const NAV_URL: &str = "https://api.bilibili.com/x/web-interface/nav";

const CACHE_EXPIRATION: Duration = Duration::from_secs(2 * 60 * 60); // 2 hours

const MIXIN_KEY_ENC_TAB: [usize; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22, 25,
    54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

#[derive(Clone, Debug)]
struct WbiKeys {
    img_key: String,
    sub_key: String,
    fetched_at: Instant,
}

impl WbiKeys {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() > CACHE_EXPIRATION
    }
}

#[derive(Deserialize)]
struct WbiImg {
    img_url: String,
    sub_url: String,
}

#[derive(Deserialize)]
struct NavData {
    wbi_img: WbiImg,
}

#[derive(Deserialize)]
struct NavResponse {
    data: NavData,
}

/// Lazily fetched, cached signing keys.
#[derive(Debug, Default)]
pub struct WbiSigner {
    keys: Mutex<Option<WbiKeys>>,
}

impl WbiSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sign `params` and return the full query string (including `wts` and `w_rid`).
    pub async fn sign(
        &self,
        client: &Client,
        user_agent: &str,
        params: Vec<(&str, String)>,
    ) -> Result<String> {
        let keys = self.keys(client, user_agent).await?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| DanmakuError::api("SystemTime before UNIX EPOCH!"))?
            .as_secs();
        Ok(encode_wbi(params, (&keys.img_key, &keys.sub_key), now))
    }

    async fn keys(&self, client: &Client, user_agent: &str) -> Result<WbiKeys> {
        // Held across the fetch so concurrent callers share one refresh.
        let mut cached = self.keys.lock().await;
        if let Some(keys) = cached.as_ref().filter(|k| !k.is_stale()) {
            return Ok(keys.clone());
        }

        let NavResponse {
            data: NavData { wbi_img },
        } = client
            .get(NAV_URL)
            .header(reqwest::header::USER_AGENT, user_agent)
            .header(reqwest::header::REFERER, "https://www.bilibili.com")
            .send()
            .await?
            .json()
            .await?;

        let keys = WbiKeys {
            img_key: take_filename(&wbi_img.img_url)
                .ok_or_else(|| DanmakuError::api("malformed wbi img_url"))?,
            sub_key: take_filename(&wbi_img.sub_url)
                .ok_or_else(|| DanmakuError::api("malformed wbi sub_url"))?,
            fetched_at: Instant::now(),
        };
        debug!("Refreshed WBI keys");
        *cached = Some(keys.clone());
        Ok(keys)
    }
}

// 对 imgKey 和 subKey 进行字符顺序打乱编码
fn get_mixin_key(orig: &[u8]) -> String {
    MIXIN_KEY_ENC_TAB
        .iter()
        .take(32)
        .filter_map(|&i| orig.get(i).map(|&b| b as char))
        .collect::<String>()
}

fn get_url_encoded(s: &str) -> String {
    let mut encoded = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' => {
                encoded.push(c);
            }
            // Dropped from signed values entirely.
            '!' | '\'' | '(' | ')' | '*' => {}
            _ => {
                let mut buf = [0; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    encoded.push_str(&format!("%{b:02X}"));
                }
            }
        }
    }
    encoded
}

fn encode_wbi(
    mut params: Vec<(&str, String)>,
    (img_key, sub_key): (&str, &str),
    timestamp: u64,
) -> String {
    let mixin_key = get_mixin_key((img_key.to_owned() + sub_key).as_bytes());
    params.push(("wts", timestamp.to_string()));
    params.sort_by(|a, b| a.0.cmp(b.0));
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", get_url_encoded(k), get_url_encoded(v)))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Md5::new();
    hasher.update(query.clone() + &mixin_key);
    let web_sign = format!("{:x}", hasher.finalize());
    query + &format!("&w_rid={web_sign}")
}

fn take_filename(url: &str) -> Option<String> {
    url.rsplit_once('/')
        .and_then(|(_, s)| s.rsplit_once('.'))
        .map(|(s, _)| s.to_string())
}
