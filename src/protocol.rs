//! Wire-level vocabulary shared by the hub, its sessions, and producers:
//! bus key layout, control-channel sentinels and envelopes, outbound
//! payloads, and socket-id generation.

use bytes::Bytes;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Utf8Bytes;

// ---------------------------------------------------------------------------
// Control-channel sentinels
// ---------------------------------------------------------------------------

// The misspelling "CHANEL" is load-bearing: existing producers publish to
// these exact channel names.
pub(crate) const CTRL_TO_UID: &str = "#GUSHERFUNC-TOUID#";
pub(crate) const CTRL_TO_SID: &str = "#GUSHERFUNC-TOSID#";
pub(crate) const CTRL_RELOAD_CHANNELS: &str = "#GUSHERFUNC-RELOADCHANEL#";
pub(crate) const CTRL_ADD_CHANNEL: &str = "#GUSHERFUNC-ADDCHANEL#";

/// Members of a presence set count as online while their score falls inside
/// this trailing window.
pub const ONLINE_WINDOW_SECS: u64 = 120;

// ---------------------------------------------------------------------------
// Key namespace
// ---------------------------------------------------------------------------

/// Pub/sub channel: `<prefix><appKey>@<channel>`.
pub(crate) fn channel_key(prefix: &str, app_key: &str, channel: &str) -> String {
    format!("{prefix}{app_key}@{channel}")
}

/// Per-channel presence set: `<prefix><appKey>@channels:<channel>`, members
/// are sids.
pub(crate) fn presence_key(prefix: &str, app_key: &str, channel: &str) -> String {
    format!("{prefix}{app_key}@channels:{channel}")
}

/// Global online set: `<prefix><appKey>@online`, members are uids.
pub(crate) fn online_key(prefix: &str, app_key: &str) -> String {
    format!("{prefix}{app_key}@online")
}

/// Split an incoming bus channel into `(appKey, channel)`. Returns `None`
/// for channels outside the hub's namespace.
pub(crate) fn parse_bus_channel<'a>(prefix: &str, raw: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = raw.strip_prefix(prefix)?;
    let (app_key, channel) = rest.split_once('@')?;
    Some((app_key, channel.trim_end_matches('*')))
}

// ---------------------------------------------------------------------------
// Control envelopes
// ---------------------------------------------------------------------------

// Field names are part of the wire contract. Every `data` is re-serialized
// by the receiving node before delivery.

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SidEnvelope {
    pub sid: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct UidEnvelope {
    pub uid: String,
    pub data: serde_json::Value,
}

/// `data` is an array of channel names despite the singular-looking name on
/// the wire.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ReloadChannelsEnvelope {
    pub uid: String,
    pub data: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AddChannelEnvelope {
    pub uid: String,
    pub data: String,
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Body of an outbound payload.
///
/// `Prepared` carries a frame validated and allocated once at the hub and
/// refcount-shared by every recipient of the same bus message; `Raw` is a
/// per-recipient body from `Send` or an echo reply.
#[derive(Clone, Debug)]
pub enum PayloadBody {
    Raw(Bytes),
    Prepared(Utf8Bytes),
}

/// A unit handed to a session's outbound queue. Delivered as a text frame.
#[derive(Clone, Debug)]
pub struct Payload {
    pub len: usize,
    pub body: PayloadBody,
    /// Originating channel; empty for direct sends.
    pub channel: String,
    /// Tenant scope; empty for direct sends, which bypass the tenant check.
    pub app_key: String,
}

impl Payload {
    pub fn raw(data: Bytes) -> Self {
        Self {
            len: data.len(),
            body: PayloadBody::Raw(data),
            channel: String::new(),
            app_key: String::new(),
        }
    }

    pub fn prepared(channel: &str, app_key: &str, body: Utf8Bytes) -> Self {
        Self {
            len: body.len(),
            body: PayloadBody::Prepared(body),
            channel: channel.to_owned(),
            app_key: app_key.to_owned(),
        }
    }

    /// Build the wire frame. Raw bodies are validated here; prepared bodies
    /// were validated at the hub and only bump a refcount.
    pub(crate) fn to_message(&self) -> Result<Message, std::str::Utf8Error> {
        match &self.body {
            PayloadBody::Raw(data) => Utf8Bytes::try_from(data.clone()).map(Message::Text),
            PayloadBody::Prepared(text) => Ok(Message::Text(text.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// Socket identifiers
// ---------------------------------------------------------------------------

const DIGITS: &[u8] = b"0123456789";

fn rand_digits(n: usize) -> String {
    let mut rng = OsRng;
    let mut out = String::with_capacity(n);
    for _ in 0..n {
        out.push(DIGITS[rng.gen_range(0..DIGITS.len())] as char);
    }
    out
}

/// Generate a socket identifier: `NNNN.NNNNNNN`, digits drawn from the OS
/// entropy source.
pub fn gen_socket_id() -> String {
    format!("{}.{}", rand_digits(4), rand_digits(7))
}

// ---------------------------------------------------------------------------
// Clock helpers
// ---------------------------------------------------------------------------

/// Wall-clock time in seconds since UNIX epoch. Presence scores use this.
pub(crate) fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Wall-clock time in milliseconds since UNIX epoch.
pub(crate) fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
