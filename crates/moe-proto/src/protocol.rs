use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// Server → client: carries the heartbeat interval in `d.heartbeat`.
pub const OP_HELLO: i64 = 0;
/// Server → client: named dispatch event in `t`, payload in `d`.
pub const OP_DISPATCH: i64 = 1;
/// Client → server keep-alive.
pub const OP_HEARTBEAT: i64 = 9;

pub const EVENT_TRACK_UPDATE: &str = "TRACK_UPDATE";
pub const EVENT_TRACK_UPDATE_REQUEST: &str = "TRACK_UPDATE_REQUEST";

/// Close code sent when the client drops the socket to switch channels.
/// Any other code is treated as a failure and reconnects slowly.
pub const CHANNEL_SWITCH_CLOSE_CODE: u16 = 4069;

/// `last_track_id` before any track has been observed.
pub const NO_TRACK_ID: i64 = -1;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("malformed gateway frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hello frame without a positive heartbeat interval")]
    MissingHeartbeat,
    #[error("{0} dispatch without a payload")]
    MissingPayload(String),
    #[error("unknown channel {0:?}")]
    UnknownChannel(String),
}

// ── Channel ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Channel {
    #[default]
    #[serde(rename = "JPOP")]
    Jpop,
    #[serde(rename = "KPOP")]
    Kpop,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Jpop, Channel::Kpop];

    pub fn stream_url(self) -> &'static str {
        match self {
            Channel::Jpop => "https://listen.moe/stream",
            Channel::Kpop => "https://listen.moe/kpop/stream",
        }
    }

    pub fn gateway_url(self) -> &'static str {
        match self {
            Channel::Jpop => "wss://listen.moe/gateway_v2",
            Channel::Kpop => "wss://listen.moe/kpop/gateway_v2",
        }
    }

    pub fn toggled(self) -> Channel {
        match self {
            Channel::Jpop => Channel::Kpop,
            Channel::Kpop => Channel::Jpop,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Channel::Jpop => "JPOP",
            Channel::Kpop => "KPOP",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Channel {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ProtoError::UnknownChannel(s.to_string()))
    }
}

// ── Track ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Artist {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "nameRomaji", default)]
    pub name_romaji: Option<String>,
}

impl Artist {
    /// Romanized name when the gateway provides one.
    pub fn display_name(&self) -> &str {
        match self.name_romaji.as_deref() {
            Some(romaji) if !romaji.trim().is_empty() => romaji,
            _ => &self.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Album {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

/// Raw cover image as fetched from the CDN.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverArt {
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Track {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artists: Vec<Artist>,
    #[serde(default)]
    pub albums: Vec<Album>,
    #[serde(default)]
    pub duration: Option<u32>,
    /// Best effort; filled in after the remote check resolves.
    #[serde(default)]
    pub favorite: bool,
    #[serde(skip)]
    pub cover: Option<CoverArt>,
}

impl Track {
    pub fn artist_line(&self) -> String {
        self.artists
            .iter()
            .map(Artist::display_name)
            .filter(|n| !n.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Image reference of the first album, if any.
    pub fn cover_image(&self) -> Option<&str> {
        self.albums
            .first()
            .and_then(|a| a.image.as_deref())
            .filter(|img| !img.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackUpdate {
    pub track: Track,
    pub listeners: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
}

impl TrackUpdate {
    /// The production gateway nests the track under `d.song`; a bare track
    /// object in `d` is accepted as well.
    fn from_payload(mut d: Value) -> Result<Self, ProtoError> {
        let listeners = d
            .get("listeners")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok());
        let start_time = d
            .get("startTime")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        let song = match d.get_mut("song").map(Value::take) {
            Some(song) => song,
            None => d,
        };
        let track: Track = serde_json::from_value(song)?;

        Ok(Self {
            track,
            listeners,
            start_time,
        })
    }
}

// ── Gateway frames ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawFrame {
    op: i64,
    #[serde(default)]
    t: Option<String>,
    #[serde(default)]
    d: Option<Value>,
}

/// One decoded gateway frame.  Unrecognised dispatch events and op codes
/// decode to explicit variants so the dispatcher can skip them.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayMessage {
    Hello { heartbeat_ms: u64 },
    TrackUpdate(TrackUpdate),
    Dispatch { event: String },
    Unknown { op: i64 },
}

impl GatewayMessage {
    /// Returns `Ok(None)` for empty frames.
    pub fn decode(text: &str) -> Result<Option<Self>, ProtoError> {
        if text.trim().is_empty() {
            return Ok(None);
        }

        let raw: RawFrame = serde_json::from_str(text)?;
        let msg = match raw.op {
            OP_HELLO => {
                let heartbeat_ms = raw
                    .d
                    .as_ref()
                    .and_then(|d| d.get("heartbeat"))
                    .and_then(Value::as_u64)
                    .filter(|ms| *ms > 0)
                    .ok_or(ProtoError::MissingHeartbeat)?;
                GatewayMessage::Hello { heartbeat_ms }
            }
            OP_DISPATCH => {
                let event = raw.t.unwrap_or_default();
                if event == EVENT_TRACK_UPDATE || event == EVENT_TRACK_UPDATE_REQUEST {
                    let d = raw.d.ok_or(ProtoError::MissingPayload(event))?;
                    GatewayMessage::TrackUpdate(TrackUpdate::from_payload(d)?)
                } else {
                    GatewayMessage::Dispatch { event }
                }
            }
            op => GatewayMessage::Unknown { op },
        };
        Ok(Some(msg))
    }
}

/// Keep-alive frame sent on the server-supplied interval.
pub fn heartbeat_frame() -> String {
    json!({ "op": OP_HEARTBEAT }).to_string()
}
