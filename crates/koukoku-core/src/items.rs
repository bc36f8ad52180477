use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One chat line parsed from the message-class stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub body: String,
    /// `MM/DD`
    pub date: String,
    /// Single day-of-week character (日月火水木金土).
    pub dow: String,
    /// `HH:MM:SS`
    pub time: String,
    pub host: String,
    /// Set when the remote flagged the poster's reverse DNS as suspicious.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forgery: Option<String>,
    /// Set when the line echoes a post made over this connection.
    #[serde(rename = "self", default, skip_serializing_if = "Option::is_none")]
    pub self_marker: Option<String>,
    /// Arrival time of the chunk the record started in.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl Item {
    pub fn is_self(&self) -> bool {
        self.self_marker.is_some()
    }
}

/// One broadcast block parsed from the speech-class stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechItem {
    /// Block body, line breaks normalized to `\n`.
    pub body: String,
    /// Date header as written by the remote, e.g. `六年 十月 十六日`.
    pub date: String,
    pub dow: String,
    /// `HH:MM`
    pub time: String,
    pub host: String,
    /// Hex digest of the raw block salted with `finished`.
    pub hash: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub finished: DateTime<Utc>,
}

/// Either record shape, as persisted to the append-only log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Message(Item),
    Speech(SpeechItem),
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Speech(_) => "speech",
        }
    }

    /// The time a range query should file this record under.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Message(item) => item.timestamp,
            Self::Speech(item) => item.finished,
        }
    }
}
