use serde::{Deserialize, Serialize};

use crate::ids::RecordId;
use crate::items::{Item, Record, SpeechItem};

/// Events the engine publishes to subscribers. Records are persisted before
/// the event is sent, so `id` is already assigned when a subscriber sees it.
/// `id` is `None` only when the log rejected the record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    #[serde(rename = "message")]
    Message { id: Option<RecordId>, item: Item },

    #[serde(rename = "speech")]
    Speech { id: Option<RecordId>, item: SpeechItem },
}

impl EngineEvent {
    pub fn from_record(id: Option<RecordId>, record: Record) -> Self {
        match record {
            Record::Message(item) => Self::Message { id, item },
            Record::Speech(item) => Self::Speech { id, item },
        }
    }

    pub fn id(&self) -> Option<RecordId> {
        match self {
            Self::Message { id, .. } | Self::Speech { id, .. } => *id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Speech { .. } => "speech",
        }
    }
}
