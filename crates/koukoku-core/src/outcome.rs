use serde::{Deserialize, Serialize};

use crate::errors::SendError;

pub type SendResult = Result<(), SendError>;

/// JSON body handed back to HTTP callers of `send`:
/// `{"result":true}` or `{"error":{"kind":..,"message":..}}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SendReply {
    Sent { result: bool },
    Failed { error: ErrorBody },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl SendReply {
    pub fn sent() -> Self {
        Self::Sent { result: true }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { result: true })
    }
}

impl From<&SendResult> for SendReply {
    fn from(result: &SendResult) -> Self {
        match result {
            Ok(()) => Self::sent(),
            Err(e) => Self::Failed {
                error: ErrorBody {
                    kind: e.error_kind().to_string(),
                    message: e.to_string(),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_shape() {
        let reply = SendReply::from(&Ok(()));
        assert_eq!(serde_json::to_string(&reply).unwrap(), r#"{"result":true}"#);
        assert!(reply.is_sent());
    }

    #[test]
    fn failure_shape() {
        let reply = SendReply::from(&Err(SendError::Shutdown));
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["error"]["message"], "server shutdown");
        assert_eq!(json["error"]["kind"], "shutdown");
        assert!(!reply.is_sent());
    }

    #[test]
    fn parses_both_shapes() {
        let ok: SendReply = serde_json::from_str(r#"{"result":true}"#).unwrap();
        assert!(ok.is_sent());
        let err: SendReply =
            serde_json::from_str(r#"{"error":{"kind":"write_failure","message":"EPIPE"}}"#).unwrap();
        assert!(matches!(err, SendReply::Failed { .. }));
    }
}
