//! Wire frames.
//!
//! Client → gateway: `hello` once after the handshake, then `request` frames.
//! Gateway → client: lifecycle frames (`pairing`, `open`, `close`,
//! `credentials`), `event` frames and `response` frames matched by id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_core::errors::TransportError;
use tether_core::ids::SessionId;
use tether_core::transport::Lifecycle;

pub const METHOD_PAIRING_CODE: &str = "pairingCode";
pub const METHOD_SEND_TEXT: &str = "sendText";
pub const METHOD_LOGOUT: &str = "logout";

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame<'a> {
    Hello {
        session: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        credentials: Option<&'a Value>,
    },
    Request {
        id: u64,
        method: &'a str,
        params: Value,
    },
}

impl ClientFrame<'_> {
    pub fn encode(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ResponseError {
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    Pairing {
        payload: String,
    },
    Open,
    Close {
        #[serde(default, rename = "statusCode")]
        status_code: Option<u16>,
        #[serde(default)]
        message: String,
    },
    Credentials {
        credentials: Value,
    },
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
    },
    Response {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<ResponseError>,
    },
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    /// The lifecycle notification this frame carries, if any.
    pub fn into_lifecycle(self) -> Option<Lifecycle> {
        match self {
            Self::Pairing { payload } => Some(Lifecycle::PairingOffer(payload)),
            Self::Open => Some(Lifecycle::Open),
            Self::Close {
                status_code,
                message,
            } => Some(Lifecycle::Close {
                status_code,
                message,
            }),
            Self::Credentials { credentials } => Some(Lifecycle::CredentialsUpdated(credentials)),
            Self::Event { .. } | Self::Response { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hello_omits_missing_credentials() {
        let frame = ClientFrame::Hello {
            session: SessionId::new(4),
            credentials: None,
        };
        let encoded: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(encoded, json!({ "type": "hello", "session": 4 }));
    }

    #[test]
    fn request_shape() {
        let frame = ClientFrame::Request {
            id: 9,
            method: METHOD_SEND_TEXT,
            params: json!({ "chat": "c", "text": "t" }),
        };
        let encoded: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({ "type": "request", "id": 9, "method": "sendText", "params": { "chat": "c", "text": "t" } })
        );
    }

    #[test]
    fn close_frame_maps_to_lifecycle() {
        let frame = ServerFrame::decode(r#"{"type":"close","statusCode":401,"message":"bye"}"#).unwrap();
        assert_eq!(
            frame.into_lifecycle(),
            Some(Lifecycle::Close {
                status_code: Some(401),
                message: "bye".into(),
            })
        );
        let bare = ServerFrame::decode(r#"{"type":"close"}"#).unwrap();
        assert!(matches!(bare, ServerFrame::Close { status_code: None, .. }));
    }

    #[test]
    fn response_with_error() {
        let frame =
            ServerFrame::decode(r#"{"type":"response","id":3,"error":{"message":"nope"}}"#).unwrap();
        match frame {
            ServerFrame::Response { id, error, .. } => {
                assert_eq!(id, 3);
                assert_eq!(error.unwrap().message, "nope");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn events_are_not_lifecycle() {
        let frame = ServerFrame::decode(r#"{"type":"event","event":"call"}"#).unwrap();
        assert!(frame.into_lifecycle().is_none());
        assert!(ServerFrame::decode(r#"{"type":"mystery"}"#).is_err());
    }
}
