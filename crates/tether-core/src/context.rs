use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::events::ProtocolEvent;
use crate::ids::SessionId;

/// What a matcher matched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Matched {
    /// A literal trigger, in its declared spelling.
    Literal(String),
    /// Capture groups of the winning pattern trigger (index 0 is the whole match).
    Pattern(Vec<Option<String>>),
}

impl Matched {
    pub fn literal(&self) -> Option<&str> {
        match self {
            Self::Literal(s) => Some(s),
            Self::Pattern(_) => None,
        }
    }

    pub fn captures(&self) -> Option<&[Option<String>]> {
        match self {
            Self::Literal(_) => None,
            Self::Pattern(groups) => Some(groups),
        }
    }
}

/// Result of a successful matcher evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: Matched,
    /// Prefix character used to invoke a literal trigger. Always `None` for patterns.
    pub prefix: Option<char>,
}

impl MatchResult {
    pub fn literal(literal: impl Into<String>, prefix: Option<char>) -> Self {
        Self {
            matched: Matched::Literal(literal.into()),
            prefix,
        }
    }

    pub fn pattern(groups: Vec<Option<String>>) -> Self {
        Self {
            matched: Matched::Pattern(groups),
            prefix: None,
        }
    }
}

/// Per-event context handed to plugins.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EventContext {
    pub session_id: SessionId,
    pub event: ProtocolEvent,
    pub chat: Option<String>,
    pub sender: Option<String>,
    pub text: Option<String>,
    pub payload: Value,
    pub matched: Option<MatchResult>,
}

impl EventContext {
    /// Build a context from a raw event payload, lifting `chat`, `sender` and `text`.
    pub fn from_payload(session_id: SessionId, event: ProtocolEvent, payload: Value) -> Self {
        let chat = first_str(
            &payload,
            &["/chat", "/key/remoteJid", "/id", "/jid"],
        );
        let sender = first_str(&payload, &["/sender", "/key/participant", "/participant"])
            .or_else(|| chat.clone());
        let text = first_str(
            &payload,
            &[
                "/text",
                "/message/conversation",
                "/message/extendedTextMessage/text",
                "/message/imageMessage/caption",
                "/message/videoMessage/caption",
            ],
        );
        Self {
            session_id,
            event,
            chat,
            sender,
            text,
            payload,
            matched: None,
        }
    }

    /// Copy of this context extended with a match result.
    pub fn with_match(&self, matched: MatchResult) -> Self {
        Self {
            matched: Some(matched),
            ..self.clone()
        }
    }

    /// Text content, if the event carries any non-empty text.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.is_empty())
    }

    /// JSON shape passed to script plugins on stdin.
    pub fn to_script_input(&self) -> Value {
        let (matched, prefix) = match &self.matched {
            Some(m) => (
                serde_json::to_value(&m.matched).unwrap_or(Value::Null),
                m.prefix.map_or(Value::Null, |c| Value::String(c.to_string())),
            ),
            None => (Value::Null, Value::Null),
        };
        json!({
            "event": self.event.as_str(),
            "session": self.session_id.get(),
            "chat": self.chat,
            "sender": self.sender,
            "text": self.text,
            "match": matched,
            "prefix": prefix,
            "payload": self.payload,
        })
    }
}

fn first_str(payload: &Value, pointers: &[&str]) -> Option<String> {
    pointers
        .iter()
        .find_map(|p| payload.pointer(p).and_then(Value::as_str))
        .map(str::to_owned)
}
