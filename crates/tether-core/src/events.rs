use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fixed vocabulary of inbound protocol events a plugin may subscribe to.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum ProtocolEvent {
    #[serde(rename = "messages.upsert")]
    MessagesUpsert,
    #[serde(rename = "messages.update")]
    MessagesUpdate,
    #[serde(rename = "messages.delete")]
    MessagesDelete,
    #[serde(rename = "messages.reaction")]
    MessagesReaction,
    #[serde(rename = "message-receipt.update")]
    MessageReceiptUpdate,
    #[serde(rename = "chats.upsert")]
    ChatsUpsert,
    #[serde(rename = "chats.update")]
    ChatsUpdate,
    #[serde(rename = "chats.delete")]
    ChatsDelete,
    #[serde(rename = "contacts.upsert")]
    ContactsUpsert,
    #[serde(rename = "contacts.update")]
    ContactsUpdate,
    #[serde(rename = "groups.upsert")]
    GroupsUpsert,
    #[serde(rename = "groups.update")]
    GroupsUpdate,
    #[serde(rename = "group-participants.update")]
    GroupParticipantsUpdate,
    #[serde(rename = "presence.update")]
    PresenceUpdate,
    #[serde(rename = "call")]
    Call,
    #[serde(rename = "blocklist.update")]
    BlocklistUpdate,
}

impl ProtocolEvent {
    pub const ALL: [Self; 16] = [
        Self::MessagesUpsert,
        Self::MessagesUpdate,
        Self::MessagesDelete,
        Self::MessagesReaction,
        Self::MessageReceiptUpdate,
        Self::ChatsUpsert,
        Self::ChatsUpdate,
        Self::ChatsDelete,
        Self::ContactsUpsert,
        Self::ContactsUpdate,
        Self::GroupsUpsert,
        Self::GroupsUpdate,
        Self::GroupParticipantsUpdate,
        Self::PresenceUpdate,
        Self::Call,
        Self::BlocklistUpdate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessagesUpsert => "messages.upsert",
            Self::MessagesUpdate => "messages.update",
            Self::MessagesDelete => "messages.delete",
            Self::MessagesReaction => "messages.reaction",
            Self::MessageReceiptUpdate => "message-receipt.update",
            Self::ChatsUpsert => "chats.upsert",
            Self::ChatsUpdate => "chats.update",
            Self::ChatsDelete => "chats.delete",
            Self::ContactsUpsert => "contacts.upsert",
            Self::ContactsUpdate => "contacts.update",
            Self::GroupsUpsert => "groups.upsert",
            Self::GroupsUpdate => "groups.update",
            Self::GroupParticipantsUpdate => "group-participants.update",
            Self::PresenceUpdate => "presence.update",
            Self::Call => "call",
            Self::BlocklistUpdate => "blocklist.update",
        }
    }
}

impl fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolEvent {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| format!("unknown protocol event: {s}"))
    }
}
