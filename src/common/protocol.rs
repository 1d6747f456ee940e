use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::models::StoredMessage;

/// Protocol version sent by test clients in their hello banner.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Every frame on the socket is a JSON envelope: an event name plus an
/// event-specific payload. The payload is kept as raw JSON here so an
/// unrecognized event name can be told apart from a known event carrying
/// a malformed payload.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Payload of `registerUser`. The token carries the sender identity; the
/// userId field is a legacy addressing hint and is never trusted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUserPayload {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Payload of `joinChat`: either a conversation id or the peer to open
/// a conversation with.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinChatPayload {
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub peer_id: Option<String>,
}

/// Payload of `sendMessage`. `recepientId` is accepted as an alias for
/// receiverId because deployed clients ship with that spelling; `file`
/// is accepted for the attachment URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(alias = "recepientId")]
    pub receiver_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, alias = "file")]
    pub multimedia: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// Payload of `fetchChatHistory`. The two endpoints name the conversation;
/// whichever one is not the caller is the peer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchChatHistoryPayload {
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub receiver_id: Option<String>,
}

/// A client-to-server event with its payload fully decoded.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    RegisterUser(RegisterUserPayload),
    JoinChat(JoinChatPayload),
    SendMessage(SendMessagePayload),
    FetchChatHistory(FetchChatHistoryPayload),
}

/// Result of decoding one inbound text frame.
#[derive(Debug)]
pub enum DecodedFrame {
    /// A known event with a well-formed payload.
    Event(ClientEvent),
    /// A well-formed envelope whose event name is not registered. Ignored.
    Unknown(String),
    /// Text that is not a JSON envelope at all. Ignored.
    Invalid(String),
    /// A known event whose payload failed to decode. The sender gets an
    /// error ack for these so a failed send is never silent.
    Malformed { event: String, detail: String },
}

pub fn decode_client_frame(text: &str) -> DecodedFrame {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => return DecodedFrame::Invalid(e.to_string()),
    };
    match envelope.event.as_str() {
        "registerUser" => decode_register_user(envelope.data),
        "joinChat" => decode_join_chat(envelope.data),
        "sendMessage" => match decode_payload("sendMessage", envelope.data) {
            Ok(payload) => DecodedFrame::Event(ClientEvent::SendMessage(payload)),
            Err(frame) => frame,
        },
        "fetchChatHistory" => match decode_payload("fetchChatHistory", envelope.data) {
            Ok(payload) => DecodedFrame::Event(ClientEvent::FetchChatHistory(payload)),
            Err(frame) => frame,
        },
        other => DecodedFrame::Unknown(other.to_string()),
    }
}

fn decode_register_user(data: Value) -> DecodedFrame {
    // Early clients sent a bare userId string instead of an object.
    if let Value::String(user_id) = data {
        return DecodedFrame::Event(ClientEvent::RegisterUser(RegisterUserPayload {
            token: None,
            user_id: Some(user_id),
        }));
    }
    match decode_payload("registerUser", data) {
        Ok(payload) => DecodedFrame::Event(ClientEvent::RegisterUser(payload)),
        Err(frame) => frame,
    }
}

fn decode_join_chat(data: Value) -> DecodedFrame {
    // Bare string form: the conversation id alone.
    if let Value::String(chat_id) = data {
        return DecodedFrame::Event(ClientEvent::JoinChat(JoinChatPayload {
            chat_id: Some(chat_id),
            peer_id: None,
        }));
    }
    match decode_payload("joinChat", data) {
        Ok(payload) => DecodedFrame::Event(ClientEvent::JoinChat(payload)),
        Err(frame) => frame,
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T, DecodedFrame> {
    serde_json::from_value(data).map_err(|e| DecodedFrame::Malformed {
        event: event.to_string(),
        detail: e.to_string(),
    })
}

/// Error payload delivered on the `error` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Server-to-client events. Serializes to the same envelope shape the
/// clients send: `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Live delivery of a message to its recipient.
    ReceiveMessage(StoredMessage),
    /// Acknowledgement to the sender, carrying the durable record.
    MessageSent(StoredMessage),
    /// Full backlog of one conversation, oldest first.
    ReceiveChatHistory(Vec<StoredMessage>),
    Error(ErrorPayload),
}
