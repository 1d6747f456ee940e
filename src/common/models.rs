use serde::{Deserialize, Serialize};

/// A registered account as exposed by the directory commands.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub contact: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub is_online: bool,
}

/// The durable record of a relayed message. This is the shape persisted in
/// the messages table and the shape echoed back on the wire, so the sender
/// acknowledgement and the stored row can never drift apart.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// URL of an uploaded attachment, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multimedia: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Milliseconds since the Unix epoch, assigned at store time.
    pub sent_at: i64,
}

/// Canonical conversation identifier for a pair of users. The two endpoints
/// are sorted so both directions of a DM resolve to the same id.
pub fn conversation_id(user_a: &str, user_b: &str) -> String {
    let mut endpoints = [user_a, user_b];
    endpoints.sort();
    format!("private:{}-{}", endpoints[0], endpoints[1])
}
