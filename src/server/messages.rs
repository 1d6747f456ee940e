use crate::common::models::{conversation_id, StoredMessage};
use crate::server::auth;
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::users;
use std::collections::HashMap;
use std::sync::Arc;
use sqlx::Row;
use thiserror::Error;

/// A message as submitted by a sender, before the store assigns identity.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: Option<String>,
    pub multimedia: Option<String>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message requires content or an attachment")]
    Empty,
    #[error("message too long (max {0} chars)")]
    TooLong(usize),
    #[error("message store unavailable: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persist one message. Validation happens before anything touches the
/// database: a rejected message leaves no partial write behind. On success
/// exactly one messages row exists and the returned record is that row.
pub async fn store_message(db: &Database, msg: NewMessage, config: &ServerConfig) -> Result<StoredMessage, StoreError> {
    let has_content = msg.content.as_deref().map_or(false, |c| !c.trim().is_empty());
    let has_attachment = msg.multimedia.as_deref().map_or(false, |m| !m.trim().is_empty());
    if !has_content && !has_attachment {
        return Err(StoreError::Empty);
    }
    if let Some(content) = &msg.content {
        if content.len() > config.max_message_length {
            return Err(StoreError::TooLong(config.max_message_length));
        }
    }

    let stored = StoredMessage {
        id: uuid::Uuid::new_v4().to_string(),
        chat_id: conversation_id(&msg.sender_id, &msg.receiver_id),
        sender_id: msg.sender_id,
        receiver_id: msg.receiver_id,
        content: msg.content,
        multimedia: msg.multimedia,
        reply_to: msg.reply_to,
        sent_at: chrono::Utc::now().timestamp_millis(),
    };

    sqlx::query(
        "INSERT INTO messages (id, chat_id, sender_id, receiver_id, content, multimedia, reply_to, sent_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&stored.id)
    .bind(&stored.chat_id)
    .bind(&stored.sender_id)
    .bind(&stored.receiver_id)
    .bind(&stored.content)
    .bind(&stored.multimedia)
    .bind(&stored.reply_to)
    .bind(stored.sent_at)
    .execute(&db.pool)
    .await?;

    touch_conversation(db, &stored).await;
    Ok(stored)
}

// Refresh the denormalized conversation summary. Best effort: the message
// row is already durable, so a failure here is logged and swallowed rather
// than turned into a failed send.
async fn touch_conversation(db: &Database, msg: &StoredMessage) {
    let mut endpoints = [msg.sender_id.as_str(), msg.receiver_id.as_str()];
    endpoints.sort();
    if let Err(e) = sqlx::query(
        "INSERT OR IGNORE INTO conversations (chat_id, user_a, user_b, created_at, last_message_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&msg.chat_id)
    .bind(endpoints[0])
    .bind(endpoints[1])
    .bind(msg.sent_at)
    .bind(msg.sent_at)
    .execute(&db.pool)
    .await
    {
        println!("[MSG] Failed to create conversation row {}: {}", msg.chat_id, e);
        return;
    }
    if let Err(e) = sqlx::query("UPDATE conversations SET last_message_at = ? WHERE chat_id = ?")
        .bind(msg.sent_at)
        .bind(&msg.chat_id)
        .execute(&db.pool)
        .await
    {
        println!("[MSG] Failed to refresh conversation {}: {}", msg.chat_id, e);
    }
}

/// Full backlog of the conversation between two users, oldest first.
pub async fn conversation_history(db: &Database, user_a: &str, user_b: &str) -> Result<Vec<StoredMessage>, StoreError> {
    let chat_id = conversation_id(user_a, user_b);
    let rows = sqlx::query_as::<_, StoredMessage>(
        "SELECT id, chat_id, sender_id, receiver_id, content, multimedia, reply_to, sent_at FROM messages WHERE chat_id = ? ORDER BY sent_at ASC",
    )
    .bind(&chat_id)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows)
}

pub async fn send_private_message(db: Arc<Database>, token: &str, to: &str, message: &str, config: &ServerConfig) -> String {
    let sender_id = match auth::verify_token(token, config) {
        Some(uid) => uid,
        None => return "ERR: Invalid or expired token".to_string(),
    };
    let receiver_id = match users::resolve_user(&db, to).await {
        Some(id) => id,
        None => return "ERR: Recipient not found".to_string(),
    };
    let msg = NewMessage {
        sender_id,
        receiver_id,
        content: Some(message.to_string()),
        multimedia: None,
        reply_to: None,
    };
    match store_message(&db, msg, config).await {
        Ok(stored) => {
            println!("[MSG] Stored private message {} in chat {}", stored.id, stored.chat_id);
            "OK: Message sent".to_string()
        }
        Err(e) => {
            println!("[MSG] Error sending private message: {}", e);
            format!("ERR: {}", e)
        }
    }
}

pub async fn send_private_file(
    db: Arc<Database>,
    token: &str,
    to: &str,
    url: &str,
    caption: Option<&str>,
    config: &ServerConfig,
) -> String {
    let sender_id = match auth::verify_token(token, config) {
        Some(uid) => uid,
        None => return "ERR: Invalid or expired token".to_string(),
    };
    let receiver_id = match users::resolve_user(&db, to).await {
        Some(id) => id,
        None => return "ERR: Recipient not found".to_string(),
    };
    let msg = NewMessage {
        sender_id,
        receiver_id,
        content: caption.map(|c| c.to_string()),
        multimedia: Some(url.to_string()),
        reply_to: None,
    };
    match store_message(&db, msg, config).await {
        Ok(stored) => {
            println!("[MSG] Stored file message {} in chat {}", stored.id, stored.chat_id);
            "OK: File sent".to_string()
        }
        Err(e) => {
            println!("[MSG] Error sending file message: {}", e);
            format!("ERR: {}", e)
        }
    }
}

pub async fn get_private_messages(db: Arc<Database>, token: &str, with: &str, config: &ServerConfig) -> String {
    let user_id = match auth::verify_token(token, config) {
        Some(uid) => uid,
        None => return "ERR: Invalid or expired token".to_string(),
    };
    let other_id = match users::resolve_user(&db, with).await {
        Some(id) => id,
        None => return "ERR: User not found".to_string(),
    };

    // Map ids to emails once so transcript lines stay readable
    let mut names: HashMap<String, String> = HashMap::new();
    for id in [&user_id, &other_id] {
        if let Ok(Some(row)) = sqlx::query("SELECT email FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&db.pool)
            .await
        {
            names.insert(id.to_string(), row.get::<String, _>("email"));
        }
    }

    match conversation_history(&db, &user_id, &other_id).await {
        Ok(messages) => {
            let lines: Vec<String> = messages
                .iter()
                .map(|m| {
                    let sender = names.get(&m.sender_id).cloned().unwrap_or_else(|| m.sender_id.clone());
                    let body = match (&m.content, &m.multimedia) {
                        (Some(text), Some(url)) => format!("{} [file: {}]", text, url),
                        (Some(text), None) => text.clone(),
                        (None, Some(url)) => format!("[file: {}]", url),
                        (None, None) => String::new(),
                    };
                    format!("[{}] {}: {}", m.sent_at, sender, body)
                })
                .collect();
            println!("[MSG] Returning {} messages for chat {}", lines.len(), conversation_id(&user_id, &other_id));
            format!("OK: Messages:\n{}", lines.join("\n"))
        }
        Err(e) => {
            println!("[MSG] Error loading messages: {}", e);
            format!("ERR: {}", e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::test_config;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    async fn test_db() -> Arc<Database> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Arc::new(Database { pool });
        db.migrate().await.unwrap();
        db
    }

    fn text_message(from: &str, to: &str, text: &str) -> NewMessage {
        NewMessage {
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            content: Some(text.to_string()),
            multimedia: None,
            reply_to: None,
        }
    }

    async fn message_count(db: &Database) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM messages")
            .fetch_one(&db.pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn empty_message_is_rejected_before_any_write() {
        let db = test_db().await;
        let config = test_config();
        let msg = NewMessage {
            sender_id: "a".to_string(),
            receiver_id: "b".to_string(),
            content: Some("   ".to_string()),
            multimedia: None,
            reply_to: None,
        };
        assert!(matches!(store_message(&db, msg, &config).await, Err(StoreError::Empty)));
        assert_eq!(message_count(&db).await, 0);
        let conversations = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM conversations")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(conversations, 0);
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let db = test_db().await;
        let config = test_config();
        let msg = text_message("a", "b", &"x".repeat(config.max_message_length + 1));
        assert!(matches!(store_message(&db, msg, &config).await, Err(StoreError::TooLong(_))));
        assert_eq!(message_count(&db).await, 0);
    }

    #[tokio::test]
    async fn attachment_only_message_is_valid() {
        let db = test_db().await;
        let config = test_config();
        let msg = NewMessage {
            sender_id: "a".to_string(),
            receiver_id: "b".to_string(),
            content: None,
            multimedia: Some("https://cdn/img.png".to_string()),
            reply_to: None,
        };
        let stored = store_message(&db, msg, &config).await.unwrap();
        assert_eq!(stored.multimedia.as_deref(), Some("https://cdn/img.png"));
        assert_eq!(message_count(&db).await, 1);
    }

    #[tokio::test]
    async fn store_assigns_id_timestamp_and_canonical_chat() {
        let db = test_db().await;
        let config = test_config();
        let stored = store_message(&db, text_message("bob", "alice", "hi"), &config).await.unwrap();
        assert!(!stored.id.is_empty());
        assert_eq!(stored.chat_id, "private:alice-bob");
        assert!(stored.sent_at > 0);
        assert_eq!(message_count(&db).await, 1);
    }

    #[tokio::test]
    async fn history_is_shared_by_both_directions_and_ordered() {
        let db = test_db().await;
        let config = test_config();
        store_message(&db, text_message("a", "b", "first"), &config).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store_message(&db, text_message("b", "a", "second"), &config).await.unwrap();

        let forward = conversation_history(&db, "a", "b").await.unwrap();
        let backward = conversation_history(&db, "b", "a").await.unwrap();
        assert_eq!(forward.len(), 2);
        assert_eq!(forward.len(), backward.len());
        assert_eq!(forward[0].content.as_deref(), Some("first"));
        assert_eq!(forward[1].content.as_deref(), Some("second"));
        assert!(forward[0].sent_at <= forward[1].sent_at);
    }

    #[tokio::test]
    async fn conversation_summary_tracks_first_and_latest_message() {
        let db = test_db().await;
        let config = test_config();
        let first = store_message(&db, text_message("a", "b", "one"), &config).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = store_message(&db, text_message("b", "a", "two"), &config).await.unwrap();

        let row = sqlx::query("SELECT created_at, last_message_at FROM conversations WHERE chat_id = ?")
            .bind(&first.chat_id)
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("created_at"), first.sent_at);
        assert_eq!(row.get::<i64, _>("last_message_at"), second.sent_at);
    }

    #[tokio::test]
    async fn command_wrappers_enforce_auth_and_recipient_existence() {
        let db = test_db().await;
        let config = test_config();
        let resp = send_private_message(db.clone(), "bad-token", "someone", "hi", &config).await;
        assert_eq!(resp, "ERR: Invalid or expired token");

        sqlx::query("INSERT INTO users (id, email, created_at, is_online) VALUES ('u1', 'a@x.com', 0, 0)")
            .execute(&db.pool)
            .await
            .unwrap();
        let token = auth::issue_access_token("u1", &config).unwrap();
        let resp = send_private_message(db.clone(), &token, "ghost@x.com", "hi", &config).await;
        assert_eq!(resp, "ERR: Recipient not found");
        assert_eq!(message_count(&db).await, 0);
    }
}
