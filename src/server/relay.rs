use crate::common::models::conversation_id;
use crate::common::protocol::{
    decode_client_frame, ClientEvent, DecodedFrame, ErrorPayload, FetchChatHistoryPayload,
    JoinChatPayload, RegisterUserPayload, SendMessagePayload, ServerEvent,
};
use crate::server::auth;
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::messages::{self, NewMessage, StoreError};
use crate::server::presence::{ConnectionId, PresenceRegistry, RegisterOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Failures a sender can be told about. A recipient who is simply offline is
/// not in here: that is a normal outcome, the message is stored and the send
/// still succeeds.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    Persistence(String),
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "VALIDATION",
            RelayError::Auth(_) => "AUTH",
            RelayError::Persistence(_) => "PERSISTENCE",
        }
    }
}

/// Per-connection state owned by that connection's receive loop. A session
/// starts anonymous, becomes registered after a verified `registerUser`, and
/// may carry a conversation scope after `joinChat`.
#[derive(Debug)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user_id: Option<String>,
    pub chat_id: Option<String>,
}

/// Presence-aware relay between live sockets and the message store. Holds
/// the outbound half of every attached connection; the presence registry
/// maps users to connections for targeted delivery.
#[derive(Clone)]
pub struct ChatRelay {
    db: Arc<Database>,
    config: ServerConfig,
    presence: PresenceRegistry,
    connections: Arc<Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Message>>>>,
}

impl ChatRelay {
    pub fn new(db: Arc<Database>, config: ServerConfig, presence: PresenceRegistry) -> Self {
        Self {
            db,
            config,
            presence,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Full lifecycle of one accepted socket: attach, pump frames, detach.
    pub async fn handle_connection(&self, ws_stream: WebSocketStream<TcpStream>) {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let mut session = self.attach(tx).await;

        // Outbound pump: everything addressed to this connection funnels
        // through one channel so frames never interleave on the wire
        let send_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
        });

        // Frames from one connection are handled to completion in arrival
        // order; a peer that vanishes mid-store is observed only after the
        // store finishes, so in-flight writes always complete
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => self.handle_frame(&mut session, &text).await,
                Ok(Message::Close(_)) => {
                    println!("[WS:RECV] Close frame from connection {}", session.connection_id);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    println!("[WS:RECV] Error on connection {}: {}", session.connection_id, e);
                    break;
                }
            }
        }

        self.detach(&session).await;
        let _ = send_task.await;
    }

    /// Track a new connection and hand back its session. The caller owns the
    /// session for the lifetime of the connection.
    pub async fn attach(&self, sender: mpsc::UnboundedSender<Message>) -> Session {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let mut connections = self.connections.lock().await;
        connections.insert(connection_id.clone(), sender);
        println!("[WS:CONNECT] Connection {} attached (total={})", connection_id, connections.len());
        Session { connection_id, user_id: None, chat_id: None }
    }

    /// Drop a connection. Safe to call for sessions that never registered and
    /// safe to call twice; a stale detach cannot evict a user who has since
    /// re-registered on a newer connection.
    pub async fn detach(&self, session: &Session) {
        {
            let mut connections = self.connections.lock().await;
            if connections.remove(&session.connection_id).is_some() {
                println!("[WS:DISCONNECT] Connection {} detached (total={})", session.connection_id, connections.len());
            }
        }
        if let Some(user_id) = self.presence.unregister(&session.connection_id).await {
            let _ = sqlx::query("UPDATE users SET is_online = 0 WHERE id = ?")
                .bind(&user_id)
                .execute(&self.db.pool)
                .await;
            println!("[WS:OFFLINE] Set is_online=0 for user {}", user_id);
        }
    }

    /// Decode and dispatch one inbound text frame.
    pub async fn handle_frame(&self, session: &mut Session, text: &str) {
        match decode_client_frame(text) {
            DecodedFrame::Event(event) => self.handle_event(session, event).await,
            DecodedFrame::Unknown(event) => {
                println!("[WS:RECV] Ignoring unhandled event '{}' from connection {}", event, session.connection_id);
            }
            DecodedFrame::Invalid(detail) => {
                println!("[WS:RECV] Failed to parse frame from connection {}: {}", session.connection_id, detail);
            }
            DecodedFrame::Malformed { event, detail } => {
                println!("[WS:RECV] Malformed {} payload from connection {}: {}", event, session.connection_id, detail);
                self.send_error(session, RelayError::Validation(format!("Invalid {} payload", event))).await;
            }
        }
    }

    pub async fn handle_event(&self, session: &mut Session, event: ClientEvent) {
        match event {
            ClientEvent::RegisterUser(payload) => self.on_register_user(session, payload).await,
            ClientEvent::JoinChat(payload) => self.on_join_chat(session, payload).await,
            ClientEvent::SendMessage(payload) => self.on_send_message(session, payload).await,
            ClientEvent::FetchChatHistory(payload) => self.on_fetch_history(session, payload).await,
        }
    }

    async fn on_register_user(&self, session: &mut Session, payload: RegisterUserPayload) {
        let token = match payload.token.as_deref().filter(|t| !t.is_empty()) {
            Some(t) => t.to_string(),
            None => {
                println!("[WS:REGISTER] Connection {} tried to register without a token", session.connection_id);
                self.send_error(session, RelayError::Auth("registerUser requires an access token".to_string())).await;
                return;
            }
        };
        let user_id = match auth::verify_token(&token, &self.config) {
            Some(uid) => uid,
            None => {
                self.send_error(session, RelayError::Auth("Invalid or expired token".to_string())).await;
                return;
            }
        };
        // The payload userId is an addressing hint from older clients; the
        // token decides who this connection speaks for
        if let Some(hint) = payload.user_id.as_deref() {
            if hint != user_id {
                println!("[WS:REGISTER] userId hint {} ignored; token identity {} wins", hint, user_id);
            }
        }
        match self.presence.register(&user_id, &session.connection_id).await {
            RegisterOutcome::Rejected => {
                self.send_error(session, RelayError::Validation("userId must not be empty".to_string())).await;
                return;
            }
            RegisterOutcome::Replaced { previous } => {
                println!("[WS:REGISTER] User {} re-registered on connection {} (displaced {})", user_id, session.connection_id, previous);
            }
            RegisterOutcome::Registered => {
                println!("[WS:REGISTER] User {} registered on connection {}", user_id, session.connection_id);
            }
        }
        session.user_id = Some(user_id.clone());
        let _ = sqlx::query("UPDATE users SET is_online = 1 WHERE id = ?")
            .bind(&user_id)
            .execute(&self.db.pool)
            .await;
        println!("[WS:ONLINE] Set is_online=1 for user {}", user_id);
    }

    async fn on_join_chat(&self, session: &mut Session, payload: JoinChatPayload) {
        let user_id = match &session.user_id {
            Some(uid) => uid.clone(),
            None => {
                self.send_error(session, RelayError::Auth("joinChat requires a registered session".to_string())).await;
                return;
            }
        };
        // A connection holds one conversation scope at a time; joining again
        // replaces the previous scope
        let chat_id = if let Some(peer) = payload.peer_id.as_deref().filter(|p| !p.trim().is_empty()) {
            conversation_id(&user_id, peer)
        } else if let Some(raw) = payload.chat_id.as_deref().filter(|c| !c.trim().is_empty()) {
            if raw.starts_with("private:") {
                raw.to_string()
            } else {
                conversation_id(&user_id, raw)
            }
        } else {
            self.send_error(session, RelayError::Validation("joinChat requires a chatId or peerId".to_string())).await;
            return;
        };
        println!("[WS:JOIN] Connection {} joined chat {}", session.connection_id, chat_id);
        session.chat_id = Some(chat_id);
    }

    async fn on_send_message(&self, session: &Session, payload: SendMessagePayload) {
        // Sender identity comes from the session, never from the payload
        let sender_id = match &session.user_id {
            Some(uid) => uid.clone(),
            None => {
                println!("[WS:MSG] sendMessage from unregistered connection {}", session.connection_id);
                self.send_error(session, RelayError::Auth("Sender not registered".to_string())).await;
                return;
            }
        };
        if let Some(hint) = payload.sender_id.as_deref() {
            if hint != sender_id {
                println!("[WS:MSG] senderId hint {} ignored; session identity {} wins", hint, sender_id);
            }
        }
        let receiver_id = payload.receiver_id.trim().to_string();
        if receiver_id.is_empty() {
            self.send_error(session, RelayError::Validation("receiverId must not be empty".to_string())).await;
            return;
        }
        let chat_id = conversation_id(&sender_id, &receiver_id);
        if let Some(requested) = payload.chat_id.as_deref() {
            if requested != chat_id {
                println!("[WS:MSG] chatId {} normalized to {}", requested, chat_id);
            }
        }

        let msg = NewMessage {
            sender_id: sender_id.clone(),
            receiver_id: receiver_id.clone(),
            content: payload.content,
            multimedia: payload.multimedia,
            reply_to: payload.reply_to,
        };

        // The store write finishes (or fails) before any delivery is
        // attempted; the bound keeps a stalled store from wedging the
        // connection forever
        let store = messages::store_message(&self.db, msg, &self.config);
        let stored = match tokio::time::timeout(self.config.persist_timeout(), store).await {
            Ok(Ok(stored)) => stored,
            Ok(Err(e)) => {
                println!("[WS:MSG] Failed to store message from {}: {}", sender_id, e);
                let err = match e {
                    StoreError::Empty | StoreError::TooLong(_) => RelayError::Validation(e.to_string()),
                    StoreError::Database(_) => RelayError::Persistence(e.to_string()),
                };
                self.send_error(session, err).await;
                return;
            }
            Err(_) => {
                println!("[WS:MSG] Store timed out after {}ms for sender {}", self.config.persist_timeout_ms, sender_id);
                self.send_error(session, RelayError::Persistence("message store timed out".to_string())).await;
                return;
            }
        };

        // Live delivery happens at most once, and only if the receiver has
        // an active connection right now
        match self.presence.lookup(&receiver_id).await {
            Some(conn_id) => {
                if self.send_event(&conn_id, &ServerEvent::ReceiveMessage(stored.clone())).await {
                    println!("[WS:MSG] Delivered message {} to {} on connection {}", stored.id, receiver_id, conn_id);
                } else {
                    println!("[WS:MSG] Connection {} for {} is gone; delivery skipped", conn_id, receiver_id);
                }
            }
            None => {
                println!("[WS:MSG] Recipient {} is not online; message {} stored only", receiver_id, stored.id);
            }
        }

        // The sender always learns the outcome, echoed with the durable record
        self.send_event(&session.connection_id, &ServerEvent::MessageSent(stored)).await;
    }

    async fn on_fetch_history(&self, session: &Session, payload: FetchChatHistoryPayload) {
        let user_id = match &session.user_id {
            Some(uid) => uid.clone(),
            None => {
                self.send_error(session, RelayError::Auth("fetchChatHistory requires a registered session".to_string())).await;
                return;
            }
        };
        // The peer is whichever named endpoint is not the caller; a fetch
        // naming only the caller reads their self-conversation
        let mut other: Option<String> = None;
        for candidate in [payload.sender_id, payload.receiver_id].into_iter().flatten() {
            if candidate != user_id {
                other = Some(candidate);
                break;
            } else if other.is_none() {
                other = Some(candidate);
            }
        }
        let other = match other {
            Some(o) => o,
            None => {
                self.send_error(session, RelayError::Validation("fetchChatHistory requires senderId and receiverId".to_string())).await;
                return;
            }
        };
        match messages::conversation_history(&self.db, &user_id, &other).await {
            Ok(history) => {
                println!(
                    "[WS:HISTORY] Sending {} messages for chat {} to connection {}",
                    history.len(),
                    conversation_id(&user_id, &other),
                    session.connection_id
                );
                self.send_event(&session.connection_id, &ServerEvent::ReceiveChatHistory(history)).await;
            }
            Err(e) => {
                println!("[WS:HISTORY] Failed to load history for {}: {}", user_id, e);
                self.send_error(session, RelayError::Persistence(e.to_string())).await;
            }
        }
    }

    /// Push one event onto a connection's outbound channel. Returns false if
    /// the connection is gone or its pump has shut down.
    async fn send_event(&self, connection_id: &str, event: &ServerEvent) -> bool {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                println!("[WS:SEND] Failed to encode event: {}", e);
                return false;
            }
        };
        let connections = self.connections.lock().await;
        match connections.get(connection_id) {
            Some(sender) => sender.send(Message::Text(json)).is_ok(),
            None => false,
        }
    }

    async fn send_error(&self, session: &Session, err: RelayError) {
        println!("[WS:ERROR] {} on connection {}: {}", err.code(), session.connection_id, err);
        self.send_event(
            &session.connection_id,
            &ServerEvent::Error(ErrorPayload { code: err.code().to_string(), message: err.to_string() }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::test_config;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    async fn test_relay() -> (ChatRelay, Arc<Database>, ServerConfig) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Arc::new(Database { pool });
        db.migrate().await.unwrap();
        let config = test_config();
        let relay = ChatRelay::new(db.clone(), config.clone(), PresenceRegistry::new());
        (relay, db, config)
    }

    async fn seed_user(db: &Database, id: &str, email: &str) {
        sqlx::query("INSERT INTO users (id, email, created_at, is_online) VALUES (?, ?, 0, 0)")
            .bind(id)
            .bind(email)
            .execute(&db.pool)
            .await
            .unwrap();
    }

    async fn attach_client(relay: &ChatRelay) -> (Session, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = relay.attach(tx).await;
        (session, rx)
    }

    async fn register(relay: &ChatRelay, session: &mut Session, user_id: &str, config: &ServerConfig) {
        let token = auth::issue_access_token(user_id, config).unwrap();
        let payload = RegisterUserPayload { token: Some(token), user_id: None };
        relay.handle_event(session, ClientEvent::RegisterUser(payload)).await;
        assert_eq!(session.user_id.as_deref(), Some(user_id));
    }

    fn text_payload(to: &str, text: &str) -> SendMessagePayload {
        SendMessagePayload {
            chat_id: None,
            sender_id: None,
            receiver_id: to.to_string(),
            content: Some(text.to_string()),
            multimedia: None,
            reply_to: None,
        }
    }

    fn next_event(rx: &mut mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
        match rx.try_recv() {
            Ok(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<Message>) {
        assert!(rx.try_recv().is_err(), "expected no pending frames");
    }

    async fn message_count(db: &Database) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM messages")
            .fetch_one(&db.pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn send_delivers_live_and_always_acks_the_sender() {
        let (relay, db, config) = test_relay().await;
        seed_user(&db, "user-a", "a@x.com").await;
        seed_user(&db, "user-b", "b@x.com").await;

        let (mut alice, mut alice_rx) = attach_client(&relay).await;
        let (mut bob, mut bob_rx) = attach_client(&relay).await;
        register(&relay, &mut alice, "user-a", &config).await;
        register(&relay, &mut bob, "user-b", &config).await;

        relay.handle_event(&mut alice, ClientEvent::SendMessage(text_payload("user-b", "hi bob"))).await;

        let delivered = next_event(&mut bob_rx);
        assert_eq!(delivered["event"], "receiveMessage");
        assert_eq!(delivered["data"]["content"], "hi bob");
        assert_eq!(delivered["data"]["senderId"], "user-a");

        let ack = next_event(&mut alice_rx);
        assert_eq!(ack["event"], "messageSent");
        // The ack carries the same durable record that was delivered
        assert_eq!(ack["data"]["id"], delivered["data"]["id"]);
        assert_eq!(message_count(&db).await, 1);
    }

    #[tokio::test]
    async fn offline_receiver_message_is_stored_for_later_fetch() {
        let (relay, db, config) = test_relay().await;
        seed_user(&db, "user-a", "a@x.com").await;
        seed_user(&db, "user-c", "c@x.com").await;

        let (mut alice, mut alice_rx) = attach_client(&relay).await;
        register(&relay, &mut alice, "user-a", &config).await;

        relay.handle_event(&mut alice, ClientEvent::SendMessage(text_payload("user-c", "are you there?"))).await;

        let ack = next_event(&mut alice_rx);
        assert_eq!(ack["event"], "messageSent");
        assert_no_event(&mut alice_rx);
        assert_eq!(message_count(&db).await, 1);

        // The receiver connects later and finds the message in the backlog
        let (mut carol, mut carol_rx) = attach_client(&relay).await;
        register(&relay, &mut carol, "user-c", &config).await;
        let payload = FetchChatHistoryPayload {
            sender_id: Some("user-a".to_string()),
            receiver_id: Some("user-c".to_string()),
        };
        relay.handle_event(&mut carol, ClientEvent::FetchChatHistory(payload)).await;

        let history = next_event(&mut carol_rx);
        assert_eq!(history["event"], "receiveChatHistory");
        assert_eq!(history["data"].as_array().unwrap().len(), 1);
        assert_eq!(history["data"][0]["content"], "are you there?");
    }

    #[tokio::test]
    async fn unregistered_sender_is_denied_without_a_write() {
        let (relay, db, _config) = test_relay().await;
        let (mut anon, mut anon_rx) = attach_client(&relay).await;

        relay.handle_event(&mut anon, ClientEvent::SendMessage(text_payload("user-b", "hello"))).await;

        let err = next_event(&mut anon_rx);
        assert_eq!(err["event"], "error");
        assert_eq!(err["data"]["code"], "AUTH");
        assert_eq!(err["data"]["message"], "Sender not registered");
        assert_eq!(message_count(&db).await, 0);
    }

    #[tokio::test]
    async fn register_requires_a_valid_token() {
        let (relay, _db, _config) = test_relay().await;
        let (mut session, mut rx) = attach_client(&relay).await;

        // Legacy bare-userId registration carries no token
        let payload = RegisterUserPayload { token: None, user_id: Some("user-a".to_string()) };
        relay.handle_event(&mut session, ClientEvent::RegisterUser(payload)).await;
        let err = next_event(&mut rx);
        assert_eq!(err["data"]["code"], "AUTH");
        assert!(session.user_id.is_none());

        let payload = RegisterUserPayload { token: Some("garbage".to_string()), user_id: None };
        relay.handle_event(&mut session, ClientEvent::RegisterUser(payload)).await;
        let err = next_event(&mut rx);
        assert_eq!(err["data"]["code"], "AUTH");
        assert!(session.user_id.is_none());
    }

    #[tokio::test]
    async fn blank_message_is_rejected_with_no_write() {
        let (relay, db, config) = test_relay().await;
        seed_user(&db, "user-a", "a@x.com").await;
        let (mut alice, mut alice_rx) = attach_client(&relay).await;
        register(&relay, &mut alice, "user-a", &config).await;

        let mut payload = text_payload("user-b", "");
        payload.content = Some("   ".to_string());
        relay.handle_event(&mut alice, ClientEvent::SendMessage(payload)).await;

        let err = next_event(&mut alice_rx);
        assert_eq!(err["event"], "error");
        assert_eq!(err["data"]["code"], "VALIDATION");
        assert_eq!(message_count(&db).await, 0);
    }

    #[tokio::test]
    async fn newest_connection_wins_delivery() {
        let (relay, db, config) = test_relay().await;
        seed_user(&db, "user-a", "a@x.com").await;
        seed_user(&db, "user-b", "b@x.com").await;

        let (mut first, mut first_rx) = attach_client(&relay).await;
        register(&relay, &mut first, "user-a", &config).await;
        let (mut second, mut second_rx) = attach_client(&relay).await;
        register(&relay, &mut second, "user-a", &config).await;

        let (mut bob, _bob_rx) = attach_client(&relay).await;
        register(&relay, &mut bob, "user-b", &config).await;
        relay.handle_event(&mut bob, ClientEvent::SendMessage(text_payload("user-a", "ping"))).await;

        let delivered = next_event(&mut second_rx);
        assert_eq!(delivered["event"], "receiveMessage");
        assert_no_event(&mut first_rx);
    }

    #[tokio::test]
    async fn stale_disconnect_keeps_the_replacement_reachable() {
        let (relay, db, config) = test_relay().await;
        seed_user(&db, "user-a", "a@x.com").await;

        let (mut first, _first_rx) = attach_client(&relay).await;
        register(&relay, &mut first, "user-a", &config).await;
        let (mut second, _second_rx) = attach_client(&relay).await;
        register(&relay, &mut second, "user-a", &config).await;

        // The displaced connection goes away late; the new binding survives
        relay.detach(&first).await;
        assert_eq!(
            relay.presence.lookup("user-a").await.as_deref(),
            Some(second.connection_id.as_str())
        );
        let online: i64 = sqlx::query_scalar("SELECT is_online FROM users WHERE id = 'user-a'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(online, 1);
    }

    #[tokio::test]
    async fn detach_unregisters_and_is_idempotent() {
        let (relay, db, config) = test_relay().await;
        seed_user(&db, "user-a", "a@x.com").await;

        let (mut alice, _alice_rx) = attach_client(&relay).await;
        register(&relay, &mut alice, "user-a", &config).await;
        assert!(relay.presence.lookup("user-a").await.is_some());

        relay.detach(&alice).await;
        assert!(relay.presence.lookup("user-a").await.is_none());
        let online: i64 = sqlx::query_scalar("SELECT is_online FROM users WHERE id = 'user-a'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(online, 0);

        // A second detach for the same session changes nothing
        relay.detach(&alice).await;
        assert!(relay.presence.lookup("user-a").await.is_none());
    }

    #[tokio::test]
    async fn join_chat_requires_registration_and_normalizes_scope() {
        let (relay, db, config) = test_relay().await;
        seed_user(&db, "user-a", "a@x.com").await;
        let (mut session, mut rx) = attach_client(&relay).await;

        let payload = JoinChatPayload { chat_id: None, peer_id: Some("user-b".to_string()) };
        relay.handle_event(&mut session, ClientEvent::JoinChat(payload)).await;
        let err = next_event(&mut rx);
        assert_eq!(err["data"]["code"], "AUTH");

        register(&relay, &mut session, "user-a", &config).await;
        let payload = JoinChatPayload { chat_id: None, peer_id: Some("user-b".to_string()) };
        relay.handle_event(&mut session, ClientEvent::JoinChat(payload)).await;
        assert_eq!(session.chat_id.as_deref(), Some("private:user-a-user-b"));

        // A raw peer id in the chatId slot is normalized the same way
        let payload = JoinChatPayload { chat_id: Some("user-c".to_string()), peer_id: None };
        relay.handle_event(&mut session, ClientEvent::JoinChat(payload)).await;
        assert_eq!(session.chat_id.as_deref(), Some("private:user-a-user-c"));
    }

    #[tokio::test]
    async fn malformed_known_event_earns_an_error_ack() {
        let (relay, _db, _config) = test_relay().await;
        let (mut session, mut rx) = attach_client(&relay).await;

        relay.handle_frame(&mut session, r#"{"event":"sendMessage","data":"oops"}"#).await;
        let err = next_event(&mut rx);
        assert_eq!(err["event"], "error");
        assert_eq!(err["data"]["code"], "VALIDATION");

        // Unknown events and non-envelope text are ignored without an ack
        relay.handle_frame(&mut session, r#"{"event":"typing","data":{}}"#).await;
        relay.handle_frame(&mut session, "not json at all").await;
        assert_no_event(&mut rx);
    }

    #[tokio::test]
    async fn messages_from_both_directions_share_one_backlog() {
        let (relay, db, config) = test_relay().await;
        seed_user(&db, "user-a", "a@x.com").await;
        seed_user(&db, "user-b", "b@x.com").await;

        let (mut alice, mut alice_rx) = attach_client(&relay).await;
        let (mut bob, mut bob_rx) = attach_client(&relay).await;
        register(&relay, &mut alice, "user-a", &config).await;
        register(&relay, &mut bob, "user-b", &config).await;

        relay.handle_event(&mut alice, ClientEvent::SendMessage(text_payload("user-b", "first"))).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        relay.handle_event(&mut bob, ClientEvent::SendMessage(text_payload("user-a", "second"))).await;

        // Drain live traffic before fetching
        while alice_rx.try_recv().is_ok() {}
        while bob_rx.try_recv().is_ok() {}

        let payload = FetchChatHistoryPayload {
            sender_id: Some("user-b".to_string()),
            receiver_id: Some("user-a".to_string()),
        };
        relay.handle_event(&mut alice, ClientEvent::FetchChatHistory(payload)).await;

        let history = next_event(&mut alice_rx);
        assert_eq!(history["event"], "receiveChatHistory");
        let entries = history["data"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["content"], "first");
        assert_eq!(entries[1]["content"], "second");
    }
}
