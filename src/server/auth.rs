use crate::server::database::Database;
use crate::server::config::ServerConfig;
use std::sync::Arc;
use sqlx::Row;
use argon2::{Argon2, password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString}};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use jsonwebtoken::{encode, decode, Header, EncodingKey, DecodingKey, Validation};

/// Claims carried by every access token. `sub` is the user id; expiry is
/// enforced by the decoder, so verification needs no database round trip.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
    pub iat: u64,
}

pub fn issue_access_token(user_id: &str, config: &ServerConfig) -> Result<String, jsonwebtoken::errors::Error> {
    let now = chrono::Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (now + chrono::Duration::minutes(config.jwt_expiry_minutes)).timestamp() as u64,
        iat: now.timestamp() as u64,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(config.jwt_secret.as_bytes()))
}

/// Returns the user id baked into a live access token, or None for anything
/// expired, tampered with, or otherwise unreadable.
pub fn verify_token(token: &str, config: &ServerConfig) -> Option<String> {
    match decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => Some(data.claims.sub),
        Err(e) => {
            println!("[AUTH] Access token rejected: {}", e);
            None
        }
    }
}

fn hash_password(password: &str, salt_length: u32) -> String {
    // Random salt of the configured length; it ends up embedded in the hash
    let mut salt_bytes = vec![0u8; salt_length as usize];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes).unwrap();
    let argon2 = Argon2::default();
    argon2.hash_password(password.as_bytes(), &salt)
        .unwrap()
        .to_string()
}

fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

fn generate_refresh_token() -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    let mut random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random);
    format!("{}-{:x}", uuid, md5::compute(random))
}

async fn store_refresh_token(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user_id: &str,
    config: &ServerConfig,
) -> Result<String, sqlx::Error> {
    let refresh_token = generate_refresh_token();
    let now = chrono::Utc::now().timestamp_millis();
    let expires = now + config.refresh_expiry_days * 24 * 60 * 60 * 1000;
    sqlx::query("INSERT INTO refresh_tokens (user_id, token, created_at, expires_at) VALUES (?, ?, ?, ?)")
        .bind(user_id)
        .bind(&refresh_token)
        .bind(now)
        .bind(expires)
        .execute(&mut **tx)
        .await?;
    Ok(refresh_token)
}

async fn record_session_event(db: &Database, user_id: &str, event_type: &str) {
    let now = chrono::Utc::now().timestamp_millis();
    let _ = sqlx::query("INSERT INTO session_events (user_id, event_type, created_at) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(event_type)
        .bind(now)
        .execute(&db.pool)
        .await;
}

pub async fn register(db: Arc<Database>, email: &str, password: &str, config: &ServerConfig) -> String {
    let email = email.trim().to_lowercase();
    println!("[AUTH] Register attempt: {}", email);
    if email.is_empty() || password.is_empty() {
        return "ERR: Email and password are required".to_string();
    }
    let user_id = uuid::Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().timestamp_millis();
    let password_hash = hash_password(password, config.argon2_salt_length);
    match db.pool.begin().await {
        Ok(mut tx) => {
            let res = sqlx::query("INSERT INTO users (id, email, created_at, is_online) VALUES (?, ?, ?, 0)")
                .bind(&user_id)
                .bind(&email)
                .bind(created_at)
                .execute(&mut *tx)
                .await;
            if let Err(e) = res {
                // UNIQUE constraint failure means the email is taken
                let err_str = e.to_string();
                println!("[AUTH] Registration failed for {}: {}", email, err_str);
                if err_str.to_lowercase().contains("unique") || err_str.to_lowercase().contains("constraint failed") {
                    return "ERR: Email already used".to_string();
                }
                return "ERR: Registration failed".to_string();
            }
            if let Err(e) = sqlx::query("INSERT INTO auth (user_id, password_hash) VALUES (?, ?)")
                .bind(&user_id)
                .bind(&password_hash)
                .execute(&mut *tx)
                .await
            {
                println!("[AUTH] Failed to store credentials for {}: {}", email, e);
                return "ERR: Registration failed".to_string();
            }
            let access_token = match issue_access_token(&user_id, config) {
                Ok(t) => t,
                Err(e) => {
                    println!("[AUTH] Failed to issue access token for {}: {}", email, e);
                    return "ERR: Registration failed".to_string();
                }
            };
            let refresh_token = match store_refresh_token(&mut tx, &user_id, config).await {
                Ok(t) => t,
                Err(e) => {
                    println!("[AUTH] Failed to store refresh token for {}: {}", email, e);
                    return "ERR: Registration failed".to_string();
                }
            };
            if let Err(e) = tx.commit().await {
                println!("[AUTH] Failed to commit registration for {}: {}", email, e);
                return "ERR: Registration failed".to_string();
            }
            record_session_event(&db, &user_id, "register").await;
            println!("[AUTH] Registered user {} (id={})", email, user_id);
            format!("OK: Registered as {} TOKEN: {} REFRESH: {}", email, access_token, refresh_token)
        }
        Err(e) => {
            println!("[AUTH] Registration failed for {}: {}", email, e);
            format!("ERR: Registration failed: {}", e)
        }
    }
}

pub async fn login(db: Arc<Database>, email: &str, password: &str, config: &ServerConfig) -> String {
    let email = email.trim().to_lowercase();
    println!("[AUTH] Login attempt: {}", email);
    let row = sqlx::query("SELECT users.id, password_hash FROM users JOIN auth ON users.id = auth.user_id WHERE email = ?")
        .bind(&email)
        .fetch_optional(&db.pool)
        .await;
    match row {
        Ok(Some(row)) => {
            let user_id: String = row.get("id");
            let password_hash: String = row.get("password_hash");
            if verify_password(&password_hash, password) {
                let access_token = match issue_access_token(&user_id, config) {
                    Ok(t) => t,
                    Err(e) => {
                        println!("[AUTH] Failed to issue access token for {}: {}", email, e);
                        return "ERR: Login failed".to_string();
                    }
                };
                // Refresh tokens accumulate, one per login; a second device
                // does not invalidate the first
                match db.pool.begin().await {
                    Ok(mut tx) => {
                        let refresh_token = match store_refresh_token(&mut tx, &user_id, config).await {
                            Ok(t) => t,
                            Err(e) => {
                                println!("[AUTH] Failed to store refresh token for {}: {}", email, e);
                                return "ERR: Login failed".to_string();
                            }
                        };
                        if let Err(e) = tx.commit().await {
                            println!("[AUTH] Failed to commit login for {}: {}", email, e);
                            return format!("ERR: Login failed: {}", e);
                        }
                        record_session_event(&db, &user_id, "login_success").await;
                        println!("[AUTH] Login success for {} (id={})", email, user_id);
                        format!("OK: Logged in as {} TOKEN: {} REFRESH: {}", email, access_token, refresh_token)
                    }
                    Err(e) => {
                        println!("[AUTH] Failed to start transaction for login {}: {}", email, e);
                        format!("ERR: Login failed: {}", e)
                    }
                }
            } else {
                println!("[AUTH] Login failed for {}: wrong password", email);
                "ERR: Wrong password".to_string()
            }
        }
        Ok(None) => {
            println!("[AUTH] Login failed for {}: user not found", email);
            "ERR: User not found".to_string()
        }
        Err(e) => {
            println!("[AUTH] Login failed for {}: {}", email, e);
            format!("ERR: Login failed: {}", e)
        }
    }
}

/// Exchange a live refresh token for a fresh access token.
pub async fn refresh(db: Arc<Database>, refresh_token: &str, config: &ServerConfig) -> String {
    let now = chrono::Utc::now().timestamp_millis();
    let row = sqlx::query("SELECT user_id FROM refresh_tokens WHERE token = ? AND expires_at > ?")
        .bind(refresh_token)
        .bind(now)
        .fetch_optional(&db.pool)
        .await;
    match row {
        Ok(Some(row)) => {
            let user_id: String = row.get("user_id");
            match issue_access_token(&user_id, config) {
                Ok(access_token) => {
                    record_session_event(&db, &user_id, "refresh").await;
                    println!("[AUTH] Issued refreshed access token for user {}", user_id);
                    format!("OK: TOKEN: {}", access_token)
                }
                Err(e) => {
                    println!("[AUTH] Failed to issue refreshed token for {}: {}", user_id, e);
                    "ERR: Refresh failed".to_string()
                }
            }
        }
        Ok(None) => {
            println!("[AUTH] Refresh failed: token unknown or expired");
            "ERR: Invalid or expired refresh token".to_string()
        }
        Err(e) => {
            println!("[AUTH] Refresh failed: {}", e);
            format!("ERR: Refresh failed: {}", e)
        }
    }
}

/// Logout revokes the presented refresh token only. Other devices holding
/// their own refresh tokens stay logged in.
pub async fn logout(db: Arc<Database>, refresh_token: &str) -> String {
    println!("[AUTH] logout called (token masked)");
    let row = sqlx::query("SELECT user_id FROM refresh_tokens WHERE token = ?")
        .bind(refresh_token)
        .fetch_optional(&db.pool)
        .await;
    match row {
        Ok(Some(row)) => {
            let user_id: String = row.get("user_id");
            match sqlx::query("DELETE FROM refresh_tokens WHERE token = ?")
                .bind(refresh_token)
                .execute(&db.pool)
                .await
            {
                Ok(r) => println!("[AUTH] Deleted {} refresh token rows for user {}", r.rows_affected(), user_id),
                Err(e) => println!("[AUTH] Failed deleting refresh token for {}: {}", user_id, e),
            }

            let remaining = sqlx::query("SELECT COUNT(1) as c FROM refresh_tokens WHERE user_id = ?")
                .bind(&user_id)
                .fetch_one(&db.pool)
                .await
                .ok()
                .and_then(|r| r.try_get::<i64, _>("c").ok())
                .unwrap_or(-1);
            println!("[AUTH][DB CHECK] logout completed: refresh_tokens_remaining={} for user {}", remaining, user_id);

            record_session_event(&db, &user_id, "logout").await;
            println!("[AUTH] Logout success for user_id={}", user_id);
            "OK: Logged out".to_string()
        }
        Ok(None) => {
            println!("[AUTH] Logout failed: token not found");
            "ERR: Session not found".to_string()
        }
        Err(e) => {
            println!("[AUTH] Logout failed: {}", e);
            format!("ERR: Logout failed: {}", e)
        }
    }
}

/// Drops expired refresh tokens. Idempotent and safe to run periodically.
pub async fn cleanup_expired_tokens(db: Arc<Database>) {
    let now = chrono::Utc::now().timestamp_millis();
    match sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= ?")
        .bind(now)
        .execute(&db.pool)
        .await
    {
        Ok(res) => println!("[AUTH] Cleaned up {} expired refresh tokens", res.rows_affected()),
        Err(e) => println!("[AUTH] Failed to cleanup refresh tokens: {}", e),
    }
}
