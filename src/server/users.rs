use crate::common::models::User;
use crate::server::database::Database;
use std::sync::Arc;
use sqlx::Row;

/// Resolve a user identifier to a user id. Accepts either the id itself or
/// the account email, so command-line callers can address people by email
/// while the relay always works with ids.
pub async fn resolve_user(db: &Database, ident: &str) -> Option<String> {
    let row = sqlx::query("SELECT id FROM users WHERE id = ? OR email = ?")
        .bind(ident)
        .bind(ident)
        .fetch_optional(&db.pool)
        .await
        .ok()?;
    row.map(|r| r.get::<String, _>("id"))
}

pub async fn list_online(db: Arc<Database>) -> String {
    println!("[USERS] Listing online users");
    let rows = sqlx::query("SELECT email FROM users WHERE is_online = 1 ORDER BY email")
        .fetch_all(&db.pool)
        .await;
    match rows {
        Ok(rows) => {
            let users: Vec<String> = rows.iter().map(|r| r.get::<String, _>("email")).collect();
            format!("OK: Online users: {}", users.join(", "))
        }
        Err(e) => {
            println!("[USERS] Error listing online users: {}", e);
            format!("ERR: {}", e)
        }
    }
}

/// Directory listing, one `id email` pair per line so callers can map an
/// address book entry to the id the relay expects.
pub async fn list_all(db: Arc<Database>, exclude_user_id: Option<&str>) -> String {
    println!("[USERS] Listing all users");
    let rows = sqlx::query("SELECT id, email FROM users ORDER BY email")
        .fetch_all(&db.pool)
        .await;
    match rows {
        Ok(rows) => {
            let mut users: Vec<(String, String)> = rows
                .iter()
                .map(|r| (r.get::<String, _>("id"), r.get::<String, _>("email")))
                .collect();
            if let Some(exclude) = exclude_user_id {
                users.retain(|(id, _)| id != exclude);
            }
            let lines: Vec<String> = users.iter().map(|(id, email)| format!("{} {}", id, email)).collect();
            format!("OK: Users:\n{}", lines.join("\n"))
        }
        Err(e) => {
            println!("[USERS] Error listing all users: {}", e);
            format!("ERR: {}", e)
        }
    }
}

pub async fn profile(db: Arc<Database>, ident: &str) -> String {
    let user_id = match resolve_user(&db, ident).await {
        Some(id) => id,
        None => return "ERR: User not found".to_string(),
    };
    let row = sqlx::query_as::<_, User>(
        "SELECT id, email, bio, avatar_url, contact, created_at, is_online FROM users WHERE id = ?",
    )
    .bind(&user_id)
    .fetch_optional(&db.pool)
    .await;
    match row {
        Ok(Some(user)) => format!(
            "OK: Profile: id={} email={} bio={} avatar={} contact={} online={}",
            user.id,
            user.email,
            user.bio.unwrap_or_else(|| "-".to_string()),
            user.avatar_url.unwrap_or_else(|| "-".to_string()),
            user.contact.unwrap_or_else(|| "-".to_string()),
            user.is_online as u8
        ),
        Ok(None) => "ERR: User not found".to_string(),
        Err(e) => format!("ERR: DB error: {}", e),
    }
}

// HELP
pub async fn help() -> String {
    let help = "Available commands:\n\
    /register <email> <password>\n\
    /login <email> <password>\n\
    /refresh_token <refresh_token>\n\
    /logout <refresh_token>\n\
    /validate_token <access_token>\n\
    /users <access_token>\n\
    /online_users\n\
    /profile <access_token> <user_id|email>\n\
    /send_private_message <access_token> <user_id|email> <message>\n\
    /send_private_file <access_token> <user_id|email> <url> [caption]\n\
    /get_private_messages <access_token> <user_id|email>\n\
    /help\n\
    /quit\n";
    help.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

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

    async fn seed_user(db: &Database, id: &str, email: &str) {
        sqlx::query("INSERT INTO users (id, email, created_at, is_online) VALUES (?, ?, 0, 0)")
            .bind(id)
            .bind(email)
            .execute(&db.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resolves_by_id_and_by_email() {
        let db = test_db().await;
        seed_user(&db, "u1", "alice@example.com").await;
        assert_eq!(resolve_user(&db, "u1").await.as_deref(), Some("u1"));
        assert_eq!(resolve_user(&db, "alice@example.com").await.as_deref(), Some("u1"));
        assert_eq!(resolve_user(&db, "missing").await, None);
    }

    #[tokio::test]
    async fn directory_listing_can_exclude_the_caller() {
        let db = test_db().await;
        seed_user(&db, "u1", "alice@example.com").await;
        seed_user(&db, "u2", "bob@example.com").await;
        let resp = list_all(db.clone(), Some("u1")).await;
        assert!(resp.starts_with("OK: Users:"), "{}", resp);
        assert!(resp.contains("u2 bob@example.com"));
        assert!(!resp.contains("alice@example.com"));
    }

    #[tokio::test]
    async fn profile_reports_missing_users() {
        let db = test_db().await;
        assert_eq!(profile(db.clone(), "ghost").await, "ERR: User not found");
        seed_user(&db, "u1", "alice@example.com").await;
        let resp = profile(db.clone(), "alice@example.com").await;
        assert!(resp.contains("id=u1"), "{}", resp);
        assert!(resp.contains("bio=-"), "{}", resp);
    }
}
