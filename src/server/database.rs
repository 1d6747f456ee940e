use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

// The bare file path behind a sqlite URL, with scheme prefix and query
// parameters stripped.
fn sqlite_file_path(database_url: &str) -> &str {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    path.split('?').next().unwrap_or(path)
}

// SQLite will not create missing directories on its own.
fn ensure_parent_dir(file_path: &str) -> Result<(), sqlx::Error> {
    if file_path == ":memory:" {
        return Ok(());
    }
    if let Some(parent) = std::path::Path::new(file_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                println!("❌ Could not create {:?}: {}", parent, e);
                sqlx::Error::Configuration(Box::new(e))
            })?;
            println!("📁 Created database directory: {:?}", parent);
        }
    }
    Ok(())
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        println!("🔗 Connecting to database: {}", database_url);
        ensure_parent_dir(sqlite_file_path(database_url))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| {
                println!("❌ SQLite connection failed: {}", e);
                e
            })?;

        println!("✅ Database connection established");
        Ok(Self { pool })
    }

    /// Bounded retry for the first connection at boot. A store that is slow
    /// to come up gets `attempts` tries with a growing pause between them;
    /// only after the last failure does the error reach the caller.
    pub async fn connect_with_retry(database_url: &str, attempts: u32) -> Result<Self, sqlx::Error> {
        let mut last_err = None;
        for attempt in 1..=attempts {
            match Self::connect(database_url).await {
                Ok(db) => return Ok(db),
                Err(e) => {
                    log::warn!("Database connection attempt {}/{} failed: {}", attempt, attempts, e);
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(sqlx::Error::PoolClosed))
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Users
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE NOT NULL,
                bio TEXT,
                avatar_url TEXT,
                contact TEXT,
                created_at INTEGER NOT NULL,
                is_online INTEGER NOT NULL DEFAULT 0
            );
        "#).execute(&self.pool).await?;

        // Auth (password hashes live apart from the profile row)
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS auth (
                user_id TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Refresh tokens; a user may hold several at once (one per device)
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS refresh_tokens (
                user_id TEXT NOT NULL,
                token TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Messages (sent_at is epoch milliseconds)
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                content TEXT,
                multimedia TEXT,
                reply_to TEXT,
                sent_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Conversations: denormalized per-pair summary, refreshed after each send
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS conversations (
                chat_id TEXT PRIMARY KEY,
                user_a TEXT NOT NULL,
                user_b TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_message_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Session events (register, login_success, logout, refresh)
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS session_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        Ok(())
    }
}
