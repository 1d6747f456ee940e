use chattify::server::database::Database;
use sqlx::Row;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let db_path = "sqlite:data/chattify.db";
    println!("Connecting to {}", db_path);
    let db = Database::connect(db_path).await?;

    println!("\n-- users --");
    let rows = sqlx::query("SELECT id, email, created_at, is_online FROM users")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let email: String = r.try_get("email").unwrap_or_default();
        let created_at: i64 = r.try_get("created_at").unwrap_or(0);
        let is_online: i64 = r.try_get("is_online").unwrap_or(0);
        println!("id={} email={} created_at={} is_online={}", id, email, created_at, is_online);
    }

    println!("\n-- conversations --");
    let rows = sqlx::query("SELECT chat_id, user_a, user_b, last_message_at FROM conversations ORDER BY last_message_at DESC")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let chat_id: String = r.try_get("chat_id").unwrap_or_default();
        let user_a: String = r.try_get("user_a").unwrap_or_default();
        let user_b: String = r.try_get("user_b").unwrap_or_default();
        let last_message_at: i64 = r.try_get("last_message_at").unwrap_or(0);
        println!("chat_id={} user_a={} user_b={} last_message_at={}", chat_id, user_a, user_b, last_message_at);
    }

    println!("\n-- messages (last 10) --");
    let rows = sqlx::query("SELECT id, chat_id, sender_id, content, multimedia, sent_at FROM messages ORDER BY sent_at DESC LIMIT 10")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let chat_id: String = r.try_get("chat_id").unwrap_or_default();
        let sender_id: String = r.try_get("sender_id").unwrap_or_default();
        let content: String = r.try_get("content").unwrap_or_default();
        let multimedia: String = r.try_get("multimedia").unwrap_or_default();
        let sent_at: i64 = r.try_get("sent_at").unwrap_or(0);
        println!("id={} chat_id={} sender_id={} content_len={} multimedia={} sent_at={}",
                 id, chat_id, sender_id, content.len(), multimedia, sent_at);
    }

    Ok(())
}
