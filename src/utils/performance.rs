use chrono::Utc;
use sysinfo::System;
use std::{fs::File, fs::OpenOptions, io::Write, sync::Arc, time::Duration};
use tokio::time;
use crate::server::database::Database;
use crate::server::presence::PresenceRegistry;
use log::{info, error, warn};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(120);

// Opens the log in append mode; a fresh file gets the column header.
fn open_log(log_path: &str) -> std::io::Result<File> {
    let mut file = OpenOptions::new().create(true).append(true).open(log_path)?;
    if file.metadata()?.len() == 0 {
        writeln!(file, "# Chattify Server Performance Log")?;
        writeln!(file, "# Timestamp, Online_Users, Presence_Entries, Total_Messages, Conversations, CPU_Usage")?;
        info!("📊 Performance log initialized: {}", log_path);
    }
    Ok(file)
}

// A failed count shows up as -1 in the log rather than killing the sampler.
async fn count(db: &Database, what: &str, sql: &str) -> i64 {
    match sqlx::query_scalar::<_, i64>(sql).fetch_one(&db.pool).await {
        Ok(n) => n,
        Err(e) => {
            warn!("Performance count of {} failed: {}", what, e);
            -1
        }
    }
}

pub async fn start_performance_logger(db: Arc<Database>, presence: PresenceRegistry, log_path: &str) {
    let mut file = match open_log(log_path) {
        Ok(f) => f,
        Err(e) => {
            error!("Performance log '{}' unavailable: {}", log_path, e);
            return;
        }
    };
    let mut system = System::new_all();

    loop {
        system.refresh_all();
        let cpus = system.cpus();
        let cpu_usage = cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len().max(1) as f32;

        let online_users = count(&db, "online users", "SELECT COUNT(*) FROM users WHERE is_online = 1").await;
        let total_messages = count(&db, "messages", "SELECT COUNT(*) FROM messages").await;
        let conversations = count(&db, "conversations", "SELECT COUNT(*) FROM conversations").await;
        // Presence registry is the live view; the users table is the durable one
        let presence_entries = presence.online_count().await;

        info!("📊 Performance - Online Users: {}, Presence: {}, Messages: {}, Conversations: {}, CPU: {:.1}%",
            online_users, presence_entries, total_messages, conversations, cpu_usage);

        let row = format!(
            "{}, {}, {}, {}, {}, {:.1}%",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            online_users, presence_entries, total_messages, conversations, cpu_usage
        );
        if let Err(e) = writeln!(file, "{}", row).and_then(|_| file.flush()) {
            error!("Performance log write failed: {}", e);
        }

        time::sleep(SAMPLE_INTERVAL).await;
    }
}
