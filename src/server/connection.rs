use crate::server::{database::Database, auth, users, messages};
use crate::server::config::ServerConfig;
use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

// Optional TLS
use tokio_rustls::TlsAcceptor;

/// The line-oriented command listener. One command per line, one response per
/// command; auth-protected commands take an access token as their first
/// argument. Real-time traffic lives on the relay, not here.
pub struct Server {
    pub db: Arc<Database>,
    pub config: ServerConfig,
}

fn load_certificates(path: &str) -> anyhow::Result<Vec<rustls::Certificate>> {
    let file = std::fs::File::open(path).with_context(|| format!("cannot open certificate file {}", path))?;
    let chain = rustls_pemfile::certs(&mut std::io::BufReader::new(file))?
        .into_iter()
        .map(rustls::Certificate)
        .collect::<Vec<_>>();
    anyhow::ensure!(!chain.is_empty(), "{} holds no certificates", path);
    Ok(chain)
}

// PKCS8 first; RSA keys rendered by older openssl builds as a fallback.
fn load_private_key(path: &str) -> anyhow::Result<rustls::PrivateKey> {
    let file = std::fs::File::open(path).with_context(|| format!("cannot open private key file {}", path))?;
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut std::io::BufReader::new(file))?;
    if keys.is_empty() {
        let file = std::fs::File::open(path)?;
        keys = rustls_pemfile::rsa_private_keys(&mut std::io::BufReader::new(file))?;
    }
    anyhow::ensure!(!keys.is_empty(), "{} holds no private keys", path);
    Ok(rustls::PrivateKey(keys.remove(0)))
}

impl Server {
    // TLS is opt-in; cert and key locations come from the environment so
    // deployments can rotate them without a config change
    fn setup_tls_acceptor(&self) -> anyhow::Result<Option<TlsAcceptor>> {
        if !self.config.enable_tls {
            println!("[TLS] Disabled; the command listener speaks plain TCP");
            return Ok(None);
        }
        let cert_path = std::env::var("TLS_CERT_PATH").context("ENABLE_TLS is set but TLS_CERT_PATH is not")?;
        let key_path = std::env::var("TLS_KEY_PATH").context("ENABLE_TLS is set but TLS_KEY_PATH is not")?;

        let chain = load_certificates(&cert_path)?;
        println!("[TLS] Loaded {} certificate(s) from {}", chain.len(), cert_path);
        let key = load_private_key(&key_path)?;
        println!("[TLS] Loaded private key from {}", key_path);

        let tls = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .context("certificate chain and key do not form a usable identity")?;
        println!("[TLS] Ready");
        Ok(Some(TlsAcceptor::from(Arc::new(tls))))
    }

    pub async fn run(&self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        println!("[SERVER] Command listener on {}", addr);

        // A broken TLS setup degrades to plain TCP instead of refusing to boot
        let tls_acceptor = self.setup_tls_acceptor().unwrap_or_else(|e| {
            println!("[TLS] Setup failed ({}); continuing on plain TCP", e);
            None
        });

        loop {
            let (stream, peer) = listener.accept().await?;
            println!("[SERVER] Accepted {}", peer);
            let db = self.db.clone();
            let config = self.config.clone();
            let acceptor = tls_acceptor.clone();
            tokio::spawn(async move {
                let result = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => handle_client(db, config, tls_stream, peer).await,
                        Err(e) => {
                            println!("[TLS] Handshake with {} failed: {}", peer, e);
                            return;
                        }
                    },
                    None => handle_client(db, config, stream, peer).await,
                };
                if let Err(e) = result {
                    println!("[SERVER] Session {} ended with error: {}", peer, e);
                }
            });
        }
    }

    pub async fn handle_command(&self, cmd: &str, args: &[&str]) -> String {
        println!("[SERVER] Dispatching {} ({} args)", cmd, args.len());
        match cmd {
            // SYSTEM
            "/help" => users::help().await,
            "/quit" => "OK: Disconnected".to_string(),
            // AUTH
            "/register" if args.len() == 2 => auth::register(self.db.clone(), args[0], args[1], &self.config).await,
            "/login" if args.len() == 2 => auth::login(self.db.clone(), args[0], args[1], &self.config).await,
            "/refresh_token" if args.len() == 1 => auth::refresh(self.db.clone(), args[0], &self.config).await,
            "/logout" if args.len() == 1 => auth::logout(self.db.clone(), args[0]).await,
            "/validate_token" if args.len() == 1 => match auth::verify_token(args[0], &self.config) {
                Some(uid) => format!("OK: {}", uid),
                None => "ERR: Invalid or expired token".to_string(),
            },
            // USERS
            "/users" if args.len() == 1 => match auth::verify_token(args[0], &self.config) {
                Some(uid) => users::list_all(self.db.clone(), Some(&uid)).await,
                None => "ERR: Invalid or expired token".to_string(),
            },
            "/online_users" => users::list_online(self.db.clone()).await,
            "/profile" if args.len() == 2 => match auth::verify_token(args[0], &self.config) {
                Some(_) => users::profile(self.db.clone(), args[1]).await,
                None => "ERR: Invalid or expired token".to_string(),
            },
            // MESSAGES
            "/send_private_message" if args.len() >= 3 => {
                let body = args[2..].join(" ");
                messages::send_private_message(self.db.clone(), args[0], args[1], &body, &self.config).await
            }
            "/send_private_file" if args.len() >= 3 => {
                let caption = if args.len() > 3 { Some(args[3..].join(" ")) } else { None };
                messages::send_private_file(self.db.clone(), args[0], args[1], args[2], caption.as_deref(), &self.config).await
            }
            "/get_private_messages" if args.len() == 2 => {
                messages::get_private_messages(self.db.clone(), args[0], args[1], &self.config).await
            }
            _ => "ERR: Unknown or invalid command".to_string(),
        }
    }
}

// One handler serves plain and TLS sockets; the split halves only need the
// async IO traits.
async fn handle_client<S>(db: Arc<Database>, config: ServerConfig, stream: S, peer: std::net::SocketAddr) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);
    let server = Server { db, config };
    let mut request = String::new();
    loop {
        request.clear();
        if reader.read_line(&mut request).await? == 0 {
            println!("[CONN] [{}] closed the connection", peer);
            break;
        }
        let trimmed = request.trim();
        println!("[CONN:RAW] [{}] <- '{}'", peer, trimmed);
        if trimmed.is_empty() {
            continue;
        }
        let mut fields = trimmed.split_whitespace();
        let cmd = fields.next().unwrap_or("");
        let args: Vec<&str> = fields.collect();
        let response = server.handle_command(cmd, &args).await;
        println!("[CONN] [{}] -> {}", peer, response);
        writer.write_all(format!("{}\n", response).as_bytes()).await?;
        writer.flush().await?;
        if cmd == "/quit" {
            println!("[CONN] [{}] quit", peer);
            break;
        }
    }
    Ok(())
}
