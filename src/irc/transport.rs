use secrecy::{ExposeSecret, SecretString};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Error Types
// ============================================================================

/// Errors crossing the wire boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket-level failure (connect, write, read)
    #[error("Connection error: {0}")]
    Io(#[from] std::io::Error),
    /// Connect or registration did not complete in time
    #[error("Connection timed out")]
    Timeout,
    /// The server closed the connection; callers reconnect and resume
    #[error("Disconnected from server")]
    Disconnected,
}

// ============================================================================
// Transport Seam
// ============================================================================

/// The dispatcher's view of the wire.
///
/// `send_line` delivers one line of text to one channel. `ensure_connected`
/// re-establishes the session after a reported disconnect. Everything else
/// about the protocol stays behind this trait.
pub trait Transport: Send + Sync + 'static {
    fn ensure_connected(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn send_line(
        &self,
        channel: &str,
        text: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

// ============================================================================
// IRC Client
// ============================================================================

/// Connection settings for [`IrcClient`].
///
/// Built from the loaded configuration; the password moves into a
/// `SecretString` here so it never sits in a plainly printable struct.
pub struct IrcSettings {
    pub server: String,
    pub port: u16,
    pub nick: String,
    pub password: Option<SecretString>,
    pub channels: Vec<String>,
}

impl IrcSettings {
    pub fn from_config(irc: &crate::config::IrcConfig, channels: Vec<String>) -> Self {
        Self {
            server: irc.server.clone(),
            port: irc.port,
            nick: irc.nick.clone(),
            password: irc.password.clone().map(SecretString::from),
            channels,
        }
    }
}

struct Connection {
    writer: Arc<Mutex<BufWriter<OwnedWriteHalf>>>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Line-oriented IRC client over plain TCP.
///
/// Registers with PASS/NICK/USER, waits for the server welcome (001),
/// joins the configured channels and spawns a background read loop that
/// answers PING and flags the connection dead on EOF. Message delivery is
/// a single PRIVMSG write per line.
pub struct IrcClient {
    settings: IrcSettings,
    conn: Mutex<Option<Connection>>,
}

impl IrcClient {
    /// Connect, register and join. Fails loudly; there is no point starting
    /// feed polls without a working announcement path.
    pub async fn connect(settings: IrcSettings) -> Result<Self, TransportError> {
        let conn = establish(&settings).await?;
        tracing::info!(
            server = %settings.server,
            port = settings.port,
            channels = settings.channels.len(),
            "Connected to IRC"
        );
        Ok(Self {
            settings,
            conn: Mutex::new(Some(conn)),
        })
    }
}

impl Transport for IrcClient {
    async fn ensure_connected(&self) -> Result<(), TransportError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.alive.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
        tracing::info!(server = %self.settings.server, "Reconnecting to IRC");
        // Dropping the old connection aborts its read loop.
        *guard = Some(establish(&self.settings).await?);
        Ok(())
    }

    async fn send_line(&self, channel: &str, text: &str) -> Result<(), TransportError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(TransportError::Disconnected)?;
        if !conn.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }

        // CR/LF never reaches the wire inside a message, so entry text can
        // not terminate the line early and smuggle a protocol command.
        let clean: String = text
            .chars()
            .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
            .collect();

        match send_raw(&conn.writer, &format!("PRIVMSG {} :{}", channel, clean)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                conn.alive.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

async fn establish(settings: &IrcSettings) -> Result<Connection, TransportError> {
    let stream = tokio::time::timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((settings.server.as_str(), settings.port)),
    )
    .await
    .map_err(|_| TransportError::Timeout)??;

    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(BufWriter::new(write_half)));
    let mut lines = BufReader::new(read_half).lines();

    // PASS must precede NICK/USER when a server password is set.
    if let Some(password) = &settings.password {
        send_raw(&writer, &format!("PASS {}", password.expose_secret())).await?;
    }
    let mut nick = settings.nick.clone();
    send_raw(&writer, &format!("NICK {}", nick)).await?;
    send_raw(
        &writer,
        &format!("USER {} 0 * :{}", settings.nick, settings.nick),
    )
    .await?;

    tokio::time::timeout(REGISTRATION_TIMEOUT, async {
        loop {
            let line = lines
                .next_line()
                .await?
                .ok_or(TransportError::Disconnected)?;
            if let Some(payload) = line.strip_prefix("PING") {
                send_raw(&writer, &format!("PONG{}", payload)).await?;
                continue;
            }
            let mut parts = line.split_whitespace();
            let _prefix = parts.next();
            match parts.next() {
                // RPL_WELCOME: registration complete
                Some("001") => return Ok::<(), TransportError>(()),
                // ERR_NICKNAMEINUSE: suffix and retry
                Some("433") => {
                    nick.push('_');
                    tracing::warn!(nick = %nick, "Nickname in use, retrying with suffix");
                    send_raw(&writer, &format!("NICK {}", nick)).await?;
                }
                _ => {}
            }
        }
    })
    .await
    .map_err(|_| TransportError::Timeout)??;

    for channel in &settings.channels {
        send_raw(&writer, &format!("JOIN {}", channel)).await?;
    }

    let alive = Arc::new(AtomicBool::new(true));
    let reader = tokio::spawn(read_loop(
        lines,
        Arc::clone(&writer),
        Arc::clone(&alive),
    ));

    Ok(Connection {
        writer,
        alive,
        reader,
    })
}

/// Background keepalive: answer server PINGs, flag the connection dead on
/// EOF or read error so the next send reports `Disconnected`.
async fn read_loop(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    writer: Arc<Mutex<BufWriter<OwnedWriteHalf>>>,
    alive: Arc<AtomicBool>,
) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(payload) = line.strip_prefix("PING") {
                    if send_raw(&writer, &format!("PONG{}", payload)).await.is_err() {
                        break;
                    }
                }
            }
            Ok(None) => {
                tracing::warn!("Server closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Read error on server connection");
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
}

async fn send_raw(
    writer: &Arc<Mutex<BufWriter<OwnedWriteHalf>>>,
    line: &str,
) -> Result<(), TransportError> {
    let mut w = writer.lock().await;
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\r\n").await?;
    w.flush().await?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn settings(addr: std::net::SocketAddr, password: Option<&str>) -> IrcSettings {
        IrcSettings {
            server: addr.ip().to_string(),
            port: addr.port(),
            nick: "feedwire".to_string(),
            password: password.map(|p| SecretString::from(p.to_string())),
            channels: vec!["#news".to_string()],
        }
    }

    /// Minimal server: accepts one client, replies 433 to the first NICK
    /// when asked to, welcomes on USER (or on the retried NICK), then
    /// records lines until the first PRIVMSG.
    async fn start_fake_server(
        reject_first_nick: bool,
    ) -> (std::net::SocketAddr, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let mut received = Vec::new();
            let mut nick_count = 0;
            while let Ok(Some(line)) = lines.next_line().await {
                received.push(line.clone());
                if line.starts_with("NICK") {
                    nick_count += 1;
                    if reject_first_nick && nick_count == 1 {
                        write_half
                            .write_all(b":fake 433 * feedwire :Nickname is already in use\r\n")
                            .await
                            .unwrap();
                    } else if reject_first_nick && nick_count == 2 {
                        write_half
                            .write_all(b":fake 001 feedwire_ :Welcome\r\n")
                            .await
                            .unwrap();
                    }
                }
                if line.starts_with("USER") && !reject_first_nick {
                    write_half
                        .write_all(b":fake 001 feedwire :Welcome\r\n")
                        .await
                        .unwrap();
                }
                if line.starts_with("PRIVMSG") {
                    break;
                }
            }
            received
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_connect_registers_joins_and_sends() {
        let (addr, server) = start_fake_server(false).await;

        let client = IrcClient::connect(settings(addr, None)).await.unwrap();
        client.send_line("#news", "hello there").await.unwrap();

        let received = server.await.unwrap();
        assert!(received.contains(&"NICK feedwire".to_string()));
        assert!(received.contains(&"USER feedwire 0 * :feedwire".to_string()));
        assert!(received.contains(&"JOIN #news".to_string()));
        assert_eq!(received.last().unwrap(), "PRIVMSG #news :hello there");
    }

    #[tokio::test]
    async fn test_password_sent_before_registration() {
        let (addr, server) = start_fake_server(false).await;

        let client = IrcClient::connect(settings(addr, Some("hunter2")))
            .await
            .unwrap();
        client.send_line("#news", "x").await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received[0], "PASS hunter2");
        let nick_pos = received.iter().position(|l| l.starts_with("NICK")).unwrap();
        assert!(nick_pos > 0);
    }

    #[tokio::test]
    async fn test_nick_collision_appends_suffix() {
        let (addr, server) = start_fake_server(true).await;

        let client = IrcClient::connect(settings(addr, None)).await.unwrap();
        client.send_line("#news", "x").await.unwrap();

        let received = server.await.unwrap();
        assert!(received.contains(&"NICK feedwire".to_string()));
        assert!(received.contains(&"NICK feedwire_".to_string()));
    }

    #[tokio::test]
    async fn test_crlf_in_text_cannot_inject_commands() {
        let (addr, server) = start_fake_server(false).await;

        let client = IrcClient::connect(settings(addr, None)).await.unwrap();
        client
            .send_line("#news", "title\r\nQUIT :gone")
            .await
            .unwrap();

        let received = server.await.unwrap();
        assert!(!received.iter().any(|l| l.starts_with("QUIT")));
        assert_eq!(
            received.last().unwrap(),
            "PRIVMSG #news :title  QUIT :gone"
        );
    }

    #[tokio::test]
    async fn test_send_fails_after_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.starts_with("USER") {
                    write_half
                        .write_all(b":fake 001 feedwire :Welcome\r\n")
                        .await
                        .unwrap();
                    break;
                }
            }
            // Connection drops here.
        });

        let client = IrcClient::connect(settings(addr, None)).await.unwrap();
        server.await.unwrap();

        // The read loop notices the close asynchronously; the kernel may
        // also buffer one write. Poll until a send reports failure.
        let mut failed = false;
        for _ in 0..50 {
            if client.send_line("#news", "x").await.is_err() {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(failed, "send_line should fail once the server is gone");
    }
}
