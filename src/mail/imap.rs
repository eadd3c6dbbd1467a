//! IMAP adapter for [`MailSource`].
//!
//! Speaks just enough IMAP4rev1 over a blocking socket: LOGIN, SELECT,
//! UID SEARCH, UID FETCH BODY.PEEK[], UID STORE, UID MOVE (or COPY plus
//! EXPUNGE) and LOGOUT. Socket work runs under `spawn_blocking`; the
//! connection is moved into the blocking task and handed back afterwards.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_MAX_MESSAGE_BYTES, MailboxConfig};
use crate::error::SourceError;
use crate::mail::message::Message;
use crate::mail::source::{MailSession, MailSource};

/// Anything the IMAP client can talk through (TLS stream, plain TCP, test script).
trait ImapStream: Read + Write + Send {}
impl<T: Read + Write + Send> ImapStream for T {}

/// Opens IMAP sessions against the configured mailbox.
#[derive(Debug, Clone)]
pub struct ImapSource {
    config: Arc<MailboxConfig>,
}

impl ImapSource {
    pub fn new(config: MailboxConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl MailSource for ImapSource {
    fn describe(&self) -> String {
        format!(
            "imap{}://{}@{}:{}/{}",
            if self.config.imap_tls { "s" } else { "" },
            self.config.username,
            self.config.imap_host,
            self.config.imap_port,
            self.config.folder
        )
    }

    async fn open(&self) -> Result<Box<dyn MailSession>, SourceError> {
        let cfg = Arc::clone(&self.config);
        let conn = tokio::task::spawn_blocking(move || ImapConnection::open(&cfg))
            .await
            .map_err(|e| SourceError::Transient(format!("IMAP task failed: {e}")))??;
        info!(host = %self.config.imap_host, folder = %self.config.folder, "IMAP session opened");
        Ok(Box::new(ImapSession {
            config: Arc::clone(&self.config),
            conn: Some(conn),
        }))
    }
}

/// One authenticated IMAP session with the folder selected.
///
/// A transient socket error leaves the protocol stream in an unknown state,
/// so the connection is dropped and the next operation reconnects.
pub struct ImapSession {
    config: Arc<MailboxConfig>,
    conn: Option<ImapConnection>,
}

impl ImapSession {
    async fn with_connection<T, F>(&mut self, op: F) -> Result<T, SourceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapConnection) -> Result<T, SourceError> + Send + 'static,
    {
        let existing = self.conn.take();
        let cfg = Arc::clone(&self.config);
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let mut conn = match existing {
                Some(conn) => conn,
                None => {
                    debug!("Reconnecting IMAP session");
                    match ImapConnection::open(&cfg) {
                        Ok(conn) => conn,
                        Err(e) => return (None, Err(reconnect_error(e))),
                    }
                }
            };
            let result = op(&mut conn);
            match &result {
                Err(e) if e.is_transient() => (None, result),
                _ => (Some(conn), result),
            }
        })
        .await
        .map_err(|e| SourceError::Transient(format!("IMAP task failed: {e}")))?;
        self.conn = conn;
        result
    }
}

#[async_trait]
impl MailSession for ImapSession {
    async fn search_unread(&mut self) -> Result<Vec<u32>, SourceError> {
        self.with_connection(|conn| {
            let resp = conn.command("UID SEARCH UNSEEN")?;
            Ok(parse_search(&resp.untagged))
        })
        .await
    }

    async fn fetch(&mut self, uid: u32) -> Result<Option<Message>, SourceError> {
        self.with_connection(move |conn| {
            let resp = conn.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
            Ok(fetched_message(uid, &resp))
        })
        .await
    }

    async fn acknowledge(&mut self, uid: u32) -> Result<(), SourceError> {
        self.with_connection(move |conn| {
            conn.command(&format!("UID STORE {uid} +FLAGS.SILENT (\\Seen)"))?;
            Ok(())
        })
        .await
    }

    async fn move_to(&mut self, uid: u32, folder: &str) -> Result<(), SourceError> {
        let folder = folder.to_string();
        self.with_connection(move |conn| conn.move_message(uid, &folder))
            .await
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || {
            if let Err(e) = conn.command("LOGOUT") {
                debug!(error = %e, "LOGOUT failed, dropping connection anyway");
            }
        })
        .await
        .map_err(|e| SourceError::Transient(format!("IMAP task failed: {e}")))?;
        debug!("IMAP session closed");
        Ok(())
    }
}

/// A reconnect inside a running session is retried like any other
/// transient failure. Only the initial open treats an unreachable server as
/// fatal.
fn reconnect_error(e: SourceError) -> SourceError {
    match e {
        SourceError::Connection { host, port, reason } => {
            SourceError::Transient(format!("reconnect to {host}:{port} failed: {reason}"))
        }
        other => other,
    }
}

/// The message in a `UID FETCH` response. Oversized and unparseable bodies
/// are skipped and stay unread.
fn fetched_message(uid: u32, resp: &Response) -> Option<Message> {
    if let Some(size) = resp.oversized.first() {
        warn!(uid, size, "Message exceeds the size limit, skipping");
        return None;
    }
    let raw = resp.literals.first()?;
    let parsed = Message::parse(uid, raw);
    if parsed.is_none() {
        warn!(uid, size = raw.len(), "Unparseable message body, skipping");
    }
    parsed
}

/// Result of one tagged command.
#[derive(Debug, Default)]
struct Response {
    /// Untagged `*` lines, without CRLF.
    untagged: Vec<String>,
    /// Literal payloads (`{n}` blocks) in arrival order.
    literals: Vec<Vec<u8>>,
    /// Sizes of literals that were discarded for exceeding the limit.
    oversized: Vec<usize>,
}

/// Blocking IMAP protocol connection.
struct ImapConnection {
    reader: BufReader<Box<dyn ImapStream>>,
    next_tag: u32,
    /// Larger literals are read off the wire and discarded.
    max_literal: usize,
}

impl ImapConnection {
    /// Connect, read the greeting, LOGIN and SELECT the folder.
    fn open(config: &MailboxConfig) -> Result<Self, SourceError> {
        let stream = connect(config)?;
        let mut conn = Self::from_stream(stream);
        conn.max_literal = config.max_message_bytes;
        conn.handshake(config)?;
        Ok(conn)
    }

    fn from_stream(stream: Box<dyn ImapStream>) -> Self {
        Self {
            reader: BufReader::new(stream),
            next_tag: 1,
            max_literal: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    fn handshake(&mut self, config: &MailboxConfig) -> Result<(), SourceError> {
        let greeting = self.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(SourceError::Connection {
                host: config.imap_host.clone(),
                port: config.imap_port,
                reason: format!("unexpected greeting: {}", greeting.trim_end()),
            });
        }

        let login = format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        );
        match self.command(&login) {
            Ok(_) => {}
            Err(SourceError::Protocol(reason)) => {
                return Err(SourceError::Auth {
                    user: config.username.clone(),
                    reason,
                });
            }
            Err(e) => return Err(e),
        }

        self.command(&format!("SELECT {}", quote(&config.folder)))?;
        Ok(())
    }

    /// Send a command and collect everything up to its tagged completion.
    /// `NO` and `BAD` completions become [`SourceError::Protocol`].
    fn command(&mut self, cmd: &str) -> Result<Response, SourceError> {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;

        let stream = self.reader.get_mut();
        stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        stream.flush()?;

        let mut resp = Response::default();
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.strip_prefix(&tag) {
                let status = status.trim();
                if status.starts_with("OK") {
                    return Ok(resp);
                }
                let verb = cmd.split_whitespace().next().unwrap_or(cmd);
                return Err(SourceError::Protocol(format!("{verb} rejected: {status}")));
            }

            if let Some(len) = literal_len(&line) {
                if len > self.max_literal {
                    let discarded = io::copy(&mut self.reader.by_ref().take(len as u64), &mut io::sink())?;
                    if discarded < len as u64 {
                        return Err(SourceError::Transient("IMAP connection closed inside a literal".into()));
                    }
                    resp.oversized.push(len);
                } else {
                    let mut literal = vec![0u8; len];
                    self.reader.read_exact(&mut literal)?;
                    resp.literals.push(literal);
                }
                // Remainder of the untagged response after the literal.
                let _ = self.read_line()?;
            }
            if line.starts_with('*') {
                resp.untagged.push(line.trim_end().to_string());
            }
        }
    }

    /// `UID MOVE` where the server supports it, otherwise COPY, flag
    /// `\Deleted` and `UID EXPUNGE`.
    fn move_message(&mut self, uid: u32, folder: &str) -> Result<(), SourceError> {
        let target = quote(folder);
        match self.command(&format!("UID MOVE {uid} {target}")) {
            Ok(_) => return Ok(()),
            Err(SourceError::Protocol(reason)) => {
                debug!(uid, %reason, "UID MOVE unavailable, copying instead");
            }
            Err(e) => return Err(e),
        }
        self.command(&format!("UID COPY {uid} {target}"))?;
        self.command(&format!("UID STORE {uid} +FLAGS.SILENT (\\Deleted)"))?;
        match self.command(&format!("UID EXPUNGE {uid}")) {
            Ok(_) => Ok(()),
            // Without UIDPLUS the original stays flagged until the next expunge.
            Err(SourceError::Protocol(reason)) => {
                debug!(uid, %reason, "UID EXPUNGE unavailable, leaving message flagged deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn read_line(&mut self) -> Result<String, SourceError> {
        let mut buf = Vec::new();
        let n = self.reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(SourceError::Transient("IMAP connection closed".into()));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

fn connect(config: &MailboxConfig) -> Result<Box<dyn ImapStream>, SourceError> {
    let unreachable = |reason: String| SourceError::Connection {
        host: config.imap_host.clone(),
        port: config.imap_port,
        reason,
    };

    let addr = (config.imap_host.as_str(), config.imap_port)
        .to_socket_addrs()
        .map_err(|e| unreachable(e.to_string()))?
        .next()
        .ok_or_else(|| unreachable("no address resolved".into()))?;
    let tcp = TcpStream::connect_timeout(&addr, config.io_timeout)
        .map_err(|e| unreachable(e.to_string()))?;
    tcp.set_read_timeout(Some(config.io_timeout))?;
    tcp.set_write_timeout(Some(config.io_timeout))?;

    if !config.imap_tls {
        return Ok(Box::new(tcp));
    }

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())
        .map_err(|e| unreachable(e.to_string()))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| unreachable(e.to_string()))?;
    Ok(Box::new(rustls::StreamOwned::new(conn, tcp)))
}

/// Quote a string for use as an IMAP astring.
fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Size of a literal announced at the end of a line (`... {123}\r\n`).
fn literal_len(line: &str) -> Option<usize> {
    let trimmed = line.trim_end();
    let inner = trimmed.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// UIDs from `* SEARCH` lines, ascending.
fn parse_search(untagged: &[String]) -> Vec<u32> {
    let mut uids: Vec<u32> = untagged
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect();
    uids.sort_unstable();
    uids.dedup();
    uids
}
