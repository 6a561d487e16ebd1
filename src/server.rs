use crate::config::Opt;
use crate::error::SmtpError;
use crate::registry::TenantRegistry;
use crate::session::{Backend, SmtpSession};
use crate::utils::Logger;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpListener;
use tokio::sync::OnceCell;
use tokio::time;

/// RFC 5321 text line limit, CRLF excluded
const TEXT_LINE_MAX_LENGTH: usize = 998;

/// Outcome of an AUTH exchange: the identity and credential, or the reply
/// explaining why none could be read.
type Credentials = std::result::Result<(String, String), &'static str>;

enum Flow {
    Continue,
    Close,
}

/// One client connection: framed I/O plus the session once authenticated.
struct Connection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    peer: SocketAddr,
    read_timeout: Duration,
    write_timeout: Duration,
    line_limit: u64,
    helo: Option<String>,
    session: Option<SmtpSession>,
}

impl<S: AsyncRead + AsyncWrite> Connection<S> {
    fn new(stream: S, peer: SocketAddr, opt: &Opt) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            peer,
            read_timeout: opt.read_timeout(),
            write_timeout: opt.write_timeout(),
            line_limit: opt.max_message_bytes.max(TEXT_LINE_MAX_LENGTH) as u64 + 2,
            helo: None,
            session: None,
        }
    }

    /// Next line without its line ending, `None` at end of stream.
    async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let mut limited = (&mut self.reader).take(self.line_limit);
        let read = time::timeout(self.read_timeout, limited.read_until(b'\n', &mut line))
            .await
            .context("Read timed out")??;

        if read == 0 {
            return Ok(None);
        }
        while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
            line.pop();
        }
        Ok(Some(line))
    }

    async fn write(&mut self, reply: &str) -> Result<()> {
        let writer = &mut self.writer;
        time::timeout(self.write_timeout, async move {
            writer.write_all(reply.as_bytes()).await?;
            writer.flush().await
        })
        .await
        .context("Write timed out")??;
        Ok(())
    }
}

/// The SMTP listener shared by every tenant.
pub struct Server {
    pub opt: Opt,
    backend: Backend,
    logger: Logger,
    started: OnceCell<SocketAddr>,
}

impl Server {
    pub fn new(opt: Opt, registry: Arc<TenantRegistry>, logger: Logger) -> Self {
        Self {
            opt,
            backend: Backend::new(registry),
            logger,
            started: OnceCell::new(),
        }
    }

    /// Binds the listener and spawns the accept loop.
    ///
    /// Only the first call binds; every call returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let addr = self
            .started
            .get_or_try_init(|| async {
                let addr = self.opt.listen_addr();
                let listener = TcpListener::bind(&addr)
                    .await
                    .with_context(|| format!("Failed to bind to {}", addr))?;
                let local_addr = listener.local_addr()?;

                self.logger
                    .log(&local_addr, &format!("Listening on {}", local_addr))
                    .await;

                let this = self.clone();
                tokio::spawn(async move { this.accept_loop(listener).await });

                Ok::<_, anyhow::Error>(local_addr)
            })
            .await?;

        Ok(*addr)
    }

    /// Address of the running listener, if started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.started.get().copied()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, client_addr)) => {
                    let this = self.clone();

                    tokio::spawn(async move {
                        this.logger.log(&client_addr, "New connection").await;
                        if let Err(e) = this.serve_stream(stream, client_addr).await {
                            this.logger
                                .log(&client_addr, &format!("Error: {:#}", e))
                                .await;
                        }
                    });
                }
                Err(e) => {
                    self.logger
                        .log(
                            &SocketAddr::from(([0, 0, 0, 0], 0)),
                            &format!("Accept error: {}", e),
                        )
                        .await;
                    time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Runs a whole SMTP conversation over `stream`.
    pub async fn serve_stream<S>(&self, stream: S, client_addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        let mut conn = Connection::new(stream, client_addr, &self.opt);

        let banner = format!("220 {} ESMTP Service Ready\r\n", self.opt.domain);
        self.reply(&mut conn, &banner).await?;

        loop {
            let line = match conn.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    self.logger
                        .log(&client_addr, &format!("Read error: {:#}", e))
                        .await;
                    break;
                }
            };

            let cmd_line = String::from_utf8_lossy(&line);
            self.logger
                .log(&client_addr, &format!(">> {}", redact_auth(&cmd_line)))
                .await;

            match self.process_command(&cmd_line, &mut conn).await? {
                Flow::Continue => {}
                Flow::Close => break,
            }
        }

        if let Some(session) = conn.session.take() {
            let _ = session.logout();
        }
        self.logger.log(&client_addr, "Connection closed").await;
        Ok(())
    }

    async fn reply<S: AsyncRead + AsyncWrite>(
        &self,
        conn: &mut Connection<S>,
        reply: &str,
    ) -> Result<()> {
        self.logger
            .log(&conn.peer, &format!("<< {}", reply.trim_end()))
            .await;
        conn.write(reply).await
    }

    /// The session to run an envelope command on. Without a login this goes
    /// through anonymous login, which always refuses.
    fn active_session<'c>(
        &self,
        session: &'c mut Option<SmtpSession>,
    ) -> std::result::Result<&'c mut SmtpSession, SmtpError> {
        if session.is_none() {
            let anonymous = self.backend.anonymous_login()?;
            *session = Some(anonymous);
        }
        session.as_mut().ok_or(SmtpError::AuthRequired)
    }

    fn ehlo_response(&self, helo_name: &str) -> String {
        let mut lines = vec![
            format!("{} Hello {}", self.opt.domain, helo_name),
            "PIPELINING".to_string(),
            "8BITMIME".to_string(),
            format!("SIZE {}", self.opt.max_message_bytes),
        ];
        if self.opt.allow_insecure_auth() {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }

        let last = lines.len() - 1;
        lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let sep = if i == last { ' ' } else { '-' };
                format!("250{}{}\r\n", sep, line)
            })
            .collect()
    }

    async fn process_command<S: AsyncRead + AsyncWrite>(
        &self,
        cmd_line: &str,
        conn: &mut Connection<S>,
    ) -> Result<Flow> {
        let parts: Vec<&str> = cmd_line.split_whitespace().collect();
        if parts.is_empty() {
            self.reply(conn, "500 5.5.2 Syntax error\r\n").await?;
            return Ok(Flow::Continue);
        }

        let cmd = parts[0].to_uppercase();

        let response = match cmd.as_str() {
            "HELO" | "EHLO" => {
                let helo_name = parts.get(1).copied().unwrap_or("unknown");
                conn.helo = Some(helo_name.to_string());
                if let Some(session) = conn.session.as_mut() {
                    session.reset();
                }
                self.logger
                    .log_verbose(&conn.peer, "HELO/EHLO", helo_name)
                    .await;

                if cmd == "HELO" {
                    format!("250 {} Hello {}\r\n", self.opt.domain, helo_name)
                } else {
                    self.ehlo_response(helo_name)
                }
            }

            "AUTH" => {
                self.authenticate(&parts, conn).await?;
                return Ok(Flow::Continue);
            }

            "MAIL" => match path_argument(cmd_line, "FROM:") {
                Some(from) => {
                    let result = self
                        .active_session(&mut conn.session)
                        .and_then(|session| session.mail(&from));
                    self.logger
                        .log_verbose(&conn.peer, "MAIL FROM", &from)
                        .await;
                    match result {
                        Ok(()) => "250 2.1.0 Sender OK\r\n".to_string(),
                        Err(e) => e.reply(),
                    }
                }
                None => "501 5.5.4 Syntax: MAIL FROM:<address>\r\n".to_string(),
            },

            "RCPT" => match path_argument(cmd_line, "TO:") {
                Some(to) => {
                    let max = self.opt.max_recipients;
                    let result = self
                        .active_session(&mut conn.session)
                        .and_then(|session| {
                            if session.recipient_count() >= max {
                                return Err(SmtpError::TooManyRecipients { max });
                            }
                            session.rcpt(&to)
                        });
                    self.logger.log_verbose(&conn.peer, "RCPT TO", &to).await;
                    match result {
                        Ok(()) => "250 2.1.5 Recipient OK\r\n".to_string(),
                        Err(e) => e.reply(),
                    }
                }
                None => "501 5.5.4 Syntax: RCPT TO:<address>\r\n".to_string(),
            },

            "DATA" => {
                self.receive_data(conn).await?;
                return Ok(Flow::Continue);
            }

            "RSET" => {
                if let Some(session) = conn.session.as_mut() {
                    session.reset();
                }
                "250 2.0.0 Flushed\r\n".to_string()
            }

            "NOOP" => "250 2.0.0 OK\r\n".to_string(),

            "VRFY" | "EXPN" => "252 2.5.0 Cannot verify user\r\n".to_string(),

            "STARTTLS" => "502 5.5.1 TLS not supported\r\n".to_string(),

            "QUIT" => {
                self.reply(conn, "221 2.0.0 Bye\r\n").await?;
                return Ok(Flow::Close);
            }

            _ => "500 5.5.2 Command not recognized\r\n".to_string(),
        };

        self.reply(conn, &response).await?;
        Ok(Flow::Continue)
    }

    async fn receive_data<S: AsyncRead + AsyncWrite>(&self, conn: &mut Connection<S>) -> Result<()> {
        let ready = self
            .active_session(&mut conn.session)
            .and_then(|session| session.begin_data());
        if let Err(e) = ready {
            return self.reply(conn, &e.reply()).await;
        }

        self.reply(conn, "354 Start mail input; end with <CRLF>.<CRLF>\r\n")
            .await?;

        let body = match self.read_body(conn).await? {
            Ok(body) => body,
            Err(e) => {
                if let Some(session) = conn.session.as_mut() {
                    session.reset();
                }
                return self.reply(conn, &e.reply()).await;
            }
        };

        self.logger
            .log_verbose(&conn.peer, "EMAIL DATA", &String::from_utf8_lossy(&body))
            .await;

        let outcome = match conn.session.as_mut() {
            Some(session) => session.data(&body).await,
            None => Err(SmtpError::AuthRequired),
        };

        match outcome {
            Ok(()) => {
                let identity = conn
                    .session
                    .as_ref()
                    .map(|session| session.tenant().identity().to_string())
                    .unwrap_or_default();
                let helo = conn.helo.as_deref().unwrap_or("unknown");
                self.logger
                    .log(
                        &conn.peer,
                        &format!("Message from {} delivered to {}", helo, identity),
                    )
                    .await;
                self.reply(conn, "250 2.0.0 OK: queued\r\n").await
            }
            Err(e) => {
                self.logger
                    .log(&conn.peer, &format!("Message rejected: {}", e))
                    .await;
                self.reply(conn, &e.reply()).await
            }
        }
    }

    /// Reads a dot-terminated body, undoing dot-stuffing and normalizing line
    /// endings to `\n`. An oversized body is read to its end, then refused.
    async fn read_body<S: AsyncRead + AsyncWrite>(
        &self,
        conn: &mut Connection<S>,
    ) -> Result<std::result::Result<Vec<u8>, SmtpError>> {
        let max = self.opt.max_message_bytes;
        let mut body = Vec::new();
        let mut received = 0usize;

        loop {
            let line = conn
                .read_line()
                .await?
                .context("Connection closed during DATA")?;

            if line == b"." {
                break;
            }

            let line = match line.strip_prefix(b".") {
                Some(unstuffed) => unstuffed,
                None => &line[..],
            };

            received += line.len() + 2;
            if received <= max {
                body.extend_from_slice(line);
                body.push(b'\n');
            }
        }

        if received > max {
            return Ok(Err(SmtpError::MessageTooLarge { max }));
        }
        Ok(Ok(body))
    }

    async fn authenticate<S: AsyncRead + AsyncWrite>(
        &self,
        parts: &[&str],
        conn: &mut Connection<S>,
    ) -> Result<()> {
        if conn.session.is_some() {
            return self.reply(conn, "503 5.5.1 Already authenticated\r\n").await;
        }
        if !self.opt.allow_insecure_auth() {
            return self
                .reply(
                    conn,
                    "523 5.7.10 Encryption required for requested authentication mechanism\r\n",
                )
                .await;
        }

        let mechanism = match parts.get(1) {
            Some(mechanism) => mechanism.to_uppercase(),
            None => return self.reply(conn, "501 5.5.4 Syntax: AUTH mechanism\r\n").await,
        };
        let initial = parts.get(2).copied();

        let credentials = match mechanism.as_str() {
            "PLAIN" => self.auth_plain(initial, conn).await?,
            "LOGIN" => self.auth_login(initial, conn).await?,
            _ => {
                return self
                    .reply(conn, "504 5.7.4 Unsupported authentication mechanism\r\n")
                    .await
            }
        };

        let (identity, credential) = match credentials {
            Ok(credentials) => credentials,
            Err(reply) => return self.reply(conn, reply).await,
        };

        match self.backend.login(&identity, &credential).await {
            Ok(session) => {
                self.logger
                    .log(&conn.peer, &format!("Authenticated as {}", identity))
                    .await;
                conn.session = Some(session);
                self.reply(conn, "235 2.7.0 Authentication successful\r\n")
                    .await
            }
            Err(e) => {
                self.logger
                    .log(
                        &conn.peer,
                        &format!("Authentication failed for {}: {}", identity, e),
                    )
                    .await;
                self.reply(conn, &e.reply()).await
            }
        }
    }

    async fn auth_plain<S: AsyncRead + AsyncWrite>(
        &self,
        initial: Option<&str>,
        conn: &mut Connection<S>,
    ) -> Result<Credentials> {
        let response = match initial {
            Some(response) => response.to_string(),
            None => {
                self.reply(conn, "334 \r\n").await?;
                match self.read_auth_response(conn).await? {
                    Some(response) => response,
                    None => return Ok(Err(AUTH_CANCELLED)),
                }
            }
        };

        let decoded = match decode_auth(&response) {
            Some(decoded) => decoded,
            None => return Ok(Err(AUTH_BAD_BASE64)),
        };

        // authzid NUL authcid NUL passwd
        let fields: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
        if fields.len() != 3 {
            return Ok(Err("501 5.5.2 Malformed PLAIN response\r\n"));
        }

        Ok(Ok((
            String::from_utf8_lossy(fields[1]).into_owned(),
            String::from_utf8_lossy(fields[2]).into_owned(),
        )))
    }

    async fn auth_login<S: AsyncRead + AsyncWrite>(
        &self,
        initial: Option<&str>,
        conn: &mut Connection<S>,
    ) -> Result<Credentials> {
        let username = match initial {
            Some(username) => username.to_string(),
            None => {
                self.reply(conn, "334 VXNlcm5hbWU6\r\n").await?;
                match self.read_auth_response(conn).await? {
                    Some(username) => username,
                    None => return Ok(Err(AUTH_CANCELLED)),
                }
            }
        };

        self.reply(conn, "334 UGFzc3dvcmQ6\r\n").await?;
        let password = match self.read_auth_response(conn).await? {
            Some(password) => password,
            None => return Ok(Err(AUTH_CANCELLED)),
        };

        match (decode_auth(&username), decode_auth(&password)) {
            (Some(username), Some(password)) => Ok(Ok((
                String::from_utf8_lossy(&username).into_owned(),
                String::from_utf8_lossy(&password).into_owned(),
            ))),
            _ => Ok(Err(AUTH_BAD_BASE64)),
        }
    }

    /// A continuation line of an AUTH exchange; `None` when the client cancels.
    async fn read_auth_response<S: AsyncRead + AsyncWrite>(
        &self,
        conn: &mut Connection<S>,
    ) -> Result<Option<String>> {
        let line = conn
            .read_line()
            .await?
            .context("Connection closed during AUTH")?;
        self.logger.log(&conn.peer, ">> <auth data>").await;

        let response = String::from_utf8_lossy(&line).trim().to_string();
        if response == "*" {
            return Ok(None);
        }
        Ok(Some(response))
    }
}

const AUTH_CANCELLED: &str = "501 5.0.0 Authentication cancelled\r\n";
const AUTH_BAD_BASE64: &str = "501 5.5.2 Invalid base64 data\r\n";

/// `=` stands for an empty initial response.
fn decode_auth(response: &str) -> Option<Vec<u8>> {
    if response == "=" {
        return Some(Vec::new());
    }
    general_purpose::STANDARD.decode(response).ok()
}

/// Extracts the address from `MAIL FROM:<addr>` or `RCPT TO:<addr>`,
/// ignoring any ESMTP parameters after it.
fn path_argument(cmd_line: &str, keyword: &str) -> Option<String> {
    let rest = cmd_line.trim_start().get(4..)?.trim_start();
    let head = rest.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }

    let path = rest[keyword.len()..]
        .split_whitespace()
        .next()
        .unwrap_or("");
    Some(
        path.trim_start_matches('<')
            .trim_end_matches('>')
            .to_string(),
    )
}

/// Keeps AUTH payloads out of the logs.
fn redact_auth(cmd_line: &str) -> String {
    let parts: Vec<&str> = cmd_line.split_whitespace().collect();
    match parts.as_slice() {
        [cmd, mechanism, _, ..] if cmd.eq_ignore_ascii_case("AUTH") => {
            format!("{} {} <auth data>", cmd, mechanism)
        }
        _ => cmd_line.to_string(),
    }
}
