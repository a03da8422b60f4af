use crate::config::TlsMode;
use crate::logging::{log_disposition, ErrorSource, LogDisposition, Verdict};
use crate::mapping::Upstream;
use crate::resolver::{ResolveError, Resolver};
use crate::upstream::{EstablishArgs, UpstreamSession};
use anyhow::Context;
use esmtp::{
    AsyncReadAndWrite, BoxedAsyncReadAndWrite, ClientError, Command, EnhancedStatusCode,
    EsmtpParameter, ForwardPath, Response, ReversePath, SmtpClientTimeouts,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;
use uuid::Uuid;

const MAX_LINE_LEN: usize = 4096;

/// Body bytes are flushed to the upstream in segments of at most this
/// size, so a message is never held in memory in full.
const DATA_SEGMENT_MAX: usize = 64 * 1024;

const INTERNAL_ERROR: &str = "Internal server error. Please try again later.";

pub struct ServerParams {
    pub domain: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
    pub client_timeouts: SmtpClientTimeouts,
    pub resolver: Resolver,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub tls_mode: TlsMode,
}

pub async fn run_listener(params: Arc<ServerParams>, listen: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding to {listen}"))?;
    tracing::info!("listening on {listen}");

    loop {
        let (socket, peer_addr) = listener.accept().await.context("accepting connection")?;
        let params = Arc::clone(&params);
        tokio::spawn(async move {
            let session_id = Uuid::new_v4();
            let span = tracing::info_span!("session", id = %session_id, peer = %peer_addr);
            async move {
                tracing::debug!("connection accepted");
                if let Err(err) = SmtpServer::run(socket, peer_addr, params).await {
                    tracing::debug!("session ended: {err:#}");
                }
            }
            .instrument(span)
            .await;
        });
    }
}

/// Per-message state. Created by MAIL FROM; the first RCPT that
/// resolves pins `chosen_upstream` for the rest of the message, and a
/// successful establishment stores the live connection in `upstream`.
struct Transaction {
    sender: ReversePath,
    sender_params: Vec<EsmtpParameter>,
    /// Recipients the upstream has accepted, for the disposition record
    recipients: Vec<String>,
    chosen_upstream: Option<Upstream>,
    upstream: Option<UpstreamSession>,
    failure_logged: bool,
}

pub struct SmtpServer {
    socket: Option<BoxedAsyncReadAndWrite>,
    read_buffer: Vec<u8>,
    peer_addr: SocketAddr,
    params: Arc<ServerParams>,
    said_hello: Option<String>,
    tls_active: bool,
    state: Option<Transaction>,
}

enum CommandLine {
    Line(String),
    Eof,
    TimedOut,
    TooLong,
}

enum BodySegment {
    /// A complete line, terminated by LF, ending included
    Line(Vec<u8>),
    /// Part of a line too large to buffer; flushed as-is
    Chunk(Vec<u8>),
    Eof,
    TimedOut,
}

enum FillStatus {
    Data,
    Eof,
    TimedOut,
}

impl SmtpServer {
    pub async fn run(
        socket: TcpStream,
        peer_addr: SocketAddr,
        params: Arc<ServerParams>,
    ) -> anyhow::Result<()> {
        socket.set_nodelay(true).ok();

        match (params.tls_mode, params.tls_acceptor.clone()) {
            (TlsMode::Smtps, Some(acceptor)) => {
                let stream = acceptor.accept(socket).await.context("SMTPS TLS accept")?;
                Self::run_with_stream(stream, true, peer_addr, params).await
            }
            _ => Self::run_with_stream(socket, false, peer_addr, params).await,
        }
    }

    pub async fn run_with_stream<S: AsyncReadAndWrite + 'static>(
        stream: S,
        tls_active: bool,
        peer_addr: SocketAddr,
        params: Arc<ServerParams>,
    ) -> anyhow::Result<()> {
        let mut server = SmtpServer {
            socket: Some(Box::new(stream)),
            read_buffer: Vec::with_capacity(1024),
            peer_addr,
            params,
            said_hello: None,
            tls_active,
            state: None,
        };

        let result = server.process().await;
        tracing::debug!("Logout");
        server.abort_transaction().await;
        result
    }

    async fn process(&mut self) -> anyhow::Result<()> {
        let greeting = format!("{} ESMTP relayd", self.params.domain);
        self.write_response(220, None, &greeting).await?;

        loop {
            let line = match self.read_command_line().await? {
                CommandLine::Line(line) => line,
                CommandLine::Eof => {
                    tracing::debug!("client disconnected");
                    return Ok(());
                }
                CommandLine::TimedOut => {
                    self.write_response(421, None, "idle too long, closing connection")
                        .await
                        .ok();
                    return Ok(());
                }
                CommandLine::TooLong => {
                    self.write_response(500, None, "line too long").await?;
                    continue;
                }
            };
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                self.write_response(500, None, "command unrecognized")
                    .await?;
                continue;
            }

            let command = match Command::parse(line) {
                Ok(command) => command,
                Err(err) => {
                    tracing::debug!("failed to parse {line:?}: {err}");
                    self.write_response(
                        501,
                        None,
                        &format!("Syntax error in command or arguments: {err}"),
                    )
                    .await?;
                    continue;
                }
            };

            match command {
                Command::Quit => {
                    self.write_response(221, None, "bye").await?;
                    return Ok(());
                }
                Command::Ehlo(domain) => self.handle_ehlo(domain).await?,
                Command::Helo(domain) => {
                    tracing::debug!(helo = %domain, "HELO");
                    self.abort_transaction().await;
                    let greeting = format!("{} Hello {domain}", self.params.domain);
                    self.said_hello.replace(domain);
                    self.write_response(250, None, &greeting).await?;
                }
                Command::StartTls => self.handle_starttls().await?,
                Command::MailFrom {
                    address,
                    parameters,
                } => self.handle_mail(address, parameters).await?,
                Command::RcptTo {
                    address,
                    parameters,
                } => self.handle_rcpt(address, parameters).await?,
                Command::Data => self.handle_data().await?,
                Command::Rset => {
                    tracing::debug!("RSET");
                    self.abort_transaction().await;
                    self.write_response(250, None, "Reset state").await?;
                }
                Command::Noop(_) => {
                    self.write_response(250, None, "Ok").await?;
                }
                Command::Vrfy(_) => {
                    self.write_response(
                        252,
                        None,
                        "Cannot VRFY user, but will accept message and attempt delivery",
                    )
                    .await?;
                }
                Command::XClient(_) => {
                    self.write_response(550, None, "insufficient authorization")
                        .await?;
                }
                Command::DataDot | Command::Unknown(_) => {
                    self.write_response(
                        502,
                        None,
                        &format!("Command unrecognized/unimplemented: {line}"),
                    )
                    .await?;
                }
            }
        }
    }

    fn starttls_available(&self) -> bool {
        !self.tls_active
            && self.params.tls_mode == TlsMode::Starttls
            && self.params.tls_acceptor.is_some()
    }

    async fn handle_ehlo(&mut self, domain: String) -> anyhow::Result<()> {
        tracing::debug!(helo = %domain, "EHLO");
        self.abort_transaction().await;
        let mut caps = format!(
            "{} Hello {domain}\nSIZE {}\n8BITMIME",
            self.params.domain, self.params.max_message_bytes
        );
        if self.starttls_available() {
            caps.push_str("\nSTARTTLS");
        }
        self.said_hello.replace(domain);
        self.write_response(250, None, &caps).await
    }

    async fn handle_starttls(&mut self) -> anyhow::Result<()> {
        tracing::debug!("STARTTLS");
        if self.tls_active {
            return self
                .write_response(502, None, "already using TLS")
                .await;
        }
        let Some(acceptor) = self
            .params
            .tls_acceptor
            .clone()
            .filter(|_| self.params.tls_mode == TlsMode::Starttls)
        else {
            return self.write_response(502, None, "STARTTLS not supported").await;
        };

        self.abort_transaction().await;
        self.write_response(220, None, "Ready to start TLS").await?;

        let socket = self
            .socket
            .take()
            .ok_or_else(|| anyhow::anyhow!("socket is closed"))?;
        let stream = timeout(self.params.read_timeout, acceptor.accept(socket))
            .await
            .map_err(|_| anyhow::anyhow!("TLS handshake timed out"))?
            .context("TLS handshake")?;
        self.socket.replace(Box::new(stream));
        self.tls_active = true;

        // RFC 3207: everything learned before the handshake is discarded
        self.said_hello.take();
        self.read_buffer.clear();
        Ok(())
    }

    async fn handle_mail(
        &mut self,
        address: ReversePath,
        parameters: Vec<EsmtpParameter>,
    ) -> anyhow::Result<()> {
        tracing::debug!(from = %address, "MAIL FROM");
        if self.said_hello.is_none() {
            return self.write_response(503, None, "say EHLO first").await;
        }
        if self.state.is_some() {
            return self
                .write_response(503, None, "MAIL FROM already issued; you must RSET first")
                .await;
        }

        self.state.replace(Transaction {
            sender: address,
            sender_params: parameters,
            recipients: vec![],
            chosen_upstream: None,
            upstream: None,
            failure_logged: false,
        });
        self.write_response(250, enh(2, 1, 0), "Ok").await
    }

    async fn handle_rcpt(
        &mut self,
        address: ForwardPath,
        parameters: Vec<EsmtpParameter>,
    ) -> anyhow::Result<()> {
        let recipient = address.to_string();
        tracing::debug!(to = %recipient, "RCPT TO");

        let Some(state) = self.state.as_ref() else {
            return self
                .write_response(503, None, "MAIL FROM must be issued first")
                .await;
        };
        let recipient_count = state.recipients.len();
        let have_upstream = state.upstream.is_some();
        let chosen = state.chosen_upstream.clone();
        let sender = state.sender.clone();
        let sender_params = state.sender_params.clone();

        if recipient_count >= self.params.max_recipients {
            return self
                .write_response(452, enh(4, 5, 3), "too many recipients")
                .await;
        }

        if !have_upstream {
            // The first successful resolution pins the upstream for the
            // whole message; a failed dial leaves it pinned and the next
            // RCPT retries the connection
            let upstream = match chosen {
                Some(upstream) => upstream,
                None => match self.params.resolver.resolve(&recipient).await {
                    Ok(upstream) => {
                        tracing::debug!(upstream = %upstream, "routing transaction");
                        if let Some(state) = self.state.as_mut() {
                            state.chosen_upstream.replace(upstream.clone());
                        }
                        upstream
                    }
                    Err(err @ ResolveError::NotFound(_)) => {
                        tracing::debug!("{err}");
                        self.fail_transaction(format!("{err:#}"), ErrorSource::Internal);
                        return self
                            .write_response(554, enh(5, 7, 1), "Relay access denied")
                            .await;
                    }
                    Err(err) => {
                        tracing::error!("resolving {recipient}: {err:#}");
                        self.fail_transaction(format!("{err:#}"), ErrorSource::Internal);
                        return self.write_response(450, None, INTERNAL_ERROR).await;
                    }
                },
            };

            let established = UpstreamSession::establish(EstablishArgs {
                upstream,
                ehlo_name: &self.params.domain,
                client_addr: self.peer_addr,
                client_helo: self.said_hello.as_deref().unwrap_or(""),
                client_tls: self.tls_active,
                sender: &sender,
                sender_params: &sender_params,
                timeouts: self.params.client_timeouts,
            })
            .await;

            match established {
                Ok(session) => {
                    if let Some(state) = self.state.as_mut() {
                        state.upstream.replace(session);
                    }
                }
                Err(err) => {
                    return match err.downcast_ref::<ClientError>() {
                        Some(ClientError::Rejected(resp)) => {
                            // the upstream's rejection of our replayed
                            // MAIL FROM answers this RCPT
                            let resp = resp.clone();
                            self.fail_transaction(resp.to_single_line(), ErrorSource::Upstream);
                            self.respond(&resp).await
                        }
                        _ => {
                            tracing::error!("establishing upstream session: {err:#}");
                            self.fail_transaction(format!("{err:#}"), ErrorSource::Internal);
                            self.write_response(450, None, INTERNAL_ERROR).await
                        }
                    };
                }
            }
        }

        let forwarded = match self.state.as_mut().and_then(|s| s.upstream.as_mut()) {
            Some(upstream) => upstream.rcpt(&address, &parameters).await,
            None => {
                tracing::error!("RCPT forwarding with no upstream session");
                self.fail_transaction("no upstream session".to_string(), ErrorSource::Internal);
                return self.write_response(450, None, INTERNAL_ERROR).await;
            }
        };

        match forwarded {
            Ok(resp) => {
                if (200..300).contains(&resp.code) {
                    if let Some(state) = self.state.as_mut() {
                        state.recipients.push(recipient);
                    }
                } else {
                    self.fail_transaction(resp.to_single_line(), ErrorSource::Upstream);
                }
                self.respond(&resp).await
            }
            Err(err) => {
                tracing::error!("forwarding RCPT: {err:#}");
                // the connection is gone; drop it so a later RCPT can
                // re-establish
                if let Some(state) = self.state.as_mut() {
                    if let Some(upstream) = state.upstream.take() {
                        upstream.close();
                    }
                }
                self.fail_transaction(format!("{err:#}"), ErrorSource::Internal);
                self.write_response(450, None, INTERNAL_ERROR).await
            }
        }
    }

    async fn handle_data(&mut self) -> anyhow::Result<()> {
        tracing::debug!("DATA");
        let Some(state) = self.state.as_ref() else {
            return self
                .write_response(503, None, "MAIL FROM must be issued first")
                .await;
        };
        if state.recipients.is_empty() {
            return self
                .write_response(503, None, "RCPT TO must be issued first")
                .await;
        }
        if state.upstream.is_none() {
            tracing::error!("DATA with no upstream session");
            self.fail_transaction(
                "DATA with no upstream session".to_string(),
                ErrorSource::Internal,
            );
            self.hard_close_transaction();
            return self.write_response(450, None, INTERNAL_ERROR).await;
        }

        // ask the upstream to enter DATA before committing ourselves
        let started = match self.state.as_mut().and_then(|s| s.upstream.as_mut()) {
            Some(upstream) => upstream.start_data().await,
            None => unreachable!("upstream presence checked above"),
        };
        match started {
            Ok(resp) if resp.code == 354 => {}
            Ok(resp) => {
                self.fail_transaction(resp.to_single_line(), ErrorSource::Upstream);
                self.abort_transaction().await;
                return self.respond(&resp).await;
            }
            Err(err) => {
                tracing::error!("DATA to upstream: {err:#}");
                self.fail_transaction(format!("{err:#}"), ErrorSource::Internal);
                self.hard_close_transaction();
                return self.write_response(450, None, INTERNAL_ERROR).await;
            }
        }

        self.write_response(354, None, "Send body; end with CRLF.CRLF")
            .await?;

        let max_message_bytes = self.params.max_message_bytes;
        let mut total = 0usize;
        let mut overflow = false;
        let mut upstream_error: Option<ClientError> = None;
        let mut at_line_start = true;

        loop {
            let (bytes, is_line) = match self.read_body_segment().await? {
                BodySegment::Line(bytes) => (bytes, true),
                BodySegment::Chunk(bytes) => (bytes, false),
                BodySegment::Eof => {
                    tracing::debug!("client disconnected during DATA");
                    self.hard_close_transaction();
                    return Ok(());
                }
                BodySegment::TimedOut => {
                    self.hard_close_transaction();
                    self.write_response(421, None, "idle too long, closing connection")
                        .await
                        .ok();
                    return Ok(());
                }
            };

            if is_line && at_line_start && strip_line_ending(&bytes) == b"." {
                break;
            }

            total += bytes.len();
            if total > max_message_bytes {
                overflow = true;
            }

            if !overflow && upstream_error.is_none() {
                let result = match self.state.as_mut().and_then(|s| s.upstream.as_mut()) {
                    Some(upstream) => upstream.write_body(&bytes).await,
                    None => break,
                };
                if let Err(err) = result {
                    tracing::error!("forwarding DATA: {err:#}");
                    upstream_error.replace(err);
                }
            }

            at_line_start = is_line;
        }

        if overflow {
            self.fail_transaction(
                format!("message exceeds maximum size of {max_message_bytes} bytes"),
                ErrorSource::Internal,
            );
            self.hard_close_transaction();
            return self
                .write_response(552, enh(5, 3, 4), "message exceeds maximum allowed size")
                .await;
        }
        if let Some(err) = upstream_error {
            self.fail_transaction(format!("{err:#}"), ErrorSource::Internal);
            self.hard_close_transaction();
            return self.write_response(450, None, INTERNAL_ERROR).await;
        }

        // forward the terminating dot; the upstream's reply is the
        // authoritative verdict for this message
        let verdict = match self.state.as_mut().and_then(|s| s.upstream.as_mut()) {
            Some(upstream) => match upstream.write_body(b".\r\n").await {
                Ok(()) => upstream.finish_data().await,
                Err(err) => Err(err),
            },
            None => {
                self.fail_transaction("no upstream session".to_string(), ErrorSource::Internal);
                return self.write_response(450, None, INTERNAL_ERROR).await;
            }
        };

        match verdict {
            Ok(resp) => {
                if (200..300).contains(&resp.code) {
                    self.log_accepted();
                } else {
                    self.fail_transaction(resp.to_single_line(), ErrorSource::Upstream);
                }
                // message boundary: the next MAIL gets a fresh upstream
                self.abort_transaction().await;
                self.respond(&resp).await
            }
            Err(err) => {
                tracing::error!("reading DATA verdict: {err:#}");
                self.fail_transaction(format!("{err:#}"), ErrorSource::Internal);
                self.hard_close_transaction();
                self.write_response(450, None, INTERNAL_ERROR).await
            }
        }
    }

    /// QUIT the upstream (if any) and drop the transaction.
    async fn abort_transaction(&mut self) {
        if let Some(state) = self.state.take() {
            if let Some(upstream) = state.upstream {
                tracing::debug!("closing upstream session");
                upstream.quit().await;
            }
        }
    }

    /// Drop the transaction without a QUIT, for when the upstream
    /// connection state is no longer coherent.
    fn hard_close_transaction(&mut self) {
        if let Some(state) = self.state.take() {
            if let Some(upstream) = state.upstream {
                upstream.close();
            }
        }
    }

    /// Record the transaction's first failure on the canonical log line.
    fn fail_transaction(&mut self, error: String, source: ErrorSource) {
        match self.state.as_mut() {
            Some(state) => {
                if state.failure_logged {
                    return;
                }
                state.failure_logged = true;
            }
            None => return,
        }
        let Some(state) = self.state.as_ref() else {
            return;
        };
        log_disposition(LogDisposition {
            verdict: Verdict::Rejected { error, source },
            peer: self.peer_addr,
            helo: self.said_hello.as_deref().unwrap_or(""),
            client_tls: self.tls_active,
            sender: Some(&state.sender),
            recipients: &state.recipients,
            upstream: state.chosen_upstream.as_ref(),
            upstream_tls: state.upstream.as_ref().map(|u| u.tls).unwrap_or(false),
        });
    }

    fn log_accepted(&self) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        log_disposition(LogDisposition {
            verdict: Verdict::Accepted,
            peer: self.peer_addr,
            helo: self.said_hello.as_deref().unwrap_or(""),
            client_tls: self.tls_active,
            sender: Some(&state.sender),
            recipients: &state.recipients,
            upstream: state.chosen_upstream.as_ref(),
            upstream_tls: state.upstream.as_ref().map(|u| u.tls).unwrap_or(false),
        });
    }

    async fn respond(&mut self, response: &Response) -> anyhow::Result<()> {
        self.write_response(response.code, response.enhanced_code, &response.content)
            .await
    }

    async fn write_response(
        &mut self,
        status: u16,
        enhanced: Option<EnhancedStatusCode>,
        message: &str,
    ) -> anyhow::Result<()> {
        let mut text = String::new();
        let lines: Vec<&str> = if message.is_empty() {
            vec![""]
        } else {
            message.lines().collect()
        };
        for (idx, line) in lines.iter().enumerate() {
            let sep = if idx == lines.len() - 1 { ' ' } else { '-' };
            match &enhanced {
                Some(e) => {
                    text.push_str(&format!(
                        "{status}{sep}{}.{}.{} {line}\r\n",
                        e.class, e.subject, e.detail
                    ));
                }
                None => {
                    text.push_str(&format!("{status}{sep}{line}\r\n"));
                }
            }
        }
        tracing::trace!("send->client: {text:?}");

        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("socket is closed"))?;
        timeout(self.params.write_timeout, async {
            socket.write_all(text.as_bytes()).await?;
            socket.flush().await
        })
        .await
        .map_err(|_| anyhow::anyhow!("timed out writing response"))?
        .context("writing response")?;
        Ok(())
    }

    async fn read_command_line(&mut self) -> anyhow::Result<CommandLine> {
        let mut too_long = false;
        loop {
            if let Some(pos) = memchr::memchr(b'\n', &self.read_buffer) {
                let line: Vec<u8> = self.read_buffer.drain(0..=pos).collect();
                if too_long {
                    return Ok(CommandLine::TooLong);
                }
                return Ok(CommandLine::Line(
                    String::from_utf8_lossy(&line).to_string(),
                ));
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }
            match self.fill_buffer().await? {
                FillStatus::Data => {}
                FillStatus::Eof => return Ok(CommandLine::Eof),
                FillStatus::TimedOut => return Ok(CommandLine::TimedOut),
            }
        }
    }

    async fn read_body_segment(&mut self) -> anyhow::Result<BodySegment> {
        loop {
            if let Some(pos) = memchr::memchr(b'\n', &self.read_buffer) {
                return Ok(BodySegment::Line(
                    self.read_buffer.drain(0..=pos).collect(),
                ));
            }
            if self.read_buffer.len() >= DATA_SEGMENT_MAX {
                return Ok(BodySegment::Chunk(
                    self.read_buffer.drain(..).collect(),
                ));
            }
            match self.fill_buffer().await? {
                FillStatus::Data => {}
                FillStatus::Eof => return Ok(BodySegment::Eof),
                FillStatus::TimedOut => return Ok(BodySegment::TimedOut),
            }
        }
    }

    async fn fill_buffer(&mut self) -> anyhow::Result<FillStatus> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("socket is closed"))?;
        let mut data = [0u8; 4096];
        match timeout(self.params.read_timeout, socket.read(&mut data)).await {
            Err(_) => Ok(FillStatus::TimedOut),
            Ok(Err(err)) => Err(err).context("reading from client"),
            Ok(Ok(0)) => Ok(FillStatus::Eof),
            Ok(Ok(n)) => {
                self.read_buffer.extend_from_slice(&data[..n]);
                Ok(FillStatus::Data)
            }
        }
    }
}

fn enh(class: u8, subject: u16, detail: u16) -> Option<EnhancedStatusCode> {
    Some(EnhancedStatusCode {
        class,
        subject,
        detail,
    })
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
