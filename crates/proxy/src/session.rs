/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
    sync::mpsc,
    time::{sleep, timeout_at},
};
use tracing::Instrument;

use crate::{
    control::{Detached, DetachedHandle, PendingHandle},
    pump::PumpState,
    rawlog::Rawlog,
    state::Destination,
    stream::ServerStream,
    Action, AnvilSession, ClientInfo, DefaultHooks, DialogContext, Engine, FailureKind,
    LoginProtocol, ProxyError, ProxySettings, SessionHooks, TlsMode, is_valid_dns_name,
    MAX_PROXY_INPUT_SIZE, PROXY_CONNECT_RETRY_MIN_MSECS, PROXY_CONNECT_RETRY_MSECS,
    PROXY_REDIRECT_LOOP_MIN_COUNT,
};

/// A finally-failed pre-login, handing the client connection back to the
/// front end along with the failure.
pub struct LoginFailed<C> {
    pub error: ProxyError,
    /// The session was removed by an admin kick or shutdown rather than by
    /// a dialog failure; no reply was sent to the client.
    pub kicked: bool,
    pub client: C,
}

struct RedirectEntry {
    ip: IpAddr,
    port: u16,
    count: u32,
}

struct ServerSide {
    stream: ServerStream,
    leftover: Vec<u8>,
}

enum AttemptEnd {
    Success(ServerSide),
    Fail(ProxyError),
    Kicked(String),
}

enum LineEnd {
    Line(String),
    Fail(ProxyError),
    Kicked(String),
}

enum ReadOutcome {
    Io(io::Result<usize>),
    TimedOut,
}

/// One proxy instance per client connection: owns the backend socket for
/// the duration of the pre-login dialog.
pub struct Proxy<P: LoginProtocol> {
    engine: Arc<Engine>,
    client: ClientInfo,
    settings: ProxySettings,
    protocol: P,
    hooks: Box<dyn SessionHooks>,
    span: tracing::Span,
    dest: Arc<Destination>,
    host: String,
    ip: IpAddr,
    port: u16,
    ttl: u32,
    created: Instant,
    reconnects: u32,
    disable_reconnect: bool,
    connected: bool,
    redirect_path: Vec<RedirectEntry>,
    pending_redirect: Option<(IpAddr, u16)>,
    conn_id: u64,
    kill_rx: mpsc::UnboundedReceiver<String>,
    multiplex: bool,
    bytes_to_server: u64,
    bytes_to_client: u64,
}

impl Engine {
    /// Create a proxy session for an identified client. The session is
    /// registered in the pending list (and thus kickable) from this point
    /// until it either detaches or fails.
    pub fn proxy<P: LoginProtocol>(
        self: &Arc<Self>,
        client: ClientInfo,
        settings: ProxySettings,
        protocol: P,
    ) -> Result<Proxy<P>, ProxyError> {
        if settings.host.is_empty() {
            return Err(ProxyError::new(
                FailureKind::InternalConfig,
                "proxy host is empty",
            ));
        }
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        self.pending.lock().push(PendingHandle {
            user: client.username.clone(),
            conn_id,
            kill: kill_tx,
        });
        let dest = self.registry.get(settings.ip, settings.port);
        let span = tracing::info_span!(
            "proxy",
            user = %client.username,
            dest = %format!("{}:{}", settings.ip, settings.port),
        );
        tracing::debug!(
            parent: &span,
            context = "proxy",
            event = "session-started",
            host = %settings.host,
            ip = %settings.ip,
            port = settings.port,
        );
        Ok(Proxy {
            engine: self.clone(),
            host: settings.host.clone(),
            ip: settings.ip,
            port: settings.port,
            ttl: client.proxy_ttl,
            client,
            settings,
            protocol,
            hooks: Box::new(DefaultHooks),
            span,
            dest,
            created: Instant::now(),
            reconnects: 0,
            disable_reconnect: false,
            connected: false,
            redirect_path: Vec::new(),
            pending_redirect: None,
            conn_id,
            kill_rx,
            multiplex: false,
            bytes_to_server: 0,
            bytes_to_client: 0,
        })
    }
}

impl<P: LoginProtocol> Proxy<P> {
    pub fn with_hooks(mut self, hooks: Box<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Drive the whole pre-login: connect (with retries and redirects),
    /// run the protocol dialog, and either detach or fail. On failure the
    /// mapped reply has already been written to `client_stream`.
    pub async fn run<C>(mut self, mut client_stream: C) -> Result<Detached<C>, LoginFailed<C>>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let span = self.span.clone();
        let outcome = self
            .run_inner(&mut client_stream)
            .instrument(span)
            .await;
        self.engine.unregister_pending(self.conn_id);
        match outcome {
            Ok(server) => Ok(self.into_detached(client_stream, server)),
            Err((error, kicked)) => Err(LoginFailed {
                error,
                kicked,
                client: client_stream,
            }),
        }
    }

    async fn run_inner<C>(
        &mut self,
        client_stream: &mut C,
    ) -> Result<ServerSide, (ProxyError, bool)>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let end = self.attempt(client_stream).await;
            if !matches!(end, AttemptEnd::Success(_)) {
                self.disconnect_counters();
            }
            match end {
                AttemptEnd::Success(server) => {
                    tracing::debug!(
                        context = "proxy",
                        event = "prelogin-finished",
                        elapsed_msecs = self.created.elapsed().as_millis() as u64,
                        reconnect_attempts = self.reconnects,
                    );
                    return Ok(server);
                }
                AttemptEnd::Kicked(reason) => {
                    tracing::info!(context = "proxy", event = "session-kicked", reason = %reason);
                    return Err((ProxyError::new(FailureKind::Internal, reason), true));
                }
                AttemptEnd::Fail(mut error) => {
                    if error.kind == FailureKind::AuthRedirect {
                        match self.pending_redirect.take() {
                            Some((ip, port)) => match self.redirect_finish(ip, port) {
                                Ok(()) => continue,
                                Err(loop_error) => error = loop_error,
                            },
                            None => {
                                error = ProxyError::new(
                                    FailureKind::Internal,
                                    "Redirect without a resolved target",
                                )
                            }
                        }
                    }
                    if error.kind.may_retry() && self.try_reconnect() {
                        tracing::warn!(
                            context = "proxy",
                            event = "session-reconnecting",
                            error = %error.reason,
                            reconnect_attempts = self.reconnects,
                            "{}{} - reconnecting (attempt #{})",
                            error.kind.log_prefix(),
                            error.reason,
                            self.reconnects,
                        );
                        self.protocol.reset();
                        tokio::select! {
                            _ = sleep(Duration::from_millis(PROXY_CONNECT_RETRY_MSECS)) => {}
                            Some(reason) = self.kill_rx.recv() => {
                                tracing::info!(context = "proxy", event = "session-kicked", reason = %reason);
                                return Err((ProxyError::new(FailureKind::Internal, reason), true));
                            }
                        }
                        continue;
                    }
                    return self.finish_failure(client_stream, error).await;
                }
            }
        }
    }

    async fn attempt<C>(&mut self, client_stream: &mut C) -> AttemptEnd
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if self.ttl <= 1 {
            return AttemptEnd::Fail(ProxyError::new(
                FailureKind::RemoteConfig,
                "TTL reached zero - proxies appear to be looping?",
            ));
        }
        if let Some(name) = self.client.local_name.as_deref() {
            if !is_valid_dns_name(name) {
                return AttemptEnd::Fail(ProxyError::new(
                    FailureKind::Internal,
                    "[BUG] Invalid local_name",
                ));
            }
        }

        let attempt = self.dest.begin_attempt();
        if let Some(down_secs) = self
            .dest
            .should_fail_fast(self.settings.host_immediate_failure_after)
        {
            self.disable_reconnect = true;
            drop(attempt);
            return AttemptEnd::Fail(ProxyError::new(
                FailureKind::Connect,
                format!("Host has been down for {down_secs} secs"),
            ));
        }

        tracing::debug!(
            context = "proxy",
            event = "connecting",
            ip = %self.ip,
            port = self.port,
            reconnect_attempts = self.reconnects,
        );
        let deadline = self.deadline();
        let (ip, port, source_ip) = (self.ip, self.port, self.settings.source_ip);
        let connect_fut = async move {
            let connect = connect_tcp(ip, port, source_ip);
            match deadline {
                Some(deadline) => match timeout_at(deadline, connect).await {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "Connection timed out",
                    )),
                },
                None => connect.await,
            }
        };
        tokio::pin!(connect_fut);
        let result = tokio::select! {
            result = &mut connect_fut => result,
            Some(reason) = self.kill_rx.recv() => {
                drop(attempt);
                return AttemptEnd::Kicked(reason);
            }
        };
        let tcp = match result {
            Ok(tcp) => tcp,
            Err(err) => {
                attempt.failure(self.created);
                return AttemptEnd::Fail(ProxyError::new(
                    FailureKind::Connect,
                    self.connect_error(&err.to_string()),
                ));
            }
        };
        attempt.success();
        self.connected = true;

        let rawlog = self.settings.rawlog_dir.as_deref().and_then(Rawlog::create);
        let mut server = ServerStream::plain(tcp, rawlog);
        if self.settings.tls.mode == TlsMode::Implicit {
            server = match self.server_starttls(server).await {
                Ok(server) => server,
                Err(end) => return end,
            };
        }

        self.protocol.reset();
        let mut lines = LineBuffer::new();
        loop {
            let line = match self.read_server_line(&mut server, &mut lines).await {
                LineEnd::Line(line) => line,
                LineEnd::Fail(error) => return AttemptEnd::Fail(error),
                LineEnd::Kicked(reason) => return AttemptEnd::Kicked(reason),
            };
            let ctx = DialogContext { ttl: self.ttl };
            for action in self.protocol.server_line(&ctx, &line) {
                match action {
                    Action::SendServer(bytes) => {
                        if let Err(err) = server.write_all(&bytes).await {
                            return AttemptEnd::Fail(ProxyError::new(
                                FailureKind::Connect,
                                format!("write() to server failed: {err}"),
                            ));
                        }
                        self.bytes_to_server += bytes.len() as u64;
                    }
                    Action::SendClient(bytes) => {
                        if let Err(err) = write_client(client_stream, &bytes).await {
                            return AttemptEnd::Fail(ProxyError::new(
                                FailureKind::AuthReplied,
                                format!("Client disconnected: {err}"),
                            ));
                        }
                        self.bytes_to_client += bytes.len() as u64;
                    }
                    Action::StartTls => {
                        if !lines.is_empty() {
                            return AttemptEnd::Fail(ProxyError::new(
                                FailureKind::Protocol,
                                "Server sent data before the TLS handshake",
                            ));
                        }
                        server = match self.server_starttls(server).await {
                            Ok(server) => server,
                            Err(end) => return end,
                        };
                    }
                    Action::StartMultiplex => {
                        self.multiplex = true;
                    }
                    Action::Finish => {
                        return AttemptEnd::Success(ServerSide {
                            stream: server,
                            leftover: lines.take_rest(),
                        });
                    }
                    Action::Redirect(referral) => {
                        return match self.hooks.resolve_redirect(&referral, self.port) {
                            Some((ip, port)) if port != 0 => {
                                self.pending_redirect = Some((ip, port));
                                AttemptEnd::Fail(ProxyError::new(
                                    FailureKind::AuthRedirect,
                                    referral.to_string(),
                                ))
                            }
                            _ => AttemptEnd::Fail(ProxyError::new(
                                FailureKind::Internal,
                                format!("Invalid redirect target: {referral}"),
                            )),
                        };
                    }
                    Action::Fail { kind, reason } => {
                        return AttemptEnd::Fail(ProxyError::new(kind, reason));
                    }
                }
            }
        }
    }

    async fn read_server_line(
        &mut self,
        server: &mut ServerStream,
        lines: &mut LineBuffer,
    ) -> LineEnd {
        loop {
            if let Some(line) = lines.next_line() {
                return LineEnd::Line(line);
            }
            if lines.len() > MAX_PROXY_INPUT_SIZE {
                return LineEnd::Fail(ProxyError::new(
                    FailureKind::Protocol,
                    "Server sent too long line",
                ));
            }
            let deadline = self.deadline();
            let mut buf = [0u8; 1024];
            let outcome = {
                let read_fut = async {
                    match deadline {
                        Some(deadline) => match timeout_at(deadline, server.read(&mut buf)).await {
                            Ok(result) => ReadOutcome::Io(result),
                            Err(_) => ReadOutcome::TimedOut,
                        },
                        None => ReadOutcome::Io(server.read(&mut buf).await),
                    }
                };
                tokio::pin!(read_fut);
                tokio::select! {
                    outcome = &mut read_fut => outcome,
                    Some(reason) = self.kill_rx.recv() => return LineEnd::Kicked(reason),
                }
            };
            match outcome {
                ReadOutcome::Io(Ok(0)) => {
                    return LineEnd::Fail(ProxyError::new(
                        FailureKind::Connect,
                        format!(
                            "Connection closed by server (state={})",
                            self.protocol.state_name()
                        ),
                    ));
                }
                ReadOutcome::Io(Ok(n)) => lines.extend(&buf[..n]),
                ReadOutcome::Io(Err(err)) => {
                    return LineEnd::Fail(ProxyError::new(
                        FailureKind::Connect,
                        format!("read() from server failed: {err}"),
                    ));
                }
                ReadOutcome::TimedOut => {
                    return LineEnd::Fail(ProxyError::new(
                        FailureKind::Connect,
                        self.connect_error("Connection timed out"),
                    ));
                }
            }
        }
    }

    async fn server_starttls(&mut self, server: ServerStream) -> Result<ServerStream, AttemptEnd> {
        let allow_invalid = self.settings.tls.allow_invalid_certs;
        let result = match self.deadline() {
            Some(deadline) => {
                match timeout_at(deadline, server.upgrade_tls(&self.host, allow_invalid)).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(AttemptEnd::Fail(ProxyError::new(
                            FailureKind::Connect,
                            self.connect_error("TLS handshake timed out"),
                        )));
                    }
                }
            }
            None => server.upgrade_tls(&self.host, allow_invalid).await,
        };
        result.map_err(|err| {
            AttemptEnd::Fail(ProxyError::new(
                FailureKind::Internal,
                format!("Failed to start TLS handshake: {err}"),
            ))
        })
    }

    /// Whether another connect may be scheduled: not disabled, attempts
    /// left, and enough of the pre-login budget remaining to be worth it.
    fn try_reconnect(&mut self) -> bool {
        if self.disable_reconnect || self.reconnects >= self.settings.max_reconnects {
            return false;
        }
        let elapsed = self.created.elapsed().as_millis() as u64;
        let budget = self.settings.connect_timeout.as_millis() as u64;
        if budget.saturating_sub(elapsed) <= PROXY_CONNECT_RETRY_MIN_MSECS {
            return false;
        }
        self.reconnects += 1;
        true
    }

    fn redirect_finish(&mut self, ip: IpAddr, port: u16) -> Result<(), ProxyError> {
        // Redirecting back to the current destination is a definite
        // immediate loop; revisiting an old destination becomes one once
        // its count passes the threshold.
        let looping = (ip == self.ip && port == self.port)
            || self
                .redirect_path
                .iter()
                .any(|entry| {
                    entry.ip == ip
                        && entry.port == port
                        && entry.count >= PROXY_REDIRECT_LOOP_MIN_COUNT
                });
        if looping {
            return Err(ProxyError::new(
                FailureKind::InternalConfig,
                format!("Proxying loops - already connected to {ip}:{port}"),
            ));
        }
        self.ttl -= 1;
        if let Some(entry) = self
            .redirect_path
            .iter_mut()
            .find(|entry| entry.ip == ip && entry.port == port)
        {
            entry.count += 1;
        } else {
            self.redirect_path.push(RedirectEntry {
                ip: self.ip,
                port: self.port,
                count: 1,
            });
        }
        tracing::debug!(
            context = "proxy",
            event = "redirecting",
            ip = %ip,
            port = port,
            ttl = self.ttl,
        );
        self.ip = ip;
        self.port = port;
        self.host = ip.to_string();
        self.dest = self.engine.registry.get(ip, port);
        Ok(())
    }

    async fn finish_failure<C>(
        &mut self,
        client_stream: &mut C,
        error: ProxyError,
    ) -> Result<ServerSide, (ProxyError, bool)>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if error.kind.is_auth() {
            tracing::debug!(
                context = "proxy",
                event = "session-failed",
                error = %error.reason,
                error_kind = error.kind.as_str(),
                "{}",
                error.reason,
            );
        } else {
            tracing::error!(
                context = "proxy",
                event = "session-failed",
                error = %error.reason,
                error_kind = error.kind.as_str(),
                reconnect_attempts = self.reconnects,
                "{}{}",
                error.kind.log_prefix(),
                error.reason,
            );
        }
        if let Some(reply) = self.protocol.failure_reply(error.kind, &error.reason) {
            // the client may already be gone; nothing more to do about it
            let _ = write_client(client_stream, &reply).await;
        }
        Err((error, false))
    }

    fn into_detached<C>(self, client_stream: C, server: ServerSide) -> Detached<C> {
        let pump_state = Arc::new(PumpState::new(self.bytes_to_server, self.bytes_to_client));
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let anvil_registered = match self.engine.anvil.as_deref() {
            Some(anvil) => anvil.connect(
                self.conn_id,
                &AnvilSession {
                    username: &self.client.username,
                    service: &self.client.service,
                    ip: self.client.ip,
                    dest_ip: self.ip,
                    alt_usernames: &self.client.alt_usernames,
                },
            ),
            None => false,
        };
        self.engine.link_detached(
            &self.client.username,
            DetachedHandle {
                conn_id: self.conn_id,
                kill: kill_tx,
                state: pump_state.clone(),
            },
        );
        tracing::debug!(
            parent: &self.span,
            context = "proxy",
            event = "session-detached",
            dest = %format!("{}:{}", self.ip, self.port),
        );
        Detached {
            engine: self.engine,
            client: self.client,
            conn_id: self.conn_id,
            dest: self.dest,
            dest_ip: self.ip,
            dest_port: self.port,
            notify_refresh: self.settings.notify_refresh,
            max_disconnect_delay_secs: self.settings.max_disconnect_delay_secs,
            hooks: self.hooks,
            span: self.span,
            multiplex: self.multiplex,
            anvil_registered,
            pump_state,
            client_stream,
            server_stream: server.stream,
            leftover: server.leftover,
            kill_rx,
        }
    }

    fn disconnect_counters(&mut self) {
        if self.connected {
            self.dest.active_end();
            self.connected = false;
        }
    }

    fn deadline(&self) -> Option<tokio::time::Instant> {
        if self.settings.connect_timeout.is_zero() {
            None
        } else {
            Some(tokio::time::Instant::from_std(
                self.created + self.settings.connect_timeout,
            ))
        }
    }

    fn connect_error(&self, errmsg: &str) -> String {
        let mut msg = if self.connected {
            format!(
                "Login timed out in state={}",
                self.protocol.state_name()
            )
        } else {
            format!("connect({}, {}) failed: {}", self.ip, self.port, errmsg)
        };
        msg.push_str(&format!(" (after {} secs", self.created.elapsed().as_secs()));
        if self.reconnects > 0 {
            msg.push_str(&format!(", {} reconnects", self.reconnects));
        }
        if let Some(source_ip) = self.settings.source_ip {
            msg.push_str(&format!(", local={source_ip}"));
        }
        msg.push(')');
        msg
    }
}

async fn connect_tcp(ip: IpAddr, port: u16, source_ip: Option<IpAddr>) -> io::Result<TcpStream> {
    let addr = SocketAddr::new(ip, port);
    match source_ip {
        None => TcpStream::connect(addr).await,
        Some(source) => {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(SocketAddr::new(source, 0))?;
            socket.connect(addr).await
        }
    }
}

async fn write_client<C: AsyncWrite + Unpin>(client: &mut C, bytes: &[u8]) -> io::Result<()> {
    client.write_all(bytes).await?;
    client.flush().await
}

pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        LineBuffer { buf: Vec::new() }
    }

    pub(crate) fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pop the next complete CRLF- (or bare LF-) terminated line.
    pub(crate) fn next_line(&mut self) -> Option<String> {
        let idx = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=idx).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Bytes read past the last complete line; handed to the pump so
    /// nothing the server already sent is lost.
    pub(crate) fn take_rest(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}
