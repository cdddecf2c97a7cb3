/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod control;
pub mod multiplex;
pub mod pump;
pub mod rawlog;
pub mod session;
pub mod state;
pub mod stream;

use std::{
    net::IpAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, AtomicUsize},
        Arc,
    },
    time::Duration,
};

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::watch;

use crate::control::{DetachedHandle, PendingHandle};

/// Maximum length of a single pre-login line from the backend.
pub const MAX_PROXY_INPUT_SIZE: usize = 4096;
/// Client-side output buffer cap once detached; keeps backpressure pointed
/// at the backend instead of buffering unbounded data for a slow client.
pub const PROXY_MAX_OUTBUF_SIZE: usize = 1024;
/// Detached sessions idle longer than this are closed immediately on
/// shutdown; younger ones get the remainder as a grace timer.
pub const LOGIN_PROXY_DIE_IDLE_SECS: u64 = 2;
pub const LOGIN_PROXY_KILL_PREFIX: &str = "Disconnected by proxy: ";
pub const KILLED_BY_ADMIN_REASON: &str = "Kicked by admin";
pub const KILLED_BY_SHUTDOWN_REASON: &str = "Process shutting down";
pub const LOGIN_PROXY_SIDE_SELF: &str = "proxy";
/// Wait this long before retrying on reconnect.
pub const PROXY_CONNECT_RETRY_MSECS: u64 = 1000;
/// Don't even try to reconnect if proxying will time out in less than this.
pub const PROXY_CONNECT_RETRY_MIN_MSECS: u64 = PROXY_CONNECT_RETRY_MSECS + 100;
pub const PROXY_DISCONNECT_INTERVAL_MSECS: u64 = 100;
/// How many times the same ip:port can be connected to before proxying
/// decides that it's a loop and fails. The first revisit isn't necessarily a
/// loop, just a reversed dynamic decision that it was actually the proper
/// destination.
pub const PROXY_REDIRECT_LOOP_MIN_COUNT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connect,
    Internal,
    InternalConfig,
    Remote,
    RemoteConfig,
    Protocol,
    AuthReplied,
    AuthNotReplied,
    AuthTempfail,
    AuthRedirect,
}

impl FailureKind {
    /// Whether the engine may schedule a reconnect for this failure, budget
    /// permitting.
    pub fn may_retry(&self) -> bool {
        matches!(
            self,
            FailureKind::Connect
                | FailureKind::Remote
                | FailureKind::Protocol
                | FailureKind::AuthTempfail
        )
    }

    /// Auth failures are the client's business, not operational errors.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            FailureKind::AuthReplied | FailureKind::AuthNotReplied | FailureKind::AuthTempfail
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Connect => "connect",
            FailureKind::Internal => "internal",
            FailureKind::InternalConfig => "internal_config",
            FailureKind::Remote => "remote",
            FailureKind::RemoteConfig => "remote_config",
            FailureKind::Protocol => "protocol",
            FailureKind::AuthReplied => "auth_replied",
            FailureKind::AuthNotReplied => "auth_not_replied",
            FailureKind::AuthTempfail => "auth_tempfail",
            FailureKind::AuthRedirect => "auth_redirect",
        }
    }

    pub(crate) fn log_prefix(&self) -> &'static str {
        match self {
            FailureKind::Internal => "Aborting due to internal error: ",
            FailureKind::Remote | FailureKind::RemoteConfig => "Aborting due to remote server: ",
            FailureKind::Protocol => "Remote server sent invalid input: ",
            _ => "",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct ProxyError {
    pub kind: FailureKind,
    pub reason: String,
}

impl ProxyError {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        ProxyError {
            kind,
            reason: reason.into(),
        }
    }
}

/// TLS policy toward the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    #[default]
    None,
    /// Handshake immediately after the TCP connect.
    Implicit,
    /// Upgrade mid-dialog via the protocol's STARTTLS command.
    StartTls,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub mode: TlsMode,
    pub allow_invalid_certs: bool,
}

/// Per-session settings resolved by the caller before the proxy is built.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub host: String,
    pub ip: IpAddr,
    pub port: u16,
    pub source_ip: Option<IpAddr>,
    pub tls: TlsConfig,
    /// Budget for the whole pre-login including reconnects; zero disables
    /// the timer (and with it, reconnects).
    pub connect_timeout: Duration,
    /// Period of "still proxied" notify-pipe refreshes; zero disables.
    pub notify_refresh: Duration,
    /// Fast-fail window; zero disables.
    pub host_immediate_failure_after: Duration,
    pub max_reconnects: u32,
    /// Window over which to spread mass disconnects; zero disables.
    pub max_disconnect_delay_secs: u32,
    pub rawlog_dir: Option<PathBuf>,
}

/// Recognized configuration options with their documented names; resolved
/// into per-session `ProxySettings` by the protocol front end.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub login_proxy_max_reconnects: u32,
    pub login_proxy_max_disconnect_delay: u32,
    pub connect_timeout_msecs: u64,
    pub notify_refresh_secs: u64,
    pub host_immediate_failure_after_secs: u64,
    pub source_ip: Option<IpAddr>,
    pub rawlog_dir: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            login_proxy_max_reconnects: 3,
            login_proxy_max_disconnect_delay: 0,
            connect_timeout_msecs: 30_000,
            notify_refresh_secs: 0,
            host_immediate_failure_after_secs: 0,
            source_ip: None,
            rawlog_dir: None,
        }
    }
}

impl ProxyConfig {
    pub fn settings(&self, host: impl Into<String>, ip: IpAddr, port: u16, tls: TlsConfig) -> ProxySettings {
        ProxySettings {
            host: host.into(),
            ip,
            port,
            source_ip: self.source_ip,
            tls,
            connect_timeout: Duration::from_millis(self.connect_timeout_msecs),
            notify_refresh: Duration::from_secs(self.notify_refresh_secs),
            host_immediate_failure_after: Duration::from_secs(
                self.host_immediate_failure_after_secs,
            ),
            max_reconnects: self.login_proxy_max_reconnects,
            max_disconnect_delay_secs: self.login_proxy_max_disconnect_delay,
            rawlog_dir: self.rawlog_dir.clone(),
        }
    }
}

/// Identity of the client connection being proxied, as established by the
/// front end before the proxy is created.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Normalized username owning the session; keys the detached index.
    pub username: String,
    /// Service name reported to accounting ("pop3").
    pub service: String,
    pub session_id: String,
    /// End-client remote address.
    pub ip: IpAddr,
    pub port: u16,
    /// Our listening socket, used for redirect self-detection by the
    /// surrounding layer.
    pub local_ip: IpAddr,
    pub local_port: u16,
    /// TLS SNI name the client connected with, forwarded as DESTNAME.
    pub local_name: Option<String>,
    /// Whether the end-client connection itself is TLS-secured.
    pub tls_secured: bool,
    /// Untrusted clients never get their identity forwarded via XCLIENT.
    pub not_trusted: bool,
    /// Hop budget, decremented on each redirect.
    pub proxy_ttl: u32,
    /// Extra account identifiers reported to accounting.
    pub alt_usernames: Vec<(String, String)>,
    /// Whether the client side carries a compatible multiplex stream; when
    /// both sides do, the detached pump short-circuits to the raw streams.
    pub multiplex_capable: bool,
}

/// Parsed redirect target surfaced by a protocol driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Referral {
    pub user: Option<String>,
    pub host: ReferralHost,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferralHost {
    Ip(IpAddr),
    Name(String),
}

impl std::fmt::Display for Referral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(user) = &self.user {
            f.write_str(user)?;
        }
        f.write_str("@")?;
        match &self.host {
            ReferralHost::Ip(IpAddr::V4(ip)) => write!(f, "{ip}")?,
            ReferralHost::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]")?,
            ReferralHost::Name(name) => f.write_str(name)?,
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

/// What the engine should do next, as decided by the protocol driver for
/// one server line.
#[derive(Debug)]
pub enum Action {
    /// Write bytes to the backend.
    SendServer(Vec<u8>),
    /// Write bytes to the end client.
    SendClient(Vec<u8>),
    /// Upgrade the backend connection to TLS; subsequent actions and lines
    /// use the upgraded stream.
    StartTls,
    /// Wrap the backend input in the multiplex demultiplexer at detach.
    StartMultiplex,
    /// Pre-login is complete; detach and start pumping.
    Finish,
    /// The backend redirected the session elsewhere.
    Redirect(Referral),
    Fail {
        kind: FailureKind,
        reason: String,
    },
}

/// State passed to the driver with each server line.
#[derive(Debug, Clone, Copy)]
pub struct DialogContext {
    /// Current hop budget (after any redirects so far).
    pub ttl: u32,
}

/// A protocol-specific pre-login driver plugged into the engine. The engine
/// feeds it one server line at a time and executes the actions it returns;
/// after detach it is never invoked again.
pub trait LoginProtocol: Send {
    /// Return to the initial (banner) state; called before every connect.
    fn reset(&mut self);

    fn server_line(&mut self, ctx: &DialogContext, line: &str) -> Vec<Action>;

    /// Reply to send the client when the session fails for good. `None`
    /// sends nothing (the reply was already passed through).
    fn failure_reply(&self, kind: FailureKind, reason: &str) -> Option<Vec<u8>>;

    /// Name of the current dialog state, for timeout diagnostics.
    fn state_name(&self) -> &'static str {
        "none"
    }
}

/// Session-level hooks into the surrounding layer: redirect resolution
/// (normally a passdb lookup) and side-channel command handling.
pub trait SessionHooks: Send {
    /// Map a referral to a concrete destination. The default accepts IP
    /// literals and keeps the current port when the referral names none.
    fn resolve_redirect(
        &mut self,
        referral: &Referral,
        current_port: u16,
    ) -> Option<(IpAddr, u16)> {
        match &referral.host {
            ReferralHost::Ip(ip) => Some((*ip, referral.port.unwrap_or(current_port))),
            ReferralHost::Name(_) => None,
        }
    }

    /// Handle one side-channel command line, already split on tabs.
    /// An `Err` tears the proxy down.
    fn side_channel(&mut self, args: &[&str]) -> Result<(), String> {
        Err(format!("unsupported side channel command: {}", args[0]))
    }
}

pub struct DefaultHooks;

impl SessionHooks for DefaultHooks {}

/// Session descriptor reported to the anvil accounting sidecar.
#[derive(Debug)]
pub struct AnvilSession<'a> {
    pub username: &'a str,
    pub service: &'a str,
    pub ip: IpAddr,
    pub dest_ip: IpAddr,
    pub alt_usernames: &'a [(String, String)],
}

/// External accounting sidecar tracking active sessions per user.
pub trait Anvil: Send + Sync {
    /// Register a detached session; returns false if the sidecar refused,
    /// in which case no disconnect is reported either.
    fn connect(&self, conn_id: u64, session: &AnvilSession<'_>) -> bool;

    fn disconnect(&self, conn_id: u64, session: &AnvilSession<'_>);
}

/// Process-wide proxy engine: destination health registry, pending list,
/// detached per-user index, notify pipe, accounting. Constructed explicitly
/// at startup; everything a session needs hangs off an `Arc<Engine>`.
pub struct Engine {
    pub(crate) registry: state::Registry,
    pub(crate) pending: Mutex<Vec<PendingHandle>>,
    pub(crate) detached: Mutex<AHashMap<String, Vec<DetachedHandle>>>,
    pub(crate) detached_count: AtomicUsize,
    pub(crate) next_conn_id: AtomicU64,
    pub(crate) anvil: Option<Arc<dyn Anvil>>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    pub fn new(notify_path: Option<PathBuf>, anvil: Option<Arc<dyn Anvil>>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Engine {
            registry: state::Registry::new(notify_path),
            pending: Mutex::new(Vec::new()),
            detached: Mutex::new(AHashMap::new()),
            detached_count: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
            anvil,
            shutdown_tx,
        })
    }

    /// The destination health registry.
    pub fn state(&self) -> &state::Registry {
        &self.registry
    }
}

/// Validation used for `local_name` before it is forwarded in XCLIENT and
/// for referral host names.
pub fn is_valid_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}
