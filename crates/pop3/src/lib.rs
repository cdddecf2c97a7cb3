/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod referral;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use proxy::{Action, ClientInfo, DialogContext, FailureKind, LoginProtocol};

pub const AUTH_FAILED_MSG: &str = "Authentication failed.";
pub const LOGIN_PROXY_FAILURE_MSG: &str = "Account is temporarily unavailable.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Banner,
    StartTls,
    XClient,
    Login1,
    Login2,
}

/// Login settings resolved from the passdb for one proxied session.
#[derive(Debug, Clone)]
pub struct Pop3Settings {
    /// Account to log in as on the backend.
    pub user: String,
    /// Master user to authenticate as, if different from `user`.
    pub master_user: Option<String>,
    pub password: String,
    /// SASL mechanism; `None` uses the plain USER/PASS commands.
    pub mechanism: Option<sasl::Mechanism>,
    /// Upgrade to TLS with STLS before logging in.
    pub starttls: bool,
    /// `name=value` entries forwarded to the backend via XCLIENT, in
    /// passdb order.
    pub forward_fields: Vec<String>,
}

impl Pop3Settings {
    /// Collect the `forward_*` passdb extra fields, dropping the prefix
    /// but keeping their order.
    pub fn forward_fields_from_passdb(args: &[String]) -> Vec<String> {
        args.iter()
            .filter_map(|arg| {
                if arg.len() >= 8 && arg[..8].eq_ignore_ascii_case("forward_") {
                    Some(arg[8..].to_string())
                } else {
                    None
                }
            })
            .collect()
    }
}

/// POP3 pre-login driver: banner, optional STLS, optional XCLIENT
/// forwarding, then USER/PASS or an AUTH exchange.
pub struct Pop3Proxy {
    settings: Pop3Settings,
    client: ClientInfo,
    state: State,
    xclient: bool,
    sasl: Option<sasl::Client>,
}

impl Pop3Proxy {
    pub fn new(settings: Pop3Settings, client: ClientInfo) -> Self {
        Pop3Proxy {
            settings,
            client,
            state: State::Banner,
            xclient: false,
            sasl: None,
        }
    }

    fn send_login(&mut self, ctx: &DialogContext) -> Vec<Action> {
        let mut actions = Vec::new();

        if self.xclient && !self.client.not_trusted {
            let mut line = format!(
                "XCLIENT ADDR={} PORT={} SESSION={} TTL={} CLIENT-TRANSPORT={}",
                self.client.ip,
                self.client.port,
                self.client.session_id,
                ctx.ttl - 1,
                if self.client.tls_secured {
                    "TLS"
                } else {
                    "insecure"
                },
            );
            // local_name was validated as a DNS name before connecting
            if let Some(name) = self.client.local_name.as_deref() {
                line.push_str(" DESTNAME=");
                line.push_str(name);
            }
            let forward = self
                .settings
                .forward_fields
                .iter()
                .map(|field| tab_escape(field))
                .collect::<Vec<_>>()
                .join("\t");
            if !forward.is_empty() {
                line.push_str(" FORWARD=");
                line.push_str(&BASE64.encode(forward.as_bytes()));
            }
            line.push_str("\r\n");
            actions.push(Action::SendServer(line.into_bytes()));
            self.state = State::XClient;
        } else {
            self.state = State::Login1;
        }

        let Some(mechanism) = self.settings.mechanism else {
            actions.push(Action::SendServer(
                format!("USER {}\r\n", self.settings.user).into_bytes(),
            ));
            return actions;
        };

        let mut sasl_client = mechanism.client(sasl::Credentials {
            authid: Some(
                self.settings
                    .master_user
                    .clone()
                    .unwrap_or_else(|| self.settings.user.clone()),
            ),
            authzid: Some(self.settings.user.clone()),
            password: Some(self.settings.password.clone()),
        });
        let initial = match sasl_client.output() {
            Ok(initial) => initial,
            Err(err) => {
                actions.push(Action::Fail {
                    kind: FailureKind::Internal,
                    reason: format!("SASL mechanism {mechanism} init failed: {err}"),
                });
                return actions;
            }
        };
        let mut line = format!("AUTH {mechanism} ");
        if initial.is_empty() {
            line.push('=');
        } else {
            line.push_str(&BASE64.encode(&initial));
        }
        line.push_str("\r\n");
        actions.push(Action::SendServer(line.into_bytes()));
        self.sasl = Some(sasl_client);

        if self.state != State::XClient {
            self.state = State::Login2;
        }
        actions
    }

    fn continue_sasl(&mut self, value: &str) -> Vec<Action> {
        let data = match BASE64.decode(value.as_bytes()) {
            Ok(data) => data,
            Err(_) => {
                return vec![Action::Fail {
                    kind: FailureKind::Protocol,
                    reason: "Invalid base64 data in AUTH response".to_string(),
                }];
            }
        };
        let Some(sasl_client) = self.sasl.as_mut() else {
            return vec![Action::Fail {
                kind: FailureKind::Internal,
                reason: "SASL continuation without an active mechanism".to_string(),
            }];
        };
        let step = sasl_client.input(&data).and_then(|()| sasl_client.output());
        match step {
            Ok(token) => {
                let mut reply = BASE64.encode(&token).into_bytes();
                reply.extend_from_slice(b"\r\n");
                vec![Action::SendServer(reply)]
            }
            Err(sasl::Error::AuthFailed(reason)) => vec![Action::Fail {
                kind: FailureKind::AuthNotReplied,
                reason,
            }],
            Err(sasl::Error::Protocol(reason)) => vec![Action::Fail {
                kind: FailureKind::Protocol,
                reason: format!("Invalid authentication data: {reason}"),
            }],
            Err(sasl::Error::Internal(reason)) => vec![Action::Fail {
                kind: FailureKind::Internal,
                reason,
            }],
        }
    }

    /// Non-`+OK` reply in a login state: surface the failure, passing the
    /// backend's own reply through to the client where appropriate.
    fn login_failure(&mut self, line: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        let kind;
        let reason;
        if let Some(rest) = line.strip_prefix("-ERR ") {
            if rest.starts_with("[SYS/TEMP]") {
                // reply is delayed until the reconnect decision
                kind = FailureKind::AuthTempfail;
                reason = rest.to_string();
            } else if let Some(referral) = referral::parse(rest) {
                return vec![Action::Redirect(referral)];
            } else {
                if rest.starts_with("[REFERRAL/") {
                    tracing::debug!(
                        context = "pop3-proxy",
                        event = "referral-unparseable",
                        response = %sanitize(rest, 160),
                    );
                }
                actions.push(Action::SendClient(format!("{line}\r\n").into_bytes()));
                kind = FailureKind::AuthReplied;
                reason = rest.to_string();
            }
        } else {
            actions.push(Action::SendClient(
                format!("-ERR {AUTH_FAILED_MSG}\r\n").into_bytes(),
            ));
            kind = FailureKind::AuthReplied;
            reason = line.to_string();
        }
        actions.push(Action::Fail { kind, reason });
        actions
    }
}

impl LoginProtocol for Pop3Proxy {
    fn reset(&mut self) {
        self.state = State::Banner;
        self.xclient = false;
        self.sasl = None;
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            State::Banner => "banner",
            State::StartTls => "starttls",
            State::XClient => "xclient",
            State::Login1 => "login1",
            State::Login2 => "login2",
        }
    }

    fn server_line(&mut self, ctx: &DialogContext, line: &str) -> Vec<Action> {
        match self.state {
            State::Banner => {
                let Some(rest) = line.strip_prefix("+OK") else {
                    return vec![Action::Fail {
                        kind: FailureKind::Protocol,
                        reason: format!("Invalid banner: {}", sanitize(line, 160)),
                    }];
                };
                self.xclient = rest.starts_with(" [XCLIENT]");
                if self.settings.starttls {
                    self.state = State::StartTls;
                    vec![Action::SendServer(b"STLS\r\n".to_vec())]
                } else {
                    self.send_login(ctx)
                }
            }
            State::StartTls => {
                if !line.starts_with("+OK") {
                    return vec![Action::Fail {
                        kind: FailureKind::Remote,
                        reason: format!("STLS failed: {}", sanitize(line, 160)),
                    }];
                }
                let mut actions = vec![Action::StartTls];
                actions.append(&mut self.send_login(ctx));
                actions
            }
            State::XClient => {
                if !line.starts_with("+OK") {
                    return vec![Action::Fail {
                        kind: FailureKind::Remote,
                        reason: format!("XCLIENT failed: {}", sanitize(line, 160)),
                    }];
                }
                self.state = if self.sasl.is_none() {
                    State::Login1
                } else {
                    State::Login2
                };
                Vec::new()
            }
            State::Login1 => {
                if !line.starts_with("+OK") {
                    return self.login_failure(line);
                }
                // USER accepted, send PASS
                self.state = State::Login2;
                vec![Action::SendServer(
                    format!("PASS {}\r\n", self.settings.password).into_bytes(),
                )]
            }
            State::Login2 => {
                if let Some(value) = line.strip_prefix("+ ") {
                    if self.sasl.is_some() {
                        return self.continue_sasl(value);
                    }
                }
                if !line.starts_with("+OK") {
                    return self.login_failure(line);
                }
                // login successful; the backend's reply goes to the client
                vec![
                    Action::SendClient(format!("{line}\r\n").into_bytes()),
                    Action::Finish,
                ]
            }
        }
    }

    fn failure_reply(&self, kind: FailureKind, reason: &str) -> Option<Vec<u8>> {
        match kind {
            FailureKind::Connect
            | FailureKind::Internal
            | FailureKind::Remote
            | FailureKind::Protocol
            | FailureKind::AuthRedirect => {
                Some(format!("-ERR [SYS/TEMP] {LOGIN_PROXY_FAILURE_MSG}\r\n").into_bytes())
            }
            FailureKind::InternalConfig
            | FailureKind::RemoteConfig
            | FailureKind::AuthNotReplied => {
                Some(format!("-ERR {LOGIN_PROXY_FAILURE_MSG}\r\n").into_bytes())
            }
            // the [SYS/TEMP] prefix is already in the reason
            FailureKind::AuthTempfail => Some(format!("-ERR {reason}\r\n").into_bytes()),
            FailureKind::AuthReplied => None,
        }
    }
}

/// Escape a value for embedding in a tab-joined list.
fn tab_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\x01' => out.push_str("\x011"),
            '\0' => out.push_str("\x010"),
            '\t' => out.push_str("\x01t"),
            '\n' => out.push_str("\x01n"),
            '\r' => out.push_str("\x01r"),
            c => out.push(c),
        }
    }
    out
}

/// Truncate and de-fang untrusted protocol text before logging it.
fn sanitize(input: &str, max: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max));
    for c in input.chars() {
        if out.len() >= max {
            out.push_str("...");
            break;
        }
        out.push(if c.is_control() { '?' } else { c });
    }
    out
}
