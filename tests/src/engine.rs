/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Engine-level behavior exercised with a minimal test protocol, without
//! the POP3 driver in the way.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use proxy::{
    Action, ClientInfo, DialogContext, Engine, FailureKind, LoginProtocol, ProxySettings,
    SessionHooks, TlsConfig,
};
use tokio::io::AsyncReadExt;

use crate::pop3::backend::{expect, read_line_timeout, send, FakeBackend, Step};

/// Accepts any banner, optionally starts multiplexing, and finishes.
struct GreetOnly {
    multiplex: bool,
}

impl LoginProtocol for GreetOnly {
    fn reset(&mut self) {}

    fn server_line(&mut self, _ctx: &DialogContext, line: &str) -> Vec<Action> {
        if !line.starts_with("+OK") {
            return vec![Action::Fail {
                kind: FailureKind::Protocol,
                reason: format!("unexpected greeting: {line}"),
            }];
        }
        let mut actions = vec![Action::SendServer(b"READY\r\n".to_vec())];
        if self.multiplex {
            actions.push(Action::StartMultiplex);
        }
        actions.push(Action::Finish);
        actions
    }

    fn failure_reply(&self, _kind: FailureKind, _reason: &str) -> Option<Vec<u8>> {
        None
    }

    fn state_name(&self) -> &'static str {
        "greeting"
    }
}

struct CountingHooks {
    side_lines: Arc<AtomicUsize>,
}

impl SessionHooks for CountingHooks {
    fn side_channel(&mut self, args: &[&str]) -> Result<(), String> {
        assert_eq!(args[0], "ping");
        self.side_lines.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn client_info(username: &str) -> ClientInfo {
    ClientInfo {
        username: username.to_string(),
        service: "pop3".to_string(),
        session_id: "sEng1".to_string(),
        ip: "192.0.2.10".parse().unwrap(),
        port: 50441,
        local_ip: "192.0.2.1".parse().unwrap(),
        local_port: 110,
        local_name: None,
        tls_secured: false,
        not_trusted: false,
        proxy_ttl: 2,
        alt_usernames: Vec::new(),
        multiplex_capable: false,
    }
}

fn proxy_settings(addr: SocketAddr) -> ProxySettings {
    ProxySettings {
        host: addr.ip().to_string(),
        ip: addr.ip(),
        port: addr.port(),
        source_ip: None,
        tls: TlsConfig::default(),
        connect_timeout: Duration::from_secs(10),
        notify_refresh: Duration::ZERO,
        host_immediate_failure_after: Duration::ZERO,
        max_reconnects: 0,
        max_disconnect_delay_secs: 0,
        rawlog_dir: None,
    }
}

fn frame(channel: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![channel];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[tokio::test]
async fn multiplexed_server_input_is_demultiplexed() {
    let mut multiplexed = Vec::new();
    multiplexed.extend_from_slice(&frame(1, b"ping\tnow\n"));
    multiplexed.extend_from_slice(&frame(0, b"+OK mailbox data\r\n"));
    let backend = FakeBackend::start(vec![vec![
        send("+OK ready"),
        expect("READY"),
        Step::SendRaw(multiplexed),
    ]])
    .await;

    let engine = Engine::new(None, None);
    let (client_side, mut client) = tokio::io::duplex(4096);
    let side_lines = Arc::new(AtomicUsize::new(0));
    let session = engine
        .proxy(
            client_info("alice"),
            proxy_settings(backend.addr()),
            GreetOnly { multiplex: true },
        )
        .unwrap()
        .with_hooks(Box::new(CountingHooks {
            side_lines: side_lines.clone(),
        }));

    let detached = session.run(client_side).await.unwrap_or_else(|failed| {
        panic!("pre-login failed: {}", failed.error);
    });
    let serving = detached.spawn();

    // channel 0 comes through the pump; channel 1 goes to the hooks
    assert_eq!(read_line_timeout(&mut client).await, "+OK mailbox data");
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("serve did not finish")
        .unwrap();
    assert_eq!(side_lines.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn shutdown_tears_down_every_session() {
    let hold_script = || {
        vec![
            send("+OK ready"),
            expect("READY"),
            Step::Hold,
        ]
    };
    let backend = FakeBackend::start(vec![hold_script(), hold_script()]).await;

    let engine = Engine::new(None, None);
    let mut clients = Vec::new();
    let mut tasks = Vec::new();
    for user in ["alice", "bob"] {
        let (client_side, client) = tokio::io::duplex(4096);
        let session = engine
            .proxy(
                client_info(user),
                proxy_settings(backend.addr()),
                GreetOnly { multiplex: false },
            )
            .unwrap();
        let detached = session.run(client_side).await.unwrap_or_else(|failed| {
            panic!("pre-login failed: {}", failed.error);
        });
        tasks.push(detached.spawn());
        clients.push(client);
    }
    assert_eq!(engine.detached_count(), 2);

    assert_eq!(engine.shutdown(), 2);
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session survived shutdown")
            .unwrap();
    }
    assert_eq!(engine.detached_count(), 0);

    for mut client in clients {
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
