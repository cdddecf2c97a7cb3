/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod backend;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use pop3::{Pop3Proxy, Pop3Settings, LOGIN_PROXY_FAILURE_MSG};
use proxy::{
    Anvil, AnvilSession, ClientInfo, Engine, FailureKind, ProxySettings, TlsConfig, TlsMode,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use self::backend::{expect, expect_prefix, read_line_timeout, read_to_eof, send, FakeBackend, Step};

fn client_info() -> ClientInfo {
    ClientInfo {
        username: "alice".to_string(),
        service: "pop3".to_string(),
        session_id: "s1DLbJlkjrGF".to_string(),
        ip: "192.0.2.10".parse().unwrap(),
        port: 50441,
        local_ip: "192.0.2.1".parse().unwrap(),
        local_port: 110,
        local_name: None,
        tls_secured: false,
        not_trusted: false,
        proxy_ttl: 5,
        alt_usernames: Vec::new(),
        multiplex_capable: false,
    }
}

fn pop3_settings() -> Pop3Settings {
    Pop3Settings {
        user: "alice".to_string(),
        master_user: None,
        password: "s3cret".to_string(),
        mechanism: None,
        starttls: false,
        forward_fields: Vec::new(),
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
        max_reconnects: 3,
        max_disconnect_delay_secs: 0,
        rawlog_dir: None,
    }
}

fn user_pass_script(final_reply: &str) -> Vec<Step> {
    vec![
        send("+OK POP3 ready"),
        expect("USER alice"),
        send("+OK"),
        expect("PASS s3cret"),
        send(final_reply),
    ]
}

#[tokio::test]
async fn plaintext_user_pass_detaches_and_pumps() {
    let mut script = user_pass_script("+OK Logged in.");
    script.push(expect("QUIT"));
    script.push(send("+OK bye"));
    let backend = FakeBackend::start(vec![script]).await;

    let engine = Engine::new(None, None);
    let (client_side, mut client) = tokio::io::duplex(4096);
    let driver = Pop3Proxy::new(pop3_settings(), client_info());
    let session = engine
        .proxy(client_info(), proxy_settings(backend.addr()), driver)
        .unwrap();

    let detached = session.run(client_side).await.unwrap_or_else(|failed| {
        panic!("pre-login failed: {}", failed.error);
    });

    assert_eq!(read_line_timeout(&mut client).await, "+OK Logged in.");
    assert_eq!(engine.detached_count(), 1);
    assert_eq!(engine.state().get(backend.ip(), backend.port()).active(), 1);
    assert_eq!(engine.state().get(backend.ip(), backend.port()).waiting(), 0);

    let serving = detached.spawn();
    client.write_all(b"QUIT\r\n").await.unwrap();
    assert_eq!(read_line_timeout(&mut client).await, "+OK bye");

    // backend script is done; its close ends the pump
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("serve task did not finish")
        .unwrap();
    assert_eq!(engine.detached_count(), 0);
    assert_eq!(engine.state().get(backend.ip(), backend.port()).active(), 0);

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn starttls_then_auth_plain() {
    let token = BASE64.encode(b"alice\0alice\0s3cret");
    let backend = FakeBackend::start(vec![vec![
        send("+OK POP3 ready"),
        expect("STLS"),
        send("+OK Begin TLS negotiation now."),
        Step::StartTls,
        expect(format!("AUTH PLAIN {token}")),
        send("+OK Logged in."),
    ]])
    .await;

    let engine = Engine::new(None, None);
    let (client_side, mut client) = tokio::io::duplex(4096);
    let mut settings = proxy_settings(backend.addr());
    settings.tls = TlsConfig {
        mode: TlsMode::StartTls,
        allow_invalid_certs: true,
    };
    let mut login = pop3_settings();
    login.starttls = true;
    login.mechanism = Some(sasl::Mechanism::Plain);

    let session = engine
        .proxy(client_info(), settings, Pop3Proxy::new(login, client_info()))
        .unwrap();
    let detached = session.run(client_side).await.unwrap_or_else(|failed| {
        panic!("pre-login failed: {}", failed.error);
    });

    assert_eq!(read_line_timeout(&mut client).await, "+OK Logged in.");
    assert_eq!(engine.detached_count(), 1);
    drop(detached);
}

#[tokio::test]
async fn xclient_then_auth_login() {
    let backend = FakeBackend::start(vec![vec![
        send("+OK [XCLIENT] POP3 ready"),
        expect_prefix("XCLIENT ADDR=192.0.2.10 PORT=50441 SESSION=s1DLbJlkjrGF TTL=4 CLIENT-TRANSPORT=insecure"),
        send("+OK Updated"),
        expect("AUTH LOGIN ="),
        send(format!("+ {}", BASE64.encode("Username:"))),
        expect(BASE64.encode("alice")),
        send(format!("+ {}", BASE64.encode("Password:"))),
        expect(BASE64.encode("s3cret")),
        send("+OK Logged in."),
    ]])
    .await;

    let engine = Engine::new(None, None);
    let (client_side, mut client) = tokio::io::duplex(4096);
    let mut login = pop3_settings();
    login.mechanism = Some(sasl::Mechanism::Login);

    let session = engine
        .proxy(
            client_info(),
            proxy_settings(backend.addr()),
            Pop3Proxy::new(login, client_info()),
        )
        .unwrap();
    let detached = session.run(client_side).await.unwrap_or_else(|failed| {
        panic!("pre-login failed: {}", failed.error);
    });

    assert_eq!(read_line_timeout(&mut client).await, "+OK Logged in.");
    assert_eq!(engine.detached_count(), 1);
    drop(detached);
}

#[tokio::test]
async fn tempfail_retries_then_succeeds() {
    let backend = FakeBackend::start(vec![
        user_pass_script("-ERR [SYS/TEMP] DB down"),
        user_pass_script("+OK Logged in."),
    ])
    .await;

    let engine = Engine::new(None, None);
    let (client_side, mut client) = tokio::io::duplex(4096);
    let session = engine
        .proxy(
            client_info(),
            proxy_settings(backend.addr()),
            Pop3Proxy::new(pop3_settings(), client_info()),
        )
        .unwrap();

    let started = Instant::now();
    let detached = session.run(client_side).await.unwrap_or_else(|failed| {
        panic!("pre-login failed: {}", failed.error);
    });

    // one reconnect, spaced by the retry interval; the tempfail reply was
    // held back because a retry was possible
    assert!(started.elapsed() >= Duration::from_millis(1000));
    assert_eq!(read_line_timeout(&mut client).await, "+OK Logged in.");
    drop(detached);
}

#[tokio::test]
async fn tempfail_without_retry_reaches_the_client() {
    let backend = FakeBackend::start(vec![user_pass_script("-ERR [SYS/TEMP] DB down")]).await;

    let engine = Engine::new(None, None);
    let (client_side, mut client) = tokio::io::duplex(4096);
    let mut settings = proxy_settings(backend.addr());
    settings.max_reconnects = 0;
    let session = engine
        .proxy(
            client_info(),
            settings,
            Pop3Proxy::new(pop3_settings(), client_info()),
        )
        .unwrap();

    let failed = session.run(client_side).await.err().expect("must fail");
    assert_eq!(failed.error.kind, FailureKind::AuthTempfail);
    assert!(!failed.kicked);
    assert_eq!(read_line_timeout(&mut client).await, "-ERR [SYS/TEMP] DB down");
}

#[tokio::test]
async fn redirect_loop_fails_with_internal_config() {
    // two backends referring logins to each other until the path entry
    // for the first one reaches the loop threshold
    let backend_b_port = {
        // reserve a port for B so A's scripts can name it
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        port
    };
    let referral_script = |target: SocketAddr| {
        vec![
            send("+OK POP3 ready"),
            expect("USER alice"),
            send(format!(
                "-ERR [REFERRAL/{}:{}]",
                target.ip(),
                target.port()
            )),
        ]
    };

    let backend_a = FakeBackend::start(vec![
        referral_script(SocketAddr::new("127.0.0.1".parse().unwrap(), backend_b_port)),
        referral_script(SocketAddr::new("127.0.0.1".parse().unwrap(), backend_b_port)),
    ])
    .await;
    let addr_a = backend_a.addr();
    let backend_b = FakeBackend::start_on(backend_b_port, vec![
        referral_script(addr_a),
        referral_script(addr_a),
    ])
    .await;

    let engine = Engine::new(None, None);
    let (client_side, mut client) = tokio::io::duplex(4096);
    let session = engine
        .proxy(
            client_info(),
            proxy_settings(backend_a.addr()),
            Pop3Proxy::new(pop3_settings(), client_info()),
        )
        .unwrap();

    let failed = session.run(client_side).await.err().expect("must fail");
    assert_eq!(failed.error.kind, FailureKind::InternalConfig);
    assert!(failed.error.reason.starts_with("Proxying loops"));
    assert_eq!(
        read_line_timeout(&mut client).await,
        format!("-ERR {LOGIN_PROXY_FAILURE_MSG}")
    );
    drop(backend_b);
}

#[tokio::test]
async fn kick_user_closes_detached_sessions() {
    let mut script = user_pass_script("+OK Logged in.");
    script.push(Step::Hold);
    let backend = FakeBackend::start(vec![script]).await;

    let engine = Engine::new(None, None);
    let (client_side, mut client) = tokio::io::duplex(4096);
    let session = engine
        .proxy(
            client_info(),
            proxy_settings(backend.addr()),
            Pop3Proxy::new(pop3_settings(), client_info()),
        )
        .unwrap();
    let detached = session.run(client_side).await.unwrap_or_else(|failed| {
        panic!("pre-login failed: {}", failed.error);
    });
    let serving = detached.spawn();
    assert_eq!(read_line_timeout(&mut client).await, "+OK Logged in.");

    assert_eq!(engine.kick_user("bob", None), 0);
    assert_eq!(engine.kick_user("alice", None), 1);
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("kicked session did not close")
        .unwrap();
    assert_eq!(engine.detached_count(), 0);

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn kick_user_hits_pending_sessions() {
    let backend = FakeBackend::start(vec![vec![
        send("+OK POP3 ready"),
        expect("USER alice"),
        Step::Hold,
    ]])
    .await;

    let engine = Engine::new(None, None);
    let (client_side, mut client) = tokio::io::duplex(4096);
    let session = engine
        .proxy(
            client_info(),
            proxy_settings(backend.addr()),
            Pop3Proxy::new(pop3_settings(), client_info()),
        )
        .unwrap();

    let engine_clone = engine.clone();
    let kicker = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        engine_clone.kick_user("alice", None)
    });

    let failed = session.run(client_side).await.err().expect("must fail");
    assert!(failed.kicked);
    assert_eq!(kicker.await.unwrap(), 1);

    // a kicked pending session sends no reply
    drop(failed);
    let lines = read_to_eof(&mut client).await;
    assert!(lines.is_empty(), "unexpected client output: {lines:?}");
}

#[tokio::test]
async fn kill_idle_closes_idle_sessions() {
    let mut script = user_pass_script("+OK Logged in.");
    script.push(Step::Hold);
    let backend = FakeBackend::start(vec![script]).await;

    let engine = Engine::new(None, None);
    let (client_side, mut client) = tokio::io::duplex(4096);
    let session = engine
        .proxy(
            client_info(),
            proxy_settings(backend.addr()),
            Pop3Proxy::new(pop3_settings(), client_info()),
        )
        .unwrap();
    let detached = session.run(client_side).await.unwrap_or_else(|failed| {
        panic!("pre-login failed: {}", failed.error);
    });
    let serving = detached.spawn();
    assert_eq!(read_line_timeout(&mut client).await, "+OK Logged in.");

    tokio::time::sleep(Duration::from_millis(2200)).await;
    engine.kill_idle();
    tokio::time::timeout(Duration::from_secs(2), serving)
        .await
        .expect("idle session did not close")
        .unwrap();
    assert_eq!(engine.detached_count(), 0);
}

#[tokio::test]
async fn kill_idle_grants_younger_sessions_a_grace_timer() {
    let mut script = user_pass_script("+OK Logged in.");
    script.push(expect("NOOP"));
    script.push(send("+OK"));
    script.push(Step::Hold);
    let backend = FakeBackend::start(vec![script]).await;

    let engine = Engine::new(None, None);
    let (client_side, mut client) = tokio::io::duplex(4096);
    let session = engine
        .proxy(
            client_info(),
            proxy_settings(backend.addr()),
            Pop3Proxy::new(pop3_settings(), client_info()),
        )
        .unwrap();
    let detached = session.run(client_side).await.unwrap_or_else(|failed| {
        panic!("pre-login failed: {}", failed.error);
    });
    let serving = detached.spawn();
    assert_eq!(read_line_timeout(&mut client).await, "+OK Logged in.");

    // fresh session: the kill arms a timer instead of closing now
    engine.kill_idle();
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.write_all(b"NOOP\r\n").await.unwrap();
    assert_eq!(read_line_timeout(&mut client).await, "+OK");

    // the armed timer still fires
    tokio::time::timeout(Duration::from_secs(3), serving)
        .await
        .expect("session survived the shutdown grace timer")
        .unwrap();
}

#[tokio::test]
async fn connection_refused_maps_to_a_tempfail_reply() {
    // grab a port with nothing listening on it
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let engine = Engine::new(None, None);
    let (client_side, mut client) = tokio::io::duplex(4096);
    let mut settings = proxy_settings(addr);
    settings.max_reconnects = 0;
    let session = engine
        .proxy(
            client_info(),
            settings,
            Pop3Proxy::new(pop3_settings(), client_info()),
        )
        .unwrap();

    let started = Instant::now();
    let failed = session.run(client_side).await.err().expect("must fail");
    assert_eq!(failed.error.kind, FailureKind::Connect);
    // no reconnect was attempted
    assert!(started.elapsed() < Duration::from_millis(900));
    assert_eq!(
        read_line_timeout(&mut client).await,
        format!("-ERR [SYS/TEMP] {LOGIN_PROXY_FAILURE_MSG}")
    );
}

#[tokio::test]
async fn no_retry_when_the_budget_is_nearly_spent() {
    // a retryable protocol failure, but the budget cannot fit the retry
    // interval plus slack
    let backend = FakeBackend::start(vec![vec![send("* OK wrong protocol")]]).await;

    let engine = Engine::new(None, None);
    let (client_side, _client) = tokio::io::duplex(4096);
    let mut settings = proxy_settings(backend.addr());
    settings.connect_timeout = Duration::from_millis(800);
    let session = engine
        .proxy(
            client_info(),
            settings,
            Pop3Proxy::new(pop3_settings(), client_info()),
        )
        .unwrap();

    let started = Instant::now();
    let failed = session.run(client_side).await.err().expect("must fail");
    assert_eq!(failed.error.kind, FailureKind::Protocol);
    assert!(started.elapsed() < Duration::from_millis(700));
}

#[tokio::test]
async fn notify_refresh_writes_to_the_pipe() {
    let notify_path = std::env::temp_dir().join(format!("notify-test-{}", std::process::id()));
    std::fs::write(&notify_path, b"").unwrap();

    let mut script = user_pass_script("+OK Logged in.");
    script.push(Step::Hold);
    let backend = FakeBackend::start(vec![script]).await;

    let engine = Engine::new(Some(notify_path.clone()), None);
    let (client_side, _client) = tokio::io::duplex(4096);
    let mut settings = proxy_settings(backend.addr());
    settings.notify_refresh = Duration::from_millis(50);
    let session = engine
        .proxy(
            client_info(),
            settings,
            Pop3Proxy::new(pop3_settings(), client_info()),
        )
        .unwrap();
    let detached = session.run(client_side).await.unwrap_or_else(|failed| {
        panic!("pre-login failed: {}", failed.error);
    });
    let serving = detached.spawn();

    tokio::time::sleep(Duration::from_millis(250)).await;
    let contents = std::fs::read_to_string(&notify_path).unwrap();
    let expected = format!("alice\t{}\t{}", backend.ip(), backend.port());
    assert!(contents.contains(&expected), "notify pipe: {contents:?}");

    engine.kick_user("alice", None);
    serving.await.unwrap();
    std::fs::remove_file(&notify_path).ok();
}

struct CountingAnvil {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl Anvil for CountingAnvil {
    fn connect(&self, _conn_id: u64, session: &AnvilSession<'_>) -> bool {
        assert_eq!(session.username, "alice");
        assert_eq!(session.service, "pop3");
        self.connects.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn disconnect(&self, _conn_id: u64, _session: &AnvilSession<'_>) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }
}

#[tokio::test]
async fn anvil_accounting_follows_the_session() {
    let anvil = Arc::new(CountingAnvil {
        connects: AtomicUsize::new(0),
        disconnects: AtomicUsize::new(0),
    });

    let mut script = user_pass_script("+OK Logged in.");
    script.push(Step::Hold);
    let backend = FakeBackend::start(vec![script]).await;

    let engine = Engine::new(None, Some(anvil.clone()));
    let (client_side, _client) = tokio::io::duplex(4096);
    let session = engine
        .proxy(
            client_info(),
            proxy_settings(backend.addr()),
            Pop3Proxy::new(pop3_settings(), client_info()),
        )
        .unwrap();
    let detached = session.run(client_side).await.unwrap_or_else(|failed| {
        panic!("pre-login failed: {}", failed.error);
    });
    assert_eq!(anvil.connects.load(Ordering::Relaxed), 1);
    assert_eq!(anvil.disconnects.load(Ordering::Relaxed), 0);

    let serving = detached.spawn();
    engine.kick_user("alice", None);
    serving.await.unwrap();
    assert_eq!(anvil.disconnects.load(Ordering::Relaxed), 1);
}
