/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Scripted in-process POP3 backend. Each accepted connection plays one
//! script: lines to send, lines to expect from the proxy, an optional STLS
//! upgrade with a self-signed certificate, or holding the connection open.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use rcgen::generate_simple_self_signed;
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;

#[derive(Debug, Clone)]
pub enum Step {
    /// Send a line (CRLF appended).
    Send(String),
    /// Send raw bytes as-is (multiplex frames, partial lines).
    SendRaw(Vec<u8>),
    /// Read a line and assert it matches exactly.
    Expect(String),
    /// Read a line and assert its prefix.
    ExpectPrefix(String),
    /// Accept a TLS handshake; the rest of the script runs over TLS.
    StartTls,
    /// Keep the connection open without answering until the peer leaves.
    Hold,
}

pub fn send(line: impl Into<String>) -> Step {
    Step::Send(line.into())
}

pub fn expect(line: impl Into<String>) -> Step {
    Step::Expect(line.into())
}

pub fn expect_prefix(prefix: impl Into<String>) -> Step {
    Step::ExpectPrefix(prefix.into())
}

pub struct FakeBackend {
    addr: SocketAddr,
    _handle: JoinHandle<()>,
}

impl FakeBackend {
    /// Bind to an OS-assigned localhost port and serve one script per
    /// accepted connection, in order.
    pub async fn start(scripts: Vec<Vec<Step>>) -> Self {
        Self::start_with(
            TcpListener::bind("127.0.0.1:0").await.unwrap(),
            scripts,
        )
    }

    /// Bind to a specific localhost port (reserved by the caller).
    pub async fn start_on(port: u16, scripts: Vec<Vec<Step>>) -> Self {
        Self::start_with(
            TcpListener::bind(("127.0.0.1", port)).await.unwrap(),
            scripts,
        )
    }

    fn start_with(listener: TcpListener, scripts: Vec<Vec<Step>>) -> Self {
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let acceptor = tls_acceptor();
            for script in scripts {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                run_plain(stream, script, &acceptor).await;
            }
        });
        FakeBackend {
            addr,
            _handle: handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

async fn run_plain(mut stream: TcpStream, script: Vec<Step>, acceptor: &TlsAcceptor) {
    let mut steps = script.into_iter();
    while let Some(step) = steps.next() {
        match step {
            Step::StartTls => {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                run_secured(tls, steps.collect()).await;
                return;
            }
            step => {
                if !apply_step(&mut stream, step).await {
                    return;
                }
            }
        }
    }
}

async fn run_secured<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S, steps: Vec<Step>) {
    for step in steps {
        match step {
            Step::StartTls => panic!("script upgraded to TLS twice"),
            step => {
                if !apply_step(&mut stream, step).await {
                    return;
                }
            }
        }
    }
}

async fn apply_step<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, step: Step) -> bool {
    match step {
        Step::Send(line) => stream
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .is_ok(),
        Step::SendRaw(bytes) => stream.write_all(&bytes).await.is_ok(),
        Step::Expect(expected) => {
            let Some(line) = read_line(stream).await else {
                panic!("backend expected {expected:?}, got EOF");
            };
            assert_eq!(line, expected, "backend expectation mismatch");
            true
        }
        Step::ExpectPrefix(prefix) => {
            let Some(line) = read_line(stream).await else {
                panic!("backend expected prefix {prefix:?}, got EOF");
            };
            assert!(
                line.starts_with(&prefix),
                "backend expected prefix {prefix:?}, got {line:?}"
            );
            true
        }
        Step::Hold => {
            let mut buf = [0u8; 256];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return false,
                    Ok(_) => {}
                }
            }
        }
        Step::StartTls => unreachable!("handled by the caller"),
    }
}

/// Read one CRLF-terminated line, or `None` on EOF.
pub async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => {
                return if line.is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(&line).into_owned())
                };
            }
            Ok(_) => {
                if byte[0] == b'\n' {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Some(String::from_utf8_lossy(&line).into_owned());
                }
                line.push(byte[0]);
            }
        }
    }
}

/// Read lines until EOF.
pub async fn read_to_eof<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(line) = read_line(stream).await {
        lines.push(line);
    }
    lines
}

/// Read one line within a bound, panicking on silence.
pub async fn read_line_timeout<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    tokio::time::timeout(Duration::from_secs(5), read_line(stream))
        .await
        .expect("timed out waiting for a line")
        .expect("unexpected EOF")
}

fn tls_acceptor() -> TlsAcceptor {
    let certified = generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}
