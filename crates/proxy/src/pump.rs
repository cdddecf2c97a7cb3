/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    io,
    pin::Pin,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    task::{Context, Poll},
    time::{Duration, Instant},
};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::PROXY_MAX_OUTBUF_SIZE;

const CLIENT_TO_SERVER_BUF_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Server => "server",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum Cause {
    Eof,
    ReadError(io::Error),
    /// The opposite direction's output failed; `Finished::side` names the
    /// side whose output it was, not the side that was read.
    WriteError(io::Error),
}

/// The pump's single completion notification.
#[derive(Debug)]
pub struct Finished {
    pub side: Side,
    pub cause: Cause,
}

impl Finished {
    pub fn error_str(&self) -> String {
        match &self.cause {
            Cause::Eof => String::new(),
            Cause::ReadError(err) | Cause::WriteError(err) => err.to_string(),
        }
    }
}

/// Last-I/O stamps for the four stream directions, in milliseconds from the
/// pump's epoch.
pub struct Activity {
    epoch: Instant,
    client_read: AtomicU64,
    client_write: AtomicU64,
    server_read: AtomicU64,
    server_write: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Activity {
            epoch: Instant::now(),
            client_read: AtomicU64::new(0),
            client_write: AtomicU64::new(0),
            server_read: AtomicU64::new(0),
            server_write: AtomicU64::new(0),
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn touch_read(&self, side: Side) {
        let stamp = self.now_millis();
        match side {
            Side::Client => self.client_read.store(stamp, Ordering::Relaxed),
            Side::Server => self.server_read.store(stamp, Ordering::Relaxed),
        }
    }

    fn touch_write(&self, side: Side) {
        let stamp = self.now_millis();
        match side {
            Side::Client => self.client_write.store(stamp, Ordering::Relaxed),
            Side::Server => self.server_write.store(stamp, Ordering::Relaxed),
        }
    }

    /// Time since the most recent I/O in any direction.
    pub fn last_io_elapsed(&self) -> Duration {
        let last = self
            .client_read
            .load(Ordering::Relaxed)
            .max(self.client_write.load(Ordering::Relaxed))
            .max(self.server_read.load(Ordering::Relaxed))
            .max(self.server_write.load(Ordering::Relaxed));
        Duration::from_millis(self.now_millis().saturating_sub(last))
    }
}

/// Byte counters and blocked-output flags, observable while the pump runs
/// and after it was torn down.
pub struct PumpState {
    /// Bytes written toward the server (includes pre-login commands).
    pub bytes_in: AtomicU64,
    /// Bytes written toward the client (includes pre-login replies).
    pub bytes_out: AtomicU64,
    /// Data destined to the client is stuck in a pending write.
    pub client_output_blocked: AtomicBool,
    /// Data destined to the server is stuck in a pending write.
    pub server_output_blocked: AtomicBool,
    pub activity: Activity,
}

impl PumpState {
    pub fn new(initial_in: u64, initial_out: u64) -> Self {
        PumpState {
            bytes_in: AtomicU64::new(initial_in),
            bytes_out: AtomicU64::new(initial_out),
            client_output_blocked: AtomicBool::new(false),
            server_output_blocked: AtomicBool::new(false),
            activity: Activity::new(),
        }
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

enum DirEnd {
    Eof,
    Read(io::Error),
    Write(io::Error),
}

/// One copy direction with its bounded transfer buffer. The buffer size is
/// the direction's backpressure cap: no more than this many bytes are ever
/// in flight between a read and the completed write.
struct Direction {
    buf: Box<[u8]>,
    pos: usize,
    cap: usize,
    eof: bool,
}

impl Direction {
    fn new(size: usize) -> Self {
        Direction {
            buf: vec![0u8; size].into_boxed_slice(),
            pos: 0,
            cap: 0,
            eof: false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        reader: &mut R,
        writer: &mut W,
        read_side: Side,
        write_side: Side,
        counter: &AtomicU64,
        blocked: &AtomicBool,
        activity: &Activity,
    ) -> Poll<DirEnd>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            if self.pos == self.cap && !self.eof {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match Pin::new(&mut *reader).poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.eof = true;
                        } else {
                            self.pos = 0;
                            self.cap = n;
                            activity.touch_read(read_side);
                        }
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(DirEnd::Read(err)),
                    Poll::Pending => return Poll::Pending,
                }
            }

            while self.pos < self.cap {
                match Pin::new(&mut *writer).poll_write(cx, &self.buf[self.pos..self.cap]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(DirEnd::Write(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write returned zero bytes",
                        )));
                    }
                    Poll::Ready(Ok(n)) => {
                        self.pos += n;
                        counter.fetch_add(n as u64, Ordering::Relaxed);
                        activity.touch_write(write_side);
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(DirEnd::Write(err)),
                    Poll::Pending => {
                        blocked.store(true, Ordering::Relaxed);
                        return Poll::Pending;
                    }
                }
            }
            blocked.store(false, Ordering::Relaxed);

            if self.eof {
                return match Pin::new(&mut *writer).poll_flush(cx) {
                    Poll::Ready(Ok(())) => Poll::Ready(DirEnd::Eof),
                    Poll::Ready(Err(err)) => Poll::Ready(DirEnd::Write(err)),
                    Poll::Pending => Poll::Pending,
                };
            }
        }
    }
}

/// Copy bytes in both directions until either side sees EOF or an I/O
/// error. Bytes already read from the server during pre-login are delivered
/// to the client first. The streams are borrowed, not consumed, so the
/// caller can keep the client side open for a delayed disconnect.
pub async fn run<C, S>(
    client: &mut C,
    server: &mut S,
    server_leftover: &[u8],
    state: &PumpState,
) -> Finished
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !server_leftover.is_empty() {
        if let Err(err) = client.write_all(server_leftover).await {
            return Finished {
                side: Side::Client,
                cause: Cause::WriteError(err),
            };
        }
        state
            .bytes_out
            .fetch_add(server_leftover.len() as u64, Ordering::Relaxed);
        state.activity.touch_write(Side::Client);
    }

    let mut client_to_server = Direction::new(CLIENT_TO_SERVER_BUF_SIZE);
    let mut server_to_client = Direction::new(PROXY_MAX_OUTBUF_SIZE);

    std::future::poll_fn(move |cx| {
        if let Poll::Ready(end) = client_to_server.poll_copy(
            cx,
            client,
            server,
            Side::Client,
            Side::Server,
            &state.bytes_in,
            &state.server_output_blocked,
            &state.activity,
        ) {
            return Poll::Ready(match end {
                DirEnd::Eof => Finished {
                    side: Side::Client,
                    cause: Cause::Eof,
                },
                DirEnd::Read(err) => Finished {
                    side: Side::Client,
                    cause: Cause::ReadError(err),
                },
                DirEnd::Write(err) => Finished {
                    side: Side::Server,
                    cause: Cause::WriteError(err),
                },
            });
        }
        if let Poll::Ready(end) = server_to_client.poll_copy(
            cx,
            server,
            client,
            Side::Server,
            Side::Client,
            &state.bytes_out,
            &state.client_output_blocked,
            &state.activity,
        ) {
            return Poll::Ready(match end {
                DirEnd::Eof => Finished {
                    side: Side::Server,
                    cause: Cause::Eof,
                },
                DirEnd::Read(err) => Finished {
                    side: Side::Server,
                    cause: Cause::ReadError(err),
                },
                DirEnd::Write(err) => Finished {
                    side: Side::Client,
                    cause: Cause::WriteError(err),
                },
            });
        }
        Poll::Pending
    })
    .await
}
