/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Demultiplexer for backends that interleave a side channel with normal
//! traffic. Frames are `channel (1 byte) | length (u32 BE) | payload`:
//! channel 0 is passed through to the reader, channel 1 carries line-based
//! side-channel commands, anything else is logged and discarded.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
};

const HEADER_SIZE: usize = 5;
const SIDE_CHANNEL: u8 = 1;
/// Side-channel lines longer than this indicate a broken peer.
const MAX_SIDE_LINE_SIZE: usize = 8192;

/// Wraps a stream whose read side is multiplex-framed. Channel-0 payload is
/// exposed through `AsyncRead`; channel-1 lines are pushed to the given
/// sender as they complete. Writes pass through unframed.
pub struct MultiplexStream<S> {
    inner: S,
    header: [u8; HEADER_SIZE],
    header_len: usize,
    channel: u8,
    remaining: usize,
    side_buf: Vec<u8>,
    side_tx: mpsc::UnboundedSender<String>,
}

impl<S> MultiplexStream<S> {
    pub fn new(inner: S, side_tx: mpsc::UnboundedSender<String>) -> Self {
        MultiplexStream {
            inner,
            header: [0u8; HEADER_SIZE],
            header_len: 0,
            channel: 0,
            remaining: 0,
            side_buf: Vec::new(),
            side_tx,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn push_side_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        for &byte in data {
            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.side_buf);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let line = String::from_utf8_lossy(&line).into_owned();
                let _ = self.side_tx.send(line);
            } else {
                self.side_buf.push(byte);
                if self.side_buf.len() > MAX_SIDE_LINE_SIZE {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "side channel line too long",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MultiplexStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.remaining == 0 {
                while this.header_len < HEADER_SIZE {
                    let mut header_buf = ReadBuf::new(&mut this.header[this.header_len..]);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut header_buf) {
                        Poll::Ready(Ok(())) => {
                            let n = header_buf.filled().len();
                            if n == 0 {
                                return if this.header_len == 0 {
                                    // clean EOF between frames
                                    Poll::Ready(Ok(()))
                                } else {
                                    Poll::Ready(Err(io::Error::new(
                                        io::ErrorKind::UnexpectedEof,
                                        "truncated multiplex frame header",
                                    )))
                                };
                            }
                            this.header_len += n;
                        }
                        Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                this.channel = this.header[0];
                this.remaining = u32::from_be_bytes([
                    this.header[1],
                    this.header[2],
                    this.header[3],
                    this.header[4],
                ]) as usize;
                this.header_len = 0;
                if this.remaining == 0 {
                    continue;
                }
            }

            if this.channel == 0 {
                let take = this.remaining.min(buf.remaining());
                let mut payload_buf = buf.take(take);
                match Pin::new(&mut this.inner).poll_read(cx, &mut payload_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = payload_buf.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "truncated multiplex frame payload",
                            )));
                        }
                        this.remaining -= n;
                        // the sub-buffer wrote into buf's unfilled region
                        unsafe { buf.assume_init(n) };
                        buf.advance(n);
                        return Poll::Ready(Ok(()));
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    Poll::Pending => return Poll::Pending,
                }
            } else {
                let mut chunk = [0u8; 256];
                let take = this.remaining.min(chunk.len());
                let mut chunk_buf = ReadBuf::new(&mut chunk[..take]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = chunk_buf.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "truncated multiplex frame payload",
                            )));
                        }
                        this.remaining -= n;
                        if this.channel == SIDE_CHANNEL {
                            let filled = chunk_buf.filled().to_vec();
                            this.push_side_bytes(&filled)?;
                        } else {
                            tracing::warn!(
                                context = "proxy",
                                event = "unknown-multiplex-channel",
                                channel = this.channel,
                                bytes = n,
                            );
                        }
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MultiplexStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
