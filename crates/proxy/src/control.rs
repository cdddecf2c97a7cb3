/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    io,
    net::IpAddr,
    pin::Pin,
    sync::{atomic::Ordering, Arc},
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
    sync::mpsc,
};
use tracing::Instrument;

use crate::{
    multiplex::MultiplexStream,
    pump::{self, PumpState, Side},
    state::Destination,
    stream::ServerStream,
    AnvilSession, ClientInfo, Engine, SessionHooks, KILLED_BY_ADMIN_REASON,
    KILLED_BY_SHUTDOWN_REASON, LOGIN_PROXY_DIE_IDLE_SECS, LOGIN_PROXY_KILL_PREFIX,
    LOGIN_PROXY_SIDE_SELF,
};

/// Command sent to a detached session's serving task.
#[derive(Debug, Clone)]
pub struct KillCommand {
    pub reason: String,
    /// Use the delayed-close pacing path.
    pub delayed: bool,
    /// Grace period before the close fires; the pump keeps running and a
    /// natural end wins the race.
    pub after: Duration,
}

impl KillCommand {
    fn immediate(reason: impl Into<String>) -> Self {
        KillCommand {
            reason: reason.into(),
            delayed: false,
            after: Duration::ZERO,
        }
    }
}

pub(crate) struct PendingHandle {
    pub user: String,
    pub conn_id: u64,
    pub kill: mpsc::UnboundedSender<String>,
}

pub(crate) struct DetachedHandle {
    pub conn_id: u64,
    pub kill: mpsc::UnboundedSender<KillCommand>,
    pub state: Arc<PumpState>,
}

/// A proxy whose pre-login completed: both stream ends plus everything
/// finalization needs. Run it with `serve()` (or `spawn()`).
pub struct Detached<C> {
    pub(crate) engine: Arc<Engine>,
    pub(crate) client: ClientInfo,
    pub(crate) conn_id: u64,
    pub(crate) dest: Arc<Destination>,
    pub(crate) dest_ip: IpAddr,
    pub(crate) dest_port: u16,
    pub(crate) notify_refresh: Duration,
    pub(crate) max_disconnect_delay_secs: u32,
    pub(crate) hooks: Box<dyn SessionHooks>,
    pub(crate) span: tracing::Span,
    pub(crate) multiplex: bool,
    pub(crate) anvil_registered: bool,
    pub(crate) pump_state: Arc<PumpState>,
    pub(crate) client_stream: C,
    pub(crate) server_stream: ServerStream,
    pub(crate) leftover: Vec<u8>,
    pub(crate) kill_rx: mpsc::UnboundedReceiver<KillCommand>,
}

enum End {
    Pump(pump::Finished),
    Kill(KillCommand),
}

impl<C> Detached<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn username(&self) -> &str {
        &self.client.username
    }

    pub fn pump_state(&self) -> Arc<PumpState> {
        self.pump_state.clone()
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()>
    where
        C: 'static,
    {
        tokio::spawn(self.serve())
    }

    /// Pump bytes between the two sides until either closes, a kill
    /// command arrives, or the engine shuts down; then finalize.
    pub async fn serve(self) {
        let span = self.span.clone();
        self.serve_inner().instrument(span).await
    }

    async fn serve_inner(self) {
        let Detached {
            engine,
            client,
            conn_id,
            dest,
            dest_ip,
            dest_port,
            notify_refresh,
            max_disconnect_delay_secs,
            mut hooks,
            span: _,
            multiplex,
            anvil_registered,
            pump_state,
            mut client_stream,
            server_stream,
            leftover,
            mut kill_rx,
        } = self;

        // When both sides multiplex, step out of the way and let them talk
        // raw; otherwise demultiplex the server input here.
        let (mut side_rx, mut server) = if multiplex && !client.multiplex_capable {
            let (side_tx, side_rx) = mpsc::unbounded_channel();
            (
                Some(side_rx),
                ServerEnd::Multiplex(MultiplexStream::new(server_stream, side_tx)),
            )
        } else {
            (None, ServerEnd::Plain(server_stream))
        };

        let mut shutdown_rx = engine.shutdown_tx.subscribe();
        let mut notify_timer = if !notify_refresh.is_zero() {
            Some(tokio::time::interval_at(
                tokio::time::Instant::now() + notify_refresh,
                notify_refresh,
            ))
        } else {
            None
        };

        let end = {
            let mut pump_fut = std::pin::pin!(pump::run(
                &mut client_stream,
                &mut server,
                &leftover,
                &pump_state,
            ));
            loop {
                tokio::select! {
                    finished = &mut pump_fut => break End::Pump(finished),
                    cmd = kill_rx.recv() => {
                        let cmd = cmd.unwrap_or_else(|| KillCommand::immediate(KILLED_BY_SHUTDOWN_REASON));
                        if cmd.after.is_zero() {
                            break End::Kill(cmd);
                        }
                        // grace timer armed; a natural end still wins
                        tokio::select! {
                            finished = &mut pump_fut => break End::Pump(finished),
                            _ = tokio::time::sleep(cmd.after) => break End::Kill(cmd),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        break End::Kill(KillCommand::immediate(KILLED_BY_SHUTDOWN_REASON));
                    }
                    line = side_channel_line(&mut side_rx) => {
                        if let Err(reason) = dispatch_side_line(hooks.as_mut(), &line) {
                            break End::Kill(KillCommand::immediate(reason));
                        }
                    }
                    _ = notify_tick(&mut notify_timer) => {
                        engine.registry.notify(&client.username, dest_ip, dest_port);
                    }
                }
            }
        };

        // side-channel lines decoded before the pump stopped still get
        // dispatched; the session is past saving either way
        if let Some(rx) = side_rx.as_mut() {
            while let Ok(line) = rx.try_recv() {
                let _ = dispatch_side_line(hooks.as_mut(), &line);
            }
        }

        // the backend side closes right away in every case; only the
        // client-side close may be delayed
        drop(server);

        let idle = pump_state.activity.last_io_elapsed();
        let (log_msg, disconnect_reason, disconnect_side, delayed) = match &end {
            End::Pump(finished) => {
                let errstr = finished.error_str();
                let mut msg = format!("Disconnected by {}", finished.side);
                if !errstr.is_empty() {
                    msg.push_str(&format!(": {errstr}"));
                }
                msg.push_str(&format!(
                    " ({}s idle, in={}, out={}",
                    idle.as_secs(),
                    pump_state.bytes_in(),
                    pump_state.bytes_out(),
                ));
                if pump_state.client_output_blocked.load(Ordering::Relaxed) {
                    msg.push_str(", client output blocked");
                }
                if pump_state.server_output_blocked.load(Ordering::Relaxed) {
                    msg.push_str(", server output blocked");
                }
                msg.push(')');
                (
                    msg,
                    errstr,
                    finished.side.as_str(),
                    finished.side == Side::Server,
                )
            }
            End::Kill(cmd) => (
                format!("{LOGIN_PROXY_KILL_PREFIX}{}", cmd.reason),
                cmd.reason.clone(),
                LOGIN_PROXY_SIDE_SELF,
                cmd.delayed,
            ),
        };

        engine.unlink_detached(&client.username, conn_id);
        dest.active_end();
        if anvil_registered {
            if let Some(anvil) = engine.anvil.as_deref() {
                anvil.disconnect(
                    conn_id,
                    &AnvilSession {
                        username: &client.username,
                        service: &client.service,
                        ip: client.ip,
                        dest_ip,
                        alt_usernames: &client.alt_usernames,
                    },
                );
            }
        }

        let delay = if delayed {
            dest.delay_disconnect(max_disconnect_delay_secs)
        } else {
            Duration::ZERO
        };

        if delay.is_zero() {
            tracing::info!(
                context = "proxy",
                event = "session-finished",
                dest = %format!("{dest_ip}:{dest_port}"),
                disconnect_reason = %disconnect_reason,
                disconnect_side = disconnect_side,
                idle_secs = idle.as_secs(),
                net_in_bytes = pump_state.bytes_in(),
                net_out_bytes = pump_state.bytes_out(),
                "{log_msg}",
            );
        } else {
            tracing::info!(
                context = "proxy",
                event = "session-finished",
                dest = %format!("{dest_ip}:{dest_port}"),
                disconnect_reason = %disconnect_reason,
                disconnect_side = disconnect_side,
                idle_secs = idle.as_secs(),
                net_in_bytes = pump_state.bytes_in(),
                net_out_bytes = pump_state.bytes_out(),
                delay_msecs = delay.as_millis() as u64,
                "{log_msg} - disconnecting client in {}ms",
                delay.as_millis(),
            );
            // server side is gone; keep the client open until the timer
            // fires or it hangs up, discarding whatever it sends
            let drain_deadline = tokio::time::sleep(delay);
            tokio::pin!(drain_deadline);
            let mut buf = [0u8; 1024];
            loop {
                tokio::select! {
                    _ = &mut drain_deadline => break,
                    _ = shutdown_rx.changed() => break,
                    read = client_stream.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            }
            dest.delayed_disconnect_end();
        }
    }
}

async fn side_channel_line(rx: &mut Option<mpsc::UnboundedReceiver<String>>) -> String {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(line) => line,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn notify_tick(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn dispatch_side_line(hooks: &mut dyn SessionHooks, line: &str) -> Result<(), String> {
    let args: Vec<&str> = line.split('\t').collect();
    if args.first().map_or(true, |first| first.is_empty()) {
        tracing::error!(
            context = "proxy",
            event = "side-channel-invalid",
            "Side channel input is invalid: Empty line",
        );
        return Ok(());
    }
    hooks.side_channel(&args).map_err(|err| {
        tracing::error!(
            context = "proxy",
            event = "side-channel-failed",
            command = args[0],
            reason = %err,
        );
        format!("Side channel input: {}: {}", args[0], err)
    })
}

/// Server end of a detached session: raw, or demultiplexed when only our
/// side speaks multiplex.
enum ServerEnd {
    Plain(ServerStream),
    Multiplex(MultiplexStream<ServerStream>),
}

impl AsyncRead for ServerEnd {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerEnd::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ServerEnd::Multiplex(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerEnd {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ServerEnd::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ServerEnd::Multiplex(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerEnd::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ServerEnd::Multiplex(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerEnd::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ServerEnd::Multiplex(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl Engine {
    pub(crate) fn unregister_pending(&self, conn_id: u64) {
        self.pending.lock().retain(|handle| handle.conn_id != conn_id);
    }

    pub(crate) fn link_detached(&self, user: &str, handle: DetachedHandle) {
        self.detached
            .lock()
            .entry(user.to_string())
            .or_default()
            .push(handle);
        self.detached_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unlink_detached(&self, user: &str, conn_id: u64) {
        let mut detached = self.detached.lock();
        if let Some(handles) = detached.get_mut(user) {
            let before = handles.len();
            handles.retain(|handle| handle.conn_id != conn_id);
            if handles.len() < before {
                self.detached_count.fetch_sub(1, Ordering::Relaxed);
            }
            if handles.is_empty() {
                detached.remove(user);
            }
        }
    }

    /// Number of detached proxies currently served.
    pub fn detached_count(&self) -> usize {
        self.detached_count.load(Ordering::Relaxed)
    }

    /// Close a user's proxied connections, optionally restricted to one
    /// connection id. Detached sessions close through the delayed-close
    /// path; pending ones are dropped without a reply. Returns the number
    /// of sessions hit.
    pub fn kick_user(&self, user: &str, conn_id: Option<u64>) -> usize {
        let mut count = 0;
        {
            let detached = self.detached.lock();
            if let Some(handles) = detached.get(user) {
                for handle in handles {
                    if conn_id.is_none_or(|id| id == handle.conn_id) {
                        let _ = handle.kill.send(KillCommand {
                            reason: KILLED_BY_ADMIN_REASON.to_string(),
                            delayed: true,
                            after: Duration::ZERO,
                        });
                        count += 1;
                    }
                }
            }
        }
        {
            let pending = self.pending.lock();
            for handle in pending.iter() {
                if handle.user == user && conn_id.is_none_or(|id| id == handle.conn_id) {
                    let _ = handle
                        .kill
                        .send(format!("{LOGIN_PROXY_KILL_PREFIX}{KILLED_BY_ADMIN_REASON}"));
                    count += 1;
                }
            }
        }
        count
    }

    /// Close detached sessions that have been idle for the shutdown grace
    /// window; younger ones get the remainder as a timer, with a natural
    /// end winning the race.
    pub fn kill_idle(&self) {
        let max_idle = Duration::from_secs(LOGIN_PROXY_DIE_IDLE_SECS);
        let detached = self.detached.lock();
        for handles in detached.values() {
            for handle in handles {
                let idle = handle.state.activity.last_io_elapsed();
                let cmd = KillCommand {
                    reason: KILLED_BY_SHUTDOWN_REASON.to_string(),
                    delayed: false,
                    after: max_idle.saturating_sub(idle),
                };
                let _ = handle.kill.send(cmd);
            }
        }
    }

    /// Tear everything down now: pending logins, detached sessions, and
    /// sessions draining toward a delayed close.
    pub fn shutdown(&self) -> usize {
        self.shutdown_tx.send_replace(true);
        let mut count = 0;
        {
            let detached = self.detached.lock();
            for handles in detached.values() {
                for handle in handles {
                    let _ = handle
                        .kill
                        .send(KillCommand::immediate(KILLED_BY_SHUTDOWN_REASON));
                    count += 1;
                }
            }
        }
        {
            let pending = self.pending.lock();
            for handle in pending.iter() {
                let _ = handle
                    .kill
                    .send(format!("{LOGIN_PROXY_KILL_PREFIX}{KILLED_BY_SHUTDOWN_REASON}"));
                count += 1;
            }
        }
        count
    }
}
