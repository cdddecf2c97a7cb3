/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    io::Write,
    net::IpAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;

use crate::PROXY_DISCONNECT_INTERVAL_MSECS;

/// Process-wide destination table plus the notify pipe. Records are created
/// on demand and live for the life of the process; sessions hold `Arc`s.
pub struct Registry {
    destinations: DashMap<(IpAddr, u16), Arc<Destination>, ahash::RandomState>,
    notify_path: Option<PathBuf>,
    notify_pipe: Mutex<Option<std::fs::File>>,
}

impl Registry {
    pub fn new(notify_path: Option<PathBuf>) -> Self {
        Registry {
            destinations: DashMap::with_hasher(ahash::RandomState::new()),
            notify_path,
            notify_pipe: Mutex::new(None),
        }
    }

    /// Look up (creating if needed) the record for a destination.
    pub fn get(&self, ip: IpAddr, port: u16) -> Arc<Destination> {
        self.destinations
            .entry((ip, port))
            .or_insert_with(|| Arc::new(Destination::default()))
            .clone()
    }

    /// Write one notification line to the notify pipe: the username
    /// followed by the destination ip and port, tab-separated. Failures
    /// disable the pipe until the next notification reopens it.
    pub fn notify(&self, user: &str, ip: IpAddr, port: u16) {
        let Some(path) = &self.notify_path else {
            return;
        };
        let mut pipe = self.notify_pipe.lock();
        if pipe.is_none() {
            match std::fs::OpenOptions::new().write(true).open(path) {
                Ok(file) => *pipe = Some(file),
                Err(err) => {
                    tracing::warn!(
                        context = "proxy",
                        event = "notify-open-failed",
                        path = %path.display(),
                        reason = %err,
                    );
                    return;
                }
            }
        }
        if let Some(file) = pipe.as_mut() {
            let line = format!("{user}\t{ip}\t{port}\n");
            if let Err(err) = file.write_all(line.as_bytes()) {
                tracing::warn!(
                    context = "proxy",
                    event = "notify-write-failed",
                    path = %path.display(),
                    reason = %err,
                );
                *pipe = None;
            }
        }
    }
}

#[derive(Default)]
struct Times {
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    /// Base timestamp for disconnect pacing; jittered so that parallel
    /// processes don't close their batches in the same instant.
    batch_start: Option<Instant>,
    disconnects_in_batch: u32,
}

/// Health record for one backend destination.
#[derive(Default)]
pub struct Destination {
    waiting: AtomicU32,
    active: AtomicU32,
    delayed_disconnects: AtomicU32,
    times: Mutex<Times>,
}

impl Destination {
    /// In-flight connect attempts.
    pub fn waiting(&self) -> u32 {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Established backend connections.
    pub fn active(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn delayed_disconnects(&self) -> u32 {
        self.delayed_disconnects.load(Ordering::Relaxed)
    }

    /// Begin a connect attempt. The returned guard settles the `waiting`
    /// counter exactly once: `success`, `failure`, or abandonment on drop.
    pub fn begin_attempt(self: &Arc<Self>) -> Attempt {
        self.waiting.fetch_add(1, Ordering::Relaxed);
        Attempt {
            dest: self.clone(),
            settled: false,
        }
    }

    pub(crate) fn active_end(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                n.checked_sub(1)
            });
    }

    /// Whether a new attempt should fail immediately because the host has
    /// been down longer than `window`. Never fires for the sole in-flight
    /// probe, so a recovered host can be noticed. Returns the down time in
    /// seconds when it fires. A window of zero disables the check.
    ///
    /// Seeds `last_success` on a brand-new record so the very first attempt
    /// is never judged against an empty history.
    pub fn should_fail_fast(&self, window: Duration) -> Option<u64> {
        let mut times = self.times.lock();
        if times.last_success.is_none() {
            times.last_success = Instant::now()
                .checked_sub(Duration::from_secs(1))
                .or_else(|| Some(Instant::now()));
        }
        if window.is_zero() {
            return None;
        }
        let last_success = times.last_success?;
        let last_failure = times.last_failure?;
        if last_failure <= last_success {
            return None;
        }
        let down = last_failure - last_success;
        if down > window && self.waiting.load(Ordering::Relaxed) > 1 {
            Some(down.as_secs())
        } else {
            None
        }
    }

    /// Compute how long to postpone closing the client side of one more
    /// disconnect, spreading a mass-close over `max_delay_secs` in 100 ms
    /// steps. Zero means close now.
    pub(crate) fn delay_disconnect(&self, max_delay_secs: u32) -> Duration {
        let now = Instant::now();
        let mut times = self.times.lock();
        if times.disconnects_in_batch == 0 {
            let jitter = rand::thread_rng().gen_range(0..PROXY_DISCONNECT_INTERVAL_MSECS);
            times.batch_start = Some(now + Duration::from_millis(jitter));
        }
        times.disconnects_in_batch += 1;
        if max_delay_secs == 0 {
            return Duration::ZERO;
        }
        let max_conns = self.active.load(Ordering::Relaxed) + times.disconnects_in_batch;
        let max_disconnects_per_sec = max_conns.div_ceil(max_delay_secs);
        if times.disconnects_in_batch <= max_disconnects_per_sec
            && self.delayed_disconnects.load(Ordering::Relaxed) == 0
        {
            // wait with delaying until a second's worth of clients is queued
            return Duration::ZERO;
        }
        let offset_msecs = PROXY_DISCONNECT_INTERVAL_MSECS
            * (u64::from(max_delay_secs) * u64::from(times.disconnects_in_batch)
                * (1000 / PROXY_DISCONNECT_INTERVAL_MSECS)
                / u64::from(max_conns));
        let target = times.batch_start.unwrap_or(now) + Duration::from_millis(offset_msecs);
        match target.checked_duration_since(now) {
            Some(delay) if !delay.is_zero() => {
                self.delayed_disconnects.fetch_add(1, Ordering::Relaxed);
                delay
            }
            _ => Duration::ZERO,
        }
    }

    /// A delayed disconnect completed; the batch counter restarts once the
    /// last delayed client is gone.
    pub(crate) fn delayed_disconnect_end(&self) {
        if self.delayed_disconnects.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.times.lock().disconnects_in_batch = 0;
        }
    }

    fn attempt_success(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        let mut times = self.times.lock();
        times.last_success = Some(Instant::now());
        times.disconnects_in_batch = 0;
    }

    fn attempt_failure(&self, started: Instant) {
        let mut times = self.times.lock();
        match times.last_success {
            // a successful connection was made since this attempt started;
            // treat the failure as an incidental one-off
            Some(last_success) if last_success > started => {}
            _ => times.last_failure = Some(Instant::now()),
        }
    }
}

/// RAII accounting for one begun connect attempt.
pub struct Attempt {
    dest: Arc<Destination>,
    settled: bool,
}

impl Attempt {
    pub fn success(mut self) {
        self.settled = true;
        self.dest.waiting.fetch_sub(1, Ordering::Relaxed);
        self.dest.attempt_success();
    }

    pub fn failure(mut self, started: Instant) {
        self.settled = true;
        self.dest.waiting.fetch_sub(1, Ordering::Relaxed);
        self.dest.attempt_failure(started);
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if !self.settled {
            self.dest.waiting.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
