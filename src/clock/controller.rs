use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{bail, Result};
use chrono::Utc;
use log::{debug, info};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Instant},
};

use super::{ClockState, ClockStatus};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Elapsed-seconds counter with two projections.
///
/// `elapsed()` reads the authoritative value, which the ticker updates under
/// the state lock before anything else observes the tick. `subscribe()` hands
/// out the display projection, which is published afterwards and may lag; it
/// is never written back into the authoritative state.
#[derive(Clone)]
pub struct SessionClock {
    state: Arc<Mutex<ClockState>>,
    display_tx: Arc<watch::Sender<u64>>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    tick_interval: Duration,
}

impl SessionClock {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(1))
    }

    pub fn with_interval(tick_interval: Duration) -> Self {
        let (display_tx, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(ClockState::new())),
            display_tx: Arc::new(display_tx),
            ticker: Arc::new(Mutex::new(None)),
            tick_interval,
        }
    }

    pub fn start(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if state.status != ClockStatus::Idle {
                bail!("session clock already started");
            }
            state.begin(Utc::now());
        }
        self.display_tx.send_replace(0);
        self.spawn_ticker();
        info!("Session clock started");
        Ok(())
    }

    /// Freeze the clock and return the authoritative elapsed seconds.
    ///
    /// Synchronous so it can run first on every session-ending path,
    /// including `Drop`.
    pub fn stop(&self) -> u64 {
        let (elapsed, was_running) = {
            let mut state = lock(&self.state);
            let was_running = state.is_running();
            (state.stop(Utc::now()), was_running)
        };

        if let Some(handle) = lock(&self.ticker).take() {
            handle.abort();
        }

        if was_running {
            self.display_tx.send_replace(elapsed);
            info!("Session clock stopped at {}s", elapsed);
        }
        elapsed
    }

    pub fn elapsed(&self) -> u64 {
        lock(&self.state).elapsed_secs
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).is_running()
    }

    pub fn snapshot(&self) -> ClockState {
        lock(&self.state).clone()
    }

    /// Display projection; trails `elapsed()` by at most one publish.
    pub fn displayed(&self) -> u64 {
        *self.display_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.display_tx.subscribe()
    }

    fn spawn_ticker(&self) {
        let mut ticker_guard = lock(&self.ticker);
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }

        let state = self.state.clone();
        let display_tx = self.display_tx.clone();
        let tick_interval = self.tick_interval;

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + tick_interval, tick_interval);
            loop {
                interval.tick().await;

                let elapsed = {
                    let mut guard = lock(&state);
                    match guard.tick() {
                        Some(elapsed) => elapsed,
                        None => break,
                    }
                };

                display_tx.send_replace(elapsed);
            }
            debug!("Session clock ticker exited");
        });

        *ticker_guard = Some(handle);
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}
