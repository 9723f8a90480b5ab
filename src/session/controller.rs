use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use chrono::Utc;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    clock::{format_elapsed, SessionClock},
    db::{Database, SessionRecord},
    finalizer::{FinalizeOutcome, PendingSubmission, ScoreStore, SessionFinalizer},
    identity::{CredentialProvider, IdentityResolver},
    log_debug, log_error, log_info, log_warn,
    sampler::{CaptureDevice, FrameSampler, SamplerConfig},
    scores::ScoreBoard,
    telemetry::{
        parse_message, ChannelState, InboundEvent, TelemetryChannel, TelemetryConnector,
        TelemetryMessage,
    },
};

use super::{SessionEvent, SessionMode, SessionSnapshot};

const ENABLE_LOGS: bool = true;

const EVENT_BUFFER: usize = 256;

/// Upper bound on handing `STOP` to the socket writer.
const STOP_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// External collaborators of a session.
pub struct SessionDeps {
    pub connector: Arc<dyn TelemetryConnector>,
    pub device: Arc<dyn CaptureDevice>,
    pub store: Arc<dyn ScoreStore>,
    pub credentials: Arc<dyn CredentialProvider>,
    /// Local history; sessions run fine without one.
    pub journal: Option<Database>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub mode: SessionMode,
    pub camera_enabled: bool,
    pub mic_enabled: bool,
    pub sampler: SamplerConfig,
    pub tick_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mode: SessionMode::Interview,
            camera_enabled: true,
            mic_enabled: true,
            sampler: SamplerConfig::default(),
            tick_interval: Duration::from_secs(1),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// State reachable from the session's background tasks. Tasks only ever hold
/// this, never the `LiveSession` itself, so dropping the handle still runs
/// teardown.
struct Shared {
    id: String,
    mode: SessionMode,
    clock: SessionClock,
    channel: Arc<TelemetryChannel>,
    sampler: Arc<FrameSampler>,
    scores: Arc<ScoreBoard>,
    finalizer: SessionFinalizer,
    journal: Option<Database>,
    events: broadcast::Sender<SessionEvent>,
    outcome: watch::Sender<Option<FinalizeOutcome>>,
    mic_enabled: AtomicBool,
    protocol_errors: AtomicU64,
    /// Set once the journal has been told how the session ended.
    ended: AtomicBool,
    /// Persistence of the final report. Teardown never aborts it.
    completion: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> SessionSnapshot {
        let elapsed_secs = self.clock.elapsed();
        let counters = self.channel.counters();
        SessionSnapshot {
            session_id: self.id.clone(),
            mode: self.mode,
            elapsed_secs,
            duration_label: format_elapsed(elapsed_secs),
            camera_enabled: self.sampler.is_enabled(),
            mic_enabled: self.mic_enabled.load(Ordering::SeqCst),
            channel_state: self.channel.state(),
            scores: self.scores.latest(),
            finalized: self.finalizer.has_fired(),
            frames_sent: counters.frames_sent,
            frames_dropped: counters.frames_dropped,
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            score_updates: self.scores.update_count(),
        }
    }

    /// Apply one inbound frame. A first final report freezes the session on
    /// the spot and comes back as the submission still to be made.
    fn handle_text(&self, text: &str) -> Option<PendingSubmission> {
        let message = match parse_message(text) {
            Ok(message) => message,
            Err(err) => {
                self.protocol_errors.fetch_add(1, Ordering::Relaxed);
                log_warn!("Ignoring inbound message: {err}");
                return None;
            }
        };
        log_debug!("Inbound {} message for session {}", message.kind(), self.id);

        match message {
            TelemetryMessage::Realtime(scores) => {
                if self.scores.apply_realtime(scores) {
                    self.emit(SessionEvent::ScoresUpdated {
                        scores: self.scores.latest(),
                    });
                } else {
                    log_debug!("Realtime scores after final report ignored");
                }
                None
            }
            TelemetryMessage::FinalReport(report) => {
                let Some(pending) = self.finalizer.finalize(report) else {
                    log_info!("Duplicate final report ignored for session {}", self.id);
                    return None;
                };
                // The completion entry supersedes the plain "ended" one.
                self.ended.store(true, Ordering::SeqCst);
                Some(pending)
            }
        }
    }

    async fn complete(&self, pending: PendingSubmission) {
        log_debug!(
            "Submitting scores for session {} as {}",
            self.id,
            pending.payload().user_id
        );
        let outcome = pending.submit().await;
        self.record_completion(&outcome).await;
        self.outcome.send_replace(Some(outcome.clone()));
        self.emit(SessionEvent::Finalized { outcome });
    }

    async fn record_completion(&self, outcome: &FinalizeOutcome) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(err) = journal
            .mark_session_completed(
                &self.id,
                &outcome.payload.user_id,
                outcome.payload.duration,
                outcome.payload.scores,
                outcome.submitted,
                Utc::now(),
            )
            .await
        {
            log_error!("Failed to journal completed session {}: {err:#}", self.id);
        }
    }

    /// Claim the "ended" journal entry. Returns false if someone already did.
    fn claim_end(&self) -> bool {
        !self.ended.swap(true, Ordering::SeqCst)
    }

    async fn record_end(&self, duration_secs: u64) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(err) = journal
            .mark_session_ended(&self.id, duration_secs, Utc::now())
            .await
        {
            log_error!("Failed to journal ended session {}: {err:#}", self.id);
        }
    }
}

/// Controller for one live practice session.
///
/// Owns the clock, camera, telemetry channel and score state for its whole
/// lifetime. Every exit path (`end_session`, `shutdown`, `Drop`) funnels into
/// the same teardown, which releases the camera and closes the channel.
pub struct LiveSession {
    shared: Arc<Shared>,
    connector: Arc<dyn TelemetryConnector>,
    camera_requested: bool,
    started: AtomicBool,
    torn_down: AtomicBool,
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LiveSession {
    pub fn new(deps: SessionDeps, options: SessionOptions) -> Self {
        let clock = SessionClock::with_interval(options.tick_interval);
        let channel = Arc::new(TelemetryChannel::new());
        let sampler = Arc::new(FrameSampler::new(
            deps.device,
            channel.clone(),
            options.sampler,
        ));
        let scores = Arc::new(ScoreBoard::new());
        let finalizer = SessionFinalizer::new(
            clock.clone(),
            sampler.clone(),
            channel.clone(),
            scores.clone(),
            IdentityResolver::new(deps.credentials),
            deps.store,
        );
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (outcome, _) = watch::channel(None);

        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4().to_string(),
                mode: options.mode,
                clock,
                channel,
                sampler,
                scores,
                finalizer,
                journal: deps.journal,
                events,
                outcome,
                mic_enabled: AtomicBool::new(options.mic_enabled),
                protocol_errors: AtomicU64::new(0),
                ended: AtomicBool::new(false),
                completion: Mutex::new(None),
            }),
            connector: deps.connector,
            camera_requested: options.camera_enabled,
            started: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn mode(&self) -> SessionMode {
        self.shared.mode
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot()
    }

    /// Start the clock, open the telemetry channel and, if requested, the
    /// camera. A session can only be started once.
    pub async fn start(&self) -> Result<()> {
        if self.torn_down.load(Ordering::SeqCst) {
            bail!("session {} already torn down", self.shared.id);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("session {} already started", self.shared.id);
        }

        if let Some(journal) = &self.shared.journal {
            let record =
                SessionRecord::running(self.shared.id.clone(), self.shared.mode, Utc::now());
            if let Err(err) = journal.insert_session(&record).await {
                log_error!("Failed to journal session start: {err:#}");
            }
        }

        self.shared.clock.start()?;
        self.shared.channel.begin_connect()?;

        self.spawn_task(forward_display_events(
            self.shared.clock.subscribe(),
            self.shared.channel.subscribe(),
            self.shared.events.clone(),
            self.cancel_token.clone(),
        ));
        self.spawn_task(connect_and_dispatch(
            self.shared.clone(),
            self.connector.clone(),
            self.cancel_token.clone(),
        ));

        log_info!(
            "Session {} started ({} mode, camera {}, mic {})",
            self.shared.id,
            self.shared.mode,
            if self.camera_requested { "on" } else { "off" },
            if self.shared.mic_enabled.load(Ordering::SeqCst) { "on" } else { "off" },
        );

        if self.camera_requested {
            self.set_camera_enabled(true).await;
        }
        Ok(())
    }

    fn spawn_task<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        lock(&self.tasks).push(handle);
    }

    /// Turn capture on or off mid-session. Returns whether the camera is on.
    pub async fn set_camera_enabled(&self, enabled: bool) -> bool {
        if !enabled {
            self.shared.sampler.disable();
            self.shared.emit(SessionEvent::CameraChanged { enabled: false });
            return false;
        }

        if !self.started.load(Ordering::SeqCst)
            || self.torn_down.load(Ordering::SeqCst)
            || self.shared.finalizer.has_fired()
            || !self.shared.clock.is_running()
        {
            log_warn!("Camera not enabled: session {} is not live", self.shared.id);
            return false;
        }

        let on = self.shared.sampler.enable().await;
        if on && self.torn_down.load(Ordering::SeqCst) {
            // Torn down while the device was being acquired.
            self.shared.sampler.disable();
            return false;
        }
        self.shared.emit(SessionEvent::CameraChanged { enabled: on });
        on
    }

    pub fn set_mic_enabled(&self, enabled: bool) {
        if self.shared.mic_enabled.swap(enabled, Ordering::SeqCst) != enabled {
            log_info!("Microphone {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    /// User-initiated end.
    ///
    /// The clock stops first. While the channel is open the scorer is asked for
    /// its final report; sampling stops before `STOP` goes out but the camera
    /// stays held until the report arrives. In any other state the camera is
    /// released immediately.
    pub async fn end_session(&self) -> SessionSnapshot {
        let duration = self.shared.clock.stop();

        match self.shared.channel.state() {
            ChannelState::Open => {
                self.shared.sampler.pause();
                match time::timeout(STOP_SEND_TIMEOUT, self.shared.channel.send_stop()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        log_warn!("Could not request final report: {err:#}");
                        self.shared.sampler.disable();
                    }
                    Err(_) => {
                        log_warn!("Timed out requesting final report");
                        self.shared.sampler.disable();
                    }
                }
            }
            ChannelState::Finalized => {
                self.shared.sampler.disable();
                self.shared.channel.close();
            }
            _ => self.shared.sampler.disable(),
        }

        if self.started.load(Ordering::SeqCst) && self.shared.claim_end() {
            self.shared.record_end(duration).await;
        }

        let snapshot = self.shared.snapshot();
        log_info!(
            "Session {} ended at {} (channel {:?})",
            self.shared.id,
            snapshot.duration_label,
            snapshot.channel_state
        );
        self.shared.emit(SessionEvent::Ended {
            snapshot: snapshot.clone(),
        });
        snapshot
    }

    /// Resolves with the finalize outcome, or `None` once the channel closes
    /// without one.
    pub async fn finished(&self) -> Option<FinalizeOutcome> {
        let mut outcome = self.shared.outcome.subscribe();
        let mut state = self.shared.channel.subscribe();
        loop {
            if let Some(done) = outcome.borrow_and_update().clone() {
                return Some(done);
            }
            if *state.borrow_and_update() == ChannelState::Closed {
                return None;
            }
            tokio::select! {
                changed = outcome.changed() => if changed.is_err() { return None; },
                changed = state.changed() => if changed.is_err() { return None; },
            }
        }
    }

    /// Tear down, then wait for any in-flight score submission and for the
    /// journal to record the end.
    pub async fn shutdown(&self) {
        let torn_down = self.teardown();

        let completion = lock(&self.shared.completion).take();
        if let Some(completion) = completion {
            if let Err(err) = completion.await {
                log_error!("Score submission task for session {} failed: {err}", self.shared.id);
            }
        }

        let Some(duration) = torn_down else {
            return;
        };
        if self.started.load(Ordering::SeqCst) && self.shared.claim_end() {
            self.shared.record_end(duration).await;
        }
    }

    /// Release everything the session owns. Synchronous so `Drop` can use it.
    /// Returns the frozen duration on the first call only. A score submission
    /// already under way is left to finish on its own task.
    fn teardown(&self) -> Option<u64> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return None;
        }

        let duration = self.shared.clock.stop();
        self.shared.sampler.disable();
        self.shared.channel.close();
        self.cancel_token.cancel();
        for handle in lock(&self.tasks).drain(..) {
            handle.abort();
        }

        log_info!("Session {} torn down at {}s", self.shared.id, duration);
        Some(duration)
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        let Some(duration) = self.teardown() else {
            return;
        };
        if !self.started.load(Ordering::SeqCst) || !self.shared.claim_end() {
            return;
        }
        if self.shared.journal.is_none() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = self.shared.clone();
                handle.spawn(async move { shared.record_end(duration).await });
            }
            Err(_) => log_warn!(
                "Session {} dropped outside a runtime; journal left Running",
                self.shared.id
            ),
        }
    }
}

async fn forward_display_events(
    mut ticks: watch::Receiver<u64>,
    mut states: watch::Receiver<ChannelState>,
    events: broadcast::Sender<SessionEvent>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            changed = ticks.changed() => {
                if changed.is_err() {
                    break;
                }
                let elapsed_secs = *ticks.borrow_and_update();
                let _ = events.send(SessionEvent::ClockTick { elapsed_secs });
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                let _ = events.send(SessionEvent::ChannelStateChanged { state });
            }
        }
    }
}

async fn connect_and_dispatch(
    shared: Arc<Shared>,
    connector: Arc<dyn TelemetryConnector>,
    cancel_token: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel_token.cancelled() => return,
        result = connector.connect() => result,
    };

    let inbound = match connected {
        Ok(link) => match shared.channel.attach(link) {
            Some(inbound) => inbound,
            None => return,
        },
        Err(err) => {
            shared.channel.connect_failed(&err);
            return;
        }
    };

    dispatch_inbound(&shared, inbound, cancel_token).await;
}

/// Process inbound messages strictly in arrival order.
async fn dispatch_inbound(
    shared: &Arc<Shared>,
    mut inbound: mpsc::Receiver<InboundEvent>,
    cancel_token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel_token.cancelled() => break,
            event = inbound.recv() => event,
        };

        match event {
            Some(InboundEvent::Text(text)) => {
                if let Some(pending) = shared.handle_text(&text) {
                    let task_shared = shared.clone();
                    let handle = tokio::spawn(async move { task_shared.complete(pending).await });
                    *lock(&shared.completion) = Some(handle);
                }
            }
            Some(InboundEvent::Closed(reason)) => {
                shared.channel.mark_disconnected(reason.as_deref());
                break;
            }
            None => {
                shared.channel.mark_disconnected(None);
                break;
            }
        }
    }
    log_debug!("Inbound dispatcher for session {} exited", shared.id);
}
