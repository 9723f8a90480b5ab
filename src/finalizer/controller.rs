use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use log::{error, info};
use serde::Serialize;

use crate::{
    clock::SessionClock,
    identity::IdentityResolver,
    sampler::FrameSampler,
    scores::ScoreBoard,
    telemetry::{FinalReport, TelemetryChannel},
};

use super::{payload::PersistencePayload, store::ScoreStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeOutcome {
    pub payload: PersistencePayload,
    pub submitted: bool,
    pub report: FinalReport,
}

/// One-shot routine run on the terminal report.
pub struct SessionFinalizer {
    fired: AtomicBool,
    clock: SessionClock,
    sampler: Arc<FrameSampler>,
    channel: Arc<TelemetryChannel>,
    scores: Arc<ScoreBoard>,
    identity: IdentityResolver,
    store: Arc<dyn ScoreStore>,
}

impl SessionFinalizer {
    pub fn new(
        clock: SessionClock,
        sampler: Arc<FrameSampler>,
        channel: Arc<TelemetryChannel>,
        scores: Arc<ScoreBoard>,
        identity: IdentityResolver,
        store: Arc<dyn ScoreStore>,
    ) -> Self {
        Self {
            fired: AtomicBool::new(false),
            clock,
            sampler,
            channel,
            scores,
            identity,
            store,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Freeze the session and build its payload. Only the first call does
    /// anything; later calls return `None`.
    ///
    /// Everything up to the network request happens synchronously here so a
    /// report that arrives later cannot observe a half-frozen session.
    pub fn finalize(&self, report: FinalReport) -> Option<PendingSubmission> {
        if self.fired.swap(true, Ordering::SeqCst) {
            return None;
        }

        // The clock stops before anything else so the duration cannot drift.
        let duration = self.clock.stop();
        self.channel.mark_finalized();
        self.scores.freeze();
        self.sampler.disable();

        let identity = self.identity.resolve();
        let payload = PersistencePayload {
            user_id: identity.user_id().to_string(),
            duration,
            scores: report.scores.sanitized(),
        };
        info!(
            "Final report received: user={} duration={}s scores={:?}",
            payload.user_id, payload.duration, payload.scores
        );

        Some(PendingSubmission {
            payload,
            report,
            store: self.store.clone(),
        })
    }
}

/// A frozen payload waiting for its single persistence request. Owns
/// everything it needs, so it can run on a task of its own.
pub struct PendingSubmission {
    payload: PersistencePayload,
    report: FinalReport,
    store: Arc<dyn ScoreStore>,
}

impl PendingSubmission {
    pub fn payload(&self) -> &PersistencePayload {
        &self.payload
    }

    pub async fn submit(self) -> FinalizeOutcome {
        let submitted = match self.store.submit(&self.payload).await {
            Ok(()) => true,
            Err(err) => {
                error!("Failed to persist session scores: {err:#}");
                false
            }
        };

        FinalizeOutcome {
            payload: self.payload,
            submitted,
            report: self.report,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Map;
    use tokio::time;

    use super::*;
    use crate::{
        finalizer::store::testing::RecordingStore,
        identity::{StaticCredentials, GUEST_USER},
        sampler::{device::testing::CountingDevice, SamplerConfig},
        scores::Scores,
        telemetry::{channel::testing::link_pair, ChannelState},
    };

    struct Fixture {
        clock: SessionClock,
        sampler: Arc<FrameSampler>,
        channel: Arc<TelemetryChannel>,
        scores: Arc<ScoreBoard>,
        device: CountingDevice,
        store: RecordingStore,
        finalizer: SessionFinalizer,
    }

    fn fixture(store: RecordingStore) -> Fixture {
        let clock = SessionClock::new();
        let channel = Arc::new(TelemetryChannel::new());
        let device = CountingDevice::default();
        let sampler = Arc::new(FrameSampler::new(
            Arc::new(device.clone()),
            channel.clone(),
            SamplerConfig {
                width: 32,
                height: 24,
                ..SamplerConfig::default()
            },
        ));
        let scores = Arc::new(ScoreBoard::new());
        let finalizer = SessionFinalizer::new(
            clock.clone(),
            sampler.clone(),
            channel.clone(),
            scores.clone(),
            IdentityResolver::new(Arc::new(StaticCredentials(None))),
            Arc::new(store.clone()),
        );
        Fixture {
            clock,
            sampler,
            channel,
            scores,
            device,
            store,
            finalizer,
        }
    }

    fn report(attention: f64) -> FinalReport {
        FinalReport {
            scores: Scores::new(attention, 60.0, 70.0, 80.0),
            extra: Map::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn submits_once_with_authoritative_duration() {
        let fx = fixture(RecordingStore::default());
        fx.channel.begin_connect().unwrap();
        let (link, _server) = link_pair();
        fx.channel.attach(link);
        fx.clock.start().unwrap();
        fx.sampler.enable().await;

        time::sleep(Duration::from_millis(4_200)).await;

        let pending = fx.finalizer.finalize(report(55.0)).unwrap();
        // Frozen before the request goes out.
        assert!(!fx.clock.is_running());
        assert!(fx.scores.is_frozen());
        assert!(fx.store.submissions().is_empty());

        let outcome = pending.submit().await;
        assert!(outcome.submitted);
        assert_eq!(outcome.payload.duration, 4);
        assert_eq!(outcome.payload.user_id, GUEST_USER);
        assert_eq!(outcome.payload.scores, Scores::new(55.0, 60.0, 70.0, 80.0));

        assert!(!fx.clock.is_running());
        assert!(!fx.sampler.is_enabled());
        assert_eq!(fx.device.live_handles(), 0);
        assert!(fx.scores.is_frozen());
        assert_eq!(fx.channel.state(), ChannelState::Finalized);

        assert!(fx.finalizer.finalize(report(99.0)).is_none());
        assert_eq!(fx.store.submissions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_is_reported_not_raised() {
        let fx = fixture(RecordingStore::failing());
        fx.clock.start().unwrap();

        let pending = fx.finalizer.finalize(report(10.0)).unwrap();
        assert_eq!(pending.payload().scores.attention, 10.0);
        let outcome = pending.submit().await;
        assert!(!outcome.submitted);
        assert_eq!(fx.store.submissions().len(), 1);
        assert!(fx.finalizer.has_fired());
    }
}
