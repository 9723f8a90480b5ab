use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, MutexGuard,
};

use anyhow::{anyhow, bail, Result};
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Literal the scorer treats as "user ended the session, send the report".
pub const STOP_TOKEN: &str = "STOP";

/// Outbound slots between the sampler and the socket writer. Frames that do
/// not fit are dropped, never queued behind a slow socket.
pub const FRAME_BUFFER: usize = 2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ChannelState {
    #[default]
    Idle,
    Connecting,
    Open,
    Finalized,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A `data:image/jpeg;base64,...` frame.
    Frame(String),
    Stop,
}

impl Outbound {
    pub fn into_text(self) -> String {
        match self {
            Outbound::Frame(data_url) => data_url,
            Outbound::Stop => STOP_TOKEN.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Text(String),
    Closed(Option<String>),
}

/// One established connection, already past the handshake.
///
/// Cancelling `shutdown` must close the underlying socket and end both pumps.
pub struct TelemetryLink {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<InboundEvent>,
    pub shutdown: CancellationToken,
}

pub trait TelemetryConnector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<TelemetryLink>>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCounters {
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

struct Wiring {
    outbound: Option<mpsc::Sender<Outbound>>,
    shutdown: Option<CancellationToken>,
    /// Set once `STOP` is queued; no frame may follow it on the wire.
    stopping: bool,
}

/// Client side of the scoring connection.
///
/// Idle -> Connecting on session start, Connecting -> Open once a link is
/// attached, Open -> Finalized on the terminal report, anything -> Closed on
/// teardown or disconnect. Closed is terminal.
pub struct TelemetryChannel {
    state: watch::Sender<ChannelState>,
    wiring: Mutex<Wiring>,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl TelemetryChannel {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        Self {
            state,
            wiring: Mutex::new(Wiring {
                outbound: None,
                shutdown: None,
                stopping: false,
            }),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    fn wiring(&self) -> MutexGuard<'_, Wiring> {
        match self.wiring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Open and not yet asked to stop.
    pub fn accepts_frames(&self) -> bool {
        let wiring = self.wiring();
        !wiring.stopping && self.state() == ChannelState::Open
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn counters(&self) -> ChannelCounters {
        ChannelCounters {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }

    // Transitions happen while holding the wiring lock so they cannot race
    // with attach/close.
    fn transition(&self, from: &[ChannelState], to: ChannelState) -> bool {
        let mut changed = false;
        self.state.send_if_modified(|current| {
            if from.contains(current) {
                debug!("Telemetry channel {:?} -> {:?}", current, to);
                *current = to;
                changed = true;
                true
            } else {
                false
            }
        });
        changed
    }

    pub fn begin_connect(&self) -> Result<()> {
        let _wiring = self.wiring();
        if !self.transition(&[ChannelState::Idle], ChannelState::Connecting) {
            bail!("telemetry channel already used ({:?})", self.state());
        }
        Ok(())
    }

    /// Adopt an established link. Returns the inbound half when the channel is
    /// still waiting for it; a link arriving after teardown is shut down.
    pub fn attach(&self, link: TelemetryLink) -> Option<mpsc::Receiver<InboundEvent>> {
        let mut wiring = self.wiring();
        if !self.transition(&[ChannelState::Connecting], ChannelState::Open) {
            info!(
                "Discarding telemetry link that arrived in state {:?}",
                self.state()
            );
            link.shutdown.cancel();
            return None;
        }
        wiring.outbound = Some(link.outbound);
        wiring.shutdown = Some(link.shutdown);
        info!("Telemetry channel open");
        Some(link.inbound)
    }

    pub fn connect_failed(&self, err: &anyhow::Error) {
        let _wiring = self.wiring();
        if self.transition(&[ChannelState::Connecting], ChannelState::Closed) {
            warn!("Telemetry channel failed to connect: {err:#}");
        }
    }

    /// Fire-and-forget frame send. Returns whether the frame was handed to the
    /// socket writer; anything else counts as a dropped frame.
    pub fn send_frame(&self, data_url: String) -> bool {
        let wiring = self.wiring();
        let sent = match (&wiring.outbound, self.state()) {
            (Some(outbound), ChannelState::Open) if !wiring.stopping => {
                outbound.try_send(Outbound::Frame(data_url)).is_ok()
            }
            _ => false,
        };
        drop(wiring);

        if sent {
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Ask the scorer to wrap up. Only valid while open.
    ///
    /// The frame gate closes before `STOP` is queued, so every frame the
    /// writer sees afterwards was queued ahead of it.
    pub async fn send_stop(&self) -> Result<()> {
        let outbound = {
            let mut wiring = self.wiring();
            if self.state() != ChannelState::Open {
                bail!("cannot send stop in state {:?}", self.state());
            }
            let outbound = wiring
                .outbound
                .clone()
                .ok_or_else(|| anyhow!("telemetry channel has no outbound link"))?;
            wiring.stopping = true;
            outbound
        };

        outbound
            .send(Outbound::Stop)
            .await
            .map_err(|_| anyhow!("telemetry writer closed before stop was sent"))?;
        info!("Stop token sent to scoring service");
        Ok(())
    }

    /// Terminal report received; frames stop but the socket stays up.
    pub fn mark_finalized(&self) -> bool {
        let _wiring = self.wiring();
        self.transition(&[ChannelState::Open], ChannelState::Finalized)
    }

    /// Remote side went away.
    pub fn mark_disconnected(&self, reason: Option<&str>) {
        let mut wiring = self.wiring();
        wiring.outbound = None;
        if self.transition(
            &[ChannelState::Connecting, ChannelState::Open, ChannelState::Finalized],
            ChannelState::Closed,
        ) {
            info!(
                "Telemetry channel closed by peer{}",
                reason.map(|r| format!(": {r}")).unwrap_or_default()
            );
        }
    }

    /// Release the socket. Safe from any state and from `Drop`.
    pub fn close(&self) {
        let mut wiring = self.wiring();
        wiring.outbound = None;
        if let Some(shutdown) = wiring.shutdown.take() {
            shutdown.cancel();
        }
        if self.transition(
            &[
                ChannelState::Idle,
                ChannelState::Connecting,
                ChannelState::Open,
                ChannelState::Finalized,
            ],
            ChannelState::Closed,
        ) {
            info!("Telemetry channel closed");
        }
    }
}

impl Default for TelemetryChannel {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::link_pair;
    use super::*;

    #[test]
    fn frames_are_dropped_until_open() {
        let channel = TelemetryChannel::new();
        assert!(!channel.send_frame("data:a".into()));

        channel.begin_connect().unwrap();
        assert!(!channel.send_frame("data:b".into()));

        let (link, mut server) = link_pair();
        assert!(channel.attach(link).is_some());
        assert!(channel.send_frame("data:c".into()));

        assert_eq!(
            server.from_client.try_recv().unwrap(),
            Outbound::Frame("data:c".into())
        );
        assert_eq!(
            channel.counters(),
            ChannelCounters {
                frames_sent: 1,
                frames_dropped: 2
            }
        );
    }

    #[test]
    fn full_buffer_drops_instead_of_queueing() {
        let channel = TelemetryChannel::new();
        channel.begin_connect().unwrap();
        let (link, _server) = link_pair();
        channel.attach(link);

        for _ in 0..FRAME_BUFFER {
            assert!(channel.send_frame("data:x".into()));
        }
        assert!(!channel.send_frame("data:overflow".into()));
        assert_eq!(channel.counters().frames_dropped, 1);
    }

    #[test]
    fn finalized_channel_suppresses_frames() {
        let channel = TelemetryChannel::new();
        channel.begin_connect().unwrap();
        let (link, server) = link_pair();
        channel.attach(link);

        assert!(channel.mark_finalized());
        assert_eq!(channel.state(), ChannelState::Finalized);
        assert!(!channel.send_frame("data:late".into()));
        assert!(!server.shutdown.is_cancelled());
    }

    #[test]
    fn close_cancels_link_and_is_terminal() {
        let channel = TelemetryChannel::new();
        channel.begin_connect().unwrap();
        let (link, server) = link_pair();
        channel.attach(link);

        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(server.shutdown.is_cancelled());
        assert!(!channel.send_frame("data:after".into()));
        assert!(!channel.mark_finalized());
        assert!(channel.begin_connect().is_err());
    }

    #[test]
    fn late_link_after_close_is_shut_down() {
        let channel = TelemetryChannel::new();
        channel.begin_connect().unwrap();
        channel.close();

        let (link, server) = link_pair();
        assert!(channel.attach(link).is_none());
        assert!(server.shutdown.is_cancelled());
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn connect_failure_closes() {
        let channel = TelemetryChannel::new();
        channel.begin_connect().unwrap();
        channel.connect_failed(&anyhow!("refused"));
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn stop_requires_open_channel() {
        let channel = TelemetryChannel::new();
        assert!(channel.send_stop().await.is_err());

        channel.begin_connect().unwrap();
        let (link, mut server) = link_pair();
        channel.attach(link);

        channel.send_stop().await.unwrap();
        assert_eq!(server.from_client.recv().await, Some(Outbound::Stop));
        assert_eq!(Outbound::Stop.into_text(), "STOP");
    }

    #[tokio::test]
    async fn no_frame_is_queued_after_stop() {
        let channel = TelemetryChannel::new();
        channel.begin_connect().unwrap();
        let (link, mut server) = link_pair();
        channel.attach(link);

        assert!(channel.send_frame("data:before".into()));
        channel.send_stop().await.unwrap();
        assert!(!channel.accepts_frames());
        assert!(!channel.send_frame("data:after".into()));

        // Still open for the final report.
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(
            server.from_client.recv().await,
            Some(Outbound::Frame("data:before".into()))
        );
        assert_eq!(server.from_client.recv().await, Some(Outbound::Stop));
        assert!(server.from_client.try_recv().is_err());
        assert_eq!(channel.counters().frames_dropped, 1);
    }
}
