use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use futures_util::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use image::{DynamicImage, Rgb, RgbImage};
use prepai_lib::{
    identity::StaticCredentials, CaptureDevice, CaptureStream, ChannelState, LiveSession,
    PersistencePayload, SamplerConfig, ScoreStore, SessionDeps, SessionEvent, SessionOptions,
    WebSocketConnector,
};
use serde_json::json;
use tokio::{net::TcpListener, sync::oneshot, time};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};

#[derive(Clone, Default)]
struct SolidDevice {
    live: Arc<AtomicUsize>,
}

struct SolidStream {
    live: Arc<AtomicUsize>,
}

impl CaptureDevice for SolidDevice {
    fn acquire(
        &self,
        _width: u32,
        _height: u32,
    ) -> BoxFuture<'static, Result<Box<dyn CaptureStream>>> {
        let live = self.live.clone();
        async move {
            live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(SolidStream { live }) as Box<dyn CaptureStream>)
        }
        .boxed()
    }
}

impl CaptureStream for SolidStream {
    fn latest_frame(&mut self) -> Option<DynamicImage> {
        Some(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            16,
            12,
            Rgb([200, 120, 40]),
        )))
    }
}

impl Drop for SolidStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
struct MemoryStore {
    saved: Arc<Mutex<Vec<PersistencePayload>>>,
}

impl ScoreStore for MemoryStore {
    fn submit(&self, payload: &PersistencePayload) -> BoxFuture<'static, Result<()>> {
        self.saved.lock().unwrap().push(payload.clone());
        async { Ok(()) }.boxed()
    }
}

#[derive(Debug, Default)]
struct ServerLog {
    frames: usize,
    stops: usize,
}

/// Scores every third frame and answers `STOP` with a final report.
async fn spawn_scorer() -> (String, oneshot::Receiver<ServerLog>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = accept_async(stream).await.unwrap();
        let mut log = ServerLog::default();

        while let Some(Ok(message)) = socket.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            if text == "STOP" {
                log.stops += 1;
                let report = json!({
                    "type": "final_report",
                    "attention": 81, "stability": "72.5", "smoothness": 64, "confidence": 90,
                    "feedback": "Good eye contact"
                });
                socket.send(Message::Text(report.to_string())).await.unwrap();
                continue;
            }

            assert!(text.starts_with("data:image/jpeg;base64,"));
            log.frames += 1;
            if log.frames % 3 == 0 {
                socket.send(Message::Text("{oops".into())).await.unwrap();
                let realtime = json!({
                    "type": "realtime",
                    "attention": log.frames, "stability": 50, "smoothness": 50, "confidence": 50
                });
                socket.send(Message::Text(realtime.to_string())).await.unwrap();
            }
        }
        let _ = done_tx.send(log);
    });

    (url, done_rx)
}

#[tokio::test]
async fn full_session_over_websocket() {
    let (url, server_done) = spawn_scorer().await;
    let device = SolidDevice::default();
    let store = MemoryStore::default();

    let session = LiveSession::new(
        SessionDeps {
            connector: Arc::new(WebSocketConnector::new(url)),
            device: Arc::new(device.clone()),
            store: Arc::new(store.clone()),
            credentials: Arc::new(StaticCredentials(None)),
            journal: None,
        },
        SessionOptions {
            sampler: SamplerConfig {
                frame_interval: Duration::from_millis(20),
                width: 16,
                height: 12,
                jpeg_quality: 40,
            },
            ..SessionOptions::default()
        },
    );
    let mut events = session.subscribe();
    session.start().await.unwrap();

    // Wait for a few realtime updates to arrive.
    time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::ScoresUpdated { .. }) if session.snapshot().score_updates >= 2 => {
                    break
                }
                Ok(_) => continue,
                Err(err) => panic!("event stream failed: {err}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(device.live.load(Ordering::SeqCst), 1);

    let ended = session.end_session().await;
    assert!(ended.camera_enabled);

    let outcome = time::timeout(Duration::from_secs(10), session.finished())
        .await
        .unwrap()
        .expect("final report");
    assert!(outcome.submitted);
    assert_eq!(outcome.payload.user_id, "guest_user");
    assert_eq!(outcome.payload.duration, ended.elapsed_secs);
    assert_eq!(outcome.payload.scores.stability, 72.5);
    assert_eq!(
        outcome.report.extra.get("feedback"),
        Some(&json!("Good eye contact"))
    );
    assert_eq!(store.saved.lock().unwrap().len(), 1);
    assert_eq!(device.live.load(Ordering::SeqCst), 0);

    let snapshot = session.snapshot();
    assert!(snapshot.protocol_errors >= 1);
    assert_eq!(snapshot.channel_state, ChannelState::Finalized);

    session.shutdown().await;
    assert_eq!(session.snapshot().channel_state, ChannelState::Closed);

    let log = time::timeout(Duration::from_secs(10), server_done)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.stops, 1);
    assert!(log.frames >= 3);
}

#[tokio::test]
async fn unreachable_scorer_degrades_without_telemetry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let device = SolidDevice::default();
    let store = MemoryStore::default();
    let session = LiveSession::new(
        SessionDeps {
            connector: Arc::new(WebSocketConnector::new(url)),
            device: Arc::new(device.clone()),
            store: Arc::new(store.clone()),
            credentials: Arc::new(StaticCredentials(None)),
            journal: None,
        },
        SessionOptions::default(),
    );
    session.start().await.unwrap();

    assert_eq!(
        time::timeout(Duration::from_secs(10), session.finished())
            .await
            .unwrap(),
        None
    );
    let snapshot = session.end_session().await;
    assert_eq!(snapshot.channel_state, ChannelState::Closed);
    assert_eq!(snapshot.frames_sent, 0);
    assert!(!snapshot.camera_enabled);
    assert_eq!(device.live.load(Ordering::SeqCst), 0);
    assert!(store.saved.lock().unwrap().is_empty());
}
