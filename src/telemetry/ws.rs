use anyhow::{Context, Result};
use futures_util::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;

use super::channel::{InboundEvent, Outbound, TelemetryConnector, TelemetryLink, FRAME_BUFFER};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const INBOUND_BUFFER: usize = 64;

/// Connects to the scoring service over a plain WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl TelemetryConnector for WebSocketConnector {
    fn connect(&self) -> BoxFuture<'static, Result<TelemetryLink>> {
        let url = self.url.clone();
        async move { open_link(url).await }.boxed()
    }
}

async fn open_link(url: String) -> Result<TelemetryLink> {
    log_info!("Connecting to scoring service at {}", url);
    let (socket, response) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to scoring service at {url}"))?;
    log_info!("Scoring service connected: {}", response.status());

    let (mut write, mut read) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(FRAME_BUFFER);
    let (inbound_tx, inbound_rx) = mpsc::channel::<InboundEvent>(INBOUND_BUFFER);
    let shutdown = CancellationToken::new();

    // Writer: drains outbound until the session drops its sender or shuts down.
    let writer_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_shutdown.cancelled() => break,
                next = outbound_rx.recv() => {
                    let Some(outbound) = next else { break };
                    let is_stop = outbound == Outbound::Stop;
                    if let Err(err) = write.send(Message::Text(outbound.into_text())).await {
                        log_warn!("Telemetry send failed: {err}");
                        break;
                    }
                    if is_stop {
                        log_debug!("Stop token flushed to scoring service");
                    }
                }
            }
        }
        let _ = write.send(Message::Close(None)).await;
        let _ = write.close().await;
        log_debug!("Telemetry writer exited");
    });

    // Reader: forwards text frames in arrival order, then a single Closed.
    let reader_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                _ = reader_shutdown.cancelled() => break Some("client shutdown".to_string()),
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(InboundEvent::Text(text)).await.is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if inbound_tx.send(InboundEvent::Text(text)).await.is_err() {
                                break None;
                            }
                        }
                        Err(_) => log_warn!("Ignoring non UTF-8 binary frame from scoring service"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break Some(
                            frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_else(|| "closed by scoring service".to_string()),
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Some(format!("socket error: {err}")),
                    None => break Some("connection ended".to_string()),
                }
            }
        };
        let _ = inbound_tx.send(InboundEvent::Closed(reason)).await;
        reader_shutdown.cancel();
        log_debug!("Telemetry reader exited");
    });

    Ok(TelemetryLink {
        outbound: outbound_tx,
        inbound: inbound_rx,
        shutdown,
    })
}
