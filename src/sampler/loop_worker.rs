use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use anyhow::{Context, Result};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::telemetry::TelemetryChannel;

use super::{
    controller::SamplerConfig,
    device::CaptureStream,
    encoder::{encode_frame, to_data_url},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = false;

use crate::{log_debug, log_warn};

pub(crate) type SharedStream = Arc<Mutex<Option<Box<dyn CaptureStream>>>>;

const ENCODE_TIMEOUT: Duration = Duration::from_secs(2);

/// Encodes the latest camera frame on every tick and hands it to the channel.
///
/// Ticks are skipped (not queued) while capture is disabled or the channel is
/// not accepting frames; a slow encode delays the next tick instead of bunching them up.
pub async fn sampling_loop(
    stream: SharedStream,
    channel: Arc<TelemetryChannel>,
    enabled: Arc<AtomicBool>,
    config: SamplerConfig,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !enabled.load(Ordering::SeqCst) || !channel.accepts_frames() {
                    continue;
                }

                match tokio::time::timeout(ENCODE_TIMEOUT, sample_once(&stream, &config)).await {
                    Ok(Ok(Some(data_url))) => {
                        // Re-check: capture or the channel may have gone away mid-encode.
                        if enabled.load(Ordering::SeqCst) && !cancel_token.is_cancelled() {
                            let sent = channel.send_frame(data_url);
                            log_debug!("frame {}", if sent { "sent" } else { "dropped" });
                        }
                    }
                    Ok(Ok(None)) => log_debug!("no frame ready"),
                    Ok(Err(err)) => log_warn!("frame sampling failed: {err:?}"),
                    Err(_) => log_warn!("frame encode timeout (> {:?})", ENCODE_TIMEOUT),
                }
            }
            _ = cancel_token.cancelled() => {
                log_debug!("sampling loop shutting down");
                break;
            }
        }
    }
}

async fn sample_once(stream: &SharedStream, config: &SamplerConfig) -> Result<Option<String>> {
    let frame = {
        let mut guard = match stream.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_mut() {
            Some(stream) => stream.latest_frame(),
            None => return Ok(None),
        }
    };
    let Some(frame) = frame else {
        return Ok(None);
    };

    let started = Instant::now();
    let (width, height, quality) = (config.width, config.height, config.jpeg_quality);
    let jpeg = tokio::task::spawn_blocking(move || encode_frame(&frame, width, height, quality))
        .await
        .context("frame encode worker join failed")??;
    log_debug!(
        "encoded {} byte frame in {}ms",
        jpeg.len(),
        started.elapsed().as_millis()
    );

    Ok(Some(to_data_url(&jpeg)))
}
