use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::telemetry::TelemetryChannel;

use super::{
    device::CaptureDevice,
    loop_worker::{sampling_loop, SharedStream},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplerConfig {
    #[serde(with = "millis")]
    pub frame_interval: Duration,
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(100),
            width: 640,
            height: 480,
            jpeg_quality: 40,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

struct Worker {
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

/// Owns the camera handle for one session and the loop that samples it.
///
/// The handle lives in a shared slot so `disable` can drop it synchronously,
/// which is what releases the device on every exit path.
pub struct FrameSampler {
    device: Arc<dyn CaptureDevice>,
    channel: Arc<TelemetryChannel>,
    config: SamplerConfig,
    stream: SharedStream,
    enabled: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl FrameSampler {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        channel: Arc<TelemetryChannel>,
        config: SamplerConfig,
    ) -> Self {
        Self {
            device,
            channel,
            config,
            stream: Arc::new(Mutex::new(None)),
            enabled: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Acquire the camera and start sampling. Returns whether capture is on;
    /// acquisition failures leave the camera disabled instead of erroring.
    pub async fn enable(&self) -> bool {
        if self.is_enabled() {
            return true;
        }
        self.enabled.store(true, Ordering::SeqCst);

        let acquired = self
            .device
            .acquire(self.config.width, self.config.height)
            .await;

        let stream = match acquired {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Camera acquisition failed, continuing without video: {err:#}");
                self.enabled.store(false, Ordering::SeqCst);
                return false;
            }
        };

        // `disable` takes the worker lock before clearing the flag, so the
        // check and the store below cannot interleave with it.
        let mut worker = lock(&self.worker);
        if !self.is_enabled() {
            drop(stream);
            info!("Camera disabled during acquisition; released immediately");
            return false;
        }
        *lock(&self.stream) = Some(stream);

        if let Some(previous) = worker.take() {
            previous.cancel_token.cancel();
            previous.handle.abort();
        }
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(sampling_loop(
            self.stream.clone(),
            self.channel.clone(),
            self.enabled.clone(),
            self.config,
            cancel_token.clone(),
        ));
        *worker = Some(Worker {
            handle,
            cancel_token,
        });

        info!(
            "Camera enabled: sampling every {}ms at {}x{}",
            self.config.frame_interval.as_millis(),
            self.config.width,
            self.config.height
        );
        true
    }

    /// Stop the sampling loop but keep holding the device.
    pub fn pause(&self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.cancel_token.cancel();
            worker.handle.abort();
            info!("Camera sampling paused");
        }
    }

    /// Stop sampling and release the device. Synchronous and idempotent.
    pub fn disable(&self) {
        let mut slot = lock(&self.worker);
        let was_enabled = self.enabled.swap(false, Ordering::SeqCst);
        if let Some(worker) = slot.take() {
            worker.cancel_token.cancel();
            worker.handle.abort();
        }

        let released = lock(&self.stream).take();
        drop(slot);
        if released.is_some() || was_enabled {
            drop(released);
            info!("Camera disabled");
        }
    }
}

impl Drop for FrameSampler {
    fn drop(&mut self) {
        self.disable();
    }
}
