use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{future::BoxFuture, FutureExt};
use image::DynamicImage;
use log::{info, warn};

/// Source of camera frames. Acquisition may fail or take a while.
pub trait CaptureDevice: Send + Sync + 'static {
    fn acquire(&self, width: u32, height: u32) -> BoxFuture<'static, Result<Box<dyn CaptureStream>>>;
}

/// An acquired device handle. Dropping it releases the device.
pub trait CaptureStream: Send + 'static {
    /// Most recent decoded frame, `None` while nothing is ready yet.
    fn latest_frame(&mut self) -> Option<DynamicImage>;
}

/// Stand-in used when no camera is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableDevice;

impl CaptureDevice for UnavailableDevice {
    fn acquire(&self, _width: u32, _height: u32) -> BoxFuture<'static, Result<Box<dyn CaptureStream>>> {
        async { Err(anyhow!("no capture device configured")) }.boxed()
    }
}

/// Replays the images of a directory, in name order, as a looping feed.
#[derive(Debug, Clone)]
pub struct DirectoryDevice {
    dir: PathBuf,
}

impl DirectoryDevice {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            matches!(
                ext.to_ascii_lowercase().as_str(),
                "png" | "jpg" | "jpeg" | "bmp"
            )
        })
        .unwrap_or(false)
}

fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read frame directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && is_image(&path) {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

impl CaptureDevice for DirectoryDevice {
    fn acquire(&self, width: u32, height: u32) -> BoxFuture<'static, Result<Box<dyn CaptureStream>>> {
        let dir = self.dir.clone();
        async move {
            let frames = tokio::task::spawn_blocking({
                let dir = dir.clone();
                move || list_frames(&dir)
            })
            .await
            .context("frame listing worker join failed")??;

            if frames.is_empty() {
                bail!("no image frames found in {}", dir.display());
            }

            info!(
                "Directory camera acquired: {} frames from {} ({}x{})",
                frames.len(),
                dir.display(),
                width,
                height
            );
            Ok(Box::new(DirectoryStream {
                frames,
                cursor: 0,
                dir,
            }) as Box<dyn CaptureStream>)
        }
        .boxed()
    }
}

struct DirectoryStream {
    frames: Vec<PathBuf>,
    cursor: usize,
    dir: PathBuf,
}

impl CaptureStream for DirectoryStream {
    fn latest_frame(&mut self) -> Option<DynamicImage> {
        let path = self.frames.get(self.cursor)?.clone();
        self.cursor = (self.cursor + 1) % self.frames.len();
        match image::open(&path) {
            Ok(frame) => Some(frame),
            Err(err) => {
                warn!("Skipping unreadable frame {}: {err}", path.display());
                None
            }
        }
    }
}

impl Drop for DirectoryStream {
    fn drop(&mut self) {
        info!("Directory camera released ({})", self.dir.display());
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };

    use image::{Rgb, RgbImage};

    use super::*;

    /// Counts acquisitions and releases so tests can prove handles are freed.
    #[derive(Clone, Default)]
    pub struct CountingDevice {
        pub acquired: Arc<AtomicUsize>,
        pub released: Arc<AtomicUsize>,
        pub frames_read: Arc<AtomicUsize>,
        pub fail: Arc<AtomicBool>,
    }

    impl CountingDevice {
        pub fn failing() -> Self {
            let device = Self::default();
            device.fail.store(true, Ordering::SeqCst);
            device
        }

        pub fn acquired(&self) -> usize {
            self.acquired.load(Ordering::SeqCst)
        }

        pub fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }

        pub fn live_handles(&self) -> usize {
            self.acquired() - self.released()
        }
    }

    impl CaptureDevice for CountingDevice {
        fn acquire(
            &self,
            width: u32,
            height: u32,
        ) -> BoxFuture<'static, Result<Box<dyn CaptureStream>>> {
            let device = self.clone();
            async move {
                if device.fail.load(Ordering::SeqCst) {
                    bail!("camera permission denied");
                }
                device.acquired.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(CountingStream {
                    device,
                    width,
                    height,
                }) as Box<dyn CaptureStream>)
            }
            .boxed()
        }
    }

    struct CountingStream {
        device: CountingDevice,
        width: u32,
        height: u32,
    }

    impl CaptureStream for CountingStream {
        fn latest_frame(&mut self) -> Option<DynamicImage> {
            self.device.frames_read.fetch_add(1, Ordering::SeqCst);
            Some(DynamicImage::ImageRgb8(RgbImage::from_pixel(
                self.width,
                self.height,
                Rgb([40, 90, 160]),
            )))
        }
    }

    impl Drop for CountingStream {
        fn drop(&mut self) {
            self.device.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}
