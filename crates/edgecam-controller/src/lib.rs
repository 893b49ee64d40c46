//! Camera ownership, capture pipeline and device-local configuration.

mod ffmpeg;

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edgecam_types::{
    vision::{AnnotatedImage, ImageFrame},
    EdgecamError, Result,
};
use edgecam_vision::ImageAnnotator;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

pub use ffmpeg::FfmpegCamera;

/// A physical (or simulated) camera producing raw frames.
#[async_trait]
pub trait CameraDevice: Send + Sync {
    async fn open(&mut self) -> Result<()>;
    async fn read_frame(&mut self) -> Result<ImageFrame>;
    async fn release(&mut self) -> Result<()>;
    fn describe(&self) -> String;
}

/// Aggregated capture counters.
#[derive(Debug, Default, Clone)]
pub struct CaptureMetrics {
    pub successful_captures: u64,
    pub failed_captures: u64,
    pub last_capture_ms: Option<u64>,
    pub last_captured_at: Option<DateTime<Utc>>,
}

/// Device-local settings pushed through the twin channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Offset in whole hours.
    pub timezone: i32,
}

/// Owns the single camera and the file holding the latest annotated image.
pub struct CameraController {
    device: AsyncMutex<Box<dyn CameraDevice>>,
    annotator: ImageAnnotator,
    output_path: PathBuf,
    device_config: Mutex<DeviceConfig>,
    metrics: Mutex<CaptureMetrics>,
}

impl CameraController {
    pub fn new(
        device: Box<dyn CameraDevice>,
        annotator: ImageAnnotator,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            device: AsyncMutex::new(device),
            annotator,
            output_path: output_path.into(),
            device_config: Mutex::new(DeviceConfig::default()),
            metrics: Mutex::new(CaptureMetrics::default()),
        }
    }

    /// Acquire the camera handle; held until [`CameraController::release`].
    pub async fn open(&self) -> Result<()> {
        let mut device = self.device.lock().await;
        info!("Opening camera {}", device.describe());
        device.open().await
    }

    pub async fn release(&self) -> Result<()> {
        let mut device = self.device.lock().await;
        info!("Releasing camera {}", device.describe());
        device.release().await
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Grab one frame, stamp it and overwrite the well-known image file.
    ///
    /// Captures are serialised: the camera lock is held until the file is
    /// in place, so concurrent callers never observe a torn image.
    pub async fn capture(&self) -> Result<AnnotatedImage> {
        let mut device = self.device.lock().await;
        let start = Instant::now();

        let result = self.capture_locked(device.as_mut()).await;
        match &result {
            Ok(image) => self.record_success(start, image.captured_at),
            Err(err) => {
                warn!(error = %err, "Capture failed");
                self.record_failure();
            }
        }
        result
    }

    async fn capture_locked(&self, device: &mut dyn CameraDevice) -> Result<AnnotatedImage> {
        let frame = device.read_frame().await?;
        if frame.is_empty() {
            return Err(capture_error("device returned no frame"));
        }

        let stamp = self.annotator.banner_time(frame.captured_at, self.timezone());
        let image = self.annotator.annotate(&frame, stamp)?;
        let jpeg = self.annotator.encode_jpeg(&image)?;
        write_replacing(&self.output_path, &jpeg).await?;

        let (width, height) = image.dimensions();
        info!(
            width,
            height,
            bytes = jpeg.len(),
            path = %self.output_path.display(),
            "Annotated image written"
        );
        Ok(AnnotatedImage {
            width,
            height,
            jpeg,
            path: self.output_path.clone(),
            captured_at: frame.captured_at,
        })
    }

    /// Parse and apply a timezone offset; invalid input keeps the prior value.
    pub fn set_timezone(&self, raw: &str) -> Result<i32> {
        let hours: i32 = raw.trim().parse().map_err(|err| {
            warn!(raw, "Rejected timezone value");
            EdgecamError::TwinParse(format!("timezone {raw:?} is not an integer: {err}"))
        })?;
        let mut config = self
            .device_config
            .lock()
            .map_err(|_| EdgecamError::Ops("device config lock poisoned".into()))?;
        config.timezone = hours;
        info!(timezone = hours, "Timezone updated");
        Ok(hours)
    }

    pub fn timezone(&self) -> i32 {
        self.device_config
            .lock()
            .map(|config| config.timezone)
            .unwrap_or_default()
    }

    pub fn metrics(&self) -> CaptureMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }

    fn record_success(&self, start: Instant, captured_at: DateTime<Utc>) {
        if let Ok(mut guard) = self.metrics.lock() {
            guard.successful_captures += 1;
            guard.last_capture_ms = Some(start.elapsed().as_millis() as u64);
            guard.last_captured_at = Some(captured_at);
        }
    }

    fn record_failure(&self) {
        if let Ok(mut guard) = self.metrics.lock() {
            guard.failed_captures += 1;
        }
    }
}

/// Write via a sibling temp file and rename so readers never see a partial image.
async fn write_replacing(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|err| {
            capture_error(format!("cannot create output directory {:?}: {err}", parent))
        })?;
    }
    let staging = path.with_extension("jpg.partial");
    tokio::fs::write(&staging, bytes)
        .await
        .map_err(|err| capture_error(format!("cannot write image {:?}: {err}", staging)))?;
    tokio::fs::rename(&staging, path)
        .await
        .map_err(|err| capture_error(format!("cannot replace image {:?}: {err}", path)))?;
    Ok(())
}

/// Observer for a [`MockCamera`] after it has been boxed into a controller.
#[derive(Clone, Default)]
pub struct MockCameraHandle {
    reads: Arc<AtomicU64>,
    failing: Arc<AtomicBool>,
    open: Arc<AtomicBool>,
}

impl MockCameraHandle {
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Synthetic camera used for development hosts and tests.
pub struct MockCamera {
    width: u32,
    height: u32,
    handle: MockCameraHandle,
}

impl MockCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            handle: MockCameraHandle::default(),
        }
    }

    pub fn handle(&self) -> MockCameraHandle {
        self.handle.clone()
    }

    fn gradient(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push((x * 255 / self.width.max(1)) as u8);
                data.push((y * 255 / self.height.max(1)) as u8);
                data.push(96);
            }
        }
        data
    }
}

#[async_trait]
impl CameraDevice for MockCamera {
    async fn open(&mut self) -> Result<()> {
        info!("Opening mock camera {}x{}", self.width, self.height);
        self.handle.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<ImageFrame> {
        self.handle.reads.fetch_add(1, Ordering::SeqCst);
        if self.handle.failing.load(Ordering::SeqCst) {
            return Err(capture_error("mock camera returned no frame"));
        }
        Ok(ImageFrame::from_rgb(self.width, self.height, self.gradient()))
    }

    async fn release(&mut self) -> Result<()> {
        self.handle.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("mock:{}x{}", self.width, self.height)
    }
}

/// Generate an error aligned with capture semantics.
pub fn capture_error(message: impl Into<String>) -> EdgecamError {
    EdgecamError::Capture(message.into())
}
