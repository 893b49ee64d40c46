use std::{fs::File, path::PathBuf, process::Stdio};

use async_trait::async_trait;
use edgecam_types::{config::CameraConfig, vision::ImageFrame, Result};
use tokio::{process::Command, time::Duration};

use crate::{capture_error, CameraDevice};

const DEFAULT_FFMPEG: &str = "ffmpeg";

/// V4L2 camera read one frame at a time through `ffmpeg`.
///
/// The device node stays open for as long as the camera is held, so the
/// descriptor is released on every exit path when the value is dropped.
pub struct FfmpegCamera {
    config: CameraConfig,
    ffmpeg_path: PathBuf,
    handle: Option<File>,
}

impl FfmpegCamera {
    pub fn new(config: CameraConfig) -> Self {
        let ffmpeg_path = config
            .ffmpeg_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG));

        Self {
            config,
            ffmpeg_path,
            handle: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn capture_args(&self) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "video4linux2".into(),
            "-video_size".into(),
            format!("{}x{}", self.config.width, self.config.height),
            "-i".into(),
            self.config.device.clone(),
            "-frames:v".into(),
            "1".into(),
            "-f".into(),
            "image2pipe".into(),
            "-vcodec".into(),
            "mjpeg".into(),
            "-".into(),
        ]
    }

    async fn run_ffmpeg(&self, args: &[String]) -> Result<Vec<u8>> {
        let mut command = Command::new(&self.ffmpeg_path);
        command
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let timeout = Duration::from_millis(self.config.capture_timeout_ms);
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| {
                capture_error(format!(
                    "ffmpeg capture timed out after {}ms",
                    self.config.capture_timeout_ms
                ))
            })?
            .map_err(|err| capture_error(format!("failed to run ffmpeg ({:?}): {err}", self.ffmpeg_path)))?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(capture_error(format!(
                "ffmpeg capture failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl CameraDevice for FfmpegCamera {
    async fn open(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let file = File::open(&self.config.device).map_err(|err| {
            capture_error(format!("camera {} unavailable: {err}", self.config.device))
        })?;
        tracing::info!(device = %self.config.device, "Camera device opened");
        self.handle = Some(file);
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<ImageFrame> {
        // A camera that was absent at startup is picked up on first use.
        self.open().await?;

        let raw = self.run_ffmpeg(&self.capture_args()).await?;
        if raw.is_empty() {
            return Err(capture_error("device returned no frame"));
        }

        let img = image::load_from_memory(&raw)
            .map_err(|err| capture_error(format!("frame decoding failed: {err}")))?;
        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();
        tracing::debug!(width, height, bytes = raw.len(), "Frame grabbed");
        Ok(ImageFrame::from_rgb(width, height, rgb.into_raw()))
    }

    async fn release(&mut self) -> Result<()> {
        if self.handle.take().is_some() {
            tracing::info!(device = %self.config.device, "Camera device released");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("ffmpeg:{}", self.config.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgecam_types::config::EdgecamConfig;

    fn camera_config(device: &str) -> CameraConfig {
        let mut config = EdgecamConfig::default().camera;
        config.device = device.into();
        config
    }

    #[tokio::test]
    async fn missing_device_is_a_capture_error() {
        let mut camera = FfmpegCamera::new(camera_config("/nonexistent/video9"));
        let err = camera.read_frame().await.expect_err("device should be missing");
        assert!(matches!(err, edgecam_types::EdgecamError::Capture(_)));
        assert!(!camera.is_open());
    }

    #[tokio::test]
    async fn handle_is_held_until_release() {
        let device = tempfile::NamedTempFile::new().expect("temp device");
        let mut camera = FfmpegCamera::new(camera_config(&device.path().to_string_lossy()));
        camera.open().await.expect("open");
        assert!(camera.is_open());
        camera.release().await.expect("release");
        assert!(!camera.is_open());
    }

    #[test]
    fn capture_args_request_single_frame() {
        let camera = FfmpegCamera::new(camera_config("/dev/video1"));
        let args = camera.capture_args();
        assert!(args.windows(2).any(|pair| pair == ["-i", "/dev/video1"]));
        assert!(args.windows(2).any(|pair| pair == ["-frames:v", "1"]));
        assert!(args.contains(&"640x480".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }
}
