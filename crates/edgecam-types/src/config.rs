use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{EdgecamError, Result};

pub const ENV_CONNECTION_STRING: &str = "CONNECTION_STRING";
pub const ENV_BLOB_ACCOUNT_NAME: &str = "BLOB_ACCOUNT_NAME";
pub const ENV_BLOB_ACCOUNT_KEY: &str = "BLOB_ACCOUNT_KEY";

/// Height in pixels of one unscaled banner glyph.
pub const GLYPH_HEIGHT: u32 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// V4L2 device node, e.g. `/dev/video0`.
    pub device: String,
    pub ffmpeg_path: Option<String>,
    pub width: u32,
    pub height: u32,
    pub capture_timeout_ms: u64,
    /// Well-known location of the latest annotated image.
    pub output_path: String,
    #[serde(default)]
    pub mock: bool,
}

/// Which clock the timestamp banner is rendered with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BannerClock {
    /// Host local time.
    #[default]
    Local,
    /// UTC shifted by the twin-configured timezone.
    Device,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotatorConfig {
    pub banner_height: u32,
    /// Left edge and baseline of the timestamp within the banner.
    pub text_origin: (u32, u32),
    pub font_scale: u32,
    pub jpeg_quality: u8,
    #[serde(default)]
    pub clock: BannerClock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub static_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub account_name: Option<String>,
    #[serde(default)]
    pub account_key: Option<String>,
    pub container: String,
    pub blob_name: String,
    /// URL reported back to HTTP callers after a successful upload.
    pub public_url: String,
    pub endpoint_suffix: String,
    pub upload_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub connection_string: Option<String>,
    pub retry_interval_secs: u64,
    pub retry_limit_secs: u64,
    pub message_timeout_ms: u64,
    pub sas_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsConfig {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgecamConfig {
    pub camera: CameraConfig,
    pub annotator: AnnotatorConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub broker: BrokerConfig,
    pub ops: OpsConfig,
}

impl Default for EdgecamConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                device: "/dev/video0".into(),
                ffmpeg_path: None,
                width: 640,
                height: 480,
                capture_timeout_ms: 10_000,
                output_path: "static/image.jpg".into(),
                mock: false,
            },
            annotator: AnnotatorConfig {
                banner_height: 50,
                text_origin: (10, 25),
                font_scale: 2,
                jpeg_quality: 90,
                clock: BannerClock::Local,
            },
            server: ServerConfig {
                bind_addr: "0.0.0.0".into(),
                port: 1337,
                request_timeout_secs: 90,
                static_dir: "static".into(),
            },
            storage: StorageConfig {
                account_name: None,
                account_key: None,
                container: "webcam".into(),
                blob_name: "picture".into(),
                public_url: "https://portalvhdskb2vtjmyg3mg.blob.core.windows.net/webcam/picture"
                    .into(),
                endpoint_suffix: "core.windows.net".into(),
                upload_timeout_secs: 60,
            },
            broker: BrokerConfig {
                connection_string: None,
                retry_interval_secs: 5,
                retry_limit_secs: 100,
                message_timeout_ms: 10_000,
                sas_ttl_secs: 3600,
            },
            ops: OpsConfig {
                log_level: "info".into(),
            },
        }
    }
}

impl EdgecamConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|err| {
            EdgecamError::Configuration(format!(
                "unable to read config file {}: {err}",
                path_ref.display()
            ))
        })?;
        toml::from_str(&contents).map_err(|err| {
            EdgecamError::Configuration(format!(
                "failed to parse config file {}: {err}",
                path_ref.display()
            ))
        })
    }

    /// Overlay secrets from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay secrets from an arbitrary lookup; blank values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(value) = read(ENV_CONNECTION_STRING) {
            self.broker.connection_string = Some(value);
        }
        if let Some(value) = read(ENV_BLOB_ACCOUNT_NAME) {
            self.storage.account_name = Some(value);
        }
        if let Some(value) = read(ENV_BLOB_ACCOUNT_KEY) {
            self.storage.account_key = Some(value);
        }
    }

    /// Names of required settings that are still absent.
    pub fn missing_settings(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.broker.connection_string.is_none() {
            missing.push(ENV_CONNECTION_STRING);
        }
        if self.storage.account_name.is_none() {
            missing.push(ENV_BLOB_ACCOUNT_NAME);
        }
        if self.storage.account_key.is_none() {
            missing.push(ENV_BLOB_ACCOUNT_KEY);
        }
        missing
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(EdgecamError::Configuration(
                "camera.width and camera.height must be greater than zero".into(),
            ));
        }
        if self.camera.output_path.trim().is_empty() {
            return Err(EdgecamError::Configuration(
                "camera.output_path must not be empty".into(),
            ));
        }
        if self.annotator.font_scale == 0 {
            return Err(EdgecamError::Configuration(
                "annotator.font_scale must be greater than zero".into(),
            ));
        }
        if self.annotator.banner_height < GLYPH_HEIGHT * self.annotator.font_scale {
            return Err(EdgecamError::Configuration(
                "annotator.banner_height must fit the scaled glyph height".into(),
            ));
        }
        if !(1..=100).contains(&self.annotator.jpeg_quality) {
            return Err(EdgecamError::Configuration(
                "annotator.jpeg_quality must be between 1 and 100".into(),
            ));
        }
        if self.server.port == 0 {
            return Err(EdgecamError::Configuration(
                "server.port must be a valid port (>0)".into(),
            ));
        }
        // A request covers one capture plus one upload.
        let request_ms = self.server.request_timeout_secs.saturating_mul(1000);
        let work_ms = self
            .camera
            .capture_timeout_ms
            .saturating_add(self.storage.upload_timeout_secs.saturating_mul(1000));
        if request_ms < work_ms {
            return Err(EdgecamError::Configuration(format!(
                "server.request_timeout_secs ({}s) must cover camera.capture_timeout_ms plus storage.upload_timeout_secs ({work_ms}ms)",
                self.server.request_timeout_secs
            )));
        }
        if self.broker.retry_interval_secs == 0 {
            return Err(EdgecamError::Configuration(
                "broker.retry_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    #[test]
    fn load_edgecam_config_from_file() {
        let temp_path = std::env::temp_dir().join("edgecam-config-test.toml");
        let mut config = EdgecamConfig::default();
        config.camera.device = "/dev/video2".into();
        config.server.port = 8080;
        config.annotator.clock = BannerClock::Device;

        let doc = toml::to_string(&config).expect("serialize config");
        fs::write(&temp_path, doc).expect("write temp config");

        let loaded = EdgecamConfig::from_file(&temp_path).expect("load config");
        assert_eq!(loaded.camera.device, "/dev/video2");
        assert_eq!(loaded.server.port, 8080);
        assert_eq!(loaded.annotator.clock, BannerClock::Device);
        assert_eq!(loaded.storage.container, "webcam");
        assert!(loaded.broker.connection_string.is_none());
        fs::remove_file(&temp_path).expect("cleanup temp config");
    }

    #[test]
    fn validate_configuration_rules() {
        let mut config = EdgecamConfig::default();
        assert!(config.validate().is_ok());

        config.camera.width = 0;
        assert!(config.validate().is_err());
        config.camera.width = 640;
        config.annotator.font_scale = 0;
        assert!(config.validate().is_err());
        config.annotator.font_scale = 8;
        assert!(config.validate().is_err());
        config.annotator.font_scale = 2;
        config.annotator.jpeg_quality = 0;
        assert!(config.validate().is_err());
        config.annotator.jpeg_quality = 90;
        config.server.port = 0;
        assert!(config.validate().is_err());
        config.server.port = 1337;
        config.server.request_timeout_secs = 30;
        assert!(config.validate().is_err());
        config.server.request_timeout_secs = 90;
        config.broker.retry_interval_secs = 0;
        assert!(config.validate().is_err());
        config.broker.retry_interval_secs = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn environment_overrides_secrets() {
        let env: HashMap<&str, &str> = [
            (ENV_CONNECTION_STRING, "HostName=hub;DeviceId=cam;SharedAccessKey=a2V5"),
            (ENV_BLOB_ACCOUNT_NAME, "camstore"),
            (ENV_BLOB_ACCOUNT_KEY, "   "),
        ]
        .into_iter()
        .collect();

        let mut config = EdgecamConfig::default();
        assert_eq!(config.missing_settings().len(), 3);

        config.apply_env_from(|key| env.get(key).map(|value| value.to_string()));
        assert_eq!(config.storage.account_name.as_deref(), Some("camstore"));
        assert!(config.broker.connection_string.is_some());
        assert_eq!(config.missing_settings(), vec![ENV_BLOB_ACCOUNT_KEY]);
    }
}
