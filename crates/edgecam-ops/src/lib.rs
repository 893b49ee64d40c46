//! Operational helpers: logging setup and filesystem preparation.

use std::path::{Path, PathBuf};

use edgecam_types::{config::OpsConfig, EdgecamError, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set and parseable; otherwise the configured level is
/// used, then `info`.
pub fn init_tracing(config: &OpsConfig) -> Result<()> {
    let filter = build_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(), config)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|err| ops_error(format!("tracing init error: {err}")))?;
    Ok(())
}

fn build_filter(from_env: Option<&str>, config: &OpsConfig) -> Result<EnvFilter> {
    from_env
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .map(Ok)
        .unwrap_or_else(|| EnvFilter::try_new(&config.log_level))
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| ops_error(format!("failed to create log filter: {err}")))
}

/// Create the directory that will hold `file`, returning it.
pub fn ensure_parent_dir(file: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = file
        .as_ref()
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)
        .map_err(|err| ops_error(format!("failed to create {}: {err}", dir.display())))?;
    info!("Output directory ready at {:?}", dir);
    Ok(dir)
}

pub fn ops_error(message: impl Into<String>) -> EdgecamError {
    EdgecamError::Ops(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(level: &str) -> OpsConfig {
        OpsConfig {
            log_level: level.into(),
        }
    }

    #[test]
    fn env_directives_take_precedence() {
        let filter = build_filter(Some("edgecam=trace"), &ops("warn")).unwrap();
        assert_eq!(filter.to_string(), "edgecam=trace");
    }

    #[test]
    fn config_level_used_without_env() {
        let filter = build_filter(None, &ops("debug")).unwrap();
        assert_eq!(filter.to_string(), "debug");
        let filter = build_filter(Some("  "), &ops("warn")).unwrap();
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn creates_parent_of_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("static").join("image.jpg");
        let created = ensure_parent_dir(&target).unwrap();
        assert!(created.is_dir());
        assert_eq!(created, dir.path().join("static"));
    }
}
