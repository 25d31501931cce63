//! Camera client - snapshot capture and settings push over HTTP

use crate::domain::CameraSettings;
use crate::error::CollaboratorError;
use crate::infra::config::CameraConfig;
use crate::io::http::{build_client, Endpoint};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A JPEG captured for one item
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub path: PathBuf,
    pub bytes: Bytes,
}

#[async_trait]
pub trait Camera: Send + Sync {
    /// Capture one frame and persist it under a name derived from `tag`
    async fn capture(&self, camera_id: &str, tag: &str) -> Result<CapturedImage, CollaboratorError>;
    async fn apply_settings(&self, settings: &CameraSettings) -> Result<(), CollaboratorError>;
}

pub struct HttpCamera {
    snapshot: Endpoint,
    settings: Endpoint,
    captures_dir: PathBuf,
    client: reqwest::Client,
}

impl HttpCamera {
    pub fn new(config: &CameraConfig) -> Result<Self, CollaboratorError> {
        let client = build_client(Duration::from_millis(config.timeout_ms))?;
        Ok(Self {
            snapshot: Endpoint::parse(&config.snapshot_url),
            settings: Endpoint::parse(&config.settings_url),
            captures_dir: PathBuf::from(&config.captures_dir),
            client,
        })
    }

    fn image_path(&self, camera_id: &str, tag: &str) -> PathBuf {
        self.captures_dir.join(format!("{camera_id}_{tag}.jpg"))
    }
}

#[async_trait]
impl Camera for HttpCamera {
    async fn capture(&self, camera_id: &str, tag: &str) -> Result<CapturedImage, CollaboratorError> {
        if !self.snapshot.is_configured() {
            return Err(CollaboratorError::Disabled("camera snapshot url"));
        }
        let start = Instant::now();

        let request = self.snapshot.authorize(self.client.get(&self.snapshot.url));
        let response = request.send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(CollaboratorError::Unexpected("empty snapshot".to_string()));
        }

        tokio::fs::create_dir_all(&self.captures_dir).await?;
        let path = self.image_path(camera_id, tag);
        tokio::fs::write(&path, &bytes).await?;

        info!(
            camera = %camera_id,
            path = %path.display(),
            bytes = %bytes.len(),
            latency_ms = %start.elapsed().as_millis(),
            "camera_captured"
        );
        Ok(CapturedImage { path, bytes })
    }

    async fn apply_settings(&self, settings: &CameraSettings) -> Result<(), CollaboratorError> {
        if !self.settings.is_configured() {
            debug!(profile = %settings.name, "camera_settings_url_not_configured");
            return Ok(());
        }

        let request = self.settings.authorize(self.client.post(&self.settings.url)).json(settings);
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(status = %status.as_u16(), profile = %settings.name, "camera_settings_rejected");
            return Err(CollaboratorError::Unexpected(format!("settings push returned {status}")));
        }

        info!(
            profile = %settings.name,
            exposure = %settings.exposure,
            gain = %settings.gain,
            "camera_settings_applied"
        );
        Ok(())
    }
}

/// Used when `camera.enabled = false`
pub struct NullCamera;

#[async_trait]
impl Camera for NullCamera {
    async fn capture(&self, _camera_id: &str, _tag: &str) -> Result<CapturedImage, CollaboratorError> {
        Err(CollaboratorError::Disabled("camera"))
    }

    async fn apply_settings(&self, settings: &CameraSettings) -> Result<(), CollaboratorError> {
        debug!(profile = %settings.name, "camera_disabled_settings_skipped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_path() {
        let config = CameraConfig { captures_dir: "/tmp/caps".to_string(), ..Default::default() };
        let camera = HttpCamera::new(&config).unwrap();
        assert_eq!(camera.image_path("rpi", "abc"), PathBuf::from("/tmp/caps/rpi_abc.jpg"));
    }

    #[tokio::test]
    async fn test_unconfigured_camera() {
        let camera = HttpCamera::new(&CameraConfig::default()).unwrap();
        let err = camera.capture("rpi", "abc").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Disabled(_)));

        // Settings push without a URL is a no-op
        assert!(camera.apply_settings(&CameraSettings::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_null_camera() {
        assert!(NullCamera.capture("rpi", "x").await.is_err());
        assert!(NullCamera.apply_settings(&CameraSettings::default()).await.is_ok());
    }
}
