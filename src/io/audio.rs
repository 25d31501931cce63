//! Operator audio: event sounds and spoken summaries
//!
//! Playback is interruptible: starting a new sound or narration kills
//! whatever is still playing.

use crate::error::CollaboratorError;
use crate::infra::config::AudioConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Announcer: Send + Sync {
    /// Play the sound mapped to a named event (e.g. "batch_complete")
    async fn play_event(&self, name: &str) -> Result<(), CollaboratorError>;
    /// Speak free text
    async fn narrate(&self, text: &str) -> Result<(), CollaboratorError>;
}

/// Plays files with `aplay` / `mpg123` and speaks through a TTS command
pub struct CommandAnnouncer {
    dir: PathBuf,
    events: HashMap<String, String>,
    tts_command: Option<String>,
    /// Cancels the playback in progress
    current: Mutex<Option<oneshot::Sender<()>>>,
}

impl CommandAnnouncer {
    pub fn new(config: &AudioConfig) -> Self {
        info!(
            dir = %config.dir,
            events = %config.events.len(),
            tts = %config.tts_command.as_deref().unwrap_or("none"),
            "announcer_initialized"
        );
        Self {
            dir: PathBuf::from(&config.dir),
            events: config.events.clone(),
            tts_command: config.tts_command.clone(),
            current: Mutex::new(None),
        }
    }

    fn player_command(path: &Path) -> Command {
        let is_mp3 =
            path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("mp3"));
        let mut command = Command::new(if is_mp3 { "mpg123" } else { "aplay" });
        command.arg("-q").arg(path);
        command
    }

    async fn play(&self, mut command: Command, what: &str) -> Result<(), CollaboratorError> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let previous = self.current.lock().replace(cancel_tx);
        if let Some(previous) = previous {
            let _ = previous.send(());
        }

        command.kill_on_drop(true).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        let mut child = command.spawn()?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if !status.success() {
                    return Err(CollaboratorError::Unexpected(format!("{what} exited with {status}")));
                }
                debug!(what = %what, "audio_finished");
                Ok(())
            }
            _ = cancel_rx => {
                let _ = child.kill().await;
                debug!(what = %what, "audio_interrupted");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Announcer for CommandAnnouncer {
    async fn play_event(&self, name: &str) -> Result<(), CollaboratorError> {
        let Some(file) = self.events.get(name) else {
            debug!(event = %name, "audio_event_unmapped");
            return Ok(());
        };
        let path = self.dir.join(file);
        if !path.exists() {
            warn!(event = %name, path = %path.display(), "audio_file_missing");
            return Err(CollaboratorError::Unexpected(format!("missing {}", path.display())));
        }
        info!(event = %name, "audio_play");
        self.play(Self::player_command(&path), name).await
    }

    async fn narrate(&self, text: &str) -> Result<(), CollaboratorError> {
        let Some(tts) = &self.tts_command else {
            return Err(CollaboratorError::Disabled("tts"));
        };
        let mut parts = tts.split_whitespace();
        let Some(program) = parts.next() else {
            return Err(CollaboratorError::Disabled("tts"));
        };
        let mut command = Command::new(program);
        command.args(parts).arg(text);
        info!(chars = %text.len(), "audio_narrate");
        self.play(command, "narration").await
    }
}

/// Used when `audio.enabled = false`
pub struct NullAnnouncer;

#[async_trait]
impl Announcer for NullAnnouncer {
    async fn play_event(&self, name: &str) -> Result<(), CollaboratorError> {
        debug!(event = %name, "audio_disabled");
        Ok(())
    }

    async fn narrate(&self, _text: &str) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_selection() {
        let mp3 = CommandAnnouncer::player_command(Path::new("a/batch_complete.MP3"));
        assert_eq!(mp3.as_std().get_program(), "mpg123");
        let wav = CommandAnnouncer::player_command(Path::new("a/stall.wav"));
        assert_eq!(wav.as_std().get_program(), "aplay");
    }

    #[tokio::test]
    async fn test_unmapped_event_is_quiet() {
        let announcer = CommandAnnouncer::new(&AudioConfig::default());
        assert!(announcer.play_event("nothing_here").await.is_ok());
        assert!(matches!(
            announcer.narrate("hello").await,
            Err(CollaboratorError::Disabled("tts"))
        ));
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = AudioConfig {
            enabled: true,
            dir: dir.path().to_string_lossy().into_owned(),
            events: HashMap::from([("batch_complete".to_string(), "done.wav".to_string())]),
            tts_command: None,
        };
        let announcer = CommandAnnouncer::new(&config);
        assert!(announcer.play_event("batch_complete").await.is_err());
    }
}
