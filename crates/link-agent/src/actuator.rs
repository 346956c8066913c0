//! Hands telephony actions to an external hook program

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use handset_link_core::{AudioRef, CallActuator, LinkError, LinkResult};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Runs `hook <action> [args...]` for each action, or just logs it
///
/// A hook that outlives `timeout` is killed and the action fails.
#[derive(Debug, Clone)]
pub struct HookActuator {
    hook: Option<PathBuf>,
    timeout: Duration,
}

impl HookActuator {
    pub fn new(hook: Option<PathBuf>, timeout: Duration) -> Self {
        Self { hook, timeout }
    }

    async fn run(&self, action: &'static str, args: &[&str]) -> LinkResult<()> {
        let Some(hook) = &self.hook else {
            info!(action, ?args, "No actuator hook configured, action logged only");
            return Ok(());
        };

        debug!(hook = %hook.display(), action, ?args, "Running actuator hook");
        let running = Command::new(hook).arg(action).args(args).kill_on_drop(true).output();
        let output = tokio::time::timeout(self.timeout, running)
            .await
            .map_err(|_| {
                warn!(hook = %hook.display(), action, timeout_ms = self.timeout.as_millis() as u64, "Actuator hook killed");
                LinkError::actuation(action, format!("hook timed out after {}ms", self.timeout.as_millis()))
            })?
            .map_err(|e| LinkError::actuation(action, format!("cannot run {}: {e}", hook.display())))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = match stderr.trim() {
            "" => format!("hook exited with {}", output.status),
            message => message.to_string(),
        };
        Err(LinkError::actuation(action, reason))
    }
}

#[async_trait]
impl CallActuator for HookActuator {
    async fn place_call(&self, number: &str) -> LinkResult<()> {
        self.run("dial", &[number]).await
    }

    async fn answer(&self) -> LinkResult<()> {
        self.run("answer", &[]).await
    }

    async fn hang_up(&self) -> LinkResult<()> {
        self.run("hangup", &[]).await
    }

    async fn send_tone(&self, digit: char) -> LinkResult<()> {
        let digit = digit.to_string();
        self.run("dtmf", &[digit.as_str()]).await
    }

    async fn play_audio(&self, audio: &AudioRef) -> LinkResult<()> {
        match &audio.url {
            Some(url) => self.run("play", &[audio.file_id.as_str(), url.as_str()]).await,
            None => self.run("play", &[audio.file_id.as_str()]).await,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_without_hook_succeeds() {
        let actuator = HookActuator::new(None, TIMEOUT);
        assert!(actuator.place_call("+15551234").await.is_ok());
        assert!(actuator.send_tone('#').await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_hook_reports_actuation_error() {
        let actuator = HookActuator::new(Some(PathBuf::from("false")), TIMEOUT);
        let err = actuator.hang_up().await.unwrap_err();
        assert!(matches!(err, LinkError::Actuation { ref action, .. } if action == "hangup"));
    }

    #[tokio::test]
    async fn test_missing_hook_reports_actuation_error() {
        let actuator = HookActuator::new(Some(PathBuf::from("/nonexistent/handset-link-hook")), TIMEOUT);
        let err = actuator.answer().await.unwrap_err();
        assert!(err.to_string().contains("cannot run"));
    }

    #[tokio::test]
    async fn test_succeeding_hook() {
        let actuator = HookActuator::new(Some(PathBuf::from("true")), TIMEOUT);
        let audio = AudioRef {
            file_id: "42".to_string(),
            url: None,
        };
        assert!(actuator.play_audio(&audio).await.is_ok());
    }

    #[tokio::test]
    async fn test_stuck_hook_times_out() {
        let dir = TempDir::new().unwrap();
        let hook = dir.path().join("stuck-hook");
        std::fs::write(&hook, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();

        let actuator = HookActuator::new(Some(hook), Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = actuator.answer().await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(err, LinkError::Actuation { ref action, .. } if action == "answer"));
        assert!(err.to_string().contains("timed out after 200ms"), "{err}");
    }
}
