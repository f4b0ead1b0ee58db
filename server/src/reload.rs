//! Tells the inference consumer to re-read the published models.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// No reload command configured.
    Skipped,
    Acknowledged,
    /// The command exited with a failure status.
    Failed(Option<i32>),
    /// The command did not finish within the grace period and was killed.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ReloadHook {
    command: Option<Vec<String>>,
    grace: Duration,
}

impl ReloadHook {
    pub fn new(command: Option<Vec<String>>, grace: Duration) -> Self {
        Self { command, grace }
    }

    /// Run the reload command with `TTP_MODEL_DIR` set to `published`.
    ///
    /// A failed reload never rolls back the publication; the consumer keeps
    /// serving whatever it loaded last and picks up the new set on restart.
    pub async fn signal(&self, published: &Path) -> ReloadOutcome {
        let Some((program, args)) = self.command.as_ref().and_then(|c| c.split_first()) else {
            return ReloadOutcome::Skipped;
        };

        let mut child = match Command::new(program)
            .args(args)
            .env("TTP_MODEL_DIR", published)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to start reload command {:?}: {}", program, e);
                return ReloadOutcome::Failed(None);
            }
        };

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                info!("Inference consumer acknowledged reload");
                ReloadOutcome::Acknowledged
            }
            Ok(Ok(status)) => {
                warn!("Reload command exited with {}", status);
                ReloadOutcome::Failed(status.code())
            }
            Ok(Err(e)) => {
                warn!("Reload command failed: {}", e);
                ReloadOutcome::Failed(None)
            }
            Err(_) => {
                warn!(
                    "Reload not acknowledged within {:.0}s; continuing",
                    self.grace.as_secs_f64()
                );
                let _ = child.kill().await;
                ReloadOutcome::TimedOut
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn hook(cmd: &[&str], grace_ms: u64) -> ReloadHook {
        ReloadHook::new(
            Some(cmd.iter().map(|s| s.to_string()).collect()),
            Duration::from_millis(grace_ms),
        )
    }

    #[tokio::test]
    async fn test_no_command_is_skipped() {
        let hook = ReloadHook::new(None, Duration::from_secs(1));
        assert_eq!(hook.signal(Path::new("/tmp")).await, ReloadOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_success_and_failure() {
        assert_eq!(
            hook(&["true"], 5_000).signal(Path::new("/tmp")).await,
            ReloadOutcome::Acknowledged
        );
        assert_eq!(
            hook(&["false"], 5_000).signal(Path::new("/tmp")).await,
            ReloadOutcome::Failed(Some(1))
        );
    }

    #[tokio::test]
    async fn test_slow_consumer_times_out() {
        assert_eq!(
            hook(&["sleep", "5"], 50).signal(Path::new("/tmp")).await,
            ReloadOutcome::TimedOut
        );
    }
}
