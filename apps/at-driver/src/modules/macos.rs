use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use at_driver_proto::Capabilities;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CommandError, CommandModule, UNKNOWN_CAPABILITY};
use crate::applescript::{render_script, run_script, Osascript, ScriptRunner};
use crate::keys::macos::parse_code_points;
use crate::keys::KeyCombination;
use crate::platform::Platform;

/// Name clients already match on; keep the lowercase "o".
const AT_NAME: &str = "Voiceover";
const VERSION_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// VoiceOver driven through System Events.
pub struct MacOsModule<R = Osascript> {
    runner: R,
    version_command: Vec<String>,
}

impl Default for MacOsModule<Osascript> {
    fn default() -> Self {
        Self::new(Osascript::default())
    }
}

impl<R: ScriptRunner> MacOsModule<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            version_command: vec!["sw_vers".into(), "-productVersion".into()],
        }
    }

    /// Replace the command whose stdout reports the VoiceOver version.
    pub fn with_version_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.version_command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    // VoiceOver ships with the OS, so the macOS product version identifies it.
    async fn query_version(&self) -> Result<String, String> {
        let (program, args) = self
            .version_command
            .split_first()
            .ok_or_else(|| "no version command configured".to_string())?;
        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);
        let output = run_with_timeout(cmd, VERSION_QUERY_TIMEOUT, "version query").await?;
        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if version.is_empty() {
            return Err("version query printed nothing".to_string());
        }
        Ok(version)
    }
}

#[async_trait]
impl<R: ScriptRunner> CommandModule for MacOsModule<R> {
    fn platform(&self) -> Platform {
        Platform::MacOs
    }

    async fn capabilities(&self) -> Capabilities {
        let at_version = self.query_version().await.unwrap_or_else(|err| {
            warn!(error = %err, "could not determine VoiceOver version");
            UNKNOWN_CAPABILITY.to_string()
        });
        Capabilities {
            at_name: AT_NAME.to_string(),
            at_version,
            platform_name: Platform::MacOs.wire_name().to_string(),
        }
    }

    async fn press_keys(&self, keys: &KeyCombination) -> Result<(), CommandError> {
        let command = parse_code_points(keys)?;
        let script = render_script(&command)?;
        debug!(script = script.source(), "running key script");
        run_script(&self.runner, &script).await?;
        Ok(())
    }
}

/// Run a subprocess, converting an expired deadline into an error. The
/// child is killed when the timed-out future drops it.
async fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    description: &str,
) -> Result<Output, String> {
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(io_err)) => Err(format!("{description} failed: {io_err}")),
        Err(_elapsed) => Err(format!(
            "{description} timed out after {}s",
            timeout.as_secs()
        )),
    }
}
