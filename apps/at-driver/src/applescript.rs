//! Render key commands to AppleScript and run them through `osascript`.
//!
//! KeyCombination -> KeyCommand -> Script -> ScriptRunner

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::keys::macos::{key_code, KeyCommand};
use crate::keys::KeyError;

pub const APPLESCRIPT_RETRY: u32 = 3;
pub const APPLESCRIPT_TIMEOUT_SECS: u64 = 5;
pub const APPLESCRIPT_TIMEOUT_ERROR: &str = "AppleEvent timed out";

const OSASCRIPT_PATH: &str = "/usr/bin/osascript";

/// Rendered AppleScript source. Never modified after rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    source: String,
}

impl Script {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to start script interpreter: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("script interpreter has no stdin")]
    MissingStdin,
    #[error("script interpreter i/o failed: {0}")]
    Io(#[source] std::io::Error),
    #[error("script failed with {exit}: {stderr}")]
    Failed { exit: String, stderr: String },
    #[error("script interpreter did not finish within {0:?}")]
    Unresponsive(Duration),
}

impl ScriptError {
    /// Whether this is the System Events timeout worth another attempt.
    pub fn is_transient(&self) -> bool {
        self.to_string().contains(APPLESCRIPT_TIMEOUT_ERROR)
    }
}

/// Render a key command as nested key-down/key-up pairs.
///
/// Each key goes down one level deeper than the previous and comes back up
/// in reverse order, so combinations register as held chords rather than
/// a single `key code` with a `using` clause.
pub fn render_script(command: &KeyCommand) -> Result<Script, KeyError> {
    command.validate()?;
    let codes = command
        .press_order()
        .map(|name| key_code(name).ok_or_else(|| KeyError::UnknownCode(name.to_string())))
        .collect::<Result<Vec<_>, _>>()?;

    let mut lines = vec![
        format!("with timeout of {APPLESCRIPT_TIMEOUT_SECS} seconds"),
        format!("{}tell application \"System Events\"", indent(1)),
    ];
    for (depth, code) in codes.iter().enumerate() {
        lines.push(format!("{}key down {code}", indent(depth + 2)));
    }
    for (depth, code) in codes.iter().enumerate().rev() {
        lines.push(format!("{}key up {code}", indent(depth + 2)));
    }
    lines.push(format!("{}end tell", indent(1)));
    lines.push("end timeout".to_string());

    Ok(Script::new(lines.join("\n")))
}

fn indent(level: usize) -> String {
    " ".repeat(level * 4)
}

/// Executes a rendered script once, returning its standard output.
#[async_trait]
pub trait ScriptRunner: Send + Sync + 'static {
    async fn exec(&self, script: &Script) -> Result<Option<String>, ScriptError>;
}

/// Runs scripts by piping them into an `osascript` child process.
#[derive(Debug, Clone)]
pub struct Osascript {
    program: PathBuf,
    args: Vec<String>,
    guard: Duration,
}

impl Default for Osascript {
    fn default() -> Self {
        Self {
            program: PathBuf::from(OSASCRIPT_PATH),
            args: Vec::new(),
            guard: Duration::from_secs(APPLESCRIPT_TIMEOUT_SECS + 5),
        }
    }
}

impl Osascript {
    /// Use a different interpreter command, e.g. for a sandboxed host.
    pub fn with_command<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn guard(mut self, guard: Duration) -> Self {
        self.guard = guard;
        self
    }
}

#[async_trait]
impl ScriptRunner for Osascript {
    async fn exec(&self, script: &Script) -> Result<Option<String>, ScriptError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ScriptError::Spawn)?;

        let mut stdin = child.stdin.take().ok_or(ScriptError::MissingStdin)?;
        match stdin.write_all(script.source().as_bytes()).await {
            Ok(()) => {}
            // The interpreter may exit before reading; its status tells the story.
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!("script interpreter closed stdin early");
            }
            Err(err) => return Err(ScriptError::Io(err)),
        }
        drop(stdin);

        let output = tokio::time::timeout(self.guard, child.wait_with_output())
            .await
            .map_err(|_| ScriptError::Unresponsive(self.guard))?
            .map_err(ScriptError::Io)?;

        if !output.status.success() {
            return Err(ScriptError::Failed {
                exit: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok((!stdout.is_empty()).then_some(stdout))
    }
}

/// Retry `action` while it fails with the AppleEvent timeout, up to
/// [`APPLESCRIPT_RETRY`] attempts in total. Other errors return at once;
/// the last timeout error is returned once attempts run out.
pub async fn retry_on_timeout<T, F, Fut>(mut action: F) -> Result<T, ScriptError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ScriptError>>,
{
    let mut attempt = 1;
    loop {
        match action().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < APPLESCRIPT_RETRY => {
                warn!(attempt, error = %err, "script timed out; retrying");
                counter!("at_driver_script_retries_total", 1);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

pub async fn run_script<R>(runner: &R, script: &Script) -> Result<Option<String>, ScriptError>
where
    R: ScriptRunner + ?Sized,
{
    retry_on_timeout(|| runner.exec(script)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn timed_out() -> ScriptError {
        ScriptError::Failed {
            exit: "exit status: 1".into(),
            stderr: "execution error: System Events got an error: AppleEvent timed out. (-1712)"
                .into(),
        }
    }

    #[test_timeout::timeout]
    fn renders_space() {
        let script = render_script(&KeyCommand::new(["space"], Vec::<String>::new())).unwrap();
        assert_eq!(
            script.source(),
            "with timeout of 5 seconds\n\
             \x20   tell application \"System Events\"\n\
             \x20       key down 49\n\
             \x20       key up 49\n\
             \x20   end tell\n\
             end timeout"
        );
    }

    #[test_timeout::timeout]
    fn renders_option_a_as_nested_chord() {
        let script = render_script(&KeyCommand::new(["a"], ["option"])).unwrap();
        assert_eq!(
            script.source(),
            "with timeout of 5 seconds\n\
             \x20   tell application \"System Events\"\n\
             \x20       key down 58\n\
             \x20           key down 0\n\
             \x20           key up 0\n\
             \x20       key up 58\n\
             \x20   end tell\n\
             end timeout"
        );
    }

    #[test_timeout::timeout]
    fn renders_modifiers_before_keys() {
        let script =
            render_script(&KeyCommand::new(["b"], ["command", "option", "shift"])).unwrap();
        let steps: Vec<&str> = script
            .source()
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with("key"))
            .collect();
        assert_eq!(
            steps,
            [
                "key down 55",
                "key down 58",
                "key down 57",
                "key down 11",
                "key up 11",
                "key up 57",
                "key up 58",
                "key up 55",
            ]
        );
    }

    #[test_timeout::timeout]
    fn rendering_is_deterministic() {
        let command = KeyCommand::new(["arrowDown"], ["control", "option"]);
        assert_eq!(render_script(&command).unwrap(), render_script(&command).unwrap());
    }

    #[test_timeout::timeout]
    fn refuses_to_render_unvalidated_names() {
        assert_eq!(
            render_script(&KeyCommand::new(["space"], ["super"])),
            Err(KeyError::UnknownModifier("super".into()))
        );
        assert_eq!(
            render_script(&KeyCommand::new(["launch"], Vec::<String>::new())),
            Err(KeyError::UnknownCode("launch".into()))
        );
    }

    #[test_timeout::timeout]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_on_timeout(|| async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(timed_out())
            } else {
                Ok("retried")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "retried");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test_timeout::timeout]
    async fn does_not_retry_other_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_on_timeout(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ScriptError::MissingStdin)
        })
        .await;
        assert!(matches!(result, Err(ScriptError::MissingStdin)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::timeout]
    async fn surfaces_last_timeout_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_on_timeout(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(timed_out())
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), APPLESCRIPT_RETRY);
    }

    #[cfg(unix)]
    #[test_timeout::timeout]
    async fn exec_returns_interpreter_stdout() {
        let runner = Osascript::with_command("cat", Vec::<String>::new());
        let output = runner.exec(&Script::new("return \"hello\"")).await.unwrap();
        assert_eq!(output.as_deref(), Some("return \"hello\""));
    }

    #[cfg(unix)]
    #[test_timeout::timeout]
    async fn exec_normalizes_empty_output() {
        let runner = Osascript::with_command("sh", ["-c", "cat > /dev/null"]);
        assert_eq!(runner.exec(&Script::new("noop")).await.unwrap(), None);
    }

    #[cfg(unix)]
    #[test_timeout::timeout]
    async fn exec_reports_stderr_on_failure() {
        let runner = Osascript::with_command(
            "sh",
            ["-c", "cat > /dev/null; echo 'AppleEvent timed out.' >&2; exit 1"],
        );
        let err = run_script(&runner, &Script::new("noop")).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[cfg(unix)]
    #[test_timeout::timeout]
    async fn exec_kills_unresponsive_interpreter() {
        let runner = Osascript::with_command("sleep", ["30"]).guard(Duration::from_millis(200));
        let err = runner.exec(&Script::new("noop")).await.unwrap_err();
        assert!(matches!(err, ScriptError::Unresponsive(_)));
    }

    #[cfg(unix)]
    #[test_timeout::timeout]
    async fn exec_reports_missing_interpreter() {
        let runner = Osascript::with_command("/nonexistent/osascript", Vec::<String>::new());
        assert!(matches!(
            runner.exec(&Script::new("noop")).await,
            Err(ScriptError::Spawn(_))
        ));
    }
}
