use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Escapes text for interpolation into a double-quoted AppleScript string
/// literal. Backslashes are replaced first so later substitutions cannot
/// double-escape their own output.
pub fn escape(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}

/// Failure raised by a script runner, carrying the interpreter's diagnostic
/// verbatim so callers can classify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    pub message: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Capability that executes one native script and yields its trimmed stdout.
/// Injected so dialog behavior is testable without real OS dialogs.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, script: &str) -> Result<String, ScriptError>;
}

/// Runs scripts through the system `osascript` interpreter.
pub struct OsascriptRunner;

#[async_trait]
impl ScriptRunner for OsascriptRunner {
    async fn run(&self, script: &str) -> Result<String, ScriptError> {
        debug!("running osascript ({} bytes)", script.len());
        let output = Command::new("osascript")
            .arg("-e")
            .arg(script)
            .output()
            .await
            .map_err(|err| ScriptError::new(format!("failed to spawn osascript: {err}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            Err(ScriptError::new(stderr))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Cancelled,
    Failed,
}

/// Classifies an interpreter diagnostic as operator cancellation or a real
/// failure. A dismissed dialog surfaces as `execution error: User canceled.
/// (-128)`; the lowercase `cancel` substring is the only marker osascript
/// exposes for it, so all matching against that text lives here.
pub fn classify_failure(diagnostic: &str) -> FailureKind {
    if diagnostic.contains("cancel") {
        FailureKind::Cancelled
    } else {
        FailureKind::Failed
    }
}
