use std::sync::Arc;

use tracing::debug;

use crate::applescript::{self, classify_failure, FailureKind, ScriptError, ScriptRunner};
use crate::config::DialogConfig;

/// A typed dialog to present to the human operator.
#[derive(Debug, Clone, PartialEq)]
pub enum DialogRequest {
    TextInput {
        question: String,
        context: Option<String>,
        timeout_secs: Option<i64>,
        default_value: Option<String>,
    },
    MultipleChoice {
        question: String,
        context: Option<String>,
        timeout_secs: Option<i64>,
        choices: Vec<String>,
        default_choice_index: Option<usize>,
    },
    Confirm {
        question: String,
        context: Option<String>,
        timeout_secs: Option<i64>,
        default_answer: bool,
    },
    Info {
        question: String,
        context: Option<String>,
        timeout_secs: Option<i64>,
    },
}

impl DialogRequest {
    fn timeout_secs(&self) -> Option<i64> {
        match self {
            Self::TextInput { timeout_secs, .. }
            | Self::MultipleChoice { timeout_secs, .. }
            | Self::Confirm { timeout_secs, .. }
            | Self::Info { timeout_secs, .. } => *timeout_secs,
        }
    }
}

/// A notification to post without waiting for operator interaction.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub message: String,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub sound: bool,
}

/// What the human did with a dialog.
#[derive(Debug, Clone, PartialEq)]
pub enum DialogOutcome {
    Answered(DialogAnswer),
    Cancelled,
    Failed(String),
}

/// Per-variant payload of an answered dialog.
#[derive(Debug, Clone, PartialEq)]
pub enum DialogAnswer {
    Text(String),
    /// Position of the picked label in the request's choices.
    ChoiceIndex(usize),
    /// Picker output that matched none of the offered choices.
    ChoiceLabel(String),
    Confirmed(bool),
    Acknowledged,
}

/// The list picker prints `false` when dismissed, so a choice whose label is
/// literally "false" is indistinguishable from a cancellation and is reported
/// as one.
const CHOICE_CANCEL_SENTINEL: &str = "false";

/// Builds native dialog scripts for a [`ScriptRunner`] and decodes whatever
/// comes back into a [`DialogOutcome`].
pub struct DialogBridge {
    config: DialogConfig,
    runner: Arc<dyn ScriptRunner>,
}

impl DialogBridge {
    pub fn new(config: DialogConfig, runner: Arc<dyn ScriptRunner>) -> Self {
        Self { config, runner }
    }

    /// Presents the dialog and waits for the operator's response. All
    /// failure modes come back through the returned outcome.
    pub async fn execute(&self, request: DialogRequest) -> DialogOutcome {
        if let Err(message) = validate(&request) {
            return DialogOutcome::Failed(message);
        }
        let script = self.dialog_script(&request);
        match self.runner.run(&script).await {
            Ok(raw) => decode(&request, &raw),
            Err(err) => failure_outcome(&request, err),
        }
    }

    /// Posts a notification. Succeeds without operator interaction.
    pub async fn notify(&self, request: NotificationRequest) -> DialogOutcome {
        let script = self.notification_script(&request);
        match self.runner.run(&script).await {
            Ok(_) => DialogOutcome::Answered(DialogAnswer::Acknowledged),
            Err(err) => {
                debug!("notification script failed: {}", err.message);
                DialogOutcome::Failed(err.message)
            }
        }
    }

    fn dialog_script(&self, request: &DialogRequest) -> String {
        match request {
            DialogRequest::TextInput {
                question,
                context,
                timeout_secs,
                default_value,
            } => {
                let question = applescript::escape(&displayed_question(question, context));
                let default_value = applescript::escape(default_value.as_deref().unwrap_or(""));
                let timeout = self.effective_timeout(*timeout_secs);
                format!(
                    "set dialogResult to display dialog \"{question}\" default answer \"{default_value}\" giving up after {timeout}\nreturn text returned of dialogResult"
                )
            }
            DialogRequest::MultipleChoice {
                question,
                context,
                choices,
                default_choice_index,
                ..
            } => {
                let prompt = applescript::escape(&displayed_question(question, context));
                let list = choices
                    .iter()
                    .map(|choice| format!("\"{}\"", applescript::escape(choice)))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut script = format!("choose from list {{{list}}} with prompt \"{prompt}\"");
                if let Some(choice) = default_choice_index.and_then(|index| choices.get(index)) {
                    script.push_str(&format!(
                        " default items {{\"{}\"}}",
                        applescript::escape(choice)
                    ));
                }
                script
            }
            DialogRequest::Confirm {
                question,
                context,
                timeout_secs,
                default_answer,
            } => {
                let question = applescript::escape(&displayed_question(question, context));
                let default_button = if *default_answer { "Yes" } else { "No" };
                let timeout = self.effective_timeout(*timeout_secs);
                format!(
                    "set dialogResult to display dialog \"{question}\" buttons {{\"No\", \"Yes\"}} default button \"{default_button}\" giving up after {timeout}\nreturn button returned of dialogResult"
                )
            }
            DialogRequest::Info {
                question,
                context,
                timeout_secs,
            } => {
                let question = applescript::escape(&displayed_question(question, context));
                let timeout = self.effective_timeout(*timeout_secs);
                format!(
                    "display dialog \"{question}\" buttons {{\"OK\"}} default button \"OK\" giving up after {timeout}"
                )
            }
        }
    }

    fn notification_script(&self, request: &NotificationRequest) -> String {
        let message = applescript::escape(&request.message);
        // An empty title counts as unset, same as an empty context.
        let title = applescript::escape(match request.title.as_deref() {
            Some(title) if !title.is_empty() => title,
            _ => &self.config.notification_title,
        });
        let subtitle = applescript::escape(request.subtitle.as_deref().unwrap_or(""));
        let mut script = format!(
            "display notification \"{message}\" with title \"{title}\" subtitle \"{subtitle}\""
        );
        if request.sound {
            script.push_str(" sound name \"default\"");
        }
        script
    }

    fn effective_timeout(&self, timeout_secs: Option<i64>) -> u64 {
        match timeout_secs {
            Some(timeout) if timeout > 0 => timeout as u64,
            _ => self.config.default_timeout_secs,
        }
    }
}

/// Rejects malformed requests before any process is spawned.
fn validate(request: &DialogRequest) -> Result<(), String> {
    if let DialogRequest::MultipleChoice { choices, .. } = request {
        if choices.is_empty() {
            return Err("choice dialog requires a non-empty choices list".to_owned());
        }
    }
    if let Some(timeout) = request.timeout_secs() {
        if timeout <= 0 {
            return Err(format!(
                "timeout must be a positive number of seconds, got {timeout}"
            ));
        }
    }
    Ok(())
}

fn decode(request: &DialogRequest, raw: &str) -> DialogOutcome {
    match request {
        DialogRequest::TextInput { .. } => {
            DialogOutcome::Answered(DialogAnswer::Text(raw.to_owned()))
        }
        DialogRequest::MultipleChoice { choices, .. } => {
            if raw == CHOICE_CANCEL_SENTINEL {
                return DialogOutcome::Cancelled;
            }
            match choices.iter().position(|choice| choice == raw) {
                Some(index) => DialogOutcome::Answered(DialogAnswer::ChoiceIndex(index)),
                None => DialogOutcome::Answered(DialogAnswer::ChoiceLabel(raw.to_owned())),
            }
        }
        DialogRequest::Confirm { .. } => {
            DialogOutcome::Answered(DialogAnswer::Confirmed(raw.trim() == "Yes"))
        }
        DialogRequest::Info { .. } => DialogOutcome::Answered(DialogAnswer::Acknowledged),
    }
}

/// Maps a runner failure to an outcome. Only dialogs that report dismissal
/// through the interpreter's error channel may become [`DialogOutcome::Cancelled`];
/// the list picker signals dismissal in-band, so its failures stay failures.
fn failure_outcome(request: &DialogRequest, err: ScriptError) -> DialogOutcome {
    let cancellable = !matches!(request, DialogRequest::MultipleChoice { .. });
    if cancellable && classify_failure(&err.message) == FailureKind::Cancelled {
        debug!("dialog cancelled by operator");
        return DialogOutcome::Cancelled;
    }
    DialogOutcome::Failed(err.message)
}

/// The text actually shown in the dialog. Context, when supplied, is
/// appended under the question separated by a blank line.
fn displayed_question(question: &str, context: &Option<String>) -> String {
    match context.as_deref() {
        Some(context) if !context.is_empty() => format!("{question}\n\n{context}"),
        _ => question.to_owned(),
    }
}
