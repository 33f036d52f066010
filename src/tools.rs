use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::dialog::{
    DialogAnswer, DialogBridge, DialogOutcome, DialogRequest, NotificationRequest,
};

pub const ASK_HUMAN: &str = "ask_human";
pub const NOTIFY_HUMAN: &str = "notify_human";

/// Tool definitions advertised through `tools/list`.
pub fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": ASK_HUMAN,
            "description": "Ask a human a question via native macOS dialog. Supports text input, multiple choice, yes/no, and info dialogs.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "type": {
                        "type": "string",
                        "enum": ["text", "choice", "confirm", "info"],
                        "description": "Type of dialog to show"
                    },
                    "question": {
                        "type": "string",
                        "description": "The question to ask"
                    },
                    "context": {
                        "type": "string",
                        "description": "Additional context for the question"
                    },
                    "choices": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Available choices (for choice type)"
                    },
                    "defaultValue": {
                        "type": "string",
                        "description": "Default value for text input"
                    },
                    "defaultAnswer": {
                        "type": "boolean",
                        "description": "Default answer for confirmation (true for Yes, false for No)"
                    },
                    "defaultChoice": {
                        "type": "number",
                        "description": "Index of default choice (for choice type)"
                    },
                    "timeout": {
                        "type": "number",
                        "description": "Timeout in seconds (default: 300)"
                    }
                },
                "required": ["type", "question"]
            }
        }),
        json!({
            "name": NOTIFY_HUMAN,
            "description": "Send a notification to the human via macOS notification system.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "The notification message"
                    },
                    "title": {
                        "type": "string",
                        "description": "Notification title (default: \"Ping Principal\")"
                    },
                    "subtitle": {
                        "type": "string",
                        "description": "Notification subtitle"
                    },
                    "sound": {
                        "type": "boolean",
                        "description": "Whether to play sound (default: false)"
                    }
                },
                "required": ["message"]
            }
        }),
    ]
}

/// Result envelope handed back to the protocol layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResponse {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ToolResponse {
    fn success(text: impl Into<String>) -> Self {
        Self::text(text, false)
    }

    fn error(text: impl Into<String>) -> Self {
        Self::text(text, true)
    }

    fn text(text: impl Into<String>, is_error: bool) -> Self {
        Self {
            content: vec![ToolContent {
                kind: "text".to_owned(),
                text: text.into(),
            }],
            is_error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DialogKind {
    Text,
    Choice,
    Confirm,
    Info,
}

#[derive(Debug, Clone, Deserialize)]
struct AskHumanArgs {
    #[serde(rename = "type")]
    kind: DialogKind,
    question: String,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    choices: Vec<String>,
    #[serde(default, rename = "defaultValue")]
    default_value: Option<String>,
    #[serde(default, rename = "defaultAnswer")]
    default_answer: Option<bool>,
    #[serde(default, rename = "defaultChoice")]
    default_choice: Option<usize>,
    #[serde(default)]
    timeout: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct NotifyHumanArgs {
    message: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    subtitle: Option<String>,
    #[serde(default)]
    sound: Option<bool>,
}

/// Routes named tool calls to the dialog bridge and renders each outcome as
/// operator-readable text.
pub struct ToolRouter {
    bridge: DialogBridge,
}

impl ToolRouter {
    pub fn new(bridge: DialogBridge) -> Self {
        Self { bridge }
    }

    /// Dispatches one tool call. Every failure mode is rendered into an
    /// error response; this never takes the protocol loop down.
    pub async fn dispatch(&self, name: &str, arguments: Value) -> ToolResponse {
        debug!("dispatching tool call: {name}");
        let result = match name {
            ASK_HUMAN => self.ask_human(arguments).await,
            NOTIFY_HUMAN => self.notify_human(arguments).await,
            _ => {
                warn!("rejecting unknown tool: {name}");
                Err(format!("Unknown tool: {name}"))
            }
        };
        result.unwrap_or_else(|message| ToolResponse::error(format!("Error: {message}")))
    }

    async fn ask_human(&self, arguments: Value) -> Result<ToolResponse, String> {
        let args: AskHumanArgs = serde_json::from_value(arguments)
            .map_err(|err| format!("invalid ask_human arguments: {err}"))?;
        let request = dialog_request(&args);
        let outcome = self.bridge.execute(request).await;
        Ok(render_ask_outcome(&args, outcome))
    }

    async fn notify_human(&self, arguments: Value) -> Result<ToolResponse, String> {
        let args: NotifyHumanArgs = serde_json::from_value(arguments)
            .map_err(|err| format!("invalid notify_human arguments: {err}"))?;
        let request = NotificationRequest {
            message: args.message,
            title: args.title,
            subtitle: args.subtitle,
            sound: args.sound.unwrap_or(false),
        };
        Ok(match self.bridge.notify(request).await {
            DialogOutcome::Failed(message) => {
                ToolResponse::error(format!("Notification failed: {}", or_unknown(message)))
            }
            _ => ToolResponse::success("Notification sent successfully."),
        })
    }
}

fn or_unknown(message: String) -> String {
    if message.is_empty() {
        "Unknown error".to_owned()
    } else {
        message
    }
}

fn dialog_request(args: &AskHumanArgs) -> DialogRequest {
    match args.kind {
        DialogKind::Text => DialogRequest::TextInput {
            question: args.question.clone(),
            context: args.context.clone(),
            timeout_secs: args.timeout,
            default_value: args.default_value.clone(),
        },
        DialogKind::Choice => DialogRequest::MultipleChoice {
            question: args.question.clone(),
            context: args.context.clone(),
            timeout_secs: args.timeout,
            choices: args.choices.clone(),
            default_choice_index: args.default_choice,
        },
        DialogKind::Confirm => DialogRequest::Confirm {
            question: args.question.clone(),
            context: args.context.clone(),
            timeout_secs: args.timeout,
            default_answer: args.default_answer.unwrap_or(false),
        },
        DialogKind::Info => DialogRequest::Info {
            question: args.question.clone(),
            context: args.context.clone(),
            timeout_secs: args.timeout,
        },
    }
}

fn render_ask_outcome(args: &AskHumanArgs, outcome: DialogOutcome) -> ToolResponse {
    match outcome {
        DialogOutcome::Cancelled => ToolResponse::success("User cancelled the dialog."),
        DialogOutcome::Failed(message) => {
            ToolResponse::error(format!("Dialog failed: {}", or_unknown(message)))
        }
        DialogOutcome::Answered(answer) => {
            let mut text = format!("Question: {}", args.question);
            if let Some(context) = args.context.as_deref() {
                if !context.is_empty() {
                    text.push_str("\n\nContext: ");
                    text.push_str(context);
                }
            }
            text.push_str("\n\n");
            text.push_str(&describe_answer(args, answer));
            ToolResponse::success(text)
        }
    }
}

fn describe_answer(args: &AskHumanArgs, answer: DialogAnswer) -> String {
    match answer {
        DialogAnswer::Text(value) => format!("User response: {value}"),
        DialogAnswer::ChoiceIndex(index) => match args.choices.get(index) {
            Some(label) => format!("User selected: {label}"),
            None => format!("User selected: {index}"),
        },
        DialogAnswer::ChoiceLabel(label) => format!("User selected: {label}"),
        DialogAnswer::Confirmed(confirmed) => {
            format!("User confirmed: {}", if confirmed { "Yes" } else { "No" })
        }
        DialogAnswer::Acknowledged => "User acknowledged the information.".to_owned(),
    }
}
