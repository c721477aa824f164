use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// One protocol event. On the wire this is a single JSON object tagged by
/// `type`; the tunnel frames it as one NDJSON line, the headless channel as
/// one WebSocket text frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StructuredMessage {
    Log { timestamp: String, message: String },
    Warn { timestamp: String, message: String },
    Error { timestamp: String, message: String },
    Debug { timestamp: String, message: String },
    Stdout { timestamp: String, data: String },
    Stderr { timestamp: String, data: String },
    Structured { timestamp: String, payload: Value },
    PromptRequest(PromptRequestMessage),
    PromptResponse(PromptResponseMessage),
    PromptAnswered(PromptAnsweredMessage),
    ReplayEnd { timestamp: String },
    Hello {
        timestamp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    Goodbye { timestamp: String },
}

impl StructuredMessage {
    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            timestamp: now_rfc3339(),
            message: message.into(),
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::Warn {
            timestamp: now_rfc3339(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            timestamp: now_rfc3339(),
            message: message.into(),
        }
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self::Debug {
            timestamp: now_rfc3339(),
            message: message.into(),
        }
    }

    pub fn stdout(data: impl Into<String>) -> Self {
        Self::Stdout {
            timestamp: now_rfc3339(),
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self::Stderr {
            timestamp: now_rfc3339(),
            data: data.into(),
        }
    }

    pub fn structured(payload: Value) -> Self {
        Self::Structured {
            timestamp: now_rfc3339(),
            payload,
        }
    }

    pub fn replay_end() -> Self {
        Self::ReplayEnd {
            timestamp: now_rfc3339(),
        }
    }

    pub fn hello(command: Option<String>) -> Self {
        Self::Hello {
            timestamp: now_rfc3339(),
            command,
        }
    }

    pub fn goodbye() -> Self {
        Self::Goodbye {
            timestamp: now_rfc3339(),
        }
    }
}

/// An interactive input request forwarded to whichever channel answers it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptRequestMessage {
    pub timestamp: String,
    pub request_id: String,
    #[serde(flatten)]
    pub prompt: PromptPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl PromptRequestMessage {
    pub fn new(prompt: PromptPayload, timeout_ms: Option<u64>) -> Self {
        Self {
            timestamp: now_rfc3339(),
            request_id: uuid::Uuid::new_v4().to_string(),
            prompt,
            timeout_ms,
        }
    }

    pub fn kind(&self) -> PromptKind {
        self.prompt.kind()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "prompt_type", content = "prompt_config", rename_all = "snake_case")]
pub enum PromptPayload {
    Confirm(ConfirmConfig),
    Select(SelectConfig),
    Input(InputConfig),
    Checkbox(CheckboxConfig),
    PrefixSelect(PrefixSelectConfig),
}

impl PromptPayload {
    pub fn kind(&self) -> PromptKind {
        match self {
            PromptPayload::Confirm(_) => PromptKind::Confirm,
            PromptPayload::Select(_) => PromptKind::Select,
            PromptPayload::Input(_) => PromptKind::Input,
            PromptPayload::Checkbox(_) => PromptKind::Checkbox,
            PromptPayload::PrefixSelect(_) => PromptKind::PrefixSelect,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Confirm,
    Select,
    Input,
    Checkbox,
    PrefixSelect,
}

impl PromptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptKind::Confirm => "confirm",
            PromptKind::Select => "select",
            PromptKind::Input => "input",
            PromptKind::Checkbox => "checkbox",
            PromptKind::PrefixSelect => "prefix_select",
        }
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfirmConfig {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectConfig {
    pub message: String,
    pub choices: Vec<PromptChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputConfig {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckboxConfig {
    pub message: String,
    pub choices: Vec<PromptChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrefixSelectConfig {
    pub message: String,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptChoice {
    pub name: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
}

impl PromptChoice {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            description: None,
            checked: None,
        }
    }
}

/// Correlated answer for a forwarded prompt. Exactly one of `value`/`error`
/// is present; carries no timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptResponseMessage {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PromptResponseMessage {
    pub fn ok(request_id: impl Into<String>, value: Value) -> Self {
        Self {
            request_id: request_id.into(),
            value: Some(value),
            error: None,
        }
    }

    pub fn err(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            value: None,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> Result<Value, String> {
        match (self.value, self.error) {
            (Some(value), None) => Ok(value),
            (None, Some(error)) => Err(error),
            (Some(value), Some(_)) => Ok(value),
            (None, None) => Err("prompt response carried neither value nor error".to_string()),
        }
    }
}

/// Broadcast exactly once per request after the race resolves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptAnsweredMessage {
    pub timestamp: String,
    pub request_id: String,
    pub prompt_type: PromptKind,
    pub value: Value,
    pub source: AnswerSource,
}

impl PromptAnsweredMessage {
    pub fn new(
        request_id: impl Into<String>,
        prompt_type: PromptKind,
        value: Value,
        source: AnswerSource,
    ) -> Self {
        Self {
            timestamp: now_rfc3339(),
            request_id: request_id.into(),
            prompt_type,
            value,
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerSource {
    Terminal,
    Websocket,
}

impl AnswerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerSource::Terminal => "terminal",
            AnswerSource::Websocket => "websocket",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prompt_request_round_trips_for_every_prompt_type() {
        let prompts = vec![
            PromptPayload::Confirm(ConfirmConfig {
                message: "Continue?".to_string(),
                default: Some(true),
            }),
            PromptPayload::Select(SelectConfig {
                message: "Pick one".to_string(),
                choices: vec![
                    PromptChoice {
                        name: "Allow".to_string(),
                        value: json!("allow"),
                        description: Some("proceed".to_string()),
                        checked: None,
                    },
                    PromptChoice::new("Deny", "deny"),
                ],
            }),
            PromptPayload::Input(InputConfig {
                message: "Branch name".to_string(),
                default: Some("main".to_string()),
                validation_hint: Some("lowercase".to_string()),
            }),
            PromptPayload::Checkbox(CheckboxConfig {
                message: "Stage files".to_string(),
                choices: vec![PromptChoice {
                    name: "src/lib.rs".to_string(),
                    value: json!("src/lib.rs"),
                    description: None,
                    checked: Some(true),
                }],
            }),
            PromptPayload::PrefixSelect(PrefixSelectConfig {
                message: "Run which command?".to_string(),
                command: "cargo test".to_string(),
            }),
        ];

        for prompt in prompts {
            let request = PromptRequestMessage::new(prompt, Some(5_000));
            let encoded = serde_json::to_string(&request).expect("encode");
            let decoded: PromptRequestMessage = serde_json::from_str(&encoded).expect("decode");
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn prompt_request_wire_shape_uses_snake_case_tags() {
        let request = PromptRequestMessage::new(
            PromptPayload::PrefixSelect(PrefixSelectConfig {
                message: "msg".to_string(),
                command: "jj squash".to_string(),
            }),
            None,
        );
        let message = StructuredMessage::PromptRequest(request);
        let value = serde_json::to_value(&message).expect("encode");
        assert_eq!(value["type"], "prompt_request");
        assert_eq!(value["prompt_type"], "prefix_select");
        assert_eq!(value["prompt_config"]["command"], "jj squash");
        assert!(value.get("timeout_ms").is_none());
    }

    #[test]
    fn prompt_response_carries_exactly_one_side() {
        let ok = PromptResponseMessage::ok("req-1", json!(true));
        assert_eq!(ok.clone().into_result(), Ok(json!(true)));
        let encoded = serde_json::to_value(&ok).expect("encode");
        assert!(encoded.get("error").is_none());

        let err = PromptResponseMessage::err("req-1", "denied");
        assert_eq!(err.clone().into_result(), Err("denied".to_string()));
        let encoded = serde_json::to_value(&err).expect("encode");
        assert!(encoded.get("value").is_none());
    }

    #[test]
    fn answered_message_round_trips() {
        let answered = PromptAnsweredMessage::new(
            "req-7",
            PromptKind::Select,
            json!("allow"),
            AnswerSource::Websocket,
        );
        let message = StructuredMessage::PromptAnswered(answered.clone());
        let encoded = serde_json::to_string(&message).expect("encode");
        let decoded: StructuredMessage = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, StructuredMessage::PromptAnswered(answered));
        assert!(encoded.contains("\"source\":\"websocket\""));
    }
}
