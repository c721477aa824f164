//! Line-oriented terminal prompt backend. Reads answers from stdin so the
//! read can be raced against the abort signal; an aborted prompt leaves no
//! blocked thread behind.

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use tim_core::{PromptChoice, PromptPayload, PromptRequestMessage};

use crate::error::PromptError;
use crate::prompt::{AbortSignal, TerminalPrompt};

pub struct TtyPrompt;

#[async_trait]
impl TerminalPrompt for TtyPrompt {
    async fn run(
        &self,
        request: &PromptRequestMessage,
        mut abort: AbortSignal,
    ) -> Result<Value, PromptError> {
        if *abort.borrow() {
            return Err(PromptError::Aborted);
        }
        render(request);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                line = next_line(&mut lines) => line?,
                _ = abort.changed() => return Err(PromptError::Aborted),
            };
            match parse_answer(request, line.trim()) {
                Ok(value) => return Ok(value),
                Err(hint) => {
                    eprintln!("{hint}");
                    eprint!("> ");
                }
            }
        }
    }
}

async fn next_line(lines: &mut Lines<BufReader<Stdin>>) -> Result<String, PromptError> {
    match lines.next_line().await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(PromptError::Backend("stdin closed".to_string())),
        Err(err) => Err(PromptError::Backend(err.to_string())),
    }
}

fn render(request: &PromptRequestMessage) {
    match &request.prompt {
        PromptPayload::Confirm(config) => {
            let hint = match config.default {
                Some(true) => "[Y/n]",
                Some(false) => "[y/N]",
                None => "[y/n]",
            };
            eprintln!("{} {hint}", config.message);
        }
        PromptPayload::Select(config) => {
            eprintln!("{}", config.message);
            render_choices(&config.choices);
        }
        PromptPayload::Input(config) => {
            match &config.default {
                Some(default) => eprintln!("{} [{default}]", config.message),
                None => eprintln!("{}", config.message),
            }
            if let Some(hint) = &config.validation_hint {
                eprintln!("({hint})");
            }
        }
        PromptPayload::Checkbox(config) => {
            eprintln!("{} (comma-separated numbers, empty keeps defaults)", config.message);
            render_choices(&config.choices);
        }
        PromptPayload::PrefixSelect(config) => {
            eprintln!("{}", config.message);
            eprintln!("(enter keeps: {})", config.command);
        }
    }
    eprint!("> ");
}

fn render_choices(choices: &[PromptChoice]) {
    for (idx, choice) in choices.iter().enumerate() {
        let marker = if choice.checked == Some(true) { "*" } else { " " };
        match &choice.description {
            Some(description) => {
                eprintln!("{marker}{}. {} - {description}", idx + 1, choice.name)
            }
            None => eprintln!("{marker}{}. {}", idx + 1, choice.name),
        }
    }
}

fn pick_choice(choices: &[PromptChoice], line: &str) -> Option<Value> {
    line.parse::<usize>()
        .ok()
        .and_then(|idx| choices.get(idx.wrapping_sub(1)))
        .map(|choice| choice.value.clone())
}

/// Turn one input line into the prompt's answer value, or a re-ask hint.
fn parse_answer(request: &PromptRequestMessage, line: &str) -> Result<Value, String> {
    match &request.prompt {
        PromptPayload::Confirm(config) => match line.to_ascii_lowercase().as_str() {
            "y" | "yes" => Ok(Value::Bool(true)),
            "n" | "no" => Ok(Value::Bool(false)),
            "" => match config.default {
                Some(default) => Ok(Value::Bool(default)),
                None => Err("please answer y or n".to_string()),
            },
            _ => Err("please answer y or n".to_string()),
        },
        PromptPayload::Select(config) => pick_choice(&config.choices, line)
            .ok_or_else(|| format!("enter a number between 1 and {}", config.choices.len())),
        PromptPayload::Input(config) => {
            if line.is_empty() {
                match &config.default {
                    Some(default) => Ok(Value::String(default.clone())),
                    None => Ok(Value::String(String::new())),
                }
            } else {
                Ok(Value::String(line.to_string()))
            }
        }
        PromptPayload::Checkbox(config) => {
            if line.is_empty() {
                let checked: Vec<Value> = config
                    .choices
                    .iter()
                    .filter(|choice| choice.checked == Some(true))
                    .map(|choice| choice.value.clone())
                    .collect();
                return Ok(Value::Array(checked));
            }
            let mut picked = Vec::new();
            for part in line.split([',', ' ']).filter(|part| !part.is_empty()) {
                match part
                    .parse::<usize>()
                    .ok()
                    .and_then(|idx| config.choices.get(idx.wrapping_sub(1)))
                {
                    Some(choice) => picked.push(choice.value.clone()),
                    None => {
                        return Err(format!(
                            "enter numbers between 1 and {}",
                            config.choices.len()
                        ))
                    }
                }
            }
            Ok(Value::Array(picked))
        }
        PromptPayload::PrefixSelect(config) => {
            if line.is_empty() {
                Ok(Value::String(config.command.clone()))
            } else {
                Ok(Value::String(line.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tim_core::{
        CheckboxConfig, ConfirmConfig, InputConfig, PrefixSelectConfig, SelectConfig,
    };

    fn request(prompt: PromptPayload) -> PromptRequestMessage {
        PromptRequestMessage::new(prompt, None)
    }

    #[test]
    fn confirm_accepts_yes_no_and_default() {
        let req = request(PromptPayload::Confirm(ConfirmConfig {
            message: "ok?".to_string(),
            default: Some(true),
        }));
        assert_eq!(parse_answer(&req, "y"), Ok(json!(true)));
        assert_eq!(parse_answer(&req, "no"), Ok(json!(false)));
        assert_eq!(parse_answer(&req, ""), Ok(json!(true)));
        assert!(parse_answer(&req, "maybe").is_err());

        let req = request(PromptPayload::Confirm(ConfirmConfig {
            message: "ok?".to_string(),
            default: None,
        }));
        assert!(parse_answer(&req, "").is_err());
    }

    #[test]
    fn select_maps_numbers_to_choice_values() {
        let req = request(PromptPayload::Select(SelectConfig {
            message: "pick".to_string(),
            choices: vec![
                PromptChoice::new("Allow", "allow"),
                PromptChoice::new("Deny", "deny"),
            ],
        }));
        assert_eq!(parse_answer(&req, "2"), Ok(json!("deny")));
        assert!(parse_answer(&req, "0").is_err());
        assert!(parse_answer(&req, "3").is_err());
        assert!(parse_answer(&req, "deny").is_err());
    }

    #[test]
    fn input_falls_back_to_the_default() {
        let req = request(PromptPayload::Input(InputConfig {
            message: "branch".to_string(),
            default: Some("main".to_string()),
            validation_hint: None,
        }));
        assert_eq!(parse_answer(&req, ""), Ok(json!("main")));
        assert_eq!(parse_answer(&req, "feature/x"), Ok(json!("feature/x")));
    }

    #[test]
    fn checkbox_collects_picked_values_and_defaults() {
        let req = request(PromptPayload::Checkbox(CheckboxConfig {
            message: "stage".to_string(),
            choices: vec![
                PromptChoice {
                    name: "a.rs".to_string(),
                    value: json!("a.rs"),
                    description: None,
                    checked: Some(true),
                },
                PromptChoice::new("b.rs", "b.rs"),
                PromptChoice::new("c.rs", "c.rs"),
            ],
        }));
        assert_eq!(parse_answer(&req, "1, 3"), Ok(json!(["a.rs", "c.rs"])));
        assert_eq!(parse_answer(&req, ""), Ok(json!(["a.rs"])));
        assert!(parse_answer(&req, "4").is_err());
    }

    #[test]
    fn prefix_select_keeps_the_command_on_empty_input() {
        let req = request(PromptPayload::PrefixSelect(PrefixSelectConfig {
            message: "run?".to_string(),
            command: "cargo test".to_string(),
        }));
        assert_eq!(parse_answer(&req, ""), Ok(json!("cargo test")));
        assert_eq!(
            parse_answer(&req, "cargo test --release"),
            Ok(json!("cargo test --release"))
        );
    }
}
