//! Prompt dispatch. Picks the channel from the ambient adapter: a tunnel
//! forwards the prompt to the host outright, a headless adapter races the
//! local terminal against the control plane, and plain console goes straight
//! to the terminal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use tim_core::{
    AnswerSource, CheckboxConfig, ConfirmConfig, InputConfig, PrefixSelectConfig,
    PromptAnsweredMessage, PromptChoice, PromptPayload, PromptRequestMessage,
    PromptResponseMessage, SelectConfig, StructuredMessage,
};

use crate::error::PromptError;
use crate::headless::HeadlessAdapter;
use crate::input;
use crate::logger::{logger_adapter, ActiveAdapter, LoggerAdapter};

/// Fires `true` at most once when the prompt should stop early.
pub type AbortSignal = watch::Receiver<bool>;

/// Interactive backend that renders one prompt and collects the answer.
/// Implementations must return `PromptError::Aborted` promptly once the
/// abort signal fires.
#[async_trait]
pub trait TerminalPrompt: Send + Sync {
    async fn run(
        &self,
        request: &PromptRequestMessage,
        abort: AbortSignal,
    ) -> Result<Value, PromptError>;
}

pub struct Prompter {
    terminal: Arc<dyn TerminalPrompt>,
}

impl Prompter {
    pub fn new(terminal: Arc<dyn TerminalPrompt>) -> Self {
        Self { terminal }
    }

    pub async fn confirm(
        &self,
        message: impl Into<String>,
        default: Option<bool>,
        timeout_ms: Option<u64>,
    ) -> Result<bool, PromptError> {
        let request = PromptRequestMessage::new(
            PromptPayload::Confirm(ConfirmConfig {
                message: message.into(),
                default,
            }),
            timeout_ms,
        );
        let value = self.run_prompt(request).await?;
        value.as_bool().ok_or_else(|| {
            PromptError::Backend("confirm prompt returned a non-boolean value".to_string())
        })
    }

    pub async fn select(
        &self,
        message: impl Into<String>,
        choices: Vec<PromptChoice>,
        timeout_ms: Option<u64>,
    ) -> Result<Value, PromptError> {
        let request = PromptRequestMessage::new(
            PromptPayload::Select(SelectConfig {
                message: message.into(),
                choices,
            }),
            timeout_ms,
        );
        self.run_prompt(request).await
    }

    pub async fn input(
        &self,
        message: impl Into<String>,
        default: Option<String>,
        validation_hint: Option<String>,
        timeout_ms: Option<u64>,
    ) -> Result<String, PromptError> {
        let request = PromptRequestMessage::new(
            PromptPayload::Input(InputConfig {
                message: message.into(),
                default,
                validation_hint,
            }),
            timeout_ms,
        );
        let value = self.run_prompt(request).await?;
        value.as_str().map(str::to_string).ok_or_else(|| {
            PromptError::Backend("input prompt returned a non-string value".to_string())
        })
    }

    pub async fn checkbox(
        &self,
        message: impl Into<String>,
        choices: Vec<PromptChoice>,
        timeout_ms: Option<u64>,
    ) -> Result<Vec<Value>, PromptError> {
        let request = PromptRequestMessage::new(
            PromptPayload::Checkbox(CheckboxConfig {
                message: message.into(),
                choices,
            }),
            timeout_ms,
        );
        let value = self.run_prompt(request).await?;
        value.as_array().cloned().ok_or_else(|| {
            PromptError::Backend("checkbox prompt returned a non-array value".to_string())
        })
    }

    pub async fn prefix_select(
        &self,
        message: impl Into<String>,
        command: impl Into<String>,
        timeout_ms: Option<u64>,
    ) -> Result<String, PromptError> {
        let request = PromptRequestMessage::new(
            PromptPayload::PrefixSelect(PrefixSelectConfig {
                message: message.into(),
                command: command.into(),
            }),
            timeout_ms,
        );
        let value = self.run_prompt(request).await?;
        value.as_str().map(str::to_string).ok_or_else(|| {
            PromptError::Backend("prefix_select prompt returned a non-string value".to_string())
        })
    }

    /// Route one prompt request through the ambient adapter's channel.
    pub async fn run_prompt(&self, request: PromptRequestMessage) -> Result<Value, PromptError> {
        let adapter = logger_adapter();
        match adapter.clone() {
            ActiveAdapter::Tunnel(tunnel) => tunnel.send_prompt_request(request).await,
            ActiveAdapter::Headless(headless) => {
                self.race_with_control_plane(&adapter, &headless, request).await
            }
            ActiveAdapter::Console(_) => self.terminal_only(&adapter, request).await,
        }
    }

    async fn terminal_only(
        &self,
        adapter: &ActiveAdapter,
        request: PromptRequestMessage,
    ) -> Result<Value, PromptError> {
        adapter.send_structured(&StructuredMessage::PromptRequest(request.clone()));
        let _input = input::registry().pause_for_prompt().await;

        let (abort_tx, abort_rx) = watch::channel(false);
        let term = self.terminal.run(&request, abort_rx);
        tokio::pin!(term);
        let deadline = prompt_deadline(request.timeout_ms);
        tokio::pin!(deadline);

        let mut timed_out = false;
        let outcome = loop {
            tokio::select! {
                outcome = &mut term => break outcome,
                _ = &mut deadline, if !timed_out => {
                    timed_out = true;
                    let _ = abort_tx.send(true);
                }
            }
        };

        match outcome {
            Ok(value) => {
                broadcast_answered(adapter, &request, AnswerSource::Terminal, &value);
                Ok(value)
            }
            Err(PromptError::Aborted) if timed_out => Err(PromptError::Timeout {
                timeout_ms: request.timeout_ms.unwrap_or(0),
            }),
            Err(err) => Err(err),
        }
    }

    /// Race the local terminal against the control plane. Whichever side
    /// answers first wins; the loser is cancelled before the answer is
    /// broadcast. Losing the WebSocket mid-race degrades silently to a
    /// terminal-only prompt.
    async fn race_with_control_plane(
        &self,
        adapter: &ActiveAdapter,
        headless: &Arc<HeadlessAdapter>,
        request: PromptRequestMessage,
    ) -> Result<Value, PromptError> {
        // Register before broadcasting so an instant remote answer cannot
        // arrive unmatched.
        let mut wait = headless.wait_for_prompt_response(&request.request_id);
        adapter.send_structured(&StructuredMessage::PromptRequest(request.clone()));
        let _input = input::registry().pause_for_prompt().await;

        let (abort_tx, abort_rx) = watch::channel(false);
        let term = self.terminal.run(&request, abort_rx);
        tokio::pin!(term);
        let deadline = prompt_deadline(request.timeout_ms);
        tokio::pin!(deadline);

        let mut remote: Option<PromptResponseMessage> = None;
        let mut remote_open = true;
        let mut timed_out = false;
        let outcome = loop {
            tokio::select! {
                outcome = &mut term => break outcome,
                response = wait.recv(), if remote_open && !timed_out => {
                    remote_open = false;
                    match response {
                        Some(response) => {
                            remote = Some(response);
                            let _ = abort_tx.send(true);
                        }
                        None => {
                            // Registration cancelled under us (adapter was
                            // destroyed). The terminal side keeps running.
                        }
                    }
                }
                _ = &mut deadline, if !timed_out && remote.is_none() => {
                    timed_out = true;
                    let _ = abort_tx.send(true);
                }
            }
        };
        wait.cancel();

        match outcome {
            Ok(value) => {
                broadcast_answered(adapter, &request, AnswerSource::Terminal, &value);
                Ok(value)
            }
            Err(PromptError::Aborted) => {
                if let Some(response) = remote {
                    match response.into_result() {
                        Ok(value) => {
                            broadcast_answered(adapter, &request, AnswerSource::Websocket, &value);
                            Ok(value)
                        }
                        Err(error) => Err(PromptError::Remote(error)),
                    }
                } else if timed_out {
                    Err(PromptError::Timeout {
                        timeout_ms: request.timeout_ms.unwrap_or(0),
                    })
                } else {
                    Err(PromptError::Aborted)
                }
            }
            Err(err) => Err(err),
        }
    }
}

async fn prompt_deadline(timeout_ms: Option<u64>) {
    match timeout_ms {
        Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
        None => std::future::pending().await,
    }
}

fn broadcast_answered(
    adapter: &ActiveAdapter,
    request: &PromptRequestMessage,
    source: AnswerSource,
    value: &Value,
) {
    let answered = PromptAnsweredMessage::new(
        request.request_id.clone(),
        request.kind(),
        value.clone(),
        source,
    );
    adapter.send_structured(&StructuredMessage::PromptAnswered(answered));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{control_plane_url, HeadlessConfig};
    use crate::logger::run_with_logger;
    use crate::tunnel::{PromptHandler, TunnelAdapter, TunnelServer};
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    struct FakeTerminal {
        value: Value,
        delay: Duration,
        invocations: AtomicUsize,
    }

    impl FakeTerminal {
        fn new(value: Value, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                value,
                delay,
                invocations: AtomicUsize::new(0),
            })
        }

        fn invocations(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TerminalPrompt for FakeTerminal {
        async fn run(
            &self,
            _request: &PromptRequestMessage,
            mut abort: AbortSignal,
        ) -> Result<Value, PromptError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if *abort.borrow() {
                return Err(PromptError::Aborted);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(self.value.clone()),
                _ = abort.changed() => Err(PromptError::Aborted),
            }
        }
    }

    fn answered_in(messages: &[StructuredMessage]) -> Vec<PromptAnsweredMessage> {
        messages
            .iter()
            .filter_map(|message| match message {
                StructuredMessage::PromptAnswered(answered) => Some(answered.clone()),
                _ => None,
            })
            .collect()
    }

    fn test_socket_path(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("tim-prompt-{tag}-{nanos}.sock"))
    }

    fn idle_headless() -> Arc<HeadlessAdapter> {
        // Nothing listens on this port; the adapter buffers and retries in
        // the background while the race runs.
        let url = control_plane_url("ws://127.0.0.1:1").expect("url");
        Arc::new(HeadlessAdapter::new(HeadlessConfig::new(url)))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tunnel_prompt_never_touches_the_terminal() {
        let path = test_socket_path("scenario-a");
        let handler: PromptHandler = Arc::new(|_request, responder| {
            tokio::spawn(async move {
                responder.respond_value(json!(true)).await;
            });
        });
        let server = TunnelServer::bind(&path, logger_adapter(), handler)
            .await
            .expect("bind");

        let tunnel = Arc::new(TunnelAdapter::connect(&path).await.expect("connect"));
        let terminal = FakeTerminal::new(json!(false), Duration::from_millis(1));
        let prompter = Prompter::new(terminal.clone());

        let confirmed = run_with_logger(ActiveAdapter::Tunnel(tunnel), async move {
            prompter
                .confirm("Proceed with the plan?", Some(false), None)
                .await
        })
        .await
        .expect("confirm");

        assert!(confirmed);
        assert_eq!(terminal.invocations(), 0);
        server.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminal_wins_the_race_and_broadcasts_once() {
        let headless = idle_headless();
        let terminal = FakeTerminal::new(json!("allow"), Duration::from_millis(30));
        let prompter = Prompter::new(terminal.clone());

        let request = PromptRequestMessage::new(
            PromptPayload::Select(SelectConfig {
                message: "Allow this command?".to_string(),
                choices: vec![
                    PromptChoice::new("Allow", "allow"),
                    PromptChoice::new("Deny", "deny"),
                ],
            }),
            None,
        );

        let value = run_with_logger(ActiveAdapter::Headless(headless.clone()), {
            let prompter = &prompter;
            let request = request.clone();
            async move { prompter.run_prompt(request).await }
        })
        .await
        .expect("prompt");

        assert_eq!(value, json!("allow"));
        assert_eq!(terminal.invocations(), 1);

        let answered = answered_in(&headless.buffered_messages());
        assert_eq!(answered.len(), 1);
        assert_eq!(answered[0].request_id, request.request_id);
        assert_eq!(answered[0].source, AnswerSource::Terminal);
        assert_eq!(answered[0].value, json!("allow"));
        assert_eq!(headless.pending_len(), 0);

        headless.destroy();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remote_answer_aborts_the_terminal() {
        let headless = idle_headless();
        let terminal = FakeTerminal::new(json!("allow"), Duration::from_secs(5));
        let prompter = Prompter::new(terminal.clone());

        let request = PromptRequestMessage::new(
            PromptPayload::Confirm(ConfirmConfig {
                message: "Deploy?".to_string(),
                default: None,
            }),
            None,
        );
        let request_id = request.request_id.clone();

        let responder = {
            let headless = headless.clone();
            let request_id = request_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                headless.deliver_response(PromptResponseMessage::ok(request_id, json!(false)));
            })
        };

        let started = Instant::now();
        let value = run_with_logger(ActiveAdapter::Headless(headless.clone()), {
            let prompter = &prompter;
            async move { prompter.run_prompt(request).await }
        })
        .await
        .expect("prompt");

        assert_eq!(value, json!(false));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(terminal.invocations(), 1);

        let answered = answered_in(&headless.buffered_messages());
        assert_eq!(answered.len(), 1);
        assert_eq!(answered[0].source, AnswerSource::Websocket);
        assert_eq!(headless.pending_len(), 0);

        responder.await.expect("responder");
        headless.destroy();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn race_times_out_within_budget() {
        let headless = idle_headless();
        let terminal = FakeTerminal::new(json!("allow"), Duration::from_secs(5));
        let prompter = Prompter::new(terminal);

        let request = PromptRequestMessage::new(
            PromptPayload::Confirm(ConfirmConfig {
                message: "Continue?".to_string(),
                default: None,
            }),
            Some(100),
        );

        let started = Instant::now();
        let err = run_with_logger(ActiveAdapter::Headless(headless.clone()), {
            let prompter = &prompter;
            async move { prompter.run_prompt(request).await }
        })
        .await
        .expect_err("should time out");
        let elapsed = started.elapsed();

        assert_eq!(err, PromptError::Timeout { timeout_ms: 100 });
        assert!(crate::error::is_prompt_timeout_error(&err));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(250), "took {elapsed:?}");

        // No answer was broadcast and no registration leaked.
        assert!(answered_in(&headless.buffered_messages()).is_empty());
        assert_eq!(headless.pending_len(), 0);

        headless.destroy();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn destroyed_adapter_degrades_to_terminal() {
        let headless = idle_headless();
        let terminal = FakeTerminal::new(json!("allow"), Duration::from_millis(100));
        let prompter = Prompter::new(terminal.clone());

        let request = PromptRequestMessage::new(
            PromptPayload::Confirm(ConfirmConfig {
                message: "Keep going?".to_string(),
                default: None,
            }),
            None,
        );

        let destroyer = {
            let headless = headless.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                headless.destroy();
            })
        };

        let value = run_with_logger(ActiveAdapter::Headless(headless.clone()), {
            let prompter = &prompter;
            async move { prompter.run_prompt(request).await }
        })
        .await
        .expect("terminal should still answer");

        assert_eq!(value, json!("allow"));
        assert_eq!(terminal.invocations(), 1);
        destroyer.await.expect("destroyer");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn console_prompt_goes_straight_to_the_terminal() {
        let terminal = FakeTerminal::new(json!("fix the tests"), Duration::from_millis(5));
        let prompter = Prompter::new(terminal.clone());

        let answer = prompter
            .input("What next?", None, None, None)
            .await
            .expect("input");
        assert_eq!(answer, "fix the tests");
        assert_eq!(terminal.invocations(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn console_prompt_honors_the_timeout() {
        let terminal = FakeTerminal::new(json!(true), Duration::from_secs(5));
        let prompter = Prompter::new(terminal);

        let err = prompter
            .confirm("Still there?", None, Some(50))
            .await
            .expect_err("should time out");
        assert_eq!(err, PromptError::Timeout { timeout_ms: 50 });
    }
}
