use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tim_core::{decode_line, encode_line, PromptRequestMessage, StructuredMessage};

use crate::error::PromptError;
use crate::logger::LoggerAdapter;

const ERR_DESTROYED: &str = "tunnel adapter destroyed";
const ERR_CLOSED: &str = "tunnel connection closed";

type PendingMap = HashMap<String, oneshot::Sender<Result<Value, PromptError>>>;

struct ClientShared {
    pending: StdMutex<PendingMap>,
    destroyed: AtomicBool,
}

impl ClientShared {
    fn resolve(&self, request_id: &str, result: Result<Value, PromptError>) {
        let sender = self.pending.lock().unwrap().remove(request_id);
        match sender {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => {
                debug!(event = "tunnel_unmatched_response", request_id);
            }
        }
    }

    /// Fail every in-flight request with a connection-lost error. Draining
    /// makes repeat calls a no-op, so each request settles exactly once.
    fn reject_pending(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (request_id, sender) in drained {
            debug!(event = "tunnel_request_rejected", request_id = %request_id, reason);
            let _ = sender.send(Err(PromptError::ConnectionClosed(reason.to_string())));
        }
    }
}

/// Subagent-side tunnel endpoint. All logger output and prompt requests are
/// forwarded to the host over the Unix socket; nothing touches the local
/// terminal.
pub struct TunnelAdapter {
    outbound: StdMutex<Option<mpsc::UnboundedSender<StructuredMessage>>>,
    shared: Arc<ClientShared>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

impl TunnelAdapter {
    pub async fn connect(socket_path: impl AsRef<Path>) -> io::Result<Self> {
        let stream = UnixStream::connect(socket_path.as_ref()).await?;
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(ClientShared {
            pending: StdMutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        });
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_loop(shared.clone(), read_half));
        tokio::spawn(write_loop(shared.clone(), write_half, outbound_rx));

        Ok(Self {
            outbound: StdMutex::new(Some(outbound_tx)),
            shared,
            reader_task: StdMutex::new(Some(reader_task)),
        })
    }

    /// Forward a prompt request to the host and wait for the correlated
    /// response. Honors `request.timeout_ms` when set.
    pub async fn send_prompt_request(
        &self,
        request: PromptRequestMessage,
    ) -> Result<Value, PromptError> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(PromptError::ConnectionClosed(ERR_DESTROYED.to_string()));
        }

        let request_id = request.request_id.clone();
        let timeout_ms = request.timeout_ms;
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), tx);

        let sender = self.outbound.lock().unwrap().clone();
        let sent = match sender {
            Some(sender) => sender
                .send(StructuredMessage::PromptRequest(request))
                .is_ok(),
            None => false,
        };
        if !sent {
            self.shared.pending.lock().unwrap().remove(&request_id);
            return Err(PromptError::ConnectionClosed(ERR_CLOSED.to_string()));
        }

        let outcome = match timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(Duration::from_millis(ms), rx).await {
                    Ok(received) => received,
                    Err(_) => {
                        self.shared.pending.lock().unwrap().remove(&request_id);
                        return Err(PromptError::Timeout { timeout_ms: ms });
                    }
                }
            }
            None => rx.await,
        };

        match outcome {
            Ok(result) => result,
            Err(_) => Err(PromptError::ConnectionClosed(ERR_CLOSED.to_string())),
        }
    }

    /// Tear the connection down and reject everything in flight. A best-
    /// effort goodbye frame is queued first and the writer drains it before
    /// shutting the socket. Safe to call more than once; later calls do
    /// nothing.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sender) = self.outbound.lock().unwrap().take() {
            let _ = sender.send(StructuredMessage::goodbye());
        }
        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }
        self.shared.reject_pending(ERR_DESTROYED);
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    fn emit(&self, message: StructuredMessage) {
        let sender = self.outbound.lock().unwrap().clone();
        let sent = match sender {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        };
        if !sent {
            debug!(event = "tunnel_emit_dropped");
        }
    }
}

impl Drop for TunnelAdapter {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl LoggerAdapter for TunnelAdapter {
    fn log(&self, message: &str) {
        self.emit(StructuredMessage::log(message));
    }

    fn error(&self, message: &str) {
        self.emit(StructuredMessage::error(message));
    }

    fn warn(&self, message: &str) {
        self.emit(StructuredMessage::warn(message));
    }

    fn write_stdout(&self, data: &str) {
        self.emit(StructuredMessage::stdout(data));
    }

    fn write_stderr(&self, data: &str) {
        self.emit(StructuredMessage::stderr(data));
    }

    fn debug_log(&self, message: &str) {
        self.emit(StructuredMessage::debug(message));
    }

    fn send_structured(&self, message: &StructuredMessage) {
        self.emit(message.clone());
    }
}

async fn read_loop(shared: Arc<ClientShared>, read_half: OwnedReadHalf) {
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if line.iter().all(|byte| byte.is_ascii_whitespace()) {
                    continue;
                }
                match decode_line(&line) {
                    Ok(StructuredMessage::PromptResponse(response)) => {
                        let request_id = response.request_id.clone();
                        match response.into_result() {
                            Ok(value) => shared.resolve(&request_id, Ok(value)),
                            Err(error) => {
                                shared.resolve(&request_id, Err(PromptError::Remote(error)))
                            }
                        }
                    }
                    Ok(other) => {
                        debug!(event = "tunnel_unexpected_host_frame", frame_type = ?std::mem::discriminant(&other));
                    }
                    Err(err) => {
                        warn!(event = "tunnel_client_bad_frame", error = %err);
                    }
                }
            }
            Err(err) => {
                warn!(event = "tunnel_client_read_error", error = %err);
                break;
            }
        }
    }
    shared.reject_pending(ERR_CLOSED);
}

async fn write_loop(
    shared: Arc<ClientShared>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<StructuredMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let encoded = match encode_line(&message) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(event = "tunnel_client_encode_error", error = %err);
                continue;
            }
        };
        if let Err(err) = writer.write_all(&encoded).await {
            warn!(event = "tunnel_client_write_error", error = %err);
            break;
        }
    }
    let _ = writer.shutdown().await;
    shared.reject_pending(ERR_CLOSED);
}
