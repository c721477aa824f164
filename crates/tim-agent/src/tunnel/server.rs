use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tim_core::{decode_line, encode_line, PromptRequestMessage, PromptResponseMessage, StructuredMessage};

use crate::logger::{ActiveAdapter, LoggerAdapter};

const OUTBOUND_QUEUE_DEPTH: usize = 64;
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Invoked once per inbound prompt request. Long-running work (an actual
/// interactive prompt) should be spawned; the responder is owned and can
/// travel into the task.
pub type PromptHandler = Arc<dyn Fn(PromptRequestMessage, PromptResponder) + Send + Sync>;

/// One-shot reply handle for a forwarded prompt request.
pub struct PromptResponder {
    request_id: String,
    outbound: mpsc::Sender<StructuredMessage>,
}

impl PromptResponder {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn respond(self, response: PromptResponseMessage) {
        if self
            .outbound
            .send(StructuredMessage::PromptResponse(response))
            .await
            .is_err()
        {
            debug!(event = "tunnel_response_dropped", "subagent disconnected before the response was written");
        }
    }

    pub async fn respond_value(self, value: Value) {
        let response = PromptResponseMessage::ok(self.request_id.clone(), value);
        self.respond(response).await;
    }

    pub async fn respond_error(self, error: impl Into<String>) {
        let response = PromptResponseMessage::err(self.request_id.clone(), error);
        self.respond(response).await;
    }
}

/// Host-side tunnel endpoint. Binds a Unix socket, accepts one subagent
/// connection at a time, forwards its output to the ambient adapter, and
/// routes prompt requests to the registered handler.
pub struct TunnelServer {
    socket_path: PathBuf,
    shutdown: watch::Sender<bool>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
}

impl TunnelServer {
    pub async fn bind(
        socket_path: impl Into<PathBuf>,
        adapter: ActiveAdapter,
        on_prompt_request: PromptHandler,
    ) -> io::Result<Self> {
        let socket_path = socket_path.into();
        let listener = bind_listener(&socket_path)?;
        info!(event = "tunnel_listening", path = %socket_path.display());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            adapter,
            on_prompt_request,
            shutdown_rx,
        ));

        Ok(Self {
            socket_path,
            shutdown: shutdown_tx,
            accept_task: StdMutex::new(Some(accept_task)),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop accepting, drop the live connection, and remove the socket file.
    /// Safe to call more than once.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(event = "tunnel_accept_join_error", error = %err);
            }
        }
        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(event = "tunnel_socket_cleanup_error", error = %err);
            }
        }
    }
}

fn bind_listener(socket_path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
        let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
    }
    match std::fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

async fn accept_loop(
    listener: UnixListener,
    adapter: ActiveAdapter,
    handler: PromptHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    let conn_seq = AtomicU64::new(0);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let conn_id = conn_seq.fetch_add(1, Ordering::Relaxed);
                        debug!(event = "tunnel_accepted", conn_id);
                        // One logical subagent at a time; handle inline so a
                        // second connection waits for the first to finish.
                        handle_connection(conn_id, stream, &adapter, &handler, shutdown.clone())
                            .await;
                        debug!(event = "tunnel_disconnected", conn_id);
                    }
                    Err(err) => {
                        warn!(event = "tunnel_accept_error", error = %err);
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    conn_id: u64,
    stream: UnixStream,
    adapter: &ActiveAdapter,
    handler: &PromptHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let (outbound_tx, outbound_rx) = mpsc::channel::<StructuredMessage>(OUTBOUND_QUEUE_DEPTH);
    let writer_task = tokio::spawn(writer_loop(conn_id, write_half, outbound_rx));

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            frame = read_next_valid_frame(conn_id, &mut reader) => {
                let Some(message) = frame else { break };
                match message {
                    StructuredMessage::PromptRequest(request) => {
                        debug!(
                            event = "tunnel_prompt_request",
                            conn_id,
                            request_id = %request.request_id,
                            prompt_type = %request.kind(),
                        );
                        let responder = PromptResponder {
                            request_id: request.request_id.clone(),
                            outbound: outbound_tx.clone(),
                        };
                        (handler)(request, responder);
                    }
                    StructuredMessage::PromptResponse(response) => {
                        debug!(
                            event = "tunnel_unexpected_response",
                            conn_id,
                            request_id = %response.request_id,
                        );
                    }
                    StructuredMessage::Goodbye { .. } => break,
                    other => forward_to_adapter(adapter, other),
                }
            }
        }
    }

    drop(outbound_tx);
    if let Err(err) = writer_task.await {
        warn!(event = "tunnel_writer_join_error", conn_id, error = %err);
    }
}

/// Read frames until one decodes, the peer hangs up, or the read fails.
/// Malformed lines are logged and skipped.
async fn read_next_valid_frame(
    conn_id: u64,
    reader: &mut BufReader<OwnedReadHalf>,
) -> Option<StructuredMessage> {
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return None,
            Ok(_) => {
                if line.iter().all(|byte| byte.is_ascii_whitespace()) {
                    continue;
                }
                match decode_line(&line) {
                    Ok(message) => return Some(message),
                    Err(err) => {
                        warn!(event = "tunnel_bad_frame", conn_id, error = %err);
                    }
                }
            }
            Err(err) => {
                warn!(event = "tunnel_read_error", conn_id, error = %err);
                return None;
            }
        }
    }
}

async fn writer_loop(
    conn_id: u64,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<StructuredMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let encoded = match encode_line(&message) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(event = "tunnel_encode_error", conn_id, error = %err);
                continue;
            }
        };
        match tokio::time::timeout(WRITE_TIMEOUT, writer.write_all(&encoded)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(event = "tunnel_write_error", conn_id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "tunnel_write_timeout", conn_id);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

fn forward_to_adapter(adapter: &ActiveAdapter, message: StructuredMessage) {
    match &message {
        StructuredMessage::Log { message: text, .. } => adapter.log(text),
        StructuredMessage::Warn { message: text, .. } => adapter.warn(text),
        StructuredMessage::Error { message: text, .. } => adapter.error(text),
        StructuredMessage::Debug { message: text, .. } => adapter.debug_log(text),
        StructuredMessage::Stdout { data, .. } => adapter.write_stdout(data),
        StructuredMessage::Stderr { data, .. } => adapter.write_stderr(data),
        _ => adapter.send_structured(&message),
    }
}
