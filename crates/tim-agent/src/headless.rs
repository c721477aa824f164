//! Headless control-plane adapter. Mirrors everything the agent emits to a
//! WebSocket endpoint, replays undelivered backlog after each (re)connect,
//! and lets the prompt layer wait for remote answers by request id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use tim_core::{PromptResponseMessage, StructuredMessage};

use crate::logger::{ConsoleAdapter, LoggerAdapter};

pub const CONTROL_PLANE_PATH: &str = "/tim-agent";

const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(1_000);
const MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Normalize a control-plane URL: a bare host gets the fixed agent path.
pub fn control_plane_url(base: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base)?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(CONTROL_PLANE_PATH);
    }
    Ok(url)
}

#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    pub url: Url,
    /// Command line the agent is running, sent in the handshake frame.
    pub command: Option<String>,
    pub reconnect_interval: Duration,
}

impl HeadlessConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            command: None,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

struct ReplayState {
    messages: Vec<StructuredMessage>,
    /// Count of messages confirmed written to the control plane. Everything
    /// past the watermark is backlog for the next drain.
    watermark: usize,
}

struct HeadlessShared {
    buffer: StdMutex<ReplayState>,
    outbound: Notify,
    pending: StdMutex<HashMap<String, oneshot::Sender<PromptResponseMessage>>>,
    /// Bumped after each replay_end; doubles as a session counter.
    ready: watch::Sender<u64>,
    destroyed: AtomicBool,
}

impl HeadlessShared {
    fn append(&self, message: StructuredMessage) {
        self.buffer.lock().unwrap().messages.push(message);
        self.outbound.notify_one();
    }

    fn handle_incoming(&self, text: &str) {
        match serde_json::from_str::<StructuredMessage>(text) {
            Ok(StructuredMessage::PromptResponse(response)) => self.resolve(response),
            Ok(other) => {
                debug!(event = "headless_ignored_frame", frame_type = ?std::mem::discriminant(&other));
            }
            Err(err) => {
                warn!(event = "headless_bad_frame", error = %err);
            }
        }
    }

    fn resolve(&self, response: PromptResponseMessage) {
        let sender = self.pending.lock().unwrap().remove(&response.request_id);
        match sender {
            Some(sender) => {
                let _ = sender.send(response);
            }
            None => {
                debug!(event = "headless_unmatched_response", request_id = %response.request_id);
            }
        }
    }
}

/// Registration for one remote answer. `recv` yields the response, or
/// `None` once the registration was cancelled or the adapter destroyed; a
/// cancelled registration never yields a response afterwards.
pub struct PromptWait {
    rx: oneshot::Receiver<PromptResponseMessage>,
    cancel: WaitCancel,
}

impl PromptWait {
    pub async fn recv(&mut self) -> Option<PromptResponseMessage> {
        (&mut self.rx).await.ok()
    }

    pub fn cancel_handle(&self) -> WaitCancel {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
pub struct WaitCancel {
    shared: Arc<HeadlessShared>,
    request_id: String,
}

impl WaitCancel {
    /// Remove the registration. Idempotent, and a no-op after the response
    /// already resolved.
    pub fn cancel(&self) {
        self.shared.pending.lock().unwrap().remove(&self.request_id);
    }
}

pub struct HeadlessAdapter {
    shared: Arc<HeadlessShared>,
    shutdown: watch::Sender<bool>,
    session_task: StdMutex<Option<JoinHandle<()>>>,
    local: ConsoleAdapter,
}

impl HeadlessAdapter {
    pub fn new(config: HeadlessConfig) -> Self {
        let shared = Arc::new(HeadlessShared {
            buffer: StdMutex::new(ReplayState {
                messages: Vec::new(),
                watermark: 0,
            }),
            outbound: Notify::new(),
            pending: StdMutex::new(HashMap::new()),
            ready: watch::channel(0).0,
            destroyed: AtomicBool::new(false),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session_task = tokio::spawn(session_loop(shared.clone(), config, shutdown_rx));
        Self {
            shared,
            shutdown: shutdown_tx,
            session_task: StdMutex::new(Some(session_task)),
            local: ConsoleAdapter::new(),
        }
    }

    /// Register interest in the remote answer for `request_id`. Call before
    /// the request is broadcast so an instant answer cannot slip past.
    pub fn wait_for_prompt_response(&self, request_id: &str) -> PromptWait {
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(request_id.to_string(), tx);
        PromptWait {
            rx,
            cancel: WaitCancel {
                shared: self.shared.clone(),
                request_id: request_id.to_string(),
            },
        }
    }

    /// Resolves once the first replay has finished and live traffic is
    /// flowing.
    pub async fn wait_until_ready(&self) {
        self.wait_for_sessions(1).await;
    }

    /// Resolves once at least `sessions` connect-and-replay cycles have
    /// completed.
    pub async fn wait_for_sessions(&self, sessions: u64) {
        let mut rx = self.shared.ready.subscribe();
        while *rx.borrow() < sessions {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop reconnecting, close the socket, and cancel every registered
    /// wait. Safe to call more than once.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        self.shared.outbound.notify_one();
        let drained: Vec<_> = self.shared.pending.lock().unwrap().drain().collect();
        for (request_id, sender) in drained {
            debug!(event = "headless_wait_cancelled", request_id = %request_id);
            drop(sender);
        }
        // The session loop exits on the shutdown signal; detach the handle.
        let _ = self.session_task.lock().unwrap().take();
    }

    /// Wait until the backlog has drained to the control plane, or the
    /// timeout elapses.
    pub async fn flush(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let state = self.shared.buffer.lock().unwrap();
                if state.watermark >= state.messages.len() {
                    return;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn buffered_messages(&self) -> Vec<StructuredMessage> {
        self.shared.buffer.lock().unwrap().messages.clone()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn deliver_response(&self, response: PromptResponseMessage) {
        self.shared.resolve(response);
    }
}

impl Drop for HeadlessAdapter {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl LoggerAdapter for HeadlessAdapter {
    fn log(&self, message: &str) {
        self.local.log(message);
        self.shared.append(StructuredMessage::log(message));
    }

    fn error(&self, message: &str) {
        self.local.error(message);
        self.shared.append(StructuredMessage::error(message));
    }

    fn warn(&self, message: &str) {
        self.local.warn(message);
        self.shared.append(StructuredMessage::warn(message));
    }

    fn write_stdout(&self, data: &str) {
        self.local.write_stdout(data);
        self.shared.append(StructuredMessage::stdout(data));
    }

    fn write_stderr(&self, data: &str) {
        self.local.write_stderr(data);
        self.shared.append(StructuredMessage::stderr(data));
    }

    fn debug_log(&self, message: &str) {
        self.local.debug_log(message);
        self.shared.append(StructuredMessage::debug(message));
    }

    fn send_structured(&self, message: &StructuredMessage) {
        self.shared.append(message.clone());
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current + current).min(MAX_RECONNECT_INTERVAL)
}

/// True if shutdown fired during the wait.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

async fn session_loop(
    shared: Arc<HeadlessShared>,
    config: HeadlessConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = config.reconnect_interval;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let connected = tokio::select! {
            _ = shutdown.changed() => continue,
            connected = connect_async(config.url.as_str()) => connected,
        };
        let mut ws = match connected {
            Ok((ws, _)) => ws,
            Err(err) => {
                debug!(event = "headless_connect_error", url = %config.url, error = %err);
                if wait_or_shutdown(&mut shutdown, backoff).await {
                    break;
                }
                backoff = next_backoff(backoff);
                continue;
            }
        };
        info!(event = "headless_connected", url = %config.url);
        backoff = config.reconnect_interval;

        let shutdown_requested = run_session(&shared, &config, &mut ws, &mut shutdown).await;
        let _ = ws.close(None).await;
        if shutdown_requested {
            break;
        }
        warn!(event = "headless_disconnected", url = %config.url);
        if wait_or_shutdown(&mut shutdown, config.reconnect_interval).await {
            break;
        }
    }
    debug!(event = "headless_session_loop_done");
}

/// One connected session: handshake, replay, then live traffic. Returns
/// true when shutdown was requested, false on connection loss.
async fn run_session(
    shared: &Arc<HeadlessShared>,
    config: &HeadlessConfig,
    ws: &mut WsStream,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    if send_message(ws, &StructuredMessage::hello(config.command.clone()))
        .await
        .is_err()
    {
        return false;
    }
    if drain_backlog(shared, ws).await.is_err() {
        return false;
    }
    if send_message(ws, &StructuredMessage::replay_end()).await.is_err() {
        return false;
    }
    shared.ready.send_modify(|sessions| *sessions += 1);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
            _ = shared.outbound.notified() => {
                if drain_backlog(shared, ws).await.is_err() {
                    return false;
                }
            }
            incoming = ws.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => shared.handle_incoming(&text),
                    Some(Ok(Message::Close(_))) | None => return false,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "headless_ws_error", error = %err);
                        return false;
                    }
                }
            }
        }
    }
}

/// Send everything past the watermark, advancing it per confirmed write.
/// Messages appended mid-drain are picked up in the same pass.
async fn drain_backlog(shared: &Arc<HeadlessShared>, ws: &mut WsStream) -> Result<(), ()> {
    loop {
        let next = {
            let state = shared.buffer.lock().unwrap();
            state.messages.get(state.watermark).cloned()
        };
        let Some(message) = next else {
            return Ok(());
        };
        if send_message(ws, &message).await.is_err() {
            return Err(());
        }
        shared.buffer.lock().unwrap().watermark += 1;
    }
}

async fn send_message(ws: &mut WsStream, message: &StructuredMessage) -> Result<(), ()> {
    let encoded = match serde_json::to_string(message) {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!(event = "headless_encode_error", error = %err);
            return Ok(());
        }
    };
    ws.send(Message::Text(encoded)).await.map_err(|err| {
        warn!(event = "headless_send_error", error = %err);
    })
}
