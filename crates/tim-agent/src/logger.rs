use std::future::Future;
use std::io::Write;
use std::sync::{Arc, OnceLock};

use tim_core::StructuredMessage;
use tokio::task::JoinHandle;

use crate::headless::HeadlessAdapter;
use crate::tunnel::TunnelAdapter;

/// Output surface for everything the agent emits: human-readable log lines,
/// raw stream passthrough, and structured protocol events.
pub trait LoggerAdapter: Send + Sync {
    fn log(&self, message: &str);
    fn error(&self, message: &str);
    fn warn(&self, message: &str);
    fn write_stdout(&self, data: &str);
    fn write_stderr(&self, data: &str);
    fn debug_log(&self, message: &str);
    fn send_structured(&self, message: &StructuredMessage);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Console,
    Tunnel,
    Headless,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Console => "console",
            AdapterKind::Tunnel => "tunnel",
            AdapterKind::Headless => "headless",
        }
    }
}

/// The adapter currently in force, tagged so callers can branch on the
/// channel rather than probing for capabilities.
#[derive(Clone)]
pub enum ActiveAdapter {
    Console(Arc<ConsoleAdapter>),
    Tunnel(Arc<TunnelAdapter>),
    Headless(Arc<HeadlessAdapter>),
}

impl ActiveAdapter {
    pub fn kind(&self) -> AdapterKind {
        match self {
            ActiveAdapter::Console(_) => AdapterKind::Console,
            ActiveAdapter::Tunnel(_) => AdapterKind::Tunnel,
            ActiveAdapter::Headless(_) => AdapterKind::Headless,
        }
    }

    fn inner(&self) -> &dyn LoggerAdapter {
        match self {
            ActiveAdapter::Console(adapter) => adapter.as_ref(),
            ActiveAdapter::Tunnel(adapter) => adapter.as_ref(),
            ActiveAdapter::Headless(adapter) => adapter.as_ref(),
        }
    }
}

impl LoggerAdapter for ActiveAdapter {
    fn log(&self, message: &str) {
        self.inner().log(message)
    }

    fn error(&self, message: &str) {
        self.inner().error(message)
    }

    fn warn(&self, message: &str) {
        self.inner().warn(message)
    }

    fn write_stdout(&self, data: &str) {
        self.inner().write_stdout(data)
    }

    fn write_stderr(&self, data: &str) {
        self.inner().write_stderr(data)
    }

    fn debug_log(&self, message: &str) {
        self.inner().debug_log(message)
    }

    fn send_structured(&self, message: &StructuredMessage) {
        self.inner().send_structured(message)
    }
}

tokio::task_local! {
    static CURRENT_ADAPTER: ActiveAdapter;
}

/// Run `fut` with `adapter` as the ambient logger. Scopes nest: the inner
/// adapter wins for the duration of the inner future and the outer one is
/// back in force afterwards.
pub async fn run_with_logger<F>(adapter: ActiveAdapter, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_ADAPTER.scope(adapter, fut).await
}

/// The ambient adapter for the current task, falling back to a shared
/// console adapter outside any `run_with_logger` scope.
pub fn logger_adapter() -> ActiveAdapter {
    CURRENT_ADAPTER
        .try_with(|adapter| adapter.clone())
        .unwrap_or_else(|_| ActiveAdapter::Console(default_console()))
}

/// Spawn a task that keeps the caller's ambient adapter. Task-locals do not
/// cross `tokio::spawn` on their own, so the adapter is captured explicitly.
pub fn spawn_with_logger<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let adapter = logger_adapter();
    tokio::spawn(run_with_logger(adapter, fut))
}

fn default_console() -> Arc<ConsoleAdapter> {
    static DEFAULT: OnceLock<Arc<ConsoleAdapter>> = OnceLock::new();
    DEFAULT
        .get_or_init(|| Arc::new(ConsoleAdapter::new()))
        .clone()
}

/// Plain stdout/stderr adapter used when no tunnel or control plane is
/// attached.
#[derive(Debug, Default)]
pub struct ConsoleAdapter;

impl ConsoleAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl LoggerAdapter for ConsoleAdapter {
    fn log(&self, message: &str) {
        println!("{message}");
    }

    fn error(&self, message: &str) {
        eprintln!("{message}");
    }

    fn warn(&self, message: &str) {
        eprintln!("{message}");
    }

    fn write_stdout(&self, data: &str) {
        let mut out = std::io::stdout();
        let _ = out.write_all(data.as_bytes());
        let _ = out.flush();
    }

    fn write_stderr(&self, data: &str) {
        let mut out = std::io::stderr();
        let _ = out.write_all(data.as_bytes());
        let _ = out.flush();
    }

    fn debug_log(&self, message: &str) {
        tracing::debug!(event = "console_debug", message);
    }

    fn send_structured(&self, message: &StructuredMessage) {
        match serde_json::to_string(message) {
            Ok(encoded) => tracing::debug!(event = "console_structured", frame = %encoded),
            Err(err) => tracing::warn!(event = "console_structured_error", error = %err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn console_ptr(adapter: &ActiveAdapter) -> *const ConsoleAdapter {
        match adapter {
            ActiveAdapter::Console(console) => Arc::as_ptr(console),
            _ => panic!("expected a console adapter"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scopes_nest_and_restore() {
        let outer = Arc::new(ConsoleAdapter::new());
        let inner = Arc::new(ConsoleAdapter::new());
        let outer_ptr = Arc::as_ptr(&outer);
        let inner_ptr = Arc::as_ptr(&inner);

        run_with_logger(ActiveAdapter::Console(outer), async move {
            assert_eq!(console_ptr(&logger_adapter()), outer_ptr);

            run_with_logger(ActiveAdapter::Console(inner), async move {
                assert_eq!(console_ptr(&logger_adapter()), inner_ptr);
            })
            .await;

            assert_eq!(console_ptr(&logger_adapter()), outer_ptr);
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn outside_any_scope_falls_back_to_console() {
        assert_eq!(logger_adapter().kind(), AdapterKind::Console);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawned_tasks_keep_the_scoped_adapter() {
        let scoped = Arc::new(ConsoleAdapter::new());
        let scoped_ptr = Arc::as_ptr(&scoped) as usize;

        run_with_logger(ActiveAdapter::Console(scoped), async move {
            let handle = spawn_with_logger(async move {
                console_ptr(&logger_adapter()) as usize
            });
            assert_eq!(handle.await.expect("join"), scoped_ptr);
        })
        .await;
    }
}
