use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use tokio::sync::{Mutex, MutexGuard};

/// A background consumer of terminal input (key handler, REPL reader) that
/// must stand down while a prompt owns stdin.
pub trait InputSource: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}

/// Process-wide registry for the active input source plus the gate that
/// serializes prompts. One prompt holds stdin at a time.
pub struct InputRegistry {
    gate: Mutex<()>,
    source: StdMutex<Option<Arc<dyn InputSource>>>,
}

pub fn registry() -> &'static InputRegistry {
    static REGISTRY: OnceLock<InputRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| InputRegistry {
        gate: Mutex::new(()),
        source: StdMutex::new(None),
    })
}

impl InputRegistry {
    pub fn register(&self, source: Arc<dyn InputSource>) {
        *self.source.lock().unwrap() = Some(source);
    }

    pub fn clear(&self) {
        *self.source.lock().unwrap() = None;
    }

    /// Acquire the prompt gate and pause the registered source. The returned
    /// guard resumes it on drop, which covers every exit path including
    /// panics and early returns.
    pub async fn pause_for_prompt(&self) -> PromptGuard<'_> {
        let gate = self.gate.lock().await;
        let source = self.source.lock().unwrap().clone();
        if let Some(source) = &source {
            source.pause();
        }
        PromptGuard {
            _gate: gate,
            source,
        }
    }
}

pub struct PromptGuard<'a> {
    _gate: MutexGuard<'a, ()>,
    source: Option<Arc<dyn InputSource>>,
}

impl Drop for PromptGuard<'_> {
    fn drop(&mut self) {
        if let Some(source) = &self.source {
            source.resume();
        }
    }
}
