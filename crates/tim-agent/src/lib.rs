//! Output forwarding and interactive prompt plumbing for agent processes.
//! An agent's output and prompts flow through whichever adapter is in
//! scope: a Unix-socket tunnel to a host process, a headless WebSocket
//! control plane, or the plain console.

pub mod error;
pub mod headless;
pub mod input;
pub mod logger;
pub mod prompt;
pub mod tty;
pub mod tunnel;

pub use error::{is_prompt_timeout_error, PromptError};
pub use headless::{control_plane_url, HeadlessAdapter, HeadlessConfig, PromptWait, WaitCancel};
pub use logger::{
    logger_adapter, run_with_logger, spawn_with_logger, ActiveAdapter, AdapterKind,
    ConsoleAdapter, LoggerAdapter,
};
pub use prompt::{AbortSignal, Prompter, TerminalPrompt};
pub use tty::TtyPrompt;
pub use tunnel::{PromptHandler, PromptResponder, TunnelAdapter, TunnelServer};
