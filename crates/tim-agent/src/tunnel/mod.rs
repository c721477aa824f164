//! Unix-socket tunnel between a host process and a subagent it spawned.
//! The host side listens ([`TunnelServer`]); the subagent side connects
//! ([`TunnelAdapter`]) and forwards all of its output plus prompt requests
//! over the socket.

mod client;
mod server;

pub use client::TunnelAdapter;
pub use server::{PromptHandler, PromptResponder, TunnelServer};
