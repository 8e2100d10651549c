//! # FunnyShell Daemon Library
//!
//! This crate provides the daemon (server) functionality for FunnyShell: a
//! single shell that every connected browser watches and types into.
//!
//! ## Overview
//!
//! The daemon runs one shell inside a pseudo-terminal and serves it over
//! WebSocket. It provides:
//!
//! - **Shared Shell**: One PTY with a scrubbed environment and fixed geometry
//! - **Session Hub**: Serialized fan-out of output, chat and join/leave notices
//! - **Client Sessions**: Per-connection pumps with keepalive and eviction of
//!   slow viewers
//! - **Web Surface**: WebSocket endpoint, health probe and static viewer page
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │ Output Reader│─▶│     Hub      │─▶│  Client Sessions     │   │
//! │  └──────▲───────┘  └──────┬───────┘  └──────────┬───────────┘   │
//! │         │                 │                     │               │
//! │  ┌──────┴─────────────────▼───────┐  ┌──────────▼───────────┐   │
//! │  │  PTY Session + Input Writer    │  │  HTTP / WebSocket    │   │
//! │  └────────────────────────────────┘  └──────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config);
//!     let addr = orchestrator.start().await?;
//!     println!("open http://{}", addr);
//!
//!     orchestrator.wait_for_shell_exit().await;
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY, input writer, output reader and output filter
//! - [`hub`]: The event loop that owns the participant registry
//! - [`client`]: Per-connection WebSocket pumps
//! - [`server`]: HTTP routes and listener
//! - [`orchestrator`]: Main daemon coordinator

pub mod client;
pub mod config;
pub mod hub;
pub mod orchestrator;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export hub types for convenience
pub use hub::{ClientHandle, ClientId, Hub, HubError, HubHandle, Participant, Terminal};

// Re-export session types for convenience
pub use session::{
    strip_control, InputWriter, OutputFilter, OutputReader, PtySession, PtyTerminal, ReaderExit,
    SessionError, SessionStatus,
};

// Re-export server types for convenience
pub use server::{create_router, AppState, ServerError};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorState};
