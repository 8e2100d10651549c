//! # FunnyShell Protocol Library
//!
//! Wire definitions shared by the FunnyShell daemon and its clients.
//!
//! ## Overview
//!
//! Every participant of a shared shell talks to the daemon over a WebSocket
//! carrying JSON text frames:
//!
//! ```text
//! { "type": "output" | "input" | "chat" | "input_info" | "system" | "ping" | "resize",
//!   "data": "<payload>",
//!   "user": "<display name>"   // only on attributed messages
//! }
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Message, MessageKind};
//!
//! let msg = Message::from_json(r#"{"type":"input","data":"ls\n"}"#).unwrap();
//! assert_eq!(msg.kind(), MessageKind::Input);
//!
//! let notice = Message::input_info("alice", msg.data());
//! assert_eq!(notice.data(), "alice: ls");
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Message model and JSON encoding
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{Message, MessageKind};
