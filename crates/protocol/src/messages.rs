//! Protocol message definitions for FunnyShell.
//!
//! Every frame exchanged over the WebSocket, in either direction, is a JSON
//! object of the shape `{"type": ..., "data": ..., "user": ...}`. The `user`
//! field is only present on messages attributed to a participant.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The discriminant of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Shell output, server to client.
    Output,
    /// Keystrokes for the shared shell, client to server.
    Input,
    /// Chat line between participants.
    Chat,
    /// Attribution of an input to the participant who typed it.
    InputInfo,
    /// Join/leave notices produced by the server.
    System,
    /// Application-level liveness message.
    Ping,
    /// Terminal size request from a client.
    Resize,
}

impl MessageKind {
    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Output => "output",
            MessageKind::Input => "input",
            MessageKind::Chat => "chat",
            MessageKind::InputInfo => "input_info",
            MessageKind::System => "system",
            MessageKind::Ping => "ping",
            MessageKind::Resize => "resize",
        }
    }

    /// Returns true for kinds that only the server may originate.
    pub fn is_server_only(&self) -> bool {
        matches!(
            self,
            MessageKind::Output | MessageKind::InputInfo | MessageKind::System
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single protocol message.
///
/// Messages are plain values: once built they are only cloned and read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default)]
    data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

impl Message {
    /// Creates a message without a user attribution.
    pub fn new(kind: MessageKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
            user: None,
        }
    }

    /// Creates a message attributed to `user`.
    pub fn from_user(kind: MessageKind, data: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
            user: Some(user.into()),
        }
    }

    /// Shell output.
    pub fn output(data: impl Into<String>) -> Self {
        Self::new(MessageKind::Output, data)
    }

    /// Server notice (joins, leaves).
    pub fn system(data: impl Into<String>) -> Self {
        Self::new(MessageKind::System, data)
    }

    /// Chat line from `user`.
    pub fn chat(user: impl Into<String>, data: impl Into<String>) -> Self {
        Self::from_user(MessageKind::Chat, data, user)
    }

    /// Attribution of `input` to `user`.
    ///
    /// The input is trimmed of surrounding whitespace so the notice reads as
    /// a single line regardless of the trailing newline sent to the shell.
    pub fn input_info(user: impl Into<String>, input: &str) -> Self {
        let user = user.into();
        let data = format!("{}: {}", user, input.trim());
        Self::from_user(MessageKind::InputInfo, data, user)
    }

    /// Returns the kind of this message.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Returns the payload.
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Returns the originating user, if any.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Encodes the message as a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a message from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    #[test]
    fn test_output_wire_shape_omits_user() {
        let json = Message::output("hello\r\n").to_json().unwrap();
        assert_eq!(json, r#"{"type":"output","data":"hello\r\n"}"#);
    }

    #[test]
    fn test_chat_wire_shape_includes_user() {
        let json = Message::chat("alice", "hi all").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "chat");
        assert_eq!(value["data"], "hi all");
        assert_eq!(value["user"], "alice");
    }

    #[test]
    fn test_input_info_kind_is_snake_case() {
        let msg = Message::input_info("bob", "  ls -la\n");
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "input_info");
        assert_eq!(value["data"], "bob: ls -la");
        assert_eq!(value["user"], "bob");
    }

    #[test]
    fn test_decode_client_input() {
        let msg = Message::from_json(r#"{"type":"input","data":"echo hi\n"}"#).unwrap();
        assert_eq!(msg.kind(), MessageKind::Input);
        assert_eq!(msg.data(), "echo hi\n");
        assert_eq!(msg.user(), None);
    }

    #[test]
    fn test_decode_ping_without_data() {
        let msg = Message::from_json(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg.kind(), MessageKind::Ping);
        assert_eq!(msg.data(), "");
    }

    #[test]
    fn test_decode_unknown_kind_fails() {
        let result = Message::from_json(r#"{"type":"explode","data":""}"#);
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_decode_malformed_fails() {
        let result = Message::from_json("not json at all");
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_all_kinds_decode_from_wire_names() {
        let kinds = [
            MessageKind::Output,
            MessageKind::Input,
            MessageKind::Chat,
            MessageKind::InputInfo,
            MessageKind::System,
            MessageKind::Ping,
            MessageKind::Resize,
        ];
        for kind in kinds {
            let text = format!(r#"{{"type":"{}","data":"x"}}"#, kind);
            let msg = Message::from_json(&text).unwrap();
            assert_eq!(msg.kind(), kind);
        }
    }

    #[test]
    fn test_server_only_kinds() {
        assert!(MessageKind::Output.is_server_only());
        assert!(MessageKind::System.is_server_only());
        assert!(MessageKind::InputInfo.is_server_only());
        assert!(!MessageKind::Input.is_server_only());
        assert!(!MessageKind::Chat.is_server_only());
        assert!(!MessageKind::Resize.is_server_only());
        assert!(!MessageKind::Ping.is_server_only());
    }
}
