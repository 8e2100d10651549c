//! The real shell behind the hub's [`Terminal`] seam.

use std::sync::Arc;

use crate::hub::Terminal;

use super::pty::PtySession;
use super::writer::InputWriter;

/// Routes hub input to the input writer and resizes to the PTY.
pub struct PtyTerminal {
    session: Arc<PtySession>,
    input: InputWriter,
}

impl PtyTerminal {
    pub fn new(session: Arc<PtySession>, input: InputWriter) -> Self {
        Self { session, input }
    }
}

impl Terminal for PtyTerminal {
    fn write_input(&self, data: Vec<u8>) {
        self.input.send(data);
    }

    fn reset_size(&self) {
        if let Err(e) = self.session.resize_fixed() {
            tracing::warn!(error = %e, "Failed to reset terminal size");
        }
    }
}
