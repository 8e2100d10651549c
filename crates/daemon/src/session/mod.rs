//! The shared shell.
//!
//! The PTY, the single input writer, the output reader and the filter that
//! strips terminal control sequences before output reaches viewers.

pub mod filter;
pub mod pty;
pub mod reader;
pub mod terminal;
pub mod writer;

pub use filter::{strip_control, OutputFilter};
pub use pty::{PtySession, SessionError, SessionStatus};
pub use reader::{OutputReader, ReaderExit};
pub use terminal::PtyTerminal;
pub use writer::InputWriter;
