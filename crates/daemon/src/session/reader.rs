//! Shell output pump.
//!
//! Reads the PTY in small chunks on the blocking pool, filters each chunk and
//! hands it to the hub. The hub inbox is bounded, so a busy hub slows the
//! reader down instead of letting output pile up in memory.

use std::io::{ErrorKind, Read};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use protocol::Message;
use tokio::task::JoinHandle;

use super::filter::OutputFilter;
use crate::hub::HubHandle;

/// Bytes requested per read.
const READ_BUFFER_SIZE: usize = 1024;

/// Pause after a read error before trying again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Why the output reader stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// The shell closed its side of the PTY.
    EndOfStream,
    /// The hub stopped accepting events.
    HubClosed,
}

/// Spawns the task that pumps shell output into the hub.
pub struct OutputReader;

impl OutputReader {
    pub fn spawn<R>(reader: R, hub: HubHandle) -> JoinHandle<ReaderExit>
    where
        R: Read + Send + 'static,
    {
        let reader = Arc::new(Mutex::new(reader));

        tokio::spawn(async move {
            let mut filter = OutputFilter::new();

            let exit = loop {
                let reader_clone = Arc::clone(&reader);

                let result = tokio::task::spawn_blocking(move || {
                    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                    let mut reader = reader_clone
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    reader.read(&mut buffer).map(|n| {
                        buffer.truncate(n);
                        buffer
                    })
                })
                .await;

                match result {
                    Ok(Ok(data)) if data.is_empty() => break ReaderExit::EndOfStream,
                    Ok(Ok(data)) => {
                        let text = filter.push(&data);
                        if text.is_empty() {
                            tracing::trace!(bytes = data.len(), "Output filtered to nothing");
                            continue;
                        }
                        if hub.broadcast(Message::output(text)).await.is_err() {
                            break ReaderExit::HubClosed;
                        }
                    }
                    Ok(Err(e)) if is_end_of_stream(&e) => break ReaderExit::EndOfStream,
                    Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => continue,
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "Error reading from PTY");
                        tokio::time::sleep(READ_ERROR_BACKOFF).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Read task panicked");
                        break ReaderExit::EndOfStream;
                    }
                }
            };

            if exit == ReaderExit::EndOfStream {
                let rest = filter.flush();
                if !rest.is_empty() {
                    let _ = hub.broadcast(Message::output(rest)).await;
                }
                tracing::info!("Shell output closed");
            } else {
                tracing::debug!("Hub closed, output reader stopping");
            }

            exit
        })
    }
}

/// A Linux PTY master reports EIO once the last slave descriptor closes.
fn is_end_of_stream(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(Errno::EIO as i32)
}
