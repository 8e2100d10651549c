//! Single writer for shell input.
//!
//! Every keystroke from every participant ends up here. One blocking task
//! owns the PTY writer and writes each queued buffer in full before taking
//! the next, so input from different participants never interleaves
//! mid-buffer and the hub never waits on the shell.

use std::io::Write;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// Number of input buffers that may wait for the shell.
pub const INPUT_QUEUE_CAPACITY: usize = 1024;

/// Handle for queueing input to the shell.
#[derive(Clone)]
pub struct InputWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl InputWriter {
    /// Starts the writer task over `writer`.
    ///
    /// The task ends once every handle has been dropped.
    pub fn spawn<W>(writer: W) -> (Self, JoinHandle<()>)
    where
        W: Write + Send + 'static,
    {
        Self::with_capacity(writer, INPUT_QUEUE_CAPACITY)
    }

    /// Starts the writer task with a custom queue capacity.
    pub fn with_capacity<W>(writer: W, capacity: usize) -> (Self, JoinHandle<()>)
    where
        W: Write + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(capacity);

        let handle = tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            while let Some(data) = rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    tracing::warn!(error = %e, bytes = data.len(), "Failed to write to shell");
                }
            }
            tracing::debug!("Input writer stopped");
        });

        (Self { tx }, handle)
    }

    /// Queues `data` for the shell without waiting.
    ///
    /// Returns false when the input is dropped because the queue is full or
    /// the writer has stopped.
    pub fn send(&self, data: Vec<u8>) -> bool {
        match self.tx.try_send(data) {
            Ok(()) => true,
            Err(TrySendError::Full(data)) => {
                tracing::warn!(bytes = data.len(), "Shell input queue full, dropping input");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Shell input writer closed, dropping input");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Accepts one byte per call to expose any interleaving.
    #[derive(Clone, Default)]
    struct TrickleWriter {
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for TrickleWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            match buf.first() {
                Some(byte) => {
                    self.written.lock().unwrap().push(*byte);
                    std::thread::yield_now();
                    Ok(1)
                }
                None => Ok(0),
            }
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_writes_in_order() {
        let sink = TrickleWriter::default();
        let (input, handle) = InputWriter::spawn(sink.clone());

        assert!(input.send(b"echo one\n".to_vec()));
        assert!(input.send(b"echo two\n".to_vec()));
        drop(input);
        handle.await.unwrap();

        assert_eq!(&*sink.written.lock().unwrap(), b"echo one\necho two\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_senders_never_interleave() {
        let sink = TrickleWriter::default();
        let (input, handle) = InputWriter::spawn(sink.clone());

        let mut tasks = Vec::new();
        for client in 0..8 {
            let input = input.clone();
            tasks.push(tokio::spawn(async move {
                for msg in 0..50 {
                    let line = format!("client-{}:message-{}\n", client, msg);
                    assert!(input.send(line.into_bytes()));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        drop(input);
        handle.await.unwrap();

        let written = String::from_utf8(sink.written.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 400);
        for line in lines {
            let (client, message) = line.split_once(':').expect("whole line");
            assert!(client.starts_with("client-"), "mangled line: {line:?}");
            assert!(message.starts_with("message-"), "mangled line: {line:?}");
            assert!(!message.contains("client-"), "interleaved line: {line:?}");
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_input() {
        struct Blocked(std::sync::mpsc::Receiver<()>);
        impl Write for Blocked {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                let _ = self.0.recv();
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let (release, gate) = std::sync::mpsc::channel();
        let (input, handle) = InputWriter::with_capacity(Blocked(gate), 1);

        // First buffer is picked up by the writer and blocks it, second fills
        // the queue, so the third must be dropped.
        assert!(input.send(b"a".to_vec()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(input.send(b"b".to_vec()));
        assert!(!input.send(b"c".to_vec()));

        drop(release);
        drop(input);
        handle.await.unwrap();
    }
}
