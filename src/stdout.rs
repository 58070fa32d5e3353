use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::error;

use crate::mux::{MuxReader, READ_BUFFER_SIZE};

/// Spawn a task which copies a device's output to stdout, one line at a time.
///
/// The raw stream is line-buffered so output from multiple devices stays
/// readable; writes are serialized under the shared lock. When `prefix` is
/// set it is prepended to every line.
pub fn spawn_logger(
    prefix: Option<String>,
    mut reader: MuxReader,
    stdout_lock: Arc<Mutex<()>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut pending = Vec::new();

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => return,
                Ok(n) => n,
                Err(err) => {
                    error!("copying serial to stdout: {err}");
                    return;
                }
            };

            pending.extend_from_slice(&buf[..n]);

            for line in drain_lines(&mut pending) {
                let _guard = stdout_lock.lock().expect("stdout lock");
                match &prefix {
                    Some(prefix) => println!("{prefix}{line}"),
                    None => println!("{line}"),
                }
            }
        }
    })
}

/// Remove every complete line from `pending`, leaving any trailing partial
/// line in place. Line endings (`\n`, with an optional preceding `\r`) are
/// stripped.
fn drain_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();

    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        lines.push(String::from_utf8_lossy(&line).into_owned());
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_complete_lines_only() {
        let mut pending = b"one\ntwo\r\nthree".to_vec();

        let lines = drain_lines(&mut pending);
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(pending, b"three");

        pending.extend_from_slice(b"\n");
        let lines = drain_lines(&mut pending);
        assert_eq!(lines, vec!["three".to_string()]);
        assert!(pending.is_empty());
    }

    #[test]
    fn handles_empty_and_partial_input() {
        let mut pending = Vec::new();
        assert!(drain_lines(&mut pending).is_empty());

        pending.extend_from_slice(b"no newline yet");
        assert!(drain_lines(&mut pending).is_empty());
        assert_eq!(pending, b"no newline yet");
    }
}
