//! A mock console device, useful to exercise the mux and session proxy
//! without real serial ports.

use std::fmt::Display;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::device::Device;

/// What the mock produces on its next read.
#[derive(Debug)]
enum MockRead {
    Data(Vec<u8>),
    Error(io::Error),
}

/// An in-memory [`Device`].
///
/// Reads yield whatever is fed through the paired [`MockHandle`]; writes are
/// recorded for later inspection.
#[derive(Debug)]
pub struct MockDevice {
    name: String,
    incoming: Mutex<mpsc::Receiver<MockRead>>,
    written: std::sync::Mutex<Vec<u8>>,
    write_notify: Notify,
    closed: CancellationToken,
}

/// The feeding side of a [`MockDevice`].
#[derive(Debug, Clone)]
pub struct MockHandle {
    incoming: mpsc::Sender<MockRead>,
}

impl MockDevice {
    /// Create a mock device and the handle used to drive it.
    pub fn new(name: &str) -> (Arc<Self>, MockHandle) {
        let (incoming_tx, incoming_rx) = mpsc::channel(32);

        let device = Arc::new(Self {
            name: name.to_string(),
            incoming: Mutex::new(incoming_rx),
            written: std::sync::Mutex::new(Vec::new()),
            write_notify: Notify::new(),
            closed: CancellationToken::new(),
        });

        (device, MockHandle {
            incoming: incoming_tx,
        })
    }

    /// A snapshot of everything written to the device so far.
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().expect("mock write lock").clone()
    }

    /// Wait until at least one write has been observed.
    pub async fn wait_for_write(&self) {
        self.write_notify.notified().await;
    }
}

impl MockHandle {
    /// Feed bytes which the device will yield on a subsequent read.
    pub async fn feed(&self, bytes: Vec<u8>) {
        self.incoming
            .send(MockRead::Data(bytes))
            .await
            .expect("mock device receiver should be alive");
    }

    /// Make the device's next read fail with the given error.
    pub fn fail(&self, err: io::Error) {
        let _ = self.incoming.try_send(MockRead::Error(err));
    }

    /// Close the feeding side; the device reads end-of-stream afterwards.
    pub fn close(self) {}
}

#[async_trait]
impl Device for MockDevice {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut incoming = self.incoming.lock().await;

        let item = tokio::select! {
            _ = self.closed.cancelled() => return Ok(0),
            item = incoming.recv() => item,
        };

        match item {
            // All handles dropped: end-of-stream.
            None => Ok(0),
            Some(MockRead::Error(err)) => Err(err),
            Some(MockRead::Data(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        self.written
            .lock()
            .expect("mock write lock")
            .extend_from_slice(buf);
        self.write_notify.notify_one();
        Ok(buf.len())
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

impl Display for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}
