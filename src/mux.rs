use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::device::Device;

/// The size of the scratch buffer used for upstream reads.
///
/// Consumers which present at least this much buffer space per read never
/// observe truncated payloads.
pub const READ_BUFFER_SIZE: usize = 8192;

/// A multiplexer over a device's read side which provides identical output to
/// any number of attached [`MuxReader`]s.
///
/// One internal task is the sole consumer of the upstream device. Every chunk
/// it reads is copied once and handed to each subscriber in turn. Delivery
/// channels are bounded at one event, the closest tokio equivalent of a
/// synchronous rendezvous: a subscriber which stops reading eventually blocks
/// dispatch, and with it every other subscriber. That backpressure is
/// deliberate. Serial consoles top out around 115200 baud, and delivering
/// every byte to every subscriber is worth more than keeping a stalled one
/// attached.
#[derive(Debug)]
pub struct Mux {
    subscribers: Arc<Mutex<Subscribers>>,
    reader: Mutex<Option<JoinHandle<io::Result<()>>>>,
}

#[derive(Debug, Default)]
struct Subscribers {
    next_id: u64,
    entries: HashMap<u64, Subscriber>,
}

/// A subscriber handle attached to the mux.
#[derive(Debug)]
struct Subscriber {
    events: mpsc::Sender<ReadEvent>,
    cancel: CancellationToken,
}

/// The result of one upstream read operation.
///
/// The payload is a freshly allocated copy of the bytes read, shared
/// read-only by every subscriber so the upstream scratch buffer can be reused
/// immediately.
///
/// A device read yields either bytes or an error, never both, so an event
/// carries a non-empty payload or a terminal error in its own final, empty
/// event.
#[derive(Debug, Clone)]
struct ReadEvent {
    payload: Bytes,
    error: Option<Arc<io::Error>>,
}

impl Mux {
    /// Create a mux over the input device's read side and start its reader
    /// task.
    pub fn new(device: Arc<dyn Device>) -> Self {
        let subscribers = Arc::new(Mutex::new(Subscribers::default()));

        let reader = tokio::spawn(read_loop(device, Arc::clone(&subscribers)));

        Self {
            subscribers,
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Attach a new subscriber.
    ///
    /// The returned reader yields exactly the bytes the mux observes from
    /// this moment onward; there is no replay of history. The subscriber is
    /// detached when `cancel` fires, at the latest during the dispatch of the
    /// next upstream read.
    pub async fn attach(&self, cancel: CancellationToken) -> MuxReader {
        let (events_tx, events_rx) = mpsc::channel(1);

        let mut subscribers = self.subscribers.lock().await;
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.entries.insert(
            id,
            Subscriber {
                events: events_tx,
                cancel: cancel.clone(),
            },
        );

        trace!(id, "attached mux subscriber");

        MuxReader {
            events: events_rx,
            cancel,
        }
    }

    /// Wait for the reader task to terminate and return its terminal error,
    /// if any.
    ///
    /// The reader terminates once the upstream device reports end-of-stream
    /// or fails; close the device first to unblock it.
    pub async fn close(&self) -> io::Result<()> {
        let reader = self.reader.lock().await.take();
        match reader {
            Some(handle) => handle
                .await
                .unwrap_or_else(|err| Err(io::Error::other(err))),
            None => Ok(()),
        }
    }
}

/// Read continuously from the device and pass any data and/or errors to each
/// of the attached subscribers.
async fn read_loop(device: Arc<dyn Device>, subscribers: Arc<Mutex<Subscribers>>) -> io::Result<()> {
    let mut scratch = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match device.read(&mut scratch).await {
            // End-of-stream and closed-pipe are clean termination.
            Ok(0) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => return Ok(()),

            Ok(n) => {
                let payload = Bytes::copy_from_slice(&scratch[..n]);
                dispatch(&subscribers, payload, None).await;
            }

            Err(err) => {
                // Deliver the terminal error to every current subscriber,
                // then stop; further reads would make no progress.
                let shared = Arc::new(err);
                dispatch(&subscribers, Bytes::new(), Some(Arc::clone(&shared))).await;
                return Err(clone_io_error(&shared));
            }
        }
    }
}

/// Dispatch one read event to every attached subscriber, detaching any whose
/// cancellation has fired.
async fn dispatch(
    subscribers: &Mutex<Subscribers>,
    payload: Bytes,
    error: Option<Arc<io::Error>>,
) {
    let mut subscribers = subscribers.lock().await;
    let mut detached = Vec::new();

    for (&id, subscriber) in &subscribers.entries {
        if subscriber.cancel.is_cancelled() {
            // Subscriber no longer listening.
            detached.push(id);
            continue;
        }

        let event = ReadEvent {
            payload: payload.clone(),
            error: error.clone(),
        };

        // Subscriber is either ready for the event or cancels while we wait
        // for its delivery slot.
        tokio::select! {
            _ = subscriber.cancel.cancelled() => detached.push(id),
            sent = subscriber.events.send(event) => {
                if sent.is_err() {
                    detached.push(id);
                }
            }
        }
    }

    for id in detached {
        // Dropping the entry closes its delivery channel.
        subscribers.entries.remove(&id);
        trace!(id, "detached mux subscriber");
    }
}

/// A read handle produced by [`Mux::attach`] which consumes read events from
/// its delivery channel.
#[derive(Debug)]
pub struct MuxReader {
    events: mpsc::Receiver<ReadEvent>,
    cancel: CancellationToken,
}

impl MuxReader {
    /// Receive the next chunk of upstream output into `buf`.
    ///
    /// Returns `Ok(0)` once the subscription is cancelled or the mux has shut
    /// down. A terminal upstream error is delivered after all preceding
    /// bytes, in its own read.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let event = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(0),
            event = self.events.recv() => match event {
                Some(event) => event,
                // Dispatch dropped our channel; nothing more will arrive.
                None => return Ok(0),
            },
        };

        if let Some(err) = event.error {
            return Err(clone_io_error(&err));
        }

        let n = event.payload.len().min(buf.len());
        buf[..n].copy_from_slice(&event.payload[..n]);
        Ok(n)
    }
}

/// The terminal error is shared by all subscribers; hand each caller its own
/// copy.
fn clone_io_error(err: &io::Error) -> io::Error {
    io::Error::new(err.kind(), err.to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::MockDevice;

    #[tokio::test]
    async fn every_subscriber_observes_every_write_in_order() {
        let (device, handle) = MockDevice::new("test");
        let mux = Mux::new(device);

        let cancel = CancellationToken::new();

        const READERS: usize = 4;
        const WRITES: usize = 4;

        let mut readers = Vec::with_capacity(READERS);
        for _ in 0..READERS {
            readers.push(mux.attach(cancel.child_token()).await);
        }

        // Each task fills in its own row of the matrix, so no locking is
        // needed.
        let mut tasks = Vec::with_capacity(READERS);
        for mut reader in readers {
            tasks.push(tokio::spawn(async move {
                let mut row = Vec::with_capacity(WRITES);
                let mut buf = [0u8; 64];
                for _ in 0..WRITES {
                    let n = reader.read(&mut buf).await.expect("read should succeed");
                    row.push(String::from_utf8_lossy(&buf[..n]).into_owned());
                }
                row
            }));
        }

        for i in 0..WRITES {
            handle.feed(format!("write {i}").into_bytes()).await;
            // Give the dispatcher a moment so consecutive writes are not
            // coalesced into a single read event.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let want: Vec<String> = (0..WRITES).map(|i| format!("write {i}")).collect();
        for task in tasks {
            let row = task.await.expect("reader task should not panic");
            assert_eq!(row, want);
        }

        handle.close();
        mux.close().await.expect("mux should close cleanly");
    }

    #[tokio::test]
    async fn late_subscriber_sees_no_history() {
        let (device, handle) = MockDevice::new("test");
        let mux = Mux::new(device);

        let cancel = CancellationToken::new();
        let mut early = mux.attach(cancel.child_token()).await;

        handle.feed(b"before".to_vec()).await;

        let mut buf = [0u8; 64];
        let n = early.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"before");

        // Attached strictly after "before" was dispatched, so it must only
        // ever observe "after".
        let mut late = mux.attach(cancel.child_token()).await;

        handle.feed(b"after".to_vec()).await;

        let n = early.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"after");
        let n = late.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"after");
    }

    #[tokio::test]
    async fn cancelled_subscriber_reads_eof_and_detaches() {
        let (device, handle) = MockDevice::new("test");
        let mux = Mux::new(device);

        let session = CancellationToken::new();
        let mut cancelled = mux.attach(session.child_token()).await;

        let keeper = CancellationToken::new();
        let mut kept = mux.attach(keeper.child_token()).await;

        session.cancel();

        let mut buf = [0u8; 64];
        let n = cancelled.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "cancelled subscriber reads end-of-stream");

        // The other subscriber's stream is unaffected.
        handle.feed(b"still here".to_vec()).await;
        let n = kept.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"still here");
    }

    #[tokio::test]
    async fn upstream_error_reaches_subscribers_and_close() {
        let (device, handle) = MockDevice::new("test");
        let mux = Mux::new(device);

        let cancel = CancellationToken::new();
        let mut reader = mux.attach(cancel.child_token()).await;

        handle.fail(io::Error::new(io::ErrorKind::TimedOut, "serial gone"));

        let mut buf = [0u8; 64];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let err = mux.close().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn clean_end_of_stream_closes_mux() {
        let (device, handle) = MockDevice::new("test");
        let mux = Mux::new(device);

        handle.close();
        mux.close().await.expect("end-of-stream is clean termination");
    }
}
