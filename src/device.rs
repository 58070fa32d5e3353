use std::fmt::Display;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use prometheus::IntCounterVec;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tokio_util::sync::CancellationToken;

use crate::config::DeviceConfig;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::mux::Mux;

/// A handle to a console device.
///
/// A small capability contract is all the bridge needs: read, write, close,
/// and a string form for logging. The read side is consumed exclusively by a
/// [`Mux`]; the write side may be shared by any number of sessions, whose
/// writes interleave at whatever granularity the underlying driver provides.
#[async_trait]
pub trait Device: Send + Sync + Display {
    /// Read up to `buf.len()` bytes from the device.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the beginning of `buf` to the device, returning how many bytes
    /// were accepted.
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Close the device.
    async fn close(&self) -> io::Result<()>;
}

/// A [`Device`] implemented over a serial port.
pub struct SerialDevice {
    name: String,
    path: String,
    serial: String,
    baud: u32,

    reader: Mutex<ReadHalf<SerialStream>>,
    writer: Mutex<WriteHalf<SerialStream>>,

    /// Unblocks an in-flight read when the device is closed, so the mux
    /// reader observes end-of-stream instead of hanging on the port.
    closed: CancellationToken,

    reads: IntCounterVec,
    writes: IntCounterVec,
}

impl SerialDevice {
    /// Open the serial port at `path` for the given device entry and
    /// instrument it with the per-device byte counters.
    ///
    /// Ports are opened 8N1 with no flow control; the serial console has no
    /// backpressure channel.
    pub fn open(config: &DeviceConfig, path: &str, metrics: &Metrics) -> Result<Self, Error> {
        let stream = tokio_serial::new(path, config.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|source| Error::SerialOpen {
                path: path.to_string(),
                source,
            })?;

        let (reader, writer) = tokio::io::split(stream);

        Ok(Self {
            name: config.name.clone(),
            path: path.to_string(),
            serial: config.serial.clone(),
            baud: config.baud,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
            reads: metrics.read_bytes(),
            writes: metrics.write_bytes(),
        })
    }
}

#[async_trait]
impl Device for SerialDevice {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;

        let n = tokio::select! {
            _ = self.closed.cancelled() => return Ok(0),
            read = reader.read(buf) => read?,
        };

        self.reads.with_label_values(&[&self.name]).inc_by(n as u64);
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.lock().await.write(buf).await?;
        self.writes
            .with_label_values(&[&self.name])
            .inc_by(n as u64);
        Ok(n)
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        self.writer.lock().await.shutdown().await
    }
}

impl Display for SerialDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}: path: {:?}, serial: {:?}, baud: {}",
            self.name, self.path, self.serial, self.baud
        )
    }
}

/// A device with multiplexed reads.
///
/// The wrapped device's read side belongs to the mux; writes pass straight
/// through.
pub struct MuxDevice {
    device: Arc<dyn Device>,
    mux: Mux,
}

impl MuxDevice {
    /// Wrap a device with a [`Mux`].
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            mux: Mux::new(Arc::clone(&device)),
            device,
        }
    }

    /// The mux fanning out this device's output.
    pub fn mux(&self) -> &Mux {
        &self.mux
    }

    /// Write directly to the underlying device.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.device.write(buf).await
    }

    /// Close the device and its mux, returning the first error encountered.
    pub async fn close(&self) -> io::Result<()> {
        let device = self.device.close().await;
        let mux = self.mux.close().await;

        device.and(mux)
    }
}

impl Display for MuxDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.device.fmt(f)
    }
}
