use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::device::MuxDevice;
use crate::metrics::Metrics;
use crate::mux::{MuxReader, READ_BUFFER_SIZE};
use crate::registry::DeviceRegistry;

/// Which copy direction finished first.
enum Side {
    Input,
    Output,
}

/// Proxy an authenticated session to the device named by its SSH user.
///
/// Wires the session's byte stream to the device: keystrokes flow to the
/// device's write side, and a fresh mux subscription fans the device's output
/// back into the session. Returns the session's exit status: 0 for any
/// completed proxy run (the user hanging up is not an error from their
/// perspective), 1 when the user matches no device.
///
/// Once the proxy phase starts, nothing but raw device output is written to
/// the session; any injected text would corrupt the serial stream.
pub async fn run<S>(
    stream: S,
    user: &str,
    remote: &str,
    registry: &DeviceRegistry,
    metrics: &Metrics,
    cancel: &CancellationToken,
) -> u32
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    // Use usernames to map to valid device multiplexers.
    let Some(device) = registry.get(user) else {
        // No such connection.
        metrics.unknown_session();
        let (_, mut writer) = tokio::io::split(stream);
        logf(
            &mut writer,
            remote,
            &format!("exiting, unknown connection {user:?}"),
        )
        .await;
        return 1;
    };

    let _session = metrics.session_opened(user);

    let cancel = cancel.child_token();

    // A new subscription for this session, so it receives the same output as
    // every other session attached to the device. Attached before the banner
    // goes out, so a client which has seen the banner is already receiving.
    let mux_reader = device.mux().attach(cancel.child_token()).await;

    // Begin proxying between SSH and serial console mux until the SSH
    // connection closes or is broken.
    let (reader, mut writer) = tokio::io::split(stream);
    logf(
        &mut writer,
        remote,
        &format!("opened serial connection {device}"),
    )
    .await;

    let mut input = tokio::spawn(copy_input(cancel.clone(), reader, Arc::clone(&device)));
    let mut output = tokio::spawn(copy_output(cancel.clone(), mux_reader, writer));

    let (finished, first) = tokio::select! {
        res = &mut input => (Side::Input, flatten(res)),
        res = &mut output => (Side::Output, flatten(res)),
    };

    // Either direction ending tears down the other.
    cancel.cancel();

    let second = match finished {
        Side::Input => flatten(output.await),
        Side::Output => flatten(input.await),
    };

    if let Some(err) = first.err().or(second.err()) {
        error!("{remote}: error proxying SSH/serial: {err}");
    }

    info!("{remote}: closed serial connection {device}");
    0
}

/// Forward session keystrokes to the device's write side.
async fn copy_input<S>(
    cancel: CancellationToken,
    mut session: ReadHalf<S>,
    device: Arc<MuxDevice>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = session.read(&mut buf) => read?,
        };
        if n == 0 {
            // The user hung up.
            return Ok(());
        }

        let mut offset = 0;
        while offset < n {
            let written = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                written = device.write(&buf[offset..n]) => written?,
            };
            if written == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            offset += written;
        }
    }
}

/// Forward device output from the mux subscription into the session.
async fn copy_output<S>(
    cancel: CancellationToken,
    mut reader: MuxReader,
    mut session: WriteHalf<S>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        // The mux reader observes our cancellation itself and reads
        // end-of-stream once it fires.
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            written = session.write_all(&buf[..n]) => written?,
        }
    }
}

/// Output a log message to both stderr and the SSH session.
async fn logf<W: AsyncWrite + Unpin>(session: &mut W, remote: &str, msg: &str) {
    info!("{remote}: {msg}");
    let _ = session
        .write_all(format!("consrv> {msg}\n").as_bytes())
        .await;
    let _ = session.flush().await;
}

fn flatten(res: Result<io::Result<()>, JoinError>) -> io::Result<()> {
    match res {
        Ok(inner) => inner,
        Err(join) => Err(io::Error::other(join)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::device::Device;
    use crate::mock::MockDevice;

    fn registry_with(device: Arc<MockDevice>) -> DeviceRegistry {
        DeviceRegistry::new(HashMap::from([(
            "test".to_string(),
            Arc::new(MuxDevice::new(device as Arc<dyn Device>)),
        )]))
    }

    async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn unknown_device_exits_with_status_one() {
        let registry = DeviceRegistry::new(HashMap::new());
        let metrics = Metrics::new().unwrap();
        let cancel = CancellationToken::new();

        let (mut client, server) = tokio::io::duplex(1024);

        let proxy = tokio::spawn(async move {
            run(server, "test", "127.0.0.1", &registry, &metrics, &cancel).await
        });

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&out),
            "consrv> exiting, unknown connection \"test\"\n"
        );

        assert_eq!(proxy.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn banner_and_input_forwarding() {
        let (device, _handle) = MockDevice::new("test");
        let registry = registry_with(Arc::clone(&device));
        let metrics = Metrics::new().unwrap();
        let cancel = CancellationToken::new();

        let (mut client, server) = tokio::io::duplex(1024);

        let proxy = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run(server, "test", "127.0.0.1", &registry, &metrics, &cancel).await
            })
        };

        let banner = b"consrv> opened serial connection test\n";
        let mut out = vec![0u8; banner.len()];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(out, banner);

        client.write_all(b"hello world").await.unwrap();
        eventually("device write", || device.written() == b"hello world").await;

        // Tearing down the session stops both copy directions; hanging up is
        // not an error.
        cancel.cancel();
        assert_eq!(proxy.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn device_output_reaches_session() {
        let (device, handle) = MockDevice::new("test");
        let registry = registry_with(device);
        let metrics = Metrics::new().unwrap();
        let cancel = CancellationToken::new();

        let (mut client, server) = tokio::io::duplex(1024);

        let proxy = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run(server, "test", "127.0.0.1", &registry, &metrics, &cancel).await
            })
        };

        let banner = b"consrv> opened serial connection test\n";
        let mut out = vec![0u8; banner.len()];
        client.read_exact(&mut out).await.unwrap();

        handle.feed(b"login: ".to_vec()).await;

        let mut out = vec![0u8; b"login: ".len()];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(out, b"login: ");

        cancel.cancel();
        assert_eq!(proxy.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn client_hangup_ends_session_cleanly() {
        let (device, handle) = MockDevice::new("test");
        let registry = registry_with(device);
        let metrics = Metrics::new().unwrap();
        let cancel = CancellationToken::new();

        let (mut client, server) = tokio::io::duplex(1024);

        let proxy = tokio::spawn(async move {
            run(server, "test", "127.0.0.1", &registry, &metrics, &cancel).await
        });

        let banner = b"consrv> opened serial connection test\n";
        let mut out = vec![0u8; banner.len()];
        client.read_exact(&mut out).await.unwrap();

        // Closing the client stream makes the input copy observe
        // end-of-stream, which tears the rest down.
        drop(client);
        assert_eq!(proxy.await.unwrap(), 0);

        // The mux keeps running for future sessions.
        let _ = handle;
    }
}
