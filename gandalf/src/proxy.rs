// Jackson Coxson
// Bidirectional byte pump between an accepted client and a device leg

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

const BUFFER_SIZE: usize = 32768;

/// Why a tunnel stopped pumping bytes.
#[derive(Debug)]
pub enum TunnelOutcome {
    /// The local client closed cleanly.
    ClientClosed,
    /// The device leg closed cleanly.
    DeviceClosed,
    /// No byte moved in either direction within the idle limit.
    IdleTimeout,
    /// A peer dropped the connection without a clean close.
    Reset,
    /// Anything else.
    Error(io::Error),
}

enum Chunk {
    Data(usize),
    Eof,
    Idle,
    Failed(io::Error),
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    idle: Option<Duration>,
) -> Chunk {
    let res = match idle {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buf)).await {
            Ok(res) => res,
            Err(_) => return Chunk::Idle,
        },
        None => reader.read(buf).await,
    };
    match res {
        Ok(0) => Chunk::Eof,
        Ok(n) => Chunk::Data(n),
        Err(e) => Chunk::Failed(e),
    }
}

fn classify(e: io::Error, side: &str) -> TunnelOutcome {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => {
            debug!("{side} leg reset: {e}");
            TunnelOutcome::Reset
        }
        _ => {
            error!("unexpected error on {side} leg: {e}");
            TunnelOutcome::Error(e)
        }
    }
}

/// Copies bytes in both directions until either side closes, errors, or
/// (with `idle` set) nothing was read for that long. Every chunk read is
/// written out in full before the next read is polled, so no byte is
/// ever dropped on the terminating direction. Both streams are closed on
/// return.
pub async fn pump<C, D>(client: C, device: D, idle: Option<Duration>) -> TunnelOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    D: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut device_read, mut device_write) = tokio::io::split(device);
    let mut client_buf = vec![0u8; BUFFER_SIZE];
    let mut device_buf = vec![0u8; BUFFER_SIZE];

    let outcome = loop {
        tokio::select! {
            chunk = read_chunk(&mut client_read, &mut client_buf, idle) => match chunk {
                Chunk::Data(n) => {
                    if let Err(e) = device_write.write_all(&client_buf[..n]).await {
                        break classify(e, "device");
                    }
                }
                Chunk::Eof => break TunnelOutcome::ClientClosed,
                Chunk::Idle => break TunnelOutcome::IdleTimeout,
                Chunk::Failed(e) => break classify(e, "client"),
            },
            chunk = read_chunk(&mut device_read, &mut device_buf, idle) => match chunk {
                Chunk::Data(n) => {
                    if let Err(e) = client_write.write_all(&device_buf[..n]).await {
                        break classify(e, "client");
                    }
                }
                Chunk::Eof => break TunnelOutcome::DeviceClosed,
                Chunk::Idle => break TunnelOutcome::IdleTimeout,
                Chunk::Failed(e) => break classify(e, "device"),
            },
        }
    };

    let _ = client_write.shutdown().await;
    let _ = device_write.shutdown().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_both_directions_and_reports_client_eof() {
        let (client, mut client_app) = tokio::io::duplex(1024);
        let (device, mut device_app) = tokio::io::duplex(1024);

        let pump = tokio::spawn(pump(client, device, None));

        client_app.write_all(b"HELLO\n").await.unwrap();
        let mut buf = [0u8; 6];
        device_app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HELLO\n");

        device_app.write_all(b"WORLD\n").await.unwrap();
        client_app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"WORLD\n");

        drop(client_app);
        let outcome = pump.await.unwrap();
        assert!(matches!(outcome, TunnelOutcome::ClientClosed));
    }

    #[tokio::test]
    async fn flushes_the_final_chunk_before_closing() {
        let (client, mut client_app) = tokio::io::duplex(65536);
        let (device, mut device_app) = tokio::io::duplex(65536);

        let payload: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
        client_app.write_all(&payload).await.unwrap();
        drop(client_app);

        let pump = tokio::spawn(pump(client, device, None));

        let mut received = Vec::new();
        device_app.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);

        assert!(matches!(
            pump.await.unwrap(),
            TunnelOutcome::ClientClosed
        ));
    }

    #[tokio::test]
    async fn reports_device_eof() {
        let (client, _client_app) = tokio::io::duplex(1024);
        let (device, device_app) = tokio::io::duplex(1024);

        drop(device_app);
        let outcome = pump(client, device, None).await;
        assert!(matches!(outcome, TunnelOutcome::DeviceClosed));
    }

    #[tokio::test]
    async fn idles_out_when_nothing_moves() {
        let (client, _client_app) = tokio::io::duplex(1024);
        let (device, _device_app) = tokio::io::duplex(1024);

        let started = std::time::Instant::now();
        let outcome = pump(client, device, Some(Duration::from_millis(50))).await;
        assert!(matches!(outcome, TunnelOutcome::IdleTimeout));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn traffic_defers_the_idle_timer() {
        let (client, mut client_app) = tokio::io::duplex(1024);
        let (device, mut device_app) = tokio::io::duplex(1024);

        let pump = tokio::spawn(pump(client, device, Some(Duration::from_millis(200))));

        // Keep one direction busy for longer than the idle limit.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(80)).await;
            client_app.write_all(b"x").await.unwrap();
            let mut byte = [0u8; 1];
            device_app.read_exact(&mut byte).await.unwrap();
        }

        drop(client_app);
        assert!(matches!(
            pump.await.unwrap(),
            TunnelOutcome::ClientClosed
        ));
    }
}
