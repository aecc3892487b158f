//! Bidirectional byte splice between a tunnel channel and a dialed socket.
//!
//! Two copy tasks run independently (tunnel→socket and socket→tunnel). When
//! either one hits EOF or an error it raises a shared stop signal, so the
//! other direction ends too and both ends are closed. The splice is finished
//! once both tasks have returned.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Bytes moved in each direction over the life of a splice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    pub tunnel_to_socket: u64,
    pub socket_to_tunnel: u64,
}

/// Spawn the two copy tasks and a task that joins them.
///
/// The returned handle resolves once both directions are closed.
pub fn spawn_splice<T, S>(tunnel: T, socket: S, label: String) -> JoinHandle<SpliceStats>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (tunnel_read, tunnel_write) = tokio::io::split(tunnel);
    let (socket_read, socket_write) = tokio::io::split(socket);
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    let upstream = tokio::spawn(copy_until_stopped(
        tunnel_read,
        socket_write,
        stop_tx.clone(),
        stop_rx.clone(),
        format!("{label} tunnel->socket"),
    ));
    let downstream = tokio::spawn(copy_until_stopped(
        socket_read,
        tunnel_write,
        stop_tx,
        stop_rx,
        format!("{label} socket->tunnel"),
    ));

    tokio::spawn(async move {
        let (up, down) = tokio::join!(upstream, downstream);
        let stats = SpliceStats {
            tunnel_to_socket: up.unwrap_or_default(),
            socket_to_tunnel: down.unwrap_or_default(),
        };
        debug!(
            forward = %label,
            tunnel_to_socket = stats.tunnel_to_socket,
            socket_to_tunnel = stats.socket_to_tunnel,
            "splice closed"
        );
        stats
    })
}

/// Copy `reader` into `writer` until EOF, an error, or the stop signal.
/// Raises the stop signal on the way out and shuts the writer down.
///
/// The stop signal also interrupts a write that is stuck on a peer which no
/// longer reads, so one closed side always ends both directions.
async fn copy_until_stopped<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    stop_tx: Arc<watch::Sender<bool>>,
    mut stop_rx: watch::Receiver<bool>,
    direction: String,
) -> u64
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buf = vec![0u8; 8192];
    let mut copied = 0u64;

    loop {
        if *stop_rx.borrow() {
            break;
        }
        let step = async {
            let n = reader.read(&mut buf).await?;
            if n > 0 {
                writer.write_all(&buf[..n]).await?;
            }
            Ok::<usize, std::io::Error>(n)
        };
        tokio::select! {
            _ = stop_rx.changed() => {
                debug!(direction = %direction, "other direction closed");
                break;
            }
            result = step => {
                match result {
                    Ok(0) => {
                        debug!(direction = %direction, "EOF");
                        break;
                    }
                    Ok(n) => copied += n as u64,
                    Err(e) => {
                        warn!(direction = %direction, error = %e, "copy error");
                        break;
                    }
                }
            }
        }
    }

    stop_tx.send_replace(true);
    // A peer that stopped reading can stall the shutdown as well.
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
    copied
}
