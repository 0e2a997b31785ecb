//! Duplex forwarder between the kernel and the remote link
//!
//! The kernel side of a socketpair goes to vhci_hcd via the sysfs attach
//! node; this module shuttles bytes between the other end and the remote
//! link in both directions with 4 KiB buffers. Either direction's failure
//! tears the whole bridge down.

use common::Link;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tracing::debug;

const COPY_BUF_SIZE: usize = 4096;

/// Owner-side handle to a running bridge
pub struct BridgeHandle {
    terminated: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    monitor: tokio::task::JoinHandle<()>,
}

impl BridgeHandle {
    /// Both copy directions have exited and the sockets are closed.
    pub fn fwd_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub async fn join(self) {
        let _ = self.monitor.await;
    }
}

/// Build the socketpair and start forwarding between the local end and the
/// remote link. Returns the handle and the fd destined for the kernel; the
/// caller writes it to the attach node and drops it.
pub fn start(link: Link, name: &str) -> anyhow::Result<(BridgeHandle, OwnedFd)> {
    let (kernel_end, local_end) = StdUnixStream::pair()?;
    local_end.set_nonblocking(true)?;
    let local_end = UnixStream::from_std(local_end)?;

    let terminated = Arc::new(AtomicBool::new(false));
    let (stop_tx, _) = watch::channel(false);

    let (link_rd, link_wr) = tokio::io::split(link);
    let (local_rd, local_wr) = local_end.into_split();

    let monitor = {
        let terminated = terminated.clone();
        let stop_tx = stop_tx.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let mut rx = tokio::spawn(copy_stream(link_rd, local_wr, stop_tx.subscribe()));
            let mut tx = tokio::spawn(copy_stream(local_rd, link_wr, stop_tx.subscribe()));

            // First side to fail stops the other
            tokio::select! {
                _ = &mut rx => { let _ = stop_tx.send(true); let _ = tx.await; }
                _ = &mut tx => { let _ = stop_tx.send(true); let _ = rx.await; }
            }

            debug!("Local forward [{}] terminate now", name);
            terminated.store(true, Ordering::Release);
        })
    };

    Ok((
        BridgeHandle {
            terminated,
            stop_tx,
            monitor,
        },
        kernel_end.into(),
    ))
}

async fn copy_stream<R, W>(mut rd: R, mut wr: W, mut stop: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        let read = tokio::select! {
            r = rd.read(&mut buf) => r,
            _ = stop.wait_for(|s| *s) => break,
        };
        let n = match read {
            Ok(0) | Err(_) => {
                debug!("Forward read side done");
                break;
            }
            Ok(n) => n,
        };
        if wr.write_all(&buf[..n]).await.is_err() {
            debug!("Forward write side failed");
            break;
        }
    }
    let _ = wr.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_link_pair() -> (Link, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, (server, _)) =
            tokio::join!(TcpStream::connect(addr), async { listener.accept().await.unwrap() });
        (Link::Tcp(client.unwrap()), server)
    }

    #[tokio::test]
    async fn test_bridge_copies_both_directions() {
        let (link, mut remote) = tcp_link_pair().await;
        let (bridge, kernel_fd) = start(link, "test-dev").unwrap();
        assert!(kernel_fd.as_raw_fd() >= 0);

        // Use the "kernel" end of the socketpair directly
        let kernel: StdUnixStream = kernel_fd.into();
        kernel.set_nonblocking(true).unwrap();
        let mut kernel = UnixStream::from_std(kernel).unwrap();

        // remote -> kernel
        remote.write_all(b"to-kernel").await.unwrap();
        let mut buf = [0u8; 9];
        kernel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to-kernel");

        // kernel -> remote
        kernel.write_all(b"to-remote").await.unwrap();
        let mut buf = [0u8; 9];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to-remote");

        bridge.request_stop();
        tokio::time::timeout(Duration::from_secs(1), bridge.join())
            .await
            .expect("bridge should stop");
    }

    #[tokio::test]
    async fn test_remote_close_terminates_bridge() {
        let (link, remote) = tcp_link_pair().await;
        let (bridge, kernel_fd) = start(link, "test-dev").unwrap();

        drop(remote);

        tokio::time::timeout(Duration::from_secs(1), async {
            while !bridge.fwd_terminated() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("bridge should notice the closed remote");

        bridge.join().await;
        drop(kernel_fd);
    }
}
