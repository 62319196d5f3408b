//! The operating system's network stack, behind a trait so the connector
//! can be exercised without real sockets.

use std::ffi::{CStr, CString};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::address::{parse_neighbor_table, Neighbor};

/// A connected, bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

#[async_trait]
pub trait Network: Send + Sync {
    /// Open a stream to `addr`. Expiry of `timeout` is reported as
    /// `io::ErrorKind::TimedOut`.
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<BoxStream>;

    /// Resolve a host name to socket addresses on `port`.
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;

    fn interface_index(&self, name: &str) -> Option<u32>;

    fn interface_name(&self, index: u32) -> Option<String>;

    /// Names of the local network interfaces, loopback excluded.
    fn interfaces(&self) -> Vec<String>;

    /// Current kernel neighbor table. Empty if it can't be read.
    async fn neighbors(&self) -> Vec<Neighbor>;
}

/// [`Network`] backed by tokio sockets and the host's interfaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemNetwork;

#[async_trait]
impl Network for SystemNetwork {
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<BoxStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }

    fn interface_index(&self, name: &str) -> Option<u32> {
        let name = CString::new(name).ok()?;
        // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        (index != 0).then_some(index)
    }

    fn interface_name(&self, index: u32) -> Option<String> {
        let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
        // SAFETY: `buf` holds IF_NAMESIZE bytes as if_indextoname requires.
        let ptr = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
        if ptr.is_null() {
            return None;
        }
        // SAFETY: on success the buffer holds a NUL-terminated name.
        let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
        Some(name.to_string_lossy().into_owned())
    }

    fn interfaces(&self) -> Vec<String> {
        let entries = match std::fs::read_dir("/sys/class/net") {
            Ok(entries) => entries,
            Err(e) => {
                debug!("cannot list network interfaces: {}", e);
                return Vec::new();
            }
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name != "lo")
            .collect();
        names.sort();
        names
    }

    async fn neighbors(&self) -> Vec<Neighbor> {
        match tokio::process::Command::new("ip")
            .args(["neigh", "show"])
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                parse_neighbor_table(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                debug!(status = %output.status, "ip neigh show failed");
                Vec::new()
            }
            Err(e) => {
                debug!("cannot run ip neigh show: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hi").await.unwrap();
        });

        let mut stream = SystemNetwork
            .connect(addr, Duration::from_secs(2))
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_reported() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let err = SystemNetwork
            .connect(addr, Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn unknown_interface_has_no_index() {
        assert_eq!(SystemNetwork.interface_index("no-such-if0"), None);
        assert_eq!(SystemNetwork.interface_index("bad\0name"), None);
    }
}
