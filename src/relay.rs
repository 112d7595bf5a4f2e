//! Bidirectional TCP relay used by the IPv6 forwarder.
//!
//! `tokio::io::copy_bidirectional` drives both directions of a spliced
//! socket pair concurrently, handles short reads/partial writes
//! internally, and tears the pair down on EOF or error on either side.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, instrument, warn};

/// Splice two already-connected sockets until either side closes.
///
/// Returns the number of bytes copied in each direction
/// `(client_to_server, server_to_client)`.
///
/// # Errors
///
/// Returns an error if the copy itself fails (not on ordinary EOF, which
/// is a normal, successful teardown).
#[instrument(skip(client, server))]
pub async fn splice(client: &mut TcpStream, server: &mut TcpStream) -> std::io::Result<(u64, u64)> {
    let result = tokio::io::copy_bidirectional(client, server).await;
    match &result {
        Ok((to_server, to_client)) => {
            debug!(to_server, to_client, "relay pair closed");
        }
        Err(e) => {
            warn!(error = %e, "relay pair failed");
        }
    }
    result
}

/// Connect to the loopback target a forwarding rule splices to.
///
/// # Errors
///
/// Returns an error if the connection cannot be established.
pub async fn connect_local(local_port: u16) -> std::io::Result<TcpStream> {
    let timeout_dur = Duration::from_secs(5);
    tokio::time::timeout(
        timeout_dur,
        TcpStream::connect(("127.0.0.1", local_port)),
    )
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect to local port timed out"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn splice_relays_bytes_both_directions_until_eof() {
        // "Client" side: an accepted inbound connection we write to and
        // read the echoed reply from.
        let inbound_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let inbound_addr = inbound_listener.local_addr().unwrap();
        let accept_task = tokio::spawn(async move { inbound_listener.accept().await.unwrap().0 });
        let mut dialer = TcpStream::connect(inbound_addr).await.unwrap();
        let mut accepted = accept_task.await.unwrap();

        // "Server" side: the loopback target the relay connects out to.
        let outbound_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let outbound_addr = outbound_listener.local_addr().unwrap();
        let server_task = tokio::spawn(async move {
            let (mut sock, _) = outbound_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"world").await.unwrap();
        });
        let mut server_side = TcpStream::connect(outbound_addr).await.unwrap();

        dialer.write_all(b"hello").await.unwrap();
        let splice_task = tokio::spawn(async move { splice(&mut accepted, &mut server_side).await });

        let mut echoed = [0u8; 5];
        dialer.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"world");

        drop(dialer);
        server_task.await.unwrap();
        let (to_server, to_client) = splice_task.await.unwrap().unwrap();
        assert_eq!(to_server, 5);
        assert_eq!(to_client, 5);
    }

    #[tokio::test]
    async fn connect_local_fails_fast_on_closed_port() {
        // Port 1 is privileged/unbound in virtually every sandbox; expect
        // either a refused connection or a timeout, never a hang.
        let result = tokio::time::timeout(Duration::from_secs(6), connect_local(1)).await;
        assert!(result.is_ok());
    }
}
