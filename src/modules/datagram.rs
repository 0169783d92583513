//! UDP transport.

use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};

use log::{debug, warn};
use tokio::net::UdpSocket;

use super::constants::MAX_MESSAGE_SIZE;
use super::proto::Datagram;

/// Binds a non-blocking socket, ready to be handed to a runtime.
///
/// Binding happens outside any runtime so that a host learns about a busy
/// port before a server thread is started.
pub fn bind(addr: SocketAddr) -> io::Result<StdUdpSocket> {
    let socket = StdUdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// The daemon's single UDP socket.
#[derive(Debug)]
pub struct Transport {
    socket: UdpSocket,
}

impl Transport {
    /// Registers a socket from [`bind`] with the current runtime.
    pub fn from_std(socket: StdUdpSocket) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::from_std(socket)?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Waits for the next packet.
    ///
    /// Malformed packets are consumed and reported as `None`.
    pub async fn receive(&self) -> io::Result<Option<(Datagram, SocketAddr)>> {
        // one spare byte so oversized packets are seen as such
        let mut buf = [0u8; MAX_MESSAGE_SIZE + 1];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        match Datagram::parse(&buf[..len]) {
            Some(dgram) => Ok(Some((dgram, from))),
            None => {
                debug!("Dropping malformed packet of {} bytes from {}", len, from);
                Ok(None)
            }
        }
    }

    pub async fn send(&self, to: SocketAddr, bytes: &[u8]) -> io::Result<()> {
        let sent = self.socket.send_to(bytes, to).await?;
        if sent < bytes.len() {
            warn!("Short send to {}: {} of {} bytes", to, sent, bytes.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::proto::Command;
    use anyhow::Result;

    #[tokio::test]
    async fn test_receive_and_send() -> Result<()> {
        let transport = Transport::from_std(bind("127.0.0.1:0".parse()?)?)?;
        let server = transport.local_addr()?;
        let peer = UdpSocket::bind("127.0.0.1:0").await?;

        peer.send_to(&[1, 0, 3, 0, Command::Size as u8], server).await?;
        let (dgram, from) = transport.receive().await?.expect("well-formed packet");
        assert_eq!(dgram.session_id, 1);
        assert_eq!(dgram.sequence, 3);
        assert_eq!(from, peer.local_addr()?);

        transport.send(from, &[1, 0, 3, 0]).await?;
        let mut buf = [0u8; 16];
        let (len, _) = peer.recv_from(&mut buf).await?;
        assert_eq!(&buf[..len], &[1, 0, 3, 0]);
        Ok(())
    }

    #[test]
    fn test_malformed_packets_are_dropped() -> Result<()> {
        tokio_test::block_on(async {
            let transport = Transport::from_std(bind("127.0.0.1:0".parse()?)?)?;
            let server = transport.local_addr()?;
            let peer = UdpSocket::bind("127.0.0.1:0").await?;

            peer.send_to(&[1, 0, 3], server).await?;
            assert!(transport.receive().await?.is_none());
            peer.send_to(&vec![0u8; MAX_MESSAGE_SIZE + 1], server).await?;
            assert!(transport.receive().await?.is_none());
            Ok::<(), anyhow::Error>(())
        })
    }
}
