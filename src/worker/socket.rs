//! Datagram transport of the event loop.

use crate::{message::Message, transaction::RpcError};
use async_trait::async_trait;
use std::{io, net::SocketAddr};
use tokio::net::UdpSocket;

const RECV_BUFFER_LEN: usize = 1500;

/// Datagram socket the DHT sends and receives through.
///
/// Implemented for `tokio::net::UdpSocket`; tests and embedders may provide their own.
#[async_trait]
pub trait SocketTransport: Send + Sync + 'static {
    async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<()>;

    /// Must be cancel safe: the event loop drops the future when another event wins.
    async fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl SocketTransport for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<()> {
        UdpSocket::send_to(self, buf, target).await.map(|_| ())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

pub(crate) struct Socket {
    inner: Box<dyn SocketTransport>,
    local_addr: SocketAddr,
    mtu: usize,
}

impl Socket {
    pub fn new<S: SocketTransport>(inner: S, mtu: usize) -> io::Result<Self> {
        let local_addr = inner.local_addr()?;

        Ok(Self {
            inner: Box::new(inner),
            local_addr,
            mtu,
        })
    }

    pub(crate) async fn send(&self, message: &Message, addr: SocketAddr) -> Result<(), RpcError> {
        let bytes = message.encode().map_err(RpcError::Encode)?;

        if bytes.len() > self.mtu {
            return Err(RpcError::TooLarge {
                len: bytes.len(),
                mtu: self.mtu,
            });
        }

        log::trace!("Sending to {addr:?} {message:?}");

        // Note: if the socket fails to send the entire buffer, then there is no point in trying to
        // send the rest (no node will attempt to reassemble two or more datagrams into a
        // meaningful message).
        self.inner.send_to(&bytes, &addr).await?;

        Ok(())
    }

    /// Receive the next datagram. A datagram that is not a valid message yields
    /// `RpcError::Decode` and the caller moves on to the next one.
    pub(crate) async fn recv(&mut self) -> Result<(Message, SocketAddr), (RpcError, SocketAddr)> {
        let mut buffer = vec![0u8; RECV_BUFFER_LEN];

        let (size, addr) = self
            .inner
            .recv_from(&mut buffer)
            .await
            .map_err(|error| (RpcError::Io(error), self.local_addr))?;

        match Message::decode(&buffer[..size]) {
            Ok(message) => Ok((message, addr)),
            Err(error) => Err((RpcError::Decode(error), addr)),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageBody, PingRequest, Request};

    fn ping() -> Message {
        Message {
            transaction_id: b"aa".to_vec(),
            version: None,
            body: MessageBody::Request(Request::Ping(PingRequest {
                id: rand::random(),
            })),
        }
    }

    #[tokio::test]
    async fn positive_send_recv() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let a = Socket::new(a, 1200).unwrap();
        let mut b = Socket::new(b, 1200).unwrap();

        let message = ping();
        a.send(&message, b.local_addr()).await.unwrap();

        let (received, from) = b.recv().await.unwrap();
        assert_eq!(received, message);
        assert_eq!(from, a.local_addr());
    }

    #[tokio::test]
    async fn negative_message_over_mtu() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a = Socket::new(a, 16).unwrap();

        match a.send(&ping(), a.local_addr()).await {
            Err(RpcError::TooLarge { mtu: 16, .. }) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn negative_garbage_datagram() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut b = Socket::new(b, 1200).unwrap();

        a.send_to(b"not bencode", b.local_addr()).await.unwrap();

        match b.recv().await {
            Err((RpcError::Decode(_), from)) => assert_eq!(from, a.local_addr().unwrap()),
            other => panic!("unexpected {:?}", other.map(|(message, _)| message)),
        }
    }
}
