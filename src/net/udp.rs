use rand::Rng;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::timeout;

use hickory_proto::op::{Message, Query};

use super::{request_message, TransportError};

/// Maximum DNS payload in a single datagram without EDNS.
const MAX_DATAGRAM_SIZE: usize = 512;

/// Receive buffer size.  Roomier than the 512-octet limit, for servers
/// which ignore it.
const RECV_BUFFER_SIZE: usize = 4096;

/// A datagram connection to one nameserver.
#[derive(Debug)]
pub struct UdpServer {
    socket: UdpSocket,
    alive: AtomicBool,

    /// Serialises transactions: one request/reply exchange at a time, so a
    /// reply can never be picked up by the wrong waiter.
    transaction: Mutex<()>,
}

impl UdpServer {
    /// Bind an ephemeral local socket and connect it to the nameserver, so
    /// datagrams from other peers are filtered out by the kernel.
    pub async fn connect(address: SocketAddr) -> Result<Self, TransportError> {
        let bind_address: SocketAddr = if address.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_address).await?;
        socket.connect(address).await?;

        Ok(UdpServer {
            socket,
            alive: AtomicBool::new(true),
            transaction: Mutex::new(()),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Send a question and await the reply with the matching transaction
    /// ID.
    ///
    /// A timeout leaves the socket usable: the late reply, if it ever
    /// arrives, is discarded by the ID check of a later transaction.  A
    /// socket error marks the server dead.
    pub async fn ask(
        &self,
        question: Query,
        timeout_after: Duration,
    ) -> Result<Message, TransportError> {
        let _transaction = self.transaction.lock().await;

        let id = rand::thread_rng().gen();
        let request = request_message(question, id);
        let bytes = request.to_vec()?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::RequestTooLarge { size: bytes.len() });
        }

        match timeout(timeout_after, self.exchange(id, &bytes)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn exchange(&self, id: u16, bytes: &[u8]) -> Result<Message, TransportError> {
        if let Err(error) = self.socket.send(bytes).await {
            self.alive.store(false, Ordering::Release);
            return Err(error.into());
        }

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let received = match self.socket.recv(&mut buf).await {
                Ok(received) => received,
                Err(error) => {
                    self.alive.store(false, Ordering::Release);
                    return Err(error.into());
                }
            };

            match Message::from_vec(&buf[..received]) {
                Ok(response) if response.id() == id => return Ok(response),
                Ok(response) => {
                    tracing::trace!(
                        got = %response.id(),
                        expected = %id,
                        "discarding reply with wrong transaction id"
                    );
                }
                Err(error) => {
                    tracing::trace!(%error, "discarding undecodable datagram");
                }
            }
        }
    }
}
