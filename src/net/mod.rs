//! Nameserver connections.
//!
//! One [`Server`] owns one socket to one nameserver over one protocol and
//! answers one question at a time.  The [`ServerRegistry`] hands out shared
//! handles and replaces servers whose sockets have died.

pub mod tcp;
pub mod udp;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use tokio::sync::Mutex;

use self::tcp::TcpServer;
use self::udp::UdpServer;

/// The transport protocol used to talk to a nameserver.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// An error inside a single request/reply exchange.
///
/// These are recovered by the query engine: the attempt counter advances and
/// the next nameserver in the rotation is tried.  They only reach callers as
/// the cause of an attempts-exhausted failure.
#[derive(Debug)]
pub enum TransportError {
    /// Socket I/O failed.
    Io(io::Error),
    /// The nameserver did not answer within the configured timeout.
    Timeout,
    /// The connection was closed before a full reply arrived.
    ConnectionClosed,
    /// A message could not be encoded or decoded.
    Codec(ProtoError),
    /// The request does not fit in the transport's message size.
    RequestTooLarge { size: usize },
    /// A reply on a stream connection carried the wrong transaction ID.
    TransactionMismatch { expected: u16, got: u16 },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportError::Io(error) => write!(f, "socket error: {error}"),
            TransportError::Timeout => write!(f, "timed out"),
            TransportError::ConnectionClosed => write!(f, "connection closed"),
            TransportError::Codec(error) => {
                write!(f, "could not encode or decode a message: {error}")
            }
            TransportError::RequestTooLarge { size } => {
                write!(f, "request of {size} octets is too large to send")
            }
            TransportError::TransactionMismatch { expected, got } => {
                write!(
                    f,
                    "reply transaction id {got} does not match request {expected}"
                )
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(error) => Some(error),
            TransportError::Codec(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        TransportError::Io(error)
    }
}

impl From<ProtoError> for TransportError {
    fn from(error: ProtoError) -> Self {
        TransportError::Codec(error)
    }
}

/// Build the request message for a question.
fn request_message(question: Query, id: u16) -> Message {
    let mut request = Message::new();
    request
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(question);
    request
}

/// A connection to one nameserver, over either transport.
#[derive(Debug)]
pub enum Server {
    Udp(UdpServer),
    Tcp(TcpServer),
}

impl Server {
    /// Open a connection.  TCP connection establishment is bounded by
    /// `timeout`.
    pub async fn connect(
        protocol: Protocol,
        address: SocketAddr,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        match protocol {
            Protocol::Udp => Ok(Server::Udp(UdpServer::connect(address).await?)),
            Protocol::Tcp => Ok(Server::Tcp(TcpServer::connect(address, timeout).await?)),
        }
    }

    /// Send a question and await the nameserver's reply, bounded by
    /// `timeout`.  Transactions on one server run one at a time; concurrent
    /// callers queue.
    pub async fn ask(&self, question: Query, timeout: Duration) -> Result<Message, TransportError> {
        match self {
            Server::Udp(server) => server.ask(question, timeout).await,
            Server::Tcp(server) => server.ask(question, timeout).await,
        }
    }

    /// False once the underlying socket has failed or been closed.  The
    /// registry drops dead servers on the next lookup.
    pub fn is_alive(&self) -> bool {
        match self {
            Server::Udp(server) => server.is_alive(),
            Server::Tcp(server) => server.is_alive(),
        }
    }
}

/// The servers the resolver currently holds open, at most one per
/// `(protocol, nameserver)` pair.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: Mutex<HashMap<(Protocol, SocketAddr), Arc<Server>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the open server for a nameserver, connecting if there is none.
    /// A held server which is no longer alive is evicted and replaced
    /// before being returned.  Connection failures leave no entry behind.
    pub async fn get(
        &self,
        protocol: Protocol,
        address: SocketAddr,
        timeout: Duration,
    ) -> Result<Arc<Server>, TransportError> {
        let mut servers = self.servers.lock().await;

        if let Some(server) = servers.get(&(protocol, address)) {
            if server.is_alive() {
                return Ok(Arc::clone(server));
            }
            tracing::debug!(%protocol, %address, "evicting dead server");
            servers.remove(&(protocol, address));
        }

        let server = Arc::new(Server::connect(protocol, address, timeout).await?);
        servers.insert((protocol, address), Arc::clone(&server));
        Ok(server)
    }
}
