use bytes::BytesMut;
use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use hickory_proto::op::{Message, Query};

use super::{request_message, TransportError};

/// A stream connection to one nameserver.
///
/// A DNS TCP message is slightly different to a DNS UDP message: it has a
/// big-endian u16 prefix giving the total length of the message, so the
/// entire reply can be read before decoding begins.
#[derive(Debug)]
pub struct TcpServer {
    stream: Mutex<TcpStream>,
    alive: AtomicBool,
}

impl TcpServer {
    /// Connect to the nameserver, bounded by `timeout_after`.
    pub async fn connect(
        address: SocketAddr,
        timeout_after: Duration,
    ) -> Result<Self, TransportError> {
        match timeout(timeout_after, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => Ok(TcpServer {
                stream: Mutex::new(stream),
                alive: AtomicBool::new(true),
            }),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Send a question and await the reply.
    ///
    /// Requests on one connection run one at a time and replies arrive in
    /// request order, so the next message on the stream is the reply to the
    /// outstanding request.  Any failure, including a timeout, marks the
    /// connection dead: a reply surfacing after its request was abandoned
    /// would desynchronise the framing.
    pub async fn ask(
        &self,
        question: Query,
        timeout_after: Duration,
    ) -> Result<Message, TransportError> {
        let mut stream = self.stream.lock().await;

        let id = rand::thread_rng().gen();
        let request = request_message(question, id);
        let bytes = request.to_vec()?;

        let result = match timeout(timeout_after, exchange(&mut stream, &bytes)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match result {
            Ok(response) if response.id() == id => Ok(response),
            Ok(response) => {
                self.alive.store(false, Ordering::Release);
                Err(TransportError::TransactionMismatch {
                    expected: id,
                    got: response.id(),
                })
            }
            Err(error) => {
                self.alive.store(false, Ordering::Release);
                Err(error)
            }
        }
    }
}

async fn exchange(stream: &mut TcpStream, bytes: &[u8]) -> Result<Message, TransportError> {
    let length = match u16::try_from(bytes.len()) {
        Ok(length) => length,
        Err(_) => return Err(TransportError::RequestTooLarge { size: bytes.len() }),
    };

    stream.write_all(&length.to_be_bytes()).await?;
    stream.write_all(bytes).await?;

    let reply = read_reply(stream).await?;
    Ok(Message::from_vec(&reply)?)
}

/// Read one length-prefixed message from the stream.
async fn read_reply(stream: &mut TcpStream) -> Result<BytesMut, TransportError> {
    let expected = match stream.read_u16().await {
        Ok(length) => usize::from(length),
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::ConnectionClosed)
        }
        Err(error) => return Err(error.into()),
    };

    let mut bytes = BytesMut::with_capacity(expected);
    while bytes.len() < expected {
        match stream.read_buf(&mut bytes).await {
            Ok(0) => return Err(TransportError::ConnectionClosed),
            Ok(_) => (),
            Err(error) => return Err(error.into()),
        }
    }

    // read_buf fills to capacity, which the allocator may have rounded up
    // past the frame boundary.
    bytes.truncate(expected);
    Ok(bytes)
}
