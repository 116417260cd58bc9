use std::io::prelude::*;
use std::io;
use std::net::*;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::rdma::endpoint::QpEndpoint;

/// Largest control message accepted from a peer.
const MAX_MESSAGE_LEN: usize = 1 << 20;

/// Error exchanging endpoints with a peer.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("{what}")]
    Io {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("cannot reach {addr} after {attempts} attempts")]
    Unreachable {
        addr: SocketAddrV4,
        attempts: usize,
        #[source]
        source: io::Error,
    },

    #[error("peer announced a {0}-byte message")]
    Oversized(usize),

    #[error("malformed endpoint from peer")]
    Codec(#[from] serde_json::Error),
}

fn io_err(what: &'static str) -> impl FnOnce(io::Error) -> ConnectError {
    move |source| ConnectError::Io { what, source }
}

fn stream_write(stream: &mut &TcpStream, buf: &[u8]) -> Result<(), ConnectError> {
    stream
        .write_all(&buf.len().to_le_bytes())
        .map_err(io_err("failed to write message length"))?;
    stream
        .write_all(buf)
        .map_err(io_err("failed to write message body"))
}

fn stream_read(stream: &mut &TcpStream) -> Result<Vec<u8>, ConnectError> {
    let mut buf = [0; std::mem::size_of::<usize>()];
    stream
        .read_exact(&mut buf)
        .map_err(io_err("failed to read message length"))?;
    let len = usize::from_le_bytes(buf);
    if len > MAX_MESSAGE_LEN {
        return Err(ConnectError::Oversized(len));
    }

    let mut buf = vec![0; len];
    stream
        .read_exact(&mut buf)
        .map_err(io_err("failed to read message body"))?;
    Ok(buf)
}

fn connect_until_success(
    server_addr: SocketAddrV4,
    wait_on_failure: Duration,
    attempts: usize,
) -> Result<TcpStream, ConnectError> {
    let mut tried = 0;
    loop {
        match TcpStream::connect(server_addr) {
            Ok(stream) => break Ok(stream),
            Err(source) => {
                tried += 1;
                if tried >= attempts {
                    break Err(ConnectError::Unreachable {
                        addr: server_addr,
                        attempts,
                        source,
                    });
                }
                log::debug!("connect to {} failed ({}), retrying", server_addr, source);
                thread::sleep(wait_on_failure);
            }
        }
    }
}

/// Exchanges queue pair endpoints with one remote peer over TCP.
///
/// The receiver listens, the sender connects. Each side sends its own
/// [`QpEndpoint`] as length-prefixed JSON and reads the peer's.
pub struct Connecter {
    /// Remote peer. If `Some`, this is the connecting side; otherwise, this
    /// is the listening side.
    with: Option<Ipv4Addr>,
    stream: TcpStream,
}

impl Connecter {
    /// The default TCP port to use.
    pub const DEFAULT_PORT: u16 = 13337;

    /// Connection attempts before giving up on a peer that is not listening.
    pub const CONNECT_ATTEMPTS: usize = 150;

    /// Connect to `with` on `port`, or listen on `port` and accept one peer
    /// if `with` is `None`.
    pub fn new_on_port(with: Option<Ipv4Addr>, port: u16) -> Result<Self, ConnectError> {
        let stream = if let Some(addr) = with {
            let server_addr = SocketAddrV4::new(addr, port);
            connect_until_success(
                server_addr,
                Duration::from_millis(200),
                Self::CONNECT_ATTEMPTS,
            )?
        } else {
            let inaddr_any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
            let listener = TcpListener::bind(inaddr_any).map_err(io_err("failed to listen"))?;
            listener.accept().map_err(io_err("failed to accept"))?.0
        };

        if let Ok(peer) = stream.peer_addr() {
            log::info!("control connection established with {}", peer);
        }
        Ok(Self { with, stream })
    }

    /// Same as [`Connecter::new_on_port`] on [`Connecter::DEFAULT_PORT`].
    pub fn new(with: Option<Ipv4Addr>) -> Result<Self, ConnectError> {
        Self::new_on_port(with, Self::DEFAULT_PORT)
    }

    /// Send `local` and return the peer's endpoint.
    ///
    /// The connecting side reads first, so both sides can call this at the
    /// same time without deadlocking on full socket buffers.
    pub fn exchange(&self, local: &QpEndpoint) -> Result<QpEndpoint, ConnectError> {
        let ep = serde_json::to_vec(local)?;
        let mut stream = &self.stream;

        let buf = if self.with.is_some() {
            let buf = stream_read(&mut stream)?;
            stream_write(&mut stream, &ep)?;
            buf
        } else {
            stream_write(&mut stream, &ep)?;
            stream_read(&mut stream)?
        };

        let peer = serde_json::from_slice::<QpEndpoint>(&buf)?;
        log::debug!("peer endpoint: {}", peer);
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::gid::Gid;

    fn vacant_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_exchange() {
        let port = vacant_port();
        let server_ep = QpEndpoint {
            lid: 1,
            gid: Gid::from([0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]),
            qpn: 0x11,
        };
        let client_ep = QpEndpoint {
            lid: 2,
            gid: Gid::from([0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]),
            qpn: 0x12,
        };

        let server = thread::spawn(move || {
            let conn = Connecter::new_on_port(None, port).unwrap();
            conn.exchange(&server_ep).unwrap()
        });
        let conn = Connecter::new_on_port(Some(Ipv4Addr::LOCALHOST), port).unwrap();
        let got = conn.exchange(&client_ep).unwrap();

        assert_eq!(got, server_ep);
        assert_eq!(server.join().unwrap(), client_ep);
    }

    #[test]
    fn test_oversized_message() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&usize::MAX.to_le_bytes()).unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let err = stream_read(&mut &stream).unwrap_err();
        assert!(matches!(err, ConnectError::Oversized(usize::MAX)));
        writer.join().unwrap();
    }
}
