//! # Socket Transport
//!
//! Purpose: Move bytes over one TCP connection with bounded waits.
//!
//! ## Design Principles
//! 1. **Two-Phase Connect**: The handshake is bounded by the connect timeout;
//!    afterwards the socket is blocking with short send/receive timeouts.
//! 2. **Stall Budget**: Looping reads and writes tolerate a fixed number of
//!    consecutive timeouts or trickling transfers before giving up.
//! 3. **Distinct Outcomes**: "Nothing yet" (`Ok(0)`), peer close
//!    (`KvError::Closed`), stall (`KvError::Timeout`) and hard failures
//!    (`KvError::Network`) never collapse into one another.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{IpAddr, Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use kvlink_common::{KvError, KvResult};
use tracing::{debug, trace};

/// Consecutive stalled transfers tolerated by the looping calls.
pub const STALL_LIMIT: u32 = 100;

/// A transfer of at most this many bytes counts as a stall.
const TRICKLE_BYTES: usize = 8;

/// Byte channel used by a connection.
///
/// `TcpTransport` is the production implementation; tests substitute
/// scripted transports.
pub trait Transport: Send {
    /// Writes all of `data`, returning the number of bytes written.
    fn send_all(&mut self, data: &[u8]) -> KvResult<usize>;

    /// Fills `buf` completely.
    fn recv_exact(&mut self, buf: &mut [u8]) -> KvResult<usize>;

    /// Performs one receive. `Ok(0)` means nothing arrived within the poll
    /// quantum and the caller should poll again.
    fn recv_available(&mut self, buf: &mut [u8]) -> KvResult<usize>;

    fn close(&mut self);

    fn is_closed(&self) -> bool;

    /// Local address of the connection, used to build lock identifiers.
    fn local_ip(&self) -> Option<IpAddr> {
        None
    }
}

/// Blocking TCP transport with socket-level send/receive timeouts.
#[derive(Debug, Default)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
}

impl TcpTransport {
    /// Connects to `host:port`, trying each resolved address in turn.
    ///
    /// `connect_timeout` bounds each handshake; `io_timeout` becomes the
    /// send and receive timeout of the established socket.
    pub fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> KvResult<Self> {
        let addrs = (host, port).to_socket_addrs().map_err(KvError::Network)?;

        let mut last_err = None;
        for addr in addrs {
            let attempt = if connect_timeout.is_zero() {
                TcpStream::connect(addr)
            } else {
                TcpStream::connect_timeout(&addr, connect_timeout)
            };
            match attempt {
                Ok(stream) => {
                    configure(&stream, io_timeout).map_err(KvError::Network)?;
                    debug!(%addr, "connected");
                    return Ok(TcpTransport {
                        stream: Some(stream),
                    });
                }
                Err(err) => {
                    debug!(%addr, error = %err, "connect attempt failed");
                    last_err = Some(err);
                }
            }
        }

        Err(match last_err {
            Some(err) if err.kind() == ErrorKind::TimedOut => KvError::Timeout,
            Some(err) => KvError::Network(err),
            None => KvError::Network(io::Error::new(
                ErrorKind::AddrNotAvailable,
                format!("{host} resolved to no addresses"),
            )),
        })
    }

    /// Wraps an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        TcpTransport {
            stream: Some(stream),
        }
    }

    fn stream(&mut self) -> KvResult<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| KvError::Network(io::Error::from(ErrorKind::NotConnected)))
    }
}

impl Transport for TcpTransport {
    fn send_all(&mut self, data: &[u8]) -> KvResult<usize> {
        let stream = self.stream()?;
        let mut stalls = Stalls::default();
        let mut written = 0;

        while written < data.len() {
            match stream.write(&data[written..]) {
                Ok(n) if n > 0 => {
                    stalls.progress(n)?;
                    written += n;
                }
                Ok(_) => stalls.stall()?,
                Err(err) if is_stall(&err) => stalls.stall()?,
                Err(err) => return Err(KvError::Network(err)),
            }
        }
        Ok(written)
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> KvResult<usize> {
        let stream = self.stream()?;
        let mut stalls = Stalls::default();
        let mut read = 0;

        while read < buf.len() {
            match stream.read(&mut buf[read..]) {
                Ok(0) => return Err(KvError::Closed),
                Ok(n) => {
                    stalls.progress(n)?;
                    read += n;
                }
                Err(err) if is_stall(&err) => stalls.stall()?,
                Err(err) => return Err(KvError::Network(err)),
            }
        }
        Ok(read)
    }

    fn recv_available(&mut self, buf: &mut [u8]) -> KvResult<usize> {
        let stream = self.stream()?;
        match stream.read(buf) {
            Ok(0) if !buf.is_empty() => Err(KvError::Closed),
            Ok(n) => Ok(n),
            Err(err) if is_stall(&err) => Ok(0),
            Err(err) => Err(KvError::Network(err)),
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            // The socket is closed on drop either way.
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn local_ip(&self) -> Option<IpAddr> {
        self.stream
            .as_ref()
            .and_then(|stream| stream.local_addr().ok())
            .map(|addr| addr.ip())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consecutive-stall counter shared by the looping transfers.
#[derive(Debug, Default)]
struct Stalls {
    count: u32,
}

impl Stalls {
    fn progress(&mut self, transferred: usize) -> KvResult<()> {
        if transferred > TRICKLE_BYTES {
            self.count = 0;
            Ok(())
        } else {
            self.stall()
        }
    }

    fn stall(&mut self) -> KvResult<()> {
        self.count += 1;
        if self.count > STALL_LIMIT {
            trace!(stalls = self.count, "transfer stalled");
            return Err(KvError::Timeout);
        }
        Ok(())
    }
}

fn configure(stream: &TcpStream, io_timeout: Duration) -> io::Result<()> {
    stream.set_read_timeout(Some(io_timeout))?;
    stream.set_write_timeout(Some(io_timeout))?;
    // Disable Nagle to keep request latency low for small payloads.
    stream.set_nodelay(true)
}

fn is_stall(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    const QUANTUM: Duration = Duration::from_millis(10);

    fn pair() -> (TcpTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || listener.accept().unwrap().0);
        let transport =
            TcpTransport::connect("127.0.0.1", port, Duration::from_secs(1), QUANTUM).unwrap();
        (transport, handle.join().unwrap())
    }

    #[test]
    fn send_and_receive_exact() {
        let (mut transport, mut peer) = pair();
        assert_eq!(transport.send_all(b"hello world").unwrap(), 11);
        let mut got = [0u8; 11];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"hello world");

        peer.write_all(b"0123456789abcdef").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(transport.recv_exact(&mut buf).unwrap(), 16);
        assert_eq!(&buf, b"0123456789abcdef");
    }

    #[test]
    fn idle_receive_reports_nothing_yet() {
        let (mut transport, _peer) = pair();
        let mut buf = [0u8; 8];
        assert_eq!(transport.recv_available(&mut buf).unwrap(), 0);
    }

    #[test]
    fn peer_close_is_distinct() {
        let (mut transport, peer) = pair();
        drop(peer);
        let mut buf = [0u8; 8];
        assert!(matches!(transport.recv_available(&mut buf), Err(KvError::Closed)));
        assert!(matches!(transport.recv_exact(&mut buf), Err(KvError::Closed)));
    }

    #[test]
    fn silent_peer_times_out_exact_read() {
        let (mut transport, _peer) = pair();
        let mut buf = [0u8; 4];
        assert!(matches!(transport.recv_exact(&mut buf), Err(KvError::Timeout)));
    }

    #[test]
    fn closed_transport_rejects_io() {
        let (mut transport, _peer) = pair();
        assert!(transport.local_ip().is_some());
        transport.close();
        assert!(transport.is_closed());
        assert!(matches!(transport.send_all(b"x"), Err(KvError::Network(_))));
    }

    #[test]
    fn trickle_progress_exhausts_stall_budget() {
        let mut stalls = Stalls::default();
        for _ in 0..STALL_LIMIT {
            stalls.progress(TRICKLE_BYTES).unwrap();
        }
        assert!(matches!(stalls.progress(1), Err(KvError::Timeout)));
    }

    #[test]
    fn real_progress_resets_stall_budget() {
        let mut stalls = Stalls::default();
        for _ in 0..STALL_LIMIT {
            stalls.stall().unwrap();
        }
        stalls.progress(TRICKLE_BYTES + 1).unwrap();
        for _ in 0..STALL_LIMIT {
            stalls.stall().unwrap();
        }
        assert!(matches!(stalls.stall(), Err(KvError::Timeout)));
    }

    #[test]
    fn refused_connect_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let result = TcpTransport::connect("127.0.0.1", port, Duration::from_millis(200), QUANTUM);
        assert!(result.is_err());
    }
}
