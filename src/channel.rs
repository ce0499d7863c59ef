//! Channels monitored by a managed selector.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::util::NoBlock;

#[cfg(unix)]
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

#[cfg(target_os = "linux")]
const EINPROGRESS: i32 = 115;
#[cfg(target_os = "macos")]
const EINPROGRESS: i32 = 36;

/// A socket-like handle registered with a multiplexer.
///
/// Channels are shared between the selector key table and the endpoint that
/// performs I/O on them, so every operation takes `&self`.
pub trait Channel: Send + Sync + fmt::Debug + 'static {
    /// Best-effort close of the underlying handle. Must be safe to call more
    /// than once.
    fn close(&self);
}

/// Non-blocking TCP stream channel.
pub struct TcpChannel {
    stream: TcpStream,
    connect_pending: AtomicBool,
}

impl TcpChannel {
    /// Wraps an already-connected stream, switching it to non-blocking mode.
    pub fn new(stream: TcpStream) -> io::Result<TcpChannel> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            connect_pending: AtomicBool::new(false),
        })
    }

    /// Starts a non-blocking connect to `addr`. The returned channel reports
    /// [`TcpChannel::is_connect_pending`] until [`TcpChannel::finish_connect`]
    /// observes the connection being established.
    #[cfg(unix)]
    pub fn connect_begin(addr: SocketAddr) -> io::Result<TcpChannel> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;

        // EINPROGRESS is the expected outcome for a non-blocking connect
        let pending = match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => false,
            Err(err) if err.raw_os_error() == Some(EINPROGRESS) => true,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => true,
            Err(err) => return Err(err),
        };

        Ok(Self {
            stream: socket.into(),
            connect_pending: AtomicBool::new(pending),
        })
    }

    /// Checks whether the in-flight connect has completed. Returns `Ok(false)`
    /// while the connect is still pending and an error if the connect failed.
    pub fn finish_connect(&self) -> io::Result<bool> {
        if !self.connect_pending.load(Ordering::Acquire) {
            return Ok(true);
        }
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.connect_pending.store(false, Ordering::Release);
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn is_connect_pending(&self) -> bool {
        self.connect_pending.load(Ordering::Acquire)
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl Channel for TcpChannel {
    fn close(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stream.peer_addr() {
            Ok(addr) => write!(f, "tcp<{addr}>"),
            Err(_) => f.write_str("tcp<pending>"),
        }
    }
}

#[cfg(unix)]
impl AsRawFd for TcpChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Non-blocking TCP listener channel.
pub struct TcpServerChannel {
    listener: TcpListener,
}

impl TcpServerChannel {
    pub fn bind(addr: SocketAddr) -> io::Result<TcpServerChannel> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    /// Accepts the next pending connection, or `None` once the kernel reports
    /// would-block.
    pub fn accept(&self) -> io::Result<Option<TcpChannel>> {
        match self.listener.accept().no_block()? {
            Some((stream, _addr)) => Ok(Some(TcpChannel::new(stream)?)),
            None => Ok(None),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Channel for TcpServerChannel {
    fn close(&self) {
        // the socket is released when the listener is dropped with the key
    }
}

impl fmt::Debug for TcpServerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.listener.local_addr() {
            Ok(addr) => write!(f, "tcp-server<{addr}>"),
            Err(_) => f.write_str("tcp-server<?>"),
        }
    }
}

#[cfg(unix)]
impl AsRawFd for TcpServerChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}
