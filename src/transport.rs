//! The byte channel a link runs over.
//!
//! A [`Transport`] only moves bytes. Serial ports and TCP streams are
//! adapted with [`StreamTransport`], datagram links with [`UdpTransport`].

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use log::{debug, trace};
use snafu::{ensure, ResultExt, Snafu};

/// Serial line speed, in baud. Characters are 8 data bits with even parity
/// and one stop bit, without flow control.
pub const BAUD_RATE: u32 = 1200;

/// Error type for transports.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Transport is not open"))]
    NotOpen,
    #[snafu(display("I/O error while trying to {operation}"))]
    Io {
        operation: &'static str,
        source: std::io::Error,
    },
}

/// Faults reported by the receiving hardware. None of them are fatal, but
/// they count towards the link fault limit.
#[derive(Debug, Snafu, Copy, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TransportFault {
    #[snafu(display("Receive buffer overflow"))]
    RxOverflow,
    #[snafu(display("Character buffer overrun"))]
    Overrun,
    #[snafu(display("Parity error"))]
    Parity,
    #[snafu(display("Framing error"))]
    Framing,
    #[snafu(display("Transmit buffer full"))]
    TxBufferFull,
}

/// Physical line condition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LineState {
    Idle,
    /// The line is held in the spacing state, i.e. disconnected.
    Break,
}

/// Result of one bounded receive call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Received {
    /// This many bytes were written to the start of the buffer.
    Data(usize),
    /// Nothing arrived before the timeout.
    Nothing,
    Line(LineState),
    Fault(TransportFault),
    /// The peer closed the connection.
    Closed,
}

/// Byte channel between the two ends of a link.
pub trait Transport {
    /// # Errors
    /// Returns an error if the channel can't be opened.
    fn open(&mut self) -> Result<(), Error>;

    /// # Errors
    /// Returns an error if the channel can't be closed cleanly.
    fn close(&mut self) -> Result<(), Error>;

    /// Write all of `data`.
    /// # Errors
    /// Returns an error if the bytes couldn't be written.
    fn send_bytes(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Wait at most about `timeout` for received bytes or line events.
    /// # Errors
    /// Returns an error on I/O failure. A timeout is `Ok(Received::Nothing)`.
    fn receive_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Received, Error>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> Result<(), Error> {
        (**self).open()
    }

    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }

    fn send_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        (**self).send_bytes(data)
    }

    fn receive_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Received, Error> {
        (**self).receive_bytes(buf, timeout)
    }
}

/// Adapts any `Read + Write` byte stream, e.g. a serial port or a
/// `TcpStream`.
///
/// Reads are bounded by the stream's own read timeout, which should be
/// short (100 ms or less). Timed out reads are reported as
/// [`Received::Nothing`], and end of stream as [`Received::Closed`].
#[derive(Debug)]
pub struct StreamTransport<IO> {
    io: IO,
    open: bool,
}

impl<IO: Read + Write> StreamTransport<IO> {
    pub fn new(io: IO) -> Self {
        Self { io, open: false }
    }

    pub fn get_ref(&self) -> &IO {
        &self.io
    }

    pub fn get_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    pub fn into_inner(self) -> IO {
        self.io
    }
}

impl<IO: Read + Write> Transport for StreamTransport<IO> {
    fn open(&mut self) -> Result<(), Error> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.open {
            self.open = false;
            self.io.flush().context(IoSnafu { operation: "flush" })?;
        }
        Ok(())
    }

    fn send_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        ensure!(self.open, NotOpenSnafu);
        trace!("Writing {:02x?}", data);
        self.io
            .write_all(data)
            .and_then(|_| self.io.flush())
            .context(IoSnafu { operation: "write" })
    }

    fn receive_bytes(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<Received, Error> {
        ensure!(self.open, NotOpenSnafu);
        match self.io.read(buf) {
            Ok(0) => Ok(Received::Closed),
            Ok(len) => Ok(Received::Data(len)),
            Err(err) if is_timeout(&err) => Ok(Received::Nothing),
            Err(source) => Err(Error::Io {
                operation: "read",
                source,
            }),
        }
    }
}

/// Datagram transport. Each frame travels in its own datagram, and only
/// datagrams from the configured peer are accepted.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
    open: bool,
}

impl UdpTransport {
    /// # Errors
    /// Returns an error if the local address can't be bound.
    pub fn bind(local: SocketAddr, peer: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(local).context(IoSnafu { operation: "bind" })?;
        Ok(Self::from_socket(socket, peer))
    }

    pub fn from_socket(socket: UdpSocket, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            open: false,
        }
    }

    /// # Errors
    /// Returns an error if the socket address can't be read.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.socket
            .local_addr()
            .context(IoSnafu { operation: "get local address" })
    }
}

impl Transport for UdpTransport {
    fn open(&mut self) -> Result<(), Error> {
        self.socket
            .connect(self.peer)
            .context(IoSnafu { operation: "connect" })?;
        debug!("UDP link {:?} <-> {}", self.socket.local_addr().ok(), self.peer);
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.open = false;
        Ok(())
    }

    fn send_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        ensure!(self.open, NotOpenSnafu);
        trace!("Sending datagram {:02x?}", data);
        self.socket
            .send(data)
            .context(IoSnafu { operation: "send" })?;
        Ok(())
    }

    fn receive_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Received, Error> {
        ensure!(self.open, NotOpenSnafu);
        // a zero timeout would mean blocking forever
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket
            .set_read_timeout(Some(timeout))
            .context(IoSnafu { operation: "set read timeout" })?;
        match self.socket.recv(buf) {
            Ok(len) => Ok(Received::Data(len)),
            Err(err) if is_timeout(&err) => Ok(Received::Nothing),
            // ICMP port unreachable from a peer that isn't up yet
            Err(err) if err.kind() == ErrorKind::ConnectionRefused => Ok(Received::Nothing),
            Err(source) => Err(Error::Io {
                operation: "receive",
                source,
            }),
        }
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}
