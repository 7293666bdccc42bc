//! Non-blocking sockets.
//!
//! The socket types here never block: an operation either makes
//! progress immediately or reports that it could not, leaving it to a
//! [`WaitSet`][crate::waitset::WaitSet] to tell the owner when trying
//! again is worthwhile. Each socket carries the readiness flags for
//! that protocol; every data operation lowers its corresponding flag
//! up front, even when the operation then fails, so a wait set never
//! keeps reporting stale readiness.
//!
//! Transient conditions are handled locally and never surface:
//! interrupted system calls are retried, would-block is reported as
//! zero bytes of progress. Everything else is fatal for the socket.

use std::{error, fmt, io};

pub mod tcp;
pub mod udp;

pub use self::tcp::{TcpListener, TcpStream};
pub use self::udp::UdpSocket;

//------------ Error ---------------------------------------------------------

/// An error happened on a socket.
#[derive(Debug)]
pub enum Error {
    /// The socket is not open.
    NotOpen,

    /// Opening the socket failed.
    OpenFailed(io::Error),

    /// An operation on the open socket failed fatally.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::NotOpen => f.write_str("socket is not open"),
            Error::OpenFailed(ref err) => {
                write!(f, "opening socket failed: {}", err)
            }
            Error::Io(ref err) => err.fmt(f),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

//------------ Helpers -------------------------------------------------------

/// Returns whether the operation should simply be retried.
pub(crate) fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

/// Returns whether the operation would have had to block.
pub(crate) fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Extracts the IPv4 form of a socket address.
///
/// All sockets here are IPv4 sockets, so the IPv6 case marks a socket
/// in a state we cannot work with.
pub(crate) fn v4_addr(
    addr: std::net::SocketAddr,
) -> Result<std::net::SocketAddrV4, Error> {
    match addr {
        std::net::SocketAddr::V4(addr) => Ok(addr),
        std::net::SocketAddr::V6(_) => Err(Error::Io(io::Error::new(
            io::ErrorKind::Other,
            "socket has an IPv6 address",
        ))),
    }
}
