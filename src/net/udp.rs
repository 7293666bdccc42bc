//! UDP datagram sockets.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use crate::waitset::{Readiness, WaitState, Waitable};

use super::{interrupted, would_block, Error};

//------------ UdpSocket -----------------------------------------------------

/// A non-blocking UDP socket.
///
/// Datagram sends are all or nothing: either the full datagram is
/// handed to the network or nothing is. Oversized incoming datagrams
/// are silently truncated to the receive buffer.
#[derive(Debug)]
pub struct UdpSocket {
    inner: Option<mio::net::UdpSocket>,
    state: Arc<WaitState>,
}

impl UdpSocket {
    /// Opens a UDP socket bound to the given local port.
    ///
    /// Port 0 requests an ephemeral port. The broadcast option is
    /// enabled on the new socket.
    pub fn open(port: u16) -> Result<UdpSocket, Error> {
        let addr = SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            port,
        ));
        let sock =
            mio::net::UdpSocket::bind(addr).map_err(Error::OpenFailed)?;
        sock.set_broadcast(true).map_err(Error::OpenFailed)?;
        Ok(UdpSocket {
            inner: Some(sock),
            state: WaitState::new(),
        })
    }

    /// Returns whether the socket is open.
    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Closes the socket.
    pub fn close(&mut self) {
        self.inner = None;
        self.state.reset();
    }

    /// Returns the readiness flags of the socket.
    pub fn ready(&self) -> Readiness {
        self.state.readiness()
    }

    /// Returns the local address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddrV4, Error> {
        let sock = self.inner.as_ref().ok_or(Error::NotOpen)?;
        super::v4_addr(sock.local_addr().map_err(Error::Io)?)
    }

    /// Sends one datagram to the given destination.
    ///
    /// Returns the number of bytes sent, which is either the full
    /// length of `buf` or, if sending would have blocked, zero.
    pub fn send_to(
        &mut self,
        buf: &[u8],
        dst: SocketAddrV4,
    ) -> Result<usize, Error> {
        self.state.lower(Readiness::WRITE);
        let sock = self.inner.as_ref().ok_or(Error::NotOpen)?;
        loop {
            match sock.send_to(buf, SocketAddr::V4(dst)) {
                Ok(n) => return Ok(n),
                Err(ref err) if interrupted(err) => continue,
                Err(ref err) if would_block(err) => return Ok(0),
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }

    /// Receives one datagram.
    ///
    /// Returns the number of bytes received and the sender's address,
    /// or `None` if no datagram was pending.
    pub fn recv_from(
        &mut self,
        buf: &mut [u8],
    ) -> Result<Option<(usize, SocketAddrV4)>, Error> {
        self.state.lower(Readiness::READ);
        let sock = self.inner.as_ref().ok_or(Error::NotOpen)?;
        loop {
            match sock.recv_from(buf) {
                Ok((n, SocketAddr::V4(from))) => {
                    return Ok(Some((n, from)))
                }
                // The socket is bound to an IPv4 address.
                Ok((_, SocketAddr::V6(_))) => continue,
                Err(ref err) if interrupted(err) => continue,
                Err(ref err) if would_block(err) => return Ok(None),
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }
}

impl Waitable for UdpSocket {
    fn wait_state(&self) -> &Arc<WaitState> {
        &self.state
    }

    fn source(&mut self) -> Option<&mut dyn mio::event::Source> {
        match self.inner {
            Some(ref mut sock) => Some(sock),
            None => None,
        }
    }
}

//============ Testing =======================================================
