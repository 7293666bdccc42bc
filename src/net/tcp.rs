//! TCP stream sockets.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};

use crate::waitset::{Readiness, WaitState, Waitable};

use super::{interrupted, would_block, Error};

//------------ TcpStream -----------------------------------------------------

/// A non-blocking TCP connection.
///
/// [`open`][Self::open] starts the connect without waiting for it to
/// complete; the socket becomes writable once the connection is
/// established. Until then, sends report zero bytes of progress.
#[derive(Debug)]
pub struct TcpStream {
    inner: Option<mio::net::TcpStream>,
    state: Arc<WaitState>,
}

impl TcpStream {
    /// Opens a connection to the given destination.
    ///
    /// The connect happens in the background. If `no_delay` is set, the
    /// Nagle algorithm is disabled on the new socket.
    pub fn open(
        dst: SocketAddrV4,
        no_delay: bool,
    ) -> Result<TcpStream, Error> {
        let stream = mio::net::TcpStream::connect(SocketAddr::V4(dst))
            .map_err(Error::OpenFailed)?;
        if no_delay {
            stream.set_nodelay(true).map_err(Error::OpenFailed)?;
        }
        Ok(TcpStream {
            inner: Some(stream),
            state: WaitState::new(),
        })
    }

    /// Wraps a stream handed out by a listener.
    pub(super) fn accepted(
        stream: mio::net::TcpStream,
        no_delay: bool,
    ) -> Result<TcpStream, Error> {
        if no_delay {
            stream.set_nodelay(true).map_err(Error::Io)?;
        }
        Ok(TcpStream {
            inner: Some(stream),
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

    /// Returns the local address of the connection.
    pub fn local_addr(&self) -> Result<SocketAddrV4, Error> {
        let stream = self.inner.as_ref().ok_or(Error::NotOpen)?;
        super::v4_addr(stream.local_addr().map_err(Error::Io)?)
    }

    /// Returns the peer address of the connection.
    pub fn peer_addr(&self) -> Result<SocketAddrV4, Error> {
        let stream = self.inner.as_ref().ok_or(Error::NotOpen)?;
        super::v4_addr(stream.peer_addr().map_err(Error::Io)?)
    }

    /// Sends bytes starting at `offset` into `buf`.
    ///
    /// Returns the number of bytes actually handed to the network,
    /// which may be anything down to and including zero.
    pub fn send(
        &mut self,
        buf: &[u8],
        offset: usize,
    ) -> Result<usize, Error> {
        self.state.lower(Readiness::WRITE);
        let stream = self.inner.as_mut().ok_or(Error::NotOpen)?;
        debug_assert!(offset <= buf.len());
        let data = buf.get(offset..).unwrap_or(&[]);
        loop {
            match stream.write(data) {
                Ok(n) => return Ok(n),
                Err(ref err) if interrupted(err) => continue,
                Err(ref err) if would_block(err) => return Ok(0),
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }

    /// Receives bytes into `buf` starting at `offset`.
    ///
    /// Returns the number of bytes read. Zero means either that no data
    /// was pending or that the peer closed the connection.
    pub fn recv(
        &mut self,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<usize, Error> {
        self.state.lower(Readiness::READ);
        let stream = self.inner.as_mut().ok_or(Error::NotOpen)?;
        debug_assert!(offset <= buf.len());
        let data = buf.get_mut(offset..).unwrap_or(&mut []);
        loop {
            match stream.read(data) {
                Ok(n) => return Ok(n),
                Err(ref err) if interrupted(err) => continue,
                Err(ref err) if would_block(err) => return Ok(0),
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }
}

impl Waitable for TcpStream {
    fn wait_state(&self) -> &Arc<WaitState> {
        &self.state
    }

    fn source(&mut self) -> Option<&mut dyn mio::event::Source> {
        match self.inner {
            Some(ref mut stream) => Some(stream),
            None => None,
        }
    }
}

//------------ TcpListener ---------------------------------------------------

/// A non-blocking TCP listening socket.
#[derive(Debug)]
pub struct TcpListener {
    inner: Option<mio::net::TcpListener>,
    no_delay: bool,
    state: Arc<WaitState>,
}

impl TcpListener {
    /// Opens a listening socket on the given local port.
    ///
    /// The socket is opened with the reuse-address option and the given
    /// accept backlog. Connections handed out by
    /// [`accept`][Self::accept] inherit the `no_delay` flag.
    pub fn open(
        port: u16,
        no_delay: bool,
        backlog: u32,
    ) -> Result<TcpListener, Error> {
        let socket =
            Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
                .map_err(Error::OpenFailed)?;
        socket.set_reuse_address(true).map_err(Error::OpenFailed)?;
        socket.set_nonblocking(true).map_err(Error::OpenFailed)?;
        let addr = SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            port,
        ));
        socket.bind(&addr.into()).map_err(Error::OpenFailed)?;
        socket
            .listen(backlog.min(i32::MAX as u32) as i32)
            .map_err(Error::OpenFailed)?;
        Ok(TcpListener {
            inner: Some(mio::net::TcpListener::from_std(socket.into())),
            no_delay,
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

    /// Returns the local address the socket is listening on.
    pub fn local_addr(&self) -> Result<SocketAddrV4, Error> {
        let listener = self.inner.as_ref().ok_or(Error::NotOpen)?;
        super::v4_addr(listener.local_addr().map_err(Error::Io)?)
    }

    /// Accepts one pending connection, if there is one.
    pub fn accept(&mut self) -> Result<Option<TcpStream>, Error> {
        self.state.lower(Readiness::READ);
        let listener = self.inner.as_ref().ok_or(Error::NotOpen)?;
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    return TcpStream::accepted(stream, self.no_delay)
                        .map(Some)
                }
                Err(ref err) if interrupted(err) => continue,
                Err(ref err) if would_block(err) => return Ok(None),
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }
}

impl Waitable for TcpListener {
    fn wait_state(&self) -> &Arc<WaitState> {
        &self.state
    }

    fn source(&mut self) -> Option<&mut dyn mio::event::Source> {
        match self.inner {
            Some(ref mut listener) => Some(listener),
            None => None,
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn closed_stream_reports_not_open() {
        let listener = TcpListener::open(0, false, 8).unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut stream = TcpStream::open(
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
            false,
        )
        .unwrap();
        stream.close();
        match stream.send(b"x", 0) {
            Err(Error::NotOpen) => {}
            other => panic!("expected NotOpen, got {:?}", other),
        }
        let mut buf = [0u8; 4];
        match stream.recv(&mut buf, 0) {
            Err(Error::NotOpen) => {}
            other => panic!("expected NotOpen, got {:?}", other),
        }
    }

    #[test]
    fn accept_without_pending_returns_none() {
        let mut listener = TcpListener::open(0, false, 8).unwrap();
        assert!(listener.accept().unwrap().is_none());
    }
}
