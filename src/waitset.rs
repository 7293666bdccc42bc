//! Waiting for readiness of several objects at once.
//!
//! A [`WaitSet`] multiplexes a bounded set of [`Waitable`] objects. The
//! owner registers each object with the events it is interested in,
//! then blocks in [`wait`][WaitSet::wait] until at least one object
//! becomes ready or the timeout fires. Readiness is recorded in a small
//! per-object flag set that the object's I/O operations consume: a
//! flag stays raised until the corresponding operation runs.
//!
//! The poll behind the set signals readiness on transitions, not
//! levels. Consumers therefore drain an object until its operation
//! reports no further progress rather than performing a single
//! operation per wakeup; the flags are a wake protocol, not a level
//! indicator.

use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{error, fmt, ops};

use mio::{Events, Poll, Token};

pub use mio::Interest;

//------------ Readiness -----------------------------------------------------

/// The readiness flags of a single waitable object.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Readiness(u8);

impl Readiness {
    /// No flag is raised.
    pub const NONE: Readiness = Readiness(0);

    /// The object can be read from without blocking.
    pub const READ: Readiness = Readiness(0b001);

    /// The object can be written to without blocking.
    pub const WRITE: Readiness = Readiness(0b010);

    /// The object entered an error state or was closed by the peer.
    pub const ERROR: Readiness = Readiness(0b100);

    /// Returns whether all flags of `other` are raised in `self`.
    pub fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns whether the READ flag is raised.
    pub fn is_readable(self) -> bool {
        self.contains(Readiness::READ)
    }

    /// Returns whether the WRITE flag is raised.
    pub fn is_writable(self) -> bool {
        self.contains(Readiness::WRITE)
    }

    /// Returns whether the ERROR flag is raised.
    pub fn is_error(self) -> bool {
        self.contains(Readiness::ERROR)
    }

    /// Returns whether no flag is raised.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl ops::BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, other: Readiness) -> Readiness {
        Readiness(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Readiness {
    fn bitor_assign(&mut self, other: Readiness) {
        self.0 |= other.0
    }
}

//------------ WaitState -----------------------------------------------------

/// Readiness state shared between a waitable object and its wait set.
///
/// The object owns one end and consumes flags from it; the wait set
/// holds the other end and raises flags when the poll reports events.
/// The membership token doubles as the proof that the object is in at
/// most one wait set at a time.
#[derive(Debug)]
pub struct WaitState {
    flags: AtomicU8,
    token: AtomicUsize,
}

/// Token value marking an object that is in no wait set.
const NO_TOKEN: usize = usize::MAX;

impl WaitState {
    /// Creates a fresh, unregistered state.
    pub fn new() -> Arc<WaitState> {
        Arc::new(WaitState {
            flags: AtomicU8::new(0),
            token: AtomicUsize::new(NO_TOKEN),
        })
    }

    /// Returns the currently raised flags.
    pub fn readiness(&self) -> Readiness {
        Readiness(self.flags.load(Ordering::Acquire))
    }

    /// Raises the given flags.
    pub(crate) fn raise(&self, flags: Readiness) {
        self.flags.fetch_or(flags.0, Ordering::AcqRel);
    }

    /// Lowers the given flags.
    pub(crate) fn lower(&self, flags: Readiness) {
        self.flags.fetch_and(!flags.0, Ordering::AcqRel);
    }

    /// Lowers all flags.
    pub(crate) fn reset(&self) {
        self.flags.store(0, Ordering::Release);
    }

    fn slot(&self) -> Option<usize> {
        match self.token.load(Ordering::Acquire) {
            NO_TOKEN => None,
            token => Some(token),
        }
    }

    fn set_slot(&self, slot: usize) {
        self.token.store(slot, Ordering::Release);
    }

    fn clear_slot(&self) {
        self.token.store(NO_TOKEN, Ordering::Release);
    }
}

//------------ Waitable ------------------------------------------------------

/// An object that can be registered in a [`WaitSet`].
pub trait Waitable {
    /// Returns the readiness state shared with the owning wait set.
    fn wait_state(&self) -> &Arc<WaitState>;

    /// Returns the poll registration source.
    ///
    /// Returns `None` if the object has been closed and can no longer
    /// be registered.
    fn source(&mut self) -> Option<&mut dyn mio::event::Source>;
}

//------------ WaitSet -------------------------------------------------------

/// A bounded multiplexer over waitable objects.
///
/// The capacity is fixed at creation, as is the event buffer used by
/// [`wait`][Self::wait].
#[derive(Debug)]
pub struct WaitSet {
    poll: Poll,
    events: Events,
    slots: Vec<Option<Arc<WaitState>>>,
}

impl WaitSet {
    /// Creates a new wait set for at most `capacity` objects.
    pub fn new(capacity: usize) -> Result<Self, Error> {
        Ok(WaitSet {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(1)),
            slots: vec![None; capacity],
        })
    }

    /// Returns the maximum number of objects the set can hold.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of objects currently in the set.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_none())
    }

    /// Adds a waitable to the set.
    ///
    /// Fails with [`Error::SetFull`] if the set is at capacity and with
    /// [`Error::AlreadyInSet`] if the waitable is registered anywhere.
    pub fn add(
        &mut self,
        waitable: &mut dyn Waitable,
        interest: Interest,
    ) -> Result<(), Error> {
        let state = waitable.wait_state().clone();
        if state.slot().is_some() {
            return Err(Error::AlreadyInSet);
        }
        let slot = match self.slots.iter().position(|s| s.is_none()) {
            Some(slot) => slot,
            None => return Err(Error::SetFull),
        };
        let source = waitable.source().ok_or(Error::Closed)?;
        self.poll.registry().register(source, Token(slot), interest)?;
        state.set_slot(slot);
        self.slots[slot] = Some(state);
        Ok(())
    }

    /// Changes the interest of a waitable already in the set.
    pub fn change(
        &mut self,
        waitable: &mut dyn Waitable,
        interest: Interest,
    ) -> Result<(), Error> {
        let slot = self.member_slot(waitable)?;
        let source = waitable.source().ok_or(Error::Closed)?;
        self.poll
            .registry()
            .reregister(source, Token(slot), interest)?;
        Ok(())
    }

    /// Removes a waitable from the set.
    ///
    /// All readiness flags of the object are lowered.
    pub fn remove(
        &mut self,
        waitable: &mut dyn Waitable,
    ) -> Result<(), Error> {
        let slot = self.member_slot(waitable)?;
        if let Some(source) = waitable.source() {
            // A closed object was deregistered by the OS already.
            self.poll.registry().deregister(source)?;
        }
        let state = waitable.wait_state();
        state.clear_slot();
        state.reset();
        self.slots[slot] = None;
        Ok(())
    }

    /// Blocks until at least one object is ready or the timeout fires.
    ///
    /// Raises the readiness flags of every object the poll reported and
    /// returns how many reports there were. Zero means the timeout
    /// fired first.
    pub fn wait(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<usize, Error> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(ref err)
                    if err.kind() == io::ErrorKind::Interrupted =>
                {
                    continue
                }
                Err(err) => return Err(Error::Io(err)),
            }
        }
        let mut count = 0;
        for event in self.events.iter() {
            let state = match self.slots.get(event.token().0) {
                Some(Some(state)) => state,
                _ => continue,
            };
            let mut flags = Readiness::NONE;
            if event.is_readable() || event.is_read_closed() {
                flags |= Readiness::READ;
            }
            if event.is_writable() {
                flags |= Readiness::WRITE;
            }
            if event.is_error()
                || (event.is_read_closed() && event.is_write_closed())
            {
                flags |= Readiness::ERROR;
            }
            if !flags.is_none() {
                state.raise(flags);
                count += 1;
            }
        }
        Ok(count)
    }

    /// Returns the slot of a waitable that must be in this set.
    fn member_slot(
        &self,
        waitable: &dyn Waitable,
    ) -> Result<usize, Error> {
        let state = waitable.wait_state();
        let slot = state.slot().ok_or(Error::NotInSet)?;
        match self.slots.get(slot) {
            Some(Some(member)) if Arc::ptr_eq(member, state) => Ok(slot),
            _ => Err(Error::NotInSet),
        }
    }
}

//------------ Error ---------------------------------------------------------

/// An error happened while manipulating a wait set.
#[derive(Debug)]
pub enum Error {
    /// The set is at capacity.
    SetFull,

    /// The waitable is not a member of this set.
    NotInSet,

    /// The waitable is already a member of a set.
    AlreadyInSet,

    /// The waitable has been closed.
    Closed,

    /// The underlying poll failed.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::SetFull => f.write_str("wait set is full"),
            Error::NotInSet => f.write_str("waitable is not in the set"),
            Error::AlreadyInSet => {
                f.write_str("waitable is already in a wait set")
            }
            Error::Closed => f.write_str("waitable has been closed"),
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

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::UdpSocket;

    #[test]
    fn capacity_is_enforced() {
        let mut set = WaitSet::new(1).unwrap();
        let mut first = UdpSocket::open(0).unwrap();
        let mut second = UdpSocket::open(0).unwrap();
        set.add(&mut first, Interest::READABLE).unwrap();
        match set.add(&mut second, Interest::READABLE) {
            Err(Error::SetFull) => {}
            other => panic!("expected SetFull, got {:?}", other.err()),
        }
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn double_add_is_rejected() {
        let mut set = WaitSet::new(2).unwrap();
        let mut sock = UdpSocket::open(0).unwrap();
        set.add(&mut sock, Interest::READABLE).unwrap();
        match set.add(&mut sock, Interest::READABLE) {
            Err(Error::AlreadyInSet) => {}
            other => panic!("expected AlreadyInSet, got {:?}", other.err()),
        }
    }

    #[test]
    fn remove_of_stranger_fails() {
        let mut set = WaitSet::new(1).unwrap();
        let mut sock = UdpSocket::open(0).unwrap();
        match set.remove(&mut sock) {
            Err(Error::NotInSet) => {}
            other => panic!("expected NotInSet, got {:?}", other.err()),
        }
    }

    #[test]
    fn add_remove_add() {
        let mut set = WaitSet::new(1).unwrap();
        let mut sock = UdpSocket::open(0).unwrap();
        set.add(&mut sock, Interest::READABLE).unwrap();
        set.remove(&mut sock).unwrap();
        assert!(set.is_empty());
        set.add(&mut sock, Interest::READABLE).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn wait_times_out() {
        let mut set = WaitSet::new(1).unwrap();
        let mut sock = UdpSocket::open(0).unwrap();
        set.add(&mut sock, Interest::READABLE).unwrap();
        let count = set
            .wait(Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(count, 0);
    }
}
