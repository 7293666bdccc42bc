//! Asynchronous host name resolution.
//!
//! This is a stub resolver for IPv4 addresses: every lookup becomes a
//! single A record query to one upstream recursive server, sent over a
//! UDP socket shared by all lookups of a [`HostResolver`] service. A
//! single worker thread multiplexes any number of in-flight lookups
//! over that socket, recycling 16 bit transaction ids and firing
//! deadline timeouts, and reports each completion exactly once through
//! the caller's [`LookupHandler`].
//!
//! The handler doubles as the identity of a lookup: a caller can have
//! at most one lookup in flight per handler, and [`cancel`] addresses
//! the lookup through the same handler. Completion callbacks run on
//! the worker thread with no internal lock held, so a handler is free
//! to start its next lookup right from the callback.
//!
//! ```no_run
//! use std::sync::{mpsc, Arc, Mutex};
//! use netwait::resolv::{HostResolver, LookupHandler, Outcome};
//!
//! struct Printer(Mutex<mpsc::Sender<Outcome>>);
//!
//! impl LookupHandler for Printer {
//!     fn on_completed(&self, outcome: Outcome) {
//!         self.0.lock().unwrap().send(outcome).ok();
//!     }
//! }
//!
//! let (tx, rx) = mpsc::channel();
//! let handler: Arc<dyn LookupHandler> =
//!     Arc::new(Printer(Mutex::new(tx)));
//! let resolver = HostResolver::new();
//! resolver.resolve(&handler, "example.com", 5000).unwrap();
//! println!("{:?}", rx.recv().unwrap());
//! ```
//!
//! [`cancel`]: HostResolver::cancel

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::{error, fmt, io};

use crate::ticks::{Clock, SystemClock};

mod registry;
mod wire;
mod worker;

use self::worker::{Shared, WorkerMessage};

//------------ Module Configuration ------------------------------------------

/// The upstream resolver queried unless configured otherwise.
const DEFAULT_UPSTREAM: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);

//------------ Outcome -------------------------------------------------------

/// The result of a lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The host name resolved to this address.
    Ok(Ipv4Addr),

    /// The deadline passed before a reply arrived.
    Timeout,

    /// The lookup failed: the server reported an error, the reply was
    /// unusable, or the socket broke down.
    Error,
}

//------------ LookupHandler -------------------------------------------------

/// The completion callback of a lookup.
///
/// Implemented by the caller. For every lookup that is not cancelled,
/// [`on_completed`][Self::on_completed] runs exactly once, on the
/// worker thread. It must not panic. It may start new lookups on any
/// handler and cancel lookups of other handlers.
pub trait LookupHandler: Send + Sync {
    /// Called once with the result of the lookup.
    fn on_completed(&self, outcome: Outcome);
}

//------------ Config --------------------------------------------------------

/// Configuration of a resolver service.
#[derive(Clone)]
pub struct Config {
    /// The upstream recursive resolver queries are sent to.
    pub upstream: SocketAddrV4,

    /// The tick source deadlines are measured against.
    pub clock: Arc<dyn Clock>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            upstream: DEFAULT_UPSTREAM,
            clock: Arc::new(SystemClock::new()),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("upstream", &self.upstream)
            .finish()
    }
}

//------------ HostResolver --------------------------------------------------

/// An asynchronous host name resolver service.
///
/// Cloning the service is cheap and every clone drives the same worker
/// and registry. The worker thread is started by the first lookup and
/// winds down once no lookup is left; a later lookup starts a fresh
/// one.
#[derive(Clone, Debug)]
pub struct HostResolver {
    inner: Arc<Inner>,
}

impl HostResolver {
    /// Creates a service with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a service with the given configuration.
    pub fn with_config(config: Config) -> Self {
        HostResolver {
            inner: Arc::new(Inner {
                config,
                shared: Mutex::new(Shared::new()),
            }),
        }
    }

    /// Returns the process wide default service.
    pub fn global() -> &'static HostResolver {
        static GLOBAL: OnceLock<HostResolver> = OnceLock::new();
        GLOBAL.get_or_init(HostResolver::new)
    }

    /// Starts resolving a host name.
    ///
    /// The lookup is identified by the handler: `handler` must not have
    /// another lookup in flight. Unless the lookup is cancelled, the
    /// handler's [`on_completed`][LookupHandler::on_completed] will run
    /// exactly once, no later than roughly `timeout` milliseconds from
    /// now.
    pub fn resolve(
        &self,
        handler: &Arc<dyn LookupHandler>,
        hostname: &str,
        timeout: u32,
    ) -> Result<(), Error> {
        wire::check_name(hostname).map_err(|err| match err {
            wire::NameError::TooLong | wire::NameError::LongLabel => {
                Error::NameTooLong
            }
            wire::NameError::EmptyLabel => Error::InvalidName,
        })?;
        let caller = caller_key(handler);
        let mut shared = self.inner.lock();
        if shared.shutting_down {
            return Err(Error::ShuttingDown);
        }
        if shared.registry.contains_caller(caller) {
            return Err(Error::AlreadyInProgress);
        }
        let id = shared
            .registry
            .find_free_id()
            .ok_or(Error::TooManyRequests)?;
        let now = self.inner.config.clock.now();
        let pending = shared.registry.insert(
            caller,
            handler.clone(),
            hostname.to_owned(),
            id,
            now,
            timeout,
        );
        // A quit that is still in flight must not tear down the worker
        // now that it has work again.
        shared.pending_quit = false;
        if shared.worker.is_none() {
            match worker::spawn(&self.inner, now) {
                Ok(worker) => shared.worker = Some(worker),
                Err(err) => {
                    shared.registry.remove_by_caller(caller);
                    return Err(err);
                }
            }
        }
        if pending == 1 {
            if let Some(ref worker) = shared.worker {
                let _ =
                    worker.sender.send(WorkerMessage::StartSending);
            }
        }
        Ok(())
    }

    /// Cancels the lookup identified by the handler.
    ///
    /// Returns whether a lookup was cancelled. After `true`, the
    /// handler will not be called for the cancelled lookup; `false`
    /// means no lookup was in flight, possibly because it had already
    /// completed.
    pub fn cancel(&self, handler: &Arc<dyn LookupHandler>) -> bool {
        let caller = caller_key(handler);
        let mut shared = self.inner.lock();
        let record = match shared.registry.remove_by_caller(caller) {
            Some(record) => record,
            None => return false,
        };
        if shared.registry.is_empty() {
            if let Some(sender) = shared.worker.as_ref().map(|worker| worker.sender.clone()) {
                shared.pending_quit = true;
                let _ = sender.send(WorkerMessage::Quit);
            }
        }
        drop(shared);
        // The record holds the handler; drop it outside the lock.
        drop(record);
        true
    }

    /// Stops the worker and waits for it to finish.
    ///
    /// Live lookups at this point are a programmer error; they are
    /// completed as errors before the worker exits. The service stays
    /// usable, a later lookup starts a fresh worker.
    pub fn shutdown(&self) {
        let mut shared = self.inner.lock();
        debug_assert!(
            shared.registry.is_empty(),
            "lookups still live at resolver shutdown"
        );
        let worker = match shared.worker.take() {
            Some(worker) => worker,
            None => return,
        };
        shared.shutting_down = true;
        shared.pending_quit = true;
        drop(shared);

        let mut worker = worker;
        let _ = worker.sender.send(WorkerMessage::Quit);
        if let Some(join) = worker.join.take() {
            let _ = join.join();
        }
        self.inner.lock().shutting_down = false;
    }
}

impl Default for HostResolver {
    fn default() -> Self {
        Self::new()
    }
}

//------------ Inner ---------------------------------------------------------

/// The state shared by the service handles and the worker.
#[derive(Debug)]
pub(crate) struct Inner {
    /// The configuration, fixed for the life of the service.
    pub(crate) config: Config,

    /// Everything the lock guards.
    shared: Mutex<Shared>,
}

impl Inner {
    /// Acquires the service lock.
    ///
    /// A poisoned lock is taken over: the registry is kept consistent
    /// under the lock at every step, so observing a panic elsewhere
    /// does not invalidate it.
    pub(in crate::resolv) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Shared").finish()
    }
}

/// Derives the registry key of a handler from its allocation.
fn caller_key(handler: &Arc<dyn LookupHandler>) -> usize {
    Arc::as_ptr(handler) as *const () as usize
}

//------------ Error ---------------------------------------------------------

/// A lookup could not be started.
#[derive(Debug)]
pub enum Error {
    /// The host name is longer than 253 octets or a label exceeds 63.
    NameTooLong,

    /// The host name is empty or contains an empty label.
    InvalidName,

    /// The handler already has a lookup in flight.
    AlreadyInProgress,

    /// All 65536 transaction ids are taken.
    TooManyRequests,

    /// The service is in the middle of shutting down.
    ShuttingDown,

    /// Setting up the worker failed.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::NameTooLong => f.write_str("host name too long"),
            Error::InvalidName => {
                f.write_str("host name contains an empty label")
            }
            Error::AlreadyInProgress => {
                f.write_str("a lookup is already in flight")
            }
            Error::TooManyRequests => {
                f.write_str("all transaction ids are in use")
            }
            Error::ShuttingDown => {
                f.write_str("the resolver is shutting down")
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

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;

    struct Recorder(Mutex<mpsc::Sender<Outcome>>);

    impl LookupHandler for Recorder {
        fn on_completed(&self, outcome: Outcome) {
            self.0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .send(outcome)
                .ok();
        }
    }

    fn recorder() -> (Arc<dyn LookupHandler>, mpsc::Receiver<Outcome>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Recorder(Mutex::new(tx))), rx)
    }

    #[test]
    fn name_validation() {
        let resolver = HostResolver::new();
        let (handler, _rx) = recorder();

        let over = "abc.".repeat(63) + "ab";
        match resolver.resolve(&handler, &over, 1000) {
            Err(Error::NameTooLong) => {}
            other => panic!("expected NameTooLong, got {:?}", other),
        }
        match resolver.resolve(&handler, "ya..ru", 1000) {
            Err(Error::InvalidName) => {}
            other => panic!("expected InvalidName, got {:?}", other),
        }
        // Nothing was registered, so there is nothing to cancel.
        assert!(!resolver.cancel(&handler));
    }

    #[test]
    fn double_resolve_is_rejected() {
        // A silent upstream on loopback keeps the worker idle.
        let upstream = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let upstream_addr = match upstream.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            _ => unreachable!(),
        };
        let resolver = HostResolver::with_config(Config {
            upstream: upstream_addr,
            ..Default::default()
        });
        let (handler, _rx) = recorder();
        resolver.resolve(&handler, "example.com", 60_000).unwrap();
        match resolver.resolve(&handler, "example.com", 60_000) {
            Err(Error::AlreadyInProgress) => {}
            other => {
                panic!("expected AlreadyInProgress, got {:?}", other)
            }
        }
        assert!(resolver.cancel(&handler));
        assert!(!resolver.cancel(&handler));
        resolver.shutdown();
    }
}
