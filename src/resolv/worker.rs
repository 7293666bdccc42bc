//! The lookup worker thread.
//!
//! One worker owns the UDP socket all queries travel over, a wait set
//! over {message queue, socket}, and the loop that sends pending
//! queries, matches replies to records, and fires deadlines. The
//! worker shares exactly one thing with the rest of the world: the
//! registry behind the service lock. It never holds that lock across
//! the blocking wait or a completion callback.
//!
//! The worker winds down on its own once the registry runs empty and
//! is recreated by the next lookup. Retirement happens under the same
//! lock that guards the emptiness check, so a lookup racing the
//! shutdown either finds the worker still alive or spins up a fresh
//! one; there is no window in which a record can be stranded.

use std::io;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::net::{self, UdpSocket};
use crate::queue::{self, MessageQueue, MessageSender};
use crate::ticks::Ticks;
use crate::waitset::{Interest, WaitSet};

use super::registry::Registry;
use super::{wire, Error, Inner, Outcome};

//------------ WorkerMessage -------------------------------------------------

/// A message for the worker thread.
#[derive(Clone, Copy, Debug)]
pub(super) enum WorkerMessage {
    /// The send queue went from empty to non-empty.
    ///
    /// The worker raises its interest in socket writability. It lowers
    /// it again as soon as the queue drains, so an always-writable
    /// datagram socket does not keep the loop spinning.
    StartSending,

    /// Wind down.
    ///
    /// Honored only while the pending-quit flag is still set; a lookup
    /// issued after the flag was raised re-arms the worker and turns
    /// the message into a plain wakeup.
    Quit,
}

//------------ Shared --------------------------------------------------------

/// The state behind the service lock.
pub(super) struct Shared {
    /// The live records.
    pub registry: Registry,

    /// The current worker, if one is running.
    pub worker: Option<WorkerHandle>,

    /// A quit message is on its way and still valid.
    pub pending_quit: bool,

    /// The service is joining the worker.
    pub shutting_down: bool,
}

impl Shared {
    /// Creates the state for a fresh service.
    pub fn new() -> Self {
        Shared {
            registry: Registry::new(),
            worker: None,
            pending_quit: false,
            shutting_down: false,
        }
    }
}

//------------ WorkerHandle --------------------------------------------------

/// The service's grip on a running worker.
pub(super) struct WorkerHandle {
    /// Sends messages to the worker loop.
    pub sender: MessageSender<WorkerMessage>,

    /// Joins the worker thread.
    pub join: Option<JoinHandle<()>>,

    /// Identifies the worker thread for self-retirement.
    thread_id: ThreadId,
}

//------------ spawn ---------------------------------------------------------

/// Starts a new worker.
///
/// The socket and queue are created here so that a failure surfaces
/// synchronously at the triggering lookup. `now` seeds the wrap
/// detection with the tick value the first record was stamped with.
pub(super) fn spawn(
    inner: &Arc<Inner>,
    now: Ticks,
) -> Result<WorkerHandle, Error> {
    let (sender, queue) = queue::channel().map_err(Error::Io)?;
    let udp = UdpSocket::open(0).map_err(|err| Error::Io(io_error(err)))?;
    let inner = inner.clone();
    let last_low = now.is_low_half();
    let join = thread::Builder::new()
        .name("host-lookup".into())
        .spawn(move || run(inner, udp, queue, last_low))
        .map_err(Error::Io)?;
    let thread_id = join.thread().id();
    Ok(WorkerHandle {
        sender,
        join: Some(join),
        thread_id,
    })
}

/// Flattens a socket error into its I/O cause.
fn io_error(err: net::Error) -> io::Error {
    match err {
        net::Error::OpenFailed(err) | net::Error::Io(err) => err,
        net::Error::NotOpen => io::Error::new(
            io::ErrorKind::NotConnected,
            "socket is not open",
        ),
    }
}

//------------ The worker loop -----------------------------------------------

/// What happened while draining the send queue.
enum SendOutcome {
    /// Every pending query went out.
    Drained,

    /// The socket stopped accepting datagrams for the moment.
    WouldBlock,

    /// The socket failed for good.
    Fatal,
}

/// The worker thread.
fn run(
    inner: Arc<Inner>,
    mut udp: UdpSocket,
    mut queue: MessageQueue<WorkerMessage>,
    mut last_low: bool,
) {
    debug!("host lookup worker started");
    let mut waitset = match WaitSet::new(2) {
        Ok(waitset) => waitset,
        Err(err) => {
            warn!("creating the lookup wait set failed: {}", err);
            drain_and_retire(&inner);
            return;
        }
    };
    if waitset.add(&mut queue, Interest::READABLE).is_err()
        || waitset.add(&mut udp, Interest::READABLE).is_err()
    {
        warn!("registering the lookup sockets failed");
        drain_and_retire(&inner);
        return;
    }
    let upstream = inner.config.upstream;
    let mut quit = false;
    let mut write_armed = false;

    loop {
        if quit || udp.ready().is_error() {
            break;
        }

        // Incoming replies.
        if udp.ready().is_readable()
            && !receive_replies(&inner, &mut udp, upstream)
        {
            break;
        }

        // Pending queries.
        if udp.ready().is_writable() {
            match drain_send_queue(&inner, &mut udp, upstream) {
                SendOutcome::Drained => {
                    if write_armed {
                        if waitset
                            .change(&mut udp, Interest::READABLE)
                            .is_err()
                        {
                            break;
                        }
                        write_armed = false;
                    }
                }
                SendOutcome::WouldBlock => {}
                SendOutcome::Fatal => break,
            }
        }

        // Deadlines.
        let now = inner.config.clock.now();
        if now.is_low_half() && !last_low {
            // The tick counter wrapped. The timelines switch roles
            // first so that lookups started from the flush callbacks
            // land on the right one, then everything from the old
            // epoch times out.
            inner.lock().registry.flip_timelines();
            expire_old_epoch(&inner);
        }
        last_low = now.is_low_half();
        expire_due(&inner, now);

        // Exit once nothing is left, otherwise compute the wait.
        let timeout = {
            let mut shared = inner.lock();
            if shared.registry.is_empty() {
                retire(&mut *shared);
                debug!("host lookup worker stopped");
                return;
            }
            shared
                .registry
                .next_deadline()
                .map(|deadline| deadline.wrapping_sub(now.value()))
                .unwrap_or(u32::MAX)
        };
        // Poll the clock at least four times per wrap cycle so the
        // half transition cannot be missed.
        let timeout = timeout.min(u32::MAX / 4);

        match waitset.wait(Some(Duration::from_millis(u64::from(timeout))))
        {
            Ok(0) => continue,
            Ok(_) => {}
            Err(err) => {
                warn!("waiting on the lookup sockets failed: {}", err);
                break;
            }
        }

        // Messages.
        if queue.ready().is_readable() {
            let mut fatal = false;
            while let Some(message) = queue.try_recv() {
                match message {
                    WorkerMessage::StartSending => {
                        let arm = !inner
                            .lock()
                            .registry
                            .send_queue_is_empty();
                        if arm && !write_armed {
                            if waitset
                                .change(
                                    &mut udp,
                                    Interest::READABLE
                                        | Interest::WRITABLE,
                                )
                                .is_ok()
                            {
                                write_armed = true;
                            } else {
                                fatal = true;
                                break;
                            }
                        }
                    }
                    WorkerMessage::Quit => {
                        let mut shared = inner.lock();
                        if shared.pending_quit {
                            shared.pending_quit = false;
                            quit = true;
                        }
                    }
                }
            }
            if fatal {
                break;
            }
        }
    }

    // Fatal failure or quit: whatever is still alive completes as an
    // error, then the worker retires.
    drain_and_retire(&inner);
    debug!("host lookup worker stopped");
}

/// Receives and dispatches replies until the socket runs dry.
///
/// Returns `false` if the socket failed fatally.
fn receive_replies(
    inner: &Arc<Inner>,
    udp: &mut UdpSocket,
    upstream: SocketAddrV4,
) -> bool {
    let mut buf = [0u8; wire::MAX_DATAGRAM];
    loop {
        let (len, from) = match udp.recv_from(&mut buf) {
            Ok(Some((len, from))) => (len, from),
            Ok(None) => return true,
            Err(err) => {
                warn!("lookup socket failed: {}", err);
                return false;
            }
        };
        if from != upstream {
            trace!("dropping datagram from stranger {}", from);
            continue;
        }
        let id = match wire::reply_id(&buf[..len]) {
            Some(id) => id,
            None => continue,
        };
        let record = {
            let mut shared = inner.lock();
            match shared.registry.remove_by_id(id) {
                Some(record) => record,
                None => {
                    trace!("dropping reply with unknown id {}", id);
                    continue;
                }
            }
        };
        let outcome = match wire::parse_reply(&buf[..len]) {
            Ok(addr) => {
                trace!("{} resolved to {}", record.hostname, addr);
                Outcome::Ok(addr)
            }
            Err(err) => {
                debug!("bad reply for {}: {}", record.hostname, err);
                Outcome::Error
            }
        };
        record.handler.on_completed(outcome);
    }
}

/// Sends pending queries head first until the queue or socket is done.
fn drain_send_queue(
    inner: &Arc<Inner>,
    udp: &mut UdpSocket,
    upstream: SocketAddrV4,
) -> SendOutcome {
    loop {
        let mut shared = inner.lock();
        let key = match shared.registry.send_head() {
            Some(key) => key,
            None => return SendOutcome::Drained,
        };
        let (id, packet) = {
            let record = shared.registry.record(key);
            (record.id, wire::build_query(record.id, &record.hostname))
        };
        match udp.send_to(&packet, upstream) {
            Ok(0) => return SendOutcome::WouldBlock,
            Ok(_) => {
                shared.registry.mark_sent(key);
                trace!("query {} sent", id);
            }
            Err(err) => {
                warn!("lookup socket failed: {}", err);
                return SendOutcome::Fatal;
            }
        }
    }
}

/// Times out everything from the pre-wrap epoch, due or not.
fn expire_old_epoch(inner: &Arc<Inner>) {
    loop {
        let record = { inner.lock().registry.remove_outdated() };
        match record {
            Some(record) => {
                debug!("lookup of {} timed out at wrap", record.hostname);
                record.handler.on_completed(Outcome::Timeout);
            }
            None => return,
        }
    }
}

/// Times out every record whose deadline has passed.
fn expire_due(inner: &Arc<Inner>, now: Ticks) {
    loop {
        let record = { inner.lock().registry.remove_expired(now) };
        match record {
            Some(record) => {
                debug!("lookup of {} timed out", record.hostname);
                record.handler.on_completed(Outcome::Timeout);
            }
            None => return,
        }
    }
}

/// Completes every remaining record as an error, then retires.
///
/// The final emptiness check and the retirement happen under one lock
/// acquisition, so a lookup racing the teardown either gets drained
/// here or finds no worker and starts a fresh one.
fn drain_and_retire(inner: &Arc<Inner>) {
    loop {
        let record = {
            let mut shared = inner.lock();
            match shared.registry.remove_any() {
                Some(record) => record,
                None => {
                    retire(&mut *shared);
                    return;
                }
            }
        };
        record.handler.on_completed(Outcome::Error);
    }
}

/// Takes this thread's handle out of the shared state.
fn retire(shared: &mut Shared) {
    let me = thread::current().id();
    if shared
        .worker
        .as_ref()
        .map(|worker| worker.thread_id == me)
        .unwrap_or(false)
    {
        // Dropping our own join handle detaches the thread; nothing
        // user visible happens after retirement.
        shared.worker = None;
    }
}
