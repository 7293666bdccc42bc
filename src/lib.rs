//! A networking and concurrency support library.
//!
//! This crate provides the pieces needed to drive many network
//! conversations from a small number of threads without blocking on any
//! single peer:
//!
//! * non-blocking TCP and UDP sockets with per-object readiness flags
//!   ([`net`]),
//! * a bounded readiness multiplexer over such objects ([`waitset`]),
//! * an inter-thread message queue that can itself be waited on
//!   ([`queue`]),
//! * and, built on top of these, an asynchronous DNS host name resolver
//!   ([`resolv`]) that multiplexes any number of in-flight A record
//!   lookups over a single UDP socket owned by a shared worker thread.
//!
//! The resolver is a stub resolver: it forwards queries to one upstream
//! recursive server and reports each completion exactly once through a
//! caller-supplied handler.

pub mod net;
pub mod queue;
pub mod resolv;
pub mod ticks;
pub mod waitset;

pub use self::resolv::{HostResolver, LookupHandler, Outcome};
pub use self::waitset::{Interest, Readiness, WaitSet, Waitable};
