//! A message queue that a wait set can wait on.
//!
//! The queue carries arbitrary messages from any number of sending
//! threads to a single receiving thread that spends its life inside a
//! [`WaitSet`][crate::waitset::WaitSet]. The payload travels through a
//! regular channel; a pipe shared by all senders makes the receiving
//! end pollable, with one byte written per message and drained again on
//! reception.

use std::io::{Read, Write};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::{error, fmt, io};

use mio::unix::pipe;

use crate::waitset::{Readiness, WaitState, Waitable};

//------------ channel -------------------------------------------------------

/// Creates a new message queue.
///
/// Returns the sending and receiving halves. The sending half can be
/// cloned freely; the receiving half is the waitable.
pub fn channel<T: Send>(
) -> io::Result<(MessageSender<T>, MessageQueue<T>)> {
    let (pipe_tx, pipe_rx) = pipe::new()?;
    let (tx, rx) = mpsc::channel();
    Ok((
        MessageSender {
            tx,
            pipe: Arc::new(Mutex::new(pipe_tx)),
        },
        MessageQueue {
            rx,
            pipe: pipe_rx,
            state: WaitState::new(),
        },
    ))
}

//------------ MessageSender -------------------------------------------------

/// The sending half of a message queue.
pub struct MessageSender<T> {
    tx: mpsc::Sender<T>,
    pipe: Arc<Mutex<pipe::Sender>>,
}

impl<T> MessageSender<T> {
    /// Sends a message and wakes the receiving thread.
    ///
    /// Fails only if the receiving half has been dropped, in which case
    /// the message is handed back.
    pub fn send(&self, message: T) -> Result<(), SendError<T>> {
        self.tx
            .send(message)
            .map_err(|err| SendError(err.0))?;
        let mut pipe = self
            .pipe
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // A full pipe means plenty of wakeups are pending already, and
        // a broken one means the receiver is mid-teardown. Neither
        // loses the message itself.
        let _ = pipe.write(&[0]);
        Ok(())
    }
}

impl<T> Clone for MessageSender<T> {
    fn clone(&self) -> Self {
        MessageSender {
            tx: self.tx.clone(),
            pipe: self.pipe.clone(),
        }
    }
}

impl<T> fmt::Debug for MessageSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MessageSender").finish()
    }
}

//------------ MessageQueue --------------------------------------------------

/// The receiving half of a message queue.
pub struct MessageQueue<T> {
    rx: mpsc::Receiver<T>,
    pipe: pipe::Receiver,
    state: Arc<WaitState>,
}

impl<T> MessageQueue<T> {
    /// Returns the readiness flags of the queue.
    pub fn ready(&self) -> Readiness {
        self.state.readiness()
    }

    /// Takes the next pending message, if any.
    ///
    /// Lowers the READ flag up front; a subsequent send raises it again
    /// through the wait set.
    pub fn try_recv(&mut self) -> Option<T> {
        self.state.lower(Readiness::READ);
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(_) => {
                self.drain_pipe();
                self.rx.try_recv().ok()
            }
        }
    }

    /// Reads wakeup bytes off the pipe until it runs dry.
    fn drain_pipe(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref err)
                    if err.kind() == io::ErrorKind::Interrupted =>
                {
                    continue
                }
                Err(_) => break,
            }
        }
    }
}

impl<T> Waitable for MessageQueue<T> {
    fn wait_state(&self) -> &Arc<WaitState> {
        &self.state
    }

    fn source(&mut self) -> Option<&mut dyn mio::event::Source> {
        Some(&mut self.pipe)
    }
}

impl<T> fmt::Debug for MessageQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MessageQueue").finish()
    }
}

//------------ SendError -----------------------------------------------------

/// The receiving half of the queue is gone.
#[derive(Debug)]
pub struct SendError<T>(pub T);

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("message queue receiver has been dropped")
    }
}

impl<T: fmt::Debug> error::Error for SendError<T> {}

//============ Testing =======================================================
