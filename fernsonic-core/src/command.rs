//! The MPSC command ring.
//!
//! External threads describe graph mutations as erased callables; the audio
//! thread consumes them between property application and rendering, so a
//! command always observes the latest parameter state and executes entirely
//! before or after a block, never during one.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::config::{COMMAND_RING_CAPACITY, MAX_COMMAND_SIZE};
use crate::context::AudioState;
use crate::error::{Error, Result};

type CommandFn = Box<dyn FnOnce(&mut AudioState) + Send>;

/// One unit of execution for the audio thread. Captured state is owned by
/// value and dropped on the audio thread after execution.
pub(crate) struct Command {
    run: CommandFn,
}

impl Command {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: FnOnce(&mut AudioState) + Send + 'static,
    {
        // Commands are supposed to capture a couple of refcounted pointers
        // and a few scalars, nothing more.
        debug_assert!(std::mem::size_of::<F>() <= MAX_COMMAND_SIZE);
        Self { run: Box::new(f) }
    }

    /// A command paired with a receiver for its result, for read round-trips
    /// from external threads.
    pub(crate) fn waitable<R, F>(f: F) -> (Self, Receiver<R>)
    where
        R: Send + 'static,
        F: FnOnce(&mut AudioState) -> R + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let cmd = Self::new(move |audio| {
            let _ = tx.send(f(audio));
        });
        (cmd, rx)
    }

    pub(crate) fn execute(self, audio: &mut AudioState) {
        (self.run)(audio);
    }
}

/// Fixed-capacity multi-producer single-consumer ring of commands.
pub(crate) struct CommandRing {
    tx: Sender<Command>,
    rx: Receiver<Command>,
}

impl CommandRing {
    pub(crate) fn new() -> Self {
        let (tx, rx) = bounded(COMMAND_RING_CAPACITY);
        Self { tx, rx }
    }

    /// Fails with `ResourceExhausted` when the ring is full; the caller
    /// decides whether to retry.
    pub(crate) fn enqueue(&self, cmd: Command) -> Result<()> {
        match self.tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(Error::ResourceExhausted("command ring is full".into()))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(Error::Internal("command ring is disconnected".into()))
            }
        }
    }

    /// Pops and executes up to `limit` commands in FIFO order.
    pub(crate) fn drain(&self, limit: usize, audio: &mut AudioState) {
        for _ in 0..limit {
            match self.rx.try_recv() {
                Ok(cmd) => cmd.execute(audio),
                Err(_) => break,
            }
        }
    }
}
