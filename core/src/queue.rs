use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::command::Command;

/// FIFO handoff of retained commands between the receiver thread and the
/// command thread. Cloning yields another handle onto the same queue.
#[derive(Clone)]
pub struct CommandQueue {
    tx: Sender<Command>,
    rx: Receiver<Command>,
}

impl CommandQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, command: Command) {
        // receiver endpoints live as long as the queue itself
        let _ = self.tx.send(command);
    }

    /// Pop the next command, waiting up to `timeout`; `None` on timeout so
    /// the worker can run its idle hook.
    pub fn pop(&self, timeout: Duration) -> Option<Command> {
        match self.rx.recv_timeout(timeout) {
            Ok(command) => Some(command),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_pop(&self) -> Option<Command> {
        self.rx.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Release every queued command without invoking it.
    pub fn flush(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}
