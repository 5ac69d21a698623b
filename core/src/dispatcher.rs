use std::collections::HashMap;

use log::error;
use parking_lot::RwLock;

use crate::command::{Command, CommandFn};
use crate::queue::CommandQueue;

struct Registration {
    handler: CommandFn,
    queue: Option<CommandQueue>,
}

/// Command-code → handler table.
///
/// A handler registered without a queue runs inline on the dispatching
/// (receiver) thread; with a queue, the command is retained onto it and the
/// handler runs on the thread draining that queue.
pub struct Dispatcher {
    table: RwLock<HashMap<u32, Registration>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, code: u32, handler: CommandFn, queue: Option<CommandQueue>) {
        let previous = self
            .table
            .write()
            .insert(code, Registration { handler, queue });
        debug_assert!(previous.is_none(), "command {code} registered twice");
    }

    /// Route `command` to its handler. Returns the handler's consumed /
    /// deferred verdict; queued commands count as consumed once enqueued.
    pub fn dispatch(&self, command: &mut Command) -> bool {
        let code = command.command();
        let table = self.table.read();
        let Some(registration) = table.get(&code) else {
            error!("no handler registered for command {code}, dropping {command:?}");
            debug_assert!(false, "unregistered command {code}");
            return true;
        };
        match &registration.queue {
            None => (registration.handler)(command),
            Some(queue) => {
                let mut retained = command.clone();
                retained.set_dispatch_fn(registration.handler.clone());
                queue.push(retained);
                true
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Weak};
    use std::time::Duration;

    use super::*;
    use crate::command::CommandCache;
    use crate::packet::{empty_node_frame, NodeCommand};

    fn ping(cache: &CommandCache) -> Command {
        cache.command_from_frame(empty_node_frame(NodeCommand::Ping), None, Weak::new())
    }

    #[test]
    fn inline_dispatch_runs_handler() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        dispatcher.register(
            NodeCommand::Ping.to_wire(),
            Arc::new(move |_| {
                seen.fetch_add(1, Ordering::AcqRel);
                true
            }),
            None,
        );

        let cache = CommandCache::new();
        let mut cmd = ping(&cache);
        assert!(dispatcher.dispatch(&mut cmd));
        assert_eq!(hits.load(Ordering::Acquire), 1);
    }

    #[test]
    fn queued_dispatch_defers_to_worker() {
        let dispatcher = Dispatcher::new();
        let queue = CommandQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        dispatcher.register(
            NodeCommand::Ping.to_wire(),
            Arc::new(move |_| {
                seen.fetch_add(1, Ordering::AcqRel);
                true
            }),
            Some(queue.clone()),
        );

        let cache = CommandCache::new();
        let mut cmd = ping(&cache);
        assert!(dispatcher.dispatch(&mut cmd));
        // not run yet, sitting in the queue
        assert_eq!(hits.load(Ordering::Acquire), 0);

        let mut queued = queue.pop(Duration::from_millis(10)).unwrap();
        assert!(queued.invoke());
        assert_eq!(hits.load(Ordering::Acquire), 1);
    }
}
