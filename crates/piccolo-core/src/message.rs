//! Multi-listener message bus: a dedicated worker thread owns the message
//! log and per-listener cursors, reached only through a task/result channel
//! pair, matching every other worker in this crate.
//!
//! Backed in memory — a `Vec<String>` log plus a cursor per listener,
//! garbage-collected once every live listener has passed a given message.

use std::collections::HashMap;
use std::thread;

use crossbeam_channel::{unbounded, Sender};

type ListenerId = u64;

enum Task {
    NewListener { reply: Sender<ListenerId> },
    RemoveListener(ListenerId),
    Add(String),
    Status { listener: ListenerId, reply: Sender<bool> },
    Get { listener: ListenerId, reply: Sender<Option<String>> },
    Stop,
}

/// Handle to the message bus. Cloneable: every clone shares the same
/// background worker and task queue, the way the dispatcher and the
/// acquisition coordinator both need to publish onto the same bus.
#[derive(Clone)]
pub struct MessageBus {
    tasks: Sender<Task>,
}

struct Worker {
    log: Vec<String>,
    /// Absolute index of the oldest message; messages before this have
    /// already been seen by every listener and were dropped.
    base: usize,
    cursors: HashMap<ListenerId, usize>,
    next_listener: ListenerId,
}

impl Worker {
    fn new() -> Self {
        Worker {
            log: Vec::new(),
            base: 0,
            cursors: HashMap::new(),
            next_listener: 0,
        }
    }

    fn new_listener(&mut self) -> ListenerId {
        let id = self.next_listener;
        self.next_listener += 1;
        // A new listener's cursor starts at the current log head: it must
        // not retroactively receive messages added before it subscribed.
        self.cursors.insert(id, self.base + self.log.len());
        id
    }

    fn remove_listener(&mut self, id: ListenerId) {
        self.cursors.remove(&id);
        self.gc();
    }

    fn add(&mut self, msg: String) {
        self.log.push(msg);
    }

    fn status(&self, listener: ListenerId) -> bool {
        match self.cursors.get(&listener) {
            Some(&cur) => cur < self.base + self.log.len(),
            None => false,
        }
    }

    fn get(&mut self, listener: ListenerId) -> Option<String> {
        let cur = *self.cursors.get(&listener)?;
        if cur >= self.base + self.log.len() {
            return None;
        }
        let msg = self.log[cur - self.base].clone();
        self.cursors.insert(listener, cur + 1);
        self.gc();
        Some(msg)
    }

    /// Drop messages every live listener has already consumed.
    fn gc(&mut self) {
        let Some(&min_cursor) = self.cursors.values().min() else {
            // No listeners: nothing can ever consume the backlog, and a
            // future listener only sees messages from its subscribe point
            // onward anyway, so drop it all now to avoid unbounded growth.
            self.base += self.log.len();
            self.log.clear();
            return;
        };
        if min_cursor > self.base {
            let drop_count = min_cursor - self.base;
            self.log.drain(0..drop_count);
            self.base = min_cursor;
        }
    }
}

impl MessageBus {
    /// Spawn the message bus worker thread and return a handle to it.
    pub fn spawn() -> Self {
        let (tx, rx) = unbounded::<Task>();
        thread::Builder::new()
            .name("piccolo-messages".into())
            .spawn(move || {
                let mut worker = Worker::new();
                for task in rx {
                    match task {
                        Task::NewListener { reply } => {
                            let _ = reply.send(worker.new_listener());
                        }
                        Task::RemoveListener(id) => worker.remove_listener(id),
                        Task::Add(msg) => worker.add(msg),
                        Task::Status { listener, reply } => {
                            let _ = reply.send(worker.status(listener));
                        }
                        Task::Get { listener, reply } => {
                            let _ = reply.send(worker.get(listener));
                        }
                        Task::Stop => return,
                    }
                }
            })
            .expect("failed to spawn message bus worker");
        MessageBus { tasks: tx }
    }

    /// Test-only constructor that doesn't spawn a thread: processes tasks
    /// synchronously against the same `Worker` state machine. Kept separate
    /// from `spawn` so unit tests can assert on ordering without timing
    /// flakiness; production code always uses `spawn`.
    #[cfg(test)]
    fn new_inline() -> InlineBus {
        InlineBus(Worker::new())
    }

    pub fn new_listener(&self) -> ListenerId {
        let (reply, rx) = unbounded();
        self.tasks.send(Task::NewListener { reply }).ok();
        rx.recv().unwrap_or(0)
    }

    pub fn remove_listener(&self, listener: ListenerId) {
        self.tasks.send(Task::RemoveListener(listener)).ok();
    }

    pub fn add_message(&self, msg: impl Into<String>) {
        self.tasks.send(Task::Add(msg.into())).ok();
    }

    pub fn warning(&self, msg: impl std::fmt::Display) {
        self.add_message(format!("warning|{}", msg));
    }

    pub fn error(&self, msg: impl std::fmt::Display) {
        self.add_message(format!("error|{}", msg));
    }

    pub fn status(&self, listener: ListenerId) -> bool {
        let (reply, rx) = unbounded();
        self.tasks
            .send(Task::Status { listener, reply })
            .ok();
        rx.recv().unwrap_or(false)
    }

    pub fn get_message(&self, listener: ListenerId) -> Option<String> {
        let (reply, rx) = unbounded();
        self.tasks.send(Task::Get { listener, reply }).ok();
        rx.recv().ok().flatten()
    }

    pub fn stop(&self) {
        self.tasks.send(Task::Stop).ok();
    }
}

#[cfg(test)]
struct InlineBus(Worker);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_message_delivered_once_per_listener_in_order() {
        let mut w = MessageBus::new_inline().0;
        let a = w.new_listener();
        let b = w.new_listener();
        w.add("one".into());
        w.add("two".into());
        assert_eq!(w.get(a), Some("one".to_string()));
        assert_eq!(w.get(a), Some("two".to_string()));
        assert_eq!(w.get(a), None);
        // b hasn't consumed yet, independent cursor.
        assert_eq!(w.get(b), Some("one".to_string()));
        assert_eq!(w.get(b), Some("two".to_string()));
    }

    #[test]
    fn new_listener_does_not_see_earlier_messages() {
        let mut w = MessageBus::new_inline().0;
        w.add("before".into());
        let late = w.new_listener();
        assert_eq!(w.get(late), None);
        w.add("after".into());
        assert_eq!(w.get(late), Some("after".to_string()));
    }

    #[test]
    fn messages_are_gced_only_after_every_listener_consumes() {
        let mut w = MessageBus::new_inline().0;
        let a = w.new_listener();
        let b = w.new_listener();
        w.add("m".into());
        assert_eq!(w.log.len(), 1);
        w.get(a);
        // b hasn't read it yet, so it must still be retained.
        assert_eq!(w.log.len(), 1);
        w.get(b);
        assert_eq!(w.log.len(), 0);
    }

    #[test]
    fn warning_and_error_are_tagged() {
        let mut w = MessageBus::new_inline().0;
        let a = w.new_listener();
        w.add(format!("warning|{}", "uh oh"));
        assert_eq!(w.get(a), Some("warning|uh oh".to_string()));
    }

    #[test]
    fn spawned_bus_end_to_end() {
        let bus = MessageBus::spawn();
        let id = bus.new_listener();
        assert!(!bus.status(id));
        bus.warning("disk nearly full");
        // give the worker thread a beat to process
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(bus.status(id));
        assert_eq!(bus.get_message(id), Some("warning|disk nearly full".to_string()));
        bus.stop();
    }
}
