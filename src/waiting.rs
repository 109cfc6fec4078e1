use std::collections::HashMap;
use std::os::unix::io::RawFd;

use slab::Slab;
use tokio::sync::oneshot;

use crate::error::SocketError;
use crate::ready::Ready;
use crate::token::Token;

/// What a resumed waiter observes.
pub type Resume = Result<(), SocketError>;

struct Waiter {
    fd: RawFd,
    events: Ready,
    tx: oneshot::Sender<Resume>,
}

#[derive(Default)]
struct FdWaiters {
    read: Vec<Token>,
    write: Vec<Token>,
}

impl FdWaiters {
    fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }
}

/// Maps `(fd, event)` to the waiters suspended on it.
///
/// `append` and the removal operations report event *deltas*: the events
/// whose waiter count crossed zero. Those deltas drive the backend's
/// `add_events` / `remove_events`, keeping the kernel registration equal
/// to the union of events across live waiters per descriptor. Entries
/// with no waiters are removed, so the key set always equals the set of
/// registered descriptors.
#[derive(Default)]
pub struct WaitingTable {
    waiters: Slab<Waiter>,
    fds: HashMap<RawFd, FdWaiters>,
}

impl WaitingTable {
    pub fn new() -> WaitingTable {
        WaitingTable::default()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// The union of events currently waited for on `fd`.
    pub fn events(&self, fd: RawFd) -> Ready {
        let mut events = Ready::empty();
        if let Some(entry) = self.fds.get(&fd) {
            if !entry.read.is_empty() {
                events |= Ready::readable();
            }
            if !entry.write.is_empty() {
                events |= Ready::writable();
            }
        }
        events
    }

    /// Registers a waiter. Returns its token and the events that went
    /// from zero waiters to one, which the caller must register with the
    /// backend.
    pub fn append(
        &mut self,
        fd: RawFd,
        events: Ready,
        tx: oneshot::Sender<Resume>,
    ) -> (Token, Ready) {
        let token = Token(self.waiters.insert(Waiter { fd, events, tx }));
        let entry = self.fds.entry(fd).or_default();

        let mut delta = Ready::empty();
        if events.is_readable() {
            if entry.read.is_empty() {
                delta |= Ready::readable();
            }
            entry.read.push(token);
        }
        if events.is_writable() {
            if entry.write.is_empty() {
                delta |= Ready::writable();
            }
            entry.write.push(token);
        }
        (token, delta)
    }

    /// Removes a single waiter (cancellation path), dropping its sender.
    /// Returns the descriptor and the events whose waiter count dropped
    /// to zero, which the caller must deregister from the backend.
    pub fn remove(&mut self, token: Token) -> Option<(RawFd, Ready)> {
        if !self.waiters.contains(token.0) {
            return None;
        }
        let waiter = self.waiters.remove(token.0);

        let mut delta = Ready::empty();
        if let Some(entry) = self.fds.get_mut(&waiter.fd) {
            entry.read.retain(|t| *t != token);
            entry.write.retain(|t| *t != token);
            if waiter.events.is_readable() && entry.read.is_empty() {
                delta |= Ready::readable();
            }
            if waiter.events.is_writable() && entry.write.is_empty() {
                delta |= Ready::writable();
            }
            if entry.is_empty() {
                self.fds.remove(&waiter.fd);
            }
        }
        Some((waiter.fd, delta))
    }

    /// Takes every waiter on `fd` waiting for any event in `ready`, in
    /// append order per event. A waiter suspended on several events is
    /// taken exactly once. Returns the senders plus the events whose
    /// waiter count dropped to zero.
    pub fn take_ready(
        &mut self,
        fd: RawFd,
        ready: Ready,
    ) -> (Vec<oneshot::Sender<Resume>>, Ready) {
        let mut senders = Vec::new();
        let mut removed = Ready::empty();

        let Some(entry) = self.fds.get_mut(&fd) else {
            return (senders, removed);
        };

        let had_read = !entry.read.is_empty();
        let had_write = !entry.write.is_empty();

        let mut taken: Vec<Token> = Vec::new();
        if ready.is_readable() {
            taken.extend(entry.read.drain(..));
        }
        if ready.is_writable() {
            for token in entry.write.drain(..) {
                if !taken.contains(&token) {
                    taken.push(token);
                }
            }
        }

        for token in &taken {
            if self.waiters.contains(token.0) {
                senders.push(self.waiters.remove(token.0).tx);
            }
        }

        // a waiter taken for one event must leave the other list too
        entry.read.retain(|t| self.waiters.contains(t.0));
        entry.write.retain(|t| self.waiters.contains(t.0));

        if had_read && entry.read.is_empty() {
            removed |= Ready::readable();
        }
        if had_write && entry.write.is_empty() {
            removed |= Ready::writable();
        }
        if entry.is_empty() {
            self.fds.remove(&fd);
        }

        (senders, removed)
    }

    /// Removes every waiter (pool teardown) and returns their senders.
    pub fn drain_all(&mut self) -> Vec<oneshot::Sender<Resume>> {
        self.fds.clear();
        self.waiters.drain().map(|waiter| waiter.tx).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn channel() -> oneshot::Sender<Resume> {
        oneshot::channel().0
    }

    #[test]
    fn append_reports_zero_to_one_transitions() {
        let mut table = WaitingTable::new();

        let (_, delta) = table.append(5, Ready::readable(), channel());
        assert_eq!(delta, Ready::readable());

        // a second reader adds nothing new
        let (_, delta) = table.append(5, Ready::readable(), channel());
        assert!(delta.is_empty());

        let (_, delta) = table.append(5, Ready::connection(), channel());
        assert_eq!(delta, Ready::writable());

        assert_eq!(table.events(5), Ready::connection());
    }

    #[test]
    fn remove_reports_one_to_zero_transitions() {
        let mut table = WaitingTable::new();

        let (first, _) = table.append(7, Ready::readable(), channel());
        let (second, _) = table.append(7, Ready::readable(), channel());

        let (fd, delta) = table.remove(first).unwrap();
        assert_eq!(fd, 7);
        assert!(delta.is_empty());

        let (_, delta) = table.remove(second).unwrap();
        assert_eq!(delta, Ready::readable());
        assert!(table.is_empty());
        assert!(table.remove(second).is_none());
    }

    #[test]
    fn take_ready_resumes_each_waiter_at_most_once() {
        let mut table = WaitingTable::new();

        let (_, delta) = table.append(9, Ready::connection(), channel());
        assert_eq!(delta, Ready::connection());

        // both events fire at once; the waiter must come out once
        let (senders, removed) = table.take_ready(9, Ready::connection());
        assert_eq!(senders.len(), 1);
        assert_eq!(removed, Ready::connection());
        assert!(table.is_empty());
    }

    #[test]
    fn take_ready_purges_the_other_event_list() {
        let mut table = WaitingTable::new();

        table.append(4, Ready::connection(), channel());

        // only read fires; the write side must drop to zero as well
        let (senders, removed) = table.take_ready(4, Ready::readable());
        assert_eq!(senders.len(), 1);
        assert_eq!(removed, Ready::connection());
        assert_eq!(table.events(4), Ready::empty());
    }

    #[test]
    fn take_ready_preserves_append_order() {
        let mut table = WaitingTable::new();

        let (a, _) = table.append(3, Ready::readable(), channel());
        let (b, _) = table.append(3, Ready::readable(), channel());
        assert!(a < b);

        let (senders, _) = table.take_ready(3, Ready::readable());
        assert_eq!(senders.len(), 2);
    }

    #[test]
    fn drain_all_empties_the_table() {
        let mut table = WaitingTable::new();

        table.append(1, Ready::readable(), channel());
        table.append(2, Ready::writable(), channel());
        assert_eq!(table.len(), 2);

        let senders = table.drain_all();
        assert_eq!(senders.len(), 2);
        assert!(table.is_empty());
        assert_eq!(table.events(1), Ready::empty());
    }
}
