//! Observable state fields.
//!
//! An [`EventNotifier`] holds the current value of one session field and
//! calls every registered listener on each write, including writes that do
//! not change the value. Remote peers rebuild their view from these
//! notifications and must see every transition.
//!
//! Writes carry a [`WriteTicket`]. Tickets are issued in increasing order and
//! a write whose ticket is older than the last applied one is rejected when
//! the stale-write guard is on, so a slow fetch cannot overwrite fresher state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Position of a write in a field's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WriteTicket(u64);

/// What happened to a ticketed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// A newer write already landed
    Stale,
    /// The writer was cancelled before the write
    Cancelled,
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied)
    }
}

struct NotifierState<T> {
    value: T,
    applied: u64,
    listeners: Vec<(String, Listener<T>)>,
}

/// A current value plus the listeners interested in it.
///
/// Listeners run while the notifier is locked. They must not call back into
/// the same notifier.
pub struct EventNotifier<T> {
    name: &'static str,
    guard_stale: bool,
    next_ticket: AtomicU64,
    state: Mutex<NotifierState<T>>,
}

impl<T: Clone> EventNotifier<T> {
    pub fn new(name: &'static str, initial: T, guard_stale: bool) -> Self {
        Self {
            name,
            guard_stale,
            next_ticket: AtomicU64::new(0),
            state: Mutex::new(NotifierState {
                value: initial,
                applied: 0,
                listeners: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NotifierState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current value.
    pub fn value(&self) -> T {
        self.lock().value.clone()
    }

    /// Register `listener` under `owner`, replacing an earlier registration
    /// by the same owner. It receives every subsequent write.
    pub fn subscribe<F>(&self, owner: impl Into<String>, listener: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let owner = owner.into();
        let mut state = self.lock();
        state.listeners.retain(|(existing, _)| *existing != owner);
        debug!(field = self.name, owner = %owner, "Listener subscribed");
        state.listeners.push((owner, Box::new(listener)));
    }

    /// Remove the listener registered by `owner`. Once this returns, the
    /// listener is not called again.
    pub fn unsubscribe(&self, owner: &str) -> bool {
        let mut state = self.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(existing, _)| existing != owner);
        before != state.listeners.len()
    }

    /// Remove every listener.
    pub fn unsubscribe_all(&self) {
        let mut state = self.lock();
        if !state.listeners.is_empty() {
            debug!(
                field = self.name,
                count = state.listeners.len(),
                "Removing all listeners"
            );
        }
        state.listeners.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Reserve a position for a write that will happen later.
    pub fn ticket(&self) -> WriteTicket {
        WriteTicket(self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Write `value` unconditionally. It supersedes all outstanding tickets.
    pub fn notify(&self, value: T) {
        let mut state = self.lock();
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        Self::apply(self.name, &mut state, ticket, value);
    }

    /// Write `value` unless a newer write already landed.
    pub fn notify_with_ticket(&self, ticket: WriteTicket, value: T) -> WriteOutcome {
        self.write(ticket, None, value)
    }

    /// Write `value` unless `cancel` fired or a newer write already landed.
    ///
    /// Cancellation is checked under the notifier lock: after `cancel` fires
    /// and any concurrent listener call returns, this write cannot happen.
    pub fn notify_unless_cancelled(
        &self,
        ticket: WriteTicket,
        cancel: &CancellationToken,
        value: T,
    ) -> WriteOutcome {
        self.write(ticket, Some(cancel), value)
    }

    fn write(
        &self,
        ticket: WriteTicket,
        cancel: Option<&CancellationToken>,
        value: T,
    ) -> WriteOutcome {
        let mut state = self.lock();

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            trace!(field = self.name, "Dropping write from cancelled writer");
            return WriteOutcome::Cancelled;
        }

        if self.guard_stale && ticket.0 <= state.applied {
            debug!(
                field = self.name,
                ticket = ticket.0,
                applied = state.applied,
                "Rejecting stale write"
            );
            return WriteOutcome::Stale;
        }

        Self::apply(self.name, &mut state, ticket.0, value);
        WriteOutcome::Applied
    }

    fn apply(name: &'static str, state: &mut NotifierState<T>, ticket: u64, value: T) {
        state.applied = state.applied.max(ticket);
        state.value = value;
        trace!(field = name, listeners = state.listeners.len(), "Notifying");
        for (_, listener) in &state.listeners {
            listener(&state.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |value: &T| sink.lock().unwrap().push(value.clone()))
    }

    #[test]
    fn test_notifies_on_every_write() {
        let notifier = EventNotifier::new("test", 0u32, true);
        let (seen, listener) = recorder();
        notifier.subscribe("owner", listener);

        notifier.notify(1);
        notifier.notify(1);
        notifier.notify(2);

        assert_eq!(*seen.lock().unwrap(), vec![1, 1, 2]);
        assert_eq!(notifier.value(), 2);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let notifier = EventNotifier::new("test", 0u32, true);
        let (first, first_listener) = recorder();
        let (second, second_listener) = recorder();
        notifier.subscribe("first", first_listener);
        notifier.subscribe("second", second_listener);

        notifier.notify(1);
        assert!(notifier.unsubscribe("first"));
        assert!(!notifier.unsubscribe("first"));
        notifier.notify(2);
        notifier.unsubscribe_all();
        notifier.notify(3);

        assert_eq!(*first.lock().unwrap(), vec![1]);
        assert_eq!(*second.lock().unwrap(), vec![1, 2]);
        assert_eq!(notifier.subscriber_count(), 0);
        assert_eq!(notifier.value(), 3);
    }

    #[test]
    fn test_resubscribe_replaces_owner() {
        let notifier = EventNotifier::new("test", 0u32, true);
        let (old, old_listener) = recorder();
        let (new, new_listener) = recorder();
        notifier.subscribe("owner", old_listener);
        notifier.subscribe("owner", new_listener);

        notifier.notify(7);

        assert!(old.lock().unwrap().is_empty());
        assert_eq!(*new.lock().unwrap(), vec![7]);
        assert_eq!(notifier.subscriber_count(), 1);
    }

    #[test]
    fn test_stale_ticket_rejected() {
        let notifier = EventNotifier::new("test", "initial", true);
        let (seen, listener) = recorder();
        notifier.subscribe("owner", listener);

        let slow = notifier.ticket();
        let fast = notifier.ticket();

        assert_eq!(notifier.notify_with_ticket(fast, "fresh"), WriteOutcome::Applied);
        assert_eq!(notifier.notify_with_ticket(slow, "stale"), WriteOutcome::Stale);

        assert_eq!(notifier.value(), "fresh");
        assert_eq!(*seen.lock().unwrap(), vec!["fresh"]);
    }

    #[test]
    fn test_plain_write_supersedes_outstanding_tickets() {
        let notifier = EventNotifier::new("test", 0u32, true);
        let outstanding = notifier.ticket();
        notifier.notify(5);
        assert_eq!(
            notifier.notify_with_ticket(outstanding, 1),
            WriteOutcome::Stale
        );
        assert_eq!(notifier.value(), 5);
    }

    #[test]
    fn test_last_writer_wins_without_guard() {
        let notifier = EventNotifier::new("test", "initial", false);
        let slow = notifier.ticket();
        let fast = notifier.ticket();

        notifier.notify_with_ticket(fast, "fresh");
        assert_eq!(
            notifier.notify_with_ticket(slow, "stale"),
            WriteOutcome::Applied
        );
        assert_eq!(notifier.value(), "stale");
    }

    #[test]
    fn test_cancelled_writer_never_writes() {
        let notifier = EventNotifier::new("test", 0u32, true);
        let (seen, listener) = recorder();
        notifier.subscribe("owner", listener);

        let cancel = CancellationToken::new();
        let ticket = notifier.ticket();
        cancel.cancel();

        assert_eq!(
            notifier.notify_unless_cancelled(ticket, &cancel, 9),
            WriteOutcome::Cancelled
        );
        assert_eq!(notifier.value(), 0);
        assert!(seen.lock().unwrap().is_empty());
    }
}
