//! Synchronous observer registries.
//!
//! Notification fan-out is explicit and typed: every event is a
//! [`Listeners`] registry keyed by event, dispatched synchronously within
//! the single mutation path. Dispatch iterates a snapshot of the registry,
//! so listeners are free to attach, detach, or re-enter the mutation path
//! while a delivery is in flight.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Token returned when attaching a listener; pass it back to the matching
/// `off_*` method to detach. Tokens are scoped to the registry that issued
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// A registry of listeners for one event.
pub(crate) struct Listeners<A> {
    next: Cell<u64>,
    slots: RefCell<Vec<(u64, Rc<dyn Fn(&A)>)>>,
}

impl<A> Listeners<A> {
    pub(crate) fn new() -> Self {
        Self {
            next: Cell::new(0),
            slots: RefCell::new(Vec::new()),
        }
    }

    /// Attaches `listener`, returning its detach token.
    pub(crate) fn on(&self, listener: impl Fn(&A) + 'static) -> Subscription {
        let id = self.next.get();
        self.next.set(id + 1);
        self.slots.borrow_mut().push((id, Rc::new(listener)));
        Subscription(id)
    }

    /// Detaches the listener behind `sub`. Returns false when it was
    /// already gone.
    pub(crate) fn off(&self, sub: Subscription) -> bool {
        let mut slots = self.slots.borrow_mut();
        let before = slots.len();
        slots.retain(|(id, _)| *id != sub.0);
        slots.len() != before
    }

    /// Invokes every listener with `arg`. A listener detached mid-dispatch
    /// is still delivered this round; one attached mid-dispatch is not.
    pub(crate) fn emit(&self, arg: &A) {
        let snapshot: Vec<Rc<dyn Fn(&A)>> = self
            .slots
            .borrow()
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(arg);
        }
    }
}

impl<A> Default for Listeners<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-field broadcast channels: one [`Listeners`] registry per field name,
/// created on first subscription. Emitting to a field nobody subscribed to
/// is a no-op.
pub(crate) struct FieldHub<A> {
    channels: RefCell<HashMap<String, Rc<Listeners<A>>>>,
}

impl<A> FieldHub<A> {
    pub(crate) fn new() -> Self {
        Self {
            channels: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn on(&self, field: &str, listener: impl Fn(&A) + 'static) -> Subscription {
        let channel = self
            .channels
            .borrow_mut()
            .entry(field.to_string())
            .or_insert_with(|| Rc::new(Listeners::new()))
            .clone();
        channel.on(listener)
    }

    pub(crate) fn emit(&self, field: &str, arg: &A) {
        let channel = self.channels.borrow().get(field).cloned();
        if let Some(channel) = channel {
            channel.emit(arg);
        }
    }
}

impl<A> Default for FieldHub<A> {
    fn default() -> Self {
        Self::new()
    }
}
