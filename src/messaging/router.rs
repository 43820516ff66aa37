//! Event router over a compile-time-fixed set of event types.
//!
//! A router holds one ticketed listener collection per event type in its
//! set. Firing snapshots the listener list under the collection's lock and
//! invokes the copies outside it, in insertion order, which makes reentrant
//! fires and ticket drops from inside a listener safe: a listener added
//! during a fire is not called for the in-flight event, and a drop prevents
//! future fires only.

use std::sync::{Arc, Mutex};

use crate::containers::{Ticket, TicketedCollection};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// The listener collection for one event type.
pub struct EventSlot<E: 'static> {
    listeners: Arc<Mutex<TicketedCollection<Listener<E>>>>,
}

impl<E: 'static> Default for EventSlot<E> {
    fn default() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(TicketedCollection::new())),
        }
    }
}

impl<E: 'static> EventSlot<E> {
    fn add(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> Ticket {
        let id = {
            let mut rows = match self.listeners.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            rows.insert(Arc::new(listener))
        };
        Ticket::for_row(&self.listeners, id)
    }

    fn fire(&self, event: &E) {
        let snapshot = {
            let rows = match self.listeners.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            rows.snapshot()
        };
        for listener in snapshot {
            listener(event);
        }
    }
}

impl<E: 'static> std::fmt::Debug for EventSlot<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EventSlot")
    }
}

/// A compile-time set of event types, expressed as a tuple.
pub trait EventSet {
    /// One [`EventSlot`] per event type, in tuple position order.
    type Slots: Default + Send + Sync + 'static;
}

/// Position-indexed access to the slot of event type `E` within a set.
///
/// The index parameter `I` disambiguates positions so the compiler can
/// infer the slot from the event type alone.
pub trait SlotAt<E: 'static, I>: EventSet {
    /// Returns the slot storing listeners for `E`.
    fn slot(slots: &Self::Slots) -> &EventSlot<E>;
}

/// Position marker types for [`SlotAt`].
pub mod index {
    /// First position.
    #[derive(Debug)]
    pub struct P0;
    /// Second position.
    #[derive(Debug)]
    pub struct P1;
    /// Third position.
    #[derive(Debug)]
    pub struct P2;
    /// Fourth position.
    #[derive(Debug)]
    pub struct P3;
    /// Fifth position.
    #[derive(Debug)]
    pub struct P4;
    /// Sixth position.
    #[derive(Debug)]
    pub struct P5;
}

macro_rules! impl_event_set {
    (($($set:ident),+)) => {
        impl<$($set: 'static),+> EventSet for ($($set,)+) {
            type Slots = ($(EventSlot<$set>,)+);
        }
    };
}

macro_rules! impl_slot_at {
    (($($set:ident),+), $event:ident, $idx:ident, $field:tt) => {
        impl<$($set: 'static),+> SlotAt<$event, index::$idx> for ($($set,)+) {
            fn slot(slots: &Self::Slots) -> &EventSlot<$event> {
                &slots.$field
            }
        }
    };
}

impl_event_set!((A));
impl_slot_at!((A), A, P0, 0);

impl_event_set!((A, B));
impl_slot_at!((A, B), A, P0, 0);
impl_slot_at!((A, B), B, P1, 1);

impl_event_set!((A, B, C));
impl_slot_at!((A, B, C), A, P0, 0);
impl_slot_at!((A, B, C), B, P1, 1);
impl_slot_at!((A, B, C), C, P2, 2);

impl_event_set!((A, B, C, D));
impl_slot_at!((A, B, C, D), A, P0, 0);
impl_slot_at!((A, B, C, D), B, P1, 1);
impl_slot_at!((A, B, C, D), C, P2, 2);
impl_slot_at!((A, B, C, D), D, P3, 3);

impl_event_set!((A, B, C, D, E));
impl_slot_at!((A, B, C, D, E), A, P0, 0);
impl_slot_at!((A, B, C, D, E), B, P1, 1);
impl_slot_at!((A, B, C, D, E), C, P2, 2);
impl_slot_at!((A, B, C, D, E), D, P3, 3);
impl_slot_at!((A, B, C, D, E), E, P4, 4);

impl_event_set!((A, B, C, D, E, F));
impl_slot_at!((A, B, C, D, E, F), A, P0, 0);
impl_slot_at!((A, B, C, D, E, F), B, P1, 1);
impl_slot_at!((A, B, C, D, E, F), C, P2, 2);
impl_slot_at!((A, B, C, D, E, F), D, P3, 3);
impl_slot_at!((A, B, C, D, E, F), E, P4, 4);
impl_slot_at!((A, B, C, D, E, F), F, P5, 5);

/// Typed multi-listener dispatch over the event set `S`.
pub struct Router<S: EventSet> {
    slots: S::Slots,
}

impl<S: EventSet> Router<S> {
    /// Creates a router with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: S::Slots::default(),
        }
    }

    /// Registers a listener for events of type `E`.
    ///
    /// Safe to call from inside another listener; the new listener does not
    /// fire for the event currently being dispatched. The ticket's drop
    /// removes the listener.
    pub fn add_listener<E, I>(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> Ticket
    where
        E: 'static,
        S: SlotAt<E, I>,
    {
        S::slot(&self.slots).add(listener)
    }

    /// Invokes every listener registered for `E`, in insertion order.
    ///
    /// Zero listeners is a no-op. Listeners may fire recursively and may
    /// drop their own ticket; the in-flight snapshot is unaffected.
    pub fn fire<E, I>(&self, event: &E)
    where
        E: 'static,
        S: SlotAt<E, I>,
    {
        S::slot(&self.slots).fire(event);
    }
}

impl<S: EventSet> Default for Router<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: EventSet> std::fmt::Debug for Router<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Router")
    }
}
