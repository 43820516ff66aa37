//! Insertion-ordered collection with RAII row ownership.
//!
//! Rows are owned by [`Ticket`]s: dropping the ticket removes the row under
//! the owner's mutex. Firing code never iterates the collection in place; it
//! takes a [`snapshot`](TicketedCollection::snapshot) under the lock and
//! iterates the copy outside it, which makes ticket drops and insertions
//! from inside a firing listener safe.

use std::sync::{Arc, Mutex, Weak};

/// Stable identity of a row within one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowId(u64);

/// An ordered multiset of `T` with stable row identities.
///
/// Iteration order is insertion order. The collection itself is not
/// synchronized; owners hold it behind their own mutex and hand tickets a
/// weak reference to that mutex.
#[derive(Debug)]
pub struct TicketedCollection<T> {
    rows: Vec<(RowId, T)>,
    next: u64,
}

impl<T> TicketedCollection<T> {
    /// Creates an empty collection.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            rows: Vec::new(),
            next: 0,
        }
    }

    /// Appends a row and returns its identity.
    pub fn insert(&mut self, value: T) -> RowId {
        let id = RowId(self.next);
        self.next += 1;
        self.rows.push((id, value));
        id
    }

    /// Removes a row by identity. Removing twice is a no-op.
    pub fn remove(&mut self, id: RowId) -> Option<T> {
        let index = self.rows.iter().position(|(row, _)| *row == id)?;
        Some(self.rows.remove(index).1)
    }

    /// Iterates rows in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.rows.iter().map(|(_, value)| value)
    }

    /// Copies the current rows, in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.iter().cloned().collect()
    }

    /// Number of live rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if no rows are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<T> Default for TicketedCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle owning one row; dropping it removes the row.
///
/// The release closure captures a weak reference to the owning collection,
/// so dropping a ticket after its owner is gone is a no-op.
#[derive(Debug)]
pub struct Ticket {
    release: Option<Release>,
}

struct Release(Box<dyn FnOnce() + Send>);

impl std::fmt::Debug for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Release")
    }
}

impl Ticket {
    /// Creates a ticket that runs `release` when dropped.
    #[must_use]
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Release(Box::new(release))),
        }
    }

    /// Creates a ticket owning nothing (used by inert sources).
    #[must_use]
    pub const fn inert() -> Self {
        Self { release: None }
    }

    /// Builds the row-removal ticket for a collection held behind a mutex.
    #[must_use]
    pub fn for_row<T: Send + 'static>(owner: &Arc<Mutex<TicketedCollection<T>>>, id: RowId) -> Self {
        let weak: Weak<Mutex<TicketedCollection<T>>> = Arc::downgrade(owner);
        Self::new(move || {
            if let Some(owner) = weak.upgrade() {
                let mut rows = match owner.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                rows.remove(id);
            }
        })
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(Release(release)) = self.release.take() {
            release();
        }
    }
}

/// An aggregation of tickets released together.
#[derive(Debug, Default)]
pub struct TicketScope {
    tickets: Vec<Ticket>,
}

impl TicketScope {
    /// Creates an empty scope.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tickets: Vec::new(),
        }
    }

    /// Takes ownership of a ticket.
    pub fn add(&mut self, ticket: Ticket) {
        self.tickets.push(ticket);
    }

    /// Releases every held ticket now.
    pub fn clear(&mut self) {
        self.tickets.clear();
    }

    /// Returns true if the scope holds no tickets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}
