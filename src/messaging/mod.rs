//! Typed multi-listener event dispatch.
//!
//! [`Router`] fans an event out to every registered listener of its type;
//! [`Mediator`] wraps a router so all events are processed on one
//! dispatcher, no matter which thread sent them.

pub mod mediator;
pub mod router;

pub use mediator::Mediator;
pub use router::{EventSet, EventSlot, Router, SlotAt};
