//! Container utilities backing the cancellation and routing machinery.

pub mod ticketed;

pub use ticketed::{RowId, Ticket, TicketScope, TicketedCollection};
