//! Dispatcher-affine event pool.
//!
//! A mediator lets any thread send events while guaranteeing that all
//! listeners run on one dispatcher. Listener registration is checked
//! against the dispatcher's thread affinity, because the listener list is
//! only ever touched from senders (snapshot) and that dispatcher (fire).

use std::sync::Arc;

use super::router::{EventSet, Router, SlotAt};
use crate::containers::Ticket;
use crate::scheduler::{HasAffinity, Scheduler};
use crate::tracing_compat::trace;

/// An event pool that processes every event on one dispatcher.
pub struct Mediator<D, S: EventSet> {
    dispatcher: D,
    router: Arc<Router<S>>,
}

impl<D, S> Mediator<D, S>
where
    D: Scheduler + HasAffinity,
    S: EventSet + 'static,
{
    /// Creates a mediator posting events through `dispatcher`.
    pub fn new(dispatcher: D) -> Self {
        Self {
            dispatcher,
            router: Arc::new(Router::new()),
        }
    }

    /// Queues `event` for dispatch; listeners run when the dispatcher
    /// drains, not on the sending thread.
    pub fn send<E, I>(&self, event: E)
    where
        E: Send + 'static,
        S: SlotAt<E, I>,
        I: 'static,
    {
        let router = Arc::clone(&self.router);
        trace!("mediator: event queued");
        self.dispatcher
            .schedule(Box::new(move || router.fire(&event)));
    }

    /// Registers a listener for events of type `E`.
    ///
    /// # Panics
    ///
    /// Panics when called off the dispatcher's thread once the dispatcher
    /// has a thread affinity.
    pub fn add_listener<E, I>(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> Ticket
    where
        E: 'static,
        S: SlotAt<E, I>,
    {
        assert!(
            self.dispatcher.affinity().check(),
            "mediator listeners must be added on the dispatcher thread"
        );
        self.router.add_listener(listener)
    }

    /// The dispatcher all events are processed on.
    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }
}

impl<D, S: EventSet> std::fmt::Debug for Mediator<D, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Mediator")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::Cancellation;
    use crate::containers::TicketScope;
    use crate::dispatcher::ManualDispatcher;
    use crate::scheduler::Affinity;
    use std::sync::Mutex;

    struct One {
        value: i32,
    }
    struct Two {
        message: &'static str,
    }
    struct Three {
        mat: [i32; 3],
    }

    #[test]
    fn send_defers_dispatch_to_the_dispatcher() {
        let dis = ManualDispatcher::new();
        let med: Mediator<_, (One,)> = Mediator::new(dis.clone());

        let received = Arc::new(Mutex::new(10));
        let r = Arc::clone(&received);
        let _reg = med.add_listener(move |evt: &One| {
            *r.lock().unwrap() = evt.value;
        });

        med.send(One { value: 1 });
        assert_eq!(*received.lock().unwrap(), 10, "not until the tick");

        dis.tick(Cancellation::none());
        assert_eq!(*received.lock().unwrap(), 1);
    }

    #[test]
    fn events_of_each_type_reach_their_listeners() {
        let dis = ManualDispatcher::new();
        let med: Mediator<_, (One, Two, Three)> = Mediator::new(dis.clone());
        let mut registrations = TicketScope::new();

        let received = Arc::new(Mutex::new(10_i64));

        let r = Arc::clone(&received);
        registrations.add(med.add_listener(move |evt: &One| {
            *r.lock().unwrap() = i64::from(evt.value);
        }));
        let r = Arc::clone(&received);
        registrations.add(med.add_listener(move |evt: &Two| {
            for c in evt.message.bytes() {
                *r.lock().unwrap() *= i64::from(c);
            }
        }));
        let r = Arc::clone(&received);
        registrations.add(med.add_listener(move |evt: &Three| {
            for c in evt.mat {
                *r.lock().unwrap() += i64::from(c);
            }
        }));

        med.send(One { value: 3 });
        med.send(Two { message: "two" });
        med.send(Three { mat: [1, 2, 3] });

        dis.tick(Cancellation::none());
        assert_eq!(*received.lock().unwrap(), 4_596_738);
    }

    #[test]
    fn affinity_is_enforced_at_registration() {
        let dis = ManualDispatcher::new();
        dis.set_affinity(Affinity::here());
        let med: Mediator<_, (One,)> = Mediator::new(dis);

        // Same thread: allowed.
        let _reg = med.add_listener(|_: &One| {});

        let med = Arc::new(med);
        let refused = std::thread::spawn(move || {
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let _ = med.add_listener(|_: &One| {});
            }))
            .is_err()
        })
        .join()
        .unwrap();
        assert!(refused, "registration off the dispatcher thread must fail");
    }
}
