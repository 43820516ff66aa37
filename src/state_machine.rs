//! Driver/observer rendezvous over state tokens.
//!
//! Two roles cooperate over one shared map keyed by state identity. The
//! driver moves the machine into a state, which signals the state's
//! *entered* rendezvous; exactly one observer runs its callback for that
//! pass and produces the state's payload; the driver's returned task
//! resolves with that payload when the pass *exits*. A record lives exactly
//! from the first enter request to exit completion — a fresh `move_to`
//! creates a new record, which is what lets observers run looped schedules.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cancellation::Cancellation;
use crate::error::ErrorCode;
use crate::expected::Expected;
use crate::scheduler::{InlineScheduler, Scheduler};
use crate::task::{AbstractTaskCompletionSource, Task, TaskCompletionSource};
use crate::tracing_compat::trace;

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(0);

/// An identity token for one state, carrying the payload type `P` produced
/// by each pass through the state.
pub struct StateMachineState<P> {
    id: u64,
    name: &'static str,
    _payload: PhantomData<fn() -> P>,
}

impl<P> StateMachineState<P> {
    /// Creates a state token. Identity is the token instance, not the name.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            _payload: PhantomData,
        }
    }

    /// The display name given at construction.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<P> std::fmt::Debug for StateMachineState<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineState")
            .field("name", &self.name)
            .finish()
    }
}

struct StateRecord {
    entered: TaskCompletionSource<(), ErrorCode>,
    exited: AbstractTaskCompletionSource,
    work_pending: bool,
}

type StateMap = Arc<Mutex<HashMap<u64, StateRecord>>>;

fn lock(states: &Mutex<HashMap<u64, StateRecord>>) -> MutexGuard<'_, HashMap<u64, StateRecord>> {
    match states.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn fetch_state<P>(
    states: &mut HashMap<u64, StateRecord>,
    id: u64,
) -> (TaskCompletionSource<(), ErrorCode>, AbstractTaskCompletionSource)
where
    P: Clone + Send + Sync + 'static,
{
    let record = states.entry(id).or_insert_with(|| StateRecord {
        entered: TaskCompletionSource::new(),
        exited: AbstractTaskCompletionSource::from(TaskCompletionSource::<P, ErrorCode>::new()),
        work_pending: false,
    });
    (record.entered.clone(), record.exited.clone())
}

/// Cancels a pass that has not yet entered: the record is removed and its
/// *entered* rendezvous resolves cancelled.
fn cancel_enter(states: &Mutex<HashMap<u64, StateRecord>>, id: u64) {
    let entered = {
        let mut map = lock(states);
        let pending = map
            .get(&id)
            .is_some_and(|record| !record.entered.completed());
        if !pending {
            return;
        }
        map.remove(&id).map(|record| record.entered)
    };
    if let Some(entered) = entered {
        entered.complete_error(ErrorCode::operation_cancelled());
    }
}

/// Cancels a pass whose exit has not yet completed: the record is removed
/// and its *exited* rendezvous resolves cancelled.
fn cancel_exit<P>(states: &Mutex<HashMap<u64, StateRecord>>, id: u64)
where
    P: Clone + Send + Sync + 'static,
{
    let exited = {
        let mut map = lock(states);
        let pending = map
            .get(&id)
            .is_some_and(|record| !record.exited.completed());
        if !pending {
            return;
        }
        map.remove(&id).map(|record| record.exited)
    };
    if let Some(exited) = exited {
        exited
            .unsafe_cast::<P, ErrorCode>()
            .complete_error(ErrorCode::operation_cancelled());
    }
}

/// The writing role: moves the machine between states.
#[derive(Clone, Default)]
pub struct StateMachineDriver {
    states: StateMap,
}

impl StateMachineDriver {
    /// Creates a driver with no live state records.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the machine into `state`.
    ///
    /// Signals the state's *entered* rendezvous (synchronously running any
    /// observer wired through an inline scheduler) and returns a task that
    /// resolves with the payload the observer produced once the pass exits.
    /// If `cancel` fires before the exit completes, the record is removed
    /// and the task resolves cancelled.
    pub fn move_to<P>(&self, state: &StateMachineState<P>, cancel: &Cancellation) -> Task<P, ErrorCode>
    where
        P: Clone + Default + Send + Sync + 'static,
    {
        let (entered, exited) = fetch_state::<P>(&mut lock(&self.states), state.id);

        trace!(state = state.name(), "state machine: move_to");
        entered.complete(());

        let states = Arc::clone(&self.states);
        let id = state.id;
        let listener = cancel.add_requested_listener(move || cancel_exit::<P>(&states, id));

        exited
            .unsafe_cast::<P, ErrorCode>()
            .as_task()
            .then_expected_result(
                &InlineScheduler,
                Cancellation::none(),
                move |result: &Expected<P, ErrorCode>| {
                    // The listener only guards against a stuck exit.
                    drop(listener);
                    result.clone()
                },
            )
    }

    /// Waits for `state` to be entered; the observer half of the rendezvous.
    fn enter<P>(&self, state: &StateMachineState<P>, cancel: &Cancellation) -> Task<(), ErrorCode>
    where
        P: Clone + Send + Sync + 'static,
    {
        let entered = {
            let mut map = lock(&self.states);
            let (entered, _) = fetch_state::<P>(&mut map, state.id);
            let record = map
                .get_mut(&state.id)
                .unwrap_or_else(|| unreachable!("record fetched above"));
            assert!(
                !record.work_pending,
                "state already has pending observer work"
            );
            record.work_pending = true;
            entered
        };

        let states = Arc::clone(&self.states);
        let id = state.id;
        let listener = cancel.add_requested_listener(move || cancel_enter(&states, id));

        entered.as_task().then_expected_result(
            &InlineScheduler,
            Cancellation::none(),
            move |result: &Expected<(), ErrorCode>| {
                drop(listener);
                result.clone()
            },
        )
    }

    /// Completes the pass: atomically takes the record out of the map (a
    /// fresh `move_to` creates a new one) and resolves its exit.
    fn exit<P>(&self, id: u64, name: &'static str, payload: P)
    where
        P: Clone + Send + Sync + 'static,
    {
        let record = lock(&self.states).remove(&id);
        if let Some(record) = record {
            trace!(state = name, "state machine: exit");
            record.exited.unsafe_cast::<P, ErrorCode>().complete(payload);
        }
    }
}

impl std::fmt::Debug for StateMachineDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineDriver")
            .field("live_states", &lock(&self.states).len())
            .finish()
    }
}

/// The reading role: runs code when the machine reaches a state.
#[derive(Clone)]
pub struct StateMachineObserver {
    driver: StateMachineDriver,
}

impl StateMachineObserver {
    /// Creates an observer over `driver`'s states.
    #[must_use]
    pub fn new(driver: &StateMachineDriver) -> Self {
        Self {
            driver: driver.clone(),
        }
    }

    /// Runs `f` on `scheduler` when the machine reaches `state`.
    ///
    /// `f` receives the pass's payload cell and may write it; the payload is
    /// handed to the driver when the pass exits, and `f`'s own result
    /// resolves the returned task. Both the enter wait and the dispatch of
    /// `f` are governed by `cancel`; if it fires before enter, `f` never
    /// runs. At most one observer may be pending per state pass.
    pub fn on<P, R, S, F>(
        &self,
        state: &StateMachineState<P>,
        scheduler: &S,
        cancel: &Cancellation,
        f: F,
    ) -> Task<R, ErrorCode>
    where
        P: Clone + Default + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
        S: Scheduler + ?Sized,
        F: FnOnce(&mut P) -> R + Send + 'static,
    {
        let cell = Arc::new(Mutex::new(P::default()));

        let work_cell = Arc::clone(&cell);
        let driver = self.driver.clone();
        let id = state.id;
        let name = state.name;

        self.driver
            .enter(state, cancel)
            .then(scheduler, cancel, move |_: &()| {
                let mut payload = match work_cell.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                f(&mut payload)
            })
            .then_expected_result(
                &InlineScheduler,
                Cancellation::none(),
                move |result: &Expected<R, ErrorCode>| {
                    let payload = {
                        let mut slot = match cell.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        std::mem::take(&mut *slot)
                    };
                    // Exit runs whether the pass succeeded, failed, or was
                    // cancelled mid-flight; a cancelled-before-enter pass
                    // finds no record and exits as a no-op.
                    driver.exit(id, name, payload);
                    result.clone()
                },
            )
    }
}

impl std::fmt::Debug for StateMachineObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineObserver").finish()
    }
}
