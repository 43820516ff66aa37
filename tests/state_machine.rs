//! State machine scenarios: mediator-fed workers cooperating with driver
//! schedules, conditional initialization, and cancellation of either side.

mod common;

use std::sync::{Arc, Mutex};

use arcana::{
    make_task, make_task_flat, task_from_result, BackgroundDispatcher, Cancellation,
    CancellationSource, ErrorCode, InlineScheduler, ManualDispatcher, Mediator, PendingTaskScope,
    Scheduler, SchedulerHandle, StateMachineDriver, StateMachineObserver, StateMachineState, Task,
    TicketScope,
};
use common::{init_test_logging, TraceLog};

fn none() -> &'static Cancellation {
    Cancellation::none()
}

struct ImageReceived;

type EventMediator = Mediator<ManualDispatcher, (ImageReceived,)>;

/// The fixture shared by the worker scenarios.
struct Rig {
    driver: StateMachineDriver,
    observer: StateMachineObserver,
    dispatcher: ManualDispatcher,
    mediator: Arc<EventMediator>,
    init_state: Arc<StateMachineState<bool>>,
    read_state: Arc<StateMachineState<()>>,
    write_state: Arc<StateMachineState<()>>,
}

impl Rig {
    fn new() -> Self {
        let driver = StateMachineDriver::new();
        let observer = StateMachineObserver::new(&driver);
        let dispatcher = ManualDispatcher::new();
        let mediator = Arc::new(Mediator::new(dispatcher.clone()));
        Self {
            driver,
            observer,
            dispatcher,
            mediator,
            init_state: Arc::new(StateMachineState::new("TrackingInit")),
            read_state: Arc::new(StateMachineState::new("TrackingRead")),
            write_state: Arc::new(StateMachineState::new("TrackingWrite")),
        }
    }
}

/// Counts initialization passes and reports readiness on the fourth.
struct InitializationWorker {
    count: Arc<Mutex<i32>>,
    pending: Arc<PendingTaskScope<ErrorCode>>,
    cancel: CancellationSource,
    _registrations: Arc<Mutex<TicketScope>>,
}

impl InitializationWorker {
    fn new(rig: &Rig) -> Self {
        let count = Arc::new(Mutex::new(0));
        let registrations = Arc::new(Mutex::new(TicketScope::new()));
        let pending = Arc::new(PendingTaskScope::new());
        let cancel = CancellationSource::new();

        let ticket = {
            let count = Arc::clone(&count);
            let registrations = Arc::clone(&registrations);
            let pending = Arc::clone(&pending);
            let cancel = cancel.clone();
            let observer = rig.observer.clone();
            let dispatcher = rig.dispatcher.clone();
            let init_state = Arc::clone(&rig.init_state);
            rig.mediator.add_listener(move |_: &ImageReceived| {
                let count = Arc::clone(&count);
                let registrations = Arc::clone(&registrations);
                let task = observer.on(
                    init_state.as_ref(),
                    &dispatcher,
                    &cancel,
                    move |ready: &mut bool| {
                        let mut count = count.lock().unwrap();
                        *count += 1;
                        if *count > 3 {
                            registrations.lock().unwrap().clear();
                            *ready = true;
                        }
                    },
                );
                pending.add(&task);
            })
        };
        registrations.lock().unwrap().add(ticket);

        Self {
            count,
            pending,
            cancel,
            _registrations: registrations,
        }
    }

    fn count(&self) -> i32 {
        *self.count.lock().unwrap()
    }

    fn shutdown(&self) -> Task<(), ErrorCode> {
        self.cancel.cancel();
        self.pending.when_all()
    }
}

/// Chains one read/write iteration per received image.
struct TrackingWorker {
    iterations: Arc<Mutex<i32>>,
    result: Arc<Mutex<i32>>,
    scope: Arc<PendingTaskScope<ErrorCode>>,
    cancel: CancellationSource,
    _registrations: TicketScope,
}

impl TrackingWorker {
    fn new(rig: &Rig) -> Self {
        let iterations = Arc::new(Mutex::new(0));
        let result = Arc::new(Mutex::new(0));
        let scope = Arc::new(PendingTaskScope::new());
        let cancel = CancellationSource::new();
        let previous: Arc<Mutex<Task<(), ErrorCode>>> =
            Arc::new(Mutex::new(task_from_result(())));

        let ticket = {
            let iterations = Arc::clone(&iterations);
            let result = Arc::clone(&result);
            let scope = Arc::clone(&scope);
            let cancel = cancel.clone();
            let previous = Arc::clone(&previous);
            let observer = rig.observer.clone();
            let dispatcher = rig.dispatcher.clone();
            let read_state = Arc::clone(&rig.read_state);
            let write_state = Arc::clone(&rig.write_state);

            rig.mediator.add_listener(move |_: &ImageReceived| {
                if cancel.cancelled() {
                    return;
                }

                let mut prev = previous.lock().unwrap();

                let read = {
                    let observer = observer.clone();
                    let dispatcher = dispatcher.clone();
                    let cancel = cancel.token();
                    let result = Arc::clone(&result);
                    let read_state = Arc::clone(&read_state);
                    move |_: &()| {
                        let result = Arc::clone(&result);
                        observer.on(read_state.as_ref(), &dispatcher, &cancel, move |_: &mut ()| {
                            *result.lock().unwrap() + 10
                        })
                    }
                };

                let write = {
                    let observer = observer.clone();
                    let dispatcher = dispatcher.clone();
                    let cancel = cancel.token();
                    let result = Arc::clone(&result);
                    let iterations = Arc::clone(&iterations);
                    let write_state = Arc::clone(&write_state);
                    move |value: &i32| {
                        let value = *value + 30;
                        let result = Arc::clone(&result);
                        let iterations = Arc::clone(&iterations);
                        observer.on(write_state.as_ref(), &dispatcher, &cancel, move |_: &mut ()| {
                            *result.lock().unwrap() += value;
                            *iterations.lock().unwrap() += 1;
                        })
                    }
                };

                let next = prev
                    .then_task(&dispatcher, &cancel, read)
                    .then_task(&dispatcher, &cancel, write);
                scope.add(&next);
                *prev = next;
            })
        };

        let mut registrations = TicketScope::new();
        registrations.add(ticket);

        Self {
            iterations,
            result,
            scope,
            cancel,
            _registrations: registrations,
        }
    }

    fn iterations(&self) -> i32 {
        *self.iterations.lock().unwrap()
    }

    fn result(&self) -> i32 {
        *self.result.lock().unwrap()
    }

    fn shutdown(&self) -> Task<(), ErrorCode> {
        self.cancel.cancel();
        self.scope.when_all()
    }
}

fn linear_schedule(
    driver: &StateMachineDriver,
    read: &Arc<StateMachineState<()>>,
    write: &Arc<StateMachineState<()>>,
) -> Task<(), ErrorCode> {
    let d = driver.clone();
    let r = Arc::clone(read);
    let w = Arc::clone(write);

    make_task_flat::<ErrorCode, (), _, _>(&InlineScheduler, Cancellation::none(), {
        let d = d.clone();
        let r = Arc::clone(&r);
        move || d.move_to(r.as_ref(), Cancellation::none())
    })
    .then_task(&InlineScheduler, Cancellation::none(), {
        let d = d.clone();
        let w = Arc::clone(&w);
        move |_: &()| d.move_to(w.as_ref(), Cancellation::none())
    })
    .then_task(&InlineScheduler, Cancellation::none(), move |_: &()| {
        linear_schedule(&d, &r, &w)
    })
}

fn initialization_schedule(
    driver: &StateMachineDriver,
    init: &Arc<StateMachineState<bool>>,
    read: &Arc<StateMachineState<()>>,
    write: &Arc<StateMachineState<()>>,
) -> Task<(), ErrorCode> {
    let d = driver.clone();
    let i = Arc::clone(init);
    let r = Arc::clone(read);
    let w = Arc::clone(write);

    make_task_flat::<ErrorCode, bool, _, _>(&InlineScheduler, Cancellation::none(), {
        let d = d.clone();
        let i = Arc::clone(&i);
        move || d.move_to(i.as_ref(), Cancellation::none())
    })
    .then_task(
        &InlineScheduler,
        Cancellation::none(),
        move |initialized: &bool| {
            if *initialized {
                linear_schedule(&d, &r, &w)
            } else {
                initialization_schedule(&d, &i, &r, &w)
            }
        },
    )
}

#[test]
fn repeating_linear_schedule_accumulates() {
    init_test_logging();
    let rig = Rig::new();

    linear_schedule(&rig.driver, &rig.read_state, &rig.write_state);

    let worker = TrackingWorker::new(&rig);

    loop {
        if worker.iterations() == 2 {
            worker.shutdown();
            break;
        }
        rig.mediator.send(ImageReceived);
        if !rig.dispatcher.tick(none()) {
            break;
        }
    }
    while rig.dispatcher.tick(none()) {}

    assert_eq!(worker.result(), 120);
}

#[test]
fn conditional_schedule_initializes_then_tracks() {
    init_test_logging();
    let rig = Rig::new();

    initialization_schedule(
        &rig.driver,
        &rig.init_state,
        &rig.read_state,
        &rig.write_state,
    );

    let init = InitializationWorker::new(&rig);
    let worker = TrackingWorker::new(&rig);

    loop {
        if worker.iterations() == 2 {
            worker.shutdown();
            init.shutdown();
            break;
        }
        rig.mediator.send(ImageReceived);
        if !rig.dispatcher.tick(none()) {
            break;
        }
    }
    while rig.dispatcher.tick(none()) {}

    assert_eq!(init.count(), 4);
    assert_eq!(worker.iterations(), 2);
    assert_eq!(worker.result(), 120);
}

#[test]
fn cancellation_cancels_the_scheduling_method() {
    init_test_logging();
    let driver = StateMachineDriver::new();
    let one = Arc::new(StateMachineState::<()>::new("One"));
    let two = Arc::new(StateMachineState::<()>::new("Two"));
    let cancel = CancellationSource::new();

    let driver_finished = Arc::new(Mutex::new(false));
    let observer_finished = Arc::new(Mutex::new(false));

    {
        let d = driver.clone();
        let one = Arc::clone(&one);
        let token = cancel.token();
        let chain = make_task_flat::<ErrorCode, (), _, _>(&InlineScheduler, &cancel, move || {
            d.move_to(one.as_ref(), &token)
        });
        let d = driver.clone();
        let two = Arc::clone(&two);
        let token = cancel.token();
        let finished = Arc::clone(&driver_finished);
        chain
            .then_task(&InlineScheduler, &cancel, move |_: &()| {
                d.move_to(two.as_ref(), &token)
            })
            .then_expected(&InlineScheduler, none(), move |_: &arcana::Expected<(), ErrorCode>| {
                *finished.lock().unwrap() = true;
            });
    }

    {
        let c = cancel.clone();
        let finished = Arc::clone(&observer_finished);
        make_task::<ErrorCode, _, _, _>(&InlineScheduler, &cancel, move || c.cancel())
            .then_expected(&InlineScheduler, none(), move |_: &arcana::Expected<(), ErrorCode>| {
                *finished.lock().unwrap() = true;
            });
    }

    assert!(*driver_finished.lock().unwrap());
    assert!(*observer_finished.lock().unwrap());
}

fn work_on(
    log: &TraceLog,
    observer: &StateMachineObserver,
    state: &Arc<StateMachineState<()>>,
    cancel: &Cancellation,
    scheduler: &SchedulerHandle,
) -> Task<(), ErrorCode> {
    let l = log.clone();
    let obs = observer.clone();
    let st = Arc::clone(state);
    let c = cancel.clone();
    let s = scheduler.clone();

    make_task_flat::<ErrorCode, (), _, _>(scheduler, cancel, {
        let l = l.clone();
        let obs = obs.clone();
        let st = Arc::clone(&st);
        let c = c.clone();
        let s = s.clone();
        move || {
            let name = st.name();
            obs.on(st.as_ref(), &s, &c, move |_: &mut ()| {
                l.push(name);
            })
        }
    })
    .then_task(scheduler, cancel, move |_: &()| {
        work_on(&l, &obs, &st, &c, &s)
    })
}

#[test]
fn sequential_schedule_runs_on_a_background_dispatcher() {
    init_test_logging();
    let driver = StateMachineDriver::new();
    let observer = StateMachineObserver::new(&driver);
    let cancel = CancellationSource::new();
    let background = BackgroundDispatcher::new();
    let bg = background.handle();

    let one = Arc::new(StateMachineState::<()>::new("1"));
    let two = Arc::new(StateMachineState::<()>::new("2"));
    let three = Arc::new(StateMachineState::<()>::new("3"));

    let (tx, rx) = std::sync::mpsc::channel::<()>();

    {
        let d = driver.clone();
        let one = Arc::clone(&one);
        let first = make_task_flat::<ErrorCode, (), _, _>(&InlineScheduler, none(), move || {
            d.move_to(one.as_ref(), Cancellation::none())
        });
        let d = driver.clone();
        let two = Arc::clone(&two);
        let second = first.then_task(&InlineScheduler, none(), move |_: &()| {
            d.move_to(two.as_ref(), Cancellation::none())
        });
        let d = driver.clone();
        let three = Arc::clone(&three);
        second
            .then_task(&InlineScheduler, none(), move |_: &()| {
                d.move_to(three.as_ref(), Cancellation::none())
            })
            .then(&InlineScheduler, none(), move |_: &()| {
                tx.send(()).unwrap();
            });
    }

    let log = TraceLog::new();
    work_on(&log, &observer, &one, &cancel, &bg);
    work_on(&log, &observer, &two, &cancel, &bg);
    work_on(&log, &observer, &three, &cancel, &bg);

    rx.recv().unwrap();
    cancel.cancel();

    assert_eq!(log.contents(), "123");
}
