//! Aggregation of multiple tasks into one.
//!
//! Every variant waits for *all* inputs even after an error: the first
//! observed error is remembered and reported once the last input finishes,
//! and success yields the collected values in input order. Aggregation runs
//! on the inline scheduler, so the aggregate completes on whichever thread
//! finishes last.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{task_from_result, Task, TaskCompletionSource};
use crate::cancellation::Cancellation;
use crate::error::ErrorChannel;
use crate::expected::Expected;
use crate::scheduler::InlineScheduler;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Aggregate<E, R> {
    pending: usize,
    error: Option<E>,
    results: R,
}

impl<E: ErrorChannel, R> Aggregate<E, R> {
    fn observe(&mut self, error: Option<&E>) -> bool {
        self.pending -= 1;
        if let Some(error) = error {
            // Keep the first error; later ones may just be its cascade.
            if self.error.is_none() {
                self.error = Some(error.clone());
            }
        }
        self.pending == 0
    }
}

/// Completes when every task in `tasks` completes, yielding the values in
/// input order. The empty span completes synchronously with an empty vector.
pub fn when_all<T, E>(tasks: &[Task<T, E>]) -> Task<Vec<T>, E>
where
    T: Clone + Send + Sync + 'static,
    E: ErrorChannel,
{
    if tasks.is_empty() {
        return task_from_result(Vec::new());
    }

    let source = TaskCompletionSource::<Vec<T>, E>::new();
    let data = Arc::new(Mutex::new(Aggregate {
        pending: tasks.len(),
        error: None,
        results: vec![None::<T>; tasks.len()],
    }));

    for (index, task) in tasks.iter().enumerate() {
        let data = Arc::clone(&data);
        let source = source.clone();
        task.then_expected(
            &InlineScheduler,
            Cancellation::none(),
            move |exp: &Expected<T, E>| {
                let finished = {
                    let mut agg = lock(&data);
                    if let Ok(value) = exp.as_result() {
                        agg.results[index] = Some(value.clone());
                    }
                    if !agg.observe(exp.as_result().err()) {
                        return;
                    }
                    match agg.error.take() {
                        Some(error) => Expected::from_error(error),
                        None => Expected::from_value(
                            agg.results
                                .iter_mut()
                                .map(|slot| {
                                    slot.take().unwrap_or_else(|| {
                                        unreachable!("aggregate missing a collected value")
                                    })
                                })
                                .collect(),
                        ),
                    }
                };
                source.complete_expected(finished);
            },
        );
    }

    source.into_task()
}

/// [`when_all`] over unit tasks: completes when every input completes,
/// discarding the unit values. The empty span completes synchronously.
pub fn when_all_void<E>(tasks: &[Task<(), E>]) -> Task<(), E>
where
    E: ErrorChannel,
{
    if tasks.is_empty() {
        return task_from_result(());
    }

    let source = TaskCompletionSource::<(), E>::new();
    let data = Arc::new(Mutex::new(Aggregate {
        pending: tasks.len(),
        error: None,
        results: (),
    }));

    for task in tasks {
        let data = Arc::clone(&data);
        let source = source.clone();
        task.then_expected(
            &InlineScheduler,
            Cancellation::none(),
            move |exp: &Expected<(), E>| {
                let finished = {
                    let mut agg = lock(&data);
                    if !agg.observe(exp.as_result().err()) {
                        return;
                    }
                    match agg.error.take() {
                        Some(error) => Expected::from_error(error),
                        None => Expected::valid(),
                    }
                };
                source.complete_expected(finished);
            },
        );
    }

    source.into_task()
}

/// Completes when both tasks complete, yielding their values as a tuple.
/// Unit-producing inputs contribute `()` at their position.
pub fn when_all2<A, B, E>(first: &Task<A, E>, second: &Task<B, E>) -> Task<(A, B), E>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    E: ErrorChannel,
{
    let source = TaskCompletionSource::<(A, B), E>::new();
    let data = Arc::new(Mutex::new(Aggregate {
        pending: 2,
        error: None,
        results: (None::<A>, None::<B>),
    }));

    {
        let data = Arc::clone(&data);
        let source = source.clone();
        first.then_expected(
            &InlineScheduler,
            Cancellation::none(),
            move |exp: &Expected<A, E>| {
                let finished = {
                    let mut agg = lock(&data);
                    if let Ok(value) = exp.as_result() {
                        agg.results.0 = Some(value.clone());
                    }
                    if !agg.observe(exp.as_result().err()) {
                        return;
                    }
                    tuple2_result(&mut agg)
                };
                source.complete_expected(finished);
            },
        );
    }
    {
        let data = Arc::clone(&data);
        let source = source.clone();
        second.then_expected(
            &InlineScheduler,
            Cancellation::none(),
            move |exp: &Expected<B, E>| {
                let finished = {
                    let mut agg = lock(&data);
                    if let Ok(value) = exp.as_result() {
                        agg.results.1 = Some(value.clone());
                    }
                    if !agg.observe(exp.as_result().err()) {
                        return;
                    }
                    tuple2_result(&mut agg)
                };
                source.complete_expected(finished);
            },
        );
    }

    source.into_task()
}

fn tuple2_result<A, B, E: ErrorChannel>(
    agg: &mut Aggregate<E, (Option<A>, Option<B>)>,
) -> Expected<(A, B), E> {
    match agg.error.take() {
        Some(error) => Expected::from_error(error),
        None => {
            let a = agg.results.0.take();
            let b = agg.results.1.take();
            match (a, b) {
                (Some(a), Some(b)) => Expected::from_value((a, b)),
                _ => unreachable!("aggregate missing a collected value"),
            }
        }
    }
}

/// Completes when all three tasks complete, yielding their values as a
/// tuple; built from nested [`when_all2`] aggregation.
pub fn when_all3<A, B, C, E>(
    first: &Task<A, E>,
    second: &Task<B, E>,
    third: &Task<C, E>,
) -> Task<(A, B, C), E>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
    E: ErrorChannel,
{
    when_all2(&when_all2(first, second), third).then_result(
        &InlineScheduler,
        Cancellation::none(),
        |((a, b), c): &((A, B), C)| Expected::from_value((a.clone(), b.clone(), c.clone())),
    )
}
