//! Fork-join worker pool
//!
//! [`fork_join`] runs one task per worker context and returns only after every
//! task has finished: that return is the phase barrier. Each task gets `&mut`
//! access to its own context and nothing else mutable.

use crate::error::{Error, Result};
use crate::worker::WorkerContext;

/// Run `task` once per worker in parallel and collect results in worker order.
///
/// Each worker pins itself to its CPU (best effort) before running `task`.
/// A panicking worker is reported as [`Error::WorkerPanicked`] once all other
/// workers have been joined.
#[cfg(not(feature = "parallel"))]
pub fn fork_join<S, R, F>(workers: &mut [WorkerContext<S>], task: F) -> Result<Vec<R>>
where
    S: Send,
    R: Send,
    F: Fn(&mut WorkerContext<S>) -> R + Sync,
{
    let task = &task;
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers.len());
        for ctx in workers.iter_mut() {
            let index = ctx.index();
            let handle = std::thread::Builder::new()
                .name(format!("kvload-worker-{}", index))
                .spawn_scoped(scope, move || {
                    ctx.pin_current_thread();
                    task(ctx)
                })?;
            handles.push((index, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut panicked = None;
        for (index, handle) in handles {
            match handle.join() {
                Ok(result) => results.push(result),
                Err(_) => {
                    panicked.get_or_insert(index);
                }
            }
        }
        match panicked {
            Some(worker) => Err(Error::WorkerPanicked { worker }),
            None => Ok(results),
        }
    })
}

/// Run `task` once per worker on a dedicated rayon pool sized to the workers.
#[cfg(feature = "parallel")]
pub fn fork_join<S, R, F>(workers: &mut [WorkerContext<S>], task: F) -> Result<Vec<R>>
where
    S: Send,
    R: Send,
    F: Fn(&mut WorkerContext<S>) -> R + Sync,
{
    use rayon::prelude::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.len().max(1))
        .thread_name(|i| format!("kvload-worker-{}", i))
        .build()
        .map_err(|err| Error::Io(std::io::Error::other(err)))?;

    let outcomes: Vec<(usize, std::thread::Result<R>)> = pool.install(|| {
        workers
            .par_iter_mut()
            .with_max_len(1)
            .map(|ctx| {
                let index = ctx.index();
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    ctx.pin_current_thread();
                    task(ctx)
                }));
                (index, outcome)
            })
            .collect()
    });

    let mut results = Vec::with_capacity(outcomes.len());
    for (worker, outcome) in outcomes {
        match outcome {
            Ok(result) => results.push(result),
            Err(_) => return Err(Error::WorkerPanicked { worker }),
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn contexts(n: usize) -> Vec<WorkerContext<u64>> {
        (0..n).map(|i| WorkerContext::new(i, None, 0u64)).collect()
    }

    #[test]
    fn test_results_in_worker_order() {
        let mut workers = contexts(8);
        let results = fork_join(&mut workers, |ctx| ctx.index() * 10).unwrap();
        assert_eq!(results, (0..8).map(|i| i * 10).collect::<Vec<_>>());
    }

    #[test]
    fn test_each_worker_mutates_only_its_session() {
        let mut workers = contexts(4);
        fork_join(&mut workers, |ctx| {
            let index = ctx.index() as u64;
            for _ in 0..1000 {
                *ctx.session_mut() += index;
            }
        })
        .unwrap();
        for (i, ctx) in workers.iter_mut().enumerate() {
            assert_eq!(*ctx.session_mut(), i as u64 * 1000);
        }
    }

    #[cfg(not(feature = "parallel"))]
    #[test]
    fn test_runs_on_distinct_threads() {
        let mut workers = contexts(4);
        let ids = fork_join(&mut workers, |_| std::thread::current().id()).unwrap();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn test_panic_is_reported() {
        let mut workers = contexts(3);
        let result = fork_join(&mut workers, |ctx| {
            if ctx.index() == 1 {
                panic!("worker failure");
            }
            ctx.index()
        });
        assert!(matches!(result, Err(Error::WorkerPanicked { worker: 1 })));
    }

    #[test]
    fn test_empty_pool() {
        let mut workers = contexts(0);
        let results = fork_join(&mut workers, |ctx| ctx.index()).unwrap();
        assert!(results.is_empty());
    }
}
