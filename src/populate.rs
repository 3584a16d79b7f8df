//! Populate phase
//!
//! The index range `[0, working_set)` is cut into fixed-size chunks and the
//! chunks are dealt round-robin: worker `w` of `n` takes chunks `w, w + n,
//! w + 2n, ...`. Every index belongs to exactly one chunk and every chunk to
//! exactly one worker, and each worker walks its indices in increasing order.

use std::ops::Range;
use std::time::Instant;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::BenchmarkConfig;
use crate::elements::ElementArray;
use crate::engine::{KvEngine, StoreMode};
use crate::error::{Error, Result};
use crate::key::{PayloadHeader, write_payload};
use crate::pool::fork_join;
use crate::report::{PhaseResult, PopulateCounters};
use crate::worker::WorkerContext;

/// Static round-robin assignment of index chunks to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    working_set: u64,
    chunk_size: u64,
    workers: usize,
}

impl ChunkPlan {
    /// Plan for `working_set` indices in chunks of `chunk_size` over `workers`
    pub fn new(working_set: u64, chunk_size: u64, workers: usize) -> Self {
        Self {
            working_set,
            chunk_size: chunk_size.max(1),
            workers: workers.max(1),
        }
    }

    /// Number of chunks covering the working set
    pub fn chunk_count(&self) -> u64 {
        self.working_set.div_ceil(self.chunk_size)
    }

    /// Index range of chunk `chunk`
    pub fn chunk(&self, chunk: u64) -> Range<u64> {
        let start = chunk * self.chunk_size;
        start..(start + self.chunk_size).min(self.working_set)
    }

    /// Chunks owned by `worker`, in increasing index order
    pub fn chunks_for(&self, worker: usize) -> impl Iterator<Item = Range<u64>> + '_ {
        (worker as u64..self.chunk_count())
            .step_by(self.workers)
            .map(move |chunk| self.chunk(chunk))
    }

    /// Indices owned by `worker`
    pub fn assigned(&self, worker: usize) -> u64 {
        self.chunks_for(worker).map(|range| range.end - range.start).sum()
    }
}

/// Shared, read-only inputs of the populate phase
pub struct PopulateTask<'a, E> {
    /// Engine under test
    pub engine: &'a E,
    /// Run configuration
    pub config: &'a BenchmarkConfig,
    /// Identity records written alongside each item
    pub elements: &'a ElementArray,
    /// Chunk assignment
    pub plan: ChunkPlan,
    /// Checked between chunks
    pub cancel: &'a CancelToken,
}

/// Populate every index assigned to `ctx`.
///
/// Returns `None` if the run was cancelled at a chunk boundary.
pub fn populate_worker<E: KvEngine>(
    ctx: &mut WorkerContext<E::Session>,
    task: &PopulateTask<'_, E>,
) -> Option<PopulateCounters> {
    let worker = ctx.index();
    let value_size = task.config.value_size();
    let encoding = task.config.key_encoding();
    let interval = task.config.progress_interval();
    let assigned = task.plan.assigned(worker);

    let mut counters = PopulateCounters::default();
    let mut done = 0u64;

    for chunk in task.plan.chunks_for(worker) {
        if task.cancel.is_cancelled() {
            debug!(worker, done, "populate cancelled");
            return None;
        }
        for index in chunk {
            let key = encoding.encode(index);
            match task.engine.allocate(&key, 0, 0, value_size) {
                Some(mut pending) => {
                    write_payload(
                        task.engine.payload_mut(&mut pending),
                        PayloadHeader { slot: index, index },
                    );
                    task.elements.set_key(index, index);
                    let outcome = task.engine.store(pending, StoreMode::Set, ctx.session_mut());
                    counters.record(outcome);
                }
                None => {
                    debug!(worker, index, "allocation failed, skipping index");
                    counters.alloc_failed += 1;
                }
            }

            done += 1;
            if done % interval == 0 {
                info!(worker, done, assigned, "populate progress");
            }
        }
    }

    Some(counters)
}

/// Run the populate phase across `workers` and merge the results.
pub fn run_populate<E: KvEngine>(
    workers: &mut [WorkerContext<E::Session>],
    engine: &E,
    config: &BenchmarkConfig,
    elements: &ElementArray,
    cancel: &CancelToken,
) -> Result<PhaseResult<PopulateCounters>> {
    let task = PopulateTask {
        engine,
        config,
        elements,
        plan: ChunkPlan::new(config.working_set_size(), config.chunk_size(), workers.len()),
        cancel,
    };

    let start = Instant::now();
    let per_worker = fork_join(workers, |ctx| populate_worker(ctx, &task))?;
    let elapsed = start.elapsed();

    let per_worker = per_worker
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or(Error::Cancelled { phase: "populate" })?;
    Ok(PhaseResult::aggregate(per_worker, elapsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;
    use quickcheck::{TestResult, quickcheck};

    fn coverage(plan: &ChunkPlan, workers: usize, working_set: u64) -> Option<BitVec> {
        let mut seen = bitvec![0; working_set as usize];
        for worker in 0..workers {
            let mut last = None;
            for range in plan.chunks_for(worker) {
                for index in range {
                    // increasing order within a worker
                    if last.is_some_and(|prev| prev >= index) {
                        return None;
                    }
                    last = Some(index);
                    if seen.replace(index as usize, true) {
                        return None;
                    }
                }
            }
        }
        Some(seen)
    }

    #[test]
    fn test_even_split() {
        let plan = ChunkPlan::new(4_000, 1_000, 4);
        assert_eq!(plan.chunk_count(), 4);
        for worker in 0..4 {
            assert_eq!(plan.assigned(worker), 1_000);
            assert_eq!(
                plan.chunks_for(worker).collect::<Vec<_>>(),
                vec![(worker as u64 * 1_000)..((worker as u64 + 1) * 1_000)]
            );
        }
    }

    #[test]
    fn test_uneven_split() {
        let plan = ChunkPlan::new(2_500, 1_000, 2);
        assert_eq!(plan.chunk_count(), 3);
        assert_eq!(plan.chunks_for(0).collect::<Vec<_>>(), vec![0..1_000, 2_000..2_500]);
        assert_eq!(plan.chunks_for(1).collect::<Vec<_>>(), vec![1_000..2_000]);
        assert_eq!(plan.assigned(0) + plan.assigned(1), 2_500);
    }

    #[test]
    fn test_more_workers_than_chunks() {
        let plan = ChunkPlan::new(100, 1_000, 8);
        assert_eq!(plan.assigned(0), 100);
        assert!((1..8).all(|w| plan.assigned(w) == 0));
    }

    quickcheck! {
        fn prop_partition_covers_exactly(working_set: u32, chunk: u16, workers: u8) -> TestResult {
            let working_set = (working_set % 50_000) as u64 + 100;
            let chunk = chunk as u64 % 2_000 + 1;
            let workers = workers as usize % 32 + 1;
            let plan = ChunkPlan::new(working_set, chunk, workers);
            match coverage(&plan, workers, working_set) {
                Some(seen) => TestResult::from_bool(seen.all()),
                None => TestResult::failed(),
            }
        }
    }
}
