//! Query phase
//!
//! The global operation range `[0, workers * queries_per_worker)` is split
//! into one contiguous block per worker. For operation `op` a worker draws the
//! probed index from its own generator, looks the key up without touching
//! recency metadata, and classifies the lookup as found or not found.

use std::ops::Range;
use std::time::Instant;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::BenchmarkConfig;
use crate::elements::ElementArray;
use crate::engine::{GetMode, KvEngine};
use crate::error::{Error, Result};
use crate::key::read_payload;
use crate::pool::fork_join;
use crate::report::{PhaseResult, QueryCounters};
use crate::worker::WorkerContext;

/// Operation indices issued by `worker`
pub fn query_range_for_worker(worker: usize, queries_per_worker: u64) -> Range<u64> {
    let start = worker as u64 * queries_per_worker;
    start..start + queries_per_worker
}

/// Shared, read-only inputs of the query phase
pub struct QueryTask<'a, E> {
    /// Engine under test
    pub engine: &'a E,
    /// Run configuration
    pub config: &'a BenchmarkConfig,
    /// Identity records written during populate
    pub elements: &'a ElementArray,
    /// Checked between blocks of operations
    pub cancel: &'a CancelToken,
}

/// Whether `payload` belongs to `index`: the embedded index must match and the
/// element slot it names must hold `index`.
pub fn payload_matches(payload: &[u8], index: u64, elements: &ElementArray) -> bool {
    match read_payload(payload) {
        Some(header) => header.index == index && elements.key_at(header.slot) == Some(index),
        None => false,
    }
}

/// Issue every lookup assigned to `ctx`.
///
/// Returns `None` if the run was cancelled at a block boundary.
pub fn query_worker<E: KvEngine>(
    ctx: &mut WorkerContext<E::Session>,
    task: &QueryTask<'_, E>,
) -> Option<QueryCounters> {
    let worker = ctx.index();
    let working_set = task.config.working_set_size();
    let encoding = task.config.key_encoding();
    let verify = task.config.verify_payload();
    let interval = task.config.progress_interval();
    let block = task.config.chunk_size();
    let range = query_range_for_worker(worker, task.config.queries_per_worker());
    let first = range.start;

    let (session, generator) = ctx.parts_mut();
    let mut counters = QueryCounters::default();

    for op in range {
        let done = op - first;
        if done % block == 0 && task.cancel.is_cancelled() {
            debug!(worker, done, "query cancelled");
            return None;
        }

        let index = generator.index_for(op, working_set);
        let key = encoding.encode(index);
        match task.engine.get(&key, GetMode::NoUpdate, session) {
            Some(handle) => {
                if !verify || payload_matches(task.engine.data(&handle), index, task.elements) {
                    counters.found += 1;
                } else {
                    counters.not_found += 1;
                    counters.mismatched += 1;
                }
            }
            None => counters.not_found += 1,
        }

        if (done + 1) % interval == 0 {
            info!(worker, done = done + 1, "query progress");
        }
    }

    Some(counters)
}

/// Run the query phase across `workers` and merge the results.
pub fn run_query<E: KvEngine>(
    workers: &mut [WorkerContext<E::Session>],
    engine: &E,
    config: &BenchmarkConfig,
    elements: &ElementArray,
    cancel: &CancelToken,
) -> Result<PhaseResult<QueryCounters>> {
    let task = QueryTask {
        engine,
        config,
        elements,
        cancel,
    };

    let start = Instant::now();
    let per_worker = fork_join(workers, |ctx| query_worker(ctx, &task))?;
    let elapsed = start.elapsed();

    let per_worker = per_worker
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or(Error::Cancelled { phase: "query" })?;
    Ok(PhaseResult::aggregate(per_worker, elapsed))
}
