//! Result aggregation
//!
//! Workers fill their own counters during a phase. Only after the phase
//! barrier are they summed into a [`PhaseResult`], together with the elapsed
//! time and the derived throughput.

use std::fmt;
use std::ops::AddAssign;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::engine::StoreOutcome;

/// Per-worker tallies that can be merged after a barrier
pub trait Counters: Default + Copy + AddAssign {
    /// Operations this tally accounts for
    fn operations(&self) -> u64;
}

/// Populate phase tallies for one worker
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct PopulateCounters {
    /// Items stored
    pub stored: u64,
    /// Store reported a conflicting item
    pub exists: u64,
    /// Store precondition failed
    pub not_stored: u64,
    /// Store failed for any other reason
    pub errors: u64,
    /// Indices skipped because allocation failed
    pub alloc_failed: u64,
}

impl PopulateCounters {
    /// Count one store outcome
    #[inline]
    pub fn record(&mut self, outcome: StoreOutcome) {
        match outcome {
            StoreOutcome::Stored => self.stored += 1,
            StoreOutcome::Exists => self.exists += 1,
            StoreOutcome::NotStored => self.not_stored += 1,
            StoreOutcome::NotFound | StoreOutcome::Error => self.errors += 1,
        }
    }

    /// Indices whose allocation succeeded
    pub fn allocated(&self) -> u64 {
        self.stored + self.exists + self.not_stored + self.errors
    }

    /// Indices attempted, including allocation failures
    pub fn attempted(&self) -> u64 {
        self.allocated() + self.alloc_failed
    }
}

impl AddAssign for PopulateCounters {
    fn add_assign(&mut self, other: Self) {
        self.stored += other.stored;
        self.exists += other.exists;
        self.not_stored += other.not_stored;
        self.errors += other.errors;
        self.alloc_failed += other.alloc_failed;
    }
}

impl Counters for PopulateCounters {
    fn operations(&self) -> u64 {
        self.allocated()
    }
}

/// Query phase tallies for one worker
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct QueryCounters {
    /// Lookups that returned the expected item
    pub found: u64,
    /// Lookups that missed, including identity mismatches
    pub not_found: u64,
    /// Subset of `not_found` where an item came back with the wrong identity
    pub mismatched: u64,
}

impl QueryCounters {
    /// Lookups issued
    pub fn total(&self) -> u64 {
        self.found + self.not_found
    }
}

impl AddAssign for QueryCounters {
    fn add_assign(&mut self, other: Self) {
        self.found += other.found;
        self.not_found += other.not_found;
        self.mismatched += other.mismatched;
    }
}

impl Counters for QueryCounters {
    fn operations(&self) -> u64 {
        self.total()
    }
}

/// Operations per second, or undefined when no time elapsed
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum Throughput {
    /// Operations per second
    Rate(f64),
    /// Elapsed time was zero
    Undefined,
}

impl Throughput {
    /// `operations / elapsed`, guarding the zero-duration case
    pub fn from_ops(operations: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            Throughput::Rate(operations as f64 / secs)
        } else {
            Throughput::Undefined
        }
    }

    /// Rate, if defined
    pub fn rate(&self) -> Option<f64> {
        match self {
            Throughput::Rate(rate) => Some(*rate),
            Throughput::Undefined => None,
        }
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Throughput::Rate(rate) => write!(f, "{:.0} ops/sec", rate),
            Throughput::Undefined => write!(f, "undefined (zero elapsed time)"),
        }
    }
}

/// Merged outcome of one phase
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct PhaseResult<C> {
    /// Sum over all workers
    pub totals: C,
    /// Each worker's own tally, in worker order
    pub per_worker: Vec<C>,
    /// Wall-clock time from phase start to barrier
    pub elapsed: Duration,
    /// `totals.operations() / elapsed`
    pub throughput: Throughput,
}

impl<C: Counters> PhaseResult<C> {
    /// Merge per-worker tallies collected after the barrier
    pub fn aggregate(per_worker: Vec<C>, elapsed: Duration) -> Self {
        let mut totals = C::default();
        for counters in &per_worker {
            totals += *counters;
        }
        Self {
            throughput: Throughput::from_ops(totals.operations(), elapsed),
            totals,
            per_worker,
            elapsed,
        }
    }
}

/// Everything a completed run reports
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct BenchmarkReport {
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Number of workers
    pub workers: usize,
    /// Working set before clamping
    pub requested_working_set: u64,
    /// Working set used
    pub working_set: u64,
    /// Element array record size
    pub element_size: usize,
    /// Element array size in bytes
    pub element_array_bytes: usize,
    /// Value payload size
    pub value_size: usize,
    /// Key size
    pub key_size: usize,
    /// Populate phase
    pub populate: PhaseResult<PopulateCounters>,
    /// Lookups requested: workers × queries per worker
    pub requested_queries: u64,
    /// Query phase
    pub query: PhaseResult<QueryCounters>,
}

impl BenchmarkReport {
    /// Lookups actually executed
    pub fn executed_queries(&self) -> u64 {
        self.query.totals.total()
    }
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=====================================";
        let populate = &self.populate.totals;
        let query = &self.query.totals;

        writeln!(f, "{}", rule)?;
        writeln!(f, "BENCHMARK REPORT ({})", self.started_at.to_rfc3339())?;
        writeln!(f, "{}", rule)?;
        writeln!(f, "workers: {}", self.workers)?;
        writeln!(f, "element size: {} bytes", self.element_size)?;
        writeln!(f, "item size: {} byte key + {} byte value", self.key_size, self.value_size)?;
        if self.requested_working_set != self.working_set {
            writeln!(
                f,
                "number of keys: {} (clamped from {})",
                self.working_set, self.requested_working_set
            )?;
        } else {
            writeln!(f, "number of keys: {}", self.working_set)?;
        }
        writeln!(
            f,
            "element array: {} bytes ({} GB)",
            self.element_array_bytes,
            self.element_array_bytes >> 30
        )?;
        writeln!(f, "{}", rule)?;
        writeln!(f, "populated {} / {} key-value pairs", populate.stored, self.working_set)?;
        writeln!(
            f,
            "  stored: {}, exists: {}, not stored: {}, errors: {}, allocation failures: {}",
            populate.stored,
            populate.exists,
            populate.not_stored,
            populate.errors,
            populate.alloc_failed
        )?;
        writeln!(f, "  populate took {:.3} seconds", self.populate.elapsed.as_secs_f64())?;
        writeln!(f, "  populate throughput: {}", self.populate.throughput)?;
        writeln!(f, "{}", rule)?;
        writeln!(f, "benchmark took {:.3} seconds", self.query.elapsed.as_secs_f64())?;
        writeln!(f, "benchmark throughput: {}", self.query.throughput)?;
        writeln!(
            f,
            "benchmark executed {} / {} queries",
            self.executed_queries(),
            self.requested_queries
        )?;
        writeln!(
            f,
            "  found: {}, not found: {} ({} identity mismatches)",
            query.found, query.not_found, query.mismatched
        )?;
        write!(f, "{}", rule)
    }
}
