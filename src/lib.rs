//! kvload: populate-then-query throughput harness
//!
//! This crate drives an in-process key-value engine through two phases: a bulk
//! populate of a fixed working set, followed by a randomized lookup phase. Every
//! worker owns its own engine session, generator, and counters, so the only
//! shared resource during a phase is the engine under test.

#![warn(missing_docs)]

/// CPU pinning capability
pub mod affinity;
/// Orchestrator sequencing configuration, populate, query, and reporting
pub mod bench;
/// Cooperative cancellation between chunks
pub mod cancel;
/// Benchmark configuration and engine settings derivation
pub mod config;
/// Backing element array used for payload identity checks
pub mod elements;
/// Engine capability seam and the in-process reference engine
pub mod engine;
/// Key and payload encoding
pub mod key;
/// Per-worker key-index generator
pub mod keygen;
/// Fork-join worker pool
pub mod pool;
/// Populate phase controller
pub mod populate;
/// Query phase controller
pub mod query;
/// Counters, phase results, and the final report
pub mod report;
/// Worker contexts and the arena that owns them
pub mod worker;


// Re-exports
pub use bench::{Benchmark, RunOutcome, configure_engine, execute};
pub use cancel::CancelToken;
pub use config::{
    BenchmarkConfig, BenchmarkConfigBuilder, EngineSettings, MemoryProfile, WorkingSet,
};
pub use engine::{GetMode, InMemoryEngine, KvEngine, StoreMode, StoreOutcome};
pub use error::{Error, Result};
pub use key::KeyEncoding;
pub use keygen::KeyIndexGenerator;
pub use report::{BenchmarkReport, PhaseResult, PopulateCounters, QueryCounters, Throughput};
pub use worker::{WorkerArena, WorkerContext};

/// Error types for harness setup and orchestration
pub mod error {
    use std::io;

    /// Structural failures that abort a run.
    ///
    /// Per-operation engine outcomes never surface here; they are tallied in
    /// the phase counters instead.
    #[derive(Debug, thiserror::Error)]
    pub enum Error {
        /// The benchmark configuration is invalid
        #[error("Configuration error: {0}")]
        Config(String),
        /// The backing element array could not be allocated
        #[error("Failed to allocate element array of {requested} bytes: {source}")]
        ElementArray {
            /// Bytes requested
            requested: usize,
            /// Underlying mapping error
            #[source]
            source: io::Error,
        },
        /// The engine refused to open a session for a worker
        #[error("Failed to open engine session for worker {worker}: {reason}")]
        Session {
            /// Worker index
            worker: usize,
            /// Engine-provided reason
            reason: String,
        },
        /// A worker thread panicked before reaching the phase barrier
        #[error("Worker {worker} panicked")]
        WorkerPanicked {
            /// Worker index
            worker: usize,
        },
        /// The run was cancelled at a chunk boundary
        #[error("Run cancelled during {phase} phase")]
        Cancelled {
            /// Phase name
            phase: &'static str,
        },
        /// An I/O error occurred
        #[error("I/O error: {0}")]
        Io(#[from] io::Error),
    }

    /// Result alias used across the crate
    pub type Result<T> = std::result::Result<T, Error>;
}
