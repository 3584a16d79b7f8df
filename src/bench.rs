//! Benchmark orchestrator
//!
//! Sequences a run: configure the engine, build the worker arena and element
//! array, populate, query, and hand back a [`BenchmarkReport`]. Nothing here
//! terminates the process; that is left to the caller.

use chrono::Utc;
use tracing::{info, info_span, warn};

use crate::cancel::CancelToken;
use crate::config::{BenchmarkConfig, EngineSettings};
use crate::elements::ElementArray;
use crate::engine::KvEngine;
use crate::error::{Error, Result};
use crate::populate::run_populate;
use crate::query::run_query;
use crate::report::BenchmarkReport;
use crate::worker::WorkerArena;

/// What [`execute`] did
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Only the configuration step ran
    Skipped(EngineSettings),
    /// Both phases ran
    Completed(Box<BenchmarkReport>),
}

/// One-time engine configuration sized for `config`'s working set.
pub fn configure_engine<E: KvEngine>(config: &BenchmarkConfig, engine: &mut E) -> EngineSettings {
    let settings = EngineSettings::for_config(config);
    info!(
        max_bytes = settings.max_bytes,
        hash_power = settings.hash_power,
        slab_page_size = settings.slab_page_size,
        use_cas = settings.use_cas,
        "configuring engine"
    );
    engine.configure(&settings);
    settings
}

/// Configure `engine`, then run the workload unless the config asks to skip it.
pub fn execute<E: KvEngine>(config: BenchmarkConfig, engine: &mut E) -> Result<RunOutcome> {
    let settings = configure_engine(&config, engine);
    if config.skip_run() {
        info!("skip-run requested, engine configured only");
        return Ok(RunOutcome::Skipped(settings));
    }
    let report = Benchmark::new(config, engine).run()?;
    Ok(RunOutcome::Completed(Box::new(report)))
}

/// A populate-then-query run against an already configured engine
pub struct Benchmark<'e, E> {
    config: BenchmarkConfig,
    engine: &'e E,
    cancel: CancelToken,
}

impl<'e, E: KvEngine> Benchmark<'e, E> {
    /// Benchmark `engine` with `config`
    pub fn new(config: BenchmarkConfig, engine: &'e E) -> Self {
        Self {
            config,
            engine,
            cancel: CancelToken::new(),
        }
    }

    /// Use `cancel` instead of a private token
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run at the next chunk boundary
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Configuration in use
    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// Run both phases and report.
    ///
    /// Fails only on structural problems: sessions that cannot be opened, an
    /// element array that cannot be mapped, a panicking worker, or
    /// cancellation. Per-operation failures end up in the counters.
    pub fn run(&self) -> Result<BenchmarkReport> {
        let config = &self.config;
        let started_at = Utc::now();
        let working_set = config.working_set_size();

        info!("=====================================");
        info!("INTERNAL BENCHMARK STARTING");
        info!("=====================================");

        let mut arena = WorkerArena::build(self.engine, config.workers(), config.pin_threads())?;

        let element_bytes = ElementArray::bytes_for(working_set, config.element_size())
            .ok_or_else(|| Error::Config("element array size overflows usize".into()))?;
        info!(
            element_size = config.element_size(),
            "element size: {} bytes",
            config.element_size()
        );
        info!(working_set, "number of keys: {}", working_set);
        info!(
            "allocating {} bytes ({} GB) for the element array",
            element_bytes,
            element_bytes >> 30
        );
        let elements = ElementArray::new(working_set, config.element_size())?;

        let populate = {
            let _span = info_span!("populate", workers = config.workers()).entered();
            info!("populating 0 / {} key-value pairs", working_set);
            let result = run_populate(
                arena.as_mut_slice(),
                self.engine,
                config,
                &elements,
                &self.cancel,
            )?;
            info!(
                elapsed_ms = result.elapsed.as_millis() as u64,
                "populated {} / {} key-value pairs",
                result.totals.stored,
                working_set
            );
            if result.totals.alloc_failed > 0 {
                warn!(
                    alloc_failed = result.totals.alloc_failed,
                    "engine ran out of capacity during populate"
                );
            }
            result
        };

        let query = {
            let _span = info_span!("query", workers = config.workers()).entered();
            let result =
                run_query(arena.as_mut_slice(), self.engine, config, &elements, &self.cancel)?;
            info!(
                elapsed_ms = result.elapsed.as_millis() as u64,
                "benchmark executed {} / {} queries at {}",
                result.totals.total(),
                config.total_queries(),
                result.throughput
            );
            result
        };

        drop(arena);

        Ok(BenchmarkReport {
            started_at,
            workers: config.workers(),
            requested_working_set: config.requested_working_set(),
            working_set,
            element_size: config.element_size(),
            element_array_bytes: elements.size_bytes(),
            value_size: config.value_size(),
            key_size: config.key_size(),
            populate,
            requested_queries: config.total_queries(),
            query,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryEngine;

    fn small_config() -> BenchmarkConfig {
        BenchmarkConfig::builder()
            .items(1_000)
            .workers(4)
            .queries_per_worker(1_000)
            .pin_threads(false)
            .build()
            .unwrap()
    }

    #[test]
    fn test_skip_run_only_configures() {
        let config = BenchmarkConfig::builder()
            .items(1_000)
            .workers(2)
            .skip_run(true)
            .build()
            .unwrap();
        let mut engine = InMemoryEngine::new();
        let outcome = execute(config, &mut engine).unwrap();
        assert!(matches!(outcome, RunOutcome::Skipped(_)));
        assert!(engine.settings().is_some());
        assert!(engine.is_empty());
    }

    #[test]
    fn test_full_run() {
        let mut engine = InMemoryEngine::new();
        let outcome = execute(small_config(), &mut engine).unwrap();
        let RunOutcome::Completed(report) = outcome else {
            panic!("run was skipped");
        };
        assert_eq!(report.populate.totals.stored, 1_000);
        assert_eq!(report.requested_queries, 4_000);
        assert_eq!(report.executed_queries(), 4_000);
        assert_eq!(report.query.totals.found, 4_000);
        assert_eq!(report.query.per_worker.len(), 4);
        assert_eq!(engine.len(), 1_000);
    }

    #[test]
    fn test_cancelled_before_start() {
        let mut engine = InMemoryEngine::new();
        let config = small_config();
        configure_engine(&config, &mut engine);
        let bench = Benchmark::new(config, &engine);
        bench.cancel_token().cancel();
        assert!(matches!(bench.run(), Err(Error::Cancelled { phase: "populate" })));
    }
}
