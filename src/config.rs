//! Benchmark configuration
//!
//! A [`BenchmarkConfig`] is built once through [`BenchmarkConfigBuilder`] and
//! never mutated afterwards. The working set is resolved here: an explicit
//! item count or a memory budget, clamped up to [`MIN_WORKING_SET`].
//! [`EngineSettings`] are derived from the finished config.

use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::error::{Error, Result};
use crate::key::{KeyEncoding, PAYLOAD_HEADER_LEN};

/// Smallest working set a run will use
pub const MIN_WORKING_SET: u64 = 100;

/// Indices per populate chunk
pub const DEFAULT_CHUNK_SIZE: u64 = 1_000;

/// Default lookups issued by each worker
pub const DEFAULT_QUERIES_PER_WORKER: u64 = 1_000_000;

/// Engine-side bytes per item beyond key and value, used for budget sizing
pub const PER_ITEM_OVERHEAD: u64 = 48;

/// Working sets above this use the coarse progress interval
pub const LARGE_WORKING_SET: u64 = 100_000_000;

/// Progress interval for ordinary runs
pub const PROGRESS_INTERVAL: u64 = 1_000_000;

/// Progress interval for large runs
pub const PROGRESS_INTERVAL_LARGE: u64 = 25_000_000;

/// Largest value the engine accepts
pub const ITEM_SIZE_MAX: usize = 1024 * 1024;

/// Slab page size shared by every profile (128 MiB)
const SLAB_PAGE_SIZE: usize = 64 << 21;

/// Memory sizing preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryProfile {
    /// About 8 GiB
    Low,
    /// About 150 GiB
    Medium,
    /// About 1.2 TiB
    Large,
    /// Small hash table that may grow to 2^32 slots
    #[default]
    Nros,
}

impl MemoryProfile {
    /// Initial hash power
    pub const fn hash_power_default(self) -> u32 {
        match self {
            MemoryProfile::Low => 16,
            MemoryProfile::Medium => 30,
            MemoryProfile::Large => 35,
            MemoryProfile::Nros => 16,
        }
    }

    /// Upper bound for hash power growth
    pub const fn hash_power_max(self) -> u32 {
        match self {
            MemoryProfile::Low => 26,
            MemoryProfile::Medium => 32,
            MemoryProfile::Large => 35,
            MemoryProfile::Nros => 32,
        }
    }

    /// Engine slab page size
    pub const fn slab_page_size(self) -> usize {
        SLAB_PAGE_SIZE
    }

    /// Engine memory budget
    pub const fn prealloc_bytes(self) -> u64 {
        match self {
            MemoryProfile::Low => 8 << 30,
            MemoryProfile::Medium => 64 << 30,
            MemoryProfile::Large => 512 << 30,
            MemoryProfile::Nros => 8 << 30,
        }
    }

    /// Bytes per element array record
    pub const fn element_size(self) -> usize {
        match self {
            MemoryProfile::Low => 2 * std::mem::size_of::<u64>(),
            MemoryProfile::Medium => 64,
            MemoryProfile::Large => 128,
            MemoryProfile::Nros => 3 * std::mem::size_of::<u64>(),
        }
    }

    /// Value payload size, never below the payload header
    pub const fn item_value_size(self) -> usize {
        let size = match self {
            MemoryProfile::Low => 128 - 65,
            MemoryProfile::Medium => 32,
            MemoryProfile::Large => 64,
            MemoryProfile::Nros => 32,
        };
        if size < PAYLOAD_HEADER_LEN {
            PAYLOAD_HEADER_LEN
        } else {
            size
        }
    }

    /// Default working set: one item per slot at the maximum hash power, over 8
    pub const fn default_item_count(self) -> u64 {
        1u64 << (self.hash_power_max() - 3)
    }
}

impl fmt::Display for MemoryProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryProfile::Low => "low",
            MemoryProfile::Medium => "medium",
            MemoryProfile::Large => "large",
            MemoryProfile::Nros => "nros",
        };
        f.write_str(name)
    }
}

impl FromStr for MemoryProfile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(MemoryProfile::Low),
            "medium" | "med" => Ok(MemoryProfile::Medium),
            "large" => Ok(MemoryProfile::Large),
            "nros" => Ok(MemoryProfile::Nros),
            other => Err(format!("unknown memory profile '{}'", other)),
        }
    }
}

/// How the working set size is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum WorkingSet {
    /// Exact item count
    Items(u64),
    /// Memory budget in bytes; the item count is derived from item footprint
    MemoryBudget(u64),
}

/// Immutable benchmark configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct BenchmarkConfig {
    profile: MemoryProfile,
    requested_working_set: u64,
    working_set_size: u64,
    memory_budget: Option<u64>,
    value_size: usize,
    element_size: usize,
    key_encoding: KeyEncoding,
    workers: usize,
    queries_per_worker: u64,
    chunk_size: u64,
    progress_interval: u64,
    verify_payload: bool,
    pin_threads: bool,
    skip_run: bool,
}

impl BenchmarkConfig {
    /// Start building a config
    pub fn builder() -> BenchmarkConfigBuilder {
        BenchmarkConfigBuilder::default()
    }

    /// Memory profile
    pub fn profile(&self) -> MemoryProfile {
        self.profile
    }

    /// Item count before clamping
    pub fn requested_working_set(&self) -> u64 {
        self.requested_working_set
    }

    /// Effective item count, at least [`MIN_WORKING_SET`]
    pub fn working_set_size(&self) -> u64 {
        self.working_set_size
    }

    /// Memory budget, if the working set was derived from one
    pub fn memory_budget(&self) -> Option<u64> {
        self.memory_budget
    }

    /// Value payload size in bytes
    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /// Key size in bytes
    pub fn key_size(&self) -> usize {
        self.key_encoding.key_len()
    }

    /// Element array record size in bytes
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Key encoding
    pub fn key_encoding(&self) -> KeyEncoding {
        self.key_encoding
    }

    /// Number of workers
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Lookups per worker
    pub fn queries_per_worker(&self) -> u64 {
        self.queries_per_worker
    }

    /// Total lookups: workers × queries per worker, which `build` keeps
    /// within `u64`
    pub fn total_queries(&self) -> u64 {
        self.workers as u64 * self.queries_per_worker
    }

    /// Indices per populate chunk
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Operations between progress lines
    pub fn progress_interval(&self) -> u64 {
        self.progress_interval
    }

    /// Whether lookups check payload identity
    pub fn verify_payload(&self) -> bool {
        self.verify_payload
    }

    /// Whether workers try to pin themselves to a CPU
    pub fn pin_threads(&self) -> bool {
        self.pin_threads
    }

    /// Only configure the engine, do not run the workload
    pub fn skip_run(&self) -> bool {
        self.skip_run
    }
}

/// Builder for [`BenchmarkConfig`]
#[derive(Debug, Clone, Default)]
pub struct BenchmarkConfigBuilder {
    profile: MemoryProfile,
    working_set: Option<WorkingSet>,
    value_size: Option<usize>,
    element_size: Option<usize>,
    key_encoding: KeyEncoding,
    workers: Option<usize>,
    queries_per_worker: Option<u64>,
    chunk_size: Option<u64>,
    progress_interval: Option<u64>,
    no_verify: bool,
    no_pin: bool,
    skip_run: bool,
}

impl BenchmarkConfigBuilder {
    /// Memory profile supplying defaults for sizes
    pub fn profile(mut self, profile: MemoryProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Exact working set item count
    pub fn items(mut self, items: u64) -> Self {
        self.working_set = Some(WorkingSet::Items(items));
        self
    }

    /// Derive the working set from a memory budget in bytes
    pub fn memory_budget(mut self, bytes: u64) -> Self {
        self.working_set = Some(WorkingSet::MemoryBudget(bytes));
        self
    }

    /// Value payload size in bytes
    pub fn value_size(mut self, bytes: usize) -> Self {
        self.value_size = Some(bytes);
        self
    }

    /// Element array record size in bytes
    pub fn element_size(mut self, bytes: usize) -> Self {
        self.element_size = Some(bytes);
        self
    }

    /// Key encoding
    pub fn key_encoding(mut self, encoding: KeyEncoding) -> Self {
        self.key_encoding = encoding;
        self
    }

    /// Number of workers
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Lookups per worker
    pub fn queries_per_worker(mut self, queries: u64) -> Self {
        self.queries_per_worker = Some(queries);
        self
    }

    /// Indices per populate chunk
    pub fn chunk_size(mut self, chunk: u64) -> Self {
        self.chunk_size = Some(chunk);
        self
    }

    /// Operations between progress lines
    pub fn progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    /// Toggle payload identity checks on lookup
    pub fn verify_payload(mut self, verify: bool) -> Self {
        self.no_verify = !verify;
        self
    }

    /// Toggle best-effort CPU pinning
    pub fn pin_threads(mut self, pin: bool) -> Self {
        self.no_pin = !pin;
        self
    }

    /// Configure the engine only
    pub fn skip_run(mut self, skip: bool) -> Self {
        self.skip_run = skip;
        self
    }

    /// Validate and freeze the configuration
    pub fn build(self) -> Result<BenchmarkConfig> {
        let profile = self.profile;
        let value_size = self.value_size.unwrap_or_else(|| profile.item_value_size());
        if value_size < PAYLOAD_HEADER_LEN {
            return Err(Error::Config(format!(
                "value size {} is below the {}-byte payload header",
                value_size, PAYLOAD_HEADER_LEN
            )));
        }
        if value_size > ITEM_SIZE_MAX {
            return Err(Error::Config(format!(
                "value size {} exceeds the item size limit of {}",
                value_size, ITEM_SIZE_MAX
            )));
        }

        let element_size = self.element_size.unwrap_or_else(|| profile.element_size());
        if element_size < 8 || element_size % 8 != 0 {
            return Err(Error::Config(format!(
                "element size {} must be a non-zero multiple of 8",
                element_size
            )));
        }

        let workers = match self.workers {
            Some(0) => return Err(Error::Config("at least one worker is required".into())),
            Some(n) => n,
            None => default_workers(),
        };

        let queries_per_worker = self.queries_per_worker.unwrap_or(DEFAULT_QUERIES_PER_WORKER);
        if (workers as u64).checked_mul(queries_per_worker).is_none() {
            return Err(Error::Config(format!(
                "{} workers × {} queries per worker overflows the operation index",
                workers, queries_per_worker
            )));
        }

        let chunk_size = self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 {
            return Err(Error::Config("chunk size must be positive".into()));
        }

        let key_size = self.key_encoding.key_len();
        let working_set = self
            .working_set
            .unwrap_or(WorkingSet::Items(profile.default_item_count()));
        let (requested_working_set, memory_budget) = match working_set {
            WorkingSet::Items(items) => (items, None),
            WorkingSet::MemoryBudget(bytes) => {
                (items_for_budget(bytes, value_size, key_size), Some(bytes))
            }
        };
        let working_set_size = clamp_working_set(requested_working_set, MIN_WORKING_SET);

        let progress_interval = match self.progress_interval {
            Some(0) => return Err(Error::Config("progress interval must be positive".into())),
            Some(n) => n,
            None => default_progress_interval(working_set_size),
        };

        Ok(BenchmarkConfig {
            profile,
            requested_working_set,
            working_set_size,
            memory_budget,
            value_size,
            element_size,
            key_encoding: self.key_encoding,
            workers,
            queries_per_worker,
            chunk_size,
            progress_interval,
            verify_payload: !self.no_verify,
            pin_threads: !self.no_pin,
            skip_run: self.skip_run,
        })
    }
}

/// Raise `requested` to `floor`, warning when that happens
pub fn clamp_working_set(requested: u64, floor: u64) -> u64 {
    if requested < floor {
        warn!(
            requested,
            floor, "working set below minimum, clamping to {} items", floor
        );
        floor
    } else {
        requested
    }
}

/// Items that fit in `budget` bytes
pub fn items_for_budget(budget: u64, value_size: usize, key_size: usize) -> u64 {
    budget / (value_size as u64 + key_size as u64 + PER_ITEM_OVERHEAD)
}

/// Progress cadence for a working set of `working_set` items
pub fn default_progress_interval(working_set: u64) -> u64 {
    if working_set > LARGE_WORKING_SET {
        PROGRESS_INTERVAL_LARGE
    } else {
        PROGRESS_INTERVAL
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Settings handed to the engine in its one-time configuration step
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineSettings {
    /// Memory budget in bytes
    pub max_bytes: u64,
    /// Compare-and-swap ids on stored items
    pub use_cas: bool,
    /// Background eviction/maintenance thread
    pub maintainer_thread: bool,
    /// Initial hash table size exponent
    pub hash_power: u32,
    /// Storage page size in bytes
    pub slab_page_size: usize,
    /// Page reassignment between size classes
    pub slab_reassign: bool,
    /// Idle connection timeout
    pub idle_timeout: bool,
    /// Largest item accepted
    pub item_size_max: usize,
    /// Engine-owned worker threads; the harness brings its own
    pub engine_threads: usize,
}

impl EngineSettings {
    /// Derive settings for `config`
    pub fn for_config(config: &BenchmarkConfig) -> Self {
        let profile = config.profile();
        Self {
            max_bytes: config.memory_budget().unwrap_or(profile.prealloc_bytes()),
            use_cas: true,
            maintainer_thread: false,
            hash_power: hash_power_for(
                config.working_set_size(),
                profile.hash_power_default(),
                profile.hash_power_max(),
            ),
            slab_page_size: profile.slab_page_size(),
            slab_reassign: false,
            idle_timeout: false,
            item_size_max: ITEM_SIZE_MAX,
            engine_threads: 1,
        }
    }
}

/// Grow from `initial` until `2^power >= items`, capped at `max`
pub fn hash_power_for(items: u64, initial: u32, max: u32) -> u32 {
    let mut power = initial.min(max);
    while power < max && power < 63 && (1u64 << power) < items {
        power += 1;
    }
    power
}
