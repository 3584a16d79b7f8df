//! Engine capability seam
//!
//! The harness drives any engine that implements [`KvEngine`]: a one-time
//! configuration step, per-worker sessions, and the allocate / store / get /
//! data operations. [`InMemoryEngine`] is a sharded in-process implementation
//! used by the CLI and the tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::RandomState;
use parking_lot::RwLock;
use tracing::debug;

use crate::config::{EngineSettings, ITEM_SIZE_MAX, PER_ITEM_OVERHEAD};
use crate::key::KeyBuf;

/// Longest key the reference engine accepts
pub const KEY_MAX_LENGTH: usize = 250;

/// Number of shards in the reference engine
const SHARD_COUNT: usize = 64;

/// Upper bound on slots reserved up front, regardless of hash power
const MAX_PRESIZE_SLOTS: usize = 1 << 20;

/// How a store treats an existing entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Create or overwrite
    Set,
    /// Create only
    Add,
    /// Overwrite only
    Replace,
}

/// Result of a store call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The item is now visible
    Stored,
    /// A conflicting item already exists
    Exists,
    /// The mode's precondition did not hold
    NotStored,
    /// The item was not found where one was required
    NotFound,
    /// The engine failed to store the item
    Error,
}

/// Whether a lookup updates recency metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMode {
    /// Bump the item's access metadata
    Touch,
    /// Leave access order untouched
    NoUpdate,
}

/// The operations the harness needs from a key-value engine.
///
/// Sessions are opened once per worker and only ever used by that worker.
pub trait KvEngine: Sync {
    /// Per-worker connection/context
    type Session: Send;
    /// An allocated item not yet stored
    type Pending;
    /// A handle to a stored item
    type Handle;

    /// One-time configuration before any session is opened
    fn configure(&mut self, settings: &EngineSettings);

    /// Open the session for `worker`
    fn open_session(&self, worker: usize) -> Result<Self::Session, String>;

    /// Allocate an item, or `None` when the engine is out of capacity
    fn allocate(&self, key: &[u8], flags: u32, expiry: u32, value_size: usize)
    -> Option<Self::Pending>;

    /// Writable payload of an allocated item
    fn payload_mut<'a>(&self, pending: &'a mut Self::Pending) -> &'a mut [u8];

    /// Make an allocated item visible
    fn store(
        &self,
        pending: Self::Pending,
        mode: StoreMode,
        session: &mut Self::Session,
    ) -> StoreOutcome;

    /// Look up `key`
    fn get(&self, key: &[u8], mode: GetMode, session: &mut Self::Session)
    -> Option<Self::Handle>;

    /// Payload of a stored item
    fn data<'a>(&self, handle: &'a Self::Handle) -> &'a [u8];
}

/// Item allocated by [`InMemoryEngine`]
#[derive(Debug)]
pub struct PendingItem {
    key: KeyBuf,
    flags: u32,
    expiry: u32,
    value: Vec<u8>,
    // bytes reserved for a new entry; None when the key was already live
    charge: Option<u64>,
}

/// Item stored in [`InMemoryEngine`]
#[derive(Debug)]
pub struct StoredItem {
    /// Key as stored
    pub key: KeyBuf,
    /// Client flags
    pub flags: u32,
    /// Expiry time, 0 for none
    pub expiry: u32,
    /// Compare-and-swap id, 0 when CAS is disabled
    pub cas: u64,
    /// Value data
    pub value: Vec<u8>,
    touched: AtomicU64,
}

impl StoredItem {
    /// Number of recency-updating lookups that hit this item
    pub fn touches(&self) -> u64 {
        self.touched.load(Ordering::Relaxed)
    }
}

/// Session for [`InMemoryEngine`]
#[derive(Debug)]
pub struct EngineSession {
    worker: usize,
    next_cas: u64,
    stores: u64,
    gets: u64,
}

impl EngineSession {
    /// Worker that owns this session
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Store calls issued through this session
    pub fn stores(&self) -> u64 {
        self.stores
    }

    /// Get calls issued through this session
    pub fn gets(&self) -> u64 {
        self.gets
    }

    fn next_cas(&mut self) -> u64 {
        self.next_cas += 1;
        // high 16 bits name the worker so CAS ids never collide across sessions
        ((self.worker as u64 & 0xFFFF) << 48) | (self.next_cas & ((1 << 48) - 1))
    }
}

type Shard = RwLock<HashMap<KeyBuf, Arc<StoredItem>, RandomState>>;

/// Sharded in-process reference engine.
///
/// Capacity is counted in items and, once configured, in bytes against
/// [`EngineSettings::max_bytes`]. A new key that would exceed either limit
/// fails to allocate; overwriting a live key reserves nothing.
pub struct InMemoryEngine {
    shards: Vec<Shard>,
    hasher: RandomState,
    capacity: Option<u64>,
    reserved: AtomicU64,
    max_bytes: Option<u64>,
    used_bytes: AtomicU64,
    settings: Option<EngineSettings>,
}

impl InMemoryEngine {
    /// Unbounded engine
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| RwLock::new(HashMap::with_hasher(RandomState::new())))
                .collect(),
            hasher: RandomState::with_seeds(
                0x243F_6A88_85A3_08D3,
                0x1319_8A2E_0370_7344,
                0xA409_3822_299F_31D0,
                0x082E_FA98_EC4E_6C89,
            ),
            capacity: None,
            reserved: AtomicU64::new(0),
            max_bytes: None,
            used_bytes: AtomicU64::new(0),
            settings: None,
        }
    }

    /// Engine that holds at most `items` items
    pub fn with_capacity(items: u64) -> Self {
        Self {
            capacity: Some(items),
            ..Self::new()
        }
    }

    /// Settings applied by [`KvEngine::configure`], if any
    pub fn settings(&self) -> Option<&EngineSettings> {
        self.settings.as_ref()
    }

    /// Number of stored items
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// Bytes charged to live and allocated items
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored item for `key`, without touching it
    pub fn peek(&self, key: &[u8]) -> Option<Arc<StoredItem>> {
        self.shard_for(key).read().get(key).cloned()
    }

    fn shard_for(&self, key: &[u8]) -> &Shard {
        let hash = self.hasher.hash_one(key);
        &self.shards[(hash as usize) % self.shards.len()]
    }

    fn item_size_max(&self) -> usize {
        self.settings
            .as_ref()
            .map(|s| s.item_size_max)
            .unwrap_or(ITEM_SIZE_MAX)
    }

    fn use_cas(&self) -> bool {
        self.settings.as_ref().map(|s| s.use_cas).unwrap_or(true)
    }

    fn reserve(&self, bytes: u64) -> bool {
        if !take(&self.reserved, self.capacity, 1) {
            return false;
        }
        if !take(&self.used_bytes, self.max_bytes, bytes) {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    fn release(&self, charge: Option<u64>) {
        if let Some(bytes) = charge {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
            self.used_bytes.fetch_sub(bytes, Ordering::AcqRel);
        }
    }
}

/// Footprint charged for one item
fn item_charge(key_len: usize, value_size: usize) -> u64 {
    key_len as u64 + value_size as u64 + PER_ITEM_OVERHEAD
}

/// Add `amount` to `counter` unless that would pass `limit`
fn take(counter: &AtomicU64, limit: Option<u64>, amount: u64) -> bool {
    let Some(limit) = limit else {
        counter.fetch_add(amount, Ordering::AcqRel);
        return true;
    };
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            current.checked_add(amount).filter(|next| *next <= limit)
        })
        .is_ok()
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl KvEngine for InMemoryEngine {
    type Session = EngineSession;
    type Pending = PendingItem;
    type Handle = Arc<StoredItem>;

    fn configure(&mut self, settings: &EngineSettings) {
        let slots = 1usize
            .checked_shl(settings.hash_power)
            .unwrap_or(usize::MAX)
            .min(MAX_PRESIZE_SLOTS);
        let per_shard = slots / self.shards.len();
        for shard in &self.shards {
            shard.write().reserve(per_shard);
        }
        debug!(
            hash_power = settings.hash_power,
            per_shard, "reference engine configured"
        );
        self.max_bytes = Some(settings.max_bytes);
        self.settings = Some(settings.clone());
    }

    fn open_session(&self, worker: usize) -> Result<Self::Session, String> {
        Ok(EngineSession {
            worker,
            next_cas: 0,
            stores: 0,
            gets: 0,
        })
    }

    fn allocate(
        &self,
        key: &[u8],
        flags: u32,
        expiry: u32,
        value_size: usize,
    ) -> Option<Self::Pending> {
        if key.is_empty() || key.len() > KEY_MAX_LENGTH || value_size > self.item_size_max() {
            return None;
        }
        let charge = if self.shard_for(key).read().contains_key(key) {
            None
        } else {
            let bytes = item_charge(key.len(), value_size);
            if !self.reserve(bytes) {
                return None;
            }
            Some(bytes)
        };
        Some(PendingItem {
            key: KeyBuf::from_slice(key),
            flags,
            expiry,
            value: vec![0; value_size],
            charge,
        })
    }

    fn payload_mut<'a>(&self, pending: &'a mut Self::Pending) -> &'a mut [u8] {
        &mut pending.value
    }

    fn store(
        &self,
        pending: Self::Pending,
        mode: StoreMode,
        session: &mut Self::Session,
    ) -> StoreOutcome {
        session.stores += 1;
        if pending.value.len() > self.item_size_max() {
            self.release(pending.charge);
            return StoreOutcome::Error;
        }
        let cas = if self.use_cas() { session.next_cas() } else { 0 };

        let mut shard = self.shard_for(&pending.key).write();
        let exists = shard.contains_key(&pending.key);
        match (mode, exists) {
            (StoreMode::Add, true) | (StoreMode::Replace, false) => {
                drop(shard);
                self.release(pending.charge);
                StoreOutcome::NotStored
            }
            _ => {
                let charge = pending.charge;
                let bytes = item_charge(pending.key.len(), pending.value.len());
                let item = Arc::new(StoredItem {
                    key: pending.key.clone(),
                    flags: pending.flags,
                    expiry: pending.expiry,
                    cas,
                    value: pending.value,
                    touched: AtomicU64::new(0),
                });
                let replaced = shard.insert(pending.key, item).is_some();
                drop(shard);
                match (replaced, charge) {
                    // a concurrent allocation already created the entry
                    (true, Some(_)) => self.release(charge),
                    // the entry vanished after allocation
                    (false, None) => {
                        self.reserved.fetch_add(1, Ordering::AcqRel);
                        self.used_bytes.fetch_add(bytes, Ordering::AcqRel);
                    }
                    _ => {}
                }
                StoreOutcome::Stored
            }
        }
    }

    fn get(&self, key: &[u8], mode: GetMode, session: &mut Self::Session) -> Option<Self::Handle> {
        session.gets += 1;
        let item = self.shard_for(key).read().get(key).cloned()?;
        if mode == GetMode::Touch {
            item.touched.fetch_add(1, Ordering::Relaxed);
        }
        Some(item)
    }

    fn data<'a>(&self, handle: &'a Self::Handle) -> &'a [u8] {
        &handle.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::{SeedableRng, rngs::StdRng};

    fn put(
        engine: &InMemoryEngine,
        session: &mut EngineSession,
        key: &[u8],
        value: &[u8],
        mode: StoreMode,
    ) -> StoreOutcome {
        let mut pending = engine
            .allocate(key, 0, 0, value.len())
            .expect("allocation failed");
        engine.payload_mut(&mut pending).copy_from_slice(value);
        engine.store(pending, mode, session)
    }

    #[test]
    fn test_set_and_get() {
        let engine = InMemoryEngine::new();
        let mut session = engine.open_session(0).unwrap();

        assert_eq!(
            put(&engine, &mut session, b"alpha", b"one", StoreMode::Set),
            StoreOutcome::Stored
        );
        let handle = engine.get(b"alpha", GetMode::NoUpdate, &mut session).unwrap();
        assert_eq!(engine.data(&handle), b"one");
        assert!(engine.get(b"beta", GetMode::NoUpdate, &mut session).is_none());
        assert_eq!(session.stores(), 1);
        assert_eq!(session.gets(), 2);
    }

    #[test]
    fn test_set_overwrites() {
        let engine = InMemoryEngine::with_capacity(1);
        let mut session = engine.open_session(0).unwrap();

        let first = put(&engine, &mut session, b"k", b"v1", StoreMode::Set);
        let second = put(&engine, &mut session, b"k", b"v2", StoreMode::Set);
        assert_eq!(first, StoreOutcome::Stored);
        assert_eq!(second, StoreOutcome::Stored);
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.peek(b"k").unwrap().value, b"v2");
    }

    #[test]
    fn test_overwrite_at_capacity_reserves_nothing() {
        let engine = InMemoryEngine::with_capacity(1);
        let mut session = engine.open_session(0).unwrap();
        put(&engine, &mut session, b"k", b"v1", StoreMode::Set);
        let used = engine.used_bytes();

        assert!(engine.allocate(b"k", 0, 0, 2).is_some());
        assert!(engine.allocate(b"other", 0, 0, 2).is_none());
        for _ in 0..10 {
            put(&engine, &mut session, b"k", b"v2", StoreMode::Set);
        }
        assert_eq!(engine.used_bytes(), used);
    }

    #[test]
    fn test_byte_budget_limits_allocation() {
        let mut engine = InMemoryEngine::new();
        engine.configure(&EngineSettings {
            max_bytes: 2 * item_charge(1, 8),
            use_cas: true,
            maintainer_thread: false,
            hash_power: 4,
            slab_page_size: 1 << 20,
            slab_reassign: false,
            idle_timeout: false,
            item_size_max: ITEM_SIZE_MAX,
            engine_threads: 1,
        });
        let mut session = engine.open_session(0).unwrap();

        put(&engine, &mut session, b"a", &[1; 8], StoreMode::Set);
        put(&engine, &mut session, b"b", &[2; 8], StoreMode::Set);
        assert!(engine.allocate(b"c", 0, 0, 8).is_none());
        assert_eq!(engine.used_bytes(), 2 * item_charge(1, 8));
        assert_eq!(
            put(&engine, &mut session, b"a", &[3; 8], StoreMode::Set),
            StoreOutcome::Stored
        );
    }

    #[test]
    fn test_add_and_replace_preconditions() {
        let engine = InMemoryEngine::new();
        let mut session = engine.open_session(0).unwrap();

        assert_eq!(
            put(&engine, &mut session, b"k", b"v", StoreMode::Replace),
            StoreOutcome::NotStored
        );
        let added = put(&engine, &mut session, b"k", b"v", StoreMode::Add);
        let re_added = put(&engine, &mut session, b"k", b"w", StoreMode::Add);
        assert_eq!(added, StoreOutcome::Stored);
        assert_eq!(re_added, StoreOutcome::NotStored);
        assert_eq!(
            put(&engine, &mut session, b"k", b"w", StoreMode::Replace),
            StoreOutcome::Stored
        );
        assert_eq!(engine.peek(b"k").unwrap().value, b"w");
    }

    #[test]
    fn test_capacity_limits_allocation() {
        let engine = InMemoryEngine::with_capacity(2);
        let mut session = engine.open_session(0).unwrap();

        put(&engine, &mut session, b"a", b"1", StoreMode::Set);
        put(&engine, &mut session, b"b", b"2", StoreMode::Set);
        assert!(engine.allocate(b"c", 0, 0, 1).is_none());
    }

    #[test]
    fn test_failed_store_releases_capacity() {
        let engine = InMemoryEngine::with_capacity(1);
        let mut session = engine.open_session(0).unwrap();

        assert_eq!(
            put(&engine, &mut session, b"a", b"1", StoreMode::Replace),
            StoreOutcome::NotStored
        );
        assert!(engine.allocate(b"a", 0, 0, 1).is_some());
    }

    #[test]
    fn test_rejects_oversized_requests() {
        let engine = InMemoryEngine::new();
        assert!(engine.allocate(&[b'k'; KEY_MAX_LENGTH + 1], 0, 0, 1).is_none());
        assert!(engine.allocate(b"", 0, 0, 1).is_none());
        assert!(engine.allocate(b"k", 0, 0, ITEM_SIZE_MAX + 1).is_none());
    }

    #[test]
    fn test_touch_mode() {
        let engine = InMemoryEngine::new();
        let mut session = engine.open_session(0).unwrap();
        put(&engine, &mut session, b"k", b"v", StoreMode::Set);

        engine.get(b"k", GetMode::NoUpdate, &mut session);
        assert_eq!(engine.peek(b"k").unwrap().touches(), 0);
        engine.get(b"k", GetMode::Touch, &mut session);
        assert_eq!(engine.peek(b"k").unwrap().touches(), 1);
    }

    #[test]
    fn test_cas_ids_are_per_session() {
        let engine = InMemoryEngine::new();
        let mut first = engine.open_session(1).unwrap();
        let mut second = engine.open_session(2).unwrap();
        put(&engine, &mut first, b"a", b"1", StoreMode::Set);
        put(&engine, &mut second, b"b", b"2", StoreMode::Set);

        let a = engine.peek(b"a").unwrap().cas;
        let b = engine.peek(b"b").unwrap().cas;
        assert_ne!(a, b);
        assert_eq!(a >> 48, 1);
        assert_eq!(b >> 48, 2);
    }

    #[test]
    fn test_configure_applies_settings() {
        let mut engine = InMemoryEngine::new();
        let settings = EngineSettings {
            max_bytes: 1 << 20,
            use_cas: false,
            maintainer_thread: false,
            hash_power: 16,
            slab_page_size: 1 << 20,
            slab_reassign: false,
            idle_timeout: false,
            item_size_max: 64,
            engine_threads: 1,
        };
        engine.configure(&settings);
        assert_eq!(engine.settings(), Some(&settings));
        assert!(engine.allocate(b"k", 0, 0, 65).is_none());

        let mut session = engine.open_session(0).unwrap();
        put(&engine, &mut session, b"k", b"v", StoreMode::Set);
        assert_eq!(engine.peek(b"k").unwrap().cas, 0);
    }

    #[test]
    fn test_random_order_inserts() {
        let engine = InMemoryEngine::new();
        let mut session = engine.open_session(0).unwrap();
        let mut keys: Vec<u64> = (0..5_000).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(42));

        for key in &keys {
            let (k, v) = (key.to_le_bytes(), key.to_be_bytes());
            put(&engine, &mut session, &k, &v, StoreMode::Set);
        }
        assert_eq!(engine.len(), keys.len());
        for key in 0..5_000u64 {
            let handle = engine.get(&key.to_le_bytes(), GetMode::NoUpdate, &mut session).unwrap();
            assert_eq!(engine.data(&handle), key.to_be_bytes());
        }
    }
}
