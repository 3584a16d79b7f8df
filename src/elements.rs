//! Element array backing payload identity checks
//!
//! One fixed-size record per working-set index, held in an anonymous memory
//! mapping. The first 8 bytes of each record store the index the record was
//! populated for. Payloads carry the record's slot so a lookup can resolve it
//! and confirm it got the item it asked for.

use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;

use crate::error::{Error, Result};

/// Fixed-size records addressed by slot
pub struct ElementArray {
    /// Keeps the mapping alive; all access goes through `base`
    _map: MmapMut,
    base: *mut u8,
    element_size: usize,
    len: u64,
}

// Records are only reached through `AtomicU64` views, and the mapping lives as
// long as the array.
unsafe impl Send for ElementArray {}
unsafe impl Sync for ElementArray {}

impl ElementArray {
    /// Map `len` zeroed records of `element_size` bytes.
    ///
    /// `element_size` must be a non-zero multiple of 8 so every record's key
    /// word is aligned.
    pub fn new(len: u64, element_size: usize) -> Result<Self> {
        if element_size < 8 || element_size % 8 != 0 {
            return Err(Error::Config(format!(
                "element size {} must be a non-zero multiple of 8",
                element_size
            )));
        }
        let requested = Self::bytes_for(len, element_size).ok_or_else(|| {
            Error::Config(format!(
                "element array of {} x {} bytes overflows the address space",
                len, element_size
            ))
        })?;

        let mut map = MmapMut::map_anon(requested.max(1))
            .map_err(|source| Error::ElementArray { requested, source })?;
        let base = map.as_mut_ptr();

        Ok(Self {
            _map: map,
            base,
            element_size,
            len,
        })
    }

    /// Bytes needed for `len` records, if it fits in `usize`
    pub fn bytes_for(len: u64, element_size: usize) -> Option<usize> {
        usize::try_from(len).ok()?.checked_mul(element_size)
    }

    /// Number of records
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the array has no records
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes per record
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Total mapped bytes
    pub fn size_bytes(&self) -> usize {
        self.len as usize * self.element_size
    }

    /// Record that `slot` belongs to `index`
    pub fn set_key(&self, slot: u64, index: u64) {
        if let Some(word) = self.key_word(slot) {
            word.store(index, Ordering::Relaxed);
        }
    }

    /// Index stored at `slot`, or `None` if the slot is out of range
    pub fn key_at(&self, slot: u64) -> Option<u64> {
        self.key_word(slot).map(|word| word.load(Ordering::Relaxed))
    }

    fn key_word(&self, slot: u64) -> Option<&AtomicU64> {
        if slot >= self.len {
            return None;
        }
        // SAFETY: slot < len, so the record lies inside the mapping; the
        // mapping is page aligned and element_size is a multiple of 8.
        unsafe {
            let ptr = self.base.add(slot as usize * self.element_size) as *const AtomicU64;
            Some(&*ptr)
        }
    }
}

impl std::fmt::Debug for ElementArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementArray")
            .field("len", &self.len)
            .field("element_size", &self.element_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_zeroed_on_creation() {
        let elements = ElementArray::new(100, 24).unwrap();
        assert_eq!(elements.len(), 100);
        assert_eq!(elements.size_bytes(), 2400);
        assert!((0..100).all(|slot| elements.key_at(slot) == Some(0)));
    }

    #[test]
    fn test_set_and_read() {
        let elements = ElementArray::new(10, 16).unwrap();
        elements.set_key(3, 42);
        assert_eq!(elements.key_at(3), Some(42));
        assert_eq!(elements.key_at(4), Some(0));
        assert_eq!(elements.key_at(10), None);
        // out of range writes are ignored
        elements.set_key(10, 1);
    }

    #[test]
    fn test_rejects_unaligned_records() {
        assert!(matches!(ElementArray::new(10, 12), Err(Error::Config(_))));
        assert!(matches!(ElementArray::new(10, 0), Err(Error::Config(_))));
    }

    #[test]
    fn test_disjoint_concurrent_writes() {
        let elements = ElementArray::new(4_000, 64).unwrap();
        thread::scope(|s| {
            for worker in 0..4u64 {
                let elements = &elements;
                s.spawn(move || {
                    for slot in (worker * 1000)..((worker + 1) * 1000) {
                        elements.set_key(slot, slot);
                    }
                });
            }
        });
        assert!((0..4_000).all(|slot| elements.key_at(slot) == Some(slot)));
    }
}
