//! The process-global symbol interner. `intern` hands out a stable `&Symbol` that is pointer-
//! equal for equal names, so every object that references a name shares one record.
//!
//! The map is append-only: nothing is ever removed or rehashed into a different allocation
//! during a link. Rather than re-deriving a lock-free bucket state machine, we shard a mature
//! hash map and back it with an arena; insertion never moves a Symbol, and the shard count keeps
//! contention negligible. Capacity is reserved up front from the caller's estimate.

use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::hash::hash_bytes;
use crate::symbol::Symbol;
use colosseum::sync::Arena;
use std::sync::Mutex;

const NUM_SHARDS: usize = 16;

pub(crate) struct SymbolInterner<'data> {
    arena: &'data Arena<Symbol<'data>>,
    shards: Vec<Mutex<PassThroughHashMap<&'data [u8], &'data Symbol<'data>>>>,
}

impl<'data> SymbolInterner<'data> {
    /// `estimate` is the expected number of distinct global names; each shard reserves its share
    /// so that the maps never grow during the parallel resolution passes.
    pub(crate) fn new(arena: &'data Arena<Symbol<'data>>, estimate: usize) -> SymbolInterner<'data> {
        let per_shard = (estimate / NUM_SHARDS + 1).next_power_of_two();
        let shards = (0..NUM_SHARDS)
            .map(|_| {
                Mutex::new(PassThroughHashMap::with_capacity_and_hasher(
                    per_shard,
                    Default::default(),
                ))
            })
            .collect();
        SymbolInterner { arena, shards }
    }

    /// Allocates a symbol that is NOT shared by name: local symbols get their own records even
    /// when names collide.
    pub(crate) fn alloc_unnamed(&self, symbol: Symbol<'data>) -> &'data Symbol<'data> {
        &*self.arena.alloc(symbol)
    }

    pub(crate) fn intern(&self, name: &'data [u8]) -> &'data Symbol<'data> {
        let hash = hash_bytes(name);
        let key = PreHashed::new(name, hash);
        let mut shard = self.shards[(hash as usize) % NUM_SHARDS].lock().unwrap();
        *shard
            .entry(key)
            .or_insert_with(|| &*self.arena.alloc(Symbol::new(name)))
    }

    pub(crate) fn get(&self, name: &[u8]) -> Option<&'data Symbol<'data>> {
        let hash = hash_bytes(name);
        let key = PreHashed::new(name, hash);
        self.shards[(hash as usize) % NUM_SHARDS]
            .lock()
            .unwrap()
            .get(&key)
            .copied()
    }

    /// All interned symbols, in no particular order. Callers that need determinism must sort.
    pub(crate) fn for_each(&self, mut callback: impl FnMut(&'data Symbol<'data>)) {
        for shard in &self.shards {
            for symbol in shard.lock().unwrap().values() {
                callback(symbol);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_idempotent_and_stable() {
        let arena = Arena::new();
        let interner = SymbolInterner::new(&arena, 16);
        let a = interner.intern(b"foo");
        let b = interner.intern(b"foo");
        let c = interner.intern(b"bar");
        assert!(std::ptr::eq(a, b));
        assert!(!std::ptr::eq(a, c));
        assert_eq!(a.name, b"foo");
        assert!(std::ptr::eq(interner.get(b"foo").unwrap(), a));
        assert!(interner.get(b"baz").is_none());
    }

    #[test]
    fn test_concurrent_intern_yields_one_record() {
        let arena = Arena::new();
        let interner = SymbolInterner::new(&arena, 1024);
        let pointers: Vec<usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| interner.intern(b"shared") as *const _ as usize))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(pointers.windows(2).all(|w| w[0] == w[1]));
    }
}
