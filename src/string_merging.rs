//! Splitting and merging of SHF_MERGE sections. A mergeable section's contents are cut into
//! fragments (null-terminated strings, or fixed-size records of sh_entsize bytes), and equal
//! fragments from every input file are interned so the output contains a single copy. Despite
//! the module name this handles non-string mergeable sections too; the only difference is how
//! the section is cut.

use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::hash::hash_bytes;
use anyhow::bail;
use colosseum::sync::Arena;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

const NUM_SHARDS: usize = 16;

/// The atomic unit of a mergeable section: one string or one fixed-size record. Interned by
/// (contents, alignment) in its parent MergedSection, so equal content merges to one address.
#[derive(Debug)]
pub(crate) struct SectionFragment<'data> {
    pub(crate) parent: &'data MergedSection<'data>,
    pub(crate) data: &'data [u8],
    pub(crate) alignment: u16,
    pub(crate) is_alive: AtomicBool,

    /// Offset within the parent's output section. Assigned by `assign_offsets`.
    pub(crate) offset: AtomicU64,
}

impl<'data> SectionFragment<'data> {
    pub(crate) fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    pub(crate) fn get_offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }
}

/// One output section built out of fragments, e.g. the merged `.rodata.str1.1` or `.comment`.
#[derive(Debug)]
pub(crate) struct MergedSection<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,

    shards: Vec<Mutex<PassThroughHashMap<FragmentKey<'data>, &'data SectionFragment<'data>>>>,
    pub(crate) estimator: HyperLogLog,

    /// Output size and alignment, filled in by `assign_offsets`.
    pub(crate) size: AtomicU64,
    pub(crate) alignment: AtomicU64,

    /// The chunk this section was placed in, u32::MAX until chunks are collected.
    pub(crate) chunk_idx: AtomicU32,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
struct FragmentKey<'data> {
    data: &'data [u8],
    alignment: u16,
}

impl<'data> MergedSection<'data> {
    pub(crate) fn new(name: &'data [u8], sh_type: u32, sh_flags: u64) -> MergedSection<'data> {
        MergedSection {
            name,
            sh_type,
            // SHF_MERGE and SHF_STRINGS don't survive into the output; downstream consumers see
            // a plain blob.
            sh_flags: sh_flags
                & !u64::from(object::elf::SHF_MERGE)
                & !u64::from(object::elf::SHF_STRINGS)
                & !u64::from(object::elf::SHF_COMPRESSED),
            shards: (0..NUM_SHARDS).map(|_| Mutex::new(Default::default())).collect(),
            estimator: HyperLogLog::new(),
            size: AtomicU64::new(0),
            alignment: AtomicU64::new(1),
            chunk_idx: AtomicU32::new(u32::MAX),
        }
    }

    /// Reserves capacity from the cardinality estimate accumulated during section splitting.
    pub(crate) fn reserve_from_estimate(&self) {
        let estimate = self.estimator.cardinality() as usize;
        for shard in &self.shards {
            shard.lock().unwrap().reserve(estimate / NUM_SHARDS + 16);
        }
    }

    /// Interns one fragment. Returns a stable pointer; equal (content, alignment) pairs from any
    /// thread get pointer-equal results.
    pub(crate) fn insert(
        &'data self,
        arena: &'data Arena<SectionFragment<'data>>,
        data: &'data [u8],
        hash: u64,
        alignment: u16,
    ) -> &'data SectionFragment<'data> {
        let key = PreHashed::new(FragmentKey { data, alignment }, hash ^ u64::from(alignment));
        let mut shard = self.shards[(key.hash() as usize) % NUM_SHARDS].lock().unwrap();
        *shard.entry(key).or_insert_with(|| {
            &*arena.alloc(SectionFragment {
                parent: self,
                data,
                alignment,
                is_alive: AtomicBool::new(false),
                offset: AtomicU64::new(0),
            })
        })
    }

    /// Lays out the live fragments, sorted by (alignment desc, contents) so the output is
    /// deterministic regardless of insertion interleaving.
    pub(crate) fn assign_offsets(&self) {
        let mut fragments: Vec<&SectionFragment> = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock().unwrap();
            fragments.extend(
                shard
                    .values()
                    .filter(|frag| frag.is_alive.load(Ordering::Relaxed))
                    .copied(),
            );
        }
        fragments.sort_unstable_by(|a, b| {
            b.alignment.cmp(&a.alignment).then_with(|| a.data.cmp(b.data))
        });

        let mut offset = 0u64;
        let mut max_alignment = 1u64;
        for frag in fragments {
            let alignment = u64::from(frag.alignment.max(1));
            offset = crate::elf::align_to(offset, alignment);
            frag.offset.store(offset, Ordering::Relaxed);
            offset += frag.data.len() as u64;
            max_alignment = max_alignment.max(alignment);
        }
        self.size.store(offset, Ordering::Relaxed);
        self.alignment.store(max_alignment, Ordering::Relaxed);
    }

    /// Copies the live fragments into their assigned offsets.
    pub(crate) fn write_to(&self, out: &mut [u8]) {
        for shard in &self.shards {
            let shard = shard.lock().unwrap();
            for frag in shard.values() {
                if frag.is_alive.load(Ordering::Relaxed) {
                    let offset = frag.offset.load(Ordering::Relaxed) as usize;
                    out[offset..offset + frag.data.len()].copy_from_slice(frag.data);
                }
            }
        }
    }
}

/// The pieces a mergeable input section was split into, still in input order. `frag_offsets`
/// holds each piece's starting offset in the original section, so the piece covering an
/// (st_value + addend) target is found by binary search.
pub(crate) struct MergeableSection<'data> {
    pub(crate) parent: &'data MergedSection<'data>,
    pub(crate) pieces: Vec<&'data [u8]>,
    pub(crate) frag_offsets: Vec<u32>,
    pub(crate) hashes: Vec<u64>,
    pub(crate) fragments: Vec<&'data SectionFragment<'data>>,
    pub(crate) p2align: u16,
}

impl<'data> MergeableSection<'data> {
    /// Binary search for the piece containing `offset`, returning the fragment and the residual
    /// offset within it.
    pub(crate) fn fragment_at(&self, offset: u64) -> Option<(&'data SectionFragment<'data>, u64)> {
        let idx = self
            .frag_offsets
            .partition_point(|&start| u64::from(start) <= offset);
        if idx == 0 {
            return None;
        }
        let idx = idx - 1;
        self.fragments
            .get(idx)
            .map(|frag| (*frag, offset - u64::from(self.frag_offsets[idx])))
    }
}

fn find_null(data: &[u8], entsize: usize) -> Option<usize> {
    if entsize == 1 {
        return memchr::memchr(0, data);
    }
    (0..data.len().saturating_sub(entsize - 1))
        .step_by(entsize)
        .find(|&i| data[i..i + entsize].iter().all(|&b| b == 0))
}

/// Splits one mergeable input section into pieces and feeds the parent's cardinality estimator.
/// Fragments are interned later, once every section has been split and the maps can be sized.
pub(crate) fn split_section<'data>(
    parent: &'data MergedSection<'data>,
    contents: &'data [u8],
    sh_entsize: u64,
    sh_addralign: u64,
    sh_flags: u64,
    display_name: &dyn Fn() -> String,
) -> Result<MergeableSection<'data>> {
    if sh_addralign >= u64::from(u16::MAX) {
        bail!("{}: alignment too large", display_name());
    }
    let entsize = sh_entsize as usize;

    let mut section = MergeableSection {
        parent,
        pieces: Vec::new(),
        frag_offsets: Vec::new(),
        hashes: Vec::new(),
        fragments: Vec::new(),
        p2align: sh_addralign.max(1) as u16,
    };

    let mut data = contents;
    let mut offset = 0usize;

    if sh_flags & u64::from(object::elf::SHF_STRINGS) != 0 {
        while !data.is_empty() {
            let Some(end) = find_null(data, entsize) else {
                bail!("{}: string is not null terminated", display_name());
            };
            let piece = &data[..end + entsize];
            data = &data[end + entsize..];
            section.pieces.push(piece);
            section.frag_offsets.push(offset as u32);
            let hash = hash_bytes(piece);
            section.hashes.push(hash);
            parent.estimator.insert(hash);
            offset += piece.len();
        }
    } else {
        if entsize == 0 || contents.len() % entsize != 0 {
            bail!(
                "{}: section size is not a multiple of sh_entsize",
                display_name()
            );
        }
        while !data.is_empty() {
            let (piece, rest) = data.split_at(entsize);
            data = rest;
            section.pieces.push(piece);
            section.frag_offsets.push(offset as u32);
            let hash = hash_bytes(piece);
            section.hashes.push(hash);
            parent.estimator.insert(hash);
            offset += entsize;
        }
    }

    Ok(section)
}

/// Cardinality estimator used to size the fragment maps before the parallel interning phase.
#[derive(Debug)]
pub(crate) struct HyperLogLog {
    buckets: Vec<AtomicU8>,
}

const HLL_BUCKETS: usize = 2048;
const HLL_ALPHA: f64 = 0.79402;

impl HyperLogLog {
    pub(crate) fn new() -> HyperLogLog {
        HyperLogLog {
            buckets: (0..HLL_BUCKETS).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    pub(crate) fn insert(&self, hash: u64) {
        let hash = hash as u32;
        let idx = (hash as usize) & (HLL_BUCKETS - 1);
        let value = hash.leading_zeros() as u8 + 1;
        let mut current = self.buckets[idx].load(Ordering::Relaxed);
        while current < value {
            match self.buckets[idx].compare_exchange_weak(
                current,
                value,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn cardinality(&self) -> u64 {
        let z: f64 = self
            .buckets
            .iter()
            .map(|b| 2f64.powi(-i32::from(b.load(Ordering::Relaxed))))
            .sum();
        (HLL_ALPHA * (HLL_BUCKETS * HLL_BUCKETS) as f64 / z) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merged<'a>(arena: &'a Arena<MergedSection<'a>>) -> &'a MergedSection<'a> {
        arena.alloc(MergedSection::new(
            b".rodata.str1.1",
            object::elf::SHT_PROGBITS,
            u64::from(object::elf::SHF_ALLOC | object::elf::SHF_MERGE | object::elf::SHF_STRINGS),
        ))
    }

    #[test]
    fn test_split_strings() {
        let merged_arena = Arena::new();
        let parent = merged(&merged_arena);
        let section = split_section(
            parent,
            b"hello\0world\0",
            1,
            1,
            u64::from(object::elf::SHF_STRINGS),
            &|| "test".to_owned(),
        )
        .unwrap();
        assert_eq!(
            section.pieces,
            vec![b"hello\0".as_slice(), b"world\0".as_slice()]
        );
        assert_eq!(section.frag_offsets, vec![0, 6]);
    }

    #[test]
    fn test_split_records() {
        let merged_arena = Arena::new();
        let parent = merged(&merged_arena);
        let section = split_section(parent, b"abcdefgh", 4, 4, 0, &|| "test".to_owned()).unwrap();
        assert_eq!(section.pieces, vec![b"abcd".as_slice(), b"efgh".as_slice()]);
        // Uneven record sizes are fatal.
        assert!(split_section(parent, b"abcde", 4, 4, 0, &|| "test".to_owned()).is_err());
    }

    #[test]
    fn test_split_wide_strings() {
        let merged_arena = Arena::new();
        let parent = merged(&merged_arena);
        // Two 2-byte-unit strings with 2-byte terminators.
        let data = b"a\0b\0\0\0c\0\0\0";
        let section = split_section(
            parent,
            data,
            2,
            2,
            u64::from(object::elf::SHF_STRINGS),
            &|| "test".to_owned(),
        )
        .unwrap();
        assert_eq!(section.pieces.len(), 2);
        assert_eq!(section.pieces[0], b"a\0b\0\0\0");
        assert_eq!(section.pieces[1], b"c\0\0\0");
    }

    #[test]
    fn test_fragment_interning_is_idempotent() {
        let merged_arena = Arena::new();
        let frag_arena = Arena::new();
        let parent = merged(&merged_arena);
        let a = parent.insert(&frag_arena, b"hello\0", hash_bytes(b"hello\0"), 1);
        let b = parent.insert(&frag_arena, b"hello\0", hash_bytes(b"hello\0"), 1);
        let c = parent.insert(&frag_arena, b"hello\0", hash_bytes(b"hello\0"), 4);
        assert!(std::ptr::eq(a, b));
        assert!(!std::ptr::eq(a, c), "different alignment must not merge");
    }

    #[test]
    fn test_assign_offsets_skips_dead_fragments() {
        let merged_arena = Arena::new();
        let frag_arena = Arena::new();
        let parent = merged(&merged_arena);
        let a = parent.insert(&frag_arena, b"aa\0", hash_bytes(b"aa\0"), 1);
        let b = parent.insert(&frag_arena, b"bbbb\0", hash_bytes(b"bbbb\0"), 2);
        let dead = parent.insert(&frag_arena, b"dead\0", hash_bytes(b"dead\0"), 1);
        a.mark_alive();
        b.mark_alive();
        parent.assign_offsets();
        let size = parent.size.load(Ordering::Relaxed);
        assert_eq!(size, 8); // "bbbb\0" at 0 (align 2 sorts first), "aa\0" at 5.
        assert_eq!(b.offset.load(Ordering::Relaxed), 0);
        assert_eq!(a.offset.load(Ordering::Relaxed), 5);
        assert!(!dead.is_alive.load(Ordering::Relaxed));
        assert_eq!(parent.alignment.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_fragment_at() {
        let merged_arena = Arena::new();
        let frag_arena = Arena::new();
        let parent = merged(&merged_arena);
        let mut section = split_section(
            parent,
            b"hi\0yo\0",
            1,
            1,
            u64::from(object::elf::SHF_STRINGS),
            &|| "test".to_owned(),
        )
        .unwrap();
        for (piece, hash) in section.pieces.clone().into_iter().zip(section.hashes.clone()) {
            section.fragments.push(parent.insert(&frag_arena, piece, hash, 1));
        }
        let (frag, residual) = section.fragment_at(4).unwrap();
        assert_eq!(frag.data, b"yo\0");
        assert_eq!(residual, 1);
        assert!(section.fragment_at(0).is_some());
    }

    #[test]
    fn test_hyperloglog_rough_accuracy() {
        let hll = HyperLogLog::new();
        for i in 0..10_000u64 {
            hll.insert(hash_bytes(&i.to_le_bytes()));
        }
        let estimate = hll.cardinality();
        assert!((5_000..20_000).contains(&estimate), "estimate {estimate}");
    }
}
