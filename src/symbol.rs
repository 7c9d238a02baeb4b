//! The global symbol record shared by every input file that references a name. The resolution
//! core is guarded by a per-symbol mutex; monotone state (visibility, needs-flags, liveness of
//! the things a symbol points at) uses atomics so that readers never block.

use crate::string_merging::SectionFragment;
use bitflags::bitflags;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// Identifies an input file by its load-order index, which doubles as its resolution priority
/// (lower wins). File 0 is the linker's internal file.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub(crate) struct FileId(pub(crate) u32);

pub(crate) const INTERNAL_FILE_ID: FileId = FileId(0);

impl FileId {
    pub(crate) const NONE: FileId = FileId(u32::MAX);

    pub(crate) fn is_none(self) -> bool {
        self == FileId::NONE
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Needs-flags accumulated by the relocation scanner, drained by the synthesizer pass.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub(crate) struct NeedsFlags: u32 {
        const GOT = 1 << 0;
        const PLT = 1 << 1;
        const GOTTP = 1 << 2;
        const TLSGD = 1 << 3;
        const TLSDESC = 1 << 4;
        const TLSLD = 1 << 5;
        const COPYREL = 1 << 6;
        const DYNSYM = 1 << 7;
    }
}

/// Where a resolved symbol's value lives.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) enum SymbolPlace<'data> {
    /// Not defined by anything (yet).
    #[default]
    None,
    Absolute,
    /// Section `shndx` of the owning file.
    Section(u32),
    /// A piece of a mergeable section. The stored value is the offset within the fragment.
    Fragment(&'data SectionFragment<'data>),
    /// An output chunk, for linker-synthesized symbols. Index into the chunk list.
    Chunk(u32),
}

#[derive(Default)]
pub(crate) struct SymbolCore<'data> {
    pub(crate) file: Option<FileId>,
    pub(crate) sym_idx: u32,
    pub(crate) value: u64,
    pub(crate) place: SymbolPlace<'data>,
    pub(crate) ver_idx: u16,
    pub(crate) is_lazy: bool,
    pub(crate) is_weak: bool,
    pub(crate) is_imported: bool,
    pub(crate) is_exported: bool,
}

impl Default for FileId {
    fn default() -> Self {
        FileId::NONE
    }
}

pub(crate) struct Symbol<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) core: Mutex<SymbolCore<'data>>,
    pub(crate) visibility: AtomicU8,
    pub(crate) flags: AtomicU32,

    /// Index into the symbol aux table, or -1. Assigned by the synthesizer pass.
    pub(crate) aux_idx: AtomicI32,

    pub(crate) traced: AtomicBool,
    pub(crate) wrap: AtomicBool,
    pub(crate) write_to_symtab: AtomicBool,
    pub(crate) has_copyrel: AtomicBool,
    pub(crate) copyrel_readonly: AtomicBool,
}

impl<'data> Symbol<'data> {
    pub(crate) fn new(name: &'data [u8]) -> Symbol<'data> {
        Symbol {
            name,
            core: Mutex::new(SymbolCore::default()),
            visibility: AtomicU8::new(object::elf::STV_DEFAULT),
            flags: AtomicU32::new(0),
            aux_idx: AtomicI32::new(-1),
            traced: AtomicBool::new(false),
            wrap: AtomicBool::new(false),
            write_to_symtab: AtomicBool::new(false),
            has_copyrel: AtomicBool::new(false),
            copyrel_readonly: AtomicBool::new(false),
        }
    }

    pub(crate) fn name_for_display(&self, demangle: bool) -> String {
        crate::demangle::display_name(self.name, demangle)
    }

    pub(crate) fn add_flags(&self, flags: NeedsFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub(crate) fn needs_flags(&self) -> NeedsFlags {
        NeedsFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub(crate) fn clear_flags(&self) {
        self.flags.store(0, Ordering::Relaxed);
    }

    pub(crate) fn aux(&self) -> Option<usize> {
        let idx = self.aux_idx.load(Ordering::Relaxed);
        (idx >= 0).then_some(idx as usize)
    }

    /// Tightens the symbol's visibility. Protected dominates default and hidden dominates
    /// protected; INTERNAL is canonicalized to HIDDEN. The update is a CAS loop so that
    /// concurrent resolvers only ever narrow it.
    pub(crate) fn merge_visibility(&self, visibility: u8) {
        let visibility = if visibility == object::elf::STV_INTERNAL {
            object::elf::STV_HIDDEN
        } else {
            visibility
        };

        let strength = |v: u8| match v {
            object::elf::STV_HIDDEN => 1,
            object::elf::STV_PROTECTED => 2,
            _ => 3,
        };

        let mut current = self.visibility.load(Ordering::Relaxed);
        while strength(visibility) < strength(current) {
            match self.visibility.compare_exchange_weak(
                current,
                visibility,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn get_visibility(&self) -> u8 {
        self.visibility.load(Ordering::Relaxed)
    }
}

/// Resolution tiers of spec'd symbol precedence, strongest first. The full rank is
/// `(tier << 32) | file_priority` so that ties within a tier break by load order.
pub(crate) fn rank(file: FileId, is_dso: bool, is_weak: bool, is_common: bool, is_lazy: bool) -> u64 {
    let tier: u64 = if is_common {
        6
    } else if is_lazy {
        5
    } else if is_dso {
        if is_weak { 4 } else { 3 }
    } else if is_weak {
        2
    } else {
        1
    };
    (tier << 32) | u64::from(file.0)
}

pub(crate) const RANK_UNCLAIMED: u64 = 7 << 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_order() {
        let f1 = FileId(1);
        let f2 = FileId(2);
        // Strong obj < weak obj < strong dso < weak dso < lazy < common < unclaimed.
        let strong = rank(f1, false, false, false, false);
        let weak = rank(f1, false, true, false, false);
        let dso_strong = rank(f1, true, false, false, false);
        let dso_weak = rank(f1, true, true, false, false);
        let lazy = rank(f1, false, false, false, true);
        let common = rank(f1, false, false, true, false);
        assert!(strong < weak);
        assert!(weak < dso_strong);
        assert!(dso_strong < dso_weak);
        assert!(dso_weak < lazy);
        assert!(lazy < common);
        assert!(common < RANK_UNCLAIMED);
        // Ties break by file priority.
        assert!(rank(f1, false, false, false, false) < rank(f2, false, false, false, false));
        // A strong definition in a later file still beats a weak one in an earlier file.
        assert!(rank(f2, false, false, false, false) < rank(f1, false, true, false, false));
    }

    #[test]
    fn test_visibility_merge_only_tightens() {
        let sym = Symbol::new(b"x");
        assert_eq!(sym.get_visibility(), object::elf::STV_DEFAULT);
        sym.merge_visibility(object::elf::STV_PROTECTED);
        assert_eq!(sym.get_visibility(), object::elf::STV_PROTECTED);
        sym.merge_visibility(object::elf::STV_DEFAULT);
        assert_eq!(sym.get_visibility(), object::elf::STV_PROTECTED);
        sym.merge_visibility(object::elf::STV_INTERNAL);
        assert_eq!(sym.get_visibility(), object::elf::STV_HIDDEN);
        sym.merge_visibility(object::elf::STV_PROTECTED);
        assert_eq!(sym.get_visibility(), object::elf::STV_HIDDEN);
    }
}
