//! One input section of one object file. Sections carry their (possibly rewritten) header
//! fields, their contents (decompressed if the input was compressed), their relocations and the
//! fragment references the mergeable-section splitter attached to those relocations.

use crate::context::OutputSecId;
use crate::elf::Rela;
use crate::string_merging::SectionFragment;
use crate::symbol::FileId;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

pub(crate) const NO_SECTION: u32 = u32::MAX;
pub(crate) const NO_OUTPUT: OutputSecId = OutputSecId(u32::MAX);

/// A relocation that targets a piece of a mergeable section. `addend` is the residual offset
/// within the fragment.
#[derive(Clone, Copy)]
pub(crate) struct RelFragment<'data> {
    pub(crate) rel_idx: u32,
    pub(crate) frag: &'data SectionFragment<'data>,
    pub(crate) addend: i64,
}

/// Per-relocation output decisions made by the relocation scanner.
pub(crate) mod rel_flags {
    /// The relocation must become a symbolic dynamic relocation.
    pub(crate) const DYNREL: u8 = 1 << 0;
    /// The relocation must become a base-relative (RELATIVE) dynamic relocation.
    pub(crate) const BASEREL: u8 = 1 << 1;
}

pub(crate) struct InputSection<'data> {
    pub(crate) file: FileId,
    pub(crate) shndx: u32,
    pub(crate) name: &'data [u8],
    pub(crate) contents: &'data [u8],

    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) sh_size: u64,
    pub(crate) sh_addralign: u64,
    pub(crate) sh_entsize: u64,

    pub(crate) rels: &'data [Rela],

    /// Fragment targets for STT_SECTION relocations into mergeable sections, ordered by rel_idx.
    pub(crate) rel_fragments: Vec<RelFragment<'data>>,

    /// One entry per relocation once the scanner has run.
    pub(crate) scan_flags: std::sync::OnceLock<Vec<u8>>,

    /// Index of this section's first/last FDE in the owning file's fde list, or NO_SECTION.
    pub(crate) fde_begin: u32,
    pub(crate) fde_end: u32,

    pub(crate) is_alive: AtomicBool,
    pub(crate) is_visited: AtomicBool,
    pub(crate) is_ehframe: bool,

    pub(crate) output_section: OutputSecId,

    /// Offset within the output section, assigned when section sizes are computed.
    pub(crate) offset: AtomicU64,
}

impl<'data> InputSection<'data> {
    pub(crate) fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }

    pub(crate) fn kill(&self) {
        self.is_alive.store(false, Ordering::Relaxed);
    }

    pub(crate) fn is_bss(&self) -> bool {
        self.sh_type == object::elf::SHT_NOBITS
    }

    pub(crate) fn is_alloc(&self) -> bool {
        self.sh_flags & u64::from(object::elf::SHF_ALLOC) != 0
    }

    pub(crate) fn output_offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    pub(crate) fn scan_flag(&self, rel_idx: usize) -> u8 {
        self.scan_flags
            .get()
            .and_then(|flags| flags.get(rel_idx))
            .copied()
            .unwrap_or(0)
    }

    /// The fragment a given relocation points at, if the splitter attached one.
    pub(crate) fn fragment_for_rel(&self, rel_idx: usize) -> Option<&RelFragment<'data>> {
        let idx = self
            .rel_fragments
            .binary_search_by_key(&(rel_idx as u32), |fr| fr.rel_idx)
            .ok()?;
        Some(&self.rel_fragments[idx])
    }

    pub(crate) fn has_fdes(&self) -> bool {
        self.fde_begin != NO_SECTION
    }
}
