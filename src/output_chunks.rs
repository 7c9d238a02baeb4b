//! Output chunks: the units the output file is assembled from. Regular chunks hold binned input
//! sections, merged chunks hold section fragments, and the rest are synthesized here: headers,
//! GOT/PLT machinery, the dynamic section and its tables, hash tables, .eh_frame and friends.

use crate::arch::ApplyArgs;
use crate::context::OutputSecId;
use crate::eh_frame;
use crate::elf;
use crate::elf::Rela;
use crate::error;
use crate::error::Result;
use crate::input_section::InputSection;
use crate::input_section::rel_flags;
use crate::object_file::LinkFile;
use crate::object_file::ObjectFile;
use crate::passes::Link;
use crate::symbol::FileId;
use crate::symbol::Symbol;
use crate::symbol::SymbolPlace;
use anyhow::Context as _;
use object::LittleEndian as LE;
use std::sync::Mutex;
use std::sync::atomic::Ordering;

/// Reference to one input section, resolvable through the file list.
#[derive(Clone, Copy)]
pub(crate) struct SectionRef {
    pub(crate) file: FileId,
    pub(crate) shndx: u32,
}

pub(crate) fn section_ref<'a, 'data>(
    files: &'a [LinkFile<'data>],
    sref: SectionRef,
) -> &'a InputSection<'data> {
    files[sref.file.as_usize()]
        .as_object()
        .unwrap()
        .sections[sref.shndx as usize]
        .as_ref()
        .unwrap()
}

#[derive(Default, Clone)]
pub(crate) struct OutShdr {
    pub(crate) sh_name: u32,
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) sh_addr: u64,
    pub(crate) sh_offset: u64,
    pub(crate) sh_size: u64,
    pub(crate) sh_link: u32,
    pub(crate) sh_info: u32,
    pub(crate) sh_addralign: u64,
    pub(crate) sh_entsize: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ChunkKind {
    Ehdr,
    Phdr,
    Shdr,
    Output(OutputSecId),
    /// Index into `Link::merged`.
    Merged(u32),
    Interp,
    Got,
    GotPlt,
    Plt,
    PltGot,
    RelDyn,
    RelPlt,
    Dynamic,
    Dynsym,
    Dynstr,
    Hash,
    GnuHash,
    Versym,
    Verneed,
    Copyrel { relro: bool },
    NoteProperty,
    BuildId,
    EhFrame,
    EhFrameHdr,
    Symtab,
    Strtab,
    Shstrtab,
}

pub(crate) struct Chunk<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) shdr: OutShdr,
    pub(crate) kind: ChunkKind,

    /// Index in the output section header table; 0 means the chunk has no header entry.
    pub(crate) shndx: u32,

    /// Whether layout must start a new page before this chunk (segment permission change).
    pub(crate) new_page: bool,
}

impl<'data> Chunk<'data> {
    pub(crate) fn new(name: &'static [u8], kind: ChunkKind) -> Chunk<'data> {
        Chunk {
            name,
            shdr: OutShdr::default(),
            kind,
            shndx: 0,
            new_page: false,
        }
    }

    pub(crate) fn is_alloc(&self) -> bool {
        self.shdr.sh_flags & u64::from(object::elf::SHF_ALLOC) != 0
    }

    pub(crate) fn is_bss(&self) -> bool {
        self.shdr.sh_type == object::elf::SHT_NOBITS
    }

    pub(crate) fn is_tls(&self) -> bool {
        self.shdr.sh_flags & u64::from(object::elf::SHF_TLS) != 0
    }

    /// Whether the chunk belongs in the PT_GNU_RELRO segment.
    pub(crate) fn is_relro(&self, z_relro: bool) -> bool {
        if !z_relro {
            return false;
        }
        matches!(
            self.kind,
            ChunkKind::Dynamic
                | ChunkKind::Got
                | ChunkKind::Copyrel { relro: true }
        ) || self.name == b".data.rel.ro"
            || self.name == b".bss.rel.ro"
            || self.name == b".init_array"
            || self.name == b".fini_array"
            || self.name == b".preinit_array"
            || self.name == b".ctors"
            || self.name == b".dtors"
    }

    /// Whether the chunk has an entry in the section header table. Headers don't.
    pub(crate) fn has_shdr_entry(&self) -> bool {
        !matches!(self.kind, ChunkKind::Ehdr | ChunkKind::Phdr | ChunkKind::Shdr)
    }
}

/// One GOT slot (or slot pair for the TLS flavors).
#[derive(Clone, Copy)]
pub(crate) enum GotEntry<'data> {
    Got(&'data Symbol<'data>),
    GotTp(&'data Symbol<'data>),
    TlsGd(&'data Symbol<'data>),
    TlsDesc(&'data Symbol<'data>),
    TlsLd,
}

impl GotEntry<'_> {
    pub(crate) fn num_slots(&self) -> u64 {
        match self {
            GotEntry::Got(_) | GotEntry::GotTp(_) => 1,
            GotEntry::TlsGd(_) | GotEntry::TlsDesc(_) | GotEntry::TlsLd => 2,
        }
    }
}

/// Per-symbol table slots, indexed by `Symbol::aux_idx`.
#[derive(Clone, Copy)]
pub(crate) struct SymbolAux {
    pub(crate) got_idx: i32,
    pub(crate) gottp_idx: i32,
    pub(crate) tlsgd_idx: i32,
    pub(crate) tlsdesc_idx: i32,
    pub(crate) plt_idx: i32,
    pub(crate) pltgot_idx: i32,
    pub(crate) dynsym_idx: i32,
}

impl Default for SymbolAux {
    fn default() -> Self {
        SymbolAux {
            got_idx: -1,
            gottp_idx: -1,
            tlsgd_idx: -1,
            tlsdesc_idx: -1,
            plt_idx: -1,
            pltgot_idx: -1,
            dynsym_idx: -1,
        }
    }
}

/// Deduplicating string table builder for .dynstr / .strtab / .shstrtab.
#[derive(Default)]
pub(crate) struct StrTab {
    data: Vec<u8>,
    map: hashbrown::HashMap<Vec<u8>, u32>,
}

impl StrTab {
    pub(crate) fn new() -> StrTab {
        StrTab {
            data: vec![0],
            map: hashbrown::HashMap::new(),
        }
    }

    pub(crate) fn add(&mut self, s: &[u8]) -> u32 {
        if s.is_empty() {
            return 0;
        }
        if let Some(&offset) = self.map.get(s) {
            return offset;
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(s);
        self.data.push(0);
        self.map.insert(s.to_vec(), offset);
        offset
    }

    pub(crate) fn get(&self, s: &[u8]) -> u32 {
        if s.is_empty() {
            0
        } else {
            *self.map.get(s).expect("string was never added")
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// An entry of .dynsym together with everything needed to emit it.
pub(crate) struct DynSymEntry<'data> {
    pub(crate) sym: &'data Symbol<'data>,
    pub(crate) name_offset: u32,
    pub(crate) hash: u32,
}

/// Dynamic relocations produced while copying chunks. They're drained, sorted (RELATIVE
/// entries first, as glibc expects) and written into .rela.dyn after the parallel copy.
pub(crate) struct DynRelQueue {
    entries: Mutex<Vec<(u32, u64, u32, i64)>>, // (r_type, offset, dynsym, addend)
}

impl DynRelQueue {
    pub(crate) fn new() -> DynRelQueue {
        DynRelQueue {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, r_type: u32, offset: u64, dynsym: u32, addend: i64) {
        self.entries.lock().unwrap().push((r_type, offset, dynsym, addend));
    }

    pub(crate) fn into_sorted(self, relative_type: u32) -> Vec<(u32, u64, u32, i64)> {
        let mut entries = self.entries.into_inner().unwrap();
        entries.sort_unstable_by_key(|&(r_type, offset, sym, _)| {
            (r_type != relative_type, r_type, sym, offset)
        });
        entries
    }
}

/// Resolved address of a symbol. For imported functions with a PLT this is the PLT entry, which
/// serves as the function's address identity throughout the output.
pub(crate) fn sym_addr(link: &Link, sym: &Symbol) -> u64 {
    let core = sym.core.lock().unwrap();
    match core.place {
        SymbolPlace::Section(shndx) => {
            let Some(owner) = core.file else { return 0 };
            let obj = link.files[owner.as_usize()].as_object().unwrap();
            let Some(isec) = obj.sections[shndx as usize].as_ref() else {
                return 0;
            };
            if !isec.is_alive() || isec.output_section == crate::input_section::NO_OUTPUT {
                return 0;
            }
            let chunk_idx = link.osec_chunk[isec.output_section.0 as usize];
            if chunk_idx == u32::MAX {
                return 0;
            }
            link.chunks[chunk_idx as usize].shdr.sh_addr + isec.output_offset() + core.value
        }
        SymbolPlace::Fragment(frag) => {
            let chunk_idx = frag.parent.chunk_idx.load(Ordering::Relaxed);
            if chunk_idx == u32::MAX {
                return 0;
            }
            link.chunks[chunk_idx as usize].shdr.sh_addr + frag.get_offset() + core.value
        }
        SymbolPlace::Chunk(chunk_idx) => {
            link.chunks[chunk_idx as usize].shdr.sh_addr + core.value
        }
        SymbolPlace::Absolute => core.value,
        SymbolPlace::None => {
            // Copy-relocated data lives at its assigned slot in .bss / .bss.rel.ro.
            if sym.has_copyrel.load(Ordering::Relaxed) {
                let relro = sym.copyrel_readonly.load(Ordering::Relaxed);
                let value = core.value;
                drop(core);
                return link
                    .chunk_addr(ChunkKind::Copyrel { relro })
                    .unwrap_or(0)
                    + value;
            }
            drop(core);
            // Imported functions are identified by their PLT entry.
            plt_addr(link, sym).unwrap_or(0)
        }
    }
}

pub(crate) fn plt_addr(link: &Link, sym: &Symbol) -> Option<u64> {
    let aux_idx = sym.aux()?;
    let aux = &link.aux[aux_idx];
    let arch = link.machine.arch();
    if aux.plt_idx >= 0 {
        let plt = link.chunk_addr(ChunkKind::Plt)?;
        return Some(plt + arch.plt_header_size() + aux.plt_idx as u64 * arch.plt_entry_size());
    }
    if aux.pltgot_idx >= 0 {
        let pltgot = link.chunk_addr(ChunkKind::PltGot)?;
        return Some(pltgot + aux.pltgot_idx as u64 * arch.plt_entry_size());
    }
    None
}

fn got_slot_addr(link: &Link, idx: i32) -> u64 {
    if idx < 0 {
        return 0;
    }
    link.chunk_addr(ChunkKind::Got).unwrap_or(0) + idx as u64 * elf::GOT_ENTRY_SIZE
}

pub(crate) fn dynsym_index(link: &Link, sym: &Symbol) -> u32 {
    sym.aux()
        .map(|aux| link.aux[aux].dynsym_idx)
        .filter(|&idx| idx >= 0)
        .map_or(0, |idx| idx as u32)
}

/// Copies an input section's bytes into the output and applies its relocations against final
/// addresses. Relocations the scanner flagged as dynamic are emitted to the queue instead.
pub(crate) fn write_input_section(
    link: &Link,
    isec: &InputSection,
    chunk: &Chunk,
    out: &mut [u8],
    dynrels: &DynRelQueue,
) {
    if isec.is_bss() {
        return;
    }
    let offset = isec.output_offset() as usize;
    let size = isec.contents.len();
    out[offset..offset + size].copy_from_slice(isec.contents);

    let obj = link.files[isec.file.as_usize()].as_object().unwrap();
    let arch = link.machine.arch();
    let base = chunk.shdr.sh_addr + isec.output_offset();

    for (rel_idx, rel) in isec.rels.iter().enumerate() {
        let r_type = rel.r_type(LE, false);
        if r_type == arch.r_none() {
            continue;
        }
        let r_offset = rel.r_offset.get(LE);
        let p = base + r_offset;
        let loc = &mut out[offset + r_offset as usize..];

        let sym = obj.symbol_at(rel.r_sym(LE, false) as usize);

        let flags = isec.scan_flag(rel_idx);
        if flags & rel_flags::DYNREL != 0 {
            dynrels.push(
                arch.r_abs64(),
                p,
                dynsym_index(link, sym),
                rel.r_addend.get(LE),
            );
            elf::write_u64(loc, 0);
            continue;
        }

        // Resolve S and A, diverting through the attached fragment if the splitter rewrote
        // this relocation.
        let (s, a) = match isec.fragment_for_rel(rel_idx) {
            Some(fr) => {
                let chunk_idx = fr.frag.parent.chunk_idx.load(Ordering::Relaxed);
                let addr = if chunk_idx == u32::MAX {
                    0
                } else {
                    link.chunks[chunk_idx as usize].shdr.sh_addr + fr.frag.get_offset()
                };
                (addr, fr.addend)
            }
            None => (sym_addr(link, sym), rel.r_addend.get(LE)),
        };

        if flags & rel_flags::BASEREL != 0 {
            let value = s.wrapping_add_signed(a);
            dynrels.push(arch.r_relative(), p, 0, value as i64);
            elf::write_u64(loc, value);
            continue;
        }

        let aux = sym.aux().map(|idx| link.aux[idx]).unwrap_or_default();
        let args = ApplyArgs {
            loc,
            s,
            s_plt: plt_addr(link, sym).unwrap_or(s),
            a,
            p,
            got_slot: got_slot_addr(link, aux.got_idx),
            gottp_slot: got_slot_addr(link, aux.gottp_idx),
            tlsgd_slot: got_slot_addr(link, aux.tlsgd_idx),
            tlsld_slot: got_slot_addr(link, link.tlsld_got_idx),
            tlsdesc_slot: got_slot_addr(link, aux.tlsdesc_idx),
            got_base: link.chunk_addr(ChunkKind::GotPlt).or_else(|| link.chunk_addr(ChunkKind::Got)).unwrap_or(0),
            tp: link.tls_end,
            dtp: link.tls_begin,
        };
        if let Err(err) = arch.apply_reloc(r_type, args) {
            error::error(format_args!(
                "{}:({}) offset 0x{:x}: {err}",
                obj.name,
                String::from_utf8_lossy(isec.name),
                r_offset
            ));
        }
    }
}

/// Fills the GOT bytes and emits the dynamic relocations its entries need.
pub(crate) fn write_got(link: &Link, chunk: &Chunk, out: &mut [u8], dynrels: &DynRelQueue) {
    let arch = link.machine.arch();
    let mut idx = 0u64;

    for entry in &link.got_entries {
        let slot_addr = chunk.shdr.sh_addr + idx * elf::GOT_ENTRY_SIZE;
        let slot = &mut out[(idx * elf::GOT_ENTRY_SIZE) as usize..];
        match entry {
            GotEntry::Got(sym) => {
                let is_imported = sym.core.lock().unwrap().is_imported;
                let is_ifunc = link.sym_is_ifunc(sym);
                if is_imported {
                    dynrels.push(arch.r_glob_dat(), slot_addr, dynsym_index(link, sym), 0);
                } else if is_ifunc {
                    dynrels.push(arch.r_irelative(), slot_addr, 0, sym_addr(link, sym) as i64);
                } else {
                    let addr = sym_addr(link, sym);
                    elf::write_u64(slot, addr);
                    if link.is_pic {
                        dynrels.push(arch.r_relative(), slot_addr, 0, addr as i64);
                    }
                }
            }
            GotEntry::GotTp(sym) => {
                let core = sym.core.lock().unwrap();
                if core.is_imported {
                    drop(core);
                    dynrels.push(arch.r_tpoff(), slot_addr, dynsym_index(link, sym), 0);
                } else {
                    drop(core);
                    elf::write_u64(slot, sym_addr(link, sym).wrapping_sub(link.tls_end));
                }
            }
            GotEntry::TlsGd(sym) => {
                let core = sym.core.lock().unwrap();
                if core.is_imported || link.is_pic {
                    drop(core);
                    let dynsym = dynsym_index(link, sym);
                    dynrels.push(arch.r_dtpmod(), slot_addr, dynsym, 0);
                    dynrels.push(arch.r_dtpoff(), slot_addr + elf::GOT_ENTRY_SIZE, dynsym, 0);
                } else {
                    drop(core);
                    elf::write_u64(slot, 1); // the executable's own module id
                    elf::write_u64(
                        &mut slot[elf::GOT_ENTRY_SIZE as usize..],
                        sym_addr(link, sym).wrapping_sub(link.tls_begin),
                    );
                }
            }
            GotEntry::TlsDesc(sym) => {
                dynrels.push(arch.r_tlsdesc(), slot_addr, dynsym_index(link, sym), 0);
            }
            GotEntry::TlsLd => {
                if link.is_pic {
                    dynrels.push(arch.r_dtpmod(), slot_addr, 0, 0);
                } else {
                    elf::write_u64(slot, 1);
                }
            }
        }
        idx += entry.num_slots();
    }
}

pub(crate) fn write_gotplt(link: &Link, chunk: &Chunk, out: &mut [u8]) {
    // Slot 0 holds the address of .dynamic; slots 1 and 2 are filled by the loader.
    let dynamic = link.chunk_addr(ChunkKind::Dynamic).unwrap_or(0);
    elf::write_u64(out, dynamic);

    let arch = link.machine.arch();
    let plt = link.chunk_addr(ChunkKind::Plt).unwrap_or(0);
    for (i, _sym) in link.plt_syms.iter().enumerate() {
        // Each lazy slot initially points back into its own PLT entry so the first call lands
        // in the resolver.
        let entry_addr = plt + arch.plt_header_size() + i as u64 * arch.plt_entry_size();
        let slot = &mut out[(3 + i) * elf::GOT_ENTRY_SIZE as usize..];
        let initial = if arch.machine_id() == object::elf::EM_X86_64 {
            entry_addr + 6
        } else {
            plt
        };
        elf::write_u64(slot, initial);
    }
    let _ = chunk;
}

pub(crate) fn write_plt(link: &Link, chunk: &Chunk, out: &mut [u8]) {
    let arch = link.machine.arch();
    let gotplt = link.chunk_addr(ChunkKind::GotPlt).unwrap_or(0);
    arch.write_plt_header(out, gotplt, chunk.shdr.sh_addr);

    for i in 0..link.plt_syms.len() {
        let entry_offset = arch.plt_header_size() + i as u64 * arch.plt_entry_size();
        let slot_addr = gotplt + (3 + i as u64) * elf::GOT_ENTRY_SIZE;
        arch.write_plt_entry(
            &mut out[entry_offset as usize..],
            slot_addr,
            chunk.shdr.sh_addr + entry_offset,
            i as u32,
        );
    }
}

pub(crate) fn write_pltgot(link: &Link, chunk: &Chunk, out: &mut [u8]) {
    let arch = link.machine.arch();
    for (i, sym) in link.pltgot_syms.iter().enumerate() {
        let aux = &link.aux[sym.aux().unwrap()];
        let entry_offset = i as u64 * arch.plt_entry_size();
        arch.write_pltgot_entry(
            &mut out[entry_offset as usize..],
            got_slot_addr(link, aux.got_idx),
            chunk.shdr.sh_addr + entry_offset,
        );
    }
}

pub(crate) fn write_relplt(link: &Link, _chunk: &Chunk, out: &mut [u8]) {
    let arch = link.machine.arch();
    let gotplt = link.chunk_addr(ChunkKind::GotPlt).unwrap_or(0);
    for (i, sym) in link.plt_syms.iter().enumerate() {
        let rela: &mut Rela = object::from_bytes_mut(
            &mut out[i * elf::RELA_ENTRY_SIZE as usize..][..elf::RELA_ENTRY_SIZE as usize],
        )
        .unwrap()
        .0;
        let slot_addr = gotplt + (3 + i as u64) * elf::GOT_ENTRY_SIZE;
        rela.r_offset.set(LE, slot_addr);
        rela.r_info.set(
            LE,
            (u64::from(dynsym_index(link, sym)) << 32) | u64::from(arch.r_jump_slot()),
        );
        rela.r_addend.set(LE, 0);
    }
}

/// Copy relocations: each copied symbol gets an R_COPY at its assigned .bss / .bss.rel.ro slot.
pub(crate) fn write_copyrel(link: &Link, relro: bool, dynrels: &DynRelQueue) {
    let arch = link.machine.arch();
    let syms = if relro {
        &link.copyrel_relro_syms
    } else {
        &link.copyrel_syms
    };
    for sym in syms {
        dynrels.push(arch.r_copy(), sym_addr(link, sym), dynsym_index(link, sym), 0);
    }
}

pub(crate) fn write_dynsym(link: &Link, out: &mut [u8]) {
    for (i, entry) in link.dynsyms.iter().enumerate() {
        let esym: &mut elf::Sym = object::from_bytes_mut(
            &mut out[(i + 1) * elf::SYMTAB_ENTRY_SIZE as usize..][..elf::SYMTAB_ENTRY_SIZE as usize],
        )
        .unwrap()
        .0;
        let sym = entry.sym;
        let core = sym.core.lock().unwrap();

        esym.st_name.set(LE, entry.name_offset);
        let (st_type, st_size) = link.sym_type_and_size(sym, &core);
        let bind = if core.is_weak {
            object::elf::STB_WEAK
        } else {
            object::elf::STB_GLOBAL
        };
        esym.st_info = (bind << 4) | (st_type & 0xf);
        esym.st_other = sym.get_visibility();
        drop(core);

        if sym.has_copyrel.load(Ordering::Relaxed) {
            let addr = sym_addr(link, sym);
            esym.st_shndx.set(LE, link.shndx_for_addr(addr));
            esym.st_value.set(LE, addr);
        } else if sym.core.lock().unwrap().is_imported {
            esym.st_shndx.set(LE, object::elf::SHN_UNDEF);
            esym.st_value.set(LE, 0);
        } else {
            let addr = sym_addr(link, sym);
            esym.st_shndx.set(LE, link.shndx_for_addr(addr));
            esym.st_value.set(LE, addr);
        }
        esym.st_size.set(LE, st_size);
    }
}

/// The SysV hash table: one bucket array and one chain array over the dynamic symbols.
pub(crate) fn write_hash(link: &Link, out: &mut [u8]) {
    let num_syms = link.dynsyms.len() + 1;
    let nbuckets = (num_syms as u32).max(1);
    elf::write_u32(out, nbuckets);
    elf::write_u32(&mut out[4..], num_syms as u32);

    let (buckets, chains) = out[8..].split_at_mut(nbuckets as usize * 4);
    for (i, entry) in link.dynsyms.iter().enumerate() {
        let dynsym_idx = i as u32 + 1;
        let hash = elf::elf_hash(entry.sym.name) % nbuckets;
        let head = elf::read_u32(&buckets[hash as usize * 4..]);
        elf::write_u32(&mut chains[dynsym_idx as usize * 4..], head);
        elf::write_u32(&mut buckets[hash as usize * 4..], dynsym_idx);
    }
}

pub(crate) const GNU_HASH_BLOOM_SHIFT: u32 = 26;

pub(crate) fn gnu_hash_nbuckets(num_exported: usize) -> u32 {
    ((num_exported + 1) as u32).div_ceil(8).max(1)
}

pub(crate) fn write_gnu_hash(link: &Link, out: &mut [u8]) {
    let num_exported = link.num_exported_dynsyms;
    let symoffset = link.dynsyms.len() + 1 - num_exported;
    let nbuckets = gnu_hash_nbuckets(num_exported);
    let nbloom = 1u32;

    elf::write_u32(out, nbuckets);
    elf::write_u32(&mut out[4..], symoffset as u32);
    elf::write_u32(&mut out[8..], nbloom);
    elf::write_u32(&mut out[12..], GNU_HASH_BLOOM_SHIFT);

    let (bloom, rest) = out[16..].split_at_mut(8 * nbloom as usize);
    let (buckets, chains) = rest.split_at_mut(nbuckets as usize * 4);

    let mut bloom_word = 0u64;
    let exported = &link.dynsyms[link.dynsyms.len() - num_exported..];
    for entry in exported {
        bloom_word |= 1 << (entry.hash % 64);
        bloom_word |= 1 << ((entry.hash >> GNU_HASH_BLOOM_SHIFT) % 64);
    }
    elf::write_u64(bloom, bloom_word);

    for (i, entry) in exported.iter().enumerate() {
        let bucket = (entry.hash % nbuckets) as usize;
        if elf::read_u32(&buckets[bucket * 4..]) == 0 {
            elf::write_u32(&mut buckets[bucket * 4..], (symoffset + i) as u32);
        }
        // Chain values: hash with the low bit marking end-of-chain.
        let is_last = i + 1 == exported.len()
            || (exported[i + 1].hash % nbuckets) != entry.hash % nbuckets;
        elf::write_u32(&mut chains[i * 4..], (entry.hash & !1) | u32::from(is_last));
    }
}

pub(crate) fn write_versym(link: &Link, out: &mut [u8]) {
    for (i, entry) in link.dynsyms.iter().enumerate() {
        let versym = link.dynsym_versym[i];
        out[(i + 1) * 2..(i + 1) * 2 + 2].copy_from_slice(&versym.to_le_bytes());
    }
}

pub(crate) fn write_verneed(link: &Link, out: &mut [u8]) {
    out[..link.verneed_bytes.len()].copy_from_slice(&link.verneed_bytes);
}

/// .eh_frame: leader CIEs and the FDEs of live sections, with the CIE-pointer fields rewritten
/// and relocations applied against final addresses.
pub(crate) fn write_eh_frame(link: &Link, chunk: &Chunk, out: &mut [u8], dynrels: &DynRelQueue) {
    for file in &link.files {
        let Some(obj) = file.as_object() else { continue };
        let Some(ehframe_shndx) = obj.ehframe_shndx else {
            continue;
        };
        let ehframe = obj.sections[ehframe_shndx as usize].as_ref().unwrap();
        let contents = ehframe.contents;
        let rels = ehframe.rels;

        for cie in &obj.cies {
            if !cie.is_leader {
                continue;
            }
            let size = eh_frame::record_size(contents, cie.input_offset) as usize;
            let out_off = cie.output_offset as usize;
            out[out_off..out_off + size]
                .copy_from_slice(&contents[cie.input_offset as usize..][..size]);
            apply_eh_frame_rels(
                link,
                obj,
                chunk,
                out,
                rels,
                cie.rel_begin,
                cie.rel_end,
                cie.input_offset,
                cie.output_offset,
                dynrels,
            );
        }

        for fde in &obj.fdes {
            if !fde.is_emitted() {
                continue;
            }
            let size = eh_frame::record_size(contents, fde.input_offset) as usize;
            let out_off = fde.output_offset as usize;
            out[out_off..out_off + size]
                .copy_from_slice(&contents[fde.input_offset as usize..][..size]);

            // Rewrite the CIE pointer: distance from this field back to the (leader) CIE.
            let cie = &obj.cies[fde.cie_idx as usize];
            let cie_pointer = (out_off as u32 + 4) - cie.output_offset;
            elf::write_u32(&mut out[out_off + 4..], cie_pointer);

            apply_eh_frame_rels(
                link,
                obj,
                chunk,
                out,
                rels,
                fde.rel_begin,
                fde.rel_end,
                fde.input_offset,
                fde.output_offset,
                dynrels,
            );
        }
    }

    // Trailing zero-length terminator record.
    let len = out.len();
    out[len - 4..].fill(0);
}

fn apply_eh_frame_rels(
    link: &Link,
    obj: &ObjectFile,
    chunk: &Chunk,
    out: &mut [u8],
    rels: &[Rela],
    rel_begin: u32,
    rel_end: u32,
    input_offset: u32,
    output_offset: u32,
    _dynrels: &DynRelQueue,
) {
    let arch = link.machine.arch();
    for rel in &rels[rel_begin as usize..rel_end as usize] {
        let r_type = rel.r_type(LE, false);
        if r_type == arch.r_none() {
            continue;
        }
        let offset_in_record = rel.r_offset.get(LE) as u32 - input_offset;
        let out_off = output_offset + offset_in_record;
        let p = chunk.shdr.sh_addr + u64::from(out_off);
        let sym = obj.symbol_at(rel.r_sym(LE, false) as usize);
        let s = sym_addr(link, sym);
        let aux = sym.aux().map(|idx| link.aux[idx]).unwrap_or_default();
        let args = ApplyArgs {
            loc: &mut out[out_off as usize..],
            s,
            s_plt: plt_addr(link, sym).unwrap_or(s),
            a: rel.r_addend.get(LE),
            p,
            got_slot: got_slot_addr(link, aux.got_idx),
            gottp_slot: got_slot_addr(link, aux.gottp_idx),
            tlsgd_slot: got_slot_addr(link, aux.tlsgd_idx),
            tlsld_slot: got_slot_addr(link, link.tlsld_got_idx),
            tlsdesc_slot: got_slot_addr(link, aux.tlsdesc_idx),
            got_base: link.chunk_addr(ChunkKind::GotPlt).unwrap_or(0),
            tp: link.tls_end,
            dtp: link.tls_begin,
        };
        if let Err(err) = arch.apply_reloc(r_type, args) {
            error::error(format_args!("{}: .eh_frame: {err}", obj.name));
        }
    }
}

/// .eh_frame_hdr: the runtime binary-search table of (PC, FDE) pairs.
pub(crate) fn write_eh_frame_hdr(link: &Link, chunk: &Chunk, out: &mut [u8]) {
    use zerocopy::IntoBytes as _;

    let eh_frame_addr = link.chunk_addr(ChunkKind::EhFrame).unwrap_or(0);
    let hdr_addr = chunk.shdr.sh_addr;

    let mut entries: Vec<elf::EhFrameHdrEntry> = Vec::new();
    for file in &link.files {
        let Some(obj) = file.as_object() else { continue };
        let Some(ehframe_shndx) = obj.ehframe_shndx else {
            continue;
        };
        let rels = obj.sections[ehframe_shndx as usize].as_ref().unwrap().rels;
        for fde in &obj.fdes {
            if !fde.is_emitted() {
                continue;
            }
            // The first relocation is the function pointer the FDE covers.
            let rel = &rels[fde.rel_begin as usize];
            let sym = obj.symbol_at(rel.r_sym(LE, false) as usize);
            let pc = sym_addr(link, sym).wrapping_add_signed(rel.r_addend.get(LE));
            entries.push(elf::EhFrameHdrEntry {
                frame_ptr: pc.wrapping_sub(hdr_addr) as i32,
                frame_info_ptr: (eh_frame_addr + u64::from(fde.output_offset))
                    .wrapping_sub(hdr_addr) as i32,
            });
        }
    }
    entries.sort_unstable_by_key(|entry| entry.frame_ptr);

    let header = elf::EhFrameHdr {
        version: 1,
        frame_pointer_encoding: 0x1b, // DW_EH_PE_pcrel | sdata4
        count_encoding: 0x03,         // DW_EH_PE_udata4
        table_encoding: 0x3b,         // DW_EH_PE_datarel | sdata4
        frame_pointer: eh_frame_addr.wrapping_sub(hdr_addr + 4) as i32,
        entry_count: entries.len() as u32,
    };
    out[..size_of::<elf::EhFrameHdr>()].copy_from_slice(header.as_bytes());
    out[size_of::<elf::EhFrameHdr>()..][..entries.len() * 8]
        .copy_from_slice(entries.as_bytes());
}

/// Writes one file's contribution to .symtab/.strtab at its precomputed offsets.
pub(crate) fn write_symtab(
    link: &Link,
    obj: &ObjectFile,
    symtab_out: &mut [u8],
    strtab_out: &mut [u8],
) {
    let mut strtab_off = obj.strtab_offset as usize;
    let mut symtab_off = obj.local_symtab_offset as usize;

    let mut write_one = |sym: &Symbol,
                         symtab_off: &mut usize,
                         strtab_off: &mut usize| {
        let (st_type, st_size, is_weak, is_undef, is_abs, is_local) = {
            let core = sym.core.lock().unwrap();
            let (st_type, st_size) = link.sym_type_and_size(sym, &core);
            (
                st_type,
                st_size,
                core.is_weak,
                matches!(core.place, SymbolPlace::None) && core.is_imported,
                matches!(core.place, SymbolPlace::Absolute),
                core.file == Some(obj.file_id) && (core.sym_idx as usize) < obj.first_global,
            )
        };
        let addr = if is_undef { 0 } else { sym_addr(link, sym) };

        let esym: &mut elf::Sym = object::from_bytes_mut(
            &mut symtab_out[*symtab_off..*symtab_off + elf::SYMTAB_ENTRY_SIZE as usize],
        )
        .unwrap()
        .0;
        *symtab_off += elf::SYMTAB_ENTRY_SIZE as usize;

        let bind = if is_local {
            object::elf::STB_LOCAL
        } else if is_weak {
            object::elf::STB_WEAK
        } else {
            object::elf::STB_GLOBAL
        };
        esym.st_name.set(LE, *strtab_off as u32);
        esym.st_info = (bind << 4) | (st_type & 0xf);
        esym.st_other = sym.get_visibility();
        let shndx = if is_undef {
            object::elf::SHN_UNDEF
        } else if is_abs {
            object::elf::SHN_ABS
        } else {
            link.shndx_for_addr(addr)
        };
        esym.st_shndx.set(LE, shndx);
        if st_type == object::elf::STT_TLS {
            esym.st_value.set(LE, addr.wrapping_sub(link.tls_begin));
        } else {
            esym.st_value.set(LE, addr);
        }
        esym.st_size.set(LE, st_size);

        strtab_out[*strtab_off..*strtab_off + sym.name.len()].copy_from_slice(sym.name);
        strtab_out[*strtab_off + sym.name.len()] = 0;
        *strtab_off += sym.name.len() + 1;
    };

    for i in 1..obj.first_global.min(obj.locals.len()) {
        let sym = obj.locals[i];
        if sym.write_to_symtab.load(Ordering::Relaxed) {
            write_one(sym, &mut symtab_off, &mut strtab_off);
        }
    }

    symtab_off = obj.global_symtab_offset as usize;
    for i in obj.first_global..obj.esyms.len() {
        let sym = obj.symbol_at(i);
        let owned = sym.core.lock().unwrap().file == Some(obj.file_id);
        if owned && sym.write_to_symtab.load(Ordering::Relaxed) {
            write_one(sym, &mut symtab_off, &mut strtab_off);
        }
    }
}

pub(crate) fn write_build_id_note(link: &Link, out: &mut [u8]) {
    // Header now, digest later: the hash is computed over the finished image and patched in.
    let digest_len = link.build_id_size as u32;
    elf::write_u32(out, 4);
    elf::write_u32(&mut out[4..], digest_len);
    elf::write_u32(&mut out[8..], object::elf::NT_GNU_BUILD_ID);
    out[12..16].copy_from_slice(b"GNU\0");
}

pub(crate) fn write_note_property(link: &Link, out: &mut [u8]) {
    elf::write_u32(out, 4);
    elf::write_u32(&mut out[4..], 16);
    elf::write_u32(&mut out[8..], object::elf::NT_GNU_PROPERTY_TYPE_0);
    out[12..16].copy_from_slice(b"GNU\0");
    elf::write_u32(&mut out[16..], object::elf::GNU_PROPERTY_X86_FEATURE_1_AND);
    elf::write_u32(&mut out[20..], 4);
    elf::write_u32(&mut out[24..], link.combined_features);
}

pub(crate) fn write_dynamic(link: &Link, out: &mut [u8]) -> Result {
    let mut offset = 0usize;
    let mut push = |tag: u32, value: u64| {
        let entry: &mut elf::DynamicEntry =
            object::from_bytes_mut(&mut out[offset..offset + 16]).unwrap().0;
        entry.d_tag.set(LE, u64::from(tag));
        entry.d_val.set(LE, value);
        offset += 16;
    };

    for &needed in &link.dt_needed_offsets {
        push(object::elf::DT_NEEDED, u64::from(needed));
    }
    if let Some(soname) = link.dt_soname_offset {
        push(object::elf::DT_SONAME, u64::from(soname));
    }
    if let Some(rpath) = link.dt_rpath_offset {
        push(object::elf::DT_RUNPATH, u64::from(rpath));
    }
    if let Some(addr) = link.chunk_addr_sized(ChunkKind::RelDyn) {
        push(object::elf::DT_RELA, addr.0);
        push(object::elf::DT_RELASZ, addr.1);
        push(object::elf::DT_RELAENT, elf::RELA_ENTRY_SIZE);
    }
    if let Some(addr) = link.chunk_addr_sized(ChunkKind::RelPlt) {
        push(object::elf::DT_JMPREL, addr.0);
        push(object::elf::DT_PLTRELSZ, addr.1);
        push(object::elf::DT_PLTREL, u64::from(object::elf::DT_RELA));
    }
    if let Some(addr) = link.chunk_addr(ChunkKind::GotPlt) {
        push(object::elf::DT_PLTGOT, addr);
    }
    if let Some((addr, size)) = link.chunk_addr_sized(ChunkKind::Dynsym) {
        push(object::elf::DT_SYMTAB, addr);
        push(object::elf::DT_SYMENT, elf::SYMTAB_ENTRY_SIZE);
        let _ = size;
    }
    if let Some((addr, size)) = link.chunk_addr_sized(ChunkKind::Dynstr) {
        push(object::elf::DT_STRTAB, addr);
        push(object::elf::DT_STRSZ, size);
    }
    if let Some(addr) = link.chunk_addr(ChunkKind::Hash) {
        push(object::elf::DT_HASH, addr);
    }
    if let Some(addr) = link.chunk_addr(ChunkKind::GnuHash) {
        push(object::elf::DT_GNU_HASH, addr);
    }
    if let Some(addr) = link.chunk_addr(ChunkKind::Versym) {
        push(object::elf::DT_VERSYM, addr);
    }
    if let Some(addr) = link.chunk_addr(ChunkKind::Verneed) {
        push(object::elf::DT_VERNEED, addr);
        push(object::elf::DT_VERNEEDNUM, link.verneed_count);
    }
    if let Some((addr, size)) = link.init_array_range {
        push(object::elf::DT_INIT_ARRAY, addr);
        push(object::elf::DT_INIT_ARRAYSZ, size);
    }
    if let Some((addr, size)) = link.fini_array_range {
        push(object::elf::DT_FINI_ARRAY, addr);
        push(object::elf::DT_FINI_ARRAYSZ, size);
    }
    if let Some(addr) = link.init_addr {
        push(object::elf::DT_INIT, addr);
    }
    if let Some(addr) = link.fini_addr {
        push(object::elf::DT_FINI, addr);
    }
    push(object::elf::DT_DEBUG, 0);

    let mut flags = 0u64;
    let mut flags1 = 0u64;
    if link.z_now {
        flags |= u64::from(object::elf::DF_BIND_NOW);
        flags1 |= u64::from(object::elf::DF_1_NOW);
    }
    if link.z_nodelete {
        flags1 |= u64::from(object::elf::DF_1_NODELETE);
    }
    if link.has_textrel {
        flags |= u64::from(object::elf::DF_TEXTREL);
    }
    if flags != 0 {
        push(object::elf::DT_FLAGS, flags);
    }
    if flags1 != 0 {
        push(object::elf::DT_FLAGS_1, flags1);
    }
    push(object::elf::DT_NULL, 0);
    push(object::elf::DT_NULL, 0);

    (offset <= out.len())
        .then_some(())
        .context("dynamic section overflow")
}

/// Number of dynamic entries `write_dynamic` will produce, for sizing.
pub(crate) fn dynamic_entry_count(link: &Link) -> u64 {
    let mut n = 0u64;
    n += link.dt_needed_offsets.len() as u64;
    n += u64::from(link.dt_soname_offset.is_some());
    n += u64::from(link.dt_rpath_offset.is_some());
    n += 3 * u64::from(link.chunk_addr_sized(ChunkKind::RelDyn).is_some());
    n += 3 * u64::from(link.chunk_addr_sized(ChunkKind::RelPlt).is_some());
    n += u64::from(link.chunk_addr(ChunkKind::GotPlt).is_some());
    n += 2 * u64::from(link.chunk_addr_sized(ChunkKind::Dynsym).is_some());
    n += 2 * u64::from(link.chunk_addr_sized(ChunkKind::Dynstr).is_some());
    n += u64::from(link.chunk_addr(ChunkKind::Hash).is_some());
    n += u64::from(link.chunk_addr(ChunkKind::GnuHash).is_some());
    n += u64::from(link.chunk_addr(ChunkKind::Versym).is_some());
    n += 2 * u64::from(link.chunk_addr(ChunkKind::Verneed).is_some());
    n += 2 * u64::from(link.init_array_range.is_some());
    n += 2 * u64::from(link.fini_array_range.is_some());
    n += u64::from(link.init_addr.is_some());
    n += u64::from(link.fini_addr.is_some());
    n += 1; // DT_DEBUG
    n += 2; // possible DT_FLAGS / DT_FLAGS_1
    n += 2; // terminators
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strtab_dedup() {
        let mut strtab = StrTab::new();
        let a = strtab.add(b"libc.so.6");
        let b = strtab.add(b"malloc");
        let c = strtab.add(b"libc.so.6");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(strtab.add(b""), 0);
        assert_eq!(&strtab.bytes()[a as usize..a as usize + 9], b"libc.so.6");
        assert_eq!(strtab.bytes()[0], 0);
    }

    #[test]
    fn test_dynrel_queue_orders_relative_first() {
        let queue = DynRelQueue::new();
        queue.push(1, 0x30, 5, 0); // symbolic
        queue.push(8, 0x20, 0, 7); // relative (x86-64 R_X86_64_RELATIVE == 8)
        queue.push(8, 0x10, 0, 3);
        let sorted = queue.into_sorted(8);
        assert_eq!(sorted[0].0, 8);
        assert_eq!(sorted[1].0, 8);
        assert_eq!(sorted[0].1, 0x10);
        assert_eq!(sorted[2].0, 1);
    }

    #[test]
    fn test_got_entry_slots() {
        let sym = Symbol::new(b"x");
        assert_eq!(GotEntry::Got(&sym).num_slots(), 1);
        assert_eq!(GotEntry::TlsGd(&sym).num_slots(), 2);
        assert_eq!(GotEntry::TlsLd.num_slots(), 2);
    }
}
