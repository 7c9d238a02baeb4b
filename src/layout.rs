//! Output layout: collecting and ranking chunks, sizing the synthetic ones, assigning virtual
//! addresses congruent (mod page size) to file offsets, and producing the ELF, program and
//! section headers.

use crate::context::Context;
use crate::context::OutputSecId;
use crate::eh_frame;
use crate::elf;
use crate::error::Result;
use crate::object_file::LinkFile;
use crate::output_chunks::Chunk;
use crate::output_chunks::ChunkKind;
use crate::output_chunks::DynSymEntry;
use crate::output_chunks::GotEntry;
use crate::output_chunks::dynamic_entry_count;
use crate::output_chunks::gnu_hash_nbuckets;
use crate::passes::Link;
use crate::symbol::NeedsFlags;
use crate::symbol::SymbolPlace;
use anyhow::bail;
use object::LittleEndian as LE;
use object::read::elf::Sym as _;
use std::sync::atomic::Ordering;

/// The chunk order: headers, .interp, notes, RO data, code, tdata, tbss, RELRO data/bss,
/// writable data/bss, non-alloc, section header table.
pub(crate) fn section_rank(ctx: &Context, chunk: &Chunk) -> i64 {
    match chunk.kind {
        ChunkKind::Ehdr => return -4,
        ChunkKind::Phdr => return -3,
        ChunkKind::Interp => return -2,
        ChunkKind::Shdr => return 1 << 6,
        _ => {}
    }

    let sh_type = chunk.shdr.sh_type;
    let sh_flags = chunk.shdr.sh_flags;

    if sh_type == object::elf::SHT_NOTE && sh_flags & u64::from(object::elf::SHF_ALLOC) != 0 {
        return -1;
    }
    if sh_flags & u64::from(object::elf::SHF_ALLOC) == 0 {
        return 1 << 5;
    }

    let writable = sh_flags & u64::from(object::elf::SHF_WRITE) != 0;
    let exec = sh_flags & u64::from(object::elf::SHF_EXECINSTR) != 0;
    let tls = chunk.is_tls();
    let relro = chunk.is_relro(ctx.args.z_relro);
    let is_bss = sh_type == object::elf::SHT_NOBITS;

    ((writable as i64) << 4)
        | ((exec as i64) << 3)
        | ((!tls as i64) << 2)
        | ((!relro as i64) << 1)
        | is_bss as i64
}

/// Creates the chunk list: output sections with members, merged sections with bytes, and every
/// synthetic chunk this link needs. Sizes are filled in by `finalize_chunk_sizes`.
pub(crate) fn create_chunks<'data>(ctx: &Context<'data>, link: &mut Link<'data>) {
    crate::timing_phase!("Create chunks");

    let mut chunks: Vec<Chunk<'data>> = Vec::new();

    // The ELF and program headers are mapped as part of the first loadable segment; the
    // section header table trails the file unmapped.
    let mut ehdr = Chunk::new(b"", ChunkKind::Ehdr);
    ehdr.shdr.sh_flags = u64::from(object::elf::SHF_ALLOC);
    ehdr.shdr.sh_addralign = 8;
    chunks.push(ehdr);
    let mut phdr = Chunk::new(b"", ChunkKind::Phdr);
    phdr.shdr.sh_flags = u64::from(object::elf::SHF_ALLOC);
    phdr.shdr.sh_addralign = 8;
    chunks.push(phdr);
    let mut shdr_chunk = Chunk::new(b"", ChunkKind::Shdr);
    shdr_chunk.shdr.sh_addralign = 8;
    chunks.push(shdr_chunk);

    link.osec_chunk = vec![u32::MAX; link.osec_members.len()];
    let mut regular: Vec<(usize, Chunk<'data>)> = Vec::new();
    for (osec_idx, members) in link.osec_members.iter().enumerate() {
        if members.is_empty() {
            continue;
        }
        let info = ctx.output_section_info(OutputSecId(osec_idx as u32));
        let (size, align) = link.osec_sizes[osec_idx];
        let mut chunk = Chunk {
            name: info.name,
            shdr: Default::default(),
            kind: ChunkKind::Output(OutputSecId(osec_idx as u32)),
            shndx: 0,
            new_page: false,
        };
        chunk.shdr.sh_type = info.sh_type;
        chunk.shdr.sh_flags = info.sh_flags;
        chunk.shdr.sh_size = size;
        chunk.shdr.sh_addralign = align;
        regular.push((osec_idx, chunk));
    }
    // Parallel binning produced these in registry order already, but sort by name for a
    // deterministic section table.
    regular.sort_by(|a, b| {
        (a.1.name, a.1.shdr.sh_type, a.1.shdr.sh_flags)
            .cmp(&(b.1.name, b.1.shdr.sh_type, b.1.shdr.sh_flags))
    });
    for (_osec_idx, chunk) in regular {
        chunks.push(chunk);
    }

    for (merged_idx, merged) in link.merged.iter().enumerate() {
        let size = merged.size.load(Ordering::Relaxed);
        if size == 0 {
            continue;
        }
        let mut chunk = Chunk {
            name: merged.name,
            shdr: Default::default(),
            kind: ChunkKind::Merged(merged_idx as u32),
            shndx: 0,
            new_page: false,
        };
        chunk.shdr.sh_type = merged.sh_type;
        chunk.shdr.sh_flags = merged.sh_flags;
        chunk.shdr.sh_size = size;
        chunk.shdr.sh_addralign = merged.alignment.load(Ordering::Relaxed);
        chunks.push(chunk);
    }

    let alloc = u64::from(object::elf::SHF_ALLOC);
    let write = u64::from(object::elf::SHF_WRITE);
    let exec = u64::from(object::elf::SHF_EXECINSTR);

    let mut synthetic = |name: &'static [u8],
                         kind: ChunkKind,
                         sh_type: u32,
                         sh_flags: u64,
                         sh_addralign: u64,
                         sh_entsize: u64| {
        let mut chunk = Chunk::new(name, kind);
        chunk.shdr.sh_type = sh_type;
        chunk.shdr.sh_flags = sh_flags;
        chunk.shdr.sh_addralign = sh_addralign;
        chunk.shdr.sh_entsize = sh_entsize;
        chunks.push(chunk);
    };

    if !ctx.args.shared && !ctx.args.is_static && ctx.args.interpreter().is_some() {
        synthetic(b".interp", ChunkKind::Interp, object::elf::SHT_PROGBITS, alloc, 1, 0);
    }
    synthetic(b".got", ChunkKind::Got, object::elf::SHT_PROGBITS, alloc | write, 8, 8);
    synthetic(b".got.plt", ChunkKind::GotPlt, object::elf::SHT_PROGBITS, alloc | write, 8, 8);
    synthetic(b".plt", ChunkKind::Plt, object::elf::SHT_PROGBITS, alloc | exec, 16, 16);
    synthetic(b".plt.got", ChunkKind::PltGot, object::elf::SHT_PROGBITS, alloc | exec, 16, 16);
    synthetic(b".rela.dyn", ChunkKind::RelDyn, object::elf::SHT_RELA, alloc, 8, elf::RELA_ENTRY_SIZE);
    synthetic(b".rela.plt", ChunkKind::RelPlt, object::elf::SHT_RELA, alloc, 8, elf::RELA_ENTRY_SIZE);
    if link.needs_dynamic {
        synthetic(b".dynamic", ChunkKind::Dynamic, object::elf::SHT_DYNAMIC, alloc | write, 8, 16);
        synthetic(b".dynsym", ChunkKind::Dynsym, object::elf::SHT_DYNSYM, alloc, 8, elf::SYMTAB_ENTRY_SIZE);
        synthetic(b".dynstr", ChunkKind::Dynstr, object::elf::SHT_STRTAB, alloc, 1, 0);
        if ctx.args.hash_style_sysv {
            synthetic(b".hash", ChunkKind::Hash, object::elf::SHT_HASH, alloc, 4, 4);
        }
        if ctx.args.hash_style_gnu {
            synthetic(b".gnu.hash", ChunkKind::GnuHash, object::elf::SHT_GNU_HASH, alloc, 8, 0);
        }
        synthetic(b".gnu.version", ChunkKind::Versym, object::elf::SHT_GNU_VERSYM, alloc, 2, 2);
        synthetic(b".gnu.version_r", ChunkKind::Verneed, object::elf::SHT_GNU_VERNEED, alloc, 8, 0);
    }
    synthetic(b".bss", ChunkKind::Copyrel { relro: false }, object::elf::SHT_NOBITS, alloc | write, 64, 0);
    synthetic(b".bss.rel.ro", ChunkKind::Copyrel { relro: true }, object::elf::SHT_NOBITS, alloc | write, 64, 0);
    synthetic(b".note.gnu.property", ChunkKind::NoteProperty, object::elf::SHT_NOTE, alloc, 8, 0);
    if ctx.args.build_id != crate::args::BuildIdKind::None {
        synthetic(b".note.gnu.build-id", ChunkKind::BuildId, object::elf::SHT_NOTE, alloc, 4, 0);
    }
    synthetic(b".eh_frame", ChunkKind::EhFrame, object::elf::SHT_PROGBITS, alloc, 8, 0);
    if ctx.args.eh_frame_hdr {
        synthetic(b".eh_frame_hdr", ChunkKind::EhFrameHdr, object::elf::SHT_PROGBITS, alloc, 4, 0);
    }
    if !ctx.args.strip_all {
        synthetic(b".symtab", ChunkKind::Symtab, object::elf::SHT_SYMTAB, 0, 8, elf::SYMTAB_ENTRY_SIZE);
        synthetic(b".strtab", ChunkKind::Strtab, object::elf::SHT_STRTAB, 0, 1, 0);
    }
    synthetic(b".shstrtab", ChunkKind::Shstrtab, object::elf::SHT_STRTAB, 0, 1, 0);

    link.chunks = chunks;
}

/// CIE deduplication and FDE placement: identical CIEs across all files collapse into one
/// emitted copy; FDEs for dead sections are dropped.
fn finalize_eh_frame<'data>(link: &mut Link<'data>) -> u64 {
    let mut offset = 0u32;
    let mut cie_map: hashbrown::HashMap<Vec<u8>, u32> = hashbrown::HashMap::new();
    let mut any = false;

    let files = std::mem::take(&mut link.files);
    let mut files = files;
    for file in &mut files {
        let LinkFile::Object(obj) = file else { continue };
        if !obj.is_alive.load(Ordering::Relaxed) {
            continue;
        }
        let Some(ehframe_shndx) = obj.ehframe_shndx else {
            continue;
        };
        any = true;
        let (contents, rels) = {
            let isec = obj.sections[ehframe_shndx as usize].as_ref().unwrap();
            (isec.contents, isec.rels)
        };

        // A CIE's identity is its bytes plus what its relocations resolve to.
        let mut keys: Vec<Vec<u8>> = Vec::with_capacity(obj.cies.len());
        for cie in &obj.cies {
            let size = eh_frame::record_size(contents, cie.input_offset);
            let mut key = contents[cie.input_offset as usize..][..size as usize].to_vec();
            for rel in &rels[cie.rel_begin as usize..cie.rel_end as usize] {
                let sym = obj.symbol_at(rel.r_sym(LE, false) as usize);
                key.extend_from_slice(&rel.r_type(LE, false).to_le_bytes());
                key.extend_from_slice(&(rel.r_offset.get(LE) - u64::from(cie.input_offset)).to_le_bytes());
                key.extend_from_slice(&rel.r_addend.get(LE).to_le_bytes());
                key.extend_from_slice(sym.name);
                key.push(0);
            }
            keys.push(key);
        }
        for (cie, key) in obj.cies.iter_mut().zip(keys) {
            match cie_map.entry(key) {
                hashbrown::hash_map::Entry::Occupied(entry) => {
                    cie.is_leader = false;
                    cie.output_offset = *entry.get();
                }
                hashbrown::hash_map::Entry::Vacant(entry) => {
                    cie.is_leader = true;
                    cie.output_offset = offset;
                    entry.insert(offset);
                    offset += eh_frame::record_size(contents, cie.input_offset);
                }
            }
        }

        // An FDE survives if the section it covers survived.
        let mut emit: Vec<bool> = Vec::with_capacity(obj.fdes.len());
        for fde in &obj.fdes {
            let rel = &rels[fde.rel_begin as usize];
            let sym_idx = rel.r_sym(LE, false) as usize;
            let alive = obj
                .esyms
                .get(sym_idx)
                .and_then(|esym| obj.get_section(esym, sym_idx))
                .is_some_and(|isec| isec.is_alive());
            emit.push(alive);
        }
        for (fde, emit) in obj.fdes.iter_mut().zip(emit) {
            if emit {
                fde.output_offset = offset;
                offset += eh_frame::record_size(contents, fde.input_offset);
            } else {
                fde.output_offset = u32::MAX;
            }
        }
    }
    link.files = files;

    if !any {
        return 0;
    }
    u64::from(offset) + 4
}

fn count_emitted_fdes(link: &Link) -> u64 {
    link.files
        .iter()
        .filter_map(|f| f.as_object())
        .map(|obj| obj.fdes.iter().filter(|fde| fde.is_emitted()).count() as u64)
        .sum()
}

/// How many .rela.dyn entries the writers will emit. Must agree exactly with `write_got`,
/// `write_copyrel` and `write_input_section`.
fn count_dynrels(link: &Link) -> u64 {
    let mut n = 0u64;

    for entry in &link.got_entries {
        match entry {
            GotEntry::Got(sym) => {
                let is_imported = sym.core.lock().unwrap().is_imported;
                if is_imported || link.sym_is_ifunc(sym) || link.is_pic {
                    n += 1;
                }
            }
            GotEntry::GotTp(sym) => {
                if sym.core.lock().unwrap().is_imported {
                    n += 1;
                }
            }
            GotEntry::TlsGd(sym) => {
                if sym.core.lock().unwrap().is_imported || link.is_pic {
                    n += 2;
                }
            }
            GotEntry::TlsDesc(_) => n += 1,
            GotEntry::TlsLd => {
                if link.is_pic {
                    n += 1;
                }
            }
        }
    }

    n += (link.copyrel_syms.len() + link.copyrel_relro_syms.len()) as u64;

    for file in &link.files {
        let Some(obj) = file.as_object() else { continue };
        if !obj.is_alive.load(Ordering::Relaxed) {
            continue;
        }
        for isec in obj.sections.iter().flatten() {
            if !isec.is_alive() {
                continue;
            }
            if let Some(flags) = isec.scan_flags.get() {
                n += flags.iter().filter(|&&f| f != 0).count() as u64;
            }
        }
    }
    n
}

/// Builds the dynamic symbol table: the null entry, then imported symbols, then exported ones
/// sorted by GNU hash bucket (a .gnu.hash requirement).
fn finalize_dynsym<'data>(ctx: &Context<'data>, link: &mut Link<'data>) {
    let mut imported: Vec<&'data crate::symbol::Symbol<'data>> = Vec::new();
    let mut exported: Vec<&'data crate::symbol::Symbol<'data>> = Vec::new();

    // Collect in canonical aux order so the table is deterministic.
    let mut by_aux: Vec<(usize, &'data crate::symbol::Symbol<'data>)> = Vec::new();
    for file in &link.files {
        match file {
            LinkFile::Object(obj) => {
                for i in obj.first_global..obj.esyms.len() {
                    if let crate::object_file::SymbolRef::Global(sym) = obj.symbols[i] {
                        if sym.needs_flags().contains(NeedsFlags::DYNSYM) {
                            if let Some(aux) = sym.aux() {
                                by_aux.push((aux, sym));
                            } else {
                                let aux = link.aux.len();
                                link.aux.push(Default::default());
                                sym.aux_idx.store(aux as i32, Ordering::Relaxed);
                                by_aux.push((aux, sym));
                            }
                        }
                    }
                }
            }
            LinkFile::Shared(dso) => {
                for &sym in &dso.symbols {
                    if sym.needs_flags().contains(NeedsFlags::DYNSYM) {
                        if let Some(aux) = sym.aux() {
                            by_aux.push((aux, sym));
                        } else {
                            let aux = link.aux.len();
                            link.aux.push(Default::default());
                            sym.aux_idx.store(aux as i32, Ordering::Relaxed);
                            by_aux.push((aux, sym));
                        }
                    }
                }
            }
            LinkFile::Internal(_) => {}
        }
    }
    by_aux.sort_by_key(|&(aux, _)| aux);
    by_aux.dedup_by_key(|&mut (aux, _)| aux);

    for (_, sym) in by_aux {
        let core = sym.core.lock().unwrap();
        let is_defined_here = !matches!(core.place, SymbolPlace::None)
            || sym.has_copyrel.load(Ordering::Relaxed);
        drop(core);
        if is_defined_here {
            exported.push(sym);
        } else {
            imported.push(sym);
        }
    }

    let nbuckets = gnu_hash_nbuckets(exported.len());
    exported.sort_by_key(|sym| {
        let hash = elf::gnu_hash(sym.name);
        (hash % nbuckets, hash, sym.name)
    });

    link.num_exported_dynsyms = exported.len();
    let all = imported.into_iter().chain(exported);
    for (i, sym) in all.enumerate() {
        let dynsym_idx = i as i32 + 1;
        let aux = sym.aux().unwrap();
        link.aux[aux].dynsym_idx = dynsym_idx;
        let name_offset = link.dynstr.add(sym.name);
        link.dynsyms.push(DynSymEntry {
            sym,
            name_offset,
            hash: elf::gnu_hash(sym.name),
        });
    }
    let _ = ctx;
}

/// Version needs: for every imported symbol bound to a versioned DSO definition, reference
/// that version in .gnu.version_r and give the dynsym entry the matching .gnu.version index.
fn finalize_versions<'data>(link: &mut Link<'data>) {
    link.dynsym_versym = vec![object::elf::VER_NDX_GLOBAL; link.dynsyms.len()];

    // (dso file idx, version string) -> assigned version index (>= 2).
    let mut assigned: Vec<(usize, Vec<(Vec<u8>, u16)>)> = Vec::new();
    let mut next_index = object::elf::VER_NDX_GLOBAL + 1;

    for (i, entry) in link.dynsyms.iter().enumerate() {
        let core = entry.sym.core.lock().unwrap();
        let Some(owner) = core.file else { continue };
        let Some(dso) = link.files[owner.as_usize()].as_shared() else {
            continue;
        };
        if !core.is_imported || core.ver_idx <= object::elf::VER_NDX_GLOBAL {
            continue;
        }
        let Some(version) = dso.version_strings.get(core.ver_idx as usize) else {
            continue;
        };
        if version.is_empty() {
            continue;
        }

        let file_idx = owner.as_usize();
        let slot = match assigned.iter_mut().find(|(idx, _)| *idx == file_idx) {
            Some(slot) => slot,
            None => {
                assigned.push((file_idx, Vec::new()));
                assigned.last_mut().unwrap()
            }
        };
        let versym = match slot.1.iter().find(|(v, _)| v == version) {
            Some((_, idx)) => *idx,
            None => {
                let idx = next_index;
                next_index += 1;
                slot.1.push((version.to_vec(), idx));
                idx
            }
        };
        link.dynsym_versym[i] = versym;
    }

    // Serialize the Verneed/Vernaux records.
    let mut bytes = Vec::new();
    link.verneed_count = assigned.len() as u64;
    for (group_idx, (file_idx, versions)) in assigned.iter().enumerate() {
        let dso = link.files[*file_idx].as_shared().unwrap();
        let soname_off = link.dynstr.add(dso.soname.as_bytes());
        let vn_next: u32 = if group_idx + 1 == assigned.len() {
            0
        } else {
            16 + versions.len() as u32 * 16
        };

        let mut verneed = [0u8; 16];
        verneed[0..2].copy_from_slice(&1u16.to_le_bytes()); // vn_version
        verneed[2..4].copy_from_slice(&(versions.len() as u16).to_le_bytes());
        verneed[4..8].copy_from_slice(&soname_off.to_le_bytes());
        verneed[8..12].copy_from_slice(&16u32.to_le_bytes()); // vn_aux
        verneed[12..16].copy_from_slice(&vn_next.to_le_bytes());
        bytes.extend_from_slice(&verneed);

        for (aux_idx, (version, versym)) in versions.iter().enumerate() {
            let name_off = link.dynstr.add(version);
            let vna_next: u32 = if aux_idx + 1 == versions.len() { 0 } else { 16 };
            let mut vernaux = [0u8; 16];
            vernaux[0..4].copy_from_slice(&elf::gnu_hash(version).to_le_bytes());
            // vna_flags and vna_other
            vernaux[6..8].copy_from_slice(&versym.to_le_bytes());
            vernaux[8..12].copy_from_slice(&name_off.to_le_bytes());
            vernaux[12..16].copy_from_slice(&vna_next.to_le_bytes());
            bytes.extend_from_slice(&vernaux);
        }
    }
    link.verneed_bytes = bytes;
}

/// Assigns .bss / .bss.rel.ro slots to copy-relocated symbols and redirects them (and their
/// same-address aliases) at the new locations.
fn finalize_copyrel<'data>(link: &mut Link<'data>) {
    for relro in [false, true] {
        let chunk_idx = link.chunk_idx(ChunkKind::Copyrel { relro }).unwrap() as u32;
        let syms = if relro {
            link.copyrel_relro_syms.clone()
        } else {
            link.copyrel_syms.clone()
        };
        let mut offset = 0u64;
        for sym in syms {
            let (owner, size) = {
                let core = sym.core.lock().unwrap();
                let size = link.sym_type_and_size(sym, &core).1;
                (core.file, size)
            };
            offset = elf::align_to(offset, 64);

            let aliases = owner
                .and_then(|owner| link.files[owner.as_usize()].as_shared())
                .map(|dso| dso.find_aliases(sym))
                .unwrap_or_default();

            // Only the offset is recorded here; chunk indexes aren't stable until the chunk
            // list has been pruned and sorted, so address resolution goes through the
            // has_copyrel flag instead of a chunk place.
            {
                let mut core = sym.core.lock().unwrap();
                core.value = offset;
                core.is_imported = false;
            }
            for alias in aliases {
                let mut core = alias.core.lock().unwrap();
                core.value = offset;
                core.is_imported = false;
            }
            offset += size.max(1);
        }
        let chunk = &mut link.chunks[chunk_idx as usize];
        chunk.shdr.sh_size = offset;
    }
}

/// Computes every synthetic chunk's size and the file-wide tables they're derived from, then
/// drops the synthetic chunks that turned out empty.
pub(crate) fn finalize_chunk_sizes<'data>(ctx: &Context<'data>, link: &mut Link<'data>) -> Result {
    crate::timing_phase!("Finalize chunk sizes");

    finalize_copyrel(link);
    if link.needs_dynamic {
        finalize_dynsym(ctx, link);
        finalize_versions(link);
    }

    // Strings the dynamic section points at.
    let alive_sonames: Vec<(String, bool)> = link
        .alive_dsos()
        .map(|dso| (dso.soname.clone(), true))
        .collect();
    for (soname, _) in &alive_sonames {
        let off = link.dynstr.add(soname.as_bytes());
        link.dt_needed_offsets.push(off);
    }
    if let Some(soname) = &ctx.args.soname {
        link.dt_soname_offset = Some(link.dynstr.add(soname.as_bytes()));
    }
    if !ctx.args.rpaths.is_empty() {
        let rpath = ctx.args.rpaths.join(":");
        link.dt_rpath_offset = Some(link.dynstr.add(rpath.as_bytes()));
    }

    // .note.gnu.property is the intersection of every object's feature bits.
    link.combined_features = link
        .alive_objects()
        .fold(u32::MAX, |acc, obj| acc & obj.features);
    if link.combined_features == u32::MAX {
        link.combined_features = 0;
    }

    link.build_id_size = match &ctx.args.build_id {
        crate::args::BuildIdKind::None => 0,
        crate::args::BuildIdKind::Md5 | crate::args::BuildIdKind::Uuid => 16,
        crate::args::BuildIdKind::Sha1 => 20,
        crate::args::BuildIdKind::Sha256 => 32,
        crate::args::BuildIdKind::Hex(bytes) => bytes.len() as u64,
    };

    let eh_frame_size = finalize_eh_frame(link);
    let num_fdes = count_emitted_fdes(link);
    link.num_dynrels = count_dynrels(link);

    // Symbol table accounting.
    let mut files = std::mem::take(&mut link.files);
    for file in &mut files {
        if let LinkFile::Object(obj) = file {
            if obj.is_alive.load(Ordering::Relaxed) {
                obj.compute_symtab(ctx);
            } else {
                obj.num_local_symtab = 0;
                obj.num_global_symtab = 0;
                obj.strtab_size = 0;
            }
        }
    }
    let mut num_locals = 1u64; // the null symbol
    for file in &files {
        if let LinkFile::Object(obj) = file {
            // Offsets are filled in a second walk once the global base is known.
            num_locals += obj.num_local_symtab;
        }
    }
    let mut local_off = elf::SYMTAB_ENTRY_SIZE;
    let mut global_off = num_locals * elf::SYMTAB_ENTRY_SIZE;
    let mut strtab_off = 1u64;
    let mut num_symtab_entries = num_locals;
    for file in &mut files {
        if let LinkFile::Object(obj) = file {
            obj.local_symtab_offset = local_off;
            local_off += obj.num_local_symtab * elf::SYMTAB_ENTRY_SIZE;
            obj.global_symtab_offset = global_off;
            global_off += obj.num_global_symtab * elf::SYMTAB_ENTRY_SIZE;
            obj.strtab_offset = strtab_off;
            strtab_off += obj.strtab_size;
            num_symtab_entries += obj.num_global_symtab;
        }
    }
    link.files = files;

    let got_slots: u64 = link.got_entries.iter().map(|e| e.num_slots()).sum();
    let arch = link.machine.arch();
    let num_dynsyms = link.dynsyms.len() as u64 + 1;
    let num_exported = link.num_exported_dynsyms as u64;

    for idx in 0..link.chunks.len() {
        let size = match link.chunks[idx].kind {
            ChunkKind::Ehdr => elf::FILE_HEADER_SIZE,
            ChunkKind::Phdr => 0, // sized after segment counting
            ChunkKind::Shdr => 0, // sized after chunk pruning
            ChunkKind::Output(_) | ChunkKind::Merged(_) => continue,
            ChunkKind::Interp => {
                ctx.args.interpreter().map_or(0, |interp| interp.len() as u64 + 1)
            }
            ChunkKind::Got => got_slots * elf::GOT_ENTRY_SIZE,
            ChunkKind::GotPlt => {
                if link.plt_syms.is_empty() && !link.needs_dynamic {
                    0
                } else {
                    (3 + link.plt_syms.len() as u64) * elf::GOT_ENTRY_SIZE
                }
            }
            ChunkKind::Plt => {
                if link.plt_syms.is_empty() {
                    0
                } else {
                    arch.plt_header_size() + link.plt_syms.len() as u64 * arch.plt_entry_size()
                }
            }
            ChunkKind::PltGot => link.pltgot_syms.len() as u64 * arch.plt_entry_size(),
            ChunkKind::RelDyn => link.num_dynrels * elf::RELA_ENTRY_SIZE,
            ChunkKind::RelPlt => link.plt_syms.len() as u64 * elf::RELA_ENTRY_SIZE,
            // Sized below, once every table it refers to has its size.
            ChunkKind::Dynamic => continue,
            ChunkKind::Dynsym => num_dynsyms * elf::SYMTAB_ENTRY_SIZE,
            ChunkKind::Dynstr => link.dynstr.size(),
            ChunkKind::Hash => 8 + 4 * (num_dynsyms + num_dynsyms),
            ChunkKind::GnuHash => {
                if num_exported == 0 {
                    16 + 8 + 4
                } else {
                    16 + 8 + 4 * u64::from(gnu_hash_nbuckets(num_exported as usize)) + 4 * num_exported
                }
            }
            ChunkKind::Versym => num_dynsyms * 2,
            ChunkKind::Verneed => link.verneed_bytes.len() as u64,
            ChunkKind::Copyrel { .. } => continue, // sized by finalize_copyrel
            ChunkKind::NoteProperty => {
                if link.combined_features == 0 || link.machine != Machine::X86_64 {
                    0
                } else {
                    32
                }
            }
            ChunkKind::BuildId => {
                if link.build_id_size == 0 {
                    0
                } else {
                    16 + link.build_id_size
                }
            }
            ChunkKind::EhFrame => eh_frame_size,
            ChunkKind::EhFrameHdr => elf::EH_FRAME_HDR_SIZE + num_fdes * elf::EH_FRAME_HDR_ENTRY_SIZE,
            ChunkKind::Symtab => num_symtab_entries * elf::SYMTAB_ENTRY_SIZE,
            ChunkKind::Strtab => strtab_off,
            ChunkKind::Shstrtab => 0, // built after pruning and sorting
        };
        link.chunks[idx].shdr.sh_size = size;
    }

    // .dynamic's entry count depends on which of the tables above ended up non-empty. The
    // init/fini entries get their addresses after layout; only their presence matters here.
    fn output_chunk_exists(chunks: &[Chunk], name: &[u8]) -> bool {
        chunks
            .iter()
            .any(|c| c.name == name && matches!(c.kind, ChunkKind::Output(_)))
    }
    if output_chunk_exists(&link.chunks, b".init") {
        link.init_addr = Some(0);
    }
    if output_chunk_exists(&link.chunks, b".fini") {
        link.fini_addr = Some(0);
    }
    if output_chunk_exists(&link.chunks, b".init_array") {
        link.init_array_range = Some((0, 0));
    }
    if output_chunk_exists(&link.chunks, b".fini_array") {
        link.fini_array_range = Some((0, 0));
    }
    if let Some(idx) = link.chunk_idx(ChunkKind::Dynamic) {
        link.chunks[idx].shdr.sh_size = dynamic_entry_count(link) * 16;
    }

    // Empty synthetic chunks disappear. The headers and .shstrtab are sized later, once the
    // final chunk list is known, so they stay regardless.
    link.chunks.retain(|chunk| {
        chunk.shdr.sh_size > 0
            || matches!(
                chunk.kind,
                ChunkKind::Ehdr | ChunkKind::Phdr | ChunkKind::Shdr | ChunkKind::Shstrtab
            )
    });

    if link.dynsyms.len() + 1 > u16::MAX as usize {
        bail!("too many dynamic symbols");
    }

    Ok(())
}

use crate::arch::Machine;

/// Sorts chunks into their final order, assigns section header indexes and builds .shstrtab.
pub(crate) fn sort_chunks<'data>(ctx: &Context<'data>, link: &mut Link<'data>) {
    crate::timing_phase!("Sort chunks");

    let mut chunks = std::mem::take(&mut link.chunks);
    chunks.sort_by_key(|chunk| section_rank(ctx, chunk));

    // Page-break where segment permissions change, and where RELRO ends.
    let mut prev: Option<(bool, bool, bool)> = None;
    for chunk in &mut chunks {
        if !chunk.is_alloc() {
            continue;
        }
        let bucket = (
            chunk.shdr.sh_flags & u64::from(object::elf::SHF_WRITE) != 0,
            chunk.shdr.sh_flags & u64::from(object::elf::SHF_EXECINSTR) != 0,
            chunk.is_relro(ctx.args.z_relro),
        );
        if let Some(prev) = prev {
            if prev != bucket {
                chunk.new_page = true;
            }
        }
        prev = Some(bucket);
    }

    // Section header table indexes, then names.
    let mut shndx = 1u32;
    for chunk in &mut chunks {
        if chunk.has_shdr_entry() {
            chunk.shndx = shndx;
            shndx += 1;
        }
    }
    let mut shstrtab = StrTabLocal::default();
    for chunk in &mut chunks {
        if chunk.has_shdr_entry() && !chunk.name.is_empty() {
            chunk.shdr.sh_name = shstrtab.add(chunk.name);
        }
    }
    for chunk in &mut chunks {
        if matches!(chunk.kind, ChunkKind::Shstrtab) {
            chunk.shdr.sh_size = shstrtab.data.len() as u64;
        }
        if matches!(chunk.kind, ChunkKind::Shdr) {
            chunk.shdr.sh_size = (u64::from(shndx)) * elf::SECTION_HEADER_SIZE;
        }
    }
    link.shstrtab_bytes = shstrtab.data;

    link.chunks = chunks;

    // Re-resolve the output-section-to-chunk mapping after sorting.
    link.osec_chunk = vec![u32::MAX; link.osec_members.len()];
    for (idx, chunk) in link.chunks.iter().enumerate() {
        match chunk.kind {
            ChunkKind::Output(osec) => link.osec_chunk[osec.0 as usize] = idx as u32,
            ChunkKind::Merged(merged_idx) => {
                link.merged[merged_idx as usize]
                    .chunk_idx
                    .store(idx as u32, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

#[derive(Default)]
struct StrTabLocal {
    data: Vec<u8>,
    map: hashbrown::HashMap<Vec<u8>, u32>,
}

impl StrTabLocal {
    fn add(&mut self, name: &[u8]) -> u32 {
        if self.data.is_empty() {
            self.data.push(0);
        }
        if let Some(&off) = self.map.get(name) {
            return off;
        }
        let off = self.data.len() as u32;
        self.data.extend_from_slice(name);
        self.data.push(0);
        self.map.insert(name.to_vec(), off);
        off
    }
}

/// One program header's worth of information.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Segment {
    pub(crate) p_type: u32,
    pub(crate) p_flags: u32,
    pub(crate) first_chunk: usize,
    pub(crate) last_chunk: usize,
}

fn chunk_pflags(chunk: &Chunk) -> u32 {
    let mut flags = object::elf::PF_R;
    if chunk.shdr.sh_flags & u64::from(object::elf::SHF_WRITE) != 0 {
        flags |= object::elf::PF_W;
    }
    if chunk.shdr.sh_flags & u64::from(object::elf::SHF_EXECINSTR) != 0 {
        flags |= object::elf::PF_X;
    }
    flags
}

/// Groups the sorted chunk list into segments. Returns them in program-header order.
pub(crate) fn create_segments<'data>(ctx: &Context<'data>, link: &Link<'data>) -> Vec<Segment> {
    let mut segments = Vec::new();
    let chunks = &link.chunks;

    if link.needs_dynamic || ctx.args.interpreter().is_some() {
        if let Some(idx) = link.chunk_idx(ChunkKind::Phdr) {
            segments.push(Segment {
                p_type: object::elf::PT_PHDR,
                p_flags: object::elf::PF_R,
                first_chunk: idx,
                last_chunk: idx,
            });
        }
    }
    if let Some(idx) = link.chunk_idx(ChunkKind::Interp) {
        segments.push(Segment {
            p_type: object::elf::PT_INTERP,
            p_flags: object::elf::PF_R,
            first_chunk: idx,
            last_chunk: idx,
        });
    }

    // PT_NOTE over runs of alloc note sections.
    let mut i = 0;
    while i < chunks.len() {
        if chunks[i].shdr.sh_type == object::elf::SHT_NOTE && chunks[i].is_alloc() {
            let first = i;
            while i + 1 < chunks.len()
                && chunks[i + 1].shdr.sh_type == object::elf::SHT_NOTE
                && chunks[i + 1].is_alloc()
            {
                i += 1;
            }
            segments.push(Segment {
                p_type: object::elf::PT_NOTE,
                p_flags: object::elf::PF_R,
                first_chunk: first,
                last_chunk: i,
            });
        }
        i += 1;
    }

    // PT_LOAD: runs of alloc chunks with the same permissions, broken at page boundaries.
    let mut i = 0;
    while i < chunks.len() {
        if !chunks[i].is_alloc() {
            i += 1;
            continue;
        }
        let flags = chunk_pflags(&chunks[i]);
        let first = i;
        while i + 1 < chunks.len()
            && chunks[i + 1].is_alloc()
            && chunk_pflags(&chunks[i + 1]) == flags
            && !(chunks[i + 1].new_page)
        {
            i += 1;
        }
        segments.push(Segment {
            p_type: object::elf::PT_LOAD,
            p_flags: flags,
            first_chunk: first,
            last_chunk: i,
        });
        i += 1;
    }

    // PT_TLS over the run of TLS chunks.
    if let Some(first) = chunks.iter().position(|c| c.is_tls()) {
        let last = chunks.iter().rposition(|c| c.is_tls()).unwrap();
        segments.push(Segment {
            p_type: object::elf::PT_TLS,
            p_flags: object::elf::PF_R,
            first_chunk: first,
            last_chunk: last,
        });
    }

    if let Some(idx) = link.chunk_idx(ChunkKind::Dynamic) {
        segments.push(Segment {
            p_type: object::elf::PT_DYNAMIC,
            p_flags: object::elf::PF_R | object::elf::PF_W,
            first_chunk: idx,
            last_chunk: idx,
        });
    }
    if let Some(idx) = link.chunk_idx(ChunkKind::EhFrameHdr) {
        segments.push(Segment {
            p_type: object::elf::PT_GNU_EH_FRAME,
            p_flags: object::elf::PF_R,
            first_chunk: idx,
            last_chunk: idx,
        });
    }

    // PT_GNU_STACK carries no sections; the writer special-cases it.
    segments.push(Segment {
        p_type: object::elf::PT_GNU_STACK,
        p_flags: if ctx.args.z_execstack {
            object::elf::PF_R | object::elf::PF_W | object::elf::PF_X
        } else {
            object::elf::PF_R | object::elf::PF_W
        },
        first_chunk: usize::MAX,
        last_chunk: usize::MAX,
    });

    // PT_GNU_RELRO over the RELRO chunks.
    if ctx.args.z_relro {
        if let Some(first) = chunks.iter().position(|c| c.is_alloc() && c.is_relro(true)) {
            let last = chunks
                .iter()
                .rposition(|c| c.is_alloc() && c.is_relro(true))
                .unwrap();
            segments.push(Segment {
                p_type: object::elf::PT_GNU_RELRO,
                p_flags: object::elf::PF_R,
                first_chunk: first,
                last_chunk: last,
            });
        }
    }

    segments
}

/// Assigns virtual addresses and file offsets. Within the alloc region each non-BSS chunk
/// advances the file offset exactly as much as the virtual address, keeping them congruent
/// modulo the page size; BSS occupies address space only. TLS BSS doesn't advance the address
/// at all (it lives in the thread block, not the image).
pub(crate) fn assign_addresses<'data>(ctx: &Context<'data>, link: &mut Link<'data>) -> u64 {
    crate::timing_phase!("Assign addresses");

    let page = elf::COMMON_PAGE_SIZE;
    let mut fileoff = 0u64;
    let mut vaddr = ctx.args.image_base;

    let end = link
        .chunks
        .iter()
        .position(|c| !c.is_alloc())
        .unwrap_or(link.chunks.len());

    let mut i = 0;
    while i < end {
        fileoff = elf::align_with_skew(fileoff, page, vaddr % page);

        // A run of non-BSS chunks followed by a run of BSS chunks.
        while i < end && !link.chunks[i].is_bss() {
            let chunk = &mut link.chunks[i];
            let prev_vaddr = vaddr;
            if chunk.new_page {
                vaddr = elf::align_to(vaddr, page);
            }
            vaddr = elf::align_to(vaddr, chunk.shdr.sh_addralign.max(1));
            fileoff += vaddr - prev_vaddr;

            chunk.shdr.sh_addr = vaddr;
            vaddr += chunk.shdr.sh_size;
            chunk.shdr.sh_offset = fileoff;
            fileoff += chunk.shdr.sh_size;
            i += 1;
        }

        while i < end && link.chunks[i].is_bss() {
            let chunk = &mut link.chunks[i];
            if chunk.new_page {
                vaddr = elf::align_to(vaddr, page);
            }
            vaddr = elf::align_to(vaddr, chunk.shdr.sh_addralign.max(1));
            fileoff = elf::align_with_skew(fileoff, page, vaddr % page);

            chunk.shdr.sh_addr = vaddr;
            chunk.shdr.sh_offset = fileoff;
            if !chunk.is_tls() {
                vaddr += chunk.shdr.sh_size;
            }
            i += 1;
        }
    }

    for chunk in &mut link.chunks[end..] {
        fileoff = elf::align_to(fileoff, chunk.shdr.sh_addralign.max(1));
        chunk.shdr.sh_offset = fileoff;
        if !chunk.is_bss() {
            fileoff += chunk.shdr.sh_size;
        }
    }

    link.filesize = fileoff;
    fileoff
}

/// Compresses non-alloc .debug chunks. Runs after addresses are assigned (the contents embed
/// symbol addresses) and is followed by a second address-assignment pass: only non-alloc file
/// offsets move, so everything address-dependent stays valid.
pub(crate) fn compress_debug_chunks<'data>(ctx: &Context<'data>, link: &mut Link<'data>) {
    use crate::args::CompressKind;

    if ctx.args.compress_debug_sections == CompressKind::None {
        return;
    }
    crate::timing_phase!("Compress debug sections");

    let gnu = ctx.args.compress_debug_sections == CompressKind::Gnu;

    let mut rendered: Vec<(usize, Vec<u8>)> = Vec::new();
    for (idx, chunk) in link.chunks.iter().enumerate() {
        if chunk.is_alloc()
            || chunk.shdr.sh_size == 0
            || !(chunk.name.starts_with(b".debug") || chunk.name.starts_with(b".zdebug"))
        {
            continue;
        }
        let mut contents = vec![0u8; chunk.shdr.sh_size as usize];
        match chunk.kind {
            ChunkKind::Output(osec) => {
                // Debug sections never produce dynamic relocations; the scanner only looks at
                // alloc sections.
                let scratch = crate::output_chunks::DynRelQueue::new();
                for sref in &link.osec_members[osec.0 as usize] {
                    let isec = crate::output_chunks::section_ref(&link.files, *sref);
                    crate::output_chunks::write_input_section(
                        link, isec, chunk, &mut contents, &scratch,
                    );
                }
            }
            ChunkKind::Merged(merged_idx) => {
                link.merged[merged_idx as usize].write_to(&mut contents);
            }
            _ => continue,
        }

        let deflated = elf::compress_zlib(&contents);
        let payload = if gnu {
            let mut payload = b"ZLIB".to_vec();
            payload.extend_from_slice(&(contents.len() as u64).to_be_bytes());
            payload.extend_from_slice(&deflated);
            payload
        } else {
            let mut payload = vec![0u8; elf::COMPRESSION_HEADER_SIZE];
            let chdr: &mut elf::CompressionHeader =
                object::from_bytes_mut(&mut payload).unwrap().0;
            chdr.ch_type.set(LE, object::elf::ELFCOMPRESS_ZLIB);
            chdr.ch_size.set(LE, contents.len() as u64);
            chdr.ch_addralign.set(LE, chunk.shdr.sh_addralign.max(1));
            payload.extend_from_slice(&deflated);
            payload
        };
        if payload.len() as u64 >= chunk.shdr.sh_size {
            // Incompressible; leave the section alone.
            continue;
        }
        rendered.push((idx, payload));
    }

    for (idx, payload) in rendered {
        let chunk = &mut link.chunks[idx];
        chunk.shdr.sh_size = payload.len() as u64;
        if gnu {
            if chunk.name.starts_with(b".debug") {
                let mut name = b".z".to_vec();
                name.extend_from_slice(&chunk.name[1..]);
                chunk.name = ctx.save_bytes(name);
            }
        } else {
            chunk.shdr.sh_flags |= u64::from(object::elf::SHF_COMPRESSED);
            chunk.shdr.sh_addralign = 8;
        }
        link.compressed_debug.insert(idx, payload);
    }

    // Renaming to .zdebug changes .shstrtab; rebuild names.
    if gnu && !link.compressed_debug.is_empty() {
        let mut shstrtab = StrTabLocal::default();
        for chunk in &mut link.chunks {
            if chunk.has_shdr_entry() && !chunk.name.is_empty() {
                chunk.shdr.sh_name = shstrtab.add(chunk.name);
            }
        }
        link.shstrtab_bytes = shstrtab.data;
        if let Some(idx) = link.chunk_idx(ChunkKind::Shstrtab) {
            link.chunks[idx].shdr.sh_size = link.shstrtab_bytes.len() as u64;
        }
    }
}

/// Post-layout fixups: section header links, synthetic symbol values, TLS bounds, the entry
/// point.
pub(crate) fn fix_up_addresses<'data>(ctx: &Context<'data>, link: &mut Link<'data>) {
    // TLS bounds. The thread pointer sits at the end of the TLS template on x86-64 (variant 2);
    // tdata/tbss offsets are computed against it.
    let tls_chunks: Vec<usize> = link
        .chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_tls())
        .map(|(i, _)| i)
        .collect();
    if let (Some(&first), Some(&last)) = (tls_chunks.first(), tls_chunks.last()) {
        let begin = link.chunks[first].shdr.sh_addr;
        let end = link.chunks[last].shdr.sh_addr + link.chunks[last].shdr.sh_size;
        let align = tls_chunks
            .iter()
            .map(|&i| link.chunks[i].shdr.sh_addralign)
            .max()
            .unwrap_or(1);
        link.tls_begin = begin;
        link.tls_end = elf::align_to(end, align);
    }

    fix_synthetic_symbols(ctx, link);

    if let Some(entry) = ctx.symbol_interner.get(ctx.args.entry.as_bytes()) {
        link.entry_addr = crate::output_chunks::sym_addr(link, entry);
    }
    if link.entry_addr == 0 && !ctx.args.shared {
        // Same fallback the other linkers use: the start of the text segment.
        if let Some(text) = link
            .chunks
            .iter()
            .find(|c| c.name == b".text" && matches!(c.kind, ChunkKind::Output(_)))
        {
            link.entry_addr = text.shdr.sh_addr;
        }
    }
}

fn set_symbol_to_chunk(link: &Link, name: &[u8], ctx: &Context, chunk_idx: Option<usize>, at_end: bool) {
    let Some(sym) = ctx.symbol_interner.get(name) else {
        return;
    };
    let Some(chunk_idx) = chunk_idx else { return };
    let mut core = sym.core.lock().unwrap();
    if core.file != Some(crate::symbol::INTERNAL_FILE_ID) {
        return;
    }
    core.place = SymbolPlace::Chunk(chunk_idx as u32);
    core.value = if at_end {
        link.chunks[chunk_idx].shdr.sh_size
    } else {
        0
    };
}

/// Pins the linker-synthesized symbols now that every chunk has an address.
fn fix_synthetic_symbols<'data>(ctx: &Context<'data>, link: &mut Link<'data>) {
    let by_kind = |kind: ChunkKind| link.chunk_idx(kind);
    let by_name = |name: &[u8]| {
        link.chunks
            .iter()
            .position(|c| c.name == name && matches!(c.kind, ChunkKind::Output(_)))
    };

    set_symbol_to_chunk(link, b"__ehdr_start", ctx, by_kind(ChunkKind::Ehdr), false);
    set_symbol_to_chunk(link, b"__executable_start", ctx, by_kind(ChunkKind::Ehdr), false);
    set_symbol_to_chunk(link, b"_DYNAMIC", ctx, by_kind(ChunkKind::Dynamic), false);
    set_symbol_to_chunk(link, b"__GNU_EH_FRAME_HDR", ctx, by_kind(ChunkKind::EhFrameHdr), false);
    set_symbol_to_chunk(link, b"__bss_start", ctx, by_name(b".bss").or_else(|| by_kind(ChunkKind::Copyrel { relro: false })), false);

    // _GLOBAL_OFFSET_TABLE_ points at .got.plt on x86-64 and .got on aarch64.
    let got_anchor = match link.machine {
        Machine::X86_64 => by_kind(ChunkKind::GotPlt).or_else(|| by_kind(ChunkKind::Got)),
        Machine::AArch64 => by_kind(ChunkKind::Got),
    };
    set_symbol_to_chunk(link, b"_GLOBAL_OFFSET_TABLE_", ctx, got_anchor, false);

    set_symbol_to_chunk(link, b"__init_array_start", ctx, by_name(b".init_array"), false);
    set_symbol_to_chunk(link, b"__init_array_end", ctx, by_name(b".init_array"), true);
    set_symbol_to_chunk(link, b"__fini_array_start", ctx, by_name(b".fini_array"), false);
    set_symbol_to_chunk(link, b"__fini_array_end", ctx, by_name(b".fini_array"), true);
    set_symbol_to_chunk(link, b"__preinit_array_start", ctx, by_name(b".preinit_array"), false);
    set_symbol_to_chunk(link, b"__preinit_array_end", ctx, by_name(b".preinit_array"), true);

    // __rela_iplt_start/end cover the IRELATIVE entries, which sort first within their type
    // group at the start of .rela.dyn for static executables.
    let num_irelative: u64 = link
        .got_entries
        .iter()
        .filter(|entry| matches!(entry, GotEntry::Got(sym) if link.sym_is_ifunc(sym)))
        .count() as u64;
    if let Some(reldyn) = by_kind(ChunkKind::RelDyn) {
        set_symbol_to_chunk(link, b"__rela_iplt_start", ctx, Some(reldyn), false);
        if let Some(sym) = ctx.symbol_interner.get(b"__rela_iplt_end") {
            let mut core = sym.core.lock().unwrap();
            if core.file == Some(crate::symbol::INTERNAL_FILE_ID) {
                core.place = SymbolPlace::Chunk(reldyn as u32);
                core.value = num_irelative * elf::RELA_ENTRY_SIZE;
            }
        }
    }

    // _end / _etext / _edata and their underscore-less aliases.
    let mut end_chunk = None;
    let mut etext_chunk = None;
    let mut edata_chunk = None;
    for (idx, chunk) in link.chunks.iter().enumerate() {
        if !chunk.has_shdr_entry() {
            continue;
        }
        if chunk.is_alloc() {
            end_chunk = Some(idx);
            if !chunk.is_bss() {
                edata_chunk = Some(idx);
            }
            if chunk.shdr.sh_flags & u64::from(object::elf::SHF_EXECINSTR) != 0 {
                etext_chunk = Some(idx);
            }
        }
    }
    for name in [b"_end".as_slice(), b"end"] {
        set_symbol_to_chunk(link, name, ctx, end_chunk, true);
    }
    for name in [b"_etext".as_slice(), b"etext"] {
        set_symbol_to_chunk(link, name, ctx, etext_chunk, true);
    }
    for name in [b"_edata".as_slice(), b"edata"] {
        set_symbol_to_chunk(link, name, ctx, edata_chunk, true);
    }

    // __start_X / __stop_X for C-identifier output sections.
    for (idx, chunk) in link.chunks.iter().enumerate() {
        if !matches!(chunk.kind, ChunkKind::Output(_)) || !elf::is_c_identifier(chunk.name) {
            continue;
        }
        let mut start = b"__start_".to_vec();
        start.extend_from_slice(chunk.name);
        let mut stop = b"__stop_".to_vec();
        stop.extend_from_slice(chunk.name);
        set_symbol_to_chunk(link, &start, ctx, Some(idx), false);
        set_symbol_to_chunk(link, &stop, ctx, Some(idx), true);
    }

    // .init / .fini entry points for DT_INIT / DT_FINI.
    let init_addr = by_name(b".init").map(|idx| link.chunks[idx].shdr.sh_addr);
    let fini_addr = by_name(b".fini").map(|idx| link.chunks[idx].shdr.sh_addr);
    let init_array_range = by_name(b".init_array")
        .map(|idx| (link.chunks[idx].shdr.sh_addr, link.chunks[idx].shdr.sh_size));
    let fini_array_range = by_name(b".fini_array")
        .map(|idx| (link.chunks[idx].shdr.sh_addr, link.chunks[idx].shdr.sh_size));
    link.init_addr = init_addr;
    link.fini_addr = fini_addr;
    link.init_array_range = init_array_range;
    link.fini_array_range = fini_array_range;
}

/// Fills the section-header links that need final indexes (symtab -> strtab etc.).
pub(crate) fn set_section_links<'data>(link: &mut Link<'data>) {
    let shndx_of = |link: &Link, kind: ChunkKind| {
        link.chunk_idx(kind)
            .map(|idx| link.chunks[idx].shndx)
            .unwrap_or(0)
    };

    let dynstr = shndx_of(link, ChunkKind::Dynstr);
    let dynsym = shndx_of(link, ChunkKind::Dynsym);
    let strtab = shndx_of(link, ChunkKind::Strtab);
    let num_locals: u64 = 1 + link
        .files
        .iter()
        .filter_map(|f| f.as_object())
        .map(|obj| obj.num_local_symtab)
        .sum::<u64>();

    for chunk in &mut link.chunks {
        match chunk.kind {
            ChunkKind::Dynsym => {
                chunk.shdr.sh_link = dynstr;
                chunk.shdr.sh_info = 1;
            }
            ChunkKind::Dynamic => chunk.shdr.sh_link = dynstr,
            ChunkKind::Hash | ChunkKind::GnuHash | ChunkKind::Versym => {
                chunk.shdr.sh_link = dynsym;
            }
            ChunkKind::Verneed => {
                chunk.shdr.sh_link = dynstr;
                chunk.shdr.sh_info = link.verneed_count as u32;
            }
            ChunkKind::RelDyn => chunk.shdr.sh_link = dynsym,
            ChunkKind::RelPlt => {
                chunk.shdr.sh_link = dynsym;
            }
            ChunkKind::Symtab => {
                chunk.shdr.sh_link = strtab;
                chunk.shdr.sh_info = num_locals as u32;
            }
            _ => {}
        }
    }
    // .rela.plt's sh_info points at .got.plt.
    let gotplt = shndx_of(link, ChunkKind::GotPlt);
    if let Some(idx) = link.chunk_idx(ChunkKind::RelPlt) {
        link.chunks[idx].shdr.sh_info = gotplt;
    }
}

/// Writes the ELF header, program header table and section header table.
pub(crate) fn write_headers<'data>(
    ctx: &Context<'data>,
    link: &Link<'data>,
    segments: &[Segment],
    buffer: &mut [u8],
) -> Result {
    let _ = ctx;

    // Program headers.
    let phdr_chunk = link.chunk_idx(ChunkKind::Phdr).unwrap();
    let phdr_offset = link.chunks[phdr_chunk].shdr.sh_offset as usize;
    for (i, segment) in segments.iter().enumerate() {
        let bytes = &mut buffer
            [phdr_offset + i * elf::PROGRAM_HEADER_SIZE as usize..][..elf::PROGRAM_HEADER_SIZE as usize];
        let phdr: &mut elf::ProgramHeader = object::from_bytes_mut(bytes).unwrap().0;
        phdr.p_type.set(LE, segment.p_type);
        phdr.p_flags.set(LE, segment.p_flags);

        if segment.p_type == object::elf::PT_GNU_STACK {
            phdr.p_align.set(LE, 1);
            continue;
        }

        let first = &link.chunks[segment.first_chunk];
        let p_vaddr = first.shdr.sh_addr;
        let p_offset = first.shdr.sh_offset;
        // TLS BSS occupies no address space in the image, so it only counts toward the PT_TLS
        // segment's memory size.
        let mem_end = (segment.first_chunk..=segment.last_chunk)
            .map(|idx| {
                let c = &link.chunks[idx];
                if c.is_tls() && c.is_bss() && segment.p_type != object::elf::PT_TLS {
                    c.shdr.sh_addr
                } else {
                    c.shdr.sh_addr + c.shdr.sh_size
                }
            })
            .max()
            .unwrap_or(p_vaddr);
        let file_end = (segment.first_chunk..=segment.last_chunk)
            .map(|idx| {
                let c = &link.chunks[idx];
                if c.is_bss() {
                    c.shdr.sh_offset
                } else {
                    c.shdr.sh_offset + c.shdr.sh_size
                }
            })
            .max()
            .unwrap_or(p_offset);

        phdr.p_offset.set(LE, p_offset);
        phdr.p_vaddr.set(LE, p_vaddr);
        phdr.p_paddr.set(LE, p_vaddr);
        phdr.p_filesz.set(LE, file_end - p_offset);
        let mut p_memsz = mem_end - p_vaddr;
        if segment.p_type == object::elf::PT_GNU_RELRO {
            // Round the RELRO region up to a page so the loader can protect all of it.
            p_memsz = elf::align_to(p_vaddr + p_memsz, elf::COMMON_PAGE_SIZE) - p_vaddr;
        }
        phdr.p_memsz.set(LE, p_memsz);
        phdr.p_align.set(
            LE,
            match segment.p_type {
                object::elf::PT_LOAD => elf::COMMON_PAGE_SIZE,
                object::elf::PT_TLS => (segment.first_chunk..=segment.last_chunk)
                    .map(|idx| link.chunks[idx].shdr.sh_addralign)
                    .max()
                    .unwrap_or(1),
                _ => first.shdr.sh_addralign.max(1),
            },
        );
    }

    // Section headers.
    let shdr_chunk = link.chunk_idx(ChunkKind::Shdr).unwrap();
    let shdr_offset = link.chunks[shdr_chunk].shdr.sh_offset as usize;
    for chunk in &link.chunks {
        if !chunk.has_shdr_entry() {
            continue;
        }
        let bytes = &mut buffer[shdr_offset
            + chunk.shndx as usize * elf::SECTION_HEADER_SIZE as usize..]
            [..elf::SECTION_HEADER_SIZE as usize];
        let shdr: &mut elf::SectionHeader = object::from_bytes_mut(bytes).unwrap().0;
        shdr.sh_name.set(LE, chunk.shdr.sh_name);
        shdr.sh_type.set(LE, chunk.shdr.sh_type);
        shdr.sh_flags.set(LE, chunk.shdr.sh_flags);
        shdr.sh_addr.set(LE, if chunk.is_alloc() { chunk.shdr.sh_addr } else { 0 });
        shdr.sh_offset.set(LE, chunk.shdr.sh_offset);
        shdr.sh_size.set(LE, chunk.shdr.sh_size);
        shdr.sh_link.set(LE, chunk.shdr.sh_link);
        shdr.sh_info.set(LE, chunk.shdr.sh_info);
        shdr.sh_addralign.set(LE, chunk.shdr.sh_addralign);
        shdr.sh_entsize.set(LE, chunk.shdr.sh_entsize);
    }

    // ELF header.
    let num_shdrs = link
        .chunks
        .iter()
        .filter(|c| c.has_shdr_entry())
        .count() as u16
        + 1;
    let shstrndx = link
        .chunk_idx(ChunkKind::Shstrtab)
        .map(|idx| link.chunks[idx].shndx as u16)
        .unwrap_or(0);

    let header: &mut elf::FileHeader =
        object::from_bytes_mut(&mut buffer[..elf::FILE_HEADER_SIZE as usize])
            .unwrap()
            .0;
    header.e_ident.magic = object::elf::ELFMAG;
    header.e_ident.class = object::elf::ELFCLASS64;
    header.e_ident.data = object::elf::ELFDATA2LSB;
    header.e_ident.version = object::elf::EV_CURRENT;
    header.e_ident.os_abi = 0;
    header.e_ident.abi_version = 0;
    header.e_type.set(
        LE,
        if ctx_is_shared(link) {
            object::elf::ET_DYN
        } else {
            object::elf::ET_EXEC
        },
    );
    header.e_machine.set(LE, link.machine.arch().machine_id());
    header.e_version.set(LE, u32::from(object::elf::EV_CURRENT));
    header.e_entry.set(LE, link.entry_addr);
    header
        .e_phoff
        .set(LE, link.chunks[phdr_chunk].shdr.sh_offset);
    header.e_shoff.set(LE, shdr_offset as u64);
    header.e_flags.set(LE, 0);
    header.e_ehsize.set(LE, elf::FILE_HEADER_SIZE as u16);
    header.e_phentsize.set(LE, elf::PROGRAM_HEADER_SIZE as u16);
    header.e_phnum.set(LE, segments.len() as u16);
    header.e_shentsize.set(LE, elf::SECTION_HEADER_SIZE as u16);
    header.e_shnum.set(LE, num_shdrs);
    header.e_shstrndx.set(LE, shstrndx);
    Ok(())
}

fn ctx_is_shared(link: &Link) -> bool {
    link.is_pic
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_with(sh_type: u32, sh_flags: u64, kind: ChunkKind) -> Chunk<'static> {
        let mut chunk = Chunk::new(b".x", kind);
        chunk.shdr.sh_type = sh_type;
        chunk.shdr.sh_flags = sh_flags;
        chunk
    }

    #[test]
    fn test_section_rank_total_order() {
        let args = crate::args::Args::for_testing();
        let string_arena = colosseum::sync::Arena::new();
        let herd = bumpalo_herd::Herd::new();
        let fragment_arena = colosseum::sync::Arena::new();
        let merged_arena = colosseum::sync::Arena::new();
        let comdat_arena = colosseum::sync::Arena::new();
        let symbol_arena = colosseum::sync::Arena::new();
        let ctx = crate::context::Context::new(
            &args,
            &string_arena,
            &herd,
            &fragment_arena,
            &merged_arena,
            &comdat_arena,
            &symbol_arena,
            16,
        );

        let alloc = u64::from(object::elf::SHF_ALLOC);
        let write = u64::from(object::elf::SHF_WRITE);
        let exec = u64::from(object::elf::SHF_EXECINSTR);
        let tls = u64::from(object::elf::SHF_TLS);

        let ehdr = chunk_with(0, 0, ChunkKind::Ehdr);
        let phdr = chunk_with(0, 0, ChunkKind::Phdr);
        let interp = chunk_with(object::elf::SHT_PROGBITS, alloc, ChunkKind::Interp);
        let note = chunk_with(object::elf::SHT_NOTE, alloc, ChunkKind::BuildId);
        let rodata = chunk_with(
            object::elf::SHT_PROGBITS,
            alloc,
            ChunkKind::Output(OutputSecId(0)),
        );
        let text = chunk_with(
            object::elf::SHT_PROGBITS,
            alloc | exec,
            ChunkKind::Output(OutputSecId(1)),
        );
        let tdata = chunk_with(
            object::elf::SHT_PROGBITS,
            alloc | write | tls,
            ChunkKind::Output(OutputSecId(2)),
        );
        let tbss = chunk_with(
            object::elf::SHT_NOBITS,
            alloc | write | tls,
            ChunkKind::Output(OutputSecId(3)),
        );
        let got = chunk_with(object::elf::SHT_PROGBITS, alloc | write, ChunkKind::Got);
        let data = {
            let mut c = chunk_with(
                object::elf::SHT_PROGBITS,
                alloc | write,
                ChunkKind::Output(OutputSecId(4)),
            );
            c.name = b".data";
            c
        };
        let bss = {
            let mut c = chunk_with(
                object::elf::SHT_NOBITS,
                alloc | write,
                ChunkKind::Output(OutputSecId(5)),
            );
            c.name = b".bss";
            c
        };
        let comment = chunk_with(object::elf::SHT_PROGBITS, 0, ChunkKind::Merged(0));
        let shdr = chunk_with(0, 0, ChunkKind::Shdr);

        let expected_order = [
            &ehdr, &phdr, &interp, &note, &rodata, &text, &tdata, &tbss, &got, &data, &bss,
            &comment, &shdr,
        ];
        let mut ranks: Vec<i64> = expected_order
            .iter()
            .map(|c| section_rank(&ctx, c))
            .collect();
        let sorted = {
            let mut r = ranks.clone();
            r.sort();
            r
        };
        assert_eq!(ranks, sorted, "ranks must already be in the documented order");
        // Ranks strictly increase across permission-class boundaries we care about.
        ranks.dedup();
        assert!(ranks.len() >= 10);
    }

    #[test]
    fn test_layout_congruence() {
        // A miniature chunk list: headers, text, data, bss, then a non-alloc tail.
        let args = crate::args::Args::for_testing();
        let string_arena = colosseum::sync::Arena::new();
        let herd = bumpalo_herd::Herd::new();
        let fragment_arena = colosseum::sync::Arena::new();
        let merged_arena = colosseum::sync::Arena::new();
        let comdat_arena = colosseum::sync::Arena::new();
        let symbol_arena = colosseum::sync::Arena::new();
        let ctx = crate::context::Context::new(
            &args,
            &string_arena,
            &herd,
            &fragment_arena,
            &merged_arena,
            &comdat_arena,
            &symbol_arena,
            16,
        );

        let alloc = u64::from(object::elf::SHF_ALLOC);
        let write = u64::from(object::elf::SHF_WRITE);
        let exec = u64::from(object::elf::SHF_EXECINSTR);

        let mut link = Link::new(Machine::X86_64, Vec::new(), &ctx);
        let mut push = |name: &'static [u8], sh_type, sh_flags, size, align, kind, new_page| {
            let mut chunk = Chunk::new(name, kind);
            chunk.shdr.sh_type = sh_type;
            chunk.shdr.sh_flags = sh_flags;
            chunk.shdr.sh_size = size;
            chunk.shdr.sh_addralign = align;
            chunk.new_page = new_page;
            link.chunks.push(chunk);
        };
        push(b"", 0, alloc, 64, 8, ChunkKind::Ehdr, false);
        push(b"", 0, alloc, 56 * 4, 8, ChunkKind::Phdr, false);
        push(
            b".text",
            object::elf::SHT_PROGBITS,
            alloc | exec,
            0x1234,
            16,
            ChunkKind::Output(OutputSecId(0)),
            true,
        );
        push(
            b".data",
            object::elf::SHT_PROGBITS,
            alloc | write,
            0x777,
            32,
            ChunkKind::Output(OutputSecId(1)),
            true,
        );
        push(
            b".bss",
            object::elf::SHT_NOBITS,
            alloc | write,
            0x2000,
            32,
            ChunkKind::Output(OutputSecId(2)),
            false,
        );
        push(
            b".comment",
            object::elf::SHT_PROGBITS,
            0,
            0x40,
            1,
            ChunkKind::Merged(0),
            false,
        );
        push(b"", 0, 0, 64 * 7, 8, ChunkKind::Shdr, false);

        let filesize = assign_addresses(&ctx, &mut link);
        assert!(filesize > 0);

        for chunk in &link.chunks {
            if !chunk.is_alloc() || chunk.is_bss() {
                continue;
            }
            assert_eq!(
                chunk.shdr.sh_addr % elf::COMMON_PAGE_SIZE,
                chunk.shdr.sh_offset % elf::COMMON_PAGE_SIZE,
                "vaddr and offset must be congruent mod page size"
            );
            assert_eq!(chunk.shdr.sh_addr % chunk.shdr.sh_addralign.max(1), 0);
        }

        // Chunks don't overlap in the file.
        let mut prev_end = 0;
        for chunk in &link.chunks {
            if chunk.is_bss() {
                continue;
            }
            assert!(chunk.shdr.sh_offset >= prev_end);
            prev_end = chunk.shdr.sh_offset + chunk.shdr.sh_size;
        }
    }
}
