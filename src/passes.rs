//! The link pipeline's passes and the state they build up. Each pass is a fork-join over the
//! file list or the chunk list; the shared state they touch is confined to symbol locks and
//! atomic liveness bits, per the data model.

use crate::context::Context;
use crate::context::OutputSecId;
use crate::elf;
use crate::error;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::input_data::InputData;
use crate::object_file::InternalFile;
use crate::object_file::LinkFile;
use crate::object_file::ObjectFile;
use crate::object_file::SharedFile;
use crate::output_chunks::Chunk;
use crate::output_chunks::ChunkKind;
use crate::output_chunks::DynSymEntry;
use crate::output_chunks::GotEntry;
use crate::output_chunks::SectionRef;
use crate::output_chunks::StrTab;
use crate::output_chunks::SymbolAux;
use crate::output_chunks::section_ref;
use crate::string_merging::MergedSection;
use crate::symbol::FileId;
use crate::symbol::INTERNAL_FILE_ID;
use crate::symbol::NeedsFlags;
use crate::symbol::Symbol;
use crate::version_script::VersionScript;
use anyhow::bail;
use crossbeam_queue::SegQueue;
use itertools::Itertools as _;
use object::LittleEndian as LE;
use object::read::elf::Sym as _;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use rayon::slice::ParallelSlice as _;
use std::sync::atomic::Ordering;

use crate::arch::Machine;

/// Everything the later passes accumulate on top of the parsed files.
pub(crate) struct Link<'data> {
    pub(crate) machine: Machine,
    pub(crate) is_pic: bool,
    pub(crate) z_now: bool,
    pub(crate) z_nodelete: bool,
    pub(crate) has_textrel: bool,
    pub(crate) needs_dynamic: bool,

    pub(crate) files: Vec<LinkFile<'data>>,
    pub(crate) chunks: Vec<Chunk<'data>>,
    pub(crate) merged: Vec<&'data MergedSection<'data>>,

    /// Members of each regular output section, indexed by OutputSecId.
    pub(crate) osec_members: Vec<Vec<SectionRef>>,
    /// Size and alignment of each regular output section.
    pub(crate) osec_sizes: Vec<(u64, u64)>,
    /// Chunk index of each regular output section, u32::MAX if empty.
    pub(crate) osec_chunk: Vec<u32>,

    pub(crate) got_entries: Vec<GotEntry<'data>>,
    pub(crate) tlsld_got_idx: i32,
    pub(crate) plt_syms: Vec<&'data Symbol<'data>>,
    pub(crate) pltgot_syms: Vec<&'data Symbol<'data>>,
    pub(crate) copyrel_syms: Vec<&'data Symbol<'data>>,
    pub(crate) copyrel_relro_syms: Vec<&'data Symbol<'data>>,
    pub(crate) aux: Vec<SymbolAux>,

    pub(crate) dynsyms: Vec<DynSymEntry<'data>>,
    pub(crate) num_exported_dynsyms: usize,
    pub(crate) dynsym_versym: Vec<u16>,
    pub(crate) dynstr: StrTab,
    pub(crate) shstrtab_bytes: Vec<u8>,
    pub(crate) verneed_bytes: Vec<u8>,
    pub(crate) verneed_count: u64,

    pub(crate) dt_needed_offsets: Vec<u32>,
    pub(crate) dt_soname_offset: Option<u32>,
    pub(crate) dt_rpath_offset: Option<u32>,
    pub(crate) init_array_range: Option<(u64, u64)>,
    pub(crate) fini_array_range: Option<(u64, u64)>,
    pub(crate) init_addr: Option<u64>,
    pub(crate) fini_addr: Option<u64>,

    pub(crate) combined_features: u32,
    pub(crate) build_id_size: u64,
    pub(crate) num_dynrels: u64,

    pub(crate) tls_begin: u64,
    pub(crate) tls_end: u64,
    pub(crate) entry_addr: u64,
    pub(crate) filesize: u64,

    /// Pre-rendered compressed bytes for debug chunks, keyed by chunk index.
    pub(crate) compressed_debug: hashbrown::HashMap<usize, Vec<u8>>,
}

impl<'data> Link<'data> {
    pub(crate) fn new(machine: Machine, files: Vec<LinkFile<'data>>, ctx: &Context<'data>) -> Link<'data> {
        let has_dso = files.iter().any(|f| f.is_dso());
        Link {
            machine,
            is_pic: ctx.args.is_pic(),
            z_now: ctx.args.z_now,
            z_nodelete: ctx.args.z_nodelete,
            has_textrel: false,
            needs_dynamic: !ctx.args.is_static && (ctx.args.shared || has_dso),
            files,
            chunks: Vec::new(),
            merged: Vec::new(),
            osec_members: Vec::new(),
            osec_sizes: Vec::new(),
            osec_chunk: Vec::new(),
            got_entries: Vec::new(),
            tlsld_got_idx: -1,
            plt_syms: Vec::new(),
            pltgot_syms: Vec::new(),
            copyrel_syms: Vec::new(),
            copyrel_relro_syms: Vec::new(),
            aux: Vec::new(),
            dynsyms: Vec::new(),
            num_exported_dynsyms: 0,
            dynsym_versym: Vec::new(),
            dynstr: StrTab::new(),
            shstrtab_bytes: Vec::new(),
            verneed_bytes: Vec::new(),
            verneed_count: 0,
            dt_needed_offsets: Vec::new(),
            dt_soname_offset: None,
            dt_rpath_offset: None,
            init_array_range: None,
            fini_array_range: None,
            init_addr: None,
            fini_addr: None,
            combined_features: 0,
            build_id_size: 0,
            num_dynrels: 0,
            tls_begin: 0,
            tls_end: 0,
            entry_addr: 0,
            filesize: 0,
            compressed_debug: hashbrown::HashMap::new(),
        }
    }

    pub(crate) fn chunk_idx(&self, kind: ChunkKind) -> Option<usize> {
        self.chunks.iter().position(|chunk| chunk.kind == kind)
    }

    pub(crate) fn chunk_addr(&self, kind: ChunkKind) -> Option<u64> {
        self.chunk_idx(kind).map(|idx| self.chunks[idx].shdr.sh_addr)
    }

    pub(crate) fn chunk_addr_sized(&self, kind: ChunkKind) -> Option<(u64, u64)> {
        self.chunk_idx(kind)
            .map(|idx| (self.chunks[idx].shdr.sh_addr, self.chunks[idx].shdr.sh_size))
            .filter(|&(_, size)| size > 0)
    }

    pub(crate) fn sym_is_ifunc(&self, sym: &Symbol) -> bool {
        let core = sym.core.lock().unwrap();
        let Some(owner) = core.file else { return false };
        match &self.files[owner.as_usize()] {
            LinkFile::Object(obj) => {
                obj.esyms
                    .get(core.sym_idx as usize)
                    .is_some_and(|esym| esym.st_type() == object::elf::STT_GNU_IFUNC)
            }
            _ => false,
        }
    }

    /// ELF type and size of a symbol, from the defining file's symbol table.
    pub(crate) fn sym_type_and_size(
        &self,
        _sym: &Symbol,
        core: &crate::symbol::SymbolCore,
    ) -> (u8, u64) {
        let Some(owner) = core.file else {
            return (object::elf::STT_NOTYPE, 0);
        };
        match &self.files[owner.as_usize()] {
            LinkFile::Object(obj) => obj
                .esyms
                .get(core.sym_idx as usize)
                .map_or((object::elf::STT_NOTYPE, 0), |esym| {
                    (esym.st_type(), esym.st_size.get(LE))
                }),
            LinkFile::Shared(dso) => dso
                .esyms
                .get(core.sym_idx as usize)
                .map_or((object::elf::STT_NOTYPE, 0), |esym| {
                    (esym.st_type(), esym.st_size.get(LE))
                }),
            LinkFile::Internal(_) => (object::elf::STT_NOTYPE, 0),
        }
    }

    /// Output section header index covering `addr`, for symbol table emission.
    pub(crate) fn shndx_for_addr(&self, addr: u64) -> u16 {
        for chunk in &self.chunks {
            if chunk.shndx != 0
                && chunk.is_alloc()
                && addr >= chunk.shdr.sh_addr
                && addr < chunk.shdr.sh_addr + chunk.shdr.sh_size.max(1)
            {
                return chunk.shndx as u16;
            }
        }
        object::elf::SHN_ABS
    }

    pub(crate) fn alive_objects(&self) -> impl Iterator<Item = &ObjectFile<'data>> {
        self.files
            .iter()
            .filter(|f| f.is_alive())
            .filter_map(|f| f.as_object())
    }

    pub(crate) fn alive_dsos(&self) -> impl Iterator<Item = &SharedFile<'data>> {
        self.files
            .iter()
            .filter(|f| f.is_alive())
            .filter_map(|f| f.as_shared())
    }
}

/// Parses every input in parallel. File IDs are load-order; 0 is the internal file.
pub(crate) fn parse_input_files<'data>(
    ctx: &Context<'data>,
    input_data: &'data InputData,
) -> Result<Vec<LinkFile<'data>>> {
    crate::timing_phase!("Parse input files");

    let mut parsed: Vec<LinkFile<'data>> = input_data
        .inputs
        .par_iter()
        .enumerate()
        .map(|(i, input)| {
            let file_id = FileId(i as u32 + 1);
            match input.kind {
                FileKind::ElfObject => {
                    ObjectFile::parse(ctx, input_data, input, file_id).map(LinkFile::Object)
                }
                FileKind::ElfDynamic => {
                    SharedFile::parse(ctx, input_data, input, file_id).map(LinkFile::Shared)
                }
                _ => unreachable!("non-object input survived loading"),
            }
        })
        .collect::<Result<_>>()?;

    let mut files = Vec::with_capacity(parsed.len() + 1);
    files.push(LinkFile::Internal(InternalFile::new(INTERNAL_FILE_ID)));
    files.append(&mut parsed);

    let machines: Vec<Machine> = files
        .iter()
        .filter_map(|f| f.as_object().map(|obj| obj.machine))
        .dedup()
        .collect();
    match machines.as_slice() {
        [] => bail!("no object files in input"),
        [_] => {}
        _ => bail!("incompatible machine types in input files"),
    }

    Ok(files)
}

/// Sizes the fragment maps from the estimators, then interns every file's fragments.
pub(crate) fn register_section_pieces<'data>(
    ctx: &Context<'data>,
    files: &mut [LinkFile<'data>],
) -> Result {
    crate::timing_phase!("Register section pieces");

    for merged in ctx.merged_sections() {
        merged.reserve_from_estimate();
    }

    files
        .par_iter_mut()
        .try_for_each(|file| match file {
            LinkFile::Object(obj) => obj.register_section_pieces(ctx),
            _ => Ok(()),
        })
}

pub(crate) fn apply_exclude_libs<'data>(ctx: &Context<'data>, files: &mut [LinkFile<'data>]) {
    if ctx.args.exclude_libs.is_empty() {
        return;
    }
    let all = ctx.args.exclude_libs.iter().any(|lib| lib == "ALL");
    for file in files {
        if let LinkFile::Object(obj) = file {
            if let Some(archive) = &obj.archive_name {
                if all || ctx.args.exclude_libs.iter().any(|lib| lib == archive) {
                    obj.exclude_libs = true;
                }
            }
        }
    }
}

/// Symbol resolution: lazy candidates, regular definitions, the liveness fixpoint over archive
/// members, DSO liveness, then common symbols.
pub(crate) fn resolve_symbols<'data>(ctx: &Context<'data>, files: &[LinkFile<'data>]) -> Result {
    crate::timing_phase!("Resolve symbols");

    files.par_iter().for_each(|file| match file {
        LinkFile::Object(obj) => {
            if obj.is_in_lib {
                obj.resolve_lazy_symbols(ctx, files);
            } else {
                obj.resolve_regular_symbols(ctx, files);
            }
        }
        LinkFile::Shared(dso) => dso.resolve_dso_symbols(ctx, files),
        LinkFile::Internal(_) => {}
    });

    // Pull in archive members reachable from live objects, to a fixpoint.
    let feeder: SegQueue<FileId> = SegQueue::new();
    for name in ctx.args.undefined.iter().chain(&ctx.args.require_defined) {
        if let Some(sym) = ctx.symbol_interner.get(name.as_bytes()) {
            let owner = sym.core.lock().unwrap().file;
            if let Some(owner) = owner {
                let file = &files[owner.as_usize()];
                if !file.is_dso() && file.make_alive() {
                    feeder.push(owner);
                }
            }
        }
    }

    let live: Vec<FileId> = files
        .iter()
        .filter(|f| f.is_alive() && f.as_object().is_some())
        .map(|f| f.file_id())
        .collect();
    for id in live {
        feeder.push(id);
    }

    rayon::scope(|scope| {
        while let Some(id) = feeder.pop() {
            let files_ref = files;
            scope.spawn(move |scope| {
                mark_live_recursive(ctx, files_ref, id, scope);
            });
        }
    });

    // Unused archive members release their claims so later tiers can settle.
    files.par_iter().for_each(|file| {
        if let LinkFile::Object(obj) = file {
            if !obj.is_alive.load(Ordering::Relaxed) {
                obj.clear_symbols();
            }
        }
    });

    // A strong undefined reference from a live object makes its owning DSO really needed,
    // --as-needed notwithstanding.
    files.par_iter().for_each(|file| {
        let Some(obj) = file.as_object() else { return };
        if !obj.is_alive.load(Ordering::Relaxed) {
            return;
        }
        for i in obj.first_global..obj.esyms.len() {
            let esym = &obj.esyms[i];
            if esym.st_shndx.get(LE) != object::elf::SHN_UNDEF
                || esym.st_bind() == object::elf::STB_WEAK
            {
                continue;
            }
            let sym = obj.symbol_at(i);
            let mut core = sym.core.lock().unwrap();
            if let Some(owner) = core.file {
                if files[owner.as_usize()].is_dso() {
                    files[owner.as_usize()].make_alive();
                    core.is_weak = false;
                }
            }
        }
    });

    // Claims from unreferenced DSOs evaporate with them.
    files.par_iter().for_each(|file| {
        if let LinkFile::Shared(dso) = file {
            if !dso.is_alive.load(Ordering::Relaxed) {
                dso.clear_symbols();
            }
        }
    });

    files.par_iter().for_each(|file| {
        if let LinkFile::Object(obj) = file {
            if obj.is_alive.load(Ordering::Relaxed) {
                obj.resolve_common_symbols(ctx, files);
            }
        }
    });

    if let Some(sym) = ctx.symbol_interner.get(b"__gnu_lto_slim") {
        if sym.core.lock().unwrap().file.is_some() {
            bail!("input files contain GCC intermediate code, which is not supported");
        }
    }

    Ok(())
}

fn mark_live_recursive<'a, 'data: 'a>(
    ctx: &'a Context<'data>,
    files: &'a [LinkFile<'data>],
    id: FileId,
    scope: &rayon::Scope<'a>,
) {
    let Some(obj) = files[id.as_usize()].as_object() else {
        return;
    };
    let mut found = Vec::new();
    obj.mark_live_objects(ctx, files, &mut |next| found.push(next));
    for next in found {
        scope.spawn(move |scope| mark_live_recursive(ctx, files, next, scope));
    }
}

/// Creates the internal file's synthetic symbols. Runs after resolution so real definitions
/// keep precedence.
pub(crate) fn create_internal_symbols<'data>(
    ctx: &Context<'data>,
    files: &mut Vec<LinkFile<'data>>,
) {
    crate::timing_phase!("Create internal symbols");

    let mut internal = InternalFile::new(INTERNAL_FILE_ID);
    {
        let files_ref: &[LinkFile<'data>] = files;
        let mut add = |name: &'data [u8]| internal.add_symbol(ctx, files_ref, name);

        add(b"__ehdr_start");
        add(b"__executable_start");
        add(b"__init_array_start");
        add(b"__init_array_end");
        add(b"__fini_array_start");
        add(b"__fini_array_end");
        add(b"__preinit_array_start");
        add(b"__preinit_array_end");
        add(b"_DYNAMIC");
        add(b"_GLOBAL_OFFSET_TABLE_");
        add(b"__bss_start");
        add(b"_end");
        add(b"_etext");
        add(b"_edata");
        add(b"__rela_iplt_start");
        add(b"__rela_iplt_end");
        if ctx.args.eh_frame_hdr {
            add(b"__GNU_EH_FRAME_HDR");
        }
        for name in [b"end".as_slice(), b"etext", b"edata"] {
            if ctx
                .symbol_interner
                .get(name)
                .is_none_or(|sym| sym.core.lock().unwrap().file.is_none())
            {
                add(ctx.save_bytes(name.to_vec()));
            }
        }
    }
    files[0] = LinkFile::Internal(internal);
}

pub(crate) fn eliminate_comdats<'data>(files: &[LinkFile<'data>]) {
    crate::timing_phase!("Eliminate comdats");

    files.par_iter().for_each(|file| {
        if let Some(obj) = file.as_object() {
            obj.resolve_comdat_groups();
        }
    });
    files.par_iter().for_each(|file| {
        if let Some(obj) = file.as_object() {
            obj.eliminate_duplicate_comdat_groups();
        }
    });
}

pub(crate) fn convert_common_symbols<'data>(ctx: &Context<'data>, files: &mut [LinkFile<'data>]) {
    crate::timing_phase!("Convert common symbols");

    files.par_iter_mut().for_each(|file| {
        if let LinkFile::Object(obj) = file {
            if obj.is_alive.load(Ordering::Relaxed) {
                obj.convert_common_symbols(ctx);
            }
        }
    });
}

pub(crate) fn apply_version_script<'data>(
    ctx: &Context<'data>,
    files: &[LinkFile<'data>],
    script: &VersionScript,
) {
    if script.is_empty() {
        return;
    }
    crate::timing_phase!("Apply version script");

    files.par_iter().for_each(|file| {
        let Some(obj) = file.as_object() else { return };
        for i in obj.first_global..obj.esyms.len() {
            let sym = obj.symbol_at(i);
            let mut core = sym.core.lock().unwrap();
            if core.file != Some(obj.file_id) {
                continue;
            }
            if script.is_local(sym.name) {
                core.ver_idx = object::elf::VER_NDX_LOCAL;
            }
        }
    });
}

/// Decides which symbols are exported to (and imported from) the dynamic table.
pub(crate) fn compute_import_export<'data>(ctx: &Context<'data>, files: &[LinkFile<'data>]) {
    crate::timing_phase!("Compute import/export");

    // Symbols that DSOs reference and we define get exported.
    if !ctx.args.shared {
        files.par_iter().for_each(|file| {
            let Some(dso) = file.as_shared() else { return };
            if !dso.is_alive.load(Ordering::Relaxed) {
                return;
            }
            for sym in &dso.globals {
                let mut core = sym.core.lock().unwrap();
                let Some(owner) = core.file else { continue };
                if !files[owner.as_usize()].is_dso()
                    && sym.get_visibility() != object::elf::STV_HIDDEN
                {
                    core.is_exported = true;
                }
            }
        });
    }

    // Non-hidden globals are exported from shared objects (and with --export-dynamic, from
    // executables too).
    if ctx.args.shared || ctx.args.export_dynamic {
        files.par_iter().for_each(|file| {
            let Some(obj) = file.as_object() else { return };
            if !obj.is_alive.load(Ordering::Relaxed) {
                return;
            }
            for i in obj.first_global..obj.esyms.len() {
                let sym = obj.symbol_at(i);
                let mut core = sym.core.lock().unwrap();
                if core.file != Some(obj.file_id) {
                    continue;
                }
                if sym.get_visibility() == object::elf::STV_HIDDEN
                    || core.ver_idx == object::elf::VER_NDX_LOCAL
                {
                    continue;
                }
                core.is_exported = true;
                if ctx.args.shared && sym.get_visibility() != object::elf::STV_PROTECTED {
                    core.is_imported = true;
                }
            }
        });
    }
}

/// Marks every fragment of every live object alive (the no-GC path), appends the linker
/// identification to .comment, then lays out each merged section.
pub(crate) fn compute_merged_section_sizes<'data>(
    ctx: &Context<'data>,
    link: &mut Link<'data>,
) -> Result {
    crate::timing_phase!("Compute merged section sizes");

    if !ctx.args.gc_sections {
        link.files.par_iter().for_each(|file| {
            let Some(obj) = file.as_object() else { return };
            if !obj.is_alive.load(Ordering::Relaxed) {
                return;
            }
            for mergeable in obj.mergeable_sections.iter().flatten() {
                for frag in &mergeable.fragments {
                    frag.mark_alive();
                }
            }
        });
    }

    add_comment_string(ctx, format!("mold {}", env!("CARGO_PKG_VERSION")));
    if ctx.args.embed_cmdline {
        add_comment_string(ctx, format!("mold command line: {}", ctx.args.cmdline.join(" ")));
    }

    link.merged = ctx.merged_sections();
    link.merged.par_iter().for_each(|merged| {
        merged.assign_offsets();
    });
    Ok(())
}

fn add_comment_string<'data>(ctx: &Context<'data>, text: String) {
    let merged = ctx.merged_section(b".comment", object::elf::SHT_PROGBITS,
        u64::from(object::elf::SHF_MERGE | object::elf::SHF_STRINGS));
    let mut bytes = text.into_bytes();
    bytes.push(0);
    let data = ctx.save_bytes(bytes);
    let frag = merged.insert(ctx.fragment_arena, data, crate::hash::hash_bytes(data), 1);
    frag.mark_alive();
}

/// Builds the reverse edge from output sections to their input sections. Appending is done into
/// per-shard bins merged by a serial step, since an output section can have millions of members.
pub(crate) fn bin_sections<'data>(ctx: &Context<'data>, link: &mut Link<'data>) {
    crate::timing_phase!("Bin sections");

    let num_osec = ctx.num_output_sections();
    const NUM_SHARDS: usize = 128;
    let files = &link.files;
    let shard_size = files.len().div_ceil(NUM_SHARDS).max(1);

    let bins: Vec<Vec<Vec<SectionRef>>> = files
        .par_chunks(shard_size)
        .map(|shard| {
            let mut bins: Vec<Vec<SectionRef>> = vec![Vec::new(); num_osec];
            for file in shard {
                let Some(obj) = file.as_object() else { continue };
                if !obj.is_alive.load(Ordering::Relaxed) {
                    continue;
                }
                for isec in obj.sections.iter().flatten() {
                    if isec.is_alive() && isec.output_section != crate::input_section::NO_OUTPUT {
                        bins[isec.output_section.0 as usize].push(SectionRef {
                            file: obj.file_id,
                            shndx: isec.shndx,
                        });
                    }
                }
            }
            bins
        })
        .collect();

    let mut members: Vec<Vec<SectionRef>> = vec![Vec::new(); num_osec];
    for (osec_idx, members) in members.iter_mut().enumerate() {
        let total = bins.iter().map(|bin| bin[osec_idx].len()).sum();
        members.reserve(total);
        for bin in &bins {
            members.extend_from_slice(&bin[osec_idx]);
        }
    }
    link.osec_members = members;
}

/// `__start_SECNAME` / `__stop_SECNAME` for output sections whose name is a C identifier.
pub(crate) fn add_start_stop_symbols<'data>(ctx: &Context<'data>, link: &mut Link<'data>) {
    let mut named = Vec::new();
    for (osec_idx, members) in link.osec_members.iter().enumerate() {
        if members.is_empty() {
            continue;
        }
        let info = ctx.output_section_info(OutputSecId(osec_idx as u32));
        if crate::elf::is_c_identifier(info.name) {
            named.push(info.name);
        }
    }

    let LinkFile::Internal(mut internal) = std::mem::replace(
        &mut link.files[0],
        LinkFile::Internal(InternalFile::new(INTERNAL_FILE_ID)),
    ) else {
        unreachable!();
    };
    for name in named {
        let mut start = b"__start_".to_vec();
        start.extend_from_slice(name);
        let mut stop = b"__stop_".to_vec();
        stop.extend_from_slice(name);
        internal.add_symbol(ctx, &link.files, ctx.save_bytes(start));
        internal.add_symbol(ctx, &link.files, ctx.save_bytes(stop));
    }
    link.files[0] = LinkFile::Internal(internal);
}

/// Reports duplicate strong definitions among live sections.
pub(crate) fn check_duplicate_symbols<'data>(ctx: &Context<'data>, files: &[LinkFile<'data>]) -> Result {
    crate::timing_phase!("Check duplicate symbols");

    files.par_iter().for_each(|file| {
        let Some(obj) = file.as_object() else { return };
        if !obj.is_alive.load(Ordering::Relaxed) {
            return;
        }
        for i in obj.first_global..obj.esyms.len() {
            let esym = &obj.esyms[i];
            let shndx = esym.st_shndx.get(LE);
            if shndx == object::elf::SHN_UNDEF
                || shndx == object::elf::SHN_COMMON
                || esym.st_bind() == object::elf::STB_WEAK
            {
                continue;
            }
            let sym = obj.symbol_at(i);
            let owner = sym.core.lock().unwrap().file;
            if owner == Some(obj.file_id) || owner == Some(INTERNAL_FILE_ID) {
                continue;
            }
            // Sections killed by comdat deduplication don't count.
            if shndx != object::elf::SHN_ABS {
                let alive = obj
                    .get_section(esym, i)
                    .is_some_and(|isec| isec.is_alive());
                if !alive {
                    continue;
                }
            }
            let owner_name = owner
                .map(|id| files[id.as_usize()].name().to_owned())
                .unwrap_or_default();
            error::error(format_args!(
                "duplicate symbol: {}: {}: {}",
                obj.name,
                owner_name,
                sym.name_for_display(ctx.args.demangle)
            ));
        }
    });

    error::checkpoint()
}

pub(crate) fn claim_unresolved_symbols<'data>(ctx: &Context<'data>, files: &[LinkFile<'data>]) {
    crate::timing_phase!("Claim unresolved symbols");

    files.par_iter().for_each(|file| {
        if let Some(obj) = file.as_object() {
            obj.claim_unresolved_symbols(ctx, files);
        }
    });
}

/// .init_array.N / .fini_array.N members run in priority order.
pub(crate) fn sort_init_fini<'data>(ctx: &Context<'data>, link: &mut Link<'data>) {
    crate::timing_phase!("Sort init/fini");

    fn priority_of(name: &[u8]) -> i64 {
        let Some(pos) = name.iter().rposition(|&b| b == b'.') else {
            return 65536;
        };
        std::str::from_utf8(&name[pos + 1..])
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(65536)
    }

    for (osec_idx, members) in link.osec_members.iter_mut().enumerate() {
        let info = ctx.output_section_info(OutputSecId(osec_idx as u32));
        if info.name == b".init_array" || info.name == b".fini_array" {
            members.sort_by_key(|sref| priority_of(section_ref(&link.files, *sref).name));
        }
    }
}

/// Assigns each input section its offset within its output section and computes output section
/// sizes/alignments.
pub(crate) fn compute_section_sizes<'data>(link: &mut Link<'data>) {
    crate::timing_phase!("Compute section sizes");

    let files = &link.files;
    link.osec_sizes = link
        .osec_members
        .par_iter()
        .map(|members| {
            let mut offset = 0u64;
            let mut align = 1u64;
            for sref in members {
                let isec = section_ref(files, *sref);
                offset = elf::align_to(offset, isec.sh_addralign);
                isec.offset.store(offset, Ordering::Relaxed);
                offset += isec.sh_size;
                align = align.max(isec.sh_addralign);
            }
            (offset, align)
        })
        .collect();
}

/// Relocation scanning followed by the serialization that allocates table slots in canonical
/// symbol order.
pub(crate) fn scan_rels<'data>(ctx: &Context<'data>, link: &mut Link<'data>) -> Result {
    crate::timing_phase!("Scan relocations");

    // Phase 1: parallel classification, accumulating needs-flags on the referenced symbols and
    // per-reloc output decisions on the sections.
    link.files.par_iter().for_each(|file| {
        if let Some(obj) = file.as_object() {
            if obj.is_alive.load(Ordering::Relaxed) {
                obj.scan_relocations(ctx, &link.files);
            }
        }
    });

    error::checkpoint()?;

    // COPYREL symbols alias other dylib symbols at the same address; those need dynsym too.
    for file in &link.files {
        let Some(dso) = file.as_shared() else { continue };
        if !dso.is_alive.load(Ordering::Relaxed) {
            continue;
        }
        for sym in &dso.symbols {
            if sym.needs_flags().contains(NeedsFlags::COPYREL)
                && sym.core.lock().unwrap().file == Some(dso.file_id)
            {
                for alias in dso.find_aliases(sym) {
                    alias.add_flags(NeedsFlags::DYNSYM);
                }
            }
        }
    }

    // Imported and exported symbols need dynsym entries regardless of relocations.
    if link.needs_dynamic {
        link.files.par_iter().for_each(|file| {
            let Some(obj) = file.as_object() else { return };
            if !obj.is_alive.load(Ordering::Relaxed) {
                return;
            }
            for i in obj.first_global..obj.esyms.len() {
                let sym = obj.symbol_at(i);
                let core = sym.core.lock().unwrap();
                if core.is_imported || core.is_exported {
                    drop(core);
                    sym.add_flags(NeedsFlags::DYNSYM);
                }
            }
        });
    }

    serialize_table_slots(link);
    Ok(())
}

/// Allocates GOT/PLT/COPYREL/dynsym slots in canonical (file, symbol) order.
fn serialize_table_slots<'data>(link: &mut Link<'data>) {
    crate::timing_phase!("Assign table slots");

    // Gather flagged symbols deterministically: file order, then symbol index.
    let mut flagged: Vec<&'data Symbol<'data>> = Vec::new();
    let mut seen = hashbrown::HashSet::new();
    for file in &link.files {
        match file {
            LinkFile::Object(obj) => {
                if !obj.is_alive.load(Ordering::Relaxed) {
                    continue;
                }
                for i in 0..obj.esyms.len() {
                    if let crate::object_file::SymbolRef::Global(sym) = obj.symbols[i] {
                        if sym.needs_flags().bits() != 0
                            && seen.insert(sym as *const Symbol as usize)
                        {
                            flagged.push(sym);
                        }
                    }
                }
            }
            LinkFile::Shared(dso) => {
                if !dso.is_alive.load(Ordering::Relaxed) {
                    continue;
                }
                for sym in &dso.symbols {
                    if sym.needs_flags().bits() != 0 && seen.insert(*sym as *const Symbol as usize)
                    {
                        flagged.push(sym);
                    }
                }
            }
            LinkFile::Internal(_) => {}
        }
    }

    // Local symbols can need GOT slots too (e.g. GOTPCREL to a local). They never need dynsym.
    let mut flagged_locals: Vec<&'data Symbol<'data>> = Vec::new();
    for file in &link.files {
        let Some(obj) = file.as_object() else { continue };
        if !obj.is_alive.load(Ordering::Relaxed) {
            continue;
        }
        for &local in &obj.locals {
            if local.needs_flags().bits() != 0 {
                flagged_locals.push(local);
            }
        }
    }
    for local in flagged_locals {
        assign_slots_for(link, local);
    }

    for sym in flagged {
        assign_slots_for(link, sym);
    }
}

fn ensure_aux(link: &mut Link, sym: &Symbol) -> usize {
    if let Some(idx) = sym.aux() {
        return idx;
    }
    let idx = link.aux.len();
    link.aux.push(SymbolAux::default());
    sym.aux_idx.store(idx as i32, Ordering::Relaxed);
    idx
}

fn assign_slots_for<'data>(link: &mut Link<'data>, sym: &'data Symbol<'data>) {
    let flags = sym.needs_flags();
    if flags.bits() == 0 {
        return;
    }
    let aux_idx = ensure_aux(link, sym);

    let next_got_slot = |link: &Link| {
        link.got_entries
            .iter()
            .map(|entry| entry.num_slots())
            .sum::<u64>() as i32
    };

    if flags.contains(NeedsFlags::GOT) && link.aux[aux_idx].got_idx < 0 {
        link.aux[aux_idx].got_idx = next_got_slot(link);
        link.got_entries.push(GotEntry::Got(sym));
    }
    if flags.contains(NeedsFlags::GOTTP) && link.aux[aux_idx].gottp_idx < 0 {
        link.aux[aux_idx].gottp_idx = next_got_slot(link);
        link.got_entries.push(GotEntry::GotTp(sym));
    }
    if flags.contains(NeedsFlags::TLSGD) && link.aux[aux_idx].tlsgd_idx < 0 {
        link.aux[aux_idx].tlsgd_idx = next_got_slot(link);
        link.got_entries.push(GotEntry::TlsGd(sym));
    }
    if flags.contains(NeedsFlags::TLSDESC) && link.aux[aux_idx].tlsdesc_idx < 0 {
        link.aux[aux_idx].tlsdesc_idx = next_got_slot(link);
        link.got_entries.push(GotEntry::TlsDesc(sym));
    }
    if flags.contains(NeedsFlags::TLSLD) && link.tlsld_got_idx < 0 {
        link.tlsld_got_idx = next_got_slot(link);
        link.got_entries.push(GotEntry::TlsLd);
    }

    if flags.contains(NeedsFlags::PLT) {
        let is_imported = sym.core.lock().unwrap().is_imported;
        if flags.contains(NeedsFlags::GOT) && !(!link.is_pic && is_imported) {
            // The symbol already has a GOT entry the loader will bind, so the PLT entry can
            // jump through it and no lazy-binding slot is needed.
            if link.aux[aux_idx].pltgot_idx < 0 {
                link.aux[aux_idx].pltgot_idx = link.pltgot_syms.len() as i32;
                link.pltgot_syms.push(sym);
            }
        } else if link.aux[aux_idx].plt_idx < 0 {
            // Canonical or plain lazy PLT; keeping .plt and .got from referring to each other.
            link.aux[aux_idx].plt_idx = link.plt_syms.len() as i32;
            link.plt_syms.push(sym);
        }
        sym.add_flags(NeedsFlags::DYNSYM);
    }

    if flags.contains(NeedsFlags::COPYREL) {
        let owner = sym.core.lock().unwrap().file;
        if let Some(owner) = owner {
            if let Some(dso) = link.files[owner.as_usize()].as_shared() {
                let readonly = dso.is_readonly(sym);
                sym.has_copyrel.store(true, Ordering::Relaxed);
                sym.copyrel_readonly.store(readonly, Ordering::Relaxed);
                if readonly {
                    link.copyrel_relro_syms.push(sym);
                } else {
                    link.copyrel_syms.push(sym);
                }
                sym.add_flags(NeedsFlags::DYNSYM);

                for alias in dso.find_aliases(sym) {
                    alias.has_copyrel.store(true, Ordering::Relaxed);
                    alias.copyrel_readonly.store(readonly, Ordering::Relaxed);
                    alias.add_flags(NeedsFlags::DYNSYM);
                    // The alias will be pointed at the same copied location once offsets are
                    // assigned.
                }
            }
        }
    }
}
