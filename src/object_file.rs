//! Parsed views of input files: relocatable objects, shared objects and the linker's own
//! internal file. The resolution passes in here are each parallel over all files; every symbol
//! is protected by its own mutex and all the liveness bits are atomic, so the passes only ever
//! take per-symbol locks.

use crate::arch::Machine;
use crate::arch::ScanKind;
use crate::context::Context;
use crate::context::ComdatGroup;
use crate::context::OutputSecId;
use crate::eh_frame;
use crate::elf::Rela;
use crate::elf::Sym;
use crate::error;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::input_data::InputBytes;
use crate::input_data::InputData;
use crate::input_section::InputSection;
use crate::input_section::NO_OUTPUT;
use crate::input_section::NO_SECTION;
use crate::input_section::RelFragment;
use crate::input_section::rel_flags;
use crate::string_merging::MergeableSection;
use crate::string_merging::SectionFragment;
use crate::string_merging::split_section;
use crate::symbol::FileId;
use crate::symbol::NeedsFlags;
use crate::symbol::RANK_UNCLAIMED;
use crate::symbol::Symbol;
use crate::symbol::SymbolPlace;
use crate::symbol::rank;
use anyhow::Context as _;
use anyhow::bail;
use object::LittleEndian as LE;
use object::read::elf::FileHeader as _;
use object::read::elf::SectionHeader as _;
use object::read::elf::Sym as _;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

pub(crate) enum LinkFile<'data> {
    Internal(InternalFile<'data>),
    Object(ObjectFile<'data>),
    Shared(SharedFile<'data>),
}

impl<'data> LinkFile<'data> {
    pub(crate) fn file_id(&self) -> FileId {
        match self {
            LinkFile::Internal(f) => f.file_id,
            LinkFile::Object(f) => f.file_id,
            LinkFile::Shared(f) => f.file_id,
        }
    }

    pub(crate) fn name(&self) -> &str {
        match self {
            LinkFile::Internal(_) => "<internal>",
            LinkFile::Object(f) => &f.name,
            LinkFile::Shared(f) => &f.name,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        match self {
            LinkFile::Internal(_) => true,
            LinkFile::Object(f) => f.is_alive.load(Ordering::Relaxed),
            LinkFile::Shared(f) => f.is_alive.load(Ordering::Relaxed),
        }
    }

    /// Flips the file alive, returning whether this call did the flip.
    pub(crate) fn make_alive(&self) -> bool {
        match self {
            LinkFile::Internal(_) => false,
            LinkFile::Object(f) => !f.is_alive.swap(true, Ordering::Relaxed),
            LinkFile::Shared(f) => !f.is_alive.swap(true, Ordering::Relaxed),
        }
    }

    pub(crate) fn is_dso(&self) -> bool {
        matches!(self, LinkFile::Shared(_))
    }

    pub(crate) fn as_object(&self) -> Option<&ObjectFile<'data>> {
        match self {
            LinkFile::Object(f) => Some(f),
            _ => None,
        }
    }

    pub(crate) fn as_shared(&self) -> Option<&SharedFile<'data>> {
        match self {
            LinkFile::Shared(f) => Some(f),
            _ => None,
        }
    }

    /// (is_weak, is_common) of the file's ELF symbol backing `sym_idx`. Used for rank
    /// comparisons against the current owner of a symbol.
    fn esym_bind(&self, sym_idx: u32) -> (bool, bool) {
        match self {
            LinkFile::Internal(_) => (false, false),
            LinkFile::Object(f) => {
                let esym = &f.esyms[sym_idx as usize];
                (
                    esym.st_bind() == object::elf::STB_WEAK,
                    esym.st_shndx.get(LE) == object::elf::SHN_COMMON,
                )
            }
            LinkFile::Shared(f) => {
                let esym = &f.esyms[sym_idx as usize];
                (esym.st_bind() == object::elf::STB_WEAK, false)
            }
        }
    }

    /// Resolves a symbol reference belonging to this file.
    pub(crate) fn symbol(&self, symref: SymbolRef<'data>) -> &'data Symbol<'data> {
        match symref {
            SymbolRef::Global(sym) => sym,
            SymbolRef::Local(idx) => match self {
                LinkFile::Object(f) => f.locals[idx as usize],
                _ => unreachable!("local symbol on non-object file"),
            },
        }
    }
}

/// The rank of whatever currently owns the symbol, given its locked core. The rank check and
/// the override must happen under one lock acquisition or two racing resolvers could both
/// decide they win.
pub(crate) fn rank_of_core(files: &[LinkFile], core: &crate::symbol::SymbolCore) -> u64 {
    let Some(file_id) = core.file else {
        return RANK_UNCLAIMED;
    };
    let file = &files[file_id.as_usize()];
    let (is_weak, is_common) = file.esym_bind(core.sym_idx);
    rank(file_id, file.is_dso(), is_weak, is_common, core.is_lazy)
}

#[derive(Clone, Copy)]
pub(crate) enum SymbolRef<'data> {
    Local(u32),
    Global(&'data Symbol<'data>),
}

/// The linker's own file: it defines the synthetic symbols like `__init_array_start` and
/// `_GLOBAL_OFFSET_TABLE_`. All of them are hidden absolute-or-chunk symbols that get their
/// final values once layout has run.
pub(crate) struct InternalFile<'data> {
    pub(crate) file_id: FileId,
    pub(crate) symbols: Vec<&'data Symbol<'data>>,
}

impl<'data> InternalFile<'data> {
    pub(crate) fn new(file_id: FileId) -> InternalFile<'data> {
        InternalFile {
            file_id,
            symbols: Vec::new(),
        }
    }

    /// Claims `name` as a hidden linker-synthesized symbol unless something else defines it.
    pub(crate) fn add_symbol(
        &mut self,
        ctx: &Context<'data>,
        files: &[LinkFile<'data>],
        name: &'data [u8],
    ) -> &'data Symbol<'data> {
        let sym = ctx.intern(name);
        let sym_idx = self.symbols.len() as u32;
        {
            let my_rank = rank(self.file_id, false, false, false, false);
            let mut core = sym.core.lock().unwrap();
            if my_rank < rank_of_core(files, &core) {
                core.file = Some(self.file_id);
                core.sym_idx = sym_idx;
                core.value = 0;
                core.place = SymbolPlace::Absolute;
                core.is_lazy = false;
                core.is_weak = false;
                core.is_imported = false;
                core.is_exported = false;
            }
        }
        sym.merge_visibility(object::elf::STV_HIDDEN);
        self.symbols.push(sym);
        sym
    }
}

pub(crate) struct ObjectFile<'data> {
    pub(crate) file_id: FileId,
    pub(crate) name: String,
    pub(crate) is_in_lib: bool,
    pub(crate) archive_name: Option<String>,
    pub(crate) is_alive: AtomicBool,

    /// Set by --exclude-libs: definitions from this file get hidden visibility.
    pub(crate) exclude_libs: bool,

    pub(crate) machine: Machine,
    pub(crate) data: &'data [u8],

    shdrs: &'data [crate::elf::SectionHeader],
    shstrtab: &'data [u8],
    symtab_shndx: &'data [object::U32Bytes<LE>],

    pub(crate) esyms: &'data [Sym],
    pub(crate) first_global: usize,
    symbol_strtab: &'data [u8],

    pub(crate) sections: Vec<Option<InputSection<'data>>>,
    pub(crate) mergeable_sections: Vec<Option<MergeableSection<'data>>>,

    pub(crate) locals: Vec<&'data Symbol<'data>>,
    pub(crate) symbols: Vec<SymbolRef<'data>>,

    /// Version suffix (after '@') of each global, if any.
    pub(crate) symvers: Vec<Option<&'data [u8]>>,

    /// Fragment + residual addend for symbols that point into mergeable sections.
    pub(crate) sym_fragments: Vec<Option<(&'data SectionFragment<'data>, u64)>>,

    pub(crate) comdat_groups: Vec<(&'data ComdatGroup, &'data [object::U32Bytes<LE>])>,

    pub(crate) cies: Vec<eh_frame::CieRecord>,
    pub(crate) fdes: Vec<eh_frame::FdeRecord>,
    pub(crate) ehframe_shndx: Option<u32>,

    /// ORed GNU_PROPERTY_X86_FEATURE_1_AND bits from .note.gnu.property.
    pub(crate) features: u32,

    pub(crate) has_common_symbol: bool,

    // Symbol table accounting, filled by compute_symtab.
    pub(crate) num_local_symtab: u64,
    pub(crate) num_global_symtab: u64,
    pub(crate) strtab_size: u64,
    pub(crate) local_symtab_offset: u64,
    pub(crate) global_symtab_offset: u64,
    pub(crate) strtab_offset: u64,
}

fn strtab_name<'data>(strtab: &'data [u8], offset: u32) -> &'data [u8] {
    let offset = offset as usize;
    if offset >= strtab.len() {
        return b"";
    }
    let rest = &strtab[offset..];
    let end = memchr::memchr(0, rest).unwrap_or(rest.len());
    &rest[..end]
}

fn is_debug_section(sh_flags: u64, name: &[u8]) -> bool {
    sh_flags & u64::from(object::elf::SHF_ALLOC) == 0
        && (name.starts_with(b".debug") || name.starts_with(b".zdebug"))
}

impl<'data> ObjectFile<'data> {
    pub(crate) fn parse(
        ctx: &Context<'data>,
        input_data: &'data InputData,
        input: &InputBytes,
        file_id: FileId,
    ) -> Result<ObjectFile<'data>> {
        let data = input_data.bytes(input);
        let name = input_data.display_name(input);

        // --exclude-libs matches on the archive's own file name.
        let archive_name = input.member_name.as_ref().map(|_| {
            input_data.mapped[input.mapped]
                .name
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });

        Self::parse_bytes(ctx, data, name, archive_name, input, file_id)
            .with_context(|| format!("cannot parse {}", input_data.display_name(input)))
    }

    fn parse_bytes(
        ctx: &Context<'data>,
        data: &'data [u8],
        name: String,
        archive_name: Option<String>,
        input: &InputBytes,
        file_id: FileId,
    ) -> Result<ObjectFile<'data>> {
        debug_assert_eq!(input.kind, FileKind::ElfObject);

        let header = crate::elf::FileHeader::parse(data)?;
        let machine = Machine::from_e_machine(header.e_machine(LE))?;
        // `sections` honors the extended-count redirections: a zero e_shnum redirects through
        // section 0's sh_size, and SHN_XINDEX redirects e_shstrndx through section 0's sh_link.
        let sections = header.sections(LE, data)?;
        let shdrs: &'data [crate::elf::SectionHeader] = sections.iter().as_slice();
        let shstrtab_index = header.shstrndx(LE, data)? as usize;
        let shstrtab = if shstrtab_index == 0 {
            &[]
        } else {
            shdrs
                .get(shstrtab_index)
                .context("bad e_shstrndx")?
                .data(LE, data)?
        };

        let mut file = ObjectFile {
            file_id,
            name,
            is_in_lib: input.is_in_lib,
            archive_name,
            is_alive: AtomicBool::new(!input.is_in_lib),
            exclude_libs: false,
            machine,
            data,
            shdrs,
            shstrtab,
            symtab_shndx: &[],
            esyms: &[],
            first_global: 0,
            symbol_strtab: &[],
            sections: Vec::new(),
            mergeable_sections: Vec::new(),
            locals: Vec::new(),
            symbols: Vec::new(),
            symvers: Vec::new(),
            sym_fragments: Vec::new(),
            comdat_groups: Vec::new(),
            cies: Vec::new(),
            fdes: Vec::new(),
            ehframe_shndx: None,
            features: 0,
            has_common_symbol: false,
            num_local_symtab: 0,
            num_global_symtab: 0,
            strtab_size: 0,
            local_symtab_offset: 0,
            global_symtab_offset: 0,
            strtab_offset: 0,
        };

        for shdr in shdrs {
            match shdr.sh_type(LE) {
                object::elf::SHT_SYMTAB => {
                    file.esyms = shdr.data_as_array(LE, data)?;
                    file.first_global = shdr.sh_info(LE) as usize;
                    let strtab_shdr = shdrs
                        .get(shdr.sh_link(LE) as usize)
                        .context("bad symtab sh_link")?;
                    file.symbol_strtab = strtab_shdr.data(LE, data)?;
                }
                object::elf::SHT_SYMTAB_SHNDX => {
                    file.symtab_shndx = shdr.data_as_array(LE, data)?;
                }
                _ => {}
            }
        }

        file.initialize_sections(ctx)?;
        file.initialize_symbols(ctx)?;
        file.initialize_mergeable_sections(ctx)?;
        file.initialize_ehframe_sections()?;
        Ok(file)
    }

    pub(crate) fn section_name(&self, shdr: &crate::elf::SectionHeader) -> &'data [u8] {
        strtab_name(self.shstrtab, shdr.sh_name(LE))
    }

    /// The section index an ELF symbol refers to, following SHN_XINDEX indirection.
    pub(crate) fn get_shndx(&self, esym: &Sym, sym_idx: usize) -> u32 {
        let shndx = esym.st_shndx.get(LE);
        if shndx == object::elf::SHN_XINDEX {
            self.symtab_shndx
                .get(sym_idx)
                .map_or(0, |v| v.get(LE))
        } else {
            u32::from(shndx)
        }
    }

    pub(crate) fn get_section(&self, esym: &Sym, sym_idx: usize) -> Option<&InputSection<'data>> {
        self.sections
            .get(self.get_shndx(esym, sym_idx) as usize)?
            .as_ref()
    }

    fn initialize_sections(&mut self, ctx: &Context<'data>) -> Result {
        self.sections = (0..self.shdrs.len()).map(|_| None).collect();

        for (i, shdr) in self.shdrs.iter().enumerate() {
            let sh_type = shdr.sh_type(LE);
            let sh_flags = shdr.sh_flags(LE);

            if sh_flags & u64::from(object::elf::SHF_EXCLUDE) != 0
                && sh_flags & u64::from(object::elf::SHF_ALLOC) == 0
            {
                continue;
            }

            match sh_type {
                object::elf::SHT_GROUP => {
                    let entries: &'data [object::U32Bytes<LE>] = shdr.data_as_array(LE, self.data)?;
                    let (first, members) = entries
                        .split_first()
                        .context("empty SHT_GROUP section")?;
                    // Group member words are read with the input's endianness and compared as
                    // native integers.
                    if first.get(LE) == 0 {
                        continue;
                    }
                    if first.get(LE) != object::elf::GRP_COMDAT {
                        bail!("unsupported SHT_GROUP format");
                    }
                    let signature_sym = self
                        .esyms
                        .get(shdr.sh_info(LE) as usize)
                        .context("invalid symbol index in SHT_GROUP")?;
                    let signature = strtab_name(self.symbol_strtab, signature_sym.st_name.get(LE));
                    let group = ctx.comdat_group(signature);
                    self.comdat_groups.push((group, members));
                }
                object::elf::SHT_SYMTAB
                | object::elf::SHT_SYMTAB_SHNDX
                | object::elf::SHT_STRTAB
                | object::elf::SHT_REL
                | object::elf::SHT_RELA
                | object::elf::SHT_NULL => {}
                _ => {
                    let name = self.section_name(shdr);
                    if name == b".note.GNU-stack" || name.starts_with(b".gnu.warning.") {
                        continue;
                    }
                    if name == b".note.gnu.property" {
                        self.features = read_note_gnu_property(shdr.data(LE, self.data)?)?;
                        continue;
                    }
                    if (ctx.args.strip_all || ctx.args.strip_debug)
                        && is_debug_section(sh_flags, name)
                    {
                        continue;
                    }

                    let section = self.make_input_section(ctx, i as u32, shdr, name)?;
                    self.sections[i] = Some(section);
                }
            }
        }

        // Attach relocation sections to their targets.
        for shdr in self.shdrs {
            if shdr.sh_type(LE) != object::elf::SHT_RELA {
                continue;
            }
            let target = shdr.sh_info(LE) as usize;
            if target >= self.sections.len() {
                bail!("invalid relocated section index {target}");
            }
            if let Some(section) = &mut self.sections[target] {
                let rels: &'data [Rela] = shdr.data_as_array(LE, self.data)?;
                section.rels = rels;
            }
        }

        // Only now do we know which sections keep their relocations, which decides whether a
        // SHF_MERGE section is actually mergeable or must stay a regular copied section.
        for section in self.sections.iter_mut().flatten() {
            let mergeable = section.sh_flags & u64::from(object::elf::SHF_MERGE) != 0
                && section.sh_size != 0
                && section.sh_entsize != 0
                && section.rels.is_empty();
            if !mergeable && section.name != b".eh_frame" {
                section.output_section =
                    ctx.output_section(section.name, section.sh_type, section.sh_flags);
            }
        }

        Ok(())
    }

    /// Builds one InputSection, decompressing old-style (.zdebug) and new-style
    /// (SHF_COMPRESSED) compressed sections into fresh buffers. The recorded header fields are
    /// the rewritten ones: no COMPRESSED flag, uncompressed size and alignment.
    fn make_input_section(
        &self,
        ctx: &Context<'data>,
        shndx: u32,
        shdr: &crate::elf::SectionHeader,
        name: &'data [u8],
    ) -> Result<InputSection<'data>> {
        let sh_type = shdr.sh_type(LE);
        let mut sh_flags = shdr.sh_flags(LE);
        let mut sh_size = shdr.sh_size(LE);
        let mut sh_addralign = shdr.sh_addralign(LE);
        let raw: &'data [u8] = if sh_type == object::elf::SHT_NOBITS {
            &[]
        } else {
            shdr.data(LE, self.data)?
        };
        let mut contents = raw;

        if name.starts_with(b".zdebug") {
            // Old-style compressed section: "ZLIB" magic followed by a big-endian 64-bit
            // uncompressed size.
            if !raw.starts_with(b"ZLIB") || raw.len() <= 12 {
                bail!("{}: corrupted compressed section", String::from_utf8_lossy(name));
            }
            let size = u64::from_be_bytes(raw[4..12].try_into().unwrap());
            let buf = ctx.herd.get().alloc_slice_fill_default(size as usize);
            crate::elf::decompress_into(object::elf::ELFCOMPRESS_ZLIB, &raw[12..], buf)?;
            contents = buf;
            sh_size = size;
        } else if sh_flags & u64::from(object::elf::SHF_COMPRESSED) != 0 {
            let chdr_size = crate::elf::COMPRESSION_HEADER_SIZE;
            if raw.len() < chdr_size {
                bail!("{}: corrupted compressed section", String::from_utf8_lossy(name));
            }
            let chdr: &crate::elf::CompressionHeader =
                object::from_bytes(&raw[..chdr_size]).map_err(|_| {
                    anyhow::anyhow!("{}: bad compression header", String::from_utf8_lossy(name))
                })?.0;
            let size = chdr.ch_size.get(LE);
            let buf = ctx.herd.get().alloc_slice_fill_default(size as usize);
            crate::elf::decompress_into(chdr.ch_type.get(LE), &raw[chdr_size..], buf)?;
            contents = buf;
            sh_flags &= !u64::from(object::elf::SHF_COMPRESSED);
            sh_size = size;
            sh_addralign = chdr.ch_addralign.get(LE);
        }

        let section = InputSection {
            file: self.file_id,
            shndx,
            name,
            contents,
            sh_type,
            sh_flags,
            sh_size,
            sh_addralign: sh_addralign.max(1),
            sh_entsize: shdr.sh_entsize(LE),
            rels: &[],
            rel_fragments: Vec::new(),
            scan_flags: std::sync::OnceLock::new(),
            fde_begin: NO_SECTION,
            fde_end: NO_SECTION,
            is_alive: AtomicBool::new(true),
            is_visited: AtomicBool::new(false),
            is_ehframe: false,
            output_section: NO_OUTPUT,
            offset: std::sync::atomic::AtomicU64::new(0),
        };

        Ok(section)
    }

    fn initialize_symbols(&mut self, ctx: &Context<'data>) -> Result {
        if self.esyms.is_empty() {
            return Ok(());
        }

        self.locals = Vec::with_capacity(self.first_global);
        self.locals
            .push(ctx.symbol_interner.alloc_unnamed(Symbol::new(b"")));

        for i in 1..self.first_global {
            let esym = &self.esyms[i];
            let mut name = strtab_name(self.symbol_strtab, esym.st_name.get(LE));
            if name.is_empty() && esym.st_type() == object::elf::STT_SECTION {
                if let Some(section) = self.get_section(esym, i) {
                    name = section.name;
                }
            }

            if esym.st_shndx.get(LE) == object::elf::SHN_COMMON {
                bail!("{}: common local symbol?", self.name);
            }

            let sym = Symbol::new(name);
            {
                let mut core = sym.core.lock().unwrap();
                core.file = Some(self.file_id);
                core.sym_idx = i as u32;
                core.value = esym.st_value.get(LE);
                core.place = if esym.st_shndx.get(LE) == object::elf::SHN_ABS {
                    SymbolPlace::Absolute
                } else {
                    SymbolPlace::Section(self.get_shndx(esym, i))
                };
            }
            self.locals.push(ctx.symbol_interner.alloc_unnamed(sym));
        }

        self.symbols = Vec::with_capacity(self.esyms.len());
        for i in 0..self.first_global.min(self.esyms.len()) {
            self.symbols.push(SymbolRef::Local(i as u32));
        }

        let num_globals = self.esyms.len() - self.first_global;
        self.symvers = vec![None; num_globals];
        self.sym_fragments = vec![None; self.esyms.len()];

        for i in self.first_global..self.esyms.len() {
            let esym = &self.esyms[i];
            let full_name = strtab_name(self.symbol_strtab, esym.st_name.get(LE));

            // A name of the form `foo@ver` refers to version `ver`; `foo@@ver` marks the
            // default version, which also satisfies unversioned references.
            let mut key = full_name;
            let mut name = full_name;
            if let Some(pos) = memchr::memchr(b'@', full_name) {
                let ver = &full_name[pos + 1..];
                name = &full_name[..pos];
                if !ver.is_empty() && ver != b"@" {
                    if ver.starts_with(b"@") {
                        key = name;
                    }
                    if esym.st_shndx.get(LE) != object::elf::SHN_UNDEF {
                        self.symvers[i - self.first_global] = Some(ver);
                    }
                }
            }

            let sym = self.insert_symbol(ctx, esym, key, name);
            if esym.st_shndx.get(LE) == object::elf::SHN_COMMON {
                self.has_common_symbol = true;
            }
            self.symbols.push(SymbolRef::Global(sym));
        }

        Ok(())
    }

    /// Interns a global, applying the --wrap rewrites: an undefined `__real_X` with X wrapped
    /// becomes X, and an undefined X with X wrapped becomes `__wrap_X`.
    fn insert_symbol(
        &self,
        ctx: &Context<'data>,
        esym: &Sym,
        key: &'data [u8],
        name: &'data [u8],
    ) -> &'data Symbol<'data> {
        let is_undef = esym.st_shndx.get(LE) == object::elf::SHN_UNDEF;

        if is_undef && name.starts_with(b"__real_") {
            let stripped = &name[7..];
            if ctx.symbol_interner.get(stripped).is_some_and(|s| s.wrap.load(Ordering::Relaxed)) {
                return ctx.intern(key.strip_prefix(b"__real_").unwrap_or(stripped));
            }
        }

        let sym = ctx.intern(key);
        if is_undef && sym.wrap.load(Ordering::Relaxed) {
            let mut wrapped = b"__wrap_".to_vec();
            wrapped.extend_from_slice(key);
            return ctx.intern(ctx.save_bytes(wrapped));
        }
        sym
    }

    fn initialize_mergeable_sections(&mut self, ctx: &Context<'data>) -> Result {
        self.mergeable_sections = (0..self.sections.len()).map(|_| None).collect();

        for i in 0..self.sections.len() {
            let Some(isec) = &self.sections[i] else {
                continue;
            };
            if isec.is_alive()
                && isec.sh_flags & u64::from(object::elf::SHF_MERGE) != 0
                && isec.sh_size != 0
                && isec.sh_entsize != 0
                && isec.rels.is_empty()
            {
                let parent = ctx.merged_section(isec.name, isec.sh_type, isec.sh_flags);
                let file_name = &self.name;
                let section_name = isec.name;
                let split = split_section(
                    parent,
                    isec.contents,
                    isec.sh_entsize,
                    isec.sh_addralign,
                    isec.sh_flags,
                    &|| format!("{}:{}", file_name, String::from_utf8_lossy(section_name)),
                )?;
                self.mergeable_sections[i] = Some(split);
                self.sections[i].as_ref().unwrap().kill();
            }
        }
        Ok(())
    }

    fn initialize_ehframe_sections(&mut self) -> Result {
        for i in 0..self.sections.len() {
            let Some(isec) = &self.sections[i] else {
                continue;
            };
            if isec.is_alive() && isec.name == b".eh_frame" {
                if self.ehframe_shndx.is_some() {
                    bail!("{}: multiple .eh_frame sections", self.name);
                }
                self.ehframe_shndx = Some(i as u32);
                let name = &self.name;
                let (cies, fdes) =
                    eh_frame::read_records(isec.contents, isec.rels, &|| format!("{name}: .eh_frame"))?;
                self.cies = cies;
                self.fdes = fdes;

                let isec = self.sections[i].as_mut().unwrap();
                isec.is_ehframe = true;
                isec.kill();
            }
        }

        if self.fdes.is_empty() {
            return Ok(());
        }

        // Group FDEs by the section they cover, stably, and record each section's FDE range.
        // The covered section is the target of the FDE's first relocation.
        let ehframe_shndx = self.ehframe_shndx.unwrap() as usize;
        let rels = self.sections[ehframe_shndx].as_ref().unwrap().rels;
        let esyms = self.esyms;
        let symtab_shndx = self.symtab_shndx;
        let covered = move |fde: &eh_frame::FdeRecord| -> u32 {
            let rel = &rels[fde.rel_begin as usize];
            let sym_idx = rel.r_sym(LE, false) as usize;
            let Some(esym) = esyms.get(sym_idx) else {
                return NO_SECTION;
            };
            let shndx = esym.st_shndx.get(LE);
            if shndx == object::elf::SHN_XINDEX {
                symtab_shndx.get(sym_idx).map_or(0, |v| v.get(LE))
            } else {
                u32::from(shndx)
            }
        };
        self.fdes.sort_by_key(&covered);

        let mut i = 0;
        while i < self.fdes.len() {
            let shndx = covered(&self.fdes[i]);
            let begin = i;
            while i < self.fdes.len() && covered(&self.fdes[i]) == shndx {
                i += 1;
            }
            if let Some(Some(isec)) = self.sections.get_mut(shndx as usize) {
                isec.fde_begin = begin as u32;
                isec.fde_end = i as u32;
            }
        }
        Ok(())
    }

    /// Interns this file's fragments and rewrites relocations and symbols that point into
    /// mergeable sections. Runs after every file has been split so the maps are properly sized.
    pub(crate) fn register_section_pieces(&mut self, ctx: &Context<'data>) -> Result {
        for mergeable in self.mergeable_sections.iter_mut().flatten() {
            mergeable.fragments = mergeable
                .pieces
                .iter()
                .zip(&mergeable.hashes)
                .map(|(&piece, &hash)| {
                    mergeable
                        .parent
                        .insert(ctx.fragment_arena, piece, hash, mergeable.p2align)
                })
                .collect();
        }

        // Attach fragments to relocations whose target is a section symbol into a mergeable
        // section. The target piece is found from st_value + addend.
        for i in 0..self.sections.len() {
            let Some(isec) = &self.sections[i] else {
                continue;
            };
            if !isec.is_alive() || isec.rels.is_empty() {
                continue;
            }
            let mut frags = Vec::new();
            for (rel_idx, rel) in isec.rels.iter().enumerate() {
                let sym_idx = rel.r_sym(LE, false) as usize;
                let Some(esym) = self.esyms.get(sym_idx) else {
                    continue;
                };
                if esym.st_type() != object::elf::STT_SECTION {
                    continue;
                }
                let shndx = self.get_shndx(esym, sym_idx) as usize;
                let Some(Some(mergeable)) = self.mergeable_sections.get(shndx) else {
                    continue;
                };
                let offset = esym
                    .st_value
                    .get(LE)
                    .wrapping_add_signed(rel.r_addend.get(LE));
                let Some((frag, residual)) = mergeable.fragment_at(offset) else {
                    bail!("{}: bad relocation against mergeable section", self.name);
                };
                frags.push(RelFragment {
                    rel_idx: rel_idx as u32,
                    frag,
                    addend: residual as i64,
                });
            }
            if !frags.is_empty() {
                self.sections[i].as_mut().unwrap().rel_fragments = frags;
            }
        }

        // Redirect symbols defined inside mergeable sections to their fragment.
        for i in 0..self.esyms.len() {
            let esym = &self.esyms[i];
            let shndx = esym.st_shndx.get(LE);
            if shndx == object::elf::SHN_ABS
                || shndx == object::elf::SHN_COMMON
                || shndx == object::elf::SHN_UNDEF
            {
                continue;
            }
            let shndx = self.get_shndx(esym, i) as usize;
            let Some(Some(mergeable)) = self.mergeable_sections.get(shndx) else {
                continue;
            };
            let Some((frag, residual)) = mergeable.fragment_at(esym.st_value.get(LE)) else {
                bail!("{}: bad symbol value in mergeable section", self.name);
            };
            self.sym_fragments[i] = Some((frag, residual));

            if i < self.first_global {
                let mut core = self.locals[i].core.lock().unwrap();
                core.value = residual;
                core.place = SymbolPlace::Fragment(frag);
            }
        }

        Ok(())
    }

    fn override_symbol(&self, core: &mut crate::symbol::SymbolCore<'data>, esym: &Sym, sym_idx: usize) {
        core.file = Some(self.file_id);
        core.sym_idx = sym_idx as u32;
        if let Some((frag, addend)) = self.sym_fragments[sym_idx] {
            core.place = SymbolPlace::Fragment(frag);
            core.value = addend;
        } else if esym.st_shndx.get(LE) == object::elf::SHN_ABS {
            core.place = SymbolPlace::Absolute;
            core.value = esym.st_value.get(LE);
        } else {
            core.place = SymbolPlace::Section(self.get_shndx(esym, sym_idx));
            core.value = esym.st_value.get(LE);
        }
        core.ver_idx = object::elf::VER_NDX_GLOBAL;
        core.is_lazy = false;
        core.is_weak = esym.st_bind() == object::elf::STB_WEAK;
        core.is_imported = false;
        core.is_exported = false;
    }

    /// Advertises this archive member's definitions as lazy candidates.
    pub(crate) fn resolve_lazy_symbols(&self, ctx: &Context<'data>, files: &[LinkFile<'data>]) {
        debug_assert!(self.is_in_lib);

        for i in self.first_global..self.esyms.len() {
            let esym = &self.esyms[i];
            let shndx = esym.st_shndx.get(LE);
            if shndx == object::elf::SHN_UNDEF || shndx == object::elf::SHN_COMMON {
                continue;
            }
            let sym = self.symbols[i].global().unwrap();

            let my_rank = rank(self.file_id, false, false, false, true);
            let mut core = sym.core.lock().unwrap();
            if my_rank < rank_of_core(files, &core) {
                core.file = Some(self.file_id);
                core.sym_idx = i as u32;
                core.is_lazy = true;
                core.is_weak = false;
                drop(core);
                if sym.traced.load(Ordering::Relaxed) {
                    error::trace(format_args!(
                        "{}: lazy definition of {}",
                        self.name,
                        sym.name_for_display(ctx.args.demangle)
                    ));
                }
            }
        }
    }

    pub(crate) fn resolve_regular_symbols(&self, ctx: &Context<'data>, files: &[LinkFile<'data>]) {
        debug_assert!(!self.is_in_lib);

        for i in self.first_global..self.esyms.len() {
            let esym = &self.esyms[i];
            let shndx = esym.st_shndx.get(LE);
            if shndx == object::elf::SHN_UNDEF || shndx == object::elf::SHN_COMMON {
                continue;
            }
            let sym = self.symbols[i].global().unwrap();

            let is_weak = esym.st_bind() == object::elf::STB_WEAK;
            let my_rank = rank(self.file_id, false, is_weak, false, false);
            let mut core = sym.core.lock().unwrap();
            if my_rank < rank_of_core(files, &core) {
                self.override_symbol(&mut core, esym, i);
                drop(core);
                if sym.traced.load(Ordering::Relaxed) {
                    error::trace(format_args!(
                        "{}: definition of {}",
                        self.name,
                        sym.name_for_display(ctx.args.demangle)
                    ));
                }
            }
        }
    }

    /// Walks this live object's references. Undefined strong references into not-yet-alive
    /// archive members flip those members alive exactly once and push them to the feeder.
    /// Also merges visibility and installs higher-ranked definitions it encounters.
    pub(crate) fn mark_live_objects(
        &self,
        ctx: &Context<'data>,
        files: &[LinkFile<'data>],
        feeder: &mut impl FnMut(FileId),
    ) {
        debug_assert!(self.is_alive.load(Ordering::Relaxed));

        for i in self.first_global..self.esyms.len() {
            let esym = &self.esyms[i];
            let sym = self.symbols[i].global().unwrap();
            let shndx = esym.st_shndx.get(LE);
            let is_undef = shndx == object::elf::SHN_UNDEF;
            let is_common = shndx == object::elf::SHN_COMMON;
            let is_weak = esym.st_bind() == object::elf::STB_WEAK;

            let mut visibility = esym.st_visibility();
            if !is_undef && !is_common && self.exclude_libs {
                visibility = object::elf::STV_HIDDEN;
            }
            sym.merge_visibility(visibility);

            if sym.traced.load(Ordering::Relaxed) {
                let what = if !is_undef && !is_common {
                    "definition of"
                } else if is_weak {
                    "weak reference to"
                } else {
                    "reference to"
                };
                error::trace(format_args!(
                    "{}: {} {}",
                    self.name,
                    what,
                    sym.name_for_display(ctx.args.demangle)
                ));
            }

            let mut core = sym.core.lock().unwrap();

            if is_undef || is_common {
                if !is_weak {
                    if let Some(owner) = core.file {
                        let owner_file = &files[owner.as_usize()];
                        if !owner_file.is_dso() && owner_file.make_alive() {
                            feeder(owner);
                            if sym.traced.load(Ordering::Relaxed) {
                                error::trace(format_args!(
                                    "{} keeps {} for {}",
                                    self.name,
                                    owner_file.name(),
                                    sym.name_for_display(ctx.args.demangle)
                                ));
                            }
                        }
                    }
                }
                continue;
            }

            let my_rank = rank(self.file_id, false, is_weak, false, false);
            if my_rank < rank_of_core(files, &core) {
                self.override_symbol(&mut core, esym, i);
            }
        }
    }

    /// Common symbols settle only after all regular definitions have had their chance.
    pub(crate) fn resolve_common_symbols(&self, ctx: &Context<'data>, files: &[LinkFile<'data>]) {
        if !self.has_common_symbol {
            return;
        }

        for i in self.first_global..self.esyms.len() {
            let esym = &self.esyms[i];
            if esym.st_shndx.get(LE) != object::elf::SHN_COMMON {
                continue;
            }
            let sym = self.symbols[i].global().unwrap();

            let my_rank = rank(self.file_id, false, false, true, false);
            let mut core = sym.core.lock().unwrap();
            if my_rank < rank_of_core(files, &core) {
                core.file = Some(self.file_id);
                core.sym_idx = i as u32;
                core.value = esym.st_value.get(LE);
                core.place = SymbolPlace::None;
                core.ver_idx = object::elf::VER_NDX_GLOBAL;
                core.is_lazy = false;
                core.is_weak = false;
                core.is_imported = false;
                core.is_exported = false;
                drop(core);
                if sym.traced.load(Ordering::Relaxed) {
                    error::trace(format_args!(
                        "{}: common definition of {}",
                        self.name,
                        sym.name_for_display(ctx.args.demangle)
                    ));
                }
            }
        }
    }

    pub(crate) fn resolve_comdat_groups(&self) {
        for (group, _) in &self.comdat_groups {
            group.propose_owner(self.file_id.0);
        }
    }

    pub(crate) fn eliminate_duplicate_comdat_groups(&self) {
        for (group, members) in &self.comdat_groups {
            if group.owner.load(Ordering::Relaxed) == self.file_id.0 {
                continue;
            }
            for member in *members {
                if let Some(Some(isec)) = self.sections.get(member.get(LE) as usize) {
                    isec.kill();
                }
            }
        }
    }

    /// Drops this dead file's claims so its symbols can be re-resolved by someone else.
    pub(crate) fn clear_symbols(&self) {
        for i in self.first_global..self.esyms.len() {
            let sym = self.symbols[i].global().unwrap();
            let mut core = sym.core.lock().unwrap();
            if core.file == Some(self.file_id) {
                *core = Default::default();
            }
        }
    }

    /// Decides what to do with references that nothing defined. The policy matrix is the
    /// traditional one: undefined symbols in executables are errors (subject to
    /// --unresolved-symbols), while shared objects promote them to dynamic symbols unless
    /// `-z defs`; weak undefines never fail the link.
    pub(crate) fn claim_unresolved_symbols(&self, ctx: &Context<'data>, files: &[LinkFile<'data>]) {
        use crate::args::UnresolvedKind;

        if !self.is_alive.load(Ordering::Relaxed) {
            return;
        }

        for i in self.first_global..self.esyms.len() {
            let esym = &self.esyms[i];
            if esym.st_shndx.get(LE) != object::elf::SHN_UNDEF {
                continue;
            }
            let sym = self.symbols[i].global().unwrap();
            let is_weak = esym.st_bind() == object::elf::STB_WEAK;

            // Skip symbols with a real owner. A claim made by an earlier file for its own
            // undefined reference may be re-claimed by us.
            let claimed_elsewhere = {
                let core = sym.core.lock().unwrap();
                match core.file {
                    None => false,
                    Some(owner) => {
                        let owner_undef = match &files[owner.as_usize()] {
                            LinkFile::Object(obj) => {
                                obj.esyms[core.sym_idx as usize].st_shndx.get(LE)
                                    == object::elf::SHN_UNDEF
                            }
                            _ => false,
                        };
                        !(owner_undef && owner < self.file_id)
                    }
                }
            };
            if claimed_elsewhere {
                continue;
            }

            let claim = |is_imported: bool| {
                let mut core = sym.core.lock().unwrap();
                core.file = Some(self.file_id);
                core.sym_idx = i as u32;
                core.value = 0;
                core.place = SymbolPlace::None;
                core.ver_idx = object::elf::VER_NDX_GLOBAL;
                core.is_lazy = false;
                core.is_weak = false;
                core.is_imported = is_imported;
                core.is_exported = false;
            };

            if ctx.args.shared && (!ctx.args.z_defs || is_weak) {
                // Leave it for the dynamic loader.
                claim(!ctx.args.is_static);
                if sym.traced.load(Ordering::Relaxed) {
                    error::trace(format_args!(
                        "{}: unresolved{} symbol {}",
                        self.name,
                        if is_weak { " weak" } else { "" },
                        sym.name_for_display(ctx.args.demangle)
                    ));
                }
                continue;
            }

            let policy = ctx.args.unresolved_symbols;
            let ignored = matches!(
                policy,
                UnresolvedKind::IgnoreAll | UnresolvedKind::IgnoreInObjectFiles
            );
            if is_weak || ignored {
                claim(false);
            } else if policy == UnresolvedKind::Warn {
                claim(false);
                error::warning(
                    format_args!(
                        "undefined symbol: {}: {}",
                        self.name,
                        sym.name_for_display(ctx.args.demangle)
                    ),
                    ctx.args.fatal_warnings,
                );
            } else {
                error::error(format_args!(
                    "undefined symbol: {}: {}",
                    self.name,
                    sym.name_for_display(ctx.args.demangle)
                ));
            }
        }
    }

    /// Materializes the common symbols this file won as .common NOBITS sections.
    pub(crate) fn convert_common_symbols(&mut self, ctx: &Context<'data>) {
        if !self.has_common_symbol {
            return;
        }

        let common_osec = ctx.output_section(
            b".common",
            object::elf::SHT_NOBITS,
            u64::from(object::elf::SHF_WRITE | object::elf::SHF_ALLOC),
        );

        for i in self.first_global..self.esyms.len() {
            let esym = &self.esyms[i];
            if esym.st_shndx.get(LE) != object::elf::SHN_COMMON {
                continue;
            }
            let sym = self.symbols[i].global().unwrap();
            {
                let core = sym.core.lock().unwrap();
                if core.file != Some(self.file_id) {
                    drop(core);
                    if ctx.args.warn_common {
                        error::warning(
                            format_args!(
                                "{}: multiple common symbols: {}",
                                self.name,
                                sym.name_for_display(ctx.args.demangle)
                            ),
                            ctx.args.fatal_warnings,
                        );
                    }
                    continue;
                }
            }

            let shndx = self.sections.len() as u32;
            self.sections.push(Some(InputSection {
                file: self.file_id,
                shndx,
                name: b".common",
                contents: &[],
                sh_type: object::elf::SHT_NOBITS,
                sh_flags: u64::from(object::elf::SHF_WRITE | object::elf::SHF_ALLOC),
                sh_size: esym.st_size.get(LE),
                // For commons, st_value holds the required alignment.
                sh_addralign: esym.st_value.get(LE).max(1),
                sh_entsize: 0,
                rels: &[],
                rel_fragments: Vec::new(),
                scan_flags: std::sync::OnceLock::new(),
                fde_begin: NO_SECTION,
                fde_end: NO_SECTION,
                is_alive: AtomicBool::new(true),
                is_visited: AtomicBool::new(false),
                is_ehframe: false,
                output_section: common_osec,
                offset: std::sync::atomic::AtomicU64::new(0),
            }));
            self.mergeable_sections.push(None);

            let mut core = sym.core.lock().unwrap();
            core.value = 0;
            core.place = SymbolPlace::Section(shndx);
        }
    }

    /// Classifies every relocation of every live alloc section and accumulates needs-flags on
    /// the referenced symbols. The per-reloc output decisions (dynamic / base relocation) are
    /// recorded on the section.
    pub(crate) fn scan_relocations(&self, ctx: &Context<'data>, files: &[LinkFile<'data>]) {
        let arch = self.machine.arch();
        let pic = ctx.args.is_pic();

        for i in 0..self.sections.len() {
            let Some(isec) = &self.sections[i] else {
                continue;
            };
            if !isec.is_alive() || !isec.is_alloc() || isec.rels.is_empty() {
                continue;
            }

            let mut flags = vec![0u8; isec.rels.len()];
            for (rel_idx, rel) in isec.rels.iter().enumerate() {
                let r_type = rel.r_type(LE, false);
                let kind = match arch.scan_kind(r_type) {
                    Ok(kind) => kind,
                    Err(err) => {
                        error::error(format_args!("{}: {err}", self.name));
                        continue;
                    }
                };
                if kind == ScanKind::None {
                    continue;
                }

                let sym_idx = rel.r_sym(LE, false) as usize;
                let sym = self.symbol_at(sym_idx);
                let (is_imported, is_claimed, is_func) = {
                    let core = sym.core.lock().unwrap();
                    let is_func = match core.file {
                        Some(owner) => match &files[owner.as_usize()] {
                            LinkFile::Object(obj) => {
                                obj.esyms[core.sym_idx as usize].st_type()
                                    == object::elf::STT_FUNC
                            }
                            LinkFile::Shared(dso) => {
                                dso.esyms[core.sym_idx as usize].st_type()
                                    == object::elf::STT_FUNC
                            }
                            LinkFile::Internal(_) => false,
                        },
                        None => false,
                    };
                    (core.is_imported, core.file.is_some(), is_func)
                };

                if !is_claimed && sym_idx >= self.first_global {
                    error::error(format_args!(
                        "undefined symbol: {}: {}",
                        self.name,
                        sym.name_for_display(ctx.args.demangle)
                    ));
                    continue;
                }

                match kind {
                    ScanKind::None => {}
                    ScanKind::Abs { size: 8 } => {
                        if is_imported {
                            if pic {
                                flags[rel_idx] |= rel_flags::DYNREL;
                                sym.add_flags(NeedsFlags::DYNSYM);
                            } else if is_func {
                                // Taking the address of an imported function pins down a
                                // canonical PLT entry whose address is the function's identity.
                                sym.add_flags(NeedsFlags::PLT);
                            } else {
                                sym.add_flags(NeedsFlags::COPYREL);
                            }
                        } else if pic && !self.symbol_is_absolute(sym) {
                            flags[rel_idx] |= rel_flags::BASEREL;
                        }
                    }
                    ScanKind::Abs { .. } => {
                        if is_imported {
                            if pic {
                                error::error(format_args!(
                                    "{}: relocation {} against {} can not be used when making a \
                                     shared object; recompile with -fPIC",
                                    self.name,
                                    arch.rel_type_name(r_type),
                                    sym.name_for_display(ctx.args.demangle)
                                ));
                            } else if is_func {
                                sym.add_flags(NeedsFlags::PLT);
                            } else {
                                sym.add_flags(NeedsFlags::COPYREL);
                            }
                        }
                    }
                    ScanKind::Pcrel => {
                        if is_imported {
                            if pic {
                                error::error(format_args!(
                                    "{}: pc-relative relocation against dynamic symbol {}",
                                    self.name,
                                    sym.name_for_display(ctx.args.demangle)
                                ));
                            } else if is_func {
                                sym.add_flags(NeedsFlags::PLT);
                            } else {
                                sym.add_flags(NeedsFlags::COPYREL);
                            }
                        }
                    }
                    ScanKind::Call => {
                        if is_imported {
                            sym.add_flags(NeedsFlags::PLT);
                        }
                    }
                    ScanKind::Got => sym.add_flags(NeedsFlags::GOT),
                    ScanKind::GotTp => sym.add_flags(NeedsFlags::GOTTP),
                    ScanKind::TlsGd => sym.add_flags(NeedsFlags::TLSGD),
                    ScanKind::TlsLd => sym.add_flags(NeedsFlags::TLSLD),
                    ScanKind::TlsDesc => sym.add_flags(NeedsFlags::TLSDESC),
                    ScanKind::TpOff => {
                        if pic {
                            error::error(format_args!(
                                "{}: local-exec TLS relocation in shared object",
                                self.name
                            ));
                        }
                    }
                    ScanKind::DtpOff => {}
                }
            }
            let _ = self.sections[i].as_ref().unwrap().scan_flags.set(flags);
        }

        // CIE personality routines are reached through .eh_frame; imported ones need a PLT.
        if let Some(ehframe_shndx) = self.ehframe_shndx {
            let rels = self.sections[ehframe_shndx as usize].as_ref().unwrap().rels;
            for cie in &self.cies {
                for rel in &rels[cie.rel_begin as usize..cie.rel_end as usize] {
                    let sym_idx = rel.r_sym(LE, false) as usize;
                    let sym = self.symbol_at(sym_idx);
                    let core = sym.core.lock().unwrap();
                    if core.is_imported {
                        drop(core);
                        sym.add_flags(NeedsFlags::PLT);
                    }
                }
            }
        }
    }

    fn symbol_is_absolute(&self, sym: &Symbol) -> bool {
        matches!(
            sym.core.lock().unwrap().place,
            SymbolPlace::Absolute | SymbolPlace::None
        )
    }

    pub(crate) fn symbol_at(&self, sym_idx: usize) -> &'data Symbol<'data> {
        match self.symbols[sym_idx] {
            SymbolRef::Local(idx) => self.locals[idx as usize],
            SymbolRef::Global(sym) => sym,
        }
    }

    /// Counts the symbols this file contributes to .symtab and the bytes they need in .strtab.
    pub(crate) fn compute_symtab(&mut self, ctx: &Context<'data>) {
        self.num_local_symtab = 0;
        self.num_global_symtab = 0;
        self.strtab_size = 0;

        if ctx.args.strip_all {
            return;
        }

        if !ctx.args.discard_all && ctx.args.retain_symbols_file.is_none() {
            for i in 1..self.first_global {
                let sym = self.locals[i];
                if !self.should_write_local(ctx, sym, i) {
                    continue;
                }
                sym.write_to_symtab.store(true, Ordering::Relaxed);
                self.strtab_size += sym.name.len() as u64 + 1;
                self.num_local_symtab += 1;
            }
        }

        for i in self.first_global..self.esyms.len() {
            let sym = self.symbols[i].global().unwrap();
            let core = sym.core.lock().unwrap();
            if core.file != Some(self.file_id) {
                continue;
            }
            if let Some(retain) = &ctx.args.retain_symbols_file {
                if !retain.iter().any(|keep| keep.as_slice() == sym.name) {
                    continue;
                }
            }
            let alive = match core.place {
                SymbolPlace::Section(shndx) => self
                    .sections
                    .get(shndx as usize)
                    .and_then(|s| s.as_ref())
                    .is_some_and(|s| s.is_alive()),
                SymbolPlace::Fragment(frag) => frag.is_alive.load(Ordering::Relaxed),
                _ => true,
            };
            drop(core);
            if !alive {
                continue;
            }
            sym.write_to_symtab.store(true, Ordering::Relaxed);
            self.strtab_size += sym.name.len() as u64 + 1;
            self.num_global_symtab += 1;
        }
    }

    fn should_write_local(&self, ctx: &Context<'data>, sym: &Symbol<'data>, sym_idx: usize) -> bool {
        let esym = &self.esyms[sym_idx];
        if esym.st_type() == object::elf::STT_SECTION || sym.name.is_empty() {
            return false;
        }

        // Compiler-local labels are dropped with --discard-locals; labels in mergeable
        // sections are always dropped since merging makes their origin meaningless.
        if sym.name.starts_with(b".L") {
            if ctx.args.discard_locals {
                return false;
            }
            let shndx = self.get_shndx(esym, sym_idx) as usize;
            if self.mergeable_sections.get(shndx).is_some_and(|m| m.is_some()) {
                return false;
            }
        }

        // Symbols attached to dead sections have nothing to point at.
        match sym.core.lock().unwrap().place {
            SymbolPlace::Section(shndx) => self
                .sections
                .get(shndx as usize)
                .and_then(|s| s.as_ref())
                .is_some_and(|s| s.is_alive()),
            SymbolPlace::Fragment(frag) => frag.is_alive.load(Ordering::Relaxed),
            _ => true,
        }
    }
}

impl<'data> SymbolRef<'data> {
    pub(crate) fn global(&self) -> Option<&'data Symbol<'data>> {
        match self {
            SymbolRef::Global(sym) => Some(sym),
            SymbolRef::Local(_) => None,
        }
    }
}

/// Parses .note.gnu.property, ORing together the GNU_PROPERTY_X86_FEATURE_1_AND words.
fn read_note_gnu_property(data: &[u8]) -> Result<u32> {
    use crate::elf::read_u32;

    let mut features = 0u32;
    let mut rest = data;
    while rest.len() >= 12 {
        let namesz = read_u32(rest) as usize;
        let descsz = read_u32(&rest[4..]) as usize;
        let n_type = read_u32(&rest[8..]);
        rest = &rest[12..];

        let name = rest.get(..namesz.saturating_sub(1)).unwrap_or_default();
        rest = rest.get(namesz.next_multiple_of(4)..).context("corrupt note")?;
        let desc = rest.get(..descsz).context("corrupt note")?;
        rest = rest.get(descsz.next_multiple_of(8)..).unwrap_or_default();

        if n_type != object::elf::NT_GNU_PROPERTY_TYPE_0 || name != b"GNU" {
            continue;
        }

        let mut desc = desc;
        while desc.len() >= 8 {
            let prop_type = read_u32(desc);
            let prop_size = read_u32(&desc[4..]) as usize;
            desc = &desc[8..];
            if prop_type == object::elf::GNU_PROPERTY_X86_FEATURE_1_AND && desc.len() >= 4 {
                features |= read_u32(desc);
            }
            desc = desc.get(prop_size.next_multiple_of(8)..).unwrap_or_default();
        }
    }
    Ok(features)
}

pub(crate) struct SharedFile<'data> {
    pub(crate) file_id: FileId,
    pub(crate) name: String,
    pub(crate) soname: String,
    pub(crate) is_alive: AtomicBool,
    pub(crate) data: &'data [u8],

    /// Defined, non-hidden dynamic symbols, paired with `versyms` and `symbols`.
    pub(crate) esyms: Vec<Sym>,
    pub(crate) versyms: Vec<u16>,
    pub(crate) symbols: Vec<&'data Symbol<'data>>,

    /// Every global the DSO mentions, defined or not; used to compute exports.
    pub(crate) globals: Vec<&'data Symbol<'data>>,

    pub(crate) version_strings: Vec<&'data [u8]>,
}

impl<'data> SharedFile<'data> {
    pub(crate) fn parse(
        ctx: &Context<'data>,
        input_data: &'data InputData,
        input: &InputBytes,
        file_id: FileId,
    ) -> Result<SharedFile<'data>> {
        let data = input_data.bytes(input);
        let name = input_data.display_name(input);
        Self::parse_bytes(ctx, data, name, input, file_id)
            .with_context(|| format!("cannot parse {}", input_data.display_name(input)))
    }

    fn parse_bytes(
        ctx: &Context<'data>,
        data: &'data [u8],
        name: String,
        input: &InputBytes,
        file_id: FileId,
    ) -> Result<SharedFile<'data>> {
        let header = crate::elf::FileHeader::parse(data)?;
        let sections = header.sections(LE, data)?;
        let shdrs: &'data [crate::elf::SectionHeader] = sections.iter().as_slice();

        let mut dynsym_shdr = None;
        let mut versym_data: &'data [crate::elf::Versym] = &[];
        let mut verdef: Option<(&'data [u8], &'data [u8])> = None;
        let mut dynamic: &'data [crate::elf::DynamicEntry] = &[];
        for shdr in shdrs {
            match shdr.sh_type(LE) {
                object::elf::SHT_DYNSYM => dynsym_shdr = Some(shdr),
                object::elf::SHT_GNU_VERSYM => versym_data = shdr.data_as_array(LE, data)?,
                object::elf::SHT_GNU_VERDEF => {
                    let strtab_shdr = shdrs
                        .get(shdr.sh_link(LE) as usize)
                        .context("bad verdef sh_link")?;
                    verdef = Some((shdr.data(LE, data)?, strtab_shdr.data(LE, data)?));
                }
                object::elf::SHT_DYNAMIC => dynamic = shdr.data_as_array(LE, data)?,
                _ => {}
            }
        }

        let mut file = SharedFile {
            file_id,
            name,
            soname: String::new(),
            is_alive: AtomicBool::new(!input.modifiers.as_needed),
            data,
            esyms: Vec::new(),
            versyms: Vec::new(),
            symbols: Vec::new(),
            globals: Vec::new(),
            version_strings: Vec::new(),
        };

        let Some(dynsym_shdr) = dynsym_shdr else {
            return Ok(file);
        };

        let esyms: &'data [Sym] = dynsym_shdr.data_as_array(LE, data)?;
        let first_global = dynsym_shdr.sh_info(LE) as usize;
        let strtab_shdr = shdrs
            .get(dynsym_shdr.sh_link(LE) as usize)
            .context("bad dynsym sh_link")?;
        let strtab: &'data [u8] = strtab_shdr.data(LE, data)?;

        file.soname = Self::read_soname(dynamic, strtab)
            .unwrap_or_else(|| filename_of(&file.name));
        file.version_strings = read_verdef(verdef);

        for (i, esym) in esyms.iter().enumerate().skip(first_global) {
            let sym_name = strtab_name(strtab, esym.st_name.get(LE));
            file.globals.push(ctx.intern(sym_name));
            if esym.st_shndx.get(LE) == object::elf::SHN_UNDEF {
                continue;
            }

            let versym = versym_data
                .get(i)
                .map_or(object::elf::VER_NDX_GLOBAL, |v| v.0.get(LE));
            let hidden = versym & crate::elf::EF_VERSYM_HIDDEN != 0;
            let versym = versym & !crate::elf::EF_VERSYM_HIDDEN;
            if versym == object::elf::VER_NDX_LOCAL {
                continue;
            }

            let sym = if hidden {
                // A hidden version can only be reached by an explicitly versioned reference,
                // so intern it under its mangled name.
                let version = file
                    .version_strings
                    .get(versym as usize)
                    .copied()
                    .unwrap_or(b"");
                let mut mangled = sym_name.to_vec();
                mangled.push(b'@');
                mangled.extend_from_slice(version);
                ctx.intern(ctx.save_bytes(mangled))
            } else {
                ctx.intern(sym_name)
            };

            file.esyms.push(*esym);
            file.versyms.push(versym);
            file.symbols.push(sym);
        }

        Ok(file)
    }

    fn read_soname(dynamic: &[crate::elf::DynamicEntry], strtab: &'data [u8]) -> Option<String> {
        use object::read::elf::Dyn as _;
        for entry in dynamic {
            if entry.d_tag(LE) == u64::from(object::elf::DT_SONAME) {
                let name = strtab_name(strtab, entry.d_val(LE) as u32);
                return Some(String::from_utf8_lossy(name).into_owned());
            }
        }
        None
    }

    /// DSO definitions are the weakest kind of definition, so they just take whatever is still
    /// unclaimed or claimed by a later DSO.
    pub(crate) fn resolve_dso_symbols(&self, ctx: &Context<'data>, files: &[LinkFile<'data>]) {
        for (i, sym) in self.symbols.iter().enumerate() {
            let esym = &self.esyms[i];
            let is_weak = esym.st_bind() == object::elf::STB_WEAK;
            let my_rank = rank(self.file_id, true, is_weak, false, false);
            let mut core = sym.core.lock().unwrap();
            if my_rank < rank_of_core(files, &core) {
                core.file = Some(self.file_id);
                core.sym_idx = i as u32;
                core.value = esym.st_value.get(LE);
                core.place = SymbolPlace::None;
                core.ver_idx = self.versyms[i];
                core.is_lazy = false;
                core.is_weak = true;
                core.is_imported = true;
                core.is_exported = false;
                drop(core);
                if sym.traced.load(Ordering::Relaxed) {
                    error::trace(format_args!(
                        "{}: definition of {}",
                        self.name,
                        sym.name_for_display(ctx.args.demangle)
                    ));
                }
            }
        }
    }

    pub(crate) fn clear_symbols(&self) {
        for sym in &self.symbols {
            let mut core = sym.core.lock().unwrap();
            if core.file == Some(self.file_id) {
                *core = Default::default();
            }
        }
    }

    /// Other symbols this DSO defines at the same address. When one of them gets a COPYREL,
    /// the aliases must refer to the copied location too.
    pub(crate) fn find_aliases(&self, of: &Symbol<'data>) -> Vec<&'data Symbol<'data>> {
        let value = {
            let core = of.core.lock().unwrap();
            debug_assert_eq!(core.file, Some(self.file_id));
            self.esyms[core.sym_idx as usize].st_value.get(LE)
        };
        self.symbols
            .iter()
            .enumerate()
            .filter(|(i, sym)| {
                !std::ptr::eq(**sym as *const Symbol, of as *const Symbol)
                    && self.esyms[*i].st_value.get(LE) == value
                    && sym.core.lock().unwrap().file == Some(self.file_id)
            })
            .map(|(_, sym)| *sym)
            .collect()
    }

    /// Whether the symbol lives in a read-only segment of this DSO. Copy-relocated read-only
    /// data must land in .bss.rel.ro rather than .bss.
    pub(crate) fn is_readonly(&self, sym: &Symbol<'data>) -> bool {
        let Ok(header) = crate::elf::FileHeader::parse(self.data) else {
            return false;
        };
        let Ok(phdrs) = header.program_headers(LE, self.data) else {
            return false;
        };
        let value = {
            let core = sym.core.lock().unwrap();
            self.esyms[core.sym_idx as usize].st_value.get(LE)
        };
        use object::read::elf::ProgramHeader as _;
        phdrs.iter().any(|phdr| {
            phdr.p_type(LE) == object::elf::PT_LOAD
                && phdr.p_flags(LE) & object::elf::PF_W == 0
                && phdr.p_vaddr(LE) <= value
                && value < phdr.p_vaddr(LE) + phdr.p_memsz(LE)
        })
    }
}

fn filename_of(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned())
}

/// Walks a SHT_GNU_verdef section, returning version strings indexed by version number.
fn read_verdef<'data>(verdef: Option<(&'data [u8], &'data [u8])>) -> Vec<&'data [u8]> {
    let mut strings: Vec<&'data [u8]> = vec![b""; usize::from(object::elf::VER_NDX_GLOBAL) + 1];
    let Some((data, strtab)) = verdef else {
        return strings;
    };

    let mut offset = 0usize;
    loop {
        let Some(bytes) = data.get(offset..offset + size_of::<crate::elf::Verdef>()) else {
            break;
        };
        let Ok((vd, _)) = object::from_bytes::<crate::elf::Verdef>(bytes) else {
            break;
        };
        let ndx = vd.vd_ndx.get(LE) as usize;
        if strings.len() <= ndx {
            strings.resize(ndx + 1, b"");
        }
        let aux_offset = offset + vd.vd_aux.get(LE) as usize;
        if let Some(aux_bytes) = data.get(aux_offset..aux_offset + size_of::<crate::elf::Verdaux>()) {
            if let Ok((aux, _)) = object::from_bytes::<crate::elf::Verdaux>(aux_bytes) {
                strings[ndx] = strtab_name(strtab, aux.vda_name.get(LE));
            }
        }
        if vd.vd_next.get(LE) == 0 {
            break;
        }
        offset += vd.vd_next.get(LE) as usize;
    }
    strings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_note_gnu_property() {
        // One note: name "GNU\0", type NT_GNU_PROPERTY_TYPE_0, a single
        // GNU_PROPERTY_X86_FEATURE_1_AND property with value 3.
        let mut note = Vec::new();
        note.extend_from_slice(&4u32.to_le_bytes()); // namesz
        note.extend_from_slice(&16u32.to_le_bytes()); // descsz
        note.extend_from_slice(&object::elf::NT_GNU_PROPERTY_TYPE_0.to_le_bytes());
        note.extend_from_slice(b"GNU\0");
        note.extend_from_slice(&object::elf::GNU_PROPERTY_X86_FEATURE_1_AND.to_le_bytes());
        note.extend_from_slice(&4u32.to_le_bytes()); // prop size
        note.extend_from_slice(&3u32.to_le_bytes()); // feature bits
        note.extend_from_slice(&0u32.to_le_bytes()); // pad to 8
        assert_eq!(read_note_gnu_property(&note).unwrap(), 3);
    }

    #[test]
    fn test_strtab_name() {
        let strtab = b"\0foo\0bar\0";
        assert_eq!(strtab_name(strtab, 1), b"foo");
        assert_eq!(strtab_name(strtab, 5), b"bar");
        assert_eq!(strtab_name(strtab, 100), b"");
    }

    #[test]
    fn test_is_debug_section() {
        assert!(is_debug_section(0, b".debug_info"));
        assert!(is_debug_section(0, b".zdebug_str"));
        assert!(!is_debug_section(u64::from(object::elf::SHF_ALLOC), b".debug_info"));
        assert!(!is_debug_section(0, b".text"));
    }
}
