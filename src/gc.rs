//! Mark-sweep garbage collection for --gc-sections. Vertices are input sections, edges are
//! relocations (plus the fragment references attached to them and the FDEs covering a section).
//! Any section reachable from a root section stays; unreachable SHF_ALLOC sections are killed.

use crate::context::Context;
use crate::elf::is_c_identifier;
use crate::error;
use crate::input_section::InputSection;
use crate::object_file::LinkFile;
use crate::object_file::ObjectFile;
use crate::symbol::FileId;
use crate::symbol::Symbol;
use crate::symbol::SymbolPlace;
use object::LittleEndian as LE;
use rayon::Scope;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use std::sync::Mutex;
use std::sync::atomic::Ordering;

pub(crate) fn gc_sections<'data>(ctx: &Context<'data>, files: &[LinkFile<'data>]) {
    crate::timing_phase!("gc");

    mark_nonalloc_fragments(files);

    let rootset = collect_root_set(ctx, files);
    mark(files, &rootset);
    sweep(ctx, files);
}

fn section_of<'a, 'data>(
    files: &'a [LinkFile<'data>],
    file: FileId,
    shndx: u32,
) -> Option<&'a InputSection<'data>> {
    files[file.as_usize()]
        .as_object()?
        .sections
        .get(shndx as usize)?
        .as_ref()
}

/// Non-alloc section fragments (e.g. merged .debug_str data) are not subject to collection.
fn mark_nonalloc_fragments(files: &[LinkFile]) {
    files.par_iter().for_each(|file| {
        let Some(obj) = file.as_object() else { return };
        for mergeable in obj.mergeable_sections.iter().flatten() {
            if mergeable.parent.sh_flags & u64::from(object::elf::SHF_ALLOC) == 0 {
                for frag in &mergeable.fragments {
                    frag.mark_alive();
                }
            }
        }
    });
}

fn is_init_fini(isec: &InputSection) -> bool {
    isec.sh_type == object::elf::SHT_INIT_ARRAY
        || isec.sh_type == object::elf::SHT_FINI_ARRAY
        || isec.sh_type == object::elf::SHT_PREINIT_ARRAY
        || isec.name.starts_with(b".ctors")
        || isec.name.starts_with(b".dtors")
        || isec.name.starts_with(b".init")
        || isec.name.starts_with(b".fini")
}

/// Marks the section visited, returning true if this call was the one that marked it.
fn mark_section(isec: &InputSection) -> bool {
    isec.is_alive() && !isec.is_visited.swap(true, Ordering::Relaxed)
}

fn enqueue_symbol<'a, 'data>(
    files: &'a [LinkFile<'data>],
    sym: &Symbol<'data>,
    rootset: &Mutex<Vec<&'a InputSection<'data>>>,
) {
    let core = sym.core.lock().unwrap();
    match core.place {
        SymbolPlace::Fragment(frag) => frag.mark_alive(),
        SymbolPlace::Section(shndx) => {
            if let Some(owner) = core.file {
                if let Some(isec) = section_of(files, owner, shndx) {
                    if mark_section(isec) {
                        rootset.lock().unwrap().push(isec);
                    }
                }
            }
        }
        _ => {}
    }
}

fn collect_root_set<'a, 'data>(
    ctx: &Context<'data>,
    files: &'a [LinkFile<'data>],
) -> Vec<&'a InputSection<'data>> {
    crate::timing_phase!("collect_root_set");
    let rootset = Mutex::new(Vec::new());

    // Sections that are not subject to garbage collection. Only SHF_ALLOC sections are ever
    // discarded; non-alloc sections start pre-visited so that relocations pointing into them
    // never pin alloc sections.
    files.par_iter().for_each(|file| {
        let Some(obj) = file.as_object() else { return };
        if !obj.is_alive.load(Ordering::Relaxed) {
            return;
        }
        for isec in obj.sections.iter().flatten() {
            if !isec.is_alive() {
                continue;
            }
            if !isec.is_alloc() {
                isec.is_visited.store(true, Ordering::Relaxed);
            }
            if is_init_fini(isec)
                || is_c_identifier(isec.name)
                || isec.sh_type == object::elf::SHT_NOTE
            {
                if mark_section(isec) {
                    rootset.lock().unwrap().push(isec);
                }
            }
        }
    });

    // Sections containing exported symbols.
    files.par_iter().for_each(|file| {
        let Some(obj) = file.as_object() else { return };
        for i in obj.first_global..obj.esyms.len() {
            let sym = obj.symbol_at(i);
            let owned = {
                let core = sym.core.lock().unwrap();
                core.file == Some(obj.file_id) && core.is_exported
            };
            if owned {
                enqueue_symbol(files, sym, &rootset);
            }
        }
    });

    // Symbols the link is anchored on.
    let mut enqueue_named = |name: &str| {
        if let Some(sym) = ctx.symbol_interner.get(name.as_bytes()) {
            enqueue_symbol(files, sym, &rootset);
        }
    };
    enqueue_named(&ctx.args.entry);
    for name in &ctx.args.undefined {
        enqueue_named(name);
    }
    for name in &ctx.args.require_defined {
        enqueue_named(name);
    }

    // Every CIE is kept, so whatever a CIE references (personality routines) is a root.
    files.par_iter().for_each(|file| {
        let Some(obj) = file.as_object() else { return };
        let Some(ehframe_shndx) = obj.ehframe_shndx else {
            return;
        };
        let rels = obj.sections[ehframe_shndx as usize].as_ref().unwrap().rels;
        for cie in &obj.cies {
            for rel in &rels[cie.rel_begin as usize..cie.rel_end as usize] {
                let sym = obj.symbol_at(rel.r_sym(LE, false) as usize);
                enqueue_symbol(files, sym, &rootset);
            }
        }
    });

    rootset.into_inner().unwrap()
}

fn mark<'a, 'data>(files: &'a [LinkFile<'data>], rootset: &[&'a InputSection<'data>]) {
    crate::timing_phase!("mark");

    rayon::scope(|scope| {
        for isec in rootset {
            let isec = *isec;
            scope.spawn(move |scope| visit(files, isec, scope, 0));
        }
    });
}

fn visit<'a, 'data: 'a>(
    files: &'a [LinkFile<'data>],
    isec: &'a InputSection<'data>,
    scope: &Scope<'a>,
    depth: usize,
) {
    debug_assert!(isec.is_visited.load(Ordering::Relaxed));
    let obj = files[isec.file.as_usize()].as_object().unwrap();

    // A relocation can refer either to a piece of a mergeable section or to a symbol. Pieces
    // just get their alive bit; sections are traversed.
    for fragment_ref in &isec.rel_fragments {
        fragment_ref.frag.mark_alive();
    }

    // If this is a text section, .eh_frame may contain records describing how to handle
    // exceptions for it. Everything those records reference (except the function pointer
    // itself, which is what's keeping the FDE) must stay: personality routines and LSDAs.
    if isec.has_fdes() {
        let rels = obj.sections[obj.ehframe_shndx.unwrap() as usize]
            .as_ref()
            .unwrap()
            .rels;
        for fde in &obj.fdes[isec.fde_begin as usize..isec.fde_end as usize] {
            for rel in &rels[fde.rel_begin as usize + 1..fde.rel_end as usize] {
                let sym = obj.symbol_at(rel.r_sym(LE, false) as usize);
                visit_symbol(files, sym, scope, depth);
            }
        }
    }

    for rel in isec.rels {
        let sym = obj.symbol_at(rel.r_sym(LE, false) as usize);
        visit_symbol(files, sym, scope, depth);
    }
}

fn visit_symbol<'a, 'data: 'a>(
    files: &'a [LinkFile<'data>],
    sym: &Symbol<'data>,
    scope: &Scope<'a>,
    depth: usize,
) {
    let (place, owner) = {
        let core = sym.core.lock().unwrap();
        (core.place, core.file)
    };
    match place {
        SymbolPlace::Fragment(frag) => frag.mark_alive(),
        SymbolPlace::Section(shndx) => {
            let Some(owner) = owner else { return };
            let Some(target) = section_of(files, owner, shndx) else {
                return;
            };
            if !mark_section(target) {
                return;
            }
            // Keep traversal on this thread while shallow; fan out when it gets deep.
            if depth < 3 {
                visit(files, target, scope, depth + 1);
            } else {
                scope.spawn(move |scope| visit(files, target, scope, 0));
            }
        }
        _ => {}
    }
}

fn sweep<'data>(ctx: &Context<'data>, files: &[LinkFile<'data>]) {
    crate::timing_phase!("sweep");
    let counter = crate::timing::Counter::new("garbage_sections");

    files.par_iter().for_each(|file| {
        let Some(obj) = file.as_object() else { return };
        for isec in obj.sections.iter().flatten() {
            if isec.is_alive() && !isec.is_visited.load(Ordering::Relaxed) {
                if ctx.args.print_gc_sections {
                    print_removed(obj, isec);
                }
                isec.kill();
                counter.inc();
            }
        }
    });
}

fn print_removed(obj: &ObjectFile, isec: &InputSection) {
    error::println_sync(format_args!(
        "removing unused section {}:({})",
        obj.name,
        String::from_utf8_lossy(isec.name)
    ));
}
