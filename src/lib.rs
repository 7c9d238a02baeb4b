pub(crate) mod aarch64;
pub(crate) mod arch;
pub(crate) mod archive;
pub mod args;
pub(crate) mod context;
pub(crate) mod demangle;
pub(crate) mod eh_frame;
pub(crate) mod elf;
pub mod error;
pub(crate) mod file_kind;
pub(crate) mod gc;
pub(crate) mod hash;
pub(crate) mod input_data;
pub(crate) mod input_section;
pub(crate) mod interner;
pub(crate) mod layout;
pub(crate) mod linker_script;
pub(crate) mod mapfile;
pub(crate) mod object_file;
pub(crate) mod output_chunks;
pub(crate) mod output_file;
pub(crate) mod passes;
pub(crate) mod string_merging;
pub(crate) mod symbol;
pub(crate) mod timing;
pub(crate) mod version_script;
pub(crate) mod x86_64;

use crate::args::Action;
use crate::context::Context;
use crate::error::Result;
use crate::output_chunks::ChunkKind;
use crate::output_chunks::DynRelQueue;
use crate::passes::Link;
use crate::version_script::VersionScript;
use anyhow::Context as _;
use anyhow::bail;
use object::LittleEndian as LE;
use rayon::iter::IntoParallelIterator;
use rayon::iter::ParallelIterator;

pub struct Linker {
    action: Action,
}

impl Linker {
    pub fn from_args<S: AsRef<str>, I: Iterator<Item = S>>(args: I) -> Result<Linker> {
        Ok(Linker {
            action: args::parse(args)?,
        })
    }

    pub fn run(&self) -> Result {
        match &self.action {
            Action::Link(args) => {
                timing::init_tracing();
                link(args)
            }
            Action::Version => {
                println!("mold {} (compatible with GNU ld)", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

fn link(args: &args::Args) -> Result {
    crate::timing_phase!("Link");

    args.setup_thread_pool()?;

    let input_data = input_data::InputData::from_args(args)?;

    // Arenas for everything with Context lifetime. Nothing allocated from these is freed until
    // the link is done, which is what makes the cross-references in the file graph safe. They're
    // leaked rather than dropped: the fragment/merged-section arenas reference each other, so no
    // drop order could satisfy both sides, and there's nothing to gain from freeing them in a
    // process that's about to exit anyway.
    let string_arena: &_ = Box::leak(Box::new(colosseum::sync::Arena::new()));
    let herd = bumpalo_herd::Herd::new();
    let fragment_arena: &_ = Box::leak(Box::new(colosseum::sync::Arena::new()));
    let merged_arena: &_ = Box::leak(Box::new(colosseum::sync::Arena::new()));
    let comdat_arena: &_ = Box::leak(Box::new(colosseum::sync::Arena::new()));
    let symbol_arena: &_ = Box::leak(Box::new(colosseum::sync::Arena::new()));

    // The interner never grows during the link, so size it from the input bytes. One global
    // per ~50 bytes of input is a comfortable overestimate.
    let total_bytes: usize = input_data.mapped.iter().map(|m| m.data().len()).sum();
    let symbol_estimate = total_bytes / 50 + 1024;

    let ctx = Context::new(
        args,
        string_arena,
        &herd,
        fragment_arena,
        merged_arena,
        comdat_arena,
        symbol_arena,
        symbol_estimate,
    );

    let mut files = passes::parse_input_files(&ctx, &input_data)?;
    let machine = files
        .iter()
        .find_map(|f| f.as_object().map(|obj| obj.machine))
        .context("no object files")?;

    passes::apply_exclude_libs(&ctx, &mut files);
    passes::register_section_pieces(&ctx, &mut files)?;

    let mut link = Link::new(machine, files, &ctx);

    passes::resolve_symbols(&ctx, &link.files)?;
    passes::create_internal_symbols(&ctx, &mut link.files);
    passes::eliminate_comdats(&link.files);
    passes::convert_common_symbols(&ctx, &mut link.files);

    let version_script = match &input_data.version_script_data {
        Some(data) => VersionScript::parse(data)?,
        None => VersionScript::default(),
    };
    passes::apply_version_script(&ctx, &link.files, &version_script);
    passes::compute_import_export(&ctx, &link.files);

    if args.gc_sections {
        gc::gc_sections(&ctx, &link.files);
    }

    passes::compute_merged_section_sizes(&ctx, &mut link)?;
    passes::bin_sections(&ctx, &mut link);
    passes::add_start_stop_symbols(&ctx, &mut link);
    passes::claim_unresolved_symbols(&ctx, &link.files);
    error::checkpoint()?;
    passes::check_duplicate_symbols(&ctx, &link.files)?;
    passes::sort_init_fini(&ctx, &mut link);
    passes::compute_section_sizes(&mut link);
    passes::scan_rels(&ctx, &mut link)?;

    layout::create_chunks(&ctx, &mut link);
    layout::finalize_chunk_sizes(&ctx, &mut link)?;
    layout::sort_chunks(&ctx, &mut link);

    // The program header table's own size influences layout, so count segments first.
    let num_segments = layout::create_segments(&ctx, &link).len() as u64;
    if let Some(idx) = link.chunk_idx(ChunkKind::Phdr) {
        link.chunks[idx].shdr.sh_size = num_segments * elf::PROGRAM_HEADER_SIZE;
        link.chunks[idx].shdr.sh_addralign = 8;
    }

    layout::assign_addresses(&ctx, &mut link);
    layout::set_section_links(&mut link);
    layout::fix_up_addresses(&ctx, &mut link);

    // Debug compression shrinks non-alloc chunks, so file offsets are assigned once more
    // afterwards; allocated addresses don't move.
    layout::compress_debug_chunks(&ctx, &mut link);
    layout::assign_addresses(&ctx, &mut link);

    let segments = layout::create_segments(&ctx, &link);
    debug_assert_eq!(segments.len() as u64, num_segments);

    if !args.shared && link.entry_addr == 0 {
        error::warning(
            format_args!("cannot find entry symbol {}", args.entry),
            args.fatal_warnings,
        );
    }

    write_output(&ctx, &link, &segments)?;
    mapfile::write_map_file(&ctx, &link)?;

    if args.stats {
        timing::print_counters();
    }
    Ok(())
}

/// mmaps the output, copies every chunk (applying relocations), then finishes the pieces that
/// need the whole image: .rela.dyn, .symtab/.strtab, the headers, and the build id.
fn write_output<'data>(
    ctx: &Context<'data>,
    link: &Link<'data>,
    segments: &[layout::Segment],
) -> Result {
    crate::timing_phase!("Write output");

    let filesize = link.filesize;
    let mut output = output_file::OutputFile::create(&ctx.args.output, filesize)?;
    let buffer: &mut [u8] = &mut output.buffer;

    let dynrels = DynRelQueue::new();

    // Hand each chunk its disjoint slice of the file. Chunks are in ascending offset order.
    {
        let mut tasks: Vec<(usize, &mut [u8])> = Vec::new();
        let mut rest = &mut buffer[..];
        let mut consumed = 0u64;
        for (idx, chunk) in link.chunks.iter().enumerate() {
            if chunk.is_bss() || chunk.shdr.sh_size == 0 {
                continue;
            }
            let start = (chunk.shdr.sh_offset - consumed) as usize;
            let (_gap, at_chunk) = rest.split_at_mut(start);
            let (slice, after) = at_chunk.split_at_mut(chunk.shdr.sh_size as usize);
            rest = after;
            consumed = chunk.shdr.sh_offset + chunk.shdr.sh_size;
            tasks.push((idx, slice));
        }

        tasks.into_par_iter().try_for_each(|(idx, out)| -> Result {
            let chunk = &link.chunks[idx];
            if let Some(payload) = link.compressed_debug.get(&idx) {
                out[..payload.len()].copy_from_slice(payload);
                return Ok(());
            }
            match chunk.kind {
                ChunkKind::Ehdr | ChunkKind::Phdr | ChunkKind::Shdr => {}
                ChunkKind::Output(osec) => {
                    for sref in &link.osec_members[osec.0 as usize] {
                        let isec = output_chunks::section_ref(&link.files, *sref);
                        output_chunks::write_input_section(link, isec, chunk, out, &dynrels);
                    }
                }
                ChunkKind::Merged(merged_idx) => {
                    link.merged[merged_idx as usize].write_to(out);
                }
                ChunkKind::Interp => {
                    let interp = ctx.args.interpreter().unwrap_or_default().as_bytes();
                    out[..interp.len()].copy_from_slice(interp);
                    out[interp.len()] = 0;
                }
                ChunkKind::Got => output_chunks::write_got(link, chunk, out, &dynrels),
                ChunkKind::GotPlt => output_chunks::write_gotplt(link, chunk, out),
                ChunkKind::Plt => output_chunks::write_plt(link, chunk, out),
                ChunkKind::PltGot => output_chunks::write_pltgot(link, chunk, out),
                ChunkKind::RelDyn => {} // written after the queue has drained
                ChunkKind::RelPlt => output_chunks::write_relplt(link, chunk, out),
                ChunkKind::Dynamic => output_chunks::write_dynamic(link, out)?,
                ChunkKind::Dynsym => output_chunks::write_dynsym(link, out),
                ChunkKind::Dynstr => {
                    out[..link.dynstr.bytes().len()].copy_from_slice(link.dynstr.bytes());
                }
                ChunkKind::Hash => output_chunks::write_hash(link, out),
                ChunkKind::GnuHash => output_chunks::write_gnu_hash(link, out),
                ChunkKind::Versym => output_chunks::write_versym(link, out),
                ChunkKind::Verneed => output_chunks::write_verneed(link, out),
                ChunkKind::Copyrel { .. } => {} // NOBITS; relocations pushed below
                ChunkKind::NoteProperty => output_chunks::write_note_property(link, out),
                ChunkKind::BuildId => output_chunks::write_build_id_note(link, out),
                ChunkKind::EhFrame => output_chunks::write_eh_frame(link, chunk, out, &dynrels),
                ChunkKind::EhFrameHdr => output_chunks::write_eh_frame_hdr(link, chunk, out),
                ChunkKind::Symtab | ChunkKind::Strtab => {} // written together below
                ChunkKind::Shstrtab => {
                    out[..link.shstrtab_bytes.len()].copy_from_slice(&link.shstrtab_bytes);
                }
            }
            Ok(())
        })?;
    }

    // Copy relocations produce dynamic relocations but no bytes.
    output_chunks::write_copyrel(link, false, &dynrels);
    output_chunks::write_copyrel(link, true, &dynrels);

    // Drain the queued dynamic relocations into .rela.dyn, RELATIVE entries first.
    let arch = link.machine.arch();
    let entries = dynrels.into_sorted(arch.r_relative());
    if let Some(idx) = link.chunk_idx(ChunkKind::RelDyn) {
        let chunk = &link.chunks[idx];
        if entries.len() as u64 != link.num_dynrels {
            bail!(
                "internal error: counted {} dynamic relocations but emitted {}",
                link.num_dynrels,
                entries.len()
            );
        }
        let base = chunk.shdr.sh_offset as usize;
        for (i, (r_type, offset, dynsym, addend)) in entries.iter().enumerate() {
            let bytes = &mut buffer[base + i * elf::RELA_ENTRY_SIZE as usize..]
                [..elf::RELA_ENTRY_SIZE as usize];
            let rela: &mut elf::Rela = object::from_bytes_mut(bytes).unwrap().0;
            rela.r_offset.set(LE, *offset);
            rela.r_info
                .set(LE, (u64::from(*dynsym) << 32) | u64::from(*r_type));
            rela.r_addend.set(LE, *addend);
        }
    } else if !entries.is_empty() {
        bail!("internal error: dynamic relocations with no .rela.dyn section");
    }

    // .symtab and .strtab are written per input file at precomputed offsets.
    if let (Some(symtab_idx), Some(strtab_idx)) = (
        link.chunk_idx(ChunkKind::Symtab),
        link.chunk_idx(ChunkKind::Strtab),
    ) {
        let symtab_range = chunk_file_range(link, symtab_idx);
        let strtab_range = chunk_file_range(link, strtab_idx);
        let (symtab_out, strtab_out) = disjoint_slices(buffer, symtab_range, strtab_range);

        for file in &link.files {
            let Some(obj) = file.as_object() else { continue };
            if obj.is_alive.load(std::sync::atomic::Ordering::Relaxed) {
                output_chunks::write_symtab(link, obj, symtab_out, strtab_out);
            }
        }
    }

    layout::write_headers(ctx, link, segments, buffer)?;
    write_build_id(ctx, link, buffer);

    error::checkpoint()?;
    output.commit(!ctx.args.shared)?;
    Ok(())
}

fn chunk_file_range(link: &Link, idx: usize) -> std::ops::Range<usize> {
    let chunk = &link.chunks[idx];
    chunk.shdr.sh_offset as usize..(chunk.shdr.sh_offset + chunk.shdr.sh_size) as usize
}

/// Two non-overlapping mutable views of the output buffer.
fn disjoint_slices(
    buffer: &mut [u8],
    a: std::ops::Range<usize>,
    b: std::ops::Range<usize>,
) -> (&mut [u8], &mut [u8]) {
    assert!(a.end <= b.start || b.end <= a.start);
    if a.start < b.start {
        let (left, right) = buffer.split_at_mut(b.start);
        (&mut left[a], &mut right[..b.end - b.start])
    } else {
        let (left, right) = buffer.split_at_mut(a.start);
        let b_slice = &mut left[b];
        (&mut right[..a.end - a.start], b_slice)
    }
}

/// Hashes the finished image and patches the digest into the build-id note. The digest field
/// itself is zero while hashing, so relinking identical inputs stays reproducible.
fn write_build_id<'data>(ctx: &Context<'data>, link: &Link<'data>, buffer: &mut [u8]) {
    use md5::Digest as _;

    let Some(idx) = link.chunk_idx(ChunkKind::BuildId) else {
        return;
    };
    let chunk = &link.chunks[idx];
    let digest_offset = chunk.shdr.sh_offset as usize + 16;
    let digest_len = link.build_id_size as usize;

    let digest: Vec<u8> = match &ctx.args.build_id {
        args::BuildIdKind::None => return,
        args::BuildIdKind::Md5 => md5::Md5::digest(&buffer[..]).to_vec(),
        args::BuildIdKind::Sha1 => sha1::Sha1::digest(&buffer[..]).to_vec(),
        args::BuildIdKind::Sha256 => sha2::Sha256::digest(&buffer[..]).to_vec(),
        args::BuildIdKind::Uuid => uuid::Uuid::new_v4().as_bytes().to_vec(),
        args::BuildIdKind::Hex(bytes) => bytes.clone(),
    };
    buffer[digest_offset..digest_offset + digest_len]
        .copy_from_slice(&digest[..digest_len]);
}
