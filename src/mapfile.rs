//! The --Map printer: output sections with their addresses and sizes, each followed by its
//! input sections and the defined symbols they carry.

use crate::context::Context;
use crate::error::Result;
use crate::object_file::LinkFile;
use crate::output_chunks::ChunkKind;
use crate::output_chunks::section_ref;
use crate::output_chunks::sym_addr;
use crate::passes::Link;
use crate::symbol::SymbolPlace;
use anyhow::Context as _;
use std::io::Write as _;
use std::sync::atomic::Ordering;

pub(crate) fn write_map_file<'data>(ctx: &Context<'data>, link: &Link<'data>) -> Result {
    let Some(path) = &ctx.args.map_file else {
        return Ok(());
    };
    crate::timing_phase!("Write map file");

    let file = std::fs::File::create(path)
        .with_context(|| format!("cannot create map file {}", path.display()))?;
    let mut out = std::io::BufWriter::new(file);

    writeln!(out, "             VMA       Size Align Out     In      Symbol")?;

    for chunk in &link.chunks {
        if !chunk.has_shdr_entry() || chunk.shdr.sh_size == 0 {
            continue;
        }
        writeln!(
            out,
            "{:>16x} {:>10x} {:>5} {}",
            chunk.shdr.sh_addr,
            chunk.shdr.sh_size,
            chunk.shdr.sh_addralign,
            String::from_utf8_lossy(chunk.name),
        )?;

        let ChunkKind::Output(osec) = chunk.kind else {
            continue;
        };
        for sref in &link.osec_members[osec.0 as usize] {
            let isec = section_ref(&link.files, *sref);
            let obj = link.files[isec.file.as_usize()].as_object().unwrap();
            writeln!(
                out,
                "{:>16x} {:>10x} {:>5}         {}:({})",
                chunk.shdr.sh_addr + isec.output_offset(),
                isec.sh_size,
                isec.sh_addralign,
                obj.name,
                String::from_utf8_lossy(isec.name),
            )?;

            for i in 1..obj.esyms.len() {
                let sym = obj.symbol_at(i);
                let matches_section = {
                    let core = sym.core.lock().unwrap();
                    core.file == Some(obj.file_id)
                        && matches!(core.place, SymbolPlace::Section(shndx) if shndx == isec.shndx)
                };
                if matches_section && sym.write_to_symtab.load(Ordering::Relaxed) {
                    writeln!(
                        out,
                        "{:>16x} {:>10x} {:>5}                 {}",
                        sym_addr(link, sym),
                        0,
                        1,
                        sym.name_for_display(ctx.args.demangle),
                    )?;
                }
            }
        }
    }

    out.flush()?;
    Ok(())
}
