//! Per-link shared state. One Context is created per link; the arenas it references own every
//! file, section, symbol, fragment and saved string, so nothing inside the link graph is freed
//! until the whole Context goes away. That's what makes the pervasive back-pointers safe.

use crate::args::Args;
use crate::interner::SymbolInterner;
use crate::string_merging::MergedSection;
use crate::string_merging::SectionFragment;
use crate::symbol::Symbol;
use colosseum::sync::Arena;
use hashbrown::HashMap;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// A comdat group, keyed by its signature symbol's name. `owner` is the priority of the lowest
/// file that presented the group; everyone else's members die.
pub(crate) struct ComdatGroup {
    pub(crate) owner: AtomicU32,
}

impl ComdatGroup {
    /// CAS-min on the owner priority.
    pub(crate) fn propose_owner(&self, priority: u32) {
        let mut current = self.owner.load(Ordering::Relaxed);
        while priority < current {
            match self.owner.compare_exchange_weak(
                current,
                priority,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Identifies a regular (copied-from-input) output section.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct OutputSecId(pub(crate) u32);

pub(crate) struct OutputSectionInfo<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
}

#[derive(Default)]
struct OutputSectionRegistry<'data> {
    by_key: HashMap<(&'data [u8], u32, u64), OutputSecId>,
    infos: Vec<OutputSectionInfo<'data>>,
}

pub(crate) struct Context<'data> {
    pub(crate) args: &'data Args,

    pub(crate) string_arena: &'data Arena<Vec<u8>>,
    pub(crate) herd: &'data bumpalo_herd::Herd,
    pub(crate) fragment_arena: &'data Arena<SectionFragment<'data>>,
    merged_arena: &'data Arena<MergedSection<'data>>,
    comdat_arena: &'data Arena<ComdatGroup>,

    pub(crate) symbol_interner: SymbolInterner<'data>,

    comdat_groups: Mutex<HashMap<&'data [u8], &'data ComdatGroup>>,
    merged_sections: Mutex<Vec<&'data MergedSection<'data>>>,
    merged_by_key: Mutex<HashMap<(&'data [u8], u32, u64), &'data MergedSection<'data>>>,
    output_sections: Mutex<OutputSectionRegistry<'data>>,
}

impl<'data> Context<'data> {
    pub(crate) fn new(
        args: &'data Args,
        string_arena: &'data Arena<Vec<u8>>,
        herd: &'data bumpalo_herd::Herd,
        fragment_arena: &'data Arena<SectionFragment<'data>>,
        merged_arena: &'data Arena<MergedSection<'data>>,
        comdat_arena: &'data Arena<ComdatGroup>,
        symbol_arena: &'data Arena<Symbol<'data>>,
        symbol_estimate: usize,
    ) -> Context<'data> {
        let ctx = Context {
            args,
            string_arena,
            herd,
            fragment_arena,
            merged_arena,
            comdat_arena,
            symbol_interner: SymbolInterner::new(symbol_arena, symbol_estimate),
            comdat_groups: Mutex::new(HashMap::new()),
            merged_sections: Mutex::new(Vec::new()),
            merged_by_key: Mutex::new(HashMap::new()),
            output_sections: Mutex::new(OutputSectionRegistry::default()),
        };

        for name in &args.trace_symbols {
            let name = ctx.save_bytes(name.as_bytes().to_vec());
            ctx.symbol_interner
                .intern(name)
                .traced
                .store(true, Ordering::Relaxed);
        }
        for name in &args.wrap {
            let name = ctx.save_bytes(name.as_bytes().to_vec());
            ctx.symbol_interner
                .intern(name)
                .wrap
                .store(true, Ordering::Relaxed);
        }

        ctx
    }

    /// Copies `data` into context-lifetime storage.
    pub(crate) fn save_bytes(&self, data: Vec<u8>) -> &'data [u8] {
        &*self.string_arena.alloc(data)
    }

    pub(crate) fn save_string(&self, data: String) -> &'data [u8] {
        self.save_bytes(data.into_bytes())
    }

    pub(crate) fn intern(&self, name: &'data [u8]) -> &'data Symbol<'data> {
        self.symbol_interner.intern(name)
    }

    pub(crate) fn comdat_group(&self, signature: &'data [u8]) -> &'data ComdatGroup {
        let mut groups = self.comdat_groups.lock().unwrap();
        *groups.entry(signature).or_insert_with(|| {
            &*self.comdat_arena.alloc(ComdatGroup {
                owner: AtomicU32::new(u32::MAX),
            })
        })
    }

    /// Finds or creates the merged section for (output name, type, flags).
    pub(crate) fn merged_section(
        &self,
        name: &'data [u8],
        sh_type: u32,
        sh_flags: u64,
    ) -> &'data MergedSection<'data> {
        let name = output_section_name(name);
        let key_flags = sh_flags
            & !u64::from(object::elf::SHF_MERGE)
            & !u64::from(object::elf::SHF_STRINGS)
            & !u64::from(object::elf::SHF_GROUP)
            & !u64::from(object::elf::SHF_COMPRESSED);
        let mut by_key = self.merged_by_key.lock().unwrap();
        *by_key
            .entry((name, sh_type, key_flags))
            .or_insert_with(|| {
                let section = &*self
                    .merged_arena
                    .alloc(MergedSection::new(name, sh_type, key_flags));
                self.merged_sections.lock().unwrap().push(section);
                section
            })
    }

    pub(crate) fn merged_sections(&self) -> Vec<&'data MergedSection<'data>> {
        let mut sections = self.merged_sections.lock().unwrap().clone();
        // Created in parallel, so impose a deterministic order.
        sections.sort_by_key(|sec| (sec.name, sec.sh_type, sec.sh_flags));
        sections
    }

    /// Finds or creates the regular output section for (output name, type, flags).
    pub(crate) fn output_section(
        &self,
        name: &'data [u8],
        sh_type: u32,
        sh_flags: u64,
    ) -> OutputSecId {
        let name = output_section_name(name);
        let key_flags = sh_flags
            & !u64::from(object::elf::SHF_GROUP)
            & !u64::from(object::elf::SHF_COMPRESSED)
            & !u64::from(object::elf::SHF_LINK_ORDER);
        let mut registry = self.output_sections.lock().unwrap();
        match registry.by_key.get(&(name, sh_type, key_flags)) {
            Some(id) => *id,
            None => {
                let id = OutputSecId(registry.infos.len() as u32);
                registry.by_key.insert((name, sh_type, key_flags), id);
                registry.infos.push(OutputSectionInfo {
                    name,
                    sh_type,
                    sh_flags: key_flags,
                });
                id
            }
        }
    }

    pub(crate) fn num_output_sections(&self) -> usize {
        self.output_sections.lock().unwrap().infos.len()
    }

    pub(crate) fn output_section_info(&self, id: OutputSecId) -> OutputSectionInfo<'data> {
        let registry = self.output_sections.lock().unwrap();
        let info = &registry.infos[id.0 as usize];
        OutputSectionInfo {
            name: info.name,
            sh_type: info.sh_type,
            sh_flags: info.sh_flags,
        }
    }
}

/// Maps an input section name onto the output section it lands in: `.text.foo` and `.text.bar`
/// both go to `.text`, and so on for the other well-known prefixes.
pub(crate) fn output_section_name(name: &[u8]) -> &[u8] {
    const PREFIXES: &[&[u8]] = &[
        b".text",
        b".data.rel.ro",
        b".data",
        b".rodata",
        b".bss.rel.ro",
        b".bss",
        b".init_array",
        b".fini_array",
        b".tbss",
        b".tdata",
        b".gcc_except_table",
        b".ctors",
        b".dtors",
    ];
    for &prefix in PREFIXES {
        if name == prefix {
            return prefix;
        }
        if name.len() > prefix.len() && name.starts_with(prefix) && name[prefix.len()] == b'.' {
            return prefix;
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_section_name() {
        assert_eq!(output_section_name(b".text.startup"), b".text");
        assert_eq!(output_section_name(b".text"), b".text");
        assert_eq!(output_section_name(b".textual"), b".textual");
        assert_eq!(output_section_name(b".data.rel.ro.local"), b".data.rel.ro");
        assert_eq!(output_section_name(b".rodata.str1.1"), b".rodata");
        assert_eq!(output_section_name(b".mine"), b".mine");
    }

    #[test]
    fn test_comdat_owner_is_min_priority() {
        let group = ComdatGroup {
            owner: AtomicU32::new(u32::MAX),
        };
        group.propose_owner(7);
        group.propose_owner(3);
        group.propose_owner(9);
        assert_eq!(group.owner.load(Ordering::Relaxed), 3);
    }
}
