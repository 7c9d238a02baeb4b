//! Code for figuring out which input files we need to read, then mapping them into memory. All
//! reads elsewhere in the linker go through the mappings created here; no pass performs blocking
//! I/O after this point.

use crate::args::Args;
use crate::args::Input;
use crate::args::InputSpec;
use crate::args::Modifiers;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::linker_script;
use anyhow::Context as _;
use anyhow::bail;
use hashbrown::HashSet;
use memmap2::Mmap;
use std::path::Path;
use std::path::PathBuf;

pub(crate) struct MappedFile {
    pub(crate) name: PathBuf,

    /// The modification timestamp of the input file just before we opened it. We expect our
    /// input files not to change while we're running.
    pub(crate) modification_time: std::time::SystemTime,

    /// None for empty files, which cannot be mmapped.
    bytes: Option<Mmap>,
}

impl MappedFile {
    pub(crate) fn open(path: &Path) -> Result<MappedFile> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;

        let metadata = file
            .metadata()
            .with_context(|| format!("cannot stat {}", path.display()))?;

        let modification_time = metadata
            .modified()
            .with_context(|| format!("cannot read mtime of {}", path.display()))?;

        // Safety: this is only sound if nothing modifies the file while we have it mapped. The
        // alternatives (reading everything up front, or reading only the parts we need) give up
        // too much performance; every other production linker makes the same call.
        let bytes = if metadata.len() == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file) }.with_context(|| {
                format!("cannot mmap {}", path.display())
            })?)
        };

        Ok(MappedFile {
            name: path.to_owned(),
            modification_time,
            bytes,
        })
    }

    pub(crate) fn data(&self) -> &[u8] {
        self.bytes.as_deref().unwrap_or_default()
    }
}

/// One object-file-shaped input: either a whole mapped file, or a slice of an archive. The slice
/// aliases the parent mapping; no second mmap is taken.
pub(crate) struct InputBytes {
    /// Index into `InputData::mapped`.
    pub(crate) mapped: usize,

    /// Byte range within the mapped file. For archive members this is the member's extent.
    pub(crate) range: std::ops::Range<usize>,

    /// The archive member name, if this input came out of an archive.
    pub(crate) member_name: Option<Vec<u8>>,

    pub(crate) kind: FileKind,
    pub(crate) modifiers: Modifiers,

    /// Whether the input gets archive semantics in symbol resolution (lazy until referenced).
    pub(crate) is_in_lib: bool,
}

pub(crate) struct InputData {
    pub(crate) mapped: Vec<MappedFile>,
    pub(crate) inputs: Vec<InputBytes>,
    pub(crate) version_script_data: Option<Vec<u8>>,
}

impl InputData {
    pub(crate) fn from_args(args: &Args) -> Result<InputData> {
        crate::timing_phase!("Open input files");

        let mut data = InputData {
            mapped: Vec::new(),
            inputs: Vec::new(),
            version_script_data: None,
        };

        let mut seen_paths = HashSet::new();
        let mut search_path: Vec<PathBuf> = args.lib_search_path.clone();
        let mut work: Vec<Input> = args.inputs.clone();
        work.reverse();

        while let Some(input) = work.pop() {
            let path = resolve_input_path(&input, &search_path)?;
            if !seen_paths.insert(path.clone()) {
                continue;
            }

            let file = MappedFile::open(&apply_chroot(&path, args))?;
            let kind = FileKind::identify_bytes(file.data())
                .with_context(|| format!("cannot parse {}", path.display()))?;
            let mapped = data.mapped.len();
            data.mapped.push(file);

            match kind {
                FileKind::Text => {
                    let file_data = data.mapped[mapped].data().to_vec();
                    let contents = linker_script::inputs_from_script(
                        &file_data,
                        &path,
                        input.modifiers,
                        args,
                    )
                    .with_context(|| {
                        format!("cannot parse linker script {}", path.display())
                    })?;
                    search_path.extend(contents.search_dirs);
                    // Process the script's files at the script's command line position.
                    for input in contents.inputs.into_iter().rev() {
                        work.push(input);
                    }
                }
                FileKind::Archive => {
                    let len = data.mapped[mapped].data().len();
                    data.add_archive_members(mapped, 0..len, input.modifiers)?;
                }
                FileKind::ElfObject | FileKind::ElfDynamic => {
                    let len = data.mapped[mapped].data().len();
                    data.inputs.push(InputBytes {
                        mapped,
                        range: 0..len,
                        member_name: None,
                        kind,
                        modifiers: input.modifiers,
                        is_in_lib: false,
                    });
                }
            }
        }

        if let Some(path) = &args.version_script {
            data.version_script_data = Some(
                std::fs::read(path)
                    .with_context(|| format!("cannot read version script {}", path.display()))?,
            );
        }

        Ok(data)
    }

    fn add_archive_members(
        &mut self,
        mapped: usize,
        range: std::ops::Range<usize>,
        modifiers: Modifiers,
    ) -> Result {
        let archive_data = &self.mapped[mapped].data()[range];
        let mut members = Vec::new();
        for entry in crate::archive::ArchiveIterator::from_archive_bytes(archive_data)? {
            let entry = entry?;
            let kind = FileKind::identify_bytes(entry.data).with_context(|| {
                format!(
                    "cannot parse archive member {} of {}",
                    String::from_utf8_lossy(&entry.name),
                    self.mapped[mapped].name.display()
                )
            })?;
            if kind != FileKind::ElfObject {
                bail!(
                    "archive member {} of {} is not an object file",
                    String::from_utf8_lossy(&entry.name),
                    self.mapped[mapped].name.display()
                );
            }
            members.push(InputBytes {
                mapped,
                range: entry.file_range,
                member_name: Some(entry.name),
                kind,
                modifiers,
                is_in_lib: true,
            });
        }
        self.inputs.append(&mut members);
        Ok(())
    }

    pub(crate) fn bytes(&self, input: &InputBytes) -> &[u8] {
        &self.mapped[input.mapped].data()[input.range.clone()]
    }

    pub(crate) fn display_name(&self, input: &InputBytes) -> String {
        let path = self.mapped[input.mapped].name.display();
        match &input.member_name {
            Some(member) => format!("{path}({})", String::from_utf8_lossy(member)),
            None => path.to_string(),
        }
    }
}

fn apply_chroot(path: &Path, args: &Args) -> PathBuf {
    match (&args.chroot, path.is_absolute()) {
        (Some(chroot), true) => {
            chroot.join(path.strip_prefix("/").unwrap_or(path))
        }
        _ => path.to_owned(),
    }
}

fn resolve_input_path(input: &Input, search_path: &[PathBuf]) -> Result<PathBuf> {
    match &input.spec {
        InputSpec::File(path) => Ok(path.clone()),
        InputSpec::Lib(name) => {
            if let Some(path) = name.strip_prefix(':') {
                if let Some(found) = search_for_file(search_path, path) {
                    return Ok(found);
                }
                bail!("library not found: {name}");
            }
            if input.modifiers.allow_shared {
                if let Some(found) = search_for_file(search_path, &format!("lib{name}.so")) {
                    return Ok(found);
                }
            }
            if let Some(found) = search_for_file(search_path, &format!("lib{name}.a")) {
                return Ok(found);
            }
            bail!("library not found: -l{name}");
        }
    }
}

fn search_for_file(lib_search_path: &[PathBuf], filename: impl AsRef<Path>) -> Option<PathBuf> {
    let filename = filename.as_ref();
    for dir in lib_search_path {
        let path = dir.join(filename);
        if path.exists() {
            return Some(path);
        }
    }
    None
}
