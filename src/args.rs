//! A handwritten parser for our arguments. We don't use a third-party option parser because we
//! need to behave like the other linkers on the platform: long options are accepted with both a
//! single and a double dash, values can be attached with `=` or follow as a separate argument,
//! and input-file modifiers like --as-needed apply to the inputs that come after them.

use crate::error::Result;
use anyhow::Context as _;
use anyhow::anyhow;
use anyhow::bail;
use std::path::PathBuf;

#[derive(Debug)]
pub struct Args {
    pub(crate) output: PathBuf,
    pub(crate) entry: String,
    pub(crate) shared: bool,
    pub(crate) is_static: bool,
    pub(crate) export_dynamic: bool,
    pub(crate) lib_search_path: Vec<PathBuf>,
    pub(crate) inputs: Vec<Input>,

    pub(crate) z_defs: bool,
    pub(crate) z_nodelete: bool,
    pub(crate) z_now: bool,
    pub(crate) z_relro: bool,
    pub(crate) z_execstack: bool,

    pub(crate) gc_sections: bool,
    pub(crate) print_gc_sections: bool,
    pub(crate) build_id: BuildIdKind,
    pub(crate) hash_style_sysv: bool,
    pub(crate) hash_style_gnu: bool,
    pub(crate) eh_frame_hdr: bool,

    pub(crate) strip_all: bool,
    pub(crate) strip_debug: bool,
    pub(crate) discard_all: bool,
    pub(crate) discard_locals: bool,
    pub(crate) retain_symbols_file: Option<Vec<Vec<u8>>>,

    pub(crate) version_script: Option<PathBuf>,
    pub(crate) dynamic_linker: Option<String>,
    pub(crate) image_base: u64,
    pub(crate) rpaths: Vec<String>,
    pub(crate) soname: Option<String>,
    pub(crate) wrap: Vec<String>,
    pub(crate) exclude_libs: Vec<String>,
    pub(crate) compress_debug_sections: CompressKind,
    pub(crate) map_file: Option<PathBuf>,
    pub(crate) chroot: Option<PathBuf>,
    pub(crate) undefined: Vec<String>,
    pub(crate) require_defined: Vec<String>,
    pub(crate) fatal_warnings: bool,
    pub(crate) unresolved_symbols: UnresolvedKind,
    pub(crate) demangle: bool,
    pub(crate) trace_symbols: Vec<String>,
    pub(crate) warn_common: bool,
    pub(crate) stats: bool,
    pub(crate) num_threads: Option<usize>,

    /// Whether to embed the command line into .comment. Controlled by MOLD_DEBUG.
    pub(crate) embed_cmdline: bool,
    pub(crate) cmdline: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct Input {
    pub(crate) spec: InputSpec,
    pub(crate) modifiers: Modifiers,
}

#[derive(Debug, Clone)]
pub(crate) enum InputSpec {
    File(PathBuf),
    Lib(String),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Modifiers {
    pub(crate) as_needed: bool,
    pub(crate) allow_shared: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BuildIdKind {
    None,
    Md5,
    Sha1,
    Sha256,
    Uuid,
    Hex(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompressKind {
    None,
    Gabi,
    Gnu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnresolvedKind {
    Error,
    Warn,
    IgnoreAll,
    IgnoreInObjectFiles,
    IgnoreInSharedLibs,
}

pub(crate) enum Action {
    Link(Box<Args>),
    Version,
}

impl Args {
    pub(crate) fn is_pic(&self) -> bool {
        self.shared
    }

    /// The dynamic linker path, unless -static or an explicit --dynamic-linker overrode it.
    pub(crate) fn interpreter(&self) -> Option<&str> {
        if self.is_static || self.shared {
            return self.dynamic_linker.as_deref();
        }
        Some(
            self.dynamic_linker
                .as_deref()
                .unwrap_or("/lib64/ld-linux-x86-64.so.2"),
        )
    }

    pub(crate) fn setup_thread_pool(&self) -> Result {
        let num_threads = self
            .num_threads
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()));
        rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build_global()
            .context("failed to initialise thread pool")?;
        Ok(())
    }
}

fn parse_hex(opt: &str, value: &str) -> Result<u64> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid {opt} value: {value}"))
}

fn parse_number(opt: &str, value: &str) -> Result<u64> {
    if value.starts_with("0x") || value.starts_with("0X") {
        parse_hex(opt, value)
    } else {
        value
            .parse()
            .with_context(|| format!("invalid {opt} value: {value}"))
    }
}

fn parse_build_id(value: &str) -> Result<BuildIdKind> {
    Ok(match value {
        "none" => BuildIdKind::None,
        "md5" => BuildIdKind::Md5,
        "sha1" => BuildIdKind::Sha1,
        "sha256" => BuildIdKind::Sha256,
        "uuid" => BuildIdKind::Uuid,
        _ => {
            if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
                BuildIdKind::Hex(decode_hex(hex)?)
            } else {
                bail!("invalid --build-id value: {value}");
            }
        }
    })
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 || hex.is_empty() {
        bail!("invalid hex string: {hex}");
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| anyhow!("invalid hex string: {hex}"))
        })
        .collect()
}

pub(crate) fn parse<S: AsRef<str>, I: Iterator<Item = S>>(input: I) -> Result<Action> {
    let cmdline: Vec<String> = input.map(|s| s.as_ref().to_owned()).collect();

    let mut args = Args {
        output: PathBuf::from("a.out"),
        entry: "_start".to_owned(),
        shared: false,
        is_static: false,
        export_dynamic: false,
        lib_search_path: Vec::new(),
        inputs: Vec::new(),
        z_defs: false,
        z_nodelete: false,
        z_now: false,
        z_relro: true,
        z_execstack: false,
        gc_sections: false,
        print_gc_sections: false,
        build_id: BuildIdKind::None,
        hash_style_sysv: true,
        hash_style_gnu: true,
        eh_frame_hdr: false,
        strip_all: false,
        strip_debug: false,
        discard_all: false,
        discard_locals: false,
        retain_symbols_file: None,
        version_script: None,
        dynamic_linker: None,
        image_base: crate::elf::IMAGE_BASE,
        rpaths: Vec::new(),
        soname: None,
        wrap: Vec::new(),
        exclude_libs: Vec::new(),
        compress_debug_sections: CompressKind::None,
        map_file: None,
        chroot: None,
        undefined: Vec::new(),
        require_defined: Vec::new(),
        fatal_warnings: false,
        unresolved_symbols: UnresolvedKind::Error,
        demangle: true,
        trace_symbols: Vec::new(),
        warn_common: false,
        stats: false,
        num_threads: None,
        embed_cmdline: std::env::var_os("MOLD_DEBUG").is_some_and(|v| !v.is_empty()),
        cmdline: cmdline.clone(),
    };

    if let Some(jobs) = std::env::var_os("MOLD_JOBS") {
        args.num_threads = jobs.to_string_lossy().parse().ok();
    }

    let mut modifiers = Modifiers {
        as_needed: false,
        allow_shared: true,
    };

    let mut input = cmdline.iter();

    // Returns the option's value: either the rest after `=`, or the next argument.
    fn value_of<'a>(
        arg: &'a str,
        attached: Option<&'a str>,
        input: &mut std::slice::Iter<'a, String>,
    ) -> Result<&'a str> {
        if let Some(value) = attached {
            return Ok(value);
        }
        input
            .next()
            .map(|s| s.as_str())
            .ok_or_else(|| anyhow!("missing argument for {arg}"))
    }

    while let Some(arg) = input.next() {
        let arg = arg.as_str();

        if !arg.starts_with('-') {
            args.inputs.push(Input {
                spec: InputSpec::File(PathBuf::from(arg)),
                modifiers,
            });
            continue;
        }

        // Single-letter options with an attached value: -lfoo, -L/usr/lib and friends.
        if !arg.starts_with("--") && arg.len() > 2 {
            let (letter, value) = arg[1..].split_at(1);
            match letter {
                "l" => {
                    args.inputs.push(Input {
                        spec: InputSpec::Lib(value.to_owned()),
                        modifiers,
                    });
                    continue;
                }
                "L" => {
                    args.lib_search_path.push(PathBuf::from(value));
                    continue;
                }
                "o" => {
                    args.output = PathBuf::from(value);
                    continue;
                }
                "y" => {
                    args.trace_symbols.push(value.to_owned());
                    continue;
                }
                "R" => {
                    args.rpaths.push(value.to_owned());
                    continue;
                }
                _ => {}
            }
        }

        // Accept both -option and --option.
        let long = arg.trim_start_matches('-');
        let (name, attached) = match long.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (long, None),
        };

        match name {
            "o" | "output" => args.output = PathBuf::from(value_of(arg, attached, &mut input)?),
            "e" | "entry" => args.entry = value_of(arg, attached, &mut input)?.to_owned(),
            "shared" | "Bshareable" => args.shared = true,
            "static" | "Bstatic" => args.is_static = true,
            "export-dynamic" | "E" => args.export_dynamic = true,
            "no-export-dynamic" => args.export_dynamic = false,
            "L" | "library-path" => args
                .lib_search_path
                .push(PathBuf::from(value_of(arg, attached, &mut input)?)),
            "l" | "library" => args.inputs.push(Input {
                spec: InputSpec::Lib(value_of(arg, attached, &mut input)?.to_owned()),
                modifiers,
            }),
            "as-needed" => modifiers.as_needed = true,
            "no-as-needed" => modifiers.as_needed = false,
            "z" => match value_of(arg, attached, &mut input)? {
                "defs" => args.z_defs = true,
                "nodefs" => args.z_defs = false,
                "nodelete" => args.z_nodelete = true,
                "now" => args.z_now = true,
                "lazy" => args.z_now = false,
                "relro" => args.z_relro = true,
                "norelro" => args.z_relro = false,
                "execstack" => args.z_execstack = true,
                "noexecstack" => args.z_execstack = false,
                other => crate::error::warning(
                    format_args!("unknown -z option: {other}"),
                    args.fatal_warnings,
                ),
            },
            "gc-sections" => args.gc_sections = true,
            "no-gc-sections" => args.gc_sections = false,
            "print-gc-sections" => args.print_gc_sections = true,
            "build-id" => {
                args.build_id = match attached {
                    Some(value) => parse_build_id(value)?,
                    None => BuildIdKind::Sha1,
                }
            }
            "hash-style" => match value_of(arg, attached, &mut input)? {
                "sysv" => {
                    args.hash_style_sysv = true;
                    args.hash_style_gnu = false;
                }
                "gnu" => {
                    args.hash_style_sysv = false;
                    args.hash_style_gnu = true;
                }
                "both" => {
                    args.hash_style_sysv = true;
                    args.hash_style_gnu = true;
                }
                other => bail!("invalid --hash-style value: {other}"),
            },
            "eh-frame-hdr" => args.eh_frame_hdr = true,
            "no-eh-frame-hdr" => args.eh_frame_hdr = false,
            "strip-all" | "s" => args.strip_all = true,
            "strip-debug" | "S" => args.strip_debug = true,
            "discard-all" | "x" => args.discard_all = true,
            "discard-locals" | "X" => args.discard_locals = true,
            "retain-symbols-file" => {
                let path = value_of(arg, attached, &mut input)?;
                let data = std::fs::read(path)
                    .with_context(|| format!("cannot read retain-symbols-file {path}"))?;
                args.retain_symbols_file = Some(
                    data.split(|&b| b == b'\n')
                        .map(|line| line.trim_ascii())
                        .filter(|line| !line.is_empty())
                        .map(|line| line.to_vec())
                        .collect(),
                );
            }
            "version-script" => {
                args.version_script = Some(PathBuf::from(value_of(arg, attached, &mut input)?));
            }
            "dynamic-linker" | "I" => {
                args.dynamic_linker = Some(value_of(arg, attached, &mut input)?.to_owned());
            }
            "no-dynamic-linker" => args.dynamic_linker = None,
            "image-base" | "Ttext" => {
                args.image_base = parse_number(arg, value_of(arg, attached, &mut input)?)?;
            }
            "rpath" | "R" => args
                .rpaths
                .push(value_of(arg, attached, &mut input)?.to_owned()),
            "soname" | "h" => args.soname = Some(value_of(arg, attached, &mut input)?.to_owned()),
            "wrap" => args
                .wrap
                .push(value_of(arg, attached, &mut input)?.to_owned()),
            "exclude-libs" => args.exclude_libs.extend(
                value_of(arg, attached, &mut input)?
                    .split([',', ':'])
                    .map(str::to_owned),
            ),
            "compress-debug-sections" => {
                args.compress_debug_sections = match value_of(arg, attached, &mut input)? {
                    "none" => CompressKind::None,
                    "zlib" | "zlib-gabi" => CompressKind::Gabi,
                    "zlib-gnu" => CompressKind::Gnu,
                    other => bail!("invalid --compress-debug-sections value: {other}"),
                };
            }
            "Map" => args.map_file = Some(PathBuf::from(value_of(arg, attached, &mut input)?)),
            "reproduce" => {
                let _ = value_of(arg, attached, &mut input)?;
                crate::error::warning("--reproduce is not supported", args.fatal_warnings);
            }
            "chroot" => args.chroot = Some(PathBuf::from(value_of(arg, attached, &mut input)?)),
            "u" | "undefined" => args
                .undefined
                .push(value_of(arg, attached, &mut input)?.to_owned()),
            "require-defined" => args
                .require_defined
                .push(value_of(arg, attached, &mut input)?.to_owned()),
            "fatal-warnings" => args.fatal_warnings = true,
            "no-fatal-warnings" => args.fatal_warnings = false,
            "unresolved-symbols" => {
                args.unresolved_symbols = match value_of(arg, attached, &mut input)? {
                    "report-all" | "error" => UnresolvedKind::Error,
                    "warn" => UnresolvedKind::Warn,
                    "ignore-all" => UnresolvedKind::IgnoreAll,
                    "ignore-in-object-files" => UnresolvedKind::IgnoreInObjectFiles,
                    "ignore-in-shared-libs" => UnresolvedKind::IgnoreInSharedLibs,
                    other => bail!("invalid --unresolved-symbols value: {other}"),
                };
            }
            "error-unresolved-symbols" => args.unresolved_symbols = UnresolvedKind::Error,
            "warn-unresolved-symbols" => args.unresolved_symbols = UnresolvedKind::Warn,
            "demangle" => args.demangle = true,
            "no-demangle" => args.demangle = false,
            "y" | "trace-symbol" => args
                .trace_symbols
                .push(value_of(arg, attached, &mut input)?.to_owned()),
            "warn-common" => args.warn_common = true,
            "no-warn-common" => args.warn_common = false,
            "stats" => args.stats = true,
            "threads" | "thread-count" => {
                args.num_threads = Some(value_of(arg, attached, &mut input)?.parse()?);
            }
            "v" | "version" => return Ok(Action::Version),

            // Options that other linkers accept and that require no action from us.
            "start-group" | "end-group" | "(" | ")" | "color-diagnostics" | "nostdlib"
            | "no-undefined-version" | "sort-common" | "Bdynamic" | "dy" | "dn" | "O0" | "O1"
            | "O2" | "plugin" | "plugin-opt" | "build-id-none" | "EL" => {}

            other => crate::error::warning(
                format_args!("unknown command line option: -{other}"),
                args.fatal_warnings,
            ),
        }
    }

    if args.is_static {
        for file in &mut args.inputs {
            file.modifiers.allow_shared = false;
        }
    }

    if args.inputs.is_empty() {
        bail!("no input files");
    }

    Ok(Action::Link(Box::new(args)))
}

#[cfg(test)]
impl Args {
    pub(crate) fn for_testing() -> Args {
        match parse(["dummy.o"].iter()).unwrap() {
            Action::Link(args) => *args,
            Action::Version => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_args(args: &[&str]) -> Args {
        match parse(args.iter()).unwrap() {
            Action::Link(args) => *args,
            Action::Version => panic!("expected link action"),
        }
    }

    #[test]
    fn test_basic() {
        let args = parse_args(&["-o", "out", "foo.o", "-L/usr/lib", "-lc"]);
        assert_eq!(args.output, PathBuf::from("out"));
        assert_eq!(args.inputs.len(), 2);
        assert_eq!(args.lib_search_path, vec![PathBuf::from("/usr/lib")]);
    }

    #[test]
    fn test_as_needed_applies_to_following_inputs() {
        let args = parse_args(&["a.o", "--as-needed", "-lfoo", "--no-as-needed", "-lbar", "-o", "x"]);
        assert!(!args.inputs[0].modifiers.as_needed);
        assert!(args.inputs[1].modifiers.as_needed);
        assert!(!args.inputs[2].modifiers.as_needed);
    }

    #[test]
    fn test_z_options() {
        let args = parse_args(&["a.o", "-z", "now", "-z", "norelro", "-z", "execstack"]);
        assert!(args.z_now);
        assert!(!args.z_relro);
        assert!(args.z_execstack);
    }

    #[test]
    fn test_build_id() {
        assert_eq!(parse_build_id("sha256").unwrap(), BuildIdKind::Sha256);
        assert_eq!(
            parse_build_id("0xcafe01").unwrap(),
            BuildIdKind::Hex(vec![0xca, 0xfe, 0x01])
        );
        assert!(parse_build_id("bogus").is_err());
    }

    #[test]
    fn test_equals_and_separate_values() {
        let a = parse_args(&["a.o", "--image-base=0x40000"]);
        let b = parse_args(&["a.o", "--image-base", "0x40000"]);
        assert_eq!(a.image_base, 0x40000);
        assert_eq!(b.image_base, 0x40000);
    }

    #[test]
    fn test_static_disables_shared_inputs() {
        let args = parse_args(&["-static", "-lfoo", "a.o"]);
        assert!(args.inputs.iter().all(|i| !i.modifiers.allow_shared));
    }
}
