//! Parses the minimal linker-script subset that gets put in place of .so and .a files to tell
//! the linker to load some other input files: GROUP, INPUT, AS_NEEDED, OUTPUT_FORMAT and
//! SEARCH_DIR. Full layout-controlling scripts are not supported.

use crate::args::Args;
use crate::args::Input;
use crate::args::InputSpec;
use crate::args::Modifiers;
use crate::error::Result;
use anyhow::bail;
use std::path::Path;
use std::path::PathBuf;

pub(crate) struct ScriptContents {
    pub(crate) inputs: Vec<Input>,
    pub(crate) search_dirs: Vec<PathBuf>,
}

pub(crate) fn inputs_from_script(
    bytes: &[u8],
    script_path: &Path,
    modifiers: Modifiers,
    args: &Args,
) -> Result<ScriptContents> {
    let text = std::str::from_utf8(bytes)?;
    let tokens = tokenise(text);
    let commands = parse_commands(&mut tokens.into_iter().peekable(), false)?;

    let script_dir = script_path.parent();
    let mut contents = ScriptContents {
        inputs: Vec::new(),
        search_dirs: Vec::new(),
    };
    collect_inputs(&commands, modifiers, script_dir, args, &mut contents);
    Ok(contents)
}

#[derive(Debug, PartialEq)]
enum Command<'a> {
    Arg(&'a str),
    Group(Vec<Command<'a>>),
    AsNeeded(Vec<Command<'a>>),
    SearchDir(&'a str),
    Ignored,
}

fn tokenise(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        rest = skip_comments_and_whitespace(rest);
        if rest.is_empty() {
            break;
        }
        let len = rest
            .find(|ch: char| ch.is_whitespace() || matches!(ch, '(' | ')' | ','))
            .unwrap_or(rest.len())
            .max(1);
        let (token, r) = rest.split_at(len);
        if token != "," {
            tokens.push(token);
        }
        rest = r;
    }
    tokens
}

fn skip_comments_and_whitespace(mut text: &str) -> &str {
    loop {
        text = text.trim_start_matches([' ', '\t', '\n', '\r', ',']);
        if let Some(rest) = text.strip_prefix("/*") {
            match rest.find("*/") {
                Some(end) => text = &rest[end + 2..],
                None => return "",
            }
        } else {
            return text;
        }
    }
}

fn parse_commands<'a>(
    tokens: &mut std::iter::Peekable<std::vec::IntoIter<&'a str>>,
    in_paren: bool,
) -> Result<Vec<Command<'a>>> {
    let mut commands = Vec::new();
    while let Some(token) = tokens.next() {
        match token {
            ")" => {
                if !in_paren {
                    bail!("unmatched ')' in linker script");
                }
                return Ok(commands);
            }
            "GROUP" | "INPUT" => {
                expect(tokens, "(")?;
                commands.push(Command::Group(parse_commands(tokens, true)?));
            }
            "AS_NEEDED" => {
                expect(tokens, "(")?;
                commands.push(Command::AsNeeded(parse_commands(tokens, true)?));
            }
            "SEARCH_DIR" => {
                expect(tokens, "(")?;
                let dir = tokens.next().unwrap_or_default();
                expect(tokens, ")")?;
                commands.push(Command::SearchDir(dir));
            }
            "OUTPUT_FORMAT" => {
                expect(tokens, "(")?;
                // We accept whatever format names appear here; the real validation happens when
                // the named files are parsed.
                while let Some(t) = tokens.next() {
                    if t == ")" {
                        break;
                    }
                }
                commands.push(Command::Ignored);
            }
            other => commands.push(Command::Arg(other)),
        }
    }
    if in_paren {
        bail!("unmatched '(' in linker script");
    }
    Ok(commands)
}

fn expect(tokens: &mut std::iter::Peekable<std::vec::IntoIter<&str>>, expected: &str) -> Result {
    match tokens.next() {
        Some(token) if token == expected => Ok(()),
        Some(token) => bail!("expected '{expected}' in linker script, found '{token}'"),
        None => bail!("expected '{expected}' in linker script, found end of script"),
    }
}

fn collect_inputs(
    commands: &[Command],
    modifiers: Modifiers,
    script_dir: Option<&Path>,
    args: &Args,
    out: &mut ScriptContents,
) {
    for command in commands {
        match command {
            Command::Arg(arg) => {
                let spec = if let Some(lib) = arg.strip_prefix("-l") {
                    InputSpec::Lib(lib.to_owned())
                } else {
                    InputSpec::File(resolve_script_relative(arg, script_dir, args))
                };
                out.inputs.push(Input { spec, modifiers });
            }
            Command::Group(subs) => collect_inputs(subs, modifiers, script_dir, args, out),
            Command::AsNeeded(subs) => {
                let modifiers = Modifiers {
                    as_needed: true,
                    ..modifiers
                };
                collect_inputs(subs, modifiers, script_dir, args, out);
            }
            Command::SearchDir(dir) => out.search_dirs.push(PathBuf::from(dir)),
            Command::Ignored => {}
        }
    }
}

/// A file named by a script is looked for relative to the script's own directory first. That's
/// how glibc's libc.so script finds libc.so.6 next to it. Absolute paths pass through untouched;
/// --chroot is applied when the file is opened.
fn resolve_script_relative(name: &str, script_dir: Option<&Path>, _args: &Args) -> PathBuf {
    let path = Path::new(name);
    if path.is_absolute() {
        return path.to_owned();
    }
    if let Some(dir) = script_dir {
        let candidate = dir.join(path);
        if candidate.exists() {
            return candidate;
        }
    }
    path.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ScriptContents {
        let args = crate::args::Args::for_testing();
        inputs_from_script(
            text.as_bytes(),
            Path::new("/lib/libc.so"),
            Modifiers {
                as_needed: false,
                allow_shared: true,
            },
            &args,
        )
        .unwrap()
    }

    fn input_names(contents: &ScriptContents) -> Vec<String> {
        contents
            .inputs
            .iter()
            .map(|input| match &input.spec {
                InputSpec::File(path) => path.display().to_string(),
                InputSpec::Lib(name) => format!("-l{name}"),
            })
            .collect()
    }

    #[test]
    fn test_glibc_style_group() {
        let contents = parse(
            "/* GNU ld script */\n\
             OUTPUT_FORMAT(elf64-x86-64)\n\
             GROUP ( /lib/libc.so.6 /usr/lib/libc_nonshared.a  AS_NEEDED ( /lib/ld-linux-x86-64.so.2 ) )\n",
        );
        assert_eq!(
            input_names(&contents),
            vec![
                "/lib/libc.so.6",
                "/usr/lib/libc_nonshared.a",
                "/lib/ld-linux-x86-64.so.2"
            ]
        );
        assert!(!contents.inputs[0].modifiers.as_needed);
        assert!(contents.inputs[2].modifiers.as_needed);
    }

    #[test]
    fn test_input_and_search_dir() {
        let contents = parse("SEARCH_DIR(/opt/lib) INPUT(-lfoo, bar.o)");
        assert_eq!(contents.search_dirs, vec![PathBuf::from("/opt/lib")]);
        assert_eq!(input_names(&contents), vec!["-lfoo", "bar.o"]);
    }

    #[test]
    fn test_unbalanced_parens_rejected() {
        let args = crate::args::Args::for_testing();
        let result = inputs_from_script(
            b"GROUP ( a.o",
            Path::new("x"),
            Modifiers {
                as_needed: false,
                allow_shared: true,
            },
            &args,
        );
        assert!(result.is_err());
    }
}
