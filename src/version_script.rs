//! Parses version scripts. We only need them to decide which symbols stay local (and so out of
//! the dynamic symbol table); emitting VERDEF records for named versions is not supported.

use crate::error::Result;
use crate::hash::PassThroughHasher;
use crate::hash::PreHashed;
use crate::hash::hash_bytes;
use anyhow::bail;
use std::collections::HashSet;

#[derive(Default)]
pub(crate) struct VersionScript {
    versions: Vec<Version>,
}

#[derive(Default)]
struct Version {
    globals: MatchRules,
    locals: MatchRules,
}

#[derive(Default)]
struct MatchRules {
    matches_all: bool,
    exact: HashSet<PreHashed<Vec<u8>>, PassThroughHasher>,
    prefixes: Vec<Vec<u8>>,
}

impl MatchRules {
    fn push(&mut self, pattern: &str) {
        if pattern == "*" {
            self.matches_all = true;
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            self.prefixes.push(prefix.as_bytes().to_vec());
        } else {
            let bytes = pattern.as_bytes().to_vec();
            let hash = hash_bytes(&bytes);
            self.exact.insert(PreHashed::new(bytes, hash));
        }
    }

    fn matches(&self, name: &[u8]) -> bool {
        if self.matches_all {
            return true;
        }
        let key = PreHashed::new(name.to_vec(), hash_bytes(name));
        self.exact.contains(&key) || self.prefixes.iter().any(|p| name.starts_with(p))
    }
}

impl VersionScript {
    pub(crate) fn parse(data: &[u8]) -> Result<VersionScript> {
        let text = std::str::from_utf8(data)?;
        let mut script = VersionScript::default();

        #[derive(PartialEq)]
        enum Section {
            None,
            Global,
            Local,
        }

        let mut version: Option<(Version, Section)> = None;
        let mut in_comment = false;

        for raw_line in text.lines() {
            // Strip /* */ comments, which may span lines.
            let mut buf = String::new();
            let mut rest = raw_line;
            loop {
                if in_comment {
                    match rest.find("*/") {
                        Some(end) => {
                            rest = &rest[end + 2..];
                            in_comment = false;
                        }
                        None => break,
                    }
                }
                match rest.find("/*") {
                    Some(start) => {
                        buf.push_str(&rest[..start]);
                        rest = &rest[start + 2..];
                        in_comment = true;
                    }
                    None => {
                        buf.push_str(rest);
                        break;
                    }
                }
            }
            let line = buf.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.ends_with('{') || line == "{" {
                if version.is_some() {
                    bail!("nested version blocks in version script");
                }
                version = Some((Version::default(), Section::None));
                continue;
            }
            if let Some(rest) = line.strip_prefix('}') {
                let Some((done, _)) = version.take() else {
                    bail!("unmatched '}}' in version script");
                };
                if !rest.trim_start().trim_end_matches(';').trim().is_empty() {
                    // A predecessor version name; accepted and ignored since we don't emit
                    // version definitions.
                }
                script.versions.push(done);
                continue;
            }

            let Some((current, section)) = version.as_mut() else {
                bail!("symbol pattern outside a version block: {line}");
            };
            if line == "global:" {
                *section = Section::Global;
            } else if line == "local:" {
                *section = Section::Local;
            } else {
                for pattern in line.split(';') {
                    let pattern = pattern.trim();
                    if pattern.is_empty() {
                        continue;
                    }
                    match section {
                        Section::Local => current.locals.push(pattern),
                        _ => current.globals.push(pattern),
                    }
                }
            }
        }

        if version.is_some() {
            bail!("missing '}}' in version script");
        }
        Ok(script)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Whether the script demotes `name` to local binding scope.
    pub(crate) fn is_local(&self, name: &[u8]) -> bool {
        self.versions
            .iter()
            .any(|v| !v.globals.matches(name) && v.locals.matches(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_local_global() {
        let script = VersionScript::parse(
            b"{\n  global:\n    foo;\n    bar*;\n  local:\n    *;\n};\n",
        )
        .unwrap();
        assert!(!script.is_local(b"foo"));
        assert!(!script.is_local(b"barbaz"));
        assert!(script.is_local(b"qux"));
    }

    #[test]
    fn test_named_version() {
        let script = VersionScript::parse(
            b"LIBFOO_1.0 {\n  global: api_*;\n  local: *;\n};\n",
        )
        .unwrap();
        assert!(!script.is_local(b"api_open"));
        assert!(script.is_local(b"internal_helper"));
    }

    #[test]
    fn test_unbalanced_rejected() {
        assert!(VersionScript::parse(b"{ global: foo;\n").is_err());
        assert!(VersionScript::parse(b"};").is_err());
    }

    #[test]
    fn test_empty_script_matches_nothing() {
        let script = VersionScript::default();
        assert!(script.is_empty());
        assert!(!script.is_local(b"anything"));
    }
}
