//! Code to read ar files. We iterate the entries ourselves rather than going through a generic
//! archive library because we want to borrow each member's bytes straight out of the mapping
//! and record where in the archive it came from.

use crate::error::Result;
use anyhow::Context as _;
use anyhow::bail;
use bytemuck::Pod;
use bytemuck::Zeroable;

pub(crate) struct ArchiveEntry<'data> {
    /// The member's filename, with extended-name indirection already applied.
    pub(crate) name: Vec<u8>,

    pub(crate) data: &'data [u8],

    /// Where in the archive the member's data lives, not including the entry header.
    pub(crate) file_range: std::ops::Range<usize>,
}

pub(crate) struct ArchiveIterator<'data> {
    data: &'data [u8],
    offset: usize,

    /// The `//` extended-filenames member, once seen.
    extended_filenames: Option<&'data [u8]>,
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
struct EntryHeader {
    ident: [u8; 16],
    _timestamp: [u8; 12],
    _owner_id: [u8; 6],
    _group_id: [u8; 6],
    _mode: [u8; 8],
    size: [u8; 10],
    end: [u8; 2],
}

const HEADER_SIZE: usize = size_of::<EntryHeader>();

const _ASSERTS: () = {
    assert!(HEADER_SIZE == 60);
};

impl<'data> ArchiveIterator<'data> {
    /// Creates an iterator from the bytes of the whole archive, including the magic.
    pub(crate) fn from_archive_bytes(data: &'data [u8]) -> Result<Self> {
        let magic = object::archive::MAGIC;
        let Some(rest) = data.strip_prefix(&magic) else {
            bail!("missing archive header");
        };
        Ok(Self {
            data: rest,
            offset: magic.len(),
            extended_filenames: None,
        })
    }

    fn next_result(&mut self) -> Result<Option<ArchiveEntry<'data>>> {
        loop {
            if self.data.len() < HEADER_SIZE {
                return Ok(None);
            }
            let (header, rest) = self.data.split_at(HEADER_SIZE);
            let header: &EntryHeader = bytemuck::from_bytes(header);
            let size = parse_decimal(&header.size).context("corrupt archive member size")?;
            self.data = rest;
            self.offset += HEADER_SIZE;

            if self.data.len() < size {
                bail!("archive member size {size} exceeds remaining {}", self.data.len());
            }

            let entry_data = &self.data[..size];
            let data_offset = self.offset;

            let size_with_padding = size.next_multiple_of(2).min(self.data.len());
            self.data = &self.data[size_with_padding..];
            self.offset += size_with_padding;

            let ident = trim_spaces(&header.ident);
            match ident {
                // The archive's own symbol table. We resolve lazy symbols from the members'
                // symbol tables instead, so this isn't useful to us.
                b"/" | b"/SYM64/" => continue,
                b"//" => {
                    self.extended_filenames = Some(entry_data);
                    continue;
                }
                _ => {}
            }

            let name = self.evaluate_name(ident)?;
            return Ok(Some(ArchiveEntry {
                name,
                data: entry_data,
                file_range: data_offset..data_offset + size,
            }));
        }
    }

    /// Resolves a member name. `/N` refers into the extended filenames member; a GNU short name
    /// ends with `/`; a BSD `#1/N` name would prefix the data, which GNU ar doesn't emit for the
    /// archives we consume, so we only strip the trailing slash form.
    fn evaluate_name(&self, ident: &[u8]) -> Result<Vec<u8>> {
        if let Some(rest) = ident.strip_prefix(b"/") {
            let offset: usize = std::str::from_utf8(rest)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .context("corrupt extended filename reference")?;
            let table = self
                .extended_filenames
                .context("extended filename used before filename table")?;
            let data = table.get(offset..).context("bad extended filename offset")?;
            let end = memchr::memchr(b'\n', data).unwrap_or(data.len());
            // Each name in the table ends with "/\n".
            let name = &data[..end];
            return Ok(name.strip_suffix(b"/").unwrap_or(name).to_vec());
        }
        Ok(ident.strip_suffix(b"/").unwrap_or(ident).to_vec())
    }
}

impl<'data> Iterator for ArchiveIterator<'data> {
    type Item = Result<ArchiveEntry<'data>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_result().transpose()
    }
}

fn trim_spaces(field: &[u8]) -> &[u8] {
    let end = field
        .iter()
        .rposition(|&b| b != b' ')
        .map_or(0, |pos| pos + 1);
    &field[..end]
}

fn parse_decimal(field: &[u8]) -> Option<usize> {
    let text = trim_spaces(field);
    std::str::from_utf8(text).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(ident: &str, size: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("{ident:<16}").as_bytes());
        out.extend_from_slice(b"0           ");
        out.extend_from_slice(b"0     ");
        out.extend_from_slice(b"0     ");
        out.extend_from_slice(b"644     ");
        out.extend_from_slice(format!("{size:<10}").as_bytes());
        out.extend_from_slice(b"`\n");
        assert_eq!(out.len(), HEADER_SIZE);
        out
    }

    fn build_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = object::archive::MAGIC.to_vec();
        for (ident, data) in members {
            out.extend_from_slice(&header(ident, data.len()));
            out.extend_from_slice(data);
            if data.len() % 2 == 1 {
                out.push(b'\n');
            }
        }
        out
    }

    #[test]
    fn test_iterate_members() {
        let archive = build_archive(&[("foo.o/", b"AAA"), ("bar.o/", b"BBBB")]);
        let entries: Vec<_> = ArchiveIterator::from_archive_bytes(&archive)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b"foo.o");
        assert_eq!(entries[0].data, b"AAA");
        assert_eq!(entries[1].name, b"bar.o");
        assert_eq!(&archive[entries[1].file_range.clone()], b"BBBB");
    }

    #[test]
    fn test_extended_names() {
        let long_name = b"a_rather_long_object_file_name.o/\n".as_slice();
        let archive = build_archive(&[("//", long_name), ("/0", b"XY")]);
        let entries: Vec<_> = ArchiveIterator::from_archive_bytes(&archive)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, b"a_rather_long_object_file_name.o");
        assert_eq!(entries[0].data, b"XY");
    }

    #[test]
    fn test_symbol_table_skipped() {
        let archive = build_archive(&[("/", b"\x00\x00\x00\x00"), ("x.o/", b"ZZ")]);
        let entries: Vec<_> = ArchiveIterator::from_archive_bytes(&archive)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, b"x.o");
    }
}
