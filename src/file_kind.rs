//! Identifies what sort of file we're dealing with based on its first few bytes.

use crate::elf;
use crate::error::Result;
use anyhow::bail;
use object::LittleEndian;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileKind {
    ElfObject,
    ElfDynamic,
    Archive,
    Text,
}

impl FileKind {
    pub(crate) fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if bytes.starts_with(&object::archive::MAGIC) {
            Ok(FileKind::Archive)
        } else if bytes.starts_with(&object::elf::ELFMAG) {
            const HEADER_LEN: usize = size_of::<elf::FileHeader>();
            if bytes.len() < HEADER_LEN {
                bail!("file too small");
            }
            let header: &elf::FileHeader = object::from_bytes(&bytes[..HEADER_LEN]).unwrap().0;
            if header.e_ident.class != object::elf::ELFCLASS64 {
                bail!("only 64-bit ELF is supported");
            }
            if header.e_ident.data != object::elf::ELFDATA2LSB {
                bail!("only little-endian ELF is supported");
            }
            match header.e_type.get(LittleEndian) {
                object::elf::ET_REL => Ok(FileKind::ElfObject),
                object::elf::ET_DYN => Ok(FileKind::ElfDynamic),
                t => bail!("unsupported ELF type {t}"),
            }
        } else if bytes.is_ascii() {
            // Probably a linker script.
            Ok(FileKind::Text)
        } else {
            bail!("unknown file type");
        }
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileKind::ElfObject => "ELF object",
            FileKind::ElfDynamic => "ELF shared object",
            FileKind::Archive => "archive",
            FileKind::Text => "linker script",
        };
        std::fmt::Display::fmt(s, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify() {
        assert_eq!(
            FileKind::identify_bytes(b"!<arch>\x0a").unwrap(),
            FileKind::Archive
        );
        assert_eq!(
            FileKind::identify_bytes(b"GROUP(libc.so.6)").unwrap(),
            FileKind::Text
        );
        assert!(FileKind::identify_bytes(&[0x7f, b'E', b'L', b'F']).is_err());
        assert!(FileKind::identify_bytes(&[0xff, 0xfe]).is_err());
    }
}
