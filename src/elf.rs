//! Typed views into ELF structures plus the handful of byte-level helpers that the rest of the
//! linker shares. All multi-byte fields are read and written with explicit endianness; we never
//! transmute file bytes into host-native integers.

use crate::error::Result;
use anyhow::bail;
use object::LittleEndian;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub(crate) type FileHeader = object::elf::FileHeader64<LittleEndian>;
pub(crate) type ProgramHeader = object::elf::ProgramHeader64<LittleEndian>;
pub(crate) type SectionHeader = object::elf::SectionHeader64<LittleEndian>;
pub(crate) type Sym = object::elf::Sym64<LittleEndian>;
pub(crate) type DynamicEntry = object::elf::Dyn64<LittleEndian>;
pub(crate) type Rela = object::elf::Rela64<LittleEndian>;
pub(crate) type Verdef = object::elf::Verdef<LittleEndian>;
pub(crate) type Verdaux = object::elf::Verdaux<LittleEndian>;
pub(crate) type Verneed = object::elf::Verneed<LittleEndian>;
pub(crate) type Vernaux = object::elf::Vernaux<LittleEndian>;
pub(crate) type Versym = object::elf::Versym<LittleEndian>;
pub(crate) type NoteHeader = object::elf::NoteHeader64<LittleEndian>;
pub(crate) type CompressionHeader = object::elf::CompressionHeader64<LittleEndian>;

pub(crate) const FILE_HEADER_SIZE: u64 = 0x40;
pub(crate) const PROGRAM_HEADER_SIZE: u64 = 0x38;
pub(crate) const SECTION_HEADER_SIZE: u64 = 0x40;
pub(crate) const SYMTAB_ENTRY_SIZE: u64 = 0x18;
pub(crate) const RELA_ENTRY_SIZE: u64 = 0x18;
pub(crate) const GOT_ENTRY_SIZE: u64 = 8;
pub(crate) const PLT_ENTRY_SIZE: u64 = 16;
pub(crate) const COMPRESSION_HEADER_SIZE: usize = size_of::<CompressionHeader>();

pub(crate) const COMMON_PAGE_SIZE: u64 = 0x1000;

/// Our starting address in memory when linking non-relocatable executables. Same value ld uses;
/// a distinctive non-zero base makes mixed-up file/memory offsets obvious.
pub(crate) const IMAGE_BASE: u64 = 0x200_000;

pub(crate) const EF_VERSYM_HIDDEN: u16 = 0x8000;

pub(crate) fn align_to(val: u64, align: u64) -> u64 {
    if align == 0 {
        return val;
    }
    debug_assert!(align.is_power_of_two());
    (val + align - 1) & !(align - 1)
}

/// Returns the smallest n such that n >= val and n % align == skew.
pub(crate) fn align_with_skew(val: u64, align: u64, skew: u64) -> u64 {
    align_to(val + align - skew, align) - align + skew
}

pub(crate) fn read_u16(data: &[u8]) -> u16 {
    u16::from_le_bytes([data[0], data[1]])
}

pub(crate) fn read_u32(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

pub(crate) fn read_i32(data: &[u8]) -> i32 {
    read_u32(data) as i32
}

pub(crate) fn read_u64(data: &[u8]) -> u64 {
    u64::from_le_bytes(data[..8].try_into().unwrap())
}

pub(crate) fn write_u32(out: &mut [u8], value: u32) {
    out[..4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u64(out: &mut [u8], value: u64) {
    out[..8].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn encode_uleb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn read_uleb(data: &mut &[u8]) -> Result<u64> {
    let mut value = 0;
    let mut shift = 0;
    loop {
        let Some((&byte, rest)) = data.split_first() else {
            bail!("truncated uleb128");
        };
        *data = rest;
        if shift >= 64 {
            bail!("uleb128 value too large");
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Decompresses the payload of a SHF_COMPRESSED section (gabi form) into `out`, which must have
/// exactly ch_size bytes.
pub(crate) fn decompress_into(ch_type: u32, input: &[u8], out: &mut [u8]) -> Result {
    match ch_type {
        object::elf::ELFCOMPRESS_ZLIB => {
            let mut decompress = flate2::Decompress::new(true);
            decompress.decompress(input, out, flate2::FlushDecompress::Finish)?;
            if decompress.total_out() != out.len() as u64 {
                bail!("uncompressed size doesn't match section header");
            }
        }
        c => bail!("unsupported compression type {c}"),
    }
    Ok(())
}

pub(crate) fn compress_zlib(input: &[u8]) -> Vec<u8> {
    use std::io::Write as _;
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(input).unwrap();
    encoder.finish().unwrap()
}

/// Section names such as `__mysection` become `__start___mysection` / `__stop___mysection`
/// symbols, but only if the name is a valid C identifier.
pub(crate) fn is_c_identifier(name: &[u8]) -> bool {
    if name.is_empty() {
        return false;
    }
    let first_ok = name[0].is_ascii_alphabetic() || name[0] == b'_';
    first_ok
        && name[1..]
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'_')
}

/// See https://refspecs.linuxfoundation.org/LSB_1.3.0/gLSB/gLSB/ehframehdr.html
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy)]
#[repr(C)]
pub(crate) struct EhFrameHdr {
    pub(crate) version: u8,
    pub(crate) frame_pointer_encoding: u8,
    pub(crate) count_encoding: u8,
    pub(crate) table_encoding: u8,
    pub(crate) frame_pointer: i32,
    pub(crate) entry_count: u32,
}

pub(crate) const EH_FRAME_HDR_SIZE: u64 = size_of::<EhFrameHdr>() as u64;

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy)]
#[repr(C)]
pub(crate) struct EhFrameHdrEntry {
    pub(crate) frame_ptr: i32,
    pub(crate) frame_info_ptr: i32,
}

pub(crate) const EH_FRAME_HDR_ENTRY_SIZE: u64 = size_of::<EhFrameHdrEntry>() as u64;

/// The standard SysV ELF hash function.
pub(crate) fn elf_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in name {
        h = (h << 4).wrapping_add(u32::from(b));
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// The GNU hash function used by .gnu.hash.
pub(crate) fn gnu_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 5381;
    for &b in name {
        h = h.wrapping_mul(33).wrapping_add(u32::from(b));
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uleb_round_trip() {
        let mut buf = Vec::new();
        for value in [0u64, 1, 0x7f, 0x80, 0x3fff, 0x4000, u32::MAX as u64, u64::MAX] {
            buf.clear();
            encode_uleb(&mut buf, value);
            let mut slice = buf.as_slice();
            assert_eq!(read_uleb(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_read_uleb_rejects_truncation() {
        let mut slice = [0x80u8, 0x80].as_slice();
        assert!(read_uleb(&mut slice).is_err());
    }

    #[test]
    fn test_align_with_skew() {
        assert_eq!(align_with_skew(0x2000, 0x1000, 0x234), 0x2234);
        assert_eq!(align_with_skew(0x2234, 0x1000, 0x234), 0x2234);
        assert_eq!(align_with_skew(0x2235, 0x1000, 0x234), 0x3234);
        // The invariant layout relies on: result % align == skew.
        for val in [0u64, 1, 0xfff, 0x1000, 0x12345] {
            let r = align_with_skew(val, 0x1000, 0x10);
            assert!(r >= val);
            assert_eq!(r % 0x1000, 0x10);
        }
    }

    #[test]
    fn test_is_c_identifier() {
        assert!(is_c_identifier(b"__libc_atexit"));
        assert!(is_c_identifier(b"_a1"));
        assert!(!is_c_identifier(b""));
        assert!(!is_c_identifier(b".text"));
        assert!(!is_c_identifier(b"9abc"));
        assert!(!is_c_identifier(b"foo-bar"));
    }

    #[test]
    fn test_hash_functions() {
        // Known-answer values from the ELF gABI and glibc.
        assert_eq!(elf_hash(b""), 0);
        assert_eq!(elf_hash(b"printf"), 0x077905a6);
        assert_eq!(gnu_hash(b""), 5381);
        assert_eq!(gnu_hash(b"printf"), 0x156b2bb8);
    }

    #[test]
    fn test_zlib_round_trip() {
        let input = b"hello hello hello hello";
        let compressed = compress_zlib(input);
        let mut out = vec![0u8; input.len()];
        decompress_into(object::elf::ELFCOMPRESS_ZLIB, &compressed, &mut out).unwrap();
        assert_eq!(&out, input);
    }
}
