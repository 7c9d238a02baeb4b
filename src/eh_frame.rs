//! .eh_frame is parsed rather than copied wholesale: records for dead functions must not be
//! emitted, identical CIEs from different objects are merged, and .eh_frame_hdr needs a sorted
//! PC table, all of which require knowing where each CIE/FDE starts and which relocations
//! belong to it.

use crate::elf::Rela;
use crate::elf::read_u32;
use crate::error::Result;
use anyhow::bail;
use object::LittleEndian;

pub(crate) const NO_CIE: u32 = u32::MAX;

pub(crate) struct CieRecord {
    /// Offset of the record in the input .eh_frame section.
    pub(crate) input_offset: u32,

    /// The record's relocations: indices into the .eh_frame section's relocation list.
    pub(crate) rel_begin: u32,
    pub(crate) rel_end: u32,

    /// Offset in the output .eh_frame if this CIE is a leader, otherwise the leader's offset.
    pub(crate) output_offset: u32,
    pub(crate) is_leader: bool,
}

pub(crate) struct FdeRecord {
    pub(crate) input_offset: u32,
    pub(crate) rel_begin: u32,
    pub(crate) rel_end: u32,
    pub(crate) cie_idx: u32,

    /// Offset in the output .eh_frame, or u32::MAX if the FDE isn't emitted.
    pub(crate) output_offset: u32,
}

impl FdeRecord {
    pub(crate) fn is_emitted(&self) -> bool {
        self.output_offset != u32::MAX
    }
}

/// Size of the record starting at `offset`, including the length field.
pub(crate) fn record_size(contents: &[u8], offset: u32) -> u32 {
    read_u32(&contents[offset as usize..]) + 4
}

/// Splits an input .eh_frame into CIE and FDE records and attaches each record's relocations.
/// The caller resolves FDE-to-section attachment, which needs the symbol table.
pub(crate) fn read_records(
    contents: &[u8],
    rels: &[Rela],
    display_name: &dyn Fn() -> String,
) -> Result<(Vec<CieRecord>, Vec<FdeRecord>)> {
    // Relocation offsets must increase monotonically for the per-record attachment below.
    for pair in rels.windows(2) {
        if pair[1].r_offset.get(LittleEndian) <= pair[0].r_offset.get(LittleEndian) {
            bail!(
                "{}: relocation offsets must increase monotonically",
                display_name()
            );
        }
    }

    let mut cies = Vec::new();
    let mut fdes = Vec::new();
    let mut rel_idx = 0usize;
    let mut offset = 0usize;

    while offset < contents.len() {
        if contents.len() - offset < 4 {
            bail!("{}: garbage at end of section", display_name());
        }
        let size = read_u32(&contents[offset..]);
        if size == 0 {
            // Zero-length terminator; optional if the bytes end cleanly.
            if contents.len() - offset != 4 {
                bail!("{}: garbage at end of section", display_name());
            }
            break;
        }

        let begin_offset = offset;
        let end_offset = offset + size as usize + 4;
        if end_offset > contents.len() {
            bail!("{}: truncated record", display_name());
        }
        let id = read_u32(&contents[offset + 4..]);
        offset = end_offset;

        let rel_begin = rel_idx;
        while rel_idx < rels.len()
            && (rels[rel_idx].r_offset.get(LittleEndian) as usize) < end_offset
        {
            rel_idx += 1;
        }

        if id == 0 {
            cies.push(CieRecord {
                input_offset: begin_offset as u32,
                rel_begin: rel_begin as u32,
                rel_end: rel_idx as u32,
                output_offset: u32::MAX,
                is_leader: false,
            });
        } else {
            if rel_begin == rel_idx {
                // An FDE with no relocation is dead from birth; `ld -r` likes to produce them.
                continue;
            }
            let first_rel_offset = rels[rel_begin].r_offset.get(LittleEndian);
            if first_rel_offset as usize - begin_offset != 8 {
                bail!(
                    "{}: FDE's first relocation should have offset 8",
                    display_name()
                );
            }

            // The CIE pointer field holds the distance from itself back to its CIE.
            let cie_offset = read_u32(&contents[begin_offset + 4..]) as i64;
            let cie_input_offset = (begin_offset as i64 + 4 - cie_offset) as u32;
            let Some(cie_idx) = cies
                .iter()
                .position(|cie| cie.input_offset == cie_input_offset)
            else {
                bail!("{}: bad FDE pointer", display_name());
            };

            fdes.push(FdeRecord {
                input_offset: begin_offset as u32,
                rel_begin: rel_begin as u32,
                rel_end: rel_idx as u32,
                cie_idx: cie_idx as u32,
                output_offset: u32::MAX,
            });
        }
    }

    Ok((cies, fdes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::U64;

    fn rela(offset: u64, r_type: u32, sym: u32, addend: i64) -> Rela {
        Rela {
            r_offset: U64::new(LittleEndian, offset),
            r_info: U64::new(
                LittleEndian,
                (u64::from(sym) << 32) | u64::from(r_type),
            ),
            r_addend: object::I64::new(LittleEndian, addend),
        }
    }

    fn record(id: u32, payload_len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((payload_len as u32 + 4).to_le_bytes()));
        out.extend_from_slice(&id.to_le_bytes());
        out.extend(std::iter::repeat_n(0u8, payload_len));
        out
    }

    #[test]
    fn test_split_cie_and_fdes() {
        // CIE at 0 (len 4+4+12=20), FDE at 20 pointing back to it, terminator.
        let mut contents = record(0, 12);
        let cie_len = contents.len();
        let mut fde = record((cie_len + 4) as u32, 12);
        contents.append(&mut fde);
        contents.extend_from_slice(&0u32.to_le_bytes());

        let rels = [rela(cie_len as u64 + 8, 2, 1, 0)];
        let (cies, fdes) =
            read_records(&contents, &rels, &|| "test".to_owned()).unwrap();
        assert_eq!(cies.len(), 1);
        assert_eq!(fdes.len(), 1);
        assert_eq!(fdes[0].cie_idx, 0);
        assert_eq!(fdes[0].input_offset as usize, cie_len);
        assert_eq!(fdes[0].rel_begin, 0);
        assert_eq!(fdes[0].rel_end, 1);
    }

    #[test]
    fn test_fde_without_relocations_is_skipped() {
        let mut contents = record(0, 12);
        let cie_len = contents.len();
        contents.append(&mut record((cie_len + 4) as u32, 12));

        let (cies, fdes) = read_records(&contents, &[], &|| "test".to_owned()).unwrap();
        assert_eq!(cies.len(), 1);
        assert!(fdes.is_empty());
    }

    #[test]
    fn test_fde_first_reloc_must_be_at_offset_8() {
        let mut contents = record(0, 12);
        let cie_len = contents.len();
        contents.append(&mut record((cie_len + 4) as u32, 12));

        let rels = [rela(cie_len as u64 + 12, 2, 1, 0)];
        assert!(read_records(&contents, &rels, &|| "test".to_owned()).is_err());
    }

    #[test]
    fn test_monotonic_relocation_offsets_enforced() {
        let mut contents = record(0, 28);
        contents.extend_from_slice(&0u32.to_le_bytes());
        let rels = [rela(16, 2, 1, 0), rela(8, 2, 1, 0)];
        assert!(read_records(&contents, &rels, &|| "test".to_owned()).is_err());
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut contents = record(0, 12);
        contents.extend_from_slice(&[0, 0, 0]);
        assert!(read_records(&contents, &[], &|| "test".to_owned()).is_err());
    }
}
