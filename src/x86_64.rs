//! x86-64 relocation table and PLT templates.

use crate::arch::ApplyArgs;
use crate::arch::Arch;
use crate::arch::ScanKind;
use crate::arch::write_i32_checked;
use crate::arch::write_u32_checked;
use crate::arch::write_u64;
use crate::error::Result;
use anyhow::bail;
use object::elf::*;

pub(crate) struct X86_64;

const PLT_HEADER: &[u8] = &[
    0xff, 0x35, 0, 0, 0, 0, // push GOTPLT+8(%rip)
    0xff, 0x25, 0, 0, 0, 0, // jmp *GOTPLT+16(%rip)
    0x0f, 0x1f, 0x40, 0x00, // nop
];

const PLT_ENTRY: &[u8] = &[
    0xff, 0x25, 0, 0, 0, 0, // jmp *GOTPLT_SLOT(%rip)
    0x68, 0, 0, 0, 0, // push $index
    0xe9, 0, 0, 0, 0, // jmp plt[0]
];

const PLT_GOT_ENTRY: &[u8] = &[
    0xff, 0x25, 0, 0, 0, 0, // jmp *GOT_SLOT(%rip)
    0x66, 0x90, // nop
    0x0f, 0x1f, 0x44, 0x00, 0x00, // nopl 0x0(%rax,%rax,1)
    0x66, 0x90, // nop
];

const _ASSERTS: () = {
    assert!(PLT_HEADER.len() == 16);
    assert!(PLT_ENTRY.len() == 16);
    assert!(PLT_GOT_ENTRY.len() == 16);
};

impl Arch for X86_64 {
    fn machine_id(&self) -> u16 {
        EM_X86_64
    }

    fn scan_kind(&self, r_type: u32) -> Result<ScanKind> {
        Ok(match r_type {
            R_X86_64_NONE => ScanKind::None,
            R_X86_64_64 => ScanKind::Abs { size: 8 },
            R_X86_64_32 | R_X86_64_32S => ScanKind::Abs { size: 4 },
            R_X86_64_16 => ScanKind::Abs { size: 2 },
            R_X86_64_8 => ScanKind::Abs { size: 1 },
            R_X86_64_PC64 | R_X86_64_PC32 | R_X86_64_PC16 | R_X86_64_PC8 => ScanKind::Pcrel,
            R_X86_64_PLT32 => ScanKind::Call,
            R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX
            | R_X86_64_GOTPCREL64 => ScanKind::Got,
            R_X86_64_GOTTPOFF => ScanKind::GotTp,
            R_X86_64_TLSGD => ScanKind::TlsGd,
            R_X86_64_TLSLD => ScanKind::TlsLd,
            R_X86_64_GOTPC32_TLSDESC => ScanKind::TlsDesc,
            R_X86_64_TLSDESC_CALL => ScanKind::None,
            R_X86_64_TPOFF32 | R_X86_64_TPOFF64 => ScanKind::TpOff,
            R_X86_64_DTPOFF32 | R_X86_64_DTPOFF64 => ScanKind::DtpOff,
            R_X86_64_GOTPC32 => ScanKind::None, // _GLOBAL_OFFSET_TABLE_ + A - P, no tables needed
            _ => bail!("unsupported relocation {}", self.rel_type_name(r_type)),
        })
    }

    fn apply_reloc(&self, r_type: u32, args: ApplyArgs) -> Result {
        let ApplyArgs {
            loc,
            s,
            s_plt,
            a,
            p,
            got_slot,
            gottp_slot,
            tlsgd_slot,
            tlsld_slot,
            tlsdesc_slot,
            got_base,
            tp,
            dtp,
        } = args;

        match r_type {
            R_X86_64_NONE | R_X86_64_TLSDESC_CALL => {}
            R_X86_64_64 => write_u64(loc, s.wrapping_add_signed(a)),
            R_X86_64_32 => write_u32_checked(loc, s.wrapping_add_signed(a) as i64, self, r_type)?,
            R_X86_64_32S => write_i32_checked(loc, s.wrapping_add_signed(a) as i64, self, r_type)?,
            R_X86_64_16 => {
                let value = s.wrapping_add_signed(a);
                if value > u64::from(u16::MAX) {
                    bail!("relocation R_X86_64_16 overflow");
                }
                loc[..2].copy_from_slice(&(value as u16).to_le_bytes());
            }
            R_X86_64_8 => {
                let value = s.wrapping_add_signed(a);
                if value > u64::from(u8::MAX) {
                    bail!("relocation R_X86_64_8 overflow");
                }
                loc[0] = value as u8;
            }
            R_X86_64_PC64 => write_u64(loc, s.wrapping_add_signed(a).wrapping_sub(p)),
            R_X86_64_PC32 => {
                write_i32_checked(loc, s.wrapping_add_signed(a).wrapping_sub(p) as i64, self, r_type)?;
            }
            R_X86_64_PC16 => {
                let value = s.wrapping_add_signed(a).wrapping_sub(p) as i64;
                loc[..2].copy_from_slice(&(value as i16).to_le_bytes());
            }
            R_X86_64_PC8 => {
                loc[0] = (s.wrapping_add_signed(a).wrapping_sub(p) as i64) as u8;
            }
            R_X86_64_PLT32 => {
                write_i32_checked(loc, s_plt.wrapping_add_signed(a).wrapping_sub(p) as i64, self, r_type)?;
            }
            R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX => {
                write_i32_checked(loc, got_slot.wrapping_add_signed(a).wrapping_sub(p) as i64, self, r_type)?;
            }
            R_X86_64_GOTPCREL64 => {
                write_u64(loc, got_slot.wrapping_add_signed(a).wrapping_sub(p));
            }
            R_X86_64_GOTPC32 => {
                write_i32_checked(loc, got_base.wrapping_add_signed(a).wrapping_sub(p) as i64, self, r_type)?;
            }
            R_X86_64_GOTTPOFF => {
                write_i32_checked(loc, gottp_slot.wrapping_add_signed(a).wrapping_sub(p) as i64, self, r_type)?;
            }
            R_X86_64_TLSGD => {
                write_i32_checked(loc, tlsgd_slot.wrapping_add_signed(a).wrapping_sub(p) as i64, self, r_type)?;
            }
            R_X86_64_TLSLD => {
                write_i32_checked(loc, tlsld_slot.wrapping_add_signed(a).wrapping_sub(p) as i64, self, r_type)?;
            }
            R_X86_64_GOTPC32_TLSDESC => {
                write_i32_checked(loc, tlsdesc_slot.wrapping_add_signed(a).wrapping_sub(p) as i64, self, r_type)?;
            }
            R_X86_64_TPOFF32 => {
                write_i32_checked(loc, s.wrapping_add_signed(a).wrapping_sub(tp) as i64, self, r_type)?;
            }
            R_X86_64_TPOFF64 => write_u64(loc, s.wrapping_add_signed(a).wrapping_sub(tp)),
            R_X86_64_DTPOFF32 => {
                write_i32_checked(loc, s.wrapping_add_signed(a).wrapping_sub(dtp) as i64, self, r_type)?;
            }
            R_X86_64_DTPOFF64 => write_u64(loc, s.wrapping_add_signed(a).wrapping_sub(dtp)),
            _ => bail!("unsupported relocation {}", self.rel_type_name(r_type)),
        }
        Ok(())
    }

    fn rel_type_name(&self, r_type: u32) -> String {
        let name = match r_type {
            R_X86_64_NONE => "R_X86_64_NONE",
            R_X86_64_64 => "R_X86_64_64",
            R_X86_64_32 => "R_X86_64_32",
            R_X86_64_32S => "R_X86_64_32S",
            R_X86_64_16 => "R_X86_64_16",
            R_X86_64_8 => "R_X86_64_8",
            R_X86_64_PC64 => "R_X86_64_PC64",
            R_X86_64_PC32 => "R_X86_64_PC32",
            R_X86_64_PC16 => "R_X86_64_PC16",
            R_X86_64_PC8 => "R_X86_64_PC8",
            R_X86_64_PLT32 => "R_X86_64_PLT32",
            R_X86_64_GOTPCREL => "R_X86_64_GOTPCREL",
            R_X86_64_GOTPCRELX => "R_X86_64_GOTPCRELX",
            R_X86_64_REX_GOTPCRELX => "R_X86_64_REX_GOTPCRELX",
            R_X86_64_GOTPCREL64 => "R_X86_64_GOTPCREL64",
            R_X86_64_GOTPC32 => "R_X86_64_GOTPC32",
            R_X86_64_GOTTPOFF => "R_X86_64_GOTTPOFF",
            R_X86_64_TLSGD => "R_X86_64_TLSGD",
            R_X86_64_TLSLD => "R_X86_64_TLSLD",
            R_X86_64_GOTPC32_TLSDESC => "R_X86_64_GOTPC32_TLSDESC",
            R_X86_64_TLSDESC_CALL => "R_X86_64_TLSDESC_CALL",
            R_X86_64_TPOFF32 => "R_X86_64_TPOFF32",
            R_X86_64_TPOFF64 => "R_X86_64_TPOFF64",
            R_X86_64_DTPOFF32 => "R_X86_64_DTPOFF32",
            R_X86_64_DTPOFF64 => "R_X86_64_DTPOFF64",
            _ => return format!("R_X86_64_UNKNOWN({r_type})"),
        };
        name.to_owned()
    }

    fn r_none(&self) -> u32 {
        R_X86_64_NONE
    }
    fn r_abs64(&self) -> u32 {
        R_X86_64_64
    }
    fn r_relative(&self) -> u32 {
        R_X86_64_RELATIVE
    }
    fn r_glob_dat(&self) -> u32 {
        R_X86_64_GLOB_DAT
    }
    fn r_jump_slot(&self) -> u32 {
        R_X86_64_JUMP_SLOT
    }
    fn r_copy(&self) -> u32 {
        R_X86_64_COPY
    }
    fn r_irelative(&self) -> u32 {
        R_X86_64_IRELATIVE
    }
    fn r_dtpmod(&self) -> u32 {
        R_X86_64_DTPMOD64
    }
    fn r_dtpoff(&self) -> u32 {
        R_X86_64_DTPOFF64
    }
    fn r_tpoff(&self) -> u32 {
        R_X86_64_TPOFF64
    }
    fn r_tlsdesc(&self) -> u32 {
        R_X86_64_TLSDESC
    }

    fn plt_header_size(&self) -> u64 {
        PLT_HEADER.len() as u64
    }

    fn plt_entry_size(&self) -> u64 {
        PLT_ENTRY.len() as u64
    }

    fn write_plt_header(&self, out: &mut [u8], gotplt_addr: u64, plt_addr: u64) {
        out[..PLT_HEADER.len()].copy_from_slice(PLT_HEADER);
        let push = (gotplt_addr + 8).wrapping_sub(plt_addr + 6) as i32;
        let jmp = (gotplt_addr + 16).wrapping_sub(plt_addr + 12) as i32;
        out[2..6].copy_from_slice(&push.to_le_bytes());
        out[8..12].copy_from_slice(&jmp.to_le_bytes());
    }

    fn write_plt_entry(&self, out: &mut [u8], gotplt_slot_addr: u64, plt_entry_addr: u64, idx: u32) {
        out[..PLT_ENTRY.len()].copy_from_slice(PLT_ENTRY);
        let jmp = gotplt_slot_addr.wrapping_sub(plt_entry_addr + 6) as i32;
        out[2..6].copy_from_slice(&jmp.to_le_bytes());
        out[7..11].copy_from_slice(&idx.to_le_bytes());
        // Distance back to plt[0]. The entry sits at header + idx entries from plt[0], and the
        // jump is relative to the end of this entry.
        let back = -((idx as i64 + 2) * PLT_ENTRY.len() as i64) as i32;
        out[12..16].copy_from_slice(&back.to_le_bytes());
    }

    fn write_pltgot_entry(&self, out: &mut [u8], got_slot_addr: u64, plt_entry_addr: u64) {
        out[..PLT_GOT_ENTRY.len()].copy_from_slice(PLT_GOT_ENTRY);
        let jmp = got_slot_addr.wrapping_sub(plt_entry_addr + 6) as i32;
        out[2..6].copy_from_slice(&jmp.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(r_type: u32, s: u64, a: i64, p: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 8];
        X86_64
            .apply_reloc(
                r_type,
                ApplyArgs {
                    loc: &mut buf,
                    s,
                    s_plt: s,
                    a,
                    p,
                    got_slot: 0,
                    gottp_slot: 0,
                    tlsgd_slot: 0,
                    tlsld_slot: 0,
                    tlsdesc_slot: 0,
                    got_base: 0,
                    tp: 0,
                    dtp: 0,
                },
            )
            .unwrap();
        buf
    }

    #[test]
    fn test_abs64() {
        let buf = apply(R_X86_64_64, 0x1000, 8, 0);
        assert_eq!(u64::from_le_bytes(buf[..8].try_into().unwrap()), 0x1008);
    }

    #[test]
    fn test_pc32() {
        let buf = apply(R_X86_64_PC32, 0x2000, -4, 0x1000);
        assert_eq!(i32::from_le_bytes(buf[..4].try_into().unwrap()), 0xffc);
    }

    #[test]
    fn test_pc32_overflow_detected() {
        let mut buf = vec![0u8; 8];
        let result = X86_64.apply_reloc(
            R_X86_64_PC32,
            ApplyArgs {
                loc: &mut buf,
                s: 0x1_0000_0000,
                s_plt: 0x1_0000_0000,
                a: 0,
                p: 0,
                got_slot: 0,
                gottp_slot: 0,
                tlsgd_slot: 0,
                tlsld_slot: 0,
                tlsdesc_slot: 0,
                got_base: 0,
                tp: 0,
                dtp: 0,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_plt_entry_round_trips_back_to_header() {
        let mut out = vec![0u8; 16];
        // Entry 2 lives at plt+0x30; its tail jump must land on plt+0.
        let plt_base = 0x401000u64;
        let entry_addr = plt_base + 16 * 3;
        X86_64.write_plt_entry(&mut out, 0x404018, entry_addr, 2);
        let back = i32::from_le_bytes(out[12..16].try_into().unwrap()) as i64;
        // The jump is relative to the end of the 16-byte entry.
        assert_eq!(entry_addr as i64 + 16 + back, plt_base as i64);
    }
}
