//! AArch64 relocation table and PLT templates. Unlike x86-64, most relocations here patch bit
//! fields inside instructions rather than whole bytes.

use crate::arch::ApplyArgs;
use crate::arch::Arch;
use crate::arch::ScanKind;
use crate::arch::write_u64;
use crate::error::Result;
use anyhow::bail;
use object::elf::*;

pub(crate) struct AArch64;

const PLT_HEADER_SIZE: u64 = 32;
const PLT_ENTRY_SIZE: u64 = 16;

fn page(addr: u64) -> u64 {
    addr & !0xfff
}

fn read_insn(loc: &[u8]) -> u32 {
    u32::from_le_bytes(loc[..4].try_into().unwrap())
}

fn write_insn(loc: &mut [u8], insn: u32) {
    loc[..4].copy_from_slice(&insn.to_le_bytes());
}

/// Patches the 21-bit immediate of an ADRP/ADR instruction.
fn write_adr_imm(loc: &mut [u8], value: u64) {
    let insn = read_insn(loc);
    let immlo = ((value & 0b11) as u32) << 29;
    let immhi = (((value >> 2) & 0x7ffff) as u32) << 5;
    write_insn(loc, (insn & 0x9f00_001f) | immlo | immhi);
}

/// Patches the 12-bit immediate of an ADD/LDR/STR instruction.
fn write_imm12(loc: &mut [u8], value: u64) {
    let insn = read_insn(loc);
    write_insn(loc, (insn & !(0xfff << 10)) | (((value & 0xfff) as u32) << 10));
}

fn write_branch26(loc: &mut [u8], value: i64) -> Result {
    if !(-(1 << 27)..1 << 27).contains(&value) {
        bail!("branch target out of range");
    }
    let insn = read_insn(loc);
    write_insn(loc, (insn & 0xfc00_0000) | (((value >> 2) as u32) & 0x03ff_ffff));
    Ok(())
}

fn write_i32(loc: &mut [u8], value: i64) -> Result {
    let Ok(value) = i32::try_from(value) else {
        bail!("relocation value 0x{value:x} does not fit in 32 bits");
    };
    loc[..4].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Scaled LO12 immediate for load/store relocations: the immediate is in units of the access
/// size encoded in the relocation type.
fn ldst_scale(r_type: u32) -> u64 {
    match r_type {
        R_AARCH64_LDST16_ABS_LO12_NC => 1,
        R_AARCH64_LDST32_ABS_LO12_NC => 2,
        R_AARCH64_LDST64_ABS_LO12_NC | R_AARCH64_LD64_GOT_LO12_NC
        | R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC | R_AARCH64_TLSDESC_LD64_LO12 => 3,
        R_AARCH64_LDST128_ABS_LO12_NC => 4,
        _ => 0,
    }
}

impl Arch for AArch64 {
    fn machine_id(&self) -> u16 {
        EM_AARCH64
    }

    fn scan_kind(&self, r_type: u32) -> Result<ScanKind> {
        Ok(match r_type {
            R_AARCH64_NONE => ScanKind::None,
            R_AARCH64_ABS64 => ScanKind::Abs { size: 8 },
            R_AARCH64_ABS32 => ScanKind::Abs { size: 4 },
            R_AARCH64_ABS16 => ScanKind::Abs { size: 2 },
            R_AARCH64_PREL64 | R_AARCH64_PREL32 | R_AARCH64_PREL16 => ScanKind::Pcrel,
            R_AARCH64_CALL26 | R_AARCH64_JUMP26 => ScanKind::Call,
            R_AARCH64_ADR_PREL_PG_HI21 | R_AARCH64_ADR_PREL_LO21 | R_AARCH64_ADD_ABS_LO12_NC
            | R_AARCH64_LDST8_ABS_LO12_NC | R_AARCH64_LDST16_ABS_LO12_NC
            | R_AARCH64_LDST32_ABS_LO12_NC | R_AARCH64_LDST64_ABS_LO12_NC
            | R_AARCH64_LDST128_ABS_LO12_NC => ScanKind::Pcrel,
            R_AARCH64_ADR_GOT_PAGE | R_AARCH64_LD64_GOT_LO12_NC => ScanKind::Got,
            R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 | R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => {
                ScanKind::GotTp
            }
            R_AARCH64_TLSLE_ADD_TPREL_HI12 | R_AARCH64_TLSLE_ADD_TPREL_LO12
            | R_AARCH64_TLSLE_ADD_TPREL_LO12_NC => ScanKind::TpOff,
            R_AARCH64_TLSDESC_ADR_PAGE21 | R_AARCH64_TLSDESC_LD64_LO12
            | R_AARCH64_TLSDESC_ADD_LO12 => ScanKind::TlsDesc,
            R_AARCH64_TLSDESC_CALL => ScanKind::None,
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
            tlsdesc_slot,
            tp,
            ..
        } = args;

        let sa = s.wrapping_add_signed(a);
        match r_type {
            R_AARCH64_NONE | R_AARCH64_TLSDESC_CALL => {}
            R_AARCH64_ABS64 => write_u64(loc, sa),
            R_AARCH64_ABS32 => write_i32(loc, sa as i64)?,
            R_AARCH64_ABS16 => loc[..2].copy_from_slice(&(sa as u16).to_le_bytes()),
            R_AARCH64_PREL64 => write_u64(loc, sa.wrapping_sub(p)),
            R_AARCH64_PREL32 => write_i32(loc, sa.wrapping_sub(p) as i64)?,
            R_AARCH64_PREL16 => {
                loc[..2].copy_from_slice(&((sa.wrapping_sub(p)) as u16).to_le_bytes());
            }
            R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
                write_branch26(loc, s_plt.wrapping_add_signed(a).wrapping_sub(p) as i64)?;
            }
            R_AARCH64_ADR_PREL_PG_HI21 => {
                write_adr_imm(loc, page(sa).wrapping_sub(page(p)) >> 12);
            }
            R_AARCH64_ADR_PREL_LO21 => write_adr_imm(loc, sa.wrapping_sub(p)),
            R_AARCH64_ADD_ABS_LO12_NC | R_AARCH64_LDST8_ABS_LO12_NC => {
                write_imm12(loc, sa);
            }
            R_AARCH64_LDST16_ABS_LO12_NC | R_AARCH64_LDST32_ABS_LO12_NC
            | R_AARCH64_LDST64_ABS_LO12_NC | R_AARCH64_LDST128_ABS_LO12_NC => {
                write_imm12(loc, (sa & 0xfff) >> ldst_scale(r_type));
            }
            R_AARCH64_ADR_GOT_PAGE => {
                write_adr_imm(loc, page(got_slot.wrapping_add_signed(a)).wrapping_sub(page(p)) >> 12);
            }
            R_AARCH64_LD64_GOT_LO12_NC => {
                write_imm12(loc, (got_slot.wrapping_add_signed(a) & 0xfff) >> ldst_scale(r_type));
            }
            R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 => {
                write_adr_imm(loc, page(gottp_slot.wrapping_add_signed(a)).wrapping_sub(page(p)) >> 12);
            }
            R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => {
                write_imm12(loc, (gottp_slot.wrapping_add_signed(a) & 0xfff) >> ldst_scale(r_type));
            }
            R_AARCH64_TLSLE_ADD_TPREL_HI12 => {
                write_imm12(loc, sa.wrapping_sub(tp) >> 12);
            }
            R_AARCH64_TLSLE_ADD_TPREL_LO12 | R_AARCH64_TLSLE_ADD_TPREL_LO12_NC => {
                write_imm12(loc, sa.wrapping_sub(tp));
            }
            R_AARCH64_TLSDESC_ADR_PAGE21 => {
                write_adr_imm(loc, page(tlsdesc_slot.wrapping_add_signed(a)).wrapping_sub(page(p)) >> 12);
            }
            R_AARCH64_TLSDESC_LD64_LO12 => {
                write_imm12(loc, (tlsdesc_slot.wrapping_add_signed(a) & 0xfff) >> ldst_scale(r_type));
            }
            R_AARCH64_TLSDESC_ADD_LO12 => {
                write_imm12(loc, tlsdesc_slot.wrapping_add_signed(a));
            }
            _ => bail!("unsupported relocation {}", self.rel_type_name(r_type)),
        }
        Ok(())
    }

    fn rel_type_name(&self, r_type: u32) -> String {
        let name = match r_type {
            R_AARCH64_NONE => "R_AARCH64_NONE",
            R_AARCH64_ABS64 => "R_AARCH64_ABS64",
            R_AARCH64_ABS32 => "R_AARCH64_ABS32",
            R_AARCH64_ABS16 => "R_AARCH64_ABS16",
            R_AARCH64_PREL64 => "R_AARCH64_PREL64",
            R_AARCH64_PREL32 => "R_AARCH64_PREL32",
            R_AARCH64_PREL16 => "R_AARCH64_PREL16",
            R_AARCH64_CALL26 => "R_AARCH64_CALL26",
            R_AARCH64_JUMP26 => "R_AARCH64_JUMP26",
            R_AARCH64_ADR_PREL_PG_HI21 => "R_AARCH64_ADR_PREL_PG_HI21",
            R_AARCH64_ADR_PREL_LO21 => "R_AARCH64_ADR_PREL_LO21",
            R_AARCH64_ADD_ABS_LO12_NC => "R_AARCH64_ADD_ABS_LO12_NC",
            R_AARCH64_LDST8_ABS_LO12_NC => "R_AARCH64_LDST8_ABS_LO12_NC",
            R_AARCH64_LDST16_ABS_LO12_NC => "R_AARCH64_LDST16_ABS_LO12_NC",
            R_AARCH64_LDST32_ABS_LO12_NC => "R_AARCH64_LDST32_ABS_LO12_NC",
            R_AARCH64_LDST64_ABS_LO12_NC => "R_AARCH64_LDST64_ABS_LO12_NC",
            R_AARCH64_LDST128_ABS_LO12_NC => "R_AARCH64_LDST128_ABS_LO12_NC",
            R_AARCH64_ADR_GOT_PAGE => "R_AARCH64_ADR_GOT_PAGE",
            R_AARCH64_LD64_GOT_LO12_NC => "R_AARCH64_LD64_GOT_LO12_NC",
            R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 => "R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21",
            R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => "R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC",
            R_AARCH64_TLSLE_ADD_TPREL_HI12 => "R_AARCH64_TLSLE_ADD_TPREL_HI12",
            R_AARCH64_TLSLE_ADD_TPREL_LO12 => "R_AARCH64_TLSLE_ADD_TPREL_LO12",
            R_AARCH64_TLSLE_ADD_TPREL_LO12_NC => "R_AARCH64_TLSLE_ADD_TPREL_LO12_NC",
            R_AARCH64_TLSDESC_ADR_PAGE21 => "R_AARCH64_TLSDESC_ADR_PAGE21",
            R_AARCH64_TLSDESC_LD64_LO12 => "R_AARCH64_TLSDESC_LD64_LO12",
            R_AARCH64_TLSDESC_ADD_LO12 => "R_AARCH64_TLSDESC_ADD_LO12",
            R_AARCH64_TLSDESC_CALL => "R_AARCH64_TLSDESC_CALL",
            _ => return format!("R_AARCH64_UNKNOWN({r_type})"),
        };
        name.to_owned()
    }

    fn r_none(&self) -> u32 {
        R_AARCH64_NONE
    }
    fn r_abs64(&self) -> u32 {
        R_AARCH64_ABS64
    }
    fn r_relative(&self) -> u32 {
        R_AARCH64_RELATIVE
    }
    fn r_glob_dat(&self) -> u32 {
        R_AARCH64_GLOB_DAT
    }
    fn r_jump_slot(&self) -> u32 {
        R_AARCH64_JUMP_SLOT
    }
    fn r_copy(&self) -> u32 {
        R_AARCH64_COPY
    }
    fn r_irelative(&self) -> u32 {
        R_AARCH64_IRELATIVE
    }
    fn r_dtpmod(&self) -> u32 {
        R_AARCH64_TLS_DTPMOD
    }
    fn r_dtpoff(&self) -> u32 {
        R_AARCH64_TLS_DTPREL
    }
    fn r_tpoff(&self) -> u32 {
        R_AARCH64_TLS_TPREL
    }
    fn r_tlsdesc(&self) -> u32 {
        R_AARCH64_TLSDESC
    }

    fn plt_header_size(&self) -> u64 {
        PLT_HEADER_SIZE
    }

    fn plt_entry_size(&self) -> u64 {
        PLT_ENTRY_SIZE
    }

    fn write_plt_header(&self, out: &mut [u8], gotplt_addr: u64, plt_addr: u64) {
        // stp x16, x30, [sp,#-16]!
        // adrp x16, GOTPLT+16
        // ldr x17, [x16, GOTPLT+16 :lo12:]
        // add x16, x16, GOTPLT+16 :lo12:
        // br x17
        // nop; nop; nop
        let insns: [u32; 8] = [
            0xa9bf_7bf0,
            0x9000_0010,
            0xf940_0211,
            0x9100_0210,
            0xd61f_0220,
            0xd503_201f,
            0xd503_201f,
            0xd503_201f,
        ];
        for (i, insn) in insns.iter().enumerate() {
            write_insn(&mut out[i * 4..], *insn);
        }
        let slot = gotplt_addr + 16;
        write_adr_imm(&mut out[4..], page(slot).wrapping_sub(page(plt_addr + 4)) >> 12);
        write_imm12(&mut out[8..], (slot & 0xfff) >> 3);
        write_imm12(&mut out[12..], slot & 0xfff);
    }

    fn write_plt_entry(&self, out: &mut [u8], gotplt_slot_addr: u64, plt_entry_addr: u64, _idx: u32) {
        // adrp x16, SLOT
        // ldr x17, [x16, SLOT :lo12:]
        // add x16, x16, SLOT :lo12:
        // br x17
        let insns: [u32; 4] = [0x9000_0010, 0xf940_0211, 0x9100_0210, 0xd61f_0220];
        for (i, insn) in insns.iter().enumerate() {
            write_insn(&mut out[i * 4..], *insn);
        }
        write_adr_imm(
            &mut out[0..],
            page(gotplt_slot_addr).wrapping_sub(page(plt_entry_addr)) >> 12,
        );
        write_imm12(&mut out[4..], (gotplt_slot_addr & 0xfff) >> 3);
        write_imm12(&mut out[8..], gotplt_slot_addr & 0xfff);
    }

    fn write_pltgot_entry(&self, out: &mut [u8], got_slot_addr: u64, plt_entry_addr: u64) {
        self.write_plt_entry(out, got_slot_addr, plt_entry_addr, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adr_imm_encoding() {
        // adrp x0, 0 is 0x90000000; patching the 21-bit immediate with 1 sets immlo bits.
        let mut loc = 0x9000_0000u32.to_le_bytes().to_vec();
        write_adr_imm(&mut loc, 1);
        assert_eq!(read_insn(&loc), 0x9000_0000 | (1 << 29));
        let mut loc = 0x9000_0000u32.to_le_bytes().to_vec();
        write_adr_imm(&mut loc, 4);
        assert_eq!(read_insn(&loc), 0x9000_0000 | (1 << 5));
    }

    #[test]
    fn test_branch26_range() {
        let mut loc = 0x9400_0000u32.to_le_bytes().to_vec(); // bl 0
        write_branch26(&mut loc, 8).unwrap();
        assert_eq!(read_insn(&loc), 0x9400_0002);
        assert!(write_branch26(&mut loc, 1 << 30).is_err());
    }

    #[test]
    fn test_abs64() {
        let mut buf = vec![0u8; 8];
        AArch64
            .apply_reloc(
                R_AARCH64_ABS64,
                ApplyArgs {
                    loc: &mut buf,
                    s: 0x1234,
                    s_plt: 0x1234,
                    a: 4,
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
            )
            .unwrap();
        assert_eq!(u64::from_le_bytes(buf[..8].try_into().unwrap()), 0x1238);
    }
}
