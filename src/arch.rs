//! The single site of architecture polymorphism. Everything machine-specific hangs off the
//! `Arch` trait: how a relocation type is classified for the scanner, the exact formula applied
//! when the bytes are written, and the PLT entry templates.

use crate::error::Result;
use anyhow::bail;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Machine {
    X86_64,
    AArch64,
}

impl Machine {
    pub(crate) fn from_e_machine(e_machine: u16) -> Result<Machine> {
        match e_machine {
            object::elf::EM_X86_64 => Ok(Machine::X86_64),
            object::elf::EM_AARCH64 => Ok(Machine::AArch64),
            other => bail!("unsupported machine type 0x{other:x}"),
        }
    }

    pub(crate) fn arch(self) -> &'static dyn Arch {
        match self {
            Machine::X86_64 => &crate::x86_64::X86_64,
            Machine::AArch64 => &crate::aarch64::AArch64,
        }
    }
}

impl std::fmt::Display for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Machine::X86_64 => write!(f, "x86_64"),
            Machine::AArch64 => write!(f, "aarch64"),
        }
    }
}

/// Semantic class of a relocation, as needed by the scanner to decide which tables the target
/// symbol must end up in. The writer re-dispatches on the raw type for the exact bit layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanKind {
    None,
    /// Absolute address of `size` bytes. 8-byte absolutes can become base/dynamic relocations;
    /// smaller ones can't be represented at run time.
    Abs { size: u8 },
    /// PC-relative reference to the symbol itself.
    Pcrel,
    /// Call/jump that may be diverted through the PLT if the target is imported.
    Call,
    /// Reference to the symbol's GOT slot.
    Got,
    /// Reference to the symbol's GOT slot holding its TP-relative offset (initial-exec TLS).
    GotTp,
    /// General-dynamic TLS sequence.
    TlsGd,
    /// Local-dynamic TLS sequence.
    TlsLd,
    /// TLS descriptor sequence.
    TlsDesc,
    /// TP-relative offset written directly (local-exec TLS).
    TpOff,
    /// DTP-relative offset.
    DtpOff,
}

/// All the addresses the per-type formulas might need, precomputed by the writer.
pub(crate) struct ApplyArgs<'a> {
    /// Slice starting at the relocated location; at least the relocation's width long.
    pub(crate) loc: &'a mut [u8],
    /// Resolved symbol address.
    pub(crate) s: u64,
    /// Symbol address for call-type relocations: the PLT entry if one exists, else `s`.
    pub(crate) s_plt: u64,
    pub(crate) a: i64,
    /// Address of the relocated location in the output image.
    pub(crate) p: u64,
    pub(crate) got_slot: u64,
    pub(crate) gottp_slot: u64,
    pub(crate) tlsgd_slot: u64,
    pub(crate) tlsld_slot: u64,
    pub(crate) tlsdesc_slot: u64,
    pub(crate) got_base: u64,
    /// Thread-pointer bias: for the variant-2 ABIs this is the end of the TLS segment.
    pub(crate) tp: u64,
    pub(crate) dtp: u64,
}

pub(crate) trait Arch: Sync {
    fn machine_id(&self) -> u16;

    fn scan_kind(&self, r_type: u32) -> Result<ScanKind>;

    fn apply_reloc(&self, r_type: u32, args: ApplyArgs) -> Result;

    fn rel_type_name(&self, r_type: u32) -> String;

    /// Dynamic relocation type numbers.
    fn r_none(&self) -> u32;
    fn r_abs64(&self) -> u32;
    fn r_relative(&self) -> u32;
    fn r_glob_dat(&self) -> u32;
    fn r_jump_slot(&self) -> u32;
    fn r_copy(&self) -> u32;
    fn r_irelative(&self) -> u32;
    fn r_dtpmod(&self) -> u32;
    fn r_dtpoff(&self) -> u32;
    fn r_tpoff(&self) -> u32;
    fn r_tlsdesc(&self) -> u32;

    fn plt_header_size(&self) -> u64;
    fn plt_entry_size(&self) -> u64;
    fn write_plt_header(&self, out: &mut [u8], gotplt_addr: u64, plt_addr: u64);
    fn write_plt_entry(&self, out: &mut [u8], gotplt_slot_addr: u64, plt_entry_addr: u64, idx: u32);
    /// A .plt.got entry jumps through an already-bound regular GOT slot.
    fn write_pltgot_entry(&self, out: &mut [u8], got_slot_addr: u64, plt_entry_addr: u64);
}

pub(crate) fn write_i32_checked(loc: &mut [u8], value: i64, what: &dyn Arch, r_type: u32) -> Result {
    let Ok(value) = i32::try_from(value) else {
        bail!(
            "relocation {} overflow: value 0x{value:x} does not fit in 32 bits",
            what.rel_type_name(r_type)
        );
    };
    loc[..4].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub(crate) fn write_u32_checked(loc: &mut [u8], value: i64, what: &dyn Arch, r_type: u32) -> Result {
    let Ok(value) = u32::try_from(value) else {
        bail!(
            "relocation {} overflow: value 0x{value:x} does not fit in unsigned 32 bits",
            what.rel_type_name(r_type)
        );
    };
    loc[..4].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub(crate) fn write_u64(loc: &mut [u8], value: u64) {
    loc[..8].copy_from_slice(&value.to_le_bytes());
}
