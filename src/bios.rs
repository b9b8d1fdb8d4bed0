//! Build-time constant tables describing one exact guest BIOS build.
//!
//! The relocation offsets, the word tables and the patch list below are tied
//! to a single BIOS binary; against any other image they would silently
//! corrupt instructions. The tables therefore carry a version string and the
//! CRC-32 of the image they were derived from, and the loader refuses to
//! apply them to anything else.

use vm::trap::{TrapOp, TrapTable};

/// One instruction replacement: the word at `offset` becomes `encoding`, and
/// executing it traps into the operation described by `op`.
#[derive(Debug)]
pub struct VmPatch {
    /// Byte offset into the image. Word-aligned (an instruction boundary).
    /// Per-title cartridge patches reach megabytes in, hence the width.
    pub offset: u32,
    /// Replacement word. Only has to fault reliably; see
    /// [`is_trap_encoding`](fn.is_trap_encoding.html).
    pub encoding: u32,
    /// The privileged operation the original instruction performed.
    pub op: TrapOp,
}

/// Everything needed to stage one specific BIOS build.
#[derive(Debug)]
pub struct PatchSet {
    /// Human-readable identification of the BIOS build this set matches.
    pub version: &'static str,
    /// CRC-32 (IEEE) of the unpatched image.
    pub digest: u32,
    /// Expected image size in bytes.
    pub image_len: u32,
    /// Runs of consecutive words holding absolute addresses that need
    /// rebasing (the software-interrupt dispatch tables).
    pub word_tables: &'static [(u16, u16)],
    /// Individual word offsets holding absolute addresses.
    pub relocations: &'static [u16],
    /// Halfword stores applied verbatim (eg. defeating the image's own
    /// address-range self check, which cannot pass at the new base).
    pub halfword_fixups: &'static [(u16, u16)],
    /// The privileged-instruction replacements.
    pub patches: &'static [VmPatch],
}

impl PatchSet {
    /// Builds the trap dispatch table for an image loaded at `base`.
    pub fn trap_table(&self, base: u32) -> TrapTable {
        let mut table = TrapTable::new();
        for patch in self.patches {
            table.insert(base + patch.offset, patch.op);
        }
        table
    }

    /// Whether `offset` is rewritten by the relocation step.
    pub fn relocates(&self, offset: u32) -> bool {
        self.relocations.iter().any(|&r| r as u32 == offset)
            || self.word_tables.iter().any(|&(start, len)| {
                offset >= start as u32 && offset < start as u32 + len as u32 * 4
            })
    }
}

macro_rules! patches {
    ( $( $off:tt => $enc:tt : $op:expr, )* ) => {
        &[ $( VmPatch { offset: $off, encoding: $enc, op: $op } ),* ]
    };
}

/// The patch set for the AGB BIOS this project is built against.
pub static AGB_BIOS: PatchSet = PatchSet {
    version: "AGB BIOS (world, rev 0)",
    digest: 0x81977335,
    image_len: 16 * 1024,
    // the two software-interrupt dispatch tables: (offset, word count)
    word_tables: &[(0x01C8, 43), (0x3738, 38)],
    relocations: &[
        0x027C, 0x0AB8, 0x0ABC, 0x0AC4, 0x0ACC, 0x0ADC,
        0x0AE0, 0x0AE4, 0x0AEC, 0x0AF0, 0x0B0C, 0x0B2C,
        0x1430, 0x16F8, 0x16FC, 0x1700, 0x1788, 0x1924,
        0x1D64, 0x1D6C, 0x1D80, 0x1D84, 0x1D90, 0x1D9C,
        0x23A4, 0x2624, 0x26C0, 0x2C14, 0x30AC, 0x37D4,
        0x37D8, 0x37E0, 0x37E4, 0x381C, 0x3820, 0x3824,
        0x3828, 0x38A0, 0x38A4, 0x38A8, 0x38AC, 0x38B0,
        0x390C, 0x3910, 0x3914, 0x3918, 0x391C, 0x3920,
        0x3924, 0x3984, 0x3988, 0x398C, 0x3990, 0x3994,
        0x3998, 0x399C, 0x39C4, 0x39C8, 0x39CC,
    ],
    // the BIOS checks that it is running at its original base; make the
    // check a no-op
    halfword_fixups: &[(0x0868, 0)],
    patches: patches! {
        0x0024 => 0xE1E0_009C: TrapOp::ReadSavedStatus { rd: 12 },  // mrs r12, spsr
        0x0028 => 0xE1A0_009E: TrapOp::ReadStatus { rd: 14 },       // mrs lr, cpsr
        0x005C => 0xE1C9_009C: TrapOp::WriteSavedStatus { rs: 12 }, // msr spsr_cf, r12
        0x0064 => 0xEE64_008E: TrapOp::ExceptionReturn { subtract: 4 }, // subs pc, lr, #4
        0x007C => 0x01A0_009C: TrapOp::ReadStatus { rd: 12 },       // mrseq r12, cpsr
        0x0084 => 0x0189_009C: TrapOp::WriteStatus { rs: 12 },      // msreq cpsr_cf, r12
        0x0090 => 0xE189_0090: TrapOp::WriteStatus { rs: 0 },       // msr cpsr_cf, r0
        0x00D4 => 0xE189_0090: TrapOp::WriteStatus { rs: 0 },
        0x00E4 => 0xE189_0090: TrapOp::WriteStatus { rs: 0 },
        0x00F0 => 0xE1C9_009E: TrapOp::WriteSavedStatus { rs: 14 }, // msr spsr_cf, lr
        0x00F8 => 0xE189_0090: TrapOp::WriteStatus { rs: 0 },
        0x0104 => 0xE1C9_009E: TrapOp::WriteSavedStatus { rs: 14 },
        0x010C => 0xE189_0090: TrapOp::WriteStatus { rs: 0 },
        0x013C => 0xEE64_008E: TrapOp::ExceptionReturn { subtract: 4 },
        0x0150 => 0xE1E0_009B: TrapOp::ReadSavedStatus { rd: 11 },  // mrs r11, spsr
        0x0160 => 0xE189_009B: TrapOp::WriteStatus { rs: 11 },      // msr cpsr_cf, r11
        0x0178 => 0xE189_009C: TrapOp::WriteStatus { rs: 12 },      // msr cpsr_cf, r12
        0x0180 => 0xE1C9_009B: TrapOp::WriteSavedStatus { rs: 11 }, // msr spsr_cf, r11
        0x0188 => 0xEE64_000E: TrapOp::ExceptionReturn { subtract: 0 }, // movs pc, lr
        0x0388 => 0xE189_009C: TrapOp::WriteStatus { rs: 12 },
    },
};

/// CRC-32 (IEEE), bitwise. The pack carries no CRC crate and a table-driven
/// variant buys nothing at load-time frequencies.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// Whether `encoding` deterministically faults on the host CPU.
///
/// The replacement words come from two spaces the host faults on: the
/// encoding hole in the data-processing space (bits 7 and 4 both set, bit
/// 24 set) and operations on a coprocessor the host does not implement.
/// This is a table-sanity aid, not a decoder.
pub fn is_trap_encoding(encoding: u32) -> bool {
    let dp_hole =
        bitpat!(_ _ _ _ 0 0 0 1 _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ 1 0 0 1 _ _ _ _)(encoding);
    let absent_cp =
        bitpat!(_ _ _ _ 1 1 1 0 _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _)(encoding);
    dp_hole || absent_cp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn patch_offsets_are_instruction_boundaries() {
        for patch in AGB_BIOS.patches {
            assert_eq!(patch.offset % 4, 0, "patch at {:#06X} misaligned", patch.offset);
            assert!(patch.offset < AGB_BIOS.image_len);
        }
    }

    #[test]
    fn patch_and_relocation_offsets_are_disjoint() {
        for patch in AGB_BIOS.patches {
            assert!(
                !AGB_BIOS.relocates(patch.offset),
                "offset {:#06X} is both patched and relocated",
                patch.offset
            );
        }
    }

    #[test]
    fn no_two_patches_overlap() {
        for (i, a) in AGB_BIOS.patches.iter().enumerate() {
            for b in &AGB_BIOS.patches[i + 1..] {
                assert_ne!(a.offset, b.offset);
            }
        }
    }

    #[test]
    fn replacement_encodings_fault() {
        for patch in AGB_BIOS.patches {
            assert!(
                is_trap_encoding(patch.encoding),
                "{:#010X} at {:#06X} would not trap",
                patch.encoding,
                patch.offset
            );
        }
    }

    #[test]
    fn trap_table_is_rebased() {
        let table = AGB_BIOS.trap_table(0x0680_0000);
        assert_eq!(table.len(), AGB_BIOS.patches.len());
        assert_eq!(
            table.lookup(0x0680_0188),
            Some(TrapOp::ExceptionReturn { subtract: 0 })
        );
        assert_eq!(table.lookup(0x0188), None);
    }
}
