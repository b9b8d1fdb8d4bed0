//! Trap dispatch and emulation of the patched privileged instructions.
//!
//! Dispatch is keyed on the *faulting address*, not on the replacement
//! encoding: the encodings installed by the patcher only have to fault
//! reliably, they carry no meaning of their own. The set of addresses is
//! closed and known at build time, so an address outside the table is a
//! fatal condition, not something to decode around.

use vm::psr::Psr;
use vm::shadow::{ShadowError, ShadowRegisterFile};

use std::collections::BTreeMap;

/// Host-captured CPU snapshot delivered to the trap handler.
///
/// Created by the host's undefined-instruction exception path, consumed
/// within one trap-handling cycle. `regs[15]` is the program counter the
/// host should resume at; the handler rewrites it before returning.
#[derive(Debug)]
pub struct TrapContext {
    /// General purpose registers r0-r15 as the guest left them.
    pub regs: [u32; 16],
    /// Condition flags captured from the host status register. The flags
    /// live natively in host hardware while the guest runs, so the shadow
    /// file's copy is reconciled with these at every trap boundary.
    pub flags: Psr,
    /// Address of the instruction whose execution trapped.
    pub fault_addr: u32,
}

impl TrapContext {
    pub fn new() -> Self {
        Self {
            regs: [0; 16],
            flags: Psr::empty(),
            fault_addr: 0,
        }
    }
}

/// The privileged operation a patched instruction stood for.
///
/// This is the closed set the shipped patch tables need. It only grows when
/// a new patch address is discovered; nothing here is guessed from opcode
/// bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrapOp {
    /// `mrs rd, cpsr`
    ReadStatus { rd: u8 },
    /// `msr cpsr_cf, rs`
    WriteStatus { rs: u8 },
    /// `mrs rd, spsr` of the active mode.
    ReadSavedStatus { rd: u8 },
    /// `msr spsr_cf, rs` of the active mode.
    WriteSavedStatus { rs: u8 },
    /// `movs pc, lr` (`subtract` = 0) or `subs pc, lr, #n` (`subtract` = n):
    /// return from the active exception mode, restoring the status word from
    /// the saved copy.
    ExceptionReturn { subtract: u32 },
}

/// Map from faulting address to the operation to emulate there.
///
/// Built by the loader from the patch tables; a miss at runtime means the
/// tables do not match the image that is actually executing.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TrapTable {
    map: BTreeMap<u32, TrapOp>,
}

impl TrapTable {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Registers `op` at `addr`. Patch offsets are disjoint by invariant, so
    /// a duplicate insertion is a table bug.
    pub fn insert(&mut self, addr: u32, op: TrapOp) {
        let prev = self.map.insert(addr, op);
        debug_assert!(prev.is_none(), "duplicate trap address {:#010X}", addr);
    }

    pub fn lookup(&self, addr: u32) -> Option<TrapOp> {
        self.map.get(&addr).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn iter<'a>(&'a self) -> impl Iterator<Item = (u32, TrapOp)> + 'a {
        self.map.iter().map(|(&addr, &op)| (addr, op))
    }
}

/// Emulates `op` against the shadow file and the captured context.
///
/// Returns the address native execution resumes at. For everything except
/// `ExceptionReturn` that is the instruction after the trapped one; an
/// exception return is itself a jump and resumes at the restored program
/// counter instead.
pub fn emulate(
    op: TrapOp,
    shadow: &mut ShadowRegisterFile,
    ctx: &mut TrapContext,
) -> Result<u32, ShadowError> {
    let next = ctx.fault_addr.wrapping_add(4);
    match op {
        TrapOp::ReadStatus { rd } => {
            let merged = (shadow.cpsr() - Psr::FLAGS_FIELD) | (ctx.flags & Psr::FLAGS_FIELD);
            ctx.regs[rd as usize] = merged.bits();
            Ok(next)
        }
        TrapOp::WriteStatus { rs } => {
            let value = ctx.regs[rs as usize];
            shadow.write_current_masked(value, Psr::MSR_CF, &mut ctx.regs)?;
            ctx.flags = Psr::from_bits_truncate(value) & Psr::FLAGS_FIELD;
            Ok(next)
        }
        TrapOp::ReadSavedStatus { rd } => {
            let saved = shadow.saved_status(shadow.current_mode())?;
            ctx.regs[rd as usize] = saved.bits();
            Ok(next)
        }
        TrapOp::WriteSavedStatus { rs } => {
            let value = ctx.regs[rs as usize];
            shadow.write_saved_masked(shadow.current_mode(), value, Psr::MSR_CF)?;
            Ok(next)
        }
        TrapOp::ExceptionReturn { subtract } => {
            // Read the return target from the *exiting* mode's lr before the
            // bank switch swaps it out from under us.
            let target = ctx.regs[14].wrapping_sub(subtract);
            let saved = shadow.saved_status(shadow.current_mode())?;
            shadow.set_cpsr(saved, &mut ctx.regs)?;
            ctx.flags = saved & Psr::FLAGS_FIELD;
            Ok(target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm::psr::Mode;

    fn ctx_at(addr: u32) -> TrapContext {
        let mut ctx = TrapContext::new();
        ctx.fault_addr = addr;
        ctx
    }

    #[test]
    fn read_status_leaves_shadow_unchanged() {
        let mut shadow = ShadowRegisterFile::new();
        let before = shadow.cpsr();
        let mut ctx = ctx_at(0x24);
        ctx.flags = Psr::N | Psr::C;

        let resume = emulate(TrapOp::ReadStatus { rd: 12 }, &mut shadow, &mut ctx).unwrap();
        assert_eq!(resume, 0x28);
        assert_eq!(shadow.cpsr(), before);

        let read = Psr::from_bits_truncate(ctx.regs[12]);
        assert_eq!(read & Psr::FLAGS_FIELD, Psr::N | Psr::C);
        assert_eq!(read.mode(), Some(Mode::Supervisor));
        assert!(read.contains(Psr::I | Psr::F));
    }

    #[test]
    fn write_then_read_roundtrips_writable_fields() {
        let mut shadow = ShadowRegisterFile::new();
        let mut ctx = ctx_at(0x90);

        let value = (Psr::N | Psr::V | Psr::I).with_mode(Mode::System).bits();
        ctx.regs[0] = value;
        emulate(TrapOp::WriteStatus { rs: 0 }, &mut shadow, &mut ctx).unwrap();

        ctx.fault_addr = 0x7C;
        emulate(TrapOp::ReadStatus { rd: 1 }, &mut shadow, &mut ctx).unwrap();
        assert_eq!(ctx.regs[1], value);
    }

    #[test]
    fn write_status_ignores_reserved_bits() {
        let mut shadow = ShadowRegisterFile::new();
        let mut ctx = ctx_at(0x90);

        ctx.regs[0] = 0x00FF_FF00 | Mode::System as u32;
        emulate(TrapOp::WriteStatus { rs: 0 }, &mut shadow, &mut ctx).unwrap();

        emulate(TrapOp::ReadStatus { rd: 1 }, &mut shadow, &mut ctx).unwrap();
        assert_eq!(ctx.regs[1] & 0x00FF_FF00, 0);
    }

    #[test]
    fn saved_status_roundtrip() {
        let mut shadow = ShadowRegisterFile::new();
        let mut ctx = ctx_at(0x5C);

        let value = (Psr::Z | Psr::I | Psr::F).with_mode(Mode::User).bits();
        ctx.regs[12] = value;
        emulate(TrapOp::WriteSavedStatus { rs: 12 }, &mut shadow, &mut ctx).unwrap();

        emulate(TrapOp::ReadSavedStatus { rd: 3 }, &mut shadow, &mut ctx).unwrap();
        assert_eq!(ctx.regs[3], value);
    }

    #[test]
    fn exception_return_restores_pc_and_status() {
        let mut shadow = ShadowRegisterFile::new();
        let mut ctx = ctx_at(0x188);

        // pretend an exception from user mode was taken earlier
        shadow
            .set_saved_status(Mode::Supervisor, (Psr::C).with_mode(Mode::User))
            .unwrap();
        ctx.regs[14] = 0x0800_01C0;

        let resume =
            emulate(TrapOp::ExceptionReturn { subtract: 0 }, &mut shadow, &mut ctx).unwrap();
        assert_eq!(resume, 0x0800_01C0);
        assert_eq!(shadow.current_mode(), Mode::User);
        assert_eq!(ctx.flags, Psr::C);
        assert!(!shadow.cpsr().contains(Psr::I));
    }

    #[test]
    fn exception_return_with_subtract() {
        let mut shadow = ShadowRegisterFile::new();
        let mut ctx = ctx_at(0x64);
        let mut regs = [0u32; 16];
        shadow.switch_mode(&mut regs, Mode::Irq);
        shadow
            .set_saved_status(Mode::Irq, Psr::empty().with_mode(Mode::System))
            .unwrap();
        ctx.regs[14] = 0x0800_0104;

        let resume =
            emulate(TrapOp::ExceptionReturn { subtract: 4 }, &mut shadow, &mut ctx).unwrap();
        assert_eq!(resume, 0x0800_0100);
        assert_eq!(shadow.current_mode(), Mode::System);
    }

    #[test]
    fn saved_status_in_user_mode_is_an_error() {
        let mut shadow = ShadowRegisterFile::new();
        let mut regs = [0u32; 16];
        shadow.switch_mode(&mut regs, Mode::User);

        let mut ctx = ctx_at(0x150);
        assert_eq!(
            emulate(TrapOp::ReadSavedStatus { rd: 11 }, &mut shadow, &mut ctx),
            Err(ShadowError::NoSavedStatus(Mode::User))
        );
    }
}
