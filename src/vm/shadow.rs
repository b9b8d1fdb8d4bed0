//! The shadow register file.
//!
//! The host never lets the guest touch the real privileged state, so the
//! current status word, the per-mode saved status words and the per-mode
//! r13/r14 banks live here instead. The file is owned by the
//! [`VirtualMachine`](super::VirtualMachine) and mutated only from trap
//! handling; there is exactly one execution context, so no locking.

use vm::psr::{Mode, Psr};

use std::error::Error;
use std::fmt;

/// Number of r13/r14 bank classes (User and System share one).
const GPR_BANKS: usize = 6;
/// Number of saved status slots (every mode except User).
const SAVED_SLOTS: usize = 6;

/// Software-maintained copy of the guest CPU's privileged state.
#[derive(Debug)]
pub struct ShadowRegisterFile {
    /// Current status word. Its condition flag bits are only authoritative at
    /// trap boundaries, where they are reconciled with the host-captured
    /// flags; mode and control bits are authoritative at all times.
    cpsr: Psr,
    /// Decoded copy of the cpsr mode field. Kept in lockstep with `cpsr` by
    /// `switch_mode`, which is the only place the mode ever changes.
    mode: Mode,
    saved: [Psr; SAVED_SLOTS],
    banked_sp: [u32; GPR_BANKS],
    banked_lr: [u32; GPR_BANKS],
}

fn gpr_bank(mode: Mode) -> usize {
    match mode {
        Mode::User | Mode::System => 0,
        Mode::Fiq => 1,
        Mode::Irq => 2,
        Mode::Supervisor => 3,
        Mode::Abort => 4,
        Mode::Undefined => 5,
    }
}

fn saved_slot(mode: Mode) -> Option<usize> {
    match mode {
        Mode::User => None,
        Mode::Fiq => Some(0),
        Mode::Irq => Some(1),
        Mode::Supervisor => Some(2),
        Mode::Abort => Some(3),
        Mode::Undefined => Some(4),
        Mode::System => Some(5),
    }
}

impl ShadowRegisterFile {
    /// Creates the file in the guest CPU's reset state: supervisor mode with
    /// both interrupt sources masked.
    pub fn new() -> Self {
        Self {
            cpsr: (Psr::I | Psr::F).with_mode(Mode::Supervisor),
            mode: Mode::Supervisor,
            saved: [Psr::empty(); SAVED_SLOTS],
            banked_sp: [0; GPR_BANKS],
            banked_lr: [0; GPR_BANKS],
        }
    }

    /// The current status word (mode and control bits authoritative, flag
    /// bits only as of the last trap).
    pub fn cpsr(&self) -> Psr {
        self.cpsr
    }

    /// The currently active mode.
    pub fn current_mode(&self) -> Mode {
        self.mode
    }

    /// The saved status word of `mode`.
    pub fn saved_status(&self, mode: Mode) -> Result<Psr, ShadowError> {
        let slot = saved_slot(mode).ok_or(ShadowError::NoSavedStatus(mode))?;
        Ok(self.saved[slot])
    }

    /// Overwrites the bits of `mode`'s saved status word selected by `mask`.
    pub fn write_saved_masked(&mut self, mode: Mode, value: u32, mask: Psr)
        -> Result<(), ShadowError>
    {
        let slot = saved_slot(mode).ok_or(ShadowError::NoSavedStatus(mode))?;
        self.saved[slot].write_masked(value, mask);
        Ok(())
    }

    /// Replaces `mode`'s saved status word wholesale.
    pub fn set_saved_status(&mut self, mode: Mode, value: Psr) -> Result<(), ShadowError> {
        let slot = saved_slot(mode).ok_or(ShadowError::NoSavedStatus(mode))?;
        self.saved[slot] = value;
        Ok(())
    }

    /// Switches the active mode, swapping the r13/r14 bank through `regs` if
    /// the new mode uses a different bank class.
    ///
    /// Every mode change goes through here so the mode field of the status
    /// word and the active bank can never diverge.
    pub fn switch_mode(&mut self, regs: &mut [u32; 16], new_mode: Mode) {
        let old_bank = gpr_bank(self.mode);
        let new_bank = gpr_bank(new_mode);
        if old_bank != new_bank {
            self.banked_sp[old_bank] = regs[13];
            self.banked_lr[old_bank] = regs[14];
            regs[13] = self.banked_sp[new_bank];
            regs[14] = self.banked_lr[new_bank];
        }
        self.mode = new_mode;
        self.cpsr = self.cpsr.with_mode(new_mode);
    }

    /// Overwrites the bits of the current status word selected by `mask`.
    ///
    /// If the mask covers the mode field and the written value names a new
    /// mode, the register banks are switched as a side effect, exactly like
    /// the real instruction would.
    pub fn write_current_masked(
        &mut self,
        value: u32,
        mask: Psr,
        regs: &mut [u32; 16],
    ) -> Result<(), ShadowError> {
        if mask.intersects(Psr::MODE) {
            let mode = Psr::from_bits_truncate(value)
                .mode()
                .ok_or(ShadowError::IllegalMode(value & Psr::MODE.bits()))?;
            if mode != self.mode {
                self.switch_mode(regs, mode);
            }
        }
        self.cpsr.write_masked(value, mask - Psr::MODE);
        Ok(())
    }

    /// Replaces the current status word wholesale (exception entry/return).
    pub fn set_cpsr(&mut self, value: Psr, regs: &mut [u32; 16]) -> Result<(), ShadowError> {
        let mode = value
            .mode()
            .ok_or(ShadowError::IllegalMode(value.bits() & Psr::MODE.bits()))?;
        if mode != self.mode {
            self.switch_mode(regs, mode);
        }
        self.cpsr = value;
        Ok(())
    }
}

/// An inconsistency between an emulated operation and the shadow file.
///
/// All of these are fatal to the run; see
/// [`VmError`](super::VmError).
#[derive(Debug, PartialEq, Eq)]
pub enum ShadowError {
    /// The operation needs a saved status word, but the active mode has none.
    NoSavedStatus(Mode),
    /// A status word write named a mode field encoding the guest CPU rejects.
    IllegalMode(u32),
}

impl fmt::Display for ShadowError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ShadowError::NoSavedStatus(mode) => {
                write!(f, "no saved status word in {:?} mode", mode)
            }
            ShadowError::IllegalMode(bits) => {
                write!(f, "illegal mode field {:#04X}", bits)
            }
        }
    }
}

impl Error for ShadowError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_state() {
        let shadow = ShadowRegisterFile::new();
        assert_eq!(shadow.current_mode(), Mode::Supervisor);
        assert!(shadow.cpsr().contains(Psr::I | Psr::F));
    }

    #[test]
    fn sp_lr_banking() {
        let mut shadow = ShadowRegisterFile::new();
        let mut regs = [0u32; 16];
        regs[13] = 0x0300_7FE0; // svc stack
        regs[14] = 0x0000_1234;

        shadow.switch_mode(&mut regs, Mode::Irq);
        regs[13] = 0x0300_7FA0; // irq stack
        regs[14] = 0x0800_0004;

        shadow.switch_mode(&mut regs, Mode::Supervisor);
        assert_eq!(regs[13], 0x0300_7FE0);
        assert_eq!(regs[14], 0x0000_1234);

        shadow.switch_mode(&mut regs, Mode::Irq);
        assert_eq!(regs[13], 0x0300_7FA0);
        assert_eq!(regs[14], 0x0800_0004);
    }

    #[test]
    fn user_and_system_share_a_bank() {
        let mut shadow = ShadowRegisterFile::new();
        let mut regs = [0u32; 16];

        shadow.switch_mode(&mut regs, Mode::System);
        regs[13] = 0x0300_7F00;
        shadow.switch_mode(&mut regs, Mode::Irq);
        shadow.switch_mode(&mut regs, Mode::User);
        assert_eq!(regs[13], 0x0300_7F00);
    }

    #[test]
    fn saved_status_is_per_mode() {
        let mut shadow = ShadowRegisterFile::new();
        shadow
            .set_saved_status(Mode::Irq, Psr::N.with_mode(Mode::User))
            .unwrap();
        shadow
            .set_saved_status(Mode::Supervisor, Psr::Z.with_mode(Mode::System))
            .unwrap();

        assert_eq!(shadow.saved_status(Mode::Irq).unwrap(), Psr::N.with_mode(Mode::User));
        assert_eq!(
            shadow.saved_status(Mode::Supervisor).unwrap(),
            Psr::Z.with_mode(Mode::System)
        );
        assert_eq!(
            shadow.saved_status(Mode::User),
            Err(ShadowError::NoSavedStatus(Mode::User))
        );
    }

    #[test]
    fn masked_current_write_switches_banks() {
        let mut shadow = ShadowRegisterFile::new();
        let mut regs = [0u32; 16];
        regs[13] = 0xAAAA_AAAA;

        let target = (Psr::I | Psr::F).with_mode(Mode::Irq).bits();
        shadow
            .write_current_masked(target, Psr::MSR_CF, &mut regs)
            .unwrap();
        assert_eq!(shadow.current_mode(), Mode::Irq);
        assert_eq!(regs[13], 0); // irq bank starts empty
        assert_ne!(regs[13], 0xAAAA_AAAA);

        let back = (Psr::I | Psr::F).with_mode(Mode::Supervisor).bits();
        shadow
            .write_current_masked(back, Psr::MSR_CF, &mut regs)
            .unwrap();
        assert_eq!(regs[13], 0xAAAA_AAAA);
    }

    #[test]
    fn illegal_mode_write_is_rejected() {
        let mut shadow = ShadowRegisterFile::new();
        let mut regs = [0u32; 16];
        assert_eq!(
            shadow.write_current_masked(0x15, Psr::MSR_CF, &mut regs),
            Err(ShadowError::IllegalMode(0x15))
        );
        // state untouched
        assert_eq!(shadow.current_mode(), Mode::Supervisor);
    }
}
