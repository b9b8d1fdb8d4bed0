//! Program status words and processor modes.

use num_traits::FromPrimitive;

use std::fmt;

bitflags! {
    /// A program status word.
    ///
    /// The four condition flags live in the top bits, the interrupt masks and
    /// the Thumb bit in the low byte next to the mode field. Bits 8-23 are
    /// reserved and read as zero on the guest CPU, so the shadow file never
    /// stores them either.
    pub struct Psr: u32 {
        /// Negative flag.
        const N = 1 << 31;
        /// Zero flag.
        const Z = 1 << 30;
        /// Carry flag.
        const C = 1 << 29;
        /// Overflow flag.
        const V = 1 << 28;
        /// IRQ disable.
        const I = 1 << 7;
        /// FIQ disable.
        const F = 1 << 6;
        /// Thumb state.
        const T = 1 << 5;
        /// Processor mode field.
        const MODE = 0x1F;

        /// The flags field (`f` in an `msr` field specifier).
        const FLAGS_FIELD = 0xF000_0000;
        /// The control field (`c` in an `msr` field specifier).
        const CONTROL_FIELD = 0x0000_00FF;
        /// Field mask used by every patched `msr` in the shipped tables:
        /// all of them name the `cf` fields, leaving the reserved bits
        /// untouched.
        const MSR_CF = Self::FLAGS_FIELD.bits | Self::CONTROL_FIELD.bits;
    }
}

impl Psr {
    /// Decodes the mode field.
    ///
    /// Returns `None` for the encodings the guest CPU treats as illegal; a
    /// status word with such a mode can only come from a VM bug, never from
    /// emulated guest behaviour, since every write path goes through
    /// `with_mode` or a masked field write.
    pub fn mode(&self) -> Option<Mode> {
        Mode::from_u32((*self & Psr::MODE).bits)
    }

    /// Returns a copy of `self` with the mode field replaced.
    pub fn with_mode(self, mode: Mode) -> Psr {
        (self - Psr::MODE) | Psr::from_bits_truncate(mode as u32)
    }

    /// Replaces the bits selected by `mask` with the corresponding bits of
    /// `value`, dropping anything outside the architecturally defined bits.
    pub fn write_masked(&mut self, value: u32, mask: Psr) {
        *self = (*self - mask) | (Psr::from_bits_truncate(value) & mask);
    }
}

impl fmt::Display for Psr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#010X}", self.bits)
    }
}

/// Processor modes of the guest CPU.
///
/// Values are the architectural mode field encodings.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, FromPrimitive)]
#[repr(u32)]
pub enum Mode {
    User = 0x10,
    Fiq = 0x11,
    Irq = 0x12,
    Supervisor = 0x13,
    Abort = 0x17,
    Undefined = 0x1B,
    System = 0x1F,
}

impl Mode {
    /// Whether this mode has a saved status word of its own.
    ///
    /// User code has nowhere to return *from*, so it is the only mode
    /// without one. System's slot is vendor-defined rather than
    /// architectural, but the BIOS relies on it.
    pub fn has_saved_status(&self) -> bool {
        *self != Mode::User
    }
}
