//! The memory-mapped I/O register bank.
//!
//! A 1 KiB window of the guest address space behaves like hardware
//! registers. The bank is never raw-mapped; every guest access, and every
//! DMA access that lands in the window, is routed through [`load16`]/
//! [`store16`] so register side effects (acknowledge-on-write, read-only
//! flag bits, write-only transfer registers) can never be bypassed by a
//! plain store.
//!
//! The bank resets to a defined state before guest execution starts, so
//! nothing from host boot leaks into guest-visible registers.
//!
//! [`load16`]: struct.IoRegisterBank.html#method.load16
//! [`store16`]: struct.IoRegisterBank.html#method.store16

pub mod dma;

use memory::{GuestMemory, MemoryError, IO_BASE, IO_LEN};

/// Display control.
pub const REG_DISPCNT: u32 = 0x000;
/// Display status. Bits 0-2 are hardware-owned flags, read-only to the guest.
pub const REG_DISPSTAT: u32 = 0x004;
/// Current scanline, read-only, fed by the platform.
pub const REG_VCOUNT: u32 = 0x006;
/// Sound FIFO A, write-only.
pub const REG_FIFO_A: u32 = 0x0A0;
/// Sound FIFO B, write-only.
pub const REG_FIFO_B: u32 = 0x0A4;
/// Key state, read-only, active low.
pub const REG_KEYINPUT: u32 = 0x130;
/// Interrupt enable.
pub const REG_IE: u32 = 0x200;
/// Interrupt request flags. Writing 1 to a bit acknowledges it.
pub const REG_IF: u32 = 0x202;
/// Interrupt master enable.
pub const REG_IME: u32 = 0x208;
/// Low-power control, byte-sized. A write requests halt.
pub const REG_HALTCNT: u32 = 0x301;

/// Byte offset of DMA channel `ch`'s register block (source address).
pub fn dma_base(ch: usize) -> u32 {
    0x0B0 + ch as u32 * 12
}

/// In DISPSTAT, the hardware-owned flag bits.
const DISPSTAT_FLAGS: u16 = 0x0007;
/// DISPSTAT bit enabling the v-blank interrupt.
const DISPSTAT_VBLANK_IRQ: u16 = 1 << 3;

bitflags! {
    /// Interrupt sources, as laid out in IE/IF.
    pub struct Irq: u16 {
        const VBLANK = 1 << 0;
        const HBLANK = 1 << 1;
        const VCOUNT = 1 << 2;
        const TIMER0 = 1 << 3;
        const TIMER1 = 1 << 4;
        const TIMER2 = 1 << 5;
        const TIMER3 = 1 << 6;
        const SERIAL = 1 << 7;
        const DMA0 = 1 << 8;
        const DMA1 = 1 << 9;
        const DMA2 = 1 << 10;
        const DMA3 = 1 << 11;
        const KEYPAD = 1 << 12;
        const GAMEPAK = 1 << 13;
    }
}

impl Irq {
    /// The completion interrupt of DMA channel `ch`.
    pub fn dma(ch: usize) -> Irq {
        Irq::from_bits_truncate(Irq::DMA0.bits() << ch)
    }
}

/// Side effect of a register write that the caller has to act on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteEffect {
    /// Plain latch, nothing further to do.
    None,
    /// A DMA channel's control register changed; the engine must re-examine
    /// the channel.
    DmaControl(usize),
    /// The guest requested halt until the next interrupt.
    Halt,
}

/// The I/O register bank of one virtual machine instance.
#[derive(Debug)]
pub struct IoRegisterBank {
    regs: [u16; (IO_LEN / 2) as usize],
}

impl IoRegisterBank {
    /// Creates the bank in its hardware reset state: everything zero except
    /// the key register, which idles at "no key pressed" (active low).
    pub fn new() -> Self {
        let mut bank = Self {
            regs: [0; (IO_LEN / 2) as usize],
        };
        bank.regs[(REG_KEYINPUT / 2) as usize] = 0x03FF;
        bank
    }

    fn raw(&self, offset: u32) -> u16 {
        self.regs[(offset / 2) as usize & 0x1FF]
    }

    fn set_raw(&mut self, offset: u32, value: u16) {
        self.regs[(offset / 2) as usize & 0x1FF] = value;
    }

    /// Reads the halfword register at byte offset `offset`.
    ///
    /// Takes `&mut self` because the register contract allows reads to have
    /// side effects, even though none of the currently modelled registers
    /// use that.
    pub fn load16(&mut self, offset: u32) -> u16 {
        let offset = offset & !1;
        match offset {
            // write-only: transfer source/dest/count and the sound FIFOs
            REG_FIFO_A | REG_FIFO_B => 0,
            o if is_dma_write_only(o) => 0,
            _ => self.raw(offset),
        }
    }

    /// Writes the halfword register at byte offset `offset`, applying its
    /// write semantics, and reports what the caller has to do about it.
    pub fn store16(&mut self, offset: u32, value: u16) -> WriteEffect {
        let offset = offset & !1;
        match offset {
            // read-only for the guest, owned by the platform
            REG_VCOUNT | REG_KEYINPUT => WriteEffect::None,
            REG_DISPSTAT => {
                let flags = self.raw(offset) & DISPSTAT_FLAGS;
                self.set_raw(offset, flags | (value & !DISPSTAT_FLAGS));
                WriteEffect::None
            }
            REG_IF => {
                // acknowledge: writing 1 clears
                let cur = self.raw(offset);
                self.set_raw(offset, cur & !value);
                WriteEffect::None
            }
            o if is_dma_control(o) => {
                self.set_raw(offset, value);
                WriteEffect::DmaControl(((o - 0x0B0) / 12) as usize)
            }
            _ => {
                self.set_raw(offset, value);
                WriteEffect::None
            }
        }
    }

    pub fn load8(&mut self, offset: u32) -> u8 {
        let half = self.load16(offset);
        if offset & 1 == 0 {
            half as u8
        } else {
            (half >> 8) as u8
        }
    }

    pub fn store8(&mut self, offset: u32, value: u8) -> WriteEffect {
        if offset == REG_HALTCNT {
            return WriteEffect::Halt;
        }
        let cur = self.raw(offset & !1);
        let merged = if offset & 1 == 0 {
            (cur & 0xFF00) | value as u16
        } else {
            (cur & 0x00FF) | (value as u16) << 8
        };
        self.store16(offset & !1, merged)
    }

    pub fn load32(&mut self, offset: u32) -> u32 {
        let offset = offset & !3;
        self.load16(offset) as u32 | (self.load16(offset + 2) as u32) << 16
    }

    /// 32-bit writes apply both halfword effects; a caller that needs to act
    /// on both should use two `store16` calls instead. The shipped register
    /// map never puts two effectful registers in one word, so returning the
    /// more interesting of the two is enough.
    pub fn store32(&mut self, offset: u32, value: u32) -> WriteEffect {
        let offset = offset & !3;
        let lo = self.store16(offset, value as u16);
        let hi = self.store16(offset + 2, (value >> 16) as u16);
        match hi {
            WriteEffect::None => lo,
            other => other,
        }
    }

    /// Latches an interrupt request. Called by the platform and the DMA
    /// engine; the guest acknowledges through `REG_IF`.
    pub fn raise_irq(&mut self, irq: Irq) {
        let cur = self.raw(REG_IF);
        self.set_raw(REG_IF, cur | irq.bits());
    }

    /// Whether an enabled, unmasked interrupt is pending.
    pub fn irq_pending(&self) -> bool {
        self.raw(REG_IME) & 1 != 0 && self.raw(REG_IE) & self.raw(REG_IF) != 0
    }

    /// Platform feed: the current scanline.
    pub fn set_vcount(&mut self, line: u16) {
        self.set_raw(REG_VCOUNT, line);
    }

    /// Platform feed: pressed-key mask (1 = pressed). Stored active low.
    pub fn set_keys(&mut self, pressed: u16) {
        self.set_raw(REG_KEYINPUT, !pressed & 0x03FF);
    }

    /// Platform notification that the display entered vertical blank. Sets
    /// the DISPSTAT flag and latches the interrupt if the guest enabled it.
    pub fn enter_vblank(&mut self) {
        let stat = self.raw(REG_DISPSTAT);
        self.set_raw(REG_DISPSTAT, stat | 1);
        if stat & DISPSTAT_VBLANK_IRQ != 0 {
            self.raise_irq(Irq::VBLANK);
        }
    }

    /// Platform notification that vertical blank ended.
    pub fn leave_vblank(&mut self) {
        let stat = self.raw(REG_DISPSTAT);
        self.set_raw(REG_DISPSTAT, stat & !1);
    }

    // Raw views for the DMA engine, which latches the write-only transfer
    // registers when a channel is enabled.

    pub(crate) fn dma_source(&self, ch: usize) -> u32 {
        let base = dma_base(ch);
        self.raw(base) as u32 | (self.raw(base + 2) as u32) << 16
    }

    pub(crate) fn dma_dest(&self, ch: usize) -> u32 {
        let base = dma_base(ch);
        self.raw(base + 4) as u32 | (self.raw(base + 6) as u32) << 16
    }

    pub(crate) fn dma_count(&self, ch: usize) -> u16 {
        self.raw(dma_base(ch) + 8)
    }

    pub(crate) fn dma_control(&self, ch: usize) -> u16 {
        self.raw(dma_base(ch) + 10)
    }

    pub(crate) fn set_dma_control(&mut self, ch: usize, value: u16) {
        self.set_raw(dma_base(ch) + 10, value);
    }
}

fn is_dma_control(offset: u32) -> bool {
    (0x0B0..0x0E0).contains(&offset) && (offset - 0x0B0) % 12 == 10
}

fn is_dma_write_only(offset: u32) -> bool {
    // SAD, DAD and the unit count read as zero; only CNT_H reads back
    (0x0B0..0x0E0).contains(&offset) && (offset - 0x0B0) % 12 < 10
}

/// Routes a guest-visible load either through the register bank or to plain
/// memory. This is the single dispatch point shared by the virtual machine
/// and the DMA engine.
pub fn bus_load16<M: GuestMemory>(
    mem: &M,
    io: &mut IoRegisterBank,
    addr: u32,
) -> Result<u16, MemoryError> {
    if is_io(addr) {
        Ok(io.load16(addr - IO_BASE))
    } else {
        mem.load16(addr)
    }
}

pub fn bus_load8<M: GuestMemory>(
    mem: &M,
    io: &mut IoRegisterBank,
    addr: u32,
) -> Result<u8, MemoryError> {
    if is_io(addr) {
        Ok(io.load8(addr - IO_BASE))
    } else {
        mem.load8(addr)
    }
}

pub fn bus_load32<M: GuestMemory>(
    mem: &M,
    io: &mut IoRegisterBank,
    addr: u32,
) -> Result<u32, MemoryError> {
    if is_io(addr) {
        Ok(io.load32(addr - IO_BASE))
    } else {
        mem.load32(addr)
    }
}

pub fn bus_store16<M: GuestMemory>(
    mem: &mut M,
    io: &mut IoRegisterBank,
    addr: u32,
    value: u16,
) -> Result<WriteEffect, MemoryError> {
    if is_io(addr) {
        Ok(io.store16(addr - IO_BASE, value))
    } else {
        mem.store16(addr, value)?;
        Ok(WriteEffect::None)
    }
}

pub fn bus_store8<M: GuestMemory>(
    mem: &mut M,
    io: &mut IoRegisterBank,
    addr: u32,
    value: u8,
) -> Result<WriteEffect, MemoryError> {
    if is_io(addr) {
        Ok(io.store8(addr - IO_BASE, value))
    } else {
        mem.store8(addr, value)?;
        Ok(WriteEffect::None)
    }
}

pub fn bus_store32<M: GuestMemory>(
    mem: &mut M,
    io: &mut IoRegisterBank,
    addr: u32,
    value: u32,
) -> Result<WriteEffect, MemoryError> {
    if is_io(addr) {
        Ok(io.store32(addr - IO_BASE, value))
    } else {
        mem.store32(addr, value)?;
        Ok(WriteEffect::None)
    }
}

fn is_io(addr: u32) -> bool {
    addr >= IO_BASE && addr < IO_BASE + IO_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resets_to_defined_state() {
        let mut bank = IoRegisterBank::new();
        assert_eq!(bank.load16(REG_DISPCNT), 0);
        assert_eq!(bank.load16(REG_IE), 0);
        assert_eq!(bank.load16(REG_IF), 0);
        assert_eq!(bank.load16(REG_KEYINPUT), 0x03FF);
    }

    #[test]
    fn interrupt_flags_are_write_one_to_clear() {
        let mut bank = IoRegisterBank::new();
        bank.raise_irq(Irq::VBLANK);
        bank.raise_irq(Irq::DMA1);
        assert_eq!(bank.load16(REG_IF), (Irq::VBLANK | Irq::DMA1).bits());

        bank.store16(REG_IF, Irq::VBLANK.bits());
        assert_eq!(bank.load16(REG_IF), Irq::DMA1.bits());
    }

    #[test]
    fn irq_gating() {
        let mut bank = IoRegisterBank::new();
        bank.raise_irq(Irq::VBLANK);
        assert!(!bank.irq_pending()); // IME off

        bank.store16(REG_IME, 1);
        assert!(!bank.irq_pending()); // not enabled

        bank.store16(REG_IE, Irq::VBLANK.bits());
        assert!(bank.irq_pending());
    }

    #[test]
    fn display_status_flags_are_read_only() {
        let mut bank = IoRegisterBank::new();
        bank.enter_vblank();
        assert_eq!(bank.load16(REG_DISPSTAT) & 1, 1);

        // guest cannot clear the flag, but can set the irq enable
        bank.store16(REG_DISPSTAT, DISPSTAT_VBLANK_IRQ);
        assert_eq!(bank.load16(REG_DISPSTAT), 1 | DISPSTAT_VBLANK_IRQ);

        bank.leave_vblank();
        assert_eq!(bank.load16(REG_DISPSTAT), DISPSTAT_VBLANK_IRQ);
    }

    #[test]
    fn vblank_irq_needs_enable() {
        let mut bank = IoRegisterBank::new();
        bank.enter_vblank();
        assert_eq!(bank.load16(REG_IF), 0);

        bank.leave_vblank();
        bank.store16(REG_DISPSTAT, DISPSTAT_VBLANK_IRQ);
        bank.enter_vblank();
        assert_eq!(bank.load16(REG_IF), Irq::VBLANK.bits());
    }

    #[test]
    fn transfer_registers_are_write_only() {
        let mut bank = IoRegisterBank::new();
        bank.store32(dma_base(0), 0x0300_0000);
        bank.store16(dma_base(0) + 8, 0x100);
        assert_eq!(bank.load32(dma_base(0)), 0);
        assert_eq!(bank.load16(dma_base(0) + 8), 0);
        // but the engine still sees them
        assert_eq!(bank.dma_source(0), 0x0300_0000);
        assert_eq!(bank.dma_count(0), 0x100);
    }

    #[test]
    fn dma_control_write_reports_channel() {
        let mut bank = IoRegisterBank::new();
        for ch in 0..4 {
            assert_eq!(
                bank.store16(dma_base(ch) + 10, 0x8000),
                WriteEffect::DmaControl(ch)
            );
        }
    }

    #[test]
    fn halt_request() {
        let mut bank = IoRegisterBank::new();
        assert_eq!(bank.store8(REG_HALTCNT, 0), WriteEffect::Halt);
    }

    #[test]
    fn keys_are_active_low() {
        let mut bank = IoRegisterBank::new();
        bank.set_keys(0x0001); // A pressed
        assert_eq!(bank.load16(REG_KEYINPUT), 0x03FE);
    }
}
