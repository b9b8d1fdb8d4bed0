//! Block-transfer (DMA) emulation.
//!
//! The guest configures a channel through the write-only transfer registers
//! in the I/O bank and arms it by setting the enable bit in the channel's
//! control register. Immediate channels run synchronously inside that
//! register write; event-timed channels are deferred and run, in ascending
//! channel order, when the event is delivered and *before* guest code can
//! resume past it. Transfers go through the bus helpers, so a transfer into
//! the I/O window still honours register write semantics.

use io::{bus_load16, bus_load32, bus_store16, bus_store32, Irq, IoRegisterBank};
use memory::{GuestMemory, MemoryError};
use num_traits::FromPrimitive;

bitflags! {
    /// A DMA channel's control register (the upper halfword of the channel
    /// block). The two-bit adjustment and timing fields are decoded via
    /// [`Adjust`] and [`Timing`].
    pub struct DmaControl: u16 {
        const DEST_ADJUST = 0b11 << 5;
        const SRC_ADJUST = 0b11 << 7;
        const REPEAT = 1 << 9;
        const WORD = 1 << 10;
        const TIMING = 0b11 << 12;
        const COMPLETE_IRQ = 1 << 14;
        const ENABLE = 1 << 15;
    }
}

impl DmaControl {
    fn dest_adjust(&self) -> Adjust {
        Adjust::from_u16((*self & DmaControl::DEST_ADJUST).bits() >> 5)
            .expect("2-bit field covers all variants")
    }

    fn src_adjust(&self) -> Adjust {
        // encoding 3 is reserved for sources; treat it as fixed
        Adjust::from_u16((*self & DmaControl::SRC_ADJUST).bits() >> 7).unwrap_or(Adjust::Fixed)
    }

    fn timing(&self) -> Timing {
        Timing::from_u16((*self & DmaControl::TIMING).bits() >> 12)
            .expect("2-bit field covers all variants")
    }
}

/// Pointer adjustment after each transferred unit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
enum Adjust {
    Increment = 0,
    Decrement = 1,
    Fixed = 2,
    /// Increment during the transfer, reload the start value when the channel
    /// retriggers. Destination only.
    IncrementReload = 3,
}

fn adjust(ptr: u32, mode: Adjust, unit: u32) -> u32 {
    match mode {
        Adjust::Increment | Adjust::IncrementReload => ptr.wrapping_add(unit),
        Adjust::Decrement => ptr.wrapping_sub(unit),
        Adjust::Fixed => ptr,
    }
}

/// When an armed channel actually transfers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum Timing {
    /// Synchronously, inside the enabling register write.
    Immediate = 0,
    /// Deferred to the next vertical blank.
    VBlank = 1,
    /// Deferred to the next horizontal blank.
    HBlank = 2,
    /// Sound FIFO refill (channels 1 and 2).
    Special = 3,
}

/// Internal latches of one channel.
///
/// The guest-visible registers are write-only; the engine snapshots them
/// here when the enable bit rises, and works off the snapshot from then on.
#[derive(Debug)]
struct Channel {
    src: u32,
    dst: u32,
    /// Reload value for the destination (inc-reload mode).
    dst_reload: u32,
    /// Reload value for the unit count (repeat mode).
    count_reload: u32,
    count: u32,
    ctrl: DmaControl,
    /// Enabled and waiting for its trigger event.
    armed: bool,
    /// Enable bit as last seen, for rising-edge detection.
    enabled: bool,
}

impl Channel {
    fn new() -> Self {
        Self {
            src: 0,
            dst: 0,
            dst_reload: 0,
            count_reload: 0,
            count: 0,
            ctrl: DmaControl::empty(),
            armed: false,
            enabled: false,
        }
    }
}

/// The DMA engine of one virtual machine instance.
#[derive(Debug)]
pub struct DmaEngine {
    channels: [Channel; 4],
}

impl DmaEngine {
    pub fn new() -> Self {
        Self {
            channels: [Channel::new(), Channel::new(), Channel::new(), Channel::new()],
        }
    }

    /// Reacts to a write of channel `ch`'s control register.
    ///
    /// On a rising enable edge the channel latches its transfer registers
    /// from the bank and either transfers right away (immediate timing,
    /// before control returns to the guest) or arms itself for its event.
    pub fn control_written<M: GuestMemory>(
        &mut self,
        ch: usize,
        mem: &mut M,
        io: &mut IoRegisterBank,
    ) -> Result<(), MemoryError> {
        let ctrl = DmaControl::from_bits_truncate(io.dma_control(ch));
        let was_enabled = self.channels[ch].enabled;
        self.channels[ch].enabled = ctrl.contains(DmaControl::ENABLE);

        if !ctrl.contains(DmaControl::ENABLE) {
            self.channels[ch].armed = false;
            return Ok(());
        }
        if was_enabled {
            // writes while enabled adjust the control latch but do not
            // restart the transfer
            self.channels[ch].ctrl = ctrl;
            return Ok(());
        }

        // internal source/destination buses are narrower than 32 bits
        let src_mask = if ch == 0 { 0x07FF_FFFF } else { 0x0FFF_FFFF };
        let count = match io.dma_count(ch) as u32 {
            0 if ch == 3 => 0x1_0000,
            0 => 0x4000,
            n => n,
        };

        {
            let chan = &mut self.channels[ch];
            chan.src = io.dma_source(ch) & src_mask;
            chan.dst = io.dma_dest(ch) & 0x0FFF_FFFF;
            chan.dst_reload = chan.dst;
            chan.count = count;
            chan.count_reload = count;
            chan.ctrl = ctrl;
        }

        match ctrl.timing() {
            Timing::Immediate => self.run_channel(ch, mem, io),
            _ => {
                trace!("dma{}: armed, timing {:?}", ch, ctrl.timing());
                self.channels[ch].armed = true;
                Ok(())
            }
        }
    }

    /// Delivers a vertical blank: every channel armed for it transfers now,
    /// in ascending channel order, before the caller may resume the guest.
    pub fn on_vblank<M: GuestMemory>(
        &mut self,
        mem: &mut M,
        io: &mut IoRegisterBank,
    ) -> Result<(), MemoryError> {
        self.on_event(Timing::VBlank, mem, io)
    }

    /// Delivers a horizontal blank.
    pub fn on_hblank<M: GuestMemory>(
        &mut self,
        mem: &mut M,
        io: &mut IoRegisterBank,
    ) -> Result<(), MemoryError> {
        self.on_event(Timing::HBlank, mem, io)
    }

    /// Delivers a sound FIFO refill request for the FIFO at `fifo_addr`.
    /// Runs the special-timed channel whose destination is that FIFO.
    pub fn on_fifo_empty<M: GuestMemory>(
        &mut self,
        fifo_addr: u32,
        mem: &mut M,
        io: &mut IoRegisterBank,
    ) -> Result<(), MemoryError> {
        for ch in 1..3 {
            let matches = {
                let chan = &self.channels[ch];
                chan.armed
                    && chan.ctrl.timing() == Timing::Special
                    && chan.dst == fifo_addr & 0x0FFF_FFFF
            };
            if matches {
                self.run_channel(ch, mem, io)?;
            }
        }
        Ok(())
    }

    fn on_event<M: GuestMemory>(
        &mut self,
        timing: Timing,
        mem: &mut M,
        io: &mut IoRegisterBank,
    ) -> Result<(), MemoryError> {
        for ch in 0..4 {
            if self.channels[ch].armed && self.channels[ch].ctrl.timing() == timing {
                self.run_channel(ch, mem, io)?;
            }
        }
        Ok(())
    }

    /// Runs channel `ch`'s transfer to completion.
    fn run_channel<M: GuestMemory>(
        &mut self,
        ch: usize,
        mem: &mut M,
        io: &mut IoRegisterBank,
    ) -> Result<(), MemoryError> {
        let (mut src, mut dst, count, ctrl) = {
            let chan = &self.channels[ch];
            (chan.src, chan.dst, chan.count, chan.ctrl)
        };

        // FIFO refills ignore count and adjustment: four words into a fixed
        // destination
        let fifo = ctrl.timing() == Timing::Special && (ch == 1 || ch == 2);
        let (count, word, dst_adjust) = if fifo {
            (4, true, Adjust::Fixed)
        } else {
            (count, ctrl.contains(DmaControl::WORD), ctrl.dest_adjust())
        };
        let unit: u32 = if word { 4 } else { 2 };

        trace!(
            "dma{}: {:#010X} -> {:#010X}, {} units of {}",
            ch, src, dst, count, unit
        );

        for _ in 0..count {
            if word {
                let value = bus_load32(mem, io, src & !3)?;
                bus_store32(mem, io, dst & !3, value)?;
            } else {
                let value = bus_load16(mem, io, src & !1)?;
                bus_store16(mem, io, dst & !1, value)?;
            }
            src = adjust(src, ctrl.src_adjust(), unit);
            dst = adjust(dst, dst_adjust, unit);
        }

        let repeat = ctrl.contains(DmaControl::REPEAT) && ctrl.timing() != Timing::Immediate;
        {
            let chan = &mut self.channels[ch];
            chan.src = src;
            chan.dst = if repeat && ctrl.dest_adjust() == Adjust::IncrementReload {
                chan.dst_reload
            } else {
                dst
            };
            if repeat {
                chan.count = chan.count_reload;
            } else {
                // completion is guest-observable through the enable bit
                chan.armed = false;
                chan.enabled = false;
                io.set_dma_control(ch, (ctrl - DmaControl::ENABLE).bits());
            }
        }

        if ctrl.contains(DmaControl::COMPLETE_IRQ) {
            io.raise_irq(Irq::dma(ch));
        }
        Ok(())
    }
}
