//! The virtual CPU state component.
//!
//! Guest code runs natively; this module owns everything the guest must not
//! touch directly: the shadow register file, the trap dispatch table, the
//! I/O register bank and the DMA engine, all scoped to one
//! [`VirtualMachine`] instance so a test harness can hold several even
//! though only one ever runs live.
//!
//! [`VirtualMachine`]: struct.VirtualMachine.html

pub mod psr;
pub mod shadow;
pub mod trap;

pub use self::psr::{Mode, Psr};
pub use self::shadow::ShadowRegisterFile;
pub use self::trap::{TrapContext, TrapOp, TrapTable};

use self::shadow::ShadowError;
use io::dma::DmaEngine;
use io::{bus_load16, bus_load32, bus_load8, bus_store16, bus_store32, bus_store8};
use io::{IoRegisterBank, Irq, WriteEffect};
use memory::{GuestMemory, MemoryError};

use std::error::Error;
use std::fmt;

/// The guest's three entry points into the (already relocated) BIOS image,
/// handed over once at initialization.
#[derive(Debug, Copy, Clone)]
pub struct EntryPoints {
    pub reset: u32,
    /// Software-interrupt vector, `base + 0x08`.
    pub swi: u32,
    /// Hardware-interrupt vector, `base + 0x18`.
    pub irq: u32,
}

impl EntryPoints {
    /// The conventional vector layout at the start of a BIOS image.
    pub fn at_bios_base(base: u32) -> Self {
        Self {
            reset: base,
            swi: base + 0x08,
            irq: base + 0x18,
        }
    }
}

/// Why native guest execution stopped and handed control back.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// A patched instruction faulted; `ctx.fault_addr` names it.
    Trap,
    /// The guest executed a software interrupt; `ctx.regs[15]` holds the
    /// address of the following instruction.
    SoftwareInterrupt,
    /// The platform delivered a hardware interrupt.
    Interrupt(Irq),
    /// The guest halted itself (or the platform shut the run down).
    Halt,
}

/// The seam to the host's native execution mechanism.
///
/// An implementation transfers control to guest code at `ctx.regs[15]` and
/// runs it at full host speed until something needs the virtualization
/// layer. On the real host this is a thin shim around the exception
/// vectors; tests use a scripted stand-in.
pub trait GuestExecutor<M: GuestMemory> {
    fn enter(&mut self, vm: &mut VirtualMachine<M>, ctx: &mut TrapContext) -> ExitReason;
}

/// One guest execution context: memory, hardware emulation and the shadow
/// privileged state, plus the trap dispatch table for the staged images.
#[derive(Debug)]
pub struct VirtualMachine<M: GuestMemory> {
    mem: M,
    io: IoRegisterBank,
    dma: DmaEngine,
    shadow: ShadowRegisterFile,
    traps: TrapTable,
    entry: EntryPoints,
    halt_requested: bool,
}

impl<M: GuestMemory> VirtualMachine<M> {
    /// Creates a machine over staged guest memory.
    ///
    /// `traps` comes from the loader; `entry` points into the relocated
    /// BIOS. The I/O bank and the shadow file start in their reset states.
    pub fn new(mem: M, traps: TrapTable, entry: EntryPoints) -> Self {
        Self {
            mem,
            io: IoRegisterBank::new(),
            dma: DmaEngine::new(),
            shadow: ShadowRegisterFile::new(),
            traps,
            entry,
            halt_requested: false,
        }
    }

    pub fn mem(&self) -> &M {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut M {
        &mut self.mem
    }

    pub fn io_mut(&mut self) -> &mut IoRegisterBank {
        &mut self.io
    }

    pub fn shadow(&self) -> &ShadowRegisterFile {
        &self.shadow
    }

    /// Runs the guest from its reset vector until it halts or faults
    /// fatally.
    ///
    /// There is no other way out: a fatal error leaves the machine in an
    /// undefined state and the caller is expected to tear the whole context
    /// down.
    pub fn run<E: GuestExecutor<M>>(
        &mut self,
        exec: &mut E,
        ctx: &mut TrapContext,
    ) -> Result<(), VmError> {
        if !self.mem.caches_synced() {
            return Err(VmError::CachesNotSynced);
        }

        ctx.regs[15] = self.entry.reset;
        loop {
            match exec.enter(self, ctx) {
                ExitReason::Trap => self.handle_trap(ctx)?,
                ExitReason::SoftwareInterrupt => self.enter_swi(ctx)?,
                ExitReason::Interrupt(irq) => self.deliver_interrupt(irq, ctx)?,
                ExitReason::Halt => return Ok(()),
            }
        }
    }

    /// Emulates the privileged operation patched over `ctx.fault_addr` and
    /// rewrites `ctx.regs[15]` to the address native execution resumes at.
    ///
    /// An address outside the dispatch table means the running image and
    /// the patch tables disagree; there is no defined continuation.
    pub fn handle_trap(&mut self, ctx: &mut TrapContext) -> Result<(), VmError> {
        let op = self
            .traps
            .lookup(ctx.fault_addr)
            .ok_or(VmError::UnknownTrap {
                addr: ctx.fault_addr,
            })?;
        trace!("trap at {:#010X}: {:?}", ctx.fault_addr, op);

        let resume = trap::emulate(op, &mut self.shadow, ctx)?;
        ctx.regs[15] = resume;
        Ok(())
    }

    /// Emulates entry into the guest's software-interrupt handler.
    ///
    /// `ctx.regs[15]` must hold the address of the instruction after the
    /// `swi`; it becomes the handler's return address in the banked link
    /// register.
    pub fn enter_swi(&mut self, ctx: &mut TrapContext) -> Result<(), VmError> {
        let return_to = ctx.regs[15];
        self.enter_exception(Mode::Supervisor, self.entry.swi, return_to, ctx)
    }

    /// Delivers a hardware interrupt.
    ///
    /// For the display blanking events this first runs every DMA channel
    /// armed on that event, so that no guest instruction after the event
    /// can observe memory as if a deferred transfer had not happened. The
    /// guest only enters its handler if its own IME/IE gates allow it;
    /// otherwise the request stays latched in the bank and execution
    /// resumes where it was.
    pub fn deliver_interrupt(&mut self, irq: Irq, ctx: &mut TrapContext) -> Result<(), VmError> {
        if irq.contains(Irq::VBLANK) {
            self.io.enter_vblank();
            self.dma.on_vblank(&mut self.mem, &mut self.io)?;
        } else {
            if irq.contains(Irq::HBLANK) {
                self.dma.on_hblank(&mut self.mem, &mut self.io)?;
            }
            self.io.raise_irq(irq);
        }

        if self.io.irq_pending() {
            // lr_irq holds pc + 4; the handler returns with subs pc, lr, #4
            let return_to = ctx.regs[15].wrapping_add(4);
            self.enter_exception(Mode::Irq, self.entry.irq, return_to, ctx)?;
        }
        Ok(())
    }

    fn enter_exception(
        &mut self,
        mode: Mode,
        vector: u32,
        return_to: u32,
        ctx: &mut TrapContext,
    ) -> Result<(), VmError> {
        let old = self.merged_cpsr(ctx);
        self.shadow.switch_mode(&mut ctx.regs, mode);
        self.shadow.set_saved_status(mode, old)?;
        let masked = self.shadow.cpsr() | Psr::I;
        self.shadow.set_cpsr(masked, &mut ctx.regs)?;
        ctx.regs[14] = return_to;
        ctx.regs[15] = vector;
        Ok(())
    }

    /// Platform notification that the sound FIFO at `fifo_addr` drained.
    /// Runs the special-timed channel feeding it, if one is armed.
    pub fn deliver_fifo_refill(&mut self, fifo_addr: u32) -> Result<(), VmError> {
        self.dma.on_fifo_empty(fifo_addr, &mut self.mem, &mut self.io)?;
        Ok(())
    }

    /// The full current status word, with the condition flags taken from
    /// the host-captured context.
    pub fn merged_cpsr(&self, ctx: &TrapContext) -> Psr {
        (self.shadow.cpsr() - Psr::FLAGS_FIELD) | (ctx.flags & Psr::FLAGS_FIELD)
    }

    /// Whether the guest requested halt since the last call.
    pub fn take_halt_request(&mut self) -> bool {
        let halt = self.halt_requested;
        self.halt_requested = false;
        halt
    }

    // Guest-visible bus accessors. Native loads and stores hit memory
    // directly; anything that lands in the I/O window is redirected here by
    // the host, so register effect logic is never bypassed.

    pub fn load8(&mut self, addr: u32) -> Result<u8, MemoryError> {
        bus_load8(&self.mem, &mut self.io, addr)
    }

    pub fn load16(&mut self, addr: u32) -> Result<u16, MemoryError> {
        bus_load16(&self.mem, &mut self.io, addr)
    }

    pub fn load32(&mut self, addr: u32) -> Result<u32, MemoryError> {
        bus_load32(&self.mem, &mut self.io, addr)
    }

    pub fn store8(&mut self, addr: u32, value: u8) -> Result<(), VmError> {
        let effect = bus_store8(&mut self.mem, &mut self.io, addr, value)?;
        self.apply_write_effect(effect)
    }

    pub fn store16(&mut self, addr: u32, value: u16) -> Result<(), VmError> {
        let effect = bus_store16(&mut self.mem, &mut self.io, addr, value)?;
        self.apply_write_effect(effect)
    }

    pub fn store32(&mut self, addr: u32, value: u32) -> Result<(), VmError> {
        let effect = bus_store32(&mut self.mem, &mut self.io, addr, value)?;
        self.apply_write_effect(effect)
    }

    fn apply_write_effect(&mut self, effect: WriteEffect) -> Result<(), VmError> {
        match effect {
            WriteEffect::None => Ok(()),
            WriteEffect::DmaControl(ch) => {
                // immediate transfers run to completion in here, before the
                // triggering store returns to guest code
                self.dma.control_written(ch, &mut self.mem, &mut self.io)?;
                Ok(())
            }
            WriteEffect::Halt => {
                self.halt_requested = true;
                Ok(())
            }
        }
    }
}

/// A fatal virtualization failure.
///
/// None of these are recoverable: a single guest owns the machine for the
/// whole run, so every core-internal error halts the execution context.
#[derive(Debug, PartialEq, Eq)]
pub enum VmError {
    /// A trap fired at an address outside the build-time table: the image
    /// and the patch tables disagree, or the guest needs an operation this
    /// layer does not virtualize.
    UnknownTrap { addr: u32 },
    /// An emulated operation was inconsistent with the shadow file.
    Shadow(ShadowError),
    /// A DMA transfer or bus access faulted.
    Memory(MemoryError),
    /// `run` was called before the loader synchronized the caches; the
    /// host could fetch stale pre-patch instructions.
    CachesNotSynced,
}

impl From<ShadowError> for VmError {
    fn from(e: ShadowError) -> Self {
        VmError::Shadow(e)
    }
}

impl From<MemoryError> for VmError {
    fn from(e: MemoryError) -> Self {
        VmError::Memory(e)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VmError::UnknownTrap { addr } => {
                write!(f, "trap at unknown address {:#010X}", addr)
            }
            VmError::Shadow(e) => e.fmt(f),
            VmError::Memory(e) => e.fmt(f),
            VmError::CachesNotSynced => {
                write!(f, "guest memory was modified without a cache sync")
            }
        }
    }
}

impl Error for VmError {}

#[cfg(test)]
mod tests {
    use super::*;
    use bios::{crc32, PatchSet, VmPatch};
    use io::{dma_base, REG_DISPSTAT, REG_IE, REG_IME};
    use loader;
    use memory::{ArrayMemory, IO_BASE};

    const BIOS_BASE: u32 = 0x0600_0000;
    const ROM_ENTRY: u32 = 0x0800_0000;

    /// Scripted stand-in for native execution: each `enter` consumes one
    /// step and reports it, recording where execution would have resumed.
    struct ScriptedExecutor {
        steps: Vec<Step>,
        resumed_at: Vec<u32>,
    }

    #[derive(Debug, Copy, Clone)]
    enum Step {
        TrapAt(u32),
        Swi { next_pc: u32 },
        Interrupt(Irq),
        Halt,
    }

    impl ScriptedExecutor {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps,
                resumed_at: Vec::new(),
            }
        }
    }

    impl GuestExecutor<ArrayMemory> for ScriptedExecutor {
        fn enter(
            &mut self,
            _vm: &mut VirtualMachine<ArrayMemory>,
            ctx: &mut TrapContext,
        ) -> ExitReason {
            self.resumed_at.push(ctx.regs[15]);
            match self.steps.remove(0) {
                Step::TrapAt(addr) => {
                    ctx.fault_addr = addr;
                    ExitReason::Trap
                }
                Step::Swi { next_pc } => {
                    ctx.regs[15] = next_pc;
                    ExitReason::SoftwareInterrupt
                }
                Step::Interrupt(irq) => ExitReason::Interrupt(irq),
                Step::Halt => ExitReason::Halt,
            }
        }
    }

    /// Stages a synthetic BIOS whose "reset code" hands off to a guest
    /// program: a saved-status write at +0x20 and an exception return at
    /// +0x24.
    fn staged_vm() -> VirtualMachine<ArrayMemory> {
        let image = vec![0u8; 0x40];
        let set = PatchSet {
            version: "synthetic bios",
            digest: crc32(&image),
            image_len: 0x40,
            word_tables: &[],
            relocations: &[],
            halfword_fixups: &[],
            patches: &[
                VmPatch {
                    offset: 0x20,
                    encoding: 0xE1C9_009C,
                    op: TrapOp::WriteSavedStatus { rs: 12 },
                },
                VmPatch {
                    offset: 0x24,
                    encoding: 0xEE64_000E,
                    op: TrapOp::ExceptionReturn { subtract: 0 },
                },
            ],
        };

        let mut mem = ArrayMemory::new();
        let mut traps = loader::load_bios(&mut mem, BIOS_BASE, &image, &set).unwrap();
        loader::load_rom(&mut mem, ROM_ENTRY, &[0u8; 0x100], &[], &mut traps).unwrap();
        mem.add_mapping(0x0300_0000..=0x0300_7FFF, &[], "<iwram>").unwrap();
        mem.add_mapping(0x0200_0000..=0x0203_FFFF, &[], "<ewram>").unwrap();
        mem.sync_caches();

        VirtualMachine::new(mem, traps, EntryPoints::at_bios_base(BIOS_BASE))
    }

    #[test]
    fn run_to_first_user_mode_entry() {
        let mut vm = staged_vm();
        let mut ctx = TrapContext::new();
        // the reset code prepares the return into the guest program
        ctx.regs[12] = Psr::empty().with_mode(Mode::User).bits();
        ctx.regs[14] = ROM_ENTRY;

        let mut exec = ScriptedExecutor::new(vec![
            Step::TrapAt(BIOS_BASE + 0x20),
            Step::TrapAt(BIOS_BASE + 0x24),
            Step::Halt,
        ]);
        vm.run(&mut exec, &mut ctx).unwrap();

        assert_eq!(vm.shadow().current_mode(), Mode::User);
        assert_eq!(ctx.regs[15], ROM_ENTRY);
        // execution entered at the reset vector and resumed after the first
        // trap before taking the exception return
        assert_eq!(
            exec.resumed_at,
            vec![BIOS_BASE, BIOS_BASE + 0x24, ROM_ENTRY]
        );
    }

    #[test]
    fn unknown_trap_address_is_fatal() {
        let mut vm = staged_vm();
        let mut ctx = TrapContext::new();
        let mut exec = ScriptedExecutor::new(vec![Step::TrapAt(BIOS_BASE + 0x3C)]);

        assert_eq!(
            vm.run(&mut exec, &mut ctx),
            Err(VmError::UnknownTrap {
                addr: BIOS_BASE + 0x3C
            })
        );
    }

    #[test]
    fn refuses_to_run_with_unsynced_caches() {
        let mut vm = staged_vm();
        vm.mem_mut().store8(0x0200_0000, 1).unwrap();

        let mut ctx = TrapContext::new();
        let mut exec = ScriptedExecutor::new(vec![Step::Halt]);
        assert_eq!(vm.run(&mut exec, &mut ctx), Err(VmError::CachesNotSynced));
    }

    #[test]
    fn swi_enters_supervisor_at_the_vector() {
        let mut vm = staged_vm();
        let mut ctx = TrapContext::new();
        ctx.flags = Psr::Z;

        let mut exec = ScriptedExecutor::new(vec![
            Step::Swi { next_pc: ROM_ENTRY + 8 },
            Step::Halt,
        ]);
        // the scripted guest does the swi from system mode
        vm.shadow.switch_mode(&mut ctx.regs, Mode::System);
        vm.run(&mut exec, &mut ctx).unwrap();

        assert_eq!(vm.shadow().current_mode(), Mode::Supervisor);
        assert!(vm.shadow().cpsr().contains(Psr::I));
        assert_eq!(ctx.regs[14], ROM_ENTRY + 8);
        assert_eq!(ctx.regs[15], BIOS_BASE + 0x08);

        let saved = vm.shadow().saved_status(Mode::Supervisor).unwrap();
        assert_eq!(saved.mode(), Some(Mode::System));
        assert!(saved.contains(Psr::Z));
    }

    #[test]
    fn vblank_runs_deferred_dma_before_the_guest_resumes() {
        let mut vm = staged_vm();
        vm.mem_mut().store16(0x0300_0000, 0x5A5A).unwrap();
        vm.mem_mut().sync_caches();

        // guest arms a v-blank channel and enables the interrupt
        vm.store32(IO_BASE + dma_base(0), 0x0300_0000).unwrap();
        vm.store32(IO_BASE + dma_base(0) + 4, 0x0200_0000).unwrap();
        vm.store16(IO_BASE + dma_base(0) + 8, 1).unwrap();
        vm.store16(IO_BASE + dma_base(0) + 10, 0x9000).unwrap();
        vm.store16(IO_BASE + REG_DISPSTAT, 1 << 3).unwrap();
        vm.store16(IO_BASE + REG_IE, Irq::VBLANK.bits()).unwrap();
        vm.store16(IO_BASE + REG_IME, 1).unwrap();
        assert_eq!(vm.load16(0x0200_0000), Ok(0));

        let mut ctx = TrapContext::new();
        let mut exec = ScriptedExecutor::new(vec![Step::Interrupt(Irq::VBLANK), Step::Halt]);
        vm.run(&mut exec, &mut ctx).unwrap();

        // the transfer completed before the guest could run past the event
        assert_eq!(vm.load16(0x0200_0000), Ok(0x5A5A));
        assert_eq!(vm.shadow().current_mode(), Mode::Irq);
        assert_eq!(ctx.regs[15], BIOS_BASE + 0x18);
        // lr_irq is pc + 4, matching the subs pc, lr, #4 return
        assert_eq!(ctx.regs[14], BIOS_BASE + 4);
    }

    #[test]
    fn hblank_runs_deferred_dma_before_the_guest_resumes() {
        let mut vm = staged_vm();
        vm.mem_mut().store16(0x0300_0000, 0x7777).unwrap();
        vm.mem_mut().sync_caches();

        // guest arms an h-blank channel
        vm.store32(IO_BASE + dma_base(0), 0x0300_0000).unwrap();
        vm.store32(IO_BASE + dma_base(0) + 4, 0x0200_0000).unwrap();
        vm.store16(IO_BASE + dma_base(0) + 8, 1).unwrap();
        vm.store16(IO_BASE + dma_base(0) + 10, 0xA000).unwrap();
        assert_eq!(vm.load16(0x0200_0000), Ok(0));

        let mut ctx = TrapContext::new();
        let mut exec = ScriptedExecutor::new(vec![Step::Interrupt(Irq::HBLANK), Step::Halt]);
        vm.run(&mut exec, &mut ctx).unwrap();

        assert_eq!(vm.load16(0x0200_0000), Ok(0x7777));
        // the request was latched even though nothing gated it through
        assert_eq!(vm.load16(IO_BASE + 0x202), Ok(Irq::HBLANK.bits()));
    }

    #[test]
    fn fifo_refill_reaches_the_engine() {
        let mut vm = staged_vm();
        for i in 0..4u32 {
            vm.mem_mut().store32(0x0300_0000 + i * 4, i + 1).unwrap();
        }
        vm.mem_mut().sync_caches();

        // special-timed channel 1; the fixed destination makes the last
        // transferred word observable
        vm.store32(IO_BASE + dma_base(1), 0x0300_0000).unwrap();
        vm.store32(IO_BASE + dma_base(1) + 4, 0x0200_0100).unwrap();
        vm.store16(IO_BASE + dma_base(1) + 8, 0).unwrap();
        vm.store16(IO_BASE + dma_base(1) + 10, 0xB600).unwrap();
        assert_eq!(vm.load32(0x0200_0100), Ok(0));

        vm.deliver_fifo_refill(0x0200_0100).unwrap();
        assert_eq!(vm.load32(0x0200_0100), Ok(4));
    }

    #[test]
    fn masked_interrupt_stays_latched() {
        let mut vm = staged_vm();
        let mut ctx = TrapContext::new();
        let mut exec = ScriptedExecutor::new(vec![Step::Interrupt(Irq::VBLANK), Step::Halt]);
        vm.store16(IO_BASE + REG_DISPSTAT, 1 << 3).unwrap();
        vm.run(&mut exec, &mut ctx).unwrap();

        // no IME: the guest never entered the handler
        assert_eq!(vm.shadow().current_mode(), Mode::Supervisor);
        assert_eq!(vm.load16(IO_BASE + 0x202), Ok(Irq::VBLANK.bits()));
    }

    #[test]
    fn immediate_dma_through_the_guest_bus() {
        let mut vm = staged_vm();
        vm.mem_mut().store32(0x0300_0010, 0x1234_5678).unwrap();
        vm.mem_mut().sync_caches();

        vm.store32(IO_BASE + dma_base(3), 0x0300_0010).unwrap();
        vm.store32(IO_BASE + dma_base(3) + 4, 0x0200_0020).unwrap();
        vm.store16(IO_BASE + dma_base(3) + 8, 1).unwrap();
        vm.store16(IO_BASE + dma_base(3) + 10, 0x8400).unwrap();

        // the store above already performed the transfer
        assert_eq!(vm.load32(0x0200_0020), Ok(0x1234_5678));
    }

    #[test]
    fn halt_request_is_surfaced() {
        let mut vm = staged_vm();
        assert!(!vm.take_halt_request());
        vm.store8(IO_BASE + 0x301, 0).unwrap();
        assert!(vm.take_halt_request());
        assert!(!vm.take_halt_request());
    }
}
