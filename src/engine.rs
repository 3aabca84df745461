//! The cycle engine: one loop iteration per HP-41 bus cycle.
//!
//! Runs on its own thread ("core 1" on the cartridge) and owns every
//! piece of hot emulation state: the page map, the settings vector, the
//! printer and HP-IL register models and the extended-memory cache.  The
//! service loop on the main thread talks to it exclusively through
//! bounded channels; mutations that need the non-volatile RAM bus are
//! refused while the calculator is running.
//!
//! The five blocking frontend reads are the phase synchronisation: the
//! engine decodes the instruction right after SYNC (stage A), drains the
//! stale DATA word at T0 (B), picks up D0..31 (C), the ISA address (D)
//! and D32..55 (E), and must have all of its responses queued before the
//! respective driver windows open.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::channels::ByteChannel;
use crate::frontend::{BusFrontend, PowerPins};
use crate::hp41::*;
use crate::hpil::{Hpil, IlMirror};
use crate::printer::{Printer, PrinterMode};
use crate::rom::PageMap;
use crate::settings::{self, Settings};
use crate::store::{ImageStore, NvRam};
use crate::tracer::{TraceLine, TraceRing};
use crate::xmem::{register_exists, XmemCache};

/// PRPHSLCT code of the barcode wand.
const PRPH_WAND: u16 = 0x0FE;

/// No wand byte cached.
const WAND_NONE: u16 = 0xFFFF;

/// Commands the service loop may send between cycles.  Key presses and
/// toggles apply immediately; anything touching NvRam or the page map is
/// checked against PWO first.
#[derive(Debug, Clone)]
pub enum EngineCmd {
    SetSetting(usize, u16),
    /// Write settings and page map back to NvRam.  PWO low only.
    SaveState,
    PrinterPower(bool),
    PrinterMode(PrinterMode),
    PrinterKeyPrint,
    PrinterKeyAdv,
    PrinterTogglePaper,
    HpilPlug(bool),
    SetXmem(u16),
    /// Plug an image-store file.  PWO low only.
    Plug { page: usize, bank: usize, offset: u32 },
    /// Remove a plugged image.  PWO low only.
    Unplug { page: usize, bank: usize },
    /// Reserve a page for a physical module.  PWO low only.
    Reserve { page: usize },
    SetSticky { page: usize, sticky: bool },
    /// Pulse ISA to wake the calculator.
    Wake,
    Shutdown,
}

/// What one `run_cycle` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A full bus cycle was processed.
    Cycle,
    /// PWO low or no bus activity; housekeeping ran instead.
    Idle,
    Shutdown,
}

/// Channel ends owned by the engine.
pub struct EngineQueues {
    pub trace: TraceRing,
    pub print_tx: Sender<u8>,
    pub il_out_tx: Sender<u16>,
    pub il_in_rx: Receiver<u16>,
    pub wand_rx: Receiver<u16>,
    pub cmd_rx: Receiver<EngineCmd>,
}

/// Channel ends owned by the service loop.
pub struct CoreLinks {
    pub trace: TraceRing,
    pub print_rx: Receiver<u8>,
    pub il_out_rx: Receiver<u16>,
    pub il_in_tx: Sender<u16>,
    pub wand_tx: Sender<u16>,
    pub cmd_tx: Sender<EngineCmd>,
}

/// Build the SPSC rings between the two cores.
pub fn engine_channels(trace_capacity: usize, print_capacity: usize) -> (EngineQueues, CoreLinks) {
    let trace = TraceRing::new(trace_capacity);
    let (print_tx, print_rx) = bounded(print_capacity);
    let (il_out_tx, il_out_rx) = bounded(32);
    let (il_in_tx, il_in_rx) = bounded(32);
    let (wand_tx, wand_rx) = bounded(16);
    let (cmd_tx, cmd_rx) = bounded(16);
    (
        EngineQueues {
            trace: trace.clone(),
            print_tx,
            il_out_tx,
            il_in_rx,
            wand_rx,
            cmd_rx,
        },
        CoreLinks {
            trace,
            print_rx,
            il_out_rx,
            il_in_tx,
            wand_tx,
            cmd_tx,
        },
    )
}

/// Action decoded in stage A that needs DATA bits to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    None,
    PrintChar,
    RamSelect,
    WriteData,
    PrphSelect,
    Wrom,
    HpilWrite(u8),
}

pub struct Engine<F: BusFrontend> {
    front: F,
    pins: PowerPins,
    pub settings: Settings,
    pub pages: PageMap,
    pub printer: Printer,
    pub hpil: Hpil,
    pub xmem: XmemCache,
    nv: Box<dyn NvRam>,
    images: Box<dyn ImageStore>,
    console: Box<dyn ByteChannel>,
    mirror: Arc<IlMirror>,
    q: EngineQueues,

    selected: ActivePeripheral,
    prph_selected: u16,
    ram_selected: u16,
    wand_cached: u16,
    pending: PendingOp,
    read_pending: bool,
    write_pending: bool,
    fi_lo: u32,
    fi_hi: u32,
    cycle: u32,
    was_pwo: bool,
    trace: TraceLine,
}

impl<F: BusFrontend> Engine<F> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        front: F,
        settings: Settings,
        pages: PageMap,
        nv: Box<dyn NvRam>,
        images: Box<dyn ImageStore>,
        console: Box<dyn ByteChannel>,
        mirror: Arc<IlMirror>,
        queues: EngineQueues,
    ) -> Self {
        let pins = front.pins();
        let mut printer = Printer::new();
        printer.set_mode(PrinterMode::from_setting(settings.get(settings::PRT_MODE)));
        Self {
            front,
            pins,
            settings,
            pages,
            printer,
            hpil: Hpil::new(),
            xmem: XmemCache::new(),
            nv,
            images,
            console,
            mirror,
            q: queues,
            selected: ActivePeripheral::None,
            prph_selected: 0,
            ram_selected: 0,
            wand_cached: WAND_NONE,
            pending: PendingOp::None,
            read_pending: false,
            write_pending: false,
            fi_lo: 0,
            fi_hi: 0,
            cycle: 0,
            was_pwo: false,
            trace: TraceLine::new(),
        }
    }

    /// Spawn the engine on its own thread.
    pub fn spawn(self) -> std::thread::JoinHandle<()>
    where
        F: 'static,
    {
        std::thread::Builder::new()
            .name("cycle-engine".into())
            .spawn(move || self.run())
            .expect("failed to spawn cycle engine thread")
    }

    pub fn run(mut self) {
        log::info!("cycle engine running");
        loop {
            match self.run_cycle() {
                Outcome::Cycle => {}
                Outcome::Idle => std::thread::sleep(Duration::from_micros(500)),
                Outcome::Shutdown => break,
            }
        }
        log::info!("cycle engine stopped");
    }

    /// Process one bus cycle (or the PWO-low idle path).
    pub fn run_cycle(&mut self) -> Outcome {
        let pwo = self.pins.pwo();
        if pwo && !self.was_pwo {
            // PWO rising edge: fresh cycle count, bank selections revert
            self.cycle = 0;
            self.pages.on_power_up();
            self.selected = ActivePeripheral::None;
        }
        if !pwo && self.was_pwo {
            self.front.reset();
            self.pending = PendingOp::None;
            self.read_pending = false;
            self.write_pending = false;
        }
        self.was_pwo = pwo;
        if !pwo {
            return self.idle();
        }

        // ── Stage A: instruction at T54 ───────────────────────
        let Some(inst) = self.front.read_instruction() else {
            // nothing sampled yet: no partial record to emit
            return Outcome::Idle;
        };
        self.trace = TraceLine::new();
        self.trace.cycle_number = self.cycle;
        self.cycle = self.cycle.wrapping_add(1);
        self.trace.isa_instruction = inst;

        // FI pattern computed at the end of the previous cycle goes out
        // before T0
        if self.fi_lo != 0 || self.fi_hi != 0 {
            self.front.push_fi(self.fi_lo, self.fi_hi);
        }

        self.decode(inst);

        // ── Stage B: T0 ───────────────────────────────────────
        self.front.drain_spurious_data();

        // ── Stage C: D0..31 at T31 ────────────────────────────
        let Some(data_lo) = self.front.read_data() else {
            return self.abort_cycle();
        };
        self.trace.data1 = data_lo;
        self.resolve_pending(data_lo);

        // ── Stage D: address at T32 ───────────────────────────
        let Some(addr) = self.front.read_address() else {
            return self.abort_cycle();
        };
        self.trace.isa_address = addr;
        self.serve_isa(inst, addr);

        // ── Stage E: D32..55 after T32 ────────────────────────
        let Some(data_hi) = self.front.read_data() else {
            return self.abort_cycle();
        };
        self.trace.data2 = data_hi;
        if self.write_pending {
            self.xmem.hi = data_hi & 0x00FF_FFFF;
            self.write_pending = false;
        }
        if let Some((fi1, fi2)) = self.front.read_fi() {
            self.trace.fi1 = fi1;
            self.trace.fi2 = fi2;
        }
        self.end_of_cycle();

        if self.drain_commands(4) {
            return Outcome::Shutdown;
        }
        Outcome::Cycle
    }

    // ── Stage A decode ────────────────────────────────────────

    fn decode(&mut self, inst: u16) {
        let mut decoded = 0u16;
        let mut carry = false;
        self.pending = PendingOp::None;
        self.read_pending = false;

        if inst == INST_READDATA {
            if self.xmem.selected != 0 {
                // low half goes out now, the high half in stage C
                decoded = inst;
                self.front.push_data(self.xmem.lo);
                self.read_pending = true;
            } else if self.settings.is_on(settings::WAND_ENABLED)
                && self.prph_selected == PRPH_WAND
                && self.wand_cached != WAND_NONE
            {
                decoded = inst;
                self.front.push_data(self.wand_cached as u32);
                self.front.push_data(0);
                self.wand_cached = WAND_NONE;
            }
        }

        if self.settings.is_on(settings::PRINTER_ENABLED) {
            let power = self.settings.is_on(settings::PRT_POWER);
            match inst {
                INST_SELP9 => {
                    decoded = inst;
                    self.selected = ActivePeripheral::Printer;
                }
                SELP9_BUSY if self.selected == ActivePeripheral::Printer => {
                    decoded = inst;
                    if power {
                        carry = self.q.print_tx.is_full();
                    }
                    self.selected = ActivePeripheral::None;
                }
                SELP9_POWON if self.selected == ActivePeripheral::Printer => {
                    decoded = inst;
                    carry = power;
                    self.selected = ActivePeripheral::None;
                }
                SELP9_VALID if self.selected == ActivePeripheral::Printer => {
                    decoded = inst;
                    // the status word is always valid while powered
                    carry = power;
                    self.selected = ActivePeripheral::None;
                }
                SELP9_RDPTRN if self.selected == ActivePeripheral::Printer => {
                    decoded = inst;
                    let status = self.printer.read_status();
                    self.front.push_data(0);
                    self.front.push_data((status as u32) << 8);
                }
                SELP9_PRINTC if self.selected == ActivePeripheral::Printer => {
                    decoded = inst;
                    self.pending = PendingOp::PrintChar;
                }
                SELP9_RTNCPU if self.selected == ActivePeripheral::Printer => {
                    decoded = inst;
                    self.selected = ActivePeripheral::None;
                }
                _ => {}
            }
        }

        if self.settings.is_on(settings::HPIL_ENABLED) {
            if inst & SELP_HPIL_MASK == SELP_HPIL {
                decoded = inst;
                self.selected = ActivePeripheral::Hpil(((inst & SELP_REG_MASK) >> 6) as u8);
            } else if let ActivePeripheral::Hpil(reg) = self.selected {
                if inst & (SYNC_BIT | HPIL_READ_MASK) == HPIL_READ {
                    // C=HPIL_p: the register selected by the SELP, not
                    // the bits in this word
                    decoded = inst;
                    let value = self.hpil.read_reg(reg);
                    self.front.push_data(value as u32);
                    self.front.push_data(0);
                } else if inst & (SYNC_BIT | 0x003) == 0x001 {
                    // HPIL_p = literal, deselects
                    decoded = inst;
                    let value = ((inst & 0x3FC) >> 2) as u8;
                    self.hpil_write(reg, value);
                    self.selected = ActivePeripheral::None;
                } else if inst & (SYNC_BIT | 0x003) == 0x003 {
                    // third word of the sequence, control returns to the CPU
                    decoded = inst;
                    self.selected = ActivePeripheral::None;
                }
            }
            if inst & HPIL_WRITE_C_MASK == HPIL_WRITE_C {
                // HPIL_p=C: register byte arrives with DATA
                decoded = inst;
                self.pending = PendingOp::HpilWrite(((inst & SELP_REG_MASK) >> 6) as u8);
            }
        }

        match inst {
            INST_RAMSLCT => {
                decoded = inst;
                self.pending = PendingOp::RamSelect;
            }
            INST_WRITDATA if self.xmem.selected != 0 => {
                decoded = inst;
                self.pending = PendingOp::WriteData;
            }
            INST_PRPHSLCT => {
                decoded = inst;
                self.pending = PendingOp::PrphSelect;
            }
            INST_WROM if self.settings.is_on(settings::QROM_ENABLED) => {
                decoded = inst;
                self.pending = PendingOp::Wrom;
            }
            _ => {}
        }

        if carry {
            self.front.push_carry();
        }
        self.trace.xq_carry = carry;
        self.trace.xq_instr = decoded;
    }

    // ── Stage C deferred actions ──────────────────────────────

    fn resolve_pending(&mut self, data_lo: u32) {
        if self.read_pending {
            self.front.push_data(self.xmem.hi);
            self.read_pending = false;
        }

        match self.pending {
            PendingOp::None => {}
            PendingOp::PrintChar => {
                let byte = self.printer.accept_char((data_lo & 0xFF) as u8);
                self.trace.xq_data = byte as u32;
                // full queue: drop the byte, BUSY reports carry until the
                // drain catches up
                let _ = self.q.print_tx.try_send(byte);
                if self.settings.is_on(settings::IR_DRIVE_ENABLED) {
                    use crate::printer::{ir_frame, ir_payload};
                    self.front.push_ir(ir_frame(ir_payload(byte)));
                }
                self.selected = ActivePeripheral::None;
            }
            PendingOp::RamSelect => {
                let address = (data_lo & 0x3FF) as u16;
                self.trace.xq_data = address as u32;
                self.ram_selected = address;
                self.prph_selected = 0;
                self.xmem.flush(&mut *self.nv);
                if register_exists(address, self.settings.get(settings::XMEM_PAGES)) {
                    self.xmem.select(address, &*self.nv);
                } else {
                    self.xmem.deselect();
                }
            }
            PendingOp::WriteData => {
                self.xmem.lo = data_lo;
                self.write_pending = true;
            }
            PendingOp::PrphSelect => {
                self.prph_selected = (data_lo & 0x3FF) as u16;
                self.trace.xq_data = self.prph_selected as u32;
            }
            PendingOp::Wrom => {
                let addr = ((data_lo >> 12) & 0xFFFF) as u16;
                let word = (data_lo & 0x3FF) as u16;
                if let Err(e) = self.pages.write_rom(addr, word, &mut *self.images) {
                    log::debug!("WROM to {addr:04X} ignored: {e}");
                }
            }
            PendingOp::HpilWrite(reg) => {
                self.hpil_write(reg, (data_lo & 0xFF) as u8);
            }
        }
        self.pending = PendingOp::None;
    }

    // ── Stage D: ROM service + bank switching ─────────────────

    fn serve_isa(&mut self, inst: u16, addr: u16) {
        let page = (addr >> 12) as usize;

        let bank = match inst {
            INST_ENBANK1 => 1,
            INST_ENBANK2 => 2,
            INST_ENBANK3 => 3,
            INST_ENBANK4 => 4,
            _ => 0,
        };
        if bank != 0 {
            self.trace.xq_instr = inst;
            self.pages.apply_enbank(page, bank);
        }

        self.trace.bank = self.pages.resolve_bank(page);
        if let Some(word) = self.pages.read(addr) {
            self.front.push_isa(word);
        }
    }

    // ── Stage E wrap-up ───────────────────────────────────────

    fn end_of_cycle(&mut self) {
        let mut fi_lo = 0;
        let mut fi_hi = 0;

        if self.settings.is_on(settings::WAND_ENABLED) {
            if self.wand_cached == WAND_NONE {
                if let Ok(byte) = self.q.wand_rx.try_recv() {
                    self.wand_cached = byte;
                }
            }
            if self.wand_cached != WAND_NONE {
                fi_lo |= FI_00_PBSY | FI_02_WNDB;
            }
        }

        if self.settings.is_on(settings::HPIL_ENABLED) {
            if let Ok(frame) = self.q.il_in_rx.try_recv() {
                self.trace.frame_in = frame;
                if let Some(out) = self.hpil.process_frame(frame) {
                    self.trace.frame_out = out;
                    let _ = self.q.il_out_tx.try_send(out);
                }
            }
            let (lo, hi) = self.hpil.fi_contribution();
            fi_lo |= lo;
            fi_hi |= hi;
            self.mirror.publish(self.hpil.regs[0], self.hpil.regs[3]);
        }

        self.fi_lo = fi_lo;
        self.fi_hi = fi_hi;

        self.printer.set_buffer_empty(self.q.print_tx.is_empty());
        self.trace.il_regs = self.hpil.regs;
        self.trace.ramslct = self.ram_selected;
        self.push_trace();
    }

    fn hpil_write(&mut self, reg: u8, value: u8) {
        if let Some(frame) = self.hpil.write_reg(reg, value) {
            self.trace.frame_out = frame;
            let _ = self.q.il_out_tx.try_send(frame);
        }
    }

    fn push_trace(&mut self) {
        if self.settings.is_on(settings::TRACER_ENABLED) {
            // never blocks: a stalled drain costs the oldest records and
            // shows up as a cycle-number gap
            self.q.trace.push(self.trace.clone());
        }
    }

    /// A frontend read came back empty mid-cycle (PWO dropped): emit the
    /// partial record and restart the loop.
    fn abort_cycle(&mut self) -> Outcome {
        self.push_trace();
        Outcome::Idle
    }

    // ── PWO-low housekeeping ──────────────────────────────────

    fn idle(&mut self) -> Outcome {
        // bus is quiet: flush dirty state to NvRam
        if self.pages.dirty {
            self.pages.save(&mut *self.nv);
            log::info!("ROM map saved");
        }
        if self.drain_commands(16) {
            return Outcome::Shutdown;
        }
        Outcome::Idle
    }

    fn drain_commands(&mut self, max: usize) -> bool {
        for _ in 0..max {
            match self.q.cmd_rx.try_recv() {
                Ok(cmd) => {
                    if self.apply_command(cmd) {
                        return true;
                    }
                }
                Err(_) => break,
            }
        }
        false
    }

    fn apply_command(&mut self, cmd: EngineCmd) -> bool {
        match cmd {
            EngineCmd::SetSetting(idx, value) => self.settings.set(idx, value),
            EngineCmd::PrinterPower(on) => self.settings.set(settings::PRT_POWER, on as u16),
            EngineCmd::PrinterMode(mode) => {
                self.settings.set(settings::PRT_MODE, mode as u16);
                self.printer.set_mode(mode);
            }
            EngineCmd::PrinterKeyPrint => self.printer.press_print(),
            EngineCmd::PrinterKeyAdv => self.printer.press_adv(),
            EngineCmd::PrinterTogglePaper => {
                self.printer.toggle_paper();
                let paper = self.settings.get(settings::PRT_PAPER) == 0;
                self.settings.set(settings::PRT_PAPER, paper as u16);
            }
            EngineCmd::HpilPlug(on) => {
                self.settings.set(settings::HPIL_ENABLED, on as u16);
                if on {
                    self.hpil.power_up();
                }
                self.mirror.publish(self.hpil.regs[0], self.hpil.regs[3]);
            }
            EngineCmd::SetXmem(n) => self.settings.set(settings::XMEM_PAGES, n.min(2)),
            EngineCmd::SetSticky { page, sticky } => {
                if page < 16 {
                    self.pages.set_sticky(page, sticky);
                }
            }
            EngineCmd::Wake => self.front.wake(),
            EngineCmd::SaveState => {
                if self.require_pwo_low("save") {
                    self.pages.save(&mut *self.nv);
                    self.settings.save(&mut *self.nv);
                }
            }
            EngineCmd::Plug { page, bank, offset } => {
                if self.require_pwo_low("plug") {
                    if let Err(e) = self.pages.plug(page, bank, &*self.images, offset) {
                        self.refuse(&e);
                    }
                }
            }
            EngineCmd::Unplug { page, bank } => {
                if self.require_pwo_low("unplug") {
                    if let Err(e) = self.pages.unplug(page, bank) {
                        self.refuse(&e);
                    }
                }
            }
            EngineCmd::Reserve { page } => {
                if self.require_pwo_low("reserve") {
                    if let Err(e) = self.pages.reserve(page) {
                        self.refuse(&e);
                    }
                }
            }
            EngineCmd::Shutdown => return true,
        }
        false
    }

    fn require_pwo_low(&mut self, what: &str) -> bool {
        if self.pins.pwo() {
            let msg = format!("  cannot {what}: calculator is running (PWO high)\r\n");
            self.console.write_str(&msg);
            false
        } else {
            true
        }
    }

    fn refuse(&mut self, err: &str) {
        self.console.write_str(&format!("  refused: {err}\r\n"));
    }
}
