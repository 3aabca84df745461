// Bus frontend seam.  On the cartridge the PIO state machines sample
// SYNC/ISA/DATA/CLK/FI and drive ISA-out, DATA-out, FI-OE and IR with
// phase-exact timing; the cycle engine only ever sees their FIFOs.  This
// trait is that FIFO contract, with a full in-process simulator for the
// host build and the tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// PWO/SYNC pin state, readable from the service loop as well.
#[derive(Clone)]
pub struct PowerPins {
    pwo: Arc<AtomicBool>,
    sync: Arc<AtomicBool>,
}

impl PowerPins {
    pub fn new() -> Self {
        Self {
            pwo: Arc::new(AtomicBool::new(false)),
            sync: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pwo(&self) -> bool {
        self.pwo.load(Ordering::Relaxed)
    }

    pub fn sync(&self) -> bool {
        self.sync.load(Ordering::Relaxed)
    }

    pub fn set_pwo(&self, high: bool) {
        self.pwo.store(high, Ordering::Relaxed);
    }

    pub fn set_sync(&self, high: bool) {
        self.sync.store(high, Ordering::Relaxed);
    }
}

impl Default for PowerPins {
    fn default() -> Self {
        Self::new()
    }
}

/// FIFO seam between the bus sampler/driver blocks and the cycle engine.
///
/// The blocking reads are the engine's phase synchronisation: each
/// returns `None` instead of a word when PWO drops, and the engine must
/// then run its power-down path rather than stall.
pub trait BusFrontend: Send {
    fn pins(&self) -> PowerPins;

    /// Instruction word at T54: SYNC in bit 11, opcode in bits 9..0.
    fn read_instruction(&mut self) -> Option<u16>;
    /// ISA address, available from T30.
    fn read_address(&mut self) -> Option<u16>;
    /// Next word from the DATA sampler: D0..31, then D32..55 (aligned).
    fn read_data(&mut self) -> Option<u32>;
    /// FI sampler words for this cycle, when the hardware captures them.
    fn read_fi(&mut self) -> Option<(u32, u32)>;
    /// Discard a stale DATA word left over from the FI phase window.
    fn drain_spurious_data(&mut self);

    /// Queue a 10-bit word for the ISA driver's output window.
    fn push_isa(&mut self, word: u16);
    /// Force the carry bit during the carry window.
    fn push_carry(&mut self);
    /// Queue one DATA output word (two per 56-bit register).
    fn push_data(&mut self, word: u32);
    /// FI-OE pattern for the next cycle.
    fn push_fi(&mut self, lo: u32, hi: u32);
    /// 27-symbol IR frame, left-aligned.
    fn push_ir(&mut self, frame: u32);

    /// Drive ISA high long enough to wake the calculator.
    fn wake(&mut self);
    /// PWO edge: restart the sampler state machines, flush all FIFOs.
    fn reset(&mut self);
}

// ── Simulator ─────────────────────────────────────────────────

#[derive(Default)]
struct SimState {
    instr: VecDeque<u16>,
    addr: VecDeque<u16>,
    data: VecDeque<u32>,
    fi: VecDeque<(u32, u32)>,
    spurious: VecDeque<u32>,

    isa_out: Vec<u16>,
    carry_out: u32,
    data_out: Vec<u32>,
    fi_out: Vec<(u32, u32)>,
    ir_out: Vec<u32>,
    wakes: u32,
    resets: u32,
}

/// Scripted stand-in for the PIO blocks.  Tests feed whole bus cycles
/// and inspect everything the engine drove back.
#[derive(Clone)]
pub struct SimFrontend {
    pins: PowerPins,
    state: Arc<Mutex<SimState>>,
}

impl SimFrontend {
    pub fn new() -> Self {
        Self {
            pins: PowerPins::new(),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Script one full bus cycle worth of sampler words.
    pub fn feed_cycle(&self, instr: u16, addr: u16, data_lo: u32, data_hi: u32) {
        let mut st = self.state.lock().unwrap();
        st.instr.push_back(instr);
        st.addr.push_back(addr);
        st.data.push_back(data_lo);
        st.data.push_back(data_hi);
        st.fi.push_back((0xFFFF_FFFF, 0x00FF_FFFF));
        self.pins.set_pwo(true);
    }

    pub fn power(&self, pwo: bool, sync: bool) {
        self.pins.set_pwo(pwo);
        self.pins.set_sync(sync);
    }

    pub fn has_pending_input(&self) -> bool {
        !self.state.lock().unwrap().instr.is_empty()
    }

    pub fn take_isa_out(&self) -> Vec<u16> {
        std::mem::take(&mut self.state.lock().unwrap().isa_out)
    }

    pub fn take_data_out(&self) -> Vec<u32> {
        std::mem::take(&mut self.state.lock().unwrap().data_out)
    }

    pub fn take_fi_out(&self) -> Vec<(u32, u32)> {
        std::mem::take(&mut self.state.lock().unwrap().fi_out)
    }

    pub fn take_ir_out(&self) -> Vec<u32> {
        std::mem::take(&mut self.state.lock().unwrap().ir_out)
    }

    pub fn carry_count(&self) -> u32 {
        self.state.lock().unwrap().carry_out
    }

    pub fn reset_count(&self) -> u32 {
        self.state.lock().unwrap().resets
    }

    pub fn wake_count(&self) -> u32 {
        self.state.lock().unwrap().wakes
    }
}

impl Default for SimFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl BusFrontend for SimFrontend {
    fn pins(&self) -> PowerPins {
        self.pins.clone()
    }

    fn read_instruction(&mut self) -> Option<u16> {
        self.state.lock().unwrap().instr.pop_front()
    }

    fn read_address(&mut self) -> Option<u16> {
        self.state.lock().unwrap().addr.pop_front()
    }

    fn read_data(&mut self) -> Option<u32> {
        self.state.lock().unwrap().data.pop_front()
    }

    fn read_fi(&mut self) -> Option<(u32, u32)> {
        self.state.lock().unwrap().fi.pop_front()
    }

    fn drain_spurious_data(&mut self) {
        self.state.lock().unwrap().spurious.pop_front();
    }

    fn push_isa(&mut self, word: u16) {
        self.state.lock().unwrap().isa_out.push(word);
    }

    fn push_carry(&mut self) {
        self.state.lock().unwrap().carry_out += 1;
    }

    fn push_data(&mut self, word: u32) {
        self.state.lock().unwrap().data_out.push(word);
    }

    fn push_fi(&mut self, lo: u32, hi: u32) {
        self.state.lock().unwrap().fi_out.push((lo, hi));
    }

    fn push_ir(&mut self, frame: u32) {
        self.state.lock().unwrap().ir_out.push(frame);
    }

    fn wake(&mut self) {
        self.state.lock().unwrap().wakes += 1;
    }

    fn reset(&mut self) {
        let mut st = self.state.lock().unwrap();
        st.instr.clear();
        st.addr.clear();
        st.data.clear();
        st.fi.clear();
        st.spurious.clear();
        st.resets += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_fifo_order() {
        let sim = SimFrontend::new();
        sim.feed_cycle(0x900, 0x8123, 0x1111, 0x22);
        let mut front = sim.clone();
        assert_eq!(front.read_instruction(), Some(0x900));
        assert_eq!(front.read_data(), Some(0x1111));
        assert_eq!(front.read_address(), Some(0x8123));
        assert_eq!(front.read_data(), Some(0x22));
        assert_eq!(front.read_instruction(), None);
    }

    #[test]
    fn test_sim_reset_flushes() {
        let sim = SimFrontend::new();
        sim.feed_cycle(0x900, 0x8123, 0, 0);
        let mut front = sim.clone();
        front.reset();
        assert_eq!(front.read_instruction(), None);
        assert_eq!(sim.reset_count(), 1);
    }

    #[test]
    fn test_sim_captures_outputs() {
        let sim = SimFrontend::new();
        let mut front = sim.clone();
        front.push_isa(0x3A7);
        front.push_carry();
        front.push_data(0x42);
        front.push_fi(1, 2);
        assert_eq!(sim.take_isa_out(), vec![0x3A7]);
        assert_eq!(sim.carry_count(), 1);
        assert_eq!(sim.take_data_out(), vec![0x42]);
        assert_eq!(sim.take_fi_out(), vec![(1, 2)]);
    }
}
