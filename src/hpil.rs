//! HP-82160A HP-IL module emulation: the device-side register file and
//! the frame-reception state machine.
//!
//! Nine byte registers, numbered as the CPU addresses them after a
//! SELP0..7.  R1 has separate read/write views: the read view (R1R,
//! `regs[1]`) carries the receive flags, the write view (R1W, `regs[8]`)
//! carries FLGENB and the outgoing control bits.  Modelled after the
//! register semantics of the real module as observed through V41.

use crate::hp41::*;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

// ── R0 (status) bits ──────────────────────────────────────────

pub const R0_SC: u8 = 0x80;
pub const R0_CA: u8 = 0x40; // controller active
pub const R0_TA: u8 = 0x20; // talker active
pub const R0_LA: u8 = 0x10; // listener active
pub const R0_CLIFCR: u8 = 0x02;
pub const R0_MCL: u8 = 0x01;

// ── R1 read view (R1R) bits ───────────────────────────────────

pub const R1_ORAV: u8 = 0x01;
pub const R1_FRNS: u8 = 0x02;
pub const R1_FRAV: u8 = 0x04;
pub const R1_SRQR: u8 = 0x08;
pub const R1_IFCR: u8 = 0x10;
pub const R1_CO: u8 = 0xE0; // control bits of the received frame

// ── R1 write view (R1W = regs[8]) bits ────────────────────────

pub const R1W_FLGENB: u8 = 0x01;
pub const R1W_CO: u8 = 0xE0;

/// AutoIDY enable lives in R3.
pub const R3_AUTO_IDY: u8 = 0x40;

pub struct Hpil {
    pub regs: [u8; 9],
    /// Low byte comparison source for echo detection (talker active).
    pub last_sent: u16,
    in_transfer: bool,
}

impl Hpil {
    pub fn new() -> Self {
        let mut il = Self {
            regs: [0; 9],
            last_sent: 0,
            in_transfer: false,
        };
        il.power_up();
        il
    }

    /// Register state for hot plugging, as the module powers up.
    pub fn power_up(&mut self) {
        self.regs = [0; 9];
        self.regs[0] = R0_SC | R0_MCL;
        self.regs[4] = 0x01; // selected loop address
        self.regs[5] = 0x01; // current device number
        self.regs[6] = 0x01; // starting device number
        self.last_sent = 0;
        self.in_transfer = false;
    }

    /// CPU write to register `reg` (0..7).  Returns an outgoing frame
    /// when the write composes one (R2 = data register).
    pub fn write_reg(&mut self, reg: u8, value: u8) -> Option<u16> {
        match reg {
            0 => {
                if value & R0_MCL != 0 {
                    // master clear: receive flags drop, output ready
                    self.regs[1] = (self.regs[1] & R1_CO) | R1_ORAV;
                    self.regs[8] &= !R1W_FLGENB;
                    self.in_transfer = false;
                }
                if value & R0_CLIFCR != 0 {
                    self.regs[1] &= !R1_IFCR;
                }
                // MCL and CLIFCR are self-clearing
                self.regs[0] = value & 0xF9;
                None
            }
            1 => {
                self.regs[8] = value;
                None
            }
            2 => {
                // compose the frame from the byte plus the CO bits of R1W;
                // R2 itself keeps showing the last received frame
                let frame = value as u16 | ((self.regs[8] & R1W_CO) as u16) << 3;
                self.regs[1] &= !(R1_FRAV | R1_FRNS | R1_ORAV);
                self.last_sent = frame;
                self.in_transfer = true;
                Some(frame)
            }
            r if (r as usize) < self.regs.len() => {
                self.regs[r as usize] = value;
                None
            }
            _ => None,
        }
    }

    /// CPU read of register `reg` (0..7).  Reading R2 consumes the
    /// received frame: FRAV/FRNS clear and the frame's control bits are
    /// copied into the write view.
    pub fn read_reg(&mut self, reg: u8) -> u8 {
        if reg == 2 {
            let pending = self.regs[1] & (R1_FRAV | R1_FRNS);
            self.regs[1] &= !(R1_FRAV | R1_FRNS);
            if pending != 0 {
                self.regs[8] = (self.regs[8] & !R1W_CO) | (self.regs[1] & R1_CO);
            }
        }
        self.regs[reg as usize]
    }

    pub fn in_transfer(&self) -> bool {
        self.in_transfer
    }

    /// Process one incoming 11-bit frame.  Updates the receive flags per
    /// frame class and the TA/LA/CA state; returns a frame to retransmit
    /// when the module is neither talker nor listener (loop-through).
    pub fn process_frame(&mut self, frame: u16) -> Option<u16> {
        let r0 = self.regs[0];
        let scope = (r0 & (R0_TA | R0_LA)) == (R0_TA | R0_LA);
        let mut retransmit = None;

        if frame & 0x400 == 0 {
            // DOE
            if r0 & R0_LA != 0 {
                self.regs[1] |= R1_FRAV | R1_ORAV;
            } else if r0 & R0_TA != 0 {
                if (self.last_sent ^ frame) & 0xFF != 0 {
                    self.regs[1] |= R1_FRNS | R1_ORAV;
                } else {
                    self.regs[1] |= R1_ORAV;
                }
            } else {
                retransmit = Some(frame);
            }
            self.set_srqr(frame & 0x100 != 0);
        } else if frame & 0x200 != 0 {
            // IDY
            if scope {
                self.regs[1] |= R1_FRAV | R1_ORAV;
            } else {
                self.regs[1] |= R1_ORAV;
            }
            self.set_srqr(frame & 0x100 != 0);
        } else if frame & 0x100 == 0 {
            // CMD
            if scope {
                self.regs[1] |= R1_FRAV | R1_ORAV;
            } else if self.last_sent == frame {
                self.regs[1] |= R1_ORAV;
            } else {
                self.regs[1] |= R1_FRNS | R1_ORAV;
            }
            if frame == IL_FRAME_IFC {
                self.regs[1] |= R1_IFCR;
            }
        } else {
            // RDY
            if scope || frame & 0xC0 == 0x40 {
                // scope mode, or an ARG frame carrying data
                self.regs[1] |= R1_FRAV | R1_ORAV;
            } else if self.last_sent == frame {
                self.regs[1] |= R1_ORAV;
            } else {
                self.regs[1] |= R1_FRNS | R1_ORAV;
            }
        }

        if self.regs[1] & (R1_FRAV | R1_FRNS) != 0 {
            // frame lands in R2, control bits in R1R
            self.regs[2] = frame as u8;
            self.regs[1] = (self.regs[1] & 0x1F) | ((frame & 0x700) >> 3) as u8;
        }

        retransmit
    }

    fn set_srqr(&mut self, on: bool) {
        if on {
            self.regs[1] |= R1_SRQR;
        } else {
            self.regs[1] &= !R1_SRQR;
        }
    }

    /// FI nibbles to assert next cycle.  Flags only reach FI while
    /// FLGENB is set in R1W.
    pub fn fi_contribution(&self) -> (u32, u32) {
        if self.regs[8] & R1W_FLGENB == 0 {
            return (0, 0);
        }
        let r1 = self.regs[1];
        let mut lo = 0;
        let mut hi = 0;
        if r1 & R1_ORAV != 0 {
            hi |= FI_10_ORAV;
        }
        if r1 & R1_FRNS != 0 {
            hi |= FI_09_FRNS;
        }
        if r1 & R1_FRAV != 0 {
            hi |= FI_08_FRAV;
        }
        if r1 & R1_SRQR != 0 {
            lo |= FI_07_SRQR;
        }
        if r1 & R1_IFCR != 0 {
            lo |= FI_06_IFCR;
        }
        (lo, hi)
    }
}

impl Default for Hpil {
    fn default() -> Self {
        Self::new()
    }
}

// ── Cross-thread mirror ───────────────────────────────────────

/// Atomic snapshot of R0 and R3 for the service loop: the AutoIDY timer
/// and the CMD/RFC handshake need CA and the AutoIDY enable without
/// reaching into engine-owned registers.
pub struct IlMirror {
    r0: AtomicU8,
    r3: AtomicU8,
}

impl IlMirror {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            r0: AtomicU8::new(0),
            r3: AtomicU8::new(0),
        })
    }

    pub fn publish(&self, r0: u8, r3: u8) {
        self.r0.store(r0, Ordering::Relaxed);
        self.r3.store(r3, Ordering::Relaxed);
    }

    pub fn controller_active(&self) -> bool {
        self.r0.load(Ordering::Relaxed) & R0_CA != 0
    }

    pub fn auto_idy_enabled(&self) -> bool {
        self.r3.load(Ordering::Relaxed) & R3_AUTO_IDY != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_up_registers() {
        let il = Hpil::new();
        assert_eq!(il.regs[0], 0x81);
        assert_eq!(il.regs[4], 0x01);
        assert_eq!(il.regs[5], 0x01);
        assert_eq!(il.regs[6], 0x01);
    }

    #[test]
    fn test_master_clear() {
        let mut il = Hpil::new();
        // pretend a frame with all control bits was received
        il.regs[1] = R1_CO | R1_FRAV | R1_FRNS | R1_IFCR;
        il.regs[8] = R1W_FLGENB | 0x40;
        il.write_reg(2, 0x11); // start a transfer
        assert!(il.in_transfer());

        il.write_reg(0, R0_MCL);
        assert_eq!(il.regs[1], 0xE1, "flags reset, ORAV set, CO kept");
        assert_eq!(il.regs[8] & R1W_FLGENB, 0);
        assert!(!il.in_transfer());
        assert_eq!(il.regs[0], 0x01);

        // a fresh DOE frame is processed as a new transfer
        il.regs[0] = R0_LA;
        il.process_frame(0x042);
        assert_ne!(il.regs[1] & R1_FRAV, 0);
        assert_eq!(il.regs[2], 0x42);
    }

    #[test]
    fn test_clifcr() {
        let mut il = Hpil::new();
        il.regs[1] |= R1_IFCR;
        il.write_reg(0, R0_CLIFCR);
        assert_eq!(il.regs[1] & R1_IFCR, 0);
    }

    #[test]
    fn test_data_write_composes_frame() {
        let mut il = Hpil::new();
        il.write_reg(1, 0xE0); // all CO bits in R1W
        let frame = il.write_reg(2, 0x42).unwrap();
        assert_eq!(frame, 0x742);
        assert_eq!(il.last_sent, 0x742);
        assert_eq!(il.regs[1] & (R1_FRAV | R1_FRNS | R1_ORAV), 0);

        il.write_reg(1, 0x00);
        assert_eq!(il.write_reg(2, 0x42), Some(0x042));
    }

    #[test]
    fn test_doe_listener() {
        let mut il = Hpil::new();
        il.regs[0] = R0_LA;
        assert_eq!(il.process_frame(0x123), None);
        assert_ne!(il.regs[1] & R1_FRAV, 0);
        assert_ne!(il.regs[1] & R1_ORAV, 0);
        // SRQ bit of the frame lands in SRQR
        assert_ne!(il.regs[1] & R1_SRQR, 0);
        assert_eq!(il.regs[2], 0x23);
        assert_eq!(il.regs[1] & R1_CO, ((0x123 & 0x700) >> 3) as u8);
    }

    #[test]
    fn test_doe_talker_echo() {
        let mut il = Hpil::new();
        il.regs[0] = R0_TA;
        il.last_sent = 0x042;
        il.process_frame(0x042);
        assert_eq!(il.regs[1] & R1_FRNS, 0);
        assert_ne!(il.regs[1] & R1_ORAV, 0);

        il.process_frame(0x043);
        assert_ne!(il.regs[1] & R1_FRNS, 0);
    }

    #[test]
    fn test_doe_loop_through() {
        let mut il = Hpil::new();
        il.regs[0] = 0;
        assert_eq!(il.process_frame(0x055), Some(0x055));
        assert_eq!(il.regs[1] & R1_FRAV, 0);
    }

    #[test]
    fn test_ifc_sets_ifcr() {
        let mut il = Hpil::new();
        il.regs[0] = 0;
        il.process_frame(IL_FRAME_IFC);
        assert_ne!(il.regs[1] & R1_IFCR, 0);
    }

    #[test]
    fn test_scope_mode_accepts_cmd() {
        let mut il = Hpil::new();
        il.regs[0] = R0_TA | R0_LA;
        il.process_frame(0x43F); // UNL
        assert_ne!(il.regs[1] & R1_FRAV, 0);
    }

    #[test]
    fn test_rdy_arg_frame() {
        let mut il = Hpil::new();
        il.regs[0] = 0;
        il.process_frame(IL_FRAME_RFC); // not an ARG, not an echo
        assert_eq!(il.regs[1] & R1_FRAV, 0);
        assert_ne!(il.regs[1] & R1_FRNS, 0);
        il.regs[1] = 0;
        il.process_frame(0x560); // SDA, (frame & 0xC0) == 0x40
        assert_ne!(il.regs[1] & R1_FRAV, 0);
    }

    #[test]
    fn test_read_r2_consumes_frame() {
        let mut il = Hpil::new();
        il.regs[0] = R0_LA;
        il.process_frame(0x242); // DOE with one control bit set
        let before_co = il.regs[1] & R1_CO;
        assert_eq!(before_co, 0x40);
        let val = il.read_reg(2);
        assert_eq!(val, il.regs[2]);
        assert_eq!(il.regs[1] & (R1_FRAV | R1_FRNS), 0);
        assert_eq!(il.regs[8] & R1W_CO, before_co);
    }

    #[test]
    fn test_fi_contribution_gated_by_flgenb() {
        let mut il = Hpil::new();
        il.regs[1] = R1_ORAV | R1_FRAV | R1_SRQR;
        assert_eq!(il.fi_contribution(), (0, 0));

        il.regs[8] |= R1W_FLGENB;
        let (lo, hi) = il.fi_contribution();
        assert_eq!(lo, FI_07_SRQR);
        assert_eq!(hi, FI_10_ORAV | FI_08_FRAV);
    }

    #[test]
    fn test_mirror() {
        let mirror = IlMirror::new();
        assert!(!mirror.controller_active());
        mirror.publish(R0_CA, R3_AUTO_IDY);
        assert!(mirror.controller_active());
        assert!(mirror.auto_idy_enabled());
    }
}
