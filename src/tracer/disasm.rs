//! Trace-line disassembly for the NUT instruction stream.
//!
//! Class-1 instructions (GO/XQ) are two words on the bus; the first word
//! only announces the class, so its line shows `...` and the second word
//! joins both into the full mnemonic with the 16-bit target.  Words seen
//! without SYNC right after a SELP0..7 are HP-IL register operations and
//! decode as such instead of raw literals.

use super::mnemonics::MNEMONICS;

pub struct Disassembler {
    /// First word of a pending two-word GO/XQ.
    delayed: u16,
    /// Peripheral index after a SELP0..7, -1 when none.
    active_selp: i8,
}

impl Disassembler {
    pub fn new() -> Self {
        Self {
            delayed: 0,
            active_selp: -1,
        }
    }

    /// Disassemble one traced word.  `inst` is the 10-bit opcode.
    pub fn line(&mut self, inst: u16, sync: bool) -> String {
        let inst = inst & 0x3FF;
        if sync {
            if inst & 0x003 == 0x001 {
                // class 1: join with the next word
                self.delayed = inst;
                return "...".to_string();
            }
            let text = MNEMONICS[inst as usize].to_string();
            self.delayed = 0;
            // SELPn arms HP-IL literal decoding, any other SYNC word
            // disarms it
            if inst & 0x03F == 0x024 {
                self.active_selp = ((inst & 0x3C0) >> 6) as i8;
            } else {
                self.active_selp = -1;
            }
            text
        } else if self.delayed & 0x003 == 0x001 {
            // second word of a GO/XQ: condition + type, then the target
            let kind = match inst & 0x003 {
                0x000 => "?NC XQ",
                0x001 => "?C XQ ",
                0x002 => "?NC GO",
                _ => "?C GO ",
            };
            let target = (((inst & 0x3FC) >> 2) << 8) | ((self.delayed & 0x3FC) >> 2);
            self.delayed = 0;
            format!("{kind} {target:04X}")
        } else {
            // a literal: from LDI, peripheral control or FETCH S&X
            let mut text = format!("{inst:03X}");
            if (0..=7).contains(&self.active_selp) {
                match inst & 0x003 {
                    0x001 => {
                        text.push_str(&format!(
                            "  reg {}={:02X}",
                            self.active_selp,
                            (inst & 0x3FC) >> 2
                        ));
                    }
                    0x002 => {
                        text.push_str(&format!("  C[0.1]=reg {}", (inst & 0x1C0) >> 6));
                    }
                    0x003 => text.push_str("  ?PFSET"),
                    _ => {}
                }
            }
            text
        }
    }
}

impl Default for Disassembler {
    fn default() -> Self {
        Self::new()
    }
}

// ── HP-IL frame mnemonics ─────────────────────────────────────

struct IlMnemonic {
    code: u16,
    mask: u16,
    name: &'static str,
}

// Ordered most-specific first; the catch-all class entries close each
// group.  The starred entries are PILBox tunnel commands.
const IL_MNEMONICS: [IlMnemonic; 49] = [
    IlMnemonic { code: 0x000, mask: 0x700, name: "DAB" },
    IlMnemonic { code: 0x100, mask: 0x700, name: "DSR" },
    IlMnemonic { code: 0x200, mask: 0x700, name: "END" },
    IlMnemonic { code: 0x300, mask: 0x700, name: "ESR" },
    IlMnemonic { code: 0x400, mask: 0x7FF, name: "NUL" },
    IlMnemonic { code: 0x401, mask: 0x7FF, name: "GTL" },
    IlMnemonic { code: 0x404, mask: 0x7FF, name: "SDC" },
    IlMnemonic { code: 0x405, mask: 0x7FF, name: "PPD" },
    IlMnemonic { code: 0x408, mask: 0x7FF, name: "GET" },
    IlMnemonic { code: 0x40F, mask: 0x7FF, name: "ELN" },
    IlMnemonic { code: 0x410, mask: 0x7FF, name: "NOP" },
    IlMnemonic { code: 0x411, mask: 0x7FF, name: "LLO" },
    IlMnemonic { code: 0x414, mask: 0x7FF, name: "DCL" },
    IlMnemonic { code: 0x415, mask: 0x7FF, name: "PPU" },
    IlMnemonic { code: 0x418, mask: 0x7FF, name: "EAR" },
    IlMnemonic { code: 0x43F, mask: 0x7FF, name: "UNL" },
    IlMnemonic { code: 0x420, mask: 0x7E0, name: "LAD" },
    IlMnemonic { code: 0x45F, mask: 0x7FF, name: "UNT" },
    IlMnemonic { code: 0x440, mask: 0x7E0, name: "TAD" },
    IlMnemonic { code: 0x460, mask: 0x7E0, name: "SAD" },
    IlMnemonic { code: 0x480, mask: 0x7F0, name: "PPE" },
    IlMnemonic { code: 0x490, mask: 0x7FF, name: "IFC" },
    IlMnemonic { code: 0x492, mask: 0x7FF, name: "REN" },
    IlMnemonic { code: 0x493, mask: 0x7FF, name: "NRE" },
    IlMnemonic { code: 0x494, mask: 0x7FF, name: "*TDIS" },
    IlMnemonic { code: 0x495, mask: 0x7FF, name: "*COFI" },
    IlMnemonic { code: 0x496, mask: 0x7FF, name: "*CON" },
    IlMnemonic { code: 0x497, mask: 0x7FF, name: "*COFF" },
    IlMnemonic { code: 0x49A, mask: 0x7FF, name: "AAU" },
    IlMnemonic { code: 0x49B, mask: 0x7FF, name: "LPD" },
    IlMnemonic { code: 0x4A0, mask: 0x7E0, name: "DDL" },
    IlMnemonic { code: 0x4C0, mask: 0x7E0, name: "DDT" },
    IlMnemonic { code: 0x400, mask: 0x700, name: "CMD" },
    IlMnemonic { code: 0x500, mask: 0x7FF, name: "RFC" },
    IlMnemonic { code: 0x540, mask: 0x7FF, name: "ETO" },
    IlMnemonic { code: 0x541, mask: 0x7FF, name: "ETE" },
    IlMnemonic { code: 0x542, mask: 0x7FF, name: "NRD" },
    IlMnemonic { code: 0x560, mask: 0x7FF, name: "SDA" },
    IlMnemonic { code: 0x561, mask: 0x7FF, name: "SST" },
    IlMnemonic { code: 0x562, mask: 0x7FF, name: "SDI" },
    IlMnemonic { code: 0x563, mask: 0x7FF, name: "SAI" },
    IlMnemonic { code: 0x564, mask: 0x7FF, name: "TCT" },
    IlMnemonic { code: 0x580, mask: 0x7E0, name: "AAD" },
    IlMnemonic { code: 0x5A0, mask: 0x7E0, name: "AEP" },
    IlMnemonic { code: 0x5C0, mask: 0x7E0, name: "AES" },
    IlMnemonic { code: 0x5E0, mask: 0x7E0, name: "AMP" },
    IlMnemonic { code: 0x500, mask: 0x700, name: "RDY" },
    IlMnemonic { code: 0x600, mask: 0x700, name: "IDY" },
    IlMnemonic { code: 0x700, mask: 0x700, name: "ISR" },
];

/// Mnemonic for an 11-bit HP-IL frame.
pub fn il_mnemonic(frame: u16) -> &'static str {
    IL_MNEMONICS
        .iter()
        .find(|m| frame & m.mask == m.code)
        .map(|m| m.name)
        .unwrap_or("???")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_word_mnemonics() {
        let mut d = Disassembler::new();
        assert_eq!(d.line(0x000, true), "NOP");
        assert_eq!(d.line(0x040, true), "WROM");
    }

    #[test]
    fn test_two_word_xq_join() {
        // ?C XQ to 0x1234: low byte in the first word, high in the second
        let mut d = Disassembler::new();
        let w1 = (0x34 << 2) | 0x01;
        let w2 = (0x12 << 2) | 0x01;
        assert_eq!(d.line(w1, true), "...");
        assert_eq!(d.line(w2, false), "?C XQ  1234");
    }

    #[test]
    fn test_two_word_go_variants() {
        let mut d = Disassembler::new();
        d.line(0x001, true);
        assert!(d.line(0x002, false).starts_with("?NC GO"));
        d.line(0x001, true);
        assert!(d.line(0x000, false).starts_with("?NC XQ"));
        d.line(0x001, true);
        assert!(d.line(0x003, false).starts_with("?C GO"));
    }

    #[test]
    fn test_literal_without_pending_class1() {
        let mut d = Disassembler::new();
        d.line(0x000, true); // NOP clears any pending join
        assert_eq!(d.line(0x0AB, false), "0AB");
    }

    #[test]
    fn test_hpil_literal_decode_after_selp() {
        let mut d = Disassembler::new();
        assert_eq!(d.line(0x0A4, true), "SELP 2");
        assert_eq!(d.line(0x0BA, false), "0BA  C[0.1]=reg 2");

        d.line(0x024, true); // SELP 0
        let reg_write = (0x42 << 2) | 0x01;
        assert_eq!(d.line(reg_write, false), format!("{reg_write:03X}  reg 0=42"));

        d.line(0x024, true);
        assert_eq!(d.line(0x003, false), "003  ?PFSET");

        // any SYNC instruction disarms the SELP decode
        d.line(0x000, true);
        assert_eq!(d.line(0x0BA, false), "0BA");
    }

    #[test]
    fn test_il_mnemonics() {
        assert_eq!(il_mnemonic(0x042), "DAB");
        assert_eq!(il_mnemonic(0x490), "IFC");
        assert_eq!(il_mnemonic(0x500), "RFC");
        assert_eq!(il_mnemonic(0x6C0), "IDY");
        assert_eq!(il_mnemonic(0x494), "*TDIS");
        assert_eq!(il_mnemonic(0x43F), "UNL");
        assert_eq!(il_mnemonic(0x420 | 5), "LAD");
    }
}
