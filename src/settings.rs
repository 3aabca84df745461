// Global settings: a fixed vector of 16-bit values mirrored in
// non-volatile RAM.  Indices are mnemonic constants; a magic entry marks
// the vector as initialised so defaults are installed exactly once.

use crate::store::{NvRam, NVRAM_SETTINGS_START};

pub const SETTINGS_COUNT: usize = 100;

/// Value of `INIT_OK` once defaults have been installed.
pub const INIT_MAGIC: u16 = 0x4041;

// ── Peripheral instruction decoding ───────────────────────────

pub const PRINTER_ENABLED: usize = 0; // HP82143A, SELP9 decoded
pub const WAND_ENABLED: usize = 1; // HP82153A
pub const HPIL_ENABLED: usize = 2; // HP82160A
pub const IRPRINTER_ENABLED: usize = 3; // HP82242A
pub const CARDREADER_ENABLED: usize = 4;
pub const TIMER_ENABLED: usize = 5;
pub const QROM_ENABLED: usize = 8; // WROM instruction decoded
pub const ROM_ENABLED: usize = 9;
pub const BANKSWITCH_ENABLED: usize = 10;

// ── Embedded module plugs ─────────────────────────────────────

pub const HPIL_PLUGGED: usize = 15;
pub const ILPRINTER_PLUGGED: usize = 16;
pub const PRINTER_PLUGGED: usize = 17;

// ── Bus output drivers ────────────────────────────────────────

pub const DATA_DRIVE_ENABLED: usize = 20;
pub const ISA_DRIVE_ENABLED: usize = 21;
pub const PWO_DRIVE_ENABLED: usize = 22;
pub const FI_DRIVE_ENABLED: usize = 23;
pub const IR_DRIVE_ENABLED: usize = 24;

// ── Tracer ────────────────────────────────────────────────────

pub const TRACER_ENABLED: usize = 30;
pub const TRACER_ILREGS_ON: usize = 31;
pub const TRACER_DIS_ENABLED: usize = 32;
pub const TRACER_FI_ON: usize = 33;
pub const TRACER_SYSROM_ON: usize = 35;
pub const TRACER_SYSLOOP_ON: usize = 40;
pub const TRACER_ILROMS_ON: usize = 41;

// ── HP-IL scopes ──────────────────────────────────────────────

pub const ILSCOPE_ENABLED: usize = 50;
pub const PILBOX_SCOPE_ENABLED: usize = 51;

// ── Extended memory ───────────────────────────────────────────

/// Number of plugged XMEM modules: 0, 1 or 2.
pub const XMEM_PAGES: usize = 60;

// ── HP82143A printer ──────────────────────────────────────────

/// 0 = MAN, 1 = NORM, 2 = TRACE.
pub const PRT_MODE: usize = 80;
pub const PRT_DELAY: usize = 81;
pub const PRT_PAPER: usize = 82;
pub const PRT_POWER: usize = 83;
pub const PRT_SERIAL: usize = 84;

// ── Device control ────────────────────────────────────────────

pub const INIT_OK: usize = 92;
pub const ACTIVE_SET: usize = 93;
pub const TRACER_MAINBUFFER: usize = 95;
pub const TRACER_PRETRIG: usize = 96;

/// The settings vector.  Owned by the engine thread during normal
/// operation; `save` / `retrieve` hit NvRam and require PWO low, which
/// the caller asserts by only invoking them from the engine idle path.
#[derive(Clone)]
pub struct Settings {
    values: [u16; SETTINGS_COUNT],
}

impl Settings {
    pub fn new() -> Self {
        Self {
            values: [0; SETTINGS_COUNT],
        }
    }

    #[inline]
    pub fn get(&self, idx: usize) -> u16 {
        self.values[idx]
    }

    #[inline]
    pub fn is_on(&self, idx: usize) -> bool {
        self.values[idx] != 0
    }

    #[inline]
    pub fn set(&mut self, idx: usize, value: u16) {
        self.values[idx] = value;
    }

    pub fn is_initialised(&self) -> bool {
        self.values[INIT_OK] == INIT_MAGIC
    }

    /// Install the shipping defaults and persist them.
    pub fn set_default(&mut self, nv: &mut dyn NvRam) {
        self.values = [0; SETTINGS_COUNT];
        self.values[INIT_OK] = INIT_MAGIC;

        // printer ships powered off with no paper loaded
        self.values[PRT_MODE] = 0;
        self.values[PRT_POWER] = 0;
        self.values[PRT_PAPER] = 0;

        self.values[XMEM_PAGES] = 0;

        // tracer on by default, system noise filtered in
        self.values[TRACER_ENABLED] = 1;
        self.values[TRACER_ILREGS_ON] = 1;
        self.values[TRACER_SYSROM_ON] = 1;
        self.values[TRACER_SYSLOOP_ON] = 1;
        self.values[TRACER_ILROMS_ON] = 1;
        self.values[TRACER_MAINBUFFER] = 5000;
        self.values[TRACER_PRETRIG] = 32;

        self.save(nv);
    }

    /// Write the vector to NvRam.  Only call while PWO is low.
    pub fn save(&self, nv: &mut dyn NvRam) {
        let mut buf = [0u8; SETTINGS_COUNT * 2];
        for (i, v) in self.values.iter().enumerate() {
            buf[i * 2..i * 2 + 2].copy_from_slice(&v.to_le_bytes());
        }
        nv.write(NVRAM_SETTINGS_START, &buf);
    }

    /// Read the vector back from NvRam.  Only call while PWO is low.
    pub fn retrieve(&mut self, nv: &dyn NvRam) {
        let mut buf = [0u8; SETTINGS_COUNT * 2];
        nv.read(NVRAM_SETTINGS_START, &mut buf);
        for i in 0..SETTINGS_COUNT {
            self.values[i] = u16::from_le_bytes([buf[i * 2], buf[i * 2 + 1]]);
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemNvRam;

    #[test]
    fn test_defaults_mark_initialised() {
        let mut nv = MemNvRam::new();
        let mut s = Settings::new();
        assert!(!s.is_initialised());
        s.set_default(&mut nv);
        assert!(s.is_initialised());
        assert_eq!(s.get(TRACER_ENABLED), 1);
        assert_eq!(s.get(PRT_POWER), 0);
        assert_eq!(s.get(XMEM_PAGES), 0);
    }

    #[test]
    fn test_save_retrieve_idempotent() {
        let mut nv = MemNvRam::new();
        let mut s = Settings::new();
        s.set_default(&mut nv);
        s.set(XMEM_PAGES, 2);
        s.set(PRT_MODE, 1);
        s.save(&mut nv);

        let mut r1 = Settings::new();
        r1.retrieve(&nv);
        r1.save(&mut nv);
        let mut r2 = Settings::new();
        r2.retrieve(&nv);

        for i in 0..SETTINGS_COUNT {
            assert_eq!(r1.get(i), r2.get(i));
        }
        assert_eq!(r2.get(XMEM_PAGES), 2);
        assert_eq!(r2.get(PRT_MODE), 1);
        assert!(r2.is_initialised());
    }
}
