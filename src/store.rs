// Persistent storage seams: the byte-addressable non-volatile RAM (FRAM
// on the cartridge) and the content-addressable ROM image store (on-chip
// flash file chain).  The core reads and writes through these traits only.

use std::sync::{Arc, Mutex};

// ── Non-volatile RAM layout ───────────────────────────────────

pub const NVRAM_SIZE: usize = 0x40000;

pub const NVRAM_INIT_ADDR: usize = 0x00000;
pub const NVRAM_INIT_MAGIC: u16 = 0x4041;
pub const NVRAM_ROMMAP_START: usize = 0x00010;
pub const NVRAM_SETTINGS_START: usize = 0x00100;
/// Legacy settings window kept for compatibility with older images.
pub const NVRAM_SETTINGS_LEGACY: usize = 0x1D000;
pub const NVRAM_XMEM_START: usize = 0x1E000;

/// Byte-addressable persistent RAM.
///
/// The bus to the physical device is shared with the running calculator,
/// so callers may only write while PWO is low; that check belongs to the
/// caller, not to implementations.
pub trait NvRam: Send {
    fn read(&self, offset: usize, buf: &mut [u8]);
    fn write(&mut self, offset: usize, data: &[u8]);

    fn read_u16(&self, offset: usize) -> u16 {
        let mut b = [0u8; 2];
        self.read(offset, &mut b);
        u16::from_le_bytes(b)
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.write(offset, &value.to_le_bytes());
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        self.read(offset, &mut b);
        u32::from_le_bytes(b)
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.write(offset, &value.to_le_bytes());
    }
}

/// RAM-backed NvRam, shareable between the engine thread and the host.
/// Stands in for the SPI FRAM part on the cartridge.
#[derive(Clone)]
pub struct MemNvRam {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemNvRam {
    pub fn new() -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0u8; NVRAM_SIZE])),
        }
    }
}

impl Default for MemNvRam {
    fn default() -> Self {
        Self::new()
    }
}

impl NvRam for MemNvRam {
    fn read(&self, offset: usize, buf: &mut [u8]) {
        let bytes = self.bytes.lock().unwrap();
        let end = (offset + buf.len()).min(bytes.len());
        let n = end.saturating_sub(offset);
        buf[..n].copy_from_slice(&bytes[offset..end]);
    }

    fn write(&mut self, offset: usize, data: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap();
        let end = (offset + data.len()).min(bytes.len());
        let n = end.saturating_sub(offset);
        bytes[offset..end].copy_from_slice(&data[..n]);
    }
}

// ── Image store ───────────────────────────────────────────────

// File type codes in the flash chain.
pub const FILETYPE_MOD1: u8 = 0x01;
pub const FILETYPE_MOD2: u8 = 0x02;
pub const FILETYPE_ROM: u8 = 0x03;
pub const FILETYPE_QROM: u8 = 0x04;
pub const FILETYPE_UMEM: u8 = 0x10;
pub const FILETYPE_MMAP: u8 = 0x20;
pub const FILETYPE_GLOB: u8 = 0x30;
pub const FILETYPE_TRAC: u8 = 0x40;
/// Sentinel marking the start of an initialised chain.
pub const FILETYPE_INIT: u8 = 0x41;
/// Maiden flash / end of chain.
pub const FILETYPE_END: u8 = 0xFF;

pub const META_HEADER_SIZE: usize = 40;

/// 40-byte header in front of every file in the image store chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaHeader {
    pub file_type: u8,
    pub name: String,
    pub size: u32,
    pub next: u32,
}

impl MetaHeader {
    /// Parse a header from raw store bytes.  An all-0xFF block is the
    /// end-of-chain terminator and parses as `FILETYPE_END`.
    pub fn parse(raw: &[u8]) -> Result<Self, String> {
        if raw.len() < META_HEADER_SIZE {
            return Err(format!("image header truncated ({} bytes)", raw.len()));
        }
        let name_bytes = &raw[1..32];
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(31);
        Ok(Self {
            file_type: raw[0],
            name: String::from_utf8_lossy(&name_bytes[..end]).into_owned(),
            size: u32::from_le_bytes([raw[32], raw[33], raw[34], raw[35]]),
            next: u32::from_le_bytes([raw[36], raw[37], raw[38], raw[39]]),
        })
    }

    pub fn encode(&self) -> [u8; META_HEADER_SIZE] {
        let mut out = [0u8; META_HEADER_SIZE];
        out[0] = self.file_type;
        let name = self.name.as_bytes();
        let n = name.len().min(30);
        out[1..1 + n].copy_from_slice(&name[..n]);
        out[32..36].copy_from_slice(&self.size.to_le_bytes());
        out[36..40].copy_from_slice(&self.next.to_le_bytes());
        out
    }
}

/// Content access to plugged ROM images.
///
/// `bytes(offset, len)` returns image content starting right after the
/// meta header of the file at `offset`.  The cycle engine keeps the
/// returned buffer for the lifetime of the plug, so implementations hand
/// out stable copies.
pub trait ImageStore: Send {
    /// Header of the file at `offset`, if any.
    fn header(&self, offset: u32) -> Result<MetaHeader, String>;
    /// Content bytes of the file at `offset`.
    fn content(&self, offset: u32) -> Result<Vec<u8>, String>;
    /// Find a file by name walking the chain.  Returns its offset.
    fn find(&self, name: &str) -> Option<u32>;
    /// Write back one 16-bit word of a RAM-backed (QROM) image.
    fn write_word(&mut self, offset: u32, index: usize, word: u16) -> Result<(), String>;
}

/// In-memory image store used by the host binary and the tests.
pub struct MemImageStore {
    files: Vec<(u32, MetaHeader, Vec<u8>)>,
    next_offset: u32,
}

impl MemImageStore {
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            next_offset: META_HEADER_SIZE as u32,
        }
    }

    /// Add a file, returning its offset in the store.
    pub fn add(&mut self, file_type: u8, name: &str, content: Vec<u8>) -> u32 {
        let offset = self.next_offset;
        let header = MetaHeader {
            file_type,
            name: name.to_string(),
            size: content.len() as u32,
            next: offset + (META_HEADER_SIZE + content.len()) as u32,
        };
        self.next_offset = header.next;
        self.files.push((offset, header, content));
        offset
    }
}

impl Default for MemImageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageStore for MemImageStore {
    fn header(&self, offset: u32) -> Result<MetaHeader, String> {
        self.files
            .iter()
            .find(|(o, _, _)| *o == offset)
            .map(|(_, h, _)| h.clone())
            .ok_or_else(|| format!("no image file at offset 0x{offset:05X}"))
    }

    fn content(&self, offset: u32) -> Result<Vec<u8>, String> {
        self.files
            .iter()
            .find(|(o, _, _)| *o == offset)
            .map(|(_, _, c)| c.clone())
            .ok_or_else(|| format!("no image file at offset 0x{offset:05X}"))
    }

    fn find(&self, name: &str) -> Option<u32> {
        self.files
            .iter()
            .find(|(_, h, _)| h.name == name)
            .map(|(o, _, _)| *o)
    }

    fn write_word(&mut self, offset: u32, index: usize, word: u16) -> Result<(), String> {
        let (_, _, content) = self
            .files
            .iter_mut()
            .find(|(o, _, _)| *o == offset)
            .ok_or_else(|| format!("no image file at offset 0x{offset:05X}"))?;
        let byte = index * 2;
        if byte + 1 >= content.len() {
            return Err(format!("write past end of image (index {index})"));
        }
        // stored big-endian like .ROM files
        content[byte] = (word >> 8) as u8;
        content[byte + 1] = (word & 0xFF) as u8;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nvram_u16_roundtrip() {
        let mut nv = MemNvRam::new();
        nv.write_u16(NVRAM_INIT_ADDR, NVRAM_INIT_MAGIC);
        assert_eq!(nv.read_u16(NVRAM_INIT_ADDR), 0x4041);
    }

    #[test]
    fn test_meta_header_roundtrip() {
        let h = MetaHeader {
            file_type: FILETYPE_ROM,
            name: "PPC ROM".to_string(),
            size: 8192,
            next: 0x2040,
        };
        let parsed = MetaHeader::parse(&h.encode()).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn test_meta_header_truncated() {
        assert!(MetaHeader::parse(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_image_store_find_and_content() {
        let mut store = MemImageStore::new();
        let off = store.add(FILETYPE_ROM, "TEST", vec![0xAB; 16]);
        assert_eq!(store.find("TEST"), Some(off));
        assert_eq!(store.find("OTHER"), None);
        assert_eq!(store.content(off).unwrap().len(), 16);
        assert_eq!(store.header(off).unwrap().file_type, FILETYPE_ROM);
    }

    #[test]
    fn test_image_store_write_word() {
        let mut store = MemImageStore::new();
        let off = store.add(FILETYPE_QROM, "QROM", vec![0u8; 8192]);
        store.write_word(off, 5, 0x3A7).unwrap();
        let content = store.content(off).unwrap();
        assert_eq!(content[10], 0x03);
        assert_eq!(content[11], 0xA7);
        assert!(store.write_word(off, 4096, 0).is_err());
    }
}
