//! Cartridge loading.
//!
//! Memory bank controllers are out of scope for this core: a cartridge is
//! just its raw bytes, addressed directly by the bus for the unbanked ROM
//! fixed and switchable regions (0x0000-0x7FFF).

use std::fmt;

use crate::primitives::{Byte, Word};


/// A loaded cartridge: its ROM bytes plus the handful of header fields worth
/// surfacing for logging.
pub struct Cartridge {
    rom: Box<[Byte]>,
    title: String,
}

impl Cartridge {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let man_code = bytes.get(0x013F..=0x0142).unwrap_or(&[]);
        let max_title_len = if man_code.iter().any(|b| *b == 0x00) { 15 } else { 11 };

        let title = bytes.get(0x0134..0x0134 + max_title_len)
            .map(|region| {
                let len = region.iter().position(|b| *b == 0x00).unwrap_or(region.len());
                String::from_utf8_lossy(&region[..len]).into_owned()
            })
            .unwrap_or_default();

        let copy: Vec<_> = bytes.iter().cloned().map(Byte::new).collect();
        Self {
            rom: copy.into_boxed_slice(),
            title,
        }
    }

    /// An all-zero ROM. Useful for tests that only care about CPU/memory
    /// behavior up to and including the boot handoff, not actual game code.
    pub fn blank() -> Self {
        Self::from_bytes(&[0u8; 0x8000])
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Loads a byte from the cartridge's ROM, addressed `0x0000..=0x7FFF`.
    /// Addresses past the end of the loaded ROM read back as `0xFF`.
    pub fn load_byte(&self, addr: Word) -> Byte {
        self.rom.get(addr.get() as usize).copied().unwrap_or(Byte::new(0xFF))
    }
}

impl fmt::Debug for Cartridge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Cartridge")
            .field("length", &self.rom.len())
            .field("title", &self.title)
            .finish()
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_title() {
        let mut rom = vec![0u8; 0x0150];
        rom[0x0134..0x0134 + 5].copy_from_slice(b"HELLO");
        let cart = Cartridge::from_bytes(&rom);
        assert_eq!(cart.title(), "HELLO");
    }

    #[test]
    fn reads_past_end_as_ff() {
        let cart = Cartridge::from_bytes(&[0u8; 0x0150]);
        assert_eq!(cart.load_byte(Word::new(0x7FFF)), 0xFF);
    }
}
