use crate::{
    BootRom,
    primitives::{Byte, Word, Memory},
    cartridge::Cartridge,
    instr::{INSTRUCTIONS, PREFIXED_INSTRUCTIONS},
    log::*,
};
use self::{
    cpu::Cpu,
    ppu::Ppu,
    interrupt::{InterruptController, Interrupt},
    input::InputController,
    timer::Timer,
};


#[macro_use]
mod macros;

pub mod cpu;
mod mm;
pub mod ppu;
mod step;
mod interrupt;
pub mod input;
mod timer;


/// The real DMG boot ROM: scrolls the Nintendo logo down from the cartridge
/// header, checks it against the fixed logo bitmap and the header checksum,
/// plays the startup chime's visual cue, then hands off to the cartridge at
/// 0x0100.
const DMG_BOOT_ROM: [u8; 256] = [
    0x31, 0xFE, 0xFF, 0xAF, 0x21, 0xFF, 0x9F, 0x32, 0xCB, 0x7C, 0x20, 0xFB, 0x21, 0x26, 0xFF, 0x0E,
    0x11, 0x3E, 0x80, 0x32, 0xE2, 0x0C, 0x3E, 0xF3, 0xE2, 0x32, 0x3E, 0x77, 0x77, 0x3E, 0xFC, 0xE0,
    0x47, 0x11, 0x04, 0x01, 0x21, 0x10, 0x80, 0x1A, 0xCD, 0x95, 0x00, 0xCD, 0x96, 0x00, 0x13, 0x7B,
    0xFE, 0x34, 0x20, 0xF3, 0x11, 0xD8, 0x00, 0x06, 0x08, 0x1A, 0x13, 0x22, 0x23, 0x05, 0x20, 0xF9,
    0x3E, 0x19, 0xEA, 0x10, 0x99, 0x21, 0x2F, 0x99, 0x0E, 0x0C, 0x3D, 0x28, 0x08, 0x32, 0x0D, 0x20,
    0xF9, 0x2E, 0x0F, 0x18, 0xF3, 0x67, 0x3E, 0x64, 0x57, 0xE0, 0x42, 0x3E, 0x91, 0xE0, 0x40, 0x04,
    0x1E, 0x02, 0x0E, 0x0C, 0xF0, 0x44, 0xFE, 0x90, 0x20, 0xFA, 0x0D, 0x20, 0xF7, 0x1D, 0x20, 0xF2,
    0x0E, 0x13, 0x24, 0x7C, 0x1E, 0x83, 0xFE, 0x62, 0x28, 0x06, 0x1E, 0xC1, 0xFE, 0x64, 0x20, 0x06,
    0x7B, 0xE2, 0x0C, 0x3E, 0x87, 0xE2, 0xF0, 0x42, 0x90, 0xE0, 0x42, 0x15, 0x20, 0xD2, 0x05, 0x20,
    0x4F, 0x16, 0x20, 0x18, 0xCB, 0x4F, 0x06, 0x04, 0xC5, 0xCB, 0x11, 0x17, 0xC1, 0xCB, 0x11, 0x17,
    0x05, 0x20, 0xF5, 0x22, 0x23, 0x22, 0x23, 0xC9, 0xCE, 0xED, 0x66, 0x66, 0xCC, 0x0D, 0x00, 0x0B,
    0x03, 0x73, 0x00, 0x83, 0x00, 0x0C, 0x00, 0x0D, 0x00, 0x08, 0x11, 0x1F, 0x88, 0x89, 0x00, 0x0E,
    0xDC, 0xCC, 0x6E, 0xE6, 0xDD, 0xDD, 0xD9, 0x99, 0xBB, 0xBB, 0x67, 0x63, 0x6E, 0x0E, 0xEC, 0xCC,
    0xDD, 0xDC, 0x99, 0x9F, 0xBB, 0xB9, 0x33, 0x3E, 0x3C, 0x42, 0xB9, 0xA5, 0xB9, 0xA5, 0x42, 0x3C,
    0x21, 0x04, 0x01, 0x11, 0xA8, 0x00, 0x1A, 0x13, 0xBE, 0x20, 0xFE, 0x23, 0x7D, 0xFE, 0x34, 0x20,
    0xF5, 0x06, 0x19, 0x78, 0x86, 0x23, 0x05, 0x20, 0xFB, 0x86, 0x20, 0xFE, 0x3E, 0x01, 0xE0, 0x50,
];

/// A trimmed-down boot sequence that skips the logo scroll and checksum
/// check. It only sets up the documented post-boot register state, then
/// pads out with NOPs and unmaps itself as the very last instruction, so
/// (just like the real ROM) execution runs off the end of the overlay
/// straight into the cartridge at 0x0100 instead of needing an explicit
/// jump. Useful for tests and the demo crate.
///
/// ```text
/// LD   SP, 0xFFFE
/// LD   HL, 0x01B0   ; pushed/popped through AF; POP AF clears F's low nibble
/// PUSH HL
/// POP  AF
/// LD   HL, 0x014D
/// LD   D,  0x00
/// LD   E,  0xD8
/// LD   B,  0x00
/// LD   C,  0x13
/// LD   A,  0x01
/// ... NOP padding ...
/// LDH  (0x50), A    ; unmap boot ROM; PC falls through to 0x0100 next
/// ```
const MINIMAL_BOOT_ROM_PROLOGUE: [u8; 21] = [
    0x31, 0xFE, 0xFF,
    0x21, 0xB0, 0x01,
    0xE5,
    0xF1,
    0x21, 0x4D, 0x01,
    0x16, 0x00,
    0x1E, 0xD8,
    0x06, 0x00,
    0x0E, 0x13,
    0x3E, 0x01,
];
const MINIMAL_BOOT_ROM_EPILOGUE: [u8; 2] = [0xE0, 0x50]; // LDH (0x50), A

fn minimal_boot_rom() -> [u8; 256] {
    let mut rom = [0u8; 256]; // NOP (0x00) is the filler between prologue and epilogue
    rom[..MINIMAL_BOOT_ROM_PROLOGUE.len()].copy_from_slice(&MINIMAL_BOOT_ROM_PROLOGUE);
    rom[256 - MINIMAL_BOOT_ROM_EPILOGUE.len()..].copy_from_slice(&MINIMAL_BOOT_ROM_EPILOGUE);
    rom
}


pub struct Machine {
    pub cpu: Cpu,

    pub cartridge: Cartridge,

    pub bios: Memory,
    pub eram: Memory,
    pub wram: Memory,
    pub io: Memory,

    pub ppu: Ppu,
    pub(crate) timer: Timer,

    pub hram: Memory,


    pub(crate) interrupt_controller: InterruptController,
    pub(crate) input_controller: InputController,

    /// Because the EI instruction enables the interrupts during the next cycle we have to store
    /// the request for doing this. This is the purpose of this variable.
    pub enable_interrupts_next_step: bool,

    // TODO: HALT bug is not implemented, matching the documented scope here:
    // a halted CPU with IME off and a pending interrupt resumes normally
    // instead of re-executing the following instruction twice.

    /// Indicates if the machine is in HALT mode. This mode can be exited in three ways:
    ///
    /// IME is set to true
    ///     1. The CPU jumps to the next enabled and requested interrupt
    ///
    /// IME is set to false
    ///     2. (IE & IF & 0x1F) == 0 -> The CPU resumes to normal, when an enabled interrupt is
    ///                                 requested but doesn't jump to the ISR.
    pub halt: bool,
}

impl Machine {
    pub(crate) fn new(cartridge: Cartridge, boot_rom: BootRom) -> Self {
        let bios_bytes = match boot_rom {
            BootRom::Original => DMG_BOOT_ROM,
            BootRom::Minimal => minimal_boot_rom(),
        };

        Self {
            cpu: Cpu::new(),
            cartridge,
            bios: Memory::from_bytes(&bios_bytes),
            eram: Memory::zeroed(Word::new(0x2000)),
            wram: Memory::zeroed(Word::new(0x2000)),
            ppu: Ppu::new(),
            timer: Timer::new(),
            io: Memory::zeroed(Word::new(0x80)),
            hram: Memory::zeroed(Word::new(0x7F)),
            interrupt_controller: InterruptController::new(),
            input_controller: InputController::new(),
            enable_interrupts_next_step: false,
            halt: false,
        }
    }

    pub fn interrupt_controller(&self) -> &InterruptController {
        &self.interrupt_controller
    }

    pub fn ppu(&self) -> &Ppu {
        &self.ppu
    }

    pub fn load_word(&self, addr: Word) -> Word {
        let lsb = self.load_byte(addr);
        let msb = self.load_byte(addr + 1u16);

        Word::from_bytes(lsb, msb)
    }

    pub fn store_word(&mut self, addr: Word, word: Word) {
        let (lsb, msb) = word.into_bytes();
        self.store_byte(addr, lsb);
        self.store_byte(addr + 1u16, msb);
    }

    /// Returns whether the boot ROM overlay is still mapped into
    /// `0x0000..0x0100`.
    pub fn bios_mounted(&self) -> bool {
        (self.load_byte(Word::new(0xFF50)).get() & 0b0000_0001) == 0
    }

    /// Convenience method to load the value, which is stored behind the adress in HL.
    pub fn load_hl(&self) -> Byte {
        self.load_byte(self.cpu.hl())
    }

    /// Convenience method to store a value, to the adress in HL.
    pub fn store_hl(&mut self, byte: Byte) {
        self.store_byte(self.cpu.hl(), byte);
    }

    /// Pushes the given word onto the stack.
    pub fn push(&mut self, word: Word) {
        self.cpu.sp -= 2u16;
        self.store_word(self.cpu.sp, word);
    }

    /// Pops the topmost word from the stack and returns it.
    pub fn pop(&mut self) -> Word {
        let val = self.load_word(self.cpu.sp);
        self.cpu.sp += 2u16;
        val
    }

    /// Advances the timer by one machine cycle.
    pub(crate) fn timer_step(&mut self) {
        self.timer.step(&mut self.interrupt_controller);
    }

    /// Advances the PPU by one machine cycle.
    pub(crate) fn ppu_step(&mut self) {
        self.ppu.step(&mut self.interrupt_controller);
    }

    /// Logs the instruction about to be executed, without advancing any
    /// state. Used by `Config::debug_trace`.
    pub(crate) fn trace_next_instruction(&self) {
        let pc = self.cpu.pc;
        let op_code = self.load_byte(pc);

        let mnemonic = if op_code.get() == 0xCB {
            let sub_op = self.load_byte(pc + 1u16);
            PREFIXED_INSTRUCTIONS[sub_op].mnemonic
        } else {
            match &INSTRUCTIONS[op_code] {
                Some(instr) => instr.mnemonic,
                None => "???",
            }
        };

        trace!(
            "{:04x}: {:02x} ({})  a={:02x} f={:02x} bc={:04x} de={:04x} hl={:04x} sp={:04x}",
            pc.get(), op_code.get(), mnemonic,
            self.cpu.a.get(), self.cpu.f.get(),
            self.cpu.bc().get(), self.cpu.de().get(), self.cpu.hl().get(),
            self.cpu.sp.get(),
        );
    }

    /// Jumps to the interrupt service routine of the given interrupt and returns the number
    /// of clocks used for the jump.
    pub(crate) fn isr(&mut self, interrupt: Interrupt) -> u8 {
        // push pc onto stack
        self.push(self.cpu.pc);

        // jump to address
        self.cpu.pc = interrupt.addr();

        // reset interrupts
        self.interrupt_controller.ime = false;
        self.interrupt_controller.reset_interrupt_flag(interrupt);

        // It takes 20 clocks to dispatch a normal interrupt + 4 clocks when returning
        // from HALT mode.
        if self.halt {
            // Exit HALT mode if we are in it
            self.halt = false;
            24
        } else {
            20
        }
    }
}
