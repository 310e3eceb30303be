//! Cross-module scenarios that only make sense against the public
//! `Emulator`/`Machine` surface, rather than a single source file.

use dotmatrix::{BootRom, Config, Emulator, Disruption};
use dotmatrix::cartridge::Cartridge;
use dotmatrix::env::{Peripherals, RasterBuffer};
use dotmatrix::error::EmulatorError;

#[derive(Default)]
struct FrameCounter {
    presented: u32,
    fatal: bool,
}

impl Peripherals for FrameCounter {
    fn present(&mut self, _frame: &RasterBuffer) {
        self.presented += 1;
    }

    fn on_fatal(&mut self, _err: EmulatorError) {
        self.fatal = true;
    }
}

fn minimal_emulator() -> Emulator {
    let config = Config { boot_rom: BootRom::Minimal, debug_trace: false };
    Emulator::new(Cartridge::blank(), config)
}

#[test]
fn boot_handoff_is_visible_through_the_public_machine_surface() {
    let mut emulator = minimal_emulator();
    let mut sink = FrameCounter::default();

    emulator.execute_frame(&mut sink).expect("blank cartridge should just spin on NOPs");

    let machine = emulator.machine();
    assert!(!machine.bios_mounted(), "boot overlay should have unmapped itself by frame end");
    assert_eq!(machine.cpu.sp, 0xFFFE);
    assert_eq!(machine.cpu.a, 0x01);
    assert_eq!(machine.cpu.f, 0xB0);
}

#[test]
fn each_frame_presents_exactly_once() {
    let mut emulator = minimal_emulator();
    let mut sink = FrameCounter::default();

    for _ in 0..5 {
        emulator.execute_frame(&mut sink).expect("blank cartridge should just spin on NOPs");
    }

    assert_eq!(sink.presented, 5);
    assert!(!sink.fatal);
}

#[test]
fn frame_loop_reports_unknown_opcode_as_a_fatal_disruption() {
    let mut rom = vec![0u8; 0x8000];
    rom[0x0100] = 0xD3; // unmapped primary opcode
    let cartridge = Cartridge::from_bytes(&rom);

    let config = Config { boot_rom: BootRom::Minimal, debug_trace: false };
    let mut emulator = Emulator::new(cartridge, config);
    let mut sink = FrameCounter::default();

    let result = emulator.execute_frame(&mut sink);

    assert!(matches!(result, Err(Disruption::Terminated)));
    assert!(sink.fatal);
    assert_eq!(sink.presented, 0);
}
