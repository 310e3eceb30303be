//! Dotmatrix: a Sharp LR35902 ("Game Boy") core.
//!
//! This crate implements the CPU interpreter, memory bus, pixel processing
//! unit and timer of the handheld. Host windowing, audio and cartridge
//! bank-switching live outside this crate; see the `demo` binary for a
//! minimal host.

use crate::{
    env::Peripherals,
    cartridge::Cartridge,
    error::EmulatorError,
    machine::{
        Machine,
        ppu::Mode,
    },
    primitives::CYCLES_PER_FRAME,
    log::*,
};


pub mod cartridge;
pub mod env;
pub mod error;
pub mod instr;
pub mod log;
pub mod machine;
pub mod primitives;


/// Width of the screen in pixels.
pub const SCREEN_WIDTH: usize = 160;

/// Height of the screen in pixels.
pub const SCREEN_HEIGHT: usize = 144;


/// Which boot ROM to mount at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootRom {
    /// The original boot ROM, including the scrolling logo.
    Original,

    /// Skips straight to the post-boot register state, saving time in tests
    /// and headless tools.
    Minimal,
}

/// Knobs that do not change during the lifetime of an `Emulator`.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Which boot ROM to mount.
    pub boot_rom: BootRom,

    /// When set, every instruction is logged at `trace` level before it is
    /// executed.
    pub debug_trace: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            boot_rom: BootRom::Original,
            debug_trace: false,
        }
    }
}


pub struct Emulator {
    machine: Machine,
    debug_trace: bool,
}

impl Emulator {
    pub fn new(cartridge: Cartridge, config: Config) -> Self {
        info!("Creating emulator");

        Self {
            machine: Machine::new(cartridge, config.boot_rom),
            debug_trace: config.debug_trace,
        }
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Executes until the end of one frame (in most cases exactly
    /// `CYCLES_PER_FRAME` cycles).
    ///
    /// After this returns `Ok(())`, the emulator has presented exactly one
    /// frame through `peripherals.present`.
    #[inline(never)]
    pub fn execute_frame(
        &mut self,
        peripherals: &mut impl Peripherals,
    ) -> Result<(), Disruption> {
        let mut cycles = 0;
        loop {
            if self.debug_trace {
                self.machine.trace_next_instruction();
            }

            let cycles_spent = self.machine.step().map_err(|e| {
                error!("fatal error, emulation stopped: {}", e);
                peripherals.on_fatal(e);
                Disruption::Terminated
            })?;

            let vblank_before = self.machine.ppu().regs().mode() == Mode::VBlank;
            for _ in 0..cycles_spent {
                self.machine.timer_step();
                self.machine.ppu_step();
            }

            if !vblank_before && self.machine.ppu().regs().mode() == Mode::VBlank {
                peripherals.present(self.machine.ppu().raster_buffer());
                break;
            }

            // Fallback for the pathological case where the LCD is disabled
            // and V-Blank is never entered; avoids spending unbounded time
            // in this method.
            cycles += cycles_spent as u64;
            if cycles >= CYCLES_PER_FRAME {
                break;
            }
        }

        Ok(())
    }
}


/// Describes the special situation when the emulator stops unexpectedly.
#[derive(Debug)]
pub enum Disruption {
    /// The emulation was terminated because of a fatal error. The emulator
    /// cannot be resumed in any useful way.
    Terminated,
}

impl From<EmulatorError> for Disruption {
    fn from(_: EmulatorError) -> Self {
        Disruption::Terminated
    }
}
