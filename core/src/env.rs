//! The seam between this core and a host.
//!
//! A host implements [`Peripherals`] and passes it to
//! [`Emulator::execute_frame`](crate::Emulator::execute_frame). The core
//! never touches a window, an audio device or a keyboard directly.

use crate::{SCREEN_WIDTH, SCREEN_HEIGHT, error::EmulatorError};


/// One RGBA frame, row-major, top-left origin, eight bits per channel, alpha
/// always 255.
pub type RasterBuffer = [u8; SCREEN_WIDTH * SCREEN_HEIGHT * 4];

pub trait Peripherals {
    /// Called once per frame, right after V-Blank is entered.
    fn present(&mut self, frame: &RasterBuffer);

    /// Called when the CPU hits a fatal error and emulation stops.
    ///
    /// The default implementation does nothing beyond what `Emulator`
    /// already logs.
    #[allow(unused_variables)]
    fn on_fatal(&mut self, err: EmulatorError) {}
}
