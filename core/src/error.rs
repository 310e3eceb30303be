//! Error types surfaced by the core.

use thiserror::Error;

use crate::primitives::{Byte, Word};


/// Fatal errors that can stop emulation.
#[derive(Debug, Clone, Copy, Error)]
pub enum EmulatorError {
    /// The CPU fetched an opcode with no defined instruction.
    #[error("unknown opcode 0x{:02x} at 0x{:04x}", .opcode.get(), .at.get())]
    UnknownOpcode {
        opcode: Byte,
        at: Word,
    },

    /// A `STOP` instruction was executed. This core does not implement
    /// low-power mode, so emulation cannot continue meaningfully.
    #[error("CPU executed STOP at 0x{:04x}", .at.get())]
    CpuStopped {
        at: Word,
    },
}
