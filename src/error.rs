//! Error types for icsp-prog

use thiserror::Error;

use crate::adapter::AdapterError;

/// Crate error type
#[derive(Debug, Error)]
pub enum Error {
    /// I/O to the adapter failed.  Fatal to the current script run; the
    /// session proceeds to the exit sequence.
    #[error("transport failure: {0}")]
    Transport(#[from] AdapterError),

    /// A script attempted an illegal TAP or register operation.  Always
    /// fatal, never retried.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// Malformed bytecode: unknown opcode, truncated operand, loop range
    /// escaping the script, or transfer buffer overrun.
    #[error("script fault: {0}")]
    ScriptFault(&'static str),

    /// A bounded poll loop exhausted its iteration count waiting for the
    /// target's programming executive.
    #[error("timed out waiting for the programming executive")]
    Timeout,

    /// The device identification register did not match the expected value.
    #[error("device id {found:#010x} does not match expected {expected:#010x}")]
    IdentityMismatch { expected: u32, found: u32 },

    /// The device did not report a usable status after the entry sequence.
    #[error("cannot enter programming mode, device status {status:#04x}")]
    NotReady { status: u8 },

    /// The device is code protected and must be erased before programming.
    #[error("device is code protected and must be erased first")]
    CodeProtected,

    /// An operation was requested in the wrong session phase.
    #[error("operation out of phase: {0}")]
    Phase(&'static str),
}

pub type Result<T> = core::result::Result<T, Error>;
