//! Implementations for different ICSP hardware adapters live here.  Hardware
//! adapters should implement the `Adapter` trait.
//!
//! The trait captures the primitive operations a two-wire programming link
//! needs: named control lines, two fixed delay granularities, raw bit and
//! byte shifts, 5-bit command register writes, full-duplex data register
//! transfers and the fast-data path used for bulk page moves.
use thiserror::Error;

pub mod gpio;
#[cfg(feature = "std")]
pub mod usb;

/// Named control lines of the programming interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Line {
    /// Programming voltage on MCLR.
    Vpp,
    /// Charge-pump drive for the programming voltage.
    VppPwm,
    /// Ground the MCLR pin, holding the device in reset.
    MclrGnd,
    /// Activity indicator.
    BusyLed,
}

/// The two delay granularities of the script engine.  The unit durations
/// are adapter constants, the operand scales them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delay {
    Short(u8),
    Long(u8),
}

/// Result of one fast-data register transfer.  `pracc` reflects the
/// target's handshake bit; `data` is whatever was shifted out while the
/// word went in.
#[derive(Clone, Copy, Debug)]
pub struct FastData {
    pub pracc: bool,
    pub data: u32,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter I/O error: {0}")]
    Io(&'static str),
    #[error("adapter disconnected")]
    Disconnected,
    #[cfg(feature = "std")]
    #[error("usb transfer failed: {0}")]
    Usb(#[from] rusb::Error),
}

pub trait Adapter {
    /// Drive a named control line.  `active` means the line's function is
    /// engaged (e.g. `MclrGnd` active pulls MCLR to ground).
    fn set_line(&mut self, line: Line, active: bool) -> Result<(), AdapterError>;

    /// Set the clock/data pin configuration as an immediate bit pattern:
    /// bit 0 clock level, bit 1 clock direction (1 = input), bit 2 data
    /// level, bit 3 data direction.
    fn set_icsp_pins(&mut self, cfg: u8) -> Result<(), AdapterError>;

    /// Block for a scaled short or long interval.
    fn delay(&mut self, delay: Delay) -> Result<(), AdapterError>;

    /// Shift `bits` literal bits onto the data line, MSB first, with the
    /// mode line held low.
    fn shift_bits(&mut self, value: u32, bits: u8) -> Result<(), AdapterError>;

    /// Shift one literal byte, MSB first.
    fn shift_byte(&mut self, value: u8) -> Result<(), AdapterError> {
        self.shift_bits(value as u32, 8)
    }

    /// Clock out `bits` TMS values (LSB first) to move the link state
    /// machine, e.g. `(6, 0x1f)` for a reset-to-idle sequence.
    fn set_mode(&mut self, bits: u8, tms: u8) -> Result<(), AdapterError>;

    /// Write a 5-bit instruction code into the command register.
    fn send_command(&mut self, ir: u8) -> Result<(), AdapterError>;

    /// Full-duplex 8-bit data register transfer.
    fn xfer_data8(&mut self, data: u8) -> Result<u8, AdapterError>;

    /// Full-duplex 32-bit data register transfer.
    fn xfer_data32(&mut self, data: u32) -> Result<u32, AdapterError>;

    /// One word through the fast-data register, returning the handshake
    /// bit along with the read-back word.
    fn xfer_fastdata(&mut self, data: u32) -> Result<FastData, AdapterError>;

    /// Probe whether the target's programming executive signals ready.
    fn pe_ready(&mut self) -> Result<bool, AdapterError>;
}
