//! Tracks which TAP controller and which of its registers the two-wire
//! link currently addresses, and rejects transfers that a script issues
//! out of order.
//!
//! Selection only ever changes through an explicit instruction code; a
//! register selected while no TAP is active, or belonging to the other
//! TAP, is a malformed script and aborts the run.

use crate::error::{Error, Result};

/// Instruction codes accepted by the command register.
pub mod tapcmd {
    /// Switch to the main (vendor) TAP controller.
    pub const SW_MTAP: u8 = 0x04;
    /// Switch to the extended (EJTAG) TAP controller.
    pub const SW_ETAP: u8 = 0x05;
    /// Main TAP: device identification register.
    pub const MTAP_IDCODE: u8 = 0x01;
    /// Main TAP: command register.
    pub const MTAP_COMMAND: u8 = 0x07;
    /// Extended TAP: address register.
    pub const ETAP_ADDRESS: u8 = 0x08;
    /// Extended TAP: data register.
    pub const ETAP_DATA: u8 = 0x09;
    /// Extended TAP: control register.
    pub const ETAP_CONTROL: u8 = 0x0a;
    /// Extended TAP: enter the boot handler on the next reset.
    pub const ETAP_EJTAGBOOT: u8 = 0x0c;
    /// Extended TAP: normal boot on the next reset.
    pub const ETAP_NORMALBOOT: u8 = 0x0d;
    /// Extended TAP: fast-data register.
    pub const ETAP_FASTDATA: u8 = 0x0e;
}

/// Command register payloads.  Opaque to the tracker; listed here for the
/// script tables and the executive.
pub mod mchp {
    /// No operation, return status.
    pub const STATUS: u8 = 0x00;
    /// Assert device reset.
    pub const ASSERT_RST: u8 = 0xd1;
    /// Remove device reset.
    pub const DEASSERT_RST: u8 = 0xd0;
    /// Flash chip erase.
    pub const ERASE: u8 = 0xfc;
    /// Enable access from the CPU to flash.
    pub const FLASH_ENABLE: u8 = 0xfe;
    /// Disable access from the CPU to flash.
    pub const FLASH_DISABLE: u8 = 0xfd;
}

/// Status byte bits returned by the command register.
pub mod mtap_status {
    /// Device is not code protected.
    pub const CPS: u8 = 0x80;
    /// An NVM operation failed.
    pub const NVMERR: u8 = 0x20;
    /// Configuration has been read, `CPS` is valid.
    pub const CFGRDY: u8 = 0x08;
    /// Flash controller busy.
    pub const FCBUSY: u8 = 0x04;
    /// Device reset is active.
    pub const DEVRST: u8 = 0x01;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tap {
    Main,
    Extended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TapReg {
    Idcode,
    Command,
    Address,
    Data,
    Control,
    EjtagBoot,
    NormalBoot,
    FastData,
}

impl TapReg {
    fn decode(code: u8) -> Option<(Tap, TapReg)> {
        use tapcmd::*;
        match code {
            MTAP_IDCODE => Some((Tap::Main, TapReg::Idcode)),
            MTAP_COMMAND => Some((Tap::Main, TapReg::Command)),
            ETAP_ADDRESS => Some((Tap::Extended, TapReg::Address)),
            ETAP_DATA => Some((Tap::Extended, TapReg::Data)),
            ETAP_CONTROL => Some((Tap::Extended, TapReg::Control)),
            ETAP_EJTAGBOOT => Some((Tap::Extended, TapReg::EjtagBoot)),
            ETAP_NORMALBOOT => Some((Tap::Extended, TapReg::NormalBoot)),
            ETAP_FASTDATA => Some((Tap::Extended, TapReg::FastData)),
            _ => None,
        }
    }

    /// Whether the register carries data transfers.
    fn bears_data(self) -> bool {
        !matches!(self, TapReg::EjtagBoot | TapReg::NormalBoot)
    }
}

/// Current TAP and register selection for one session.
#[derive(Clone, Copy, Debug, Default)]
pub struct TapState {
    tap: Option<Tap>,
    reg: Option<TapReg>,
}

impl TapState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tap(&self) -> Option<Tap> {
        self.tap
    }

    pub fn reg(&self) -> Option<TapReg> {
        self.reg
    }

    /// Apply an instruction code.  Returns whether the adapter must be
    /// told, i.e. whether the selection actually changed.
    pub fn apply_ir(&mut self, code: u8) -> Result<bool> {
        match code {
            tapcmd::SW_MTAP => Ok(self.switch_tap(Tap::Main)),
            tapcmd::SW_ETAP => Ok(self.switch_tap(Tap::Extended)),
            _ => {
                let (owner, reg) = TapReg::decode(code)
                    .ok_or(Error::Protocol("unknown instruction code"))?;
                match self.tap {
                    None => Err(Error::Protocol("register selected with no TAP active")),
                    Some(tap) if tap != owner => {
                        Err(Error::Protocol("register does not belong to the active TAP"))
                    }
                    Some(_) => {
                        if self.reg == Some(reg) {
                            Ok(false)
                        } else {
                            self.reg = Some(reg);
                            Ok(true)
                        }
                    }
                }
            }
        }
    }

    fn switch_tap(&mut self, tap: Tap) -> bool {
        if self.tap == Some(tap) {
            false
        } else {
            self.tap = Some(tap);
            self.reg = None;
            true
        }
    }

    /// A mode sequence resets the link state machine: the register latch
    /// is lost, the controller selection survives.
    pub fn set_mode(&mut self) {
        self.reg = None;
    }

    /// A data register transfer is about to run.
    pub fn require_data(&self) -> Result<()> {
        match self.reg {
            Some(reg) if reg.bears_data() => Ok(()),
            _ => Err(Error::Protocol("data transfer with no data register selected")),
        }
    }

    /// A fast-data transfer is about to run.
    pub fn require_fastdata(&self) -> Result<()> {
        if self.reg == Some(TapReg::FastData) {
            Ok(())
        } else {
            Err(Error::Protocol("fast-data transfer with fast-data not selected"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_without_tap_is_a_violation() {
        let mut tap = TapState::new();
        assert!(matches!(
            tap.apply_ir(tapcmd::MTAP_COMMAND),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn reselecting_the_same_tap_is_silent() {
        let mut tap = TapState::new();
        assert!(tap.apply_ir(tapcmd::SW_MTAP).unwrap());
        assert!(!tap.apply_ir(tapcmd::SW_MTAP).unwrap());
        assert!(tap.apply_ir(tapcmd::MTAP_COMMAND).unwrap());
        assert!(!tap.apply_ir(tapcmd::MTAP_COMMAND).unwrap());
    }

    #[test]
    fn switching_taps_drops_the_register() {
        let mut tap = TapState::new();
        tap.apply_ir(tapcmd::SW_MTAP).unwrap();
        tap.apply_ir(tapcmd::MTAP_COMMAND).unwrap();
        tap.apply_ir(tapcmd::SW_ETAP).unwrap();
        assert_eq!(tap.reg(), None);
        assert!(tap.require_data().is_err());
    }

    #[test]
    fn foreign_register_is_a_violation() {
        let mut tap = TapState::new();
        tap.apply_ir(tapcmd::SW_MTAP).unwrap();
        assert!(matches!(
            tap.apply_ir(tapcmd::ETAP_FASTDATA),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn unknown_code_is_a_violation() {
        let mut tap = TapState::new();
        tap.apply_ir(tapcmd::SW_MTAP).unwrap();
        assert!(matches!(tap.apply_ir(0x1f), Err(Error::Protocol(_))));
    }

    #[test]
    fn mode_sequence_keeps_the_tap() {
        let mut tap = TapState::new();
        tap.apply_ir(tapcmd::SW_ETAP).unwrap();
        tap.apply_ir(tapcmd::ETAP_FASTDATA).unwrap();
        tap.set_mode();
        assert_eq!(tap.tap(), Some(Tap::Extended));
        assert!(tap.require_fastdata().is_err());
        // The boot vector command is register-shaped but bears no data.
        tap.apply_ir(tapcmd::ETAP_EJTAGBOOT).unwrap();
        assert!(tap.require_data().is_err());
    }
}
