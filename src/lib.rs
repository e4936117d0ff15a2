//! This crate programs the flash of microcontrollers that speak a two-wire
//! JTAG-derived (ICSP) protocol.  The device-specific procedures are not
//! hard-coded: each programming phase is a small bytecode script that the
//! interpreter executes against an adapter, so one binary can drive many
//! parts by loading different script tables.
//!
//! At the lowest level, the `Adapter` trait abstracts the hardware that
//! wiggles the wires, whether a bit-banged GPIO port or a PICkit2-class
//! USB pod.  On top of that, `interp` runs one script at a time, with the
//! `tap` tracker enforcing that register selections and transfers happen
//! in a legal order.  `target` is the high level: it sequences a whole
//! session from entry through identification, erase, page programming,
//! verification and exit, and it guarantees the exit sequence runs no
//! matter how the session went.
//!
//! # Example
//! ```no_run
//! use icsp_prog::adapter::usb::PicKit;
//! use icsp_prog::target::{PagePolicy, Target};
//!
//! let adapter = PicKit::open().unwrap();
//! let mut target = Target::begin(adapter).unwrap();
//! let id = target.identify(None).unwrap();
//! println!("device {:08x}", id);
//!
//! let image = [0u8; 1024];
//! target.erase().unwrap();
//! let reports = target.program(0x1d00_0000, &image, PagePolicy::Continue).unwrap();
//! assert!(reports.iter().all(|r| r.is_ok()));
//! target.end().unwrap();
//! ```

#![no_std]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub mod adapter;
pub mod error;
pub mod interp;
pub mod script;
pub mod tap;
pub mod target;
