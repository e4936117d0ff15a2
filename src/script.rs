//! Script bytecode: opcode set, storage format and the built-in script
//! table for PIC32-class devices.
//!
//! A script is a sequence of records `(opcode: 1 byte, operands: fixed
//! count)`.  There is no per-instruction length prefix; the operand count
//! is determined by the opcode, so the decoder validates against a closed
//! opcode set and rejects anything it does not know.  Scripts are
//! concatenated into one blob and located through an index of
//! `(id, byte offset, instruction count)` entries.

use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::tap::{mchp, tapcmd};

/// Opcode byte values of the storage format.
pub mod op {
    pub const VPP_ON: u8 = 0xfb;
    pub const VPP_OFF: u8 = 0xfa;
    pub const VPP_PWM_ON: u8 = 0xf9;
    pub const VPP_PWM_OFF: u8 = 0xf8;
    pub const MCLR_GND_ON: u8 = 0xf7;
    pub const MCLR_GND_OFF: u8 = 0xf6;
    pub const BUSY_LED_ON: u8 = 0xf5;
    pub const BUSY_LED_OFF: u8 = 0xf4;
    pub const SET_ICSP_PINS: u8 = 0xf3;
    pub const WRITE_BYTE_LITERAL: u8 = 0xf2;
    pub const LOOP: u8 = 0xe9;
    pub const DELAY_LONG: u8 = 0xe8;
    pub const DELAY_SHORT: u8 = 0xe7;
    pub const JT2_SETMODE: u8 = 0xbc;
    pub const JT2_SENDCMD: u8 = 0xbb;
    pub const JT2_XFERDATA8_LIT: u8 = 0xba;
    pub const JT2_XFERDATA32_LIT: u8 = 0xb9;
    pub const JT2_XFRFASTDAT_LIT: u8 = 0xb8;
    pub const JT2_XFRFASTDAT_BUF: u8 = 0xb7;
    pub const JT2_GET_PE_RESP: u8 = 0xb5;
    pub const JT2_WAIT_PE_RESP: u8 = 0xb4;
}

/// Operand byte count for a known opcode, `None` for anything else.
pub fn arity(opcode: u8) -> Option<usize> {
    use op::*;
    match opcode {
        VPP_ON | VPP_OFF | VPP_PWM_ON | VPP_PWM_OFF | MCLR_GND_ON | MCLR_GND_OFF
        | BUSY_LED_ON | BUSY_LED_OFF | JT2_XFRFASTDAT_BUF | JT2_GET_PE_RESP
        | JT2_WAIT_PE_RESP => Some(0),
        SET_ICSP_PINS | WRITE_BYTE_LITERAL | DELAY_LONG | DELAY_SHORT | JT2_SENDCMD
        | JT2_XFERDATA8_LIT => Some(1),
        LOOP | JT2_SETMODE => Some(2),
        JT2_XFERDATA32_LIT | JT2_XFRFASTDAT_LIT => Some(4),
        _ => None,
    }
}

/// One decoded instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    VppOn,
    VppOff,
    VppPwmOn,
    VppPwmOff,
    MclrGndOn,
    MclrGndOff,
    BusyLedOn,
    BusyLedOff,
    SetIcspPins(u8),
    WriteByteLiteral(u8),
    DelayShort(u8),
    DelayLong(u8),
    /// Re-enter the preceding `back` instructions `count` more times.
    Loop { back: u8, count: u8 },
    /// Clock `bits` TMS values (pattern LSB first) to move the link
    /// state machine.
    SetMode { bits: u8, tms: u8 },
    SendCmd(u8),
    XferData8(u8),
    XferData32(u32),
    XferFastDataLit(u32),
    XferFastDataBuf,
    WaitPeResp,
    GetPeResp,
}

/// Symbolic purpose of a stored script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptId {
    /// Enter programming mode and read the device status byte.
    ProgEntry,
    /// Leave the device in a safe electrical state.
    ProgExit,
    /// Read the 32-bit device identification register.
    ReadDevId,
    /// Download the programming executive environment: reset sequencing
    /// and flash access enable.
    SerialExec,
    /// Bulk erase, including the erase cycle delay.
    EraseChip,
    /// Send the row-program command and target address.
    ProgMemWrPrep,
    /// Transfer one page of data and collect the response.
    ProgMemWr,
    /// Read one page of memory back.
    ProgMemRd,
}

/// An immutable, validated instruction sequence.
#[derive(Clone, Debug)]
pub struct Script {
    id: ScriptId,
    ops: Vec<Op>,
}

impl Script {
    pub fn id(&self) -> ScriptId {
        self.id
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Index record locating one script inside a blob.
#[derive(Clone, Copy, Debug)]
pub struct ScriptEntry {
    pub id: ScriptId,
    pub offset: usize,
    pub count: usize,
}

/// Decode `count` instructions starting at the head of `bytes`.
///
/// Returns the decoded sequence and the number of bytes consumed.
fn decode(bytes: &[u8], count: usize) -> Result<(Vec<Op>, usize)> {
    let mut ops = Vec::with_capacity(count);
    let mut at = 0;

    for idx in 0..count {
        let opcode = *bytes.get(at).ok_or(Error::ScriptFault("script truncated"))?;
        let arity = arity(opcode).ok_or(Error::ScriptFault("unknown opcode"))?;
        let rest = bytes
            .get(at + 1..at + 1 + arity)
            .ok_or(Error::ScriptFault("truncated operand"))?;
        at += 1 + arity;

        let op = match opcode {
            op::VPP_ON => Op::VppOn,
            op::VPP_OFF => Op::VppOff,
            op::VPP_PWM_ON => Op::VppPwmOn,
            op::VPP_PWM_OFF => Op::VppPwmOff,
            op::MCLR_GND_ON => Op::MclrGndOn,
            op::MCLR_GND_OFF => Op::MclrGndOff,
            op::BUSY_LED_ON => Op::BusyLedOn,
            op::BUSY_LED_OFF => Op::BusyLedOff,
            op::SET_ICSP_PINS => Op::SetIcspPins(rest[0]),
            op::WRITE_BYTE_LITERAL => Op::WriteByteLiteral(rest[0]),
            op::DELAY_SHORT => Op::DelayShort(rest[0]),
            op::DELAY_LONG => Op::DelayLong(rest[0]),
            op::LOOP => {
                let back = rest[0];
                if back == 0 || back as usize > idx {
                    return Err(Error::ScriptFault("loop range escapes script"));
                }
                Op::Loop { back, count: rest[1] }
            }
            op::JT2_SETMODE => Op::SetMode { bits: rest[0], tms: rest[1] },
            op::JT2_SENDCMD => Op::SendCmd(rest[0]),
            op::JT2_XFERDATA8_LIT => Op::XferData8(rest[0]),
            op::JT2_XFERDATA32_LIT => {
                Op::XferData32(u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]))
            }
            op::JT2_XFRFASTDAT_LIT => {
                Op::XferFastDataLit(u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]))
            }
            op::JT2_XFRFASTDAT_BUF => Op::XferFastDataBuf,
            op::JT2_WAIT_PE_RESP => Op::WaitPeResp,
            op::JT2_GET_PE_RESP => Op::GetPeResp,
            _ => unreachable!(),
        };
        ops.push(op);
    }

    Ok((ops, at))
}

/// Count whole instructions in `bytes`, rejecting unknown opcodes and
/// trailing partial records.
fn count_instructions(bytes: &[u8]) -> Result<usize> {
    let mut at = 0;
    let mut count = 0;
    while at < bytes.len() {
        let arity = arity(bytes[at]).ok_or(Error::ScriptFault("unknown opcode"))?;
        at += 1 + arity;
        count += 1;
    }
    if at != bytes.len() {
        return Err(Error::ScriptFault("truncated operand"));
    }
    Ok(count)
}

/// The set of scripts available to one programming session.  Loaded once,
/// never mutated afterwards.
#[derive(Clone, Debug)]
pub struct ScriptTable {
    scripts: Vec<Script>,
}

impl ScriptTable {
    /// Validate and decode every indexed script out of `blob`.
    pub fn load(blob: &[u8], index: &[ScriptEntry]) -> Result<Self> {
        let mut scripts = Vec::with_capacity(index.len());
        for entry in index {
            let bytes = blob
                .get(entry.offset..)
                .ok_or(Error::ScriptFault("script offset out of range"))?;
            let (ops, _) = decode(bytes, entry.count)?;
            scripts.push(Script { id: entry.id, ops });
        }
        Ok(ScriptTable { scripts })
    }

    pub fn get(&self, id: ScriptId) -> Option<&Script> {
        self.scripts.iter().find(|s| s.id == id)
    }

    /// The built-in script set for PIC32-class devices.
    pub fn pic32() -> Self {
        let parts: [(ScriptId, &[u8]); 8] = [
            (ScriptId::ProgEntry, PROG_ENTRY),
            (ScriptId::ProgExit, PROG_EXIT),
            (ScriptId::ReadDevId, READ_DEVID),
            (ScriptId::SerialExec, SERIAL_EXEC),
            (ScriptId::EraseChip, ERASE_CHIP),
            (ScriptId::ProgMemWrPrep, PROGMEM_WR_PREP),
            (ScriptId::ProgMemWr, PROGMEM_WR),
            (ScriptId::ProgMemRd, PROGMEM_RD),
        ];

        let mut blob = Vec::new();
        let mut index = Vec::with_capacity(parts.len());
        for (id, bytes) in parts {
            let count = count_instructions(bytes).expect("built-in script");
            index.push(ScriptEntry { id, offset: blob.len(), count });
            blob.extend_from_slice(bytes);
        }
        Self::load(&blob, &index).expect("built-in script")
    }
}

// Enter programming mode: power sequencing, the 32-bit entry key clocked
// in byte-wise while the device is held in reset, then a status query
// through the main TAP command register.
const PROG_ENTRY: &[u8] = &[
    op::VPP_OFF,
    op::MCLR_GND_ON,
    op::VPP_PWM_ON,
    op::BUSY_LED_ON,
    op::SET_ICSP_PINS, 0x00,
    op::DELAY_LONG, 20,
    op::MCLR_GND_OFF,
    op::VPP_ON,
    op::DELAY_SHORT, 23,
    op::VPP_OFF,
    op::MCLR_GND_ON,
    op::DELAY_SHORT, 47,
    op::WRITE_BYTE_LITERAL, 0xb2,
    op::WRITE_BYTE_LITERAL, 0xc2,
    op::WRITE_BYTE_LITERAL, 0x12,
    op::WRITE_BYTE_LITERAL, 0x0a,
    op::MCLR_GND_OFF,
    op::VPP_ON,
    op::DELAY_LONG, 2,
    op::SET_ICSP_PINS, 0x02,
    op::JT2_SETMODE, 6, 0x1f,
    op::JT2_SENDCMD, tapcmd::SW_MTAP,
    op::JT2_SENDCMD, tapcmd::MTAP_COMMAND,
    op::JT2_XFERDATA8_LIT, mchp::STATUS,
];

// Leave programming mode: link reset, voltages off, pins released, reset
// released last.
const PROG_EXIT: &[u8] = &[
    op::JT2_SETMODE, 5, 0x1f,
    op::VPP_OFF,
    op::MCLR_GND_ON,
    op::VPP_PWM_OFF,
    op::SET_ICSP_PINS, 0x06,
    op::SET_ICSP_PINS, 0x02,
    op::SET_ICSP_PINS, 0x03,
    op::DELAY_LONG, 10,
    op::BUSY_LED_OFF,
    op::MCLR_GND_OFF,
];

const READ_DEVID: &[u8] = &[
    op::JT2_SENDCMD, tapcmd::SW_MTAP,
    op::JT2_SENDCMD, tapcmd::MTAP_IDCODE,
    op::JT2_XFERDATA32_LIT, 0x00, 0x00, 0x00, 0x00,
];

// Put the device into serial execution: reset it through the command
// register, arm the boot vector on the extended TAP, then release reset
// and enable flash access.  Leaves the extended TAP selected.
const SERIAL_EXEC: &[u8] = &[
    op::JT2_SENDCMD, tapcmd::SW_MTAP,
    op::JT2_SENDCMD, tapcmd::MTAP_COMMAND,
    op::JT2_XFERDATA8_LIT, mchp::STATUS,
    op::JT2_SENDCMD, tapcmd::SW_MTAP,
    op::JT2_SENDCMD, tapcmd::MTAP_COMMAND,
    op::JT2_XFERDATA8_LIT, mchp::ASSERT_RST,
    op::JT2_SENDCMD, tapcmd::SW_ETAP,
    op::JT2_SETMODE, 6, 0x1f,
    op::JT2_SENDCMD, tapcmd::ETAP_EJTAGBOOT,
    op::JT2_SENDCMD, tapcmd::SW_MTAP,
    op::JT2_SENDCMD, tapcmd::MTAP_COMMAND,
    op::JT2_XFERDATA8_LIT, mchp::DEASSERT_RST,
    op::JT2_XFERDATA8_LIT, mchp::FLASH_ENABLE,
    op::JT2_SENDCMD, tapcmd::SW_ETAP,
    op::JT2_SETMODE, 6, 0x1f,
];

const ERASE_CHIP: &[u8] = &[
    op::JT2_SENDCMD, tapcmd::SW_MTAP,
    op::JT2_SENDCMD, tapcmd::MTAP_COMMAND,
    op::JT2_XFERDATA8_LIT, mchp::ERASE,
    op::DELAY_LONG, 74,
];

// Row-program setup: two words from the transfer buffer, the executive
// command and the row address.
const PROGMEM_WR_PREP: &[u8] = &[
    op::JT2_SENDCMD, tapcmd::ETAP_FASTDATA,
    op::JT2_XFRFASTDAT_BUF,
    op::LOOP, 1, 1,
];

// One page of payload from the transfer buffer, then poll for the
// executive's completion response.
const PROGMEM_WR: &[u8] = &[
    op::JT2_XFRFASTDAT_BUF,
    op::LOOP, 1, 63,
    op::JT2_WAIT_PE_RESP,
    op::JT2_GET_PE_RESP,
    op::LOOP, 2, 31,
];

// Page read: command and address out, wait for the executive, then drain
// one page of response words.
const PROGMEM_RD: &[u8] = &[
    op::JT2_SENDCMD, tapcmd::ETAP_FASTDATA,
    op::JT2_XFRFASTDAT_LIT, 0x40, 0x00, 0x01, 0x00,
    op::JT2_XFRFASTDAT_BUF,
    op::JT2_WAIT_PE_RESP,
    op::LOOP, 1, 31,
    op::JT2_GET_PE_RESP,
    op::LOOP, 1, 63,
];
