//! PICkit2-class USB programmers.  The pod runs a script engine of its
//! own with the same opcode set, so every primitive maps onto a one or
//! two instruction firmware script sent over the interrupt endpoints.
use std::time::Duration;
use std::vec::Vec;

use log::debug;
use rusb::{DeviceHandle, GlobalContext};

use crate::adapter::{Adapter, AdapterError, Delay, FastData, Line};
use crate::script::op;

const MICROCHIP_VID: u16 = 0x04d8;
const PICKIT2_PID: u16 = 0x0033;

const OUT_EP: u8 = 0x01;
const IN_EP: u8 = 0x81;
const IFACE: u8 = 0;

// Firmware command bytes.
mod cmd {
    pub const GET_VERSION: u8 = 0x76;
    pub const SET_VDD: u8 = 0xa0;
    pub const SET_VPP: u8 = 0xa1;
    pub const READ_STATUS: u8 = 0xa2;
    pub const CLEAR_DOWNLOAD_BUFFER: u8 = 0xa3;
    pub const CLEAR_UPLOAD_BUFFER: u8 = 0xa5;
    pub const EXECUTE_SCRIPT: u8 = 0xa6;
    pub const UPLOAD_DATA: u8 = 0xac;
    pub const END_OF_BUFFER: u8 = 0xad;
}

// Pod power control, not part of the script opcode set.
const SCRIPT_VDD_ON: u8 = 0xff;
const SCRIPT_VDD_OFF: u8 = 0xfe;
const SCRIPT_VDD_GND_ON: u8 = 0xfd;
const SCRIPT_VDD_GND_OFF: u8 = 0xfc;

/// Script engine gave up on the target, e.g. a handshake wait expired.
const STATUS_ICD_TIMEOUT: u16 = 0x1000;

pub struct PicKit {
    device: DeviceHandle<GlobalContext>,
    timeout: Duration,
}

impl PicKit {
    /// Find and claim the first attached pod, read its firmware version
    /// and configure the programming voltages for a 3.3V target.
    pub fn open() -> Result<Self, AdapterError> {
        let mut device = rusb::open_device_with_vid_pid(MICROCHIP_VID, PICKIT2_PID)
            .ok_or(AdapterError::Io("no programmer attached"))?;
        let _ = device.set_auto_detach_kernel_driver(true);
        device.claim_interface(IFACE)?;

        let mut pickit = PicKit { device, timeout: Duration::from_millis(1500) };

        let reply = pickit.command(&[cmd::CLEAR_UPLOAD_BUFFER, cmd::GET_VERSION])?;
        debug!("PICkit2 firmware {}.{}.{}", reply[0], reply[1], reply[2]);

        // 3.3V supply with a 2.81V fault limit, 3.28V on MCLR with a
        // 2.26V fault limit.
        let vdd = ((3.3 * 32.0 + 10.5) as u16) << 6;
        let vdd_limit = ((2.81 / 5.0) * 255.0) as u8;
        pickit.send(&[cmd::SET_VDD, vdd as u8, (vdd >> 8) as u8, vdd_limit])?;
        let vpp = (3.28 * 18.61) as u8;
        let vpp_limit = (2.26 * 18.61) as u8;
        pickit.send(&[cmd::SET_VPP, 0x40, vpp, vpp_limit])?;

        Ok(pickit)
    }

    /// Attach pod power to the board.
    pub fn power_on(&mut self) -> Result<(), AdapterError> {
        self.script(&[SCRIPT_VDD_GND_OFF, SCRIPT_VDD_ON])
    }

    /// Detach pod power from the board.
    pub fn power_off(&mut self) -> Result<(), AdapterError> {
        self.script(&[SCRIPT_VDD_OFF, SCRIPT_VDD_GND_ON])
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), AdapterError> {
        let mut buf = [cmd::END_OF_BUFFER; 64];
        buf[..payload.len()].copy_from_slice(payload);
        let written = self.device.write_interrupt(OUT_EP, &buf, self.timeout)?;
        if written != buf.len() {
            return Err(AdapterError::Io("short usb write"));
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<[u8; 64], AdapterError> {
        let mut buf = [0u8; 64];
        let read = self.device.read_interrupt(IN_EP, &mut buf, self.timeout)?;
        if read != buf.len() {
            return Err(AdapterError::Io("short usb read"));
        }
        Ok(buf)
    }

    fn command(&mut self, payload: &[u8]) -> Result<[u8; 64], AdapterError> {
        self.send(payload)?;
        self.recv()
    }

    /// Run a firmware script with no data coming back.
    fn script(&mut self, script: &[u8]) -> Result<(), AdapterError> {
        let mut payload = Vec::with_capacity(script.len() + 2);
        payload.push(cmd::EXECUTE_SCRIPT);
        payload.push(script.len() as u8);
        payload.extend_from_slice(script);
        self.send(&payload)
    }

    /// Run a firmware script and drain the upload buffer: the first reply
    /// byte is the number of bytes that follow.
    fn script_upload(&mut self, script: &[u8]) -> Result<Vec<u8>, AdapterError> {
        let mut payload = Vec::with_capacity(script.len() + 4);
        payload.push(cmd::CLEAR_DOWNLOAD_BUFFER);
        payload.push(cmd::CLEAR_UPLOAD_BUFFER);
        payload.push(cmd::EXECUTE_SCRIPT);
        payload.push(script.len() as u8);
        payload.extend_from_slice(script);
        self.send(&payload)?;
        let reply = self.command(&[cmd::UPLOAD_DATA])?;
        let len = (reply[0] as usize).min(63);
        Ok(reply[1..1 + len].to_vec())
    }

    fn status(&mut self) -> Result<u16, AdapterError> {
        let reply = self.command(&[cmd::READ_STATUS])?;
        Ok(u16::from_le_bytes([reply[0], reply[1]]))
    }
}

impl Adapter for PicKit {
    fn set_line(&mut self, line: Line, active: bool) -> Result<(), AdapterError> {
        let opcode = match (line, active) {
            (Line::Vpp, true) => op::VPP_ON,
            (Line::Vpp, false) => op::VPP_OFF,
            (Line::VppPwm, true) => op::VPP_PWM_ON,
            (Line::VppPwm, false) => op::VPP_PWM_OFF,
            (Line::MclrGnd, true) => op::MCLR_GND_ON,
            (Line::MclrGnd, false) => op::MCLR_GND_OFF,
            (Line::BusyLed, true) => op::BUSY_LED_ON,
            (Line::BusyLed, false) => op::BUSY_LED_OFF,
        };
        self.script(&[opcode])
    }

    fn set_icsp_pins(&mut self, cfg: u8) -> Result<(), AdapterError> {
        self.script(&[op::SET_ICSP_PINS, cfg])
    }

    fn delay(&mut self, delay: Delay) -> Result<(), AdapterError> {
        match delay {
            Delay::Short(n) => self.script(&[op::DELAY_SHORT, n]),
            Delay::Long(n) => self.script(&[op::DELAY_LONG, n]),
        }
    }

    fn shift_bits(&mut self, value: u32, bits: u8) -> Result<(), AdapterError> {
        if bits % 8 != 0 || bits == 0 || bits > 32 {
            return Err(AdapterError::Io("unsupported literal bit count"));
        }
        let mut script = Vec::with_capacity(bits as usize / 4);
        for i in (0..bits / 8).rev() {
            script.push(op::WRITE_BYTE_LITERAL);
            script.push((value >> (i * 8)) as u8);
        }
        self.script(&script)
    }

    fn set_mode(&mut self, bits: u8, tms: u8) -> Result<(), AdapterError> {
        self.script(&[op::JT2_SETMODE, bits, tms])
    }

    fn send_command(&mut self, ir: u8) -> Result<(), AdapterError> {
        self.script(&[op::JT2_SENDCMD, ir])
    }

    fn xfer_data8(&mut self, data: u8) -> Result<u8, AdapterError> {
        let reply = self.script_upload(&[op::JT2_XFERDATA8_LIT, data])?;
        reply
            .first()
            .copied()
            .ok_or(AdapterError::Io("empty data register reply"))
    }

    fn xfer_data32(&mut self, data: u32) -> Result<u32, AdapterError> {
        let b = data.to_le_bytes();
        let reply = self.script_upload(&[op::JT2_XFERDATA32_LIT, b[0], b[1], b[2], b[3]])?;
        if reply.len() < 4 {
            return Err(AdapterError::Io("empty data register reply"));
        }
        Ok(u32::from_le_bytes([reply[0], reply[1], reply[2], reply[3]]))
    }

    fn xfer_fastdata(&mut self, data: u32) -> Result<FastData, AdapterError> {
        let b = data.to_le_bytes();
        let reply = self.script_upload(&[op::JT2_XFRFASTDAT_LIT, b[0], b[1], b[2], b[3]])?;
        // The firmware aborts the transfer when the target is not ready;
        // an empty upload reports exactly that.
        if reply.len() < 4 {
            return Ok(FastData { pracc: false, data: 0 });
        }
        Ok(FastData {
            pracc: true,
            data: u32::from_le_bytes([reply[0], reply[1], reply[2], reply[3]]),
        })
    }

    fn pe_ready(&mut self) -> Result<bool, AdapterError> {
        self.script(&[op::JT2_WAIT_PE_RESP])?;
        Ok(self.status()? & STATUS_ICD_TIMEOUT == 0)
    }
}

impl Drop for PicKit {
    fn drop(&mut self) {
        let _ = self.device.release_interface(IFACE);
    }
}
