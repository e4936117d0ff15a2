//! Bit-banged two-wire adapter over `embedded-hal` pins.  The data pin is
//! split into an output and an input half so the port works with plain
//! push-pull GPIO wired through a series resistor.
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin, PinState};

use crate::adapter::{Adapter, AdapterError, Delay, FastData, Line};

// Delay operand units.
const SHORT_UNIT_US: u32 = 43;
const LONG_UNIT_US: u32 = 5460;

fn pin_err<E>(_: E) -> AdapterError {
    AdapterError::Io("pin access failed")
}

pub struct Gpio<Clk, Do, Di, Mclr, Vpp, Pwm, Led, D>
where
    Clk: OutputPin,
    Do: OutputPin,
    Di: InputPin,
    Mclr: OutputPin,
    Vpp: OutputPin,
    Pwm: OutputPin,
    Led: OutputPin,
    D: DelayNs,
{
    half_period: u32,
    delay: D,
    clock: Clk,
    data_out: Do,
    data_in: Di,
    mclr: Mclr,
    vpp: Vpp,
    pwm: Pwm,
    led: Led,
}

impl<Clk, Do, Di, Mclr, Vpp, Pwm, Led, D> Gpio<Clk, Do, Di, Mclr, Vpp, Pwm, Led, D>
where
    Clk: OutputPin,
    Do: OutputPin,
    Di: InputPin,
    Mclr: OutputPin,
    Vpp: OutputPin,
    Pwm: OutputPin,
    Led: OutputPin,
    D: DelayNs,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        freq_khz: u32,
        clock: Clk,
        data_out: Do,
        data_in: Di,
        mclr: Mclr,
        vpp: Vpp,
        pwm: Pwm,
        led: Led,
        delay: D,
    ) -> Self {
        let period_ns = 1_000_000 / freq_khz;
        let half_period = period_ns / 2;
        Gpio { half_period, delay, clock, data_out, data_in, mclr, vpp, pwm, led }
    }

    fn tick(&mut self) -> Result<(), AdapterError> {
        self.clock.set_high().map_err(pin_err)?;
        self.delay.delay_ns(self.half_period);
        self.clock.set_low().map_err(pin_err)?;
        self.delay.delay_ns(self.half_period);
        Ok(())
    }

    /// One four-phase transaction: data bit out, mode bit out, turnaround,
    /// response bit in.
    fn four_phase(&mut self, tdi: bool, tms: bool) -> Result<bool, AdapterError> {
        self.data_out.set_state(PinState::from(tdi)).map_err(pin_err)?;
        self.tick()?;

        self.data_out.set_state(PinState::from(tms)).map_err(pin_err)?;
        self.tick()?;

        self.data_out.set_low().map_err(pin_err)?;
        self.tick()?;

        self.clock.set_high().map_err(pin_err)?;
        let bit = self.data_in.is_high().map_err(pin_err)?;
        self.delay.delay_ns(self.half_period);
        self.clock.set_low().map_err(pin_err)?;
        self.delay.delay_ns(self.half_period);
        Ok(bit)
    }

    /// Shift `bits` data bits LSB first, raising the mode line on the
    /// last one, and return what the device shifted back.
    fn shift_data(&mut self, value: u32, bits: u8) -> Result<u32, AdapterError> {
        let mut read = 0u32;
        for i in 0..bits {
            let tdi = value & (1 << i) != 0;
            let tms = i == bits - 1;
            if self.four_phase(tdi, tms)? {
                read |= 1 << i;
            }
        }
        Ok(read)
    }

    // Shift header and footer around a register access.
    fn enter_shift(&mut self) -> Result<(), AdapterError> {
        self.four_phase(false, true)?;
        self.four_phase(false, false)?;
        self.four_phase(false, false)?;
        Ok(())
    }

    fn leave_shift(&mut self) -> Result<(), AdapterError> {
        self.four_phase(false, true)?;
        self.four_phase(false, false)?;
        Ok(())
    }
}

impl<Clk, Do, Di, Mclr, Vpp, Pwm, Led, D> Adapter for Gpio<Clk, Do, Di, Mclr, Vpp, Pwm, Led, D>
where
    Clk: OutputPin,
    Do: OutputPin,
    Di: InputPin,
    Mclr: OutputPin,
    Vpp: OutputPin,
    Pwm: OutputPin,
    Led: OutputPin,
    D: DelayNs,
{
    fn set_line(&mut self, line: Line, active: bool) -> Result<(), AdapterError> {
        match line {
            // MCLR is grounded when the line function is active.
            Line::MclrGnd => self
                .mclr
                .set_state(PinState::from(!active))
                .map_err(pin_err),
            Line::Vpp => self.vpp.set_state(PinState::from(active)).map_err(pin_err),
            Line::VppPwm => self.pwm.set_state(PinState::from(active)).map_err(pin_err),
            Line::BusyLed => self.led.set_state(PinState::from(active)).map_err(pin_err),
        }
    }

    fn set_icsp_pins(&mut self, cfg: u8) -> Result<(), AdapterError> {
        // Directions are fixed by the wiring; only drive the levels.
        if cfg & 0x02 == 0 {
            self.clock
                .set_state(PinState::from(cfg & 0x01 != 0))
                .map_err(pin_err)?;
        }
        if cfg & 0x08 == 0 {
            self.data_out
                .set_state(PinState::from(cfg & 0x04 != 0))
                .map_err(pin_err)?;
        }
        Ok(())
    }

    fn delay(&mut self, delay: Delay) -> Result<(), AdapterError> {
        match delay {
            Delay::Short(n) => self.delay.delay_us(n as u32 * SHORT_UNIT_US),
            Delay::Long(n) => self.delay.delay_us(n as u32 * LONG_UNIT_US),
        }
        Ok(())
    }

    fn shift_bits(&mut self, value: u32, bits: u8) -> Result<(), AdapterError> {
        for i in (0..bits).rev() {
            let bit = value & (1 << i) != 0;
            self.data_out.set_state(PinState::from(bit)).map_err(pin_err)?;
            self.tick()?;
        }
        self.data_out.set_low().map_err(pin_err)?;
        Ok(())
    }

    fn set_mode(&mut self, bits: u8, tms: u8) -> Result<(), AdapterError> {
        for i in 0..bits {
            self.four_phase(false, tms & (1 << i) != 0)?;
        }
        Ok(())
    }

    fn send_command(&mut self, ir: u8) -> Result<(), AdapterError> {
        self.four_phase(false, true)?;
        self.four_phase(false, true)?;
        self.four_phase(false, false)?;
        self.four_phase(false, false)?;
        self.shift_data(ir as u32, 5)?;
        self.leave_shift()
    }

    fn xfer_data8(&mut self, data: u8) -> Result<u8, AdapterError> {
        self.enter_shift()?;
        let read = self.shift_data(data as u32, 8)?;
        self.leave_shift()?;
        Ok(read as u8)
    }

    fn xfer_data32(&mut self, data: u32) -> Result<u32, AdapterError> {
        self.enter_shift()?;
        let read = self.shift_data(data, 32)?;
        self.leave_shift()?;
        Ok(read)
    }

    fn xfer_fastdata(&mut self, data: u32) -> Result<FastData, AdapterError> {
        self.enter_shift()?;
        // The first bit through the fast-data register is the handshake.
        let pracc = self.four_phase(false, false)?;
        let read = self.shift_data(data, 32)?;
        self.leave_shift()?;
        Ok(FastData { pracc, data: read })
    }

    fn pe_ready(&mut self) -> Result<bool, AdapterError> {
        self.data_in.is_high().map_err(pin_err)
    }
}
