//! The script interpreter.  Executes one validated `Script` against an
//! `Adapter`, threading TAP selection and the programming executive's
//! response through the session state.
//!
//! Pin and timing instructions delegate to the adapter as-is.  Transfer
//! instructions are checked against the TAP tracker first; read-back
//! words accumulate into the run's output.  The loop instruction bounds
//! every handshake poll, so an unresponsive target ends in `Timeout`
//! instead of a hang.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use log::{debug, trace};

use crate::adapter::{Adapter, Delay, Line};
use crate::error::{Error, Result};
use crate::script::{Op, Script};
use crate::tap::TapState;

/// Idle interval between handshake probes.
const PE_POLL: Delay = Delay::Short(23);

/// State carried across script runs within one programming session.
#[derive(Debug, Default)]
pub struct SessionState {
    pub tap: TapState,
    /// Last response word fetched from the target's programming executive.
    pub last_response: Option<u32>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Outcome of one script run.
#[derive(Debug)]
pub struct RunResult {
    /// Read-back words in execution order: data register transfers and
    /// executive responses.
    pub words: Vec<u32>,
    /// Final executive response, if the script fetched one.
    pub response: Option<u32>,
}

/// Execute `script`, drawing fast-data payload from `input`.
///
/// `input` is borrowed for this run only; a cursor advances over it and
/// running past its end is a script fault.
pub fn run<A: Adapter>(
    adapter: &mut A,
    state: &mut SessionState,
    script: &Script,
    input: &[u8],
) -> Result<RunResult> {
    debug!("run {:?}: {} instructions, {} input bytes", script.id(), script.len(), input.len());

    let ops = script.ops();
    let mut words = Vec::new();
    let mut cursor = 0usize;
    // Loop counters keyed by the loop instruction's position.
    let mut loops: BTreeMap<usize, u8> = BTreeMap::new();
    // Handshake bookkeeping for the current loop iteration.
    let mut pe_ready = true;
    let mut wait_seen = false;

    let mut pc = 0usize;
    while pc < ops.len() {
        let op = ops[pc];
        trace!("  [{pc}] {op:?}");
        match op {
            Op::VppOn => adapter.set_line(Line::Vpp, true)?,
            Op::VppOff => adapter.set_line(Line::Vpp, false)?,
            Op::VppPwmOn => adapter.set_line(Line::VppPwm, true)?,
            Op::VppPwmOff => adapter.set_line(Line::VppPwm, false)?,
            Op::MclrGndOn => adapter.set_line(Line::MclrGnd, true)?,
            Op::MclrGndOff => adapter.set_line(Line::MclrGnd, false)?,
            Op::BusyLedOn => adapter.set_line(Line::BusyLed, true)?,
            Op::BusyLedOff => adapter.set_line(Line::BusyLed, false)?,
            Op::SetIcspPins(cfg) => adapter.set_icsp_pins(cfg)?,
            Op::WriteByteLiteral(value) => adapter.shift_byte(value)?,
            Op::DelayShort(n) => adapter.delay(Delay::Short(n))?,
            Op::DelayLong(n) => adapter.delay(Delay::Long(n))?,
            Op::SetMode { bits, tms } => {
                state.tap.set_mode();
                adapter.set_mode(bits, tms)?;
            }
            Op::SendCmd(code) => {
                if state.tap.apply_ir(code)? {
                    adapter.send_command(code)?;
                }
            }
            Op::XferData8(value) => {
                state.tap.require_data()?;
                let read = adapter.xfer_data8(value)?;
                words.push(read as u32);
            }
            Op::XferData32(value) => {
                state.tap.require_data()?;
                let read = adapter.xfer_data32(value)?;
                words.push(read);
            }
            Op::XferFastDataLit(value) => {
                state.tap.require_fastdata()?;
                fastdata_out(adapter, value)?;
            }
            Op::XferFastDataBuf => {
                state.tap.require_fastdata()?;
                let bytes = input
                    .get(cursor..cursor + 4)
                    .ok_or(Error::ScriptFault("transfer buffer overrun"))?;
                cursor += 4;
                let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                fastdata_out(adapter, word)?;
            }
            Op::WaitPeResp => {
                wait_seen = true;
                if adapter.pe_ready()? {
                    pe_ready = true;
                } else {
                    pe_ready = false;
                    adapter.delay(PE_POLL)?;
                }
            }
            Op::GetPeResp => {
                state.tap.require_fastdata()?;
                if pe_ready {
                    let fd = adapter.xfer_fastdata(0)?;
                    if fd.pracc {
                        words.push(fd.data);
                        state.last_response = Some(fd.data);
                    } else {
                        pe_ready = false;
                    }
                }
            }
            Op::Loop { back, count } => {
                let target = pc - back as usize;
                if wait_seen && pe_ready {
                    // The handshake this loop was polling for succeeded.
                    loops.remove(&pc);
                    wait_seen = false;
                } else {
                    let remaining = loops.entry(pc).or_insert(count);
                    if *remaining > 0 {
                        *remaining -= 1;
                        // Inner loops start over on the next pass.
                        let stale: Vec<usize> =
                            loops.range(target..pc).map(|(k, _)| *k).collect();
                        for k in stale {
                            loops.remove(&k);
                        }
                        wait_seen = false;
                        pc = target;
                        continue;
                    }
                    let timed_out = wait_seen;
                    loops.remove(&pc);
                    wait_seen = false;
                    if timed_out {
                        return Err(Error::Timeout);
                    }
                }
            }
        }
        pc += 1;
    }

    Ok(RunResult { words, response: state.last_response })
}

fn fastdata_out<A: Adapter>(adapter: &mut A, word: u32) -> Result<()> {
    let fd = adapter.xfer_fastdata(word)?;
    if fd.pracc {
        Ok(())
    } else {
        // The target was not ready to accept the word; the transfer is
        // lost and the run cannot continue.
        Err(Error::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::adapter::mock::{Call, MockAdapter};
    use crate::script::{op, ScriptEntry, ScriptId, ScriptTable};
    use crate::tap::tapcmd;

    fn load(bytes: &[u8]) -> ScriptTable {
        let count = {
            // Count instructions by arity so tests can stay byte-literal.
            let mut at = 0;
            let mut n = 0;
            while at < bytes.len() {
                at += 1 + crate::script::arity(bytes[at]).expect("test script");
                n += 1;
            }
            n
        };
        let index = [ScriptEntry { id: ScriptId::ProgEntry, offset: 0, count }];
        ScriptTable::load(bytes, &index).expect("test script")
    }

    fn run_bytes(adapter: &mut MockAdapter, bytes: &[u8], input: &[u8]) -> Result<RunResult> {
        let table = load(bytes);
        let script = table.get(ScriptId::ProgEntry).unwrap();
        let mut state = SessionState::new();
        run(adapter, &mut state, script, input)
    }

    #[test]
    fn pin_and_timing_ops_delegate() {
        let mut mock = MockAdapter::new();
        let bytes = [
            op::VPP_OFF,
            op::MCLR_GND_ON,
            op::BUSY_LED_ON,
            op::DELAY_LONG, 20,
            op::SET_ICSP_PINS, 0x02,
            op::WRITE_BYTE_LITERAL, 0xb2,
        ];
        run_bytes(&mut mock, &bytes, &[]).unwrap();
        assert_eq!(
            mock.calls,
            vec![
                Call::SetLine(Line::Vpp, false),
                Call::SetLine(Line::MclrGnd, true),
                Call::SetLine(Line::BusyLed, true),
                Call::Delay(Delay::Long(20)),
                Call::Pins(0x02),
                Call::Bits(0xb2, 8),
            ]
        );
    }

    #[test]
    fn data_register_readback_is_collected() {
        let mut mock = MockAdapter::new();
        mock.data32.push_back(0x04a0_0053);
        let bytes = [
            op::JT2_SENDCMD, tapcmd::SW_MTAP,
            op::JT2_SENDCMD, tapcmd::MTAP_IDCODE,
            op::JT2_XFERDATA32_LIT, 0, 0, 0, 0,
        ];
        let result = run_bytes(&mut mock, &bytes, &[]).unwrap();
        assert_eq!(result.words, vec![0x04a0_0053]);
    }

    #[test]
    fn reselecting_a_tap_emits_no_adapter_call() {
        let mut mock = MockAdapter::new();
        let bytes = [
            op::JT2_SENDCMD, tapcmd::SW_MTAP,
            op::JT2_SENDCMD, tapcmd::SW_MTAP,
            op::JT2_SENDCMD, tapcmd::MTAP_COMMAND,
            op::JT2_SENDCMD, tapcmd::MTAP_COMMAND,
        ];
        run_bytes(&mut mock, &bytes, &[]).unwrap();
        assert_eq!(
            mock.calls,
            vec![Call::Ir(tapcmd::SW_MTAP), Call::Ir(tapcmd::MTAP_COMMAND)]
        );
    }

    #[test]
    fn transfer_without_tap_is_a_protocol_violation() {
        let mut mock = MockAdapter::new();
        let bytes = [op::JT2_XFERDATA8_LIT, 0x00];
        assert!(matches!(
            run_bytes(&mut mock, &bytes, &[]),
            Err(Error::Protocol(_))
        ));
        assert!(mock.calls.is_empty());
    }

    #[test]
    fn buffer_overrun_is_a_script_fault() {
        let mut mock = MockAdapter::new();
        let bytes = [
            op::JT2_SENDCMD, tapcmd::SW_ETAP,
            op::JT2_SENDCMD, tapcmd::ETAP_FASTDATA,
            op::JT2_XFRFASTDAT_BUF,
            op::JT2_XFRFASTDAT_BUF,
        ];
        // Four bytes feed exactly one transfer; the second overruns.
        let result = run_bytes(&mut mock, &bytes, &[0xde, 0xad, 0xbe, 0xef]);
        assert!(matches!(result, Err(Error::ScriptFault(_))));
        assert_eq!(mock.fastdata_written(), vec![0xefbe_adde]);
    }

    #[test]
    fn plain_loop_repeats_the_body() {
        let mut mock = MockAdapter::new();
        let bytes = [
            op::JT2_SENDCMD, tapcmd::SW_ETAP,
            op::JT2_SENDCMD, tapcmd::ETAP_FASTDATA,
            op::JT2_XFRFASTDAT_BUF,
            op::LOOP, 1, 7,
        ];
        let input: Vec<u8> = (0u8..32).collect();
        run_bytes(&mut mock, &bytes, &input).unwrap();
        // One initial pass plus seven repeats.
        assert_eq!(mock.fastdata_written().len(), 8);
    }

    #[test]
    fn unresponsive_handshake_times_out_bounded() {
        let mut mock = MockAdapter::new();
        mock.busy_probes = usize::MAX;
        let bytes = [
            op::JT2_WAIT_PE_RESP,
            op::LOOP, 1, 9,
        ];
        assert!(matches!(run_bytes(&mut mock, &bytes, &[]), Err(Error::Timeout)));
        // Ten probes, each followed by a poll delay.
        assert_eq!(mock.count(&Call::Ready), 10);
        assert_eq!(mock.count(&Call::Delay(PE_POLL)), 10);
    }

    #[test]
    fn handshake_poll_exits_once_ready() {
        let mut mock = MockAdapter::new();
        mock.busy_probes = 3;
        mock.fastdata.push_back(0);
        let bytes = [
            op::JT2_SENDCMD, tapcmd::SW_ETAP,
            op::JT2_SENDCMD, tapcmd::ETAP_FASTDATA,
            op::JT2_WAIT_PE_RESP,
            op::JT2_GET_PE_RESP,
            op::LOOP, 2, 31,
        ];
        let result = run_bytes(&mut mock, &bytes, &[]).unwrap();
        assert_eq!(mock.count(&Call::Ready), 4);
        // The response was fetched exactly once.
        assert_eq!(mock.count(&Call::Fast(0)), 1);
        assert_eq!(result.response, Some(0));
    }

    #[test]
    fn response_drain_loop_collects_every_word() {
        let mut mock = MockAdapter::new();
        for w in 100u32..104 {
            mock.fastdata.push_back(w);
        }
        // A drain loop encloses only the fetch, the way the page-read
        // script does after its wait loop has finished.
        let bytes = [
            op::JT2_SENDCMD, tapcmd::SW_ETAP,
            op::JT2_SENDCMD, tapcmd::ETAP_FASTDATA,
            op::JT2_GET_PE_RESP,
            op::LOOP, 1, 3,
        ];
        let result = run_bytes(&mut mock, &bytes, &[]).unwrap();
        assert_eq!(result.words, vec![100, 101, 102, 103]);
        assert_eq!(result.response, Some(103));
    }

    #[test]
    fn transport_failure_aborts_the_run() {
        let mut mock = MockAdapter::new();
        mock.fail_at = Some(2);
        let bytes = [op::VPP_OFF, op::MCLR_GND_ON, op::VPP_PWM_ON, op::BUSY_LED_ON];
        assert!(matches!(
            run_bytes(&mut mock, &bytes, &[]),
            Err(Error::Transport(_))
        ));
        assert_eq!(mock.calls.len(), 2);
    }

    #[test]
    fn jammed_fastdata_times_out() {
        let mut mock = MockAdapter::new();
        mock.jam_fastdata = true;
        let bytes = [
            op::JT2_SENDCMD, tapcmd::SW_ETAP,
            op::JT2_SENDCMD, tapcmd::ETAP_FASTDATA,
            op::JT2_XFRFASTDAT_LIT, 0x40, 0x00, 0x01, 0x00,
        ];
        assert!(matches!(run_bytes(&mut mock, &bytes, &[]), Err(Error::Timeout)));
    }
}
