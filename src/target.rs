//! The programming executive.  Drives a full session as an explicit
//! phase sequence, selecting the script for each phase, feeding it the
//! page buffers and interpreting what comes back.
//!
//! Whatever goes wrong, the session runs the exit script before handing
//! control back, so the device is never left with programming voltage
//! applied.  Cancellation is safe at phase boundaries only; the caller
//! owns that decision.

use alloc::vec::Vec;

use log::{debug, warn};

use crate::adapter::Adapter;
use crate::error::{Error, Result};
use crate::interp::{self, RunResult, SessionState};
use crate::script::{ScriptId, ScriptTable};
use crate::tap::mtap_status;

/// Transfer unit of the row-programming scripts.
pub const PAGE_BYTES: usize = 256;
const PAGE_WORDS: u32 = (PAGE_BYTES / 4) as u32;

/// Attempts per page before giving up on it.
const PAGE_RETRIES: usize = 2;

/// Programming executive command words: operation in the upper half,
/// word count in the lower.
mod pe {
    pub const ROW_PROGRAM: u32 = 0x0000_0000;
}

/// Known device identification codes, silicon revision stripped.
const DEVICES: &[(u32, &str)] = &[
    (0x04a0_7053, "PIC32MX110F016B"),
    (0x04a0_6053, "PIC32MX120F032B"),
    (0x04a0_1053, "PIC32MX210F016B"),
    (0x04a0_0053, "PIC32MX220F032B"),
    (0x0090_2053, "PIC32MX320F032H"),
    (0x0090_6053, "PIC32MX320F064H"),
    (0x0091_6053, "PIC32MX340F512H"),
    (0x0093_4053, "PIC32MX360F256L"),
    (0x0093_8053, "PIC32MX360F512L"),
    (0x0094_2053, "PIC32MX420F032H"),
    (0x0094_d053, "PIC32MX440F128H"),
    (0x0095_2053, "PIC32MX440F256H"),
    (0x0095_6053, "PIC32MX440F512H"),
    (0x0434_1053, "PIC32MX695F512L"),
    (0x0430_e053, "PIC32MX795F512H"),
    (0x0430_7053, "PIC32MX795F512L"),
];

/// Look up the marketing name for an identification code.
pub fn device_name(idcode: u32) -> Option<&'static str> {
    let id = idcode & 0x0fff_ffff;
    DEVICES.iter().find(|(d, _)| *d == id).map(|(_, n)| *n)
}

/// Session phase, advanced by the public operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Entering,
    Identifying,
    Erasing,
    Programming,
    Verifying,
    Exiting,
    Completed,
    Failed,
}

/// What to do with the rest of the range when a page fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PagePolicy {
    /// Keep going and report every page.
    Continue,
    /// Stop and end the session.
    Abort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageStatus {
    Ok,
    /// The executive reported a nonzero completion code.
    ProgramFailed { response: u32 },
    /// The executive never signalled completion.
    TimedOut,
    /// Read-back differed from the source image at this byte offset.
    VerifyMismatch { offset: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageReport {
    pub address: u32,
    pub status: PageStatus,
}

impl PageReport {
    pub fn is_ok(&self) -> bool {
        self.status == PageStatus::Ok
    }
}

/// One programming session against one device.
pub struct Target<A: Adapter> {
    adapter: A,
    scripts: ScriptTable,
    state: SessionState,
    phase: Phase,
    identified: bool,
    serial_exec: bool,
    exited: bool,
    failed: bool,
}

impl<A: Adapter> Target<A> {
    /// Open a session with the built-in PIC32 script set.  Runs the entry
    /// sequence and checks that a device answered on the other end.
    pub fn begin(adapter: A) -> Result<Self> {
        Self::begin_with(adapter, ScriptTable::pic32())
    }

    /// Open a session with a caller-supplied script table.
    pub fn begin_with(adapter: A, scripts: ScriptTable) -> Result<Self> {
        let mut target = Target {
            adapter,
            scripts,
            state: SessionState::new(),
            phase: Phase::Entering,
            identified: false,
            serial_exec: false,
            exited: false,
            failed: false,
        };

        let entry = target.run_script(ScriptId::ProgEntry, &[])?;
        let status = entry.words.last().copied().unwrap_or(0) as u8;
        debug!("entered programming mode, status {status:#04x}");
        if status & mtap_status::CFGRDY == 0 {
            return Err(target.abort(Error::NotReady { status }));
        }
        if status & mtap_status::CPS == 0 {
            return Err(target.abort(Error::CodeProtected));
        }
        Ok(target)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Read the 32-bit device identification register.  With `expected`
    /// given, a differing device is reported and nothing further will be
    /// allowed to touch flash.
    pub fn identify(&mut self, expected: Option<u32>) -> Result<u32> {
        self.live()?;
        self.phase = Phase::Identifying;
        let result = self.run_script(ScriptId::ReadDevId, &[])?;
        let found = *result
            .words
            .first()
            .ok_or(Error::ScriptFault("device id script produced no data"))?;
        debug!("device id {found:#010x} ({})", device_name(found).unwrap_or("unknown"));

        match expected {
            Some(expected) if expected != found => {
                self.identified = false;
                Err(Error::IdentityMismatch { expected, found })
            }
            _ => {
                self.identified = true;
                Ok(found)
            }
        }
    }

    /// Bulk-erase the device.  The erase cycle delay is part of the
    /// script.
    pub fn erase(&mut self) -> Result<()> {
        self.live()?;
        self.check_identified()?;
        self.phase = Phase::Erasing;
        self.run_script(ScriptId::EraseChip, &[])?;
        Ok(())
    }

    /// Program `data` into flash starting at `base`, page by page in
    /// ascending address order.  The last page is padded with `0xff`.
    pub fn program(
        &mut self,
        base: u32,
        data: &[u8],
        policy: PagePolicy,
    ) -> Result<Vec<PageReport>> {
        self.live()?;
        self.check_identified()?;
        self.phase = Phase::Programming;
        self.ensure_serial_exec()?;

        let mut reports = Vec::new();
        for (index, chunk) in data.chunks(PAGE_BYTES).enumerate() {
            let address = base + (index * PAGE_BYTES) as u32;
            let status = self.program_page(address, chunk)?;
            if status != PageStatus::Ok {
                warn!("page {address:#010x}: {status:?}");
                self.failed = true;
            }
            reports.push(PageReport { address, status });
            if status != PageStatus::Ok && policy == PagePolicy::Abort {
                if let Err(e) = self.end() {
                    warn!("exit after aborted programming failed: {e}");
                }
                break;
            }
        }
        Ok(reports)
    }

    /// Read the range back and compare it against `data`, page by page.
    pub fn verify(&mut self, base: u32, data: &[u8]) -> Result<Vec<PageReport>> {
        self.live()?;
        self.check_identified()?;
        self.phase = Phase::Verifying;
        self.ensure_serial_exec()?;

        let mut reports = Vec::new();
        for (index, chunk) in data.chunks(PAGE_BYTES).enumerate() {
            let address = base + (index * PAGE_BYTES) as u32;
            let status = self.verify_page(address, chunk)?;
            if status != PageStatus::Ok {
                warn!("page {address:#010x}: {status:?}");
                self.failed = true;
            }
            reports.push(PageReport { address, status });
        }
        Ok(reports)
    }

    /// Run the exit sequence and settle the terminal phase.  Idempotent;
    /// safe to call at any point.
    pub fn end(&mut self) -> Result<()> {
        if self.exited {
            return Ok(());
        }
        self.exited = true;
        self.phase = Phase::Exiting;

        let exit = self.run_raw(ScriptId::ProgExit, &[]);
        self.phase = if self.failed || !self.identified {
            Phase::Failed
        } else {
            Phase::Completed
        };
        debug!("session ended: {:?}", self.phase);

        if let Err(e) = exit {
            // An earlier failure stays the reported outcome.
            if self.failed {
                warn!("exit sequence failed: {e}");
                Ok(())
            } else {
                self.phase = Phase::Failed;
                Err(e)
            }
        } else {
            Ok(())
        }
    }

    fn live(&self) -> Result<()> {
        if self.exited {
            Err(Error::Phase("session already ended"))
        } else {
            Ok(())
        }
    }

    fn check_identified(&self) -> Result<()> {
        if self.identified {
            Ok(())
        } else {
            Err(Error::Phase("device identity not verified"))
        }
    }

    fn ensure_serial_exec(&mut self) -> Result<()> {
        if !self.serial_exec {
            self.run_script(ScriptId::SerialExec, &[])?;
            self.serial_exec = true;
        }
        Ok(())
    }

    fn program_page(&mut self, address: u32, chunk: &[u8]) -> Result<PageStatus> {
        let mut page = [0xffu8; PAGE_BYTES];
        page[..chunk.len()].copy_from_slice(chunk);

        let mut prep = [0u8; 8];
        prep[..4].copy_from_slice(&(pe::ROW_PROGRAM | PAGE_WORDS).to_le_bytes());
        prep[4..].copy_from_slice(&address.to_le_bytes());

        let mut last = PageStatus::TimedOut;
        for attempt in 0..=PAGE_RETRIES {
            if attempt > 0 {
                debug!("page {address:#010x}: retry {attempt}");
            }
            // A timeout here is recoverable; the attempt loop owns it.
            let run = self
                .run_raw(ScriptId::ProgMemWrPrep, &prep)
                .and_then(|_| self.run_raw(ScriptId::ProgMemWr, &page));
            match run {
                Ok(result) => match result.response {
                    Some(0) => return Ok(PageStatus::Ok),
                    response => {
                        last = PageStatus::ProgramFailed {
                            response: response.unwrap_or(u32::MAX),
                        };
                    }
                },
                Err(Error::Timeout) => last = PageStatus::TimedOut,
                Err(e) => return Err(self.abort(e)),
            }
        }
        Ok(last)
    }

    fn verify_page(&mut self, address: u32, chunk: &[u8]) -> Result<PageStatus> {
        let mut page = [0xffu8; PAGE_BYTES];
        page[..chunk.len()].copy_from_slice(chunk);

        let result = match self.run_raw(ScriptId::ProgMemRd, &address.to_le_bytes()) {
            Ok(result) => result,
            Err(Error::Timeout) => return Ok(PageStatus::TimedOut),
            Err(e) => return Err(self.abort(e)),
        };

        let mut read = Vec::with_capacity(PAGE_BYTES);
        for word in &result.words {
            read.extend_from_slice(&word.to_le_bytes());
        }
        read.resize(PAGE_BYTES, 0x00);

        match page.iter().zip(&read).position(|(a, b)| a != b) {
            None => Ok(PageStatus::Ok),
            Some(offset) => Ok(PageStatus::VerifyMismatch { offset }),
        }
    }

    /// Run a script; any failure tears the session down to the exit
    /// sequence.
    fn run_script(&mut self, id: ScriptId, input: &[u8]) -> Result<RunResult> {
        self.run_raw(id, input).map_err(|e| self.abort(e))
    }

    fn run_raw(&mut self, id: ScriptId, input: &[u8]) -> Result<RunResult> {
        let script = self
            .scripts
            .get(id)
            .ok_or(Error::ScriptFault("script missing from table"))?;
        interp::run(&mut self.adapter, &mut self.state, script, input)
    }

    fn abort(&mut self, err: Error) -> Error {
        self.failed = true;
        if let Err(e) = self.end() {
            warn!("exit sequence failed after error: {e}");
        }
        err
    }
}

impl<A: Adapter> Drop for Target<A> {
    fn drop(&mut self) {
        let _ = self.end();
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::adapter::mock::{Call, MockAdapter};
    use crate::adapter::Line;

    const GOOD_STATUS: u8 = mtap_status::CFGRDY | mtap_status::CPS;
    const DEVID: u32 = 0x04a0_0053;

    fn ready_mock() -> MockAdapter {
        let mut mock = MockAdapter::new();
        mock.data8.push_back(GOOD_STATUS);
        mock
    }

    fn exit_ran(mock: &MockAdapter) -> bool {
        // The exit sequence is the only place the link reset is clocked
        // with five bits, and it always releases reset last.
        mock.calls.contains(&Call::Mode(5, 0x1f))
            && mock.calls.last() == Some(&Call::SetLine(Line::MclrGnd, false))
    }

    #[test]
    fn begin_rejects_a_missing_device() {
        let mut mock = MockAdapter::new();
        mock.data8.push_back(0x00);
        match Target::begin(mock) {
            Err(Error::NotReady { status: 0 }) => {}
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[test]
    fn begin_rejects_a_protected_device() {
        let mut mock = MockAdapter::new();
        mock.data8.push_back(mtap_status::CFGRDY);
        assert!(matches!(Target::begin(mock), Err(Error::CodeProtected)));
    }

    #[test]
    fn identify_returns_the_device_id() {
        let mut mock = ready_mock();
        mock.data32.push_back(DEVID);
        let mut target = Target::begin(mock).unwrap();
        let id = target.identify(None).unwrap();
        assert_eq!(id, DEVID);
        assert_eq!(device_name(id), Some("PIC32MX220F032B"));
        target.end().unwrap();
        assert_eq!(target.phase(), Phase::Completed);
    }

    #[test]
    fn identity_mismatch_blocks_erase() {
        let mut mock = ready_mock();
        mock.data32.push_back(DEVID);
        let mut target = Target::begin(mock).unwrap();
        assert!(matches!(
            target.identify(Some(0x1234_5678)),
            Err(Error::IdentityMismatch { found: DEVID, .. })
        ));
        assert!(matches!(target.erase(), Err(Error::Phase(_))));
        target.end().unwrap();
        assert_eq!(target.phase(), Phase::Failed);
    }

    #[test]
    fn erase_runs_after_identification() {
        let mut mock = ready_mock();
        mock.data32.push_back(DEVID);
        // Status query inside the erase command sequence.
        mock.data8.push_back(0x00);
        let mut target = Target::begin(mock).unwrap();
        target.identify(None).unwrap();
        target.erase().unwrap();
        target.end().unwrap();
        assert_eq!(target.phase(), Phase::Completed);
    }

    #[test]
    fn program_verify_round_trip() {
        let mut mock = ready_mock();
        mock.data32.push_back(DEVID);
        let mut target = Target::begin(mock).unwrap();
        target.identify(None).unwrap();

        let data: Vec<u8> = (0u8..=255).collect();
        let reports = target
            .program(0x1d00_0000, &data, PagePolicy::Continue)
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_ok());

        // Whatever went over the fast-data path past the command and the
        // address is the page image; play it back for the read script.
        let written = {
            // Two setup words precede the payload.
            let w = fastdata_written(&mut target);
            w[2..66].to_vec()
        };
        // The read script pushes two outgoing words before draining.
        feed_fastdata(&mut target, &[0, 0]);
        feed_fastdata(&mut target, &written);

        let reports = target.verify(0x1d00_0000, &data).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_ok(), "status {:?}", reports[0].status);

        target.end().unwrap();
        assert_eq!(target.phase(), Phase::Completed);
    }

    #[test]
    fn verify_reports_a_mismatch() {
        let mut mock = ready_mock();
        mock.data32.push_back(DEVID);
        let mut target = Target::begin(mock).unwrap();
        target.identify(None).unwrap();

        let data = vec![0xaau8; PAGE_BYTES];
        // Outgoing command and address, then a corrupted image.
        feed_fastdata(&mut target, &[0, 0]);
        let mut image = vec![0xaaaa_aaaau32; PAGE_BYTES / 4];
        image[3] = 0xaaaa_00aa;
        feed_fastdata(&mut target, &image);

        let reports = target.verify(0x1d00_0000, &data).unwrap();
        assert_eq!(
            reports[0].status,
            PageStatus::VerifyMismatch { offset: 13 }
        );
        target.end().unwrap();
        assert_eq!(target.phase(), Phase::Failed);
    }

    #[test]
    fn unresponsive_executive_times_out_per_page() {
        let mut mock = ready_mock();
        mock.data32.push_back(DEVID);
        mock.busy_probes = usize::MAX;
        let mut target = Target::begin(mock).unwrap();
        target.identify(None).unwrap();

        let data = vec![0u8; 2 * PAGE_BYTES];
        let reports = target
            .program(0x1d00_0000, &data, PagePolicy::Continue)
            .unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.status == PageStatus::TimedOut));

        target.end().unwrap();
        assert_eq!(target.phase(), Phase::Failed);
    }

    #[test]
    fn nonzero_response_reports_program_failure() {
        let mut mock = ready_mock();
        mock.data32.push_back(DEVID);
        // Each attempt shifts 66 outgoing words before fetching the
        // response; make the executive answer 5 every time.
        for _ in 0..3 {
            for _ in 0..66 {
                mock.fastdata.push_back(0);
            }
            mock.fastdata.push_back(5);
        }
        let mut target = Target::begin(mock).unwrap();
        target.identify(None).unwrap();

        let reports = target
            .program(0x1d00_0000, &[0u8; PAGE_BYTES], PagePolicy::Continue)
            .unwrap();
        assert_eq!(
            reports[0].status,
            PageStatus::ProgramFailed { response: 5 }
        );
    }

    #[test]
    fn abort_policy_stops_and_ends_the_session() {
        let mut mock = ready_mock();
        mock.data32.push_back(DEVID);
        mock.busy_probes = usize::MAX;
        let mut target = Target::begin(mock).unwrap();
        target.identify(None).unwrap();

        let data = vec![0u8; 2 * PAGE_BYTES];
        let reports = target
            .program(0x1d00_0000, &data, PagePolicy::Abort)
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(target.phase(), Phase::Failed);
        assert!(matches!(
            target.program(0x1d00_0000, &data, PagePolicy::Abort),
            Err(Error::Phase(_))
        ));
    }

    #[test]
    fn exit_runs_after_a_transport_failure() {
        let mut mock = ready_mock();
        mock.data32.push_back(DEVID);
        let mut target = Target::begin(mock).unwrap();
        target.identify(None).unwrap();

        set_fail_at(&mut target, 60);
        let data = vec![0u8; PAGE_BYTES];
        assert!(matches!(
            target.program(0x1d00_0000, &data, PagePolicy::Continue),
            Err(Error::Transport(_))
        ));
        assert_eq!(target.phase(), Phase::Failed);
        assert!(with_mock(&target, exit_ran));
    }

    #[test]
    fn session_without_identification_never_completes() {
        let mock = ready_mock();
        let mut target = Target::begin(mock).unwrap();
        target.end().unwrap();
        assert_eq!(target.phase(), Phase::Failed);
    }

    #[test]
    fn end_is_idempotent() {
        let mut mock = ready_mock();
        mock.data32.push_back(DEVID);
        let mut target = Target::begin(mock).unwrap();
        target.identify(None).unwrap();
        target.end().unwrap();
        let calls = with_mock(&target, |m| m.calls.len());
        target.end().unwrap();
        assert_eq!(with_mock(&target, |m| m.calls.len()), calls);
        assert_eq!(target.phase(), Phase::Completed);
    }

    // Small helpers reaching through to the mock.

    fn with_mock<R>(target: &Target<MockAdapter>, f: impl FnOnce(&MockAdapter) -> R) -> R {
        f(&target.adapter)
    }

    fn fastdata_written(target: &Target<MockAdapter>) -> Vec<u32> {
        target.adapter.fastdata_written()
    }

    fn feed_fastdata(target: &mut Target<MockAdapter>, words: &[u32]) {
        for w in words {
            target.adapter.fastdata.push_back(*w);
        }
    }

    fn set_fail_at(target: &mut Target<MockAdapter>, at: usize) {
        let base = target.adapter.calls.len();
        target.adapter.fail_at = Some(base + at);
    }
}
