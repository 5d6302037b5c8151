//! Field firmware upgrade.
//!
//! The input is an Intel-hex style record stream: type 0x00 data records
//! carrying up to 16 bytes each, terminated by a type 0x01 record. The
//! decoded payload streams to the device's upgrade buffer while the worker
//! polls the progress, error and free-space registers. Writes only flow
//! once the device reports its flash erased, never exceed one report's
//! payload, stay on a 16-byte record boundary, and the final page is
//! zero-padded to that boundary.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info};

use crate::download::WorkerGate;
use crate::error::{Error, Result};
use crate::event::EventBus;
use crate::report::{Action, Dir, Report, PAYLOAD_MAX_LENGTH};
use crate::scope::with_device;
use crate::system::System;
use crate::transport::ConnectionManager;

/// Which half of the instrument is being upgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeTarget {
    Synthesiser,
    Controller,
}

impl UpgradeTarget {
    fn action(self) -> Action {
        match self {
            UpgradeTarget::Synthesiser => Action::FwUpgrade,
            UpgradeTarget::Controller => Action::CtrlrFwUpgrade,
        }
    }
}

/// Progress notifications, in the order the device asserts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareUpgradeEvent {
    Started,
    InitializeOk,
    CheckIdOk,
    EnterUpgradeMode,
    EraseOk,
    ProgramOk,
    VerifyOk,
    LeaveUpgradeMode,
    Done,
    Error,
}

/// Device progress register bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpgradeProgress(pub u32);

impl UpgradeProgress {
    pub fn started(self) -> bool {
        self.0 & 0x01 != 0
    }
    pub fn initialize_ok(self) -> bool {
        self.0 & 0x02 != 0
    }
    pub fn check_id_ok(self) -> bool {
        self.0 & 0x04 != 0
    }
    pub fn enter_upgrade_mode_ok(self) -> bool {
        self.0 & 0x08 != 0
    }
    pub fn erase_ok(self) -> bool {
        self.0 & 0x10 != 0
    }
    pub fn program_ok(self) -> bool {
        self.0 & 0x20 != 0
    }
    pub fn verify_ok(self) -> bool {
        self.0 & 0x40 != 0
    }
    pub fn leave_upgrade_mode_ok(self) -> bool {
        self.0 & 0x80 != 0
    }
}

// Register map of the upgrade action: command/progress at 0, data and free
// space at 1, error detail at 2.
const UPGRADE_ADDR_CONTROL: u16 = 0;
const UPGRADE_ADDR_DATA: u16 = 1;
const UPGRADE_ADDR_ERROR: u16 = 2;

const UPGRADE_CMD_START: u8 = 0x01;
const UPGRADE_CMD_FINISH: u8 = 0x02;

/// Flash records are this wide; writes never straddle a partial record.
const RECORD_SIZE: usize = 16;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Decodes an Intel-hex style stream, keeping type 0x00 data records in
/// file order and stopping at the end-of-file record. The result is
/// zero-padded to a whole record.
pub fn decode_hex_stream(input: &str) -> Result<Vec<u8>> {
    let mut payload = Vec::new();

    for (lineno, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(body) = line.strip_prefix(':') else {
            return Err(Error::Firmware(format!("line {}: missing ':' prefix", lineno + 1)));
        };
        if body.len() % 2 != 0 || body.len() < 10 {
            return Err(Error::Firmware(format!("line {}: truncated record", lineno + 1)));
        }
        let bytes: Vec<u8> = (0..body.len() / 2)
            .map(|i| u8::from_str_radix(&body[2 * i..2 * i + 2], 16))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::Firmware(format!("line {}: invalid hex", lineno + 1)))?;

        let count = bytes[0] as usize;
        if bytes.len() != count + 5 {
            return Err(Error::Firmware(format!("line {}: length field mismatch", lineno + 1)));
        }
        let sum: u8 = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            return Err(Error::Firmware(format!("line {}: checksum error", lineno + 1)));
        }

        match bytes[3] {
            0x00 => payload.extend_from_slice(&bytes[4..4 + count]),
            0x01 => break,
            // extended address records do not reach the device buffer
            _ => continue,
        }
    }

    let padded = payload.len().div_ceil(RECORD_SIZE) * RECORD_SIZE;
    payload.resize(padded, 0);
    Ok(payload)
}

struct FwShared {
    device: Weak<System>,
    target: UpgradeTarget,
    payload: Vec<u8>,
    gate: WorkerGate,
    events: EventBus<FirmwareUpgradeEvent>,
}

/// Background upgrade driver for one firmware file.
pub struct FirmwareUpgrade {
    shared: Arc<FwShared>,
    worker: Option<JoinHandle<()>>,
}

impl FirmwareUpgrade {
    /// Parses the record stream up front; a malformed file is rejected
    /// before anything is sent to the device.
    pub fn new(
        system: &Arc<System>,
        target: UpgradeTarget,
        hex_stream: &str,
    ) -> Result<FirmwareUpgrade> {
        let payload = decode_hex_stream(hex_stream)?;
        info!("firmware payload: {} bytes", payload.len());

        let shared = Arc::new(FwShared {
            device: Arc::downgrade(system),
            target,
            payload,
            gate: WorkerGate::new(),
            events: EventBus::new(),
        });

        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                while shared.gate.wait_for_trigger() {
                    with_device(&shared.device, |sys| shared.run_upgrade(sys));
                    shared.gate.finish_run();
                }
            })
        };

        Ok(FirmwareUpgrade {
            shared,
            worker: Some(worker),
        })
    }

    pub fn events(&self) -> &EventBus<FirmwareUpgradeEvent> {
        &self.shared.events
    }

    /// Kicks off the upgrade. Fails when the device does not advertise
    /// remote upgrade support or a run is already active.
    pub fn start_upgrade(&self) -> bool {
        with_device(&self.shared.device, |sys| {
            let caps = match self.shared.target {
                UpgradeTarget::Synthesiser => {
                    if !sys.synthesiser_valid() {
                        return false;
                    }
                    sys.synthesiser().caps
                }
                UpgradeTarget::Controller => {
                    if !sys.controller_valid() {
                        return false;
                    }
                    sys.controller().caps
                }
            };
            if !caps.remote_upgrade {
                return false;
            }
            self.shared.gate.trigger()
        })
    }
}

impl Drop for FirmwareUpgrade {
    fn drop(&mut self) {
        self.shared.gate.stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl FwShared {
    fn read_u32(&self, sys: &Arc<System>, addr: u16) -> u32 {
        sys.connection()
            .send_msg_blocking(Report::host(self.target.action(), Dir::Read, addr))
            .payload::<u32>()
    }

    fn read_free_space(&self, sys: &Arc<System>) -> u16 {
        sys.connection()
            .send_msg_blocking(Report::host(
                self.target.action(),
                Dir::Read,
                UPGRADE_ADDR_DATA,
            ))
            .payload::<u16>()
    }

    fn emit_progress_edges(&self, previous: UpgradeProgress, current: UpgradeProgress) {
        let rising = current.0 & !previous.0;
        let edges = [
            (0x01, FirmwareUpgradeEvent::Started),
            (0x02, FirmwareUpgradeEvent::InitializeOk),
            (0x04, FirmwareUpgradeEvent::CheckIdOk),
            (0x08, FirmwareUpgradeEvent::EnterUpgradeMode),
            (0x10, FirmwareUpgradeEvent::EraseOk),
            (0x20, FirmwareUpgradeEvent::ProgramOk),
            (0x40, FirmwareUpgradeEvent::VerifyOk),
            (0x80, FirmwareUpgradeEvent::LeaveUpgradeMode),
        ];
        for (bit, event) in edges {
            if rising & bit != 0 {
                self.events.trigger(event, 0);
            }
        }
    }

    fn run_upgrade(&self, sys: &Arc<System>) {
        let conn = sys.connection();
        let action = self.target.action();

        let begin = conn.send_msg_blocking(Report::host_with(
            action,
            Dir::Write,
            UPGRADE_ADDR_CONTROL,
            UPGRADE_CMD_START,
        ));
        if !begin.done() || begin.general_error() {
            error!("upgrade start rejected by device");
            self.events.trigger(FirmwareUpgradeEvent::Error, 0);
            return;
        }

        let mut progress = UpgradeProgress::default();
        let mut offset = 0usize;
        let mut finish_sent = false;

        while self.gate.running() {
            let current = UpgradeProgress(self.read_u32(sys, UPGRADE_ADDR_CONTROL));
            self.emit_progress_edges(progress, current);
            progress = current;

            let error_code = self.read_u32(sys, UPGRADE_ADDR_ERROR);
            if error_code != 0 {
                error!("upgrade error register: {error_code:#x}");
                self.events
                    .trigger(FirmwareUpgradeEvent::Error, error_code as i32);
                return;
            }

            if progress.leave_upgrade_mode_ok()
                || (finish_sent && progress.verify_ok() && progress.program_ok())
            {
                self.events.trigger(FirmwareUpgradeEvent::Done, 0);
                return;
            }

            if progress.erase_ok() && !progress.program_ok() && offset < self.payload.len() {
                let free = self.read_free_space(sys) as usize;
                if free < PAYLOAD_MAX_LENGTH {
                    std::thread::sleep(POLL_INTERVAL);
                    continue;
                }
                let mut tfr_len = free.min(PAYLOAD_MAX_LENGTH);
                tfr_len -= tfr_len % RECORD_SIZE;
                let end = (offset + tfr_len).min(self.payload.len());

                debug!("upgrade: writing {} bytes at offset {offset}", end - offset);
                let resp = conn.send_msg_blocking(Report::host_with(
                    action,
                    Dir::Write,
                    UPGRADE_ADDR_DATA,
                    self.payload[offset..end].to_vec(),
                ));
                if !resp.done() || resp.general_error() {
                    self.events.trigger(FirmwareUpgradeEvent::Error, 0);
                    return;
                }
                offset = end;

                if offset >= self.payload.len() && !finish_sent {
                    let resp = conn.send_msg_blocking(Report::host_with(
                        action,
                        Dir::Write,
                        UPGRADE_ADDR_CONTROL,
                        UPGRADE_CMD_FINISH,
                    ));
                    if !resp.done() || resp.general_error() {
                        self.events.trigger(FirmwareUpgradeEvent::Error, 0);
                        return;
                    }
                    finish_sent = true;
                }
                continue;
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(addr: u16, data: &[u8]) -> String {
        let mut bytes = vec![data.len() as u8, (addr >> 8) as u8, (addr & 0xff) as u8, 0x00];
        bytes.extend_from_slice(data);
        let sum: u8 = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        bytes.push(sum.wrapping_neg());
        let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
        format!(":{hex}")
    }

    #[test]
    fn data_records_decode_in_order() {
        let input = format!(
            "{}\n{}\n:00000001FF\n",
            record(0x0000, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]),
            record(0x0010, &[0xaa, 0xbb])
        );
        let payload = decode_hex_stream(&input).unwrap();
        assert_eq!(payload.len(), 32);
        assert_eq!(payload[0], 1);
        assert_eq!(payload[15], 16);
        assert_eq!(&payload[16..18], &[0xaa, 0xbb]);
        // final page zero-padded to the record boundary
        assert!(payload[18..].iter().all(|&b| b == 0));
    }

    #[test]
    fn records_after_eof_are_ignored() {
        let input = format!(
            "{}\n:00000001FF\n{}\n",
            record(0x0000, &[0x11; 16]),
            record(0x0010, &[0x22; 16])
        );
        let payload = decode_hex_stream(&input).unwrap();
        assert_eq!(payload.len(), 16);
        assert!(payload.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn checksum_error_is_rejected() {
        let mut bad = record(0x0000, &[1, 2, 3, 4]);
        // corrupt one payload nibble, keeping the stated checksum
        bad.replace_range(10..11, "F");
        assert!(decode_hex_stream(&bad).is_err());
    }

    #[test]
    fn missing_prefix_is_rejected() {
        assert!(decode_hex_stream("10000000DEADBEEF").is_err());
    }

    #[test]
    fn write_lengths_stay_on_record_boundaries() {
        for free in [16usize, 30, 64, 100] {
            let mut tfr = free.min(PAYLOAD_MAX_LENGTH);
            tfr -= tfr % RECORD_SIZE;
            assert_eq!(tfr % RECORD_SIZE, 0);
            assert!(tfr <= PAYLOAD_MAX_LENGTH);
        }
    }
}
