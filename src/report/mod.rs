/*!
# Report Module

Framed command and response reports exchanged with iMS hardware.

A report on the wire is a kind tag, a flag header, a context byte, a 16-bit
payload length, a 16-bit address, up to [`PAYLOAD_MAX_LENGTH`] payload bytes
and a trailing CRC-16. [`Report`] holds the decoded form; serialisation and
the streaming parser live in [`codec`].

Host-originated reports are built with [`Report::host`] from an [`Action`]
and a [`Dir`]; device-originated reports arrive through [`DeviceReport`],
which wraps the parser and exposes the response flag predicates.
*/

pub mod codec;
mod payload;

pub use payload::PayloadCodec;

use codec::{ParserState, ReportParser};

/// Maximum number of payload bytes a single report may carry.
pub const PAYLOAD_MAX_LENGTH: usize = 64;
/// Fixed framing overhead: kind, header, context, length, address and CRC.
pub const OVERHEAD_MAX_LENGTH: usize = 9;
/// Largest possible serialised frame.
pub const FRAME_MAX_LENGTH: usize = PAYLOAD_MAX_LENGTH + OVERHEAD_MAX_LENGTH;

/// Kind tag carried in the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReportKind {
    HostSynth = 1,
    DeviceSynth = 2,
    HostController = 4,
    DeviceController = 5,
    ControllerInterrupt = 73,
    Null = 255,
}

impl ReportKind {
    pub fn from_u8(b: u8) -> ReportKind {
        match b {
            1 => ReportKind::HostSynth,
            2 => ReportKind::DeviceSynth,
            4 => ReportKind::HostController,
            5 => ReportKind::DeviceController,
            73 => ReportKind::ControllerInterrupt,
            _ => ReportKind::Null,
        }
    }

    /// True for the kinds a device may legally send to the host.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            ReportKind::DeviceSynth | ReportKind::DeviceController | ReportKind::ControllerInterrupt
        )
    }

    /// The kind the device answers a host report with, if any.
    pub fn response_kind(self) -> ReportKind {
        match self {
            ReportKind::HostSynth => ReportKind::DeviceSynth,
            ReportKind::HostController => ReportKind::DeviceController,
            _ => ReportKind::Null,
        }
    }
}

/// Functional groups addressed by host reports.
///
/// Bit 4 selects the controller over the synthesiser, bit 5 sets the context
/// byte, the low nibble lands in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    PllRef = 0x00,
    RfPower = 0x01,
    SynthEeprom = 0x02,
    AsyncDac = 0x03,
    ExtAdc = 0x04,
    AsyncControl = 0x05,
    LutEntry = 0x06,
    SynthReg = 0x07,
    AodTemp = 0x08,
    AodEeprom = 0x09,
    RfaAdc12 = 0x0a,
    RfaAdc34 = 0x0b,
    RfaTemp = 0x0c,
    RfaEeprom = 0x0d,
    RunScript = 0x0e,
    FanControl = 0x0f,
    CtrlrReg = 0x11,
    CtrlrImage = 0x12,
    CtrlrSettings = 0x13,
    CtrlrImgDma = 0x14,
    CtrlrImgIdx = 0x15,
    CtrlrSynDma = 0x16,
    CtrlrSeqQueue = 0x17,
    CtrlrSeqPlay = 0x18,
    CtrlrIntrEn = 0x19,
    FwUpgrade = 0x20,
    WaveShaping = 0x21,
    CtrlrFwUpgrade = 0x30,
}

/// Transfer direction encoded in the top bit of the host header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Dir {
    Write = 0x00,
    Read = 0x80,
}

/// Sub-operations of the controller image index ([`Action::CtrlrImgIdx`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ImageIndexOp {
    AddEntry = 0x00,
    DelEntry = 0x01,
    GetEntry = 0x02,
    CheckUuid = 0x03,
    GetTableSize = 0x04,
    EraseAll = 0x05,
}

const ACTIONS_MASK: u8 = 0x0f;

/// Decoded report frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub kind: ReportKind,
    pub hdr: u8,
    pub context: u8,
    pub addr: u16,
    payload: Vec<u8>,
}

impl Default for ReportKind {
    fn default() -> Self {
        ReportKind::Null
    }
}

impl Report {
    pub fn new(kind: ReportKind, hdr: u8, context: u8, addr: u16) -> Report {
        Report {
            kind,
            hdr,
            context,
            addr,
            payload: Vec::new(),
        }
    }

    /// Builds a host report addressed at a functional group register.
    pub fn host(action: Action, dir: Dir, addr: u16) -> Report {
        let code = action as u8;
        let kind = if code & 0x10 != 0 {
            ReportKind::HostController
        } else {
            ReportKind::HostSynth
        };
        Report {
            kind,
            hdr: (code & ACTIONS_MASK) | dir as u8,
            context: if code & 0x20 != 0 { 1 } else { 0 },
            addr,
            payload: Vec::new(),
        }
    }

    /// Builds a host report carrying an encoded payload value.
    pub fn host_with<T: PayloadCodec>(action: Action, dir: Dir, addr: u16, value: T) -> Report {
        let mut rpt = Report::host(action, dir, addr);
        rpt.set_payload(value);
        rpt
    }

    /// Payload length as it will appear in the serialised length field.
    pub fn len(&self) -> u16 {
        self.payload.len().min(PAYLOAD_MAX_LENGTH) as u16
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn clear_payload(&mut self) {
        self.payload.clear();
    }

    pub(crate) fn push_payload_byte(&mut self, b: u8) {
        self.payload.push(b);
    }

    /// Replaces the payload with the little-endian encoding of `value`.
    pub fn set_payload<T: PayloadCodec>(&mut self, value: T) {
        self.payload.clear();
        value.encode(&mut self.payload);
    }

    /// Decodes the payload, yielding the type's default when it is too short.
    pub fn payload<T: PayloadCodec>(&self) -> T {
        T::decode(&self.payload)
    }
}

// Device header flag bits. Data OK is asserted on success, so a clear bit
// signals an error whose kind the 0x20 bit selects.
pub(crate) const DEVICE_HDR_ALARM: u8 = 0x80;
pub(crate) const DEVICE_HDR_DATA_OK: u8 = 0x40;
pub(crate) const DEVICE_HDR_ERROR_GENERAL: u8 = 0x20;
pub(crate) const DEVICE_HDR_NHF_TIMEOUT: u8 = 0x10;

/// A report received from a device, together with its parse state.
///
/// Bytes from the transport are pushed through [`DeviceReport::parse`]; once
/// [`DeviceReport::done`] reports true the frame is either complete or ended
/// in a CRC error, and the flag predicates become meaningful.
#[derive(Debug, Clone, Default)]
pub struct DeviceReport {
    report: Report,
    parser: ReportParser,
}

impl DeviceReport {
    pub fn new() -> DeviceReport {
        DeviceReport::default()
    }

    /// Feeds one byte from the transport into the frame parser.
    pub fn parse(&mut self, byte: u8) {
        self.parser.parse(&mut self.report, byte);
    }

    /// Returns the parser to its idle state, ready for the next frame.
    pub fn reset_parser(&mut self) {
        self.parser.reset();
        self.report = Report::default();
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    pub fn kind(&self) -> ReportKind {
        self.report.kind
    }

    pub fn addr(&self) -> u16 {
        self.report.addr
    }

    pub fn payload<T: PayloadCodec>(&self) -> T {
        self.report.payload()
    }

    /// Parser has not consumed any frame bytes yet.
    pub fn idle(&self) -> bool {
        matches!(
            self.parser.state(),
            ParserState::Idle | ParserState::IdleUnexpectedChar
        )
    }

    /// Frame fully consumed, successfully or not.
    pub fn done(&self) -> bool {
        matches!(
            self.parser.state(),
            ParserState::Complete | ParserState::CrcError
        )
    }

    /// The received frame failed its CRC check.
    pub fn rx_crc(&self) -> bool {
        self.parser.state() == ParserState::CrcError
    }

    /// A byte that was not a known response kind arrived while idle.
    pub fn unexpected_char(&self) -> bool {
        self.parser.state() == ParserState::IdleUnexpectedChar
    }

    /// Device reported a CRC error in the frame the host sent it.
    pub fn tx_crc(&self) -> bool {
        self.report.hdr & DEVICE_HDR_DATA_OK == 0
            && self.report.hdr & DEVICE_HDR_ERROR_GENERAL == 0
    }

    /// Device's no-host-found watchdog expired.
    pub fn tx_timeout(&self) -> bool {
        self.report.hdr & DEVICE_HDR_NHF_TIMEOUT != 0
    }

    /// Device raised its hardware alarm flag.
    pub fn hardware_alarm(&self) -> bool {
        self.report.hdr & DEVICE_HDR_ALARM != 0
    }

    /// Device reported a non-CRC error while handling the request.
    pub fn general_error(&self) -> bool {
        self.report.hdr & DEVICE_HDR_DATA_OK == 0
            && self.report.hdr & DEVICE_HDR_ERROR_GENERAL != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_report_header_layout() {
        let rpt = Report::host(Action::SynthReg, Dir::Read, 0);
        assert_eq!(rpt.kind, ReportKind::HostSynth);
        assert_eq!(rpt.hdr, 0x87);
        assert_eq!(rpt.context, 0);
        assert_eq!(rpt.len(), 0);

        let rpt = Report::host(Action::CtrlrReg, Dir::Write, 54);
        assert_eq!(rpt.kind, ReportKind::HostController);
        assert_eq!(rpt.hdr, 0x01);

        let rpt = Report::host(Action::CtrlrFwUpgrade, Dir::Write, 1);
        assert_eq!(rpt.kind, ReportKind::HostController);
        assert_eq!(rpt.context, 1);

        let rpt = Report::host(Action::FwUpgrade, Dir::Read, 0);
        assert_eq!(rpt.kind, ReportKind::HostSynth);
        assert_eq!(rpt.context, 1);
    }

    #[test]
    fn device_flag_predicates() {
        let mut dr = DeviceReport::new();
        dr.report.hdr = 0x40;
        assert!(!dr.general_error());
        assert!(!dr.tx_crc());
        assert!(!dr.hardware_alarm());

        dr.report.hdr = 0x20;
        assert!(dr.general_error());
        assert!(!dr.tx_crc());

        dr.report.hdr = 0x00;
        assert!(dr.tx_crc());
        assert!(!dr.general_error());

        dr.report.hdr = 0xd0;
        assert!(dr.hardware_alarm());
        assert!(dr.tx_timeout());
        assert!(!dr.general_error());
    }
}
