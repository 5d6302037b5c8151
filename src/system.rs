/*!
# System Module

The per-device record produced by discovery. A [`System`] pairs the adapter
that found the device with the identities and capabilities of its two
functional halves, the controller and the synthesiser. Download workers
hold the record weakly (see [`crate::scope`]) so a discarded system can be
freed while workers are still winding down.
*/

use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};

use crate::report::{Action, Dir, Report};
use crate::transport::ConnectionManager;

/// Feature set advertised by one functional half, read once per
/// connection. The renderers that turn physical units into device integers
/// live outside this crate; the engine itself only consumes the flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    pub freq_bits: u8,
    pub ampl_bits: u8,
    pub phase_bits: u8,
    pub lut_depth: u32,
    pub lut_ampl_bits: u8,
    pub lut_phase_bits: u8,
    /// Largest image the device can hold, in points.
    pub max_image_size: u32,
    /// Device has large playback memory and supports the bulk channel.
    pub fast_transfer: bool,
    /// Device can play one image while another downloads.
    pub simultaneous_playback: bool,
    /// Device accepts sequence downloads through autonomous block transfer.
    pub sequence_dma: bool,
    /// Largest single sequence buffer the device advertises, in bytes.
    pub sequence_buffer_len: u32,
    /// Firmware can be upgraded in the field over this connection.
    pub remote_upgrade: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            freq_bits: 24,
            ampl_bits: 10,
            phase_bits: 12,
            lut_depth: 256,
            lut_ampl_bits: 10,
            lut_phase_bits: 12,
            max_image_size: 4096,
            fast_transfer: false,
            simultaneous_playback: false,
            sequence_dma: false,
            sequence_buffer_len: 16 * 1024 * 1024,
            remote_upgrade: false,
        }
    }
}

const CAP_FLAG_FAST_TRANSFER: u8 = 0x01;
const CAP_FLAG_SIMULTANEOUS_PLAYBACK: u8 = 0x02;
const CAP_FLAG_SEQUENCE_DMA: u8 = 0x04;
const CAP_FLAG_REMOTE_UPGRADE: u8 = 0x08;

impl Capabilities {
    /// Decodes the little-endian capability page returned by the settings
    /// read. Layout: bit widths (3 bytes), feature flags (1 byte), maximum
    /// image size (u32), LUT depth (u32), LUT bit widths (2 bytes),
    /// reserved (2 bytes), sequence buffer length (u32).
    pub fn decode(page: &[u8]) -> Capabilities {
        if page.len() < 20 {
            return Capabilities::default();
        }
        let flags = page[3];
        Capabilities {
            freq_bits: page[0],
            ampl_bits: page[1],
            phase_bits: page[2],
            fast_transfer: flags & CAP_FLAG_FAST_TRANSFER != 0,
            simultaneous_playback: flags & CAP_FLAG_SIMULTANEOUS_PLAYBACK != 0,
            sequence_dma: flags & CAP_FLAG_SEQUENCE_DMA != 0,
            remote_upgrade: flags & CAP_FLAG_REMOTE_UPGRADE != 0,
            max_image_size: LittleEndian::read_u32(&page[4..8]),
            lut_depth: LittleEndian::read_u32(&page[8..12]),
            lut_ampl_bits: page[12],
            lut_phase_bits: page[13],
            sequence_buffer_len: LittleEndian::read_u32(&page[16..20]),
        }
    }
}

/// One row of the controller's image index, mirrored locally after a
/// successful download.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTableEntry {
    pub index: u16,
    pub address: u32,
    pub points: u32,
    pub bytes: u32,
    pub uuid: [u8; 16],
    pub name: String,
}

/// The controller half of a device.
#[derive(Debug, Clone, Default)]
pub struct Controller {
    pub valid: bool,
    pub model: String,
    pub caps: Capabilities,
    pub image_table: Vec<ImageTableEntry>,
}

/// The synthesiser half of a device.
#[derive(Debug, Clone, Default)]
pub struct Synthesiser {
    pub valid: bool,
    pub model: String,
    pub caps: Capabilities,
}

/// An instrument reachable through one adapter.
pub struct System {
    conn: Arc<dyn ConnectionManager>,
    port: String,
    ctlr: Mutex<Controller>,
    synth: Mutex<Synthesiser>,
}

impl System {
    pub fn create(conn: Arc<dyn ConnectionManager>, port: impl Into<String>) -> Arc<System> {
        Arc::new(System {
            conn,
            port: port.into(),
            ctlr: Mutex::new(Controller::default()),
            synth: Mutex::new(Synthesiser::default()),
        })
    }

    /// The adapter this device was discovered through.
    pub fn connection(&self) -> &Arc<dyn ConnectionManager> {
        &self.conn
    }

    /// Connection port string, `serial` or `serial:ip`.
    pub fn conn_port(&self) -> &str {
        &self.port
    }

    /// Queries both functional halves over the open connection and caches
    /// their identities and capabilities. Returns true when at least one
    /// half answered.
    pub fn initialise(&self) -> bool {
        debug!("initialising system {}", self.port);

        let ctlr_resp = self
            .conn
            .send_msg_blocking(Report::host(Action::CtrlrSettings, Dir::Read, 0));
        if ctlr_resp.done() && !ctlr_resp.general_error() {
            let page: Vec<u8> = ctlr_resp.payload();
            let mut ctlr = self.ctlr.lock().unwrap();
            ctlr.valid = true;
            ctlr.model = String::from_utf8_lossy(
                page.get(20..36).unwrap_or_default(),
            )
            .trim_end_matches([' ', '\0'])
            .to_string();
            ctlr.caps = Capabilities::decode(&page);
        }

        let synth_resp = self
            .conn
            .send_msg_blocking(Report::host(Action::SynthEeprom, Dir::Read, 0));
        if synth_resp.done() && !synth_resp.general_error() {
            let page: Vec<u8> = synth_resp.payload();
            let mut synth = self.synth.lock().unwrap();
            synth.valid = true;
            synth.model = String::from_utf8_lossy(
                page.get(20..36).unwrap_or_default(),
            )
            .trim_end_matches([' ', '\0'])
            .to_string();
            synth.caps = Capabilities::decode(&page);
        }

        let valid = self.ctlr.lock().unwrap().valid || self.synth.lock().unwrap().valid;
        if valid {
            info!("system {} initialised", self.port);
        }
        valid
    }

    pub fn controller(&self) -> Controller {
        self.ctlr.lock().unwrap().clone()
    }

    pub fn synthesiser(&self) -> Synthesiser {
        self.synth.lock().unwrap().clone()
    }

    pub fn controller_valid(&self) -> bool {
        self.ctlr.lock().unwrap().valid
    }

    pub fn synthesiser_valid(&self) -> bool {
        self.synth.lock().unwrap().valid
    }

    pub(crate) fn with_controller_mut<R>(&self, f: impl FnOnce(&mut Controller) -> R) -> R {
        f(&mut self.ctlr.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_page_decodes() {
        let mut page = vec![0u8; 20];
        page[0] = 28;
        page[1] = 12;
        page[2] = 14;
        page[3] = CAP_FLAG_FAST_TRANSFER | CAP_FLAG_SEQUENCE_DMA;
        LittleEndian::write_u32(&mut page[4..8], 1 << 20);
        LittleEndian::write_u32(&mut page[8..12], 512);
        page[12] = 10;
        page[13] = 12;
        LittleEndian::write_u32(&mut page[16..20], 16 * 1024 * 1024);

        let caps = Capabilities::decode(&page);
        assert_eq!(caps.freq_bits, 28);
        assert!(caps.fast_transfer);
        assert!(caps.sequence_dma);
        assert!(!caps.simultaneous_playback);
        assert!(!caps.remote_upgrade);
        assert_eq!(caps.max_image_size, 1 << 20);
        assert_eq!(caps.lut_depth, 512);
    }

    #[test]
    fn short_capability_page_yields_defaults() {
        let caps = Capabilities::decode(&[1, 2, 3]);
        assert_eq!(caps, Capabilities::default());
    }
}
