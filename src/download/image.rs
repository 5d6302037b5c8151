//! Image download and verification.
//!
//! Two delivery strategies, chosen by the controller's capabilities:
//!
//! - **Fast transfer**: the image is registered in the device's image
//!   index, which assigns a memory index and target address, then the
//!   rendered bytes ship over the bulk channel in one transfer. The local
//!   image table mirror is updated on completion.
//! - **Report streaming**: the device's internal 4 Kpt memory is
//!   programmed through a stream of small write reports to
//!   auto-incrementing addresses. When all four channels of every point
//!   carry the same values the common-channels layout is used, which
//!   quadruples the point capacity. The producer pauses whenever too many
//!   writes are unacknowledged.
//!
//! Verification reads the same range back, over the bulk channel or
//! through read reports feeding the bulk verifier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, warn};

use crate::download::{Fap, HandleTracker, Retired, WorkerGate, DOWNLOAD_WATERMARK};
use crate::event::{EventBus, MessageEvent, Subscription};
use crate::message::{MessageHandle, NULL_MESSAGE};
use crate::registers::*;
use crate::report::{Action, Dir, ImageIndexOp, Report};
use crate::scope::with_device;
use crate::system::{Capabilities, ImageTableEntry, System};
use crate::transport::ConnectionManager;
use crate::verify::{BulkVerifier, VerifyChunk, VerifyEvent};

/// Progress notifications for one image download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageDownloadEvent {
    /// Payload fully delivered; parameter is bytes transferred when known.
    DownloadFinished,
    /// A write report failed; parameter is the failed handle.
    DownloadError,
    /// The bulk transfer aborted before completing.
    DownloadFailTransferAbort,
    /// The device's image index had no room for the entry.
    DownloadFailMemoryFull,
    /// The device assigned a memory index; parameter carries it.
    ImageDownloadNewHandle,
    /// Read-back verification matched everywhere.
    VerifySuccess,
    /// Read-back verification failed; parameter is the error count or
    /// first mismatch offset, depending on the transfer strategy.
    VerifyFail,
}

/// One playback point, four channels of rendered device units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImagePoint {
    pub channels: [Fap; 4],
}

impl ImagePoint {
    /// True when all four channels carry identical values.
    pub fn common(&self) -> bool {
        let first = self.channels[0];
        self.channels.iter().all(|&c| c == first)
    }
}

/// A rendered playback image, ready for download.
#[derive(Debug, Clone, Default)]
pub struct Image {
    pub name: String,
    pub uuid: [u8; 16],
    pub format: u32,
    pub points: Vec<ImagePoint>,
}

impl Image {
    pub fn size(&self) -> usize {
        self.points.len()
    }
}

// Per-point byte counts for the report-streamed layouts.
const COMMON_POINT_BYTES: usize = 5;
const QUAD_POINT_BYTES: usize = 20;
// Write reports carry at most this much point data.
const REPORT_CHUNK_BYTES: usize = 60;

fn freq_top16(fap: Fap, caps: &Capabilities) -> u16 {
    (fap.freq >> caps.freq_bits.saturating_sub(16)) as u16
}

fn push_common_point(data: &mut Vec<u8>, pt: &ImagePoint, caps: &Capabilities) {
    let fap = pt.channels[0];
    let freq = freq_top16(fap, caps);
    data.push((freq & 0xff) as u8);
    data.push((freq >> 8) as u8);
    data.push((fap.ampl & 0xff) as u8);
    // no phase data in common-channels mode
    data.push(0);
    data.push(0);
}

fn push_quad_point(data: &mut Vec<u8>, pt: &ImagePoint, caps: &Capabilities) {
    for fap in pt.channels {
        let freq = freq_top16(fap, caps);
        data.push((freq & 0xff) as u8);
        data.push((freq >> 8) as u8);
        data.push((fap.ampl & 0xff) as u8);
        data.push((fap.phase & 0xff) as u8);
        data.push((fap.phase >> 8) as u8);
    }
}

/// Renders the full image for the bulk channel: three 16-bit words per
/// channel per point. `msb_first` selects big-endian word order for
/// devices that advertise it.
fn format_image(image: &Image, caps: &Capabilities, msb_first: bool) -> Vec<u8> {
    let mut data = Vec::with_capacity(image.size() * 24);
    let mut push_word = |data: &mut Vec<u8>, word: u16| {
        if msb_first {
            data.push((word >> 8) as u8);
            data.push((word & 0xff) as u8);
        } else {
            data.push((word & 0xff) as u8);
            data.push((word >> 8) as u8);
        }
    };
    for pt in &image.points {
        for fap in pt.channels {
            push_word(&mut data, freq_top16(fap, caps));
            push_word(&mut data, fap.ampl);
            push_word(&mut data, fap.phase);
        }
    }
    data
}

/// Waits for the one bulk transfer this worker started to settle.
struct DmaSupervisor {
    result: Mutex<Option<i32>>,
    cond: Condvar,
}

impl DmaSupervisor {
    fn new() -> Arc<DmaSupervisor> {
        Arc::new(DmaSupervisor {
            result: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn complete(&self, bytes: i32) {
        *self.result.lock().unwrap() = Some(bytes);
        self.cond.notify_all();
    }

    /// Bytes transferred, or 0 when the transfer failed or the worker is
    /// shutting down.
    fn wait(&self, gate: &WorkerGate) -> i32 {
        let mut result = self.result.lock().unwrap();
        loop {
            if let Some(bytes) = *result {
                return bytes;
            }
            if !gate.running() {
                return 0;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(result, Duration::from_millis(100))
                .unwrap();
            result = guard;
        }
    }
}

/// Runs one bulk transfer to completion under `events`, returning the
/// transferred byte count (0 on failure).
pub(crate) fn run_supervised_transfer(
    events: &EventBus<MessageEvent>,
    gate: &WorkerGate,
    start: impl FnOnce() -> bool,
) -> i32 {
    let supervisor = DmaSupervisor::new();
    let on_complete = {
        let sup = supervisor.clone();
        events.subscribe(MessageEvent::MemoryTransferComplete, move |bytes| {
            sup.complete(bytes)
        })
    };
    let on_error = {
        let sup = supervisor.clone();
        events.subscribe(MessageEvent::MemoryTransferError, move |_| sup.complete(0))
    };

    let transferred = if start() { supervisor.wait(gate) } else { 0 };

    events.unsubscribe(&on_complete);
    events.unsubscribe(&on_error);
    transferred
}

struct ImageDlShared {
    device: Weak<System>,
    image: Image,
    gate: WorkerGate,
    verify_gate: WorkerGate,
    events: EventBus<ImageDownloadEvent>,
    tracker: HandleTracker,
    verifier: BulkVerifier,
    msb_first: AtomicBool,
}

/// Background downloader for one [`Image`].
pub struct ImageDownload {
    shared: Arc<ImageDlShared>,
    engine_subs: Vec<Subscription<MessageEvent>>,
    workers: Vec<JoinHandle<()>>,
}

impl ImageDownload {
    pub fn new(system: &Arc<System>, image: Image) -> ImageDownload {
        let shared = Arc::new(ImageDlShared {
            device: Arc::downgrade(system),
            image,
            gate: WorkerGate::new(),
            verify_gate: WorkerGate::new(),
            events: EventBus::new(),
            tracker: HandleTracker::new(),
            verifier: BulkVerifier::new(),
            msb_first: AtomicBool::new(false),
        });

        // forward verifier outcomes as image events
        {
            let weak = Arc::downgrade(&shared);
            shared.verifier.events().subscribe(VerifyEvent::VerifySuccess, move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.events.trigger(ImageDownloadEvent::VerifySuccess, 0);
                }
            });
            let weak = Arc::downgrade(&shared);
            shared.verifier.events().subscribe(VerifyEvent::VerifyFail, move |count| {
                if let Some(shared) = weak.upgrade() {
                    shared
                        .events
                        .trigger(ImageDownloadEvent::VerifyFail, count);
                }
            });
        }

        let engine_events = system.connection().events();
        let ok_sub = {
            let weak = Arc::downgrade(&shared);
            engine_events.subscribe(MessageEvent::ResponseReceived, move |param| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_response_ok(param as MessageHandle);
                }
            })
        };
        let mut engine_subs = vec![ok_sub];
        for kind in [
            MessageEvent::ResponseTimedOut,
            MessageEvent::ResponseErrorCrc,
            MessageEvent::ResponseErrorInvalid,
            MessageEvent::ResponseErrorValid,
        ] {
            let weak = Arc::downgrade(&shared);
            engine_subs.push(engine_events.subscribe(kind, move |param| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_response_err(param as MessageHandle);
                }
            }));
        }

        let workers = vec![
            {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    while shared.gate.wait_for_trigger() {
                        with_device(&shared.device, |sys| shared.run_download(sys));
                        shared.gate.finish_run();
                    }
                })
            },
            {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    while shared.verify_gate.wait_for_trigger() {
                        with_device(&shared.device, |sys| shared.run_verify(sys));
                        shared.verify_gate.finish_run();
                    }
                })
            },
        ];

        ImageDownload {
            shared,
            engine_subs,
            workers,
        }
    }

    pub fn events(&self) -> &EventBus<ImageDownloadEvent> {
        &self.shared.events
    }

    /// Kicks off the download. Returns false when preconditions fail or a
    /// run is already active.
    pub fn start_download(&self) -> bool {
        with_device(&self.shared.device, |sys| {
            if !sys.controller_valid() || !sys.synthesiser_valid() {
                return false;
            }
            let caps = sys.controller().caps;
            let conn = sys.connection();

            if caps.fast_transfer {
                // already resident images do not need another transfer
                let table = sys.controller().image_table;
                if table.iter().any(|e| e.uuid == self.shared.image.uuid) {
                    self.shared
                        .events
                        .trigger(ImageDownloadEvent::DownloadFinished, 0);
                    return true;
                }
            } else if !caps.simultaneous_playback {
                let resp =
                    conn.send_msg_blocking(Report::host(Action::CtrlrReg, Dir::Read, CTRLR_REG_IMG_CTRL));
                if resp.payload::<u16>() & CTRLR_IMG_CTRL_IOS_BUSY != 0 {
                    return false;
                }
            }
            self.shared.gate.trigger()
        })
    }

    /// Kicks off a read-back verify of the previously downloaded image.
    pub fn start_verify(&self) -> bool {
        with_device(&self.shared.device, |sys| {
            if !sys.controller_valid() {
                return false;
            }
            self.shared.verifier.reset();
            self.shared.verify_gate.trigger()
        })
    }

    pub fn verify_errors(&self) -> u32 {
        self.shared.verifier.errors()
    }
}

impl Drop for ImageDownload {
    fn drop(&mut self) {
        self.shared.gate.stop();
        self.shared.verify_gate.stop();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        with_device(&self.shared.device, |sys| {
            let events = sys.connection().events();
            for sub in &self.engine_subs {
                events.unsubscribe(sub);
            }
        });
    }
}

impl ImageDlShared {
    fn on_response_ok(&self, handle: MessageHandle) {
        if let Retired::Retired { was_final: true } = self.tracker.retire(handle) {
            self.events
                .trigger(ImageDownloadEvent::DownloadFinished, 0);
        }
        with_device(&self.device, |sys| {
            if let Some(resp) = sys.connection().engine().response(handle) {
                self.verifier
                    .on_response(handle, resp.report().payload_bytes());
            }
        });
    }

    fn on_response_err(&self, handle: MessageHandle) {
        if !matches!(self.tracker.retire(handle), Retired::NotTracked) {
            self.events
                .trigger(ImageDownloadEvent::DownloadError, handle as i32);
        }
        self.verifier.on_error(handle);
    }

    fn run_download(&self, sys: &Arc<System>) {
        let caps = sys.controller().caps;
        if caps.fast_transfer {
            self.run_fast_download(sys, &caps);
        } else {
            self.run_report_download(sys, &caps);
        }
    }

    fn run_fast_download(&self, sys: &Arc<System>, caps: &Capabilities) {
        let conn = sys.connection();

        // prefer the wide word order when the device can take it
        let resp = conn.send_msg_blocking(Report::host(
            Action::CtrlrReg,
            Dir::Read,
            CTRLR_REG_FPI_FORMAT,
        ));
        let fpi = resp.payload::<u16>();
        if fpi & CTRLR_FPI_FORMAT_MSB_CAPABLE != 0 {
            self.msb_first.store(true, Ordering::SeqCst);
            let enable = Report::host_with(
                Action::CtrlrReg,
                Dir::Write,
                CTRLR_REG_FPI_FORMAT,
                fpi << 1,
            );
            if conn.send_msg(enable) == NULL_MESSAGE {
                error!("failed to set MSB mode");
                return;
            }
        }

        let data = format_image(&self.image, caps, self.msb_first.load(Ordering::SeqCst));
        let image_bytes = data.len() as u32;
        let points = self.image.size() as u32;

        // register the image with the device's index
        let mut add_entry = Report::host(Action::CtrlrImgIdx, Dir::Write, 0);
        add_entry.context = ImageIndexOp::AddEntry as u8;
        let mut payload = Vec::with_capacity(44);
        payload.extend_from_slice(&self.image.uuid);
        payload.extend_from_slice(&image_bytes.to_le_bytes());
        payload.extend_from_slice(&points.to_le_bytes());
        payload.extend_from_slice(&self.image.format.to_le_bytes());
        let mut name = self.image.name.clone();
        name.truncate(16);
        let mut name_bytes = name.into_bytes();
        name_bytes.resize(16, b' ');
        payload.extend_from_slice(&name_bytes);
        add_entry.set_payload(payload);

        let resp = conn.send_msg_blocking(add_entry);
        if !resp.done() || resp.general_error() {
            self.events
                .trigger(ImageDownloadEvent::DownloadFailMemoryFull, 0);
            return;
        }
        let index = resp.addr();
        let address = resp.payload::<u32>();
        self.events
            .trigger(ImageDownloadEvent::ImageDownloadNewHandle, index as i32);

        let buffer = Arc::new(Mutex::new(data));
        let transferred = run_supervised_transfer(conn.events(), &self.gate, || {
            conn.memory_download(buffer.clone(), address, index as i32, self.image.uuid)
        });

        if transferred > 0 {
            let entry = ImageTableEntry {
                index,
                address,
                points,
                bytes: transferred as u32,
                uuid: self.image.uuid,
                name: self.image.name.clone(),
            };
            sys.with_controller_mut(|ctlr| {
                let pos = ctlr
                    .image_table
                    .iter()
                    .position(|e| e.index > index)
                    .unwrap_or(ctlr.image_table.len());
                ctlr.image_table.insert(pos, entry);
            });
            self.events
                .trigger(ImageDownloadEvent::DownloadFinished, transferred);
        } else {
            self.events
                .trigger(ImageDownloadEvent::DownloadFailTransferAbort, 0);
        }
    }

    fn run_report_download(&self, sys: &Arc<System>, caps: &Capabilities) {
        let conn = sys.connection();

        if conn.send_msg(Report::host_with(
            Action::CtrlrReg,
            Dir::Write,
            CTRLR_REG_IMG_CTRL,
            CTRLR_IMG_CTRL_DL_ACTIVE,
        )) == NULL_MESSAGE
        {
            return;
        }

        let common = self.image.points.iter().all(ImagePoint::common);
        let mut length = self.image.size().min(caps.max_image_size as usize);
        if !common {
            length = length.min(caps.max_image_size as usize / 4);
        }
        debug!(
            "image report download: {} points, common channels {}",
            length, common
        );

        self.tracker.clear();
        let mut img_index = 0usize;
        let mut final_handle = NULL_MESSAGE;
        let mut data = Vec::with_capacity(REPORT_CHUNK_BYTES);

        while img_index < length {
            let img_addr = if common { img_index } else { 4 * img_index } as u16;
            data.clear();
            let step = if common {
                COMMON_POINT_BYTES
            } else {
                QUAD_POINT_BYTES
            };
            while data.len() + step <= REPORT_CHUNK_BYTES && img_index < length {
                let pt = &self.image.points[img_index];
                if common {
                    push_common_point(&mut data, pt, caps);
                } else {
                    push_quad_point(&mut data, pt, caps);
                }
                img_index += 1;
            }

            if !self.tracker.wait_below(DOWNLOAD_WATERMARK, &self.gate) {
                return;
            }
            let handle = conn.send_msg(Report::host_with(
                Action::CtrlrImage,
                Dir::Write,
                img_addr,
                data.clone(),
            ));
            if handle == NULL_MESSAGE {
                self.events.trigger(ImageDownloadEvent::DownloadError, 0);
                return;
            }
            self.tracker.push(handle);
            final_handle = handle;
        }

        if final_handle == NULL_MESSAGE {
            // nothing to send for an empty image
            self.events
                .trigger(ImageDownloadEvent::DownloadFinished, 0);
        } else {
            self.tracker.set_final(final_handle);
        }

        // one less than the number of points is programmed
        if conn.send_msg(Report::host_with(
            Action::CtrlrReg,
            Dir::Write,
            CTRLR_REG_NUM_PTS,
            (length.saturating_sub(1)) as u16,
        )) == NULL_MESSAGE
        {
            return;
        }

        if conn.send_msg(Report::host_with(
            Action::CtrlrReg,
            Dir::Write,
            CTRLR_REG_UUID,
            self.image.uuid.to_vec(),
        )) == NULL_MESSAGE
        {
            return;
        }

        // this class of device holds a single image, replacing any previous
        sys.with_controller_mut(|ctlr| {
            ctlr.image_table.clear();
            ctlr.image_table.push(ImageTableEntry {
                index: 0,
                address: 0,
                points: length as u32,
                bytes: (length * QUAD_POINT_BYTES) as u32,
                uuid: self.image.uuid,
                name: self.image.name.clone(),
            });
        });

        let commit = if common {
            CTRLR_IMG_CTRL_COMMON_CHANNELS
        } else {
            0
        };
        if conn.send_msg(Report::host_with(
            Action::CtrlrReg,
            Dir::Write,
            CTRLR_REG_IMG_CTRL,
            commit,
        )) == NULL_MESSAGE
        {
            warn!("failed to clear image download mode");
        }
    }

    fn run_verify(&self, sys: &Arc<System>) {
        let caps = sys.controller().caps;
        let conn = sys.connection();

        if caps.fast_transfer {
            let expected =
                format_image(&self.image, &caps, self.msb_first.load(Ordering::SeqCst));
            let Some(entry) = sys
                .controller()
                .image_table
                .iter()
                .find(|e| e.uuid == self.image.uuid)
                .cloned()
            else {
                warn!("verify: image not present in the device index");
                self.events.trigger(ImageDownloadEvent::VerifyFail, 0);
                return;
            };

            let buffer = Arc::new(Mutex::new(Vec::new()));
            let transferred = run_supervised_transfer(conn.events(), &self.verify_gate, || {
                conn.memory_upload(
                    buffer.clone(),
                    entry.address,
                    entry.bytes as usize,
                    entry.index as i32,
                    entry.uuid,
                )
            });
            if transferred <= 0 {
                self.events
                    .trigger(ImageDownloadEvent::DownloadFailTransferAbort, 0);
                return;
            }

            let actual = buffer.lock().unwrap();
            let compare_len = expected.len().min(actual.len());
            match expected[..compare_len]
                .iter()
                .zip(&actual[..compare_len])
                .position(|(e, a)| e != a)
            {
                None => self.events.trigger(ImageDownloadEvent::VerifySuccess, 0),
                Some(offset) => self
                    .events
                    .trigger(ImageDownloadEvent::VerifyFail, offset as i32),
            }
        } else {
            let common = self.image.points.iter().all(ImagePoint::common);
            let mut length = self.image.size().min(caps.max_image_size as usize);
            if !common {
                length = length.min(caps.max_image_size as usize / 4);
            }

            let mut img_index = 0usize;
            let mut expected = Vec::with_capacity(REPORT_CHUNK_BYTES);
            while img_index < length {
                let img_addr = if common { img_index } else { 4 * img_index } as u16;
                expected.clear();
                let step = if common {
                    COMMON_POINT_BYTES
                } else {
                    QUAD_POINT_BYTES
                };
                while expected.len() + step <= REPORT_CHUNK_BYTES && img_index < length {
                    let pt = &self.image.points[img_index];
                    if common {
                        push_common_point(&mut expected, pt, &caps);
                    } else {
                        push_quad_point(&mut expected, pt, &caps);
                    }
                    img_index += 1;
                }

                if !self
                    .verifier
                    .wait_until_buffer_clear(Duration::from_secs(10))
                {
                    warn!("verify: device read buffer never cleared");
                    return;
                }
                let handle =
                    conn.send_msg(Report::host(Action::CtrlrImage, Dir::Read, img_addr));
                if handle == NULL_MESSAGE {
                    return;
                }
                self.verifier.add_chunk(VerifyChunk {
                    handle,
                    expected: expected.clone(),
                    start_addr: img_addr as u32,
                });
            }
            self.verifier.finalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Capabilities {
        Capabilities {
            freq_bits: 24,
            ..Capabilities::default()
        }
    }

    fn fap(freq: u32, ampl: u16, phase: u16) -> Fap {
        Fap { freq, ampl, phase }
    }

    #[test]
    fn common_point_layout() {
        let pt = ImagePoint {
            channels: [fap(0x00ab_cd00, 0x34, 0); 4],
        };
        assert!(pt.common());
        let mut data = Vec::new();
        push_common_point(&mut data, &pt, &caps());
        // top 16 bits of a 24-bit frequency, little endian, then amplitude
        assert_eq!(data, vec![0xcd, 0xab, 0x34, 0, 0]);
    }

    #[test]
    fn quad_point_layout() {
        let mut pt = ImagePoint::default();
        for (i, ch) in pt.channels.iter_mut().enumerate() {
            *ch = fap((0x0011_2200 + i as u32) << 8, i as u16, 0x0102);
        }
        assert!(!pt.common());
        let mut data = Vec::new();
        push_quad_point(&mut data, &pt, &caps());
        assert_eq!(data.len(), QUAD_POINT_BYTES);
        // phase words survive in the quad layout
        assert_eq!(&data[3..5], &[0x02, 0x01]);
    }

    #[test]
    fn format_image_word_order() {
        let image = Image {
            points: vec![ImagePoint {
                channels: [fap(0x00ab_cd00, 0x1234, 0x0567); 4],
            }],
            ..Image::default()
        };
        let le = format_image(&image, &caps(), false);
        let be = format_image(&image, &caps(), true);
        assert_eq!(le.len(), 24);
        assert_eq!(&le[..6], &[0xcd, 0xab, 0x34, 0x12, 0x67, 0x05]);
        assert_eq!(&be[..6], &[0xab, 0xcd, 0x12, 0x34, 0x05, 0x67]);
    }
}
