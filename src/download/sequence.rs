//! Sequence download and commit.
//!
//! A sequence is an ordered list of entries naming resident images or tone
//! buffer slots and their repeat counts. The whole list serialises into a
//! single byte buffer. Controllers that advertise sequence DMA take the
//! buffer over the bulk channel, chunked to the advertised buffer length
//! and confirmed by download interrupts; older controllers take one queue
//! write report per entry.
//!
//! The commit carries a termination descriptor telling the device what to
//! do when playback runs off the end. The insert-before form appends a
//! 16-byte target tag, a layout only the DMA-capable firmware understands.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::download::image::run_supervised_transfer;
use crate::download::{DownloadEvent, HandleTracker, Retired, WorkerGate, DOWNLOAD_WATERMARK};
use crate::event::{EventBus, MessageEvent, Subscription};
use crate::message::{MessageHandle, NULL_MESSAGE};
use crate::registers::{
    CTRLR_INTERRUPT_SEQDL_BUFFER_PROCESSED, CTRLR_INTERRUPT_SEQDL_COMPLETE,
    CTRLR_INTERRUPT_SEQDL_ERROR, CTRLR_SYNDMA_DMA_ABORT, CTRLR_SYNDMA_START_DMA,
};
use crate::report::{Action, Dir, Report};
use crate::scope::with_device;
use crate::system::System;
use crate::transport::ConnectionManager;

/// What the device does when sequence playback reaches the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceTermAction {
    /// Drop the sequence and fall back to idle output.
    Discard = 0,
    /// Hold the final entry's output.
    Halt = 1,
    /// Restart the sequence `value` times, forever when zero.
    Repeat = 2,
    /// Splice the next sequence in front of the entry named by the tag.
    InsertBefore = 3,
}

/// Termination descriptor appended to the sequence commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    pub action: SequenceTermAction,
    pub value: u32,
    pub insert_uuid: [u8; 16],
}

impl Default for Termination {
    fn default() -> Self {
        Termination {
            action: SequenceTermAction::Discard,
            value: 0,
            insert_uuid: [0; 16],
        }
    }
}

impl Termination {
    /// Wire form of the descriptor. `with_insert_tag` selects the newer
    /// layout that appends the insert-before target tag.
    pub fn encode(&self, with_insert_tag: bool) -> Vec<u8> {
        let mut data = Vec::with_capacity(22);
        data.extend_from_slice(&(self.action as u16).to_le_bytes());
        data.extend_from_slice(&self.value.to_le_bytes());
        if with_insert_tag && self.action == SequenceTermAction::InsertBefore {
            data.extend_from_slice(&self.insert_uuid);
        }
        data
    }
}

/// One step of a sequence: an image or a tone buffer slot plus repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceEntry {
    Image { uuid: [u8; 16], repeats: u32 },
    Tone { slot: u16, repeats: u32 },
}

const ENTRY_BYTES: usize = 24;
const ENTRY_FLAG_TONE: u32 = 0x0001;

fn push_entry(data: &mut Vec<u8>, entry: &SequenceEntry) {
    match entry {
        SequenceEntry::Image { uuid, repeats } => {
            data.extend_from_slice(uuid);
            data.extend_from_slice(&repeats.to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes());
        }
        SequenceEntry::Tone { slot, repeats } => {
            data.extend_from_slice(&[0u8; 16]);
            data.extend_from_slice(&repeats.to_le_bytes());
            let flags = ENTRY_FLAG_TONE | ((*slot as u32) << 16);
            data.extend_from_slice(&flags.to_le_bytes());
        }
    }
}

fn serialize_entries(entries: &[SequenceEntry]) -> Vec<u8> {
    let mut data = Vec::with_capacity(entries.len() * ENTRY_BYTES);
    for entry in entries {
        push_entry(&mut data, entry);
    }
    data
}

/// A sequence ready for download.
#[derive(Debug, Clone)]
pub struct ImageSequence {
    pub uuid: [u8; 16],
    pub entries: Vec<SequenceEntry>,
    pub termination: Termination,
}

/// Watches the sequence download interrupts during a DMA transfer.
struct SeqDlWatch {
    state: Mutex<Option<u16>>,
    cond: Condvar,
}

impl SeqDlWatch {
    fn new() -> Arc<SeqDlWatch> {
        Arc::new(SeqDlWatch {
            state: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn notice(&self, interrupt_type: u16) {
        *self.state.lock().unwrap() = Some(interrupt_type);
        self.cond.notify_all();
    }

    fn wait(&self, gate: &WorkerGate, timeout: Duration) -> Option<u16> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(kind) = state.take() {
                return Some(kind);
            }
            if !gate.running() || Instant::now() >= deadline {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, Duration::from_millis(100))
                .unwrap();
            state = guard;
        }
    }
}

struct SeqDlShared {
    device: Weak<System>,
    sequence: ImageSequence,
    gate: WorkerGate,
    events: EventBus<DownloadEvent>,
    tracker: HandleTracker,
}

/// Background downloader for one [`ImageSequence`].
pub struct SequenceDownload {
    shared: Arc<SeqDlShared>,
    engine_subs: Vec<Subscription<MessageEvent>>,
    worker: Option<JoinHandle<()>>,
}

impl SequenceDownload {
    pub fn new(system: &Arc<System>, sequence: ImageSequence) -> SequenceDownload {
        let shared = Arc::new(SeqDlShared {
            device: Arc::downgrade(system),
            sequence,
            gate: WorkerGate::new(),
            events: EventBus::new(),
            tracker: HandleTracker::new(),
        });

        let engine_events = system.connection().events();
        let mut engine_subs = Vec::new();
        {
            let weak = Arc::downgrade(&shared);
            engine_subs.push(engine_events.subscribe(
                MessageEvent::ResponseReceived,
                move |param| {
                    if let Some(shared) = weak.upgrade() {
                        if let Retired::Retired { was_final: true } =
                            shared.tracker.retire(param as MessageHandle)
                        {
                            shared.events.trigger(DownloadEvent::DownloadFinished, 0);
                        }
                    }
                },
            ));
        }
        for kind in [
            MessageEvent::ResponseTimedOut,
            MessageEvent::ResponseErrorCrc,
            MessageEvent::ResponseErrorInvalid,
            MessageEvent::ResponseErrorValid,
        ] {
            let weak = Arc::downgrade(&shared);
            engine_subs.push(engine_events.subscribe(kind, move |param| {
                if let Some(shared) = weak.upgrade() {
                    if !matches!(
                        shared.tracker.retire(param as MessageHandle),
                        Retired::NotTracked
                    ) {
                        shared.events.trigger(DownloadEvent::DownloadError, param);
                    }
                }
            }));
        }

        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                while shared.gate.wait_for_trigger() {
                    with_device(&shared.device, |sys| shared.run_download(sys));
                    shared.gate.finish_run();
                }
            })
        };

        SequenceDownload {
            shared,
            engine_subs,
            worker: Some(worker),
        }
    }

    pub fn events(&self) -> &EventBus<DownloadEvent> {
        &self.shared.events
    }

    pub fn start_download(&self) -> bool {
        with_device(&self.shared.device, |sys| {
            if !sys.controller_valid() {
                return false;
            }
            self.shared.gate.trigger()
        })
    }
}

impl Drop for SequenceDownload {
    fn drop(&mut self) {
        self.shared.gate.stop();
        if let Some(worker) = self.worker.take() {
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

impl SeqDlShared {
    fn run_download(&self, sys: &Arc<System>) {
        let caps = sys.controller().caps;
        let conn = sys.connection();

        // queue headroom check before anything ships
        let free = conn
            .send_msg_blocking(Report::host(Action::CtrlrSeqQueue, Dir::Read, 0))
            .payload::<u32>();
        if (free as usize) < self.sequence.entries.len() {
            self.events
                .trigger(DownloadEvent::DownloadFailMemoryFull, 0);
            return;
        }

        if caps.sequence_dma {
            self.run_dma_download(sys);
        } else {
            self.run_report_download(sys);
        }
    }

    fn run_dma_download(&self, sys: &Arc<System>) {
        let caps = sys.controller().caps;
        let conn = sys.connection();
        let data = serialize_entries(&self.sequence.entries);
        debug!("sequence DMA download: {} bytes", data.len());

        let watch = SeqDlWatch::new();
        let sub = {
            let watch = watch.clone();
            conn.events()
                .subscribe(MessageEvent::InterruptReceived, move |value| {
                    let kind = (value >> 16) as u16;
                    if matches!(
                        kind,
                        CTRLR_INTERRUPT_SEQDL_ERROR
                            | CTRLR_INTERRUPT_SEQDL_COMPLETE
                            | CTRLR_INTERRUPT_SEQDL_BUFFER_PROCESSED
                    ) {
                        watch.notice(kind);
                    }
                })
        };

        let started = conn.send_msg(Report::host_with(
            Action::CtrlrSynDma,
            Dir::Write,
            CTRLR_SYNDMA_START_DMA,
            (data.len() as u32).to_le_bytes().to_vec(),
        )) != NULL_MESSAGE;

        let mut ok = started;
        if ok {
            let chunk_len = (caps.sequence_buffer_len as usize).max(1);
            'chunks: for chunk in data.chunks(chunk_len) {
                let buffer = Arc::new(Mutex::new(chunk.to_vec()));
                let transferred = run_supervised_transfer(conn.events(), &self.gate, || {
                    conn.memory_download(buffer.clone(), 0, -1, self.sequence.uuid)
                });
                if transferred <= 0 {
                    ok = false;
                    break;
                }
                // the controller drains its staging buffer before the next
                // chunk may ship
                loop {
                    match watch.wait(&self.gate, Duration::from_secs(10)) {
                        Some(CTRLR_INTERRUPT_SEQDL_BUFFER_PROCESSED) => break,
                        Some(CTRLR_INTERRUPT_SEQDL_COMPLETE) => break,
                        Some(CTRLR_INTERRUPT_SEQDL_ERROR) | None => {
                            ok = false;
                            break 'chunks;
                        }
                        Some(_) => continue,
                    }
                }
            }
        }

        conn.events().unsubscribe(&sub);

        if ok {
            self.commit(sys, true);
            self.events
                .trigger(DownloadEvent::DownloadFinished, data.len() as i32);
        } else {
            warn!("sequence DMA transfer aborted");
            let _ = conn.send_msg(Report::host(
                Action::CtrlrSynDma,
                Dir::Write,
                CTRLR_SYNDMA_DMA_ABORT,
            ));
            self.events
                .trigger(DownloadEvent::DownloadFailTransferAbort, 0);
        }
    }

    fn run_report_download(&self, sys: &Arc<System>) {
        let conn = sys.connection();
        debug!(
            "sequence report download: {} entries",
            self.sequence.entries.len()
        );

        self.tracker.clear();
        for (index, entry) in self.sequence.entries.iter().enumerate() {
            let mut data = Vec::with_capacity(ENTRY_BYTES);
            push_entry(&mut data, entry);

            if !self.tracker.wait_below(DOWNLOAD_WATERMARK, &self.gate) {
                return;
            }
            let handle = conn.send_msg(Report::host_with(
                Action::CtrlrSeqQueue,
                Dir::Write,
                (index + 1) as u16,
                data,
            ));
            if handle == NULL_MESSAGE {
                self.events.trigger(DownloadEvent::DownloadError, 0);
                return;
            }
            self.tracker.push(handle);
        }

        // commit retires last; its acknowledgement finishes the download
        if let Some(handle) = self.commit(sys, false) {
            self.tracker.push(handle);
            self.tracker.set_final(handle);
        }
    }

    /// Writes the termination descriptor. Returns the commit handle.
    fn commit(&self, sys: &Arc<System>, with_insert_tag: bool) -> Option<MessageHandle> {
        let conn = sys.connection();
        let handle = conn.send_msg(Report::host_with(
            Action::CtrlrSeqQueue,
            Dir::Write,
            0,
            self.sequence.termination.encode(with_insert_tag),
        ));
        if handle == NULL_MESSAGE {
            self.events.trigger(DownloadEvent::DownloadError, 0);
            return None;
        }
        Some(handle)
    }
}
