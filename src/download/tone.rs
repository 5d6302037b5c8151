//! Tone buffer download.
//!
//! The local tone buffer (LTB) is a small on-device table of preset tones.
//! Each entry carries four channels of frequency, amplitude and phase.
//! Programming an entry is a two-step exchange: the tone words are written
//! to the synthesiser's programming block, then an index write commits
//! them into the addressed LTB slot. The report channel's FIFO ordering
//! guarantees the commit lands after its data.

use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use log::{debug, trace};

use crate::download::{DownloadEvent, Fap, HandleTracker, Retired, WorkerGate, DOWNLOAD_WATERMARK};
use crate::event::{EventBus, MessageEvent, Subscription};
use crate::message::{MessageHandle, NULL_MESSAGE};
use crate::registers::{SYNTH_REG_PROG_FREQ0_L, SYNTH_REG_PROG_LOCAL};
use crate::report::{Action, Dir, Report};
use crate::scope::with_device;
use crate::system::System;
use crate::transport::ConnectionManager;

/// One preset tone, four channels of rendered device units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ToneBufferEntry {
    pub channels: [Fap; 4],
}

/// A rendered set of preset tones.
#[derive(Debug, Clone, Default)]
pub struct ToneBuffer {
    pub entries: Vec<ToneBufferEntry>,
}

/// Frequency low and high words, amplitude and phase for each channel.
fn entry_words(entry: &ToneBufferEntry) -> Vec<u16> {
    let mut words = Vec::with_capacity(16);
    for fap in entry.channels {
        words.push((fap.freq & 0xffff) as u16);
        words.push((fap.freq >> 16) as u16);
        words.push(fap.ampl);
        words.push(fap.phase);
    }
    words
}

struct ToneDlShared {
    device: Weak<System>,
    buffer: ToneBuffer,
    range: Mutex<(usize, usize)>,
    gate: WorkerGate,
    events: EventBus<DownloadEvent>,
    tracker: HandleTracker,
}

/// Background downloader for one [`ToneBuffer`].
pub struct ToneBufferDownload {
    shared: Arc<ToneDlShared>,
    engine_subs: Vec<Subscription<MessageEvent>>,
    worker: Option<JoinHandle<()>>,
}

impl ToneBufferDownload {
    pub fn new(system: &Arc<System>, buffer: ToneBuffer) -> ToneBufferDownload {
        let shared = Arc::new(ToneDlShared {
            device: Arc::downgrade(system),
            buffer,
            range: Mutex::new((0, 0)),
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

        ToneBufferDownload {
            shared,
            engine_subs,
            worker: Some(worker),
        }
    }

    pub fn events(&self) -> &EventBus<DownloadEvent> {
        &self.shared.events
    }

    /// Downloads every entry in the buffer.
    pub fn start_download(&self) -> bool {
        trace!("tone buffer download requested");
        self.start_download_range(0, self.shared.buffer.entries.len())
    }

    /// Downloads `count` entries starting at `index`.
    pub fn start_download_range(&self, index: usize, count: usize) -> bool {
        with_device(&self.shared.device, |sys| {
            if !sys.synthesiser_valid() {
                return false;
            }
            if index + count > self.shared.buffer.entries.len() {
                return false;
            }
            *self.shared.range.lock().unwrap() = (index, count);
            self.shared.gate.trigger()
        })
    }
}

impl Drop for ToneBufferDownload {
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

impl ToneDlShared {
    fn run_download(&self, sys: &Arc<System>) {
        let conn = sys.connection();
        let (start, count) = *self.range.lock().unwrap();
        debug!("tone buffer download: entries {start}..{}", start + count);

        self.tracker.clear();
        let mut final_handle = NULL_MESSAGE;

        for slot in start..start + count {
            let entry = &self.buffer.entries[slot];

            if !self.tracker.wait_below(DOWNLOAD_WATERMARK, &self.gate) {
                return;
            }
            let data = conn.send_msg(Report::host_with(
                Action::SynthReg,
                Dir::Write,
                SYNTH_REG_PROG_FREQ0_L,
                entry_words(entry),
            ));
            if data == NULL_MESSAGE {
                self.events.trigger(DownloadEvent::DownloadError, 0);
                return;
            }
            self.tracker.push(data);

            let commit = conn.send_msg(Report::host_with(
                Action::SynthReg,
                Dir::Write,
                SYNTH_REG_PROG_LOCAL,
                slot as u16,
            ));
            if commit == NULL_MESSAGE {
                self.events.trigger(DownloadEvent::DownloadError, 0);
                return;
            }
            self.tracker.push(commit);
            final_handle = commit;
        }

        if final_handle == NULL_MESSAGE {
            self.events.trigger(DownloadEvent::DownloadFinished, 0);
        } else {
            self.tracker.set_final(final_handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_words_pack_all_channels() {
        let mut entry = ToneBufferEntry::default();
        entry.channels[0] = Fap {
            freq: 0x0123_4567,
            ampl: 0x89ab,
            phase: 0xcdef,
        };
        let words = entry_words(&entry);
        assert_eq!(words.len(), 16);
        assert_eq!(&words[..4], &[0x4567, 0x0123, 0x89ab, 0xcdef]);
        assert_eq!(&words[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn entry_fits_one_report() {
        let words = entry_words(&ToneBufferEntry::default());
        assert_eq!(words.len() * 2, crate::report::PAYLOAD_MAX_LENGTH / 2);
    }
}
