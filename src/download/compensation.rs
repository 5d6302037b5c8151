//! Compensation table download.
//!
//! A compensation table is a lookup table indexed by frequency whose
//! entries trim amplitude and phase. Tables apply globally or, on firmware
//! that advertises channel scoping, to a single RF channel. Entries are
//! eight bytes on the wire and stream to the device in 64-byte write
//! reports with the usual outstanding-handle watermark.

use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use log::debug;

use crate::download::{DownloadEvent, HandleTracker, Retired, WorkerGate, DOWNLOAD_WATERMARK};
use crate::event::{EventBus, MessageEvent, Subscription};
use crate::message::{MessageHandle, NULL_MESSAGE};
use crate::registers::{SYNTH_CHAN_SCOPE_SUPPORTED, SYNTH_REG_CHAN_SCOPE};
use crate::report::{Action, Dir, Report};
use crate::scope::with_device;
use crate::system::System;
use crate::transport::ConnectionManager;

/// Which channels a table applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationScope {
    /// Trim every channel identically.
    Global,
    /// Trim one RF channel (1 to 4). Needs firmware support.
    Channel(u8),
}

/// One lookup entry, already rendered to device units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompensationPoint {
    pub ampl: u16,
    pub phase: u16,
}

/// A rendered compensation lookup table.
#[derive(Debug, Clone)]
pub struct CompensationTable {
    pub points: Vec<CompensationPoint>,
    pub scope: CompensationScope,
}

const ENTRY_BYTES: usize = 8;
const ENTRIES_PER_REPORT: usize = 8;

fn push_entry(data: &mut Vec<u8>, point: &CompensationPoint) {
    data.extend_from_slice(&point.ampl.to_le_bytes());
    data.extend_from_slice(&point.phase.to_le_bytes());
    // remaining words reserved
    data.extend_from_slice(&[0u8; 4]);
}

struct CompDlShared {
    device: Weak<System>,
    table: Mutex<CompensationTable>,
    gate: WorkerGate,
    events: EventBus<DownloadEvent>,
    tracker: HandleTracker,
}

/// Background downloader for one [`CompensationTable`].
pub struct CompensationDownload {
    shared: Arc<CompDlShared>,
    engine_subs: Vec<Subscription<MessageEvent>>,
    worker: Option<JoinHandle<()>>,
}

impl CompensationDownload {
    pub fn new(system: &Arc<System>, table: CompensationTable) -> CompensationDownload {
        let shared = Arc::new(CompDlShared {
            device: Arc::downgrade(system),
            table: Mutex::new(table),
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

        CompensationDownload {
            shared,
            engine_subs,
            worker: Some(worker),
        }
    }

    pub fn events(&self) -> &EventBus<DownloadEvent> {
        &self.shared.events
    }

    /// Kicks off the download. Channel-scoped tables fail here when the
    /// firmware does not support scoping.
    pub fn start_download(&self) -> bool {
        with_device(&self.shared.device, |sys| {
            if !sys.synthesiser_valid() {
                return false;
            }
            let scope = self.shared.table.lock().unwrap().scope;
            if let CompensationScope::Channel(channel) = scope {
                if !(1..=4).contains(&channel) {
                    return false;
                }
                let resp = sys.connection().send_msg_blocking(Report::host(
                    Action::SynthReg,
                    Dir::Read,
                    SYNTH_REG_CHAN_SCOPE,
                ));
                if resp.payload::<u16>() & SYNTH_CHAN_SCOPE_SUPPORTED == 0 {
                    return false;
                }
            }
            self.shared.gate.trigger()
        })
    }
}

impl Drop for CompensationDownload {
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

impl CompDlShared {
    fn run_download(&self, sys: &Arc<System>) {
        let conn = sys.connection();
        let table = self.table.lock().unwrap().clone();

        if let CompensationScope::Channel(channel) = table.scope {
            if conn.send_msg(Report::host_with(
                Action::SynthReg,
                Dir::Write,
                SYNTH_REG_CHAN_SCOPE,
                channel as u16,
            )) == NULL_MESSAGE
            {
                return;
            }
        }

        debug!("compensation download: {} entries", table.points.len());
        self.tracker.clear();
        let mut final_handle = NULL_MESSAGE;

        for (chunk_index, chunk) in table.points.chunks(ENTRIES_PER_REPORT).enumerate() {
            let mut data = Vec::with_capacity(ENTRY_BYTES * chunk.len());
            for point in chunk {
                push_entry(&mut data, point);
            }
            if !self.tracker.wait_below(DOWNLOAD_WATERMARK, &self.gate) {
                return;
            }
            let addr = (chunk_index * ENTRIES_PER_REPORT) as u16;
            let handle =
                conn.send_msg(Report::host_with(Action::LutEntry, Dir::Write, addr, data));
            if handle == NULL_MESSAGE {
                self.events.trigger(DownloadEvent::DownloadError, 0);
                return;
            }
            self.tracker.push(handle);
            final_handle = handle;
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
    fn entry_is_eight_bytes() {
        let mut data = Vec::new();
        push_entry(
            &mut data,
            &CompensationPoint {
                ampl: 0x0123,
                phase: 0x4567,
            },
        );
        assert_eq!(data, vec![0x23, 0x01, 0x67, 0x45, 0, 0, 0, 0]);
    }

    #[test]
    fn chunking_fills_reports() {
        let points = vec![CompensationPoint::default(); 20];
        let chunks: Vec<_> = points.chunks(ENTRIES_PER_REPORT).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 8);
        assert_eq!(chunks[2].len(), 4);
    }
}
