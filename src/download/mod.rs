/*!
# Download Module

Background workers that move payload objects onto a device: playback
images, compensation tables, tone buffers, sequences and firmware. Each
worker owns a thread that idles until `start_download()` (or the family's
equivalent) triggers it, checks its preconditions, renders the payload to
reports or a bulk transfer, and surfaces progress through its own event
bus.

Workers that stream small write reports keep a list of outstanding message
handles and pause the producer when more than [`DOWNLOAD_WATERMARK`]
messages are in flight, resuming as acknowledgements retire them.

All payload values are already in device units; converting physical
frequencies, amplitudes and phases into those integers is the business of
the rendering layer above this crate.
*/

pub mod compensation;
pub mod firmware;
pub mod image;
pub mod sequence;
pub mod tone;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::message::{MessageHandle, NULL_MESSAGE};

/// Outcome events shared by the table-style download workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadEvent {
    /// Payload fully delivered; parameter is bytes transferred where known.
    DownloadFinished,
    /// A write report failed; parameter is the failed handle.
    DownloadError,
    /// The bulk channel aborted mid-transfer.
    DownloadFailTransferAbort,
    /// The device could not take the payload.
    DownloadFailMemoryFull,
    /// Read-back verification matched everywhere.
    VerifySuccess,
    /// Read-back verification found mismatches; parameter is the count.
    VerifyFail,
}

/// Maximum write reports left unacknowledged before the producer pauses.
pub(crate) const DOWNLOAD_WATERMARK: usize = 16;

const GATE_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Idle,
    Triggered,
    Busy,
}

/// Start/stop plumbing shared by every worker thread.
pub(crate) struct WorkerGate {
    running: AtomicBool,
    state: Mutex<GateState>,
    cond: Condvar,
}

impl WorkerGate {
    pub(crate) fn new() -> WorkerGate {
        WorkerGate {
            running: AtomicBool::new(true),
            state: Mutex::new(GateState::Idle),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests one run of the worker. Returns false while a previous run
    /// is still pending or active.
    pub(crate) fn trigger(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != GateState::Idle {
            return false;
        }
        *state = GateState::Triggered;
        drop(state);
        self.cond.notify_one();
        true
    }

    /// Worker side: blocks until triggered. Returns false on shutdown.
    pub(crate) fn wait_for_trigger(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            if !self.running() {
                return false;
            }
            if *state == GateState::Triggered {
                *state = GateState::Busy;
                return true;
            }
            let (guard, _) = self.cond.wait_timeout(state, GATE_TICK).unwrap();
            state = guard;
        }
    }

    /// Worker side: marks the current run finished.
    pub(crate) fn finish_run(&self) {
        *self.state.lock().unwrap() = GateState::Idle;
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cond.notify_all();
    }
}

/// Result of retiring a handle from a [`HandleTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retired {
    NotTracked,
    Retired { was_final: bool },
}

#[derive(Default)]
struct TrackerInner {
    outstanding: Vec<MessageHandle>,
    final_handle: MessageHandle,
}

/// Outstanding write handles for one streaming download, shared between the
/// producing worker and the engine event subscriptions that retire them.
pub(crate) struct HandleTracker {
    inner: Mutex<TrackerInner>,
    cond: Condvar,
}

impl HandleTracker {
    pub(crate) fn new() -> HandleTracker {
        HandleTracker {
            inner: Mutex::new(TrackerInner::default()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.outstanding.clear();
        inner.final_handle = NULL_MESSAGE;
        drop(inner);
        self.cond.notify_all();
    }

    pub(crate) fn push(&self, handle: MessageHandle) {
        self.inner.lock().unwrap().outstanding.push(handle);
    }

    /// Marks the handle whose acknowledgement completes the download.
    pub(crate) fn set_final(&self, handle: MessageHandle) {
        self.inner.lock().unwrap().final_handle = handle;
    }

    pub(crate) fn retire(&self, handle: MessageHandle) -> Retired {
        let mut inner = self.inner.lock().unwrap();
        let Some(pos) = inner.outstanding.iter().position(|&h| h == handle) else {
            return Retired::NotTracked;
        };
        inner.outstanding.remove(pos);
        let was_final = inner.final_handle == handle;
        drop(inner);
        self.cond.notify_all();
        Retired::Retired { was_final }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.inner.lock().unwrap().outstanding.len()
    }

    /// Blocks the producer until fewer than `watermark` handles remain
    /// outstanding. Returns false when `gate` shut down while waiting.
    pub(crate) fn wait_below(&self, watermark: usize, gate: &WorkerGate) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.outstanding.len() >= watermark {
            if !gate.running() {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(inner, GATE_TICK).unwrap();
            inner = guard;
        }
        true
    }
}

/// One channel's worth of rendered point data: frequency, amplitude and
/// phase in device integer units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fap {
    pub freq: u32,
    pub ampl: u16,
    pub phase: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_rejects_double_trigger() {
        let gate = WorkerGate::new();
        assert!(gate.trigger());
        assert!(!gate.trigger());
        assert!(gate.wait_for_trigger());
        assert!(!gate.trigger());
        gate.finish_run();
        assert!(gate.trigger());
    }

    #[test]
    fn gate_wait_returns_false_after_stop() {
        let gate = WorkerGate::new();
        gate.stop();
        assert!(!gate.wait_for_trigger());
    }

    #[test]
    fn tracker_retires_and_reports_final() {
        let tracker = HandleTracker::new();
        tracker.push(1);
        tracker.push(2);
        tracker.set_final(2);
        assert_eq!(tracker.retire(3), Retired::NotTracked);
        assert_eq!(tracker.retire(1), Retired::Retired { was_final: false });
        assert_eq!(tracker.retire(2), Retired::Retired { was_final: true });
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn tracker_watermark_unblocks_as_handles_retire() {
        use std::sync::Arc;
        let tracker = Arc::new(HandleTracker::new());
        let gate = Arc::new(WorkerGate::new());
        for h in 1..=DOWNLOAD_WATERMARK as u32 {
            tracker.push(h);
        }

        let t = tracker.clone();
        let g = gate.clone();
        let waiter = std::thread::spawn(move || t.wait_below(DOWNLOAD_WATERMARK, &g));
        std::thread::sleep(Duration::from_millis(20));
        tracker.retire(1);
        assert!(waiter.join().unwrap());
    }
}
