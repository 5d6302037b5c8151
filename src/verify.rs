//! Read-back verification for bulk downloads.
//!
//! A producer streams read requests at the device and registers the bytes
//! it expects against each request handle. As responses arrive the chunks
//! are compared byte for byte; the absolute offset of the first mismatch is
//! kept. Finalisation fires `VerifySuccess` or `VerifyFail` with the error
//! count once every chunk has been resolved.
//!
//! Producers pace themselves with [`BulkVerifier::wait_until_buffer_clear`]
//! so no more than about 1 KiB of read traffic is outstanding at once.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::warn;

use crate::event::EventBus;
use crate::message::MessageHandle;

/// Events raised when a verify pass finalises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerifyEvent {
    VerifySuccess,
    VerifyFail,
}

/// Expected contents of one read-back request.
#[derive(Debug, Clone)]
pub struct VerifyChunk {
    pub handle: MessageHandle,
    pub expected: Vec<u8>,
    pub start_addr: u32,
}

/// Device inbound capacity the producer is paced against.
const BUFFER_CAPACITY: usize = 1024;

#[derive(Default)]
struct VerifierInner {
    chunks: Vec<VerifyChunk>,
    pending_bytes: usize,
    errors: u32,
    first_error: Option<u32>,
    finalising: bool,
}

/// Accumulates read-back chunks and compares them against the payload that
/// was originally sent.
pub struct BulkVerifier {
    inner: Mutex<VerifierInner>,
    cond: Condvar,
    events: EventBus<VerifyEvent>,
}

impl BulkVerifier {
    pub fn new() -> BulkVerifier {
        BulkVerifier {
            inner: Mutex::new(VerifierInner::default()),
            cond: Condvar::new(),
            events: EventBus::new(),
        }
    }

    pub fn events(&self) -> &EventBus<VerifyEvent> {
        &self.events
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = VerifierInner::default();
        drop(inner);
        self.cond.notify_all();
    }

    /// Registers the expected bytes for an outstanding read handle.
    pub fn add_chunk(&self, chunk: VerifyChunk) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending_bytes += chunk.expected.len();
        inner.chunks.push(chunk);
    }

    /// Number of mismatched chunks seen so far.
    pub fn errors(&self) -> u32 {
        self.inner.lock().unwrap().errors
    }

    /// Absolute offset of the first mismatching byte, when any.
    pub fn first_error(&self) -> Option<u32> {
        self.inner.lock().unwrap().first_error
    }

    pub fn in_progress(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.chunks.is_empty()
    }

    /// Blocks the producer until outstanding read traffic drops below the
    /// device's inbound capacity, or `timeout` elapses.
    pub fn wait_until_buffer_clear(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.pending_bytes >= BUFFER_CAPACITY {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
        true
    }

    /// Resolves the chunk registered for `handle` against the bytes the
    /// device actually returned.
    pub fn on_response(&self, handle: MessageHandle, actual: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let Some(pos) = inner.chunks.iter().position(|c| c.handle == handle) else {
            return;
        };
        let chunk = inner.chunks.remove(pos);
        inner.pending_bytes = inner.pending_bytes.saturating_sub(chunk.expected.len());

        let mut mismatch = None;
        for (i, &expected) in chunk.expected.iter().enumerate() {
            match actual.get(i) {
                Some(&byte) if byte == expected => continue,
                _ => {
                    mismatch = Some(chunk.start_addr + i as u32);
                    break;
                }
            }
        }
        if actual.len() > chunk.expected.len() && mismatch.is_none() {
            mismatch = Some(chunk.start_addr + chunk.expected.len() as u32);
        }

        if let Some(offset) = mismatch {
            inner.errors += 1;
            if inner.first_error.is_none() {
                inner.first_error = Some(offset);
            }
        }

        let finalise = inner.finalising && inner.chunks.is_empty();
        let errors = inner.errors;
        drop(inner);
        self.cond.notify_all();
        if finalise {
            self.fire(errors);
        }
    }

    /// Marks a chunk as failed without comparing, for read requests that
    /// ended in a transport or device error.
    pub fn on_error(&self, handle: MessageHandle) {
        let mut inner = self.inner.lock().unwrap();
        let Some(pos) = inner.chunks.iter().position(|c| c.handle == handle) else {
            return;
        };
        let chunk = inner.chunks.remove(pos);
        inner.pending_bytes = inner.pending_bytes.saturating_sub(chunk.expected.len());
        inner.errors += 1;
        if inner.first_error.is_none() {
            inner.first_error = Some(chunk.start_addr);
        }
        warn!("verify read {} failed outright", handle);

        let finalise = inner.finalising && inner.chunks.is_empty();
        let errors = inner.errors;
        drop(inner);
        self.cond.notify_all();
        if finalise {
            self.fire(errors);
        }
    }

    /// Declares the producer finished. The result event fires as soon as
    /// the last outstanding chunk resolves, immediately if none remain.
    pub fn finalize(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.finalising = true;
        let fire_now = inner.chunks.is_empty();
        let errors = inner.errors;
        drop(inner);
        if fire_now {
            self.fire(errors);
        }
    }

    fn fire(&self, errors: u32) {
        if errors == 0 {
            self.events.trigger(VerifyEvent::VerifySuccess, 0);
        } else {
            self.events.trigger(VerifyEvent::VerifyFail, errors as i32);
        }
    }
}

impl Default for BulkVerifier {
    fn default() -> Self {
        BulkVerifier::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn matching_chunks_verify_clean() {
        let verifier = BulkVerifier::new();
        let fired = Arc::new(AtomicI32::new(-1));
        let f = fired.clone();
        verifier.events().subscribe(VerifyEvent::VerifySuccess, move |_| {
            f.store(0, Ordering::SeqCst);
        });

        verifier.add_chunk(VerifyChunk {
            handle: 1,
            expected: vec![1, 2, 3],
            start_addr: 0,
        });
        verifier.add_chunk(VerifyChunk {
            handle: 2,
            expected: vec![4, 5, 6],
            start_addr: 3,
        });
        verifier.finalize();
        verifier.on_response(1, &[1, 2, 3]);
        verifier.on_response(2, &[4, 5, 6]);

        assert_eq!(verifier.errors(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn first_error_offset_is_absolute() {
        let verifier = BulkVerifier::new();
        verifier.add_chunk(VerifyChunk {
            handle: 7,
            expected: vec![0xaa, 0xbb, 0xcc, 0xdd],
            start_addr: 0x100,
        });
        verifier.on_response(7, &[0xaa, 0xbb, 0x00, 0xdd]);
        assert_eq!(verifier.errors(), 1);
        assert_eq!(verifier.first_error(), Some(0x102));
    }

    #[test]
    fn fail_event_carries_error_count() {
        let verifier = BulkVerifier::new();
        let count = Arc::new(AtomicI32::new(0));
        let c = count.clone();
        verifier.events().subscribe(VerifyEvent::VerifyFail, move |n| {
            c.store(n, Ordering::SeqCst);
        });

        for i in 0..3u32 {
            verifier.add_chunk(VerifyChunk {
                handle: i + 1,
                expected: vec![0x11],
                start_addr: i,
            });
        }
        verifier.on_response(1, &[0x11]);
        verifier.on_response(2, &[0x99]);
        verifier.on_error(3);
        verifier.finalize();

        // finalize after all chunks resolved fires immediately
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn short_response_is_a_mismatch() {
        let verifier = BulkVerifier::new();
        verifier.add_chunk(VerifyChunk {
            handle: 9,
            expected: vec![1, 2, 3, 4],
            start_addr: 8,
        });
        verifier.on_response(9, &[1, 2]);
        assert_eq!(verifier.first_error(), Some(10));
    }

    #[test]
    fn buffer_clear_paces_producer() {
        let verifier = Arc::new(BulkVerifier::new());
        verifier.add_chunk(VerifyChunk {
            handle: 1,
            expected: vec![0u8; 2048],
            start_addr: 0,
        });
        assert!(!verifier.wait_until_buffer_clear(Duration::from_millis(50)));

        let v = verifier.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            v.on_response(1, &vec![0u8; 2048]);
        });
        assert!(verifier.wait_until_buffer_clear(Duration::from_secs(2)));
        t.join().unwrap();
    }
}
