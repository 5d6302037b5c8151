//! Connection engine tests against an in-memory device emulation.
//!
//! The mock link answers framed reports the way an instrument does: reads
//! return the register file contents, writes update it, and every frame is
//! acknowledged with the data-ok header bit. Silent and faulty variants
//! exercise the timeout and error paths.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use ims_sdk::report::codec::crc16;
use ims_sdk::transport::{BulkChannel, Link, SendOutcome};
use ims_sdk::{
    Engine, MessageEvent, MessageStatus, Report, ReportKind, Timeouts, NULL_MESSAGE,
};
use ims_sdk::{Action, Dir};

fn test_timeouts() -> Timeouts {
    Timeouts {
        send: Duration::from_millis(100),
        rx: Duration::from_millis(400),
        auto_free: Duration::from_secs(5),
        discover: Duration::from_millis(100),
    }
}

#[derive(Default)]
struct MockBehaviour {
    /// Swallow frames without answering.
    silent: AtomicBool,
    /// Corrupt the CRC of every response.
    corrupt_crc: AtomicBool,
    /// Fail every send outright.
    fail_sends: AtomicBool,
}

struct MockLink {
    behaviour: MockBehaviour,
    registers: Mutex<HashMap<(u8, u16), Vec<u8>>>,
    rx: Mutex<VecDeque<u8>>,
    rx_cond: Condvar,
    intr: Mutex<VecDeque<u8>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    sent_count: AtomicUsize,
}

impl MockLink {
    fn new() -> Arc<MockLink> {
        Arc::new(MockLink {
            behaviour: MockBehaviour::default(),
            registers: Mutex::new(HashMap::new()),
            rx: Mutex::new(VecDeque::new()),
            rx_cond: Condvar::new(),
            intr: Mutex::new(VecDeque::new()),
            files: Mutex::new(HashMap::new()),
            sent_count: AtomicUsize::new(0),
        })
    }

    fn queue_response(&self, frame: &[u8]) {
        let mut rx = self.rx.lock().unwrap();
        rx.extend(frame);
        drop(rx);
        self.rx_cond.notify_all();
    }

    /// Builds a complete device frame with a valid (or corrupted) CRC.
    fn device_frame(&self, kind: u8, hdr: u8, ctx: u8, addr: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![
            kind,
            hdr,
            ctx,
            (payload.len() & 0xff) as u8,
            (payload.len() >> 8) as u8,
            (addr & 0xff) as u8,
            (addr >> 8) as u8,
        ];
        frame.extend_from_slice(payload);
        let mut crc = crc16(&frame);
        if self.behaviour.corrupt_crc.load(Ordering::SeqCst) {
            crc ^= 0x0001;
        }
        frame.push((crc & 0xff) as u8);
        frame.push((crc >> 8) as u8);
        frame
    }

    fn queue_interrupt(&self, int_type: u16, datum: u16) {
        let frame = self.device_frame(
            ReportKind::ControllerInterrupt as u8,
            0x40,
            0,
            int_type,
            &datum.to_le_bytes(),
        );
        self.intr.lock().unwrap().extend(frame);
    }

    /// Parses one host frame and produces the matching acknowledgement.
    fn respond_to(&self, frame: &[u8]) {
        if frame.len() < 9 {
            return;
        }
        let kind = frame[0];
        let hdr = frame[1];
        let ctx = frame[2];
        let len = frame[3] as usize | ((frame[4] as usize) << 8);
        let addr = frame[5] as u16 | ((frame[6] as u16) << 8);
        let payload = &frame[7..7 + len];

        let response_kind = match kind {
            1 => 2,
            4 => 5,
            _ => return,
        };
        let action = hdr & 0x0f;
        let read = hdr & 0x80 != 0;

        let response_payload = if read {
            self.registers
                .lock()
                .unwrap()
                .get(&(action, addr))
                .cloned()
                .unwrap_or_else(|| vec![0, 0])
        } else {
            self.registers
                .lock()
                .unwrap()
                .insert((action, addr), payload.to_vec());
            Vec::new()
        };

        let frame = self.device_frame(response_kind, 0x40, ctx, addr, &response_payload);
        self.queue_response(&frame);
    }
}

impl Link for MockLink {
    fn send(&self, buf: &[u8], _timeout: Duration) -> SendOutcome {
        if self.behaviour.fail_sends.load(Ordering::SeqCst) {
            return SendOutcome::Error;
        }
        self.sent_count.fetch_add(1, Ordering::SeqCst);
        if !self.behaviour.silent.load(Ordering::SeqCst) {
            self.respond_to(buf);
        }
        SendOutcome::Sent
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock().unwrap();
        if rx.is_empty() {
            let (guard, _) = self
                .rx_cond
                .wait_timeout(rx, Duration::from_millis(50))
                .unwrap();
            rx = guard;
        }
        if rx.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = rx.len().min(buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = rx.pop_front().unwrap();
        }
        Ok(n)
    }

    fn has_interrupt_channel(&self) -> bool {
        true
    }

    fn recv_interrupt(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut intr = self.intr.lock().unwrap();
        if intr.is_empty() {
            drop(intr);
            std::thread::sleep(Duration::from_millis(20));
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = intr.len().min(buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = intr.pop_front().unwrap();
        }
        Ok(n)
    }

    fn bulk(&self) -> Option<&dyn BulkChannel> {
        Some(self)
    }

    fn close(&self) {}
}

impl BulkChannel for MockLink {
    fn put(&self, name: &str, data: &[u8]) -> io::Result<usize> {
        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), data.to_vec());
        Ok(data.len())
    }

    fn get(&self, name: &str, out: &mut Vec<u8>) -> io::Result<usize> {
        match self.files.lock().unwrap().get(name) {
            Some(data) => {
                *out = data.clone();
                Ok(out.len())
            }
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }
}

fn open_engine(link: &Arc<MockLink>) -> Engine {
    let engine = Engine::new(test_timeouts());
    engine.start(link.clone() as Arc<dyn Link>);
    engine
}

#[test]
fn blocking_register_read_round_trips() {
    let link = MockLink::new();
    link.registers
        .lock()
        .unwrap()
        .insert((0x07, 4), vec![0x34, 0x12]);
    let engine = open_engine(&link);

    let resp = engine.send_msg_blocking(Report::host(Action::SynthReg, Dir::Read, 4));
    assert!(resp.done());
    assert!(!resp.general_error());
    assert_eq!(resp.payload::<u16>(), 0x1234);
    assert_eq!(resp.addr(), 4);

    engine.shutdown();
}

#[test]
fn send_msg_on_closed_engine_returns_null() {
    let engine = Engine::new(test_timeouts());
    let handle = engine.send_msg(Report::host(Action::SynthReg, Dir::Read, 0));
    assert_eq!(handle, NULL_MESSAGE);
}

#[test]
fn responses_arrive_fifo_within_kind() {
    let link = MockLink::new();
    let engine = open_engine(&link);

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    engine
        .events()
        .subscribe(MessageEvent::ResponseReceived, move |param| {
            seen.lock().unwrap().push(param as u32);
        });

    let mut handles = Vec::new();
    for addr in 0..8u16 {
        let handle = engine.send_msg(Report::host(Action::SynthReg, Dir::Read, addr));
        assert_ne!(handle, NULL_MESSAGE);
        handles.push(handle);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while order.lock().unwrap().len() < handles.len() {
        assert!(std::time::Instant::now() < deadline, "responses missing");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(*order.lock().unwrap(), handles);

    engine.shutdown();
}

#[test]
fn unanswered_request_times_out() {
    let link = MockLink::new();
    link.behaviour.silent.store(true, Ordering::SeqCst);
    let engine = open_engine(&link);

    let timed_out = Arc::new(Mutex::new(Vec::new()));
    let seen = timed_out.clone();
    engine
        .events()
        .subscribe(MessageEvent::ResponseTimedOut, move |param| {
            seen.lock().unwrap().push(param as u32);
        });

    let resp = engine.send_msg_blocking(Report::host(Action::SynthReg, Dir::Read, 0));
    assert!(!resp.done());

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while timed_out.lock().unwrap().is_empty() {
        assert!(std::time::Instant::now() < deadline, "timeout event missing");
        std::thread::sleep(Duration::from_millis(10));
    }

    // silence the disconnect path as well: the interrupt-disable report
    // cannot be acknowledged, so shutdown rides the same timeout
    engine.shutdown();
}

#[test]
fn corrupted_response_raises_crc_error() {
    let link = MockLink::new();
    link.behaviour.corrupt_crc.store(true, Ordering::SeqCst);
    let engine = open_engine(&link);

    let crc_errors = Arc::new(AtomicUsize::new(0));
    let seen = crc_errors.clone();
    engine
        .events()
        .subscribe(MessageEvent::ResponseErrorCrc, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

    let handle = engine.send_msg(Report::host(Action::SynthReg, Dir::Read, 0));
    let resp = engine.wait_blocking(handle);
    assert!(resp.done());
    assert!(resp.rx_crc());
    assert_eq!(engine.status(handle), Some(MessageStatus::CrcError));
    assert_eq!(crc_errors.load(Ordering::SeqCst), 1);

    link.behaviour.corrupt_crc.store(false, Ordering::SeqCst);
    engine.shutdown();
}

#[test]
fn failed_send_is_terminal_with_event() {
    let link = MockLink::new();
    link.behaviour.fail_sends.store(true, Ordering::SeqCst);
    let engine = open_engine(&link);

    let send_errors = Arc::new(AtomicUsize::new(0));
    let seen = send_errors.clone();
    engine
        .events()
        .subscribe(MessageEvent::SendError, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

    let handle = engine.send_msg(Report::host(Action::SynthReg, Dir::Write, 1));
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if engine.status(handle) == Some(MessageStatus::SendError) {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "send never failed");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(send_errors.load(Ordering::SeqCst), 1);

    link.behaviour.fail_sends.store(false, Ordering::SeqCst);
    engine.shutdown();
}

#[test]
fn interrupts_fan_out_with_encoded_value() {
    let link = MockLink::new();
    let engine = open_engine(&link);

    let values = Arc::new(Mutex::new(Vec::new()));
    let seen = values.clone();
    engine
        .events()
        .subscribe(MessageEvent::InterruptReceived, move |value| {
            seen.lock().unwrap().push(value);
        });

    link.queue_interrupt(2, 0x0042);

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while values.lock().unwrap().is_empty() {
        assert!(std::time::Instant::now() < deadline, "interrupt missing");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(values.lock().unwrap()[0], (2 << 16) | 0x42);

    engine.shutdown();
}

#[test]
fn graceful_disconnect_drains_the_queue() {
    let link = MockLink::new();
    let engine = open_engine(&link);

    let mut handles = Vec::new();
    for addr in 0..32u16 {
        let handle = engine.send_msg(Report::host_with(
            Action::SynthReg,
            Dir::Write,
            addr,
            addr,
        ));
        assert_ne!(handle, NULL_MESSAGE);
        handles.push(handle);
    }

    engine.shutdown();

    for handle in handles {
        let status = engine.status(handle).expect("message vanished");
        assert!(
            status == MessageStatus::Sent || status.is_terminal(),
            "handle {handle} left in {status:?}"
        );
    }
    assert!(!engine.is_open());

    // a second disconnect is a no-op
    engine.shutdown();
    assert!(!engine.is_open());
}

#[test]
fn bulk_download_then_upload_is_byte_identical() {
    let link = MockLink::new();
    let engine = open_engine(&link);

    let completions = Arc::new(Mutex::new(Vec::new()));
    let seen = completions.clone();
    engine
        .events()
        .subscribe(MessageEvent::MemoryTransferComplete, move |bytes| {
            seen.lock().unwrap().push(bytes);
        });

    let uuid = ims_sdk::str_to_uuid("00112233445566778899aabbccddeeff").unwrap();
    let payload: Vec<u8> = (0..1_048_576u32).map(|v| (v % 253) as u8).collect();
    let buffer = Arc::new(Mutex::new(payload.clone()));
    assert!(engine.memory_download(buffer.clone(), 0x1000, 0, uuid));

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while completions.lock().unwrap().is_empty() {
        assert!(std::time::Instant::now() < deadline, "download never finished");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(completions.lock().unwrap()[0], 1_048_576);

    let readback = Arc::new(Mutex::new(Vec::new()));
    assert!(engine.memory_upload(readback.clone(), 0x1000, payload.len(), 0, uuid));

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while completions.lock().unwrap().len() < 2 {
        assert!(std::time::Instant::now() < deadline, "upload never finished");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(*readback.lock().unwrap(), payload);

    engine.shutdown();
}

#[test]
fn concurrent_transfer_requests_are_refused() {
    let link = MockLink::new();
    let engine = open_engine(&link);

    let refused = Arc::new(AtomicUsize::new(0));
    let seen = refused.clone();
    engine
        .events()
        .subscribe(MessageEvent::MemoryTransferNotIdle, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

    let uuid = [0u8; 16];
    let big = Arc::new(Mutex::new(vec![0u8; 4 * 1024 * 1024]));
    assert!(engine.memory_download(big.clone(), 0, 0, uuid));
    // the second request races the first; either it is refused or the
    // first one already finished
    let accepted = engine.memory_download(big.clone(), 0, 0, uuid);
    if !accepted {
        assert_eq!(refused.load(Ordering::SeqCst), 1);
    }

    engine.shutdown();
}
