/*!
# Connection Engine Module

The concurrent engine bound to one open device. It owns the outbound
message queue, the receive byte queue, the in-flight message registry and
the bulk-transfer slot, and runs four or five cooperating threads:

- **sender** waits on the outbound queue and is the sole writer to the
  transport, so frames are atomically sequenced;
- **receiver** drains ready transport bytes into the receive queue;
- **parser** feeds the receive queue through the frame parser, matches
  responses to the oldest outstanding request of the matching kind, fans
  out interrupt notifications and garbage collects aged messages;
- **bulk** serves memory download/upload requests over the transport's
  auxiliary file channel;
- **interrupt** (only on transports with a side channel) parses frames
  arriving on the dedicated interrupt connection.

All events fire synchronously on the engine thread that produced them;
handlers must not call back into blocking operations on the same engine.

Disconnect is the only cancellation signal. [`Engine::shutdown`] first
disables device interrupts, drains the queue, waits for every in-flight
message to go terminal, then stops and joins all threads before the link
is closed.
*/

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::event::{EventBus, MessageEvent};
use crate::message::{Message, MessageHandle, MessageRegistry, MessageStatus, NULL_MESSAGE};
use crate::report::{Action, DeviceReport, Dir, Report, ReportKind};
use crate::transport::{Link, SendOutcome, Timeouts};
use crate::util::uuid_to_str;

/// State of the auxiliary bulk channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FastTransferStatus {
    Idle = 0,
    Downloading = 1,
    Uploading = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferDirection {
    Download,
    Upload,
}

/// Pending bulk transfer. Valid only while the transfer status is not
/// [`FastTransferStatus::Idle`].
struct BulkTransfer {
    direction: TransferDirection,
    #[allow(dead_code)]
    start_addr: u32,
    #[allow(dead_code)]
    index: i32,
    uuid: [u8; 16],
    buffer: Arc<Mutex<Vec<u8>>>,
}

// TFTP data granularity the device expects download buffers padded to.
const TRANSFER_GRANULARITY: usize = 512;

// Periodic wake intervals so blocked threads can observe shutdown.
const TX_TICK: Duration = Duration::from_millis(100);
const RX_TICK: Duration = Duration::from_millis(100);
const DRAIN_POLL: Duration = Duration::from_millis(25);

struct Shared {
    open: AtomicBool,
    link: Mutex<Option<Arc<dyn Link>>>,
    tx_queue: Mutex<VecDeque<Arc<Message>>>,
    tx_cond: Condvar,
    rx_queue: Mutex<VecDeque<u8>>,
    rx_cond: Condvar,
    registry: MessageRegistry,
    events: EventBus<MessageEvent>,
    timeouts: Mutex<Timeouts>,
    transfer: Mutex<Option<BulkTransfer>>,
    transfer_cond: Condvar,
    transfer_status: AtomicU8,
}

impl Shared {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn timeouts(&self) -> Timeouts {
        *self.timeouts.lock().unwrap()
    }

    /// Routes one completed frame: interrupts become synthetic messages and
    /// an `InterruptReceived` notification, responses retire the oldest
    /// matching in-flight message.
    fn dispatch_frame(&self, frame: DeviceReport) {
        if frame.kind() == ReportKind::ControllerInterrupt {
            let value = ((frame.addr() as i32) << 16) | (frame.payload::<u16>() as i32);
            self.registry.allocate_interrupt(frame);
            self.events.trigger(MessageEvent::InterruptReceived, value);
            return;
        }

        let context = frame.report().context;
        match self.registry.match_response(frame.kind(), context) {
            Some(msg) => {
                let rx_crc = frame.rx_crc();
                let device_error = frame.general_error() || frame.tx_crc();
                let handle = msg.handle() as i32;
                let status = if rx_crc {
                    MessageStatus::CrcError
                } else {
                    MessageStatus::Complete
                };
                msg.complete_with(frame, status);
                if rx_crc {
                    self.events.trigger(MessageEvent::ResponseErrorCrc, handle);
                } else if device_error {
                    self.events.trigger(MessageEvent::ResponseErrorValid, handle);
                } else {
                    self.events.trigger(MessageEvent::ResponseReceived, handle);
                }
            }
            None => {
                warn!(
                    "response frame (kind {:?}, ctx {}) matched no outstanding message",
                    frame.kind(),
                    context
                );
                self.events
                    .trigger(MessageEvent::ResponseErrorInvalid, NULL_MESSAGE as i32);
            }
        }
    }

    /// Expires unanswered messages and frees aged terminal ones. Run by the
    /// parser thread between frames.
    fn collect_garbage(&self) {
        let timeouts = self.timeouts();
        for handle in self.registry.expire_unanswered(timeouts.rx) {
            self.events
                .trigger(MessageEvent::ResponseTimedOut, handle as i32);
        }
        self.registry.collect_aged(timeouts.auto_free);
    }
}

/// The per-connection engine. Cheap to clone handles of; one instance per
/// adapter.
pub struct Engine {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(timeouts: Timeouts) -> Engine {
        Engine {
            shared: Arc::new(Shared {
                open: AtomicBool::new(false),
                link: Mutex::new(None),
                tx_queue: Mutex::new(VecDeque::new()),
                tx_cond: Condvar::new(),
                rx_queue: Mutex::new(VecDeque::new()),
                rx_cond: Condvar::new(),
                registry: MessageRegistry::new(),
                events: EventBus::new(),
                timeouts: Mutex::new(timeouts),
                transfer: Mutex::new(None),
                transfer_cond: Condvar::new(),
                transfer_status: AtomicU8::new(FastTransferStatus::Idle as u8),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    pub fn events(&self) -> &EventBus<MessageEvent> {
        &self.shared.events
    }

    pub fn set_timeouts(&self, timeouts: Timeouts) {
        *self.shared.timeouts.lock().unwrap() = timeouts;
    }

    pub fn timeouts(&self) -> Timeouts {
        self.shared.timeouts()
    }

    pub fn transfer_status(&self) -> FastTransferStatus {
        match self.shared.transfer_status.load(Ordering::SeqCst) {
            1 => FastTransferStatus::Downloading,
            2 => FastTransferStatus::Uploading,
            _ => FastTransferStatus::Idle,
        }
    }

    /// Binds the engine to an open link and starts the worker threads.
    pub fn start(&self, link: Arc<dyn Link>) {
        if self.shared.is_open() {
            return;
        }

        self.shared.registry.clear();
        self.shared.tx_queue.lock().unwrap().clear();
        self.shared.rx_queue.lock().unwrap().clear();
        *self.shared.link.lock().unwrap() = Some(link.clone());
        self.shared.open.store(true, Ordering::SeqCst);

        let mut threads = self.threads.lock().unwrap();
        threads.push(spawn_named("ims-sender", {
            let shared = self.shared.clone();
            let link = link.clone();
            move || sender_task(shared, link)
        }));
        threads.push(spawn_named("ims-receiver", {
            let shared = self.shared.clone();
            let link = link.clone();
            move || receiver_task(shared, link)
        }));
        threads.push(spawn_named("ims-parser", {
            let shared = self.shared.clone();
            move || parser_task(shared)
        }));
        threads.push(spawn_named("ims-bulk", {
            let shared = self.shared.clone();
            let link = link.clone();
            move || bulk_task(shared, link)
        }));
        if link.has_interrupt_channel() {
            threads.push(spawn_named("ims-interrupt", {
                let shared = self.shared.clone();
                let link = link.clone();
                move || interrupt_task(shared, link)
            }));
        }
    }

    /// Graceful disconnect. Safe to call repeatedly; only the first call
    /// does any work.
    pub fn shutdown(&self) {
        if !self.shared.is_open() {
            return;
        }

        info!("disconnecting: disabling interrupts");
        self.send_msg(Report::host_with(Action::CtrlrIntrEn, Dir::Write, 0, 0u32));

        debug!("disconnecting: waiting for the send queue to drain");
        while self.shared.is_open() && !self.shared.tx_queue.lock().unwrap().is_empty() {
            self.shared.tx_cond.notify_all();
            thread::sleep(DRAIN_POLL);
        }

        debug!("disconnecting: waiting for in-flight messages to complete");
        loop {
            let mut waiting = false;
            self.shared.registry.for_each(|msg| {
                if msg.status().awaiting_response() {
                    waiting = true;
                }
            });
            if !waiting || !self.shared.is_open() {
                break;
            }
            thread::sleep(DRAIN_POLL);
        }

        debug!("disconnecting: stopping threads");
        self.shared.open.store(false, Ordering::SeqCst);
        self.shared.tx_cond.notify_all();
        self.shared.rx_cond.notify_all();
        self.shared.transfer_cond.notify_all();

        for handle in self.threads.lock().unwrap().drain(..) {
            if handle.join().is_err() {
                warn!("engine worker thread panicked during shutdown");
            }
        }

        if let Some(link) = self.shared.link.lock().unwrap().take() {
            link.close();
        }
        info!("disconnected");
    }

    /// Queues a report for transmission. Returns [`NULL_MESSAGE`] when the
    /// engine is closed.
    pub fn send_msg(&self, report: Report) -> MessageHandle {
        match self.enqueue(report) {
            Some(msg) => msg.handle(),
            None => NULL_MESSAGE,
        }
    }

    /// Queues a report and blocks until the response is terminal or the
    /// receive timeout elapses. The returned report's `done()` predicate is
    /// false when no response arrived in time.
    pub fn send_msg_blocking(&self, report: Report) -> DeviceReport {
        match self.enqueue(report) {
            Some(msg) => msg.wait_blocking(self.shared.timeouts().rx),
            None => DeviceReport::new(),
        }
    }

    fn enqueue(&self, report: Report) -> Option<Arc<Message>> {
        if !self.shared.is_open() {
            return None;
        }
        let msg = self.shared.registry.allocate(&report);
        self.shared.tx_queue.lock().unwrap().push_back(msg.clone());
        self.shared.tx_cond.notify_one();
        Some(msg)
    }

    pub fn status(&self, handle: MessageHandle) -> Option<MessageStatus> {
        self.shared.registry.find(handle).map(|m| m.status())
    }

    pub fn response(&self, handle: MessageHandle) -> Option<DeviceReport> {
        self.shared.registry.find(handle).map(|m| m.response())
    }

    /// Blocks on an already queued handle until terminal or the receive
    /// timeout elapses.
    pub fn wait_blocking(&self, handle: MessageHandle) -> DeviceReport {
        match self.shared.registry.find(handle) {
            Some(msg) => msg.wait_blocking(self.shared.timeouts().rx),
            None => DeviceReport::new(),
        }
    }

    pub fn for_each_message<F: FnMut(&Arc<Message>)>(&self, f: F) {
        self.shared.registry.for_each(f);
    }

    /// Publishes a bulk write of `buffer` to device memory. Returns false
    /// when a transfer is already active or the engine is closed.
    pub fn memory_download(
        &self,
        buffer: Arc<Mutex<Vec<u8>>>,
        start_addr: u32,
        index: i32,
        uuid: [u8; 16],
    ) -> bool {
        let size = buffer.lock().unwrap().len();
        debug!(
            "memory download: addr {start_addr:#x} index {index} size {size}"
        );
        self.publish_transfer(
            BulkTransfer {
                direction: TransferDirection::Download,
                start_addr,
                index,
                uuid,
                buffer,
            },
            FastTransferStatus::Downloading,
        )
    }

    /// Publishes a bulk read of device memory into `buffer`.
    pub fn memory_upload(
        &self,
        buffer: Arc<Mutex<Vec<u8>>>,
        start_addr: u32,
        len: usize,
        index: i32,
        uuid: [u8; 16],
    ) -> bool {
        debug!("memory upload: addr {start_addr:#x} index {index} size {len}");
        self.publish_transfer(
            BulkTransfer {
                direction: TransferDirection::Upload,
                start_addr,
                index,
                uuid,
                buffer,
            },
            FastTransferStatus::Uploading,
        )
    }

    fn publish_transfer(&self, transfer: BulkTransfer, status: FastTransferStatus) -> bool {
        if !self.shared.is_open() {
            return false;
        }
        let idle = FastTransferStatus::Idle as u8;
        if self
            .shared
            .transfer_status
            .compare_exchange(idle, status as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            error!("memory transfer requested while one is already active");
            self.shared
                .events
                .trigger(MessageEvent::MemoryTransferNotIdle, -1);
            return false;
        }
        *self.shared.transfer.lock().unwrap() = Some(transfer);
        self.shared.transfer_cond.notify_one();
        true
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_named<F>(name: &str, f: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("failed to spawn engine thread")
}

/// Sole transport writer. Serialises outbound frames and stamps each
/// message with its send time and outcome.
fn sender_task(shared: Arc<Shared>, link: Arc<dyn Link>) {
    loop {
        let msg = {
            let mut queue = shared.tx_queue.lock().unwrap();
            loop {
                if !shared.is_open() {
                    return;
                }
                if let Some(msg) = queue.pop_front() {
                    break msg;
                }
                let (guard, _) = shared.tx_cond.wait_timeout(queue, TX_TICK).unwrap();
                queue = guard;
            }
        };

        msg.set_status(MessageStatus::Unsent);
        let timeout = shared.timeouts().send;
        match link.send(msg.stream(), timeout) {
            SendOutcome::Sent => msg.set_status(MessageStatus::Sent),
            SendOutcome::TimedOut => {
                msg.set_status(MessageStatus::TimeoutOnSend);
                shared
                    .events
                    .trigger(MessageEvent::TimedOutOnSend, msg.handle() as i32);
            }
            SendOutcome::Error => {
                msg.set_status(MessageStatus::SendError);
                shared
                    .events
                    .trigger(MessageEvent::SendError, msg.handle() as i32);
            }
        }
        msg.mark_send_time();
    }
}

/// Drains ready transport bytes into the receive queue. Fatal receive
/// errors are logged once per error-identity transition so a dead link does
/// not flood the log, and the loop keeps running so a later reconnect stays
/// observable.
fn receiver_task(shared: Arc<Shared>, link: Arc<dyn Link>) {
    let mut buf = [0u8; 1024];
    let mut last_error: Option<std::io::ErrorKind> = None;

    while shared.is_open() {
        match link.recv(&mut buf) {
            Ok(0) => {
                if last_error != Some(std::io::ErrorKind::UnexpectedEof) {
                    error!("receive error: connection closed by device");
                    last_error = Some(std::io::ErrorKind::UnexpectedEof);
                }
                thread::sleep(RX_TICK);
            }
            Ok(n) => {
                {
                    let mut queue = shared.rx_queue.lock().unwrap();
                    queue.extend(&buf[..n]);
                }
                shared.rx_cond.notify_one();
                last_error = None;
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                if last_error != Some(e.kind()) {
                    error!("receive error: {e}");
                    last_error = Some(e.kind());
                }
                thread::sleep(RX_TICK);
            }
        }
    }
}

/// Sole reader of the receive queue. Feeds the frame parser one byte at a
/// time and dispatches every terminal frame, then applies message garbage
/// collection between frames.
fn parser_task(shared: Arc<Shared>) {
    let mut frame = DeviceReport::new();

    loop {
        let bytes: Vec<u8> = {
            let mut queue = shared.rx_queue.lock().unwrap();
            if queue.is_empty() {
                let (guard, _) = shared.rx_cond.wait_timeout(queue, RX_TICK).unwrap();
                queue = guard;
            }
            queue.drain(..).collect()
        };
        if !shared.is_open() {
            return;
        }

        for byte in bytes {
            frame.parse(byte);
            if frame.unexpected_char() {
                trace!("discarding unexpected byte {byte:#04x} in receive stream");
                continue;
            }
            if frame.done() {
                let complete = std::mem::take(&mut frame);
                shared.dispatch_frame(complete);
            }
        }

        shared.collect_garbage();
    }
}

/// Serves bulk transfers over the link's auxiliary file channel. One
/// transfer at a time; the channel is opened per transfer.
fn bulk_task(shared: Arc<Shared>, link: Arc<dyn Link>) {
    loop {
        let job = {
            let mut slot = shared.transfer.lock().unwrap();
            loop {
                if !shared.is_open() {
                    return;
                }
                if let Some(job) = slot.take() {
                    break job;
                }
                let (guard, _) = shared.transfer_cond.wait_timeout(slot, TX_TICK).unwrap();
                slot = guard;
            }
        };

        let name = uuid_to_str(&job.uuid);
        let outcome = match link.bulk() {
            None => {
                error!("transport has no bulk channel");
                shared.events.trigger(MessageEvent::DeviceNotAvailable, -1);
                None
            }
            Some(channel) => match job.direction {
                TransferDirection::Download => {
                    trace!("starting bulk download of \"{name}\"");
                    let data = {
                        let mut buffer = job.buffer.lock().unwrap();
                        // the device side expects whole blocks
                        let padded = buffer.len().div_ceil(TRANSFER_GRANULARITY)
                            * TRANSFER_GRANULARITY;
                        buffer.resize(padded, 0);
                        buffer.clone()
                    };
                    Some(channel.put(&name, &data))
                }
                TransferDirection::Upload => {
                    trace!("starting bulk upload of \"{name}\"");
                    let mut incoming = Vec::new();
                    let result = channel.get(&name, &mut incoming);
                    if result.is_ok() {
                        *job.buffer.lock().unwrap() = incoming;
                    }
                    Some(result)
                }
            },
        };

        shared
            .transfer_status
            .store(FastTransferStatus::Idle as u8, Ordering::SeqCst);

        match outcome {
            Some(Ok(bytes)) => {
                shared
                    .events
                    .trigger(MessageEvent::MemoryTransferComplete, bytes as i32);
            }
            Some(Err(e)) => {
                error!("bulk transfer failed: {e}");
                shared.events.trigger(MessageEvent::MemoryTransferError, -1);
            }
            None => {
                shared.events.trigger(MessageEvent::MemoryTransferError, -1);
            }
        }
    }
}

/// Reads the dedicated interrupt connection, parsing frames through the
/// same dispatch path as the main parser.
fn interrupt_task(shared: Arc<Shared>, link: Arc<dyn Link>) {
    let mut frame = DeviceReport::new();
    let mut buf = [0u8; 64];
    let mut last_error: Option<std::io::ErrorKind> = None;

    while shared.is_open() {
        match link.recv_interrupt(&mut buf) {
            Ok(0) => {
                if last_error != Some(std::io::ErrorKind::UnexpectedEof) {
                    error!("interrupt receive error: connection closed");
                    last_error = Some(std::io::ErrorKind::UnexpectedEof);
                }
                thread::sleep(RX_TICK);
            }
            Ok(n) => {
                for &byte in &buf[..n] {
                    frame.parse(byte);
                    if frame.unexpected_char() {
                        continue;
                    }
                    if frame.done() {
                        let complete = std::mem::take(&mut frame);
                        shared.dispatch_frame(complete);
                    }
                }
                last_error = None;
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                if last_error != Some(e.kind()) {
                    error!("interrupt receive error: {e}");
                    last_error = Some(e.kind());
                }
                thread::sleep(RX_TICK);
            }
        }
    }
}
