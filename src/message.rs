//! In-flight message records and the per-connection registry.
//!
//! Every outbound report becomes a [`Message`] identified by an opaque
//! monotonic handle. The sentinel [`NULL_MESSAGE`] is returned when a
//! message cannot be allocated (engine closed) and is never a valid handle.
//! A message lives in exactly one place at a time: the outbound queue, the
//! in-flight list, or nowhere once freed. Terminal entries are garbage
//! collected by the parser task after the auto-free deadline.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::report::{codec, DeviceReport, Report, ReportKind};

/// Opaque identifier for one outstanding host report.
pub type MessageHandle = u32;

/// Sentinel handle returned when allocation fails. Never valid.
pub const NULL_MESSAGE: MessageHandle = 0;

/// Lifecycle states of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// Queued, not yet handed to the transport.
    Unsent,
    /// On the wire, awaiting a response.
    Sent,
    /// A matching response frame is partially received.
    RxPartial,
    /// Response received and framing verified.
    Complete,
    /// The transport reported a fatal error during send.
    SendError,
    /// Transmission did not finish within the send timeout.
    TimeoutOnSend,
    /// No response arrived within the receive timeout.
    TimeoutOnReceive,
    /// A matching response arrived but failed its CRC.
    CrcError,
    /// Synthetic record wrapping an asynchronous interrupt report.
    Interrupt,
}

impl MessageStatus {
    /// True once the message can make no further progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Complete
                | MessageStatus::SendError
                | MessageStatus::TimeoutOnSend
                | MessageStatus::TimeoutOnReceive
                | MessageStatus::CrcError
                | MessageStatus::Interrupt
        )
    }

    /// True while a response may still arrive.
    pub fn awaiting_response(self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::RxPartial)
    }
}

#[derive(Debug)]
struct MessageInner {
    status: MessageStatus,
    response: DeviceReport,
    sent_at: Option<Instant>,
    done_at: Option<Instant>,
}

/// One outbound report in flight, shared between the caller and the engine
/// tasks.
#[derive(Debug)]
pub struct Message {
    handle: MessageHandle,
    stream: Vec<u8>,
    expect_kind: ReportKind,
    context: u8,
    inner: Mutex<MessageInner>,
    cond: Condvar,
}

impl Message {
    pub(crate) fn new(handle: MessageHandle, report: &Report) -> Message {
        Message {
            handle,
            stream: codec::serialize(report),
            expect_kind: report.kind.response_kind(),
            context: report.context,
            inner: Mutex::new(MessageInner {
                status: MessageStatus::Unsent,
                response: DeviceReport::new(),
                sent_at: None,
                done_at: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Synthetic record for an interrupt frame produced by the device.
    pub(crate) fn interrupt(handle: MessageHandle, frame: DeviceReport) -> Message {
        Message {
            handle,
            stream: Vec::new(),
            expect_kind: ReportKind::Null,
            context: 0,
            inner: Mutex::new(MessageInner {
                status: MessageStatus::Interrupt,
                response: frame,
                sent_at: Some(Instant::now()),
                done_at: Some(Instant::now()),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn handle(&self) -> MessageHandle {
        self.handle
    }

    /// Serialised frame bytes handed to the transport.
    pub(crate) fn stream(&self) -> &[u8] {
        &self.stream
    }

    pub(crate) fn expect_kind(&self) -> ReportKind {
        self.expect_kind
    }

    pub(crate) fn context(&self) -> u8 {
        self.context
    }

    pub fn status(&self) -> MessageStatus {
        self.inner.lock().unwrap().status
    }

    pub fn response(&self) -> DeviceReport {
        self.inner.lock().unwrap().response.clone()
    }

    pub(crate) fn set_status(&self, status: MessageStatus) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = status;
        if status.is_terminal() {
            inner.done_at = Some(Instant::now());
        }
        drop(inner);
        self.cond.notify_all();
    }

    pub(crate) fn mark_send_time(&self) {
        self.inner.lock().unwrap().sent_at = Some(Instant::now());
    }

    pub(crate) fn sent_at(&self) -> Option<Instant> {
        self.inner.lock().unwrap().sent_at
    }

    pub(crate) fn done_at(&self) -> Option<Instant> {
        self.inner.lock().unwrap().done_at
    }

    /// Attaches the parsed response and moves to a terminal state.
    pub(crate) fn complete_with(&self, response: DeviceReport, status: MessageStatus) {
        let mut inner = self.inner.lock().unwrap();
        inner.response = response;
        inner.status = status;
        inner.done_at = Some(Instant::now());
        drop(inner);
        self.cond.notify_all();
    }

    /// Blocks until the message reaches a terminal status or `timeout`
    /// elapses, then returns whatever response has been recorded.
    pub fn wait_blocking(&self, timeout: Duration) -> DeviceReport {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while !inner.status.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
        inner.response.clone()
    }
}

/// Registry of live messages for one connection.
///
/// Handles are issued monotonically starting at 1. A message is registered
/// the moment it is allocated, so callers can observe a handle while it is
/// still waiting in the outbound queue, and stays registered until the
/// auto-free collector drops it after it went terminal.
pub struct MessageRegistry {
    next_handle: Mutex<MessageHandle>,
    live: Mutex<Vec<Arc<Message>>>,
}

impl MessageRegistry {
    pub fn new() -> MessageRegistry {
        MessageRegistry {
            next_handle: Mutex::new(1),
            live: Mutex::new(Vec::new()),
        }
    }

    fn next_handle(&self) -> MessageHandle {
        let mut next = self.next_handle.lock().unwrap();
        let handle = *next;
        *next = next.checked_add(1).unwrap_or(1);
        handle
    }

    /// Allocates and registers a fresh message for `report`.
    pub(crate) fn allocate(&self, report: &Report) -> Arc<Message> {
        let msg = Arc::new(Message::new(self.next_handle(), report));
        self.live.lock().unwrap().push(msg.clone());
        msg
    }

    /// Registers a synthetic record for an interrupt frame.
    pub(crate) fn allocate_interrupt(&self, frame: DeviceReport) -> Arc<Message> {
        let msg = Arc::new(Message::interrupt(self.next_handle(), frame));
        self.live.lock().unwrap().push(msg.clone());
        msg
    }

    pub fn find(&self, handle: MessageHandle) -> Option<Arc<Message>> {
        self.live
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.handle() == handle)
            .cloned()
    }

    pub fn for_each<F: FnMut(&Arc<Message>)>(&self, mut f: F) {
        for msg in self.live.lock().unwrap().iter() {
            f(msg);
        }
    }

    /// Oldest entry still awaiting a response with the given kind and
    /// context, in transport order.
    pub(crate) fn match_response(&self, kind: ReportKind, context: u8) -> Option<Arc<Message>> {
        self.live
            .lock()
            .unwrap()
            .iter()
            .find(|m| {
                m.status().awaiting_response() && m.expect_kind() == kind && m.context() == context
            })
            .cloned()
    }

    /// Drops terminal entries whose auto-free deadline has passed.
    pub(crate) fn collect_aged(&self, auto_free: Duration) {
        let now = Instant::now();
        self.live.lock().unwrap().retain(|m| {
            let status = m.status();
            if !status.is_terminal() {
                return true;
            }
            match m.done_at() {
                Some(done) => now.duration_since(done) < auto_free,
                None => true,
            }
        });
    }

    /// Ages `Sent` entries past the receive deadline into
    /// `TimeoutOnReceive`; returns the handles that expired.
    pub(crate) fn expire_unanswered(&self, rx_timeout: Duration) -> Vec<MessageHandle> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for msg in self.live.lock().unwrap().iter() {
            if !msg.status().awaiting_response() {
                continue;
            }
            if let Some(sent) = msg.sent_at() {
                if now.duration_since(sent) >= rx_timeout {
                    msg.set_status(MessageStatus::TimeoutOnReceive);
                    expired.push(msg.handle());
                }
            }
        }
        expired
    }

    pub(crate) fn clear(&self) {
        self.live.lock().unwrap().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        MessageRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{Action, Dir};

    fn read_reg() -> Report {
        Report::host(Action::SynthReg, Dir::Read, 0)
    }

    #[test]
    fn handles_are_monotonic_and_never_null() {
        let reg = MessageRegistry::new();
        let mut last = NULL_MESSAGE;
        for _ in 0..100 {
            let msg = reg.allocate(&read_reg());
            assert_ne!(msg.handle(), NULL_MESSAGE);
            assert!(msg.handle() > last);
            last = msg.handle();
        }
    }

    #[test]
    fn match_prefers_oldest_awaiting_entry() {
        let reg = MessageRegistry::new();
        let first = reg.allocate(&read_reg());
        let second = reg.allocate(&read_reg());
        first.set_status(MessageStatus::Sent);
        second.set_status(MessageStatus::Sent);

        let hit = reg.match_response(ReportKind::DeviceSynth, 0).unwrap();
        assert_eq!(hit.handle(), first.handle());

        first.set_status(MessageStatus::Complete);
        let hit = reg.match_response(ReportKind::DeviceSynth, 0).unwrap();
        assert_eq!(hit.handle(), second.handle());
    }

    #[test]
    fn aged_terminal_entries_are_collected() {
        let reg = MessageRegistry::new();
        let msg = reg.allocate(&read_reg());
        msg.set_status(MessageStatus::Complete);
        assert_eq!(reg.len(), 1);
        reg.collect_aged(Duration::from_secs(0));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn unanswered_messages_expire_once() {
        let reg = MessageRegistry::new();
        let msg = reg.allocate(&read_reg());
        msg.set_status(MessageStatus::Sent);
        msg.mark_send_time();

        let expired = reg.expire_unanswered(Duration::from_secs(0));
        assert_eq!(expired, vec![msg.handle()]);
        assert_eq!(msg.status(), MessageStatus::TimeoutOnReceive);
        // already terminal, not reported again
        assert!(reg.expire_unanswered(Duration::from_secs(0)).is_empty());
    }

    #[test]
    fn wait_blocking_returns_on_completion() {
        let reg = MessageRegistry::new();
        let msg = reg.allocate(&read_reg());
        let waiter = msg.clone();
        let t = std::thread::spawn(move || waiter.wait_blocking(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        msg.complete_with(DeviceReport::new(), MessageStatus::Complete);
        t.join().unwrap();
        assert!(msg.status().is_terminal());
    }
}
