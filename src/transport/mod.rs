/*!
# Transport Module

Pluggable per-transport adapters and the byte-level link contract the
connection engine drives.

Two layers:

- [`Link`] is the low-level byte transport an open connection engine reads
  and writes. Implementations exist for a TCP message stream
  ([`enet::EnetLink`]) and a USB serial port ([`serial::SerialLink`]).
- [`ConnectionManager`] is the adapter object registered with the
  connection list. It discovers devices, opens and closes them, and exposes
  the messaging and bulk-transfer primitives of its engine.
*/

pub mod enet;
pub mod serial;
pub mod tftp;

use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::engine::Engine;
use crate::event::{EventBus, MessageEvent, Subscription};
use crate::message::{MessageHandle, NULL_MESSAGE};
use crate::report::{DeviceReport, Report};
use crate::system::System;

/// Result of one attempt to transmit a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every byte was accepted by the transport.
    Sent,
    /// The overall send timeout expired before the frame completed.
    TimedOut,
    /// The transport failed in a way a retry will not fix.
    Error,
}

/// Byte transport bound to one open device.
///
/// The engine's sender task is the only caller of [`Link::send`]; the
/// receiver task is the only caller of [`Link::recv`]. `recv` should wait
/// internally for a bounded interval (at most a few hundred milliseconds)
/// and return `WouldBlock` when nothing arrived, so the receiver can observe
/// shutdown.
pub trait Link: Send + Sync {
    fn send(&self, buf: &[u8], timeout: Duration) -> SendOutcome;
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// True when the transport carries a dedicated interrupt side channel.
    fn has_interrupt_channel(&self) -> bool {
        false
    }

    /// Reads from the interrupt side channel, same contract as [`Link::recv`].
    fn recv_interrupt(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// The auxiliary bulk file channel, when the transport has one.
    fn bulk(&self) -> Option<&dyn BulkChannel> {
        None
    }

    /// Releases the underlying handles. Called once, after all engine tasks
    /// have stopped.
    fn close(&self);
}

/// Auxiliary bulk file channel keyed by the hex-encoded payload UUID.
pub trait BulkChannel: Send + Sync {
    fn put(&self, name: &str, data: &[u8]) -> io::Result<usize>;
    fn get(&self, name: &str, out: &mut Vec<u8>) -> io::Result<usize>;
}

/// Configurable engine timeouts, all in play per adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub send: Duration,
    pub rx: Duration,
    pub auto_free: Duration,
    pub discover: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            send: Duration::from_millis(500),
            rx: Duration::from_secs(10),
            auto_free: Duration::from_secs(30),
            discover: Duration::from_millis(2500),
        }
    }
}

/// Uniform adapter contract consumed by the connection list and the
/// download workers.
///
/// `discover` returns fully initialised [`System`] records; each record
/// keeps a shared handle to the adapter that found it so it can be reopened
/// later.
pub trait ConnectionManager: Send + Sync {
    /// Short adapter tag, also the settings-file module key.
    fn ident(&self) -> &'static str;

    /// Enumerates devices visible to this adapter. `port_mask` filters by
    /// adapter-specific address; empty means no filter.
    fn discover(&self, port_mask: &[String]) -> Vec<Arc<System>>;

    /// Opens the device identified by `id`. Idempotent while open.
    fn connect(&self, id: &str);

    /// Gracefully closes the connection. Idempotent.
    fn disconnect(&self);

    /// True while the device is open.
    fn open(&self) -> bool;

    /// The engine bound to this adapter's connection.
    fn engine(&self) -> &Engine;

    fn set_timeouts(&self, timeouts: Timeouts) {
        self.engine().set_timeouts(timeouts);
    }

    fn timeouts(&self) -> Timeouts {
        self.engine().timeouts()
    }

    /// Queues a report for transmission. Returns [`NULL_MESSAGE`] when the
    /// connection is closed.
    fn send_msg(&self, report: Report) -> MessageHandle {
        if !self.open() {
            return NULL_MESSAGE;
        }
        self.engine().send_msg(report)
    }

    /// Queues a report and blocks until its response is terminal or the
    /// receive timeout elapses.
    fn send_msg_blocking(&self, report: Report) -> DeviceReport {
        self.engine().send_msg_blocking(report)
    }

    /// Starts a bulk write of `buffer` to device memory. Completion or
    /// failure is reported through [`MessageEvent::MemoryTransferComplete`]
    /// and [`MessageEvent::MemoryTransferError`].
    fn memory_download(
        &self,
        buffer: Arc<Mutex<Vec<u8>>>,
        start_addr: u32,
        index: i32,
        uuid: [u8; 16],
    ) -> bool {
        self.engine()
            .memory_download(buffer, start_addr, index, uuid)
    }

    /// Starts a bulk read of device memory into `buffer`.
    fn memory_upload(
        &self,
        buffer: Arc<Mutex<Vec<u8>>>,
        start_addr: u32,
        len: usize,
        index: i32,
        uuid: [u8; 16],
    ) -> bool {
        self.engine()
            .memory_upload(buffer, start_addr, len, index, uuid)
    }

    fn events(&self) -> &EventBus<MessageEvent> {
        self.engine().events()
    }

    fn subscribe<F>(&self, kind: MessageEvent, handler: F) -> Subscription<MessageEvent>
    where
        F: Fn(i32) + Send + Sync + 'static,
        Self: Sized,
    {
        self.events().subscribe(kind, handler)
    }

    fn unsubscribe(&self, sub: &Subscription<MessageEvent>) {
        self.events().unsubscribe(sub);
    }
}

/// Holder for the adapter's own `Arc`, set right after construction so
/// discovery can hand shared adapter handles to the systems it builds.
pub(crate) struct SelfRef<T: ?Sized> {
    inner: Mutex<Weak<T>>,
}

impl<T> SelfRef<T> {
    pub(crate) fn new() -> SelfRef<T> {
        SelfRef {
            inner: Mutex::new(Weak::new()),
        }
    }
}

impl<T: ?Sized> SelfRef<T> {
    pub(crate) fn set(&self, strong: &Arc<T>) {
        *self.inner.lock().unwrap() = Arc::downgrade(strong);
    }

    pub(crate) fn get(&self) -> Option<Arc<T>> {
        self.inner.lock().unwrap().upgrade()
    }
}
