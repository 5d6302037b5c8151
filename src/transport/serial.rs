/*!
# Serial Transport Module

Adapter for devices attached through a USB serial bridge.

Discovery enumerates the host's serial ports and keeps those whose USB
serial number carries one of the recognised instrument prefixes. The wire
is a plain byte pipe with no side channels: interrupts are unavailable on
this transport and bulk transfers are refused, so payload downloads fall
back to streaming over the report channel.

A send that cannot complete inside the send timeout pads the frame to the
maximum report size with zero bytes so the device's framer resynchronises
on the next report.
*/

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use serialport::{SerialPort, SerialPortType};

use crate::engine::Engine;
use crate::report::FRAME_MAX_LENGTH;
use crate::system::System;
use crate::transport::{ConnectionManager, Link, SelfRef, SendOutcome, Timeouts};

/// Only devices whose USB serial number begins with one of these prefixes
/// are treated as instruments.
const SERIAL_NUMBER_PREFIXES: [&str; 3] = ["iMS", "iDDS", "iCSA"];

const BAUD_RATE: u32 = 115_200;
const READ_TIMEOUT: Duration = Duration::from_millis(250);

// Reads are bounded by the bridge's on-chip buffer.
pub(crate) const CHIP_BUFFER_SIZE: usize = 4096;

#[derive(Default)]
struct SerialState {
    /// serial number -> port name, rebuilt on every enumeration
    ports: Vec<(String, String)>,
    conn_string: String,
}

/// Connection manager for USB serial attached devices.
pub struct SerialManager {
    engine: Engine,
    state: Mutex<SerialState>,
    self_ref: SelfRef<SerialManager>,
}

impl SerialManager {
    pub fn create() -> Arc<SerialManager> {
        let mgr = Arc::new(SerialManager {
            engine: Engine::new(Timeouts {
                send: Duration::from_millis(100),
                rx: Duration::from_millis(500),
                auto_free: Duration::from_secs(10),
                discover: Duration::from_millis(2500),
            }),
            state: Mutex::new(SerialState::default()),
            self_ref: SelfRef::new(),
        });
        mgr.self_ref.set(&mgr);
        mgr
    }

    fn enumerate(&self, port_mask: &[String]) -> Vec<(String, String)> {
        let available = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                error!("serial enumeration failed: {e}");
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        for port in available {
            let SerialPortType::UsbPort(usb) = &port.port_type else {
                continue;
            };
            let Some(serial) = usb.serial_number.as_deref() else {
                continue;
            };
            if !SERIAL_NUMBER_PREFIXES
                .iter()
                .any(|prefix| serial.starts_with(prefix))
            {
                continue;
            }
            if !port_mask.is_empty() && !port_mask.iter().any(|m| m.as_str() == serial) {
                continue;
            }
            found.push((serial.to_string(), port.port_name.clone()));
        }
        self.state.lock().unwrap().ports = found.clone();
        found
    }
}

impl ConnectionManager for SerialManager {
    fn ident(&self) -> &'static str {
        "CM_USBLITE"
    }

    fn discover(&self, port_mask: &[String]) -> Vec<Arc<System>> {
        let found = self.enumerate(port_mask);
        let Some(this) = self.self_ref.get() else {
            return Vec::new();
        };

        let mut systems = Vec::new();
        for (serial, _) in found {
            self.connect(&serial);
            if self.open() {
                let system =
                    System::create(this.clone() as Arc<dyn ConnectionManager>, serial.clone());
                if system.initialise() {
                    systems.push(system);
                }
            }
            self.disconnect();
        }
        systems
    }

    fn connect(&self, id: &str) {
        if self.engine.is_open() {
            return;
        }

        if self.state.lock().unwrap().ports.is_empty() {
            self.enumerate(&[]);
        }
        let Some(port_name) = self
            .state
            .lock()
            .unwrap()
            .ports
            .iter()
            .find(|(serial, _)| serial.as_str() == id)
            .map(|(_, name)| name.clone())
        else {
            error!("no serial device matches \"{id}\"");
            return;
        };

        let port = match serialport::new(&port_name, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()
        {
            Ok(port) => port,
            Err(e) => {
                error!("failed to open {port_name}: {e}");
                return;
            }
        };
        let writer = match port.try_clone() {
            Ok(writer) => writer,
            Err(e) => {
                error!("failed to clone {port_name}: {e}");
                return;
            }
        };

        self.engine.start(Arc::new(SerialLink {
            reader: Mutex::new(port),
            writer: Mutex::new(writer),
        }));
        self.state.lock().unwrap().conn_string = id.to_string();
        info!("iMS system {id} connected");
    }

    fn disconnect(&self) {
        if self.engine.is_open() {
            let conn = self.state.lock().unwrap().conn_string.clone();
            info!("disconnecting from iMS system {conn}");
        }
        self.engine.shutdown();
    }

    fn open(&self) -> bool {
        self.engine.is_open()
    }

    fn engine(&self) -> &Engine {
        &self.engine
    }

    // No auxiliary channel on this transport; large payloads stream over
    // the report channel instead.
    fn memory_download(
        &self,
        _buffer: Arc<Mutex<Vec<u8>>>,
        _start_addr: u32,
        _index: i32,
        _uuid: [u8; 16],
    ) -> bool {
        false
    }

    fn memory_upload(
        &self,
        _buffer: Arc<Mutex<Vec<u8>>>,
        _start_addr: u32,
        _len: usize,
        _index: i32,
        _uuid: [u8; 16],
    ) -> bool {
        false
    }
}

/// Open serial port pair, one cloned handle per direction.
pub struct SerialLink {
    reader: Mutex<Box<dyn SerialPort>>,
    writer: Mutex<Box<dyn SerialPort>>,
}

impl SerialLink {
    /// Pushes zero bytes until a whole frame's worth has been written, so
    /// the device's framer falls back into sync after a truncated send.
    fn flush_frame_padding(port: &mut Box<dyn SerialPort>) {
        let pad = [0u8; FRAME_MAX_LENGTH];
        let mut remaining = FRAME_MAX_LENGTH;
        while remaining > 0 {
            match port.write(&pad[..remaining]) {
                Ok(0) => break,
                Ok(n) => remaining -= n,
                Err(_) => break,
            }
        }
    }
}

impl Link for SerialLink {
    fn send(&self, buf: &[u8], timeout: Duration) -> SendOutcome {
        let mut port = self.writer.lock().unwrap();
        let deadline = Instant::now() + timeout;
        let mut written = 0;

        while written < buf.len() {
            if Instant::now() >= deadline {
                warn!("send timed out, padding frame to resynchronise");
                Self::flush_frame_padding(&mut port);
                return SendOutcome::TimedOut;
            }
            match port.write(&buf[written..]) {
                Ok(n) => written += n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("serial write failed: {e}");
                    return SendOutcome::Error;
                }
            }
        }
        SendOutcome::Sent
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut port = self.reader.lock().unwrap();
        let limit = buf.len().min(CHIP_BUFFER_SIZE);
        match port.read(&mut buf[..limit]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(std::io::Error::from(std::io::ErrorKind::WouldBlock))
            }
            Err(e) => Err(e),
        }
    }

    fn close(&self) {
        // dropping the handles closes the port; nothing to signal first
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_filter_matches_instrument_serials() {
        for serial in ["iMS4-1234", "iDDS-77", "iCSA-x"] {
            assert!(SERIAL_NUMBER_PREFIXES
                .iter()
                .any(|prefix| serial.starts_with(prefix)));
        }
        for serial in ["FTDI-1234", "ims4-lowercase", ""] {
            assert!(!SERIAL_NUMBER_PREFIXES
                .iter()
                .any(|prefix| serial.starts_with(prefix)));
        }
    }

    #[test]
    fn discovery_with_unmatched_mask_is_empty() {
        let mgr = SerialManager::create();
        let systems = mgr.discover(&["not-a-device".to_string()]);
        assert!(systems.is_empty());
    }
}
