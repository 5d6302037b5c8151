/*!
# Ethernet Transport Module

Adapter for devices reachable over TCP/UDP Ethernet.

Discovery broadcasts an ASCII probe datagram on every UP, non-loopback,
broadcast-capable IPv4 interface and collects the newline-terminated
replies. The message channel is a TCP stream to the device's report port
with Nagle disabled; the device dials back a second TCP connection carrying
asynchronous interrupt reports. Older firmware never dials back, so a
missing interrupt connection is reported as a warning and the connection
proceeds without interrupts.

Bulk image and sequence payloads travel over TFTP to the device's standard
file port (see [`super::tftp`]).
*/

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use getifaddrs::InterfaceFlags;
use log::{error, info, warn};

use crate::engine::Engine;
use crate::system::System;
use crate::transport::tftp::{TftpClient, TFTP_DEFAULT_PORT};
use crate::transport::{BulkChannel, ConnectionManager, Link, SelfRef, SendOutcome, Timeouts};

/// Port the discovery probe is broadcast to.
pub const ANNOUNCE_DEST_PORT: u16 = 28242;
/// Source port the probe is sent from and replies arrive at.
pub const ANNOUNCE_SRC_PORT: u16 = 28243;
/// TCP port carrying the framed report channel.
pub const IMSMSG_PORT: u16 = 28244;
/// TCP port the device dials back to with interrupt reports.
pub const IMSINTR_PORT: u16 = 28245;

const DISCOVERY_PROBE: &[u8] = b"Discovery: Who is out there?\n";

// Max size of a UDP discovery reply.
const MTU_SIZE: usize = 1560;

// Window allowed for the TCP connect and for the device's interrupt
// dial-back.
const CONNECT_WINDOW: Duration = Duration::from_secs(4);
const ACCEPT_POLL: Duration = Duration::from_millis(25);
const STREAM_READ_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
struct InterfaceConnectionDetail {
    serial: String,
    mac: [u8; 6],
    remote_ip: Ipv4Addr,
    host_ip: Ipv4Addr,
}

fn parse_announce(reply: &str, from: Ipv4Addr) -> Option<InterfaceConnectionDetail> {
    let mut serial = String::new();
    let mut mac = [0u8; 6];
    let mut host_ip = Ipv4Addr::UNSPECIFIED;

    for line in reply.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(v) = line.strip_prefix("SNO: ") {
            serial = v.to_string();
        } else if let Some(v) = line.strip_prefix("MAC: ") {
            for (i, part) in v.split(':').take(6).enumerate() {
                mac[i] = u8::from_str_radix(part.trim(), 16).unwrap_or(0);
            }
        } else if let Some(v) = line.strip_prefix("ReqIP: ") {
            host_ip = v.parse().unwrap_or(Ipv4Addr::UNSPECIFIED);
        }
    }

    if serial.is_empty() {
        return None;
    }
    Some(InterfaceConnectionDetail {
        serial,
        mac,
        remote_ip: from,
        host_ip,
    })
}

fn broadcast_address(addr: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) | !u32::from(netmask))
}

#[derive(Default)]
struct EnetState {
    details: Vec<InterfaceConnectionDetail>,
    conn_string: String,
}

/// Connection manager for Ethernet-attached devices.
pub struct EnetManager {
    engine: Engine,
    state: Mutex<EnetState>,
    self_ref: SelfRef<EnetManager>,
}

impl EnetManager {
    pub fn create() -> Arc<EnetManager> {
        let mgr = Arc::new(EnetManager {
            engine: Engine::new(Timeouts {
                send: Duration::from_millis(500),
                rx: Duration::from_secs(10),
                auto_free: Duration::from_secs(30),
                discover: Duration::from_millis(1000),
            }),
            state: Mutex::new(EnetState::default()),
            self_ref: SelfRef::new(),
        });
        mgr.self_ref.set(&mgr);
        mgr
    }

    /// Broadcasts the discovery probe and refreshes the reply table.
    fn list_connected_devices(&self, port_mask: &[String]) {
        let discovery_timeout = self.engine.timeouts().discover;
        let interfaces = match getifaddrs::getifaddrs() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                error!("announce: unable to enumerate interfaces: {e}");
                return;
            }
        };

        let mut details = Vec::new();
        for iface in interfaces {
            let IpAddr::V4(addr) = iface.address else {
                continue;
            };
            if !port_mask.is_empty() && !port_mask.iter().any(|m| m == &addr.to_string()) {
                continue;
            }
            if !iface.flags.contains(InterfaceFlags::UP)
                || iface.flags.contains(InterfaceFlags::LOOPBACK)
                || !iface.flags.contains(InterfaceFlags::BROADCAST)
            {
                continue;
            }
            let Some(IpAddr::V4(netmask)) = iface.netmask else {
                continue;
            };

            let socket = match UdpSocket::bind((addr, ANNOUNCE_SRC_PORT)) {
                Ok(socket) => socket,
                Err(_) => continue,
            };
            if socket.set_broadcast(true).is_err() || socket.set_nonblocking(true).is_err() {
                error!("announce: socket configuration failed on {addr}");
                continue;
            }

            let destination = broadcast_address(addr, netmask);
            info!("sending discovery packet: {destination} port {ANNOUNCE_DEST_PORT}");
            if let Err(e) = socket.send_to(DISCOVERY_PROBE, (destination, ANNOUNCE_DEST_PORT)) {
                error!("announce: send failed on {addr}: {e}");
                continue;
            }

            // let replies arrive, then drain whatever is queued
            thread::sleep(discovery_timeout);
            let mut buf = [0u8; MTU_SIZE];
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((n, from)) => {
                        let IpAddr::V4(from_ip) = from.ip() else {
                            continue;
                        };
                        let reply = String::from_utf8_lossy(&buf[..n]);
                        if let Some(detail) = parse_announce(&reply, from_ip) {
                            let mac = detail.mac;
                            info!(
                                "response received from {} at {} \
                                 (mac {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}, requested by {})",
                                detail.serial,
                                detail.remote_ip,
                                mac[0],
                                mac[1],
                                mac[2],
                                mac[3],
                                mac[4],
                                mac[5],
                                detail.host_ip
                            );
                            details.push(detail);
                        }
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        break;
                    }
                    Err(e) => {
                        error!("announce: recvfrom error: {e}");
                        break;
                    }
                }
            }
        }

        if details.is_empty() {
            info!("announce: no valid responses received");
        }
        self.state.lock().unwrap().details = details;
    }
}

impl ConnectionManager for EnetManager {
    fn ident(&self) -> &'static str {
        "CM_ETH"
    }

    fn discover(&self, port_mask: &[String]) -> Vec<Arc<System>> {
        self.list_connected_devices(port_mask);
        let details = self.state.lock().unwrap().details.clone();
        let Some(this) = self.self_ref.get() else {
            return Vec::new();
        };

        let mut systems: Vec<Arc<System>> = Vec::new();
        for detail in details {
            self.connect(&detail.serial);
            if self.open() {
                let mut port = format!("{}:{}", detail.serial, detail.remote_ip);
                let duplicates = systems
                    .iter()
                    .filter(|s| s.conn_port().starts_with(port.as_str()))
                    .count();
                if duplicates > 0 {
                    port = format!("{port}-{duplicates}");
                }
                let system = System::create(this.clone() as Arc<dyn ConnectionManager>, port);
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

        // a scan may not have run yet in this process
        if self.state.lock().unwrap().details.is_empty() {
            self.list_connected_devices(&[]);
        }

        // accept a port string (serial:ipaddr) as well as a bare serial
        let serial = id.split(':').next().unwrap_or(id);
        let Some(detail) = self
            .state
            .lock()
            .unwrap()
            .details
            .iter()
            .find(|d| d.serial == serial)
            .cloned()
        else {
            error!("client: no discovered device matches \"{serial}\"");
            return;
        };

        let server = SocketAddr::new(IpAddr::V4(detail.remote_ip), IMSMSG_PORT);
        let msg_sock = match TcpStream::connect_timeout(&server, CONNECT_WINDOW) {
            Ok(stream) => stream,
            Err(e) => {
                error!("client: connect() failed: {e}");
                return;
            }
        };
        if msg_sock.set_nodelay(true).is_err()
            || msg_sock
                .set_read_timeout(Some(STREAM_READ_TIMEOUT))
                .is_err()
        {
            error!("client: stream configuration failed");
            return;
        }

        // The device dials back with its interrupt connection. Not all
        // firmware versions do, so a timeout here only costs interrupts.
        let intr_sock = accept_interrupt_connection();

        let link = EnetLink {
            msg: msg_sock,
            intr: intr_sock,
            server_ip: IpAddr::V4(detail.remote_ip),
        };
        self.engine.start(Arc::new(link));
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
}

fn accept_interrupt_connection() -> Option<TcpStream> {
    let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, IMSINTR_PORT)) {
        Ok(listener) => listener,
        Err(e) => {
            warn!("client: interrupt socket failed to bind: {e}. Continuing without interrupts");
            return None;
        }
    };
    if listener.set_nonblocking(true).is_err() {
        return None;
    }

    let deadline = Instant::now() + CONNECT_WINDOW;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err()
                    || stream.set_read_timeout(Some(STREAM_READ_TIMEOUT)).is_err()
                {
                    warn!("client: interrupt stream configuration failed");
                    return None;
                }
                return Some(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    warn!("client: accept() timed out. Continuing without interrupts");
                    return None;
                }
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!("client: accept() failed: {e}. Continuing without interrupts");
                return None;
            }
        }
    }
}

/// Open Ethernet byte channels for one device.
pub struct EnetLink {
    msg: TcpStream,
    intr: Option<TcpStream>,
    server_ip: IpAddr,
}

impl Link for EnetLink {
    fn send(&self, buf: &[u8], timeout: Duration) -> SendOutcome {
        if self.msg.set_write_timeout(Some(timeout)).is_err() {
            return SendOutcome::Error;
        }
        let deadline = Instant::now() + timeout;
        let mut stream = &self.msg;
        let mut written = 0;
        while written < buf.len() {
            match stream.write(&buf[written..]) {
                Ok(0) => return SendOutcome::Error,
                Ok(n) => written += n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if Instant::now() >= deadline {
                        return SendOutcome::TimedOut;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("send error: {e}");
                    return SendOutcome::Error;
                }
            }
        }
        SendOutcome::Sent
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        (&self.msg).read(buf)
    }

    fn has_interrupt_channel(&self) -> bool {
        self.intr.is_some()
    }

    fn recv_interrupt(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &self.intr {
            Some(stream) => (&*stream).read(buf),
            None => Err(std::io::Error::from(std::io::ErrorKind::Unsupported)),
        }
    }

    fn bulk(&self) -> Option<&dyn BulkChannel> {
        Some(self)
    }

    fn close(&self) {
        let _ = self.msg.shutdown(std::net::Shutdown::Both);
        if let Some(stream) = &self.intr {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl BulkChannel for EnetLink {
    fn put(&self, name: &str, data: &[u8]) -> std::io::Result<usize> {
        let mut client = TftpClient::new(self.server_ip, TFTP_DEFAULT_PORT)?;
        client.send_file(name, data)
    }

    fn get(&self, name: &str, out: &mut Vec<u8>) -> std::io::Result<usize> {
        let mut client = TftpClient::new(self.server_ip, TFTP_DEFAULT_PORT)?;
        client.get_file(name, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_reply_parses() {
        let reply = "SNO: iMS4-0042\r\nMAC: 00:0a:35:01:02:03\r\nReqIP: 192.168.1.20\r\n";
        let detail = parse_announce(reply, Ipv4Addr::new(192, 168, 1, 77)).unwrap();
        assert_eq!(detail.serial, "iMS4-0042");
        assert_eq!(detail.mac, [0x00, 0x0a, 0x35, 0x01, 0x02, 0x03]);
        assert_eq!(detail.remote_ip, Ipv4Addr::new(192, 168, 1, 77));
        assert_eq!(detail.host_ip, Ipv4Addr::new(192, 168, 1, 20));
    }

    #[test]
    fn announce_reply_without_serial_is_rejected() {
        assert!(parse_announce("MAC: 00:00:00:00:00:00\n", Ipv4Addr::LOCALHOST).is_none());
    }

    #[test]
    fn broadcast_address_from_netmask() {
        assert_eq!(
            broadcast_address(
                Ipv4Addr::new(192, 168, 1, 77),
                Ipv4Addr::new(255, 255, 255, 0)
            ),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            broadcast_address(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(255, 0, 0, 0)),
            Ipv4Addr::new(10, 255, 255, 255)
        );
    }

    #[test]
    fn discovery_with_unmatched_mask_returns_empty() {
        // the mask excludes every local interface, so no probe is sent and
        // discovery completes empty without error
        let mgr = EnetManager::create();
        let systems = mgr.discover(&["203.0.113.199".to_string()]);
        assert!(systems.is_empty());
    }
}
