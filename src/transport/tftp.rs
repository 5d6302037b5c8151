//! Minimal TFTP client for the auxiliary bulk file channel.
//!
//! Standard TFTP over UDP port 69, octet mode, 512-byte data blocks, one
//! ACK per block, last short block terminates the transfer. The server's
//! transfer identifier (source port of its first reply) is adopted for the
//! rest of the session. The only retry in the protocol stack lives here:
//! on the first timeout the last ACK is re-sent once; a second timeout
//! aborts the transfer.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace, warn};

pub const TFTP_DEFAULT_PORT: u16 = 69;

const OPCODE_RRQ: u16 = 1;
const OPCODE_WRQ: u16 = 2;
const OPCODE_DATA: u16 = 3;
const OPCODE_ACK: u16 = 4;
const OPCODE_ERROR: u16 = 5;

const DATA_SIZE: usize = 512;
const MAX_PACKET: usize = 1024;
const TRANSFER_MODE: &str = "octet";
const PACKET_TIMEOUT: Duration = Duration::from_secs(2);

fn request_packet(opcode: u16, filename: &str) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(2 + filename.len() + 1 + TRANSFER_MODE.len() + 1);
    pkt.extend_from_slice(&opcode.to_be_bytes());
    pkt.extend_from_slice(filename.as_bytes());
    pkt.push(0);
    pkt.extend_from_slice(TRANSFER_MODE.as_bytes());
    pkt.push(0);
    pkt
}

fn data_packet(block: u16, data: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(4 + data.len());
    pkt.extend_from_slice(&OPCODE_DATA.to_be_bytes());
    pkt.extend_from_slice(&block.to_be_bytes());
    pkt.extend_from_slice(data);
    pkt
}

fn ack_packet(block: u16) -> [u8; 4] {
    let mut pkt = [0u8; 4];
    BigEndian::write_u16(&mut pkt[0..2], OPCODE_ACK);
    BigEndian::write_u16(&mut pkt[2..4], block);
    pkt
}

fn opcode(pkt: &[u8]) -> u16 {
    if pkt.len() >= 2 {
        BigEndian::read_u16(&pkt[0..2])
    } else {
        0
    }
}

fn block_number(pkt: &[u8]) -> u16 {
    if pkt.len() >= 4 {
        BigEndian::read_u16(&pkt[2..4])
    } else {
        0
    }
}

fn error_message(pkt: &[u8]) -> String {
    let code = block_number(pkt);
    let text = pkt
        .get(4..)
        .map(|rest| {
            let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            String::from_utf8_lossy(&rest[..end]).into_owned()
        })
        .unwrap_or_default();
    format!("tftp error {code}: {text}")
}

/// One TFTP session against a device's file server.
pub struct TftpClient {
    socket: UdpSocket,
    server: SocketAddr,
}

impl TftpClient {
    /// Binds a fresh local socket for one transfer session.
    pub fn new(server_ip: IpAddr, port: u16) -> io::Result<TftpClient> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_read_timeout(Some(PACKET_TIMEOUT))?;
        Ok(TftpClient {
            socket,
            server: SocketAddr::new(server_ip, port),
        })
    }

    fn send_packet(&self, pkt: &[u8]) -> io::Result<()> {
        self.socket.send_to(pkt, self.server)?;
        Ok(())
    }

    /// Waits for the next packet from the server, adopting its transfer
    /// identifier on first contact.
    fn wait_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (n, from) = self.socket.recv_from(buf)?;
        // replies come from an ephemeral TID rather than port 69
        self.server = from;
        if opcode(&buf[..n]) == OPCODE_ERROR {
            return Err(io::Error::other(error_message(&buf[..n])));
        }
        Ok(n)
    }

    fn wait_ack(&mut self, block: u16) -> io::Result<()> {
        let mut buf = [0u8; MAX_PACKET];
        let n = self.wait_packet(&mut buf)?;
        if opcode(&buf[..n]) != OPCODE_ACK {
            return Err(io::Error::other("expected ACK"));
        }
        let acked = block_number(&buf[..n]);
        if acked != block {
            warn!("tftp: ACK for block {acked}, expected {block}");
        }
        Ok(())
    }

    /// Writes `data` to the server under `filename`.
    ///
    /// Returns the number of payload bytes shipped. A trailing empty data
    /// packet terminates transfers whose length is an exact multiple of the
    /// block size.
    pub fn send_file(&mut self, filename: &str, data: &[u8]) -> io::Result<usize> {
        debug!("tftp: sending \"{filename}\" ({} bytes)", data.len());
        self.send_packet(&request_packet(OPCODE_WRQ, filename))?;
        self.wait_ack(0)?;

        let mut block: u16 = 0;
        let mut sent = 0usize;
        let mut final_block_sent = false;

        while !final_block_sent {
            block = block.wrapping_add(1);
            let end = (sent + DATA_SIZE).min(data.len());
            let chunk = &data[sent..end];
            final_block_sent = chunk.len() < DATA_SIZE;
            self.send_packet(&data_packet(block, chunk))?;
            sent = end;

            match self.wait_ack(block) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                    // one re-send of the unacknowledged block, then give up
                    trace!("tftp: timeout on block {block}, retrying once");
                    self.send_packet(&data_packet(block, &data[end - chunk.len()..end]))?;
                    self.wait_ack(block).map_err(|_| {
                        io::Error::new(io::ErrorKind::TimedOut, "tftp server timed out")
                    })?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    /// Reads `filename` from the server into `out`.
    pub fn get_file(&mut self, filename: &str, out: &mut Vec<u8>) -> io::Result<usize> {
        debug!("tftp: requesting \"{filename}\"");
        out.clear();
        self.send_packet(&request_packet(OPCODE_RRQ, filename))?;

        let mut expected: u16 = 1;
        let mut timeouts = 0;
        let mut buf = [0u8; MAX_PACKET];

        loop {
            let n = match self.wait_packet(&mut buf) {
                Ok(n) => n,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    timeouts += 1;
                    if timeouts < 2 && expected > 1 {
                        // first timeout: repeat the previous ACK
                        self.send_packet(&ack_packet(expected.wrapping_sub(1)))?;
                        continue;
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "tftp server timed out",
                    ));
                }
                Err(e) => return Err(e),
            };

            if opcode(&buf[..n]) != OPCODE_DATA {
                return Err(io::Error::other("expected DATA"));
            }
            if block_number(&buf[..n]) != expected {
                // duplicate of an already consumed block, re-ack it
                self.send_packet(&ack_packet(block_number(&buf[..n])))?;
                continue;
            }
            timeouts = 0;

            let payload = &buf[4..n];
            out.extend_from_slice(payload);
            self.send_packet(&ack_packet(expected))?;
            expected = expected.wrapping_add(1);

            if payload.len() < DATA_SIZE {
                break;
            }
        }
        Ok(out.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::thread;

    /// A loopback TFTP responder serving a single read or write session.
    fn spawn_server(file: Vec<u8>) -> (SocketAddr, thread::JoinHandle<Vec<u8>>) {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; MAX_PACKET];
            let (n, peer) = socket.recv_from(&mut buf).unwrap();
            match opcode(&buf[..n]) {
                OPCODE_RRQ => {
                    let mut block: u16 = 1;
                    let mut offset = 0usize;
                    loop {
                        let end = (offset + DATA_SIZE).min(file.len());
                        let pkt = data_packet(block, &file[offset..end]);
                        socket.send_to(&pkt, peer).unwrap();
                        let (an, _) = socket.recv_from(&mut buf).unwrap();
                        assert_eq!(opcode(&buf[..an]), OPCODE_ACK);
                        let short = end - offset < DATA_SIZE;
                        offset = end;
                        block = block.wrapping_add(1);
                        if short {
                            break;
                        }
                    }
                    Vec::new()
                }
                OPCODE_WRQ => {
                    let mut received = Vec::new();
                    socket.send_to(&ack_packet(0), peer).unwrap();
                    loop {
                        let (dn, _) = socket.recv_from(&mut buf).unwrap();
                        assert_eq!(opcode(&buf[..dn]), OPCODE_DATA);
                        let block = block_number(&buf[..dn]);
                        received.extend_from_slice(&buf[4..dn]);
                        socket.send_to(&ack_packet(block), peer).unwrap();
                        if dn - 4 < DATA_SIZE {
                            break;
                        }
                    }
                    received
                }
                other => panic!("unexpected opcode {other}"),
            }
        });
        (addr, handle)
    }

    #[test]
    fn write_round_trip() {
        let (addr, server) = spawn_server(Vec::new());
        let payload: Vec<u8> = (0..2000u32).map(|v| (v % 251) as u8).collect();
        let mut client = TftpClient::new(addr.ip(), addr.port()).unwrap();
        let sent = client
            .send_file("00112233445566778899aabbccddeeff", &payload)
            .unwrap();
        assert_eq!(sent, payload.len());
        assert_eq!(server.join().unwrap(), payload);
    }

    #[test]
    fn write_block_aligned_payload_terminates() {
        let (addr, server) = spawn_server(Vec::new());
        let payload = vec![0x5au8; DATA_SIZE * 2];
        let mut client = TftpClient::new(addr.ip(), addr.port()).unwrap();
        let sent = client.send_file("aligned", &payload).unwrap();
        assert_eq!(sent, payload.len());
        assert_eq!(server.join().unwrap(), payload);
    }

    #[test]
    fn read_round_trip() {
        let file: Vec<u8> = (0..1500u32).map(|v| (v % 239) as u8).collect();
        let (addr, server) = spawn_server(file.clone());
        let mut client = TftpClient::new(addr.ip(), addr.port()).unwrap();
        let mut out = Vec::new();
        let n = client.get_file("anything", &mut out).unwrap();
        assert_eq!(n, file.len());
        assert_eq!(out, file);
        server.join().unwrap();
    }

    #[test]
    fn empty_file_read() {
        let (addr, server) = spawn_server(Vec::new());
        let mut client = TftpClient::new(addr.ip(), addr.port()).unwrap();
        let mut out = Vec::new();
        let n = client.get_file("empty", &mut out).unwrap();
        assert_eq!(n, 0);
        server.join().unwrap();
    }

    #[test]
    fn server_error_packet_aborts() {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let addr = socket.local_addr().unwrap();
        let server = thread::spawn(move || {
            let mut buf = [0u8; MAX_PACKET];
            let (_, peer) = socket.recv_from(&mut buf).unwrap();
            let mut err = Vec::new();
            err.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
            err.extend_from_slice(&1u16.to_be_bytes());
            err.extend_from_slice(b"File not found\0");
            socket.send_to(&err, peer).unwrap();
        });
        let mut client =
            TftpClient::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port()).unwrap();
        let mut out = Vec::new();
        assert!(client.get_file("missing", &mut out).is_err());
        server.join().unwrap();
    }
}
