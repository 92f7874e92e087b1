// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast service discovery.
//!
//! A requester ([`McSocket`]) multicasts a small request datagram naming a
//! service and a TCP reply port, then waits for the responder to connect
//! back. The responder side ([`McSocketListener`]) joins the group, filters
//! datagrams by request type, and dials the requester. The established TCP
//! channel carries the follow-up payload (e.g. the XML configuration a DSM
//! downloads at startup).
//!
//! Request datagram, little endian:
//!
//! ```text
//! +-------------+--------------+-----------+
//! | magic (4)   | request (4)  | port (2)  |
//! +-------------+--------------+-----------+
//! ```

use super::{ConnectionRequester, IOChannel, SocketChannel};
use crate::config::{MULTICAST_GROUP, MULTICAST_PORT};
use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

const REQUEST_MAGIC: u32 = 0x4d43_5251; // "MCRQ"
const REQUEST_LEN: usize = 10;

/// Service being requested over multicast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// Download of the XML configuration.
    XmlConfig,
    /// Raw sample stream.
    RawSampleStream,
    /// Processed sample stream.
    ProcessedSampleStream,
    /// Per-second sync records.
    SyncRecordStream,
}

impl RequestType {
    fn code(self) -> u32 {
        match self {
            RequestType::XmlConfig => 0,
            RequestType::RawSampleStream => 1,
            RequestType::ProcessedSampleStream => 2,
            RequestType::SyncRecordStream => 3,
        }
    }

    fn from_code(code: u32) -> Option<RequestType> {
        match code {
            0 => Some(RequestType::XmlConfig),
            1 => Some(RequestType::RawSampleStream),
            2 => Some(RequestType::ProcessedSampleStream),
            3 => Some(RequestType::SyncRecordStream),
            _ => None,
        }
    }
}

fn encode_request(rt: RequestType, port: u16) -> [u8; REQUEST_LEN] {
    let mut buf = [0u8; REQUEST_LEN];
    LittleEndian::write_u32(&mut buf[0..4], REQUEST_MAGIC);
    LittleEndian::write_u32(&mut buf[4..8], rt.code());
    LittleEndian::write_u16(&mut buf[8..10], port);
    buf
}

fn decode_request(buf: &[u8]) -> Option<(RequestType, u16)> {
    if buf.len() < REQUEST_LEN || LittleEndian::read_u32(&buf[0..4]) != REQUEST_MAGIC {
        return None;
    }
    let rt = RequestType::from_code(LittleEndian::read_u32(&buf[4..8]))?;
    Some((rt, LittleEndian::read_u16(&buf[8..10])))
}

fn multicast_group() -> Ipv4Addr {
    MULTICAST_GROUP.parse().unwrap_or(Ipv4Addr::new(239, 0, 0, 10))
}

/// Datagram sender to the well-known group.
pub struct MulticastSender {
    name: String,
    socket: UdpSocket,
    dest: SocketAddrV4,
}

impl MulticastSender {
    pub fn new() -> Result<MulticastSender> {
        Self::to_group(multicast_group(), MULTICAST_PORT)
    }

    pub fn to_group(group: Ipv4Addr, port: u16) -> Result<MulticastSender> {
        let name = format!("mcast:{group}:{port}");
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::io(&name, e))?;
        sock.set_multicast_loop_v4(true).map_err(|e| Error::io(&name, e))?;
        sock.set_multicast_ttl_v4(1).map_err(|e| Error::io(&name, e))?;
        let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
        sock.bind(&bind.into()).map_err(|e| Error::io(&name, e))?;
        Ok(MulticastSender {
            name,
            socket: sock.into(),
            dest: SocketAddrV4::new(group, port),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        self.socket
            .send_to(buf, self.dest)
            .map_err(|e| Error::io(&self.name, e))
    }
}

/// Requester side: multicasts until the responder connects back.
pub struct McSocket {
    name: String,
    group: Ipv4Addr,
    port: u16,
    request_type: RequestType,
    /// Resend interval while waiting.
    retry: Duration,
    /// Give up after this many datagrams.
    max_attempts: u32,
}

impl McSocket {
    pub fn new(request_type: RequestType) -> McSocket {
        McSocket {
            name: format!("mcsock:{MULTICAST_GROUP}:{MULTICAST_PORT}"),
            group: multicast_group(),
            port: MULTICAST_PORT,
            request_type,
            retry: Duration::from_secs(1),
            max_attempts: 60,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::InvalidState(format!(
            "{}: not connected; use request_connection",
            self.name
        )))
    }

    pub fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(Error::InvalidState(format!(
            "{}: not connected; use request_connection",
            self.name
        )))
    }

    /// Multicast the request and deliver the connect-back channel through
    /// `requester` from a background thread.
    pub fn request(self, requester: Arc<dyn ConnectionRequester>) -> Result<()> {
        let name = self.name.clone();
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .map_err(|e| Error::io(&name, e))?;
        let reply_port = listener
            .local_addr()
            .map_err(|e| Error::io(&name, e))?
            .port();
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::io(&name, e))?;

        let sender = MulticastSender::to_group(self.group, self.port)?;
        let datagram = encode_request(self.request_type, reply_port);

        std::thread::Builder::new()
            .name(format!("mcsock {name}"))
            .spawn(move || {
                for attempt in 0..self.max_attempts {
                    if let Err(e) = sender.send(&datagram) {
                        log::warn!("[McSocket] {name}: send failed: {e}");
                    }
                    let deadline = std::time::Instant::now() + self.retry;
                    while std::time::Instant::now() < deadline {
                        match listener.accept() {
                            Ok((stream, peer)) => {
                                log::info!(
                                    "[McSocket] {name}: responder connected from {peer} after {} requests",
                                    attempt + 1
                                );
                                let _ = stream.set_nonblocking(false);
                                requester.connected(IOChannel::Socket(
                                    SocketChannel::from_stream(stream, peer),
                                ));
                                return;
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                                std::thread::sleep(Duration::from_millis(20));
                            }
                            Err(e) => {
                                log::warn!("[McSocket] {name}: accept failed: {e}");
                                return;
                            }
                        }
                    }
                }
                log::warn!("[McSocket] {name}: no responder, giving up");
            })
            .map_err(|e| Error::io("mcsock thread", e))?;
        Ok(())
    }
}

/// Responder side: joins the group and dials requesters back.
pub struct McSocketListener {
    name: String,
    socket: UdpSocket,
    serves: RequestType,
}

impl McSocketListener {
    pub fn bind(serves: RequestType) -> Result<McSocketListener> {
        Self::bind_group(multicast_group(), MULTICAST_PORT, serves)
    }

    pub fn bind_group(group: Ipv4Addr, port: u16, serves: RequestType) -> Result<McSocketListener> {
        let name = format!("mclisten:{group}:{port}");
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::io(&name, e))?;
        sock.set_reuse_address(true).map_err(|e| Error::io(&name, e))?;
        let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
        sock.bind(&bind.into()).map_err(|e| Error::io(&name, e))?;
        sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| Error::io(&name, e))?;
        Ok(McSocketListener {
            name,
            socket: sock.into(),
            serves,
        })
    }

    /// Serve requests forever: for each matching datagram, connect back to
    /// the requester and hand the channel to `requester`.
    pub fn listen_loop(self, requester: Arc<dyn ConnectionRequester>) -> Result<()> {
        let name = self.name.clone();
        std::thread::Builder::new()
            .name(format!("mclisten {name}"))
            .spawn(move || {
                let mut buf = [0u8; 64];
                loop {
                    let (n, src) = match self.socket.recv_from(&mut buf) {
                        Ok(r) => r,
                        Err(e) => {
                            log::warn!("[McSocketListener] {name}: recv failed: {e}");
                            return;
                        }
                    };
                    let Some((rt, reply_port)) = decode_request(&buf[..n]) else {
                        continue;
                    };
                    if rt != self.serves {
                        continue;
                    }
                    let reply = SocketAddr::new(src.ip(), reply_port);
                    match std::net::TcpStream::connect_timeout(&reply, Duration::from_secs(5)) {
                        Ok(stream) => {
                            log::info!("[McSocketListener] {name}: serving {reply}");
                            requester.connected(IOChannel::Socket(SocketChannel::from_stream(
                                stream, reply,
                            )));
                        }
                        Err(e) => {
                            log::warn!("[McSocketListener] {name}: connect-back to {reply} failed: {e}");
                        }
                    }
                }
            })
            .map_err(|e| Error::io("mclisten thread", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_datagram_roundtrip() {
        let buf = encode_request(RequestType::XmlConfig, 40123);
        assert_eq!(decode_request(&buf), Some((RequestType::XmlConfig, 40123)));

        let buf = encode_request(RequestType::SyncRecordStream, 1);
        assert_eq!(
            decode_request(&buf),
            Some((RequestType::SyncRecordStream, 1))
        );
    }

    #[test]
    fn test_request_datagram_rejects_garbage() {
        assert_eq!(decode_request(b"short"), None);
        let mut buf = encode_request(RequestType::XmlConfig, 1);
        buf[0] ^= 0xFF; // break the magic
        assert_eq!(decode_request(&buf), None);
        let mut buf = encode_request(RequestType::XmlConfig, 1);
        buf[4] = 0x7F; // unknown request code
        assert_eq!(decode_request(&buf), None);
    }
}
